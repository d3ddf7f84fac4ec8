use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_inline_default::serde_inline_default;
use std::{net::SocketAddr, time::Duration};

use crate::{
    BidiStreaming, Channel, ChannelConfig, ClientCall, ClientStreaming, MethodId, Pattern,
    Streaming,
    error::Result,
    stream::recv_single,
};

#[serde_inline_default]
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone)]
pub struct ClientConfig {
    /// Deadline applied to every call; `None` waits forever.
    #[serde_inline_default(None)]
    #[serde(with = "humantime_serde")]
    pub timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::Value::Object(serde_json::Map::default())).unwrap()
    }
}

/// Typed invocation surface over a [`Channel`].
///
/// ```rust,no_run
/// # use callmux::{Client, ClientConfig, ChannelConfig, MethodId};
/// # use std::{net::SocketAddr, str::FromStr, time::Duration};
/// # #[tokio::main]
/// # async fn main() {
/// let addr = SocketAddr::from_str("127.0.0.1:50051").unwrap();
/// let client = Client::connect(addr, &ChannelConfig::default(), ClientConfig::default())
///     .await
///     .unwrap()
///     .with_timeout(Duration::from_secs(1));
///
/// const SAY_HELLO: MethodId = MethodId::from_static("Foo", "SayHello");
/// let rsp: String = client.unary(&SAY_HELLO, &"Alice").await.unwrap();
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct Client {
    channel: Channel,
    config: ClientConfig,
}

impl Client {
    #[must_use]
    pub fn new(channel: Channel, config: ClientConfig) -> Self {
        Self { channel, config }
    }

    /// # Errors
    ///
    /// Returns `TcpConnectFailed` if the connection cannot be established.
    pub async fn connect(
        addr: SocketAddr,
        channel_config: &ChannelConfig,
        config: ClientConfig,
    ) -> Result<Self> {
        let channel = Channel::connect(addr, channel_config).await?;
        Ok(Self::new(channel, config))
    }

    /// Returns a client sharing the same channel with a different deadline.
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            channel: self.channel.clone(),
            config: ClientConfig {
                timeout: Some(timeout),
            },
        }
    }

    #[must_use]
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.config.timeout
    }

    /// Opens an untyped call with this client's deadline.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if the channel is closed.
    pub async fn open(&self, method: &MethodId, pattern: Pattern) -> Result<ClientCall> {
        self.channel.open(method, pattern, self.config.timeout).await
    }

    /// Sends one request and waits for its one response.
    ///
    /// # Errors
    ///
    /// Returns the call's error status, `DeadlineExceeded` once the deadline
    /// passes, or `InvalidArgument` if the dispatcher violates the pattern.
    pub async fn unary<Req, Rsp>(&self, method: &MethodId, req: &Req) -> Result<Rsp>
    where
        Req: Serialize + ?Sized,
        Rsp: DeserializeOwned,
    {
        let mut call = self.open(method, Pattern::Unary).await?;
        call.send(req, true).await?;
        recv_single(&mut call).await
    }

    /// Sends one request and returns the stream of responses.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if the request could not be sent.
    pub async fn server_stream<Req, Rsp>(&self, method: &MethodId, req: &Req) -> Result<Streaming<Rsp>>
    where
        Req: Serialize + ?Sized,
        Rsp: DeserializeOwned,
    {
        let mut call = self.open(method, Pattern::ServerStream).await?;
        call.send(req, true).await?;
        Ok(Streaming::new(call))
    }

    /// # Errors
    ///
    /// Returns `TransportError` if the channel is closed.
    pub async fn client_stream<Req, Rsp>(&self, method: &MethodId) -> Result<ClientStreaming<Req, Rsp>>
    where
        Req: Serialize,
        Rsp: DeserializeOwned,
    {
        let call = self.open(method, Pattern::ClientStream).await?;
        Ok(ClientStreaming::new(call))
    }

    /// # Errors
    ///
    /// Returns `TransportError` if the channel is closed.
    pub async fn bidi_stream<Req, Rsp>(&self, method: &MethodId) -> Result<BidiStreaming<Req, Rsp>>
    where
        Req: Serialize,
        Rsp: DeserializeOwned,
    {
        let call = self.open(method, Pattern::BidiStream).await?;
        Ok(BidiStreaming::new(call))
    }
}
