use std::{net::SocketAddr, sync::Arc};

use crate::{ChannelConfig, Dispatcher, Error, ErrorKind, Listener, Result, Router};

/// TCP server: a [`Listener`] feeding accepted connections to a [`Dispatcher`].
///
/// ```rust,no_run
/// # use callmux::{ChannelConfig, Context, MethodId, Router, Server};
/// # use std::{net::SocketAddr, str::FromStr};
/// # #[tokio::main]
/// # async fn main() {
/// let mut router = Router::default();
/// router
///     .unary(MethodId::from_static("Echo", "Echo"), |_ctx: Context, req: String| async move {
///         Ok(req)
///     })
///     .unwrap();
///
/// let server = Server::create(router, &ChannelConfig::default()).unwrap();
/// let addr = SocketAddr::from_str("127.0.0.1:8000").unwrap();
/// server.listen(addr).await.unwrap();
/// server.join().await;
/// # }
/// ```
pub struct Server {
    dispatcher: Arc<Dispatcher>,
    listener: Listener,
    config: ChannelConfig,
}

impl Server {
    /// # Errors
    ///
    /// Returns `Configuration` if the router has no methods.
    pub fn create(router: Router, config: &ChannelConfig) -> Result<Self> {
        if router.method_names().next().is_none() {
            return Err(Error::new(ErrorKind::Configuration, "no method registered"));
        }
        Ok(Self {
            dispatcher: Dispatcher::new(router),
            listener: Listener::default(),
            config: config.clone(),
        })
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Stops accepting connections and closes the open ones.
    /// Call [`join`](Self::join) afterwards to wait for running handlers.
    pub fn stop(&self) {
        self.listener.stop();
        self.dispatcher.stop();
    }

    pub async fn join(&self) {
        self.listener.join().await;
        self.dispatcher.join().await;
    }

    /// Returns the bound address, which differs from `addr` when port 0 was requested.
    ///
    /// # Errors
    ///
    /// Returns `TcpBindFailed` if the address cannot be bound.
    pub async fn listen(&self, addr: SocketAddr) -> Result<SocketAddr> {
        self.listener
            .start_listen(addr, &self.dispatcher, &self.config)
            .await
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.dispatcher.stop();
    }
}
