use std::sync::Arc;

use callmux::{
    Client, ClientStreaming, Context, MethodId, RequestStream, ResponseSink, Result, Router,
    Status, Streaming,
};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HelloRequest {
    pub name: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HelloResponse {
    pub message: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct NumberRequest {
    pub count: i32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct NumberResponse {
    pub number: i32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct InfoRequest {
    pub query: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct InfoResponse {
    pub info: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MessageRequest {
    pub content: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MessageResponse {
    pub result: String,
    pub count: i32,
}

/// Greeting and counting service.
#[derive(Debug, Default)]
pub struct Foo;

impl Foo {
    pub const NAME: &'static str = "Foo";
    pub const SAY_HELLO: MethodId = MethodId::from_static(Self::NAME, "SayHello");
    pub const STREAM_NUMBERS: MethodId = MethodId::from_static(Self::NAME, "StreamNumbers");

    /// # Errors
    pub async fn say_hello(&self, _ctx: &Context, req: HelloRequest) -> Result<HelloResponse> {
        tracing::info!("Foo.SayHello called with name: {}", req.name);
        Ok(HelloResponse {
            message: format!("Hello, {}!", req.name),
        })
    }

    /// Streams `1..=count`.
    pub async fn stream_numbers(
        &self,
        _ctx: &Context,
        req: NumberRequest,
        sink: ResponseSink<NumberResponse>,
    ) -> Status {
        tracing::info!("Foo.StreamNumbers called with count: {}", req.count);
        for number in 1..=req.count {
            sink.send(&NumberResponse { number }).await?;
            tracing::info!("sent number: {number}");
        }
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `Configuration` if a method of the service is already registered.
    pub fn export(self: Arc<Self>, router: &mut Router) -> Result<()> {
        let this = self.clone();
        router.unary(Self::SAY_HELLO, move |ctx: Context, req: HelloRequest| {
            let this = this.clone();
            async move { this.say_hello(&ctx, req).await }
        })?;

        let this = self;
        router.server_stream(
            Self::STREAM_NUMBERS,
            move |ctx: Context, req: NumberRequest, sink: ResponseSink<NumberResponse>| {
                let this = this.clone();
                async move { this.stream_numbers(&ctx, req, sink).await }
            },
        )
    }
}

/// Lookup and collection service.
#[derive(Debug, Default)]
pub struct Bar;

impl Bar {
    pub const NAME: &'static str = "Bar";
    pub const GET_INFO: MethodId = MethodId::from_static(Self::NAME, "GetInfo");
    pub const COLLECT_MESSAGES: MethodId = MethodId::from_static(Self::NAME, "CollectMessages");

    /// # Errors
    pub async fn get_info(&self, _ctx: &Context, req: InfoRequest) -> Result<InfoResponse> {
        tracing::info!("Bar.GetInfo called with query: {}", req.query);
        Ok(InfoResponse {
            info: format!("Information about: {}", req.query),
        })
    }

    /// Counts the messages until the invoker half-closes.
    ///
    /// # Errors
    ///
    /// Returns the stream error if the call fails before the half-close.
    pub async fn collect_messages(
        &self,
        _ctx: &Context,
        mut reqs: RequestStream<MessageRequest>,
    ) -> Result<MessageResponse> {
        tracing::info!("Bar.CollectMessages called");
        let mut messages = vec![];
        while let Some(msg) = reqs.message().await? {
            tracing::info!("received message: {}", msg.content);
            messages.push(msg.content);
        }

        let count = i32::try_from(messages.len())?;
        let result = format!("Collected {count} messages");
        tracing::info!("finished collecting messages: {result}");
        Ok(MessageResponse { result, count })
    }

    /// # Errors
    ///
    /// Returns `Configuration` if a method of the service is already registered.
    pub fn export(self: Arc<Self>, router: &mut Router) -> Result<()> {
        let this = self.clone();
        router.unary(Self::GET_INFO, move |ctx: Context, req: InfoRequest| {
            let this = this.clone();
            async move { this.get_info(&ctx, req).await }
        })?;

        let this = self;
        router.client_stream(
            Self::COLLECT_MESSAGES,
            move |ctx: Context, reqs: RequestStream<MessageRequest>| {
                let this = this.clone();
                async move { this.collect_messages(&ctx, reqs).await }
            },
        )
    }
}

/// Registers both services.
///
/// # Errors
///
/// Returns `Configuration` if a method is already registered.
pub fn register(router: &mut Router) -> Result<()> {
    Arc::new(Foo).export(router)?;
    Arc::new(Bar).export(router)
}

#[derive(Clone, Debug)]
pub struct FooClient {
    client: Client,
}

impl FooClient {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// # Errors
    pub async fn say_hello(&self, req: &HelloRequest) -> Result<HelloResponse> {
        self.client.unary(&Foo::SAY_HELLO, req).await
    }

    /// # Errors
    pub async fn stream_numbers(&self, req: &NumberRequest) -> Result<Streaming<NumberResponse>> {
        self.client.server_stream(&Foo::STREAM_NUMBERS, req).await
    }
}

#[derive(Clone, Debug)]
pub struct BarClient {
    client: Client,
}

impl BarClient {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// # Errors
    pub async fn get_info(&self, req: &InfoRequest) -> Result<InfoResponse> {
        self.client.unary(&Bar::GET_INFO, req).await
    }

    /// # Errors
    pub async fn collect_messages(
        &self,
    ) -> Result<ClientStreaming<MessageRequest, MessageResponse>> {
        self.client.client_stream(&Bar::COLLECT_MESSAGES).await
    }
}
