use callmux::{ChannelConfig, Client, ClientConfig};
use callmux_demo::{
    BarClient, FooClient, HelloRequest, InfoRequest, MessageRequest, NumberRequest,
};
use clap::Parser;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Server address.
    #[arg(default_value = "127.0.0.1:50051")]
    pub addr: std::net::SocketAddr,

    /// Encode payloads with JSON instead of MessagePack.
    #[arg(long, default_value_t = false)]
    pub json: bool,

    /// Deadline of unary calls in milliseconds.
    #[arg(long, default_value_t = 1000)]
    pub unary_timeout_ms: u64,

    /// Deadline of streaming calls in milliseconds.
    #[arg(long, default_value_t = 5000)]
    pub stream_timeout_ms: u64,

    /// Name sent to Foo.SayHello.
    #[arg(long, default_value = "Alice")]
    pub name: String,

    /// Number of values requested from Foo.StreamNumbers.
    #[arg(long, default_value_t = 5)]
    pub count: i32,
}

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> callmux::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();

    let config = ChannelConfig {
        use_msgpack: !args.json,
        ..Default::default()
    };
    let client = Client::connect(args.addr, &config, ClientConfig::default()).await?;
    tracing::info!("connected to {}", args.addr);

    let unary = client.with_timeout(Duration::from_millis(args.unary_timeout_ms));
    let stream = client.with_timeout(Duration::from_millis(args.stream_timeout_ms));

    tracing::info!("1. Foo.SayHello (unary)");
    let rsp = FooClient::new(unary.clone())
        .say_hello(&HelloRequest { name: args.name })
        .await?;
    tracing::info!("response: {}", rsp.message);

    tracing::info!("2. Foo.StreamNumbers (server streaming)");
    let mut numbers = FooClient::new(stream.clone())
        .stream_numbers(&NumberRequest { count: args.count })
        .await?;
    while let Some(rsp) = numbers.message().await? {
        tracing::info!("  received: {}", rsp.number);
    }

    tracing::info!("3. Bar.GetInfo (unary)");
    let rsp = BarClient::new(unary)
        .get_info(&InfoRequest {
            query: "gRPC".to_string(),
        })
        .await?;
    tracing::info!("response: {}", rsp.info);

    tracing::info!("4. Bar.CollectMessages (client streaming)");
    let mut messages = BarClient::new(stream).collect_messages().await?;
    for content in ["Hello", "from", "the", "client", "streaming", "RPC"] {
        tracing::info!("  sending: {content}");
        messages
            .send(&MessageRequest {
                content: content.to_string(),
            })
            .await?;
    }
    let rsp = messages.close_and_recv().await?;
    tracing::info!("server response: {} (count: {})", rsp.result, rsp.count);

    tracing::info!("all calls completed");
    Ok(())
}
