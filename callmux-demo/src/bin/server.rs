use callmux::{ChannelConfig, Router, Server};
use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Listen address.
    #[arg(default_value = "0.0.0.0:50051")]
    pub addr: std::net::SocketAddr,

    /// Encode payloads with JSON instead of MessagePack.
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();

    let mut router = Router::default();
    callmux_demo::register(&mut router).unwrap();
    let config = ChannelConfig {
        use_msgpack: !args.json,
        ..Default::default()
    };
    let server = Server::create(router, &config).unwrap();

    let addr = server.listen(args.addr).await.unwrap();
    tracing::info!(
        "Serving {:?} on {addr}...",
        server
            .dispatcher()
            .router()
            .method_names()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
    );

    tokio::select! {
        () = server.join() => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
            server.stop();
            server.join().await;
        }
    }
}
