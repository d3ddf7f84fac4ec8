#![forbid(unsafe_code)]

use std::{net::SocketAddr, str::FromStr};

use callmux::{
    BoxFuture, ChannelConfig, Client, ClientConfig, Context, ErrorKind, Method, MethodId,
    Pattern, RequestStream, Router, Server, ServerCall, Status,
};

const SAY_HELLO: MethodId = MethodId::from_static("Foo", "SayHello");
const SUM: MethodId = MethodId::from_static("Bar", "Sum");

#[tokio::test]
async fn test_tcp_server() {
    let _ = tracing_subscriber::fmt().try_init();

    let mut router = Router::default();
    router
        .unary(SAY_HELLO, |_: Context, name: String| async move {
            Ok(format!("Hello, {name}!"))
        })
        .unwrap();
    router
        .client_stream(SUM, |_: Context, mut reqs: RequestStream<u64>| async move {
            let mut sum = 0;
            while let Some(n) = reqs.message().await? {
                sum += n;
            }
            Ok(sum)
        })
        .unwrap();

    let config = ChannelConfig::default();
    let server = Server::create(router, &config).unwrap();
    let addr = SocketAddr::from_str("127.0.0.1:0").unwrap();
    let addr = server.listen(addr).await.unwrap();

    let client = Client::connect(addr, &config, ClientConfig::default())
        .await
        .unwrap();
    let rsp: String = client.unary(&SAY_HELLO, "callmux").await.unwrap();
    assert_eq!(rsp, "Hello, callmux!");

    let mut stream = client.client_stream::<u64, u64>(&SUM).await.unwrap();
    for n in 1..=10 {
        stream.send(&n).await.unwrap();
    }
    assert_eq!(stream.close_and_recv().await.unwrap(), 55);

    // a second connection is served independently
    let other = Client::connect(addr, &config, ClientConfig::default())
        .await
        .unwrap();
    let rsp: String = other.unary(&SAY_HELLO, "again").await.unwrap();
    assert_eq!(rsp, "Hello, again!");

    server.stop();
    server.join().await;

    let err = client
        .unary::<_, String>(&SAY_HELLO, "callmux")
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::TransportError);
}

const TWO: MethodId = MethodId::from_static("Raw", "Two");
const NONE: MethodId = MethodId::from_static("Raw", "None");

#[tokio::test]
async fn test_unary_response_count() {
    let _ = tracing_subscriber::fmt().try_init();

    let mut router = Router::default();
    let two: Method = Box::new(|_: Context, call: ServerCall| -> BoxFuture<Status> {
        Box::pin(async move {
            call.send("one").await?;
            call.send("two").await
        })
    });
    router.register(TWO, Pattern::Unary, two).unwrap();
    let none: Method =
        Box::new(|_: Context, _: ServerCall| -> BoxFuture<Status> { Box::pin(async { Ok(()) }) });
    router.register(NONE, Pattern::Unary, none).unwrap();

    let config = ChannelConfig::default();
    let server = Server::create(router, &config).unwrap();
    let addr = SocketAddr::from_str("127.0.0.1:0").unwrap();
    let addr = server.listen(addr).await.unwrap();
    let client = Client::connect(addr, &config, ClientConfig::default())
        .await
        .unwrap();

    let err = client.unary::<_, String>(&TWO, "x").await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidArgument);
    assert_eq!(client.channel().open_calls(), 0);

    let err = client.unary::<_, String>(&NONE, "x").await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidArgument);
    assert_eq!(client.channel().open_calls(), 0);

    // the connection survives both violations
    let err = client.unary::<_, String>(&NONE, "x").await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidArgument);
}

#[tokio::test]
async fn test_connect_failed() {
    let config = ChannelConfig::default();
    let server = Server::create(Router::default(), &config);
    assert_eq!(server.err().unwrap().kind, ErrorKind::Configuration);

    // nothing listens on a port that was just released
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = Client::connect(addr, &config, ClientConfig::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::TcpConnectFailed);
}
