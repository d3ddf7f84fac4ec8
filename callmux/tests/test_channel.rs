#![forbid(unsafe_code)]

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use callmux::{
    BidiStream, CallState, Channel, ChannelConfig, Client, ClientConfig, Context, Dispatcher,
    ErrorKind, MethodId, Pattern, ResponseSink, Router,
};
use tokio::sync::mpsc;

const SAY_HELLO: MethodId = MethodId::from_static("Foo", "SayHello");
const COUNT_TO: MethodId = MethodId::from_static("Foo", "CountTo");
const QUIT: MethodId = MethodId::from_static("Foo", "Quit");
const HOLD: MethodId = MethodId::from_static("Foo", "Hold");

struct Fixture {
    client: Client,
    server: Channel,
    dispatcher: Arc<Dispatcher>,
    hello_calls: Arc<AtomicUsize>,
    events: mpsc::UnboundedReceiver<String>,
}

fn fixture() -> Fixture {
    let _ = tracing_subscriber::fmt().try_init();

    let hello_calls = Arc::new(AtomicUsize::new(0));
    let (events_tx, events) = mpsc::unbounded_channel();

    let mut router = Router::default();
    let counter = hello_calls.clone();
    router
        .unary(SAY_HELLO, move |_: Context, name: String| {
            counter.fetch_add(1, Ordering::AcqRel);
            async move {
                assert!(!name.is_empty(), "empty name");
                Ok(format!("Hello, {name}!"))
            }
        })
        .unwrap();
    router
        .server_stream(
            COUNT_TO,
            |_: Context, count: u32, sink: ResponseSink<u32>| async move {
                for i in 1..=count {
                    sink.send(&i).await?;
                }
                Ok(())
            },
        )
        .unwrap();
    router
        .bidi_stream(QUIT, |_: Context, _: BidiStream<String, String>| async move {
            Ok(())
        })
        .unwrap();
    router
        .bidi_stream(
            HOLD,
            move |_: Context, mut stream: BidiStream<String, String>| {
                let tx = events_tx.clone();
                async move {
                    while let Some(msg) = stream.message().await.inspect_err(|err| {
                        let _ = tx.send(format!("{:?}", err.kind));
                    })? {
                        stream.send(&msg).await?;
                    }
                    Ok(())
                }
            },
        )
        .unwrap();

    let (client_stream, server_stream) = tokio::io::duplex(1 << 16);
    let config = ChannelConfig::default();
    let server = Channel::new(server_stream, &config);
    let dispatcher = Dispatcher::new(router);
    dispatcher.serve(server.clone());
    let client = Client::new(Channel::new(client_stream, &config), ClientConfig::default());

    Fixture {
        client,
        server,
        dispatcher,
        hello_calls,
        events,
    }
}

#[tokio::test]
async fn test_method_not_found() {
    let f = fixture();

    let missing = MethodId::from_static("Foo", "Missing");
    let err = f.client.unary::<_, String>(&missing, "Alice").await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotFound);
    assert_eq!(f.hello_calls.load(Ordering::Acquire), 0);

    let rsp: String = f.client.unary(&SAY_HELLO, "Alice").await.unwrap();
    assert_eq!(rsp, "Hello, Alice!");
    assert_eq!(f.hello_calls.load(Ordering::Acquire), 1);
}

#[tokio::test]
async fn test_pattern_mismatch() {
    let f = fixture();

    let mut stream = f
        .client
        .server_stream::<_, String>(&SAY_HELLO, "Alice")
        .await
        .unwrap();
    let err = stream.message().await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidArgument);
    assert_eq!(f.hello_calls.load(Ordering::Acquire), 0);
}

#[tokio::test]
async fn test_unary_requires_single_request() {
    let f = fixture();

    let mut call = f.client.open(&SAY_HELLO, Pattern::Unary).await.unwrap();
    call.send("Alice", false).await.unwrap();
    let err = call.recv().await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidArgument);
    assert_eq!(call.state(), CallState::Completed(Err(err)));
}

#[tokio::test]
async fn test_wrong_request_type() {
    let f = fixture();

    let err = f.client.unary::<_, String>(&SAY_HELLO, &42u64).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidArgument);
}

#[tokio::test]
async fn test_handler_panic() {
    let f = fixture();

    let err = f.client.unary::<_, String>(&SAY_HELLO, "").await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Internal);

    // the channel keeps serving other calls
    let rsp: String = f.client.unary(&SAY_HELLO, "Bob").await.unwrap();
    assert_eq!(rsp, "Hello, Bob!");
}

#[tokio::test]
async fn test_send_after_completed() {
    let f = fixture();

    let mut stream = f
        .client
        .bidi_stream::<String, String>(&QUIT)
        .await
        .unwrap();
    assert_eq!(stream.message().await.unwrap(), None);
    assert_eq!(stream.state(), CallState::Completed(Ok(())));

    let err = stream.send(&"late".to_string()).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::CallClosed);
    assert_eq!(stream.message().await.unwrap(), None);
}

#[tokio::test]
async fn test_no_head_of_line_blocking() {
    let f = fixture();

    // nobody reads this stream
    let _idle = f
        .client
        .server_stream::<_, u32>(&COUNT_TO, &10_000u32)
        .await
        .unwrap();

    let rsp: String = tokio::time::timeout(
        Duration::from_secs(5),
        f.client.unary(&SAY_HELLO, "Alice"),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(rsp, "Hello, Alice!");
}

#[tokio::test]
async fn test_call_slots_released() {
    let f = fixture();

    for name in ["a", "b", "c"] {
        let _: String = f.client.unary(&SAY_HELLO, name).await.unwrap();
    }
    let mut stream = f
        .client
        .server_stream::<_, u32>(&COUNT_TO, &3u32)
        .await
        .unwrap();
    while stream.message().await.unwrap().is_some() {}

    assert_eq!(f.client.channel().open_calls(), 0);
    assert_eq!(f.server.open_calls(), 0);
}

#[tokio::test]
async fn test_transport_loss() {
    let mut f = fixture();

    let mut stream = f
        .client
        .bidi_stream::<String, String>(&HOLD)
        .await
        .unwrap();
    stream.send(&"ping".to_string()).await.unwrap();
    assert_eq!(stream.message().await.unwrap().unwrap(), "ping");

    f.server.close();

    // the handler blocked in `message` observes the loss
    assert_eq!(f.events.recv().await.unwrap(), "TransportError");

    let err = stream.message().await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::TransportError);
    let err = stream.send(&"pong".to_string()).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::TransportError);

    let err = f.client.unary::<_, String>(&SAY_HELLO, "Alice").await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::TransportError);
    assert!(f.client.channel().is_closed());
}

#[tokio::test]
async fn test_dispatcher_stop() {
    let mut f = fixture();

    let mut stream = f
        .client
        .bidi_stream::<String, String>(&HOLD)
        .await
        .unwrap();
    stream.send(&"ping".to_string()).await.unwrap();
    assert_eq!(stream.message().await.unwrap().unwrap(), "ping");

    f.dispatcher.stop();
    f.dispatcher.join().await;
    assert_eq!(f.events.recv().await.unwrap(), "TransportError");

    let err = stream.message().await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::TransportError);
}
