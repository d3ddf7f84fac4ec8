#![forbid(unsafe_code)]

use std::{sync::Arc, time::Duration};

use callmux::{
    BidiStream, Channel, ChannelConfig, Client, ClientConfig, Context, Dispatcher, ErrorKind,
    MethodId, RequestStream, ResponseSink, Router,
};
use tokio::sync::mpsc;

const WAIT: MethodId = MethodId::from_static("Test", "Wait");
const TICK: MethodId = MethodId::from_static("Test", "Tick");
const LISTEN: MethodId = MethodId::from_static("Test", "Listen");
const DRAIN: MethodId = MethodId::from_static("Test", "Drain");
const LATE: MethodId = MethodId::from_static("Test", "Late");

/// Every handler reports what it observed on `events`.
fn router(events: mpsc::UnboundedSender<String>) -> Router {
    let mut router = Router::default();

    let tx = events.clone();
    router
        .unary(WAIT, move |ctx: Context, _: String| {
            let tx = tx.clone();
            async move {
                assert!(ctx.deadline().is_some());
                ctx.cancelled().await;
                tx.send(format!("cancelled: {}", ctx.is_cancelled())).unwrap();
                Ok("too late".to_string())
            }
        })
        .unwrap();

    let tx = events.clone();
    router
        .server_stream(TICK, move |_: Context, _: (), sink: ResponseSink<u64>| {
            let tx = tx.clone();
            async move {
                let mut i = 0;
                let err = loop {
                    if let Err(err) = sink.send(&i).await {
                        break err;
                    }
                    i += 1;
                    tokio::time::sleep(Duration::from_millis(10)).await;
                };
                tx.send(format!("{:?}", err.kind)).unwrap();
                Err(err)
            }
        })
        .unwrap();

    let tx = events.clone();
    router
        .bidi_stream(
            LISTEN,
            move |_: Context, mut stream: BidiStream<String, String>| {
                let tx = tx.clone();
                async move {
                    tx.send("started".into()).unwrap();
                    let err = stream.message().await.unwrap_err();
                    tx.send(format!("{:?}", err.kind)).unwrap();
                    Err(err)
                }
            },
        )
        .unwrap();

    let tx = events.clone();
    router
        .client_stream(DRAIN, move |_: Context, mut reqs: RequestStream<String>| {
            let tx = tx.clone();
            async move {
                tx.send("started".into()).unwrap();
                let err = loop {
                    match reqs.message().await {
                        Ok(Some(_)) => {}
                        Ok(None) => return Ok(0u32),
                        Err(err) => break err,
                    }
                };
                tx.send(format!("{:?}", err.kind)).unwrap();
                Err(err)
            }
        })
        .unwrap();

    let tx = events;
    router
        .server_stream(LATE, move |ctx: Context, _: (), sink: ResponseSink<u64>| {
            let tx = tx.clone();
            async move {
                tx.send("started".into()).unwrap();
                ctx.cancelled().await;
                let err = sink.send(&0).await.unwrap_err();
                tx.send(format!("{:?}", err.kind)).unwrap();
                Err(err)
            }
        })
        .unwrap();

    router
}

fn connect() -> (Client, Arc<Dispatcher>, mpsc::UnboundedReceiver<String>) {
    let _ = tracing_subscriber::fmt().try_init();

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (client_stream, server_stream) = tokio::io::duplex(1 << 16);
    let config = ChannelConfig::default();
    let dispatcher = Dispatcher::new(router(events_tx));
    dispatcher.serve(Channel::new(server_stream, &config));
    let client = Client::new(Channel::new(client_stream, &config), ClientConfig::default());
    (client, dispatcher, events_rx)
}

#[tokio::test]
async fn test_unary_deadline() {
    let (client, _dispatcher, mut events) = connect();

    let client = client.with_timeout(Duration::from_millis(100));
    let err = client
        .unary::<_, String>(&WAIT, "hello")
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::DeadlineExceeded);

    // the handler learns about the deadline too
    assert_eq!(events.recv().await.unwrap(), "cancelled: true");
}

#[tokio::test]
async fn test_stream_deadline() {
    let (client, _dispatcher, mut events) = connect();

    let client = client.with_timeout(Duration::from_millis(100));
    let mut stream = client.server_stream::<_, u64>(&TICK, &()).await.unwrap();
    let err = loop {
        match stream.message().await {
            Ok(Some(_)) => {}
            Ok(None) => panic!("stream should not end"),
            Err(err) => break err,
        }
    };
    assert_eq!(err.kind, ErrorKind::DeadlineExceeded);
    assert_eq!(
        stream.message().await.unwrap_err().kind,
        ErrorKind::DeadlineExceeded
    );

    assert_eq!(events.recv().await.unwrap(), "Cancelled");
}

#[tokio::test]
async fn test_cancel_pending_recv() {
    let (client, _dispatcher, mut events) = connect();

    let mut stream = client
        .bidi_stream::<String, String>(&LISTEN)
        .await
        .unwrap();
    assert_eq!(events.recv().await.unwrap(), "started");

    let canceller = stream.canceller();
    let pending = tokio::spawn(async move {
        let err = stream.message().await.unwrap_err();
        (stream, err)
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    canceller.cancel();

    let (mut stream, err) = pending.await.unwrap();
    assert_eq!(err.kind, ErrorKind::Cancelled);
    let err = stream.send(&"more".to_string()).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::CallClosed);

    assert_eq!(events.recv().await.unwrap(), "Cancelled");
    assert_eq!(client.channel().open_calls(), 0);
}

#[tokio::test]
async fn test_send_after_deadline() {
    let (client, _dispatcher, mut events) = connect();

    let client = client.with_timeout(Duration::from_millis(20));
    let mut stream = client
        .bidi_stream::<String, String>(&LISTEN)
        .await
        .unwrap();
    assert_eq!(events.recv().await.unwrap(), "started");
    tokio::time::sleep(Duration::from_millis(50)).await;

    // the call is completed, so every send fails the same way
    for _ in 0..2 {
        let err = stream.send(&"late".to_string()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::CallClosed);
    }
    let err = stream.message().await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::DeadlineExceeded);

    assert_eq!(events.recv().await.unwrap(), "Cancelled");
    assert_eq!(client.channel().open_calls(), 0);
}

#[tokio::test]
async fn test_drop_cancels_call() {
    let (client, _dispatcher, mut events) = connect();

    let mut stream = client.client_stream::<String, u32>(&DRAIN).await.unwrap();
    stream.send(&"one".to_string()).await.unwrap();
    assert_eq!(events.recv().await.unwrap(), "started");
    drop(stream);

    assert_eq!(events.recv().await.unwrap(), "Cancelled");
}

#[tokio::test]
async fn test_send_after_cancel() {
    let (client, _dispatcher, mut events) = connect();

    let mut stream = client.server_stream::<_, u64>(&LATE, &()).await.unwrap();
    assert_eq!(events.recv().await.unwrap(), "started");
    stream.cancel();

    assert_eq!(stream.message().await.unwrap_err().kind, ErrorKind::Cancelled);
    assert_eq!(stream.message().await.unwrap_err().kind, ErrorKind::Cancelled);

    // the handler's send fails instead of being dropped silently
    assert_eq!(events.recv().await.unwrap(), "Cancelled");
}
