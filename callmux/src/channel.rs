use std::{
    io::IoSlice,
    net::SocketAddr,
    sync::{Arc, OnceLock},
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    net::TcpStream,
    sync::{Mutex, mpsc},
    time::Instant,
};
use tokio_util::sync::DropGuard;

use crate::{
    ClientCall, Message, MethodId, MsgFlags, MsgMeta, Pattern, ServerCall, Status, TaskSupervisor,
    call::{CallCore, Side},
    call_table::{CallEntry, CallTable, Inbound},
    codec::{encode_frame, parse_frame},
    error::{Error, ErrorKind, Result},
};

#[serde_inline_default]
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone)]
pub struct ChannelConfig {
    /// Outbound frames that may wait for the writer before `send` suspends.
    #[serde_inline_default(1024)]
    pub queue_capacity: usize,
    /// Encode payloads with MessagePack instead of JSON.
    #[serde_inline_default(true)]
    pub use_msgpack: bool,
    #[serde_inline_default(64 << 20)]
    pub max_message_size: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::Value::Object(serde_json::Map::default())).unwrap()
    }
}

pub(crate) struct ChannelInner {
    config: ChannelConfig,
    writer: mpsc::Sender<Bytes>,
    /// Calls opened by this side.
    pub(crate) invoked: CallTable,
    /// Calls opened by the remote side.
    pub(crate) accepted: CallTable,
    incoming: Mutex<mpsc::UnboundedReceiver<ServerCall>>,
    broken: OnceLock<Error>,
    task_supervisor: TaskSupervisor,
}

impl ChannelInner {
    pub(crate) fn payload_flags(&self) -> MsgFlags {
        if self.config.use_msgpack {
            MsgFlags::UseMessagePack
        } else {
            MsgFlags::empty()
        }
    }

    pub(crate) fn encode<P: Serialize + ?Sized>(&self, meta: &MsgMeta, payload: &P) -> Result<Bytes> {
        encode_frame(meta, payload, self.config.max_message_size)
    }

    fn closed_error(&self) -> Error {
        self.broken
            .get()
            .cloned()
            .unwrap_or_else(|| Error::new(ErrorKind::TransportError, "channel closed"))
    }

    /// Queues a frame for the writer task, waiting while the queue is full.
    pub(crate) async fn write(&self, frame: Bytes) -> Result<()> {
        if let Some(err) = self.broken.get() {
            return Err(err.clone());
        }
        self.writer
            .send(frame)
            .await
            .map_err(|_| self.closed_error())
    }

    pub(crate) fn try_write(&self, frame: Bytes) -> Result<()> {
        if let Some(err) = self.broken.get() {
            return Err(err.clone());
        }
        self.writer.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                Error::new(ErrorKind::TransportError, "send queue is full")
            }
            mpsc::error::TrySendError::Closed(_) => self.closed_error(),
        })
    }

    pub(crate) async fn send_status(&self, callid: u64, status: &Status) -> Result<()> {
        let meta = MsgMeta {
            callid,
            flags: MsgFlags::IsRsp | MsgFlags::Status | self.payload_flags(),
            ..Default::default()
        };
        let frame = self.encode(&meta, &status.as_ref().err())?;
        self.write(frame).await
    }

    /// Fails every open call on both tables with `err`. Idempotent.
    fn shutdown(&self, err: Error) {
        if self.broken.set(err.clone()).is_err() {
            return;
        }
        tracing::info!("channel shut down: {err}");
        self.task_supervisor.stop();

        for entry in self.invoked.drain() {
            let _ = entry.inbound.send(Inbound::Transport(err.clone()));
        }
        for entry in self.accepted.drain() {
            entry.core.abort(err.clone(), false);
        }
    }

    fn route(self: &Arc<Self>, msg: Message, accept_tx: &mpsc::UnboundedSender<ServerCall>) {
        let id = msg.meta.callid;
        let flags = msg.meta.flags;
        if flags.contains(MsgFlags::IsReq) {
            if flags.contains(MsgFlags::Open) {
                self.accept_call(&msg, accept_tx);
            } else if flags.contains(MsgFlags::Cancel) {
                if let Some(core) = self.accepted.core(id) {
                    let reason = msg
                        .deserialize::<Error>()
                        .unwrap_or_else(|_| ErrorKind::Cancelled.into());
                    tracing::debug!("call {id} cancelled by invoker: {reason}");
                    core.abort(
                        Error::new(ErrorKind::Cancelled, format!("cancelled by invoker: {reason}")),
                        false,
                    );
                }
            } else {
                let item = if flags.contains(MsgFlags::Data) {
                    Inbound::Message(msg)
                } else if flags.contains(MsgFlags::EndOfStream) {
                    Inbound::HalfClose
                } else {
                    tracing::warn!("unexpected request frame flags {flags:?} for call {id}");
                    return;
                };
                if !self.accepted.deliver(id, item) {
                    tracing::debug!("drop request frame for finished call {id}");
                }
            }
        } else if flags.contains(MsgFlags::IsRsp) {
            let item = if flags.contains(MsgFlags::Status) {
                match msg.deserialize::<Option<Error>>() {
                    Ok(None) => Inbound::Status(Ok(())),
                    Ok(Some(err)) => Inbound::Status(Err(err)),
                    Err(e) => Inbound::Status(Err(Error::new(
                        ErrorKind::Internal,
                        format!("invalid status: {e}"),
                    ))),
                }
            } else if flags.contains(MsgFlags::Data) {
                Inbound::Message(msg)
            } else {
                tracing::warn!("unexpected response frame flags {flags:?} for call {id}");
                return;
            };
            if !self.invoked.deliver(id, item) {
                tracing::debug!("drop response frame for finished call {id}");
            }
        } else {
            tracing::warn!("frame without direction for call {id}");
        }
    }

    fn accept_call(self: &Arc<Self>, msg: &Message, accept_tx: &mpsc::UnboundedSender<ServerCall>) {
        let id = msg.meta.callid;
        let method = match msg.meta.method.parse::<MethodId>() {
            Ok(method) => method,
            Err(err) => {
                tracing::error!("call {id}: {err}");
                let this = self.clone();
                tokio::spawn(async move {
                    let status = Err(Error::new(ErrorKind::NotFound, err.msg));
                    let _ = this.send_status(id, &status).await;
                });
                return;
            }
        };
        let deadline = msg
            .meta
            .timeout_ms
            .map(|ms| Instant::now() + Duration::from_millis(ms));
        let pattern = msg.meta.pattern.unwrap_or_default();

        let core = CallCore::new(id, Side::Dispatcher, method, pattern, deadline, self.clone());
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let entry = CallEntry {
            core: core.clone(),
            inbound: inbound_tx,
        };
        if !self.accepted.insert(id, entry) {
            tracing::warn!("duplicate open for call {id}");
            return;
        }
        let _ = accept_tx.send(ServerCall::new(core, inbound_rx));
    }

    async fn start_recv_loop<S: AsyncRead>(
        self: &Arc<Self>,
        mut recv_stream: ReadHalf<S>,
        accept_tx: mpsc::UnboundedSender<ServerCall>,
    ) -> Result<()> {
        let mut buffer = BytesMut::with_capacity(1 << 16);
        loop {
            if let Some(bytes) = parse_frame(&mut buffer, self.config.max_message_size)? {
                let msg = Message::parse(bytes)
                    .map_err(|e| Error::new(ErrorKind::TransportError, e.to_string()))?;
                self.route(msg, &accept_tx);
            } else {
                let n = recv_stream
                    .read_buf(&mut buffer)
                    .await
                    .map_err(|e| Error::new(ErrorKind::TransportError, e.to_string()))?;
                if n == 0 {
                    return Err(Error::new(
                        ErrorKind::TransportError,
                        "connection closed by peer",
                    ));
                }
            }
        }
    }

    async fn start_send_loop<S: AsyncWrite>(
        mut send_stream: WriteHalf<S>,
        mut receiver: mpsc::Receiver<Bytes>,
    ) -> Result<()> {
        const LIMIT: usize = 64;
        let mut msgs = Vec::with_capacity(LIMIT);
        loop {
            let mut bufs = [IoSlice::new(&[]); LIMIT];

            let n = receiver.recv_many(&mut msgs, LIMIT).await;
            if n == 0 {
                return Ok(());
            }

            for (msg, io_slice) in msgs.iter().zip(&mut bufs) {
                *io_slice = IoSlice::new(msg);
            }

            let mut slices = &mut bufs[..msgs.len()];
            while !slices.is_empty() {
                match send_stream.write_vectored(slices).await {
                    Ok(0) => {
                        return Err(Error::new(ErrorKind::TransportError, "write zero"));
                    }
                    Ok(n) => IoSlice::advance_slices(&mut slices, n),
                    Err(e) => {
                        return Err(Error::new(ErrorKind::TransportError, e.to_string()));
                    }
                }
            }
            send_stream
                .flush()
                .await
                .map_err(|e| Error::new(ErrorKind::TransportError, e.to_string()))?;
            msgs.clear();
        }
    }
}

/// One multiplexed connection carrying many independent calls in both directions.
///
/// Frames of one call in one direction arrive in order. Each call has its own
/// inbound queue, so a call nobody reads from never delays the others.
/// Cloning is cheap; the connection is shut down once every clone and every
/// call opened on it is dropped, or [`close`](Self::close) is called.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
    drop_guard: Arc<DropGuard>,
}

impl Channel {
    /// Starts the reader and writer tasks over `stream`. Must run inside a tokio runtime.
    pub fn new<S>(stream: S, config: &ChannelConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (recv_stream, send_stream) = tokio::io::split(stream);
        let (writer, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(ChannelInner {
            config: config.clone(),
            writer,
            invoked: CallTable::default(),
            accepted: CallTable::default(),
            incoming: Mutex::new(accept_rx),
            broken: OnceLock::new(),
            task_supervisor: TaskSupervisor::create(),
        });

        let send_inner = inner.clone();
        inner.task_supervisor.spawn(|guard| async move {
            tokio::select! {
                result = ChannelInner::start_send_loop(send_stream, receiver) => {
                    if let Err(e) = result {
                        tracing::error!("send loop failed: {e}");
                        send_inner.shutdown(e);
                    }
                }
                () = guard.stopped() => {}
            }
        });

        let recv_inner = inner.clone();
        inner.task_supervisor.spawn(|guard| async move {
            let err = tokio::select! {
                result = recv_inner.start_recv_loop(recv_stream, accept_tx) => match result {
                    Err(e) => {
                        tracing::error!("recv loop failed: {e}");
                        e
                    }
                    Ok(()) => Error::new(ErrorKind::TransportError, "recv loop finished"),
                },
                () = guard.stopped() => Error::new(ErrorKind::TransportError, "channel closed"),
            };
            recv_inner.shutdown(err);
        });

        let drop_guard = inner.task_supervisor.drop_guard();
        Self {
            inner,
            drop_guard: Arc::new(drop_guard),
        }
    }

    /// Dials `addr` over TCP.
    ///
    /// # Errors
    ///
    /// Returns `TcpConnectFailed` if the connection cannot be established.
    pub async fn connect(addr: SocketAddr, config: &ChannelConfig) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::new(ErrorKind::TcpConnectFailed, e.to_string()))?;
        stream
            .set_nodelay(true)
            .map_err(|e| Error::new(ErrorKind::TcpConnectFailed, e.to_string()))?;
        Ok(Self::new(stream, config))
    }

    /// Opens a new call. Only waits for room in the send queue, never for the remote.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if the channel is already closed.
    pub async fn open(
        &self,
        method: &MethodId,
        pattern: Pattern,
        timeout: Option<Duration>,
    ) -> Result<ClientCall> {
        let inner = &self.inner;
        let id = inner.invoked.alloc_id();
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let core = CallCore::new(
            id,
            Side::Invoker,
            method.clone(),
            pattern,
            deadline,
            inner.clone(),
        );
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        inner.invoked.insert(
            id,
            CallEntry {
                core: core.clone(),
                inbound: inbound_tx,
            },
        );
        let call = ClientCall::new(core.clone(), inbound_rx, self.drop_guard.clone());

        if let Some(err) = inner.broken.get() {
            core.finish(Err(err.clone()));
            return Err(err.clone());
        }

        let meta = MsgMeta {
            method: method.to_string(),
            pattern: Some(pattern),
            timeout_ms: timeout.map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX)),
            ..core.meta(MsgFlags::Open)
        };
        let frame = inner.encode(&meta, &())?;
        if let Err(err) = inner.write(frame).await {
            core.finish(Err(err.clone()));
            return Err(err);
        }
        tracing::debug!("open call {id} for {method} ({pattern})");
        Ok(call)
    }

    /// Waits for the next call opened by the remote side.
    /// Returns `None` once the channel is closed.
    pub async fn accept(&self) -> Option<ServerCall> {
        let mut incoming = self.inner.incoming.lock().await;
        loop {
            let call = incoming.recv().await?;
            if !call.state().is_completed() {
                return Some(call);
            }
        }
    }

    /// Closes the connection. Every open call fails with `TransportError`.
    pub fn close(&self) {
        self.inner
            .shutdown(Error::new(ErrorKind::TransportError, "channel closed"));
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.broken.get().is_some()
    }

    /// Number of calls, in both directions, that have not completed yet.
    #[must_use]
    pub fn open_calls(&self) -> usize {
        self.inner.invoked.len() + self.inner.accepted.len()
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("invoked", &self.inner.invoked)
            .field("accepted", &self.inner.accepted)
            .field("closed", &self.is_closed())
            .finish()
    }
}
