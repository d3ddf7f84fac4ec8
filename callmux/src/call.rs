use std::{future::Future, sync::Arc};

use parking_lot::Mutex;
use serde::{Serialize, de::DeserializeOwned};
use tokio::{sync::mpsc, time::Instant};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::{
    Context, Message, MethodId, MsgFlags, MsgMeta, Pattern, Status,
    call_table::{CallTable, Inbound},
    channel::ChannelInner,
    error::{Error, ErrorKind, Result},
    stream::decode,
};

/// Lifecycle of one side of a call.
///
/// ```text
/// Open --local half-close--> HalfClosed --status--> Completed
/// Open --remote half-close--> Closing --status--> Completed
/// ```
///
/// Cancellation, deadline expiry and transport loss move any state straight
/// to `Completed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallState {
    Open,
    /// This side will send no more messages.
    HalfClosed,
    /// The remote side will send no more messages.
    Closing,
    Completed(Status),
}

impl CallState {
    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self, CallState::Completed(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    Invoker,
    Dispatcher,
}

pub(crate) async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// State of a call shared by its I/O handle and, on the dispatcher side,
/// the task that completes it once the handler returns.
pub(crate) struct CallCore {
    pub id: u64,
    pub side: Side,
    pub method: MethodId,
    pub pattern: Pattern,
    pub deadline: Option<Instant>,
    state: Mutex<CallState>,
    aborted: CancellationToken,
    channel: Arc<ChannelInner>,
}

impl CallCore {
    pub fn new(
        id: u64,
        side: Side,
        method: MethodId,
        pattern: Pattern,
        deadline: Option<Instant>,
        channel: Arc<ChannelInner>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            side,
            method,
            pattern,
            deadline,
            state: Mutex::new(CallState::Open),
            aborted: CancellationToken::new(),
            channel,
        })
    }

    pub fn state(&self) -> CallState {
        self.state.lock().clone()
    }

    pub fn aborted_token(&self) -> CancellationToken {
        self.aborted.clone()
    }

    fn table(&self) -> &CallTable {
        match self.side {
            Side::Invoker => &self.channel.invoked,
            Side::Dispatcher => &self.channel.accepted,
        }
    }

    pub fn meta(&self, flags: MsgFlags) -> MsgMeta {
        let direction = match self.side {
            Side::Invoker => MsgFlags::IsReq,
            Side::Dispatcher => MsgFlags::IsRsp,
        };
        MsgMeta {
            callid: self.id,
            flags: flags | direction | self.channel.payload_flags(),
            ..Default::default()
        }
    }

    /// Completes the call locally and releases its table slot.
    /// Returns false if it was already completed.
    pub fn finish(&self, status: Status) -> bool {
        {
            let mut state = self.state.lock();
            if state.is_completed() {
                return false;
            }
            *state = CallState::Completed(status);
        }
        self.table().remove(self.id);
        true
    }

    /// Forcibly completes the call with `err` and wakes every pending
    /// operation on it. An invoker also tells the dispatcher when `notify_remote` is set.
    pub fn abort(&self, err: Error, notify_remote: bool) -> bool {
        if !self.finish(Err(err.clone())) {
            return false;
        }
        self.aborted.cancel();

        if notify_remote && self.side == Side::Invoker {
            let meta = self.meta(MsgFlags::Cancel);
            let result = self
                .channel
                .encode(&meta, &err)
                .and_then(|frame| self.channel.try_write(frame));
            if let Err(e) = result {
                tracing::warn!("failed to send cancel for call {}: {e}", self.id);
            }
        }
        true
    }

    /// Completes a dispatcher-side call and sends its status to the invoker.
    pub async fn complete(&self, status: Status) -> Result<()> {
        if !self.finish(status.clone()) {
            return Ok(());
        }
        self.channel.send_status(self.id, &status).await
    }

    fn expire(&self) {
        let err = match self.side {
            Side::Invoker => Error::new(
                ErrorKind::DeadlineExceeded,
                format!("deadline exceeded for {}", self.method),
            ),
            Side::Dispatcher => Error::new(ErrorKind::Cancelled, "deadline exceeded"),
        };
        self.abort(err, true);
    }

    fn expire_if_due(&self) {
        if self.deadline.is_some_and(|deadline| deadline <= Instant::now()) {
            self.expire();
        }
    }

    fn terminal_error(&self) -> Error {
        match &*self.state.lock() {
            CallState::Completed(Err(err)) => err.clone(),
            _ => Error::new(ErrorKind::CallClosed, format!("call {} is closed", self.id)),
        }
    }

    /// Resolves once the call is aborted or its deadline passes.
    async fn interrupted(&self) -> Error {
        tokio::select! {
            () = self.aborted.cancelled() => {}
            () = deadline_elapsed(self.deadline) => self.expire(),
        }
        self.terminal_error()
    }

    fn check_send(&self) -> Result<()> {
        self.expire_if_due();
        let state = self.state();
        match state {
            CallState::Open | CallState::Closing => Ok(()),
            CallState::HalfClosed => {
                let err = Error::new(
                    ErrorKind::StreamClosed,
                    format!("send on half-closed call {}", self.id),
                );
                self.abort(err.clone(), true);
                Err(err)
            }
            // transport loss is reported on both sides, cancellation only to
            // the handler.
            CallState::Completed(Err(err))
                if err.kind == ErrorKind::TransportError
                    || (self.side == Side::Dispatcher && err.is_cancellation()) =>
            {
                Err(err)
            }
            CallState::Completed(_) => Err(Error::new(
                ErrorKind::CallClosed,
                format!("call {} is completed", self.id),
            )),
        }
    }

    /// Encodes `payload` right away; the returned future only waits for the writer.
    pub fn send_frame<P: Serialize + ?Sized>(
        &self,
        flags: MsgFlags,
        payload: &P,
    ) -> impl Future<Output = Result<()>> + Send + use<'_, P> {
        let frame = self
            .check_send()
            .and_then(|()| self.channel.encode(&self.meta(flags), payload));
        async move {
            let frame = frame?;
            let result = tokio::select! {
                biased;
                err = self.interrupted() => Err(err),
                result = self.channel.write(frame) => result,
            };
            if let Err(err) = &result
                && err.kind == ErrorKind::TransportError
            {
                self.finish(Err(err.clone()));
            }
            result
        }
    }

    fn close_local(&self) {
        let mut state = self.state.lock();
        if matches!(*state, CallState::Open | CallState::Closing) {
            *state = CallState::HalfClosed;
        }
    }

    fn close_remote(&self) {
        let mut state = self.state.lock();
        if *state == CallState::Open {
            *state = CallState::Closing;
        }
    }

    /// What `recv` reports without touching the queue once the remote is done.
    /// An invoker still waits for the status after the last response.
    fn remote_done(&self) -> Option<Result<Option<Message>>> {
        match &*self.state.lock() {
            CallState::Open | CallState::HalfClosed => None,
            CallState::Closing if self.side == Side::Invoker => None,
            CallState::Closing | CallState::Completed(Ok(())) => Some(Ok(None)),
            CallState::Completed(Err(err)) => Some(Err(err.clone())),
        }
    }
}

/// Receiving half shared by both call handles.
struct CallIo {
    core: Arc<CallCore>,
    inbound: mpsc::UnboundedReceiver<Inbound>,
}

impl CallIo {
    async fn recv(&mut self) -> Result<Option<Message>> {
        self.core.expire_if_due();
        if let Some(result) = self.core.remote_done() {
            return result;
        }

        let item = tokio::select! {
            biased;
            err = self.core.interrupted() => return Err(err),
            item = self.inbound.recv() => item,
        };
        match item {
            Some(Inbound::Message(msg)) => {
                if msg.meta.is_last() {
                    self.core.close_remote();
                }
                Ok(Some(msg))
            }
            Some(Inbound::HalfClose) => {
                self.core.close_remote();
                Ok(None)
            }
            Some(Inbound::Status(status)) => {
                self.core.finish(status);
                self.terminal()
            }
            Some(Inbound::Transport(err)) => {
                self.core.finish(Err(err));
                self.terminal()
            }
            None => {
                self.core.finish(Err(Error::new(
                    ErrorKind::TransportError,
                    "channel closed",
                )));
                self.terminal()
            }
        }
    }

    fn terminal(&self) -> Result<Option<Message>> {
        self.core
            .remote_done()
            .unwrap_or_else(|| Err(self.core.terminal_error()))
    }
}

/// Invoker-side handle of a call.
///
/// Dropping a handle before the call completes cancels the call. The handle
/// keeps its channel open even after every [`Channel`](crate::Channel) clone is gone.
pub struct ClientCall {
    io: CallIo,
    _channel_guard: Arc<DropGuard>,
}

impl ClientCall {
    pub(crate) fn new(
        core: Arc<CallCore>,
        inbound: mpsc::UnboundedReceiver<Inbound>,
        channel_guard: Arc<DropGuard>,
    ) -> Self {
        Self {
            io: CallIo { core, inbound },
            _channel_guard: channel_guard,
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.io.core.id
    }

    #[must_use]
    pub fn method(&self) -> &MethodId {
        &self.io.core.method
    }

    #[must_use]
    pub fn pattern(&self) -> Pattern {
        self.io.core.pattern
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.io.core.deadline
    }

    #[must_use]
    pub fn state(&self) -> CallState {
        self.io.core.state()
    }

    /// Sends one request. `is_last` half-closes the request direction.
    ///
    /// # Errors
    ///
    /// `StreamClosed` after a half-close, which also terminates the call.
    /// `CallClosed` once completed, the cancellation status if the call is
    /// cancelled or times out while the send waits, or `TransportError`.
    pub async fn send<P: Serialize + ?Sized>(&mut self, payload: &P, is_last: bool) -> Result<()> {
        let mut flags = MsgFlags::Data;
        if is_last {
            flags |= MsgFlags::EndOfStream;
        }
        self.io.core.send_frame(flags, payload).await?;
        if is_last {
            self.io.core.close_local();
        }
        Ok(())
    }

    /// Half-closes the request direction without a message. Idempotent.
    ///
    /// # Errors
    ///
    /// Same as [`send`](Self::send), except that an already half-closed call is fine.
    pub async fn close_send(&mut self) -> Result<()> {
        if self.state() == CallState::HalfClosed {
            return Ok(());
        }
        self.io.core.send_frame(MsgFlags::EndOfStream, &()).await?;
        self.io.core.close_local();
        Ok(())
    }

    /// Next response: `Some` message, `None` once the call completed with OK.
    ///
    /// After the end or an error every further call returns the same result.
    ///
    /// # Errors
    ///
    /// Returns the call's terminal error status.
    pub async fn recv(&mut self) -> Result<Option<Message>> {
        self.io.recv().await
    }

    /// Cancels the call. Pending and future operations fail with `Cancelled`.
    pub fn cancel(&self) {
        self.io
            .core
            .abort(Error::new(ErrorKind::Cancelled, "cancelled by invoker"), true);
    }

    #[must_use]
    pub fn canceller(&self) -> CallCanceller {
        CallCanceller(self.io.core.clone())
    }

    pub(crate) fn abort(&self, err: Error) {
        self.io.core.abort(err, true);
    }
}

impl Drop for ClientCall {
    fn drop(&mut self) {
        self.io.core.abort(
            Error::new(ErrorKind::Cancelled, "call dropped before completion"),
            true,
        );
    }
}

impl std::fmt::Debug for ClientCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCall")
            .field("id", &self.id())
            .field("method", self.method())
            .field("state", &self.state())
            .finish()
    }
}

/// Cancels a call from another task while its owner is blocked on it.
#[derive(Clone)]
pub struct CallCanceller(Arc<CallCore>);

impl CallCanceller {
    pub fn cancel(&self) {
        self.0
            .abort(Error::new(ErrorKind::Cancelled, "cancelled by invoker"), true);
    }
}

/// Dispatcher-side handle of a call, as yielded by [`Channel::accept`](crate::Channel::accept).
pub struct ServerCall {
    io: CallIo,
}

impl ServerCall {
    pub(crate) fn new(core: Arc<CallCore>, inbound: mpsc::UnboundedReceiver<Inbound>) -> Self {
        Self {
            io: CallIo { core, inbound },
        }
    }

    pub(crate) fn core(&self) -> &Arc<CallCore> {
        &self.io.core
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.io.core.id
    }

    #[must_use]
    pub fn method(&self) -> &MethodId {
        &self.io.core.method
    }

    #[must_use]
    pub fn pattern(&self) -> Pattern {
        self.io.core.pattern
    }

    #[must_use]
    pub fn state(&self) -> CallState {
        self.io.core.state()
    }

    #[must_use]
    pub fn context(&self) -> Context {
        Context::server_ctx(&self.io.core)
    }

    /// Next request: `Some` message, `None` once the invoker half-closed.
    ///
    /// # Errors
    ///
    /// `Cancelled` if the invoker cancelled or the deadline passed,
    /// `TransportError` if the connection dropped.
    pub async fn recv(&mut self) -> Result<Option<Message>> {
        self.io.recv().await
    }

    /// Sends one response message.
    ///
    /// # Errors
    ///
    /// `Cancelled` once the invoker gave up on the call, `CallClosed` after
    /// completion, or `TransportError`.
    pub async fn send<P: Serialize + ?Sized>(&self, payload: &P) -> Result<()> {
        self.io.core.send_frame(MsgFlags::Data, payload).await
    }

    /// Sends the only response of a unary or client-stream call.
    pub(crate) async fn send_last<P: Serialize + ?Sized>(&self, payload: &P) -> Result<()> {
        self.io
            .core
            .send_frame(MsgFlags::Data | MsgFlags::EndOfStream, payload)
            .await
    }

    /// Sets the terminal status and tells the invoker. Later completions are ignored.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if the status could not be written.
    pub async fn complete(&self, status: Status) -> Result<()> {
        self.io.core.complete(status).await
    }

    /// Receives the single request of a unary or server-stream call.
    pub(crate) async fn recv_request<Req: DeserializeOwned>(&mut self) -> Result<Req> {
        let Some(msg) = self.recv().await? else {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                "missing request message",
            ));
        };
        if !msg.meta.is_last() {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("{} call expects exactly one request", self.pattern()),
            ));
        }
        decode(&msg)
    }
}

impl std::fmt::Debug for ServerCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerCall")
            .field("id", &self.id())
            .field("method", self.method())
            .field("state", &self.state())
            .finish()
    }
}
