use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};

use crate::{
    CallCanceller, CallState, ClientCall, Context, Message, ServerCall, Status,
    error::{Error, ErrorKind, Result},
};

/// Decodes a payload; a message that does not match the expected type is a
/// protocol violation.
pub(crate) fn decode<T: DeserializeOwned>(msg: &Message) -> Result<T> {
    msg.deserialize().map_err(|e| {
        Error::new(
            ErrorKind::InvalidArgument,
            format!("invalid message payload: {}", e.msg),
        )
    })
}

/// Decodes the next response. A payload that fails to decode aborts the call.
async fn recv_decoded<Rsp: DeserializeOwned>(call: &mut ClientCall) -> Result<Option<Rsp>> {
    let Some(msg) = call.recv().await? else {
        return Ok(None);
    };
    decode(&msg).map(Some).inspect_err(|err| call.abort(err.clone()))
}

/// Receives the single response of a unary or client-stream call and waits
/// for its OK status.
pub(crate) async fn recv_single<Rsp: DeserializeOwned>(call: &mut ClientCall) -> Result<Rsp> {
    let Some(rsp) = recv_decoded(call).await? else {
        let err = Error::new(
            ErrorKind::InvalidArgument,
            format!("{} completed without a response", call.method()),
        );
        call.abort(err.clone());
        return Err(err);
    };
    if call.recv().await?.is_some() {
        let err = Error::new(
            ErrorKind::InvalidArgument,
            format!("{} sent more than one response", call.method()),
        );
        call.abort(err.clone());
        return Err(err);
    }
    Ok(rsp)
}

/// Responses of a server-stream call.
pub struct Streaming<Rsp> {
    call: ClientCall,
    _marker: PhantomData<fn() -> Rsp>,
}

impl<Rsp: DeserializeOwned> Streaming<Rsp> {
    pub(crate) fn new(call: ClientCall) -> Self {
        Self {
            call,
            _marker: PhantomData,
        }
    }

    /// Next response, `None` at the end of the stream.
    ///
    /// Once the stream ended or failed, every call returns the same result.
    ///
    /// # Errors
    ///
    /// Returns the call's terminal error status.
    pub async fn message(&mut self) -> Result<Option<Rsp>> {
        recv_decoded(&mut self.call).await
    }

    pub fn cancel(&self) {
        self.call.cancel();
    }

    #[must_use]
    pub fn canceller(&self) -> CallCanceller {
        self.call.canceller()
    }

    #[must_use]
    pub fn state(&self) -> CallState {
        self.call.state()
    }
}

/// Requests of a client-stream call and its single response.
pub struct ClientStreaming<Req, Rsp> {
    call: ClientCall,
    _marker: PhantomData<fn(Req) -> Rsp>,
}

impl<Req: Serialize, Rsp: DeserializeOwned> ClientStreaming<Req, Rsp> {
    pub(crate) fn new(call: ClientCall) -> Self {
        Self {
            call,
            _marker: PhantomData,
        }
    }

    /// # Errors
    ///
    /// `StreamClosed` after [`close_send`](Self::close_send), or the call's
    /// terminal error.
    pub async fn send(&mut self, req: &Req) -> Result<()> {
        self.call.send(req, false).await
    }

    /// # Errors
    ///
    /// Returns the call's terminal error.
    pub async fn close_send(&mut self) -> Result<()> {
        self.call.close_send().await
    }

    /// Half-closes the request stream and waits for the response.
    ///
    /// # Errors
    ///
    /// Returns the call's terminal error status.
    pub async fn close_and_recv(mut self) -> Result<Rsp> {
        match self.call.close_send().await {
            Err(err) if err.kind != ErrorKind::CallClosed => return Err(err),
            _ => {}
        }
        recv_single(&mut self.call).await
    }

    pub fn cancel(&self) {
        self.call.cancel();
    }

    #[must_use]
    pub fn canceller(&self) -> CallCanceller {
        self.call.canceller()
    }
}

/// Both directions of a bidi-stream call, seen from the invoker.
pub struct BidiStreaming<Req, Rsp> {
    call: ClientCall,
    _marker: PhantomData<fn(Req) -> Rsp>,
}

impl<Req: Serialize, Rsp: DeserializeOwned> BidiStreaming<Req, Rsp> {
    pub(crate) fn new(call: ClientCall) -> Self {
        Self {
            call,
            _marker: PhantomData,
        }
    }

    /// # Errors
    ///
    /// `StreamClosed` after [`close_send`](Self::close_send), or the call's
    /// terminal error.
    pub async fn send(&mut self, req: &Req) -> Result<()> {
        self.call.send(req, false).await
    }

    /// # Errors
    ///
    /// Returns the call's terminal error.
    pub async fn close_send(&mut self) -> Result<()> {
        self.call.close_send().await
    }

    /// Next response, `None` once the handler completed with OK.
    ///
    /// # Errors
    ///
    /// Returns the call's terminal error status.
    pub async fn message(&mut self) -> Result<Option<Rsp>> {
        recv_decoded(&mut self.call).await
    }

    pub fn cancel(&self) {
        self.call.cancel();
    }

    #[must_use]
    pub fn canceller(&self) -> CallCanceller {
        self.call.canceller()
    }

    #[must_use]
    pub fn state(&self) -> CallState {
        self.call.state()
    }
}

/// Response side of a server-stream handler.
pub struct ResponseSink<Rsp> {
    call: ServerCall,
    _marker: PhantomData<fn(Rsp)>,
}

impl<Rsp: Serialize> ResponseSink<Rsp> {
    pub(crate) fn new(call: ServerCall) -> Self {
        Self {
            call,
            _marker: PhantomData,
        }
    }

    /// # Errors
    ///
    /// `Cancelled` once the invoker gave up on the call, `CallClosed` after
    /// [`finish`](Self::finish).
    pub async fn send(&self, rsp: &Rsp) -> Result<()> {
        self.call.send(rsp).await
    }

    /// Ends the stream with `status`. Returning from the handler does the same.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if the status could not be written.
    pub async fn finish(self, status: Status) -> Result<()> {
        self.call.complete(status).await
    }

    #[must_use]
    pub fn context(&self) -> Context {
        self.call.context()
    }
}

/// Request side of a client-stream handler.
pub struct RequestStream<Req> {
    call: ServerCall,
    _marker: PhantomData<fn() -> Req>,
}

impl<Req: DeserializeOwned> RequestStream<Req> {
    pub(crate) fn new(call: ServerCall) -> Self {
        Self {
            call,
            _marker: PhantomData,
        }
    }

    /// Next request, `None` once the invoker half-closed.
    ///
    /// # Errors
    ///
    /// `Cancelled`, `TransportError`, or `InvalidArgument` for a payload of
    /// the wrong type.
    pub async fn message(&mut self) -> Result<Option<Req>> {
        match self.call.recv().await? {
            Some(msg) => decode(&msg).map(Some),
            None => Ok(None),
        }
    }

    #[must_use]
    pub fn context(&self) -> Context {
        self.call.context()
    }
}

/// Both directions of a bidi-stream call, seen from the handler.
pub struct BidiStream<Req, Rsp> {
    call: ServerCall,
    _marker: PhantomData<fn(Req) -> Rsp>,
}

impl<Req: DeserializeOwned, Rsp: Serialize> BidiStream<Req, Rsp> {
    pub(crate) fn new(call: ServerCall) -> Self {
        Self {
            call,
            _marker: PhantomData,
        }
    }

    /// Next request, `None` once the invoker half-closed.
    ///
    /// # Errors
    ///
    /// `Cancelled`, `TransportError`, or `InvalidArgument` for a payload of
    /// the wrong type.
    pub async fn message(&mut self) -> Result<Option<Req>> {
        match self.call.recv().await? {
            Some(msg) => decode(&msg).map(Some),
            None => Ok(None),
        }
    }

    /// # Errors
    ///
    /// `Cancelled` once the invoker gave up on the call, `CallClosed` after
    /// [`finish`](Self::finish).
    pub async fn send(&self, rsp: &Rsp) -> Result<()> {
        self.call.send(rsp).await
    }

    /// # Errors
    ///
    /// Returns `TransportError` if the status could not be written.
    pub async fn finish(self, status: Status) -> Result<()> {
        self.call.complete(status).await
    }

    #[must_use]
    pub fn context(&self) -> Context {
        self.call.context()
    }
}
