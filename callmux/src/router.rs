use foldhash::fast::RandomState;
use serde::{Serialize, de::DeserializeOwned};
use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

use crate::{
    BidiStream, Context, MethodId, MsgFlags, Pattern, RequestStream, ResponseSink, ServerCall, Status,
    error::{Error, ErrorKind, Result},
};

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Untyped handler. The returned status completes the call unless the
/// handler already completed it.
pub type Method = Box<dyn Fn(Context, ServerCall) -> BoxFuture<Status> + Send + Sync>;

pub struct MethodEntry {
    pub pattern: Pattern,
    pub handler: Method,
}

/// Registration table from method identifier to handler.
///
/// Frozen once handed to a [`Dispatcher`](crate::Dispatcher).
#[derive(Default)]
pub struct Router {
    methods: HashMap<MethodId, MethodEntry, RandomState>,
}

impl Router {
    /// # Errors
    ///
    /// Returns `Configuration` if `method` is already registered.
    pub fn register(&mut self, method: MethodId, pattern: Pattern, handler: Method) -> Result<()> {
        if self.methods.contains_key(&method) {
            return Err(Error::new(
                ErrorKind::Configuration,
                format!("method already registered: {method}"),
            ));
        }
        tracing::debug!("register {method} ({pattern})");
        self.methods.insert(method, MethodEntry { pattern, handler });
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `Configuration` if `method` is already registered.
    pub fn unary<Req, Rsp, F, Fut>(&mut self, method: MethodId, f: F) -> Result<()>
    where
        Req: DeserializeOwned + Send + 'static,
        Rsp: Serialize + Send + Sync + 'static,
        F: Fn(Context, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Rsp>> + Send + 'static,
    {
        let f = Arc::new(f);
        let handler: Method = Box::new(move |ctx, mut call| {
            let f = f.clone();
            Box::pin(async move {
                let req = call.recv_request::<Req>().await?;
                let rsp = f(ctx, req).await?;
                call.send_last(&rsp).await
            })
        });
        self.register(method, Pattern::Unary, handler)
    }

    /// # Errors
    ///
    /// Returns `Configuration` if `method` is already registered.
    pub fn server_stream<Req, Rsp, F, Fut>(&mut self, method: MethodId, f: F) -> Result<()>
    where
        Req: DeserializeOwned + Send + 'static,
        Rsp: Serialize + Send + Sync + 'static,
        F: Fn(Context, Req, ResponseSink<Rsp>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Status> + Send + 'static,
    {
        let f = Arc::new(f);
        let handler: Method = Box::new(move |ctx, mut call| {
            let f = f.clone();
            Box::pin(async move {
                let req = call.recv_request::<Req>().await?;
                f(ctx, req, ResponseSink::new(call)).await
            })
        });
        self.register(method, Pattern::ServerStream, handler)
    }

    /// # Errors
    ///
    /// Returns `Configuration` if `method` is already registered.
    pub fn client_stream<Req, Rsp, F, Fut>(&mut self, method: MethodId, f: F) -> Result<()>
    where
        Req: DeserializeOwned + Send + 'static,
        Rsp: Serialize + Send + Sync + 'static,
        F: Fn(Context, RequestStream<Req>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Rsp>> + Send + 'static,
    {
        let f = Arc::new(f);
        let handler: Method = Box::new(move |ctx, call| {
            let f = f.clone();
            Box::pin(async move {
                let core = call.core().clone();
                let rsp = f(ctx, RequestStream::new(call)).await?;
                core.send_frame(MsgFlags::Data | MsgFlags::EndOfStream, &rsp)
                    .await
            })
        });
        self.register(method, Pattern::ClientStream, handler)
    }

    /// The handler starts as soon as the call is opened, before any request
    /// arrives, so it may send first. Use [`BidiStream::message`] to wait for
    /// the first request.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if `method` is already registered.
    pub fn bidi_stream<Req, Rsp, F, Fut>(&mut self, method: MethodId, f: F) -> Result<()>
    where
        Req: DeserializeOwned + Send + 'static,
        Rsp: Serialize + Send + Sync + 'static,
        F: Fn(Context, BidiStream<Req, Rsp>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Status> + Send + 'static,
    {
        let f = Arc::new(f);
        let handler: Method = Box::new(move |ctx, call| {
            let f = f.clone();
            Box::pin(async move { f(ctx, BidiStream::new(call)).await })
        });
        self.register(method, Pattern::BidiStream, handler)
    }

    pub fn method_names(&self) -> impl Iterator<Item = &MethodId> {
        self.methods.keys()
    }

    #[must_use]
    pub fn get(&self, method: &MethodId) -> Option<&MethodEntry> {
        self.methods.get(method)
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("methods", &self.methods.keys())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_register() {
        let mut router = Router::default();
        let method = MethodId::from_static("Foo", "SayHello");
        router
            .unary(method.clone(), |_, name: String| async move { Ok(name) })
            .unwrap();
        let err = router
            .unary(method.clone(), |_, name: String| async move { Ok(name) })
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Configuration);

        assert_eq!(router.get(&method).unwrap().pattern, Pattern::Unary);
        assert_eq!(router.method_names().count(), 1);
    }
}
