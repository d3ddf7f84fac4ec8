use std::sync::Arc;

use crate::{
    Channel, Router, ServerCall, Status, TaskSupervisor,
    error::{Error, ErrorKind},
};

/// Serves the calls accepted on one or more channels with a frozen [`Router`].
///
/// Every call runs its handler on its own task. Handlers are never aborted:
/// [`stop`](Self::stop) closes the served channels, which fails any pending
/// stream operation, and [`join`](Self::join) waits for the handlers to return.
pub struct Dispatcher {
    router: Router,
    task_supervisor: TaskSupervisor,
}

impl Dispatcher {
    #[must_use]
    pub fn new(router: Router) -> Arc<Self> {
        Arc::new(Self {
            router,
            task_supervisor: TaskSupervisor::create(),
        })
    }

    #[must_use]
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Runs an accept loop on `channel` until it closes or the dispatcher stops.
    pub fn serve(self: &Arc<Self>, channel: Channel) {
        let this = self.clone();
        self.task_supervisor.spawn(|guard| async move {
            loop {
                tokio::select! {
                    call = channel.accept() => match call {
                        Some(call) => this.dispatch(call),
                        None => break,
                    },
                    () = guard.stopped() => {
                        channel.close();
                        break;
                    }
                }
            }
            tracing::debug!("stop serving {channel:?}");
        });
    }

    /// Resolves the handler of `call` and runs it to completion.
    pub fn dispatch(&self, call: ServerCall) {
        let core = call.core().clone();
        let id = call.id();

        let entry = match self.router.get(call.method()) {
            Some(entry) if entry.pattern == call.pattern() => entry,
            Some(entry) => {
                let msg = format!(
                    "{} is registered as {}, called as {}",
                    call.method(),
                    entry.pattern,
                    call.pattern()
                );
                tracing::error!("call {id}: {msg}");
                self.complete(call, Err(Error::new(ErrorKind::InvalidArgument, msg)));
                return;
            }
            None => {
                let msg = format!("method not found: {}", call.method());
                tracing::error!("call {id}: {msg}");
                self.complete(call, Err(Error::new(ErrorKind::NotFound, msg)));
                return;
            }
        };

        let ctx = call.context();
        let handler = (entry.handler)(ctx, call);
        self.task_supervisor.spawn(|guard| async move {
            let _guard = guard;
            let status = match tokio::spawn(handler).await {
                Ok(status) => status,
                Err(e) => {
                    tracing::error!("handler of call {id} failed: {e}");
                    Err(Error::new(ErrorKind::Internal, format!("handler failed: {e}")))
                }
            };
            if let Err(err) = &status {
                tracing::debug!("call {id} completed with {err}");
            }
            if let Err(e) = core.complete(status).await {
                tracing::warn!("failed to send status of call {id}: {e}");
            }
        });
    }

    fn complete(&self, call: ServerCall, status: Status) {
        self.task_supervisor.spawn(|guard| async move {
            let _guard = guard;
            if let Err(e) = call.complete(status).await {
                tracing::warn!("failed to send status of call {}: {e}", call.id());
            }
        });
    }

    pub fn stop(&self) {
        self.task_supervisor.stop();
    }

    pub async fn join(&self) {
        self.task_supervisor.all_stopped().await;
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("router", &self.router)
            .finish_non_exhaustive()
    }
}
