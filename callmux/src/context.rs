use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    MethodId, Pattern,
    call::{CallCore, deadline_elapsed},
};

/// Per-call information handed to a handler.
///
/// Handlers are never interrupted. Long-running work can poll
/// [`is_cancelled`](Self::is_cancelled) or race [`cancelled`](Self::cancelled)
/// to stop early; the next stream operation reports the cancellation anyway.
#[derive(Clone, Debug)]
pub struct Context {
    call_id: u64,
    method: MethodId,
    pattern: Pattern,
    deadline: Option<Instant>,
    aborted: CancellationToken,
}

impl Context {
    pub(crate) fn server_ctx(core: &CallCore) -> Self {
        Self {
            call_id: core.id,
            method: core.method.clone(),
            pattern: core.pattern,
            deadline: core.deadline,
            aborted: core.aborted_token(),
        }
    }

    #[must_use]
    pub fn call_id(&self) -> u64 {
        self.call_id
    }

    #[must_use]
    pub fn method(&self) -> &MethodId {
        &self.method
    }

    #[must_use]
    pub fn pattern(&self) -> Pattern {
        self.pattern
    }

    /// Deadline propagated from the invoker, if any.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.aborted.is_cancelled() || self.deadline.is_some_and(|d| d <= Instant::now())
    }

    /// Resolves once the invoker cancels, the deadline passes or the connection drops.
    pub async fn cancelled(&self) {
        tokio::select! {
            () = self.aborted.cancelled() => {}
            () = deadline_elapsed(self.deadline) => {}
        }
    }
}
