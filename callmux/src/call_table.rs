use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use dashmap::DashMap;
use foldhash::fast::RandomState;
use tokio::sync::mpsc;

use crate::{Error, Message, Status, call::CallCore};

/// What the reader task hands to a call's private inbound queue.
#[derive(Debug)]
pub(crate) enum Inbound {
    /// An application message, possibly flagged as the last one.
    Message(Message),
    /// The remote half-closed without a final message.
    HalfClose,
    /// Terminal status sent by the dispatcher.
    Status(Status),
    /// The transport went away.
    Transport(Error),
}

pub(crate) struct CallEntry {
    pub core: Arc<CallCore>,
    pub inbound: mpsc::UnboundedSender<Inbound>,
}

/// Per-side mapping from call id to the local state of that call.
///
/// Each side of a channel keeps two tables: one for the calls it opened and
/// one for the calls it accepted. Ids are allocated by the opening side and
/// reused as-is by the accepting side.
#[derive(Default)]
pub(crate) struct CallTable {
    index: AtomicU64,
    calls: DashMap<u64, CallEntry, RandomState>,
}

impl CallTable {
    pub fn alloc_id(&self) -> u64 {
        self.index.fetch_add(1, Ordering::SeqCst)
    }

    /// Returns false if the id is already taken.
    pub fn insert(&self, id: u64, entry: CallEntry) -> bool {
        match self.calls.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(entry);
                true
            }
        }
    }

    pub fn core(&self, id: u64) -> Option<Arc<CallCore>> {
        self.calls.get(&id).map(|entry| entry.core.clone())
    }

    /// Queues an item for the call. Returns false if the call is unknown or
    /// its receiving side is gone.
    pub fn deliver(&self, id: u64, item: Inbound) -> bool {
        match self.calls.get(&id) {
            Some(entry) => entry.inbound.send(item).is_ok(),
            None => false,
        }
    }

    pub fn remove(&self, id: u64) {
        self.calls.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    /// Removes and returns every call.
    pub fn drain(&self) -> Vec<CallEntry> {
        let ids: Vec<u64> = self.calls.iter().map(|entry| *entry.key()).collect();
        ids.into_iter()
            .filter_map(|id| self.calls.remove(&id).map(|(_, entry)| entry))
            .collect()
    }
}

impl std::fmt::Debug for CallTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallTable")
            .field("calls", &self.calls.len())
            .finish()
    }
}
