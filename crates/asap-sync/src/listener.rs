//! Listener registries.
//!
//! Listeners run synchronously, in attach order, on the thread that caused
//! the event. A failing listener is logged by the engine and never aborts
//! the operation that fired it.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use asap_core::{Era, PeerId};

/// Handle returned by `attach`, used to detach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Ordered set of listeners of one kind.
pub struct Listeners<L: ?Sized> {
    next_id: AtomicU64,
    entries: RwLock<Vec<(ListenerId, Arc<L>)>>,
}

impl<L: ?Sized> Listeners<L> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            entries: RwLock::new(Vec::new()),
        }
    }

    pub fn attach(&self, listener: Arc<L>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        id
    }

    /// Remove a listener. Returns whether it was attached.
    pub fn detach(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|(entry, _)| *entry != id);
        entries.len() != before
    }

    /// Current listeners, in attach order. Firing from a snapshot lets
    /// listeners attach or detach while being notified.
    pub fn snapshot(&self) -> Vec<Arc<L>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<L: ?Sized> Default for Listeners<L> {
    fn default() -> Self {
        Self::new()
    }
}

/// Notified after a received chunk has been stored.
pub trait ChunkReceivedListener: Send + Sync {
    fn chunk_received(&self, sender: &PeerId, uri: &str, era: Era) -> anyhow::Result<()>;
}

impl<F> ChunkReceivedListener for F
where
    F: Fn(&PeerId, &str, Era) -> anyhow::Result<()> + Send + Sync,
{
    fn chunk_received(&self, sender: &PeerId, uri: &str, era: Era) -> anyhow::Result<()> {
        self(sender, uri, era)
    }
}

/// Notified after a message was added locally, e.g. to push it to peers
/// connected right now.
pub trait MessageAddedListener: Send + Sync {
    fn message_added(
        &self,
        format: &str,
        uri: &str,
        recipients: &BTreeSet<PeerId>,
        message: &[u8],
        era: Era,
    ) -> anyhow::Result<()>;
}

/// Notified after a channel was created locally.
pub trait ChannelCreatedListener: Send + Sync {
    fn channel_created(
        &self,
        format: &str,
        owner: &PeerId,
        uri: &str,
        recipients: &BTreeSet<PeerId>,
    ) -> anyhow::Result<()>;
}
