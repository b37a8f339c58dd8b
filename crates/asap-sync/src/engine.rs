//! The sync engine of one application format.
//!
//! A [`SyncEngine`] owns the local chunk storage of its format, one incoming
//! storage per remote sender, the era clock and the per-peer sync cursors.
//! The exchange with a connected peer lives in [`crate::protocol`].

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, instrument, warn};

use asap_core::{validate_format, Era, PeerId};
use asap_store::{
    ChannelInfo, ChunkChain, ChunkStorage, FsStorageProvider, MemoryStorageProvider,
    StorageProvider,
};

use crate::error::{Result, SyncError};
use crate::listener::{
    ChannelCreatedListener, ChunkReceivedListener, ListenerId, Listeners, MessageAddedListener,
};
use crate::memento::{EngineSnapshot, FsMemento, Memento, MemoryMemento};
use crate::messages::AssimilatePdu;
use crate::protocol::EngineConfig;

/// Mutable engine state, checkpointed through the [`Memento`].
#[derive(Debug, Clone)]
pub(crate) struct EngineState {
    pub(crate) era: Era,
    pub(crate) oldest_era: Era,
    pub(crate) last_seen: BTreeMap<PeerId, Era>,
    pub(crate) content_changed: bool,
    pub(crate) drop_delivered_chunks: bool,
    pub(crate) send_received_chunks: bool,
}

impl EngineState {
    fn fresh(config: &EngineConfig) -> Self {
        Self {
            era: Era::ZERO,
            oldest_era: Era::ZERO,
            last_seen: BTreeMap::new(),
            content_changed: false,
            drop_delivered_chunks: config.drop_delivered_chunks,
            send_received_chunks: config.send_received_chunks,
        }
    }

    fn restore(snapshot: EngineSnapshot) -> Self {
        Self {
            era: snapshot.era,
            oldest_era: snapshot.oldest_era,
            last_seen: snapshot.last_seen,
            content_changed: snapshot.content_changed,
            drop_delivered_chunks: snapshot.drop_delivered_chunks,
            send_received_chunks: snapshot.send_received_chunks,
        }
    }

    fn snapshot(&self, owner: &PeerId, format: &str) -> EngineSnapshot {
        EngineSnapshot {
            owner: owner.clone(),
            format: format.to_string(),
            era: self.era,
            oldest_era: self.oldest_era,
            last_seen: self.last_seen.clone(),
            content_changed: self.content_changed,
            drop_delivered_chunks: self.drop_delivered_chunks,
            send_received_chunks: self.send_received_chunks,
        }
    }

    /// First era to send to `peer`. A cursor outside the retained window
    /// `oldest_era..=era` restarts at `oldest_era`.
    pub(crate) fn window_start(&self, peer: &PeerId) -> Era {
        match self.last_seen.get(peer) {
            Some(&cursor)
                if self.oldest_era.steps_to(cursor) <= self.oldest_era.steps_to(self.era) =>
            {
                cursor
            }
            _ => self.oldest_era,
        }
    }
}

/// Marks a peer as being in an exchange; releases it on drop.
pub struct ActivePeerGuard<'a> {
    peers: &'a Mutex<HashSet<PeerId>>,
    peer: PeerId,
}

impl ActivePeerGuard<'_> {
    pub fn peer(&self) -> &PeerId {
        &self.peer
    }
}

impl Drop for ActivePeerGuard<'_> {
    fn drop(&mut self) {
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.peer);
    }
}

/// Sync engine for one application format.
pub struct SyncEngine {
    pub(crate) owner: PeerId,
    pub(crate) format: String,
    pub(crate) local: ChunkStorage,
    pub(crate) provider: Arc<dyn StorageProvider>,
    pub(crate) memento: Arc<dyn Memento>,
    pub(crate) config: EngineConfig,
    pub(crate) state: Mutex<EngineState>,
    active_peers: Mutex<HashSet<PeerId>>,
    chunk_received: Listeners<dyn ChunkReceivedListener>,
    message_added: Listeners<dyn MessageAddedListener>,
    channel_created: Listeners<dyn ChannelCreatedListener>,
}

impl SyncEngine {
    // ─────────────────────────────────────────────────────────────────────────
    // Construction
    // ─────────────────────────────────────────────────────────────────────────

    /// Open an engine, restoring state from `memento` if it holds any.
    ///
    /// Fails with [`SyncError::Config`] when `format` is empty or the
    /// checkpoint belongs to another format.
    pub fn open(
        owner: PeerId,
        format: &str,
        provider: Arc<dyn StorageProvider>,
        memento: Arc<dyn Memento>,
        config: EngineConfig,
    ) -> Result<Self> {
        validate_format(format).map_err(|e| SyncError::Config(e.to_string()))?;

        let state = match memento.load()? {
            Some(snapshot) => {
                if snapshot.format != format {
                    return Err(SyncError::Config(format!(
                        "checkpoint belongs to format {}, not {format}",
                        snapshot.format
                    )));
                }
                if snapshot.owner != owner {
                    warn!(
                        saved = %snapshot.owner,
                        %owner,
                        format,
                        "checkpoint owner differs, keeping configured owner"
                    );
                }
                EngineState::restore(snapshot)
            }
            None => EngineState::fresh(&config),
        };
        info!(%owner, format, era = %state.era, "opened sync engine");

        let local = provider.local()?;
        Ok(Self {
            owner,
            format: format.to_string(),
            local,
            provider,
            memento,
            config,
            state: Mutex::new(state),
            active_peers: Mutex::new(HashSet::new()),
            chunk_received: Listeners::new(),
            message_added: Listeners::new(),
            channel_created: Listeners::new(),
        })
    }

    /// Engine persisted under `root`: chunks in era directories, checkpoint
    /// in a JSON file.
    pub fn open_fs(
        owner: PeerId,
        format: &str,
        root: impl Into<PathBuf>,
        config: EngineConfig,
    ) -> Result<Self> {
        let root = root.into();
        let memento = Arc::new(FsMemento::in_dir(&root));
        let provider = Arc::new(FsStorageProvider::new(root));
        Self::open(owner, format, provider, memento, config)
    }

    /// Engine with in-memory storage and checkpoint.
    pub fn in_memory(owner: PeerId, format: &str) -> Result<Self> {
        Self::in_memory_with(owner, format, EngineConfig::default())
    }

    pub fn in_memory_with(owner: PeerId, format: &str, config: EngineConfig) -> Result<Self> {
        Self::open(
            owner,
            format,
            Arc::new(MemoryStorageProvider::new()),
            Arc::new(MemoryMemento::new()),
            config,
        )
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors and policy
    // ─────────────────────────────────────────────────────────────────────────

    pub fn owner(&self) -> &PeerId {
        &self.owner
    }

    pub fn format(&self) -> &str {
        &self.format
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn era(&self) -> Era {
        self.lock_state().era
    }

    pub fn oldest_era(&self) -> Era {
        self.lock_state().oldest_era
    }

    /// Sync cursor of `peer`: the next era to send it.
    pub fn last_seen(&self, peer: &PeerId) -> Option<Era> {
        self.lock_state().last_seen.get(peer).copied()
    }

    pub fn content_changed(&self) -> bool {
        self.lock_state().content_changed
    }

    pub fn drop_delivered_chunks(&self) -> bool {
        self.lock_state().drop_delivered_chunks
    }

    pub fn set_drop_delivered_chunks(&self, on: bool) -> Result<()> {
        let mut state = self.lock_state();
        state.drop_delivered_chunks = on;
        self.checkpoint(&state)
    }

    pub fn send_received_chunks(&self) -> bool {
        self.lock_state().send_received_chunks
    }

    pub fn set_send_received_chunks(&self, on: bool) -> Result<()> {
        let mut state = self.lock_state();
        state.send_received_chunks = on;
        self.checkpoint(&state)
    }

    /// Forget the cursor of `peer`; the next exchange starts at the oldest era.
    pub fn reset_last_seen(&self, peer: &PeerId) -> Result<()> {
        let mut state = self.lock_state();
        if state.last_seen.remove(peer).is_some() {
            self.checkpoint(&state)?;
        }
        Ok(())
    }

    /// Reload state from the checkpoint.
    pub fn refresh(&self) -> Result<()> {
        if let Some(snapshot) = self.memento.load()? {
            *self.lock_state() = EngineState::restore(snapshot);
        }
        Ok(())
    }

    pub fn is_active(&self, peer: &PeerId) -> bool {
        self.active_peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(peer)
    }

    /// Admit `peer` into an exchange. Fails with
    /// [`SyncError::PermissionDenied`] while another exchange with it runs.
    pub fn admit(&self, peer: &PeerId) -> Result<ActivePeerGuard<'_>> {
        let mut active = self
            .active_peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !active.insert(peer.clone()) {
            return Err(SyncError::PermissionDenied { peer: peer.clone() });
        }
        Ok(ActivePeerGuard {
            peers: &self.active_peers,
            peer: peer.clone(),
        })
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn checkpoint(&self, state: &EngineState) -> Result<()> {
        self.memento.save(&state.snapshot(&self.owner, &self.format))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Era lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Close the current era if it holds new content.
    ///
    /// Returns whether a new era was started. The new era starts with a clone
    /// of every chunk of the closed one.
    #[instrument(skip(self), fields(owner = %self.owner, format = %self.format))]
    pub fn new_era(&self) -> Result<bool> {
        let mut state = self.lock_state();
        if !state.content_changed {
            return Ok(false);
        }

        let closed = state.era;
        let next = closed.next();
        state.content_changed = false;
        state.era = next;
        if next == state.oldest_era {
            state.oldest_era = state.oldest_era.next();
        }
        self.checkpoint(&state)?;

        self.local.drop_chunks(next)?;
        let mut carried = 0;
        for chunk in self.local.get_chunks(closed)? {
            let mut copy = self.local.get_chunk(chunk.uri(), next)?;
            copy.clone_from_chunk(&chunk)?;
            carried += 1;
        }
        info!(%closed, era = %next, carried, "started new era");
        Ok(true)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Messages
    // ─────────────────────────────────────────────────────────────────────────

    /// Append `message` to channel `uri` in the current era.
    pub fn add(&self, uri: &str, message: &[u8]) -> Result<()> {
        let (era, recipients) = {
            let mut state = self.lock_state();
            let mut chunk = self.local.get_chunk(uri, state.era)?;
            chunk.add_message(message)?;
            if !state.content_changed {
                state.content_changed = true;
                self.checkpoint(&state)?;
            }
            (state.era, chunk.recipients().clone())
        };
        debug!(uri, %era, len = message.len(), "added message");

        for listener in self.message_added.snapshot() {
            if let Err(e) = listener.message_added(&self.format, uri, &recipients, message, era) {
                warn!(uri, %era, error = %e, "message-added listener failed");
            }
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Channels
    // ─────────────────────────────────────────────────────────────────────────

    /// Create (or re-declare) channel `uri` owned by this engine's owner.
    pub fn create_channel<I>(&self, uri: &str, recipients: I) -> Result<ChannelInfo>
    where
        I: IntoIterator<Item = PeerId>,
    {
        self.create_channel_with_owner(self.owner.clone(), uri, recipients)
    }

    /// Create a channel with a single recipient.
    pub fn create_channel_for(&self, uri: &str, recipient: PeerId) -> Result<ChannelInfo> {
        self.create_channel(uri, [recipient])
    }

    /// Create (or re-declare) channel `uri` with an explicit owner.
    ///
    /// An empty recipient set makes the channel public.
    pub fn create_channel_with_owner<I>(
        &self,
        owner: PeerId,
        uri: &str,
        recipients: I,
    ) -> Result<ChannelInfo>
    where
        I: IntoIterator<Item = PeerId>,
    {
        let recipients: BTreeSet<PeerId> = recipients.into_iter().collect();
        let info = {
            let state = self.lock_state();
            let mut chunk = self.local.get_chunk(uri, state.era)?;
            chunk.set_owner(Some(owner.clone()))?;
            chunk.set_recipients(recipients.clone())?;
            chunk.channel_info()
        };
        debug!(uri, %owner, recipients = recipients.len(), "created channel");

        for listener in self.channel_created.snapshot() {
            if let Err(e) = listener.channel_created(&self.format, &owner, uri, &recipients) {
                warn!(uri, error = %e, "channel-created listener failed");
            }
        }
        Ok(info)
    }

    pub fn channel_exists(&self, uri: &str) -> Result<bool> {
        let era = self.era();
        Ok(self.local.exists_chunk(uri, era)?)
    }

    /// Metadata of channel `uri` in the current era.
    pub fn channel(&self, uri: &str) -> Result<ChannelInfo> {
        let era = self.era();
        self.local
            .existing_chunk(uri, era)?
            .map(|chunk| chunk.channel_info())
            .ok_or_else(|| SyncError::NotFound(format!("channel {uri}")))
    }

    /// URIs of all channels in the current era, sorted.
    pub fn channel_uris(&self) -> Result<Vec<String>> {
        let era = self.era();
        Ok(self
            .local
            .get_chunks(era)?
            .iter()
            .map(|chunk| chunk.uri().to_string())
            .collect())
    }

    /// Remove channel `uri` from the current era.
    pub fn remove_channel(&self, uri: &str) -> Result<()> {
        let state = self.lock_state();
        let chunk = self
            .local
            .existing_chunk(uri, state.era)?
            .ok_or_else(|| SyncError::NotFound(format!("channel {uri}")))?;
        chunk.remove()?;
        Ok(())
    }

    pub fn recipients(&self, uri: &str) -> Result<BTreeSet<PeerId>> {
        Ok(self.channel(uri)?.recipients)
    }

    pub fn set_recipients(&self, uri: &str, recipients: BTreeSet<PeerId>) -> Result<()> {
        let state = self.lock_state();
        Ok(self
            .local
            .get_chunk(uri, state.era)?
            .set_recipients(recipients)?)
    }

    pub fn add_recipient(&self, uri: &str, peer: PeerId) -> Result<()> {
        let state = self.lock_state();
        Ok(self.local.get_chunk(uri, state.era)?.add_recipient(peer)?)
    }

    pub fn remove_recipient(&self, uri: &str, peer: &PeerId) -> Result<bool> {
        let state = self.lock_state();
        Ok(self
            .local
            .get_chunk(uri, state.era)?
            .remove_recipient(peer)?)
    }

    pub fn extra(&self, uri: &str, key: &str) -> Result<Option<String>> {
        Ok(self.channel(uri)?.extra.get(key).cloned())
    }

    pub fn put_extra(&self, uri: &str, key: &str, value: &str) -> Result<()> {
        let state = self.lock_state();
        Ok(self.local.get_chunk(uri, state.era)?.put_extra(key, value)?)
    }

    pub fn remove_extra(&self, uri: &str, key: &str) -> Result<Option<String>> {
        let state = self.lock_state();
        Ok(self.local.get_chunk(uri, state.era)?.remove_extra(key)?)
    }

    /// Chunk chain of `uri` up to the current era.
    pub fn chunk_chain(&self, uri: &str) -> ChunkChain {
        self.local.chunk_chain(uri, self.era())
    }

    pub fn chunk_chain_to(&self, uri: &str, era: Era) -> ChunkChain {
        self.local.chunk_chain(uri, era)
    }

    /// Chunk chain of the channel at `position` in [`Self::channel_uris`].
    pub fn chunk_chain_at(&self, position: usize) -> Result<ChunkChain> {
        self.chunk_chain_at_to(position, self.era())
    }

    /// Like [`Self::chunk_chain_at`], ending at `era`.
    pub fn chunk_chain_at_to(&self, position: usize, era: Era) -> Result<ChunkChain> {
        let uris = self.channel_uris()?;
        let uri = uris.get(position).ok_or_else(|| {
            SyncError::NotFound(format!("channel {position} of {}", uris.len()))
        })?;
        Ok(self.chunk_chain_to(uri, era))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Storages
    // ─────────────────────────────────────────────────────────────────────────

    pub fn local_storage(&self) -> &ChunkStorage {
        &self.local
    }

    /// Storage of data received from `sender`.
    pub fn incoming_storage(&self, sender: &PeerId) -> Result<ChunkStorage> {
        Ok(self.provider.incoming(sender)?)
    }

    /// Every sender this engine has received data from.
    pub fn senders(&self) -> Result<Vec<PeerId>> {
        Ok(self.provider.senders()?)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Receiving
    // ─────────────────────────────────────────────────────────────────────────

    /// Store a received chunk in the sender's incoming storage and notify
    /// chunk-received listeners. Returns the number of messages stored.
    ///
    /// Storage errors abort the call; messages already appended stay.
    pub fn assimilate(&self, pdu: &AssimilatePdu) -> Result<usize> {
        pdu.validate()?;
        if pdu.format != self.format {
            return Err(SyncError::Protocol(format!(
                "assimilate for format {} reached engine {}",
                pdu.format, self.format
            )));
        }

        let storage = self.provider.incoming(&pdu.sender)?;
        let created = !storage.exists_chunk(&pdu.uri, pdu.era)?;
        let mut chunk = storage.get_chunk(&pdu.uri, pdu.era)?;
        if created {
            let current = self.era();
            match self.local.existing_chunk(&pdu.uri, current)? {
                Some(local) => chunk.copy_metadata(&local.channel_info())?,
                None => {
                    if let Some(recipient) = &pdu.recipient {
                        chunk.set_recipients(BTreeSet::from([recipient.clone()]))?;
                    }
                }
            }
        }
        chunk.add_messages(&pdu.data, &pdu.offsets)?;
        let messages = pdu.offsets.len() + 1;

        {
            let mut state = self.lock_state();
            if !state.content_changed {
                state.content_changed = true;
                self.checkpoint(&state)?;
            }
        }
        debug!(sender = %pdu.sender, uri = %pdu.uri, era = %pdu.era, messages, "assimilated chunk");

        for listener in self.chunk_received.snapshot() {
            if let Err(e) = listener.chunk_received(&pdu.sender, &pdu.uri, pdu.era) {
                warn!(sender = %pdu.sender, uri = %pdu.uri, error = %e, "chunk-received listener failed");
            }
        }
        Ok(messages)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Listeners
    // ─────────────────────────────────────────────────────────────────────────

    pub fn attach_chunk_received_listener(
        &self,
        listener: Arc<dyn ChunkReceivedListener>,
    ) -> ListenerId {
        self.chunk_received.attach(listener)
    }

    pub fn detach_chunk_received_listener(&self, id: ListenerId) -> bool {
        self.chunk_received.detach(id)
    }

    pub fn attach_message_added_listener(
        &self,
        listener: Arc<dyn MessageAddedListener>,
    ) -> ListenerId {
        self.message_added.attach(listener)
    }

    pub fn detach_message_added_listener(&self, id: ListenerId) -> bool {
        self.message_added.detach(id)
    }

    pub fn attach_channel_created_listener(
        &self,
        listener: Arc<dyn ChannelCreatedListener>,
    ) -> ListenerId {
        self.channel_created.attach(listener)
    }

    pub fn detach_channel_created_listener(&self, id: ListenerId) -> bool {
        self.channel_created.detach(id)
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("owner", &self.owner)
            .field("format", &self.format)
            .field("era", &self.era())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn engine(owner: &str) -> SyncEngine {
        SyncEngine::in_memory(PeerId::from(owner), "chat").unwrap()
    }

    fn messages(engine: &SyncEngine, uri: &str, era: Era) -> Vec<Vec<u8>> {
        engine
            .local_storage()
            .existing_chunk(uri, era)
            .unwrap()
            .map(|c| c.messages().unwrap().map(|m| m.to_vec()).collect())
            .unwrap_or_default()
    }

    #[test]
    fn test_missing_format_rejected() {
        let result = SyncEngine::in_memory(PeerId::from("alice"), "");
        assert!(matches!(result, Err(SyncError::Config(_))));
    }

    #[test]
    fn test_new_era_noop_without_content() {
        let engine = engine("alice");
        assert!(!engine.new_era().unwrap());
        assert_eq!(engine.era(), Era::ZERO);
    }

    #[test]
    fn test_new_era_advances_once() {
        let engine = engine("alice");
        engine.add("sn2://a", b"hi").unwrap();
        assert!(engine.new_era().unwrap());
        assert_eq!(engine.era(), Era::new(1));
        assert!(!engine.new_era().unwrap());
        assert_eq!(engine.era(), Era::new(1));
    }

    #[test]
    fn test_new_era_carries_chunks_forward() {
        let engine = engine("alice");
        engine
            .create_channel("sn2://a", [PeerId::from("bob")])
            .unwrap();
        engine.add("sn2://a", b"one").unwrap();
        engine.add("sn2://a", b"two").unwrap();
        engine
            .local_storage()
            .get_chunk("sn2://a", Era::ZERO)
            .unwrap()
            .delivered_to(&PeerId::from("bob"))
            .unwrap();

        engine.new_era().unwrap();

        let copy = engine
            .local_storage()
            .existing_chunk("sn2://a", Era::new(1))
            .unwrap()
            .unwrap();
        assert_eq!(messages(&engine, "sn2://a", Era::new(1)), messages(&engine, "sn2://a", Era::ZERO));
        assert_eq!(copy.recipients(), &BTreeSet::from([PeerId::from("bob")]));
        assert!(copy.delivered().is_empty());
    }

    #[test]
    fn test_new_era_reclaims_stale_chunks() {
        let engine = engine("alice");
        engine
            .local_storage()
            .get_chunk("sn2://stale", Era::new(1))
            .unwrap()
            .add_message(b"old")
            .unwrap();
        engine.add("sn2://a", b"x").unwrap();
        engine.new_era().unwrap();

        assert!(!engine
            .local_storage()
            .exists_chunk("sn2://stale", Era::new(1))
            .unwrap());
        assert!(engine
            .local_storage()
            .exists_chunk("sn2://a", Era::new(1))
            .unwrap());
    }

    #[test]
    fn test_oldest_era_advances_on_wrap() {
        let memento = Arc::new(MemoryMemento::new());
        memento
            .save(&EngineSnapshot {
                owner: PeerId::from("alice"),
                format: "chat".into(),
                era: Era::MAX,
                oldest_era: Era::ZERO,
                last_seen: BTreeMap::new(),
                content_changed: true,
                drop_delivered_chunks: false,
                send_received_chunks: false,
            })
            .unwrap();
        let engine = SyncEngine::open(
            PeerId::from("alice"),
            "chat",
            Arc::new(MemoryStorageProvider::new()),
            memento,
            EngineConfig::default(),
        )
        .unwrap();

        engine.new_era().unwrap();
        assert_eq!(engine.era(), Era::ZERO);
        assert_eq!(engine.oldest_era(), Era::new(1));
    }

    #[test]
    fn test_checkpoint_on_rotation() {
        let memento = Arc::new(MemoryMemento::new());
        let engine = SyncEngine::open(
            PeerId::from("alice"),
            "chat",
            Arc::new(MemoryStorageProvider::new()),
            memento.clone(),
            EngineConfig::default(),
        )
        .unwrap();

        engine.add("sn2://a", b"x").unwrap();
        engine.new_era().unwrap();
        let saved = memento.last().unwrap();
        assert_eq!(saved.era, Era::new(1));
        assert!(!saved.content_changed);
    }

    #[test]
    fn test_fs_engine_restores_state() {
        let dir = TempDir::new().unwrap();
        let alice = PeerId::from("alice");
        {
            let engine =
                SyncEngine::open_fs(alice.clone(), "chat", dir.path(), EngineConfig::default())
                    .unwrap();
            engine.add("sn2://a", b"persisted").unwrap();
            engine.new_era().unwrap();
            engine.set_drop_delivered_chunks(true).unwrap();
        }

        let engine =
            SyncEngine::open_fs(alice, "chat", dir.path(), EngineConfig::default()).unwrap();
        assert_eq!(engine.era(), Era::new(1));
        assert!(engine.drop_delivered_chunks());
        assert_eq!(
            messages(&engine, "sn2://a", Era::new(1)),
            vec![b"persisted".to_vec()]
        );
    }

    #[test]
    fn test_checkpoint_of_other_format_rejected() {
        let dir = TempDir::new().unwrap();
        SyncEngine::open_fs(PeerId::from("a"), "chat", dir.path(), EngineConfig::default())
            .unwrap()
            .set_send_received_chunks(true)
            .unwrap();
        let result =
            SyncEngine::open_fs(PeerId::from("a"), "mail", dir.path(), EngineConfig::default());
        assert!(matches!(result, Err(SyncError::Config(_))));
    }

    #[test]
    fn test_channel_api() {
        let engine = engine("alice");
        let info = engine
            .create_channel_for("sn2://c1", PeerId::from("bob"))
            .unwrap();
        assert_eq!(info.owner, Some(PeerId::from("alice")));
        assert!(engine.channel_exists("sn2://c1").unwrap());
        assert!(!engine.channel_exists("sn2://none").unwrap());
        assert!(matches!(
            engine.channel("sn2://none"),
            Err(SyncError::NotFound(_))
        ));

        engine.add_recipient("sn2://c1", PeerId::from("carol")).unwrap();
        assert_eq!(engine.recipients("sn2://c1").unwrap().len(), 2);
        assert!(engine
            .remove_recipient("sn2://c1", &PeerId::from("bob"))
            .unwrap());

        engine.put_extra("sn2://c1", "topic", "lunch").unwrap();
        assert_eq!(
            engine.extra("sn2://c1", "topic").unwrap().as_deref(),
            Some("lunch")
        );

        engine.create_channel("sn2://b0", Vec::new()).unwrap();
        assert_eq!(engine.channel_uris().unwrap(), vec!["sn2://b0", "sn2://c1"]);
        assert!(matches!(
            engine.chunk_chain_at(2),
            Err(SyncError::NotFound(_))
        ));
        assert_eq!(engine.chunk_chain_at(1).unwrap().uri(), "sn2://c1");

        engine.remove_channel("sn2://b0").unwrap();
        assert!(engine.remove_channel("sn2://b0").is_err());
    }

    #[test]
    fn test_chunk_chain_spans_rotations() {
        let engine = engine("alice");
        engine.add("sn2://a", b"first").unwrap();
        engine.new_era().unwrap();
        engine.add("sn2://a", b"second").unwrap();

        let chain = engine.chunk_chain("sn2://a");
        // the carried-forward clone repeats era 0 in era 1
        assert_eq!(chain.len().unwrap(), 3);
        assert_eq!(&chain.message(0, false).unwrap()[..], b"second");
    }

    #[test]
    fn test_chunk_chain_at_ends_at_era() {
        let engine = engine("alice");
        engine.add("sn2://a", b"first").unwrap();
        engine.new_era().unwrap();
        engine.add("sn2://a", b"second").unwrap();

        let earlier = engine.chunk_chain_at_to(0, Era::ZERO).unwrap();
        assert_eq!(earlier.uri(), "sn2://a");
        assert_eq!(earlier.to_era(), Era::ZERO);
        assert_eq!(earlier.len().unwrap(), 1);
        assert_eq!(engine.chunk_chain_at(0).unwrap().len().unwrap(), 3);
        assert!(matches!(
            engine.chunk_chain_at_to(1, Era::ZERO),
            Err(SyncError::NotFound(_))
        ));
    }

    #[test]
    fn test_assimilate_into_incoming_storage() {
        let engine = engine("bob");
        let alice = PeerId::from("alice");
        engine
            .create_channel_with_owner(alice.clone(), "sn2://c1", [PeerId::from("bob")])
            .unwrap();

        let received = Arc::new(AtomicUsize::new(0));
        let counter = received.clone();
        engine.attach_chunk_received_listener(Arc::new(
            move |_: &PeerId, _: &str, _: Era| -> anyhow::Result<()> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        ));

        let count = engine
            .assimilate(&AssimilatePdu {
                sender: alice.clone(),
                recipient: Some(PeerId::from("bob")),
                format: "chat".into(),
                uri: "sn2://c1".into(),
                era: Era::new(4),
                length: 10,
                offsets: vec![5],
                data: Bytes::from_static(b"helloworld"),
            })
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(received.load(Ordering::SeqCst), 1);
        assert!(engine.content_changed());

        let chunk = engine
            .incoming_storage(&alice)
            .unwrap()
            .existing_chunk("sn2://c1", Era::new(4))
            .unwrap()
            .unwrap();
        let texts: Vec<_> = chunk.messages().unwrap().collect();
        assert_eq!(&texts[0][..], b"hello");
        assert_eq!(&texts[1][..], b"world");
        assert_eq!(chunk.owner(), Some(&alice));
        assert_eq!(engine.senders().unwrap(), vec![alice]);
    }

    #[test]
    fn test_assimilate_unknown_closed_channel_stays_closed() {
        let engine = engine("bob");
        engine
            .assimilate(&AssimilatePdu {
                sender: PeerId::from("alice"),
                recipient: Some(PeerId::from("bob")),
                format: "chat".into(),
                uri: "sn2://secret".into(),
                era: Era::ZERO,
                length: 1,
                offsets: vec![],
                data: Bytes::from_static(b"s"),
            })
            .unwrap();
        let chunk = engine
            .incoming_storage(&PeerId::from("alice"))
            .unwrap()
            .existing_chunk("sn2://secret", Era::ZERO)
            .unwrap()
            .unwrap();
        assert!(!chunk.is_public());
    }

    #[test]
    fn test_assimilate_rejects_bad_pdu() {
        let engine = engine("bob");
        let pdu = AssimilatePdu {
            sender: PeerId::from("alice"),
            recipient: None,
            format: "chat".into(),
            uri: "sn2://a".into(),
            era: Era::ZERO,
            length: 9,
            offsets: vec![],
            data: Bytes::from_static(b"short"),
        };
        assert!(matches!(engine.assimilate(&pdu), Err(SyncError::Protocol(_))));
        assert!(engine.senders().unwrap().is_empty());
    }

    #[test]
    fn test_failing_listener_swallowed() {
        struct Failing;
        impl MessageAddedListener for Failing {
            fn message_added(
                &self,
                _: &str,
                _: &str,
                _: &BTreeSet<PeerId>,
                _: &[u8],
                _: Era,
            ) -> anyhow::Result<()> {
                anyhow::bail!("peer went away")
            }
        }

        let engine = engine("alice");
        let id = engine.attach_message_added_listener(Arc::new(Failing));
        engine.add("sn2://a", b"x").unwrap();
        assert!(engine.detach_message_added_listener(id));
    }

    #[test]
    fn test_admission_guard() {
        let engine = engine("alice");
        let bob = PeerId::from("bob");
        let guard = engine.admit(&bob).unwrap();
        assert!(engine.is_active(&bob));
        assert!(matches!(
            engine.admit(&bob),
            Err(SyncError::PermissionDenied { .. })
        ));
        drop(guard);
        assert!(!engine.is_active(&bob));
        assert!(engine.admit(&bob).is_ok());
    }

    #[test]
    fn test_window_start_clamps_stale_cursor() {
        let mut state = EngineState::fresh(&EngineConfig::default());
        state.era = Era::new(5);
        state.oldest_era = Era::new(2);
        let bob = PeerId::from("bob");

        assert_eq!(state.window_start(&bob), Era::new(2));
        state.last_seen.insert(bob.clone(), Era::new(4));
        assert_eq!(state.window_start(&bob), Era::new(4));
        state.last_seen.insert(bob.clone(), Era::new(9));
        assert_eq!(state.window_start(&bob), Era::new(2));
    }
}
