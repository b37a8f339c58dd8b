//! Chunks: the messages of one channel within one era.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;
use std::sync::Arc;

use asap_core::{Era, PeerId};

use crate::error::{Result, StoreError};
use crate::traits::ChunkStore;

/// Persistent metadata of a chunk.
///
/// `offsets` holds the start positions of messages 2..n; message 1 always
/// starts at zero, and the last message ends at `length`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMeta {
    pub uri: String,
    pub era: Era,
    pub owner: Option<PeerId>,
    /// Empty means public.
    pub recipients: BTreeSet<PeerId>,
    pub extra: BTreeMap<String, String>,
    pub delivered_to: BTreeSet<PeerId>,
    pub offsets: Vec<u64>,
    pub length: u64,
    pub message_count: u64,
}

impl ChunkMeta {
    /// Metadata of a fresh, empty, public chunk.
    pub fn new(uri: impl Into<String>, era: Era) -> Self {
        Self {
            uri: uri.into(),
            era,
            owner: None,
            recipients: BTreeSet::new(),
            extra: BTreeMap::new(),
            delivered_to: BTreeSet::new(),
            offsets: Vec::new(),
            length: 0,
            message_count: 0,
        }
    }
}

/// Channel-level metadata, copied onto chunks that continue a channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub uri: String,
    pub owner: Option<PeerId>,
    pub recipients: BTreeSet<PeerId>,
    pub extra: BTreeMap<String, String>,
}

/// Handle to one chunk in a [`ChunkStore`].
///
/// Every mutating method applies its change to the stored record through
/// [`ChunkStore::update_meta`] and then refreshes the handle, so changes made
/// through other handles in the meantime are kept. Read accessors return the
/// state as of the handle's last fetch or mutation.
pub struct Chunk {
    store: Arc<dyn ChunkStore>,
    meta: ChunkMeta,
}

impl Chunk {
    pub(crate) fn new(store: Arc<dyn ChunkStore>, meta: ChunkMeta) -> Self {
        Self { store, meta }
    }

    pub fn uri(&self) -> &str {
        &self.meta.uri
    }

    pub fn era(&self) -> Era {
        self.meta.era
    }

    pub fn meta(&self) -> &ChunkMeta {
        &self.meta
    }

    /// Content length in bytes.
    pub fn len(&self) -> u64 {
        self.meta.length
    }

    pub fn is_empty(&self) -> bool {
        self.meta.length == 0
    }

    pub fn message_count(&self) -> usize {
        self.meta.message_count as usize
    }

    pub fn offsets(&self) -> &[u64] {
        &self.meta.offsets
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Messages
    // ─────────────────────────────────────────────────────────────────────────

    /// Append one message.
    pub fn add_message(&mut self, message: &[u8]) -> Result<()> {
        self.update(|store, meta| {
            store.write_content(&meta.uri, meta.era, meta.length, message)?;
            if meta.message_count > 0 {
                meta.offsets.push(meta.length);
            }
            meta.length += message.len() as u64;
            meta.message_count += 1;
            Ok(())
        })
    }

    /// Append one message of exactly `len` bytes read from `reader`.
    pub fn add_message_from<R: Read>(&mut self, reader: &mut R, len: u64) -> Result<()> {
        let mut buf = Vec::with_capacity(len as usize);
        let read = reader.take(len).read_to_end(&mut buf)?;
        if (read as u64) < len {
            return Err(StoreError::InvalidData(format!(
                "message stream ended after {read} of {len} bytes"
            )));
        }
        self.add_message(&buf)
    }

    /// Append a block of messages given as raw content plus the start
    /// positions of messages 2..n within it.
    pub fn add_messages(&mut self, content: &[u8], offsets: &[u64]) -> Result<()> {
        validate_offsets(offsets, content.len() as u64)?;
        self.update(|store, meta| {
            let base = meta.length;
            store.write_content(&meta.uri, meta.era, base, content)?;
            if meta.message_count > 0 {
                meta.offsets.push(base);
            }
            meta.offsets.extend(offsets.iter().map(|o| base + o));
            meta.length += content.len() as u64;
            meta.message_count += offsets.len() as u64 + 1;
            Ok(())
        })
    }

    /// The chunk content, cut to the recorded length.
    pub fn content(&self) -> Result<Bytes> {
        let stored = self.store.read_content(&self.meta.uri, self.meta.era)?;
        let length = self.meta.length as usize;
        if stored.len() < length {
            return Err(StoreError::InvalidData(format!(
                "chunk {} in era {} has {} content bytes, expected {}",
                self.meta.uri,
                self.meta.era,
                stored.len(),
                length
            )));
        }
        Ok(stored.slice(..length))
    }

    /// Iterate the messages in insertion order.
    ///
    /// The iterator owns a snapshot of the content; call again to restart.
    pub fn messages(&self) -> Result<Messages> {
        if self.meta.message_count == 0 {
            return Ok(Messages::empty());
        }
        Ok(Messages::new(
            self.content()?,
            &self.meta.offsets,
            self.meta.length,
        ))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Recipients and channel metadata
    // ─────────────────────────────────────────────────────────────────────────

    pub fn recipients(&self) -> &BTreeSet<PeerId> {
        &self.meta.recipients
    }

    pub fn set_recipients(&mut self, recipients: BTreeSet<PeerId>) -> Result<()> {
        self.update(|_, meta| {
            meta.recipients = recipients.clone();
            Ok(())
        })
    }

    pub fn add_recipient(&mut self, peer: PeerId) -> Result<()> {
        self.update(|_, meta| {
            meta.recipients.insert(peer.clone());
            Ok(())
        })
    }

    /// Remove a recipient. Returns whether it was present.
    pub fn remove_recipient(&mut self, peer: &PeerId) -> Result<bool> {
        let mut removed = false;
        self.update(|_, meta| {
            removed = meta.recipients.remove(peer);
            Ok(())
        })?;
        Ok(removed)
    }

    /// A chunk without recipients may go to anyone.
    pub fn is_public(&self) -> bool {
        self.meta.recipients.is_empty()
    }

    pub fn owner(&self) -> Option<&PeerId> {
        self.meta.owner.as_ref()
    }

    pub fn set_owner(&mut self, owner: Option<PeerId>) -> Result<()> {
        self.update(|_, meta| {
            meta.owner = owner.clone();
            Ok(())
        })
    }

    pub fn extra(&self, key: &str) -> Option<&str> {
        self.meta.extra.get(key).map(String::as_str)
    }

    pub fn put_extra(&mut self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        let (key, value) = (key.into(), value.into());
        self.update(|_, meta| {
            meta.extra.insert(key.clone(), value.clone());
            Ok(())
        })
    }

    pub fn remove_extra(&mut self, key: &str) -> Result<Option<String>> {
        let mut removed = None;
        self.update(|_, meta| {
            removed = meta.extra.remove(key);
            Ok(())
        })?;
        Ok(removed)
    }

    /// Snapshot of the channel-level metadata.
    pub fn channel_info(&self) -> ChannelInfo {
        ChannelInfo {
            uri: self.meta.uri.clone(),
            owner: self.meta.owner.clone(),
            recipients: self.meta.recipients.clone(),
            extra: self.meta.extra.clone(),
        }
    }

    /// Overwrite owner, recipients and extra with those of `channel`.
    pub fn copy_metadata(&mut self, channel: &ChannelInfo) -> Result<()> {
        self.update(|_, meta| {
            meta.owner = channel.owner.clone();
            meta.recipients = channel.recipients.clone();
            meta.extra = channel.extra.clone();
            Ok(())
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Delivery
    // ─────────────────────────────────────────────────────────────────────────

    /// Record delivery to `peer`. Idempotent.
    ///
    /// Fails with [`StoreError::NotFound`] if the chunk was removed since
    /// this handle was fetched.
    pub fn delivered_to(&mut self, peer: &PeerId) -> Result<()> {
        self.update(|_, meta| {
            meta.delivered_to.insert(peer.clone());
            Ok(())
        })
    }

    pub fn delivered(&self) -> &BTreeSet<PeerId> {
        &self.meta.delivered_to
    }

    /// Every recipient has received the chunk. Public chunks never are.
    pub fn is_fully_delivered(&self) -> bool {
        !self.meta.recipients.is_empty()
            && self.meta.recipients.is_subset(&self.meta.delivered_to)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Replace this chunk's content and channel metadata with `source`'s.
    ///
    /// Delivery records are not copied; the clone has reached nobody yet.
    pub fn clone_from_chunk(&mut self, source: &Chunk) -> Result<()> {
        let content = source.content()?;
        let from = &source.meta;
        self.update(|store, meta| {
            store.write_content(&meta.uri, meta.era, 0, &content)?;
            meta.offsets = from.offsets.clone();
            meta.length = from.length;
            meta.message_count = from.message_count;
            meta.owner = from.owner.clone();
            meta.recipients = from.recipients.clone();
            meta.extra = from.extra.clone();
            Ok(())
        })
    }

    /// Delete the chunk from its store.
    pub fn remove(self) -> Result<()> {
        self.store.remove_chunk(&self.meta.uri, self.meta.era)
    }

    /// Re-read the stored record.
    pub fn reload(&mut self) -> Result<()> {
        self.meta = self
            .store
            .read_meta(&self.meta.uri, self.meta.era)?
            .ok_or_else(|| {
                StoreError::NotFound(format!("chunk {} in era {}", self.meta.uri, self.meta.era))
            })?;
        Ok(())
    }

    fn update<F>(&mut self, mut apply: F) -> Result<()>
    where
        F: FnMut(&dyn ChunkStore, &mut ChunkMeta) -> Result<()>,
    {
        let store = Arc::clone(&self.store);
        self.meta = store.update_meta(&self.meta.uri, self.meta.era, &mut |meta| {
            apply(store.as_ref(), meta)
        })?;
        Ok(())
    }
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("uri", &self.meta.uri)
            .field("era", &self.meta.era)
            .field("length", &self.meta.length)
            .field("messages", &self.meta.message_count)
            .finish()
    }
}

/// Offsets must be non-decreasing and within `length`. Equal neighbours
/// delimit an empty message.
pub fn validate_offsets(offsets: &[u64], length: u64) -> Result<()> {
    let mut previous = 0;
    for &offset in offsets {
        if offset < previous {
            return Err(StoreError::InvalidData(format!(
                "offset {offset} does not follow {previous}"
            )));
        }
        if offset > length {
            return Err(StoreError::InvalidData(format!(
                "offset {offset} beyond content length {length}"
            )));
        }
        previous = offset;
    }
    Ok(())
}

/// Iterator over the messages of a chunk.
#[derive(Debug, Clone)]
pub struct Messages {
    content: Bytes,
    bounds: std::vec::IntoIter<(usize, usize)>,
}

impl Messages {
    fn empty() -> Self {
        Self {
            content: Bytes::new(),
            bounds: Vec::new().into_iter(),
        }
    }

    fn new(content: Bytes, offsets: &[u64], length: u64) -> Self {
        let starts = std::iter::once(0).chain(offsets.iter().copied());
        let ends = offsets.iter().copied().chain(std::iter::once(length));
        let bounds: Vec<(usize, usize)> = starts
            .zip(ends)
            .map(|(start, end)| (start as usize, end as usize))
            .collect();
        Self {
            content,
            bounds: bounds.into_iter(),
        }
    }
}

impl Iterator for Messages {
    type Item = Bytes;

    fn next(&mut self) -> Option<Bytes> {
        let (start, end) = self.bounds.next()?;
        Some(self.content.slice(start..end))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.bounds.size_hint()
    }
}

impl ExactSizeIterator for Messages {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryChunkStore;

    fn fresh(uri: &str) -> Chunk {
        let store: Arc<dyn ChunkStore> = Arc::new(MemoryChunkStore::new());
        let meta = ChunkMeta::new(uri, Era::ZERO);
        store.write_meta(&meta).unwrap();
        Chunk::new(store, meta)
    }

    fn collect(chunk: &Chunk) -> Vec<Vec<u8>> {
        chunk.messages().unwrap().map(|m| m.to_vec()).collect()
    }

    #[test]
    fn test_messages_in_order() {
        let mut chunk = fresh("sn2://a");
        chunk.add_message(b"one").unwrap();
        chunk.add_message(b"two").unwrap();
        chunk.add_message(b"three").unwrap();

        assert_eq!(chunk.offsets(), &[3, 6]);
        assert_eq!(chunk.len(), 11);
        assert_eq!(
            collect(&chunk),
            vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]
        );
    }

    #[test]
    fn test_empty_message_kept() {
        let mut chunk = fresh("sn2://a");
        chunk.add_message(b"a").unwrap();
        chunk.add_message(b"").unwrap();
        chunk.add_message(b"b").unwrap();
        assert_eq!(chunk.offsets(), &[1, 1]);
        assert_eq!(collect(&chunk), vec![b"a".to_vec(), vec![], b"b".to_vec()]);
    }

    #[test]
    fn test_messages_restartable() {
        let mut chunk = fresh("sn2://a");
        chunk.add_message(b"x").unwrap();
        assert_eq!(chunk.messages().unwrap().count(), 1);
        assert_eq!(chunk.messages().unwrap().count(), 1);
    }

    #[test]
    fn test_empty_chunk_has_no_messages() {
        let chunk = fresh("sn2://a");
        assert!(chunk.is_empty());
        assert_eq!(chunk.messages().unwrap().len(), 0);
    }

    #[test]
    fn test_add_message_from_reader() {
        let mut chunk = fresh("sn2://a");
        let mut source: &[u8] = b"abcdef";
        chunk.add_message_from(&mut source, 4).unwrap();
        assert_eq!(collect(&chunk), vec![b"abcd".to_vec()]);

        let mut short: &[u8] = b"ab";
        assert!(chunk.add_message_from(&mut short, 4).is_err());
    }

    #[test]
    fn test_add_messages_block() {
        let mut chunk = fresh("sn2://a");
        chunk.add_message(b"aa").unwrap();
        chunk.add_messages(b"bbccc", &[2]).unwrap();
        assert_eq!(chunk.offsets(), &[2, 4]);
        assert_eq!(
            collect(&chunk),
            vec![b"aa".to_vec(), b"bb".to_vec(), b"ccc".to_vec()]
        );
    }

    #[test]
    fn test_add_messages_rejects_bad_offsets() {
        let mut chunk = fresh("sn2://a");
        assert!(chunk.add_messages(b"abc", &[2, 1]).is_err());
        assert!(chunk.add_messages(b"abc", &[4]).is_err());
        assert_eq!(chunk.message_count(), 0);
    }

    #[test]
    fn test_delivery_bookkeeping() {
        let mut chunk = fresh("sn2://a");
        assert!(chunk.is_public());
        assert!(!chunk.is_fully_delivered());

        chunk.add_recipient(PeerId::from("bob")).unwrap();
        chunk.add_recipient(PeerId::from("carol")).unwrap();
        assert!(!chunk.is_public());

        chunk.delivered_to(&PeerId::from("bob")).unwrap();
        chunk.delivered_to(&PeerId::from("bob")).unwrap();
        assert_eq!(chunk.delivered().len(), 1);
        assert!(!chunk.is_fully_delivered());

        chunk.delivered_to(&PeerId::from("carol")).unwrap();
        assert!(chunk.is_fully_delivered());
    }

    #[test]
    fn test_public_chunk_never_fully_delivered() {
        let mut chunk = fresh("sn2://a");
        chunk.delivered_to(&PeerId::from("bob")).unwrap();
        assert!(!chunk.is_fully_delivered());
    }

    #[test]
    fn test_remove_recipient() {
        let mut chunk = fresh("sn2://a");
        chunk.add_recipient(PeerId::from("bob")).unwrap();
        assert!(chunk.remove_recipient(&PeerId::from("bob")).unwrap());
        assert!(!chunk.remove_recipient(&PeerId::from("bob")).unwrap());
        assert!(chunk.is_public());
    }

    #[test]
    fn test_extra_values() {
        let mut chunk = fresh("sn2://a");
        chunk.put_extra("topic", "lunch").unwrap();
        assert_eq!(chunk.extra("topic"), Some("lunch"));
        assert_eq!(chunk.remove_extra("topic").unwrap().as_deref(), Some("lunch"));
        assert_eq!(chunk.extra("topic"), None);
    }

    #[test]
    fn test_clone_copies_content_and_channel_metadata() {
        let mut source = fresh("sn2://a");
        source.add_message(b"hi").unwrap();
        source.add_message(b"there").unwrap();
        source.add_recipient(PeerId::from("bob")).unwrap();
        source.set_owner(Some(PeerId::from("alice"))).unwrap();
        source.delivered_to(&PeerId::from("bob")).unwrap();

        let mut target = fresh("sn2://a");
        target.clone_from_chunk(&source).unwrap();

        assert_eq!(collect(&target), collect(&source));
        assert_eq!(target.recipients(), source.recipients());
        assert_eq!(target.owner(), Some(&PeerId::from("alice")));
        assert!(target.delivered().is_empty());
    }

    #[test]
    fn test_copy_metadata() {
        let mut chunk = fresh("sn2://a");
        let info = ChannelInfo {
            uri: "sn2://a".into(),
            owner: Some(PeerId::from("alice")),
            recipients: [PeerId::from("bob")].into_iter().collect(),
            extra: BTreeMap::new(),
        };
        chunk.copy_metadata(&info).unwrap();
        assert_eq!(chunk.channel_info(), info);
    }

    #[test]
    fn test_torn_append_ignored() {
        let store: Arc<dyn ChunkStore> = Arc::new(MemoryChunkStore::new());
        let meta = ChunkMeta::new("sn2://a", Era::ZERO);
        store.write_meta(&meta).unwrap();
        let mut chunk = Chunk::new(store.clone(), meta);
        chunk.add_message(b"ok").unwrap();

        // Content written without a matching metadata update.
        store.write_content("sn2://a", Era::ZERO, 2, b"garbage").unwrap();
        assert_eq!(collect(&chunk), vec![b"ok".to_vec()]);

        chunk.add_message(b"next").unwrap();
        assert_eq!(collect(&chunk), vec![b"ok".to_vec(), b"next".to_vec()]);
    }

    fn two_handles(uri: &str) -> (Chunk, Chunk) {
        let store: Arc<dyn ChunkStore> = Arc::new(MemoryChunkStore::new());
        let meta = store.create_meta(ChunkMeta::new(uri, Era::ZERO)).unwrap();
        (Chunk::new(store.clone(), meta.clone()), Chunk::new(store, meta))
    }

    #[test]
    fn test_stale_handle_keeps_other_appends() {
        let (mut first, mut second) = two_handles("sn2://a");
        first.add_message(b"one").unwrap();

        // `second` was fetched before the append and still sees no content.
        assert!(second.is_empty());
        second.delivered_to(&PeerId::from("carol")).unwrap();
        second.add_message(b"two").unwrap();

        first.reload().unwrap();
        assert_eq!(collect(&first), vec![b"one".to_vec(), b"two".to_vec()]);
        assert!(first.delivered().contains("carol"));
    }

    #[test]
    fn test_deliveries_through_separate_handles_accumulate() {
        let (mut to_bob, mut to_carol) = two_handles("sn2://a");
        to_bob
            .set_recipients([PeerId::from("bob"), PeerId::from("carol")].into())
            .unwrap();
        to_carol.reload().unwrap();

        to_carol.delivered_to(&PeerId::from("carol")).unwrap();
        assert!(!to_carol.is_fully_delivered());
        to_bob.delivered_to(&PeerId::from("bob")).unwrap();
        assert!(to_bob.is_fully_delivered());
    }

    #[test]
    fn test_update_after_remove_fails() {
        let (first, mut second) = two_handles("sn2://a");
        first.remove().unwrap();
        assert!(matches!(
            second.delivered_to(&PeerId::from("bob")),
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(second.reload(), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_create_meta_keeps_existing() {
        let store = MemoryChunkStore::new();
        let mut meta = ChunkMeta::new("sn2://a", Era::ZERO);
        meta.length = 3;
        store.write_meta(&meta).unwrap();
        let stored = store.create_meta(ChunkMeta::new("sn2://a", Era::ZERO)).unwrap();
        assert_eq!(stored.length, 3);
    }

    #[test]
    fn test_validate_offsets() {
        assert!(validate_offsets(&[], 0).is_ok());
        assert!(validate_offsets(&[1, 2, 3], 3).is_ok());
        assert!(validate_offsets(&[2, 2], 3).is_ok());
        assert!(validate_offsets(&[2, 1], 3).is_err());
        assert!(validate_offsets(&[4], 3).is_err());
    }
}
