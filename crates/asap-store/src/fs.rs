//! Filesystem implementation of the ChunkStore trait.
//!
//! Layout under a store root:
//!
//! ```text
//! <root>/<era>/<escaped uri>.content   message bytes, concatenated
//! <root>/<era>/<escaped uri>.meta      CBOR-encoded ChunkMeta
//! ```
//!
//! A [`FsStorageProvider`] keeps its local store at `<root>` and one store per
//! sender at `<root>/incoming/<escaped sender>`.

use bytes::Bytes;
use std::fs::{self, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::trace;

use asap_core::{Era, PeerId};

use crate::chunk::ChunkMeta;
use crate::error::{Result, StoreError};
use crate::storage::ChunkStorage;
use crate::traits::{ChunkStore, StorageProvider};

const CONTENT_SUFFIX: &str = ".content";
const META_SUFFIX: &str = ".meta";
const TMP_SUFFIX: &str = ".tmp";
const INCOMING_DIR: &str = "incoming";

/// Characters that cannot appear in a file name, with their escapes.
/// `%` comes first so escaping stays reversible.
const ESCAPES: [(char, &str); 9] = [
    ('%', "%25"),
    ('\\', "%5C"),
    ('/', "%2F"),
    (':', "%3A"),
    ('?', "%3F"),
    ('"', "%22"),
    ('<', "%3C"),
    ('>', "%3E"),
    ('|', "%7C"),
];

/// Escape a URI (or peer id) into a single path component.
pub fn escape_uri(uri: &str) -> String {
    let mut out = String::with_capacity(uri.len());
    for c in uri.chars() {
        match ESCAPES.iter().find(|(raw, _)| *raw == c) {
            Some((_, escaped)) => out.push_str(escaped),
            None => out.push(c),
        }
    }
    out
}

/// Reverse of [`escape_uri`]. Unknown `%` sequences are kept as they are.
pub fn unescape_uri(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut rest = name;
    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        match ESCAPES
            .iter()
            .find(|(_, escaped)| tail.len() >= 3 && tail[..3].eq_ignore_ascii_case(escaped))
        {
            Some((raw, _)) => {
                out.push(*raw);
                rest = &tail[3..];
            }
            None => {
                out.push('%');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Chunk store rooted at a directory.
pub struct FsChunkStore {
    root: PathBuf,
    updates: Mutex<()>,
}

impl FsChunkStore {
    /// Store rooted at `root`. Directories are created on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            updates: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn era_dir(&self, era: Era) -> PathBuf {
        self.root.join(era.to_string())
    }

    fn file(&self, uri: &str, era: Era, suffix: &str) -> PathBuf {
        self.era_dir(era).join(format!("{}{}", escape_uri(uri), suffix))
    }
}

fn not_found_as<T>(result: io::Result<T>, fallback: T) -> Result<T> {
    match result {
        Ok(value) => Ok(value),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(fallback),
        Err(e) => Err(e.into()),
    }
}

impl ChunkStore for FsChunkStore {
    fn read_meta(&self, uri: &str, era: Era) -> Result<Option<ChunkMeta>> {
        let path = self.file(uri, era, META_SUFFIX);
        let Some(raw) = not_found_as(fs::read(&path).map(Some), None)? else {
            return Ok(None);
        };
        let meta: ChunkMeta = ciborium::from_reader(raw.as_slice())
            .map_err(|e| StoreError::Serialization(format!("{}: {e}", path.display())))?;
        Ok(Some(meta))
    }

    fn update_lock(&self) -> &Mutex<()> {
        &self.updates
    }

    fn write_meta(&self, meta: &ChunkMeta) -> Result<()> {
        let dir = self.era_dir(meta.era);
        fs::create_dir_all(&dir)?;

        let mut raw = Vec::new();
        ciborium::into_writer(meta, &mut raw)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let path = self.file(&meta.uri, meta.era, META_SUFFIX);
        let tmp = self.file(&meta.uri, meta.era, &format!("{META_SUFFIX}{TMP_SUFFIX}"));
        fs::write(&tmp, &raw)?;
        fs::rename(&tmp, &path)?;
        trace!(path = %path.display(), "wrote chunk metadata");
        Ok(())
    }

    fn write_content(&self, uri: &str, era: Era, offset: u64, bytes: &[u8]) -> Result<()> {
        fs::create_dir_all(self.era_dir(era))?;
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(self.file(uri, era, CONTENT_SUFFIX))?;
        file.set_len(offset)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(bytes)?;
        file.flush()?;
        Ok(())
    }

    fn read_content(&self, uri: &str, era: Era) -> Result<Bytes> {
        let raw = not_found_as(fs::read(self.file(uri, era, CONTENT_SUFFIX)), Vec::new())?;
        Ok(Bytes::from(raw))
    }

    fn remove_chunk(&self, uri: &str, era: Era) -> Result<()> {
        let _guard = self.updates.lock().unwrap_or_else(PoisonError::into_inner);
        not_found_as(fs::remove_file(self.file(uri, era, META_SUFFIX)), ())?;
        not_found_as(fs::remove_file(self.file(uri, era, CONTENT_SUFFIX)), ())?;
        Ok(())
    }

    fn list_uris(&self, era: Era) -> Result<Vec<String>> {
        let entries = match fs::read_dir(self.era_dir(era)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut uris = Vec::new();
        for entry in entries {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(stem) = name.strip_suffix(META_SUFFIX) {
                uris.push(unescape_uri(stem));
            }
        }
        Ok(uris)
    }

    fn remove_era(&self, era: Era) -> Result<()> {
        let _guard = self.updates.lock().unwrap_or_else(PoisonError::into_inner);
        not_found_as(fs::remove_dir_all(self.era_dir(era)), ())
    }
}

/// Filesystem storage provider.
///
/// Incoming storages are opened once per sender and shared afterwards, so
/// every handle to a sender's data uses the same update lock.
pub struct FsStorageProvider {
    root: PathBuf,
    local: ChunkStorage,
    incoming: RwLock<BTreeMap<PeerId, ChunkStorage>>,
}

impl FsStorageProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let local = ChunkStorage::new(Arc::new(FsChunkStore::new(root.clone())));
        Self {
            root,
            local,
            incoming: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn incoming_root(&self) -> PathBuf {
        self.root.join(INCOMING_DIR)
    }
}

impl StorageProvider for FsStorageProvider {
    fn local(&self) -> Result<ChunkStorage> {
        Ok(self.local.clone())
    }

    fn incoming(&self, sender: &PeerId) -> Result<ChunkStorage> {
        if let Some(storage) = self
            .incoming
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(sender)
        {
            return Ok(storage.clone());
        }
        let mut incoming = self.incoming.write().unwrap_or_else(PoisonError::into_inner);
        let root = self.incoming_root().join(escape_uri(sender.as_str()));
        Ok(incoming
            .entry(sender.clone())
            .or_insert_with(|| ChunkStorage::new(Arc::new(FsChunkStore::new(root))))
            .clone())
    }

    fn senders(&self) -> Result<Vec<PeerId>> {
        let entries = match fs::read_dir(self.incoming_root()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut senders = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                senders.push(PeerId::from(unescape_uri(name)));
            }
        }
        senders.sort();
        Ok(senders)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    #[test]
    fn test_escape_uri() {
        assert_eq!(
            escape_uri("sn2://chat/a?b"),
            "sn2%3A%2F%2Fchat%2Fa%3Fb"
        );
        assert_eq!(escape_uri(r#"a\b"c<d>e|f"#), "a%5Cb%22c%3Cd%3Ee%7Cf");
        assert_eq!(escape_uri("100%"), "100%25");
    }

    #[test]
    fn test_unescape_keeps_unknown_sequences() {
        assert_eq!(unescape_uri("a%20b%"), "a%20b%");
        assert_eq!(unescape_uri("a%2fb"), "a/b");
    }

    proptest! {
        #[test]
        fn prop_escape_reversible(uri in "[a-z:/?%<>|\"\\\\]{0,24}") {
            let escaped = escape_uri(&uri);
            prop_assert!(!escaped.contains('/'));
            prop_assert_eq!(unescape_uri(&escaped), uri);
        }
    }

    #[test]
    fn test_layout_on_disk() {
        let dir = TempDir::new().unwrap();
        let storage = ChunkStorage::new(Arc::new(FsChunkStore::new(dir.path())));

        let mut chunk = storage.get_chunk("sn2://chat", Era::new(7)).unwrap();
        chunk.add_message(b"hello").unwrap();

        let era_dir = dir.path().join("7");
        assert!(era_dir.join("sn2%3A%2F%2Fchat.meta").is_file());
        assert_eq!(
            fs::read(era_dir.join("sn2%3A%2F%2Fchat.content")).unwrap(),
            b"hello"
        );
    }

    #[test]
    fn test_reopen_reads_persisted_chunk() {
        let dir = TempDir::new().unwrap();
        {
            let storage = ChunkStorage::new(Arc::new(FsChunkStore::new(dir.path())));
            let mut chunk = storage.get_chunk("sn2://a", Era::new(1)).unwrap();
            chunk.add_message(b"one").unwrap();
            chunk.add_message(b"two").unwrap();
            chunk.add_recipient(PeerId::from("bob")).unwrap();
        }

        let storage = ChunkStorage::new(Arc::new(FsChunkStore::new(dir.path())));
        let chunk = storage.existing_chunk("sn2://a", Era::new(1)).unwrap().unwrap();
        let messages: Vec<_> = chunk.messages().unwrap().collect();
        assert_eq!(messages.len(), 2);
        assert_eq!(&messages[1][..], b"two");
        assert!(chunk.recipients().contains("bob"));
        assert_eq!(
            storage.get_chunks(Era::new(1)).unwrap()[0].uri(),
            "sn2://a"
        );
    }

    #[test]
    fn test_drop_era_removes_directory() {
        let dir = TempDir::new().unwrap();
        let storage = ChunkStorage::new(Arc::new(FsChunkStore::new(dir.path())));
        storage.get_chunk("sn2://a", Era::new(3)).unwrap();
        assert!(dir.path().join("3").is_dir());

        storage.drop_chunks(Era::new(3)).unwrap();
        assert!(!dir.path().join("3").exists());
        storage.drop_chunks(Era::new(3)).unwrap();
    }

    #[test]
    fn test_missing_reads_are_empty() {
        let dir = TempDir::new().unwrap();
        let store = FsChunkStore::new(dir.path().join("never-created"));
        assert!(store.read_meta("a", Era::ZERO).unwrap().is_none());
        assert!(store.read_content("a", Era::ZERO).unwrap().is_empty());
        assert!(store.list_uris(Era::ZERO).unwrap().is_empty());
        store.remove_chunk("a", Era::ZERO).unwrap();
    }

    #[test]
    fn test_provider_layout() {
        let dir = TempDir::new().unwrap();
        let provider = FsStorageProvider::new(dir.path());
        assert!(provider.senders().unwrap().is_empty());

        let bob = PeerId::from("bob:1");
        provider
            .incoming(&bob)
            .unwrap()
            .get_chunk("sn2://a", Era::ZERO)
            .unwrap();
        provider
            .local()
            .unwrap()
            .get_chunk("sn2://a", Era::ZERO)
            .unwrap();

        assert!(dir.path().join("incoming").join("bob%3A1").join("0").is_dir());
        assert!(dir.path().join("0").is_dir());
        assert_eq!(provider.senders().unwrap(), vec![bob]);
    }
}
