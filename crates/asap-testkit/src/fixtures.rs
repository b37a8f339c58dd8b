//! Test fixtures for common scenarios.

use std::sync::{Arc, Once};

use tempfile::TempDir;

use asap::{MultiEngine, MultiEngineConfig, SyncEngine, SyncReport};
use asap_core::{PeerId, MANAGEMENT_FORMAT};
use asap_sync::transport::memory;
use asap_sync::EngineConfig;

static TRACING: Once = Once::new();

/// Install a tracing subscriber that writes through the test harness.
///
/// Honors `RUST_LOG`; safe to call from every test.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".into()),
            )
            .with_test_writer()
            .try_init();
    });
}

/// A peer running a [`MultiEngine`].
pub struct TestPeer {
    pub id: PeerId,
    pub engine: MultiEngine,
    /// Keeps on-disk storage alive for the peer's lifetime.
    dir: Option<TempDir>,
}

impl TestPeer {
    /// Peer with in-memory storage.
    pub fn memory(name: &str, formats: &[&str]) -> Self {
        Self::with_config(name, formats, EngineConfig::default(), None)
    }

    /// Peer with storage in a fresh temporary directory.
    pub fn on_disk(name: &str, formats: &[&str]) -> Self {
        let dir = TempDir::new().expect("create temp dir");
        Self::with_config(name, formats, EngineConfig::default(), Some(dir))
    }

    /// Peer with a custom engine configuration.
    pub fn with_config(
        name: &str,
        formats: &[&str],
        engine: EngineConfig,
        dir: Option<TempDir>,
    ) -> Self {
        init_tracing();
        let id = PeerId::from(name);
        let mut config = MultiEngineConfig::new(id.clone())
            .with_formats(formats.iter().copied())
            .with_engine_config(engine);
        if let Some(dir) = &dir {
            config = config.with_fs_root(dir.path());
        }
        let engine = MultiEngine::new(config).expect("open multi engine");
        Self { id, engine, dir }
    }

    /// Engine of `format`, opened if needed.
    pub fn format(&self, format: &str) -> Arc<SyncEngine> {
        self.engine
            .engine_or_create(format)
            .expect("open format engine")
    }

    /// Shorthand for the `chat` engine.
    pub fn chat(&self) -> Arc<SyncEngine> {
        self.format("chat")
    }

    pub fn is_on_disk(&self) -> bool {
        self.dir.is_some()
    }

    /// Close the engines and open them again over the same storage.
    pub fn restart(self) -> Self {
        let formats: Vec<String> = self
            .engine
            .formats()
            .into_iter()
            .filter(|f| f != MANAGEMENT_FORMAT)
            .collect();
        let formats: Vec<&str> = formats.iter().map(String::as_str).collect();
        let TestPeer { id, engine, dir } = self;
        drop(engine);
        Self::with_config(id.as_str(), &formats, EngineConfig::default(), dir)
    }

    /// Messages of `uri` in the incoming storage for `sender`, over the
    /// first `eras` eras, as strings.
    pub fn received(&self, format: &str, sender: &str, uri: &str, eras: u32) -> Vec<String> {
        let storage = self
            .format(format)
            .incoming_storage(&PeerId::from(sender))
            .expect("incoming storage");
        let mut out = Vec::new();
        for era in 0..eras {
            if let Some(chunk) = storage
                .existing_chunk(uri, era.into())
                .expect("read chunk")
            {
                for message in chunk.messages().expect("read messages") {
                    out.push(String::from_utf8_lossy(&message).into_owned());
                }
            }
        }
        out
    }
}

/// Run one exchange between two peers over an in-memory connection.
pub async fn exchange(a: &TestPeer, b: &TestPeer) -> (SyncReport, SyncReport) {
    let (left, right) = memory::pair();
    let (ra, rb) = tokio::join!(
        a.engine.handle_connection(&left),
        b.engine.handle_connection(&right)
    );
    (
        ra.expect("exchange on first peer"),
        rb.expect("exchange on second peer"),
    )
}

/// Run one exchange between two single-format engines.
pub async fn exchange_engines(a: &SyncEngine, b: &SyncEngine) -> (SyncReport, SyncReport) {
    let (left, right) = memory::pair();
    let (ra, rb) = tokio::join!(a.handle_connection(&left), b.handle_connection(&right));
    (
        ra.expect("exchange on first engine"),
        rb.expect("exchange on second engine"),
    )
}
