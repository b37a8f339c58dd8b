//! The MultiEngine: one peer, many application formats, one connection.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{info, instrument, warn};

use asap_core::{PeerId, MANAGEMENT_FORMAT};
use asap_sync::{
    ChunkReceivedListener, Connection, InterestPdu, ListenerId, Listeners, Pdu, SyncEngine,
    SyncError, SyncReport,
};

use crate::config::MultiEngineConfig;
use crate::error::{EngineError, Result};
use crate::management::ManagementHandler;
use crate::registry::EngineRegistry;

/// Notified whenever the set of connected peers changes.
pub trait OnlinePeersListener: Send + Sync {
    fn online_peers_changed(&self, peers: &BTreeSet<PeerId>) -> anyhow::Result<()>;
}

impl<F> OnlinePeersListener for F
where
    F: Fn(&BTreeSet<PeerId>) -> anyhow::Result<()> + Send + Sync,
{
    fn online_peers_changed(&self, peers: &BTreeSet<PeerId>) -> anyhow::Result<()> {
        self(peers)
    }
}

/// Routes connections and messages to one [`SyncEngine`] per format.
pub struct MultiEngine {
    owner: PeerId,
    registry: Arc<EngineRegistry>,
    management: Option<Arc<ManagementHandler>>,
    /// Peer → number of open connections.
    online: Mutex<BTreeMap<PeerId, usize>>,
    online_listeners: Listeners<dyn OnlinePeersListener>,
}

impl MultiEngine {
    /// Open every configured format and, if enabled, the management engine.
    pub fn new(config: MultiEngineConfig) -> Result<Self> {
        let registry = Arc::new(EngineRegistry::new(
            config.owner.clone(),
            config.storage.clone(),
            config.engine.clone(),
        ));

        let management = if config.management {
            let handler = Arc::new(ManagementHandler::new(Arc::downgrade(&registry)));
            registry.set_channel_created_listener(handler.clone());
            registry
                .get_or_create(MANAGEMENT_FORMAT)?
                .attach_chunk_received_listener(handler.clone());
            Some(handler)
        } else {
            None
        };

        for format in &config.formats {
            registry.get_or_create(format)?;
        }
        info!(owner = %config.owner, formats = ?registry.formats(), "multi engine ready");

        Ok(Self {
            owner: config.owner,
            registry,
            management,
            online: Mutex::new(BTreeMap::new()),
            online_listeners: Listeners::new(),
        })
    }

    pub fn owner(&self) -> &PeerId {
        &self.owner
    }

    /// Registered formats, the management format included.
    pub fn formats(&self) -> Vec<String> {
        self.registry.formats()
    }

    /// Engine of `format`; [`EngineError::UnknownFormat`] if none is open.
    pub fn engine(&self, format: &str) -> Result<Arc<SyncEngine>> {
        self.registry
            .get(format)
            .ok_or_else(|| EngineError::UnknownFormat(format.to_string()))
    }

    pub fn engine_or_create(&self, format: &str) -> Result<Arc<SyncEngine>> {
        self.registry.get_or_create(format)
    }

    pub fn registry(&self) -> &Arc<EngineRegistry> {
        &self.registry
    }

    pub fn is_management_running(&self) -> bool {
        self.management.is_some()
    }

    pub fn management(&self) -> Option<&Arc<ManagementHandler>> {
        self.management.as_ref()
    }

    /// Attach a chunk-received listener to the engine of `format`.
    pub fn set_chunk_received_listener(
        &self,
        format: &str,
        listener: Arc<dyn ChunkReceivedListener>,
    ) -> Result<ListenerId> {
        Ok(self
            .engine_or_create(format)?
            .attach_chunk_received_listener(listener))
    }

    /// Close the current era of every engine with new content. Returns the
    /// number of engines that moved on.
    pub fn new_era(&self) -> Result<usize> {
        let mut rotated = 0;
        for engine in self.registry.engines() {
            if engine.new_era()? {
                rotated += 1;
            }
        }
        Ok(rotated)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Online peers
    // ─────────────────────────────────────────────────────────────────────────

    pub fn online_peers(&self) -> BTreeSet<PeerId> {
        self.online
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn attach_online_peers_listener(
        &self,
        listener: Arc<dyn OnlinePeersListener>,
    ) -> ListenerId {
        self.online_listeners.attach(listener)
    }

    pub fn detach_online_peers_listener(&self, id: ListenerId) -> bool {
        self.online_listeners.detach(id)
    }

    fn peer_connected(&self, peer: &PeerId) {
        let changed = {
            let mut online = self.online.lock().unwrap_or_else(PoisonError::into_inner);
            let count = online.entry(peer.clone()).or_insert(0);
            *count += 1;
            *count == 1
        };
        if changed {
            self.notify_online();
        }
    }

    fn peer_disconnected(&self, peer: &PeerId) {
        let changed = {
            let mut online = self.online.lock().unwrap_or_else(PoisonError::into_inner);
            match online.get_mut(peer) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    false
                }
                Some(_) => {
                    online.remove(peer);
                    true
                }
                None => false,
            }
        };
        if changed {
            self.notify_online();
        }
    }

    fn notify_online(&self) {
        let peers = self.online_peers();
        for listener in self.online_listeners.snapshot() {
            if let Err(e) = listener.online_peers_changed(&peers) {
                warn!(error = %e, "online-peers listener failed");
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Connections
    // ─────────────────────────────────────────────────────────────────────────

    /// Run one exchange over `conn` covering every registered format.
    #[instrument(skip_all, fields(owner = %self.owner))]
    pub async fn handle_connection(&self, conn: &dyn Connection) -> Result<SyncReport> {
        conn.send(Pdu::Interest(InterestPdu {
            peer: self.owner.clone(),
            format: None,
        }))
        .await?;

        let peer = match conn.recv().await? {
            Some(Pdu::Interest(interest)) => interest.peer,
            Some(other) => {
                return Err(SyncError::Protocol(format!(
                    "expected interest, got {}",
                    other.kind()
                ))
                .into())
            }
            None => {
                return Err(
                    SyncError::Protocol("connection closed before interest".into()).into(),
                )
            }
        };

        self.peer_connected(&peer);
        let result = self.exchange(conn, &peer).await;
        self.peer_disconnected(&peer);
        result
    }

    async fn exchange(&self, conn: &dyn Connection, peer: &PeerId) -> Result<SyncReport> {
        let engines = self.registry.engines();
        let mut admissions = Vec::with_capacity(engines.len());
        for engine in &engines {
            admissions.push(engine.admit(peer)?);
        }
        for engine in &engines {
            if engine.config().new_era_on_connect {
                engine.new_era()?;
            }
        }
        info!(%peer, engines = engines.len(), "exchange started");

        let sending = async {
            let mut report = SyncReport::new(peer.clone());
            for engine in &engines {
                engine.respond(conn, peer, &mut report).await?;
            }
            conn.finish().await?;
            Ok::<_, EngineError>(report)
        };
        let receiving = async {
            let mut received = 0;
            while let Some(pdu) = conn.recv().await? {
                if self.dispatch(pdu)? {
                    received += 1;
                }
            }
            Ok::<_, EngineError>(received)
        };

        let (mut report, received) = tokio::try_join!(sending, receiving)?;
        report.chunks_received = received;
        drop(admissions);
        info!(
            %peer,
            sent = report.chunks_sent,
            received = report.chunks_received,
            "exchange finished"
        );
        Ok(report)
    }

    /// Route a PDU to the engine of its format, opening it if needed.
    fn dispatch(&self, pdu: Pdu) -> Result<bool> {
        let format = match &pdu {
            Pdu::Assimilate(assimilate) => assimilate.format.clone(),
            Pdu::Offer(offer) => offer.format.clone(),
            Pdu::Interest(interest) => {
                return Err(SyncError::Protocol(format!(
                    "second interest from {}",
                    interest.peer
                ))
                .into())
            }
        };
        Ok(self.engine_or_create(&format)?.receive(pdu)?)
    }
}

impl std::fmt::Debug for MultiEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiEngine")
            .field("owner", &self.owner)
            .field("formats", &self.formats())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asap_core::Era;
    use asap_sync::transport::memory;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn multi(owner: &str, formats: &[&str]) -> MultiEngine {
        MultiEngine::new(
            MultiEngineConfig::new(PeerId::from(owner)).with_formats(formats.iter().copied()),
        )
        .unwrap()
    }

    async fn exchange(a: &MultiEngine, b: &MultiEngine) -> (SyncReport, SyncReport) {
        let (left, right) = memory::pair();
        let (ra, rb) = tokio::join!(a.handle_connection(&left), b.handle_connection(&right));
        (ra.unwrap(), rb.unwrap())
    }

    #[test]
    fn test_formats_registered() {
        let engine = multi("alice", &["chat", "mail"]);
        assert_eq!(engine.formats(), vec![MANAGEMENT_FORMAT, "chat", "mail"]);
        assert!(engine.is_management_running());
        assert!(matches!(
            engine.engine("map"),
            Err(EngineError::UnknownFormat(_))
        ));
        assert_eq!(engine.engine_or_create("map").unwrap().format(), "map");
    }

    #[test]
    fn test_without_management() {
        let engine = MultiEngine::new(
            MultiEngineConfig::new(PeerId::from("alice"))
                .with_format("chat")
                .with_management(false),
        )
        .unwrap();
        assert!(!engine.is_management_running());
        assert_eq!(engine.formats(), vec!["chat"]);
    }

    #[tokio::test]
    async fn test_routes_each_format() {
        let alice = multi("alice", &["chat", "mail"]);
        let bob = multi("bob", &["chat"]);
        alice.engine("chat").unwrap().add("sn2://c", b"hi").unwrap();
        alice.engine("mail").unwrap().add("sn2://m", b"post").unwrap();

        let (ra, rb) = exchange(&alice, &bob).await;
        assert_eq!(ra.chunks_sent, 2);
        assert_eq!(rb.chunks_received, 2);

        let mail = bob.engine("mail").unwrap();
        let chunk = mail
            .incoming_storage(&PeerId::from("alice"))
            .unwrap()
            .existing_chunk("sn2://m", Era::ZERO)
            .unwrap()
            .unwrap();
        assert_eq!(&chunk.messages().unwrap().next().unwrap()[..], b"post");
    }

    #[tokio::test]
    async fn test_online_peers_tracked() {
        let alice = multi("alice", &["chat"]);
        let bob = multi("bob", &["chat"]);
        let changes = Arc::new(AtomicUsize::new(0));
        let counter = changes.clone();
        alice.attach_online_peers_listener(Arc::new(
            move |_: &BTreeSet<PeerId>| -> anyhow::Result<()> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        ));

        exchange(&alice, &bob).await;
        assert_eq!(changes.load(Ordering::SeqCst), 2);
        assert!(alice.online_peers().is_empty());
    }

    #[tokio::test]
    async fn test_new_era_counts_rotated_engines() {
        let alice = multi("alice", &["chat", "mail"]);
        alice.engine("chat").unwrap().add("sn2://c", b"x").unwrap();
        assert_eq!(alice.new_era().unwrap(), 1);
        assert_eq!(alice.new_era().unwrap(), 0);
    }
}
