//! Sync protocol: one exchange between this engine and a connected peer.
//!
//! Both sides announce themselves with an interest, then each side sends the
//! chunks the other has not seen yet while receiving the other's chunks.

use tracing::{debug, info, instrument, warn};

use asap_core::{Era, PeerId};
use asap_store::{ChunkStorage, StoreError};

use crate::engine::SyncEngine;
use crate::error::{Result, SyncError};
use crate::messages::{AssimilatePdu, InterestPdu, Pdu};
use crate::transport::Connection;

/// Configuration for engine behavior.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Drop a chunk once every recipient has received it.
    pub drop_delivered_chunks: bool,
    /// Relay chunks received from other senders.
    pub send_received_chunks: bool,
    /// Close the current era at the start of an admitted exchange, so content
    /// added before the encounter is sent during it.
    pub new_era_on_connect: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            drop_delivered_chunks: false,
            send_received_chunks: false,
            new_era_on_connect: true,
        }
    }
}

/// Result of an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    /// The remote peer.
    pub peer: PeerId,
    /// Chunks sent to the peer.
    pub chunks_sent: usize,
    /// Chunks received from the peer.
    pub chunks_received: usize,
    /// Chunks dropped after full delivery.
    pub chunks_dropped: usize,
}

impl SyncReport {
    pub fn new(peer: PeerId) -> Self {
        Self {
            peer,
            chunks_sent: 0,
            chunks_received: 0,
            chunks_dropped: 0,
        }
    }
}

impl SyncEngine {
    /// Run one complete exchange over `conn`.
    ///
    /// Sends this engine's interest, waits for the peer's, admits the peer
    /// and then sends and receives concurrently until both sides finished.
    #[instrument(skip_all, fields(owner = %self.owner, format = %self.format))]
    pub async fn handle_connection(&self, conn: &dyn Connection) -> Result<SyncReport> {
        conn.send(Pdu::Interest(InterestPdu {
            peer: self.owner.clone(),
            format: Some(self.format.clone()),
        }))
        .await?;

        let peer = match conn.recv().await? {
            Some(Pdu::Interest(interest)) => interest.peer,
            Some(other) => {
                return Err(SyncError::Protocol(format!(
                    "expected interest, got {}",
                    other.kind()
                )))
            }
            None => {
                return Err(SyncError::Protocol(
                    "connection closed before interest".into(),
                ))
            }
        };

        self.serve(conn, peer).await
    }

    /// Exchange with a peer whose interest has already been read.
    pub async fn serve(&self, conn: &dyn Connection, peer: PeerId) -> Result<SyncReport> {
        let _admission = self.admit(&peer)?;
        info!(%peer, "exchange started");
        if self.config.new_era_on_connect {
            self.new_era()?;
        }

        let sending = async {
            let mut report = SyncReport::new(peer.clone());
            self.respond(conn, &peer, &mut report).await?;
            conn.finish().await?;
            Ok::<_, SyncError>(report)
        };
        let receiving = async {
            let mut received = 0;
            while let Some(pdu) = conn.recv().await? {
                if self.receive(pdu)? {
                    received += 1;
                }
            }
            Ok::<_, SyncError>(received)
        };

        let (mut report, received) = tokio::try_join!(sending, receiving)?;
        report.chunks_received = received;
        info!(
            %peer,
            sent = report.chunks_sent,
            received = report.chunks_received,
            dropped = report.chunks_dropped,
            "exchange finished"
        );
        Ok(report)
    }

    /// Handle one PDU received after the interest. Returns whether a chunk
    /// was stored.
    pub fn receive(&self, pdu: Pdu) -> Result<bool> {
        match pdu {
            Pdu::Assimilate(assimilate) => {
                if assimilate.format != self.format {
                    warn!(
                        format = %assimilate.format,
                        uri = %assimilate.uri,
                        "skipping chunk of foreign format"
                    );
                    return Ok(false);
                }
                self.assimilate(&assimilate)?;
                Ok(true)
            }
            Pdu::Offer(offer) => {
                warn!(sender = %offer.sender, uri = %offer.uri, era = %offer.era, "ignoring offer");
                Ok(false)
            }
            Pdu::Interest(interest) => Err(SyncError::Protocol(format!(
                "second interest from {}",
                interest.peer
            ))),
        }
    }

    /// Send every chunk `peer` has not seen yet, advancing its cursor after
    /// each era of local data.
    ///
    /// The current era is never sent. With relaying on, chunks received from
    /// other senders follow, using the same era window.
    pub async fn respond(
        &self,
        conn: &dyn Connection,
        peer: &PeerId,
        report: &mut SyncReport,
    ) -> Result<()> {
        let (start, current, relay) = {
            let state = self.lock_state();
            let start = state.window_start(peer);
            if start != state.era {
                self.checkpoint(&state)?;
            }
            (start, state.era, state.send_received_chunks)
        };
        if start == current {
            debug!(%peer, era = %current, "nothing new to send");
            return Ok(());
        }

        let last = current.previous();
        let local = self.local.clone();
        for era in start.through(last) {
            self.send_era(conn, peer, &local, &self.owner, era, report)
                .await?;
            let mut state = self.lock_state();
            state.last_seen.insert(peer.clone(), era.next());
            self.checkpoint(&state)?;
        }

        if relay {
            for sender in self.provider.senders()? {
                // The peer already holds what it sent us.
                if sender == *peer {
                    continue;
                }
                let storage = self.provider.incoming(&sender)?;
                for era in start.through(last) {
                    self.send_era(conn, peer, &storage, &sender, era, report)
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn send_era(
        &self,
        conn: &dyn Connection,
        peer: &PeerId,
        storage: &ChunkStorage,
        origin: &PeerId,
        era: Era,
        report: &mut SyncReport,
    ) -> Result<()> {
        let drop_delivered = self.drop_delivered_chunks();
        for mut chunk in storage.get_chunks(era)? {
            if chunk.is_empty() {
                continue;
            }
            if !chunk.is_public() && !chunk.recipients().contains(peer) {
                continue;
            }

            let pdu = AssimilatePdu::from_chunk(&chunk, origin, peer, &self.format)?;
            conn.send(Pdu::Assimilate(pdu)).await?;
            report.chunks_sent += 1;
            debug!(%peer, %origin, uri = chunk.uri(), %era, "sent chunk");

            match chunk.delivered_to(peer) {
                Ok(()) => {}
                Err(StoreError::NotFound(_)) => {
                    debug!(uri = chunk.uri(), %era, "chunk removed while sending");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
            if drop_delivered && chunk.is_fully_delivered() {
                debug!(uri = chunk.uri(), %era, "dropping fully delivered chunk");
                chunk.remove()?;
                report.chunks_dropped += 1;
            }
        }
        Ok(())
    }
}
