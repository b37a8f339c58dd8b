//! Sync protocol message types.
//!
//! Every exchange starts with both sides sending an [`InterestPdu`]. Chunks
//! then travel as [`AssimilatePdu`]s, one per chunk.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use asap_core::{Era, PeerId};
use asap_store::chunk::validate_offsets;
use asap_store::Chunk;

use crate::error::{Result, SyncError};

/// Protocol data units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Pdu {
    /// Opening announcement: who is talking.
    Interest(InterestPdu),

    /// One chunk of data.
    Assimilate(AssimilatePdu),

    /// Advertisement of an available chunk. Accepted and ignored.
    Offer(OfferPdu),
}

impl Pdu {
    /// Short name for logs and errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Pdu::Interest(_) => "interest",
            Pdu::Assimilate(_) => "assimilate",
            Pdu::Offer(_) => "offer",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterestPdu {
    /// Identity of the sending peer.
    pub peer: PeerId,
    /// Format of the announcing engine. `None` when one connection serves
    /// every format of a multi engine.
    pub format: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssimilatePdu {
    /// Origin of the chunk. For relayed chunks this is the original sender,
    /// not the relaying peer.
    pub sender: PeerId,
    /// Addressed peer for chunks of a closed channel; `None` for public ones.
    pub recipient: Option<PeerId>,
    pub format: String,
    pub uri: String,
    pub era: Era,
    /// Total content length.
    pub length: u64,
    /// Start positions of messages 2..n within `data`.
    pub offsets: Vec<u64>,
    pub data: Bytes,
}

impl AssimilatePdu {
    /// Build a PDU carrying the full content of `chunk`.
    pub fn from_chunk(
        chunk: &Chunk,
        sender: &PeerId,
        peer: &PeerId,
        format: &str,
    ) -> Result<Self> {
        let data = chunk.content()?;
        Ok(Self {
            sender: sender.clone(),
            recipient: (!chunk.is_public()).then(|| peer.clone()),
            format: format.to_string(),
            uri: chunk.uri().to_string(),
            era: chunk.era(),
            length: chunk.len(),
            offsets: chunk.offsets().to_vec(),
            data,
        })
    }

    /// Check that length and offsets describe `data`.
    pub fn validate(&self) -> Result<()> {
        if self.data.len() as u64 != self.length {
            return Err(SyncError::Protocol(format!(
                "assimilate for {} declares {} bytes, carries {}",
                self.uri,
                self.length,
                self.data.len()
            )));
        }
        validate_offsets(&self.offsets, self.length)
            .map_err(|e| SyncError::Protocol(format!("assimilate for {}: {e}", self.uri)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferPdu {
    pub sender: PeerId,
    pub format: String,
    pub uri: String,
    pub era: Era,
}
