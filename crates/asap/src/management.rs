//! Management channel: propagation of channel creation between peers.
//!
//! Creating a channel in an application engine writes a
//! [`ManagementMessage`] into the management engine, addressed to the
//! channel's recipients. When a peer receives such a message, its
//! [`ManagementHandler`] creates the channel locally, which in turn forwards
//! the message to the recipients that peer meets.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, PoisonError, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use asap_core::{Era, PeerId, MANAGEMENT_FORMAT, MANAGEMENT_URI_PREFIX};
use asap_sync::{ChannelCreatedListener, ChunkReceivedListener, SyncEngine};

use crate::error::{EngineError, Result};
use crate::registry::EngineRegistry;

/// Announcement of a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagementMessage {
    pub owner: PeerId,
    pub format: String,
    pub uri: String,
    pub recipients: BTreeSet<PeerId>,
}

impl ManagementMessage {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| EngineError::MalformedManagementMessage(e.to_string()))?;
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let message: Self = ciborium::from_reader(bytes)
            .map_err(|e| EngineError::MalformedManagementMessage(e.to_string()))?;
        if message.format.trim().is_empty() || message.uri.trim().is_empty() {
            return Err(EngineError::MalformedManagementMessage(
                "empty format or uri".into(),
            ));
        }
        Ok(message)
    }

    /// Recipients including the owner.
    pub fn members(&self) -> BTreeSet<PeerId> {
        let mut members = self.recipients.clone();
        members.insert(self.owner.clone());
        members
    }
}

/// Turns received management messages into local channels and announces
/// locally created channels on the management channel.
pub struct ManagementHandler {
    registry: Weak<EngineRegistry>,
    /// Recipient set → management channel URI.
    channels: Mutex<HashMap<BTreeSet<PeerId>, String>>,
    last_stamp: Mutex<u128>,
}

impl ManagementHandler {
    pub fn new(registry: Weak<EngineRegistry>) -> Self {
        Self {
            registry,
            channels: Mutex::new(HashMap::new()),
            last_stamp: Mutex::new(0),
        }
    }

    fn registry(&self) -> Result<std::sync::Arc<EngineRegistry>> {
        self.registry
            .upgrade()
            .ok_or_else(|| EngineError::Config("engine registry is gone".into()))
    }

    /// Apply one management message. Returns whether a channel was created.
    ///
    /// An existing channel must have the same members, compared ignoring
    /// case, or the message is rejected.
    pub fn handle_message(&self, message: &ManagementMessage) -> Result<bool> {
        let registry = self.registry()?;
        let engine = registry.get_or_create(&message.format)?;
        let received = message.members();

        if engine.channel_exists(&message.uri)? {
            let channel = engine.channel(&message.uri)?;
            let mut existing = channel.recipients;
            existing.extend(channel.owner);
            if same_members(&existing, &received) {
                debug!(uri = %message.uri, format = %message.format, "channel already known");
                return Ok(false);
            }
            return Err(EngineError::InconsistentChannel {
                uri: message.uri.clone(),
                existing,
                received,
            });
        }

        engine.create_channel_with_owner(message.owner.clone(), &message.uri, received)?;
        info!(
            uri = %message.uri,
            format = %message.format,
            owner = %message.owner,
            "created channel from management message"
        );
        Ok(true)
    }

    /// Management channel URI used for `recipients`, assigned on first use.
    pub fn management_uri(&self, recipients: &BTreeSet<PeerId>) -> String {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(uri) = channels.get(recipients) {
            return uri.clone();
        }
        let uri = format!("{MANAGEMENT_URI_PREFIX}{}", self.next_stamp());
        channels.insert(recipients.clone(), uri.clone());
        uri
    }

    /// Milliseconds since the epoch, bumped to stay unique.
    fn next_stamp(&self) -> u128 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let mut last = self.last_stamp.lock().unwrap_or_else(PoisonError::into_inner);
        *last = now.max(*last + 1);
        *last
    }

    fn management_engine(&self) -> Result<Option<std::sync::Arc<SyncEngine>>> {
        Ok(self.registry()?.get(MANAGEMENT_FORMAT))
    }

    fn process_chunk(&self, sender: &PeerId, uri: &str, era: Era) -> Result<()> {
        let Some(engine) = self.management_engine()? else {
            return Ok(());
        };
        let storage = engine.incoming_storage(sender)?;
        if let Some(chunk) = storage.existing_chunk(uri, era)? {
            for raw in chunk.messages()? {
                let outcome =
                    ManagementMessage::decode(&raw).and_then(|message| self.handle_message(&message));
                if let Err(e) = outcome {
                    warn!(%sender, uri, %era, error = %e, "rejected management message");
                }
            }
        }
        storage.drop_chunks(era)?;
        Ok(())
    }

    fn announce(
        &self,
        format: &str,
        owner: &PeerId,
        uri: &str,
        recipients: &BTreeSet<PeerId>,
    ) -> Result<()> {
        let Some(engine) = self.management_engine()? else {
            return Ok(());
        };
        let message = ManagementMessage {
            owner: owner.clone(),
            format: format.to_string(),
            uri: uri.to_string(),
            recipients: recipients.clone(),
        };

        let management_uri = self.management_uri(recipients);
        if !engine.channel_exists(&management_uri)? {
            engine.create_channel(&management_uri, recipients.iter().cloned())?;
        }
        engine.add(&management_uri, &message.encode()?)?;
        debug!(uri, format, management_uri, "announced channel");
        Ok(())
    }
}

impl ChunkReceivedListener for ManagementHandler {
    fn chunk_received(&self, sender: &PeerId, uri: &str, era: Era) -> anyhow::Result<()> {
        Ok(self.process_chunk(sender, uri, era)?)
    }
}

impl ChannelCreatedListener for ManagementHandler {
    fn channel_created(
        &self,
        format: &str,
        owner: &PeerId,
        uri: &str,
        recipients: &BTreeSet<PeerId>,
    ) -> anyhow::Result<()> {
        if format == MANAGEMENT_FORMAT {
            return Ok(());
        }
        Ok(self.announce(format, owner, uri, recipients)?)
    }
}

fn same_members(a: &BTreeSet<PeerId>, b: &BTreeSet<PeerId>) -> bool {
    let fold = |set: &BTreeSet<PeerId>| -> BTreeSet<String> {
        set.iter().map(|p| p.as_str().to_ascii_lowercase()).collect()
    };
    fold(a) == fold(b)
}
