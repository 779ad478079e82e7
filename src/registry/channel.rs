#![forbid(unsafe_code)]

// Channel registry — in-memory channel records behind one RwLock. Critical
// sections are short and never cross an await point; media calls happen
// outside.

use crate::error::{ServerError, ServerResult};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use tracing::info;
use uuid::Uuid;

/// The system channel. Created at startup, cannot be deleted.
pub const SYSTEM_CHANNEL_ID: &str = "main";

/// Full channel record. Internal only — wire snapshots go through
/// [`ChannelSummary`].
#[derive(Debug, Clone)]
pub struct ChannelRecord {
    pub id: String,
    pub name: String,
    pub description: String,
    pub members: HashSet<String>,
    pub producers: HashSet<String>,
}

/// Sanitized snapshot for `listChannels` and channel events: ids, names,
/// descriptions and counts, never the internal sets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSummary {
    pub id: String,
    pub name: String,
    pub description: String,
    pub member_count: usize,
}

impl ChannelRecord {
    fn summary(&self) -> ChannelSummary {
        ChannelSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            member_count: self.members.len(),
        }
    }
}

pub struct ChannelRegistry {
    channels: RwLock<HashMap<String, ChannelRecord>>,
}

impl ChannelRegistry {
    /// Creates the registry with the system channel already present.
    pub fn new() -> Self {
        let mut channels = HashMap::new();
        channels.insert(
            SYSTEM_CHANNEL_ID.to_string(),
            ChannelRecord {
                id: SYSTEM_CHANNEL_ID.to_string(),
                name: SYSTEM_CHANNEL_ID.to_string(),
                description: "System channel".to_string(),
                members: HashSet::new(),
                producers: HashSet::new(),
            },
        );
        Self {
            channels: RwLock::new(channels),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, ChannelRecord>> {
        self.channels.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, ChannelRecord>> {
        self.channels.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Creates a channel with a fresh id. Names are unique.
    pub fn create(&self, name: &str, description: &str) -> ServerResult<ChannelSummary> {
        if name.is_empty() {
            return Err(ServerError::BadRequest("channel name must not be empty".into()));
        }
        let mut channels = self.write();
        if channels.values().any(|c| c.name == name) {
            return Err(ServerError::Conflict(format!("channel name already in use: {name}")));
        }
        let id = Uuid::new_v4().to_string();
        let record = ChannelRecord {
            id: id.clone(),
            name: name.to_string(),
            description: description.to_string(),
            members: HashSet::new(),
            producers: HashSet::new(),
        };
        let summary = record.summary();
        channels.insert(id.clone(), record);
        info!("Created channel {} ({})", name, id);
        Ok(summary)
    }

    /// Updates name and/or description.
    pub fn update_metadata(
        &self,
        channel_id: &str,
        name: Option<&str>,
        description: Option<&str>,
    ) -> ServerResult<ChannelSummary> {
        let mut channels = self.write();
        if let Some(new_name) = name {
            if new_name.is_empty() {
                return Err(ServerError::BadRequest("channel name must not be empty".into()));
            }
            if channels.values().any(|c| c.name == new_name && c.id != channel_id) {
                return Err(ServerError::Conflict(format!(
                    "channel name already in use: {new_name}"
                )));
            }
        }
        let record = channels
            .get_mut(channel_id)
            .ok_or_else(|| ServerError::NotFound(format!("channel {channel_id}")))?;
        if let Some(new_name) = name {
            record.name = new_name.to_string();
        }
        if let Some(desc) = description {
            record.description = desc.to_string();
        }
        Ok(record.summary())
    }

    /// Deletes a channel, returning its final record so the caller can close
    /// producers/consumers and detach members. The system channel is protected.
    pub fn delete(&self, channel_id: &str) -> ServerResult<ChannelRecord> {
        if channel_id == SYSTEM_CHANNEL_ID {
            return Err(ServerError::Conflict("the system channel cannot be deleted".into()));
        }
        let mut channels = self.write();
        let record = channels
            .remove(channel_id)
            .ok_or_else(|| ServerError::NotFound(format!("channel {channel_id}")))?;
        info!("Deleted channel {} ({})", record.name, channel_id);
        Ok(record)
    }

    pub fn exists(&self, channel_id: &str) -> bool {
        self.read().contains_key(channel_id)
    }

    pub fn add_member(&self, channel_id: &str, client_id: &str) -> ServerResult<()> {
        let mut channels = self.write();
        let record = channels
            .get_mut(channel_id)
            .ok_or_else(|| ServerError::NotFound(format!("channel {channel_id}")))?;
        record.members.insert(client_id.to_string());
        Ok(())
    }

    pub fn remove_member(&self, channel_id: &str, client_id: &str) {
        if let Some(record) = self.write().get_mut(channel_id) {
            record.members.remove(client_id);
        }
    }

    pub fn add_producer(&self, channel_id: &str, producer_id: &str) {
        if let Some(record) = self.write().get_mut(channel_id) {
            record.producers.insert(producer_id.to_string());
        }
    }

    pub fn remove_producer(&self, channel_id: &str, producer_id: &str) {
        if let Some(record) = self.write().get_mut(channel_id) {
            record.producers.remove(producer_id);
        }
    }

    pub fn get(&self, channel_id: &str) -> ServerResult<ChannelSummary> {
        self.read()
            .get(channel_id)
            .map(ChannelRecord::summary)
            .ok_or_else(|| ServerError::NotFound(format!("channel {channel_id}")))
    }

    pub fn list(&self) -> Vec<ChannelSummary> {
        let mut summaries: Vec<ChannelSummary> =
            self.read().values().map(ChannelRecord::summary).collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }

    pub fn members_of(&self, channel_id: &str) -> Vec<String> {
        self.read()
            .get(channel_id)
            .map(|c| c.members.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn producers_of(&self, channel_id: &str) -> Vec<String> {
        self.read()
            .get(channel_id)
            .map(|c| c.producers.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn channel_count(&self) -> usize {
        self.read().len()
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn system_channel_exists_at_startup() {
        let registry = ChannelRegistry::new();
        assert!(registry.exists(SYSTEM_CHANNEL_ID));
        assert!(registry.channel_count() >= 1);
    }

    #[test]
    fn deleting_system_channel_is_a_conflict() {
        let registry = ChannelRegistry::new();
        let err = registry.delete(SYSTEM_CHANNEL_ID).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        // Registry unchanged
        assert!(registry.exists(SYSTEM_CHANNEL_ID));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let registry = ChannelRegistry::new();
        registry.create("ops", "").unwrap();
        let err = registry.create("ops", "second").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn rename_collision_is_rejected_but_self_rename_is_fine() {
        let registry = ChannelRegistry::new();
        let ops = registry.create("ops", "").unwrap();
        registry.create("stage", "").unwrap();

        let err = registry
            .update_metadata(&ops.id, Some("stage"), None)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        // Renaming to its own name succeeds
        let updated = registry.update_metadata(&ops.id, Some("ops"), Some("cue ops")).unwrap();
        assert_eq!(updated.description, "cue ops");
    }

    #[test]
    fn summaries_expose_counts_not_sets() {
        let registry = ChannelRegistry::new();
        registry.add_member(SYSTEM_CHANNEL_ID, "alice").unwrap();
        registry.add_member(SYSTEM_CHANNEL_ID, "bob").unwrap();
        let summary = registry.get(SYSTEM_CHANNEL_ID).unwrap();
        assert_eq!(summary.member_count, 2);
    }

    #[test]
    fn delete_returns_final_record_for_cascade() {
        let registry = ChannelRegistry::new();
        let ch = registry.create("ops", "").unwrap();
        registry.add_member(&ch.id, "alice").unwrap();
        registry.add_producer(&ch.id, "prod-1");

        let record = registry.delete(&ch.id).unwrap();
        assert!(record.members.contains("alice"));
        assert!(record.producers.contains("prod-1"));
        assert!(!registry.exists(&ch.id));
    }
}
