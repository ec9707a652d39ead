/// Local conversation cache stored in sled DB
///
/// Non-authoritative: it only pre-populates a view before the first REST
/// snapshot lands, and is overwritten with that snapshot afterwards.
use crate::error::{Result, SyncError};
use crate::types::{DeliveryState, Message};
use std::path::Path;

pub struct ConversationCache {
    db: sled::Db,
}

impl ConversationCache {
    /// Open (or create) the cache under `data_dir`
    pub fn open(data_dir: &Path) -> Result<Self> {
        let db_path = data_dir.join("conversations.db");
        let db = sled::open(&db_path)
            .map_err(|e| SyncError::Storage(format!("Failed to open conversation cache: {}", e)))?;

        Ok(Self { db })
    }

    fn key(peer_id: &str) -> String {
        format!("conv:{}", peer_id)
    }

    /// Cached messages for a peer, empty when nothing is cached or the entry
    /// does not decode
    pub fn load(&self, peer_id: &str) -> Result<Vec<Message>> {
        let value = self
            .db
            .get(Self::key(peer_id).as_bytes())
            .map_err(|e| SyncError::Storage(format!("Failed to read cache: {}", e)))?;

        Ok(value
            .and_then(|v| serde_json::from_slice::<Vec<Message>>(&v).ok())
            .unwrap_or_default())
    }

    /// Replace the cached messages for a peer. Only confirmed messages are kept.
    pub fn store(&self, peer_id: &str, messages: &[Message]) -> Result<()> {
        let confirmed: Vec<&Message> = messages
            .iter()
            .filter(|m| m.delivery_state == DeliveryState::Confirmed)
            .collect();
        let value = serde_json::to_vec(&confirmed).map_err(SyncError::Serialization)?;

        self.db
            .insert(Self::key(peer_id).as_bytes(), value)
            .map_err(|e| SyncError::Storage(format!("Failed to save conversation: {}", e)))?;

        Ok(())
    }

    pub fn clear(&self, peer_id: &str) -> Result<()> {
        self.db
            .remove(Self::key(peer_id).as_bytes())
            .map_err(|e| SyncError::Storage(format!("Failed to clear conversation: {}", e)))?;
        Ok(())
    }
}

impl Clone for ConversationCache {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_store_skips_unconfirmed_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ConversationCache::open(dir.path()).unwrap();

        let mut confirmed = Message::placeholder("buyer-1", "operator", "hello", Utc::now());
        confirmed.id = "m1".to_string();
        confirmed.delivery_state = DeliveryState::Confirmed;
        let pending = Message::placeholder("buyer-1", "operator", "draft", Utc::now());

        cache.store("buyer-1", &[confirmed.clone(), pending]).unwrap();

        assert_eq!(cache.load("buyer-1").unwrap(), vec![confirmed]);
        assert!(cache.load("someone-else").unwrap().is_empty());

        cache.clear("buyer-1").unwrap();
        assert!(cache.load("buyer-1").unwrap().is_empty());
    }
}
