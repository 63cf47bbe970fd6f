use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::RwLock;

use crate::commands::Destination;
use crate::errors::{AppError, AppResult};
use crate::security::InputValidator;

/// Source of destination records; the engine only ever reads them
#[async_trait]
pub trait DestinationStore: Send + Sync {
    async fn get_destination(&self, id: i64) -> AppResult<Destination>;
}

#[derive(Debug)]
pub struct InMemoryDestinationStore {
    destinations: RwLock<HashMap<i64, Destination>>,
    next_id: AtomicI64,
}

impl Default for InMemoryDestinationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDestinationStore {
    pub fn new() -> Self {
        Self {
            destinations: RwLock::new(HashMap::new()),
            next_id: AtomicI64::new(1),
        }
    }

    pub fn insert(&self, name: &str, url: &str, is_forum: bool) -> AppResult<i64> {
        InputValidator::validate_destination_name(name)?;
        InputValidator::validate_endpoint_url(url)?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let destination = Destination {
            id,
            name: name.trim().to_string(),
            url: url.trim().to_string(),
            is_forum,
        };

        self.destinations
            .write()
            .map_err(|e| AppError::Internal(format!("Destination store poisoned: {}", e)))?
            .insert(id, destination);

        log::debug!("Registered destination {} ({})", id, name.trim());
        Ok(id)
    }
}

#[async_trait]
impl DestinationStore for InMemoryDestinationStore {
    async fn get_destination(&self, id: i64) -> AppResult<Destination> {
        self.destinations
            .read()
            .map_err(|e| AppError::Internal(format!("Destination store poisoned: {}", e)))?
            .get(&id)
            .cloned()
            .ok_or(AppError::DestinationNotFound { id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = InMemoryDestinationStore::new();
        let id = store
            .insert(" Photos ", "https://discord.com/api/webhooks/1/abc", true)
            .unwrap();

        let destination = store.get_destination(id).await.unwrap();
        assert_eq!(destination.name, "Photos");
        assert!(destination.is_forum);

        let second = store.insert("Other", "http://localhost:9/hook", false).unwrap();
        assert!(second > id);
        assert!(!store.get_destination(second).await.unwrap().is_forum);

        assert!(matches!(
            store.get_destination(second + 1).await,
            Err(AppError::DestinationNotFound { .. })
        ));
    }

    #[test]
    fn test_insert_rejects_bad_input() {
        let store = InMemoryDestinationStore::new();
        assert!(store.insert("", "https://discord.com/x", false).is_err());
        assert!(store.insert("Name", "not-a-url", false).is_err());
    }
}
