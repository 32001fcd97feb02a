//! Storage capability over residents and their readings.
//!
//! Every backend keeps the same contract: resident lists and reading lists
//! come back newest-first, deleting a resident removes its readings, and
//! editing a reading keeps its id and creation instant.

pub mod json_file;
pub mod memory;
pub mod postgres;
pub mod sheets;

use std::{sync::Arc, time::Duration};

use water_client::{NewReading, NewResident, Reading, ReadingId, Resident, ResidentId, ResidentPatch};

use crate::{
    config::{StoreConfig, StoreKind},
    retry::{RetryPolicy, Retryable},
};

pub use json_file::JsonFileStore;
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use sheets::SheetsStore;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("resident {0} not found")]
    ResidentNotFound(ResidentId),
    #[error("reading {reading} of resident {resident} not found")]
    ReadingNotFound { resident: ResidentId, reading: ReadingId },
    #[error("{0} already exists")]
    Conflict(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt stored record: {0}")]
    Corrupt(String),
    #[error("store backend error: {0}")]
    Backend(String),
}

impl Retryable for StoreError {
    fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

#[async_trait::async_trait]
pub trait ResidentStore: Send + Sync {
    /// Short backend name for logs and health output.
    fn backend(&self) -> &'static str;

    async fn list_residents(&self) -> Result<Vec<Resident>, StoreError>;

    async fn get_resident(&self, id: &ResidentId) -> Result<Resident, StoreError>;

    async fn create_resident(&self, resident: Resident) -> Result<Resident, StoreError>;

    async fn update_resident(&self, id: &ResidentId, patch: ResidentPatch) -> Result<Resident, StoreError>;

    async fn delete_resident(&self, id: &ResidentId) -> Result<(), StoreError>;

    async fn list_readings(&self, resident_id: &ResidentId) -> Result<Vec<Reading>, StoreError> {
        Ok(self.get_resident(resident_id).await?.readings)
    }

    async fn add_reading(&self, resident_id: &ResidentId, reading: Reading) -> Result<Reading, StoreError>;

    async fn update_reading(
        &self,
        resident_id: &ResidentId,
        reading_id: &ReadingId,
        new: NewReading,
    ) -> Result<Reading, StoreError>;

    async fn delete_reading(&self, resident_id: &ResidentId, reading_id: &ReadingId) -> Result<(), StoreError>;
}

pub type SharedStore = Arc<dyn ResidentStore>;

/// Opens the backend named in the config.
pub async fn open(cfg: &StoreConfig, retry: RetryPolicy) -> anyhow::Result<SharedStore> {
    let store: SharedStore = match cfg.kind {
        StoreKind::Memory => Arc::new(MemoryStore::new()),
        StoreKind::JsonFile => {
            let path = cfg
                .path
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("store.path is required for the json_file store"))?;
            Arc::new(JsonFileStore::open(path).await?)
        }
        StoreKind::Postgres => {
            let uri = cfg
                .uri
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("store.uri is required for the postgres store"))?;
            Arc::new(PgStore::connect(uri, cfg.max_connections, retry).await?)
        }
        StoreKind::Sheets => {
            let spreadsheet_id = cfg
                .spreadsheet_id
                .clone()
                .ok_or_else(|| anyhow::anyhow!("store.spreadsheet_id is required for the sheets store"))?;
            let access_token = cfg
                .access_token
                .clone()
                .ok_or_else(|| anyhow::anyhow!("store.access_token is required for the sheets store"))?;
            Arc::new(
                SheetsStore::connect(
                    cfg.api_base_url.clone(),
                    spreadsheet_id,
                    access_token,
                    Duration::from_secs(cfg.cache_ttl_secs),
                    retry,
                )
                .await?,
            )
        }
    };

    tracing::info!(backend = store.backend(), "resident store ready");
    Ok(store)
}

/// Creates the configured roster when the store holds no residents yet.
pub async fn seed_if_empty(store: &dyn ResidentStore, seeds: &[NewResident]) -> Result<usize, StoreError> {
    if seeds.is_empty() || !store.list_residents().await?.is_empty() {
        return Ok(0);
    }

    let now = time::OffsetDateTime::now_utc();
    for seed in seeds {
        store.create_resident(Resident::from_new(seed.clone(), now)).await?;
    }

    tracing::info!(count = seeds.len(), "seeded resident roster");
    Ok(seeds.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use water_client::MeterCount;

    fn seed(apartment: &str) -> NewResident {
        NewResident {
            name: "Seed".to_string(),
            apartment: apartment.to_string(),
            email: None,
            meter_count: MeterCount::new(1).unwrap(),
            meter_ids: vec![apartment.to_string()],
        }
    }

    #[tokio::test]
    async fn seeding_only_fills_an_empty_store() {
        let store = MemoryStore::new();
        let seeds = vec![seed("7-1"), seed("7-2")];

        assert_eq!(seed_if_empty(&store, &seeds).await.unwrap(), 2);
        assert_eq!(seed_if_empty(&store, &seeds).await.unwrap(), 0);
        assert_eq!(store.list_residents().await.unwrap().len(), 2);
    }

    #[test]
    fn only_unavailability_is_retryable() {
        assert!(StoreError::Unavailable("timeout".into()).is_retryable());
        assert!(!StoreError::Conflict("x".into()).is_retryable());
        assert!(!StoreError::ResidentNotFound(ResidentId::new("x")).is_retryable());
    }
}
