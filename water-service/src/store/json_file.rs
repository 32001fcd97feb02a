use std::path::PathBuf;

use tokio::sync::RwLock;
use water_client::{NewReading, Reading, ReadingId, Resident, ResidentId, ResidentPatch};

use super::{memory::Roster, ResidentStore, StoreError};

/// Local persistence: the whole roster as one JSON array on disk.
///
/// Each write mutates a copy, writes it to `<path>.tmp`, renames it over the
/// data file and only then publishes the copy. A failed write leaves both the
/// file and the in-memory state untouched.
pub struct JsonFileStore {
    path: PathBuf,
    roster: RwLock<Roster>,
}

impl JsonFileStore {
    /// Loads the data file, or starts empty when it does not exist yet.
    pub async fn open<P: Into<PathBuf>>(path: P) -> Result<Self, StoreError> {
        let path = path.into();
        let residents: Vec<Resident> = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| StoreError::Corrupt(format!("{}: {e}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(StoreError::Backend(format!(
                    "failed to read {}: {e}",
                    path.display()
                )))
            }
        };

        tracing::info!(path = %path.display(), residents = residents.len(), "loaded resident data file");

        Ok(Self {
            path,
            roster: RwLock::new(Roster::from_residents(residents)),
        })
    }

    async fn persist(&self, roster: &Roster) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(&roster.residents())
            .map_err(|e| StoreError::Backend(format!("failed to encode roster: {e}")))?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| StoreError::Backend(format!("failed to create {}: {e}", dir.display())))?;
        }
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| StoreError::Backend(format!("failed to write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| StoreError::Backend(format!("failed to replace {}: {e}", self.path.display())))?;

        metrics::counter!("json_store_writes_total").increment(1);
        Ok(())
    }

    /// Applies `change` to a copy of the roster, persists it, then publishes it.
    async fn write_with<T, F>(&self, change: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Roster) -> Result<T, StoreError>,
    {
        let mut guard = self.roster.write().await;
        let mut next = guard.clone();
        let out = change(&mut next)?;
        self.persist(&next).await?;
        *guard = next;
        Ok(out)
    }
}

#[async_trait::async_trait]
impl ResidentStore for JsonFileStore {
    fn backend(&self) -> &'static str {
        "json_file"
    }

    async fn list_residents(&self) -> Result<Vec<Resident>, StoreError> {
        Ok(self.roster.read().await.residents())
    }

    async fn get_resident(&self, id: &ResidentId) -> Result<Resident, StoreError> {
        self.roster.read().await.get(id).cloned()
    }

    async fn create_resident(&self, resident: Resident) -> Result<Resident, StoreError> {
        self.write_with(|roster| roster.create(resident)).await
    }

    async fn update_resident(&self, id: &ResidentId, patch: ResidentPatch) -> Result<Resident, StoreError> {
        self.write_with(|roster| roster.update(id, patch)).await
    }

    async fn delete_resident(&self, id: &ResidentId) -> Result<(), StoreError> {
        self.write_with(|roster| roster.delete(id).map(|_| ())).await
    }

    async fn add_reading(&self, resident_id: &ResidentId, reading: Reading) -> Result<Reading, StoreError> {
        self.write_with(|roster| roster.add_reading(resident_id, reading)).await
    }

    async fn update_reading(
        &self,
        resident_id: &ResidentId,
        reading_id: &ReadingId,
        new: NewReading,
    ) -> Result<Reading, StoreError> {
        self.write_with(|roster| roster.update_reading(resident_id, reading_id, new))
            .await
    }

    async fn delete_reading(&self, resident_id: &ResidentId, reading_id: &ReadingId) -> Result<(), StoreError> {
        self.write_with(|roster| roster.delete_reading(resident_id, reading_id).map(|_| ()))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::tests::{new_reading, resident};
    use time::macros::{date, datetime};

    #[tokio::test]
    async fn missing_file_opens_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path().join("residents.json")).await.unwrap();
        assert!(store.list_residents().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn writes_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("residents.json");

        let store = JsonFileStore::open(&path).await.unwrap();
        let r = store.create_resident(resident("7-2", 2)).await.unwrap();
        let reading = Reading::from_new(
            new_reading(date!(2024 - 02 - 01), &[(1, 100.0), (2, 50.0)]),
            datetime!(2024-02-01 09:00:00 UTC),
        );
        store.add_reading(&r.id, reading.clone()).await.unwrap();
        drop(store);

        let reopened = JsonFileStore::open(&path).await.unwrap();
        let loaded = reopened.get_resident(&r.id).await.unwrap();
        assert_eq!(loaded.meter_count.get(), 2);
        assert_eq!(loaded.readings, vec![reading]);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn delete_cascades_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("residents.json");

        let store = JsonFileStore::open(&path).await.unwrap();
        let keep = store.create_resident(resident("7-1", 1)).await.unwrap();
        let gone = store.create_resident(resident("7-3", 1)).await.unwrap();
        let reading = Reading::from_new(new_reading(date!(2024 - 02 - 01), &[(1, 1.0)]), datetime!(2024-02-01 09:00:00 UTC));
        store.add_reading(&gone.id, reading).await.unwrap();
        store.delete_resident(&gone.id).await.unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let on_disk: Vec<Resident> = serde_json::from_str(&raw).unwrap();
        assert_eq!(on_disk.len(), 1);
        assert_eq!(on_disk[0].id, keep.id);
    }

    #[tokio::test]
    async fn failed_change_leaves_state_alone() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path().join("residents.json")).await.unwrap();

        let res = store
            .add_reading(
                &ResidentId::new("missing"),
                Reading::from_new(new_reading(date!(2024 - 02 - 01), &[(1, 1.0)]), datetime!(2024-02-01 09:00:00 UTC)),
            )
            .await;

        assert!(matches!(res, Err(StoreError::ResidentNotFound(_))));
        assert!(!dir.path().join("residents.json").exists());
    }

    #[tokio::test]
    async fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("residents.json");
        std::fs::write(&path, "{not json").unwrap();

        assert!(matches!(JsonFileStore::open(&path).await, Err(StoreError::Corrupt(_))));
    }
}
