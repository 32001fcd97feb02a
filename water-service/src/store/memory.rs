use std::collections::BTreeMap;

use tokio::sync::RwLock;
use water_client::{
    history::{insert_reading, remove_reading, replace_reading, sort_history},
    NewReading, Reading, ReadingId, Resident, ResidentId, ResidentPatch,
};

use super::{ResidentStore, StoreError};

/// All residents with their readings, keyed by id.
///
/// Shared by the in-memory and JSON file stores; every method keeps each
/// resident's readings newest-first.
#[derive(Debug, Clone, Default)]
pub(crate) struct Roster(BTreeMap<ResidentId, Resident>);

impl Roster {
    pub(crate) fn from_residents(residents: Vec<Resident>) -> Self {
        let mut roster = Self::default();
        for mut resident in residents {
            sort_history(&mut resident.readings);
            roster.0.insert(resident.id.clone(), resident);
        }
        roster
    }

    pub(crate) fn residents(&self) -> Vec<Resident> {
        self.0.values().cloned().collect()
    }

    pub(crate) fn get(&self, id: &ResidentId) -> Result<&Resident, StoreError> {
        self.0
            .get(id)
            .ok_or_else(|| StoreError::ResidentNotFound(id.clone()))
    }

    fn get_mut(&mut self, id: &ResidentId) -> Result<&mut Resident, StoreError> {
        self.0
            .get_mut(id)
            .ok_or_else(|| StoreError::ResidentNotFound(id.clone()))
    }

    pub(crate) fn create(&mut self, mut resident: Resident) -> Result<Resident, StoreError> {
        if self.0.contains_key(&resident.id) {
            return Err(StoreError::Conflict(format!("resident {}", resident.id)));
        }
        sort_history(&mut resident.readings);
        self.0.insert(resident.id.clone(), resident.clone());
        Ok(resident)
    }

    pub(crate) fn update(&mut self, id: &ResidentId, patch: ResidentPatch) -> Result<Resident, StoreError> {
        let resident = self.get_mut(id)?;
        patch.apply(resident);
        Ok(resident.clone())
    }

    /// Removes the resident together with every reading it owns.
    pub(crate) fn delete(&mut self, id: &ResidentId) -> Result<Resident, StoreError> {
        self.0
            .remove(id)
            .ok_or_else(|| StoreError::ResidentNotFound(id.clone()))
    }

    pub(crate) fn add_reading(&mut self, resident_id: &ResidentId, reading: Reading) -> Result<Reading, StoreError> {
        let resident = self.get_mut(resident_id)?;
        if resident.readings.iter().any(|r| r.id == reading.id) {
            return Err(StoreError::Conflict(format!(
                "reading {} of resident {}",
                reading.id, resident_id
            )));
        }
        insert_reading(&mut resident.readings, reading.clone());
        Ok(reading)
    }

    pub(crate) fn update_reading(
        &mut self,
        resident_id: &ResidentId,
        reading_id: &ReadingId,
        new: NewReading,
    ) -> Result<Reading, StoreError> {
        let resident = self.get_mut(resident_id)?;
        replace_reading(&mut resident.readings, reading_id, new).ok_or_else(|| StoreError::ReadingNotFound {
            resident: resident_id.clone(),
            reading: reading_id.clone(),
        })
    }

    pub(crate) fn delete_reading(
        &mut self,
        resident_id: &ResidentId,
        reading_id: &ReadingId,
    ) -> Result<Reading, StoreError> {
        let resident = self.get_mut(resident_id)?;
        remove_reading(&mut resident.readings, reading_id).ok_or_else(|| StoreError::ReadingNotFound {
            resident: resident_id.clone(),
            reading: reading_id.clone(),
        })
    }
}

/// Process-local store; contents are lost on exit.
#[derive(Debug, Default)]
pub struct MemoryStore {
    roster: RwLock<Roster>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_residents(residents: Vec<Resident>) -> Self {
        Self {
            roster: RwLock::new(Roster::from_residents(residents)),
        }
    }
}

#[async_trait::async_trait]
impl ResidentStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn list_residents(&self) -> Result<Vec<Resident>, StoreError> {
        Ok(self.roster.read().await.residents())
    }

    async fn get_resident(&self, id: &ResidentId) -> Result<Resident, StoreError> {
        self.roster.read().await.get(id).cloned()
    }

    async fn create_resident(&self, resident: Resident) -> Result<Resident, StoreError> {
        self.roster.write().await.create(resident)
    }

    async fn update_resident(&self, id: &ResidentId, patch: ResidentPatch) -> Result<Resident, StoreError> {
        self.roster.write().await.update(id, patch)
    }

    async fn delete_resident(&self, id: &ResidentId) -> Result<(), StoreError> {
        self.roster.write().await.delete(id).map(|_| ())
    }

    async fn add_reading(&self, resident_id: &ResidentId, reading: Reading) -> Result<Reading, StoreError> {
        self.roster.write().await.add_reading(resident_id, reading)
    }

    async fn update_reading(
        &self,
        resident_id: &ResidentId,
        reading_id: &ReadingId,
        new: NewReading,
    ) -> Result<Reading, StoreError> {
        self.roster.write().await.update_reading(resident_id, reading_id, new)
    }

    async fn delete_reading(&self, resident_id: &ResidentId, reading_id: &ReadingId) -> Result<(), StoreError> {
        self.roster
            .write()
            .await
            .delete_reading(resident_id, reading_id)
            .map(|_| ())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use time::macros::{date, datetime};
    use water_client::{MeterCount, NewResident};

    pub(crate) fn resident(apartment: &str, meters: u32) -> Resident {
        Resident::from_new(
            NewResident {
                name: format!("Resident {apartment}"),
                apartment: apartment.to_string(),
                email: Some(format!("{apartment}@example.org")),
                meter_count: MeterCount::new(meters).unwrap(),
                meter_ids: vec![],
            },
            datetime!(2024-01-01 00:00:00 UTC),
        )
    }

    pub(crate) fn new_reading(date: time::Date, values: &[(u32, f64)]) -> NewReading {
        NewReading {
            date,
            meters: values.iter().copied().collect(),
            notes: None,
        }
    }

    #[tokio::test]
    async fn readings_come_back_newest_first() {
        let store = MemoryStore::new();
        let r = store.create_resident(resident("7-1", 1)).await.unwrap();

        for (d, v) in [(date!(2024 - 01 - 01), 10.0), (date!(2024 - 03 - 01), 30.0), (date!(2024 - 02 - 01), 20.0)] {
            let reading = Reading::from_new(new_reading(d, &[(1, v)]), datetime!(2024-03-05 00:00:00 UTC));
            store.add_reading(&r.id, reading).await.unwrap();
        }

        let dates: Vec<_> = store
            .list_readings(&r.id)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.date)
            .collect();
        assert_eq!(dates, vec![date!(2024 - 03 - 01), date!(2024 - 02 - 01), date!(2024 - 01 - 01)]);
    }

    #[tokio::test]
    async fn duplicate_ids_conflict() {
        let store = MemoryStore::new();
        let r = store.create_resident(resident("7-1", 1)).await.unwrap();
        assert!(matches!(store.create_resident(r.clone()).await, Err(StoreError::Conflict(_))));

        let reading = Reading::from_new(new_reading(date!(2024 - 01 - 01), &[(1, 1.0)]), datetime!(2024-01-01 00:00:00 UTC));
        store.add_reading(&r.id, reading.clone()).await.unwrap();
        assert!(matches!(store.add_reading(&r.id, reading).await, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn edit_keeps_id_and_creation_instant() {
        let store = MemoryStore::new();
        let r = store.create_resident(resident("7-1", 1)).await.unwrap();
        let created = datetime!(2024-02-01 12:00:00 UTC);
        let reading = Reading::from_new(new_reading(date!(2024 - 02 - 01), &[(1, 5.0)]), created);
        let id = reading.id.clone();
        store.add_reading(&r.id, reading).await.unwrap();

        let edited = store
            .update_reading(&r.id, &id, new_reading(date!(2024 - 02 - 02), &[(1, 6.0)]))
            .await
            .unwrap();

        assert_eq!(edited.id, id);
        assert_eq!(edited.created_at, created);
        assert_eq!(edited.meters.get(1), Some(6.0));

        let missing = store
            .update_reading(&r.id, &ReadingId::new("nope"), new_reading(date!(2024 - 02 - 02), &[(1, 6.0)]))
            .await;
        assert!(matches!(missing, Err(StoreError::ReadingNotFound { .. })));
    }

    #[tokio::test]
    async fn deleting_resident_drops_its_readings() {
        let store = MemoryStore::new();
        let r = store.create_resident(resident("7-1", 1)).await.unwrap();
        let reading = Reading::from_new(new_reading(date!(2024 - 01 - 01), &[(1, 1.0)]), datetime!(2024-01-01 00:00:00 UTC));
        store.add_reading(&r.id, reading).await.unwrap();

        store.delete_resident(&r.id).await.unwrap();

        assert!(matches!(store.list_readings(&r.id).await, Err(StoreError::ResidentNotFound(_))));
        assert!(matches!(store.delete_resident(&r.id).await, Err(StoreError::ResidentNotFound(_))));
    }

    #[tokio::test]
    async fn patch_changes_meter_count_without_touching_readings() {
        let store = MemoryStore::new();
        let r = store.create_resident(resident("7-4/5", 1)).await.unwrap();
        let reading = Reading::from_new(new_reading(date!(2024 - 01 - 01), &[(1, 1.0)]), datetime!(2024-01-01 00:00:00 UTC));
        store.add_reading(&r.id, reading).await.unwrap();

        let updated = store
            .update_resident(
                &r.id,
                ResidentPatch {
                    meter_count: Some(MeterCount::new(2).unwrap()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.meter_count.get(), 2);
        assert_eq!(updated.readings.len(), 1);
        assert_eq!(updated.readings[0].meters.get(2), None);
    }
}
