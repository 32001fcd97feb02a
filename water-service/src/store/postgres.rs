use std::collections::HashMap;

use sqlx::postgres::{PgPool, PgPoolOptions};
use time::OffsetDateTime;
use water_client::{
    db::resident_queries as q,
    history::sort_history,
    NewReading, Reading, ReadingId, Resident, ResidentId, ResidentPatch,
};

use super::{ResidentStore, StoreError};
use crate::retry::RetryPolicy;

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Tls(_) => {
                StoreError::Unavailable(e.to_string())
            }
            sqlx::Error::Decode(_) | sqlx::Error::ColumnDecode { .. } => StoreError::Corrupt(e.to_string()),
            sqlx::Error::Database(ref db) if db.is_unique_violation() => StoreError::Conflict(db.message().to_string()),
            other => StoreError::Backend(other.to_string()),
        }
    }
}

/// TIMESTAMPTZ keeps microseconds. Instants are cut to that before insert so
/// the record handed back matches what a later read returns.
fn to_db_precision(at: OffsetDateTime) -> OffsetDateTime {
    at.replace_nanosecond(at.nanosecond() / 1_000 * 1_000).unwrap_or(at)
}

/// Resolves an insert whose key was already taken. A stored record equal to
/// the attempted one is an earlier attempt that committed before its reply
/// was lost; anything else is a real conflict.
fn settle_existing<T: PartialEq>(what: String, stored: Option<T>, attempted: &T) -> Result<(), StoreError> {
    match stored {
        Some(stored) if &stored == attempted => {
            tracing::debug!(record = %what, "insert already applied by an earlier attempt");
            Ok(())
        }
        _ => Err(StoreError::Conflict(what)),
    }
}

/// Resident row and its initial readings in one transaction. Returns `false`
/// without writing anything when the resident id is taken.
async fn insert_resident_tx(pool: &PgPool, resident: &Resident) -> Result<bool, StoreError> {
    let mut tx = pool.begin().await?;
    if !q::insert_resident(&mut *tx, resident).await? {
        return Ok(false);
    }
    for reading in &resident.readings {
        if !q::insert_reading(&mut *tx, resident.id.as_str(), reading).await? {
            return Err(StoreError::Conflict(format!(
                "reading {} of resident {}",
                reading.id, resident.id
            )));
        }
    }
    tx.commit().await?;
    Ok(true)
}

/// Hosted relational backend. Readings live in their own table and are
/// removed with their resident by the foreign key.
pub struct PgStore {
    pool: PgPool,
    retry: RetryPolicy,
}

impl PgStore {
    pub async fn connect(uri: &str, max_connections: u32, retry: RetryPolicy) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(uri)
            .await?;
        let store = Self::with_pool(pool, retry);
        let pool = &store.pool;
        store
            .retry
            .run("pg.ensure_schema", || async move { q::ensure_schema(pool).await.map_err(StoreError::from) })
            .await?;
        tracing::info!(max_connections, "connected to postgres resident store");
        Ok(store)
    }

    pub fn with_pool(pool: PgPool, retry: RetryPolicy) -> Self {
        Self { pool, retry }
    }

    async fn resident_row(&self, id: &ResidentId) -> Result<Resident, StoreError> {
        let pool = &self.pool;
        let row = self
            .retry
            .run("pg.get_resident", || async move {
                q::get_resident(pool, id.as_str()).await.map_err(StoreError::from)
            })
            .await?
            .ok_or_else(|| StoreError::ResidentNotFound(id.clone()))?;
        Ok(row.into_resident()?)
    }

    async fn readings_of(&self, id: &ResidentId) -> Result<Vec<Reading>, StoreError> {
        let pool = &self.pool;
        let rows = self
            .retry
            .run("pg.list_readings", || async move {
                q::list_readings(pool, id.as_str()).await.map_err(StoreError::from)
            })
            .await?;
        let mut readings: Vec<Reading> = rows.into_iter().map(Reading::from).collect();
        sort_history(&mut readings);
        Ok(readings)
    }
}

#[async_trait::async_trait]
impl ResidentStore for PgStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn list_residents(&self) -> Result<Vec<Resident>, StoreError> {
        let pool = &self.pool;
        let resident_rows = self
            .retry
            .run("pg.list_residents", || async move { q::list_residents(pool).await.map_err(StoreError::from) })
            .await?;
        let reading_rows = self
            .retry
            .run("pg.list_all_readings", || async move {
                q::list_all_readings(pool).await.map_err(StoreError::from)
            })
            .await?;

        let mut by_resident: HashMap<String, Vec<Reading>> = HashMap::new();
        for row in reading_rows {
            by_resident
                .entry(row.resident_id.clone())
                .or_default()
                .push(Reading::from(row));
        }

        resident_rows
            .into_iter()
            .map(|row| {
                let mut resident = row.into_resident()?;
                let mut readings = by_resident.remove(resident.id.as_str()).unwrap_or_default();
                sort_history(&mut readings);
                resident.readings = readings;
                Ok(resident)
            })
            .collect()
    }

    async fn get_resident(&self, id: &ResidentId) -> Result<Resident, StoreError> {
        let mut resident = self.resident_row(id).await?;
        resident.readings = self.readings_of(id).await?;
        Ok(resident)
    }

    async fn create_resident(&self, mut resident: Resident) -> Result<Resident, StoreError> {
        resident.created_at = to_db_precision(resident.created_at);
        for reading in &mut resident.readings {
            reading.created_at = to_db_precision(reading.created_at);
        }
        sort_history(&mut resident.readings);

        let pool = &self.pool;
        let r = &resident;
        let inserted = self
            .retry
            .run("pg.create_resident", || async move { insert_resident_tx(pool, r).await })
            .await?;
        if !inserted {
            let stored = match self.resident_row(&resident.id).await {
                Ok(stored) => Some(stored),
                Err(StoreError::ResidentNotFound(_)) => None,
                Err(e) => return Err(e),
            };
            let mut attempted = resident.clone();
            attempted.readings = Vec::new();
            settle_existing(format!("resident {}", resident.id), stored, &attempted)?;
        }
        tracing::info!(resident_id = %resident.id, apartment = %resident.apartment, "resident created");
        Ok(resident)
    }

    async fn update_resident(&self, id: &ResidentId, patch: ResidentPatch) -> Result<Resident, StoreError> {
        let mut resident = self.resident_row(id).await?;
        patch.apply(&mut resident);

        let pool = &self.pool;
        let r = &resident;
        let updated = self
            .retry
            .run("pg.update_resident", || async move {
                q::update_resident(pool, r).await.map_err(StoreError::from)
            })
            .await?;
        if !updated {
            return Err(StoreError::ResidentNotFound(id.clone()));
        }

        resident.readings = self.readings_of(id).await?;
        Ok(resident)
    }

    async fn delete_resident(&self, id: &ResidentId) -> Result<(), StoreError> {
        let pool = &self.pool;
        let deleted = self
            .retry
            .run("pg.delete_resident", || async move {
                q::delete_resident(pool, id.as_str()).await.map_err(StoreError::from)
            })
            .await?;
        if deleted {
            Ok(())
        } else {
            Err(StoreError::ResidentNotFound(id.clone()))
        }
    }

    async fn list_readings(&self, resident_id: &ResidentId) -> Result<Vec<Reading>, StoreError> {
        self.resident_row(resident_id).await?;
        self.readings_of(resident_id).await
    }

    async fn add_reading(&self, resident_id: &ResidentId, mut reading: Reading) -> Result<Reading, StoreError> {
        self.resident_row(resident_id).await?;
        reading.created_at = to_db_precision(reading.created_at);

        let pool = &self.pool;
        let r = &reading;
        let inserted = self
            .retry
            .run("pg.insert_reading", || async move {
                q::insert_reading(pool, resident_id.as_str(), r)
                    .await
                    .map_err(StoreError::from)
            })
            .await?;
        if !inserted {
            let stored = self
                .retry
                .run("pg.get_reading", || async move {
                    q::get_reading(pool, resident_id.as_str(), r.id.as_str())
                        .await
                        .map_err(StoreError::from)
                })
                .await?;
            settle_existing(
                format!("reading {} of resident {}", reading.id, resident_id),
                stored.map(Reading::from),
                &reading,
            )?;
        }
        Ok(reading)
    }

    async fn update_reading(
        &self,
        resident_id: &ResidentId,
        reading_id: &ReadingId,
        new: NewReading,
    ) -> Result<Reading, StoreError> {
        let pool = &self.pool;
        let new = &new;
        let row = self
            .retry
            .run("pg.update_reading", || async move {
                q::update_reading(
                    pool,
                    resident_id.as_str(),
                    reading_id.as_str(),
                    new.date,
                    &new.meters,
                    new.notes.as_deref(),
                )
                .await
                .map_err(StoreError::from)
            })
            .await?;

        row.map(Reading::from).ok_or_else(|| StoreError::ReadingNotFound {
            resident: resident_id.clone(),
            reading: reading_id.clone(),
        })
    }

    async fn delete_reading(&self, resident_id: &ResidentId, reading_id: &ReadingId) -> Result<(), StoreError> {
        let pool = &self.pool;
        let deleted = self
            .retry
            .run("pg.delete_reading", || async move {
                q::delete_reading(pool, resident_id.as_str(), reading_id.as_str())
                    .await
                    .map_err(StoreError::from)
            })
            .await?;
        if deleted {
            Ok(())
        } else {
            Err(StoreError::ReadingNotFound {
                resident: resident_id.clone(),
                reading: reading_id.clone(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{date, datetime};

    #[test]
    fn instants_are_cut_to_microseconds() {
        let at = datetime!(2024-03-01 08:00:00.123456789 UTC);
        assert_eq!(to_db_precision(at), datetime!(2024-03-01 08:00:00.123456 UTC));
        assert_eq!(to_db_precision(to_db_precision(at)), to_db_precision(at));
    }

    #[test]
    fn retried_insert_that_already_landed_is_not_a_conflict() {
        let attempted = Reading {
            id: ReadingId::new("x1"),
            date: date!(2024 - 03 - 01),
            meters: [(1, 10.5)].into_iter().collect(),
            created_at: to_db_precision(datetime!(2024-03-01 08:00:00.123456789 UTC)),
            notes: None,
        };

        assert!(settle_existing("reading x1".into(), Some(attempted.clone()), &attempted).is_ok());

        let mut different = attempted.clone();
        different.meters.insert(1, 11.0);
        assert!(matches!(
            settle_existing("reading x1".into(), Some(different), &attempted),
            Err(StoreError::Conflict(_))
        ));
        assert!(matches!(
            settle_existing::<Reading>("reading x1".into(), None, &attempted),
            Err(StoreError::Conflict(_))
        ));
    }

    #[test]
    fn connection_failures_map_to_retryable_errors() {
        use crate::retry::Retryable;

        let io = sqlx::Error::Io(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"));
        assert!(StoreError::from(io).is_retryable());
        assert!(StoreError::from(sqlx::Error::PoolTimedOut).is_retryable());
        assert!(!StoreError::from(sqlx::Error::RowNotFound).is_retryable());
    }
}
