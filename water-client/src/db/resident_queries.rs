use sqlx::{types::Json, Executor, PgPool, Postgres};
use time::{Date, OffsetDateTime};

use crate::{
    consumption::MeterCount,
    domain::{MeterValues, Reading, ReadingId, Resident, ResidentId},
};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ResidentRow {
    pub id: String,
    pub name: String,
    pub apartment: String,
    pub email: Option<String>,
    pub meter_count: i32,
    pub meter_ids: Json<Vec<String>>,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ReadingRow {
    pub id: String,
    pub resident_id: String,
    pub date: Date,
    pub meters: Json<MeterValues>,
    pub notes: Option<String>,
    pub created_at: OffsetDateTime,
}

impl ResidentRow {
    /// Builds the domain record without readings.
    pub fn into_resident(self) -> sqlx::Result<Resident> {
        let meter_count = u32::try_from(self.meter_count)
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))
            .and_then(|n| MeterCount::new(n).map_err(|e| sqlx::Error::Decode(Box::new(e))))?;

        Ok(Resident {
            id: ResidentId::new(self.id),
            name: self.name,
            apartment: self.apartment,
            email: self.email,
            meter_count,
            meter_ids: self.meter_ids.0,
            created_at: self.created_at,
            readings: Vec::new(),
        })
    }
}

impl From<ReadingRow> for Reading {
    fn from(row: ReadingRow) -> Self {
        Reading {
            id: ReadingId::new(row.id),
            date: row.date,
            meters: row.meters.0,
            created_at: row.created_at,
            notes: row.notes,
        }
    }
}

/// Creates both tables if missing. Readings follow their resident on delete.
pub async fn ensure_schema(pool: &PgPool) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS residents (
            id          TEXT PRIMARY KEY,
            name        TEXT NOT NULL,
            apartment   TEXT NOT NULL,
            email       TEXT,
            meter_count INTEGER NOT NULL CHECK (meter_count > 0),
            meter_ids   JSONB NOT NULL DEFAULT '[]'::jsonb,
            created_at  TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS readings (
            id          TEXT NOT NULL,
            resident_id TEXT NOT NULL REFERENCES residents(id) ON DELETE CASCADE,
            date        DATE NOT NULL,
            meters      JSONB NOT NULL,
            notes       TEXT,
            created_at  TIMESTAMPTZ NOT NULL,
            PRIMARY KEY (resident_id, id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn list_residents(pool: &PgPool) -> sqlx::Result<Vec<ResidentRow>> {
    sqlx::query_as::<_, ResidentRow>(
        r#"
        SELECT id, name, apartment, email, meter_count, meter_ids, created_at
        FROM residents
        ORDER BY created_at, id
        "#,
    )
    .fetch_all(pool)
    .await
}

pub async fn get_resident(pool: &PgPool, id: &str) -> sqlx::Result<Option<ResidentRow>> {
    sqlx::query_as::<_, ResidentRow>(
        r#"
        SELECT id, name, apartment, email, meter_count, meter_ids, created_at
        FROM residents
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await
}

/// Every reading in the building, newest first within each resident.
pub async fn list_all_readings(pool: &PgPool) -> sqlx::Result<Vec<ReadingRow>> {
    sqlx::query_as::<_, ReadingRow>(
        r#"
        SELECT id, resident_id, date, meters, notes, created_at
        FROM readings
        ORDER BY resident_id, date DESC, created_at DESC
        "#,
    )
    .fetch_all(pool)
    .await
}

pub async fn list_readings(pool: &PgPool, resident_id: &str) -> sqlx::Result<Vec<ReadingRow>> {
    sqlx::query_as::<_, ReadingRow>(
        r#"
        SELECT id, resident_id, date, meters, notes, created_at
        FROM readings
        WHERE resident_id = $1
        ORDER BY date DESC, created_at DESC
        "#,
    )
    .bind(resident_id)
    .fetch_all(pool)
    .await
}

/// Inserts the metadata row; returns `false` when the id is already taken.
pub async fn insert_resident<'e, E>(executor: E, resident: &Resident) -> sqlx::Result<bool>
where
    E: Executor<'e, Database = Postgres>,
{
    let result = sqlx::query(
        r#"
        INSERT INTO residents (id, name, apartment, email, meter_count, meter_ids, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (id) DO NOTHING
        "#,
    )
    .bind(resident.id.as_str())
    .bind(&resident.name)
    .bind(&resident.apartment)
    .bind(&resident.email)
    .bind(meter_count_param(resident.meter_count))
    .bind(Json(&resident.meter_ids))
    .bind(resident.created_at)
    .execute(executor)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Rewrites the metadata columns; returns `false` when no row matched.
pub async fn update_resident(pool: &PgPool, resident: &Resident) -> sqlx::Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE residents
        SET name = $2, apartment = $3, email = $4, meter_count = $5, meter_ids = $6
        WHERE id = $1
        "#,
    )
    .bind(resident.id.as_str())
    .bind(&resident.name)
    .bind(&resident.apartment)
    .bind(&resident.email)
    .bind(meter_count_param(resident.meter_count))
    .bind(Json(&resident.meter_ids))
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn delete_resident(pool: &PgPool, id: &str) -> sqlx::Result<bool> {
    let result = sqlx::query("DELETE FROM residents WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn get_reading(pool: &PgPool, resident_id: &str, reading_id: &str) -> sqlx::Result<Option<ReadingRow>> {
    sqlx::query_as::<_, ReadingRow>(
        r#"
        SELECT id, resident_id, date, meters, notes, created_at
        FROM readings
        WHERE resident_id = $1 AND id = $2
        "#,
    )
    .bind(resident_id)
    .bind(reading_id)
    .fetch_optional(pool)
    .await
}

/// Inserts a reading; returns `false` when the resident already has that id.
pub async fn insert_reading<'e, E>(executor: E, resident_id: &str, reading: &Reading) -> sqlx::Result<bool>
where
    E: Executor<'e, Database = Postgres>,
{
    let result = sqlx::query(
        r#"
        INSERT INTO readings (id, resident_id, date, meters, notes, created_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (resident_id, id) DO NOTHING
        "#,
    )
    .bind(reading.id.as_str())
    .bind(resident_id)
    .bind(reading.date)
    .bind(Json(&reading.meters))
    .bind(&reading.notes)
    .bind(reading.created_at)
    .execute(executor)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Full replace of date, meters and notes. `created_at` is never touched.
pub async fn update_reading(
    pool: &PgPool,
    resident_id: &str,
    reading_id: &str,
    date: Date,
    meters: &MeterValues,
    notes: Option<&str>,
) -> sqlx::Result<Option<ReadingRow>> {
    sqlx::query_as::<_, ReadingRow>(
        r#"
        UPDATE readings
        SET date = $3, meters = $4, notes = $5
        WHERE resident_id = $1 AND id = $2
        RETURNING id, resident_id, date, meters, notes, created_at
        "#,
    )
    .bind(resident_id)
    .bind(reading_id)
    .bind(date)
    .bind(Json(meters))
    .bind(notes)
    .fetch_optional(pool)
    .await
}

pub async fn delete_reading(pool: &PgPool, resident_id: &str, reading_id: &str) -> sqlx::Result<bool> {
    let result = sqlx::query("DELETE FROM readings WHERE resident_id = $1 AND id = $2")
        .bind(resident_id)
        .bind(reading_id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

fn meter_count_param(count: MeterCount) -> i32 {
    i32::try_from(count.get()).unwrap_or(i32::MAX)
}
