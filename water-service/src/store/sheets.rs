use std::time::{Duration, Instant};

use reqwest::{Client, Method};
use serde_json::{json, Value};
use time::{format_description::well_known::Rfc3339, macros::format_description, Date, OffsetDateTime};
use tokio::sync::{Mutex, RwLock};
use water_client::{
    history::sort_history, MeterCount, MeterValues, NewReading, Reading, ReadingId, Resident, ResidentId,
    ResidentPatch,
};

use super::{ResidentStore, StoreError};
use crate::retry::{is_retryable_status, RetryPolicy};

const RESIDENTS_SHEET: &str = "Residents";
const READINGS_SHEET: &str = "Readings";

const RESIDENT_HEADERS: [&str; 7] = ["ID", "Name", "Apartment", "Email", "Meters", "MeterIDs", "CreatedAt"];
const READING_HEADERS: [&str; 6] = ["ID", "ResidentID", "Date", "Meters", "Notes", "CreatedAt"];

/// One parsed spreadsheet row together with its 1-based row number.
#[derive(Debug, Clone)]
struct SheetRow<T> {
    row: u32,
    value: T,
}

#[derive(Debug, Clone, Default)]
struct Snapshot {
    residents: Vec<SheetRow<Resident>>,
    readings: Vec<SheetRow<(ResidentId, Reading)>>,
}

impl Snapshot {
    fn resident(&self, id: &ResidentId) -> Result<&SheetRow<Resident>, StoreError> {
        self.residents
            .iter()
            .find(|r| &r.value.id == id)
            .ok_or_else(|| StoreError::ResidentNotFound(id.clone()))
    }

    fn reading(&self, resident_id: &ResidentId, reading_id: &ReadingId) -> Result<&SheetRow<(ResidentId, Reading)>, StoreError> {
        self.readings
            .iter()
            .find(|r| &r.value.0 == resident_id && &r.value.1.id == reading_id)
            .ok_or_else(|| StoreError::ReadingNotFound {
                resident: resident_id.clone(),
                reading: reading_id.clone(),
            })
    }

    /// Rows are appended in creation order, so walking them bottom-up before
    /// the stable sort lets the later row win a `(date, created_at)` tie.
    fn readings_of(&self, resident_id: &ResidentId) -> Vec<Reading> {
        let mut readings: Vec<Reading> = self
            .readings
            .iter()
            .rev()
            .filter(|r| &r.value.0 == resident_id)
            .map(|r| r.value.1.clone())
            .collect();
        sort_history(&mut readings);
        readings
    }

    fn assemble(&self, resident: &Resident) -> Resident {
        let mut resident = resident.clone();
        resident.readings = self.readings_of(&resident.id);
        resident
    }
}

struct Cached {
    fetched_at: Instant,
    snapshot: Snapshot,
}

#[derive(Default)]
struct CacheState {
    generation: u64,
    entry: Option<Cached>,
}

/// TTL cache of the last snapshot. Every write bumps the generation, and a
/// snapshot whose fetch started before the bump is never stored.
struct SnapshotCache {
    ttl: Duration,
    state: RwLock<CacheState>,
}

impl SnapshotCache {
    fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            state: RwLock::new(CacheState::default()),
        }
    }

    /// Fresh cached snapshot if any, plus the generation to hand back to `fill`.
    async fn lookup(&self) -> (Option<Snapshot>, u64) {
        let state = self.state.read().await;
        let hit = state
            .entry
            .as_ref()
            .filter(|cached| cached.fetched_at.elapsed() < self.ttl)
            .map(|cached| cached.snapshot.clone());
        (hit, state.generation)
    }

    /// Stores `snapshot` unless a write happened since `generation` was read.
    async fn fill(&self, generation: u64, snapshot: Snapshot) -> bool {
        let mut state = self.state.write().await;
        if state.generation != generation {
            return false;
        }
        state.entry = Some(Cached {
            fetched_at: Instant::now(),
            snapshot,
        });
        true
    }

    async fn invalidate(&self) {
        let mut state = self.state.write().await;
        state.generation = state.generation.wrapping_add(1);
        state.entry = None;
    }
}

/// Spreadsheet backend over the Sheets v4 values API.
///
/// Reads are served from a snapshot cached for `cache_ttl`; every write goes
/// against a fresh snapshot and drops the cache afterwards.
pub struct SheetsStore {
    client: Client,
    base_url: String,
    spreadsheet_id: String,
    access_token: String,
    retry: RetryPolicy,
    residents_sheet_id: i64,
    readings_sheet_id: i64,
    cache: SnapshotCache,
    writes: Mutex<()>,
}

impl SheetsStore {
    /// Connects, creating both sheets and their header rows when missing.
    pub async fn connect(
        api_base_url: String,
        spreadsheet_id: String,
        access_token: String,
        cache_ttl: Duration,
        retry: RetryPolicy,
    ) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| StoreError::Backend(format!("failed to build HTTP client: {e}")))?;

        let mut store = Self {
            client,
            base_url: api_base_url.trim_end_matches('/').to_string(),
            spreadsheet_id,
            access_token,
            retry,
            residents_sheet_id: 0,
            readings_sheet_id: 0,
            cache: SnapshotCache::new(cache_ttl),
            writes: Mutex::new(()),
        };

        let mut ids = store.sheet_ids().await?;
        let missing: Vec<Value> = [RESIDENTS_SHEET, READINGS_SHEET]
            .into_iter()
            .filter(|title| !ids.iter().any(|(t, _)| t == title))
            .map(|title| json!({ "addSheet": { "properties": { "title": title } } }))
            .collect();
        if !missing.is_empty() {
            store.batch_update("sheets.add_sheet", missing).await?;
            ids = store.sheet_ids().await?;
        }

        store.residents_sheet_id = find_sheet_id(&ids, RESIDENTS_SHEET)?;
        store.readings_sheet_id = find_sheet_id(&ids, READINGS_SHEET)?;

        store
            .put_row("sheets.write_headers", &header_range(RESIDENTS_SHEET, RESIDENT_HEADERS.len()), headers(&RESIDENT_HEADERS))
            .await?;
        store
            .put_row("sheets.write_headers", &header_range(READINGS_SHEET, READING_HEADERS.len()), headers(&READING_HEADERS))
            .await?;

        tracing::info!(spreadsheet_id = %store.spreadsheet_id, "connected to spreadsheet resident store");
        Ok(store)
    }

    fn spreadsheet_url(&self) -> String {
        format!("{}/v4/spreadsheets/{}", self.base_url, self.spreadsheet_id)
    }

    fn values_url(&self, range: &str) -> String {
        format!("{}/values/{}", self.spreadsheet_url(), range)
    }

    async fn call(
        &self,
        operation: &'static str,
        method: Method,
        url: String,
        body: Option<Value>,
    ) -> Result<Value, StoreError> {
        let method = &method;
        let url = &url;
        let body = body.as_ref();
        self.retry
            .run(operation, || async move {
                let mut req = self
                    .client
                    .request(method.clone(), url.as_str())
                    .bearer_auth(&self.access_token);
                if let Some(body) = body {
                    req = req.json(body);
                }

                let resp = req.send().await.map_err(transport_error)?;
                let status = resp.status();
                if !status.is_success() {
                    let text = resp.text().await.unwrap_or_default();
                    return Err(status_error(status.as_u16(), &text));
                }
                resp.json::<Value>()
                    .await
                    .map_err(|e| StoreError::Corrupt(format!("unreadable sheets response: {e}")))
            })
            .await
    }

    async fn sheet_ids(&self) -> Result<Vec<(String, i64)>, StoreError> {
        let url = format!("{}?fields=sheets.properties", self.spreadsheet_url());
        let body = self.call("sheets.get_metadata", Method::GET, url, None).await?;
        Ok(body["sheets"]
            .as_array()
            .map(|sheets| {
                sheets
                    .iter()
                    .filter_map(|s| {
                        let props = &s["properties"];
                        Some((props["title"].as_str()?.to_string(), props["sheetId"].as_i64()?))
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn batch_update(&self, operation: &'static str, requests: Vec<Value>) -> Result<(), StoreError> {
        let url = format!("{}:batchUpdate", self.spreadsheet_url());
        self.call(operation, Method::POST, url, Some(json!({ "requests": requests })))
            .await?;
        Ok(())
    }

    async fn get_rows(&self, range: &str) -> Result<Vec<Vec<Value>>, StoreError> {
        let body = self
            .call("sheets.get_values", Method::GET, self.values_url(range), None)
            .await?;
        Ok(rows_of(&body))
    }

    async fn put_row(&self, operation: &'static str, range: &str, row: Vec<Value>) -> Result<(), StoreError> {
        let url = format!("{}?valueInputOption=RAW", self.values_url(range));
        self.call(operation, Method::PUT, url, Some(json!({ "values": [row] })))
            .await?;
        Ok(())
    }

    async fn append_rows(&self, operation: &'static str, sheet: &str, rows: Vec<Vec<Value>>) -> Result<(), StoreError> {
        let url = format!(
            "{}:append?valueInputOption=RAW&insertDataOption=INSERT_ROWS",
            self.values_url(&format!("{sheet}!A1"))
        );
        self.call(operation, Method::POST, url, Some(json!({ "values": rows })))
            .await?;
        Ok(())
    }

    async fn fetch_snapshot(&self) -> Result<Snapshot, StoreError> {
        let resident_rows = self.get_rows(&format!("{RESIDENTS_SHEET}!A2:G")).await?;
        let reading_rows = self.get_rows(&format!("{READINGS_SHEET}!A2:F")).await?;
        Ok(parse_snapshot(&resident_rows, &reading_rows))
    }

    async fn snapshot(&self) -> Result<Snapshot, StoreError> {
        let (hit, generation) = self.cache.lookup().await;
        if let Some(snapshot) = hit {
            return Ok(snapshot);
        }

        let snapshot = self.fetch_snapshot().await?;
        if !self.cache.fill(generation, snapshot.clone()).await {
            tracing::debug!("spreadsheet changed during fetch; snapshot not cached");
        }
        Ok(snapshot)
    }

    async fn invalidate(&self) {
        self.cache.invalidate().await;
    }
}

#[async_trait::async_trait]
impl ResidentStore for SheetsStore {
    fn backend(&self) -> &'static str {
        "sheets"
    }

    async fn list_residents(&self) -> Result<Vec<Resident>, StoreError> {
        let snapshot = self.snapshot().await?;
        Ok(snapshot.residents.iter().map(|r| snapshot.assemble(&r.value)).collect())
    }

    async fn get_resident(&self, id: &ResidentId) -> Result<Resident, StoreError> {
        let snapshot = self.snapshot().await?;
        let row = snapshot.resident(id)?;
        Ok(snapshot.assemble(&row.value))
    }

    async fn create_resident(&self, resident: Resident) -> Result<Resident, StoreError> {
        let _guard = self.writes.lock().await;
        let snapshot = self.fetch_snapshot().await?;
        if snapshot.resident(&resident.id).is_ok() {
            return Err(StoreError::Conflict(format!("resident {}", resident.id)));
        }

        self.append_rows("sheets.append_resident", RESIDENTS_SHEET, vec![resident_to_row(&resident)?])
            .await?;
        if !resident.readings.is_empty() {
            let rows = resident
                .readings
                .iter()
                .map(|r| reading_to_row(&resident.id, r))
                .collect::<Result<Vec<_>, _>>()?;
            self.append_rows("sheets.append_reading", READINGS_SHEET, rows).await?;
        }
        self.invalidate().await;

        tracing::info!(resident_id = %resident.id, apartment = %resident.apartment, "resident created");
        let mut resident = resident;
        sort_history(&mut resident.readings);
        Ok(resident)
    }

    async fn update_resident(&self, id: &ResidentId, patch: ResidentPatch) -> Result<Resident, StoreError> {
        let _guard = self.writes.lock().await;
        let snapshot = self.fetch_snapshot().await?;
        let row = snapshot.resident(id)?;

        let mut resident = snapshot.assemble(&row.value);
        patch.apply(&mut resident);
        self.put_row(
            "sheets.update_resident",
            &row_range(RESIDENTS_SHEET, row.row, RESIDENT_HEADERS.len()),
            resident_to_row(&resident)?,
        )
        .await?;
        self.invalidate().await;
        Ok(resident)
    }

    async fn delete_resident(&self, id: &ResidentId) -> Result<(), StoreError> {
        let _guard = self.writes.lock().await;
        let snapshot = self.fetch_snapshot().await?;
        let resident_row = snapshot.resident(id)?.row;

        let reading_rows: Vec<u32> = snapshot
            .readings
            .iter()
            .filter(|r| &r.value.0 == id)
            .map(|r| r.row)
            .collect();

        let mut requests = delete_row_requests(self.readings_sheet_id, reading_rows);
        requests.extend(delete_row_requests(self.residents_sheet_id, vec![resident_row]));
        self.batch_update("sheets.delete_resident", requests).await?;
        self.invalidate().await;

        tracing::info!(resident_id = %id, "resident deleted with its readings");
        Ok(())
    }

    async fn add_reading(&self, resident_id: &ResidentId, reading: Reading) -> Result<Reading, StoreError> {
        let _guard = self.writes.lock().await;
        let snapshot = self.fetch_snapshot().await?;
        snapshot.resident(resident_id)?;
        if snapshot.reading(resident_id, &reading.id).is_ok() {
            return Err(StoreError::Conflict(format!(
                "reading {} of resident {}",
                reading.id, resident_id
            )));
        }

        self.append_rows("sheets.append_reading", READINGS_SHEET, vec![reading_to_row(resident_id, &reading)?])
            .await?;
        self.invalidate().await;
        Ok(reading)
    }

    async fn update_reading(
        &self,
        resident_id: &ResidentId,
        reading_id: &ReadingId,
        new: NewReading,
    ) -> Result<Reading, StoreError> {
        let _guard = self.writes.lock().await;
        let snapshot = self.fetch_snapshot().await?;
        let row = snapshot.reading(resident_id, reading_id)?;

        let mut reading = row.value.1.clone();
        reading.replace(new);
        self.put_row(
            "sheets.update_reading",
            &row_range(READINGS_SHEET, row.row, READING_HEADERS.len()),
            reading_to_row(resident_id, &reading)?,
        )
        .await?;
        self.invalidate().await;
        Ok(reading)
    }

    async fn delete_reading(&self, resident_id: &ResidentId, reading_id: &ReadingId) -> Result<(), StoreError> {
        let _guard = self.writes.lock().await;
        let snapshot = self.fetch_snapshot().await?;
        let row = snapshot.reading(resident_id, reading_id)?.row;

        self.batch_update("sheets.delete_reading", delete_row_requests(self.readings_sheet_id, vec![row]))
            .await?;
        self.invalidate().await;
        Ok(())
    }
}

fn transport_error(e: reqwest::Error) -> StoreError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        StoreError::Unavailable(e.to_string())
    } else {
        StoreError::Backend(e.to_string())
    }
}

fn status_error(status: u16, body: &str) -> StoreError {
    let msg = format!("sheets API returned {status}: {}", body.trim());
    if is_retryable_status(status) {
        StoreError::Unavailable(msg)
    } else {
        StoreError::Backend(msg)
    }
}

fn find_sheet_id(ids: &[(String, i64)], title: &str) -> Result<i64, StoreError> {
    ids.iter()
        .find(|(t, _)| t == title)
        .map(|(_, id)| *id)
        .ok_or_else(|| StoreError::Backend(format!("sheet {title} missing after creation")))
}

fn headers(names: &[&str]) -> Vec<Value> {
    names.iter().map(|n| Value::String((*n).to_string())).collect()
}

/// Column letter for a 1-based column number; the sheets here never pass `Z`.
fn column_letter(columns: usize) -> char {
    (b'A' + (columns.clamp(1, 26) - 1) as u8) as char
}

fn header_range(sheet: &str, columns: usize) -> String {
    row_range(sheet, 1, columns)
}

fn row_range(sheet: &str, row: u32, columns: usize) -> String {
    format!("{sheet}!A{row}:{}{row}", column_letter(columns))
}

/// Row deletions ordered bottom-up so earlier deletes never shift later ones.
fn delete_row_requests(sheet_id: i64, mut rows: Vec<u32>) -> Vec<Value> {
    rows.sort_unstable_by(|a, b| b.cmp(a));
    rows.dedup();
    rows.into_iter()
        .map(|row| {
            json!({
                "deleteDimension": {
                    "range": {
                        "sheetId": sheet_id,
                        "dimension": "ROWS",
                        "startIndex": row - 1,
                        "endIndex": row,
                    }
                }
            })
        })
        .collect()
}

fn rows_of(body: &Value) -> Vec<Vec<Value>> {
    body["values"]
        .as_array()
        .map(|rows| {
            rows.iter()
                .map(|row| row.as_array().cloned().unwrap_or_default())
                .collect()
        })
        .unwrap_or_default()
}

/// Cell text; Sheets omits trailing empty cells, so missing cells read as "".
fn cell(row: &[Value], index: usize) -> String {
    match row.get(index) {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        _ => String::new(),
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

fn parse_date(s: &str) -> Result<Date, StoreError> {
    Date::parse(s, format_description!("[year]-[month]-[day]"))
        .map_err(|e| StoreError::Corrupt(format!("bad date {s:?}: {e}")))
}

fn format_instant(at: OffsetDateTime) -> Result<String, StoreError> {
    at.format(&Rfc3339)
        .map_err(|e| StoreError::Backend(format!("failed to format timestamp: {e}")))
}

fn encode_json<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Backend(format!("failed to encode cell: {e}")))
}

fn resident_to_row(resident: &Resident) -> Result<Vec<Value>, StoreError> {
    Ok(vec![
        json!(resident.id.as_str()),
        json!(resident.name),
        json!(resident.apartment),
        json!(resident.email.clone().unwrap_or_default()),
        json!(resident.meter_count.get()),
        json!(encode_json(&resident.meter_ids)?),
        json!(format_instant(resident.created_at)?),
    ])
}

fn resident_from_row(row: &[Value]) -> Result<Resident, StoreError> {
    let id = cell(row, 0);
    let meters = cell(row, 4);
    let meter_count = meters
        .parse::<u32>()
        .ok()
        .and_then(|n| MeterCount::new(n).ok())
        .ok_or_else(|| StoreError::Corrupt(format!("resident {id}: bad meter count {meters:?}")))?;

    let meter_ids_raw = cell(row, 5);
    let meter_ids = if meter_ids_raw.is_empty() {
        Vec::new()
    } else {
        serde_json::from_str(&meter_ids_raw)
            .map_err(|e| StoreError::Corrupt(format!("resident {id}: bad meter ids: {e}")))?
    };

    let created_raw = cell(row, 6);
    let created_at = if created_raw.is_empty() {
        OffsetDateTime::UNIX_EPOCH
    } else {
        OffsetDateTime::parse(&created_raw, &Rfc3339)
            .map_err(|e| StoreError::Corrupt(format!("resident {id}: bad timestamp: {e}")))?
    };

    Ok(Resident {
        id: ResidentId::new(id),
        name: cell(row, 1),
        apartment: cell(row, 2),
        email: non_empty(cell(row, 3)),
        meter_count,
        meter_ids,
        created_at,
        readings: Vec::new(),
    })
}

fn reading_to_row(resident_id: &ResidentId, reading: &Reading) -> Result<Vec<Value>, StoreError> {
    Ok(vec![
        json!(reading.id.as_str()),
        json!(resident_id.as_str()),
        json!(reading.date.to_string()),
        json!(encode_json(&reading.meters)?),
        json!(reading.notes.clone().unwrap_or_default()),
        json!(format_instant(reading.created_at)?),
    ])
}

fn reading_from_row(row: &[Value]) -> Result<(ResidentId, Reading), StoreError> {
    let id = cell(row, 0);
    let date = parse_date(&cell(row, 2))?;

    let meters_raw = cell(row, 3);
    let meters: MeterValues = if meters_raw.is_empty() {
        MeterValues::new()
    } else {
        serde_json::from_str(&meters_raw)
            .map_err(|e| StoreError::Corrupt(format!("reading {id}: bad meter values: {e}")))?
    };

    // Rows entered by hand often lack a creation instant.
    let created_raw = cell(row, 5);
    let created_at = if created_raw.is_empty() {
        date.midnight().assume_utc()
    } else {
        OffsetDateTime::parse(&created_raw, &Rfc3339)
            .map_err(|e| StoreError::Corrupt(format!("reading {id}: bad timestamp: {e}")))?
    };

    let reading = Reading {
        id: ReadingId::new(id),
        date,
        meters,
        created_at,
        notes: non_empty(cell(row, 4)),
    };
    Ok((ResidentId::new(cell(row, 1)), reading))
}

/// Parses data rows (header excluded). Blank rows are skipped; rows that do
/// not parse are logged and skipped so one bad edit does not hide the sheet.
fn parse_snapshot(resident_rows: &[Vec<Value>], reading_rows: &[Vec<Value>]) -> Snapshot {
    fn parse_rows<T>(rows: &[Vec<Value>], kind: &'static str, parse: fn(&[Value]) -> Result<T, StoreError>) -> Vec<SheetRow<T>> {
        rows.iter()
            .enumerate()
            .filter(|(_, row)| !cell(row, 0).is_empty())
            .filter_map(|(i, row)| {
                let row_number = i as u32 + 2;
                match parse(row) {
                    Ok(value) => Some(SheetRow { row: row_number, value }),
                    Err(e) => {
                        tracing::warn!(error = %e, sheet = kind, row = row_number, "skipping unreadable row");
                        metrics::counter!("sheets_rows_skipped_total", "sheet" => kind).increment(1);
                        None
                    }
                }
            })
            .collect()
    }

    Snapshot {
        residents: parse_rows(resident_rows, RESIDENTS_SHEET, resident_from_row),
        readings: parse_rows(reading_rows, READINGS_SHEET, reading_from_row),
    }
}
