use futures::StreamExt;
use time::OffsetDateTime;
use water_client::{NewReading, Reading, ReadingId, ResidentId};

use crate::{
    pipeline::{Envelope, ImportedReading, PipelineError, Sink},
    store::{SharedStore, StoreError},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ImportReport {
    pub imported: usize,
    pub duplicates: usize,
    pub rejected: usize,
}

/// Writes imported readings into the resident store.
///
/// Reading ids are derived from the row content, so importing the same file
/// twice stores each reading once; the second run counts duplicates.
pub struct StoreSink {
    store: SharedStore,
}

impl StoreSink {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }
}

fn hash_str(hasher: &mut blake3::Hasher, s: &str) {
    let len = s.len() as u32;
    hasher.update(&len.to_le_bytes());
    hasher.update(s.as_bytes());
}

/// Content-derived reading id: blake3 over resident, date and meter values.
/// Notes are left out, so re-importing with an edited note is still a duplicate.
pub fn import_reading_id(resident_id: &ResidentId, reading: &NewReading) -> ReadingId {
    let mut h = blake3::Hasher::new();
    hash_str(&mut h, resident_id.as_str());
    h.update(&reading.date.to_julian_day().to_le_bytes());
    for (index, value) in reading.meters.iter() {
        h.update(&index.to_le_bytes());
        h.update(&value.to_bits().to_le_bytes());
    }
    let hex = h.finalize().to_hex();
    ReadingId::new(format!("imp-{}", &hex.as_str()[..24]))
}

#[async_trait::async_trait]
impl Sink<ImportedReading> for StoreSink {
    type Summary = ImportReport;

    async fn run<S>(&self, mut input: S) -> Result<ImportReport, PipelineError>
    where
        S: futures::Stream<Item = Result<Envelope<ImportedReading>, PipelineError>> + Send + Unpin + 'static,
    {
        let mut report = ImportReport::default();

        while let Some(item) = input.next().await {
            let env = match item {
                Ok(env) => env,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping rejected import row");
                    report.rejected += 1;
                    continue;
                }
            };

            let ImportedReading {
                line,
                resident_id,
                reading,
            } = env.payload;
            let id = import_reading_id(&resident_id, &reading);
            let reading = Reading::with_id(id, reading, OffsetDateTime::now_utc());

            match self.store.add_reading(&resident_id, reading).await {
                Ok(_) => {
                    metrics::counter!("readings_imported_total").increment(1);
                    report.imported += 1;
                }
                Err(StoreError::Conflict(_)) => {
                    tracing::debug!(line, resident_id = %resident_id, "reading already imported");
                    metrics::counter!("readings_import_duplicates_total").increment(1);
                    report.duplicates += 1;
                }
                Err(StoreError::ResidentNotFound(id)) => {
                    tracing::warn!(line, resident_id = %id, "resident vanished during import");
                    report.rejected += 1;
                }
                Err(e) => {
                    tracing::error!(error = %e, line, "import aborted by store failure");
                    return Err(PipelineError::Sink(e.to_string()));
                }
            }
        }

        tracing::info!(
            imported = report.imported,
            duplicates = report.duplicates,
            rejected = report.rejected,
            "reading import finished"
        );
        Ok(report)
    }
}
