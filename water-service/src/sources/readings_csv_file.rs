use std::{fs::File, io::Read, path::PathBuf, time::SystemTime};

use csv::StringRecord;
use time::{macros::format_description, Date};
use water_client::{MeterValues, NewReading, ResidentId};

use crate::pipeline::{Envelope, EnvelopeStream, ImportedReading, PipelineError, Source};

/// CSV import of readings.
///
/// Expected header columns (by name):
/// - resident_id
/// - date (YYYY-MM-DD)
/// - meter_1 .. meter_N (blank cell = no value for that meter)
/// - notes (optional)
///
/// One file covers residents with different meter counts, so columns past a
/// resident's own count are left blank. A blank cell inside the resident's
/// count is passed through as a missing value; `ReadingValidation` then
/// rejects that row as a missing meter, naming its line.
pub struct ReadingsCsvFileSource {
    path: PathBuf,
}

impl ReadingsCsvFileSource {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

/// Column positions resolved once from the header row.
#[derive(Debug)]
struct Columns {
    resident_id: usize,
    date: usize,
    meters: Vec<(u32, usize)>,
    notes: Option<usize>,
}

impl Columns {
    fn from_headers(headers: &StringRecord) -> Result<Self, PipelineError> {
        let position = |name: &str| headers.iter().position(|h| h.trim() == name);
        let required = |name: &str| {
            position(name).ok_or_else(|| PipelineError::Source(format!("missing column '{name}' in CSV header")))
        };

        let meters: Vec<(u32, usize)> = headers
            .iter()
            .enumerate()
            .filter_map(|(idx, h)| {
                let index = h.trim().strip_prefix("meter_")?.parse::<u32>().ok()?;
                (index > 0).then_some((index, idx))
            })
            .collect();
        if meters.is_empty() {
            return Err(PipelineError::Source("no meter_N columns in CSV header".to_string()));
        }

        Ok(Self {
            resident_id: required("resident_id")?,
            date: required("date")?,
            meters,
            notes: position("notes"),
        })
    }
}

fn parse_record(record: &StringRecord, columns: &Columns, line: u64) -> Result<ImportedReading, PipelineError> {
    let field = |idx: usize| record.get(idx).map(str::trim).unwrap_or("");

    let resident_id = field(columns.resident_id);
    if resident_id.is_empty() {
        return Err(PipelineError::Source(format!("line {line}: empty resident_id")));
    }

    let date_str = field(columns.date);
    let date = Date::parse(date_str, format_description!("[year]-[month]-[day]"))
        .map_err(|e| PipelineError::Source(format!("line {line}: invalid date '{date_str}': {e}")))?;

    let mut meters = MeterValues::new();
    for &(index, idx) in &columns.meters {
        let raw = field(idx);
        if raw.is_empty() {
            continue;
        }
        let value: f64 = raw
            .parse()
            .map_err(|e| PipelineError::Source(format!("line {line}: invalid meter_{index} '{raw}': {e}")))?;
        meters.insert(index, value);
    }

    let notes = columns
        .notes
        .map(field)
        .filter(|n| !n.is_empty())
        .map(str::to_string);

    Ok(ImportedReading {
        line,
        resident_id: ResidentId::new(resident_id),
        reading: NewReading { date, meters, notes },
    })
}

/// Streams parsed rows; a bad row becomes an in-band error and reading continues.
pub fn read_records<R>(reader: R) -> EnvelopeStream<ImportedReading>
where
    R: Read + Send + 'static,
{
    let s = async_stream::stream! {
        let mut rdr = csv::ReaderBuilder::new().flexible(true).from_reader(reader);
        let columns = match rdr
            .headers()
            .map_err(|e| PipelineError::Source(format!("failed to read CSV headers: {e}")))
            .and_then(Columns::from_headers)
        {
            Ok(c) => c,
            Err(e) => {
                yield Err(e);
                return;
            }
        };

        for result in rdr.records() {
            let record = match result {
                Ok(r) => r,
                Err(e) => {
                    yield Err(PipelineError::Source(format!("failed to read CSV record: {e}")));
                    return;
                }
            };
            let line = record.position().map(|p| p.line()).unwrap_or_default();

            match parse_record(&record, &columns, line) {
                Ok(payload) => {
                    yield Ok(Envelope {
                        payload,
                        received_at: SystemTime::now(),
                    });
                }
                Err(e) => {
                    metrics::counter!("readings_csv_parse_errors_total").increment(1);
                    yield Err(e);
                }
            }
        }
    };

    Box::pin(s)
}

#[async_trait::async_trait]
impl Source<ImportedReading> for ReadingsCsvFileSource {
    async fn stream(&self) -> EnvelopeStream<ImportedReading> {
        // Blocking reader; import files are small enough to read inline.
        match File::open(&self.path) {
            Ok(file) => read_records(file),
            Err(e) => {
                let err = PipelineError::Source(format!("failed to open {}: {e}", self.path.display()));
                Box::pin(futures::stream::once(async move { Err(err) }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use time::macros::date;

    async fn collect(csv: &'static str) -> Vec<Result<ImportedReading, String>> {
        read_records(csv.as_bytes())
            .map(|item| item.map(|env| env.payload).map_err(|e| e.to_string()))
            .collect()
            .await
    }

    #[tokio::test]
    async fn parses_rows_with_blank_meters_and_notes() {
        let rows = collect(
            "resident_id,date,meter_1,meter_2,notes\n\
             r1,2024-03-01,120.5,40,\n\
             r2,2024-03-02,80,,meter 2 broken\n",
        )
        .await;

        assert_eq!(rows.len(), 2);
        let first = rows[0].as_ref().unwrap();
        assert_eq!(first.resident_id, ResidentId::new("r1"));
        assert_eq!(first.reading.date, date!(2024 - 03 - 01));
        assert_eq!(first.reading.meters.get(2), Some(40.0));
        assert!(first.reading.notes.is_none());
        assert_eq!(first.line, 2);

        let second = rows[1].as_ref().unwrap();
        assert_eq!(second.reading.meters.get(1), Some(80.0));
        assert_eq!(second.reading.meters.get(2), None);
        assert_eq!(second.reading.notes.as_deref(), Some("meter 2 broken"));
    }

    #[tokio::test]
    async fn bad_rows_are_reported_without_stopping() {
        let rows = collect(
            "resident_id,date,meter_1\n\
             r1,03/01/2024,1\n\
             r1,2024-03-01,abc\n\
             r1,2024-04-01,2\n",
        )
        .await;

        assert_eq!(rows.len(), 3);
        assert!(rows[0].as_ref().unwrap_err().contains("invalid date"));
        assert!(rows[1].as_ref().unwrap_err().contains("meter_1"));
        assert!(rows[2].is_ok());
    }

    #[tokio::test]
    async fn header_without_meters_is_rejected() {
        let rows = collect("resident_id,date\nr1,2024-03-01\n").await;
        assert_eq!(rows.len(), 1);
        assert!(rows[0].as_ref().unwrap_err().contains("meter_N"));
    }

    #[tokio::test]
    async fn missing_file_yields_one_error() {
        let source = ReadingsCsvFileSource::new("/nonexistent/readings.csv");
        let items: Vec<_> = source.stream().await.collect().await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(PipelineError::Source(_))));
    }
}
