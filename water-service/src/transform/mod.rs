use std::collections::HashMap;

use time::{macros::date, Date};
use water_client::{MeterCount, NewReading, Resident, ResidentId};

use crate::pipeline::{Envelope, ImportedReading, PipelineError, Transform};

const MIN_DATE: Date = date!(2000 - 01 - 01);
const MAX_DATE: Date = date!(2100 - 01 - 01);

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("meter {0} has no value")]
    MissingMeter(u32),
    #[error("meter {index} does not exist (resident has {meter_count} meters)")]
    UnexpectedMeter { index: u32, meter_count: u32 },
    #[error("meter {index} value {value} must be a finite non-negative number")]
    InvalidValue { index: u32, value: f64 },
    #[error("date {0} is outside the accepted range")]
    DateOutOfRange(Date),
}

/// Checks a reading against the resident's meter count before it is stored.
///
/// Rules:
/// - every index in `1..=meter_count` has a value, and no other index does.
/// - values are finite and non-negative.
/// - the date lies in [2000-01-01, 2100-01-01).
pub fn validate_new_reading(reading: &NewReading, meter_count: MeterCount) -> Result<(), ValidationError> {
    if reading.date < MIN_DATE || reading.date >= MAX_DATE {
        return Err(ValidationError::DateOutOfRange(reading.date));
    }

    if let Some(index) = reading.meters.indices().find(|i| !meter_count.indices().contains(i)) {
        return Err(ValidationError::UnexpectedMeter {
            index,
            meter_count: meter_count.get(),
        });
    }

    for index in meter_count.indices() {
        match reading.meters.get(index) {
            None => return Err(ValidationError::MissingMeter(index)),
            Some(value) if !value.is_finite() || value < 0.0 => {
                return Err(ValidationError::InvalidValue { index, value })
            }
            Some(_) => {}
        }
    }

    Ok(())
}

/// Rejects imported readings for unknown residents or with invalid values.
#[derive(Clone, Default)]
pub struct ReadingValidation {
    meter_counts: HashMap<ResidentId, MeterCount>,
}

impl ReadingValidation {
    pub fn new(meter_counts: HashMap<ResidentId, MeterCount>) -> Self {
        Self { meter_counts }
    }

    pub fn for_residents<'a, I>(residents: I) -> Self
    where
        I: IntoIterator<Item = &'a Resident>,
    {
        Self::new(
            residents
                .into_iter()
                .map(|r| (r.id.clone(), r.meter_count))
                .collect(),
        )
    }

    fn check(&self, imported: &ImportedReading) -> Result<(), PipelineError> {
        let meter_count = self.meter_counts.get(&imported.resident_id).ok_or_else(|| {
            PipelineError::Transform(format!(
                "line {}: unknown resident {}",
                imported.line, imported.resident_id
            ))
        })?;
        validate_new_reading(&imported.reading, *meter_count).map_err(|e| {
            PipelineError::Transform(format!(
                "line {}: resident {}: {e}",
                imported.line, imported.resident_id
            ))
        })
    }
}

#[async_trait::async_trait]
impl Transform<ImportedReading, ImportedReading> for ReadingValidation {
    async fn apply(&self, input: Envelope<ImportedReading>) -> Result<Envelope<ImportedReading>, PipelineError> {
        match self.check(&input.payload) {
            Ok(()) => Ok(input),
            Err(e) => {
                metrics::counter!("reading_validation_rejected_total").increment(1);
                Err(e)
            }
        }
    }
}
