use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};

time::serde::format_description!(iso_date, Date, "[year]-[month]-[day]");

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReadingId(String);

impl ReadingId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReadingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Register values of one reading, keyed by 1-based meter index.
///
/// A missing index means the value was never recorded (for example a reading
/// taken before the resident's meter count was raised). It is not zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MeterValues(BTreeMap<u32, f64>);

impl MeterValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, index: u32) -> Option<f64> {
        self.0.get(&index).copied()
    }

    pub fn insert(&mut self, index: u32, value: f64) -> Option<f64> {
        self.0.insert(index, value)
    }

    pub fn indices(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, f64)> + '_ {
        self.0.iter().map(|(i, v)| (*i, *v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(u32, f64)> for MeterValues {
    fn from_iter<I: IntoIterator<Item = (u32, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// One dated snapshot of all of a resident's meter registers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub id: ReadingId,
    #[serde(with = "iso_date")]
    pub date: Date,
    pub meters: MeterValues,
    #[serde(with = "time::serde::rfc3339", alias = "timestamp")]
    pub created_at: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Payload used both to create a reading and to fully replace an existing one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewReading {
    #[serde(with = "iso_date")]
    pub date: Date,
    pub meters: MeterValues,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl Reading {
    pub fn from_new(new: NewReading, created_at: OffsetDateTime) -> Self {
        Self::with_id(ReadingId::generate(), new, created_at)
    }

    pub fn with_id(id: ReadingId, new: NewReading, created_at: OffsetDateTime) -> Self {
        Self {
            id,
            date: new.date,
            meters: new.meters,
            created_at,
            notes: new.notes,
        }
    }

    /// Full replace of the editable fields; `id` and `created_at` are kept.
    pub fn replace(&mut self, new: NewReading) {
        self.date = new.date;
        self.meters = new.meters;
        self.notes = new.notes;
    }
}
