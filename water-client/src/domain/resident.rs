use std::{cmp::Ordering, fmt};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    consumption::{latest_period_consumption, ConsumptionResult, MeterCount, UnitPrice},
    domain::reading::Reading,
};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResidentId(String);

impl ResidentId {
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

impl fmt::Display for ResidentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One apartment: the billing and reporting unit.
///
/// `readings` is kept newest-first (see [`crate::history`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resident {
    pub id: ResidentId,
    pub name: String,
    pub apartment: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(alias = "meters")]
    pub meter_count: MeterCount,
    #[serde(default, alias = "meterIds")]
    pub meter_ids: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default)]
    pub readings: Vec<Reading>,
}

impl Resident {
    pub fn from_new(new: NewResident, created_at: OffsetDateTime) -> Self {
        Self {
            id: ResidentId::generate(),
            name: new.name,
            apartment: new.apartment,
            email: new.email.filter(|e| !e.trim().is_empty()),
            meter_count: new.meter_count,
            meter_ids: new.meter_ids,
            created_at,
            readings: Vec::new(),
        }
    }

    /// External label of a 1-based meter index, if one was recorded.
    pub fn meter_label(&self, index: u32) -> Option<&str> {
        let slot = usize::try_from(index).ok()?.checked_sub(1)?;
        self.meter_ids.get(slot).map(String::as_str)
    }

    pub fn consumption(&self, unit_price: Option<UnitPrice>) -> Option<ConsumptionResult> {
        latest_period_consumption(&self.readings, self.meter_count, unit_price)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewResident {
    pub name: String,
    pub apartment: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(alias = "meters")]
    pub meter_count: MeterCount,
    #[serde(default, alias = "meterIds")]
    pub meter_ids: Vec<String>,
}

/// Partial update of resident metadata. Unset fields are left alone; an
/// empty `email` clears the address.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResidentPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub apartment: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default, alias = "meters")]
    pub meter_count: Option<MeterCount>,
    #[serde(default, alias = "meterIds")]
    pub meter_ids: Option<Vec<String>>,
}

impl ResidentPatch {
    pub fn apply(self, resident: &mut Resident) {
        if let Some(name) = self.name {
            resident.name = name;
        }
        if let Some(apartment) = self.apartment {
            resident.apartment = apartment;
        }
        if let Some(email) = self.email {
            resident.email = Some(email).filter(|e| !e.trim().is_empty());
        }
        if let Some(count) = self.meter_count {
            resident.meter_count = count;
        }
        if let Some(ids) = self.meter_ids {
            resident.meter_ids = ids;
        }
    }
}

/// Numeric part of an apartment label after the building prefix.
///
/// `"7-12"` gives 12, `"7-4/5"` gives 4. Labels without a dash or without a
/// leading number after it give `None`.
pub fn apartment_sort_key(label: &str) -> Option<f64> {
    let (_, rest) = label.split_once('-')?;
    let rest = rest.trim_start();
    let end = rest
        .char_indices()
        .find(|(i, c)| !(c.is_ascii_digit() || (*c == '.' && *i > 0)))
        .map(|(i, _)| i)
        .unwrap_or(rest.len());
    rest[..end].trim_end_matches('.').parse().ok()
}

/// Orders residents the way the admin roster lists them.
pub fn sort_by_apartment(residents: &mut [Resident]) {
    residents.sort_by(|a, b| {
        let ka = apartment_sort_key(&a.apartment);
        let kb = apartment_sort_key(&b.apartment);
        let by_key = match (ka, kb) {
            (Some(x), Some(y)) => x.total_cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        by_key.then_with(|| a.apartment.cmp(&b.apartment))
    });
}
