//! Consumption figures derived from a resident's reading history.
//!
//! Every function here is pure. Histories are expected newest-first; use
//! [`crate::history::sort_history`] to normalize one before calling in.

use std::{collections::BTreeMap, iter::FusedIterator, num::NonZeroU32, ops::RangeInclusive};

use serde::{Deserialize, Serialize};

use crate::domain::{Reading, Resident};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConsumptionError {
    #[error("meter count must be a positive integer, got {0}")]
    InvalidMeterCount(u32),
    #[error("unit price must be finite and non-negative, got {0}")]
    InvalidUnitPrice(f64),
}

/// Number of independent meters in one apartment. Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct MeterCount(NonZeroU32);

impl MeterCount {
    pub fn new(count: u32) -> Result<Self, ConsumptionError> {
        NonZeroU32::new(count)
            .map(Self)
            .ok_or(ConsumptionError::InvalidMeterCount(count))
    }

    pub fn get(self) -> u32 {
        self.0.get()
    }

    /// Meter indices `1..=count`.
    pub fn indices(self) -> RangeInclusive<u32> {
        1..=self.0.get()
    }
}

impl TryFrom<u32> for MeterCount {
    type Error = ConsumptionError;

    fn try_from(count: u32) -> Result<Self, Self::Error> {
        Self::new(count)
    }
}

impl From<MeterCount> for u32 {
    fn from(count: MeterCount) -> Self {
        count.get()
    }
}

/// Price per unit of consumed water.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct UnitPrice(f64);

impl UnitPrice {
    pub fn new(price: f64) -> Result<Self, ConsumptionError> {
        if price.is_finite() && price >= 0.0 {
            Ok(Self(price))
        } else {
            Err(ConsumptionError::InvalidUnitPrice(price))
        }
    }

    pub fn get(self) -> f64 {
        self.0
    }
}

impl TryFrom<f64> for UnitPrice {
    type Error = ConsumptionError;

    fn try_from(price: f64) -> Result<Self, Self::Error> {
        Self::new(price)
    }
}

impl From<UnitPrice> for f64 {
    fn from(price: UnitPrice) -> Self {
        price.get()
    }
}

/// Per-meter difference between two readings.
///
/// Meters missing from either reading have no entry and do not count toward
/// `total`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeriodDelta {
    pub meters: BTreeMap<u32, f64>,
    pub total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsumptionResult {
    pub meters: BTreeMap<u32, f64>,
    pub total: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
}

/// Difference `later - earlier` for each meter index that both readings carry.
///
/// Negative values are kept as-is: a replaced meter restarts its register.
pub fn period_delta(later: &Reading, earlier: &Reading, meter_count: MeterCount) -> PeriodDelta {
    let meters: BTreeMap<u32, f64> = meter_count
        .indices()
        .filter_map(|i| match (later.meters.get(i), earlier.meters.get(i)) {
            (Some(now), Some(before)) => Some((i, now - before)),
            _ => None,
        })
        .collect();
    let total = meters.values().sum();

    PeriodDelta { meters, total }
}

/// Consumption between the two most recent readings.
///
/// Returns `None` when the history has fewer than two readings. The readings
/// are compared regardless of how far apart their dates are.
pub fn latest_period_consumption(
    readings: &[Reading],
    meter_count: MeterCount,
    unit_price: Option<UnitPrice>,
) -> Option<ConsumptionResult> {
    let [latest, previous, ..] = readings else {
        return None;
    };

    let PeriodDelta { meters, total } = period_delta(latest, previous, meter_count);
    let cost = unit_price.map(|price| total * price.get());

    Some(ConsumptionResult { meters, total, cost })
}

/// One history entry together with its delta against the next older reading.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesEntry<'a> {
    pub reading: &'a Reading,
    pub delta: Option<PeriodDelta>,
}

/// Lazy walk over a newest-first history. A clone continues from the same
/// position; call [`series_consumption`] again for a fresh pass.
#[derive(Debug, Clone)]
pub struct Series<'a> {
    readings: &'a [Reading],
    meter_count: MeterCount,
    pos: usize,
}

impl<'a> Iterator for Series<'a> {
    type Item = SeriesEntry<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let reading = self.readings.get(self.pos)?;
        let delta = self
            .readings
            .get(self.pos + 1)
            .map(|older| period_delta(reading, older, self.meter_count));
        self.pos += 1;

        Some(SeriesEntry { reading, delta })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.readings.len().saturating_sub(self.pos);
        (left, Some(left))
    }
}

impl ExactSizeIterator for Series<'_> {}

impl FusedIterator for Series<'_> {}

pub fn series_consumption(readings: &[Reading], meter_count: MeterCount) -> Series<'_> {
    Series {
        readings,
        meter_count,
        pos: 0,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuildingSummary {
    pub residents: usize,
    pub residents_without_data: usize,
    pub total: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
}

/// Sums the latest-period consumption of every resident in the building.
pub fn building_summary<'a, I>(residents: I, unit_price: Option<UnitPrice>) -> BuildingSummary
where
    I: IntoIterator<Item = &'a Resident>,
{
    let mut summary = BuildingSummary {
        residents: 0,
        residents_without_data: 0,
        total: 0.0,
        cost: unit_price.map(|_| 0.0),
    };

    for resident in residents {
        summary.residents += 1;
        match resident.consumption(unit_price) {
            Some(result) => {
                summary.total += result.total;
                if let (Some(acc), Some(cost)) = (summary.cost.as_mut(), result.cost) {
                    *acc += cost;
                }
            }
            None => summary.residents_without_data += 1,
        }
    }

    summary
}
