pub mod consumption;
pub mod db;
pub mod domain;
pub mod history;

pub use consumption::{
    building_summary, latest_period_consumption, series_consumption, BuildingSummary, ConsumptionError,
    ConsumptionResult, MeterCount, PeriodDelta, Series, SeriesEntry, UnitPrice,
};
pub use domain::{MeterValues, NewReading, NewResident, Reading, ReadingId, Resident, ResidentId, ResidentPatch};
