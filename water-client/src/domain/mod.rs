pub mod reading;
pub mod resident;

pub use reading::{MeterValues, NewReading, Reading, ReadingId};
pub use resident::{sort_by_apartment, apartment_sort_key, NewResident, Resident, ResidentId, ResidentPatch};
