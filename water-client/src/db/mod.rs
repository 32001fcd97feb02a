pub mod resident_queries;

pub use resident_queries::{ReadingRow, ResidentRow};
