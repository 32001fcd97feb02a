pub mod readings_csv_file;

pub use readings_csv_file::ReadingsCsvFileSource;
