use anyhow::{bail, Result};
use std::{env, sync::Arc};
use water_service::{
    config::AppConfig,
    observability,
    pipeline::{ImportedReading, Pipeline},
    retry::RetryPolicy,
    sinks::StoreSink,
    sources::ReadingsCsvFileSource,
    store,
    transform::ReadingValidation,
};

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        bail!("usage: import_readings <csv_file_path>");
    }
    let file_path = &args[1];

    let cfg = AppConfig::load()?;
    let store = store::open(&cfg.store, RetryPolicy::from_config(&cfg.retry)).await?;

    // Validation needs each resident's meter count up front.
    let residents = store.list_residents().await?;
    let validation = ReadingValidation::for_residents(&residents);

    let pipeline: Pipeline<_, ImportedReading, _> = Pipeline {
        source: ReadingsCsvFileSource::new(file_path),
        transforms: vec![Arc::new(validation)],
        sink: StoreSink::new(store),
    };

    let report = pipeline.run().await?;
    println!(
        "imported {} readings ({} already present, {} rejected)",
        report.imported, report.duplicates, report.rejected
    );

    Ok(())
}
