use anyhow::Result;
use water_client::{building_summary, domain::sort_by_apartment};
use water_service::{config::AppConfig, observability, retry::RetryPolicy, store};

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let cfg = AppConfig::load()?;
    let store = store::open(&cfg.store, RetryPolicy::from_config(&cfg.retry)).await?;
    let unit_price = cfg.billing.unit_price;

    let mut residents = store.list_residents().await?;
    sort_by_apartment(&mut residents);

    println!("{:<10} {:<28} {:>22} {:>12} {:>10}", "apartment", "name", "period", "consumption", "cost");
    for resident in &residents {
        let period = match resident.readings.as_slice() {
            [latest, previous, ..] => format!("{}..{}", previous.date, latest.date),
            _ => "-".to_string(),
        };
        match resident.consumption(unit_price) {
            Some(result) => println!(
                "{:<10} {:<28} {:>22} {:>12.2} {:>10}",
                resident.apartment,
                resident.name,
                period,
                result.total,
                result.cost.map(|c| format!("{c:.2}")).unwrap_or_default(),
            ),
            None => println!(
                "{:<10} {:<28} {:>22} {:>12} {:>10}",
                resident.apartment, resident.name, period, "no data", ""
            ),
        }
    }

    let summary = building_summary(&residents, unit_price);
    println!();
    println!(
        "building total: {:.2} across {} residents ({} without data)",
        summary.total, summary.residents, summary.residents_without_data
    );
    if let Some(cost) = summary.cost {
        println!("building cost: {cost:.2}");
    }

    Ok(())
}
