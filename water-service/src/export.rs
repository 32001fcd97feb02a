//! Wide-format CSV export of every reading in the building.

use water_client::{domain::sort_by_apartment, series_consumption, Resident};

/// One row per reading: `apartment, name, email, date, meter_1..meter_N,
/// period_total`, with `N` the largest meter count in the building.
///
/// Residents are listed in apartment order and their readings newest-first.
/// `period_total` is the delta against the next older reading and is empty
/// for the oldest one.
pub fn readings_csv(residents: &[Resident]) -> Result<Vec<u8>, csv::Error> {
    let mut residents = residents.to_vec();
    sort_by_apartment(&mut residents);

    let width = residents.iter().map(|r| r.meter_count.get()).max().unwrap_or(1);

    let mut wtr = csv::Writer::from_writer(Vec::new());

    let mut header: Vec<String> = ["apartment", "name", "email", "date"].map(String::from).to_vec();
    header.extend((1..=width).map(|i| format!("meter_{i}")));
    header.push("period_total".to_string());
    wtr.write_record(&header)?;

    let mut rows = 0usize;
    for resident in &residents {
        for entry in series_consumption(&resident.readings, resident.meter_count) {
            let mut record = vec![
                resident.apartment.clone(),
                resident.name.clone(),
                resident.email.clone().unwrap_or_default(),
                entry.reading.date.to_string(),
            ];
            record.extend((1..=width).map(|i| {
                entry
                    .reading
                    .meters
                    .get(i)
                    .map(|v| v.to_string())
                    .unwrap_or_default()
            }));
            record.push(entry.delta.map(|d| d.total.to_string()).unwrap_or_default());
            wtr.write_record(&record)?;
            rows += 1;
        }
    }

    let bytes = wtr.into_inner().map_err(|e| e.into_error())?;
    tracing::debug!(residents = residents.len(), rows, "exported readings csv");
    Ok(bytes)
}
