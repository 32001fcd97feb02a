use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use time::OffsetDateTime;
use water_client::{
    latest_period_consumption, series_consumption, ConsumptionResult, NewReading, Reading, ReadingId, ResidentId,
    SeriesEntry,
};

use super::{AdminGuard, ApiError, AppState};
use crate::transform::validate_new_reading;

#[derive(Debug, Serialize)]
pub struct ConsumptionView<'a> {
    pub resident_id: &'a ResidentId,
    pub latest: Option<ConsumptionResult>,
    pub series: Vec<SeriesEntry<'a>>,
}

/// Latest period plus the full per-reading series for one resident.
pub async fn consumption(
    State(state): State<AppState>,
    Path(id): Path<ResidentId>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let resident = state.store.get_resident(&id).await?;

    let view = ConsumptionView {
        resident_id: &resident.id,
        latest: latest_period_consumption(&resident.readings, resident.meter_count, state.unit_price),
        series: series_consumption(&resident.readings, resident.meter_count).collect(),
    };
    let body = serde_json::to_value(&view).map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(body))
}

/// Residents submit readings through their share link; admins use the same route.
pub async fn add_reading(
    State(state): State<AppState>,
    Path(id): Path<ResidentId>,
    payload: Result<Json<NewReading>, JsonRejection>,
) -> Result<(StatusCode, Json<Reading>), ApiError> {
    let Json(new) = payload?;
    let resident = state.store.get_resident(&id).await?;
    validate_new_reading(&new, resident.meter_count)?;

    let reading = state
        .store
        .add_reading(&id, Reading::from_new(new, OffsetDateTime::now_utc()))
        .await?;
    metrics::counter!("readings_recorded_total").increment(1);
    tracing::info!(resident_id = %id, reading_id = %reading.id, date = %reading.date, "reading recorded");
    Ok((StatusCode::CREATED, Json(reading)))
}

pub async fn update_reading(
    _admin: AdminGuard,
    State(state): State<AppState>,
    Path((id, reading_id)): Path<(ResidentId, ReadingId)>,
    payload: Result<Json<NewReading>, JsonRejection>,
) -> Result<Json<Reading>, ApiError> {
    let Json(new) = payload?;
    let resident = state.store.get_resident(&id).await?;
    validate_new_reading(&new, resident.meter_count)?;

    Ok(Json(state.store.update_reading(&id, &reading_id, new).await?))
}

pub async fn delete_reading(
    _admin: AdminGuard,
    State(state): State<AppState>,
    Path((id, reading_id)): Path<(ResidentId, ReadingId)>,
) -> Result<StatusCode, ApiError> {
    state.store.delete_reading(&id, &reading_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
