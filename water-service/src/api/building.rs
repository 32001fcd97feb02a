use axum::{
    body::Bytes,
    extract::State,
    http::header,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use water_client::{building_summary, BuildingSummary};

use super::{AdminGuard, ApiError, AppState};
use crate::{
    export,
    notify::{ReminderOutcome, ReminderRequest},
};

pub async fn summary(_admin: AdminGuard, State(state): State<AppState>) -> Result<Json<BuildingSummary>, ApiError> {
    let residents = state.store.list_residents().await?;
    Ok(Json(building_summary(&residents, state.unit_price)))
}

pub async fn export_csv(_admin: AdminGuard, State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let residents = state.store.list_residents().await?;
    let body = export::readings_csv(&residents).map_err(|e| ApiError::Internal(e.to_string()))?;

    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
            (header::CONTENT_DISPOSITION, "attachment; filename=\"water-readings.csv\""),
        ],
        body,
    ))
}

/// Optional overrides of the configured reminder text.
#[derive(Debug, Default, Deserialize)]
pub struct ReminderOverrides {
    pub subject: Option<String>,
    pub message: Option<String>,
}

/// An empty body keeps the configured text; anything else must parse.
fn reminder_overrides(body: &[u8]) -> Result<ReminderOverrides, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(ReminderOverrides::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("invalid reminder overrides: {e}")))
}

pub async fn send_reminders(
    _admin: AdminGuard,
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<ReminderOutcome>, ApiError> {
    let overrides = reminder_overrides(&body)?;
    let residents = state.store.list_residents().await?;

    let request = ReminderRequest::for_residents(
        &residents,
        overrides.subject.unwrap_or_else(|| state.reminder_subject.clone()),
        overrides.message.unwrap_or_else(|| state.reminder_message.clone()),
    );
    let outcome = state.notifier.send_reminders(&request).await?;

    tracing::info!(
        sent = outcome.sent,
        failed = outcome.failed,
        residents = residents.len(),
        "reminders requested"
    );
    Ok(Json(outcome))
}
