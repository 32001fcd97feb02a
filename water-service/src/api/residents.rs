use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use time::OffsetDateTime;
use water_client::{domain::sort_by_apartment, ConsumptionResult, NewResident, Resident, ResidentId, ResidentPatch};

use super::{AdminGuard, ApiError, AppState};

/// Admin roster entry: the resident plus its latest-period consumption.
#[derive(Debug, Serialize)]
pub struct ResidentOverview {
    #[serde(flatten)]
    pub resident: Resident,
    pub consumption: Option<ConsumptionResult>,
}

#[derive(Debug, Serialize)]
pub struct ShareLink {
    pub resident_id: ResidentId,
    pub url: String,
}

fn require_text(field: &str, value: &str) -> Result<(), ApiError> {
    if value.trim().is_empty() {
        Err(ApiError::Validation(format!("{field} must not be empty")))
    } else {
        Ok(())
    }
}

pub async fn list_residents(
    _admin: AdminGuard,
    State(state): State<AppState>,
) -> Result<Json<Vec<ResidentOverview>>, ApiError> {
    let mut residents = state.store.list_residents().await?;
    sort_by_apartment(&mut residents);

    let overview = residents
        .into_iter()
        .map(|resident| ResidentOverview {
            consumption: resident.consumption(state.unit_price),
            resident,
        })
        .collect();
    Ok(Json(overview))
}

pub async fn create_resident(
    _admin: AdminGuard,
    State(state): State<AppState>,
    payload: Result<Json<NewResident>, JsonRejection>,
) -> Result<(StatusCode, Json<Resident>), ApiError> {
    let Json(new) = payload?;
    require_text("name", &new.name)?;
    require_text("apartment", &new.apartment)?;

    let resident = state
        .store
        .create_resident(Resident::from_new(new, OffsetDateTime::now_utc()))
        .await?;
    tracing::info!(resident_id = %resident.id, apartment = %resident.apartment, "resident added");
    Ok((StatusCode::CREATED, Json(resident)))
}

/// Share-link view of one resident with its full reading history.
pub async fn get_resident(State(state): State<AppState>, Path(id): Path<ResidentId>) -> Result<Json<Resident>, ApiError> {
    Ok(Json(state.store.get_resident(&id).await?))
}

pub async fn update_resident(
    _admin: AdminGuard,
    State(state): State<AppState>,
    Path(id): Path<ResidentId>,
    payload: Result<Json<ResidentPatch>, JsonRejection>,
) -> Result<Json<Resident>, ApiError> {
    let Json(patch) = payload?;
    if let Some(name) = &patch.name {
        require_text("name", name)?;
    }
    if let Some(apartment) = &patch.apartment {
        require_text("apartment", apartment)?;
    }

    Ok(Json(state.store.update_resident(&id, patch).await?))
}

pub async fn delete_resident(
    _admin: AdminGuard,
    State(state): State<AppState>,
    Path(id): Path<ResidentId>,
) -> Result<StatusCode, ApiError> {
    state.store.delete_resident(&id).await?;
    tracing::info!(resident_id = %id, "resident removed");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn share_link(
    _admin: AdminGuard,
    State(state): State<AppState>,
    Path(id): Path<ResidentId>,
) -> Result<Json<ShareLink>, ApiError> {
    let resident = state.store.get_resident(&id).await?;
    Ok(Json(ShareLink {
        url: state.share_link(&resident.id),
        resident_id: resident.id,
    }))
}
