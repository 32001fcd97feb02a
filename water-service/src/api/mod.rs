//! HTTP JSON API.
//!
//! Admin routes require `Authorization: Bearer <admin_token>`. Resident
//! routes are reached through a share link; knowing the resident id is the
//! only credential they need.

pub mod building;
pub mod error;
pub mod health;
pub mod readings;
pub mod residents;

#[cfg(test)]
mod tests;

use std::{sync::Arc, time::Instant};

use axum::{
    extract::{FromRequestParts, MatchedPath, Request},
    http::{header::AUTHORIZATION, request::Parts},
    middleware::{self, Next},
    response::Response,
    routing::{get, post, put},
    Router,
};
use water_client::UnitPrice;

use crate::{config::AppConfig, notify::Notifier, store::SharedStore};

pub use error::ApiError;

#[derive(Clone)]
pub struct AppState {
    pub store: SharedStore,
    pub notifier: Arc<dyn Notifier>,
    pub unit_price: Option<UnitPrice>,
    pub public_base_url: String,
    pub reminder_subject: String,
    pub reminder_message: String,
    admin_token_hash: Option<blake3::Hash>,
}

impl AppState {
    pub fn new(store: SharedStore, notifier: Arc<dyn Notifier>, cfg: &AppConfig) -> Self {
        Self {
            store,
            notifier,
            unit_price: cfg.billing.unit_price,
            public_base_url: cfg.server.public_base_url.clone(),
            reminder_subject: cfg.notify.subject.clone(),
            reminder_message: cfg.notify.message.clone(),
            admin_token_hash: cfg.server.admin_token.as_deref().map(hash_token),
        }
    }

    pub fn admin_gate_enabled(&self) -> bool {
        self.admin_token_hash.is_some()
    }

    /// Link a resident opens to see their own data.
    pub fn share_link(&self, resident: &water_client::ResidentId) -> String {
        let sep = if self.public_base_url.contains('?') { '&' } else { '?' };
        format!("{}{sep}resident={resident}", self.public_base_url)
    }
}

fn hash_token(token: &str) -> blake3::Hash {
    blake3::hash(token.as_bytes())
}

/// Extractor for admin-only handlers.
///
/// Tokens are compared by their blake3 digests; `blake3::Hash` equality is
/// constant-time.
#[derive(Debug, Clone, Copy)]
pub struct AdminGuard;

#[axum::async_trait]
impl FromRequestParts<AppState> for AdminGuard {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let Some(expected) = state.admin_token_hash else {
            return Ok(AdminGuard);
        };

        let presented = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim);

        match presented {
            Some(token) if hash_token(token) == expected => Ok(AdminGuard),
            _ => {
                metrics::counter!("http_admin_rejected_total").increment(1);
                Err(ApiError::Unauthorized)
            }
        }
    }
}

async fn track_requests(req: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = req.method().to_string();
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let response = next.run(req).await;

    let status = response.status().as_u16().to_string();
    metrics::counter!("http_requests_total", "method" => method.clone(), "path" => path.clone(), "status" => status)
        .increment(1);
    metrics::histogram!("http_request_duration_seconds", "method" => method, "path" => path)
        .record(started.elapsed().as_secs_f64());
    response
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route(
            "/api/residents",
            get(residents::list_residents).post(residents::create_resident),
        )
        .route(
            "/api/residents/:id",
            get(residents::get_resident)
                .put(residents::update_resident)
                .delete(residents::delete_resident),
        )
        .route("/api/residents/:id/link", get(residents::share_link))
        .route("/api/residents/:id/consumption", get(readings::consumption))
        .route("/api/residents/:id/readings", post(readings::add_reading))
        .route(
            "/api/residents/:id/readings/:reading_id",
            put(readings::update_reading).delete(readings::delete_reading),
        )
        .route("/api/summary", get(building::summary))
        .route("/api/export.csv", get(building::export_csv))
        .route("/api/reminders", post(building::send_reminders))
        .route_layer(middleware::from_fn(track_requests))
        .with_state(state)
}
