//! Reading reminders handed to an external notification function.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use water_client::{Resident, ResidentId};

use crate::{
    config::NotifyConfig,
    retry::{is_retryable_status, RetryPolicy, Retryable},
};

#[derive(thiserror::Error, Debug)]
pub enum NotifyError {
    #[error("notification transport error: {0}")]
    Transport(String),
    #[error("notification endpoint returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid notification config: {0}")]
    Config(String),
}

impl Retryable for NotifyError {
    fn is_retryable(&self) -> bool {
        match self {
            NotifyError::Transport(_) => true,
            NotifyError::Status { status, .. } => is_retryable_status(*status),
            NotifyError::Config(_) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recipient {
    pub id: ResidentId,
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReminderRequest {
    pub residents: Vec<Recipient>,
    pub subject: String,
    pub message: String,
}

impl ReminderRequest {
    /// Addresses every resident that has an email; the rest are left out.
    pub fn for_residents<'a, I>(residents: I, subject: impl Into<String>, message: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = &'a Resident>,
    {
        let residents = residents
            .into_iter()
            .filter_map(|r| {
                let email = r.email.as_deref().map(str::trim).filter(|e| !e.is_empty())?;
                Some(Recipient {
                    id: r.id.clone(),
                    name: r.name.clone(),
                    email: email.to_string(),
                })
            })
            .collect();

        Self {
            residents,
            subject: subject.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReminderOutcome {
    pub sent: usize,
    #[serde(default)]
    pub failed: usize,
}

impl ReminderOutcome {
    /// Reads the `{sent, failed, total}` reply of the notification function.
    /// A reply without counts says nothing about failures, so every recipient
    /// is taken as sent.
    fn from_reply(body: &str, recipients: usize) -> Self {
        match serde_json::from_str::<ReminderOutcome>(body) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(error = %e, recipients, "notification reply carried no counts");
                ReminderOutcome {
                    sent: recipients,
                    failed: 0,
                }
            }
        }
    }
}

#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn send_reminders(&self, request: &ReminderRequest) -> Result<ReminderOutcome, NotifyError>;
}

/// Posts the reminder request as JSON to the configured function endpoint.
pub struct HttpNotifier {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    retry: RetryPolicy,
}

impl HttpNotifier {
    pub fn new(endpoint: String, api_key: Option<String>, retry: RetryPolicy) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| NotifyError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint,
            api_key,
            retry,
        })
    }
}

#[async_trait::async_trait]
impl Notifier for HttpNotifier {
    async fn send_reminders(&self, request: &ReminderRequest) -> Result<ReminderOutcome, NotifyError> {
        if request.residents.is_empty() {
            return Ok(ReminderOutcome::default());
        }

        let recipients = request.residents.len();
        let outcome = self
            .retry
            .run("notify.send_reminders", || async move {
                let mut req = self.client.post(&self.endpoint).json(request);
                if let Some(key) = &self.api_key {
                    req = req.bearer_auth(key);
                }
                let resp = req
                    .send()
                    .await
                    .map_err(|e| NotifyError::Transport(e.to_string()))?;
                let status = resp.status();
                if !status.is_success() {
                    let body = resp.text().await.unwrap_or_default();
                    return Err(NotifyError::Status {
                        status: status.as_u16(),
                        body,
                    });
                }
                let body = resp.text().await.unwrap_or_default();
                Ok(ReminderOutcome::from_reply(&body, recipients))
            })
            .await?;

        metrics::counter!("reminders_sent_total").increment(outcome.sent as u64);
        metrics::counter!("reminders_failed_total").increment(outcome.failed as u64);
        if outcome.failed > 0 {
            tracing::warn!(recipients, sent = outcome.sent, failed = outcome.failed, "some reminders were not delivered");
        } else {
            tracing::info!(recipients, sent = outcome.sent, "reminder request delivered");
        }
        Ok(outcome)
    }
}

/// Used when no endpoint is configured: reminders are only logged.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait::async_trait]
impl Notifier for LogNotifier {
    async fn send_reminders(&self, request: &ReminderRequest) -> Result<ReminderOutcome, NotifyError> {
        for r in &request.residents {
            tracing::info!(resident_id = %r.id, email = %r.email, subject = %request.subject, "reminder (not sent, no endpoint)");
        }
        Ok(ReminderOutcome {
            sent: request.residents.len(),
            failed: 0,
        })
    }
}

/// Picks the HTTP notifier when an endpoint is configured, else the logger.
pub fn from_config(cfg: &NotifyConfig, retry: RetryPolicy) -> Result<Box<dyn Notifier>, NotifyError> {
    match &cfg.endpoint {
        Some(endpoint) => Ok(Box::new(HttpNotifier::new(endpoint.clone(), cfg.api_key.clone(), retry)?)),
        None => {
            tracing::warn!("notify.endpoint not set; reminders will only be logged");
            Ok(Box::new(LogNotifier))
        }
    }
}
