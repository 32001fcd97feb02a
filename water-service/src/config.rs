use serde::Deserialize;
use std::fs;
use water_client::{NewResident, UnitPrice};

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Bearer token for admin routes. Admin routes are open when unset.
    pub admin_token: Option<String>,
    /// Base URL residents open; share links append `?resident=<id>`.
    pub public_base_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    Memory,
    JsonFile,
    Postgres,
    Sheets,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub kind: StoreKind,
    /// `json_file`: path of the data file.
    pub path: Option<String>,
    /// `postgres`: connection URI.
    pub uri: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// `sheets`: spreadsheet id, OAuth access token and API root.
    pub spreadsheet_id: Option<String>,
    pub access_token: Option<String>,
    #[serde(default = "default_sheets_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// Seed the roster from `[[seed]]` when the store holds no residents.
    #[serde(default)]
    pub seed_initial: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BillingConfig {
    pub unit_price: Option<UnitPrice>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_jitter_ms")]
    pub max_jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_jitter_ms: default_max_jitter_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotifyConfig {
    /// Endpoint of the reminder function. Reminders are only logged when unset.
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    #[serde(default = "default_reminder_subject")]
    pub subject: String,
    #[serde(default = "default_reminder_message")]
    pub message: String,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            subject: default_reminder_subject(),
            message: default_reminder_message(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub store: StoreConfig,
    #[serde(default)]
    pub billing: BillingConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    pub metrics: Option<MetricsConfig>,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub seed: Vec<NewResident>,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        use std::env;

        let path = env::var("WATER_CONFIG").unwrap_or_else(|_| "water-config.toml".to_string());
        let contents = fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("failed to read config {path}: {e}"))?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        let cfg: AppConfig = toml::from_str(contents)?;
        Ok(cfg)
    }
}

fn default_max_connections() -> u32 {
    5
}

fn default_sheets_api_base_url() -> String {
    "https://sheets.googleapis.com".to_string()
}

fn default_cache_ttl_secs() -> u64 {
    60
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    300
}

fn default_max_jitter_ms() -> u64 {
    100
}

fn default_reminder_subject() -> String {
    "Please submit your water meter readings".to_string()
}

fn default_reminder_message() -> String {
    "Please enter the water meter readings for your apartment. It only takes a few minutes.".to_string()
}
