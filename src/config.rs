//! Global configuration parsing, validation, and credential loading.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::{AppError, Result};

/// Keychain service name used for stored credentials.
const KEYRING_SERVICE: &str = "stay-concierge";

/// Cadence and retry bounds for the background orchestration loops.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct OrchestrationConfig {
    /// Seconds between orchestration passes (triage, reply retries, completion).
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,
    /// Seconds between archive and retention sweeps.
    #[serde(default = "default_archive_interval_seconds")]
    pub archive_interval_seconds: u64,
    /// Consecutive oracle/transport failures tolerated before escalation.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Lifetime of a dispatch claim before another worker may take it over.
    #[serde(default = "default_claim_lease_seconds")]
    pub claim_lease_seconds: u64,
    /// Upper bound on tasks processed concurrently within one pass.
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    /// Minimum age of a pending reply before the pass retries it.
    #[serde(default = "default_reply_retry_delay_seconds")]
    pub reply_retry_delay_seconds: u64,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_interval_seconds(),
            archive_interval_seconds: default_archive_interval_seconds(),
            max_attempts: default_max_attempts(),
            claim_lease_seconds: default_claim_lease_seconds(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            reply_retry_delay_seconds: default_reply_retry_delay_seconds(),
        }
    }
}

fn default_interval_seconds() -> u64 {
    30
}

fn default_archive_interval_seconds() -> u64 {
    300
}

fn default_max_attempts() -> u32 {
    3
}

fn default_claim_lease_seconds() -> u64 {
    120
}

fn default_max_concurrent_tasks() -> usize {
    8
}

fn default_reply_retry_delay_seconds() -> u64 {
    60
}

/// Time budgets (seconds) for blocking collaborator calls.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimeoutConfig {
    /// Budget for a single decision-oracle call.
    #[serde(default = "default_oracle_seconds")]
    pub oracle_seconds: u64,
    /// Budget for a single notifier send.
    #[serde(default = "default_notifier_seconds")]
    pub notifier_seconds: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            oracle_seconds: default_oracle_seconds(),
            notifier_seconds: default_notifier_seconds(),
        }
    }
}

fn default_oracle_seconds() -> u64 {
    20
}

fn default_notifier_seconds() -> u64 {
    15
}

/// Decision oracle endpoint.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct OracleConfig {
    /// Base URL; `/triage`, `/requirement-satisfied` and `/compose` are appended.
    pub base_url: String,
    /// Bearer key (populated at runtime).
    #[serde(skip)]
    pub api_key: Option<String>,
}

/// Outbound messaging transport.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct NotifierConfig {
    /// Delivery endpoint accepting `{to, from, body, metadata}`.
    pub endpoint: String,
    /// Address messages are sent from.
    #[serde(default)]
    pub sender_address: String,
    /// Bearer token for the delivery endpoint (populated at runtime).
    #[serde(skip)]
    pub token: String,
}

/// Routing fallbacks.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RoutingConfig {
    /// Host contact used when a property has no host address on record.
    #[serde(default)]
    pub default_host_address: Option<String>,
}

/// Versioned list of category labels treated as classifier noise.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct CategoryConfig {
    /// Revision of the denylist, logged at startup.
    #[serde(default = "default_category_version")]
    pub version: u32,
    /// Labels discarded before task creation (case-insensitive).
    #[serde(default = "default_denylist")]
    pub denylist: Vec<String>,
}

impl Default for CategoryConfig {
    fn default() -> Self {
        Self {
            version: default_category_version(),
            denylist: default_denylist(),
        }
    }
}

fn default_category_version() -> u32 {
    1
}

fn default_denylist() -> Vec<String> {
    ["other", "general", "general inquiry", "unknown", "none", "greeting", "thank you"]
        .into_iter()
        .map(str::to_owned)
        .collect()
}

/// Vocabulary used to read staff and host replies.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct LanguageConfig {
    /// Words that state the work has been carried out.
    #[serde(default = "default_completion_terms")]
    pub completion_terms: Vec<String>,
    /// Words that commit to a future time rather than report completion.
    #[serde(default = "default_scheduling_terms")]
    pub scheduling_terms: Vec<String>,
    /// Words that state the responder cannot fulfil the request.
    #[serde(default = "default_inability_terms")]
    pub inability_terms: Vec<String>,
}

impl Default for LanguageConfig {
    fn default() -> Self {
        Self {
            completion_terms: default_completion_terms(),
            scheduling_terms: default_scheduling_terms(),
            inability_terms: default_inability_terms(),
        }
    }
}

fn owned(terms: &[&str]) -> Vec<String> {
    terms.iter().map(|t| (*t).to_owned()).collect()
}

fn default_completion_terms() -> Vec<String> {
    owned(&[
        "done",
        "delivered",
        "finished",
        "completed",
        "complete",
        "fixed",
        "resolved",
        "dropped off",
        "taken care of",
        "all set",
    ])
}

fn default_scheduling_terms() -> Vec<String> {
    owned(&[
        "will",
        "i'll",
        "we'll",
        "going to",
        "tomorrow",
        "tonight",
        "later",
        "soon",
        "schedule",
        "scheduled",
        "on my way",
    ])
}

fn default_inability_terms() -> Vec<String> {
    owned(&[
        "can't",
        "cannot",
        "can not",
        "unable",
        "not able",
        "not possible",
        "unavailable",
        "out of stock",
        "won't be able",
        "no availability",
    ])
}

fn default_retention_days() -> u32 {
    90
}

fn default_http_port() -> u16 {
    8080
}

fn default_ipc_name() -> String {
    "stay-concierge".into()
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// `SQLite` database file.
    pub db_path: PathBuf,
    /// HTTP port for webhook ingestion and task reads.
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Named pipe / Unix socket identifier for the operator CLI.
    #[serde(default = "default_ipc_name")]
    pub ipc_name: String,
    /// Days an archived task is kept before it is purged.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Background loop cadence and retry policy.
    #[serde(default)]
    pub orchestration: OrchestrationConfig,
    /// Collaborator time budgets.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Decision oracle endpoint.
    pub oracle: OracleConfig,
    /// Outbound messaging transport.
    pub notifier: NotifierConfig,
    /// Host routing fallbacks.
    #[serde(default)]
    pub routing: RoutingConfig,
    /// Category denylist.
    #[serde(default)]
    pub categories: CategoryConfig,
    /// Reply vocabulary.
    #[serde(default)]
    pub language: LanguageConfig,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and validate it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load transport and oracle credentials from OS keychain with env-var fallback.
    ///
    /// The notifier token is required; the oracle key is optional.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the notifier token is found in neither
    /// the keychain nor `CONCIERGE_NOTIFIER_TOKEN`.
    pub async fn load_credentials(&mut self) -> Result<()> {
        self.notifier.token = load_credential("notifier_token", "CONCIERGE_NOTIFIER_TOKEN").await?;
        self.oracle.api_key = match load_credential("oracle_key", "CONCIERGE_ORACLE_KEY").await {
            Ok(key) => Some(key),
            Err(err) => {
                warn!(%err, "no oracle key configured; calling oracle unauthenticated");
                None
            }
        };
        Ok(())
    }

    /// Time budget for one oracle call.
    #[must_use]
    pub fn oracle_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.oracle_seconds)
    }

    /// Time budget for one notifier send.
    #[must_use]
    pub fn notifier_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.notifier_seconds)
    }

    /// Lifetime of a dispatch claim.
    #[must_use]
    pub fn claim_lease(&self) -> Duration {
        Duration::from_secs(self.orchestration.claim_lease_seconds)
    }

    fn validate(&self) -> Result<()> {
        let orchestration = &self.orchestration;
        if orchestration.interval_seconds == 0 || orchestration.archive_interval_seconds == 0 {
            return Err(AppError::Config(
                "orchestration intervals must be greater than zero".into(),
            ));
        }

        if orchestration.max_attempts == 0 {
            return Err(AppError::Config(
                "orchestration.max_attempts must be greater than zero".into(),
            ));
        }

        if orchestration.max_concurrent_tasks == 0 {
            return Err(AppError::Config(
                "orchestration.max_concurrent_tasks must be greater than zero".into(),
            ));
        }

        // A claim is held across a triage call, a compose call and one send.
        let minimum_lease = self.timeouts.oracle_seconds * 2 + self.timeouts.notifier_seconds;
        if orchestration.claim_lease_seconds < minimum_lease {
            return Err(AppError::Config(format!(
                "orchestration.claim_lease_seconds must be at least {minimum_lease}"
            )));
        }

        if self.oracle.base_url.trim().is_empty() {
            return Err(AppError::Config("oracle.base_url must not be empty".into()));
        }

        if self.notifier.endpoint.trim().is_empty() {
            return Err(AppError::Config(
                "notifier.endpoint must not be empty".into(),
            ));
        }

        Ok(())
    }
}

/// Load a single credential from OS keychain with env-var fallback.
async fn load_credential(keyring_key: &str, env_key: &str) -> Result<String> {
    let key = keyring_key.to_owned();

    // keyring is synchronous I/O.
    let keychain_result = tokio::task::spawn_blocking(move || {
        keyring::Entry::new(KEYRING_SERVICE, &key).and_then(|entry| entry.get_password())
    })
    .await
    .map_err(|err| AppError::Config(format!("keychain task panicked: {err}")))?;

    match keychain_result {
        Ok(value) if !value.is_empty() => return Ok(value),
        Ok(_) => {
            warn!(key = keyring_key, "keychain entry is empty, trying env var");
        }
        Err(err) => {
            warn!(
                key = keyring_key,
                ?err,
                "keychain lookup failed, trying env var"
            );
        }
    }

    env::var(env_key)
        .ok()
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            AppError::Config(format!(
                "credential {keyring_key} not found in keychain or {env_key} env var"
            ))
        })
}
