//! Configuration loading and validation.
//!
//! Loads from `./leasegate.toml` (or `$LEASEGATE_CONFIG_PATH`).
//! Environment variables override file values; file values override defaults.
//!
//! Precedence: env vars > config file > defaults.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::warn;

use crate::governance::MAX_MODE_STALENESS;
use crate::policy::{GovernanceMode, RiskLevel};
use crate::store::RetryPolicy;

/// Development signing secret. Refused by [`LeasegateConfig::validate`] in
/// production.
pub const DEV_HMAC_SECRET: &str = "leasegate-dev-secret-do-not-use-in-production";

/// Secrets shorter than this are accepted with a warning.
const MIN_SECRET_LEN: usize = 32;

// ── Top-level config ────────────────────────────────────────────

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LeasegateConfig {
    /// Shared store settings.
    pub store: StoreConfig,
    /// Mode, elevation and approval settings.
    pub governance: GovernanceConfig,
    /// Lease budgets.
    pub leases: LeasesConfig,
    /// Capability token settings.
    pub tokens: TokensConfig,
    /// Audit trail settings.
    pub audit: AuditConfig,
    /// Diagnostic logging settings.
    pub logging: LoggingConfig,
    /// Tool registry location.
    pub registry: RegistryConfig,
}

/// Configuration that fails validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// No signing secret configured.
    #[error("tokens.hmac_secret is empty")]
    EmptySecret,
    /// The development secret in a production deployment.
    #[error("tokens.hmac_secret is the development default; set LEASEGATE_HMAC_SECRET")]
    DevSecretInProduction,
    /// A duration or budget that must be positive is zero.
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    /// Mode cache longer than the staleness bound.
    #[error("governance.mode_cache_ms must be at most {max} (got {got})")]
    ModeCacheTooLong {
        /// Configured value.
        got: u64,
        /// Allowed maximum.
        max: u128,
    },
    /// `default_mode` is not a known mode.
    #[error("governance.default_mode is not a known mode: {0:?}")]
    UnknownMode(String),
}

impl LeasegateConfig {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    ///
    /// If the file does not exist, returns defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        let path = Self::config_path_with(|key| std::env::var(key).ok());
        let mut config = Self::load_from(&path)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load from a TOML file only, no env overrides. Missing file yields
    /// defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                Self::from_toml(&contents)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no config file found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!(
                "failed to read config file {}: {e}",
                path.display()
            )),
        }
    }

    /// Resolve the config path using a custom env resolver.
    pub fn config_path_with(env: impl Fn(&str) -> Option<String>) -> PathBuf {
        env("LEASEGATE_CONFIG_PATH").map_or_else(|| PathBuf::from("leasegate.toml"), PathBuf::from)
    }

    /// Apply environment variable overrides (env > config > defaults).
    ///
    /// Takes a resolver function so tests never touch the process
    /// environment.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        fn parsed<T: std::str::FromStr>(var: &'static str, value: &str) -> Option<T> {
            match value.parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!(var, value = %value, "ignoring invalid env override");
                    None
                }
            }
        }

        // Store.
        if let Some(v) = env("LEASEGATE_STORE_BACKEND") {
            match v.to_ascii_lowercase().as_str() {
                "sqlite" => self.store.backend = StoreBackend::Sqlite,
                "memory" => self.store.backend = StoreBackend::Memory,
                _ => warn!(var = "LEASEGATE_STORE_BACKEND", value = %v, "ignoring invalid env override"),
            }
        }
        if let Some(v) = env("LEASEGATE_SQLITE_PATH") {
            self.store.sqlite_path = v;
        }
        if let Some(n) = env("LEASEGATE_STORE_TIMEOUT_MS")
            .and_then(|v| parsed("LEASEGATE_STORE_TIMEOUT_MS", &v))
        {
            self.store.op_timeout_ms = n;
        }

        // Governance.
        if let Some(v) = env("LEASEGATE_DEFAULT_MODE") {
            self.governance.default_mode = v;
        }
        if let Some(n) =
            env("LEASEGATE_MODE_CACHE_MS").and_then(|v| parsed("LEASEGATE_MODE_CACHE_MS", &v))
        {
            self.governance.mode_cache_ms = n;
        }
        if let Some(n) = env("LEASEGATE_APPROVAL_TIMEOUT_SECS")
            .and_then(|v| parsed("LEASEGATE_APPROVAL_TIMEOUT_SECS", &v))
        {
            self.governance.approval_timeout_seconds = n;
        }

        // Tokens.
        if let Some(v) = env("LEASEGATE_HMAC_SECRET") {
            self.tokens.hmac_secret = v;
        }
        if let Some(b) = env("LEASEGATE_SINGLE_USE_TOKENS")
            .and_then(|v| parsed("LEASEGATE_SINGLE_USE_TOKENS", &v))
        {
            self.tokens.single_use = b;
        }

        // Paths.
        if let Some(v) = env("LEASEGATE_AUDIT_LOG") {
            self.audit.log_path = v;
        }
        if let Some(v) = env("LEASEGATE_REGISTRY_PATH") {
            self.registry.path = Some(v);
        }
        if let Some(v) = env("LEASEGATE_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = env("LEASEGATE_LOGS_DIR") {
            self.logging.logs_dir = Some(v);
        }
    }

    /// Parse a TOML string into config.
    ///
    /// # Errors
    ///
    /// Returns an error on malformed TOML.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).context("failed to parse config TOML")
    }

    /// Check the config is safe to run with.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self, production: bool) -> Result<(), ConfigError> {
        let secret = &self.tokens.hmac_secret;
        if secret.is_empty() {
            return Err(ConfigError::EmptySecret);
        }
        if production && secret == DEV_HMAC_SECRET {
            return Err(ConfigError::DevSecretInProduction);
        }
        if secret.len() < MIN_SECRET_LEN {
            warn!(
                len = secret.len(),
                min = MIN_SECRET_LEN,
                "tokens.hmac_secret is shorter than recommended"
            );
        }

        self.default_mode()?;
        if u128::from(self.governance.mode_cache_ms) > MAX_MODE_STALENESS.as_millis() {
            return Err(ConfigError::ModeCacheTooLong {
                got: self.governance.mode_cache_ms,
                max: MAX_MODE_STALENESS.as_millis(),
            });
        }

        let positive: [(&'static str, u64); 10] = [
            ("store.op_timeout_ms", self.store.op_timeout_ms),
            (
                "governance.elevation_ttl_seconds",
                self.governance.elevation_ttl_seconds,
            ),
            (
                "governance.approval_timeout_seconds",
                self.governance.approval_timeout_seconds,
            ),
            ("leases.ttl_by_risk.safe", self.leases.ttl_by_risk.safe),
            ("leases.ttl_by_risk.sensitive", self.leases.ttl_by_risk.sensitive),
            ("leases.ttl_by_risk.dangerous", self.leases.ttl_by_risk.dangerous),
            ("leases.calls_by_risk.safe", u64::from(self.leases.calls_by_risk.safe)),
            (
                "leases.calls_by_risk.sensitive",
                u64::from(self.leases.calls_by_risk.sensitive),
            ),
            (
                "leases.calls_by_risk.dangerous",
                u64::from(self.leases.calls_by_risk.dangerous),
            ),
            ("leases.one_shot_ttl_seconds", self.leases.one_shot_ttl_seconds),
        ];
        if let Some((name, _)) = positive.into_iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Zero(name));
        }
        Ok(())
    }

    /// Parsed default governance mode.
    ///
    /// # Errors
    ///
    /// [`ConfigError::UnknownMode`] if it does not parse.
    pub fn default_mode(&self) -> Result<GovernanceMode, ConfigError> {
        self.governance
            .default_mode
            .parse()
            .map_err(|_| ConfigError::UnknownMode(self.governance.default_mode.clone()))
    }

    /// Retry policy for the guarded store.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            op_timeout: Duration::from_millis(self.store.op_timeout_ms),
            max_retries: self.store.max_retries,
            backoff: Duration::from_millis(self.store.retry_backoff_ms),
        }
    }
}

// ── Store config ────────────────────────────────────────────────

/// Which [`Store`](crate::store::Store) backend to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Shared SQLite file.
    #[default]
    Sqlite,
    /// In-process map; single instance only.
    Memory,
}

/// Shared store settings (`[store]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Backend selection.
    pub backend: StoreBackend,
    /// Database file for the SQLite backend.
    pub sqlite_path: String,
    /// Per-operation timeout in milliseconds.
    pub op_timeout_ms: u64,
    /// Retries after a connection failure.
    pub max_retries: u32,
    /// First retry delay in milliseconds; doubles per retry.
    pub retry_backoff_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Sqlite,
            sqlite_path: "leasegate.db".to_owned(),
            op_timeout_ms: 2000,
            max_retries: 2,
            retry_backoff_ms: 50,
        }
    }
}

// ── Governance config ───────────────────────────────────────────

/// Governance settings (`[governance]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GovernanceConfig {
    /// Mode written when the store holds none.
    pub default_mode: String,
    /// Local mode cache window in milliseconds; at most 1000, 0 disables.
    pub mode_cache_ms: u64,
    /// Upper bound on an elevation's lifetime in seconds.
    pub elevation_ttl_seconds: u64,
    /// How long an approval may take in seconds.
    pub approval_timeout_seconds: u64,
    /// Tools denied even in bypass mode.
    pub bypass_deny_list: Vec<String>,
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            default_mode: "permission".to_owned(),
            mode_cache_ms: 1000,
            elevation_ttl_seconds: 300,
            approval_timeout_seconds: 300,
            bypass_deny_list: Vec::new(),
        }
    }
}

// ── Lease config ────────────────────────────────────────────────

/// A value per risk tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RiskTable<T> {
    /// Safe tools.
    pub safe: T,
    /// Sensitive tools.
    pub sensitive: T,
    /// Dangerous tools.
    pub dangerous: T,
}

impl<T: Copy> RiskTable<T> {
    /// Value for `risk`.
    pub fn get(&self, risk: RiskLevel) -> T {
        match risk {
            RiskLevel::Safe => self.safe,
            RiskLevel::Sensitive => self.sensitive,
            RiskLevel::Dangerous => self.dangerous,
        }
    }
}

/// Lease budget settings (`[leases]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LeasesConfig {
    /// Lease lifetime in seconds per risk tier.
    pub ttl_by_risk: RiskTable<u64>,
    /// Call budget per risk tier.
    pub calls_by_risk: RiskTable<u32>,
    /// Lifetime of a single-use lease granted by a `lease_seconds = 0`
    /// approval.
    pub one_shot_ttl_seconds: u64,
    /// Discovery tools that need no lease.
    pub bootstrap_tools: Vec<String>,
}

impl Default for LeasesConfig {
    fn default() -> Self {
        Self {
            ttl_by_risk: RiskTable {
                safe: 300,
                sensitive: 300,
                dangerous: 120,
            },
            calls_by_risk: RiskTable {
                safe: 3,
                sensitive: 1,
                dangerous: 1,
            },
            one_shot_ttl_seconds: 60,
            bootstrap_tools: vec!["search_tools".to_owned(), "get_tool_schema".to_owned()],
        }
    }
}

// ── Token config ────────────────────────────────────────────────

/// Capability token settings (`[tokens]`).
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct TokensConfig {
    /// HMAC signing secret.
    pub hmac_secret: String,
    /// Reject a token's second presentation.
    pub single_use: bool,
}

impl std::fmt::Debug for TokensConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokensConfig")
            .field("hmac_secret", &"[REDACTED]")
            .field("single_use", &self.single_use)
            .finish()
    }
}

impl Default for TokensConfig {
    fn default() -> Self {
        Self {
            hmac_secret: DEV_HMAC_SECRET.to_owned(),
            single_use: false,
        }
    }
}

// ── Paths ───────────────────────────────────────────────────────

/// Audit trail settings (`[audit]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// JSONL audit file.
    pub log_path: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            log_path: "audit.jsonl".to_owned(),
        }
    }
}

/// Diagnostic logging settings (`[logging]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Fallback filter when `RUST_LOG` is unset.
    pub level: String,
    /// Directory for rotated JSON logs; stderr only when unset.
    pub logs_dir: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            logs_dir: None,
        }
    }
}

/// Tool registry location (`[registry]`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// TOML file with a `[[tools]]` array.
    pub path: Option<String>,
}
