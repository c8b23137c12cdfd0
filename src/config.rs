//! Runtime configuration loading and validation.
//!
//! Reads `.cowork/runtime.yaml` and resolves environment variables. Every
//! field has a default, so an empty file (or no file) yields a working
//! configuration. The loaded config is read-only for the life of a session.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Name of the config file, relative to a `.cowork` directory.
const CONFIG_RELATIVE_PATH: &str = ".cowork/runtime.yaml";

/// Environment variable pointing directly at a config file.
const CONFIG_ENV_VAR: &str = "COWORK_RUNTIME_CONFIG";

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not find .cowork/runtime.yaml (set COWORK_RUNTIME_CONFIG to override)")]
    NotFound,

    #[error("failed to read {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to parse config: {reason}")]
    Parse { reason: String },

    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

// ─── Public Types ────────────────────────────────────────────────────────────

/// Top-level runtime configuration (mirrors `runtime.yaml`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub policy: PolicyConfig,
    pub limits: LimitsConfig,
    pub budget: BudgetConfig,
    pub retry: RetryConfig,
    pub audit: AuditConfig,
    /// OpenAI-compatible endpoint settings. Optional so callers can plug in
    /// their own provider.
    pub provider: Option<ProviderSettings>,
}

/// Permission policy switches.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Repository root; relative paths in tool arguments resolve against it.
    pub root: PathBuf,
    /// Deny every write and exec tool.
    pub read_only: bool,
    /// Deny paths that resolve outside `root`.
    pub restrict_to_repo: bool,
    /// Permit access to files matching the sensitive patterns.
    pub allow_sensitive: bool,
    /// Permit privilege-escalation commands (sudo, su, doas, pkexec).
    pub allow_sudo: bool,
    /// Ask before running calls that are not known-safe. When off, such calls
    /// are allowed outright.
    pub require_permission: bool,
    /// Ask even for known-safe calls (reads, harmless commands).
    pub require_permission_for_all: bool,
    /// Permit network-class tools.
    pub enable_network: bool,
    /// Where "always" grants are persisted. Defaults to the data dir.
    pub permissions_file: Option<PathBuf>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            read_only: false,
            restrict_to_repo: false,
            allow_sensitive: false,
            allow_sudo: false,
            require_permission: true,
            require_permission_for_all: false,
            enable_network: true,
            permissions_file: None,
        }
    }
}

/// Hard resource limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Largest file (bytes) tools should read or write.
    pub max_file_size: u64,
    /// Operations (tool executions) permitted per session tree.
    pub max_operations: u64,
    /// Default iteration cap for autopilot loops.
    pub max_iterations: usize,
    /// Model/tool steps one turn may take before it is reported incomplete.
    pub max_steps_per_turn: usize,
    /// Hard timeout for exec-class tools.
    pub shell_timeout_secs: u64,
    /// Hard timeout for every other tool.
    pub tool_timeout_secs: u64,
    /// Per-attempt timeout for completion requests.
    pub llm_timeout_secs: u64,
    /// How long to wait for a confirmation before treating it as denied.
    pub confirmation_timeout_secs: u64,
    /// Tool output longer than this is truncated before entering the transcript.
    pub max_tool_output_chars: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_file_size: 512_000,
            max_operations: 10_000,
            max_iterations: 100,
            max_steps_per_turn: 100,
            shell_timeout_secs: 30,
            tool_timeout_secs: 120,
            llm_timeout_secs: 300,
            confirmation_timeout_secs: 120,
            max_tool_output_chars: 100_000,
        }
    }
}

/// Context-window budget and compaction tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Model context window, in tokens.
    pub context_limit: u64,
    /// Fraction of `context_limit` at which compaction starts.
    pub compaction_threshold: f64,
    /// Tool-output tokens in the newest exchanges that are never compacted.
    pub prune_protect: u64,
    /// A run of exchanges is only compacted when it weighs more than this.
    pub prune_minimum: u64,
    /// Run compaction automatically.
    pub auto_compact: bool,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            context_limit: 128_000,
            compaction_threshold: 0.75,
            prune_protect: 40_000,
            prune_minimum: 20_000,
            auto_compact: true,
        }
    }
}

/// Completion retry policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
        }
    }
}

/// Audit log and backups.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub enabled: bool,
    /// SQLite database file. Defaults to the data dir.
    pub database_path: Option<PathBuf>,
    /// Snapshot files before write-class tools modify them.
    pub backups_enabled: bool,
    pub backup_dir: Option<PathBuf>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            database_path: None,
            backups_enabled: false,
            backup_dir: None,
        }
    }
}

/// An OpenAI-compatible chat completions endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderSettings {
    pub base_url: String,
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// USD per million input tokens, for cost accounting.
    #[serde(default)]
    pub input_cost_per_mtok: f64,
    /// USD per million output tokens.
    #[serde(default)]
    pub output_cost_per_mtok: f64,
}

fn default_temperature() -> f32 {
    0.2
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_connect_timeout_secs() -> u64 {
    10
}

impl RuntimeConfig {
    /// Check cross-field constraints serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let threshold = self.budget.compaction_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(ConfigError::Invalid {
                field: "budget.compaction_threshold",
                reason: format!("must be in (0, 1], got {threshold}"),
            });
        }
        if self.budget.context_limit == 0 {
            return Err(ConfigError::Invalid {
                field: "budget.context_limit",
                reason: "must be positive".into(),
            });
        }
        if self.limits.max_steps_per_turn == 0 {
            return Err(ConfigError::Invalid {
                field: "limits.max_steps_per_turn",
                reason: "must be positive".into(),
            });
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::Invalid {
                field: "retry.base_delay_ms",
                reason: format!(
                    "{} exceeds retry.max_delay_ms ({})",
                    self.retry.base_delay_ms, self.retry.max_delay_ms
                ),
            });
        }
        Ok(())
    }

    /// Where persistent grants are stored.
    pub fn permissions_path(&self) -> PathBuf {
        self.policy
            .permissions_file
            .clone()
            .unwrap_or_else(|| crate::data_dir().join("permissions.json"))
    }

    pub fn audit_database_path(&self) -> PathBuf {
        self.audit
            .database_path
            .clone()
            .unwrap_or_else(|| crate::data_dir().join("audit.db"))
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.audit
            .backup_dir
            .clone()
            .unwrap_or_else(|| crate::data_dir().join("backups"))
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate the config file.
///
/// Checks `COWORK_RUNTIME_CONFIG` first, then searches upward from `start`
/// for `.cowork/runtime.yaml`.
pub fn find_config_path(start: &Path) -> Result<PathBuf, ConfigError> {
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        let candidate = PathBuf::from(expand_tilde(&path));
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_RELATIVE_PATH);
        if candidate.exists() {
            return Ok(candidate);
        }
        if !dir.pop() {
            break;
        }
    }

    Err(ConfigError::NotFound)
}

/// Load, interpolate, parse and validate a config file.
///
/// String values may use `${VAR_NAME}` or `${VAR_NAME:-default}`.
pub fn load_config(path: &Path) -> Result<RuntimeConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    parse_config(&raw)
}

/// Parse config text (after env interpolation) and validate it.
pub fn parse_config(raw: &str) -> Result<RuntimeConfig, ConfigError> {
    let interpolated = interpolate_env_vars(raw);

    // An empty document deserializes as null; treat it as all defaults.
    let config: RuntimeConfig = if interpolated.trim().is_empty() {
        RuntimeConfig::default()
    } else {
        serde_yaml::from_str(&interpolated).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?
    };

    config.validate()?;
    Ok(config)
}

/// Find and load the config, falling back to defaults when none exists.
pub fn load_or_default(start: &Path) -> Result<RuntimeConfig, ConfigError> {
    match find_config_path(start) {
        Ok(path) => {
            tracing::info!(path = %path.display(), "loading runtime config");
            load_config(&path)
        }
        Err(ConfigError::NotFound) => {
            tracing::info!("no runtime config found, using defaults");
            Ok(RuntimeConfig::default())
        }
        Err(e) => Err(e),
    }
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve a variable expression like `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    if let Some((var_name, default)) = expr.split_once(":-") {
        std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
    } else {
        std::env::var(expr).unwrap_or_default()
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
