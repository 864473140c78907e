//! Tracer configuration.
//!
//! A [`Config`] is an immutable snapshot once handed to a tracer. It can be built in code with the
//! chainable `with_*` methods, read from a TOML file, or read from the environment via the
//! [envy](https://docs.rs/envy/latest/envy/) crate. Environment settings take precedence over
//! file settings.
//!
//! Recognized environment variables:
//!
//! * `APM_CONFIG`: path to a TOML config file, read first if given.
//! * `APM_TOKEN`: the account token. If not given, it is read from
//!   `<config dir>/apm/token`.
//! * `APM_APP_NAME`: the application name reported with every trace.
//! * `APM_SAMPLE_RATE`: fraction of invocations traced, in `[0, 1]`.
//! * `APM_SEND_BATCH`, `APM_BATCH_SIZE`, `APM_MAX_BATCH_SIZE_BYTES`: batch queue routing.
//! * `APM_MAX_TRACE_WAIT_MS`: upper bound on waiting for pending operations before a send.
//! * `APM_SEND_ONLY_ERRORS`: drop traces that contain no errors.
//! * `APM_IGNORED_KEYS`: comma-separated metadata keys to redact; `/regex/` entries are patterns.
//! * `APM_REMOVE_IGNORED_KEYS`: remove ignored keys instead of masking them.
//! * `APM_METADATA_ONLY`: suppress full payload capture.
//! * `APM_LABELS`: comma-separated `key=value` pairs attached to every trace.
//! * `APM_MAX_TRACE_SIZE`, `APM_MAX_LABEL_SIZE`: size budgets, in bytes.
//! * `APM_DISABLE`: disable sending entirely.
//! * `APM_DASHBOARD_URL`: base url used by `Tracer::get_trace_url`.
//! * `APM_CONTEXT_MODE`: `task-local` (default) or `global`.

use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    env,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};
use thiserror::Error;
use url::Url;

use crate::context::ContextMode;

pub const CONFIG_ENV_VAR: &str = "APM_CONFIG";

pub const DEFAULT_MAX_TRACE_SIZE: usize = 64 * 1024;
pub const DEFAULT_MAX_LABEL_SIZE: usize = 10 * 1024;
pub const DEFAULT_MAX_TRACE_WAIT: Duration = Duration::from_millis(200);
pub const DEFAULT_BATCH_SIZE: usize = 5000;
pub const DEFAULT_MAX_BATCH_SIZE_BYTES: usize = 5 * 1024 * 1024;

/// Per-process tracer configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub token: String,
    pub app_name: String,
    pub sample_rate: f64,
    pub send_batch: bool,
    pub batch_size: usize,
    pub max_batch_size_bytes: usize,
    pub max_trace_wait: Duration,
    pub send_only_errors: bool,
    pub ignored_keys: Vec<String>,
    pub remove_ignored_keys: bool,
    pub metadata_only: bool,
    pub labels: BTreeMap<String, String>,
    pub max_trace_size: usize,
    pub max_label_size: usize,
    pub disabled: bool,
    pub dashboard_url: Option<Url>,
    pub context_mode: ContextMode,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            token: String::new(),
            app_name: "Application".to_string(),
            sample_rate: 1.0,
            send_batch: false,
            batch_size: DEFAULT_BATCH_SIZE,
            max_batch_size_bytes: DEFAULT_MAX_BATCH_SIZE_BYTES,
            max_trace_wait: DEFAULT_MAX_TRACE_WAIT,
            send_only_errors: false,
            ignored_keys: Vec::new(),
            remove_ignored_keys: false,
            metadata_only: false,
            labels: BTreeMap::new(),
            max_trace_size: DEFAULT_MAX_TRACE_SIZE,
            max_label_size: DEFAULT_MAX_LABEL_SIZE,
            disabled: false,
            dashboard_url: None,
            context_mode: ContextMode::TaskLocal,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("Error in config file {} relating to TOML parsing. {error}", .path.display())]
    ConfigFileToml {
        path: PathBuf,
        #[source]
        error: toml::de::Error,
    },

    #[error("Error in config content relating to TOML parsing. {error}")]
    ConfigToml {
        #[source]
        error: toml::de::Error,
    },

    #[error("IO Error")]
    Io(#[from] std::io::Error),

    #[error("Error reading configuration from the environment")]
    Env(#[from] envy::Error),

    #[error("Sample rate must be within [0, 1], got {0}")]
    SampleRate(f64),

    #[error("Invalid label '{0}', expected the form key=value")]
    Label(String),

    #[error("Invalid dashboard url")]
    Url(#[from] url::ParseError),

    #[error("Unknown context mode '{0}', expected 'task-local' or 'global'")]
    ContextMode(String),
}

/// Raw representation of the TOML config file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
struct ConfigFile {
    token: Option<String>,
    app_name: Option<String>,
    sample_rate: Option<f64>,
    send_batch: Option<bool>,
    batch_size: Option<usize>,
    max_batch_size_bytes: Option<usize>,
    max_trace_wait_ms: Option<u64>,
    send_only_errors: Option<bool>,
    ignored_keys: Option<Vec<String>>,
    remove_ignored_keys: Option<bool>,
    metadata_only: Option<bool>,
    labels: BTreeMap<String, String>,
    max_trace_size: Option<usize>,
    max_label_size: Option<usize>,
    disable: Option<bool>,
    dashboard_url: Option<String>,
    context_mode: Option<String>,
}

#[derive(Deserialize)]
struct EnvConfig {
    apm_token: Option<String>,
    apm_app_name: Option<String>,
    apm_sample_rate: Option<f64>,
    apm_send_batch: Option<bool>,
    apm_batch_size: Option<usize>,
    apm_max_batch_size_bytes: Option<usize>,
    apm_max_trace_wait_ms: Option<u64>,
    apm_send_only_errors: Option<bool>,
    apm_ignored_keys: Option<Vec<String>>,
    apm_remove_ignored_keys: Option<bool>,
    apm_metadata_only: Option<bool>,
    apm_labels: Option<Vec<String>>,
    apm_max_trace_size: Option<usize>,
    apm_max_label_size: Option<usize>,
    apm_disable: Option<bool>,
    apm_dashboard_url: Option<String>,
    apm_context_mode: Option<String>,
}

impl Config {
    pub fn new() -> Config {
        Config::default()
    }

    /// Load configuration from the file named by `APM_CONFIG` (if any), then apply environment
    /// overrides and fill a missing token from the user's config directory.
    pub fn load() -> Result<Config, ConfigLoadError> {
        let mut cfg = match env::var(CONFIG_ENV_VAR) {
            Ok(path) => Config::from_file(Path::new(&path))?,
            Err(_) => Config::default(),
        };
        cfg.apply_env()?;
        if cfg.token.is_empty() {
            if let Some(token) = Self::resolve_token_file() {
                cfg.token = token;
            }
        }
        Ok(cfg)
    }

    /// Defaults overridden by the environment only.
    pub fn from_env() -> Result<Config, ConfigLoadError> {
        let mut cfg = Config::default();
        cfg.apply_env()?;
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> Result<Config, ConfigLoadError> {
        let content = std::fs::read_to_string(path)?;
        let raw: ConfigFile =
            toml::from_str(&content).map_err(|error| ConfigLoadError::ConfigFileToml {
                path: path.to_owned(),
                error,
            })?;
        Config::default().merge_file(raw)
    }

    pub fn from_toml_str(content: &str) -> Result<Config, ConfigLoadError> {
        let raw: ConfigFile =
            toml::from_str(content).map_err(|error| ConfigLoadError::ConfigToml { error })?;
        Config::default().merge_file(raw)
    }

    fn merge_file(mut self, raw: ConfigFile) -> Result<Config, ConfigLoadError> {
        if let Some(v) = raw.token {
            self.token = v;
        }
        if let Some(v) = raw.app_name {
            self.app_name = v;
        }
        if let Some(v) = raw.sample_rate {
            self.sample_rate = validate_sample_rate(v)?;
        }
        if let Some(v) = raw.send_batch {
            self.send_batch = v;
        }
        if let Some(v) = raw.batch_size {
            self.batch_size = v;
        }
        if let Some(v) = raw.max_batch_size_bytes {
            self.max_batch_size_bytes = v;
        }
        if let Some(v) = raw.max_trace_wait_ms {
            self.max_trace_wait = Duration::from_millis(v);
        }
        if let Some(v) = raw.send_only_errors {
            self.send_only_errors = v;
        }
        if let Some(v) = raw.ignored_keys {
            self.ignored_keys = v;
        }
        if let Some(v) = raw.remove_ignored_keys {
            self.remove_ignored_keys = v;
        }
        if let Some(v) = raw.metadata_only {
            self.metadata_only = v;
        }
        self.labels.extend(raw.labels);
        if let Some(v) = raw.max_trace_size {
            self.max_trace_size = v;
        }
        if let Some(v) = raw.max_label_size {
            self.max_label_size = v;
        }
        if let Some(v) = raw.disable {
            self.disabled = v;
        }
        if let Some(v) = raw.dashboard_url {
            self.dashboard_url = Some(Url::parse(&v)?);
        }
        if let Some(v) = raw.context_mode {
            self.context_mode = ContextMode::from_str(&v)?;
        }
        Ok(self)
    }

    fn apply_env(&mut self) -> Result<(), ConfigLoadError> {
        let env_config = envy::from_env::<EnvConfig>()?;

        if let Some(v) = env_config.apm_token {
            self.token = v;
        }
        if let Some(v) = env_config.apm_app_name {
            self.app_name = v;
        }
        if let Some(v) = env_config.apm_sample_rate {
            self.sample_rate = validate_sample_rate(v)?;
        }
        if let Some(v) = env_config.apm_send_batch {
            self.send_batch = v;
        }
        if let Some(v) = env_config.apm_batch_size {
            self.batch_size = v;
        }
        if let Some(v) = env_config.apm_max_batch_size_bytes {
            self.max_batch_size_bytes = v;
        }
        if let Some(v) = env_config.apm_max_trace_wait_ms {
            self.max_trace_wait = Duration::from_millis(v);
        }
        if let Some(v) = env_config.apm_send_only_errors {
            self.send_only_errors = v;
        }
        if let Some(v) = env_config.apm_ignored_keys {
            self.ignored_keys = v
                .into_iter()
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty())
                .collect();
        }
        if let Some(v) = env_config.apm_remove_ignored_keys {
            self.remove_ignored_keys = v;
        }
        if let Some(v) = env_config.apm_metadata_only {
            self.metadata_only = v;
        }
        if let Some(pairs) = env_config.apm_labels {
            for pair in pairs {
                let (k, v) = parse_label_pair(&pair)?;
                self.labels.insert(k, v);
            }
        }
        if let Some(v) = env_config.apm_max_trace_size {
            self.max_trace_size = v;
        }
        if let Some(v) = env_config.apm_max_label_size {
            self.max_label_size = v;
        }
        if let Some(v) = env_config.apm_disable {
            self.disabled = v;
        }
        if let Some(v) = env_config.apm_dashboard_url {
            self.dashboard_url = Some(Url::parse(&v)?);
        }
        if let Some(v) = env_config.apm_context_mode {
            self.context_mode = ContextMode::from_str(&v)?;
        }
        Ok(())
    }

    fn resolve_token_file() -> Option<String> {
        dirs::config_dir()
            .and_then(|config| std::fs::read_to_string(config.join("apm").join("token")).ok())
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    pub fn with_app_name(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = app_name.into();
        self
    }

    /// Set the sampling rate. Values outside `[0, 1]` are clamped.
    pub fn with_sample_rate(mut self, sample_rate: f64) -> Self {
        self.sample_rate = if sample_rate.is_nan() {
            1.0
        } else {
            sample_rate.clamp(0.0, 1.0)
        };
        self
    }

    pub fn with_send_batch(mut self, send_batch: bool) -> Self {
        self.send_batch = send_batch;
        self
    }

    pub fn with_max_trace_wait(mut self, wait: Duration) -> Self {
        self.max_trace_wait = wait;
        self
    }

    pub fn with_send_only_errors(mut self, send_only_errors: bool) -> Self {
        self.send_only_errors = send_only_errors;
        self
    }

    pub fn with_ignored_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ignored_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_remove_ignored_keys(mut self, remove: bool) -> Self {
        self.remove_ignored_keys = remove;
        self
    }

    pub fn with_metadata_only(mut self, metadata_only: bool) -> Self {
        self.metadata_only = metadata_only;
        self
    }

    /// Add a label attached to every trace.
    ///
    /// This can be called multiple times.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_max_trace_size(mut self, bytes: usize) -> Self {
        self.max_trace_size = bytes;
        self
    }

    pub fn with_max_label_size(mut self, bytes: usize) -> Self {
        self.max_label_size = bytes;
        self
    }

    pub fn with_disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    pub fn with_dashboard_url(mut self, url: Url) -> Self {
        self.dashboard_url = Some(url);
        self
    }

    pub fn with_context_mode(mut self, mode: ContextMode) -> Self {
        self.context_mode = mode;
        self
    }
}

fn validate_sample_rate(rate: f64) -> Result<f64, ConfigLoadError> {
    if (0.0..=1.0).contains(&rate) {
        Ok(rate)
    } else {
        Err(ConfigLoadError::SampleRate(rate))
    }
}

fn parse_label_pair(s: &str) -> Result<(String, String), ConfigLoadError> {
    let parts: Vec<&str> = s.trim().splitn(2, '=').map(|p| p.trim()).collect();
    if parts.len() != 2 || parts[0].is_empty() {
        return Err(ConfigLoadError::Label(s.to_string()));
    }
    Ok((parts[0].to_string(), parts[1].to_string()))
}
