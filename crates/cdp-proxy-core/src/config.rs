//! Configuration loading and validation.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level proxy configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Prefix of the synthetic browser session id (`<prefix>-<uuid>`).
    #[serde(default = "default_session_prefix")]
    pub browser_session_prefix: String,

    /// Start with `Target.setAutoAttach` already enabled.
    #[serde(default)]
    pub auto_attach: bool,

    /// Start with `Target.setDiscoverTargets` already enabled.
    #[serde(default)]
    pub discover_targets: bool,

    /// Log every outbound event at trace level.
    #[serde(default)]
    pub trace_events: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            browser_session_prefix: default_session_prefix(),
            auto_attach: false,
            discover_targets: false,
            trace_events: false,
        }
    }
}

fn default_session_prefix() -> String {
    "browser-session".into()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "cdp_proxy=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    let re = match regex::Regex::new(r"\$\{([^}]+)\}") {
        Ok(re) => re,
        Err(_) => return input.to_string(),
    };
    re.replace_all(input, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_default()
    })
    .into_owned()
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    /// A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let substituted = substitute_env_vars(raw);
        json5::from_str(&substituted).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn proxy(&self) -> ProxyConfig {
        self.proxy.clone().unwrap_or_default()
    }

    pub fn logging(&self) -> LoggingConfig {
        self.logging.clone().unwrap_or_else(|| LoggingConfig {
            format: default_log_format(),
            level: None,
            filters: Vec::new(),
            output: default_log_output(),
        })
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if let Some(proxy) = &self.proxy {
            if proxy.browser_session_prefix.trim().is_empty() {
                errors.push("proxy.browser_session_prefix cannot be empty".to_string());
            }
        }

        if let Some(logging) = &self.logging {
            if !matches!(logging.format.as_str(), "plain" | "json") {
                warnings.push(format!(
                    "Unknown logging.format '{}', falling back to plain",
                    logging.format
                ));
            }
            if !matches!(logging.output.as_str(), "stderr" | "stdout") {
                warnings.push(format!(
                    "Unknown logging.output '{}', falling back to stderr",
                    logging.output
                ));
            }
        }

        (warnings, errors)
    }
}
