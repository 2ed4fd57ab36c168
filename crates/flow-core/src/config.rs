//! Configuration parsing for the orchestration daemon.
//!
//! Key=value format with `#` comments, one setting per line.
//! Precedence: CLI flags > `--config` file > `.flow/config` > defaults.

use crate::retry::{BackoffKind, BackoffPolicy, RetryPolicy};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
}

/// Daemon and workflow configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    // Server
    pub port: u16,
    pub data_dir: PathBuf,
    pub project_id: String,

    // Agent process
    pub agent_bin: PathBuf,
    pub agent_args: Vec<String>,

    // Engine
    pub max_concurrent_steps: usize,
    /// Process pool bound across all workflows.
    pub max_processes: usize,
    pub checkpoint_interval: u32,
    pub continue_on_step_failure: bool,
    pub step_timeout_ms: u64,

    // Worktrees
    pub base_branch: Option<String>,
    pub branch_prefix: String,
    pub worktree_path_template: String,
    pub worktree_cleanup: bool,

    // Retry / circuit breaker
    pub retry_max_attempts: u32,
    pub retry_backoff: BackoffKind,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub retry_jitter: bool,
    pub retryable_errors: Vec<String>,
    pub retryable_exit_codes: Vec<i32>,
    pub breaker_threshold: u32,
    pub breaker_cooldown_ms: u64,

    // Wakeup batching
    pub batch_window_ms: u64,

    // Coordinator
    pub persist_interval_ms: u64,
    pub gc_interval_ms: u64,
    pub execution_gc_age_ms: u64,
    pub agent_heartbeat_timeout_ms: u64,

    // Process manager
    pub termination_grace_ms: u64,

    // Broadcast
    pub subscriber_queue_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 7070,
            data_dir: dirs::data_local_dir()
                .map_or_else(|| PathBuf::from("~/.local/share/flowd"), |d| d.join("flowd")),
            project_id: "default".to_string(),
            agent_bin: PathBuf::from("claude"),
            agent_args: Vec::new(),
            max_concurrent_steps: 1,
            max_processes: 8,
            checkpoint_interval: 1,
            continue_on_step_failure: false,
            step_timeout_ms: 0,
            base_branch: None,
            branch_prefix: "flow/".to_string(),
            worktree_path_template: "../{{ repo }}.{{ branch | sanitize }}".to_string(),
            worktree_cleanup: true,
            retry_max_attempts: 3,
            retry_backoff: BackoffKind::Exponential,
            retry_base_delay_ms: 1000,
            retry_max_delay_ms: 30_000,
            retry_jitter: true,
            retryable_errors: Vec::new(),
            retryable_exit_codes: Vec::new(),
            breaker_threshold: 5,
            breaker_cooldown_ms: 60_000,
            batch_window_ms: 5000,
            persist_interval_ms: 500,
            gc_interval_ms: 300_000,
            execution_gc_age_ms: 3_600_000,
            agent_heartbeat_timeout_ms: 120_000,
            termination_grace_ms: 2000,
            subscriber_queue_size: 256,
        }
    }
}

impl Config {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    /// Parse config content (key=value format).
    fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();

            // Skip empty lines and comments
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());
            self.apply_value(key, &value)?;
        }
        Ok(())
    }

    /// Remove surrounding quotes from a value.
    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    /// Apply a single config value.
    fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "port" => self.port = Self::parse_int(key, value)?,
            "data_dir" => self.data_dir = PathBuf::from(value),
            "project_id" => self.project_id = value.to_string(),
            "agent_bin" => self.agent_bin = PathBuf::from(value),
            "agent_args" => {
                self.agent_args = value.split_whitespace().map(str::to_string).collect();
            }
            "max_concurrent_steps" => self.max_concurrent_steps = Self::parse_int(key, value)?,
            "max_processes" => self.max_processes = Self::parse_int(key, value)?,
            "checkpoint_interval" => self.checkpoint_interval = Self::parse_int(key, value)?,
            "continue_on_step_failure" => {
                self.continue_on_step_failure = Self::parse_bool(key, value)?;
            }
            "step_timeout_ms" => self.step_timeout_ms = Self::parse_int(key, value)?,
            "base_branch" => self.base_branch = Some(value.to_string()),
            "branch_prefix" => self.branch_prefix = value.to_string(),
            "worktree_path_template" => self.worktree_path_template = value.to_string(),
            "worktree_cleanup" => self.worktree_cleanup = Self::parse_bool(key, value)?,
            "retry_max_attempts" => self.retry_max_attempts = Self::parse_int(key, value)?,
            "retry_backoff" => {
                self.retry_backoff = match value {
                    "exponential" => BackoffKind::Exponential,
                    "linear" => BackoffKind::Linear,
                    "fixed" => BackoffKind::Fixed,
                    _ => {
                        return Err(ConfigError::InvalidLine(format!(
                            "retry_backoff must be 'exponential', 'linear', or 'fixed', got '{value}'"
                        )))
                    }
                }
            }
            "retry_base_delay_ms" => self.retry_base_delay_ms = Self::parse_int(key, value)?,
            "retry_max_delay_ms" => self.retry_max_delay_ms = Self::parse_int(key, value)?,
            "retry_jitter" => self.retry_jitter = Self::parse_bool(key, value)?,
            "retryable_errors" => {
                // Pipe-separated list of case-sensitive substrings
                self.retryable_errors = value
                    .split('|')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
            }
            "retryable_exit_codes" => {
                let mut codes = Vec::new();
                for part in value.split([',', ' ']).filter(|s| !s.is_empty()) {
                    codes.push(part.parse().map_err(|_| ConfigError::InvalidInt {
                        key: key.to_string(),
                        value: value.to_string(),
                    })?);
                }
                self.retryable_exit_codes = codes;
            }
            "breaker_threshold" => self.breaker_threshold = Self::parse_int(key, value)?,
            "breaker_cooldown_ms" => self.breaker_cooldown_ms = Self::parse_int(key, value)?,
            "batch_window_ms" => self.batch_window_ms = Self::parse_int(key, value)?,
            "persist_interval_ms" => self.persist_interval_ms = Self::parse_int(key, value)?,
            "gc_interval_ms" => self.gc_interval_ms = Self::parse_int(key, value)?,
            "execution_gc_age_ms" => self.execution_gc_age_ms = Self::parse_int(key, value)?,
            "agent_heartbeat_timeout_ms" => {
                self.agent_heartbeat_timeout_ms = Self::parse_int(key, value)?;
            }
            "termination_grace_ms" => self.termination_grace_ms = Self::parse_int(key, value)?,
            "subscriber_queue_size" => self.subscriber_queue_size = Self::parse_int(key, value)?,
            _ => {
                // Warn but don't fail for unknown keys
                eprintln!("Warning: unknown config key: {key}");
            }
        }
        Ok(())
    }

    fn parse_int<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// Parse a boolean value.
    fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
        match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Ok(true),
            "false" | "0" | "no" | "n" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    /// Build the retry policy from the configured knobs.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            backoff: BackoffPolicy {
                kind: self.retry_backoff,
                base_delay_ms: self.retry_base_delay_ms,
                max_delay_ms: self.retry_max_delay_ms,
                jitter: self.retry_jitter,
            },
            retryable_errors: self.retryable_errors.clone(),
            retryable_exit_codes: self.retryable_exit_codes.clone(),
        }
    }

    /// Default SQLite database path under the data directory.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("flowd.db")
    }
}

/// Optional dependency for resolving user directories.
mod dirs {
    use std::path::PathBuf;

    pub fn data_local_dir() -> Option<PathBuf> {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".local/share")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let config = Config::default();
        assert_eq!(config.port, 7070);
        assert_eq!(config.checkpoint_interval, 1);
        assert_eq!(config.batch_window_ms, 5000);
        assert_eq!(config.persist_interval_ms, 500);
        assert_eq!(config.gc_interval_ms, 300_000);
        assert_eq!(config.execution_gc_age_ms, 3_600_000);
        assert_eq!(config.agent_heartbeat_timeout_ms, 120_000);
        assert_eq!(config.termination_grace_ms, 2000);
        assert!(!config.continue_on_step_failure);
    }

    #[test]
    fn parse_simple_config() {
        let mut config = Config::default();
        let content = r#"
port=9000
agent_bin="/usr/local/bin/agent"
continue_on_step_failure=true
batch_window_ms=1000
"#;
        config.parse_content(content).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.agent_bin, PathBuf::from("/usr/local/bin/agent"));
        assert!(config.continue_on_step_failure);
        assert_eq!(config.batch_window_ms, 1000);
    }

    #[test]
    fn parse_retryable_lists() {
        let mut config = Config::default();
        let content = r#"
retryable_errors="connection reset | rate limit"
retryable_exit_codes=75,111
"#;
        config.parse_content(content).unwrap();
        assert_eq!(
            config.retryable_errors,
            vec!["connection reset".to_string(), "rate limit".to_string()]
        );
        assert_eq!(config.retryable_exit_codes, vec![75, 111]);
    }

    #[test]
    fn parse_backoff_kind() {
        let mut config = Config::default();
        config.parse_content("retry_backoff=linear").unwrap();
        assert_eq!(config.retry_backoff, BackoffKind::Linear);

        let err = config.parse_content("retry_backoff=quadratic");
        assert!(err.is_err());
    }

    #[test]
    fn unquote_removes_quotes() {
        assert_eq!(Config::unquote("\"hello\""), "hello");
        assert_eq!(Config::unquote("'world'"), "world");
        assert_eq!(Config::unquote("noquotes"), "noquotes");
    }

    #[test]
    fn parse_bool_accepts_variants() {
        assert!(Config::parse_bool("test", "true").unwrap());
        assert!(Config::parse_bool("test", "1").unwrap());
        assert!(Config::parse_bool("test", "on").unwrap());
        assert!(!Config::parse_bool("test", "false").unwrap());
        assert!(!Config::parse_bool("test", "off").unwrap());
        assert!(Config::parse_bool("test", "maybe").is_err());
    }

    #[test]
    fn invalid_line_is_rejected() {
        let mut config = Config::default();
        assert!(config.parse_content("this is not a setting").is_err());
    }

    #[test]
    fn unknown_key_is_ignored() {
        let mut config = Config::default();
        config.parse_content("no_such_key=1").unwrap();
    }

    #[test]
    fn retry_policy_built_from_knobs() {
        let mut config = Config::default();
        config
            .parse_content("retry_max_attempts=5\nretry_base_delay_ms=200\nretry_jitter=false")
            .unwrap();
        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.backoff.base_delay_ms, 200);
        assert!(!policy.backoff.jitter);
    }
}
