/// Configuration management
use crate::error::{ChatError, Result};
use crate::sync_engine::SyncConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Messenger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Where the sled store lives (defaults to `.parley/<user>`)
    pub data_dir: Option<PathBuf>,

    /// Id of the user running this device
    pub local_user_id: String,

    /// First retry delay; doubles per failed attempt
    pub retry_base: Duration,

    /// Upper bound on the retry delay
    pub retry_cap: Duration,

    /// Failed attempts before a send is shown as failed
    pub failure_threshold: u32,

    /// Use a volatile in-memory store instead of sled
    pub in_memory: bool,

    /// Interval of the call duration ticker
    pub call_tick: Duration,

    /// Delay before a simulated remote answer on outgoing calls
    pub simulated_answer: Duration,
}

impl Default for Config {
    fn default() -> Self {
        let sync = SyncConfig::default();
        Self {
            data_dir: None,
            local_user_id: "me".to_string(),
            retry_base: sync.retry_base,
            retry_cap: sync.retry_cap,
            failure_threshold: sync.visible_failure_threshold,
            in_memory: false,
            call_tick: Duration::from_secs(1),
            simulated_answer: Duration::from_secs(2),
        }
    }
}

impl Config {
    /// Parse `--flag value` pairs after the program name and command.
    ///
    /// Unrecognized arguments are returned in order as the command's
    /// positional arguments.
    pub fn from_args(args: &[String]) -> Result<(Self, Vec<String>)> {
        let mut config = Self::default();
        let mut rest = Vec::new();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--data-dir" => {
                    let path = flag_value(args, i, "--data-dir")?;
                    config.data_dir = Some(PathBuf::from(path));
                    i += 2;
                }
                "--user" => {
                    config.local_user_id = flag_value(args, i, "--user")?.to_string();
                    i += 2;
                }
                "--retry-base-ms" => {
                    config.retry_base = millis(flag_value(args, i, "--retry-base-ms")?, "--retry-base-ms")?;
                    i += 2;
                }
                "--retry-cap-ms" => {
                    config.retry_cap = millis(flag_value(args, i, "--retry-cap-ms")?, "--retry-cap-ms")?;
                    i += 2;
                }
                "--failure-threshold" => {
                    let v = flag_value(args, i, "--failure-threshold")?;
                    config.failure_threshold = v.parse::<u32>().map_err(|_| {
                        ChatError::Config("--failure-threshold must be a number".to_string())
                    })?;
                    i += 2;
                }
                "--memory" => {
                    config.in_memory = true;
                    i += 1;
                }
                other => {
                    rest.push(other.to_string());
                    i += 1;
                }
            }
        }

        config.apply_env();
        config.validate()?;
        Ok((config, rest))
    }

    // Env overrides (nice for scripts)
    fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var("PARLEY_DATA_DIR") {
            self.data_dir = Some(PathBuf::from(dir));
        }
        if let Ok(user) = std::env::var("PARLEY_USER") {
            if !user.is_empty() {
                self.local_user_id = user;
            }
        }
        if let Some(ms) = env_u64("PARLEY_RETRY_BASE_MS") {
            self.retry_base = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("PARLEY_RETRY_CAP_MS") {
            self.retry_cap = Duration::from_millis(ms);
        }
        if let Some(n) = env_u64("PARLEY_FAILURE_THRESHOLD") {
            self.failure_threshold = n.min(u32::MAX as u64) as u32;
        }
        if std::env::var("PARLEY_MEMORY").is_ok() {
            self.in_memory = true;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.local_user_id.trim().is_empty() {
            return Err(ChatError::Config("user id must not be empty".to_string()));
        }
        if self.retry_base.is_zero() {
            return Err(ChatError::Config("retry base must be positive".to_string()));
        }
        if self.retry_cap < self.retry_base {
            return Err(ChatError::Config(format!(
                "retry cap {:?} is below retry base {:?}",
                self.retry_cap, self.retry_base
            )));
        }
        if self.failure_threshold == 0 {
            return Err(ChatError::Config("failure threshold must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            retry_base: self.retry_base,
            retry_cap: self.retry_cap,
            visible_failure_threshold: self.failure_threshold,
        }
    }

    /// Explicit data dir, or `.parley/<user>`
    pub fn resolved_data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(".parley").join(&self.local_user_id))
    }
}

fn flag_value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str> {
    args.get(i + 1)
        .map(|s| s.as_str())
        .ok_or_else(|| ChatError::Config(format!("{} requires a value", flag)))
}

fn millis(value: &str, flag: &str) -> Result<Duration> {
    value
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| ChatError::Config(format!("{} must be a number of milliseconds", flag)))
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|s| s.parse::<u64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_flags_and_positionals() {
        let (cfg, rest) = Config::from_args(&args(&[
            "parley",
            "--user",
            "ada",
            "send",
            "--retry-base-ms",
            "250",
            "dm:ada:bob",
            "hello",
            "--memory",
        ]))
        .unwrap();
        assert_eq!(cfg.local_user_id, "ada");
        assert_eq!(cfg.retry_base, Duration::from_millis(250));
        assert!(cfg.in_memory);
        assert_eq!(rest, vec!["send", "dm:ada:bob", "hello"]);
        assert_eq!(cfg.resolved_data_dir(), PathBuf::from(".parley/ada"));
    }

    #[test]
    fn test_missing_flag_value_is_config_error() {
        let err = Config::from_args(&args(&["parley", "--data-dir"])).unwrap_err();
        assert!(matches!(err, ChatError::Config(_)));
    }

    #[test]
    fn test_cap_below_base_rejected() {
        let err = Config::from_args(&args(&[
            "parley",
            "--retry-base-ms",
            "5000",
            "--retry-cap-ms",
            "1000",
        ]))
        .unwrap_err();
        assert!(matches!(err, ChatError::Config(_)));
    }

    #[test]
    fn test_sync_config_mirrors_fields() {
        let cfg = Config {
            failure_threshold: 5,
            ..Config::default()
        };
        let sync = cfg.sync_config();
        assert_eq!(sync.visible_failure_threshold, 5);
        assert_eq!(sync.retry_cap, Duration::from_secs(30));
    }
}
