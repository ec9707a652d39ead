/// Configuration management
use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_EVENT_BUFFER: usize = 256;

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Push channel address
    pub push_addr: SocketAddr,

    /// Base URL of the REST history service (no trailing slash)
    pub rest_base_url: String,

    /// Push channel connect + authenticate timeout
    pub connection_timeout: Duration,

    /// Every REST call is aborted after this long
    pub request_timeout: Duration,

    /// Inactivity after the last keystroke before `stop_typing` is emitted
    pub typing_stop_delay: Duration,

    /// How long the operator's "auto-selected" notice stays up
    pub auto_select_notice: Duration,

    /// Tolerance when matching an operator echo against a pending placeholder
    pub echo_window: Duration,

    /// A placeholder without an echo after this long is marked failed
    pub echo_timeout: Duration,

    /// Roster search filter debounce
    pub search_debounce: Duration,

    /// Optional directory for the local conversation cache (disabled when unset)
    pub cache_dir: Option<PathBuf>,

    /// Capacity of the channel event broadcast
    pub event_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            push_addr: SocketAddr::from(([127, 0, 0, 1], 7070)),
            rest_base_url: "http://127.0.0.1:7071".to_string(),
            connection_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(15),
            typing_stop_delay: Duration::from_millis(2000),
            auto_select_notice: Duration::from_millis(3000),
            echo_window: Duration::from_secs(5),
            echo_timeout: Duration::from_secs(10),
            search_debounce: Duration::from_millis(300),
            cache_dir: None,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

impl Config {
    /// Create config from command line arguments
    ///
    /// `args[1]` is the push address, `args[2]` the REST base URL. Identity and
    /// view flags are ignored here and picked up by the console.
    pub fn from_args(args: &[String]) -> Result<Self> {
        if args.len() < 3 {
            return Err(SyncError::Config(format!(
                "Usage: {} <push-addr> <rest-url> --token <t> --user <id> [--name <n>] [--operator] [--order <id>] [--cache-dir <path>] [--request-timeout-ms <ms>]",
                args.first().map(String::as_str).unwrap_or("storelink")
            )));
        }

        let push_addr = args[1]
            .parse::<SocketAddr>()
            .map_err(|_| SyncError::Config(format!("Invalid push address: {}", args[1])))?;

        let rest_base_url = normalize_base_url(&args[2])?;

        let mut cache_dir: Option<PathBuf> = None;
        let mut request_timeout: Option<Duration> = None;

        let mut i = 3;
        while i < args.len() {
            match args[i].as_str() {
                "--cache-dir" => {
                    let path = args.get(i + 1).ok_or_else(|| {
                        SyncError::Config("--cache-dir requires a path argument".to_string())
                    })?;
                    cache_dir = Some(PathBuf::from(path));
                    i += 2;
                }
                "--request-timeout-ms" => {
                    let ms = args.get(i + 1).ok_or_else(|| {
                        SyncError::Config("--request-timeout-ms requires a value".to_string())
                    })?;
                    request_timeout = Some(Duration::from_millis(ms.parse::<u64>().map_err(
                        |_| SyncError::Config("--request-timeout-ms must be a number".to_string()),
                    )?));
                    i += 2;
                }
                // flags with a value that belong to the console
                "--token" | "--user" | "--name" | "--order" => i += 2,
                _ => i += 1,
            }
        }

        // Env overrides (nice for scripts)
        if let Ok(dir) = std::env::var("STORELINK_CACHE_DIR") {
            cache_dir = Some(PathBuf::from(dir));
        }
        if let Some(ms) = std::env::var("STORELINK_REQUEST_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            request_timeout = Some(Duration::from_millis(ms));
        }

        let defaults = Self::default();
        Ok(Self {
            push_addr,
            rest_base_url,
            cache_dir,
            request_timeout: request_timeout.unwrap_or(defaults.request_timeout),
            ..defaults
        })
    }
}

fn normalize_base_url(raw: &str) -> Result<String> {
    let trimmed = raw.trim_end_matches('/');
    if !trimmed.starts_with("http://") {
        return Err(SyncError::Config(format!(
            "REST URL must start with http:// (got {})",
            raw
        )));
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_from_args_parses_addresses_and_flags() {
        let config = Config::from_args(&args(&[
            "storelink",
            "127.0.0.1:9000",
            "http://localhost:9001/",
            "--token",
            "abc",
            "--cache-dir",
            "/tmp/cache",
            "--request-timeout-ms",
            "2500",
        ]))
        .unwrap();

        assert_eq!(config.push_addr.port(), 9000);
        assert_eq!(config.rest_base_url, "http://localhost:9001");
        assert_eq!(config.cache_dir, Some(PathBuf::from("/tmp/cache")));
        assert_eq!(config.request_timeout, Duration::from_millis(2500));
        assert_eq!(config.typing_stop_delay, Duration::from_millis(2000));
    }

    #[test]
    fn test_from_args_rejects_missing_arguments() {
        assert!(Config::from_args(&args(&["storelink"])).is_err());
        assert!(Config::from_args(&args(&["storelink", "nope", "http://x"])).is_err());
        assert!(Config::from_args(&args(&["storelink", "127.0.0.1:1", "ftp://x"])).is_err());
    }
}
