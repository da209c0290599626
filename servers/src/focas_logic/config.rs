use clap::Parser;
use lib_gateway::core::{BackoffPolicy, GatewaySettings, LinkSettings, PollProfile};
use lib_gateway::loggers::LogSettings;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "FANUC FOCAS data acquisition gateway", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "APP_PORT", help = "Port of the HTTP session API.")]
    pub port: Option<u16>,

    #[clap(long, env = "FOCAS_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "LOGGER_LOGS_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "LOGGER_LOG_LEVEL", help = "Logging level or filter directive (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "LOGGER_SAVING_DAYS", help = "Days log files are kept.")]
    pub log_saving_days: Option<u64>,

    #[clap(long, env = "DATABASE_URL", help = "PostgreSQL URL for session storage. In-memory storage when unset.")]
    pub database_url: Option<String>,

    #[clap(long, env = "REDIS_URL", help = "Redis URL for snapshot publishing. Log-only sink when unset.")]
    pub redis_url: Option<String>,

    #[clap(long, env = "FOCAS_STREAM_KEY", help = "Redis stream receiving snapshots.")]
    pub stream_key: Option<String>,

    #[clap(long, env = "FOCAS_LOG_PATH", help = "Log file of the FOCAS library.")]
    pub driver_log_path: Option<String>,

    #[clap(long, env = "FOCAS_PROBE_TIMEOUT_MS", help = "Timeout of the connectivity probe in milliseconds.")]
    pub probe_timeout_ms: Option<u64>,

    #[clap(long, env = "FOCAS_POLL_TIMEOUT_MS", help = "Connect timeout of each poll tick in milliseconds.")]
    pub poll_connect_timeout_ms: Option<u64>,

    #[clap(long, env = "FOCAS_RECONNECT_MIN_MS", help = "First delay between reconnect attempts in milliseconds.")]
    pub reconnect_min_delay_ms: Option<u64>,

    #[clap(long, env = "FOCAS_RECONNECT_MAX_MS", help = "Largest delay between reconnect attempts in milliseconds.")]
    pub reconnect_max_delay_ms: Option<u64>,

    #[clap(long, env = "FOCAS_STABILIZE_MS", help = "Pause between dropping a broken handle and reconnecting, in milliseconds.")]
    pub stabilization_delay_ms: Option<u64>,

    #[clap(long, env = "FOCAS_POLL_PROFILE", help = "Payload of each poll tick: full or status.")]
    pub poll_profile: Option<String>,

    #[clap(long, env = "FOCAS_SIMULATED", value_delimiter = ',', help = "Endpoints served by the built-in controller simulator.")]
    pub simulated_machines: Option<Vec<String>>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            log_saving_days: other.log_saving_days.or(self.log_saving_days),
            database_url: other.database_url.or(self.database_url),
            redis_url: other.redis_url.or(self.redis_url),
            stream_key: other.stream_key.or(self.stream_key),
            driver_log_path: other.driver_log_path.or(self.driver_log_path),
            probe_timeout_ms: other.probe_timeout_ms.or(self.probe_timeout_ms),
            poll_connect_timeout_ms: other.poll_connect_timeout_ms.or(self.poll_connect_timeout_ms),
            reconnect_min_delay_ms: other.reconnect_min_delay_ms.or(self.reconnect_min_delay_ms),
            reconnect_max_delay_ms: other.reconnect_max_delay_ms.or(self.reconnect_max_delay_ms),
            stabilization_delay_ms: other.stabilization_delay_ms.or(self.stabilization_delay_ms),
            poll_profile: other.poll_profile.or(self.poll_profile),
            simulated_machines: other.simulated_machines.or(self.simulated_machines),
        }
    }

    fn defaults() -> Config {
        Config {
            port: Some(8082),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            log_saving_days: Some(7),
            stream_key: Some("fanuc_data".to_string()),
            driver_log_path: Some("./focas2.log".to_string()),
            probe_timeout_ms: Some(2000),
            poll_connect_timeout_ms: Some(5000),
            reconnect_min_delay_ms: Some(1000),
            reconnect_max_delay_ms: Some(30000),
            stabilization_delay_ms: Some(200),
            poll_profile: Some("full".to_string()),
            ..Default::default()
        }
    }

    pub fn gateway_settings(&self) -> anyhow::Result<GatewaySettings> {
        let defaults = GatewaySettings::default();
        let ms = |v: Option<u64>, fallback: Duration| v.map(Duration::from_millis).unwrap_or(fallback);
        let backoff = BackoffPolicy {
            min_delay: ms(self.reconnect_min_delay_ms, defaults.link.backoff.min_delay),
            max_delay: ms(self.reconnect_max_delay_ms, defaults.link.backoff.max_delay),
            ..defaults.link.backoff
        };
        let poll_profile = match &self.poll_profile {
            Some(p) => p.parse::<PollProfile>()?,
            None => PollProfile::default(),
        };
        Ok(GatewaySettings {
            probe_timeout: ms(self.probe_timeout_ms, defaults.probe_timeout),
            poll_connect_timeout: ms(self.poll_connect_timeout_ms, defaults.poll_connect_timeout),
            link: LinkSettings {
                stabilization_delay: ms(self.stabilization_delay_ms, defaults.link.stabilization_delay),
                backoff,
                ..defaults.link
            },
            poll_profile,
            ..defaults
        })
    }

    pub fn log_settings(&self) -> LogSettings {
        LogSettings {
            app_name: "server_focas".to_string(),
            log_dir: self.log_dir.clone(),
            level: self.log_level.clone().unwrap_or_else(|| "info".to_string()),
            saving_days: self.log_saving_days.unwrap_or(7),
        }
    }
}

/// Reads a JSON config file. `None` when the file is missing or unusable.
fn read_config_file(path: &Path) -> Option<Config> {
    if !path.exists() {
        eprintln!("Config file not found at {}. Using defaults and environment/CLI variables.", path.display());
        return None;
    }
    match fs::read_to_string(path) {
        Ok(config_str) => match serde_json::from_str::<Config>(&config_str) {
            Ok(file_config) => Some(file_config),
            Err(e) => {
                eprintln!("Failed to parse config file {}: {e}. Falling back to other sources.", path.display());
                None
            }
        },
        Err(e) => {
            eprintln!("Failed to read config file {}: {e}. Falling back to other sources.", path.display());
            None
        }
    }
}

/// Layers defaults, the JSON file, then environment variables and CLI
/// arguments, later sources winning field by field.
pub fn load_config() -> Config {
    // 1. Load defaults
    let default_config = Config::defaults();

    // 2. Parse CLI and env once; they also decide where the file lives.
    let cli_args = Config::parse();
    let config_file_path = cli_args
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("server_focas.conf"));

    // 3. Merge the file, then CLI/env over it.
    let mut current_config = default_config;
    if let Some(file_config) = read_config_file(&config_file_path) {
        current_config = current_config.merge(file_config);
    }
    current_config.merge(cli_args)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_sources_override_earlier_ones() {
        let file = Config {
            port: Some(9000),
            stream_key: Some("line_a".to_string()),
            ..Default::default()
        };
        let cli = Config {
            port: Some(9100),
            ..Default::default()
        };
        let merged = Config::defaults().merge(file).merge(cli);
        assert_eq!(merged.port, Some(9100));
        assert_eq!(merged.stream_key.as_deref(), Some("line_a"));
        assert_eq!(merged.probe_timeout_ms, Some(2000));
    }

    #[test]
    fn config_file_uses_camel_case_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server_focas.conf");
        fs::write(&path, r#"{"pollProfile":"status","reconnectMaxDelayMs":5000}"#).unwrap();

        let config = Config::defaults().merge(read_config_file(&path).unwrap());
        let settings = config.gateway_settings().unwrap();
        assert_eq!(settings.poll_profile, PollProfile::Status);
        assert_eq!(settings.link.backoff.max_delay, Duration::from_millis(5000));
        assert_eq!(settings.probe_timeout, Duration::from_millis(2000));
    }

    #[test]
    fn unknown_poll_profile_is_rejected() {
        let config = Config {
            poll_profile: Some("everything".to_string()),
            ..Config::defaults()
        };
        assert!(config.gateway_settings().is_err());
    }
}
