use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use clap::builder::BoolishValueParser;
use serde::Deserialize;

use buildlog_listener::RouterConfig;
use buildlog_sinks::{FirebaseSinkConfig, RedisSinkConfig, SinkKind, SinkSettings};
use buildlog_types::megabytes_to_bytes;

/// Sink used when none is configured
const DEFAULT_LOGGER_IMPL: &str = "firebase";

/// Where the routing state is written by default
const DEFAULT_STATE_FILE: &str = "./state.json";

const DEFAULT_LOG_LEVEL: &str = "info";

const DEFAULT_REDIS_DB: i64 = 1;

/// buildlog - captures build container output into a durable log sink
#[derive(Parser, Debug, Default)]
#[command(name = "buildlog")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// TOML settings file; flags and environment take precedence over it
    #[arg(long, value_name = "PATH", env = "BUILDLOG_CONFIG")]
    pub config: Option<PathBuf>,

    /// Identifier of this logger, matched against container labels
    #[arg(long, env = "LOGGER_ID")]
    pub logger_id: Option<String>,

    /// Comma separated sinks to write to (firebase, redis)
    #[arg(long, env = "LOGGER_IMPL")]
    pub logger_impl: Option<String>,

    /// Firebase database URL
    #[arg(long, env = "FIREBASE_AUTH_URL")]
    pub firebase_auth_url: Option<String>,

    /// Firebase database secret
    #[arg(long, env = "FIREBASE_SECRET", hide_env_values = true)]
    pub firebase_secret: Option<String>,

    /// Firebase location for metrics of containers without a metrics label
    #[arg(long, env = "FIREBASE_METRICS_LOGS_URL")]
    pub firebase_metrics_logs_url: Option<String>,

    /// Redis host or URL
    #[arg(long, env = "REDIS_URL")]
    pub redis_url: Option<String>,

    #[arg(long, env = "REDIS_PASSWORD", hide_env_values = true)]
    pub redis_password: Option<String>,

    /// Redis database index [default: 1]
    #[arg(long, env = "REDIS_DB")]
    pub redis_db: Option<i64>,

    /// Capture containers that are already running at startup
    #[arg(long, env = "LISTEN_ON_EXISTING", value_parser = BoolishValueParser::new())]
    pub listen_on_existing: Option<bool>,

    /// Global log size limit in megabytes
    #[arg(long, env = "LOG_SIZE_LIMIT")]
    pub log_size_limit: Option<u64>,

    /// Docker daemon socket
    #[arg(long, env = "DOCKER_SOCKET")]
    pub docker_socket: Option<PathBuf>,

    /// Routing state snapshot [default: ./state.json]
    #[arg(long, env = "STATE_FILE")]
    pub state_file: Option<PathBuf>,

    /// Log filter, e.g. `info` or `buildlog_logs=debug` [default: info]
    #[arg(long)]
    pub log_level: Option<String>,
}

/// Settings as read from the TOML file, or from the command line
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub logger_id: Option<String>,
    pub logger_impl: Option<String>,
    pub firebase_auth_url: Option<String>,
    pub firebase_secret: Option<String>,
    pub firebase_metrics_logs_url: Option<String>,
    pub redis_url: Option<String>,
    pub redis_password: Option<String>,
    pub redis_db: Option<i64>,
    pub listen_on_existing: Option<bool>,
    pub log_size_limit: Option<u64>,
    pub docker_socket: Option<PathBuf>,
    pub state_file: Option<PathBuf>,
    pub log_level: Option<String>,
}

/// Fully resolved daemon configuration
#[derive(Clone, Debug)]
pub struct Config {
    pub sinks: SinkSettings,
    pub router: RouterConfig,
    pub docker_socket: Option<PathBuf>,
}

impl Args {
    /// Settings given on the command line or through the environment
    fn settings(&self) -> Settings {
        Settings {
            logger_id: self.logger_id.clone(),
            logger_impl: self.logger_impl.clone(),
            firebase_auth_url: self.firebase_auth_url.clone(),
            firebase_secret: self.firebase_secret.clone(),
            firebase_metrics_logs_url: self.firebase_metrics_logs_url.clone(),
            redis_url: self.redis_url.clone(),
            redis_password: self.redis_password.clone(),
            redis_db: self.redis_db,
            listen_on_existing: self.listen_on_existing,
            log_size_limit: self.log_size_limit,
            docker_socket: self.docker_socket.clone(),
            state_file: self.state_file.clone(),
            log_level: self.log_level.clone(),
        }
    }

    /// Combine the settings file, if any, with flags and environment
    pub fn load_settings(&self) -> Result<Settings> {
        let file = match &self.config {
            Some(path) => Settings::load(path)?,
            None => Settings::default(),
        };
        Ok(file.merge(self.settings()))
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file {}", path.display()))?;
        toml::from_str(&text)
            .with_context(|| format!("failed to parse settings file {}", path.display()))
    }

    /// Overlay `overrides` on top of these settings
    pub fn merge(self, overrides: Settings) -> Self {
        Self {
            logger_id: overrides.logger_id.or(self.logger_id),
            logger_impl: overrides.logger_impl.or(self.logger_impl),
            firebase_auth_url: overrides.firebase_auth_url.or(self.firebase_auth_url),
            firebase_secret: overrides.firebase_secret.or(self.firebase_secret),
            firebase_metrics_logs_url: overrides
                .firebase_metrics_logs_url
                .or(self.firebase_metrics_logs_url),
            redis_url: overrides.redis_url.or(self.redis_url),
            redis_password: overrides.redis_password.or(self.redis_password),
            redis_db: overrides.redis_db.or(self.redis_db),
            listen_on_existing: overrides.listen_on_existing.or(self.listen_on_existing),
            log_size_limit: overrides.log_size_limit.or(self.log_size_limit),
            docker_socket: overrides.docker_socket.or(self.docker_socket),
            state_file: overrides.state_file.or(self.state_file),
            log_level: overrides.log_level.or(self.log_level),
        }
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or(DEFAULT_LOG_LEVEL)
    }

    /// Apply defaults and unit conversions
    pub fn resolve(self) -> Result<Config> {
        let kinds = SinkKind::parse_list(
            self.logger_impl
                .as_deref()
                .unwrap_or(DEFAULT_LOGGER_IMPL),
        )
        .context("invalid LOGGER_IMPL")?;

        Ok(Config {
            sinks: SinkSettings {
                kinds,
                firebase: FirebaseSinkConfig {
                    base_url: self.firebase_auth_url,
                    secret: self.firebase_secret,
                    metrics_logs_url: self.firebase_metrics_logs_url,
                    ..Default::default()
                },
                redis: RedisSinkConfig {
                    url: self.redis_url,
                    password: self.redis_password,
                    db: self.redis_db.unwrap_or(DEFAULT_REDIS_DB),
                },
            },
            router: RouterConfig {
                logger_id: self.logger_id,
                listen_on_existing: self.listen_on_existing.unwrap_or(false),
                log_size_limit: self.log_size_limit.map(megabytes_to_bytes),
                state_file: Some(
                    self.state_file
                        .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_FILE)),
                ),
                resubscribe_delay: Duration::from_secs(5),
            },
            docker_socket: self.docker_socket,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Settings::default().resolve().unwrap();

        assert_eq!(config.sinks.kinds, vec![SinkKind::Firebase]);
        assert_eq!(config.sinks.redis.db, 1);
        assert_eq!(config.router.log_size_limit, None);
        assert!(!config.router.listen_on_existing);
        assert_eq!(
            config.router.state_file,
            Some(PathBuf::from("./state.json"))
        );
        assert_eq!(Settings::default().log_level(), "info");
    }

    #[test]
    fn test_log_size_limit_in_megabytes() {
        let config = Settings {
            log_size_limit: Some(20),
            ..Default::default()
        }
        .resolve()
        .unwrap();
        assert_eq!(config.router.log_size_limit, Some(20_000_000));
    }

    #[test]
    fn test_unknown_sink_kind() {
        let result = Settings {
            logger_impl: Some("firebase,kafka".into()),
            ..Default::default()
        }
        .resolve();
        assert!(result.is_err());
    }

    #[test]
    fn test_args_override_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
logger_id = "from-file"
logger_impl = "redis"
redis_url = "redis.local"
log_size_limit = 5
"#
        )
        .unwrap();

        let args = Args::parse_from([
            "buildlog",
            "--config",
            file.path().to_str().unwrap(),
            "--logger-id",
            "from-flag",
            "--listen-on-existing",
            "yes",
        ]);
        let settings = args.load_settings().unwrap();

        assert_eq!(settings.logger_id.as_deref(), Some("from-flag"));
        assert_eq!(settings.logger_impl.as_deref(), Some("redis"));
        assert_eq!(settings.listen_on_existing, Some(true));

        let config = settings.resolve().unwrap();
        assert_eq!(config.sinks.kinds, vec![SinkKind::Redis]);
        assert_eq!(config.sinks.redis.url.as_deref(), Some("redis.local"));
        assert_eq!(config.router.log_size_limit, Some(5_000_000));
    }

    #[test]
    fn test_unknown_file_key_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "loger_id = \"typo\"").unwrap();
        assert!(Settings::load(file.path()).is_err());
    }
}
