//! Precedence resolution for relay settings.
//!
//! ## Precedence (highest to lowest)
//!
//! 1. CLI flags (passed at runtime)
//! 2. `ARENA_RELAY_*` environment variables
//! 3. relay.kdl (`--config`, `ARENA_RELAY_CONFIG`, or `<config_dir>/arena-relay/relay.kdl`)
//! 4. Built-in defaults

use std::fmt::Display;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use super::schema::{LogFormat, RelayConfig, default_config_path};
use crate::buffer::{self, BufferSettings};
use crate::server::{self, StreamSettings, stream};
use crate::storage::default_database_path;
use crate::{Error, Result};

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "ARENA_RELAY_CONFIG";

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 3040;
pub const DEFAULT_EXECUTION_URL: &str = "ws://127.0.0.1:3050/agents";
pub const DEFAULT_MATCH_TYPE: &str = "ranked";

/// Match type value that disables the buffer's type filter.
pub const ANY_MATCH_TYPE: &str = "any";

/// Tracks where a resolved value came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueSource {
    /// Value from CLI flag
    CliFlag,
    /// Value from environment variable
    EnvVar(String),
    /// Value from a config file
    ConfigFile(PathBuf),
    /// Built-in default value
    Default,
}

impl std::fmt::Display for ValueSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValueSource::CliFlag => write!(f, "cli"),
            ValueSource::EnvVar(name) => write!(f, "env:{}", name),
            ValueSource::ConfigFile(path) => write!(f, "file:{}", path.display()),
            ValueSource::Default => write!(f, "default"),
        }
    }
}

/// A resolved value with its source.
#[derive(Debug, Clone)]
pub struct Resolved<T> {
    /// The resolved value
    pub value: T,
    /// Where the value came from
    pub source: ValueSource,
}

impl<T> Resolved<T> {
    /// Create a new resolved value.
    pub fn new(value: T, source: ValueSource) -> Self {
        Self { value, source }
    }
}

/// CLI overrides for configuration resolution.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database: Option<PathBuf>,
    pub execution_url: Option<String>,
    pub log_format: Option<LogFormat>,
}

/// Fully resolved configuration with source tracking.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Config file that was read, if any
    pub config_path: Option<PathBuf>,
    pub host: Resolved<String>,
    pub port: Resolved<u16>,
    pub database: Resolved<PathBuf>,
    pub execution_url: Resolved<String>,
    pub buffer_capacity: Resolved<usize>,
    pub buffer_poll_ms: Resolved<u64>,
    pub match_type: Resolved<String>,
    pub stream_poll_ms: Resolved<u64>,
    pub heartbeat_ms: Resolved<u64>,
    pub idle_timeout_ms: Resolved<u64>,
    pub replay_ply_ms: Resolved<u64>,
    pub log_format: Resolved<LogFormat>,
}

impl ResolvedConfig {
    /// Buffer tuning from the resolved values.
    pub fn buffer_settings(&self) -> BufferSettings {
        let match_type = &self.match_type.value;
        BufferSettings {
            capacity: self.buffer_capacity.value,
            poll_period: Duration::from_millis(self.buffer_poll_ms.value),
            match_type: (!match_type.eq_ignore_ascii_case(ANY_MATCH_TYPE))
                .then(|| match_type.clone()),
        }
    }

    /// Stream timing from the resolved values.
    pub fn stream_settings(&self) -> StreamSettings {
        StreamSettings {
            poll_interval: Duration::from_millis(self.stream_poll_ms.value),
            heartbeat_interval: Duration::from_millis(self.heartbeat_ms.value),
            idle_timeout: Duration::from_millis(self.idle_timeout_ms.value),
            replay_ply_interval: Duration::from_millis(self.replay_ply_ms.value),
        }
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        server::parse_bind_addr(&self.host.value, self.port.value)
    }

    /// `(key, value, source)` rows in file order, for display.
    pub fn entries(&self) -> Vec<(&'static str, String, &ValueSource)> {
        fn entry<'a, T: Display>(
            key: &'static str,
            r: &'a Resolved<T>,
        ) -> (&'static str, String, &'a ValueSource) {
            (key, r.value.to_string(), &r.source)
        }
        vec![
            entry("host", &self.host),
            entry("port", &self.port),
            ("database", self.database.value.display().to_string(), &self.database.source),
            entry("execution-url", &self.execution_url),
            entry("buffer-capacity", &self.buffer_capacity),
            entry("buffer-poll-ms", &self.buffer_poll_ms),
            entry("match-type", &self.match_type),
            entry("stream-poll-ms", &self.stream_poll_ms),
            entry("heartbeat-ms", &self.heartbeat_ms),
            entry("idle-timeout-ms", &self.idle_timeout_ms),
            entry("replay-ply-ms", &self.replay_ply_ms),
            entry("log-format", &self.log_format),
        ]
    }

    /// The resolved values as a config, e.g. to validate the merged result.
    pub fn to_config(&self) -> RelayConfig {
        RelayConfig {
            host: Some(self.host.value.clone()),
            port: Some(self.port.value),
            database: Some(self.database.value.clone()),
            execution_url: Some(self.execution_url.value.clone()),
            buffer_capacity: Some(self.buffer_capacity.value),
            buffer_poll_ms: Some(self.buffer_poll_ms.value),
            match_type: Some(self.match_type.value.clone()),
            stream_poll_ms: Some(self.stream_poll_ms.value),
            heartbeat_ms: Some(self.heartbeat_ms.value),
            idle_timeout_ms: Some(self.idle_timeout_ms.value),
            replay_ply_ms: Some(self.replay_ply_ms.value),
            log_format: Some(self.log_format.value),
        }
    }
}

/// Lookup for one precedence chain.
struct Layers<'a> {
    env: &'a dyn Fn(&str) -> Option<String>,
    file_source: ValueSource,
}

impl Layers<'_> {
    fn pick<T>(
        &self,
        flag: Option<T>,
        env_key: &str,
        file: Option<T>,
        default: T,
    ) -> Result<Resolved<T>>
    where
        T: FromStr,
        T::Err: Display,
    {
        if let Some(value) = flag {
            return Ok(Resolved::new(value, ValueSource::CliFlag));
        }
        if let Some(raw) = (self.env)(env_key).filter(|v| !v.trim().is_empty()) {
            let value = raw
                .trim()
                .parse::<T>()
                .map_err(|e| Error::Config(format!("{}={:?}: {}", env_key, raw, e)))?;
            return Ok(Resolved::new(value, ValueSource::EnvVar(env_key.to_string())));
        }
        if let Some(value) = file {
            return Ok(Resolved::new(value, self.file_source.clone()));
        }
        Ok(Resolved::new(default, ValueSource::Default))
    }
}

/// Resolve configuration from explicit layers.
///
/// `env` stands in for the process environment so callers (and tests) can
/// control it.
pub fn resolve_config_with(
    overrides: &ConfigOverrides,
    file: &RelayConfig,
    file_path: Option<&Path>,
    env: &dyn Fn(&str) -> Option<String>,
) -> Result<ResolvedConfig> {
    let layers = Layers {
        env,
        file_source: file_path
            .map(|p| ValueSource::ConfigFile(p.to_path_buf()))
            .unwrap_or(ValueSource::Default),
    };
    let default_database =
        default_database_path().unwrap_or_else(|_| PathBuf::from("arena.db"));

    let resolved = ResolvedConfig {
        config_path: file_path.map(Path::to_path_buf),
        host: layers.pick(
            overrides.host.clone(),
            "ARENA_RELAY_HOST",
            file.host.clone(),
            DEFAULT_HOST.to_string(),
        )?,
        port: layers.pick(overrides.port, "ARENA_RELAY_PORT", file.port, DEFAULT_PORT)?,
        database: layers.pick(
            overrides.database.clone(),
            "ARENA_RELAY_DATABASE",
            file.database.clone(),
            default_database,
        )?,
        execution_url: layers.pick(
            overrides.execution_url.clone(),
            "ARENA_RELAY_EXECUTION_URL",
            file.execution_url.clone(),
            DEFAULT_EXECUTION_URL.to_string(),
        )?,
        buffer_capacity: layers.pick(
            None,
            "ARENA_RELAY_BUFFER_CAPACITY",
            file.buffer_capacity,
            buffer::DEFAULT_CAPACITY,
        )?,
        buffer_poll_ms: layers.pick(
            None,
            "ARENA_RELAY_BUFFER_POLL_MS",
            file.buffer_poll_ms,
            buffer::DEFAULT_POLL_PERIOD.as_millis() as u64,
        )?,
        match_type: layers.pick(
            None,
            "ARENA_RELAY_MATCH_TYPE",
            file.match_type.clone(),
            DEFAULT_MATCH_TYPE.to_string(),
        )?,
        stream_poll_ms: layers.pick(
            None,
            "ARENA_RELAY_STREAM_POLL_MS",
            file.stream_poll_ms,
            stream::DEFAULT_POLL_INTERVAL.as_millis() as u64,
        )?,
        heartbeat_ms: layers.pick(
            None,
            "ARENA_RELAY_HEARTBEAT_MS",
            file.heartbeat_ms,
            stream::DEFAULT_HEARTBEAT_INTERVAL.as_millis() as u64,
        )?,
        idle_timeout_ms: layers.pick(
            None,
            "ARENA_RELAY_IDLE_TIMEOUT_MS",
            file.idle_timeout_ms,
            stream::DEFAULT_IDLE_TIMEOUT.as_millis() as u64,
        )?,
        replay_ply_ms: layers.pick(
            None,
            "ARENA_RELAY_REPLAY_PLY_MS",
            file.replay_ply_ms,
            stream::DEFAULT_REPLAY_PLY_INTERVAL.as_millis() as u64,
        )?,
        log_format: layers.pick(
            overrides.log_format,
            "ARENA_RELAY_LOG_FORMAT",
            file.log_format,
            LogFormat::default(),
        )?,
    };

    resolved.to_config().validate().map_err(Error::Config)?;
    Ok(resolved)
}

/// Resolve configuration against the process environment.
///
/// An explicit `config_path` must exist; the default location is optional.
pub fn resolve_config(
    overrides: &ConfigOverrides,
    config_path: Option<&Path>,
) -> Result<ResolvedConfig> {
    let env = |key: &str| std::env::var(key).ok();

    let (file, file_path) = match config_path {
        Some(path) => {
            if !path.exists() {
                return Err(Error::Config(format!("config file not found: {}", path.display())));
            }
            (RelayConfig::load(path)?, Some(path.to_path_buf()))
        }
        None => match default_config_path().filter(|p| p.exists()) {
            Some(path) => (RelayConfig::load(&path)?, Some(path)),
            None => (RelayConfig::default(), None),
        },
    };

    resolve_config_with(overrides, &file, file_path.as_deref(), &env)
}
