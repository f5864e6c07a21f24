//! KDL schema for relay.kdl.
//!
//! This module provides:
//! - The `RelayConfig` struct mirroring the file
//! - Conversion to and from KDL documents
//! - Validation of value ranges

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use kdl::{KdlDocument, KdlEntry, KdlNode, KdlValue};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines (default)
    #[default]
    Human,
    /// One JSON object per event
    Json,
}

impl LogFormat {
    /// Parse from string, case-insensitive.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "json" => Some(LogFormat::Json),
            "human" => Some(LogFormat::Human),
            _ => None,
        }
    }

    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogFormat::Json => "json",
            LogFormat::Human => "human",
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("expected \"json\" or \"human\", got \"{}\"", s))
    }
}

/// Relay settings stored in relay.kdl.
///
/// Every field is optional; unset fields fall through to environment
/// variables and built-in defaults during resolution.
///
/// # KDL Schema
///
/// ```kdl
/// host "0.0.0.0"
/// port 3040
/// database "/var/lib/arena/arena.db"
/// execution-url "ws://10.0.0.5:3050/agents"
/// buffer-capacity 8
/// buffer-poll-ms 5000
/// match-type "ranked"   // or "any"
/// stream-poll-ms 500
/// heartbeat-ms 15000
/// idle-timeout-ms 60000
/// replay-ply-ms 1000
/// log-format "json"     // or "human"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Path to the pipeline's SQLite database
    pub database: Option<PathBuf>,
    /// WebSocket URL of the internal execution service
    pub execution_url: Option<String>,
    pub buffer_capacity: Option<usize>,
    pub buffer_poll_ms: Option<u64>,
    /// Match type to buffer; "any" disables the filter
    pub match_type: Option<String>,
    pub stream_poll_ms: Option<u64>,
    pub heartbeat_ms: Option<u64>,
    pub idle_timeout_ms: Option<u64>,
    pub replay_ply_ms: Option<u64>,
    pub log_format: Option<LogFormat>,
}

fn string_entry(doc: &KdlDocument, key: &str) -> Option<String> {
    doc.get(key)?
        .entries()
        .first()?
        .value()
        .as_string()
        .map(str::to_string)
}

fn integer_entry<T: TryFrom<i128>>(doc: &KdlDocument, key: &str) -> Option<T> {
    let raw = doc.get(key)?.entries().first()?.value().as_integer()?;
    match T::try_from(raw) {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "config value out of range, ignoring");
            None
        }
    }
}

fn push_string(doc: &mut KdlDocument, key: &str, value: &str) {
    let mut node = KdlNode::new(key);
    node.push(KdlEntry::new(KdlValue::String(value.to_string())));
    doc.nodes_mut().push(node);
}

fn push_integer(doc: &mut KdlDocument, key: &str, value: i128) {
    let mut node = KdlNode::new(key);
    node.push(KdlEntry::new(KdlValue::Integer(value)));
    doc.nodes_mut().push(node);
}

impl RelayConfig {
    /// Create an empty config with no values set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the config values.
    ///
    /// Returns an error message naming the first invalid key.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.buffer_capacity == Some(0) {
            return Err("buffer-capacity must be at least 1".to_string());
        }
        for (key, value) in [
            ("buffer-poll-ms", self.buffer_poll_ms),
            ("stream-poll-ms", self.stream_poll_ms),
            ("heartbeat-ms", self.heartbeat_ms),
            ("idle-timeout-ms", self.idle_timeout_ms),
            ("replay-ply-ms", self.replay_ply_ms),
        ] {
            if value == Some(0) {
                return Err(format!("{} must be greater than 0", key));
            }
        }
        if let Some(ref url) = self.execution_url {
            if !(url.starts_with("ws://") || url.starts_with("wss://")) {
                return Err(format!("execution-url must be a ws:// or wss:// URL, got {}", url));
            }
        }
        if let Some(ref match_type) = self.match_type {
            if match_type.trim().is_empty() {
                return Err(
                    "match-type must not be empty (use \"any\" to disable the filter)".to_string()
                );
            }
        }
        Ok(())
    }

    /// Parse config from a KDL document.
    ///
    /// Unknown nodes are ignored, as are values of the wrong type.
    pub fn from_kdl(doc: &KdlDocument) -> Self {
        Self {
            host: string_entry(doc, "host"),
            port: integer_entry(doc, "port"),
            database: string_entry(doc, "database").map(PathBuf::from),
            execution_url: string_entry(doc, "execution-url"),
            buffer_capacity: integer_entry(doc, "buffer-capacity"),
            buffer_poll_ms: integer_entry(doc, "buffer-poll-ms"),
            match_type: string_entry(doc, "match-type"),
            stream_poll_ms: integer_entry(doc, "stream-poll-ms"),
            heartbeat_ms: integer_entry(doc, "heartbeat-ms"),
            idle_timeout_ms: integer_entry(doc, "idle-timeout-ms"),
            replay_ply_ms: integer_entry(doc, "replay-ply-ms"),
            log_format: string_entry(doc, "log-format").and_then(|s| LogFormat::parse(&s)),
        }
    }

    /// Convert config to a KDL document.
    pub fn to_kdl(&self) -> KdlDocument {
        let mut doc = KdlDocument::new();

        if let Some(ref host) = self.host {
            push_string(&mut doc, "host", host);
        }
        if let Some(port) = self.port {
            push_integer(&mut doc, "port", port as i128);
        }
        if let Some(ref database) = self.database {
            push_string(&mut doc, "database", &database.to_string_lossy());
        }
        if let Some(ref url) = self.execution_url {
            push_string(&mut doc, "execution-url", url);
        }
        if let Some(capacity) = self.buffer_capacity {
            push_integer(&mut doc, "buffer-capacity", capacity as i128);
        }
        if let Some(ms) = self.buffer_poll_ms {
            push_integer(&mut doc, "buffer-poll-ms", ms as i128);
        }
        if let Some(ref match_type) = self.match_type {
            push_string(&mut doc, "match-type", match_type);
        }
        for (key, value) in [
            ("stream-poll-ms", self.stream_poll_ms),
            ("heartbeat-ms", self.heartbeat_ms),
            ("idle-timeout-ms", self.idle_timeout_ms),
            ("replay-ply-ms", self.replay_ply_ms),
        ] {
            if let Some(ms) = value {
                push_integer(&mut doc, key, ms as i128);
            }
        }
        if let Some(format) = self.log_format {
            push_string(&mut doc, "log-format", format.as_str());
        }

        doc
    }

    /// Read and validate a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let doc: KdlDocument = content
            .parse()
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        let config = Self::from_kdl(&doc);
        config
            .validate()
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Ok(config)
    }

    /// Write the config as KDL, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_kdl().to_string())?;
        Ok(())
    }
}

/// Default config location: `<config_dir>/arena-relay/relay.kdl`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("arena-relay").join("relay.kdl"))
}
