//! CLI argument definitions for arena-relay.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// arena-relay - Live match streaming and agent bridging for the chess arena.
///
/// Run `arena-relay serve` next to the execution pipeline, then point
/// spectators at it (or try `arena-relay watch`).
#[derive(Parser, Debug)]
#[command(name = "arena-relay")]
#[command(long_version = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("ARENA_RELAY_GIT_COMMIT"),
    ", built ",
    env!("ARENA_RELAY_BUILD_TIMESTAMP"),
    ")"
))]
#[command(
    author,
    version,
    about = "Live match streaming and agent bridging for the chess arena",
    long_about = None
)]
pub struct Cli {
    /// Path to relay.kdl (default: ~/.config/arena-relay/relay.kdl)
    #[arg(long, global = true, env = "ARENA_RELAY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log format: "human" or "json"
    #[arg(long, global = true)]
    pub log_format: Option<String>,

    /// Append logs to this file instead of stderr
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the relay server (spectator streams and agent bridge)
    Serve {
        /// Host address to bind to (use 0.0.0.0 for network access)
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on (default: 3040)
        #[arg(short, long)]
        port: Option<u16>,

        /// Path to the match database
        #[arg(long)]
        database: Option<PathBuf>,

        /// WebSocket URL of the internal execution service
        #[arg(long)]
        execution_url: Option<String>,
    },

    /// Follow matches from a running relay in the terminal
    #[cfg(feature = "spectator")]
    Watch {
        /// Relay base URL
        #[arg(long, env = "ARENA_RELAY_SERVER", default_value = "http://127.0.0.1:3040")]
        server: String,

        /// Playback speed multiplier
        #[arg(long, default_value_t = 1.0)]
        speed: f64,

        /// Picker index of the first match to watch
        #[arg(long, default_value_t = 0)]
        index: usize,
    },

    /// Configuration commands
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Show every resolved setting and where it came from
    Show,

    /// Print the config file path that would be read
    Path,

    /// Write the current settings to the config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}
