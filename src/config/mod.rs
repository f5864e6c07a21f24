//! Configuration for the relay.
//!
//! ## relay.kdl
//!
//! Located at (first match wins):
//! - `--config <path>` or `ARENA_RELAY_CONFIG`
//! - `~/.config/arena-relay/relay.kdl`
//!
//! Contains server, buffer and stream tuning (see [`schema::RelayConfig`]).
//!
//! ## Precedence
//!
//! CLI flag > `ARENA_RELAY_*` env var > relay.kdl > defaults
//!
//! Use the [`resolver`] module for precedence resolution; every resolved value
//! records its [`ValueSource`].

pub mod resolver;
pub mod schema;

pub use resolver::{
    CONFIG_ENV, ConfigOverrides, Resolved, ResolvedConfig, ValueSource, resolve_config,
    resolve_config_with,
};
pub use schema::{LogFormat, RelayConfig, default_config_path};
