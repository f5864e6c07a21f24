//! arena-relay CLI - live match streaming and agent bridging.

use std::path::{Path, PathBuf};
use std::process;

use arena_relay::cli::{Cli, Commands, ConfigCommands};
use arena_relay::config::{
    self, ConfigOverrides, LogFormat, RelayConfig, ResolvedConfig, default_config_path,
};
use arena_relay::{Error, Result, server};
use clap::Parser;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

/// Environment variable holding the log filter (`info`, `arena_relay=debug`, ...).
const LOG_ENV: &str = "ARENA_RELAY_LOG";

fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let log_format = cli
        .log_format
        .as_deref()
        .map(|raw| {
            raw.parse::<LogFormat>()
                .map_err(|e| Error::Config(format!("--log-format: {}", e)))
        })
        .transpose()?;

    let mut overrides = ConfigOverrides {
        log_format,
        ..Default::default()
    };
    if let Commands::Serve {
        host,
        port,
        database,
        execution_url,
    } = &cli.command
    {
        overrides.host = host.clone();
        overrides.port = *port;
        overrides.database = database.clone();
        overrides.execution_url = execution_url.clone();
    }

    // `config path` must work even when the file does not parse.
    if let Commands::Config {
        command: ConfigCommands::Path,
    } = &cli.command
    {
        return config_path(cli.config.as_deref());
    }

    // `config init` may target a file that does not exist yet.
    let read_from = match &cli.command {
        Commands::Config {
            command: ConfigCommands::Init { .. },
        } => cli.config.as_deref().filter(|p| p.exists()),
        _ => cli.config.as_deref(),
    };
    let resolved = config::resolve_config(&overrides, read_from)?;
    let _log_guard = init_logging(resolved.log_format.value, cli.log_file.as_deref())?;

    match cli.command {
        Commands::Serve { .. } => block_on(server::start_server(&resolved)),
        #[cfg(feature = "spectator")]
        Commands::Watch {
            server,
            speed,
            index,
        } => block_on(watch(server, speed, index)),
        Commands::Config { command } => match command {
            ConfigCommands::Show => {
                show_config(&resolved);
                Ok(())
            }
            ConfigCommands::Path => config_path(cli.config.as_deref()),
            ConfigCommands::Init { force } => init_config(&resolved, cli.config, force),
        },
    }
}

/// Run `future` on a fresh multi-threaded runtime.
fn block_on<F>(future: F) -> Result<()>
where
    F: std::future::Future<Output = Result<()>>,
{
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::Other(format!("Failed to create runtime: {}", e)))?
        .block_on(future)
}

/// Install the global subscriber. The returned guard flushes file output on drop.
fn init_logging(format: LogFormat, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var(LOG_ENV)
        .from_env_lossy();

    let (writer, guard) = match log_file {
        Some(path) => {
            let name = path.file_name().ok_or_else(|| {
                Error::Config(format!("--log-file is not a file: {}", path.display()))
            })?;
            let dir = match path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
                _ => PathBuf::from("."),
            };
            std::fs::create_dir_all(&dir)?;
            let (non_blocking, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(&dir, name));
            (BoxMakeWriter::new(non_blocking), Some(guard))
        }
        None => (BoxMakeWriter::new(std::io::stderr), None),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(log_file.is_none());
    let installed = match format {
        LogFormat::Human => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|e| Error::Other(format!("Failed to initialize logging: {}", e)))?;
    Ok(guard)
}

#[cfg(feature = "spectator")]
async fn watch(server: String, speed: f64, index: usize) -> Result<()> {
    use std::sync::Arc;

    use arena_relay::spectator::{
        ConsoleObserver, HttpTransport, PlaybackController, SpectatorDriver,
    };

    if !(speed.is_finite() && speed > 0.0) {
        return Err(Error::Config(format!("--speed must be positive, got {}", speed)));
    }

    let transport = Arc::new(HttpTransport::new(server));
    tracing::info!(server = %transport.base_url(), speed, index, "watching relay");

    let driver = SpectatorDriver::new(transport, PlaybackController::new(index, speed));
    let mut observer = ConsoleObserver::stdout();
    driver
        .run(&mut observer, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "could not listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        })
        .await;
    Ok(())
}

fn show_config(resolved: &ResolvedConfig) {
    match &resolved.config_path {
        Some(path) => println!("# config file: {}", path.display()),
        None => println!("# config file: (none)"),
    }
    for (key, value, source) in resolved.entries() {
        println!("{} = {} ({})", key, value, source);
    }
}

fn config_path(explicit: Option<&Path>) -> Result<()> {
    let path = explicit
        .map(Path::to_path_buf)
        .or_else(default_config_path)
        .ok_or_else(|| Error::Config("Could not determine a config directory".to_string()))?;
    println!("{}", path.display());
    Ok(())
}

/// Write the resolved settings as a relay.kdl.
fn init_config(resolved: &ResolvedConfig, explicit: Option<PathBuf>, force: bool) -> Result<()> {
    let path = explicit
        .or_else(default_config_path)
        .ok_or_else(|| Error::Config("Could not determine a config directory".to_string()))?;
    if path.exists() && !force {
        return Err(Error::Config(format!(
            "{} already exists (use --force to overwrite)",
            path.display()
        )));
    }

    let config: RelayConfig = resolved.to_config();
    config.save(&path)?;
    println!("Wrote {}", path.display());
    Ok(())
}
