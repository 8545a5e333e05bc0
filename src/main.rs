use std::fs::OpenOptions;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gridrelay::config::{self, RelayConfig};
use gridrelay::relay::{CommandWriter, Compositor, ControlSocket, LayoutCompositor, RelayServer};

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogFormat {
    #[default]
    Text,
    Json,
}

/// gridrelay command line arguments
#[derive(Parser, Debug)]
#[command(name = "gridrelay")]
#[command(version, about = "Four-party UDP video relay for a grid compositor", long_about = None)]
struct CliArgs {
    /// JSON configuration file (default: $GRIDRELAY_CONFIG if set)
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Client-facing listen address (overrides config)
    #[arg(short = 'a', long, value_name = "ADDRESS")]
    address: Option<String>,

    /// Client-facing UDP port (overrides config)
    #[arg(short = 'p', long, value_name = "PORT")]
    port: Option<u16>,

    /// Idle time after which a silent client is evicted, in milliseconds
    #[arg(long, value_name = "MS")]
    idle_timeout_ms: Option<u64>,

    /// Time between idle sweeps, in milliseconds
    #[arg(long, value_name = "MS")]
    sweep_interval_ms: Option<u64>,

    /// Largest datagram relayed, in bytes
    #[arg(long, value_name = "BYTES")]
    buffer_size: Option<usize>,

    /// Drive the compositor pipeline over this Unix socket, passing it the
    /// endpoint sockets
    #[arg(long, value_name = "PATH", conflicts_with = "control_out")]
    control_socket: Option<PathBuf>,

    /// Write compositor control commands as JSON lines to this file or FIFO
    #[arg(long, value_name = "PATH")]
    control_out: Option<PathBuf>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Log output format
    #[arg(long, value_name = "FORMAT", default_value = "text")]
    log_format: LogFormat,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    init_logging(args.log_level, args.verbose, args.log_format);

    tracing::info!("Starting gridrelay v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match args.config.clone().or_else(get_config_path) {
        Some(path) => {
            tracing::info!("Configuration file: {}", path.display());
            config::load_config(&path)?
        }
        None => RelayConfig::default(),
    };

    // Apply CLI argument overrides to config (only if explicitly specified)
    if let Some(addr) = args.address {
        config.bind_address = addr;
    }
    if let Some(port) = args.port {
        config.client_port = port;
    }
    if let Some(ms) = args.idle_timeout_ms {
        config.idle_timeout_ms = ms;
    }
    if let Some(ms) = args.sweep_interval_ms {
        config.sweep_interval_ms = ms;
    }
    if let Some(bytes) = args.buffer_size {
        config.buffer_size = bytes;
    }

    let compositor: Box<dyn Compositor> = match (args.control_socket, args.control_out) {
        (Some(path), _) => Box::new(ControlSocket::connect(&path)?),
        (None, Some(path)) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|e| {
                    anyhow::anyhow!("Failed to open control output {}: {}", path.display(), e)
                })?;
            tracing::info!("Compositor commands written to {}", path.display());
            Box::new(CommandWriter::new(file))
        }
        (None, None) => {
            tracing::warn!("No compositor pipeline attached, forwarded video is not consumed");
            Box::new(LayoutCompositor::new())
        }
    };

    let mut server = RelayServer::bind(&config, compositor)?;
    server.run()?;

    Ok(())
}

fn init_logging(level: LogLevel, verbose_count: u8, format: LogFormat) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "gridrelay=error",
        LogLevel::Warn => "gridrelay=warn",
        LogLevel::Info => "gridrelay=info",
        LogLevel::Verbose => "gridrelay=debug",
        LogLevel::Debug => "gridrelay=debug",
        LogLevel::Trace => "gridrelay=trace",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
    };
    if let Err(err) = result {
        eprintln!("failed to initialize tracing: {}", err);
    }
}

/// Configuration file from the environment, if any
fn get_config_path() -> Option<PathBuf> {
    std::env::var_os("GRIDRELAY_CONFIG")
        .filter(|path| !path.is_empty())
        .map(PathBuf::from)
}
