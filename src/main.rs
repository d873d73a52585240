//! spicecast — SPICE guest streaming agent.
//!
//! Opens the host-provided virtio-serial port, registers the built-in
//! MJPEG plugin, and streams the guest display until a stop request or a
//! termination signal. Exits 0 on a clean shutdown, non-zero on any
//! uncaught error or usage failure.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{CommandFactory, Parser};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use spicecast::cursor::CursorSource;
use spicecast::{AgentError, ConfigOption, FrameLog, MjpegPlugin, PluginRegistry};

const DEFAULT_PORT: &str = "/dev/virtio-ports/org.spice-space.stream.0";
const DEFAULT_PLUGINS_DIR: &str = "/usr/lib/spicecast/plugins";

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "spicecast",
    about = "SPICE guest streaming agent",
    disable_help_flag = true,
    after_help = "plugin settings for -c:\n  framerate = 1-100\n  quality = 1-100"
)]
struct Cli {
    /// virtio-serial port to use
    #[arg(short = 'p', value_name = "portname", default_value = DEFAULT_PORT)]
    port: PathBuf,

    /// log frames to file
    #[arg(short = 'l', value_name = "file")]
    log_file: Option<PathBuf>,

    /// log binary frames (following -l)
    #[arg(long)]
    log_binary: bool,

    /// log categories, separated by ':' (currently: frames)
    #[arg(long, value_name = "categories")]
    log_categories: Option<String>,

    /// change plugins directory
    #[arg(long, value_name = "path", default_value = DEFAULT_PLUGINS_DIR)]
    plugins_dir: PathBuf,

    /// enable debug logs
    #[arg(short = 'd')]
    debug: bool,

    /// change plugin settings
    #[arg(short = 'c', value_name = "variable=value", value_parser = ConfigOption::parse)]
    options: Vec<ConfigOption>,

    /// print this help message
    #[arg(short = 'h', long = "help")]
    help: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Help is a usage path and exits non-zero, like any other usage
    // failure (clap's built-in help would exit 0).
    if cli.help {
        let mut cmd = Cli::command();
        let _ = cmd.print_help();
        return ExitCode::FAILURE;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if cli.debug { "debug" } else { "info" }));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), AgentError> {
    let quit = CancellationToken::new();
    install_signal_handlers(quit.clone())?;

    let mut registry = PluginRegistry::new();
    MjpegPlugin::register(&mut registry);
    registry.load_plugins(&cli.plugins_dir);
    registry.set_options(&cli.options)?;

    let log_frames = cli
        .log_categories
        .as_deref()
        .unwrap_or_default()
        .split(':')
        .any(|category| category == "frames"); // unknown categories are ignored
    let mut frame_log = FrameLog::open(cli.log_file.as_deref(), cli.log_binary, log_frames)?;
    for arg in std::env::args() {
        frame_log.stat(format_args!("Args: {arg}"));
    }

    info!("opening stream device {}", cli.port.display());
    let device = tokio::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(&cli.port)
        .await?;

    spicecast::run_session(device, registry, frame_log, cursor_source(), quit).await
}

/// SIGINT and SIGTERM both request a clean shutdown.
fn install_signal_handlers(quit: CancellationToken) -> Result<(), AgentError> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
        }
        info!("got termination signal, exiting");
        quit.cancel();
    });
    Ok(())
}

/// The windowing-system cursor watcher to report shapes from.
fn cursor_source() -> Option<Box<dyn CursorSource>> {
    // No watcher is wired into this build; sessions run without cursor
    // reporting until one is registered here.
    debug!("no cursor source available, cursor reporting disabled");
    None
}
