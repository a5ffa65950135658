//! aw-man: a manga and comic viewer built around a concurrent page pipeline.
//!
//! The binary wires the pieces together: CLI and config, logging, the
//! channel boundary between the manager and its frontends, the IPC socket,
//! signal handling, and the shutdown watchdog. The rendering surface is a
//! frontend over the state channel; the one shipped here is headless and
//! leaves command intake to the socket.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{debug, error, info};

use aw_man_core::config::{Config, ConfigFile};
use aw_man_core::log::{LogConfig, LogLevel};
use aw_man_core::manager::{self, ManagerOptions};
use aw_man_core::types::{Command, Executable, ImageDimensions, Modes, State, UserCommand};
use aw_man_core::{events, socket, upscale};

/// Every frontend gets this viewport until it reports a real size.
const DEFAULT_VIEWPORT: ImageDimensions = ImageDimensions { w: 1920, h: 1080 };

/// How long workers get to drain after shutdown starts.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(20);

#[derive(Debug, Parser)]
#[command(name = "aw-man", version, about = "Manga and comic viewer")]
struct Cli {
    /// Archive, image, or directory to open; multiple files open as a set.
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    /// Start in manga mode, continuing into the next archive in the
    /// directory when navigating past the end of the current one.
    #[arg(short, long)]
    manga: bool,

    /// Start with upscaling enabled.
    #[arg(short, long)]
    upscale: bool,

    /// Verbose diagnostics on the console.
    #[arg(long)]
    debug: bool,

    /// Config file to use instead of the default location.
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("aw-man: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config: Arc<Config> =
        Arc::new(ConfigFile::load(cli.config.as_deref())?.resolve().context("invalid config")?);

    let mut log_config = LogConfig::default();
    if cli.debug {
        log_config = log_config.with_console_level(LogLevel::DEBUG);
    }
    aw_man_core::log::init(log_config).context("initialising logging")?;

    let mut paths = Vec::with_capacity(cli.paths.len());
    for path in &cli.paths {
        let path = path
            .canonicalize()
            .with_context(|| format!("{} is not a valid path", path.display()))?;
        paths.push(path);
    }

    std::fs::create_dir_all(&config.temp_directory).with_context(|| {
        format!("creating temp directory root {}", config.temp_directory.display())
    })?;
    let temp_root = tempfile::Builder::new()
        .prefix("aw-man")
        .tempdir_in(&config.temp_directory)
        .context("creating temporary directory")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("starting async runtime")?;

    let result = runtime.block_on(run_async(cli, config, paths, temp_root.path().to_path_buf()));

    events::begin_shutdown();
    // Give teardown tasks owned by the runtime a moment to finish.
    runtime.shutdown_timeout(Duration::from_secs(5));

    if let Err(err) = temp_root.close() {
        error!("error removing temp dir: {err}");
    }
    result
}

async fn run_async(
    cli: Cli,
    config: Arc<Config>,
    paths: Vec<PathBuf>,
    temp_root: PathBuf,
) -> Result<()> {
    let (command_tx, command_rx) = flume::bounded::<UserCommand>(4);
    let (executable_tx, executable_rx) = flume::bounded::<Executable>(4);
    let (size_tx, size_rx) = flume::bounded::<ImageDimensions>(4);
    // Rendezvous: producing a snapshot blocks the manager until the
    // frontend consumes it, which keeps the pipeline paced by the display.
    let (state_tx, state_rx) = flume::bounded::<State>(0);
    let (socket_tx, socket_rx) = flume::bounded(4);

    let socket_server = match &config.socket_dir {
        Some(dir) => Some(socket::serve(dir, socket_tx)?),
        None => None,
    };

    let upscale_jobs = match (&config.upscaler, config.upscaling_target) {
        (Some(upscaler), Some(_)) => {
            let (job_tx, job_rx) = flume::bounded(0);
            upscale::spawn_upscaler(upscaler.clone(), job_rx);
            Some(job_tx)
        }
        _ => {
            if cli.upscale {
                info!("upscaling requested but no upscaler/target_resolution configured");
            }
            None
        }
    };

    validate_shortcuts(&config);

    tokio::spawn(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            events::begin_shutdown();
        }
    });
    spawn_watchdog();

    // The headless frontend: report a viewport once, then drain snapshots
    // into the log. A real renderer replaces exactly this loop.
    let _ = size_tx.send_async(DEFAULT_VIEWPORT).await;
    let frontend = tokio::spawn(async move {
        let mut shutdown = events::shutdown_waiter();
        loop {
            let state = tokio::select! {
                biased;
                _ = shutdown.wait() => break,
                state = state_rx.recv_async() => match state {
                    Ok(state) => state,
                    Err(_) => break,
                },
            };
            debug!(
                "displaying {}/{} {:?} of {}",
                state.page_number, state.archive_len, state.page_name, state.archive_name
            );
        }
    });

    let manager = tokio::spawn(manager::run(ManagerOptions {
        files: paths,
        temp_root,
        config,
        modes: Modes { manga: cli.manga, upscaling: cli.upscale },
        commands: command_rx,
        executables: executable_rx,
        sizes: size_rx,
        states: state_tx,
        sockets: socket_rx,
        upscale_jobs,
    }));

    // Keep the boundary senders alive for the manager's whole life; a real
    // renderer would own these.
    let _input = (command_tx, executable_tx, size_tx);

    let joined = manager.await;

    events::begin_shutdown();
    let _ = frontend.await;
    if let Some(server) = socket_server {
        server.close();
    }

    match joined {
        Ok(result) => result,
        Err(err) if err.is_panic() => bail!("manager aborted: invariant violation"),
        Err(err) => bail!("manager task failed: {err}"),
    }
}

/// Shortcut actions are parsed up front so typos surface at startup
/// instead of on first keypress. Anything that is not an internal command
/// is assumed to name a helper executable.
fn validate_shortcuts(config: &Config) {
    for shortcut in &config.shortcuts {
        if Command::parse_action(&shortcut.action).is_none() {
            debug!(
                "shortcut {:?} ({}) maps to executable {:?}",
                shortcut.key, shortcut.modifiers, shortcut.action
            );
        }
    }
}

/// After shutdown begins, the process has [`SHUTDOWN_GRACE`] to exit on
/// its own before the watchdog reports the hang and kills it.
fn spawn_watchdog() {
    std::thread::spawn(|| {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("watchdog runtime");
        runtime.block_on(async {
            let mut shutdown = events::shutdown_waiter();
            shutdown.wait().await;
            tokio::time::sleep(SHUTDOWN_GRACE).await;
            error!("failed to exit in a timely manner");
            std::process::exit(1);
        });
    });
}
