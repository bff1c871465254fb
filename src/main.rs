//! `df_engine`: runs a configured pipeline of log sources, processors
//! and destinations to completion, serving a control socket alongside
//! it for reload/stats/stop (§6).
//!
//! The engine's `run()` blocks its calling thread on an internal tokio
//! runtime, so it is spawned onto a dedicated OS thread here; the main
//! thread runs its own runtime driving the control socket and OS
//! signal handling, forwarding commands to the engine thread through
//! its `CommandHandler` (a plain `mpsc::Sender`, safely shared across
//! runtimes).
//!
//! `DF_ENGINE_PREFIX`, if set, is joined onto the default (relative)
//! persist-file and control-socket paths, so a packaged install can
//! relocate its runtime files without every `--persist-file`/
//! `--control-socket` invocation needing an absolute path.

mod factories;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use clap::Parser;
use color_eyre::eyre::{Result, WrapErr};
use control::{ControlCommand, ControlHandler, ControlServer};
use engine::{multi_threaded, Command, Engine};
use mimalloc_rust::GlobalMiMalloc;
use persist::PersistFile;
use task::labels::ProcessLabels;
use tracing_subscriber::EnvFilter;

use crate::factories::{StandardExporterFactory, StandardProcessorFactory, StandardReceiverFactory};

#[global_allocator]
static GLOBAL_MIMALLOC: GlobalMiMalloc = GlobalMiMalloc;

/// In-process log pipeline engine.
#[derive(Parser, Debug)]
#[command(name = "df_engine", version, about)]
struct Cli {
    /// Path to the pipeline configuration file (YAML).
    config_file: PathBuf,

    /// Path to the persisted-state file (position bookmarks, etc).
    #[arg(long, default_value = "df_engine.persist")]
    persist_file: PathBuf,

    /// Log level passed to the tracing env filter (overridden by `RUST_LOG`).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Run attached to the controlling terminal instead of detaching.
    #[arg(long)]
    foreground: bool,

    /// Path of the UNIX control socket to serve.
    #[arg(long, default_value = "/tmp/df_engine.ctl")]
    control_socket: PathBuf,
}

/// Bridges control-socket commands to the running engine and answers
/// `Stats`/`Query` from process-local counters kept here.
struct EngineControlHandler {
    command_handler: engine::CommandHandler,
    config_file: PathBuf,
    started_at: Instant,
    reload_count: AtomicU64,
}

#[async_trait]
impl ControlHandler for EngineControlHandler {
    async fn handle(&self, command: ControlCommand) -> Vec<String> {
        match command {
            ControlCommand::Reload => {
                let config_file_path = self.config_file.to_string_lossy().to_string();
                match self.command_handler.send(Command::Reload { config_file_path }) {
                    Ok(()) => {
                        self.reload_count.fetch_add(1, Ordering::Relaxed);
                        vec!["OK reload requested".to_string()]
                    }
                    Err(err) => vec![format!("ERROR reload failed: {err}")],
                }
            }
            ControlCommand::Stats => {
                vec![
                    format!("uptime_seconds={}", self.started_at.elapsed().as_secs()),
                    format!("reload_count={}", self.reload_count.load(Ordering::Relaxed)),
                ]
            }
            ControlCommand::Query(pattern) => {
                vec![format!("ERROR no stats registry matches pattern '{pattern}'")]
            }
            ControlCommand::Stop => match self.command_handler.send(Command::StopAll) {
                Ok(()) => vec!["OK stopping".to_string()],
                Err(err) => vec![format!("ERROR stop failed: {err}")],
            },
        }
    }
}

fn init_logging(log_level: &str) -> Result<()> {
    color_eyre::install()?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

/// Joins `path` onto `prefix` when `path` is relative, leaving absolute
/// paths untouched. Mirrors `DF_ENGINE_PREFIX` resolving default
/// relative file locations (persist file, control socket) the way the
/// original's install prefix located its own runtime files, without
/// implying any dynamic plugin-loading machinery this static binary
/// doesn't have.
fn resolve_under_prefix(prefix: Option<&str>, path: PathBuf) -> PathBuf {
    match prefix {
        Some(prefix) if path.is_relative() => PathBuf::from(prefix).join(path),
        _ => path,
    }
}

fn main() -> Result<()> {
    let mut cli = Cli::parse();
    init_logging(&cli.log_level)?;

    let prefix = std::env::var("DF_ENGINE_PREFIX").ok();
    cli.persist_file = resolve_under_prefix(prefix.as_deref(), cli.persist_file);
    cli.control_socket = resolve_under_prefix(prefix.as_deref(), cli.control_socket);

    if !cli.foreground {
        tracing::info!("running in the background is delegated to the service supervisor (systemd/runit); df_engine itself always stays in the foreground of its process");
    }

    let persist = Arc::new(
        PersistFile::open(&cli.persist_file)
            .wrap_err_with(|| format!("failed to open persist file {}", cli.persist_file.display()))?,
    );

    let mut engine = multi_threaded::Engine::new(
        StandardReceiverFactory::new(persist.clone()),
        StandardProcessorFactory,
        StandardExporterFactory,
    );
    let command_handler = engine.command_handler();

    let config_file = cli.config_file.clone();
    let engine_thread = std::thread::Builder::new()
        .name("df-engine-run".into())
        .spawn(move || engine.run(ProcessLabels::new("df_engine"), config_file))
        .wrap_err("failed to spawn the engine thread")?;

    let control_handler = Arc::new(EngineControlHandler {
        command_handler,
        config_file: cli.config_file.clone(),
        started_at: Instant::now(),
        reload_count: AtomicU64::new(0),
    });

    let control_runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("failed to build the control-plane runtime")?;

    control_runtime.block_on(serve_control_plane(cli.control_socket, control_handler.clone()));

    match engine_thread.join() {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(color_eyre::eyre::eyre!("engine exited with an error: {err}")),
        Err(_) => Err(color_eyre::eyre::eyre!("engine thread panicked")),
    }
}

/// Serves the control socket and OS signal handling side by side,
/// returning once a stop has been requested through either path.
async fn serve_control_plane(control_socket: PathBuf, control_handler: Arc<EngineControlHandler>) {
    let server = Arc::new(ControlServer::new(control_socket, control_handler.clone()));

    let serve_handle = tokio::spawn(async move {
        if let Err(err) = server.serve().await {
            tracing::error!(error = %err, "control socket stopped serving");
        }
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sighup = signal(SignalKind::hangup()).expect("failed to register SIGHUP handler");
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT handler");

        loop {
            tokio::select! {
                _ = sighup.recv() => {
                    tracing::info!("SIGHUP received, requesting reload");
                    if let Err(err) = control_handler
                        .command_handler
                        .send(Command::Reload { config_file_path: control_handler.config_file.to_string_lossy().to_string() })
                    {
                        tracing::error!(error = %err, "failed to forward reload command");
                    }
                }
                _ = sigterm.recv() => {
                    tracing::info!("SIGTERM received, stopping");
                    let _ = control_handler.command_handler.send(Command::StopAll);
                    break;
                }
                _ = sigint.recv() => {
                    tracing::info!("SIGINT received, stopping");
                    let _ = control_handler.command_handler.send(Command::StopAll);
                    break;
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        let _ = control_handler.command_handler.send(Command::StopAll);
    }

    serve_handle.abort();
}

#[cfg(test)]
mod test {
    use super::resolve_under_prefix;
    use std::path::PathBuf;

    #[test]
    fn relative_path_joins_prefix() {
        let resolved = resolve_under_prefix(Some("/etc/df_engine"), PathBuf::from("df_engine.persist"));
        assert_eq!(resolved, PathBuf::from("/etc/df_engine/df_engine.persist"));
    }

    #[test]
    fn absolute_path_ignores_prefix() {
        let resolved = resolve_under_prefix(Some("/etc/df_engine"), PathBuf::from("/tmp/df_engine.persist"));
        assert_eq!(resolved, PathBuf::from("/tmp/df_engine.persist"));
    }

    #[test]
    fn no_prefix_leaves_path_untouched() {
        let resolved = resolve_under_prefix(None, PathBuf::from("df_engine.persist"));
        assert_eq!(resolved, PathBuf::from("df_engine.persist"));
    }
}
