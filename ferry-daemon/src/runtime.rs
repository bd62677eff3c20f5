use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;

use ferry_core::{config, SyncConfig};
use ferry_sync::LogSink;

use crate::error::{io_err, DaemonError};
use crate::orchestrator::Orchestrator;
use crate::paths::{ferry_root, log_path, logs_dir, socket_path, SHUTDOWN_GRACE};
use crate::protocol::{DaemonRequest, DaemonResponse};
use crate::sink::FileSink;

/// Facts about this daemon process reported by `status`.
#[derive(Debug, Clone)]
struct DaemonInfo {
    home: PathBuf,
    started_at_unix: u64,
    project: String,
    destination: PathBuf,
    poll_interval_secs: u64,
}

/// Start the daemon runtime and block the current thread until it exits.
pub fn start_blocking(home: &Path) -> Result<(), DaemonError> {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(home.to_path_buf()))
}

/// Run the daemon until `stop`, ctrl-c, or a component failure.
pub async fn run(home: PathBuf) -> Result<(), DaemonError> {
    let config = config::load_at(&home)?;
    ensure_runtime_dirs(&home)?;

    let sink: Arc<dyn LogSink> = Arc::new(FileSink::new(log_path(&home)));
    let orchestrator = Arc::new(Orchestrator::from_config(&config, Arc::clone(&sink)));
    let info = DaemonInfo {
        home: home.clone(),
        started_at_unix: unix_seconds_now(),
        project: config.project_name.0.clone(),
        destination: orchestrator.settings().destination.clone(),
        poll_interval_secs: config.poll_interval_secs,
    };
    sink.info(&format!(
        "daemon started: project {}, {} sources, destination {}",
        info.project,
        orchestrator.registry().len(),
        info.destination.display()
    ));

    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    let control_handle = {
        let shutdown = shutdown_tx.clone();
        let orchestrator = Arc::clone(&orchestrator);
        let config = config.clone();
        tokio::spawn(async move {
            let result = control_loop(orchestrator, &config, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let orchestrator = Arc::clone(&orchestrator);
        let info = info.clone();
        tokio::spawn(async move {
            let result =
                socket_server_task(info, orchestrator, shutdown.clone(), shutdown.subscribe())
                    .await;
            let _ = shutdown.send(());
            result
        })
    };

    let rotation_handle = {
        let shutdown = shutdown_tx.clone();
        let home = home.clone();
        tokio::spawn(async move {
            let result = log_rotation_task(home, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => match signal {
                    Ok(()) => {
                        tracing::info!("received ctrl-c, shutting down daemon");
                        let _ = shutdown.send(());
                        Ok(())
                    }
                    Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
                }
            }
        })
    };

    let (control_result, socket_result, rotation_result, signal_result) =
        tokio::join!(control_handle, socket_handle, rotation_handle, signal_handle);

    orchestrator.stop(SHUTDOWN_GRACE).await;
    sink.info("daemon stopped");

    handle_join("control_loop", control_result)?;
    handle_join("socket_server", socket_result)?;
    handle_join("log_rotation", rotation_result)?;
    handle_join("signal_handler", signal_result)?;
    Ok(())
}

async fn control_loop(
    orchestrator: Arc<Orchestrator>,
    config: &SyncConfig,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut interval = tokio::time::interval(config.poll_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {
                let report = orchestrator.poll_once().await;
                if !report.started.is_empty() {
                    tracing::info!(started = report.started.len(), "sync tasks admitted");
                }
            }
        }
    }
    Ok(())
}

async fn socket_server_task(
    info: DaemonInfo,
    orchestrator: Arc<Orchestrator>,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let socket = socket_path(&info.home);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;
    let info = Arc::new(info);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let info = Arc::clone(&info);
                let orchestrator = Arc::clone(&orchestrator);
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    let served = handle_socket_client(stream, info, orchestrator, shutdown_tx);
                    if let Err(err) = served.await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(
    stream: UnixStream,
    info: Arc<DaemonInfo>,
    orchestrator: Arc<Orchestrator>,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }
        let request: DaemonRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &DaemonResponse::error(format!("invalid request JSON: {err}")),
                )
                .await?;
                continue;
            }
        };

        let response = match request.cmd.as_str() {
            "status" => DaemonResponse::ok(status_payload(&info, &orchestrator)),
            "snapshot" => DaemonResponse::ok(serde_json::to_value(orchestrator.snapshot())?),
            "stop" => {
                let _ = shutdown_tx.send(());
                DaemonResponse::ok(json!({ "stopping": true }))
            }
            other => DaemonResponse::error(format!("unknown command '{other}'")),
        };
        write_response(&mut writer, &response).await?;
        if request.cmd == "stop" {
            break;
        }
    }
    Ok(())
}

fn status_payload(info: &DaemonInfo, orchestrator: &Orchestrator) -> Value {
    json!({
        "running": true,
        "pid": std::process::id(),
        "started_at_unix": info.started_at_unix,
        "project": info.project,
        "destination": info.destination.display().to_string(),
        "poll_interval_secs": info.poll_interval_secs,
        "registered_sources": orchestrator.registry().len(),
        "live_tasks": orchestrator.live_count(),
        "captures": orchestrator.capture_stats(),
        "socket": socket_path(&info.home).display().to_string(),
        "log": log_path(&info.home).display().to_string(),
    })
}

async fn log_rotation_task(
    home: PathBuf,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {
                let home = home.clone();
                // Failures are logged inside; rotation never stops the daemon.
                let _ = tokio::task::spawn_blocking(move || {
                    crate::log_rotation::rotate_daemon_log(&home);
                })
                .await;
            }
        }
    }
    Ok(())
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }
    if StdUnixStream::connect(socket).is_ok() {
        return Err(DaemonError::Protocol(format!(
            "daemon socket already in use: {}",
            socket.display()
        )));
    }
    tracing::warn!(socket = %socket.display(), "removing stale daemon socket before bind");
    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

fn ensure_runtime_dirs(home: &Path) -> Result<(), DaemonError> {
    for dir in [ferry_root(home), logs_dir(home)] {
        fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
    }
    Ok(())
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    let mut payload = serde_json::to_string(response)?;
    payload.push('\n');
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

fn unix_seconds_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}
