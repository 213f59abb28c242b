/*!
 # Operator dashboard

 Runs `courtd` as a child process, keeps the tail of its output, and
 serves that tail plus a restart action over HTTP.
*/

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Redirect, Response},
    routing::get,
    Json, Router,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpListener;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::config::DashboardSettings;
use crate::Result;

/// Bounded buffer of the most recent output lines
#[derive(Debug)]
pub struct LogBuffer {
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, line: impl Into<String>) {
        let mut lines = self.lines.lock();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line.into());
    }

    /// Buffered lines joined by newlines, oldest first
    pub fn snapshot(&self) -> String {
        let lines = self.lines.lock();
        lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }
}

/// The supervised daemon process
#[derive(Debug)]
pub struct DaemonProcess {
    command: PathBuf,
    args: Vec<String>,
    child: tokio::sync::Mutex<Option<Child>>,
    logs: Arc<LogBuffer>,
    stop_grace: Duration,
}

impl DaemonProcess {
    pub fn new(command: PathBuf, args: Vec<String>, logs: Arc<LogBuffer>) -> Self {
        Self {
            command,
            args,
            child: tokio::sync::Mutex::new(None),
            logs,
            stop_grace: DashboardSettings::default().stop_grace(),
        }
    }

    /// Time the daemon gets to exit on SIGTERM before it is killed
    pub fn with_stop_grace(mut self, stop_grace: Duration) -> Self {
        self.stop_grace = stop_grace;
        self
    }

    /// Stops the running daemon, if any, and starts a new one
    #[instrument(skip(self), fields(command = %self.command.display()))]
    pub async fn restart(&self) -> Result<()> {
        let mut slot = self.child.lock().await;
        if let Some(child) = slot.take() {
            info!("Stopping daemon (pid {:?})", child.id());
            terminate(child, self.stop_grace).await?;
        }

        let spawned = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                self.logs
                    .push(format!("Error starting {}: {}", self.command.display(), e));
                return Err(e.into());
            }
        };
        info!("Daemon started (pid {:?})", child.id());

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump(stdout, Arc::clone(&self.logs)));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump(stderr, Arc::clone(&self.logs)));
        }
        *slot = Some(child);
        Ok(())
    }

    /// Stops the daemon for good
    pub async fn stop(&self) -> Result<()> {
        if let Some(child) = self.child.lock().await.take() {
            terminate(child, self.stop_grace).await?;
        }
        Ok(())
    }
}

/// Asks `child` to exit with SIGTERM, kills it once `grace` runs out,
/// and reaps it either way
async fn terminate(mut child: Child, grace: Duration) -> Result<()> {
    if child.try_wait()?.is_some() {
        return Ok(());
    }

    #[cfg(unix)]
    if let Some(id) = child.id() {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        match kill(Pid::from_raw(id as i32), Signal::SIGTERM) {
            Ok(()) => match tokio::time::timeout(grace, child.wait()).await {
                Ok(status) => {
                    info!("Daemon exited ({})", status?);
                    return Ok(());
                }
                Err(_) => warn!("Daemon still running {:?} after SIGTERM, killing it", grace),
            },
            Err(e) => warn!("Could not send SIGTERM to daemon: {}", e),
        }
    }
    #[cfg(not(unix))]
    let _ = grace;

    child.kill().await?;
    Ok(())
}

/// Copies lines from a child's output into the log buffer until EOF
async fn pump<R: AsyncRead + Unpin>(reader: R, logs: Arc<LogBuffer>) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => logs.push(line.trim_end().to_string()),
            Ok(None) => break,
            Err(e) => {
                error!("Reading daemon output failed: {}", e);
                break;
            }
        }
    }
}

/// Shared state of the dashboard routes
#[derive(Debug, Clone)]
pub struct DashboardState {
    pub logs: Arc<LogBuffer>,
    pub daemon: Arc<DaemonProcess>,
}

#[derive(Debug, Serialize)]
struct LogResponse {
    log: String,
}

async fn index(State(state): State<DashboardState>) -> String {
    state.logs.snapshot()
}

async fn get_logs(State(state): State<DashboardState>) -> Json<LogResponse> {
    Json(LogResponse {
        log: state.logs.snapshot(),
    })
}

async fn restart(State(state): State<DashboardState>) -> Response {
    match state.daemon.restart().await {
        Ok(()) => Redirect::to("/").into_response(),
        Err(e) => {
            error!("Restart failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

pub fn router(state: DashboardState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/get_logs", get(get_logs))
        .route("/restart", get(restart).post(restart))
        .with_state(state)
}

/// Daemon executable: the configured one, else `courtd` next to this binary
pub fn daemon_command(settings: &DashboardSettings) -> Result<PathBuf> {
    if let Some(command) = &settings.command {
        return Ok(command.clone());
    }
    let exe = std::env::current_exe()?;
    Ok(exe.with_file_name(format!("courtd{}", std::env::consts::EXE_SUFFIX)))
}

/// Starts the daemon and serves the dashboard until `shutdown` is cancelled
pub async fn serve(settings: &DashboardSettings, shutdown: CancellationToken) -> Result<()> {
    let logs = Arc::new(LogBuffer::new(settings.log_lines));
    let daemon = Arc::new(
        DaemonProcess::new(
            daemon_command(settings)?,
            settings.args.clone(),
            Arc::clone(&logs),
        )
        .with_stop_grace(settings.stop_grace()),
    );
    if let Err(e) = daemon.restart().await {
        error!("Could not start the daemon: {}", e);
    }

    let listener = TcpListener::bind(&settings.bind).await?;
    info!("Dashboard listening on {}", listener.local_addr()?);
    let state = DashboardState {
        logs,
        daemon: Arc::clone(&daemon),
    };
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    daemon.stop().await
}
