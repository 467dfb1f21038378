//! Process supervision: launching the server, running one session's I/O
//! tasks, and replacing the session when it dies.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::bridge::Shared;
use crate::codec::{FrameReader, FrameWriter, ReadEvent};
use crate::correlator::{Correlator, WRITER_CHANNEL_CAPACITY, WriterCommand};
use crate::error::BridgeError;
use crate::protocol;
use crate::types::{BridgeConfig, ServerConfig};

/// Byte streams of a started language server.
pub struct LaunchedServer {
    /// Server stdout.
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    /// Server stdin.
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
    pub stderr: Option<Box<dyn AsyncRead + Send + Unpin>>,
    /// Present for real processes; `None` for in-process servers.
    pub child: Option<Child>,
}

impl LaunchedServer {
    pub fn from_streams(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            stderr: None,
            child: None,
        }
    }
}

/// Starts language server instances. `generation` increases by one per launch.
pub trait ServerLauncher: Send + Sync + 'static {
    fn launch(&self, generation: u64) -> Result<LaunchedServer>;
}

/// Launches the configured executable with piped stdio.
#[derive(Debug, Clone)]
pub struct StdioLauncher {
    program: PathBuf,
    args: Vec<String>,
    cwd: PathBuf,
}

impl StdioLauncher {
    pub fn new(config: &BridgeConfig) -> Result<Self> {
        let program = resolve_command(&config.server, &config.project_root)?;
        Ok(Self {
            program,
            args: config.server.args.clone(),
            cwd: config.project_root.clone(),
        })
    }

    #[must_use]
    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl ServerLauncher for StdioLauncher {
    fn launch(&self, generation: u64) -> Result<LaunchedServer> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .current_dir(&self.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning {}", self.program.display()))?;

        let stdout = child.stdout.take().context("no stdout from child")?;
        let stdin = child.stdin.take().context("no stdin from child")?;
        let stderr = child.stderr.take().context("no stderr from child")?;
        tracing::info!(
            generation,
            pid = child.id(),
            program = %self.program.display(),
            "Language server started"
        );

        Ok(LaunchedServer {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            stderr: Some(Box::new(stderr)),
            child: Some(child),
        })
    }
}

/// Locate the server executable.
///
/// A command with a path separator is taken relative to the project root. A
/// bare name is looked up in the configured install dirs, then next to the
/// running binary, then on `PATH`.
pub fn resolve_command(server: &ServerConfig, project_root: &Path) -> Result<PathBuf> {
    let command = Path::new(&server.command);
    if command.is_absolute() || command.components().count() > 1 {
        let path = project_root.join(command);
        ensure!(path.is_file(), "{} not found", path.display());
        return Ok(path);
    }

    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf));
    let search = server
        .install_dirs
        .iter()
        .map(|dir| project_root.join(dir))
        .chain(exe_dir);
    for dir in search {
        if let Ok(found) = which::which_in(&server.command, Some(&dir), project_root) {
            tracing::debug!(path = %found.display(), "Resolved language server");
            return Ok(found);
        }
    }

    which::which(&server.command).with_context(|| {
        format!(
            "{} not found in install dirs or PATH",
            server.command
        )
    })
}

#[derive(Debug)]
pub(crate) enum SessionEnd {
    Closed,
    ReadError(String),
    HandshakeFailed(BridgeError),
}

/// One running server: its correlator and I/O tasks.
pub(crate) struct Session {
    pub rpc: Arc<Correlator>,
    child: Option<Child>,
    ended: oneshot::Receiver<SessionEnd>,
    reader_handle: JoinHandle<()>,
    writer_handle: JoinHandle<()>,
}

impl Session {
    fn spawn(shared: &Arc<Shared>, generation: u64, server: LaunchedServer) -> Self {
        let (writer_tx, mut writer_rx) = mpsc::channel::<WriterCommand>(WRITER_CHANNEL_CAPACITY);
        let rpc = Arc::new(
            Correlator::new(generation, writer_tx, shared.subscriptions())
                .with_send_timeout(shared.config.request_timeout),
        );

        let stdin = server.writer;
        let writer_handle = tokio::spawn(async move {
            let mut writer = FrameWriter::new(stdin);
            while let Some(cmd) = writer_rx.recv().await {
                match cmd {
                    WriterCommand::Send(frame) => {
                        if let Err(e) = writer.write_frame(&frame).await {
                            tracing::warn!(generation, "LSP write error: {e:#}");
                            break;
                        }
                    }
                    WriterCommand::Shutdown => {
                        let _ = writer.close().await;
                        break;
                    }
                }
            }
        });

        let (ended_tx, ended) = oneshot::channel();
        let reader_rpc = rpc.clone();
        let stdout = server.reader;
        let reader_handle = tokio::spawn(async move {
            let mut reader = FrameReader::new(stdout);
            let end = loop {
                match reader.next_event().await {
                    Ok(ReadEvent::Frame(frame)) => reader_rpc.dispatch(&frame).await,
                    Ok(ReadEvent::Malformed(e)) => {
                        tracing::warn!(generation, "Discarding malformed LSP frame: {e}");
                    }
                    Ok(ReadEvent::Closed) => {
                        tracing::info!(generation, "Language server closed stdout");
                        break SessionEnd::Closed;
                    }
                    Err(e) => {
                        tracing::warn!(generation, "LSP reader error: {e}");
                        break SessionEnd::ReadError(e.to_string());
                    }
                }
            };
            let _ = ended_tx.send(end);
        });

        if let Some(stderr) = server.stderr {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(target: "tether_lsp::server", generation, "{line}");
                }
            });
        }

        Self {
            rpc,
            child: server.child,
            ended,
            reader_handle,
            writer_handle,
        }
    }

    /// Graceful `shutdown`/`exit`, then kill after `grace`.
    async fn stop(mut self, grace: Duration) {
        match self.rpc.request("shutdown", None, grace).await {
            Ok(_) => {
                let _ = self.rpc.notify("exit", None).await;
            }
            Err(e) => tracing::debug!("LSP shutdown request failed: {e}"),
        }
        self.rpc.close_writer();
        self.rpc.fail_all().await;

        if let Some(child) = self.child.as_mut() {
            if tokio::time::timeout(grace, child.wait()).await.is_err() {
                tracing::debug!("Language server didn't exit in time, killing");
                let _ = child.kill().await;
            }
        } else {
            // No process handle; give the reader a moment to observe EOF.
            let _ = tokio::time::timeout(grace, &mut self.ended).await;
        }
        self.reader_handle.abort();
        self.writer_handle.abort();
    }

    /// Tear down after the server died or misbehaved.
    async fn reap(mut self) {
        self.rpc.fail_all().await;
        self.reader_handle.abort();
        self.writer_handle.abort();
        if let Some(child) = self.child.as_mut() {
            let _ = child.start_kill();
            match tokio::time::timeout(Duration::from_secs(1), child.wait()).await {
                Ok(Ok(status)) => tracing::info!(%status, "Language server exited"),
                Ok(Err(e)) => tracing::debug!("waiting for language server: {e}"),
                Err(_) => tracing::warn!("Language server did not exit after kill"),
            }
        }
    }
}

/// Launch a new generation and wire up its I/O.
pub(crate) fn launch_session(
    shared: &Arc<Shared>,
    launcher: &dyn ServerLauncher,
) -> Result<Session> {
    let generation = shared.next_generation();
    let server = launcher
        .launch(generation)
        .with_context(|| format!("launching language server (generation {generation})"))?;
    Ok(Session::spawn(shared, generation, server))
}

async fn handshake(shared: &Shared, rpc: &Correlator) -> Result<(), BridgeError> {
    let root_uri = protocol::path_to_file_uri(&shared.config.project_root).map_err(|e| {
        BridgeError::InvalidPath {
            path: shared.config.project_root.clone(),
            reason: e.to_string(),
        }
    })?;
    let result = rpc
        .request(
            "initialize",
            Some(protocol::initialize_params(root_uri.as_str())),
            shared.config.request_timeout,
        )
        .await?;
    shared.record_initialize_result(&result);
    rpc.notify("initialized", Some(serde_json::json!({})))
        .await?;
    shared
        .readiness
        .handshake_complete(shared.config.server.readiness_signal);
    tracing::info!(generation = rpc.generation(), "LSP handshake complete");
    Ok(())
}

/// Handshake, then wait for the session to end.
async fn drive(shared: &Shared, rpc: &Correlator, ended: &mut oneshot::Receiver<SessionEnd>) -> SessionEnd {
    tokio::select! {
        result = handshake(shared, rpc) => {
            if let Err(e) = result {
                return SessionEnd::HandshakeFailed(e);
            }
        }
        end = &mut *ended => return end.unwrap_or(SessionEnd::Closed),
    }
    ended.await.unwrap_or(SessionEnd::Closed)
}

/// Supervise sessions until stopped or the restart budget runs out.
pub(crate) async fn run(
    shared: Arc<Shared>,
    launcher: Arc<dyn ServerLauncher>,
    first: Session,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut session = first;
    loop {
        let generation = session.rpc.generation();
        shared.activate(session.rpc.clone());

        let rpc = session.rpc.clone();
        let end = tokio::select! {
            biased;
            _ = stop_rx.wait_for(|stop| *stop) => None,
            end = drive(&shared, &rpc, &mut session.ended) => Some(end),
        };

        shared.deactivate();
        let Some(end) = end else {
            tracing::info!(generation, "Stopping language server");
            session.stop(shared.config.shutdown_grace).await;
            shared.documents.invalidate_all();
            shared.diagnostics.clear();
            return;
        };

        if matches!(end, SessionEnd::HandshakeFailed(_)) {
            shared.readiness.degrade();
        }
        let lost = rpc.fail_all().await;
        session.reap().await;
        let dropped = shared.documents.invalidate_all();
        shared.diagnostics.clear();
        tracing::warn!(
            generation,
            lost_requests = lost,
            dropped_documents = dropped,
            reason = ?end,
            "Language server session ended unexpectedly"
        );

        let Some(next) = relaunch(&shared, launcher.as_ref(), &stop_rx) else {
            return;
        };
        session = next;
    }
}

/// Restart within budget. `None` means give up (budget spent or stop requested).
fn relaunch(
    shared: &Arc<Shared>,
    launcher: &dyn ServerLauncher,
    stop_rx: &watch::Receiver<bool>,
) -> Option<Session> {
    let max = shared.config.max_restart_attempts;
    loop {
        if *stop_rx.borrow() {
            return None;
        }
        let restarts = shared.restarts();
        if restarts >= max {
            tracing::error!(restarts, max, "Language server restart limit reached");
            shared.readiness.fail();
            return None;
        }
        let restarts = shared.bump_restarts();
        shared.readiness.begin_session();
        tracing::info!(restarts, max, "Restarting language server");
        match launch_session(shared, launcher) {
            Ok(session) => return Some(session),
            Err(e) => tracing::warn!("Language server restart failed: {e:#}"),
        }
    }
}
