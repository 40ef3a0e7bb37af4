//! Runner Abstraction (C6). An abstract interface over an external
//! agent process: spawn, send a prompt, read the event stream, stop,
//! and report capability flags. One concrete adapter
//! (`ChildProcessRunner`) wraps a real child process, with the usual
//! `Command`/`Child`/`BufReader` plumbing driving an abstract event
//! protocol instead of feature-specific prompts.
//!
//! Concrete wire formats to specific agent vendors are out of scope
//! (§1) — `ChildProcessRunner` only assumes a program that reads a
//! prompt on stdin and emits `NIBBLER_EVENT` lines (or envelopes
//! containing them, §4.6) on stdout. Each child is placed in its own
//! process group (§9) so `stop` reaches every descendant with one
//! group signal.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::mpsc;

use crate::protocol::{self, NibblerEvent};

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("failed to spawn agent process: {0}")]
    Spawn(std::io::Error),
    #[error("failed to write to session stdin: {0}")]
    Send(std::io::Error),
    #[error("session handle '{0}' is not known to this runner")]
    UnknownHandle(String),
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RunnerCapabilities {
    pub interactive: bool,
    pub permissions: bool,
    pub stream_json: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    Normal,
    Plan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskType {
    Plan,
    Execute,
}

pub struct SpawnRequest {
    pub workspace: PathBuf,
    pub env_vars: BTreeMap<String, String>,
    pub config_dir: PathBuf,
    pub mode: SessionMode,
    pub interactive: bool,
    pub task_type: TaskType,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionHandle {
    pub id: String,
    pub pid: Option<u32>,
    pub started_at_iso: DateTime<Utc>,
}

/// Messages pushed by the reader task into the bounded channel returned
/// from `spawn`. `Log` lines double as activity heartbeats for the
/// session controller's inactivity timer even when they carry no
/// parseable event (per §9: log-line arrival is the activity signal).
#[derive(Debug, Clone)]
pub enum RunnerMessage {
    Event(NibblerEvent),
    Log(String),
    Exited { code: Option<i32>, signal: Option<i32> },
}

#[async_trait]
pub trait Runner: Send + Sync {
    fn capabilities(&self) -> RunnerCapabilities;

    async fn spawn(
        &self,
        req: SpawnRequest,
    ) -> Result<(SessionHandle, mpsc::Receiver<RunnerMessage>), RunnerError>;

    async fn send(&self, handle: &SessionHandle, prompt: &str) -> Result<(), RunnerError>;

    async fn is_alive(&self, handle: &SessionHandle) -> bool;

    async fn stop(&self, handle: &SessionHandle) -> Result<(), RunnerError>;
}

struct SessionEntry {
    stdin: Option<ChildStdin>,
    pid: Option<u32>,
    alive: Arc<AtomicBool>,
}

/// The one concrete adapter: wraps a real child process. The program to
/// run is resolved once at construction (the vendor-specific wiring
/// that picks it is out of scope, §1).
pub struct ChildProcessRunner {
    program: PathBuf,
    next_id: AtomicU32,
    sessions: std::sync::Mutex<BTreeMap<String, SessionEntry>>,
}

impl ChildProcessRunner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        ChildProcessRunner {
            program: program.into(),
            next_id: AtomicU32::new(1),
            sessions: std::sync::Mutex::new(BTreeMap::new()),
        }
    }

    fn next_session_id(&self) -> String {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        format!("session-{n}")
    }
}

#[cfg(unix)]
fn place_in_own_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setsid().map_err(std::io::Error::from)?;
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn place_in_own_process_group(_cmd: &mut Command) {}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

#[cfg(unix)]
fn signal_process_group(pid: u32, term: bool) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;
    let signal = if term { Signal::SIGTERM } else { Signal::SIGKILL };
    let _ = killpg(Pid::from_raw(pid as i32), signal);
}

#[cfg(not(unix))]
fn signal_process_group(_pid: u32, _term: bool) {}

#[async_trait]
impl Runner for ChildProcessRunner {
    fn capabilities(&self) -> RunnerCapabilities {
        RunnerCapabilities {
            interactive: true,
            permissions: true,
            stream_json: true,
        }
    }

    async fn spawn(
        &self,
        req: SpawnRequest,
    ) -> Result<(SessionHandle, mpsc::Receiver<RunnerMessage>), RunnerError> {
        let mut cmd = Command::new(&self.program);
        cmd.current_dir(&req.workspace)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (k, v) in &req.env_vars {
            cmd.env(k, v);
        }
        cmd.env("NIBBLER_CONFIG_DIR", &req.config_dir);
        cmd.env(
            "NIBBLER_MODE",
            match req.mode {
                SessionMode::Normal => "normal",
                SessionMode::Plan => "plan",
            },
        );
        cmd.env(
            "NIBBLER_TASK_TYPE",
            match req.task_type {
                TaskType::Plan => "plan",
                TaskType::Execute => "execute",
            },
        );
        place_in_own_process_group(&mut cmd);

        let mut child = cmd.spawn().map_err(RunnerError::Spawn)?;
        let pid = child.id();
        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");
        let stdin = child.stdin.take();

        let id = self.next_session_id();
        let handle = SessionHandle {
            id: id.clone(),
            pid,
            started_at_iso: Utc::now(),
        };

        let (tx, rx) = mpsc::channel(256);

        let tx_out = tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let events = protocol::scan_line(&line);
                if events.is_empty() {
                    let _ = tx_out.send(RunnerMessage::Log(line)).await;
                } else {
                    for ev in events {
                        let _ = tx_out.send(RunnerMessage::Event(ev)).await;
                    }
                }
            }
        });

        let tx_err = tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let _ = tx_err.send(RunnerMessage::Log(line)).await;
            }
        });

        let alive = Arc::new(AtomicBool::new(true));
        let alive_for_waiter = alive.clone();
        let tx_exit = tx;
        tokio::spawn(async move {
            let status = child.wait().await;
            alive_for_waiter.store(false, Ordering::SeqCst);
            let (code, signal) = match status {
                Ok(s) => (s.code(), exit_signal(&s)),
                Err(_) => (None, None),
            };
            let _ = tx_exit.send(RunnerMessage::Exited { code, signal }).await;
        });

        self.sessions
            .lock()
            .unwrap()
            .insert(id, SessionEntry { stdin, pid, alive });

        Ok((handle, rx))
    }

    async fn send(&self, handle: &SessionHandle, prompt: &str) -> Result<(), RunnerError> {
        // Non-interactive mode closes stdin after the bootstrap prompt
        // (§4.6); interactive sessions keep it open for follow-ups.
        let stdin = {
            let mut sessions = self.sessions.lock().unwrap();
            let entry = sessions
                .get_mut(&handle.id)
                .ok_or_else(|| RunnerError::UnknownHandle(handle.id.clone()))?;
            entry.stdin.take()
        };
        if let Some(mut stdin) = stdin {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .map_err(RunnerError::Send)?;
            stdin.write_all(b"\n").await.map_err(RunnerError::Send)?;
            let mut sessions = self.sessions.lock().unwrap();
            if let Some(entry) = sessions.get_mut(&handle.id) {
                entry.stdin = Some(stdin);
            }
        }
        Ok(())
    }

    async fn is_alive(&self, handle: &SessionHandle) -> bool {
        let sessions = self.sessions.lock().unwrap();
        sessions
            .get(&handle.id)
            .map(|e| e.alive.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    async fn stop(&self, handle: &SessionHandle) -> Result<(), RunnerError> {
        let pid = {
            let sessions = self.sessions.lock().unwrap();
            sessions.get(&handle.id).and_then(|e| e.pid)
        };
        let Some(pid) = pid else {
            return Ok(());
        };

        signal_process_group(pid, true);
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_millis(1500);
        loop {
            if !self.is_alive(handle).await {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                signal_process_group(pid, false);
                tokio::time::sleep(std::time::Duration::from_millis(2500)).await;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        self.sessions.lock().unwrap().remove(&handle.id);
        Ok(())
    }
}
