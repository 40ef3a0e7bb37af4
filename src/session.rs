//! Session Controller (C7). Starts a session via the runner, writes a
//! role-specific permissions overlay, awaits a terminal protocol event
//! or inactivity/absolute timeout, and returns a typed outcome.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::contract::Budget;
use crate::protocol::NibblerEvent;
use crate::runner::{Runner, RunnerError, RunnerMessage, SessionHandle, SpawnRequest};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Runner(#[from] RunnerError),
    #[error("failed to write permissions overlay: {0}")]
    Overlay(std::io::Error),
}

#[derive(Debug)]
pub enum SessionOutcome {
    Event(NibblerEvent),
    ProcessExit { code: Option<i32>, signal: Option<i32> },
    InactiveTimeout,
    BudgetExceeded,
}

pub struct SessionController {
    runner: Arc<dyn Runner>,
    inactivity_interval: Duration,
}

impl SessionController {
    pub fn new(runner: Arc<dyn Runner>, inactivity_interval: Duration) -> Self {
        SessionController { runner, inactivity_interval }
    }

    /// Clears stale overlays for every role, then writes the one for
    /// `role_id`. Overlays live at `.cursor/rules/20-role-<id>.mdc`
    /// inside the workspace so the runner (which reads workspace-local
    /// rule files) sees exactly one active role's permissions per
    /// session.
    fn install_permissions_overlay(
        &self,
        workspace: &Path,
        role_id: &str,
        writable_patterns: &[String],
    ) -> Result<(), SessionError> {
        let rules_dir = workspace.join(".cursor/rules");
        std::fs::create_dir_all(&rules_dir).map_err(SessionError::Overlay)?;

        if let Ok(entries) = std::fs::read_dir(&rules_dir) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with("20-role-") && name.ends_with(".mdc") {
                    let _ = std::fs::remove_file(entry.path());
                }
            }
        }

        let overlay_path = rules_dir.join(format!("20-role-{role_id}.mdc"));
        let mut body = format!("# role: {role_id}\n\nWritable paths for this session:\n\n");
        for pattern in writable_patterns {
            body.push_str(&format!("- `{pattern}`\n"));
        }
        std::fs::write(&overlay_path, body).map_err(SessionError::Overlay)?;
        Ok(())
    }

    /// Starts a session: installs the overlay, spawns via the runner,
    /// sends the bootstrap prompt as the first message.
    #[allow(clippy::too_many_arguments)]
    pub async fn start_session(
        &self,
        role_id: &str,
        writable_patterns: &[String],
        req: SpawnRequest,
        bootstrap_prompt: &str,
    ) -> Result<(SessionHandle, mpsc::Receiver<RunnerMessage>), SessionError> {
        self.install_permissions_overlay(&req.workspace, role_id, writable_patterns)?;
        let (handle, rx) = self.runner.spawn(req).await?;
        self.runner.send(&handle, bootstrap_prompt).await?;
        Ok((handle, rx))
    }

    /// Waits for a terminal event, a process exit, an inactivity
    /// timeout, or the role budget's absolute deadline — whichever
    /// comes first. `on_heartbeat` is invoked on every event or log
    /// line so the caller can persist `lastActivityAtIso`.
    pub async fn wait_for_completion<F: FnMut()>(
        &self,
        mut rx: mpsc::Receiver<RunnerMessage>,
        budget: &Budget,
        mut on_heartbeat: F,
    ) -> SessionOutcome {
        let start = Instant::now();
        let abs_deadline = budget.max_time_ms.map(|ms| start + Duration::from_millis(ms));

        loop {
            let inactivity_timer = tokio::time::sleep(self.inactivity_interval);
            let deadline_timer = async {
                match abs_deadline {
                    Some(d) => tokio::time::sleep_until(d).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                maybe_msg = rx.recv() => {
                    match maybe_msg {
                        Some(RunnerMessage::Event(ev)) => {
                            on_heartbeat();
                            if ev.is_terminal() {
                                return SessionOutcome::Event(ev);
                            }
                        }
                        Some(RunnerMessage::Log(_)) => {
                            on_heartbeat();
                        }
                        Some(RunnerMessage::Exited { code, signal }) => {
                            return SessionOutcome::ProcessExit { code, signal };
                        }
                        None => {
                            return SessionOutcome::ProcessExit { code: None, signal: None };
                        }
                    }
                }
                _ = inactivity_timer => {
                    return SessionOutcome::InactiveTimeout;
                }
                _ = deadline_timer => {
                    return SessionOutcome::BudgetExceeded;
                }
            }
        }
    }

    /// Idempotent: always drains nothing further, just asks the runner
    /// to terminate the process (gracefully, then forcefully).
    pub async fn stop_session(&self, handle: &SessionHandle) -> Result<(), SessionError> {
        self.runner.stop(handle).await?;
        Ok(())
    }
}
