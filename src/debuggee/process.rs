//! Runtime process supervision
//!
//! Spawns the build-tool wrapper that starts the runtime, pumps its output to
//! the front end as `output` events and reports its exit exactly once.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::config::{RelayConfig, SessionConfig};
use crate::protocol::Event;
use crate::session::Outbound;
use crate::utils::chunk_to_text;
use crate::{Error, Result};

/// How long to keep draining output after the process is gone. Grandchildren
/// (e.g. a build daemon) can hold the pipes open indefinitely.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

const OUTPUT_CHUNK_SIZE: usize = 8 * 1024;

/// Command line for the runtime process
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

impl LaunchSpec {
    pub fn new<I, S>(program: impl Into<PathBuf>, args: I, cwd: impl Into<PathBuf>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            cwd: cwd.into(),
        }
    }

    /// Gradle invocation that runs the project with its debug server
    pub fn gradle(session: &SessionConfig, relay: &RelayConfig) -> Self {
        let mut args = vec![
            format!("-PvnRoot={}", session.project_folder.display()),
            relay.gradle_task.clone(),
        ];
        if let Some(home) = &session.runtime_home {
            args.push(format!("-Dorg.gradle.java.home={}", home.display()));
        }

        Self {
            program: find_wrapper(&session.build_tools_folder),
            args,
            cwd: session.build_tools_folder.clone(),
        }
    }
}

/// Platform name of the build-tool wrapper script
pub fn wrapper_name() -> &'static str {
    if cfg!(windows) {
        "gradlew.bat"
    } else {
        "gradlew"
    }
}

/// Locate the wrapper inside the build-tools folder
fn find_wrapper(build_tools_folder: &Path) -> PathBuf {
    match which::which_in(wrapper_name(), Some(build_tools_folder), build_tools_folder) {
        Ok(path) => path,
        Err(e) => {
            tracing::debug!(
                "Wrapper not found as executable in {:?} ({}), using plain path",
                build_tools_folder,
                e
            );
            build_tools_folder.join(wrapper_name())
        }
    }
}

/// How the runtime process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code; `None` when ended by a signal
    pub code: Option<i32>,
}

/// Shared view of the runtime process
#[derive(Debug, Clone)]
pub struct ChildHandle {
    pid: Option<u32>,
    exit: Arc<Mutex<Option<ProcessExit>>>,
}

impl ChildHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Exit code, absent until the process exits
    pub fn exit_code(&self) -> Option<i32> {
        self.exit.lock().and_then(|e| e.code)
    }

    pub fn has_exited(&self) -> bool {
        self.exit.lock().is_some()
    }
}

/// Owns the runtime process
pub struct ProcessSupervisor {
    handle: ChildHandle,
    kill_tx: Option<oneshot::Sender<()>>,
}

impl ProcessSupervisor {
    /// Spawn the process and start pumping its output into `outbound`.
    ///
    /// The returned receiver resolves once, when the process exits.
    pub fn spawn(
        spec: &LaunchSpec,
        outbound: Outbound,
    ) -> Result<(Self, oneshot::Receiver<ProcessExit>)> {
        tracing::info!(
            "Spawning runtime: {:?} {:?} in {:?}",
            spec.program,
            spec.args,
            spec.cwd
        );

        let mut child = tokio::process::Command::new(&spec.program)
            .args(&spec.args)
            .current_dir(&spec.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Spawn(format!("{:?}: {}", spec.program, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Spawn("Failed to capture stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Spawn("Failed to capture stderr".to_string()))?;

        let pumps = [
            pump_output(stdout, "stdout", outbound.clone()),
            pump_output(stderr, "stderr", outbound),
        ];

        let handle = ChildHandle {
            pid: child.id(),
            exit: Arc::new(Mutex::new(None)),
        };
        tracing::info!("Runtime started with pid {:?}", handle.pid);

        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (exit_tx, exit_rx) = oneshot::channel();
        let exit_cell = handle.exit.clone();

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    tracing::debug!("Killing runtime process");
                    if let Err(e) = child.start_kill() {
                        tracing::warn!("Failed to kill runtime: {}", e);
                    }
                    child.wait().await
                }
            };

            let exit = ProcessExit {
                code: match status {
                    Ok(status) => status.code(),
                    Err(e) => {
                        tracing::warn!("Failed to wait for runtime: {}", e);
                        None
                    }
                },
            };
            tracing::info!("Runtime exited: {:?}", exit);
            // Visible to liveness checks now; the exit signal waits for the output
            *exit_cell.lock() = Some(exit);

            for pump in pumps {
                if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, pump).await.is_err() {
                    tracing::debug!("Output pipe still open after exit, detaching");
                }
            }

            let _ = exit_tx.send(exit);
        });

        Ok((
            Self {
                handle,
                kill_tx: Some(kill_tx),
            },
            exit_rx,
        ))
    }

    pub fn handle(&self) -> ChildHandle {
        self.handle.clone()
    }

    /// Kill the process. Returns `true` only when a kill was actually
    /// requested; later calls, or calls after the process exited, do nothing.
    pub fn kill(&mut self) -> bool {
        match self.kill_tx.take() {
            Some(tx) if !self.handle.has_exited() => tx.send(()).is_ok(),
            _ => false,
        }
    }
}

fn pump_output<R>(mut stream: R, category: &'static str, outbound: Outbound) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; OUTPUT_CHUNK_SIZE];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => outbound.send_event(Event::output(category, chunk_to_text(&buf[..n]))),
                Err(e) => {
                    tracing::debug!("Error reading runtime {}: {}", category, e);
                    break;
                }
            }
        }
    })
}
