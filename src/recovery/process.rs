//! Process control capability
//!
//! Restarting the data-store service and running isolated worker commands
//! are the only places the recovery subsystem touches the host OS. Both go
//! through `ProcessController` so the orchestration logic can be exercised
//! without spawning anything.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// A command to run as a child process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub current_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new<P: Into<PathBuf>>(program: P) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
        }
    }

    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// A running child process.
pub trait ProcessHandle: Send {
    fn id(&self) -> Option<u32>;

    /// Wait for completion; kill the child and fail if `timeout` elapses first.
    fn wait_timeout(self: Box<Self>, timeout: Duration) -> Result<ProcessOutput>;
}

pub trait ProcessController: Send + Sync {
    /// Stop, wait, start.
    fn restart(&self, service: &str) -> Result<()>;

    fn run_detached(&self, command: &CommandSpec) -> Result<Box<dyn ProcessHandle>>;
}

/// Shell commands used to restart one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceCommands {
    pub stop: String,
    pub start: String,
    #[serde(default = "default_stop_wait_secs")]
    pub stop_wait_secs: u64,
}

fn default_stop_wait_secs() -> u64 {
    2
}

/// Runs real OS processes.
#[derive(Debug, Clone, Default)]
pub struct SystemProcessController {
    services: HashMap<String, ServiceCommands>,
}

impl SystemProcessController {
    pub fn new(services: HashMap<String, ServiceCommands>) -> Self {
        Self { services }
    }

    fn shell(command: &str) -> Command {
        if cfg!(windows) {
            let mut cmd = Command::new("cmd");
            cmd.args(["/C", command]);
            cmd
        } else {
            let mut cmd = Command::new("sh");
            cmd.args(["-c", command]);
            cmd
        }
    }

    fn run_shell(command: &str) -> Result<()> {
        debug!(command, "Running shell command");
        let output = Self::shell(command)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| Error::Process(format!("{}: {}", command, e)))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Error::Process(format!(
                "'{}' exited with {}: {}",
                command,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

impl ProcessController for SystemProcessController {
    fn restart(&self, service: &str) -> Result<()> {
        let commands = self.services.get(service).ok_or_else(|| {
            Error::Process(format!("no restart commands configured for '{}'", service))
        })?;

        info!(service, "Restarting service");
        if let Err(e) = Self::run_shell(&commands.stop) {
            // The service may already be down; starting it is what matters.
            warn!(service, error = %e, "Stop command failed");
        }
        thread::sleep(Duration::from_secs(commands.stop_wait_secs));
        Self::run_shell(&commands.start)?;
        info!(service, "Service restarted");
        Ok(())
    }

    fn run_detached(&self, command: &CommandSpec) -> Result<Box<dyn ProcessHandle>> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &command.current_dir {
            cmd.current_dir(dir);
        }
        let child = cmd
            .spawn()
            .map_err(|e| Error::Process(format!("{}: {}", command.program.display(), e)))?;
        debug!(pid = child.id(), program = %command.program.display(), "Spawned worker");
        Ok(Box::new(ChildHandle::new(child)))
    }
}

/// `std::process::Child` with its output drained on background threads so a
/// chatty child can never block on a full pipe.
struct ChildHandle {
    child: Child,
    stdout: Option<thread::JoinHandle<String>>,
    stderr: Option<thread::JoinHandle<String>>,
}

impl ChildHandle {
    fn new(mut child: Child) -> Self {
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);
        Self {
            child,
            stdout,
            stderr,
        }
    }
}

fn drain<R: Read + Send + 'static>(mut reader: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).to_string()
    })
}

fn collect(handle: Option<thread::JoinHandle<String>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}

impl ProcessHandle for ChildHandle {
    fn id(&self) -> Option<u32> {
        Some(self.child.id())
    }

    fn wait_timeout(mut self: Box<Self>, timeout: Duration) -> Result<ProcessOutput> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.child.try_wait()? {
                return Ok(ProcessOutput {
                    success: status.success(),
                    code: status.code(),
                    stdout: collect(self.stdout.take()),
                    stderr: collect(self.stderr.take()),
                });
            }
            if Instant::now() >= deadline {
                warn!(pid = self.child.id(), "Worker timed out, killing");
                let _ = self.child.kill();
                let _ = self.child.wait();
                return Err(Error::Process(format!(
                    "worker did not finish within {}s",
                    timeout.as_secs()
                )));
            }
            thread::sleep(Duration::from_millis(50));
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_run_detached_captures_output() {
        let controller = SystemProcessController::default();
        let spec = CommandSpec::new("sh").args(["-c", "echo out; echo err >&2; exit 3"]);
        let output = controller
            .run_detached(&spec)
            .unwrap()
            .wait_timeout(Duration::from_secs(10))
            .unwrap();
        assert!(!output.success);
        assert_eq!(output.code, Some(3));
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }

    #[test]
    fn test_timeout_kills_worker() {
        let controller = SystemProcessController::default();
        let spec = CommandSpec::new("sleep").arg("30");
        let started = Instant::now();
        let result = controller
            .run_detached(&spec)
            .unwrap()
            .wait_timeout(Duration::from_millis(200));
        assert!(matches!(result, Err(Error::Process(_))));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_restart_requires_configuration() {
        let controller = SystemProcessController::default();
        assert!(matches!(controller.restart("postgresql"), Err(Error::Process(_))));
    }

    #[test]
    fn test_restart_runs_stop_then_start() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("started");
        let mut services = HashMap::new();
        services.insert(
            "db".to_string(),
            ServiceCommands {
                stop: "exit 1".to_string(),
                start: format!("touch {}", marker.display()),
                stop_wait_secs: 0,
            },
        );
        SystemProcessController::new(services).restart("db").unwrap();
        assert!(marker.exists());
    }
}
