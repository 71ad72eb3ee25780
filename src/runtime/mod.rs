//! Container runtimes, and the interactive shells they run
//!
//! The pool, session registry and terminal bridge only ever talk to a
//! [Runtime]. [DockerRuntime] is the production implementation.

mod docker;
mod pty;

pub use docker::{DockerRuntime, DockerRuntimeBuilder};

use crate::errors::RuntimeError;
use async_trait::async_trait;
use bytes::Bytes;
use sandterm_protocol::TerminalSize;
use std::{borrow::Borrow, fmt};
use tokio::sync::mpsc;

/// Output chunks buffered between a shell and its consumer
const SHELL_EVENT_BUFFER: usize = 64;

/// Something that can create, destroy, and run shells inside sandbox
/// containers
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Start a new hardened container, idle and ready for a session
    async fn create(&self) -> Result<ContainerId, RuntimeError>;

    /// Remove a container and everything in its scratch space
    ///
    /// Destroying a container that is already gone succeeds.
    async fn destroy(&self, id: &ContainerId) -> Result<(), RuntimeError>;

    /// Start an interactive shell inside a running container
    async fn exec(&self, id: &ContainerId, size: TerminalSize) -> Result<Shell, RuntimeError>;
}

/// Identifier of one container, as assigned by the runtime
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ContainerId(String);

impl ContainerId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        ContainerId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for ContainerId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ContainerId {
    fn from(id: &str) -> Self {
        ContainerId::new(id)
    }
}

/// Status of an exited shell
///
/// Much like [std::process::ExitStatus]
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ExitStatus {
    code: u32,
    signal: Option<String>,
}

impl ExitStatus {
    pub fn new(code: u32, signal: Option<String>) -> Self {
        ExitStatus { code, signal }
    }

    pub fn success(&self) -> bool {
        self.code == 0
    }

    pub fn code(&self) -> u32 {
        self.code
    }

    /// Name of the signal that ended the shell, if any
    pub fn signal(&self) -> Option<&str> {
        self.signal.as_deref()
    }
}

/// Something a running shell did
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ShellEvent {
    /// Bytes the shell wrote to its terminal
    Output(Bytes),
    /// The shell exited; no further events follow
    Exited(ExitStatus),
}

/// Requests from a [Shell] handle to whatever is running the process
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ShellControl {
    Input(String),
    Resize(TerminalSize),
    Kill,
}

/// Handle to an interactive shell running under a pseudo-terminal
///
/// Dropping the handle kills the process, so a shell never outlives the
/// connection it was started for.
#[derive(Debug)]
pub struct Shell {
    events: mpsc::Receiver<ShellEvent>,
    control: mpsc::UnboundedSender<ShellControl>,
}

/// The process side of a [Shell]
///
/// A runtime sends events into `events` and acts on requests arriving on
/// `control`. When every [ShellControl] sender is gone the process should be
/// killed.
#[derive(Debug)]
pub struct ShellPeer {
    pub events: mpsc::Sender<ShellEvent>,
    pub control: mpsc::UnboundedReceiver<ShellControl>,
}

impl Shell {
    /// Create a connected handle and process side
    pub fn pair() -> (Shell, ShellPeer) {
        let (event_tx, event_rx) = mpsc::channel(SHELL_EVENT_BUFFER);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        (
            Shell {
                events: event_rx,
                control: control_tx,
            },
            ShellPeer {
                events: event_tx,
                control: control_rx,
            },
        )
    }

    /// Wait for the next output chunk or the exit status
    ///
    /// Returns `None` once the process side has gone away.
    pub async fn next_event(&mut self) -> Option<ShellEvent> {
        self.events.recv().await
    }

    /// Send literal input to the shell's terminal
    pub fn write(&self, text: &str) -> Result<(), RuntimeError> {
        self.send(ShellControl::Input(text.to_string()))
    }

    /// Change the dimensions of the shell's terminal
    pub fn resize(&self, size: TerminalSize) -> Result<(), RuntimeError> {
        self.send(ShellControl::Resize(size))
    }

    /// Kill the shell process if it is still running
    pub fn kill(&self) {
        let _ = self.send(ShellControl::Kill);
    }

    fn send(&self, request: ShellControl) -> Result<(), RuntimeError> {
        self.control
            .send(request)
            .map_err(|_| RuntimeError::ShellClosed)
    }
}

impl Drop for Shell {
    fn drop(&mut self) {
        self.kill();
    }
}
