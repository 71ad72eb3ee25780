//! Error types you might see while provisioning containers or serving
//! terminals

use sandterm_protocol::error_code;
use thiserror::Error;

/// Errors from the container runtime
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// io error
    #[error("io error: {0}")]
    IOError(#[from] std::io::Error),

    /// runtime command exited unsuccessfully
    #[error("`{command}` failed with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: std::process::ExitStatus,
        stderr: String,
    },

    /// runtime reported success but printed no container id
    #[error("runtime did not report a container id")]
    MissingContainerId,

    /// pseudo-terminal setup failed
    #[error("pseudo-terminal error: {0}")]
    Pty(String),

    /// task join error
    #[error("task join error: {0}")]
    TaskJoinError(#[from] tokio::task::JoinError),

    /// the shell process has already gone away
    #[error("shell process is no longer running")]
    ShellClosed,
}

/// Errors while creating a session
///
/// The display strings double as the error codes reported over HTTP.
#[derive(Error, Debug)]
pub enum SessionError {
    /// the global concurrent session limit is reached
    #[error("{}", error_code::MAX_CONCURRENT_SESSIONS)]
    GlobalCapacityExceeded,

    /// this origin already holds its maximum number of sessions
    #[error("{}", error_code::MAX_SESSIONS_PER_IP)]
    OriginCapacityExceeded,

    /// the registry is closed because the server is shutting down
    #[error("{}", error_code::SHUTTING_DOWN)]
    ShuttingDown,

    /// no container could be provisioned for the session
    #[error("container creation failed: {0}")]
    ContainerCreationFailed(#[from] RuntimeError),
}

/// Errors while opening a terminal connection
#[derive(Error, Debug)]
pub enum BridgeError {
    /// unknown or inactive session, or the secret did not match
    #[error("invalid session")]
    Unauthorized,

    /// the shell could not be started
    #[error("shell could not be started: {0}")]
    Runtime(#[from] RuntimeError),
}

/// Errors that stop the server itself
#[derive(Error, Debug)]
pub enum ServerError {
    /// io error
    #[error("io error: {0}")]
    IOError(#[from] std::io::Error),

    /// task join error
    #[error("task join error: {0}")]
    TaskJoinError(#[from] tokio::task::JoinError),
}
