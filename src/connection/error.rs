//! Errors raised by the connection manager.

use thiserror::Error;

use crate::exec::OutputStream;
use crate::transfer::TransferError;
use crate::transport::TransportError;

/// Failure to establish a session.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ConnectError {
    /// Every attempt failed with a transient error.
    #[error("could not connect to {host}:{port} after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Target host.
        host: String,
        /// Target port.
        port: u16,
        /// Attempts made.
        attempts: u32,
        /// Error of the final attempt.
        #[source]
        last: TransportError,
    },
    /// A non-retryable failure.
    #[error("cannot connect to {host}:{port}: {source}")]
    Terminal {
        /// Target host.
        host: String,
        /// Target port.
        port: u16,
        /// Underlying failure.
        source: TransportError,
    },
}

impl ConnectError {
    /// Transport error behind this failure.
    #[must_use]
    pub const fn transport_error(&self) -> &TransportError {
        match self {
            Self::RetriesExhausted { last, .. } => last,
            Self::Terminal { source, .. } => source,
        }
    }
}

/// Errors surfaced by `execute`, `sudo`, `test`, `upload` and `download`.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CommunicatorError {
    /// No session could be established.
    #[error(transparent)]
    Connect(#[from] ConnectError),
    /// The transport failed while a command was in flight.
    #[error("transport failed while running `{command}`: {source}")]
    Transport {
        /// Command that was running.
        command: String,
        /// Underlying failure.
        source: TransportError,
    },
    /// The channel closed without an exit-status signal.
    #[error("`{command}` finished without reporting an exit status")]
    MissingExitStatus {
        /// Command that was running.
        command: String,
    },
    /// Marker mode was on and a stream never carried the marker token.
    #[error("marker token missing from {stream} of `{command}`")]
    MarkerNotFound {
        /// Command that was running.
        command: String,
        /// Stream lacking the marker.
        stream: OutputStream,
    },
    /// The exit status could not be represented.
    #[error("`{command}` reported out-of-range exit status {status}")]
    ExitStatusOutOfRange {
        /// Command that was running.
        command: String,
        /// Raw status.
        status: u32,
    },
    /// The command exited nonzero under [`crate::exec::ErrorPolicy::Check`].
    #[error("`{command}` exited with status {exit_code}")]
    CommandFailed {
        /// Command that failed.
        command: String,
        /// Exit code reported.
        exit_code: i32,
        /// Captured standard output.
        stdout: String,
        /// Captured standard error.
        stderr: String,
    },
    /// A file transfer failed.
    #[error(transparent)]
    Transfer(#[from] TransferError),
    /// The login shell started but could not run an empty command.
    #[error("the shell `{shell}` exited with status {exit_code} on an empty command; check the configured shell")]
    InvalidShell {
        /// Shell program that was started.
        shell: String,
        /// Exit code it reported.
        exit_code: i32,
    },
}
