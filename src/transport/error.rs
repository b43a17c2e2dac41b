//! Transport error taxonomy.

use std::io;

use camino::Utf8PathBuf;
use thiserror::Error;

/// Errors raised while opening or using a transport session.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TransportError {
    /// The remote port actively refused the connection.
    #[error("connection refused")]
    ConnectionRefused,
    /// The remote side reset the connection.
    #[error("connection reset")]
    ConnectionReset,
    /// No route to the host.
    #[error("host unreachable")]
    HostUnreachable,
    /// The remote side closed the connection at the protocol level.
    #[error("remote side disconnected")]
    Disconnected,
    /// A connect or probe step exceeded its deadline.
    #[error("timed out after {seconds}s")]
    Timeout {
        /// Deadline that was exceeded, in seconds.
        seconds: u64,
    },
    /// Every configured credential was rejected.
    #[error("authentication failed for user {username}")]
    AuthenticationFailed {
        /// User that failed to authenticate.
        username: String,
    },
    /// The private key uses an algorithm the transport cannot load.
    #[error("unsupported private key type in {path}: {message}")]
    KeyTypeUnsupported {
        /// Key file that was rejected.
        path: Utf8PathBuf,
        /// Loader message.
        message: String,
    },
    /// The private key file is readable by other users.
    #[error("private key {path} has insecure permissions {mode:o}; expected 600")]
    InsecureKeyPermissions {
        /// Key file with loose permissions.
        path: Utf8PathBuf,
        /// Permission bits found on the file.
        mode: u32,
    },
    /// The private key could not be read or parsed.
    #[error("cannot read private key {path}: {message}")]
    KeyUnreadable {
        /// Key file that failed to load.
        path: Utf8PathBuf,
        /// Loader or I/O message.
        message: String,
    },
    /// The remote side refused to open a channel.
    #[error("channel open failed: {message}")]
    ChannelOpenFailed {
        /// Transport message.
        message: String,
    },
    /// Other socket-level failure.
    #[error("I/O error: {message}")]
    Io {
        /// Underlying error message.
        message: String,
    },
    /// Other protocol-level failure reported by the transport library.
    #[error("transport protocol error: {message}")]
    Protocol {
        /// Transport message.
        message: String,
    },
}

impl TransportError {
    /// Returns `true` for failures worth retrying during connect.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConnectionRefused
                | Self::ConnectionReset
                | Self::HostUnreachable
                | Self::Disconnected
                | Self::Timeout { .. }
        )
    }
}

impl From<io::Error> for TransportError {
    fn from(value: io::Error) -> Self {
        match value.kind() {
            io::ErrorKind::ConnectionRefused => Self::ConnectionRefused,
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => {
                Self::ConnectionReset
            }
            io::ErrorKind::HostUnreachable | io::ErrorKind::NetworkUnreachable => {
                Self::HostUnreachable
            }
            io::ErrorKind::TimedOut => Self::Timeout { seconds: 0 },
            io::ErrorKind::UnexpectedEof | io::ErrorKind::BrokenPipe => Self::Disconnected,
            _ => Self::Io {
                message: value.to_string(),
            },
        }
    }
}
