//! Transport Session abstraction.
//!
//! A [`Transport`] opens authenticated [`Session`]s to one endpoint; a session
//! hands out [`RemoteChannel`]s, each of which runs exactly one remote program
//! and reports its output and exit status as [`ChannelEvent`]s. The production
//! implementation lives in [`ssh`]; tests drive the engine through
//! [`crate::test_support::ScriptedTransport`].

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use camino::Utf8PathBuf;

mod error;
pub mod keys;
pub mod ssh;

pub use error::TransportError;

/// Future returned by engine trait methods.
pub type EngineFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Connection parameters for one remote endpoint.
#[derive(Clone, Eq, PartialEq)]
pub struct ConnectionParams {
    /// Hostname or address of the target.
    pub host: String,
    /// TCP port of the remote shell service.
    pub port: u16,
    /// User to authenticate as.
    pub username: String,
    /// Private keys tried in order during authentication.
    pub private_key_paths: Vec<Utf8PathBuf>,
    /// Optional password used when no key authenticates.
    pub password: Option<String>,
}

impl ConnectionParams {
    /// Creates parameters for `username@host:port` with no credentials.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            private_key_paths: Vec::new(),
            password: None,
        }
    }

    /// Adds a private key path.
    #[must_use]
    pub fn with_private_key(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.private_key_paths.push(path.into());
        self
    }

    /// Sets the password.
    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Renders `user@host:port` for diagnostics and target names.
    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }
}

impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("private_key_paths", &self.private_key_paths)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// One signal received on a channel.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ChannelEvent {
    /// Bytes written by the remote program to stdout.
    Stdout(Vec<u8>),
    /// Bytes written to the extended-data (stderr) stream.
    Stderr(Vec<u8>),
    /// Out-of-band exit status of the remote program.
    ExitStatus(u32),
    /// The remote side will send no more data.
    Eof,
    /// The channel is closed.
    Close,
}

/// Opens sessions to a remote endpoint.
pub trait Transport: Send + Sync {
    /// Session type produced by this transport.
    type Session: Session;

    /// Connects and authenticates once. Retries are the caller's concern.
    fn connect<'a>(
        &'a self,
        params: &'a ConnectionParams,
    ) -> EngineFuture<'a, Self::Session, TransportError>;
}

/// An open, authenticated connection.
pub trait Session: Send + Sync {
    /// Opens a fresh channel on this session.
    fn open_channel(&self) -> EngineFuture<'_, Box<dyn RemoteChannel>, TransportError>;

    /// Reports whether the underlying connection is known to be closed.
    fn is_closed(&self) -> bool;

    /// Disconnects the session.
    fn close(&self) -> EngineFuture<'_, (), TransportError>;
}

/// One exec channel within a session.
pub trait RemoteChannel: Send {
    /// Asks the remote side to forward the local authentication agent.
    fn request_agent_forwarding(&mut self) -> EngineFuture<'_, (), TransportError>;

    /// Starts `command` on the remote side.
    fn exec<'a>(&'a mut self, command: &'a str) -> EngineFuture<'a, (), TransportError>;

    /// Writes `data` to the remote program's stdin.
    fn send<'a>(&'a mut self, data: &'a [u8]) -> EngineFuture<'a, (), TransportError>;

    /// Signals end of input.
    fn eof(&mut self) -> EngineFuture<'_, (), TransportError>;

    /// Waits for the next event; `None` once the channel is gone.
    fn next_event(&mut self) -> EngineFuture<'_, Option<ChannelEvent>, TransportError>;
}
