//! SSH transport built on `russh`.

use std::sync::Arc;
use std::time::Duration;

use camino::Utf8Path;
use russh::client::{self, Handle, Msg};
use russh::keys::ssh_key::PublicKey;
use russh::keys::{PrivateKeyWithHashAlg, load_secret_key};
use russh::{Channel, ChannelMsg, Disconnect};
use tracing::{debug, info, warn};

use super::{
    ChannelEvent, ConnectionParams, EngineFuture, RemoteChannel, Session, Transport,
    TransportError,
};

/// Opens SSH sessions with `russh`.
#[derive(Clone)]
pub struct SshTransport {
    config: Arc<client::Config>,
}

impl SshTransport {
    /// Creates a transport sending keep-alives at `keep_alive` (if any).
    #[must_use]
    pub fn new(keep_alive: Option<Duration>) -> Self {
        let config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: keep_alive,
            keepalive_max: 3,
            ..client::Config::default()
        };
        Self {
            config: Arc::new(config),
        }
    }
}

impl Default for SshTransport {
    fn default() -> Self {
        Self::new(Some(Duration::from_secs(5)))
    }
}

impl Transport for SshTransport {
    type Session = SshSession;

    fn connect<'a>(
        &'a self,
        params: &'a ConnectionParams,
    ) -> EngineFuture<'a, Self::Session, TransportError> {
        Box::pin(async move {
            info!(
                host = %params.host,
                port = params.port,
                username = %params.username,
                password = params.password.is_some(),
                keys = ?params.private_key_paths,
                "attempting to connect over SSH"
            );
            let mut handle = client::connect(
                Arc::clone(&self.config),
                (params.host.as_str(), params.port),
                HostKeyPolicy,
            )
            .await
            .map_err(classify)?;

            authenticate(&mut handle, params).await?;
            Ok(SshSession { handle })
        })
    }
}

async fn authenticate(
    handle: &mut Handle<HostKeyPolicy>,
    params: &ConnectionParams,
) -> Result<(), TransportError> {
    for path in &params.private_key_paths {
        let key = load_key(path)?;
        let hash_alg = handle
            .best_supported_rsa_hash()
            .await
            .map_err(classify)?
            .flatten();
        let result = handle
            .authenticate_publickey(
                params.username.clone(),
                PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
            )
            .await
            .map_err(classify)?;
        if result.success() {
            debug!(key = %path, "public key accepted");
            return Ok(());
        }
        debug!(key = %path, "public key rejected");
    }

    if let Some(password) = &params.password {
        let result = handle
            .authenticate_password(params.username.clone(), password.clone())
            .await
            .map_err(classify)?;
        if result.success() {
            return Ok(());
        }
    }

    Err(TransportError::AuthenticationFailed {
        username: params.username.clone(),
    })
}

fn load_key(path: &Utf8Path) -> Result<russh::keys::PrivateKey, TransportError> {
    load_secret_key(path, None).map_err(|err| {
        let message = err.to_string();
        if message.to_ascii_lowercase().contains("unsupported") {
            TransportError::KeyTypeUnsupported {
                path: path.to_path_buf(),
                message,
            }
        } else {
            TransportError::KeyUnreadable {
                path: path.to_path_buf(),
                message,
            }
        }
    })
}

fn classify(err: russh::Error) -> TransportError {
    match err {
        russh::Error::IO(io_err) => TransportError::from(io_err),
        russh::Error::Disconnect => TransportError::Disconnected,
        russh::Error::ConnectionTimeout
        | russh::Error::KeepaliveTimeout
        | russh::Error::InactivityTimeout => TransportError::Timeout { seconds: 0 },
        russh::Error::NotAuthenticated => TransportError::AuthenticationFailed {
            username: String::new(),
        },
        russh::Error::ChannelOpenFailure(reason) => TransportError::ChannelOpenFailed {
            message: format!("{reason:?}"),
        },
        other => TransportError::Protocol {
            message: other.to_string(),
        },
    }
}

/// Accepts any server key; targets are disposable machines whose host keys
/// change on every rebuild.
struct HostKeyPolicy;

impl client::Handler for HostKeyPolicy {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// An authenticated `russh` client connection.
pub struct SshSession {
    handle: Handle<HostKeyPolicy>,
}

impl Session for SshSession {
    fn open_channel(&self) -> EngineFuture<'_, Box<dyn RemoteChannel>, TransportError> {
        Box::pin(async move {
            let channel = self
                .handle
                .channel_open_session()
                .await
                .map_err(classify)?;
            Ok(Box::new(SshChannel { inner: channel }) as Box<dyn RemoteChannel>)
        })
    }

    fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    fn close(&self) -> EngineFuture<'_, (), TransportError> {
        Box::pin(async move {
            self.handle
                .disconnect(Disconnect::ByApplication, "", "en")
                .await
                .map_err(classify)
        })
    }
}

struct SshChannel {
    inner: Channel<Msg>,
}

impl RemoteChannel for SshChannel {
    fn request_agent_forwarding(&mut self) -> EngineFuture<'_, (), TransportError> {
        Box::pin(async move { self.inner.agent_forward(false).await.map_err(classify) })
    }

    fn exec<'a>(&'a mut self, command: &'a str) -> EngineFuture<'a, (), TransportError> {
        Box::pin(async move { self.inner.exec(true, command).await.map_err(classify) })
    }

    fn send<'a>(&'a mut self, data: &'a [u8]) -> EngineFuture<'a, (), TransportError> {
        Box::pin(async move { self.inner.data(data).await.map_err(classify) })
    }

    fn eof(&mut self) -> EngineFuture<'_, (), TransportError> {
        Box::pin(async move { self.inner.eof().await.map_err(classify) })
    }

    fn next_event(&mut self) -> EngineFuture<'_, Option<ChannelEvent>, TransportError> {
        Box::pin(async move {
            loop {
                let event = match self.inner.wait().await {
                    Some(ChannelMsg::Data { data }) => ChannelEvent::Stdout(data.to_vec()),
                    Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                        ChannelEvent::Stderr(data.to_vec())
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        ChannelEvent::ExitStatus(exit_status)
                    }
                    Some(ChannelMsg::Eof) => ChannelEvent::Eof,
                    Some(ChannelMsg::Close) => ChannelEvent::Close,
                    Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                        warn!(signal = ?signal_name, "remote program terminated by signal");
                        continue;
                    }
                    Some(_) => continue,
                    None => return Ok(None),
                };
                return Ok(Some(event));
            }
        })
    }
}

impl From<russh::Error> for TransportError {
    fn from(value: russh::Error) -> Self {
        classify(value)
    }
}
