//! Connection manager: owns the single session of one target.
//!
//! The manager decides between reusing the cached session and opening a new
//! one. Reuse is gated by a zero-length probe command; a failing probe drops
//! the session and a fresh one is opened without the caller noticing. Only the
//! connect step is retried, and only for transient transport failures.

use std::time::Duration;

use camino::Utf8Path;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, info, warn};

use crate::exec::{ChannelExecutor, Command, CommandOutput, ErrorPolicy, ExecError};
use crate::transfer::{self, TransferError};
use crate::transport::keys::verify_key_permissions;
use crate::transport::{
    ChannelEvent, ConnectionParams, RemoteChannel, Session, Transport, TransportError,
};

mod error;

pub use error::{CommunicatorError, ConnectError};

/// Upper bound on the staleness probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Floor on the pause between readiness checks.
const READY_INTERVAL: Duration = Duration::from_millis(500);

/// Command printing the forwarded agent socket path on its own line.
const AGENT_SOCKET_QUERY: &str = "echo; printf $SSH_AUTH_SOCK";

/// Connect retry settings.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    /// Attempts made for transient failures; values below one count as one.
    pub max_tries: u32,
    /// Pause between attempts.
    pub retry_delay: Duration,
    /// Deadline for one connect attempt.
    pub connect_timeout: Duration,
    /// Pause after a successful connect before the session is used.
    pub settle_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_tries: 5,
            retry_delay: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(15),
            settle_delay: Duration::from_millis(500),
        }
    }
}

struct SessionSlot<S> {
    session: Option<S>,
    last_used: Option<Instant>,
}

/// Reuses or (re)creates the session of one target and runs commands on it.
pub struct ConnectionManager<T: Transport> {
    transport: T,
    params: ConnectionParams,
    executor: ChannelExecutor,
    policy: RetryPolicy,
    idle_probe: Duration,
    repair_keys: bool,
    slot: Mutex<SessionSlot<T::Session>>,
}

impl<T: Transport> ConnectionManager<T> {
    /// Creates a manager with the default retry policy.
    #[must_use]
    pub fn new(transport: T, params: ConnectionParams, executor: ChannelExecutor) -> Self {
        Self {
            transport,
            params,
            executor,
            policy: RetryPolicy::default(),
            idle_probe: Duration::ZERO,
            repair_keys: true,
            slot: Mutex::new(SessionSlot {
                session: None,
                last_used: None,
            }),
        }
    }

    /// Replaces the retry policy.
    #[must_use]
    pub const fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Probes the cached session only after it sat idle for `idle`.
    /// `Duration::ZERO` probes before every reuse.
    #[must_use]
    pub const fn with_idle_probe(mut self, idle: Duration) -> Self {
        self.idle_probe = idle;
        self
    }

    /// Controls whether loose key permissions are tightened before failing.
    #[must_use]
    pub const fn with_key_repair(mut self, repair: bool) -> Self {
        self.repair_keys = repair;
        self
    }

    /// Connection parameters of the target.
    #[must_use]
    pub const fn params(&self) -> &ConnectionParams {
        &self.params
    }

    /// Channel executor used for every command.
    #[must_use]
    pub const fn executor(&self) -> &ChannelExecutor {
        &self.executor
    }

    /// Retry policy applied to connects.
    #[must_use]
    pub const fn retry_policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Makes sure a usable session exists, opening one if needed.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError`] when no session can be established.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        let mut slot = self.slot.lock().await;
        self.session(&mut slot).await.map(|_| ())
    }

    /// Connects once and checks that the login shell runs an empty command
    /// successfully.
    ///
    /// Returns `Ok(false)` while the machine is not reachable yet.
    ///
    /// # Errors
    ///
    /// Returns [`CommunicatorError::InvalidShell`] when the shell starts but
    /// rejects the empty command, and [`CommunicatorError::Connect`] for
    /// failures that waiting cannot fix (unusable keys, unsupported key types).
    pub async fn ready(&self) -> Result<bool, CommunicatorError> {
        debug!(endpoint = %self.params.endpoint(), "checking whether the target is ready");
        let mut slot = self.slot.lock().await;
        self.check_ready(&mut slot, self.policy.max_tries).await
    }

    /// Polls [`ConnectionManager::ready`] with single connect attempts until
    /// the target answers or `deadline` passes.
    ///
    /// Refused, reset and timed-out connections as well as rejected
    /// credentials are retried, since a booting machine may not have its keys
    /// installed yet. Returns `Ok(false)` when the deadline passes.
    ///
    /// # Errors
    ///
    /// Same as [`ConnectionManager::ready`].
    pub async fn wait_for_ready(&self, deadline: Duration) -> Result<bool, CommunicatorError> {
        info!(
            endpoint = %self.params.endpoint(),
            ?deadline,
            "waiting for the target to become ready"
        );
        let interval = self.policy.retry_delay.max(READY_INTERVAL);
        let poll = async {
            loop {
                let mut slot = self.slot.lock().await;
                if self.check_ready(&mut slot, 1).await? {
                    return Ok::<_, CommunicatorError>(true);
                }
                drop(slot);
                sleep(interval).await;
            }
        };
        match timeout(deadline, poll).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(endpoint = %self.params.endpoint(), "target did not become ready in time");
                Ok(false)
            }
        }
    }

    async fn check_ready(
        &self,
        slot: &mut MutexGuard<'_, SessionSlot<T::Session>>,
        attempts: u32,
    ) -> Result<bool, CommunicatorError> {
        if let Err(err) = self.session_with(slot, attempts).await {
            if !worth_waiting_for(&err) {
                return Err(err.into());
            }
            info!(error = %err, "target not ready");
            return Ok(false);
        }
        let check = Command::new("").error_policy(ErrorPolicy::Ignore);
        match self.execute_on(slot, &check, None).await {
            Ok(output) if output.exit_code == 0 => {
                info!(endpoint = %self.params.endpoint(), "target is ready");
                Ok(true)
            }
            Ok(output) => Err(CommunicatorError::InvalidShell {
                shell: self.executor.shell_command(&check),
                exit_code: output.exit_code,
            }),
            Err(
                err @ (CommunicatorError::Transport { .. }
                | CommunicatorError::MissingExitStatus { .. }),
            ) => {
                info!(error = %err, "target not ready");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Reports whether a session is currently cached and not known closed.
    pub async fn is_connected(&self) -> bool {
        self.slot
            .lock()
            .await
            .session
            .as_ref()
            .is_some_and(|session| !session.is_closed())
    }

    /// Disconnects and forgets the cached session.
    ///
    /// # Errors
    ///
    /// Returns [`CommunicatorError::Transport`] when the disconnect itself
    /// fails; the session is forgotten either way.
    pub async fn close(&self) -> Result<(), CommunicatorError> {
        let mut slot = self.slot.lock().await;
        let Some(session) = slot.session.take() else {
            return Ok(());
        };
        info!(endpoint = %self.params.endpoint(), "closing session");
        if session.is_closed() {
            return Ok(());
        }
        session
            .close()
            .await
            .map_err(|source| CommunicatorError::Transport {
                command: String::from("<disconnect>"),
                source,
            })
    }

    /// Runs `command` and applies its error policy.
    ///
    /// # Errors
    ///
    /// Returns [`CommunicatorError::Connect`] when no session is available,
    /// protocol errors from the executor, and
    /// [`CommunicatorError::CommandFailed`] for exit codes outside
    /// [`Command::good_exit`] under [`ErrorPolicy::Check`]. Failures after the
    /// command started are never retried.
    pub async fn run(&self, command: Command) -> Result<CommandOutput, CommunicatorError> {
        let mut slot = self.slot.lock().await;
        let auth_sock = if self.executor.settings().forward_agent && command.is_privileged() {
            self.agent_socket(&mut slot).await?
        } else {
            None
        };
        let output = self
            .execute_on(&mut slot, &command, auth_sock.as_deref())
            .await?;
        drop(slot);

        if command.policy() == ErrorPolicy::Check && !command.accepts(output.exit_code) {
            warn!(command = %command.text(), exit_code = output.exit_code, "command failed");
            return Err(CommunicatorError::CommandFailed {
                command: command.text().to_owned(),
                exit_code: output.exit_code,
                stdout: output.stdout,
                stderr: output.stderr,
            });
        }
        Ok(output)
    }

    /// Copies a local file or directory to `remote`.
    ///
    /// # Errors
    ///
    /// Returns [`CommunicatorError::Transfer`] for transfer failures and
    /// [`CommunicatorError::Connect`] when no session is available.
    pub async fn upload(&self, local: &Utf8Path, remote: &str) -> Result<(), CommunicatorError> {
        debug!(from = %local, to = remote, "uploading");
        let mut slot = self.slot.lock().await;
        let mut channel = self.open_channel(&mut slot, "scp -t").await?;
        let result = transfer::upload(channel.as_mut(), local, remote).await;
        self.settle_transfer(&mut slot, result)
    }

    /// Copies the remote file `remote` to `local`.
    ///
    /// # Errors
    ///
    /// Returns [`CommunicatorError::Transfer`] for transfer failures and
    /// [`CommunicatorError::Connect`] when no session is available.
    pub async fn download(&self, remote: &str, local: &Utf8Path) -> Result<(), CommunicatorError> {
        debug!(from = remote, to = %local, "downloading");
        let mut slot = self.slot.lock().await;
        let mut channel = self.open_channel(&mut slot, "scp -f").await?;
        let result = transfer::download(channel.as_mut(), remote, local).await;
        self.settle_transfer(&mut slot, result)
    }

    fn settle_transfer(
        &self,
        slot: &mut MutexGuard<'_, SessionSlot<T::Session>>,
        result: Result<(), TransferError>,
    ) -> Result<(), CommunicatorError> {
        if matches!(result, Err(TransferError::Transport(_))) {
            warn!(endpoint = %self.params.endpoint(), "discarding session after transfer failure");
            slot.session = None;
        } else {
            slot.last_used = Some(Instant::now());
        }
        result.map_err(CommunicatorError::from)
    }

    async fn agent_socket(
        &self,
        slot: &mut MutexGuard<'_, SessionSlot<T::Session>>,
    ) -> Result<Option<String>, CommunicatorError> {
        let query = Command::new(AGENT_SOCKET_QUERY).error_policy(ErrorPolicy::Ignore);
        let output = self.execute_on(slot, &query, None).await?;
        let socket = output
            .stdout
            .lines()
            .last()
            .map(str::trim)
            .unwrap_or_default()
            .to_owned();
        if socket.is_empty() {
            warn!("agent forwarding requested but SSH_AUTH_SOCK is empty on the target");
            return Ok(None);
        }
        debug!(socket = %socket, "forwarding agent socket into privileged shell");
        Ok(Some(socket))
    }

    async fn open_channel(
        &self,
        slot: &mut MutexGuard<'_, SessionSlot<T::Session>>,
        label: &str,
    ) -> Result<Box<dyn RemoteChannel>, CommunicatorError> {
        let session = self.session(slot).await?;
        match session.open_channel().await {
            Ok(channel) => Ok(channel),
            Err(source) => {
                warn!(error = %source, "channel open failed; discarding session");
                slot.session = None;
                Err(CommunicatorError::Transport {
                    command: label.to_owned(),
                    source,
                })
            }
        }
    }

    async fn execute_on(
        &self,
        slot: &mut MutexGuard<'_, SessionSlot<T::Session>>,
        command: &Command,
        auth_sock: Option<&str>,
    ) -> Result<CommandOutput, CommunicatorError> {
        let mut channel = self.open_channel(slot, command.text()).await?;
        let result = self
            .executor
            .run(channel.as_mut(), command, auth_sock)
            .await;
        let text = command.text().to_owned();
        match result {
            Ok(output) => {
                slot.last_used = Some(Instant::now());
                Ok(output)
            }
            Err(ExecError::Transport(source)) => {
                warn!(command = %text, error = %source, "transport failed mid-command; discarding session");
                slot.session = None;
                Err(CommunicatorError::Transport {
                    command: text,
                    source,
                })
            }
            Err(ExecError::MissingExitStatus) => {
                Err(CommunicatorError::MissingExitStatus { command: text })
            }
            Err(ExecError::MarkerNotFound { stream }) => Err(CommunicatorError::MarkerNotFound {
                command: text,
                stream,
            }),
            Err(ExecError::ExitStatusOutOfRange { status }) => {
                Err(CommunicatorError::ExitStatusOutOfRange {
                    command: text,
                    status,
                })
            }
        }
    }

    async fn session<'s>(
        &self,
        slot: &'s mut SessionSlot<T::Session>,
    ) -> Result<&'s T::Session, ConnectError> {
        self.session_with(slot, self.policy.max_tries).await
    }

    async fn session_with<'s>(
        &self,
        slot: &'s mut SessionSlot<T::Session>,
        attempts: u32,
    ) -> Result<&'s T::Session, ConnectError> {
        let reused = match slot.session.take() {
            Some(session) if !self.reusable(&session, slot.last_used).await => None,
            cached => cached,
        };
        let session = if let Some(session) = reused {
            debug!(endpoint = %self.params.endpoint(), "reusing session");
            session
        } else {
            let session = self.open(attempts).await?;
            slot.last_used = Some(Instant::now());
            session
        };
        Ok(slot.session.insert(session))
    }

    async fn reusable(&self, session: &T::Session, last_used: Option<Instant>) -> bool {
        if session.is_closed() {
            info!(endpoint = %self.params.endpoint(), "cached session is closed; reconnecting");
            return false;
        }
        let idle = last_used.map_or(Duration::MAX, |at| at.elapsed());
        if idle < self.idle_probe {
            return true;
        }
        match timeout(PROBE_TIMEOUT, probe(session)).await {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                info!(error = %err, "session probe failed; reconnecting");
                false
            }
            Err(_) => {
                info!("session probe timed out; reconnecting");
                false
            }
        }
    }

    async fn open(&self, max_tries: u32) -> Result<T::Session, ConnectError> {
        let host = || self.params.host.clone();
        for key in &self.params.private_key_paths {
            verify_key_permissions(key, self.repair_keys).map_err(|source| {
                ConnectError::Terminal {
                    host: host(),
                    port: self.params.port,
                    source,
                }
            })?;
        }

        let attempts = max_tries.max(1);
        let deadline_secs = self.policy.connect_timeout.as_secs();
        let mut last = TransportError::Timeout {
            seconds: deadline_secs,
        };
        for attempt in 1..=attempts {
            info!(
                endpoint = %self.params.endpoint(),
                attempt,
                attempts,
                "connecting"
            );
            match timeout(self.policy.connect_timeout, self.transport.connect(&self.params)).await
            {
                Ok(Ok(session)) => {
                    if !self.policy.settle_delay.is_zero() {
                        debug!(delay = ?self.policy.settle_delay, "waiting for session to settle");
                        sleep(self.policy.settle_delay).await;
                    }
                    info!(endpoint = %self.params.endpoint(), attempt, "connected");
                    return Ok(session);
                }
                Ok(Err(err)) if err.is_transient() => {
                    warn!(attempt, error = %err, "transient connect failure");
                    last = err;
                }
                Ok(Err(err)) => {
                    warn!(error = %err, "connect failed; not retrying");
                    return Err(ConnectError::Terminal {
                        host: host(),
                        port: self.params.port,
                        source: err,
                    });
                }
                Err(_) => {
                    warn!(attempt, seconds = deadline_secs, "connect timed out");
                    last = TransportError::Timeout {
                        seconds: deadline_secs,
                    };
                }
            }
            if attempt < attempts && !self.policy.retry_delay.is_zero() {
                sleep(self.policy.retry_delay).await;
            }
        }
        Err(ConnectError::RetriesExhausted {
            host: host(),
            port: self.params.port,
            attempts,
            last,
        })
    }
}

/// Connect failures that may clear up while the machine finishes booting.
const fn worth_waiting_for(err: &ConnectError) -> bool {
    let source = err.transport_error();
    source.is_transient() || matches!(source, TransportError::AuthenticationFailed { .. })
}

async fn probe<S: Session>(session: &S) -> Result<(), TransportError> {
    let mut channel = session.open_channel().await?;
    channel.exec("").await?;
    channel.eof().await?;
    while let Some(event) = channel.next_event().await? {
        if event == ChannelEvent::Close {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests;
