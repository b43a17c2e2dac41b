//! Channel executor: runs one command per channel and demultiplexes its
//! output and exit status.
//!
//! Each command is written into a fresh login shell (or an elevated shell for
//! privileged commands) followed by an explicit `exit`, so the channel always
//! terminates. Output passes through control-sequence stripping and, when the
//! target shell prints a startup banner, through a per-stream marker gate that
//! drops everything before a unique token echoed ahead of the command.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::transport::{ChannelEvent, RemoteChannel, TransportError};

mod filter;

use filter::{ControlFilter, MarkerGate, StreamDecoder};

/// Stream a chunk of remote output arrived on.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum OutputStream {
    /// Standard output.
    Stdout,
    /// Standard error (channel extended data).
    Stderr,
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => f.write_str("stdout"),
            Self::Stderr => f.write_str("stderr"),
        }
    }
}

/// Receives filtered output chunks while a command runs.
pub trait OutputSink: Send + Sync {
    /// Handles one chunk of text from `stream`.
    fn on_chunk(&self, stream: OutputStream, chunk: &str);
}

impl<F> OutputSink for F
where
    F: Fn(OutputStream, &str) + Send + Sync,
{
    fn on_chunk(&self, stream: OutputStream, chunk: &str) {
        self(stream, chunk);
    }
}

/// What to do with an exit code outside the command's accepted set.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ErrorPolicy {
    /// Unaccepted exit codes become [`crate::connection::CommunicatorError::CommandFailed`].
    #[default]
    Check,
    /// Exit codes are returned as-is.
    Ignore,
}

/// One execution request.
#[derive(Clone)]
pub struct Command {
    text: String,
    privileged: bool,
    error_policy: ErrorPolicy,
    good_exit: Vec<i32>,
    capture: bool,
    shell: Option<String>,
    sink: Option<Arc<dyn OutputSink>>,
}

impl Command {
    /// Creates an unprivileged, checked command.
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            privileged: false,
            error_policy: ErrorPolicy::Check,
            good_exit: vec![0],
            capture: true,
            shell: None,
            sink: None,
        }
    }

    /// Runs the command through the privileged-shell prefix.
    #[must_use]
    pub const fn privileged(mut self, privileged: bool) -> Self {
        self.privileged = privileged;
        self
    }

    /// Sets the error policy.
    #[must_use]
    pub const fn error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    /// Exit codes treated as success under [`ErrorPolicy::Check`]; `[0]`
    /// unless set.
    #[must_use]
    pub fn good_exit(mut self, codes: impl Into<Vec<i32>>) -> Self {
        self.good_exit = codes.into();
        self
    }

    /// Keeps filtered output in [`CommandOutput`]. Turn it off when a sink
    /// consumes the stream and the text is not needed afterwards.
    #[must_use]
    pub const fn capture(mut self, capture: bool) -> Self {
        self.capture = capture;
        self
    }

    /// Overrides the login shell for this command only.
    #[must_use]
    pub fn shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = Some(shell.into());
        self
    }

    /// Streams filtered output chunks to `sink`.
    #[must_use]
    pub fn sink(mut self, sink: Arc<dyn OutputSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Command text as written to the remote shell.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Whether the command runs elevated.
    #[must_use]
    pub const fn is_privileged(&self) -> bool {
        self.privileged
    }

    /// Error policy applied to the exit code.
    #[must_use]
    pub const fn policy(&self) -> ErrorPolicy {
        self.error_policy
    }

    /// Whether `exit_code` counts as success.
    #[must_use]
    pub fn accepts(&self, exit_code: i32) -> bool {
        self.good_exit.contains(&exit_code)
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("text", &self.text)
            .field("privileged", &self.privileged)
            .field("error_policy", &self.error_policy)
            .field("good_exit", &self.good_exit)
            .field("capture", &self.capture)
            .field("shell", &self.shell)
            .field("sink", &self.sink.as_ref().map(|_| "<sink>"))
            .finish()
    }
}

/// Result of one command.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the remote side.
    pub exit_code: i32,
    /// Filtered standard output.
    pub stdout: String,
    /// Filtered standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code is zero.
    #[must_use]
    pub const fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Syntax family of the remote shell.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ShellFlavor {
    /// `sh`-compatible shells.
    #[default]
    Posix,
    /// Windows `PowerShell`.
    PowerShell,
    /// Windows `cmd.exe`.
    Cmd,
}

impl FromStr for ShellFlavor {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "posix" | "sh" => Ok(Self::Posix),
            "powershell" => Ok(Self::PowerShell),
            "cmd" => Ok(Self::Cmd),
            other => Err(format!(
                "unknown shell flavor '{other}' (expected posix, powershell or cmd)"
            )),
        }
    }
}

/// Shell settings for one target.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ShellSettings {
    /// Login shell command, e.g. `bash -l`.
    pub shell: String,
    /// Privileged-shell prefix; `%c` is replaced by the shell.
    pub sudo_command: String,
    /// Shell syntax used for the preamble and marker.
    pub flavor: ShellFlavor,
    /// Inject the marker token and drop banner output before it.
    pub banner_marker: bool,
    /// Request agent forwarding on every channel.
    pub forward_agent: bool,
}

impl Default for ShellSettings {
    fn default() -> Self {
        Self {
            shell: String::from("bash -l"),
            sudo_command: String::from("sudo -E -H %c"),
            flavor: ShellFlavor::Posix,
            banner_marker: false,
            forward_agent: false,
        }
    }
}

/// Failures while driving one channel.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ExecError {
    /// The transport failed while the command was running.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The channel closed without an exit-status signal.
    #[error("channel closed without an exit status")]
    MissingExitStatus,
    /// The marker token never appeared on a stream.
    #[error("marker token never appeared on {stream}")]
    MarkerNotFound {
        /// Stream that lacked the marker.
        stream: OutputStream,
    },
    /// The exit status does not fit an `i32`.
    #[error("exit status {status} out of range")]
    ExitStatusOutOfRange {
        /// Raw status received.
        status: u32,
    },
}

/// Runs commands on channels using one target's shell settings.
#[derive(Clone, Debug)]
pub struct ChannelExecutor {
    settings: ShellSettings,
    marker: String,
}

impl ChannelExecutor {
    /// Creates an executor with a fresh random marker token.
    #[must_use]
    pub fn new(settings: ShellSettings) -> Self {
        Self {
            settings,
            marker: format!("tether-{}", Uuid::new_v4().simple()),
        }
    }

    /// Replaces the marker token.
    #[must_use]
    pub fn with_marker(mut self, marker: impl Into<String>) -> Self {
        self.marker = marker.into();
        self
    }

    /// Shell settings in use.
    #[must_use]
    pub const fn settings(&self) -> &ShellSettings {
        &self.settings
    }

    /// Marker token echoed before each command.
    #[must_use]
    pub fn marker(&self) -> &str {
        &self.marker
    }

    /// Program started on the channel for `command`.
    #[must_use]
    pub fn shell_command(&self, command: &Command) -> String {
        let shell = command.shell.as_deref().unwrap_or(&self.settings.shell);
        if command.privileged {
            self.settings.sudo_command.replace("%c", shell)
        } else {
            shell.to_owned()
        }
    }

    /// Script written to the shell's stdin for `command`.
    #[must_use]
    pub fn script(&self, command: &Command, auth_sock: Option<&str>) -> String {
        let mut script = String::new();
        if self.settings.flavor == ShellFlavor::Posix {
            script.push_str("export TERM=vt100\n");
            if let Some(sock) = auth_sock {
                script.push_str("export SSH_AUTH_SOCK=");
                script.push_str(sock);
                script.push('\n');
            }
        }
        if self.settings.banner_marker {
            script.push_str(&self.marker_lines());
        }
        script.push_str(&command.text);
        script.push('\n');
        script.push_str(match self.settings.flavor {
            ShellFlavor::Posix => "exit\n",
            ShellFlavor::PowerShell => "exit $LASTEXITCODE\n",
            ShellFlavor::Cmd => "exit %ERRORLEVEL%\n",
        });
        script
    }

    fn marker_lines(&self) -> String {
        let marker = &self.marker;
        match self.settings.flavor {
            ShellFlavor::Posix => {
                format!("printf %s '{marker}'\nprintf %s '{marker}' 1>&2\n")
            }
            ShellFlavor::PowerShell => {
                format!("Write-Host '{marker}'\n[Console]::Error.WriteLine('{marker}')\n")
            }
            ShellFlavor::Cmd => format!("ECHO {marker}\nECHO {marker} 1>&2\n"),
        }
    }

    fn gate(&self) -> MarkerGate {
        if self.settings.banner_marker {
            MarkerGate::closed(
                self.marker.clone(),
                self.settings.flavor != ShellFlavor::Posix,
            )
        } else {
            MarkerGate::open()
        }
    }

    /// Runs `command` on `channel` until the channel closes.
    ///
    /// `auth_sock` is exported inside the shell when set.
    ///
    /// # Errors
    ///
    /// Returns [`ExecError::Transport`] on channel failures,
    /// [`ExecError::MissingExitStatus`] when no exit status arrives, and
    /// [`ExecError::MarkerNotFound`] when marker mode is on and a stream never
    /// carried the marker.
    pub async fn run(
        &self,
        channel: &mut dyn RemoteChannel,
        command: &Command,
        auth_sock: Option<&str>,
    ) -> Result<CommandOutput, ExecError> {
        if self.settings.forward_agent {
            channel.request_agent_forwarding().await?;
        }
        let shell = self.shell_command(command);
        debug!(shell = %shell, privileged = command.privileged, command = %command.text, "executing");
        channel.exec(&shell).await?;
        channel
            .send(self.script(command, auth_sock).as_bytes())
            .await?;
        channel.eof().await?;

        let mut stdout = StreamState::new(OutputStream::Stdout, self.gate(), command.capture);
        let mut stderr = StreamState::new(OutputStream::Stderr, self.gate(), command.capture);
        let mut exit_status = None;

        while let Some(event) = channel.next_event().await? {
            match event {
                ChannelEvent::Stdout(bytes) => stdout.push(&bytes, command.sink.as_deref()),
                ChannelEvent::Stderr(bytes) => stderr.push(&bytes, command.sink.as_deref()),
                ChannelEvent::ExitStatus(status) => exit_status = Some(status),
                ChannelEvent::Eof => {}
                ChannelEvent::Close => break,
            }
        }
        stdout.finish(command.sink.as_deref());
        stderr.finish(command.sink.as_deref());

        let status = exit_status.ok_or(ExecError::MissingExitStatus)?;
        for stream in [&stdout, &stderr] {
            if !stream.gate.seen() {
                warn!(stream = %stream.stream, "marker token missing from output");
                return Err(ExecError::MarkerNotFound {
                    stream: stream.stream,
                });
            }
        }
        let exit_code =
            i32::try_from(status).map_err(|_| ExecError::ExitStatusOutOfRange { status })?;
        debug!(exit_code, "command finished");
        Ok(CommandOutput {
            exit_code,
            stdout: stdout.collected,
            stderr: stderr.collected,
        })
    }
}

struct StreamState {
    stream: OutputStream,
    decoder: StreamDecoder,
    gate: MarkerGate,
    filter: ControlFilter,
    capture: bool,
    collected: String,
}

impl StreamState {
    fn new(stream: OutputStream, gate: MarkerGate, capture: bool) -> Self {
        Self {
            stream,
            decoder: StreamDecoder::default(),
            gate,
            filter: ControlFilter::default(),
            capture,
            collected: String::new(),
        }
    }

    fn push(&mut self, bytes: &[u8], sink: Option<&dyn OutputSink>) {
        let text = self.decoder.push(bytes);
        self.emit(&text, sink);
    }

    fn finish(&mut self, sink: Option<&dyn OutputSink>) {
        let text = self.decoder.finish();
        self.emit(&text, sink);
        let rest = self.filter.finish();
        self.deliver(&rest, sink);
    }

    fn emit(&mut self, text: &str, sink: Option<&dyn OutputSink>) {
        if text.is_empty() {
            return;
        }
        let Some(released) = self.gate.push(text) else {
            return;
        };
        let clean = self.filter.push(&released);
        self.deliver(&clean, sink);
    }

    fn deliver(&mut self, clean: &str, sink: Option<&dyn OutputSink>) {
        if clean.is_empty() {
            return;
        }
        if let Some(sink) = sink {
            sink.on_chunk(self.stream, clean);
        }
        if self.capture {
            self.collected.push_str(clean);
        }
    }
}
