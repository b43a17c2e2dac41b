//! Test support utilities shared across unit and integration tests.
//!
//! [`ScriptedTransport`] stands in for a real SSH server: connects can be made
//! to fail on a script, sessions carry an identity so reuse is observable, and
//! channels interpret the small shell scripts the executor writes (including
//! the marker lines and `exit`) against canned [`Reply`] values. Channels
//! started with `scp -t`/`scp -f` talk to an in-memory SCP peer backed by a
//! fake remote file system.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::capability::{Capability, CapabilityArgs, CapabilityError, CapabilityOutput, Communicate, Guest};
use crate::connection::CommunicatorError;
use crate::registry::Detect;
use crate::transport::{
    ChannelEvent, ConnectionParams, EngineFuture, RemoteChannel, Session, Transport,
    TransportError,
};

/// Canned outcome for a command matched by [`ScriptedTransport::respond`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Reply {
    stdout: String,
    stderr: String,
    exit_code: Option<u32>,
}

impl Reply {
    /// A reply exiting with `code` and no output.
    #[must_use]
    pub const fn exit(code: u32) -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: Some(code),
        }
    }

    /// A reply whose channel closes without an exit-status signal.
    #[must_use]
    pub const fn without_exit_status() -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
        }
    }

    /// Adds standard output.
    #[must_use]
    pub fn stdout(mut self, text: impl Into<String>) -> Self {
        self.stdout = text.into();
        self
    }

    /// Adds standard error.
    #[must_use]
    pub fn stderr(mut self, text: impl Into<String>) -> Self {
        self.stderr = text.into();
        self
    }
}

/// One command block interpreted by a scripted channel.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Execution {
    /// Identity of the session the channel belonged to.
    pub session: usize,
    /// Program started on the channel.
    pub shell: String,
    /// Command text, without the preamble, marker and `exit` lines.
    pub command: String,
    /// Full script received on stdin.
    pub script: String,
}

#[derive(Debug, Default)]
struct RemoteFs {
    files: BTreeMap<String, (u32, Vec<u8>)>,
    dirs: BTreeSet<String>,
    denied: Vec<String>,
    scp_missing: bool,
}

impl RemoteFs {
    fn is_denied(&self, path: &str) -> bool {
        self.denied.iter().any(|prefix| path.starts_with(prefix.as_str()))
    }
}

#[derive(Debug, Default)]
struct State {
    connect_failures: VecDeque<TransportError>,
    fail_all: Option<TransportError>,
    connect_delay: Option<Duration>,
    connect_attempts: usize,
    sessions_opened: usize,
    broken: BTreeSet<usize>,
    pending_failure: Option<TransportError>,
    banner: Option<String>,
    default_exit: u32,
    replies: Vec<(String, Reply)>,
    executions: Vec<Execution>,
    probes: usize,
    agent_requests: usize,
    fs: RemoteFs,
}

/// Transport double driven entirely in memory.
#[derive(Clone, Debug, Default)]
pub struct ScriptedTransport {
    state: Arc<Mutex<State>>,
}

impl ScriptedTransport {
    /// Creates a transport whose connects succeed and whose commands exit 0.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }

    /// Makes the next connect attempt fail with `err`. Failures queue up.
    pub fn push_connect_failure(&self, err: TransportError) {
        self.state().connect_failures.push_back(err);
    }

    /// Makes every connect attempt fail with `err`.
    pub fn fail_all_connects(&self, err: TransportError) {
        self.state().fail_all = Some(err);
    }

    /// Delays every connect attempt by `delay`.
    pub fn delay_connects(&self, delay: Duration) {
        self.state().connect_delay = Some(delay);
    }

    /// Number of connect attempts observed so far.
    #[must_use]
    pub fn connect_attempts(&self) -> usize {
        self.state().connect_attempts
    }

    /// Number of sessions successfully opened so far.
    #[must_use]
    pub fn sessions_opened(&self) -> usize {
        self.state().sessions_opened
    }

    /// Makes the given session fail every subsequent channel open.
    pub fn break_session(&self, session: usize) {
        self.state().broken.insert(session);
    }

    /// Makes the most recently opened session fail every channel open.
    pub fn break_current_session(&self) {
        let mut state = self.state();
        let current = state.sessions_opened;
        state.broken.insert(current);
    }

    /// Makes the next interpreted command fail mid-flight with `err`.
    pub fn fail_next_command(&self, err: TransportError) {
        self.state().pending_failure = Some(err);
    }

    /// Prepends `banner` to both output streams of every shell channel.
    pub fn with_banner(&self, banner: impl Into<String>) {
        self.state().banner = Some(banner.into());
    }

    /// Exit code used for commands without a matching reply.
    pub fn with_default_exit(&self, code: u32) {
        self.state().default_exit = code;
    }

    /// Answers any command containing `pattern` with `reply`. Later
    /// registrations take priority over earlier ones.
    pub fn respond(&self, pattern: impl Into<String>, reply: Reply) {
        self.state().replies.push((pattern.into(), reply));
    }

    /// Every command block interpreted so far.
    #[must_use]
    pub fn executions(&self) -> Vec<Execution> {
        self.state().executions.clone()
    }

    /// Command texts interpreted so far.
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        self.state()
            .executions
            .iter()
            .map(|execution| execution.command.clone())
            .collect()
    }

    /// Number of zero-length probe commands seen.
    #[must_use]
    pub fn probes(&self) -> usize {
        self.state().probes
    }

    /// Number of agent-forwarding requests seen.
    #[must_use]
    pub fn agent_requests(&self) -> usize {
        self.state().agent_requests
    }

    /// Places a file on the fake remote file system.
    pub fn put_remote_file(&self, path: impl Into<String>, mode: u32, contents: impl Into<Vec<u8>>) {
        self.state()
            .fs
            .files
            .insert(path.into(), (mode, contents.into()));
    }

    /// Creates a directory on the fake remote file system.
    pub fn put_remote_dir(&self, path: impl Into<String>) {
        self.state().fs.dirs.insert(path.into());
    }

    /// Reads a file from the fake remote file system.
    #[must_use]
    pub fn remote_file(&self, path: &str) -> Option<(u32, Vec<u8>)> {
        self.state().fs.files.get(path).cloned()
    }

    /// Whether a directory exists on the fake remote file system.
    #[must_use]
    pub fn has_remote_dir(&self, path: &str) -> bool {
        self.state().fs.dirs.contains(path)
    }

    /// Rejects writes and reads under `prefix` with "Permission denied".
    pub fn deny_path(&self, prefix: impl Into<String>) {
        self.state().fs.denied.push(prefix.into());
    }

    /// Simulates a remote without the `scp` binary (exit code 127).
    pub fn without_scp(&self) {
        self.state().fs.scp_missing = true;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Transport for ScriptedTransport {
    type Session = ScriptedSession;

    fn connect<'a>(
        &'a self,
        _params: &'a ConnectionParams,
    ) -> EngineFuture<'a, Self::Session, TransportError> {
        Box::pin(async move {
            let delay = {
                let mut state = self.state();
                state.connect_attempts += 1;
                state.connect_delay
            };
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let mut state = self.state();
            if let Some(err) = state.fail_all.clone() {
                return Err(err);
            }
            if let Some(err) = state.connect_failures.pop_front() {
                return Err(err);
            }
            state.sessions_opened += 1;
            Ok(ScriptedSession {
                id: state.sessions_opened,
                state: Arc::clone(&self.state),
                closed: Arc::new(AtomicBool::new(false)),
            })
        })
    }
}

/// Session handed out by [`ScriptedTransport`].
#[derive(Debug)]
pub struct ScriptedSession {
    id: usize,
    state: Arc<Mutex<State>>,
    closed: Arc<AtomicBool>,
}

impl ScriptedSession {
    /// Identity of this session (1 for the first one opened).
    #[must_use]
    pub const fn id(&self) -> usize {
        self.id
    }
}

impl Session for ScriptedSession {
    fn open_channel(&self) -> EngineFuture<'_, Box<dyn RemoteChannel>, TransportError> {
        Box::pin(async move {
            if self.closed.load(Ordering::SeqCst) || lock(&self.state).broken.contains(&self.id) {
                return Err(TransportError::Disconnected);
            }
            Ok(Box::new(ScriptedChannel {
                session: self.id,
                state: Arc::clone(&self.state),
                mode: Mode::Idle,
                events: VecDeque::new(),
            }) as Box<dyn RemoteChannel>)
        })
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) -> EngineFuture<'_, (), TransportError> {
        Box::pin(async move {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        })
    }
}

#[derive(Debug)]
enum Mode {
    Idle,
    Shell { shell: String, script: Vec<u8> },
    Sink(ScpSink),
    Source(ScpSource),
    Done,
}

type Event = Result<ChannelEvent, TransportError>;

struct ScriptedChannel {
    session: usize,
    state: Arc<Mutex<State>>,
    mode: Mode,
    events: VecDeque<Event>,
}

impl ScriptedChannel {
    fn finish(&mut self, exit_code: Option<u32>) {
        if let Some(code) = exit_code {
            self.events.push_back(Ok(ChannelEvent::ExitStatus(code)));
        }
        self.events.push_back(Ok(ChannelEvent::Eof));
        self.events.push_back(Ok(ChannelEvent::Close));
        self.mode = Mode::Done;
    }

    fn start(&mut self, command: &str) {
        let Some(args) = command.strip_prefix("scp ") else {
            self.mode = Mode::Shell {
                shell: command.to_owned(),
                script: Vec::new(),
            };
            return;
        };
        if lock(&self.state).fs.scp_missing {
            self.events.push_back(Ok(ChannelEvent::Stderr(
                b"bash: scp: command not found\n".to_vec(),
            )));
            self.finish(Some(127));
            return;
        }
        let words: Vec<&str> = args.split_whitespace().collect();
        let recursive = words.contains(&"-r");
        let target = unquote(words.last().copied().unwrap_or_default());
        if words.contains(&"-f") {
            self.mode = Mode::Source(ScpSource {
                path: target,
                step: SourceStep::AwaitStart,
            });
        } else {
            self.events.push_back(Ok(ChannelEvent::Stdout(vec![0])));
            self.mode = Mode::Sink(ScpSink {
                target,
                recursive,
                stack: Vec::new(),
                buffer: Vec::new(),
                pending: None,
            });
        }
    }

    fn interpret(&mut self, shell: &str, script: &str) {
        let mut state = lock(&self.state);
        if shell.is_empty() && script.is_empty() {
            state.probes += 1;
            drop(state);
            self.finish(Some(0));
            return;
        }

        let mut stdout = String::new();
        let mut stderr = String::new();
        if let Some(banner) = &state.banner {
            stdout.push_str(banner);
            stderr.push_str(banner);
        }

        let mut status = Some(0);
        let mut block: Vec<&str> = Vec::new();
        let mut exited = false;
        for line in script.lines() {
            match Builtin::parse(line) {
                Some(builtin) => {
                    if !block.is_empty() {
                        let command = block.join("\n");
                        block.clear();
                        match run_block(&mut state, self.session, shell, script, &command) {
                            Ok(reply) => {
                                stdout.push_str(&reply.stdout);
                                stderr.push_str(&reply.stderr);
                                status = reply.exit_code;
                            }
                            Err(err) => {
                                drop(state);
                                self.fail(err, stdout, stderr);
                                return;
                            }
                        }
                    }
                    match builtin {
                        Builtin::Export => {}
                        Builtin::Print { text, to_stderr } => {
                            if to_stderr {
                                stderr.push_str(&text);
                            } else {
                                stdout.push_str(&text);
                            }
                        }
                        Builtin::Exit(code) => {
                            if code.is_some() {
                                status = code;
                            }
                            exited = true;
                        }
                    }
                    if exited {
                        break;
                    }
                }
                None => block.push(line),
            }
        }
        if !exited && !block.is_empty() {
            let command = block.join("\n");
            match run_block(&mut state, self.session, shell, script, &command) {
                Ok(reply) => {
                    stdout.push_str(&reply.stdout);
                    stderr.push_str(&reply.stderr);
                    status = reply.exit_code;
                }
                Err(err) => {
                    drop(state);
                    self.fail(err, stdout, stderr);
                    return;
                }
            }
        }
        drop(state);
        self.push_output(stdout, stderr);
        self.finish(status);
    }

    fn push_output(&mut self, stdout: String, stderr: String) {
        if !stdout.is_empty() {
            self.events
                .push_back(Ok(ChannelEvent::Stdout(stdout.into_bytes())));
        }
        if !stderr.is_empty() {
            self.events
                .push_back(Ok(ChannelEvent::Stderr(stderr.into_bytes())));
        }
    }

    fn fail(&mut self, err: TransportError, stdout: String, stderr: String) {
        self.push_output(stdout, stderr);
        self.events.push_back(Err(err));
        self.mode = Mode::Done;
    }
}

fn run_block(
    state: &mut State,
    session: usize,
    shell: &str,
    script: &str,
    command: &str,
) -> Result<Reply, TransportError> {
    state.executions.push(Execution {
        session,
        shell: shell.to_owned(),
        command: command.to_owned(),
        script: script.to_owned(),
    });
    if let Some(err) = state.pending_failure.take() {
        state.broken.insert(session);
        return Err(err);
    }
    Ok(state
        .replies
        .iter()
        .rev()
        .find(|(pattern, _)| command.contains(pattern.as_str()))
        .map_or_else(|| Reply::exit(state.default_exit), |(_, reply)| reply.clone()))
}

enum Builtin {
    Export,
    Print { text: String, to_stderr: bool },
    Exit(Option<u32>),
}

impl Builtin {
    fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.starts_with("export ") {
            return Some(Self::Export);
        }
        if line == "exit" || line == "exit $LASTEXITCODE" || line == "exit %ERRORLEVEL%" {
            return Some(Self::Exit(None));
        }
        if let Some(code) = line.strip_prefix("exit ") {
            return code.trim().parse().ok().map(|code| Self::Exit(Some(code)));
        }
        if let Some(rest) = line.strip_prefix("printf %s '") {
            let (text, to_stderr) = match rest.strip_suffix("' 1>&2") {
                Some(text) => (text, true),
                None => (rest.strip_suffix('\'')?, false),
            };
            return Some(Self::Print {
                text: text.to_owned(),
                to_stderr,
            });
        }
        if let Some(rest) = line.strip_prefix("Write-Host '") {
            return Some(Self::Print {
                text: format!("{}\r\n", rest.strip_suffix('\'')?),
                to_stderr: false,
            });
        }
        if let Some(rest) = line.strip_prefix("[Console]::Error.WriteLine('") {
            return Some(Self::Print {
                text: format!("{}\r\n", rest.strip_suffix("')")?),
                to_stderr: true,
            });
        }
        if let Some(rest) = line.strip_prefix("ECHO ") {
            return Some(match rest.strip_suffix(" 1>&2") {
                Some(text) => Self::Print {
                    text: format!("{text}\r\n"),
                    to_stderr: true,
                },
                None => Self::Print {
                    text: format!("{rest}\r\n"),
                    to_stderr: false,
                },
            });
        }
        None
    }
}

fn unquote(word: &str) -> String {
    let mut out = String::new();
    let mut quoted = false;
    let mut chars = word.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '\'' => quoted = !quoted,
            '\\' if !quoted => {
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            }
            other => out.push(other),
        }
    }
    out
}

fn join_remote(base: &str, name: &str) -> String {
    format!("{}/{name}", base.trim_end_matches('/'))
}

#[derive(Debug)]
struct ScpSink {
    target: String,
    recursive: bool,
    stack: Vec<String>,
    buffer: Vec<u8>,
    pending: Option<PendingFile>,
}

#[derive(Debug)]
struct PendingFile {
    path: String,
    mode: u32,
    remaining: usize,
    contents: Vec<u8>,
}

#[derive(Debug)]
struct ScpSource {
    path: String,
    step: SourceStep,
}

#[derive(Debug, Eq, PartialEq)]
enum SourceStep {
    AwaitStart,
    AwaitHeaderAck,
    AwaitFinalAck,
}

enum SinkOutcome {
    Continue(Vec<u8>),
    Abort(String),
}

impl ScpSink {
    fn destination(&self, fs: &RemoteFs, name: &str) -> String {
        match self.stack.last() {
            Some(parent) => join_remote(parent, name),
            None if fs.dirs.contains(&self.target) => join_remote(&self.target, name),
            None => self.target.clone(),
        }
    }

    fn feed(&mut self, fs: &mut RemoteFs, data: &[u8]) -> SinkOutcome {
        self.buffer.extend_from_slice(data);
        let mut acks = Vec::new();
        loop {
            if let Some(pending) = self.pending.as_mut() {
                let take = pending.remaining.min(self.buffer.len());
                pending.contents.extend(self.buffer.drain(..take));
                pending.remaining -= take;
                if pending.remaining > 0 || self.buffer.is_empty() {
                    return SinkOutcome::Continue(acks);
                }
                self.buffer.remove(0);
                if let Some(done) = self.pending.take() {
                    fs.files.insert(done.path, (done.mode, done.contents));
                }
                acks.push(0);
                continue;
            }
            let Some(newline) = self.buffer.iter().position(|byte| *byte == b'\n') else {
                return SinkOutcome::Continue(acks);
            };
            let raw: Vec<u8> = self.buffer.drain(..=newline).collect();
            let line = String::from_utf8_lossy(raw.strip_suffix(b"\n").unwrap_or(&raw)).into_owned();
            match self.record(fs, &line) {
                Ok(()) => acks.push(0),
                Err(message) => return SinkOutcome::Abort(message),
            }
        }
    }

    fn record(&mut self, fs: &mut RemoteFs, line: &str) -> Result<(), String> {
        if line == "E" {
            self.stack.pop();
            return Ok(());
        }
        let mut parts = line.splitn(3, ' ');
        let header = parts.next().unwrap_or_default();
        let size: usize = parts.next().and_then(|size| size.parse().ok()).unwrap_or(0);
        let name = parts.next().unwrap_or_default();
        let (kind, mode) = header.split_at(1.min(header.len()));
        let mode = u32::from_str_radix(mode, 8).unwrap_or(0o644);
        let path = self.destination(fs, name);
        if fs.is_denied(&path) {
            return Err(format!("scp: {path}: Permission denied"));
        }
        match kind {
            "C" => {
                self.pending = Some(PendingFile {
                    path,
                    mode,
                    remaining: size,
                    contents: Vec::with_capacity(size),
                });
                Ok(())
            }
            "D" if self.recursive => {
                fs.dirs.insert(path.clone());
                self.stack.push(path);
                Ok(())
            }
            _ => Err(format!("scp: protocol error: unexpected record {line}")),
        }
    }
}

impl ScpSource {
    fn feed(&mut self, fs: &RemoteFs, data: &[u8]) -> (Vec<ChannelEvent>, Option<u32>) {
        if data.first() != Some(&0) {
            return (Vec::new(), Some(1));
        }
        match self.step {
            SourceStep::AwaitStart => {
                let name = self.path.rsplit('/').next().unwrap_or_default().to_owned();
                let failure = |message: String| {
                    let mut line = vec![1];
                    line.extend_from_slice(message.as_bytes());
                    line.push(b'\n');
                    (vec![ChannelEvent::Stdout(line)], Some(1))
                };
                if fs.is_denied(&self.path) {
                    return failure(format!("scp: {}: Permission denied", self.path));
                }
                if fs.dirs.contains(&self.path) {
                    self.step = SourceStep::AwaitHeaderAck;
                    return (
                        vec![ChannelEvent::Stdout(format!("D0755 0 {name}\n").into_bytes())],
                        None,
                    );
                }
                let Some((mode, contents)) = fs.files.get(&self.path) else {
                    return failure(format!("scp: {}: No such file or directory", self.path));
                };
                self.step = SourceStep::AwaitHeaderAck;
                (
                    vec![ChannelEvent::Stdout(
                        format!("C{mode:04o} {} {name}\n", contents.len()).into_bytes(),
                    )],
                    None,
                )
            }
            SourceStep::AwaitHeaderAck => {
                let mut payload = fs
                    .files
                    .get(&self.path)
                    .map(|(_, contents)| contents.clone())
                    .unwrap_or_default();
                payload.push(0);
                self.step = SourceStep::AwaitFinalAck;
                (vec![ChannelEvent::Stdout(payload)], None)
            }
            SourceStep::AwaitFinalAck => (Vec::new(), Some(0)),
        }
    }
}

impl RemoteChannel for ScriptedChannel {
    fn request_agent_forwarding(&mut self) -> EngineFuture<'_, (), TransportError> {
        Box::pin(async move {
            lock(&self.state).agent_requests += 1;
            Ok(())
        })
    }

    fn exec<'a>(&'a mut self, command: &'a str) -> EngineFuture<'a, (), TransportError> {
        Box::pin(async move {
            self.start(command);
            Ok(())
        })
    }

    fn send<'a>(&'a mut self, data: &'a [u8]) -> EngineFuture<'a, (), TransportError> {
        Box::pin(async move {
            match &mut self.mode {
                Mode::Shell { script, .. } => script.extend_from_slice(data),
                Mode::Sink(sink) => {
                    let outcome = {
                        let mut state = lock(&self.state);
                        sink.feed(&mut state.fs, data)
                    };
                    match outcome {
                        SinkOutcome::Continue(acks) => {
                            if !acks.is_empty() {
                                self.events.push_back(Ok(ChannelEvent::Stdout(acks)));
                            }
                        }
                        SinkOutcome::Abort(message) => {
                            let mut line = vec![1];
                            line.extend_from_slice(message.as_bytes());
                            line.push(b'\n');
                            self.events.push_back(Ok(ChannelEvent::Stdout(line)));
                            self.finish(Some(1));
                        }
                    }
                }
                Mode::Source(source) => {
                    let (events, exit) = {
                        let state = lock(&self.state);
                        source.feed(&state.fs, data)
                    };
                    self.events.extend(events.into_iter().map(Ok));
                    if exit.is_some() {
                        self.finish(exit);
                    }
                }
                Mode::Idle | Mode::Done => {}
            }
            Ok(())
        })
    }

    fn eof(&mut self) -> EngineFuture<'_, (), TransportError> {
        Box::pin(async move {
            match std::mem::replace(&mut self.mode, Mode::Done) {
                Mode::Shell { shell, script } => {
                    let script = String::from_utf8_lossy(&script).into_owned();
                    self.interpret(&shell, &script);
                }
                Mode::Idle => self.interpret("", ""),
                Mode::Sink(_) => self.finish(Some(0)),
                Mode::Source(source) => self.mode = Mode::Source(source),
                Mode::Done => {}
            }
            Ok(())
        })
    }

    fn next_event(&mut self) -> EngineFuture<'_, Option<ChannelEvent>, TransportError> {
        Box::pin(async move {
            match self.events.pop_front() {
                Some(Ok(event)) => Ok(Some(event)),
                Some(Err(err)) => Err(err),
                None => Ok(None),
            }
        })
    }
}

/// Detector with a fixed answer that counts its invocations.
#[derive(Clone, Debug, Default)]
pub struct FixedDetector {
    matches: bool,
    calls: Arc<AtomicUsize>,
}

impl FixedDetector {
    /// Creates a detector that always answers `matches`.
    #[must_use]
    pub fn new(matches: bool) -> Self {
        Self {
            matches,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of times detection ran.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Detect for FixedDetector {
    fn detect<'a>(&'a self, _target: &'a dyn Communicate) -> EngineFuture<'a, bool, CommunicatorError> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.matches)
        })
    }
}

/// Capability returning a fixed value and recording its arguments.
#[derive(Clone, Debug, Default)]
pub struct RecordingCapability {
    output: CapabilityOutput,
    calls: Arc<Mutex<Vec<CapabilityArgs>>>,
}

impl RecordingCapability {
    /// Creates a capability that answers `output`.
    #[must_use]
    pub fn new(output: CapabilityOutput) -> Self {
        Self {
            output,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Arguments of every invocation so far.
    #[must_use]
    pub fn calls(&self) -> Vec<CapabilityArgs> {
        lock(&self.calls).clone()
    }
}

impl Capability for RecordingCapability {
    fn invoke<'a>(
        &'a self,
        _guest: &'a dyn Guest,
        args: &'a CapabilityArgs,
    ) -> EngineFuture<'a, CapabilityOutput, CapabilityError> {
        Box::pin(async move {
            lock(&self.calls).push(args.clone());
            Ok(self.output.clone())
        })
    }
}
