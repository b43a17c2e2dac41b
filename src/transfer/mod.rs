//! File transfer over the open session using the SCP protocol.
//!
//! Uploads speak the sink side of `scp -t` (with `-r` for directories) and
//! downloads the source side of `scp -f`. Every record is acknowledged by a
//! single byte: `0` for success, `1` or `2` followed by a message line for
//! warnings and fatal errors.

use std::borrow::Cow;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;

use camino::{Utf8Path, Utf8PathBuf};
use shell_escape::unix::escape;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::transport::{ChannelEvent, RemoteChannel, TransportError};

/// Size of the buffer used to stream file contents.
const CHUNK_SIZE: usize = 32 * 1024;

/// Exit status of a shell that could not find the requested program.
const COMMAND_NOT_FOUND: u32 = 127;

/// Errors raised while transferring files.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TransferError {
    /// The remote side refused to read or write the path.
    #[error("permission denied copying {from} to {to}")]
    PermissionDenied {
        /// Source path.
        from: String,
        /// Destination path.
        to: String,
    },
    /// The remote side has no transfer program.
    #[error("{tool} is not available on the target (exit status {exit_code})")]
    TransferToolUnavailable {
        /// Program that was missing.
        tool: String,
        /// Exit status reported by the remote shell.
        exit_code: u32,
    },
    /// A local file could not be read or written.
    #[error("local I/O error on {path}: {message}")]
    LocalIo {
        /// Local path.
        path: Utf8PathBuf,
        /// Underlying error message.
        message: String,
    },
    /// The remote side reported an error.
    #[error("remote error for {path}: {message}")]
    Remote {
        /// Remote path involved.
        path: String,
        /// Message sent by the remote side.
        message: String,
    },
    /// The remote side broke the SCP protocol.
    #[error("SCP protocol error: {message}")]
    Protocol {
        /// What went wrong.
        message: String,
    },
    /// The transport failed during the transfer.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

type TransferFuture<'a> = Pin<Box<dyn Future<Output = Result<(), TransferError>> + Send + 'a>>;

/// Copies `local` (a file or a directory tree) to `remote`.
///
/// Files are opened read-only and their permission bits travel with them.
///
/// # Errors
///
/// Returns [`TransferError::PermissionDenied`] when the remote side rejects a
/// write, [`TransferError::TransferToolUnavailable`] when `scp` is missing on
/// the target, and [`TransferError::LocalIo`] for local read failures.
pub async fn upload(
    channel: &mut dyn RemoteChannel,
    local: &Utf8Path,
    remote: &str,
) -> Result<(), TransferError> {
    let metadata = tokio::fs::metadata(local)
        .await
        .map_err(|err| local_io(local, &err))?;
    let recursive = metadata.is_dir();
    let command = format!(
        "scp {}-t {}",
        if recursive { "-r " } else { "" },
        escape(Cow::Borrowed(remote))
    );
    debug!(command = %command, "starting SCP sink");
    channel.exec(&command).await?;

    let mut stream = ScpStream::new(channel, local.as_str(), remote, remote);
    stream.expect_ack().await?;
    if recursive {
        send_directory(&mut stream, local).await?;
    } else {
        send_file(&mut stream, local).await?;
    }
    stream.channel.eof().await?;
    stream.drain().await
}

/// Copies the remote file `remote` to `local`.
///
/// # Errors
///
/// Returns [`TransferError::PermissionDenied`] when the remote side cannot
/// read the file, [`TransferError::TransferToolUnavailable`] when `scp` is
/// missing, [`TransferError::Protocol`] when the source is a directory, and
/// [`TransferError::LocalIo`] for local write failures.
pub async fn download(
    channel: &mut dyn RemoteChannel,
    remote: &str,
    local: &Utf8Path,
) -> Result<(), TransferError> {
    let command = format!("scp -f {}", escape(Cow::Borrowed(remote)));
    debug!(command = %command, "starting SCP source");
    channel.exec(&command).await?;

    let mut stream = ScpStream::new(channel, remote, local.as_str(), remote);
    stream.channel.send(&[0]).await?;
    let header = loop {
        let line = stream.read_record().await?;
        if !line.starts_with('T') {
            break line;
        }
        stream.channel.send(&[0]).await?;
    };
    let record = FileRecord::parse(&header)?;
    stream.channel.send(&[0]).await?;

    let mut file = tokio::fs::File::create(local)
        .await
        .map_err(|err| local_io(local, &err))?;
    let mut remaining = record.size;
    while remaining > 0 {
        let chunk = stream.read_up_to(remaining).await?;
        remaining -= chunk.len();
        file.write_all(&chunk)
            .await
            .map_err(|err| local_io(local, &err))?;
    }
    file.flush().await.map_err(|err| local_io(local, &err))?;
    stream.expect_ack().await?;
    stream.channel.send(&[0]).await?;
    stream.channel.eof().await?;
    stream.drain().await
}

fn send_directory<'a>(stream: &'a mut ScpStream<'_>, dir: &'a Utf8Path) -> TransferFuture<'a> {
    Box::pin(async move {
        let name = dir.file_name().unwrap_or(".");
        let mode = permission_bits(dir, 0o755).await;
        stream
            .send_record(&format!("D{mode:04o} 0 {name}\n"))
            .await?;

        let mut entries = Vec::new();
        let mut reader = tokio::fs::read_dir(dir)
            .await
            .map_err(|err| local_io(dir, &err))?;
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|err| local_io(dir, &err))?
        {
            let path = Utf8PathBuf::from_path_buf(entry.path()).map_err(|path| {
                TransferError::LocalIo {
                    path: dir.to_path_buf(),
                    message: format!("non UTF-8 entry {}", path.display()),
                }
            })?;
            entries.push(path);
        }
        entries.sort();

        for path in entries {
            let metadata = tokio::fs::metadata(&path)
                .await
                .map_err(|err| local_io(&path, &err))?;
            if metadata.is_dir() {
                send_directory(stream, &path).await?;
            } else {
                send_file(stream, &path).await?;
            }
        }
        stream.send_record("E\n").await
    })
}

async fn send_file(stream: &mut ScpStream<'_>, path: &Utf8Path) -> Result<(), TransferError> {
    let mut file = tokio::fs::OpenOptions::new()
        .read(true)
        .open(path)
        .await
        .map_err(|err| local_io(path, &err))?;
    let size = file
        .metadata()
        .await
        .map_err(|err| local_io(path, &err))?
        .len();
    let mode = permission_bits(path, 0o644).await;
    let name = path.file_name().unwrap_or_default();
    stream
        .send_record(&format!("C{mode:04o} {size} {name}\n"))
        .await?;

    let mut buffer = vec![0_u8; CHUNK_SIZE];
    loop {
        let read = file
            .read(&mut buffer)
            .await
            .map_err(|err| local_io(path, &err))?;
        if read == 0 {
            break;
        }
        let chunk = buffer.get(..read).unwrap_or_default();
        stream.channel.send(chunk).await?;
    }
    stream.send_record_bytes(&[0]).await
}

#[cfg(unix)]
async fn permission_bits(path: &Utf8Path, fallback: u32) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::metadata(path)
        .await
        .map_or(fallback, |meta| meta.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
async fn permission_bits(_path: &Utf8Path, fallback: u32) -> u32 {
    fallback
}

fn local_io(path: &Utf8Path, err: &std::io::Error) -> TransferError {
    TransferError::LocalIo {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

struct FileRecord {
    size: usize,
}

impl FileRecord {
    fn parse(line: &str) -> Result<Self, TransferError> {
        let protocol = |message: String| TransferError::Protocol { message };
        match line.chars().next() {
            Some('C') => {}
            Some('D') => {
                return Err(protocol(String::from(
                    "remote path is a directory; only files can be downloaded",
                )));
            }
            _ => return Err(protocol(format!("unexpected record {line:?}"))),
        }
        let mut parts = line.splitn(3, ' ');
        let _mode = parts.next();
        let size = parts
            .next()
            .and_then(|size| size.parse().ok())
            .ok_or_else(|| protocol(format!("malformed file record {line:?}")))?;
        Ok(Self { size })
    }
}

/// Byte-level reader over a channel speaking SCP.
struct ScpStream<'c> {
    channel: &'c mut dyn RemoteChannel,
    from: String,
    to: String,
    remote: String,
    buffer: VecDeque<u8>,
    stderr: Vec<u8>,
    exit_status: Option<u32>,
    closed: bool,
}

impl<'c> ScpStream<'c> {
    fn new(channel: &'c mut dyn RemoteChannel, from: &str, to: &str, remote: &str) -> Self {
        Self {
            channel,
            from: from.to_owned(),
            to: to.to_owned(),
            remote: remote.to_owned(),
            buffer: VecDeque::new(),
            stderr: Vec::new(),
            exit_status: None,
            closed: false,
        }
    }

    /// Pulls the next event; returns `false` once the channel is closed.
    async fn fill(&mut self) -> Result<bool, TransferError> {
        while !self.closed {
            match self.channel.next_event().await? {
                Some(ChannelEvent::Stdout(bytes)) => {
                    self.buffer.extend(bytes);
                    return Ok(true);
                }
                Some(ChannelEvent::Stderr(bytes)) => self.stderr.extend(bytes),
                Some(ChannelEvent::ExitStatus(status)) => self.exit_status = Some(status),
                Some(ChannelEvent::Eof) => {}
                Some(ChannelEvent::Close) | None => self.closed = true,
            }
        }
        Ok(false)
    }

    async fn read_byte(&mut self) -> Result<u8, TransferError> {
        loop {
            if let Some(byte) = self.buffer.pop_front() {
                return Ok(byte);
            }
            if !self.fill().await? {
                return Err(self.closed_early());
            }
        }
    }

    async fn read_line(&mut self) -> Result<String, TransferError> {
        let mut line = Vec::new();
        loop {
            match self.read_byte().await? {
                b'\n' => return Ok(String::from_utf8_lossy(&line).into_owned()),
                byte => line.push(byte),
            }
        }
    }

    async fn read_up_to(&mut self, limit: usize) -> Result<Vec<u8>, TransferError> {
        if self.buffer.is_empty() && !self.fill().await? {
            return Err(self.closed_early());
        }
        let take = limit.min(self.buffer.len());
        Ok(self.buffer.drain(..take).collect())
    }

    /// Reads one record line, turning error acknowledgements into errors.
    async fn read_record(&mut self) -> Result<String, TransferError> {
        match self.read_byte().await? {
            0 => Err(TransferError::Protocol {
                message: String::from("unexpected acknowledgement instead of a record"),
            }),
            1 | 2 => {
                let message = self.read_line().await?;
                Err(self.remote_error(message))
            }
            first => {
                let rest = self.read_line().await?;
                Ok(format!("{}{rest}", char::from(first)))
            }
        }
    }

    async fn expect_ack(&mut self) -> Result<(), TransferError> {
        match self.read_byte().await? {
            0 => Ok(()),
            1 | 2 => {
                let message = self.read_line().await?;
                Err(self.remote_error(message))
            }
            other => Err(TransferError::Protocol {
                message: format!("unexpected acknowledgement byte {other}"),
            }),
        }
    }

    async fn send_record(&mut self, record: &str) -> Result<(), TransferError> {
        self.send_record_bytes(record.as_bytes()).await
    }

    async fn send_record_bytes(&mut self, bytes: &[u8]) -> Result<(), TransferError> {
        self.channel.send(bytes).await?;
        self.expect_ack().await
    }

    /// Consumes the rest of the channel and checks the exit status.
    async fn drain(&mut self) -> Result<(), TransferError> {
        while self.fill().await? {
            self.buffer.clear();
        }
        match self.exit_status {
            Some(0) | None => Ok(()),
            Some(_) => Err(self.closed_early()),
        }
    }

    fn remote_error(&self, message: String) -> TransferError {
        let message = message.trim().to_owned();
        if message.contains("Permission denied") {
            TransferError::PermissionDenied {
                from: self.from.clone(),
                to: self.to.clone(),
            }
        } else {
            TransferError::Remote {
                path: self.remote.clone(),
                message,
            }
        }
    }

    fn closed_early(&self) -> TransferError {
        let stderr = String::from_utf8_lossy(&self.stderr).trim().to_owned();
        match self.exit_status {
            Some(COMMAND_NOT_FOUND) => TransferError::TransferToolUnavailable {
                tool: String::from("scp"),
                exit_code: COMMAND_NOT_FOUND,
            },
            _ if stderr.contains("Permission denied") => TransferError::PermissionDenied {
                from: self.from.clone(),
                to: self.to.clone(),
            },
            Some(status) => TransferError::Remote {
                path: self.remote.clone(),
                message: if stderr.is_empty() {
                    format!("scp exited with status {status}")
                } else {
                    stderr
                },
            },
            None => TransferError::Protocol {
                message: String::from("channel closed before the transfer completed"),
            },
        }
    }
}

#[cfg(test)]
mod tests;
