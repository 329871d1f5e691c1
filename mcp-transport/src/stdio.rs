//! Newline-framed JSON over a pair of byte streams.
//!
//! Servers run this over the process's own stdin/stdout; clients usually let
//! [`StdioTransport::spawn`] launch the server as a child process and drive
//! its piped stdio, optionally supervising stderr with a caller-supplied
//! classifier.

use std::collections::HashMap;
use std::ffi::OsString;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use async_trait::async_trait;
use mcp_types::JSONRPCMessage;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::trace;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::CloseCallback;
use crate::ErrorCallback;
use crate::LineBuffer;
use crate::MessageCallback;
use crate::Transport;
use crate::TransportCore;
use crate::TransportError;
use crate::TransportSendOptions;

/// Capacity of the bounded outbound channel between `send` callers and the
/// writer task.
const CHANNEL_CAPACITY: usize = 128;

/// Bytes read from the input stream per iteration.
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// How the stderr supervisor should treat one line of child stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StderrSeverity {
    Info,
    Warning,
    /// Tear the session down: input and output close and the transport goes
    /// to `Closed` with a `ConnectionClosed`-class error.
    Fatal,
}

pub type StderrClassifier = Arc<dyn Fn(&str) -> StderrSeverity + Send + Sync>;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

struct StdioIo {
    reader: BoxedReader,
    writer: BoxedWriter,
    stderr: Option<(BoxedReader, StderrClassifier)>,
}

pub struct StdioTransport {
    core: Arc<TransportCore>,
    io: Mutex<Option<StdioIo>>,
    outgoing_tx: Mutex<Option<mpsc::Sender<JSONRPCMessage>>>,
    shutdown: CancellationToken,
    /// Retain the child until the transport is dropped; `kill_on_drop` means
    /// the runtime reaps it best-effort afterwards.
    child: Mutex<Option<Child>>,
}

impl StdioTransport {
    /// Build a transport over arbitrary streams. Servers pass
    /// `tokio::io::stdin()` / `tokio::io::stdout()`; tests pass the halves of
    /// a `tokio::io::duplex` pipe.
    pub fn over_streams(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            core: Arc::new(TransportCore::new()),
            io: Mutex::new(Some(StdioIo {
                reader: Box::new(reader),
                writer: Box::new(writer),
                stderr: None,
            })),
            outgoing_tx: Mutex::new(None),
            shutdown: CancellationToken::new(),
            child: Mutex::new(None),
        }
    }

    /// Spawn `program` as a child MCP server and wire its piped stdio.
    /// When `stderr_classifier` is given, the child's stderr is read
    /// line-by-line and supervised; otherwise it is discarded.
    pub fn spawn(
        program: OsString,
        args: Vec<OsString>,
        env: Option<HashMap<String, String>>,
        stderr_classifier: Option<StderrClassifier>,
    ) -> std::io::Result<Self> {
        let mut command = Command::new(program);
        command
            .args(args)
            .env_clear()
            .envs(create_env_for_mcp_server(env))
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .kill_on_drop(true);
        if stderr_classifier.is_some() {
            command.stderr(std::process::Stdio::piped());
        } else {
            command.stderr(std::process::Stdio::null());
        }

        let mut child = command.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| std::io::Error::other("failed to capture child stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("failed to capture child stdout"))?;
        let stderr = match stderr_classifier {
            Some(classifier) => {
                let stderr = child
                    .stderr
                    .take()
                    .ok_or_else(|| std::io::Error::other("failed to capture child stderr"))?;
                Some((Box::new(stderr) as BoxedReader, classifier))
            }
            None => None,
        };

        Ok(Self {
            core: Arc::new(TransportCore::new()),
            io: Mutex::new(Some(StdioIo {
                reader: Box::new(stdout),
                writer: Box::new(stdin),
                stderr,
            })),
            outgoing_tx: Mutex::new(None),
            shutdown: CancellationToken::new(),
            child: Mutex::new(Some(child)),
        })
    }

    fn take_io(&self) -> Option<StdioIo> {
        self.io.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

/// Close initiated from a pump task (EOF, I/O fault, fatal stderr).
fn close_from_pump(core: &Arc<TransportCore>, shutdown: &CancellationToken) {
    if core.begin_close() {
        shutdown.cancel();
        core.fire_close();
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn start(&self) -> Result<(), TransportError> {
        self.core.begin_start()?;
        let Some(io) = self.take_io() else {
            return Err(TransportError::SendFailed(
                "stdio streams already consumed".to_string(),
            ));
        };
        let StdioIo {
            reader,
            writer,
            stderr,
        } = io;

        let (outgoing_tx, outgoing_rx) = mpsc::channel::<JSONRPCMessage>(CHANNEL_CAPACITY);
        *self
            .outgoing_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(outgoing_tx);

        // Writer task: drain the outbound channel onto the output stream.
        tokio::spawn(run_writer(
            writer,
            outgoing_rx,
            self.core.clone(),
            self.shutdown.clone(),
        ));

        // Reader task: frame the input stream into messages. Its completion
        // (EOF or fault) drives the transport closed.
        tokio::spawn(run_reader(
            reader,
            self.core.clone(),
            self.shutdown.clone(),
        ));

        if let Some((stderr_reader, classifier)) = stderr {
            tokio::spawn(run_stderr_supervisor(
                stderr_reader,
                classifier,
                self.core.clone(),
                self.shutdown.clone(),
            ));
        }

        Ok(())
    }

    async fn send(
        &self,
        message: JSONRPCMessage,
        _options: TransportSendOptions,
    ) -> Result<(), TransportError> {
        self.core.ensure_operational()?;
        let tx = self
            .outgoing_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(TransportError::NotStarted)?;
        tx.send(message)
            .await
            .map_err(|_| TransportError::SendFailed("writer task is gone".to_string()))
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.core.begin_close() {
            self.shutdown.cancel();
            self.outgoing_tx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(mut child) = self
                .child
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
            {
                let _ = child.start_kill();
            }
            self.core.fire_close();
        }
        Ok(())
    }

    fn on_message(&self, callback: MessageCallback) {
        self.core.register_message_callback(callback);
    }

    fn on_error(&self, callback: ErrorCallback) {
        self.core.register_error_callback(callback);
    }

    fn on_close(&self, callback: CloseCallback) {
        self.core.register_close_callback(callback);
    }
}

async fn run_writer(
    mut writer: BoxedWriter,
    mut outgoing_rx: mpsc::Receiver<JSONRPCMessage>,
    core: Arc<TransportCore>,
    shutdown: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => break,
            maybe = outgoing_rx.recv() => match maybe {
                Some(message) => message,
                None => break,
            },
        };
        let json = match serde_json::to_string(&message) {
            Ok(json) => json,
            Err(e) => {
                error!("failed to serialize outbound message: {e}");
                core.deliver_error(&TransportError::Json(e));
                continue;
            }
        };
        trace!("stdio -> {json}");
        if let Err(e) = write_line(&mut writer, &json).await {
            core.deliver_error(&TransportError::Io(e));
            close_from_pump(&core, &shutdown);
            break;
        }
    }
}

async fn write_line(
    writer: &mut BoxedWriter,
    json: &str,
) -> std::io::Result<()> {
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

async fn run_reader(
    mut reader: BoxedReader,
    core: Arc<TransportCore>,
    shutdown: CancellationToken,
) {
    let mut framer = LineBuffer::new();
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];
    loop {
        let read = tokio::select! {
            _ = shutdown.cancelled() => break,
            read = reader.read(&mut chunk) => read,
        };
        match read {
            Ok(0) => {
                debug!("stdio input stream reached EOF");
                break;
            }
            Ok(n) => {
                framer.append(&chunk[..n]);
                while let Some(line) = framer.next_message() {
                    if line.is_empty() {
                        continue;
                    }
                    trace!("stdio <- {line}");
                    match serde_json::from_str::<JSONRPCMessage>(&line) {
                        Ok(message) => core.deliver_message(message).await,
                        Err(e) => {
                            core.deliver_error(&TransportError::InvalidMessage(format!(
                                "{e}; line = {line}"
                            )));
                        }
                    }
                }
            }
            Err(e) => {
                core.deliver_error(&TransportError::Io(e));
                break;
            }
        }
    }
    close_from_pump(&core, &shutdown);
}

async fn run_stderr_supervisor(
    stderr: BoxedReader,
    classifier: StderrClassifier,
    core: Arc<TransportCore>,
    shutdown: CancellationToken,
) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => return,
            line = lines.next_line() => line,
        };
        match line {
            Ok(Some(line)) => match classifier(&line) {
                StderrSeverity::Info => info!("server stderr: {line}"),
                StderrSeverity::Warning => warn!("server stderr: {line}"),
                StderrSeverity::Fatal => {
                    error!("fatal server stderr: {line}");
                    core.deliver_error(&TransportError::FatalStderr(line));
                    close_from_pump(&core, &shutdown);
                    return;
                }
            },
            Ok(None) => break,
            Err(e) => {
                warn!("stderr supervisor read error: {e}");
                break;
            }
        }
    }
    // Stderr EOF means the child is going away; complete the read loop.
    close_from_pump(&core, &shutdown);
}

/// Environment variables that are always forwarded when spawning an MCP
/// server. Servers inherit only a curated subset plus whatever the caller
/// passes explicitly.
#[cfg(unix)]
const DEFAULT_ENV_VARS: &[&str] = &[
    "HOME", "LANG", "LC_ALL", "LOGNAME", "PATH", "SHELL", "TERM", "TMPDIR", "TZ", "USER",
];

#[cfg(windows)]
const DEFAULT_ENV_VARS: &[&str] = &[
    "PATH",
    "PATHEXT",
    "USERNAME",
    "USERDOMAIN",
    "USERPROFILE",
    "TEMP",
    "TMP",
];

fn create_env_for_mcp_server(
    extra_env: Option<HashMap<String, String>>,
) -> HashMap<String, String> {
    DEFAULT_ENV_VARS
        .iter()
        .filter_map(|var| match std::env::var(var) {
            Ok(value) => Some((var.to_string(), value)),
            Err(_) => None,
        })
        .chain(extra_env.unwrap_or_default())
        .collect::<HashMap<_, _>>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_env_keeps_path_and_extra_vars() {
        let extra = HashMap::from([("MCP_TEST_FLAG".to_string(), "1".to_string())]);
        let env = create_env_for_mcp_server(Some(extra));
        assert!(env.contains_key("PATH"));
        assert_eq!(env.get("MCP_TEST_FLAG").map(String::as_str), Some("1"));
    }
}
