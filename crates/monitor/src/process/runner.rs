//! Launching external commands.
//!
//! A runner starts a process and returns immediately. Everything the
//! process produces is reported through a [`ProcessEventSink`]: zero or more
//! `Output` events followed by exactly one `Exited` event. Both are sent
//! from the same task, so output always precedes the exit of its handle.

use std::io;
use std::process::Stdio;

use protocol::CommandLine;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;

use super::registry::{HandleId, ProcessEvent, ProcessPayload};

/// Exit code reported for a process that ended without one (killed by a signal).
pub const SIGNALLED_EXIT_CODE: i32 = -1;

/// Buffer size for reading process output.
const READ_BUFFER_SIZE: usize = 4096;

/// Channel receiving events of every launched process.
pub type ProcessEventSink = mpsc::UnboundedSender<ProcessEvent>;

/// Errors that can occur while launching a command.
#[derive(Error, Debug)]
pub enum SpawnError {
    /// The operating system refused to start the process.
    #[error("failed to launch `{command}`: {source}")]
    Launch {
        command: String,
        #[source]
        source: io::Error,
    },

    /// The runner declined to start the command.
    #[error("command rejected: {0}")]
    Rejected(String),
}

/// Starts external commands without waiting for them.
pub trait CommandRunner: Send + Sync {
    /// Launches `command` and reports its events as `handle` through `sink`.
    fn launch(
        &self,
        handle: HandleId,
        command: &CommandLine,
        sink: ProcessEventSink,
    ) -> Result<(), SpawnError>;
}

/// Runner backed by `tokio::process`.
///
/// Both stdout and stderr are forwarded as output. Children are never
/// killed when their events stop being of interest; they run to completion.
#[derive(Debug, Default, Clone)]
pub struct TokioRunner;

impl TokioRunner {
    /// Creates a runner.
    pub fn new() -> Self {
        Self
    }
}

impl CommandRunner for TokioRunner {
    fn launch(
        &self,
        handle: HandleId,
        command: &CommandLine,
        sink: ProcessEventSink,
    ) -> Result<(), SpawnError> {
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| SpawnError::Launch {
                command: command.to_string(),
                source,
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        tokio::spawn(async move {
            forward_output(handle, stdout, stderr, &sink).await;

            let code = match child.wait().await {
                Ok(status) => status.code().unwrap_or(SIGNALLED_EXIT_CODE),
                Err(e) => {
                    tracing::warn!(handle = %handle, error = %e, "Failed to wait for process");
                    SIGNALLED_EXIT_CODE
                }
            };

            // The receiver is gone once the engine has shut down.
            let _ = sink.send(ProcessEvent::exited(handle, code));
        });

        Ok(())
    }
}

/// Launches `command` and waits for it, returning its output and exit code.
pub async fn run_once(
    runner: &dyn CommandRunner,
    command: &CommandLine,
) -> Result<(Vec<u8>, i32), SpawnError> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = HandleId::from_raw(0);
    runner.launch(handle, command, tx)?;

    let mut output = Vec::new();
    while let Some(event) = rx.recv().await {
        match event.payload {
            ProcessPayload::Output(bytes) => output.extend_from_slice(&bytes),
            ProcessPayload::Exited(code) => return Ok((output, code)),
        }
    }

    // The runner dropped its sink without reporting an exit.
    Ok((output, SIGNALLED_EXIT_CODE))
}

/// Forwards both output streams until each reaches end of file.
async fn forward_output<O, E>(
    handle: HandleId,
    mut stdout: Option<O>,
    mut stderr: Option<E>,
    sink: &ProcessEventSink,
) where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    let mut out_buf = [0u8; READ_BUFFER_SIZE];
    let mut err_buf = [0u8; READ_BUFFER_SIZE];

    while stdout.is_some() || stderr.is_some() {
        tokio::select! {
            read = read_chunk(&mut stdout, &mut out_buf) => {
                match read {
                    Ok(0) => stdout = None,
                    Ok(n) => {
                        let _ = sink.send(ProcessEvent::output(handle, out_buf[..n].to_vec()));
                    }
                    Err(e) => {
                        tracing::debug!(handle = %handle, error = %e, "stdout read failed");
                        stdout = None;
                    }
                }
            }
            read = read_chunk(&mut stderr, &mut err_buf) => {
                match read {
                    Ok(0) => stderr = None,
                    Ok(n) => {
                        let _ = sink.send(ProcessEvent::output(handle, err_buf[..n].to_vec()));
                    }
                    Err(e) => {
                        tracing::debug!(handle = %handle, error = %e, "stderr read failed");
                        stderr = None;
                    }
                }
            }
        }
    }
}

/// Reads from `reader`, or never completes once the stream is closed.
async fn read_chunk<R: AsyncRead + Unpin>(
    reader: &mut Option<R>,
    buf: &mut [u8],
) -> io::Result<usize> {
    match reader {
        Some(reader) => reader.read(buf).await,
        None => std::future::pending().await,
    }
}
