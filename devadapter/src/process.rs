/// Process management for the configuration utility
///
/// This module launches the external utility, forwards its stdout as it
/// arrives and reports the exit status once the process is gone.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};

/// Receives the output and exit status of one launched process
///
/// `close` consumes the sink, so a run reports its status exactly once.
pub struct ProcessSink {
    data: Box<dyn FnMut(&str) + Send>,
    close: Box<dyn FnOnce(Option<i32>) + Send>,
}

impl ProcessSink {
    pub fn new<D, C>(data: D, close: C) -> Self
    where
        D: FnMut(&str) + Send + 'static,
        C: FnOnce(Option<i32>) + Send + 'static,
    {
        Self {
            data: Box::new(data),
            close: Box::new(close),
        }
    }

    /// Forward one chunk of stdout
    pub fn data(&mut self, chunk: &str) {
        (self.data)(chunk)
    }

    /// Report the exit code; `None` when the process was killed or never started
    pub fn close(self, code: Option<i32>) {
        (self.close)(code)
    }
}

impl std::fmt::Debug for ProcessSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSink").finish_non_exhaustive()
    }
}

/// Starts utility processes on behalf of the command gateway
pub trait ProcessLauncher: Send + Sync {
    /// Start `program` with `args`. Must not call into the sink before returning.
    ///
    /// `close` consumes the sink, so it can only run after the last `data`
    /// call has returned.
    fn launch(&self, program: &Path, args: &[String], timeout: Option<Duration>, sink: ProcessSink);
}

/// Launches real processes on the tokio runtime
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioLauncher;

impl ProcessLauncher for TokioLauncher {
    fn launch(&self, program: &Path, args: &[String], timeout: Option<Duration>, mut sink: ProcessSink) {
        let program = program.to_path_buf();
        let args = args.to_vec();

        tokio::spawn(async move {
            log::debug!("Starting utility: {} {}", program.display(), args.join(" "));

            let mut child = match Command::new(&program)
                .args(&args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .spawn()
            {
                Ok(child) => child,
                Err(e) => {
                    log::error!("Failed to start {}: {}", program.display(), e);
                    sink.close(None);
                    return;
                }
            };

            log::debug!("Utility started with PID: {:?}", child.id());

            let outcome = match timeout {
                Some(limit) => {
                    let bounded = tokio::time::timeout(limit, pump(&mut child, &mut sink)).await;
                    match bounded {
                        Ok(outcome) => outcome,
                        Err(_) => {
                            log::warn!("Utility exceeded {:?}, killing PID {:?}", limit, child.id());
                            if let Err(e) = child.kill().await {
                                log::error!("Failed to kill utility: {}", e);
                            }
                            sink.close(None);
                            return;
                        }
                    }
                }
                None => pump(&mut child, &mut sink).await,
            };

            match outcome {
                Ok(status) => {
                    log::debug!("Utility exited: {}", status);
                    sink.close(status.code());
                }
                Err(e) => {
                    log::error!("Utility I/O error: {}", e);
                    sink.close(None);
                }
            }
        });
    }
}

/// Forward stdout until EOF, then wait for the exit status
async fn pump(child: &mut Child, sink: &mut ProcessSink) -> std::io::Result<ExitStatus> {
    if let Some(mut stdout) = child.stdout.take() {
        let mut buf = [0u8; 4096];
        let mut pending = Vec::new();
        loop {
            let n = stdout.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            pending.extend_from_slice(&buf[..n]);
            let text = take_decoded(&mut pending);
            if !text.is_empty() {
                sink.data(&text);
            }
        }
        if !pending.is_empty() {
            sink.data(&String::from_utf8_lossy(&pending));
        }
    }
    child.wait().await
}

/// Decode the complete characters in `pending`, leaving a split trailing
/// sequence for the next read. Invalid bytes are replaced.
fn take_decoded(pending: &mut Vec<u8>) -> String {
    let cut = match std::str::from_utf8(pending.as_slice()) {
        Ok(_) => pending.len(),
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        Err(_) => pending.len(),
    };
    let tail = pending.split_off(cut);
    let text = String::from_utf8_lossy(pending.as_slice()).into_owned();
    *pending = tail;
    text
}
