//! Runner harness.
//!
//! [`Runner`] drives one module through its whole life over a pair of byte
//! streams:
//!
//! 1. `init` with the configured settings, then `start`
//! 2. write `KENNEL_PLUGIN_READY` (or `KENNEL_PLUGIN_ERROR` and give up)
//! 3. read one line, dispatch it, write one frame, repeat
//! 4. on the first shutdown trigger, run `stop` once and return
//!
//! [`run`] wires this to the process: stdin, stdout, environment
//! configuration, termination signals and the exit code.

use crate::config::{plugin_id_from_env, RunnerConfig};
use crate::dispatch::dispatch;
use crate::error::{DispatchError, LifecycleError, RunnerError};
use crate::lifecycle::Lifecycle;
use crate::shutdown::{listen_for_signals, ShutdownCoordinator, ShutdownTrigger};
use crate::Module;
use kennel_plugin_api::{
    decode_inbound, FrameError, InboundFrame, OutboundFrame, ReadyPayload, StartupFailure,
    MAX_LINE_BYTES,
};
use std::io;
use std::process::ExitCode;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Writes frames as lines, flushing after each one.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    /// Write one frame. A frame that cannot be encoded is replaced by an
    /// error frame describing the encoding failure.
    pub async fn write(&mut self, frame: &OutboundFrame) -> io::Result<()> {
        let line = match frame.encode() {
            Ok(line) => line,
            Err(err) => {
                tracing::error!(error = %err, tag = frame.tag(), "failed to encode frame");
                OutboundFrame::error(err.to_string())
                    .encode()
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?
            }
        };
        self.inner.write_all(line.as_bytes()).await?;
        self.inner.write_all(b"\n").await?;
        self.inner.flush().await
    }
}

/// Drives a module over a reader and a writer
pub struct Runner<M> {
    lifecycle: Lifecycle<M>,
    config: RunnerConfig,
    shutdown: ShutdownCoordinator,
}

impl<M: Module> Runner<M> {
    pub fn new(module: M, config: RunnerConfig) -> Self {
        Self {
            lifecycle: Lifecycle::new(module),
            config,
            shutdown: ShutdownCoordinator::new(),
        }
    }

    /// Handle for triggering shutdown from outside the read loop
    pub fn shutdown_handle(&self) -> ShutdownCoordinator {
        self.shutdown.clone()
    }

    /// Run until shutdown.
    ///
    /// Returns the trigger that ended a graceful run. A startup failure is
    /// reported on `writer` as `KENNEL_PLUGIN_ERROR` and returned as
    /// [`RunnerError::Startup`]; `stop` is not called in that case.
    pub async fn run<R, W>(mut self, reader: R, writer: W) -> Result<ShutdownTrigger, RunnerError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut writer = FrameWriter::new(writer);
        let plugin_id = self.config.plugin_id.clone();

        if let Err(err) = self.startup().await {
            tracing::error!(plugin_id = %plugin_id, error = %err, "plugin startup failed");
            let failure = StartupFailure::new(plugin_id, err.to_string());
            writer.write(&OutboundFrame::PluginError(failure)).await?;
            return Err(RunnerError::Startup(err));
        }

        let trigger = match self.shutdown.trigger() {
            Some(trigger) => trigger,
            None => {
                let ready = ReadyPayload::new(plugin_id.clone(), self.lifecycle.info());
                match writer.write(&OutboundFrame::Ready(ready)).await {
                    Ok(()) => {
                        tracing::info!(plugin_id = %plugin_id, "plugin ready");
                        self.serve(reader, &mut writer).await
                    }
                    Err(err) => ShutdownTrigger::StreamError(err.to_string()),
                }
            }
        };

        self.shutdown.request(trigger.clone());
        let winner = self.shutdown.trigger().unwrap_or(trigger);

        if self.shutdown.claim_stop() {
            if let Err(err) = self.lifecycle.stop().await {
                tracing::error!(error = %err, "module stop failed");
            }
        }
        tracing::info!(plugin_id = %plugin_id, trigger = %winner, "plugin stopped");
        Ok(winner)
    }

    async fn startup(&mut self) -> Result<(), LifecycleError> {
        let settings = std::mem::take(&mut self.config.settings);
        self.lifecycle.init(settings).await?;
        self.lifecycle.start().await
    }

    /// Read loop. Commands are handled strictly one at a time.
    async fn serve<R, W>(&mut self, mut reader: R, writer: &mut FrameWriter<W>) -> ShutdownTrigger
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let shutdown = self.shutdown.clone();
        let mut buf = Vec::new();

        loop {
            buf.clear();
            let read = tokio::select! {
                biased;
                trigger = shutdown.requested() => return trigger,
                read = read_bounded_line(&mut reader, &mut buf, MAX_LINE_BYTES) => read,
            };
            let decoded = match read {
                Ok(LineRead::EndOfStream) => return ShutdownTrigger::EndOfStream,
                Ok(LineRead::Line) => decode_inbound(&String::from_utf8_lossy(&buf)),
                Ok(LineRead::TooLarge) => Err(FrameError::TooLarge {
                    max_bytes: MAX_LINE_BYTES,
                }),
                Err(err) => {
                    tracing::warn!(error = %err, "failed to read from host");
                    return ShutdownTrigger::StreamError(err.to_string());
                }
            };

            let frame = match decoded {
                Ok(None) => continue,
                Ok(Some(InboundFrame::Stop)) => return ShutdownTrigger::StopFrame,
                Ok(Some(InboundFrame::Command(envelope))) => {
                    dispatch(&mut self.lifecycle, envelope).await
                }
                Err(err) => {
                    let err = DispatchError::from(err);
                    tracing::warn!(error = %err, "failed to decode command");
                    OutboundFrame::error(err.to_string())
                }
            };

            if let Some(trigger) = shutdown.trigger() {
                tracing::debug!(tag = frame.tag(), "shutdown in progress, dropping frame");
                return trigger;
            }
            if let Err(err) = writer.write(&frame).await {
                tracing::warn!(error = %err, "failed to write to host");
                return ShutdownTrigger::StreamError(err.to_string());
            }
        }
    }
}

/// Outcome of [`read_bounded_line`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineRead {
    /// `buf` holds one line, with its newline unless the input ended first
    Line,
    /// The line was longer than the limit and has been skipped
    TooLarge,
    EndOfStream,
}

/// Read one line into `buf` without holding more than `max_bytes` of it.
///
/// The rest of an oversized line is read and thrown away so the next call
/// starts on the following line.
async fn read_bounded_line<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    max_bytes: usize,
) -> io::Result<LineRead>
where
    R: AsyncBufRead + Unpin,
{
    let mut oversized = false;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(if oversized {
                LineRead::TooLarge
            } else if buf.is_empty() {
                LineRead::EndOfStream
            } else {
                LineRead::Line
            });
        }

        let (len, complete) = match available.iter().position(|&b| b == b'\n') {
            Some(pos) => (pos + 1, true),
            None => (available.len(), false),
        };
        if !oversized {
            if buf.len() + len > max_bytes {
                oversized = true;
                buf.clear();
            } else {
                buf.extend_from_slice(&available[..len]);
            }
        }
        reader.consume(len);

        if complete {
            return Ok(if oversized {
                LineRead::TooLarge
            } else {
                LineRead::Line
            });
        }
    }
}

/// Exit code for the result of [`Runner::run`]: success for any graceful
/// shutdown, failure otherwise.
pub fn exit_code(result: &Result<ShutdownTrigger, RunnerError>) -> ExitCode {
    match result {
        Ok(_) => ExitCode::SUCCESS,
        Err(_) => ExitCode::FAILURE,
    }
}

/// Run `module` as a plugin process on stdin and stdout.
///
/// Configuration comes from `KENNEL_PLUGIN_ID` and `KENNEL_PLUGIN_CONFIG`.
/// SIGTERM and SIGINT trigger a graceful shutdown.
pub async fn run_module<M: Module>(module: M) -> ExitCode {
    let config = match RunnerConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            let err = RunnerError::from(err);
            tracing::error!(error = %err, "failed to read plugin configuration");
            let failure = StartupFailure::new(plugin_id_from_env(), err.to_string());
            let mut stdout = FrameWriter::new(tokio::io::stdout());
            if let Err(write_err) = stdout.write(&OutboundFrame::PluginError(failure)).await {
                tracing::error!(error = %write_err, "failed to report startup failure");
            }
            return ExitCode::FAILURE;
        }
    };

    let runner = Runner::new(module, config);
    let signals = match listen_for_signals(runner.shutdown_handle()) {
        Ok(handle) => Some(handle),
        Err(err) => {
            tracing::warn!(error = %err, "failed to install signal handlers");
            None
        }
    };

    let result = runner
        .run(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
        .await;
    if let Some(handle) = signals {
        handle.abort();
    }
    exit_code(&result)
}

/// Blocking entry point: builds a runtime and runs [`run_module`].
///
/// The runtime is shut down without waiting for the blocking stdin reader,
/// which may still be parked on a read the host will never complete.
pub fn run<M: Module>(module: M) -> ExitCode {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            tracing::error!(error = %err, "failed to build async runtime");
            return ExitCode::FAILURE;
        }
    };
    let code = runtime.block_on(run_module(module));
    runtime.shutdown_background();
    code
}
