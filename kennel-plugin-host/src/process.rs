//! Driver for one plugin process over its stdin and stdout.

use kennel_plugin_api::{
    decode_outbound, CommandEnvelope, Event, FrameError, HealthStatus, InboundFrame,
    OutboundFrame, ReadyPayload, Request, Response, DEFAULT_REQUEST_TIMEOUT_MS, PLUGIN_CONFIG_ENV,
    PLUGIN_ID_ENV,
};
use serde_json::Value;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

/// How long [`PluginProcess::spawn`] waits for the readiness frame by default
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(30);

/// How long [`PluginProcess::stop`] waits for exit by default before killing
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

/// Errors from plugin host operations.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("failed to spawn plugin process: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("plugin process has no stdin")]
    NoStdin,

    #[error("plugin process has no stdout")]
    NoStdout,

    #[error("failed to write to plugin: {0}")]
    WriteError(#[source] std::io::Error),

    #[error("failed to read from plugin: {0}")]
    ReadError(#[source] std::io::Error),

    #[error("failed to encode command: {0}")]
    EncodeError(#[source] serde_json::Error),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("plugin failed to start: {0}")]
    StartupFailed(String),

    #[error("plugin did not become ready within {0:?}")]
    ReadyTimeout(Duration),

    #[error("plugin did not answer within {0:?}")]
    Timeout(Duration),

    #[error("plugin returned error: {0}")]
    Plugin(String),

    #[error("expected {expected} frame, got {actual}")]
    UnexpectedFrame {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("request/response ID mismatch: sent {sent}, received {received}")]
    IdMismatch { sent: String, received: String },

    #[error("failed to signal plugin: {0}")]
    SignalFailed(#[source] std::io::Error),

    #[error("plugin process terminated unexpectedly")]
    ProcessTerminated,
}

/// What to run and what to hand it.
#[derive(Debug, Clone)]
pub struct PluginCommand {
    /// Path to the plugin executable.
    pub program: PathBuf,

    pub args: Vec<String>,

    /// Passed as `KENNEL_PLUGIN_ID`.
    pub plugin_id: String,

    /// Passed verbatim as `KENNEL_PLUGIN_CONFIG`.
    pub config: String,

    /// Extra environment variables.
    pub env: Vec<(String, String)>,
}

impl PluginCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            plugin_id: String::new(),
            config: "{}".to_string(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn plugin_id(mut self, plugin_id: impl Into<String>) -> Self {
        self.plugin_id = plugin_id.into();
        self
    }

    /// Settings object for the plugin
    pub fn config(mut self, config: &Value) -> Self {
        self.config = config.to_string();
        self
    }

    /// Configuration text passed through unchecked
    pub fn raw_config(mut self, config: impl Into<String>) -> Self {
        self.config = config.into();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env(PLUGIN_ID_ENV, &self.plugin_id)
            .env(PLUGIN_CONFIG_ENV, &self.config)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd
    }
}

/// A running plugin that has announced readiness.
///
/// Commands are sent one at a time; each call waits for the frame that
/// answers it. The plugin answers every command with exactly one frame, in
/// order, so answers that arrive after their call timed out are counted and
/// discarded by the next call.
pub struct PluginProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Lines<BufReader<ChildStdout>>,
    ready: ReadyPayload,
    /// Commands whose answer has not been read yet
    overdue: usize,
}

impl PluginProcess {
    /// Spawn the plugin and wait up to `ready_timeout` for
    /// `KENNEL_PLUGIN_READY`.
    pub async fn spawn(
        command: &PluginCommand,
        ready_timeout: Duration,
    ) -> Result<Self, HostError> {
        let mut child = command
            .to_command()
            .spawn()
            .map_err(HostError::SpawnFailed)?;
        let stdin = child.stdin.take().ok_or(HostError::NoStdin)?;
        let stdout = child.stdout.take().ok_or(HostError::NoStdout)?;
        let mut stdout = BufReader::new(stdout).lines();

        let frame = tokio::time::timeout(ready_timeout, next_frame(&mut stdout))
            .await
            .map_err(|_| HostError::ReadyTimeout(ready_timeout))??;

        match frame {
            OutboundFrame::Ready(ready) => {
                tracing::debug!(
                    plugin_id = %ready.plugin_id,
                    module = %ready.info.id,
                    "plugin ready"
                );
                Ok(Self {
                    child,
                    stdin: Some(stdin),
                    stdout,
                    ready,
                    overdue: 0,
                })
            }
            OutboundFrame::PluginError(failure) => {
                let _ = child.wait().await;
                Err(HostError::StartupFailed(failure.error))
            }
            other => Err(HostError::UnexpectedFrame {
                expected: kennel_plugin_api::READY_TAG,
                actual: other.tag(),
            }),
        }
    }

    /// The readiness announcement
    pub fn ready(&self) -> &ReadyPayload {
        &self.ready
    }

    /// OS process id, while the process is running
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Send a request and wait for its response.
    ///
    /// The request's own timeout bounds the wait; a timeout of 0 means the
    /// default.
    pub async fn request(&mut self, request: Request) -> Result<Response, HostError> {
        let timeout = match request.timeout {
            0 => default_timeout(),
            millis => Duration::from_millis(millis),
        };
        let envelope = CommandEnvelope::request(&request).map_err(HostError::EncodeError)?;
        self.send(InboundFrame::Command(envelope)).await?;

        match self.reply(timeout).await? {
            OutboundFrame::Response(response) if response.id == request.id => Ok(response),
            OutboundFrame::Response(response) => Err(HostError::IdMismatch {
                sent: request.id,
                received: response.id,
            }),
            other => Err(unexpected(kennel_plugin_api::RESPONSE_TAG, other)),
        }
    }

    /// Send an event; returns the plugin's acknowledgement flag.
    pub async fn send_event(&mut self, event: Event) -> Result<bool, HostError> {
        let envelope = CommandEnvelope::event(&event).map_err(HostError::EncodeError)?;
        self.send(InboundFrame::Command(envelope)).await?;

        match self.reply(default_timeout()).await? {
            OutboundFrame::EventResponse(ack) if ack.event_id == event.id => Ok(ack.success),
            OutboundFrame::EventResponse(ack) => Err(HostError::IdMismatch {
                sent: event.id,
                received: ack.event_id,
            }),
            other => Err(unexpected(kennel_plugin_api::EVENT_RESPONSE_TAG, other)),
        }
    }

    pub async fn check_health(&mut self) -> Result<HealthStatus, HostError> {
        self.send(InboundFrame::Command(CommandEnvelope::health_check()))
            .await?;

        match self.reply(default_timeout()).await? {
            OutboundFrame::Health(status) => Ok(status),
            other => Err(unexpected(kennel_plugin_api::HEALTH_RESPONSE_TAG, other)),
        }
    }

    /// Write an arbitrary line (a newline is appended)
    pub async fn send_raw(&mut self, line: &str) -> Result<(), HostError> {
        let stdin = self.stdin.as_mut().ok_or(HostError::ProcessTerminated)?;
        stdin
            .write_all(format!("{}\n", line).as_bytes())
            .await
            .map_err(HostError::WriteError)?;
        stdin.flush().await.map_err(HostError::WriteError)
    }

    /// Next protocol frame, skipping any other output
    pub async fn next_frame(&mut self) -> Result<OutboundFrame, HostError> {
        next_frame(&mut self.stdout).await
    }

    /// Close the plugin's stdin, which it treats as a shutdown request
    pub fn close_stdin(&mut self) {
        self.stdin = None;
    }

    /// Deliver SIGTERM (or kill, where signals are unavailable)
    pub fn terminate(&mut self) -> Result<(), HostError> {
        #[cfg(unix)]
        {
            let pid = self.child.id().ok_or(HostError::ProcessTerminated)?;
            // SAFETY: kill(2) has no memory-safety preconditions.
            let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
            if rc != 0 {
                return Err(HostError::SignalFailed(std::io::Error::last_os_error()));
            }
            Ok(())
        }

        #[cfg(not(unix))]
        {
            self.child.start_kill().map_err(HostError::SignalFailed)
        }
    }

    /// Wait for the process to exit on its own; returns the exit code.
    pub async fn wait(mut self) -> Result<Option<i32>, HostError> {
        self.stdin = None;
        let status = self.child.wait().await.map_err(HostError::ReadError)?;
        Ok(status.code())
    }

    /// Graceful stop: write `KENNEL_STOP`, close stdin and wait up to
    /// `grace` before killing. Returns the exit code.
    pub async fn stop(mut self, grace: Duration) -> Result<Option<i32>, HostError> {
        if let Err(err) = self.send(InboundFrame::Stop).await {
            tracing::debug!(error = %err, "could not deliver stop frame");
        }
        self.stdin = None;

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => Ok(status.map_err(HostError::ReadError)?.code()),
            Err(_) => {
                tracing::warn!(grace = ?grace, "plugin ignored stop, killing");
                self.child.kill().await.map_err(HostError::SignalFailed)?;
                let status = self.child.wait().await.map_err(HostError::ReadError)?;
                Ok(status.code())
            }
        }
    }

    async fn send(&mut self, frame: InboundFrame) -> Result<(), HostError> {
        let line = frame.encode()?;
        self.send_raw(&line).await
    }

    /// Wait for the frame answering the last command. `KENNEL_ERROR` is
    /// turned into [`HostError::Plugin`].
    async fn reply(&mut self, timeout: Duration) -> Result<OutboundFrame, HostError> {
        let frame = match tokio::time::timeout(timeout, self.next_answer()).await {
            Ok(frame) => frame?,
            Err(_) => {
                self.overdue += 1;
                return Err(HostError::Timeout(timeout));
            }
        };
        match frame {
            OutboundFrame::Error(payload) => Err(HostError::Plugin(payload.error)),
            frame => Ok(frame),
        }
    }

    async fn next_answer(&mut self) -> Result<OutboundFrame, HostError> {
        loop {
            let frame = next_frame(&mut self.stdout).await?;
            if self.overdue == 0 {
                return Ok(frame);
            }
            self.overdue -= 1;
            tracing::debug!(tag = frame.tag(), "discarding answer to a timed out command");
        }
    }
}

async fn next_frame(
    stdout: &mut Lines<BufReader<ChildStdout>>,
) -> Result<OutboundFrame, HostError> {
    loop {
        let line = stdout
            .next_line()
            .await
            .map_err(HostError::ReadError)?
            .ok_or(HostError::ProcessTerminated)?;
        match decode_outbound(&line)? {
            Some(frame) => return Ok(frame),
            None => tracing::debug!(line = %line, "ignoring non-protocol output"),
        }
    }
}

fn unexpected(expected: &'static str, frame: OutboundFrame) -> HostError {
    HostError::UnexpectedFrame {
        expected,
        actual: frame.tag(),
    }
}

fn default_timeout() -> Duration {
    Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS)
}
