//! Shutdown coordination.
//!
//! Several things can end a running plugin: a stop frame, the host closing
//! stdin, a read error, or a termination signal. They can fire at the same
//! moment from different tasks. [`ShutdownCoordinator`] records the first
//! trigger, wakes every waiter, and hands out the right to run the module's
//! `stop` exactly once through [`ShutdownCoordinator::claim_stop`].

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// What caused the shutdown
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownTrigger {
    /// `KENNEL_STOP` was read
    StopFrame,

    /// The host closed stdin
    EndOfStream,

    /// A termination signal (`SIGTERM`, `SIGINT`, ...)
    Signal(&'static str),

    /// Reading stdin failed
    StreamError(String),
}

impl fmt::Display for ShutdownTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownTrigger::StopFrame => f.write_str("stop frame"),
            ShutdownTrigger::EndOfStream => f.write_str("end of stream"),
            ShutdownTrigger::Signal(name) => write!(f, "signal {}", name),
            ShutdownTrigger::StreamError(err) => write!(f, "read error: {}", err),
        }
    }
}

#[derive(Debug)]
struct Inner {
    trigger: OnceLock<ShutdownTrigger>,
    notify: watch::Sender<bool>,
    stop_claimed: AtomicBool,
}

/// One-shot shutdown signal shared by the read loop and signal listeners.
/// Cloning is cheap; all clones observe the same state.
#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    inner: Arc<Inner>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (notify, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                trigger: OnceLock::new(),
                notify,
                stop_claimed: AtomicBool::new(false),
            }),
        }
    }

    /// Request shutdown. Returns `true` if this call was the first.
    ///
    /// Later calls are absorbed: they neither replace the recorded trigger
    /// nor wake anyone again.
    pub fn request(&self, trigger: ShutdownTrigger) -> bool {
        let mut won = false;
        self.inner.trigger.get_or_init(|| {
            won = true;
            trigger.clone()
        });
        if won {
            tracing::info!(trigger = %trigger, "shutdown requested");
            self.inner.notify.send_replace(true);
        } else {
            tracing::debug!(trigger = %trigger, "shutdown already in progress");
        }
        won
    }

    pub fn is_requested(&self) -> bool {
        self.inner.trigger.get().is_some()
    }

    /// The winning trigger, if any
    pub fn trigger(&self) -> Option<ShutdownTrigger> {
        self.inner.trigger.get().cloned()
    }

    /// Wait until shutdown is requested and return the winning trigger.
    ///
    /// Cancel safe.
    pub async fn requested(&self) -> ShutdownTrigger {
        let mut rx = self.inner.notify.subscribe();
        loop {
            if let Some(trigger) = self.inner.trigger.get() {
                return trigger.clone();
            }
            // The sender lives in `inner`, which we hold, so this cannot fail.
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Claim the right to run teardown. Only the first caller gets `true`.
    pub fn claim_stop(&self) -> bool {
        self.inner
            .stop_claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Spawn a task that turns termination signals into shutdown requests.
///
/// Handlers are registered before this returns, so a signal delivered
/// afterwards is never lost to the default disposition.
pub fn listen_for_signals(coordinator: ShutdownCoordinator) -> io::Result<JoinHandle<()>> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = signal(SignalKind::terminate())?;
        let mut interrupt = signal(SignalKind::interrupt())?;
        Ok(tokio::spawn(async move {
            let name = tokio::select! {
                _ = terminate.recv() => "SIGTERM",
                _ = interrupt.recv() => "SIGINT",
            };
            coordinator.request(ShutdownTrigger::Signal(name));
        }))
    }

    #[cfg(not(unix))]
    {
        Ok(tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                coordinator.request(ShutdownTrigger::Signal("ctrl-c"));
            }
        }))
    }
}
