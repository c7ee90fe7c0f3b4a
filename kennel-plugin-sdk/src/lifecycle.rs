//! Lifecycle controller.
//!
//! [`Lifecycle`] owns a [`Module`] and enforces the call order
//!
//! ```text
//! Created --init--> Initialized --start--> Started --stop--> Stopped
//! ```
//!
//! Requests, events and health checks are only accepted in `Started`.
//! `stop` is accepted from any state and is a no-op once `Stopped`. Module
//! panics are caught and reported as [`LifecycleError::Panicked`].

use crate::config::ModuleConfig;
use crate::error::{panic_message, LifecycleError, ModuleError};
use crate::Module;
use futures::FutureExt;
use kennel_plugin_api::{Event, HealthStatus, ModuleInfo, Request, Response};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

/// Where a module is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Initialized,
    Started,
    Stopped,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LifecycleState::Created => "created",
            LifecycleState::Initialized => "initialized",
            LifecycleState::Started => "started",
            LifecycleState::Stopped => "stopped",
        })
    }
}

/// State machine wrapped around a module
pub struct Lifecycle<M> {
    module: M,
    state: LifecycleState,
    created_at: Instant,
}

impl<M: Module> Lifecycle<M> {
    pub fn new(module: M) -> Self {
        Self {
            module,
            state: LifecycleState::Created,
            created_at: Instant::now(),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Time since the controller was created
    pub fn uptime(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn module(&self) -> &M {
        &self.module
    }

    pub fn info(&self) -> ModuleInfo {
        self.module.info()
    }

    /// `Created -> Initialized`. On failure the state is unchanged.
    pub async fn init(&mut self, config: ModuleConfig) -> Result<(), LifecycleError> {
        self.expect_state("init", LifecycleState::Created)?;
        guarded("init", self.module.init(config)).await?;
        self.state = LifecycleState::Initialized;
        tracing::debug!(state = %self.state, "module initialized");
        Ok(())
    }

    /// `Initialized -> Started`. On failure the state is unchanged.
    pub async fn start(&mut self) -> Result<(), LifecycleError> {
        self.expect_state("start", LifecycleState::Initialized)?;
        guarded("start", self.module.start()).await?;
        self.state = LifecycleState::Started;
        tracing::debug!(state = %self.state, "module started");
        Ok(())
    }

    /// Handle a request. The returned response always carries the request id,
    /// and `data` or `error` only as its `success` flag allows.
    pub async fn handle_request(&mut self, request: Request) -> Result<Response, LifecycleError> {
        self.expect_state("handle a request for", LifecycleState::Started)?;
        let request_id = request.id.clone();
        let mut response = guarded("handle_request", self.module.handle_request(request)).await?;
        if response.id != request_id {
            tracing::warn!(
                request_id = %request_id,
                response_id = %response.id,
                "response id differs from request id, overriding"
            );
            response.id = request_id;
        }
        if response.success {
            response.error = None;
        } else {
            response.data = None;
        }
        Ok(response)
    }

    pub async fn handle_event(&mut self, event: Event) -> Result<bool, LifecycleError> {
        self.expect_state("handle an event for", LifecycleState::Started)?;
        guarded("handle_event", self.module.handle_event(event)).await
    }

    pub async fn check_health(&mut self) -> Result<HealthStatus, LifecycleError> {
        self.expect_state("check health of", LifecycleState::Started)?;
        let uptime = self.uptime();
        guarded("check_health", self.module.check_health(uptime)).await
    }

    /// Move to `Stopped`.
    ///
    /// The module's `stop` only runs if it was started. Calling this again
    /// after it returned is a no-op.
    pub async fn stop(&mut self) -> Result<(), LifecycleError> {
        let previous = self.state;
        if previous == LifecycleState::Stopped {
            return Ok(());
        }
        self.state = LifecycleState::Stopped;
        if previous != LifecycleState::Started {
            tracing::debug!(from = %previous, "stopping a module that never started");
            return Ok(());
        }
        guarded("stop", self.module.stop()).await?;
        tracing::debug!("module stopped");
        Ok(())
    }

    fn expect_state(
        &self,
        operation: &'static str,
        expected: LifecycleState,
    ) -> Result<(), LifecycleError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(LifecycleError::InvalidTransition {
                operation,
                state: self.state,
            })
        }
    }
}

/// Run a module future, turning errors and panics into [`LifecycleError`]
async fn guarded<T>(
    operation: &'static str,
    future: impl Future<Output = Result<T, ModuleError>>,
) -> Result<T, LifecycleError> {
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(source)) => Err(LifecycleError::Module { operation, source }),
        Err(payload) => Err(LifecycleError::Panicked {
            operation,
            message: panic_message(payload),
        }),
    }
}
