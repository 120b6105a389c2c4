//! Lifecycle orchestration for long-running components.
//!
//! Every component runs concurrently under one shared cancellation token. The
//! first component to fail cancels the rest, and its error becomes the result
//! of [`Orchestrator::run`]. On cancellation each component gets a bounded
//! grace period to shut down. The orchestrator returns only once every
//! component has stopped.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use serde::Serialize;
use tokio::signal;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// A long-running part of the service, such as the HTTP server or the task
/// processor.
#[async_trait]
pub trait Component: Send + Sync {
    fn name(&self) -> &str;

    /// Run until the token is cancelled. Returning an error stops the whole
    /// service.
    async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()>;

    /// Release resources after cancellation.
    async fn shutdown(&self) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentState {
    Starting,
    Running,
    ShuttingDown,
    Stopped,
}

/// Shared view of every component's state.
#[derive(Debug, Clone, Default)]
pub struct ComponentStates {
    inner: Arc<Mutex<Vec<(String, ComponentState)>>>,
}

impl ComponentStates {
    fn push(&self, name: String) -> usize {
        let mut states = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        states.push((name, ComponentState::Starting));
        states.len() - 1
    }

    fn set(&self, index: usize, state: ComponentState) {
        let mut states = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(entry) = states.get_mut(index) {
            entry.1 = state;
        }
    }

    /// Current states in registration order.
    pub fn snapshot(&self) -> Vec<(String, ComponentState)> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn get(&self, name: &str) -> Option<ComponentState> {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, state)| *state)
    }
}

/// Keeps the earliest recorded error.
#[derive(Default)]
struct FirstError {
    error: Mutex<Option<anyhow::Error>>,
}

impl FirstError {
    fn record(&self, error: anyhow::Error) {
        let mut slot = self.error.lock().unwrap_or_else(|p| p.into_inner());
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    fn take(&self) -> Option<anyhow::Error> {
        self.error.lock().unwrap_or_else(|p| p.into_inner()).take()
    }
}

pub struct Orchestrator {
    grace: Duration,
    components: Vec<(usize, Arc<dyn Component>)>,
    cancel: CancellationToken,
    states: ComponentStates,
}

impl Orchestrator {
    /// `grace` bounds how long each component may take to stop once
    /// cancellation starts.
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            components: Vec::new(),
            cancel: CancellationToken::new(),
            states: ComponentStates::default(),
        }
    }

    pub fn with_component(mut self, component: Arc<dyn Component>) -> Self {
        let index = self.states.push(component.name().to_string());
        self.components.push((index, component));
        self
    }

    /// Token shared by every component. Cancelling it starts shutdown.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn states(&self) -> ComponentStates {
        self.states.clone()
    }

    /// Run every component until `signal` resolves or one of them fails.
    pub async fn run<F>(self, signal: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let first_error = Arc::new(FirstError::default());

        let signal_task = {
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = signal => {
                        info!("shutdown_signal_received");
                        cancel.cancel();
                    }
                    _ = cancel.cancelled() => {}
                }
            })
        };

        info!(components = self.components.len(), "orchestrator_starting");

        let mut supervisors = JoinSet::new();
        for (index, component) in self.components {
            supervisors.spawn(supervise(
                component,
                index,
                self.cancel.clone(),
                self.grace,
                self.states.clone(),
                Arc::clone(&first_error),
            ));
        }

        while let Some(joined) = supervisors.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "component_supervisor_panicked");
                first_error.record(anyhow!("component supervisor panicked: {e}"));
                self.cancel.cancel();
            }
        }

        self.cancel.cancel();
        let _ = signal_task.await;

        match first_error.take() {
            Some(e) => {
                error!(error = %format!("{e:#}"), "orchestrator_stopped_with_error");
                Err(e)
            }
            None => {
                info!("orchestrator_stopped");
                Ok(())
            }
        }
    }
}

async fn supervise(
    component: Arc<dyn Component>,
    index: usize,
    cancel: CancellationToken,
    grace: Duration,
    states: ComponentStates,
    first_error: Arc<FirstError>,
) {
    let name = component.name().to_string();

    let run = component.run(cancel.clone());
    tokio::pin!(run);

    states.set(index, ComponentState::Running);
    info!(component = %name, "component_started");

    let finished = tokio::select! {
        result = &mut run => Some(result),
        _ = cancel.cancelled() => None,
    };

    let run_done = match finished {
        Some(Ok(())) => true,
        Some(Err(e)) => {
            error!(component = %name, error = %format!("{e:#}"), "component_failed");
            first_error.record(e.context(format!("component {name} failed")));
            cancel.cancel();
            true
        }
        None => false,
    };

    if run_done && !cancel.is_cancelled() {
        states.set(index, ComponentState::Stopped);
        info!(component = %name, "component_finished");
        return;
    }

    states.set(index, ComponentState::ShuttingDown);
    info!(component = %name, "component_shutting_down");

    let drain = async {
        if let Err(e) = component.shutdown().await {
            error!(component = %name, error = %format!("{e:#}"), "component_shutdown_failed");
            first_error.record(e.context(format!("component {name} shutdown failed")));
        }
        if !run_done {
            if let Err(e) = (&mut run).await {
                error!(component = %name, error = %format!("{e:#}"), "component_failed");
                first_error.record(e.context(format!("component {name} failed")));
            }
        }
    };

    if tokio::time::timeout(grace, drain).await.is_err() {
        error!(
            component = %name,
            grace_ms = grace.as_millis() as u64,
            "component_shutdown_timeout"
        );
        first_error.record(anyhow!(
            "component {name} did not stop within {}ms",
            grace.as_millis()
        ));
    }

    states.set(index, ComponentState::Stopped);
    info!(component = %name, "component_stopped");
}

/// Completes when the process receives SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "sigint_handler_install_failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "sigterm_handler_install_failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
