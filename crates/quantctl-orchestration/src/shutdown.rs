//! Graceful Shutdown Coordinator: runs registered shutdown steps in order,
//! under per-step and global deadlines, and reports completion on its own
//! channel so supervising code can join.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use quantctl_shared::error::ErrorKind;
use thiserror::Error;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tracing::{error, warn};

#[async_trait]
pub trait ShutdownHandler: Send + Sync {
    async fn run(&self) -> Result<(), String>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> ShutdownHandler for FnHandler<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), String>> + Send,
{
    async fn run(&self) -> Result<(), String> {
        (self.0)().await
    }
}

pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ShutdownHandler>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), String>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

struct Step {
    name: String,
    priority: i32,
    timeout: Duration,
    handler: Arc<dyn ShutdownHandler>,
}

#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub name: String,
    pub succeeded: bool,
    pub error: Option<String>,
}

#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("shutdown already in progress")]
    AlreadyInProgress,
}

impl ShutdownError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::InvalidState
    }
}

/// Registered step list plus the idempotency guard and completion signal.
pub struct ShutdownCoordinator {
    steps: Mutex<Vec<Step>>,
    /// Explicit declared order (step names, first-to-last). Empty means
    /// "fall back to descending priority".
    declared_order: Vec<String>,
    force_after: Duration,
    in_progress: AtomicBool,
    completion_tx: watch::Sender<bool>,
    completion_rx: watch::Receiver<bool>,
}

impl std::fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("declared_order", &self.declared_order)
            .field("force_after", &self.force_after)
            .finish()
    }
}

impl ShutdownCoordinator {
    pub fn new(declared_order: Vec<String>, force_after: Duration) -> Arc<Self> {
        let (tx, rx) = watch::channel(false);
        Arc::new(Self {
            steps: Mutex::new(Vec::new()),
            declared_order,
            force_after,
            in_progress: AtomicBool::new(false),
            completion_tx: tx,
            completion_rx: rx,
        })
    }

    pub async fn register(
        &self,
        name: &str,
        priority: i32,
        timeout: Duration,
        handler: Arc<dyn ShutdownHandler>,
    ) {
        self.steps.lock().await.push(Step {
            name: name.to_string(),
            priority,
            timeout,
            handler,
        });
    }

    /// A clone of the completion channel; resolves once `shutdown()`
    /// finishes running every step (or the force deadline fires).
    pub fn completion(&self) -> watch::Receiver<bool> {
        self.completion_rx.clone()
    }

    fn ordered_steps(&self, steps: Vec<Step>) -> Vec<Step> {
        if self.declared_order.is_empty() {
            let mut steps = steps;
            steps.sort_by(|a, b| b.priority.cmp(&a.priority));
            return steps;
        }
        let mut by_name: std::collections::HashMap<String, Step> =
            steps.into_iter().map(|s| (s.name.clone(), s)).collect();
        let mut ordered = Vec::new();
        for name in &self.declared_order {
            if let Some(step) = by_name.remove(name) {
                ordered.push(step);
            }
        }
        let mut remaining: Vec<Step> = by_name.into_values().collect();
        remaining.sort_by(|a, b| b.priority.cmp(&a.priority));
        ordered.extend(remaining);
        ordered
    }

    /// Run every registered step in order. Idempotent: a concurrent or
    /// repeat call while a shutdown is in flight is rejected.
    pub async fn shutdown(self: &Arc<Self>) -> Result<Vec<StepOutcome>, ShutdownError> {
        if self.in_progress.swap(true, Ordering::SeqCst) {
            return Err(ShutdownError::AlreadyInProgress);
        }

        let steps = std::mem::take(&mut *self.steps.lock().await);
        let ordered = self.ordered_steps(steps);

        let this = self.clone();
        let run = async move {
            let mut outcomes = Vec::new();
            for step in ordered {
                let result = tokio::time::timeout(step.timeout, step.handler.run()).await;
                let outcome = match result {
                    Ok(Ok(())) => StepOutcome { name: step.name.clone(), succeeded: true, error: None },
                    Ok(Err(e)) => {
                        error!(step = %step.name, error = %e, "shutdown step failed");
                        StepOutcome { name: step.name.clone(), succeeded: false, error: Some(e) }
                    }
                    Err(_) => {
                        warn!(step = %step.name, "shutdown step exceeded its timeout");
                        StepOutcome {
                            name: step.name.clone(),
                            succeeded: false,
                            error: Some("timed out".to_string()),
                        }
                    }
                };
                outcomes.push(outcome);
            }
            let _ = this.completion_tx.send(true);
            outcomes
        };

        let outcomes = match tokio::time::timeout(self.force_after, run).await {
            Ok(outcomes) => outcomes,
            Err(_) => {
                warn!("global force-shutdown deadline fired, remaining steps cancelled");
                let _ = self.completion_tx.send(true);
                Vec::new()
            }
        };

        Ok(outcomes)
    }
}
