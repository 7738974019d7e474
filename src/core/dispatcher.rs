//! Concurrent task fan-out with per-task isolation.
//!
//! Every enabled task runs on its own tokio task, bounded by its own
//! timeout. A panic, error or timeout only ever produces a `Failure`
//! outcome for that task. Outcomes are yielded as they land; the stream
//! ends once every task has settled.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{BoxStream, FuturesUnordered, StreamExt};
use thiserror::Error;
use tracing::{debug, error, warn};
use url::Url;

use crate::adapters::{Check, CheckError};
use crate::domain::{TaskOutcome, TaskType};

use super::registry::TaskRegistry;
use super::validation::ValidationError;

/// Stream of settled task outcomes, in arrival order
pub type OutcomeStream = BoxStream<'static, (TaskType, TaskOutcome)>;

/// Reasons dispatch is refused before any task starts
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("No check registered for task type: {0}")]
    Unregistered(TaskType),
}

/// Launches checks against one target
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<TaskRegistry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<TaskRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    /// Verify every task is runnable without launching anything
    pub fn plan(&self, tasks: &BTreeSet<TaskType>) -> Result<(), DispatchError> {
        if tasks.is_empty() {
            return Err(ValidationError::EmptyTaskList.into());
        }
        match tasks.iter().find(|t| !self.registry.contains(**t)) {
            Some(missing) => Err(DispatchError::Unregistered(*missing)),
            None => Ok(()),
        }
    }

    /// Start every task and return their outcomes as they settle.
    ///
    /// Nothing is launched unless every task type is registered. Must be
    /// called from within a tokio runtime.
    pub fn dispatch(&self, target: &Url, tasks: &BTreeSet<TaskType>) -> Result<OutcomeStream, DispatchError> {
        self.plan(tasks)?;

        let running = FuturesUnordered::new();
        for task in tasks.iter().copied() {
            let Some(registered) = self.registry.get(task) else {
                return Err(DispatchError::Unregistered(task));
            };

            let handle = tokio::spawn(run_task(
                task,
                Arc::clone(&registered.check),
                target.clone(),
                registered.spec.timeout,
            ));

            running.push(async move {
                match handle.await {
                    Ok(outcome) => (task, outcome),
                    Err(join_error) => {
                        let message = if join_error.is_panic() {
                            extract_panic_message(&join_error.into_panic())
                        } else {
                            "task cancelled".to_string()
                        };
                        error!(task = %task, panic = %message, "Task panicked");
                        (task, TaskOutcome::failure(format!("check panicked: {}", message)))
                    }
                }
            });
        }

        debug!(url = %target, tasks = running.len(), "Dispatched tasks");
        Ok(running.boxed())
    }
}

/// Run one check to a terminal outcome
async fn run_task(task: TaskType, check: Arc<dyn Check>, target: Url, timeout: Duration) -> TaskOutcome {
    let started = Instant::now();

    let outcome = match tokio::time::timeout(timeout, check.run(&target, timeout)).await {
        Err(_) => {
            warn!(task = %task, timeout_ms = timeout.as_millis() as u64, "Task timed out");
            TaskOutcome::timeout()
        }
        Ok(Err(CheckError::Timeout(_))) => {
            warn!(task = %task, "Check reported timeout");
            TaskOutcome::timeout()
        }
        Ok(Err(e)) => {
            warn!(task = %task, error = %e, "Task failed");
            TaskOutcome::failure(e.to_string())
        }
        Ok(Ok(report)) => TaskOutcome::from(report),
    };

    debug!(
        task = %task,
        success = outcome.is_success(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Task settled"
    );

    outcome
}

fn extract_panic_message(panic_info: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic_info.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
