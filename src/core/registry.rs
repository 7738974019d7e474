//! Task registry and the versioned weight table.
//!
//! The registry is a static map from [`TaskType`] to the [`Check`] that
//! backs it, plus the per-type timeout. Weights live in a separate,
//! versioned table so persisted scores stay tied to the table they were
//! computed with.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::adapters::{Check, HttpCheck};
use crate::core::retry::RetryPolicy;
use crate::domain::TaskType;

/// Weight in basis points; 10_000 == 1.0
pub type Weight = u32;

/// Upper bound for a single weight (1.0)
pub const MAX_WEIGHT: Weight = 10_000;

/// Default per-task timeout
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(45);

/// Attempts granted to AI-backed checks
pub const AI_MAX_ATTEMPTS: u32 = 3;

/// A static, versioned table of task weights
#[derive(Debug, Clone, Copy)]
pub struct WeightTable {
    pub version: u32,
    entries: &'static [(TaskType, Weight)],
    fallback: Weight,
}

/// First published weight table
pub const WEIGHTS_V1: WeightTable = WeightTable {
    version: 1,
    entries: &[
        (TaskType::SecurityHeaders, 1_000),
        (TaskType::Ssl, 1_000),
        (TaskType::Dns, 500),
        (TaskType::Cors, 500),
        (TaskType::Cookies, 500),
        (TaskType::Csrf, 500),
        (TaskType::ApiKeys, 1_000),
        (TaskType::Xss, 1_000),
        (TaskType::Sqli, 1_000),
        (TaskType::Tech, 500),
        (TaskType::Redirect, 500),
        (TaskType::DebugEndpoints, 500),
        (TaskType::Legal, 300),
        (TaskType::Vibe, 200),
    ],
    fallback: 500,
};

impl WeightTable {
    /// Build a table from explicit entries
    pub const fn new(version: u32, entries: &'static [(TaskType, Weight)], fallback: Weight) -> Self {
        Self {
            version,
            entries,
            fallback,
        }
    }

    /// Weight for `task` clamped into 1..=10_000, or the fallback if the
    /// table has no entry
    pub fn weight_for(&self, task: TaskType) -> Weight {
        let raw = self
            .entries
            .iter()
            .find(|(t, _)| *t == task)
            .map(|(_, w)| *w)
            .unwrap_or(self.fallback);
        raw.clamp(1, MAX_WEIGHT)
    }

    pub fn fallback(&self) -> Weight {
        self.fallback.clamp(1, MAX_WEIGHT)
    }
}

impl Default for WeightTable {
    fn default() -> Self {
        WEIGHTS_V1
    }
}

/// Static per-type settings
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub task_type: TaskType,

    /// Upper bound on the whole check, retries included
    pub timeout: Duration,
}

/// One registered check
#[derive(Clone)]
pub struct RegisteredTask {
    pub spec: TaskSpec,
    pub check: Arc<dyn Check>,
}

/// Map from task type to the check backing it
#[derive(Clone, Default)]
pub struct TaskRegistry {
    tasks: HashMap<TaskType, RegisteredTask>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the check for `task_type`
    pub fn register(&mut self, task_type: TaskType, timeout: Duration, check: Arc<dyn Check>) {
        self.tasks.insert(
            task_type,
            RegisteredTask {
                spec: TaskSpec { task_type, timeout },
                check,
            },
        );
    }

    /// Builder form of [`TaskRegistry::register`]
    pub fn with(mut self, task_type: TaskType, timeout: Duration, check: Arc<dyn Check>) -> Self {
        self.register(task_type, timeout, check);
        self
    }

    /// Registry backed by the remote scanner functions, one per task type
    pub fn http(
        client: reqwest::Client,
        base_url: &str,
        key: Option<String>,
        timeout: Duration,
        retry_policy: &RetryPolicy,
    ) -> Self {
        let mut registry = Self::new();
        for task in TaskType::ALL {
            let policy = if task.is_ai_backed() {
                retry_policy.clone().with_max_attempts(AI_MAX_ATTEMPTS.max(retry_policy.max_attempts))
            } else {
                retry_policy.clone()
            };
            let check = HttpCheck::new(client.clone(), base_url, key.clone(), task, policy);
            registry.register(task, timeout, Arc::new(check));
        }
        registry
    }

    pub fn get(&self, task_type: TaskType) -> Option<&RegisteredTask> {
        self.tasks.get(&task_type)
    }

    pub fn contains(&self, task_type: TaskType) -> bool {
        self.tasks.contains_key(&task_type)
    }

    /// Registered task types in stable order
    pub fn task_types(&self) -> Vec<TaskType> {
        let mut types: Vec<TaskType> = self.tasks.keys().copied().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.task_types())
            .finish()
    }
}
