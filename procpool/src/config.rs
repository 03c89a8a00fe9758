// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::PoolError;
use crate::registry::{WorkerRegistry, DEFAULT_HANDLER};
use procpool_ipc::{CommandRouter, Endpoint};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_MIN: usize = 5;
pub const DEFAULT_MAX: usize = 20;
pub const DEFAULT_MAX_IDLE: Duration = Duration::from_secs(20);
pub const DEFAULT_RECYCLE_AFTER: u32 = 500;

/// Builds the router the parent serves on one child's endpoint, i.e. the
/// commands children may call on the parent. One router per child.
pub type ParentRouterFactory = Arc<dyn Fn(&Endpoint) -> CommandRouter + Send + Sync>;

#[derive(Clone)]
pub struct PoolConfig {
    /// Worker image to launch; `None` re-executes the current binary, which
    /// must route bootstrap argv through [`crate::worker::maybe_run`].
    pub program: Option<PathBuf>,
    /// Worker class name, resolved through `registry` on both sides.
    pub handler: String,
    /// Positional arguments forwarded to the worker class factory.
    pub args: Vec<String>,
    pub min: usize,
    pub max: usize,
    /// Idle time after which a worker above `min` is pruned. Zero disables
    /// pruning.
    pub max_idle: Duration,
    /// Calls after which a worker is replaced. Zero disables recycling.
    pub recycle_after: u32,
    pub registry: Arc<WorkerRegistry>,
    /// Handlers the parent serves to its children, if any.
    pub parent_router: Option<ParentRouterFactory>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            program: None,
            handler: DEFAULT_HANDLER.to_owned(),
            args: Vec::new(),
            min: DEFAULT_MIN,
            max: DEFAULT_MAX,
            max_idle: DEFAULT_MAX_IDLE,
            recycle_after: DEFAULT_RECYCLE_AFTER,
            registry: Arc::new(WorkerRegistry::default()),
            parent_router: None,
        }
    }
}

impl PoolConfig {
    pub fn new(handler: impl Into<String>) -> Self {
        PoolConfig {
            handler: handler.into(),
            ..Default::default()
        }
    }

    pub fn program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = Some(program.into());
        self
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn limits(mut self, min: usize, max: usize) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    pub fn max_idle(mut self, max_idle: Duration) -> Self {
        self.max_idle = max_idle;
        self
    }

    pub fn recycle_after(mut self, recycle_after: u32) -> Self {
        self.recycle_after = recycle_after;
        self
    }

    pub fn registry(mut self, registry: Arc<WorkerRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn parent_router<F>(mut self, factory: F) -> Self
    where
        F: Fn(&Endpoint) -> CommandRouter + Send + Sync + 'static,
    {
        self.parent_router = Some(Arc::new(factory));
        self
    }

    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max < self.min {
            return Err(PoolError::InvalidConfig(format!(
                "max ({}) must be at least min ({})",
                self.max, self.min
            )));
        }
        if self.handler.is_empty() {
            return Err(PoolError::InvalidConfig(
                "worker class name must not be empty".into(),
            ));
        }
        Ok(())
    }
}
