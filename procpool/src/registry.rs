// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Named worker classes.
//!
//! A worker class is a factory that builds the command router a child
//! serves. The parent holds the same registry the worker image links, which
//! is what lets the supervisor reject an unknown class synchronously,
//! before a process is ever spawned.

use procpool_ipc::{CommandRouter, Endpoint};
use std::collections::HashMap;
use std::sync::Arc;

/// The worker class used when a pool does not name one: a child that only
/// understands the built-in control commands.
pub const DEFAULT_HANDLER: &str = "default";

/// Builds a child's router. Receives the child's endpoint (so handlers can
/// call back to the parent) and the positional arguments from the pool
/// configuration.
pub type RouterFactory = Arc<dyn Fn(&Endpoint, &[String]) -> CommandRouter + Send + Sync>;

pub struct WorkerRegistry {
    factories: HashMap<String, RouterFactory>,
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        let mut registry = WorkerRegistry::empty();
        registry.register(DEFAULT_HANDLER, |_: &Endpoint, _: &[String]| {
            CommandRouter::new()
        });
        registry
    }
}

impl WorkerRegistry {
    pub fn empty() -> Self {
        WorkerRegistry {
            factories: HashMap::new(),
        }
    }

    /// Registers a worker class. Registering a name twice is a programmer
    /// error and panics.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&Endpoint, &[String]) -> CommandRouter + Send + Sync + 'static,
    {
        let name = name.into();
        if self
            .factories
            .insert(name.clone(), Arc::new(factory))
            .is_some()
        {
            panic!("worker class {name:?} registered twice");
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn resolve(&self, name: &str) -> Option<RouterFactory> {
        self.factories.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_resolves_the_default_class() {
        let registry = WorkerRegistry::default();
        assert!(registry.contains(DEFAULT_HANDLER));
        assert!(!registry.contains("nope"));
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn duplicate_class_panics() {
        let mut registry = WorkerRegistry::default();
        registry.register(DEFAULT_HANDLER, |_: &Endpoint, _: &[String]| {
            CommandRouter::new()
        });
    }
}
