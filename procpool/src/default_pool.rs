// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A process-wide pool for callers that do not want to manage one.
//!
//! The pool is built on first use from [`PoolConfig::default`] plus the
//! `PROCPOOL_DEFAULT_*` environment overrides, and started on the first
//! [`dispatch`]. Teardown is explicit: call [`stop_default_pool`]. Tests
//! and anything with real requirements should construct their own
//! [`ProcessPool`]; this is a convenience only.

use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::pool::ProcessPool;
use procpool_ipc::Command;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::warn;

const ENV_DEFAULT_WORKER_IMAGE: &str = "PROCPOOL_DEFAULT_WORKER_IMAGE";
const ENV_DEFAULT_HANDLER: &str = "PROCPOOL_DEFAULT_HANDLER";
const ENV_DEFAULT_MIN: &str = "PROCPOOL_DEFAULT_MIN";
const ENV_DEFAULT_MAX: &str = "PROCPOOL_DEFAULT_MAX";
const ENV_DEFAULT_MAX_IDLE_SECS: &str = "PROCPOOL_DEFAULT_MAX_IDLE_SECS";

static DEFAULT_POOL: OnceLock<ProcessPool> = OnceLock::new();

fn env_number(name: &str) -> Option<u64> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(variable = name, value = %raw, "ignoring unparsable override");
            None
        }
    }
}

fn config_from_env() -> PoolConfig {
    let mut config = PoolConfig::default();
    if let Ok(image) = std::env::var(ENV_DEFAULT_WORKER_IMAGE) {
        config.program = Some(image.into());
    }
    if let Ok(handler) = std::env::var(ENV_DEFAULT_HANDLER) {
        config.handler = handler;
    }
    if let Some(min) = env_number(ENV_DEFAULT_MIN) {
        config.min = min as usize;
    }
    if let Some(max) = env_number(ENV_DEFAULT_MAX) {
        config.max = max as usize;
    }
    if let Some(secs) = env_number(ENV_DEFAULT_MAX_IDLE_SECS) {
        config.max_idle = Duration::from_secs(secs);
    }
    config
}

/// The process-global pool, built lazily. Fails if the environment
/// overrides produce an invalid configuration.
pub fn default_pool() -> Result<&'static ProcessPool, PoolError> {
    if let Some(pool) = DEFAULT_POOL.get() {
        return Ok(pool);
    }
    // Losing this race just discards an unstarted pool.
    let pool = ProcessPool::new(config_from_env())?;
    Ok(DEFAULT_POOL.get_or_init(|| pool))
}

/// Forwards one call to the default pool, starting it on first use.
pub async fn dispatch<C: Command>(request: &C::Request) -> Result<C::Response, PoolError> {
    let pool = default_pool()?;
    match pool.start().await {
        Ok(()) | Err(PoolError::AlreadyStarted) => {}
        Err(e) => return Err(e),
    }
    pool.do_work::<C>(request).await
}

/// Stops the default pool if it was ever built. Terminal: later
/// [`dispatch`] calls fail with [`PoolError::PoolStopped`].
pub async fn stop_default_pool() -> Result<(), PoolError> {
    match DEFAULT_POOL.get() {
        Some(pool) => pool.stop().await,
        None => Ok(()),
    }
}
