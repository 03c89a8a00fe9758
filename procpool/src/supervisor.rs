// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Spawns one worker process and ties its lifetime to an endpoint.
//!
//! The child's stdout is the inbound stream, its stdin the outbound one;
//! stderr is inherited so worker logs land next to the parent's. A monitor
//! task owns the `Child`, reaps it, and fulfills the shared finished-signal
//! once the endpoint has drained whatever the child wrote before exiting.

use crate::config::PoolConfig;
use crate::error::PoolError;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use procpool_ipc::{CommandRouter, Endpoint};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::process::{ExitStatus, Stdio};
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Argv marker the worker image keys on; the bootstrap payload follows it.
pub const WORKER_ARG: &str = "__procpool-worker";

/// Why a worker process went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    CleanExit,
    NonzeroExit(i32),
    Killed(i32),
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::CleanExit => write!(f, "clean exit"),
            ExitReason::NonzeroExit(code) => write!(f, "exit code {code}"),
            ExitReason::Killed(signal) => write!(f, "killed by signal {signal}"),
        }
    }
}

/// Single-shot, multi-subscriber: the pool's watcher and any number of
/// `stop`-style callers all await the same exit.
pub type FinishedSignal = Shared<BoxFuture<'static, ExitReason>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// A spawned worker, ready for calls the moment it is returned.
pub struct WorkerProcess {
    pub id: WorkerId,
    pub pid: u32,
    pub endpoint: Endpoint,
    pub finished: FinishedSignal,
}

/// What the child needs to know to become the configured worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerBootstrap {
    pub handler: String,
    pub args: Vec<String>,
}

/// Launches one worker for `config`.
///
/// Fails with [`PoolError::UnresolvedChild`] before spawning anything if the
/// configured worker class is unknown to the registry: the worker image
/// links the same registrations, so it could not construct the class
/// either.
pub fn spawn_worker(config: &PoolConfig, id: WorkerId) -> Result<WorkerProcess, PoolError> {
    if !config.registry.contains(&config.handler) {
        return Err(PoolError::UnresolvedChild(config.handler.clone()));
    }

    let program = match &config.program {
        Some(program) => program.clone(),
        None => std::env::current_exe().map_err(PoolError::Spawn)?,
    };
    let bootstrap = WorkerBootstrap {
        handler: config.handler.clone(),
        args: config.args.clone(),
    };
    let bootstrap = serde_json::to_string(&bootstrap)
        .map_err(|e| PoolError::InvalidConfig(format!("unencodable bootstrap: {e}")))?;

    let mut child = Command::new(&program)
        .arg(WORKER_ARG)
        .arg(bootstrap)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .map_err(PoolError::Spawn)?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| PoolError::Spawn(io::Error::other("child stdin was not piped")))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| PoolError::Spawn(io::Error::other("child stdout was not piped")))?;
    let pid = child.id().unwrap_or_default();

    let endpoint = Endpoint::start_with(stdout, stdin, |ep| match &config.parent_router {
        Some(factory) => factory(ep),
        None => CommandRouter::new(),
    });

    let (finished_tx, finished_rx) = oneshot::channel();
    let monitor_endpoint = endpoint.clone();
    tokio::spawn(async move {
        let reason = match child.wait().await {
            Ok(status) => exit_reason(status),
            Err(e) => {
                warn!(pid, error = %e, "failed to reap worker");
                ExitReason::Killed(0)
            }
        };
        // The pipe still holds whatever the child flushed before dying;
        // finished must not fire until the endpoint has seen all of it.
        monitor_endpoint.until_closed().await;
        debug!(pid, %reason, "worker finished");
        let _ = finished_tx.send(reason);
    });
    let finished: FinishedSignal = async move {
        finished_rx
            .await
            // The monitor task cannot be cancelled while the runtime lives;
            // a dropped sender means the runtime is tearing down.
            .unwrap_or(ExitReason::Killed(0))
    }
    .boxed()
    .shared();

    Ok(WorkerProcess {
        id,
        pid,
        endpoint,
        finished,
    })
}

fn exit_reason(status: ExitStatus) -> ExitReason {
    match status.code() {
        Some(0) => ExitReason::CleanExit,
        Some(code) => ExitReason::NonzeroExit(code),
        None => killed_by(status),
    }
}

#[cfg(unix)]
fn killed_by(status: ExitStatus) -> ExitReason {
    use std::os::unix::process::ExitStatusExt;
    ExitReason::Killed(status.signal().unwrap_or_default())
}

#[cfg(not(unix))]
fn killed_by(_status: ExitStatus) -> ExitReason {
    ExitReason::Killed(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unresolved_class_fails_before_spawn() {
        let config = PoolConfig::new("no-such-class");
        match spawn_worker(&config, WorkerId(0)) {
            Err(PoolError::UnresolvedChild(name)) => assert_eq!(name, "no-such-class"),
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn bootstrap_payload_roundtrips() {
        let bootstrap = WorkerBootstrap {
            handler: "pid".into(),
            args: vec!["a".into(), "b".into()],
        };
        let json = serde_json::to_string(&bootstrap).unwrap();
        assert_eq!(serde_json::from_str::<WorkerBootstrap>(&json).unwrap(), bootstrap);
    }
}
