// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use procpool_ipc::{IpcError, RemoteError};

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Work was submitted before `start` or after `stop`; terminal.
    #[error("pool is not accepting work")]
    PoolStopped,
    /// `start` was called on an already started pool.
    #[error("pool already started")]
    AlreadyStarted,
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),
    /// `stop_a_worker` found nothing idle to stop.
    #[error("no idle worker available")]
    NoIdleWorker,
    /// The configured worker class is not registered in this image, so the
    /// child could never construct it either. Raised before spawning.
    #[error("worker class {0:?} is not registered in this image")]
    UnresolvedChild(String),
    /// The child exited while servicing the call. The call is not retried:
    /// it may have been partially executed.
    #[error("worker exited during the call: {0}")]
    WorkerCrashed(String),
    /// Queued work was abandoned before it was admitted onto a worker.
    #[error("queued work was cancelled before admission")]
    Cancelled,
    #[error("failed to spawn worker: {0}")]
    Spawn(#[source] std::io::Error),
    /// An application-level error frame from the worker, passed through.
    #[error(transparent)]
    Remote(RemoteError),
    #[error(transparent)]
    Ipc(IpcError),
}

impl From<IpcError> for PoolError {
    fn from(e: IpcError) -> Self {
        match e {
            IpcError::Remote(remote) => PoolError::Remote(remote),
            IpcError::ConnectionLost(reason) => PoolError::WorkerCrashed(reason),
            // A locally-closed endpoint is not a crash: the child may be
            // alive. Passed through so callers keep the distinction.
            IpcError::Closed => PoolError::Ipc(IpcError::Closed),
            other => PoolError::Ipc(other),
        }
    }
}
