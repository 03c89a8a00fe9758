// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A pool of long-lived child worker processes.
//!
//! The parent dispatches typed calls onto children over framed stdio RPC
//! (see `procpool-ipc`), amortizing spawn cost and bounding concurrency:
//! the pool grows on demand up to `max`, shrinks back to `min` when idle,
//! recycles children after a configurable number of calls, and replaces
//! children that die.
//!
//! ```no_run
//! use procpool::{PoolConfig, ProcessPool};
//! use procpool::proto::{Echo, EchoRequest};
//!
//! # async fn example() -> Result<(), procpool::PoolError> {
//! let pool = ProcessPool::new(PoolConfig::default().limits(1, 4))?;
//! pool.start().await?;
//! let response = pool
//!     .do_work::<Echo>(&EchoRequest { data: b"ping".to_vec() })
//!     .await?;
//! assert_eq!(response.response, b"ping");
//! pool.stop().await?;
//! # Ok(())
//! # }
//! ```
//!
//! The worker image is any binary that calls [`worker::maybe_run`] before
//! doing anything else; by default the pool re-executes the current binary.

pub mod config;
pub mod default_pool;
pub mod error;
pub mod pool;
pub mod proto;
pub mod registry;
pub mod supervisor;
pub mod worker;

pub use config::{ParentRouterFactory, PoolConfig};
pub use default_pool::{default_pool, dispatch, stop_default_pool};
pub use error::PoolError;
pub use pool::{PoolStats, ProcessPool};
pub use registry::{RouterFactory, WorkerRegistry, DEFAULT_HANDLER};
pub use supervisor::{spawn_worker, ExitReason, FinishedSignal, WorkerId, WorkerProcess};

pub use procpool_ipc::{
    Command, CommandRouter, Endpoint, IpcError, MutexExt, RemoteError, UNHANDLED_COMMAND,
};
