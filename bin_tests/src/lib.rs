// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Worker classes and commands used by the spawn-based pool tests.
//!
//! The `pool_test_worker` binary links [`test_registry`], and the
//! integration tests point pools at that binary via
//! `env!("CARGO_BIN_EXE_pool_test_worker")`. Both sides therefore resolve
//! the same class names, which is exactly the contract the supervisor's
//! pre-flight check relies on.

use procpool::{Command, CommandRouter, Endpoint, MutexExt, RemoteError, WorkerRegistry};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

/// Class whose `Ping` handler calls the parent's `Pong` back.
pub const RELAY_CLASS: &str = "relay";
/// Class answering `Pid` with the worker's OS pid.
pub const PID_CLASS: &str = "pid";
/// Class that parks every `First` until a `Second` releases it.
pub const WAITING_CLASS: &str = "waiting";
/// Class whose `Die` kills the process without responding.
pub const CRASHING_CLASS: &str = "crashing";

pub struct Ping;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingRequest {
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingResponse {
    pub response: Vec<u8>,
}

impl Command for Ping {
    const NAME: &'static str = "ping";
    type Request = PingRequest;
    type Response = PingResponse;
}

/// What a relay child calls on its parent while servicing `Ping`.
pub struct Pong;

impl Command for Pong {
    const NAME: &'static str = "pong";
    type Request = PingRequest;
    type Response = PingResponse;
}

pub struct Pid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PidResponse {
    pub pid: u32,
}

impl Command for Pid {
    const NAME: &'static str = "pid";
    type Request = ();
    type Response = PidResponse;
}

pub struct First;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirstRequest {
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirstResponse {
    pub response: Vec<u8>,
}

impl Command for First {
    const NAME: &'static str = "first";
    type Request = FirstRequest;
    type Response = FirstResponse;
}

pub struct Second;

impl Command for Second {
    const NAME: &'static str = "second";
    type Request = ();
    type Response = ();
}

pub struct Die;

impl Command for Die {
    const NAME: &'static str = "die";
    type Request = ();
    type Response = ();
}

/// Takes stdout down with the whole process, mid-call: the parent never
/// gets a response, only an exit.
async fn die(_: ()) -> Result<(), RemoteError> {
    std::process::exit(1)
}

/// Every worker class the test image can become.
pub fn test_registry() -> WorkerRegistry {
    let mut registry = WorkerRegistry::default();

    registry.register(PID_CLASS, |_: &Endpoint, _: &[String]| {
        let mut router = CommandRouter::new();
        router.register::<Pid, _, _>(|()| async move {
            Ok(PidResponse {
                pid: std::process::id(),
            })
        });
        router
    });

    registry.register(CRASHING_CLASS, |_: &Endpoint, _: &[String]| {
        let mut router = CommandRouter::new();
        router.register::<Die, _, _>(die);
        router
    });

    registry.register(WAITING_CLASS, |_: &Endpoint, _: &[String]| {
        let parked: Arc<Mutex<Option<oneshot::Sender<()>>>> = Arc::new(Mutex::new(None));
        let mut router = CommandRouter::new();
        {
            let parked = parked.clone();
            router.register::<First, _, _>(move |req| {
                let parked = parked.clone();
                async move {
                    let (tx, rx) = oneshot::channel();
                    parked.lock_or_panic().replace(tx);
                    let _ = rx.await;
                    Ok(FirstResponse { response: req.data })
                }
            });
        }
        {
            let parked = parked.clone();
            router.register::<Second, _, _>(move |()| {
                let parked = parked.clone();
                async move {
                    // The parked First is dispatched concurrently and may
                    // not have registered yet; give it a moment.
                    for _ in 0..200 {
                        if let Some(tx) = parked.lock_or_panic().take() {
                            let _ = tx.send(());
                            return Ok(());
                        }
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                    Err(RemoteError::new("no_parked_call", "no first call waiting"))
                }
            });
        }
        router
    });

    registry.register(RELAY_CLASS, |endpoint: &Endpoint, _: &[String]| {
        let endpoint = endpoint.clone();
        let mut router = CommandRouter::new();
        router.register::<Ping, _, _>(move |req| {
            let endpoint = endpoint.clone();
            async move {
                let pong = endpoint
                    .call::<Pong>(&req)
                    .await
                    .map_err(|e| RemoteError::new("relay_failed", e.to_string()))?;
                Ok(PingResponse {
                    response: pong.response,
                })
            }
        });
        router
    });

    registry
}
