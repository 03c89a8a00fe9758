// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! End-to-end pool behavior against real worker processes.

#![cfg(unix)]

use bin_tests::{
    Die, First, FirstRequest, Pid, Ping, PingRequest, PingResponse, Pong, Second,
    CRASHING_CLASS, PID_CLASS, RELAY_CLASS, WAITING_CLASS,
};
use procpool::proto::{Echo, EchoRequest, Shutdown};
use procpool::{
    spawn_worker, CommandRouter, ExitReason, PoolConfig, PoolError, ProcessPool, WorkerId,
    WorkerRegistry,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

fn worker_image() -> &'static str {
    env!("CARGO_BIN_EXE_pool_test_worker")
}

fn test_config(class: &str) -> PoolConfig {
    PoolConfig::new(class)
        .program(worker_image())
        .registry(Arc::new(bin_tests::test_registry()))
}

#[tokio::test(flavor = "multi_thread")]
async fn start_and_stop_a_single_worker() {
    let pool = ProcessPool::new(test_config(PID_CLASS).limits(1, 4)).unwrap();
    let stats = pool.stats();
    assert!(!stats.started && !stats.finished);
    assert_eq!((stats.processes, stats.finish_watchers), (0, 0));

    pool.start_a_worker().await.unwrap();
    let stats = pool.stats();
    assert!(!stats.started && !stats.finished);
    assert_eq!((stats.processes, stats.finish_watchers), (1, 1));

    pool.stop_a_worker().await.unwrap();
    let stats = pool.stats();
    assert_eq!((stats.processes, stats.finish_watchers), (0, 0));

    pool.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn start_spawns_min_and_stop_empties() {
    let pool = ProcessPool::new(test_config(PID_CLASS).limits(3, 6)).unwrap();
    pool.start().await.unwrap();

    let stats = pool.stats();
    assert!(stats.started && !stats.finished);
    assert_eq!(stats.processes, 3);
    assert_eq!(stats.finish_watchers, 3);
    assert!(matches!(
        pool.start().await,
        Err(PoolError::AlreadyStarted)
    ));

    pool.stop().await.unwrap();
    let stats = pool.stats();
    assert!(stats.finished);
    assert_eq!((stats.processes, stats.finish_watchers, stats.queued), (0, 0, 0));

    // Terminal for admission, idempotent for stop.
    pool.stop().await.unwrap();
    assert!(matches!(
        pool.do_work::<Pid>(&()).await,
        Err(PoolError::PoolStopped)
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn echo_round_trips_through_a_worker() {
    let pool = ProcessPool::new(test_config("default").limits(1, 2)).unwrap();
    pool.start().await.unwrap();

    let response = pool
        .do_work::<Echo>(&EchoRequest {
            data: b"CIAOOOO".to_vec(),
        })
        .await
        .unwrap();
    assert_eq!(response.response, b"CIAOOOO");

    pool.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
#[serial_test::serial]
async fn echo_through_the_default_pool() {
    std::env::set_var("PROCPOOL_DEFAULT_WORKER_IMAGE", worker_image());
    std::env::set_var("PROCPOOL_DEFAULT_MIN", "1");
    std::env::set_var("PROCPOOL_DEFAULT_MAX", "2");

    let response = procpool::dispatch::<Echo>(&EchoRequest {
        data: b"CIAOOOO".to_vec(),
    })
    .await
    .unwrap();
    assert_eq!(response.response, b"CIAOOOO");

    procpool::stop_default_pool().await.unwrap();
    std::env::remove_var("PROCPOOL_DEFAULT_WORKER_IMAGE");
    std::env::remove_var("PROCPOOL_DEFAULT_MIN");
    std::env::remove_var("PROCPOOL_DEFAULT_MAX");
}

#[tokio::test(flavor = "multi_thread")]
async fn children_can_call_registered_parent_handlers() {
    const DATA: &[u8] = b"CIAO";
    const APPEND: &[u8] = b"123";

    let config = test_config(RELAY_CLASS)
        .limits(1, 2)
        .parent_router(|_endpoint| {
            let mut router = CommandRouter::new();
            router.register::<Pong, _, _>(|req: PingRequest| async move {
                let mut response = req.data;
                response.extend_from_slice(APPEND);
                Ok(PingResponse { response })
            });
            router
        });
    let pool = ProcessPool::new(config).unwrap();
    pool.start().await.unwrap();

    let response = pool
        .do_work::<Ping>(&PingRequest {
            data: DATA.to_vec(),
        })
        .await
        .unwrap();
    assert_eq!(response.response, b"CIAO123");

    pool.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn resize_grows_shrinks_and_rejects_invalid() {
    let pool = ProcessPool::new(test_config(PID_CLASS).limits(6, 8)).unwrap();
    pool.start().await.unwrap();
    assert_eq!(pool.stats().processes, 6);

    pool.adjust_pool_size(2, 3).await.unwrap();
    let stats = pool.stats();
    assert_eq!((stats.min, stats.max), (2, 3));
    assert_eq!(stats.processes, 3);
    assert_eq!(stats.finish_watchers, 3);

    let err = pool.adjust_pool_size(5, 1).await.unwrap_err();
    assert!(matches!(err, PoolError::InvalidConfig(_)));
    let stats = pool.stats();
    assert_eq!((stats.min, stats.max), (2, 3));
    assert_eq!(stats.processes, 3);

    pool.adjust_pool_size(4, 5).await.unwrap();
    assert_eq!(pool.stats().processes, 4);

    pool.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn crashed_worker_fails_the_call_and_is_replaced() {
    let pool = ProcessPool::new(test_config(CRASHING_CLASS).limits(1, 2)).unwrap();
    pool.start().await.unwrap();

    let err = pool.do_work::<Die>(&()).await.unwrap_err();
    assert!(matches!(err, PoolError::WorkerCrashed(_)), "{err:?}");

    // The pool healed itself; ordinary work flows again.
    let response = pool
        .do_work::<Echo>(&EchoRequest {
            data: b"DATA".to_vec(),
        })
        .await
        .unwrap();
    assert_eq!(response.response, b"DATA");

    pool.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn pool_grows_to_max_under_parked_calls() {
    const MAX: usize = 5;
    let pool = ProcessPool::new(test_config(WAITING_CLASS).limits(1, MAX)).unwrap();
    pool.start().await.unwrap();
    assert_eq!(pool.stats().processes, 1);

    let parked: Vec<_> = (0..MAX)
        .map(|_| {
            pool.do_work::<First>(&FirstRequest {
                data: b"DATA".to_vec(),
            })
        })
        .collect();

    // Admission is synchronous: five submissions grew the pool to max and
    // every worker is busy before any future is awaited.
    let stats = pool.stats();
    assert_eq!(stats.processes, MAX);
    assert_eq!(stats.busy, MAX);
    assert_eq!(stats.ready, 0);
    assert_eq!(stats.finish_watchers, MAX);

    for endpoint in pool.worker_endpoints() {
        endpoint.call::<Second>(&()).await.unwrap();
    }
    for result in futures::future::join_all(parked).await {
        assert_eq!(result.unwrap().response, b"DATA");
    }
    let stats = pool.stats();
    assert_eq!((stats.busy, stats.ready), (0, MAX));

    pool.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn idle_workers_are_pruned_back_to_min() {
    const MAX: usize = 4;
    let pool = ProcessPool::new(
        test_config(WAITING_CLASS)
            .limits(1, MAX)
            .max_idle(Duration::from_secs(1)),
    )
    .unwrap();
    pool.start().await.unwrap();

    let parked: Vec<_> = (0..MAX)
        .map(|_| {
            pool.do_work::<First>(&FirstRequest {
                data: b"DATA".to_vec(),
            })
        })
        .collect();
    assert_eq!(pool.stats().processes, MAX);

    for endpoint in pool.worker_endpoints() {
        endpoint.call::<Second>(&()).await.unwrap();
    }
    futures::future::join_all(parked).await;

    // Two pruner periods with margin: everything above min is idle.
    tokio::time::sleep(Duration::from_millis(3500)).await;
    let stats = pool.stats();
    assert_eq!(stats.processes, 1);
    assert_eq!(stats.finish_watchers, 1);

    pool.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn workers_are_recycled_after_the_configured_calls() {
    let pool = ProcessPool::new(test_config(PID_CLASS).limits(1, 1).recycle_after(1)).unwrap();
    pool.start().await.unwrap();

    let first = pool.do_work::<Pid>(&()).await.unwrap().pid;
    let second = pool.do_work::<Pid>(&()).await.unwrap().pid;
    assert_ne!(first, second);

    pool.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn recycling_under_overload_yields_exactly_two_generations() {
    const MAX: usize = 5;
    const RECYCLE_AFTER: u32 = 10;
    const CALLS: usize = 60;

    let pool = ProcessPool::new(
        test_config(PID_CLASS)
            .limits(1, MAX)
            .recycle_after(RECYCLE_AFTER),
    )
    .unwrap();
    pool.start().await.unwrap();

    let calls: Vec<_> = (0..CALLS).map(|_| pool.do_work::<Pid>(&())).collect();
    let mut pids = HashSet::new();
    for result in futures::future::join_all(calls).await {
        pids.insert(result.unwrap().pid);
    }
    // max * ceil(calls / (max * recycle_after)) = 5 * ceil(60/50)
    assert_eq!(pids.len(), 10);

    pool.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn recycling_disabled_keeps_the_same_worker() {
    let pool = ProcessPool::new(test_config(PID_CLASS).limits(1, 1).recycle_after(0)).unwrap();
    pool.start().await.unwrap();

    let first = pool.do_work::<Pid>(&()).await.unwrap().pid;
    for _ in 0..2 {
        assert_eq!(pool.do_work::<Pid>(&()).await.unwrap().pid, first);
    }

    pool.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn supervisor_spawns_echoes_and_shuts_down_cleanly() {
    let config = test_config("default");
    let worker = spawn_worker(&config, WorkerId(0)).unwrap();

    let response = worker
        .endpoint
        .call::<Echo>(&EchoRequest {
            data: b"ciao".to_vec(),
        })
        .await
        .unwrap();
    assert_eq!(response.response, b"ciao");

    worker.endpoint.call::<Shutdown>(&()).await.unwrap();
    assert_eq!(worker.finished.clone().await, ExitReason::CleanExit);
}

#[tokio::test(flavor = "multi_thread")]
async fn supervisor_reports_nonzero_exits() {
    let config = test_config(CRASHING_CLASS);
    let worker = spawn_worker(&config, WorkerId(0)).unwrap();

    let err = worker.endpoint.call::<Die>(&()).await.unwrap_err();
    assert!(matches!(err, procpool::IpcError::ConnectionLost(_)), "{err:?}");
    assert_eq!(worker.finished.clone().await, ExitReason::NonzeroExit(1));
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_worker_class_is_rejected_before_spawning() {
    let config = PoolConfig::new("no-such-class")
        .program(worker_image())
        .registry(Arc::new(WorkerRegistry::default()));
    match spawn_worker(&config, WorkerId(0)) {
        Err(PoolError::UnresolvedChild(name)) => assert_eq!(name, "no-such-class"),
        other => panic!("unexpected: {:?}", other.err()),
    }

    let pool = ProcessPool::new(config.limits(1, 2)).unwrap();
    assert!(matches!(
        pool.start().await,
        Err(PoolError::UnresolvedChild(_))
    ));
}
