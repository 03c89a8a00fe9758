// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The child side of the pool.
//!
//! A worker image is any binary that routes its argv through [`maybe_run`]
//! early in `main`. When the pool spawned the process, the bootstrap marker
//! is present and the call takes over: it binds an endpoint to
//! stdin/stdout, instantiates the named worker class, serves until told to
//! shut down (or until the parent goes away) and never returns to the
//! caller's `main` logic.
//!
//! Worker logs must go to stderr; stdout is the wire.

use crate::proto::{Echo, EchoResponse, Shutdown};
use crate::registry::{RouterFactory, WorkerRegistry};
use crate::supervisor::{WorkerBootstrap, WORKER_ARG};
use anyhow::Context;
use procpool_ipc::{CommandRouter, Endpoint};
use tokio::sync::mpsc;
use tracing::debug;

/// Runs the worker loop if this process was spawned by a pool.
///
/// Returns `None` when the bootstrap marker is absent (the binary was
/// started normally); the caller proceeds with its own `main`. Returns
/// `Some(result)` after the worker loop has finished; the caller should
/// exit with it.
pub fn maybe_run(registry: &WorkerRegistry) -> Option<anyhow::Result<()>> {
    let mut args = std::env::args();
    let _argv0 = args.next();
    match (args.next(), args.next()) {
        (Some(marker), Some(bootstrap)) if marker == WORKER_ARG => {
            Some(run(registry, &bootstrap))
        }
        _ => None,
    }
}

/// Runs the worker loop for an explicit bootstrap payload.
pub fn run(registry: &WorkerRegistry, bootstrap: &str) -> anyhow::Result<()> {
    let bootstrap: WorkerBootstrap =
        serde_json::from_str(bootstrap).context("invalid worker bootstrap payload")?;
    let factory = registry.resolve(&bootstrap.handler).with_context(|| {
        format!(
            "worker class {:?} is not registered in this image",
            bootstrap.handler
        )
    })?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build worker runtime")?;
    runtime.block_on(serve(factory, bootstrap));
    Ok(())
}

async fn serve(factory: RouterFactory, bootstrap: WorkerBootstrap) {
    // Depth 1 is enough: shutdown only needs to fire once, repeats are
    // dropped by try_send.
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
    let endpoint = Endpoint::start_with(tokio::io::stdin(), tokio::io::stdout(), |ep| {
        let mut router = factory(ep, &bootstrap.args);
        install_control_commands(&mut router, shutdown_tx);
        router
    });
    debug!(pid = std::process::id(), handler = %bootstrap.handler, "worker serving");

    tokio::select! {
        _ = shutdown_rx.recv() => {
            // The shutdown response must reach the parent before we go.
            endpoint.graceful_shutdown().await;
            debug!(pid = std::process::id(), "worker shut down");
        }
        _ = endpoint.until_closed() => {
            debug!(pid = std::process::id(), "parent went away");
        }
    }
}

/// The commands every child answers, on top of whatever its class serves.
/// The names `echo` and `shutdown` are reserved; a class registering them
/// panics at bootstrap.
fn install_control_commands(router: &mut CommandRouter, shutdown: mpsc::Sender<()>) {
    router.register::<Echo, _, _>(|req| async move {
        Ok(EchoResponse { response: req.data })
    });
    router.register::<Shutdown, _, _>(move |()| {
        let shutdown = shutdown.clone();
        async move {
            let _ = shutdown.try_send(());
            Ok(())
        }
    });
}
