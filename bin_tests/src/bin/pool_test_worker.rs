// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Worker image for the pool integration tests.

use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    // stdout carries frames; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match procpool::worker::maybe_run(&bin_tests::test_registry()) {
        Some(result) => result,
        None => anyhow::bail!("this binary only runs as a pool worker"),
    }
}
