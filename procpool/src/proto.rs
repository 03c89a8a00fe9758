// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Control commands every child understands.

use procpool_ipc::Command;
use serde::{Deserialize, Serialize};

/// Identity call, used for liveness checks.
pub struct Echo;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoRequest {
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoResponse {
    pub response: Vec<u8>,
}

impl Command for Echo {
    const NAME: &'static str = "echo";
    type Request = EchoRequest;
    type Response = EchoResponse;
}

/// Instructs the child to flush the response and exit cleanly.
pub struct Shutdown;

impl Command for Shutdown {
    const NAME: &'static str = "shutdown";
    type Request = ();
    type Response = ();
}
