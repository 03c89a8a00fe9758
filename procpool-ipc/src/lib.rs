// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Correlator-tagged request/response RPC over a single duplex byte stream.
//!
//! The crate is split in three layers: [`frame`] turns a byte stream into
//! self-delimited command frames, [`command`] gives frames a typed surface
//! (command names plus serde payloads), and [`endpoint`] pairs outgoing
//! requests with incoming responses and dispatches incoming requests to
//! registered handlers. Nothing here knows about processes; any
//! `AsyncRead`/`AsyncWrite` pair will do.

pub mod command;
pub mod endpoint;
pub mod frame;

pub use command::{Command, CommandRouter, RemoteError, UNHANDLED_COMMAND};
pub use endpoint::{Endpoint, IpcError};
pub use frame::{Frame, FrameCodec, FrameError, FrameKind};

use std::sync::{Mutex, MutexGuard};

/// Acquires the mutex, panicking on a poisoned lock.
///
/// A poisoned pool or endpoint lock means a panic mid-bookkeeping; the state
/// is unrecoverable and propagating the panic is the only sane option.
pub trait MutexExt<T> {
    fn lock_or_panic(&self) -> MutexGuard<'_, T>;
}

impl<T> MutexExt<T> for Mutex<T> {
    #[inline(always)]
    #[track_caller]
    fn lock_or_panic(&self) -> MutexGuard<'_, T> {
        #[allow(clippy::unwrap_used)]
        self.lock().unwrap()
    }
}
