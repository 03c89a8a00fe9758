// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Typed commands and the handler table an endpoint serves them from.

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// A remote operation: a wire name plus request and response schemas.
///
/// Implementors are unit structs; the payload types carry the data.
pub trait Command {
    const NAME: &'static str;
    type Request: Serialize + DeserializeOwned + Send + 'static;
    type Response: Serialize + DeserializeOwned + Send + 'static;
}

/// Error kind reported when a request names a command the peer has no
/// handler for.
pub const UNHANDLED_COMMAND: &str = "unhandled_command";

/// An application-level failure carried inside an error frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    pub kind: String,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        RemoteError {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

pub(crate) type RawHandler =
    Arc<dyn Fn(Bytes) -> BoxFuture<'static, Result<Bytes, RemoteError>> + Send + Sync>;

/// Maps incoming command names to handlers.
///
/// Routers are built up-front and handed to [`crate::Endpoint::start`];
/// binding the same name twice is a programmer error and panics.
#[derive(Default)]
pub struct CommandRouter {
    handlers: HashMap<String, RawHandler>,
}

impl CommandRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `C::NAME` to `handler`, wrapping payload decode/encode around it.
    ///
    /// A request that does not decode as `C::Request` is answered with a
    /// `decode_error` error frame rather than tearing the connection down.
    pub fn register<C, F, Fut>(&mut self, handler: F)
    where
        C: Command,
        F: Fn(C::Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<C::Response, RemoteError>> + Send + 'static,
    {
        let raw: RawHandler = Arc::new(move |payload: Bytes| {
            match bincode::deserialize::<C::Request>(&payload) {
                Ok(request) => {
                    let fut = handler(request);
                    async move {
                        let response = fut.await?;
                        bincode::serialize(&response)
                            .map(Bytes::from)
                            .map_err(|e| RemoteError::new("encode_error", e.to_string()))
                    }
                    .boxed()
                }
                Err(e) => {
                    let err = RemoteError::new("decode_error", e.to_string());
                    async move { Err(err) }.boxed()
                }
            }
        });
        self.insert(C::NAME, raw);
    }

    fn insert(&mut self, name: &str, handler: RawHandler) {
        if self.handlers.insert(name.to_owned(), handler).is_some() {
            panic!("handler already registered for command {name:?}");
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub(crate) fn get(&self, name: &str) -> Option<RawHandler> {
        self.handlers.get(name).cloned()
    }
}

impl fmt::Debug for CommandRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRouter")
            .field("commands", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
