// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Request/response correlation over one duplex stream.
//!
//! An [`Endpoint`] is a cheap clonable handle. Construction spawns two
//! tasks: a reader that decodes frames and either completes parked calls or
//! dispatches requests to the router, and a writer that owns the encoder so
//! every frame hits the stream as one atomic write.

use crate::command::{CommandRouter, RawHandler, RemoteError, UNHANDLED_COMMAND};
use crate::frame::{Correlator, Frame, FrameCodec, FrameError, FrameKind};
use crate::MutexExt;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, warn};

#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    /// The peer went away (stream EOF or I/O failure) with the call
    /// outstanding. The request may or may not have been executed.
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    /// The peer violated the framing protocol; the endpoint is closed.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The peer answered with an application-level error frame.
    #[error(transparent)]
    Remote(RemoteError),
    #[error("failed to encode request payload: {0}")]
    Encode(#[source] bincode::Error),
    #[error("failed to decode response payload: {0}")]
    Decode(#[source] bincode::Error),
    /// This side closed the endpoint ([`Endpoint::close`] or
    /// [`Endpoint::graceful_shutdown`]); the peer may still be alive.
    #[error("endpoint closed")]
    Closed,
}

#[derive(Debug, Clone)]
enum ClosedReason {
    Lost(String),
    Protocol(String),
    /// Closure this side asked for, as opposed to one the stream forced.
    Closed,
}

impl ClosedReason {
    fn to_error(&self) -> IpcError {
        match self {
            ClosedReason::Lost(reason) => IpcError::ConnectionLost(reason.clone()),
            ClosedReason::Protocol(reason) => IpcError::Protocol(reason.clone()),
            ClosedReason::Closed => IpcError::Closed,
        }
    }
}

struct Pending {
    calls: HashMap<Correlator, oneshot::Sender<Result<Bytes, IpcError>>>,
    closed: Option<ClosedReason>,
}

struct Inner {
    next_correlator: AtomicU64,
    pending: Mutex<Pending>,
    /// Intake of the writer task; `None` once the endpoint is closing.
    writer: Mutex<Option<mpsc::Sender<Frame>>>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
    /// Requests whose handler is running but whose reply is not yet queued.
    in_flight: AtomicUsize,
    /// Bumped every time a reply has been handed to the writer.
    replies: watch::Sender<()>,
    /// Tells the reader task to stop consuming frames.
    closing: watch::Sender<bool>,
    /// Flipped once the reader has drained the stream.
    read_done: watch::Sender<bool>,
}

/// One side of a framed RPC connection.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<Inner>,
}

impl Endpoint {
    /// Binds an endpoint to a stream pair and serves `router` on it.
    pub fn start<R, W>(read: R, write: W, router: CommandRouter) -> Endpoint
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::start_with(read, write, |_| router)
    }

    /// Like [`Endpoint::start`], but the router is built with access to the
    /// endpoint handle, so handlers can issue calls back to the peer.
    pub fn start_with<R, W, F>(read: R, write: W, make_router: F) -> Endpoint
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
        F: FnOnce(&Endpoint) -> CommandRouter,
    {
        let (writer_tx, writer_rx) = mpsc::channel(128);
        let (closing_tx, closing_rx) = watch::channel(false);
        let (read_done_tx, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            next_correlator: AtomicU64::new(0),
            pending: Mutex::new(Pending {
                calls: HashMap::new(),
                closed: None,
            }),
            writer: Mutex::new(Some(writer_tx)),
            writer_task: Mutex::new(None),
            in_flight: AtomicUsize::new(0),
            replies: watch::channel(()).0,
            closing: closing_tx,
            read_done: read_done_tx,
        });
        let endpoint = Endpoint { inner };

        let router = Arc::new(make_router(&endpoint));
        let writer_task = tokio::spawn(write_loop(
            write,
            writer_rx,
            Arc::downgrade(&endpoint.inner),
        ));
        endpoint
            .inner
            .writer_task
            .lock_or_panic()
            .replace(writer_task);
        tokio::spawn(read_loop(endpoint.clone(), read, closing_rx, router));
        endpoint
    }

    /// Issues a typed call and waits for the correlated response.
    pub async fn call<C: crate::Command>(
        &self,
        request: &C::Request,
    ) -> Result<C::Response, IpcError> {
        let payload = bincode::serialize(request).map_err(IpcError::Encode)?;
        let bytes = self.call_raw(C::NAME, payload.into()).await?;
        bincode::deserialize(&bytes).map_err(IpcError::Decode)
    }

    /// Type-erased call: raw payload in, raw payload out.
    pub async fn call_raw(&self, command: &str, payload: Bytes) -> Result<Bytes, IpcError> {
        let (tx, rx) = oneshot::channel();
        let correlator = {
            let mut pending = self.inner.pending.lock_or_panic();
            if let Some(reason) = &pending.closed {
                return Err(reason.to_error());
            }
            let correlator = self.inner.next_correlator.fetch_add(1, Ordering::Relaxed);
            pending.calls.insert(correlator, tx);
            correlator
        };

        let sender = self.inner.writer.lock_or_panic().clone();
        let sent = match sender {
            Some(sender) => sender
                .send(Frame::request(correlator, command, payload))
                .await
                .is_ok(),
            None => false,
        };
        if !sent {
            // The writer is only ever taken by a local close; a failed send
            // means the writer task died and recorded why.
            let mut pending = self.inner.pending.lock_or_panic();
            pending.calls.remove(&correlator);
            return Err(pending
                .closed
                .as_ref()
                .map(ClosedReason::to_error)
                .unwrap_or(IpcError::Closed));
        }

        match rx.await {
            Ok(outcome) => outcome,
            // The record was dropped without an outcome; report whatever
            // close reason got there first.
            Err(_) => {
                let closed = self.inner.pending.lock_or_panic().closed.clone();
                Err(closed
                    .map(|reason| reason.to_error())
                    .unwrap_or_else(|| IpcError::ConnectionLost("call abandoned".into())))
            }
        }
    }

    /// Resolves once the reader has consumed the stream to its end.
    ///
    /// The child supervisor uses this to guarantee that every frame a child
    /// wrote before exiting has been delivered before its finished-signal
    /// fires.
    pub async fn until_closed(&self) {
        let mut rx = self.inner.read_done.subscribe();
        // wait_for inspects the current value first, so a completed reader
        // is observed even if it finished long ago.
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Stops reading, waits until every in-flight request has its reply
    /// queued, then flushes and closes the write side.
    ///
    /// This is the child-side exit path: the response to `shutdown` must be
    /// on the wire before the process goes away.
    pub async fn graceful_shutdown(&self) {
        let _ = self.inner.closing.send(true);
        let mut replies = self.inner.replies.subscribe();
        while self.inner.in_flight.load(Ordering::SeqCst) > 0 {
            if replies.changed().await.is_err() {
                break;
            }
        }
        let sender = self.inner.writer.lock_or_panic().take();
        drop(sender);
        let task = self.inner.writer_task.lock_or_panic().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.fail_all(ClosedReason::Closed);
    }

    /// Abortive close: outstanding and future calls fail immediately with
    /// [`IpcError::Closed`].
    pub fn close(&self) {
        self.close_with(ClosedReason::Closed);
    }

    fn close_with(&self, reason: ClosedReason) {
        self.fail_all(reason);
        let _ = self.inner.closing.send(true);
        let sender = self.inner.writer.lock_or_panic().take();
        drop(sender);
    }

    /// Completes every outstanding call with `reason`. First close reason
    /// wins; later ones are ignored.
    fn fail_all(&self, reason: ClosedReason) {
        let mut pending = self.inner.pending.lock_or_panic();
        if pending.closed.is_some() {
            return;
        }
        for (_, tx) in pending.calls.drain() {
            let _ = tx.send(Err(reason.to_error()));
        }
        pending.closed = Some(reason);
    }

    fn on_frame(&self, frame: Frame, router: &Arc<CommandRouter>) {
        match frame.kind {
            FrameKind::Request => {
                let handler = router.get(&frame.command);
                self.on_request(frame, handler);
            }
            FrameKind::Response => self.complete(frame.correlator, Ok(frame.payload)),
            FrameKind::Error => {
                let outcome = match bincode::deserialize::<RemoteError>(&frame.payload) {
                    Ok(remote) => Err(IpcError::Remote(remote)),
                    Err(e) => {
                        let reason = format!("undecodable error frame: {e}");
                        self.close_with(ClosedReason::Protocol(reason.clone()));
                        Err(IpcError::Protocol(reason))
                    }
                };
                self.complete(frame.correlator, outcome);
            }
        }
    }

    fn on_request(&self, frame: Frame, handler: Option<RawHandler>) {
        let responder = self.clone();
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            let result = match handler {
                Some(handler) => handler(frame.payload).await,
                None => Err(RemoteError::new(
                    UNHANDLED_COMMAND,
                    format!("no handler for command {:?}", frame.command),
                )),
            };
            responder.send_reply(frame.correlator, result).await;
            responder.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
            let _ = responder.inner.replies.send(());
        });
    }

    async fn send_reply(&self, correlator: Correlator, result: Result<Bytes, RemoteError>) {
        let frame = match result {
            Ok(payload) => Frame::response(correlator, payload),
            Err(remote) => match bincode::serialize(&remote) {
                Ok(payload) => Frame::error(correlator, payload.into()),
                Err(e) => {
                    error!(correlator, error = %e, "dropping unencodable error reply");
                    return;
                }
            },
        };
        let sender = self.inner.writer.lock_or_panic().clone();
        if let Some(sender) = sender {
            let _ = sender.send(frame).await;
        }
    }

    fn complete(&self, correlator: Correlator, outcome: Result<Bytes, IpcError>) {
        let record = self.inner.pending.lock_or_panic().calls.remove(&correlator);
        match record {
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => {
                // A response nobody asked for means the two sides disagree
                // about the conversation; nothing sane can follow.
                warn!(correlator, "response with unknown correlator, closing");
                self.close_with(ClosedReason::Protocol(format!(
                    "response with unknown correlator {correlator}"
                )));
            }
        }
    }
}

async fn read_loop<R>(
    endpoint: Endpoint,
    read: R,
    mut closing: watch::Receiver<bool>,
    router: Arc<CommandRouter>,
) where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut framed = FramedRead::new(read, FrameCodec::default());
    loop {
        tokio::select! {
            changed = closing.changed() => {
                if changed.is_err() || *closing.borrow() {
                    // Whoever flipped the flag recorded the real reason
                    // already; this only covers a bare local close.
                    endpoint.fail_all(ClosedReason::Closed);
                    break;
                }
            }
            next = framed.next() => match next {
                Some(Ok(frame)) => endpoint.on_frame(frame, &router),
                Some(Err(FrameError::UnknownField(kind))) => {
                    // Tolerated: a newer peer may emit kinds we do not know.
                    warn!(kind, "skipping frame of unknown kind");
                }
                Some(Err(e)) => {
                    warn!(error = %e, "protocol error on inbound stream");
                    endpoint.close_with(ClosedReason::Protocol(e.to_string()));
                    break;
                }
                None => {
                    debug!("inbound stream reached end");
                    endpoint.fail_all(ClosedReason::Lost("stream closed".into()));
                    break;
                }
            }
        }
    }
    let _ = endpoint.inner.read_done.send(true);
}

async fn write_loop<W>(write: W, mut rx: mpsc::Receiver<Frame>, inner: Weak<Inner>)
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    let mut framed = FramedWrite::new(write, FrameCodec::default());
    while let Some(frame) = rx.recv().await {
        if let Err(e) = framed.send(frame).await {
            warn!(error = %e, "outbound stream failed");
            if let Some(inner) = inner.upgrade() {
                let endpoint = Endpoint { inner };
                endpoint.close_with(ClosedReason::Lost(format!("write failed: {e}")));
            }
            return;
        }
    }
    // Intake closed: flush whatever is buffered and signal EOF to the peer.
    let _ = framed.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;
    use pretty_assertions::assert_eq;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;
    use tokio::io::{duplex, split};

    struct Echo;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct EchoPayload {
        data: Vec<u8>,
    }

    impl Command for Echo {
        const NAME: &'static str = "echo";
        type Request = EchoPayload;
        type Response = EchoPayload;
    }

    struct Fail;

    impl Command for Fail {
        const NAME: &'static str = "fail";
        type Request = ();
        type Response = ();
    }

    struct Sleep;

    impl Command for Sleep {
        const NAME: &'static str = "sleep";
        type Request = u64;
        type Response = u64;
    }

    fn pair(server_router: CommandRouter) -> (Endpoint, Endpoint) {
        let (client_stream, server_stream) = duplex(4096);
        let (cr, cw) = split(client_stream);
        let (sr, sw) = split(server_stream);
        let client = Endpoint::start(cr, cw, CommandRouter::new());
        let server = Endpoint::start(sr, sw, server_router);
        (client, server)
    }

    fn echo_router() -> CommandRouter {
        let mut router = CommandRouter::new();
        router.register::<Echo, _, _>(|req| async move { Ok(req) });
        router.register::<Fail, _, _>(|_| async move {
            Err(RemoteError::new("boom", "requested failure"))
        });
        router.register::<Sleep, _, _>(|millis| async move {
            tokio::time::sleep(Duration::from_millis(millis)).await;
            Ok(millis)
        });
        router
    }

    #[tokio::test]
    async fn echo_roundtrip() {
        let (client, _server) = pair(echo_router());
        let payload = EchoPayload {
            data: b"hello".to_vec(),
        };
        let response = client.call::<Echo>(&payload).await.unwrap();
        assert_eq!(response, payload);
    }

    #[tokio::test]
    async fn remote_errors_propagate() {
        let (client, _server) = pair(echo_router());
        let err = client.call::<Fail>(&()).await.unwrap_err();
        match err {
            IpcError::Remote(remote) => assert_eq!(remote.kind, "boom"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unhandled_command_is_answered_not_fatal() {
        let (client, _server) = pair(CommandRouter::new());
        let err = client
            .call::<Echo>(&EchoPayload { data: vec![] })
            .await
            .unwrap_err();
        match err {
            IpcError::Remote(remote) => assert_eq!(remote.kind, UNHANDLED_COMMAND),
            other => panic!("unexpected error: {other:?}"),
        }
        // The connection survives.
        client
            .call::<Echo>(&EchoPayload { data: vec![] })
            .await
            .unwrap_err();
    }

    #[tokio::test]
    async fn responses_complete_out_of_order() {
        let (client, _server) = pair(echo_router());
        let slow = client.call::<Sleep>(&80);
        let fast = client.call::<Sleep>(&1);
        let (slow, fast) = tokio::join!(slow, fast);
        assert_eq!(slow.unwrap(), 80);
        assert_eq!(fast.unwrap(), 1);
    }

    // A black hole: parks forever so the call stays outstanding.
    async fn park_forever(_: u64) -> Result<u64, RemoteError> {
        futures::future::pending::<()>().await;
        unreachable!()
    }

    #[tokio::test]
    async fn peer_close_fails_outstanding_and_future_calls() {
        let mut router = CommandRouter::new();
        router.register::<Sleep, _, _>(park_forever);
        let (client, server) = pair(router);

        let outstanding = tokio::spawn({
            let client = client.clone();
            async move { client.call::<Sleep>(&1).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        server.close();

        let err = outstanding.await.unwrap().unwrap_err();
        assert!(matches!(err, IpcError::ConnectionLost(_)), "{err:?}");

        let err = client.call::<Sleep>(&1).await.unwrap_err();
        assert!(matches!(err, IpcError::ConnectionLost(_)), "{err:?}");
    }

    #[tokio::test]
    async fn local_close_is_distinguishable_from_connection_loss() {
        let mut router = CommandRouter::new();
        router.register::<Sleep, _, _>(park_forever);
        let (client, _server) = pair(router);

        let outstanding = tokio::spawn({
            let client = client.clone();
            async move { client.call::<Sleep>(&1).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        // This side hangs up; the peer is still alive and well.
        client.close();

        let err = outstanding.await.unwrap().unwrap_err();
        assert!(matches!(err, IpcError::Closed), "{err:?}");

        let err = client.call::<Sleep>(&1).await.unwrap_err();
        assert!(matches!(err, IpcError::Closed), "{err:?}");
    }

    #[tokio::test]
    async fn graceful_shutdown_reports_closed() {
        let (client, _server) = pair(echo_router());
        client.graceful_shutdown().await;
        let err = client
            .call::<Echo>(&EchoPayload { data: vec![] })
            .await
            .unwrap_err();
        assert!(matches!(err, IpcError::Closed), "{err:?}");
    }

    #[tokio::test]
    async fn garbage_on_the_wire_is_a_protocol_error() {
        let (client_stream, server_stream) = duplex(4096);
        let (cr, cw) = split(client_stream);
        let client = Endpoint::start(cr, cw, CommandRouter::new());

        let pending_call = tokio::spawn({
            let client = client.clone();
            async move { client.call::<Sleep>(&1).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (_sr, sw) = split(server_stream);
        let mut raw = FramedWrite::new(sw, tokio_util::codec::LengthDelimitedCodec::new());
        raw.send(Bytes::from(vec![0xeeu8; 32])).await.unwrap();

        let err = pending_call.await.unwrap().unwrap_err();
        assert!(matches!(err, IpcError::Protocol(_)), "{err:?}");
    }

    #[tokio::test]
    async fn server_side_handler_can_call_back() {
        // The "server" registers a handler that calls the client back,
        // exercising bidirectional traffic on one stream pair.
        let (client_stream, server_stream) = duplex(4096);
        let (cr, cw) = split(client_stream);
        let (sr, sw) = split(server_stream);

        let mut client_router = CommandRouter::new();
        client_router.register::<Sleep, _, _>(|n| async move { Ok(n + 1) });
        let client = Endpoint::start(cr, cw, client_router);

        let _server = Endpoint::start_with(sr, sw, |ep| {
            let ep = ep.clone();
            let mut router = CommandRouter::new();
            router.register::<Echo, _, _>(move |req| {
                let ep = ep.clone();
                async move {
                    let n = ep
                        .call::<Sleep>(&7)
                        .await
                        .map_err(|e| RemoteError::new("callback_failed", e.to_string()))?;
                    let mut data = req.data;
                    data.push(n as u8);
                    Ok(EchoPayload { data })
                }
            });
            router
        });

        let response = client
            .call::<Echo>(&EchoPayload { data: vec![1] })
            .await
            .unwrap();
        assert_eq!(response.data, vec![1, 8]);
    }
}
