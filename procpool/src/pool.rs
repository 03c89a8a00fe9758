// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The worker pool scheduler.
//!
//! All bookkeeping lives behind one mutex: admission, growth, queueing and
//! state transitions run to completion without suspension while holding it,
//! which is what makes the ready/busy invariants hold at every quiescent
//! point. Anything that needs to await (the RPC itself, shutdown round
//! trips, process exits) happens in spawned tasks that re-enter the lock
//! when they are done.

use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::proto::Shutdown;
use crate::supervisor::{self, ExitReason, FinishedSignal, WorkerId};
use bytes::Bytes;
use procpool_ipc::{Command, Endpoint, IpcError, MutexExt};
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerState {
    Starting,
    Ready,
    Busy,
    /// No further admission; the worker is on its way out (stop, resize or
    /// recycling).
    Draining,
    Dead,
}

struct Worker {
    pid: u32,
    endpoint: Endpoint,
    finished: FinishedSignal,
    state: WorkerState,
    /// Completed calls (responses and application errors, not crashes).
    call_count: u32,
    idle_since: Instant,
}

struct WorkItem {
    command: String,
    payload: Bytes,
    reply: oneshot::Sender<Result<Bytes, PoolError>>,
}

/// Everything a retiring path needs once the lock is released.
type RetireTicket = (WorkerId, Endpoint, FinishedSignal);

struct PoolState {
    started: bool,
    stopping: bool,
    finished: bool,
    min: usize,
    max: usize,
    next_worker_id: u64,
    workers: HashMap<WorkerId, Worker>,
    /// Idle workers, most recently used last (LIFO keeps caches hot).
    ready: Vec<WorkerId>,
    busy: HashSet<WorkerId>,
    queue: VecDeque<WorkItem>,
    /// One exit-watcher task per live worker.
    finish_watchers: HashMap<WorkerId, JoinHandle<()>>,
}

struct PoolShared {
    config: PoolConfig,
    state: Mutex<PoolState>,
    pruner: Mutex<Option<JoinHandle<()>>>,
    /// Flips to true when `stop` has emptied the pool.
    finished_tx: watch::Sender<bool>,
}

/// Counts exposed for introspection and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub processes: usize,
    pub ready: usize,
    pub busy: usize,
    pub queued: usize,
    pub finish_watchers: usize,
    pub min: usize,
    pub max: usize,
    pub started: bool,
    pub finished: bool,
}

/// A pool of worker processes servicing typed calls.
///
/// Cloning is cheap and clones share the pool.
#[derive(Clone)]
pub struct ProcessPool {
    shared: Arc<PoolShared>,
}

impl ProcessPool {
    pub fn new(config: PoolConfig) -> Result<Self, PoolError> {
        config.validate()?;
        let state = PoolState {
            started: false,
            stopping: false,
            finished: false,
            min: config.min,
            max: config.max,
            next_worker_id: 0,
            workers: HashMap::new(),
            ready: Vec::new(),
            busy: HashSet::new(),
            queue: VecDeque::new(),
            finish_watchers: HashMap::new(),
        };
        Ok(ProcessPool {
            shared: Arc::new(PoolShared {
                config,
                state: Mutex::new(state),
                pruner: Mutex::new(None),
                finished_tx: watch::channel(false).0,
            }),
        })
    }

    /// Spawns `min` workers and installs the idle pruner.
    pub async fn start(&self) -> Result<(), PoolError> {
        {
            let mut st = self.shared.state.lock_or_panic();
            if st.started {
                return Err(PoolError::AlreadyStarted);
            }
            if st.stopping || st.finished {
                return Err(PoolError::PoolStopped);
            }
            while st.workers.len() < st.min {
                self.shared.start_worker_locked(&mut st)?;
            }
            st.started = true;
        }
        self.shared.spawn_pruner();
        Ok(())
    }

    /// Submits one call. Admission (including growth and queueing) happens
    /// before this returns; the returned future resolves with the worker's
    /// response.
    pub fn do_work<C: Command>(
        &self,
        request: &C::Request,
    ) -> impl Future<Output = Result<C::Response, PoolError>> + Send + 'static {
        let (reply, rx) = oneshot::channel();
        match bincode::serialize(request) {
            Ok(payload) => self.shared.submit(WorkItem {
                command: C::NAME.to_owned(),
                payload: payload.into(),
                reply,
            }),
            Err(e) => {
                let _ = reply.send(Err(PoolError::Ipc(IpcError::Encode(e))));
            }
        }
        async move {
            match rx.await {
                Ok(Ok(payload)) => {
                    bincode::deserialize(&payload).map_err(|e| PoolError::Ipc(IpcError::Decode(e)))
                }
                Ok(Err(e)) => Err(e),
                Err(_) => Err(PoolError::Cancelled),
            }
        }
    }

    /// Drains and shuts down every worker, failing queued work with
    /// [`PoolError::PoolStopped`]. In-flight calls are allowed to finish.
    /// Idempotent once the pool has finished.
    pub async fn stop(&self) -> Result<(), PoolError> {
        let mut retiring = Vec::new();
        {
            let mut st = self.shared.state.lock_or_panic();
            if st.finished {
                return Ok(());
            }
            st.stopping = true;
            for item in st.queue.drain(..) {
                let _ = item.reply.send(Err(PoolError::PoolStopped));
            }
            // Retire everything that is not mid-call: the ready set, plus
            // any draining worker whose retire task got cancelled under it
            // (a second shutdown is harmless, removal is idempotent).
            st.ready.clear();
            let idle: Vec<WorkerId> = st
                .workers
                .keys()
                .copied()
                .filter(|id| !st.busy.contains(id))
                .collect();
            for id in idle {
                if let Some(ticket) = mark_draining(&mut st, id) {
                    retiring.push(ticket);
                }
            }
            if st.workers.is_empty() {
                st.finished = true;
                let _ = self.shared.finished_tx.send(true);
            }
        }
        if let Some(pruner) = self.shared.pruner.lock_or_panic().take() {
            pruner.abort();
        }
        futures::future::join_all(
            retiring
                .into_iter()
                .map(|ticket| self.shared.retire_worker(ticket)),
        )
        .await;

        // Busy workers drain through the post-call hook; wait for the last
        // exit watcher to flip the flag.
        let mut finished = self.shared.finished_tx.subscribe();
        let _ = finished.wait_for(|done| *done).await;
        Ok(())
    }

    /// Spawns one extra worker. Usable before `start`.
    pub async fn start_a_worker(&self) -> Result<(), PoolError> {
        let mut st = self.shared.state.lock_or_panic();
        if st.stopping || st.finished {
            return Err(PoolError::PoolStopped);
        }
        if st.workers.len() >= st.max {
            return Err(PoolError::InvalidConfig(format!(
                "pool is already at max capacity ({})",
                st.max
            )));
        }
        self.shared.start_worker_locked(&mut st)?;
        Ok(())
    }

    /// Gracefully stops one idle worker, resolving once it is gone.
    pub async fn stop_a_worker(&self) -> Result<(), PoolError> {
        let ticket = {
            let mut st = self.shared.state.lock_or_panic();
            let Some(id) = st.ready.pop() else {
                return Err(PoolError::NoIdleWorker);
            };
            mark_draining(&mut st, id)
        };
        match ticket {
            Some(ticket) => {
                self.shared.retire_worker(ticket).await;
                Ok(())
            }
            None => Err(PoolError::NoIdleWorker),
        }
    }

    /// Changes the pool bounds, stopping or spawning workers as needed.
    ///
    /// Busy workers above the new `max` are marked draining and go away
    /// when their in-flight call completes.
    pub async fn adjust_pool_size(&self, min: usize, max: usize) -> Result<(), PoolError> {
        if max < min {
            return Err(PoolError::InvalidConfig(format!(
                "max ({max}) must be at least min ({min})"
            )));
        }
        let mut retiring = Vec::new();
        {
            let mut st = self.shared.state.lock_or_panic();
            if st.stopping || st.finished {
                return Err(PoolError::PoolStopped);
            }
            st.min = min;
            st.max = max;
            let mut excess = st.workers.len().saturating_sub(max);
            while excess > 0 {
                let Some(id) = st.ready.pop() else { break };
                if let Some(ticket) = mark_draining(&mut st, id) {
                    retiring.push(ticket);
                    excess -= 1;
                }
            }
            if excess > 0 {
                // Not enough idle workers; drain busy ones as they finish.
                let busy: Vec<WorkerId> = st.busy.iter().copied().take(excess).collect();
                for id in busy {
                    if let Some(worker) = st.workers.get_mut(&id) {
                        worker.state = WorkerState::Draining;
                    }
                }
            }
            if st.started {
                while st.workers.len() < st.min {
                    self.shared.start_worker_locked(&mut st)?;
                }
            }
        }
        futures::future::join_all(
            retiring
                .into_iter()
                .map(|ticket| self.shared.retire_worker(ticket)),
        )
        .await;
        Ok(())
    }

    pub fn stats(&self) -> PoolStats {
        let st = self.shared.state.lock_or_panic();
        PoolStats {
            processes: st.workers.len(),
            ready: st.ready.len(),
            busy: st.busy.len(),
            queued: st.queue.len(),
            finish_watchers: st.finish_watchers.len(),
            min: st.min,
            max: st.max,
            started: st.started,
            finished: st.finished,
        }
    }

    /// Endpoints of every live worker, for direct control traffic.
    pub fn worker_endpoints(&self) -> Vec<Endpoint> {
        let st = self.shared.state.lock_or_panic();
        st.workers.values().map(|w| w.endpoint.clone()).collect()
    }
}

/// Moves a worker (already removed from `ready`) into draining and hands
/// back what the retire path needs.
fn mark_draining(st: &mut PoolState, id: WorkerId) -> Option<RetireTicket> {
    let worker = st.workers.get_mut(&id)?;
    worker.state = WorkerState::Draining;
    Some((id, worker.endpoint.clone(), worker.finished.clone()))
}

impl PoolShared {
    /// Admission: ready worker first, then growth, then queue.
    fn submit(self: &Arc<Self>, item: WorkItem) {
        let mut st = self.state.lock_or_panic();
        if !st.started || st.stopping || st.finished {
            let _ = item.reply.send(Err(PoolError::PoolStopped));
            return;
        }
        if let Some(id) = st.ready.pop() {
            self.assign(&mut st, id, item);
            return;
        }
        st.queue.push_back(item);
        if st.workers.len() < st.max {
            // The new worker picks the queue up FIFO, so the item that
            // triggered the growth is served first.
            if let Err(e) = self.start_worker_locked(&mut st) {
                if let Some(item) = st.queue.pop_back() {
                    let _ = item.reply.send(Err(e));
                }
            }
        }
    }

    /// Hands `item` to a ready worker and fires the call task.
    fn assign(self: &Arc<Self>, st: &mut PoolState, id: WorkerId, item: WorkItem) {
        let Some(worker) = st.workers.get_mut(&id) else {
            // `ready` and `workers` are kept in lockstep; reaching this
            // would mean the invariant broke, so fail the item loudly.
            warn!(%id, "ready list referenced an unknown worker");
            let _ = item.reply.send(Err(PoolError::PoolStopped));
            return;
        };
        worker.state = WorkerState::Busy;
        st.busy.insert(id);
        let endpoint = worker.endpoint.clone();
        let shared = self.clone();
        tokio::spawn(async move {
            let outcome = endpoint.call_raw(&item.command, item.payload).await;
            let outcome = shared.after_call(id, outcome);
            let _ = item.reply.send(outcome);
        });
    }

    /// The post-call hook: bookkeeping first, then the caller sees the
    /// outcome.
    fn after_call(
        self: &Arc<Self>,
        id: WorkerId,
        result: Result<Bytes, IpcError>,
    ) -> Result<Bytes, PoolError> {
        let mut retire = None;
        {
            let mut st = self.state.lock_or_panic();
            st.busy.remove(&id);
            let stopping = st.stopping;
            if let Some(worker) = st.workers.get_mut(&id) {
                if matches!(
                    result,
                    Err(IpcError::ConnectionLost(_)) | Err(IpcError::Closed)
                ) {
                    // No framed response arrived: the worker died under the
                    // call, or its endpoint was closed out from under the
                    // pool. Either way the endpoint carries no further
                    // calls; the exit watcher removes the handle and heals.
                    worker.state = WorkerState::Draining;
                } else {
                    worker.call_count += 1;
                    worker.idle_since = Instant::now();
                    let recycle = self.config.recycle_after > 0
                        && worker.call_count >= self.config.recycle_after;
                    if recycle {
                        debug!(%id, pid = worker.pid, calls = worker.call_count, "recycling worker");
                    }
                    if recycle || stopping || worker.state == WorkerState::Draining {
                        worker.state = WorkerState::Draining;
                        retire = Some((id, worker.endpoint.clone(), worker.finished.clone()));
                    } else {
                        worker.state = WorkerState::Ready;
                        st.ready.push(id);
                    }
                }
            }
            self.dispatch_queued(&mut st);
        }
        if let Some(ticket) = retire {
            let shared = self.clone();
            tokio::spawn(async move {
                shared.retire_worker(ticket).await;
            });
        }
        result.map_err(PoolError::from)
    }

    /// Serves queued items FIFO onto ready workers. Items whose caller went
    /// away are discarded: their completion slot has no listener left.
    fn dispatch_queued(self: &Arc<Self>, st: &mut PoolState) {
        while !st.queue.is_empty() && !st.ready.is_empty() {
            #[allow(clippy::unwrap_used)] // both checked non-empty above
            let item = st.queue.pop_front().unwrap();
            if item.reply.is_closed() {
                debug!(command = %item.command, "dropping cancelled queued work");
                continue;
            }
            #[allow(clippy::unwrap_used)]
            let id = st.ready.pop().unwrap();
            self.assign(st, id, item);
        }
    }

    /// Spawns a worker and makes it ready, all under the lock; the handle
    /// counts toward the pool immediately, so concurrent admissions cannot
    /// double-spawn past `max`.
    fn start_worker_locked(self: &Arc<Self>, st: &mut PoolState) -> Result<WorkerId, PoolError> {
        let id = WorkerId(st.next_worker_id);
        st.next_worker_id += 1;
        let process = supervisor::spawn_worker(&self.config, id)?;
        info!(%id, pid = process.pid, handler = %self.config.handler, "started worker");

        let watcher = {
            let shared = self.clone();
            let finished = process.finished.clone();
            tokio::spawn(async move {
                let reason = finished.await;
                shared.on_worker_finished(id, reason);
            })
        };

        let mut worker = Worker {
            pid: process.pid,
            endpoint: process.endpoint,
            finished: process.finished,
            state: WorkerState::Starting,
            call_count: 0,
            idle_since: Instant::now(),
        };
        // The stdio pipes are usable from the moment of spawn, so the
        // handle graduates from Starting in the same lock acquisition.
        worker.state = WorkerState::Ready;
        st.ready.push(id);
        st.workers.insert(id, worker);
        st.finish_watchers.insert(id, watcher);
        self.dispatch_queued(st);
        Ok(id)
    }

    /// Asks a draining worker to shut down and waits it out. Removal is
    /// done here as well as in the exit watcher (first one wins), so
    /// callers observe consistent counts the moment this returns.
    async fn retire_worker(self: &Arc<Self>, (id, endpoint, finished): RetireTicket) {
        // A crashed worker fails the call instantly; either way the exit is
        // what settles things.
        let _ = endpoint.call::<Shutdown>(&()).await;
        let reason = finished.await;
        self.on_worker_finished(id, reason);
    }

    /// Exit handling: remove the handle everywhere, fail nothing (in-flight
    /// calls are failed by the endpoint), heal if the pool is running.
    fn on_worker_finished(self: &Arc<Self>, id: WorkerId, reason: ExitReason) {
        let mut st = self.state.lock_or_panic();
        let Some(mut worker) = st.workers.remove(&id) else {
            return;
        };
        worker.state = WorkerState::Dead;
        st.ready.retain(|ready| *ready != id);
        st.busy.remove(&id);
        st.finish_watchers.remove(&id);
        match reason {
            ExitReason::CleanExit => debug!(%id, pid = worker.pid, "worker exited cleanly"),
            reason => warn!(%id, pid = worker.pid, %reason, "worker exited"),
        }

        if st.stopping || st.finished {
            if st.stopping && !st.finished && st.workers.is_empty() {
                st.finished = true;
                let _ = self.finished_tx.send(true);
            }
            return;
        }
        if !st.started {
            return;
        }

        // Heal to min, plus enough capacity for queued work, capped at max.
        let mut wanted = st.min.max(st.workers.len());
        wanted = wanted.max(st.workers.len() + st.queue.len()).min(st.max);
        while st.workers.len() < wanted {
            match self.start_worker_locked(&mut st) {
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "failed to replace worker");
                    break;
                }
            }
        }
        self.dispatch_queued(&mut st);
    }

    /// Periodic idle pruning; holds only a `Weak` so an abandoned pool can
    /// unwind.
    fn spawn_pruner(self: &Arc<Self>) {
        if self.config.max_idle.is_zero() {
            return;
        }
        let max_idle = self.config.max_idle;
        let weak = Arc::downgrade(self);
        let pruner = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(max_idle);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticks.tick().await; // completes immediately
            loop {
                ticks.tick().await;
                let Some(shared) = weak.upgrade() else { break };
                shared.prune_idle().await;
            }
        });
        self.pruner.lock_or_panic().replace(pruner);
    }

    /// Stops ready workers that have idled past `max_idle`, never going
    /// below `min`.
    async fn prune_idle(self: &Arc<Self>) {
        loop {
            let ticket = {
                let mut st = self.state.lock_or_panic();
                if st.stopping || st.finished || st.workers.len() <= st.min {
                    None
                } else {
                    let max_idle = self.config.max_idle;
                    let position = st.ready.iter().position(|id| {
                        st.workers
                            .get(id)
                            .map(|w| w.idle_since.elapsed() >= max_idle)
                            .unwrap_or(false)
                    });
                    match position {
                        Some(position) => {
                            let id = st.ready.remove(position);
                            debug!(%id, "pruning idle worker");
                            mark_draining(&mut st, id)
                        }
                        None => None,
                    }
                }
            };
            match ticket {
                Some(ticket) => self.retire_worker(ticket).await,
                None => break,
            }
        }
    }
}
