// SPDX-License-Identifier: LGPL-2.1-or-later
// Copyright (C) 2026 Meshwork Contributors
//
// This file is part of Meshwork.
//
// Meshwork is free software: you can redistribute it and/or modify
// it under the terms of the GNU Lesser General Public License as published by
// the Free Software Foundation, either version 2.1 of the License, or
// (at your option) any later version.
//
// Meshwork is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public License
// along with Meshwork. If not, see <https://www.gnu.org/licenses/>.

//! Client-side lock manager with greedy caching.
//!
//! ## Purpose
//! [`ClientLockManager`] fronts the server's lock table for every thread on
//! one client. Recursion, downgrades and anything covered by a greedy grant
//! are satisfied locally with zero messages; everything else suspends the
//! caller on a per-request wake handle until the server answers through the
//! client's [`LockResponseSink`](crate::remote::LockResponseSink).
//!
//! ## Design Decisions
//! - One manager-wide `tokio::sync::Mutex` guards all per-lock state, and
//!   every outbound remote call happens while it is held. That keeps the
//!   client's message stream per lock in the order decisions were made, at
//!   the cost of serializing sends.
//! - Under a greedy grant the manager runs the full local protocol between
//!   its own threads: read sharing, write exclusion, FIFO queuing, local
//!   wait/notify with local timers.
//! - A recall commit is deferred while a local write hold is active; read
//!   holds, waiters and queued requests travel inside the commit batch and
//!   become plain server-side participants.
//! - While paused, every mutating entry parks on a FIFO gate that unpause
//!   drains in arrival order.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{LockError, LockResult};
use crate::ids::{ClientID, LockID, SessionID, ThreadID};
use crate::level::{LockLevel, ServerLockLevel};
use crate::remote::{RemoteLockManager, WaitSpec};
use crate::state::{ContextType, State};
use crate::wire::{ClientServerExchangeLockContext, Notify, RecallBatchContext};

/// Hook invoked after a wait is registered and flushed but before the
/// calling task parks. Gives the caller a last chance to publish state
/// the notifying side needs to observe.
pub trait WaitListener: Send + Sync {
    fn pre_block(&self) {}
}

/// Listener that does nothing before the wait parks.
pub struct NoWaitListener;

impl WaitListener for NoWaitListener {}

/// Whether the manager is serving callers or parked for a reconnect.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Running,
    Paused,
    Starting,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum HoldStatus {
    Holding,
    /// Parked in wait, the hold is released until notified.
    Waiting,
    /// Notified (or timed out), re-acquiring through the queue.
    Pending,
}

/// One thread's recursive hold on one lock.
struct LockHold {
    /// Acquisition stack: one entry per nested lock call, popped in
    /// unlock order. Write anywhere in the stack means a write hold.
    levels: Vec<LockLevel>,
    /// What the server believes this thread holds. `None` for holds
    /// granted locally under a greedy grant.
    server_level: Option<ServerLockLevel>,
    status: HoldStatus,
    wait: Option<WaitSpec>,
}

impl LockHold {
    fn new(level: LockLevel) -> LockHold {
        LockHold {
            levels: vec![level],
            server_level: None,
            status: HoldStatus::Holding,
            wait: None,
        }
    }

    fn current_level(&self) -> ServerLockLevel {
        if self.levels.iter().any(|l| l.is_write()) {
            ServerLockLevel::Write
        } else {
            ServerLockLevel::Read
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RequestKind {
    Lock,
    TryLock,
    /// Re-acquisition after a wait; the hold already exists.
    WaitReacquire,
}

#[derive(Debug, PartialEq, Eq)]
enum RequestOutcome {
    Awarded,
    Refused,
}

struct LockRequest {
    thread: ThreadID,
    level: ServerLockLevel,
    /// Pushed onto the hold's stack when granted.
    acquire: LockLevel,
    kind: RequestKind,
    /// True once the server knows about this request.
    remote: bool,
    timeout_millis: Option<i64>,
    waker: Option<oneshot::Sender<RequestOutcome>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Greediness {
    NotGreedy,
    Greedy {
        level: ServerLockLevel,
    },
    /// The server asked for the grant back; the commit is pending a
    /// local write hold's release.
    Recalled {
        level: ServerLockLevel,
        recall_level: ServerLockLevel,
        generation: u64,
    },
}

struct ClientLock {
    holds: HashMap<ThreadID, LockHold>,
    /// Outstanding asks in arrival order; wait re-acquisitions included,
    /// flagged by kind.
    requests: Vec<LockRequest>,
    greediness: Greediness,
    /// Threads whose try-lock expired locally with an award still in
    /// flight; a late award for one of these is released back.
    withdrawn: HashSet<ThreadID>,
    wait_timers: HashMap<ThreadID, JoinHandle<()>>,
}

impl Default for ClientLock {
    fn default() -> Self {
        ClientLock {
            holds: HashMap::new(),
            requests: Vec::new(),
            greediness: Greediness::NotGreedy,
            withdrawn: HashSet::new(),
            wait_timers: HashMap::new(),
        }
    }
}

impl ClientLock {
    fn covers(&self, level: ServerLockLevel) -> bool {
        match self.greediness {
            Greediness::Greedy { level: g } => {
                g == ServerLockLevel::Write || level == ServerLockLevel::Read
            }
            _ => false,
        }
    }

    /// A recalled write grant keeps covering local threads until the
    /// commit ships, so wait and notify on it stay client-local.
    fn write_grant_is_local(&self) -> bool {
        matches!(
            self.greediness,
            Greediness::Greedy { level: ServerLockLevel::Write }
                | Greediness::Recalled { level: ServerLockLevel::Write, .. }
        )
    }

    /// Local conflict rule: an active write hold excludes everyone else,
    /// an active read hold excludes writers. `thread`'s own hold never
    /// blocks its own request (that is the upgrade case).
    fn conflicts(&self, thread: ThreadID, level: ServerLockLevel) -> bool {
        self.holds.iter().any(|(t, h)| {
            *t != thread
                && h.status == HoldStatus::Holding
                && match level {
                    ServerLockLevel::Read => h.current_level() == ServerLockLevel::Write,
                    ServerLockLevel::Write => true,
                }
        })
    }

    fn has_active_write(&self) -> bool {
        self.holds
            .values()
            .any(|h| h.status == HoldStatus::Holding && h.current_level() == ServerLockLevel::Write)
    }

    fn has_request(&self, thread: ThreadID) -> bool {
        self.requests
            .iter()
            .any(|r| r.thread == thread && r.kind != RequestKind::WaitReacquire)
    }

    fn enqueue(
        &mut self,
        thread: ThreadID,
        level: ServerLockLevel,
        acquire: LockLevel,
        kind: RequestKind,
        remote: bool,
        timeout_millis: Option<i64>,
    ) -> oneshot::Receiver<RequestOutcome> {
        let (tx, rx) = oneshot::channel();
        self.requests.push(LockRequest {
            thread,
            level,
            acquire,
            kind,
            remote,
            timeout_millis,
            waker: Some(tx),
        });
        rx
    }

    fn take_request(&mut self, thread: ThreadID, kind: RequestKind) -> Option<LockRequest> {
        self.requests
            .iter()
            .position(|r| r.thread == thread && r.kind == kind)
            .map(|pos| self.requests.remove(pos))
    }

    fn grant(&mut self, req: LockRequest) {
        match req.kind {
            RequestKind::WaitReacquire => {
                if let Some(hold) = self.holds.get_mut(&req.thread) {
                    hold.status = HoldStatus::Holding;
                    hold.wait = None;
                }
            }
            RequestKind::Lock | RequestKind::TryLock => match self.holds.get_mut(&req.thread) {
                Some(hold) => hold.levels.push(req.acquire),
                None => {
                    self.holds.insert(req.thread, LockHold::new(req.acquire));
                }
            },
        }
        if let Some(tx) = req.waker {
            let _ = tx.send(RequestOutcome::Awarded);
        }
    }

    /// Grant queued requests that the greedy grant can satisfy, FIFO with
    /// no overtaking. Dormant waiters are not part of the queue.
    fn service_local(&mut self) {
        loop {
            let mut pick = None;
            for (pos, r) in self.requests.iter().enumerate() {
                let eligible = match r.kind {
                    RequestKind::WaitReacquire => {
                        match self.holds.get(&r.thread).map(|h| h.status) {
                            Some(HoldStatus::Pending) => Some(
                                self.covers(ServerLockLevel::Write)
                                    && !self.conflicts(r.thread, ServerLockLevel::Write),
                            ),
                            _ => None,
                        }
                    }
                    _ => Some(self.covers(r.level) && !self.conflicts(r.thread, r.level)),
                };
                match eligible {
                    None => continue,
                    Some(true) => {
                        pick = Some(pos);
                        break;
                    }
                    Some(false) => break,
                }
            }
            let Some(pos) = pick else { break };
            let req = self.requests.remove(pos);
            self.grant(req);
        }
    }
}

struct Inner {
    run_state: RunState,
    session: SessionID,
    locks: HashMap<LockID, ClientLock>,
    gate: VecDeque<oneshot::Sender<()>>,
}

enum Acquire {
    Immediate,
    Wait(oneshot::Receiver<RequestOutcome>),
}

/// Per-client lock manager.
pub struct ClientLockManager {
    client: ClientID,
    remote: Arc<dyn RemoteLockManager>,
    inner: Mutex<Inner>,
}

impl ClientLockManager {
    pub fn new(
        client: ClientID,
        session: SessionID,
        remote: Arc<dyn RemoteLockManager>,
    ) -> Arc<ClientLockManager> {
        Arc::new(ClientLockManager {
            client,
            remote,
            inner: Mutex::new(Inner {
                run_state: RunState::Running,
                session,
                locks: HashMap::new(),
                gate: VecDeque::new(),
            }),
        })
    }

    pub fn client_id(&self) -> ClientID {
        self.client
    }

    /// Block until the manager is running. Paused callers park on a FIFO
    /// gate that `unpause` drains in arrival order.
    async fn gated(&self) -> MutexGuard<'_, Inner> {
        loop {
            let mut inner = self.inner.lock().await;
            if inner.run_state == RunState::Running {
                return inner;
            }
            let (tx, rx) = oneshot::channel();
            inner.gate.push_back(tx);
            drop(inner);
            let _ = rx.await;
        }
    }

    /// Acquire `id` at `level` for `thread`, suspending until granted.
    pub async fn lock(&self, id: LockID, thread: ThreadID, level: LockLevel) -> LockResult<()> {
        let server_level = ServerLockLevel::from(level);
        let mut inner = self.gated().await;
        let plan = {
            let lk = inner.locks.entry(id.clone()).or_default();
            if lk.has_request(thread) {
                return Err(LockError::ProtocolViolation(format!(
                    "{} already has an outstanding request on {}",
                    thread, id
                )));
            }
            let covered = lk.covers(server_level);
            let conflict = lk.conflicts(thread, server_level);
            let recalled = matches!(lk.greediness, Greediness::Recalled { .. });
            let held = lk.holds.get(&thread).map(|h| (h.status, h.current_level()));
            if let Some((status, current)) = held {
                if status != HoldStatus::Holding {
                    return Err(LockError::ProtocolViolation(format!(
                        "{} acquired {} while parked in wait on it",
                        thread, id
                    )));
                }
                if current == ServerLockLevel::Write || server_level == ServerLockLevel::Read {
                    // Recursion or downgrade, never a message.
                    if let Some(hold) = lk.holds.get_mut(&thread) {
                        hold.levels.push(level);
                        debug!(lock = %id, thread = %thread, depth = hold.levels.len(), "recursed locally");
                    }
                    Acquire::Immediate
                } else if covered && !conflict {
                    // Upgrade inside a greedy write grant.
                    if let Some(hold) = lk.holds.get_mut(&thread) {
                        hold.levels.push(level);
                    }
                    Acquire::Immediate
                } else if covered || recalled {
                    // Upgrade blocked by a local reader, or a recall in
                    // flight; queue locally.
                    Acquire::Wait(lk.enqueue(
                        thread,
                        server_level,
                        level,
                        RequestKind::Lock,
                        false,
                        None,
                    ))
                } else {
                    // Read-held upgrade goes to the server as a fresh
                    // write request.
                    let rx = lk.enqueue(thread, server_level, level, RequestKind::Lock, true, None);
                    if let Err(e) = self.remote.request_lock(id.clone(), thread, server_level).await
                    {
                        self.withdraw(&mut inner, &id, thread);
                        return Err(e);
                    }
                    Acquire::Wait(rx)
                }
            } else if covered && !conflict {
                lk.holds.insert(thread, LockHold::new(level));
                debug!(lock = %id, thread = %thread, "awarded locally under greedy grant");
                Acquire::Immediate
            } else if covered || recalled {
                // Locally queued: either a greedy grant with local
                // contention, or a recall in flight. Recalled requests
                // ride to the server inside the commit batch.
                Acquire::Wait(lk.enqueue(thread, server_level, level, RequestKind::Lock, false, None))
            } else {
                let rx = lk.enqueue(thread, server_level, level, RequestKind::Lock, true, None);
                if let Err(e) = self.remote.request_lock(id.clone(), thread, server_level).await {
                    self.withdraw(&mut inner, &id, thread);
                    return Err(e);
                }
                Acquire::Wait(rx)
            }
        };
        drop(inner);
        match plan {
            Acquire::Immediate => Ok(()),
            Acquire::Wait(rx) => match rx.await {
                Ok(RequestOutcome::Awarded) => Ok(()),
                Ok(RequestOutcome::Refused) => Err(LockError::ProtocolViolation(format!(
                    "blocking request on {} was refused",
                    id
                ))),
                Err(_) => Err(LockError::Shutdown(format!(
                    "lock manager dropped while {} waited on {}",
                    thread, id
                ))),
            },
        }
    }

    /// Acquire without blocking beyond `timeout`. `Ok(false)` when the
    /// lock could not be taken in time.
    pub async fn try_lock(
        &self,
        id: LockID,
        thread: ThreadID,
        level: LockLevel,
        timeout: Option<Duration>,
    ) -> LockResult<bool> {
        let server_level = ServerLockLevel::from(level);
        let mut inner = self.gated().await;
        let plan = {
            let lk = inner.locks.entry(id.clone()).or_default();
            if lk.has_request(thread) {
                return Err(LockError::ProtocolViolation(format!(
                    "{} already has an outstanding request on {}",
                    thread, id
                )));
            }
            let covered = lk.covers(server_level);
            let conflict = lk.conflicts(thread, server_level);
            let held = lk.holds.get(&thread).map(|h| (h.status, h.current_level()));
            if let Some((status, current)) = held {
                if status != HoldStatus::Holding {
                    return Err(LockError::ProtocolViolation(format!(
                        "{} acquired {} while parked in wait on it",
                        thread, id
                    )));
                }
                let local = current == ServerLockLevel::Write
                    || server_level == ServerLockLevel::Read
                    || (covered && !conflict);
                if local {
                    if let Some(hold) = lk.holds.get_mut(&thread) {
                        hold.levels.push(level);
                    }
                    return Ok(true);
                }
            }
            if covered {
                if !conflict && held.is_none() {
                    lk.holds.insert(thread, LockHold::new(level));
                    return Ok(true);
                }
                if timeout.is_none() {
                    return Ok(false);
                }
                Acquire::Wait(lk.enqueue(
                    thread,
                    server_level,
                    level,
                    RequestKind::TryLock,
                    false,
                    timeout.map(|d| d.as_millis() as i64),
                ))
            } else {
                let rx = lk.enqueue(
                    thread,
                    server_level,
                    level,
                    RequestKind::TryLock,
                    true,
                    Some(timeout.map(|d| d.as_millis() as i64).unwrap_or(0)),
                );
                if let Err(e) = self
                    .remote
                    .try_request_lock(id.clone(), thread, server_level, timeout)
                    .await
                {
                    self.withdraw(&mut inner, &id, thread);
                    return Err(e);
                }
                Acquire::Wait(rx)
            }
        };
        drop(inner);
        let rx = match plan {
            Acquire::Immediate => return Ok(true),
            Acquire::Wait(rx) => rx,
        };
        let outcome = match timeout {
            None => rx.await.map_err(|_| shutdown_during(&id, thread))?,
            Some(d) => match tokio::time::timeout(d, rx).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(_)) => return Err(shutdown_during(&id, thread)),
                Err(_) => {
                    // Local deadline: withdraw, tolerating a crossing award.
                    return self.withdraw_expired_try(&id, thread).await;
                }
            },
        };
        Ok(outcome == RequestOutcome::Awarded)
    }

    /// Release one level of recursion; the final release goes remote
    /// unless a greedy grant absorbs it.
    pub async fn unlock(&self, id: LockID, thread: ThreadID) -> LockResult<()> {
        let mut inner = self.gated().await;
        let commit = {
            let lk = inner.locks.get_mut(&id).ok_or_else(|| {
                LockError::ProtocolViolation(format!("{} released unknown lock {}", thread, id))
            })?;
            let Some(hold) = lk
                .holds
                .get_mut(&thread)
                .filter(|h| h.status == HoldStatus::Holding)
            else {
                return Err(LockError::ProtocolViolation(format!(
                    "{} released {} without holding it",
                    thread, id
                )));
            };
            hold.levels.pop();
            if !hold.levels.is_empty() {
                return Ok(());
            }
            let was_remote = hold.server_level.is_some();
            lk.holds.remove(&thread);
            match lk.greediness {
                Greediness::Greedy { .. } => {
                    lk.service_local();
                    None
                }
                Greediness::Recalled { .. } if !lk.has_active_write() => {
                    Some(self.build_recall_commit(&id, lk)?)
                }
                Greediness::Recalled { .. } => None,
                Greediness::NotGreedy => {
                    if was_remote {
                        self.remote.release_lock(id.clone(), thread).await?;
                    }
                    None
                }
            }
        };
        if let Some((generation, batch)) = commit {
            self.remote.recall_commit(generation, batch).await?;
        }
        Ok(())
    }

    /// Park in wait on `id`, releasing the hold until a notify (or the
    /// timeout) brings it back. `listener.pre_block` runs after the wait
    /// is registered and flushed, before the task parks.
    pub async fn wait(
        self: &Arc<Self>,
        id: LockID,
        thread: ThreadID,
        spec: WaitSpec,
        listener: &dyn WaitListener,
    ) -> LockResult<()> {
        let mut inner = self.gated().await;
        let rx = {
            let lk = inner.locks.get_mut(&id).ok_or_else(|| monitor_state(&id, thread))?;
            let local = lk.write_grant_is_local();
            let Some(hold) = lk
                .holds
                .get_mut(&thread)
                .filter(|h| h.status == HoldStatus::Holding)
            else {
                return Err(monitor_state(&id, thread));
            };
            if hold.current_level() != ServerLockLevel::Write {
                return Err(monitor_state(&id, thread));
            }
            hold.status = HoldStatus::Waiting;
            hold.wait = Some(spec);
            let rx = lk.enqueue(
                thread,
                ServerLockLevel::Write,
                LockLevel::Write,
                RequestKind::WaitReacquire,
                !local,
                Some(spec.as_millis()),
            );
            if !local {
                if let Err(e) = self.remote.release_lock_wait(id.clone(), thread, spec).await {
                    // Roll back so the hold is not stranded in wait.
                    let _ = lk.take_request(thread, RequestKind::WaitReacquire);
                    if let Some(hold) = lk.holds.get_mut(&thread) {
                        hold.status = HoldStatus::Holding;
                        hold.wait = None;
                    }
                    return Err(e);
                }
            } else if matches!(lk.greediness, Greediness::Recalled { .. }) {
                // Waiting released the hold that deferred the commit;
                // the waiter travels inside the batch.
                if !lk.has_active_write() {
                    let (generation, batch) = self.build_recall_commit(&id, lk)?;
                    self.remote.recall_commit(generation, batch).await?;
                }
            } else {
                if let WaitSpec::Timeout(d) = spec {
                    self.schedule_local_wait_timeout(lk, &id, thread, d);
                }
                // The wait releases the lock for local threads.
                lk.service_local();
            }
            rx
        };
        drop(inner);
        listener.pre_block();
        match rx.await {
            Ok(RequestOutcome::Awarded) => Ok(()),
            Ok(RequestOutcome::Refused) => Err(LockError::ProtocolViolation(format!(
                "wait re-acquisition on {} was refused",
                id
            ))),
            Err(_) => Err(shutdown_during(&id, thread)),
        }
    }

    /// Wake one (or all) waiters. Returns [`Notify::NULL`] when the
    /// notify was fully satisfied locally; otherwise the caller carries
    /// the returned record to the server with its flush.
    pub async fn notify(&self, id: LockID, thread: ThreadID, all: bool) -> LockResult<Notify> {
        let mut inner = self.gated().await;
        let lk = inner.locks.get_mut(&id).ok_or_else(|| monitor_state(&id, thread))?;
        let holds_write = lk
            .holds
            .get(&thread)
            .map(|h| h.status == HoldStatus::Holding && h.current_level() == ServerLockLevel::Write)
            .unwrap_or(false);
        if !holds_write {
            return Err(monitor_state(&id, thread));
        }
        if !lk.write_grant_is_local() {
            return Ok(Notify::new(id, thread, all));
        }
        // Greedy: the server never sees this notify.
        let waiting: Vec<ThreadID> = lk
            .requests
            .iter()
            .filter(|r| r.kind == RequestKind::WaitReacquire)
            .map(|r| r.thread)
            .filter(|t| {
                lk.holds.get(t).map(|h| h.status == HoldStatus::Waiting).unwrap_or(false)
            })
            .collect();
        for t in waiting {
            if let Some(hold) = lk.holds.get_mut(&t) {
                hold.status = HoldStatus::Pending;
            }
            if let Some(timer) = lk.wait_timers.remove(&t) {
                timer.abort();
            }
            if !all {
                break;
            }
        }
        Ok(Notify::NULL)
    }

    /// Break a parked waiter out without a notify.
    pub async fn interrupt(&self, id: LockID, thread: ThreadID) -> LockResult<()> {
        let mut inner = self.gated().await;
        let lk = match inner.locks.get_mut(&id) {
            Some(lk) => lk,
            None => {
                warn!(lock = %id, thread = %thread, "interrupt for unknown lock, ignoring");
                return Ok(());
            }
        };
        let waiting = lk
            .holds
            .get(&thread)
            .map(|h| h.status == HoldStatus::Waiting)
            .unwrap_or(false);
        if !waiting {
            warn!(lock = %id, thread = %thread, "interrupt for a thread not in wait, ignoring");
            return Ok(());
        }
        if lk.write_grant_is_local() {
            if let Some(hold) = lk.holds.get_mut(&thread) {
                hold.status = HoldStatus::Pending;
            }
            if let Some(timer) = lk.wait_timers.remove(&thread) {
                timer.abort();
            }
            lk.service_local();
        } else {
            self.remote.interrupt_wait(id.clone(), thread).await?;
        }
        Ok(())
    }

    // Inbound callbacks, driven by this client's response sink.

    /// A grant from the server. Greedy awards target [`ThreadID::VM`] and
    /// fan out to queued local requests.
    pub async fn awarded(
        &self,
        session: SessionID,
        id: LockID,
        thread: ThreadID,
        level: ServerLockLevel,
        greedy: bool,
    ) -> LockResult<()> {
        let mut inner = self.inner.lock().await;
        if session != inner.session {
            warn!(lock = %id, %session, current = %inner.session, "award for stale session, dropping");
            return Ok(());
        }
        let inner = &mut *inner;
        let lk = inner.locks.entry(id.clone()).or_default();
        if greedy {
            if !thread.is_vm() {
                return Err(LockError::ProtocolViolation(format!(
                    "greedy award on {} targeted {} instead of the vm thread",
                    id, thread
                )));
            }
            debug!(lock = %id, level = %level, "greedy grant received");
            lk.greediness = Greediness::Greedy { level };
            lk.service_local();
            return Ok(());
        }
        if let Some(pos) = lk
            .requests
            .iter()
            .position(|r| r.thread == thread && r.kind != RequestKind::WaitReacquire)
        {
            let mut req = lk.requests.remove(pos);
            match lk.holds.get_mut(&thread) {
                Some(hold) => {
                    // Upgrade award: the read hold grows a write level.
                    hold.levels.push(req.acquire);
                    hold.server_level = Some(level);
                }
                None => {
                    let mut hold = LockHold::new(req.acquire);
                    hold.server_level = Some(level);
                    lk.holds.insert(thread, hold);
                }
            }
            if let Some(tx) = req.waker.take() {
                let _ = tx.send(RequestOutcome::Awarded);
            }
            return Ok(());
        }
        if let Some(pos) = lk
            .requests
            .iter()
            .position(|r| r.thread == thread && r.kind == RequestKind::WaitReacquire)
        {
            let mut req = lk.requests.remove(pos);
            if let Some(hold) = lk.holds.get_mut(&thread) {
                hold.status = HoldStatus::Holding;
                hold.wait = None;
                hold.server_level = Some(level);
            }
            if let Some(tx) = req.waker.take() {
                let _ = tx.send(RequestOutcome::Awarded);
            }
            return Ok(());
        }
        if lk.withdrawn.remove(&thread) {
            warn!(lock = %id, thread = %thread, "award crossed a withdrawn try-lock, releasing it back");
            self.remote.release_lock(id.clone(), thread).await?;
            return Ok(());
        }
        Err(LockError::ProtocolViolation(format!(
            "award on {} for {} with no pending request",
            id, thread
        )))
    }

    /// A try-lock the server could not grant.
    pub async fn cannot_award(
        &self,
        session: SessionID,
        id: LockID,
        thread: ThreadID,
    ) -> LockResult<()> {
        let mut inner = self.inner.lock().await;
        if session != inner.session {
            warn!(lock = %id, %session, "refusal for stale session, dropping");
            return Ok(());
        }
        let Some(lk) = inner.locks.get_mut(&id) else {
            return Ok(());
        };
        if let Some(mut req) = lk.take_request(thread, RequestKind::TryLock) {
            if let Some(tx) = req.waker.take() {
                let _ = tx.send(RequestOutcome::Refused);
            }
        } else if lk.withdrawn.remove(&thread) {
            debug!(lock = %id, thread = %thread, "refusal confirmed a withdrawn try-lock");
        } else {
            warn!(lock = %id, thread = %thread, "refusal with no pending try-lock, ignoring");
        }
        Ok(())
    }

    /// A waiter on this client was woken by a cluster notify; it will be
    /// re-awarded when the server can grant it.
    pub async fn notified(
        &self,
        session: SessionID,
        id: LockID,
        thread: ThreadID,
    ) -> LockResult<()> {
        let mut inner = self.inner.lock().await;
        if session != inner.session {
            warn!(lock = %id, %session, "notify for stale session, dropping");
            return Ok(());
        }
        let Some(hold) = inner
            .locks
            .get_mut(&id)
            .and_then(|lk| lk.holds.get_mut(&thread))
        else {
            warn!(lock = %id, thread = %thread, "notify for unknown waiter, ignoring");
            return Ok(());
        };
        match hold.status {
            HoldStatus::Waiting => hold.status = HoldStatus::Pending,
            // Replays after a resend are tolerated.
            HoldStatus::Pending | HoldStatus::Holding => {
                warn!(lock = %id, thread = %thread, "notify already applied, ignoring")
            }
        }
        Ok(())
    }

    /// The server wants our greedy grant back. The commit ships as soon
    /// as no local write hold is active.
    pub async fn recalled(
        &self,
        session: SessionID,
        id: LockID,
        level: ServerLockLevel,
        generation: u64,
    ) -> LockResult<()> {
        let mut inner = self.inner.lock().await;
        if session != inner.session {
            warn!(lock = %id, %session, "recall for stale session, dropping");
            return Ok(());
        }
        let commit = {
            let Some(lk) = inner.locks.get_mut(&id) else {
                warn!(lock = %id, "recall for unknown lock, ignoring");
                return Ok(());
            };
            match lk.greediness {
                Greediness::Greedy { level: held } => {
                    debug!(lock = %id, generation, recall_level = %level, "greedy grant recalled");
                    lk.greediness = Greediness::Recalled {
                        level: held,
                        recall_level: level,
                        generation,
                    };
                    if lk.has_active_write() {
                        None
                    } else {
                        Some(self.build_recall_commit(&id, lk)?)
                    }
                }
                _ => {
                    warn!(lock = %id, generation, "recall without a greedy grant, ignoring");
                    None
                }
            }
        };
        if let Some((generation, batch)) = commit {
            self.remote.recall_commit(generation, batch).await?;
        }
        Ok(())
    }

    /// A server-side wait timeout. The re-award follows through the
    /// normal pending path; local timers cover greedy waits instead.
    pub async fn wait_timeout(
        &self,
        session: SessionID,
        id: LockID,
        thread: ThreadID,
    ) -> LockResult<()> {
        let mut inner = self.inner.lock().await;
        if session != inner.session {
            warn!(lock = %id, %session, "wait timeout for stale session, dropping");
            return Ok(());
        }
        if let Some(hold) = inner
            .locks
            .get_mut(&id)
            .and_then(|lk| lk.holds.get_mut(&thread))
        {
            if hold.status == HoldStatus::Waiting {
                hold.status = HoldStatus::Pending;
            }
        }
        Ok(())
    }

    // Pause / reconnect.

    /// Stop admitting callers; in-flight callers already past the gate
    /// finish their current operation.
    pub async fn pause(&self) {
        let mut inner = self.inner.lock().await;
        debug!("lock manager paused");
        inner.run_state = RunState::Paused;
    }

    /// Enter the reconnect window: still gated, snapshots may be taken
    /// and resent.
    pub async fn starting(&self) {
        let mut inner = self.inner.lock().await;
        inner.run_state = RunState::Starting;
    }

    /// Resume, releasing gated callers in the order they arrived.
    pub async fn unpause(&self) {
        let mut inner = self.inner.lock().await;
        debug!(parked = inner.gate.len(), "lock manager resumed");
        inner.run_state = RunState::Running;
        while let Some(tx) = inner.gate.pop_front() {
            let _ = tx.send(());
        }
    }

    pub async fn run_state(&self) -> RunState {
        self.inner.lock().await.run_state
    }

    /// Everything this client actively holds, greedy grants included.
    pub async fn add_all_held_locks_to(&self, out: &mut Vec<ClientServerExchangeLockContext>) {
        let inner = self.inner.lock().await;
        for (id, lk) in &inner.locks {
            if let Greediness::Greedy { level } = lk.greediness {
                out.push(ClientServerExchangeLockContext::new(
                    id.clone(),
                    self.client,
                    ThreadID::VM,
                    State::of(ContextType::GreedyHolder, level),
                ));
            }
            for (t, h) in &lk.holds {
                if h.status == HoldStatus::Holding && h.server_level.is_some() {
                    out.push(ClientServerExchangeLockContext::new(
                        id.clone(),
                        self.client,
                        *t,
                        State::of(ContextType::Holder, h.current_level()),
                    ));
                }
            }
        }
    }

    /// Every request the server should know about but has not answered.
    pub async fn add_all_pending_lock_requests_to(
        &self,
        out: &mut Vec<ClientServerExchangeLockContext>,
    ) {
        let inner = self.inner.lock().await;
        for (id, lk) in &inner.locks {
            for r in lk.requests.iter().filter(|r| r.remote) {
                match r.kind {
                    RequestKind::Lock => out.push(ClientServerExchangeLockContext::new(
                        id.clone(),
                        self.client,
                        r.thread,
                        State::of(ContextType::Pending, r.level),
                    )),
                    RequestKind::TryLock => out.push(ClientServerExchangeLockContext::with_timeout(
                        id.clone(),
                        self.client,
                        r.thread,
                        State::of(ContextType::TryPending, r.level),
                        r.timeout_millis.unwrap_or(0),
                    )),
                    RequestKind::WaitReacquire => {}
                }
            }
        }
    }

    /// Every thread parked in wait. Disjoint from the held set.
    pub async fn add_all_waiters_to(&self, out: &mut Vec<ClientServerExchangeLockContext>) {
        let inner = self.inner.lock().await;
        for (id, lk) in &inner.locks {
            for (t, h) in &lk.holds {
                if h.status == HoldStatus::Waiting {
                    out.push(ClientServerExchangeLockContext::with_timeout(
                        id.clone(),
                        self.client,
                        *t,
                        State::of(ContextType::Waiter, ServerLockLevel::Write),
                        h.wait.map(|w| w.as_millis()).unwrap_or(-1),
                    ));
                }
            }
        }
    }

    /// Adopt the new session and replay every outstanding request under
    /// it. Called during the reconnect window, after the server has
    /// re-applied the held and waiting snapshots.
    pub async fn resend_pending(&self, session: SessionID) -> LockResult<()> {
        let mut inner = self.inner.lock().await;
        inner.session = session;
        let mut replays = Vec::new();
        for (id, lk) in &inner.locks {
            for r in lk.requests.iter().filter(|r| r.remote) {
                replays.push((id.clone(), r.thread, r.level, r.kind, r.timeout_millis));
            }
        }
        drop(inner);
        for (id, thread, level, kind, timeout_millis) in replays {
            match kind {
                RequestKind::Lock => self.remote.request_lock(id, thread, level).await?,
                RequestKind::TryLock => {
                    let timeout = timeout_millis
                        .filter(|m| *m > 0)
                        .map(|m| Duration::from_millis(m as u64));
                    self.remote.try_request_lock(id, thread, level, timeout).await?
                }
                RequestKind::WaitReacquire => {}
            }
        }
        Ok(())
    }

    // Internals.

    fn withdraw(&self, inner: &mut Inner, id: &LockID, thread: ThreadID) {
        if let Some(lk) = inner.locks.get_mut(id) {
            lk.requests.retain(|r| r.thread != thread || r.kind == RequestKind::WaitReacquire);
        }
    }

    async fn withdraw_expired_try(&self, id: &LockID, thread: ThreadID) -> LockResult<bool> {
        let mut inner = self.inner.lock().await;
        let release = {
            let Some(lk) = inner.locks.get_mut(id) else {
                return Ok(false);
            };
            if let Some(pos) = lk
                .requests
                .iter()
                .position(|r| r.thread == thread && r.kind == RequestKind::TryLock)
            {
                let req = lk.requests.remove(pos);
                if req.remote {
                    lk.withdrawn.insert(thread);
                }
                false
            } else if let Some(remote) = lk.holds.get(&thread).map(|h| h.server_level.is_some()) {
                // The award crossed our deadline; give it straight back.
                lk.holds.remove(&thread);
                if !remote {
                    // A local grant under a greedy grant; re-run the queue.
                    lk.service_local();
                }
                remote
            } else {
                false
            }
        };
        if release {
            warn!(lock = %id, thread = %thread, "try-lock award crossed the local deadline, releasing");
            self.remote.release_lock(id.clone(), thread).await?;
        }
        Ok(false)
    }

    /// Batch up the true participants behind a greedy grant and retire it.
    fn build_recall_commit(
        &self,
        id: &LockID,
        lk: &mut ClientLock,
    ) -> LockResult<(u64, RecallBatchContext)> {
        let Greediness::Recalled { level, recall_level, generation } = lk.greediness else {
            return Err(LockError::ProtocolViolation(format!(
                "recall commit built for {} without a recall",
                id
            )));
        };
        debug!(lock = %id, generation, held = %level, recall_level = %recall_level,
               "committing recalled greedy grant");
        let mut contexts = Vec::new();
        for (t, h) in lk.holds.iter_mut() {
            match h.status {
                HoldStatus::Holding => {
                    let level = h.current_level();
                    h.server_level = Some(level);
                    contexts.push(ClientServerExchangeLockContext::new(
                        id.clone(),
                        self.client,
                        *t,
                        State::of(ContextType::Holder, level),
                    ));
                }
                HoldStatus::Waiting => contexts.push(ClientServerExchangeLockContext::with_timeout(
                    id.clone(),
                    self.client,
                    *t,
                    State::of(ContextType::Waiter, ServerLockLevel::Write),
                    h.wait.map(|w| w.as_millis()).unwrap_or(-1),
                )),
                HoldStatus::Pending => contexts.push(ClientServerExchangeLockContext::new(
                    id.clone(),
                    self.client,
                    *t,
                    State::of(ContextType::Pending, ServerLockLevel::Write),
                )),
            }
        }
        // The server owns wait timeouts from here on.
        for (_, timer) in lk.wait_timers.drain() {
            timer.abort();
        }
        for r in lk.requests.iter_mut() {
            // A request already sent remotely sits in the server's queue;
            // repeating it in the batch would queue it twice.
            if !r.remote && r.kind != RequestKind::WaitReacquire {
                let kind = if r.kind == RequestKind::TryLock {
                    ContextType::TryPending
                } else {
                    ContextType::Pending
                };
                let mut ctx = ClientServerExchangeLockContext::new(
                    id.clone(),
                    self.client,
                    r.thread,
                    State::of(kind, r.level),
                );
                ctx.timeout_millis = r.timeout_millis.or(Some(-1)).filter(|_| kind == ContextType::TryPending);
                contexts.push(ctx);
            }
            r.remote = true;
        }
        lk.greediness = Greediness::NotGreedy;
        let batch = RecallBatchContext::new(id.clone(), contexts)?;
        Ok((generation, batch))
    }

    fn schedule_local_wait_timeout(
        self: &Arc<Self>,
        lk: &mut ClientLock,
        id: &LockID,
        thread: ThreadID,
        timeout: Duration,
    ) {
        let weak = Arc::downgrade(self);
        let id = id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(mgr) = weak.upgrade() {
                mgr.on_local_wait_timeout(id, thread).await;
            }
        });
        lk.wait_timers.insert(thread, handle);
    }

    async fn on_local_wait_timeout(self: Arc<Self>, id: LockID, thread: ThreadID) {
        let mut inner = self.inner.lock().await;
        let Some(lk) = inner.locks.get_mut(&id) else {
            return;
        };
        lk.wait_timers.remove(&thread);
        let still_waiting = lk
            .holds
            .get(&thread)
            .map(|h| h.status == HoldStatus::Waiting)
            .unwrap_or(false);
        if !still_waiting {
            return;
        }
        debug!(lock = %id, thread = %thread, "local wait timed out");
        if let Some(hold) = lk.holds.get_mut(&thread) {
            hold.status = HoldStatus::Pending;
        }
        lk.service_local();
    }
}

fn monitor_state(id: &LockID, thread: ThreadID) -> LockError {
    LockError::IllegalMonitorState(format!(
        "{} does not own the write monitor on {}",
        thread, id
    ))
}

fn shutdown_during(id: &LockID, thread: ThreadID) -> LockError {
    LockError::Shutdown(format!(
        "lock manager dropped while {} was parked on {}",
        thread, id
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{RecordingRemote, RemoteCall};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn numeric(n: i64) -> LockID {
        LockID::Numeric(n)
    }

    fn harness(auto: bool, greedy: bool) -> (Arc<RecordingRemote>, Arc<ClientLockManager>) {
        let remote = if auto {
            RecordingRemote::auto(greedy)
        } else {
            RecordingRemote::new()
        };
        let mgr = ClientLockManager::new(ClientID(1), SessionID(1), remote.clone());
        remote.attach(&mgr);
        (remote, mgr)
    }

    fn requests(calls: &[RemoteCall]) -> usize {
        calls
            .iter()
            .filter(|c| matches!(c, RemoteCall::Request { .. }))
            .count()
    }

    fn releases(calls: &[RemoteCall]) -> usize {
        calls
            .iter()
            .filter(|c| matches!(c, RemoteCall::Release { .. }))
            .count()
    }

    #[tokio::test]
    async fn nested_acquires_release_remotely_only_at_the_end() {
        let (remote, mgr) = harness(true, false);
        let id = numeric(1);
        mgr.lock(id.clone(), ThreadID(1), LockLevel::Write).await.unwrap();
        mgr.lock(id.clone(), ThreadID(1), LockLevel::Read).await.unwrap();
        mgr.lock(id.clone(), ThreadID(1), LockLevel::Write).await.unwrap();
        assert_eq!(requests(&remote.calls()), 1);

        mgr.unlock(id.clone(), ThreadID(1)).await.unwrap();
        mgr.unlock(id.clone(), ThreadID(1)).await.unwrap();
        assert_eq!(releases(&remote.calls()), 0);
        mgr.unlock(id.clone(), ThreadID(1)).await.unwrap();
        assert_eq!(releases(&remote.calls()), 1);

        let err = mgr.unlock(id.clone(), ThreadID(1)).await.unwrap_err();
        assert!(err.is_protocol_violation());
    }

    #[tokio::test]
    async fn upgrade_goes_remote_downgrade_stays_local() {
        let (remote, mgr) = harness(true, false);
        let id = numeric(2);

        mgr.lock(id.clone(), ThreadID(1), LockLevel::Read).await.unwrap();
        mgr.lock(id.clone(), ThreadID(1), LockLevel::Write).await.unwrap();
        // The upgrade is a fresh write request.
        assert_eq!(requests(&remote.calls()), 2);

        // Downgrade to read inside the write hold is silent.
        mgr.lock(id.clone(), ThreadID(1), LockLevel::Read).await.unwrap();
        assert_eq!(requests(&remote.calls()), 2);

        mgr.unlock(id.clone(), ThreadID(1)).await.unwrap();
        mgr.unlock(id.clone(), ThreadID(1)).await.unwrap();
        assert_eq!(releases(&remote.calls()), 0);
        mgr.unlock(id.clone(), ThreadID(1)).await.unwrap();
        assert_eq!(releases(&remote.calls()), 1);
    }

    #[tokio::test]
    async fn greedy_grant_serves_every_thread_with_one_message() {
        let (remote, mgr) = harness(true, true);
        let id = numeric(3);

        mgr.lock(id.clone(), ThreadID(1), LockLevel::Write).await.unwrap();
        mgr.unlock(id.clone(), ThreadID(1)).await.unwrap();
        mgr.lock(id.clone(), ThreadID(2), LockLevel::Write).await.unwrap();
        mgr.unlock(id.clone(), ThreadID(2)).await.unwrap();
        mgr.lock(id.clone(), ThreadID(3), LockLevel::Read).await.unwrap();
        mgr.unlock(id.clone(), ThreadID(3)).await.unwrap();

        let calls = remote.calls();
        assert_eq!(calls.len(), 1);
        assert!(matches!(calls[0], RemoteCall::Request { .. }));
    }

    #[tokio::test]
    async fn greedy_grant_arbitrates_local_contention() {
        let (remote, mgr) = harness(true, true);
        let id = numeric(4);

        mgr.lock(id.clone(), ThreadID(1), LockLevel::Write).await.unwrap();
        let mgr2 = mgr.clone();
        let id2 = id.clone();
        let second = tokio::spawn(async move {
            mgr2.lock(id2.clone(), ThreadID(2), LockLevel::Write).await.unwrap();
            mgr2.unlock(id2, ThreadID(2)).await.unwrap();
        });
        tokio::task::yield_now().await;
        assert!(!second.is_finished());

        mgr.unlock(id.clone(), ThreadID(1)).await.unwrap();
        second.await.unwrap();
        assert_eq!(remote.calls().len(), 1);
    }

    #[tokio::test]
    async fn recall_commit_waits_for_the_local_write_hold() {
        let (remote, mgr) = harness(true, true);
        let id = numeric(5);

        mgr.lock(id.clone(), ThreadID(1), LockLevel::Write).await.unwrap();
        mgr.recalled(SessionID(1), id.clone(), ServerLockLevel::Write, 3).await.unwrap();
        assert!(!remote
            .calls()
            .iter()
            .any(|c| matches!(c, RemoteCall::RecallCommit { .. })));

        mgr.unlock(id.clone(), ThreadID(1)).await.unwrap();
        let commit = remote
            .calls()
            .into_iter()
            .find_map(|c| match c {
                RemoteCall::RecallCommit { generation, batch } => Some((generation, batch)),
                _ => None,
            })
            .expect("commit after the write hold released");
        assert_eq!(commit.0, 3);
        assert!(commit.1.contexts().is_empty());

        // The grant is gone; the next acquire goes remote again.
        mgr.lock(id.clone(), ThreadID(9), LockLevel::Write).await.unwrap();
        assert_eq!(requests(&remote.calls()), 2);
    }

    #[tokio::test]
    async fn upgrade_out_of_a_greedy_read_stays_out_of_the_recall_batch() {
        let (remote, mgr) = harness(false, false);
        let id = numeric(13);

        // Greedy read grant, then a local read hold under it.
        mgr.awarded(SessionID(1), id.clone(), ThreadID::VM, ServerLockLevel::Read, true)
            .await
            .unwrap();
        mgr.lock(id.clone(), ThreadID(1), LockLevel::Read).await.unwrap();

        // The write upgrade is not covered and goes to the server.
        let mgr2 = mgr.clone();
        let id2 = id.clone();
        let upgrade =
            tokio::spawn(async move { mgr2.lock(id2, ThreadID(1), LockLevel::Write).await });
        tokio::task::yield_now().await;
        assert_eq!(requests(&remote.calls()), 1);

        // The recall commits immediately (read holds do not defer it).
        // The batch carries the read hold but not the upgrade request
        // the server already has queued.
        mgr.recalled(SessionID(1), id.clone(), ServerLockLevel::Write, 1).await.unwrap();
        let batch = remote
            .calls()
            .into_iter()
            .find_map(|c| match c {
                RemoteCall::RecallCommit { batch, .. } => Some(batch),
                _ => None,
            })
            .expect("commit after the recall");
        let states: Vec<State> = batch.contexts().iter().map(|c| c.state).collect();
        assert_eq!(states, vec![State::HolderRead]);
        assert_eq!(requests(&remote.calls()), 1);

        mgr.awarded(SessionID(1), id.clone(), ThreadID(1), ServerLockLevel::Write, false)
            .await
            .unwrap();
        upgrade.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn wait_during_a_recall_ships_the_waiter_in_the_commit() {
        let (remote, mgr) = harness(true, true);
        let id = numeric(14);

        mgr.lock(id.clone(), ThreadID(1), LockLevel::Write).await.unwrap();
        mgr.recalled(SessionID(1), id.clone(), ServerLockLevel::Write, 7).await.unwrap();
        // Deferred behind the active write hold.
        assert!(!remote
            .calls()
            .iter()
            .any(|c| matches!(c, RemoteCall::RecallCommit { .. })));

        // Waiting releases that hold: the commit goes now and carries
        // the waiter, with no release-wait message.
        let mgr2 = mgr.clone();
        let id2 = id.clone();
        let waiting = tokio::spawn(async move {
            mgr2.wait(id2, ThreadID(1), WaitSpec::Indefinite, &NoWaitListener).await
        });
        tokio::task::yield_now().await;

        let calls = remote.calls();
        assert!(!calls.iter().any(|c| matches!(c, RemoteCall::ReleaseWait { .. })));
        let batch = calls
            .iter()
            .find_map(|c| match c {
                RemoteCall::RecallCommit { generation: 7, batch } => Some(batch.clone()),
                _ => None,
            })
            .expect("commit once the wait released the hold");
        let states: Vec<State> = batch.contexts().iter().map(|c| c.state).collect();
        assert_eq!(states, vec![State::WaiterWrite]);

        // The server takes over: notify, then re-award.
        mgr.notified(SessionID(1), id.clone(), ThreadID(1)).await.unwrap();
        mgr.awarded(SessionID(1), id.clone(), ThreadID(1), ServerLockLevel::Write, false)
            .await
            .unwrap();
        waiting.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn failed_wait_release_rolls_the_hold_back() {
        let (remote, mgr) = harness(true, false);
        let id = numeric(15);

        mgr.lock(id.clone(), ThreadID(1), LockLevel::Write).await.unwrap();
        remote.break_wait_release();
        let err = mgr
            .wait(id.clone(), ThreadID(1), WaitSpec::Indefinite, &NoWaitListener)
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Shutdown(_)));

        // The hold is intact: notify still sees the write monitor and
        // the final unlock still releases remotely.
        let notify = mgr.notify(id.clone(), ThreadID(1), false).await.unwrap();
        assert!(!notify.is_null());
        mgr.unlock(id.clone(), ThreadID(1)).await.unwrap();
        assert_eq!(releases(&remote.calls()), 1);
    }

    #[tokio::test]
    async fn wait_and_notify_stay_local_under_a_greedy_grant() {
        let (remote, mgr) = harness(true, true);
        let id = numeric(6);
        let blocked = Arc::new(AtomicBool::new(false));

        struct Flag(Arc<AtomicBool>);
        impl WaitListener for Flag {
            fn pre_block(&self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        mgr.lock(id.clone(), ThreadID(1), LockLevel::Write).await.unwrap();
        let mgr2 = mgr.clone();
        let id2 = id.clone();
        let flag = Flag(blocked.clone());
        let waiter = tokio::spawn(async move {
            mgr2.wait(id2, ThreadID(1), WaitSpec::Indefinite, &flag).await.unwrap();
        });
        tokio::task::yield_now().await;
        assert!(blocked.load(Ordering::SeqCst));

        // The wait released the lock for the second thread.
        mgr.lock(id.clone(), ThreadID(2), LockLevel::Write).await.unwrap();
        let notify = mgr.notify(id.clone(), ThreadID(2), false).await.unwrap();
        assert!(notify.is_null());
        assert!(!waiter.is_finished());

        mgr.unlock(id.clone(), ThreadID(2)).await.unwrap();
        waiter.await.unwrap();
        // One initial request, nothing else crossed the wire.
        assert_eq!(remote.calls().len(), 1);
    }

    #[tokio::test]
    async fn non_greedy_notify_is_handed_to_the_flush() {
        let (_remote, mgr) = harness(true, false);
        let id = numeric(7);

        mgr.lock(id.clone(), ThreadID(1), LockLevel::Write).await.unwrap();
        let notify = mgr.notify(id.clone(), ThreadID(1), true).await.unwrap();
        assert_eq!(notify, Notify::new(id.clone(), ThreadID(1), true));

        let err = mgr.notify(id, ThreadID(2), false).await.unwrap_err();
        assert!(matches!(err, LockError::IllegalMonitorState(_)));
    }

    #[tokio::test]
    async fn wait_without_the_write_hold_is_illegal() {
        let (_remote, mgr) = harness(true, false);
        let id = numeric(8);

        mgr.lock(id.clone(), ThreadID(1), LockLevel::Read).await.unwrap();
        let err = mgr
            .wait(id, ThreadID(1), WaitSpec::Indefinite, &NoWaitListener)
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::IllegalMonitorState(_)));
    }

    #[tokio::test]
    async fn try_lock_resolves_false_on_refusal() {
        let (remote, mgr) = harness(false, false);
        let id = numeric(9);

        let mgr2 = mgr.clone();
        let id2 = id.clone();
        let attempt =
            tokio::spawn(async move { mgr2.try_lock(id2, ThreadID(1), LockLevel::Write, None).await });
        tokio::task::yield_now().await;
        assert!(matches!(
            remote.calls().as_slice(),
            [RemoteCall::TryRequest { .. }]
        ));

        mgr.cannot_award(SessionID(1), id, ThreadID(1)).await.unwrap();
        assert!(!attempt.await.unwrap().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_try_lock_releases_a_crossing_award() {
        let (remote, mgr) = harness(false, false);
        let id = numeric(10);

        let mgr2 = mgr.clone();
        let id2 = id.clone();
        let attempt = tokio::spawn(async move {
            mgr2.try_lock(id2, ThreadID(1), LockLevel::Write, Some(Duration::from_millis(50)))
                .await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!attempt.await.unwrap().unwrap());

        // The award arrives after the local deadline withdrew the try.
        mgr.awarded(SessionID(1), id, ThreadID(1), ServerLockLevel::Write, false)
            .await
            .unwrap();
        assert_eq!(releases(&remote.calls()), 1);
    }

    #[tokio::test]
    async fn stale_session_messages_are_dropped() {
        let (_remote, mgr) = harness(false, false);
        let id = numeric(11);

        let mgr2 = mgr.clone();
        let id2 = id.clone();
        let pending =
            tokio::spawn(async move { mgr2.lock(id2, ThreadID(1), LockLevel::Write).await });
        tokio::task::yield_now().await;

        mgr.awarded(SessionID(99), id.clone(), ThreadID(1), ServerLockLevel::Write, false)
            .await
            .unwrap();
        tokio::task::yield_now().await;
        assert!(!pending.is_finished());

        mgr.awarded(SessionID(1), id, ThreadID(1), ServerLockLevel::Write, false)
            .await
            .unwrap();
        pending.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn award_with_no_pending_request_is_a_violation() {
        let (_remote, mgr) = harness(false, false);
        let err = mgr
            .awarded(SessionID(1), numeric(12), ThreadID(1), ServerLockLevel::Write, false)
            .await
            .unwrap_err();
        assert!(err.is_protocol_violation());
    }

    #[tokio::test]
    async fn pause_gates_callers_and_unpause_releases_them_in_order() {
        let (remote, mgr) = harness(false, false);
        mgr.pause().await;
        assert_eq!(mgr.run_state().await, RunState::Paused);

        let mgr2 = mgr.clone();
        let first =
            tokio::spawn(async move { mgr2.lock(numeric(20), ThreadID(1), LockLevel::Write).await });
        tokio::task::yield_now().await;
        let mgr3 = mgr.clone();
        let second =
            tokio::spawn(async move { mgr3.lock(numeric(21), ThreadID(2), LockLevel::Write).await });
        tokio::task::yield_now().await;
        assert!(remote.calls().is_empty());

        mgr.unpause().await;
        tokio::task::yield_now().await;
        let calls = remote.calls();
        match calls.as_slice() {
            [RemoteCall::Request { lock: a, .. }, RemoteCall::Request { lock: b, .. }] => {
                assert_eq!(*a, numeric(20));
                assert_eq!(*b, numeric(21));
            }
            other => panic!("expected two requests in arrival order, got {:?}", other),
        }

        mgr.awarded(SessionID(1), numeric(20), ThreadID(1), ServerLockLevel::Write, false)
            .await
            .unwrap();
        mgr.awarded(SessionID(1), numeric(21), ThreadID(2), ServerLockLevel::Write, false)
            .await
            .unwrap();
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn snapshots_partition_holds_waiters_and_pendings() {
        let (remote, mgr) = harness(false, false);
        let id = numeric(30);

        // t1 holds, t2 waits, t3 is pending.
        let mgr2 = mgr.clone();
        let id2 = id.clone();
        let l1 = tokio::spawn(async move { mgr2.lock(id2, ThreadID(1), LockLevel::Write).await });
        tokio::task::yield_now().await;
        mgr.awarded(SessionID(1), id.clone(), ThreadID(1), ServerLockLevel::Write, false)
            .await
            .unwrap();
        l1.await.unwrap().unwrap();

        let mgr3 = mgr.clone();
        let id3 = id.clone();
        let w2 = tokio::spawn(async move { mgr3.lock(id3, ThreadID(2), LockLevel::Write).await });
        tokio::task::yield_now().await;

        let mut held = Vec::new();
        let mut waiting = Vec::new();
        let mut pending = Vec::new();
        mgr.add_all_held_locks_to(&mut held).await;
        mgr.add_all_waiters_to(&mut waiting).await;
        mgr.add_all_pending_lock_requests_to(&mut pending).await;
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].state, State::HolderWrite);
        assert!(waiting.is_empty());
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].state, State::PendingWrite);

        // Reconnect: the pending request is replayed under the session.
        mgr.pause().await;
        mgr.starting().await;
        mgr.resend_pending(SessionID(2)).await.unwrap();
        mgr.unpause().await;
        assert_eq!(requests(&remote.calls()), 3);

        mgr.awarded(SessionID(2), id, ThreadID(2), ServerLockLevel::Write, false)
            .await
            .unwrap();
        w2.await.unwrap().unwrap();
    }
}
