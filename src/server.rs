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

//! Authoritative server-side lock table.
//!
//! ## Purpose
//! [`ServerLockManager`] owns one ordered queue per [`LockID`]: holders
//! first, then pending and try-pending requests in arrival order, then
//! waiters. Grants are FIFO with two deliberate exceptions: consecutive
//! read requests are granted together, and a pending upgrade (a write
//! request from a thread that already holds read) is granted ahead of the
//! queue as soon as its holder is the only one left.
//!
//! ## Design Decisions
//! - Per-lock mutation is serialized by a per-lock `tokio::sync::Mutex`;
//!   distinct locks proceed in parallel under a shared `RwLock` map.
//! - Responses are pushed to each client's [`LockResponseSink`] while the
//!   per-lock mutex is held, so a client observes its responses for one
//!   lock in the order the server decided them.
//! - Greedy recalls carry a generation counter. A recall commit whose
//!   generation does not match the current recall is stale and dropped,
//!   so a commit can never be bound to a recall issued after it was sent.
//! - Two threads that both hold read and both request the upgrade to
//!   write deadlock each other. The original monitor semantics have the
//!   same hole; detecting it server-side is future work.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify as TokioNotify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::LockManagerConfig;
use crate::error::{LockError, LockResult};
use crate::ids::{ClientID, LockID, SessionID, ThreadID};
use crate::level::ServerLockLevel;
use crate::remote::{LockResponseSink, WaitSpec};
use crate::state::{can_transition, ContextType, State};
use crate::wire::{ClientServerExchangeLockContext, RecallBatchContext};

/// One (client, thread) participant in a lock's queue.
#[derive(Debug)]
pub struct ServerLockContext {
    pub client: ClientID,
    pub thread: ThreadID,
    pub state: State,
    /// Remaining budget for try-pending requests and timed waiters,
    /// carried into snapshots. `None` for holders and plain pendings.
    pub timeout_millis: Option<i64>,
}

impl ServerLockContext {
    fn new(client: ClientID, thread: ThreadID, state: State) -> ServerLockContext {
        ServerLockContext { client, thread, state, timeout_millis: None }
    }

    fn transition(&mut self, new: State) {
        assert!(
            can_transition(Some(self.state), new),
            "illegal lock context transition {:?} -> {:?} for {}/{}",
            self.state,
            new,
            self.client,
            self.thread
        );
        self.state = new;
    }
}

struct ServerLock {
    id: LockID,
    contexts: VecDeque<ServerLockContext>,
    recalled: bool,
    recall_generation: u64,
    recall_outstanding: HashSet<ClientID>,
    recall_done: Arc<TokioNotify>,
    timers: HashMap<(ClientID, ThreadID), JoinHandle<()>>,
}

impl ServerLock {
    fn new(id: LockID) -> ServerLock {
        ServerLock {
            id,
            contexts: VecDeque::new(),
            recalled: false,
            recall_generation: 0,
            recall_outstanding: HashSet::new(),
            recall_done: Arc::new(TokioNotify::new()),
            timers: HashMap::new(),
        }
    }

    fn is_clear(&self) -> bool {
        self.contexts.is_empty() && self.timers.is_empty() && !self.recalled
    }

    fn holders(&self) -> impl Iterator<Item = &ServerLockContext> {
        self.contexts.iter().filter(|c| c.state.is_holder())
    }

    fn holder_index(&self, client: ClientID, thread: ThreadID) -> Option<usize> {
        self.contexts.iter().position(|c| {
            c.state.kind() == ContextType::Holder && c.client == client && c.thread == thread
        })
    }

    fn queued_index(&self, client: ClientID, thread: ThreadID) -> Option<usize> {
        self.contexts.iter().position(|c| {
            c.state.is_queued() && c.client == client && c.thread == thread
        })
    }

    fn waiter_index(&self, client: ClientID, thread: ThreadID) -> Option<usize> {
        self.contexts.iter().position(|c| {
            c.state.kind() == ContextType::Waiter && c.client == client && c.thread == thread
        })
    }

    fn first_queued_index(&self) -> Option<usize> {
        self.contexts.iter().position(|c| c.state.is_queued())
    }

    /// First queued write request whose thread already holds read.
    fn upgrade_index(&self) -> Option<usize> {
        self.contexts.iter().position(|c| {
            c.state.is_queued()
                && c.state.level() == ServerLockLevel::Write
                && self
                    .holder_index(c.client, c.thread)
                    .map(|h| self.contexts[h].state.level() == ServerLockLevel::Read)
                    .unwrap_or(false)
        })
    }

    fn greedy_level_of(&self, client: ClientID) -> Option<ServerLockLevel> {
        self.contexts
            .iter()
            .find(|c| c.state.kind() == ContextType::GreedyHolder && c.client == client)
            .map(|c| c.state.level())
    }

    fn greedy_clients(&self) -> Vec<ClientID> {
        self.contexts
            .iter()
            .filter(|c| c.state.kind() == ContextType::GreedyHolder)
            .map(|c| c.client)
            .collect()
    }

    /// Read conflicts only with a write holder; write conflicts with any
    /// holder. The requester's own holder context is excluded so an
    /// upgrade is not blocked by the read hold it is upgrading.
    fn has_conflicting_holder(
        &self,
        level: ServerLockLevel,
        exclude: Option<(ClientID, ThreadID)>,
    ) -> bool {
        self.holders().any(|h| {
            if exclude == Some((h.client, h.thread)) {
                return false;
            }
            match level {
                ServerLockLevel::Read => h.state.level() == ServerLockLevel::Write,
                ServerLockLevel::Write => true,
            }
        })
    }

    fn has_conflicting_greedy_holder(&self, level: ServerLockLevel) -> bool {
        self.contexts
            .iter()
            .filter(|c| c.state.kind() == ContextType::GreedyHolder)
            .any(|h| match level {
                ServerLockLevel::Read => h.state.level() == ServerLockLevel::Write,
                ServerLockLevel::Write => true,
            })
    }

    fn has_waiters(&self) -> bool {
        self.contexts.iter().any(|c| c.state.kind() == ContextType::Waiter)
    }

    fn has_queued_write(&self) -> bool {
        self.contexts
            .iter()
            .any(|c| c.state.is_queued() && c.state.level() == ServerLockLevel::Write)
    }

    fn insert_holder(&mut self, ctx: ServerLockContext) {
        self.contexts.push_front(ctx);
    }

    /// Queued requests keep arrival order and always sit before waiters.
    fn insert_queued(&mut self, ctx: ServerLockContext) {
        let at = self
            .contexts
            .iter()
            .position(|c| c.state.kind() == ContextType::Waiter)
            .unwrap_or(self.contexts.len());
        self.contexts.insert(at, ctx);
    }

    fn insert_waiter(&mut self, ctx: ServerLockContext) {
        self.contexts.push_back(ctx);
    }

    fn cancel_timer(&mut self, client: ClientID, thread: ThreadID) {
        if let Some(handle) = self.timers.remove(&(client, thread)) {
            handle.abort();
        }
    }
}

struct ClientHandle {
    session: SessionID,
    sink: Arc<dyn LockResponseSink>,
}

/// The cluster-wide lock authority.
pub struct ServerLockManager {
    locks: RwLock<HashMap<LockID, Arc<Mutex<ServerLock>>>>,
    clients: RwLock<HashMap<ClientID, ClientHandle>>,
    config: LockManagerConfig,
}

impl ServerLockManager {
    pub fn new(config: LockManagerConfig) -> Arc<ServerLockManager> {
        Arc::new(ServerLockManager {
            locks: RwLock::new(HashMap::new()),
            clients: RwLock::new(HashMap::new()),
            config,
        })
    }

    /// Register (or re-register after reconnect) a client's response
    /// channel and the session its responses will be stamped with.
    pub async fn connect_client(
        &self,
        client: ClientID,
        session: SessionID,
        sink: Arc<dyn LockResponseSink>,
    ) {
        debug!(client = %client, session = %session, "client connected");
        self.clients
            .write()
            .await
            .insert(client, ClientHandle { session, sink });
    }

    async fn handle_of(&self, client: ClientID) -> Option<(SessionID, Arc<dyn LockResponseSink>)> {
        self.clients
            .read()
            .await
            .get(&client)
            .map(|h| (h.session, h.sink.clone()))
    }

    async fn entry(&self, id: &LockID) -> Arc<Mutex<ServerLock>> {
        if let Some(existing) = self.locks.read().await.get(id) {
            return existing.clone();
        }
        let mut map = self.locks.write().await;
        map.entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(ServerLock::new(id.clone()))))
            .clone()
    }

    async fn existing(&self, id: &LockID) -> LockResult<Arc<Mutex<ServerLock>>> {
        self.locks
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| LockError::NotFound(id.to_string()))
    }

    /// Drop the lock's table entry once nothing references it.
    async fn gc_if_clear(&self, id: &LockID) {
        let mut map = self.locks.write().await;
        if let Some(entry) = map.get(id) {
            if entry.lock().await.is_clear() {
                map.remove(id);
            }
        }
    }

    /// Queue a lock request. An award (possibly greedy) comes back
    /// through the client's sink once the grant rules allow it.
    pub async fn lock(
        self: &Arc<Self>,
        id: LockID,
        client: ClientID,
        thread: ThreadID,
        level: ServerLockLevel,
    ) -> LockResult<()> {
        let entry = self.entry(&id).await;
        let mut lk = entry.lock().await;
        if let Some(greedy) = lk.greedy_level_of(client) {
            if greedy == ServerLockLevel::Write || level == ServerLockLevel::Read {
                debug!(lock = %id, client = %client, thread = %thread,
                       "request already covered by greedy grant, ignoring");
                return Ok(());
            }
        }
        if let Some(h) = lk.holder_index(client, thread) {
            let held = lk.contexts[h].state.level();
            let upgrade = held == ServerLockLevel::Read && level == ServerLockLevel::Write;
            if !upgrade {
                drop(lk);
                self.gc_if_clear(&id).await;
                return Err(LockError::ProtocolViolation(format!(
                    "{}/{} requested {} on {} while already holding {}",
                    client, thread, level, id, held
                )));
            }
        }
        if lk.queued_index(client, thread).is_some() {
            drop(lk);
            self.gc_if_clear(&id).await;
            return Err(LockError::ProtocolViolation(format!(
                "{}/{} already has an outstanding request on {}",
                client, thread, id
            )));
        }
        lk.insert_queued(ServerLockContext::new(
            client,
            thread,
            State::of(ContextType::Pending, level),
        ));
        self.process(&mut lk).await;
        Ok(())
    }

    /// Queue a non-blocking request. Without a timeout an ungrantable
    /// request fails immediately with `cannot_award`; with one, a server
    /// timer converts the still-queued request when it expires.
    pub async fn try_lock(
        self: &Arc<Self>,
        id: LockID,
        client: ClientID,
        thread: ThreadID,
        level: ServerLockLevel,
        timeout: Option<Duration>,
    ) -> LockResult<()> {
        let entry = self.entry(&id).await;
        let mut lk = entry.lock().await;
        if let Some(greedy) = lk.greedy_level_of(client) {
            if greedy == ServerLockLevel::Write || level == ServerLockLevel::Read {
                return Ok(());
            }
        }
        if lk.queued_index(client, thread).is_some() {
            drop(lk);
            self.gc_if_clear(&id).await;
            return Err(LockError::ProtocolViolation(format!(
                "{}/{} already has an outstanding request on {}",
                client, thread, id
            )));
        }
        let mut ctx =
            ServerLockContext::new(client, thread, State::of(ContextType::TryPending, level));
        ctx.timeout_millis = Some(timeout.map(|d| d.as_millis() as i64).unwrap_or(0));
        lk.insert_queued(ctx);
        self.process(&mut lk).await;
        if lk.queued_index(client, thread).is_some() {
            match timeout {
                None => {
                    let at = lk.queued_index(client, thread).unwrap();
                    let _ = lk.contexts.remove(at);
                    self.send_cannot_award(&lk.id, client, thread, level).await;
                }
                Some(d) => self.schedule_try_timeout(&mut lk, client, thread, d),
            }
        }
        drop(lk);
        self.gc_if_clear(&id).await;
        Ok(())
    }

    /// Release the (client, thread) hold and re-run grant processing.
    pub async fn unlock(
        self: &Arc<Self>,
        id: LockID,
        client: ClientID,
        thread: ThreadID,
    ) -> LockResult<()> {
        let entry = self.existing(&id).await?;
        let mut lk = entry.lock().await;
        let Some(at) = lk.holder_index(client, thread) else {
            return Err(LockError::ProtocolViolation(format!(
                "{}/{} released {} without holding it",
                client, thread, id
            )));
        };
        let _ = lk.contexts.remove(at);
        self.process(&mut lk).await;
        drop(lk);
        self.gc_if_clear(&id).await;
        Ok(())
    }

    /// Move the sole write holder into the wait set, releasing the lock.
    pub async fn wait(
        self: &Arc<Self>,
        id: LockID,
        client: ClientID,
        thread: ThreadID,
        wait: WaitSpec,
    ) -> LockResult<()> {
        let entry = self.existing(&id).await?;
        let mut lk = entry.lock().await;
        let Some(at) = lk.holder_index(client, thread) else {
            return Err(LockError::IllegalMonitorState(format!(
                "{}/{} waited on {} without holding it",
                client, thread, id
            )));
        };
        if lk.contexts[at].state.level() != ServerLockLevel::Write
            || lk.holders().count() != 1
        {
            return Err(LockError::IllegalMonitorState(format!(
                "{}/{} waited on {} without the exclusive write hold",
                client, thread, id
            )));
        }
        let mut ctx = lk.contexts.remove(at).unwrap();
        ctx.transition(State::WaiterWrite);
        ctx.timeout_millis = Some(wait.as_millis());
        lk.insert_waiter(ctx);
        if let WaitSpec::Timeout(d) = wait {
            self.schedule_wait_timeout(&mut lk, client, thread, d);
        }
        self.process(&mut lk).await;
        Ok(())
    }

    /// Wake one (or all) waiters into the pending queue. Returns the
    /// (client, thread) pairs that were notified.
    pub async fn notify(
        self: &Arc<Self>,
        id: LockID,
        client: ClientID,
        thread: ThreadID,
        all: bool,
    ) -> LockResult<Vec<(ClientID, ThreadID)>> {
        let entry = self.existing(&id).await?;
        let mut lk = entry.lock().await;
        let holds_write = lk
            .holder_index(client, thread)
            .map(|h| lk.contexts[h].state.level() == ServerLockLevel::Write)
            .unwrap_or(false);
        if !holds_write {
            return Err(LockError::IllegalMonitorState(format!(
                "{}/{} notified {} without the write hold",
                client, thread, id
            )));
        }
        let mut woken = Vec::new();
        loop {
            let Some(at) = lk
                .contexts
                .iter()
                .position(|c| c.state.kind() == ContextType::Waiter)
            else {
                break;
            };
            let mut ctx = lk.contexts.remove(at).unwrap();
            lk.cancel_timer(ctx.client, ctx.thread);
            let level = ctx.state.level();
            ctx.transition(State::of(ContextType::Pending, level));
            ctx.timeout_millis = None;
            woken.push((ctx.client, ctx.thread));
            lk.insert_queued(ctx);
            if !all {
                break;
            }
        }
        for (woken_client, woken_thread) in &woken {
            if let Some((session, sink)) = self.handle_of(*woken_client).await {
                sink.notified(session, id.clone(), *woken_thread).await;
            }
        }
        self.process(&mut lk).await;
        Ok(woken)
    }

    /// Break a waiter out of the wait set without a notify. The thread
    /// re-acquires through the pending queue like a notified waiter.
    pub async fn interrupt(
        self: &Arc<Self>,
        id: LockID,
        client: ClientID,
        thread: ThreadID,
    ) -> LockResult<()> {
        let entry = self.existing(&id).await?;
        let mut lk = entry.lock().await;
        let Some(at) = lk.waiter_index(client, thread) else {
            warn!(lock = %id, client = %client, thread = %thread,
                  "interrupt for unknown waiter, ignoring");
            return Ok(());
        };
        lk.cancel_timer(client, thread);
        let mut ctx = lk.contexts.remove(at).unwrap();
        let level = ctx.state.level();
        ctx.transition(State::of(ContextType::Pending, level));
        ctx.timeout_millis = None;
        lk.insert_queued(ctx);
        self.process(&mut lk).await;
        Ok(())
    }

    /// Apply a greedy holder's answer to a recall: retire the greedy
    /// grant and re-admit the real participants the client was covering.
    pub async fn recall_commit(
        self: &Arc<Self>,
        client: ClientID,
        generation: u64,
        batch: RecallBatchContext,
    ) -> LockResult<()> {
        let id = batch.lock_id().clone();
        let entry = self.existing(&id).await?;
        let mut lk = entry.lock().await;
        if generation != lk.recall_generation || !lk.recall_outstanding.contains(&client) {
            warn!(lock = %id, client = %client, generation,
                  current = lk.recall_generation, "stale recall commit, dropping");
            return Ok(());
        }
        let greedy_at = lk
            .contexts
            .iter()
            .position(|c| c.state.kind() == ContextType::GreedyHolder && c.client == client)
            .ok_or_else(|| {
                LockError::ProtocolViolation(format!(
                    "recall commit from {} for {} without a greedy grant",
                    client, id
                ))
            })?;
        let greedy_level = lk.contexts[greedy_at].state.level();
        let _ = lk.contexts.remove(greedy_at);

        for ctx in batch.contexts() {
            if ctx.node_id != client {
                return Err(LockError::ProtocolViolation(format!(
                    "recall commit from {} carries context for {}",
                    client, ctx.node_id
                )));
            }
            match ctx.state.kind() {
                ContextType::Holder => {
                    assert!(
                        greedy_level == ServerLockLevel::Write
                            || ctx.state.level() == ServerLockLevel::Read,
                        "write hold {}/{} committed under a read-level greedy grant on {}",
                        ctx.node_id,
                        ctx.thread_id,
                        id
                    );
                    lk.insert_holder(ServerLockContext::new(
                        ctx.node_id,
                        ctx.thread_id,
                        ctx.state,
                    ));
                }
                ContextType::Waiter => {
                    let mut re = ServerLockContext::new(ctx.node_id, ctx.thread_id, ctx.state);
                    re.timeout_millis = ctx.timeout_millis;
                    lk.insert_waiter(re);
                    if let Some(millis) = ctx.timeout_millis {
                        if let WaitSpec::Timeout(d) = WaitSpec::from_millis(millis) {
                            self.schedule_wait_timeout(&mut lk, ctx.node_id, ctx.thread_id, d);
                        }
                    }
                }
                ContextType::Pending | ContextType::TryPending => {
                    if lk.queued_index(ctx.node_id, ctx.thread_id).is_some() {
                        // Already queued from a request sent before the
                        // recall; admitting it again would award twice.
                        warn!(lock = %id, client = %ctx.node_id, thread = %ctx.thread_id,
                              "recall commit repeats a queued request, dropping the duplicate");
                        continue;
                    }
                    let mut re = ServerLockContext::new(ctx.node_id, ctx.thread_id, ctx.state);
                    re.timeout_millis = ctx.timeout_millis;
                    lk.insert_queued(re);
                }
                ContextType::GreedyHolder => {
                    return Err(LockError::ProtocolViolation(format!(
                        "recall commit from {} re-asserts a greedy grant on {}",
                        client, id
                    )));
                }
            }
        }

        lk.recall_outstanding.remove(&client);
        if lk.recall_outstanding.is_empty() {
            lk.recalled = false;
            lk.recall_done.notify_waiters();
        }
        self.process(&mut lk).await;
        drop(lk);
        self.gc_if_clear(&id).await;
        Ok(())
    }

    /// Recall every greedy grant on `id`, returning immediately.
    pub async fn recall_locks(self: &Arc<Self>, id: &LockID) {
        let Ok(entry) = self.existing(id).await else {
            return;
        };
        let mut lk = entry.lock().await;
        if !lk.recalled && !lk.greedy_clients().is_empty() {
            self.issue_recall(&mut lk, ServerLockLevel::Write).await;
        }
    }

    /// Recall every greedy grant on `id` and wait until the last greedy
    /// holder has committed.
    pub async fn recall_locks_inline(self: &Arc<Self>, id: &LockID) {
        let Ok(entry) = self.existing(id).await else {
            return;
        };
        let mut lk = entry.lock().await;
        if !lk.recalled && !lk.greedy_clients().is_empty() {
            self.issue_recall(&mut lk, ServerLockLevel::Write).await;
        }
        if !lk.recalled {
            return;
        }
        let done = lk.recall_done.clone();
        let notified = done.notified();
        tokio::pin!(notified);
        // Register for the wakeup before the per-lock mutex drops so a
        // commit landing in between is not missed.
        notified.as_mut().enable();
        drop(lk);
        notified.await;
    }

    /// Forget everything a disconnected client contributed: holds,
    /// queued requests, waiters, greedy grants, timers.
    pub async fn clear_client_state(self: &Arc<Self>, client: ClientID) {
        debug!(client = %client, "clearing lock state for disconnected client");
        self.clients.write().await.remove(&client);
        let entries: Vec<(LockID, Arc<Mutex<ServerLock>>)> = self
            .locks
            .read()
            .await
            .iter()
            .map(|(id, e)| (id.clone(), e.clone()))
            .collect();
        for (id, entry) in entries {
            let mut lk = entry.lock().await;
            let before = lk.contexts.len();
            let keys: Vec<(ClientID, ThreadID)> = lk
                .timers
                .keys()
                .filter(|(c, _)| *c == client)
                .copied()
                .collect();
            for (c, t) in keys {
                lk.cancel_timer(c, t);
            }
            lk.contexts.retain(|c| c.client != client);
            if lk.recall_outstanding.remove(&client) && lk.recall_outstanding.is_empty() {
                lk.recalled = false;
                lk.recall_done.notify_waiters();
            }
            if lk.contexts.len() != before {
                self.process(&mut lk).await;
            }
            drop(lk);
            self.gc_if_clear(&id).await;
        }
    }

    /// Rebuild holder and waiter state from a reconnecting client's
    /// report. Pending requests are resent as fresh requests instead.
    pub async fn reestablish(
        self: &Arc<Self>,
        client: ClientID,
        contexts: Vec<ClientServerExchangeLockContext>,
    ) -> LockResult<()> {
        let mut touched = Vec::new();
        for ctx in contexts {
            if ctx.node_id != client {
                return Err(LockError::ProtocolViolation(format!(
                    "reestablish from {} carries context for {}",
                    client, ctx.node_id
                )));
            }
            let entry = self.entry(&ctx.lock_id).await;
            let mut lk = entry.lock().await;
            match ctx.state.kind() {
                ContextType::Holder | ContextType::GreedyHolder => {
                    let conflicting = lk.holders().any(|h| {
                        h.client != client
                            && (h.state.level() == ServerLockLevel::Write
                                || ctx.state.level() == ServerLockLevel::Write)
                    });
                    if conflicting {
                        return Err(LockError::ProtocolViolation(format!(
                            "reestablished hold on {} conflicts with an existing holder",
                            ctx.lock_id
                        )));
                    }
                    lk.insert_holder(ServerLockContext::new(client, ctx.thread_id, ctx.state));
                }
                ContextType::Waiter => {
                    let mut re = ServerLockContext::new(client, ctx.thread_id, ctx.state);
                    re.timeout_millis = ctx.timeout_millis;
                    lk.insert_waiter(re);
                    if let Some(millis) = ctx.timeout_millis {
                        if let WaitSpec::Timeout(d) = WaitSpec::from_millis(millis) {
                            self.schedule_wait_timeout(&mut lk, client, ctx.thread_id, d);
                        }
                    }
                }
                ContextType::Pending | ContextType::TryPending => {
                    drop(lk);
                    self.gc_if_clear(&ctx.lock_id).await;
                    return Err(LockError::ProtocolViolation(format!(
                        "pending request on {} in a reestablish report",
                        ctx.lock_id
                    )));
                }
            }
            touched.push((ctx.lock_id.clone(), entry.clone()));
        }
        for (_, entry) in &touched {
            let mut lk = entry.lock().await;
            self.process(&mut lk).await;
        }
        Ok(())
    }

    // Introspection, used by tests and the admin surface.

    /// Number of live entries in the lock table.
    pub async fn lock_count(&self) -> usize {
        self.locks.read().await.len()
    }

    pub async fn holder_count(&self, id: &LockID) -> usize {
        match self.existing(id).await {
            Ok(entry) => entry.lock().await.holders().count(),
            Err(_) => 0,
        }
    }

    pub async fn pending_count(&self, id: &LockID) -> usize {
        match self.existing(id).await {
            Ok(entry) => {
                let lk = entry.lock().await;
                lk.contexts.iter().filter(|c| c.state.is_queued()).count()
            }
            Err(_) => 0,
        }
    }

    pub async fn waiter_count(&self, id: &LockID) -> usize {
        match self.existing(id).await {
            Ok(entry) => {
                let lk = entry.lock().await;
                lk.contexts
                    .iter()
                    .filter(|c| c.state.kind() == ContextType::Waiter)
                    .count()
            }
            Err(_) => 0,
        }
    }

    pub async fn has_greedy_holders(&self, id: &LockID) -> bool {
        match self.existing(id).await {
            Ok(entry) => !entry.lock().await.greedy_clients().is_empty(),
            Err(_) => false,
        }
    }

    /// The server's authoritative view of every participant on `id`.
    pub async fn snapshot(&self, id: &LockID) -> Vec<ClientServerExchangeLockContext> {
        match self.existing(id).await {
            Ok(entry) => {
                let lk = entry.lock().await;
                lk.contexts
                    .iter()
                    .map(|c| {
                        let mut ctx = ClientServerExchangeLockContext::new(
                            id.clone(),
                            c.client,
                            c.thread,
                            c.state,
                        );
                        ctx.timeout_millis = c.timeout_millis;
                        ctx
                    })
                    .collect()
            }
            Err(_) => Vec::new(),
        }
    }

    // Grant processing.

    async fn process(self: &Arc<Self>, lk: &mut ServerLock) {
        loop {
            if let Some(at) = lk.upgrade_index() {
                let (client, thread) = (lk.contexts[at].client, lk.contexts[at].thread);
                if !lk.has_conflicting_holder(ServerLockLevel::Write, Some((client, thread)))
                    && !lk.has_conflicting_greedy_holder(ServerLockLevel::Write)
                {
                    self.award(lk, at).await;
                    continue;
                }
            }
            let Some(at) = lk.first_queued_index() else {
                break;
            };
            let (client, thread, level) = {
                let ctx = &lk.contexts[at];
                (ctx.client, ctx.thread, ctx.state.level())
            };
            let blocked = lk.has_conflicting_holder(level, Some((client, thread)));
            if blocked {
                if self.config.policy.is_greedy()
                    && !lk.recalled
                    && lk.has_conflicting_greedy_holder(level)
                {
                    self.issue_recall(lk, level).await;
                }
                break;
            }
            if self.config.policy.is_greedy()
                && !lk.recalled
                && self.can_award_greedily(lk, client, level)
            {
                self.award_greedy(lk, client, level).await;
            } else {
                self.award(lk, at).await;
            }
        }
    }

    /// A write goes greedy only when every queued request belongs to the
    /// same client and nobody waits; a read only when no write is queued.
    /// A client with plain holds on the lock never goes greedy, its
    /// recall batch could not represent them.
    fn can_award_greedily(
        &self,
        lk: &ServerLock,
        client: ClientID,
        level: ServerLockLevel,
    ) -> bool {
        if lk.holders().any(|h| h.client == client) {
            return false;
        }
        match level {
            ServerLockLevel::Write => {
                lk.contexts
                    .iter()
                    .filter(|c| c.state.is_queued())
                    .all(|c| c.client == client)
                    && !lk.has_waiters()
            }
            ServerLockLevel::Read => !lk.has_queued_write(),
        }
    }

    async fn award(self: &Arc<Self>, lk: &mut ServerLock, at: usize) {
        let mut ctx = lk.contexts.remove(at).unwrap();
        let level = ctx.state.level();
        lk.cancel_timer(ctx.client, ctx.thread);
        // An upgrade consumes the read hold it grew out of.
        if let Some(h) = lk.holder_index(ctx.client, ctx.thread) {
            let _ = lk.contexts.remove(h);
        }
        ctx.transition(State::of(ContextType::Holder, level));
        ctx.timeout_millis = None;
        let (client, thread) = (ctx.client, ctx.thread);
        lk.insert_holder(ctx);
        debug!(lock = %lk.id, client = %client, thread = %thread, level = %level, "awarded");
        if let Some((session, sink)) = self.handle_of(client).await {
            sink.award_lock(session, lk.id.clone(), thread, level, false).await;
        }
    }

    async fn award_greedy(self: &Arc<Self>, lk: &mut ServerLock, client: ClientID, level: ServerLockLevel) {
        // The client satisfies its own queued threads locally.
        let dropped: Vec<(ClientID, ThreadID)> = lk
            .contexts
            .iter()
            .filter(|c| c.state.is_queued() && c.client == client)
            .map(|c| (c.client, c.thread))
            .collect();
        for (c, t) in &dropped {
            lk.cancel_timer(*c, *t);
        }
        lk.contexts.retain(|c| !(c.state.is_queued() && c.client == client));
        lk.insert_holder(ServerLockContext::new(
            client,
            ThreadID::VM,
            State::of(ContextType::GreedyHolder, level),
        ));
        debug!(lock = %lk.id, client = %client, level = %level, "awarded greedily");
        if let Some((session, sink)) = self.handle_of(client).await {
            sink.award_lock(session, lk.id.clone(), ThreadID::VM, level, true).await;
        }
    }

    async fn issue_recall(self: &Arc<Self>, lk: &mut ServerLock, level: ServerLockLevel) {
        lk.recall_generation += 1;
        lk.recalled = true;
        lk.recall_outstanding = lk.greedy_clients().into_iter().collect();
        let generation = lk.recall_generation;
        debug!(lock = %lk.id, generation, level = %level, "recalling greedy grants");
        for client in lk.greedy_clients() {
            if let Some((session, sink)) = self.handle_of(client).await {
                sink.recall(session, lk.id.clone(), level, generation).await;
            }
        }
    }

    async fn send_cannot_award(
        &self,
        id: &LockID,
        client: ClientID,
        thread: ThreadID,
        level: ServerLockLevel,
    ) {
        if let Some((session, sink)) = self.handle_of(client).await {
            sink.cannot_award(session, id.clone(), thread, level).await;
        }
    }

    // Timers.

    fn schedule_try_timeout(
        self: &Arc<Self>,
        lk: &mut ServerLock,
        client: ClientID,
        thread: ThreadID,
        timeout: Duration,
    ) {
        let delay = timeout.max(self.config.timer_resolution);
        let weak = Arc::downgrade(self);
        let id = lk.id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(mgr) = weak.upgrade() {
                mgr.on_try_timeout(id, client, thread).await;
            }
        });
        lk.timers.insert((client, thread), handle);
    }

    fn schedule_wait_timeout(
        self: &Arc<Self>,
        lk: &mut ServerLock,
        client: ClientID,
        thread: ThreadID,
        timeout: Duration,
    ) {
        let delay = timeout.max(self.config.timer_resolution);
        let weak = Arc::downgrade(self);
        let id = lk.id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(mgr) = weak.upgrade() {
                mgr.on_wait_timeout(id, client, thread).await;
            }
        });
        lk.timers.insert((client, thread), handle);
    }

    async fn on_try_timeout(self: Arc<Self>, id: LockID, client: ClientID, thread: ThreadID) {
        let Ok(entry) = self.existing(&id).await else {
            return;
        };
        let mut lk = entry.lock().await;
        lk.timers.remove(&(client, thread));
        // The timer may race a grant; only a still-queued try counts.
        let Some(at) = lk.queued_index(client, thread) else {
            return;
        };
        if lk.contexts[at].state.kind() != ContextType::TryPending {
            return;
        }
        let level = lk.contexts[at].state.level();
        let _ = lk.contexts.remove(at);
        self.send_cannot_award(&id, client, thread, level).await;
        self.process(&mut lk).await;
        drop(lk);
        self.gc_if_clear(&id).await;
    }

    async fn on_wait_timeout(self: Arc<Self>, id: LockID, client: ClientID, thread: ThreadID) {
        let Ok(entry) = self.existing(&id).await else {
            return;
        };
        let mut lk = entry.lock().await;
        lk.timers.remove(&(client, thread));
        let Some(at) = lk.waiter_index(client, thread) else {
            return;
        };
        let mut ctx = lk.contexts.remove(at).unwrap();
        let level = ctx.state.level();
        ctx.transition(State::of(ContextType::Pending, level));
        ctx.timeout_millis = None;
        lk.insert_queued(ctx);
        if let Some((session, sink)) = self.handle_of(client).await {
            sink.wait_timeout(session, id.clone(), thread, level).await;
        }
        self.process(&mut lk).await;
    }
}
