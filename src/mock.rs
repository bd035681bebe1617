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

//! Test doubles and the in-memory loopback cluster.
//!
//! ## Purpose
//! [`RecordingSink`] captures everything a server pushes at one client;
//! [`RecordingRemote`] captures everything a client asks of the server and
//! can answer awards by itself; [`LoopbackCluster`] wires real client
//! managers to a real server through per-client message pumps. Exported so
//! downstream crates can test against the same doubles.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex as StdMutex, Weak};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::error;

use crate::client::ClientLockManager;
use crate::config::LockManagerConfig;
use crate::error::{LockError, LockResult};
use crate::ids::{ClientID, LockID, SessionID, ThreadID};
use crate::level::ServerLockLevel;
use crate::remote::{LockResponseSink, RemoteLockManager, WaitSpec};
use crate::server::ServerLockManager;
use crate::wire::{Notify, RecallBatchContext};

/// One message a server pushed at a client.
#[derive(Clone, Debug)]
pub enum SinkEvent {
    Award {
        session: SessionID,
        lock: LockID,
        thread: ThreadID,
        level: ServerLockLevel,
        greedy: bool,
    },
    CannotAward {
        session: SessionID,
        lock: LockID,
        thread: ThreadID,
        level: ServerLockLevel,
    },
    Notified {
        session: SessionID,
        lock: LockID,
        thread: ThreadID,
    },
    Recall {
        session: SessionID,
        lock: LockID,
        level: ServerLockLevel,
        generation: u64,
    },
    WaitTimeout {
        session: SessionID,
        lock: LockID,
        thread: ThreadID,
        level: ServerLockLevel,
    },
}

/// Response sink that records every message in arrival order.
#[derive(Default)]
pub struct RecordingSink {
    events: StdMutex<Vec<SinkEvent>>,
}

impl RecordingSink {
    pub fn new() -> Arc<RecordingSink> {
        Arc::new(RecordingSink::default())
    }

    /// Drain and return everything recorded so far.
    pub fn take(&self) -> Vec<SinkEvent> {
        match self.events.lock() {
            Ok(mut events) => std::mem::take(&mut *events),
            Err(_) => Vec::new(),
        }
    }

    fn push(&self, event: SinkEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

#[async_trait]
impl LockResponseSink for RecordingSink {
    async fn award_lock(
        &self,
        session: SessionID,
        lock: LockID,
        thread: ThreadID,
        level: ServerLockLevel,
        greedy: bool,
    ) {
        self.push(SinkEvent::Award { session, lock, thread, level, greedy });
    }

    async fn cannot_award(
        &self,
        session: SessionID,
        lock: LockID,
        thread: ThreadID,
        level: ServerLockLevel,
    ) {
        self.push(SinkEvent::CannotAward { session, lock, thread, level });
    }

    async fn notified(&self, session: SessionID, lock: LockID, thread: ThreadID) {
        self.push(SinkEvent::Notified { session, lock, thread });
    }

    async fn recall(
        &self,
        session: SessionID,
        lock: LockID,
        level: ServerLockLevel,
        generation: u64,
    ) {
        self.push(SinkEvent::Recall { session, lock, level, generation });
    }

    async fn wait_timeout(
        &self,
        session: SessionID,
        lock: LockID,
        thread: ThreadID,
        level: ServerLockLevel,
    ) {
        self.push(SinkEvent::WaitTimeout { session, lock, thread, level });
    }
}

/// One call a client made on its remote.
#[derive(Clone, Debug)]
pub enum RemoteCall {
    Request {
        lock: LockID,
        thread: ThreadID,
        level: ServerLockLevel,
    },
    TryRequest {
        lock: LockID,
        thread: ThreadID,
        level: ServerLockLevel,
        timeout: Option<Duration>,
    },
    Release {
        lock: LockID,
        thread: ThreadID,
    },
    ReleaseWait {
        lock: LockID,
        thread: ThreadID,
        wait: WaitSpec,
    },
    Notify(Notify),
    RecallCommit {
        generation: u64,
        batch: RecallBatchContext,
    },
    Interrupt {
        lock: LockID,
        thread: ThreadID,
    },
}

enum AwardMode {
    Manual,
    Auto { greedy: bool },
}

/// Remote that records every call and, in auto mode, answers each lock
/// request with an award on a spawned task (so the award callback never
/// re-enters the manager under the caller's guard).
pub struct RecordingRemote {
    calls: StdMutex<Vec<RemoteCall>>,
    mode: AwardMode,
    session: SessionID,
    manager: StdMutex<Option<Weak<ClientLockManager>>>,
    wait_release_broken: AtomicBool,
}

impl RecordingRemote {
    /// Record only; tests drive the callbacks by hand.
    pub fn new() -> Arc<RecordingRemote> {
        Arc::new(RecordingRemote {
            calls: StdMutex::new(Vec::new()),
            mode: AwardMode::Manual,
            session: SessionID(1),
            manager: StdMutex::new(None),
            wait_release_broken: AtomicBool::new(false),
        })
    }

    /// Award every request as it arrives; `greedy` awards target the vm
    /// thread with the greedy flag set.
    pub fn auto(greedy: bool) -> Arc<RecordingRemote> {
        Arc::new(RecordingRemote {
            calls: StdMutex::new(Vec::new()),
            mode: AwardMode::Auto { greedy },
            session: SessionID(1),
            manager: StdMutex::new(None),
            wait_release_broken: AtomicBool::new(false),
        })
    }

    /// Make release-wait calls fail, as a dropped transport would.
    pub fn break_wait_release(&self) {
        self.wait_release_broken.store(true, Ordering::SeqCst);
    }

    /// Hand auto mode the manager whose callbacks it should drive.
    pub fn attach(&self, mgr: &Arc<ClientLockManager>) {
        if let Ok(mut slot) = self.manager.lock() {
            *slot = Some(Arc::downgrade(mgr));
        }
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        match self.calls.lock() {
            Ok(calls) => calls.clone(),
            Err(_) => Vec::new(),
        }
    }

    fn record(&self, call: RemoteCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }

    fn award_later(&self, lock: LockID, thread: ThreadID, level: ServerLockLevel) {
        let AwardMode::Auto { greedy } = self.mode else {
            return;
        };
        let mgr = match self.manager.lock() {
            Ok(slot) => slot.as_ref().and_then(Weak::upgrade),
            Err(_) => None,
        };
        let Some(mgr) = mgr else { return };
        let session = self.session;
        tokio::spawn(async move {
            let target = if greedy { ThreadID::VM } else { thread };
            if let Err(e) = mgr.awarded(session, lock, target, level, greedy).await {
                error!(error = %e, "auto award rejected");
            }
        });
    }
}

#[async_trait]
impl RemoteLockManager for RecordingRemote {
    async fn request_lock(
        &self,
        lock: LockID,
        thread: ThreadID,
        level: ServerLockLevel,
    ) -> LockResult<()> {
        self.record(RemoteCall::Request { lock: lock.clone(), thread, level });
        self.award_later(lock, thread, level);
        Ok(())
    }

    async fn try_request_lock(
        &self,
        lock: LockID,
        thread: ThreadID,
        level: ServerLockLevel,
        timeout: Option<Duration>,
    ) -> LockResult<()> {
        self.record(RemoteCall::TryRequest { lock: lock.clone(), thread, level, timeout });
        self.award_later(lock, thread, level);
        Ok(())
    }

    async fn release_lock(&self, lock: LockID, thread: ThreadID) -> LockResult<()> {
        self.record(RemoteCall::Release { lock, thread });
        Ok(())
    }

    async fn release_lock_wait(
        &self,
        lock: LockID,
        thread: ThreadID,
        wait: WaitSpec,
    ) -> LockResult<()> {
        self.record(RemoteCall::ReleaseWait { lock, thread, wait });
        if self.wait_release_broken.load(Ordering::SeqCst) {
            return Err(LockError::Shutdown(
                "transport closed under a release-wait".into(),
            ));
        }
        Ok(())
    }

    async fn request_notify(&self, notify: Notify) -> LockResult<()> {
        self.record(RemoteCall::Notify(notify));
        Ok(())
    }

    async fn recall_commit(&self, generation: u64, batch: RecallBatchContext) -> LockResult<()> {
        self.record(RemoteCall::RecallCommit { generation, batch });
        Ok(())
    }

    async fn interrupt_wait(&self, lock: LockID, thread: ThreadID) -> LockResult<()> {
        self.record(RemoteCall::Interrupt { lock, thread });
        Ok(())
    }
}

/// A real server and real clients joined by in-memory channels.
///
/// Each joined client gets a remote that calls straight into the server
/// and a sink that queues server messages onto an unbounded channel; a
/// pump task per client replays them into the client manager. The queue
/// is what breaks the re-entrancy between the two managers' guards.
pub struct LoopbackCluster {
    server: Arc<ServerLockManager>,
}

impl LoopbackCluster {
    pub fn new(config: LockManagerConfig) -> LoopbackCluster {
        LoopbackCluster { server: ServerLockManager::new(config) }
    }

    pub fn server(&self) -> &Arc<ServerLockManager> {
        &self.server
    }

    /// Connect a new client under `session` and start its message pump.
    pub async fn join(&self, client: ClientID, session: SessionID) -> Arc<ClientLockManager> {
        let remote = Arc::new(LoopbackRemote { server: self.server.clone(), client });
        let mgr = ClientLockManager::new(client, session, remote);
        self.start_pump(client, session, &mgr).await;
        mgr
    }

    /// Re-register an existing client under a fresh session, as a
    /// transport reconnect would. The old pump keeps draining its queue
    /// until the server-side sink is replaced here.
    pub async fn rejoin(&self, mgr: &Arc<ClientLockManager>, session: SessionID) {
        self.start_pump(mgr.client_id(), session, mgr).await;
    }

    async fn start_pump(
        &self,
        client: ClientID,
        session: SessionID,
        mgr: &Arc<ClientLockManager>,
    ) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.server
            .connect_client(client, session, Arc::new(QueueSink { tx }))
            .await;
        let pump = mgr.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let result = match event {
                    SinkEvent::Award { session, lock, thread, level, greedy } => {
                        pump.awarded(session, lock, thread, level, greedy).await
                    }
                    SinkEvent::CannotAward { session, lock, thread, .. } => {
                        pump.cannot_award(session, lock, thread).await
                    }
                    SinkEvent::Notified { session, lock, thread } => {
                        pump.notified(session, lock, thread).await
                    }
                    SinkEvent::Recall { session, lock, level, generation } => {
                        pump.recalled(session, lock, level, generation).await
                    }
                    SinkEvent::WaitTimeout { session, lock, thread, .. } => {
                        pump.wait_timeout(session, lock, thread).await
                    }
                };
                if let Err(e) = result {
                    error!(error = %e, "loopback client rejected a server message");
                }
            }
        });
    }
}

struct LoopbackRemote {
    server: Arc<ServerLockManager>,
    client: ClientID,
}

#[async_trait]
impl RemoteLockManager for LoopbackRemote {
    async fn request_lock(
        &self,
        lock: LockID,
        thread: ThreadID,
        level: ServerLockLevel,
    ) -> LockResult<()> {
        self.server.lock(lock, self.client, thread, level).await
    }

    async fn try_request_lock(
        &self,
        lock: LockID,
        thread: ThreadID,
        level: ServerLockLevel,
        timeout: Option<Duration>,
    ) -> LockResult<()> {
        self.server.try_lock(lock, self.client, thread, level, timeout).await
    }

    async fn release_lock(&self, lock: LockID, thread: ThreadID) -> LockResult<()> {
        self.server.unlock(lock, self.client, thread).await
    }

    async fn release_lock_wait(
        &self,
        lock: LockID,
        thread: ThreadID,
        wait: WaitSpec,
    ) -> LockResult<()> {
        self.server.wait(lock, self.client, thread, wait).await
    }

    async fn request_notify(&self, notify: Notify) -> LockResult<()> {
        self.server
            .notify(notify.lock_id, self.client, notify.thread_id, notify.all)
            .await
            .map(|_| ())
    }

    async fn recall_commit(&self, generation: u64, batch: RecallBatchContext) -> LockResult<()> {
        self.server.recall_commit(self.client, generation, batch).await
    }

    async fn interrupt_wait(&self, lock: LockID, thread: ThreadID) -> LockResult<()> {
        self.server.interrupt(lock, self.client, thread).await
    }
}

struct QueueSink {
    tx: mpsc::UnboundedSender<SinkEvent>,
}

#[async_trait]
impl LockResponseSink for QueueSink {
    async fn award_lock(
        &self,
        session: SessionID,
        lock: LockID,
        thread: ThreadID,
        level: ServerLockLevel,
        greedy: bool,
    ) {
        let _ = self.tx.send(SinkEvent::Award { session, lock, thread, level, greedy });
    }

    async fn cannot_award(
        &self,
        session: SessionID,
        lock: LockID,
        thread: ThreadID,
        level: ServerLockLevel,
    ) {
        let _ = self.tx.send(SinkEvent::CannotAward { session, lock, thread, level });
    }

    async fn notified(&self, session: SessionID, lock: LockID, thread: ThreadID) {
        let _ = self.tx.send(SinkEvent::Notified { session, lock, thread });
    }

    async fn recall(
        &self,
        session: SessionID,
        lock: LockID,
        level: ServerLockLevel,
        generation: u64,
    ) {
        let _ = self.tx.send(SinkEvent::Recall { session, lock, level, generation });
    }

    async fn wait_timeout(
        &self,
        session: SessionID,
        lock: LockID,
        thread: ThreadID,
        level: ServerLockLevel,
    ) {
        let _ = self.tx.send(SinkEvent::WaitTimeout { session, lock, thread, level });
    }
}
