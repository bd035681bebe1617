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

//! The messaging boundary between the client and server lock managers.
//!
//! ## Purpose
//! [`RemoteLockManager`] is everything the client-side manager asks of the
//! cluster; [`LockResponseSink`] is everything the server pushes back. Both
//! sides are `async_trait` object-safe so tests can substitute the recording
//! and loopback doubles in [`crate::mock`].
//!
//! ## Design Decisions
//! - Every request is keyed by (lock, thread); replay after a reconnect is
//!   safe because the server treats a duplicate as a no-op.
//! - Every server→client message carries the [`SessionID`] it was produced
//!   under. Receivers drop messages from a stale session rather than act on
//!   them.
//! - Greedy recalls carry a generation counter so a recall commit can never
//!   be bound to a newer recall than the one it answers.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::LockResult;
use crate::ids::{LockID, SessionID, ThreadID};
use crate::level::ServerLockLevel;
use crate::wire::{Notify, RecallBatchContext};

/// How long a waiter is prepared to stay parked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitSpec {
    /// Wait until notified or interrupted.
    Indefinite,
    /// Wait at most this long, then time out back to pending.
    Timeout(Duration),
}

impl WaitSpec {
    /// Wire form: -1 for indefinite, else whole milliseconds.
    pub fn as_millis(&self) -> i64 {
        match self {
            WaitSpec::Indefinite => -1,
            WaitSpec::Timeout(d) => d.as_millis() as i64,
        }
    }

    pub fn from_millis(millis: i64) -> WaitSpec {
        if millis < 0 {
            WaitSpec::Indefinite
        } else {
            WaitSpec::Timeout(Duration::from_millis(millis as u64))
        }
    }
}

/// Client→server lock operations.
///
/// Implementations deliver each call to the authoritative lock table; the
/// outcome arrives later through the caller's [`LockResponseSink`].
#[async_trait]
pub trait RemoteLockManager: Send + Sync {
    /// Request `lock` at `level`. The award (or a greedy award to
    /// [`ThreadID::VM`]) comes back through the sink.
    async fn request_lock(
        &self,
        lock: LockID,
        thread: ThreadID,
        level: ServerLockLevel,
    ) -> LockResult<()>;

    /// Request `lock` without blocking server-side beyond `timeout`.
    /// `None` means fail immediately when not grantable.
    async fn try_request_lock(
        &self,
        lock: LockID,
        thread: ThreadID,
        level: ServerLockLevel,
        timeout: Option<Duration>,
    ) -> LockResult<()>;

    /// Release the hold registered for (lock, thread).
    async fn release_lock(&self, lock: LockID, thread: ThreadID) -> LockResult<()>;

    /// Atomically release and become a waiter: the holder→waiter
    /// transition for a cluster-wide `wait`.
    async fn release_lock_wait(
        &self,
        lock: LockID,
        thread: ThreadID,
        wait: WaitSpec,
    ) -> LockResult<()>;

    /// Forward a notify/notify-all that could not be satisfied locally.
    async fn request_notify(&self, notify: Notify) -> LockResult<()>;

    /// Answer a greedy recall with every real participant the client was
    /// covering, echoing the recall's generation.
    async fn recall_commit(
        &self,
        generation: u64,
        batch: RecallBatchContext,
    ) -> LockResult<()>;

    /// Break a parked waiter out without a notify.
    async fn interrupt_wait(&self, lock: LockID, thread: ThreadID) -> LockResult<()>;
}

/// Server→client lock responses.
#[async_trait]
pub trait LockResponseSink: Send + Sync {
    /// The lock was granted. A greedy award targets [`ThreadID::VM`] and
    /// sets `greedy`; the client fans it out to its local threads.
    async fn award_lock(
        &self,
        session: SessionID,
        lock: LockID,
        thread: ThreadID,
        level: ServerLockLevel,
        greedy: bool,
    );

    /// A zero-timeout (or expired) try-lock could not be granted.
    async fn cannot_award(
        &self,
        session: SessionID,
        lock: LockID,
        thread: ThreadID,
        level: ServerLockLevel,
    );

    /// A waiter on this client was notified and is now pending re-award.
    async fn notified(&self, session: SessionID, lock: LockID, thread: ThreadID);

    /// The server wants the client's greedy grant back, down to `level`.
    async fn recall(
        &self,
        session: SessionID,
        lock: LockID,
        level: ServerLockLevel,
        generation: u64,
    );

    /// A timed waiter expired server-side and was re-queued as pending.
    async fn wait_timeout(
        &self,
        session: SessionID,
        lock: LockID,
        thread: ThreadID,
        level: ServerLockLevel,
    );
}
