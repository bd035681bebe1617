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

//! # Meshwork Distributed Lock Manager
//!
//! ## Purpose
//! A cluster-wide lock manager split into a server half that owns the
//! authoritative per-lock queues and a client half that caches grants and
//! arbitrates local threads. Together they provide mutual exclusion,
//! read sharing, recursion, upgrades, and wait/notify across nodes.
//!
//! ## Architecture Context
//! Each lock has exactly one ordered context queue on the server. Clients
//! talk to the server through [`remote::RemoteLockManager`] and the server
//! talks back through [`remote::LockResponseSink`]; both are traits so the
//! transport stays pluggable (the in-memory loopback in [`mock`] is one
//! implementation, a network codec built on [`wire`] is another).
//!
//! Under the default greedy policy the server hands a whole client the
//! lock on first contact. The client then serves its own threads without
//! further round trips until a conflicting request elsewhere triggers a
//! recall, at which point the client commits back every real participant
//! and the server re-admits them into the queue.
//!
//! ## Key Components
//!
//! - [`ids`]: [`ids::LockID`], [`ids::ThreadID`], [`ids::ClientID`],
//!   [`ids::SessionID`]
//! - [`level`]: client-facing [`level::LockLevel`] and the two-valued
//!   [`level::ServerLockLevel`] the protocol speaks
//! - [`state`]: the closed context state machine shared by both halves
//! - [`wire`]: big-endian codecs for everything that crosses the network
//! - [`server::ServerLockManager`]: queues, awards, recalls, wait sets
//! - [`client::ClientLockManager`]: hold stacks, greedy cache, pause gate
//! - [`config::LockManagerConfig`]: policy and timer resolution
//! - [`mock`]: recording doubles and the loopback cluster for tests

pub mod client;
pub mod config;
pub mod error;
pub mod ids;
pub mod level;
pub mod mock;
pub mod remote;
pub mod server;
pub mod state;
pub mod wire;

pub use client::{ClientLockManager, NoWaitListener, WaitListener};
pub use config::{LockManagerConfig, LockPolicy};
pub use error::{LockError, LockResult};
pub use ids::{ClientID, LiteralValue, LockID, SessionID, ThreadID};
pub use level::{LockLevel, ServerLockLevel};
pub use remote::{LockResponseSink, RemoteLockManager, WaitSpec};
pub use server::ServerLockManager;
pub use state::{ContextType, State};
pub use wire::{ClientServerExchangeLockContext, Notify, RecallBatchContext};
