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

//! Error types for distributed lock operations.
//!
//! Two taxonomies live side by side here. Protocol violations
//! ([`LockError::ProtocolViolation`], [`LockError::IllegalMonitorState`],
//! [`LockError::TypeMismatch`]) are engineering errors: they are surfaced
//! immediately, never retried, and must not be caught-and-ignored anywhere
//! in the stack. Operational conditions ([`LockError::Codec`],
//! [`LockError::NotFound`], [`LockError::Shutdown`], and a refused
//! `try_lock`) are expected at runtime and resolved by the managers.

use thiserror::Error;

/// Result type for lock operations.
pub type LockResult<T> = Result<T, LockError>;

/// Errors that can occur during lock operations.
#[derive(Error, Debug)]
pub enum LockError {
    /// An operation that only an incorrect caller can produce: unlock
    /// without a matching hold, an award for a request that is not
    /// pending, a duplicate outstanding request. Fatal by contract.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// wait/notify invoked by a thread that does not hold the lock at
    /// WRITE, mirroring `IllegalMonitorStateException` semantics.
    #[error("illegal monitor state: {0}")]
    IllegalMonitorState(String),

    /// Literal-value lock identities are not orderable; comparing one
    /// against anything is an error by design, never a panic.
    #[error("lock ids are not comparable: {left} vs {right}")]
    TypeMismatch {
        left: &'static str,
        right: &'static str,
    },

    /// Wire decode failure (truncation, unknown tag, invalid UTF-8,
    /// batch member with a mismatched lock id).
    #[error("codec error: {0}")]
    Codec(String),

    /// The requested lock target does not exist on the server. Surfaced
    /// to the waiting caller as a distinct condition, not a violation.
    #[error("lock target not found: {0}")]
    NotFound(String),

    /// The manager was dropped or its channel closed beneath a blocked
    /// caller.
    #[error("lock manager shut down: {0}")]
    Shutdown(String),
}

impl LockError {
    /// True for the fatal, never-swallowed taxonomy. Monitor-state and
    /// comparability errors are surfaced to the caller instead.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, LockError::ProtocolViolation(_))
    }
}
