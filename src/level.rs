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

//! Lock levels, client-facing and server-facing.

use std::fmt;

/// Client-facing lock level.
///
/// `SynchronousWrite` is a write lock whose unlock additionally waits for
/// the change set to be acknowledged; the server never distinguishes it
/// from `Write`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LockLevel {
    Read,
    Write,
    SynchronousWrite,
}

impl LockLevel {
    pub fn is_read(self) -> bool {
        matches!(self, LockLevel::Read)
    }

    pub fn is_write(self) -> bool {
        matches!(self, LockLevel::Write | LockLevel::SynchronousWrite)
    }
}

impl fmt::Display for LockLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LockLevel::Read => "READ",
            LockLevel::Write => "WRITE",
            LockLevel::SynchronousWrite => "SYNCHRONOUS_WRITE",
        };
        f.write_str(s)
    }
}

/// Server-facing lock level. `SynchronousWrite` maps to `Write`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ServerLockLevel {
    Read,
    Write,
}

impl ServerLockLevel {
    pub fn is_write(self) -> bool {
        matches!(self, ServerLockLevel::Write)
    }
}

impl From<LockLevel> for ServerLockLevel {
    fn from(level: LockLevel) -> Self {
        match level {
            LockLevel::Read => ServerLockLevel::Read,
            LockLevel::Write | LockLevel::SynchronousWrite => ServerLockLevel::Write,
        }
    }
}

impl fmt::Display for ServerLockLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServerLockLevel::Read => "READ",
            ServerLockLevel::Write => "WRITE",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synchronous_write_maps_to_write() {
        assert_eq!(
            ServerLockLevel::from(LockLevel::SynchronousWrite),
            ServerLockLevel::Write
        );
        assert_eq!(ServerLockLevel::from(LockLevel::Write), ServerLockLevel::Write);
        assert_eq!(ServerLockLevel::from(LockLevel::Read), ServerLockLevel::Read);
    }

    #[test]
    fn write_predicates() {
        assert!(LockLevel::SynchronousWrite.is_write());
        assert!(LockLevel::Write.is_write());
        assert!(!LockLevel::Read.is_write());
    }
}
