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

//! Cluster-wide identifiers: the lock-identity family, logical threads,
//! clients, and sessions.
//!
//! ## Purpose
//! A [`LockID`] names a lockable target independently of any single node's
//! address space. The variants carry deliberately different equality and
//! ordering semantics; in particular [`LockID::Literal`] is equal by value
//! but **not orderable**: `try_cmp` against a literal fails with
//! [`LockError::TypeMismatch`].

use std::cmp::Ordering;
use std::fmt;

use crate::error::{LockError, LockResult};

/// Cluster-wide object identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectID(pub u64);

impl fmt::Display for ObjectID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectID({})", self.0)
    }
}

/// A literal value used as a lock identity. Compared by value, hashed by
/// value, and never ordered.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum LiteralValue {
    Boolean(bool),
    Integer(i64),
    Character(char),
    Text(String),
    /// An enum constant, identified by its declaring type and name.
    EnumConstant { class: String, name: String },
}

impl LiteralValue {
    /// Name of the value kind, used in type-mismatch diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            LiteralValue::Boolean(_) => "boolean literal",
            LiteralValue::Integer(_) => "integer literal",
            LiteralValue::Character(_) => "character literal",
            LiteralValue::Text(_) => "text literal",
            LiteralValue::EnumConstant { .. } => "enum literal",
        }
    }
}

/// Identity of a lockable target.
///
/// Represented as a tagged union with an explicit one-byte discriminant
/// (see [`LockID::tag`]) that doubles as the wire tag. Equality and
/// hashing are structural; ordering is the fallible [`LockID::try_cmp`]
/// because literal identities refuse to be ordered.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum LockID {
    /// Wraps an integer; compared numerically.
    Numeric(i64),
    /// Wraps a string; compared lexically.
    Str(String),
    /// Wraps a cluster-wide object identifier.
    Object(ObjectID),
    /// Wraps a literal value; equal by value, not orderable.
    Literal(LiteralValue),
    /// Gives a single field volatile semantics cluster-wide.
    VolatileField { object: ObjectID, field: String },
}

impl LockID {
    /// One-byte discriminant, written ahead of the variant payload on the
    /// wire.
    pub fn tag(&self) -> u8 {
        match self {
            LockID::Numeric(_) => 0,
            LockID::Str(_) => 1,
            LockID::Object(_) => 2,
            LockID::Literal(_) => 3,
            LockID::VolatileField { .. } => 4,
        }
    }

    /// Name of the variant, used in diagnostics.
    pub fn variant_name(&self) -> &'static str {
        match self {
            LockID::Numeric(_) => "numeric lock id",
            LockID::Str(_) => "string lock id",
            LockID::Object(_) => "object lock id",
            LockID::Literal(v) => v.kind_name(),
            LockID::VolatileField { .. } => "volatile-field lock id",
        }
    }

    /// Total order over orderable lock identities.
    ///
    /// Comparing a [`LockID::Literal`] against anything, including another
    /// literal whose value differs in kind, fails with
    /// [`LockError::TypeMismatch`]. Identities of different (orderable)
    /// variants order by their wire tag.
    pub fn try_cmp(&self, other: &LockID) -> LockResult<Ordering> {
        if matches!(self, LockID::Literal(_)) || matches!(other, LockID::Literal(_)) {
            return Err(LockError::TypeMismatch {
                left: self.variant_name(),
                right: other.variant_name(),
            });
        }
        let ord = match (self, other) {
            (LockID::Numeric(a), LockID::Numeric(b)) => a.cmp(b),
            (LockID::Str(a), LockID::Str(b)) => a.cmp(b),
            (LockID::Object(a), LockID::Object(b)) => a.cmp(b),
            (
                LockID::VolatileField { object: ao, field: af },
                LockID::VolatileField { object: bo, field: bf },
            ) => ao.cmp(bo).then_with(|| af.cmp(bf)),
            (a, b) => a.tag().cmp(&b.tag()),
        };
        Ok(ord)
    }
}

impl fmt::Display for LockID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockID::Numeric(n) => write!(f, "LockID(n:{})", n),
            LockID::Str(s) => write!(f, "LockID(s:{})", s),
            LockID::Object(o) => write!(f, "LockID(o:{})", o.0),
            LockID::Literal(v) => write!(f, "LockID(l:{:?})", v),
            LockID::VolatileField { object, field } => {
                write!(f, "LockID(v:{}.{})", object.0, field)
            }
        }
    }
}

/// Per-client monotonically assigned logical thread identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadID(pub i64);

impl ThreadID {
    /// The implicit VM-wide thread, target of greedy awards and holder of
    /// static/singleton locks.
    pub const VM: ThreadID = ThreadID(i64::MIN);
    /// The null thread.
    pub const NIL: ThreadID = ThreadID(-1);

    pub fn is_vm(&self) -> bool {
        *self == ThreadID::VM
    }
}

impl fmt::Display for ThreadID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_vm() {
            write!(f, "ThreadID(VM)")
        } else {
            write!(f, "ThreadID({})", self.0)
        }
    }
}

/// Identifies a cluster member. Also known as a node id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientID(pub u64);

impl fmt::Display for ClientID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientID({})", self.0)
    }
}

/// Identifies one connect-to-disconnect span of a client. Server-to-client
/// messages carry the session they were produced for so that a client can
/// discard messages addressed to a pre-reconnect session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionID(pub u64);

impl fmt::Display for SessionID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionID({})", self.0)
    }
}
