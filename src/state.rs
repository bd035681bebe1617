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

//! Lock-context states and the transition state machine.
//!
//! ## Purpose
//! Every participation record on the server carries one [`State`], the
//! product of a [`ContextType`] and a [`ServerLockLevel`]. The set of
//! legal state changes is closed; [`can_transition`] is the pure predicate
//! over it, and applying an illegal transition is an engineering bug that
//! asserts rather than propagating.

use crate::level::ServerLockLevel;

/// The five participation kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ContextType {
    /// Holds the lock on behalf of a whole client; services local
    /// requests without server round trips until recalled.
    GreedyHolder,
    /// Currently owns the lock for one (client, thread).
    Holder,
    /// Gave the lock up via `wait` and sits in the wait set.
    Waiter,
    /// Queued by a non-blocking try-lock request.
    TryPending,
    /// Queued by a blocking lock request.
    Pending,
}

/// A context state: participation kind at a server lock level.
///
/// The discriminant order is fixed; [`State::ordinal`] is the 4-byte wire
/// value used by the exchange-context codec.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum State {
    GreedyHolderRead,
    GreedyHolderWrite,
    HolderRead,
    HolderWrite,
    WaiterRead,
    WaiterWrite,
    TryPendingRead,
    TryPendingWrite,
    PendingRead,
    PendingWrite,
}

/// All states, in ordinal order.
pub const ALL_STATES: [State; 10] = [
    State::GreedyHolderRead,
    State::GreedyHolderWrite,
    State::HolderRead,
    State::HolderWrite,
    State::WaiterRead,
    State::WaiterWrite,
    State::TryPendingRead,
    State::TryPendingWrite,
    State::PendingRead,
    State::PendingWrite,
];

impl State {
    /// Compose a state from its participation kind and level.
    pub fn of(kind: ContextType, level: ServerLockLevel) -> State {
        use ContextType::*;
        use ServerLockLevel::*;
        match (kind, level) {
            (GreedyHolder, Read) => State::GreedyHolderRead,
            (GreedyHolder, Write) => State::GreedyHolderWrite,
            (Holder, Read) => State::HolderRead,
            (Holder, Write) => State::HolderWrite,
            (Waiter, Read) => State::WaiterRead,
            (Waiter, Write) => State::WaiterWrite,
            (TryPending, Read) => State::TryPendingRead,
            (TryPending, Write) => State::TryPendingWrite,
            (Pending, Read) => State::PendingRead,
            (Pending, Write) => State::PendingWrite,
        }
    }

    pub fn kind(self) -> ContextType {
        match self {
            State::GreedyHolderRead | State::GreedyHolderWrite => ContextType::GreedyHolder,
            State::HolderRead | State::HolderWrite => ContextType::Holder,
            State::WaiterRead | State::WaiterWrite => ContextType::Waiter,
            State::TryPendingRead | State::TryPendingWrite => ContextType::TryPending,
            State::PendingRead | State::PendingWrite => ContextType::Pending,
        }
    }

    pub fn level(self) -> ServerLockLevel {
        match self {
            State::GreedyHolderRead
            | State::HolderRead
            | State::WaiterRead
            | State::TryPendingRead
            | State::PendingRead => ServerLockLevel::Read,
            _ => ServerLockLevel::Write,
        }
    }

    /// Wire ordinal of this state.
    pub fn ordinal(self) -> u32 {
        ALL_STATES.iter().position(|s| *s == self).unwrap() as u32
    }

    pub fn from_ordinal(ordinal: u32) -> Option<State> {
        ALL_STATES.get(ordinal as usize).copied()
    }

    pub fn is_holder(self) -> bool {
        matches!(self.kind(), ContextType::Holder | ContextType::GreedyHolder)
    }

    pub fn is_queued(self) -> bool {
        matches!(self.kind(), ContextType::Pending | ContextType::TryPending)
    }
}

/// Whether a lock context may legally move from `old` to `new`.
///
/// `old == None` is the unset/initial state, from which any first
/// assignment is legal. The legal transitions otherwise:
///
/// 1. Pending, TryPending or Waiter to GreedyHolder at the same level.
/// 2. Pending, TryPending or Waiter to Holder at the same level.
/// 3. HolderWrite to Waiter; a read holder may never become a waiter.
/// 4. Waiter to Pending at the same level.
/// 5. Anything to TryPending (non-blocking requests bypass queue
///    fairness).
///
/// Everything else is a protocol violation; callers that apply states
/// assert on this predicate.
pub fn can_transition(old: Option<State>, new: State) -> bool {
    let Some(old) = old else {
        return true;
    };
    if new.kind() == ContextType::TryPending {
        return true;
    }
    match (old.kind(), new.kind()) {
        (
            ContextType::Pending | ContextType::TryPending | ContextType::Waiter,
            ContextType::GreedyHolder | ContextType::Holder,
        ) => old.level() == new.level(),
        (ContextType::Holder, ContextType::Waiter) => old.level() == ServerLockLevel::Write,
        (ContextType::Waiter, ContextType::Pending) => old.level() == new.level(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinals_round_trip() {
        for (i, s) in ALL_STATES.iter().enumerate() {
            assert_eq!(s.ordinal(), i as u32);
            assert_eq!(State::from_ordinal(i as u32), Some(*s));
        }
        assert_eq!(State::from_ordinal(10), None);
    }

    #[test]
    fn state_composition_round_trips() {
        for s in ALL_STATES {
            assert_eq!(State::of(s.kind(), s.level()), s);
        }
    }

    /// Exhaustive cross-product check: exactly the enumerated transitions
    /// are legal and nothing else is.
    #[test]
    fn transition_table_is_exact() {
        use State::*;

        // The full legal set, spelled out.
        let legal: &[(Option<State>, State)] = &[
            // queued or waiting -> greedy holder, same level
            (Some(PendingRead), GreedyHolderRead),
            (Some(PendingWrite), GreedyHolderWrite),
            (Some(TryPendingRead), GreedyHolderRead),
            (Some(TryPendingWrite), GreedyHolderWrite),
            (Some(WaiterRead), GreedyHolderRead),
            (Some(WaiterWrite), GreedyHolderWrite),
            // queued or waiting -> holder, same level
            (Some(PendingRead), HolderRead),
            (Some(PendingWrite), HolderWrite),
            (Some(TryPendingRead), HolderRead),
            (Some(TryPendingWrite), HolderWrite),
            (Some(WaiterRead), HolderRead),
            (Some(WaiterWrite), HolderWrite),
            // write holder -> waiter (either waiter level)
            (Some(HolderWrite), WaiterRead),
            (Some(HolderWrite), WaiterWrite),
            // waiter -> pending, same level
            (Some(WaiterRead), PendingRead),
            (Some(WaiterWrite), PendingWrite),
        ];

        for old in std::iter::once(None).chain(ALL_STATES.into_iter().map(Some)) {
            for new in ALL_STATES {
                let expected = old.is_none()
                    || new.kind() == ContextType::TryPending
                    || legal.contains(&(old, new));
                assert_eq!(
                    can_transition(old, new),
                    expected,
                    "transition {:?} -> {:?}",
                    old,
                    new
                );
            }
        }
    }

    #[test]
    fn read_holder_may_never_wait() {
        assert!(!can_transition(Some(State::HolderRead), State::WaiterRead));
        assert!(!can_transition(Some(State::HolderRead), State::WaiterWrite));
        assert!(can_transition(Some(State::HolderWrite), State::WaiterWrite));
    }

    #[test]
    fn try_pending_is_reachable_from_anywhere() {
        for old in ALL_STATES {
            assert!(can_transition(Some(old), State::TryPendingRead));
            assert!(can_transition(Some(old), State::TryPendingWrite));
        }
    }
}
