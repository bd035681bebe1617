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

//! Lock manager configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Whether the server hands out greedy grants.
///
/// Under [`LockPolicy::Greedy`] a whole-client grant lets that client
/// service its threads locally until the server recalls it. Under
/// [`LockPolicy::Altruistic`] every acquire and release is a round trip.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockPolicy {
    #[default]
    Greedy,
    Altruistic,
}

impl LockPolicy {
    pub fn is_greedy(&self) -> bool {
        matches!(self, LockPolicy::Greedy)
    }
}

/// Tunables shared by the server and client lock managers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockManagerConfig {
    /// Grant policy for the server-side table.
    pub policy: LockPolicy,
    /// Floor for server-side try-lock expiries; sub-tick timeouts are
    /// rounded up so a timer always fires after the grant pass.
    #[serde(with = "duration_millis")]
    pub timer_resolution: Duration,
}

impl Default for LockManagerConfig {
    fn default() -> Self {
        LockManagerConfig {
            policy: LockPolicy::default(),
            timer_resolution: Duration::from_millis(10),
        }
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_greedy() {
        let cfg = LockManagerConfig::default();
        assert!(cfg.policy.is_greedy());
        assert_eq!(cfg.timer_resolution, Duration::from_millis(10));
    }

    #[test]
    fn deserializes_from_partial_json() {
        let cfg: LockManagerConfig =
            serde_json::from_str(r#"{"policy": "altruistic"}"#).unwrap();
        assert_eq!(cfg.policy, LockPolicy::Altruistic);
        assert_eq!(cfg.timer_resolution, Duration::from_millis(10));

        let back = serde_json::to_string(&cfg).unwrap();
        let again: LockManagerConfig = serde_json::from_str(&back).unwrap();
        assert_eq!(again, cfg);
    }
}
