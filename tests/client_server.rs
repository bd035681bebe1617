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

//! End-to-end tests driving real client managers against a real server
//! through the in-memory loopback cluster.

use std::time::Duration;

use meshwork_locks::mock::LoopbackCluster;
use meshwork_locks::{
    ClientID, LockID, LockLevel, LockManagerConfig, LockPolicy, NoWaitListener, SessionID,
    ThreadID, WaitSpec,
};
use tokio::time::{sleep, timeout};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter("debug").try_init();
}

fn altruistic() -> LockManagerConfig {
    LockManagerConfig {
        policy: LockPolicy::Altruistic,
        ..LockManagerConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn contention_across_clients_is_served_in_arrival_order() {
    init_tracing();
    let cluster = LoopbackCluster::new(altruistic());
    let c1 = cluster.join(ClientID(1), SessionID(1)).await;
    let c2 = cluster.join(ClientID(2), SessionID(1)).await;
    let a = LockID::Numeric(1);

    c1.lock(a.clone(), ThreadID(1), LockLevel::Write).await.unwrap();
    assert_eq!(cluster.server().holder_count(&a).await, 1);

    let blocked = {
        let c2 = c2.clone();
        let a = a.clone();
        tokio::spawn(async move { c2.lock(a, ThreadID(2), LockLevel::Write).await })
    };
    for _ in 0..200 {
        if cluster.server().pending_count(&a).await == 1 {
            break;
        }
        sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(cluster.server().pending_count(&a).await, 1);
    assert!(!blocked.is_finished());

    c1.unlock(a.clone(), ThreadID(1)).await.unwrap();
    timeout(Duration::from_secs(5), blocked)
        .await
        .expect("second client never got the lock")
        .unwrap()
        .unwrap();
    assert_eq!(cluster.server().holder_count(&a).await, 1);
    assert_eq!(cluster.server().pending_count(&a).await, 0);

    c2.unlock(a, ThreadID(2)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn greedy_grant_is_cached_across_local_threads() {
    init_tracing();
    let cluster = LoopbackCluster::new(LockManagerConfig::default());
    let c1 = cluster.join(ClientID(1), SessionID(1)).await;
    let a = LockID::Numeric(2);

    c1.lock(a.clone(), ThreadID(1), LockLevel::Read).await.unwrap();
    assert!(cluster.server().has_greedy_holders(&a).await);
    assert_eq!(cluster.server().holder_count(&a).await, 1);

    // Served from the cached grant, no further server traffic.
    c1.lock(a.clone(), ThreadID(2), LockLevel::Read).await.unwrap();
    c1.lock(a.clone(), ThreadID(1), LockLevel::Read).await.unwrap();
    assert_eq!(cluster.server().holder_count(&a).await, 1);

    c1.unlock(a.clone(), ThreadID(1)).await.unwrap();
    c1.unlock(a.clone(), ThreadID(1)).await.unwrap();
    c1.unlock(a.clone(), ThreadID(2)).await.unwrap();

    // The grant stays cached after the last local release.
    assert!(cluster.server().has_greedy_holders(&a).await);
}

#[tokio::test(start_paused = true)]
async fn recall_hands_a_greedy_grant_to_the_contending_client() {
    init_tracing();
    let cluster = LoopbackCluster::new(LockManagerConfig::default());
    let c1 = cluster.join(ClientID(1), SessionID(1)).await;
    let c2 = cluster.join(ClientID(2), SessionID(1)).await;
    let a = LockID::Numeric(3);

    c1.lock(a.clone(), ThreadID(1), LockLevel::Write).await.unwrap();
    assert!(cluster.server().has_greedy_holders(&a).await);

    let blocked = {
        let c2 = c2.clone();
        let a = a.clone();
        tokio::spawn(async move { c2.lock(a, ThreadID(2), LockLevel::Write).await })
    };
    // The recall reaches client one but commits only once the local
    // write hold is gone.
    for _ in 0..200 {
        if cluster.server().pending_count(&a).await == 1 {
            break;
        }
        sleep(Duration::from_millis(5)).await;
    }
    assert!(!blocked.is_finished());

    c1.unlock(a.clone(), ThreadID(1)).await.unwrap();
    timeout(Duration::from_secs(5), blocked)
        .await
        .expect("contending client never got the lock")
        .unwrap()
        .unwrap();
    assert_eq!(cluster.server().holder_count(&a).await, 1);

    c2.unlock(a, ThreadID(2)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn write_upgrade_out_of_a_greedy_read_is_granted_once() {
    init_tracing();
    let cluster = LoopbackCluster::new(LockManagerConfig::default());
    let c1 = cluster.join(ClientID(1), SessionID(1)).await;
    let a = LockID::Numeric(6);

    c1.lock(a.clone(), ThreadID(1), LockLevel::Read).await.unwrap();
    assert!(cluster.server().has_greedy_holders(&a).await);

    // The upgrade recalls the greedy read grant; the recall commit
    // re-admits the read hold and the queued write is granted exactly
    // once on top of it.
    c1.lock(a.clone(), ThreadID(1), LockLevel::Write).await.unwrap();
    assert_eq!(cluster.server().holder_count(&a).await, 1);
    assert_eq!(cluster.server().pending_count(&a).await, 0);
    assert!(!cluster.server().has_greedy_holders(&a).await);

    c1.unlock(a.clone(), ThreadID(1)).await.unwrap();
    c1.unlock(a, ThreadID(1)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn wait_during_a_deferred_recall_frees_the_contending_client() {
    init_tracing();
    let cluster = LoopbackCluster::new(LockManagerConfig::default());
    let c1 = cluster.join(ClientID(1), SessionID(1)).await;
    let c2 = cluster.join(ClientID(2), SessionID(1)).await;
    let a = LockID::Numeric(7);

    c1.lock(a.clone(), ThreadID(1), LockLevel::Write).await.unwrap();
    assert!(cluster.server().has_greedy_holders(&a).await);

    let blocked = {
        let c2 = c2.clone();
        let a = a.clone();
        tokio::spawn(async move { c2.lock(a, ThreadID(2), LockLevel::Write).await })
    };
    for _ in 0..200 {
        if cluster.server().pending_count(&a).await == 1 {
            break;
        }
        sleep(Duration::from_millis(5)).await;
    }
    assert!(!blocked.is_finished());

    // Waiting releases the hold that deferred the recall commit: the
    // waiter ships in the batch and the contending client gets in.
    let waiting = {
        let c1 = c1.clone();
        let a = a.clone();
        tokio::spawn(async move {
            c1.wait(a, ThreadID(1), WaitSpec::Indefinite, &NoWaitListener).await
        })
    };
    timeout(Duration::from_secs(5), blocked)
        .await
        .expect("contending client never got the lock")
        .unwrap()
        .unwrap();
    assert_eq!(cluster.server().waiter_count(&a).await, 1);

    // Notify and release; the waiter reacquires across the cluster.
    let pending = c2.notify(a.clone(), ThreadID(2), false).await.unwrap();
    assert!(!pending.is_null());
    cluster
        .server()
        .notify(pending.lock_id, ClientID(2), pending.thread_id, pending.all)
        .await
        .unwrap();
    c2.unlock(a.clone(), ThreadID(2)).await.unwrap();
    timeout(Duration::from_secs(5), waiting)
        .await
        .expect("waiter never reacquired the lock")
        .unwrap()
        .unwrap();

    c1.unlock(a, ThreadID(1)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn wait_and_notify_cross_the_cluster() {
    init_tracing();
    let cluster = LoopbackCluster::new(altruistic());
    let c1 = cluster.join(ClientID(1), SessionID(1)).await;
    let c2 = cluster.join(ClientID(2), SessionID(1)).await;
    let a = LockID::Str("queue".into());

    c1.lock(a.clone(), ThreadID(1), LockLevel::Write).await.unwrap();
    let waiting = {
        let c1 = c1.clone();
        let a = a.clone();
        tokio::spawn(async move {
            c1.wait(a, ThreadID(1), WaitSpec::Indefinite, &NoWaitListener).await
        })
    };
    for _ in 0..200 {
        if cluster.server().waiter_count(&a).await == 1 {
            break;
        }
        sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(cluster.server().waiter_count(&a).await, 1);
    assert_eq!(cluster.server().holder_count(&a).await, 0);

    // The lock is free while client one waits.
    c2.lock(a.clone(), ThreadID(2), LockLevel::Write).await.unwrap();
    let pending = c2.notify(a.clone(), ThreadID(2), false).await.unwrap();
    assert!(!pending.is_null());
    cluster
        .server()
        .notify(pending.lock_id, ClientID(2), pending.thread_id, pending.all)
        .await
        .unwrap();
    assert_eq!(cluster.server().waiter_count(&a).await, 0);
    assert!(!waiting.is_finished());

    // Reacquisition happens once the notifier releases.
    c2.unlock(a.clone(), ThreadID(2)).await.unwrap();
    timeout(Duration::from_secs(5), waiting)
        .await
        .expect("waiter never reacquired the lock")
        .unwrap()
        .unwrap();
    assert_eq!(cluster.server().holder_count(&a).await, 1);

    c1.unlock(a, ThreadID(1)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn interrupted_waiter_reacquires_without_a_notify() {
    init_tracing();
    let cluster = LoopbackCluster::new(altruistic());
    let c1 = cluster.join(ClientID(1), SessionID(1)).await;
    let a = LockID::Numeric(4);

    c1.lock(a.clone(), ThreadID(1), LockLevel::Write).await.unwrap();
    let waiting = {
        let c1 = c1.clone();
        let a = a.clone();
        tokio::spawn(async move {
            c1.wait(a, ThreadID(1), WaitSpec::Indefinite, &NoWaitListener).await
        })
    };
    for _ in 0..200 {
        if cluster.server().waiter_count(&a).await == 1 {
            break;
        }
        sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(cluster.server().waiter_count(&a).await, 1);

    c1.interrupt(a.clone(), ThreadID(1)).await.unwrap();
    timeout(Duration::from_secs(5), waiting)
        .await
        .expect("interrupted waiter never reacquired the lock")
        .unwrap()
        .unwrap();
    assert_eq!(cluster.server().waiter_count(&a).await, 0);
    assert_eq!(cluster.server().holder_count(&a).await, 1);

    c1.unlock(a, ThreadID(1)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn reconnect_reestablishes_holds_and_replays_requests() {
    init_tracing();
    let cluster = LoopbackCluster::new(altruistic());
    let c1 = cluster.join(ClientID(1), SessionID(1)).await;
    let a = LockID::Numeric(5);

    c1.lock(a.clone(), ThreadID(1), LockLevel::Write).await.unwrap();
    let blocked = {
        let c1 = c1.clone();
        let a = a.clone();
        tokio::spawn(async move { c1.lock(a, ThreadID(2), LockLevel::Write).await })
    };
    for _ in 0..200 {
        if cluster.server().pending_count(&a).await == 1 {
            break;
        }
        sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(cluster.server().pending_count(&a).await, 1);

    // Transport drop: the server forgets the client entirely.
    c1.pause().await;
    cluster.server().clear_client_state(ClientID(1)).await;
    assert_eq!(cluster.server().holder_count(&a).await, 0);

    // Reconnect window: snapshot, reestablish, resend, resume.
    c1.starting().await;
    let mut snapshot = Vec::new();
    c1.add_all_held_locks_to(&mut snapshot).await;
    c1.add_all_waiters_to(&mut snapshot).await;
    cluster.rejoin(&c1, SessionID(2)).await;
    cluster.server().reestablish(ClientID(1), snapshot).await.unwrap();
    c1.resend_pending(SessionID(2)).await.unwrap();
    c1.unpause().await;

    assert_eq!(cluster.server().holder_count(&a).await, 1);
    for _ in 0..200 {
        if cluster.server().pending_count(&a).await == 1 {
            break;
        }
        sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(cluster.server().pending_count(&a).await, 1);
    assert!(!blocked.is_finished());

    // The replayed request is granted once the hold is released.
    c1.unlock(a.clone(), ThreadID(1)).await.unwrap();
    timeout(Duration::from_secs(5), blocked)
        .await
        .expect("replayed request never granted")
        .unwrap()
        .unwrap();

    c1.unlock(a, ThreadID(2)).await.unwrap();
}
