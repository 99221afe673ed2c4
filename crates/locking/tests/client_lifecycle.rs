//! Lock client reference counting, stop and close

mod common;

use common::{ScriptedOracle, manager, wait_for_waiters};
use std::sync::Arc;
use std::thread;
use tgraph_common::{ResourceIdentity, ResourceKey, ResourceType};
use tgraph_locking::{LockClient, LockConfig, LockError, Locks};

fn temporal(entity_id: i64, property_key: i32) -> ResourceIdentity {
    ResourceIdentity::TemporalProp {
        entity_id,
        property_key,
    }
}

#[test]
fn test_nth_release_frees_resource() {
    let manager = manager();
    let client = LockClient::new(Arc::clone(&manager));
    let other = LockClient::new(Arc::clone(&manager));

    for _ in 0..3 {
        client.acquire_shared(ResourceType::Node, &[1]).unwrap();
    }
    for _ in 0..2 {
        client.release_shared(ResourceType::Node, &[1]).unwrap();
        assert!(client.holds_shared(ResourceType::Node, ResourceIdentity::Normal(1)));
        assert!(!other.try_exclusive_lock(ResourceType::Node, 1).unwrap());
    }

    client.release_shared(ResourceType::Node, &[1]).unwrap();
    assert!(!client.holds_shared(ResourceType::Node, ResourceIdentity::Normal(1)));
    assert_eq!(manager.lock_count(), 0);
    assert!(other.try_exclusive_lock(ResourceType::Node, 1).unwrap());

    // one release too many
    assert!(matches!(
        client.release_shared(ResourceType::Node, &[1]),
        Err(LockError::LockNotFound { .. })
    ));
}

#[test]
fn test_temporal_ref_count_releases_all_ranges() {
    let manager = manager();
    let client = LockClient::new(Arc::clone(&manager));
    let other = LockClient::new(Arc::clone(&manager));
    let prop = ResourceType::NodeTemporalProp;

    client.acquire_temporal_prop_shared(prop, 1, 5, 0, 3).unwrap();
    client.acquire_temporal_prop_shared(prop, 1, 5, 0, 3).unwrap();
    client.acquire_temporal_prop_shared(prop, 1, 5, 6, 9).unwrap();

    client.release_temporal_prop_shared(prop, 1, 5, 0, 3).unwrap();
    client.release_temporal_prop_shared(prop, 1, 5, 0, 3).unwrap();
    assert!(!other.try_temporal_prop_exclusive(prop, 1, 5, 7).unwrap());

    client.release_temporal_prop_shared(prop, 1, 5, 6, 9).unwrap();
    assert!(!client.holds_shared(prop, temporal(1, 5)));
    assert!(other.try_temporal_prop_exclusive(prop, 1, 5, 7).unwrap());
}

#[test]
fn test_temporal_exclusive_uses_exclusive_map() {
    let manager = manager();
    let client = LockClient::new(manager);
    let prop = ResourceType::RelationshipTemporalProp;

    client.acquire_temporal_prop_exclusive(prop, 4, 2, 50).unwrap();
    assert!(client.holds_exclusive(prop, temporal(4, 2)));
    assert!(!client.holds_shared(prop, temporal(4, 2)));

    client.release_temporal_prop_exclusive(prop, 4, 2, 50).unwrap();
    assert!(!client.holds_exclusive(prop, temporal(4, 2)));
}

#[test]
fn test_close_drains_mixed_locks() {
    let manager = manager();
    let client = LockClient::new(Arc::clone(&manager));

    client.acquire_shared(ResourceType::Node, &[1, 2]).unwrap();
    client.acquire_shared(ResourceType::Relationship, &[3]).unwrap();
    client
        .acquire_temporal_prop_shared(ResourceType::NodeTemporalProp, 1, 5, 0, 3)
        .unwrap();
    client
        .acquire_temporal_prop_shared(ResourceType::RelationshipTemporalProp, 2, 1, 4, 9)
        .unwrap();
    client.acquire_exclusive(ResourceType::Schema, &[0]).unwrap();
    client.acquire_exclusive(ResourceType::IndexEntry, &[7]).unwrap();
    client
        .acquire_temporal_prop_exclusive(ResourceType::NodeTemporalProp, 1, 6, 20)
        .unwrap();

    assert_eq!(client.shared_count(), 5);
    assert_eq!(client.exclusive_count(), 3);
    assert_eq!(manager.lock_count(), 8);

    client.close();
    assert_eq!(client.shared_count(), 0);
    assert_eq!(client.exclusive_count(), 0);
    assert_eq!(manager.lock_count(), 0);

    assert!(matches!(
        client.acquire_shared(ResourceType::Node, &[1]),
        Err(LockError::ClientStopped { .. })
    ));

    // closing again is a no-op
    client.close();
}

#[test]
fn test_close_survives_lock_released_behind_its_back() {
    let manager = manager();
    let client = LockClient::new(Arc::clone(&manager));
    let key = ResourceKey::normal(ResourceType::Node, 4);

    client.acquire_shared(ResourceType::Node, &[4, 5]).unwrap();
    manager
        .release_read_lock(key, client.transaction_id())
        .unwrap();

    // the failed release of node 4 is reported and the rest still drains
    client.close();
    assert_eq!(client.shared_count(), 0);
    assert_eq!(manager.lock_count(), 0);
}

#[test]
fn test_stop_interrupts_blocked_acquire() {
    let manager = manager();
    let holder = LockClient::new(Arc::clone(&manager));
    let blocked = Arc::new(LockClient::new(Arc::clone(&manager)));

    holder.acquire_exclusive(ResourceType::Node, &[1]).unwrap();

    let handle = {
        let blocked = Arc::clone(&blocked);
        thread::spawn(move || blocked.acquire_shared(ResourceType::Node, &[1]))
    };
    wait_for_waiters(&manager, 1);

    blocked.stop();
    assert!(matches!(
        handle.join().unwrap(),
        Err(LockError::ClientStopped { .. })
    ));
    assert!(!blocked.holds_shared(ResourceType::Node, ResourceIdentity::Normal(1)));

    let snapshot = manager.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].holders.len(), 1);
    assert_eq!(snapshot[0].waiting, 0);

    assert!(matches!(
        blocked.try_shared_lock(ResourceType::Node, 2),
        Err(LockError::ClientStopped { .. })
    ));
}

#[test]
fn test_stop_interrupts_blocked_temporal_acquire() {
    let manager = manager();
    let holder = LockClient::new(Arc::clone(&manager));
    let blocked = Arc::new(LockClient::new(Arc::clone(&manager)));
    let prop = ResourceType::NodeTemporalProp;

    holder.acquire_temporal_prop_shared(prop, 3, 1, 0, 100).unwrap();

    let handle = {
        let blocked = Arc::clone(&blocked);
        thread::spawn(move || blocked.acquire_temporal_prop_exclusive(prop, 3, 1, 50))
    };
    wait_for_waiters(&manager, 1);

    blocked.close();
    assert!(matches!(
        handle.join().unwrap(),
        Err(LockError::ClientStopped { .. })
    ));

    let mut elements = 0;
    manager.accept(|lock| elements += lock.tx_element_count());
    assert_eq!(elements, 1);
}

#[test]
fn test_deadlock_through_client() {
    let oracle = Arc::new(ScriptedOracle::default());
    let locks = Locks::new(LockConfig::default(), oracle.clone());
    let holder = locks.new_client().unwrap();
    let victim = locks.new_client().unwrap();

    holder.acquire_exclusive(ResourceType::Node, &[1]).unwrap();
    oracle.deadlock(victim.transaction_id());

    assert!(matches!(
        victim.acquire_shared(ResourceType::Node, &[1]),
        Err(LockError::DeadlockDetected { .. })
    ));
    assert!(!victim.holds_shared(ResourceType::Node, ResourceIdentity::Normal(1)));

    // the victim is not stopped and can lock elsewhere
    assert!(victim.try_shared_lock(ResourceType::Node, 2).unwrap());
    assert_eq!(locks.manager().lock_count(), 2);
}

#[test]
fn test_multi_id_acquire_keeps_earlier_ids_on_failure() {
    let oracle = Arc::new(ScriptedOracle::default());
    let locks = Locks::new(LockConfig::default(), oracle.clone());
    let holder = locks.new_client().unwrap();
    let victim = locks.new_client().unwrap();

    holder.acquire_exclusive(ResourceType::Relationship, &[2]).unwrap();
    oracle.deadlock(victim.transaction_id());

    assert!(victim
        .acquire_exclusive(ResourceType::Relationship, &[1, 2, 3])
        .is_err());
    assert!(victim.holds_exclusive(ResourceType::Relationship, ResourceIdentity::Normal(1)));
    assert!(!victim.holds_exclusive(ResourceType::Relationship, ResourceIdentity::Normal(3)));
    assert_eq!(victim.exclusive_count(), 1);
}

#[test]
fn test_plain_call_on_temporal_type_is_rejected() {
    let manager = manager();
    let client = LockClient::new(Arc::clone(&manager));

    assert!(matches!(
        client.acquire_shared(ResourceType::NodeTemporalProp, &[1]),
        Err(LockError::ResourceTypeMismatch { .. })
    ));
    assert_eq!(client.shared_count(), 0);
    assert_eq!(manager.lock_count(), 0);
}
