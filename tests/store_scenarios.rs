//! End-to-end scenarios exercising the public
//! `TaskStore` handle against the real filesystem.

use taskstore::{ChangeTask, NewTask, StoreOptions, TaskStore};

fn add(group: &str, payload: &str) -> NewTask {
    NewTask { group: group.to_string(), availability: 0, payload: payload.as_bytes().to_vec() }
}

/// Scenario 1: add six tasks across three groups, check ids, groups and
/// `list_group`.
#[tokio::test]
async fn scenario_1_add_tasks_across_groups() {
    let dir = tempfile::tempdir().unwrap();
    let store = TaskStore::open(StoreOptions::new(dir.path())).await.unwrap();

    let adds = vec![
        add("g1", "hello there"),
        add("g1", "hi"),
        add("g2", "10"),
        add("g2", "5"),
        add("g3", "-"),
        add("g3", "_"),
    ];
    let created = store.update(11, adds, vec![], vec![], vec![]).await.unwrap();
    let ids: Vec<u64> = created.iter().map(|t| t.id).collect();
    assert_eq!(ids, vec![1, 2, 3, 4, 5, 6]);

    let mut groups = store.groups().await;
    groups.sort();
    assert_eq!(groups, vec!["g1".to_string(), "g2".to_string(), "g3".to_string()]);

    let mut g1_ids: Vec<u64> = store.list_group("g1", -1, true).await.iter().map(|t| t.id).collect();
    g1_ids.sort();
    assert_eq!(g1_ids, vec![1, 2]);

    store.close().await.unwrap();
}

/// Scenario 2 + 3: change task 1, then attempt to change the result from the
/// wrong owner.
#[tokio::test]
async fn scenario_2_and_3_change_and_ownership_precondition() {
    let dir = tempfile::tempdir().unwrap();
    let store = TaskStore::open(StoreOptions::new(dir.path())).await.unwrap();

    let adds = vec![
        add("g1", "hello there"),
        add("g1", "hi"),
        add("g2", "10"),
        add("g2", "5"),
        add("g3", "-"),
        add("g3", "_"),
    ];
    store.update(11, adds, vec![], vec![], vec![]).await.unwrap();

    // change task 1 to availability now + 60_000, by owner 11.
    let changes = vec![ChangeTask { id: 1, availability: -60_000, payload: None }];
    let changed = store.update(11, vec![], changes, vec![], vec![]).await.unwrap();
    assert_eq!(changed.len(), 1);
    let new_task = &changed[0];
    assert_eq!(new_task.id, 7);
    assert_eq!(new_task.group, "g1");
    assert_eq!(new_task.owner, 11);
    assert_eq!(new_task.payload, b"hello there");

    // g1 only has task 2 visible to non-owners now (task 7 is owned).
    let visible = store.list_group("g1", 0, false).await;
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].id, 2);

    // scenario 3: owner 12 may not change task 7.
    let bad_changes = vec![ChangeTask { id: 7, availability: -60_000, payload: None }];
    let err = store.update(12, vec![], bad_changes, vec![], vec![]).await.unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("owned"), "expected ownership message, got: {}", msg);

    store.close().await.unwrap();
}

/// Property 4 / scenario-style: successful updates survive a close/reopen
/// cycle with identical id->task state, group membership, and payloads.
#[tokio::test]
async fn round_trip_through_restart() {
    let dir = tempfile::tempdir().unwrap();

    {
        let store = TaskStore::open(StoreOptions::new(dir.path())).await.unwrap();
        store
            .update(1, vec![add("g1", "a"), add("g1", "b"), add("g2", "c")], vec![], vec![], vec![])
            .await
            .unwrap();
        store.close().await.unwrap();
    }

    let store = TaskStore::open(StoreOptions::new(dir.path())).await.unwrap();
    let mut groups = store.groups().await;
    groups.sort();
    assert_eq!(groups, vec!["g1".to_string(), "g2".to_string()]);

    let mut g1_payloads: Vec<Vec<u8>> = store.list_group("g1", -1, true).await.into_iter().map(|t| t.payload).collect();
    g1_payloads.sort();
    assert_eq!(g1_payloads, vec![b"a".to_vec(), b"b".to_vec()]);

    let after = store
        .update(1, vec![add("g3", "d")], vec![], vec![], vec![])
        .await
        .unwrap();
    // ids must remain strictly increasing across the restart.
    assert!(after[0].id > 3);

    store.close().await.unwrap();
}

/// Property 2: a failing update (missing dependency) mutates nothing.
#[tokio::test]
async fn atomicity_on_precondition_failure() {
    let dir = tempfile::tempdir().unwrap();
    let store = TaskStore::open(StoreOptions::new(dir.path())).await.unwrap();

    store.update(1, vec![add("g1", "a")], vec![], vec![], vec![]).await.unwrap();

    let before = store.groups().await;
    let err = store
        .update(1, vec![add("g1", "b")], vec![], vec![], vec![999])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("dependency"));

    let after = store.groups().await;
    assert_eq!(before, after);
    let g1 = store.list_group("g1", -1, true).await;
    assert_eq!(g1.len(), 1);

    store.close().await.unwrap();
}

/// Property 6: concurrent claims against the same group never return the
/// same task twice.
#[tokio::test]
async fn claim_disjointness() {
    let dir = tempfile::tempdir().unwrap();
    let store = TaskStore::open(StoreOptions::new(dir.path())).await.unwrap();

    let adds: Vec<NewTask> = (0..20).map(|i| add("work", &i.to_string())).collect();
    store.update(1, adds, vec![], vec![], vec![]).await.unwrap();

    let mut handles = Vec::new();
    for owner in 0..10u64 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store.claim(owner, vec!["work".to_string()], 60_000).await.unwrap()
        }));
    }

    let mut seen = std::collections::HashSet::new();
    for h in handles {
        let claimed = h.await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert!(seen.insert(claimed[0].id), "task id {} claimed twice", claimed[0].id);
    }

    store.close().await.unwrap();
}

/// Claiming more distinct groups than have eligible tasks fails without
/// consuming any of the groups that did have one.
#[tokio::test]
async fn claim_all_or_nothing_across_groups() {
    let dir = tempfile::tempdir().unwrap();
    let store = TaskStore::open(StoreOptions::new(dir.path())).await.unwrap();

    store.update(1, vec![add("g1", "a")], vec![], vec![], vec![]).await.unwrap();
    // g2 has no tasks at all.

    let err = store
        .claim(2, vec!["g1".to_string(), "g2".to_string()], 1000)
        .await
        .unwrap_err();
    assert!(matches!(err, taskstore::StoreError::NoEligibleTask(_)));

    // g1's task must still be there, untouched, for a later claim.
    let still_there = store.list_group("g1", -1, true).await;
    assert_eq!(still_there.len(), 1);

    store.close().await.unwrap();
}
