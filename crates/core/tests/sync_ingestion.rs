mod common;

use common::{recording_subscriber, TestAdapter};
use mirrordb_core::change::ChangeKind;
use mirrordb_core::sync::WriteMessage;
use mirrordb_core::{Collection, CollectionOptions, CollectionStatus, SubscribeOptions};
use mirrordb_value::{row, Key};

fn synced_collection() -> (Collection, std::sync::Arc<TestAdapter>) {
    let adapter = TestAdapter::new();
    let collection = Collection::new(
        CollectionOptions::new("items", "id")
            .sync(adapter.clone())
            .start_sync(true),
    );
    (collection, adapter)
}

#[tokio::test]
async fn initial_batch_flows_to_visible_state() {
    let (collection, adapter) = synced_collection();
    assert_eq!(collection.status(), CollectionStatus::Loading);

    let session = adapter.session();
    session.begin();
    session.write(WriteMessage::insert(row! { "id" => 1, "name" => "A" })).unwrap();
    session.write(WriteMessage::insert(row! { "id" => 2, "name" => "B" })).unwrap();
    session.commit().unwrap();
    assert_eq!(collection.status(), CollectionStatus::InitialCommit);

    session.mark_ready();
    assert_eq!(collection.status(), CollectionStatus::Ready);
    assert_eq!(collection.len(), 2);
    assert_eq!(
        collection.get(&Key::Int(1)),
        Some(row! { "id" => 1, "name" => "A" })
    );
}

#[tokio::test]
async fn truncate_and_resync_is_one_batch() {
    // Scenario: pre-state [{id:1,name:"A"}]; ingest truncate + insert(id:2).
    let (collection, adapter) = synced_collection();
    let session = adapter.session();
    session.begin();
    session.write(WriteMessage::insert(row! { "id" => 1, "name" => "A" })).unwrap();
    session.commit().unwrap();
    session.mark_ready();

    let (callback, batches) = recording_subscriber();
    let _sub = collection.subscribe_changes(callback, SubscribeOptions::default());

    session.begin();
    session.truncate().unwrap();
    session.write(WriteMessage::insert(row! { "id" => 2, "name" => "B" })).unwrap();
    session.commit().unwrap();

    assert_eq!(collection.to_array(), vec![row! { "id" => 2, "name" => "B" }]);
    let batches = batches.lock();
    assert_eq!(batches.len(), 1, "delete and insert arrive in one batch");
    let batch = &batches[0];
    assert_eq!(batch.len(), 2);
    assert_eq!(batch[0].kind, ChangeKind::Delete);
    assert_eq!(batch[0].key, Key::Int(1));
    assert_eq!(batch[1].kind, ChangeKind::Insert);
    assert_eq!(batch[1].key, Key::Int(2));
}

#[tokio::test]
async fn truncate_then_resend_same_content_is_net_zero() {
    let (collection, adapter) = synced_collection();
    let session = adapter.session();
    session.begin();
    session.write(WriteMessage::insert(row! { "id" => 1, "name" => "A" })).unwrap();
    session.commit().unwrap();
    session.mark_ready();

    let (callback, batches) = recording_subscriber();
    let _sub = collection.subscribe_changes(callback, SubscribeOptions::default());

    session.begin();
    session.truncate().unwrap();
    session.write(WriteMessage::insert(row! { "id" => 1, "name" => "A" })).unwrap();
    session.commit().unwrap();

    assert!(batches.lock().is_empty(), "identical resend coalesces to nothing");
    assert_eq!(collection.len(), 1);
}

#[tokio::test]
async fn consecutive_ready_signals_are_idempotent() {
    let (collection, adapter) = synced_collection();
    let session = adapter.session();
    session.begin();
    session.write(WriteMessage::insert(row! { "id" => 1 })).unwrap();
    session.commit().unwrap();
    session.mark_ready();

    let (callback, batches) = recording_subscriber();
    let _sub = collection.subscribe_changes(callback, SubscribeOptions::default());

    session.mark_ready();
    session.mark_ready();
    assert!(batches.lock().is_empty());
    assert_eq!(collection.status(), CollectionStatus::Ready);
}

#[tokio::test]
async fn update_events_carry_previous_values() {
    let (collection, adapter) = synced_collection();
    let session = adapter.session();
    session.begin();
    session.write(WriteMessage::insert(row! { "id" => 1, "n" => 1 })).unwrap();
    session.commit().unwrap();
    session.mark_ready();

    let (callback, batches) = recording_subscriber();
    let _sub = collection.subscribe_changes(callback, SubscribeOptions::default());

    session.begin();
    session.write(WriteMessage::update(row! { "id" => 1, "n" => 2 })).unwrap();
    session.commit().unwrap();

    let batches = batches.lock();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0][0].kind, ChangeKind::Update);
    assert_eq!(batches[0][0].previous_value, Some(row! { "id" => 1, "n" => 1 }));
}

#[tokio::test]
async fn initial_state_subscription_sees_current_rows() {
    let (collection, adapter) = synced_collection();
    let session = adapter.session();
    session.begin();
    session.write(WriteMessage::insert(row! { "id" => 1 })).unwrap();
    session.write(WriteMessage::insert(row! { "id" => 2 })).unwrap();
    session.commit().unwrap();
    session.mark_ready();

    let (callback, batches) = recording_subscriber();
    let _sub = collection.subscribe_changes(
        callback,
        SubscribeOptions {
            include_initial_state: true,
            ..Default::default()
        },
    );
    let batches = batches.lock();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 2);
    assert!(batches[0].iter().all(|c| c.kind == ChangeKind::Insert));
}

#[tokio::test]
async fn per_key_subscription_is_scoped() {
    let (collection, adapter) = synced_collection();
    let session = adapter.session();
    session.begin();
    session.write(WriteMessage::insert(row! { "id" => 1 })).unwrap();
    session.commit().unwrap();
    session.mark_ready();

    let (callback, batches) = recording_subscriber();
    let _sub = collection.subscribe_changes_key(Key::Int(2), callback, SubscribeOptions::default());

    let session = adapter.session();
    session.begin();
    session.write(WriteMessage::update(row! { "id" => 1, "n" => 5 })).unwrap();
    session.write(WriteMessage::insert(row! { "id" => 2 })).unwrap();
    session.commit().unwrap();

    let batches = batches.lock();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 1);
    assert_eq!(batches[0][0].key, Key::Int(2));
}
