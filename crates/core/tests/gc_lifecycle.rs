mod common;

use common::{recording_subscriber, TestAdapter};
use mirrordb_core::sync::WriteMessage;
use mirrordb_core::{Collection, CollectionOptions, CollectionStatus, SubscribeOptions};
use mirrordb_value::row;
use std::time::Duration;

fn collection_with_gc(gc: Duration) -> (Collection, std::sync::Arc<TestAdapter>) {
    let adapter = TestAdapter::new();
    let collection = Collection::new(
        CollectionOptions::new("items", "id")
            .sync(adapter.clone())
            .start_sync(true)
            .gc_time(gc),
    );
    let session = adapter.session();
    session.begin();
    session.write(WriteMessage::insert(row! { "id" => 1 })).unwrap();
    session.commit().unwrap();
    session.mark_ready();
    (collection, adapter)
}

#[tokio::test(start_paused = true)]
async fn gc_fires_when_subscribers_return_to_zero() {
    let (collection, adapter) = collection_with_gc(Duration::from_secs(10));
    let (callback, _) = recording_subscriber();
    let sub = collection.subscribe_changes(callback, SubscribeOptions::default());

    tokio::time::advance(Duration::from_secs(60)).await;
    assert_eq!(collection.status(), CollectionStatus::Ready, "observed collections survive");

    sub.unsubscribe();
    tokio::time::advance(Duration::from_secs(11)).await;
    tokio::task::yield_now().await;
    assert_eq!(collection.status(), CollectionStatus::CleanedUp);
    assert_eq!(adapter.cleanup_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn resubscribing_cancels_the_gc_timer() {
    let (collection, _adapter) = collection_with_gc(Duration::from_secs(10));
    let (callback, _) = recording_subscriber();
    let sub = collection.subscribe_changes(callback, SubscribeOptions::default());
    sub.unsubscribe();

    tokio::time::advance(Duration::from_secs(5)).await;
    let (callback, _) = recording_subscriber();
    let _sub2 = collection.subscribe_changes(callback, SubscribeOptions::default());

    tokio::time::advance(Duration::from_secs(60)).await;
    tokio::task::yield_now().await;
    assert_eq!(collection.status(), CollectionStatus::Ready);
}

#[tokio::test(start_paused = true)]
async fn zero_gc_time_disables_collection_gc() {
    let (collection, _adapter) = collection_with_gc(Duration::ZERO);
    let (callback, _) = recording_subscriber();
    let sub = collection.subscribe_changes(callback, SubscribeOptions::default());
    sub.unsubscribe();

    tokio::time::advance(Duration::from_secs(3600)).await;
    tokio::task::yield_now().await;
    assert_eq!(collection.status(), CollectionStatus::Ready);
}

#[tokio::test]
async fn operations_on_cleaned_up_collections_restart_sync() {
    let (collection, adapter) = collection_with_gc(Duration::ZERO);
    collection.cleanup().unwrap();
    assert_eq!(collection.status(), CollectionStatus::CleanedUp);
    assert_eq!(adapter.cleanup_count(), 1);

    // A read restarts the lifecycle from scratch.
    assert_eq!(collection.len(), 0);
    assert_eq!(collection.status(), CollectionStatus::Loading);

    let session = adapter.session();
    session.begin();
    session.write(WriteMessage::insert(row! { "id" => 5 })).unwrap();
    session.commit().unwrap();
    session.mark_ready();
    assert_eq!(collection.status(), CollectionStatus::Ready);
    assert_eq!(collection.len(), 1);
}

#[tokio::test]
async fn preload_resolves_on_ready() {
    let adapter = TestAdapter::new();
    let collection = Collection::new(
        CollectionOptions::new("items", "id")
            .sync(adapter.clone())
            .start_sync(true),
    );
    let preload = tokio::spawn({
        let collection = collection.clone();
        async move { collection.preload().await }
    });
    tokio::task::yield_now().await;

    let session = adapter.session();
    session.begin();
    session.write(WriteMessage::insert(row! { "id" => 1 })).unwrap();
    session.commit().unwrap();
    session.mark_ready();

    preload.await.unwrap().unwrap();
    assert!(collection.is_ready());
}

#[tokio::test]
async fn adapter_errors_propagate_to_status() {
    let adapter = TestAdapter::new();
    let collection = Collection::new(
        CollectionOptions::new("items", "id")
            .sync(adapter.clone())
            .start_sync(true),
    );
    adapter.session().error("stream disconnected");
    assert_eq!(collection.status(), CollectionStatus::Error);
    assert!(collection.error_message().unwrap().contains("stream disconnected"));
}
