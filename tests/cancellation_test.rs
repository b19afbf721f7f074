mod common;

use std::sync::Arc;
use std::time::Duration;

use eventscope::{MemoryStore, ScanConfig, ScanSlot};

fn slow_store() -> Arc<MemoryStore> {
    let store = MemoryStore::new()
        .with_page_size(5)
        .with_page_delay(Duration::from_millis(5));
    common::seed_events(&store, "p", 1000, 1..=200);
    Arc::new(store)
}

fn small_channel() -> ScanConfig {
    ScanConfig {
        channel_capacity: 4,
    }
}

#[tokio::test]
async fn cancel_stops_fetching_and_raises_nothing() {
    let store = slow_store();
    let service = common::service_with(&store, 1000, small_channel());

    let mut rows = service.select("p", 1, 200, &common::event_table(1000)).unwrap();
    for expected in 1..=12u64 {
        let entity = rows.recv().await.unwrap().unwrap();
        assert_eq!(entity.seq_nr().as_raw(), expected);
    }
    let handle = rows.handle();
    rows.cancel();
    rows.cancel();

    assert!(rows.recv().await.is_none());
    common::eventually(Duration::from_secs(1), Duration::from_millis(1), || {
        handle.is_finished().then_some(())
    })
    .await;

    let fetches = store.fetch_more_calls();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(store.fetch_more_calls(), fetches);
    assert!(fetches < 40, "scan paged through everything: {}", fetches);
}

#[tokio::test]
async fn dropping_the_stream_cancels_the_producer() {
    let store = slow_store();
    let service = common::service_with(&store, 1000, small_channel());

    let mut rows = service.select("p", 1, 200, &common::event_table(1000)).unwrap();
    rows.recv().await.unwrap().unwrap();
    let handle = rows.handle();
    drop(rows);

    common::eventually(Duration::from_secs(1), Duration::from_millis(1), || {
        handle.is_finished().then_some(())
    })
    .await;
    let fetches = store.fetch_more_calls();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(store.fetch_more_calls(), fetches);
}

#[tokio::test]
async fn handle_cancels_from_another_task() {
    let store = slow_store();
    let service = common::service_with(&store, 1000, small_channel());

    let mut rows = service.select("p", 1, 200, &common::event_table(1000)).unwrap();
    let handle = rows.handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();
    });

    let mut seen = 0;
    while let Some(row) = rows.recv().await {
        row.unwrap();
        seen += 1;
    }
    assert!(seen < 200);
}

#[tokio::test]
async fn new_scan_through_slot_supersedes_the_running_one() {
    let store = slow_store();
    common::seed_events(&store, "q", 1000, 1..=3);
    let service = common::service_with(&store, 1000, small_channel());
    let table = common::event_table(1000);
    let slot = ScanSlot::new();

    let mut first = slot.start(service.select("p", 1, 200, &table).unwrap());
    first.recv().await.unwrap().unwrap();

    let second = slot.start(service.select("q", 1, 3, &table).unwrap());
    assert!(first.handle().is_cancelled());
    assert!(first.recv().await.is_none());

    let rows = second.collect_all().await.unwrap();
    assert!(rows.iter().all(|e| e.persistence_id().as_str() == "q"));
    assert_eq!(rows.len(), 3);

    slot.cancel();
}
