mod common;

use std::sync::Arc;
use std::time::Duration;

use eventscope::{Error, MemoryStore, ScanConfig, StoreError};

#[tokio::test]
async fn close_is_accepted_once() {
    let store = Arc::new(MemoryStore::new());
    let service = common::service(&store, 10);

    service.close().await.unwrap();
    assert!(matches!(service.close().await, Err(Error::Closed)));
    assert!(service.is_closed());
}

#[tokio::test]
async fn operations_after_close_fail() {
    let store = Arc::new(MemoryStore::new());
    common::seed_events(&store, "p", 10, 1..=2);
    let service = common::service(&store, 10);
    let table = common::event_table(10);
    let rows = service.select("p", 1, 2, &table).unwrap().collect_all().await.unwrap();

    let clone = service.clone();
    service.close().await.unwrap();

    assert!(matches!(clone.select("p", 1, 2, &table), Err(Error::Closed)));
    assert!(matches!(clone.update(&rows[0]).await, Err(Error::Closed)));
    assert!(matches!(clone.delete(&rows[0]).await, Err(Error::Closed)));
    assert!(matches!(clone.commit_delete(&rows[1]).await, Err(Error::Closed)));
    assert_eq!(store.events(common::EVENTS, "p").len(), 2);
}

#[tokio::test]
async fn scan_in_flight_at_close_ends_with_query_error() {
    let store = Arc::new(
        MemoryStore::new()
            .with_page_size(2)
            .with_page_delay(Duration::from_millis(10)),
    );
    common::seed_events(&store, "p", 1000, 1..=50);
    let service = common::service_with(&store, 1000, ScanConfig { channel_capacity: 2 });

    let mut rows = service.select("p", 1, 50, &common::event_table(1000)).unwrap();
    rows.recv().await.unwrap().unwrap();
    service.close().await.unwrap();

    let mut last = None;
    while let Some(row) = rows.recv().await {
        last = Some(row);
    }
    assert!(matches!(
        last,
        Some(Err(Error::Query {
            source: StoreError::Closed,
            ..
        }))
    ));
}

#[tokio::test]
async fn clones_share_tables_and_codecs() {
    let store = Arc::new(MemoryStore::new());
    let service = common::service(&store, 10);
    let clone = service.clone();

    assert_eq!(clone.tables(), service.tables());
    assert_eq!(clone.default_table().unwrap().table_name(), common::EVENTS);
    assert!(clone.codecs().contains("json"));
}
