mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use eventscope::store::memory::EventRecord;
use eventscope::{partitions_for, MemoryStore, SeqRange};

fn visited(store: &MemoryStore, pid: &str) -> Vec<i64> {
    store
        .queried_partitions()
        .into_iter()
        .filter(|(p, _)| p == pid)
        .map(|(_, partition)| partition)
        .collect()
}

#[tokio::test]
async fn scan_visits_partitions_widened_by_one_below() {
    let store = Arc::new(MemoryStore::new());
    common::seed_events(&store, "p", 5, 1..=20);
    let service = common::service(&store, 5);

    let rows = service
        .select("p", 6, 12, &common::event_table(5))
        .unwrap()
        .collect_all()
        .await
        .unwrap();

    assert_eq!(visited(&store, "p"), vec![0, 1, 2]);
    let seqs: Vec<u64> = rows.iter().map(|e| e.seq_nr().as_raw()).collect();
    assert_eq!(seqs, (6..=12).collect::<Vec<_>>());
}

#[tokio::test]
async fn overshooting_row_in_previous_partition_is_found() {
    let store = Arc::new(MemoryStore::new());
    common::seed_events(&store, "p", 5, 1..=5);
    // An atomic batch wrote 6 and 7 into partition 0 instead of partition 1.
    store.insert_event(common::EVENTS, EventRecord::new("p", 0, 6, common::payload(6)));
    store.insert_event(common::EVENTS, EventRecord::new("p", 0, 7, common::payload(7)));
    common::seed_events(&store, "p", 5, 8..=10);
    let service = common::service(&store, 5);

    let rows = service
        .select("p", 6, 10, &common::event_table(5))
        .unwrap()
        .collect_all()
        .await
        .unwrap();

    let seqs: Vec<u64> = rows.iter().map(|e| e.seq_nr().as_raw()).collect();
    assert_eq!(seqs, vec![6, 7, 8, 9, 10]);
    let partitions: Vec<u64> = rows
        .iter()
        .map(|e| match e {
            eventscope::StoredEntity::Event(event) => event.partition_nr.as_raw(),
            eventscope::StoredEntity::Snapshot(_) => unreachable!(),
        })
        .collect();
    assert_eq!(partitions, vec![0, 0, 1, 1, 1]);
}

#[tokio::test]
async fn visited_partitions_match_formula_for_many_ranges() {
    let partition_size = 7u64;
    let store = Arc::new(MemoryStore::new().with_page_size(4));
    common::seed_events(&store, "p", partition_size as i64, 1..=100);
    let service = common::service(&store, partition_size);
    let table = common::event_table(partition_size);

    let ranges = [(1, 1), (1, 100), (7, 8), (8, 8), (14, 15), (15, 15), (50, 99), (99, 100)];
    for (from, to) in ranges {
        let before = store.queried_partitions().len();
        let rows = service
            .select("p", from, to, &table)
            .unwrap()
            .collect_all()
            .await
            .unwrap();

        let issued: Vec<u64> = store.queried_partitions()[before..]
            .iter()
            .map(|(_, p)| *p as u64)
            .collect();
        let first = ((from - 1) / partition_size).saturating_sub(1);
        let last = (to - 1) / partition_size;
        assert_eq!(issued, (first..=last).collect::<Vec<_>>(), "range {}..={}", from, to);
        assert_eq!(
            issued,
            partitions_for(&SeqRange::new(from, to).unwrap(), partition_size)
                .map(|p| p.as_raw())
                .collect::<Vec<_>>()
        );

        assert_eq!(rows.len() as u64, to - from + 1);
        assert!(rows
            .iter()
            .all(|e| (from..=to).contains(&e.seq_nr().as_raw())));
    }
}

#[tokio::test]
async fn range_beyond_stream_end_returns_what_exists() {
    let store = Arc::new(MemoryStore::new());
    common::seed_events(&store, "p", 10, 1..=12);
    common::seed_events(&store, "other", 10, 1..=30);
    let service = common::service(&store, 10);

    let rows = service
        .select("p", 5, 1000, &common::event_table(10))
        .unwrap()
        .collect_all()
        .await
        .unwrap();

    assert_eq!(rows.len(), 8);
    let pids: BTreeSet<&str> = rows.iter().map(|e| e.persistence_id().as_str()).collect();
    assert_eq!(pids.into_iter().collect::<Vec<_>>(), vec!["p"]);
}

#[tokio::test]
async fn snapshot_scan_issues_no_partition_queries() {
    let store = Arc::new(MemoryStore::new().with_page_size(2));
    common::seed_snapshots(&store, "p", [3, 10, 20, 30]);
    let service = common::service(&store, 10);

    let rows = service
        .select("p", 5, 25, &common::snapshot_table())
        .unwrap()
        .collect_all()
        .await
        .unwrap();

    let seqs: Vec<u64> = rows.iter().map(|e| e.seq_nr().as_raw()).collect();
    assert_eq!(seqs, vec![10, 20]);
    assert!(store.queried_partitions().is_empty());
    assert_eq!(store.query_calls(), 1);
}

#[tokio::test]
async fn range_up_to_the_largest_sequence_number_streams_seeded_rows() {
    for partition_size in [1u64, 1_000_000] {
        let store = Arc::new(MemoryStore::new());
        common::seed_events(&store, "p", partition_size as i64, 1..=3);
        let service = common::service(&store, partition_size);

        let mut rows = service
            .select("p", 1, i64::MAX as u64, &common::event_table(partition_size))
            .unwrap();
        for expected in 1..=3u64 {
            let entity = rows.recv().await.unwrap().unwrap();
            assert_eq!(entity.seq_nr().as_raw(), expected, "partition size {}", partition_size);
        }
        // The remaining partitions are empty; stop walking them.
        rows.cancel();
        assert!(rows.recv().await.is_none());
    }
}
