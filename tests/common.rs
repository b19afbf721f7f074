#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use eventscope::store::memory::EventRecord;
use eventscope::{
    CodecRegistry, EventStoreService, EventTableConfig, JsonCodec, MemoryStore, ScanConfig,
    SnapshotTableConfig, TableConfig, TableConfigs,
};

pub const EVENTS: &str = "messages";
pub const SNAPSHOTS: &str = "snapshots";

pub fn codecs() -> CodecRegistry {
    CodecRegistry::new().with("json", JsonCodec::new())
}

pub fn event_table(partition_size: u64) -> TableConfig {
    TableConfig::Event(EventTableConfig::new(EVENTS, "json", partition_size))
}

pub fn snapshot_table() -> TableConfig {
    TableConfig::Snapshot(SnapshotTableConfig::new(SNAPSHOTS, "json"))
}

pub fn payload(seq: i64) -> Vec<u8> {
    format!("{{\"n\":{}}}", seq).into_bytes()
}

/// Writes `seqs` of `pid` into the partitions their sequence numbers belong to.
pub fn seed_events(store: &MemoryStore, pid: &str, partition_size: i64, seqs: impl IntoIterator<Item = i64>) {
    for seq in seqs {
        store.insert_event(EVENTS, EventRecord::new(pid, (seq - 1) / partition_size, seq, payload(seq)));
    }
}

pub fn seed_snapshots(store: &MemoryStore, pid: &str, seqs: impl IntoIterator<Item = i64>) {
    for seq in seqs {
        store.insert_snapshot(SNAPSHOTS, pid, seq, payload(seq));
    }
}

pub fn service_with(
    store: &Arc<MemoryStore>,
    partition_size: u64,
    scan: ScanConfig,
) -> EventStoreService<MemoryStore> {
    let tables = TableConfigs {
        messages: vec![EventTableConfig::new(EVENTS, "json", partition_size)],
        snapshots: vec![SnapshotTableConfig::new(SNAPSHOTS, "json")],
    };
    EventStoreService::new(Arc::clone(store), tables, codecs(), scan).expect("build service")
}

pub fn service(store: &Arc<MemoryStore>, partition_size: u64) -> EventStoreService<MemoryStore> {
    service_with(store, partition_size, ScanConfig::default())
}

pub async fn eventually<T>(
    timeout: Duration,
    interval: Duration,
    mut f: impl FnMut() -> Option<T>,
) -> T {
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(interval).await;
    }
}
