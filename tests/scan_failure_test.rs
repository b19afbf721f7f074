mod common;

use std::sync::Arc;

use eventscope::codec::CodecError;
use eventscope::{
    CodecRegistry, Error, EventStoreService, EventTableConfig, MemoryStore, Payload, PayloadCodec,
    ScanConfig, TableConfigs,
};

/// Panics on the payload of sequence number 3.
#[derive(Debug)]
struct BrittleCodec;

impl PayloadCodec for BrittleCodec {
    fn empty(&self) -> Payload {
        Payload::new(serde_json::Value::Null)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Payload, CodecError> {
        if bytes == common::payload(3).as_slice() {
            panic!("unsupported payload layout");
        }
        serde_json::from_slice(bytes)
            .map(Payload::new)
            .map_err(|e| CodecError(e.to_string()))
    }

    fn encode(&self, payload: &Payload) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(payload.value()).map_err(|e| CodecError(e.to_string()))
    }
}

fn brittle_service(store: &Arc<MemoryStore>) -> EventStoreService<MemoryStore> {
    let tables = TableConfigs {
        messages: vec![EventTableConfig::new(common::EVENTS, "brittle", 10)],
        snapshots: vec![],
    };
    let codecs = CodecRegistry::new().with("brittle", BrittleCodec);
    EventStoreService::new(Arc::clone(store), tables, codecs, ScanConfig::default()).unwrap()
}

#[tokio::test]
async fn producer_panic_ends_the_stream_with_an_error() {
    let store = Arc::new(MemoryStore::new());
    common::seed_events(&store, "p", 10, 1..=5);
    let service = brittle_service(&store);
    let table = service.default_table().unwrap();

    let mut rows = service.select("p", 1, 5, &table).unwrap();
    for expected in 1..=2u64 {
        assert_eq!(rows.recv().await.unwrap().unwrap().seq_nr().as_raw(), expected);
    }
    match rows.recv().await {
        Some(Err(Error::ScanAborted { table, reason })) => {
            assert_eq!(table, common::EVENTS);
            assert!(reason.contains("unsupported payload layout"), "{}", reason);
        }
        other => panic!("expected an aborted scan, got {:?}", other.map(|r| r.is_ok())),
    }
    assert!(rows.recv().await.is_none());
}

#[tokio::test]
async fn producer_panic_is_not_a_complete_result() {
    let store = Arc::new(MemoryStore::new());
    common::seed_events(&store, "p", 10, 1..=5);
    let service = brittle_service(&store);
    let table = service.default_table().unwrap();

    let result = service.select("p", 1, 5, &table).unwrap().collect_all().await;
    assert!(matches!(result, Err(Error::ScanAborted { .. })));

    // Rows before the panicking one still scan cleanly.
    let rows = service.select("p", 1, 2, &table).unwrap().collect_all().await.unwrap();
    assert_eq!(rows.len(), 2);
}
