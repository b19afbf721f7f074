mod common;

use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::json;
use tracing_subscriber::fmt::MakeWriter;

use eventscope::{MemoryStore, Payload};

/// Collects formatted log output in memory.
#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Captured {
    fn lines_containing(&self, needle: &str) -> usize {
        let bytes = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&bytes)
            .lines()
            .filter(|line| line.contains(needle))
            .count()
    }
}

impl io::Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for Captured {
    type Writer = Captured;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

fn capture() -> (Captured, tracing::subscriber::DefaultGuard) {
    let captured = Captured::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(captured.clone())
        .with_ansi(false)
        .finish();
    let guard = tracing::subscriber::set_default(subscriber);
    (captured, guard)
}

#[tokio::test]
async fn edits_are_logged_only_once_written() {
    let (logs, _guard) = capture();
    let store = Arc::new(MemoryStore::new());
    common::seed_events(&store, "p", 10, 1..=1);
    let service = common::service(&store, 10);
    let table = common::event_table(10);
    let entity = service.select("p", 1, 1, &table).unwrap().collect_all().await.unwrap().remove(0);

    store.fail_next_mutations(1);
    assert!(service.commit_edit(&entity, Payload::new(json!({"n": 2}))).await.is_err());
    assert_eq!(logs.lines_containing("changing"), 0);

    service.commit_edit(&entity, Payload::new(json!({"n": 2}))).await.unwrap();
    assert_eq!(logs.lines_containing("changing"), 1);

    service.close().await.unwrap();
    assert!(service.commit_edit(&entity, Payload::new(json!({"n": 3}))).await.is_err());
    assert_eq!(logs.lines_containing("changing"), 1);
}

#[tokio::test]
async fn deletes_are_logged_only_once_applied() {
    let (logs, _guard) = capture();
    let store = Arc::new(MemoryStore::new());
    common::seed_events(&store, "p", 10, 1..=1);
    let service = common::service(&store, 10);
    let table = common::event_table(10);
    let entity = service.select("p", 1, 1, &table).unwrap().collect_all().await.unwrap().remove(0);

    store.fail_next_mutations(1);
    assert!(service.commit_delete(&entity).await.is_err());
    assert_eq!(logs.lines_containing("deleting seq no. 1"), 0);

    service.commit_delete(&entity).await.unwrap();
    assert_eq!(logs.lines_containing("deleting seq no. 1"), 1);
}
