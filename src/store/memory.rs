//! # In-Memory Store
//!
//! A simulated wide-column store that interprets the access layer's statements
//! directly. It keeps rows in the same primary-key layout the real tables use,
//! pages results server-side, and counts every round trip so tests can observe
//! exactly how the layer above talks to it.
//!
//! ## Layout
//!
//! ```text
//! events:    table → (persistence_id, partition_nr) → (sequence_nr, timestamp, timebucket) → blob
//! snapshots: table → (persistence_id, sequence_nr) → blob
//! ```
//!
//! Like CQL, `UPDATE` is an upsert and `DELETE` of a missing key is a no-op.
//!
//! ## Fault Injection
//!
//! `fail_next_prepares`, `fail_next_queries` and `fail_next_mutations` make the
//! next N calls of that kind fail. Delays on prepare and on every page keep
//! requests in flight long enough to race or cancel them.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use super::{CqlValue, Page, PagingToken, Row, StoreError, StoreSession};
use crate::codec::{event_columns, snapshot_columns};
use crate::schema::{Statement, StatementKind, TableShape};

// =============================================================================
// Configuration
// =============================================================================

/// Rows per page unless configured otherwise (the usual driver fetch size).
pub const DEFAULT_PAGE_SIZE: usize = 5000;

/// Timebucket assigned by [`EventRecord::new`].
pub const DEFAULT_TIMEBUCKET: &str = "0";

// =============================================================================
// Records
// =============================================================================

/// One event row as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub persistence_id: String,
    pub partition_nr: i64,
    pub seq_nr: i64,
    pub write_time: Uuid,
    pub timebucket: String,
    pub event: Vec<u8>,
}

impl EventRecord {
    /// A record with a random write time and the default timebucket.
    pub fn new(persistence_id: impl Into<String>, partition_nr: i64, seq_nr: i64, event: Vec<u8>) -> Self {
        Self {
            persistence_id: persistence_id.into(),
            partition_nr,
            seq_nr,
            write_time: Uuid::new_v4(),
            timebucket: DEFAULT_TIMEBUCKET.to_string(),
            event,
        }
    }

    fn to_row(&self) -> Row {
        Row::new()
            .with(event_columns::PERSISTENCE_ID, CqlValue::Text(self.persistence_id.clone()))
            .with(event_columns::PARTITION_NR, CqlValue::BigInt(self.partition_nr))
            .with(event_columns::SEQUENCE_NR, CqlValue::BigInt(self.seq_nr))
            .with(event_columns::TIMESTAMP, CqlValue::TimeUuid(self.write_time))
            .with(event_columns::TIMEBUCKET, CqlValue::Text(self.timebucket.clone()))
            .with(event_columns::EVENT, CqlValue::Blob(self.event.clone()))
    }
}

type PartitionKey = (String, i64);
type ClusteringKey = (i64, Uuid, String);
type EventPartitions = BTreeMap<PartitionKey, BTreeMap<ClusteringKey, Vec<u8>>>;
type SnapshotRows = BTreeMap<(String, i64), Vec<u8>>;

#[derive(Default)]
struct Tables {
    events: HashMap<String, EventPartitions>,
    snapshots: HashMap<String, SnapshotRows>,
}

#[derive(Debug, Default)]
struct Faults {
    prepares: usize,
    queries: usize,
    mutations: usize,
}

#[derive(Debug, Default)]
struct Counters {
    prepares: AtomicU64,
    queries: AtomicU64,
    fetch_more: AtomicU64,
    rows_served: AtomicU64,
    mutations: AtomicU64,
}

/// Prepared statement handle of the [`MemoryStore`].
#[derive(Debug, Clone)]
pub struct MemoryPrepared {
    id: u64,
    statement: Arc<Statement>,
}

impl MemoryPrepared {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn statement(&self) -> &Statement {
        &self.statement
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// MemoryStore
// =============================================================================

/// Simulated store. Cheap to share behind an `Arc`.
///
/// # Example
///
/// ```rust,ignore
/// let store = MemoryStore::new().with_page_size(10);
/// store.insert_event("messages", EventRecord::new("user-1", 0, 1, b"{}".to_vec()));
/// let store = Arc::new(store);
/// ```
pub struct MemoryStore {
    tables: Mutex<Tables>,
    faults: Mutex<Faults>,
    counters: Counters,
    queried_partitions: Mutex<Vec<PartitionKey>>,
    page_size: usize,
    prepare_delay: Duration,
    page_delay: Duration,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl MemoryStore {
    /// An empty store with the default page size and no delays.
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            faults: Mutex::new(Faults::default()),
            counters: Counters::default(),
            queried_partitions: Mutex::new(Vec::new()),
            page_size: DEFAULT_PAGE_SIZE,
            prepare_delay: Duration::ZERO,
            page_delay: Duration::ZERO,
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Rows per page. Clamped to at least 1.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Simulated round-trip time of every prepare.
    pub fn with_prepare_delay(mut self, delay: Duration) -> Self {
        self.prepare_delay = delay;
        self
    }

    /// Simulated round-trip time of every page, first or subsequent.
    pub fn with_page_delay(mut self, delay: Duration) -> Self {
        self.page_delay = delay;
        self
    }

    // -------------------------------------------------------------------------
    // Seeding and inspection
    // -------------------------------------------------------------------------

    /// Writes an event row exactly where the record says, including partitions
    /// that do not match `seq_nr` (as an overshooting atomic write would).
    pub fn insert_event(&self, table: &str, record: EventRecord) {
        let mut tables = lock(&self.tables);
        tables
            .events
            .entry(table.to_string())
            .or_default()
            .entry((record.persistence_id, record.partition_nr))
            .or_default()
            .insert((record.seq_nr, record.write_time, record.timebucket), record.event);
    }

    /// Writes a snapshot row.
    pub fn insert_snapshot(&self, table: &str, persistence_id: &str, seq_nr: i64, snapshot: Vec<u8>) {
        let mut tables = lock(&self.tables);
        tables
            .snapshots
            .entry(table.to_string())
            .or_default()
            .insert((persistence_id.to_string(), seq_nr), snapshot);
    }

    /// Every event row of a stream, in partition then clustering order.
    pub fn events(&self, table: &str, persistence_id: &str) -> Vec<EventRecord> {
        let tables = lock(&self.tables);
        let Some(partitions) = tables.events.get(table) else {
            return Vec::new();
        };
        partitions
            .iter()
            .filter(|((pid, _), _)| pid == persistence_id)
            .flat_map(|((pid, partition_nr), rows)| {
                rows.iter().map(move |((seq_nr, write_time, timebucket), event)| EventRecord {
                    persistence_id: pid.clone(),
                    partition_nr: *partition_nr,
                    seq_nr: *seq_nr,
                    write_time: *write_time,
                    timebucket: timebucket.clone(),
                    event: event.clone(),
                })
            })
            .collect()
    }

    /// The stored bytes of one snapshot.
    pub fn snapshot(&self, table: &str, persistence_id: &str, seq_nr: i64) -> Option<Vec<u8>> {
        let tables = lock(&self.tables);
        tables
            .snapshots
            .get(table)?
            .get(&(persistence_id.to_string(), seq_nr))
            .cloned()
    }

    /// Number of snapshot rows of a stream.
    pub fn snapshot_count(&self, table: &str, persistence_id: &str) -> usize {
        let tables = lock(&self.tables);
        tables.snapshots.get(table).map_or(0, |rows| {
            rows.keys().filter(|(pid, _)| pid == persistence_id).count()
        })
    }

    // -------------------------------------------------------------------------
    // Counters
    // -------------------------------------------------------------------------

    /// Statements prepared so far.
    pub fn prepare_calls(&self) -> u64 {
        self.counters.prepares.load(Ordering::SeqCst)
    }

    /// First-page executions of selects.
    pub fn query_calls(&self) -> u64 {
        self.counters.queries.load(Ordering::SeqCst)
    }

    /// Fetch-more round trips (pages after the first).
    pub fn fetch_more_calls(&self) -> u64 {
        self.counters.fetch_more.load(Ordering::SeqCst)
    }

    /// Rows handed out across all pages.
    pub fn rows_served(&self) -> u64 {
        self.counters.rows_served.load(Ordering::SeqCst)
    }

    /// Update and delete executions.
    pub fn mutation_calls(&self) -> u64 {
        self.counters.mutations.load(Ordering::SeqCst)
    }

    /// `(persistence_id, partition_nr)` of every event select, in issue order.
    pub fn queried_partitions(&self) -> Vec<(String, i64)> {
        lock(&self.queried_partitions).clone()
    }

    // -------------------------------------------------------------------------
    // Fault injection
    // -------------------------------------------------------------------------

    pub fn fail_next_prepares(&self, count: usize) {
        lock(&self.faults).prepares = count;
    }

    pub fn fail_next_queries(&self, count: usize) {
        lock(&self.faults).queries = count;
    }

    pub fn fail_next_mutations(&self, count: usize) {
        lock(&self.faults).mutations = count;
    }

    fn take_fault(&self, pick: impl FnOnce(&mut Faults) -> &mut usize) -> bool {
        let mut faults = lock(&self.faults);
        let remaining = pick(&mut faults);
        if *remaining > 0 {
            *remaining -= 1;
            true
        } else {
            false
        }
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    // -------------------------------------------------------------------------
    // Statement interpretation
    // -------------------------------------------------------------------------

    fn select_events(&self, table: &str, values: &[CqlValue], first_page: bool) -> Result<Vec<Row>, StoreError> {
        arity(values, 4)?;
        let persistence_id = text(values, 0)?;
        let partition_nr = bigint(values, 1)?;
        let from = bigint(values, 2)?;
        let to = bigint(values, 3)?;

        if first_page {
            lock(&self.queried_partitions).push((persistence_id.clone(), partition_nr));
        }

        let tables = lock(&self.tables);
        let Some(rows) = tables
            .events
            .get(table)
            .and_then(|partitions| partitions.get(&(persistence_id.clone(), partition_nr)))
        else {
            return Ok(Vec::new());
        };

        Ok(rows
            .iter()
            .filter(|((seq_nr, _, _), _)| from <= *seq_nr && *seq_nr <= to)
            .map(|((seq_nr, write_time, timebucket), event)| {
                EventRecord {
                    persistence_id: persistence_id.clone(),
                    partition_nr,
                    seq_nr: *seq_nr,
                    write_time: *write_time,
                    timebucket: timebucket.clone(),
                    event: event.clone(),
                }
                .to_row()
            })
            .collect())
    }

    fn select_snapshots(&self, table: &str, values: &[CqlValue]) -> Result<Vec<Row>, StoreError> {
        arity(values, 3)?;
        let persistence_id = text(values, 0)?;
        let from = bigint(values, 1)?;
        let to = bigint(values, 2)?;
        if from > to {
            return Ok(Vec::new());
        }

        let tables = lock(&self.tables);
        let Some(rows) = tables.snapshots.get(table) else {
            return Ok(Vec::new());
        };

        Ok(rows
            .range((persistence_id.clone(), from)..=(persistence_id.clone(), to))
            .map(|((pid, seq_nr), snapshot)| {
                Row::new()
                    .with(snapshot_columns::PERSISTENCE_ID, CqlValue::Text(pid.clone()))
                    .with(snapshot_columns::SEQUENCE_NR, CqlValue::BigInt(*seq_nr))
                    .with(snapshot_columns::SNAPSHOT, CqlValue::Blob(snapshot.clone()))
            })
            .collect())
    }

    fn mutate(&self, statement: &Statement, values: &[CqlValue]) -> Result<(), StoreError> {
        let mut tables = lock(&self.tables);
        match (statement.shape, statement.kind) {
            (TableShape::Event, StatementKind::Update) => {
                arity(values, 6)?;
                let event = blob(values, 0)?;
                let key = (text(values, 1)?, bigint(values, 2)?);
                let clustering = (bigint(values, 3)?, timeuuid(values, 4)?, text(values, 5)?);
                tables
                    .events
                    .entry(statement.table.clone())
                    .or_default()
                    .entry(key)
                    .or_default()
                    .insert(clustering, event);
            }
            (TableShape::Event, StatementKind::Delete) => {
                arity(values, 5)?;
                let key = (text(values, 0)?, bigint(values, 1)?);
                let clustering = (bigint(values, 2)?, timeuuid(values, 3)?, text(values, 4)?);
                if let Some(partitions) = tables.events.get_mut(&statement.table) {
                    if let Some(rows) = partitions.get_mut(&key) {
                        rows.remove(&clustering);
                        if rows.is_empty() {
                            partitions.remove(&key);
                        }
                    }
                }
            }
            (TableShape::Snapshot, StatementKind::Update) => {
                arity(values, 3)?;
                let snapshot = blob(values, 0)?;
                let key = (text(values, 1)?, bigint(values, 2)?);
                tables
                    .snapshots
                    .entry(statement.table.clone())
                    .or_default()
                    .insert(key, snapshot);
            }
            (TableShape::Snapshot, StatementKind::Delete) => {
                arity(values, 2)?;
                let key = (text(values, 0)?, bigint(values, 1)?);
                if let Some(rows) = tables.snapshots.get_mut(&statement.table) {
                    rows.remove(&key);
                }
            }
            (_, StatementKind::SelectRange) => {
                return Err(StoreError::Rejected(
                    "selects must be executed page by page".to_string(),
                ));
            }
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StoreSession for MemoryStore {
    type Prepared = MemoryPrepared;

    async fn prepare(&self, statement: &Statement) -> Result<MemoryPrepared, StoreError> {
        self.ensure_open()?;
        if !self.prepare_delay.is_zero() {
            tokio::time::sleep(self.prepare_delay).await;
        }
        self.counters.prepares.fetch_add(1, Ordering::SeqCst);
        if self.take_fault(|f| &mut f.prepares) {
            return Err(StoreError::Unavailable("injected prepare failure".to_string()));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        debug!(id, table = %statement.table, kind = %statement.kind, "prepared statement");
        Ok(MemoryPrepared {
            id,
            statement: Arc::new(statement.clone()),
        })
    }

    async fn execute_page(
        &self,
        prepared: &MemoryPrepared,
        values: &[CqlValue],
        paging: Option<PagingToken>,
    ) -> Result<Page, StoreError> {
        self.ensure_open()?;
        if !self.page_delay.is_zero() {
            tokio::time::sleep(self.page_delay).await;
        }
        let counter = match paging {
            None => &self.counters.queries,
            Some(_) => &self.counters.fetch_more,
        };
        counter.fetch_add(1, Ordering::SeqCst);
        if self.take_fault(|f| &mut f.queries) {
            return Err(StoreError::Timeout("injected query failure".to_string()));
        }

        let statement = prepared.statement();
        if statement.kind != StatementKind::SelectRange {
            return Err(StoreError::Rejected(format!(
                "{} statements do not return rows",
                statement.kind
            )));
        }

        let rows = match statement.shape {
            TableShape::Event => self.select_events(&statement.table, values, paging.is_none())?,
            TableShape::Snapshot => self.select_snapshots(&statement.table, values)?,
        };

        let offset = match &paging {
            Some(token) => decode_offset(token)?,
            None => 0,
        };
        let total = rows.len();
        let end = offset.saturating_add(self.page_size).min(total);
        let page_rows: Vec<Row> = rows.into_iter().skip(offset).take(end.saturating_sub(offset)).collect();
        self.counters
            .rows_served
            .fetch_add(page_rows.len() as u64, Ordering::SeqCst);

        Ok(Page {
            rows: page_rows,
            paging: (end < total).then(|| encode_offset(end)),
        })
    }

    async fn execute(&self, prepared: &MemoryPrepared, values: &[CqlValue]) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.counters.mutations.fetch_add(1, Ordering::SeqCst);
        if self.take_fault(|f| &mut f.mutations) {
            return Err(StoreError::Timeout("injected write failure".to_string()));
        }
        self.mutate(prepared.statement(), values)
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// Bind Helpers
// =============================================================================

fn arity(values: &[CqlValue], expected: usize) -> Result<(), StoreError> {
    if values.len() == expected {
        Ok(())
    } else {
        Err(StoreError::Rejected(format!(
            "expected {} bound values, got {}",
            expected,
            values.len()
        )))
    }
}

fn bind_error(index: usize, expected: &str, found: &CqlValue) -> StoreError {
    StoreError::Rejected(format!(
        "bind marker {} expects {}, got {}",
        index, expected, found
    ))
}

fn text(values: &[CqlValue], index: usize) -> Result<String, StoreError> {
    match &values[index] {
        CqlValue::Text(s) => Ok(s.clone()),
        other => Err(bind_error(index, "text", other)),
    }
}

fn bigint(values: &[CqlValue], index: usize) -> Result<i64, StoreError> {
    match &values[index] {
        CqlValue::BigInt(n) => Ok(*n),
        other => Err(bind_error(index, "bigint", other)),
    }
}

fn blob(values: &[CqlValue], index: usize) -> Result<Vec<u8>, StoreError> {
    match &values[index] {
        CqlValue::Blob(b) => Ok(b.clone()),
        other => Err(bind_error(index, "blob", other)),
    }
}

fn timeuuid(values: &[CqlValue], index: usize) -> Result<Uuid, StoreError> {
    match &values[index] {
        CqlValue::TimeUuid(u) => Ok(*u),
        other => Err(bind_error(index, "timeuuid", other)),
    }
}

fn encode_offset(offset: usize) -> PagingToken {
    PagingToken::new((offset as u64).to_le_bytes().to_vec())
}

fn decode_offset(token: &PagingToken) -> Result<usize, StoreError> {
    let raw: [u8; 8] = token
        .as_bytes()
        .try_into()
        .map_err(|_| StoreError::Rejected("malformed paging state".to_string()))?;
    Ok(u64::from_le_bytes(raw) as usize)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventTableConfig, SnapshotTableConfig, TableConfig};

    fn events_table() -> TableConfig {
        TableConfig::Event(EventTableConfig::new("messages", "json", 10))
    }

    #[tokio::test]
    async fn test_event_select_pages() {
        let store = MemoryStore::new().with_page_size(2);
        for seq in 1..=5 {
            store.insert_event("messages", EventRecord::new("p", 0, seq, vec![seq as u8]));
        }
        let select = store
            .prepare(&Statement::for_table(&events_table(), StatementKind::SelectRange))
            .await
            .unwrap();
        let values = vec![
            CqlValue::Text("p".into()),
            CqlValue::BigInt(0),
            CqlValue::BigInt(2),
            CqlValue::BigInt(5),
        ];

        let first = store.execute_page(&select, &values, None).await.unwrap();
        assert_eq!(first.rows.len(), 2);
        assert!(first.has_more_pages());

        let second = store.execute_page(&select, &values, first.paging).await.unwrap();
        assert_eq!(second.rows.len(), 2);
        assert!(!second.has_more_pages());
        assert_eq!(second.rows[1].bigint("sequence_nr").unwrap(), 5);

        assert_eq!(store.query_calls(), 1);
        assert_eq!(store.fetch_more_calls(), 1);
        assert_eq!(store.rows_served(), 4);
        assert_eq!(store.queried_partitions(), vec![("p".to_string(), 0)]);
    }

    #[tokio::test]
    async fn test_snapshot_upsert_and_delete() {
        let store = MemoryStore::new();
        let table = TableConfig::Snapshot(SnapshotTableConfig::new("snapshots", "json"));
        let update = store
            .prepare(&Statement::for_table(&table, StatementKind::Update))
            .await
            .unwrap();
        let delete = store
            .prepare(&Statement::for_table(&table, StatementKind::Delete))
            .await
            .unwrap();

        store
            .execute(
                &update,
                &[CqlValue::Blob(b"s".to_vec()), CqlValue::Text("p".into()), CqlValue::BigInt(3)],
            )
            .await
            .unwrap();
        assert_eq!(store.snapshot("snapshots", "p", 3), Some(b"s".to_vec()));

        let key = [CqlValue::Text("p".into()), CqlValue::BigInt(3)];
        store.execute(&delete, &key).await.unwrap();
        store.execute(&delete, &key).await.unwrap();
        assert_eq!(store.snapshot("snapshots", "p", 3), None);
        assert_eq!(store.mutation_calls(), 3);
    }

    #[tokio::test]
    async fn test_bind_type_mismatch_is_rejected() {
        let store = MemoryStore::new();
        let select = store
            .prepare(&Statement::for_table(&events_table(), StatementKind::SelectRange))
            .await
            .unwrap();
        let err = store
            .execute_page(&select, &vec![CqlValue::BigInt(1); 4], None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_faults_and_close() {
        let store = MemoryStore::new();
        store.fail_next_prepares(1);
        let statement = Statement::for_table(&events_table(), StatementKind::Delete);
        assert!(matches!(
            store.prepare(&statement).await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(store.prepare(&statement).await.is_ok());

        store.close().await.unwrap();
        assert!(matches!(store.prepare(&statement).await, Err(StoreError::Closed)));
    }
}
