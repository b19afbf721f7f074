//! # Partitioned Range Scans
//!
//! This module turns a logical request ("rows `from..=to` of stream `pid`") into
//! the physical queries an event or snapshot table needs, and streams the decoded
//! rows back to the caller under bounded memory.
//!
//! ## Which Partitions?
//!
//! For partition size `P`, sequence number `s` lives in partition `(s - 1) / P`.
//! A scan visits every partition from one *below* the partition of `from` up to
//! the partition of `to`:
//!
//! ```text
//!   P = 5, range 6..=12
//!
//!   partition:   0            1            2            3
//!             [1 ..  5]    [6 .. 10]    [11 .. 15]   [16 .. 20]
//!                 ▲            ▲             ▲
//!                 │            │             └── partition_of(12)
//!                 │            └── partition_of(6)
//!                 └── widened by one: an atomic batch may have
//!                     written seq 6 into partition 0
//! ```
//!
//! The widening is unconditional. Every query still carries the
//! `sequence_nr BETWEEN from AND to` predicate, so the extra partition never
//! leaks rows outside the requested range.
//!
//! ## Producer / Consumer
//!
//! ```text
//! ┌──────────────────────────┐   bounded mpsc (64)   ┌──────────────────────┐
//! │  producer task           │ ────────────────────► │  EntityStream        │
//! │  for p in partitions:    │   Result<Entity>      │  (futures::Stream)   │
//! │    PagedResult::execute  │                       │                      │
//! │    while row = next_row: │ ◄──── backpressure ── │  consumer polls at   │
//! │      decode, send.await  │   (send suspends      │  its own pace        │
//! │                          │    when full)         │                      │
//! └──────────────────────────┘                       └──────────────────────┘
//! ```
//!
//! The producer holds at most one page of undelivered rows plus whatever sits in
//! the channel, so memory is bounded by `capacity + page size` regardless of
//! how many rows the range covers.
//!
//! ## Cancellation
//!
//! Dropping an [`EntityStream`] or calling [`ScanHandle::cancel`] aborts the
//! producer at its next suspension point. No further pages are fetched, and the
//! consumer sees the end of the stream rather than an error. [`ScanSlot`] holds
//! the handle of the most recent scan so that starting a new one cancels the
//! old one.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use futures::{FutureExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::codec::RowCodec;
use crate::error::{Error, Result};
use crate::statements::StatementCache;
use crate::store::{CqlValue, PagingToken, Row, StoreError, StoreSession};
use crate::types::{
    EventTableConfig, PartitionNr, PersistenceId, SeqRange, SnapshotTableConfig, StoredEntity,
    TableConfig,
};

// =============================================================================
// Configuration
// =============================================================================

/// Default capacity of the channel between a scan's producer and its consumer.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Scan tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScanConfig {
    /// Decoded rows that may wait in the channel before the producer suspends.
    pub channel_capacity: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

// =============================================================================
// Partition Arithmetic
// =============================================================================

/// The partitions a scan of `range` visits, in increasing order.
///
/// `max(0, partition_of(from) - 1) ..= partition_of(to)`. Produced lazily: a
/// range near `i64::MAX` with a small partition size covers more partitions
/// than fit in memory.
pub fn partitions_for(
    range: &SeqRange,
    partition_size: u64,
) -> impl DoubleEndedIterator<Item = PartitionNr> + Clone {
    let first = range.from().partition(partition_size).previous();
    let last = range.to().partition(partition_size);
    (first.as_raw()..=last.as_raw()).map(PartitionNr::from_raw)
}

// =============================================================================
// Paged Result
// =============================================================================

/// One executed select and its server-side cursor.
///
/// Rows already delivered by the store are served from the local buffer; only
/// when the buffer is empty and the store reported more pages is another round
/// trip made.
pub struct PagedResult<S: StoreSession> {
    session: Arc<S>,
    prepared: S::Prepared,
    values: Vec<CqlValue>,
    buffer: VecDeque<Row>,
    paging: Option<PagingToken>,
}

impl<S: StoreSession> PagedResult<S> {
    /// Executes `prepared` and buffers the first page.
    pub async fn execute(
        session: Arc<S>,
        prepared: S::Prepared,
        values: Vec<CqlValue>,
    ) -> std::result::Result<Self, StoreError> {
        let page = session.execute_page(&prepared, &values, None).await?;
        Ok(Self {
            session,
            prepared,
            values,
            buffer: page.rows.into(),
            paging: page.paging,
        })
    }

    /// Rows that can be taken without another round trip.
    pub fn available_without_fetching(&self) -> usize {
        self.buffer.len()
    }

    /// Whether the store has no further pages for this result.
    pub fn is_fully_fetched(&self) -> bool {
        self.paging.is_none()
    }

    /// Fetches the next page into the buffer. A no-op once fully fetched.
    pub async fn fetch_more(&mut self) -> std::result::Result<(), StoreError> {
        let Some(token) = self.paging.take() else {
            return Ok(());
        };
        let page = self
            .session
            .execute_page(&self.prepared, &self.values, Some(token))
            .await?;
        self.buffer.extend(page.rows);
        self.paging = page.paging;
        Ok(())
    }

    /// Takes one buffered row.
    pub fn one(&mut self) -> Option<Row> {
        self.buffer.pop_front()
    }

    /// The next row, fetching more pages as needed. `None` once exhausted.
    pub async fn next_row(&mut self) -> std::result::Result<Option<Row>, StoreError> {
        loop {
            if let Some(row) = self.one() {
                return Ok(Some(row));
            }
            if self.is_fully_fetched() {
                return Ok(None);
            }
            debug!("fetching next page");
            self.fetch_more().await?;
        }
    }
}

// =============================================================================
// Range Scanner
// =============================================================================

type Sender = mpsc::Sender<Result<StoredEntity>>;

/// Starts scans against one store session.
pub struct RangeScanner<S: StoreSession> {
    session: Arc<S>,
    statements: Arc<StatementCache<S>>,
    config: ScanConfig,
}

impl<S: StoreSession> Clone for RangeScanner<S> {
    fn clone(&self) -> Self {
        Self {
            session: Arc::clone(&self.session),
            statements: Arc::clone(&self.statements),
            config: self.config,
        }
    }
}

impl<S: StoreSession> RangeScanner<S> {
    pub fn new(session: Arc<S>, statements: Arc<StatementCache<S>>, config: ScanConfig) -> Self {
        Self {
            session,
            statements,
            config,
        }
    }

    /// Scans `range` of `persistence_id` in `table`, dispatching on the table
    /// variant.
    ///
    /// Spawns the producer on the current Tokio runtime; panics outside one.
    pub fn scan(
        &self,
        persistence_id: PersistenceId,
        range: SeqRange,
        table: &TableConfig,
        codec: RowCodec,
    ) -> EntityStream {
        match table {
            TableConfig::Event(config) => {
                self.scan_events(persistence_id, range, Arc::new(config.clone()), codec)
            }
            TableConfig::Snapshot(config) => {
                self.scan_snapshots(persistence_id, range, Arc::new(config.clone()), codec)
            }
        }
    }

    /// Partition-by-partition scan of an event table.
    pub fn scan_events(
        &self,
        persistence_id: PersistenceId,
        range: SeqRange,
        table: Arc<EventTableConfig>,
        codec: RowCodec,
    ) -> EntityStream {
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let scanner = self.clone();
        let task = tokio::spawn(async move {
            let outcome = AssertUnwindSafe(
                scanner.produce_events(&persistence_id, range, &table, &codec, &tx),
            )
            .catch_unwind()
            .await;
            finish(outcome, &table.table_name, &tx).await;
        });
        EntityStream::new(rx, task.abort_handle())
    }

    /// Single-query scan of a snapshot table.
    pub fn scan_snapshots(
        &self,
        persistence_id: PersistenceId,
        range: SeqRange,
        table: Arc<SnapshotTableConfig>,
        codec: RowCodec,
    ) -> EntityStream {
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let scanner = self.clone();
        let task = tokio::spawn(async move {
            let outcome = AssertUnwindSafe(
                scanner.produce_snapshots(&persistence_id, range, &table, &codec, &tx),
            )
            .catch_unwind()
            .await;
            finish(outcome, &table.table_name, &tx).await;
        });
        EntityStream::new(rx, task.abort_handle())
    }

    async fn produce_events(
        &self,
        persistence_id: &PersistenceId,
        range: SeqRange,
        table: &Arc<EventTableConfig>,
        codec: &RowCodec,
        tx: &Sender,
    ) -> Result<()> {
        let statements = self
            .statements
            .statements_for(&TableConfig::Event((**table).clone()))
            .await?;

        for partition in partitions_for(&range, table.partition_size) {
            debug!(
                persistence_id = %persistence_id,
                table = %table.table_name,
                partition = partition.as_raw(),
                "scanning partition"
            );
            let values = vec![
                CqlValue::Text(persistence_id.as_str().to_string()),
                CqlValue::BigInt(partition.as_raw() as i64),
                CqlValue::BigInt(range.from().as_raw() as i64),
                CqlValue::BigInt(range.to().as_raw() as i64),
            ];
            let mut result =
                PagedResult::execute(Arc::clone(&self.session), statements.select.clone(), values)
                    .await
                    .map_err(|source| query_error(&table.table_name, source))?;

            while let Some(row) = result
                .next_row()
                .await
                .map_err(|source| query_error(&table.table_name, source))?
            {
                let entity = codec
                    .decode_event(&row, persistence_id, table)
                    .map(StoredEntity::Event)
                    .inspect_err(|e| warn!(error = %e, "decode failed, ending scan"))?;
                if tx.send(Ok(entity)).await.is_err() {
                    debug!(persistence_id = %persistence_id, "consumer gone, stopping scan");
                    return Ok(());
                }
            }
            // Empty partitions complete without suspending.
            tokio::task::yield_now().await;
        }
        Ok(())
    }

    async fn produce_snapshots(
        &self,
        persistence_id: &PersistenceId,
        range: SeqRange,
        table: &Arc<SnapshotTableConfig>,
        codec: &RowCodec,
        tx: &Sender,
    ) -> Result<()> {
        let statements = self
            .statements
            .statements_for(&TableConfig::Snapshot((**table).clone()))
            .await?;

        debug!(
            persistence_id = %persistence_id,
            table = %table.table_name,
            "scanning snapshots"
        );
        let values = vec![
            CqlValue::Text(persistence_id.as_str().to_string()),
            CqlValue::BigInt(range.from().as_raw() as i64),
            CqlValue::BigInt(range.to().as_raw() as i64),
        ];
        let mut result =
            PagedResult::execute(Arc::clone(&self.session), statements.select.clone(), values)
                .await
                .map_err(|source| query_error(&table.table_name, source))?;

        while let Some(row) = result
            .next_row()
            .await
            .map_err(|source| query_error(&table.table_name, source))?
        {
            let entity = codec
                .decode_snapshot(&row, persistence_id, table)
                .map(StoredEntity::Snapshot)
                .inspect_err(|e| warn!(error = %e, "decode failed, ending scan"))?;
            if tx.send(Ok(entity)).await.is_err() {
                debug!(persistence_id = %persistence_id, "consumer gone, stopping scan");
                return Ok(());
            }
        }
        Ok(())
    }
}

fn query_error(table: &str, source: StoreError) -> Error {
    Error::Query {
        table: table.to_string(),
        source,
    }
}

/// Ends a producer: a failure or a panic becomes the stream's final item.
async fn finish(outcome: std::thread::Result<Result<()>>, table: &str, tx: &Sender) {
    let result = outcome.unwrap_or_else(|panic| {
        let reason = panic_message(panic.as_ref());
        warn!(table, reason = %reason, "scan producer panicked");
        Err(Error::ScanAborted {
            table: table.to_string(),
            reason,
        })
    });
    if let Err(error) = result {
        // The consumer may already be gone; nobody is left to tell.
        let _ = tx.send(Err(error)).await;
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "producer panicked".to_string()
    }
}

// =============================================================================
// Entity Stream
// =============================================================================

/// Cancels a running scan from anywhere. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ScanHandle {
    cancelled: Arc<AtomicBool>,
    task: AbortHandle,
}

impl ScanHandle {
    /// Stops the producer and ends the stream. Idempotent.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            debug!("scan cancelled");
        }
        self.task.abort();
    }

    /// Whether [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Whether the producer has stopped (finished, failed, or aborted).
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// The ordered, finite result of one scan.
///
/// Yields `Ok` entities in partition order, then ends. A failure is delivered
/// as a final `Err` item after every row emitted before it. After
/// cancellation the stream ends without further items.
///
/// # Usage
///
/// ```rust,ignore
/// use futures::StreamExt;
///
/// let mut rows = service.select("user-1", 1, 100, &table)?;
/// while let Some(row) = rows.next().await {
///     let entity = row?;
///     println!("{} {}", entity.seq_nr(), entity.payload());
/// }
/// ```
pub struct EntityStream {
    rx: mpsc::Receiver<Result<StoredEntity>>,
    handle: ScanHandle,
}

impl EntityStream {
    fn new(rx: mpsc::Receiver<Result<StoredEntity>>, task: AbortHandle) -> Self {
        Self {
            rx,
            handle: ScanHandle {
                cancelled: Arc::new(AtomicBool::new(false)),
                task,
            },
        }
    }

    /// Receives the next item. `None` once the scan has ended.
    pub async fn recv(&mut self) -> Option<Result<StoredEntity>> {
        self.next().await
    }

    /// Drains the stream, stopping at the first failure.
    pub async fn collect_all(mut self) -> Result<Vec<StoredEntity>> {
        let mut entities = Vec::new();
        while let Some(item) = self.recv().await {
            entities.push(item?);
        }
        Ok(entities)
    }

    /// Stops the scan. Items still buffered are discarded.
    pub fn cancel(&mut self) {
        self.handle.cancel();
        self.rx.close();
    }

    /// A handle that can cancel this scan from elsewhere.
    pub fn handle(&self) -> ScanHandle {
        self.handle.clone()
    }

    /// Items currently waiting in the channel.
    pub fn buffered(&self) -> usize {
        self.rx.len()
    }
}

impl Stream for EntityStream {
    type Item = Result<StoredEntity>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.handle.is_cancelled() {
            return Poll::Ready(None);
        }
        self.rx.poll_recv(cx)
    }
}

impl Drop for EntityStream {
    fn drop(&mut self) {
        self.handle.task.abort();
    }
}

impl std::fmt::Debug for EntityStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityStream")
            .field("buffered", &self.rx.len())
            .field("cancelled", &self.handle.is_cancelled())
            .finish()
    }
}

// =============================================================================
// Scan Slot
// =============================================================================

/// Holds the one scan that is allowed to feed a consumer.
///
/// Starting a scan through the slot cancels whichever scan it held before, so
/// two producers never feed the same view.
#[derive(Debug, Default)]
pub struct ScanSlot {
    current: Mutex<Option<ScanHandle>>,
}

impl ScanSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `stream` as the current scan, cancelling the previous one.
    pub fn start(&self, stream: EntityStream) -> EntityStream {
        let previous = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(stream.handle());
        if let Some(previous) = previous {
            previous.cancel();
        }
        stream
    }

    /// Cancels the current scan, if any.
    pub fn cancel(&self) {
        let current = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(current) = current {
            current.cancel();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
