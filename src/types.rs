//! # Domain Types for Eventscope
//!
//! This module defines the vocabulary of the access layer: stream identity,
//! sequence and partition numbers, table descriptors, and the entities produced
//! by a scan.
//!
//! ## Newtypes for Safety
//!
//! [`SeqNr`] and [`PartitionNr`] are both 64-bit integers in the store, but mixing
//! them up is exactly the kind of bug that makes a scan silently skip a partition.
//! Wrapping them in single-field structs makes the compiler catch it.
//!
//! ## Closed Variants
//!
//! A table is either an event table or a snapshot table, and an entity is read
//! from exactly one of them. Both are modelled as two-variant enums so that key
//! binding and partition arithmetic are decided by exhaustive `match` in one place
//! per concern.
//!
//! ## Partition Addressing
//!
//! For partition size `P`, sequence number `s` lives in partition `(s - 1) / P`.
//! Partitions are zero-based and contiguous per persistence id.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

use crate::codec::Payload;
use crate::error::{Error, Result};

// =============================================================================
// Stream Identification
// =============================================================================

/// The logical stream (aggregate) identifier rows are grouped under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PersistenceId(String);

impl PersistenceId {
    /// Creates a persistence id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PersistenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PersistenceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for PersistenceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// =============================================================================
// Sequence and Partition Numbers
// =============================================================================

/// Monotonically increasing per-stream row ordinal. Starts at 1.
///
/// Stored as a CQL `bigint`, so values above `i64::MAX` cannot be bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeqNr(u64);

impl SeqNr {
    /// The first sequence number of every stream.
    pub const FIRST: SeqNr = SeqNr(1);

    /// Creates a sequence number from a raw value.
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    pub fn as_raw(&self) -> u64 {
        self.0
    }

    /// Returns the partition this sequence number belongs to.
    ///
    /// `partition_size` must be non-zero; [`EventTableConfig`] validation
    /// guarantees that for configured tables.
    pub fn partition(&self, partition_size: u64) -> PartitionNr {
        PartitionNr(self.0.saturating_sub(1) / partition_size)
    }
}

impl fmt::Display for SeqNr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Zero-based physical partition of an event table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionNr(u64);

impl PartitionNr {
    /// The first partition of every stream.
    pub const ZERO: PartitionNr = PartitionNr(0);

    /// Creates a partition number from a raw value.
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    pub fn as_raw(&self) -> u64 {
        self.0
    }

    /// The partition immediately before this one, clamped at zero.
    pub fn previous(&self) -> PartitionNr {
        PartitionNr(self.0.saturating_sub(1))
    }
}

impl fmt::Display for PartitionNr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An inclusive sequence-number range with `1 <= from <= to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeqRange {
    from: SeqNr,
    to: SeqNr,
}

impl SeqRange {
    /// Validates and creates a range.
    ///
    /// Both bounds must also fit a CQL `bigint`.
    pub fn new(from: u64, to: u64) -> Result<Self> {
        if from == 0 || from > to || to > i64::MAX as u64 {
            return Err(Error::InvalidRange { from, to });
        }
        Ok(Self {
            from: SeqNr(from),
            to: SeqNr(to),
        })
    }

    /// Lower bound (inclusive).
    pub fn from(&self) -> SeqNr {
        self.from
    }

    /// Upper bound (inclusive).
    pub fn to(&self) -> SeqNr {
        self.to
    }

    /// Whether `seq_nr` lies inside the range.
    pub fn contains(&self, seq_nr: SeqNr) -> bool {
        self.from <= seq_nr && seq_nr <= self.to
    }
}

// =============================================================================
// Table Descriptors
// =============================================================================

/// Descriptor of an event ("messages") table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventTableConfig {
    /// Table name, optionally keyspace-qualified.
    pub table_name: String,
    /// Schema identifier resolved through the codec registry.
    pub schema_id: String,
    /// Number of sequence numbers per physical partition. Must be > 0.
    pub partition_size: u64,
}

impl EventTableConfig {
    /// Creates an event table descriptor.
    pub fn new(table_name: impl Into<String>, schema_id: impl Into<String>, partition_size: u64) -> Self {
        Self {
            table_name: table_name.into(),
            schema_id: schema_id.into(),
            partition_size,
        }
    }

    /// Partition holding `seq_nr` in this table.
    pub fn partition_of(&self, seq_nr: SeqNr) -> PartitionNr {
        seq_nr.partition(self.partition_size)
    }
}

/// Descriptor of a snapshot table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotTableConfig {
    /// Table name, optionally keyspace-qualified.
    pub table_name: String,
    /// Schema identifier resolved through the codec registry.
    pub schema_id: String,
}

impl SnapshotTableConfig {
    /// Creates a snapshot table descriptor.
    pub fn new(table_name: impl Into<String>, schema_id: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            schema_id: schema_id.into(),
        }
    }
}

/// One physical table. Immutable; used by value as the statement-cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TableConfig {
    /// Partitioned event rows.
    Event(EventTableConfig),
    /// Unpartitioned snapshot rows.
    Snapshot(SnapshotTableConfig),
}

impl TableConfig {
    /// Table name as configured.
    pub fn table_name(&self) -> &str {
        match self {
            TableConfig::Event(c) => &c.table_name,
            TableConfig::Snapshot(c) => &c.table_name,
        }
    }

    /// Schema identifier of the payload column.
    pub fn schema_id(&self) -> &str {
        match self {
            TableConfig::Event(c) => &c.schema_id,
            TableConfig::Snapshot(c) => &c.schema_id,
        }
    }

    /// Partition size for event tables, `None` for snapshot tables.
    pub fn partition_size(&self) -> Option<u64> {
        match self {
            TableConfig::Event(c) => Some(c.partition_size),
            TableConfig::Snapshot(_) => None,
        }
    }
}

impl From<EventTableConfig> for TableConfig {
    fn from(config: EventTableConfig) -> Self {
        TableConfig::Event(config)
    }
}

impl From<SnapshotTableConfig> for TableConfig {
    fn from(config: SnapshotTableConfig) -> Self {
        TableConfig::Snapshot(config)
    }
}

/// Every table the operator can browse.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableConfigs {
    /// Event tables.
    #[serde(default)]
    pub messages: Vec<EventTableConfig>,
    /// Snapshot tables.
    #[serde(default)]
    pub snapshots: Vec<SnapshotTableConfig>,
}

impl TableConfigs {
    /// The table selected when nothing else is chosen: the first event table,
    /// else the first snapshot table.
    pub fn first(&self) -> Result<TableConfig> {
        self.messages
            .first()
            .cloned()
            .map(TableConfig::Event)
            .or_else(|| self.snapshots.first().cloned().map(TableConfig::Snapshot))
            .ok_or_else(|| Error::Configuration("there should be a config for a table".to_string()))
    }

    /// All tables, event tables first.
    pub fn all(&self) -> Vec<TableConfig> {
        self.messages
            .iter()
            .cloned()
            .map(TableConfig::Event)
            .chain(self.snapshots.iter().cloned().map(TableConfig::Snapshot))
            .collect()
    }

    /// Looks a table up by name.
    pub fn find(&self, table_name: &str) -> Option<TableConfig> {
        self.all().into_iter().find(|c| c.table_name() == table_name)
    }

    /// Whether no table is configured.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.snapshots.is_empty()
    }
}

// =============================================================================
// Modification State
// =============================================================================

/// What the operator has done to a row since it was read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModificationState {
    /// Untouched, or edited back to an equal payload.
    #[default]
    Unchanged,
    /// Payload rewritten with a different value.
    Modified,
    /// Row removed from the store.
    Deleted,
}

/// A single-value broadcast register carrying a row's [`ModificationState`].
///
/// Cloning shares the register: every clone of an entity observes the same
/// state. Listeners get a [`watch::Receiver`] and are woken on every change.
///
/// Only callers that completed a store round trip should set it. `Deleted` is
/// terminal; a deleted row cannot become modified again.
#[derive(Debug, Clone)]
pub struct ModificationSignal {
    tx: Arc<watch::Sender<ModificationState>>,
}

impl ModificationSignal {
    /// Creates a register holding [`ModificationState::Unchanged`].
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ModificationState::Unchanged);
        Self { tx: Arc::new(tx) }
    }

    /// Current state.
    pub fn get(&self) -> ModificationState {
        *self.tx.borrow()
    }

    /// Publishes `state` to every listener.
    ///
    /// Returns `false` (and publishes nothing) if the row is already deleted.
    pub fn set(&self, state: ModificationState) -> bool {
        let mut accepted = false;
        self.tx.send_if_modified(|current| {
            if *current == ModificationState::Deleted {
                return false;
            }
            accepted = true;
            let changed = *current != state;
            *current = state;
            changed
        });
        accepted
    }

    /// Registers a listener.
    pub fn subscribe(&self) -> watch::Receiver<ModificationState> {
        self.tx.subscribe()
    }
}

impl Default for ModificationSignal {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Stored Entities
// =============================================================================

/// One row of an event table.
///
/// The physical key used for mutation is
/// `(persistence_id, partition_nr, seq_nr, write_time, timebucket)`.
#[derive(Debug, Clone)]
pub struct EventEntity {
    pub persistence_id: PersistenceId,
    pub seq_nr: SeqNr,
    pub partition_nr: PartitionNr,
    /// The `timestamp` timeuuid clustering column.
    pub write_time: Uuid,
    pub timebucket: String,
    pub payload: Payload,
    pub config: Arc<EventTableConfig>,
    pub state: ModificationSignal,
}

/// One row of a snapshot table. Physical key: `(persistence_id, seq_nr)`.
#[derive(Debug, Clone)]
pub struct SnapshotEntity {
    pub persistence_id: PersistenceId,
    pub seq_nr: SeqNr,
    pub payload: Payload,
    pub config: Arc<SnapshotTableConfig>,
    pub state: ModificationSignal,
}

/// A row read under some [`TableConfig`].
#[derive(Debug, Clone)]
pub enum StoredEntity {
    Event(EventEntity),
    Snapshot(SnapshotEntity),
}

impl StoredEntity {
    pub fn persistence_id(&self) -> &PersistenceId {
        match self {
            StoredEntity::Event(e) => &e.persistence_id,
            StoredEntity::Snapshot(s) => &s.persistence_id,
        }
    }

    pub fn seq_nr(&self) -> SeqNr {
        match self {
            StoredEntity::Event(e) => e.seq_nr,
            StoredEntity::Snapshot(s) => s.seq_nr,
        }
    }

    pub fn payload(&self) -> &Payload {
        match self {
            StoredEntity::Event(e) => &e.payload,
            StoredEntity::Snapshot(s) => &s.payload,
        }
    }

    pub fn table_name(&self) -> &str {
        match self {
            StoredEntity::Event(e) => &e.config.table_name,
            StoredEntity::Snapshot(s) => &s.config.table_name,
        }
    }

    pub fn schema_id(&self) -> &str {
        match self {
            StoredEntity::Event(e) => &e.config.schema_id,
            StoredEntity::Snapshot(s) => &s.config.schema_id,
        }
    }

    /// The table descriptor this row was read under.
    pub fn config(&self) -> TableConfig {
        match self {
            StoredEntity::Event(e) => TableConfig::Event((*e.config).clone()),
            StoredEntity::Snapshot(s) => TableConfig::Snapshot((*s.config).clone()),
        }
    }

    /// The row's modification register.
    pub fn modification(&self) -> &ModificationSignal {
        match self {
            StoredEntity::Event(e) => &e.state,
            StoredEntity::Snapshot(s) => &s.state,
        }
    }

    /// Returns a new entity with the same physical key and a different payload.
    ///
    /// The new value gets its own, unchanged, modification register.
    pub fn with_payload(&self, payload: Payload) -> StoredEntity {
        match self {
            StoredEntity::Event(e) => StoredEntity::Event(EventEntity {
                payload,
                state: ModificationSignal::new(),
                ..e.clone()
            }),
            StoredEntity::Snapshot(s) => StoredEntity::Snapshot(SnapshotEntity {
                payload,
                state: ModificationSignal::new(),
                ..s.clone()
            }),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
