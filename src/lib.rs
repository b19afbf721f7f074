//! # Eventscope - Partitioned Event/Snapshot Access Layer
//!
//! Eventscope lets an operator browse and repair event-sourced data kept in a
//! wide-column store (Cassandra, ScyllaDB), where every stream ("persistence id")
//! is sharded across fixed-size partitions and ordered by sequence number. It
//! provides:
//!
//! - **Range scans**: partition-aware, streamed under bounded memory, cancellable
//! - **Point repairs**: update or delete exactly one row by its physical key
//! - **Prepared statement reuse**: prepared once per table, shared by all callers
//! - **Modification tracking**: a per-row signal listeners can observe
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      EventStoreService                          │
//! │              (select, update, delete, close)                    │
//! └──────────────┬───────────────────────────────┬──────────────────┘
//!                │                               │
//!                ▼                               ▼
//! ┌──────────────────────────────┐ ┌──────────────────────────────┐
//! │        RangeScanner          │ │      MutationExecutor        │
//! │  partitions, paging, stream  │ │   exact physical-key binds   │
//! └──────────────┬───────────────┘ └──────────────┬───────────────┘
//!                │     ┌──────────────────┐       │
//!                ├────►│  StatementCache  │◄──────┤
//!                │     └────────┬─────────┘       │
//!                ▼              ▼                 ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    StoreSession (trait)                         │
//! │          MemoryStore  │  ScyllaStore (feature "scylla")         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Partition addressing**: seq `s` lives in partition `(s - 1) / P`
//! 2. **Widened scans**: a scan of `from..=to` also visits the partition before
//!    `from`'s, and never returns rows outside `from..=to`
//! 3. **Bounded memory**: a scan buffers at most its channel capacity plus one page
//! 4. **Single preparation**: each table's statements are prepared once, even
//!    under concurrent first use; failures are not cached
//! 5. **Confirmed state only**: a row's modification signal changes only after
//!    the store acknowledged the mutation
//!
//! ## Module Organization
//!
//! - [`error`]: Error enum and `Result` alias
//! - [`types`]: Identifiers, table descriptors, entities, modification signal
//! - [`codec`]: Payload codecs and row decoding
//! - [`schema`]: CQL statement text and table-name validation
//! - [`store`]: The store seam, the in-memory store and the native backend
//! - [`statements`]: Prepared statement cache
//! - [`scanner`]: Partitioned range scans and the entity stream
//! - [`mutation`]: Point updates and deletes
//! - [`api`]: The service façade (main entry point)
//! - [`config`]: JSON configuration and validation

// =============================================================================
// Module Declarations
// =============================================================================

/// Error types for access-layer operations.
pub mod error;

/// Domain types: identifiers, table descriptors, stored entities.
///
/// Uses the newtype pattern so sequence and partition numbers cannot be mixed up.
pub mod types;

/// Payload codecs and row decoding.
pub mod codec;

/// CQL statements for the event and snapshot table shapes.
pub mod schema;

/// The wide-column store seam and its implementations.
pub mod store;

/// Prepared statement cache with single-flight preparation.
pub mod statements;

/// Partitioned range scans.
///
/// Computes the partitions a range touches, drains them page by page, and
/// hands decoded rows to the consumer through a bounded channel.
pub mod scanner;

/// Exactly-addressed updates and deletes.
pub mod mutation;

/// The service façade.
///
/// The main entry point is [`EventStoreService`](api::EventStoreService).
pub mod api;

/// Configuration loading and validation.
pub mod config;

// =============================================================================
// Re-exports
// =============================================================================

pub use api::EventStoreService;
pub use codec::{CodecRegistry, JsonCodec, Payload, PayloadCodec, RawCodec, RowCodec};
pub use config::ViewerConfig;
pub use error::{Error, MutationKind, Result};
pub use scanner::{partitions_for, EntityStream, ScanConfig, ScanHandle, ScanSlot};
pub use statements::{StatementCache, Statements};
pub use store::{MemoryStore, StoreError, StoreSession};

#[cfg(feature = "scylla")]
pub use store::ScyllaStore;

pub use types::{
    EventEntity, EventTableConfig, ModificationSignal, ModificationState, PartitionNr,
    PersistenceId, SeqNr, SeqRange, SnapshotEntity, SnapshotTableConfig, StoredEntity,
    TableConfig, TableConfigs,
};
