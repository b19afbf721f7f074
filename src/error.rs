//! # Error Handling for Eventscope
//!
//! This module defines the error types used throughout the access layer. A single
//! error enum ([`Error`]) represents every failure a caller can observe, which keeps
//! signatures short and lets callers match on the failure category.
//!
//! ## Rust Pattern: thiserror
//!
//! We use the `thiserror` crate to derive `std::error::Error` implementations:
//! - `Display` comes from the `#[error(...)]` attributes
//! - source chaining comes from `#[source]`
//!
//! ## Error Categories
//!
//! | Category | Variants | Typical Response |
//! |----------|----------|------------------|
//! | Startup | `Configuration`, `Connection` | Fix config / cluster, restart |
//! | Preparation | `StatementPreparation` | Retry the operation later |
//! | Scan | `Query`, `ScanAborted`, `Decode`, `InvalidRange` | Report, keep rows already shown |
//! | Mutation | `Mutation`, `Encode` | Retry; the row state is untouched |
//! | Lifecycle | `Closed` | Programming error, stop using the service |
//!
//! Store-level failures are carried as [`StoreError`], which is `Clone` so that one
//! failed preparation can be handed to every task that was waiting on it.

use std::fmt;

use thiserror::Error;

use crate::store::StoreError;

// =============================================================================
// Mutation Kind
// =============================================================================

/// Which point mutation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    /// Payload rewrite keyed by the exact physical key.
    Update,
    /// Row removal keyed by the exact physical key.
    Delete,
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MutationKind::Update => write!(f, "update"),
            MutationKind::Delete => write!(f, "delete"),
        }
    }
}

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in access-layer operations.
///
/// # Example
///
/// ```rust,ignore
/// use eventscope::{Error, Result};
///
/// fn example() -> Result<()> {
///     let err = Error::InvalidRange { from: 10, to: 2 };
///     assert!(err.to_string().contains("10..=2"));
///     Ok(())
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Startup Errors (fatal, not retried)
    // =========================================================================

    /// No usable table descriptor, an unresolvable schema identifier, or an
    /// otherwise malformed configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The store session could not be established or torn down.
    #[error("connection error: {0}")]
    Connection(#[source] StoreError),

    // =========================================================================
    // Per-Operation Errors (surfaced to the caller that needed them)
    // =========================================================================

    /// Preparing the statements of one table failed.
    ///
    /// The failure is not cached: the next call for the same table retries.
    #[error("failed to prepare statements for table '{table}': {source}")]
    StatementPreparation {
        /// Table whose statements failed to prepare
        table: String,
        /// Underlying store failure
        #[source]
        source: StoreError,
    },

    /// A range query or a fetch-more round trip failed mid-scan.
    #[error("query against table '{table}' failed: {source}")]
    Query {
        /// Table being scanned
        table: String,
        /// Underlying store failure
        #[source]
        source: StoreError,
    },

    /// The scan's producer panicked, typically inside a payload codec.
    ///
    /// Delivered as the final item so the stream never ends as if complete.
    #[error("scan of table '{table}' aborted: {reason}")]
    ScanAborted {
        /// Table being scanned
        table: String,
        /// Panic message
        reason: String,
    },

    /// A row did not parse under the schema configured for its table.
    ///
    /// Terminates the scan that produced it; rows are never skipped silently.
    #[error("failed to decode row in table '{table}'{}: {reason}", fmt_seq(.seq_nr))]
    Decode {
        /// Table the row came from
        table: String,
        /// Sequence number, when it could be read before the failure
        seq_nr: Option<u64>,
        /// What went wrong
        reason: String,
    },

    /// A payload could not be serialized for writing back.
    #[error("failed to encode payload for table '{table}': {reason}")]
    Encode {
        /// Table the payload is destined for
        table: String,
        /// What went wrong
        reason: String,
    },

    /// An update or delete was rejected or timed out.
    ///
    /// The entity's modification signal is left unchanged so the same
    /// mutation can be retried safely.
    #[error("{kind} of '{persistence_id}' seq {seq_nr} in table '{table}' failed: {source}")]
    Mutation {
        /// Which mutation failed
        kind: MutationKind,
        /// Table being written
        table: String,
        /// Stream of the entity
        persistence_id: String,
        /// Sequence number of the entity
        seq_nr: u64,
        /// Underlying store failure
        #[source]
        source: StoreError,
    },

    /// A scan range that violates `1 <= from <= to`.
    #[error("invalid sequence range {from}..={to}: bounds must satisfy 1 <= from <= to")]
    InvalidRange {
        /// Lower bound as requested
        from: u64,
        /// Upper bound as requested
        to: u64,
    },

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// The service was closed; no further operations are accepted.
    #[error("event store service is closed")]
    Closed,
}

fn fmt_seq(seq_nr: &Option<u64>) -> String {
    match seq_nr {
        Some(seq) => format!(" at seq {}", seq),
        None => String::new(),
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================
