//! # Wide-Column Store Seam
//!
//! Everything above this module talks to the store through [`StoreSession`]:
//! prepare a statement once, execute it with bound values, and page through
//! results using an explicit "more pages available" signal.
//!
//! ```text
//!   StatementCache ──prepare()──────┐
//!   Scanner ────────execute_page()──┼──► StoreSession ──► MemoryStore
//!   MutationExecutor ─execute()─────┘                 └─► ScyllaStore (feature "scylla")
//! ```
//!
//! ## Paging
//!
//! [`StoreSession::execute_page`] returns one server-side page. When
//! [`Page::paging`] is `Some`, more rows remain and the token must be passed back
//! to fetch them; when it is `None` the result is fully fetched.
//!
//! ## Concurrency
//!
//! A session is shared by every in-flight scan and mutation. Implementations
//! must be safe for concurrent use without external locking.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::schema::Statement;

pub mod memory;

#[cfg(feature = "scylla")]
pub mod native;

pub use memory::MemoryStore;
#[cfg(feature = "scylla")]
pub use native::ScyllaStore;

// =============================================================================
// Errors
// =============================================================================

/// A failure reported by the store or the driver.
///
/// `Clone` so that one failure can be delivered to several waiters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// No node could serve the request.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The request did not complete in time.
    #[error("request timed out: {0}")]
    Timeout(String),

    /// The store rejected the request (syntax, bind types, write failure).
    #[error("request rejected: {0}")]
    Rejected(String),

    /// The session has been closed.
    #[error("session closed")]
    Closed,
}

// =============================================================================
// Values and Rows
// =============================================================================

/// The CQL value types the access layer binds and reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CqlValue {
    Text(String),
    BigInt(i64),
    Blob(Vec<u8>),
    TimeUuid(Uuid),
}

impl CqlValue {
    fn type_name(&self) -> &'static str {
        match self {
            CqlValue::Text(_) => "text",
            CqlValue::BigInt(_) => "bigint",
            CqlValue::Blob(_) => "blob",
            CqlValue::TimeUuid(_) => "timeuuid",
        }
    }
}

impl fmt::Display for CqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CqlValue::Text(s) => write!(f, "'{}'", s),
            CqlValue::BigInt(n) => write!(f, "{}", n),
            CqlValue::Blob(b) => write!(f, "<{} bytes>", b.len()),
            CqlValue::TimeUuid(u) => write!(f, "{}", u),
        }
    }
}

/// Column access failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RowError {
    #[error("missing column '{0}'")]
    Missing(String),

    #[error("column '{column}' is {found}, expected {expected}")]
    Type {
        column: String,
        expected: &'static str,
        found: &'static str,
    },
}

/// One result row: column names with their non-null values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Row {
    columns: Vec<(String, CqlValue)>,
}

impl Row {
    /// An empty row.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`push`](Self::push).
    pub fn with(mut self, name: impl Into<String>, value: CqlValue) -> Self {
        self.push(name, value);
        self
    }

    /// Appends a column.
    pub fn push(&mut self, name: impl Into<String>, value: CqlValue) {
        self.columns.push((name.into(), value));
    }

    /// Raw column lookup.
    pub fn get(&self, name: &str) -> Option<&CqlValue> {
        self.columns.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    fn typed<'a, T>(
        &'a self,
        name: &str,
        expected: &'static str,
        extract: impl FnOnce(&'a CqlValue) -> Option<T>,
    ) -> Result<T, RowError> {
        let value = self
            .get(name)
            .ok_or_else(|| RowError::Missing(name.to_string()))?;
        extract(value).ok_or(RowError::Type {
            column: name.to_string(),
            expected,
            found: value.type_name(),
        })
    }

    pub fn text(&self, name: &str) -> Result<&str, RowError> {
        self.typed(name, "text", |v| match v {
            CqlValue::Text(s) => Some(s.as_str()),
            _ => None,
        })
    }

    pub fn bigint(&self, name: &str) -> Result<i64, RowError> {
        self.typed(name, "bigint", |v| match v {
            CqlValue::BigInt(n) => Some(*n),
            _ => None,
        })
    }

    pub fn bytes(&self, name: &str) -> Result<&[u8], RowError> {
        self.typed(name, "blob", |v| match v {
            CqlValue::Blob(b) => Some(b.as_slice()),
            _ => None,
        })
    }

    pub fn timeuuid(&self, name: &str) -> Result<Uuid, RowError> {
        self.typed(name, "timeuuid", |v| match v {
            CqlValue::TimeUuid(u) => Some(*u),
            _ => None,
        })
    }
}

// =============================================================================
// Paging
// =============================================================================

/// Opaque server-side paging state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagingToken(Vec<u8>);

impl PagingToken {
    pub fn new(raw: Vec<u8>) -> Self {
        Self(raw)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// One page of a result set.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub rows: Vec<Row>,
    /// `Some` while more rows remain server-side.
    pub paging: Option<PagingToken>,
}

impl Page {
    pub fn has_more_pages(&self) -> bool {
        self.paging.is_some()
    }
}

// =============================================================================
// Session Trait
// =============================================================================

/// An open session against a wide-column store.
///
/// Every method is a suspension point: it awaits a network round trip and
/// never blocks the calling thread.
#[async_trait]
pub trait StoreSession: Send + Sync + 'static {
    /// Backend-specific prepared statement handle.
    type Prepared: Clone + Send + Sync + 'static;

    /// Prepares a statement.
    async fn prepare(&self, statement: &Statement) -> Result<Self::Prepared, StoreError>;

    /// Executes a select and returns one page.
    ///
    /// Pass `None` for the first page and the previous page's token afterwards.
    async fn execute_page(
        &self,
        prepared: &Self::Prepared,
        values: &[CqlValue],
        paging: Option<PagingToken>,
    ) -> Result<Page, StoreError>;

    /// Executes an update or delete and awaits acknowledgment.
    async fn execute(&self, prepared: &Self::Prepared, values: &[CqlValue]) -> Result<(), StoreError>;

    /// Releases network resources. Later calls fail with [`StoreError::Closed`].
    async fn close(&self) -> Result<(), StoreError>;
}

// =============================================================================
// Session Slot
// =============================================================================

/// Owns a driver connection until it is released.
///
/// Requests borrow the connection through a cloned `Arc`; [`release`](Self::release)
/// takes the slot's reference, so the connection is dropped once the requests
/// already in flight complete, however many components still share the store.
#[cfg_attr(not(feature = "scylla"), allow(dead_code))]
pub(crate) struct SessionSlot<T> {
    inner: RwLock<Option<Arc<T>>>,
}

#[cfg_attr(not(feature = "scylla"), allow(dead_code))]
impl<T> SessionSlot<T> {
    pub(crate) fn new(connection: T) -> Self {
        Self {
            inner: RwLock::new(Some(Arc::new(connection))),
        }
    }

    /// The live connection, or [`StoreError::Closed`] after release.
    pub(crate) fn get(&self) -> Result<Arc<T>, StoreError> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(StoreError::Closed)
    }

    /// Drops the slot's reference. Returns how many requests still hold one.
    pub(crate) fn release(&self) -> Result<usize, StoreError> {
        let connection = self
            .inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(StoreError::Closed)?;
        Ok(Arc::strong_count(&connection) - 1)
    }

    pub(crate) fn is_released(&self) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

// =============================================================================
// Tests
// =============================================================================
