//! # Payload Encoding and Decoding
//!
//! Event and snapshot payloads are opaque blobs in the store. This module turns
//! them into structured [`Payload`] values an operator can read and edit, and
//! back into bytes for writing.
//!
//! ## Schema Resolution
//!
//! Every table descriptor names a schema identifier. The [`CodecRegistry`] maps
//! that identifier to a [`PayloadCodec`]:
//!
//! ```text
//! schema_id ──► CodecRegistry ──► Arc<dyn PayloadCodec>
//!                                   ├── empty()      default payload
//!                                   ├── decode()     bytes  → Payload
//!                                   ├── encode()     Payload → bytes
//!                                   └── parse_edit() JSON text → Payload
//! ```
//!
//! An unknown identifier is a configuration error raised at startup.
//!
//! ## Row Decoding
//!
//! [`RowCodec`] combines a resolved codec with the column layout of the two
//! table shapes and produces [`StoredEntity`] values. A row that fails to decode
//! is an error; it is never skipped.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::Value;
use thiserror::Error;

use crate::error::{Error, Result};
use crate::store::Row;
use crate::types::{
    EventEntity, EventTableConfig, ModificationSignal, PartitionNr, PersistenceId, SeqNr,
    SnapshotEntity, SnapshotTableConfig, StoredEntity, TableConfig,
};

// =============================================================================
// Payload
// =============================================================================

/// A decoded payload.
///
/// Equality is structural, which is what decides whether an edit actually
/// modified a row.
#[derive(Debug, Clone, PartialEq)]
pub struct Payload(Value);

impl Payload {
    /// Wraps a structured value.
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// The structured value.
    pub fn value(&self) -> &Value {
        &self.0
    }

    /// Unwraps the structured value.
    pub fn into_value(self) -> Value {
        self.0
    }

    /// Multi-line JSON, for display and editing.
    pub fn pretty(&self) -> String {
        // Serializing a `Value` cannot fail.
        serde_json::to_string_pretty(&self.0).unwrap_or_default()
    }

    /// One-line JSON, for tables and log lines.
    pub fn json(&self) -> String {
        self.0.to_string()
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

// =============================================================================
// Codec Trait
// =============================================================================

/// A codec failure. Callers attach the table and row context.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct CodecError(pub String);

/// Converts between stored bytes and [`Payload`] for one schema.
pub trait PayloadCodec: Send + Sync + fmt::Debug {
    /// The default payload of this schema.
    fn empty(&self) -> Payload;

    /// Parses stored bytes.
    fn decode(&self, bytes: &[u8]) -> std::result::Result<Payload, CodecError>;

    /// Serializes a payload for storage.
    fn encode(&self, payload: &Payload) -> std::result::Result<Vec<u8>, CodecError>;

    /// Parses an operator's JSON edit into a payload valid for this schema.
    ///
    /// The default implementation accepts any JSON that [`encode`](Self::encode)
    /// can serialize.
    fn parse_edit(&self, text: &str) -> std::result::Result<Payload, CodecError> {
        let value: Value = serde_json::from_str(text).map_err(|e| CodecError(e.to_string()))?;
        let payload = Payload(value);
        self.encode(&payload)?;
        Ok(payload)
    }
}

/// Payloads stored as UTF-8 JSON documents.
#[derive(Debug, Clone)]
pub struct JsonCodec {
    default: Value,
}

impl JsonCodec {
    /// A JSON codec whose default payload is `{}`.
    pub fn new() -> Self {
        Self {
            default: Value::Object(Default::default()),
        }
    }

    /// A JSON codec with a schema-specific default payload.
    pub fn with_default(default: Value) -> Self {
        Self { default }
    }
}

impl Default for JsonCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl PayloadCodec for JsonCodec {
    fn empty(&self) -> Payload {
        Payload(self.default.clone())
    }

    fn decode(&self, bytes: &[u8]) -> std::result::Result<Payload, CodecError> {
        serde_json::from_slice(bytes)
            .map(Payload)
            .map_err(|e| CodecError(format!("invalid json payload: {}", e)))
    }

    fn encode(&self, payload: &Payload) -> std::result::Result<Vec<u8>, CodecError> {
        serde_json::to_vec(&payload.0).map_err(|e| CodecError(e.to_string()))
    }
}

/// Payloads without a known schema, presented as a base64 string.
#[derive(Debug, Clone, Default)]
pub struct RawCodec;

impl PayloadCodec for RawCodec {
    fn empty(&self) -> Payload {
        Payload(Value::String(String::new()))
    }

    fn decode(&self, bytes: &[u8]) -> std::result::Result<Payload, CodecError> {
        Ok(Payload(Value::String(BASE64.encode(bytes))))
    }

    fn encode(&self, payload: &Payload) -> std::result::Result<Vec<u8>, CodecError> {
        match &payload.0 {
            Value::String(s) => BASE64
                .decode(s)
                .map_err(|e| CodecError(format!("invalid base64 payload: {}", e))),
            other => Err(CodecError(format!(
                "raw payloads must be base64 strings, got {}",
                other
            ))),
        }
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Maps schema identifiers to codecs.
#[derive(Debug, Clone, Default)]
pub struct CodecRegistry {
    codecs: HashMap<String, Arc<dyn PayloadCodec>>,
}

impl CodecRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `codec` under `schema_id`, replacing any previous entry.
    pub fn register(&mut self, schema_id: impl Into<String>, codec: impl PayloadCodec + 'static) {
        self.codecs.insert(schema_id.into(), Arc::new(codec));
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, schema_id: impl Into<String>, codec: impl PayloadCodec + 'static) -> Self {
        self.register(schema_id, codec);
        self
    }

    /// Resolves a schema identifier.
    pub fn resolve(&self, schema_id: &str) -> Result<Arc<dyn PayloadCodec>> {
        self.codecs.get(schema_id).cloned().ok_or_else(|| {
            Error::Configuration(format!("unknown schema id '{}'", schema_id))
        })
    }

    /// Whether `schema_id` is registered.
    pub fn contains(&self, schema_id: &str) -> bool {
        self.codecs.contains_key(schema_id)
    }
}

// =============================================================================
// Row Codec
// =============================================================================

/// Column names of the event ("messages") table layout.
pub mod event_columns {
    pub const PERSISTENCE_ID: &str = "persistence_id";
    pub const PARTITION_NR: &str = "partition_nr";
    pub const SEQUENCE_NR: &str = "sequence_nr";
    pub const TIMESTAMP: &str = "timestamp";
    pub const TIMEBUCKET: &str = "timebucket";
    pub const EVENT: &str = "event";
}

/// Column names of the snapshot table layout.
pub mod snapshot_columns {
    pub const PERSISTENCE_ID: &str = "persistence_id";
    pub const SEQUENCE_NR: &str = "sequence_nr";
    pub const SNAPSHOT: &str = "snapshot";
}

/// Decodes raw rows of one table into entities and encodes payloads for it.
#[derive(Debug, Clone)]
pub struct RowCodec {
    table: TableConfig,
    codec: Arc<dyn PayloadCodec>,
}

impl RowCodec {
    /// Resolves the codec for `table` from `registry`.
    pub fn for_table(table: &TableConfig, registry: &CodecRegistry) -> Result<Self> {
        Ok(Self {
            table: table.clone(),
            codec: registry.resolve(table.schema_id())?,
        })
    }

    /// The payload codec in use.
    pub fn codec(&self) -> &Arc<dyn PayloadCodec> {
        &self.codec
    }

    /// Serializes a payload for this table.
    pub fn encode(&self, payload: &Payload) -> Result<Vec<u8>> {
        self.codec.encode(payload).map_err(|e| Error::Encode {
            table: self.table.table_name().to_string(),
            reason: e.0,
        })
    }

    fn decode_error(&self, seq_nr: Option<SeqNr>, reason: impl Into<String>) -> Error {
        Error::Decode {
            table: self.table.table_name().to_string(),
            seq_nr: seq_nr.map(|s| s.as_raw()),
            reason: reason.into(),
        }
    }

    fn non_negative(&self, seq_nr: Option<SeqNr>, column: &str, value: i64) -> Result<u64> {
        u64::try_from(value)
            .map_err(|_| self.decode_error(seq_nr, format!("negative {}: {}", column, value)))
    }

    /// Decodes one event row read for `persistence_id`.
    pub fn decode_event(
        &self,
        row: &Row,
        persistence_id: &PersistenceId,
        config: &Arc<EventTableConfig>,
    ) -> Result<EventEntity> {
        use event_columns::*;

        let seq_raw = row
            .bigint(SEQUENCE_NR)
            .map_err(|e| self.decode_error(None, e.to_string()))?;
        let seq_nr = SeqNr::from_raw(self.non_negative(None, SEQUENCE_NR, seq_raw)?);
        let at = Some(seq_nr);

        let partition_raw = row
            .bigint(PARTITION_NR)
            .map_err(|e| self.decode_error(at, e.to_string()))?;
        let partition_nr = PartitionNr::from_raw(self.non_negative(at, PARTITION_NR, partition_raw)?);
        let write_time = row
            .timeuuid(TIMESTAMP)
            .map_err(|e| self.decode_error(at, e.to_string()))?;
        let timebucket = row
            .text(TIMEBUCKET)
            .map_err(|e| self.decode_error(at, e.to_string()))?
            .to_string();
        let bytes = row
            .bytes(EVENT)
            .map_err(|e| self.decode_error(at, e.to_string()))?;
        let payload = self
            .codec
            .decode(bytes)
            .map_err(|e| self.decode_error(at, e.0))?;

        Ok(EventEntity {
            persistence_id: persistence_id.clone(),
            seq_nr,
            partition_nr,
            write_time,
            timebucket,
            payload,
            config: Arc::clone(config),
            state: ModificationSignal::new(),
        })
    }

    /// Decodes one snapshot row read for `persistence_id`.
    pub fn decode_snapshot(
        &self,
        row: &Row,
        persistence_id: &PersistenceId,
        config: &Arc<SnapshotTableConfig>,
    ) -> Result<SnapshotEntity> {
        use snapshot_columns::*;

        let seq_raw = row
            .bigint(SEQUENCE_NR)
            .map_err(|e| self.decode_error(None, e.to_string()))?;
        let seq_nr = SeqNr::from_raw(self.non_negative(None, SEQUENCE_NR, seq_raw)?);
        let bytes = row
            .bytes(SNAPSHOT)
            .map_err(|e| self.decode_error(Some(seq_nr), e.to_string()))?;
        let payload = self
            .codec
            .decode(bytes)
            .map_err(|e| self.decode_error(Some(seq_nr), e.0))?;

        Ok(SnapshotEntity {
            persistence_id: persistence_id.clone(),
            seq_nr,
            payload,
            config: Arc::clone(config),
            state: ModificationSignal::new(),
        })
    }

    /// Decodes a row of whichever shape this codec's table has.
    pub fn decode(&self, row: &Row, persistence_id: &PersistenceId) -> Result<StoredEntity> {
        match &self.table {
            TableConfig::Event(c) => self
                .decode_event(row, persistence_id, &Arc::new(c.clone()))
                .map(StoredEntity::Event),
            TableConfig::Snapshot(c) => self
                .decode_snapshot(row, persistence_id, &Arc::new(c.clone()))
                .map(StoredEntity::Snapshot),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
