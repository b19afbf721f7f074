//! # Viewer Configuration
//!
//! Loaded once at startup from JSON:
//!
//! ```json
//! {
//!   "contactPoints": ["127.0.0.1:9042"],
//!   "messages":  [{ "tableName": "akka.messages",  "schemaId": "json", "partitionSize": 5000000 }],
//!   "snapshots": [{ "tableName": "akka.snapshots", "schemaId": "json" }],
//!   "scan": { "channelCapacity": 64 }
//! }
//! ```
//!
//! The whole document may also be nested under an `"eventViewer"` key.
//! Deserializing only checks shape; [`ViewerConfig::validate`] enforces the
//! rules the access layer depends on before anything touches the store.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::CodecRegistry;
use crate::error::{Error, Result};
use crate::scanner::ScanConfig;
use crate::schema::validate_table_name;
use crate::types::TableConfigs;

/// Key under which the configuration may be nested.
pub const ROOT_KEY: &str = "eventViewer";

/// Everything needed to open an [`EventStoreService`](crate::EventStoreService).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewerConfig {
    /// Store nodes as `host:port`.
    #[serde(default)]
    pub contact_points: Vec<String>,

    /// Event and snapshot table descriptors.
    #[serde(flatten)]
    pub tables: TableConfigs,

    /// Scan tuning.
    #[serde(default)]
    pub scan: ScanConfig,
}

impl ViewerConfig {
    /// Parses a JSON document.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let mut document: Value = serde_json::from_str(text)
            .map_err(|e| Error::Configuration(format!("invalid configuration json: {}", e)))?;
        if let Some(nested) = document.get_mut(ROOT_KEY) {
            document = nested.take();
        }
        serde_json::from_value(document)
            .map_err(|e| Error::Configuration(format!("invalid configuration: {}", e)))
    }

    /// Reads and parses a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&text)
    }

    /// Checks the table descriptors against the access layer's requirements.
    ///
    /// # Errors
    ///
    /// [`Error::Configuration`] when no table is configured, a partition size
    /// is zero, a table name is not a plain CQL identifier, or a schema id is
    /// not registered in `codecs`.
    pub fn validate(&self, codecs: &CodecRegistry) -> Result<()> {
        validate_tables(&self.tables, codecs)?;
        if self.scan.channel_capacity == 0 {
            return Err(Error::Configuration(
                "scan.channelCapacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Table rules shared by [`ViewerConfig::validate`] and service construction.
pub fn validate_tables(tables: &TableConfigs, codecs: &CodecRegistry) -> Result<()> {
    tables.first()?;

    for table in &tables.messages {
        if table.partition_size == 0 {
            return Err(Error::Configuration(format!(
                "partitionSize of table '{}' must be greater than 0",
                table.table_name
            )));
        }
    }
    for table in tables.all() {
        validate_table_name(table.table_name())?;
        codecs.resolve(table.schema_id())?;
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
