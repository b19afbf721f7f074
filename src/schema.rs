//! # CQL Statements
//!
//! This module holds the text of every statement the access layer prepares, and
//! the [`Statement`] descriptor that travels with it to the store.
//!
//! ## Table Layouts
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │  event table ("messages")                                            │
//! │    PRIMARY KEY ((persistence_id, partition_nr),                      │
//! │                 sequence_nr, timestamp, timebucket)                  │
//! │    event blob                                                        │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  snapshot table                                                      │
//! │    PRIMARY KEY (persistence_id, sequence_nr)                         │
//! │    snapshot blob                                                     │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each shape needs three statements: a range select, a point update and a point
//! delete. Updates and deletes bind the complete primary key so they touch
//! exactly one row.
//!
//! ## Table Names
//!
//! Table names are interpolated into the CQL text (CQL cannot bind identifiers),
//! so [`validate_table_name`] restricts them to plain, optionally
//! keyspace-qualified identifiers.

use std::fmt;

use crate::types::TableConfig;
use crate::{Error, Result};

// =============================================================================
// Statement Descriptor
// =============================================================================

/// Physical layout a statement targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableShape {
    Event,
    Snapshot,
}

/// What a statement does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKind {
    /// `persistence_id = ? [AND partition_nr = ?] AND sequence_nr BETWEEN ? AND ?`
    SelectRange,
    /// Rewrites the payload column of one row.
    Update,
    /// Removes one row.
    Delete,
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatementKind::SelectRange => write!(f, "select"),
            StatementKind::Update => write!(f, "update"),
            StatementKind::Delete => write!(f, "delete"),
        }
    }
}

/// A statement ready to be prepared.
///
/// Carries the CQL text for native-protocol backends and the structured
/// description for backends that interpret statements directly.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Statement {
    pub table: String,
    pub shape: TableShape,
    pub kind: StatementKind,
    pub cql: String,
}

impl Statement {
    /// Builds the statement of `kind` for `config`.
    pub fn for_table(config: &TableConfig, kind: StatementKind) -> Self {
        let table = config.table_name();
        let (shape, cql) = match (config, kind) {
            (TableConfig::Event(_), StatementKind::SelectRange) => {
                (TableShape::Event, select_event_statement(table))
            }
            (TableConfig::Event(_), StatementKind::Update) => {
                (TableShape::Event, update_event_statement(table))
            }
            (TableConfig::Event(_), StatementKind::Delete) => {
                (TableShape::Event, delete_event_statement(table))
            }
            (TableConfig::Snapshot(_), StatementKind::SelectRange) => {
                (TableShape::Snapshot, select_snapshot_statement(table))
            }
            (TableConfig::Snapshot(_), StatementKind::Update) => {
                (TableShape::Snapshot, update_snapshot_statement(table))
            }
            (TableConfig::Snapshot(_), StatementKind::Delete) => {
                (TableShape::Snapshot, delete_snapshot_statement(table))
            }
        };
        Self {
            table: table.to_string(),
            shape,
            kind,
            cql,
        }
    }
}

// =============================================================================
// Event Table Statements
// =============================================================================
// Bind order is part of the contract with the scanner and the mutation
// executor; keep the placeholders in the order documented on each function.

/// Binds `(persistence_id, partition_nr, from, to)`.
pub fn select_event_statement(table: &str) -> String {
    format!(
        "SELECT persistence_id, partition_nr, sequence_nr, timestamp, timebucket, event \
         FROM {} WHERE persistence_id = ? AND partition_nr = ? \
         AND sequence_nr >= ? AND sequence_nr <= ?",
        table
    )
}

/// Binds `(event, persistence_id, partition_nr, sequence_nr, timestamp, timebucket)`.
pub fn update_event_statement(table: &str) -> String {
    format!(
        "UPDATE {} SET event = ? WHERE persistence_id = ? AND partition_nr = ? \
         AND sequence_nr = ? AND timestamp = ? AND timebucket = ?",
        table
    )
}

/// Binds `(persistence_id, partition_nr, sequence_nr, timestamp, timebucket)`.
pub fn delete_event_statement(table: &str) -> String {
    format!(
        "DELETE FROM {} WHERE persistence_id = ? AND partition_nr = ? \
         AND sequence_nr = ? AND timestamp = ? AND timebucket = ?",
        table
    )
}

// =============================================================================
// Snapshot Table Statements
// =============================================================================

/// Binds `(persistence_id, from, to)`.
pub fn select_snapshot_statement(table: &str) -> String {
    format!(
        "SELECT persistence_id, sequence_nr, snapshot FROM {} \
         WHERE persistence_id = ? AND sequence_nr >= ? AND sequence_nr <= ?",
        table
    )
}

/// Binds `(snapshot, persistence_id, sequence_nr)`.
pub fn update_snapshot_statement(table: &str) -> String {
    format!(
        "UPDATE {} SET snapshot = ? WHERE persistence_id = ? AND sequence_nr = ?",
        table
    )
}

/// Binds `(persistence_id, sequence_nr)`.
pub fn delete_snapshot_statement(table: &str) -> String {
    format!(
        "DELETE FROM {} WHERE persistence_id = ? AND sequence_nr = ?",
        table
    )
}

// =============================================================================
// Validation
// =============================================================================

/// Accepts `table` or `keyspace.table` where each part is an ASCII identifier
/// starting with a letter.
pub fn validate_table_name(name: &str) -> Result<()> {
    let parts: Vec<&str> = name.split('.').collect();
    let valid = parts.len() <= 2
        && parts.iter().all(|part| {
            let mut chars = part.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        });

    if valid {
        Ok(())
    } else {
        Err(Error::Configuration(format!("invalid table name '{}'", name)))
    }
}

// =============================================================================
// Tests
// =============================================================================
