//! # Native-Protocol Backend
//!
//! [`ScyllaStore`] speaks the CQL native protocol through the `scylla` driver and
//! works against both ScyllaDB and Cassandra clusters. Enabled with the `scylla`
//! cargo feature.
//!
//! Paging uses the driver's single-page execution: each call returns one page
//! plus the driver's paging state, which is carried back to the scanner as a
//! [`PagingToken`].
//!
//! `close` takes the driver session out of the store, so its connection pool is
//! torn down as soon as requests already in flight complete, even while the
//! scanner and mutation executor still share the store.


use async_trait::async_trait;
use ::scylla::client::session::Session;
use ::scylla::client::session_builder::SessionBuilder;
use ::scylla::response::{PagingState, PagingStateResponse};
use ::scylla::statement::prepared::PreparedStatement;
use ::scylla::value::{CqlTimeuuid, CqlValue as DriverValue, Row as DriverRow};
use tracing::{debug, info};
use uuid::Uuid;

use super::{CqlValue, Page, PagingToken, Row, SessionSlot, StoreError, StoreSession};
use crate::schema::Statement;

/// A session against a Cassandra-compatible cluster.
pub struct ScyllaStore {
    session: SessionSlot<Session>,
}

impl ScyllaStore {
    /// Connects to the cluster through the given contact points (`host:port`).
    pub async fn connect(contact_points: &[String]) -> Result<Self, StoreError> {
        if contact_points.is_empty() {
            return Err(StoreError::Unavailable("no contact points configured".to_string()));
        }
        let session = SessionBuilder::new()
            .known_nodes(contact_points)
            .build()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        info!(nodes = contact_points.len(), "connected to cluster");
        Ok(Self {
            session: SessionSlot::new(session),
        })
    }

    /// Whether the session has been released.
    pub fn is_closed(&self) -> bool {
        self.session.is_released()
    }
}

fn to_driver(value: &CqlValue) -> DriverValue {
    match value {
        CqlValue::Text(s) => DriverValue::Text(s.clone()),
        CqlValue::BigInt(n) => DriverValue::BigInt(*n),
        CqlValue::Blob(b) => DriverValue::Blob(b.clone()),
        CqlValue::TimeUuid(u) => DriverValue::Timeuuid(CqlTimeuuid::from(*u)),
    }
}

fn from_driver(value: DriverValue) -> Option<CqlValue> {
    match value {
        DriverValue::Text(s) | DriverValue::Ascii(s) => Some(CqlValue::Text(s)),
        DriverValue::BigInt(n) => Some(CqlValue::BigInt(n)),
        DriverValue::Blob(b) => Some(CqlValue::Blob(b)),
        DriverValue::Timeuuid(t) => Some(CqlValue::TimeUuid(Uuid::from(t))),
        DriverValue::Uuid(u) => Some(CqlValue::TimeUuid(u)),
        _ => None,
    }
}

#[async_trait]
impl StoreSession for ScyllaStore {
    type Prepared = PreparedStatement;

    async fn prepare(&self, statement: &Statement) -> Result<PreparedStatement, StoreError> {
        let session = self.session.get()?;
        debug!(table = %statement.table, kind = %statement.kind, "preparing statement");
        session
            .prepare(statement.cql.as_str())
            .await
            .map_err(|e| StoreError::Rejected(e.to_string()))
    }

    async fn execute_page(
        &self,
        prepared: &PreparedStatement,
        values: &[CqlValue],
        paging: Option<PagingToken>,
    ) -> Result<Page, StoreError> {
        let session = self.session.get()?;
        let bound: Vec<DriverValue> = values.iter().map(to_driver).collect();
        let paging_state = match paging {
            Some(token) => PagingState::new_from_raw_bytes(token.as_bytes()),
            None => PagingState::start(),
        };

        let (result, paging_response) = session
            .execute_single_page(prepared, &bound, paging_state)
            .await
            .map_err(|e| StoreError::Rejected(e.to_string()))?;

        let rows_result = result
            .into_rows_result()
            .map_err(|e| StoreError::Rejected(e.to_string()))?;
        let names: Vec<String> = rows_result
            .column_specs()
            .iter()
            .map(|spec| spec.name().to_string())
            .collect();

        let mut rows = Vec::new();
        for driver_row in rows_result
            .rows::<DriverRow>()
            .map_err(|e| StoreError::Rejected(e.to_string()))?
        {
            let driver_row = driver_row.map_err(|e| StoreError::Rejected(e.to_string()))?;
            let mut row = Row::new();
            for (name, value) in names.iter().zip(driver_row.columns) {
                if let Some(value) = value.and_then(from_driver) {
                    row.push(name.clone(), value);
                }
            }
            rows.push(row);
        }

        let paging = match paging_response {
            PagingStateResponse::HasMorePages { state } => state
                .as_bytes_slice()
                .map(|raw| PagingToken::new(raw.to_vec())),
            PagingStateResponse::NoMorePages => None,
        };

        Ok(Page { rows, paging })
    }

    async fn execute(&self, prepared: &PreparedStatement, values: &[CqlValue]) -> Result<(), StoreError> {
        let session = self.session.get()?;
        let bound: Vec<DriverValue> = values.iter().map(to_driver).collect();
        session
            .execute_unpaged(prepared, &bound)
            .await
            .map_err(|e| StoreError::Rejected(e.to_string()))?;
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        let in_flight = self.session.release()?;
        info!(in_flight, "session closed");
        Ok(())
    }
}
