//! # Point Mutations
//!
//! Updates and deletes address exactly one physical row, identified by the full
//! primary key the entity was read with:
//!
//! | Shape    | Key bound                                                      |
//! |----------|----------------------------------------------------------------|
//! | Event    | `persistence_id, partition_nr, sequence_nr, timestamp, timebucket` |
//! | Snapshot | `persistence_id, sequence_nr`                                  |
//!
//! Both are idempotent at the store: re-deleting a missing key and re-writing an
//! identical payload are no-ops. Neither touches the entity's modification
//! signal; that is the caller's job once the store has acknowledged the write.

use std::sync::Arc;

use tracing::info;

use crate::codec::{CodecRegistry, RowCodec};
use crate::error::{Error, MutationKind, Result};
use crate::statements::StatementCache;
use crate::store::{CqlValue, StoreError, StoreSession};
use crate::types::StoredEntity;

/// Executes single-row updates and deletes.
pub struct MutationExecutor<S: StoreSession> {
    session: Arc<S>,
    statements: Arc<StatementCache<S>>,
    codecs: Arc<CodecRegistry>,
}

impl<S: StoreSession> MutationExecutor<S> {
    pub fn new(session: Arc<S>, statements: Arc<StatementCache<S>>, codecs: Arc<CodecRegistry>) -> Self {
        Self {
            session,
            statements,
            codecs,
        }
    }

    /// Re-encodes the entity's payload and writes it over the row at its
    /// physical key.
    pub async fn update(&self, entity: &StoredEntity) -> Result<()> {
        let config = entity.config();
        let bytes = RowCodec::for_table(&config, &self.codecs)?.encode(entity.payload())?;
        let statements = self.statements.statements_for(&config).await?;

        let values = update_values(entity, bytes);
        self.session
            .execute(&statements.update, &values)
            .await
            .map_err(|source| mutation_error(MutationKind::Update, entity, source))?;

        info!(
            table = entity.table_name(),
            persistence_id = %entity.persistence_id(),
            seq_nr = entity.seq_nr().as_raw(),
            "row updated"
        );
        Ok(())
    }

    /// Removes the row at the entity's physical key.
    pub async fn delete(&self, entity: &StoredEntity) -> Result<()> {
        let statements = self.statements.statements_for(&entity.config()).await?;

        let values = key_values(entity);
        self.session
            .execute(&statements.delete, &values)
            .await
            .map_err(|source| mutation_error(MutationKind::Delete, entity, source))?;

        info!(
            table = entity.table_name(),
            persistence_id = %entity.persistence_id(),
            seq_nr = entity.seq_nr().as_raw(),
            "row deleted"
        );
        Ok(())
    }
}

fn mutation_error(kind: MutationKind, entity: &StoredEntity, source: StoreError) -> Error {
    Error::Mutation {
        kind,
        table: entity.table_name().to_string(),
        persistence_id: entity.persistence_id().to_string(),
        seq_nr: entity.seq_nr().as_raw(),
        source,
    }
}

// =============================================================================
// Key Binding
// =============================================================================
// Orders match the placeholders in `schema`.

/// `(payload, key...)`
fn update_values(entity: &StoredEntity, payload: Vec<u8>) -> Vec<CqlValue> {
    let mut values = Vec::with_capacity(6);
    values.push(CqlValue::Blob(payload));
    values.extend(key_values(entity));
    values
}

fn key_values(entity: &StoredEntity) -> Vec<CqlValue> {
    match entity {
        StoredEntity::Event(e) => vec![
            CqlValue::Text(e.persistence_id.as_str().to_string()),
            CqlValue::BigInt(e.partition_nr.as_raw() as i64),
            CqlValue::BigInt(e.seq_nr.as_raw() as i64),
            CqlValue::TimeUuid(e.write_time),
            CqlValue::Text(e.timebucket.clone()),
        ],
        StoredEntity::Snapshot(s) => vec![
            CqlValue::Text(s.persistence_id.as_str().to_string()),
            CqlValue::BigInt(s.seq_nr.as_raw() as i64),
        ],
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    use crate::codec::{JsonCodec, Payload};
    use crate::store::memory::EventRecord;
    use crate::store::MemoryStore;
    use crate::types::{
        EventEntity, EventTableConfig, ModificationSignal, PartitionNr, PersistenceId, SeqNr,
        SnapshotEntity, SnapshotTableConfig,
    };

    fn executor(store: &Arc<MemoryStore>) -> MutationExecutor<MemoryStore> {
        MutationExecutor::new(
            Arc::clone(store),
            Arc::new(StatementCache::new(Arc::clone(store))),
            Arc::new(CodecRegistry::new().with("json", JsonCodec::new())),
        )
    }

    fn overshooting_event(write_time: Uuid) -> StoredEntity {
        // seq 6 with P = 5 belongs in partition 1 but was written to partition 0.
        StoredEntity::Event(EventEntity {
            persistence_id: PersistenceId::new("p"),
            seq_nr: SeqNr::from_raw(6),
            partition_nr: PartitionNr::ZERO,
            write_time,
            timebucket: "0".to_string(),
            payload: Payload::new(json!({"v": 2})),
            config: Arc::new(EventTableConfig::new("messages", "json", 5)),
            state: ModificationSignal::new(),
        })
    }

    #[test]
    fn test_event_key_order() {
        let write_time = Uuid::new_v4();
        let values = update_values(&overshooting_event(write_time), vec![9]);
        assert_eq!(
            values,
            vec![
                CqlValue::Blob(vec![9]),
                CqlValue::Text("p".into()),
                CqlValue::BigInt(0),
                CqlValue::BigInt(6),
                CqlValue::TimeUuid(write_time),
                CqlValue::Text("0".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_update_uses_the_row_partition_not_the_computed_one() {
        let store = Arc::new(MemoryStore::new());
        let record = EventRecord::new("p", 0, 6, br#"{"v":1}"#.to_vec());
        let write_time = record.write_time;
        store.insert_event("messages", record);

        executor(&store).update(&overshooting_event(write_time)).await.unwrap();

        let rows = store.events("messages", "p");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].partition_nr, 0);
        assert_eq!(rows[0].event, br#"{"v":2}"#.to_vec());
    }

    #[tokio::test]
    async fn test_snapshot_delete_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        store.insert_snapshot("snapshots", "p", 3, b"{}".to_vec());
        let entity = StoredEntity::Snapshot(SnapshotEntity {
            persistence_id: PersistenceId::new("p"),
            seq_nr: SeqNr::from_raw(3),
            payload: Payload::new(json!({})),
            config: Arc::new(SnapshotTableConfig::new("snapshots", "json")),
            state: ModificationSignal::new(),
        });

        let executor = executor(&store);
        executor.delete(&entity).await.unwrap();
        executor.delete(&entity).await.unwrap();
        assert_eq!(store.snapshot_count("snapshots", "p"), 0);
    }

    #[tokio::test]
    async fn test_write_failure_names_the_row() {
        let store = Arc::new(MemoryStore::new());
        store.fail_next_mutations(1);

        let err = executor(&store)
            .delete(&overshooting_event(Uuid::new_v4()))
            .await
            .unwrap_err();
        match err {
            Error::Mutation {
                kind,
                persistence_id,
                seq_nr,
                ..
            } => {
                assert_eq!(kind, MutationKind::Delete);
                assert_eq!(persistence_id, "p");
                assert_eq!(seq_nr, 6);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
