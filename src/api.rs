//! # Event Store Service
//!
//! The façade the browsing and repair tools talk to. It owns the store session
//! and composes the pieces below it:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                        EventStoreService                            │
//! │                                                                     │
//! │   select() ──► RangeScanner ──┐                                     │
//! │                               ├──► StatementCache ──┐               │
//! │   update() ─┐                 │                     │               │
//! │   delete() ─┴► MutationExecutor                     ├──► StoreSession
//! │                                                     │               │
//! │   close() ──────────────────────────────────────────┘               │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Scans dispatch on the [`TableConfig`] variant; mutations dispatch on the
//! [`StoredEntity`] variant, which already carries its physical key.
//!
//! ## Modification State
//!
//! [`commit_edit`](EventStoreService::commit_edit) and
//! [`commit_delete`](EventStoreService::commit_delete) wrap the raw mutations
//! and publish the outcome on the entity's [`ModificationSignal`] only after
//! the store acknowledged the write. A failed mutation leaves the signal
//! untouched, so the same call can simply be retried.
//!
//! [`ModificationSignal`]: crate::types::ModificationSignal
//!
//! ## Lifecycle
//!
//! The service is `Clone`; clones share one session. [`close`](EventStoreService::close)
//! releases the session once. Every later call, including a second `close`,
//! fails with [`Error::Closed`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::codec::{CodecRegistry, Payload, RowCodec};
use crate::config::{validate_tables, ViewerConfig};
use crate::error::{Error, Result};
use crate::mutation::MutationExecutor;
use crate::scanner::{EntityStream, RangeScanner, ScanConfig};
use crate::statements::StatementCache;
use crate::store::StoreSession;
use crate::types::{ModificationState, PersistenceId, SeqRange, StoredEntity, TableConfig, TableConfigs};

/// Browse-and-repair access to one wide-column store.
///
/// # Example
///
/// ```rust,ignore
/// use futures::StreamExt;
/// use eventscope::{EventStoreService, MemoryStore, CodecRegistry, JsonCodec};
///
/// let service = EventStoreService::from_config(
///     Arc::new(MemoryStore::new()),
///     &config,
///     CodecRegistry::new().with("json", JsonCodec::new()),
/// )?;
///
/// let table = service.default_table()?;
/// let mut rows = service.select("user-1", 1, 100, &table)?;
/// while let Some(row) = rows.next().await {
///     let entity = row?;
///     let edited = service.parse_edit(&entity, r#"{"name": "fixed"}"#)?;
///     service.commit_edit(&entity, edited).await?;
/// }
///
/// service.close().await?;
/// ```
pub struct EventStoreService<S: StoreSession> {
    inner: Arc<Inner<S>>,
}

struct Inner<S: StoreSession> {
    session: Arc<S>,
    scanner: RangeScanner<S>,
    mutations: MutationExecutor<S>,
    codecs: Arc<CodecRegistry>,
    tables: TableConfigs,
    closed: AtomicBool,
}

impl<S: StoreSession> Clone for EventStoreService<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: StoreSession> EventStoreService<S> {
    /// Builds a service over an open session.
    ///
    /// # Errors
    ///
    /// [`Error::Configuration`] if `tables` is empty or invalid, or names a
    /// schema id `codecs` cannot resolve.
    pub fn new(session: Arc<S>, tables: TableConfigs, codecs: CodecRegistry, scan: ScanConfig) -> Result<Self> {
        validate_tables(&tables, &codecs)?;

        let codecs = Arc::new(codecs);
        let statements = Arc::new(StatementCache::new(Arc::clone(&session)));
        let scanner = RangeScanner::new(Arc::clone(&session), Arc::clone(&statements), scan);
        let mutations = MutationExecutor::new(Arc::clone(&session), statements, Arc::clone(&codecs));

        info!(
            event_tables = tables.messages.len(),
            snapshot_tables = tables.snapshots.len(),
            "event store service ready"
        );
        Ok(Self {
            inner: Arc::new(Inner {
                session,
                scanner,
                mutations,
                codecs,
                tables,
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Builds a service from a loaded configuration.
    pub fn from_config(session: Arc<S>, config: &ViewerConfig, codecs: CodecRegistry) -> Result<Self> {
        config.validate(&codecs)?;
        Self::new(session, config.tables.clone(), codecs, config.scan)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Streams rows `from..=to` of `persistence_id` from `table`.
    ///
    /// Returns immediately; rows arrive as the scan progresses. Must be called
    /// from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidRange`] unless `1 <= from <= to`; [`Error::Closed`]
    /// after [`close`](Self::close). Store and decode failures arrive as the
    /// stream's final item.
    pub fn select(
        &self,
        persistence_id: impl Into<PersistenceId>,
        from: u64,
        to: u64,
        table: &TableConfig,
    ) -> Result<EntityStream> {
        self.ensure_open()?;
        let range = SeqRange::new(from, to)?;
        let codec = RowCodec::for_table(table, &self.inner.codecs)?;
        Ok(self.inner.scanner.scan(persistence_id.into(), range, table, codec))
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Writes the entity's payload over its row.
    pub async fn update(&self, entity: &StoredEntity) -> Result<()> {
        self.ensure_open()?;
        self.inner.mutations.update(entity).await
    }

    /// Removes the entity's row.
    pub async fn delete(&self, entity: &StoredEntity) -> Result<()> {
        self.ensure_open()?;
        self.inner.mutations.delete(entity).await
    }

    /// Replaces the payload of `entity` with `payload`.
    ///
    /// On success, `entity`'s signal becomes `Modified` if the payload differs
    /// and `Unchanged` otherwise, and the edited entity is returned. The audit
    /// line is written only once the store acknowledged the write.
    pub async fn commit_edit(&self, entity: &StoredEntity, payload: Payload) -> Result<StoredEntity> {
        let edited = entity.with_payload(payload);
        self.update(&edited).await?;
        info!(
            table = entity.table_name(),
            persistence_id = %entity.persistence_id(),
            seq_nr = entity.seq_nr().as_raw(),
            "changing {} to {}",
            entity.payload().json(),
            edited.payload().json()
        );

        let state = if entity.payload() != edited.payload() {
            ModificationState::Modified
        } else {
            ModificationState::Unchanged
        };
        entity.modification().set(state);
        Ok(edited)
    }

    /// Deletes the entity's row and marks it `Deleted`.
    pub async fn commit_delete(&self, entity: &StoredEntity) -> Result<()> {
        self.delete(entity).await?;
        info!(
            table = entity.table_name(),
            persistence_id = %entity.persistence_id(),
            "deleting seq no. {} : {}",
            entity.seq_nr(),
            entity.payload().json()
        );
        entity.modification().set(ModificationState::Deleted);
        Ok(())
    }

    /// Parses an operator's JSON edit with the codec of the entity's table.
    pub fn parse_edit(&self, entity: &StoredEntity, text: &str) -> Result<Payload> {
        self.inner
            .codecs
            .resolve(entity.schema_id())?
            .parse_edit(text)
            .map_err(|e| Error::Encode {
                table: entity.table_name().to_string(),
                reason: e.0,
            })
    }

    /// The default payload of `table`'s schema.
    pub fn empty_payload(&self, table: &TableConfig) -> Result<Payload> {
        Ok(self.inner.codecs.resolve(table.schema_id())?.empty())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Every configured table.
    pub fn tables(&self) -> &TableConfigs {
        &self.inner.tables
    }

    /// The table to show first.
    pub fn default_table(&self) -> Result<TableConfig> {
        self.inner.tables.first()
    }

    /// The codec registry in use.
    pub fn codecs(&self) -> &CodecRegistry {
        &self.inner.codecs
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Releases the store session.
    ///
    /// # Errors
    ///
    /// [`Error::Closed`] if already closed; [`Error::Connection`] if the
    /// session failed to shut down (the service is closed regardless).
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        self.inner.session.close().await.map_err(Error::Connection)?;
        info!("event store service closed");
        Ok(())
    }
}

#[cfg(feature = "scylla")]
impl EventStoreService<crate::store::ScyllaStore> {
    /// Connects to the configured contact points and builds the service.
    pub async fn connect(config: &ViewerConfig, codecs: CodecRegistry) -> Result<Self> {
        config.validate(&codecs)?;
        let store = crate::store::ScyllaStore::connect(&config.contact_points)
            .await
            .map_err(Error::Connection)?;
        Self::new(Arc::new(store), config.tables.clone(), codecs, config.scan)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::codec::JsonCodec;
    use crate::store::memory::EventRecord;
    use crate::store::MemoryStore;
    use crate::types::{EventTableConfig, SnapshotTableConfig};

    fn tables() -> TableConfigs {
        TableConfigs {
            messages: vec![EventTableConfig::new("messages", "json", 10)],
            snapshots: vec![SnapshotTableConfig::new("snapshots", "json")],
        }
    }

    fn service(store: &Arc<MemoryStore>) -> EventStoreService<MemoryStore> {
        EventStoreService::new(
            Arc::clone(store),
            tables(),
            CodecRegistry::new().with("json", JsonCodec::new()),
            ScanConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_new_rejects_unusable_configuration() {
        let store = Arc::new(MemoryStore::new());
        let codecs = CodecRegistry::new().with("json", JsonCodec::new());
        assert!(matches!(
            EventStoreService::new(Arc::clone(&store), TableConfigs::default(), codecs, ScanConfig::default()),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            EventStoreService::new(store, tables(), CodecRegistry::new(), ScanConfig::default()),
            Err(Error::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_select_validates_range() {
        let store = Arc::new(MemoryStore::new());
        let service = service(&store);
        let table = service.default_table().unwrap();
        assert!(matches!(
            service.select("p", 0, 5, &table),
            Err(Error::InvalidRange { from: 0, to: 5 })
        ));
        assert!(matches!(
            service.select("p", 9, 5, &table),
            Err(Error::InvalidRange { .. })
        ));
    }

    #[tokio::test]
    async fn test_select_edit_and_reread() {
        let store = Arc::new(MemoryStore::new());
        store.insert_event("messages", EventRecord::new("p", 0, 1, br#"{"v":1}"#.to_vec()));
        let service = service(&store);
        let table = service.default_table().unwrap();

        let entities = service.select("p", 1, 1, &table).unwrap().collect_all().await.unwrap();
        let original = &entities[0];
        let payload = service.parse_edit(original, r#"{"v": 2}"#).unwrap();
        let edited = service.commit_edit(original, payload).await.unwrap();
        assert_eq!(original.modification().get(), ModificationState::Modified);
        assert_eq!(edited.modification().get(), ModificationState::Unchanged);

        let reread = service.select("p", 1, 1, &table).unwrap().collect_all().await.unwrap();
        assert_eq!(reread[0].payload().value(), &json!({"v": 2}));
    }

    #[tokio::test]
    async fn test_parse_edit_rejects_invalid_json() {
        let store = Arc::new(MemoryStore::new());
        store.insert_snapshot("snapshots", "p", 1, b"{}".to_vec());
        let service = service(&store);
        let table = TableConfig::Snapshot(SnapshotTableConfig::new("snapshots", "json"));

        let entities = service.select("p", 1, 1, &table).unwrap().collect_all().await.unwrap();
        assert!(matches!(
            service.parse_edit(&entities[0], "{oops"),
            Err(Error::Encode { .. })
        ));
        assert_eq!(service.empty_payload(&table).unwrap().value(), &json!({}));
    }

    #[tokio::test]
    async fn test_close_once() {
        let store = Arc::new(MemoryStore::new());
        let service = service(&store);
        let table = service.default_table().unwrap();

        service.close().await.unwrap();
        assert!(service.is_closed());
        assert!(matches!(service.close().await, Err(Error::Closed)));
        assert!(matches!(service.select("p", 1, 1, &table), Err(Error::Closed)));
    }
}
