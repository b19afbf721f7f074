//! # Prepared Statement Cache
//!
//! Every table needs three prepared statements (range select, point update,
//! point delete). Preparing them costs a round trip to the store, so they are
//! prepared once per [`TableConfig`] and shared by every caller afterwards.
//!
//! ## Single-Flight Preparation
//!
//! ```text
//!   caller A ──┐                        ┌── Ok(Arc<Statements>) ──► A
//!   caller B ──┼──► entry(config) ──────┼── Ok(Arc<Statements>) ──► B
//!   caller C ──┘    one Shared future   └── Ok(Arc<Statements>) ──► C
//!                   (3 prepares, once)
//! ```
//!
//! The first caller for a config installs a [`Shared`] future; concurrent callers
//! clone and await the same future, so the store sees exactly one preparation
//! sequence. If preparation fails, every waiter receives the failure and the
//! entry is evicted, so the next call retries.
//!
//! The map lock is a plain `std::sync::Mutex`: it is only held to look up or
//! install an entry, never across an `.await`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::schema::{Statement, StatementKind};
use crate::store::{StoreError, StoreSession};
use crate::types::TableConfig;

// =============================================================================
// Statements
// =============================================================================

/// The three prepared statements of one table.
#[derive(Debug)]
pub struct Statements<P> {
    pub select: P,
    pub update: P,
    pub delete: P,
}

impl<P> Statements<P> {
    /// Prepares all three statements for `config`, concurrently.
    pub async fn prepare<S>(session: &S, config: &TableConfig) -> std::result::Result<Self, StoreError>
    where
        S: StoreSession<Prepared = P>,
    {
        let select = Statement::for_table(config, StatementKind::SelectRange);
        let update = Statement::for_table(config, StatementKind::Update);
        let delete = Statement::for_table(config, StatementKind::Delete);

        let (select, update, delete) = futures::try_join!(
            session.prepare(&select),
            session.prepare(&update),
            session.prepare(&delete),
        )?;

        Ok(Self {
            select,
            update,
            delete,
        })
    }
}

// =============================================================================
// Cache
// =============================================================================

type Preparation<P> = Shared<BoxFuture<'static, std::result::Result<Arc<Statements<P>>, StoreError>>>;

struct Entry<P> {
    generation: u64,
    preparation: Preparation<P>,
}

struct Entries<P> {
    by_config: HashMap<TableConfig, Entry<P>>,
    next_generation: u64,
}

/// Lazily prepares and memoizes [`Statements`] per [`TableConfig`].
pub struct StatementCache<S: StoreSession> {
    session: Arc<S>,
    entries: Mutex<Entries<S::Prepared>>,
}

impl<S: StoreSession> StatementCache<S> {
    /// Creates an empty cache over `session`.
    pub fn new(session: Arc<S>) -> Self {
        Self {
            session,
            entries: Mutex::new(Entries {
                by_config: HashMap::new(),
                next_generation: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Entries<S::Prepared>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the statements for `config`, preparing them on first use.
    ///
    /// # Errors
    ///
    /// [`Error::StatementPreparation`] if any of the three statements failed to
    /// prepare. The failure is not cached.
    pub async fn statements_for(&self, config: &TableConfig) -> Result<Arc<Statements<S::Prepared>>> {
        let (generation, preparation) = {
            let mut entries = self.lock();
            match entries.by_config.get(config) {
                Some(entry) => (entry.generation, entry.preparation.clone()),
                None => {
                    let generation = entries.next_generation;
                    entries.next_generation += 1;

                    let session = Arc::clone(&self.session);
                    let owned = config.clone();
                    let preparation = async move {
                        debug!(table = owned.table_name(), "preparing statements");
                        Statements::prepare(&*session, &owned).await.map(Arc::new)
                    }
                    .boxed()
                    .shared();

                    entries.by_config.insert(
                        config.clone(),
                        Entry {
                            generation,
                            preparation: preparation.clone(),
                        },
                    );
                    (generation, preparation)
                }
            }
        };

        match preparation.await {
            Ok(statements) => Ok(statements),
            Err(source) => {
                let mut entries = self.lock();
                let current = entries.by_config.get(config).map(|entry| entry.generation);
                if current == Some(generation) {
                    entries.by_config.remove(config);
                    warn!(table = config.table_name(), error = %source, "statement preparation failed");
                }
                Err(Error::StatementPreparation {
                    table: config.table_name().to_string(),
                    source,
                })
            }
        }
    }

    /// Number of tables with a (possibly in-flight) preparation.
    pub fn len(&self) -> usize {
        self.lock().by_config.len()
    }

    /// Whether nothing has been prepared yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// Tests
// =============================================================================
