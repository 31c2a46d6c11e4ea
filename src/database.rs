//! The record registry.
//!
//! A [`Database`] maps record names to records under its own lock, which is
//! independent of every record lock: looking a name up never locks the
//! record. Most programs use the lazily created [`Database::master`]; tests
//! and embedders create private instances with [`Database::new`].

use std::sync::{Arc, OnceLock};

use indexmap::IndexMap;
use parking_lot::RwLock;
use tracing::debug;

use crate::config::DatabaseConfig;
use crate::error::{DatabaseError, DbResult};
use crate::record::Record;

#[derive(Default)]
struct Registry {
    records: IndexMap<String, Arc<Record>>,
    destroyed: bool,
}

/// Name to record map.
pub struct Database {
    config: DatabaseConfig,
    registry: RwLock<Registry>,
}

static MASTER: OnceLock<Arc<Database>> = OnceLock::new();

impl Database {
    /// Create an empty database.
    #[must_use]
    pub fn new(config: DatabaseConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry: RwLock::new(Registry::default()),
        })
    }

    /// The process-wide database, created with default configuration on first use.
    pub fn master() -> Arc<Self> {
        Arc::clone(MASTER.get_or_init(|| Self::new(DatabaseConfig::default())))
    }

    /// Configuration this database was created with.
    #[must_use]
    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Record registered under `name`.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<Arc<Record>> {
        self.registry.read().records.get(name).cloned()
    }

    /// Like [`Database::find`], as an error.
    ///
    /// # Errors
    ///
    /// `RecordNotFound` if no record has that name.
    pub fn require(&self, name: &str) -> DbResult<Arc<Record>> {
        self.find(name).ok_or_else(|| DatabaseError::RecordNotFound {
            name: name.to_string(),
        })
    }

    /// Register `record` under its name.
    ///
    /// Returns false if the name is taken or the database was destroyed.
    /// A record added at trace level 0 takes the configured default level.
    pub fn add(&self, record: Arc<Record>) -> bool {
        let mut registry = self.registry.write();
        if registry.destroyed || registry.records.contains_key(record.name()) {
            return false;
        }
        if record.trace_level() == 0 {
            record.set_trace_level(self.config.default_trace_level);
        }
        debug!(record = %record.name(), "add record");
        registry.records.insert(record.name().to_string(), record);
        true
    }

    /// Unregister `record`.
    ///
    /// Returns false unless this exact record is registered under its name.
    pub fn remove(&self, record: &Record) -> bool {
        let mut registry = self.registry.write();
        let registered = registry
            .records
            .get(record.name())
            .is_some_and(|r| std::ptr::eq(Arc::as_ptr(r), record));
        if !registered {
            return false;
        }
        debug!(record = %record.name(), "remove record");
        registry.records.shift_remove(record.name());
        true
    }

    /// Registered names in insertion order.
    #[must_use]
    pub fn list_names(&self) -> Vec<String> {
        self.registry.read().records.keys().cloned().collect()
    }

    /// Number of registered records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.registry.read().records.len()
    }

    /// True when no record is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registry.read().records.is_empty()
    }

    /// True once [`Database::destroy`] ran.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.registry.read().destroyed
    }

    /// Destroy every record and refuse further additions. Idempotent.
    ///
    /// Records are destroyed after the registry lock is released, so their
    /// clients may look the database up while detaching.
    pub fn destroy(&self) {
        let records = {
            let mut registry = self.registry.write();
            if registry.destroyed {
                return;
            }
            registry.destroyed = true;
            std::mem::take(&mut registry.records)
        };
        debug!(records = records.len(), "destroy database");
        for record in records.into_values() {
            record.destroy();
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.registry.read();
        f.debug_struct("Database")
            .field("records", &registry.records.len())
            .field("destroyed", &registry.destroyed)
            .finish_non_exhaustive()
    }
}
