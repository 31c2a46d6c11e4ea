//! Built-in service records.
//!
//! Both records take an `argument.recordName`, act on that record when
//! processed and report the outcome in `result.status`.

use std::sync::{Arc, Weak};

use crate::data::{PvStructure, ScalarType, Structure, Value};
use crate::database::Database;
use crate::error::{DatabaseError, DbResult};
use crate::record::{Record, RecordGuard, RecordSupport, MAX_TRACE_LEVEL};

const SUCCESS: &str = "success";

fn register(database: &Arc<Database>, record: Arc<Record>) -> DbResult<Arc<Record>> {
    if database.add(Arc::clone(&record)) {
        Ok(record)
    } else {
        Err(DatabaseError::DuplicateRecord {
            name: record.name().to_string(),
        })
    }
}

fn database(weak: &Weak<Database>) -> DbResult<Arc<Database>> {
    weak.upgrade().ok_or_else(|| DatabaseError::Destroyed {
        what: "database".to_string(),
    })
}

/// Sets the trace level of another record.
///
/// Fields: `argument{recordName, level}`, `result{status}`.
#[derive(Debug)]
pub struct TraceRecord {
    database: Weak<Database>,
}

impl TraceRecord {
    /// Create the record and add it to `database`.
    ///
    /// # Errors
    ///
    /// `DuplicateRecord` if `name` is taken.
    pub fn create(name: &str, database: &Arc<Database>) -> DbResult<Arc<Record>> {
        let structure = Structure::builder()
            .add_nested("argument")
            .add("recordName", ScalarType::String)
            .add("level", ScalarType::Int)
            .end_nested()
            .add_nested("result")
            .add("status", ScalarType::String)
            .end_nested()
            .build();
        let support = Self {
            database: Arc::downgrade(database),
        };
        register(database, Record::with_support(name, PvStructure::from_structure(&structure), support))
    }
}

impl RecordSupport for TraceRecord {
    fn process(&self, record: &RecordGuard<'_>) -> DbResult<()> {
        let name = record.string("argument.recordName")?;
        let level = record.int("argument.level")?;
        let status = match database(&self.database)?.find(&name) {
            Some(target) => {
                let _target = record.lock_other_record(&target)?;
                let level = u8::try_from(level.clamp(0, i32::from(MAX_TRACE_LEVEL))).unwrap_or_default();
                target.set_trace_level(level);
                SUCCESS.to_string()
            }
            None => format!("{name} not found"),
        };
        record.put_path("result.status", Value::String(status))
    }
}

/// Destroys another record and removes it from the database.
///
/// Fields: `argument{recordName}`, `result{status}`.
#[derive(Debug)]
pub struct RemoveRecord {
    database: Weak<Database>,
}

impl RemoveRecord {
    /// Create the record and add it to `database`.
    ///
    /// # Errors
    ///
    /// `DuplicateRecord` if `name` is taken.
    pub fn create(name: &str, database: &Arc<Database>) -> DbResult<Arc<Record>> {
        let structure = Structure::builder()
            .add_nested("argument")
            .add("recordName", ScalarType::String)
            .end_nested()
            .add_nested("result")
            .add("status", ScalarType::String)
            .end_nested()
            .build();
        let support = Self {
            database: Arc::downgrade(database),
        };
        register(database, Record::with_support(name, PvStructure::from_structure(&structure), support))
    }
}

impl RecordSupport for RemoveRecord {
    fn process(&self, record: &RecordGuard<'_>) -> DbResult<()> {
        let name = record.string("argument.recordName")?;
        let database = database(&self.database)?;
        let status = match database.find(&name) {
            Some(target) => {
                {
                    let _target = record.lock_other_record(&target)?;
                    target.destroy();
                }
                database.remove(&target);
                SUCCESS.to_string()
            }
            None => format!("{name} not found"),
        };
        record.put_path("result.status", Value::String(status))
    }
}
