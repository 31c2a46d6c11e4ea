//! # pvdb - an in-memory database of structured, monitorable records
//!
//! pvdb keeps named records, each a tree of typed fields, behind per-record
//! reentrant locks. Writers change fields and post the change; listeners
//! registered on any part of the tree hear about it with the precise field
//! that changed. Subscribers receive batched, bitset-diffed snapshots from a
//! bounded queue that never blocks the writer.
//!
//! ## Core Concepts
//!
//! - **Record**: a named, lockable field tree with group puts (transactions)
//! - **Projection**: the subset of a record's fields a request selects
//! - **Monitor**: a subscription delivering snapshots plus changed/overrun bits
//! - **Database**: the name to record registry
//!
//! ## Usage
//!
//! ```rust
//! use pvdb::{Database, DatabaseConfig, Monitor, MonitorStream, PvStructure, Record, ScalarType, Structure, Value};
//!
//! let db = Database::new(DatabaseConfig::default());
//! let data = PvStructure::from_structure(&Structure::builder().add("value", ScalarType::Double).build());
//! db.add(Record::new("counter", data));
//!
//! let record = db.find("counter").unwrap();
//! let stream = MonitorStream::new(16);
//! let monitor = Monitor::create(&record, stream, "field(value)").unwrap();
//! monitor.start();
//!
//! record.lock().put_path("value", Value::Double(1.5)).unwrap();
//!
//! let initial = monitor.poll().unwrap();
//! assert!(initial.changed().get(0));
//! let update = monitor.poll().unwrap();
//! assert_eq!(update.data().double("value").unwrap(), 1.5);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod access;
pub mod bitset;
pub mod config;
pub mod data;
pub mod database;
pub mod error;
pub mod monitor;
pub mod projection;
pub mod record;
pub mod records;

pub use access::{
    Channel, ChannelArray, ChannelGet, ChannelProcess, ChannelPut, ChannelPutGet, ChannelRpc, Reply,
};
pub use bitset::BitSet;
pub use config::{DatabaseConfig, MonitorConfig};
pub use data::{Layout, PvStructure, ScalarType, Structure, Value};
pub use database::Database;
pub use error::{DatabaseError, DbResult, Status, StatusType};
pub use monitor::{Monitor, MonitorElement, MonitorNotification, MonitorRequester, MonitorState, MonitorStream};
pub use projection::{Projection, PvRequest};
pub use record::{FieldNode, FieldTree, Record, RecordClient, RecordGuard, RecordListener, RecordSupport, RpcService};
pub use records::{RemoveRecord, TraceRecord};
