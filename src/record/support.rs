//! Record-type specific behaviour ("smart" records).

use crate::data::PvStructure;
use crate::error::DbResult;

use super::{Record, RecordGuard};

/// Processing hook of a record.
///
/// `process` runs with the record locked, after which the record stamps its
/// `timeStamp` field (if it has one). Plain functions of the right shape
/// implement this trait too.
///
/// ```
/// use pvdb::data::{PvStructure, ScalarType, Structure, Value};
/// use pvdb::record::{Record, RecordGuard, RecordSupport};
/// use pvdb::DbResult;
///
/// struct APlusB;
///
/// impl RecordSupport for APlusB {
///     fn process(&self, rec: &RecordGuard<'_>) -> DbResult<()> {
///         let sum = rec.double("a")? + rec.double("b")?;
///         rec.put_path("c", Value::Double(sum))
///     }
/// }
///
/// let data = PvStructure::from_structure(
///     &Structure::builder()
///         .add("a", ScalarType::Double)
///         .add("b", ScalarType::Double)
///         .add("c", ScalarType::Double)
///         .build(),
/// );
/// let record = Record::with_support("aplusb", data, APlusB);
/// let guard = record.lock();
/// guard.put_path("a", Value::Double(1.0)).unwrap();
/// guard.put_path("b", Value::Double(1.0)).unwrap();
/// guard.process().unwrap();
/// assert_eq!(guard.double("c").unwrap(), 2.0);
/// ```
pub trait RecordSupport: Send + Sync {
    /// Compute derived fields.
    ///
    /// # Errors
    ///
    /// Any error aborts processing; the caller turns it into a status.
    fn process(&self, record: &RecordGuard<'_>) -> DbResult<()>;

    /// Request/response service offered by this record, if any.
    fn service(&self) -> Option<&dyn RpcService> {
        None
    }
}

impl<F> RecordSupport for F
where
    F: Fn(&RecordGuard<'_>) -> DbResult<()> + Send + Sync,
{
    fn process(&self, record: &RecordGuard<'_>) -> DbResult<()> {
        self(record)
    }
}

/// Request/response service hosted by a record.
pub trait RpcService: Send + Sync {
    /// Handle one request. The record is not locked on entry.
    ///
    /// # Errors
    ///
    /// The error is reported to the caller as its status.
    fn request(&self, record: &Record, argument: &PvStructure) -> DbResult<PvStructure>;
}
