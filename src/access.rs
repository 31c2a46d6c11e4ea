//! Request handlers over records: process, get, put, put-get, array, rpc, monitor.
//!
//! A [`Channel`] binds a caller to one record by name. Handlers created from
//! it answer with a [`Status`] paired with any data, never a panic: record
//! processing and rpc services run behind a `catch_unwind` boundary and a
//! panic comes back as a `Fatal` status.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::bitset::BitSet;
use crate::config::MonitorConfig;
use crate::data::{FieldDesc, FieldKind, PvStructure, Value};
use crate::database::Database;
use crate::error::{DatabaseError, DbResult, Status};
use crate::monitor::{Monitor, MonitorRequester};
use crate::projection::{Projection, PvRequest};
use crate::record::{Record, RecordClient, RecordGuard};

/// Outcome of a handler call.
pub type Reply<T> = (Status, Option<T>);

/// A caller's connection to one record.
pub struct Channel {
    record: Arc<Record>,
    monitor_config: MonitorConfig,
    connected: AtomicBool,
}

impl Channel {
    /// Connect to the record called `name`.
    ///
    /// # Errors
    ///
    /// `RecordNotFound` if there is no such record, `Destroyed` if it is
    /// being destroyed.
    pub fn connect(database: &Database, name: &str) -> DbResult<Arc<Self>> {
        let record = database.require(name)?;
        let channel = Arc::new(Self {
            record: Arc::clone(&record),
            monitor_config: database.config().monitor.clone(),
            connected: AtomicBool::new(true),
        });
        if !record.add_client(Arc::clone(&channel) as Arc<dyn RecordClient>) {
            return Err(DatabaseError::Destroyed {
                what: format!("record {name}"),
            });
        }
        if record.trace_level() > 1 {
            debug!(record = %record.name(), "channel connect");
        }
        Ok(channel)
    }

    /// The record this channel is bound to.
    #[must_use]
    pub fn record(&self) -> &Arc<Record> {
        &self.record
    }

    /// False once disconnected or the record was destroyed.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Detach from the record. Handlers created earlier stop working.
    pub fn disconnect(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            self.record.remove_client(self);
        }
    }

    fn projection(&self, request: &PvRequest) -> DbResult<Projection> {
        Projection::create(self.record.layout(), request)
    }

    fn check(&self) -> DbResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(DatabaseError::Destroyed {
                what: format!("channel to {}", self.record.name()),
            })
        }
    }

    /// Handler that processes the record.
    ///
    /// # Errors
    ///
    /// `Destroyed` when disconnected.
    pub fn create_process(self: &Arc<Self>) -> DbResult<ChannelProcess> {
        self.check()?;
        Ok(ChannelProcess {
            channel: Arc::clone(self),
        })
    }

    /// Handler that reads the fields `request` selects.
    ///
    /// `record[process=true]` processes the record before each read.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` or `Destroyed`.
    pub fn create_get(self: &Arc<Self>, request: &str) -> DbResult<ChannelGet> {
        self.check()?;
        let request = PvRequest::parse(request)?;
        let projection = self.projection(&request)?;
        Ok(ChannelGet {
            channel: Arc::clone(self),
            process: request.process(false),
            state: Mutex::new(GetState {
                buffer: projection.new_buffer(),
                first: true,
            }),
            projection,
        })
    }

    /// Handler that writes the fields `request` selects.
    ///
    /// Processes after each write unless `record[process=false]`.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` or `Destroyed`.
    pub fn create_put(self: &Arc<Self>, request: &str) -> DbResult<ChannelPut> {
        self.check()?;
        let request = PvRequest::parse(request)?;
        Ok(ChannelPut {
            channel: Arc::clone(self),
            process: request.process(true),
            projection: self.projection(&request)?,
        })
    }

    /// Handler that writes `put_request` fields then reads `get_request` fields.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` or `Destroyed`.
    pub fn create_put_get(self: &Arc<Self>, put_request: &str, get_request: &str) -> DbResult<ChannelPutGet> {
        self.check()?;
        let put = PvRequest::parse(put_request)?;
        let get = PvRequest::parse(get_request)?;
        Ok(ChannelPutGet {
            channel: Arc::clone(self),
            process: put.process(true),
            put: self.projection(&put)?,
            get: self.projection(&get)?,
        })
    }

    /// Handler for slices of the one array field `request` selects.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` unless the request names exactly one existing array
    /// field, `Destroyed` when disconnected.
    pub fn create_array(self: &Arc<Self>, request: &str) -> DbResult<ChannelArray> {
        self.check()?;
        let request = PvRequest::parse(request)?;
        let [path] = request.fields() else {
            return Err(DatabaseError::invalid_request("array request must name exactly one field"));
        };
        let layout = self.record.layout();
        let offset = layout
            .find(path)
            .ok_or_else(|| DatabaseError::invalid_request(format!("field '{path}' does not exist")))?;
        if !matches!(layout.field(offset).map(FieldDesc::kind), Some(FieldKind::ScalarArray(_))) {
            return Err(DatabaseError::invalid_request(format!("field '{path}' is not an array")));
        }
        if self.record.trace_level() > 0 {
            debug!(record = %self.record.name(), field = %path, "channel array create");
        }
        Ok(ChannelArray {
            channel: Arc::clone(self),
            offset,
        })
    }

    /// Handler for the record's rpc service.
    ///
    /// # Errors
    ///
    /// `Destroyed` when disconnected.
    pub fn create_rpc(self: &Arc<Self>) -> DbResult<ChannelRpc> {
        self.check()?;
        Ok(ChannelRpc {
            channel: Arc::clone(self),
        })
    }

    /// Subscribe to the record with the database's monitor defaults.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` or `Destroyed`.
    pub fn create_monitor(&self, requester: Arc<dyn MonitorRequester>, request: &str) -> DbResult<Monitor> {
        self.check()?;
        Monitor::create_with_config(&self.record, requester, request, &self.monitor_config)
    }
}

impl RecordClient for Channel {
    fn detach(&self, record: &Record) {
        if record.trace_level() > 1 {
            debug!(record = %record.name(), "channel detach");
        }
        self.connected.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("record", &self.record.name())
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Runs `op`, turning errors into their status and panics into `Fatal`.
fn guarded<T>(channel: &Channel, op: &str, f: impl FnOnce() -> DbResult<T>) -> Reply<T> {
    if let Err(err) = channel.check() {
        return (Status::from(&err), None);
    }
    let record = channel.record.name();
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => (Status::ok(), Some(value)),
        Ok(Err(err)) => {
            debug!(record = %record, op, error = %err, "request failed");
            (Status::from(&err), None)
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(record = %record, op, message, "request panicked");
            (Status::fatal(format!("{op} failed: {message}")), None)
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("panic")
}

/// Group put that is closed even when processing unwinds.
struct GroupPut<'g, 'r>(&'g RecordGuard<'r>);

impl<'g, 'r> GroupPut<'g, 'r> {
    fn begin(guard: &'g RecordGuard<'r>) -> Self {
        guard.begin_group_put();
        Self(guard)
    }
}

impl Drop for GroupPut<'_, '_> {
    fn drop(&mut self) {
        self.0.end_group_put();
    }
}

fn process_locked(guard: &RecordGuard<'_>) -> DbResult<()> {
    let _group = GroupPut::begin(guard);
    guard.process()
}

/// Write `bits` of `data` through `projection`, posting every written field.
fn put_locked(guard: &RecordGuard<'_>, projection: &Projection, data: &PvStructure, bits: &BitSet) -> DbResult<()> {
    if !Arc::ptr_eq(data.layout(), projection.copy_layout()) && **data.layout() != **projection.copy_layout() {
        return Err(DatabaseError::invalid_request("put data does not match the request layout"));
    }
    let written = guard.with_data_mut(|master| projection.copy_to_master(data, master, bits));
    for offset in written {
        guard.post_put(offset)?;
    }
    Ok(())
}

fn read_locked(guard: &RecordGuard<'_>, projection: &Projection) -> PvStructure {
    let mut buffer = projection.new_buffer();
    let mut bits = BitSet::new();
    guard.with_data(|master| projection.fill_from_master(master, &mut buffer, &mut bits));
    buffer
}

/// Processes a record.
#[derive(Debug)]
pub struct ChannelProcess {
    channel: Arc<Channel>,
}

impl ChannelProcess {
    /// Lock, open a group put, process, close the group put.
    pub fn process(&self) -> Status {
        let record = &self.channel.record;
        guarded(&self.channel, "process", || process_locked(&record.lock())).0
    }
}

struct GetState {
    buffer: PvStructure,
    first: bool,
}

/// Reads a projection of a record.
pub struct ChannelGet {
    channel: Arc<Channel>,
    projection: Projection,
    process: bool,
    state: Mutex<GetState>,
}

impl ChannelGet {
    /// Current copy and the bits changed since the previous get.
    ///
    /// The first get reports everything (bit 0).
    pub fn get(&self) -> Reply<(PvStructure, BitSet)> {
        let record = &self.channel.record;
        guarded(&self.channel, "get", || {
            let guard = record.lock();
            if self.process {
                process_locked(&guard)?;
            }
            let mut state = self.state.lock();
            let GetState { buffer, first } = &mut *state;
            let mut bits = BitSet::new();
            guard.with_data(|master| {
                if *first {
                    self.projection.fill_from_master(master, buffer, &mut bits);
                } else {
                    self.projection.refresh_copy(master, buffer, &mut bits);
                }
            });
            *first = false;
            Ok((buffer.clone(), bits))
        })
    }

    /// Mapping from the record to the returned copy.
    #[must_use]
    pub fn projection(&self) -> &Projection {
        &self.projection
    }
}

impl std::fmt::Debug for ChannelGet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelGet")
            .field("channel", &self.channel)
            .field("process", &self.process)
            .finish_non_exhaustive()
    }
}

/// Writes a projection of a record.
#[derive(Debug)]
pub struct ChannelPut {
    channel: Arc<Channel>,
    projection: Projection,
    process: bool,
}

impl ChannelPut {
    /// A copy to fill in and pass to [`ChannelPut::put`].
    #[must_use]
    pub fn new_buffer(&self) -> PvStructure {
        self.projection.new_buffer()
    }

    /// Write the fields of `data` named by `bits` in one group put.
    pub fn put(&self, data: &PvStructure, bits: &BitSet) -> Status {
        let record = &self.channel.record;
        guarded(&self.channel, "put", || {
            let guard = record.lock();
            let _group = GroupPut::begin(&guard);
            put_locked(&guard, &self.projection, data, bits)?;
            if self.process {
                guard.process()?;
            }
            Ok(())
        })
        .0
    }

    /// Current values of the put fields.
    pub fn get(&self) -> Reply<PvStructure> {
        let record = &self.channel.record;
        guarded(&self.channel, "put get", || Ok(read_locked(&record.lock(), &self.projection)))
    }
}

/// Writes one projection and reads another under a single lock.
#[derive(Debug)]
pub struct ChannelPutGet {
    channel: Arc<Channel>,
    put: Projection,
    get: Projection,
    process: bool,
}

impl ChannelPutGet {
    /// A copy of the put fields to fill in.
    #[must_use]
    pub fn new_buffer(&self) -> PvStructure {
        self.put.new_buffer()
    }

    /// Put, process, then read the get fields.
    pub fn put_get(&self, data: &PvStructure, bits: &BitSet) -> Reply<PvStructure> {
        let record = &self.channel.record;
        guarded(&self.channel, "putGet", || {
            let guard = record.lock();
            {
                let _group = GroupPut::begin(&guard);
                put_locked(&guard, &self.put, data, bits)?;
                if self.process {
                    guard.process()?;
                }
            }
            Ok(read_locked(&guard, &self.get))
        })
    }

    /// Current values of the get fields.
    pub fn get_get(&self) -> Reply<PvStructure> {
        let record = &self.channel.record;
        guarded(&self.channel, "getGet", || Ok(read_locked(&record.lock(), &self.get)))
    }

    /// Current values of the put fields.
    pub fn get_put(&self) -> Reply<PvStructure> {
        let record = &self.channel.record;
        guarded(&self.channel, "getPut", || Ok(read_locked(&record.lock(), &self.put)))
    }
}

/// Reads and writes slices of one array field.
///
/// Only a stride of 1 is supported.
#[derive(Debug)]
pub struct ChannelArray {
    channel: Arc<Channel>,
    offset: usize,
}

fn array_offset(offset: i64) -> DbResult<usize> {
    usize::try_from(offset).map_err(|_| DatabaseError::invalid_request(format!("illegal offset {offset}")))
}

fn unit_stride(stride: i64) -> DbResult<()> {
    if stride == 1 {
        Ok(())
    } else {
        Err(DatabaseError::invalid_request(format!("illegal stride {stride}")))
    }
}

impl ChannelArray {
    fn current(&self, guard: &RecordGuard<'_>) -> DbResult<Value> {
        guard.get(self.offset).ok_or_else(|| DatabaseError::FieldNotInRecord {
            record: self.channel.record.name().to_string(),
            offset: self.offset,
        })
    }

    /// Up to `count` elements from `offset`. A `count` of zero or less reads
    /// to the end; an offset past the end reads nothing.
    pub fn get_array(&self, offset: i64, count: i64, stride: i64) -> Reply<Value> {
        let record = &self.channel.record;
        guarded(&self.channel, "getArray", || {
            let offset = array_offset(offset)?;
            unit_stride(stride)?;
            let value = self.current(&record.lock())?;
            let available = value.array_len().unwrap_or_default().saturating_sub(offset);
            let count = usize::try_from(count)
                .ok()
                .filter(|&c| c > 0)
                .map_or(available, |c| c.min(available));
            value
                .array_slice(offset, count)
                .ok_or_else(|| DatabaseError::internal("array field holds a scalar"))
        })
    }

    /// Write the first `count` elements of `data` at `offset`, leaving the
    /// field `offset + count` long. A `count` of zero writes all of `data`.
    pub fn put_array(&self, data: &Value, offset: i64, count: i64, stride: i64) -> Status {
        let record = &self.channel.record;
        guarded(&self.channel, "putArray", || {
            let offset = array_offset(offset)?;
            let count = usize::try_from(count)
                .map_err(|_| DatabaseError::invalid_request(format!("illegal count {count}")))?;
            unit_stride(stride)?;
            let count = if count == 0 { data.array_len().unwrap_or_default() } else { count };

            let guard = record.lock();
            let mut value = self.current(&guard)?;
            if !value.splice_array(offset, data, count) {
                return Err(DatabaseError::TypeMismatch {
                    path: record.layout().path_of(self.offset),
                    expected: format!("{} with at least {count} elements", value.type_name()),
                    actual: data.type_name().to_string(),
                });
            }
            guard.put(self.offset, value)
        })
        .0
    }

    /// Number of elements in the field.
    pub fn get_length(&self) -> Reply<usize> {
        let record = &self.channel.record;
        guarded(&self.channel, "getLength", || {
            Ok(self.current(&record.lock())?.array_len().unwrap_or_default())
        })
    }

    /// Truncate or pad the field to `length` elements.
    pub fn set_length(&self, length: usize) -> Status {
        let record = &self.channel.record;
        guarded(&self.channel, "setLength", || {
            let guard = record.lock();
            let mut value = self.current(&guard)?;
            if value.array_len() == Some(length) {
                return Ok(());
            }
            value.resize_array(length);
            guard.put(self.offset, value)
        })
        .0
    }
}

/// Calls a record's rpc service.
#[derive(Debug)]
pub struct ChannelRpc {
    channel: Arc<Channel>,
}

impl ChannelRpc {
    /// Send `argument` to the service and return its response.
    pub fn request(&self, argument: &PvStructure) -> Reply<PvStructure> {
        let record = &self.channel.record;
        guarded(&self.channel, "rpc", || {
            let service = record.service().ok_or_else(|| DatabaseError::NotImplemented {
                what: format!("rpc on record {}", record.name()),
            })?;
            service.request(record, argument)
        })
    }
}
