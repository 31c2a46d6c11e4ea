//! Records: named, lockable field trees with change notification.
//!
//! All access to a record goes through its reentrant lock. [`Record::lock`]
//! returns a [`RecordGuard`]; reads, writes, change posting, group puts and
//! processing are methods on the guard, so none of them can be reached
//! without holding the lock. Listener callbacks run on the locking thread
//! with the lock held.
//!
//! Records are totally ordered by a creation id. A thread that needs a second
//! record while holding one uses [`RecordGuard::lock_other_record`], which
//! always ends up acquiring the two locks in id order.

mod field;
mod listener;
mod support;

pub use field::{FieldNode, FieldTree};
pub use listener::{RecordClient, RecordListener};
pub use support::{RecordSupport, RpcService};

pub(crate) use listener::same_object;

use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use tracing::{debug, trace, warn};

use crate::data::{Layout, PvStructure, Value};
use crate::error::{DatabaseError, DbResult};
use crate::projection::Projection;

/// Highest meaningful trace level.
pub const MAX_TRACE_LEVEL: u8 = 4;

static NEXT_RECORD_ID: AtomicU64 = AtomicU64::new(1);

/// Offsets of the standard `timeStamp` sub-structure.
#[derive(Debug, Clone, Copy)]
struct TimeStampOffsets {
    root: usize,
    seconds: usize,
    nanoseconds: usize,
}

impl TimeStampOffsets {
    fn locate(layout: &Layout) -> Option<Self> {
        let root = layout.find("timeStamp")?;
        Some(Self {
            root,
            seconds: layout.find("timeStamp.secondsPastEpoch")?,
            nanoseconds: layout.find("timeStamp.nanoseconds")?,
        })
    }
}

struct RecordState {
    data: PvStructure,
    depth_group_put: usize,
    listeners: Vec<Arc<dyn RecordListener>>,
    /// Listeners per field offset.
    field_listeners: Vec<Vec<Arc<dyn RecordListener>>>,
    clients: Vec<Arc<dyn RecordClient>>,
    destroyed: bool,
}

/// A named record.
pub struct Record {
    name: String,
    id: u64,
    layout: Arc<Layout>,
    tree: FieldTree,
    time_stamp: Option<TimeStampOffsets>,
    trace_level: AtomicU8,
    /// Live guards on the owning thread. Only touched with `state` held.
    holds: AtomicUsize,
    state: ReentrantMutex<RefCell<RecordState>>,
    support: Option<Box<dyn RecordSupport>>,
}

impl Record {
    /// Create a plain record around `data`.
    #[must_use]
    pub fn new(name: impl Into<String>, data: PvStructure) -> Arc<Self> {
        Arc::new(Self::build(name.into(), data, None))
    }

    /// Create a record whose processing runs `support`.
    #[must_use]
    pub fn with_support(
        name: impl Into<String>,
        data: PvStructure,
        support: impl RecordSupport + 'static,
    ) -> Arc<Self> {
        Arc::new(Self::build(name.into(), data, Some(Box::new(support))))
    }

    fn build(name: String, data: PvStructure, support: Option<Box<dyn RecordSupport>>) -> Self {
        let layout = Arc::clone(data.layout());
        let tree = FieldTree::new(&name, &layout);
        let state = RecordState {
            field_listeners: vec![Vec::new(); layout.len()],
            data,
            depth_group_put: 0,
            listeners: Vec::new(),
            clients: Vec::new(),
            destroyed: false,
        };
        Self {
            id: NEXT_RECORD_ID.fetch_add(1, Ordering::Relaxed),
            time_stamp: TimeStampOffsets::locate(&layout),
            tree,
            layout,
            name,
            trace_level: AtomicU8::new(0),
            holds: AtomicUsize::new(0),
            state: ReentrantMutex::new(RefCell::new(state)),
            support,
        }
    }

    /// Record name, unique within a database.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Creation-order id; the global lock order.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Layout of the record data.
    #[must_use]
    pub fn layout(&self) -> &Arc<Layout> {
        &self.layout
    }

    /// Field nodes of the record, indexed by offset.
    #[must_use]
    pub fn field_tree(&self) -> &FieldTree {
        &self.tree
    }

    /// The field node at `offset`.
    ///
    /// # Errors
    ///
    /// `FieldNotInRecord` if `offset` is outside this record.
    pub fn find_field(&self, offset: usize) -> DbResult<&FieldNode> {
        self.tree.node(offset).ok_or_else(|| DatabaseError::FieldNotInRecord {
            record: self.name.clone(),
            offset,
        })
    }

    /// Diagnostic verbosity, `0..=4`.
    #[must_use]
    pub fn trace_level(&self) -> u8 {
        self.trace_level.load(Ordering::Relaxed)
    }

    /// Set the diagnostic verbosity (clamped to `0..=4`).
    pub fn set_trace_level(&self, level: u8) {
        self.trace_level.store(level.min(MAX_TRACE_LEVEL), Ordering::Relaxed);
    }

    /// Request/response service of this record, if it has one.
    #[must_use]
    pub fn service(&self) -> Option<&dyn RpcService> {
        self.support.as_deref().and_then(RecordSupport::service)
    }

    /// Block until this thread holds the record lock.
    pub fn lock(&self) -> RecordGuard<'_> {
        if self.trace_level() > 2 {
            trace!(record = %self.name, "lock");
        }
        let inner = self.state.lock();
        self.holds.fetch_add(1, Ordering::Relaxed);
        RecordGuard { record: self, inner }
    }

    /// Take the record lock if no other thread holds it.
    pub fn try_lock(&self) -> Option<RecordGuard<'_>> {
        let inner = self.state.try_lock()?;
        self.holds.fetch_add(1, Ordering::Relaxed);
        Some(RecordGuard { record: self, inner })
    }

    /// True once [`Record::destroy`] ran.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.lock().inner.borrow().destroyed
    }

    fn owns_layout(&self, layout: &Arc<Layout>) -> bool {
        Arc::ptr_eq(layout, &self.layout) || **layout == *self.layout
    }

    /// Register `listener` on the record and on every field `projection` selects.
    ///
    /// Returns false if the listener is already registered, the record was
    /// destroyed, or the projection was built for a different layout.
    pub fn add_listener(&self, listener: Arc<dyn RecordListener>, projection: &Projection) -> bool {
        if !self.owns_layout(projection.master_layout()) {
            warn!(record = %self.name, "projection does not match record layout");
            return false;
        }
        let guard = self.lock();
        let mut state = guard.inner.borrow_mut();
        if state.destroyed || state.listeners.iter().any(|l| same_object(&**l, &*listener)) {
            return false;
        }
        if self.trace_level() > 1 {
            debug!(record = %self.name, "add listener");
        }
        state.listeners.push(Arc::clone(&listener));
        projection.traverse_selected(|offset| {
            let list = &mut state.field_listeners[offset];
            if !list.iter().any(|l| same_object(&**l, &*listener)) {
                list.push(Arc::clone(&listener));
            }
        });
        true
    }

    /// Detach `listener` from the record and from the fields `projection` selects.
    ///
    /// Returns false if it was not registered.
    pub fn remove_listener(&self, listener: &dyn RecordListener, projection: &Projection) -> bool {
        let guard = self.lock();
        let mut state = guard.inner.borrow_mut();
        let before = state.listeners.len();
        state.listeners.retain(|l| !same_object(&**l, listener));
        if state.listeners.len() == before {
            return false;
        }
        if self.trace_level() > 1 {
            debug!(record = %self.name, "remove listener");
        }
        if self.owns_layout(projection.master_layout()) {
            projection.traverse_selected(|offset| {
                state.field_listeners[offset].retain(|l| !same_object(&**l, listener));
            });
        } else {
            for list in &mut state.field_listeners {
                list.retain(|l| !same_object(&**l, listener));
            }
        }
        true
    }

    /// Attach a client to be detached on destroy. False if already attached.
    pub fn add_client(&self, client: Arc<dyn RecordClient>) -> bool {
        let guard = self.lock();
        let mut state = guard.inner.borrow_mut();
        if state.destroyed || state.clients.iter().any(|c| same_object(&**c, &*client)) {
            return false;
        }
        if self.trace_level() > 1 {
            debug!(record = %self.name, "add client");
        }
        state.clients.push(client);
        true
    }

    /// False if `client` was not attached.
    pub fn remove_client(&self, client: &dyn RecordClient) -> bool {
        let guard = self.lock();
        let mut state = guard.inner.borrow_mut();
        let before = state.clients.len();
        state.clients.retain(|c| !same_object(&**c, client));
        let removed = state.clients.len() != before;
        if removed && self.trace_level() > 1 {
            debug!(record = %self.name, "remove client");
        }
        removed
    }

    /// Detach every client.
    pub fn detach_clients(&self) {
        let guard = self.lock();
        let clients = std::mem::take(&mut guard.inner.borrow_mut().clients);
        if self.trace_level() > 1 {
            debug!(record = %self.name, clients = clients.len(), "detach clients");
        }
        for client in clients {
            client.detach(self);
        }
    }

    /// Detach clients, tell every listener to unlisten, drop all registrations.
    ///
    /// Idempotent.
    pub fn destroy(&self) {
        let guard = self.lock();
        {
            let mut state = guard.inner.borrow_mut();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
        }
        if self.trace_level() > 1 {
            debug!(record = %self.name, "destroy");
        }
        self.detach_clients();
        let listeners = guard.inner.borrow().listeners.clone();
        for listener in &listeners {
            listener.unlisten(&guard);
        }
        let mut state = guard.inner.borrow_mut();
        state.listeners.clear();
        for list in &mut state.field_listeners {
            list.clear();
        }
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = self.lock().with_data(PvStructure::to_json);
        write!(f, "record {} {json}", self.name)
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("fields", &self.layout.len())
            .field("trace_level", &self.trace_level())
            .finish_non_exhaustive()
    }
}

/// Proof that the current thread holds a record's lock.
///
/// Guards nest: locking an already-held record on the same thread returns
/// another guard. The lock is released when the last guard is dropped.
pub struct RecordGuard<'a> {
    record: &'a Record,
    inner: ReentrantMutexGuard<'a, RefCell<RecordState>>,
}

impl<'a> RecordGuard<'a> {
    /// The locked record.
    #[must_use]
    pub fn record(&self) -> &'a Record {
        self.record
    }

    /// Read access to the record data.
    ///
    /// # Panics
    ///
    /// If called from inside [`RecordGuard::with_data_mut`] on the same record.
    pub fn with_data<R>(&self, f: impl FnOnce(&PvStructure) -> R) -> R {
        f(&self.inner.borrow().data)
    }

    /// Write access to the record data without posting changes.
    ///
    /// Callers post what they changed with [`RecordGuard::post_put`].
    ///
    /// # Panics
    ///
    /// If called while another data borrow of the same record is active.
    pub fn with_data_mut<R>(&self, f: impl FnOnce(&mut PvStructure) -> R) -> R {
        f(&mut self.inner.borrow_mut().data)
    }

    /// Value at `offset`.
    #[must_use]
    pub fn get(&self, offset: usize) -> Option<Value> {
        self.with_data(|d| d.get(offset).cloned())
    }

    /// Value at a dotted path.
    #[must_use]
    pub fn get_path(&self, path: &str) -> Option<Value> {
        self.with_data(|d| d.get_path(path).cloned())
    }

    /// Read a double field.
    ///
    /// # Errors
    ///
    /// `FieldNotFound` or `TypeMismatch`.
    pub fn double(&self, path: &str) -> DbResult<f64> {
        self.with_data(|d| d.double(path))
    }

    /// Read an int field.
    ///
    /// # Errors
    ///
    /// `FieldNotFound` or `TypeMismatch`.
    pub fn int(&self, path: &str) -> DbResult<i32> {
        self.with_data(|d| d.int(path))
    }

    /// Read a string field.
    ///
    /// # Errors
    ///
    /// `FieldNotFound` or `TypeMismatch`.
    pub fn string(&self, path: &str) -> DbResult<String> {
        self.with_data(|d| d.string(path).map(str::to_string))
    }

    /// Write a field and post the change.
    ///
    /// # Errors
    ///
    /// `FieldNotFound` or `TypeMismatch`; nothing is posted on error.
    pub fn put(&self, offset: usize, value: Value) -> DbResult<()> {
        self.with_data_mut(|d| d.put(offset, value))?;
        self.post_put(offset)
    }

    /// Write a field by dotted path and post the change.
    ///
    /// # Errors
    ///
    /// See [`RecordGuard::put`].
    pub fn put_path(&self, path: &str, value: Value) -> DbResult<()> {
        let offset = self.with_data_mut(|d| d.put_path(path, value))?;
        self.post_put(offset)
    }

    /// Announce that the field at `offset` changed.
    ///
    /// Ancestors' listeners get `data_put_sub` from the nearest parent up to
    /// the root, then the field's own listeners get `data_put`, then, for a
    /// structure, every descendant's listeners get `data_put`.
    ///
    /// # Errors
    ///
    /// `FieldNotInRecord` if `offset` is outside this record.
    pub fn post_put(&self, offset: usize) -> DbResult<()> {
        let node = self.record.find_field(offset)?;
        if self.record.trace_level() > 2 {
            trace!(
                record = %self.record.name,
                field = self.record.tree.full_field_name(offset).unwrap_or_default(),
                "post put"
            );
        }
        let tree = &self.record.tree;
        let mut parent = tree.parent_of(node);
        while let Some(requested) = parent {
            for listener in self.listeners_at(requested.offset()) {
                listener.data_put_sub(self, requested, node);
            }
            parent = tree.parent_of(requested);
        }
        self.post_sub_field(node);
        Ok(())
    }

    fn post_sub_field(&self, node: &FieldNode) {
        for listener in self.listeners_at(node.offset()) {
            listener.data_put(self, node);
        }
        for &child in node.children() {
            if let Some(child) = self.record.tree.node(child) {
                self.post_sub_field(child);
            }
        }
    }

    /// Snapshot so callbacks may register or remove listeners.
    fn listeners_at(&self, offset: usize) -> Vec<Arc<dyn RecordListener>> {
        self.inner
            .borrow()
            .field_listeners
            .get(offset)
            .cloned()
            .unwrap_or_default()
    }

    fn record_listeners(&self) -> Vec<Arc<dyn RecordListener>> {
        self.inner.borrow().listeners.clone()
    }

    /// Open a transaction. Only the outermost call notifies listeners.
    pub fn begin_group_put(&self) {
        let depth = {
            let mut state = self.inner.borrow_mut();
            state.depth_group_put += 1;
            state.depth_group_put
        };
        if depth > 1 {
            return;
        }
        if self.record.trace_level() > 2 {
            trace!(record = %self.record.name, "begin group put");
        }
        for listener in self.record_listeners() {
            listener.begin_group_put(self);
        }
    }

    /// Close a transaction. Only the outermost call notifies listeners.
    pub fn end_group_put(&self) {
        let depth = {
            let mut state = self.inner.borrow_mut();
            let Some(depth) = state.depth_group_put.checked_sub(1) else {
                drop(state);
                warn!(record = %self.record.name, "end group put without begin");
                return;
            };
            state.depth_group_put = depth;
            depth
        };
        if depth > 0 {
            return;
        }
        if self.record.trace_level() > 2 {
            trace!(record = %self.record.name, "end group put");
        }
        for listener in self.record_listeners() {
            listener.end_group_put(self);
        }
    }

    /// Current transaction nesting depth.
    #[must_use]
    pub fn group_put_depth(&self) -> usize {
        self.inner.borrow().depth_group_put
    }

    /// Run the record's processing hook, then stamp `timeStamp`.
    ///
    /// # Errors
    ///
    /// Whatever the hook returns; the time stamp is not updated in that case.
    pub fn process(&self) -> DbResult<()> {
        if self.record.trace_level() > 2 {
            trace!(record = %self.record.name, "process");
        }
        if let Some(support) = &self.record.support {
            support.process(self)?;
        }
        self.stamp_time()
    }

    fn stamp_time(&self) -> DbResult<()> {
        let Some(ts) = self.record.time_stamp else {
            return Ok(());
        };
        let now = Utc::now();
        let nanos = i32::try_from(now.timestamp_subsec_nanos()).unwrap_or_default();
        self.with_data_mut(|d| -> DbResult<()> {
            d.put(ts.seconds, Value::Long(now.timestamp()))?;
            d.put(ts.nanoseconds, Value::Int(nanos))
        })?;
        self.post_put(ts.root)
    }

    /// Lock `other` while this record is held, in global id order.
    ///
    /// When `other` orders before this record, this thread's holds on this
    /// record are released, `other` is locked, and the holds are taken back.
    /// Another thread may change this record in between.
    ///
    /// # Errors
    ///
    /// `Internal` if a data borrow of this record is active (the lock could
    /// not be released safely).
    pub fn lock_other_record<'b>(&self, other: &'b Record) -> DbResult<RecordGuard<'b>> {
        let me = self.record;
        if me.trace_level() > 2 {
            trace!(record = %me.name, other = %other.name, "lock other record");
        }
        if me.id <= other.id {
            return Ok(other.lock());
        }
        if self.inner.try_borrow_mut().is_err() {
            return Err(DatabaseError::internal(format!(
                "record {} is borrowed while locking {}",
                me.name, other.name
            )));
        }
        // `holds` belongs to the owning thread; zero it before giving the
        // lock away so the next owner counts only its own guards.
        let count = me.holds.swap(0, Ordering::Relaxed);
        for _ in 0..count {
            // SAFETY: this thread holds `me.state` exactly `count` times, once
            // per live guard. Every hold is taken back below before this
            // function returns, and no `RefCell` borrow is outstanding.
            unsafe { me.state.force_unlock() };
        }
        let guard = other.lock();
        for _ in 0..count {
            std::mem::forget(me.state.lock());
        }
        me.holds.store(count, Ordering::Relaxed);
        Ok(guard)
    }

    /// Release this hold on the lock.
    pub fn unlock(self) {}
}

impl Drop for RecordGuard<'_> {
    fn drop(&mut self) {
        self.record.holds.fetch_sub(1, Ordering::Relaxed);
        if self.record.trace_level() > 2 {
            trace!(record = %self.record.name, "unlock");
        }
    }
}

impl fmt::Debug for RecordGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordGuard")
            .field("record", &self.record.name)
            .finish_non_exhaustive()
    }
}
