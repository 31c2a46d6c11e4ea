//! Subscriptions delivering batched snapshots of a record.
//!
//! A [`Monitor`] listens to the fields a request selects and turns field
//! changes into a bounded queue of [`MonitorElement`]s. Each element carries
//! a copy of the selected data plus two bitsets in copy offsets: what changed
//! since the previous element, and what changed more than once (overrun).
//!
//! Producers never wait for consumers. When every element is ready and none
//! is free, further changes accumulate in the active element, setting
//! overrun bits, until the consumer releases one.
//!
//! Locking order is record lock, then the monitor's own mutex. Requester
//! callbacks run after the monitor mutex is dropped. Changed fields are
//! copied into the active element as they are announced, so `poll` and
//! `release` only take the monitor mutex and never wait on the record.

mod queue;
/// Channel-backed requester.
pub mod stream;

pub use queue::MonitorElement;
pub use stream::{MonitorNotification, MonitorStream};

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::bitset::compress;
use crate::config::MonitorConfig;
use crate::data::Layout;
use crate::error::{DbResult, Status, StatusType};
use crate::projection::{Projection, PvRequest};
use crate::record::{FieldNode, Record, RecordGuard, RecordListener};

use queue::MonitorQueue;

/// Consumer side callbacks of a monitor.
///
/// `monitor_event` and `unlisten` may run with the monitored record locked;
/// implementations must not block.
pub trait MonitorRequester: Send + Sync {
    /// Creation finished. `layout` is the copy layout on success.
    fn monitor_connect(&self, status: &Status, layout: Option<&Arc<Layout>>);

    /// At least one element is ready to poll.
    fn monitor_event(&self);

    /// The record went away; the monitor delivers nothing further.
    fn unlisten(&self) {}

    /// Diagnostic from the monitor.
    fn message(&self, message: &str, kind: StatusType) {
        match kind {
            StatusType::Ok => debug!(message, "monitor message"),
            _ => warn!(message, %kind, "monitor message"),
        }
    }
}

/// Lifecycle of a monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum MonitorState {
    Idle,
    Active,
    Destroyed,
}

impl fmt::Display for MonitorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Active => "active",
            Self::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
struct MonitorShared {
    state: MonitorState,
    queue: MonitorQueue,
    /// Accumulating element; `None` until the first start.
    active: Option<MonitorElement>,
    in_group_put: bool,
    /// The active element has changes that could not be published yet.
    pending_change: bool,
}

struct MonitorInner {
    record: Arc<Record>,
    requester: Arc<dyn MonitorRequester>,
    projection: Projection,
    shared: Mutex<MonitorShared>,
}

/// A subscription on one record. Dropping it destroys it.
pub struct Monitor {
    inner: Arc<MonitorInner>,
}

impl Monitor {
    /// Create an idle monitor for `request` on `record`.
    ///
    /// The requester's `monitor_connect` is called with the outcome either way.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` for malformed text, unknown fields or a bad `queueSize`.
    pub fn create(record: &Arc<Record>, requester: Arc<dyn MonitorRequester>, request: &str) -> DbResult<Self> {
        Self::create_with_config(record, requester, request, &MonitorConfig::default())
    }

    /// Like [`Monitor::create`] with explicit queue defaults.
    ///
    /// # Errors
    ///
    /// See [`Monitor::create`].
    pub fn create_with_config(
        record: &Arc<Record>,
        requester: Arc<dyn MonitorRequester>,
        request: &str,
        config: &MonitorConfig,
    ) -> DbResult<Self> {
        let built = PvRequest::parse(request).and_then(|req| {
            let queue_size = config.effective_queue_size(req.queue_size()?);
            Ok((Projection::create(record.layout(), &req)?, queue_size))
        });
        let (projection, queue_size) = match built {
            Ok(built) => built,
            Err(err) => {
                requester.message(&err.to_string(), StatusType::Error);
                requester.monitor_connect(&Status::fatal("failed to create monitor"), None);
                return Err(err);
            }
        };
        if record.trace_level() > 0 {
            debug!(record = %record.name(), queue_size, "monitor create");
        }

        let shared = MonitorShared {
            state: MonitorState::Idle,
            queue: MonitorQueue::new(&projection, queue_size),
            active: None,
            in_group_put: false,
            pending_change: false,
        };
        let inner = Arc::new(MonitorInner {
            record: Arc::clone(record),
            requester,
            projection,
            shared: Mutex::new(shared),
        });
        inner
            .requester
            .monitor_connect(&Status::ok(), Some(inner.projection.copy_layout()));
        Ok(Self { inner })
    }

    /// The monitored record.
    #[must_use]
    pub fn record(&self) -> &Arc<Record> {
        &self.inner.record
    }

    /// Mapping from the record to element data.
    #[must_use]
    pub fn projection(&self) -> &Projection {
        &self.inner.projection
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> MonitorState {
        self.inner.shared.lock().state
    }

    /// Elements waiting to be polled.
    #[must_use]
    pub fn ready_count(&self) -> usize {
        self.inner.shared.lock().queue.used_len()
    }

    /// Most elements that can be ready at once.
    #[must_use]
    pub fn queue_size(&self) -> usize {
        self.inner.shared.lock().queue.capacity()
    }

    /// Start delivering: publish a full snapshot, then every change.
    ///
    /// Elements still ready from a previous run are discarded.
    pub fn start(&self) -> Status {
        let inner = &self.inner;
        let record = &inner.record;
        if record.trace_level() > 0 {
            debug!(record = %record.name(), state = %self.state(), "monitor start");
        }
        let guard = record.lock();
        match self.state() {
            MonitorState::Destroyed => return Status::was_destroyed(),
            MonitorState::Active => {
                warn!(record = %record.name(), "monitor already started");
                return Status::already_started();
            }
            MonitorState::Idle => {}
        }
        let listener: Arc<dyn RecordListener> = Arc::clone(inner) as Arc<dyn RecordListener>;
        if !record.add_listener(listener, &inner.projection) {
            return Status::was_destroyed();
        }

        let published = {
            let mut shared = inner.shared.lock();
            shared.queue.clear();
            let Some(mut active) = shared.active.take().or_else(|| shared.queue.take_free()) else {
                drop(shared);
                record.remove_listener(&**inner, &inner.projection);
                return Status::error("no free monitor element");
            };
            active.clear_bits();
            guard.with_data(|master| {
                inner
                    .projection
                    .fill_from_master(master, &mut active.data, &mut active.changed);
            });
            shared.active = Some(active);
            shared.state = MonitorState::Active;
            shared.in_group_put = guard.group_put_depth() > 0;
            shared.pending_change = true;
            inner.publish(&mut shared)
        };
        if published {
            inner.requester.monitor_event();
        }
        Status::ok()
    }

    /// Stop delivering. Ready elements are kept but `poll` returns `None`
    /// until the next start, which discards them.
    pub fn stop(&self) -> Status {
        let inner = &self.inner;
        if inner.record.trace_level() > 0 {
            debug!(record = %inner.record.name(), state = %self.state(), "monitor stop");
        }
        {
            let mut shared = inner.shared.lock();
            match shared.state {
                MonitorState::Destroyed => return Status::was_destroyed(),
                MonitorState::Idle => {
                    drop(shared);
                    warn!(record = %inner.record.name(), "monitor not started");
                    return Status::not_started();
                }
                MonitorState::Active => shared.state = MonitorState::Idle,
            }
        }
        inner.record.remove_listener(&**inner, &inner.projection);
        Status::ok()
    }

    /// Oldest ready element, or `None` if there is none or the monitor is not active.
    #[must_use]
    pub fn poll(&self) -> Option<MonitorElement> {
        let mut shared = self.inner.shared.lock();
        if shared.state != MonitorState::Active {
            return None;
        }
        let element = shared.queue.take_used();
        if element.is_some() && self.inner.record.trace_level() > 0 {
            debug!(record = %self.inner.record.name(), "monitor poll");
        }
        element
    }

    /// Hand a polled element back.
    ///
    /// If changes piled up while the queue was full they are published now.
    /// Only the monitor's own mutex is taken.
    pub fn release(&self, element: MonitorElement) {
        let inner = &self.inner;
        if !element.belongs_to(inner.projection.copy_layout()) {
            warn!(record = %inner.record.name(), "released element from another monitor");
            return;
        }
        if inner.record.trace_level() > 0 {
            debug!(record = %inner.record.name(), "monitor release");
        }
        let published = {
            let mut shared = inner.shared.lock();
            if shared.state == MonitorState::Destroyed {
                return;
            }
            shared.queue.put_free(element);
            shared.state == MonitorState::Active
                && shared.pending_change
                && !shared.in_group_put
                && inner.publish(&mut shared)
        };
        if published {
            inner.requester.monitor_event();
        }
    }

    /// Stop for good. Idempotent.
    pub fn destroy(&self) {
        self.inner.destroy();
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.inner.destroy();
    }
}

impl fmt::Debug for Monitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Monitor")
            .field("record", &self.inner.record.name())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl MonitorInner {
    fn destroy(&self) {
        let was_active = {
            let mut shared = self.shared.lock();
            let previous = shared.state;
            if previous == MonitorState::Destroyed {
                return;
            }
            shared.state = MonitorState::Destroyed;
            previous == MonitorState::Active
        };
        if self.record.trace_level() > 0 {
            debug!(record = %self.record.name(), "monitor destroy");
        }
        if was_active {
            self.record.remove_listener(self, &self.projection);
        }
    }

    /// Publish the active element if a free one can replace it.
    fn publish(&self, shared: &mut MonitorShared) -> bool {
        let Some(mut next) = shared.queue.take_free() else {
            return false;
        };
        let Some(mut active) = shared.active.take() else {
            shared.queue.put_free(next);
            return false;
        };
        let layout = self.projection.copy_layout();
        compress(&mut active.changed, layout);
        compress(&mut active.overrun, layout);
        shared.queue.put_used(active);
        next.clear_bits();
        shared.active = Some(next);
        shared.pending_change = false;
        true
    }

    fn field_changed(&self, record: &RecordGuard<'_>, field: &FieldNode) {
        let Some(offset) = self.projection.offset_of(field.offset()) else {
            return;
        };
        let published = {
            let mut shared = self.shared.lock();
            if shared.state != MonitorState::Active {
                return;
            }
            shared.pending_change = true;
            let Some(active) = shared.active.as_mut() else {
                return;
            };
            if active.changed.get(offset) {
                active.overrun.set(offset);
            }
            active.changed.set(offset);
            record.with_data(|master| {
                self.projection
                    .copy_field_from_master(master, &mut active.data, offset);
            });
            !shared.in_group_put && self.publish(&mut shared)
        };
        if published {
            self.requester.monitor_event();
        }
    }
}

impl RecordListener for MonitorInner {
    fn data_put(&self, record: &RecordGuard<'_>, field: &FieldNode) {
        self.field_changed(record, field);
    }

    fn data_put_sub(&self, record: &RecordGuard<'_>, _requested: &FieldNode, field: &FieldNode) {
        self.field_changed(record, field);
    }

    fn begin_group_put(&self, _record: &RecordGuard<'_>) {
        let mut shared = self.shared.lock();
        if shared.state == MonitorState::Active {
            shared.in_group_put = true;
        }
    }

    fn end_group_put(&self, _record: &RecordGuard<'_>) {
        let published = {
            let mut shared = self.shared.lock();
            if shared.state != MonitorState::Active {
                return;
            }
            shared.in_group_put = false;
            shared.pending_change && self.publish(&mut shared)
        };
        if published {
            self.requester.monitor_event();
        }
    }

    fn unlisten(&self, _record: &RecordGuard<'_>) {
        {
            let mut shared = self.shared.lock();
            if shared.state == MonitorState::Destroyed {
                return;
            }
            shared.state = MonitorState::Destroyed;
        }
        if self.record.trace_level() > 0 {
            debug!(record = %self.record.name(), "monitor unlisten");
        }
        self.requester.unlisten();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{PvStructure, ScalarType, Structure, Value};

    fn record() -> Arc<Record> {
        // 0:root 1:value 2:alarm{ 3:severity 4:message }
        Record::new(
            "counter",
            PvStructure::from_structure(
                &Structure::builder()
                    .add("value", ScalarType::Int)
                    .add_nested("alarm")
                    .add("severity", ScalarType::Int)
                    .add("message", ScalarType::String)
                    .end_nested()
                    .build(),
            ),
        )
    }

    fn monitor(record: &Arc<Record>, request: &str) -> (Monitor, Arc<MonitorStream>) {
        let stream = MonitorStream::new(64);
        let monitor = Monitor::create(record, stream.clone(), request).unwrap();
        (monitor, stream)
    }

    fn bump(record: &Record, value: i32) {
        let guard = record.lock();
        guard.begin_group_put();
        guard.put_path("value", Value::Int(value)).unwrap();
        guard.end_group_put();
    }

    #[test]
    fn create_reports_connect() {
        let record = record();
        let (monitor, stream) = monitor(&record, "field(value)");
        assert_eq!(monitor.state(), MonitorState::Idle);
        assert_eq!(monitor.queue_size(), 2);
        match stream.try_recv() {
            Some(MonitorNotification::Connected { status, layout: Some(layout) }) => {
                assert!(status.is_ok());
                assert_eq!(layout.find("value"), Some(1));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn bad_request_fails_creation() {
        let record = record();
        let stream = MonitorStream::new(8);
        assert!(Monitor::create(&record, stream.clone(), "field(nope)").is_err());
        assert!(Monitor::create(&record, stream.clone(), "record[queueSize=x]").is_err());
        let fatal = stream
            .drain()
            .into_iter()
            .filter(|n| matches!(n, MonitorNotification::Connected { status, .. } if status.kind() == StatusType::Fatal))
            .count();
        assert_eq!(fatal, 2);
    }

    #[test]
    fn first_poll_is_full_snapshot() {
        let record = record();
        record.lock().put_path("value", Value::Int(7)).unwrap();
        let (monitor, stream) = monitor(&record, "");
        assert!(monitor.start().is_ok());
        assert!(stream.drain().iter().any(|n| matches!(n, MonitorNotification::Event)));

        let element = monitor.poll().unwrap();
        assert!(element.changed().get(0));
        assert!(element.overrun().is_empty());
        assert_eq!(element.data().int("value").unwrap(), 7);
        monitor.release(element);
        assert!(monitor.poll().is_none());
    }

    #[test]
    fn single_change_sets_changed_only() {
        let record = record();
        let (monitor, _stream) = monitor(&record, "field(value,alarm)");
        monitor.start();
        monitor.release(monitor.poll().unwrap());

        record.lock().put_path("alarm.severity", Value::Int(2)).unwrap();
        let element = monitor.poll().unwrap();
        let severity = monitor.projection().copy_layout().find("alarm.severity").unwrap();
        assert_eq!(element.changed().iter().collect::<Vec<_>>(), vec![severity]);
        assert!(element.overrun().is_empty());
        assert_eq!(element.data().int("alarm.severity").unwrap(), 2);
    }

    #[test]
    fn double_change_in_group_sets_overrun() {
        let record = record();
        let (monitor, _stream) = monitor(&record, "field(value,alarm)");
        monitor.start();
        monitor.release(monitor.poll().unwrap());

        {
            let guard = record.lock();
            guard.begin_group_put();
            guard.put_path("value", Value::Int(1)).unwrap();
            guard.put_path("value", Value::Int(2)).unwrap();
            assert_eq!(monitor.ready_count(), 0);
            guard.end_group_put();
        }
        let element = monitor.poll().unwrap();
        assert!(element.changed().get(1));
        assert!(element.overrun().get(1));
        assert_eq!(element.data().int("value").unwrap(), 2);
    }

    #[test]
    fn saturated_queue_accumulates() {
        let record = record();
        let (monitor, _stream) = monitor(&record, "record[queueSize=2]");
        monitor.start();
        for value in 1..=5 {
            bump(&record, value);
            assert!(monitor.ready_count() <= 2);
        }
        assert_eq!(monitor.ready_count(), 2);

        let first = monitor.poll().unwrap();
        assert!(first.changed().get(0));
        let second = monitor.poll().unwrap();
        assert_eq!(second.data().int("value").unwrap(), 1);
        assert!(second.overrun().is_empty());

        monitor.release(first);
        let third = monitor.poll().unwrap();
        assert_eq!(third.data().int("value").unwrap(), 5);
        assert!(third.overrun().get(1));
        monitor.release(second);
        monitor.release(third);
        assert!(monitor.poll().is_none());
    }

    #[test]
    fn release_does_not_wait_for_record_lock() {
        let record = record();
        let (monitor, _stream) = monitor(&record, "record[queueSize=2]");
        monitor.start();
        bump(&record, 1);
        bump(&record, 2);
        let first = monitor.poll().unwrap();

        let guard = record.lock();
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        std::thread::scope(|s| {
            s.spawn(|| {
                monitor.release(first);
                done_tx.send(()).unwrap();
            });
            assert!(done_rx.recv_timeout(std::time::Duration::from_secs(5)).is_ok());
        });
        drop(guard);

        assert_eq!(monitor.ready_count(), 2);
        assert_eq!(monitor.poll().unwrap().data().int("value").unwrap(), 1);
        assert_eq!(monitor.poll().unwrap().data().int("value").unwrap(), 2);
    }

    #[test]
    fn start_stop_statuses() {
        let record = record();
        let (monitor, _stream) = monitor(&record, "");
        assert_eq!(monitor.stop(), Status::not_started());
        assert!(monitor.start().is_ok());
        assert_eq!(monitor.start(), Status::already_started());
        assert!(monitor.stop().is_ok());
        assert_eq!(monitor.state(), MonitorState::Idle);

        record.lock().put_path("value", Value::Int(3)).unwrap();
        assert!(monitor.poll().is_none());

        monitor.destroy();
        monitor.destroy();
        assert_eq!(monitor.start(), Status::was_destroyed());
        assert_eq!(monitor.stop(), Status::was_destroyed());
    }

    #[test]
    fn restart_discards_stale_elements() {
        let record = record();
        let (monitor, _stream) = monitor(&record, "");
        monitor.start();
        bump(&record, 1);
        assert_eq!(monitor.ready_count(), 2);
        monitor.stop();
        assert_eq!(monitor.ready_count(), 2);
        monitor.start();
        assert_eq!(monitor.ready_count(), 1);
        let element = monitor.poll().unwrap();
        assert!(element.changed().get(0));
        assert_eq!(element.data().int("value").unwrap(), 1);
    }

    #[test]
    fn record_destroy_unlistens() {
        let record = record();
        let (monitor, stream) = monitor(&record, "");
        monitor.start();
        record.destroy();
        assert_eq!(monitor.state(), MonitorState::Destroyed);
        assert!(stream.drain().iter().any(|n| matches!(n, MonitorNotification::Unlisten)));
    }

    #[test]
    fn drop_detaches_listener() {
        let record = record();
        let (monitor, stream) = monitor(&record, "");
        monitor.start();
        drop(monitor);
        stream.drain();
        record.lock().put_path("value", Value::Int(1)).unwrap();
        assert!(stream.try_recv().is_none());
        assert_eq!(Arc::strong_count(&stream), 1);
    }
}
