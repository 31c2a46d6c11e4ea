use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::data::Layout;
use crate::error::{DatabaseError, DbResult, Status, StatusType};

use super::MonitorRequester;

/// A requester callback, as delivered by [`MonitorStream`].
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub enum MonitorNotification {
    Connected {
        status: Status,
        layout: Option<Arc<Layout>>,
    },
    Event,
    Unlisten,
    Message {
        kind: StatusType,
        message: String,
    },
}

/// Requester that forwards every callback onto a bounded channel.
///
/// Callbacks run with the record locked, so sending never blocks: when the
/// channel is full the notification is dropped and counted. A dropped
/// `Event` loses nothing, because polling drains every ready element.
#[derive(Debug)]
pub struct MonitorStream {
    tx: Sender<MonitorNotification>,
    rx: Receiver<MonitorNotification>,
    dropped: AtomicU64,
}

impl MonitorStream {
    /// Stream with room for `capacity` undelivered notifications.
    #[must_use]
    pub fn new(capacity: usize) -> Arc<Self> {
        let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
        Arc::new(Self {
            tx,
            rx,
            dropped: AtomicU64::new(0),
        })
    }

    /// Notifications discarded because the channel was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Next notification, waiting at most `timeout`.
    ///
    /// # Errors
    ///
    /// `Timeout` when nothing arrives in time.
    pub fn recv_timeout(&self, timeout: Duration) -> DbResult<MonitorNotification> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => DatabaseError::Timeout {
                duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            },
            RecvTimeoutError::Disconnected => DatabaseError::Destroyed {
                what: "monitor stream".to_string(),
            },
        })
    }

    /// Next notification if one is waiting.
    #[must_use]
    pub fn try_recv(&self) -> Option<MonitorNotification> {
        self.rx.try_recv().ok()
    }

    /// Every waiting notification.
    #[must_use]
    pub fn drain(&self) -> Vec<MonitorNotification> {
        self.rx.try_iter().collect()
    }

    fn send(&self, notification: MonitorNotification) {
        match self.tx.try_send(notification) {
            Ok(()) => {}
            Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

impl MonitorRequester for MonitorStream {
    fn monitor_connect(&self, status: &Status, layout: Option<&Arc<Layout>>) {
        self.send(MonitorNotification::Connected {
            status: status.clone(),
            layout: layout.cloned(),
        });
    }

    fn monitor_event(&self) {
        self.send(MonitorNotification::Event);
    }

    fn unlisten(&self) {
        self.send(MonitorNotification::Unlisten);
    }

    fn message(&self, message: &str, kind: StatusType) {
        self.send(MonitorNotification::Message {
            kind,
            message: message.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_channel_counts_drops() {
        let stream = MonitorStream::new(1);
        stream.monitor_event();
        stream.monitor_event();
        assert_eq!(stream.dropped(), 1);
        assert!(matches!(stream.try_recv(), Some(MonitorNotification::Event)));
        assert!(stream.try_recv().is_none());
    }

    #[test]
    fn recv_timeout_reports_timeout() {
        let stream = MonitorStream::new(4);
        let err = stream.recv_timeout(Duration::from_millis(5)).unwrap_err();
        assert!(matches!(err, DatabaseError::Timeout { duration_ms: 5 }));
    }

    #[test]
    fn forwards_connect_and_messages() {
        let stream = MonitorStream::new(4);
        stream.monitor_connect(&Status::ok(), None);
        stream.message("hello", StatusType::Warning);
        let all = stream.drain();
        assert_eq!(all.len(), 2);
        assert!(matches!(&all[0], MonitorNotification::Connected { status, layout: None } if status.is_ok()));
        assert!(matches!(&all[1], MonitorNotification::Message { kind: StatusType::Warning, message } if message == "hello"));
    }
}
