use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use pvdb::record::FieldNode;
use pvdb::{
    BitSet, Channel, Database, DatabaseConfig, DbResult, Monitor, MonitorNotification, MonitorStream, Projection,
    PvStructure, Record, RecordGuard, RecordListener, RecordSupport, ScalarType, Structure, Value,
};

struct APlusB;

impl RecordSupport for APlusB {
    fn process(&self, rec: &RecordGuard<'_>) -> DbResult<()> {
        let c = rec.double("a")? + rec.double("b")?;
        rec.put_path("c", Value::Double(c))
    }
}

fn aplusb() -> Arc<Record> {
    let data = PvStructure::from_structure(
        &Structure::builder()
            .add("a", ScalarType::Double)
            .add("b", ScalarType::Double)
            .add("c", ScalarType::Double)
            .build(),
    );
    Record::with_support("aplusb", data, APlusB)
}

fn counter(name: &str) -> Arc<Record> {
    let data = PvStructure::from_structure(
        &Structure::builder()
            .add("value", ScalarType::Int)
            .add_structure("timeStamp", Structure::time_stamp())
            .build(),
    );
    Record::new(name, data)
}

fn events(stream: &MonitorStream) -> usize {
    stream
        .drain()
        .iter()
        .filter(|n| matches!(n, MonitorNotification::Event))
        .count()
}

/// Records the value of `c` each time it is announced.
#[derive(Default)]
struct WatchC {
    seen: Mutex<Vec<f64>>,
}

impl RecordListener for WatchC {
    fn data_put(&self, record: &RecordGuard<'_>, _field: &FieldNode) {
        self.seen.lock().push(record.double("c").unwrap());
    }

    fn data_put_sub(&self, record: &RecordGuard<'_>, _requested: &FieldNode, _field: &FieldNode) {
        self.seen.lock().push(record.double("c").unwrap());
    }
}

#[test]
fn aplusb_group_put_notifies_c_once() {
    let record = aplusb();
    let watch = Arc::new(WatchC::default());
    let projection = Projection::from_request(record.layout(), "field(c)").unwrap();
    assert!(record.add_listener(watch.clone(), &projection));

    let stream = MonitorStream::new(16);
    let monitor = Monitor::create(&record, stream.clone(), "field(c)").unwrap();
    assert!(monitor.start().is_ok());
    monitor.release(monitor.poll().unwrap());
    assert_eq!(events(&stream), 1);

    {
        let guard = record.lock();
        guard.begin_group_put();
        guard.put_path("a", Value::Double(1.0)).unwrap();
        guard.put_path("b", Value::Double(1.0)).unwrap();
        guard.process().unwrap();
        guard.end_group_put();
    }

    assert_eq!(*watch.seen.lock(), vec![2.0]);
    assert_eq!(events(&stream), 1);
    let element = monitor.poll().unwrap();
    assert_eq!(element.data().double("c").unwrap(), 2.0);
    assert!(element.overrun().is_empty());
    assert!(monitor.poll().is_none());
}

#[test]
fn capacity_two_coalesces_third_transaction() {
    let db = Database::new(DatabaseConfig::default());
    db.add(counter("counter"));
    let channel = Channel::connect(&db, "counter").unwrap();

    let stream = MonitorStream::new(16);
    let monitor = channel
        .create_monitor(stream.clone(), "record[queueSize=2]field(value,timeStamp)")
        .unwrap();
    assert!(monitor.start().is_ok());

    let put = channel.create_put("record[process=false]field(value)").unwrap();
    for value in 1..=3 {
        let mut buffer = put.new_buffer();
        let bits: BitSet = [buffer.put_path("value", Value::Int(value)).unwrap()].into_iter().collect();
        assert!(put.put(&buffer, &bits).is_ok());
        assert!(monitor.ready_count() <= 2);
    }
    assert_eq!(monitor.ready_count(), 2);

    let initial = monitor.poll().unwrap();
    assert!(initial.changed().get(0));
    let first = monitor.poll().unwrap();
    assert_eq!(first.data().int("value").unwrap(), 1);
    assert!(first.overrun().is_empty());
    assert!(monitor.poll().is_none());

    monitor.release(initial);
    let coalesced = monitor.poll().unwrap();
    let value = monitor.projection().copy_layout().find("value").unwrap();
    assert_eq!(coalesced.data().int("value").unwrap(), 3);
    assert!(coalesced.changed().get(value));
    assert!(coalesced.overrun().get(value));

    monitor.release(first);
    monitor.release(coalesced);
    assert!(monitor.poll().is_none());
}

#[test]
fn consumer_thread_sees_final_value() {
    const PUTS: i32 = 200;

    let record = counter("threaded");
    let stream = MonitorStream::new(1024);
    let monitor = Arc::new(Monitor::create(&record, stream.clone(), "record[queueSize=3]").unwrap());
    assert!(monitor.start().is_ok());

    let consumer = {
        let monitor = Arc::clone(&monitor);
        let stream = Arc::clone(&stream);
        thread::spawn(move || {
            let mut last = -1;
            while last != PUTS {
                stream.recv_timeout(Duration::from_secs(5)).expect("monitor event");
                while let Some(element) = monitor.poll() {
                    last = element.data().int("value").unwrap();
                    monitor.release(element);
                }
            }
            last
        })
    };

    for value in 1..=PUTS {
        let guard = record.lock();
        guard.begin_group_put();
        guard.put_path("value", Value::Int(value)).unwrap();
        guard.process().unwrap();
        guard.end_group_put();
    }

    assert_eq!(consumer.join().unwrap(), PUTS);
    assert_eq!(stream.dropped(), 0);
}

#[test]
fn removed_record_unlistens_monitor() {
    let db = Database::new(DatabaseConfig::default());
    let record = counter("victim");
    db.add(Arc::clone(&record));

    let stream = MonitorStream::new(16);
    let monitor = Monitor::create(&record, stream.clone(), "").unwrap();
    monitor.start();
    stream.drain();

    assert!(db.remove(&record));
    record.destroy();

    assert!(matches!(stream.try_recv(), Some(MonitorNotification::Unlisten)));
    assert!(monitor.poll().is_none());
    assert!(!monitor.start().is_ok());
}
