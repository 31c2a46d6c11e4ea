use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use pvdb::{PvStructure, Record, ScalarType, Structure, Value};

const ROUNDS: i32 = 2_000;

fn record(name: &str) -> Arc<Record> {
    Record::new(
        name,
        PvStructure::from_structure(&Structure::builder().add("value", ScalarType::Int).build()),
    )
}

/// Lock `first`, then `second` through the ordered helper, `ROUNDS` times.
fn hammer(first: &Record, second: &Record) {
    for round in 0..ROUNDS {
        let outer = first.lock();
        let nested = first.lock();
        let other = nested.lock_other_record(second).unwrap();
        other.put_path("value", Value::Int(round)).unwrap();
        nested.put_path("value", Value::Int(round)).unwrap();
        drop(other);
        drop(nested);
        drop(outer);
    }
}

#[test]
fn opposite_order_locking_does_not_deadlock() {
    let a = record("a");
    let b = record("b");
    assert!(a.id() < b.id());

    let barrier = Arc::new(Barrier::new(2));
    let (done_tx, done_rx) = crossbeam_channel::bounded(2);

    for (first, second) in [(Arc::clone(&a), Arc::clone(&b)), (Arc::clone(&b), Arc::clone(&a))] {
        let barrier = Arc::clone(&barrier);
        let done_tx = done_tx.clone();
        thread::spawn(move || {
            barrier.wait();
            hammer(&first, &second);
            done_tx.send(first.name().to_string()).unwrap();
        });
    }

    for _ in 0..2 {
        done_rx
            .recv_timeout(Duration::from_secs(30))
            .expect("lock_other_record deadlocked");
    }

    assert_eq!(a.lock().int("value").unwrap(), ROUNDS - 1);
    assert_eq!(b.lock().int("value").unwrap(), ROUNDS - 1);
}

/// Spin until `record` is free, meaning its holder parked inside
/// `lock_other_record`.
fn wait_until_released(record: &Record) {
    let deadline = Instant::now() + Duration::from_secs(30);
    while record.try_lock().is_none() {
        assert!(Instant::now() < deadline, "record {} never released", record.name());
        thread::yield_now();
    }
}

#[test]
fn second_owner_during_release_window_keeps_its_own_holds() {
    let low = record("low");
    let high = record("high");
    assert!(low.id() < high.id());

    let held = low.lock();
    let (locked_tx, locked_rx) = crossbeam_channel::bounded(2);
    let workers: Vec<_> = [1, 2]
        .into_iter()
        .map(|value| {
            let (worker_low, worker_high) = (Arc::clone(&low), Arc::clone(&high));
            let locked_tx = locked_tx.clone();
            let worker = thread::spawn(move || {
                let outer = worker_high.lock();
                locked_tx.send(()).unwrap();
                let other = outer.lock_other_record(&worker_low).unwrap();
                other.put_path("value", Value::Int(value)).unwrap();
                outer.put_path("value", Value::Int(value)).unwrap();
            });
            locked_rx.recv_timeout(Duration::from_secs(30)).unwrap();
            wait_until_released(&high);
            worker
        })
        .collect();
    drop(held);

    for worker in workers {
        worker.join().unwrap();
    }
    assert!(high.try_lock().is_some());
    assert_eq!(low.lock().int("value").unwrap(), high.lock().int("value").unwrap());
}

#[test]
fn same_record_relocks_reentrantly() {
    let a = record("self");
    let guard = a.lock();
    let again = guard.lock_other_record(&a).unwrap();
    again.put_path("value", Value::Int(1)).unwrap();
    drop(again);
    assert_eq!(guard.int("value").unwrap(), 1);
}

#[test]
fn try_lock_fails_while_other_thread_holds() {
    let a = record("contended");
    let guard = a.lock();
    thread::scope(|s| {
        s.spawn(|| assert!(a.try_lock().is_none()));
    });
    drop(guard);
    thread::scope(|s| {
        s.spawn(|| assert!(a.try_lock().is_some()));
    });
}
