use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use pubsub_listener::{Message, Sequencer};

/// Concurrent producers per key, with consumers completing deliveries from
/// other threads. Each key must see its messages in add order and never
/// more than one at a time.
#[test]
fn concurrent_adds_preserve_per_key_order() {
    const KEYS: usize = 4;
    const PER_KEY: usize = 250;

    let (tx, rx) = flume::unbounded::<Message>();
    let in_flight: Arc<Mutex<HashSet<String>>> = Arc::default();
    let violations = Arc::new(AtomicUsize::new(0));

    let (flight, bad) = (Arc::clone(&in_flight), Arc::clone(&violations));
    let sequencer = Arc::new(Sequencer::new(move |m: Message| {
        if !flight.lock().insert(m.ordering_key.clone()) {
            bad.fetch_add(1, Ordering::SeqCst);
        }
        let _ = tx.send(m);
    }));

    let seen: Arc<Mutex<HashMap<String, Vec<usize>>>> = Arc::default();
    let consumers: Vec<_> = (0..3)
        .map(|_| {
            let rx = rx.clone();
            let sequencer = Arc::clone(&sequencer);
            let seen = Arc::clone(&seen);
            let flight = Arc::clone(&in_flight);
            thread::spawn(move || {
                while let Ok(m) = rx.recv_timeout(Duration::from_secs(2)) {
                    let idx: usize = m.message_id.parse().unwrap();
                    seen.lock().entry(m.ordering_key.clone()).or_default().push(idx);
                    flight.lock().remove(&m.ordering_key);
                    sequencer.next(&m).unwrap();
                }
            })
        })
        .collect();

    let producers: Vec<_> = (0..KEYS)
        .map(|k| {
            let sequencer = Arc::clone(&sequencer);
            thread::spawn(move || {
                for i in 0..PER_KEY {
                    sequencer.add(
                        Message::new(format!("k{k}-{i}"), "x")
                            .with_message_id(i.to_string())
                            .with_ordering_key(format!("key-{k}")),
                    );
                }
            })
        })
        .collect();

    for p in producers {
        p.join().unwrap();
    }
    for c in consumers {
        c.join().unwrap();
    }

    assert_eq!(violations.load(Ordering::SeqCst), 0);
    let seen = seen.lock();
    assert_eq!(seen.len(), KEYS);
    for order in seen.values() {
        assert_eq!(*order, (0..PER_KEY).collect::<Vec<_>>());
    }
    assert!(sequencer.is_empty());
}

#[test]
fn unordered_messages_bypass_queues() {
    let delivered = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&delivered);
    let sequencer = Sequencer::new(move |_m: Message| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    // Nothing completes, yet every unordered message is still delivered.
    for i in 0..10 {
        sequencer.add(Message::new(format!("u{i}"), "x"));
    }
    assert_eq!(delivered.load(Ordering::SeqCst), 10);
    assert_eq!(sequencer.key_count(), 0);
    assert!(sequencer.next(&Message::new("u0", "x")).is_ok());
}

#[test]
fn completing_the_wrong_message_is_rejected() {
    let sequencer = Sequencer::new(|_m: Message| {});
    let first = Message::new("a", "x").with_ordering_key("k");
    let second = Message::new("b", "x").with_ordering_key("k");
    sequencer.add(first.clone());
    sequencer.add(second.clone());

    assert!(sequencer.next(&second).is_err());
    assert_eq!(sequencer.pending("k"), 2);
    assert!(sequencer.next(&first).is_ok());
    assert!(sequencer.next(&second).is_ok());
    assert!(sequencer.is_empty());
}
