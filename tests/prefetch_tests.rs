//! Connection prefetch mailbox under concurrent stress.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use rand::Rng;
use sitl_bridge::sync::{SimGate, mailbox, spawn_prefetcher};

/// Stand-in for a connection; tracks how many exist at once.
struct Conn {
    id: u64,
    live: Arc<AtomicUsize>,
}

impl Drop for Conn {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

#[test]
fn at_most_one_unconsumed_connection() {
    const ROUNDS: u64 = 500;
    let (producer, consumer) = mailbox::<Conn>();
    let counters = producer.counters();
    let live = Arc::new(AtomicUsize::new(0));
    let next_id = Arc::new(AtomicU64::new(0));
    let violations = Arc::new(AtomicU64::new(0));

    let (l, n, v, c) = (live.clone(), next_id.clone(), violations.clone(), counters.clone());
    let _producer = spawn_prefetcher(
        "stress-prefetch",
        producer,
        move || {
            // every earlier connection must already be in the consumer's hands
            if c.delivered() != c.taken() {
                v.fetch_add(1, Ordering::SeqCst);
            }
            let delay = rand::rng().random_range(0..200);
            thread::sleep(Duration::from_micros(delay));
            l.fetch_add(1, Ordering::SeqCst);
            Ok(Conn { id: n.fetch_add(1, Ordering::SeqCst), live: l.clone() })
        },
        Duration::from_millis(1),
    )
    .unwrap();

    let mut max_live = 0;
    for expected in 0..ROUNDS {
        let conn = consumer.take_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(conn.id, expected);
        // the one in hand plus at most one being prefetched
        max_live = max_live.max(live.load(Ordering::SeqCst));
        let work = rand::rng().random_range(0..200);
        thread::sleep(Duration::from_micros(work));
        drop(conn);
    }

    assert_eq!(violations.load(Ordering::SeqCst), 0);
    assert!(max_live <= 2, "{max_live} connections alive at once");
    assert!(counters.taken() >= ROUNDS);
}

#[test]
fn gate_paces_consumer_to_producer_ticks() {
    let gate = SimGate::new();
    let ticks = 200;
    let producer_gate = gate.clone();
    let producer = thread::spawn(move || {
        for _ in 0..ticks {
            // wait for the previous tick to be consumed
            while producer_gate.is_open() {
                thread::yield_now();
            }
            producer_gate.release();
        }
    });

    let mut steps = 0;
    while steps < ticks {
        if gate.try_acquire() {
            steps += 1;
        } else {
            thread::yield_now();
        }
    }
    producer.join().unwrap();
    assert!(!gate.try_acquire());
    assert_eq!(steps, ticks);
}
