//! Delivery queue tests.

use framecomm::DeliveryQueue;
use std::collections::HashSet;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn fifo_order() {
    let queue = DeliveryQueue::new();
    for i in 0..10u32 {
        queue.push(i);
    }
    assert_eq!(queue.len(), 10);
    let popped: Vec<u32> = (0..10).map(|_| queue.pop()).collect();
    assert_eq!(popped, (0..10).collect::<Vec<_>>());
    assert!(queue.is_empty());
}

#[test]
fn default_item_type_is_bytes() {
    let queue: DeliveryQueue = DeliveryQueue::default();
    queue.push(b"hello".to_vec());
    assert_eq!(queue.try_pop(), Some(b"hello".to_vec()));
}

#[test]
fn try_pop_on_empty_queue() {
    let queue: DeliveryQueue<u8> = DeliveryQueue::new();
    assert_eq!(queue.try_pop(), None);
    queue.push(1);
    assert_eq!(queue.try_pop(), Some(1));
    assert_eq!(queue.try_pop(), None);
}

#[test]
fn pop_timeout_expires_on_empty_queue() {
    let queue: DeliveryQueue<u8> = DeliveryQueue::new();
    let start = Instant::now();
    assert_eq!(queue.pop_timeout(Duration::from_millis(50)), None);
    assert!(start.elapsed() >= Duration::from_millis(50));
}

#[test]
fn pop_timeout_returns_pushed_item() {
    let queue = Arc::new(DeliveryQueue::new());
    let producer = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            queue.push(7u8);
        })
    };
    assert_eq!(queue.pop_timeout(Duration::from_secs(5)), Some(7));
    producer.join().expect("Producer panicked");
}

#[test]
fn pop_blocks_until_push() {
    let queue = Arc::new(DeliveryQueue::new());
    let (tx, rx) = mpsc::channel();

    let consumer = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || {
            let item = queue.pop();
            tx.send(item).expect("Failed to report item");
        })
    };

    // Nothing to pop yet
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

    queue.push("wake up");
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(5)).expect("Consumer never woke"),
        "wake up"
    );
    consumer.join().expect("Consumer panicked");
}

/// Several producers and consumers: every item is delivered exactly once, and
/// each consumer sees each producer's items in push order.
#[test]
fn concurrent_producers_and_consumers() {
    const PRODUCERS: usize = 4;
    const CONSUMERS: usize = 3;
    const PER_PRODUCER: usize = 2_000;

    let queue: Arc<DeliveryQueue<Option<(usize, usize)>>> = Arc::new(DeliveryQueue::new());

    let consumers: Vec<_> = (0..CONSUMERS)
        .map(|_| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let mut seen = Vec::new();
                while let Some(item) = queue.pop() {
                    seen.push(item);
                }
                seen
            })
        })
        .collect();

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for seq in 0..PER_PRODUCER {
                    queue.push(Some((p, seq)));
                }
            })
        })
        .collect();

    for producer in producers {
        producer.join().expect("Producer panicked");
    }
    // One stop marker per consumer
    for _ in 0..CONSUMERS {
        queue.push(None);
    }

    let mut all = HashSet::new();
    for consumer in consumers {
        let seen = consumer.join().expect("Consumer panicked");
        let mut last = vec![None; PRODUCERS];
        for (p, seq) in seen {
            if let Some(prev) = last[p] {
                assert!(seq > prev, "Producer {p} out of order: {seq} after {prev}");
            }
            last[p] = Some(seq);
            assert!(all.insert((p, seq)), "Duplicate delivery of {p}/{seq}");
        }
    }
    assert_eq!(all.len(), PRODUCERS * PER_PRODUCER);
    assert!(queue.is_empty());
}

#[test]
fn single_consumer_sees_each_producer_in_order() {
    const PRODUCERS: usize = 3;
    const PER_PRODUCER: usize = 1_000;

    let queue = Arc::new(DeliveryQueue::new());
    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for seq in 0..PER_PRODUCER {
                    queue.push((p, seq));
                }
            })
        })
        .collect();

    let mut next = vec![0; PRODUCERS];
    for _ in 0..PRODUCERS * PER_PRODUCER {
        let (p, seq) = queue.pop();
        assert_eq!(seq, next[p]);
        next[p] += 1;
    }
    for producer in producers {
        producer.join().expect("Producer panicked");
    }
    assert_eq!(next, vec![PER_PRODUCER; PRODUCERS]);
}
