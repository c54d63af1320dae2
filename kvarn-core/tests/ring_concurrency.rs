use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use kvarn_core::ring::{Ring, Window};

const PRODUCERS: u64 = 4;
const PER_PRODUCER: u64 = 1000;

#[test]
fn concurrent_producers_and_consumers_conserve_items() {
    let ring = Arc::new(Ring::<u64>::with_capacity(64).unwrap());
    let consumed = Arc::new(AtomicUsize::new(0));
    let total = (PRODUCERS * PER_PRODUCER) as usize;

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                let mut items: Vec<u64> = Vec::new();
                let mut next = 0;
                while next < PER_PRODUCER || !items.is_empty() {
                    while items.len() < 7 && next < PER_PRODUCER {
                        items.push(p << 32 | next);
                        next += 1;
                    }
                    if ring.reserve_and_write(&mut items) == 0 {
                        thread::yield_now();
                    }
                }
            })
        })
        .collect();

    let consumers: Vec<_> = (0..2)
        .map(|_| {
            let ring = Arc::clone(&ring);
            let consumed = Arc::clone(&consumed);
            thread::spawn(move || {
                let mut got = Vec::new();
                while consumed.load(Ordering::Acquire) < total {
                    let n = ring.reserve_and_read(&mut got, 16);
                    if n == 0 {
                        thread::yield_now();
                    } else {
                        consumed.fetch_add(n, Ordering::AcqRel);
                    }
                }
                got
            })
        })
        .collect();

    for producer in producers {
        producer.join().unwrap();
    }
    let mut all = HashSet::new();
    for consumer in consumers {
        let got = consumer.join().unwrap();
        // each consumer sees every producer's items in production order
        let mut last = vec![None; PRODUCERS as usize];
        for &item in &got {
            let (p, seq) = ((item >> 32) as usize, item & 0xFFFF_FFFF);
            assert!(last[p].map_or(true, |prev| prev < seq));
            last[p] = Some(seq);
            assert!(all.insert(item), "item {item:#x} delivered twice");
        }
    }
    assert_eq!(all.len(), total);
    assert!(ring.is_empty());
}

#[test]
fn claimed_windows_are_disjoint_and_gap_free() {
    let ring = Arc::new(Ring::<u32>::with_capacity(4096).unwrap());
    let windows = Arc::new(Mutex::new(Vec::<Window>::new()));

    let writers: Vec<_> = (0..4)
        .map(|_| {
            let ring = Arc::clone(&ring);
            let windows = Arc::clone(&windows);
            thread::spawn(move || {
                for _ in 0..100 {
                    let mut batch = vec![0u32; 5];
                    let window = ring.write_window(&mut batch);
                    assert_eq!(window.len, 5);
                    assert!(batch.is_empty());
                    windows.lock().unwrap().push(window);
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    let mut windows = windows.lock().unwrap().clone();
    windows.sort_by_key(|w| w.start);
    let mut cursor = 0;
    for window in &windows {
        assert_eq!(window.start, cursor);
        cursor = window.end();
    }
    assert_eq!(cursor, 2000);
    assert_eq!(ring.len(), 2000);
}
