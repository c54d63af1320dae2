use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use kvarn_config::RuntimeConfig;
use kvarn_core::alloc::PoolParams;
use kvarn_core::prelude::*;

const TOTAL: u32 = 500;

#[test]
fn atomic_queue_is_held_by_one_worker_at_a_time() {
    let ctx = RuntimeContext::new(RuntimeConfig {
        max_pools: 4,
        max_queues: 8,
        max_workers: 4,
        sched_priorities: 1,
        sched_batch: 4,
        local_cache_limit: 4,
        ..Default::default()
    })
    .unwrap();
    let pool_id = ctx.create_pool(PoolParams::buffer("seq", 64, 8)).unwrap();
    let queue = ctx
        .create_queue(QueueParams::scheduled("ordered-flow", Discipline::Atomic, 0))
        .unwrap();

    let inside = Arc::new(AtomicUsize::new(0));
    let expected = Arc::new(AtomicU32::new(0));
    let holders = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let ctx = Arc::clone(&ctx);
            let inside = Arc::clone(&inside);
            let expected = Arc::clone(&expected);
            let holders = Arc::clone(&holders);
            thread::spawn(move || {
                let mut worker = Worker::new(&ctx).unwrap();
                let pool = ctx.pool(pool_id).unwrap();
                let mut events = Vec::new();
                let mut served = false;
                while expected.load(Ordering::Acquire) < TOTAL {
                    if worker
                        .schedule(Wait::Timeout(Duration::from_millis(5)), 3, &mut events)
                        .is_none()
                    {
                        continue;
                    }
                    assert_eq!(inside.fetch_add(1, Ordering::AcqRel), 0, "two holders at once");
                    for event in events.drain(..) {
                        let seq = u32::from_le_bytes(pool.data(&event).unwrap()[..4].try_into().unwrap());
                        assert_eq!(seq, expected.load(Ordering::Acquire), "out of order");
                        expected.fetch_add(1, Ordering::AcqRel);
                        worker.free(event).unwrap();
                    }
                    inside.fetch_sub(1, Ordering::AcqRel);
                    served = true;
                }
                if served {
                    holders.fetch_add(1, Ordering::AcqRel);
                }
            })
        })
        .collect();

    let pool = ctx.pool(pool_id).unwrap();
    for seq in 0..TOTAL {
        let mut buf = loop {
            match pool.alloc_shared(4) {
                Ok(buf) => break buf,
                Err(CoreError::PoolExhausted(_)) => thread::yield_now(),
                Err(e) => panic!("unexpected {e}"),
            }
        };
        pool.data_mut(&mut buf).unwrap()[..4].copy_from_slice(&seq.to_le_bytes());
        ctx.enqueue(queue, buf).unwrap();
    }

    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(expected.load(Ordering::Acquire), TOTAL);
    assert!(holders.load(Ordering::Acquire) >= 1);
}
