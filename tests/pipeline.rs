//! Pipeline conservation and batching behavior under real threads.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use herdcrack::pipeline::{DpQueue, BATCHING_DELAY};
use herdcrack::types::{Dist, Dp, XCoord};

fn dp(tag: u64) -> Dp {
    Dp {
        x: XCoord([tag, 0, 0, 0]),
        dist: Dist::from_u64(tag),
        kidx: tag,
    }
}

/// pushed == popped + depth at every quiescent point, across producers.
#[test]
fn conservation_across_many_producers() {
    let q = Arc::new(DpQueue::new());
    let mut producers = Vec::new();
    for lane in 0..8u32 {
        let q = Arc::clone(&q);
        producers.push(thread::spawn(move || {
            for i in 0..250u64 {
                if i % 3 == 0 {
                    q.push_batch(&[dp(i), dp(i + 1)], lane, 0);
                } else {
                    q.push(dp(i), lane, 0);
                }
            }
        }));
    }
    for p in producers {
        p.join().unwrap();
    }
    let (pushed, popped) = q.totals();
    assert_eq!(pushed, popped + q.depth() as u64);

    let mut total = 0;
    while q.depth() > 0 {
        total += q
            .pop_batch(128, Duration::from_millis(100), Duration::from_millis(1))
            .len();
    }
    let (pushed, popped) = q.totals();
    assert_eq!(pushed, popped);
    assert_eq!(popped as usize, total);
}

/// A 10 ms trickle against the 50 ms batching window coalesces several DPs
/// per pop and keeps push-to-pop latency bounded.
#[test]
fn trickle_coalesces_with_bounded_latency() {
    let q = Arc::new(DpQueue::new());
    let producer = {
        let q = Arc::clone(&q);
        thread::spawn(move || {
            for i in 0..30u64 {
                q.push(dp(i), 0, 0);
                thread::sleep(Duration::from_millis(10));
            }
        })
    };

    let started = Instant::now();
    let mut batch_sizes = Vec::new();
    let mut popped = 0;
    while popped < 30 {
        let batch = q.pop_batch(64, Duration::from_secs(2), BATCHING_DELAY);
        if batch.is_empty() {
            continue;
        }
        popped += batch.len();
        batch_sizes.push(batch.len());
    }
    producer.join().unwrap();

    // the window should usually swallow 4-6 items per call; demand at
    // least one multi-item batch and a sane upper bound on call count
    assert!(batch_sizes.iter().any(|&s| s >= 3), "sizes {batch_sizes:?}");
    assert!(batch_sizes.len() <= 15, "too many batches: {batch_sizes:?}");
    // 30 items at 10 ms spacing: everything pops well inside a second of
    // the last push
    assert!(started.elapsed() < Duration::from_secs(2));
}

/// Shutdown mid-stream: consumers drain the tail, then observe empty pops.
#[test]
fn shutdown_drains_cleanly() {
    let q = Arc::new(DpQueue::new());
    q.push_batch(&(0..100u64).map(dp).collect::<Vec<_>>(), 2, 1);
    q.request_shutdown();

    let mut total = 0;
    loop {
        let batch = q.pop_batch(32, Duration::from_millis(50), Duration::from_millis(5));
        if batch.is_empty() {
            break;
        }
        // lane and gpu tags survive the queue
        assert!(batch.iter().all(|item| item.lane == 2 && item.gpu == 1));
        total += batch.len();
    }
    assert_eq!(total, 100);
    let (pushed, popped) = q.totals();
    assert_eq!(pushed, popped);
}
