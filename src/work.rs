//! Work partitioner
//!
//! Carves [0, 2^n) into power-of-two ranges and hands them to workers keyed
//! by client id. A reconnecting worker gets its old range back; a range with
//! no progress for the grace period returns to the pool. Ranges are
//! deterministic from (n, piece count), so nothing here needs persistence;
//! the DP store checkpoint is what carries real state.

use std::time::{Duration, Instant};

use num_bigint::BigUint;
use std::sync::Mutex;

use crate::types::ClientId;

/// Default grace period before a silent worker loses its range.
pub const GRACE_PERIOD: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct WorkRange {
    pub index: u32,
    pub start: BigUint,
    pub end: BigUint,
    pub assigned_to: Option<ClientId>,
    pub last_progress: Option<Instant>,
    /// Rough completion estimate fed by worker STATS frames.
    pub completed_fraction: f64,
}

pub struct WorkTable {
    ranges: Mutex<Vec<WorkRange>>,
    grace: Duration,
    width_bits: u32,
}

impl WorkTable {
    /// Split [0, 2^interval_bits) into `expected_workers << overshoot`
    /// pieces (rounded to a power of two, at least one).
    pub fn partition(
        interval_bits: u32,
        expected_workers: u32,
        overshoot: u32,
        grace: Duration,
    ) -> Self {
        let pieces = (expected_workers.max(1) << overshoot).next_power_of_two();
        // never slice below 2^8-wide ranges
        let piece_bits = (pieces.trailing_zeros()).min(interval_bits.saturating_sub(8));
        let pieces = 1u32 << piece_bits;
        let width_bits = interval_bits - piece_bits;
        let width = BigUint::from(1u8) << width_bits as usize;
        let ranges = (0..pieces)
            .map(|i| {
                let start = BigUint::from(i) * &width;
                WorkRange {
                    index: i,
                    end: &start + &width,
                    start,
                    assigned_to: None,
                    last_progress: None,
                    completed_fraction: 0.0,
                }
            })
            .collect();
        WorkTable {
            ranges: Mutex::new(ranges),
            grace,
            width_bits,
        }
    }

    pub fn width_bits(&self) -> u32 {
        self.width_bits
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<WorkRange>> {
        match self.ranges.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Range for a connecting worker: its previous assignment if still held,
    /// else the first free range, else the stalest one (duplicate coverage
    /// is harmless, DPs are idempotent).
    pub fn assign(&self, client: ClientId) -> (BigUint, BigUint) {
        let mut ranges = self.lock();
        let now = Instant::now();

        if let Some(r) = ranges.iter_mut().find(|r| r.assigned_to == Some(client)) {
            r.last_progress = Some(now);
            return (r.start.clone(), r.end.clone());
        }
        if let Some(r) = ranges.iter_mut().find(|r| r.assigned_to.is_none()) {
            r.assigned_to = Some(client);
            r.last_progress = Some(now);
            return (r.start.clone(), r.end.clone());
        }
        let stalest = ranges
            .iter_mut()
            .min_by_key(|r| r.last_progress)
            .expect("partition never yields zero ranges");
        stalest.assigned_to = Some(client);
        stalest.last_progress = Some(now);
        (stalest.start.clone(), stalest.end.clone())
    }

    /// Record liveness (and optionally an ops count) for a worker.
    pub fn report_progress(&self, client: ClientId, ops: Option<u64>) {
        let mut ranges = self.lock();
        if let Some(r) = ranges.iter_mut().find(|r| r.assigned_to == Some(client)) {
            r.last_progress = Some(Instant::now());
            if let Some(ops) = ops {
                // expected work for one range is ~2^(width/2 + 1)
                let expected = (1u128 << (self.width_bits.min(120) / 2 + 1)) as f64;
                r.completed_fraction = (ops as f64 / expected).min(1.0);
            }
        }
    }

    /// Free every range whose worker has been silent past the grace period.
    /// Returns how many went back to the pool.
    pub fn release_expired(&self) -> usize {
        let mut ranges = self.lock();
        let now = Instant::now();
        let mut released = 0;
        for r in ranges.iter_mut() {
            if r.assigned_to.is_some() {
                let stale = match r.last_progress {
                    Some(t) => now.duration_since(t) > self.grace,
                    None => true,
                };
                if stale {
                    r.assigned_to = None;
                    r.last_progress = None;
                    released += 1;
                }
            }
        }
        released
    }

    pub fn assigned_count(&self) -> usize {
        self.lock().iter().filter(|r| r.assigned_to.is_some()).count()
    }

    pub fn range_count(&self) -> usize {
        self.lock().len()
    }
}
