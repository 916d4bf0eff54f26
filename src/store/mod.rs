//! Central distinguished-point store
//!
//! A fixed table of 2^H sorted buckets indexed by the high H bits of x,
//! sharded 256 ways by the top bits of the bucket index so insert contention
//! scales with worker count. `add` holds exactly one shard lock across
//! lookup and insert, which is what makes cross-herd detection monotonic:
//! once a matching pair is admitted, the later `add` observes the earlier
//! entry and reports the collision.

pub mod bucket;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use log::warn;

use crate::types::{Dist, Dp, Herd, XCoord};
pub use bucket::{Bucket, StoredDp};

/// Top-level shard count; selection uses the top 8 bits of the bucket index.
pub const SHARD_COUNT: usize = 256;
const SHARD_BITS: u32 = 8;

/// A fully-reconstructed stored entry, as carried by collision events and
/// checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DpRecord {
    pub x: XCoord,
    pub dist: Dist,
    pub kidx: u64,
    pub origin: u32,
}

impl DpRecord {
    pub fn herd(&self) -> Herd {
        Herd::from_kidx(self.kidx)
    }
}

/// Two entries with the same x and different herds. `incoming` is the one
/// whose `add` detected the match; on a wrong collision it is the reset
/// target.
#[derive(Debug, Clone, Copy)]
pub struct CollisionEvent {
    pub stored: DpRecord,
    pub incoming: DpRecord,
}

impl CollisionEvent {
    pub fn tame(&self) -> &DpRecord {
        if self.stored.herd() == Herd::Tame {
            &self.stored
        } else {
            &self.incoming
        }
    }

    pub fn wild(&self) -> &DpRecord {
        if self.stored.herd() == Herd::Wild {
            &self.stored
        } else {
            &self.incoming
        }
    }
}

/// Closed result set of an insert.
#[derive(Debug, Clone, Copy)]
pub enum AddOutcome {
    /// No x match; the entry is now stored.
    Added,
    /// x match within the same herd. `resend` when the distance also
    /// matched (an idempotent retransmit); otherwise two walks of one herd
    /// merged and the shorter distance was kept.
    SameHerdDuplicate { resend: bool },
    /// x match across herds: the winning condition, handed to the resolver.
    CrossHerdCollision(CollisionEvent),
}

pub struct DpStore {
    hash_bits: u32,
    dp_mask: u64,
    buckets_per_shard: u32,
    shards: Vec<Mutex<Vec<Bucket>>>,
    stored: AtomicU64,
    tame: AtomicU64,
    wild: AtomicU64,
    resends: AtomicU64,
    same_herd_merges: AtomicU64,
    rejected: AtomicU64,
}

/// Coarse occupancy picture for the periodic statistics line.
#[derive(Debug, Clone, Copy, Default)]
pub struct Occupancy {
    pub nonempty_buckets: u64,
    pub max_bucket: usize,
    pub entries: u64,
}

impl DpStore {
    /// `hash_bits` in 18..=22 per the sizing envelope; `dp_bits` is only
    /// used to validate incoming DPs.
    pub fn new(hash_bits: u32, dp_bits: u32) -> Self {
        assert!(
            (SHARD_BITS..=22).contains(&hash_bits),
            "hash_bits out of range"
        );
        assert!(dp_bits < 64);
        let buckets_per_shard = 1u32 << (hash_bits - SHARD_BITS);
        let shards = (0..SHARD_COUNT)
            .map(|_| {
                Mutex::new((0..buckets_per_shard).map(|_| Bucket::default()).collect())
            })
            .collect();
        DpStore {
            hash_bits,
            dp_mask: (1u64 << dp_bits) - 1,
            buckets_per_shard,
            shards,
            stored: AtomicU64::new(0),
            tame: AtomicU64::new(0),
            wild: AtomicU64::new(0),
            resends: AtomicU64::new(0),
            same_herd_merges: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn hash_bits(&self) -> u32 {
        self.hash_bits
    }

    /// Corruption gate applied before `add`: an x that does not satisfy the
    /// distinguishing mask is dropped and logged, never escalated.
    pub fn validate(&self, dp: &Dp) -> bool {
        if !dp.x.is_distinguished(self.dp_mask) {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            warn!("rejecting DP with undistinguished x {}", dp.x);
            return false;
        }
        true
    }

    /// Insert one DP, holding the shard lock across lookup and insert.
    pub fn add(&self, dp: &Dp, origin: u32) -> AddOutcome {
        let bucket_idx = dp.x.bucket(self.hash_bits);
        let shard_idx = (bucket_idx >> (self.hash_bits - SHARD_BITS)) as usize;
        let local = (bucket_idx & (self.buckets_per_shard - 1)) as usize;
        let suffix = dp.x.suffix(self.hash_bits);

        let mut shard = match self.shards[shard_idx].lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let bucket = &mut shard[local];
        match bucket.find(&suffix) {
            Err(pos) => {
                bucket.insert_at(
                    pos,
                    StoredDp {
                        suffix,
                        dist: dp.dist,
                        kidx: dp.kidx,
                        origin,
                    },
                );
                self.stored.fetch_add(1, Ordering::Relaxed);
                match dp.herd() {
                    Herd::Tame => self.tame.fetch_add(1, Ordering::Relaxed),
                    Herd::Wild => self.wild.fetch_add(1, Ordering::Relaxed),
                };
                AddOutcome::Added
            }
            Ok(pos) => {
                let stored = bucket.get_mut(pos);
                if stored.herd() == dp.herd() {
                    if stored.dist == dp.dist {
                        self.resends.fetch_add(1, Ordering::Relaxed);
                        return AddOutcome::SameHerdDuplicate { resend: true };
                    }
                    // two walks of one herd merged; keep the shorter chain
                    if dp.dist < stored.dist {
                        stored.dist = dp.dist;
                        stored.kidx = dp.kidx;
                        stored.origin = origin;
                    }
                    self.same_herd_merges.fetch_add(1, Ordering::Relaxed);
                    AddOutcome::SameHerdDuplicate { resend: false }
                } else {
                    AddOutcome::CrossHerdCollision(CollisionEvent {
                        stored: DpRecord {
                            x: dp.x,
                            dist: stored.dist,
                            kidx: stored.kidx,
                            origin: stored.origin,
                        },
                        incoming: DpRecord {
                            x: dp.x,
                            dist: dp.dist,
                            kidx: dp.kidx,
                            origin,
                        },
                    })
                }
            }
        }
    }

    pub fn len(&self) -> u64 {
        self.stored.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn tame_count(&self) -> u64 {
        self.tame.load(Ordering::Relaxed)
    }

    pub fn wild_count(&self) -> u64 {
        self.wild.load(Ordering::Relaxed)
    }

    pub fn resend_count(&self) -> u64 {
        self.resends.load(Ordering::Relaxed)
    }

    pub fn same_herd_merge_count(&self) -> u64 {
        self.same_herd_merges.load(Ordering::Relaxed)
    }

    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Walk the shards and summarize bucket occupancy. Takes each shard lock
    /// briefly; meant for the 10 s statistics tick, not hot paths.
    pub fn occupancy(&self) -> Occupancy {
        let mut occ = Occupancy::default();
        for shard in &self.shards {
            let shard = match shard.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            for bucket in shard.iter() {
                if !bucket.is_empty() {
                    occ.nonempty_buckets += 1;
                    occ.max_bucket = occ.max_bucket.max(bucket.len());
                    occ.entries += bucket.len() as u64;
                }
            }
        }
        occ
    }

    /// Snapshot every non-empty bucket for checkpointing. Entries come out
    /// with their full x reconstructed.
    pub fn snapshot(&self) -> Vec<(u32, Vec<DpRecord>)> {
        let mut out = Vec::new();
        for (shard_idx, shard) in self.shards.iter().enumerate() {
            let shard = match shard.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            for (local, bucket) in shard.iter().enumerate() {
                if bucket.is_empty() {
                    continue;
                }
                let bucket_idx =
                    (shard_idx as u32) << (self.hash_bits - SHARD_BITS) | local as u32;
                let entries = bucket
                    .iter()
                    .map(|e| DpRecord {
                        x: XCoord::from_bucket_suffix(bucket_idx, e.suffix, self.hash_bits),
                        dist: e.dist,
                        kidx: e.kidx,
                        origin: e.origin,
                    })
                    .collect();
                out.push((bucket_idx, entries));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dp(x: XCoord, dist: u64, kidx: u64) -> Dp {
        Dp {
            x,
            dist: Dist::from_u64(dist),
            kidx,
        }
    }

    fn x(hi: u64, lo: u64) -> XCoord {
        // low limb stays DP-friendly for dp_bits = 0 tests
        XCoord([hi, 0, 0, lo])
    }

    #[test]
    fn add_then_lookup_same_herd_cross_herd() {
        let store = DpStore::new(18, 0);
        let a = dp(x(1, 2), 10, 2);
        assert!(matches!(store.add(&a, 0), AddOutcome::Added));
        assert!(matches!(
            store.add(&a, 0),
            AddOutcome::SameHerdDuplicate { resend: true }
        ));
        // same herd, different walker and distance
        assert!(matches!(
            store.add(&dp(x(1, 2), 14, 4), 0),
            AddOutcome::SameHerdDuplicate { resend: false }
        ));
        // different herd
        match store.add(&dp(x(1, 2), 99, 3), 7) {
            AddOutcome::CrossHerdCollision(ev) => {
                assert_eq!(ev.tame().dist, Dist::from_u64(10));
                assert_eq!(ev.wild().dist, Dist::from_u64(99));
                assert_eq!(ev.incoming.kidx, 3);
                assert_eq!(ev.incoming.origin, 7);
            }
            other => panic!("expected collision, got {other:?}"),
        }
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn idempotent_insert_leaves_observables_unchanged() {
        let store = DpStore::new(18, 0);
        let a = dp(x(0xdead, 0xbeef), 42, 8);
        store.add(&a, 1);
        let (len, tame, merges) = (store.len(), store.tame_count(), store.same_herd_merge_count());
        store.add(&a, 1);
        assert_eq!(store.len(), len);
        assert_eq!(store.tame_count(), tame);
        assert_eq!(store.same_herd_merge_count(), merges);
        assert_eq!(store.resend_count(), 1);
    }

    #[test]
    fn same_herd_merge_keeps_shorter_distance() {
        let store = DpStore::new(18, 0);
        store.add(&dp(x(5, 5), 14, 4), 0);
        store.add(&dp(x(5, 5), 10, 2), 0);
        assert_eq!(store.same_herd_merge_count(), 1);
        // the shorter chain should now win the cross-herd event
        match store.add(&dp(x(5, 5), 50, 1), 0) {
            AddOutcome::CrossHerdCollision(ev) => {
                assert_eq!(ev.tame().dist, Dist::from_u64(10));
                assert_eq!(ev.tame().kidx, 2);
            }
            other => panic!("expected collision, got {other:?}"),
        }
        // longer distance never overwrites
        store.add(&dp(x(5, 5), 30, 6), 0);
        match store.add(&dp(x(5, 5), 50, 1), 0) {
            AddOutcome::CrossHerdCollision(ev) => assert_eq!(ev.tame().dist, Dist::from_u64(10)),
            other => panic!("expected collision, got {other:?}"),
        }
    }

    #[test]
    fn herd_is_rederived_from_kidx_parity() {
        // a kidx corrupted by xor 1 flips the herd; the store never trusts
        // anything but the parity bit, so the flipped entry pairs against
        // the true-parity one as cross-herd (verification catches it later)
        let store = DpStore::new(18, 0);
        store.add(&dp(x(9, 9), 10, 2), 0);
        let corrupted = dp(x(9, 9), 10, 2 ^ 1);
        match store.add(&corrupted, 0) {
            AddOutcome::CrossHerdCollision(ev) => {
                assert_eq!(ev.tame().kidx, 2);
                assert_eq!(ev.wild().kidx, 3);
            }
            other => panic!("expected cross-herd from flipped parity, got {other:?}"),
        }
    }

    #[test]
    fn cross_herd_fires_exactly_once_per_matching_pair() {
        let store = DpStore::new(18, 0);
        let mut events = 0;
        let sequence = [
            dp(x(3, 3), 5, 2),
            dp(x(3, 3), 5, 2),  // resend
            dp(x(4, 4), 6, 4),  // unrelated
            dp(x(3, 3), 9, 3),  // wild meets tame -> event
        ];
        for d in &sequence {
            if let AddOutcome::CrossHerdCollision(_) = store.add(d, 0) {
                events += 1;
            }
        }
        assert_eq!(events, 1);
    }

    #[test]
    fn validate_rejects_masked_x() {
        let store = DpStore::new(18, 8);
        assert!(!store.validate(&dp(XCoord([1, 0, 0, 0x101]), 4, 0)));
        assert!(store.validate(&dp(XCoord([1, 0, 0, 0x100]), 4, 0)));
        assert_eq!(store.rejected_count(), 1);
    }

    #[test]
    fn entries_land_in_distinct_buckets_and_shards() {
        let store = DpStore::new(18, 0);
        // stride the bucket index so shard selection moves too
        for hi in 0..512u64 {
            store.add(&dp(x(hi << 55, hi), hi, hi * 2), 0);
        }
        assert_eq!(store.len(), 512);
        let occ = store.occupancy();
        assert_eq!(occ.entries, 512);
        assert!(occ.nonempty_buckets > 256);
    }

    #[test]
    fn snapshot_reconstructs_full_x() {
        let store = DpStore::new(20, 0);
        let orig = dp(XCoord([0xfeed_face_cafe_0000, 1, 2, 0x30]), 77, 6);
        store.add(&orig, 3);
        let snap = store.snapshot();
        assert_eq!(snap.len(), 1);
        let (_, entries) = &snap[0];
        assert_eq!(entries[0].x, orig.x);
        assert_eq!(entries[0].dist, orig.dist);
        assert_eq!(entries[0].kidx, 6);
        assert_eq!(entries[0].origin, 3);
    }

    #[test]
    fn concurrent_adds_detect_the_pair() {
        use std::sync::Arc;
        let store = Arc::new(DpStore::new(18, 0));
        let mut handles = Vec::new();
        // 8 threads hammer disjoint x except one shared target
        for t in 0..8u64 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                let mut events = 0;
                for i in 0..200u64 {
                    let unique = dp(x(t << 50 | i << 20, i), i + 1, t * 2);
                    store.add(&unique, t as u32);
                }
                let shared = dp(x(0x7777_0000_0000_0000, 1), 100 + t, t);
                if let AddOutcome::CrossHerdCollision(_) = store.add(&shared, t as u32) {
                    events += 1;
                }
                events
            }));
        }
        let events: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        // the first add of the shared x stores it; every opposite-parity
        // add afterwards must observe it
        assert!(events >= 1);
    }
}
