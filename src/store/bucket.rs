//! Sorted DP buckets
//!
//! A bucket holds the entries whose x shares the bucket index. Entries are
//! kept sorted by the stored x-suffix so lookup is a binary search. The
//! comparator is `Ord` on `[u64; 4]` with the most-significant limb at
//! index 0, the same limb order the wire uses, which is what keeps match
//! detection honest.

use crate::types::{Dist, Herd};

/// One stored distinguished point. `suffix` is the part of x not consumed
/// by the bucket index; `origin` identifies the delivering connection so a
/// reset directive can find its way back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredDp {
    pub suffix: [u64; 4],
    pub dist: Dist,
    pub kidx: u64,
    pub origin: u32,
}

impl StoredDp {
    pub fn herd(&self) -> Herd {
        Herd::from_kidx(self.kidx)
    }
}

#[derive(Debug, Default)]
pub struct Bucket {
    entries: Vec<StoredDp>,
}

impl Bucket {
    /// Binary search by suffix: `Ok(pos)` on a match, `Err(pos)` with the
    /// sorted insertion point otherwise.
    pub fn find(&self, suffix: &[u64; 4]) -> Result<usize, usize> {
        self.entries.binary_search_by(|e| e.suffix.cmp(suffix))
    }

    pub fn insert_at(&mut self, pos: usize, entry: StoredDp) {
        self.entries.insert(pos, entry);
    }

    pub fn get(&self, pos: usize) -> &StoredDp {
        &self.entries[pos]
    }

    pub fn get_mut(&mut self, pos: usize) -> &mut StoredDp {
        &mut self.entries[pos]
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StoredDp> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::cmp::Ordering;

    fn entry(suffix: [u64; 4]) -> StoredDp {
        StoredDp {
            suffix,
            dist: Dist::ZERO,
            kidx: 0,
            origin: 0,
        }
    }

    #[test]
    fn insertion_keeps_sorted_order() {
        let mut b = Bucket::default();
        for suffix in [[0, 0, 0, 9], [0, 3, 0, 0], [0, 0, 7, 7], [1, 0, 0, 0]] {
            let pos = b.find(&suffix).unwrap_err();
            b.insert_at(pos, entry(suffix));
        }
        let collected: Vec<_> = b.iter().map(|e| e.suffix).collect();
        let mut sorted = collected.clone();
        sorted.sort();
        assert_eq!(collected, sorted);
        assert!(b.find(&[0, 3, 0, 0]).is_ok());
        assert!(b.find(&[0, 3, 0, 1]).is_err());
    }

    #[test]
    fn comparator_is_msb_limb_first() {
        // a high limb difference must dominate any low limb difference
        assert_eq!([1u64, 0, 0, 0].cmp(&[0, u64::MAX, u64::MAX, u64::MAX]), Ordering::Greater);
        assert_eq!([0u64, 0, 0, 1].cmp(&[0, 0, 0, 2]), Ordering::Less);
    }

    #[test]
    fn comparator_total_antisymmetric_transitive() {
        let mut rng = StdRng::seed_from_u64(42);
        let vals: Vec<[u64; 4]> = (0..64)
            .map(|_| {
                // cluster limbs into a small space so equal pairs occur
                [rng.gen_range(0..3u64), rng.gen_range(0..3), rng.gen_range(0..3), rng.gen_range(0..3)]
            })
            .collect();
        for a in &vals {
            for b in &vals {
                // exactly one of <, =, > holds
                let lt = a < b;
                let eq = a == b;
                let gt = a > b;
                assert_eq!([lt, eq, gt].iter().filter(|v| **v).count(), 1);
                // antisymmetry
                assert_eq!(a.cmp(b), b.cmp(a).reverse());
                for c in &vals {
                    if a <= b && b <= c {
                        assert!(a <= c);
                    }
                }
            }
        }
    }
}
