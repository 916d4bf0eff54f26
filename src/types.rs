//! Shared types for the distributed kangaroo engine
//!
//! Herd tags, the wire x-coordinate limb layout, 192-bit walk distances,
//! distinguished points and the solution report.

use std::cmp::Ordering;
use std::fmt;

use num_bigint::BigUint;
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Bytes of an x-coordinate on the wire.
pub const X_BYTES: usize = 32;
/// Bytes of a walk distance on the wire.
pub const DIST_BYTES: usize = 24;

/// Kangaroo herd. The parity of `kidx` is the single source of truth:
/// even is tame, odd is wild, and the wire never carries a herd byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Herd {
    Tame,
    Wild,
}

impl Herd {
    pub fn from_kidx(kidx: u64) -> Self {
        if kidx & 1 == 0 {
            Herd::Tame
        } else {
            Herd::Wild
        }
    }
}

impl fmt::Display for Herd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Herd::Tame => write!(f, "tame"),
            Herd::Wild => write!(f, "wild"),
        }
    }
}

/// Affine x-coordinate as four 64-bit limbs, most-significant limb first.
///
/// This is the wire layout (MSB-first, limb-big-endian), and `Ord` on the
/// inner array is exactly the comparator the DP store buckets sort by.
/// Keeping both in one type is what makes match detection agree with the
/// serialized form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct XCoord(pub [u64; 4]);

impl XCoord {
    pub const ZERO: XCoord = XCoord([0; 4]);

    pub fn from_be_bytes(bytes: &[u8; X_BYTES]) -> Self {
        let mut limbs = [0u64; 4];
        for (i, limb) in limbs.iter_mut().enumerate() {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes[i * 8..i * 8 + 8]);
            *limb = u64::from_be_bytes(buf);
        }
        XCoord(limbs)
    }

    pub fn to_be_bytes(self) -> [u8; X_BYTES] {
        let mut out = [0u8; X_BYTES];
        for (i, limb) in self.0.iter().enumerate() {
            out[i * 8..i * 8 + 8].copy_from_slice(&limb.to_be_bytes());
        }
        out
    }

    /// Low 64 bits of x (the least-significant limb).
    pub fn low_u64(self) -> u64 {
        self.0[3]
    }

    /// Distinguishing predicate: the low `d` bits of x are all zero.
    pub fn is_distinguished(self, dp_mask: u64) -> bool {
        self.0[3] & dp_mask == 0
    }

    /// Bucket index: the high `hash_bits` bits of x.
    pub fn bucket(self, hash_bits: u32) -> u32 {
        debug_assert!((8..=32).contains(&hash_bits));
        (self.0[0] >> (64 - hash_bits)) as u32
    }

    /// The bits of x not used as the bucket index.
    pub fn suffix(self, hash_bits: u32) -> [u64; 4] {
        let mut s = self.0;
        s[0] &= u64::MAX >> hash_bits;
        s
    }

    /// Rebuild the full x from a bucket index and a stored suffix.
    pub fn from_bucket_suffix(bucket: u32, suffix: [u64; 4], hash_bits: u32) -> Self {
        let mut limbs = suffix;
        limbs[0] |= (bucket as u64) << (64 - hash_bits);
        XCoord(limbs)
    }
}

impl fmt::Display for XCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:016x}{:016x}{:016x}{:016x}",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

/// 192-bit walk distance.
///
/// Limbs are little-endian internally (carry propagation reads better that
/// way); the wire form is 24 big-endian bytes. A single walk never gets
/// anywhere near 2^192, so wrapping on add is unreachable in practice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Dist(pub [u64; 3]);

impl Dist {
    pub const ZERO: Dist = Dist([0; 3]);

    pub fn from_u64(v: u64) -> Self {
        Dist([v, 0, 0])
    }

    /// Add a jump delta (deltas fit in one limb).
    pub fn add_u64(self, delta: u64) -> Dist {
        let mut limbs = self.0;
        let (lo, mut carry) = limbs[0].overflowing_add(delta);
        limbs[0] = lo;
        for limb in limbs.iter_mut().skip(1) {
            if !carry {
                break;
            }
            let (v, c) = limb.overflowing_add(1);
            *limb = v;
            carry = c;
        }
        Dist(limbs)
    }

    pub fn from_be_bytes(bytes: &[u8; DIST_BYTES]) -> Self {
        let mut limbs = [0u64; 3];
        for i in 0..3 {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes[i * 8..i * 8 + 8]);
            limbs[2 - i] = u64::from_be_bytes(buf);
        }
        Dist(limbs)
    }

    pub fn to_be_bytes(self) -> [u8; DIST_BYTES] {
        let mut out = [0u8; DIST_BYTES];
        for i in 0..3 {
            out[i * 8..i * 8 + 8].copy_from_slice(&self.0[2 - i].to_be_bytes());
        }
        out
    }

    pub fn to_biguint(self) -> BigUint {
        BigUint::from_bytes_be(&self.to_be_bytes())
    }

    /// `None` when the value needs more than 192 bits.
    pub fn from_biguint(v: &BigUint) -> Option<Dist> {
        if v.bits() > 192 {
            return None;
        }
        let bytes = v.to_bytes_be();
        let mut buf = [0u8; DIST_BYTES];
        buf[DIST_BYTES - bytes.len()..].copy_from_slice(&bytes);
        Some(Dist::from_be_bytes(&buf))
    }
}

impl Ord for Dist {
    fn cmp(&self, other: &Self) -> Ordering {
        for i in (0..3).rev() {
            match self.0[i].cmp(&other.0[i]) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for Dist {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Dist {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}{:016x}{:016x}", self.0[2], self.0[1], self.0[0])
    }
}

/// A published distinguished point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dp {
    pub x: XCoord,
    pub dist: Dist,
    pub kidx: u64,
}

impl Dp {
    pub fn herd(&self) -> Herd {
        Herd::from_kidx(self.kidx)
    }
}

/// 16-byte worker identity used in the handshake and for range assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub [u8; 16]);

impl ClientId {
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        ClientId(bytes)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Final report written when a cross-herd collision verifies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Solution {
    /// Recovered private key, 64 hex chars.
    pub private_key: String,
    pub dps_stored: u64,
    pub same_herd_merges: u64,
    pub wrong_collisions: u64,
    pub elapsed_seconds: f64,
}
