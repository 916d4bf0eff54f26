//! Collision resolver
//!
//! Turns a cross-herd collision event into a candidate key
//! `k = d_T - d_W + wild_offset (mod n)` and verifies `k*G == P`. A failed
//! verification is a wrong collision (a reset kangaroo reused an x with a
//! stale distance): a normal path, answered with a reset directive for the
//! incoming walker.

use k256::{ProjectivePoint, Scalar};
use log::{info, warn};

use crate::curve::{mul_g, scalar_from_dist, scalar_to_be32};
use crate::store::CollisionEvent;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Verified private key, 32 big-endian bytes.
    Key([u8; 32]),
    /// Wrong collision: reset this kidx on the worker behind `origin`.
    Wrong { kidx: u64, origin: u32 },
}

pub struct Resolver {
    target: ProjectivePoint,
    wild_offset: Scalar,
}

impl Resolver {
    pub fn new(target: ProjectivePoint, wild_offset: Scalar) -> Self {
        Resolver {
            target,
            wild_offset,
        }
    }

    pub fn resolve(&self, ev: &CollisionEvent) -> Verdict {
        let d_t = scalar_from_dist(&ev.tame().dist);
        let d_w = scalar_from_dist(&ev.wild().dist);
        let k = d_t - d_w + self.wild_offset;
        if mul_g(&k) == self.target {
            let key = scalar_to_be32(&k);
            info!(
                "key verified from collision at x {} (tame kidx {}, wild kidx {})",
                ev.stored.x,
                ev.tame().kidx,
                ev.wild().kidx
            );
            Verdict::Key(key)
        } else {
            warn!(
                "wrong collision at x {}: resetting kidx {}",
                ev.stored.x, ev.incoming.kidx
            );
            Verdict::Wrong {
                kidx: ev.incoming.kidx,
                origin: ev.incoming.origin,
            }
        }
    }
}
