//! Herd management
//!
//! Allocates a lane's cohort split evenly between the herds, seeds start
//! positions, and reseeds dead branches. Parity is structural: the slot's
//! parity decides the herd and survives every reseed, so `kidx & 1` stays
//! truthful from GPU lane to wire to store.

use anyhow::{anyhow, Result};
use k256::{ProjectivePoint, Scalar};
use num_bigint::BigUint;
use rand::{Rng, RngCore};

use crate::curve::{mul_g, scalar_from_dist, wild_base};
use crate::kangaroo::walk::Kangaroo;
use crate::types::{Dist, Herd};

const SLOT_BITS: u32 = 24;
const GENERATION_BITS: u32 = 24;

/// Everything a lane needs to seed walkers for its assigned range.
#[derive(Clone)]
pub struct HerdParams {
    /// `P - wild_offset*G`; wild walkers start here plus their distance.
    pub wild_base: ProjectivePoint,
    pub range_start: BigUint,
    /// Ranges handed out by the partitioner are power-of-two wide.
    pub width_bits: u32,
}

impl HerdParams {
    pub fn new(
        target: &ProjectivePoint,
        wild_offset: &Scalar,
        range_start: BigUint,
        range_end: BigUint,
    ) -> Result<Self> {
        if range_end <= range_start {
            return Err(anyhow!("empty work range"));
        }
        let width = &range_end - &range_start;
        if width.count_ones() != 1 {
            return Err(anyhow!("work range width must be a power of two"));
        }
        let width_bits = (width.bits() - 1) as u32;
        if &range_start + &width > BigUint::from(1u8) << 192usize {
            return Err(anyhow!("work range exceeds 192-bit distances"));
        }
        Ok(HerdParams {
            wild_base: wild_base(target, wild_offset),
            range_start,
            width_bits,
        })
    }
}

/// One lane's kangaroos. Owned exclusively by the lane thread; nothing here
/// is shared.
pub struct Cohort {
    lane: u32,
    generation: u64,
    roos: Vec<Kangaroo>,
}

impl Cohort {
    /// Spawn `size` kangaroos (rounded up to even), half tame half wild.
    pub fn spawn(lane: u32, size: usize, params: &HerdParams, rng: &mut impl Rng) -> Cohort {
        let size = (size + 1) & !1;
        let mut cohort = Cohort {
            lane,
            generation: 0,
            roos: Vec::with_capacity(size),
        };
        for slot in 0..size as u64 {
            let roo = cohort.seed(slot, params, rng);
            cohort.roos.push(roo);
        }
        cohort
    }

    pub fn len(&self) -> usize {
        self.roos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roos.is_empty()
    }

    pub fn roos_mut(&mut self) -> &mut [Kangaroo] {
        &mut self.roos
    }

    pub fn roos(&self) -> &[Kangaroo] {
        &self.roos
    }

    /// Replace the kangaroo at `slot` with a fresh walk. The new kidx keeps
    /// the slot parity and bumps the generation field, so it never repeats.
    pub fn reseed_slot(&mut self, slot: usize, params: &HerdParams, rng: &mut impl Rng) {
        self.generation = (self.generation + 1) & ((1u64 << GENERATION_BITS) - 1);
        self.roos[slot] = self.seed(slot as u64, params, rng);
    }

    /// Reseed by kidx (server-directed reset). Returns false when the kidx
    /// does not belong to this cohort.
    pub fn reseed_kidx(&mut self, kidx: u64, params: &HerdParams, rng: &mut impl Rng) -> bool {
        match self.roos.iter().position(|r| r.kidx == kidx) {
            Some(slot) => {
                self.reseed_slot(slot, params, rng);
                true
            }
            None => false,
        }
    }

    fn seed(&self, slot: u64, params: &HerdParams, rng: &mut impl Rng) -> Kangaroo {
        let kidx = (self.lane as u64) << (SLOT_BITS + GENERATION_BITS)
            | self.generation << SLOT_BITS
            | (slot & ((1u64 << SLOT_BITS) - 1));
        loop {
            let offset = random_below_pow2(rng, params.width_bits);
            let dist = Dist::from_biguint(&(&params.range_start + offset))
                .expect("validated range fits 192 bits");
            let step = mul_g(&scalar_from_dist(&dist));
            let pos = match Herd::from_kidx(kidx) {
                Herd::Tame => step,
                Herd::Wild => params.wild_base + step,
            };
            if let Some(roo) = Kangaroo::new(kidx, pos, dist) {
                return roo;
            }
            // seed landed on the identity; draw again
        }
    }
}

fn random_below_pow2(rng: &mut impl Rng, width_bits: u32) -> BigUint {
    let mut bytes = [0u8; 24];
    rng.fill_bytes(&mut bytes);
    BigUint::from_bytes_be(&bytes) % (BigUint::from(1u8) << width_bits as usize)
}
