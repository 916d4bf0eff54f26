//! Walk engine
//!
//! One kangaroo step: select the jump from the low bits of the current x,
//! add the jump point, accumulate the delta, and test the DP predicate on
//! the new position. Symmetry (x-axis reflection) is not part of this
//! build; the plain walk is the single configured variant, so kangaroo
//! records carry no last-jump field and the wire encoding never changes.

use k256::ProjectivePoint;

use crate::curve::x_coord;
use crate::kangaroo::jump::JumpTable;
use crate::types::{Dist, Dp, Herd, XCoord};

/// One walker. `pos`/`cur_x` always describe the same point; `dist` is the
/// absolute accumulated distance (tame: pos = dist*G, wild: pos =
/// P - wild_offset*G + dist*G). `traveled` counts only the jumps taken since
/// seeding and drives dead-branch detection.
#[derive(Clone)]
pub struct Kangaroo {
    pub kidx: u64,
    pub pos: ProjectivePoint,
    pub cur_x: XCoord,
    pub dist: Dist,
    pub traveled: u128,
    last_dp: Option<(XCoord, Dist)>,
}

impl Kangaroo {
    /// `None` if the seed position is the identity (never happens for real
    /// seeds; callers reseed on it anyway).
    pub fn new(kidx: u64, pos: ProjectivePoint, dist: Dist) -> Option<Self> {
        let cur_x = x_coord(&pos)?;
        Some(Kangaroo {
            kidx,
            pos,
            cur_x,
            dist,
            traveled: 0,
            last_dp: None,
        })
    }

    pub fn herd(&self) -> Herd {
        Herd::from_kidx(self.kidx)
    }
}

/// Outcome of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Plain jump, nothing to publish.
    Advanced,
    /// The new position is distinguished.
    Dp(Dp),
    /// The walk is stuck (repeated DP or over the travel bound); the caller
    /// must reseed this kangaroo with a fresh kidx of the same parity.
    DeadBranch,
}

pub struct Walker<'a> {
    jumps: &'a JumpTable,
    dp_mask: u64,
    /// How many of the 32 table entries this interval uses. The selector
    /// window is sized so the mean stride tracks sqrt(W); all 32 jumps only
    /// engage on wide intervals.
    jump_count: u64,
    /// Travel bound 2^(n/2 + 7), i.e. 2*sqrt(W) with a 64x safety factor.
    dead_branch_bit: u32,
}

impl<'a> Walker<'a> {
    pub fn new(jumps: &'a JumpTable, dp_bits: u32, interval_bits: u32) -> Self {
        debug_assert!(dp_bits < 64);
        Walker {
            jumps,
            dp_mask: (1u64 << dp_bits) - 1,
            jump_count: u64::from((interval_bits / 2 + 3).clamp(4, 32)),
            dead_branch_bit: interval_bits / 2 + 7,
        }
    }

    pub fn dp_mask(&self) -> u64 {
        self.dp_mask
    }

    /// Advance one jump.
    pub fn step(&self, roo: &mut Kangaroo) -> StepOutcome {
        let j = (roo.cur_x.low_u64() % self.jump_count) as usize;
        roo.pos += self.jumps.point(j);
        let delta = self.jumps.delta(j);
        roo.dist = roo.dist.add_u64(delta);
        roo.traveled += delta as u128;

        roo.cur_x = match x_coord(&roo.pos) {
            Some(x) => x,
            // landed on the identity; unreachable for honest walks
            None => return StepOutcome::DeadBranch,
        };

        if roo.cur_x.is_distinguished(self.dp_mask) {
            let dp = Dp {
                x: roo.cur_x,
                dist: roo.dist,
                kidx: roo.kidx,
            };
            // the same (x, dist) twice from one walker means the walk cycled
            if roo.last_dp == Some((dp.x, dp.dist)) {
                return StepOutcome::DeadBranch;
            }
            roo.last_dp = Some((dp.x, dp.dist));
            return StepOutcome::Dp(dp);
        }

        if roo.traveled >> self.dead_branch_bit != 0 {
            return StepOutcome::DeadBranch;
        }
        StepOutcome::Advanced
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curve::{mul_g, scalar_from_dist};
    use k256::Scalar;

    fn tame(kidx: u64, start: u64) -> Kangaroo {
        let dist = Dist::from_u64(start);
        Kangaroo::new(kidx, mul_g(&scalar_from_dist(&dist)), dist).unwrap()
    }

    #[test]
    fn tame_invariant_holds_across_steps() {
        let jumps = JumpTable::build();
        let walker = Walker::new(&jumps, 4, 32);
        let mut roo = tame(2, 1_000_003);
        for _ in 0..64 {
            walker.step(&mut roo);
            assert_eq!(roo.pos, mul_g(&scalar_from_dist(&roo.dist)));
        }
        assert!(roo.traveled > 0);
    }

    #[test]
    fn walk_is_deterministic_from_start() {
        let jumps = JumpTable::build();
        let walker = Walker::new(&jumps, 8, 48);
        let mut a = tame(2, 77);
        let mut b = tame(2, 77);
        for _ in 0..128 {
            assert_eq!(walker.step(&mut a), walker.step(&mut b));
            assert_eq!(a.cur_x, b.cur_x);
            assert_eq!(a.dist, b.dist);
        }
    }

    #[test]
    fn dp_emission_matches_predicate() {
        let jumps = JumpTable::build();
        let walker = Walker::new(&jumps, 3, 40);
        let mut roo = tame(4, 12345);
        let mut dps = 0;
        for _ in 0..2000 {
            match walker.step(&mut roo) {
                StepOutcome::Dp(dp) => {
                    assert!(dp.x.is_distinguished(walker.dp_mask()));
                    assert_eq!(dp.kidx, 4);
                    dps += 1;
                }
                StepOutcome::Advanced => {
                    assert!(!roo.cur_x.is_distinguished(walker.dp_mask()));
                }
                StepOutcome::DeadBranch => {}
            }
        }
        // 1/8 DP density over 2000 steps; far outside noise
        assert!(dps > 100, "only {dps} DPs in 2000 steps");
    }

    #[test]
    fn travel_bound_reports_dead_branch() {
        let jumps = JumpTable::build();
        // interval_bits 8 -> travel bound 2^11; dp_bits 63 makes DPs
        // unreachable, so the bound is the only exit
        let walker = Walker::new(&jumps, 63, 8);
        let mut roo = tame(6, 1);
        let mut saw_dead = false;
        for _ in 0..100_000 {
            if walker.step(&mut roo) == StepOutcome::DeadBranch {
                saw_dead = true;
                break;
            }
        }
        assert!(saw_dead);
    }

    #[test]
    fn wild_invariant_holds_across_steps() {
        let jumps = JumpTable::build();
        let walker = Walker::new(&jumps, 4, 32);
        let k = Scalar::from(0x00C0FFEEu64);
        let target = mul_g(&k);
        let off = Scalar::from(1u64 << 31);
        let base = crate::curve::wild_base(&target, &off);
        let dist = Dist::from_u64(9999);
        let mut roo = Kangaroo::new(3, base + mul_g(&scalar_from_dist(&dist)), dist).unwrap();
        for _ in 0..64 {
            walker.step(&mut roo);
            assert_eq!(roo.pos, base + mul_g(&scalar_from_dist(&roo.dist)));
        }
    }
}
