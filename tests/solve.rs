//! In-process end-to-end solve: herds walk, DPs land in the store, the
//! resolver recovers the key. Exercises the engine without the network in
//! between.

use k256::Scalar;
use num_bigint::BigUint;
use rand::rngs::StdRng;
use rand::SeedableRng;

use herdcrack::curve::{mul_g, scalar_from_biguint, scalar_to_be32};
use herdcrack::kangaroo::{Cohort, HerdParams, JumpTable, StepOutcome, Walker};
use herdcrack::solver::{Resolver, Verdict};
use herdcrack::store::{AddOutcome, DpRecord, DpStore};
use herdcrack::types::{Dist, Dp, XCoord};

/// Tiny interval, synthetic collision: n = 24, dp bits 4, key 0x13C9A1,
/// 16 kangaroos. Expected well under the step cap; seeded for
/// reproducibility.
#[test]
fn recovers_key_in_tiny_interval() {
    let interval_bits = 24u32;
    let dp_bits = 4u32;
    let key = 0x0013_C9A1u64;

    let key_scalar = Scalar::from(key);
    let target = mul_g(&key_scalar);
    let wild_offset_big = BigUint::from(1u8) << (interval_bits as usize - 1);
    let wild_offset = scalar_from_biguint(&wild_offset_big).unwrap();

    let params = HerdParams::new(
        &target,
        &wild_offset,
        BigUint::from(0u8),
        BigUint::from(1u8) << interval_bits as usize,
    )
    .unwrap();

    let jumps = JumpTable::build();
    let walker = Walker::new(&jumps, dp_bits, interval_bits);
    let store = DpStore::new(18, dp_bits);
    let resolver = Resolver::new(target, wild_offset);
    let mut rng = StdRng::seed_from_u64(0x6b616e67);
    let mut cohort = Cohort::spawn(0, 16, &params, &mut rng);

    let mut steps: u64 = 0;
    let recovered = 'search: loop {
        for slot in 0..cohort.len() {
            steps += 1;
            match walker.step(&mut cohort.roos_mut()[slot]) {
                StepOutcome::Advanced => {}
                StepOutcome::DeadBranch => cohort.reseed_slot(slot, &params, &mut rng),
                StepOutcome::Dp(dp) => {
                    assert!(store.validate(&dp));
                    if let AddOutcome::CrossHerdCollision(ev) = store.add(&dp, 0) {
                        match resolver.resolve(&ev) {
                            Verdict::Key(bytes) => break 'search bytes,
                            Verdict::Wrong { kidx, .. } => {
                                let _ = cohort.reseed_kidx(kidx, &params, &mut rng);
                            }
                        }
                    }
                }
            }
        }
        assert!(
            steps < 4_000_000,
            "no collision after {steps} steps ({} DPs stored)",
            store.len()
        );
    };

    assert_eq!(recovered, scalar_to_be32(&key_scalar));
    assert!(store.len() > 0);
}

/// Wrong-collision recovery: a fabricated cross-herd pair that fails key
/// verification yields a reset directive for the incoming walker, and the
/// search machinery keeps going.
#[test]
fn wrong_collision_resets_offender_and_search_resumes() {
    let interval_bits = 24u32;
    let key = Scalar::from(0x5EED5u64);
    let target = mul_g(&key);
    let wild_offset_big = BigUint::from(1u8) << (interval_bits as usize - 1);
    let wild_offset = scalar_from_biguint(&wild_offset_big).unwrap();
    let resolver = Resolver::new(target, wild_offset);
    let store = DpStore::new(18, 0);

    // inject { x, dist 100, kidx 2 } tame and { x, dist 200, kidx 3 } wild;
    // 100 - 200 + 2^23 does not hit the key
    let x = XCoord([0xAA << 40, 0, 0, 0]);
    let tame = Dp {
        x,
        dist: Dist::from_u64(100),
        kidx: 2,
    };
    let wild = Dp {
        x,
        dist: Dist::from_u64(200),
        kidx: 3,
    };
    assert!(matches!(store.add(&tame, 1), AddOutcome::Added));
    let ev = match store.add(&wild, 4) {
        AddOutcome::CrossHerdCollision(ev) => ev,
        other => panic!("expected collision, got {other:?}"),
    };
    match resolver.resolve(&ev) {
        Verdict::Wrong { kidx, origin } => {
            assert_eq!(kidx, 3);
            assert_eq!(origin, 4);
        }
        Verdict::Key(_) => panic!("fabricated pair must not verify"),
    }

    // the search continues: a genuine pair on a different x still resolves
    let d_t = 9_000u64;
    let d_w_big = BigUint::from(d_t) + &wild_offset_big - BigUint::from(0x5EED5u64);
    let genuine_tame = DpRecord {
        x: XCoord([0xBB << 40, 0, 0, 0]),
        dist: Dist::from_u64(d_t),
        kidx: 8,
        origin: 1,
    };
    let genuine_wild = DpRecord {
        x: genuine_tame.x,
        dist: Dist::from_biguint(&d_w_big).unwrap(),
        kidx: 9,
        origin: 2,
    };
    let ev = herdcrack::store::CollisionEvent {
        stored: genuine_tame,
        incoming: genuine_wild,
    };
    match resolver.resolve(&ev) {
        Verdict::Key(bytes) => assert_eq!(bytes, scalar_to_be32(&key)),
        Verdict::Wrong { .. } => panic!("genuine pair must verify"),
    }
}
