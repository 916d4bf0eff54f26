//! herdcrack - distributed Pollard kangaroo solver for the secp256k1
//! interval discrete log
//!
//! Given P = k*G with k in [0, 2^n), tame and wild kangaroo herds walk
//! deterministic jump sequences and publish distinguished points to a
//! central sharded store over a framed TCP protocol; a cross-herd match
//! yields k = d_T - d_W + 2^(n-1) (mod n).
//!
//! Group arithmetic comes from k256; this crate owns the walks, the store,
//! the wire and the distribution plumbing.

#![deny(unsafe_code)]

pub mod checkpoint;
pub mod config;
pub mod curve;
pub mod kangaroo;
pub mod net;
pub mod pipeline;
pub mod solver;
pub mod store;
pub mod targets;
pub mod types;
pub mod work;

pub use config::Config;
pub use pipeline::DpQueue;
pub use solver::{Resolver, Verdict};
pub use store::{AddOutcome, DpStore};
pub use types::{Dist, Dp, Herd, Solution, XCoord};
