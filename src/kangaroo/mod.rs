//! The kangaroo engine: jump table, walk stepping and herd management.

pub mod herd;
pub mod jump;
pub mod walk;

pub use herd::{Cohort, HerdParams};
pub use jump::JumpTable;
pub use walk::{Kangaroo, StepOutcome, Walker};
