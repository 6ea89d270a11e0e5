//! Executive Support (ex)
//!
//! Reference-lifetime primitives shared by the rest of the subsystem:
//!
//! - **Rundown protection**: block-out of new references during teardown
//! - **Fast reference slot**: lock-free cached referencing of a shared object

pub mod fast_ref;
pub mod rundown;

pub use fast_ref::FastRef;
pub use rundown::{ExRundownRef, RundownGuard};
