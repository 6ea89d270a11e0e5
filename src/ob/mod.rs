//! Object Model (ob)
//!
//! Reference-counted executive objects with delete routines. See
//! [`object`] for the header/body layout and the safe-reference primitive
//! used by enumeration.

pub mod object;

pub use object::{ObjectBody, ObjectHeader, ObjectRef, PsObject};
