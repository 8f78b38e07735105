//! # skipstore Configuration Module
//!
//! Centralizes the on-disk layout and limit constants. Scattering these
//! across modules invites mismatch bugs between values that must agree
//! (block sizes, directory offsets, free-list class counts), so they live
//! in one place with their interdependencies documented and enforced by
//! compile-time assertions.
//!
//! ## Module Organization
//!
//! - [`constants`]: All layout and limit values with dependency documentation

pub mod constants;
pub use constants::*;
