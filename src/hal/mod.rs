//! Hardware Abstraction Layer implementations.
//!
//! This module contains concrete implementations of the traits
//! defined in [`crate::traits`].
//!
//! # Available Implementations
//!
//! - `clock`: [`SystemClock`] backed by `std::time::Instant`
//! - `mock`: Test implementations for desktop development

/// Wall-clock time source.
pub mod clock;
/// Mock hardware for tests and demos.
pub mod mock;

pub use clock::*;
pub use mock::*;
