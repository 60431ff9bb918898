//! Trait definitions for hardware abstraction.
//!
//! # Submodules
//!
//! - `hardware`: PWM driver, clock, PID feedback and output sinks
//! - `output`: Signed duty output shared by all ramp engines
//!
//! # Hardware Abstraction
//!
//! - [`PwmDriver`]: PWM channels and digital levels on pins
//! - [`Clock`]: Monotonic millisecond time
//! - [`FeedbackSource`] / [`ControlSink`]: PID loop input and output
//! - [`DriveOutput`]: What the ramp engines drive

/// PWM driver, clock and PID feedback traits.
pub mod hardware;
/// Signed duty output trait.
pub mod output;

pub use hardware::*;
pub use output::*;
