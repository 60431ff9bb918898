//! Drive output capability used by every ramp engine.
//!
//! A [`DriveOutput`] takes a signed duty and turns it into pin activity.
//! The ramp engines only see this trait, so one engine serves every output
//! shape:
//!
//! | Output | Duty range | Brake |
//! |--------|------------|-------|
//! | [`PwmChannel`](crate::output::PwmChannel) | `0..=max` | duty 0 |
//! | [`HBridge`](crate::output::HBridge) | `-max..=max` | both legs held high |
//! | [`LevelOutput`](crate::output::LevelOutput) | `0..=1` | level low |

use super::hardware::Direction;

/// Signed duty output.
pub trait DriveOutput {
    /// Error type for driver operations.
    type Error: core::fmt::Debug;

    /// Highest accepted duty.
    fn max_duty(&self) -> i32;

    /// Lowest accepted duty. Negative for bidirectional outputs.
    fn min_duty(&self) -> i32 {
        0
    }

    /// Applies a duty. Values outside `min_duty..=max_duty` are clamped.
    fn drive(&mut self, duty: i32) -> Result<(), Self::Error>;

    /// Last applied duty.
    fn duty(&self) -> i32;

    /// Polarity of the last applied duty.
    fn direction(&self) -> Direction {
        Direction::from_sign(self.duty())
    }

    /// Returns true if the output accepts negative duty.
    fn is_bidirectional(&self) -> bool {
        self.min_duty() < 0
    }

    /// Largest duty magnitude in either direction.
    fn full_scale(&self) -> i32 {
        self.max_duty().max(self.min_duty().saturating_abs())
    }

    /// Zeroes the duty and holds the output in its brake state.
    fn brake(&mut self) -> Result<(), Self::Error> {
        self.drive(0)
    }

    /// Leaves the brake state with the output off.
    fn release_brake(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Returns true while the brake is held.
    fn is_braking(&self) -> bool {
        false
    }
}

impl<O: DriveOutput + ?Sized> DriveOutput for Box<O> {
    type Error = O::Error;

    fn max_duty(&self) -> i32 {
        (**self).max_duty()
    }

    fn min_duty(&self) -> i32 {
        (**self).min_duty()
    }

    fn drive(&mut self, duty: i32) -> Result<(), Self::Error> {
        (**self).drive(duty)
    }

    fn duty(&self) -> i32 {
        (**self).duty()
    }

    fn brake(&mut self) -> Result<(), Self::Error> {
        (**self).brake()
    }

    fn release_brake(&mut self) -> Result<(), Self::Error> {
        (**self).release_brake()
    }

    fn is_braking(&self) -> bool {
        (**self).is_braking()
    }
}
