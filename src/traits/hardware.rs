//! Hardware capability traits consumed by the control engines.
//!
//! The crate never talks to registers directly. Board support code
//! implements these narrow traits and the engines drive them.
//!
//! # Key Traits
//!
//! | Trait | Purpose |
//! |-------|---------|
//! | [`PwmDriver`] | PWM channels and plain digital levels on output pins |
//! | [`Clock`] | Monotonic millisecond time source |
//! | [`FeedbackSource`] | Measured value for the PID loop (e.g. wheel speed) |
//! | [`ControlSink`] | Destination for the PID output |
//!
//! # Example
//!
//! ```rust
//! use rs_railnode::traits::{Level, PwmDriver};
//! use rs_railnode::hal::MockPwm;
//!
//! let mut pwm = MockPwm::new();
//! pwm.attach_output(4).unwrap();
//! pwm.set_duty(4, 512).unwrap();
//! pwm.set_digital_level(5, Level::Low).unwrap();
//!
//! assert_eq!(pwm.pin(4).duty, 512);
//! ```

/// GPIO pin number.
pub type Pin = u8;

/// Digital output level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Level {
    /// Pin driven low.
    #[default]
    Low,
    /// Pin driven high.
    High,
}

/// Polarity of a drive output.
///
/// # Default
///
/// Defaults to [`Stopped`](Self::Stopped) for safety.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Direction {
    /// Positive polarity (plus leg energized).
    Forward,
    /// Negative polarity (minus leg energized).
    Reverse,
    /// Neither leg energized.
    #[default]
    Stopped,
}

impl Direction {
    /// Direction of a signed duty or value.
    ///
    /// ```
    /// use rs_railnode::Direction;
    ///
    /// assert_eq!(Direction::from_sign(300), Direction::Forward);
    /// assert_eq!(Direction::from_sign(-1), Direction::Reverse);
    /// assert_eq!(Direction::from_sign(0), Direction::Stopped);
    /// ```
    #[inline]
    pub const fn from_sign(value: i32) -> Self {
        if value > 0 {
            Direction::Forward
        } else if value < 0 {
            Direction::Reverse
        } else {
            Direction::Stopped
        }
    }

    /// `1`, `-1` or `0`.
    #[inline]
    pub const fn sign(self) -> i8 {
        match self {
            Direction::Forward => 1,
            Direction::Reverse => -1,
            Direction::Stopped => 0,
        }
    }

    /// Inverse of [`sign`](Self::sign); anything else maps to `Stopped`.
    #[inline]
    pub const fn from_i8(value: i8) -> Self {
        Self::from_sign(value as i32)
    }

    /// Returns the direction as a lowercase string.
    #[inline]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Direction::Forward => "forward",
            Direction::Reverse => "reverse",
            Direction::Stopped => "stopped",
        }
    }
}

/// PWM and digital output driver.
///
/// One driver instance may serve several pins. A pin is either attached to
/// a PWM channel (duty applies) or detached and driven as a plain digital
/// level. Duty units are driver ticks, `0..=max` for the configured
/// resolution.
///
/// # Example Implementation
///
/// ```rust,ignore
/// use rs_railnode::traits::{Level, Pin, PwmDriver};
///
/// struct Ledc { /* peripheral handles */ }
///
/// impl PwmDriver for Ledc {
///     type Error = EspError;
///
///     fn attach_output(&mut self, pin: Pin) -> Result<(), EspError> {
///         // ledc channel config for `pin`...
///         Ok(())
///     }
///     // ...
/// }
/// ```
pub trait PwmDriver {
    /// Error type for driver operations.
    type Error: core::fmt::Debug;

    /// Routes the pin to a PWM channel.
    fn attach_output(&mut self, pin: Pin) -> Result<(), Self::Error>;

    /// Disconnects the pin from its PWM channel.
    fn detach_output(&mut self, pin: Pin) -> Result<(), Self::Error>;

    /// Sets the duty of an attached pin.
    fn set_duty(&mut self, pin: Pin, duty: u32) -> Result<(), Self::Error>;

    /// Drives a detached pin to a fixed level.
    fn set_digital_level(&mut self, pin: Pin, level: Level) -> Result<(), Self::Error>;
}

/// Time source trait.
///
/// Provides monotonic time in milliseconds for PID integration and the
/// stop-and-wait timeout. [`SystemClock`](crate::hal::SystemClock) wraps
/// `std::time::Instant`.
///
/// # Example
///
/// ```rust
/// use rs_railnode::traits::Clock;
/// use rs_railnode::hal::MockClock;
///
/// let clock = MockClock::new();
/// assert_eq!(clock.now_ms(), 0);
///
/// clock.advance(100);
/// assert_eq!(clock.now_ms(), 100);
/// ```
pub trait Clock {
    /// Returns current time in milliseconds since an arbitrary epoch.
    ///
    /// Must be monotonically increasing.
    fn now_ms(&self) -> u64;
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now_ms(&self) -> u64 {
        (**self).now_ms()
    }
}

/// Measured process value for closed-loop control.
///
/// Signed: positive while the load moves forward, negative in reverse.
/// Closures returning `f32` implement this trait.
pub trait FeedbackSource {
    /// Latest measurement.
    fn read(&mut self) -> f32;
}

impl<F: FnMut() -> f32> FeedbackSource for F {
    fn read(&mut self) -> f32 {
        self()
    }
}

/// Destination for a controller output.
///
/// Closures taking `f32` implement this trait.
pub trait ControlSink {
    /// Applies a new output value.
    fn apply(&mut self, value: f32);
}

impl<F: FnMut(f32)> ControlSink for F {
    fn apply(&mut self, value: f32) {
        self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_default_is_stopped() {
        assert_eq!(Direction::default(), Direction::Stopped);
    }

    #[test]
    fn direction_sign_round_trips() {
        for dir in [Direction::Forward, Direction::Reverse, Direction::Stopped] {
            assert_eq!(Direction::from_i8(dir.sign()), dir);
        }
    }

    #[test]
    fn direction_strings() {
        assert_eq!(Direction::Forward.as_str(), "forward");
        assert_eq!(Direction::Reverse.as_str(), "reverse");
        assert_eq!(Direction::Stopped.as_str(), "stopped");
    }

    #[test]
    fn closures_are_feedback_and_sinks() {
        let mut readings = [3.0f32, 4.0].into_iter();
        let mut source = move || readings.next().unwrap_or(0.0);
        assert_eq!(FeedbackSource::read(&mut source), 3.0);
        assert_eq!(FeedbackSource::read(&mut source), 4.0);
        assert_eq!(FeedbackSource::read(&mut source), 0.0);

        let mut seen = Vec::new();
        {
            let mut sink = |v: f32| seen.push(v);
            sink.apply(1.5);
            sink.apply(-2.0);
        }
        assert_eq!(seen, vec![1.5, -2.0]);
    }
}
