//! [`DriveOutput`] implementations on top of a [`PwmDriver`].
//!
//! | Type | Pins | Use |
//! |------|------|-----|
//! | [`PwmChannel`] | 1 | unidirectional motor, lamp, simple solenoid |
//! | [`HBridge`] | 2 | reversible motor, bidirectional switch machine |
//! | [`LevelOutput`] | 1 | relay or other on/off load |
//!
//! # H-bridge sequencing
//!
//! Only one leg is ever attached to PWM. On a polarity change the energized
//! leg is zeroed, detached and pulled low before the other leg is attached.
//! Braking detaches both legs and holds both high as plain digital levels,
//! so no PWM duty is ever active while the other leg is energized.
//!
//! ```rust
//! use rs_railnode::hal::MockPwm;
//! use rs_railnode::output::HBridge;
//! use rs_railnode::traits::{Direction, DriveOutput};
//!
//! let pwm = MockPwm::new();
//! let mut bridge = HBridge::new(pwm.clone(), 4, 5, 1023).unwrap();
//!
//! bridge.drive(600).unwrap();
//! bridge.drive(-300).unwrap();
//!
//! assert_eq!(bridge.direction(), Direction::Reverse);
//! assert_eq!(pwm.pin(4).duty, 0);
//! assert_eq!(pwm.pin(5).duty, 300);
//! assert_eq!(pwm.conflicts(), 0);
//! ```

use crate::traits::{Direction, DriveOutput, Level, Pin, PwmDriver};

/// Rounds a fractional value to the nearest duty, half away from zero,
/// after clamping it to `min..=max`.
///
/// ```rust
/// use rs_railnode::output::round_duty;
///
/// assert_eq!(round_duty(2.5, -10, 10), 3);
/// assert_eq!(round_duty(-2.5, -10, 10), -3);
/// assert_eq!(round_duty(2.4, -10, 10), 2);
/// assert_eq!(round_duty(99.9, -10, 10), 10);
/// ```
pub fn round_duty(value: f32, min: i32, max: i32) -> i32 {
    if value.is_nan() {
        return 0;
    }
    let clamped = value.max(min as f32).min(max as f32);
    (clamped.round() as i32).clamp(min, max)
}

/// Zeroes a duty whose magnitude is below `min_power`.
#[inline]
pub fn apply_deadband(duty: i32, min_power: u32) -> i32 {
    if duty.unsigned_abs() < min_power {
        0
    } else {
        duty
    }
}

/// Largest duty for a PWM resolution in bits.
#[inline]
pub const fn max_duty_for_resolution(bits: u8) -> i32 {
    let bits = if bits > 20 { 20 } else { bits };
    (1i32 << bits) - 1
}

// ============================================================================
// Single PWM channel
// ============================================================================

/// One PWM pin, duty `0..=max`.
///
/// An inverted channel sinks current: the pin writes `max - duty`, so
/// logical duty 0 holds the pin at full scale. Common-anode signal lamps
/// are wired this way.
#[derive(Debug)]
pub struct PwmChannel<D> {
    driver: D,
    pin: Pin,
    max_duty: i32,
    duty: i32,
    inverted: bool,
}

impl<D: PwmDriver> PwmChannel<D> {
    /// Attaches the pin and writes duty 0.
    pub fn new(driver: D, pin: Pin, max_duty: i32) -> Result<Self, D::Error> {
        Self::with_polarity(driver, pin, max_duty, false)
    }

    /// Attaches an active-low pin and writes full scale, which is off.
    pub fn inverted(driver: D, pin: Pin, max_duty: i32) -> Result<Self, D::Error> {
        Self::with_polarity(driver, pin, max_duty, true)
    }

    fn with_polarity(mut driver: D, pin: Pin, max_duty: i32, inverted: bool) -> Result<Self, D::Error> {
        let max_duty = max_duty.max(1);
        let (idle_level, idle_duty) = if inverted {
            (Level::High, max_duty as u32)
        } else {
            (Level::Low, 0)
        };
        driver.set_digital_level(pin, idle_level)?;
        driver.attach_output(pin)?;
        driver.set_duty(pin, idle_duty)?;
        Ok(Self {
            driver,
            pin,
            max_duty,
            duty: 0,
            inverted,
        })
    }

    /// True when the pin is active-low.
    pub fn is_inverted(&self) -> bool {
        self.inverted
    }

    /// Output pin.
    pub fn pin(&self) -> Pin {
        self.pin
    }

    /// Underlying driver.
    pub fn driver(&self) -> &D {
        &self.driver
    }
}

impl<D: PwmDriver> DriveOutput for PwmChannel<D> {
    type Error = D::Error;

    fn max_duty(&self) -> i32 {
        self.max_duty
    }

    fn drive(&mut self, duty: i32) -> Result<(), Self::Error> {
        let duty = duty.clamp(0, self.max_duty);
        if duty != self.duty {
            let raw = if self.inverted { self.max_duty - duty } else { duty };
            self.driver.set_duty(self.pin, raw as u32)?;
            self.duty = duty;
        }
        Ok(())
    }

    fn duty(&self) -> i32 {
        self.duty
    }
}

// ============================================================================
// H-bridge
// ============================================================================

/// Two legs driving a load in either polarity. Positive duty energizes the
/// plus leg, negative duty the minus leg.
#[derive(Debug)]
pub struct HBridge<D> {
    driver: D,
    plus: Pin,
    minus: Pin,
    max_duty: i32,
    duty: i32,
    direction: Direction,
    braking: bool,
}

impl<D: PwmDriver> HBridge<D> {
    /// Pulls both legs low. Legs are attached to PWM on first use.
    pub fn new(mut driver: D, plus: Pin, minus: Pin, max_duty: i32) -> Result<Self, D::Error> {
        driver.set_digital_level(plus, Level::Low)?;
        driver.set_digital_level(minus, Level::Low)?;
        Ok(Self {
            driver,
            plus,
            minus,
            max_duty: max_duty.max(1),
            duty: 0,
            direction: Direction::Stopped,
            braking: false,
        })
    }

    /// Underlying driver.
    pub fn driver(&self) -> &D {
        &self.driver
    }

    fn leg(&self, direction: Direction) -> Option<Pin> {
        match direction {
            Direction::Forward => Some(self.plus),
            Direction::Reverse => Some(self.minus),
            Direction::Stopped => None,
        }
    }

    /// Zeroes, detaches and grounds the active leg.
    fn disengage(&mut self) -> Result<(), D::Error> {
        if let Some(leg) = self.leg(self.direction) {
            self.driver.set_duty(leg, 0)?;
            self.driver.detach_output(leg)?;
            self.driver.set_digital_level(leg, Level::Low)?;
        }
        self.direction = Direction::Stopped;
        self.duty = 0;
        Ok(())
    }

    /// Grounds the other leg and attaches this one at zero duty.
    fn engage(&mut self, direction: Direction) -> Result<(), D::Error> {
        let (Some(leg), Some(other)) = (self.leg(direction), self.leg(opposite(direction))) else {
            return Ok(());
        };
        self.driver.set_digital_level(other, Level::Low)?;
        self.driver.attach_output(leg)?;
        self.driver.set_duty(leg, 0)?;
        self.direction = direction;
        Ok(())
    }
}

fn opposite(direction: Direction) -> Direction {
    match direction {
        Direction::Forward => Direction::Reverse,
        Direction::Reverse => Direction::Forward,
        Direction::Stopped => Direction::Stopped,
    }
}

impl<D: PwmDriver> DriveOutput for HBridge<D> {
    type Error = D::Error;

    fn max_duty(&self) -> i32 {
        self.max_duty
    }

    fn min_duty(&self) -> i32 {
        -self.max_duty
    }

    fn drive(&mut self, duty: i32) -> Result<(), Self::Error> {
        let duty = duty.clamp(-self.max_duty, self.max_duty);
        if self.braking {
            self.release_brake()?;
        }

        let wanted = Direction::from_sign(duty);
        if wanted != self.direction {
            self.disengage()?;
            self.engage(wanted)?;
        }
        if let Some(leg) = self.leg(wanted) {
            self.driver.set_duty(leg, duty.unsigned_abs())?;
        }
        self.duty = duty;
        Ok(())
    }

    fn duty(&self) -> i32 {
        self.duty
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn brake(&mut self) -> Result<(), Self::Error> {
        self.disengage()?;
        self.driver.set_digital_level(self.plus, Level::High)?;
        self.driver.set_digital_level(self.minus, Level::High)?;
        self.braking = true;
        Ok(())
    }

    fn release_brake(&mut self) -> Result<(), Self::Error> {
        if self.braking {
            self.driver.set_digital_level(self.plus, Level::Low)?;
            self.driver.set_digital_level(self.minus, Level::Low)?;
            self.braking = false;
        }
        Ok(())
    }

    fn is_braking(&self) -> bool {
        self.braking
    }
}

// ============================================================================
// Binary level
// ============================================================================

/// A pin that is either fully on or off. Any positive duty turns it on.
#[derive(Debug)]
pub struct LevelOutput<D> {
    driver: D,
    pin: Pin,
    on: bool,
}

impl<D: PwmDriver> LevelOutput<D> {
    /// Drives the pin low.
    pub fn new(mut driver: D, pin: Pin) -> Result<Self, D::Error> {
        driver.set_digital_level(pin, Level::Low)?;
        Ok(Self {
            driver,
            pin,
            on: false,
        })
    }

    /// Returns true while the pin is high.
    pub fn is_on(&self) -> bool {
        self.on
    }
}

impl<D: PwmDriver> DriveOutput for LevelOutput<D> {
    type Error = D::Error;

    fn max_duty(&self) -> i32 {
        1
    }

    fn drive(&mut self, duty: i32) -> Result<(), Self::Error> {
        let on = duty > 0;
        if on != self.on {
            let level = if on { Level::High } else { Level::Low };
            self.driver.set_digital_level(self.pin, level)?;
            self.on = on;
        }
        Ok(())
    }

    fn duty(&self) -> i32 {
        i32::from(self.on)
    }
}
