//! Node configuration and the live snapshot the control loops read.
//!
//! Uses `heapless::String` for names so the structures stay fixed-size.
//! [`LiveConfig`] publishes a [`ControlConfig`] through `arc_swap`: control
//! loops take a snapshot once per cycle without locking, and a configuration
//! front end can [`store`](LiveConfig::store) a new one at any time.
//!
//! # Example
//!
//! ```rust
//! use rs_railnode::config::{ControlConfig, LiveConfig, PidConfig, RampConfig};
//!
//! let config = ControlConfig::default()
//!     .with_ramp(RampConfig::default().with_smooth_ms(500).with_smooth_steps(50))
//!     .with_pid(PidConfig::default().with_gains(2.0, 0.5, 0.1));
//! config.validate().unwrap();
//!
//! let live = LiveConfig::new(config);
//! assert_eq!(live.load().ramp.tick().as_millis(), 10);
//!
//! live.update(|c| c.pid.kp = 3.0);
//! assert_eq!(live.load().pid.kp, 3.0);
//! ```

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use heapless::String as HString;

use crate::error::Error;
use crate::output::max_duty_for_resolution;
use crate::traits::Pin;

/// Maximum length for short config strings (device names)
pub const MAX_SHORT_STRING: usize = 32;

/// Type alias for short config strings
pub type ShortString = HString<MAX_SHORT_STRING>;

/// Create a ShortString from a &str, truncating on a character boundary.
pub fn short_string(s: &str) -> ShortString {
    let mut hs = ShortString::new();
    for c in s.chars() {
        if hs.push(c).is_err() {
            break;
        }
    }
    hs
}

// ============================================================================
// Main Config
// ============================================================================

/// Complete control configuration of one node.
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ControlConfig {
    /// Motor output pins and PWM setup
    pub motor: MotorConfig,
    /// Continuous ramp timing
    pub ramp: RampConfig,
    /// Switch machine timing and power levels
    pub switch: SwitchConfig,
    /// Timer-driven ramp timing
    pub timed: TimedConfig,
    /// PID loop tuning
    pub pid: PidConfig,
    /// Device identification
    pub device: DeviceConfig,
}

impl ControlConfig {
    /// Set motor configuration
    pub fn with_motor(mut self, motor: MotorConfig) -> Self {
        self.motor = motor;
        self
    }

    /// Set ramp configuration
    pub fn with_ramp(mut self, ramp: RampConfig) -> Self {
        self.ramp = ramp;
        self
    }

    /// Set switch configuration
    pub fn with_switch(mut self, switch: SwitchConfig) -> Self {
        self.switch = switch;
        self
    }

    /// Set timed ramp configuration
    pub fn with_timed(mut self, timed: TimedConfig) -> Self {
        self.timed = timed;
        self
    }

    /// Set PID configuration
    pub fn with_pid(mut self, pid: PidConfig) -> Self {
        self.pid = pid;
        self
    }

    /// Set device configuration
    pub fn with_device(mut self, device: DeviceConfig) -> Self {
        self.device = device;
        self
    }

    /// Checks every section.
    pub fn validate(&self) -> Result<(), Error> {
        self.motor.validate()?;
        self.ramp.validate()?;
        self.switch.validate()?;
        self.timed.validate()?;
        self.pid.validate()
    }
}

// ============================================================================
// Motor Config
// ============================================================================

/// Motor output configuration
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MotorConfig {
    /// Pin driving positive polarity
    pub plus_pin: Pin,
    /// Pin driving negative polarity
    pub minus_pin: Pin,
    /// PWM resolution in bits
    pub resolution_bits: u8,
    /// PWM frequency in hertz
    pub frequency_hz: u32,
    /// Duties below this magnitude are written as zero
    pub min_power: u32,
}

impl Default for MotorConfig {
    fn default() -> Self {
        Self {
            plus_pin: 4,
            minus_pin: 5,
            resolution_bits: 10,
            frequency_hz: 30_000,
            min_power: 0,
        }
    }
}

impl MotorConfig {
    /// Set the H-bridge pins
    pub fn with_pins(mut self, plus: Pin, minus: Pin) -> Self {
        self.plus_pin = plus;
        self.minus_pin = minus;
        self
    }

    /// Set the PWM resolution
    pub fn with_resolution_bits(mut self, bits: u8) -> Self {
        self.resolution_bits = bits;
        self
    }

    /// Set the minimum power threshold
    pub fn with_min_power(mut self, min_power: u32) -> Self {
        self.min_power = min_power;
        self
    }

    /// Largest duty for the configured resolution
    pub fn max_duty(&self) -> i32 {
        max_duty_for_resolution(self.resolution_bits)
    }

    fn validate(&self) -> Result<(), Error> {
        if !(1..=20).contains(&self.resolution_bits) {
            return Err(Error::InvalidConfig("motor resolution must be 1..=20 bits"));
        }
        if self.plus_pin == self.minus_pin {
            return Err(Error::InvalidConfig("motor pins must differ"));
        }
        if self.min_power as i64 > self.max_duty() as i64 {
            return Err(Error::InvalidConfig("motor min power exceeds max duty"));
        }
        Ok(())
    }
}

// ============================================================================
// Ramp Config
// ============================================================================

/// Continuous ramp timing: a full-scale change takes `smooth_ms` split
/// into `smooth_steps` ticks.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RampConfig {
    /// Time for a full-scale change in milliseconds
    pub smooth_ms: u32,
    /// Number of ticks for a full-scale change
    pub smooth_steps: u16,
}

impl Default for RampConfig {
    fn default() -> Self {
        Self {
            smooth_ms: 1000,
            smooth_steps: 100,
        }
    }
}

impl RampConfig {
    /// Set the full-scale duration
    pub fn with_smooth_ms(mut self, ms: u32) -> Self {
        self.smooth_ms = ms;
        self
    }

    /// Set the number of ticks
    pub fn with_smooth_steps(mut self, steps: u16) -> Self {
        self.smooth_steps = steps;
        self
    }

    /// Change per tick for an output of the given full scale
    pub fn step(&self, full_scale: i32) -> f32 {
        step_for(full_scale, self.smooth_steps)
    }

    /// Pause between ticks
    pub fn tick(&self) -> Duration {
        tick_for(self.smooth_ms, self.smooth_steps)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.smooth_steps == 0 {
            return Err(Error::InvalidConfig("ramp needs at least one step"));
        }
        Ok(())
    }
}

fn step_for(full_scale: i32, steps: u16) -> f32 {
    if steps == 0 {
        full_scale as f32
    } else {
        full_scale as f32 / f32::from(steps)
    }
}

fn tick_for(smooth_ms: u32, steps: u16) -> Duration {
    if steps == 0 {
        Duration::ZERO
    } else {
        Duration::from_millis(u64::from(smooth_ms / u32::from(steps)))
    }
}

// ============================================================================
// Switch Config
// ============================================================================

/// Switch machine configuration
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SwitchConfig {
    /// Breakaway ramp and settle time in milliseconds
    pub smooth_ms: u32,
    /// Ticks of the breakaway ramp
    pub smooth_steps: u16,
    /// Breakaway duty
    pub max_duty: u32,
    /// Hold duty after settling
    pub stabilize_duty: u32,
    /// State that de-energizes a unidirectional switch
    pub release_state: bool,
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            smooth_ms: 500,
            smooth_steps: 10,
            max_duty: 1023,
            stabilize_duty: 300,
            release_state: false,
        }
    }
}

impl SwitchConfig {
    /// Set ramp duration and tick count
    pub fn with_timing(mut self, smooth_ms: u32, smooth_steps: u16) -> Self {
        self.smooth_ms = smooth_ms;
        self.smooth_steps = smooth_steps;
        self
    }

    /// Set breakaway and hold duties
    pub fn with_duties(mut self, max_duty: u32, stabilize_duty: u32) -> Self {
        self.max_duty = max_duty;
        self.stabilize_duty = stabilize_duty;
        self
    }

    /// Set the release state
    pub fn with_release_state(mut self, state: bool) -> Self {
        self.release_state = state;
        self
    }

    /// Duty increase per breakaway tick
    pub fn step(&self) -> f32 {
        step_for(self.max_duty as i32, self.smooth_steps)
    }

    /// Pause between breakaway ticks
    pub fn tick(&self) -> Duration {
        tick_for(self.smooth_ms, self.smooth_steps)
    }

    /// Wait at breakaway duty before dropping to hold duty
    pub fn settle(&self) -> Duration {
        Duration::from_millis(u64::from(self.smooth_ms))
    }

    /// Brake time before energizing a bidirectional switch
    pub fn dead_time(&self) -> Duration {
        Duration::from_millis(u64::from(self.smooth_ms / 2))
    }

    fn validate(&self) -> Result<(), Error> {
        if self.max_duty == 0 {
            return Err(Error::InvalidConfig("switch max duty must be nonzero"));
        }
        if self.stabilize_duty > self.max_duty {
            return Err(Error::InvalidConfig("switch hold duty exceeds max duty"));
        }
        if self.max_duty > i32::MAX as u32 {
            return Err(Error::InvalidConfig("switch max duty out of range"));
        }
        Ok(())
    }
}

// ============================================================================
// Timed Ramp Config
// ============================================================================

/// Timer-driven ramp: any change completes in `full_travel_ms`.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TimedConfig {
    /// Time for any change to complete, in milliseconds
    pub full_travel_ms: u32,
    /// Timer period in microseconds
    pub tick_us: u32,
}

impl Default for TimedConfig {
    fn default() -> Self {
        Self {
            full_travel_ms: 2000,
            tick_us: 1000,
        }
    }
}

impl TimedConfig {
    /// Set the travel time
    pub fn with_full_travel_ms(mut self, ms: u32) -> Self {
        self.full_travel_ms = ms;
        self
    }

    /// Set the timer period
    pub fn with_tick_us(mut self, us: u32) -> Self {
        self.tick_us = us;
        self
    }

    /// Timer period
    pub fn tick(&self) -> Duration {
        Duration::from_micros(u64::from(self.tick_us))
    }

    /// Number of ticks a change is spread over (at least 1)
    pub fn ticks_per_travel(&self) -> u64 {
        let ticks = u64::from(self.full_travel_ms) * 1000 / u64::from(self.tick_us.max(1));
        ticks.max(1)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.tick_us == 0 {
            return Err(Error::InvalidConfig("timed ramp tick must be nonzero"));
        }
        Ok(())
    }
}

// ============================================================================
// PID Config
// ============================================================================

/// PID loop tuning
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PidConfig {
    /// Proportional gain
    pub kp: f32,
    /// Integral gain
    pub ki: f32,
    /// Derivative gain
    pub kd: f32,
    /// Commands and feedback closer than this are treated as equal
    pub deadband: f32,
    /// Control period in milliseconds
    pub period_ms: u32,
    /// Lower output bound
    pub output_min: f32,
    /// Upper output bound
    pub output_max: f32,
    /// Longest wait for the load to stop before a reversal, in milliseconds
    pub stop_timeout_ms: u64,
}

impl Default for PidConfig {
    fn default() -> Self {
        Self {
            kp: 1.0,
            ki: 0.0,
            kd: 0.0,
            deadband: 1.0,
            period_ms: 100,
            output_min: 0.0,
            output_max: 1023.0,
            stop_timeout_ms: 10_000,
        }
    }
}

impl PidConfig {
    /// Set the gains
    pub fn with_gains(mut self, kp: f32, ki: f32, kd: f32) -> Self {
        self.kp = kp;
        self.ki = ki;
        self.kd = kd;
        self
    }

    /// Set the deadband
    pub fn with_deadband(mut self, deadband: f32) -> Self {
        self.deadband = deadband;
        self
    }

    /// Set the control period
    pub fn with_period_ms(mut self, ms: u32) -> Self {
        self.period_ms = ms;
        self
    }

    /// Set the output bounds
    pub fn with_output_limits(mut self, min: f32, max: f32) -> Self {
        self.output_min = min;
        self.output_max = max;
        self
    }

    /// Set the stop-and-wait timeout
    pub fn with_stop_timeout_ms(mut self, ms: u64) -> Self {
        self.stop_timeout_ms = ms;
        self
    }

    /// Control period
    pub fn period(&self) -> Duration {
        Duration::from_millis(u64::from(self.period_ms))
    }

    fn validate(&self) -> Result<(), Error> {
        if ![self.kp, self.ki, self.kd, self.deadband, self.output_min, self.output_max]
            .iter()
            .all(|v| v.is_finite())
        {
            return Err(Error::InvalidConfig("pid values must be finite"));
        }
        if self.output_min > self.output_max {
            return Err(Error::InvalidConfig("pid output min exceeds max"));
        }
        if self.deadband < 0.0 {
            return Err(Error::InvalidConfig("pid deadband must not be negative"));
        }
        if self.period_ms == 0 {
            return Err(Error::InvalidConfig("pid period must be nonzero"));
        }
        Ok(())
    }
}

// ============================================================================
// Device Config
// ============================================================================

/// Device identification configuration
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceConfig {
    /// Human-readable device name
    pub name: ShortString,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: short_string("railnode"),
        }
    }
}

impl DeviceConfig {
    /// Set the device name
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = short_string(name);
        self
    }
}

// ============================================================================
// Live snapshot
// ============================================================================

/// Shared, atomically replaceable configuration.
///
/// Cloning shares the same snapshot.
#[derive(Clone, Debug)]
pub struct LiveConfig {
    inner: Arc<ArcSwap<ControlConfig>>,
}

impl LiveConfig {
    /// Publishes `config` as the first snapshot.
    pub fn new(config: ControlConfig) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(config)),
        }
    }

    /// Current snapshot.
    pub fn load(&self) -> Arc<ControlConfig> {
        self.inner.load_full()
    }

    /// Replaces the snapshot after validating it.
    pub fn store(&self, config: ControlConfig) -> Result<(), Error> {
        config.validate()?;
        self.inner.store(Arc::new(config));
        Ok(())
    }

    /// Applies `f` to a copy of the current snapshot and publishes it.
    pub fn update(&self, f: impl Fn(&mut ControlConfig)) {
        self.inner.rcu(|current| {
            let mut next = ControlConfig::clone(current);
            f(&mut next);
            next
        });
    }
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self::new(ControlConfig::default())
    }
}

impl From<ControlConfig> for LiveConfig {
    fn from(config: ControlConfig) -> Self {
        Self::new(config)
    }
}

// ============================================================================
// Tests
// ============================================================================
