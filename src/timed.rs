//! Timer-driven ramp with braking on zero crossings.
//!
//! Unlike [`RampActuator`](crate::ramp::RampActuator), which runs inside a
//! worker and waits on its channel between steps, [`TimedRamp`] is shared:
//! producers install targets from any thread and a [`PeriodicTimer`] calls
//! [`tick`](TimedRamp::tick) at a fixed rate.
//!
//! Any change takes the same time, `full_travel_ms`: the step is the distance
//! divided by the number of ticks in that time. The position is kept in Q16
//! fixed point so small steps accumulate.
//!
//! When the value lands on or crosses zero while moving, the output enters
//! the braking phase: zero duty with both legs held at brake level. Braking
//! ends when the stop detector reports that motion stopped (immediately when
//! none is installed) or when a new nonzero target is installed.
//!
//! # Example
//!
//! ```rust
//! use rs_railnode::config::{ControlConfig, LiveConfig, TimedConfig};
//! use rs_railnode::hal::MockPwm;
//! use rs_railnode::output::HBridge;
//! use rs_railnode::timed::TimedRamp;
//!
//! let config = ControlConfig::default()
//!     .with_timed(TimedConfig::default().with_full_travel_ms(100).with_tick_us(10_000));
//! let pwm = MockPwm::new();
//! let ramp = TimedRamp::new(HBridge::new(pwm.clone(), 4, 5, 1000).unwrap(), LiveConfig::new(config));
//!
//! assert!(ramp.set_value(500));
//! for _ in 0..10 {
//!     ramp.tick().unwrap();
//! }
//! assert_eq!(ramp.current_value(), 500);
//! assert_eq!(pwm.pin(4).duty, 500);
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::LiveConfig;
use crate::error::Error;
use crate::output::{apply_deadband, round_duty};
use crate::status::ActuatorStatus;
use crate::traits::{Direction, DriveOutput};
use crate::worker::PeriodicTimer;

const Q16_HALF: i64 = 1 << 15;

#[inline]
fn to_q16(duty: i32) -> i64 {
    i64::from(duty) << 16
}

/// Rounds a Q16 value to the nearest duty, half away from zero.
#[inline]
fn from_q16(value: i64) -> i32 {
    let magnitude = (value.abs() + Q16_HALF) >> 16;
    (value.signum() * magnitude) as i32
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Motion,
    Braking,
}

#[derive(Debug)]
struct TimedCore<O> {
    output: O,
    current: i64,
    step: i64,
    phase: Phase,
    cancel_brake: bool,
}

type StopDetector = Box<dyn Fn() -> bool + Send + Sync>;

/// Shared ramp advanced by a periodic timer.
pub struct TimedRamp<O> {
    core: Mutex<TimedCore<O>>,
    target: AtomicI32,
    current: AtomicI64,
    braking: AtomicBool,
    emergency: AtomicBool,
    min_duty: i32,
    max_duty: i32,
    stop_detector: Option<StopDetector>,
    config: LiveConfig,
    status: Arc<ActuatorStatus>,
}

impl<O: DriveOutput> TimedRamp<O> {
    /// Wraps an output, stopped at zero.
    pub fn new(output: O, config: LiveConfig) -> Self {
        let status = Arc::new(ActuatorStatus::new(output.full_scale()));
        Self {
            min_duty: output.min_duty(),
            max_duty: output.max_duty(),
            core: Mutex::new(TimedCore {
                output,
                current: 0,
                step: 0,
                phase: Phase::Motion,
                cancel_brake: false,
            }),
            target: AtomicI32::new(0),
            current: AtomicI64::new(0),
            braking: AtomicBool::new(false),
            emergency: AtomicBool::new(false),
            stop_detector: None,
            config,
            status,
        }
    }

    /// Installs the "motion stopped" predicate that ends braking.
    pub fn with_stop_detector(mut self, stopped: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.stop_detector = Some(Box::new(stopped));
        self
    }

    /// Duty currently applied, before the minimum-power deadband.
    pub fn current_value(&self) -> i32 {
        from_q16(self.current.load(Ordering::Acquire))
    }

    /// Duty being approached.
    pub fn target_value(&self) -> i32 {
        self.target.load(Ordering::Acquire)
    }

    /// Returns true while both legs are held at brake level.
    pub fn is_braking(&self) -> bool {
        self.braking.load(Ordering::Acquire)
    }

    /// Returns true while the emergency stop is engaged.
    pub fn is_emergency_stopped(&self) -> bool {
        self.emergency.load(Ordering::Acquire)
    }

    /// Shared state accessors.
    pub fn status(&self) -> Arc<ActuatorStatus> {
        Arc::clone(&self.status)
    }

    /// Runs `f` with the output locked.
    pub fn with_output<R>(&self, f: impl FnOnce(&O) -> R) -> R {
        f(&self.core.lock().output)
    }

    /// Requests a new target in duty units, clamped to the output range.
    ///
    /// The step is computed without holding the lock and installed only if
    /// neither the target nor the position changed meanwhile; otherwise it
    /// is recomputed. Returns false while the emergency stop is engaged.
    pub fn set_value(&self, value: i32) -> bool {
        let value = value.clamp(self.min_duty, self.max_duty);
        loop {
            if self.emergency.load(Ordering::Acquire) {
                return false;
            }
            let seen = self.target.load(Ordering::Acquire);
            let from = self.current.load(Ordering::Acquire);
            let delta = to_q16(value) - from;
            let ticks = self.config.load().timed.ticks_per_travel() as i64;
            let step = match delta / ticks {
                0 => delta.signum(),
                step => step,
            };

            let mut core = self.core.lock();
            if self.emergency.load(Ordering::Acquire) {
                return false;
            }
            if self.target.load(Ordering::Acquire) != seen || core.current != from {
                continue;
            }
            self.target.store(value, Ordering::Release);
            core.step = step;
            if core.phase == Phase::Braking && value != 0 {
                core.cancel_brake = true;
            }
            drop(core);

            self.status.record_target(value as f32);
            return true;
        }
    }

    /// Requests a fractional target, rounded half away from zero.
    pub fn set_value_f32(&self, value: f32) -> bool {
        self.set_value(round_duty(value, self.min_duty, self.max_duty))
    }

    /// Engages or clears the emergency stop.
    ///
    /// Engaging zeroes the position and target, brakes both legs and makes
    /// [`set_value`](Self::set_value) fail. Clearing releases the brake.
    pub fn set_emergency_stop(&self, stop: bool) -> Result<(), O::Error> {
        let mut core = self.core.lock();
        if self.emergency.load(Ordering::Acquire) == stop {
            return Ok(());
        }

        if stop {
            self.emergency.store(true, Ordering::Release);
            self.target.store(0, Ordering::Release);
            core.current = 0;
            core.step = 0;
            core.phase = Phase::Motion;
            core.cancel_brake = false;
            self.current.store(0, Ordering::Release);
            self.status.record_target(0.0);
            core.output.brake()?;
            warn!("emergency stop engaged");
        } else {
            core.output.release_brake()?;
            self.emergency.store(false, Ordering::Release);
            info!("emergency stop cleared");
        }
        self.publish(&core);
        Ok(())
    }

    /// Advances the ramp by one timer period.
    pub fn tick(&self) -> Result<(), O::Error> {
        let mut core = self.core.lock();
        match core.phase {
            Phase::Motion => self.advance(&mut core)?,
            Phase::Braking => {
                let stopped = self.stop_detector.as_ref().map_or(true, |stopped| stopped());
                if core.cancel_brake || stopped {
                    core.output.release_brake()?;
                    core.phase = Phase::Motion;
                    core.cancel_brake = false;
                    debug!(cancelled = !stopped, "brake released");
                }
            }
        }
        self.publish(&core);
        Ok(())
    }

    fn advance(&self, core: &mut TimedCore<O>) -> Result<(), O::Error> {
        let step = core.step;
        if step == 0 {
            return Ok(());
        }

        let current = core.current;
        let current_duty = from_q16(current);
        let mut next = current + step;
        let next_duty = from_q16(next);

        if next_duty != current_duty {
            let crosses = current_duty != 0 && current_duty.signum() != next_duty.signum();
            if next_duty == 0 || crosses {
                next = 0;
                core.output.brake()?;
                core.phase = Phase::Braking;
                core.cancel_brake = false;
                if self.target.load(Ordering::Acquire) == 0 {
                    core.step = 0;
                }
                debug!("zero crossing, braking");
            } else {
                let target = self.target.load(Ordering::Acquire);
                let mut duty = next_duty.clamp(self.min_duty, self.max_duty);
                let reached = (duty <= target && target <= current_duty)
                    || (duty >= target && target >= current_duty);
                if reached {
                    next = to_q16(target);
                    duty = target;
                    core.step = 0;
                }
                let min_power = self.config.load().motor.min_power;
                let duty = apply_deadband(duty, min_power);
                if duty != core.output.duty() {
                    core.output.drive(duty)?;
                }
            }
        }

        core.current = next;
        self.current.store(next, Ordering::Release);
        Ok(())
    }

    fn publish(&self, core: &TimedCore<O>) {
        let braking = core.phase == Phase::Braking || core.output.is_braking();
        self.braking.store(braking, Ordering::Release);
        let current = from_q16(core.current);
        self.status.record(current as f32, Direction::from_sign(current));
        self.status.record_on(current != 0);
        self.status.record_braking(braking);
    }
}

impl<O> TimedRamp<O>
where
    O: DriveOutput + Send + 'static,
{
    /// Ticks the ramp on a timer thread at the configured period.
    pub fn start_timer(self: &Arc<Self>) -> Result<PeriodicTimer, Error> {
        let ramp = Arc::clone(self);
        let period = self.config.load().timed.tick();
        PeriodicTimer::start("timed-ramp", period, move || {
            if let Err(err) = ramp.tick() {
                warn!(error = ?err, "timed ramp output error");
            }
        })
    }
}

impl<O: fmt::Debug> fmt::Debug for TimedRamp<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimedRamp")
            .field("core", &self.core)
            .field("target", &self.target)
            .field("emergency", &self.emergency)
            .field("stop_detector", &self.stop_detector.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ControlConfig, MotorConfig, TimedConfig};
    use crate::hal::mock::MockPwm;
    use crate::output::{HBridge, PwmChannel};
    use crate::traits::Level;

    const Q16_ONE: i64 = 1 << 16;

    fn config() -> LiveConfig {
        LiveConfig::new(ControlConfig::default().with_timed(
            TimedConfig::default()
                .with_full_travel_ms(100)
                .with_tick_us(10_000),
        ))
    }

    fn run(ramp: &TimedRamp<impl DriveOutput>, ticks: usize) {
        for _ in 0..ticks {
            ramp.tick().unwrap();
        }
    }

    #[test]
    fn q16_rounding_is_symmetric() {
        assert_eq!(from_q16(Q16_HALF), 1);
        assert_eq!(from_q16(-Q16_HALF), -1);
        assert_eq!(from_q16(Q16_HALF - 1), 0);
        assert_eq!(from_q16(to_q16(-7)), -7);
        assert_eq!(from_q16(3 * Q16_ONE + 1), 3);
    }

    #[test]
    fn any_distance_takes_the_same_ticks() {
        let pwm = MockPwm::new();
        let ramp = TimedRamp::new(PwmChannel::new(pwm.clone(), 1, 1000).unwrap(), config());

        ramp.set_value(1000);
        run(&ramp, 10);
        assert_eq!(&pwm.duty_writes(1)[1..], &[100, 200, 300, 400, 500, 600, 700, 800, 900, 1000]);

        ramp.set_value(500);
        run(&ramp, 9);
        assert_eq!(ramp.current_value(), 550);
        ramp.tick().unwrap();
        assert_eq!(ramp.current_value(), 500);

        pwm.clear_events();
        run(&ramp, 3);
        assert!(pwm.events().is_empty());
    }

    #[test]
    fn reversal_brakes_at_zero() {
        let pwm = MockPwm::new();
        let ramp = TimedRamp::new(HBridge::new(pwm.clone(), 4, 5, 1000).unwrap(), config());
        ramp.set_value(500);
        run(&ramp, 10);
        assert_eq!(ramp.current_value(), 500);

        ramp.set_value(-500);
        run(&ramp, 5);
        assert!(ramp.is_braking());
        assert_eq!(ramp.current_value(), 0);
        assert_eq!(pwm.pin(4).level, Level::High);
        assert_eq!(pwm.pin(5).level, Level::High);

        // No stop detector: released on the next tick.
        ramp.tick().unwrap();
        assert!(!ramp.is_braking());

        run(&ramp, 5);
        assert_eq!(ramp.current_value(), -500);
        assert_eq!(pwm.pin(5).duty, 500);
        assert!(!pwm.pin(4).attached);
        assert_eq!(pwm.conflicts(), 0);
        assert_eq!(ramp.status().direction(), Direction::Reverse);
    }

    #[test]
    fn braking_holds_until_motion_stops() {
        let moving = Arc::new(AtomicBool::new(true));
        let still_moving = Arc::clone(&moving);
        let pwm = MockPwm::new();
        let ramp = TimedRamp::new(HBridge::new(pwm, 4, 5, 1000).unwrap(), config())
            .with_stop_detector(move || !still_moving.load(Ordering::SeqCst));

        ramp.set_value(300);
        run(&ramp, 10);
        ramp.set_value(0);
        run(&ramp, 10);
        assert!(ramp.is_braking());

        run(&ramp, 20);
        assert!(ramp.is_braking());

        moving.store(false, Ordering::SeqCst);
        ramp.tick().unwrap();
        assert!(!ramp.is_braking());
        assert_eq!(ramp.current_value(), 0);
    }

    #[test]
    fn nonzero_target_cancels_braking() {
        let pwm = MockPwm::new();
        let ramp = TimedRamp::new(HBridge::new(pwm.clone(), 4, 5, 1000).unwrap(), config())
            .with_stop_detector(|| false);

        ramp.set_value(300);
        run(&ramp, 10);
        ramp.set_value(0);
        run(&ramp, 10);
        assert!(ramp.is_braking());

        ramp.set_value(200);
        ramp.tick().unwrap();
        assert!(!ramp.is_braking());
        run(&ramp, 10);
        assert_eq!(ramp.current_value(), 200);
        assert_eq!(pwm.pin(4).duty, 200);
    }

    #[test]
    fn emergency_stop_rejects_targets_until_cleared() {
        let pwm = MockPwm::new();
        let ramp = TimedRamp::new(HBridge::new(pwm.clone(), 4, 5, 1000).unwrap(), config());
        ramp.set_value(800);
        run(&ramp, 3);

        ramp.set_emergency_stop(true).unwrap();
        assert!(ramp.is_emergency_stopped());
        assert_eq!(ramp.current_value(), 0);
        assert_eq!(ramp.target_value(), 0);
        assert_eq!(pwm.pin(4).level, Level::High);
        assert_eq!(pwm.pin(5).level, Level::High);
        assert!(!ramp.set_value(300));

        run(&ramp, 5);
        assert_eq!(pwm.pin(4).duty, 0);

        ramp.set_emergency_stop(false).unwrap();
        assert_eq!(pwm.pin(4).level, Level::Low);
        assert_eq!(pwm.pin(5).level, Level::Low);
        assert!(!ramp.is_braking());
        assert!(ramp.set_value(300));
        run(&ramp, 10);
        assert_eq!(ramp.current_value(), 300);
    }

    #[test]
    fn min_power_deadband_zeroes_weak_duty() {
        let live = config();
        live.update(|c| c.motor = MotorConfig::default().with_min_power(150));
        let pwm = MockPwm::new();
        let ramp = TimedRamp::new(PwmChannel::new(pwm.clone(), 1, 1000).unwrap(), live);

        ramp.set_value(1000);
        ramp.tick().unwrap();
        assert_eq!(ramp.current_value(), 100);
        assert_eq!(pwm.pin(1).duty, 0);
        ramp.tick().unwrap();
        assert_eq!(pwm.pin(1).duty, 200);
    }

    #[test]
    fn fractional_targets_round_half_away_from_zero() {
        let pwm = MockPwm::new();
        let ramp = TimedRamp::new(HBridge::new(pwm, 4, 5, 1000).unwrap(), config());
        ramp.set_value_f32(2.5);
        assert_eq!(ramp.target_value(), 3);
        ramp.set_value_f32(-2.5);
        assert_eq!(ramp.target_value(), -3);
        ramp.set_value_f32(5000.0);
        assert_eq!(ramp.target_value(), 1000);
    }

    #[test]
    fn concurrent_producers_leave_a_consistent_target() {
        let pwm = MockPwm::new();
        let ramp = Arc::new(TimedRamp::new(
            PwmChannel::new(pwm.clone(), 1, 1000).unwrap(),
            config(),
        ));

        let producers: Vec<_> = (0..4)
            .map(|i| {
                let ramp = Arc::clone(&ramp);
                std::thread::spawn(move || {
                    for n in 0..200 {
                        ramp.set_value((i * 200 + n) % 1000);
                        ramp.tick().unwrap();
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        let target = ramp.target_value();
        run(&ramp, 12);
        assert_eq!(ramp.current_value(), target);
        assert_eq!(pwm.pin(1).duty, target as u32);
    }
}
