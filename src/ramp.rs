//! Generic ramp engine and the continuous ramp actuator.
//!
//! [`Ramp`] moves a value towards a target by at most one step per tick and
//! writes the rounded duty to a [`DriveOutput`]. It never overshoots: the last
//! step is clamped to the target. The same engine drives single PWM
//! channels, H-bridges (reversal sequencing is the output's job) and the
//! breakaway ramp of [`SwitchActuator`](crate::switch::SwitchActuator).
//!
//! [`RampActuator`] runs a ramp per command. Between ticks it waits on the
//! command channel; a fresher command abandons the ramp in progress and a new
//! one starts from the value last applied.
//!
//! # Example
//!
//! ```rust
//! use rs_railnode::hal::MockPwm;
//! use rs_railnode::output::PwmChannel;
//! use rs_railnode::ramp::Ramp;
//!
//! let pwm = MockPwm::new();
//! let mut ramp = Ramp::new(PwmChannel::new(pwm.clone(), 2, 1023).unwrap());
//!
//! ramp.retarget(1000.0, 100.0);
//! let mut ticks = 0;
//! while ramp.tick().unwrap() {
//!     ticks += 1;
//! }
//! assert_eq!(ticks, 10);
//! assert_eq!(pwm.pin(2).duty, 1000);
//! ```

use std::sync::Arc;

use tracing::debug;

use crate::channel::{CommandSender, CommandWait};
use crate::config::LiveConfig;
use crate::output::round_duty;
use crate::status::ActuatorStatus;
use crate::traits::{Direction, DriveOutput};
use crate::worker::Actuator;

// ============================================================================
// Engine
// ============================================================================

/// Progress of a ramp.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RampState {
    /// Value last applied to the output.
    pub current: f32,
    /// Value being approached.
    pub target: f32,
    /// Largest change per tick.
    pub step: f32,
    /// Polarity of `current`.
    pub direction: Direction,
    /// Output is holding its brake.
    pub braking: bool,
}

/// Stepwise approach of a target over a [`DriveOutput`].
#[derive(Debug)]
pub struct Ramp<O> {
    output: O,
    state: RampState,
}

impl<O: DriveOutput> Ramp<O> {
    /// Starts at the output's current duty.
    pub fn new(output: O) -> Self {
        let current = output.duty() as f32;
        let state = RampState {
            current,
            target: current,
            step: 0.0,
            direction: output.direction(),
            braking: output.is_braking(),
        };
        Self { output, state }
    }

    /// Current progress.
    pub fn state(&self) -> &RampState {
        &self.state
    }

    /// The driven output.
    pub fn output(&self) -> &O {
        &self.output
    }

    /// Releases the output.
    pub fn into_output(self) -> O {
        self.output
    }

    /// Sets a new target, clamped to the output range, and the step size.
    ///
    /// A step that is not a positive number covers the whole range in one
    /// tick. Progress continues from the value last applied.
    pub fn retarget(&mut self, target: f32, step: f32) {
        let (min, max) = (self.output.min_duty() as f32, self.output.max_duty() as f32);
        self.state.target = if target.is_nan() {
            self.state.current
        } else {
            target.max(min).min(max)
        };
        self.state.step = if step > 0.0 { step } else { max - min };
    }

    /// Returns true when the target is reached (within one unit).
    pub fn is_settled(&self) -> bool {
        (self.state.target - self.state.current).abs() < 1.0
    }

    /// Moves one step towards the target.
    ///
    /// Returns `Ok(false)` without touching the output when already settled.
    pub fn tick(&mut self) -> Result<bool, O::Error> {
        let RampState {
            current,
            target,
            step,
            ..
        } = self.state;
        let diff = target - current;
        if diff.abs() < 1.0 {
            return Ok(false);
        }

        let next = if diff > 0.0 {
            (current + step).min(target)
        } else {
            (current - step).max(target)
        };
        self.apply(next)?;
        Ok(true)
    }

    /// Applies a value at once, without ramping.
    ///
    /// The value is clamped to the output range; the output is written only
    /// when the rounded duty changes.
    pub fn apply(&mut self, value: f32) -> Result<(), O::Error> {
        let (min, max) = (self.output.min_duty(), self.output.max_duty());
        let value = if value.is_nan() {
            self.state.current
        } else {
            value.max(min as f32).min(max as f32)
        };

        let duty = round_duty(value, min, max);
        if duty != self.output.duty() || self.output.is_braking() {
            self.output.drive(duty)?;
        }
        self.state.current = value;
        self.state.direction = self.output.direction();
        self.state.braking = self.output.is_braking();
        Ok(())
    }

    /// Zeroes the output and holds the brake. The target becomes zero.
    pub fn brake(&mut self) -> Result<(), O::Error> {
        self.output.brake()?;
        self.state.current = 0.0;
        self.state.target = 0.0;
        self.state.direction = Direction::Stopped;
        self.state.braking = self.output.is_braking();
        Ok(())
    }
}

// ============================================================================
// Actuator
// ============================================================================

/// Ramped continuous output driven by a command channel of target values.
#[derive(Debug)]
pub struct RampActuator<O> {
    ramp: Ramp<O>,
    config: LiveConfig,
    status: Arc<ActuatorStatus>,
}

impl<O: DriveOutput> RampActuator<O> {
    /// Wraps an output. Timing comes from `config.ramp` at each command.
    pub fn new(output: O, config: LiveConfig) -> Self {
        let status = Arc::new(ActuatorStatus::new(output.full_scale()));
        Self {
            ramp: Ramp::new(output),
            config,
            status,
        }
    }

    /// Shared state accessors.
    pub fn status(&self) -> Arc<ActuatorStatus> {
        Arc::clone(&self.status)
    }

    /// The ramp engine.
    pub fn ramp(&self) -> &Ramp<O> {
        &self.ramp
    }

    /// Producer handle sending to this actuator through `sender`.
    pub fn commander(&self, sender: CommandSender<f32>) -> RampCommander {
        RampCommander {
            sender,
            status: self.status(),
        }
    }

    fn publish(&self) {
        let state = self.ramp.state();
        self.status.record(state.current, state.direction);
        self.status.record_on(state.current != 0.0);
    }
}

impl<O: DriveOutput> Actuator for RampActuator<O> {
    type Command = f32;
    type Error = O::Error;

    fn process<W: CommandWait<f32>>(
        &mut self,
        command: f32,
        commands: &mut W,
    ) -> Result<(), Self::Error> {
        let mut target = command;
        'redirect: loop {
            let config = self.config.load();
            let step = config.ramp.step(self.ramp.output().full_scale());
            let tick = config.ramp.tick();

            self.ramp.retarget(target, step);
            self.status.record_target(self.ramp.state().target);
            debug!(from = self.ramp.state().current, to = self.ramp.state().target, "ramp");

            while self.ramp.tick()? {
                self.publish();
                if self.ramp.is_settled() {
                    break;
                }
                if let Some(next) = commands.wait(tick) {
                    target = next;
                    continue 'redirect;
                }
                if commands.is_closed() {
                    return Ok(());
                }
            }
            self.publish();
            return Ok(());
        }
    }

    fn safe_stop(&mut self) -> Result<(), Self::Error> {
        self.ramp.retarget(0.0, 0.0);
        self.ramp.apply(0.0)?;
        self.status.record_target(0.0);
        self.publish();
        Ok(())
    }
}

/// Producer-side handle for a [`RampActuator`].
#[derive(Clone, Debug)]
pub struct RampCommander {
    sender: CommandSender<f32>,
    status: Arc<ActuatorStatus>,
}

impl RampCommander {
    /// Requests a target in duty units. Returns false if it was not queued.
    pub fn set_value(&self, value: f32) -> bool {
        self.sender.try_send(value)
    }

    /// Requests a target as a percentage of full scale (`-100..=100`).
    pub fn set_power(&self, percent: f32) -> bool {
        self.set_value(power_to_value(percent, self.status.full_scale()))
    }

    /// State accessors of the actuator.
    pub fn status(&self) -> &ActuatorStatus {
        &self.status
    }
}

/// Maps a percentage onto `-full_scale..=full_scale`, with the fraction
/// rounded to three decimals.
///
/// ```rust
/// use rs_railnode::ramp::power_to_value;
///
/// assert_eq!(power_to_value(50.0, 1000.0), 500.0);
/// assert_eq!(power_to_value(-150.0, 1000.0), -1000.0);
/// assert_eq!(power_to_value(33.3333, 1000.0), 333.0);
/// ```
pub fn power_to_value(percent: f32, full_scale: f32) -> f32 {
    if percent.is_nan() {
        return 0.0;
    }
    let fraction = (percent.clamp(-100.0, 100.0) * 10.0).round() / 1000.0;
    fraction * full_scale
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ControlConfig, RampConfig};
    use crate::hal::mock::{MockClock, MockPwm, ScriptedCommands};
    use crate::output::{HBridge, PwmChannel};
    use crate::traits::Clock;

    fn config(smooth_ms: u32, smooth_steps: u16) -> LiveConfig {
        LiveConfig::new(ControlConfig::default().with_ramp(
            RampConfig::default()
                .with_smooth_ms(smooth_ms)
                .with_smooth_steps(smooth_steps),
        ))
    }

    #[test]
    fn tick_never_overshoots() {
        let pwm = MockPwm::new();
        let mut ramp = Ramp::new(PwmChannel::new(pwm.clone(), 1, 1023).unwrap());
        ramp.retarget(250.0, 100.0);
        while ramp.tick().unwrap() {}
        assert_eq!(pwm.duty_writes(1), vec![0, 100, 200, 250]);
        assert_eq!(ramp.state().current, 250.0);
    }

    #[test]
    fn target_is_clamped_to_output_range() {
        let pwm = MockPwm::new();
        let mut ramp = Ramp::new(PwmChannel::new(pwm, 1, 255).unwrap());
        ramp.retarget(-40.0, 10.0);
        assert_eq!(ramp.state().target, 0.0);
        ramp.retarget(9000.0, 10.0);
        assert_eq!(ramp.state().target, 255.0);
    }

    #[test]
    fn settled_ramp_does_not_write() {
        let pwm = MockPwm::new();
        let mut ramp = Ramp::new(PwmChannel::new(pwm.clone(), 1, 255).unwrap());
        pwm.clear_events();
        ramp.retarget(0.6, 10.0);
        assert!(!ramp.tick().unwrap());
        assert!(pwm.events().is_empty());
    }

    #[test]
    fn nonpositive_step_jumps_in_one_tick() {
        let pwm = MockPwm::new();
        let mut ramp = Ramp::new(HBridge::new(pwm.clone(), 4, 5, 1023).unwrap());
        ramp.retarget(-800.0, 0.0);
        assert!(ramp.tick().unwrap());
        assert!(ramp.is_settled());
        assert_eq!(pwm.pin(5).duty, 800);
    }

    #[test]
    fn actuator_reaches_target_in_exact_ticks() {
        let pwm = MockPwm::new();
        let output = PwmChannel::new(pwm.clone(), 1, 1000).unwrap();
        let mut actuator = RampActuator::new(output, config(100, 10));
        let clock = MockClock::new();
        let mut commands = ScriptedCommands::new(clock.clone()).open_until(10_000);

        actuator.process(1000.0, &mut commands).unwrap();

        let writes = pwm.duty_writes(1);
        assert_eq!(&writes[1..], &[100, 200, 300, 400, 500, 600, 700, 800, 900, 1000]);
        assert_eq!(commands.wait_count(), 9);
        assert_eq!(clock.now_ms(), 90);
        assert_eq!(actuator.status().current_value(), 1000.0);
    }

    #[test]
    fn fresher_command_redirects_without_stray_step() {
        let pwm = MockPwm::new();
        let output = PwmChannel::new(pwm.clone(), 1, 1000).unwrap();
        let mut actuator = RampActuator::new(output, config(100, 10));
        let clock = MockClock::new();
        // Ticks at t=0,10,20 apply 100,200,300; the redirect arrives at 25.
        let mut commands = ScriptedCommands::new(clock.clone()).at(25, 0.0).open_until(10_000);

        actuator.process(1000.0, &mut commands).unwrap();

        let writes = pwm.duty_writes(1);
        assert_eq!(&writes[1..], &[100, 200, 300, 200, 100, 0]);
        assert_eq!(actuator.status().current_value(), 0.0);
    }

    #[test]
    fn closed_channel_abandons_ramp() {
        let pwm = MockPwm::new();
        let output = PwmChannel::new(pwm.clone(), 1, 1000).unwrap();
        let mut actuator = RampActuator::new(output, config(100, 10));
        let mut commands = ScriptedCommands::<f32>::new(MockClock::new()).open_until(25);

        actuator.process(1000.0, &mut commands).unwrap();
        assert_eq!(actuator.status().current_value(), 300.0);

        actuator.safe_stop().unwrap();
        assert_eq!(pwm.pin(1).duty, 0);
    }

    #[test]
    fn reversal_through_hbridge_never_overlaps_legs() {
        let pwm = MockPwm::new();
        let output = HBridge::new(pwm.clone(), 4, 5, 1000).unwrap();
        let mut actuator = RampActuator::new(output, config(100, 10));
        let clock = MockClock::new();
        let mut commands = ScriptedCommands::new(clock).at(25, -500.0).open_until(10_000);

        actuator.process(500.0, &mut commands).unwrap();

        assert_eq!(pwm.conflicts(), 0);
        assert_eq!(actuator.status().direction(), Direction::Reverse);
        assert_eq!(pwm.pin(5).duty, 500);
        assert!(!pwm.pin(4).attached);
    }

    #[test]
    fn commander_maps_power_percent() {
        let pwm = MockPwm::new();
        let output = HBridge::new(pwm, 4, 5, 1000).unwrap();
        let actuator = RampActuator::new(output, config(100, 10));
        let (tx, rx) = crate::channel::command_channel(crate::channel::ChannelMode::Overwrite);
        let commander = actuator.commander(tx);

        assert!(commander.set_power(-25.0));
        assert_eq!(rx.receive(crate::channel::Timeout::Poll), Some(-250.0));
    }
}
