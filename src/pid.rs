//! PID speed controller and the task that schedules it.
//!
//! [`PidController`] is the bare control law: proportional on error,
//! derivative on measurement (no kick when the target jumps) and a clamped
//! integral. [`PidTask`] runs it on a command channel of signed targets and
//! refuses to reverse a moving load: it outputs zero and waits for the
//! feedback to settle before engaging the opposite polarity.
//!
//! # Example
//!
//! ```rust
//! use rs_railnode::pid::PidController;
//!
//! let mut pid = PidController::new(1.0, 0.0, 0.0, 0.0, 5.0);
//! pid.set_target(10.0);
//! assert_eq!(pid.calc(0.0, 0), 5.0);
//! ```

use tracing::{debug, info, warn};

use crate::channel::CommandWait;
use crate::config::{LiveConfig, PidConfig};
use crate::traits::{Clock, ControlSink, Direction, FeedbackSource};
use crate::worker::Actuator;

// ============================================================================
// Controller
// ============================================================================

/// Discrete PID controller with output and integral clamping.
#[derive(Clone, Debug, PartialEq)]
pub struct PidController {
    kp: f32,
    ki: f32,
    kd: f32,
    min: f32,
    max: f32,
    target: f32,
    integral: f32,
    prev_measurement: f32,
    prev_timestamp: Option<u64>,
}

impl PidController {
    /// Creates a controller with output bounds `[min, max]`.
    ///
    /// Swapped bounds are put in order.
    pub fn new(kp: f32, ki: f32, kd: f32, min: f32, max: f32) -> Self {
        let (min, max) = if min <= max { (min, max) } else { (max, min) };
        Self {
            kp,
            ki,
            kd,
            min,
            max,
            target: 0.0,
            integral: 0.0,
            prev_measurement: 0.0,
            prev_timestamp: None,
        }
    }

    /// Creates a controller from configuration.
    pub fn from_config(config: &PidConfig) -> Self {
        Self::new(
            config.kp,
            config.ki,
            config.kd,
            config.output_min,
            config.output_max,
        )
    }

    /// Computes the output for `measurement` taken at `now_ms`.
    ///
    /// The first sample after [`clear`](Self::clear) is proportional only.
    pub fn calc(&mut self, measurement: f32, now_ms: u64) -> f32 {
        let error = self.target - measurement;
        let mut output = error * self.kp;

        if let Some(prev) = self.prev_timestamp {
            let dt = now_ms.saturating_sub(prev) as f32 / 1000.0;
            if dt > 0.0 {
                output += (self.prev_measurement - measurement) * self.kd / dt;
                self.integral = self.clamp(self.integral + error * self.ki * dt);
                output += self.integral;
            }
        }

        self.prev_timestamp = Some(now_ms);
        self.prev_measurement = measurement;
        self.clamp(output)
    }

    /// Forgets the integral and the previous sample.
    pub fn clear(&mut self) {
        self.integral = 0.0;
        self.prev_measurement = 0.0;
        self.prev_timestamp = None;
    }

    /// Sets the setpoint.
    pub fn set_target(&mut self, target: f32) {
        self.target = target;
    }

    /// Current setpoint.
    pub fn target(&self) -> f32 {
        self.target
    }

    /// Replaces the gains; the integral is kept.
    pub fn set_gains(&mut self, kp: f32, ki: f32, kd: f32) {
        self.kp = kp;
        self.ki = ki;
        self.kd = kd;
    }

    /// Replaces the output bounds.
    pub fn set_limits(&mut self, min: f32, max: f32) {
        if min <= max {
            self.min = min;
            self.max = max;
            self.integral = self.clamp(self.integral);
        }
    }

    /// Accumulated integral term.
    pub fn integral(&self) -> f32 {
        self.integral
    }

    /// Applies gains and bounds from configuration.
    pub fn apply_config(&mut self, config: &PidConfig) {
        self.set_gains(config.kp, config.ki, config.kd);
        self.set_limits(config.output_min, config.output_max);
    }

    #[inline]
    fn clamp(&self, value: f32) -> f32 {
        value.max(self.min).min(self.max)
    }
}

// ============================================================================
// Task
// ============================================================================

/// `1.0` for zero and positive values, `-1.0` for negative ones.
#[inline]
fn sign_non_zero(value: f32) -> f32 {
    if value < 0.0 {
        -1.0
    } else {
        1.0
    }
}

/// Polarity of a measurement, `Stopped` inside the deadband.
#[inline]
fn motion(value: f32, deadband: f32) -> Direction {
    if value.is_nan() || value.abs() <= deadband {
        Direction::Stopped
    } else if value > 0.0 {
        Direction::Forward
    } else {
        Direction::Reverse
    }
}

/// Runs a [`PidController`] against signed target commands.
///
/// Feedback is signed: positive while the load moves forward. The controller
/// works on magnitudes, so the task projects the feedback onto the target's
/// polarity and multiplies the output by the same sign before writing it.
///
/// The polarity last energized is kept until a stop is confirmed by the
/// feedback, so an abandoned stop still guards the next reversal.
pub struct PidTask<F, S, C> {
    pid: PidController,
    feedback: F,
    sink: S,
    clock: C,
    config: LiveConfig,
    target: f32,
    energized: Direction,
}

impl<F, S, C> PidTask<F, S, C>
where
    F: FeedbackSource,
    S: ControlSink,
    C: Clock,
{
    /// Creates a stopped task.
    pub fn new(feedback: F, sink: S, clock: C, config: LiveConfig) -> Self {
        let pid = PidController::from_config(&config.load().pid);
        Self {
            pid,
            feedback,
            sink,
            clock,
            config,
            target: 0.0,
            energized: Direction::Stopped,
        }
    }

    /// Signed target currently being held.
    pub fn target(&self) -> f32 {
        self.target
    }

    /// The controller.
    pub fn controller(&self) -> &PidController {
        &self.pid
    }

    /// Polarity last driven and not yet confirmed stopped.
    pub fn energized(&self) -> Direction {
        self.energized
    }

    /// True when driving `wanted` could push against motion in the other
    /// direction, either measured or still energized.
    fn opposes_motion(&mut self, wanted: Direction, deadband: f32) -> bool {
        let measured = motion(self.feedback.read(), deadband);
        [measured, self.energized]
            .iter()
            .any(|d| *d != Direction::Stopped && *d != wanted)
    }

    /// Stop-and-wait before a reversal or a stop.
    ///
    /// Returns `Ok(true)` once the feedback is within the deadband,
    /// `Ok(false)` if the wait was abandoned (timeout or channel closed), or
    /// `Err(command)` when a fresher command must be started instead.
    fn stop_and_wait<W: CommandWait<f32>>(
        &mut self,
        commands: &mut W,
        requested: f32,
    ) -> Result<bool, f32> {
        let previous = self.target;
        self.pid.clear();
        self.target = 0.0;
        self.sink.apply(0.0);

        let started = self.clock.now_ms();
        info!(from = previous, to = requested, "stopping before reversal");

        loop {
            let config = self.config.load();
            let deadband = config.pid.deadband;
            if motion(self.feedback.read(), deadband) == Direction::Stopped {
                debug!("load stopped");
                self.energized = Direction::Stopped;
                return Ok(true);
            }
            if let Some(next) = commands.wait(config.pid.period()) {
                if (next - requested).abs() >= deadband {
                    return Err(next);
                }
            }
            if commands.is_closed() {
                return Ok(false);
            }
            let waited = self.clock.now_ms().saturating_sub(started);
            if waited >= config.pid.stop_timeout_ms {
                warn!(waited_ms = waited, target = requested, "load did not stop, command abandoned");
                return Ok(false);
            }
        }
    }
}

impl<F, S, C> Actuator for PidTask<F, S, C>
where
    F: FeedbackSource,
    S: ControlSink,
    C: Clock,
{
    type Command = f32;
    type Error = core::convert::Infallible;

    fn process<W: CommandWait<f32>>(
        &mut self,
        command: f32,
        commands: &mut W,
    ) -> Result<(), Self::Error> {
        if (command - self.target).abs() < self.config.load().pid.deadband {
            return Ok(());
        }

        let mut value = command;
        'command: loop {
            let deadband = self.config.load().pid.deadband;
            let stopping = value.abs() < deadband;
            let sign = sign_non_zero(value);
            let wanted = if sign > 0.0 { Direction::Forward } else { Direction::Reverse };

            if stopping || self.opposes_motion(wanted, deadband) {
                match self.stop_and_wait(commands, value) {
                    Err(next) => {
                        value = next;
                        continue 'command;
                    }
                    Ok(false) => return Ok(()),
                    Ok(true) if stopping => return Ok(()),
                    Ok(true) => {}
                }
            }

            self.target = value;
            self.energized = wanted;
            self.pid.set_target(value.abs());
            debug!(target = value, "pid target set");

            loop {
                let config = self.config.load();
                self.pid.apply_config(&config.pid);

                let measured = sign * self.feedback.read();
                let output = self.pid.calc(measured, self.clock.now_ms());
                self.sink.apply(sign * output);

                if let Some(next) = commands.wait(config.pid.period()) {
                    if (next - self.target).abs() >= config.pid.deadband {
                        value = next;
                        continue 'command;
                    }
                }
                if commands.is_closed() {
                    self.safe_stop()?;
                    return Ok(());
                }
            }
        }
    }

    fn safe_stop(&mut self) -> Result<(), Self::Error> {
        self.sink.apply(0.0);
        self.pid.clear();
        self.target = 0.0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControlConfig;
    use crate::hal::mock::{MockClock, MockFeedback, MockSink, ScriptedCommands};

    #[test]
    fn proportional_output_is_clamped() {
        let mut pid = PidController::new(1.0, 0.0, 0.0, 0.0, 5.0);
        pid.set_target(10.0);
        assert_eq!(pid.calc(0.0, 0), 5.0);
    }

    #[test]
    fn output_stays_within_bounds() {
        let mut pid = PidController::new(4.0, 2.0, 1.0, -50.0, 50.0);
        pid.set_target(100.0);
        for (t, m) in [(0, 0.0), (100, 5.0), (200, -30.0), (300, 400.0), (400, 0.0)] {
            let out = pid.calc(m, t);
            assert!((-50.0..=50.0).contains(&out), "{out} out of bounds");
            assert!((-50.0..=50.0).contains(&pid.integral()));
        }
    }

    #[test]
    fn derivative_acts_on_measurement_not_target() {
        let mut pid = PidController::new(0.0, 0.0, 1.0, -1000.0, 1000.0);
        pid.set_target(0.0);
        pid.calc(10.0, 0);

        // Target jump with constant measurement: no derivative kick.
        pid.set_target(500.0);
        assert_eq!(pid.calc(10.0, 100), 0.0);

        // Measurement rises by 5 over 0.1 s: derivative = -5 / 0.1.
        assert_eq!(pid.calc(15.0, 200), -50.0);
    }

    #[test]
    fn first_sample_skips_integral() {
        let mut pid = PidController::new(0.0, 10.0, 0.0, -100.0, 100.0);
        pid.set_target(1.0);
        assert_eq!(pid.calc(0.0, 1000), 0.0);
        assert_eq!(pid.integral(), 0.0);

        // error 1 * ki 10 * dt 0.5
        assert_eq!(pid.calc(0.0, 1500), 5.0);
    }

    #[test]
    fn zero_dt_skips_integral_and_derivative() {
        let mut pid = PidController::new(1.0, 10.0, 10.0, -100.0, 100.0);
        pid.set_target(3.0);
        pid.calc(0.0, 10);
        assert_eq!(pid.calc(1.0, 10), 2.0);
        assert_eq!(pid.integral(), 0.0);
    }

    #[test]
    fn clear_resets_history() {
        let mut pid = PidController::new(0.0, 1.0, 0.0, -10.0, 10.0);
        pid.set_target(5.0);
        pid.calc(0.0, 0);
        pid.calc(0.0, 1000);
        assert!(pid.integral() > 0.0);

        pid.clear();
        assert_eq!(pid.integral(), 0.0);
        assert_eq!(pid.calc(0.0, 5000), 0.0);
    }

    #[test]
    fn swapped_bounds_are_ordered() {
        let mut pid = PidController::new(1.0, 0.0, 0.0, 5.0, -5.0);
        pid.set_target(100.0);
        assert_eq!(pid.calc(0.0, 0), 5.0);
    }

    fn task_config() -> LiveConfig {
        LiveConfig::new(ControlConfig::default().with_pid(
            PidConfig::default()
                .with_gains(1.0, 0.0, 0.0)
                .with_output_limits(0.0, 100.0)
                .with_deadband(1.0)
                .with_period_ms(100),
        ))
    }

    #[test]
    fn command_within_deadband_of_target_is_ignored() {
        let clock = MockClock::new();
        let sink = MockSink::new();
        let mut task = PidTask::new(MockFeedback::new(0.0), sink.clone(), clock.clone(), task_config());
        let mut commands = ScriptedCommands::new(clock);

        task.process(0.5, &mut commands).unwrap();
        assert!(sink.values().is_empty());
        assert_eq!(commands.wait_count(), 0);
    }

    #[test]
    fn forward_target_drives_positive_output() {
        let clock = MockClock::new();
        let sink = MockSink::new();
        let mut task = PidTask::new(MockFeedback::new(10.0), sink.clone(), clock.clone(), task_config());
        let mut commands = ScriptedCommands::new(clock).open_until(1000);

        task.process(30.0, &mut commands).unwrap();

        let values = sink.values();
        assert!(values.len() >= 10);
        // error 20 * kp 1
        assert!(values[..values.len() - 1].iter().all(|v| *v == 20.0));
        // Channel closed: output parked at zero.
        assert_eq!(sink.last(), Some(0.0));
        assert_eq!(task.target(), 0.0);
    }

    #[test]
    fn reverse_target_writes_negative_output() {
        let clock = MockClock::new();
        let sink = MockSink::new();
        let mut task = PidTask::new(MockFeedback::new(0.0), sink.clone(), clock.clone(), task_config());
        let mut commands = ScriptedCommands::new(clock).open_until(300);

        task.process(-40.0, &mut commands).unwrap();

        let values = sink.values();
        // A load at rest is driven in reverse straight away.
        assert!(values[..values.len() - 1].iter().all(|v| *v == -40.0));
        assert_eq!(task.energized(), Direction::Reverse);
    }

    #[test]
    fn forward_command_waits_for_reverse_motion_to_stop() {
        let clock = MockClock::new();
        let feedback = MockFeedback::new(-20.0);
        let sink = MockSink::new();
        let mut task = PidTask::new(feedback.clone(), sink.clone(), clock.clone(), task_config());
        let mut commands = ScriptedCommands::new(clock.clone()).open_until(30_000);

        task.process(50.0, &mut commands).unwrap();

        // Never energized forward against the moving load.
        assert!(sink.values().iter().all(|v| *v == 0.0));
        assert_eq!(task.target(), 0.0);
        assert_eq!(clock.now_ms(), 10_000);
    }

    #[test]
    fn redirect_during_reverse_drive_waits_for_stop() {
        let clock = MockClock::new();
        let feedback = MockFeedback::new(-20.0);
        let sink = MockSink::new();
        let mut task = PidTask::new(feedback.clone(), sink.clone(), clock.clone(), task_config());
        let mut commands = ScriptedCommands::new(clock.clone())
            .at(200, 50.0)
            .open_until(30_000);

        task.process(-50.0, &mut commands).unwrap();

        let values = sink.values();
        // Feedback projected on the reverse target: error 50 - 20.
        assert_eq!(values[0], -30.0);
        assert!(values.iter().all(|v| *v <= 0.0));
        assert_eq!(task.energized(), Direction::Reverse);
    }

    #[test]
    fn abandoned_stop_still_guards_next_reversal() {
        let clock = MockClock::new();
        let feedback = MockFeedback::new(-20.0);
        let sink = MockSink::new();
        let mut task = PidTask::new(feedback.clone(), sink.clone(), clock.clone(), task_config());

        let mut first = ScriptedCommands::new(clock.clone())
            .at(100, 50.0)
            .open_until(30_000);
        task.process(-50.0, &mut first).unwrap();
        assert_eq!(task.target(), 0.0);

        // Load coasts below the deadband only after the next command.
        let mut second = ScriptedCommands::new(clock.clone()).open_until(clock.now_ms() + 1_000);
        let before = sink.values().len();
        feedback.set(0.5);
        task.process(50.0, &mut second).unwrap();

        let values = sink.values();
        assert_eq!(values[before], 0.0);
        assert!(values[before + 1..values.len() - 1].iter().all(|v| *v > 0.0));
        assert_eq!(task.energized(), Direction::Forward);
    }

    #[test]
    fn live_gain_change_applies_next_cycle() {
        let clock = MockClock::new();
        let sink = MockSink::new();
        let config = task_config();
        let mut task = PidTask::new(MockFeedback::new(0.0), sink.clone(), clock.clone(), config.clone());

        config.update(|c| c.pid.kp = 2.0);
        let mut commands = ScriptedCommands::new(clock).open_until(200);
        task.process(10.0, &mut commands).unwrap();

        assert!(sink.values().contains(&20.0));
    }
}
