//! Switch machines: binary actuators with breakaway and hold power.
//!
//! Turning a switch on ramps the duty from one step up to the breakaway
//! duty, waits for the mechanism to settle, then drops to the lower hold
//! duty. The output decides the flavour:
//!
//! - unidirectional output: the release state writes zero at once, the other
//!   state runs the breakaway sequence;
//! - bidirectional output (H-bridge): every change first brakes both legs for
//!   a dead time, then runs the breakaway sequence on the leg for the
//!   requested state (`true` on the plus leg, `false` on the minus leg).
//!
//! A differing command received during any wait restarts the sequence for
//! the new state; an identical one is ignored.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::channel::CommandWait;
use crate::config::{LiveConfig, SwitchConfig};
use crate::ramp::Ramp;
use crate::status::ActuatorStatus;
use crate::traits::DriveOutput;
use crate::worker::Actuator;

/// Outcome of one wait inside a switching sequence.
enum Wait {
    Elapsed,
    Restart(bool),
}

/// Binary actuator driven by a command channel of `bool` states.
#[derive(Debug)]
pub struct SwitchActuator<O> {
    ramp: Ramp<O>,
    config: LiveConfig,
    status: Arc<ActuatorStatus>,
    state: Option<bool>,
}

impl<O: DriveOutput> SwitchActuator<O> {
    /// Wraps an output. The state is unknown until the first command, which
    /// is therefore always carried out.
    pub fn new(output: O, config: LiveConfig) -> Self {
        let status = Arc::new(ActuatorStatus::new(output.full_scale()));
        Self {
            ramp: Ramp::new(output),
            config,
            status,
            state: None,
        }
    }

    /// Last state switched to.
    pub fn state(&self) -> Option<bool> {
        self.state
    }

    /// Shared state accessors.
    pub fn status(&self) -> Arc<ActuatorStatus> {
        Arc::clone(&self.status)
    }

    /// The driven output.
    pub fn output(&self) -> &O {
        self.ramp.output()
    }

    fn publish(&self) {
        let state = self.ramp.state();
        self.status.record(state.current, state.direction);
        self.status.record_braking(state.braking);
    }

    fn set_duty(&mut self, duty: f32) -> Result<(), O::Error> {
        self.ramp.retarget(duty, 0.0);
        self.ramp.apply(duty)?;
        self.publish();
        Ok(())
    }

    fn wait<W: CommandWait<bool>>(commands: &mut W, target: bool, timeout: Duration) -> Wait {
        match commands.wait(timeout) {
            Some(next) if next != target => Wait::Restart(next),
            _ => Wait::Elapsed,
        }
    }

    /// Runs the switching sequence for `target` until it completes or a
    /// differing command interrupts it.
    fn switch_to<W: CommandWait<bool>>(
        &mut self,
        target: bool,
        config: &SwitchConfig,
        commands: &mut W,
    ) -> Result<Option<bool>, O::Error> {
        let bidirectional = self.ramp.output().is_bidirectional();

        if !bidirectional && target == config.release_state {
            self.set_duty(0.0)?;
            self.state = Some(target);
            self.status.record_on(target);
            return Ok(None);
        }

        if bidirectional {
            self.ramp.brake()?;
            self.publish();
            if let Wait::Restart(next) = Self::wait(commands, target, config.dead_time()) {
                return Ok(Some(next));
            }
        }

        let sign = if bidirectional && !target { -1.0 } else { 1.0 };
        let max = config.max_duty as f32;
        let step = config.step();

        self.set_duty(sign * step.min(max))?;
        self.ramp.retarget(sign * max, step);
        while !self.ramp.is_settled() {
            if let Wait::Restart(next) = Self::wait(commands, target, config.tick()) {
                return Ok(Some(next));
            }
            self.ramp.tick()?;
            self.publish();
        }

        self.state = Some(target);
        self.status.record_on(target);

        if let Wait::Restart(next) = Self::wait(commands, target, config.settle()) {
            return Ok(Some(next));
        }
        self.set_duty(sign * config.stabilize_duty as f32)?;
        debug!(state = target, "switch settled");
        Ok(None)
    }
}

impl<O: DriveOutput> Actuator for SwitchActuator<O> {
    type Command = bool;
    type Error = O::Error;

    fn process<W: CommandWait<bool>>(
        &mut self,
        command: bool,
        commands: &mut W,
    ) -> Result<(), Self::Error> {
        if self.state == Some(command) {
            return Ok(());
        }

        let mut target = command;
        loop {
            let config = self.config.load();
            debug!(state = target, "switching");
            match self.switch_to(target, &config.switch, commands)? {
                Some(next) => target = next,
                None => return Ok(()),
            }
        }
    }

    fn safe_stop(&mut self) -> Result<(), Self::Error> {
        self.set_duty(0.0)
    }
}
