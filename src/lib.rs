//! # rs-railnode
//!
//! Actuator control core for model railway nodes: locomotive controllers,
//! turnout motors and other small loads driven by PWM.
//!
//! ## Features
//!
//! - **Latest-value-wins command channels**: producers never block, the
//!   actuator only ever sees the freshest setpoint
//! - **Ramped outputs**: one ramp engine for single PWM channels, H-bridges
//!   and on/off loads, with safe reversal sequencing
//! - **Switch machines**: breakaway ramp, settle pause and hold power, with
//!   a braked dead time before each polarity on bidirectional machines
//! - **Timer-driven ramp**: constant-time travel with braking at zero
//!   crossings and an emergency stop
//! - **PID speed loop**: stop-and-wait before every reversal
//! - **Lock-free buffer pool**: reference-counted slots for log records and
//!   status packets, safe to fill from threads that must not block
//!
//! ## Architecture
//!
//! - `traits` - Hardware capabilities ([`PwmDriver`], [`Clock`], [`DriveOutput`])
//! - `output` - Single PWM, H-bridge and level outputs
//! - `channel` - Command channels between producers and workers
//! - `worker` - Threads that own actuators, periodic timers
//! - `ramp`, `switch`, `timed`, `pid` - Control engines
//! - `pool`, `packet`, `status`, `logging` - Pooled reporting
//! - `config` - Live configuration
//! - `hal` - System clock and mock implementations for testing
//!
//! ## Example
//!
//! ```rust
//! use rs_railnode::{
//!     channel::{command_channel, ChannelMode},
//!     hal::MockPwm,
//!     output::HBridge,
//!     ramp::RampActuator,
//!     worker::spawn_worker,
//!     LiveConfig,
//! };
//!
//! let pwm = MockPwm::new();
//! let motor = RampActuator::new(HBridge::new(pwm.clone(), 4, 5, 1023).unwrap(), LiveConfig::default());
//! let status = motor.status();
//!
//! let (tx, rx) = command_channel(ChannelMode::Overwrite);
//! let commander = motor.commander(tx);
//! let worker = spawn_worker("motor", motor, rx).unwrap();
//!
//! commander.set_power(-40.0);
//! drop(commander);
//! worker.join();
//!
//! // The worker leaves the output stopped once every sender is gone.
//! assert_eq!(status.current_value(), 0.0);
//! assert_eq!(pwm.conflicts(), 0);
//! ```

#![warn(missing_docs)]

/// Single-consumer command channels.
pub mod channel;
/// Node configuration and the live snapshot.
pub mod config;
/// Crate error type.
pub mod error;
/// Hardware abstraction layer with mock implementations for testing.
pub mod hal;
/// `tracing` setup and pooled log forwarding.
pub mod logging;
/// Duty outputs on top of a PWM driver.
pub mod output;
/// Fixed-capacity packet buffers.
pub mod packet;
/// PID controller and its scheduling task.
pub mod pid;
/// Lock-free object pool with reference-counted handles.
pub mod pool;
/// Ramp engine and the continuous ramp actuator.
pub mod ramp;
/// Actuator state accessors and status reporting.
pub mod status;
/// Switch machines with breakaway and hold power.
pub mod switch;
/// Timer-driven ramp with braking.
pub mod timed;
/// Core traits for hardware abstraction.
pub mod traits;
/// Worker and timer threads.
pub mod worker;

// Re-exports for convenience
pub use channel::{command_channel, ChannelMode, CommandReceiver, CommandSender, CommandWait, Timeout};
pub use config::{
    ControlConfig, DeviceConfig, LiveConfig, MotorConfig, PidConfig, RampConfig, SwitchConfig,
    TimedConfig,
};
pub use error::{Error, Result};
pub use output::{HBridge, LevelOutput, PwmChannel};
pub use pid::{PidController, PidTask};
pub use pool::{Handle, LockFreePool};
pub use ramp::{Ramp, RampActuator, RampCommander};
pub use status::{ActuatorStatus, StatusReporter};
pub use switch::SwitchActuator;
pub use timed::TimedRamp;
pub use traits::{
    Clock, ControlSink, Direction, DriveOutput, FeedbackSource, Level, Pin, PwmDriver,
};
pub use worker::{spawn_worker, Actuator, PeriodicTimer, WorkerHandle};
