//! Worker and timer threads that own actuators.
//!
//! Every actuator is owned by one worker thread that blocks on its command
//! channel. A command is handed to [`Actuator::process`] together with the
//! receiver, so a long ramp can wait for a fresher command at each tick.
//! When every sender is gone the worker puts the actuator in its safe state
//! and exits.
//!
//! ```rust
//! use std::time::Duration;
//! use rs_railnode::channel::{command_channel, ChannelMode, CommandWait};
//! use rs_railnode::worker::{spawn_worker, Actuator};
//!
//! struct Recorder(std::sync::mpsc::Sender<u32>);
//!
//! impl Actuator for Recorder {
//!     type Command = u32;
//!     type Error = ();
//!
//!     fn process<W: CommandWait<u32>>(&mut self, cmd: u32, _: &mut W) -> Result<(), ()> {
//!         self.0.send(cmd).map_err(drop)
//!     }
//!
//!     fn safe_stop(&mut self) -> Result<(), ()> {
//!         Ok(())
//!     }
//! }
//!
//! let (seen_tx, seen_rx) = std::sync::mpsc::channel();
//! let (tx, rx) = command_channel(ChannelMode::Enqueue(4));
//! let worker = spawn_worker("recorder", Recorder(seen_tx), rx).unwrap();
//!
//! tx.try_send(7);
//! assert_eq!(seen_rx.recv_timeout(Duration::from_secs(1)), Ok(7));
//!
//! drop(tx);
//! worker.join();
//! ```

use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::channel::{CommandReceiver, CommandWait, Timeout};
use crate::error::Error;

/// Something a worker thread drives from a command channel.
pub trait Actuator {
    /// Command type carried by the channel.
    type Command: Send;
    /// Hardware error type.
    type Error: Debug;

    /// Acts on one command.
    ///
    /// May wait on `commands` between ticks; a fresher command replaces the
    /// one in progress. Returns when the command has been carried out or
    /// abandoned.
    fn process<W: CommandWait<Self::Command>>(
        &mut self,
        command: Self::Command,
        commands: &mut W,
    ) -> Result<(), Self::Error>;

    /// Puts the output in its safe (off) state.
    fn safe_stop(&mut self) -> Result<(), Self::Error>;
}

/// Consumes `commands` until every sender is gone, then stops the actuator.
///
/// A hardware error abandons the current command and forces a safe stop; the
/// loop keeps running for later commands.
pub fn run<A: Actuator>(name: &str, actuator: &mut A, commands: &mut CommandReceiver<A::Command>) {
    while let Some(command) = commands.receive(Timeout::Forever) {
        if let Err(err) = actuator.process(command, commands) {
            warn!(worker = name, error = ?err, "output error, forcing safe stop");
            if let Err(err) = actuator.safe_stop() {
                warn!(worker = name, error = ?err, "safe stop failed");
            }
        }
        if CommandWait::is_closed(commands) {
            break;
        }
    }

    debug!(worker = name, "command channel closed");
    if let Err(err) = actuator.safe_stop() {
        warn!(worker = name, error = ?err, "safe stop failed");
    }
}

/// A running worker thread.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Thread name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true once the thread has exited.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Waits for the thread to exit (after every sender is dropped).
    pub fn join(self) {
        if self.join.join().is_err() {
            warn!(worker = %self.name, "worker panicked");
        }
    }
}

/// Starts a named thread running [`run`] for `actuator`.
pub fn spawn_worker<A>(
    name: &str,
    actuator: A,
    commands: CommandReceiver<A::Command>,
) -> Result<WorkerHandle, Error>
where
    A: Actuator + Send + 'static,
    A::Command: 'static,
{
    let thread_name = name.to_string();
    let join = thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || {
            let mut actuator = actuator;
            let mut commands = commands;
            info!(worker = %thread_name, "worker started");
            run(&thread_name, &mut actuator, &mut commands);
            info!(worker = %thread_name, "worker stopped");
        })
        .map_err(|source| Error::Spawn {
            name: name.to_string(),
            source,
        })?;

    Ok(WorkerHandle {
        name: name.to_string(),
        join,
    })
}

/// A thread calling a function at a fixed period.
///
/// Stops when [`stop`](Self::stop) is called or the handle is dropped.
#[derive(Debug)]
pub struct PeriodicTimer {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl PeriodicTimer {
    /// Starts calling `tick` every `period`.
    ///
    /// Deadlines advance by whole periods, so a late tick does not shift the
    /// ones after it.
    pub fn start<F>(name: &str, period: Duration, mut tick: F) -> Result<Self, Error>
    where
        F: FnMut() + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let period = period.max(Duration::from_micros(100));

        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut next = Instant::now() + period;
                while !stop_flag.load(Ordering::Acquire) {
                    let now = Instant::now();
                    if next > now {
                        thread::sleep(next - now);
                    }
                    tick();
                    next += period;
                }
            })
            .map_err(|source| Error::Spawn {
                name: name.to_string(),
                source,
            })?;

        Ok(Self {
            stop,
            join: Some(join),
        })
    }

    /// Stops the timer and waits for the thread to exit.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for PeriodicTimer {
    fn drop(&mut self) {
        self.stop();
    }
}
