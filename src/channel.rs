//! Single-consumer command channels between producers and actuator workers.
//!
//! A channel runs in one of two modes:
//!
//! | Mode | Capacity | `try_send` when full |
//! |------|----------|----------------------|
//! | [`ChannelMode::Enqueue`] | `n` | returns `false`, value dropped |
//! | [`ChannelMode::Overwrite`] | 1 | replaces the pending value |
//!
//! Overwrite mode gives "latest value wins": a worker that is busy ramping
//! only ever sees the freshest setpoint. Senders are cheap to clone and may
//! be used from any thread; the receiver is owned by exactly one worker.
//!
//! # Example
//!
//! ```rust
//! use rs_railnode::channel::{command_channel, ChannelMode, Timeout};
//!
//! let (tx, rx) = command_channel(ChannelMode::Overwrite);
//! assert!(tx.try_send(10));
//! assert!(tx.try_send(20));
//! assert!(tx.send_from_interrupt(30));
//!
//! assert_eq!(rx.receive(Timeout::Poll), Some(30));
//! assert_eq!(rx.receive(Timeout::Poll), None);
//! ```

use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};

/// Buffering behaviour of a command channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelMode {
    /// Bounded FIFO with the given capacity (at least 1).
    Enqueue(usize),
    /// Single slot; a new value replaces the pending one.
    Overwrite,
}

/// How long [`CommandReceiver::receive`] may block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Timeout {
    /// Return immediately.
    Poll,
    /// Block for at most this long.
    After(Duration),
    /// Block until a value arrives or every sender is gone.
    Forever,
}

impl From<Duration> for Timeout {
    fn from(duration: Duration) -> Self {
        if duration.is_zero() {
            Timeout::Poll
        } else {
            Timeout::After(duration)
        }
    }
}

/// Creates a channel in the given mode.
pub fn command_channel<T>(mode: ChannelMode) -> (CommandSender<T>, CommandReceiver<T>) {
    let capacity = match mode {
        ChannelMode::Enqueue(n) => n.max(1),
        ChannelMode::Overwrite => 1,
    };
    let (tx, rx) = bounded(capacity);
    let alive = Arc::new(());
    let sender = CommandSender {
        drain: matches!(mode, ChannelMode::Overwrite).then(|| rx.clone()),
        tx,
        mode,
        _alive: Arc::clone(&alive),
    };
    let receiver = CommandReceiver {
        rx,
        senders: Arc::downgrade(&alive),
    };
    (sender, receiver)
}

/// Producer side. Clone freely; every clone feeds the same consumer.
#[derive(Debug)]
pub struct CommandSender<T> {
    tx: Sender<T>,
    /// Present in overwrite mode: used to evict the stale pending value.
    drain: Option<Receiver<T>>,
    mode: ChannelMode,
    _alive: Arc<()>,
}

impl<T> Clone for CommandSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            drain: self.drain.clone(),
            mode: self.mode,
            _alive: Arc::clone(&self._alive),
        }
    }
}

impl<T> CommandSender<T> {
    /// Non-blocking send.
    ///
    /// Enqueue mode returns `false` when the queue is full. Overwrite mode
    /// evicts the pending value and always succeeds.
    pub fn try_send(&self, value: T) -> bool {
        let Some(drain) = &self.drain else {
            return self.tx.try_send(value).is_ok();
        };

        let mut value = value;
        loop {
            match self.tx.try_send(value) {
                Ok(()) => return true,
                Err(TrySendError::Full(back)) => {
                    let _ = drain.try_recv();
                    value = back;
                }
                Err(TrySendError::Disconnected(_)) => return false,
            }
        }
    }

    /// Send from a context that must never block.
    ///
    /// Same contract as [`try_send`](Self::try_send); it never waits for
    /// queue space or for the consumer.
    #[inline]
    pub fn send_from_interrupt(&self, value: T) -> bool {
        self.try_send(value)
    }

    /// Mode this channel was created with.
    pub fn mode(&self) -> ChannelMode {
        self.mode
    }
}

/// Consumer side. Not cloneable: exactly one worker owns it.
#[derive(Debug)]
pub struct CommandReceiver<T> {
    rx: Receiver<T>,
    senders: Weak<()>,
}

impl<T> CommandReceiver<T> {
    /// Waits up to `timeout` for the next value.
    ///
    /// When every sender is gone and nothing is pending, a bounded wait still
    /// lasts its full duration so control loops keep their pacing.
    pub fn receive(&self, timeout: impl Into<Timeout>) -> Option<T> {
        match timeout.into() {
            Timeout::Poll => self.rx.try_recv().ok(),
            Timeout::After(duration) => match self.rx.recv_timeout(duration) {
                Ok(value) => Some(value),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => {
                    thread::sleep(duration);
                    None
                }
            },
            Timeout::Forever => self.rx.recv().ok(),
        }
    }

    /// Returns true once every sender is dropped and nothing is pending.
    pub fn is_closed(&self) -> bool {
        self.senders.strong_count() == 0 && self.rx.is_empty()
    }

    /// Number of values waiting.
    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

/// A source a control loop can wait on for a fresher command.
///
/// Implemented by [`CommandReceiver`]; tests drive the loops with
/// [`ScriptedCommands`](crate::hal::mock::ScriptedCommands) instead.
pub trait CommandWait<T> {
    /// Waits up to `timeout` for a new command.
    fn wait(&mut self, timeout: Duration) -> Option<T>;

    /// Returns true when no further commands can arrive.
    fn is_closed(&self) -> bool {
        false
    }
}

impl<T> CommandWait<T> for CommandReceiver<T> {
    fn wait(&mut self, timeout: Duration) -> Option<T> {
        self.receive(timeout)
    }

    fn is_closed(&self) -> bool {
        CommandReceiver::is_closed(self)
    }
}
