//! Mock implementations for testing without hardware.
//!
//! All mocks are cheap to clone and clones share state, so a test keeps
//! one copy for assertions while the engine under test owns another.
//!
//! # Available Mocks
//!
//! | Mock | Trait | Purpose |
//! |------|-------|---------|
//! | [`MockPwm`] | [`PwmDriver`] | Records pin state and every driver call |
//! | [`MockClock`] | [`Clock`] | Controllable time source |
//! | [`MockFeedback`] | [`FeedbackSource`] | Settable measurement |
//! | [`MockSink`] | [`ControlSink`] | Records controller outputs |
//! | [`ScriptedCommands`] | [`CommandWait`] | Deterministic command arrivals |
//! | [`MockPacketSink`] | [`PacketSink`] | Captures encoded packets |
//! | [`MockLogWriter`] | [`LogWriter`] | Captures forwarded log lines |
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use rs_railnode::channel::CommandWait;
//! use rs_railnode::hal::{MockClock, ScriptedCommands};
//! use rs_railnode::traits::Clock;
//!
//! let clock = MockClock::new();
//! let mut commands = ScriptedCommands::new(clock.clone()).at(250, 42.0f32);
//!
//! assert_eq!(commands.wait(Duration::from_millis(100)), None);
//! assert_eq!(clock.now_ms(), 100);
//! assert_eq!(commands.wait(Duration::from_millis(200)), Some(42.0));
//! assert_eq!(clock.now_ms(), 250);
//! ```
//!
//! [`PwmDriver`]: crate::traits::PwmDriver
//! [`Clock`]: crate::traits::Clock
//! [`FeedbackSource`]: crate::traits::FeedbackSource
//! [`ControlSink`]: crate::traits::ControlSink
//! [`CommandWait`]: crate::channel::CommandWait
//! [`PacketSink`]: crate::status::PacketSink
//! [`LogWriter`]: crate::logging::LogWriter

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::channel::CommandWait;
use crate::logging::{LogRecord, LogWriter};
use crate::status::PacketSink;
use crate::traits::{Clock, ControlSink, FeedbackSource, Level, Pin, PwmDriver};

// ============================================================================
// PWM driver
// ============================================================================

/// Observable state of one mock pin.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PinState {
    /// Routed to a PWM channel.
    pub attached: bool,
    /// Last duty written.
    pub duty: u32,
    /// Last digital level written.
    pub level: Level,
}

impl PinState {
    /// Returns true if PWM is attached with nonzero duty.
    pub fn is_pwm_active(&self) -> bool {
        self.attached && self.duty > 0
    }

    /// Returns true if the pin is putting power on its leg.
    pub fn is_energized(&self) -> bool {
        if self.attached {
            self.duty > 0
        } else {
            self.level == Level::High
        }
    }
}

/// One recorded driver call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PwmEvent {
    /// `attach_output(pin)`
    Attach(Pin),
    /// `detach_output(pin)`
    Detach(Pin),
    /// `set_duty(pin, duty)`
    Duty(Pin, u32),
    /// `set_digital_level(pin, level)`
    Level(Pin, Level),
}

#[derive(Debug, Default)]
struct PwmState {
    pins: BTreeMap<Pin, PinState>,
    events: Vec<PwmEvent>,
    conflicts: usize,
    failing: bool,
}

impl PwmState {
    /// Counts states where a PWM leg is active while another pin is energized.
    fn check_conflict(&mut self) {
        let pwm_active = self.pins.values().any(PinState::is_pwm_active);
        let energized = self.pins.values().filter(|p| p.is_energized()).count();
        if pwm_active && energized >= 2 {
            self.conflicts += 1;
        }
    }
}

/// Mock PWM driver.
///
/// Use one instance per H-bridge when checking [`conflicts`](Self::conflicts):
/// it counts every moment a PWM leg was active while another pin was
/// energized.
#[derive(Clone, Debug, Default)]
pub struct MockPwm {
    state: Arc<Mutex<PwmState>>,
}

impl MockPwm {
    /// Creates a driver with every pin detached and low.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state of a pin.
    pub fn pin(&self, pin: Pin) -> PinState {
        self.state.lock().pins.get(&pin).copied().unwrap_or_default()
    }

    /// Every call so far, oldest first.
    pub fn events(&self) -> Vec<PwmEvent> {
        self.state.lock().events.clone()
    }

    /// Forgets recorded calls (pin state is kept).
    pub fn clear_events(&self) {
        self.state.lock().events.clear();
    }

    /// Duties written to one pin, oldest first.
    pub fn duty_writes(&self, pin: Pin) -> Vec<u32> {
        self.state
            .lock()
            .events
            .iter()
            .filter_map(|e| match *e {
                PwmEvent::Duty(p, duty) if p == pin => Some(duty),
                _ => None,
            })
            .collect()
    }

    /// Number of unsafe leg overlaps observed.
    pub fn conflicts(&self) -> usize {
        self.state.lock().conflicts
    }

    /// Makes every following call fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.state.lock().failing = failing;
    }

    fn record(&self, event: PwmEvent, update: impl FnOnce(&mut PinState)) -> Result<(), ()> {
        let mut state = self.state.lock();
        if state.failing {
            return Err(());
        }
        let pin = match event {
            PwmEvent::Attach(p) | PwmEvent::Detach(p) | PwmEvent::Duty(p, _) | PwmEvent::Level(p, _) => p,
        };
        update(state.pins.entry(pin).or_default());
        state.events.push(event);
        state.check_conflict();
        Ok(())
    }
}

impl PwmDriver for MockPwm {
    type Error = ();

    fn attach_output(&mut self, pin: Pin) -> Result<(), ()> {
        self.record(PwmEvent::Attach(pin), |p| {
            p.attached = true;
            p.duty = 0;
        })
    }

    fn detach_output(&mut self, pin: Pin) -> Result<(), ()> {
        self.record(PwmEvent::Detach(pin), |p| p.attached = false)
    }

    fn set_duty(&mut self, pin: Pin, duty: u32) -> Result<(), ()> {
        self.record(PwmEvent::Duty(pin, duty), |p| p.duty = duty)
    }

    fn set_digital_level(&mut self, pin: Pin, level: Level) -> Result<(), ()> {
        self.record(PwmEvent::Level(pin, level), |p| p.level = level)
    }
}

// ============================================================================
// Clock
// ============================================================================

/// Mock clock for deterministic timing tests.
///
/// Clones share the same time.
///
/// # Example
///
/// ```rust
/// use rs_railnode::hal::MockClock;
/// use rs_railnode::traits::Clock;
///
/// let clock = MockClock::new();
/// let view = clock.clone();
/// clock.advance(50);
/// assert_eq!(view.now_ms(), 50);
/// ```
#[derive(Clone, Debug, Default)]
pub struct MockClock {
    now: Arc<AtomicU64>,
}

impl MockClock {
    /// Creates a clock at time 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the current time.
    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }

    /// Advances time by `ms` milliseconds.
    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for MockClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

// ============================================================================
// PID feedback and output
// ============================================================================

/// Settable measurement for PID tests.
#[derive(Clone, Debug, Default)]
pub struct MockFeedback {
    value: Arc<Mutex<f32>>,
}

impl MockFeedback {
    /// Starts at `value`.
    pub fn new(value: f32) -> Self {
        Self {
            value: Arc::new(Mutex::new(value)),
        }
    }

    /// Changes the measurement.
    pub fn set(&self, value: f32) {
        *self.value.lock() = value;
    }
}

impl FeedbackSource for MockFeedback {
    fn read(&mut self) -> f32 {
        *self.value.lock()
    }
}

/// Records every value applied by a controller.
#[derive(Clone, Debug, Default)]
pub struct MockSink {
    values: Arc<Mutex<Vec<f32>>>,
}

impl MockSink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Applied values, oldest first.
    pub fn values(&self) -> Vec<f32> {
        self.values.lock().clone()
    }

    /// Most recent value.
    pub fn last(&self) -> Option<f32> {
        self.values.lock().last().copied()
    }
}

impl ControlSink for MockSink {
    fn apply(&mut self, value: f32) {
        self.values.lock().push(value);
    }
}

// ============================================================================
// Scripted command source
// ============================================================================

/// Deterministic [`CommandWait`] driven by a [`MockClock`].
///
/// Each command is scheduled at an absolute time. `wait(timeout)` returns the
/// next command if it is due before the timeout expires, moving the clock to
/// its arrival time; otherwise it moves the clock to the end of the timeout
/// and returns `None`.
///
/// The source reports closed once the script is exhausted and the clock has
/// reached [`open_until`](Self::open_until) (by default the time of the last
/// scheduled command).
#[derive(Debug)]
pub struct ScriptedCommands<T> {
    clock: MockClock,
    script: VecDeque<(u64, T)>,
    open_until: u64,
    waits: Vec<Duration>,
}

impl<T> ScriptedCommands<T> {
    /// Creates an empty script on `clock`.
    pub fn new(clock: MockClock) -> Self {
        Self {
            clock,
            script: VecDeque::new(),
            open_until: 0,
            waits: Vec::new(),
        }
    }

    /// Schedules `command` to arrive at `at_ms`.
    pub fn at(mut self, at_ms: u64, command: T) -> Self {
        let pos = self.script.partition_point(|(t, _)| *t <= at_ms);
        self.script.insert(pos, (at_ms, command));
        self.open_until = self.open_until.max(at_ms);
        self
    }

    /// Keeps the source open until `ms`, even after the last command.
    pub fn open_until(mut self, ms: u64) -> Self {
        self.open_until = self.open_until.max(ms);
        self
    }

    /// Every timeout passed to `wait`, oldest first.
    pub fn waits(&self) -> &[Duration] {
        &self.waits
    }

    /// Number of `wait` calls.
    pub fn wait_count(&self) -> usize {
        self.waits.len()
    }

    /// Commands not yet delivered.
    pub fn remaining(&self) -> usize {
        self.script.len()
    }
}

impl<T> CommandWait<T> for ScriptedCommands<T> {
    fn wait(&mut self, timeout: Duration) -> Option<T> {
        self.waits.push(timeout);
        let now = self.clock.now_ms();
        let deadline = now + timeout.as_millis() as u64;

        if matches!(self.script.front(), Some((at, _)) if *at <= deadline) {
            let (at, command) = self.script.pop_front()?;
            self.clock.set(at.max(now));
            return Some(command);
        }
        self.clock.set(deadline);
        None
    }

    fn is_closed(&self) -> bool {
        self.script.is_empty() && self.clock.now_ms() >= self.open_until
    }
}

// ============================================================================
// Packet and log sinks
// ============================================================================

/// Captures every packet sent.
#[derive(Clone, Debug, Default)]
pub struct MockPacketSink {
    packets: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl MockPacketSink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Packets received, oldest first.
    pub fn packets(&self) -> Vec<Vec<u8>> {
        self.packets.lock().clone()
    }
}

impl PacketSink for MockPacketSink {
    type Error = ();

    fn send(&mut self, packet: &[u8]) -> Result<(), ()> {
        self.packets.lock().push(packet.to_vec());
        Ok(())
    }
}

/// Captures forwarded log records as `"LEVEL target: message"` lines.
#[derive(Clone, Debug, Default)]
pub struct MockLogWriter {
    lines: Arc<Mutex<Vec<String>>>,
}

impl MockLogWriter {
    /// Creates an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Lines written, oldest first.
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }
}

impl LogWriter for MockLogWriter {
    fn write(&mut self, record: &LogRecord) {
        self.lines.lock().push(format!(
            "{} {}: {}",
            record.level.as_str(),
            record.target,
            record.message
        ));
    }
}
