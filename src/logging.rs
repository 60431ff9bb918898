//! Logging setup and the pooled log forwarder.
//!
//! The crate logs through `tracing`. [`init`] installs a plain `fmt`
//! subscriber filtered by `RUST_LOG` (or a default directive).
//!
//! On a node, log output also has to leave the device without blocking the
//! thread that logged. [`PooledLogLayer`] copies every event into a
//! [`LogRecord`] taken from a static [`LockFreePool`] and queues the handle on
//! an enqueue-mode channel. A [`LogForwarder`] worker hands each record to its
//! [`LogWriter`]s and drops the handle, returning the slot. When the pool or
//! the queue is full the record is dropped and counted.
//!
//! ```rust,no_run
//! use rs_railnode::channel::{command_channel, ChannelMode};
//! use rs_railnode::hal::SystemClock;
//! use rs_railnode::logging::{self, ConsoleWriter, LogForwarder, LogRecord, PooledLogLayer};
//! use rs_railnode::pool::LockFreePool;
//! use rs_railnode::worker::spawn_worker;
//!
//! static LOG_POOL: LockFreePool<LogRecord, 16> = LockFreePool::new();
//!
//! let (tx, rx) = command_channel(ChannelMode::Enqueue(16));
//! let layer = PooledLogLayer::new(&LOG_POOL, tx, SystemClock::new());
//! logging::init_with_forwarding("info", layer).unwrap();
//! let _worker = spawn_worker("log", LogForwarder::new().with_writer(ConsoleWriter), rx).unwrap();
//!
//! tracing::info!(target: "node", "started");
//! ```

use std::convert::Infallible;
use std::fmt::{self, Write as _};
use std::io::Write as _;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use heapless::String as HString;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::channel::{CommandSender, CommandWait};
use crate::error::Error;
use crate::pool::{Handle, LockFreePool};
use crate::traits::Clock;
use crate::worker::Actuator;

/// Bytes kept of an event's target.
pub const LOG_TARGET_CAPACITY: usize = 32;

/// Bytes kept of an event's formatted message and fields.
pub const LOG_MESSAGE_CAPACITY: usize = 256;

fn env_filter(default_directive: &str) -> Result<EnvFilter, Error> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive))
        .map_err(|err| Error::Logging(err.to_string()))
}

/// Installs a console subscriber.
///
/// `RUST_LOG` takes precedence over `default_directive`.
pub fn init(default_directive: &str) -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(default_directive)?)
        .with_thread_names(true)
        .try_init()
        .map_err(|err| Error::Logging(err.to_string()))
}

/// Installs a console subscriber that also forwards every event through
/// `layer`.
pub fn init_with_forwarding<C, const N: usize>(
    default_directive: &str,
    layer: PooledLogLayer<C, N>,
) -> Result<(), Error>
where
    C: Clock + Send + Sync + 'static,
{
    tracing_subscriber::registry()
        .with(env_filter(default_directive)?)
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .with(layer)
        .try_init()
        .map_err(|err| Error::Logging(err.to_string()))
}

// ============================================================================
// Records
// ============================================================================

/// Severity of a forwarded record. `TRACE` events map to [`LogLevel::Debug`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// Diagnostic detail
    Debug,
    /// Normal operation
    #[default]
    Info,
    /// Something unexpected that was handled
    Warn,
    /// Something failed
    Error,
}

impl LogLevel {
    /// Upper-case level name.
    pub const fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

impl From<&Level> for LogLevel {
    fn from(level: &Level) -> Self {
        match *level {
            Level::ERROR => LogLevel::Error,
            Level::WARN => LogLevel::Warn,
            Level::INFO => LogLevel::Info,
            _ => LogLevel::Debug,
        }
    }
}

/// One log event, stored in a pool slot.
#[derive(Clone, Debug, Default)]
pub struct LogRecord {
    /// Clock time of the event in milliseconds.
    pub timestamp_ms: u64,
    /// Severity.
    pub level: LogLevel,
    /// Event target (module path unless overridden), truncated.
    pub target: HString<LOG_TARGET_CAPACITY>,
    /// Message followed by `name=value` fields, truncated.
    pub message: HString<LOG_MESSAGE_CAPACITY>,
}

/// Appends to a fixed string, silently dropping what does not fit.
struct Truncating<'a, const N: usize>(&'a mut HString<N>);

impl<const N: usize> fmt::Write for Truncating<'_, N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for c in s.chars() {
            if self.0.push(c).is_err() {
                break;
            }
        }
        Ok(())
    }
}

/// Collects the message and the other fields separately, so the record
/// reads `message name=value ...` whatever order the fields come in.
#[derive(Default)]
struct MessageVisitor {
    message: HString<LOG_MESSAGE_CAPACITY>,
    fields: HString<LOG_MESSAGE_CAPACITY>,
}

impl MessageVisitor {
    fn field(&mut self) -> Truncating<'_, LOG_MESSAGE_CAPACITY> {
        if !self.fields.is_empty() {
            let _ = self.fields.push(' ');
        }
        Truncating(&mut self.fields)
    }

    fn finish(self, out: &mut HString<LOG_MESSAGE_CAPACITY>) {
        let mut out = Truncating(out);
        let _ = out.write_str(&self.message);
        if !self.fields.is_empty() {
            if !self.message.is_empty() {
                let _ = out.write_char(' ');
            }
            let _ = out.write_str(&self.fields);
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            let _ = Truncating(&mut self.message).write_str(value);
        } else {
            let _ = write!(self.field(), "{}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(Truncating(&mut self.message), "{value:?}");
        } else {
            let _ = write!(self.field(), "{}={:?}", field.name(), value);
        }
    }
}

// ============================================================================
// Layer
// ============================================================================

/// Shared count of records that could not be forwarded.
#[derive(Clone, Debug, Default)]
pub struct DropCounter(Arc<AtomicU32>);

impl DropCounter {
    /// Records dropped so far.
    pub fn count(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }

    fn bump(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }
}

/// `tracing` layer that forwards events as pooled [`LogRecord`]s.
///
/// Never blocks and never allocates on the logging thread.
#[derive(Debug)]
pub struct PooledLogLayer<C, const N: usize> {
    pool: &'static LockFreePool<LogRecord, N>,
    sender: CommandSender<Handle<'static, LogRecord, N>>,
    clock: C,
    dropped: DropCounter,
}

impl<C: Clock, const N: usize> PooledLogLayer<C, N> {
    /// Creates a layer drawing records from `pool` and queueing them on
    /// `sender` (use an enqueue-mode channel so records are not replaced).
    pub fn new(
        pool: &'static LockFreePool<LogRecord, N>,
        sender: CommandSender<Handle<'static, LogRecord, N>>,
        clock: C,
    ) -> Self {
        Self {
            pool,
            sender,
            clock,
            dropped: DropCounter::default(),
        }
    }

    /// Counter of dropped records, still readable after the layer is
    /// installed.
    pub fn drop_counter(&self) -> DropCounter {
        self.dropped.clone()
    }
}

impl<S, C, const N: usize> Layer<S> for PooledLogLayer<C, N>
where
    S: Subscriber,
    C: Clock + 'static,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let Some(mut handle) = self.pool.acquire(1) else {
            self.dropped.bump();
            return;
        };
        let Some(record) = handle.get_mut() else {
            return;
        };

        let meta = event.metadata();
        record.timestamp_ms = self.clock.now_ms();
        record.level = LogLevel::from(meta.level());
        let _ = Truncating(&mut record.target).write_str(meta.target());
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        visitor.finish(&mut record.message);

        if !self.sender.try_send(handle) {
            self.dropped.bump();
        }
    }
}

// ============================================================================
// Forwarder
// ============================================================================

/// Destination of forwarded records (console, UDP, MQTT, ...).
pub trait LogWriter {
    /// Writes one record. Failures are the writer's concern.
    fn write(&mut self, record: &LogRecord);
}

/// Writes records to standard error.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConsoleWriter;

impl LogWriter for ConsoleWriter {
    fn write(&mut self, record: &LogRecord) {
        let _ = writeln!(
            std::io::stderr().lock(),
            "{:>10} [{}] [{}] {}",
            record.timestamp_ms,
            record.level.as_str().chars().next().unwrap_or('?'),
            record.target,
            record.message
        );
    }
}

/// Worker that passes queued records to every writer.
#[derive(Default)]
pub struct LogForwarder<const N: usize> {
    writers: Vec<Box<dyn LogWriter + Send>>,
    forwarded: u64,
}

impl<const N: usize> LogForwarder<N> {
    /// Creates a forwarder with no writers.
    pub fn new() -> Self {
        Self {
            writers: Vec::new(),
            forwarded: 0,
        }
    }

    /// Adds a writer.
    pub fn with_writer(mut self, writer: impl LogWriter + Send + 'static) -> Self {
        self.writers.push(Box::new(writer));
        self
    }

    /// Records handled so far.
    pub fn forwarded(&self) -> u64 {
        self.forwarded
    }
}

impl<const N: usize> fmt::Debug for LogForwarder<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogForwarder")
            .field("writers", &self.writers.len())
            .field("forwarded", &self.forwarded)
            .finish()
    }
}

impl<const N: usize> Actuator for LogForwarder<N> {
    type Command = Handle<'static, LogRecord, N>;
    type Error = Infallible;

    fn process<W: CommandWait<Self::Command>>(
        &mut self,
        record: Self::Command,
        _commands: &mut W,
    ) -> Result<(), Infallible> {
        for writer in &mut self.writers {
            writer.write(&record);
        }
        self.forwarded += 1;
        Ok(())
    }

    fn safe_stop(&mut self) -> Result<(), Infallible> {
        Ok(())
    }
}
