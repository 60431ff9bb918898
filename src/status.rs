//! Actuator state accessors and the periodic status reporter.
//!
//! Every actuator publishes its state into a shared [`ActuatorStatus`]
//! (plain atomics, readable from any thread). [`StatusReporter`] polls those
//! accessors, and when something changed, or the heartbeat period passed,
//! encodes a status packet into a pooled [`PacketBuffer`]. The handle goes to
//! a [`PacketSender`] worker, which writes it to a [`PacketSink`] and drops
//! it, returning the slot to the pool.
//!
//! # Packet layout (little-endian)
//!
//! | Field | Type | Notes |
//! |-------|------|-------|
//! | packet type | `u8` | [`STATUS_PACKET_TYPE`] |
//! | uptime | `u64` | milliseconds |
//! | version | `u32` | incremented per packet |
//! | flags | `u8` | bit 0 motor present, bit 1 switch present, bit 2 device name present |
//! | motor power | `i32` | signed power fraction x 1000 |
//! | motor direction | `i8` | `-1`, `0`, `1` |
//! | switch state | `u8` | `0` / `1` |
//! | device name | `u8` length + UTF-8 | |
//!
//! Absent parts are skipped, not zero-filled.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicI8, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::channel::{CommandSender, CommandWait};
use crate::config::{DeviceConfig, ShortString};
use crate::error::Error;
use crate::packet::PacketBuffer;
use crate::pool::{Handle, LockFreePool};
use crate::traits::{Clock, Direction};
use crate::worker::{Actuator, PeriodicTimer};

/// Status loop period; also the shortest gap between two packets.
pub const MIN_SEND_PERIOD_MS: u64 = 200;

/// A packet is sent at least this often even when nothing changed.
pub const HEARTBEAT_PERIOD_MS: u64 = 5000;

/// First byte of a status packet.
pub const STATUS_PACKET_TYPE: u8 = 0x01;

const FLAG_MOTOR: u8 = 0b01;
const FLAG_SWITCH: u8 = 0b10;
const FLAG_DEVICE: u8 = 0b100;

// ============================================================================
// Accessors
// ============================================================================

/// Live state of one actuator.
///
/// Written by the owning worker, read by anyone.
#[derive(Debug)]
pub struct ActuatorStatus {
    current: AtomicU32,
    target: AtomicU32,
    full_scale: AtomicU32,
    direction: AtomicI8,
    on: AtomicBool,
    braking: AtomicBool,
}

impl ActuatorStatus {
    /// Creates a stopped status for an output of the given full scale.
    pub fn new(full_scale: i32) -> Self {
        Self {
            current: AtomicU32::new(0f32.to_bits()),
            target: AtomicU32::new(0f32.to_bits()),
            full_scale: AtomicU32::new((full_scale.max(1) as f32).to_bits()),
            direction: AtomicI8::new(0),
            on: AtomicBool::new(false),
            braking: AtomicBool::new(false),
        }
    }

    pub(crate) fn record(&self, current: f32, direction: Direction) {
        self.current.store(current.to_bits(), Ordering::Release);
        self.direction.store(direction.sign(), Ordering::Release);
    }

    pub(crate) fn record_target(&self, target: f32) {
        self.target.store(target.to_bits(), Ordering::Release);
    }

    pub(crate) fn record_on(&self, on: bool) {
        self.on.store(on, Ordering::Release);
    }

    pub(crate) fn record_braking(&self, braking: bool) {
        self.braking.store(braking, Ordering::Release);
    }

    /// Value currently applied to the output.
    pub fn current_value(&self) -> f32 {
        f32::from_bits(self.current.load(Ordering::Acquire))
    }

    /// Value the actuator is moving towards.
    pub fn target_value(&self) -> f32 {
        f32::from_bits(self.target.load(Ordering::Acquire))
    }

    /// Polarity of the applied value.
    pub fn direction(&self) -> Direction {
        Direction::from_i8(self.direction.load(Ordering::Acquire))
    }

    /// Largest output magnitude.
    pub fn full_scale(&self) -> f32 {
        f32::from_bits(self.full_scale.load(Ordering::Acquire))
    }

    /// Signed fraction of full scale, rounded to three decimals.
    pub fn power_fraction(&self) -> f32 {
        (self.current_value() / self.full_scale() * 1000.0).round() / 1000.0
    }

    /// Switch state (last completed command).
    pub fn is_on(&self) -> bool {
        self.on.load(Ordering::Acquire)
    }

    /// Returns true while the output holds its brake.
    pub fn is_braking(&self) -> bool {
        self.braking.load(Ordering::Acquire)
    }
}

// ============================================================================
// Snapshot
// ============================================================================

/// Motor part of a status snapshot.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MotorSnapshot {
    /// Signed power fraction.
    pub power: f32,
    /// Polarity.
    pub direction: Direction,
}

/// One status report.
#[derive(Clone, Debug, PartialEq)]
pub struct StatusSnapshot {
    /// Packet counter.
    pub version: u32,
    /// Milliseconds since start.
    pub uptime_ms: u64,
    /// Motor state, if a motor is reported.
    pub motor: Option<MotorSnapshot>,
    /// Switch state, if a switch is reported.
    pub switch: Option<bool>,
    /// Name of the reporting node.
    pub device: Option<ShortString>,
}

impl StatusSnapshot {
    /// Returns true if the reported actuator state differs.
    pub fn state_differs(&self, other: &StatusSnapshot) -> bool {
        self.motor != other.motor || self.switch != other.switch
    }

    /// Encodes the snapshot as a status packet.
    pub fn encode(&self, packet: &mut PacketBuffer) -> Result<(), Error> {
        packet.clear();
        let flags = self.motor.map_or(0, |_| FLAG_MOTOR)
            | self.switch.map_or(0, |_| FLAG_SWITCH)
            | self.device.as_ref().map_or(0, |_| FLAG_DEVICE);

        let mut w = packet.writer();
        w.u8(STATUS_PACKET_TYPE)?
            .u64(self.uptime_ms)?
            .u32(self.version)?
            .u8(flags)?;
        if let Some(motor) = self.motor {
            w.i32((motor.power * 1000.0).round() as i32)?
                .i8(motor.direction.sign())?;
        }
        if let Some(on) = self.switch {
            w.u8(u8::from(on))?;
        }
        if let Some(name) = &self.device {
            w.short_str(name)?;
        }
        Ok(())
    }
}

// ============================================================================
// Reporter
// ============================================================================

/// Builds status packets from actuator accessors.
#[derive(Debug)]
pub struct StatusReporter<'p, C, const N: usize> {
    pool: &'p LockFreePool<PacketBuffer, N>,
    clock: C,
    motor: Option<Arc<ActuatorStatus>>,
    switch: Option<Arc<ActuatorStatus>>,
    device: Option<ShortString>,
    last: Option<StatusSnapshot>,
    last_sent_ms: u64,
    version: u32,
    dropped: u32,
}

impl<'p, C: Clock, const N: usize> StatusReporter<'p, C, N> {
    /// Creates a reporter drawing buffers from `pool`.
    pub fn new(pool: &'p LockFreePool<PacketBuffer, N>, clock: C) -> Self {
        Self {
            pool,
            clock,
            motor: None,
            switch: None,
            device: None,
            last: None,
            last_sent_ms: 0,
            version: 0,
            dropped: 0,
        }
    }

    /// Reports a motor.
    pub fn with_motor(mut self, status: Arc<ActuatorStatus>) -> Self {
        self.motor = Some(status);
        self
    }

    /// Reports a switch.
    pub fn with_switch(mut self, status: Arc<ActuatorStatus>) -> Self {
        self.switch = Some(status);
        self
    }

    /// Names the node in every packet.
    pub fn with_device(mut self, device: &DeviceConfig) -> Self {
        self.device = Some(device.name.clone());
        self
    }

    /// Reports that could not be built because the pool was exhausted.
    pub fn dropped(&self) -> u32 {
        self.dropped
    }

    /// Current state, stamped with the next version.
    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            version: self.version.wrapping_add(1),
            uptime_ms: self.clock.now_ms(),
            motor: self.motor.as_ref().map(|m| MotorSnapshot {
                power: m.power_fraction(),
                direction: m.direction(),
            }),
            switch: self.switch.as_ref().map(|s| s.is_on()),
            device: self.device.clone(),
        }
    }

    /// Returns an encoded packet when the state changed or the heartbeat
    /// is due; `None` otherwise or when no buffer is free.
    pub fn poll(&mut self) -> Option<Handle<'p, PacketBuffer, N>> {
        let snapshot = self.snapshot();
        let heartbeat_due = snapshot.uptime_ms.saturating_sub(self.last_sent_ms) >= HEARTBEAT_PERIOD_MS;
        let changed = self.last.as_ref().map_or(true, |last| last.state_differs(&snapshot));
        if !changed && !heartbeat_due {
            return None;
        }

        let Some(mut packet) = self.pool.acquire(1) else {
            self.dropped += 1;
            debug!(dropped = self.dropped, "status pool exhausted, report dropped");
            return None;
        };
        let buffer = packet.get_mut()?;
        if let Err(err) = snapshot.encode(buffer) {
            self.dropped += 1;
            debug!(error = %err, "status report does not fit");
            return None;
        }

        self.version = snapshot.version;
        self.last_sent_ms = snapshot.uptime_ms;
        self.last = Some(snapshot);
        Some(packet)
    }
}

impl<C, const N: usize> StatusReporter<'static, C, N>
where
    C: Clock + Send + 'static,
{
    /// Polls every [`MIN_SEND_PERIOD_MS`] on a timer thread and queues
    /// packets on `sender`.
    pub fn start(
        mut self,
        sender: CommandSender<Handle<'static, PacketBuffer, N>>,
    ) -> Result<PeriodicTimer, Error> {
        PeriodicTimer::start(
            "status",
            Duration::from_millis(MIN_SEND_PERIOD_MS),
            move || {
                if let Some(packet) = self.poll() {
                    if !sender.try_send(packet) {
                        debug!("status queue full, report dropped");
                    }
                }
            },
        )
    }
}

// ============================================================================
// Sender
// ============================================================================

/// Transport for encoded packets (UDP socket, serial link, ...).
pub trait PacketSink {
    /// Error type for the transport.
    type Error: core::fmt::Debug;

    /// Sends one packet.
    fn send(&mut self, packet: &[u8]) -> Result<(), Self::Error>;
}

/// Worker that writes queued packets to a [`PacketSink`].
#[derive(Debug)]
pub struct PacketSender<'p, S, const N: usize> {
    sink: S,
    sent: u64,
    _pool: PhantomData<&'p LockFreePool<PacketBuffer, N>>,
}

impl<S: PacketSink, const N: usize> PacketSender<'_, S, N> {
    /// Wraps a transport.
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            sent: 0,
            _pool: PhantomData,
        }
    }

    /// Packets written so far.
    pub fn sent(&self) -> u64 {
        self.sent
    }
}

impl<'p, S: PacketSink, const N: usize> Actuator for PacketSender<'p, S, N> {
    type Command = Handle<'p, PacketBuffer, N>;
    type Error = S::Error;

    fn process<W: CommandWait<Self::Command>>(
        &mut self,
        packet: Self::Command,
        _commands: &mut W,
    ) -> Result<(), Self::Error> {
        self.sink.send(packet.as_bytes())?;
        self.sent += 1;
        Ok(())
    }

    fn safe_stop(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}
