//! Simulated railway node running every engine on mock hardware.
//!
//! A locomotive on an H-bridge ramps through a short schedule, a turnout
//! motor throws back and forth, a common-anode signal lamp fades with the
//! turnout, and a timer-driven ramp runs a second track section. Status packets and forwarded log records go to in-memory
//! sinks that stand in for the network uplink.
//!
//! # Usage
//!
//! ```sh
//! cargo run --example sim_node
//! RUST_LOG=rs_railnode=debug cargo run --example sim_node
//! ```

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rs_railnode::{
    channel::{command_channel, ChannelMode},
    config::{ControlConfig, DeviceConfig, LiveConfig, RampConfig, SwitchConfig, TimedConfig},
    hal::{MockPacketSink, MockPwm, SystemClock},
    logging::{self, LogForwarder, LogRecord, LogWriter, PooledLogLayer},
    output::{HBridge, PwmChannel},
    packet::PacketBuffer,
    pool::LockFreePool,
    ramp::RampActuator,
    status::{PacketSender, StatusReporter},
    switch::SwitchActuator,
    timed::TimedRamp,
    worker::spawn_worker,
};
use tracing::info;

static LOG_POOL: LockFreePool<LogRecord, 16> = LockFreePool::new();
static STATUS_POOL: LockFreePool<PacketBuffer, 4> = LockFreePool::new();

/// Serializes records the way a datagram uplink would see them.
struct UplinkWriter(Arc<parking_lot::Mutex<Vec<String>>>);

impl LogWriter for UplinkWriter {
    fn write(&mut self, record: &LogRecord) {
        self.0.lock().push(format!(
            "{}|{}|{}|{}",
            record.timestamp_ms,
            record.level.as_str(),
            record.target,
            record.message
        ));
    }
}

fn mock_failure(what: &'static str) -> impl FnOnce(()) -> anyhow::Error {
    move |()| anyhow!("mock driver rejected {what}")
}

fn main() -> Result<()> {
    let clock = SystemClock::new();

    // Logging: console plus pooled forwarding to the uplink.
    let (log_tx, log_rx) = command_channel(ChannelMode::Enqueue(16));
    let layer = PooledLogLayer::new(&LOG_POOL, log_tx, clock);
    let log_drops = layer.drop_counter();
    logging::init_with_forwarding("info,rs_railnode=info", layer).context("installing logger")?;

    let uplink = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let forwarder = LogForwarder::<16>::new().with_writer(UplinkWriter(Arc::clone(&uplink)));
    let log_worker = spawn_worker("log", forwarder, log_rx)?;

    let config = LiveConfig::new(
        ControlConfig::default()
            .with_device(DeviceConfig::default().with_name("sim-node"))
            .with_ramp(RampConfig::default().with_smooth_ms(400).with_smooth_steps(20))
            .with_switch(SwitchConfig::default().with_timing(200, 10).with_duties(1023, 300))
            .with_timed(TimedConfig::default().with_full_travel_ms(500).with_tick_us(5_000)),
    );

    // Locomotive
    let loco_pwm = MockPwm::new();
    let bridge = HBridge::new(loco_pwm.clone(), 4, 5, 1023).map_err(mock_failure("loco pins"))?;
    let loco = RampActuator::new(bridge, config.clone());
    let loco_status = loco.status();
    let (loco_tx, loco_rx) = command_channel(ChannelMode::Overwrite);
    let throttle = loco.commander(loco_tx);
    let loco_worker = spawn_worker("loco", loco, loco_rx)?;

    // Turnout
    let turnout_pwm = MockPwm::new();
    let coil = PwmChannel::new(turnout_pwm.clone(), 9, 1023).map_err(mock_failure("turnout pin"))?;
    let turnout = SwitchActuator::new(coil, config.clone());
    let turnout_status = turnout.status();
    let (turnout_tx, turnout_rx) = command_channel(ChannelMode::Overwrite);
    let turnout_worker = spawn_worker("turnout", turnout, turnout_rx)?;

    // Signal lamp, active low, shares the ramp settings
    let lamp_pwm = MockPwm::new();
    let lamp_pin = PwmChannel::inverted(lamp_pwm.clone(), 14, 255).map_err(mock_failure("lamp pin"))?;
    let lamp = RampActuator::new(lamp_pin, config.clone());
    let lamp_status = lamp.status();
    let (lamp_tx, lamp_rx) = command_channel(ChannelMode::Overwrite);
    let signal = lamp.commander(lamp_tx);
    let lamp_worker = spawn_worker("lamp", lamp, lamp_rx)?;

    // Second section on a timer-driven ramp
    let section_pwm = MockPwm::new();
    let section_bridge =
        HBridge::new(section_pwm.clone(), 12, 13, 1023).map_err(mock_failure("section pins"))?;
    let section = Arc::new(TimedRamp::new(section_bridge, config.clone()));
    let mut section_timer = section.start_timer()?;

    // Status uplink
    let packets = MockPacketSink::new();
    let (status_tx, status_rx) = command_channel(ChannelMode::Enqueue(4));
    let status_worker = spawn_worker("uplink", PacketSender::new(packets.clone()), status_rx)?;
    let mut status_timer = StatusReporter::new(&STATUS_POOL, clock)
        .with_motor(Arc::clone(&loco_status))
        .with_switch(Arc::clone(&turnout_status))
        .with_device(&config.load().device)
        .start(status_tx)?;
    info!(device = %config.load().device.name, "node up");

    let schedule: [(f32, bool, i32); 5] = [
        (40.0, true, 600),
        (75.0, true, 900),
        (-30.0, false, -400),
        (-60.0, true, 0),
        (0.0, false, 300),
    ];
    for (power, thrown, section_duty) in schedule {
        info!(power, thrown, section_duty, "schedule step");
        throttle.set_power(power);
        turnout_tx.try_send(thrown);
        signal.set_power(if thrown { 100.0 } else { 0.0 });
        section.set_value(section_duty);
        thread::sleep(Duration::from_millis(700));
        info!(
            loco = loco_status.current_value(),
            turnout = turnout_status.is_on(),
            lamp = lamp_status.current_value(),
            section = section.current_value(),
            "step settled"
        );
    }

    section.set_emergency_stop(true).map_err(mock_failure("emergency stop"))?;
    info!(stopped = section.is_emergency_stopped(), "section emergency stop");

    drop(throttle);
    drop(turnout_tx);
    drop(signal);
    loco_worker.join();
    turnout_worker.join();
    lamp_worker.join();
    section_timer.stop();
    status_timer.stop();
    status_worker.join();

    info!(
        packets = packets.packets().len(),
        loco_conflicts = loco_pwm.conflicts(),
        section_conflicts = section_pwm.conflicts(),
        turnout_writes = turnout_pwm.duty_writes(9).len(),
        lamp_writes = lamp_pwm.duty_writes(14).len(),
        "node shut down"
    );

    // The global subscriber keeps its sender; give the forwarder time to
    // drain instead of waiting for a close that never comes.
    thread::sleep(Duration::from_millis(50));
    println!("forwarded {} log records, {} dropped", uplink.lock().len(), log_drops.count());
    drop(log_worker);
    Ok(())
}
