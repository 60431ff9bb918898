//! End-to-end scenarios for the actuator engines

use std::time::{Duration, Instant};

use rs_railnode::{
    channel::{command_channel, ChannelMode},
    config::{ControlConfig, LiveConfig, PidConfig, RampConfig, SwitchConfig},
    hal::{MockClock, MockFeedback, MockPacketSink, MockPwm, MockSink, ScriptedCommands},
    output::{HBridge, PwmChannel},
    packet::PacketBuffer,
    pid::PidTask,
    pool::LockFreePool,
    ramp::RampActuator,
    status::{PacketSender, StatusReporter, HEARTBEAT_PERIOD_MS, STATUS_PACKET_TYPE},
    switch::SwitchActuator,
    traits::{Clock, Direction},
    worker::{spawn_worker, Actuator},
};

fn fast_ramp() -> LiveConfig {
    LiveConfig::new(ControlConfig::default().with_ramp(
        RampConfig::default()
            .with_smooth_ms(100)
            .with_smooth_steps(10),
    ))
}

fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    false
}

// ============================================================================
// Ramp
// ============================================================================

#[test]
fn ramp_full_scale_in_exact_ticks() {
    let pwm = MockPwm::new();
    let mut motor = RampActuator::new(PwmChannel::new(pwm.clone(), 2, 1000).unwrap(), fast_ramp());
    let clock = MockClock::new();
    let mut commands = ScriptedCommands::new(clock.clone()).open_until(1_000);

    motor.process(1000.0, &mut commands).unwrap();

    let writes = pwm.duty_writes(2);
    assert_eq!(writes.len() - 1, 10);
    assert_eq!(writes.last(), Some(&1000));
    for pair in writes.windows(2) {
        assert!(pair[1] - pair[0] <= 100);
    }
}

#[test]
fn ramp_reversal_under_rapid_commands_keeps_legs_apart() {
    let pwm = MockPwm::new();
    let mut motor = RampActuator::new(HBridge::new(pwm.clone(), 4, 5, 1000).unwrap(), fast_ramp());
    let clock = MockClock::new();
    let mut commands = ScriptedCommands::new(clock)
        .at(15, -1000.0)
        .at(35, 700.0)
        .at(55, -300.0)
        .at(65, 1000.0)
        .open_until(1_000);

    motor.process(1000.0, &mut commands).unwrap();

    assert_eq!(pwm.conflicts(), 0);
    assert_eq!(motor.status().current_value(), 1000.0);
    assert_eq!(motor.status().direction(), Direction::Forward);
    assert_eq!(commands.remaining(), 0);
}

#[test]
fn signal_lamp_fades_on_inverted_channel() {
    let pwm = MockPwm::new();
    let config = LiveConfig::new(ControlConfig::default().with_ramp(
        RampConfig::default().with_smooth_ms(250).with_smooth_steps(10),
    ));
    let lamp = PwmChannel::inverted(pwm.clone(), 7, 255).unwrap();
    let mut lamp = RampActuator::new(lamp, config);
    let clock = MockClock::new();
    let mut commands = ScriptedCommands::new(clock.clone()).open_until(10_000);

    lamp.process(255.0, &mut commands).unwrap();
    let brighten = pwm.duty_writes(7);
    assert_eq!(brighten.first(), Some(&255), "attached dark");
    assert_eq!(brighten.last(), Some(&0));
    assert_eq!(brighten.len() - 1, 10);
    for pair in brighten.windows(2) {
        assert!(pair[1] < pair[0] && pair[0] - pair[1] <= 26);
    }
    assert_eq!(clock.now_ms(), 225);

    lamp.process(0.0, &mut commands).unwrap();
    let writes = pwm.duty_writes(7);
    let dim = &writes[brighten.len() - 1..];
    assert_eq!(dim.last(), Some(&255));
    assert_eq!(dim.len() - 1, 10);
    for pair in dim.windows(2) {
        assert!(pair[1] > pair[0] && pair[1] - pair[0] <= 26);
    }
    assert_eq!(lamp.status().current_value(), 0.0);
}

#[test]
fn ramp_worker_stops_output_when_senders_drop() {
    let pwm = MockPwm::new();
    let motor = RampActuator::new(HBridge::new(pwm.clone(), 4, 5, 1000).unwrap(), fast_ramp());
    let status = motor.status();
    let (tx, rx) = command_channel(ChannelMode::Overwrite);
    let commander = motor.commander(tx);
    let worker = spawn_worker("motor", motor, rx).unwrap();

    assert!(commander.set_power(60.0));
    assert!(wait_until(|| status.current_value() == 600.0));
    assert_eq!(status.power_fraction(), 0.6);

    drop(commander);
    worker.join();
    assert_eq!(status.current_value(), 0.0);
    assert_eq!(pwm.pin(4).duty, 0);
    assert_eq!(pwm.conflicts(), 0);
}

// ============================================================================
// Switch
// ============================================================================

#[test]
fn switch_worker_turns_on_and_releases() {
    let config = LiveConfig::new(ControlConfig::default().with_switch(
        SwitchConfig::default()
            .with_timing(20, 2)
            .with_duties(1000, 250),
    ));
    let pwm = MockPwm::new();
    let switch = SwitchActuator::new(PwmChannel::new(pwm.clone(), 9, 1023).unwrap(), config);
    let status = switch.status();
    let (tx, rx) = command_channel(ChannelMode::Overwrite);
    let worker = spawn_worker("switch", switch, rx).unwrap();

    assert!(tx.try_send(true));
    assert!(wait_until(|| pwm.pin(9).duty == 250));
    assert!(status.is_on());
    assert!(pwm.duty_writes(9).contains(&1000));

    assert!(tx.try_send(false));
    assert!(wait_until(|| !status.is_on()));
    assert_eq!(pwm.pin(9).duty, 0);

    drop(tx);
    worker.join();
}

// ============================================================================
// PID
// ============================================================================

#[test]
fn pid_reversal_waits_and_abandons_when_load_keeps_moving() {
    let clock = MockClock::new();
    let feedback = MockFeedback::new(20.0);
    let sink = MockSink::new();
    let mut task = PidTask::new(feedback, sink.clone(), clock.clone(), LiveConfig::default());
    let mut commands = ScriptedCommands::new(clock.clone())
        .at(1_000, -50.0)
        .open_until(30_000);

    task.process(50.0, &mut commands).unwrap();

    let values = sink.values();
    let first_zero = values.iter().position(|v| *v == 0.0).unwrap();
    assert!(values[..first_zero].iter().all(|v| *v == 30.0));
    assert!(values[first_zero..].iter().all(|v| *v == 0.0));
    assert!(values.iter().all(|v| *v >= 0.0));
    assert_eq!(clock.now_ms(), 11_000);
    assert_eq!(task.target(), 0.0);
}

#[test]
fn pid_reversal_engages_after_load_stops() {
    let clock = MockClock::new();
    let view = clock.clone();
    let feedback = move || -> f32 { if view.now_ms() < 1_500 { 20.0 } else { 0.0 } };
    let sink = MockSink::new();
    let mut task = PidTask::new(feedback, sink.clone(), clock.clone(), LiveConfig::default());
    let mut commands = ScriptedCommands::new(clock.clone())
        .at(1_000, -50.0)
        .open_until(3_000);

    task.process(50.0, &mut commands).unwrap();

    let values = sink.values();
    let first_negative = values.iter().position(|v| *v < 0.0).unwrap();
    let last_positive = values.iter().rposition(|v| *v > 0.0).unwrap();
    assert!(last_positive < first_negative);
    assert!(values[last_positive + 1..first_negative].iter().all(|v| *v == 0.0));
    assert_eq!(values[first_negative], -50.0);
    // Channel closed at 3 s: output left at zero.
    assert_eq!(values.last(), Some(&0.0));
    assert!(clock.now_ms() >= 3_000);
}

#[test]
fn pid_ignores_commands_within_deadband() {
    let clock = MockClock::new();
    let config = LiveConfig::new(ControlConfig::default().with_pid(PidConfig::default().with_deadband(2.0)));
    let sink = MockSink::new();
    let mut task = PidTask::new(MockFeedback::new(0.0), sink.clone(), clock.clone(), config);
    let mut commands = ScriptedCommands::new(clock.clone())
        .at(100, 11.0)
        .at(200, 9.5)
        .open_until(500);

    task.process(10.0, &mut commands).unwrap();

    let values = sink.values();
    assert!(values.len() > 2);
    let (last, held) = values.split_last().unwrap();
    assert!(held.iter().all(|v| *v == 10.0));
    // Channel closed: output left at zero.
    assert_eq!(*last, 0.0);
}

// ============================================================================
// Status
// ============================================================================

#[test]
fn status_reports_changes_and_heartbeats() {
    let pool: LockFreePool<PacketBuffer, 2> = LockFreePool::new();
    let pwm = MockPwm::new();
    let mut motor = RampActuator::new(HBridge::new(pwm, 4, 5, 1000).unwrap(), fast_ramp());
    let clock = MockClock::new();
    let mut reporter = StatusReporter::new(&pool, clock.clone()).with_motor(motor.status());
    let sink = MockPacketSink::new();
    let mut sender = PacketSender::new(sink.clone());
    let mut idle = ScriptedCommands::new(MockClock::new());

    let first = reporter.poll().unwrap();
    assert_eq!(first.as_bytes()[0], STATUS_PACKET_TYPE);
    sender.process(first, &mut idle).unwrap();

    clock.advance(200);
    assert!(reporter.poll().is_none());

    let mut commands = ScriptedCommands::new(MockClock::new()).open_until(1_000);
    motor.process(-500.0, &mut commands).unwrap();
    clock.advance(200);
    let changed = reporter.poll().unwrap();
    sender.process(changed, &mut idle).unwrap();

    clock.advance(HEARTBEAT_PERIOD_MS);
    let heartbeat = reporter.poll().unwrap();
    sender.process(heartbeat, &mut idle).unwrap();

    let packets = sink.packets();
    assert_eq!(packets.len(), 3);
    let versions: Vec<u32> = packets
        .iter()
        .map(|p| u32::from_le_bytes([p[9], p[10], p[11], p[12]]))
        .collect();
    assert_eq!(versions, vec![1, 2, 3]);
    assert_eq!(sender.sent(), 3);
    assert_eq!(pool.in_use(), 0);
}
