use crossbeam_channel::unbounded;
use std::sync::{Arc, Mutex};
use trickler_config::{ChargeSettings, HistoryStore, LearningHistory, StoreError};
use trickler_core::mocks::{RecordingLeds, ScriptedScale, SpyMotors, StubGate};
use trickler_core::{
    AbortReason, ChargeClass, ChargeController, ChargePhase, CycleOutcome, ErrorCode,
};
use trickler_traits::{Clock, InputEvent, MotorId, Rgb, TestClock};

/// History store whose contents stay observable from the test.
#[derive(Clone, Default)]
struct SharedHistory(Arc<Mutex<LearningHistory>>);

impl SharedHistory {
    fn get(&self) -> LearningHistory {
        self.0.lock().unwrap().clone()
    }
}

impl HistoryStore for SharedHistory {
    fn load(&mut self) -> LearningHistory {
        self.0.lock().unwrap().clone()
    }
    fn save(&mut self, history: &LearningHistory) -> Result<(), StoreError> {
        *self.0.lock().unwrap() = history.clone();
        Ok(())
    }
}

fn settings() -> ChargeSettings {
    ChargeSettings {
        coarse_stop: 0.5,
        fine_stop: 0.03,
        ..ChargeSettings::default()
    }
}

/// Zero wait (10 stable samples), a dispense trajectory, then the
/// removal/return tail: two pan-removed sentinels, five stable zeros for
/// the removal window, one non-negative reading for the return wait.
fn full_cycle_readings(dispense: &[f32]) -> Vec<f32> {
    let mut v = vec![0.0; 10];
    v.extend_from_slice(dispense);
    v.extend_from_slice(&[-2000.0, -2000.0]);
    v.extend_from_slice(&[0.0; 5]);
    v.push(0.0);
    v
}

/// Seed scenario: 20.00 target at 2 dp, coarse handover at ~8.8 s, finish
/// at 19.98 after ~1 s of fine trickling.
#[test]
fn normal_drop_two_decimal_places() {
    let clock = TestClock::new();
    let mut dispense: Vec<f32> = (1..=43).map(|i| 0.45 * i as f32).collect();
    dispense.extend_from_slice(&[19.6, 19.7, 19.8, 19.9, 19.95, 19.98]);
    let scale =
        ScriptedScale::new(full_cycle_readings(&dispense)).with_clock(clock.clone(), 200);
    let (motors, motor_handle) = SpyMotors::new();
    let (leds, led_handle) = RecordingLeds::new();
    let history = SharedHistory::default();

    let mut controller = ChargeController::builder()
        .with_scale(scale)
        .with_motors(motors)
        .with_leds(leds)
        .with_history(history.clone())
        .with_clock(Arc::new(clock.clone()))
        .with_settings(settings())
        .with_target(20.0)
        .build()
        .expect("build controller");

    let report = controller.run_cycle().expect("cycle");

    assert_eq!(report.outcome, CycleOutcome::Completed);
    assert_eq!(
        report.phases,
        vec![
            ChargePhase::WaitForZero,
            ChargePhase::Dispense,
            ChargePhase::WaitForCupRemoval,
            ChargePhase::WaitForCupReturn,
            ChargePhase::WaitForZero,
        ]
    );

    let t = report.telemetry.expect("telemetry");
    assert!(
        (8500.0..=9500.0).contains(&t.coarse_time_ms),
        "coarse {}",
        t.coarse_time_ms
    );
    assert!(
        (700.0..=1800.0).contains(&t.fine_time_ms),
        "fine {}",
        t.fine_time_ms
    );
    assert!((t.final_mass - 19.98).abs() < 1e-3);
    assert_eq!(report.classification, Some(ChargeClass::Normal));
    assert!(led_handle.saw(Rgb::GREEN));
    assert!(motor_handle.never_both_running());

    // The learning history was written before the state machine advanced.
    let h = history.get();
    assert_eq!(h.count(), 1);
    let rec = h.iter().next().expect("record");
    assert!((rec.overthrow + 0.02).abs() < 1e-3);
}

/// Seed scenario: measured settles at 20.06, classified over-charge.
#[test]
fn overthrow_is_classified_and_reported() {
    let clock = TestClock::new();
    let dispense = [5.0, 10.0, 15.0, 19.0, 19.6, 19.9, 20.06];
    let scale =
        ScriptedScale::new(full_cycle_readings(&dispense)).with_clock(clock.clone(), 200);
    let (motors, _mh) = SpyMotors::new();
    let (leds, led_handle) = RecordingLeds::new();

    let mut controller = ChargeController::builder()
        .with_scale(scale)
        .with_motors(motors)
        .with_leds(leds)
        .with_clock(Arc::new(clock.clone()))
        .with_settings(settings())
        .with_target(20.0)
        .build()
        .expect("build controller");

    let report = controller.run_cycle().expect("cycle");

    assert_eq!(report.outcome, CycleOutcome::Completed);
    assert_eq!(report.classification, Some(ChargeClass::Over));
    assert!(led_handle.saw(Rgb::RED));
    let t = report.telemetry.expect("telemetry");
    assert!((t.overthrow - 0.06).abs() < 1e-3);
    assert!((t.overthrow_fraction - 0.003).abs() < 1e-4);
}

#[test]
fn reset_press_aborts_from_the_zero_wait() {
    let clock = TestClock::new();
    let scale = ScriptedScale::new(vec![0.0; 50]).with_clock(clock.clone(), 200);
    let (motors, _mh) = SpyMotors::new();
    let (tx, rx) = unbounded();
    tx.send(InputEvent::ResetPress).unwrap();

    let mut controller = ChargeController::builder()
        .with_scale(scale)
        .with_motors(motors)
        .with_inputs(rx)
        .with_clock(Arc::new(clock.clone()))
        .with_settings(settings())
        .with_target(10.0)
        .build()
        .expect("build controller");

    let report = controller.run_cycle().expect("cycle");
    assert_eq!(
        report.outcome,
        CycleOutcome::Aborted(AbortReason::UserAbort)
    );
    assert!(report.telemetry.is_none());
    assert_eq!(report.phases.last(), Some(&ChargePhase::Exit));
}

#[test]
fn encoder_press_requests_a_tare_during_zero_wait() {
    let clock = TestClock::new();
    let scale = ScriptedScale::new(full_cycle_readings(&[9.0, 9.99])).with_clock(clock.clone(), 200);
    let tare_counter = scale.tare_counter();
    let (motors, _mh) = SpyMotors::new();
    let (tx, rx) = unbounded();
    tx.send(InputEvent::EncoderPress).unwrap();

    let mut controller = ChargeController::builder()
        .with_scale(scale)
        .with_motors(motors)
        .with_inputs(rx)
        .with_clock(Arc::new(clock.clone()))
        .with_settings(settings())
        .with_target(10.0)
        .build()
        .expect("build controller");

    let report = controller.run_cycle().expect("cycle");
    assert_eq!(report.outcome, CycleOutcome::Completed);
    assert_eq!(*tare_counter.lock().unwrap(), 1);
}

#[test]
fn motor_failure_aborts_the_drop() {
    let clock = TestClock::new();
    let scale = ScriptedScale::new(full_cycle_readings(&[1.0, 2.0, 3.0])).with_clock(clock.clone(), 200);
    let (motors, motor_handle) = SpyMotors::new();

    let mut controller = ChargeController::builder()
        .with_scale(scale)
        .with_motors(motors)
        .with_clock(Arc::new(clock.clone()))
        .with_settings(settings())
        .with_target(10.0)
        .build()
        .expect("build controller");

    // Fail speed commands only once dispensing begins; enables still work.
    motor_handle.set_fail(true);

    let report = controller.run_cycle().expect("cycle");
    assert_eq!(
        report.outcome,
        CycleOutcome::Aborted(AbortReason::MotorFault)
    );
    assert!(controller.error_codes().contains(&ErrorCode::MotorFault));
}

#[test]
fn sentinel_readings_do_not_feed_the_zero_window() {
    let clock = TestClock::new();
    let mut readings = vec![-2000.0, -2000.0, -2000.0];
    readings.extend(full_cycle_readings(&[9.0, 9.99]));
    let scale = ScriptedScale::new(readings).with_clock(clock.clone(), 200);
    let (motors, _mh) = SpyMotors::new();

    let mut controller = ChargeController::builder()
        .with_scale(scale)
        .with_motors(motors)
        .with_clock(Arc::new(clock.clone()))
        .with_settings(settings())
        .with_target(10.0)
        .build()
        .expect("build controller");

    let report = controller.run_cycle().expect("cycle");
    assert_eq!(report.outcome, CycleOutcome::Completed);
}

#[test]
fn precharge_pulse_runs_after_the_gate_closes() {
    let clock = TestClock::new();
    let mut cfg = settings();
    cfg.precharge_enable = true;
    cfg.precharge_speed_rps = 2.0;
    cfg.precharge_time_ms = 400;

    let scale = ScriptedScale::new(full_cycle_readings(&[16.0, 19.6, 19.98]))
        .with_clock(clock.clone(), 200);
    let (motors, motor_handle) = SpyMotors::new();

    let mut controller = ChargeController::builder()
        .with_scale(scale)
        .with_motors(motors)
        .with_gate(StubGate::closed())
        .with_clock(Arc::new(clock.clone()))
        .with_settings(cfg)
        .with_target(20.0)
        .build()
        .expect("build controller");

    let report = controller.run_cycle().expect("cycle");
    assert_eq!(report.outcome, CycleOutcome::Completed);
    assert!(motor_handle
        .commands()
        .contains(&(MotorId::Coarse, 2.0)));
}

#[test]
fn tuning_drop_feeds_the_session_and_parks_the_fine_motor() {
    let clock = TestClock::new();
    let mut cfg = ChargeSettings::default(); // coarse_stop = 5.0
    cfg.fine_stop = 0.03;
    let scale = ScriptedScale::new(full_cycle_readings(&[5.0, 10.0, 15.2]))
        .with_clock(clock.clone(), 200);
    let (motors, motor_handle) = SpyMotors::new();
    let history = SharedHistory::default();

    let mut controller = ChargeController::builder()
        .with_scale(scale)
        .with_motors(motors)
        .with_history(history.clone())
        .with_clock(Arc::new(clock.clone()))
        .with_settings(cfg)
        .with_target(20.0)
        .build()
        .expect("build controller");

    controller.start_tuning();
    assert!(controller.tuner.is_active());

    let report = controller.run_cycle().expect("cycle");
    assert_eq!(report.outcome, CycleOutcome::Completed);
    assert_eq!(controller.tuner.drops_completed(), 1);
    // Phase 1 never moves the fine trickler.
    assert_eq!(motor_handle.max_speed_seen(MotorId::Fine), 0.0);
    assert_eq!(report.classification, Some(ChargeClass::Under));
    // Tuned drops feed the persistent learning history too.
    assert_eq!(history.get().count(), 1);
}

#[test]
fn set_target_rejects_nonpositive_values_without_mutation() {
    let clock = TestClock::new();
    let scale = ScriptedScale::new(vec![0.0]).with_clock(clock.clone(), 200);
    let (motors, _mh) = SpyMotors::new();
    let mut controller = ChargeController::builder()
        .with_scale(scale)
        .with_motors(motors)
        .with_clock(Arc::new(clock.clone()))
        .with_target(10.0)
        .build()
        .expect("build controller");

    assert!(controller.set_target(0.0).is_err());
    assert!(controller.set_target(f32::NAN).is_err());
    assert_eq!(controller.target(), 10.0);
    assert!(controller.set_target(25.5).is_ok());
    assert_eq!(controller.target(), 25.5);
}

#[test]
fn builder_rejects_out_of_range_profile_gains() {
    let clock: Arc<dyn Clock + Send + Sync> = Arc::new(TestClock::new());
    let scale = ScriptedScale::new(vec![0.0]);
    let (motors, _mh) = SpyMotors::new();
    let mut profile = trickler_config::Profile::default();
    profile.fine_kp = 25.0; // above the 0-10 range

    let result = ChargeController::builder()
        .with_scale(scale)
        .with_motors(motors)
        .with_clock(clock)
        .with_profile(profile, 0)
        .with_target(10.0)
        .build();
    assert!(result.is_err());
}
