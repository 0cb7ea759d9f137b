//! Scripted and spy implementations of the capability traits, shared by
//! the crate's tests and usable from dependent crates.

use std::sync::{Arc, Mutex};
use trickler_traits::{
    GateState, HwResult, LedSink, MotorDrive, MotorId, Rgb, Scale, ServoGate, TestClock,
};

fn idx(motor: MotorId) -> usize {
    match motor {
        MotorId::Coarse => 0,
        MotorId::Fine => 1,
    }
}

/// Scale that replays a fixed reading sequence, repeating the last value
/// once exhausted. When given a clock, each delivered sample advances it
/// by a fixed period so drop timings are deterministic.
pub struct ScriptedScale {
    readings: Vec<f32>,
    pos: usize,
    current: f32,
    clock: Option<TestClock>,
    period_ms: u64,
    tare_requests: Arc<Mutex<usize>>,
}

impl ScriptedScale {
    pub fn new(readings: impl Into<Vec<f32>>) -> Self {
        Self {
            readings: readings.into(),
            pos: 0,
            current: f32::NAN,
            clock: None,
            period_ms: 0,
            tare_requests: Arc::new(Mutex::new(0)),
        }
    }

    /// Advance `clock` by `period_ms` per delivered sample.
    pub fn with_clock(mut self, clock: TestClock, period_ms: u64) -> Self {
        self.clock = Some(clock);
        self.period_ms = period_ms;
        self
    }

    pub fn tare_counter(&self) -> Arc<Mutex<usize>> {
        self.tare_requests.clone()
    }
}

impl Scale for ScriptedScale {
    fn current(&self) -> f32 {
        self.current
    }

    fn wait_next(&mut self, _timeout_ms: u64) -> Option<f32> {
        if let Some(clock) = &self.clock {
            clock.advance(self.period_ms);
        }
        let v = if self.pos < self.readings.len() {
            let v = self.readings[self.pos];
            self.pos += 1;
            v
        } else {
            self.readings.last().copied()?
        };
        self.current = v;
        Some(v)
    }

    fn force_zero(&mut self) {
        if let Ok(mut n) = self.tare_requests.lock() {
            *n += 1;
        }
    }
}

#[derive(Default)]
struct SpyState {
    speeds: [f32; 2],
    enabled: [bool; 2],
    log: Vec<(MotorId, f32)>,
    max_seen: [f32; 2],
    both_ran: bool,
    fail_speed: bool,
}

/// Motor spy: records every speed command and watches the
/// one-motor-at-a-time invariant.
pub struct SpyMotors {
    state: Arc<Mutex<SpyState>>,
}

#[derive(Clone)]
pub struct SpyMotorsHandle {
    state: Arc<Mutex<SpyState>>,
}

impl SpyMotors {
    pub fn new() -> (Self, SpyMotorsHandle) {
        let state = Arc::new(Mutex::new(SpyState::default()));
        (
            Self {
                state: state.clone(),
            },
            SpyMotorsHandle { state },
        )
    }
}

impl SpyMotorsHandle {
    fn with<R>(&self, f: impl FnOnce(&mut SpyState) -> R) -> R {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    pub fn speed_of(&self, motor: MotorId) -> f32 {
        self.with(|s| s.speeds[idx(motor)])
    }

    pub fn max_speed_seen(&self, motor: MotorId) -> f32 {
        self.with(|s| s.max_seen[idx(motor)])
    }

    pub fn enabled_of(&self, motor: MotorId) -> bool {
        self.with(|s| s.enabled[idx(motor)])
    }

    pub fn commands(&self) -> Vec<(MotorId, f32)> {
        self.with(|s| s.log.clone())
    }

    /// True when no instant saw both motors commanded above zero.
    pub fn never_both_running(&self) -> bool {
        self.with(|s| !s.both_ran)
    }

    /// Make the next and all following `set_speed` calls fail.
    pub fn set_fail(&self, fail: bool) {
        self.with(|s| s.fail_speed = fail);
    }
}

impl MotorDrive for SpyMotors {
    fn set_speed(&mut self, motor: MotorId, rps: f32) -> HwResult<()> {
        let mut s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if s.fail_speed {
            return Err("motor driver fault".into());
        }
        s.speeds[idx(motor)] = rps;
        s.max_seen[idx(motor)] = s.max_seen[idx(motor)].max(rps);
        s.log.push((motor, rps));
        if s.speeds[0] > 0.0 && s.speeds[1] > 0.0 {
            s.both_ran = true;
        }
        Ok(())
    }

    fn enable(&mut self, motor: MotorId, enabled: bool) -> HwResult<()> {
        let mut s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        s.enabled[idx(motor)] = enabled;
        Ok(())
    }

    fn min_speed(&self, _motor: MotorId) -> f32 {
        0.1
    }

    fn max_speed(&self, _motor: MotorId) -> f32 {
        10.0
    }
}

/// Gate stub; reports the state it was constructed with.
pub struct StubGate {
    state: GateState,
    pub transitions: Vec<GateState>,
}

impl StubGate {
    pub fn disabled() -> Self {
        Self {
            state: GateState::Disabled,
            transitions: Vec::new(),
        }
    }

    pub fn closed() -> Self {
        Self {
            state: GateState::Close,
            transitions: Vec::new(),
        }
    }
}

impl ServoGate for StubGate {
    fn state(&self) -> GateState {
        self.state
    }

    fn set_state(&mut self, state: GateState, _wait_for_completion: bool) {
        if self.state != GateState::Disabled {
            self.state = state;
            self.transitions.push(state);
        }
    }
}

/// LED sink that remembers every colour command.
pub struct RecordingLeds {
    log: Arc<Mutex<Vec<(Rgb, Rgb, Rgb)>>>,
}

#[derive(Clone)]
pub struct RecordingLedsHandle {
    log: Arc<Mutex<Vec<(Rgb, Rgb, Rgb)>>>,
}

impl RecordingLeds {
    pub fn new() -> (Self, RecordingLedsHandle) {
        let log = Arc::new(Mutex::new(Vec::new()));
        (Self { log: log.clone() }, RecordingLedsHandle { log })
    }
}

impl RecordingLedsHandle {
    pub fn colours(&self) -> Vec<(Rgb, Rgb, Rgb)> {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn last(&self) -> Option<(Rgb, Rgb, Rgb)> {
        self.colours().last().copied()
    }

    /// True when `led1` was ever set to `colour`.
    pub fn saw(&self, colour: Rgb) -> bool {
        self.colours().iter().any(|(_, l1, _)| *l1 == colour)
    }
}

impl LedSink for RecordingLeds {
    fn set_colour(&mut self, backlight: Rgb, led1: Rgb, led2: Rgb, _apply_immediately: bool) {
        self.log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((backlight, led1, led2));
    }
}
