//! Simulation backends behind the `trickler_traits` capabilities.
//!
//! The rig models a powder column: commanded motor speed turns into mass
//! flow onto the scale, integrated against the shared clock. Once a drop
//! finishes and the motors sit idle, the rig plays the operator: it lifts
//! the cup (sentinel readings), dumps it, and puts it back at zero, so a
//! full charge cycle runs end to end with no one at the bench.
//!
//! Real-hardware backends (stepper UART framing, scale serial decoding)
//! live outside this repo; everything here satisfies the same traits.

use std::sync::{Arc, Mutex};
use trickler_traits::{
    Clock, GateState, HwResult, LedSink, MotorDrive, MotorId, Rgb, Scale, ServoGate,
};

/// Mass-flow model parameters for the simulated rig.
#[derive(Debug, Clone)]
pub struct SimParams {
    /// Units per second per rps, coarse trickler.
    pub coarse_flow: f32,
    /// Units per second per rps, fine trickler.
    pub fine_flow: f32,
    /// Scale sample period in milliseconds.
    pub sample_ms: u64,
}

impl Default for SimParams {
    fn default() -> Self {
        Self {
            coarse_flow: 1.5,
            fine_flow: 0.5,
            sample_ms: 100,
        }
    }
}

/// Idle samples on a loaded pan before the simulated operator lifts the
/// cup.
const IDLE_SAMPLES_BEFORE_REMOVAL: u32 = 12;
/// Sentinel readings emitted while the cup is off the pan.
const REMOVED_SAMPLES: u32 = 3;
const SENTINEL_READING: f32 = -2000.0;

#[derive(Debug, Clone, Copy, PartialEq)]
enum CupState {
    Resting,
    Removed(u32),
}

struct RigState {
    params: SimParams,
    mass: f32,
    tare: f32,
    speeds: [f32; 2],
    enabled: [bool; 2],
    gate: GateState,
    last_update_ms: u64,
    idle_samples: u32,
    cup: CupState,
}

impl RigState {
    fn settle(&mut self, now_ms: u64) {
        let dt_s = now_ms.saturating_sub(self.last_update_ms) as f32 / 1000.0;
        self.last_update_ms = now_ms;
        if dt_s <= 0.0 {
            return;
        }
        let mut flow = 0.0;
        if self.enabled[0] {
            flow += self.speeds[0] * self.params.coarse_flow;
        }
        if self.enabled[1] {
            flow += self.speeds[1] * self.params.fine_flow;
        }
        self.mass += flow * dt_s;
    }

    fn net_mass(&self) -> f32 {
        self.mass - self.tare
    }
}

/// Build one simulated rig; the scale and motors share the powder column.
pub fn sim_rig(
    clock: Arc<dyn Clock + Send + Sync>,
    params: SimParams,
) -> (SimScale, SimMotors, SimGate, SimLeds) {
    let state = Arc::new(Mutex::new(RigState {
        params,
        mass: 0.0,
        tare: 0.0,
        speeds: [0.0; 2],
        enabled: [false; 2],
        gate: GateState::Disabled,
        last_update_ms: clock.now_ms(),
        idle_samples: 0,
        cup: CupState::Resting,
    }));
    (
        SimScale {
            state: state.clone(),
            clock: clock.clone(),
            last: f32::NAN,
        },
        SimMotors {
            state: state.clone(),
            clock,
        },
        SimGate {
            state: state.clone(),
        },
        SimLeds { last: None },
    )
}

pub struct SimScale {
    state: Arc<Mutex<RigState>>,
    clock: Arc<dyn Clock + Send + Sync>,
    last: f32,
}

impl Scale for SimScale {
    fn current(&self) -> f32 {
        self.last
    }

    fn wait_next(&mut self, _timeout_ms: u64) -> Option<f32> {
        let mut s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        self.clock.sleep_ms(s.params.sample_ms);
        let now = self.clock.now_ms();
        s.settle(now);

        let reading = match s.cup {
            CupState::Removed(n) => {
                if n + 1 >= REMOVED_SAMPLES {
                    // Cup comes back empty: powder dumped, pan at zero.
                    s.cup = CupState::Resting;
                    s.mass = 0.0;
                    s.tare = 0.0;
                    s.idle_samples = 0;
                } else {
                    s.cup = CupState::Removed(n + 1);
                }
                SENTINEL_READING
            }
            CupState::Resting => {
                let running = s.speeds[0] > 0.0 || s.speeds[1] > 0.0;
                if !running && s.net_mass() > 0.5 {
                    s.idle_samples += 1;
                    if s.idle_samples >= IDLE_SAMPLES_BEFORE_REMOVAL {
                        s.cup = CupState::Removed(0);
                    }
                } else {
                    s.idle_samples = 0;
                }
                s.net_mass()
            }
        };
        self.last = reading;
        Some(reading)
    }

    fn force_zero(&mut self) {
        let mut s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        s.tare = s.mass;
    }
}

pub struct SimMotors {
    state: Arc<Mutex<RigState>>,
    clock: Arc<dyn Clock + Send + Sync>,
}

fn motor_index(motor: MotorId) -> usize {
    match motor {
        MotorId::Coarse => 0,
        MotorId::Fine => 1,
    }
}

impl MotorDrive for SimMotors {
    fn set_speed(&mut self, motor: MotorId, rps: f32) -> HwResult<()> {
        let mut s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        // Integrate up to now so the speed change takes effect from here.
        let now = self.clock.now_ms();
        s.settle(now);
        s.speeds[motor_index(motor)] = rps.max(0.0);
        Ok(())
    }

    fn enable(&mut self, motor: MotorId, enabled: bool) -> HwResult<()> {
        let mut s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let now = self.clock.now_ms();
        s.settle(now);
        s.enabled[motor_index(motor)] = enabled;
        if !enabled {
            s.speeds[motor_index(motor)] = 0.0;
        }
        Ok(())
    }

    fn min_speed(&self, _motor: MotorId) -> f32 {
        0.05
    }

    fn max_speed(&self, _motor: MotorId) -> f32 {
        8.0
    }
}

pub struct SimGate {
    state: Arc<Mutex<RigState>>,
}

impl SimGate {
    /// Fit a gate to the rig (the default rig has none).
    pub fn fit(&mut self) {
        let mut s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        s.gate = GateState::Close;
    }
}

impl ServoGate for SimGate {
    fn state(&self) -> GateState {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).gate
    }

    fn set_state(&mut self, state: GateState, _wait_for_completion: bool) {
        let mut s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if s.gate != GateState::Disabled {
            s.gate = state;
        }
    }
}

pub struct SimLeds {
    last: Option<(Rgb, Rgb, Rgb)>,
}

impl SimLeds {
    pub fn last(&self) -> Option<(Rgb, Rgb, Rgb)> {
        self.last
    }
}

impl LedSink for SimLeds {
    fn set_colour(&mut self, backlight: Rgb, led1: Rgb, led2: Rgb, _apply_immediately: bool) {
        self.last = Some((backlight, led1, led2));
        tracing::trace!(?led1, "sim led");
    }
}
