//! The per-sample actuator loop for one drop.
//!
//! Exactly one motor is commanded to a non-zero speed in any iteration;
//! the other is explicitly zeroed first. The stop comparisons are strict:
//! the phase ends as soon as the measured weight is within the threshold
//! of the target (or past it).

use crate::error::ControlError;
use crate::pid::{PdGains, PdState, SpeedBounds};
use crate::tuning::MotorMode;
use trickler_traits::{MotorDrive, MotorId};

#[derive(Debug, Clone)]
pub struct DispenseParams {
    pub target: f32,
    pub coarse_stop: f32,
    pub fine_stop: f32,
    pub coarse_gains: PdGains,
    pub fine_gains: PdGains,
    pub coarse_bounds: SpeedBounds,
    pub fine_bounds: SpeedBounds,
    pub mode: MotorMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepDecision {
    Continue,
    Finished,
}

pub struct DispenseLoop {
    params: DispenseParams,
    pub(crate) pd: PdState,
    coarse_active: bool,
    start_ms: u64,
    coarse_end_ms: Option<u64>,
}

impl DispenseLoop {
    /// PD state (integral included) resets here, at the start of every
    /// dispense.
    pub fn new(params: DispenseParams, now_ms: u64) -> Self {
        Self {
            params,
            pd: PdState::new(now_ms),
            coarse_active: true,
            start_ms: now_ms,
            coarse_end_ms: None,
        }
    }

    pub fn start_ms(&self) -> u64 {
        self.start_ms
    }

    fn set_speed(
        motors: &mut impl MotorDrive,
        motor: MotorId,
        rps: f32,
    ) -> Result<(), ControlError> {
        motors
            .set_speed(motor, rps)
            .map_err(|e| ControlError::Hardware(e.to_string()))
    }

    fn stop_both(motors: &mut impl MotorDrive) -> Result<(), ControlError> {
        Self::set_speed(motors, MotorId::Fine, 0.0)?;
        Self::set_speed(motors, MotorId::Coarse, 0.0)
    }

    /// One iteration for one accepted sample.
    pub fn step(
        &mut self,
        motors: &mut impl MotorDrive,
        weight: f32,
        now_ms: u64,
    ) -> Result<StepDecision, ControlError> {
        let p = &self.params;
        let error = p.target - weight;

        // Stop check happens before the PD bookkeeping: the terminating
        // sample does not enter the integral.
        let stop = match p.mode {
            MotorMode::CoarseOnly => error < p.coarse_stop,
            MotorMode::Normal | MotorMode::FineOnly => error < p.fine_stop,
        };
        if stop {
            Self::stop_both(motors)?;
            return Ok(StepDecision::Finished);
        }

        let terms = self.pd.advance(error, now_ms);

        match p.mode {
            MotorMode::CoarseOnly => {
                Self::set_speed(motors, MotorId::Fine, 0.0)?;
                let rps = PdState::command(&p.coarse_gains, error, terms, &p.coarse_bounds);
                Self::set_speed(motors, MotorId::Coarse, rps)?;
            }
            MotorMode::FineOnly => {
                Self::set_speed(motors, MotorId::Coarse, 0.0)?;
                let rps = PdState::command(&p.fine_gains, error, terms, &p.fine_bounds);
                Self::set_speed(motors, MotorId::Fine, rps)?;
            }
            MotorMode::Normal => {
                if self.coarse_active {
                    Self::set_speed(motors, MotorId::Fine, 0.0)?;
                    if error < p.coarse_stop {
                        // Hand over to the fine trickler; remember the tick
                        // so the drop time can be apportioned.
                        self.coarse_active = false;
                        Self::set_speed(motors, MotorId::Coarse, 0.0)?;
                        self.coarse_end_ms = Some(now_ms);
                        tracing::debug!(weight, "coarse phase done");
                    } else {
                        let rps =
                            PdState::command(&p.coarse_gains, error, terms, &p.coarse_bounds);
                        Self::set_speed(motors, MotorId::Coarse, rps)?;
                    }
                } else {
                    Self::set_speed(motors, MotorId::Coarse, 0.0)?;
                    let rps = PdState::command(&p.fine_gains, error, terms, &p.fine_bounds);
                    Self::set_speed(motors, MotorId::Fine, rps)?;
                }
            }
        }

        Ok(StepDecision::Continue)
    }

    /// Apportion the elapsed drop time between the coarse and fine
    /// sub-phases, given the tick at which the drop finished.
    pub fn timings(&self, end_ms: u64) -> (f32, f32) {
        let total = end_ms.saturating_sub(self.start_ms) as f32;
        match self.params.mode {
            MotorMode::CoarseOnly => (total, 0.0),
            MotorMode::FineOnly => (0.0, total),
            MotorMode::Normal => match self.coarse_end_ms {
                Some(ce) => (
                    ce.saturating_sub(self.start_ms) as f32,
                    end_ms.saturating_sub(ce) as f32,
                ),
                None => (total, 0.0),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::SpyMotors;

    fn params(mode: MotorMode) -> DispenseParams {
        DispenseParams {
            target: 10.0,
            coarse_stop: 1.0,
            fine_stop: 0.05,
            coarse_gains: PdGains::pd(0.5, 0.0),
            fine_gains: PdGains::pd(2.0, 0.0),
            coarse_bounds: SpeedBounds::new(0.2, 5.0),
            fine_bounds: SpeedBounds::new(0.05, 2.0),
            mode,
        }
    }

    #[test]
    fn integral_resets_per_dispense() {
        let (mut motors, _handle) = SpyMotors::new();
        let mut lp = DispenseLoop::new(params(MotorMode::Normal), 0);
        lp.step(&mut motors, 1.0, 100).unwrap();
        lp.step(&mut motors, 2.0, 200).unwrap();
        assert!(lp.pd.integral > 0.0);
        let lp2 = DispenseLoop::new(params(MotorMode::Normal), 200);
        assert_eq!(lp2.pd.integral, 0.0);
    }

    #[test]
    fn normal_mode_switches_to_fine_and_records_tick() {
        let (mut motors, handle) = SpyMotors::new();
        let mut lp = DispenseLoop::new(params(MotorMode::Normal), 0);
        assert_eq!(lp.step(&mut motors, 5.0, 200).unwrap(), StepDecision::Continue);
        // error = 0.8 < coarse_stop: switchover iteration.
        assert_eq!(lp.step(&mut motors, 9.2, 400).unwrap(), StepDecision::Continue);
        // fine phase now commands the fine motor.
        assert_eq!(lp.step(&mut motors, 9.5, 600).unwrap(), StepDecision::Continue);
        assert!(handle.speed_of(MotorId::Fine) > 0.0);
        assert_eq!(handle.speed_of(MotorId::Coarse), 0.0);
        // finish: error = 0.04 < fine_stop
        assert_eq!(lp.step(&mut motors, 9.96, 800).unwrap(), StepDecision::Finished);
        let (coarse_ms, fine_ms) = lp.timings(800);
        assert_eq!(coarse_ms, 400.0);
        assert_eq!(fine_ms, 400.0);
    }

    #[test]
    fn coarse_only_never_moves_fine() {
        let (mut motors, handle) = SpyMotors::new();
        let mut lp = DispenseLoop::new(params(MotorMode::CoarseOnly), 0);
        lp.step(&mut motors, 2.0, 200).unwrap();
        lp.step(&mut motors, 6.0, 400).unwrap();
        assert_eq!(lp.step(&mut motors, 9.5, 600).unwrap(), StepDecision::Finished);
        assert!(handle.max_speed_seen(MotorId::Fine) == 0.0);
        assert!(handle.max_speed_seen(MotorId::Coarse) > 0.0);
    }

    #[test]
    fn one_motor_at_a_time() {
        let (mut motors, handle) = SpyMotors::new();
        let mut lp = DispenseLoop::new(params(MotorMode::Normal), 0);
        let weights = [1.0, 4.0, 8.0, 9.3, 9.5, 9.7, 9.96];
        let mut t = 0;
        for w in weights {
            t += 200;
            if lp.step(&mut motors, w, t).unwrap() == StepDecision::Finished {
                break;
            }
        }
        assert!(handle.never_both_running());
    }
}
