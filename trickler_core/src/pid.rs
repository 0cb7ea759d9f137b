//! PD arithmetic for the two trickler motors.
//!
//! One `PdState` is shared across the coarse and fine sub-phases of a drop
//! (the integral and previous error carry over the switchover); the gains
//! applied to it change with the active motor.

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PdGains {
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
}

impl PdGains {
    pub fn pd(kp: f32, kd: f32) -> Self {
        Self { kp, ki: 0.0, kd }
    }
}

/// Effective speed envelope for one motor: the elementwise intersection of
/// the motor's physical limits and the profile's flow limits.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeedBounds {
    pub min_rps: f32,
    pub max_rps: f32,
}

impl SpeedBounds {
    pub fn new(min_rps: f32, max_rps: f32) -> Self {
        Self { min_rps, max_rps }
    }

    /// max of the floors, min of the ceilings.
    pub fn merge(motor: SpeedBounds, profile: SpeedBounds) -> SpeedBounds {
        SpeedBounds {
            min_rps: motor.min_rps.max(profile.min_rps),
            max_rps: motor.max_rps.min(profile.max_rps),
        }
    }

    pub fn clamp(&self, rps: f32) -> f32 {
        rps.clamp(self.min_rps, self.max_rps)
    }
}

/// Derivative/integral terms produced by one controller tick.
#[derive(Debug, Clone, Copy)]
pub struct PdTerms {
    pub integral: f32,
    pub derivative: f32,
}

#[derive(Debug, Clone)]
pub struct PdState {
    pub(crate) integral: f32,
    prev_error: f32,
    prev_tick_ms: u64,
}

impl PdState {
    pub fn new(start_tick_ms: u64) -> Self {
        Self {
            integral: 0.0,
            prev_error: 0.0,
            prev_tick_ms: start_tick_ms,
        }
    }

    /// Advance the controller by one accepted sample.
    ///
    /// The integral accumulates every tick even while Ki is zero, so
    /// enabling Ki later changes behavior only through the gain. A zero or
    /// backwards dt yields a zero derivative.
    pub fn advance(&mut self, error: f32, now_ms: u64) -> PdTerms {
        let dt_ms = now_ms.saturating_sub(self.prev_tick_ms) as f32;
        self.integral += error;
        let derivative = if dt_ms > 0.0 {
            (error - self.prev_error) / dt_ms
        } else {
            0.0
        };
        self.prev_tick_ms = now_ms;
        self.prev_error = error;
        PdTerms {
            integral: self.integral,
            derivative,
        }
    }

    /// Speed command for the active motor from the current terms.
    pub fn command(gains: &PdGains, error: f32, terms: PdTerms, bounds: &SpeedBounds) -> f32 {
        let raw = gains.kp * error + gains.ki * terms.integral + gains.kd * terms.derivative;
        bounds.clamp(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_dt_gives_zero_derivative() {
        let mut pd = PdState::new(100);
        let t = pd.advance(2.0, 100);
        assert_eq!(t.derivative, 0.0);
        assert_eq!(t.integral, 2.0);
    }

    #[test]
    fn derivative_uses_elapsed_ms() {
        let mut pd = PdState::new(0);
        pd.advance(1.0, 100);
        let t = pd.advance(3.0, 300);
        assert!((t.derivative - 0.01).abs() < 1e-6); // (3-1)/200
    }

    #[test]
    fn integral_accumulates_every_tick() {
        let mut pd = PdState::new(0);
        pd.advance(1.0, 100);
        pd.advance(2.0, 200);
        let t = pd.advance(3.0, 300);
        assert!((t.integral - 6.0).abs() < 1e-6);
    }

    #[test]
    fn command_is_clamped_to_bounds() {
        let bounds = SpeedBounds::new(0.5, 3.0);
        let gains = PdGains::pd(10.0, 0.0);
        let terms = PdTerms {
            integral: 0.0,
            derivative: 0.0,
        };
        assert_eq!(PdState::command(&gains, 100.0, terms, &bounds), 3.0);
        assert_eq!(PdState::command(&gains, 0.0, terms, &bounds), 0.5);
    }

    #[test]
    fn merge_takes_tighter_envelope() {
        let m = SpeedBounds::new(0.1, 10.0);
        let p = SpeedBounds::new(0.3, 4.0);
        let merged = SpeedBounds::merge(m, p);
        assert_eq!(merged, SpeedBounds::new(0.3, 4.0));
    }
}
