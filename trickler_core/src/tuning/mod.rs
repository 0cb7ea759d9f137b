//! Hybrid PID auto-tuner: adaptive step-halving to bracket viable gains,
//! then Gaussian-process / UCB refinement, one motor range at a time.
//!
//! Phase 1 tunes the coarse trickler with the fine motor off; phase 2
//! pre-fills with the tuned coarse gains and tunes the fine trickler.
//! Every phase ends with exactly [`GP_REFINE_DROPS`] GP-proposed drops,
//! after which the best observed point becomes the recommendation.

pub mod gp;

pub use gp::{GpModel, GP_MAX_POINTS};

use crate::DropTelemetry;
use trickler_config::{ChargeSettings, GainSet, Profile, COARSE_GAIN_MAX, FINE_GAIN_MAX};

/// Which motor(s) the dispense loop may run, as dictated by the tuner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotorMode {
    /// Coarse then fine, the normal drop.
    Normal,
    /// Phase 1: only the coarse trickler runs.
    CoarseOnly,
    /// Phase 2: pre-fill to the coarse threshold, then only fine runs.
    FineOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunerState {
    Idle,
    Phase1Coarse,
    Phase2Fine,
    Complete,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AxisPhase {
    AdaptiveKp,
    AdaptiveKd,
    GpRefine,
}

/// Performance gates loaded from the charge settings at session start.
#[derive(Debug, Clone, Copy)]
pub struct TuneTargets {
    pub max_overthrow_fraction: f32,
    pub coarse_time_target_ms: f32,
    pub total_time_target_ms: f32,
}

/// Coarse axes move in 2% steps of their 0-1 range at minimum.
pub const COARSE_MIN_STEP: f32 = 0.02;
/// Fine axes move in 2% steps of their 0-10 range at minimum.
pub const FINE_MIN_STEP: f32 = 0.2;
/// GP-proposed drops per phase before the recommendation is locked.
pub const GP_REFINE_DROPS: u8 = 5;
/// Session-wide drop budget; exceeding it ends the session in `Error`.
pub const MAX_DROPS: usize = 30;

const COARSE_KP_STEP0: f32 = 0.2;
const COARSE_KD_STEP0: f32 = 0.1;
const FINE_KP_STEP0: f32 = 2.0;
const FINE_KD_STEP0: f32 = 1.0;

pub struct TuningSession {
    state: TunerState,
    targets: TuneTargets,
    coarse_stop: f32,
    profile_idx: u8,

    gp_coarse: GpModel,
    gp_fine: GpModel,

    coarse_axis: AxisPhase,
    fine_axis: AxisPhase,
    gp_refine_drops: u8,

    // Best-so-far point per axis; also the next point to try while the
    // adaptive substeps run.
    coarse_kp: f32,
    coarse_kd: f32,
    fine_kp: f32,
    fine_kd: f32,

    coarse_kp_step: f32,
    fine_kp_step: f32,
    coarse_kd_step: f32,
    fine_kd_step: f32,

    recommended: GainSet,
    drops: Vec<DropTelemetry>,
    error_message: Option<String>,

    avg_overthrow: f32,
    avg_total_time_ms: f32,
}

impl Default for TuningSession {
    fn default() -> Self {
        Self::new()
    }
}

impl TuningSession {
    pub fn new() -> Self {
        Self {
            state: TunerState::Idle,
            targets: TuneTargets {
                max_overthrow_fraction: 1.0 / 15.0,
                coarse_time_target_ms: 10_000.0,
                total_time_target_ms: 15_000.0,
            },
            coarse_stop: 5.0,
            profile_idx: 0,
            gp_coarse: GpModel::new(0.0, COARSE_GAIN_MAX, 0.0, COARSE_GAIN_MAX),
            gp_fine: GpModel::new(0.0, FINE_GAIN_MAX, 0.0, FINE_GAIN_MAX),
            coarse_axis: AxisPhase::AdaptiveKp,
            fine_axis: AxisPhase::AdaptiveKp,
            gp_refine_drops: 0,
            coarse_kp: 0.0,
            coarse_kd: 0.0,
            fine_kp: 0.0,
            fine_kd: 0.0,
            coarse_kp_step: COARSE_KP_STEP0,
            coarse_kd_step: COARSE_KD_STEP0,
            fine_kp_step: FINE_KP_STEP0,
            fine_kd_step: FINE_KD_STEP0,
            recommended: GainSet::default(),
            drops: Vec::with_capacity(MAX_DROPS),
            error_message: None,
            avg_overthrow: 0.0,
            avg_total_time_ms: 0.0,
        }
    }

    /// Begin a session for `profile_idx`. `seed` is the learning-history
    /// suggestion quadruple when at least three historical drops exist;
    /// the session starts at 70% of it, otherwise from zero.
    pub fn start(&mut self, profile_idx: u8, seed: Option<GainSet>, settings: &ChargeSettings) {
        *self = Self::new();
        self.state = TunerState::Phase1Coarse;
        self.profile_idx = profile_idx;
        self.coarse_stop = settings.coarse_stop;
        self.targets = TuneTargets {
            max_overthrow_fraction: settings.max_overthrow_fraction,
            coarse_time_target_ms: settings.coarse_time_target_ms as f32,
            total_time_target_ms: settings.total_time_target_ms as f32,
        };
        if let Some(s) = seed {
            self.coarse_kp = (s.coarse_kp * 0.7).clamp(0.0, COARSE_GAIN_MAX);
            self.coarse_kd = (s.coarse_kd * 0.7).clamp(0.0, COARSE_GAIN_MAX);
            self.fine_kp = (s.fine_kp * 0.7).clamp(0.0, FINE_GAIN_MAX);
            self.fine_kd = (s.fine_kd * 0.7).clamp(0.0, FINE_GAIN_MAX);
            tracing::info!(profile_idx, "tuning seeded from history");
        }
        tracing::info!(profile_idx, "tuning session started");
    }

    pub fn state(&self) -> TunerState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, TunerState::Phase1Coarse | TunerState::Phase2Fine)
    }

    pub fn motor_mode(&self) -> MotorMode {
        match self.state {
            TunerState::Phase1Coarse => MotorMode::CoarseOnly,
            TunerState::Phase2Fine => MotorMode::FineOnly,
            _ => MotorMode::Normal,
        }
    }

    pub fn drops_completed(&self) -> usize {
        self.drops.len()
    }

    pub fn drops(&self) -> &[DropTelemetry] {
        &self.drops
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    /// Rough progress against the ~15-drop estimate of the hybrid search.
    pub fn progress_percent(&self) -> u8 {
        ((self.drops.len() * 100) / 15).min(100) as u8
    }

    /// Gains to use for the next drop. `None` outside an active session.
    pub fn next_gains(&self) -> Option<GainSet> {
        match self.state {
            TunerState::Phase1Coarse => {
                let (kp, kd) = if self.coarse_axis == AxisPhase::GpRefine {
                    self.gp_coarse.next_candidate()
                } else {
                    (self.coarse_kp, self.coarse_kd)
                };
                Some(GainSet {
                    coarse_kp: kp,
                    coarse_kd: kd,
                    // Fine stays parked while the coarse motor is tuned.
                    fine_kp: 0.0,
                    fine_kd: 0.0,
                })
            }
            TunerState::Phase2Fine => {
                let (kp, kd) = if self.fine_axis == AxisPhase::GpRefine {
                    self.gp_fine.next_candidate()
                } else {
                    (self.fine_kp, self.fine_kd)
                };
                Some(GainSet {
                    coarse_kp: self.recommended.coarse_kp,
                    coarse_kd: self.recommended.coarse_kd,
                    fine_kp: kp,
                    fine_kd: kd,
                })
            }
            _ => None,
        }
    }

    /// Coarse gains locked in by phase 1, used by the phase-2 pre-fill.
    /// Zero until phase 1 completes.
    pub fn tuned_coarse(&self) -> (f32, f32) {
        (self.recommended.coarse_kp, self.recommended.coarse_kd)
    }

    /// Score a drop for the GP (higher is better): overthrow penalty
    /// capped at 50, slow penalty capped at 30, speed bonus up to 20 when
    /// the overthrow gate holds, floored at 0.
    pub fn score(&self, t: &DropTelemetry) -> f32 {
        let pct = t.overthrow_fraction * 100.0;
        let mut score = 100.0 - (pct.abs() * 5.0).min(50.0);
        let time_ratio = t.total_time_ms / self.targets.total_time_target_ms;
        if time_ratio > 1.0 {
            score -= ((time_ratio - 1.0) * 30.0).min(30.0);
        }
        if time_ratio < 1.0 && pct <= self.targets.max_overthrow_fraction * 100.0 {
            score += (1.0 - time_ratio) * 20.0;
        }
        score.max(0.0)
    }

    /// Consume one drop's telemetry and advance the search. Returns false
    /// when the session is not active (including the transition into
    /// `Error` on the drop-budget overrun).
    pub fn record(&mut self, t: &DropTelemetry) -> bool {
        if !self.is_active() {
            return false;
        }
        if self.drops.len() >= MAX_DROPS {
            tracing::warn!(max = MAX_DROPS, "tuning did not converge");
            self.error_message = Some(format!("did not converge in {MAX_DROPS} drops"));
            self.recommended = GainSet {
                coarse_kp: self.coarse_kp,
                coarse_kd: self.coarse_kd,
                fine_kp: self.fine_kp,
                fine_kd: self.fine_kd,
            };
            self.state = TunerState::Error;
            return false;
        }

        self.drops.push(t.clone());
        let score = self.score(t);
        tracing::info!(
            drop = self.drops.len(),
            score,
            overthrow = t.overthrow,
            total_ms = t.total_time_ms,
            "tuning drop recorded"
        );

        match self.state {
            TunerState::Phase1Coarse => {
                self.gp_coarse
                    .add_observation(t.gains.coarse_kp, t.gains.coarse_kd, score);
                self.advance_phase1(t);
            }
            TunerState::Phase2Fine => {
                self.gp_fine
                    .add_observation(t.gains.fine_kp, t.gains.fine_kd, score);
                self.advance_phase2(t);
            }
            _ => {}
        }
        true
    }

    fn advance_phase1(&mut self, t: &DropTelemetry) {
        let has_overthrow = t.overthrow > self.coarse_stop;
        let time_ok = t.coarse_time_ms <= self.targets.coarse_time_target_ms;

        if self.coarse_axis == AxisPhase::GpRefine {
            self.gp_refine_drops += 1;
            if self.gp_refine_drops >= GP_REFINE_DROPS {
                if let Some((kp, kd, best_score)) = self.gp_coarse.best_observed() {
                    self.recommended.coarse_kp = kp;
                    self.recommended.coarse_kd = kd;
                    tracing::info!(kp, kd, best_score, "coarse trickler tuned");
                }
                self.state = TunerState::Phase2Fine;
                self.gp_refine_drops = 0;
            }
            return;
        }

        match self.coarse_axis {
            AxisPhase::AdaptiveKp => {
                if has_overthrow {
                    if self.coarse_kp_step > COARSE_MIN_STEP {
                        // Back off and halve; the next good drop climbs by
                        // the smaller step.
                        self.coarse_kp = (self.coarse_kp - self.coarse_kp_step).max(0.0);
                        self.coarse_kp_step = (self.coarse_kp_step / 2.0).max(COARSE_MIN_STEP);
                        tracing::debug!(
                            kp = self.coarse_kp,
                            step = self.coarse_kp_step,
                            "coarse kp backed off"
                        );
                    } else {
                        // Bracketed at minimum resolution: move on to Kd.
                        self.coarse_axis = AxisPhase::AdaptiveKd;
                        self.coarse_kd += self.coarse_kd_step;
                    }
                } else {
                    self.coarse_kp += self.coarse_kp_step;
                    if self.coarse_kp >= COARSE_GAIN_MAX {
                        self.coarse_kp = COARSE_GAIN_MAX;
                        self.coarse_axis = AxisPhase::AdaptiveKd;
                    }
                }
            }
            AxisPhase::AdaptiveKd => {
                if !has_overthrow && time_ok {
                    self.coarse_axis = AxisPhase::GpRefine;
                    self.gp_refine_drops = 0;
                } else if has_overthrow {
                    self.coarse_kd += self.coarse_kd_step;
                    if self.coarse_kd >= COARSE_GAIN_MAX {
                        self.coarse_kd = COARSE_GAIN_MAX;
                        self.coarse_axis = AxisPhase::GpRefine;
                        self.gp_refine_drops = 0;
                    }
                } else {
                    // Overthrow is fine, only the time goal failed.
                    self.coarse_kp += COARSE_MIN_STEP;
                }
            }
            AxisPhase::GpRefine => {}
        }

        self.coarse_kp = self.coarse_kp.clamp(0.0, COARSE_GAIN_MAX);
        self.coarse_kd = self.coarse_kd.clamp(0.0, COARSE_GAIN_MAX);
    }

    fn advance_phase2(&mut self, t: &DropTelemetry) {
        let has_overthrow = t.overthrow > 0.0;
        let overthrow_ok =
            t.overthrow_fraction.abs() <= self.targets.max_overthrow_fraction;
        let time_ok = t.total_time_ms <= self.targets.total_time_target_ms;

        if self.fine_axis == AxisPhase::GpRefine {
            self.gp_refine_drops += 1;
            if self.gp_refine_drops >= GP_REFINE_DROPS {
                if let Some((kp, kd, best_score)) = self.gp_fine.best_observed() {
                    self.recommended.fine_kp = kp;
                    self.recommended.fine_kd = kd;
                    tracing::info!(kp, kd, best_score, "fine trickler tuned");
                }
                self.finalize();
            }
            return;
        }

        match self.fine_axis {
            AxisPhase::AdaptiveKp => {
                if has_overthrow {
                    if self.fine_kp_step > FINE_MIN_STEP {
                        self.fine_kp = (self.fine_kp - self.fine_kp_step).max(0.0);
                        self.fine_kp_step = (self.fine_kp_step / 2.0).max(FINE_MIN_STEP);
                        tracing::debug!(
                            kp = self.fine_kp,
                            step = self.fine_kp_step,
                            "fine kp backed off"
                        );
                    } else {
                        self.fine_axis = AxisPhase::AdaptiveKd;
                        self.fine_kd += self.fine_kd_step;
                    }
                } else {
                    self.fine_kp += self.fine_kp_step;
                    if self.fine_kp >= FINE_GAIN_MAX {
                        self.fine_kp = FINE_GAIN_MAX;
                        self.fine_axis = AxisPhase::AdaptiveKd;
                    }
                }
            }
            AxisPhase::AdaptiveKd => {
                if overthrow_ok && time_ok {
                    self.fine_axis = AxisPhase::GpRefine;
                    self.gp_refine_drops = 0;
                } else if !overthrow_ok && has_overthrow {
                    self.fine_kd += self.fine_kd_step;
                    if self.fine_kd >= FINE_GAIN_MAX {
                        self.fine_kd = FINE_GAIN_MAX;
                        self.fine_axis = AxisPhase::GpRefine;
                        self.gp_refine_drops = 0;
                    }
                } else if !time_ok {
                    self.fine_kp += FINE_MIN_STEP;
                } else if self.fine_kd > FINE_MIN_STEP {
                    // Underthrowing: ease the damping slightly.
                    self.fine_kd -= FINE_MIN_STEP;
                }
            }
            AxisPhase::GpRefine => {}
        }

        self.fine_kp = self.fine_kp.clamp(0.0, FINE_GAIN_MAX);
        self.fine_kd = self.fine_kd.clamp(0.0, FINE_GAIN_MAX);
    }

    fn finalize(&mut self) {
        self.state = TunerState::Complete;
        let n = self.drops.len();
        if n > 0 {
            self.avg_overthrow =
                self.drops.iter().map(|d| d.overthrow).sum::<f32>() / n as f32;
            self.avg_total_time_ms =
                self.drops.iter().map(|d| d.total_time_ms).sum::<f32>() / n as f32;
        }
        tracing::info!(
            drops = n,
            avg_overthrow = self.avg_overthrow,
            avg_total_ms = self.avg_total_time_ms,
            coarse_kp = self.recommended.coarse_kp,
            coarse_kd = self.recommended.coarse_kd,
            fine_kp = self.recommended.fine_kp,
            fine_kd = self.recommended.fine_kd,
            "tuning complete, awaiting confirmation"
        );
    }

    /// Average overthrow and total time over the session's drops,
    /// populated at completion.
    pub fn stats(&self) -> (f32, f32) {
        (self.avg_overthrow, self.avg_total_time_ms)
    }

    /// Final recommendation; available once the session is `Complete` or
    /// ended in `Error` (best-so-far in that case).
    pub fn recommended_gains(&self) -> Option<GainSet> {
        match self.state {
            TunerState::Complete | TunerState::Error => Some(self.recommended),
            _ => None,
        }
    }

    /// Write the recommendation into `profile` and return to `Idle`.
    pub fn apply_to(&mut self, profile: &mut Profile) -> bool {
        let Some(gains) = self.recommended_gains() else {
            return false;
        };
        profile.coarse_kp = gains.coarse_kp;
        profile.coarse_kd = gains.coarse_kd;
        profile.fine_kp = gains.fine_kp;
        profile.fine_kd = gains.fine_kd;
        tracing::info!(profile = %profile.name, "tuned gains applied");
        self.state = TunerState::Idle;
        true
    }

    pub fn cancel(&mut self) {
        tracing::info!("tuning session cancelled");
        *self = Self::new();
    }
}
