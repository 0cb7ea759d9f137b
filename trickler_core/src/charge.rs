//! Charge-mode state machine.
//!
//! One cycle: wait-for-zero -> dispense -> wait-for-cup-removal ->
//! wait-for-cup-return -> back to zero. A reset press in any wait loop
//! exits; a persistently unsettled scale is not an error, the loops just
//! keep polling and stay responsive to input.

use crate::dispense::{DispenseLoop, DispenseParams, StepDecision};
use crate::error::{AbortReason, BuildError, ControlError, ErrorCode, ErrorLog, Result};
use crate::pid::{PdGains, PdState, SpeedBounds};
use crate::tuning::{MotorMode, TunerState, TuningSession};
use crate::window::SampleWindow;
use crate::{DropTelemetry, SCALE_SENTINEL};
use crossbeam_channel::Receiver;
use std::sync::Arc;
use trickler_config::{
    ChargeSettings, DropRecord, GainSet, HistoryStore, MemoryHistoryStore, Profile,
    SuggestionBias, COARSE_GAIN_MAX, FINE_GAIN_MAX,
};
use trickler_traits::{
    Clock, GateState, InputEvent, LedSink, MonotonicClock, MotorDrive, MotorId, Rgb, Scale,
    ServoGate,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargePhase {
    WaitForZero,
    Dispense,
    WaitForCupRemoval,
    WaitForCupReturn,
    Exit,
}

/// Error-band classification of a finished drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeClass {
    Normal,
    Under,
    Over,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed,
    Aborted(AbortReason),
}

/// What one `run_cycle` did.
#[derive(Debug, Clone)]
pub struct ChargeReport {
    pub outcome: CycleOutcome,
    pub telemetry: Option<DropTelemetry>,
    pub classification: Option<ChargeClass>,
    pub phases: Vec<ChargePhase>,
    pub elapsed_ms: f32,
}

const ZERO_WINDOW: usize = 10;
const REMOVAL_WINDOW: usize = 5;
const SAMPLE_TIMEOUT_MS: u64 = 200;
const ZERO_PACE_MS: u64 = 300;
const REMOVAL_PACE_MS: u64 = 300;
const RETURN_PACE_MS: u64 = 20;
const SETTLE_DELAY_MS: u64 = 1000;
const GATE_SETTLE_MS: u64 = 500;
const IDLE_DELAY_MS: u64 = 20;

const DEFAULT_BACKLIGHT: Rgb = Rgb(0xff_ff_ff);

pub struct ChargeController<S: Scale, M: MotorDrive> {
    scale: S,
    motors: M,
    gate: Box<dyn ServoGate>,
    leds: Box<dyn LedSink>,
    history: Box<dyn HistoryStore>,
    inputs: Option<Receiver<InputEvent>>,
    clock: Arc<dyn Clock + Send + Sync>,

    settings: ChargeSettings,
    profile: Profile,
    profile_idx: u8,
    target: f32,
    bias: SuggestionBias,

    pub tuner: TuningSession,
    error_log: ErrorLog,

    last_elapsed_ms: f32,
    aborted: Option<AbortReason>,
    classification: Option<ChargeClass>,
    telemetry: Option<DropTelemetry>,
    phases: Vec<ChargePhase>,
}

impl<S: Scale, M: MotorDrive> ChargeController<S, M> {
    pub fn builder() -> ChargeBuilder<S, M> {
        ChargeBuilder::default()
    }

    pub fn target(&self) -> f32 {
        self.target
    }

    /// Change the target weight. Typed rejection, no state mutated on
    /// failure.
    pub fn set_target(&mut self, target: f32) -> Result<()> {
        if !target.is_finite() || target <= 0.0 {
            return Err(eyre::Report::new(ControlError::Validation(
                "target weight must be positive",
            )));
        }
        self.target = target;
        Ok(())
    }

    pub fn settings(&self) -> &ChargeSettings {
        &self.settings
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn last_elapsed_ms(&self) -> f32 {
        self.last_elapsed_ms
    }

    pub fn error_codes(&self) -> Vec<ErrorCode> {
        self.error_log.snapshot()
    }

    /// Begin a tuning session for the selected profile, seeded from the
    /// learning history when it has enough data.
    pub fn start_tuning(&mut self) {
        let history = self.history.load();
        let seed = history.suggestions_for(self.profile_idx);
        self.tuner.start(self.profile_idx, seed, &self.settings);
    }

    /// Apply the tuner's recommendation to the in-memory profile.
    pub fn apply_tuned_gains(&mut self) -> bool {
        self.tuner.apply_to(&mut self.profile)
    }

    fn profile_gains(&self) -> GainSet {
        GainSet {
            coarse_kp: self.profile.coarse_kp,
            coarse_kd: self.profile.coarse_kd,
            fine_kp: self.profile.fine_kp,
            fine_kd: self.profile.fine_kd,
        }
    }

    fn poll_input(&mut self) -> Option<InputEvent> {
        self.inputs.as_ref().and_then(|rx| rx.try_recv().ok())
    }

    /// Returns true on a user abort. A tare request is honored only where
    /// the original flow allows it (zero and cup-return waits).
    fn handle_input(&mut self, ev: InputEvent, allow_tare: bool) -> bool {
        match ev {
            InputEvent::ResetPress => true,
            InputEvent::EncoderPress if allow_tare => {
                self.scale.force_zero();
                false
            }
            _ => false,
        }
    }

    fn set_indicator(&mut self, colour: Rgb) {
        self.leds
            .set_colour(DEFAULT_BACKLIGHT, colour, colour, true);
    }

    fn reset_leds(&mut self) {
        self.leds
            .set_colour(DEFAULT_BACKLIGHT, Rgb::OFF, Rgb::OFF, true);
    }

    fn stop_motors_best_effort(&mut self) {
        for motor in [MotorId::Fine, MotorId::Coarse] {
            if let Err(e) = self.motors.set_speed(motor, 0.0) {
                tracing::warn!(error = %e, "motor stop failed during abort");
            }
        }
    }

    fn motor_abort(&mut self) -> ChargePhase {
        self.error_log.push(ErrorCode::MotorFault);
        self.aborted = Some(AbortReason::MotorFault);
        self.stop_motors_best_effort();
        ChargePhase::Exit
    }

    fn user_abort(&mut self) -> ChargePhase {
        tracing::info!("user abort");
        self.aborted = Some(AbortReason::UserAbort);
        self.stop_motors_best_effort();
        ChargePhase::Exit
    }

    /// Run one full charge cycle and report what happened.
    pub fn run_cycle(&mut self) -> Result<ChargeReport> {
        self.phases.clear();
        self.aborted = None;
        self.classification = None;
        self.telemetry = None;

        for motor in [MotorId::Coarse, MotorId::Fine] {
            self.motors
                .enable(motor, true)
                .map_err(|e| eyre::Report::new(ControlError::Hardware(e.to_string())))?;
        }

        let result = self.cycle_inner();

        // Exit duties run on every path.
        self.reset_leds();
        for motor in [MotorId::Coarse, MotorId::Fine] {
            if let Err(e) = self.motors.enable(motor, false) {
                tracing::warn!(error = %e, "motor disable failed on exit");
            }
        }
        result?;

        Ok(ChargeReport {
            outcome: match self.aborted {
                Some(reason) => CycleOutcome::Aborted(reason),
                None => CycleOutcome::Completed,
            },
            telemetry: self.telemetry.clone(),
            classification: self.classification,
            phases: self.phases.clone(),
            elapsed_ms: self.last_elapsed_ms,
        })
    }

    fn cycle_inner(&mut self) -> Result<()> {
        let mut phase = ChargePhase::WaitForZero;
        self.phases.push(phase);
        loop {
            let next = match phase {
                ChargePhase::WaitForZero => self.wait_for_zero(),
                ChargePhase::Dispense => self.dispense()?,
                ChargePhase::WaitForCupRemoval => self.wait_for_cup_removal(),
                ChargePhase::WaitForCupReturn => self.wait_for_cup_return(),
                ChargePhase::Exit => return Ok(()),
            };
            self.phases.push(next);
            if next == ChargePhase::Exit {
                return Ok(());
            }
            if next == ChargePhase::WaitForZero {
                // Cup returned: the cycle is complete.
                return Ok(());
            }
            phase = next;
        }
    }

    fn wait_for_zero(&mut self) -> ChargePhase {
        self.set_indicator(Rgb(self.settings.leds.not_ready));
        let mut window = SampleWindow::new(ZERO_WINDOW);
        tracing::debug!("waiting for zero");

        loop {
            let tick = self.clock.now_ms();
            if let Some(ev) = self.poll_input() {
                if self.handle_input(ev, true) {
                    return self.user_abort();
                }
            }
            if let Some(w) = self.scale.wait_next(SAMPLE_TIMEOUT_MS) {
                if w > SCALE_SENTINEL {
                    window.push(w);
                }
            }
            if window.is_stable(self.settings.sd_margin, self.settings.mean_margin) {
                return ChargePhase::Dispense;
            }
            let elapsed = self.clock.now_ms().saturating_sub(tick);
            if elapsed < ZERO_PACE_MS {
                self.clock.sleep_ms(ZERO_PACE_MS - elapsed);
            }
        }
    }

    /// Phase-2 pre-fill: drive the coarse motor with the tuned gains from
    /// phase 1 up to the coarse threshold, so only the fine motor's work
    /// gets measured. Returns false when the drop was aborted.
    fn prefill(&mut self, bounds: &SpeedBounds) -> bool {
        let (kp, kd) = self.tuner.tuned_coarse();
        let gains = PdGains {
            kp,
            ki: self.profile.coarse_ki,
            kd,
        };
        let prefill_target = self.target - self.settings.coarse_stop;
        let mut pd = PdState::new(self.clock.now_ms());
        tracing::debug!(prefill_target, "prefill with tuned coarse gains");

        loop {
            if let Some(ev) = self.poll_input() {
                if self.handle_input(ev, false) {
                    self.user_abort();
                    return false;
                }
            }
            let Some(w) = self.scale.wait_next(SAMPLE_TIMEOUT_MS) else {
                continue;
            };
            let error = prefill_target - w;
            if error < self.settings.coarse_stop {
                if self.motors.set_speed(MotorId::Coarse, 0.0).is_err() {
                    self.motor_abort();
                    return false;
                }
                tracing::debug!(weight = w, "prefill complete");
                return true;
            }
            let now = self.clock.now_ms();
            let terms = pd.advance(error, now);
            let rps = PdState::command(&gains, error, terms, bounds);
            if self.motors.set_speed(MotorId::Coarse, rps).is_err() {
                self.motor_abort();
                return false;
            }
        }
    }

    fn dispense(&mut self) -> Result<ChargePhase> {
        self.set_indicator(Rgb(self.settings.leds.under));

        if self.gate.state() != GateState::Disabled {
            self.gate.set_state(GateState::Open, false);
        }

        let tuning = self.tuner.is_active();
        let mode = self.tuner.motor_mode();
        let gains = if tuning {
            self.tuner.next_gains().unwrap_or_else(|| self.profile_gains())
        } else {
            self.profile_gains()
        };

        let coarse_bounds = SpeedBounds::merge(
            SpeedBounds::new(
                self.motors.min_speed(MotorId::Coarse),
                self.motors.max_speed(MotorId::Coarse),
            ),
            SpeedBounds::new(self.profile.coarse_min_rps, self.profile.coarse_max_rps),
        );
        let fine_bounds = SpeedBounds::merge(
            SpeedBounds::new(
                self.motors.min_speed(MotorId::Fine),
                self.motors.max_speed(MotorId::Fine),
            ),
            SpeedBounds::new(self.profile.fine_min_rps, self.profile.fine_max_rps),
        );

        if mode == MotorMode::FineOnly && !self.prefill(&coarse_bounds) {
            return Ok(ChargePhase::Exit);
        }

        let mut history = self.history.load();
        let drop_index = if tuning {
            (self.tuner.drops_completed() + 1).min(255) as u8
        } else {
            (history.count() + 1).min(255) as u8
        };

        let start_ms = self.clock.now_ms();
        let mut dispense = DispenseLoop::new(
            DispenseParams {
                target: self.target,
                coarse_stop: self.settings.coarse_stop,
                fine_stop: self.settings.fine_stop,
                coarse_gains: PdGains {
                    kp: gains.coarse_kp,
                    ki: self.profile.coarse_ki,
                    kd: gains.coarse_kd,
                },
                fine_gains: PdGains {
                    kp: gains.fine_kp,
                    ki: self.profile.fine_ki,
                    kd: gains.fine_kd,
                },
                coarse_bounds,
                fine_bounds,
                mode,
            },
            start_ms,
        );
        tracing::info!(target_mass = self.target, ?mode, drop_index, "dispense start");

        let end_ms = loop {
            if let Some(ev) = self.poll_input() {
                if self.handle_input(ev, false) {
                    return Ok(self.user_abort());
                }
            }
            let Some(w) = self.scale.wait_next(SAMPLE_TIMEOUT_MS) else {
                // Sample missed; poll input again and keep looping.
                continue;
            };
            let now = self.clock.now_ms();
            match dispense.step(&mut self.motors, w, now) {
                Ok(StepDecision::Continue) => {}
                Ok(StepDecision::Finished) => break now,
                Err(e) => {
                    tracing::error!(error = %e, "dispense motor failure");
                    return Ok(self.motor_abort());
                }
            }
        };

        let (coarse_time_ms, fine_time_ms) = dispense.timings(end_ms);
        let total_time_ms = end_ms.saturating_sub(dispense.start_ms()) as f32;
        self.last_elapsed_ms = total_time_ms;

        let final_mass = self.scale.current();
        let overthrow = final_mass - self.target;
        let overthrow_fraction = if self.target > 0.0 {
            overthrow / self.target
        } else {
            0.0
        };
        let telemetry = DropTelemetry {
            drop_index,
            coarse_time_ms,
            fine_time_ms,
            total_time_ms,
            final_mass,
            target_mass: self.target,
            overthrow,
            overthrow_fraction,
            gains,
        };
        tracing::info!(
            final_mass,
            overthrow,
            total_time_ms,
            "dispense complete"
        );

        if tuning {
            self.tuner.record(&telemetry);
            if self.tuner.state() == TunerState::Error {
                self.error_log.push(ErrorCode::TunerNoConverge);
            }
        }

        // Every drop, tuned or not, feeds the learning history, and it is
        // persisted before the state machine advances.
        history.record(DropRecord {
            gains,
            overthrow,
            coarse_time_ms,
            fine_time_ms,
            total_time_ms,
            profile_idx: self.profile_idx,
        });
        if history.count() >= 3 {
            history.recompute_suggestions(
                &self.bias,
                self.settings.coarse_stop,
                self.settings.fine_stop,
            );
        }
        if let Err(e) = self.history.save(&history) {
            tracing::warn!(error = %e, "learning history save failed");
            self.error_log.push(ErrorCode::FlashIo);
        }
        self.telemetry = Some(telemetry);

        if self.gate.state() != GateState::Disabled {
            self.gate.set_state(GateState::Close, true);
        }

        // Pre-charge pulse for the next cup, once the gate has settled.
        if self.settings.precharge_enable && self.gate.state() != GateState::Disabled {
            self.clock.sleep_ms(GATE_SETTLE_MS);
            if self
                .motors
                .set_speed(MotorId::Coarse, self.settings.precharge_speed_rps)
                .is_err()
            {
                return Ok(self.motor_abort());
            }
            self.clock.sleep_ms(u64::from(self.settings.precharge_time_ms));
            if self.motors.set_speed(MotorId::Coarse, 0.0).is_err() {
                return Ok(self.motor_abort());
            }
        } else {
            self.clock.sleep_ms(IDLE_DELAY_MS);
        }

        Ok(ChargePhase::WaitForCupRemoval)
    }

    fn wait_for_cup_removal(&mut self) -> ChargePhase {
        // Let the pan settle before judging the result.
        self.clock.sleep_ms(SETTLE_DELAY_MS);

        let current = self.scale.current();
        let error = self.target - current;
        let fine_stop = self.settings.fine_stop;
        let class = if error <= -fine_stop {
            ChargeClass::Over
        } else if error >= fine_stop {
            ChargeClass::Under
        } else {
            ChargeClass::Normal
        };
        self.classification = Some(class);
        let colour = match class {
            ChargeClass::Normal => self.settings.leds.normal,
            ChargeClass::Under => self.settings.leds.under,
            ChargeClass::Over => self.settings.leds.over,
        };
        self.set_indicator(Rgb(colour));
        tracing::info!(?class, final_mass = current, "charge classified");

        let mut window = SampleWindow::new(REMOVAL_WINDOW);
        loop {
            let tick = self.clock.now_ms();
            if let Some(ev) = self.poll_input() {
                if self.handle_input(ev, false) {
                    return self.user_abort();
                }
            }
            if let Some(w) = self.scale.wait_next(SAMPLE_TIMEOUT_MS) {
                if w > SCALE_SENTINEL {
                    window.push(w);
                }
            }
            if window.is_stable(self.settings.sd_margin, self.settings.mean_margin) {
                break;
            }
            let elapsed = self.clock.now_ms().saturating_sub(tick);
            if elapsed < REMOVAL_PACE_MS {
                self.clock.sleep_ms(REMOVAL_PACE_MS - elapsed);
            }
        }

        self.reset_leds();
        ChargePhase::WaitForCupReturn
    }

    fn wait_for_cup_return(&mut self) -> ChargePhase {
        self.set_indicator(Rgb(self.settings.leds.not_ready));
        tracing::debug!("waiting for cup return");

        loop {
            let tick = self.clock.now_ms();
            if let Some(ev) = self.poll_input() {
                if self.handle_input(ev, true) {
                    return self.user_abort();
                }
            }
            if let Some(w) = self.scale.wait_next(SAMPLE_TIMEOUT_MS) {
                if w >= 0.0 {
                    return ChargePhase::WaitForZero;
                }
            }
            let elapsed = self.clock.now_ms().saturating_sub(tick);
            if elapsed < RETURN_PACE_MS {
                self.clock.sleep_ms(RETURN_PACE_MS - elapsed);
            }
        }
    }
}

/// Builder with typed validation; everything except scale, motors and
/// target has a sensible default.
pub struct ChargeBuilder<S, M> {
    scale: Option<S>,
    motors: Option<M>,
    gate: Option<Box<dyn ServoGate>>,
    leds: Option<Box<dyn LedSink>>,
    history: Option<Box<dyn HistoryStore>>,
    inputs: Option<Receiver<InputEvent>>,
    clock: Option<Arc<dyn Clock + Send + Sync>>,
    settings: Option<ChargeSettings>,
    profile: Option<(Profile, u8)>,
    target: Option<f32>,
    bias: Option<SuggestionBias>,
}

impl<S, M> Default for ChargeBuilder<S, M> {
    fn default() -> Self {
        Self {
            scale: None,
            motors: None,
            gate: None,
            leds: None,
            history: None,
            inputs: None,
            clock: None,
            settings: None,
            profile: None,
            target: None,
            bias: None,
        }
    }
}

impl<S: Scale, M: MotorDrive> ChargeBuilder<S, M> {
    pub fn with_scale(mut self, scale: S) -> Self {
        self.scale = Some(scale);
        self
    }
    pub fn with_motors(mut self, motors: M) -> Self {
        self.motors = Some(motors);
        self
    }
    pub fn with_gate(mut self, gate: impl ServoGate + 'static) -> Self {
        self.gate = Some(Box::new(gate));
        self
    }
    pub fn with_leds(mut self, leds: impl LedSink + 'static) -> Self {
        self.leds = Some(Box::new(leds));
        self
    }
    pub fn with_history(mut self, history: impl HistoryStore + 'static) -> Self {
        self.history = Some(Box::new(history));
        self
    }
    pub fn with_inputs(mut self, inputs: Receiver<InputEvent>) -> Self {
        self.inputs = Some(inputs);
        self
    }
    pub fn with_clock(mut self, clock: Arc<dyn Clock + Send + Sync>) -> Self {
        self.clock = Some(clock);
        self
    }
    pub fn with_settings(mut self, settings: ChargeSettings) -> Self {
        self.settings = Some(settings);
        self
    }
    pub fn with_profile(mut self, profile: Profile, profile_idx: u8) -> Self {
        self.profile = Some((profile, profile_idx));
        self
    }
    pub fn with_target(mut self, target: f32) -> Self {
        self.target = Some(target);
        self
    }
    pub fn with_suggestion_bias(mut self, bias: SuggestionBias) -> Self {
        self.bias = Some(bias);
        self
    }

    pub fn build(self) -> Result<ChargeController<S, M>> {
        let scale = self
            .scale
            .ok_or_else(|| eyre::Report::new(BuildError::MissingScale))?;
        let motors = self
            .motors
            .ok_or_else(|| eyre::Report::new(BuildError::MissingMotors))?;
        let target = self
            .target
            .ok_or_else(|| eyre::Report::new(BuildError::MissingTarget))?;
        if !target.is_finite() || target <= 0.0 {
            return Err(eyre::Report::new(BuildError::InvalidConfig(
                "target weight must be positive",
            )));
        }

        let settings = self.settings.unwrap_or_default();
        if settings.fine_stop < 0.0 || settings.coarse_stop < settings.fine_stop {
            return Err(eyre::Report::new(BuildError::InvalidConfig(
                "stop thresholds must satisfy 0 <= fine_stop <= coarse_stop",
            )));
        }
        if settings.sd_margin <= 0.0 || settings.mean_margin <= 0.0 {
            return Err(eyre::Report::new(BuildError::InvalidConfig(
                "stability margins must be > 0",
            )));
        }

        let (profile, profile_idx) = self.profile.unwrap_or((Profile::default(), 0));
        let coarse_ok = (0.0..=COARSE_GAIN_MAX).contains(&profile.coarse_kp)
            && (0.0..=COARSE_GAIN_MAX).contains(&profile.coarse_kd);
        let fine_ok = (0.0..=FINE_GAIN_MAX).contains(&profile.fine_kp)
            && (0.0..=FINE_GAIN_MAX).contains(&profile.fine_kd);
        if !coarse_ok || !fine_ok {
            return Err(eyre::Report::new(BuildError::InvalidConfig(
                "profile gains outside their ranges",
            )));
        }
        if profile.coarse_min_rps > profile.coarse_max_rps
            || profile.fine_min_rps > profile.fine_max_rps
            || profile.coarse_min_rps < 0.0
            || profile.fine_min_rps < 0.0
        {
            return Err(eyre::Report::new(BuildError::InvalidConfig(
                "profile speed bounds invalid",
            )));
        }

        Ok(ChargeController {
            scale,
            motors,
            gate: self
                .gate
                .unwrap_or_else(|| Box::new(crate::mocks::StubGate::disabled())),
            leds: self.leds.unwrap_or_else(|| Box::new(NullLeds)),
            history: self
                .history
                .unwrap_or_else(|| Box::new(MemoryHistoryStore::default())),
            inputs: self.inputs,
            clock: self
                .clock
                .unwrap_or_else(|| Arc::new(MonotonicClock::new())),
            settings,
            profile,
            profile_idx,
            target,
            bias: self.bias.unwrap_or_default(),
            tuner: TuningSession::new(),
            error_log: ErrorLog::new(),
            last_elapsed_ms: 0.0,
            aborted: None,
            classification: None,
            telemetry: None,
            phases: Vec::new(),
        })
    }
}

/// LED sink for builds without any indicator hardware.
struct NullLeds;

impl LedSink for NullLeds {
    fn set_colour(&mut self, _backlight: Rgb, _led1: Rgb, _led2: Rgb, _apply_immediately: bool) {}
}
