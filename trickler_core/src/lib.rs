#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
#![allow(clippy::module_name_repetitions)]
//! Core powder-dispensing control (hardware-agnostic).
//!
//! All hardware interactions go through the `trickler_traits` capability
//! traits; everything here is driven by values and a `Clock`, so the whole
//! stack runs under a deterministic test clock.
//!
//! ## Architecture
//!
//! - **Sampling**: rolling window statistics + threaded sampler (`window`,
//!   `sampler`)
//! - **Control**: PD actuation with per-motor speed bounds (`pid`,
//!   `dispense`)
//! - **Sequencing**: charge state machine (`charge`)
//! - **Tuning**: adaptive + Gaussian-process auto-tuner (`tuning`)
//! - **Motors**: command queue with latest-wins backpressure (`motor_task`)

pub mod charge;
pub mod dispense;
pub mod error;
pub mod mocks;
pub mod motor_task;
pub mod pid;
pub mod sampler;
pub mod tuning;
pub mod window;

pub use charge::{ChargeBuilder, ChargeClass, ChargeController, ChargePhase, ChargeReport, CycleOutcome};
pub use dispense::{DispenseLoop, DispenseParams, StepDecision};
pub use error::{AbortReason, BuildError, ControlError, ErrorCode, ErrorLog, Result};
pub use pid::{PdGains, PdState, SpeedBounds};
pub use tuning::{MotorMode, TunerState, TuningSession};
pub use window::SampleWindow;

use trickler_config::GainSet;

/// Readings at or below this value are the "scale not settled / pan
/// removed" sentinel and are never treated as numbers.
pub const SCALE_SENTINEL: f32 = -1.0;

/// Per-drop telemetry, produced by the dispense path and consumed by the
/// tuner and the persistent learning history.
#[derive(Debug, Clone, PartialEq)]
pub struct DropTelemetry {
    pub drop_index: u8,
    pub coarse_time_ms: f32,
    pub fine_time_ms: f32,
    pub total_time_ms: f32,
    pub final_mass: f32,
    pub target_mass: f32,
    /// final - target; negative means underthrow.
    pub overthrow: f32,
    /// overthrow / target, 0 when the target is 0.
    pub overthrow_fraction: f32,
    pub gains: GainSet,
}
