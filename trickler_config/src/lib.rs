//! Configuration for the trickler stack.
//!
//! Two worlds live here:
//! - the **file config** (TOML, serde) used by the simulation CLI, and
//! - the **persisted records** written to raw flash regions with
//!   magic + checksum + revision gating (`records`, `store`).
//!
//! The flash side deliberately has no serde in the loop: the layouts are
//! bit-exact and hand-coded (`records::codec`).

pub mod memflash;
pub mod records;
pub mod store;

pub use memflash::{MemFlash, SharedFlash};
pub use records::{
    ChargeSettings, DecimalPlaces, DisplayConfig, DropRecord, GainSet, LearningHistory,
    LedPalette, Profile, ProfileStore, SuggestionBias, WifiConfig, COARSE_GAIN_MAX,
    FINE_GAIN_MAX, HISTORY_CAPACITY, PROFILE_COUNT,
};
pub use store::{
    FlashHistoryStore, HistoryStore, MemoryHistoryStore, StoreError, CHARGE_REGION,
    CONFIG_BASE, DISPLAY_REGION, HISTORY_REGION, PROFILE_REGION, WIFI_REGION,
};

use serde::Deserialize;

/// `[charge]` section of the file config.
#[derive(Debug, Deserialize)]
pub struct ChargeFileCfg {
    /// Target charge weight in scale units.
    pub target: f32,
    pub coarse_stop: f32,
    pub fine_stop: f32,
    pub sd_margin: f32,
    pub mean_margin: f32,
}

/// `[sim]` section: parameters of the simulated powder column.
#[derive(Debug, Deserialize)]
pub struct SimCfg {
    /// Mass flow per coarse rotation, units per second per rps.
    pub coarse_flow: f32,
    /// Mass flow per fine rotation, units per second per rps.
    pub fine_flow: f32,
    /// Scale sample period in milliseconds.
    pub sample_ms: u64,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Logging {
    /// "error" | "warn" | "info" | "debug" | "trace"
    pub level: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FileConfig {
    pub charge: ChargeFileCfg,
    pub sim: SimCfg,
    #[serde(default)]
    pub logging: Logging,
}

pub fn load_toml(s: &str) -> Result<FileConfig, toml::de::Error> {
    toml::from_str::<FileConfig>(s)
}
