//! Persisted records and their bit-exact flash layouts.
//!
//! Every record here is written whole into its own flash region and read
//! back whole. Numeric fields are little-endian; strings are fixed-width,
//! NUL padded. The framing (magic / revision / checksum) is applied by
//! `store`; records only encode their body.

use crate::store::Region;
use serde::{Deserialize, Serialize};

/// Upper gain bound for the coarse trickler axes (Kp and Kd).
pub const COARSE_GAIN_MAX: f32 = 1.0;
/// Upper gain bound for the fine trickler axes (Kp and Kd).
pub const FINE_GAIN_MAX: f32 = 10.0;

pub const PROFILE_COUNT: usize = 8;
pub const HISTORY_CAPACITY: usize = 10;

// ---------------------------------------------------------------------------
// Little-endian body codec
// ---------------------------------------------------------------------------

pub(crate) mod codec {
    pub fn put_u8(out: &mut Vec<u8>, v: u8) {
        out.push(v);
    }
    pub fn put_u32(out: &mut Vec<u8>, v: u32) {
        out.extend_from_slice(&v.to_le_bytes());
    }
    pub fn put_f32(out: &mut Vec<u8>, v: f32) {
        out.extend_from_slice(&v.to_le_bytes());
    }
    /// Fixed-width string field: truncated to `width` bytes, NUL padded.
    pub fn put_str(out: &mut Vec<u8>, s: &str, width: usize) {
        let bytes = s.as_bytes();
        let n = bytes.len().min(width);
        out.extend_from_slice(&bytes[..n]);
        out.resize(out.len() + (width - n), 0);
    }

    /// Sequential reader over a record body. All getters return `None`
    /// when the body is short, which the caller maps to "region absent".
    pub struct Cursor<'a> {
        buf: &'a [u8],
        pos: usize,
    }

    impl<'a> Cursor<'a> {
        pub fn new(buf: &'a [u8]) -> Self {
            Self { buf, pos: 0 }
        }
        fn take(&mut self, n: usize) -> Option<&'a [u8]> {
            let end = self.pos.checked_add(n)?;
            if end > self.buf.len() {
                return None;
            }
            let s = &self.buf[self.pos..end];
            self.pos = end;
            Some(s)
        }
        pub fn u8(&mut self) -> Option<u8> {
            self.take(1).map(|s| s[0])
        }
        pub fn u32(&mut self) -> Option<u32> {
            self.take(4).map(|s| u32::from_le_bytes([s[0], s[1], s[2], s[3]]))
        }
        pub fn f32(&mut self) -> Option<f32> {
            self.take(4).map(|s| f32::from_le_bytes([s[0], s[1], s[2], s[3]]))
        }
        pub fn str_field(&mut self, width: usize) -> Option<String> {
            let raw = self.take(width)?;
            let end = raw.iter().position(|&b| b == 0).unwrap_or(width);
            Some(String::from_utf8_lossy(&raw[..end]).into_owned())
        }
    }
}

use codec::{put_f32, put_str, put_u32, put_u8, Cursor};

// ---------------------------------------------------------------------------
// Profiles
// ---------------------------------------------------------------------------

/// One powder profile: PD gains for both tricklers plus flow speed bounds.
/// Ki is carried but every shipped profile and the tuner write it as 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    pub coarse_kp: f32,
    pub coarse_ki: f32,
    pub coarse_kd: f32,
    pub fine_kp: f32,
    pub fine_ki: f32,
    pub fine_kd: f32,
    pub coarse_min_rps: f32,
    pub coarse_max_rps: f32,
    pub fine_min_rps: f32,
    pub fine_max_rps: f32,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            name: "Default".to_string(),
            coarse_kp: 0.5,
            coarse_ki: 0.0,
            coarse_kd: 0.1,
            fine_kp: 2.0,
            fine_ki: 0.0,
            fine_kd: 0.5,
            coarse_min_rps: 0.2,
            coarse_max_rps: 5.0,
            fine_min_rps: 0.05,
            fine_max_rps: 2.0,
        }
    }
}

const PROFILE_NAME_WIDTH: usize = 20;

impl Profile {
    fn encode(&self, out: &mut Vec<u8>) {
        put_str(out, &self.name, PROFILE_NAME_WIDTH);
        for v in [
            self.coarse_kp,
            self.coarse_ki,
            self.coarse_kd,
            self.fine_kp,
            self.fine_ki,
            self.fine_kd,
            self.coarse_min_rps,
            self.coarse_max_rps,
            self.fine_min_rps,
            self.fine_max_rps,
        ] {
            put_f32(out, v);
        }
    }

    fn decode(c: &mut Cursor<'_>) -> Option<Self> {
        Some(Self {
            name: c.str_field(PROFILE_NAME_WIDTH)?,
            coarse_kp: c.f32()?,
            coarse_ki: c.f32()?,
            coarse_kd: c.f32()?,
            fine_kp: c.f32()?,
            fine_ki: c.f32()?,
            fine_kd: c.f32()?,
            coarse_min_rps: c.f32()?,
            coarse_max_rps: c.f32()?,
            fine_min_rps: c.f32()?,
            fine_max_rps: c.f32()?,
        })
    }
}

/// The eight profile slots plus the selection index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileStore {
    pub profiles: [Profile; PROFILE_COUNT],
    pub selected: u8,
}

impl Default for ProfileStore {
    fn default() -> Self {
        Self {
            profiles: std::array::from_fn(|i| Profile {
                name: format!("Profile {}", i + 1),
                ..Profile::default()
            }),
            selected: 0,
        }
    }
}

impl ProfileStore {
    pub fn selected(&self) -> &Profile {
        &self.profiles[usize::from(self.selected) % PROFILE_COUNT]
    }

    pub fn selected_mut(&mut self) -> &mut Profile {
        &mut self.profiles[usize::from(self.selected) % PROFILE_COUNT]
    }

    /// Change the selected slot. Out-of-range indices are rejected.
    pub fn select(&mut self, idx: u8) -> bool {
        if usize::from(idx) < PROFILE_COUNT {
            self.selected = idx;
            true
        } else {
            false
        }
    }
}

impl Region for ProfileStore {
    const MAGIC: u32 = 0x5052_4f46; // "PROF"
    const REVISION: u32 = 1;

    fn encode_body(&self, out: &mut Vec<u8>) {
        put_u8(out, self.selected);
        for p in &self.profiles {
            p.encode(out);
        }
    }

    fn decode_body(body: &[u8]) -> Option<Self> {
        let mut c = Cursor::new(body);
        let selected = c.u8()?;
        let mut profiles = Vec::with_capacity(PROFILE_COUNT);
        for _ in 0..PROFILE_COUNT {
            profiles.push(Profile::decode(&mut c)?);
        }
        let profiles: [Profile; PROFILE_COUNT] = profiles.try_into().ok()?;
        if usize::from(selected) >= PROFILE_COUNT {
            return None;
        }
        Some(Self { profiles, selected })
    }
}

// ---------------------------------------------------------------------------
// Charge settings
// ---------------------------------------------------------------------------

/// Display resolution of the scale: 2 or 3 decimal places.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecimalPlaces {
    Two,
    Three,
}

impl DecimalPlaces {
    fn as_u8(self) -> u8 {
        match self {
            DecimalPlaces::Two => 2,
            DecimalPlaces::Three => 3,
        }
    }
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            2 => Some(DecimalPlaces::Two),
            3 => Some(DecimalPlaces::Three),
            _ => None,
        }
    }

    /// Render a weight at this scale resolution.
    pub fn format(self, value: f32) -> String {
        match self {
            DecimalPlaces::Two => format!("{value:.2}"),
            DecimalPlaces::Three => format!("{value:.3}"),
        }
    }
}

/// Status LED colours per charge classification, packed 0xRRGGBB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedPalette {
    pub normal: u32,
    pub under: u32,
    pub over: u32,
    pub not_ready: u32,
}

impl Default for LedPalette {
    fn default() -> Self {
        Self {
            normal: 0x00_ff_00,
            under: 0xff_ff_00,
            over: 0xff_00_00,
            not_ready: 0x00_00_ff,
        }
    }
}

/// Charge-mode settings: thresholds, stability margins, precharge pulse,
/// tuner targets, LED palette.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargeSettings {
    pub decimal_places: DecimalPlaces,
    /// Error threshold below which the coarse trickler hands over.
    pub coarse_stop: f32,
    /// Error threshold below which the drop is finished.
    pub fine_stop: f32,
    pub sd_margin: f32,
    pub mean_margin: f32,
    pub precharge_enable: bool,
    pub precharge_time_ms: u32,
    pub precharge_speed_rps: f32,
    pub coarse_time_target_ms: u32,
    pub total_time_target_ms: u32,
    /// Tuner gate: acceptable |overthrow| / target.
    pub max_overthrow_fraction: f32,
    pub leds: LedPalette,
}

impl Default for ChargeSettings {
    fn default() -> Self {
        Self {
            decimal_places: DecimalPlaces::Two,
            coarse_stop: 5.0,
            fine_stop: 0.03,
            sd_margin: 0.02,
            mean_margin: 0.02,
            precharge_enable: false,
            precharge_time_ms: 1000,
            precharge_speed_rps: 2.0,
            coarse_time_target_ms: 10_000,
            total_time_target_ms: 15_000,
            max_overthrow_fraction: 1.0 / 15.0,
            leds: LedPalette::default(),
        }
    }
}

impl Region for ChargeSettings {
    const MAGIC: u32 = 0x4348_5247; // "CHRG"
    const REVISION: u32 = 2;

    fn encode_body(&self, out: &mut Vec<u8>) {
        put_u8(out, self.decimal_places.as_u8());
        put_f32(out, self.coarse_stop);
        put_f32(out, self.fine_stop);
        put_f32(out, self.sd_margin);
        put_f32(out, self.mean_margin);
        put_u8(out, u8::from(self.precharge_enable));
        put_u32(out, self.precharge_time_ms);
        put_f32(out, self.precharge_speed_rps);
        put_u32(out, self.coarse_time_target_ms);
        put_u32(out, self.total_time_target_ms);
        put_f32(out, self.max_overthrow_fraction);
        put_u32(out, self.leds.normal);
        put_u32(out, self.leds.under);
        put_u32(out, self.leds.over);
        put_u32(out, self.leds.not_ready);
    }

    fn decode_body(body: &[u8]) -> Option<Self> {
        let mut c = Cursor::new(body);
        Some(Self {
            decimal_places: DecimalPlaces::from_u8(c.u8()?)?,
            coarse_stop: c.f32()?,
            fine_stop: c.f32()?,
            sd_margin: c.f32()?,
            mean_margin: c.f32()?,
            precharge_enable: c.u8()? != 0,
            precharge_time_ms: c.u32()?,
            precharge_speed_rps: c.f32()?,
            coarse_time_target_ms: c.u32()?,
            total_time_target_ms: c.u32()?,
            max_overthrow_fraction: c.f32()?,
            leds: LedPalette {
                normal: c.u32()?,
                under: c.u32()?,
                over: c.u32()?,
                not_ready: c.u32()?,
            },
        })
    }
}

// ---------------------------------------------------------------------------
// Learning history
// ---------------------------------------------------------------------------

/// Gains quadruple used by telemetry, the tuner and the history store.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct GainSet {
    pub coarse_kp: f32,
    pub coarse_kd: f32,
    pub fine_kp: f32,
    pub fine_kd: f32,
}

/// One completed drop, as remembered across sessions.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DropRecord {
    pub gains: GainSet,
    pub overthrow: f32,
    pub coarse_time_ms: f32,
    pub fine_time_ms: f32,
    pub total_time_ms: f32,
    pub profile_idx: u8,
}

/// Deltas applied on top of the historical gain means when the average
/// overthrow leans one way. The direction (overthrow -> more Kd,
/// underthrow -> more Kp) assumes a monotonic response; the magnitudes are
/// configurable for that reason.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SuggestionBias {
    pub coarse_delta: f32,
    pub fine_delta: f32,
}

impl Default for SuggestionBias {
    fn default() -> Self {
        Self {
            coarse_delta: 0.01,
            fine_delta: 0.1,
        }
    }
}

/// Bounded ring of drop records plus the derived gain suggestions.
/// Every drop, tuned or not, lands here; suggestions seed the next tuning
/// session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningHistory {
    drops: [DropRecord; HISTORY_CAPACITY],
    next_idx: u8,
    count: u8,
    pub suggested: GainSet,
    pub has_suggestions: bool,
}

impl Default for LearningHistory {
    fn default() -> Self {
        Self {
            drops: [DropRecord::default(); HISTORY_CAPACITY],
            next_idx: 0,
            count: 0,
            suggested: GainSet::default(),
            has_suggestions: false,
        }
    }
}

impl LearningHistory {
    pub fn count(&self) -> usize {
        usize::from(self.count)
    }

    /// The stored records, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &DropRecord> {
        let count = usize::from(self.count);
        let start = if count < HISTORY_CAPACITY {
            0
        } else {
            usize::from(self.next_idx)
        };
        (0..count).map(move |i| &self.drops[(start + i) % HISTORY_CAPACITY])
    }

    pub fn record(&mut self, rec: DropRecord) {
        self.drops[usize::from(self.next_idx)] = rec;
        self.next_idx = (self.next_idx + 1) % HISTORY_CAPACITY as u8;
        if usize::from(self.count) < HISTORY_CAPACITY {
            self.count += 1;
        }
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Recompute the suggestion quadruple from the stored drops. Needs at
    /// least 3 records; below that suggestions are withdrawn.
    pub fn recompute_suggestions(
        &mut self,
        bias: &SuggestionBias,
        coarse_stop: f32,
        fine_stop: f32,
    ) {
        let count = self.count();
        if count < 3 {
            self.has_suggestions = false;
            return;
        }

        let n = count as f32;
        let mut avg_overthrow = 0.0;
        let mut avg = GainSet::default();
        for d in self.iter() {
            avg_overthrow += d.overthrow;
            avg.coarse_kp += d.gains.coarse_kp;
            avg.coarse_kd += d.gains.coarse_kd;
            avg.fine_kp += d.gains.fine_kp;
            avg.fine_kd += d.gains.fine_kd;
        }
        avg_overthrow /= n;
        avg.coarse_kp /= n;
        avg.coarse_kd /= n;
        avg.fine_kp /= n;
        avg.fine_kd /= n;

        let mut coarse_kp_adj = 0.0;
        let mut coarse_kd_adj = 0.0;
        let mut fine_kp_adj = 0.0;
        let mut fine_kd_adj = 0.0;

        if avg_overthrow > coarse_stop * 0.5 {
            coarse_kd_adj = bias.coarse_delta;
        } else if avg_overthrow < -fine_stop {
            coarse_kp_adj = bias.coarse_delta;
        }
        if avg_overthrow > fine_stop {
            fine_kd_adj = bias.fine_delta;
        } else if avg_overthrow < -fine_stop {
            fine_kp_adj = bias.fine_delta;
        }

        self.suggested = GainSet {
            coarse_kp: (avg.coarse_kp + coarse_kp_adj).clamp(0.0, COARSE_GAIN_MAX),
            coarse_kd: (avg.coarse_kd + coarse_kd_adj).clamp(0.0, COARSE_GAIN_MAX),
            fine_kp: (avg.fine_kp + fine_kp_adj).clamp(0.0, FINE_GAIN_MAX),
            fine_kd: (avg.fine_kd + fine_kd_adj).clamp(0.0, FINE_GAIN_MAX),
        };
        self.has_suggestions = true;
    }

    /// Seed gains for a tuning session: per-profile means when that profile
    /// has at least 3 records, otherwise the global suggestion quadruple.
    pub fn suggestions_for(&self, profile_idx: u8) -> Option<GainSet> {
        if self.count() < 3 {
            return None;
        }
        let mut sum = GainSet::default();
        let mut n = 0u32;
        for d in self.iter() {
            if d.profile_idx == profile_idx {
                sum.coarse_kp += d.gains.coarse_kp;
                sum.coarse_kd += d.gains.coarse_kd;
                sum.fine_kp += d.gains.fine_kp;
                sum.fine_kd += d.gains.fine_kd;
                n += 1;
            }
        }
        if n >= 3 {
            let n = n as f32;
            return Some(GainSet {
                coarse_kp: sum.coarse_kp / n,
                coarse_kd: sum.coarse_kd / n,
                fine_kp: sum.fine_kp / n,
                fine_kd: sum.fine_kd / n,
            });
        }
        if self.has_suggestions {
            return Some(self.suggested);
        }
        None
    }
}

impl Region for LearningHistory {
    const MAGIC: u32 = 0x4849_5354; // "HIST"
    const REVISION: u32 = 1;

    fn encode_body(&self, out: &mut Vec<u8>) {
        put_u8(out, self.next_idx);
        put_u8(out, self.count);
        put_u8(out, u8::from(self.has_suggestions));
        put_f32(out, self.suggested.coarse_kp);
        put_f32(out, self.suggested.coarse_kd);
        put_f32(out, self.suggested.fine_kp);
        put_f32(out, self.suggested.fine_kd);
        for d in &self.drops {
            put_f32(out, d.gains.coarse_kp);
            put_f32(out, d.gains.coarse_kd);
            put_f32(out, d.gains.fine_kp);
            put_f32(out, d.gains.fine_kd);
            put_f32(out, d.overthrow);
            put_f32(out, d.coarse_time_ms);
            put_f32(out, d.fine_time_ms);
            put_f32(out, d.total_time_ms);
            put_u8(out, d.profile_idx);
        }
    }

    fn decode_body(body: &[u8]) -> Option<Self> {
        let mut c = Cursor::new(body);
        let next_idx = c.u8()?;
        let count = c.u8()?;
        let has_suggestions = c.u8()? != 0;
        let suggested = GainSet {
            coarse_kp: c.f32()?,
            coarse_kd: c.f32()?,
            fine_kp: c.f32()?,
            fine_kd: c.f32()?,
        };
        if usize::from(next_idx) >= HISTORY_CAPACITY || usize::from(count) > HISTORY_CAPACITY {
            return None;
        }
        let mut drops = [DropRecord::default(); HISTORY_CAPACITY];
        for d in drops.iter_mut() {
            *d = DropRecord {
                gains: GainSet {
                    coarse_kp: c.f32()?,
                    coarse_kd: c.f32()?,
                    fine_kp: c.f32()?,
                    fine_kd: c.f32()?,
                },
                overthrow: c.f32()?,
                coarse_time_ms: c.f32()?,
                fine_time_ms: c.f32()?,
                total_time_ms: c.f32()?,
                profile_idx: c.u8()?,
            };
        }
        Some(Self {
            drops,
            next_idx,
            count,
            suggested,
            has_suggestions,
        })
    }
}

// ---------------------------------------------------------------------------
// WiFi credentials (bit-exact legacy layout, no revision field)
// ---------------------------------------------------------------------------

pub const WIFI_MAGIC: u32 = 0x5749_4649; // "WIFI"
pub(crate) const WIFI_SSID_WIDTH: usize = 33;
pub(crate) const WIFI_PASSWORD_WIDTH: usize = 64;
/// magic + ssid + password + auth + timeout + enabled + checksum
pub(crate) const WIFI_RECORD_LEN: usize = 4 + WIFI_SSID_WIDTH + WIFI_PASSWORD_WIDTH + 4 + 4 + 1 + 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WifiConfig {
    pub ssid: String,
    pub password: String,
    pub auth_method: u32,
    pub timeout_ms: u32,
    pub enabled: bool,
}

impl Default for WifiConfig {
    fn default() -> Self {
        Self {
            ssid: String::new(),
            password: String::new(),
            auth_method: 2,
            timeout_ms: 30_000,
            enabled: true,
        }
    }
}

impl WifiConfig {
    /// Checksum law: magic + every ssid/password byte (padding included) +
    /// auth_method + timeout_ms + enabled-as-1, all wrapping u32.
    pub fn checksum(encoded: &[u8]) -> u32 {
        let mut c = Cursor::new(encoded);
        let magic = c.u32().unwrap_or(0);
        let mut sum = magic;
        for _ in 0..(WIFI_SSID_WIDTH + WIFI_PASSWORD_WIDTH) {
            sum = sum.wrapping_add(u32::from(c.u8().unwrap_or(0)));
        }
        sum = sum.wrapping_add(c.u32().unwrap_or(0)); // auth_method
        sum = sum.wrapping_add(c.u32().unwrap_or(0)); // timeout_ms
        sum = sum.wrapping_add(u32::from(c.u8().unwrap_or(0) != 0)); // enabled
        sum
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(WIFI_RECORD_LEN);
        put_u32(&mut out, WIFI_MAGIC);
        put_str(&mut out, &self.ssid, WIFI_SSID_WIDTH);
        put_str(&mut out, &self.password, WIFI_PASSWORD_WIDTH);
        put_u32(&mut out, self.auth_method);
        put_u32(&mut out, self.timeout_ms);
        put_u8(&mut out, u8::from(self.enabled));
        let checksum = Self::checksum(&out);
        put_u32(&mut out, checksum);
        out
    }

    /// `None` unless the magic matches and the checksum holds.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < WIFI_RECORD_LEN {
            return None;
        }
        let mut c = Cursor::new(buf);
        if c.u32()? != WIFI_MAGIC {
            return None;
        }
        let ssid = c.str_field(WIFI_SSID_WIDTH)?;
        let password = c.str_field(WIFI_PASSWORD_WIDTH)?;
        let auth_method = c.u32()?;
        let timeout_ms = c.u32()?;
        let enabled = c.u8()? != 0;
        let stored = c.u32()?;
        if stored != Self::checksum(&buf[..WIFI_RECORD_LEN - 4]) {
            return None;
        }
        Some(Self {
            ssid,
            password,
            auth_method,
            timeout_ms,
            enabled,
        })
    }
}

// ---------------------------------------------------------------------------
// Display settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayConfig {
    /// 0 = mini 12864, 1 = tft35.
    pub display_type: u8,
    /// Quarter-turn count, 0..=3.
    pub rotation: u8,
    /// Backlight brightness, 0..=255.
    pub brightness: u8,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            display_type: 0,
            rotation: 0,
            brightness: 255,
        }
    }
}

impl Region for DisplayConfig {
    const MAGIC: u32 = 0x4449_5350; // "DISP"
    const REVISION: u32 = 1;

    fn encode_body(&self, out: &mut Vec<u8>) {
        put_u8(out, self.display_type);
        put_u8(out, self.rotation);
        put_u8(out, self.brightness);
    }

    fn decode_body(body: &[u8]) -> Option<Self> {
        let mut c = Cursor::new(body);
        let display_type = c.u8()?;
        let rotation = c.u8()?;
        let brightness = c.u8()?;
        if rotation > 3 {
            return None;
        }
        Some(Self {
            display_type,
            rotation,
            brightness,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_ring_wraps_and_iterates_oldest_first() {
        let mut h = LearningHistory::default();
        for i in 0..13 {
            h.record(DropRecord {
                overthrow: i as f32,
                ..DropRecord::default()
            });
        }
        assert_eq!(h.count(), HISTORY_CAPACITY);
        let seen: Vec<f32> = h.iter().map(|d| d.overthrow).collect();
        assert_eq!(seen.first(), Some(&3.0));
        assert_eq!(seen.last(), Some(&12.0));
    }

    #[test]
    fn suggestions_need_three_records() {
        let mut h = LearningHistory::default();
        let bias = SuggestionBias::default();
        h.record(DropRecord::default());
        h.record(DropRecord::default());
        h.recompute_suggestions(&bias, 5.0, 0.03);
        assert!(!h.has_suggestions);
        h.record(DropRecord::default());
        h.recompute_suggestions(&bias, 5.0, 0.03);
        assert!(h.has_suggestions);
    }

    #[test]
    fn positive_overthrow_bumps_kd() {
        let mut h = LearningHistory::default();
        for _ in 0..3 {
            h.record(DropRecord {
                gains: GainSet {
                    coarse_kp: 0.4,
                    coarse_kd: 0.2,
                    fine_kp: 3.0,
                    fine_kd: 1.0,
                },
                overthrow: 4.0, // above coarse_stop * 0.5 and fine_stop
                profile_idx: 1,
                ..DropRecord::default()
            });
        }
        h.recompute_suggestions(&SuggestionBias::default(), 5.0, 0.03);
        assert!((h.suggested.coarse_kd - 0.21).abs() < 1e-6);
        assert!((h.suggested.fine_kd - 1.1).abs() < 1e-6);
        assert!((h.suggested.coarse_kp - 0.4).abs() < 1e-6);
    }

    #[test]
    fn weight_formatting_follows_resolution() {
        assert_eq!(DecimalPlaces::Two.format(12.3456), "12.35");
        assert_eq!(DecimalPlaces::Three.format(12.3456), "12.346");
    }

    #[test]
    fn wifi_round_trip_and_checksum_reject() {
        let cfg = WifiConfig {
            ssid: "bench".into(),
            password: "hunter2".into(),
            auth_method: 2,
            timeout_ms: 30_000,
            enabled: true,
        };
        let mut bytes = cfg.encode();
        assert_eq!(bytes.len(), WIFI_RECORD_LEN);
        assert_eq!(WifiConfig::decode(&bytes), Some(cfg));
        bytes[10] ^= 0xff;
        assert_eq!(WifiConfig::decode(&bytes), None);
    }
}
