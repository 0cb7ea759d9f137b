//! Fixed-offset flash regions with magic + checksum + revision gating.
//!
//! Each persisted record owns one erase sector at an absolute offset above
//! both firmware banks, so the addresses survive updates and flash-size
//! changes. A region that fails its magic or checksum is simply absent;
//! a revision mismatch re-initializes the region to defaults.

use crate::records::{LearningHistory, WifiConfig};
use trickler_traits::{Flash, FlashError, FLASH_PAGE, FLASH_SECTOR};

/// Base of the configuration area: above bank B, below the flash end,
/// stable regardless of the fitted flash size.
pub const CONFIG_BASE: u32 = 0x000F_0000;

pub const WIFI_REGION: u32 = CONFIG_BASE;
pub const DISPLAY_REGION: u32 = CONFIG_BASE + FLASH_SECTOR;
pub const CHARGE_REGION: u32 = CONFIG_BASE + 2 * FLASH_SECTOR;
pub const PROFILE_REGION: u32 = CONFIG_BASE + 3 * FLASH_SECTOR;
pub const HISTORY_REGION: u32 = CONFIG_BASE + 4 * FLASH_SECTOR;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("flash: {0}")]
    Flash(#[from] FlashError),
    #[error("record does not fit in one sector")]
    TooLarge,
    #[error("read-back verification failed")]
    Verify,
}

/// A record persisted whole into one region.
pub trait Region: Sized {
    const MAGIC: u32;
    const REVISION: u32;

    fn encode_body(&self, out: &mut Vec<u8>);
    fn decode_body(body: &[u8]) -> Option<Self>;
}

/// Framing: magic, revision, body length, body, checksum. The checksum is
/// the wrapping u32 sum of the three header words and every body byte.
const HEADER_LEN: usize = 12;

fn frame<R: Region>(record: &R) -> Vec<u8> {
    let mut out = Vec::with_capacity(128);
    out.extend_from_slice(&R::MAGIC.to_le_bytes());
    out.extend_from_slice(&R::REVISION.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes()); // length patched below
    record.encode_body(&mut out);
    let body_len = (out.len() - HEADER_LEN) as u32;
    out[8..12].copy_from_slice(&body_len.to_le_bytes());
    let checksum = frame_checksum(&out);
    out.extend_from_slice(&checksum.to_le_bytes());
    out
}

fn frame_checksum(framed: &[u8]) -> u32 {
    let magic = u32::from_le_bytes([framed[0], framed[1], framed[2], framed[3]]);
    let rev = u32::from_le_bytes([framed[4], framed[5], framed[6], framed[7]]);
    let len = u32::from_le_bytes([framed[8], framed[9], framed[10], framed[11]]);
    let mut sum = magic.wrapping_add(rev).wrapping_add(len);
    for &b in &framed[HEADER_LEN..] {
        sum = sum.wrapping_add(u32::from(b));
    }
    sum
}

/// Read a region. `None` when the region is absent, corrupt, or carries a
/// different revision.
pub fn read_region<R: Region>(flash: &impl Flash, offset: u32) -> Option<R> {
    let mut header = [0u8; HEADER_LEN];
    flash.read(offset, &mut header).ok()?;
    let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let rev = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    let body_len = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
    if magic != R::MAGIC {
        return None;
    }
    if body_len as usize > (FLASH_SECTOR as usize - HEADER_LEN - 4) {
        return None;
    }
    let mut rest = vec![0u8; body_len as usize + 4];
    flash.read(offset + HEADER_LEN as u32, &mut rest).ok()?;
    let (body, crc_bytes) = rest.split_at(body_len as usize);

    let mut framed = Vec::with_capacity(HEADER_LEN + body.len());
    framed.extend_from_slice(&header);
    framed.extend_from_slice(body);
    let stored = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
    if stored != frame_checksum(&framed) {
        tracing::warn!(offset, "config region checksum mismatch, treating as absent");
        return None;
    }
    if rev != R::REVISION {
        tracing::info!(offset, stored_rev = rev, "config region revision changed");
        return None;
    }
    R::decode_body(body)
}

/// Write a region: erase its sector, program the framed record padded to a
/// page boundary, then read back and compare.
pub fn write_region<R: Region>(
    flash: &mut impl Flash,
    offset: u32,
    record: &R,
) -> Result<(), StoreError> {
    let framed = frame(record);
    if framed.len() > FLASH_SECTOR as usize {
        return Err(StoreError::TooLarge);
    }
    let mut padded = framed.clone();
    let rem = padded.len() % FLASH_PAGE as usize;
    if rem != 0 {
        padded.resize(padded.len() + (FLASH_PAGE as usize - rem), 0xff);
    }
    flash.erase(offset, FLASH_SECTOR)?;
    flash.program(offset, &padded)?;

    let mut verify = vec![0u8; framed.len()];
    flash.read(offset, &mut verify)?;
    if verify != framed {
        return Err(StoreError::Verify);
    }
    Ok(())
}

/// Read a region, falling back to defaults (without writing them back —
/// the first explicit save re-initializes the sector).
pub fn load_or_default<R: Region + Default>(flash: &impl Flash, offset: u32) -> R {
    read_region(flash, offset).unwrap_or_default()
}

/// The WiFi region keeps its legacy bit-exact layout and checksum; it is
/// not framed like the other regions.
pub fn read_wifi(flash: &impl Flash) -> Option<WifiConfig> {
    let mut buf = vec![0u8; crate::records::WIFI_RECORD_LEN];
    flash.read(WIFI_REGION, &mut buf).ok()?;
    WifiConfig::decode(&buf)
}

pub fn write_wifi(flash: &mut impl Flash, cfg: &WifiConfig) -> Result<(), StoreError> {
    let encoded = cfg.encode();
    let mut padded = encoded.clone();
    let rem = padded.len() % FLASH_PAGE as usize;
    if rem != 0 {
        padded.resize(padded.len() + (FLASH_PAGE as usize - rem), 0xff);
    }
    flash.erase(WIFI_REGION, FLASH_SECTOR)?;
    flash.program(WIFI_REGION, &padded)?;

    let mut verify = vec![0u8; encoded.len()];
    flash.read(WIFI_REGION, &mut verify)?;
    if verify != encoded {
        return Err(StoreError::Verify);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// History store handles
// ---------------------------------------------------------------------------

/// Storage seam for the learning history so the charge controller does not
/// care whether it talks to flash or to a test buffer.
pub trait HistoryStore {
    fn load(&mut self) -> LearningHistory;
    fn save(&mut self, history: &LearningHistory) -> Result<(), StoreError>;
}

pub struct FlashHistoryStore<F: Flash> {
    flash: F,
}

impl<F: Flash> FlashHistoryStore<F> {
    pub fn new(flash: F) -> Self {
        Self { flash }
    }
}

impl<F: Flash> HistoryStore for FlashHistoryStore<F> {
    fn load(&mut self) -> LearningHistory {
        load_or_default(&self.flash, HISTORY_REGION)
    }

    fn save(&mut self, history: &LearningHistory) -> Result<(), StoreError> {
        write_region(&mut self.flash, HISTORY_REGION, history)
    }
}

/// In-memory history, for tests and the simulation CLI.
#[derive(Default)]
pub struct MemoryHistoryStore {
    pub history: LearningHistory,
}

impl HistoryStore for MemoryHistoryStore {
    fn load(&mut self) -> LearningHistory {
        self.history.clone()
    }

    fn save(&mut self, history: &LearningHistory) -> Result<(), StoreError> {
        self.history = history.clone();
        Ok(())
    }
}
