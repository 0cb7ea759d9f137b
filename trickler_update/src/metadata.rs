//! Double-buffered firmware metadata.
//!
//! Two copies live in their own sectors with alternating sequence numbers
//! and a trailing self-CRC; the reader takes the highest-sequence copy
//! whose CRC holds, the writer targets the losing copy, so a torn write
//! always leaves the previous generation intact. Decoding reads a fixed
//! prefix and ignores trailing bytes, which is what lets an old bootloader
//! tolerate records grown by a newer application.

use crate::crc32::crc32;
use crate::layout::{Bank, BANK_SIZE, METADATA_PRIMARY, METADATA_SECONDARY};
use crate::UpdateError;
use trickler_traits::{Flash, FLASH_PAGE, FLASH_SECTOR};

pub const METADATA_DATA_REV: u32 = 1;

const VERSION_WIDTH: usize = 32;
/// data_rev + active + 2 * (crc + size + boot + valid + version) +
/// update_in_progress + rollback + sequence + self_crc
pub(crate) const METADATA_LEN: usize = 4 + 1 + 2 * (4 + 4 + 1 + 1 + VERSION_WIDTH) + 1 + 1 + 4 + 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BankInfo {
    pub crc32: u32,
    pub size: u32,
    pub boot_count: u8,
    pub valid: bool,
    pub version: String,
}

impl Default for BankInfo {
    fn default() -> Self {
        Self {
            crc32: 0,
            size: 0,
            boot_count: 0,
            valid: false,
            version: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub data_rev: u32,
    pub active_bank: Bank,
    pub banks: [BankInfo; 2],
    pub update_in_progress: Option<Bank>,
    pub rollback_occurred: bool,
    pub sequence: u32,
}

impl Metadata {
    /// Factory state after a monolithic flash: bank A trusted with zeroed
    /// size and CRC (the first-boot special case), bank B empty.
    pub fn factory() -> Self {
        Self {
            data_rev: METADATA_DATA_REV,
            active_bank: Bank::A,
            banks: [
                BankInfo {
                    valid: true,
                    version: "factory".to_string(),
                    ..BankInfo::default()
                },
                BankInfo::default(),
            ],
            update_in_progress: None,
            rollback_occurred: false,
            sequence: 1,
        }
    }

    pub fn bank(&self, bank: Bank) -> &BankInfo {
        &self.banks[bank.index()]
    }

    pub fn bank_mut(&mut self, bank: Bank) -> &mut BankInfo {
        &mut self.banks[bank.index()]
    }

    /// Switch to the opposite bank if it is marked valid, zero its boot
    /// count, and raise the rollback flag.
    pub fn trigger_rollback(&mut self) -> Result<Bank, UpdateError> {
        let other = self.active_bank.opposite();
        if !self.bank(other).valid {
            return Err(UpdateError::NoValidBank);
        }
        self.active_bank = other;
        self.bank_mut(other).boot_count = 0;
        self.rollback_occurred = true;
        tracing::warn!(bank = %other, "rollback to opposite bank");
        Ok(other)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(METADATA_LEN);
        out.extend_from_slice(&self.data_rev.to_le_bytes());
        out.push(self.active_bank.index() as u8);
        for info in &self.banks {
            out.extend_from_slice(&info.crc32.to_le_bytes());
            out.extend_from_slice(&info.size.to_le_bytes());
            out.push(info.boot_count);
            out.push(u8::from(info.valid));
            let name = info.version.as_bytes();
            let n = name.len().min(VERSION_WIDTH);
            out.extend_from_slice(&name[..n]);
            out.resize(out.len() + (VERSION_WIDTH - n), 0);
        }
        out.push(match self.update_in_progress {
            None => 0,
            Some(Bank::A) => 1,
            Some(Bank::B) => 2,
        });
        out.push(u8::from(self.rollback_occurred));
        out.extend_from_slice(&self.sequence.to_le_bytes());
        let self_crc = crc32(&out);
        out.extend_from_slice(&self_crc.to_le_bytes());
        out
    }

    /// Decode and self-verify one copy. Trailing bytes beyond the known
    /// record length are ignored.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < METADATA_LEN {
            return None;
        }
        let body = &buf[..METADATA_LEN - 4];
        let stored = u32::from_le_bytes([
            buf[METADATA_LEN - 4],
            buf[METADATA_LEN - 3],
            buf[METADATA_LEN - 2],
            buf[METADATA_LEN - 1],
        ]);
        if crc32(body) != stored {
            return None;
        }

        let u32_at = |i: usize| u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        let data_rev = u32_at(0);
        let active_bank = match buf[4] {
            0 => Bank::A,
            1 => Bank::B,
            _ => return None,
        };
        let mut banks: [BankInfo; 2] = [BankInfo::default(), BankInfo::default()];
        let mut pos = 5;
        for info in banks.iter_mut() {
            info.crc32 = u32_at(pos);
            info.size = u32_at(pos + 4);
            info.boot_count = buf[pos + 8];
            info.valid = buf[pos + 9] != 0;
            let raw = &buf[pos + 10..pos + 10 + VERSION_WIDTH];
            let end = raw.iter().position(|&b| b == 0).unwrap_or(VERSION_WIDTH);
            info.version = String::from_utf8_lossy(&raw[..end]).into_owned();
            pos += 10 + VERSION_WIDTH;
        }
        let update_in_progress = match buf[pos] {
            0 => None,
            1 => Some(Bank::A),
            2 => Some(Bank::B),
            _ => return None,
        };
        let rollback_occurred = buf[pos + 1] != 0;
        let sequence = u32_at(pos + 2);

        Some(Self {
            data_rev,
            active_bank,
            banks,
            update_in_progress,
            rollback_occurred,
            sequence,
        })
    }
}

const COPY_OFFSETS: [u32; 2] = [METADATA_PRIMARY, METADATA_SECONDARY];

fn read_copy(flash: &impl Flash, offset: u32) -> Option<Metadata> {
    let mut buf = vec![0u8; METADATA_LEN];
    flash.read(offset, &mut buf).ok()?;
    Metadata::decode(&buf)
}

/// Read both copies; the one with the higher sequence number and a valid
/// self-CRC wins.
pub fn read_metadata(flash: &impl Flash) -> Option<Metadata> {
    let copies = [
        read_copy(flash, COPY_OFFSETS[0]),
        read_copy(flash, COPY_OFFSETS[1]),
    ];
    match (&copies[0], &copies[1]) {
        (Some(a), Some(b)) => {
            if a.sequence >= b.sequence {
                copies[0].clone()
            } else {
                copies[1].clone()
            }
        }
        (Some(_), None) => copies[0].clone(),
        (None, Some(_)) => copies[1].clone(),
        (None, None) => None,
    }
}

fn program_copy(flash: &mut impl Flash, offset: u32, meta: &Metadata) -> Result<(), UpdateError> {
    let mut encoded = meta.encode();
    let rem = encoded.len() % FLASH_PAGE as usize;
    if rem != 0 {
        encoded.resize(encoded.len() + (FLASH_PAGE as usize - rem), 0xff);
    }
    flash.erase(offset, FLASH_SECTOR)?;
    flash.program(offset, &encoded)?;
    match read_copy(flash, offset) {
        Some(back) if back == *meta => Ok(()),
        _ => Err(UpdateError::MetadataWrite),
    }
}

/// Persist `meta` into the copy that lost the last read (or the primary
/// when no copy is valid), bumping the sequence number so the new copy
/// wins the next scan. One retry on failure, then the error surfaces.
pub fn write_metadata(flash: &mut impl Flash, meta: &mut Metadata) -> Result<(), UpdateError> {
    let copies = [
        read_copy(flash, COPY_OFFSETS[0]),
        read_copy(flash, COPY_OFFSETS[1]),
    ];
    let max_seq = copies
        .iter()
        .flatten()
        .map(|m| m.sequence)
        .max()
        .unwrap_or(0);
    let target = match (&copies[0], &copies[1]) {
        (Some(a), Some(b)) => {
            if a.sequence >= b.sequence {
                COPY_OFFSETS[1]
            } else {
                COPY_OFFSETS[0]
            }
        }
        (Some(_), None) => COPY_OFFSETS[1],
        _ => COPY_OFFSETS[0],
    };
    meta.sequence = max_seq.wrapping_add(1);

    if program_copy(flash, target, meta).is_ok() {
        return Ok(());
    }
    tracing::warn!(offset = target, "metadata write failed, retrying once");
    program_copy(flash, target, meta).map_err(|_| UpdateError::MetadataWrite)
}

/// Load the metadata, initializing the factory record on a blank device.
pub fn init_metadata(flash: &mut impl Flash) -> Result<Metadata, UpdateError> {
    if let Some(meta) = read_metadata(flash) {
        return Ok(meta);
    }
    let mut meta = Metadata::factory();
    write_metadata(flash, &mut meta)?;
    tracing::info!("factory metadata initialized");
    Ok(meta)
}

/// Bank validation: the valid flag must be set, the size must fit the
/// bank, and the image CRC must match. A zero size with a zero CRC is the
/// first-boot-after-monolithic-flash special case and is trusted so the
/// fresh firmware can initialize its own record.
pub fn validate_bank(flash: &impl Flash, meta: &Metadata, bank: Bank) -> bool {
    let info = meta.bank(bank);
    if !info.valid {
        return false;
    }
    if info.size == 0 && info.crc32 == 0 {
        tracing::info!(bank = %bank, "first boot, validation skipped");
        return true;
    }
    if info.size == 0 || info.size > BANK_SIZE {
        return false;
    }
    match bank_crc(flash, bank, info.size) {
        Ok(actual) => {
            let ok = actual == info.crc32;
            if !ok {
                tracing::error!(
                    bank = %bank,
                    expected = info.crc32,
                    actual,
                    "bank crc mismatch"
                );
            }
            ok
        }
        Err(_) => false,
    }
}

/// CRC32 over `[bank base, bank base + size)`, streamed in page-sized
/// chunks.
pub fn bank_crc(flash: &impl Flash, bank: Bank, size: u32) -> Result<u32, UpdateError> {
    let mut ctx = crate::crc32::Crc32::new();
    let mut buf = [0u8; FLASH_PAGE as usize];
    let mut offset = bank.base();
    let mut remaining = size;
    while remaining > 0 {
        let n = remaining.min(FLASH_PAGE) as usize;
        flash.read(offset, &mut buf[..n])?;
        ctx.update(&buf[..n]);
        offset += n as u32;
        remaining -= n as u32;
    }
    Ok(ctx.finalize())
}
