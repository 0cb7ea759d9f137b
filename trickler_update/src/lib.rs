#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
//! Dual-bank firmware updater.
//!
//! Two equal flash banks host independently bootable images; a
//! double-buffered metadata record (sequence numbers + self-CRC) tracks
//! which bank is active, how many times it has been booted, and whether an
//! update is mid-flight. The bootloader side (`boot`) and the application
//! side (`manager`) share one CRC32 implementation so the two can never
//! disagree on a bank's integrity.

pub mod boot;
pub mod crc32;
pub mod layout;
pub mod manager;
pub mod metadata;

pub use boot::{select_boot_bank, BootDecision};
pub use crc32::{crc32, Crc32};
pub use layout::{Bank, BANK_SIZE, MAX_BOOT_ATTEMPTS};
pub use manager::{UpdateManager, UpdateState, UpdateStatus};
pub use metadata::{read_metadata, write_metadata, BankInfo, Metadata};

use trickler_traits::FlashError;

#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("firmware size invalid for the bank")]
    InvalidSize,
    #[error("chunk must be 256-byte aligned (except the final chunk)")]
    MisalignedChunk,
    #[error("empty chunk")]
    EmptyChunk,
    #[error("data exceeds the declared firmware size")]
    Overflow,
    #[error("upload incomplete")]
    Incomplete,
    #[error("crc32 mismatch: expected {expected:#010x}, got {actual:#010x}")]
    CrcMismatch { expected: u32, actual: u32 },
    #[error("flash: {0}")]
    Flash(#[from] FlashError),
    #[error("metadata write failed")]
    MetadataWrite,
    #[error("no valid firmware bank")]
    NoValidBank,
}
