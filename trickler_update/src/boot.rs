//! Bootloader bank selection.
//!
//! This is the decision core of the bootloader program: everything up to
//! (but not including) the vector-table jump, expressed over the `Flash`
//! capability so the whole path is unit-testable. The real bootloader
//! calls [`select_boot_bank`] and jumps to `decision.image_base`.

use crate::layout::{Bank, MAX_BOOT_ATTEMPTS};
use crate::metadata::{init_metadata, validate_bank, write_metadata, Metadata};
use crate::UpdateError;
use trickler_traits::Flash;

#[derive(Debug, Clone)]
pub struct BootDecision {
    pub bank: Bank,
    /// Flash offset of the image to jump to.
    pub image_base: u32,
    /// True when this boot switched banks because of boot-count exhaustion
    /// or a failed validation.
    pub rollback_occurred: bool,
    /// Metadata as persisted for this boot (boot count already
    /// incremented).
    pub metadata: Metadata,
}

/// Pick the bank to boot.
///
/// 1. Load metadata (factory defaults on a blank device).
/// 2. Boot count at or past the limit triggers rollback.
/// 3. Validate the active bank; on failure roll back and re-validate.
///    Both banks bad is fatal.
/// 4. Increment the active bank's boot counter and persist.
pub fn select_boot_bank(flash: &mut impl Flash) -> Result<BootDecision, UpdateError> {
    let mut meta = init_metadata(flash)?;

    if let Some(target) = meta.update_in_progress {
        // Power was lost mid-activate; the staged bank gets its chance
        // through the normal validation + boot-count path.
        tracing::warn!(bank = %target, "update was in progress at boot");
    }

    let mut rolled_back = false;

    if meta.bank(meta.active_bank).boot_count >= MAX_BOOT_ATTEMPTS {
        tracing::warn!(
            bank = %meta.active_bank,
            boot_count = meta.bank(meta.active_bank).boot_count,
            "boot attempts exhausted"
        );
        meta.trigger_rollback()?;
        rolled_back = true;
    }

    if !validate_bank(flash, &meta, meta.active_bank) {
        tracing::error!(bank = %meta.active_bank, "active bank failed validation");
        meta.trigger_rollback()?;
        rolled_back = true;
        if !validate_bank(flash, &meta, meta.active_bank) {
            return Err(UpdateError::NoValidBank);
        }
    }

    let bank = meta.active_bank;
    let attempts = meta.bank(bank).boot_count.saturating_add(1);
    meta.bank_mut(bank).boot_count = attempts;
    write_metadata(flash, &mut meta)?;

    tracing::info!(bank = %bank, boot_count = meta.bank(bank).boot_count, "booting");
    Ok(BootDecision {
        bank,
        image_base: bank.base(),
        rollback_occurred: rolled_back,
        metadata: meta,
    })
}
