//! Application-side update protocol: stage into the inactive bank, verify,
//! flip the active bank, and confirm a healthy boot.

use crate::crc32::Crc32;
use crate::layout::{Bank, BANK_SIZE};
use crate::metadata::{
    bank_crc, init_metadata, read_metadata, validate_bank, write_metadata, Metadata,
};
use crate::UpdateError;
use trickler_traits::{Flash, FLASH_PAGE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateState {
    Idle,
    Receiving,
    Validating,
    Complete,
    Error,
}

/// Snapshot for the status surface (the REST adapter reads this).
#[derive(Debug, Clone)]
pub struct UpdateStatus {
    pub state: UpdateState,
    pub bytes_received: u32,
    pub bytes_total: u32,
    pub percent: u8,
    pub target: Option<Bank>,
    pub error: Option<String>,
}

pub struct UpdateManager<F: Flash> {
    flash: F,
    state: UpdateState,
    target: Option<Bank>,
    expected_size: u32,
    bytes_written: u32,
    write_offset: u32,
    version: String,
    crc: Crc32,
    error: Option<String>,
}

impl<F: Flash> UpdateManager<F> {
    /// Bind to the flash device, initializing factory metadata on a blank
    /// part and clearing the in-progress flag left by an interrupted
    /// update.
    pub fn new(mut flash: F) -> Result<Self, UpdateError> {
        let mut meta = init_metadata(&mut flash)?;
        if meta.update_in_progress.is_some() {
            tracing::warn!("previous update was interrupted, clearing flag");
            meta.update_in_progress = None;
            write_metadata(&mut flash, &mut meta)?;
        }
        Ok(Self {
            flash,
            state: UpdateState::Idle,
            target: None,
            expected_size: 0,
            bytes_written: 0,
            write_offset: 0,
            version: String::new(),
            crc: Crc32::new(),
            error: None,
        })
    }

    pub fn metadata(&self) -> Result<Metadata, UpdateError> {
        read_metadata(&self.flash).ok_or(UpdateError::MetadataWrite)
    }

    pub fn active_bank(&self) -> Result<Bank, UpdateError> {
        Ok(self.metadata()?.active_bank)
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    pub fn into_flash(self) -> F {
        self.flash
    }

    fn fail(&mut self, message: &str) {
        self.error = Some(message.to_string());
        self.state = UpdateState::Error;
        tracing::error!(message, "firmware update failed");
    }

    /// Abort bookkeeping shared by failure paths and `cancel`: the target
    /// bank is no longer trustworthy.
    fn invalidate_target(&mut self) {
        let Some(target) = self.target else { return };
        match read_metadata(&self.flash) {
            Some(mut meta) => {
                meta.bank_mut(target).valid = false;
                meta.update_in_progress = None;
                if write_metadata(&mut self.flash, &mut meta).is_err() {
                    tracing::error!("failed to invalidate target bank metadata");
                }
            }
            None => tracing::error!("metadata unreadable while invalidating target"),
        }
    }

    /// Begin an update of `size` bytes into the inactive bank: mark it
    /// in-progress, erase the whole bank, reset the streaming CRC.
    pub fn start_update(&mut self, size: u32, version: Option<&str>) -> Result<(), UpdateError> {
        if matches!(self.state, UpdateState::Receiving | UpdateState::Validating) {
            return Err(UpdateError::InvalidState("update already in progress"));
        }
        if size == 0 || size > BANK_SIZE {
            return Err(UpdateError::InvalidSize);
        }

        let mut meta = self.metadata()?;
        let target = meta.active_bank.opposite();
        meta.update_in_progress = Some(target);
        write_metadata(&mut self.flash, &mut meta)?;

        tracing::info!(size, bank = %target, "starting firmware update");
        self.flash.erase(target.base(), BANK_SIZE)?;

        self.target = Some(target);
        self.expected_size = size;
        self.bytes_written = 0;
        self.write_offset = target.base();
        self.version = version.unwrap_or("uploaded").to_string();
        self.crc = Crc32::new();
        self.error = None;
        self.state = UpdateState::Receiving;
        Ok(())
    }

    /// Write one chunk. Chunks must be 256-byte aligned except the final
    /// one, which is padded to the next page with 0xFF; the streaming CRC
    /// absorbs only the logical bytes.
    pub fn write_chunk(&mut self, data: &[u8]) -> Result<(), UpdateError> {
        if self.state != UpdateState::Receiving {
            return Err(UpdateError::InvalidState("not receiving"));
        }
        if data.is_empty() {
            return Err(UpdateError::EmptyChunk);
        }
        let len = data.len() as u32;
        if self.bytes_written + len > self.expected_size {
            return Err(UpdateError::Overflow);
        }
        let is_last = self.bytes_written + len == self.expected_size;
        if len % FLASH_PAGE != 0 && !is_last {
            return Err(UpdateError::MisalignedChunk);
        }

        self.crc.update(data);

        let mut padded;
        let write_data: &[u8] = if len % FLASH_PAGE == 0 {
            data
        } else {
            let padded_len = (len + FLASH_PAGE - 1) / FLASH_PAGE * FLASH_PAGE;
            padded = data.to_vec();
            padded.resize(padded_len as usize, 0xff);
            &padded
        };

        if let Err(e) = self.flash.program(self.write_offset, write_data) {
            self.fail("flash write failed");
            self.invalidate_target();
            return Err(e.into());
        }

        self.bytes_written += len;
        self.write_offset += write_data.len() as u32;
        tracing::debug!(
            received = self.bytes_written,
            total = self.expected_size,
            "chunk written"
        );
        Ok(())
    }

    /// Verify the streamed CRC against `expected_crc32`, re-verify from
    /// flash, then mark the target bank valid and clear the in-progress
    /// flag.
    pub fn finalize_update(&mut self, expected_crc32: u32) -> Result<(), UpdateError> {
        if self.state != UpdateState::Receiving {
            return Err(UpdateError::InvalidState("not receiving"));
        }
        if self.bytes_written != self.expected_size {
            return Err(UpdateError::Incomplete);
        }
        let Some(target) = self.target else {
            return Err(UpdateError::InvalidState("no target bank"));
        };
        self.state = UpdateState::Validating;

        let streamed = self.crc.finalize();
        if streamed != expected_crc32 {
            self.fail("streamed crc mismatch");
            self.invalidate_target();
            return Err(UpdateError::CrcMismatch {
                expected: expected_crc32,
                actual: streamed,
            });
        }

        // Trust nothing: read the bank back out of flash and recompute.
        let flashed = bank_crc(&self.flash, target, self.expected_size)?;
        if flashed != expected_crc32 {
            self.fail("flash readback crc mismatch");
            self.invalidate_target();
            return Err(UpdateError::CrcMismatch {
                expected: expected_crc32,
                actual: flashed,
            });
        }

        let mut meta = self.metadata()?;
        {
            let info = meta.bank_mut(target);
            info.crc32 = expected_crc32;
            info.size = self.expected_size;
            info.boot_count = 0;
            info.valid = true;
            info.version = self.version.clone();
        }
        meta.update_in_progress = None;
        write_metadata(&mut self.flash, &mut meta)?;

        self.state = UpdateState::Complete;
        tracing::info!(bank = %target, "firmware staged and verified");
        Ok(())
    }

    /// Abandon the update: the target bank is marked invalid and the
    /// in-progress flag cleared, whatever was already written.
    pub fn cancel_update(&mut self) {
        if self.state != UpdateState::Idle {
            self.invalidate_target();
        }
        self.state = UpdateState::Idle;
        self.target = None;
        self.bytes_written = 0;
        self.expected_size = 0;
        self.error = None;
        tracing::info!("firmware update cancelled");
    }

    /// Switch the active bank to the staged one. The caller reboots.
    pub fn activate(&mut self) -> Result<Bank, UpdateError> {
        if self.state != UpdateState::Complete {
            return Err(UpdateError::InvalidState("no staged firmware"));
        }
        let Some(target) = self.target else {
            return Err(UpdateError::InvalidState("no target bank"));
        };
        self.activate_bank(target)?;
        self.state = UpdateState::Idle;
        Ok(target)
    }

    /// Promote an already-valid bank (used after a power loss between
    /// finalize and activate, when the staging state is gone but the bank
    /// is good).
    pub fn activate_bank(&mut self, bank: Bank) -> Result<(), UpdateError> {
        let mut meta = self.metadata()?;
        if !validate_bank(&self.flash, &meta, bank) {
            return Err(UpdateError::NoValidBank);
        }
        meta.active_bank = bank;
        write_metadata(&mut self.flash, &mut meta)?;
        tracing::info!(bank = %bank, "bank activated, reboot to take effect");
        Ok(())
    }

    /// Switch back to the other bank if it is valid. The caller reboots.
    pub fn rollback(&mut self) -> Result<Bank, UpdateError> {
        let mut meta = self.metadata()?;
        let bank = meta.trigger_rollback()?;
        write_metadata(&mut self.flash, &mut meta)?;
        Ok(bank)
    }

    /// Called by the application once it reaches a healthy steady state;
    /// zeroes the active bank's boot counter so the bootloader stops
    /// counting toward rollback.
    pub fn confirm_boot(&mut self) -> Result<(), UpdateError> {
        let mut meta = self.metadata()?;
        let active = meta.active_bank;
        meta.bank_mut(active).boot_count = 0;
        write_metadata(&mut self.flash, &mut meta)?;
        tracing::info!(bank = %active, "boot confirmed");
        Ok(())
    }

    pub fn did_rollback_occur(&self) -> Result<bool, UpdateError> {
        Ok(self.metadata()?.rollback_occurred)
    }

    pub fn clear_rollback_flag(&mut self) -> Result<(), UpdateError> {
        let mut meta = self.metadata()?;
        meta.rollback_occurred = false;
        write_metadata(&mut self.flash, &mut meta)
    }

    pub fn status(&self) -> UpdateStatus {
        let percent = if self.expected_size > 0 {
            ((u64::from(self.bytes_written) * 100) / u64::from(self.expected_size)) as u8
        } else {
            0
        };
        UpdateStatus {
            state: self.state,
            bytes_received: self.bytes_written,
            bytes_total: self.expected_size,
            percent,
            target: self.target,
            error: self.error.clone(),
        }
    }
}
