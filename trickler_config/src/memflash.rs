//! RAM-backed flash with real erase/program semantics, for tests and the
//! simulation backends.

use std::sync::{Arc, Mutex};
use trickler_traits::{Flash, FlashError, FLASH_PAGE, FLASH_SECTOR};

pub struct MemFlash {
    data: Vec<u8>,
    /// When set, the next program/erase reports an I/O failure once.
    fail_next: bool,
}

impl MemFlash {
    /// Fresh device, fully erased (0xFF).
    pub fn new(capacity: u32) -> Self {
        Self {
            data: vec![0xff; capacity as usize],
            fail_next: false,
        }
    }

    /// Arm a single injected write/erase failure.
    pub fn fail_next_op(&mut self) {
        self.fail_next = true;
    }

    /// Corrupt one byte, for torn-write and checksum tests.
    pub fn flip_byte(&mut self, offset: u32) {
        let i = offset as usize;
        if i < self.data.len() {
            self.data[i] ^= 0xff;
        }
    }

    fn check_range(&self, offset: u32, len: usize) -> Result<(), FlashError> {
        let end = (offset as usize).checked_add(len).ok_or(FlashError::OutOfBounds)?;
        if end > self.data.len() {
            return Err(FlashError::OutOfBounds);
        }
        Ok(())
    }

    fn take_fault(&mut self) -> bool {
        let f = self.fail_next;
        self.fail_next = false;
        f
    }
}

impl Flash for MemFlash {
    fn capacity(&self) -> u32 {
        self.data.len() as u32
    }

    fn read(&self, offset: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        self.check_range(offset, buf.len())?;
        buf.copy_from_slice(&self.data[offset as usize..offset as usize + buf.len()]);
        Ok(())
    }

    fn erase(&mut self, offset: u32, len: u32) -> Result<(), FlashError> {
        if offset % FLASH_SECTOR != 0 || len % FLASH_SECTOR != 0 {
            return Err(FlashError::Misaligned);
        }
        self.check_range(offset, len as usize)?;
        if self.take_fault() {
            return Err(FlashError::Io);
        }
        self.data[offset as usize..(offset + len) as usize].fill(0xff);
        Ok(())
    }

    fn program(&mut self, offset: u32, data: &[u8]) -> Result<(), FlashError> {
        if offset % FLASH_PAGE != 0 || data.len() % FLASH_PAGE as usize != 0 {
            return Err(FlashError::Misaligned);
        }
        self.check_range(offset, data.len())?;
        if self.take_fault() {
            return Err(FlashError::Io);
        }
        // NOR semantics: programming can only clear bits.
        for (dst, src) in self.data[offset as usize..offset as usize + data.len()]
            .iter_mut()
            .zip(data)
        {
            *dst &= *src;
        }
        Ok(())
    }
}

/// One flash device shared between the config store and the firmware
/// updater, serialized by a mutex as the concurrency model requires.
#[derive(Clone)]
pub struct SharedFlash(Arc<Mutex<MemFlash>>);

impl SharedFlash {
    pub fn new(flash: MemFlash) -> Self {
        Self(Arc::new(Mutex::new(flash)))
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut MemFlash) -> R) -> R {
        let mut guard = self.0.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }
}

impl Flash for SharedFlash {
    fn capacity(&self) -> u32 {
        self.with(|f| f.capacity())
    }

    fn read(&self, offset: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        let guard = self.0.lock().unwrap_or_else(|e| e.into_inner());
        guard.read(offset, buf)
    }

    fn erase(&mut self, offset: u32, len: u32) -> Result<(), FlashError> {
        self.with(|f| f.erase(offset, len))
    }

    fn program(&mut self, offset: u32, data: &[u8]) -> Result<(), FlashError> {
        self.with(|f| f.program(offset, data))
    }
}
