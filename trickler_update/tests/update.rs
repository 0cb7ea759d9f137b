use trickler_config::MemFlash;
use trickler_traits::{Flash, FLASH_PAGE};
use trickler_update::layout::{BANK_SIZE, METADATA_PRIMARY};
use trickler_update::metadata::{read_metadata, validate_bank, write_metadata};
use trickler_update::{crc32, select_boot_bank, Bank, UpdateError, UpdateManager, UpdateState};

fn flash() -> MemFlash {
    MemFlash::new(0x0020_0000)
}

/// A deterministic fake firmware image.
fn image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}

/// Write `data` into `bank` and mark it valid in metadata.
fn install_image(flash: &mut MemFlash, bank: Bank, data: &[u8]) {
    flash.erase(bank.base(), BANK_SIZE).unwrap();
    let mut padded = data.to_vec();
    let rem = padded.len() % FLASH_PAGE as usize;
    if rem != 0 {
        padded.resize(padded.len() + (FLASH_PAGE as usize - rem), 0xff);
    }
    flash.program(bank.base(), &padded).unwrap();

    let mut meta = read_metadata(flash).unwrap();
    {
        let info = meta.bank_mut(bank);
        info.valid = true;
        info.size = data.len() as u32;
        info.crc32 = crc32(data);
        info.boot_count = 0;
    }
    write_metadata(flash, &mut meta).unwrap();
}

#[test]
fn fresh_device_gets_factory_metadata() {
    let mut flash = flash();
    let manager = UpdateManager::new(&mut flash).expect("manager");
    let meta = manager.metadata().expect("metadata");
    assert_eq!(meta.active_bank, Bank::A);
    assert!(meta.bank(Bank::A).valid);
    assert!(!meta.bank(Bank::B).valid);
    assert_eq!(meta.update_in_progress, None);
}

#[test]
fn full_update_round_trip_promotes_the_staged_bank() {
    let mut flash = flash();
    let firmware = image(1000);
    let expected_crc = crc32(&firmware);

    let mut manager = UpdateManager::new(&mut flash).expect("manager");
    manager.start_update(1000, Some("2.0.0")).expect("start");
    assert_eq!(manager.status().state, UpdateState::Receiving);

    // Three aligned chunks plus a short final chunk, padded internally.
    manager.write_chunk(&firmware[..256]).expect("chunk");
    manager.write_chunk(&firmware[256..512]).expect("chunk");
    manager.write_chunk(&firmware[512..768]).expect("chunk");
    manager.write_chunk(&firmware[768..]).expect("final chunk");
    assert_eq!(manager.status().percent, 100);

    manager.finalize_update(expected_crc).expect("finalize");

    let meta = manager.metadata().expect("metadata");
    assert_eq!(meta.update_in_progress, None);
    assert!(meta.bank(Bank::B).valid);
    assert_eq!(meta.bank(Bank::B).boot_count, 0);
    assert_eq!(meta.bank(Bank::B).version, "2.0.0");
    assert!(validate_bank(manager.flash(), &meta, Bank::B));

    let activated = manager.activate().expect("activate");
    assert_eq!(activated, Bank::B);
    drop(manager);

    // "Reboot": the bootloader picks the new bank and counts the attempt.
    let decision = select_boot_bank(&mut flash).expect("boot");
    assert_eq!(decision.bank, Bank::B);
    assert!(!decision.rollback_occurred);
    assert_eq!(decision.metadata.bank(Bank::B).boot_count, 1);
}

#[test]
fn nonfinal_chunks_must_be_page_aligned() {
    let mut flash = flash();
    let mut manager = UpdateManager::new(&mut flash).expect("manager");
    manager.start_update(1000, None).expect("start");
    let err = manager.write_chunk(&[0u8; 100]).unwrap_err();
    assert!(matches!(err, UpdateError::MisalignedChunk));
}

#[test]
fn writing_past_the_declared_size_is_an_error() {
    let mut flash = flash();
    let mut manager = UpdateManager::new(&mut flash).expect("manager");
    manager.start_update(256, None).expect("start");
    manager.write_chunk(&[0u8; 256]).expect("chunk");
    let err = manager.write_chunk(&[0u8; 256]).unwrap_err();
    assert!(matches!(err, UpdateError::Overflow));
}

#[test]
fn crc_mismatch_invalidates_the_target_bank() {
    let mut flash = flash();
    let firmware = image(512);

    let mut manager = UpdateManager::new(&mut flash).expect("manager");
    manager.start_update(512, None).expect("start");
    manager.write_chunk(&firmware).expect("chunk");
    let err = manager.finalize_update(0x1234_5678).unwrap_err();
    assert!(matches!(err, UpdateError::CrcMismatch { .. }));

    let meta = manager.metadata().expect("metadata");
    assert!(!meta.bank(Bank::B).valid);
    assert_eq!(meta.update_in_progress, None);
    assert_eq!(manager.status().state, UpdateState::Error);
}

#[test]
fn cancel_clears_in_progress_and_invalidates_target() {
    let mut flash = flash();
    let mut manager = UpdateManager::new(&mut flash).expect("manager");
    manager.start_update(1024, None).expect("start");
    manager.write_chunk(&image(256)).expect("chunk");
    manager.cancel_update();

    let meta = manager.metadata().expect("metadata");
    assert_eq!(meta.update_in_progress, None);
    assert!(!meta.bank(Bank::B).valid);
    assert_eq!(manager.status().state, UpdateState::Idle);
}

#[test]
fn torn_metadata_write_leaves_the_previous_generation() {
    let mut flash = flash();
    let mut manager = UpdateManager::new(&mut flash).expect("manager");
    manager.confirm_boot().expect("write one generation");
    let before = manager.metadata().expect("metadata");
    drop(manager);

    // Next generation lands in the primary sector; tear it.
    let mut meta = before.clone();
    meta.rollback_occurred = true;
    write_metadata(&mut flash, &mut meta).expect("write");
    flash.flip_byte(METADATA_PRIMARY + 9);

    let survivor = read_metadata(&flash).expect("survivor");
    assert_eq!(survivor.sequence, before.sequence);
    assert!(!survivor.rollback_occurred);
}

/// Seed scenario: three failed boots on bank A with a valid bank B flips
/// the active bank and restarts its boot count.
#[test]
fn bootloader_rolls_back_after_exhausted_boot_attempts() {
    let mut flash = flash();
    {
        let _ = UpdateManager::new(&mut flash).expect("manager");
    }
    install_image(&mut flash, Bank::B, &image(700));

    let mut meta = read_metadata(&flash).unwrap();
    meta.bank_mut(Bank::A).boot_count = 3;
    write_metadata(&mut flash, &mut meta).unwrap();

    let decision = select_boot_bank(&mut flash).expect("boot");
    assert_eq!(decision.bank, Bank::B);
    assert!(decision.rollback_occurred);
    assert!(decision.metadata.rollback_occurred);
    // Reset by the rollback, then incremented once for this boot.
    assert_eq!(decision.metadata.bank(Bank::B).boot_count, 1);
}

#[test]
fn bootloader_rolls_back_when_active_bank_fails_validation() {
    let mut flash = flash();
    {
        let _ = UpdateManager::new(&mut flash).expect("manager");
    }
    install_image(&mut flash, Bank::B, &image(300));

    // Corrupt bank A's record: nonzero size with a CRC that cannot match.
    let mut meta = read_metadata(&flash).unwrap();
    meta.bank_mut(Bank::A).size = 512;
    meta.bank_mut(Bank::A).crc32 = 0xdead_beef;
    write_metadata(&mut flash, &mut meta).unwrap();

    let decision = select_boot_bank(&mut flash).expect("boot");
    assert_eq!(decision.bank, Bank::B);
    assert!(decision.rollback_occurred);
}

#[test]
fn both_banks_invalid_is_fatal() {
    let mut flash = flash();
    {
        let _ = UpdateManager::new(&mut flash).expect("manager");
    }
    let mut meta = read_metadata(&flash).unwrap();
    meta.bank_mut(Bank::A).valid = false;
    meta.bank_mut(Bank::B).valid = false;
    write_metadata(&mut flash, &mut meta).unwrap();

    let err = select_boot_bank(&mut flash).unwrap_err();
    assert!(matches!(err, UpdateError::NoValidBank));
}

/// Seed scenario: power loss after finalize but before activate. The old
/// bank stays live; the staged bank is valid and can be promoted later.
#[test]
fn power_loss_between_finalize_and_activate_is_recoverable() {
    let mut flash = flash();
    let firmware = image(800);
    let expected_crc = crc32(&firmware);

    {
        let mut manager = UpdateManager::new(&mut flash).expect("manager");
        manager.start_update(800, Some("3.1.0")).expect("start");
        manager.write_chunk(&firmware[..512]).expect("chunk");
        manager.write_chunk(&firmware[512..]).expect("chunk");
        manager.finalize_update(expected_crc).expect("finalize");
        // Power loss here: manager dropped without activate.
    }

    let decision = select_boot_bank(&mut flash).expect("boot");
    assert_eq!(decision.bank, Bank::A, "old firmware still live");
    let meta = decision.metadata;
    assert!(meta.bank(Bank::B).valid);
    assert_eq!(meta.update_in_progress, None);

    // A later explicit activation promotes the staged bank.
    let mut manager = UpdateManager::new(&mut flash).expect("manager");
    manager.activate_bank(Bank::B).expect("activate staged bank");
    drop(manager);
    let decision = select_boot_bank(&mut flash).expect("boot");
    assert_eq!(decision.bank, Bank::B);
}

#[test]
fn confirm_boot_resets_the_boot_counter() {
    let mut flash = flash();
    {
        let _ = UpdateManager::new(&mut flash).expect("manager");
    }
    // Two unconfirmed boots.
    select_boot_bank(&mut flash).expect("boot");
    select_boot_bank(&mut flash).expect("boot");
    assert_eq!(read_metadata(&flash).unwrap().bank(Bank::A).boot_count, 2);

    let mut manager = UpdateManager::new(&mut flash).expect("manager");
    manager.confirm_boot().expect("confirm");
    let meta = manager.metadata().expect("metadata");
    assert_eq!(meta.bank(Bank::A).boot_count, 0);
}

#[test]
fn interrupted_update_flag_is_cleared_on_startup() {
    let mut flash = flash();
    {
        let mut manager = UpdateManager::new(&mut flash).expect("manager");
        manager.start_update(1024, None).expect("start");
        manager.write_chunk(&image(256)).expect("chunk");
        // Power loss mid-receive.
    }
    assert_eq!(
        read_metadata(&flash).unwrap().update_in_progress,
        Some(Bank::B)
    );

    let manager = UpdateManager::new(&mut flash).expect("manager");
    let meta = manager.metadata().expect("metadata");
    assert_eq!(meta.update_in_progress, None);
}

#[test]
fn flash_write_failure_aborts_and_invalidates() {
    let mut flash = flash();
    let mut manager = UpdateManager::new(&mut flash).expect("manager");
    manager.start_update(512, None).expect("start");
    manager.flash_mut().fail_next_op();
    let err = manager.write_chunk(&image(256)).unwrap_err();
    assert!(matches!(err, UpdateError::Flash(_)));
    let meta = manager.metadata().expect("metadata");
    assert!(!meta.bank(Bank::B).valid);
    assert_eq!(meta.update_in_progress, None);
    assert_eq!(manager.status().state, UpdateState::Error);
}
