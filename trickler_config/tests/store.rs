use trickler_config::store::{
    load_or_default, read_region, read_wifi, write_region, write_wifi, CHARGE_REGION,
    PROFILE_REGION,
};
use trickler_config::{ChargeSettings, MemFlash, Profile, ProfileStore, WifiConfig};

fn flash() -> MemFlash {
    MemFlash::new(0x0020_0000)
}

#[test]
fn charge_settings_round_trip() {
    let mut flash = flash();
    let mut cfg = ChargeSettings::default();
    cfg.fine_stop = 0.02;
    cfg.precharge_enable = true;
    write_region(&mut flash, CHARGE_REGION, &cfg).expect("write");
    let back: ChargeSettings = read_region(&flash, CHARGE_REGION).expect("read");
    assert_eq!(back, cfg);
}

#[test]
fn erased_region_reads_as_absent() {
    let flash = flash();
    assert!(read_region::<ChargeSettings>(&flash, CHARGE_REGION).is_none());
    let defaults: ChargeSettings = load_or_default(&flash, CHARGE_REGION);
    assert_eq!(defaults, ChargeSettings::default());
}

#[test]
fn corrupt_region_falls_back_to_defaults() {
    let mut flash = flash();
    let cfg = ChargeSettings {
        coarse_stop: 3.0,
        ..ChargeSettings::default()
    };
    write_region(&mut flash, CHARGE_REGION, &cfg).expect("write");
    // Flip one body byte: the checksum no longer holds.
    flash.flip_byte(CHARGE_REGION + 14);
    assert!(read_region::<ChargeSettings>(&flash, CHARGE_REGION).is_none());
    let defaults: ChargeSettings = load_or_default(&flash, CHARGE_REGION);
    assert_eq!(defaults.coarse_stop, ChargeSettings::default().coarse_stop);
}

#[test]
fn profile_store_round_trip_keeps_selection() {
    let mut flash = flash();
    let mut profiles = ProfileStore::default();
    profiles.profiles[3] = Profile {
        name: "H4350".into(),
        coarse_kp: 0.4,
        ..Profile::default()
    };
    assert!(profiles.select(3));
    write_region(&mut flash, PROFILE_REGION, &profiles).expect("write");
    let back: ProfileStore = read_region(&flash, PROFILE_REGION).expect("read");
    assert_eq!(back.selected, 3);
    assert_eq!(back.selected().name, "H4350");
    assert_eq!(back, profiles);
}

#[test]
fn wifi_round_trip_and_corruption() {
    let mut flash = flash();
    assert!(read_wifi(&flash).is_none());

    let cfg = WifiConfig {
        ssid: "workshop".into(),
        password: "correct horse".into(),
        auth_method: 2,
        timeout_ms: 30_000,
        enabled: true,
    };
    write_wifi(&mut flash, &cfg).expect("write");
    assert_eq!(read_wifi(&flash), Some(cfg));

    // A corrupted password byte must invalidate the checksum.
    flash.flip_byte(trickler_config::WIFI_REGION + 40);
    assert!(read_wifi(&flash).is_none());
}

#[test]
fn write_failure_surfaces_as_store_error() {
    let mut flash = flash();
    flash.fail_next_op();
    let err = write_region(&mut flash, CHARGE_REGION, &ChargeSettings::default());
    assert!(err.is_err());
}
