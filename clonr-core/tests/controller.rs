mod common;

use clonr_core::settings::MemorySettings;
use clonr_core::{
    DeviceChange, DeviceIdentity, ErrorCategory, HotplugEvent, Imager, ImagingConfig, ImagingState,
    Mode,
};
use common::{Counters, FakePlatform, patterned_disk};
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn imager(platform: &FakePlatform, chunk_sectors: u64) -> Imager {
    let config = ImagingConfig {
        chunk_sectors,
        ..Default::default()
    };
    Imager::new(
        Arc::new(platform.clone()),
        config,
        Box::new(MemorySettings::default()),
    )
}

fn platform_with_card() -> FakePlatform {
    let platform = FakePlatform::new();
    platform.add_disk_with(1, 512, patterned_disk(512, 64, 40));
    platform.add_volume("E:", 1);
    platform
}

/// Blocks the first device read until the returned sender fires.
fn gate_first_read(platform: &FakePlatform) -> mpsc::Sender<()> {
    let (tx, rx) = mpsc::channel::<()>();
    let rx = Mutex::new(rx);
    let fired = AtomicBool::new(false);
    platform.on_read(move |_| {
        if !fired.swap(true, Ordering::SeqCst) {
            let _ = rx.lock().unwrap().recv_timeout(Duration::from_secs(10));
        }
    });
    tx
}

fn drain_until_idle(updates: &mpsc::Receiver<ImagingState>) -> Vec<ImagingState> {
    let mut states = Vec::new();
    while let Ok(state) = updates.recv_timeout(Duration::from_secs(10)) {
        let idle = !state.is_busy();
        states.push(state);
        if idle {
            break;
        }
    }
    states
}

#[test]
fn create_publishes_progress_and_succeeds() {
    let platform = platform_with_card();
    let imager = imager(&platform, 16);
    let devices = imager.enumerate().unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(imager.selected_device().map(|d| d.identity), Some(DeviceIdentity(1)));

    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("card.img");
    let updates = imager.subscribe();
    imager.start_create(DeviceIdentity(1), image.clone(), true).unwrap();
    let states = drain_until_idle(&updates);
    let last = imager.wait();

    assert_eq!(states.first().and_then(|s| s.busy_mode), Some(Mode::Create));
    assert!(states.iter().any(|s| s.busy_mode == Some(Mode::Verify)));
    assert!(states.iter().filter(|s| s.is_busy()).all(|s| s.can_cancel && !s.can_read));

    assert_eq!(last.message, "Create disk image succeeded.");
    assert_eq!(last.progress, 0.0);
    assert!(!last.can_cancel);
    assert!(last.can_read && last.can_write);
    let outcome = last.last_outcome.unwrap();
    assert!(outcome.verified);
    assert_eq!(outcome.digest.map(|d| d.len()), Some(64));
    assert!(image.exists());
}

#[test]
fn second_operation_is_refused_while_busy() {
    let platform = platform_with_card();
    let imager = imager(&platform, 16);
    imager.enumerate().unwrap();
    let release = gate_first_read(&platform);

    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("card.img");
    imager.start_create(DeviceIdentity(1), image.clone(), false).unwrap();
    assert!(imager.is_busy());

    let err = imager
        .start_restore(DeviceIdentity(1), image.clone(), false)
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Busy);
    let err = imager.enumerate().unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Busy);

    release.send(()).unwrap();
    let state = imager.wait();
    assert_eq!(state.message, "Create disk image succeeded.");
}

#[test]
fn hotplug_during_an_operation_rescans_afterwards() {
    let platform = platform_with_card();
    let imager = imager(&platform, 16);
    imager.enumerate().unwrap();
    let listings = Counters::get(&platform.counters().listings);
    let release = gate_first_read(&platform);

    let dir = tempfile::tempdir().unwrap();
    imager
        .start_create(DeviceIdentity(1), dir.path().join("card.img"), false)
        .unwrap();

    platform.add_disk(2, 512, 128);
    platform.add_volume("F:", 2);
    let event = HotplugEvent {
        volume_hint: None,
        change: DeviceChange::Arrived,
    };
    assert!(imager.handle_hotplug(&event).is_none());
    assert_eq!(Counters::get(&platform.counters().listings), listings);

    release.send(()).unwrap();
    imager.wait();
    assert_eq!(Counters::get(&platform.counters().listings), listings + 1);
    assert_eq!(imager.devices().len(), 2);

    // Idle again, so the next event rescans immediately.
    let rescanned = imager.handle_hotplug(&event).unwrap().unwrap();
    assert_eq!(rescanned.len(), 2);
}

#[test]
fn self_imaging_is_rejected_synchronously() {
    let platform = platform_with_card();
    let dir = tempfile::tempdir().unwrap();
    platform.mount("E:", dir.path());
    let imager = imager(&platform, 16);
    imager.enumerate().unwrap();
    let opens = Counters::get(&platform.counters().device_opens);

    let err = imager
        .start_create(DeviceIdentity(1), dir.path().join("card.img"), false)
        .unwrap_err();

    assert_eq!(err.category(), ErrorCategory::File);
    let state = imager.state();
    assert!(!state.is_busy());
    assert_eq!(state.message, "Create disk image failed");
    assert_eq!(state.last_error_category, Some(ErrorCategory::File));
    assert_eq!(Counters::get(&platform.counters().device_opens), opens);
    assert_eq!(Counters::get(&platform.counters().volume_opens), 0);
}

#[test]
fn cancel_token_stops_the_worker() {
    let platform = platform_with_card();
    let imager = imager(&platform, 8);
    imager.enumerate().unwrap();
    let token = imager.cancel_token();
    platform.on_read(move |offset| {
        if offset == 8 * 512 {
            token.cancel();
        }
    });

    let dir = tempfile::tempdir().unwrap();
    imager
        .start_create(DeviceIdentity(1), dir.path().join("card.img"), true)
        .unwrap();
    let state = imager.wait();

    assert_eq!(state.message, "Create disk image cancelled.");
    assert!(state.last_outcome.unwrap().is_cancelled());
    assert_eq!(state.last_error_message, None);
    assert_eq!(Counters::get(&platform.counters().open_devices), 0);
    assert_eq!(Counters::get(&platform.counters().locked_volumes), 0);
}

#[test]
fn cancel_on_the_started_state_is_not_lost() {
    let platform = platform_with_card();
    let imager = imager(&platform, 8);
    imager.enumerate().unwrap();
    let release = gate_first_read(&platform);
    let token = imager.cancel_token();
    let updates = imager.subscribe();
    let canceller = std::thread::spawn(move || {
        while let Ok(state) = updates.recv_timeout(Duration::from_secs(10)) {
            if state.is_busy() {
                token.cancel();
                break;
            }
        }
        release.send(()).unwrap();
    });

    let dir = tempfile::tempdir().unwrap();
    imager
        .start_create(DeviceIdentity(1), dir.path().join("card.img"), false)
        .unwrap();
    canceller.join().unwrap();
    let state = imager.wait();

    assert_eq!(state.message, "Create disk image cancelled.");
    assert!(state.last_outcome.unwrap().is_cancelled());
}

#[test]
fn failures_keep_category_and_message() {
    let platform = FakePlatform::new();
    platform.add_disk(1, 512, 16);
    platform.add_volume("E:", 1);
    let imager = imager(&platform, 16);
    imager.enumerate().unwrap();

    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("missing.img");
    imager.start_restore(DeviceIdentity(1), missing, false).unwrap();
    let state = imager.wait();

    assert_eq!(state.message, "Restore disk image failed");
    assert_eq!(state.last_error_category, Some(ErrorCategory::File));
    assert!(state.last_error_message.is_some_and(|m| m.contains("does not exist")));
}

#[test]
fn existing_image_folder_is_remembered() {
    let platform = platform_with_card();
    let imager = imager(&platform, 16);
    imager.enumerate().unwrap();
    let dir = tempfile::tempdir().unwrap();

    imager.set_image_path(Some(dir.path().join("new.img")));
    assert_eq!(imager.home_dir(), None);
    let state = imager.state();
    assert!(state.can_read && !state.can_write);

    let existing = dir.path().join("old.img");
    fs::write(&existing, b"x").unwrap();
    imager.set_image_path(Some(existing));
    assert_eq!(imager.home_dir().as_deref(), Some(dir.path()));
    assert!(imager.state().can_write);
}
