//! Locking and unmounting the volumes of a device before raw access.
use crate::channel::{self, AccessMode, VolumeHandle};
use crate::device::DeviceRecord;
use crate::error::Result;
use crate::platform::Platform;
use tracing::{debug, info};

/// The volume handles held for the duration of one operation.
///
/// Dropping the set unlocks and closes every handle in it, so a failure
/// partway through acquiring locks releases the locks already taken.
#[derive(Default)]
pub struct LockedVolumes {
    handles: Vec<VolumeHandle>,
}

impl LockedVolumes {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Unlocks and closes every handle, in acquisition order.
    pub fn unlock_all(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        debug!(count = self.handles.len(), "releasing volumes");
        for mut handle in self.handles.drain(..) {
            handle.close();
        }
    }
}

impl Drop for LockedVolumes {
    fn drop(&mut self) {
        self.unlock_all();
    }
}

/// Opens every volume of `record` and takes an exclusive lock on each.
///
/// Fails on the first volume that cannot be opened or locked; volumes locked
/// before it are released when the partial set is dropped.
pub fn lock_all(platform: &dyn Platform, record: &DeviceRecord) -> Result<LockedVolumes> {
    let mut locked = LockedVolumes::default();
    for label in record.volumes() {
        let mut handle = channel::open_volume(platform, label, AccessMode::Read)?;
        handle.lock()?;
        locked.handles.push(handle);
    }
    info!(device = %record.identity, volumes = locked.len(), "locked volumes");
    Ok(locked)
}

/// Opens every volume of `record` for writing and forces it to unmount.
///
/// No exclusive lock is taken on this path; it fails with spurious
/// access-denied errors on some systems.
pub fn lock_and_unmount_all(platform: &dyn Platform, record: &DeviceRecord) -> Result<LockedVolumes> {
    let mut held = LockedVolumes::default();
    for label in record.volumes() {
        let mut handle = channel::open_volume(platform, label, AccessMode::Write)?;
        handle.unmount()?;
        held.handles.push(handle);
    }
    info!(device = %record.identity, volumes = held.len(), "unmounted volumes");
    Ok(held)
}
