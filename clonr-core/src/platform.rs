//! Provides platform-specific functionality.
//!
//! The rest of the library talks to the operating system only through the
//! [`Platform`] trait: listing volumes, classifying the drives behind them,
//! resolving which physical device a volume lives on, and opening raw device
//! and volume handles.
//!
//! It uses conditional compilation (`#[cfg]`) to build the correct backend for
//! the target OS (e.g., Linux, Windows); [`native`] returns it.
use crate::channel::{AccessMode, RawDevice, RawVolume};
use crate::device::{DeviceIdentity, VolumeLabel};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use self::linux::LinuxPlatform;

#[cfg(target_os = "windows")]
mod windows;
#[cfg(target_os = "windows")]
pub use self::windows::WindowsPlatform;

/// How the OS classifies the drive behind a volume.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriveType {
    Removable,
    Fixed,
    /// Optical, network, floppy, RAM disks and anything else never imaged.
    Other,
}

/// The bus a storage device is attached through.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusType {
    Usb,
    Sd,
    Mmc,
    Sata,
    Ata,
    Scsi,
    Nvme,
    Virtual,
    Unknown,
}

/// What a backend learned about the drive behind one volume.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DriveProbe {
    pub drive_type: DriveType,
    pub bus_type: BusType,
    /// The drive hosts the running system. Never offered for imaging.
    pub is_system: bool,
}

/// The strength of a "media present" check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaCheck {
    /// Lightweight check that some buses intermittently fail.
    Fast,
    /// Slower check that needs data access to the volume.
    Thorough,
}

/// The operating-system seam of the imaging core.
pub trait Platform: Send + Sync {
    /// Every volume currently known to the system, in the system's order.
    fn volume_labels(&self) -> io::Result<Vec<VolumeLabel>>;

    /// Classifies the drive behind `volume`.
    fn probe_volume(&self, volume: &VolumeLabel) -> io::Result<DriveProbe>;

    /// Whether `volume` currently has accessible media.
    fn check_media(&self, volume: &VolumeLabel, check: MediaCheck) -> bool;

    /// The physical device `volume` resides on.
    fn device_identity(&self, volume: &VolumeLabel) -> io::Result<DeviceIdentity>;

    fn open_device(
        &self,
        identity: DeviceIdentity,
        mode: AccessMode,
    ) -> io::Result<Box<dyn RawDevice>>;

    fn open_volume(&self, volume: &VolumeLabel, mode: AccessMode)
    -> io::Result<Box<dyn RawVolume>>;

    /// The volume a (possibly not yet existing) file path would be stored on.
    fn volume_of_path(&self, path: &Path) -> Option<VolumeLabel>;

    /// Free bytes on the volume holding `path`, when it can be determined.
    fn free_space(&self, path: &Path) -> Option<u64>;
}

/// Returns the backend for the operating system this crate was built for.
#[cfg(target_os = "linux")]
pub fn native() -> Box<dyn Platform> {
    Box::new(LinuxPlatform::new())
}

/// Returns the backend for the operating system this crate was built for.
#[cfg(target_os = "windows")]
pub fn native() -> Box<dyn Platform> {
    Box::new(WindowsPlatform::new())
}
