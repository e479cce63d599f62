//! Sector-aligned raw access to physical devices and volumes.
//!
//! Handles are owned resources: dropping a [`DeviceHandle`] or a
//! [`VolumeHandle`] releases the underlying OS object, so every exit path of an
//! operation (success, error or cancellation) gives its handles back.
use crate::device::{DeviceIdentity, SectorGeometry, VolumeLabel};
use crate::error::{ErrorCategory, ImagingError, Result};
use crate::platform::Platform;
use std::io::{self, Read, Seek, SeekFrom, Write};
use tracing::{debug, warn};

/// How a device or volume handle is opened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessMode {
    /// Shared reading.
    Read,
    /// Writing. The caller must have locked or unmounted the device's volumes.
    Write,
}

/// Geometry exactly as the OS reports it for a raw handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DiskGeometry {
    pub bytes_per_sector: u64,
    pub disk_size: u64,
}

/// An open raw device as provided by a [`Platform`] backend.
pub trait RawDevice: Read + Write + Seek + Send {
    fn geometry(&mut self) -> io::Result<DiskGeometry>;
}

/// An open volume as provided by a [`Platform`] backend.
pub trait RawVolume: Send {
    /// Acquires an exclusive lock that denies other access to the volume.
    fn lock(&mut self) -> io::Result<()>;
    fn unlock(&mut self) -> io::Result<()>;
    /// Forces the volume's file system to unmount.
    fn unmount(&mut self) -> io::Result<()>;
}

/// Opens a physical device for sequential sector access.
///
/// # Arguments
///
/// * `platform` - The backend that owns the device.
/// * `identity` - The device to open, as reported during enumeration.
/// * `mode` - `Write` opens the device exclusively.
///
/// # Errors
///
/// Returns a `Device` error carrying the OS error if the device cannot be
/// opened, typically because it is gone or access is denied.
pub fn open_device(
    platform: &dyn Platform,
    identity: DeviceIdentity,
    mode: AccessMode,
) -> Result<DeviceHandle> {
    let raw = platform.open_device(identity, mode).map_err(|e| {
        ImagingError::with_os(
            ErrorCategory::Device,
            "An error occurred when attempting to get a handle on the device.",
            &e,
        )
    })?;
    debug!(device = %identity, ?mode, "opened device handle");
    Ok(DeviceHandle::new(identity, mode, raw))
}

/// Opens a volume by its label.
pub fn open_volume(
    platform: &dyn Platform,
    label: &VolumeLabel,
    mode: AccessMode,
) -> Result<VolumeHandle> {
    let raw = platform.open_volume(label, mode).map_err(|e| {
        ImagingError::with_os(
            ErrorCategory::Volume,
            format!("An error occurred when attempting to get a handle on the volume {label}."),
            &e,
        )
    })?;
    debug!(volume = %label, ?mode, "opened volume handle");
    Ok(VolumeHandle::new(label.clone(), raw))
}

/// An owned handle on a physical device.
pub struct DeviceHandle {
    identity: DeviceIdentity,
    mode: AccessMode,
    raw: Option<Box<dyn RawDevice>>,
}

impl DeviceHandle {
    pub fn new(identity: DeviceIdentity, mode: AccessMode, raw: Box<dyn RawDevice>) -> Self {
        Self {
            identity,
            mode,
            raw: Some(raw),
        }
    }

    pub fn identity(&self) -> DeviceIdentity {
        self.identity
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    pub fn is_open(&self) -> bool {
        self.raw.is_some()
    }

    fn raw(&mut self, category: ErrorCategory) -> Result<&mut Box<dyn RawDevice>> {
        self.raw
            .as_mut()
            .ok_or_else(|| ImagingError::new(category, "The device handle is closed."))
    }

    /// Queries sector size and sector count.
    ///
    /// A device that reports a size of zero is treated as having no media,
    /// which is distinct from a failed query.
    pub fn query_geometry(&mut self) -> Result<SectorGeometry> {
        let geometry = self.raw(ErrorCategory::Device)?.geometry().map_err(|e| {
            ImagingError::with_os(
                ErrorCategory::Device,
                "An error occurred when attempting to get the device's geometry.",
                &e,
            )
        })?;

        if geometry.disk_size == 0 {
            return Err(ImagingError::media_absent(
                "The device reports a size of zero. The media may have been removed.",
            ));
        }
        if geometry.bytes_per_sector == 0 {
            return Err(ImagingError::new(
                ErrorCategory::Device,
                "The device reports a sector size of zero.",
            ));
        }

        Ok(SectorGeometry {
            sector_size: geometry.bytes_per_sector,
            total_sectors: geometry.disk_size / geometry.bytes_per_sector,
        })
    }

    /// Reads `count` sectors starting at `start`.
    ///
    /// If the device ends before the requested range does, the missing tail is
    /// zero-filled. Zeros past the end of media are not device content.
    ///
    /// # Errors
    ///
    /// This function will return a `Read` error if:
    /// - The handle has been closed.
    /// - The range does not fit in memory.
    /// - Seeking or reading fails.
    pub fn read_sectors(
        &mut self,
        start: u64,
        count: u64,
        geometry: &SectorGeometry,
    ) -> Result<Vec<u8>> {
        let len = usize::try_from(count * geometry.sector_size).map_err(|_| {
            ImagingError::new(ErrorCategory::Read, "The requested read is too large.")
        })?;
        let raw = self.raw(ErrorCategory::Read)?;
        let read_error = |e: io::Error| {
            ImagingError::with_os(
                ErrorCategory::Read,
                "An error occurred when attempting to read data from handle.",
                &e,
            )
        };

        raw.seek(SeekFrom::Start(start * geometry.sector_size))
            .map_err(read_error)?;

        let mut data = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            match raw.read(&mut data[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(read_error(e)),
            }
        }
        if filled < len {
            debug!(start, filled, len, "short read, zero-filling the remainder");
        }
        Ok(data)
    }

    /// Writes `data` at sector `start`.
    ///
    /// # Arguments
    ///
    /// * `start` - First sector to write.
    /// * `data` - The bytes to write. Must be a whole number of sectors.
    /// * `geometry` - Geometry returned by [`DeviceHandle::query_geometry`].
    ///
    /// # Errors
    ///
    /// Returns a `Write` error if `data` is not sector-aligned, the handle is
    /// closed, or the device rejects the write.
    pub fn write_sectors(
        &mut self,
        start: u64,
        data: &[u8],
        geometry: &SectorGeometry,
    ) -> Result<()> {
        if data.len() as u64 % geometry.sector_size != 0 {
            return Err(ImagingError::new(
                ErrorCategory::Write,
                format!(
                    "Write of {} bytes is not a multiple of the {} byte sector size.",
                    data.len(),
                    geometry.sector_size
                ),
            ));
        }
        let raw = self.raw(ErrorCategory::Write)?;
        let write_error = |e: io::Error| {
            ImagingError::with_os(
                ErrorCategory::Write,
                "An error occurred when attempting to write data to handle.",
                &e,
            )
        };

        raw.seek(SeekFrom::Start(start * geometry.sector_size))
            .map_err(write_error)?;
        raw.write_all(data).map_err(write_error)
    }

    pub fn flush(&mut self) -> Result<()> {
        let raw = self.raw(ErrorCategory::Write)?;
        raw.flush().map_err(|e| {
            ImagingError::with_os(
                ErrorCategory::Write,
                "An error occurred when flushing data to the device.",
                &e,
            )
        })
    }

    /// Releases the handle. Safe to call any number of times.
    pub fn close(&mut self) {
        if let Some(mut raw) = self.raw.take() {
            if self.mode == AccessMode::Write {
                if let Err(e) = raw.flush() {
                    warn!(device = %self.identity, error = %e, "flush on close failed");
                }
            }
            debug!(device = %self.identity, "closed device handle");
        }
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// An owned handle on a volume, remembering whether it holds a lock.
pub struct VolumeHandle {
    label: VolumeLabel,
    raw: Option<Box<dyn RawVolume>>,
    locked: bool,
}

impl VolumeHandle {
    pub fn new(label: VolumeLabel, raw: Box<dyn RawVolume>) -> Self {
        Self {
            label,
            raw: Some(raw),
            locked: false,
        }
    }

    pub fn label(&self) -> &VolumeLabel {
        &self.label
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    fn raw(&mut self) -> Result<&mut Box<dyn RawVolume>> {
        let label = &self.label;
        self.raw.as_mut().ok_or_else(|| {
            ImagingError::new(
                ErrorCategory::Volume,
                format!("The handle on volume {label} is closed."),
            )
        })
    }

    pub fn lock(&mut self) -> Result<()> {
        let label = self.label.clone();
        self.raw()?.lock().map_err(|e| {
            ImagingError::with_os(
                ErrorCategory::Volume,
                format!("An error occurred when attempting to lock the volume {label}."),
                &e,
            )
        })?;
        self.locked = true;
        Ok(())
    }

    pub fn unlock(&mut self) -> Result<()> {
        if !self.locked {
            return Ok(());
        }
        let label = self.label.clone();
        self.raw()?.unlock().map_err(|e| {
            ImagingError::with_os(
                ErrorCategory::Volume,
                format!("An error occurred when attempting to unlock the volume {label}."),
                &e,
            )
        })?;
        self.locked = false;
        Ok(())
    }

    pub fn unmount(&mut self) -> Result<()> {
        let label = self.label.clone();
        self.raw()?.unmount().map_err(|e| {
            ImagingError::with_os(
                ErrorCategory::Volume,
                format!("An error occurred when attempting to unmount the volume {label}."),
                &e,
            )
        })
    }

    /// Unlocks the volume if needed and releases the handle. Safe to call any
    /// number of times; an unlock failure is logged, the handle is released
    /// regardless.
    pub fn close(&mut self) {
        if let Err(e) = self.unlock() {
            warn!(volume = %self.label, error = %e, "unlock on close failed");
            self.locked = false;
        }
        if self.raw.take().is_some() {
            debug!(volume = %self.label, "closed volume handle");
        }
    }
}

impl Drop for VolumeHandle {
    fn drop(&mut self) {
        self.close();
    }
}
