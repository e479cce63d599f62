use crate::progress::format_disk_size;
use std::fmt;

/// Identifies one physical device for the lifetime of an enumeration pass.
///
/// Two volumes report the same identity if and only if they reside on the same
/// physical disk. On Windows this is the `PhysicalDriveN` number, on Linux the
/// packed `major:minor` number of the whole-disk block device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceIdentity(pub u32);

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The mount identifier of a volume: a drive letter such as `E:` on Windows,
/// or a partition's kernel name such as `sdb1` on Linux.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VolumeLabel(String);

impl VolumeLabel {
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    /// Builds the label for the drive letter at `index` in the logical drive
    /// bitmap (bit 0 is `A:`).
    pub fn from_drive_index(index: u8) -> Option<Self> {
        if index < 26 {
            Some(Self(format!("{}:", (b'A' + index) as char)))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VolumeLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Sector layout of an open device or volume handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SectorGeometry {
    pub sector_size: u64,
    pub total_sectors: u64,
}

impl SectorGeometry {
    pub fn total_bytes(&self) -> u64 {
        self.sector_size * self.total_sectors
    }

    /// Number of whole sectors needed to hold `bytes`.
    pub fn sectors_for(&self, bytes: u64) -> u64 {
        bytes.div_ceil(self.sector_size)
    }
}

/// A removable physical device and the volumes found on it.
///
/// Records are created during enumeration, only ever gain volumes, and are
/// rebuilt from scratch on every re-enumeration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceRecord {
    pub identity: DeviceIdentity,
    /// The total size of the device in bytes.
    pub size_bytes: u64,
    base_label: String,
    volumes: Vec<VolumeLabel>,
}

impl DeviceRecord {
    pub fn new(identity: DeviceIdentity, size_bytes: u64) -> Self {
        Self {
            identity,
            size_bytes,
            base_label: format!("RM {} ({})", identity, format_disk_size(size_bytes)),
            volumes: Vec::new(),
        }
    }

    /// Adds `volume` to this device. Returns `false` if it was already present.
    pub fn append_volume(&mut self, volume: VolumeLabel) -> bool {
        if self.volumes.contains(&volume) {
            return false;
        }
        self.volumes.push(volume);
        true
    }

    pub fn has_volume(&self, volume: &VolumeLabel) -> bool {
        self.volumes.contains(volume)
    }

    /// Volumes in the order they were discovered.
    pub fn volumes(&self) -> &[VolumeLabel] {
        &self.volumes
    }

    /// The label shown in a device picker, e.g. `RM 2 (7.45 GB) [E:] [F:]`.
    pub fn display_label(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for DeviceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.base_label)?;
        for volume in &self.volumes {
            write!(f, " [{volume}]")?;
        }
        Ok(())
    }
}
