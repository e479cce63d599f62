//! Linux backend: sysfs for discovery, block-device ioctls for geometry,
//! `flock` for volume locks and `umount2` for unmounting.
use super::{BusType, DriveProbe, DriveType, MediaCheck, Platform};
use crate::channel::{AccessMode, DiskGeometry, RawDevice, RawVolume};
use crate::device::{DeviceIdentity, VolumeLabel};
use nix::errno::Errno;
use nix::mount::{MntFlags, umount2};
use nix::{ioctl_read, ioctl_read_bad, request_code_none};
use std::ffi::OsStr;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

ioctl_read!(blkgetsize64, 0x12, 114, u64);
ioctl_read_bad!(blksszget, request_code_none!(0x12, 104), libc::c_int);

const SYS_BLOCK: &str = "/sys/block";
const SYS_CLASS_BLOCK: &str = "/sys/class/block";

/// Kernel name prefixes of block devices that are never physical media.
const VIRTUAL_PREFIXES: [&str; 6] = ["loop", "ram", "zram", "dm-", "md", "sr"];

/// Helper to read a specific file from the /sys/block filesystem.
fn read_sys_file(disk: &str, file: &str) -> io::Result<String> {
    let path = PathBuf::from(SYS_BLOCK).join(disk).join(file);
    fs::read_to_string(path).map(|s| s.trim().to_string())
}

fn is_partition(name: &str) -> bool {
    Path::new(SYS_CLASS_BLOCK).join(name).join("partition").exists()
}

/// The whole-disk kernel name a volume lives on (e.g. `sdb1` -> `sdb`,
/// `mmcblk0p1` -> `mmcblk0`). A disk without a partition table is its own
/// parent.
fn parent_disk(name: &str) -> io::Result<String> {
    if !is_partition(name) {
        return Ok(name.to_string());
    }
    let canonical = fs::canonicalize(Path::new(SYS_CLASS_BLOCK).join(name))?;
    canonical
        .parent()
        .and_then(Path::file_name)
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no parent disk for {name}")))
}

fn partitions_of(disk: &str) -> Vec<String> {
    let Ok(entries) = fs::read_dir(Path::new(SYS_BLOCK).join(disk)) else {
        return Vec::new();
    };
    entries
        .filter_map(Result::ok)
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.starts_with(disk) && is_partition(n))
        .collect()
}

/// Packs the `major:minor` pair from `/sys/block/<disk>/dev`.
fn disk_identity(disk: &str) -> io::Result<DeviceIdentity> {
    let dev = read_sys_file(disk, "dev")?;
    let invalid = || io::Error::new(io::ErrorKind::InvalidData, format!("bad device number {dev:?}"));
    let (major, minor) = dev.split_once(':').ok_or_else(invalid)?;
    let major: u32 = major.parse().map_err(|_| invalid())?;
    let minor: u32 = minor.parse().map_err(|_| invalid())?;
    Ok(DeviceIdentity((major << 20) | (minor & 0xF_FFFF)))
}

fn bus_type(disk: &str) -> BusType {
    let Ok(path) = fs::canonicalize(Path::new(SYS_BLOCK).join(disk)) else {
        return BusType::Unknown;
    };
    let path = path.to_string_lossy();
    if path.contains("/usb") {
        BusType::Usb
    } else if path.contains("/mmc") {
        BusType::Mmc
    } else if path.contains("/nvme") {
        BusType::Nvme
    } else if path.contains("/ata") {
        BusType::Sata
    } else if path.contains("/virtual/") {
        BusType::Virtual
    } else {
        BusType::Unknown
    }
}

/// The mounted file system whose mount point is the longest prefix of `path`.
fn mount_for(path: &Path) -> Option<(String, u64)> {
    let mut existing = path.to_path_buf();
    let canonical = loop {
        if let Ok(canonical) = fs::canonicalize(&existing) {
            break canonical;
        }
        if !existing.pop() {
            return None;
        }
    };

    let disks = sysinfo::Disks::new_with_refreshed_list();
    disks
        .iter()
        .filter(|d| canonical.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| (dev_name(d.name()), d.available_space()))
}

/// `/dev/sdb1` -> `sdb1`.
fn dev_name(name: &OsStr) -> String {
    let name = name.to_string_lossy();
    name.strip_prefix("/dev/").unwrap_or(&name).to_string()
}

/// The disk holding the root file system, excluded from imaging.
fn system_disk() -> Option<String> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    let root = disks.iter().find(|d| d.mount_point() == Path::new("/"))?;
    parent_disk(&dev_name(root.name())).ok()
}

#[derive(Debug, Default)]
pub struct LinuxPlatform;

impl LinuxPlatform {
    pub fn new() -> Self {
        Self
    }
}

impl Platform for LinuxPlatform {
    /// Partitions, plus whole disks that carry no partition table.
    fn volume_labels(&self) -> io::Result<Vec<VolumeLabel>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(SYS_BLOCK)?.filter_map(Result::ok) {
            let disk = entry.file_name().to_string_lossy().into_owned();
            let mut partitions = partitions_of(&disk);
            if partitions.is_empty() {
                names.push(disk);
            } else {
                partitions.sort();
                names.extend(partitions);
            }
        }
        Ok(names.into_iter().map(VolumeLabel::new).collect())
    }

    fn probe_volume(&self, volume: &VolumeLabel) -> io::Result<DriveProbe> {
        let disk = parent_disk(volume.as_str())?;
        if VIRTUAL_PREFIXES.iter().any(|p| disk.starts_with(p)) {
            return Ok(DriveProbe {
                drive_type: DriveType::Other,
                bus_type: BusType::Virtual,
                is_system: false,
            });
        }
        let removable = read_sys_file(&disk, "removable")? == "1";
        Ok(DriveProbe {
            drive_type: if removable {
                DriveType::Removable
            } else {
                DriveType::Fixed
            },
            bus_type: bus_type(&disk),
            is_system: system_disk().as_deref() == Some(disk.as_str()),
        })
    }

    fn check_media(&self, volume: &VolumeLabel, check: MediaCheck) -> bool {
        match check {
            MediaCheck::Fast => parent_disk(volume.as_str())
                .and_then(|disk| read_sys_file(&disk, "size"))
                .ok()
                .and_then(|size| size.parse::<u64>().ok())
                .is_some_and(|size| size > 0),
            MediaCheck::Thorough => {
                let mut sector = [0u8; 512];
                File::open(Path::new("/dev").join(volume.as_str()))
                    .and_then(|mut f| f.read_exact(&mut sector))
                    .is_ok()
            }
        }
    }

    fn device_identity(&self, volume: &VolumeLabel) -> io::Result<DeviceIdentity> {
        disk_identity(&parent_disk(volume.as_str())?)
    }

    fn open_device(
        &self,
        identity: DeviceIdentity,
        mode: AccessMode,
    ) -> io::Result<Box<dyn RawDevice>> {
        let disk = fs::read_dir(SYS_BLOCK)?
            .filter_map(Result::ok)
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .find(|disk| disk_identity(disk).is_ok_and(|id| id == identity))
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("no block device with identity {identity}"))
            })?;

        let path = Path::new("/dev").join(&disk);
        let mut options = OpenOptions::new();
        options.read(true);
        if mode == AccessMode::Write {
            // The kernel refuses exclusive opens while any partition is mounted.
            options.write(true).custom_flags(libc::O_EXCL);
        }
        let file = options.open(&path)?;
        debug!(path = %path.display(), ?mode, "opened block device");
        Ok(Box::new(BlockDevice { file }))
    }

    fn open_volume(
        &self,
        volume: &VolumeLabel,
        mode: AccessMode,
    ) -> io::Result<Box<dyn RawVolume>> {
        let path = Path::new("/dev").join(volume.as_str());
        let file = OpenOptions::new()
            .read(true)
            .write(mode == AccessMode::Write)
            .open(&path)?;
        Ok(Box::new(PartitionVolume { path, file }))
    }

    fn volume_of_path(&self, path: &Path) -> Option<VolumeLabel> {
        mount_for(path).map(|(name, _)| VolumeLabel::new(name))
    }

    fn free_space(&self, path: &Path) -> Option<u64> {
        mount_for(path).map(|(_, available)| available)
    }
}

struct BlockDevice {
    file: File,
}

impl Read for BlockDevice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for BlockDevice {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.sync_data()
    }
}

impl Seek for BlockDevice {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

impl RawDevice for BlockDevice {
    fn geometry(&mut self) -> io::Result<DiskGeometry> {
        let fd = self.file.as_raw_fd();
        let mut disk_size: u64 = 0;
        let mut sector_size: libc::c_int = 0;
        unsafe {
            blkgetsize64(fd, &mut disk_size).map_err(io::Error::from)?;
            blksszget(fd, &mut sector_size).map_err(io::Error::from)?;
        }
        Ok(DiskGeometry {
            bytes_per_sector: u64::try_from(sector_size).unwrap_or(0),
            disk_size,
        })
    }
}

struct PartitionVolume {
    path: PathBuf,
    file: File,
}

impl PartitionVolume {
    fn flock(&self, operation: libc::c_int) -> io::Result<()> {
        if unsafe { libc::flock(self.file.as_raw_fd(), operation) } == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl RawVolume for PartitionVolume {
    fn lock(&mut self) -> io::Result<()> {
        self.flock(libc::LOCK_EX | libc::LOCK_NB)
    }

    fn unlock(&mut self) -> io::Result<()> {
        self.flock(libc::LOCK_UN)
    }

    fn unmount(&mut self) -> io::Result<()> {
        let disks = sysinfo::Disks::new_with_refreshed_list();
        for disk in disks.iter().filter(|d| Path::new(d.name()) == self.path) {
            force_unmount(disk.mount_point(), |path, flags| umount2(path, flags))
                .map_err(io::Error::from)?;
        }
        Ok(())
    }
}

/// Unmounts `mount_point`, detaching it lazily when files on it are still
/// open. The volume leaves the namespace either way.
fn force_unmount(
    mount_point: &Path,
    mut umount: impl FnMut(&Path, MntFlags) -> nix::Result<()>,
) -> nix::Result<()> {
    debug!(mount_point = %mount_point.display(), "unmounting");
    match umount(mount_point, MntFlags::empty()) {
        Err(Errno::EBUSY) => {
            warn!(mount_point = %mount_point.display(), "volume busy, detaching");
            umount(mount_point, MntFlags::MNT_FORCE | MntFlags::MNT_DETACH)
        }
        result => result,
    }
}
