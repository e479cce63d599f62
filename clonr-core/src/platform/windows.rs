//! Windows backend: drive letters for discovery and `DeviceIoControl` for
//! classification, geometry, locking and dismounting.
use super::{BusType, DriveProbe, DriveType, MediaCheck, Platform};
use crate::channel::{AccessMode, DiskGeometry, RawDevice, RawVolume};
use crate::device::{DeviceIdentity, VolumeLabel};
use std::ffi::OsStr;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::mem::{size_of, zeroed};
use std::os::windows::ffi::OsStrExt;
use std::os::windows::fs::OpenOptionsExt;
use std::os::windows::io::AsRawHandle;
use std::path::{Component, Path, Prefix};
use std::ptr;
use tracing::debug;
use windows_sys::Win32::Foundation::HANDLE;
use windows_sys::Win32::Storage::FileSystem::{
    FILE_SHARE_READ, FILE_SHARE_WRITE, GetDiskFreeSpaceExW, GetDriveTypeW, GetLogicalDrives,
};
use windows_sys::Win32::System::IO::DeviceIoControl;
use windows_sys::Win32::System::Ioctl::{
    DISK_GEOMETRY, DISK_GEOMETRY_EX, FSCTL_DISMOUNT_VOLUME, FSCTL_LOCK_VOLUME,
    FSCTL_UNLOCK_VOLUME, IOCTL_DISK_GET_DRIVE_GEOMETRY, IOCTL_DISK_GET_DRIVE_GEOMETRY_EX,
    IOCTL_STORAGE_CHECK_VERIFY, IOCTL_STORAGE_CHECK_VERIFY2, IOCTL_STORAGE_QUERY_PROPERTY,
    IOCTL_VOLUME_GET_VOLUME_DISK_EXTENTS, STORAGE_DEVICE_DESCRIPTOR, STORAGE_PROPERTY_QUERY,
    VOLUME_DISK_EXTENTS,
};

const DRIVE_REMOVABLE: u32 = 2;
const DRIVE_FIXED: u32 = 3;

const MEDIA_REMOVABLE: i32 = 11;
const MEDIA_FIXED: i32 = 12;

const STORAGE_DEVICE_PROPERTY: i32 = 0;
const PROPERTY_STANDARD_QUERY: i32 = 0;

/// Room for the vendor and product strings drivers append to the descriptor.
const DESCRIPTOR_STRING_SPACE: usize = 512;

#[repr(C)]
struct DeviceDescriptorBuffer {
    descriptor: STORAGE_DEVICE_DESCRIPTOR,
    strings: [u8; DESCRIPTOR_STRING_SPACE],
}

fn bus_from_raw(raw: i32) -> BusType {
    match raw {
        1 => BusType::Scsi,
        3 => BusType::Ata,
        7 => BusType::Usb,
        11 => BusType::Sata,
        12 => BusType::Sd,
        13 => BusType::Mmc,
        14 => BusType::Virtual,
        17 => BusType::Nvme,
        _ => BusType::Unknown,
    }
}

fn wide(s: &str) -> Vec<u16> {
    OsStr::new(s).encode_wide().chain(Some(0)).collect()
}

/// Issues one `DeviceIoControl`, returning the number of bytes written to
/// `output`.
fn ioctl<I, O>(file: &File, code: u32, input: Option<&I>, output: Option<&mut O>) -> io::Result<u32> {
    let (in_ptr, in_len) = match input {
        Some(input) => (input as *const I as *const _, size_of::<I>() as u32),
        None => (ptr::null(), 0),
    };
    let (out_ptr, out_len) = match output {
        Some(output) => (output as *mut O as *mut _, size_of::<O>() as u32),
        None => (ptr::null_mut(), 0),
    };
    let mut returned = 0u32;
    let ok = unsafe {
        DeviceIoControl(
            file.as_raw_handle() as HANDLE,
            code,
            in_ptr,
            in_len,
            out_ptr,
            out_len,
            &mut returned,
            ptr::null_mut(),
        )
    };
    if ok == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(returned)
}

/// `\\.\E:` opened with no data access, for queries only.
fn open_query(volume: &VolumeLabel) -> io::Result<File> {
    OpenOptions::new()
        .access_mode(0)
        .share_mode(FILE_SHARE_READ | FILE_SHARE_WRITE)
        .open(format!(r"\\.\{volume}"))
}

fn system_drive() -> Option<String> {
    std::env::var("SystemDrive").ok().map(|d| d.to_ascii_uppercase())
}

fn drive_root(path: &Path) -> Option<VolumeLabel> {
    let absolute = std::path::absolute(path).ok()?;
    match absolute.components().next()? {
        Component::Prefix(prefix) => match prefix.kind() {
            Prefix::Disk(letter) | Prefix::VerbatimDisk(letter) => {
                VolumeLabel::from_drive_index(letter.to_ascii_uppercase().wrapping_sub(b'A'))
            }
            _ => None,
        },
        _ => None,
    }
}

#[derive(Debug, Default)]
pub struct WindowsPlatform;

impl WindowsPlatform {
    pub fn new() -> Self {
        Self
    }
}

impl Platform for WindowsPlatform {
    fn volume_labels(&self) -> io::Result<Vec<VolumeLabel>> {
        let mask = unsafe { GetLogicalDrives() };
        if mask == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok((0..26u8)
            .filter(|i| mask & (1 << i) != 0)
            .filter_map(VolumeLabel::from_drive_index)
            .collect())
    }

    fn probe_volume(&self, volume: &VolumeLabel) -> io::Result<DriveProbe> {
        let root = wide(&format!(r"{volume}\"));
        let kind = unsafe { GetDriveTypeW(root.as_ptr()) };
        let is_system = system_drive().as_deref() == Some(volume.as_str());
        let mut probe = DriveProbe {
            drive_type: DriveType::Other,
            bus_type: BusType::Unknown,
            is_system,
        };
        if kind != DRIVE_REMOVABLE && kind != DRIVE_FIXED {
            return Ok(probe);
        }

        let file = open_query(volume)?;
        let mut geometry: DISK_GEOMETRY = unsafe { zeroed() };
        ioctl::<(), _>(&file, IOCTL_DISK_GET_DRIVE_GEOMETRY, None, Some(&mut geometry))?;
        probe.drive_type = match geometry.MediaType as i32 {
            MEDIA_REMOVABLE => DriveType::Removable,
            MEDIA_FIXED => DriveType::Fixed,
            _ if kind == DRIVE_REMOVABLE => DriveType::Removable,
            _ => DriveType::Other,
        };

        let mut query: STORAGE_PROPERTY_QUERY = unsafe { zeroed() };
        query.PropertyId = STORAGE_DEVICE_PROPERTY as _;
        query.QueryType = PROPERTY_STANDARD_QUERY as _;
        let mut buffer: DeviceDescriptorBuffer = unsafe { zeroed() };
        ioctl(&file, IOCTL_STORAGE_QUERY_PROPERTY, Some(&query), Some(&mut buffer))?;
        probe.bus_type = bus_from_raw(buffer.descriptor.BusType as i32);
        Ok(probe)
    }

    fn check_media(&self, volume: &VolumeLabel, check: MediaCheck) -> bool {
        let code = match check {
            MediaCheck::Fast => IOCTL_STORAGE_CHECK_VERIFY2,
            MediaCheck::Thorough => IOCTL_STORAGE_CHECK_VERIFY,
        };
        let file = match check {
            MediaCheck::Fast => open_query(volume),
            MediaCheck::Thorough => OpenOptions::new()
                .read(true)
                .share_mode(FILE_SHARE_READ | FILE_SHARE_WRITE)
                .open(format!(r"\\.\{volume}")),
        };
        file.and_then(|f| ioctl::<(), ()>(&f, code, None, None)).is_ok()
    }

    fn device_identity(&self, volume: &VolumeLabel) -> io::Result<DeviceIdentity> {
        let file = open_query(volume)?;
        let mut extents: VOLUME_DISK_EXTENTS = unsafe { zeroed() };
        ioctl::<(), _>(&file, IOCTL_VOLUME_GET_VOLUME_DISK_EXTENTS, None, Some(&mut extents))?;
        if extents.NumberOfDiskExtents == 0 {
            return Err(io::Error::new(io::ErrorKind::NotFound, format!("volume {volume} has no disk extents")));
        }
        Ok(DeviceIdentity(extents.Extents[0].DiskNumber))
    }

    fn open_device(
        &self,
        identity: DeviceIdentity,
        mode: AccessMode,
    ) -> io::Result<Box<dyn RawDevice>> {
        let path = format!(r"\\.\PhysicalDrive{identity}");
        let file = OpenOptions::new()
            .read(true)
            .write(mode == AccessMode::Write)
            .share_mode(FILE_SHARE_READ | FILE_SHARE_WRITE)
            .open(&path)?;
        debug!(%path, ?mode, "opened physical drive");
        Ok(Box::new(PhysicalDrive { file }))
    }

    fn open_volume(
        &self,
        volume: &VolumeLabel,
        mode: AccessMode,
    ) -> io::Result<Box<dyn RawVolume>> {
        let file = OpenOptions::new()
            .read(true)
            .write(mode == AccessMode::Write)
            .share_mode(FILE_SHARE_READ | FILE_SHARE_WRITE)
            .open(format!(r"\\.\{volume}"))?;
        Ok(Box::new(DriveVolume { file }))
    }

    fn volume_of_path(&self, path: &Path) -> Option<VolumeLabel> {
        drive_root(path)
    }

    fn free_space(&self, path: &Path) -> Option<u64> {
        let root = wide(&format!(r"{}\", drive_root(path)?));
        let mut available = 0u64;
        let ok = unsafe {
            GetDiskFreeSpaceExW(root.as_ptr(), &mut available, ptr::null_mut(), ptr::null_mut())
        };
        (ok != 0).then_some(available)
    }
}

struct PhysicalDrive {
    file: File,
}

impl Read for PhysicalDrive {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for PhysicalDrive {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.sync_data()
    }
}

impl Seek for PhysicalDrive {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

impl RawDevice for PhysicalDrive {
    fn geometry(&mut self) -> io::Result<DiskGeometry> {
        let mut geometry: DISK_GEOMETRY_EX = unsafe { zeroed() };
        ioctl::<(), _>(&self.file, IOCTL_DISK_GET_DRIVE_GEOMETRY_EX, None, Some(&mut geometry))?;
        Ok(DiskGeometry {
            bytes_per_sector: geometry.Geometry.BytesPerSector as u64,
            disk_size: u64::try_from(geometry.DiskSize).unwrap_or(0),
        })
    }
}

struct DriveVolume {
    file: File,
}

impl RawVolume for DriveVolume {
    fn lock(&mut self) -> io::Result<()> {
        ioctl::<(), ()>(&self.file, FSCTL_LOCK_VOLUME, None, None).map(drop)
    }

    fn unlock(&mut self) -> io::Result<()> {
        ioctl::<(), ()>(&self.file, FSCTL_UNLOCK_VOLUME, None, None).map(drop)
    }

    fn unmount(&mut self) -> io::Result<()> {
        ioctl::<(), ()>(&self.file, FSCTL_DISMOUNT_VOLUME, None, None).map(drop)
    }
}
