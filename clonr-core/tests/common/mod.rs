//! An in-memory `Platform` with counters for every handle it hands out.
#![allow(dead_code)]

use clonr_core::channel::{AccessMode, DiskGeometry, RawDevice, RawVolume};
use clonr_core::container::ContainerWriter;
use clonr_core::mbr::PARTITION_TABLE_OFFSET;
use clonr_core::platform::{BusType, DriveProbe, DriveType, MediaCheck, Platform};
use clonr_core::{DeviceIdentity, DeviceRecord, VolumeLabel};
use std::collections::HashSet;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub type ReadHook = Arc<dyn Fn(u64) + Send + Sync>;

#[derive(Default)]
pub struct Counters {
    /// Device handles currently open.
    pub open_devices: AtomicUsize,
    /// Device handles ever opened.
    pub device_opens: AtomicUsize,
    /// Volume handles currently open.
    pub open_volumes: AtomicUsize,
    /// Volume handles ever opened.
    pub volume_opens: AtomicUsize,
    /// Volumes currently locked.
    pub locked_volumes: AtomicUsize,
    pub unmounts: AtomicUsize,
    /// Calls to `volume_labels`, one per enumeration pass.
    pub listings: AtomicUsize,
    /// `write` calls that reached a device.
    pub writes: AtomicUsize,
    /// Offset of every `read` call that returned data.
    pub reads: Mutex<Vec<u64>>,
}

impl Counters {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    pub fn reads(&self) -> Vec<u64> {
        self.reads.lock().unwrap().clone()
    }
}

struct FakeDisk {
    identity: DeviceIdentity,
    sector_size: u64,
    data: Arc<Mutex<Vec<u8>>>,
}

struct FakeVolume {
    label: VolumeLabel,
    disk: DeviceIdentity,
    probe: DriveProbe,
    media_fast: bool,
    media_thorough: bool,
    fail_probe: bool,
    fail_identity: bool,
    fail_lock: bool,
    mount_root: Option<PathBuf>,
}

#[derive(Default)]
struct State {
    disks: Mutex<Vec<FakeDisk>>,
    volumes: Mutex<Vec<FakeVolume>>,
    failing_devices: Mutex<HashSet<DeviceIdentity>>,
    read_hook: Mutex<Option<ReadHook>>,
    counters: Counters,
}

#[derive(Clone, Default)]
pub struct FakePlatform {
    state: Arc<State>,
}

pub fn usb_removable() -> DriveProbe {
    DriveProbe {
        drive_type: DriveType::Removable,
        bus_type: BusType::Usb,
        is_system: false,
    }
}

impl FakePlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counters(&self) -> &Counters {
        &self.state.counters
    }

    /// Adds a zero-filled disk.
    pub fn add_disk(&self, identity: u32, sector_size: u64, sectors: u64) {
        self.add_disk_with(identity, sector_size, vec![0u8; (sector_size * sectors) as usize]);
    }

    pub fn add_disk_with(&self, identity: u32, sector_size: u64, data: Vec<u8>) {
        self.state.disks.lock().unwrap().push(FakeDisk {
            identity: DeviceIdentity(identity),
            sector_size,
            data: Arc::new(Mutex::new(data)),
        });
    }

    pub fn disk_data(&self, identity: u32) -> Vec<u8> {
        let disks = self.state.disks.lock().unwrap();
        let disk = disks
            .iter()
            .find(|d| d.identity == DeviceIdentity(identity))
            .expect("unknown disk");
        disk.data.lock().unwrap().clone()
    }

    /// Adds a removable USB volume with media present.
    pub fn add_volume(&self, label: &str, disk: u32) {
        self.state.volumes.lock().unwrap().push(FakeVolume {
            label: VolumeLabel::new(label),
            disk: DeviceIdentity(disk),
            probe: usb_removable(),
            media_fast: true,
            media_thorough: true,
            fail_probe: false,
            fail_identity: false,
            fail_lock: false,
            mount_root: None,
        });
    }

    fn with_volume(&self, label: &str, f: impl FnOnce(&mut FakeVolume)) {
        let mut volumes = self.state.volumes.lock().unwrap();
        let volume = volumes
            .iter_mut()
            .find(|v| v.label.as_str() == label)
            .expect("unknown volume");
        f(volume);
    }

    pub fn set_probe(&self, label: &str, probe: DriveProbe) {
        self.with_volume(label, |v| v.probe = probe);
    }

    pub fn set_media(&self, label: &str, fast: bool, thorough: bool) {
        self.with_volume(label, |v| {
            v.media_fast = fast;
            v.media_thorough = thorough;
        });
    }

    pub fn fail_probe(&self, label: &str) {
        self.with_volume(label, |v| v.fail_probe = true);
    }

    pub fn fail_identity(&self, label: &str) {
        self.with_volume(label, |v| v.fail_identity = true);
    }

    pub fn fail_lock(&self, label: &str) {
        self.with_volume(label, |v| v.fail_lock = true);
    }

    pub fn mount(&self, label: &str, root: &Path) {
        let root = root.to_path_buf();
        self.with_volume(label, |v| v.mount_root = Some(root));
    }

    pub fn fail_device_open(&self, identity: u32) {
        self.state.failing_devices.lock().unwrap().insert(DeviceIdentity(identity));
    }

    /// Installs a hook called with the offset of every device read, before
    /// the read is served.
    pub fn on_read(&self, hook: impl Fn(u64) + Send + Sync + 'static) {
        *self.state.read_hook.lock().unwrap() = Some(Arc::new(hook));
    }

    /// A record for `identity` carrying every volume on it, as enumeration
    /// would build it.
    pub fn record(&self, identity: u32) -> DeviceRecord {
        let size = {
            let disks = self.state.disks.lock().unwrap();
            disks
                .iter()
                .find(|d| d.identity == DeviceIdentity(identity))
                .map(|d| d.data.lock().unwrap().len() as u64)
                .unwrap_or(0)
        };
        let mut record = DeviceRecord::new(DeviceIdentity(identity), size);
        for volume in self.state.volumes.lock().unwrap().iter() {
            if volume.disk == DeviceIdentity(identity) {
                record.append_volume(volume.label.clone());
            }
        }
        record
    }
}

fn not_found(what: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("{what} not found"))
}

impl Platform for FakePlatform {
    fn volume_labels(&self) -> io::Result<Vec<VolumeLabel>> {
        self.state.counters.listings.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .state
            .volumes
            .lock()
            .unwrap()
            .iter()
            .map(|v| v.label.clone())
            .collect())
    }

    fn probe_volume(&self, volume: &VolumeLabel) -> io::Result<DriveProbe> {
        let volumes = self.state.volumes.lock().unwrap();
        volumes
            .iter()
            .find(|v| &v.label == volume)
            .filter(|v| !v.fail_probe)
            .map(|v| v.probe)
            .ok_or_else(|| not_found(volume))
    }

    fn check_media(&self, volume: &VolumeLabel, check: MediaCheck) -> bool {
        let volumes = self.state.volumes.lock().unwrap();
        volumes.iter().find(|v| &v.label == volume).is_some_and(|v| match check {
            MediaCheck::Fast => v.media_fast,
            MediaCheck::Thorough => v.media_thorough,
        })
    }

    fn device_identity(&self, volume: &VolumeLabel) -> io::Result<DeviceIdentity> {
        let volumes = self.state.volumes.lock().unwrap();
        let found = volumes.iter().find(|v| &v.label == volume).ok_or_else(|| not_found(volume))?;
        if found.fail_identity {
            return Err(io::Error::new(io::ErrorKind::Other, "extent query failed"));
        }
        Ok(found.disk)
    }

    fn open_device(&self, identity: DeviceIdentity, mode: AccessMode) -> io::Result<Box<dyn RawDevice>> {
        if self.state.failing_devices.lock().unwrap().contains(&identity) {
            return Err(io::Error::from(io::ErrorKind::PermissionDenied));
        }
        let disks = self.state.disks.lock().unwrap();
        let disk = disks.iter().find(|d| d.identity == identity).ok_or_else(|| not_found(identity))?;
        self.state.counters.device_opens.fetch_add(1, Ordering::SeqCst);
        self.state.counters.open_devices.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeDevice {
            state: Arc::clone(&self.state),
            data: Arc::clone(&disk.data),
            sector_size: disk.sector_size,
            mode,
            pos: 0,
        }))
    }

    fn open_volume(&self, volume: &VolumeLabel, _mode: AccessMode) -> io::Result<Box<dyn RawVolume>> {
        let volumes = self.state.volumes.lock().unwrap();
        let found = volumes.iter().find(|v| &v.label == volume).ok_or_else(|| not_found(volume))?;
        self.state.counters.volume_opens.fetch_add(1, Ordering::SeqCst);
        self.state.counters.open_volumes.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeVolumeHandle {
            state: Arc::clone(&self.state),
            fail_lock: found.fail_lock,
            locked: false,
        }))
    }

    fn volume_of_path(&self, path: &Path) -> Option<VolumeLabel> {
        let volumes = self.state.volumes.lock().unwrap();
        volumes
            .iter()
            .filter_map(|v| v.mount_root.as_ref().map(|root| (root, &v.label)))
            .filter(|(root, _)| path.starts_with(root))
            .max_by_key(|(root, _)| root.as_os_str().len())
            .map(|(_, label)| label.clone())
    }

    fn free_space(&self, _path: &Path) -> Option<u64> {
        None
    }
}

struct FakeDevice {
    state: Arc<State>,
    data: Arc<Mutex<Vec<u8>>>,
    sector_size: u64,
    mode: AccessMode,
    pos: u64,
}

impl Read for FakeDevice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let len = self.data.lock().unwrap().len() as u64;
        if self.pos >= len {
            return Ok(0);
        }
        let hook = self.state.read_hook.lock().unwrap().clone();
        if let Some(hook) = hook {
            hook(self.pos);
        }
        self.state.counters.reads.lock().unwrap().push(self.pos);

        let data = self.data.lock().unwrap();
        let start = self.pos as usize;
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        self.pos += n as u64;
        Ok(n)
    }
}

impl Write for FakeDevice {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.mode != AccessMode::Write {
            return Err(io::Error::from(io::ErrorKind::PermissionDenied));
        }
        let mut data = self.data.lock().unwrap();
        let start = self.pos as usize;
        if start >= data.len() {
            return Err(io::Error::new(io::ErrorKind::Other, "write past end of device"));
        }
        let n = buf.len().min(data.len() - start);
        data[start..start + n].copy_from_slice(&buf[..n]);
        self.pos += n as u64;
        self.state.counters.writes.fetch_add(1, Ordering::SeqCst);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for FakeDevice {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match pos {
            SeekFrom::Start(offset) => self.pos = offset,
            _ => return Err(io::Error::from(io::ErrorKind::Unsupported)),
        }
        Ok(self.pos)
    }
}

impl RawDevice for FakeDevice {
    fn geometry(&mut self) -> io::Result<DiskGeometry> {
        Ok(DiskGeometry {
            bytes_per_sector: self.sector_size,
            disk_size: self.data.lock().unwrap().len() as u64,
        })
    }
}

impl Drop for FakeDevice {
    fn drop(&mut self) {
        self.state.counters.open_devices.fetch_sub(1, Ordering::SeqCst);
    }
}

struct FakeVolumeHandle {
    state: Arc<State>,
    fail_lock: bool,
    locked: bool,
}

impl RawVolume for FakeVolumeHandle {
    fn lock(&mut self) -> io::Result<()> {
        if self.fail_lock {
            return Err(io::Error::from(io::ErrorKind::PermissionDenied));
        }
        self.locked = true;
        self.state.counters.locked_volumes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn unlock(&mut self) -> io::Result<()> {
        if self.locked {
            self.locked = false;
            self.state.counters.locked_volumes.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn unmount(&mut self) -> io::Result<()> {
        self.state.counters.unmounts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for FakeVolumeHandle {
    fn drop(&mut self) {
        self.state.counters.open_volumes.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A partition table sector with the given `(start, count)` primary entries.
pub fn mbr_sector(entries: &[(u32, u32)], sector_size: usize) -> Vec<u8> {
    let mut sector = vec![0u8; sector_size];
    for (i, (start, count)) in entries.iter().enumerate() {
        let offset = PARTITION_TABLE_OFFSET + i * 16;
        sector[offset + 8..offset + 12].copy_from_slice(&start.to_le_bytes());
        sector[offset + 12..offset + 16].copy_from_slice(&count.to_le_bytes());
    }
    sector[510] = 0x55;
    sector[511] = 0xAA;
    sector
}

/// Disk contents whose first sector is a partition table covering sectors
/// `1..extent`, with every later byte set from its offset.
pub fn patterned_disk(sector_size: u64, sectors: u64, extent: u32) -> Vec<u8> {
    let mut data: Vec<u8> = (0..sector_size * sectors).map(|i| (i % 251) as u8).collect();
    let table = mbr_sector(&[(1, extent - 1)], sector_size as usize);
    data[..table.len()].copy_from_slice(&table);
    data
}

/// Writes a container file with the given header and chunks.
pub fn write_container(path: &Path, declared: u64, chunks: &[Vec<u8>]) {
    let mut writer = ContainerWriter::new(File::create(path).unwrap());
    writer.write_header(declared).unwrap();
    for chunk in chunks {
        writer.write_chunk(chunk).unwrap();
    }
    writer.finish().unwrap().flush().unwrap();
}
