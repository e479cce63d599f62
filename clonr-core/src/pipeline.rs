//! The create, restore and verify runs.
//!
//! Each run is synchronous and owns every handle it opens in a transfer
//! state that releases them when the run returns, whatever the outcome.
//! Cancellation is cooperative: the [`CancelToken`] is checked between
//! chunks, so the chunk in flight always completes or fails as a whole.
use crate::channel::{self, AccessMode, DeviceHandle};
use crate::config::ImagingConfig;
use crate::container::{ContainerReader, ContainerWriter, DigestWriter};
use crate::device::DeviceRecord;
use crate::error::{ErrorCategory, ImagingError, Result};
use crate::mbr;
use crate::platform::Platform;
use crate::progress::{Throughput, ThroughputMeter};
use crate::volume::{self, LockedVolumes};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{debug, info, warn};

/// The kind of transfer a run performs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Device to image file.
    Create,
    /// Image file to device.
    Restore,
    /// Image file compared against device.
    Verify,
}

impl Mode {
    /// Prefix of the throughput label shown while running.
    pub fn speed_label(&self) -> &'static str {
        match self {
            Mode::Create => "Reading speed",
            Mode::Restore => "Writing speed",
            Mode::Verify => "Verifying speed",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Mode::Create => "Create disk image",
            Mode::Restore => "Restore disk image",
            Mode::Verify => "Verify disk image",
        }
    }
}

/// A shared flag used to request that a run stop at the next chunk boundary.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Reported after every chunk.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProgressUpdate {
    pub mode: Mode,
    /// Overall progress of the current mode, in `[0, 1]`.
    pub fraction: f64,
    /// Present once per elapsed tick.
    pub throughput: Option<Throughput>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Completion {
    Completed,
    Cancelled,
}

/// The result of a run that did not fail.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outcome {
    pub completion: Completion,
    /// Device bytes read or written before the run ended.
    pub bytes_transferred: u64,
    /// A verify pass ran to completion without a mismatch.
    pub verified: bool,
    /// SHA-256 of the container file written by a create run.
    pub digest: Option<String>,
}

impl Outcome {
    fn cancelled(bytes_transferred: u64) -> Self {
        Self {
            completion: Completion::Cancelled,
            bytes_transferred,
            verified: false,
            digest: None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.completion == Completion::Cancelled
    }
}

/// Everything a run holds open. Dropping it closes the device handle and
/// then releases the volumes.
struct TransferState {
    mode: Mode,
    cursor_sector: u64,
    sector_size: u64,
    locked: LockedVolumes,
    device: Option<DeviceHandle>,
}

impl TransferState {
    fn new(mode: Mode, locked: LockedVolumes) -> Self {
        Self {
            mode,
            cursor_sector: 0,
            sector_size: 0,
            locked,
            device: None,
        }
    }

    fn bytes_moved(&self) -> u64 {
        self.cursor_sector * self.sector_size
    }

    fn release(&mut self) {
        if let Some(mut device) = self.device.take() {
            device.close();
        }
        self.locked.unlock_all();
    }
}

impl Drop for TransferState {
    fn drop(&mut self) {
        debug!(mode = ?self.mode, cursor = self.cursor_sector, "releasing transfer resources");
        self.release();
    }
}

struct Reporter<'f> {
    mode: Mode,
    meter: ThroughputMeter,
    sink: &'f mut dyn FnMut(ProgressUpdate),
}

impl<'f> Reporter<'f> {
    fn new(mode: Mode, config: &ImagingConfig, sink: &'f mut dyn FnMut(ProgressUpdate)) -> Self {
        let mut reporter = Self {
            mode,
            meter: ThroughputMeter::new(config.tick_interval()),
            sink,
        };
        reporter.report(0.0, 0);
        reporter
    }

    fn report(&mut self, fraction: f64, device_bytes: u64) {
        let throughput = self.meter.observe(Instant::now(), device_bytes);
        (self.sink)(ProgressUpdate {
            mode: self.mode,
            fraction: fraction.clamp(0.0, 1.0),
            throughput,
        });
    }
}

fn ratio(done: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        done as f64 / total as f64
    }
}

/// Fails if `image` would be stored on one of `device`'s own volumes.
pub fn check_image_location(
    platform: &dyn Platform,
    device: &DeviceRecord,
    image: &Path,
) -> Result<()> {
    match platform.volume_of_path(image) {
        Some(volume) if device.has_volume(&volume) => Err(ImagingError::new(
            ErrorCategory::File,
            format!("Image file cannot be located on the target device (volume {volume})."),
        )),
        _ => Ok(()),
    }
}

/// Runs transfers against one platform with one configuration.
pub struct Pipeline<'a> {
    platform: &'a dyn Platform,
    config: &'a ImagingConfig,
    cancel: &'a CancelToken,
}

impl<'a> Pipeline<'a> {
    pub fn new(platform: &'a dyn Platform, config: &'a ImagingConfig, cancel: &'a CancelToken) -> Self {
        Self {
            platform,
            config,
            cancel,
        }
    }

    /// Images `device` into a new container at `destination`.
    ///
    /// Only the sectors covered by the device's primary partitions are
    /// imaged. A cancelled run leaves the partial container in place.
    ///
    /// # Arguments
    ///
    /// * `device` - The removable device to read from.
    /// * `destination` - Path of the container file to create. An existing
    ///   file is overwritten.
    /// * `verify_after` - If `true`, the device is compared against the new
    ///   container before the run is reported complete.
    /// * `on_progress` - Called after every chunk with the fraction done and,
    ///   once per tick, the throughput.
    ///
    /// # Errors
    ///
    /// This function will return an error if:
    /// - `destination` lies on one of the device's own volumes.
    /// - A volume cannot be locked, or the device cannot be opened or read.
    /// - The container file cannot be created or written.
    /// - The verify pass finds a difference.
    pub fn create(
        &self,
        device: &DeviceRecord,
        destination: &Path,
        verify_after: bool,
        on_progress: &mut dyn FnMut(ProgressUpdate),
    ) -> Result<Outcome> {
        if destination.as_os_str().is_empty() {
            return Err(ImagingError::new(
                ErrorCategory::File,
                "Please specify an image file to save data to.",
            ));
        }
        check_image_location(self.platform, device, destination)?;
        info!(device = %device.identity, image = %destination.display(), "creating disk image");

        let mut transfer = TransferState::new(Mode::Create, volume::lock_all(self.platform, device)?);
        let handle = transfer.device.insert(channel::open_device(
            self.platform,
            device.identity,
            AccessMode::Read,
        )?);
        let geometry = handle.query_geometry()?;
        transfer.sector_size = geometry.sector_size;

        let table = handle.read_sectors(0, 1, &geometry)?;
        let mut extent = mbr::imaged_extent(&table);
        if extent > geometry.total_sectors {
            warn!(
                extent,
                total_sectors = geometry.total_sectors,
                "partition table reaches past the end of the media, clamping"
            );
            extent = geometry.total_sectors;
        }
        let total_bytes = extent * geometry.sector_size;
        if let Some(free) = self.platform.free_space(destination) {
            if free < total_bytes {
                warn!(free, needed = total_bytes, "destination may not have enough free space");
            }
        }

        let file_error = |e: io::Error| {
            ImagingError::with_os(
                ErrorCategory::File,
                "An error occurred when writing the image file.",
                &e,
            )
        };
        let file = File::create(destination).map_err(|e| {
            ImagingError::with_os(ErrorCategory::File, "Cannot open image file.", &e)
        })?;
        let mut writer = ContainerWriter::new(DigestWriter::new(BufWriter::new(file)));
        writer.write_header(total_bytes).map_err(file_error)?;

        let chunk_sectors = self.config.chunk_sectors_for(geometry.sector_size);
        let mut completion = Completion::Completed;
        let mut reporter = Reporter::new(Mode::Create, self.config, &mut *on_progress);
        while transfer.cursor_sector < extent {
            if self.cancel.is_cancelled() {
                completion = Completion::Cancelled;
                break;
            }
            let count = chunk_sectors.min(extent - transfer.cursor_sector);
            let data = handle.read_sectors(transfer.cursor_sector, count, &geometry)?;
            writer.write_chunk(&data).map_err(file_error)?;

            transfer.cursor_sector += count;
            reporter.report(
                ratio(transfer.cursor_sector, extent),
                transfer.cursor_sector * geometry.sector_size,
            );
        }

        let (buffered, digest) = writer.finish().map_err(file_error)?.finalize();
        let file = buffered.into_inner().map_err(|e| file_error(e.into_error()))?;
        file.sync_all().map_err(file_error)?;
        drop(file);

        let bytes_transferred = transfer.bytes_moved();
        if completion == Completion::Cancelled {
            info!(sectors = transfer.cursor_sector, "create cancelled");
            return Ok(Outcome::cancelled(bytes_transferred));
        }

        let verified = if verify_after {
            match self.verify_pass(&mut transfer, device, destination, on_progress)? {
                Completion::Completed => true,
                Completion::Cancelled => return Ok(Outcome::cancelled(bytes_transferred)),
            }
        } else {
            false
        };

        info!(bytes = bytes_transferred, %digest, "create finished");
        Ok(Outcome {
            completion: Completion::Completed,
            bytes_transferred,
            verified,
            digest: Some(digest),
        })
    }

    /// Writes the container at `source` onto `device`.
    ///
    /// Fails before writing anything if the image declares more data than the
    /// device holds.
    ///
    /// # Arguments
    ///
    /// * `device` - The removable device to overwrite.
    /// * `source` - Path of an existing, non-empty container file.
    /// * `verify_after` - If `true`, a verify pass follows the write.
    /// * `on_progress` - Called after every chunk. The fraction tracks how
    ///   much of the container file has been consumed.
    ///
    /// # Errors
    ///
    /// This function will return an error if:
    /// - `source` is missing, empty, unreadable or not a container.
    /// - `source` lies on one of the device's own volumes.
    /// - A volume cannot be unmounted or the device cannot be opened for writing.
    /// - The image is larger than the device.
    /// - A write fails, or the verify pass finds a difference.
    pub fn restore(
        &self,
        device: &DeviceRecord,
        source: &Path,
        verify_after: bool,
        on_progress: &mut dyn FnMut(ProgressUpdate),
    ) -> Result<Outcome> {
        let file = open_image(source)?;
        let file_len = file
            .metadata()
            .map_err(|e| ImagingError::with_os(ErrorCategory::File, "Cannot read the image file size.", &e))?
            .len();
        check_image_location(self.platform, device, source)?;
        info!(device = %device.identity, image = %source.display(), "restoring disk image");

        let mut transfer = TransferState::new(
            Mode::Restore,
            volume::lock_and_unmount_all(self.platform, device)?,
        );
        let handle = transfer.device.insert(channel::open_device(
            self.platform,
            device.identity,
            AccessMode::Write,
        )?);
        let geometry = handle.query_geometry()?;
        transfer.sector_size = geometry.sector_size;
        let target_size = geometry.total_bytes();

        let corrupt = |e: io::Error| {
            ImagingError::with_os(
                ErrorCategory::File,
                "The image file is damaged or is not a disk image.",
                &e,
            )
        };
        let mut reader = ContainerReader::new(BufReader::new(file), self.config.max_chunk_bytes);
        let declared = reader.read_header().map_err(corrupt)?;
        if declared > target_size {
            return Err(ImagingError::new(
                ErrorCategory::Write,
                format!(
                    "Content in selected image file is too large for the selected device \
                     ({declared} bytes, the device holds {target_size})."
                ),
            ));
        }

        let mut completion = Completion::Completed;
        let mut reporter = Reporter::new(Mode::Restore, self.config, &mut *on_progress);
        loop {
            if self.cancel.is_cancelled() {
                completion = Completion::Cancelled;
                break;
            }
            let Some(mut data) = reader.next_chunk().map_err(corrupt)? else {
                break;
            };
            let sectors = geometry.sectors_for(data.len() as u64);
            if transfer.cursor_sector + sectors > geometry.total_sectors {
                return Err(ImagingError::new(
                    ErrorCategory::Write,
                    "The image file holds more data than fits on the selected device.",
                ));
            }
            data.resize((sectors * geometry.sector_size) as usize, 0);
            handle.write_sectors(transfer.cursor_sector, &data, &geometry)?;

            transfer.cursor_sector += sectors;
            reporter.report(
                ratio(reader.consumed(), file_len),
                transfer.cursor_sector * geometry.sector_size,
            );
        }
        handle.flush()?;

        let bytes_transferred = transfer.bytes_moved();
        if completion == Completion::Cancelled {
            info!(sectors = transfer.cursor_sector, "restore cancelled");
            return Ok(Outcome::cancelled(bytes_transferred));
        }

        let verified = if verify_after {
            match self.verify_pass(&mut transfer, device, source, on_progress)? {
                Completion::Completed => true,
                Completion::Cancelled => return Ok(Outcome::cancelled(bytes_transferred)),
            }
        } else {
            false
        };

        info!(bytes = bytes_transferred, "restore finished");
        Ok(Outcome {
            completion: Completion::Completed,
            bytes_transferred,
            verified,
            digest: None,
        })
    }

    /// Compares `device` against the container at `image`.
    ///
    /// # Errors
    ///
    /// Returns a `Verify` error naming the first differing sector, or the
    /// error that stopped the device or file from being read.
    pub fn verify(
        &self,
        device: &DeviceRecord,
        image: &Path,
        on_progress: &mut dyn FnMut(ProgressUpdate),
    ) -> Result<Outcome> {
        open_image(image)?;
        check_image_location(self.platform, device, image)?;
        info!(device = %device.identity, image = %image.display(), "verifying disk image");

        let mut transfer = TransferState::new(Mode::Verify, volume::lock_all(self.platform, device)?);
        let completion = self.verify_pass(&mut transfer, device, image, on_progress)?;

        Ok(Outcome {
            completion,
            bytes_transferred: transfer.bytes_moved(),
            verified: completion == Completion::Completed,
            digest: None,
        })
    }

    /// Re-opens the device for reading and compares it chunk by chunk with
    /// the container. The first differing chunk fails the pass.
    fn verify_pass(
        &self,
        transfer: &mut TransferState,
        device: &DeviceRecord,
        image: &Path,
        on_progress: &mut dyn FnMut(ProgressUpdate),
    ) -> Result<Completion> {
        transfer.mode = Mode::Verify;
        transfer.cursor_sector = 0;
        if let Some(mut previous) = transfer.device.take() {
            previous.close();
        }

        let handle = transfer.device.insert(channel::open_device(
            self.platform,
            device.identity,
            AccessMode::Read,
        )?);
        let geometry = handle.query_geometry()?;
        transfer.sector_size = geometry.sector_size;

        let file = File::open(image).map_err(|e| {
            ImagingError::with_os(ErrorCategory::File, "Cannot open image file.", &e)
        })?;
        let file_len = file.metadata().map(|m| m.len()).unwrap_or_default();
        let verify_error = |e: io::Error| {
            ImagingError::with_os(
                ErrorCategory::Verify,
                "An error occurred when reading the image file.",
                &e,
            )
        };
        let mut reader = ContainerReader::new(BufReader::new(file), self.config.max_chunk_bytes);
        reader.read_header().map_err(verify_error)?;

        let mut reporter = Reporter::new(Mode::Verify, self.config, on_progress);
        loop {
            if self.cancel.is_cancelled() {
                info!(sectors = transfer.cursor_sector, "verify cancelled");
                return Ok(Completion::Cancelled);
            }
            let Some(expected) = reader.next_chunk().map_err(verify_error)? else {
                break;
            };
            let sectors = geometry.sectors_for(expected.len() as u64);
            if transfer.cursor_sector + sectors > geometry.total_sectors {
                return Err(ImagingError::new(
                    ErrorCategory::Verify,
                    "The image file holds more data than the device.",
                ));
            }

            let actual = handle
                .read_sectors(transfer.cursor_sector, sectors, &geometry)
                .map_err(|e| e.recategorize(ErrorCategory::Verify))?;
            if let Some(offset) = first_difference(&expected, &actual) {
                let sector = transfer.cursor_sector + offset as u64 / geometry.sector_size;
                warn!(sector, "verify mismatch");
                return Err(ImagingError::new(
                    ErrorCategory::Verify,
                    format!("Data from image file and disk is NOT identical (first difference in sector {sector})."),
                ));
            }

            transfer.cursor_sector += sectors;
            reporter.report(
                ratio(reader.consumed(), file_len),
                transfer.cursor_sector * geometry.sector_size,
            );
        }

        info!(sectors = transfer.cursor_sector, "verify finished");
        Ok(Completion::Completed)
    }
}

fn first_difference(expected: &[u8], actual: &[u8]) -> Option<usize> {
    expected
        .iter()
        .zip(actual)
        .position(|(a, b)| a != b)
        .or_else(|| (actual.len() < expected.len()).then_some(actual.len()))
}

/// Checks that `path` names a readable, non-empty file and opens it.
fn open_image(path: &Path) -> Result<File> {
    if path.as_os_str().is_empty() {
        return Err(ImagingError::new(
            ErrorCategory::File,
            "Please specify an image file to restore from.",
        ));
    }
    let metadata = match fs::metadata(path) {
        Ok(metadata) if metadata.is_file() => metadata,
        Ok(_) => {
            return Err(ImagingError::new(
                ErrorCategory::File,
                "The selected file does not exist.",
            ));
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(ImagingError::with_os(
                ErrorCategory::File,
                "The selected file does not exist.",
                &e,
            ));
        }
        Err(e) => {
            return Err(ImagingError::with_os(
                ErrorCategory::File,
                "Cannot access the selected file.",
                &e,
            ));
        }
    };
    if metadata.len() == 0 {
        return Err(ImagingError::new(
            ErrorCategory::File,
            "The specified file contains no data.",
        ));
    }
    File::open(path).map_err(|e| {
        let message = if e.kind() == io::ErrorKind::PermissionDenied {
            "You do not have permission to read the selected file."
        } else {
            "Cannot open specified image file."
        };
        ImagingError::with_os(ErrorCategory::File, message, &e)
    })
}
