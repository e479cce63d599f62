//! Discovers removable devices and groups their volumes by physical device.
use crate::channel::{self, AccessMode};
use crate::config::ImagingConfig;
use crate::device::{DeviceRecord, VolumeLabel};
use crate::error::{ErrorCategory, ImagingError, Result};
use crate::platform::{MediaCheck, Platform};
use tracing::{debug, info, warn};

/// Enumerates removable devices through a [`Platform`].
pub struct DeviceCatalog<'a> {
    platform: &'a dyn Platform,
    config: &'a ImagingConfig,
}

impl<'a> DeviceCatalog<'a> {
    pub fn new(platform: &'a dyn Platform, config: &'a ImagingConfig) -> Self {
        Self { platform, config }
    }

    /// Scans every volume and returns one record per removable physical
    /// device, in order of first discovery.
    ///
    /// Volumes whose drive is not removable, or has no media, are skipped
    /// silently. Once a volume has been accepted, any failure to resolve its
    /// device or read the device's geometry aborts the whole pass.
    pub fn enumerate(&self) -> Result<Vec<DeviceRecord>> {
        let labels = self.platform.volume_labels().map_err(|e| {
            ImagingError::with_os(
                ErrorCategory::Device,
                "An error occurred when listing the system's volumes.",
                &e,
            )
        })?;

        let mut records: Vec<DeviceRecord> = Vec::new();
        for label in labels {
            if !self.is_removable(&label) {
                continue;
            }

            let identity = self.platform.device_identity(&label).map_err(|e| {
                ImagingError::with_os(
                    ErrorCategory::Volume,
                    format!("An error occurred when attempting to get information on volume {label}."),
                    &e,
                )
            })?;

            let index = match records.iter().position(|r| r.identity == identity) {
                Some(index) => index,
                None => {
                    let mut device = channel::open_device(self.platform, identity, AccessMode::Read)?;
                    let geometry = device.query_geometry()?;
                    device.close();

                    let record = DeviceRecord::new(identity, geometry.total_bytes());
                    debug!(device = %identity, label = %record, "new removable device");
                    records.push(record);
                    records.len() - 1
                }
            };
            records[index].append_volume(label);
        }

        info!(devices = records.len(), "enumerated removable devices");
        Ok(records)
    }

    fn is_removable(&self, label: &VolumeLabel) -> bool {
        let probe = match self.platform.probe_volume(label) {
            Ok(probe) => probe,
            Err(e) => {
                warn!(volume = %label, error = %e, "skipping volume, probe failed");
                return false;
            }
        };
        if !self.config.accepts(&probe) {
            debug!(volume = %label, ?probe, "skipping volume, not removable");
            return false;
        }

        if self.platform.check_media(label, MediaCheck::Fast) {
            return true;
        }
        // Some buses fail the fast check; retry once the slow way.
        if self.platform.check_media(label, MediaCheck::Thorough) {
            return true;
        }
        warn!(volume = %label, "skipping volume, no media present");
        false
    }
}
