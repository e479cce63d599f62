//! Runtime tuning for enumeration and imaging.
use crate::platform::{BusType, DriveProbe, DriveType};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use std::{fs, io};
use thiserror::Error;

/// Sectors per container chunk.
pub const DEFAULT_CHUNK_SECTORS: u64 = 4096;

/// Largest sector size a chunk must be able to hold.
const MAX_SECTOR_SIZE: u64 = 4096;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io { path: String, source: io::Error },

    #[error("invalid config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },

    #[error("invalid config file {path}: {reason}")]
    Invalid { path: String, reason: String },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImagingConfig {
    /// Sectors read, compressed and written per chunk.
    pub chunk_sectors: u64,
    /// Interval between throughput samples.
    pub tick_interval_ms: u64,
    /// Bus types accepted when a drive reports itself as fixed. Many USB
    /// enclosures and card readers do.
    pub removable_bus_types: Vec<BusType>,
    /// Bus types rejected even when a drive reports itself as removable.
    pub reject_removable_bus_types: Vec<BusType>,
    /// Largest decompressed chunk accepted from a container file.
    pub max_chunk_bytes: u64,
}

impl Default for ImagingConfig {
    fn default() -> Self {
        Self {
            chunk_sectors: DEFAULT_CHUNK_SECTORS,
            tick_interval_ms: 1000,
            removable_bus_types: vec![BusType::Usb, BusType::Sd, BusType::Mmc],
            reject_removable_bus_types: vec![BusType::Sata],
            max_chunk_bytes: 64 * 1024 * 1024,
        }
    }
}

impl ImagingConfig {
    /// Loads a TOML config file. Keys that are absent keep their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate().map_err(|reason| ConfigError::Invalid {
            path: path.display().to_string(),
            reason,
        })?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), String> {
        if !(MAX_SECTOR_SIZE..=u64::from(u32::MAX)).contains(&self.max_chunk_bytes) {
            return Err(format!(
                "max_chunk_bytes must be between {MAX_SECTOR_SIZE} and {}",
                u32::MAX
            ));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// The chunk size for a device with `sector_size` byte sectors.
    ///
    /// Never less than one sector, and never more than a container reader
    /// built from this config accepts back.
    pub fn chunk_sectors_for(&self, sector_size: u64) -> u64 {
        let limit = self.max_chunk_bytes.min(u64::from(u32::MAX)) / sector_size.max(1);
        self.chunk_sectors.min(limit).max(1)
    }

    /// Whether a probed drive should be offered for imaging.
    ///
    /// Removable drives are accepted unless their bus is on the reject list;
    /// fixed drives only when their bus is on the removable-bus list.
    pub fn accepts(&self, probe: &DriveProbe) -> bool {
        if probe.is_system {
            return false;
        }
        match probe.drive_type {
            DriveType::Removable => !self.reject_removable_bus_types.contains(&probe.bus_type),
            DriveType::Fixed => self.removable_bus_types.contains(&probe.bus_type),
            DriveType::Other => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe(drive_type: DriveType, bus_type: BusType) -> DriveProbe {
        DriveProbe {
            drive_type,
            bus_type,
            is_system: false,
        }
    }

    #[test]
    fn default_policy_matches_removable_heuristic() {
        let config = ImagingConfig::default();
        assert!(config.accepts(&probe(DriveType::Removable, BusType::Usb)));
        assert!(config.accepts(&probe(DriveType::Removable, BusType::Unknown)));
        assert!(!config.accepts(&probe(DriveType::Removable, BusType::Sata)));
        assert!(config.accepts(&probe(DriveType::Fixed, BusType::Usb)));
        assert!(config.accepts(&probe(DriveType::Fixed, BusType::Sd)));
        assert!(config.accepts(&probe(DriveType::Fixed, BusType::Mmc)));
        assert!(!config.accepts(&probe(DriveType::Fixed, BusType::Sata)));
        assert!(!config.accepts(&probe(DriveType::Fixed, BusType::Nvme)));
        assert!(!config.accepts(&probe(DriveType::Other, BusType::Usb)));
    }

    #[test]
    fn system_drive_is_never_accepted() {
        let config = ImagingConfig::default();
        let mut p = probe(DriveType::Removable, BusType::Usb);
        p.is_system = true;
        assert!(!config.accepts(&p));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let config: ImagingConfig = toml::from_str(
            "chunk_sectors = 128\nremovable_bus_types = [\"usb\", \"nvme\"]\n",
        )
        .unwrap();
        assert_eq!(config.chunk_sectors, 128);
        assert_eq!(config.removable_bus_types, vec![BusType::Usb, BusType::Nvme]);
        assert_eq!(config.tick_interval_ms, 1000);
        assert_eq!(config.reject_removable_bus_types, vec![BusType::Sata]);
    }

    #[test]
    fn chunk_size_stays_within_what_the_reader_accepts() {
        let config = ImagingConfig {
            chunk_sectors: 200_000,
            ..Default::default()
        };
        assert_eq!(config.chunk_sectors_for(512), 131_072);
        assert_eq!(config.chunk_sectors_for(4096), 16_384);

        let config = ImagingConfig {
            chunk_sectors: 0,
            ..Default::default()
        };
        assert_eq!(config.chunk_sectors_for(512), 1);
    }

    #[test]
    fn tiny_chunk_limit_is_rejected_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clonr.toml");
        fs::write(&path, "max_chunk_bytes = 100\n").unwrap();

        let err = ImagingConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
        assert!(err.to_string().contains("max_chunk_bytes"));

        fs::write(&path, "chunk_sectors = 200000\n").unwrap();
        assert_eq!(ImagingConfig::load(&path).unwrap().chunk_sectors, 200_000);
    }
}
