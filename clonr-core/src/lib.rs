//! The core, UI-agnostic library for the `clonr` disk imaging utility.
//!
//! `clonr-core` is designed to be used as a library by any front-end, whether
//! it's a command-line interface (like `clonr`) or a graphical user interface.
//! It finds removable devices, takes their volumes offline and moves raw
//! sectors between a device and a compressed image container.
//!
//! The library is structured into several key modules:
//! - [`catalog`]: Discovers removable devices and groups volumes by device.
//! - [`channel`]: Owned, sector-aligned handles on devices and volumes.
//! - [`volume`]: Locking and unmounting a device's volumes.
//! - [`container`]: The chunked, zlib-compressed image file format.
//! - [`pipeline`]: The synchronous create, restore and verify runs.
//! - [`controller`]: The [`Imager`] state machine that runs operations on a
//!   worker thread and publishes state snapshots.
//! - [`platform`]: The OS seam, with Linux and Windows backends.
//!
//! ## Example: Imaging the First Removable Device
//!
//! ```rust,no_run
//! use clonr_core::{Imager, ImagingConfig, platform, settings::MemorySettings};
//! use std::path::PathBuf;
//! use std::sync::Arc;
//!
//! fn main() -> clonr_core::Result<()> {
//!     let imager = Imager::new(
//!         Arc::from(platform::native()),
//!         ImagingConfig::default(),
//!         Box::new(MemorySettings::default()),
//!     );
//!
//!     let devices = imager.enumerate()?;
//!     let Some(device) = devices.first() else {
//!         println!("No removable devices found.");
//!         return Ok(());
//!     };
//!     println!("Imaging {device}");
//!
//!     let updates = imager.subscribe();
//!     imager.start_create(device.identity, PathBuf::from("card.img"), true)?;
//!     while let Ok(state) = updates.recv() {
//!         if !state.is_busy() {
//!             println!("{}", state.message);
//!             break;
//!         }
//!         println!("{:.0}% {}", state.progress * 100.0, state.throughput_label);
//!     }
//!     imager.wait();
//!     Ok(())
//! }
//! ```

pub mod catalog;
pub mod channel;
pub mod config;
pub mod container;
pub mod controller;
pub mod device;
pub mod error;
pub mod mbr;
pub mod pipeline;
pub mod platform;
pub mod progress;
pub mod settings;
pub mod volume;

pub use config::ImagingConfig;
pub use controller::{DeviceChange, HotplugEvent, Imager, ImagingState};
pub use device::{DeviceIdentity, DeviceRecord, VolumeLabel};
pub use error::{ErrorCategory, ImagingError, Result};
pub use pipeline::{CancelToken, Completion, Mode, Outcome, Pipeline, ProgressUpdate};
