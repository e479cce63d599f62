//! The imaging state machine shared by front-ends.
//!
//! An [`Imager`] owns the device list, the current selection and at most one
//! running operation. Operations run on a worker thread; every state change
//! is published to subscribers as a full [`ImagingState`] snapshot.
use crate::catalog::DeviceCatalog;
use crate::config::ImagingConfig;
use crate::device::{DeviceIdentity, DeviceRecord, VolumeLabel};
use crate::error::{ErrorCategory, ImagingError, Result};
use crate::pipeline::{self, CancelToken, Completion, Mode, Outcome, Pipeline, ProgressUpdate};
use crate::platform::Platform;
use crate::settings::{HOME_DIR_KEY, SettingsStore};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

const IDLE_MESSAGE: &str = "Please choose create or restore image";

/// A snapshot of what a front-end should display.
#[derive(Clone, Debug, PartialEq)]
pub struct ImagingState {
    /// The mode currently running, if any. Switches to [`Mode::Verify`]
    /// during the verify pass of a create or restore.
    pub busy_mode: Option<Mode>,
    pub progress: f64,
    /// e.g. `"Reading speed 12.50 MB/s"`.
    pub throughput_label: String,
    pub message: String,
    pub can_cancel: bool,
    /// A create may be started with the current selection.
    pub can_read: bool,
    /// A restore or verify may be started with the current selection.
    pub can_write: bool,
    pub last_error_category: Option<ErrorCategory>,
    pub last_error_message: Option<String>,
    pub last_outcome: Option<Outcome>,
}

impl Default for ImagingState {
    fn default() -> Self {
        Self {
            busy_mode: None,
            progress: 0.0,
            throughput_label: String::new(),
            message: IDLE_MESSAGE.to_string(),
            can_cancel: false,
            can_read: false,
            can_write: false,
            last_error_category: None,
            last_error_message: None,
            last_outcome: None,
        }
    }
}

impl ImagingState {
    pub fn is_busy(&self) -> bool {
        self.busy_mode.is_some()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceChange {
    Arrived,
    Removed,
}

/// A device arrival or removal reported by the OS.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HotplugEvent {
    /// The volume the OS named in the notification, when it named one.
    pub volume_hint: Option<VolumeLabel>,
    pub change: DeviceChange,
}

enum Transition {
    Started(Mode),
    Progress(ProgressUpdate),
    Finished { mode: Mode, result: Result<Outcome> },
    Rejected { mode: Mode, category: ErrorCategory, message: String },
    Selection,
}

struct Core {
    state: ImagingState,
    devices: Vec<DeviceRecord>,
    selected: Option<DeviceIdentity>,
    image_path: Option<PathBuf>,
    rescan_pending: bool,
}

impl Core {
    fn apply(&mut self, transition: Transition) {
        match transition {
            Transition::Started(mode) => {
                self.state.busy_mode = Some(mode);
                self.state.progress = 0.0;
                self.state.throughput_label.clear();
                self.state.message.clear();
                self.state.can_cancel = true;
                self.state.last_error_category = None;
                self.state.last_error_message = None;
                self.state.last_outcome = None;
            }
            Transition::Progress(update) => {
                if self.state.busy_mode.is_none() {
                    return;
                }
                self.state.busy_mode = Some(update.mode);
                self.state.progress = update.fraction;
                if let Some(throughput) = update.throughput {
                    self.state.throughput_label = format!(
                        "{} {:.2} MB/s",
                        update.mode.speed_label(),
                        throughput.mb_per_sec()
                    );
                }
            }
            Transition::Finished { mode, result } => {
                self.state.busy_mode = None;
                self.state.progress = 0.0;
                self.state.throughput_label.clear();
                self.state.can_cancel = false;
                match result {
                    Ok(outcome) => {
                        self.state.message = match outcome.completion {
                            Completion::Completed => format!("{} succeeded.", mode.title()),
                            Completion::Cancelled => format!("{} cancelled.", mode.title()),
                        };
                        self.state.last_outcome = Some(outcome);
                    }
                    Err(err) => {
                        let failed = match err.category() {
                            ErrorCategory::Verify => Mode::Verify,
                            _ => mode,
                        };
                        self.state.message = format!("{} failed", failed.title());
                        self.state.last_error_category = Some(err.category());
                        self.state.last_error_message = Some(err.to_string());
                    }
                }
            }
            Transition::Rejected { mode, category, message } => {
                self.state.message = format!("{} failed", mode.title());
                self.state.last_error_category = Some(category);
                self.state.last_error_message = Some(message);
            }
            Transition::Selection => {}
        }
        self.refresh_permissions();
    }

    fn selected_record(&self) -> Option<&DeviceRecord> {
        let identity = self.selected?;
        self.devices.iter().find(|d| d.identity == identity)
    }

    fn refresh_permissions(&mut self) {
        let ready = !self.state.is_busy() && self.selected_record().is_some();
        let path = self.image_path.as_deref().filter(|p| !p.as_os_str().is_empty());
        let (can_read, can_write) = match (ready, path) {
            (true, Some(path)) => (is_writable_target(path), File::open(path).is_ok()),
            _ => (false, false),
        };
        self.state.can_read = can_read;
        self.state.can_write = can_write;
    }

    fn replace_devices(&mut self, devices: Vec<DeviceRecord>) {
        let keep = self
            .selected
            .is_some_and(|id| devices.iter().any(|d| d.identity == id));
        if !keep {
            self.selected = devices.first().map(|d| d.identity);
        }
        self.devices = devices;
        self.refresh_permissions();
    }
}

/// An existing file must not be read-only; a new one may always be created.
fn is_writable_target(path: &Path) -> bool {
    match fs::metadata(path) {
        Ok(metadata) => metadata.is_file() && !metadata.permissions().readonly(),
        Err(_) => true,
    }
}

struct Shared {
    platform: Arc<dyn Platform>,
    config: ImagingConfig,
    cancel: CancelToken,
    settings: Mutex<Box<dyn SettingsStore>>,
    core: Mutex<Core>,
    subscribers: Mutex<Vec<Sender<ImagingState>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn publish(&self, state: ImagingState) {
        lock(&self.subscribers).retain(|tx| tx.send(state.clone()).is_ok());
    }

    fn apply(&self, transition: Transition) {
        let state = {
            let mut core = lock(&self.core);
            core.apply(transition);
            core.state.clone()
        };
        self.publish(state);
    }

    /// Runs a catalog pass with the core locked, so no operation can start
    /// while devices are being opened.
    fn enumerate_locked(&self, core: &mut Core) -> Result<Vec<DeviceRecord>> {
        let devices = DeviceCatalog::new(self.platform.as_ref(), &self.config).enumerate()?;
        core.replace_devices(devices.clone());
        core.rescan_pending = false;
        Ok(devices)
    }

    fn run(&self, mode: Mode, record: DeviceRecord, image: PathBuf, verify_after: bool) {
        let pipeline = Pipeline::new(self.platform.as_ref(), &self.config, &self.cancel);
        let mut on_progress = |update: ProgressUpdate| self.apply(Transition::Progress(update));
        let result = match mode {
            Mode::Create => pipeline.create(&record, &image, verify_after, &mut on_progress),
            Mode::Restore => pipeline.restore(&record, &image, verify_after, &mut on_progress),
            Mode::Verify => pipeline.verify(&record, &image, &mut on_progress),
        };
        match &result {
            Ok(outcome) => info!(?mode, completion = ?outcome.completion, "operation finished"),
            Err(err) => error!(?mode, category = %err.category(), "{err}"),
        }
        self.apply(Transition::Finished { mode, result });
        self.rescan_if_pending();
    }

    fn rescan_if_pending(&self) {
        let state = {
            let mut core = lock(&self.core);
            if !core.rescan_pending || core.state.is_busy() {
                return;
            }
            debug!("running deferred device rescan");
            if let Err(err) = self.enumerate_locked(&mut core) {
                warn!("deferred device rescan failed: {err}");
                core.rescan_pending = false;
            }
            core.state.clone()
        };
        self.publish(state);
    }
}

/// Drives create, restore and verify operations against one platform.
pub struct Imager {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Imager {
    pub fn new(
        platform: Arc<dyn Platform>,
        config: ImagingConfig,
        settings: Box<dyn SettingsStore>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                platform,
                config,
                cancel: CancelToken::new(),
                settings: Mutex::new(settings),
                core: Mutex::new(Core {
                    state: ImagingState::default(),
                    devices: Vec::new(),
                    selected: None,
                    image_path: None,
                    rescan_pending: false,
                }),
                subscribers: Mutex::new(Vec::new()),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ImagingConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ImagingState {
        lock(&self.shared.core).state.clone()
    }

    pub fn is_busy(&self) -> bool {
        lock(&self.shared.core).state.is_busy()
    }

    /// Returns a channel receiving every state change from now on.
    pub fn subscribe(&self) -> Receiver<ImagingState> {
        let (tx, rx) = mpsc::channel();
        lock(&self.shared.subscribers).push(tx);
        rx
    }

    pub fn devices(&self) -> Vec<DeviceRecord> {
        lock(&self.shared.core).devices.clone()
    }

    pub fn selected_device(&self) -> Option<DeviceRecord> {
        lock(&self.shared.core).selected_record().cloned()
    }

    /// Rebuilds the device list, keeping the selection when the selected
    /// device is still present.
    ///
    /// # Errors
    ///
    /// Returns a `Busy` error while an operation runs, or the enumeration
    /// error, in which case the previous list is kept.
    pub fn enumerate(&self) -> Result<Vec<DeviceRecord>> {
        let (devices, state) = {
            let mut core = lock(&self.shared.core);
            if core.state.is_busy() {
                return Err(ImagingError::new(
                    ErrorCategory::Busy,
                    "Devices cannot be listed while an operation is running.",
                ));
            }
            let devices = self.shared.enumerate_locked(&mut core)?;
            (devices, core.state.clone())
        };
        self.shared.publish(state);
        Ok(devices)
    }

    /// Reacts to a device arrival or removal. While an operation runs the
    /// rescan is deferred until it finishes and `None` is returned.
    pub fn handle_hotplug(&self, event: &HotplugEvent) -> Option<Result<Vec<DeviceRecord>>> {
        {
            let mut core = lock(&self.shared.core);
            if core.state.is_busy() {
                debug!(?event, "deferring device rescan until the operation ends");
                core.rescan_pending = true;
                return None;
            }
        }
        debug!(?event, "device change, rescanning");
        Some(self.enumerate())
    }

    pub fn select_device(&self, identity: Option<DeviceIdentity>) {
        {
            let mut core = lock(&self.shared.core);
            let known = identity.filter(|id| core.devices.iter().any(|d| d.identity == *id));
            core.selected = known;
        }
        self.shared.apply(Transition::Selection);
    }

    /// Sets the image path and remembers its folder when the file exists.
    pub fn set_image_path(&self, path: Option<PathBuf>) {
        if let Some(folder) = path
            .as_deref()
            .filter(|p| p.is_file())
            .and_then(Path::parent)
        {
            let value = folder.to_string_lossy();
            if let Err(err) = lock(&self.shared.settings).set(HOME_DIR_KEY, &value) {
                warn!("could not remember image folder: {err}");
            }
        }
        lock(&self.shared.core).image_path = path;
        self.shared.apply(Transition::Selection);
    }

    /// The folder of the last image file used, if one was remembered.
    pub fn home_dir(&self) -> Option<PathBuf> {
        lock(&self.shared.settings).get(HOME_DIR_KEY).map(PathBuf::from)
    }

    /// Starts imaging `device` into `destination` on the worker thread.
    ///
    /// Returns as soon as the worker is running; progress and the final
    /// result arrive through [`Imager::subscribe`] and [`Imager::wait`].
    ///
    /// # Arguments
    ///
    /// * `device` - A device from the last enumeration.
    /// * `destination` - Container file to create.
    /// * `verify_after` - If `true`, the run ends with a verify pass.
    ///
    /// # Errors
    ///
    /// This function will return an error, without starting a run, if:
    /// - Another operation is already running (`Busy`).
    /// - `device` is not in the current device list.
    /// - `destination` is empty or lies on one of the device's own volumes.
    ///
    /// Failures during the run are reported in the published state instead.
    pub fn start_create(&self, device: DeviceIdentity, destination: PathBuf, verify_after: bool) -> Result<()> {
        self.start(Mode::Create, device, destination, verify_after)
    }

    /// Starts writing the container at `source` onto `device`. Refused on
    /// the same grounds as [`Imager::start_create`].
    pub fn start_restore(&self, device: DeviceIdentity, source: PathBuf, verify_after: bool) -> Result<()> {
        self.start(Mode::Restore, device, source, verify_after)
    }

    pub fn start_verify(&self, device: DeviceIdentity, image: PathBuf) -> Result<()> {
        self.start(Mode::Verify, device, image, false)
    }

    fn start(&self, mode: Mode, device: DeviceIdentity, image: PathBuf, verify_after: bool) -> Result<()> {
        let mut worker = lock(&self.worker);
        let (record, state) = {
            let mut core = lock(&self.shared.core);
            if core.state.is_busy() {
                return Err(ImagingError::new(
                    ErrorCategory::Busy,
                    "Another operation is already running.",
                ));
            }
            let validated = core
                .devices
                .iter()
                .find(|d| d.identity == device)
                .cloned()
                .ok_or_else(|| ImagingError::new(ErrorCategory::Device, "Please select a device."))
                .and_then(|record| {
                    if image.as_os_str().is_empty() {
                        return Err(ImagingError::new(
                            ErrorCategory::File,
                            "Please specify an image file.",
                        ));
                    }
                    pipeline::check_image_location(self.shared.platform.as_ref(), &record, &image)?;
                    Ok(record)
                });
            let record = match validated {
                Ok(record) => record,
                Err(err) => {
                    core.apply(Transition::Rejected {
                        mode,
                        category: err.category(),
                        message: err.to_string(),
                    });
                    let state = core.state.clone();
                    drop(core);
                    self.shared.publish(state);
                    return Err(err);
                }
            };
            core.selected = Some(device);
            core.image_path = Some(image.clone());
            // Reset before busy is published, never after.
            self.shared.cancel.reset();
            core.apply(Transition::Started(mode));
            (record, core.state.clone())
        };
        self.shared.publish(state);

        // A finished worker from the previous run is only joined here.
        if let Some(previous) = worker.take() {
            if previous.join().is_err() {
                error!("previous imaging worker panicked");
            }
        }

        info!(?mode, device = %device, image = %image.display(), "starting operation");
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("clonr-imaging".into())
            .spawn(move || shared.run(mode, record, image, verify_after));
        match spawned {
            Ok(handle) => {
                *worker = Some(handle);
                Ok(())
            }
            Err(e) => {
                let failure = || ImagingError::with_os(ErrorCategory::Device, "Cannot start the operation.", &e);
                self.shared.apply(Transition::Finished {
                    mode,
                    result: Err(failure()),
                });
                Err(failure())
            }
        }
    }

    /// Requests the running operation stop at its next chunk boundary.
    pub fn cancel(&self) {
        if self.is_busy() {
            info!("cancellation requested");
            self.shared.cancel.cancel();
        }
    }

    /// A token that cancels the running operation, for signal handlers.
    pub fn cancel_token(&self) -> CancelToken {
        self.shared.cancel.clone()
    }

    /// Blocks until the running operation, if any, has finished and published
    /// its final state.
    pub fn wait(&self) -> ImagingState {
        let handle = lock(&self.worker).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("imaging worker panicked");
            }
        }
        self.state()
    }
}

impl Drop for Imager {
    fn drop(&mut self) {
        self.cancel();
        self.wait();
    }
}
