use anyhow::{Context, Result, anyhow, bail};
use clap::{ArgAction, Args, Parser, Subcommand};
use clonr_core::settings::{FileSettings, MemorySettings, SettingsStore};
use clonr_core::{DeviceIdentity, DeviceRecord, Imager, ImagingConfig, ImagingState, Mode, platform};
use console::style;
use dialoguer::{Confirm, Input, Select, theme::ColorfulTheme};
use indicatif::{ProgressBar, ProgressStyle};
use std::fs;
use std::io::{IsTerminal, stdout};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
use libc::ECHOCTL;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
#[cfg(unix)]
use termios::{TCSANOW, Termios, tcsetattr};

/// Progress bar resolution.
const BAR_LENGTH: u64 = 1000;

#[derive(Parser)]
#[command(name = "clonr")]
#[command(about = "A safe, interactive tool for imaging removable media", version)]
struct Cli {
    /// Increase log output (-v for info, -vv for debug)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Read tuning options from a TOML file
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List available removable devices
    List,
    /// Image a device into a compressed image file
    Create {
        /// Output image file (prompted for when omitted)
        image: Option<PathBuf>,

        /// Compare the device against the new image afterwards
        #[arg(long)]
        verify: bool,

        /// Write a SHA-256 checksum file next to the image
        #[arg(long)]
        checksum: bool,

        #[command(flatten)]
        target: Target,
    },
    /// Write an image file back onto a device
    Restore {
        /// Image file to restore (prompted for when omitted)
        image: Option<PathBuf>,

        /// Compare the device against the image afterwards
        #[arg(long)]
        verify: bool,

        #[command(flatten)]
        target: Target,
    },
    /// Compare a device against an image file
    Verify {
        /// Image file to compare with (prompted for when omitted)
        image: Option<PathBuf>,

        #[command(flatten)]
        target: Target,
    },
}

#[derive(Args)]
struct Target {
    /// Device number as shown by `clonr list`
    #[arg(short, long, value_name = "ID")]
    device: Option<u32>,

    /// Do not ask for confirmation
    #[arg(short, long)]
    yes: bool,
}

/// Disables `ECHOCTL` on Unix terminals so Ctrl+C is not echoed as `^C`
/// over the progress bar. The original settings are restored on drop.
struct TermRestorer {
    #[cfg(unix)]
    original_termios: Option<Termios>,
}

impl TermRestorer {
    fn new() -> Self {
        #[cfg(unix)]
        {
            let fd = stdout().as_raw_fd();
            let original_termios = stdout()
                .is_terminal()
                .then(|| Termios::from_fd(fd).ok())
                .flatten()
                .filter(|original| {
                    let mut quiet = *original;
                    quiet.c_lflag &= !ECHOCTL;
                    tcsetattr(fd, TCSANOW, &quiet).is_ok()
                });
            Self { original_termios }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }
}

impl Drop for TermRestorer {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(ref original_termios) = self.original_termios {
            tcsetattr(stdout().as_raw_fd(), TCSANOW, original_termios).ok();
        }
    }
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// `$XDG_CONFIG_HOME/clonr/settings.toml`, `~/.config/clonr/settings.toml`,
/// or `%APPDATA%\clonr\settings.toml` on Windows.
fn settings_path() -> Option<PathBuf> {
    let base = if cfg!(windows) {
        std::env::var_os("APPDATA").map(PathBuf::from)
    } else {
        std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
    };
    base.map(|dir| dir.join("clonr").join("settings.toml"))
}

fn open_settings() -> Box<dyn SettingsStore> {
    let Some(path) = settings_path() else {
        return Box::new(MemorySettings::default());
    };
    match FileSettings::open(&path) {
        Ok(settings) => Box::new(settings),
        Err(err) => {
            warn!(path = %path.display(), "settings not loaded: {err}");
            Box::new(MemorySettings::default())
        }
    }
}

/// Picks the device named on the command line, or asks for one.
fn select_device(devices: &[DeviceRecord], requested: Option<u32>, prompt: &str) -> Result<DeviceRecord> {
    if devices.is_empty() {
        return Err(anyhow!("No removable devices found."));
    }

    if let Some(id) = requested {
        return devices
            .iter()
            .find(|d| d.identity == DeviceIdentity(id))
            .cloned()
            .ok_or_else(|| anyhow!("No removable device {id}. Run `clonr list` to see available devices."));
    }

    let items: Vec<String> = devices.iter().map(|d| d.to_string()).collect();
    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .items(&items)
        .default(0)
        .interact()?;

    Ok(devices[selection].clone())
}

/// Uses the image path given on the command line, or asks for one starting
/// in the folder of the last image used.
fn resolve_image(image: Option<PathBuf>, home: Option<PathBuf>, prompt: &str) -> Result<PathBuf> {
    if let Some(image) = image {
        return Ok(image);
    }
    let initial = home
        .map(|dir| format!("{}{}", dir.display(), std::path::MAIN_SEPARATOR))
        .unwrap_or_default();
    let answer: String = Input::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .with_initial_text(initial)
        .interact_text()?;
    Ok(PathBuf::from(answer.trim()))
}

/// Presents a final "Yes/No" confirmation to the user.
fn confirm_operation(prompt: &str, assume_yes: bool) -> Result<bool> {
    if assume_yes {
        return Ok(true);
    }
    let confirmation = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?;

    Ok(confirmation)
}

fn bar_style(mode: Mode) -> Result<ProgressStyle> {
    let colors = match mode {
        Mode::Create | Mode::Restore => "green/black",
        Mode::Verify => "magenta/black",
    };
    let template = format!("{{prefix:12}} [{{elapsed_precise}}] [{{bar:40.{colors}}}] {{percent:>3}}% {{msg}}");
    Ok(ProgressStyle::default_bar().template(&template)?.progress_chars("■ "))
}

fn bar_prefix(mode: Mode) -> &'static str {
    match mode {
        Mode::Create => "Reading",
        Mode::Restore => "Writing",
        Mode::Verify => "Verifying",
    }
}

/// Starts an operation and drives a progress bar from the imager's state
/// updates until it finishes.
fn run_operation(imager: &Imager, start: impl FnOnce(&Imager) -> clonr_core::Result<()>) -> Result<ImagingState> {
    let updates = imager.subscribe();
    start(imager)?;

    let bar = ProgressBar::new(BAR_LENGTH);
    let mut shown: Option<Mode> = None;
    while let Ok(state) = updates.recv() {
        let Some(mode) = state.busy_mode else {
            break;
        };
        if shown != Some(mode) {
            if let Some(previous) = shown {
                bar.println(format!("{:12} done.", bar_prefix(previous)));
            }
            bar.set_style(bar_style(mode)?);
            bar.set_prefix(bar_prefix(mode));
            bar.reset();
            shown = Some(mode);
        }
        bar.set_position((state.progress * BAR_LENGTH as f64) as u64);
        bar.set_message(state.throughput_label.clone());
    }

    let state = imager.wait();
    match (&state.last_error_message, &state.last_outcome) {
        (Some(_), _) => bar.abandon_with_message("❌ Operation failed."),
        (None, Some(outcome)) if outcome.is_cancelled() => bar.abandon_with_message("Cancelled."),
        _ => bar.finish_with_message("Done."),
    }
    Ok(state)
}

/// Turns a finished state into the command's result.
fn conclude(state: &ImagingState) -> Result<()> {
    if let Some(error) = &state.last_error_message {
        let category = state
            .last_error_category
            .map(|c| c.to_string())
            .unwrap_or_default();
        bail!("{}: {category}: {error}", state.message);
    }
    if state.last_outcome.as_ref().is_some_and(|o| o.is_cancelled()) {
        bail!("{}", state.message);
    }
    Ok(())
}

/// Writes `<image>.sha256` in the format `sha256sum -c` reads.
fn write_checksum(image: &Path, digest: &str) -> Result<PathBuf> {
    let mut sidecar = image.as_os_str().to_owned();
    sidecar.push(".sha256");
    let sidecar = PathBuf::from(sidecar);
    let name = image
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    fs::write(&sidecar, format!("{digest}  {name}\n"))
        .with_context(|| format!("Cannot write checksum file {}", sidecar.display()))?;
    Ok(sidecar)
}

fn list(imager: &Imager) -> Result<()> {
    let devices = imager.enumerate()?;
    if devices.is_empty() {
        println!("No removable devices found.");
        return Ok(());
    }

    println!("Found {} removable devices:", devices.len());
    println!("\n  {:<6} {:<30} {}", "ID", "DEVICE", "VOLUMES");
    println!("  {:-<6} {:-<30} {:-<20}", "", "", "");
    for device in devices {
        let volumes: Vec<&str> = device.volumes().iter().map(|v| v.as_str()).collect();
        println!(
            "  {:<6} {:<30} {}",
            device.identity,
            device.display_label(),
            volumes.join(", ")
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    // This guard will be dropped when main() exits, restoring the terminal.
    let _term_restorer = TermRestorer::new();

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match &cli.config {
        Some(path) => ImagingConfig::load(path)?,
        None => ImagingConfig::default(),
    };
    debug!(?config, "configuration");

    let imager = Imager::new(Arc::from(platform::native()), config, open_settings());

    // Ctrl+C stops the running operation at the next chunk boundary.
    let cancel = imager.cancel_token();
    ctrlc::set_handler(move || cancel.cancel())?;

    match cli.command {
        Commands::List => list(&imager)?,
        Commands::Create {
            image,
            verify,
            checksum,
            target,
        } => {
            let devices = imager.enumerate()?;
            let device = select_device(&devices, target.device, "Select the source device to READ from")?;
            imager.select_device(Some(device.identity));
            let image = resolve_image(image, imager.home_dir(), "Save the image as")?;

            println!("This will read '{}'.", device.display_label());
            println!("  Device: {}", style(device.identity).cyan());
            println!("  Output: {}", style(image.display()).cyan());
            println!();

            if !confirm_operation("Are you sure you want to proceed?", target.yes)? {
                println!("Create operation cancelled.");
                return Ok(());
            }
            println!();

            imager.set_image_path(Some(image.clone()));
            let state = run_operation(&imager, |imager| {
                imager.start_create(device.identity, image.clone(), verify)
            })?;
            conclude(&state)?;

            if let Some(digest) = state.last_outcome.as_ref().and_then(|o| o.digest.as_deref()) {
                println!("  SHA-256: {}", style(digest).dim());
                if checksum {
                    let sidecar = write_checksum(&image, digest)?;
                    println!("  Checksum written to {}", style(sidecar.display()).cyan());
                }
            }
            println!(
                "\n✨ Successfully imaged {} to {}.",
                style(device.display_label()).cyan(),
                style(image.display()).cyan()
            );
        }
        Commands::Restore {
            image,
            verify,
            target,
        } => {
            let devices = imager.enumerate()?;
            let device = select_device(&devices, target.device, "Select the target device to WRITE to")?;
            imager.select_device(Some(device.identity));
            let image = resolve_image(image, imager.home_dir(), "Image file to restore")?;

            println!(
                "{} This will erase all data on '{}'.",
                style("WARNING:").red().bold(),
                device.display_label(),
            );
            println!("  Device: {}", style(device.identity).cyan());
            println!("  Image:  {}", style(image.display()).cyan());
            println!();

            if !confirm_operation("Are you sure you want to proceed?", target.yes)? {
                println!("Restore operation cancelled.");
                return Ok(());
            }
            println!();

            imager.set_image_path(Some(image.clone()));
            let state = run_operation(&imager, |imager| {
                imager.start_restore(device.identity, image.clone(), verify)
            })?;
            conclude(&state)?;
            println!(
                "\n✨ Successfully restored {} with {}.",
                style(device.display_label()).cyan(),
                style(image.display()).cyan()
            );
        }
        Commands::Verify { image, target } => {
            let devices = imager.enumerate()?;
            let device = select_device(&devices, target.device, "Select the device to VERIFY")?;
            imager.select_device(Some(device.identity));
            let image = resolve_image(image, imager.home_dir(), "Image file to compare with")?;

            imager.set_image_path(Some(image.clone()));
            let state = run_operation(&imager, |imager| imager.start_verify(device.identity, image.clone()))?;
            conclude(&state)?;
            println!(
                "\n✨ {} matches {}.",
                style(device.display_label()).cyan(),
                style(image.display()).cyan()
            );
        }
    }

    Ok(())
}
