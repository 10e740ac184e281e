use anyhow::{Result, anyhow};
use burnr_core::device::DeviceDescriptor;
use burnr_core::engine::{BurnEngine, BurnEvent, BurnJob, BurnMode, BurnState};
use burnr_core::filesystem::{self, FsKind};
use burnr_core::partition::PartitionScheme;
use burnr_core::registry::{DeviceEvent, DeviceRegistry};
use burnr_core::{image, verify};
use clap::{Parser, Subcommand};
use console::style;
use dialoguer::{Confirm, Select, theme::ColorfulTheme};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{IsTerminal, stdout};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[cfg(unix)]
use libc::ECHOCTL;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
#[cfg(unix)]
use termios::{TCSANOW, Termios, tcsetattr};

#[derive(Parser)]
#[command(name = "burnr")]
#[command(about = "A safe, interactive USB/SD image burning tool", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Burn an image to a removable device interactively
    Burn {
        /// Image file to burn (.iso/.img, optionally .gz/.xz/.zst compressed)
        #[arg(required = true)]
        image: PathBuf,

        /// Target device (selected interactively when omitted)
        #[arg(short, long)]
        device: Option<PathBuf>,

        /// Write mode: raw, uefi, or windows-to-go
        #[arg(short, long, default_value = "raw")]
        mode: BurnMode,

        /// Volume label for the boot partition (uefi/windows-to-go modes)
        #[arg(short, long)]
        label: Option<String>,

        /// Cluster size in bytes for the boot partition filesystem
        #[arg(short, long)]
        cluster_size: Option<u32>,

        /// Skip post-burn verification
        #[arg(short = 'n', long = "no-verify")]
        no_verify: bool,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
    /// Partition and format a removable device
    Format {
        /// Target device (selected interactively when omitted)
        #[arg(short, long)]
        device: Option<PathBuf>,

        /// Filesystem: fat32, ntfs, exfat, or ext4
        #[arg(short, long, default_value = "fat32")]
        fs: FsKind,

        /// Volume label
        #[arg(short, long)]
        label: Option<String>,

        /// Cluster size in bytes
        #[arg(short, long)]
        cluster_size: Option<u32>,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
    /// List available removable devices
    List,
    /// Watch for device insertions and removals
    Watch,
    /// Unmount and eject a removable device
    Eject {
        /// Device to eject
        #[arg(required = true)]
        device: PathBuf,
    },
    /// Verify a device against an image without burning
    Verify {
        /// Image file the device was burned from
        #[arg(required = true)]
        image: PathBuf,

        /// Device to verify
        #[arg(required = true)]
        device: PathBuf,
    },
}

/// A helper struct that, on Unix, disables `ECHOCTL` for the terminal.
///
/// `ECHOCTL` is the terminal flag that causes Ctrl+C to be printed as `^C`.
/// Disabling it gives a cleaner exit when the user cancels a burn, as the
/// `ctrlc` handler reports the cancellation itself. The original terminal
/// state is restored when this struct is dropped.
struct TermRestorer {
    #[cfg(unix)]
    original_termios: Option<Termios>,
}

impl TermRestorer {
    fn new() -> Self {
        #[cfg(unix)]
        {
            let fd = stdout().as_raw_fd();
            if !stdout().is_terminal() {
                return Self {
                    original_termios: None,
                };
            }

            if let Ok(original_termios) = Termios::from_fd(fd) {
                let mut new_termios = original_termios;
                // Disable printing of control characters.
                new_termios.c_lflag &= !ECHOCTL;

                if tcsetattr(fd, TCSANOW, &new_termios).is_ok() {
                    Self {
                        original_termios: Some(original_termios),
                    }
                } else {
                    Self {
                        original_termios: None,
                    }
                }
            } else {
                Self {
                    original_termios: None,
                }
            }
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
            let fd = stdout().as_raw_fd();
            // Restore the original terminal settings.
            tcsetattr(fd, TCSANOW, original_termios).ok();
        }
    }
}

/// Presents an interactive menu for the user to select a device.
fn select_device(devices: &[DeviceDescriptor], prompt: &str) -> Result<DeviceDescriptor> {
    if devices.is_empty() {
        return Err(anyhow!("No removable devices found."));
    }

    let items: Vec<String> = devices.iter().map(|d| d.to_string()).collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .items(&items)
        .default(0)
        .interact()?;

    Ok(devices[selection].clone())
}

/// Resolves the target device: an explicit `--device` path is looked up and
/// pre-flight checked; otherwise the user picks from the removable list.
fn resolve_device(
    registry: &DeviceRegistry,
    device: Option<PathBuf>,
    prompt: &str,
) -> Result<DeviceDescriptor> {
    match device {
        Some(path) => {
            let descriptor = registry.describe(&path)?;
            if !descriptor.removable {
                println!(
                    "{} {} does not look like a removable device.",
                    style("WARNING:").red().bold(),
                    descriptor.path.display()
                );
            }
            Ok(descriptor)
        }
        None => {
            let devices = registry.list_removable()?;
            select_device(&devices, prompt)
        }
    }
}

/// Presents a final "Yes/No" confirmation to the user.
fn confirm_operation(prompt: &str) -> Result<bool> {
    let confirmation = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?;

    Ok(confirmation)
}

fn print_destruction_warning(device: &DeviceDescriptor, image: Option<&Path>) {
    println!(
        "{} This will erase all data on '{}' ({}).",
        style("WARNING:").red().bold(),
        device.display_name(),
        device.size_string,
    );
    if device.is_mounted() {
        println!(
            "{} The device is currently mounted at {} and will be unmounted.",
            style("WARNING:").red().bold(),
            device.mount_points.join(", ")
        );
    }
    println!("  Device: {}", style(device.path.display()).cyan());
    if let Some(image) = image {
        println!("  Image:  {}", style(image.display()).cyan());
    }
    println!();
}

/// Renders engine events as a progress bar until the job finishes.
fn drive_burn(events: std::sync::mpsc::Receiver<BurnEvent>) -> Result<()> {
    let bar = ProgressBar::new(100);
    bar.set_prefix("Burning");
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{prefix:12} [{elapsed_precise}] [{bar:40.green/black}] {pos:>3}% {msg}")
            .unwrap()
            .progress_chars("■ "),
    );
    bar.enable_steady_tick(Duration::from_millis(250));

    let mut speed = String::new();
    let mut eta = String::new();

    for event in events {
        match event {
            BurnEvent::Started => {}
            BurnEvent::StateChanged(state) => match state {
                BurnState::Preparing => bar.set_message("preparing device"),
                BurnState::Writing => bar.set_message("writing"),
                BurnState::Syncing => bar.set_message("syncing"),
                BurnState::Verifying => bar.set_message("verifying"),
                _ => {}
            },
            BurnEvent::Progress(percent) => bar.set_position(percent as u64),
            BurnEvent::Speed(s) => {
                speed = s;
                bar.set_message(format!("{speed}, {eta} left"));
            }
            BurnEvent::Eta(e) => {
                eta = e;
                bar.set_message(format!("{speed}, {eta} left"));
            }
            BurnEvent::Status(_) => {}
            BurnEvent::Finished { success, message } => {
                if success {
                    bar.finish_with_message(message.clone());
                    println!("\n✨ {message}");
                    return Ok(());
                }
                bar.abandon();
                return Err(anyhow!(message));
            }
        }
    }

    Err(anyhow!("Engine event stream ended unexpectedly"))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    // This guard will be dropped when main() exits, restoring the terminal.
    let _term_restorer = TermRestorer::new();

    let cli = Cli::parse();
    let registry = DeviceRegistry::new();

    match cli.command {
        Commands::Burn {
            image,
            device,
            mode,
            label,
            cluster_size,
            no_verify,
            yes,
        } => {
            if let Some(cluster) = cluster_size {
                if mode != BurnMode::Raw
                    && !filesystem::is_valid_cluster_size(FsKind::Fat32, cluster)
                {
                    return Err(anyhow!(
                        "Invalid cluster size {cluster} for FAT32: must be a power of two \
                         within the supported range."
                    ));
                }
            }

            let info = image::analyze(&image)
                .map_err(|e| anyhow!("Cannot read image '{}': {e}", image.display()))?;
            if !info.is_valid() {
                println!(
                    "{} '{}' is not a recognized image format; burning it anyway.",
                    style("WARNING:").yellow().bold(),
                    image.display()
                );
            }

            let target = resolve_device(&registry, device, "Select the target device to BURN to")?;

            print_destruction_warning(&target, Some(&image));
            if !yes && !confirm_operation("Are you sure you want to proceed?")? {
                println!("Burn cancelled.");
                return Ok(());
            }
            println!();

            let mut job = BurnJob::raw(image, target.path.clone());
            job.mode = mode;
            job.volume_label = label;
            job.cluster_size = cluster_size;
            job.verify_after_burn = !no_verify;
            if job.mode != BurnMode::Raw {
                job.scheme = PartitionScheme::Gpt;
                job.bootable = true;
            }

            let (engine, events) = BurnEngine::new();

            // Ctrl+C cancels the job; the engine kills the copy process and
            // sweeps its temp scripts before reporting Cancelled.
            let cancel_engine = engine.clone();
            let cancelled = Arc::new(AtomicBool::new(false));
            let cancelled_flag = cancelled.clone();
            ctrlc::set_handler(move || {
                if !cancelled_flag.swap(true, Ordering::SeqCst) {
                    eprintln!("\nCancelling...");
                    cancel_engine.cancel();
                }
            })?;

            engine.submit(job)?;
            drive_burn(events)?;
        }
        Commands::Format {
            device,
            fs,
            label,
            cluster_size,
            yes,
        } => {
            if let Some(cluster) = cluster_size {
                if !filesystem::is_valid_cluster_size(fs, cluster) {
                    return Err(anyhow!(
                        "Invalid cluster size {cluster} for {fs}: must be a power of two \
                         within the supported range."
                    ));
                }
            }

            let target = resolve_device(&registry, device, "Select the device to FORMAT")?;

            let label = label.map(|l| {
                let sanitized = filesystem::sanitize_label(fs, &l);
                if sanitized != l {
                    println!(
                        "Label adjusted to '{}' to satisfy {} naming rules.",
                        style(&sanitized).cyan(),
                        fs
                    );
                }
                sanitized
            });

            print_destruction_warning(&target, None);
            if !yes && !confirm_operation("Are you sure you want to proceed?")? {
                println!("Format cancelled.");
                return Ok(());
            }

            let spinner = ProgressBar::new_spinner();
            spinner.set_message(format!("Formatting {} as {}...", target.path.display(), fs));
            spinner.enable_steady_tick(Duration::from_millis(100));

            let (engine, _events) = BurnEngine::new();
            match engine.format_device(&target.path, fs, label.as_deref(), cluster_size) {
                Ok(()) => {
                    spinner.finish_with_message("Format complete.");
                    println!(
                        "\n✨ Formatted {} as {}.",
                        style(target.path.display()).cyan(),
                        style(fs).cyan()
                    );
                }
                Err(e) => {
                    spinner.abandon_with_message("❌ Format failed.");
                    return Err(e.into());
                }
            }
        }
        Commands::List => {
            let devices = registry.list_removable()?;
            if devices.is_empty() {
                println!("No removable devices found.");
                return Ok(());
            }

            println!("Found {} removable devices:", devices.len());
            println!(
                "\n  {:<12} {:<24} {:>8}  {:<8} {}",
                "DEVICE", "NAME", "SIZE", "FS", "LOCATION"
            );
            println!(
                "  {:-<12} {:-<24} {:-<8}  {:-<8} {:-<20}",
                "", "", "", "", ""
            );
            for device in devices {
                let location = if device.is_mounted() {
                    device.mount_points.join(", ")
                } else {
                    "(Not mounted)".to_string()
                };
                let fs = if device.filesystem.is_empty() {
                    "-".to_string()
                } else {
                    device.filesystem.clone()
                };
                println!(
                    "  {:<12} {:<24} {:>8}  {:<8} {}",
                    device.path.display(),
                    device.display_name(),
                    device.size_string,
                    fs,
                    location
                );
            }
        }
        Commands::Watch => {
            let running = Arc::new(AtomicBool::new(true));
            let r = running.clone();
            ctrlc::set_handler(move || {
                r.store(false, Ordering::SeqCst);
            })?;

            println!("Watching for device changes (Ctrl+C to stop)...");
            let (_watcher, events) = registry.watch(Duration::from_secs(2));

            while running.load(Ordering::SeqCst) {
                match events.recv_timeout(Duration::from_millis(250)) {
                    Ok(DeviceEvent::Inserted(device)) => {
                        println!(
                            "{} {} ({}, {})",
                            style("+ inserted").green(),
                            device.path.display(),
                            device.display_name(),
                            device.size_string
                        );
                    }
                    Ok(DeviceEvent::Removed(device)) => {
                        println!(
                            "{} {} ({})",
                            style("- removed ").red(),
                            device.path.display(),
                            device.display_name()
                        );
                    }
                    Ok(DeviceEvent::ListChanged) => {}
                    Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
                    Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }
        }
        Commands::Eject { device } => {
            registry.eject(&device)?;
            println!("✨ Ejected {}.", style(device.display()).cyan());
        }
        Commands::Verify { image, device } => {
            let cancel = Arc::new(AtomicBool::new(false));
            let c = cancel.clone();
            ctrlc::set_handler(move || {
                c.store(true, Ordering::SeqCst);
            })?;

            let bar = ProgressBar::new(0);
            bar.set_prefix("Verifying");
            bar.set_style(
                ProgressStyle::default_bar()
                    .template(
                        "{prefix:12} [{elapsed_precise}] [{bar:40.magenta/black}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
                    )
                    .unwrap()
                    .progress_chars("■ "),
            );

            let matches = verify::verify_burn(&image, &device, &cancel, |done, total| {
                if bar.length() != Some(total) {
                    bar.set_length(total);
                }
                bar.set_position(done);
            })?;

            if matches {
                bar.finish_with_message("Verification successful.");
                println!(
                    "\n✨ {} matches {}.",
                    style(device.display()).cyan(),
                    style(image.display()).cyan()
                );
            } else {
                bar.abandon();
                return Err(anyhow!(
                    "Verification failed: device contents differ from image."
                ));
            }
        }
    }

    Ok(())
}
