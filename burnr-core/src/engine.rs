//! The burn orchestration engine.
//!
//! One [`BurnEngine`] runs at most one job at a time, driving it through
//! `Idle → Preparing → Writing → Syncing → Verifying → {Completed, Failed,
//! Cancelled}`. The engine never copies bytes itself: it unmounts the target
//! (via [`DeviceRegistry`]), optionally lays out partitions (via
//! [`PartitionFormatter`]), then supervises an elevated dd script whose
//! output stream drives the state machine.
//!
//! Process notifications arrive as [`crate::process::ProcessEvent`]s on a
//! channel and are consumed by a single supervising function, so transitions
//! apply in output order. Callers observe the job through the [`BurnEvent`]
//! channel returned by [`BurnEngine::new`].

use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use crate::error::{BurnError, PartitionError, ProcessErrorKind, VerifyError};
use crate::filesystem::FsKind;
use crate::image::{self, PreparedImage};
use crate::partition::{PartitionFormatter, PartitionScheme, PartitionSpec, partition_path};
use crate::process::{self, ProcessEvent};
use crate::progress::{
    COMPLETION_SENTINEL, ProgressParser, ProgressSnapshot, ProgressTracker, SYNC_MARKER,
    SYNCING_PERCENT,
};
use crate::registry::DeviceRegistry;
use crate::verify;

const MIB: u64 = 1024 * 1024;

/// Prefix of the temporary burn scripts; everything matching
/// `burn_script_*.sh` in the temp directory is swept on terminal states.
const SCRIPT_PREFIX: &str = "burn_script_";

/// How the image is written to the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BurnMode {
    /// Byte-for-byte block copy, no partitioning step.
    Raw,
    /// GPT table with an EFI System Partition, then a raw copy.
    Uefi,
    /// Currently identical to [`BurnMode::Uefi`].
    WindowsToGo,
}

impl std::str::FromStr for BurnMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "raw" | "dd" => Ok(BurnMode::Raw),
            "uefi" => Ok(BurnMode::Uefi),
            "windows-to-go" | "wtg" => Ok(BurnMode::WindowsToGo),
            other => Err(format!("unsupported burn mode: {other}")),
        }
    }
}

/// Immutable configuration of one burn job.
#[derive(Clone, Debug)]
pub struct BurnJob {
    pub image_path: PathBuf,
    pub device_path: PathBuf,
    pub mode: BurnMode,
    pub scheme: PartitionScheme,
    pub filesystem: FsKind,
    pub volume_label: Option<String>,
    pub cluster_size: Option<u32>,
    pub quick_format: bool,
    pub verify_after_burn: bool,
    pub bootable: bool,
    pub bad_block_check: bool,
}

impl BurnJob {
    /// A raw-copy job with default options.
    pub fn raw(image_path: PathBuf, device_path: PathBuf) -> Self {
        Self {
            image_path,
            device_path,
            mode: BurnMode::Raw,
            scheme: PartitionScheme::Mbr,
            filesystem: FsKind::Fat32,
            volume_label: None,
            cluster_size: None,
            quick_format: true,
            verify_after_burn: false,
            bootable: false,
            bad_block_check: false,
        }
    }
}

/// Engine life cycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BurnState {
    Idle,
    Preparing,
    Writing,
    Syncing,
    Verifying,
    Completed,
    Failed,
    Cancelled,
}

impl BurnState {
    /// A job occupies the engine in these states; `submit` is rejected.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            BurnState::Preparing | BurnState::Writing | BurnState::Syncing | BurnState::Verifying
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BurnState::Completed | BurnState::Failed | BurnState::Cancelled
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            BurnState::Idle => "Idle",
            BurnState::Preparing => "Preparing",
            BurnState::Writing => "Writing",
            BurnState::Syncing => "Syncing",
            BurnState::Verifying => "Verifying",
            BurnState::Completed => "Completed",
            BurnState::Failed => "Failed",
            BurnState::Cancelled => "Cancelled",
        }
    }
}

/// Notifications emitted by the engine while a job runs.
#[derive(Clone, Debug)]
pub enum BurnEvent {
    Started,
    StateChanged(BurnState),
    Progress(u8),
    Speed(String),
    Eta(String),
    Status(String),
    Finished { success: bool, message: String },
}

struct Shared {
    state: Mutex<BurnState>,
    progress: Mutex<ProgressTracker>,
    cancel: AtomicBool,
    paused: AtomicBool,
    /// Byte offset a paused job resumes from, floored to a MiB boundary.
    resume_offset: AtomicU64,
    child: Mutex<Option<process::ChildHandle>>,
    active: Mutex<Option<Arc<JobContext>>>,
}

struct JobContext {
    job: BurnJob,
    image: PreparedImage,
    parser: ProgressParser,
}

/// Drives one image-write job end to end. Cheap to clone; clones share the
/// same engine state.
#[derive(Clone)]
pub struct BurnEngine {
    shared: Arc<Shared>,
    events: Sender<BurnEvent>,
}

impl BurnEngine {
    /// Creates an engine and the event stream its jobs report on.
    pub fn new() -> (Self, Receiver<BurnEvent>) {
        let (tx, rx) = channel();
        let engine = Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BurnState::Idle),
                progress: Mutex::new(ProgressTracker::new(0)),
                cancel: AtomicBool::new(false),
                paused: AtomicBool::new(false),
                resume_offset: AtomicU64::new(0),
                child: Mutex::new(None),
                active: Mutex::new(None),
            }),
            events: tx,
        };
        (engine, rx)
    }

    pub fn state(&self) -> BurnState {
        *self.shared.state.lock().unwrap()
    }

    pub fn progress(&self) -> ProgressSnapshot {
        self.shared.progress.lock().unwrap().snapshot()
    }

    pub fn is_burning(&self) -> bool {
        self.state().is_active()
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::SeqCst)
    }

    /// Submits a job. Returns once the write process is launched; everything
    /// after that is reported through the event channel.
    ///
    /// Fails with [`BurnError::AlreadyRunning`] while a job occupies the
    /// engine, [`BurnError::ImageNotFound`] when the image is missing,
    /// [`BurnError::PrepareFailed`] when unmount/partition/format steps
    /// fail, and [`BurnError::LaunchFailed`] when the elevated write process
    /// cannot start.
    pub fn submit(&self, job: BurnJob) -> Result<(), BurnError> {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.is_active() {
                return Err(BurnError::AlreadyRunning);
            }
            *state = BurnState::Preparing;
        }
        self.shared.cancel.store(false, Ordering::SeqCst);
        self.shared.paused.store(false, Ordering::SeqCst);
        self.shared.resume_offset.store(0, Ordering::SeqCst);

        info!(
            image = %job.image_path.display(),
            device = %job.device_path.display(),
            mode = ?job.mode,
            "burn job submitted"
        );

        match self.prepare_and_launch(job) {
            Ok(()) => Ok(()),
            Err(BurnError::Cancelled) => {
                sweep_scripts_in(&env::temp_dir());
                self.finish(BurnState::Cancelled, false, "Operation cancelled");
                Err(BurnError::Cancelled)
            }
            Err(e) => {
                sweep_scripts_in(&env::temp_dir());
                self.finish(BurnState::Failed, false, &e.to_string());
                Err(e)
            }
        }
    }

    fn prepare_and_launch(&self, job: BurnJob) -> Result<(), BurnError> {
        let metadata = fs::metadata(&job.image_path)
            .map_err(|_| BurnError::ImageNotFound(job.image_path.clone()))?;
        if !metadata.is_file() {
            return Err(BurnError::ImageNotFound(job.image_path.clone()));
        }

        self.emit(BurnEvent::Started);
        self.emit(BurnEvent::StateChanged(BurnState::Preparing));
        self.emit(BurnEvent::Status("Preparing device...".into()));

        let image = image::prepare(&job.image_path, &self.shared.cancel, |_| {}).map_err(|e| {
            if e.kind() == io::ErrorKind::Interrupted {
                BurnError::Cancelled
            } else {
                BurnError::Io(e)
            }
        })?;
        let total_bytes = fs::metadata(&image.path)?.len();
        *self.shared.progress.lock().unwrap() = ProgressTracker::new(total_bytes);

        self.check_cancelled()?;

        let registry = DeviceRegistry::new();
        registry
            .unmount_all(&job.device_path)
            .map_err(|e| BurnError::PrepareFailed(format!("failed to unmount device: {e}")))?;

        self.check_cancelled()?;

        if job.mode != BurnMode::Raw {
            self.prepare_boot_partitions(&job)?;
            self.check_cancelled()?;
        }

        let ctx = Arc::new(JobContext {
            job,
            image,
            parser: ProgressParser::new(),
        });
        *self.shared.active.lock().unwrap() = Some(ctx.clone());
        self.launch(ctx, 0)
    }

    /// GPT table, ESP spanning 1 MiB to the end, boot flag, FAT32 format.
    /// Uefi and WindowsToGo modes share this layout.
    fn prepare_boot_partitions(&self, job: &BurnJob) -> Result<(), BurnError> {
        let map = |e: PartitionError| BurnError::PrepareFailed(e.to_string());
        let formatter = PartitionFormatter::new();

        formatter
            .create_table(&job.device_path, PartitionScheme::Gpt)
            .map_err(map)?;
        formatter
            .create_partition(&job.device_path, &PartitionSpec::esp())
            .map_err(map)?;
        formatter.set_boot_flag(&job.device_path, 1).map_err(map)?;

        let esp = partition_path(&job.device_path, 1);
        formatter
            .format(
                &esp,
                FsKind::Fat32,
                job.volume_label.as_deref(),
                job.cluster_size,
            )
            .map_err(map)
    }

    fn launch(&self, ctx: Arc<JobContext>, resume_blocks: u64) -> Result<(), BurnError> {
        which::which("pkexec").map_err(|_| {
            BurnError::LaunchFailed(
                "pkexec not found. Install the policykit-1 package or run as root.".into(),
            )
        })?;

        let script = write_script_in(
            &env::temp_dir(),
            &ctx.image.path,
            &ctx.job.device_path,
            resume_blocks,
        )?;
        self.emit(BurnEvent::Status(
            "Requesting administrator privileges...".into(),
        ));

        let script_str = script.to_string_lossy();
        let (handle, events) = process::spawn_streaming("pkexec", &[&script_str]).map_err(|e| {
            let _ = fs::remove_file(&script);
            BurnError::LaunchFailed(e.to_string())
        })?;

        *self.shared.child.lock().unwrap() = Some(handle);
        self.set_state(BurnState::Writing);
        self.emit(BurnEvent::Status("Writing image to device...".into()));

        let shared = self.shared.clone();
        let tx = self.events.clone();
        thread::spawn(move || supervise(shared, ctx, tx, events));
        Ok(())
    }

    /// Requests cancellation: kills any running write process and sweeps the
    /// temporary scripts. The terminal state becomes Cancelled, not Failed.
    pub fn cancel(&self) {
        self.shared.cancel.store(true, Ordering::SeqCst);

        let child = self.shared.child.lock().unwrap().clone();
        if let Some(child) = child {
            info!("terminating burn process");
            child.kill();
        }

        sweep_scripts_in(&env::temp_dir());
        self.emit(BurnEvent::Status("Cancelled".into()));
    }

    /// Pauses the running write by terminating the copy process. The byte
    /// offset reached so far (floored to a whole MiB) is kept so `resume`
    /// can pick up close to where the copy stopped.
    pub fn pause(&self) -> bool {
        if *self.shared.state.lock().unwrap() != BurnState::Writing {
            return false;
        }
        if self.shared.paused.swap(true, Ordering::SeqCst) {
            return false;
        }

        let bytes = self.shared.progress.lock().unwrap().bytes_written();
        self.shared
            .resume_offset
            .store(bytes / MIB * MIB, Ordering::SeqCst);

        let child = self.shared.child.lock().unwrap().clone();
        if let Some(child) = child {
            child.kill();
        }
        info!(resume_offset = bytes / MIB * MIB, "burn paused");
        true
    }

    /// Relaunches a paused job's write from the recorded offset, passing
    /// matching `skip`/`seek` block counts to the copy tool.
    pub fn resume(&self) -> Result<(), BurnError> {
        if !self.shared.paused.load(Ordering::SeqCst) {
            return Err(BurnError::NothingToResume);
        }
        let ctx = self
            .shared
            .active
            .lock()
            .unwrap()
            .clone()
            .ok_or(BurnError::NothingToResume)?;

        self.shared.paused.store(false, Ordering::SeqCst);
        self.emit(BurnEvent::Status("Resuming...".into()));

        let blocks = self.shared.resume_offset.load(Ordering::SeqCst) / MIB;
        self.launch(ctx, blocks)
    }

    /// Formats the whole device with a fresh MBR table and one partition.
    ///
    /// Runs synchronously and occupies the engine like a burn job.
    pub fn format_device(
        &self,
        device_path: &Path,
        fs: FsKind,
        label: Option<&str>,
        cluster_size: Option<u32>,
    ) -> Result<(), BurnError> {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.is_active() {
                return Err(BurnError::AlreadyRunning);
            }
            *state = BurnState::Preparing;
        }
        self.emit(BurnEvent::Status("Formatting device...".into()));

        let result = self.format_device_inner(device_path, fs, label, cluster_size);
        match &result {
            Ok(()) => self.finish(
                BurnState::Completed,
                true,
                "Device formatted successfully",
            ),
            Err(e) => {
                let message = e.to_string();
                self.finish(BurnState::Failed, false, &message);
            }
        }
        result
    }

    fn format_device_inner(
        &self,
        device_path: &Path,
        fs: FsKind,
        label: Option<&str>,
        cluster_size: Option<u32>,
    ) -> Result<(), BurnError> {
        let registry = DeviceRegistry::new();
        registry
            .unmount_all(device_path)
            .map_err(|e| BurnError::PrepareFailed(format!("failed to unmount device: {e}")))?;

        let map = |e: PartitionError| BurnError::PrepareFailed(e.to_string());
        let formatter = PartitionFormatter::new();
        formatter
            .create_table(device_path, PartitionScheme::Mbr)
            .map_err(map)?;
        formatter
            .create_partition(device_path, &PartitionSpec::primary())
            .map_err(map)?;
        formatter
            .format(&partition_path(device_path, 1), fs, label, cluster_size)
            .map_err(map)
    }

    fn check_cancelled(&self) -> Result<(), BurnError> {
        if self.shared.cancel.load(Ordering::SeqCst) {
            Err(BurnError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn set_state(&self, state: BurnState) {
        *self.shared.state.lock().unwrap() = state;
        info!(state = state.name(), "state changed");
        self.emit(BurnEvent::StateChanged(state));
    }

    fn finish(&self, state: BurnState, success: bool, message: &str) {
        finish(&self.shared, &self.events, state, success, message);
    }

    fn emit(&self, event: BurnEvent) {
        let _ = self.events.send(event);
    }
}

/// Consumes process events for one write attempt and applies state
/// transitions in arrival order.
fn supervise(
    shared: Arc<Shared>,
    ctx: Arc<JobContext>,
    tx: Sender<BurnEvent>,
    events: Receiver<ProcessEvent>,
) {
    for event in events.iter() {
        match event {
            ProcessEvent::Line(line) => handle_line(&shared, &ctx, &tx, line.trim()),
            ProcessEvent::Exited(code) => {
                handle_exit(&shared, &ctx, &tx, code);
                break;
            }
            ProcessEvent::Failed(kind) => {
                handle_process_failure(&shared, &tx, kind);
                break;
            }
        }
    }
}

fn handle_line(shared: &Shared, ctx: &JobContext, tx: &Sender<BurnEvent>, line: &str) {
    if line.is_empty() {
        return;
    }
    debug!(line, "copy output");

    if let Some(bytes) = ctx.parser.extract_bytes(line) {
        let absolute = shared
            .resume_offset
            .load(Ordering::SeqCst)
            .saturating_add(bytes);
        let sample = shared.progress.lock().unwrap().record(absolute);
        if let Some(sample) = sample {
            emit(tx, BurnEvent::Progress(sample.percent));
            if let Some(speed) = sample.speed {
                emit(tx, BurnEvent::Speed(speed));
            }
            if let Some(eta) = sample.eta {
                emit(tx, BurnEvent::Eta(eta));
            }
        }
    }

    if line.contains("bytes") || line.contains("copied") || line.contains("records") {
        emit(tx, BurnEvent::Status(format!("Writing... {line}")));
    }

    if ctx.parser.is_sync_marker(line) {
        {
            let mut state = shared.state.lock().unwrap();
            if *state == BurnState::Writing {
                *state = BurnState::Syncing;
                info!(state = state.name(), "state changed");
                emit(tx, BurnEvent::StateChanged(BurnState::Syncing));
            }
        }
        shared
            .progress
            .lock()
            .unwrap()
            .set_phase_percent(SYNCING_PERCENT);
        emit(tx, BurnEvent::Progress(SYNCING_PERCENT));
        emit(
            tx,
            BurnEvent::Status("Syncing device - finalizing drive...".into()),
        );
    }

    if ctx.parser.is_completion_sentinel(line) {
        shared.progress.lock().unwrap().set_phase_percent(100);
        emit(tx, BurnEvent::Progress(100));
        emit(tx, BurnEvent::Status("Burn completed successfully!".into()));
    }
}

fn handle_exit(
    shared: &Arc<Shared>,
    ctx: &Arc<JobContext>,
    tx: &Sender<BurnEvent>,
    code: Option<i32>,
) {
    shared.child.lock().unwrap().take();
    sweep_scripts_in(&env::temp_dir());

    if shared.cancel.load(Ordering::SeqCst) {
        finish(shared, tx, BurnState::Cancelled, false, "Operation cancelled");
        return;
    }

    // A paused job is not terminal; the process was killed on purpose and
    // the context stays around for resume().
    if shared.paused.load(Ordering::SeqCst) {
        emit(tx, BurnEvent::Status("Paused".into()));
        return;
    }

    match code {
        Some(0) => {
            shared.progress.lock().unwrap().set_phase_percent(100);
            emit(tx, BurnEvent::Progress(100));

            if ctx.job.verify_after_burn {
                run_verification(shared, ctx, tx);
            } else {
                finish(
                    shared,
                    tx,
                    BurnState::Completed,
                    true,
                    "Burn completed successfully",
                );
            }
        }
        Some(code) => {
            finish(
                shared,
                tx,
                BurnState::Failed,
                false,
                &format!("Burn failed with exit code {code}"),
            );
        }
        None => {
            finish(
                shared,
                tx,
                BurnState::Failed,
                false,
                "Burn process terminated by signal",
            );
        }
    }
}

fn handle_process_failure(shared: &Arc<Shared>, tx: &Sender<BurnEvent>, kind: ProcessErrorKind) {
    shared.child.lock().unwrap().take();
    sweep_scripts_in(&env::temp_dir());

    if shared.cancel.load(Ordering::SeqCst) {
        finish(shared, tx, BurnState::Cancelled, false, "Operation cancelled");
        return;
    }
    finish(shared, tx, BurnState::Failed, false, kind.message());
}

fn run_verification(shared: &Arc<Shared>, ctx: &Arc<JobContext>, tx: &Sender<BurnEvent>) {
    {
        let mut state = shared.state.lock().unwrap();
        *state = BurnState::Verifying;
    }
    emit(tx, BurnEvent::StateChanged(BurnState::Verifying));
    emit(tx, BurnEvent::Status("Verifying burn...".into()));

    let result = verify::verify_burn(
        &ctx.image.path,
        &ctx.job.device_path,
        &shared.cancel,
        |_, _| {},
    );

    match result {
        Ok(true) => finish(
            shared,
            tx,
            BurnState::Completed,
            true,
            "Verification successful",
        ),
        Ok(false) => finish(shared, tx, BurnState::Failed, false, "Verification failed"),
        Err(VerifyError::Cancelled) => {
            finish(shared, tx, BurnState::Cancelled, false, "Operation cancelled")
        }
        Err(e) => finish(
            shared,
            tx,
            BurnState::Failed,
            false,
            &format!("Verification error: {e}"),
        ),
    }
}

fn finish(shared: &Arc<Shared>, tx: &Sender<BurnEvent>, state: BurnState, success: bool, message: &str) {
    *shared.state.lock().unwrap() = state;
    shared.active.lock().unwrap().take();
    info!(state = state.name(), success, message, "burn finished");

    emit(tx, BurnEvent::StateChanged(state));
    emit(
        tx,
        BurnEvent::Finished {
            success,
            message: message.to_string(),
        },
    );
}

fn emit(tx: &Sender<BurnEvent>, event: BurnEvent) {
    let _ = tx.send(event);
}

/// Writes the elevated burn script: strict error exit, normalized locale,
/// one dd invocation with data-sync flush and progress reporting, an
/// explicit sync, and the completion sentinel. For resumed jobs the copy
/// skips/seeks `resume_blocks` MiB-sized blocks on both sides.
fn write_script_in(
    dir: &Path,
    image: &Path,
    device: &Path,
    resume_blocks: u64,
) -> Result<PathBuf, BurnError> {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let path = dir.join(format!("{SCRIPT_PREFIX}{millis}.sh"));

    let image_name = image
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let image_str = image.display();
    let device_str = device.display();

    let resume = if resume_blocks > 0 {
        format!(" skip={resume_blocks} seek={resume_blocks}")
    } else {
        String::new()
    };

    let script = format!(
        "#!/bin/bash\n\
         set -e\n\
         echo 'Starting burn operation: {image_name} -> {device_str}'\n\
         export LC_ALL=C\n\
         dd if='{image_str}' of='{device_str}' bs=1M{resume} conv=fdatasync status=progress oflag=direct 2>&1\n\
         echo '{SYNC_MARKER}...'\n\
         sync\n\
         echo '{COMPLETION_SENTINEL}'\n"
    );

    fs::write(&path, script)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
    }

    debug!(script = %path.display(), "burn script written");
    Ok(path)
}

/// Removes every `burn_script_*.sh` in the directory.
fn sweep_scripts_in(dir: &Path) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(SCRIPT_PREFIX) && name.ends_with(".sh") {
            if fs::remove_file(entry.path()).is_err() {
                warn!(script = %entry.path().display(), "failed to remove burn script");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn prepared_image(dir: &tempfile::TempDir, contents: &[u8]) -> PreparedImage {
        let path = dir.path().join("image.img");
        fs::write(&path, contents).unwrap();
        let cancel = AtomicBool::new(false);
        image::prepare(&path, &cancel, |_| {}).unwrap()
    }

    fn writing_engine(
        total_bytes: u64,
        job: BurnJob,
        image: PreparedImage,
    ) -> (BurnEngine, Receiver<BurnEvent>, Arc<JobContext>) {
        let (engine, rx) = BurnEngine::new();
        *engine.shared.state.lock().unwrap() = BurnState::Writing;
        *engine.shared.progress.lock().unwrap() = ProgressTracker::new(total_bytes);

        let ctx = Arc::new(JobContext {
            job,
            image,
            parser: ProgressParser::new(),
        });
        *engine.shared.active.lock().unwrap() = Some(ctx.clone());
        (engine, rx, ctx)
    }

    #[test]
    fn script_contains_the_expected_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script_in(
            dir.path(),
            Path::new("/images/distro.iso"),
            Path::new("/dev/sdz"),
            0,
        )
        .unwrap();

        let contents = fs::read_to_string(&script).unwrap();
        assert!(contents.starts_with("#!/bin/bash\nset -e\n"));
        assert!(contents.contains("export LC_ALL=C"));
        assert!(contents.contains(
            "dd if='/images/distro.iso' of='/dev/sdz' bs=1M conv=fdatasync status=progress oflag=direct 2>&1"
        ));
        assert!(contents.contains("echo 'Syncing device...'"));
        assert!(contents.contains("\nsync\n"));
        assert!(contents.contains("echo 'Burn operation completed successfully'"));
        assert!(!contents.contains("skip="));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&script).unwrap().permissions().mode();
            assert_eq!(mode & 0o111, 0o111);
        }
    }

    #[test]
    fn resumed_script_skips_and_seeks_the_same_block_count() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script_in(
            dir.path(),
            Path::new("/images/distro.iso"),
            Path::new("/dev/sdz"),
            512,
        )
        .unwrap();

        let contents = fs::read_to_string(&script).unwrap();
        assert!(contents.contains("bs=1M skip=512 seek=512 conv=fdatasync"));
    }

    #[test]
    fn sweep_removes_only_burn_scripts() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script_in(dir.path(), Path::new("a.img"), Path::new("/dev/sdz"), 0)
            .unwrap();
        let unrelated = dir.path().join("keep.txt");
        fs::write(&unrelated, "keep").unwrap();

        sweep_scripts_in(dir.path());

        assert!(!script.exists());
        assert!(unrelated.exists());
    }

    #[test]
    fn submit_rejects_missing_image() {
        let (engine, _rx) = BurnEngine::new();
        let job = BurnJob::raw("/no/such/image.iso".into(), "/dev/sdz".into());
        let err = engine.submit(job).unwrap_err();
        assert!(matches!(err, BurnError::ImageNotFound(_)));
        assert_eq!(engine.state(), BurnState::Failed);
    }

    #[test]
    fn submit_rejects_while_active() {
        let (engine, _rx) = BurnEngine::new();
        *engine.shared.state.lock().unwrap() = BurnState::Writing;

        let job = BurnJob::raw("/no/such/image.iso".into(), "/dev/sdz".into());
        let err = engine.submit(job).unwrap_err();
        assert!(matches!(err, BurnError::AlreadyRunning));
    }

    #[test]
    fn simulated_burn_reaches_completed_through_syncing() {
        let dir = tempfile::tempdir().unwrap();
        let image = prepared_image(&dir, b"image");
        let job = BurnJob::raw(dir.path().join("image.img"), "/dev/null".into());
        let (engine, rx, ctx) = writing_engine(4 * GIB, job, image);

        let (ptx, prx) = mpsc::channel();
        ptx.send(ProcessEvent::Line(
            "1073741824 bytes (1.1 GB, 1.0 GiB) copied, 10 s, 107 MB/s".into(),
        ))
        .unwrap();
        ptx.send(ProcessEvent::Line(
            "4294967296 bytes (4.3 GB, 4.0 GiB) copied, 40 s, 107 MB/s".into(),
        ))
        .unwrap();
        ptx.send(ProcessEvent::Line("Syncing device...".into())).unwrap();
        ptx.send(ProcessEvent::Line(
            "Burn operation completed successfully".into(),
        ))
        .unwrap();
        ptx.send(ProcessEvent::Exited(Some(0))).unwrap();

        supervise(engine.shared.clone(), ctx, engine.events.clone(), prx);

        assert_eq!(engine.state(), BurnState::Completed);
        assert_eq!(engine.progress().percent, 100);

        let events: Vec<BurnEvent> = rx.try_iter().collect();
        let states: Vec<BurnState> = events
            .iter()
            .filter_map(|e| match e {
                BurnEvent::StateChanged(s) => Some(*s),
                _ => None,
            })
            .collect();
        assert_eq!(states, vec![BurnState::Syncing, BurnState::Completed]);

        // Raw percentages are capped at 95 while writing; 98 only at the
        // sync marker; 100 only at the sentinel.
        let percents: Vec<u8> = events
            .iter()
            .filter_map(|e| match e {
                BurnEvent::Progress(p) => Some(*p),
                _ => None,
            })
            .collect();
        assert_eq!(percents, vec![25, 95, 98, 100, 100]);

        assert!(events.iter().any(
            |e| matches!(e, BurnEvent::Finished { success: true, .. })
        ));
    }

    #[test]
    fn verification_runs_when_requested_and_passes_on_match() {
        let dir = tempfile::tempdir().unwrap();
        let image = prepared_image(&dir, b"identical payload");
        let device = dir.path().join("device");
        fs::write(&device, b"identical payload").unwrap();

        let mut job = BurnJob::raw(dir.path().join("image.img"), device);
        job.verify_after_burn = true;
        let (engine, rx, ctx) = writing_engine(17, job, image);

        let (ptx, prx) = mpsc::channel();
        ptx.send(ProcessEvent::Exited(Some(0))).unwrap();
        supervise(engine.shared.clone(), ctx, engine.events.clone(), prx);

        assert_eq!(engine.state(), BurnState::Completed);
        let events: Vec<BurnEvent> = rx.try_iter().collect();
        assert!(events
            .iter()
            .any(|e| matches!(e, BurnEvent::StateChanged(BurnState::Verifying))));
        assert!(events.iter().any(|e| matches!(
            e,
            BurnEvent::Finished { success: true, message } if message == "Verification successful"
        )));
    }

    #[test]
    fn mismatched_verification_fails_the_job() {
        let dir = tempfile::tempdir().unwrap();
        let image = prepared_image(&dir, b"expected payload");
        let device = dir.path().join("device");
        fs::write(&device, b"corrupted payload").unwrap();

        let mut job = BurnJob::raw(dir.path().join("image.img"), device);
        job.verify_after_burn = true;
        let (engine, _rx, ctx) = writing_engine(16, job, image);

        let (ptx, prx) = mpsc::channel();
        ptx.send(ProcessEvent::Exited(Some(0))).unwrap();
        supervise(engine.shared.clone(), ctx, engine.events.clone(), prx);

        assert_eq!(engine.state(), BurnState::Failed);
    }

    #[test]
    fn nonzero_exit_fails_with_the_code_in_the_message() {
        let dir = tempfile::tempdir().unwrap();
        let image = prepared_image(&dir, b"image");
        let job = BurnJob::raw(dir.path().join("image.img"), "/dev/null".into());
        let (engine, rx, ctx) = writing_engine(GIB, job, image);

        let (ptx, prx) = mpsc::channel();
        ptx.send(ProcessEvent::Exited(Some(1))).unwrap();
        supervise(engine.shared.clone(), ctx, engine.events.clone(), prx);

        assert_eq!(engine.state(), BurnState::Failed);
        let events: Vec<BurnEvent> = rx.try_iter().collect();
        assert!(events.iter().any(|e| matches!(
            e,
            BurnEvent::Finished { success: false, message } if message.contains("exit code 1")
        )));
    }

    #[test]
    fn cancel_mid_write_reaches_cancelled_and_sweeps_scripts() {
        let dir = tempfile::tempdir().unwrap();
        let image = prepared_image(&dir, b"image");
        let job = BurnJob::raw(dir.path().join("image.img"), "/dev/null".into());
        let (engine, rx, ctx) = writing_engine(4 * GIB, job, image);

        // A leftover script in the real temp dir must be gone afterwards.
        let marker = write_script_in(
            &env::temp_dir(),
            Path::new("marker.img"),
            Path::new("/dev/null"),
            0,
        )
        .unwrap();

        let (ptx, prx) = mpsc::channel();
        ptx.send(ProcessEvent::Line(
            "1073741824 bytes (1.1 GB, 1.0 GiB) copied, 10 s, 107 MB/s".into(),
        ))
        .unwrap();

        engine.cancel();
        // The killed process reports a signal exit.
        ptx.send(ProcessEvent::Exited(None)).unwrap();

        supervise(engine.shared.clone(), ctx, engine.events.clone(), prx);

        assert_eq!(engine.state(), BurnState::Cancelled);
        assert!(!marker.exists());

        let events: Vec<BurnEvent> = rx.try_iter().collect();
        assert!(events.iter().any(|e| matches!(
            e,
            BurnEvent::Finished { success: false, message } if message == "Operation cancelled"
        )));
    }

    #[test]
    fn pause_records_a_mib_aligned_resume_offset() {
        let dir = tempfile::tempdir().unwrap();
        let image = prepared_image(&dir, b"image");
        let job = BurnJob::raw(dir.path().join("image.img"), "/dev/null".into());
        let (engine, _rx, ctx) = writing_engine(4 * GIB, job, image);

        let _ = engine
            .shared
            .progress
            .lock()
            .unwrap()
            .record(3 * MIB + 777);

        assert!(engine.pause());
        assert!(engine.is_paused());
        assert_eq!(
            engine.shared.resume_offset.load(Ordering::SeqCst),
            3 * MIB
        );
        // Double pause is a no-op.
        assert!(!engine.pause());

        // The killed process exiting while paused is not terminal.
        let (ptx, prx) = mpsc::channel();
        ptx.send(ProcessEvent::Exited(None)).unwrap();
        supervise(engine.shared.clone(), ctx, engine.events.clone(), prx);
        assert_eq!(engine.state(), BurnState::Writing);
        assert!(engine.shared.active.lock().unwrap().is_some());
    }

    #[test]
    fn resumed_samples_are_offset_by_the_resume_base() {
        let dir = tempfile::tempdir().unwrap();
        let image = prepared_image(&dir, b"image");
        let job = BurnJob::raw(dir.path().join("image.img"), "/dev/null".into());
        let (engine, rx, ctx) = writing_engine(4 * GIB, job, image);

        engine
            .shared
            .resume_offset
            .store(2 * GIB, Ordering::SeqCst);

        // dd after resume reports bytes since its own start.
        handle_line(
            &engine.shared,
            &ctx,
            &engine.events,
            "1073741824 bytes (1.1 GB, 1.0 GiB) copied, 10 s, 107 MB/s",
        );

        assert_eq!(engine.progress().bytes_written, 3 * GIB);
        let events: Vec<BurnEvent> = rx.try_iter().collect();
        assert!(events.iter().any(|e| matches!(e, BurnEvent::Progress(75))));
    }

    #[test]
    fn resume_without_pause_is_rejected() {
        let (engine, _rx) = BurnEngine::new();
        assert!(matches!(
            engine.resume().unwrap_err(),
            BurnError::NothingToResume
        ));
    }

    #[test]
    fn process_failure_kinds_map_to_failed_state() {
        let dir = tempfile::tempdir().unwrap();
        let image = prepared_image(&dir, b"image");
        let job = BurnJob::raw(dir.path().join("image.img"), "/dev/null".into());
        let (engine, rx, ctx) = writing_engine(GIB, job, image);

        let (ptx, prx) = mpsc::channel();
        ptx.send(ProcessEvent::Failed(ProcessErrorKind::Crashed))
            .unwrap();
        supervise(engine.shared.clone(), ctx, engine.events.clone(), prx);

        assert_eq!(engine.state(), BurnState::Failed);
        let events: Vec<BurnEvent> = rx.try_iter().collect();
        assert!(events.iter().any(|e| matches!(
            e,
            BurnEvent::Finished { success: false, message } if message == "Process crashed"
        )));
    }

    #[test]
    fn regressive_samples_do_not_move_progress_backwards() {
        let dir = tempfile::tempdir().unwrap();
        let image = prepared_image(&dir, b"image");
        let job = BurnJob::raw(dir.path().join("image.img"), "/dev/null".into());
        let (engine, _rx, ctx) = writing_engine(4 * GIB, job, image);

        handle_line(
            &engine.shared,
            &ctx,
            &engine.events,
            "2147483648 bytes (2.1 GB, 2.0 GiB) copied, 20 s, 107 MB/s",
        );
        handle_line(
            &engine.shared,
            &ctx,
            &engine.events,
            "1073741824 bytes (1.1 GB, 1.0 GiB) copied, 10 s, 107 MB/s",
        );

        assert_eq!(engine.progress().bytes_written, 2 * GIB);
    }
}
