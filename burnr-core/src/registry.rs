//! Device enumeration, unmounting and hot-plug detection.
//!
//! Enumeration shells out to `lsblk -J` and parses its JSON output into
//! [`DeviceDescriptor`] snapshots. A malformed listing degrades to an empty
//! snapshot instead of an error so a broken tool never takes the UI down
//! with it.
//!
//! Hot-plug detection runs on its own background thread, combining a fixed
//! 2 s poll with a cheap `/dev` mtime check between ticks. It re-enumerates
//! removable devices, diffs snapshots by path and emits
//! [`DeviceEvent`]s. The watcher never touches the burn engine and shares no
//! locks with it.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use serde::Deserialize;
use tracing::{debug, warn};

use crate::device::DeviceDescriptor;
use crate::error::RegistryError;
use crate::process;

const LSBLK_COLUMNS: &str = "NAME,SIZE,TYPE,MOUNTPOINT,RM,VENDOR,MODEL,FSTYPE,UUID,TRAN";
const LSBLK_TIMEOUT: Duration = Duration::from_secs(5);
const UMOUNT_TIMEOUT: Duration = Duration::from_secs(5);
const EJECT_TIMEOUT: Duration = Duration::from_secs(5);

/// A hot-plug notification from the watcher thread.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    Inserted(DeviceDescriptor),
    Removed(DeviceDescriptor),
    ListChanged,
}

/// Enumerates block devices and manages mounts.
#[derive(Default)]
pub struct DeviceRegistry;

impl DeviceRegistry {
    pub fn new() -> Self {
        Self
    }

    /// Lists removable disks, excluding the system drive.
    pub fn list_removable(&self) -> Result<Vec<DeviceDescriptor>, RegistryError> {
        let system_disk = system_disk_path();
        let devices = self
            .list_all()?
            .into_iter()
            .filter(|d| d.removable)
            .filter(|d| Some(&d.path) != system_disk.as_ref())
            .collect();
        Ok(devices)
    }

    /// Lists all whole disks known to the listing tool.
    pub fn list_all(&self) -> Result<Vec<DeviceDescriptor>, RegistryError> {
        let output = process::run(
            "lsblk",
            &["-J", "-o", LSBLK_COLUMNS],
            LSBLK_TIMEOUT,
        )
        .map_err(RegistryError::Listing)?;

        if !output.success() {
            warn!(code = output.exit_code(), "lsblk exited with an error");
            return Ok(Vec::new());
        }

        Ok(parse_lsblk_output(&output.stdout))
    }

    /// Looks up a single device by path.
    pub fn describe(&self, path: &Path) -> Result<DeviceDescriptor, RegistryError> {
        let path_str = path.to_string_lossy();
        let output = process::run(
            "lsblk",
            &["-J", "-o", LSBLK_COLUMNS, &path_str],
            LSBLK_TIMEOUT,
        )
        .map_err(RegistryError::Listing)?;

        if output.success() {
            if let Some(device) = parse_lsblk_output(&output.stdout).into_iter().next() {
                return Ok(device);
            }
        }
        Err(RegistryError::DeviceNotFound(path.to_path_buf()))
    }

    /// Unmounts every partition of the device. Partitions are the `/dev`
    /// entries named `<base><digits>`. Fails if any partition refuses to
    /// unmount.
    pub fn unmount_all(&self, device_path: &Path) -> Result<(), RegistryError> {
        for partition in partitions_of(device_path)? {
            self.unmount(&partition)?;
        }
        Ok(())
    }

    /// Unmounts all mount points of a single device or partition.
    pub fn unmount(&self, path: &Path) -> Result<(), RegistryError> {
        for mount_point in mount_points_of(path)? {
            let output = process::run("umount", &[&mount_point], UMOUNT_TIMEOUT)?;
            if !output.success() {
                warn!(%mount_point, "umount failed");
                return Err(RegistryError::UnmountFailed(mount_point));
            }
        }
        Ok(())
    }

    /// Unmounts all partitions, then ejects the device.
    pub fn eject(&self, device_path: &Path) -> Result<(), RegistryError> {
        self.unmount_all(device_path)?;

        let path_str = device_path.to_string_lossy();
        let output = process::run("eject", &[&path_str], EJECT_TIMEOUT)?;
        if !output.success() {
            return Err(RegistryError::EjectFailed(device_path.to_path_buf()));
        }
        Ok(())
    }

    /// Starts the hot-plug watcher thread.
    ///
    /// The returned receiver yields [`DeviceEvent`]s until the watcher is
    /// stopped or dropped.
    pub fn watch(&self, poll_interval: Duration) -> (DeviceWatcher, Receiver<DeviceEvent>) {
        let (tx, rx) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();

        let handle = thread::spawn(move || watch_loop(poll_interval, stop_flag, tx));

        (
            DeviceWatcher {
                stop,
                handle: Some(handle),
            },
            rx,
        )
    }
}

/// Handle that stops the watcher thread when asked or dropped.
pub struct DeviceWatcher {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl DeviceWatcher {
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DeviceWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn watch_loop(poll_interval: Duration, stop: Arc<AtomicBool>, tx: Sender<DeviceEvent>) {
    let registry = DeviceRegistry::new();
    let mut last_dev_mtime = dev_dir_mtime();
    let mut last_poll = Instant::now();

    // The first refresh diffs against an empty snapshot, so devices present
    // at startup are reported as insertions.
    let mut last_snapshot = Vec::new();
    let snapshot = registry.list_removable().unwrap_or_default();
    for event in diff_snapshots(&last_snapshot, &snapshot) {
        if tx.send(event).is_err() {
            return;
        }
    }
    last_snapshot = snapshot;

    while !stop.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(250));

        let mtime = dev_dir_mtime();
        let dir_changed = mtime != last_dev_mtime;
        let due = last_poll.elapsed() >= poll_interval;
        if !dir_changed && !due {
            continue;
        }
        last_dev_mtime = mtime;
        last_poll = Instant::now();

        let snapshot = registry.list_removable().unwrap_or_default();
        let events = diff_snapshots(&last_snapshot, &snapshot);
        last_snapshot = snapshot;

        for event in events {
            if tx.send(event).is_err() {
                return;
            }
        }
    }
}

fn dev_dir_mtime() -> Option<SystemTime> {
    fs::metadata("/dev").and_then(|m| m.modified()).ok()
}

/// Diffs two removable-device snapshots by path.
///
/// Emits one `Inserted` per new path, one `Removed` per vanished path, and a
/// single trailing `ListChanged` whenever the set content differs (not just
/// its size).
pub fn diff_snapshots(
    previous: &[DeviceDescriptor],
    current: &[DeviceDescriptor],
) -> Vec<DeviceEvent> {
    let mut events = Vec::new();

    for device in current {
        if !previous.iter().any(|d| d.path == device.path) {
            debug!(path = %device.path.display(), "device inserted");
            events.push(DeviceEvent::Inserted(device.clone()));
        }
    }
    for device in previous {
        if !current.iter().any(|d| d.path == device.path) {
            debug!(path = %device.path.display(), "device removed");
            events.push(DeviceEvent::Removed(device.clone()));
        }
    }

    if !events.is_empty() {
        events.push(DeviceEvent::ListChanged);
    }
    events
}

#[derive(Deserialize)]
struct LsblkDocument {
    #[serde(default)]
    blockdevices: Vec<LsblkEntry>,
}

#[derive(Deserialize)]
struct LsblkEntry {
    name: Option<String>,
    size: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    mountpoint: Option<String>,
    rm: Option<serde_json::Value>,
    vendor: Option<String>,
    model: Option<String>,
    fstype: Option<String>,
    uuid: Option<String>,
    tran: Option<String>,
}

/// Parses `lsblk -J` output into descriptors.
///
/// Entries that are not whole disks, or whose size is zero or unparsable,
/// are discarded. Malformed JSON yields an empty list.
pub fn parse_lsblk_output(output: &str) -> Vec<DeviceDescriptor> {
    let document: LsblkDocument = match serde_json::from_str(output) {
        Ok(doc) => doc,
        Err(e) => {
            warn!(error = %e, "failed to parse lsblk output");
            return Vec::new();
        }
    };

    let mut devices = Vec::new();
    for entry in document.blockdevices {
        if entry.kind.as_deref() != Some("disk") {
            continue;
        }
        let Some(name) = entry.name else { continue };

        let size_string = entry.size.unwrap_or_default();
        let size = parse_size_string(&size_string);
        if size == 0 {
            continue;
        }

        // lsblk reports `rm` as a bool on newer versions and "1"/"0" on
        // older ones.
        let removable = match entry.rm {
            Some(serde_json::Value::Bool(b)) => b,
            Some(serde_json::Value::String(s)) => s == "1",
            _ => false,
        };

        let transport = entry.tran.unwrap_or_default();
        let is_usb = transport == "usb" || name.starts_with("sd");
        let is_mmc = name.starts_with("mmcblk");

        let mut mount_points = Vec::new();
        if let Some(mount_point) = entry.mountpoint.filter(|m| !m.is_empty()) {
            mount_points.push(mount_point);
        }

        devices.push(DeviceDescriptor {
            path: PathBuf::from(format!("/dev/{name}")),
            name,
            vendor: entry.vendor.unwrap_or_default().trim().to_string(),
            model: entry.model.unwrap_or_default().trim().to_string(),
            size,
            size_string,
            filesystem: entry.fstype.unwrap_or_default(),
            uuid: entry.uuid.unwrap_or_default(),
            removable,
            is_usb,
            is_mmc,
            mount_points,
        });
    }
    devices
}

/// Parses a unit-suffixed size string ("7.5G", "512M", "1000") into bytes
/// using binary multiples. Unrecognized strings yield 0.
pub fn parse_size_string(size: &str) -> u64 {
    let size = size.trim();
    if size.is_empty() {
        return 0;
    }

    let digits_end = size
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(size.len());
    let (number, suffix) = size.split_at(digits_end);
    let Ok(value) = number.parse::<f64>() else {
        return 0;
    };

    let multiplier: u64 = match suffix.trim().trim_end_matches(['B', 'b', 'i']).to_ascii_uppercase().as_str() {
        "" => 1,
        "K" => 1024,
        "M" => 1024 * 1024,
        "G" => 1024 * 1024 * 1024,
        "T" => 1024u64.pow(4),
        _ => return 0,
    };

    (value * multiplier as f64) as u64
}

/// `/dev` entries named `<base><digits>` for the given device.
fn partitions_of(device_path: &Path) -> Result<Vec<PathBuf>, RegistryError> {
    let base = device_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut partitions = Vec::new();
    for entry in fs::read_dir("/dev")? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(rest) = name.strip_prefix(&base) {
            if !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit() || c == 'p') {
                partitions.push(PathBuf::from("/dev").join(name));
            }
        }
    }
    partitions.sort();
    Ok(partitions)
}

/// Mount points of a device prefix, from `/proc/mounts`.
fn mount_points_of(path: &Path) -> Result<Vec<String>, RegistryError> {
    let path_str = path.to_string_lossy();
    let mounts = fs::read_to_string("/proc/mounts").unwrap_or_default();

    let mut points = Vec::new();
    for line in mounts.lines() {
        let mut fields = line.split_whitespace();
        let (Some(device), Some(mount_point)) = (fields.next(), fields.next()) else {
            continue;
        };
        if device.starts_with(path_str.as_ref()) {
            points.push(unescape_mount_point(mount_point));
        }
    }
    Ok(points)
}

// /proc/mounts octal-escapes spaces and other specials.
fn unescape_mount_point(raw: &str) -> String {
    let mut result = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            let code: String = chars.by_ref().take(3).collect();
            if let Ok(byte) = u8::from_str_radix(&code, 8) {
                result.push(byte as char);
                continue;
            }
            result.push(c);
            result.push_str(&code);
        } else {
            result.push(c);
        }
    }
    result
}

/// The whole-disk path backing the root filesystem, if resolvable.
fn system_disk_path() -> Option<PathBuf> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    for disk in disks.iter() {
        if disk.mount_point() == Path::new("/") {
            let path = PathBuf::from("/dev").join(disk.name());
            return Some(parent_device_path(&path));
        }
    }
    None
}

/// Maps a partition path to its whole-disk parent (`/dev/sda1` -> `/dev/sda`,
/// `/dev/nvme0n1p2` -> `/dev/nvme0n1`).
fn parent_device_path(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if path_str.starts_with("/dev/sd") || path_str.starts_with("/dev/hd") {
        let trimmed = path_str.trim_end_matches(|c: char| c.is_ascii_digit());
        return PathBuf::from(trimmed);
    }
    if path_str.starts_with("/dev/mmcblk") || path_str.starts_with("/dev/nvme") {
        if let Some(index) = path_str.rfind('p') {
            if path_str[index + 1..].chars().all(|c| c.is_ascii_digit())
                && !path_str[index + 1..].is_empty()
            {
                return PathBuf::from(&path_str[..index]);
            }
        }
    }
    path.to_path_buf()
}
