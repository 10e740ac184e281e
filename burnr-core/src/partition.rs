//! Partition table creation and filesystem formatting via parted/mkfs.
//!
//! Every operation shells out through [`crate::process::run`] with a bounded
//! timeout and succeeds iff the tool exits 0.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::info;

use crate::error::PartitionError;
use crate::filesystem::{self, FsKind};
use crate::process;

const PARTED_TIMEOUT: Duration = Duration::from_secs(10);
const BOOT_FLAG_TIMEOUT: Duration = Duration::from_secs(5);
const MKFS_TIMEOUT: Duration = Duration::from_secs(30);

/// Partition table scheme.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PartitionScheme {
    Mbr,
    Gpt,
}

impl PartitionScheme {
    fn parted_label(self) -> &'static str {
        match self {
            PartitionScheme::Mbr => "msdos",
            PartitionScheme::Gpt => "gpt",
        }
    }
}

impl std::str::FromStr for PartitionScheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mbr" | "msdos" | "dos" => Ok(PartitionScheme::Mbr),
            "gpt" => Ok(PartitionScheme::Gpt),
            other => Err(format!("unsupported partition scheme: {other}")),
        }
    }
}

/// A partition to create: parted name, optional filesystem hint, and the
/// start/end of its extent.
pub struct PartitionSpec {
    pub name: &'static str,
    pub fs_hint: Option<&'static str>,
    pub start: &'static str,
    pub end: &'static str,
}

impl PartitionSpec {
    /// A single primary partition spanning the whole device.
    pub fn primary() -> Self {
        Self {
            name: "primary",
            fs_hint: None,
            start: "0%",
            end: "100%",
        }
    }

    /// An EFI System Partition from 1 MiB to the end of the device.
    pub fn esp() -> Self {
        Self {
            name: "ESP",
            fs_hint: Some("fat32"),
            start: "1MiB",
            end: "100%",
        }
    }
}

/// Issues partitioning and formatting commands.
#[derive(Default)]
pub struct PartitionFormatter;

impl PartitionFormatter {
    pub fn new() -> Self {
        Self
    }

    /// Writes a fresh partition table of the given scheme.
    pub fn create_table(
        &self,
        device_path: &Path,
        scheme: PartitionScheme,
    ) -> Result<(), PartitionError> {
        info!(device = %device_path.display(), scheme = scheme.parted_label(), "creating partition table");

        let device = device_path.to_string_lossy();
        let output = process::run(
            "parted",
            &[&device, "--script", "mklabel", scheme.parted_label()],
            PARTED_TIMEOUT,
        )?;
        if !output.success() {
            return Err(PartitionError::ToolFailed("parted", output.exit_code()));
        }
        Ok(())
    }

    /// Creates one partition as described by `spec`.
    pub fn create_partition(
        &self,
        device_path: &Path,
        spec: &PartitionSpec,
    ) -> Result<(), PartitionError> {
        let device = device_path.to_string_lossy();
        let mut args: Vec<&str> = vec![device.as_ref(), "--script", "mkpart", spec.name];
        if let Some(hint) = spec.fs_hint {
            args.push(hint);
        }
        args.push(spec.start);
        args.push(spec.end);

        let output = process::run("parted", &args, PARTED_TIMEOUT)?;
        if !output.success() {
            return Err(PartitionError::ToolFailed("parted", output.exit_code()));
        }
        Ok(())
    }

    /// Turns the boot flag on for the numbered partition.
    pub fn set_boot_flag(&self, device_path: &Path, number: u32) -> Result<(), PartitionError> {
        let device = device_path.to_string_lossy();
        let number = number.to_string();
        let output = process::run(
            "parted",
            &[&device, "--script", "set", &number, "boot", "on"],
            BOOT_FLAG_TIMEOUT,
        )?;
        if !output.success() {
            return Err(PartitionError::ToolFailed("parted", output.exit_code()));
        }
        Ok(())
    }

    /// Formats a partition. Label and cluster-size flags are passed through
    /// only when valid for the filesystem profile.
    pub fn format(
        &self,
        partition_path: &Path,
        fs: FsKind,
        label: Option<&str>,
        cluster_size: Option<u32>,
    ) -> Result<(), PartitionError> {
        info!(partition = %partition_path.display(), fs = fs.name(), "formatting");

        let program = fs.profile().mkfs_program;
        let mut args = filesystem::format_args(fs, label, cluster_size);
        args.push(partition_path.to_string_lossy().into_owned());
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();

        let output = process::run(program, &arg_refs, MKFS_TIMEOUT)?;
        if !output.success() {
            return Err(PartitionError::ToolFailed(program, output.exit_code()));
        }
        Ok(())
    }
}

/// Derives the path of the numbered partition from the device-naming
/// convention: `sdX`/`hdX` take a bare numeric suffix, `mmcblkN`/`nvmeXnY`
/// take a `p<number>` suffix.
pub fn partition_path(device_path: &Path, number: u32) -> PathBuf {
    let device = device_path.to_string_lossy();
    let name = device_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    if name.starts_with("mmcblk") || name.starts_with("nvme") {
        PathBuf::from(format!("{device}p{number}"))
    } else {
        PathBuf::from(format!("{device}{number}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_path_follows_device_naming() {
        assert_eq!(
            partition_path(Path::new("/dev/sda"), 1),
            PathBuf::from("/dev/sda1")
        );
        assert_eq!(
            partition_path(Path::new("/dev/hdb"), 2),
            PathBuf::from("/dev/hdb2")
        );
        assert_eq!(
            partition_path(Path::new("/dev/mmcblk0"), 1),
            PathBuf::from("/dev/mmcblk0p1")
        );
        assert_eq!(
            partition_path(Path::new("/dev/nvme0n1"), 3),
            PathBuf::from("/dev/nvme0n1p3")
        );
    }

    #[test]
    fn scheme_maps_to_parted_label() {
        assert_eq!(PartitionScheme::Mbr.parted_label(), "msdos");
        assert_eq!(PartitionScheme::Gpt.parted_label(), "gpt");
    }

    #[test]
    fn esp_spec_spans_from_one_mib() {
        let spec = PartitionSpec::esp();
        assert_eq!(spec.start, "1MiB");
        assert_eq!(spec.end, "100%");
        assert_eq!(spec.fs_hint, Some("fat32"));
    }
}
