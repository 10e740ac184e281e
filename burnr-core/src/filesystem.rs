//! Filesystem profiles and label/cluster-size rules.
//!
//! The profile table is a process-wide constant; every supported filesystem
//! has exactly one entry describing its cluster-size range, volume limits,
//! label constraints and mkfs invocation.

use std::fmt;
use std::str::FromStr;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;
const TIB: u64 = 1024 * GIB;
const PIB: u64 = 1024 * TIB;

/// Supported target filesystems.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FsKind {
    Fat32,
    Ntfs,
    Exfat,
    Ext4,
}

/// Static description of one supported filesystem.
pub struct FsProfile {
    pub kind: FsKind,
    pub name: &'static str,
    pub min_cluster_size: u32,
    pub max_cluster_size: u32,
    pub default_cluster_size: u32,
    pub max_volume_size: u64,
    pub max_label_len: usize,
    pub bootable: bool,
    pub mkfs_program: &'static str,
}

pub const PROFILES: [FsProfile; 4] = [
    FsProfile {
        kind: FsKind::Fat32,
        name: "FAT32",
        min_cluster_size: 512,
        max_cluster_size: 32768,
        default_cluster_size: 4096,
        max_volume_size: 2 * TIB,
        max_label_len: 11,
        bootable: true,
        mkfs_program: "mkfs.fat",
    },
    FsProfile {
        kind: FsKind::Ntfs,
        name: "NTFS",
        min_cluster_size: 512,
        max_cluster_size: 65536,
        default_cluster_size: 4096,
        max_volume_size: 256 * TIB,
        max_label_len: 32,
        bootable: true,
        mkfs_program: "mkfs.ntfs",
    },
    FsProfile {
        kind: FsKind::Exfat,
        name: "exFAT",
        min_cluster_size: 512,
        max_cluster_size: 32 * MIB as u32,
        default_cluster_size: 128 * KIB as u32,
        max_volume_size: 128 * PIB,
        max_label_len: 15,
        bootable: false,
        mkfs_program: "mkfs.exfat",
    },
    FsProfile {
        kind: FsKind::Ext4,
        name: "ext4",
        min_cluster_size: 1024,
        max_cluster_size: 65536,
        default_cluster_size: 4096,
        max_volume_size: 1024 * PIB,
        max_label_len: 16,
        bootable: true,
        mkfs_program: "mkfs.ext4",
    },
];

impl FsKind {
    pub fn profile(self) -> &'static FsProfile {
        match self {
            FsKind::Fat32 => &PROFILES[0],
            FsKind::Ntfs => &PROFILES[1],
            FsKind::Exfat => &PROFILES[2],
            FsKind::Ext4 => &PROFILES[3],
        }
    }

    pub fn name(self) -> &'static str {
        self.profile().name
    }
}

impl fmt::Display for FsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FsKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fat32" | "vfat" | "fat" => Ok(FsKind::Fat32),
            "ntfs" => Ok(FsKind::Ntfs),
            "exfat" => Ok(FsKind::Exfat),
            "ext4" => Ok(FsKind::Ext4),
            other => Err(format!("unsupported filesystem: {other}")),
        }
    }
}

/// A cluster size is valid when it is a power of two within the profile's
/// `[min, max]` range.
pub fn is_valid_cluster_size(fs: FsKind, size: u32) -> bool {
    let profile = fs.profile();
    size >= profile.min_cluster_size
        && size <= profile.max_cluster_size
        && size.is_power_of_two()
}

/// Checks a volume label against the filesystem's length and charset rules.
///
/// Empty labels are always allowed.
pub fn is_valid_label(fs: FsKind, label: &str) -> bool {
    if label.is_empty() {
        return true;
    }
    let profile = fs.profile();
    if label.chars().count() > profile.max_label_len {
        return false;
    }
    match fs {
        FsKind::Fat32 => label.chars().all(is_fat32_label_char),
        _ => true,
    }
}

fn is_fat32_label_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == ' ' || c == '_' || c == '-'
}

/// Coerces a label into legal form for the filesystem: FAT32 labels are
/// upper-cased and stripped of illegal characters; all labels are truncated
/// to the filesystem's maximum length.
pub fn sanitize_label(fs: FsKind, label: &str) -> String {
    let profile = fs.profile();
    let mut sanitized: String = match fs {
        FsKind::Fat32 => label
            .to_uppercase()
            .chars()
            .filter(|&c| is_fat32_label_char(c))
            .collect(),
        _ => label.to_string(),
    };
    if sanitized.chars().count() > profile.max_label_len {
        sanitized = sanitized.chars().take(profile.max_label_len).collect();
    }
    sanitized
}

/// Recommended cluster size for a volume of the given size, following the
/// usual vendor guidance per filesystem.
pub fn recommended_cluster_size(fs: FsKind, volume_size: u64) -> u32 {
    match fs {
        FsKind::Fat32 => {
            if volume_size <= 256 * MIB {
                512
            } else if volume_size <= 8 * GIB {
                4096
            } else if volume_size <= 16 * GIB {
                8192
            } else if volume_size <= 32 * GIB {
                16384
            } else {
                32768
            }
        }
        FsKind::Ntfs => {
            if volume_size <= 2 * TIB {
                4096
            } else {
                8192
            }
        }
        FsKind::Exfat => {
            if volume_size <= 32 * GIB {
                32768
            } else {
                128 * KIB as u32
            }
        }
        FsKind::Ext4 => 4096,
    }
}

/// Filesystems worth offering for a device of the given size.
pub fn recommended_filesystems(device_size: u64) -> Vec<FsKind> {
    if device_size <= 2 * GIB {
        vec![FsKind::Fat32]
    } else if device_size <= 32 * GIB {
        vec![FsKind::Fat32, FsKind::Exfat, FsKind::Ext4]
    } else {
        vec![FsKind::Exfat, FsKind::Ntfs, FsKind::Ext4]
    }
}

/// Builds the mkfs argument vector for the filesystem. Label and cluster
/// flags are appended only when provided and legal for the profile; the
/// partition path is appended by the caller.
pub fn format_args(fs: FsKind, label: Option<&str>, cluster_size: Option<u32>) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();
    let label = label.filter(|l| !l.is_empty() && is_valid_label(fs, l));
    let cluster_size = cluster_size.filter(|&c| is_valid_cluster_size(fs, c));

    match fs {
        FsKind::Fat32 => {
            args.push("-F".into());
            args.push("32".into());
            if let Some(label) = label {
                args.push("-n".into());
                args.push(label.to_string());
            }
            if let Some(cluster) = cluster_size {
                args.push("-s".into());
                args.push(cluster.to_string());
            }
        }
        FsKind::Ntfs => {
            args.push("-f".into());
            if let Some(label) = label {
                args.push("-L".into());
                args.push(label.to_string());
            }
            if let Some(cluster) = cluster_size {
                args.push("-c".into());
                args.push(cluster.to_string());
            }
        }
        FsKind::Exfat => {
            if let Some(label) = label {
                args.push("-n".into());
                args.push(label.to_string());
            }
        }
        FsKind::Ext4 => {
            args.push("-F".into());
            if let Some(label) = label {
                args.push("-L".into());
                args.push(label.to_string());
            }
        }
    }

    args
}

/// Renders a byte count as a human-readable size string.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[unit])
    } else {
        format!("{:.2} {}", size, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_size_must_be_power_of_two_in_range() {
        assert!(is_valid_cluster_size(FsKind::Fat32, 4096));
        assert!(!is_valid_cluster_size(FsKind::Fat32, 5000));
        assert!(!is_valid_cluster_size(FsKind::Fat32, 3));
        assert!(!is_valid_cluster_size(FsKind::Fat32, 65536));
        assert!(is_valid_cluster_size(FsKind::Ext4, 1024));
        assert!(!is_valid_cluster_size(FsKind::Ext4, 512));
    }

    #[test]
    fn fat32_label_rules() {
        assert!(is_valid_label(FsKind::Fat32, "BOOT_USB"));
        assert!(is_valid_label(FsKind::Fat32, ""));
        assert!(!is_valid_label(FsKind::Fat32, "TWELVECHARSX"));
        assert!(!is_valid_label(FsKind::Fat32, "bad*chars"));
    }

    #[test]
    fn sanitize_fat32_truncates_and_uppercases() {
        assert_eq!(
            sanitize_label(FsKind::Fat32, "my long usb label"),
            "MY LONG USB"
        );
        assert_eq!(sanitize_label(FsKind::Fat32, "a*b?c"), "ABC");
    }

    #[test]
    fn sanitize_ext4_truncates_without_case_change() {
        assert_eq!(
            sanitize_label(FsKind::Ext4, "MixedCaseLabelXYZ"),
            "MixedCaseLabelXY"
        );
    }

    #[test]
    fn recommended_cluster_sizes() {
        assert_eq!(recommended_cluster_size(FsKind::Fat32, 8 * GIB), 4096);
        assert_eq!(recommended_cluster_size(FsKind::Fat32, 100 * MIB), 512);
        assert_eq!(recommended_cluster_size(FsKind::Fat32, 64 * GIB), 32768);
        assert_eq!(recommended_cluster_size(FsKind::Exfat, 64 * GIB), 131072);
        assert_eq!(recommended_cluster_size(FsKind::Ext4, 64 * GIB), 4096);
    }

    #[test]
    fn format_args_include_label_and_cluster_only_when_valid() {
        let args = format_args(FsKind::Fat32, Some("BOOT"), Some(4096));
        assert_eq!(args, vec!["-F", "32", "-n", "BOOT", "-s", "4096"]);

        // Invalid cluster size is dropped, not passed through.
        let args = format_args(FsKind::Fat32, Some("BOOT"), Some(5000));
        assert_eq!(args, vec!["-F", "32", "-n", "BOOT"]);

        let args = format_args(FsKind::Ext4, None, None);
        assert_eq!(args, vec!["-F"]);

        let args = format_args(FsKind::Exfat, Some("STUFF"), Some(131072));
        assert_eq!(args, vec!["-n", "STUFF"]);
    }

    #[test]
    fn size_formatting() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(4 * GIB), "4.00 GB");
    }
}
