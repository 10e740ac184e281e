use std::fmt;
use std::path::PathBuf;

/// Describes a block device discovered on the system.
///
/// Produced fresh on every enumeration by [`crate::registry::DeviceRegistry`];
/// there is no persistent identity beyond path equality across snapshots.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// The system path to the device (e.g. `/dev/sdb`).
    pub path: PathBuf,
    /// The kernel-provided name of the device (e.g. "sdb").
    pub name: String,
    /// Device vendor string, if reported.
    pub vendor: String,
    /// Device model string, if reported.
    pub model: String,
    /// Total size in bytes.
    pub size: u64,
    /// The size as reported by the listing tool (e.g. "14.9G").
    pub size_string: String,
    /// Filesystem type on the device, if any.
    pub filesystem: String,
    /// Filesystem UUID, if any.
    pub uuid: String,
    /// Whether the kernel reports the device as removable.
    pub removable: bool,
    /// Whether the device is attached over USB.
    pub is_usb: bool,
    /// Whether the device is an MMC/SD card.
    pub is_mmc: bool,
    /// Mount points of the device; empty means unmounted.
    pub mount_points: Vec<String>,
}

impl DeviceDescriptor {
    pub fn is_mounted(&self) -> bool {
        !self.mount_points.is_empty()
    }

    /// A short human-readable identity, preferring vendor/model over the
    /// kernel name.
    pub fn display_name(&self) -> String {
        let vendor = self.vendor.trim();
        let model = self.model.trim();
        match (vendor.is_empty(), model.is_empty()) {
            (false, false) => format!("{vendor} {model}"),
            (true, false) => model.to_string(),
            (false, true) => vendor.to_string(),
            (true, true) => self.name.clone(),
        }
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mount_info = if self.is_mounted() {
            format!("[Mounted at {}]", self.mount_points.join(", "))
        } else {
            "[Not mounted]".to_string()
        };

        write!(
            f,
            "{:<12} {:<24} {:>8} {}",
            self.path.display(),
            self.display_name(),
            self.size_string,
            mount_info
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_name_prefers_vendor_and_model() {
        let dev = DeviceDescriptor {
            name: "sdb".into(),
            vendor: "SanDisk ".into(),
            model: "Ultra Fit".into(),
            ..Default::default()
        };
        assert_eq!(dev.display_name(), "SanDisk Ultra Fit");
    }

    #[test]
    fn display_name_falls_back_to_kernel_name() {
        let dev = DeviceDescriptor {
            name: "mmcblk0".into(),
            ..Default::default()
        };
        assert_eq!(dev.display_name(), "mmcblk0");
    }

    #[test]
    fn mounted_state_follows_mount_points() {
        let mut dev = DeviceDescriptor::default();
        assert!(!dev.is_mounted());
        dev.mount_points.push("/media/usb".into());
        assert!(dev.is_mounted());
    }
}
