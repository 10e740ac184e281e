//! Post-burn verification.
//!
//! Compares a SHA-256 digest of the source image against a digest of the
//! first image-length bytes of the device. Runs only after the write and
//! sync finished; never concurrently with a write to the same device.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use sha2::{Digest, Sha256};
use tracing::info;

use crate::error::VerifyError;

const BUFFER_SIZE: usize = 1024 * 1024;

#[cfg(unix)]
nix::ioctl_read!(blkgetsize64, 0x12, 114, u64);

/// Total usable length of a device or file.
///
/// Block devices report a zero metadata length; for those the size comes
/// from the `BLKGETSIZE64` ioctl.
fn device_length(file: &File) -> std::io::Result<u64> {
    let metadata = file.metadata()?;
    if metadata.len() > 0 {
        return Ok(metadata.len());
    }

    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;

        let mut size: u64 = 0;
        let fd = file.as_raw_fd();
        if unsafe { blkgetsize64(fd, &mut size) }.is_ok() {
            return Ok(size);
        }
    }

    Ok(metadata.len())
}

/// Digests the image and an equal-length read of the device and reports
/// whether they match. A device shorter than the image cannot match.
pub fn verify_burn<F>(
    image_path: &Path,
    device_path: &Path,
    cancel: &AtomicBool,
    mut on_progress: F,
) -> Result<bool, VerifyError>
where
    F: FnMut(u64, u64),
{
    let image_file = File::open(image_path)?;
    let image_len = image_file.metadata()?.len();

    let device_file = File::open(device_path)?;
    if device_length(&device_file)? < image_len {
        info!(
            image = %image_path.display(),
            device = %device_path.display(),
            "device is smaller than the image; verification fails"
        );
        return Ok(false);
    }

    let mut image_reader = BufReader::new(image_file);
    let mut device_reader = BufReader::new(device_file);

    let mut image_hasher = Sha256::new();
    let mut device_hasher = Sha256::new();

    let mut image_buf = vec![0u8; BUFFER_SIZE];
    let mut device_buf = vec![0u8; BUFFER_SIZE];

    let mut remaining = image_len;
    while remaining > 0 {
        if cancel.load(Ordering::SeqCst) {
            return Err(VerifyError::Cancelled);
        }

        let chunk = std::cmp::min(BUFFER_SIZE as u64, remaining) as usize;
        image_reader.read_exact(&mut image_buf[..chunk])?;
        device_reader.read_exact(&mut device_buf[..chunk])?;

        image_hasher.update(&image_buf[..chunk]);
        device_hasher.update(&device_buf[..chunk]);

        remaining -= chunk as u64;
        on_progress(image_len - remaining, image_len);
    }

    let matches = image_hasher.finalize() == device_hasher.finalize();
    info!(matches, "verification finished");
    Ok(matches)
}
