//! Image file inspection and on-the-fly decompression.
//!
//! Images may arrive compressed (`.gz`, `.xz`, `.zst`); those are expanded
//! to a temporary file before burning so the copy tool sees raw bytes. The
//! temporary file lives exactly as long as the [`PreparedImage`] that owns
//! it.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use flate2::read::GzDecoder;
use tempfile::{NamedTempFile, TempPath};
use tracing::debug;
use xz2::read::XzDecoder;
use zstd::stream::read::Decoder as ZstdDecoder;

/// Recognized disk image container kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageKind {
    Iso,
    Img,
    Dmg,
    Vhd,
    Vhdx,
    Vmdk,
    Unknown,
}

impl ImageKind {
    pub fn name(self) -> &'static str {
        match self {
            ImageKind::Iso => "ISO",
            ImageKind::Img => "IMG",
            ImageKind::Dmg => "DMG",
            ImageKind::Vhd => "VHD",
            ImageKind::Vhdx => "VHDX",
            ImageKind::Vmdk => "VMDK",
            ImageKind::Unknown => "Unknown",
        }
    }
}

/// Compression wrappers recognized by extension.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compression {
    Gzip,
    Xz,
    Zstd,
}

/// Result of analyzing an image file.
#[derive(Debug, Clone)]
pub struct ImageInfo {
    pub path: PathBuf,
    pub size: u64,
    pub kind: ImageKind,
    pub compression: Option<Compression>,
}

impl ImageInfo {
    pub fn is_valid(&self) -> bool {
        self.kind != ImageKind::Unknown || self.compression.is_some()
    }
}

/// Detects a compression wrapper from the file extension.
pub fn detect_compression(path: &Path) -> Option<Compression> {
    let ext = path.extension()?.to_str()?.to_lowercase();
    match ext.as_str() {
        "gz" | "gzip" => Some(Compression::Gzip),
        "xz" => Some(Compression::Xz),
        "zst" | "zstd" => Some(Compression::Zstd),
        _ => None,
    }
}

/// Detects the image kind, by extension first and by magic bytes when the
/// extension is not conclusive.
pub fn detect_kind(path: &Path) -> io::Result<ImageKind> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();

    let by_extension = match ext.as_str() {
        "iso" => Some(ImageKind::Iso),
        "img" => Some(ImageKind::Img),
        "dmg" => Some(ImageKind::Dmg),
        "vhd" => Some(ImageKind::Vhd),
        "vhdx" => Some(ImageKind::Vhdx),
        "vmdk" => Some(ImageKind::Vmdk),
        _ => None,
    };
    if let Some(kind) = by_extension {
        return Ok(kind);
    }

    detect_kind_by_magic(path)
}

fn detect_kind_by_magic(path: &Path) -> io::Result<ImageKind> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();

    let mut header = [0u8; 2048];
    let read = file.read(&mut header)?;
    let header = &header[..read];

    if header.starts_with(b"conectix") {
        return Ok(ImageKind::Vhd);
    }
    if header.windows(4).any(|w| w == b"koly") {
        return Ok(ImageKind::Dmg);
    }

    // ISO 9660 volume descriptor lives at offset 32769.
    if len > 32774 {
        let mut magic = [0u8; 5];
        file.seek(SeekFrom::Start(32769))?;
        file.read_exact(&mut magic)?;
        if &magic == b"CD001" {
            return Ok(ImageKind::Iso);
        }
    }

    Ok(ImageKind::Unknown)
}

/// Inspects an image file: existence, size, kind, compression wrapper.
pub fn analyze(path: &Path) -> io::Result<ImageInfo> {
    let metadata = std::fs::metadata(path)?;
    Ok(ImageInfo {
        path: path.to_path_buf(),
        size: metadata.len(),
        kind: detect_kind(path)?,
        compression: detect_compression(path),
    })
}

/// An image ready to burn. When the source was compressed, `path` points at
/// a decompressed temporary file that is deleted on drop.
pub struct PreparedImage {
    pub path: PathBuf,
    _temp_handle: Option<TempPath>,
}

impl AsRef<Path> for PreparedImage {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

/// Decompresses the image to a temporary file when its extension says it is
/// compressed; otherwise hands back the original path.
pub fn prepare<F>(
    input_path: &Path,
    cancel: &AtomicBool,
    mut on_progress: F,
) -> io::Result<PreparedImage>
where
    F: FnMut(u64),
{
    let Some(compression) = detect_compression(input_path) else {
        return Ok(PreparedImage {
            path: input_path.to_path_buf(),
            _temp_handle: None,
        });
    };

    debug!(path = %input_path.display(), ?compression, "decompressing image");

    let input_file = File::open(input_path)?;
    let mut reader: Box<dyn Read> = match compression {
        Compression::Gzip => Box::new(GzDecoder::new(BufReader::new(input_file))),
        Compression::Xz => Box::new(XzDecoder::new(BufReader::new(input_file))),
        Compression::Zstd => Box::new(ZstdDecoder::new(BufReader::new(input_file))?),
    };

    let mut temp_file = NamedTempFile::new()?;
    {
        let mut writer = BufWriter::new(&mut temp_file);
        let mut buffer = [0u8; 8192];
        let mut total: u64 = 0;

        loop {
            if cancel.load(Ordering::SeqCst) {
                return Err(io::Error::new(
                    io::ErrorKind::Interrupted,
                    "Operation cancelled by user",
                ));
            }

            let n = reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            writer.write_all(&buffer[..n])?;
            total += n as u64;
            on_progress(total);
        }
        writer.flush()?;
    }

    let temp_path = temp_file.into_temp_path();
    Ok(PreparedImage {
        path: temp_path.to_path_buf(),
        _temp_handle: Some(temp_path),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn kind_detection_by_extension() {
        assert_eq!(detect_kind(Path::new("x.iso")).unwrap(), ImageKind::Iso);
        assert_eq!(detect_kind(Path::new("x.img")).unwrap(), ImageKind::Img);
        assert_eq!(detect_kind(Path::new("x.vhdx")).unwrap(), ImageKind::Vhdx);
    }

    #[test]
    fn iso_magic_detected_without_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mystery");
        let mut file = File::create(&path).unwrap();
        file.write_all(&vec![0u8; 32769]).unwrap();
        file.write_all(b"CD001").unwrap();
        file.write_all(&[0u8; 64]).unwrap();

        assert_eq!(detect_kind(&path).unwrap(), ImageKind::Iso);
    }

    #[test]
    fn vhd_magic_detected_without_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mystery");
        std::fs::write(&path, b"conectix-rest-of-header").unwrap();

        assert_eq!(detect_kind(&path).unwrap(), ImageKind::Vhd);
    }

    #[test]
    fn compression_detection() {
        assert_eq!(
            detect_compression(Path::new("disk.img.gz")),
            Some(Compression::Gzip)
        );
        assert_eq!(
            detect_compression(Path::new("disk.img.xz")),
            Some(Compression::Xz)
        );
        assert_eq!(
            detect_compression(Path::new("disk.img.zst")),
            Some(Compression::Zstd)
        );
        assert_eq!(detect_compression(Path::new("disk.img")), None);
    }

    #[test]
    fn prepare_passes_uncompressed_images_through() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.img");
        std::fs::write(&path, b"raw image bytes").unwrap();

        let cancel = AtomicBool::new(false);
        let prepared = prepare(&path, &cancel, |_| {}).unwrap();
        assert_eq!(prepared.path, path);
    }

    #[test]
    fn prepare_decompresses_gzip_images() {
        use flate2::Compression as GzLevel;
        use flate2::write::GzEncoder;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img.gz");
        let file = File::create(&path).unwrap();
        let mut encoder = GzEncoder::new(file, GzLevel::default());
        encoder.write_all(b"decompressed contents").unwrap();
        encoder.finish().unwrap();

        let cancel = AtomicBool::new(false);
        let mut reported = 0;
        let prepared = prepare(&path, &cancel, |total| reported = total).unwrap();

        let contents = std::fs::read(&prepared.path).unwrap();
        assert_eq!(contents, b"decompressed contents");
        assert_eq!(reported, contents.len() as u64);
        assert_ne!(prepared.path, path);
    }
}
