//! Exam photo validation and decoding.
//!
//! Files are checked before they are decoded: existence, emptiness, and a
//! size limit chosen from the format detected in the leading bytes. Decoded
//! images are always converted to 8-bit grayscale.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::{GrayImage, ImageFormat};
use tracing::debug;

use crate::config::ImageLimits;
use crate::errors::GradingError;

/// Bytes read to sniff the image format
const FORMAT_PROBE_BYTES: usize = 32;

/// Size limit that applies to `format`.
pub fn format_limit(format: Option<ImageFormat>, limits: &ImageLimits) -> u64 {
    match format {
        Some(ImageFormat::Png) => limits.png_max,
        Some(ImageFormat::Jpeg) => limits.jpeg_max,
        Some(ImageFormat::Bmp) => limits.bmp_max,
        Some(ImageFormat::Tiff) => limits.tiff_max,
        _ => limits.max_file_size,
    }
}

/// Validates an image file and returns its size in bytes.
pub fn validate_image_file(path: &Path, limits: &ImageLimits) -> Result<u64> {
    if !path.exists() {
        return Err(anyhow!("file does not exist ({})", path.display()));
    }
    if !path.is_file() {
        return Err(anyhow!("path is not a file ({})", path.display()));
    }

    let file_size = path
        .metadata()
        .with_context(|| format!("cannot read file metadata ({})", path.display()))?
        .len();
    if file_size == 0 {
        return Err(anyhow!("file is empty ({})", path.display()));
    }

    let mut probe = [0u8; FORMAT_PROBE_BYTES];
    let read = File::open(path)
        .and_then(|mut f| f.read(&mut probe))
        .with_context(|| format!("cannot open {}", path.display()))?;
    let format = image::guess_format(&probe[..read]).ok();
    let limit = format_limit(format, limits);

    debug!(
        path = %path.display(),
        format = ?format,
        file_size,
        limit,
        "Validated image file"
    );

    if file_size > limit {
        return Err(anyhow!(
            "file too large for {:?} format: {} bytes (maximum allowed: {} bytes)",
            format,
            file_size,
            limit
        ));
    }
    Ok(file_size)
}

/// Decodes an in-memory image to grayscale.
pub fn decode_gray_image(bytes: &[u8], limits: &ImageLimits) -> Result<GrayImage, GradingError> {
    if bytes.is_empty() {
        return Err(GradingError::ImageLoad("image buffer is empty".to_string()));
    }
    let format = image::guess_format(bytes).ok();
    let limit = format_limit(format, limits);
    if bytes.len() as u64 > limit {
        return Err(GradingError::ImageLoad(format!(
            "buffer too large for {:?} format: {} bytes (maximum allowed: {} bytes)",
            format,
            bytes.len(),
            limit
        )));
    }

    image::load_from_memory(bytes)
        .map(|img| img.to_luma8())
        .map_err(|e| GradingError::ImageLoad(e.to_string()))
}

/// Validates and decodes an image file to grayscale.
pub fn load_gray_image(path: &Path, limits: &ImageLimits) -> Result<GrayImage, GradingError> {
    validate_image_file(path, limits).map_err(|e| GradingError::ImageLoad(format!("{:#}", e)))?;
    image::open(path)
        .map(|img| img.to_luma8())
        .map_err(|e| GradingError::ImageLoad(format!("{}: {}", path.display(), e)))
}

/// Name recorded for an image: its file stem.
pub fn image_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn write_png(dir: &Path, name: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        GrayImage::from_pixel(8, 6, Luma([200]))
            .save(&path)
            .expect("PNG should be written");
        path
    }

    #[test]
    fn test_load_valid_png() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let path = write_png(dir.path(), "sheet.png");

        let img = load_gray_image(&path, &ImageLimits::default()).expect("PNG should load");
        assert_eq!(img.dimensions(), (8, 6));
    }

    #[test]
    fn test_missing_and_empty_files_fail() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let limits = ImageLimits::default();

        let missing = load_gray_image(&dir.path().join("nope.jpg"), &limits).unwrap_err();
        assert!(matches!(missing, GradingError::ImageLoad(_)));

        let empty = dir.path().join("empty.jpg");
        std::fs::write(&empty, b"").expect("file should be written");
        let err = load_gray_image(&empty, &limits).unwrap_err();
        assert!(err.to_string().contains("empty"));
    }

    #[test]
    fn test_format_specific_limit() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let path = write_png(dir.path(), "big.png");
        let limits = ImageLimits {
            png_max: 10,
            ..Default::default()
        };
        assert!(validate_image_file(&path, &limits).is_err());
        assert!(validate_image_file(&path, &ImageLimits::default()).is_ok());
    }

    #[test]
    fn test_decode_garbage_buffer() {
        let err = decode_gray_image(b"not an image", &ImageLimits::default()).unwrap_err();
        assert!(matches!(err, GradingError::ImageLoad(_)));
    }

    #[test]
    fn test_image_name_is_stem() {
        assert_eq!(image_name(Path::new("/tmp/batch/IMG_0042.JPG")), "IMG_0042");
    }
}
