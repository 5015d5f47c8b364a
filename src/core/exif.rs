//! Creation-time stamping for pulled media.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use little_exif::exif_tag::ExifTag;
use little_exif::metadata::Metadata;

use super::paths;

/// Containers the EXIF writer can update in place.
const STAMPABLE: &[&str] = &[".jpg", ".jpeg", ".png", ".tif", ".tiff", ".webp"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StampOutcome {
    Stamped,
    AlreadyPresent,
    Unsupported,
}

pub fn is_stampable(path: &Path) -> bool {
    path.to_str()
        .and_then(paths::extension)
        .is_some_and(|ext| STAMPABLE.contains(&ext.as_str()))
}

/// EXIF date-time text (`YYYY:MM:DD HH:MM:SS`, local time) for a Unix timestamp.
pub fn exif_datetime(unix_secs: i64) -> Option<String> {
    let utc = DateTime::from_timestamp(unix_secs, 0)?;
    Some(
        utc.with_timezone(&Local)
            .format("%Y:%m:%d %H:%M:%S")
            .to_string(),
    )
}

/// The reader reports a file without any EXIF block as an error. Only that
/// case starts from empty metadata; an unreadable block is never replaced.
fn is_missing_exif(err: &std::io::Error) -> bool {
    err.to_string().starts_with("No EXIF")
}

fn has_creation_time(metadata: &Metadata) -> bool {
    metadata
        .get_tag(&ExifTag::DateTimeOriginal(String::new()))
        .next()
        .is_some()
        || metadata
            .get_tag(&ExifTag::CreateDate(String::new()))
            .next()
            .is_some()
}

/// Write `DateTimeOriginal` and `CreateDate` from the device mtime when the
/// file has no creation timestamp yet. Existing timestamps are left alone.
///
/// Blocking; call from `spawn_blocking`.
pub fn stamp_creation_time(path: &Path, unix_secs: i64) -> Result<StampOutcome> {
    if !is_stampable(path) {
        return Ok(StampOutcome::Unsupported);
    }

    let mut metadata = match Metadata::new_from_path(path) {
        Ok(metadata) => metadata,
        Err(e) if is_missing_exif(&e) => Metadata::new(),
        Err(e) => {
            return Err(e).with_context(|| format!("reading EXIF from {}", path.display()));
        }
    };

    if has_creation_time(&metadata) {
        return Ok(StampOutcome::AlreadyPresent);
    }

    let stamp = exif_datetime(unix_secs)
        .with_context(|| format!("timestamp {unix_secs} out of range"))?;
    metadata.set_tag(ExifTag::DateTimeOriginal(stamp.clone()));
    metadata.set_tag(ExifTag::CreateDate(stamp));
    metadata
        .write_to_file(path)
        .with_context(|| format!("writing EXIF to {}", path.display()))?;

    Ok(StampOutcome::Stamped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exif_datetime_format() {
        let text = exif_datetime(1_700_000_000).unwrap();
        assert_eq!(text.len(), 19);
        assert_eq!(&text[4..5], ":");
        assert_eq!(&text[7..8], ":");
        assert_eq!(&text[10..11], " ");
        assert!(text.starts_with("2023:11:1"));
    }

    #[test]
    fn test_stampable_extensions() {
        assert!(is_stampable(Path::new("/tmp/a.JPG")));
        assert!(is_stampable(Path::new("/tmp/a.webp")));
        assert!(!is_stampable(Path::new("/tmp/a.mp4")));
        assert!(!is_stampable(Path::new("/tmp/.jpg")));
    }

    #[test]
    fn test_unsupported_type_is_untouched() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("clip.mp4");
        std::fs::write(&path, b"not a picture").unwrap();

        let outcome = stamp_creation_time(&path, 1_700_000_000).unwrap();
        assert_eq!(outcome, StampOutcome::Unsupported);
        assert_eq!(std::fs::read(&path).unwrap(), b"not a picture");
    }

    /// Smallest segment layout the EXIF reader accepts: SOI, DQT, SOF0, SOS,
    /// a few scan bytes and EOI. No APP1 segment.
    fn bare_jpeg() -> Vec<u8> {
        let mut bytes = vec![0xFF, 0xD8];
        bytes.extend([0xFF, 0xDB, 0x00, 0x43, 0x00]);
        bytes.extend([0x01; 64]);
        bytes.extend([
            0xFF, 0xC0, 0x00, 0x0B, 0x08, 0x00, 0x01, 0x00, 0x01, 0x01, 0x01, 0x11, 0x00,
        ]);
        bytes.extend([0xFF, 0xDA, 0x00, 0x08, 0x01, 0x01, 0x00, 0x00, 0x3F, 0x00]);
        bytes.extend([0xD2, 0xCF, 0x20]);
        bytes.extend([0xFF, 0xD9]);
        bytes
    }

    fn date_time_original(path: &Path) -> Option<String> {
        let metadata = Metadata::new_from_path(path).ok()?;
        match metadata
            .get_tag(&ExifTag::DateTimeOriginal(String::new()))
            .next()?
        {
            ExifTag::DateTimeOriginal(value) => Some(value.trim_end_matches('\0').to_string()),
            _ => None,
        }
    }

    #[test]
    fn test_jpeg_without_exif_gets_stamped() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("a.jpg");
        std::fs::write(&path, bare_jpeg()).unwrap();

        let outcome = stamp_creation_time(&path, 1_600_000_000).unwrap();

        assert_eq!(outcome, StampOutcome::Stamped);
        assert_eq!(date_time_original(&path), exif_datetime(1_600_000_000));
    }

    #[test]
    fn test_existing_creation_time_is_kept() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("b.jpg");
        std::fs::write(&path, bare_jpeg()).unwrap();
        stamp_creation_time(&path, 1_600_000_000).unwrap();
        let stamped = std::fs::read(&path).unwrap();

        let outcome = stamp_creation_time(&path, 1_700_000_000).unwrap();

        assert_eq!(outcome, StampOutcome::AlreadyPresent);
        assert_eq!(date_time_original(&path), exif_datetime(1_600_000_000));
        assert_eq!(std::fs::read(&path).unwrap(), stamped);
    }

    #[test]
    fn test_garbage_jpeg_is_an_error() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("c.jpg");
        std::fs::write(&path, b"not a picture").unwrap();

        assert!(stamp_creation_time(&path, 1_600_000_000).is_err());
        assert_eq!(std::fs::read(&path).unwrap(), b"not a picture");
    }
}
