use std::ffi::OsStr;
use std::path::Path;

use crate::types::ArchiveKind;

/// Supported image file extensions (lowercase, without the dot).
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp", "gif", "bmp"];

/// Archive extensions recognised when expanding to neighboring chapters.
pub const ARCHIVE_EXTENSIONS: &[&str] = &["zip", "cbz", "rar", "cbr", "7z", "cb7"];

fn extension_lowercase(path: &Path) -> Option<String> {
    path.extension().and_then(OsStr::to_str).map(|ext| ext.to_ascii_lowercase())
}

pub fn is_supported_image(path: &Path) -> bool {
    extension_lowercase(path).map(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str())).unwrap_or(false)
}

pub fn is_archive_file(path: &Path) -> bool {
    extension_lowercase(path)
        .map(|ext| ARCHIVE_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}

/// Classifies a path by extension. Directories and filesets are decided by
/// the caller, which knows whether the path came from a directory walk or
/// the command line.
pub fn detect_kind(path: &Path) -> ArchiveKind {
    match extension_lowercase(path).as_deref() {
        Some("zip") | Some("cbz") => ArchiveKind::Zip,
        Some("rar") | Some("cbr") => ArchiveKind::Rar,
        Some("7z") | Some("cb7") => ArchiveKind::SevenZip,
        _ => ArchiveKind::Unknown,
    }
}
