//! Neighbor-archive discovery within a directory.
//!
//! When manga mode runs off the end of an archive, the next chapter is the
//! file-name successor among the sibling archives. Ordering is the natural
//! sort plus a fallback for scanlation-style names where the chapter number
//! follows a `Ch.` marker, so `... Ch. 10 ...` sorts after `... Ch. 9.5 ...`
//! even when the surrounding text differs.

use std::cmp::Ordering;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use tracing::error;

use super::natsort::natural_cmp;
use super::util::is_archive_file;

fn chapter_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:Vol\.\s*\S+\s+)?Ch\.\s*([0-9]+(?:\.[0-9]+)?)").expect("static regex")
    })
}

fn chapter_number(name: &str) -> Option<f64> {
    let captures = chapter_regex().captures(name)?;
    captures.get(1)?.as_str().parse().ok()
}

/// Orders sibling archive file names.
pub fn archive_name_cmp(a: &str, b: &str) -> Ordering {
    if a == b {
        return Ordering::Equal;
    }

    if let (Some(ca), Some(cb)) = (chapter_number(a), chapter_number(b)) {
        match ca.partial_cmp(&cb) {
            Some(Ordering::Equal) | None => {}
            Some(other) => return other,
        }
    }

    natural_cmp(a, b)
}

/// Finds the file-name predecessor and successor of `file` among the archive
/// files in `dir`. Either side is `None` when no such sibling exists.
pub fn find_neighbors_in_dir(file: &str, dir: &Path) -> (Option<String>, Option<String>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            error!("error listing files in directory {}: {err}", dir.display());
            return (None, None);
        }
    };

    let mut before: Option<String> = None;
    let mut after: Option<String> = None;

    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.is_dir() || !is_archive_file(&path) {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name == file {
            continue;
        }

        if archive_name_cmp(name, file) == Ordering::Less {
            if before.as_deref().is_none_or(|b| archive_name_cmp(b, name) == Ordering::Less) {
                before = Some(name.to_string());
            }
        } else if after.as_deref().is_none_or(|a| archive_name_cmp(name, a) == Ordering::Less) {
            after = Some(name.to_string());
        }
    }

    (before, after)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chapter_numbers_beat_textual_ordering() {
        assert_eq!(
            archive_name_cmp("Ch. 9.5 - group-a.zip", "Ch. 10 - group-b.zip"),
            Ordering::Less
        );
        assert_eq!(archive_name_cmp("Vol. 2 Ch. 12.zip", "Vol. 2 Ch. 12.5.zip"), Ordering::Less);
    }

    #[test]
    fn falls_back_to_natural_order() {
        assert_eq!(archive_name_cmp("chapter2.zip", "chapter10.zip"), Ordering::Less);
    }

    #[test]
    fn finds_adjacent_archives() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["Ch. 9.5.zip", "Ch. 10.zip", "Ch. 10.5.zip", "notes.txt"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }

        let (before, after) = find_neighbors_in_dir("Ch. 10.zip", dir.path());
        assert_eq!(before.as_deref(), Some("Ch. 9.5.zip"));
        assert_eq!(after.as_deref(), Some("Ch. 10.5.zip"));

        let (before, after) = find_neighbors_in_dir("Ch. 9.5.zip", dir.path());
        assert_eq!(before, None);
        assert_eq!(after.as_deref(), Some("Ch. 10.zip"));
    }
}
