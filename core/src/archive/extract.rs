//! Container walkers: entry discovery and background extraction.
//!
//! Every extractor honours the same contract: each wanted entry's outcome
//! resolves exactly once (`true` only after its file is fully written), a
//! torn-down archive resolves the remainder as failed, and the walk stops
//! promptly on shutdown or archive close. The streaming formats (7z, rar)
//! read entries in archive order and fan file writes out to a small worker
//! pool so decompression is never blocked on disk.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use tracing::{debug, error, warn};
use zip::ZipArchive;

use crate::events::{self, Outcome, Waiter};
use crate::fs::is_supported_image;
use crate::types::ArchiveKind;

use super::Result;

/// Concurrent writers for the streaming extractors.
const EXTRACTION_WRITERS: usize = 4;

/// One entry the extractor must produce.
#[derive(Debug)]
pub(crate) struct ExtractTask {
    /// Sanitized in-archive path; the map key shared with discovery.
    pub path: String,
    pub dest: PathBuf,
    pub resolver: Outcome,
}

/// Normalises an in-archive name into a task key shared by discovery and
/// extraction. Containers store paths with either separator depending on
/// the packer, so both are split; traversal components bail out entirely,
/// and only displayable, non-hidden images get a key.
pub(crate) fn entry_key(raw: &str) -> Option<String> {
    let mut parts: Vec<&str> = Vec::new();
    for part in raw.split(['/', '\\']) {
        match part {
            "" | "." => continue,
            ".." => return None,
            _ => parts.push(part),
        }
    }

    // Windows packers sometimes record absolute paths; a drive component
    // never belongs inside an archive.
    let first = parts.first()?;
    if first.len() == 2 && first.ends_with(':') {
        return None;
    }

    let name = parts.last().expect("parts is non-empty");
    if name.starts_with('.') || !is_supported_image(Path::new(name)) {
        return None;
    }
    Some(parts.join("/"))
}

fn stop_requested(closed: &Waiter) -> bool {
    events::is_shutting_down() || closed.is_set()
}

/// Runs the whole extraction for one archive. Blocking; the archive spawns
/// this on the blocking pool. When `priority` names an entry, a first walk
/// extracts only that page before the full walk handles the remainder.
pub(crate) fn run_extractor(
    kind: ArchiveKind,
    archive_path: PathBuf,
    tasks: Vec<ExtractTask>,
    priority: Option<String>,
    closed: Waiter,
) {
    let mut map: HashMap<String, ExtractTask> =
        tasks.into_iter().map(|task| (task.path.clone(), task)).collect();

    if let Some(first) = priority.filter(|first| map.contains_key(first)) {
        if let Err(err) = extract_pass(kind, &archive_path, &mut map, Some(&first), &closed) {
            error!("error extracting {first} from {}: {err:#}", archive_path.display());
        }
    }

    if !map.is_empty() && !stop_requested(&closed) {
        if let Err(err) = extract_pass(kind, &archive_path, &mut map, None, &closed) {
            error!("error extracting {}: {err:#}", archive_path.display());
        }
    }

    // Anything left was never written: early close or entries that vanished.
    for (_, task) in map.drain() {
        task.resolver.resolve(false);
    }
    debug!("extractor for {} drained", archive_path.display());
}

fn extract_pass(
    kind: ArchiveKind,
    archive_path: &Path,
    map: &mut HashMap<String, ExtractTask>,
    target: Option<&str>,
    closed: &Waiter,
) -> Result<()> {
    match kind {
        ArchiveKind::Zip => extract_zip(archive_path, map, target, closed),
        ArchiveKind::SevenZip => extract_sevenzip(archive_path, map, target, closed),
        ArchiveKind::Rar => extract_rar(archive_path, map, target, closed),
        ArchiveKind::Directory | ArchiveKind::Fileset | ArchiveKind::Unknown => Ok(()),
    }
}

/// Writes one entry, resolving its outcome only after the file is closed.
fn write_task(task: ExtractTask, data: &[u8]) {
    let success = match std::fs::write(&task.dest, data) {
        Ok(()) => true,
        Err(err) => {
            error!("error writing {}: {err}", task.dest.display());
            false
        }
    };
    task.resolver.resolve(success);
}

fn copy_task(task: ExtractTask, reader: &mut impl Read) {
    let success = (|| -> std::io::Result<()> {
        let mut out = File::create(&task.dest)?;
        std::io::copy(reader, &mut out)?;
        out.sync_all()
    })()
    .map_err(|err| error!("error writing {}: {err}", task.dest.display()))
    .is_ok();
    task.resolver.resolve(success);
}

fn extract_zip(
    archive_path: &Path,
    map: &mut HashMap<String, ExtractTask>,
    target: Option<&str>,
    closed: &Waiter,
) -> Result<()> {
    let file = File::open(archive_path)
        .with_context(|| format!("opening archive {}", archive_path.display()))?;
    let mut zip = ZipArchive::new(file).map_err(|err| anyhow!("{err}"))?;

    for index in 0..zip.len() {
        if stop_requested(closed) {
            return Ok(());
        }

        let mut entry = zip.by_index(index).map_err(|err| anyhow!("{err}"))?;
        if entry.is_dir() {
            continue;
        }
        let Some(key) = entry_key(entry.name()) else {
            continue;
        };
        if target.is_some_and(|t| t != key) {
            continue;
        }
        let Some(task) = map.remove(&key) else {
            continue;
        };

        copy_task(task, &mut entry);
        if target.is_some() {
            return Ok(());
        }
    }
    Ok(())
}

/// A channel-backed semaphore plus the writer threads it gates.
struct WriterPool {
    slot_tx: flume::Sender<()>,
    slot_rx: flume::Receiver<()>,
    writers: Vec<std::thread::JoinHandle<()>>,
}

impl WriterPool {
    fn new() -> Self {
        let (slot_tx, slot_rx) = flume::bounded(EXTRACTION_WRITERS);
        Self { slot_tx, slot_rx, writers: Vec::new() }
    }

    /// Blocks while all writer slots are busy.
    fn spawn_write(&mut self, task: ExtractTask, data: Vec<u8>) {
        let _ = self.slot_tx.send(());
        let release = self.slot_rx.clone();
        self.writers.push(std::thread::spawn(move || {
            write_task(task, &data);
            let _ = release.recv();
        }));
    }

    fn join(self) {
        for writer in self.writers {
            let _ = writer.join();
        }
    }
}

fn extract_sevenzip(
    archive_path: &Path,
    map: &mut HashMap<String, ExtractTask>,
    target: Option<&str>,
    closed: &Waiter,
) -> Result<()> {
    let mut reader = sevenz_rust::SevenZReader::open(archive_path, sevenz_rust::Password::empty())
        .map_err(|err| anyhow!("opening 7z archive {}: {err}", archive_path.display()))?;

    let mut pool = WriterPool::new();
    let result = reader.for_each_entries(&mut |entry: &sevenz_rust::SevenZArchiveEntry, entry_reader: &mut dyn std::io::Read| {
        if stop_requested(closed) {
            return Ok(false);
        }
        if entry.is_directory() {
            return Ok(true);
        }
        let Some(key) = entry_key(entry.name()) else {
            return Ok(true);
        };
        if target.is_some_and(|t| t != key) || !map.contains_key(&key) {
            return Ok(true);
        }

        let mut data = Vec::with_capacity(entry.size() as usize);
        entry_reader
            .read_to_end(&mut data)
            .map_err(|err| sevenz_rust::Error::other(err.to_string()))?;

        let task = map.remove(&key).expect("checked above");
        pool.spawn_write(task, data);

        // A targeted pass stops as soon as its page is handed off.
        Ok(target.is_none())
    });

    pool.join();
    result.map_err(|err| anyhow!("extracting 7z archive {}: {err}", archive_path.display()))?;
    Ok(())
}

fn extract_rar(
    archive_path: &Path,
    map: &mut HashMap<String, ExtractTask>,
    target: Option<&str>,
    closed: &Waiter,
) -> Result<()> {
    let mut cursor = match unrar::Archive::new(archive_path).open_for_processing() {
        Ok(cursor) => cursor,
        Err(err) => {
            warn!(
                "native rar decoder failed on {} ({err}); falling back to the unrar binary",
                archive_path.display()
            );
            return extract_rar_external(archive_path, map, target, closed);
        }
    };

    let mut pool = WriterPool::new();
    loop {
        if stop_requested(closed) {
            break;
        }
        let header = match cursor.read_header() {
            Ok(Some(header)) => header,
            Ok(None) => break,
            Err(err) => {
                error!("error reading rar header in {}: {err}", archive_path.display());
                break;
            }
        };

        let key = entry_key(&header.entry().filename.to_string_lossy());
        let wanted = key
            .as_deref()
            .is_some_and(|k| target.is_none_or(|t| t == k) && map.contains_key(k));

        if !wanted {
            cursor = match header.skip() {
                Ok(next) => next,
                Err(err) => {
                    error!("error skipping rar entry in {}: {err}", archive_path.display());
                    break;
                }
            };
            continue;
        }

        let task = map.remove(key.as_deref().expect("wanted implies key")).expect("wanted");
        match header.read() {
            Ok((data, next)) => {
                pool.spawn_write(task, data);
                cursor = next;
            }
            Err(err) => {
                error!("error extracting rar entry in {}: {err}", archive_path.display());
                task.resolver.resolve(false);
                break;
            }
        }

        if target.is_some() {
            break;
        }
    }

    pool.join();
    Ok(())
}

/// Last resort for archives the native decoder rejects: stream each wanted
/// entry out of the external `unrar` binary.
fn extract_rar_external(
    archive_path: &Path,
    map: &mut HashMap<String, ExtractTask>,
    target: Option<&str>,
    closed: &Waiter,
) -> Result<()> {
    let keys: Vec<String> = match target {
        Some(t) => map.contains_key(t).then(|| vec![t.to_string()]).unwrap_or_default(),
        None => map.keys().cloned().collect(),
    };

    for key in keys {
        if stop_requested(closed) {
            return Ok(());
        }
        let task = map.remove(&key).expect("key taken from map");
        let output = std::process::Command::new("unrar")
            .arg("p")
            .arg("-inul")
            .arg(archive_path)
            .arg(&key)
            .output();

        match output {
            Ok(out) if out.status.success() && !out.stdout.is_empty() => {
                write_task(task, &out.stdout);
            }
            Ok(out) => {
                error!(
                    "unrar binary failed for {key} in {}: {}",
                    archive_path.display(),
                    String::from_utf8_lossy(&out.stderr).trim()
                );
                task.resolver.resolve(false);
            }
            Err(err) => {
                error!("could not run unrar binary: {err}");
                task.resolver.resolve(false);
            }
        }
    }
    Ok(())
}

/// Lists the displayable entries of a zip container.
pub(crate) fn list_zip(archive_path: &Path) -> Result<Vec<String>> {
    let file = File::open(archive_path)
        .with_context(|| format!("opening archive {}", archive_path.display()))?;
    let mut zip = ZipArchive::new(file).map_err(|err| anyhow!("{err}"))?;

    let mut entries = Vec::new();
    for index in 0..zip.len() {
        let entry = zip.by_index(index).map_err(|err| anyhow!("{err}"))?;
        if entry.is_dir() {
            continue;
        }
        if let Some(key) = entry_key(entry.name()) {
            entries.push(key);
        }
    }
    Ok(entries)
}

/// Lists the displayable entries of a 7z container.
pub(crate) fn list_sevenzip(archive_path: &Path) -> Result<Vec<String>> {
    let reader = sevenz_rust::SevenZReader::open(archive_path, sevenz_rust::Password::empty())
        .map_err(|err| anyhow!("opening 7z archive {}: {err}", archive_path.display()))?;

    Ok(reader
        .archive()
        .files
        .iter()
        .filter(|entry| !entry.is_directory())
        .filter_map(|entry| entry_key(entry.name()))
        .collect())
}

/// Lists the displayable entries of a rar container, falling back to the
/// external binary when the native decoder cannot open it.
pub(crate) fn list_rar(archive_path: &Path) -> Result<Vec<String>> {
    match unrar::Archive::new(archive_path).open_for_listing() {
        Ok(listing) => Ok(listing
            .filter_map(|entry| entry.ok())
            .filter(|header| !header.is_directory())
            .filter_map(|header| entry_key(&header.filename.to_string_lossy()))
            .collect()),
        Err(err) => {
            warn!(
                "native rar decoder failed on {} ({err}); listing via the unrar binary",
                archive_path.display()
            );
            list_rar_external(archive_path)
        }
    }
}

fn list_rar_external(archive_path: &Path) -> Result<Vec<String>> {
    let output = std::process::Command::new("unrar")
        .arg("lb")
        .arg(archive_path)
        .output()
        .context("running unrar binary")?;
    if !output.status.success() {
        return Err(anyhow!(
            "unrar lb failed for {}: {}",
            archive_path.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }

    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(entry_key)
        .collect())
}
