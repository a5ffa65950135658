//! The archive model: one ordered set of pages backed by a container.
//!
//! Opening is synchronous up to the entry list (create the temp dir, walk
//! the container without extracting, sort, build pages), then a background
//! extractor produces the files. Closing is the reverse: signal `closed`,
//! wait out the extractor, clean up every page, drop the temp dir.

mod extract;
pub mod page;

pub use page::{Page, PageState};

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, bail};
use tempfile::TempDir;
use tracing::{debug, error, warn};

use crate::events::{self, FireOnDrop, Trigger, Waiter};
use crate::fs::{self, NaturalSorter};
use crate::types::ArchiveKind;

use extract::ExtractTask;

pub type Result<T> = crate::Result<T>;

/// Why an archive is being opened; decides which page the extractor should
/// produce first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenTrigger {
    Preloading,
    /// The UI is blocked on the first page.
    WaitingOnFirst,
    /// The UI is blocked on the last page (backwards navigation).
    WaitingOnLast,
}

static NEXT_ARCHIVE_ID: AtomicU64 = AtomicU64::new(1);

pub struct Archive {
    id: u64,
    name: String,
    kind: ArchiveKind,
    path: PathBuf,
    temp_dir: Option<TempDir>,
    pages: Vec<Page>,
    closed: Trigger,
    extracting_done: Waiter,
}

impl fmt::Debug for Archive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[a:{} {} {} pages, extracted: {}]",
            self.name,
            self.kind,
            self.pages.len(),
            self.extracting_done.is_set()
        )
    }
}

impl Archive {
    /// Stable identity that survives index shifts in the manager's list.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ArchiveKind {
        self.kind
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn page(&self, index: usize) -> Option<&Page> {
        self.pages.get(index)
    }

    pub fn page_mut(&mut self, index: usize) -> Option<&mut Page> {
        self.pages.get_mut(index)
    }

    pub fn pages_mut(&mut self) -> impl Iterator<Item = &mut Page> {
        self.pages.iter_mut()
    }

    /// Whether manga mode may expand past this archive to directory
    /// siblings. Directories and filesets never expand.
    pub fn expandable(&self) -> bool {
        self.kind.is_container()
    }

    /// Signals close and returns a handle on the detached teardown: wait
    /// for the extractor, clean up every page, remove the temp directory.
    pub fn close(mut self) -> tokio::task::JoinHandle<()> {
        self.closed.fire();
        let mut extracting_done = self.extracting_done.clone();
        let temp_dir = self.temp_dir.take();
        let mut pages = std::mem::take(&mut self.pages);
        let name = std::mem::take(&mut self.name);

        tokio::spawn(async move {
            extracting_done.wait().await;
            for page in &mut pages {
                page.cleanup().await;
            }
            if let Some(temp_dir) = temp_dir {
                if let Err(err) = temp_dir.close() {
                    error!("error removing temp dir for {name}: {err}");
                }
            }
            debug!("finished closing {name}");
        })
    }
}

/// Opens a single path: archive file, directory, or image file (promoted to
/// a directory open rooted at its parent). Returns the archive and the
/// index of the page to display first.
pub fn open_archive(file: &Path, temp_root: &Path, trigger: OpenTrigger) -> Result<(Archive, usize)> {
    let meta = std::fs::metadata(file)
        .with_context(|| format!("{} is not a valid file or directory", file.display()))?;

    if meta.is_dir() {
        return open_directory(file, None, temp_root, trigger);
    }
    if fs::is_supported_image(file) {
        let parent = file.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
        return open_directory(parent, Some(file), temp_root, trigger);
    }

    open_container(file, temp_root, trigger)
}

fn open_container(file: &Path, temp_root: &Path, trigger: OpenTrigger) -> Result<(Archive, usize)> {
    let mut kind = fs::detect_kind(file);

    let entries = match kind {
        ArchiveKind::Zip => match extract::list_zip(file) {
            Ok(entries) => entries,
            // cbz is occasionally 7z under a zip name.
            Err(err) => match extract::list_sevenzip(file) {
                Ok(entries) => {
                    kind = ArchiveKind::SevenZip;
                    entries
                }
                Err(_) => return Err(err),
            },
        },
        ArchiveKind::SevenZip => extract::list_sevenzip(file)?,
        ArchiveKind::Rar => extract::list_rar(file)?,
        _ => bail!("{} is not a supported archive, directory, or image", file.display()),
    };

    let mut sorter = NaturalSorter::new();
    let mut entries = dedupe(entries);
    entries.sort_by(|a, b| sorter.compare(a, b));
    let names = trim_common_prefix(&entries);

    let temp_dir = chapter_temp_dir(temp_root, file)?;
    if entries.is_empty() {
        warn!("could not find any images in archive {}", file.display());
    }

    let mut pages = Vec::with_capacity(entries.len());
    let mut tasks = Vec::with_capacity(entries.len());
    for (number, (entry, name)) in entries.into_iter().zip(names).enumerate() {
        let (page, resolver) = Page::new_archive_page(entry, name, number, temp_dir.path());
        tasks.push(ExtractTask {
            path: page.in_archive_path().to_string(),
            dest: page.file().to_path_buf(),
            resolver,
        });
        pages.push(page);
    }

    let initial_page = match trigger {
        OpenTrigger::Preloading | OpenTrigger::WaitingOnFirst => 0,
        OpenTrigger::WaitingOnLast => pages.len().saturating_sub(1),
    };
    let priority = match trigger {
        OpenTrigger::Preloading => None,
        OpenTrigger::WaitingOnFirst | OpenTrigger::WaitingOnLast => {
            pages.get(initial_page).map(|p| p.in_archive_path().to_string())
        }
    };

    let (closed, closed_waiter) = events::flag();
    let (done, extracting_done) = events::flag();

    let extractor_path = file.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let _fire = FireOnDrop(done);
        extract::run_extractor(kind, extractor_path, tasks, priority, closed_waiter);
    });

    let archive = Archive {
        id: NEXT_ARCHIVE_ID.fetch_add(1, Ordering::Relaxed),
        name: display_name(file),
        kind,
        path: file.to_path_buf(),
        temp_dir: Some(temp_dir),
        pages,
        closed,
        extracting_done,
    };
    debug!("scanned {archive:?}");
    Ok((archive, initial_page))
}

fn open_directory(
    dir: &Path,
    opened_file: Option<&Path>,
    temp_root: &Path,
    trigger: OpenTrigger,
) -> Result<(Archive, usize)> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .with_context(|| format!("listing directory {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| !name.starts_with('.') && fs::is_supported_image(Path::new(name)))
        .collect();

    let mut sorter = NaturalSorter::new();
    names.sort_by(|a, b| sorter.compare(a, b));
    if names.is_empty() {
        warn!("could not find any images in directory {}", dir.display());
    }

    let temp_dir = chapter_temp_dir(temp_root, dir)?;
    let pages: Vec<Page> = names
        .iter()
        .enumerate()
        .map(|(number, name)| {
            Page::new_existing_page(dir.join(name), name.clone(), number, temp_dir.path())
        })
        .collect();

    let mut initial_page = match trigger {
        OpenTrigger::WaitingOnLast => pages.len().saturating_sub(1),
        _ => 0,
    };
    if let Some(opened) = opened_file {
        let opened_name = opened.file_name().map(|n| n.to_string_lossy().into_owned());
        if let Some(position) =
            opened_name.and_then(|name| names.iter().position(|n| *n == name))
        {
            initial_page = position;
        }
    }

    let (closed, _) = events::flag();
    let archive = Archive {
        id: NEXT_ARCHIVE_ID.fetch_add(1, Ordering::Relaxed),
        name: display_name(dir),
        kind: ArchiveKind::Directory,
        path: dir.to_path_buf(),
        temp_dir: Some(temp_dir),
        pages,
        closed,
        // Directory entries need no extraction.
        extracting_done: Waiter::fired(),
    };
    Ok((archive, initial_page))
}

/// Opens an explicit list of image files as one pseudo-archive.
pub fn open_fileset(files: &[PathBuf], temp_root: &Path) -> Result<(Archive, usize)> {
    let mut entries: Vec<PathBuf> = Vec::new();
    for file in files {
        if !file.is_file() {
            bail!("{} is not a valid file", file.display());
        }
        if !fs::is_supported_image(file) {
            warn!("skipping unsupported file {}", file.display());
            continue;
        }
        entries.push(file.clone());
    }
    if entries.is_empty() {
        bail!("no supported images among the given files");
    }

    let full: Vec<String> = entries.iter().map(|p| p.to_string_lossy().into_owned()).collect();
    let names = trim_common_prefix(&full);

    let temp_dir = chapter_temp_dir(temp_root, &entries[0])?;
    let pages: Vec<Page> = entries
        .iter()
        .zip(names)
        .enumerate()
        .map(|(number, (file, name))| {
            Page::new_existing_page(file.clone(), name, number, temp_dir.path())
        })
        .collect();

    let parent = entries[0].parent().unwrap_or(Path::new(".")).to_path_buf();
    let (closed, _) = events::flag();
    let archive = Archive {
        id: NEXT_ARCHIVE_ID.fetch_add(1, Ordering::Relaxed),
        name: display_name(&parent),
        kind: ArchiveKind::Fileset,
        path: parent,
        temp_dir: Some(temp_dir),
        pages,
        closed,
        extracting_done: Waiter::fired(),
    };
    Ok((archive, 0))
}

fn chapter_temp_dir(temp_root: &Path, source: &Path) -> Result<TempDir> {
    tempfile::Builder::new()
        .prefix("chapter")
        .tempdir_in(temp_root)
        .with_context(|| format!("creating temp directory for {}", source.display()))
}

fn display_name(path: &Path) -> String {
    path.file_name().unwrap_or(path.as_os_str()).to_string_lossy().into_owned()
}

fn dedupe(entries: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    entries.into_iter().filter(|e| seen.insert(e.clone())).collect()
}

/// Strips the directory prefix shared by every path; `a/b/c.png` displays
/// as `b/c.png` when everything lives under `a/`.
fn trim_common_prefix(paths: &[String]) -> Vec<String> {
    let mut prefix: Option<PathBuf> = None;
    for path in paths {
        let dir = Path::new(path).parent().unwrap_or(Path::new("")).to_path_buf();
        prefix = Some(match prefix {
            None => dir,
            Some(current) => common_components(&current, &dir),
        });
        if prefix.as_ref().is_some_and(|p| p.as_os_str().is_empty()) {
            break;
        }
    }

    let prefix = prefix.unwrap_or_default();
    paths
        .iter()
        .map(|path| {
            Path::new(path)
                .strip_prefix(&prefix)
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_else(|_| path.clone())
        })
        .collect()
}

fn common_components(a: &Path, b: &Path) -> PathBuf {
    a.components()
        .zip(b.components())
        .take_while(|(x, y)| x == y)
        .map(|(x, _)| x.as_os_str())
        .collect()
}

/// Looks up the natural-order successor (or predecessor) archive among the
/// directory siblings of `archive`, returning its full path.
pub fn neighbor_path(archive: &Archive, forwards: bool) -> Option<PathBuf> {
    if !archive.expandable() {
        return None;
    }
    let file = archive.path().file_name()?.to_str()?;
    let dir = archive.path().parent()?;
    let (before, after) = fs::neighbors::find_neighbors_in_dir(file, dir);
    let name = if forwards { after } else { before }?;
    Some(dir.join(name))
}
