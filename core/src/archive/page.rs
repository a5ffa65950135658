//! A single displayable page: extraction state plus its image variants.

use std::fmt;
use std::path::{Path, PathBuf};

use tracing::{debug, error};

use crate::events::{self, FireOnDrop, OutcomeWaiter, Waiter};
use crate::pipeline::{LoadPool, LoadState, LoadableImage};
use crate::types::ImageDimensions;

/// Pipeline position of the page's on-disk artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PageState {
    Extracting,
    /// Extraction finished (success or failure).
    Extracted,
    Upscaling,
    /// Upscaling finished (success or failure).
    Upscaled,
}

pub struct Page {
    /// Shown to the user: the in-archive path minus any common prefix.
    name: String,
    in_archive_path: String,
    number: usize,
    /// The extracted file. Equals the real file for directory entries.
    file: PathBuf,
    /// True iff the extractor wrote this file into the temp directory.
    deletable: bool,
    state: PageState,
    extract: OutcomeWaiter,
    normal: LoadableImage,
    upscale: LoadableImage,
    upscale_outcome: OutcomeWaiter,
    /// Set once any previous upscale teardown has finished; consulted
    /// before a new upscale may start on this page.
    prev_upscale: Waiter,
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[p:{} {:?}]", self.name, self.state)
    }
}

impl Page {
    /// A page backed by an archive entry, extracted to `<tmp>/<n><ext>`.
    /// Returns the resolver the extractor must complete exactly once.
    pub(crate) fn new_archive_page(
        in_archive_path: String,
        name: String,
        number: usize,
        tmp_dir: &Path,
    ) -> (Page, events::Outcome) {
        let ext = Path::new(&in_archive_path)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{e}"))
            .unwrap_or_default();
        let file = tmp_dir.join(format!("{number}{ext}"));

        let (resolver, extract) = events::outcome();
        let page = Page {
            name,
            in_archive_path,
            number,
            file: file.clone(),
            deletable: true,
            state: PageState::Extracting,
            extract,
            normal: LoadableImage::new_unwritten(file),
            upscale: LoadableImage::new_upscale_output(upscale_path(tmp_dir, number)),
            upscale_outcome: OutcomeWaiter::resolved(false),
            prev_upscale: Waiter::fired(),
        };
        (page, resolver)
    }

    /// A page backed by an existing file on disk; starts extracted.
    pub(crate) fn new_existing_page(
        file: PathBuf,
        name: String,
        number: usize,
        tmp_dir: &Path,
    ) -> Page {
        Page {
            in_archive_path: name.clone(),
            name,
            number,
            file: file.clone(),
            deletable: false,
            state: PageState::Extracted,
            extract: OutcomeWaiter::resolved(true),
            normal: LoadableImage::new_existing(file),
            upscale: LoadableImage::new_upscale_output(upscale_path(tmp_dir, number)),
            upscale_outcome: OutcomeWaiter::resolved(false),
            prev_upscale: Waiter::fired(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn in_archive_path(&self) -> &str {
        &self.in_archive_path
    }

    pub fn number(&self) -> usize {
        self.number
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    pub fn state(&self) -> PageState {
        self.state
    }

    /// True iff the extractor wrote this page's file into the temp dir.
    pub fn deletable(&self) -> bool {
        self.deletable
    }

    /// The extracted file, but only once it actually exists.
    pub fn extracted_file(&self) -> Option<&Path> {
        (self.state >= PageState::Extracted && self.normal.state() != LoadState::Failed)
            .then(|| self.file.as_path())
    }

    pub fn extract_watcher(&self) -> OutcomeWaiter {
        self.extract.clone()
    }

    pub fn upscale_watcher(&self) -> OutcomeWaiter {
        self.upscale_outcome.clone()
    }

    /// The variant displayed in the given mode. The upscaled variant is
    /// returned even before it is produced; its state says the rest.
    pub fn variant(&self, upscaling: bool) -> &LoadableImage {
        if upscaling { &self.upscale } else { &self.normal }
    }

    pub fn variant_mut(&mut self, upscaling: bool) -> &mut LoadableImage {
        if upscaling { &mut self.upscale } else { &mut self.normal }
    }

    /// Whether this page can (eventually) load in the given mode, and
    /// whether doing so still requires an upscale.
    pub fn can_load(&self, upscaling: bool) -> (bool, bool) {
        if self.state == PageState::Extracting {
            return (true, upscaling);
        }
        let li = self.variant(upscaling);
        if upscaling && self.state < PageState::Upscaled {
            return (li.can_load(), true);
        }
        (li.can_load(), false)
    }

    /// True when an upscale could be started, though possibly not yet.
    pub fn can_upscale(&self) -> bool {
        self.state <= PageState::Extracted && self.upscale.state() == LoadState::Unwritten
    }

    /// True when an upscale can be dispatched right now.
    pub fn ready_to_upscale(&self) -> bool {
        self.state == PageState::Extracted
            && self.normal.state() != LoadState::Failed
            && self.upscale.state() == LoadState::Unwritten
            && self.prev_upscale.is_set()
    }

    /// Finalizes extraction. On failure both variants are dead ends.
    pub fn mark_extracted(&mut self, success: bool) {
        if success {
            self.state = PageState::Extracted;
            self.normal.mark_written();
        } else {
            self.state = PageState::Upscaled;
            self.normal.mark_failed();
            self.upscale.mark_failed();
        }
    }

    /// Builds the job for the external upscaler and returns it together
    /// with the outcome watcher the caller should hand back via
    /// [`Page::mark_upscale_started`] once the job is accepted.
    pub fn prepare_upscale(
        &self,
        target: ImageDimensions,
    ) -> (crate::upscale::UpscaleJob, OutcomeWaiter) {
        let (resolver, waiter) = events::outcome();
        let job = crate::upscale::UpscaleJob {
            input: self.file.clone(),
            output: self.upscale.path().to_path_buf(),
            target,
            resolver,
        };
        (job, waiter)
    }

    /// The upscaler accepted a job for this page.
    pub fn mark_upscale_started(&mut self, outcome: OutcomeWaiter) {
        debug_assert_eq!(self.state, PageState::Extracted);
        self.state = PageState::Upscaling;
        self.upscale_outcome = outcome;
    }

    /// Finalizes upscaling. The normal variant still works after a failure.
    pub fn mark_upscaled(&mut self, success: bool) {
        self.state = PageState::Upscaled;
        if success {
            self.upscale.mark_written();
        } else {
            self.upscale.mark_failed();
        }
        debug!("finished upscaling {self:?}");
    }

    /// Discards decoded data for both variants without cancelling workers.
    pub fn unload(&mut self) {
        self.normal.unload();
        self.upscale.unload();
    }

    pub fn invalidate_downscaled(&mut self, size: ImageDimensions) {
        self.normal.invalidate_downscaled(size);
        self.upscale.invalidate_downscaled(size);
    }

    pub fn maybe_rescale(&mut self, pool: &LoadPool, size: ImageDimensions) {
        self.normal.maybe_rescale(pool, size);
        self.upscale.maybe_rescale(pool, size);
    }

    /// Tears down any upscaled output. A pending upscale is awaited by a
    /// detached task which deletes the file once the job resolves; a
    /// finished one is deleted directly. `prev_upscale` fires when the
    /// teardown is complete.
    pub fn clear_upscale(&mut self) {
        match self.state {
            PageState::Extracting | PageState::Extracted => return,
            PageState::Upscaling => {
                let mut pending =
                    std::mem::replace(&mut self.upscale_outcome, OutcomeWaiter::resolved(false));
                let (trigger, waiter) = events::flag();
                self.prev_upscale = waiter;
                let output = self.upscale.path().to_path_buf();

                tokio::spawn(async move {
                    let _done = FireOnDrop(trigger);
                    if pending.wait().await {
                        remove_output(&output);
                    }
                });
                self.upscale.reset_unwritten();
            }
            PageState::Upscaled => {
                let (trigger, waiter) = events::flag();
                self.prev_upscale = waiter;
                let upscale_failed = self.upscale.state() == LoadState::Failed;
                let output = self.upscale.path().to_path_buf();

                tokio::spawn(async move {
                    let _done = FireOnDrop(trigger);
                    remove_output(&output);
                });

                if self.normal.state() == LoadState::Failed {
                    // Extraction failed; the page stays a dead end.
                    return;
                }
                if !upscale_failed {
                    self.upscale.reset_unwritten();
                }
            }
        }
        if self.normal.state() != LoadState::Failed {
            self.state = PageState::Extracted;
        }
    }

    /// Waits until nothing touches this page's files any more and removes
    /// the upscaled output. The extracted file, if we wrote it, is released
    /// with the archive's temp directory.
    pub async fn cleanup(&mut self) {
        let mut extract = self.extract.clone();
        extract.wait().await;

        self.unload();
        self.normal.join().await;
        self.upscale.join().await;

        self.clear_upscale();
        let mut prev = self.prev_upscale.clone();
        prev.wait().await;
    }
}

fn upscale_path(tmp_dir: &Path, number: usize) -> PathBuf {
    // png is lossless and cheap for upscalers to write.
    tmp_dir.join(format!("up{number}.png"))
}

fn remove_output(path: &Path) {
    if let Err(err) = std::fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            error!("error removing upscaled output {}: {err}", path.display());
        }
    }
}
