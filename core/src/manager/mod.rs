//! The coordinator.
//!
//! One task owns every piece of mutable coordination state: the archive
//! list, the cursors, and each page's state machine. Background workers
//! (extractors, decoders, the upscaler) only ever communicate through
//! channels and write-once events, so the manager's view of the pipeline is
//! a single consistent timeline. The loop never holds anything across an
//! await except inside its own top-level select.

mod commands;
mod exec;
pub mod indices;

pub use indices::PageIndices;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use hashlink::LruCache;
use tokio::net::UnixStream;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::archive::{Archive, OpenTrigger, Page, PageState, open_archive, open_fileset};
use crate::config::Config;
use crate::events::{self, OutcomeWaiter};
use crate::pipeline::{LoadPool, LoadWatcher, MaybeScaledImage};
use crate::types::{Executable, ImageDimensions, Modes, State, UserCommand};
use crate::upscale::UpscaleJob;
use crate::Result;

/// Quiet period after the last size event before the slow rescale pass.
const RESIZE_DEBOUNCE: Duration = Duration::from_millis(500);

/// Everything the manager needs to run.
#[derive(Debug)]
pub struct ManagerOptions {
    /// One path opens an archive/image/directory; several open a fileset.
    pub files: Vec<PathBuf>,
    /// Process-wide temp root; each archive makes its own subdirectory.
    pub temp_root: PathBuf,
    pub config: Arc<Config>,
    pub modes: Modes,
    pub commands: flume::Receiver<UserCommand>,
    pub executables: flume::Receiver<Executable>,
    pub sizes: flume::Receiver<ImageDimensions>,
    pub states: flume::Sender<State>,
    pub sockets: flume::Receiver<UnixStream>,
    /// Rendezvous with the upscaler driver; `None` when not configured.
    pub upscale_jobs: Option<flume::Sender<UpscaleJob>>,
}

pub(crate) struct Manager {
    cfg: Arc<Config>,
    temp_root: PathBuf,
    modes: Modes,
    archives: VecDeque<Archive>,
    current: PageIndices,
    /// Next page to load; may still be waiting on extraction or upscaling.
    nl: PageIndices,
    /// Next page to upscale; trails `nl` while upscaling is enabled.
    nu: PageIndices,
    target_size: ImageDimensions,
    state: State,
    last_sent: Option<State>,
    load_pool: LoadPool,
    upscale_jobs: Option<flume::Sender<UpscaleJob>>,
    /// Recency over pages holding an upscaled output, keyed by
    /// `(archive id, page number)`; enforces `maximum_upscaled`.
    upscaled_lru: LruCache<(u64, usize), ()>,
    resize_deadline: Option<Instant>,
    closing: Vec<tokio::task::JoinHandle<()>>,
}

/// Opens the initial archive and runs the selector until shutdown. Archive
/// open failure at startup is fatal and reported to the caller.
pub async fn run(options: ManagerOptions) -> Result<()> {
    let ManagerOptions {
        files,
        temp_root,
        config,
        modes,
        commands,
        executables,
        sizes,
        states,
        sockets,
        upscale_jobs,
    } = options;

    let (first, initial_page) = match &files[..] {
        [file] => open_archive(file, &temp_root, OpenTrigger::WaitingOnFirst)?,
        files => open_fileset(files, &temp_root)?,
    };

    let mut archives = VecDeque::new();
    archives.push_back(first);
    let current = PageIndices::new(0, initial_page);

    let mut upscaling = modes.upscaling;
    if upscaling && (config.upscaling_target.is_none() || upscale_jobs.is_none()) {
        debug!("upscaling requested but not configured; starting without it");
        upscaling = false;
    }

    let mut manager = Manager {
        load_pool: LoadPool::new(config.load_threads),
        cfg: config,
        temp_root,
        modes: Modes { manga: modes.manga, upscaling },
        archives,
        current,
        nl: current,
        nu: current,
        target_size: ImageDimensions::ZERO,
        state: State::default(),
        last_sent: None,
        upscale_jobs,
        upscaled_lru: LruCache::new_unbounded(),
        resize_deadline: None,
        closing: Vec::new(),
    };

    manager.find_next_image_to_load();
    manager.run_loop(commands, executables, sizes, states, sockets).await;
    manager.finish().await;
    Ok(())
}

impl Manager {
    async fn run_loop(
        &mut self,
        commands: flume::Receiver<UserCommand>,
        executables: flume::Receiver<Executable>,
        sizes: flume::Receiver<ImageDimensions>,
        states: flume::Sender<State>,
        sockets: flume::Receiver<UnixStream>,
    ) {
        let mut shutdown = events::shutdown_waiter();
        let mut commands_open = true;
        let mut executables_open = true;
        let mut sizes_open = true;
        let mut sockets_open = true;

        loop {
            self.refresh_state();
            self.assert_current_consistency();

            let state_dirty = self.last_sent.as_ref() != Some(&self.state);

            // Observe the current image while it decodes.
            let load_watch = self.current_load_watcher();

            // What `nl` is stuck on, if anything.
            let (extract_watch, upscale_watch) = self.waits_for_next_load();

            // Try not to start new loads while the UI is blocked on the
            // displayed page or on consuming a snapshot.
            if self.maybe_start_load(load_watch.is_some(), state_dirty) {
                continue;
            }

            let (offer_job, mut offer_waiter) = match self.prepare_upscale_offer() {
                Some((job, waiter)) => (Some(job), Some(waiter)),
                None => (None, None),
            };
            let offering_upscale = offer_job.is_some();
            let offer_tx = self.upscale_jobs.clone();
            let offer_fut = async move {
                match (offer_tx, offer_job) {
                    (Some(tx), Some(job)) => tx.send_async(job).await.is_ok(),
                    _ => false,
                }
            };

            let snapshot = self.state.clone();
            let deadline = self.resize_deadline.unwrap_or_else(Instant::now);
            let has_deadline = self.resize_deadline.is_some();

            tokio::select! {
                biased;
                _ = shutdown.wait() => break,

                sent = states.send_async(snapshot), if state_dirty => {
                    if sent.is_ok() {
                        self.last_sent = Some(self.state.clone());
                        trace!("sent state for page {}", self.state.page_number);
                    } else {
                        // The renderer is gone; nothing left to display for.
                        events::begin_shutdown();
                    }
                }

                msi = watch_load(load_watch.clone()), if load_watch.is_some() => {
                    self.on_current_loaded(msi);
                }

                success = watch_outcome(extract_watch.clone()), if extract_watch.is_some() => {
                    self.on_extracted(success);
                }

                success = watch_outcome(upscale_watch.clone()), if upscale_watch.is_some() => {
                    self.on_upscaled(success);
                }

                sent = offer_fut, if offering_upscale => {
                    if sent {
                        let waiter = offer_waiter.take().expect("offer was prepared");
                        self.on_upscale_started(waiter);
                    }
                }

                command = commands.recv_async(), if commands_open => {
                    match command {
                        Ok(mut command) => loop {
                            self.handle_user_command(command);
                            // Drain queued input so rapid navigation settles
                            // before any expensive work starts.
                            match commands.try_recv() {
                                Ok(next) => command = next,
                                Err(_) => break,
                            }
                        },
                        Err(_) => commands_open = false,
                    }
                }

                size = sizes.recv_async(), if sizes_open => {
                    match size {
                        Ok(size) => self.on_resize(size, &states).await,
                        Err(_) => sizes_open = false,
                    }
                }

                _ = tokio::time::sleep_until(deadline), if has_deadline => {
                    self.on_resize_settled();
                }

                conn = sockets.recv_async(), if sockets_open => {
                    match conn {
                        Ok(conn) => self.handle_conn(conn).await,
                        Err(_) => sockets_open = false,
                    }
                }

                exe = executables.recv_async(), if executables_open => {
                    match exe {
                        Ok(exe) => self.run_executable(exe),
                        Err(_) => executables_open = false,
                    }
                }
            }
        }
    }

    /// Closes every archive and waits for their teardown tasks.
    async fn finish(mut self) {
        while let Some(archive) = self.archives.pop_front() {
            self.closing.push(archive.close());
        }
        for handle in self.closing.drain(..) {
            let _ = handle.await;
        }
        debug!("manager finished");
    }

    // ---- cursor helpers ----------------------------------------------------

    pub(crate) fn add(&self, pi: PageIndices, x: isize) -> (PageIndices, bool) {
        let counts: Vec<usize> = self.archives.iter().map(|a| a.page_count()).collect();
        indices::add_in(&counts, pi, x)
    }

    pub(crate) fn page(&self, pi: PageIndices) -> Option<&Page> {
        let p = usize::try_from(pi.p).ok()?;
        self.archives.get(pi.a)?.page(p)
    }

    pub(crate) fn page_mut(&mut self, pi: PageIndices) -> Option<&mut Page> {
        let p = usize::try_from(pi.p).ok()?;
        self.archives.get_mut(pi.a)?.page_mut(p)
    }

    pub(crate) fn upscaling_available(&self) -> bool {
        self.cfg.upscaling_target.is_some() && self.upscale_jobs.is_some()
    }

    // ---- per-iteration bookkeeping -----------------------------------------

    /// The displayed page must never be left behind: if it is not fully
    /// ready for its mode, it has to be what `nl` points at. Anything else
    /// is a scheduling bug, and dying loudly here beats displaying stale
    /// state forever.
    fn assert_current_consistency(&self) {
        let Some(page) = self.page(self.current) else { return };

        if page.state() == PageState::Extracting && self.current != self.nl {
            panic!(
                "current page {:?} {page:?} is not extracted but next to load is {:?}",
                self.current, self.nl
            );
        }
        if self.modes.upscaling
            && page.state() < PageState::Upscaled
            && self.current != self.nl
        {
            panic!(
                "current page {:?} {page:?} is not upscaled but next to load is {:?}",
                self.current, self.nl
            );
        }
        let li = page.variant(self.modes.upscaling);
        if li.can_load() && self.current != self.nl {
            panic!(
                "current image {:?} {page:?} is not loaded but next to load is {:?}",
                self.current, self.nl
            );
        }
    }

    fn current_load_watcher(&self) -> Option<LoadWatcher> {
        self.page(self.current)?.variant(self.modes.upscaling).load_watcher()
    }

    /// Determines what the next page to load is waiting on, and drags the
    /// upscale cursor along while its page has not started upscaling.
    fn waits_for_next_load(&mut self) -> (Option<OutcomeWaiter>, Option<OutcomeWaiter>) {
        let (extract, upscale, drag_nu) = match self.page(self.nl) {
            Some(page) => (
                (page.state() == PageState::Extracting).then(|| page.extract_watcher()),
                (self.modes.upscaling && page.state() == PageState::Upscaling)
                    .then(|| page.upscale_watcher()),
                self.modes.upscaling && page.can_upscale(),
            ),
            None => return (None, None),
        };

        if drag_nu {
            self.nu = self.nl;
        }
        (extract, upscale)
    }

    /// Starts a load for `nl` when nothing more urgent is pending. The
    /// first paint of the current page goes out at natural size; the
    /// Catmull-Rom fit can take long enough to block the UI noticeably.
    fn maybe_start_load(&mut self, current_loading: bool, state_dirty: bool) -> bool {
        if current_loading && self.current.p == 0 {
            return false;
        }
        if state_dirty {
            return false;
        }
        let blocking_current = self.current == self.nl;
        if self.target_size.is_zero() && !blocking_current {
            // No known window size yet; only the blocking page is worth it.
            return false;
        }

        let upscaling = self.modes.upscaling;
        let nl = self.nl;
        let pool = self.load_pool.clone();
        let size = if blocking_current { ImageDimensions::ZERO } else { self.target_size };

        let Some(page) = self.page_mut(nl) else { return false };
        let li = page.variant_mut(upscaling);
        if !li.ready_to_load() {
            return false;
        }

        li.load(&pool, size);
        self.find_next_image_to_load();
        true
    }

    fn prepare_upscale_offer(&self) -> Option<(UpscaleJob, OutcomeWaiter)> {
        if !self.modes.upscaling {
            return None;
        }
        let target = self.cfg.upscaling_target?;
        self.upscale_jobs.as_ref()?;

        let page = self.page(self.nu)?;
        if !page.ready_to_upscale() {
            return None;
        }
        Some(page.prepare_upscale(target))
    }

    // ---- event handlers ----------------------------------------------------

    fn on_current_loaded(&mut self, msi: MaybeScaledImage) {
        let upscaling = self.modes.upscaling;
        let pool = self.load_pool.clone();
        let target = self.target_size;
        let current = self.current;

        if let Some(page) = self.page_mut(current) {
            let li = page.variant_mut(upscaling);
            li.mark_loaded(msi);
            // The natural-size fast path leaves a proper fit to do.
            li.maybe_rescale(&pool, target);
        }
    }

    fn on_extracted(&mut self, success: bool) {
        let nl = self.nl;
        if let Some(page) = self.page_mut(nl) {
            page.mark_extracted(success);
        }
    }

    fn on_upscaled(&mut self, success: bool) {
        let nl = self.nl;
        let key = self.page_key(nl);
        if let Some(page) = self.page_mut(nl) {
            page.mark_upscaled(success);
        }
        if success {
            if let Some(key) = key {
                self.upscaled_lru.insert(key, ());
                self.enforce_upscaled_budget();
            }
        }
    }

    fn on_upscale_started(&mut self, outcome: OutcomeWaiter) {
        let nu = self.nu;
        if let Some(page) = self.page_mut(nu) {
            page.mark_upscale_started(outcome);
        }
    }

    async fn on_resize(&mut self, size: ImageDimensions, states: &flume::Sender<State>) {
        debug!("target size {size}");
        self.target_size = size;
        self.invalidate_all_downscaled();
        self.nl = self.current;
        self.nu = self.current;

        let upscaling = self.modes.upscaling;
        let pool = self.load_pool.clone();
        let current = self.current;

        // Cheap path for the displayed page: adopt or produce something at
        // natural size right now, then schedule the proper fit.
        let needs_sync = match self.page_mut(current) {
            Some(page) => {
                let li = page.variant_mut(upscaling);
                li.maybe_rescale(&pool, size);
                li.ready_to_load()
            }
            None => false,
        };

        if needs_sync {
            if let Some(page) = self.page_mut(current) {
                page.variant_mut(upscaling).load_sync_unscaled().await;
            }
            self.refresh_state();
            self.emit_state_now(states).await;
            if let Some(page) = self.page_mut(current) {
                page.variant_mut(upscaling).maybe_rescale(&pool, size);
            }
        }

        self.resize_deadline = Some(Instant::now() + RESIZE_DEBOUNCE);
    }

    /// The window stopped changing; redo every cached fit properly.
    fn on_resize_settled(&mut self) {
        self.resize_deadline = None;
        self.invalidate_all_downscaled();
        self.maybe_rescale_all();
        self.reset_work_cursors();
    }

    // ---- state snapshots ---------------------------------------------------

    fn refresh_state(&mut self) {
        self.state = self.build_state();
    }

    fn build_state(&self) -> State {
        let archive = &self.archives[self.current.a];
        let mut state = State {
            archive_name: archive.name().to_string(),
            archive_len: archive.page_count(),
            modes: self.modes,
            ..State::default()
        };

        let Some(page) = self.page(self.current) else {
            // Empty archive; the renderer shows its error placeholder.
            return state;
        };
        state.page_name = page.name().to_string();
        state.page_number = self.current.p as usize + 1;

        let li = page.variant(self.modes.upscaling);
        if let Some(msi) = li.image() {
            state.image = msi.image.clone();
            state.original_bounds = msi.original;
        } else {
            let (can_load, needs_upscale) = page.can_load(self.modes.upscaling);
            if (can_load && !needs_upscale) || li.is_loading() {
                // Waiting only on a load: keep the old image visible
                // rather than flashing a blank frame.
                state.image = self.state.image.clone();
                state.original_bounds = self.state.original_bounds;
            }
        }

        state
    }

    async fn emit_state_now(&mut self, states: &flume::Sender<State>) {
        if self.last_sent.as_ref() == Some(&self.state) {
            return;
        }
        let mut shutdown = events::shutdown_waiter();
        let snapshot = self.state.clone();
        tokio::select! {
            biased;
            _ = shutdown.wait() => {}
            sent = states.send_async(snapshot) => {
                if sent.is_ok() {
                    self.last_sent = Some(self.state.clone());
                }
            }
        }
    }

    // ---- window maintenance ------------------------------------------------

    fn invalidate_all_downscaled(&mut self) {
        let size = self.target_size;
        for archive in &mut self.archives {
            for page in archive.pages_mut() {
                page.invalidate_downscaled(size);
            }
        }
    }

    fn maybe_rescale_all(&mut self) {
        let size = self.target_size;
        let pool = self.load_pool.clone();
        for archive in &mut self.archives {
            for page in archive.pages_mut() {
                page.maybe_rescale(&pool, size);
            }
        }
    }

    fn page_key(&self, pi: PageIndices) -> Option<(u64, usize)> {
        let archive = self.archives.get(pi.a)?;
        let p = usize::try_from(pi.p).ok()?;
        (p < archive.page_count()).then(|| (archive.id(), p))
    }

    /// Keeps the displayed page's upscale hot in the recency order.
    pub(crate) fn touch_current_upscaled(&mut self) {
        if let Some(key) = self.page_key(self.current) {
            self.upscaled_lru.get(&key);
        }
    }

    pub(crate) fn forget_upscaled(&mut self, archive_id: u64) {
        let keys: Vec<(u64, usize)> = self
            .upscaled_lru
            .iter()
            .map(|(key, _)| *key)
            .filter(|(id, _)| *id == archive_id)
            .collect();
        for key in keys {
            self.upscaled_lru.remove(&key);
        }
    }

    /// Clears the least-recently-used upscaled outputs over the configured
    /// cap. The displayed page is never evicted.
    fn enforce_upscaled_budget(&mut self) {
        let cap = self.cfg.maximum_upscaled;
        if cap == 0 {
            return;
        }

        let current_key = self.page_key(self.current);
        let mut spared = Vec::new();
        while self.upscaled_lru.len() > cap {
            let Some((key, ())) = self.upscaled_lru.remove_lru() else { break };
            if Some(key) == current_key {
                spared.push(key);
                continue;
            }
            if let Some(page) = self.page_by_key(key) {
                debug!("upscale budget exceeded; clearing {page:?}");
                page.clear_upscale();
            }
        }
        for key in spared {
            self.upscaled_lru.insert(key, ());
        }
    }

    fn page_by_key(&mut self, (archive_id, page): (u64, usize)) -> Option<&mut Page> {
        self.archives.iter_mut().find(|a| a.id() == archive_id)?.page_mut(page)
    }
}

async fn watch_load(watcher: Option<LoadWatcher>) -> MaybeScaledImage {
    match watcher {
        Some(mut rx) => match rx.wait_for(|value| value.is_some()).await {
            Ok(value) => value.clone().expect("waited for a publish"),
            Err(_) => MaybeScaledImage::empty(),
        },
        None => std::future::pending().await,
    }
}

async fn watch_outcome(watcher: Option<OutcomeWaiter>) -> bool {
    match watcher {
        Some(mut waiter) => waiter.wait().await,
        None => std::future::pending().await,
    }
}
