//! Per-image pipeline slot: a state machine around one decodable file.
//!
//! A loadable image walks `Unwritten -> Loadable -> Loading -> Loaded` (or
//! `Failed`). Unloading never cancels a decode outright; it detaches from
//! it: the receive channel is replaced so the worker's publish lands in
//! oblivion, and the old cancellation handle is fired so the worker can bail
//! out cheaply. Workers always publish something, even when cancelled, so a
//! still-attached observer can never deadlock.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task;
use tracing::{debug, error};

use crate::codec::{self, PremulImage};
use crate::events::{self, FireOnDrop, Trigger, Waiter};
use crate::types::ImageDimensions;

use super::LoadPool;
use super::resize::{fit_bounds, resize_premultiplied};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LoadState {
    /// The file does not exist yet (extraction or upscaling pending).
    Unwritten,
    /// On disk and ready to decode.
    Loadable,
    Loading,
    Loaded,
    Failed,
}

/// Payload of one decode: pixels (when produced), the source's natural
/// bounds, and whether the pixels were scaled to fit a target.
#[derive(Debug, Clone)]
pub struct MaybeScaledImage {
    pub image: Option<Arc<PremulImage>>,
    pub original: ImageDimensions,
    pub scaled: bool,
}

impl MaybeScaledImage {
    /// The cancellation and failure sentinel.
    pub fn empty() -> Self {
        Self { image: None, original: ImageDimensions::ZERO, scaled: false }
    }
}

/// Observation side of an in-flight load.
pub type LoadWatcher = watch::Receiver<Option<MaybeScaledImage>>;

#[derive(Debug)]
pub struct LoadableImage {
    path: PathBuf,
    deletable: bool,
    state: LoadState,
    /// Receive side of the current load; replaced wholesale to detach.
    load_rx: LoadWatcher,
    /// Completion of the most recent worker, replaced per load so the
    /// previous one can be awaited independently.
    last_load: Waiter,
    cancel_load: Trigger,
    cancel_waiter: Waiter,
    msi: Option<MaybeScaledImage>,
    target_size: ImageDimensions,
}

fn dead_watcher() -> LoadWatcher {
    watch::channel(None).1
}

impl LoadableImage {
    /// An archive entry that the extractor will write into the temp dir.
    pub(crate) fn new_unwritten(path: PathBuf) -> Self {
        Self::new(path, LoadState::Unwritten, true)
    }

    /// A file that already exists on disk and is not ours to delete.
    pub(crate) fn new_existing(path: PathBuf) -> Self {
        Self::new(path, LoadState::Loadable, false)
    }

    /// The future output of an upscale.
    pub(crate) fn new_upscale_output(path: PathBuf) -> Self {
        Self::new(path, LoadState::Unwritten, true)
    }

    fn new(path: PathBuf, state: LoadState, deletable: bool) -> Self {
        let (cancel_load, cancel_waiter) = events::flag();
        Self {
            path,
            deletable,
            state,
            load_rx: dead_watcher(),
            last_load: Waiter::fired(),
            cancel_load,
            cancel_waiter,
            msi: None,
            target_size: ImageDimensions::ZERO,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> LoadState {
        self.state
    }

    pub fn target_size(&self) -> ImageDimensions {
        self.target_size
    }

    /// True if a load can be initiated, though potentially not yet.
    pub fn can_load(&self) -> bool {
        matches!(self.state, LoadState::Unwritten | LoadState::Loadable)
    }

    /// True if a load can be initiated right now.
    pub fn ready_to_load(&self) -> bool {
        self.state == LoadState::Loadable
    }

    pub fn is_loading(&self) -> bool {
        self.state == LoadState::Loading
    }

    /// True when displayable pixels are attached, possibly mid-rescale.
    pub fn has_image_data(&self) -> bool {
        match self.state {
            LoadState::Loaded => true,
            LoadState::Loading => {
                self.msi.as_ref().map_or(false, |msi| msi.image.is_some())
            }
            _ => false,
        }
    }

    pub fn image(&self) -> Option<&MaybeScaledImage> {
        if self.has_image_data() { self.msi.as_ref() } else { None }
    }

    /// Extraction or upscaling finished writing the file.
    pub(crate) fn mark_written(&mut self) {
        if self.state == LoadState::Unwritten {
            self.state = LoadState::Loadable;
        }
    }

    pub(crate) fn mark_failed(&mut self) {
        self.state = LoadState::Failed;
        self.msi = None;
    }

    /// Back to a fresh unwritten slot; used when an upscale is cleared.
    pub(crate) fn reset_unwritten(&mut self) {
        self.unload();
        self.state = LoadState::Unwritten;
    }

    /// Watch handle for the in-flight load, when one exists.
    pub fn load_watcher(&self) -> Option<LoadWatcher> {
        (self.state == LoadState::Loading).then(|| self.load_rx.clone())
    }

    /// Starts an asynchronous decode. Panics unless `ready_to_load`.
    pub fn load(&mut self, pool: &LoadPool, size: ImageDimensions) {
        if self.state != LoadState::Loadable {
            panic!("tried to load image that isn't ready: {:?} {:?}", self.state, self.path);
        }
        self.spawn_load(pool, size, None);
    }

    /// Re-scales from an original that is already in memory, skipping the
    /// decode. Used after a natural-size first paint.
    fn load_from_image(&mut self, pool: &LoadPool, size: ImageDimensions, img: Arc<PremulImage>) {
        self.spawn_load(pool, size, Some(img));
    }

    fn spawn_load(
        &mut self,
        pool: &LoadPool,
        size: ImageDimensions,
        original: Option<Arc<PremulImage>>,
    ) {
        let (tx, rx) = watch::channel(None);
        self.load_rx = rx;

        let (done, done_waiter) = events::flag();
        let previous = std::mem::replace(&mut self.last_load, done_waiter);

        self.state = LoadState::Loading;
        self.target_size = size;

        let path = self.path.clone();
        let cancel = self.cancel_waiter.clone();
        let semaphore = pool.semaphore();
        task::spawn(load_worker(
            path,
            size,
            original,
            tx,
            cancel,
            previous,
            FireOnDrop(done),
            semaphore,
        ));
    }

    /// Accepts a worker's publish, observed by the manager.
    pub fn mark_loaded(&mut self, msi: MaybeScaledImage) {
        self.state = if msi.image.is_some() { LoadState::Loaded } else { LoadState::Failed };
        self.msi = Some(msi);
    }

    /// Detaches from any in-flight work and drops cached pixels. The next
    /// load starts from a clean slate.
    pub fn unload(&mut self) {
        if matches!(self.state, LoadState::Failed | LoadState::Unwritten) {
            return;
        }

        if self.state == LoadState::Loading {
            // Replace the channel so the current worker's publish is garbage.
            self.load_rx = dead_watcher();
        }

        if !self.last_load.is_set() {
            // An ongoing load: signal it, then arm a fresh handle.
            self.cancel_load.fire();
            let (trigger, waiter) = events::flag();
            self.cancel_load = trigger;
            self.cancel_waiter = waiter;
        }

        self.state = LoadState::Loadable;
        self.msi = None;
        self.target_size = ImageDimensions::ZERO;
    }

    /// Loads synchronously at natural size, or adopts the in-flight result.
    /// Deliberately blocks the coordinator: first-paint latency beats
    /// fairness here.
    pub async fn load_sync_unscaled(&mut self) {
        match self.state {
            LoadState::Unwritten => {
                panic!("tried to synchronously load unwritten file {:?}", self.path)
            }
            LoadState::Loaded | LoadState::Failed => {}
            LoadState::Loading => {
                let mut rx = self.load_rx.clone();
                let msi = match rx.wait_for(|value| value.is_some()).await {
                    Ok(value) => value.clone().expect("waited for some"),
                    Err(_) => MaybeScaledImage::empty(),
                };
                self.mark_loaded(msi);
            }
            LoadState::Loadable => {
                debug!("synchronous load of {}", self.path.display());
                let msi = match codec::decode_premultiplied(&self.path) {
                    Ok(img) => {
                        let original = img.dimensions();
                        MaybeScaledImage { image: Some(Arc::new(img)), original, scaled: false }
                    }
                    Err(err) => {
                        error!("error decoding {}: {err:#}", self.path.display());
                        MaybeScaledImage::empty()
                    }
                };
                self.mark_loaded(msi);
            }
        }
    }

    /// Detaches stale scaled output. A cached image larger than the box is
    /// kept (the renderer can downscale it until the slow pass runs), and
    /// natural-size output is left for [`Self::maybe_rescale`].
    pub fn invalidate_downscaled(&mut self, size: ImageDimensions) {
        if size.is_zero() {
            return;
        }
        match self.state {
            LoadState::Loading => {
                if self.target_size != size {
                    self.unload();
                }
            }
            LoadState::Loaded => {
                let Some(msi) = &self.msi else { return };
                let Some(image) = &msi.image else { return };
                if !msi.scaled {
                    return;
                }
                let dims = image.dimensions();
                if !dims.fits_inside(size) {
                    return;
                }
                if dims != fit_bounds(msi.original, size) {
                    self.unload();
                }
            }
            _ => {}
        }
    }

    /// Invalidate-then-reschedule: when the cached pixels no longer match
    /// the fit-into-`size` bounds of the original, start a fresh scaling
    /// load, from the cached original when one is attached and from disk
    /// otherwise. No-op when the bounds already match.
    pub fn maybe_rescale(&mut self, pool: &LoadPool, size: ImageDimensions) {
        if size.is_zero() || self.state != LoadState::Loaded {
            return;
        }
        let Some(msi) = &self.msi else { return };
        let Some(image) = &msi.image else { return };

        let want = fit_bounds(msi.original, size);
        if image.dimensions() == want {
            return;
        }

        if msi.scaled {
            // The original is gone; reload from disk at the new size.
            self.unload();
        } else {
            let original = image.clone();
            self.load_from_image(pool, size, original);
        }
    }

    /// Blocks until the most recent load attempt has fully completed. Used
    /// at teardown so file handles are certainly closed.
    pub async fn join(&self) {
        let mut waiter = self.last_load.clone();
        waiter.wait().await;
    }

    /// True iff this file was written by us, into a temp directory.
    pub fn deletable(&self) -> bool {
        self.deletable
    }
}

#[allow(clippy::too_many_arguments)]
async fn load_worker(
    path: PathBuf,
    size: ImageDimensions,
    original: Option<Arc<PremulImage>>,
    tx: watch::Sender<Option<MaybeScaledImage>>,
    mut cancel: Waiter,
    mut previous: Waiter,
    _done: FireOnDrop,
    semaphore: Arc<tokio::sync::Semaphore>,
) {
    let mut shutdown = events::shutdown_waiter();

    // The rare case where an image is loaded, unloaded, and loaded again
    // before the first worker finished.
    previous.wait().await;

    let permit = tokio::select! {
        biased;
        _ = shutdown.wait() => {
            tx.send_replace(Some(MaybeScaledImage::empty()));
            return;
        }
        _ = cancel.wait() => {
            tx.send_replace(Some(MaybeScaledImage::empty()));
            return;
        }
        permit = semaphore.acquire_owned() => permit,
    };
    let _permit = match permit {
        Ok(permit) => permit,
        Err(_) => {
            tx.send_replace(Some(MaybeScaledImage::empty()));
            return;
        }
    };

    if cancel.is_set() || events::is_shutting_down() {
        debug!("load pre-empted: {}", path.display());
        tx.send_replace(Some(MaybeScaledImage::empty()));
        return;
    }

    let work_path = path.clone();
    let result =
        task::spawn_blocking(move || decode_and_scale(&work_path, size, original)).await;

    let msi = match result {
        Ok(Ok(msi)) => msi,
        Ok(Err(err)) => {
            error!("error loading {}: {err:#}", path.display());
            MaybeScaledImage::empty()
        }
        Err(err) => {
            error!("decode task for {} failed: {err}", path.display());
            MaybeScaledImage::empty()
        }
    };

    if cancel.is_set() {
        tx.send_replace(Some(MaybeScaledImage::empty()));
        return;
    }

    tx.send_replace(Some(msi));
}

fn decode_and_scale(
    path: &Path,
    size: ImageDimensions,
    original: Option<Arc<PremulImage>>,
) -> crate::Result<MaybeScaledImage> {
    let original = match original {
        Some(img) => img,
        None => Arc::new(codec::decode_premultiplied(path)?),
    };
    let bounds = original.dimensions();

    if size.is_zero() {
        return Ok(MaybeScaledImage { image: Some(original), original: bounds, scaled: false });
    }

    let want = fit_bounds(bounds, size);
    if want == bounds {
        return Ok(MaybeScaledImage { image: Some(original), original: bounds, scaled: false });
    }

    let scaled = resize_premultiplied(&original, want)?;
    Ok(MaybeScaledImage { image: Some(Arc::new(scaled)), original: bounds, scaled: true })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, ImageBuffer, Rgba};
    use std::time::Duration;

    fn write_png(dir: &Path, name: &str, w: u32, h: u32) -> PathBuf {
        let path = dir.join(name);
        let img: ImageBuffer<Rgba<u8>, Vec<u8>> =
            ImageBuffer::from_pixel(w, h, Rgba([90, 120, 200, 255]));
        DynamicImage::ImageRgba8(img).save(&path).unwrap();
        path
    }

    async fn finish_load(li: &mut LoadableImage) {
        let mut rx = li.load_watcher().expect("loading");
        let msi = rx.wait_for(|v| v.is_some()).await.unwrap().clone().unwrap();
        li.mark_loaded(msi);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn load_produces_scaled_pixels() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_png(dir.path(), "a.png", 100, 50);
        let pool = LoadPool::new(2);

        let mut li = LoadableImage::new_existing(path);
        assert!(li.ready_to_load());
        li.load(&pool, ImageDimensions::new(50, 50));
        assert!(li.is_loading());

        finish_load(&mut li).await;
        assert_eq!(li.state(), LoadState::Loaded);

        let msi = li.image().expect("image data");
        assert_eq!(msi.original, ImageDimensions::new(100, 50));
        assert!(msi.scaled);
        assert_eq!(msi.image.as_ref().unwrap().dimensions(), ImageDimensions::new(50, 25));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn natural_size_load_is_unscaled() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_png(dir.path(), "b.png", 40, 30);
        let pool = LoadPool::new(2);

        let mut li = LoadableImage::new_existing(path);
        li.load(&pool, ImageDimensions::ZERO);
        finish_load(&mut li).await;

        let msi = li.image().unwrap();
        assert!(!msi.scaled);
        assert_eq!(msi.image.as_ref().unwrap().dimensions(), ImageDimensions::new(40, 30));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unload_detaches_in_flight_work() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_png(dir.path(), "c.png", 64, 64);
        let pool = LoadPool::new(2);

        let mut li = LoadableImage::new_existing(path);
        li.load(&pool, ImageDimensions::new(32, 32));
        let detached = li.load_watcher().unwrap();

        li.unload();
        assert_eq!(li.state(), LoadState::Loadable);
        assert!(li.load_watcher().is_none());

        // The worker still publishes on its (now detached) channel and the
        // replacement load is observable independently.
        li.load(&pool, ImageDimensions::new(16, 16));
        finish_load(&mut li).await;
        assert_eq!(
            li.image().unwrap().image.as_ref().unwrap().dimensions(),
            ImageDimensions::new(16, 16)
        );

        let mut detached = detached;
        let _ = tokio::time::timeout(
            Duration::from_secs(5),
            detached.wait_for(|v| v.is_some()),
        )
        .await;
        li.join().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn decode_failure_marks_failed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.png");
        std::fs::write(&path, b"this is not a png").unwrap();
        let pool = LoadPool::new(2);

        let mut li = LoadableImage::new_existing(path);
        li.load(&pool, ImageDimensions::new(32, 32));
        finish_load(&mut li).await;

        assert_eq!(li.state(), LoadState::Failed);
        assert!(!li.has_image_data());
        // Failure is final; unload must not resurrect it.
        li.unload();
        assert_eq!(li.state(), LoadState::Failed);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sync_load_decodes_at_natural_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_png(dir.path(), "d.png", 20, 10);

        let mut li = LoadableImage::new_existing(path);
        li.load_sync_unscaled().await;
        assert_eq!(li.state(), LoadState::Loaded);
        let msi = li.image().unwrap();
        assert!(!msi.scaled);
        assert_eq!(msi.original, ImageDimensions::new(20, 10));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn maybe_rescale_reschedules_from_cached_original() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_png(dir.path(), "e.png", 200, 100);
        let pool = LoadPool::new(2);

        let mut li = LoadableImage::new_existing(path);
        li.load_sync_unscaled().await;

        // Natural-size pixels are present; a rescale to a smaller box must
        // start a scaling load from the cached original.
        li.maybe_rescale(&pool, ImageDimensions::new(100, 100));
        assert!(li.is_loading());
        assert!(li.has_image_data(), "stale pixels stay displayable mid-rescale");

        finish_load(&mut li).await;
        let msi = li.image().unwrap();
        assert!(msi.scaled);
        assert_eq!(msi.image.as_ref().unwrap().dimensions(), ImageDimensions::new(100, 50));

        // Matching bounds: no-op.
        li.maybe_rescale(&pool, ImageDimensions::new(100, 100));
        assert_eq!(li.state(), LoadState::Loaded);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn invalidate_keeps_larger_and_drops_stale_smaller() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_png(dir.path(), "f.png", 400, 400);
        let pool = LoadPool::new(2);

        let mut li = LoadableImage::new_existing(path);
        li.load(&pool, ImageDimensions::new(200, 200));
        finish_load(&mut li).await;

        // Growing the box: the 200x200 output is smaller than 300x300 and no
        // longer matches the fit bounds, so it is dropped for a reload.
        li.invalidate_downscaled(ImageDimensions::new(300, 300));
        assert_eq!(li.state(), LoadState::Loadable);

        li.load(&pool, ImageDimensions::new(300, 300));
        finish_load(&mut li).await;

        // Shrinking the box: the cached output is now larger than the box
        // and is kept for the cheap path.
        li.invalidate_downscaled(ImageDimensions::new(100, 100));
        assert_eq!(li.state(), LoadState::Loaded);
    }
}
