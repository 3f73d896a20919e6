//! Two-tier image cache: decoded images in memory, encoded bytes on disk.
//!
//! Disk mutations run on one I/O worker thread in submission order. Until the
//! worker has applied a mutation, it is recorded in a pending table that every
//! read consults first, so a read always observes earlier writes and removals
//! made through the same cache.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::thread;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

use super::codec::{self, DecodeOptions};
use super::disk_cache::DiskImageCache;
use super::dispatch::CallbackQueue;
use super::memory_cache::MemoryImageCache;
use crate::domain::entities::{CacheKey, ImageCacheType, ImageFromType, WebImage};
use crate::domain::errors::WebImageError;

const IO_THREAD_NAME: &str = "lsimage-disk-io";

#[derive(Clone)]
enum Payload {
    Data(Bytes),
    Image(Arc<WebImage>),
}

#[derive(Clone)]
enum Pending {
    Write { seq: u64, payload: Payload },
    Remove { seq: u64 },
}

impl Pending {
    const fn seq(&self) -> u64 {
        match self {
            Self::Write { seq, .. } | Self::Remove { seq } => *seq,
        }
    }
}

type PendingTable = Mutex<HashMap<CacheKey, Pending>>;

enum DiskJob {
    Write {
        key: CacheKey,
        seq: u64,
        payload: Payload,
    },
    Remove {
        key: CacheKey,
        seq: u64,
    },
    Clear {
        done: std_mpsc::Sender<()>,
    },
    Run(Box<dyn FnOnce() + Send>),
}

struct CacheInner {
    name: String,
    memory: MemoryImageCache,
    disk: Arc<DiskImageCache>,
    pending: Arc<PendingTable>,
    next_seq: AtomicU64,
    io_tx: mpsc::UnboundedSender<DiskJob>,
    callbacks: CallbackQueue,
    decode: RwLock<DecodeOptions>,
}

/// Unified key-based image store over a memory tier and a disk tier.
///
/// Cloning is cheap; clones share the same tiers.
#[derive(Clone)]
pub struct ImageCache {
    inner: Arc<CacheInner>,
}

impl ImageCache {
    /// Composes a cache from its tiers.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        memory: MemoryImageCache,
        disk: DiskImageCache,
        callbacks: CallbackQueue,
    ) -> Self {
        let disk = Arc::new(disk);
        let pending: Arc<PendingTable> = Arc::new(Mutex::new(HashMap::new()));
        let (io_tx, io_rx) = mpsc::unbounded_channel();

        spawn_io_worker(disk.clone(), pending.clone(), io_rx);

        Self {
            inner: Arc::new(CacheInner {
                name: name.into(),
                memory,
                disk,
                pending,
                next_seq: AtomicU64::new(1),
                io_tx,
                callbacks,
                decode: RwLock::new(DecodeOptions::default()),
            }),
        }
    }

    /// Opens a cache rooted at `path` with default limits.
    ///
    /// # Errors
    /// Returns error if the disk directory cannot be created.
    pub fn open(path: PathBuf, callbacks: CallbackQueue) -> Result<Self, WebImageError> {
        let name = path
            .file_name()
            .map_or_else(|| "images".to_owned(), |n| n.to_string_lossy().into_owned());
        let disk = DiskImageCache::new(path, super::disk_cache::DEFAULT_MAX_CACHE_SIZE)?;
        Ok(Self::new(
            name.clone(),
            MemoryImageCache::with_default_limits(name),
            disk,
            callbacks,
        ))
    }

    /// Cache name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The memory tier.
    #[must_use]
    pub fn memory_cache(&self) -> &MemoryImageCache {
        &self.inner.memory
    }

    /// The disk tier. Writes made through this handle bypass the I/O worker.
    #[must_use]
    pub fn disk_cache(&self) -> &DiskImageCache {
        &self.inner.disk
    }

    /// Queue async completions are delivered on.
    #[must_use]
    pub fn callbacks(&self) -> &CallbackQueue {
        &self.inner.callbacks
    }

    /// Display scale attached to images decoded from disk.
    #[must_use]
    pub fn scale(&self) -> f32 {
        self.inner.decode.read().scale
    }

    /// Whether disk reads keep animated data.
    #[must_use]
    pub fn allow_animated_image(&self) -> bool {
        self.inner.decode.read().allow_animated
    }

    /// Sets whether disk reads keep animated data.
    pub fn set_allow_animated_image(&self, allow: bool) {
        self.inner.decode.write().allow_animated = allow;
    }

    /// Sets the display scale attached to images decoded from disk.
    pub fn set_scale(&self, scale: f32) {
        self.inner.decode.write().scale = scale;
    }

    /// Stores an image and/or its encoded bytes in the selected tiers.
    ///
    /// The memory tier receives `image` only. The disk tier receives `data`
    /// verbatim if given, else bytes derived from `image`. The disk write runs
    /// on the I/O worker; this call does not wait for it.
    pub fn set_image(
        &self,
        image: Option<Arc<WebImage>>,
        data: Option<Bytes>,
        key: &CacheKey,
        tiers: ImageCacheType,
    ) {
        if image.is_none() && data.is_none() {
            return;
        }

        if tiers.contains(ImageCacheType::MEMORY)
            && let Some(image) = &image
        {
            self.inner
                .memory
                .set(key.clone(), image.clone(), image.cost());
        }

        if tiers.contains(ImageCacheType::DISK) {
            let payload = match (data, image) {
                (Some(data), _) => Payload::Data(data),
                (None, Some(image)) => Payload::Image(image),
                (None, None) => return,
            };
            let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
            self.inner.pending.lock().insert(
                key.clone(),
                Pending::Write {
                    seq,
                    payload: payload.clone(),
                },
            );
            self.submit(DiskJob::Write {
                key: key.clone(),
                seq,
                payload,
            });
        }
    }

    /// Removes a key from the selected tiers. Disk removal is asynchronous.
    pub fn remove_image(&self, key: &CacheKey, tiers: ImageCacheType) {
        if tiers.contains(ImageCacheType::MEMORY) {
            self.inner.memory.remove(key);
        }
        if tiers.contains(ImageCacheType::DISK) {
            let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
            self.inner
                .pending
                .lock()
                .insert(key.clone(), Pending::Remove { seq });
            self.submit(DiskJob::Remove {
                key: key.clone(),
                seq,
            });
        }
    }

    /// Returns true if any selected tier holds the key.
    ///
    /// Blocks on disk I/O when the memory tier misses and DISK is selected.
    pub fn contains_image(&self, key: &CacheKey, tiers: ImageCacheType) -> bool {
        if tiers.contains(ImageCacheType::MEMORY) && self.inner.memory.contains(key) {
            return true;
        }
        if tiers.contains(ImageCacheType::DISK) {
            return match self.inner.pending_entry(key) {
                Some(Pending::Write { .. }) => true,
                Some(Pending::Remove { .. }) => false,
                None => self.inner.disk.contains(key),
            };
        }
        false
    }

    /// Returns the image for a key, reading and decoding from disk on a memory
    /// miss. A disk hit is promoted into memory when MEMORY is selected.
    ///
    /// Blocks on disk I/O.
    pub fn get_image(&self, key: &CacheKey, tiers: ImageCacheType) -> Option<Arc<WebImage>> {
        self.lookup(key, tiers).map(|(image, _)| image)
    }

    /// Like [`get_image`](Self::get_image) but also reports which tier answered.
    pub fn lookup(
        &self,
        key: &CacheKey,
        tiers: ImageCacheType,
    ) -> Option<(Arc<WebImage>, ImageFromType)> {
        self.inner.lookup(key, tiers)
    }

    /// Asynchronous lookup. The completion runs on the callback queue.
    ///
    /// A memory hit is delivered without disk I/O; a miss is read and decoded
    /// on the I/O worker and promoted like the blocking variant.
    pub fn get_image_with<F>(&self, key: &CacheKey, tiers: ImageCacheType, completion: F)
    where
        F: FnOnce(Option<Arc<WebImage>>, ImageFromType) + Send + 'static,
    {
        if tiers.contains(ImageCacheType::MEMORY)
            && let Some(image) = self.inner.memory.get(key)
        {
            self.inner
                .callbacks
                .dispatch(move || completion(Some(image), ImageFromType::MemoryCache));
            return;
        }

        if !tiers.contains(ImageCacheType::DISK) {
            self.inner
                .callbacks
                .dispatch(move || completion(None, ImageFromType::None));
            return;
        }

        let inner = self.inner.clone();
        let key = key.clone();
        self.submit(DiskJob::Run(Box::new(move || {
            let result = inner.load_from_disk(&key, tiers);
            inner.callbacks.dispatch(move || match result {
                Some(image) => completion(Some(image), ImageFromType::DiskCache),
                None => completion(None, ImageFromType::None),
            });
        })));
    }

    /// Returns the encoded bytes stored on disk. Blocks on disk I/O.
    pub fn get_image_data(&self, key: &CacheKey) -> Option<Bytes> {
        self.inner.read_disk_bytes(key)
    }

    /// Asynchronous variant of [`get_image_data`](Self::get_image_data).
    pub fn get_image_data_with<F>(&self, key: &CacheKey, completion: F)
    where
        F: FnOnce(Option<Bytes>) + Send + 'static,
    {
        let inner = self.inner.clone();
        let key = key.clone();
        self.submit(DiskJob::Run(Box::new(move || {
            let data = inner.read_disk_bytes(&key);
            inner.callbacks.dispatch(move || completion(data));
        })));
    }

    /// Removes everything from the selected tiers.
    ///
    /// Waits for the disk tier to be emptied.
    pub fn clear(&self, tiers: ImageCacheType) {
        if tiers.contains(ImageCacheType::MEMORY) {
            self.inner.memory.clear();
        }
        if tiers.contains(ImageCacheType::DISK) {
            self.inner.pending.lock().clear();
            let (done, wait) = std_mpsc::channel();
            self.submit(DiskJob::Clear { done });
            let _ = wait.recv();
        }
        debug!(cache = %self.inner.name, ?tiers, "Cleared image cache");
    }

    /// Waits until every disk mutation submitted so far has been applied.
    pub fn flush(&self) {
        let (done, wait) = std_mpsc::channel();
        self.submit(DiskJob::Run(Box::new(move || {
            let _ = done.send(());
        })));
        let _ = wait.recv();
    }

    fn submit(&self, job: DiskJob) {
        if self.inner.io_tx.send(job).is_err() {
            error!(cache = %self.inner.name, "Disk I/O worker is gone, dropping job");
        }
    }
}

impl CacheInner {
    fn pending_entry(&self, key: &CacheKey) -> Option<Pending> {
        self.pending.lock().get(key).cloned()
    }

    fn lookup(
        &self,
        key: &CacheKey,
        tiers: ImageCacheType,
    ) -> Option<(Arc<WebImage>, ImageFromType)> {
        if tiers.contains(ImageCacheType::MEMORY)
            && let Some(image) = self.memory.get(key)
        {
            return Some((image, ImageFromType::MemoryCache));
        }
        if tiers.contains(ImageCacheType::DISK) {
            return self
                .load_from_disk(key, tiers)
                .map(|image| (image, ImageFromType::DiskCache));
        }
        None
    }

    fn load_from_disk(&self, key: &CacheKey, tiers: ImageCacheType) -> Option<Arc<WebImage>> {
        let image = match self.pending_entry(key) {
            Some(Pending::Remove { .. }) => return None,
            Some(Pending::Write {
                payload: Payload::Image(image),
                ..
            }) => image,
            Some(Pending::Write {
                payload: Payload::Data(data),
                ..
            }) => self.decode(key, &data)?,
            None => {
                let data = self.disk.get(key)?;
                self.decode(key, &data)?
            }
        };

        if tiers.contains(ImageCacheType::MEMORY) {
            trace!(cache = %self.name, key = %key, "Promoting disk hit to memory");
            self.memory.set(key.clone(), image.clone(), image.cost());
        }
        Some(image)
    }

    fn decode(&self, key: &CacheKey, data: &Bytes) -> Option<Arc<WebImage>> {
        let options = *self.decode.read();
        match codec::decode(data, options) {
            Ok(image) => Some(Arc::new(image)),
            Err(e) => {
                warn!(cache = %self.name, key = %key, error = %e, "Failed to decode cached image");
                None
            }
        }
    }

    fn read_disk_bytes(&self, key: &CacheKey) -> Option<Bytes> {
        match self.pending_entry(key) {
            Some(Pending::Remove { .. }) => None,
            Some(Pending::Write {
                payload: Payload::Data(data),
                ..
            }) => Some(data),
            Some(Pending::Write {
                payload: Payload::Image(image),
                ..
            }) => codec::encode(&image).ok(),
            None => self.disk.get(key),
        }
    }
}

fn spawn_io_worker(
    disk: Arc<DiskImageCache>,
    pending: Arc<PendingTable>,
    mut rx: mpsc::UnboundedReceiver<DiskJob>,
) {
    let spawned = thread::Builder::new()
        .name(IO_THREAD_NAME.to_owned())
        .spawn(move || {
            while let Some(job) = rx.blocking_recv() {
                match job {
                    DiskJob::Write { key, seq, payload } => {
                        let bytes = match payload {
                            Payload::Data(data) => Ok(data),
                            Payload::Image(image) => codec::encode(&image),
                        };
                        match bytes {
                            Ok(bytes) => {
                                if let Err(e) = disk.set(&key, &bytes) {
                                    warn!(key = %key, error = %e, "Failed to write image to disk");
                                }
                            }
                            Err(e) => {
                                warn!(key = %key, error = %e, "Failed to encode image for disk");
                            }
                        }
                        settle(&pending, &key, seq);
                    }
                    DiskJob::Remove { key, seq } => {
                        disk.remove(&key);
                        settle(&pending, &key, seq);
                    }
                    DiskJob::Clear { done } => {
                        if let Err(e) = disk.clear() {
                            warn!(error = %e, "Failed to clear disk cache");
                        }
                        let _ = done.send(());
                    }
                    DiskJob::Run(job) => job(),
                }
            }
            debug!("Disk I/O worker exiting");
        });
    if let Err(e) = spawned {
        error!(error = %e, "Failed to spawn disk I/O worker");
    }
}

/// Drops the pending entry for `key` if it still belongs to mutation `seq`.
fn settle(pending: &PendingTable, key: &CacheKey, seq: u64) {
    let mut table = pending.lock();
    if table.get(key).is_some_and(|p| p.seq() == seq) {
        table.remove(key);
    }
}

impl std::fmt::Debug for ImageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageCache")
            .field("name", &self.inner.name)
            .field("memory", &self.inner.memory)
            .field("disk", &self.inner.disk)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use tempfile::TempDir;

    /// Creates a cache in a fresh temporary directory.
    pub fn temp_cache() -> (ImageCache, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let cache = ImageCache::open(temp_dir.path().join("images"), CallbackQueue::spawn()).unwrap();
        (cache, temp_dir)
    }
}
