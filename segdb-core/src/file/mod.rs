//! File controller
//!
//! Multiplexes many numbered data files (`<key>.domain`) over a bounded
//! number of OS handles. Writers get exclusive append handles, readers share
//! any number of read handles per file. When every descriptor is taken,
//! acquisition evicts idle handles and otherwise blocks until one is
//! released.

mod counter;
mod handle;

pub(crate) use handle::{ReaderHandle, WriterHandle};

use crate::error::IoContext;
use crate::{DomainError, Result};
use counter::FileCounter;
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Extension of every data file
const DATA_FILE_EXT: &str = ".domain";

/// Suffix given to a data file while it is being compacted
const GC_SUFFIX: &str = "_gc";

/// Path of the data file with the given key
pub(crate) fn data_file_path(dir: &Path, key: u16) -> PathBuf {
    dir.join(format!("{}{}", key, DATA_FILE_EXT))
}

/// Where a data file is moved aside while it is compacted
pub(crate) fn gc_file_path(dir: &Path, key: u16) -> PathBuf {
    dir.join(format!("{}{}{}", key, GC_SUFFIX, DATA_FILE_EXT))
}

/// Parse `<key>.domain` into its key
fn parse_file_key(name: &str) -> Option<u16> {
    parse_key(name.strip_suffix(DATA_FILE_EXT)?)
}

fn parse_key(stem: &str) -> Option<u16> {
    stem.parse::<u16>().ok().filter(|key| *key > 0)
}

/// Sizes of every data file in `dir`, keyed by file key
pub(crate) fn list_data_files(dir: &Path) -> Result<BTreeMap<u16, u64>> {
    let mut files = BTreeMap::new();
    for entry in fs::read_dir(dir).context("read directory", dir)? {
        let entry = entry.context("read directory", dir)?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(key) = parse_file_key(&name) {
            let len = entry.metadata().context("stat data file", &entry.path())?.len();
            files.insert(key, len);
        }
    }
    Ok(files)
}

/// Keys of data files currently moved aside for compaction
pub(crate) fn list_gc_files(dir: &Path) -> Result<Vec<u16>> {
    let mut keys = Vec::new();
    for entry in fs::read_dir(dir).context("read directory", dir)? {
        let entry = entry.context("read directory", dir)?;
        let name = entry.file_name();
        let key = name
            .to_str()
            .and_then(|n| n.strip_suffix(DATA_FILE_EXT))
            .and_then(|n| n.strip_suffix(GC_SUFFIX))
            .and_then(parse_key);
        keys.extend(key);
    }
    keys.sort_unstable();
    Ok(keys)
}

enum WriterSlot {
    Idle(File),
    CheckedOut,
}

#[derive(Default)]
struct WriterPool {
    /// At most one writer handle per file
    open: BTreeMap<u16, WriterSlot>,
    /// Files below the size cap without an open writer handle
    unopened: BTreeSet<u16>,
}

#[derive(Default)]
struct ReaderSlots {
    idle: VecDeque<File>,
    checked_out: usize,
}

#[derive(Default)]
struct ReaderPool {
    open: HashMap<u16, ReaderSlots>,
    /// Files currently being compacted
    collecting: HashSet<u16>,
}

pub(crate) struct FileController {
    dir: PathBuf,
    /// Scaled file size, 0.8x the requested value
    file_size: u64,
    max_descriptors: usize,
    writers: Mutex<WriterPool>,
    readers: Mutex<ReaderPool>,
    counter: Mutex<FileCounter>,
    descriptors: AtomicUsize,
    release_tx: Sender<()>,
    release_rx: Receiver<()>,
    closed: AtomicBool,
}

impl FileController {
    /// Open the controller over the data files in `dir`
    pub fn open(dir: &Path, file_size: u64, max_descriptors: usize) -> Result<Self> {
        let mut counter = FileCounter::open(dir)?;
        let files = list_data_files(dir)?;

        if let Some(max_key) = files.keys().next_back() {
            counter.raise_to(*max_key as u32)?;
        }

        let (release_tx, release_rx) = bounded(max_descriptors);
        let controller = Self {
            dir: dir.to_path_buf(),
            file_size: ((file_size as f64) * 0.8).round().max(1.0) as u64,
            max_descriptors,
            writers: Mutex::new(WriterPool::default()),
            readers: Mutex::new(ReaderPool::default()),
            counter: Mutex::new(counter),
            descriptors: AtomicUsize::new(0),
            release_tx,
            release_rx,
            closed: AtomicBool::new(false),
        };

        let cap = controller.real_file_size_cap();
        {
            let mut writers = controller.writers.lock();
            writers.unopened = files
                .iter()
                .filter(|(_, len)| **len < cap)
                .map(|(key, _)| *key)
                .collect();
        }

        debug!(
            "File controller opened {:?}: {} data files, cap {} bytes",
            dir,
            files.len(),
            cap
        );

        Ok(controller)
    }

    /// Size at which a file stops accepting new writers. Roughly the size
    /// originally requested in the configuration.
    pub fn real_file_size_cap(&self) -> u64 {
        ((self.file_size as f64) * 1.25).round() as u64
    }

    pub fn path_for(&self, key: u16) -> PathBuf {
        data_file_path(&self.dir, key)
    }

    /// Number of OS handles currently open, idle or checked out
    pub fn open_descriptors(&self) -> usize {
        self.descriptors.load(Ordering::SeqCst)
    }

    /// Check out an append handle on a file below the size cap
    pub fn acquire_writer(self: &Arc<Self>) -> Result<WriterHandle> {
        loop {
            self.ensure_open()?;
            if let Some(handle) = self.try_acquire_writer()? {
                return Ok(handle);
            }
            if self.gc_writers() > 0 || self.gc_readers() > 0 {
                continue;
            }
            debug!(
                "All {} file descriptors in use, waiting for a writer release",
                self.max_descriptors
            );
            self.wait_for_release()?;
        }
    }

    fn try_acquire_writer(self: &Arc<Self>) -> Result<Option<WriterHandle>> {
        let cap = self.real_file_size_cap();
        let mut pool = self.writers.lock();

        // Reuse an idle handle on a file that still has room
        let mut reusable = None;
        for (key, slot) in pool.open.iter() {
            if let WriterSlot::Idle(file) = slot {
                let len = file
                    .metadata()
                    .context("stat data file", &self.path_for(*key))?
                    .len();
                if len < cap {
                    reusable = Some((*key, len));
                    break;
                }
            }
        }
        if let Some((key, len)) = reusable {
            if let Some(slot) = pool.open.get_mut(&key) {
                if let WriterSlot::Idle(file) = std::mem::replace(slot, WriterSlot::CheckedOut) {
                    return Ok(Some(WriterHandle::new(Arc::clone(self), key, file, len)));
                }
            }
            return Err(DomainError::Internal(format!(
                "idle writer on file {} vanished while locked",
                key
            )));
        }

        // Fill a partially written file before creating a new one
        if let Some(key) = pool.unopened.iter().next().copied() {
            if self.reserve_descriptor() {
                pool.unopened.remove(&key);
                let path = self.path_for(key);
                let opened = OpenOptions::new()
                    .append(true)
                    .create(true)
                    .open(&path)
                    .and_then(|file| file.metadata().map(|meta| (file, meta.len())));
                let (file, len) = match opened.context("open data file", &path) {
                    Ok(opened) => opened,
                    Err(e) => {
                        pool.unopened.insert(key);
                        self.release_descriptor();
                        return Err(e);
                    }
                };
                pool.open.insert(key, WriterSlot::CheckedOut);
                return Ok(Some(WriterHandle::new(Arc::clone(self), key, file, len)));
            }
            return Ok(None);
        }

        if !self.reserve_descriptor() {
            return Ok(None);
        }
        let created = self.counter.lock().next().and_then(|key| {
            let path = self.path_for(key);
            OpenOptions::new()
                .append(true)
                .create_new(true)
                .open(&path)
                .context("create data file", &path)
                .map(|file| (key, file))
        });
        match created {
            Ok((key, file)) => {
                info!("Created data file {:?}", self.path_for(key));
                pool.open.insert(key, WriterSlot::CheckedOut);
                Ok(Some(WriterHandle::new(Arc::clone(self), key, file, 0)))
            }
            Err(e) => {
                self.release_descriptor();
                Err(e)
            }
        }
    }

    /// Check out a read handle on the data file with the given key
    pub fn acquire_reader(self: &Arc<Self>, key: u16) -> Result<ReaderHandle> {
        loop {
            self.ensure_open()?;
            let collecting = {
                let mut pool = self.readers.lock();
                if pool.collecting.contains(&key) {
                    true
                } else {
                    let slots = pool.open.entry(key).or_default();
                    if let Some(file) = slots.idle.pop_front() {
                        slots.checked_out += 1;
                        return Ok(ReaderHandle::new(Arc::clone(self), key, file));
                    }
                    if self.reserve_descriptor() {
                        let path = self.path_for(key);
                        return match File::open(&path).context("open data file", &path) {
                            Ok(file) => {
                                slots.checked_out += 1;
                                Ok(ReaderHandle::new(Arc::clone(self), key, file))
                            }
                            Err(e) => {
                                self.release_descriptor();
                                Err(e)
                            }
                        };
                    }
                    false
                }
            };

            if !collecting
                && (self.gc_readers() > 0 || self.gc_writers() > 0 || self.close_idle_writer())
            {
                continue;
            }
            debug!("Waiting for a reader on file {}", key);
            self.wait_for_release()?;
        }
    }

    /// Close idle writer handles on files that reached the size cap
    pub fn gc_writers(&self) -> usize {
        let cap = self.real_file_size_cap();
        let mut pool = self.writers.lock();
        let oversize: Vec<u16> = pool
            .open
            .iter()
            .filter_map(|(key, slot)| match slot {
                WriterSlot::Idle(file) => {
                    let len = file.metadata().map(|m| m.len()).unwrap_or(u64::MAX);
                    (len >= cap).then_some(*key)
                }
                WriterSlot::CheckedOut => None,
            })
            .collect();

        for key in &oversize {
            pool.open.remove(key);
            self.release_descriptor();
        }
        if !oversize.is_empty() {
            debug!("Closed {} idle writers on oversize files", oversize.len());
        }
        oversize.len()
    }

    /// Close every idle reader handle
    pub fn gc_readers(&self) -> usize {
        let mut pool = self.readers.lock();
        let mut closed = 0;
        for slots in pool.open.values_mut() {
            closed += slots.idle.len();
            slots.idle.clear();
        }
        pool.open.retain(|_, slots| slots.checked_out > 0);
        for _ in 0..closed {
            self.release_descriptor();
        }
        if closed > 0 {
            debug!("Closed {} idle readers", closed);
        }
        closed
    }

    /// Close one idle writer regardless of its size, so readers are not
    /// starved by writers parked on files with room left
    fn close_idle_writer(&self) -> bool {
        let cap = self.real_file_size_cap();
        let mut pool = self.writers.lock();
        let idle = pool
            .open
            .iter()
            .find(|(_, slot)| matches!(slot, WriterSlot::Idle(_)))
            .map(|(key, _)| *key);

        let Some(key) = idle else {
            return false;
        };
        if let Some(WriterSlot::Idle(file)) = pool.open.remove(&key) {
            if file.metadata().map(|m| m.len() < cap).unwrap_or(false) {
                pool.unopened.insert(key);
            }
        }
        self.release_descriptor();
        true
    }

    /// Take a file out of circulation for compaction.
    ///
    /// Fails with `ResourceInUse` when any handle on the file is checked out.
    /// Idle handles are closed and the file is hidden from new acquisitions
    /// until [`FileController::rejuvenate`] is called.
    pub fn begin_collect(&self, key: u16) -> Result<()> {
        let mut writers = self.writers.lock();
        let mut readers = self.readers.lock();

        if matches!(writers.open.get(&key), Some(WriterSlot::CheckedOut)) {
            return Err(DomainError::ResourceInUse(format!("writer on file {}", key)));
        }
        if readers.open.get(&key).map_or(false, |s| s.checked_out > 0) {
            return Err(DomainError::ResourceInUse(format!("reader on file {}", key)));
        }

        let mut closed = 0;
        if writers.open.remove(&key).is_some() {
            closed += 1;
        }
        if let Some(slots) = readers.open.remove(&key) {
            closed += slots.idle.len();
        }
        writers.unopened.remove(&key);
        readers.collecting.insert(key);

        for _ in 0..closed {
            self.release_descriptor();
        }
        Ok(())
    }

    /// Return a compacted file to circulation
    pub fn rejuvenate(&self, key: u16) -> Result<()> {
        let path = self.path_for(key);
        let len = fs::metadata(&path)
            .map(|m| m.len())
            .context("stat data file", &path);
        let result = {
            let mut writers = self.writers.lock();
            let mut readers = self.readers.lock();
            readers.collecting.remove(&key);

            match writers.open.get(&key) {
                Some(WriterSlot::CheckedOut) => {
                    Err(DomainError::ResourceInUse(format!("writer on file {}", key)))
                }
                Some(WriterSlot::Idle(_)) => {
                    writers.open.remove(&key);
                    self.release_descriptor();
                    Ok(())
                }
                None => {
                    if let Ok(len) = &len {
                        if *len < self.real_file_size_cap() {
                            writers.unopened.insert(key);
                        }
                    }
                    Ok(())
                }
            }
        };
        self.signal();
        result.and(len.map(|_| ()))
    }

    /// Close every idle handle. Checked-out handles are reported as in use
    /// and closed when they are returned.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut errors = Vec::new();
        let mut closed = 0;
        {
            let mut writers = self.writers.lock();
            for (key, slot) in writers.open.iter() {
                match slot {
                    WriterSlot::Idle(_) => closed += 1,
                    WriterSlot::CheckedOut => errors.push(DomainError::ResourceInUse(format!(
                        "writer on file {}",
                        key
                    ))),
                }
            }
            writers
                .open
                .retain(|_, slot| matches!(slot, WriterSlot::CheckedOut));
            writers.unopened.clear();
        }
        {
            let mut readers = self.readers.lock();
            for (key, slots) in readers.open.iter_mut() {
                closed += slots.idle.len();
                slots.idle.clear();
                if slots.checked_out > 0 {
                    errors.push(DomainError::ResourceInUse(format!(
                        "{} readers on file {}",
                        slots.checked_out, key
                    )));
                }
            }
            readers.open.retain(|_, slots| slots.checked_out > 0);
        }
        for _ in 0..closed {
            self.release_descriptor();
        }
        DomainError::aggregate(errors)
    }

    pub(crate) fn release_writer(&self, key: u16, file: File) {
        {
            let mut pool = self.writers.lock();
            match pool.open.get_mut(&key) {
                Some(slot) if !self.closed.load(Ordering::SeqCst) => {
                    *slot = WriterSlot::Idle(file);
                }
                _ => {
                    pool.open.remove(&key);
                    drop(file);
                    self.release_descriptor();
                    return;
                }
            }
        }
        self.signal();
    }

    pub(crate) fn release_reader(&self, key: u16, file: File) {
        {
            let mut pool = self.readers.lock();
            let closed = self.closed.load(Ordering::SeqCst);
            match pool.open.get_mut(&key) {
                Some(slots) => {
                    slots.checked_out = slots.checked_out.saturating_sub(1);
                    if closed {
                        drop(file);
                        self.release_descriptor();
                        return;
                    }
                    slots.idle.push_back(file);
                }
                None => {
                    drop(file);
                    self.release_descriptor();
                    return;
                }
            }
        }
        self.signal();
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DomainError::ResourceClosed("domain.file_controller"));
        }
        Ok(())
    }

    fn reserve_descriptor(&self) -> bool {
        self.descriptors
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.max_descriptors).then_some(n + 1)
            })
            .is_ok()
    }

    fn release_descriptor(&self) {
        let _ = self
            .descriptors
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        self.signal();
    }

    fn signal(&self) {
        // A full channel already holds enough wake-ups for every waiter
        let _ = self.release_tx.try_send(());
    }

    fn wait_for_release(&self) -> Result<()> {
        self.release_rx
            .recv()
            .map_err(|_| DomainError::Internal("file release channel disconnected".to_string()))
    }
}
