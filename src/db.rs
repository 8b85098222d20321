//! Database handle: file, memory map, meta selection, transaction entry.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use memmap2::Mmap;
use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::{debug, info};

use crate::error::{Result, SableError};
use crate::flock;
use crate::freelist::Freelist;
use crate::meta::{BucketHeader, Meta};
use crate::page::{self, Pgid, PAGE_HDR_LEN};
use crate::tx::Tx;

pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Tunables for opening a database.
#[derive(Clone, Debug)]
pub struct Options {
    /// Page size for a freshly created file; an existing file keeps its own.
    pub page_size: usize,
    pub read_only: bool,
    /// Skip fdatasync on commit. Only safe for throwaway data.
    pub no_sync: bool,
    /// How long to wait for the file lock; `None` waits forever.
    pub lock_timeout: Option<Duration>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            read_only: false,
            no_sync: false,
            lock_timeout: Some(Duration::from_secs(10)),
        }
    }
}

impl Options {
    /// Settings for benchmarks and tests that can lose data on crash.
    pub fn benchmark() -> Self {
        Self {
            no_sync: true,
            ..Self::default()
        }
    }
}

#[derive(Debug)]
pub(crate) struct DbState {
    pub meta: Meta,
    pub freelist: Freelist,
    pub readers: Vec<u64>,
    pub open: bool,
}

/// An embedded single-file key-value store.
///
/// All reads go through a shared read-only memory map; writes are
/// copy-on-write and become visible atomically at commit through the
/// meta page swap. One writable transaction may run at a time,
/// alongside any number of read-only transactions.
#[derive(Debug)]
pub struct DB {
    file: File,
    path: PathBuf,
    options: Options,
    page_size: usize,
    data: RwLock<Arc<Mmap>>,
    state: Mutex<DbState>,
    write_lock: Mutex<()>,
}

impl DB {
    /// Opens or creates a database file.
    pub fn open(path: impl AsRef<Path>, options: Options) -> Result<DB> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(!options.read_only)
            .create(!options.read_only)
            .truncate(false)
            .open(&path)?;
        flock::lock(&file, !options.read_only, options.lock_timeout)?;

        let result = Self::open_locked(file, path, options);
        if let Err(err) = &result {
            debug!(error = %err, "database open failed");
        }
        result
    }

    fn open_locked(file: File, path: PathBuf, options: Options) -> Result<DB> {
        if file.metadata()?.len() == 0 {
            if options.read_only {
                return Err(SableError::DatabaseNotOpen);
            }
            init_file(&file, options.page_size)?;
        }

        let data = Arc::new(unsafe { Mmap::map(&file)? });
        let meta = load_meta(&data)?;
        let page_size = meta.page_size as usize;

        let freelist_off = meta.freelist as usize * page_size;
        if freelist_off + page_size > data.len() {
            return Err(SableError::Corruption("freelist page beyond mapped file"));
        }
        let freelist = Freelist::read(&data[freelist_off..])?;

        info!(path = %path.display(), page_size, txid = meta.txid, "database opened");
        Ok(DB {
            file,
            path,
            options,
            page_size,
            data: RwLock::new(data),
            state: Mutex::new(DbState {
                meta,
                freelist,
                readers: Vec::new(),
                open: true,
            }),
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, DbState> {
        self.state.lock()
    }

    pub(crate) fn current_data(&self) -> Arc<Mmap> {
        Arc::clone(&self.data.read())
    }

    /// Begins a read-only transaction.
    pub fn begin(&self) -> Result<Tx<'_>> {
        let meta = {
            let mut state = self.state.lock();
            if !state.open {
                return Err(SableError::DatabaseNotOpen);
            }
            let meta = state.meta.clone();
            state.readers.push(meta.txid);
            meta
        };
        // Taken after registering the reader: the registration pins the
        // snapshot's pages against freelist release, and the map only grows.
        let data = self.current_data();
        Ok(Tx::new(self, meta, data, false, None))
    }

    /// Begins the read-write transaction; blocks while another one runs.
    pub fn begin_rw(&self) -> Result<Tx<'_>> {
        if self.options.read_only {
            return Err(SableError::DatabaseReadOnly);
        }
        let guard = self.write_lock.lock();
        let meta = {
            let mut state = self.state.lock();
            if !state.open {
                return Err(SableError::DatabaseNotOpen);
            }
            let mut meta = state.meta.clone();
            meta.txid += 1;
            // Pages freed before the oldest live reader are fair game again.
            let min_reader = state.readers.iter().copied().min().unwrap_or(meta.txid);
            state.freelist.release(min_reader);
            meta
        };
        let data = self.current_data();
        debug!(tx_id = meta.txid, "write transaction started");
        Ok(Tx::new(self, meta, data, true, Some(guard)))
    }

    /// Runs a read-only closure inside a transaction.
    pub fn view<T>(&self, f: impl FnOnce(&Tx<'_>) -> Result<T>) -> Result<T> {
        let tx = self.begin()?;
        let result = f(&tx);
        tx.rollback()?;
        result
    }

    /// Runs a closure inside a write transaction, committing on success.
    pub fn update<T>(&self, f: impl FnOnce(&Tx<'_>) -> Result<T>) -> Result<T> {
        let tx = self.begin_rw()?;
        match f(&tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(err) => {
                tx.rollback()?;
                Err(err)
            }
        }
    }

    pub(crate) fn release_reader(&self, txid: u64) {
        let mut state = self.state.lock();
        if let Some(pos) = state.readers.iter().position(|&id| id == txid) {
            state.readers.swap_remove(pos);
        }
    }

    /// Grows the file to hold `pgid` pages and writes dirty page runs.
    pub(crate) fn write_pages(
        &self,
        high_water: Pgid,
        pages: impl Iterator<Item = (Pgid, Vec<u8>)>,
    ) -> Result<()> {
        let needed = high_water * self.page_size as u64;
        if self.file.metadata()?.len() < needed {
            self.file.set_len(needed)?;
        }
        for (pgid, buf) in pages {
            write_all_at(&self.file, &buf, pgid * self.page_size as u64)?;
        }
        Ok(())
    }

    pub(crate) fn sync(&self) -> Result<()> {
        if !self.options.no_sync {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Publishes a committed meta and refreshes the map if the file grew.
    pub(crate) fn publish(&self, meta: Meta) -> Result<()> {
        {
            let mut data = self.data.write();
            if meta.pgid as usize * self.page_size > data.len() {
                *data = Arc::new(unsafe { Mmap::map(&self.file)? });
            }
        }
        // The map is refreshed before the meta becomes visible, so a new
        // reader can never see pages its snapshot cannot reach.
        self.state.lock().meta = meta;
        Ok(())
    }
}

impl Drop for DB {
    fn drop(&mut self) {
        self.state.lock().open = false;
        let _ = flock::unlock(&self.file);
    }
}

fn load_meta(data: &Mmap) -> Result<Meta> {
    let mut best: Option<Meta> = None;
    for i in 0..2usize {
        // The two candidates may disagree on page size, so probe with a
        // fixed stride first and re-read with the real one.
        let probe = probe_meta(data, i, DEFAULT_PAGE_SIZE)
            .or_else(|_| probe_meta_any(data, i))
            .ok();
        if let Some(meta) = probe {
            if best.as_ref().map_or(true, |b| meta.txid > b.txid) {
                best = Some(meta);
            }
        }
    }
    best.ok_or(SableError::Corruption("no valid meta page"))
}

fn probe_meta(data: &[u8], index: usize, page_size: usize) -> Result<Meta> {
    let off = index * page_size;
    if off + page_size > data.len() {
        return Err(SableError::Corruption("meta page truncated"));
    }
    let meta = Meta::read_page(&data[off..off + page_size])?;
    if meta.page_size as usize != page_size {
        return Err(SableError::Corruption("meta page size mismatch"));
    }
    Ok(meta)
}

fn probe_meta_any(data: &[u8], index: usize) -> Result<Meta> {
    // Page size is recorded in meta 0, which always sits at offset 0;
    // decode it leniently to locate meta 1.
    let first = Meta::read_page(data)?;
    probe_meta(data, index, first.page_size as usize)
}

fn init_file(file: &File, page_size: usize) -> Result<()> {
    if page_size < PAGE_HDR_LEN + 64 || page_size % 8 != 0 {
        return Err(SableError::Invalid("unusable page size"));
    }
    let mut buf = vec![0u8; page_size * 4];

    for txid in 0..2u64 {
        let meta = Meta {
            page_size: page_size as u32,
            flags: 0,
            root: BucketHeader { root: 3, sequence: 0 },
            freelist: 2,
            pgid: 4,
            txid,
        };
        let off = txid as usize * page_size;
        meta.write_page(&mut buf[off..off + page_size])?;
    }
    Freelist::write(&mut buf[page_size * 2..], 2, 0, &[]);
    page::write_header(&mut buf[page_size * 3..], 3, page::LEAF_PAGE, 0, 0);

    write_all_at(file, &buf, 0)?;
    file.sync_all()?;
    Ok(())
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], off: u64) -> Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, off)?;
    Ok(())
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut off: u64) -> Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let written = file.seek_write(buf, off)?;
        buf = &buf[written..];
        off += written as u64;
    }
    Ok(())
}
