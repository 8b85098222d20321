//! Transactions: snapshot readers and the single copy-on-write writer.

use std::cell::{Cell, Ref, RefCell, RefMut};
use std::collections::BTreeMap;
use std::sync::Arc;

use memmap2::Mmap;
use parking_lot::MutexGuard;
use tracing::{debug, warn};

use crate::bucket::{self, Bucket, BucketData};
use crate::db::DB;
use crate::error::{Result, SableError};
use crate::freelist::Freelist;
use crate::meta::Meta;
use crate::node::NodeData;
use crate::page::{self, Pgid, PAGE_HDR_LEN};
use crate::radix::{self, RadixBucket};

pub(crate) struct TxState {
    /// Pages allocated this transaction, keyed by first page id of the run.
    pub dirty: BTreeMap<Pgid, Vec<u8>>,
    /// Arena of materialized leaf nodes.
    pub nodes: Vec<NodeData>,
    /// Arena of opened buckets; index 0 is the root bucket.
    pub buckets: Vec<BucketData>,
    /// Opened radix buckets, in open order.
    pub radixes: Vec<std::rc::Rc<RefCell<radix::RadixInner>>>,
}

/// A transaction over one committed snapshot of the store.
///
/// Read-only transactions are cheap and may overlap freely; the single
/// writable transaction owns all heap mutation until `commit` makes it
/// durable or `rollback` discards it. A `Tx` is not `Sync`: it must stay
/// on the thread that began it.
pub struct Tx<'db> {
    db: &'db DB,
    data: Arc<Mmap>,
    pub(crate) meta: RefCell<Meta>,
    writable: bool,
    open: Cell<bool>,
    pub(crate) state: RefCell<TxState>,
    _write_guard: Option<MutexGuard<'db, ()>>,
}

impl<'db> Tx<'db> {
    pub(crate) fn new(
        db: &'db DB,
        meta: Meta,
        data: Arc<Mmap>,
        writable: bool,
        write_guard: Option<MutexGuard<'db, ()>>,
    ) -> Self {
        let root = BucketData::new(meta.root, None);
        Tx {
            db,
            data,
            meta: RefCell::new(meta),
            writable,
            open: Cell::new(true),
            state: RefCell::new(TxState {
                dirty: BTreeMap::new(),
                nodes: Vec::new(),
                buckets: vec![root],
                radixes: Vec::new(),
            }),
            _write_guard: write_guard,
        }
    }

    pub fn id(&self) -> u64 {
        self.meta.borrow().txid
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn page_size(&self) -> usize {
        self.db.page_size()
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if !self.open.get() {
            return Err(SableError::TxClosed);
        }
        Ok(())
    }

    pub(crate) fn require_writable(&self) -> Result<()> {
        self.check_open()?;
        if !self.writable {
            return Err(SableError::TxNotWritable);
        }
        Ok(())
    }

    /// Returns the full committed page run (page plus overflow pages).
    pub(crate) fn page(&self, id: Pgid) -> Result<&[u8]> {
        let page_size = self.page_size();
        let off = id as usize * page_size;
        if off + PAGE_HDR_LEN > self.data.len() {
            return Err(SableError::Corruption("page beyond mapped region"));
        }
        let info = page::PageInfo::parse(&self.data[off..off + PAGE_HDR_LEN])?;
        let run = info.run_len() * page_size;
        if off + run > self.data.len() {
            return Err(SableError::Corruption("page run beyond mapped region"));
        }
        Ok(&self.data[off..off + run])
    }

    /// Allocates a zeroed run of `n` pages for this transaction.
    pub(crate) fn allocate(&self, n: usize) -> Result<Pgid> {
        self.require_writable()?;
        if n == 0 {
            return Err(SableError::Invalid("zero-length page allocation"));
        }
        let pgid = {
            let mut db_state = self.db.state();
            match db_state.freelist.allocate(n) {
                Some(id) => id,
                None => {
                    let mut meta = self.meta.borrow_mut();
                    let id = meta.pgid;
                    meta.pgid += n as u64;
                    id
                }
            }
        };
        let buf = vec![0u8; n * self.page_size()];
        self.state.borrow_mut().dirty.insert(pgid, buf);
        Ok(pgid)
    }

    /// Gives mutable access to a page run allocated by this transaction.
    pub(crate) fn with_dirty<T>(&self, pgid: Pgid, f: impl FnOnce(&mut [u8]) -> T) -> Result<T> {
        let mut state = self.state.borrow_mut();
        let buf = state
            .dirty
            .get_mut(&pgid)
            .ok_or(SableError::Corruption("dirty page missing"))?;
        Ok(f(buf))
    }

    /// Frees a committed page run at this transaction's id.
    pub(crate) fn free(&self, pgid: Pgid) -> Result<()> {
        let overflow = {
            let buf = self.page(pgid)?;
            page::PageInfo::parse(buf)?.overflow
        };
        let txid = self.id();
        self.db.state().freelist.free(txid, pgid, overflow)
    }

    pub(crate) fn state_ref(&self) -> Ref<'_, TxState> {
        self.state.borrow()
    }

    pub(crate) fn state_mut(&self) -> RefMut<'_, TxState> {
        self.state.borrow_mut()
    }

    /// The root bucket of this transaction.
    pub fn root(&self) -> Bucket<'_> {
        Bucket::from_parts(self, 0)
    }

    /// Opens a named bucket under the root bucket.
    pub fn bucket(&self, name: &[u8]) -> Result<Option<Bucket<'_>>> {
        self.root().bucket(name)
    }

    pub fn create_bucket(&self, name: &[u8]) -> Result<Bucket<'_>> {
        self.root().create_bucket(name)
    }

    pub fn create_bucket_if_not_exists(&self, name: &[u8]) -> Result<Bucket<'_>> {
        self.root().create_bucket_if_not_exists(name)
    }

    pub fn delete_bucket(&self, name: &[u8]) -> Result<()> {
        self.root().delete_bucket(name)
    }

    /// Opens a named radix bucket under the root bucket.
    pub fn radix_bucket(&self, name: &[u8]) -> Result<Option<RadixBucket<'_>>> {
        self.root().radix_bucket(name)
    }

    pub fn create_radix_bucket(&self, name: &[u8]) -> Result<RadixBucket<'_>> {
        self.root().create_radix_bucket(name)
    }

    pub fn create_radix_bucket_if_not_exists(&self, name: &[u8]) -> Result<RadixBucket<'_>> {
        self.root().create_radix_bucket_if_not_exists(name)
    }

    /// Commits all staged changes: radix spills, bucket spills, the
    /// freelist rewrite, page writes, and finally the meta swap.
    pub fn commit(self) -> Result<()> {
        self.require_writable()?;
        match self.commit_inner() {
            Ok(()) => {
                self.open.set(false);
                Ok(())
            }
            Err(err) => {
                self.rollback_write();
                self.open.set(false);
                Err(err)
            }
        }
    }

    fn commit_inner(&self) -> Result<()> {
        radix::spill_radixes(self)?;
        let new_root = bucket::spill_bucket(self, 0)?;
        {
            let mut meta = self.meta.borrow_mut();
            meta.root.root = new_root;
            meta.root.sequence = self.state.borrow().buckets[0].header.sequence;
        }

        // Rewrite the freelist onto fresh pages.
        let old_freelist = self.meta.borrow().freelist;
        self.free(old_freelist)?;
        let count = {
            let db_state = self.db.state();
            db_state.freelist.free_count() + db_state.freelist.pending_count()
        };
        let page_size = self.page_size();
        let npages = Freelist::page_size_for(count).div_ceil(page_size);
        let fl_pgid = self.allocate(npages)?;
        let ids = self.db.state().freelist.copy_all();
        self.with_dirty(fl_pgid, |buf| {
            Freelist::write(buf, fl_pgid, (npages - 1) as u32, &ids)
        })?;
        self.meta.borrow_mut().freelist = fl_pgid;

        // Data pages first, then the meta swap; each barriered by a sync.
        let dirty = std::mem::take(&mut self.state.borrow_mut().dirty);
        let dirty_count = dirty.len();
        let meta = self.meta.borrow().clone();
        self.db.write_pages(meta.pgid, dirty.into_iter())?;
        self.db.sync()?;

        let mut meta_buf = vec![0u8; page_size];
        meta.write_page(&mut meta_buf)?;
        self.db
            .write_pages(meta.pgid, std::iter::once((meta.txid % 2, meta_buf)))?;
        self.db.sync()?;

        self.db.publish(meta.clone())?;
        debug!(tx_id = meta.txid, dirty_pages = dirty_count, "transaction committed");
        Ok(())
    }

    /// Abandons the transaction, discarding all staged changes.
    pub fn rollback(self) -> Result<()> {
        self.check_open()?;
        self.close_out();
        Ok(())
    }

    fn close_out(&self) {
        if self.writable {
            self.rollback_write();
        } else {
            self.db.release_reader(self.id());
        }
        self.open.set(false);
    }

    fn rollback_write(&self) {
        let txid = self.id();
        debug!(tx_id = txid, "write transaction rolled back");
        let mut db_state = self.db.state();
        db_state.freelist.rollback(txid);
        let committed_freelist = db_state.meta.freelist;
        drop(db_state);
        // Reconstruct the allocatable set from the committed freelist
        // page; allocations taken by this transaction reappear there.
        match self.page(committed_freelist) {
            Ok(buf) => {
                let buf = buf.to_vec();
                if let Err(err) = self.db.state().freelist.reload(&buf) {
                    warn!(error = %err, "freelist reload after rollback failed");
                }
            }
            Err(err) => warn!(error = %err, "freelist page unreadable after rollback"),
        }
    }
}

impl Drop for Tx<'_> {
    fn drop(&mut self) {
        if self.open.get() {
            self.close_out();
        }
    }
}
