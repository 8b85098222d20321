//! Materialized leaf nodes and commit-time page construction.
//!
//! Writes never touch mapped pages. A mutation materializes the leaf it
//! lands on into a heap node that shadows the page for the rest of the
//! transaction; commit rebuilds each dirty bucket's tree onto freshly
//! allocated pages from the merged view.

use crate::error::{Result, SableError};
use crate::page::{
    self, Pgid, BRANCH_ELEM_LEN, LEAF_ELEM_LEN, PAGE_HDR_LEN,
};
use crate::tx::Tx;

#[derive(Clone, Debug)]
pub(crate) struct Inode {
    pub flags: u32,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// A leaf page lifted onto the heap for mutation.
#[derive(Debug)]
pub(crate) struct NodeData {
    /// Page id this node shadows; 0 for the root of a pageless bucket.
    pub pgid: Pgid,
    pub inodes: Vec<Inode>,
}

impl NodeData {
    pub fn empty(pgid: Pgid) -> Self {
        Self {
            pgid,
            inodes: Vec::new(),
        }
    }

    pub fn from_page(buf: &[u8]) -> Result<Self> {
        let info = page::PageInfo::parse(buf)?;
        if info.flags & page::LEAF_PAGE == 0 {
            return Err(SableError::Corruption("materializing a non-leaf page"));
        }
        let mut inodes = Vec::with_capacity(info.count as usize);
        for i in 0..info.count as usize {
            let (flags, key, value) = page::leaf_elem(buf, i)?;
            inodes.push(Inode {
                flags,
                key: key.to_vec(),
                value: value.to_vec(),
            });
        }
        Ok(Self {
            pgid: info.id,
            inodes,
        })
    }

    fn search(&self, key: &[u8]) -> std::result::Result<usize, usize> {
        self.inodes.binary_search_by(|inode| inode.key.as_slice().cmp(key))
    }

    /// Inserts or replaces the entry for `key`.
    pub fn put(&mut self, key: &[u8], value: &[u8], flags: u32) {
        let inode = Inode {
            flags,
            key: key.to_vec(),
            value: value.to_vec(),
        };
        match self.search(key) {
            Ok(i) => self.inodes[i] = inode,
            Err(i) => self.inodes.insert(i, inode),
        }
    }

    /// Removes the entry for `key`; reports whether it was present.
    pub fn del(&mut self, key: &[u8]) -> bool {
        match self.search(key) {
            Ok(i) => {
                self.inodes.remove(i);
                true
            }
            Err(_) => false,
        }
    }
}

fn leaf_entry_size(inode: &Inode) -> usize {
    LEAF_ELEM_LEN + inode.key.len() + inode.value.len()
}

fn write_leaf_page(buf: &mut [u8], pgid: Pgid, overflow: u32, entries: &[Inode]) {
    page::write_header(buf, pgid, page::LEAF_PAGE, entries.len() as u16, overflow);
    let mut data_off = PAGE_HDR_LEN + entries.len() * LEAF_ELEM_LEN;
    for (i, inode) in entries.iter().enumerate() {
        let elem_off = PAGE_HDR_LEN + i * LEAF_ELEM_LEN;
        let elem = &mut buf[elem_off..elem_off + LEAF_ELEM_LEN];
        elem[0..4].copy_from_slice(&inode.flags.to_le_bytes());
        elem[4..8].copy_from_slice(&((data_off - elem_off) as u32).to_le_bytes());
        elem[8..12].copy_from_slice(&(inode.key.len() as u32).to_le_bytes());
        elem[12..16].copy_from_slice(&(inode.value.len() as u32).to_le_bytes());
        buf[data_off..data_off + inode.key.len()].copy_from_slice(&inode.key);
        data_off += inode.key.len();
        buf[data_off..data_off + inode.value.len()].copy_from_slice(&inode.value);
        data_off += inode.value.len();
    }
}

fn write_branch_page(buf: &mut [u8], pgid: Pgid, overflow: u32, items: &[(Vec<u8>, Pgid)]) {
    page::write_header(buf, pgid, page::BRANCH_PAGE, items.len() as u16, overflow);
    let mut data_off = PAGE_HDR_LEN + items.len() * BRANCH_ELEM_LEN;
    for (i, (key, child)) in items.iter().enumerate() {
        let elem_off = PAGE_HDR_LEN + i * BRANCH_ELEM_LEN;
        let elem = &mut buf[elem_off..elem_off + BRANCH_ELEM_LEN];
        elem[0..4].copy_from_slice(&((data_off - elem_off) as u32).to_le_bytes());
        elem[4..8].copy_from_slice(&(key.len() as u32).to_le_bytes());
        elem[8..16].copy_from_slice(&child.to_le_bytes());
        buf[data_off..data_off + key.len()].copy_from_slice(key);
        data_off += key.len();
    }
}

/// Writes sorted leaf entries onto fresh pages; returns `(first key,
/// page id)` per page for the branch level above.
pub(crate) fn build_leaf_pages(tx: &Tx<'_>, entries: &[Inode]) -> Result<Vec<(Vec<u8>, Pgid)>> {
    let page_size = tx.page_size();
    let budget = page_size - PAGE_HDR_LEN;
    let mut out = Vec::new();
    let mut start = 0usize;
    let mut used = 0usize;
    for i in 0..=entries.len() {
        let flush = if i == entries.len() {
            i > start
        } else {
            let sz = leaf_entry_size(&entries[i]);
            // A page takes at least one entry, even an oversized one.
            i > start && used + sz > budget
        };
        if flush {
            let chunk = &entries[start..i];
            let total = PAGE_HDR_LEN + chunk.iter().map(leaf_entry_size).sum::<usize>();
            let npages = total.div_ceil(page_size);
            let pgid = tx.allocate(npages)?;
            tx.with_dirty(pgid, |buf| {
                write_leaf_page(buf, pgid, (npages - 1) as u32, chunk)
            })?;
            out.push((chunk[0].key.clone(), pgid));
            start = i;
            used = 0;
        }
        if i < entries.len() {
            used += leaf_entry_size(&entries[i]);
        }
    }
    Ok(out)
}

/// Builds branch levels over `items` until a single root remains.
pub(crate) fn build_branch_levels(
    tx: &Tx<'_>,
    mut items: Vec<(Vec<u8>, Pgid)>,
) -> Result<Pgid> {
    let page_size = tx.page_size();
    let budget = page_size - PAGE_HDR_LEN;
    while items.len() > 1 {
        let mut next = Vec::new();
        let mut start = 0usize;
        let mut used = 0usize;
        for i in 0..=items.len() {
            let flush = if i == items.len() {
                i > start
            } else {
                let sz = BRANCH_ELEM_LEN + items[i].0.len();
                i > start && used + sz > budget
            };
            if flush {
                let chunk = &items[start..i];
                let total = PAGE_HDR_LEN
                    + chunk
                        .iter()
                        .map(|(k, _)| BRANCH_ELEM_LEN + k.len())
                        .sum::<usize>();
                let npages = total.div_ceil(page_size);
                let pgid = tx.allocate(npages)?;
                tx.with_dirty(pgid, |buf| {
                    write_branch_page(buf, pgid, (npages - 1) as u32, chunk)
                })?;
                next.push((chunk[0].0.clone(), pgid));
                start = i;
                used = 0;
            }
            if i < items.len() {
                used += BRANCH_ELEM_LEN + items[i].0.len();
            }
        }
        items = next;
    }
    items
        .pop()
        .map(|(_, pgid)| pgid)
        .ok_or(SableError::Corruption("branch build over empty level"))
}

/// Writes a single, possibly empty, leaf page and returns its id.
pub(crate) fn write_empty_leaf(tx: &Tx<'_>) -> Result<Pgid> {
    let pgid = tx.allocate(1)?;
    tx.with_dirty(pgid, |buf| write_leaf_page(buf, pgid, 0, &[]))?;
    Ok(pgid)
}
