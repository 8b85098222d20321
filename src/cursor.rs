//! Stack-machine cursor over the hybrid page/node view of a bucket.

use smallvec::SmallVec;

use crate::error::{Result, SableError};
use crate::node::NodeData;
use crate::page::{self, Pgid};
use crate::tx::Tx;

/// One element of the descent stack: a page or shadowing node plus the
/// element index within it.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ElemRef {
    pub elem: Elem,
    pub index: usize,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Elem {
    Page(Pgid),
    Node(usize),
    /// Root of a bucket that has no pages yet.
    Empty,
}

/// A cursor positioned inside one bucket's key space.
///
/// Navigation reads the committed pages of the snapshot, shadowed by any
/// leaf nodes this transaction has materialized. Keys are yielded in
/// lexicographic order.
pub struct Cursor<'tx> {
    tx: &'tx Tx<'tx>,
    bucket: usize,
    stack: SmallVec<[ElemRef; 8]>,
}

impl<'tx> Cursor<'tx> {
    pub(crate) fn new(tx: &'tx Tx<'tx>, bucket: usize) -> Self {
        Self {
            tx,
            bucket,
            stack: SmallVec::new(),
        }
    }

    pub(crate) fn bucket_idx(&self) -> usize {
        self.bucket
    }

    pub(crate) fn tx(&self) -> &'tx Tx<'tx> {
        self.tx
    }

    fn root_elem(&self) -> Result<Elem> {
        let state = self.tx.state_ref();
        let bucket = &state.buckets[self.bucket];
        let root = bucket.header.root;
        if let Some(&idx) = bucket.nodes.get(&root) {
            return Ok(Elem::Node(idx));
        }
        if root == 0 {
            return Ok(Elem::Empty);
        }
        Ok(Elem::Page(root))
    }

    fn elem_count(&self, elem: Elem) -> Result<usize> {
        match elem {
            Elem::Page(pgid) => {
                let buf = self.tx.page(pgid)?;
                Ok(page::PageInfo::parse(buf)?.count as usize)
            }
            Elem::Node(idx) => Ok(self.tx.state_ref().nodes[idx].inodes.len()),
            Elem::Empty => Ok(0),
        }
    }

    fn elem_is_leaf(&self, elem: Elem) -> Result<bool> {
        match elem {
            Elem::Page(pgid) => {
                let buf = self.tx.page(pgid)?;
                let info = page::PageInfo::parse(buf)?;
                if info.flags & page::LEAF_PAGE != 0 {
                    Ok(true)
                } else if info.flags & page::BRANCH_PAGE != 0 {
                    Ok(false)
                } else {
                    Err(SableError::Corruption("cursor descended into non-tree page"))
                }
            }
            Elem::Node(_) | Elem::Empty => Ok(true),
        }
    }

    fn child_at(&self, elem: Elem, index: usize) -> Result<Elem> {
        let pgid = match elem {
            Elem::Page(p) => {
                let buf = self.tx.page(p)?;
                page::branch_elem(buf, index)?.1
            }
            _ => return Err(SableError::Corruption("leaf treated as branch")),
        };
        let state = self.tx.state_ref();
        if let Some(&idx) = state.buckets[self.bucket].nodes.get(&pgid) {
            return Ok(Elem::Node(idx));
        }
        Ok(Elem::Page(pgid))
    }

    fn branch_key(&self, elem: Elem, index: usize) -> Result<Vec<u8>> {
        match elem {
            Elem::Page(p) => {
                let buf = self.tx.page(p)?;
                Ok(page::branch_elem(buf, index)?.0.to_vec())
            }
            _ => Err(SableError::Corruption("leaf treated as branch")),
        }
    }

    fn leaf_tuple(&self, elem: Elem, index: usize) -> Result<(u32, Vec<u8>, Vec<u8>)> {
        match elem {
            Elem::Page(p) => {
                let buf = self.tx.page(p)?;
                let (flags, key, value) = page::leaf_elem(buf, index)?;
                Ok((flags, key.to_vec(), value.to_vec()))
            }
            Elem::Node(idx) => {
                let state = self.tx.state_ref();
                let inode = &state.nodes[idx].inodes[index];
                Ok((inode.flags, inode.key.clone(), inode.value.clone()))
            }
            Elem::Empty => Err(SableError::Corruption("leaf read from empty bucket root")),
        }
    }

    fn leaf_key(&self, elem: Elem, index: usize) -> Result<Vec<u8>> {
        match elem {
            Elem::Page(p) => {
                let buf = self.tx.page(p)?;
                Ok(page::leaf_elem(buf, index)?.1.to_vec())
            }
            Elem::Node(idx) => {
                let state = self.tx.state_ref();
                Ok(state.nodes[idx].inodes[index].key.clone())
            }
            Elem::Empty => Err(SableError::Corruption("leaf read from empty bucket root")),
        }
    }

    /// Current slot as `(key, value, flags)`; `None` keys past the end.
    pub(crate) fn key_value(&self) -> Result<(Option<Vec<u8>>, Option<Vec<u8>>, u32)> {
        let top = match self.stack.last() {
            Some(top) => *top,
            None => return Ok((None, None, 0)),
        };
        if top.index >= self.elem_count(top.elem)? {
            return Ok((None, None, 0));
        }
        let (flags, key, value) = self.leaf_tuple(top.elem, top.index)?;
        Ok((Some(key), Some(value), flags))
    }

    fn descend_first(&mut self) -> Result<()> {
        loop {
            let top = *self.stack.last().expect("descend on empty stack");
            if self.elem_is_leaf(top.elem)? {
                return Ok(());
            }
            let child = self.child_at(top.elem, top.index)?;
            self.stack.push(ElemRef {
                elem: child,
                index: 0,
            });
        }
    }

    fn descend_last(&mut self) -> Result<()> {
        loop {
            let top = *self.stack.last().expect("descend on empty stack");
            if self.elem_is_leaf(top.elem)? {
                let count = self.elem_count(top.elem)?;
                let last = self.stack.last_mut().unwrap();
                last.index = count.saturating_sub(1);
                return Ok(());
            }
            let child = self.child_at(top.elem, top.index)?;
            let count = self.elem_count(child)?;
            self.stack.push(ElemRef {
                elem: child,
                index: count.saturating_sub(1),
            });
        }
    }

    /// Positions at the first key.
    pub fn first(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.tx.check_open()?;
        self.stack.clear();
        self.stack.push(ElemRef {
            elem: self.root_elem()?,
            index: 0,
        });
        self.descend_first()?;
        let top = *self.stack.last().unwrap();
        if top.index >= self.elem_count(top.elem)? {
            return self.next();
        }
        self.current_kv()
    }

    /// Positions at the last key.
    pub fn last(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.tx.check_open()?;
        self.stack.clear();
        let root = self.root_elem()?;
        let count = self.elem_count(root)?;
        self.stack.push(ElemRef {
            elem: root,
            index: count.saturating_sub(1),
        });
        self.descend_last()?;
        self.current_kv()
    }

    /// Advances to the next key in order.
    pub fn next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.tx.check_open()?;
        loop {
            let mut level = self.stack.len();
            while level > 0 {
                let e = self.stack[level - 1];
                if e.index + 1 < self.elem_count(e.elem)? {
                    break;
                }
                level -= 1;
            }
            if level == 0 {
                // Park past the end so key_value reports no slot.
                if let Some(top) = self.stack.last() {
                    let count = self.elem_count(top.elem)?;
                    self.stack.last_mut().unwrap().index = count;
                }
                return Ok(None);
            }
            self.stack[level - 1].index += 1;
            self.stack.truncate(level);
            self.descend_first()?;
            let top = *self.stack.last().unwrap();
            if top.index < self.elem_count(top.elem)? {
                return self.current_kv();
            }
        }
    }

    /// Steps back to the previous key in order.
    pub fn prev(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.tx.check_open()?;
        loop {
            let mut level = self.stack.len();
            while level > 0 {
                if self.stack[level - 1].index > 0 {
                    break;
                }
                level -= 1;
            }
            if level == 0 {
                return Ok(None);
            }
            self.stack[level - 1].index -= 1;
            self.stack.truncate(level);
            if self.elem_is_leaf(self.stack[level - 1].elem)? {
                return self.current_kv();
            }
            self.descend_last()?;
            let top = *self.stack.last().unwrap();
            if top.index < self.elem_count(top.elem)? {
                return self.current_kv();
            }
        }
    }

    fn current_kv(&self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let (key, value, _) = self.key_value()?;
        Ok(key.zip(value))
    }

    /// Moves to the slot a lookup for `key` lands on: the first slot with
    /// key >= `key`, or past-end after all smaller keys.
    pub(crate) fn seek_to(&mut self, key: &[u8]) -> Result<()> {
        self.stack.clear();
        let mut elem = self.root_elem()?;
        loop {
            if self.elem_is_leaf(elem)? {
                let count = self.elem_count(elem)?;
                let mut lo = 0usize;
                let mut hi = count;
                while lo < hi {
                    let mid = (lo + hi) / 2;
                    if self.leaf_key(elem, mid)?.as_slice() < key {
                        lo = mid + 1;
                    } else {
                        hi = mid;
                    }
                }
                self.stack.push(ElemRef { elem, index: lo });
                return Ok(());
            }
            let count = self.elem_count(elem)?;
            // Greatest child whose separator is <= key, clamped to 0.
            let mut lo = 0usize;
            let mut hi = count;
            while lo < hi {
                let mid = (lo + hi) / 2;
                if self.branch_key(elem, mid)?.as_slice() <= key {
                    lo = mid + 1;
                } else {
                    hi = mid;
                }
            }
            let index = lo.saturating_sub(1);
            self.stack.push(ElemRef { elem, index });
            elem = self.child_at(elem, index)?;
        }
    }

    /// Seeks to `key`, returning the slot landed on (the first key >=
    /// `key`), rolling into the next leaf when the landing is past-end.
    pub fn seek(&mut self, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.tx.check_open()?;
        self.seek_to(key)?;
        let top = *self.stack.last().unwrap();
        if top.index >= self.elem_count(top.elem)? {
            return self.next();
        }
        self.current_kv()
    }

    /// Materializes the leaf under the cursor for mutation and returns
    /// its node arena index.
    pub(crate) fn node(&mut self) -> Result<usize> {
        self.tx.require_writable()?;
        let top = *self
            .stack
            .last()
            .ok_or(SableError::Invalid("cursor is not positioned"))?;
        if !self.elem_is_leaf(top.elem)? {
            return Err(SableError::Corruption("cursor stack top is not a leaf"));
        }
        let idx = match top.elem {
            Elem::Node(idx) => idx,
            Elem::Empty => {
                let mut state = self.tx.state_mut();
                let idx = state.nodes.len();
                state.nodes.push(NodeData::empty(0));
                state.buckets[self.bucket].nodes.insert(0, idx);
                idx
            }
            Elem::Page(pgid) => {
                let node = NodeData::from_page(self.tx.page(pgid)?)?;
                let mut state = self.tx.state_mut();
                let idx = state.nodes.len();
                state.nodes.push(node);
                state.buckets[self.bucket].nodes.insert(pgid, idx);
                idx
            }
        };
        self.stack.last_mut().unwrap().elem = Elem::Node(idx);
        Ok(idx)
    }
}
