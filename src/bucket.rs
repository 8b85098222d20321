//! Buckets: named sub-trees of the host B+tree.
//!
//! A bucket's value in its parent is a 16-byte header holding its root
//! page id and sequence counter; a root of zero marks a bucket that has
//! not materialized any pages yet.

use std::collections::{BTreeMap, HashMap};

use crate::cursor::{Cursor, Elem};
use crate::error::{Result, SableError};
use crate::meta::BucketHeader;
use crate::node::{self, Inode};
use crate::page::{self, Pgid, MAX_KEY_SIZE, MAX_VALUE_SIZE};
use crate::tx::Tx;

/// Per-transaction state of one opened bucket.
pub(crate) struct BucketData {
    pub header: BucketHeader,
    pub parent: Option<(usize, Vec<u8>)>,
    /// Materialized leaf nodes shadowing committed pages, by page id.
    pub nodes: HashMap<Pgid, usize>,
    /// Opened sub-buckets by name.
    pub children: BTreeMap<Vec<u8>, usize>,
    /// Opened radix buckets by name, indexing `TxState::radixes`.
    pub radixes: BTreeMap<Vec<u8>, usize>,
    pub seq_dirty: bool,
}

impl BucketData {
    pub fn new(header: BucketHeader, parent: Option<(usize, Vec<u8>)>) -> Self {
        Self {
            header,
            parent,
            nodes: HashMap::new(),
            children: BTreeMap::new(),
            radixes: BTreeMap::new(),
            seq_dirty: false,
        }
    }
}

/// Handle to a bucket within a transaction.
#[derive(Clone, Copy)]
pub struct Bucket<'tx> {
    pub(crate) tx: &'tx Tx<'tx>,
    pub(crate) idx: usize,
}

impl<'tx> Bucket<'tx> {
    pub(crate) fn from_parts(tx: &'tx Tx<'tx>, idx: usize) -> Self {
        Self { tx, idx }
    }

    pub fn writable(&self) -> bool {
        self.tx.writable()
    }

    /// A cursor over this bucket's keys.
    pub fn cursor(&self) -> Cursor<'tx> {
        Cursor::new(self.tx, self.idx)
    }

    /// Looks up a plain value; bucket and radix slots read as absent.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.tx.check_open()?;
        if key.is_empty() || key.len() > MAX_KEY_SIZE {
            return Ok(None);
        }
        let mut cursor = self.cursor();
        cursor.seek_to(key)?;
        let (k, v, flags) = cursor.key_value()?;
        match (k, v) {
            (Some(k), Some(v)) if k == key && flags == 0 => Ok(Some(v)),
            _ => Ok(None),
        }
    }

    /// Stores a plain key-value pair.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.tx.require_writable()?;
        if key.is_empty() {
            return Err(SableError::KeyRequired);
        } else if key.len() > MAX_KEY_SIZE {
            return Err(SableError::KeyTooLarge);
        } else if value.len() > MAX_VALUE_SIZE {
            return Err(SableError::ValueTooLarge);
        }
        let mut cursor = self.cursor();
        cursor.seek_to(key)?;
        let (k, _, flags) = cursor.key_value()?;
        if k.as_deref() == Some(key) && flags != 0 {
            return Err(SableError::IncompatibleValue);
        }
        let node_idx = cursor.node()?;
        self.tx.state_mut().nodes[node_idx].put(key, value, 0);
        Ok(())
    }

    /// Removes a plain key-value pair; deleting a bucket or radix slot
    /// through this path is refused.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.tx.require_writable()?;
        let mut cursor = self.cursor();
        cursor.seek_to(key)?;
        let (k, _, flags) = cursor.key_value()?;
        if k.as_deref() != Some(key) {
            return Ok(());
        }
        if flags != 0 {
            return Err(SableError::IncompatibleValue);
        }
        let node_idx = cursor.node()?;
        self.tx.state_mut().nodes[node_idx].del(key);
        Ok(())
    }

    /// Opens a nested bucket, or returns `None` if the key is absent or
    /// names something that is not a bucket.
    pub fn bucket(&self, name: &[u8]) -> Result<Option<Bucket<'tx>>> {
        self.tx.check_open()?;
        if name.is_empty() {
            return Ok(None);
        }
        if let Some(&child) = self.tx.state_ref().buckets[self.idx].children.get(name) {
            return Ok(Some(Bucket::from_parts(self.tx, child)));
        }
        let mut cursor = self.cursor();
        cursor.seek_to(name)?;
        let (k, v, flags) = cursor.key_value()?;
        let value = match (k, v) {
            (Some(k), Some(v)) if k == name && flags & page::BUCKET_LEAF_FLAG != 0 => v,
            _ => return Ok(None),
        };
        let header = BucketHeader::decode(&value)?;
        Ok(Some(self.register_child(name, header)))
    }

    /// Creates a nested bucket; fails if the key already exists.
    pub fn create_bucket(&self, name: &[u8]) -> Result<Bucket<'tx>> {
        self.tx.require_writable()?;
        if name.is_empty() {
            return Err(SableError::BucketNameRequired);
        } else if name.len() > MAX_KEY_SIZE {
            return Err(SableError::KeyTooLarge);
        }
        let mut cursor = self.cursor();
        cursor.seek_to(name)?;
        let (k, _, flags) = cursor.key_value()?;
        if k.as_deref() == Some(name) {
            if flags & page::BUCKET_LEAF_FLAG != 0 {
                return Err(SableError::BucketExists);
            }
            return Err(SableError::IncompatibleValue);
        }
        let header = BucketHeader::default();
        let node_idx = cursor.node()?;
        self.tx.state_mut().nodes[node_idx].put(
            name,
            &header.encode(),
            page::BUCKET_LEAF_FLAG,
        );
        Ok(self.register_child(name, header))
    }

    pub fn create_bucket_if_not_exists(&self, name: &[u8]) -> Result<Bucket<'tx>> {
        match self.create_bucket(name) {
            Err(SableError::BucketExists) => Ok(self
                .bucket(name)?
                .expect("existing bucket must open")),
            other => other,
        }
    }

    /// Deletes a nested bucket and frees its committed pages, including
    /// the trees of any buckets nested below it.
    pub fn delete_bucket(&self, name: &[u8]) -> Result<()> {
        self.tx.require_writable()?;
        if name.is_empty() {
            return Err(SableError::BucketNameRequired);
        }
        let mut cursor = self.cursor();
        cursor.seek_to(name)?;
        let (k, v, flags) = cursor.key_value()?;
        let value = match (k, v) {
            (Some(k), Some(v)) if k == name => {
                if flags & page::BUCKET_LEAF_FLAG == 0 {
                    return Err(SableError::IncompatibleValue);
                }
                v
            }
            _ => return Err(SableError::BucketNotFound),
        };
        let header = BucketHeader::decode(&value)?;
        free_bucket_tree(self.tx, header.root)?;
        self.tx.state_mut().buckets[self.idx].children.remove(name);
        let node_idx = cursor.node()?;
        self.tx.state_mut().nodes[node_idx].del(name);
        Ok(())
    }

    pub fn sequence(&self) -> u64 {
        self.tx.state_ref().buckets[self.idx].header.sequence
    }

    pub fn set_sequence(&self, value: u64) -> Result<()> {
        self.tx.require_writable()?;
        let mut state = self.tx.state_mut();
        let data = &mut state.buckets[self.idx];
        data.header.sequence = value;
        data.seq_dirty = true;
        Ok(())
    }

    pub fn next_sequence(&self) -> Result<u64> {
        self.tx.require_writable()?;
        let mut state = self.tx.state_mut();
        let data = &mut state.buckets[self.idx];
        data.header.sequence += 1;
        data.seq_dirty = true;
        Ok(data.header.sequence)
    }

    fn register_child(&self, name: &[u8], header: BucketHeader) -> Bucket<'tx> {
        let mut state = self.tx.state_mut();
        let child = state.buckets.len();
        state
            .buckets
            .push(BucketData::new(header, Some((self.idx, name.to_vec()))));
        state.buckets[self.idx].children.insert(name.to_vec(), child);
        Bucket::from_parts(self.tx, child)
    }
}

/// Inserts a raw entry through the normal cursor/node path.
pub(crate) fn put_raw(
    tx: &Tx<'_>,
    bucket: usize,
    key: &[u8],
    value: &[u8],
    flags: u32,
) -> Result<()> {
    let mut cursor = Cursor::new(tx, bucket);
    cursor.seek_to(key)?;
    let node_idx = cursor.node()?;
    tx.state_mut().nodes[node_idx].put(key, value, flags);
    Ok(())
}

fn is_dirty(tx: &Tx<'_>, idx: usize) -> bool {
    let state = tx.state_ref();
    let data = &state.buckets[idx];
    if !data.nodes.is_empty() || data.seq_dirty {
        return true;
    }
    let children: Vec<usize> = data.children.values().copied().collect();
    drop(state);
    children.into_iter().any(|child| is_dirty(tx, child))
}

/// Commit-time spill: children first, then a rebuild of this bucket's
/// own tree from the merged page/node view. Returns the new root.
pub(crate) fn spill_bucket(tx: &Tx<'_>, idx: usize) -> Result<Pgid> {
    let children: Vec<(Vec<u8>, usize)> = {
        let state = tx.state_ref();
        state.buckets[idx]
            .children
            .iter()
            .map(|(name, &child)| (name.clone(), child))
            .collect()
    };
    for (name, child) in children {
        if !is_dirty(tx, child) {
            continue;
        }
        let root = spill_bucket(tx, child)?;
        let header = {
            let mut state = tx.state_mut();
            let data = &mut state.buckets[child];
            data.header.root = root;
            data.header
        };
        put_raw(tx, idx, &name, &header.encode(), page::BUCKET_LEAF_FLAG)?;
    }

    let (old_root, has_nodes) = {
        let state = tx.state_ref();
        let data = &state.buckets[idx];
        (data.header.root, !data.nodes.is_empty())
    };
    if !has_nodes {
        return Ok(old_root);
    }

    let mut entries = Vec::new();
    let root_elem = {
        let state = tx.state_ref();
        let data = &state.buckets[idx];
        match data.nodes.get(&old_root) {
            Some(&node) => Elem::Node(node),
            None if old_root == 0 => Elem::Empty,
            None => Elem::Page(old_root),
        }
    };
    collect_entries(tx, idx, root_elem, &mut entries)?;
    free_structure(tx, old_root)?;

    let leaves = node::build_leaf_pages(tx, &entries)?;
    let root = if leaves.is_empty() {
        if idx == 0 {
            // The root bucket always keeps a (possibly empty) leaf page.
            node::write_empty_leaf(tx)?
        } else {
            0
        }
    } else {
        node::build_branch_levels(tx, leaves)?
    };
    Ok(root)
}

/// In-order walk over the hybrid page/node tree collecting leaf entries.
fn collect_entries(tx: &Tx<'_>, bucket: usize, elem: Elem, out: &mut Vec<Inode>) -> Result<()> {
    match elem {
        Elem::Empty => Ok(()),
        Elem::Node(idx) => {
            let state = tx.state_ref();
            out.extend(state.nodes[idx].inodes.iter().cloned());
            Ok(())
        }
        Elem::Page(pgid) => {
            let buf = tx.page(pgid)?;
            let info = page::PageInfo::parse(buf)?;
            if info.flags & page::LEAF_PAGE != 0 {
                for i in 0..info.count as usize {
                    let (flags, key, value) = page::leaf_elem(buf, i)?;
                    out.push(Inode {
                        flags,
                        key: key.to_vec(),
                        value: value.to_vec(),
                    });
                }
                return Ok(());
            }
            if info.flags & page::BRANCH_PAGE == 0 {
                return Err(SableError::Corruption("bucket walk hit a non-tree page"));
            }
            let mut child_pgids = Vec::with_capacity(info.count as usize);
            for i in 0..info.count as usize {
                child_pgids.push(page::branch_elem(buf, i)?.1);
            }
            for child in child_pgids {
                let child_elem = {
                    let state = tx.state_ref();
                    match state.buckets[bucket].nodes.get(&child) {
                        Some(&node) => Elem::Node(node),
                        None => Elem::Page(child),
                    }
                };
                collect_entries(tx, bucket, child_elem, out)?;
            }
            Ok(())
        }
    }
}

/// Frees the structural pages (branches and leaves) of a committed tree,
/// leaving nested bucket and radix trees referenced by values alone.
fn free_structure(tx: &Tx<'_>, root: Pgid) -> Result<()> {
    if root == 0 {
        return Ok(());
    }
    let children = {
        let buf = tx.page(root)?;
        let info = page::PageInfo::parse(buf)?;
        if info.flags & page::BRANCH_PAGE != 0 {
            let mut pgids = Vec::with_capacity(info.count as usize);
            for i in 0..info.count as usize {
                pgids.push(page::branch_elem(buf, i)?.1);
            }
            pgids
        } else {
            Vec::new()
        }
    };
    for child in children {
        free_structure(tx, child)?;
    }
    tx.free(root)
}

/// Frees a deleted bucket's tree, recursing into nested buckets. Radix
/// slots are skipped: reclaiming a radix tree on bucket delete is left
/// to the host surface.
fn free_bucket_tree(tx: &Tx<'_>, root: Pgid) -> Result<()> {
    if root == 0 {
        return Ok(());
    }
    enum Walk {
        Branch(Vec<Pgid>),
        Leaf(Vec<Pgid>),
    }
    let walk = {
        let buf = tx.page(root)?;
        let info = page::PageInfo::parse(buf)?;
        if info.flags & page::BRANCH_PAGE != 0 {
            let mut pgids = Vec::with_capacity(info.count as usize);
            for i in 0..info.count as usize {
                pgids.push(page::branch_elem(buf, i)?.1);
            }
            Walk::Branch(pgids)
        } else {
            let mut nested = Vec::new();
            for i in 0..info.count as usize {
                let (flags, _, value) = page::leaf_elem(buf, i)?;
                if flags & page::BUCKET_LEAF_FLAG != 0 {
                    nested.push(BucketHeader::decode(value)?.root);
                }
            }
            Walk::Leaf(nested)
        }
    };
    match walk {
        Walk::Branch(children) => {
            for child in children {
                free_bucket_tree(tx, child)?;
            }
        }
        Walk::Leaf(nested_roots) => {
            for nested in nested_roots {
                free_bucket_tree(tx, nested)?;
            }
        }
    }
    tx.free(root)
}
