//! Radix tree algorithms over a root that is partly on-page, partly on
//! the heap: lookup, insert, delete, longest-prefix, min/max, and the
//! commit-time persistence walk.

use crate::error::{Result, SableError};
use crate::page::{self, Pgid, PAGE_HDR_LEN};
use crate::radix::addr::{radix_page_payload, RadixAddr};
use crate::radix::node::{
    decode_subtree, edge_search, longest_common_prefix, RadixId, RadixNode, FLAG_INLINED,
};
use crate::tx::Tx;

/// Access handle for one radix tree: the committed root page plus the
/// decoded head once any mutation has touched the tree.
#[derive(Debug, Default)]
pub(crate) struct RadixAccess {
    pub root: Pgid,
    pub head: Option<Box<RadixNode>>,
}

impl RadixAccess {
    pub fn new(root: Pgid) -> Self {
        Self { root, head: None }
    }

    pub fn root_addr<'a>(&'a self, tx: &'a Tx<'a>) -> RadixAddr<'a> {
        RadixAddr {
            tx,
            base: 0,
            node: self.head.as_deref(),
            id: if self.root == 0 {
                RadixId::default()
            } else {
                RadixId::from_pgid(self.root)
            },
        }
    }

    /// Decodes the root subtree onto the heap, freeing its page into the
    /// current transaction's pending set.
    fn decode_root(&mut self, tx: &Tx<'_>) -> Result<()> {
        if self.head.is_some() {
            return Ok(());
        }
        if self.root == 0 {
            self.head = Some(Box::new(RadixNode::default()));
            return Ok(());
        }
        let head = {
            let payload = radix_page_payload(tx, self.root)?;
            decode_subtree(payload, RadixId::default(), true)?
                .ok_or(SableError::Corruption("radix root decodes to nothing"))?
        };
        tx.free(self.root)?;
        self.root = 0;
        self.head = Some(head);
        Ok(())
    }

    /// Point lookup; an empty slice result means "no leaf".
    pub fn get<'a>(&'a self, tx: &'a Tx<'a>, key: &[u8]) -> Result<&'a [u8]> {
        let mut addr = self.root_addr(tx);
        if addr.is_nil() {
            return Ok(&[]);
        }
        let mut key = key;
        loop {
            let (rest, ok) = addr.match_key(key)?;
            if !ok {
                return Ok(&[]);
            }
            key = rest;
            if key.is_empty() {
                return addr.leaf();
            }
            match addr.lookup(key[0])? {
                Some((_, child)) => addr = child,
                None => return Ok(&[]),
            }
        }
    }

    /// Finds the longest stored key that is a prefix of `key`.
    pub fn get_longest_prefix<'a>(
        &'a self,
        tx: &'a Tx<'a>,
        key: &[u8],
    ) -> Result<Option<(Vec<u8>, &'a [u8])>> {
        let mut addr = self.root_addr(tx);
        if addr.is_nil() {
            return Ok(None);
        }
        let mut rest = key;
        let mut consumed = 0usize;
        let mut best: Option<(usize, &'a [u8])> = None;
        loop {
            let (next, ok) = addr.match_key(rest)?;
            if !ok {
                break;
            }
            consumed += rest.len() - next.len();
            rest = next;
            let leaf = addr.leaf()?;
            if !leaf.is_empty() {
                best = Some((consumed, leaf));
            }
            if rest.is_empty() {
                break;
            }
            match addr.lookup(rest[0])? {
                Some((_, child)) => addr = child,
                None => break,
            }
        }
        Ok(best.map(|(len, leaf)| (key[..len].to_vec(), leaf)))
    }

    /// Smallest stored key, by always taking edge 0.
    pub fn minimum<'a>(&'a self, tx: &'a Tx<'a>) -> Result<Option<(Vec<u8>, &'a [u8])>> {
        let mut addr = self.root_addr(tx);
        if addr.is_nil() {
            return Ok(None);
        }
        let mut acc = Vec::new();
        loop {
            acc.extend_from_slice(addr.prefix()?);
            let leaf = addr.leaf()?;
            if !leaf.is_empty() {
                return Ok(Some((acc, leaf)));
            }
            if addr.n_edges()? == 0 {
                return Ok(None);
            }
            addr = addr.edge(0)?;
        }
    }

    /// Largest stored key, by always taking the last edge.
    pub fn maximum<'a>(&'a self, tx: &'a Tx<'a>) -> Result<Option<(Vec<u8>, &'a [u8])>> {
        let mut addr = self.root_addr(tx);
        if addr.is_nil() {
            return Ok(None);
        }
        let mut acc = Vec::new();
        let mut best: Option<(Vec<u8>, &'a [u8])> = None;
        loop {
            acc.extend_from_slice(addr.prefix()?);
            let leaf = addr.leaf()?;
            if !leaf.is_empty() {
                best = Some((acc.clone(), leaf));
            }
            let n = addr.n_edges()?;
            if n == 0 {
                return Ok(best);
            }
            addr = addr.edge(n - 1)?;
        }
    }

    /// Inserts `key -> value`, splitting nodes as needed.
    pub fn insert(&mut self, tx: &Tx<'_>, key: &[u8], value: &[u8]) -> Result<()> {
        self.decode_root(tx)?;
        let mut node: &mut RadixNode = self.head.as_deref_mut().unwrap();
        let mut key = key;

        // The root may carry a prefix after an upward merge; treat it
        // like any other node before walking edges.
        let l = longest_common_prefix(&node.prefix, key);
        if l < node.prefix.len() {
            split_node(node, l);
        }
        key = &key[l..];

        loop {
            if key.is_empty() {
                set_leaf(tx, node, value)?;
                return Ok(());
            }
            let (i, found) = edge_search(&node.edges_k, key[0]);
            if !found {
                let (slot, _) = node.edge_insert(key[0]);
                node.edges_p[slot] = Some(Box::new(RadixNode {
                    prefix: key.to_vec(),
                    leaf_in: value.to_vec(),
                    ..RadixNode::default()
                }));
                return Ok(());
            }
            decode_child(tx, node, i)?;
            let l = {
                let child = node.edges_p[i].as_deref().unwrap();
                longest_common_prefix(&child.prefix, key)
            };
            let child = node.edges_p[i].as_mut().unwrap();
            if l < child.prefix.len() {
                split_node(child, l);
                if l < key.len() {
                    let (slot, _) = child.edge_insert(key[l]);
                    child.edges_p[slot] = Some(Box::new(RadixNode {
                        prefix: key[l..].to_vec(),
                        leaf_in: value.to_vec(),
                        ..RadixNode::default()
                    }));
                } else {
                    set_leaf(tx, child, value)?;
                }
                return Ok(());
            }
            key = &key[l..];
            let parent = node;
            node = parent.edges_p[i].as_deref_mut().unwrap();
        }
    }

    /// Deletes `key` if stored; absent keys are a no-op. Keeps the tree
    /// merged: no interior node is left with a single edge and no leaf.
    pub fn delete(&mut self, tx: &Tx<'_>, key: &[u8]) -> Result<()> {
        self.decode_root(tx)?;
        let mut node: &mut RadixNode = self.head.as_deref_mut().unwrap();

        let l = longest_common_prefix(&node.prefix, key);
        if l < node.prefix.len() {
            return Ok(());
        }
        let mut key = &key[l..];
        if key.is_empty() {
            // The key terminates at the (merged) root itself.
            clear_leaf(tx, node)?;
            if node.n_edges() == 1 {
                merge_child(tx, node)?;
            } else if node.n_edges() == 0 {
                node.prefix.clear();
            }
            return Ok(());
        }

        loop {
            let (i, found) = edge_search(&node.edges_k, key[0]);
            if !found {
                return Ok(());
            }
            decode_child(tx, node, i)?;
            let (l, child_prefix_len) = {
                let child = node.edges_p[i].as_deref().unwrap();
                (
                    longest_common_prefix(&child.prefix, key),
                    child.prefix.len(),
                )
            };
            if l == key.len() && l == child_prefix_len {
                let edge_byte = key[0];
                let remaining = {
                    let child = node.edges_p[i].as_mut().unwrap();
                    clear_leaf(tx, child)?;
                    child.n_edges()
                };
                match remaining {
                    0 => {
                        node.edge_delete(edge_byte);
                        if !node.has_leaf() && node.n_edges() == 1 {
                            merge_child(tx, node)?;
                        }
                    }
                    1 => {
                        let child = node.edges_p[i].as_mut().unwrap();
                        merge_child(tx, child)?;
                    }
                    _ => {}
                }
                return Ok(());
            }
            if l < child_prefix_len {
                return Ok(());
            }
            key = &key[l..];
            let parent = node;
            node = parent.edges_p[i].as_deref_mut().unwrap();
        }
    }

    /// Writes all heap nodes back to freshly allocated pages; returns
    /// the new root page id. A never-decoded tree keeps its root.
    pub fn persist(&mut self, tx: &Tx<'_>) -> Result<Pgid> {
        if self.head.is_none() {
            return Ok(self.root);
        }
        {
            let head = self.head.as_mut().unwrap();
            persist_walk(tx, head)?;
        }
        let mut rid = RadixId::default();
        let pgid = persist_write_head(tx, &mut self.head, &mut rid)?;
        self.root = pgid;
        Ok(pgid)
    }
}

/// Replaces the inline leaf, releasing any external leaf page first.
fn set_leaf(tx: &Tx<'_>, node: &mut RadixNode, value: &[u8]) -> Result<()> {
    if node.leaf_ex_v.is_block() {
        tx.free(node.leaf_ex_v.offset())?;
    }
    node.leaf_ex_v = RadixId::default();
    node.leaf_ex_p = None;
    node.leaf_in = value.to_vec();
    Ok(())
}

fn clear_leaf(tx: &Tx<'_>, node: &mut RadixNode) -> Result<()> {
    if node.leaf_ex_v.is_block() {
        tx.free(node.leaf_ex_v.offset())?;
    }
    node.leaf_ex_v = RadixId::default();
    node.leaf_ex_p = None;
    node.leaf_in.clear();
    Ok(())
}

/// Splits `node` at prefix offset `l`: the tail of the prefix, the
/// edges, and the leaf move into a new child; `node` keeps the head of
/// the prefix and the single edge to that child.
fn split_node(node: &mut RadixNode, l: usize) {
    let mut inner = Box::new(std::mem::take(node));
    node.prefix = inner.prefix[..l].to_vec();
    inner.prefix.drain(..l);
    inner.flags = 0;
    let first = inner.prefix[0];
    let (slot, _) = node.edge_insert(first);
    node.edges_p[slot] = Some(inner);
}

/// Lazily decodes the child behind edge `i` of a heap node.
fn decode_child(tx: &Tx<'_>, node: &mut RadixNode, i: usize) -> Result<()> {
    if node.edges_p[i].is_some() {
        return Ok(());
    }
    let id = node.edges_v[i];
    if !id.is_block() {
        return Err(SableError::Corruption("radix heap child has inline id"));
    }
    let pgid = id.offset();
    let child = {
        let payload = radix_page_payload(tx, pgid)?;
        decode_subtree(payload, RadixId::default(), true)?
            .ok_or(SableError::Corruption("radix child decodes to nothing"))?
    };
    tx.free(pgid)?;
    node.edges_p[i] = Some(child);
    node.edges_v[i] = RadixId::default();
    Ok(())
}

/// Merges `node`'s only child up into it: the prefixes concatenate and
/// the node assumes the child's edges and leaf.
fn merge_child(tx: &Tx<'_>, node: &mut RadixNode) -> Result<()> {
    decode_child(tx, node, 0)?;
    let child = node.edges_p[0].take().unwrap();
    let mut prefix = std::mem::take(&mut node.prefix);
    prefix.extend_from_slice(&child.prefix);
    *node = *child;
    node.prefix = prefix;
    node.flags = 0;
    Ok(())
}

/// Moves the inline leaf to an external subpage when that reduces the
/// page count needed for the node; returns the resulting page count.
fn externalize_leaf(tx: &Tx<'_>, node: &mut RadixNode) -> usize {
    let page_size = tx.page_size();
    let off = (page_size - 1) + PAGE_HDR_LEN;
    let with_leaf = (off + node.size()) / page_size;
    let without_leaf = (off + node.size_without_leaf_in()) / page_size;
    if without_leaf < with_leaf {
        node.leaf_ex_p = Some(Box::new(RadixNode {
            leaf_in: std::mem::take(&mut node.leaf_in),
            ..RadixNode::default()
        }));
        return without_leaf;
    }
    with_leaf
}

/// Marks descendants that fit the remaining page budget as inlined.
fn persist_pack(node: &mut RadixNode, budget: &mut isize) {
    *budget -= node.size() as isize;
    for i in 0..node.n_edges() {
        let Some(child) = node.edges_p[i].as_mut() else {
            continue;
        };
        if *budget < child.size() as isize {
            continue;
        }
        child.flags |= FLAG_INLINED;
        persist_pack(child, budget);
    }
}

/// Depth-first walk over heap nodes: packs inlinable descendants, then
/// writes external leaves and non-inlined children to their own pages.
fn persist_walk(tx: &Tx<'_>, node: &mut RadixNode) -> Result<()> {
    if node.flags & FLAG_INLINED == 0 {
        let count = externalize_leaf(tx, node);
        let mut budget = (tx.page_size() * count.max(1) - PAGE_HDR_LEN) as isize;
        persist_pack(node, &mut budget);
    }
    if node.leaf_ex_p.is_some() {
        let mut slot = node.leaf_ex_p.take();
        let mut rid = RadixId::default();
        persist_write_head(tx, &mut slot, &mut rid)?;
        node.leaf_ex_v = rid;
    }
    for i in 0..node.n_edges() {
        if node.edges_p[i].is_none() {
            continue;
        }
        persist_walk(tx, node.edges_p[i].as_mut().unwrap())?;
        if node.edges_p[i].as_deref().unwrap().flags & FLAG_INLINED != 0 {
            continue;
        }
        let mut slot = node.edges_p[i].take();
        let mut rid = RadixId::default();
        persist_write_head(tx, &mut slot, &mut rid)?;
        node.edges_v[i] = rid;
    }
    Ok(())
}

/// Allocates a page run and packs `node` plus its inlined descendants
/// into it; the slot is consumed and the block id recorded in `rid`.
fn persist_write_head(
    tx: &Tx<'_>,
    slot: &mut Option<Box<RadixNode>>,
    rid: &mut RadixId,
) -> Result<Pgid> {
    let page_size = tx.page_size();
    let size = slot
        .as_deref()
        .ok_or(SableError::Corruption("radix write of empty slot"))?
        .size()
        + PAGE_HDR_LEN;
    let npages = size.div_ceil(page_size);
    let pgid = tx.allocate(npages)?;
    tx.with_dirty(pgid, |buf| {
        page::write_header(buf, pgid, page::RADIX_PAGE, 0, (npages - 1) as u32);
        let mut off = 0usize;
        persist_write(&mut buf[PAGE_HDR_LEN..], &mut off, slot, rid);
    })?;
    *rid = RadixId::from_pgid(pgid);
    Ok(pgid)
}

/// Writes `node` and its inlined children into one page buffer,
/// recording inline ids and consuming the heap nodes.
fn persist_write(buf: &mut [u8], off: &mut usize, slot: &mut Option<Box<RadixNode>>, rid: &mut RadixId) {
    let mut node = slot.take().expect("inline write of empty slot");
    let pos = *off;
    *off += node.size();

    for i in 0..node.n_edges() {
        if node.edges_p[i].is_none() {
            continue;
        }
        if node.edges_p[i].as_deref().unwrap().flags & FLAG_INLINED == 0 {
            continue;
        }
        let mut child_slot = node.edges_p[i].take();
        let mut child_rid = RadixId::default();
        persist_write(buf, off, &mut child_slot, &mut child_rid);
        node.edges_v[i] = child_rid;
    }

    node.write(&mut buf[pos..]);
    *rid = RadixId::from_inline_pos(pos);
}
