//! Stack-machine traversal over a radix tree.
//!
//! A frame is `(location, i, n, prefix_len)`; the key under construction
//! lives in one shared buffer that frames truncate and extend as the
//! walk descends and pops, so iteration amortizes a single allocation.
//!
//! Heap nodes are addressed by their edge path from the root and
//! re-resolved on every step; on-page nodes are addressed directly by
//! `(base page, id)`. Mutating the tree mid-iteration is not defined:
//! the iterator then stops early rather than yielding garbage.

use std::cell::RefCell;
use std::rc::Rc;

use smallvec::SmallVec;

use crate::error::Result;
use crate::page::Pgid;
use crate::radix::addr::RadixAddr;
use crate::radix::bucket::RadixInner;
use crate::radix::node::{edge_search, longest_common_prefix, RadixId};
use crate::tx::Tx;

#[derive(Clone)]
enum Loc {
    /// Heap node reached by following these edge indices from the head.
    Heap(SmallVec<[u16; 16]>),
    /// Packed node inside a page.
    Page { base: Pgid, id: RadixId },
}

struct Frame {
    loc: Loc,
    /// -1 before the node's own leaf has been considered; then the next
    /// edge index to descend into.
    i: isize,
    n: usize,
    /// Length of the shared prefix buffer including this node's prefix.
    plen: usize,
}

/// Forward/backward iterator over a radix bucket.
///
/// Keys come out in strict lexicographic order (`next`) or reverse
/// order (`prev`). Switching direction mid-iteration may yield the
/// boundary key twice; this quirk is part of the contract. After
/// `prefix_scan`, the `longest_common_prefix` accessor is unspecified.
pub struct Iter<'tx> {
    tx: &'tx Tx<'tx>,
    inner: Rc<RefCell<RadixInner>>,
    prefix: Vec<u8>,
    frames: Vec<Frame>,
}

/// A resolved view plus the data copied out of it for one step.
struct NodeView {
    n_edges: usize,
    prefix: Vec<u8>,
    leaf: Vec<u8>,
    edges_k: Vec<u8>,
}

impl<'tx> Iter<'tx> {
    pub(crate) fn new(tx: &'tx Tx<'tx>, inner: Rc<RefCell<RadixInner>>) -> Iter<'tx> {
        let mut iter = Iter {
            tx,
            inner,
            prefix: Vec::new(),
            frames: Vec::new(),
        };
        let _ = iter.reset();
        iter
    }

    fn root_loc(&self) -> Option<Loc> {
        let inner = self.inner.borrow();
        if inner.access.head.is_some() {
            return Some(Loc::Heap(SmallVec::new()));
        }
        if inner.access.root == 0 {
            return None;
        }
        Some(Loc::Page {
            base: 0,
            id: RadixId::from_pgid(inner.access.root),
        })
    }

    fn resolve(&self, loc: &Loc) -> Result<Option<NodeView>> {
        let inner = self.inner.borrow();
        match loc {
            Loc::Heap(path) => {
                let mut node = match inner.access.head.as_deref() {
                    Some(node) => node,
                    None => return Ok(None),
                };
                for &step in path {
                    match node.edges_p.get(step as usize).and_then(|p| p.as_deref()) {
                        Some(child) => node = child,
                        None => return Ok(None),
                    }
                }
                let leaf = if node.leaf_ex_p.is_some() || !node.leaf_ex_v.is_nil() {
                    // External leaves of heap nodes: follow the pointer or
                    // the block id through an address view.
                    let addr = RadixAddr {
                        tx: self.tx,
                        base: 0,
                        node: Some(node),
                        id: RadixId::default(),
                    };
                    addr.leaf()?.to_vec()
                } else {
                    node.leaf_in.clone()
                };
                Ok(Some(NodeView {
                    n_edges: node.n_edges(),
                    prefix: node.prefix.clone(),
                    leaf,
                    edges_k: node.edges_k.clone(),
                }))
            }
            Loc::Page { base, id } => {
                let addr = RadixAddr {
                    tx: self.tx,
                    base: *base,
                    node: None,
                    id: *id,
                };
                let n = addr.n_edges()?;
                let mut edges_k = Vec::with_capacity(n);
                for i in 0..n {
                    edges_k.push(addr.edge_k(i)?);
                }
                Ok(Some(NodeView {
                    n_edges: n,
                    prefix: addr.prefix()?.to_vec(),
                    leaf: addr.leaf()?.to_vec(),
                    edges_k,
                }))
            }
        }
    }

    fn child_loc(&self, loc: &Loc, i: usize) -> Result<Option<Loc>> {
        let inner = self.inner.borrow();
        match loc {
            Loc::Heap(path) => {
                let mut node = match inner.access.head.as_deref() {
                    Some(node) => node,
                    None => return Ok(None),
                };
                for &step in path {
                    match node.edges_p.get(step as usize).and_then(|p| p.as_deref()) {
                        Some(child) => node = child,
                        None => return Ok(None),
                    }
                }
                if i >= node.n_edges() {
                    return Ok(None);
                }
                if node.edges_p[i].is_some() {
                    let mut path = path.clone();
                    path.push(i as u16);
                    return Ok(Some(Loc::Heap(path)));
                }
                Ok(Some(Loc::Page {
                    base: 0,
                    id: node.edges_v[i],
                }))
            }
            Loc::Page { base, id } => {
                let addr = RadixAddr {
                    tx: self.tx,
                    base: *base,
                    node: None,
                    id: *id,
                };
                let child = addr.edge(i)?;
                Ok(Some(Loc::Page {
                    base: child.base,
                    id: child.id,
                }))
            }
        }
    }

    /// Rewinds to the start for forward iteration.
    pub fn reset(&mut self) -> Result<()> {
        self.prefix.clear();
        self.frames.clear();
        if let Some(loc) = self.root_loc() {
            if let Some(view) = self.resolve(&loc)? {
                self.prefix.extend_from_slice(&view.prefix);
                self.frames.push(Frame {
                    loc,
                    i: -1,
                    n: view.n_edges,
                    plen: self.prefix.len(),
                });
            }
        }
        Ok(())
    }

    /// Rewinds past the end for backward iteration.
    pub fn last(&mut self) -> Result<()> {
        self.prefix.clear();
        self.frames.clear();
        if let Some(loc) = self.root_loc() {
            if let Some(view) = self.resolve(&loc)? {
                self.prefix.extend_from_slice(&view.prefix);
                self.frames.push(Frame {
                    loc,
                    i: view.n_edges as isize,
                    n: view.n_edges,
                    plen: self.prefix.len(),
                });
            }
        }
        Ok(())
    }

    /// Yields the next key-value pair in ascending order.
    pub fn next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        loop {
            let Some(frame) = self.frames.last_mut() else {
                return Ok(None);
            };
            if frame.i < 0 {
                frame.i = 0;
                let plen = frame.plen;
                let loc = frame.loc.clone();
                match self.resolve(&loc)? {
                    Some(view) if !view.leaf.is_empty() => {
                        return Ok(Some((self.prefix[..plen].to_vec(), view.leaf)));
                    }
                    Some(_) => {}
                    None => {
                        self.frames.clear();
                        return Ok(None);
                    }
                }
                continue;
            }
            if (frame.i as usize) < frame.n {
                let i = frame.i as usize;
                frame.i += 1;
                let parent_plen = frame.plen;
                let loc = frame.loc.clone();
                let Some(child) = self.child_loc(&loc, i)? else {
                    self.frames.clear();
                    return Ok(None);
                };
                let Some(view) = self.resolve(&child)? else {
                    self.frames.clear();
                    return Ok(None);
                };
                self.prefix.truncate(parent_plen);
                self.prefix.extend_from_slice(&view.prefix);
                self.frames.push(Frame {
                    loc: child,
                    i: -1,
                    n: view.n_edges,
                    plen: self.prefix.len(),
                });
                continue;
            }
            self.frames.pop();
        }
    }

    /// Yields the previous key-value pair in descending order.
    pub fn prev(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        loop {
            let Some(frame) = self.frames.last_mut() else {
                return Ok(None);
            };
            if frame.i > 0 {
                frame.i -= 1;
                let i = frame.i as usize;
                let parent_plen = frame.plen;
                let loc = frame.loc.clone();
                let Some(child) = self.child_loc(&loc, i)? else {
                    self.frames.clear();
                    return Ok(None);
                };
                let Some(view) = self.resolve(&child)? else {
                    self.frames.clear();
                    return Ok(None);
                };
                self.prefix.truncate(parent_plen);
                self.prefix.extend_from_slice(&view.prefix);
                self.frames.push(Frame {
                    loc: child,
                    i: view.n_edges as isize,
                    n: view.n_edges,
                    plen: self.prefix.len(),
                });
                continue;
            }
            if frame.i == 0 {
                frame.i = -1;
                let plen = frame.plen;
                let loc = frame.loc.clone();
                match self.resolve(&loc)? {
                    Some(view) if !view.leaf.is_empty() => {
                        return Ok(Some((self.prefix[..plen].to_vec(), view.leaf)));
                    }
                    Some(_) => {}
                    None => {
                        self.frames.clear();
                        return Ok(None);
                    }
                }
            }
            self.frames.pop();
        }
    }

    /// Seeks by longest common prefix with `key` and returns
    /// `(match, rest)` where `match = key[..key.len() - rest.len()]`.
    /// The stack is left so that `next` continues from the first key at
    /// or after the match point.
    pub fn longest_common_prefix(&mut self, key: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
        let consumed = self.seek_lcp(key, true)?;
        Ok((key[..consumed].to_vec(), key[consumed..].to_vec()))
    }

    /// Seeds the iterator to yield exactly the keys starting with
    /// `scan_prefix`, or nothing when no stored key has that prefix.
    pub fn prefix_scan(&mut self, scan_prefix: &[u8]) -> Result<()> {
        let consumed = self.seek_lcp(scan_prefix, false)?;
        if consumed < scan_prefix.len() {
            self.frames.clear();
        }
        Ok(())
    }

    /// Shared LCP descent. With `keep_ancestors`, parent frames stay on
    /// the stack pointed after the matched edge so iteration continues
    /// into later siblings; without, only the terminal subtree remains.
    fn seek_lcp(&mut self, key: &[u8], keep_ancestors: bool) -> Result<usize> {
        self.prefix.clear();
        self.frames.clear();
        let mut rest = key;
        let mut loc = match self.root_loc() {
            Some(loc) => loc,
            None => return Ok(0),
        };
        loop {
            let Some(view) = self.resolve(&loc)? else {
                self.frames.clear();
                return Ok(key.len() - rest.len());
            };
            let l = longest_common_prefix(&view.prefix, rest);
            self.prefix.extend_from_slice(&view.prefix);
            let plen = self.prefix.len();
            if l < view.prefix.len() {
                // The node's prefix diverges from the key. Its whole
                // subtree sorts before or after the key by the byte at
                // the divergence point.
                let subtree_after = l == rest.len() || view.prefix[l] > rest[l];
                self.frames.push(Frame {
                    loc,
                    i: if subtree_after { -1 } else { view.n_edges as isize },
                    n: view.n_edges,
                    plen,
                });
                return Ok(key.len() - rest.len() + l);
            }
            rest = &rest[l..];
            if rest.is_empty() {
                self.frames.push(Frame {
                    loc,
                    i: -1,
                    n: view.n_edges,
                    plen,
                });
                return Ok(key.len());
            }
            let (i, found) = edge_search(&view.edges_k, rest[0]);
            if !found {
                // Edges at and after the insertion point sort after the
                // key; the node's own leaf sorts before it.
                self.frames.push(Frame {
                    loc,
                    i: i as isize,
                    n: view.n_edges,
                    plen,
                });
                return Ok(key.len() - rest.len());
            }
            let next = Frame {
                loc: loc.clone(),
                i: i as isize + 1,
                n: view.n_edges,
                plen,
            };
            let child = match self.child_loc(&loc, i)? {
                Some(child) => child,
                None => {
                    self.frames.clear();
                    return Ok(key.len() - rest.len());
                }
            };
            if keep_ancestors {
                self.frames.push(next);
            }
            loc = child;
        }
    }
}
