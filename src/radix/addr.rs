//! Polymorphic node views: read a radix node from a heap node or
//! directly out of a mapped page without materializing it.

use std::convert::TryInto;

use crate::error::{Result, SableError};
use crate::page::{self, Pgid, PAGE_HDR_LEN};
use crate::radix::node::{
    edge_search, longest_common_prefix, RadixId, RadixNode, NODE_FIXED_LEN,
};
use crate::tx::Tx;

/// A view of one node: `(tx, base page, heap pointer or none, id)`.
///
/// When `node` is set the accessors read struct fields; otherwise the id
/// is decoded against `base` (inlined) or against `tx.page(id)` (block).
#[derive(Clone, Copy)]
pub(crate) struct RadixAddr<'a> {
    pub tx: &'a Tx<'a>,
    pub base: Pgid,
    pub node: Option<&'a RadixNode>,
    pub id: RadixId,
}

/// Parsed view of a packed node's fixed head.
struct PackedHead {
    leaf_ex: RadixId,
    n_edges: usize,
    prefix_len: usize,
    leaf_in_len: usize,
}

fn packed_head(buf: &[u8]) -> Result<PackedHead> {
    if buf.len() < NODE_FIXED_LEN {
        return Err(SableError::Corruption("radix node truncated"));
    }
    let compound = u32::from_le_bytes(buf[8..12].try_into().unwrap());
    Ok(PackedHead {
        leaf_ex: RadixId(u64::from_le_bytes(buf[0..8].try_into().unwrap())),
        n_edges: (compound & 0x1ff) as usize,
        prefix_len: (compound >> 9) as usize,
        leaf_in_len: u32::from_le_bytes(buf[12..16].try_into().unwrap()) as usize,
    })
}

/// Returns the payload of a radix page run, checking the page flag.
pub(crate) fn radix_page_payload<'a>(tx: &'a Tx<'a>, pgid: Pgid) -> Result<&'a [u8]> {
    let buf = tx.page(pgid)?;
    let info = page::PageInfo::parse(buf)?;
    if info.flags & page::RADIX_PAGE == 0 {
        return Err(SableError::Corruption("radix decode invalid page"));
    }
    Ok(&buf[PAGE_HDR_LEN..])
}

impl<'a> RadixAddr<'a> {
    pub fn is_nil(&self) -> bool {
        self.node.is_none() && self.id.is_nil()
    }

    /// The packed bytes of this node and the page they live in.
    fn node_bytes(&self) -> Result<(&'a [u8], Pgid)> {
        if self.id.inlined() {
            let payload = radix_page_payload(self.tx, self.base)?;
            let pos = (self.id.offset() << 3) as usize;
            if pos >= payload.len() {
                return Err(SableError::Corruption("radix inline offset beyond page"));
            }
            return Ok((&payload[pos..], self.base));
        }
        let pgid = self.id.offset();
        Ok((radix_page_payload(self.tx, pgid)?, pgid))
    }

    /// The node's effective leaf: the external leaf if present, else the
    /// inline one. Empty means "no leaf".
    pub fn leaf(&self) -> Result<&'a [u8]> {
        if self.is_nil() {
            return Ok(&[]);
        }
        let ex = self.leaf_ex()?;
        if !ex.is_nil() {
            return ex.leaf_in();
        }
        self.leaf_in()
    }

    pub fn leaf_in(&self) -> Result<&'a [u8]> {
        if let Some(node) = self.node {
            return Ok(&node.leaf_in);
        }
        let (buf, _) = self.node_bytes()?;
        let head = packed_head(buf)?;
        let off = NODE_FIXED_LEN + head.n_edges * 9 + head.prefix_len;
        buf.get(off..off + head.leaf_in_len)
            .ok_or(SableError::Corruption("radix leaf beyond node"))
    }

    pub fn leaf_ex(&self) -> Result<RadixAddr<'a>> {
        if let Some(node) = self.node {
            return Ok(RadixAddr {
                node: node.leaf_ex_p.as_deref(),
                id: node.leaf_ex_v,
                ..*self
            });
        }
        let (buf, pgid) = self.node_bytes()?;
        let head = packed_head(buf)?;
        Ok(RadixAddr {
            base: pgid,
            node: None,
            id: head.leaf_ex,
            ..*self
        })
    }

    pub fn n_edges(&self) -> Result<usize> {
        if let Some(node) = self.node {
            return Ok(node.n_edges());
        }
        let (buf, _) = self.node_bytes()?;
        Ok(packed_head(buf)?.n_edges)
    }

    /// The child view behind edge `i`.
    pub fn edge(&self, i: usize) -> Result<RadixAddr<'a>> {
        if let Some(node) = self.node {
            if i >= node.n_edges() {
                return Err(SableError::Corruption("radix edge index out of range"));
            }
            return Ok(RadixAddr {
                node: node.edges_p[i].as_deref(),
                id: node.edges_v[i],
                ..*self
            });
        }
        let (buf, pgid) = self.node_bytes()?;
        let head = packed_head(buf)?;
        if i >= head.n_edges {
            return Err(SableError::Corruption("radix edge index out of range"));
        }
        let off = NODE_FIXED_LEN + i * 8;
        let id = RadixId(u64::from_le_bytes(buf[off..off + 8].try_into().unwrap()));
        Ok(RadixAddr {
            base: pgid,
            node: None,
            id,
            ..*self
        })
    }

    pub fn edge_k(&self, i: usize) -> Result<u8> {
        if let Some(node) = self.node {
            return node
                .edges_k
                .get(i)
                .copied()
                .ok_or(SableError::Corruption("radix edge index out of range"));
        }
        let (buf, _) = self.node_bytes()?;
        let head = packed_head(buf)?;
        buf.get(NODE_FIXED_LEN + head.n_edges * 8 + i)
            .copied()
            .ok_or(SableError::Corruption("radix edge index out of range"))
    }

    pub fn prefix(&self) -> Result<&'a [u8]> {
        if let Some(node) = self.node {
            return Ok(&node.prefix);
        }
        let (buf, _) = self.node_bytes()?;
        let head = packed_head(buf)?;
        let off = NODE_FIXED_LEN + head.n_edges * 9;
        buf.get(off..off + head.prefix_len)
            .ok_or(SableError::Corruption("radix prefix beyond node"))
    }

    /// Strips this node's prefix from `key`. `ok` iff the prefix is a
    /// prefix of `key`; `rest` is the remainder after the matched bytes.
    pub fn match_key<'k>(&self, key: &'k [u8]) -> Result<(&'k [u8], bool)> {
        let prefix = self.prefix()?;
        let i = longest_common_prefix(prefix, key);
        Ok((&key[i..], i == prefix.len()))
    }

    /// Looks up the edge for byte `k`.
    pub fn lookup(&self, k: u8) -> Result<Option<(usize, RadixAddr<'a>)>> {
        if let Some(node) = self.node {
            let (i, found) = edge_search(&node.edges_k, k);
            if !found {
                return Ok(None);
            }
            return Ok(Some((
                i,
                RadixAddr {
                    node: node.edges_p[i].as_deref(),
                    id: node.edges_v[i],
                    ..*self
                },
            )));
        }
        let (buf, pgid) = self.node_bytes()?;
        let head = packed_head(buf)?;
        let keys = buf
            .get(NODE_FIXED_LEN + head.n_edges * 8..NODE_FIXED_LEN + head.n_edges * 9)
            .ok_or(SableError::Corruption("radix edge table beyond node"))?;
        let (i, found) = edge_search(keys, k);
        if !found {
            return Ok(None);
        }
        let off = NODE_FIXED_LEN + i * 8;
        let id = RadixId(u64::from_le_bytes(buf[off..off + 8].try_into().unwrap()));
        Ok(Some((
            i,
            RadixAddr {
                base: pgid,
                node: None,
                id,
                ..*self
            },
        )))
    }
}
