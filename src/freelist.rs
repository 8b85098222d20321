//! Free page tracking with MVCC-safe pending lists.
//!
//! Pages freed at transaction `t` stay pending until every reader that
//! began before `t` has finished; only then do they become allocatable.

use std::collections::{BTreeMap, HashSet};
use std::convert::TryInto;

use crate::error::{Result, SableError};
use crate::page::{self, Pgid, PAGE_HDR_LEN};

#[derive(Debug, Default)]
pub struct Freelist {
    /// Allocatable page ids, sorted ascending.
    ids: Vec<Pgid>,
    /// Pages freed per transaction id, awaiting release.
    pending: BTreeMap<u64, Vec<Pgid>>,
    cache: HashSet<Pgid>,
}

impl Freelist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn free_count(&self) -> usize {
        self.ids.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    /// All tracked ids (free plus pending), sorted, for serialization.
    pub fn copy_all(&self) -> Vec<Pgid> {
        let mut all = self.ids.clone();
        for ids in self.pending.values() {
            all.extend_from_slice(ids);
        }
        all.sort_unstable();
        all
    }

    /// Finds a contiguous run of `n` free pages; returns its first id.
    pub fn allocate(&mut self, n: usize) -> Option<Pgid> {
        if n == 0 || self.ids.is_empty() {
            return None;
        }
        let mut run_start = 0usize;
        for i in 0..self.ids.len() {
            if i > 0 && self.ids[i] != self.ids[i - 1] + 1 {
                run_start = i;
            }
            if i - run_start + 1 == n {
                let first = self.ids[run_start];
                self.ids.drain(run_start..=i);
                for off in 0..n as u64 {
                    self.cache.remove(&(first + off));
                }
                return Some(first);
            }
        }
        None
    }

    /// Registers a page run as freed by transaction `txid`.
    pub fn free(&mut self, txid: u64, pgid: Pgid, overflow: u32) -> Result<()> {
        if pgid <= 1 {
            return Err(SableError::Corruption("cannot free a meta page"));
        }
        let entry = self.pending.entry(txid).or_default();
        for id in pgid..=pgid + overflow as u64 {
            if !self.cache.insert(id) {
                return Err(SableError::Corruption("page freed twice"));
            }
            entry.push(id);
        }
        Ok(())
    }

    /// Moves pending pages of transactions older than `min_txid` into
    /// the allocatable set.
    pub fn release(&mut self, min_txid: u64) {
        let released: Vec<u64> = self
            .pending
            .range(..min_txid)
            .map(|(&txid, _)| txid)
            .collect();
        for txid in released {
            let mut ids = self.pending.remove(&txid).unwrap_or_default();
            self.ids.append(&mut ids);
        }
        self.ids.sort_unstable();
    }

    /// Discards the pending entries of an aborted transaction.
    pub fn rollback(&mut self, txid: u64) {
        if let Some(ids) = self.pending.remove(&txid) {
            for id in ids {
                self.cache.remove(&id);
            }
        }
    }

    /// Rebuilds the free set from a committed freelist page, keeping
    /// pending entries of still-unreleased transactions out of it.
    pub fn reload(&mut self, buf: &[u8]) -> Result<()> {
        let ids = Self::read_ids(buf)?;
        let pending: HashSet<Pgid> = self
            .pending
            .values()
            .flat_map(|v| v.iter().copied())
            .collect();
        self.ids = ids.into_iter().filter(|id| !pending.contains(id)).collect();
        self.ids.sort_unstable();
        self.cache = self.ids.iter().copied().chain(pending).collect();
        Ok(())
    }

    pub fn read(buf: &[u8]) -> Result<Self> {
        let ids = Self::read_ids(buf)?;
        let cache = ids.iter().copied().collect();
        Ok(Self {
            ids,
            pending: BTreeMap::new(),
            cache,
        })
    }

    fn read_ids(buf: &[u8]) -> Result<Vec<Pgid>> {
        let info = page::PageInfo::parse(buf)?;
        if info.flags & page::FREELIST_PAGE == 0 {
            return Err(SableError::Corruption("freelist page has wrong flags"));
        }
        let payload = &buf[PAGE_HDR_LEN..];
        // A count of 0xFFFF spills the real count into the first u64.
        let (count, data) = if info.count == u16::MAX {
            if payload.len() < 8 {
                return Err(SableError::Corruption("freelist overflow count truncated"));
            }
            let count = u64::from_le_bytes(payload[0..8].try_into().unwrap()) as usize;
            (count, &payload[8..])
        } else {
            (info.count as usize, payload)
        };
        if data.len() < count * 8 {
            return Err(SableError::Corruption("freelist ids truncated"));
        }
        let mut ids = Vec::with_capacity(count);
        for i in 0..count {
            ids.push(u64::from_le_bytes(data[i * 8..i * 8 + 8].try_into().unwrap()));
        }
        Ok(ids)
    }

    /// Bytes needed to serialize `n` ids, including the page header.
    pub fn page_size_for(n: usize) -> usize {
        let extra = if n >= u16::MAX as usize { 8 } else { 0 };
        PAGE_HDR_LEN + extra + n * 8
    }

    /// Serializes `ids` into a page run buffer.
    pub fn write(buf: &mut [u8], pgid: Pgid, overflow: u32, ids: &[Pgid]) {
        let count = if ids.len() >= u16::MAX as usize {
            u16::MAX
        } else {
            ids.len() as u16
        };
        page::write_header(buf, pgid, page::FREELIST_PAGE, count, overflow);
        let payload = &mut buf[PAGE_HDR_LEN..];
        let data = if count == u16::MAX {
            payload[0..8].copy_from_slice(&(ids.len() as u64).to_le_bytes());
            &mut payload[8..]
        } else {
            payload
        };
        for (i, id) in ids.iter().enumerate() {
            data[i * 8..i * 8 + 8].copy_from_slice(&id.to_le_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_then_release_makes_allocatable() {
        let mut fl = Freelist::new();
        fl.free(5, 10, 0).unwrap();
        fl.free(5, 12, 1).unwrap();
        assert_eq!(fl.allocate(1), None);
        fl.release(5);
        assert_eq!(fl.allocate(1), None, "pending at txid 5 released only below 5");
        fl.release(6);
        assert_eq!(fl.free_count(), 3);
        assert_eq!(fl.allocate(2), Some(12));
        assert_eq!(fl.allocate(1), Some(10));
        assert_eq!(fl.allocate(1), None);
    }

    #[test]
    fn allocate_requires_contiguous_run() {
        let mut fl = Freelist::new();
        fl.free(1, 4, 0).unwrap();
        fl.free(1, 7, 0).unwrap();
        fl.release(2);
        assert_eq!(fl.allocate(2), None);
        assert_eq!(fl.allocate(1), Some(4));
    }

    #[test]
    fn double_free_detected() {
        let mut fl = Freelist::new();
        fl.free(1, 4, 0).unwrap();
        assert!(fl.free(2, 4, 0).is_err());
    }

    #[test]
    fn rollback_discards_pending() {
        let mut fl = Freelist::new();
        fl.free(9, 20, 0).unwrap();
        fl.rollback(9);
        fl.release(100);
        assert_eq!(fl.free_count(), 0);
    }

    #[test]
    fn serialization_roundtrip() {
        let mut fl = Freelist::new();
        fl.free(1, 30, 2).unwrap();
        fl.free(2, 40, 0).unwrap();
        let ids = fl.copy_all();
        let mut buf = vec![0u8; Freelist::page_size_for(ids.len()).next_multiple_of(4096)];
        Freelist::write(&mut buf, 2, 0, &ids);
        let decoded = Freelist::read(&buf).unwrap();
        assert_eq!(decoded.free_count(), 4);
    }

    #[test]
    fn reload_preserves_pending() {
        let mut fl = Freelist::new();
        fl.free(1, 30, 0).unwrap();
        fl.release(2);
        fl.free(3, 31, 0).unwrap();
        let ids = fl.copy_all();
        let mut buf = vec![0u8; 4096];
        Freelist::write(&mut buf, 2, 0, &ids);
        // A reload must not let the still-pending page 31 become free.
        fl.reload(&buf).unwrap();
        assert_eq!(fl.free_count(), 1);
        assert_eq!(fl.pending_count(), 1);
    }
}
