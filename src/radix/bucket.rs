//! Radix buckets as values of the host B+tree.
//!
//! A radix bucket lives under a key of a host bucket whose leaf carries
//! the radix flag and whose value is the 8-byte little-endian page id of
//! the radix root. Opened radix buckets are cached per host bucket so a
//! transaction sees its own unspilled mutations through every handle.

use std::cell::RefCell;
use std::convert::TryInto;
use std::rc::Rc;

use crate::bucket::{put_raw, Bucket};
use crate::error::{Result, SableError};
use crate::page::{Pgid, MAX_KEY_SIZE, MAX_VALUE_SIZE, RADIX_LEAF_FLAG};
use crate::radix::access::RadixAccess;
use crate::radix::iter::Iter;
use crate::tx::Tx;

pub(crate) struct RadixInner {
    pub bucket: usize,
    pub key: Vec<u8>,
    pub access: RadixAccess,
}

/// An ordered byte-string map persisted as a compressed trie inside the
/// host store. Obtained from a host bucket; does not nest further.
pub struct RadixBucket<'tx> {
    tx: &'tx Tx<'tx>,
    inner: Rc<RefCell<RadixInner>>,
}

fn root_from_value(value: &[u8]) -> Option<Pgid> {
    let bytes = value.get(..8)?;
    Some(u64::from_le_bytes(bytes.try_into().unwrap()))
}

impl<'tx> Bucket<'tx> {
    /// Creates a radix bucket under `key`; fails if the key exists.
    pub fn create_radix_bucket(&self, key: &[u8]) -> Result<RadixBucket<'tx>> {
        self.tx.require_writable()?;
        if key.is_empty() {
            return Err(SableError::BucketNameRequired);
        } else if key.len() > MAX_KEY_SIZE {
            return Err(SableError::KeyTooLarge);
        }
        let mut cursor = self.cursor();
        cursor.seek_to(key)?;
        let (k, _, flags) = cursor.key_value()?;
        if k.as_deref() == Some(key) {
            if flags & RADIX_LEAF_FLAG != 0 {
                return Err(SableError::BucketExists);
            }
            return Err(SableError::IncompatibleValue);
        }
        put_raw(self.tx, self.idx, key, &0u64.to_le_bytes(), RADIX_LEAF_FLAG)?;
        let mut access = RadixAccess::new(0);
        access.head = Some(Box::default());
        Ok(self.register_radix(key, access))
    }

    pub fn create_radix_bucket_if_not_exists(&self, key: &[u8]) -> Result<RadixBucket<'tx>> {
        match self.create_radix_bucket(key) {
            Err(SableError::BucketExists) => Ok(self
                .radix_bucket(key)?
                .expect("existing radix bucket must open")),
            other => other,
        }
    }

    /// Opens the radix bucket stored under `key`, or `None` when the key
    /// is absent or names something else.
    pub fn radix_bucket(&self, key: &[u8]) -> Result<Option<RadixBucket<'tx>>> {
        self.tx.check_open()?;
        if key.is_empty() {
            return Ok(None);
        }
        if let Some(&pos) = self.tx.state_ref().buckets[self.idx].radixes.get(key) {
            let inner = Rc::clone(&self.tx.state_ref().radixes[pos]);
            return Ok(Some(RadixBucket { tx: self.tx, inner }));
        }
        let mut cursor = self.cursor();
        cursor.seek_to(key)?;
        let (k, v, flags) = cursor.key_value()?;
        let root = match (k, v) {
            (Some(k), Some(v)) if k == key && flags & RADIX_LEAF_FLAG != 0 => {
                match root_from_value(&v) {
                    Some(root) => root,
                    None => return Ok(None),
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(self.register_radix(key, RadixAccess::new(root))))
    }

    fn register_radix(&self, key: &[u8], access: RadixAccess) -> RadixBucket<'tx> {
        let inner = Rc::new(RefCell::new(RadixInner {
            bucket: self.idx,
            key: key.to_vec(),
            access,
        }));
        let mut state = self.tx.state_mut();
        let pos = state.radixes.len();
        state.radixes.push(Rc::clone(&inner));
        state.buckets[self.idx]
            .radixes
            .insert(key.to_vec(), pos);
        RadixBucket { tx: self.tx, inner }
    }
}

impl<'tx> RadixBucket<'tx> {
    /// Looks up the value stored under `key`. Empty and oversize keys
    /// miss without error.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.tx.check_open()?;
        if key.is_empty() || key.len() > MAX_KEY_SIZE {
            return Ok(None);
        }
        let inner = self.inner.borrow();
        let leaf = inner.access.get(self.tx, key)?;
        if leaf.is_empty() {
            return Ok(None);
        }
        Ok(Some(leaf.to_vec()))
    }

    /// Returns the longest stored key that is a prefix of `key`, with
    /// its value.
    pub fn get_longest_prefix(&self, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.tx.check_open()?;
        if key.is_empty() || key.len() > MAX_KEY_SIZE {
            return Ok(None);
        }
        let inner = self.inner.borrow();
        Ok(inner
            .access
            .get_longest_prefix(self.tx, key)?
            .map(|(k, v)| (k, v.to_vec())))
    }

    /// Stores `key -> value`. Empty values are rejected: an empty leaf
    /// is the tree's representation of absence.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.tx.require_writable()?;
        if key.is_empty() {
            return Err(SableError::KeyRequired);
        } else if key.len() > MAX_KEY_SIZE {
            return Err(SableError::KeyTooLarge);
        } else if value.is_empty() {
            return Err(SableError::ValueRequired);
        } else if value.len() > MAX_VALUE_SIZE {
            return Err(SableError::ValueTooLarge);
        }
        let mut inner = self.inner.borrow_mut();
        inner.access.insert(self.tx, key, value)
    }

    /// Removes `key`; empty and oversize keys are a no-op.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.tx.require_writable()?;
        if key.is_empty() || key.len() > MAX_KEY_SIZE {
            return Ok(());
        }
        let mut inner = self.inner.borrow_mut();
        inner.access.delete(self.tx, key)
    }

    /// Smallest key and its value.
    pub fn minimum(&self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.tx.check_open()?;
        let inner = self.inner.borrow();
        Ok(inner
            .access
            .minimum(self.tx)?
            .map(|(k, v)| (k, v.to_vec())))
    }

    /// Largest key and its value.
    pub fn maximum(&self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.tx.check_open()?;
        let inner = self.inner.borrow();
        Ok(inner
            .access
            .maximum(self.tx)?
            .map(|(k, v)| (k, v.to_vec())))
    }

    /// A forward/backward iterator over the whole key space.
    pub fn iter(&self) -> Iter<'tx> {
        Iter::new(self.tx, Rc::clone(&self.inner))
    }

    /// An iterator restricted to keys starting with `prefix`.
    pub fn prefix_scan(&self, prefix: &[u8]) -> Result<Iter<'tx>> {
        let mut iter = self.iter();
        iter.prefix_scan(prefix)?;
        Ok(iter)
    }
}

/// Commit hook: writes every mutated radix tree back to pages and
/// refreshes the 8-byte root value in its host bucket.
pub(crate) fn spill_radixes(tx: &Tx<'_>) -> Result<()> {
    let handles: Vec<Rc<RefCell<RadixInner>>> = tx.state_ref().radixes.clone();
    for handle in handles {
        let spilled = {
            let mut inner = handle.borrow_mut();
            if inner.access.head.is_none() {
                None
            } else {
                let root = inner.access.persist(tx)?;
                Some((inner.bucket, inner.key.clone(), root))
            }
        };
        if let Some((bucket, key, root)) = spilled {
            put_raw(tx, bucket, &key, &root.to_le_bytes(), RADIX_LEAF_FLAG)?;
        }
    }
    Ok(())
}
