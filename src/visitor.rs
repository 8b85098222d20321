//! Visitor-driven cursor operations: one atomic "seek + inspect +
//! mutate" primitive over the host B+tree, plus a cancellable linear
//! seek for targets known to be near the current position.

use std::fmt;
use std::time::Instant;

use crate::bucket::Bucket;
use crate::cursor::Cursor;
use crate::error::{Result, SableError};
use crate::meta::BucketHeader;
use crate::page::{BUCKET_LEAF_FLAG, MAX_KEY_SIZE};

const OP_DELETE: u8 = 1 << 0;
const OP_SET: u8 = 1 << 1;
const OP_COPY: u8 = 1 << 2;
const OP_NEW_BUCKET: u8 = 1 << 3;
const OP_VISIT_BUCKET: u8 = 1 << 4;

/// The intent a visitor returns for the slot it was shown.
pub struct VisitOp {
    buf: Vec<u8>,
    flags: u8,
}

impl VisitOp {
    /// Leave the slot untouched.
    pub fn nop() -> VisitOp {
        VisitOp {
            buf: Vec::new(),
            flags: 0,
        }
    }

    /// Remove the record.
    pub fn delete() -> VisitOp {
        VisitOp {
            buf: Vec::new(),
            flags: OP_DELETE,
        }
    }

    /// Replace the record, taking ownership of the buffer.
    pub fn set(buf: Vec<u8>) -> VisitOp {
        VisitOp {
            buf,
            flags: OP_SET,
        }
    }

    /// Replace the record with a copy of a borrowed buffer that is only
    /// valid until the visitor returns.
    pub fn set_copy(buf: &[u8]) -> VisitOp {
        VisitOp {
            buf: buf.to_vec(),
            flags: OP_SET | OP_COPY,
        }
    }

    /// Create a bucket at the visited key.
    pub fn new_bucket() -> VisitOp {
        VisitOp {
            buf: Vec::new(),
            flags: OP_NEW_BUCKET,
        }
    }

    /// Create a bucket and immediately visit it.
    pub fn new_bucket_visit() -> VisitOp {
        VisitOp {
            buf: Vec::new(),
            flags: OP_NEW_BUCKET | OP_VISIT_BUCKET,
        }
    }

    fn is_set(&self) -> bool {
        self.flags & OP_SET != 0
    }

    fn is_delete(&self) -> bool {
        self.flags & OP_DELETE != 0
    }

    fn is_bucket(&self) -> bool {
        self.flags & OP_NEW_BUCKET != 0
    }

    fn visits_bucket(&self) -> bool {
        self.flags & OP_VISIT_BUCKET != 0
    }
}

impl fmt::Display for VisitOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_delete() {
            write!(f, "DELETE")
        } else if self.is_set() {
            if self.flags & OP_COPY != 0 {
                write!(f, "SET-COPY({:?})", self.buf)
            } else {
                write!(f, "SET({:?})", self.buf)
            }
        } else if self.is_bucket() {
            write!(f, "NEW_BUCKET")
        } else {
            write!(f, "NOP")
        }
    }
}

/// Callback capability invoked by [`accept_exact`] on a positioned slot.
pub trait Visitor {
    /// Preprocess the main operations.
    fn visit_before(&mut self) {}
    /// Postprocess the main operations; runs on every return path.
    fn visit_after(&mut self) {}
    /// Visit an existing plain record.
    fn visit_full(&mut self, _key: &[u8], _value: &[u8]) -> VisitOp {
        VisitOp::nop()
    }
    /// Visit an empty record slot.
    fn visit_empty(&mut self, _key: &[u8]) -> VisitOp {
        VisitOp::nop()
    }
    /// Visit a nested bucket.
    fn visit_bucket(&mut self, _key: &[u8], _bucket: &Bucket<'_>) {}
}

/// Visits, and possibly mutates, the slot for `key` on a positioned
/// cursor.
///
/// The cursor must stand where a `seek(key)` would land: on the first
/// slot with key >= `key`, or past the end after all smaller keys
/// (`previous_key < key <= current_key`). The slot is classified as
/// absent, bucket, radix/other, or plain value, and the matching visitor
/// callback decides what happens; write intents require `writable` and
/// fail with `InvalidWriteAttempt` otherwise.
pub fn accept_exact(
    key: &[u8],
    cursor: &mut Cursor<'_>,
    visitor: &mut dyn Visitor,
    writable: bool,
) -> Result<()> {
    let tx = cursor.tx();
    tx.check_open()?;
    if writable && !tx.writable() {
        return Err(SableError::TxNotWritable);
    }
    if key.is_empty() {
        return Err(SableError::KeyRequired);
    } else if key.len() > MAX_KEY_SIZE {
        return Err(SableError::KeyTooLarge);
    }

    visitor.visit_before();
    let result = accept_slot(key, cursor, visitor, writable);
    visitor.visit_after();
    result
}

fn accept_slot(
    key: &[u8],
    cursor: &mut Cursor<'_>,
    visitor: &mut dyn Visitor,
    writable: bool,
) -> Result<()> {
    let tx = cursor.tx();
    let bucket = Bucket::from_parts(tx, cursor.bucket_idx());
    let (k, v, flags) = cursor.key_value()?;

    // Case 1: no record under this key.
    if k.as_deref() != Some(key) {
        let op = visitor.visit_empty(key);
        if op.is_set() {
            if !writable {
                return Err(SableError::InvalidWriteAttempt);
            }
            let node = cursor.node()?;
            tx.state_mut().nodes[node].put(key, &op.buf, 0);
        } else if op.is_bucket() {
            if !writable {
                return Err(SableError::InvalidWriteAttempt);
            }
            let header = BucketHeader::default();
            let node = cursor.node()?;
            tx.state_mut().nodes[node].put(key, &header.encode(), BUCKET_LEAF_FLAG);
            if op.visits_bucket() {
                let opened = bucket
                    .bucket(key)?
                    .ok_or(SableError::Corruption("fresh bucket failed to open"))?;
                visitor.visit_bucket(key, &opened);
            }
        }
        return Ok(());
    }

    // Case 2: the record is a nested bucket.
    if flags & BUCKET_LEAF_FLAG != 0 {
        let opened = bucket
            .bucket(key)?
            .ok_or(SableError::Corruption("bucket slot failed to open"))?;
        visitor.visit_bucket(key, &opened);
        return Ok(());
    }

    // Case 3: a radix root or other non-value leaf; not a visitable record.
    if flags != 0 {
        return Ok(());
    }

    // Case 4: a plain record.
    let value = v.unwrap_or_default();
    let op = visitor.visit_full(key, &value);
    if op.is_set() {
        if !writable {
            return Err(SableError::InvalidWriteAttempt);
        }
        let node = cursor.node()?;
        tx.state_mut().nodes[node].put(key, &op.buf, 0);
    } else if op.is_delete() {
        if !writable {
            return Err(SableError::InvalidWriteAttempt);
        }
        let node = cursor.node()?;
        tx.state_mut().nodes[node].del(key);
    } else if op.is_bucket() {
        if !writable {
            return Err(SableError::InvalidWriteAttempt);
        }
        // The pair is simply replaced by a bucket in place.
        let header = BucketHeader::default();
        let node = cursor.node()?;
        tx.state_mut().nodes[node].put(key, &header.encode(), BUCKET_LEAF_FLAG);
        if op.visits_bucket() {
            let opened = bucket
                .bucket(key)?
                .ok_or(SableError::Corruption("fresh bucket failed to open"))?;
            visitor.visit_bucket(key, &opened);
        }
    }
    Ok(())
}

/// Cancellation capability consulted between linear-seek steps.
pub trait Cancel {
    fn is_cancelled(&self) -> bool;
}

/// A deadline-based [`Cancel`].
pub struct Deadline(pub Instant);

impl Cancel for Deadline {
    fn is_cancelled(&self) -> bool {
        Instant::now() >= self.0
    }
}

/// A [`Cancel`] that never fires.
pub struct Never;

impl Cancel for Never {
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Scans linearly from the cursor's current position to `seek`,
/// choosing the direction by comparison, and lands on the first slot
/// with key >= `seek`. Returns `None` when the cancellation carrier
/// fires or the key space is exhausted in the scan direction; no partial
/// state leaks beyond the cursor position.
///
/// Meant for targets known to be very close to the current position;
/// use `seek` otherwise.
pub fn linear_seek(
    cursor: &mut Cursor<'_>,
    cancel: &dyn Cancel,
    seek: &[u8],
) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
    let (k, v, _) = cursor.key_value()?;
    let (mut current_key, mut current_value) = match (k, v) {
        (Some(k), Some(v)) => (k, v),
        _ => return Ok(None),
    };
    if current_key.as_slice() >= seek {
        // Walk backward to the first slot at or before `seek`, then
        // correct one step forward if we overshot.
        while current_key.as_slice() > seek {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            match cursor.prev()? {
                Some((k, v)) => {
                    current_key = k;
                    current_value = v;
                }
                None => break,
            }
        }
        if current_key.as_slice() < seek {
            return cursor.next();
        }
        return Ok(Some((current_key, current_value)));
    }
    while current_key.as_slice() < seek {
        if cancel.is_cancelled() {
            return Ok(None);
        }
        match cursor.next()? {
            Some((k, v)) => {
                current_key = k;
                current_value = v;
            }
            None => return Ok(None),
        }
    }
    Ok(Some((current_key, current_value)))
}
