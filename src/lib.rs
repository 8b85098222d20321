//! An embedded, single-file, memory-mapped key-value store.
//!
//! The host store is a copy-on-write B+tree with buckets, cursors, and
//! single-writer/many-reader transactions. On top of it, `sable` adds a
//! persistent radix-trie bucket type with prefix queries and ordered
//! iteration, a visitor-driven cursor primitive, and a column-merging
//! record codec for multi-version rows.

pub mod bucket;
pub mod cursor;
pub mod db;
pub mod error;
pub mod radix;
pub mod record;
pub mod visitor;

mod flock;
mod freelist;
mod meta;
mod node;
mod page;
mod tx;

pub use crate::bucket::Bucket;
pub use crate::cursor::Cursor;
pub use crate::db::{Options, DB, DEFAULT_PAGE_SIZE};
pub use crate::error::{Result, SableError};
pub use crate::page::{MAX_KEY_SIZE, MAX_VALUE_SIZE};
pub use crate::radix::{Iter, RadixBucket};
pub use crate::record::{delete_row, Column, Merger, Row, RowScanner};
pub use crate::tx::Tx;
pub use crate::visitor::{accept_exact, linear_seek, Cancel, Deadline, Never, VisitOp, Visitor};
