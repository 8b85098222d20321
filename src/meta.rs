//! The two alternating meta pages that root the store.
//!
//! A committed transaction writes meta page `txid % 2`; open picks the
//! valid meta with the higher txid, which makes a torn meta write
//! recoverable from the other copy.

use std::convert::TryInto;
use std::ops::Range;

use crate::error::{Result, SableError};
use crate::page::{self, Pgid, PAGE_HDR_LEN};

pub const MAGIC: u32 = 0x53AB_1EDB;
pub const VERSION: u32 = 2;

const META_MAGIC: Range<usize> = 0..4;
const META_VERSION: Range<usize> = 4..8;
const META_PAGE_SIZE: Range<usize> = 8..12;
const META_FLAGS: Range<usize> = 12..16;
const META_ROOT: Range<usize> = 16..24;
const META_SEQUENCE: Range<usize> = 24..32;
const META_FREELIST: Range<usize> = 32..40;
const META_PGID: Range<usize> = 40..48;
const META_TXID: Range<usize> = 48..56;
const META_CHECKSUM: Range<usize> = 56..60;
const META_LEN: usize = 60;

/// Root pointer of a bucket as stored in its parent: root page id plus
/// a monotonically increasing sequence counter.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BucketHeader {
    pub root: Pgid,
    pub sequence: u64,
}

pub const BUCKET_HEADER_LEN: usize = 16;

impl BucketHeader {
    pub fn encode(&self) -> [u8; BUCKET_HEADER_LEN] {
        let mut buf = [0u8; BUCKET_HEADER_LEN];
        buf[0..8].copy_from_slice(&self.root.to_le_bytes());
        buf[8..16].copy_from_slice(&self.sequence.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < BUCKET_HEADER_LEN {
            return Err(SableError::Corruption("bucket header truncated"));
        }
        Ok(Self {
            root: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            sequence: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Meta {
    pub page_size: u32,
    pub flags: u32,
    pub root: BucketHeader,
    pub freelist: Pgid,
    /// High-water page id; pages `[0, pgid)` are part of the file.
    pub pgid: Pgid,
    pub txid: u64,
}

impl Meta {
    fn checksum_payload(&self, payload: &mut [u8]) {
        payload[META_MAGIC].copy_from_slice(&MAGIC.to_le_bytes());
        payload[META_VERSION].copy_from_slice(&VERSION.to_le_bytes());
        payload[META_PAGE_SIZE].copy_from_slice(&self.page_size.to_le_bytes());
        payload[META_FLAGS].copy_from_slice(&self.flags.to_le_bytes());
        payload[META_ROOT].copy_from_slice(&self.root.root.to_le_bytes());
        payload[META_SEQUENCE].copy_from_slice(&self.root.sequence.to_le_bytes());
        payload[META_FREELIST].copy_from_slice(&self.freelist.to_le_bytes());
        payload[META_PGID].copy_from_slice(&self.pgid.to_le_bytes());
        payload[META_TXID].copy_from_slice(&self.txid.to_le_bytes());
    }

    /// Encodes the meta into a full page buffer at `txid % 2`.
    pub fn write_page(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < PAGE_HDR_LEN + META_LEN {
            return Err(SableError::Invalid("meta buffer too small"));
        }
        buf.fill(0);
        page::write_header(buf, self.txid % 2, page::META_PAGE, 0, 0);
        let payload = &mut buf[PAGE_HDR_LEN..];
        self.checksum_payload(payload);
        let crc = crc32fast::hash(&payload[..META_CHECKSUM.start]);
        payload[META_CHECKSUM].copy_from_slice(&crc.to_le_bytes());
        Ok(())
    }

    /// Decodes and validates one meta page.
    pub fn read_page(buf: &[u8]) -> Result<Self> {
        if buf.len() < PAGE_HDR_LEN + META_LEN {
            return Err(SableError::Corruption("meta page truncated"));
        }
        let info = page::PageInfo::parse(buf)?;
        if info.flags & page::META_PAGE == 0 {
            return Err(SableError::Corruption("meta page has wrong flags"));
        }
        let payload = &buf[PAGE_HDR_LEN..];
        let magic = u32::from_le_bytes(payload[META_MAGIC].try_into().unwrap());
        if magic != MAGIC {
            return Err(SableError::Corruption("invalid meta magic"));
        }
        let version = u32::from_le_bytes(payload[META_VERSION].try_into().unwrap());
        if version != VERSION {
            return Err(SableError::Corruption("unsupported meta version"));
        }
        let stored = u32::from_le_bytes(payload[META_CHECKSUM].try_into().unwrap());
        let crc = crc32fast::hash(&payload[..META_CHECKSUM.start]);
        if stored != crc {
            return Err(SableError::Corruption("meta checksum mismatch"));
        }
        Ok(Self {
            page_size: u32::from_le_bytes(payload[META_PAGE_SIZE].try_into().unwrap()),
            flags: u32::from_le_bytes(payload[META_FLAGS].try_into().unwrap()),
            root: BucketHeader {
                root: u64::from_le_bytes(payload[META_ROOT].try_into().unwrap()),
                sequence: u64::from_le_bytes(payload[META_SEQUENCE].try_into().unwrap()),
            },
            freelist: u64::from_le_bytes(payload[META_FREELIST].try_into().unwrap()),
            pgid: u64::from_le_bytes(payload[META_PGID].try_into().unwrap()),
            txid: u64::from_le_bytes(payload[META_TXID].try_into().unwrap()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Meta {
        Meta {
            page_size: 4096,
            flags: 0,
            root: BucketHeader { root: 3, sequence: 9 },
            freelist: 2,
            pgid: 4,
            txid: 7,
        }
    }

    #[test]
    fn meta_roundtrip() {
        let meta = sample();
        let mut buf = vec![0u8; 4096];
        meta.write_page(&mut buf).unwrap();
        let decoded = Meta::read_page(&buf).unwrap();
        assert_eq!(decoded, meta);
    }

    #[test]
    fn meta_rejects_bit_flip() {
        let meta = sample();
        let mut buf = vec![0u8; 4096];
        meta.write_page(&mut buf).unwrap();
        buf[PAGE_HDR_LEN + 20] ^= 0xFF;
        let err = Meta::read_page(&buf).unwrap_err();
        assert!(matches!(err, SableError::Corruption(_)));
    }

    #[test]
    fn meta_rejects_bad_magic() {
        let meta = sample();
        let mut buf = vec![0u8; 4096];
        meta.write_page(&mut buf).unwrap();
        buf[PAGE_HDR_LEN] ^= 0x01;
        assert!(Meta::read_page(&buf).is_err());
    }

    #[test]
    fn bucket_header_roundtrip() {
        let hdr = BucketHeader { root: 11, sequence: 3 };
        let decoded = BucketHeader::decode(&hdr.encode()).unwrap();
        assert_eq!(decoded, hdr);
    }
}
