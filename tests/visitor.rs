use std::time::Instant;

use sable::{
    accept_exact, linear_seek, Deadline, Never, Options, Result, SableError, VisitOp, Visitor, DB,
};
use tempfile::tempdir;

#[derive(Default)]
struct Recorder {
    before: usize,
    after: usize,
    full: Vec<(Vec<u8>, Vec<u8>)>,
    empty: Vec<Vec<u8>>,
    buckets: Vec<Vec<u8>>,
    op: Option<fn() -> VisitOp>,
}

impl Visitor for Recorder {
    fn visit_before(&mut self) {
        self.before += 1;
    }

    fn visit_after(&mut self) {
        self.after += 1;
    }

    fn visit_full(&mut self, key: &[u8], value: &[u8]) -> VisitOp {
        self.full.push((key.to_vec(), value.to_vec()));
        self.op.take().map(|f| f()).unwrap_or_else(VisitOp::nop)
    }

    fn visit_empty(&mut self, key: &[u8]) -> VisitOp {
        self.empty.push(key.to_vec());
        self.op.take().map(|f| f()).unwrap_or_else(VisitOp::nop)
    }

    fn visit_bucket(&mut self, key: &[u8], _bucket: &sable::Bucket<'_>) {
        self.buckets.push(key.to_vec());
    }
}

fn open_db(dir: &tempfile::TempDir) -> DB {
    DB::open(dir.path().join("visitor.db"), Options::benchmark()).expect("open database")
}

#[test]
fn set_then_delete_through_visitors() -> Result<()> {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);
    db.update(|tx| {
        let root = tx.root();
        let mut cursor = root.cursor();

        // Empty bucket: the slot is absent and visit_empty fires.
        cursor.seek(b"k")?;
        let mut vis = Recorder {
            op: Some(|| VisitOp::set(b"v".to_vec())),
            ..Recorder::default()
        };
        accept_exact(b"k", &mut cursor, &mut vis, true)?;
        assert_eq!(vis.empty, vec![b"k".to_vec()]);
        assert!(vis.full.is_empty());
        assert_eq!((vis.before, vis.after), (1, 1));
        assert_eq!(root.get(b"k")?, Some(b"v".to_vec()));

        // Existing record: visit_full fires with the stored pair.
        cursor.seek(b"k")?;
        let mut vis = Recorder {
            op: Some(VisitOp::delete),
            ..Recorder::default()
        };
        accept_exact(b"k", &mut cursor, &mut vis, true)?;
        assert_eq!(vis.full, vec![(b"k".to_vec(), b"v".to_vec())]);
        assert_eq!(root.get(b"k")?, None);
        Ok(())
    })
}

#[test]
fn write_intents_require_writable_flag() -> Result<()> {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);
    db.update(|tx| {
        let root = tx.root();
        let mut cursor = root.cursor();
        cursor.seek(b"key")?;
        let mut vis = Recorder {
            op: Some(|| VisitOp::set_copy(b"nope")),
            ..Recorder::default()
        };
        // The transaction is writable but the caller did not request
        // write permission, so the set intent must be rejected.
        let err = accept_exact(b"key", &mut cursor, &mut vis, false).unwrap_err();
        assert!(matches!(err, SableError::InvalidWriteAttempt));
        assert_eq!((vis.before, vis.after), (1, 1));
        assert_eq!(root.get(b"key")?, None);
        Ok(())
    })?;

    let tx = db.begin()?;
    let root = tx.root();
    let mut cursor = root.cursor();
    cursor.seek(b"key")?;
    let mut vis = Recorder::default();
    let err = accept_exact(b"key", &mut cursor, &mut vis, true).unwrap_err();
    assert!(matches!(err, SableError::TxNotWritable));
    tx.rollback()?;
    Ok(())
}

#[test]
fn bucket_slots_route_to_visit_bucket() -> Result<()> {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);
    db.update(|tx| {
        tx.create_bucket(b"nested")?.put(b"inner", b"1")?;
        let root = tx.root();
        let mut cursor = root.cursor();
        cursor.seek(b"nested")?;
        let mut vis = Recorder {
            op: Some(|| VisitOp::set(b"clobber".to_vec())),
            ..Recorder::default()
        };
        accept_exact(b"nested", &mut cursor, &mut vis, true)?;
        assert_eq!(vis.buckets, vec![b"nested".to_vec()]);
        assert!(vis.full.is_empty());
        assert!(vis.empty.is_empty());
        // The bucket survives; the set intent never applied to it.
        assert_eq!(tx.bucket(b"nested")?.unwrap().get(b"inner")?, Some(b"1".to_vec()));
        Ok(())
    })
}

#[test]
fn new_bucket_intent_creates_and_visits() -> Result<()> {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);
    db.update(|tx| {
        let root = tx.root();
        let mut cursor = root.cursor();
        cursor.seek(b"fresh")?;
        let mut vis = Recorder {
            op: Some(VisitOp::new_bucket_visit),
            ..Recorder::default()
        };
        accept_exact(b"fresh", &mut cursor, &mut vis, true)?;
        assert_eq!(vis.empty, vec![b"fresh".to_vec()]);
        assert_eq!(vis.buckets, vec![b"fresh".to_vec()]);
        assert!(tx.bucket(b"fresh")?.is_some());
        Ok(())
    })
}

#[test]
fn radix_slots_are_not_visitable_records() -> Result<()> {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);
    db.update(|tx| {
        let rb = tx.create_radix_bucket(b"trie")?;
        rb.put(b"a", b"1")?;
        let root = tx.root();
        let mut cursor = root.cursor();
        cursor.seek(b"trie")?;
        let mut vis = Recorder {
            op: Some(|| VisitOp::set(b"clobber".to_vec())),
            ..Recorder::default()
        };
        accept_exact(b"trie", &mut cursor, &mut vis, false)?;
        // Neither visit_full nor any mutation happens on a radix slot.
        assert!(vis.full.is_empty());
        assert!(vis.empty.is_empty());
        assert!(vis.buckets.is_empty());
        assert_eq!((vis.before, vis.after), (1, 1));
        let rb = tx.radix_bucket(b"trie")?.expect("radix still intact");
        assert_eq!(rb.get(b"a")?, Some(b"1".to_vec()));
        Ok(())
    })
}

#[test]
fn accept_validates_key_length() -> Result<()> {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);
    db.update(|tx| {
        let root = tx.root();
        let mut cursor = root.cursor();
        cursor.seek(b"x")?;
        let mut vis = Recorder::default();
        assert!(matches!(
            accept_exact(b"", &mut cursor, &mut vis, false),
            Err(SableError::KeyRequired)
        ));
        let oversized = vec![b'x'; sable::MAX_KEY_SIZE + 1];
        assert!(matches!(
            accept_exact(&oversized, &mut cursor, &mut vis, false),
            Err(SableError::KeyTooLarge)
        ));
        assert_eq!(vis.before, 0, "validation failures precede visit_before");
        Ok(())
    })
}

#[test]
fn linear_seek_walks_both_directions() -> Result<()> {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);
    db.update(|tx| {
        let root = tx.root();
        for i in 0..20u32 {
            root.put(format!("key{i:02}").as_bytes(), b"v")?;
        }
        let mut cursor = root.cursor();
        cursor.first()?;

        let hit = linear_seek(&mut cursor, &Never, b"key07")?;
        assert_eq!(hit.map(|(k, _)| k), Some(b"key07".to_vec()));

        // Backward from the current position.
        let hit = linear_seek(&mut cursor, &Never, b"key03")?;
        assert_eq!(hit.map(|(k, _)| k), Some(b"key03".to_vec()));

        // A seek target between keys lands on the next larger key.
        let hit = linear_seek(&mut cursor, &Never, b"key045")?;
        assert_eq!(hit.map(|(k, _)| k), Some(b"key05".to_vec()));

        // Past the last key the scan runs out.
        let hit = linear_seek(&mut cursor, &Never, b"zzz")?;
        assert_eq!(hit, None);
        Ok(())
    })
}

#[test]
fn linear_seek_honors_cancellation() -> Result<()> {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);
    db.update(|tx| {
        let root = tx.root();
        for i in 0..50u32 {
            root.put(format!("key{i:02}").as_bytes(), b"v")?;
        }
        let mut cursor = root.cursor();
        cursor.first()?;
        let expired = Deadline(Instant::now());
        let hit = linear_seek(&mut cursor, &expired, b"key49")?;
        assert_eq!(hit, None);
        Ok(())
    })
}
