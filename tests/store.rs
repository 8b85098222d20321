use std::collections::BTreeMap;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use sable::{Options, Result, SableError, DB};
use tempfile::tempdir;

fn open_db(dir: &tempfile::TempDir) -> DB {
    DB::open(dir.path().join("store.db"), Options::benchmark()).expect("open database")
}

#[test]
fn put_get_delete_roundtrip() -> Result<()> {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);
    db.update(|tx| {
        let root = tx.root();
        root.put(b"alpha", b"1")?;
        root.put(b"beta", b"2")?;
        assert_eq!(root.get(b"alpha")?, Some(b"1".to_vec()));
        root.put(b"alpha", b"1b")?;
        assert_eq!(root.get(b"alpha")?, Some(b"1b".to_vec()));
        root.delete(b"beta")?;
        assert_eq!(root.get(b"beta")?, None);
        root.delete(b"never-there")?;
        Ok(())
    })?;

    db.view(|tx| {
        assert_eq!(tx.root().get(b"alpha")?, Some(b"1b".to_vec()));
        assert_eq!(tx.root().get(b"beta")?, None);
        Ok(())
    })
}

#[test]
fn bulk_load_survives_reopen() -> Result<()> {
    let dir = tempdir().unwrap();
    let mut expected: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
    {
        let db = open_db(&dir);
        db.update(|tx| {
            let root = tx.root();
            let mut rng = ChaCha8Rng::seed_from_u64(7);
            for i in 0..3_000u32 {
                let key = format!("row/{:08x}", rng.gen::<u32>()).into_bytes();
                let value = format!("payload-{i}").into_bytes();
                root.put(&key, &value)?;
                expected.insert(key, value);
            }
            Ok(())
        })?;
    }

    let db = open_db(&dir);
    db.view(|tx| {
        let mut cursor = tx.root().cursor();
        let mut seen = BTreeMap::new();
        let mut entry = cursor.first()?;
        while let Some((k, v)) = entry {
            seen.insert(k, v);
            entry = cursor.next()?;
        }
        assert_eq!(seen, expected);
        Ok(())
    })
}

#[test]
fn cursor_orders_and_seeks() -> Result<()> {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);
    db.update(|tx| {
        let root = tx.root();
        for key in [b"b".as_ref(), b"d", b"f"] {
            root.put(key, b"x")?;
        }
        let mut cursor = root.cursor();
        assert_eq!(cursor.first()?.map(|(k, _)| k), Some(b"b".to_vec()));
        assert_eq!(cursor.next()?.map(|(k, _)| k), Some(b"d".to_vec()));
        assert_eq!(cursor.prev()?.map(|(k, _)| k), Some(b"b".to_vec()));
        assert_eq!(cursor.last()?.map(|(k, _)| k), Some(b"f".to_vec()));
        assert_eq!(cursor.next()?, None);

        // Seek lands on the first key >= the target.
        assert_eq!(cursor.seek(b"c")?.map(|(k, _)| k), Some(b"d".to_vec()));
        assert_eq!(cursor.seek(b"d")?.map(|(k, _)| k), Some(b"d".to_vec()));
        assert_eq!(cursor.seek(b"g")?, None);
        Ok(())
    })
}

#[test]
fn nested_buckets_roundtrip() -> Result<()> {
    let dir = tempdir().unwrap();
    {
        let db = open_db(&dir);
        db.update(|tx| {
            let outer = tx.create_bucket(b"outer")?;
            outer.put(b"k", b"v")?;
            let inner = outer.create_bucket(b"inner")?;
            inner.put(b"deep", b"value")?;
            assert!(matches!(
                outer.create_bucket(b"inner"),
                Err(SableError::BucketExists)
            ));
            assert!(matches!(
                outer.create_bucket(b"k"),
                Err(SableError::IncompatibleValue)
            ));
            Ok(())
        })?;
    }

    let db = open_db(&dir);
    db.update(|tx| {
        let outer = tx.bucket(b"outer")?.expect("outer bucket");
        assert_eq!(outer.get(b"k")?, Some(b"v".to_vec()));
        let inner = outer.bucket(b"inner")?.expect("inner bucket");
        assert_eq!(inner.get(b"deep")?, Some(b"value".to_vec()));

        // A bucket slot reads as absent through plain get and refuses
        // plain delete.
        assert_eq!(outer.get(b"inner")?, None);
        assert!(matches!(
            outer.delete(b"inner"),
            Err(SableError::IncompatibleValue)
        ));

        outer.delete_bucket(b"inner")?;
        assert!(outer.bucket(b"inner")?.is_none());
        assert!(matches!(
            outer.delete_bucket(b"inner"),
            Err(SableError::BucketNotFound)
        ));
        Ok(())
    })
}

#[test]
fn readers_keep_their_snapshot() -> Result<()> {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);
    db.update(|tx| tx.root().put(b"k", b"old"))?;

    let reader = db.begin()?;
    assert_eq!(reader.root().get(b"k")?, Some(b"old".to_vec()));

    db.update(|tx| tx.root().put(b"k", b"new"))?;

    // The open reader still sees its begin-time snapshot.
    assert_eq!(reader.root().get(b"k")?, Some(b"old".to_vec()));
    reader.rollback()?;

    db.view(|tx| {
        assert_eq!(tx.root().get(b"k")?, Some(b"new".to_vec()));
        Ok(())
    })
}

#[test]
fn rollback_discards_changes() -> Result<()> {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);
    db.update(|tx| tx.root().put(b"stable", b"1"))?;

    let tx = db.begin_rw()?;
    tx.root().put(b"volatile", b"x")?;
    tx.root().delete(b"stable")?;
    tx.rollback()?;

    db.view(|tx| {
        assert_eq!(tx.root().get(b"volatile")?, None);
        assert_eq!(tx.root().get(b"stable")?, Some(b"1".to_vec()));
        Ok(())
    })?;

    // Freed state reloads cleanly: further writes still commit.
    db.update(|tx| tx.root().put(b"after", b"2"))?;
    db.view(|tx| {
        assert_eq!(tx.root().get(b"after")?, Some(b"2".to_vec()));
        Ok(())
    })
}

#[test]
fn pages_are_recycled_across_transactions() -> Result<()> {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);
    let payload = vec![7u8; 512];
    for round in 0..30u32 {
        db.update(|tx| {
            let root = tx.root();
            for i in 0..50u32 {
                root.put(format!("churn/{i}").as_bytes(), &payload)?;
            }
            root.put(format!("round/{round}").as_bytes(), b"done")?;
            Ok(())
        })?;
    }
    drop(db);

    // Copy-on-write with a freelist must not grow the file linearly
    // with the number of rewrites of the same working set.
    let len = std::fs::metadata(dir.path().join("store.db")).unwrap().len();
    assert!(
        len < 600 * 1024,
        "file grew to {len} bytes; freelist reuse is broken"
    );

    let db = open_db(&dir);
    db.view(|tx| {
        assert_eq!(tx.root().get(b"churn/49")?, Some(payload.clone()));
        assert_eq!(tx.root().get(b"round/29")?, Some(b"done".to_vec()));
        Ok(())
    })
}

#[test]
fn oversized_values_use_overflow_pages() -> Result<()> {
    let dir = tempdir().unwrap();
    let big = vec![0xCD; 5 * sable::DEFAULT_PAGE_SIZE + 123];
    {
        let db = open_db(&dir);
        db.update(|tx| tx.root().put(b"blob", &big))?;
    }
    let db = open_db(&dir);
    db.view(|tx| {
        assert_eq!(tx.root().get(b"blob")?, Some(big.clone()));
        Ok(())
    })
}

#[test]
fn validation_errors_surface() -> Result<()> {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);
    db.update(|tx| {
        let root = tx.root();
        assert!(matches!(root.put(b"", b"v"), Err(SableError::KeyRequired)));
        let oversized_key = vec![b'k'; sable::MAX_KEY_SIZE + 1];
        assert!(matches!(
            root.put(&oversized_key, b"v"),
            Err(SableError::KeyTooLarge)
        ));
        assert!(matches!(
            tx.create_bucket(b""),
            Err(SableError::BucketNameRequired)
        ));
        Ok(())
    })?;

    let tx = db.begin()?;
    assert!(matches!(
        tx.root().put(b"k", b"v"),
        Err(SableError::TxNotWritable)
    ));
    tx.rollback()?;
    Ok(())
}

#[test]
fn sequence_counters_persist() -> Result<()> {
    let dir = tempdir().unwrap();
    {
        let db = open_db(&dir);
        db.update(|tx| {
            let bucket = tx.create_bucket(b"seq")?;
            assert_eq!(bucket.next_sequence()?, 1);
            assert_eq!(bucket.next_sequence()?, 2);
            Ok(())
        })?;
    }
    let db = open_db(&dir);
    db.update(|tx| {
        let bucket = tx.bucket(b"seq")?.expect("bucket");
        assert_eq!(bucket.sequence(), 2);
        assert_eq!(bucket.next_sequence()?, 3);
        Ok(())
    })
}

#[test]
fn update_propagates_errors_and_rolls_back() -> Result<()> {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);
    let err = db.update(|tx| {
        tx.root().put(b"doomed", b"x")?;
        Err::<(), _>(SableError::Invalid("caller bailed"))
    });
    assert!(matches!(err, Err(SableError::Invalid(_))));
    db.view(|tx| {
        assert_eq!(tx.root().get(b"doomed")?, None);
        Ok(())
    })
}
