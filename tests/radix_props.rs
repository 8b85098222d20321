use std::collections::BTreeMap;

use proptest::prelude::*;
use sable::{Options, DB};
use tempfile::tempdir;

#[derive(Clone, Debug)]
enum Op {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

fn small_key() -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(prop_oneof![Just(b'a'), Just(b'b'), Just(b'c')], 1..8)
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (small_key(), proptest::collection::vec(any::<u8>(), 1..16)).prop_map(|(k, v)| Op::Put(k, v)),
        small_key().prop_map(Op::Delete),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    // Any op sequence leaves the radix bucket agreeing with a BTreeMap
    // on point lookups and on full ordered iteration, both before and
    // after a commit/reopen cycle.
    #[test]
    fn radix_matches_reference_model(ops in proptest::collection::vec(op(), 1..120)) {
        let dir = tempdir().unwrap();
        let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();

        let in_tx = {
            let db = DB::open(dir.path().join("prop.db"), Options::benchmark()).unwrap();
            db.update(|tx| {
                let rb = tx.create_radix_bucket(b"t")?;
                for op in &ops {
                    match op {
                        Op::Put(k, v) => {
                            rb.put(k, v)?;
                            model.insert(k.clone(), v.clone());
                        }
                        Op::Delete(k) => {
                            rb.delete(k)?;
                            model.remove(k);
                        }
                    }
                }
                let mut iter = rb.iter();
                let mut seen = BTreeMap::new();
                while let Some((k, v)) = iter.next()? {
                    seen.insert(k, v);
                }
                Ok(seen)
            })
            .unwrap()
        };
        prop_assert_eq!(&in_tx, &model);

        let db = DB::open(dir.path().join("prop.db"), Options::benchmark()).unwrap();
        let (reopened, lookups) = db
            .view(|tx| {
                let rb = tx.radix_bucket(b"t")?.expect("radix bucket exists");
                let mut iter = rb.iter();
                let mut seen = BTreeMap::new();
                while let Some((k, v)) = iter.next()? {
                    seen.insert(k, v);
                }
                let mut lookups = BTreeMap::new();
                for k in model.keys() {
                    if let Some(v) = rb.get(k)? {
                        lookups.insert(k.clone(), v);
                    }
                }
                Ok((seen, lookups))
            })
            .unwrap();
        prop_assert_eq!(&reopened, &model);
        prop_assert_eq!(&lookups, &model);
    }
}
