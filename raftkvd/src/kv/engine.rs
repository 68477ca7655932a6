//! In-memory storage engine
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, RwLock};

use raftkv_api::{decode_batch, encode_batch, Modify};
use tracing::{debug, trace};

use super::{CfIterator, KvResult, KvStorage, StorageReader};

type ColumnFamily = BTreeMap<Vec<u8>, Vec<u8>>;
type Data = BTreeMap<String, ColumnFamily>;

/// Column-family-aware in-memory engine
///
/// Readers share the data with the engine until the next write,
/// which then copies it.
#[derive(Clone, Debug, Default)]
pub struct MemKvStorage {
    data: Arc<RwLock<Arc<Data>>>,
}

impl MemKvStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn current(&self) -> Arc<Data> {
        self.data.read().expect("Locking failed").clone()
    }

    /// Number of keys in a column family
    pub fn len_cf(&self, cf: &str) -> usize {
        self.current().get(cf).map_or(0, BTreeMap::len)
    }

    /// Serialize all the data, to be used as snapshot data
    pub fn snapshot_data(&self) -> KvResult<Vec<u8>> {
        let data = self.current();
        let batch = data
            .iter()
            .flat_map(|(cf, kvs)| {
                kvs.iter().map(|(key, value)| Modify::Put {
                    cf: cf.clone(),
                    key: key.clone(),
                    value: value.clone(),
                })
            })
            .collect();
        Ok(encode_batch(batch)?)
    }

    /// Replace all the data with one from [`Self::snapshot_data`]
    pub fn restore_snapshot(&self, snapshot_data: &[u8]) -> KvResult<()> {
        let mut data = Data::new();
        if !snapshot_data.is_empty() {
            apply(&mut data, decode_batch(snapshot_data)?);
        }
        debug!(
            num_cfs = data.len(),
            "Restored key-value data from snapshot"
        );
        *self.data.write().expect("Locking failed") = Arc::new(data);
        Ok(())
    }
}

fn apply(data: &mut Data, batch: Vec<Modify>) {
    for modify in batch {
        match modify {
            Modify::Put { cf, key, value } => {
                data.entry(cf).or_default().insert(key, value);
            }
            Modify::Delete { cf, key } => {
                if let Some(cf) = data.get_mut(&cf) {
                    cf.remove(&key);
                }
            }
        }
    }
}

impl KvStorage for MemKvStorage {
    type Reader = MemReader;

    fn reader(&self) -> KvResult<MemReader> {
        Ok(MemReader {
            data: self.current(),
        })
    }

    fn write(&self, batch: Vec<Modify>) -> KvResult<()> {
        trace!(len = batch.len(), "Writing batch");
        let mut data = self.data.write().expect("Locking failed");
        apply(Arc::make_mut(&mut data), batch);
        Ok(())
    }
}

pub struct MemReader {
    data: Arc<Data>,
}

impl StorageReader for MemReader {
    type Iter = MemCfIterator;

    fn get_cf(&self, cf: &str, key: &[u8]) -> KvResult<Option<Vec<u8>>> {
        Ok(self.data.get(cf).and_then(|cf| cf.get(key)).cloned())
    }

    fn iter_cf(&self, cf: &str) -> MemCfIterator {
        let mut iter = MemCfIterator {
            data: self.data.clone(),
            cf: cf.to_owned(),
            current: None,
        };
        iter.seek(&[]);
        iter
    }
}

pub struct MemCfIterator {
    data: Arc<Data>,
    cf: String,
    current: Option<(Vec<u8>, Vec<u8>)>,
}

impl MemCfIterator {
    fn first_in(&self, range: (Bound<&[u8]>, Bound<&[u8]>)) -> Option<(Vec<u8>, Vec<u8>)> {
        self.data
            .get(&self.cf)?
            .range::<[u8], _>(range)
            .next()
            .map(|(k, v)| (k.clone(), v.clone()))
    }
}

impl CfIterator for MemCfIterator {
    fn seek(&mut self, key: &[u8]) {
        self.current = self.first_in((Bound::Included(key), Bound::Unbounded));
    }

    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn item(&self) -> Option<(&[u8], &[u8])> {
        self.current
            .as_ref()
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
    }

    fn next(&mut self) {
        if let Some((key, _)) = self.current.take() {
            self.current = self.first_in((Bound::Excluded(key.as_slice()), Bound::Unbounded));
        }
    }
}

#[cfg(test)]
fn put(cf: &str, key: &str, value: &str) -> Modify {
    Modify::Put {
        cf: cf.into(),
        key: key.into(),
        value: value.into(),
    }
}

#[test]
fn readers_see_a_consistent_view() -> anyhow::Result<()> {
    let engine = MemKvStorage::new();
    engine.write(vec![put("default", "a", "1"), put("lock", "a", "x")])?;

    let reader = engine.reader()?;
    engine.write(vec![
        put("default", "a", "2"),
        Modify::Delete {
            cf: "lock".into(),
            key: b"a".to_vec(),
        },
    ])?;

    assert_eq!(reader.get_cf("default", b"a")?, Some(b"1".to_vec()));
    assert_eq!(reader.get_cf("lock", b"a")?, Some(b"x".to_vec()));

    let reader = engine.reader()?;
    assert_eq!(reader.get_cf("default", b"a")?, Some(b"2".to_vec()));
    assert_eq!(reader.get_cf("lock", b"a")?, None);
    assert_eq!(reader.get_cf("nope", b"a")?, None);
    Ok(())
}

#[test]
fn iterator_walks_one_cf_in_order() -> anyhow::Result<()> {
    let engine = MemKvStorage::new();
    engine.write(vec![
        put("default", "c", "3"),
        put("default", "a", "1"),
        put("default", "b", "2"),
        put("write", "aa", "x"),
    ])?;

    let reader = engine.reader()?;
    let mut iter = reader.iter_cf("default");
    let mut keys = vec![];
    while iter.valid() {
        let (key, _) = iter.item().expect("valid");
        keys.push(key.to_vec());
        iter.next();
    }
    assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    assert_eq!(iter.item(), None);

    iter.seek(b"bb");
    assert_eq!(iter.item(), Some((&b"c"[..], &b"3"[..])));
    iter.seek(b"d");
    assert!(!iter.valid());

    assert!(!reader.iter_cf("missing").valid());
    Ok(())
}

#[test]
fn snapshot_data_restores_everything() -> anyhow::Result<()> {
    let engine = MemKvStorage::new();
    engine.write(vec![put("default", "a", "1"), put("lock", "b", "2")])?;
    let data = engine.snapshot_data()?;

    let other = MemKvStorage::new();
    other.write(vec![put("default", "z", "9")])?;
    other.restore_snapshot(&data)?;

    let reader = other.reader()?;
    assert_eq!(reader.get_cf("default", b"z")?, None);
    assert_eq!(reader.get_cf("default", b"a")?, Some(b"1".to_vec()));
    assert_eq!(reader.get_cf("lock", b"b")?, Some(b"2".to_vec()));
    assert_eq!(other.len_cf("lock"), 1);

    assert!(other.restore_snapshot(&[1, 2]).is_err());
    Ok(())
}
