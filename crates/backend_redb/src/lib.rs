#![deny(missing_docs)]
//! Embedded B-tree file persistence for telefab stores, backed by redb.
//!
//! One database file per store, one table inside it. Keys and values
//! are the canonical binary encodings of the data model, so a file
//! written by one endpoint is readable by any other.

use redb::{
    Database, ReadableTable, ReadableTableMetadata, TableDefinition,
};
use std::path::PathBuf;
use std::sync::Arc;
use telefab_api::{
    builder::Builder,
    codec,
    config::Config,
    store::{
        decode_stored, encode_stored, DynStoreBackend,
        DynStoreBackendFactory, Entry, StoreBackend, StoreBackendFactory,
    },
    BoxFut, FabError, FabResult, Timestamp, Value,
};

/// Store entries: key = encoded key value, value = expiry-prefixed
/// encoded value.
const ENTRIES: TableDefinition<&[u8], &[u8]> =
    TableDefinition::new("entries");

/// Factory creating one redb file per attached master store, under a
/// common data directory.
#[derive(Debug)]
pub struct RedbBackendFactory {
    dir: PathBuf,
}

impl RedbBackendFactory {
    /// Construct a factory writing store files under `dir`.
    pub fn create<P: Into<PathBuf>>(dir: P) -> DynStoreBackendFactory {
        let out: DynStoreBackendFactory = Arc::new(Self { dir: dir.into() });
        out
    }
}

impl StoreBackendFactory for RedbBackendFactory {
    fn default_config(&self, _config: &mut Config) -> FabResult<()> {
        Ok(())
    }

    fn create(
        &self,
        _builder: Arc<Builder>,
        store: &str,
    ) -> BoxFut<'static, FabResult<DynStoreBackend>> {
        let mut path = self.dir.clone();
        let file: String = store
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        path.push(format!("{file}.redb"));
        Box::pin(async move {
            let out: DynStoreBackend = Box::new(RedbBackend::open(path)?);
            Ok(out)
        })
    }
}

/// A redb-backed store.
#[derive(Debug)]
pub struct RedbBackend {
    db: Database,
}

impl RedbBackend {
    /// Open (or create) the database file at `path`.
    pub fn open<P: Into<PathBuf>>(path: P) -> FabResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| {
                FabError::backend_src(
                    format!("cannot create {}", parent.display()),
                    err,
                )
            })?;
        }
        let db = Database::create(&path).map_err(|err| {
            FabError::backend_src(
                format!("cannot open {}", path.display()),
                err,
            )
        })?;
        // Make sure the entries table exists so reads never special-case
        // a fresh file.
        let txn = db.begin_write().map_err(backend_err)?;
        txn.open_table(ENTRIES).map_err(backend_err)?;
        txn.commit().map_err(backend_err)?;
        Ok(Self { db })
    }

    fn read_entries<F, T>(&self, f: F) -> FabResult<T>
    where
        F: FnOnce(
            &redb::ReadOnlyTable<&'static [u8], &'static [u8]>,
        ) -> FabResult<T>,
    {
        let txn = self.db.begin_read().map_err(backend_err)?;
        let table = txn.open_table(ENTRIES).map_err(backend_err)?;
        f(&table)
    }
}

fn backend_err<E: std::error::Error + 'static + Send + Sync>(
    err: E,
) -> FabError {
    FabError::backend_src("redb", err)
}

impl StoreBackend for RedbBackend {
    fn put(
        &mut self,
        key: Value,
        value: Value,
        expiry: Option<Timestamp>,
    ) -> FabResult<()> {
        let k = codec::encode(&key);
        let v = encode_stored(&value, expiry);
        let txn = self.db.begin_write().map_err(backend_err)?;
        {
            let mut table = txn.open_table(ENTRIES).map_err(backend_err)?;
            table.insert(k.as_ref(), v.as_ref()).map_err(backend_err)?;
        }
        txn.commit().map_err(backend_err)
    }

    fn erase(&mut self, key: &Value) -> FabResult<bool> {
        let k = codec::encode(key);
        let txn = self.db.begin_write().map_err(backend_err)?;
        let present;
        {
            let mut table = txn.open_table(ENTRIES).map_err(backend_err)?;
            present =
                table.remove(k.as_ref()).map_err(backend_err)?.is_some();
        }
        txn.commit().map_err(backend_err)?;
        Ok(present)
    }

    fn get(&self, key: &Value) -> FabResult<Option<Entry>> {
        let k = codec::encode(key);
        self.read_entries(|table| {
            match table.get(k.as_ref()).map_err(backend_err)? {
                None => Ok(None),
                Some(guard) => {
                    let (value, expiry) = decode_stored(guard.value())?;
                    Ok(Some(Entry {
                        key: key.clone(),
                        value,
                        expiry,
                    }))
                }
            }
        })
    }

    fn size(&self) -> FabResult<u64> {
        self.read_entries(|table| table.len().map_err(backend_err))
    }

    fn snapshot(&self) -> FabResult<Vec<Entry>> {
        self.read_entries(|table| {
            let mut out = Vec::new();
            for item in table.iter().map_err(backend_err)? {
                let (k, v) = item.map_err(backend_err)?;
                let (key, rest) = codec::decode(k.value())?;
                if !rest.is_empty() {
                    return Err(FabError::backend(
                        "trailing bytes after stored key",
                    ));
                }
                let (value, expiry) = decode_stored(v.value())?;
                out.push(Entry { key, value, expiry });
            }
            Ok(out)
        })
    }

    fn clear(&mut self) -> FabResult<()> {
        let txn = self.db.begin_write().map_err(backend_err)?;
        {
            txn.delete_table(ENTRIES).map_err(backend_err)?;
            txn.open_table(ENTRIES).map_err(backend_err)?;
        }
        txn.commit().map_err(backend_err)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn open() -> (RedbBackend, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let backend =
            RedbBackend::open(dir.path().join("test.redb")).unwrap();
        (backend, dir)
    }

    #[test]
    fn put_get_erase_round_trip() {
        let (mut b, _dir) = open();
        let key = Value::from("conn/1");
        let value = Value::vector([
            Value::Address("10.0.0.1".parse().unwrap()),
            Value::Count(443),
        ]);
        b.put(key.clone(), value.clone(), None).unwrap();

        let got = b.get(&key).unwrap().unwrap();
        assert_eq!(value, got.value);
        assert_eq!(None, got.expiry);
        assert_eq!(1, b.size().unwrap());

        assert!(b.erase(&key).unwrap());
        assert!(!b.erase(&key).unwrap());
        assert_eq!(0, b.size().unwrap());
    }

    #[test]
    fn expiry_survives_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.redb");
        let key = Value::from("k");
        let at = Timestamp::from_nanos(123_456_789);
        {
            let mut b = RedbBackend::open(&path).unwrap();
            b.put(key.clone(), Value::from(1_i64), Some(at)).unwrap();
        }
        let b = RedbBackend::open(&path).unwrap();
        assert_eq!(Some(at), b.get(&key).unwrap().unwrap().expiry);
    }

    #[test]
    fn snapshot_and_clear() {
        let (mut b, _dir) = open();
        for i in 0..5_i64 {
            b.put(Value::Integer(i), Value::Integer(i * 10), None)
                .unwrap();
        }
        let snap = b.snapshot().unwrap();
        assert_eq!(5, snap.len());
        b.clear().unwrap();
        assert!(b.snapshot().unwrap().is_empty());
    }

    #[test]
    fn add_through_shared_semantics() {
        let (mut b, _dir) = open();
        b.put(Value::from("n"), Value::Count(5), None).unwrap();
        let e = b.add(Value::from("n"), Value::Count(3), None).unwrap();
        assert_eq!(Value::Count(8), e.value);
        assert!(b
            .add(Value::from("n"), Value::from("oops"), None)
            .is_err());
    }
}
