#![deny(missing_docs)]
//! Embedded log-structured persistence for telefab stores, backed by
//! sled.
//!
//! All stores share one sled database; each store lives in its own
//! tree. Keys and values are the canonical binary encodings of the
//! data model.

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

/// Factory opening one sled tree per attached master store, all inside
/// a single database directory.
#[derive(Debug)]
pub struct SledBackendFactory {
    dir: PathBuf,
}

impl SledBackendFactory {
    /// Construct a factory writing the database under `dir`.
    pub fn create<P: Into<PathBuf>>(dir: P) -> DynStoreBackendFactory {
        let out: DynStoreBackendFactory = Arc::new(Self { dir: dir.into() });
        out
    }
}

impl StoreBackendFactory for SledBackendFactory {
    fn default_config(&self, _config: &mut Config) -> FabResult<()> {
        Ok(())
    }

    fn create(
        &self,
        _builder: Arc<Builder>,
        store: &str,
    ) -> BoxFut<'static, FabResult<DynStoreBackend>> {
        let dir = self.dir.clone();
        let store = store.to_string();
        Box::pin(async move {
            let db = sled::open(&dir).map_err(|err| {
                FabError::backend_src(
                    format!("cannot open {}", dir.display()),
                    err,
                )
            })?;
            let out: DynStoreBackend =
                Box::new(SledBackend::open(&db, &store)?);
            Ok(out)
        })
    }
}

/// A sled-tree-backed store.
#[derive(Debug)]
pub struct SledBackend {
    tree: sled::Tree,
}

impl SledBackend {
    /// Open (or create) the tree for `store` inside `db`.
    pub fn open(db: &sled::Db, store: &str) -> FabResult<Self> {
        let tree = db.open_tree(store.as_bytes()).map_err(|err| {
            FabError::backend_src(format!("cannot open tree {store}"), err)
        })?;
        Ok(Self { tree })
    }
}

fn backend_err(err: sled::Error) -> FabError {
    FabError::backend_src("sled", err)
}

impl StoreBackend for SledBackend {
    fn put(
        &mut self,
        key: Value,
        value: Value,
        expiry: Option<Timestamp>,
    ) -> FabResult<()> {
        let k = codec::encode(&key);
        let v = encode_stored(&value, expiry);
        self.tree
            .insert(k.as_ref(), v.as_ref())
            .map_err(backend_err)?;
        self.tree.flush().map_err(backend_err)?;
        Ok(())
    }

    fn erase(&mut self, key: &Value) -> FabResult<bool> {
        let k = codec::encode(key);
        let present = self
            .tree
            .remove(k.as_ref())
            .map_err(backend_err)?
            .is_some();
        self.tree.flush().map_err(backend_err)?;
        Ok(present)
    }

    fn get(&self, key: &Value) -> FabResult<Option<Entry>> {
        let k = codec::encode(key);
        match self.tree.get(k.as_ref()).map_err(backend_err)? {
            None => Ok(None),
            Some(raw) => {
                let (value, expiry) = decode_stored(&raw)?;
                Ok(Some(Entry {
                    key: key.clone(),
                    value,
                    expiry,
                }))
            }
        }
    }

    fn size(&self) -> FabResult<u64> {
        Ok(self.tree.len() as u64)
    }

    fn snapshot(&self) -> FabResult<Vec<Entry>> {
        let mut out = Vec::new();
        for item in self.tree.iter() {
            let (k, v) = item.map_err(backend_err)?;
            let (key, rest) = codec::decode(&k)?;
            if !rest.is_empty() {
                return Err(FabError::backend(
                    "trailing bytes after stored key",
                ));
            }
            let (value, expiry) = decode_stored(&v)?;
            out.push(Entry { key, value, expiry });
        }
        Ok(out)
    }

    fn clear(&mut self) -> FabResult<()> {
        self.tree.clear().map_err(backend_err)?;
        self.tree.flush().map_err(backend_err)?;
        Ok(())
    }
}
