//! The in-memory store backend.

use std::collections::HashMap;
use std::sync::Arc;
use telefab_api::{
    builder::Builder,
    config::Config,
    store::{
        DynStoreBackend, DynStoreBackendFactory, Entry, StoreBackend,
        StoreBackendFactory,
    },
    BoxFut, FabResult, Timestamp, Value,
};

/// Factory for hash-map-backed store state. The default backend: fast,
/// unpersisted, gone on restart.
#[derive(Debug)]
pub struct MemBackendFactory {}

impl MemBackendFactory {
    /// Construct a new MemBackendFactory.
    pub fn create() -> DynStoreBackendFactory {
        let out: DynStoreBackendFactory = Arc::new(Self {});
        out
    }
}

impl StoreBackendFactory for MemBackendFactory {
    fn default_config(&self, _config: &mut Config) -> FabResult<()> {
        Ok(())
    }

    fn create(
        &self,
        _builder: Arc<Builder>,
        _store: &str,
    ) -> BoxFut<'static, FabResult<DynStoreBackend>> {
        Box::pin(async move {
            let out: DynStoreBackend = Box::new(MemBackend::default());
            Ok(out)
        })
    }
}

/// Hash-map store state owned by a single master actor.
#[derive(Debug, Default)]
pub struct MemBackend {
    entries: HashMap<Value, (Value, Option<Timestamp>)>,
}

impl StoreBackend for MemBackend {
    fn put(
        &mut self,
        key: Value,
        value: Value,
        expiry: Option<Timestamp>,
    ) -> FabResult<()> {
        self.entries.insert(key, (value, expiry));
        Ok(())
    }

    fn erase(&mut self, key: &Value) -> FabResult<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    fn get(&self, key: &Value) -> FabResult<Option<Entry>> {
        Ok(self.entries.get(key).map(|(value, expiry)| Entry {
            key: key.clone(),
            value: value.clone(),
            expiry: *expiry,
        }))
    }

    fn size(&self) -> FabResult<u64> {
        Ok(self.entries.len() as u64)
    }

    fn snapshot(&self) -> FabResult<Vec<Entry>> {
        Ok(self
            .entries
            .iter()
            .map(|(key, (value, expiry))| Entry {
                key: key.clone(),
                value: value.clone(),
                expiry: *expiry,
            })
            .collect())
    }

    fn clear(&mut self) -> FabResult<()> {
        self.entries.clear();
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use telefab_api::FabError;

    fn backend() -> MemBackend {
        MemBackend::default()
    }

    #[test]
    fn put_get_erase() {
        let mut b = backend();
        b.put(Value::from("k"), Value::from(1_i64), None).unwrap();
        assert_eq!(
            Value::from(1_i64),
            b.get(&Value::from("k")).unwrap().unwrap().value,
        );
        assert!(b.erase(&Value::from("k")).unwrap());
        assert!(!b.erase(&Value::from("k")).unwrap());
        assert!(b.get(&Value::from("k")).unwrap().is_none());
    }

    #[test]
    fn add_and_subtract_through_default_impls() {
        let mut b = backend();
        b.put(Value::from("n"), Value::from(7_i64), None).unwrap();
        let e = b.add(Value::from("n"), Value::from(2_i64), None).unwrap();
        assert_eq!(Value::from(9_i64), e.value);
        let e = b
            .subtract(Value::from("n"), Value::from(4_i64), None)
            .unwrap();
        assert_eq!(Value::from(5_i64), e.value);
        assert!(matches!(
            b.add(Value::from("n"), Value::from("oops"), None),
            Err(FabError::TypeClash { .. })
        ));
    }

    #[test]
    fn expire_needs_all_three_conditions() {
        let mut b = backend();
        let now = Timestamp::from_nanos(1_000);
        // missing key
        assert!(!b.expire(&Value::from("k"), now).unwrap());
        // no expiry set
        b.put(Value::from("k"), Value::from(1_i64), None).unwrap();
        assert!(!b.expire(&Value::from("k"), now).unwrap());
        // expiry in the future
        b.put(
            Value::from("k"),
            Value::from(1_i64),
            Some(Timestamp::from_nanos(2_000)),
        )
        .unwrap();
        assert!(!b.expire(&Value::from("k"), now).unwrap());
        // expiry passed
        assert!(!b
            .expire(&Value::from("k"), Timestamp::from_nanos(1_999))
            .unwrap());
        assert!(b
            .expire(&Value::from("k"), Timestamp::from_nanos(2_000))
            .unwrap());
        assert!(b.get(&Value::from("k")).unwrap().is_none());
    }

    #[test]
    fn snapshot_and_keys() {
        let mut b = backend();
        b.put(Value::from("a"), Value::from(1_i64), None).unwrap();
        b.put(Value::from("b"), Value::from(2_i64), None).unwrap();
        assert_eq!(2, b.size().unwrap());
        assert_eq!(2, b.snapshot().unwrap().len());
        let mut keys = b.keys().unwrap();
        keys.sort();
        assert_eq!(vec![Value::from("a"), Value::from("b")], keys);
        b.clear().unwrap();
        assert_eq!(0, b.size().unwrap());
    }
}
