//! Store-overlay types: commands, events, queries, and the narrow
//! persistence interface masters delegate to.

use crate::{
    BoxFut, ErrorCode, FabError, FabResult, Kind, Timestamp, Value,
};
use std::sync::Arc;

/// One stored entry of a key/value store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// The unique key.
    pub key: Value,
    /// The stored value.
    pub value: Value,
    /// Absolute expiry; entries at or past it read as absent.
    pub expiry: Option<Timestamp>,
}

/// A mutation request against a store, applied by its master.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Unconditionally set `key` to `value`.
    Put {
        /// Key to write.
        key: Value,
        /// Value to store.
        value: Value,
        /// Optional absolute expiry.
        expiry: Option<Timestamp>,
    },
    /// Combine `delta` into the existing value: numeric add, set union,
    /// string concatenation, or vector append, per left-operand type.
    /// Fails with a type clash the caller observes in the response.
    Add {
        /// Request id used to answer the caller.
        request_id: u64,
        /// Key to modify.
        key: Value,
        /// Right operand.
        delta: Value,
        /// Optional absolute expiry for the result.
        expiry: Option<Timestamp>,
    },
    /// Remove `delta` from the existing value: numeric subtract or set
    /// difference. Fails with a type clash the caller observes in the
    /// response.
    Subtract {
        /// Request id used to answer the caller.
        request_id: u64,
        /// Key to modify.
        key: Value,
        /// Right operand.
        delta: Value,
        /// Optional absolute expiry for the result.
        expiry: Option<Timestamp>,
    },
    /// Remove `key` entirely.
    Erase {
        /// Key to remove.
        key: Value,
    },
    /// Remove `key` iff it exists, has an expiry, and that expiry has
    /// passed. The response carries whether it was removed.
    Expire {
        /// Request id used to answer the caller.
        request_id: u64,
        /// Key to expire.
        key: Value,
    },
    /// Set `key` iff it is currently absent; the response carries the
    /// success boolean back to the requester.
    PutUnique {
        /// Request id used to answer the caller.
        request_id: u64,
        /// Key to write.
        key: Value,
        /// Value to store.
        value: Value,
        /// Optional absolute expiry.
        expiry: Option<Timestamp>,
    },
    /// Drop every entry.
    Clear,
}

/// The replicated outcome of a command, published to clones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A key now holds this value.
    Update {
        /// Key written.
        key: Value,
        /// Resulting value.
        value: Value,
        /// Resulting expiry.
        expiry: Option<Timestamp>,
    },
    /// A key was removed.
    Erase {
        /// Key removed.
        key: Value,
    },
    /// A key was removed because its expiry passed.
    Expire {
        /// Key removed.
        key: Value,
    },
    /// The store was wiped.
    Clear,
}

/// A read request resolved by the master.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    /// Fetch the value at `key`.
    Get {
        /// Key to read.
        key: Value,
    },
    /// Fetch an indexed aspect of the value at `key`.
    GetAspect {
        /// Key to read.
        key: Value,
        /// Index: table key, vector position, or set member probe.
        aspect: Value,
    },
    /// Does `key` exist (and is unexpired)?
    Exists {
        /// Key to probe.
        key: Value,
    },
    /// All live keys.
    Keys,
    /// Number of live entries.
    Size,
    /// Every live entry; used by clones to recover from event gaps.
    Snapshot,
}

/// The answer to a [Query] (or a [Command::PutUnique]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryReply {
    /// The operation failed.
    Err {
        /// Failure class.
        code: ErrorCode,
        /// Rendered context.
        context: String,
    },
    /// The operation produced one value.
    Ok(Value),
    /// The operation produced a full entry listing.
    Entries(Vec<Entry>),
}

impl QueryReply {
    /// Convert a reply back into the result the caller observes.
    pub fn into_result(self) -> FabResult<Value> {
        match self {
            QueryReply::Ok(v) => Ok(v),
            QueryReply::Entries(_) => {
                Err(FabError::other("unexpected entry listing reply"))
            }
            QueryReply::Err { code, context } => Err(match code {
                ErrorCode::TypeClash => FabError::type_clash(context),
                ErrorCode::NoSuchKey => FabError::no_such_key(context),
                ErrorCode::RequestTimeout => {
                    FabError::request_timeout(context)
                }
                ErrorCode::BackendFailure => FabError::backend(context),
                ErrorCode::ShutdownInProgress => {
                    FabError::ShutdownInProgress
                }
                _ => FabError::other(context),
            }),
        }
    }
}

impl From<&FabError> for QueryReply {
    fn from(err: &FabError) -> Self {
        QueryReply::Err {
            code: err.code(),
            context: err.to_string(),
        }
    }
}

/// The persistence interface a master delegates to.
///
/// A backend stores entries; the operation semantics (type-clash rules,
/// expiry visibility, uniqueness) live in shared helpers and in the
/// master actor, so drivers stay thin. Mutating operations return the
/// resulting entry where clones need it replicated.
///
/// Backends are owned and driven by exactly one master actor, hence the
/// `&mut self` receivers and no interior locking.
pub trait StoreBackend: 'static + Send + std::fmt::Debug {
    /// Unconditionally write an entry.
    fn put(
        &mut self,
        key: Value,
        value: Value,
        expiry: Option<Timestamp>,
    ) -> FabResult<()>;

    /// Apply [Command::Add] semantics, returning the resulting entry.
    /// A missing key starts from the neutral element of the delta kind.
    fn add(
        &mut self,
        key: Value,
        delta: Value,
        expiry: Option<Timestamp>,
    ) -> FabResult<Entry> {
        let base = self.get(&key)?.map(|e| e.value);
        let value = combine(base, delta, CombineOp::Add)?;
        self.put(key.clone(), value.clone(), expiry)?;
        Ok(Entry { key, value, expiry })
    }

    /// Apply [Command::Subtract] semantics, returning the resulting
    /// entry.
    fn subtract(
        &mut self,
        key: Value,
        delta: Value,
        expiry: Option<Timestamp>,
    ) -> FabResult<Entry> {
        let base = self.get(&key)?.map(|e| e.value);
        let value = combine(base, delta, CombineOp::Subtract)?;
        self.put(key.clone(), value.clone(), expiry)?;
        Ok(Entry { key, value, expiry })
    }

    /// Remove an entry. Returns whether it was present.
    fn erase(&mut self, key: &Value) -> FabResult<bool>;

    /// Remove an entry iff it exists, carries an expiry, and that
    /// expiry is at or before `now`. Returns whether it was removed.
    fn expire(&mut self, key: &Value, now: Timestamp) -> FabResult<bool> {
        match self.get(key)? {
            Some(Entry {
                expiry: Some(at), ..
            }) if at <= now => {
                self.erase(key)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Fetch an entry, expired or not. Expiry visibility is applied by
    /// the caller.
    fn get(&self, key: &Value) -> FabResult<Option<Entry>>;

    /// Fetch an indexed aspect of the value at `key`.
    fn get_aspect(
        &self,
        key: &Value,
        aspect: &Value,
    ) -> FabResult<Option<Value>> {
        match self.get(key)? {
            None => Ok(None),
            Some(e) => aspect_of(&e.value, aspect).map(Some),
        }
    }

    /// Does an entry exist (expired or not)?
    fn exists(&self, key: &Value) -> FabResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Number of stored entries (expired or not).
    fn size(&self) -> FabResult<u64>;

    /// Every stored entry.
    fn snapshot(&self) -> FabResult<Vec<Entry>>;

    /// Every stored key.
    fn keys(&self) -> FabResult<Vec<Value>> {
        Ok(self.snapshot()?.into_iter().map(|e| e.key).collect())
    }

    /// Drop every entry.
    fn clear(&mut self) -> FabResult<()>;
}

/// Boxed trait-object [StoreBackend].
pub type DynStoreBackend = Box<dyn StoreBackend>;

/// A factory for constructing [StoreBackend] instances, one per
/// attached master store.
pub trait StoreBackendFactory: 'static + Send + Sync + std::fmt::Debug {
    /// Help the builder construct a default config.
    fn default_config(&self, config: &mut crate::config::Config)
        -> FabResult<()>;

    /// Construct a backend for the store with the given name.
    fn create(
        &self,
        builder: Arc<crate::builder::Builder>,
        store: &str,
    ) -> BoxFut<'static, FabResult<DynStoreBackend>>;
}

/// Trait-object [StoreBackendFactory].
pub type DynStoreBackendFactory = Arc<dyn StoreBackendFactory>;

/// Serialize a stored value plus expiry for an on-disk driver:
/// `flag:u8 || expiry:i64le (when flagged) || encode(value)`.
pub fn encode_stored(
    value: &Value,
    expiry: Option<Timestamp>,
) -> bytes::Bytes {
    use bytes::BufMut;
    let mut buf = bytes::BytesMut::new();
    match expiry {
        None => buf.put_u8(0),
        Some(at) => {
            buf.put_u8(1);
            buf.put_i64_le(at.as_nanos());
        }
    }
    crate::codec::encode_into(value, &mut buf);
    buf.freeze()
}

/// Inverse of [encode_stored].
pub fn decode_stored(
    raw: &[u8],
) -> FabResult<(Value, Option<Timestamp>)> {
    let (expiry, rest) = match raw.first() {
        Some(0) => (None, &raw[1..]),
        Some(1) if raw.len() >= 9 => {
            let nanos = i64::from_le_bytes(
                raw[1..9].try_into().expect("len checked"),
            );
            (Some(Timestamp::from_nanos(nanos)), &raw[9..])
        }
        _ => {
            return Err(FabError::backend(
                "stored entry header is malformed",
            ))
        }
    };
    let (value, rest) = crate::codec::decode(rest)?;
    if !rest.is_empty() {
        return Err(FabError::backend(
            "trailing bytes after stored entry",
        ));
    }
    Ok((value, expiry))
}

pub(crate) enum CombineOp {
    Add,
    Subtract,
}

/// The neutral left operand used when add/subtract hits a missing key.
fn neutral_of(delta: &Value) -> FabResult<Value> {
    Ok(match delta.kind() {
        Kind::Count => Value::Count(0),
        Kind::Integer => Value::Integer(0),
        Kind::Real => Value::Real(0.0),
        Kind::Str => Value::Str(String::new()),
        Kind::Set => Value::set([]),
        Kind::Vector => Value::vector([]),
        Kind::Timespan => Value::Timespan(crate::Timespan::from_nanos(0)),
        other => {
            return Err(FabError::type_clash(format!(
                "cannot accumulate values of kind {other:?}"
            )))
        }
    })
}

/// Shared add/subtract value algebra, used by every backend driver.
pub(crate) fn combine(
    base: Option<Value>,
    delta: Value,
    op: CombineOp,
) -> FabResult<Value> {
    let base = match base {
        Some(b) => b,
        None => neutral_of(&delta)?,
    };
    let clash = |b: &Value, d: &Value| {
        FabError::type_clash(format!(
            "cannot combine {:?} with {:?}",
            b.kind(),
            d.kind()
        ))
    };
    Ok(match op {
        CombineOp::Add => match (base, delta) {
            (Value::Count(a), Value::Count(b)) => {
                Value::Count(a.wrapping_add(b))
            }
            (Value::Integer(a), Value::Integer(b)) => {
                Value::Integer(a.wrapping_add(b))
            }
            (Value::Real(a), Value::Real(b)) => Value::Real(a + b),
            (Value::Timespan(a), Value::Timespan(b)) => Value::Timespan(
                crate::Timespan::from_nanos(
                    a.as_nanos().wrapping_add(b.as_nanos()),
                ),
            ),
            (Value::Str(mut a), Value::Str(b)) => {
                a.push_str(&b);
                Value::Str(a)
            }
            (Value::Set(mut a), Value::Set(b)) => {
                a.extend(b);
                Value::Set(a)
            }
            (Value::Set(mut a), b) => {
                a.insert(b);
                Value::Set(a)
            }
            (Value::Vector(mut a), Value::Vector(b)) => {
                a.extend(b);
                Value::Vector(a)
            }
            (Value::Vector(mut a), b) => {
                a.push(b);
                Value::Vector(a)
            }
            (b, d) => return Err(clash(&b, &d)),
        },
        CombineOp::Subtract => match (base, delta) {
            (Value::Count(a), Value::Count(b)) => {
                Value::Count(a.saturating_sub(b))
            }
            (Value::Integer(a), Value::Integer(b)) => {
                Value::Integer(a.wrapping_sub(b))
            }
            (Value::Real(a), Value::Real(b)) => Value::Real(a - b),
            (Value::Timespan(a), Value::Timespan(b)) => Value::Timespan(
                crate::Timespan::from_nanos(
                    a.as_nanos().wrapping_sub(b.as_nanos()),
                ),
            ),
            (Value::Set(mut a), Value::Set(b)) => {
                for v in b.iter() {
                    a.remove(v);
                }
                Value::Set(a)
            }
            (Value::Set(mut a), b) => {
                a.remove(&b);
                Value::Set(a)
            }
            (b, d) => return Err(clash(&b, &d)),
        },
    })
}

/// Indexed access into a container value.
///
/// Tables index by key, vectors by `count` position, sets answer
/// membership. Anything else is a type clash.
pub fn aspect_of(value: &Value, aspect: &Value) -> FabResult<Value> {
    match value {
        Value::Table(t) => t.get(aspect).cloned().ok_or_else(|| {
            FabError::no_such_key(format!("no table entry for {aspect}"))
        }),
        Value::Vector(v) => match aspect {
            Value::Count(i) => {
                v.get(*i as usize).cloned().ok_or_else(|| {
                    FabError::no_such_key(format!(
                        "vector index {i} out of range"
                    ))
                })
            }
            _ => Err(FabError::type_clash(
                "vector aspect must be a count index",
            )),
        },
        Value::Set(s) => Ok(Value::Bool(s.contains(aspect))),
        other => Err(FabError::type_clash(format!(
            "values of kind {:?} have no aspects",
            other.kind()
        ))),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn combine_numeric_add_subtract() {
        let v = combine(
            Some(Value::Integer(7)),
            Value::Integer(2),
            CombineOp::Add,
        )
        .unwrap();
        assert_eq!(Value::Integer(9), v);
        let v =
            combine(Some(v), Value::Integer(4), CombineOp::Subtract).unwrap();
        assert_eq!(Value::Integer(5), v);
    }

    #[test]
    fn combine_missing_key_starts_neutral() {
        let v = combine(None, Value::Count(3), CombineOp::Add).unwrap();
        assert_eq!(Value::Count(3), v);
        let v = combine(
            None,
            Value::set([Value::from(1_i64)]),
            CombineOp::Add,
        )
        .unwrap();
        assert_eq!(Value::set([Value::from(1_i64)]), v);
    }

    #[test]
    fn combine_type_clash() {
        assert!(matches!(
            combine(
                Some(Value::Integer(7)),
                Value::from("oops"),
                CombineOp::Add
            ),
            Err(FabError::TypeClash { .. })
        ));
        assert!(matches!(
            combine(Some(Value::Bool(true)), Value::Bool(false), CombineOp::Add),
            Err(FabError::TypeClash { .. })
        ));
    }

    #[test]
    fn combine_string_concat_and_set_algebra() {
        let v = combine(
            Some(Value::from("foo")),
            Value::from("bar"),
            CombineOp::Add,
        )
        .unwrap();
        assert_eq!(Value::from("foobar"), v);

        let s = Value::set([Value::from(1_i64), Value::from(2_i64)]);
        let v = combine(
            Some(s),
            Value::set([Value::from(2_i64), Value::from(3_i64)]),
            CombineOp::Subtract,
        )
        .unwrap();
        assert_eq!(Value::set([Value::from(1_i64)]), v);
    }

    #[test]
    fn aspects() {
        let t = Value::table([(Value::from("a"), Value::from(1_i64))]);
        assert_eq!(
            Value::from(1_i64),
            aspect_of(&t, &Value::from("a")).unwrap()
        );
        assert!(matches!(
            aspect_of(&t, &Value::from("b")),
            Err(FabError::NoSuchKey { .. })
        ));

        let v = Value::vector([Value::from("x"), Value::from("y")]);
        assert_eq!(
            Value::from("y"),
            aspect_of(&v, &Value::Count(1)).unwrap()
        );
        assert!(aspect_of(&v, &Value::from("y")).is_err());

        let s = Value::set([Value::from(5_i64)]);
        assert_eq!(
            Value::Bool(true),
            aspect_of(&s, &Value::from(5_i64)).unwrap()
        );

        assert!(aspect_of(&Value::Integer(3), &Value::Count(0)).is_err());
    }

    #[test]
    fn query_reply_into_result() {
        assert_eq!(
            Value::Bool(true),
            QueryReply::Ok(Value::Bool(true)).into_result().unwrap()
        );
        assert!(matches!(
            QueryReply::Err {
                code: ErrorCode::NoSuchKey,
                context: "x".into()
            }
            .into_result(),
            Err(FabError::NoSuchKey { .. })
        ));
    }
}
