//! The telefab data model.
//!
//! A [Value] is a closed tagged sum over the kinds exchanged on the wire.
//! Values are immutable once constructed, equality is structural, and the
//! ordering is total: first by kind tag, then by kind-specific order.
//! Containers use B-tree collections so iteration order is canonical for
//! encoding.

use crate::{Timespan, Timestamp};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

/// Transport protocol discriminator of a [Value::Port].
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Protocol not known or not applicable.
    Unknown,
    /// TCP.
    Tcp,
    /// UDP.
    Udp,
    /// ICMP.
    Icmp,
}

impl Protocol {
    /// The wire byte for this protocol.
    pub fn tag(&self) -> u8 {
        match self {
            Protocol::Unknown => 0,
            Protocol::Tcp => 1,
            Protocol::Udp => 2,
            Protocol::Icmp => 3,
        }
    }

    /// Parse a wire byte into a protocol.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Protocol::Unknown),
            1 => Some(Protocol::Tcp),
            2 => Some(Protocol::Udp),
            3 => Some(Protocol::Icmp),
            _ => None,
        }
    }
}

/// The kind tag of a [Value], with the byte values used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Kind {
    /// The unit kind.
    None = 0,
    /// Boolean.
    Bool = 1,
    /// Unsigned 64-bit number.
    Count = 2,
    /// Signed 64-bit number.
    Integer = 3,
    /// IEEE-754 double.
    Real = 4,
    /// UTF-8 string.
    Str = 5,
    /// IPv4 or IPv6 address.
    Address = 6,
    /// Address plus prefix length.
    Subnet = 7,
    /// Port number plus protocol.
    Port = 8,
    /// Nanoseconds since unix epoch.
    Timestamp = 9,
    /// Signed nanosecond span.
    Timespan = 10,
    /// Named symbol.
    EnumValue = 11,
    /// Unordered collection, duplicates collapsed.
    Set = 12,
    /// Mapping with unique keys.
    Table = 13,
    /// Ordered sequence.
    Vector = 14,
}

impl Kind {
    /// Parse a wire tag byte into a kind.
    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => Kind::None,
            1 => Kind::Bool,
            2 => Kind::Count,
            3 => Kind::Integer,
            4 => Kind::Real,
            5 => Kind::Str,
            6 => Kind::Address,
            7 => Kind::Subnet,
            8 => Kind::Port,
            9 => Kind::Timestamp,
            10 => Kind::Timespan,
            11 => Kind::EnumValue,
            12 => Kind::Set,
            13 => Kind::Table,
            14 => Kind::Vector,
            _ => return None,
        })
    }
}

/// A typed telemetry value.
#[derive(Debug, Clone)]
pub enum Value {
    /// The unit value.
    None,
    /// A boolean.
    Bool(bool),
    /// An unsigned 64-bit number.
    Count(u64),
    /// A signed 64-bit number.
    Integer(i64),
    /// An IEEE-754 double.
    Real(f64),
    /// A UTF-8 string.
    Str(String),
    /// An IPv4 or IPv6 address.
    Address(IpAddr),
    /// An address plus prefix length in [0, 128].
    Subnet {
        /// Network address.
        addr: IpAddr,
        /// Prefix length; at most 32 for IPv4, 128 for IPv6.
        prefix: u8,
    },
    /// A transport-layer port.
    Port {
        /// The 16-bit port number.
        number: u16,
        /// The protocol discriminator.
        proto: Protocol,
    },
    /// An absolute time.
    Timestamp(Timestamp),
    /// A span of time.
    Timespan(Timespan),
    /// A named symbol of a remote enum type.
    EnumValue(String),
    /// An unordered collection; duplicates collapse on insert.
    Set(BTreeSet<Value>),
    /// A mapping from value to value with unique keys.
    Table(BTreeMap<Value, Value>),
    /// An ordered sequence.
    Vector(Vec<Value>),
}

impl Value {
    /// The kind of this value.
    pub fn kind(&self) -> Kind {
        match self {
            Value::None => Kind::None,
            Value::Bool(_) => Kind::Bool,
            Value::Count(_) => Kind::Count,
            Value::Integer(_) => Kind::Integer,
            Value::Real(_) => Kind::Real,
            Value::Str(_) => Kind::Str,
            Value::Address(_) => Kind::Address,
            Value::Subnet { .. } => Kind::Subnet,
            Value::Port { .. } => Kind::Port,
            Value::Timestamp(_) => Kind::Timestamp,
            Value::Timespan(_) => Kind::Timespan,
            Value::EnumValue(_) => Kind::EnumValue,
            Value::Set(_) => Kind::Set,
            Value::Table(_) => Kind::Table,
            Value::Vector(_) => Kind::Vector,
        }
    }

    /// Shorthand for constructing a set from an iterator of values.
    pub fn set<I: IntoIterator<Item = Value>>(items: I) -> Self {
        Value::Set(items.into_iter().collect())
    }

    /// Shorthand for constructing a vector from an iterator of values.
    pub fn vector<I: IntoIterator<Item = Value>>(items: I) -> Self {
        Value::Vector(items.into_iter().collect())
    }

    /// Shorthand for constructing a table from key/value pairs.
    /// Later duplicate keys overwrite earlier ones.
    pub fn table<I: IntoIterator<Item = (Value, Value)>>(items: I) -> Self {
        Value::Table(items.into_iter().collect())
    }
}

/// A total-order sort key for f64 following IEEE-754 totalOrder, so the
/// `Ord` impl for [Value] is lawful even in the presence of NaN.
fn real_order_key(v: f64) -> u64 {
    let bits = v.to_bits();
    if bits & (1 << 63) == 0 {
        bits | (1 << 63)
    } else {
        !bits
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        use Value::*;
        let tag_cmp = (self.kind() as u8).cmp(&(other.kind() as u8));
        if tag_cmp != Ordering::Equal {
            return tag_cmp;
        }
        match (self, other) {
            (None, None) => Ordering::Equal,
            (Bool(a), Bool(b)) => a.cmp(b),
            (Count(a), Count(b)) => a.cmp(b),
            (Integer(a), Integer(b)) => a.cmp(b),
            (Real(a), Real(b)) => real_order_key(*a).cmp(&real_order_key(*b)),
            (Str(a), Str(b)) => a.cmp(b),
            (Address(a), Address(b)) => a.cmp(b),
            (
                Subnet { addr: a, prefix: ap },
                Subnet { addr: b, prefix: bp },
            ) => a.cmp(b).then(ap.cmp(bp)),
            (
                Port { number: a, proto: ap },
                Port { number: b, proto: bp },
            ) => a.cmp(b).then(ap.cmp(bp)),
            (Timestamp(a), Timestamp(b)) => a.cmp(b),
            (Timespan(a), Timespan(b)) => a.cmp(b),
            (EnumValue(a), EnumValue(b)) => a.cmp(b),
            (Set(a), Set(b)) => a.iter().cmp(b.iter()),
            (Table(a), Table(b)) => a.iter().cmp(b.iter()),
            (Vector(a), Vector(b)) => a.iter().cmp(b.iter()),
            _ => unreachable!("kind tags compared equal"),
        }
    }
}

impl std::hash::Hash for Value {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        use Value::*;
        state.write_u8(self.kind() as u8);
        match self {
            None => (),
            Bool(b) => b.hash(state),
            Count(c) => c.hash(state),
            Integer(i) => i.hash(state),
            Real(r) => real_order_key(*r).hash(state),
            Str(s) => s.hash(state),
            Address(a) => a.hash(state),
            Subnet { addr, prefix } => {
                addr.hash(state);
                prefix.hash(state);
            }
            Port { number, proto } => {
                number.hash(state);
                proto.hash(state);
            }
            Timestamp(t) => t.hash(state),
            Timespan(t) => t.hash(state),
            EnumValue(s) => s.hash(state),
            Set(s) => {
                for v in s {
                    v.hash(state);
                }
            }
            Table(t) => {
                for (k, v) in t {
                    k.hash(state);
                    v.hash(state);
                }
            }
            Vector(v) => {
                for e in v {
                    e.hash(state);
                }
            }
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use Value::*;
        match self {
            None => f.write_str("none"),
            Bool(b) => write!(f, "{b}"),
            Count(c) => write!(f, "{c}"),
            Integer(i) => write!(f, "{i}"),
            Real(r) => write!(f, "{r}"),
            Str(s) => write!(f, "{s:?}"),
            Address(a) => write!(f, "{a}"),
            Subnet { addr, prefix } => write!(f, "{addr}/{prefix}"),
            Port { number, proto } => {
                let p = match proto {
                    Protocol::Unknown => "?",
                    Protocol::Tcp => "tcp",
                    Protocol::Udp => "udp",
                    Protocol::Icmp => "icmp",
                };
                write!(f, "{number}/{p}")
            }
            Timestamp(t) => write!(f, "{}ns", t.as_nanos()),
            Timespan(t) => write!(f, "+{}ns", t.as_nanos()),
            EnumValue(s) => f.write_str(s),
            Set(s) => {
                f.write_str("{")?;
                for (i, v) in s.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{v}")?;
                }
                f.write_str("}")
            }
            Table(t) => {
                f.write_str("{")?;
                for (i, (k, v)) in t.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k} -> {v}")?;
                }
                f.write_str("}")
            }
            Vector(v) => {
                f.write_str("[")?;
                for (i, e) in v.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{e}")?;
                }
                f.write_str("]")
            }
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<u64> for Value {
    fn from(c: u64) -> Self {
        Value::Count(c)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<f64> for Value {
    fn from(r: f64) -> Self {
        Value::Real(r)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.into())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<IpAddr> for Value {
    fn from(a: IpAddr) -> Self {
        Value::Address(a)
    }
}

impl From<Timestamp> for Value {
    fn from(t: Timestamp) -> Self {
        Value::Timestamp(t)
    }
}

impl From<Timespan> for Value {
    fn from(t: Timespan) -> Self {
        Value::Timespan(t)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ordering_is_by_kind_tag_first() {
        // count (tag 2) sorts before integer (tag 3) regardless of
        // numeric magnitude.
        assert!(Value::Count(u64::MAX) < Value::Integer(i64::MIN));
        assert!(Value::Bool(true) < Value::Count(0));
    }

    #[test]
    fn sets_deduplicate_on_insert() {
        let s = Value::set([
            Value::Integer(1),
            Value::Integer(2),
            Value::Integer(1),
        ]);
        match s {
            Value::Set(s) => assert_eq!(2, s.len()),
            _ => unreachable!(),
        }
    }

    #[test]
    fn real_total_order_handles_nan() {
        let mut vals = [
            Value::Real(f64::NAN),
            Value::Real(1.0),
            Value::Real(f64::NEG_INFINITY),
            Value::Real(-0.0),
            Value::Real(0.0),
        ];
        vals.sort();
        assert_eq!(Value::Real(f64::NEG_INFINITY), vals[0]);
        assert_eq!(Value::Real(-0.0), vals[1]);
        assert_eq!(Value::Real(0.0), vals[2]);
        assert_eq!(Value::Real(1.0), vals[3]);
        // NaN sorts last and compares equal to itself.
        assert_eq!(vals[4], Value::Real(f64::NAN));
    }

    #[test]
    fn structural_equality_nested() {
        let a = Value::table([
            (Value::from("k"), Value::vector([Value::from(1_i64)])),
        ]);
        let b = Value::table([
            (Value::from("k"), Value::vector([Value::from(1_i64)])),
        ]);
        assert_eq!(a, b);
    }

    #[test]
    fn display_is_stable() {
        let v = Value::vector([
            Value::from("a"),
            Value::Port {
                number: 443,
                proto: Protocol::Tcp,
            },
        ]);
        assert_eq!("[\"a\", 443/tcp]", v.to_string());
    }
}
