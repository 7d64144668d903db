//! Zero-copy views over encoded values.
//!
//! [decode_view] validates an encoded value once up front and then hands
//! out a [ValueView] that borrows the input buffer: strings are `&str`
//! slices, containers are lazy spans over the raw element bytes that
//! decode during iteration. Nothing is allocated while viewing, which is
//! what the per-message hot path wants.

use crate::codec::{
    read_u16_le, read_u32_le, read_u64_be, read_u64_le, read_u8, take,
    MAX_DEPTH,
};
use crate::{
    FabError, FabResult, Kind, Protocol, Timespan, Timestamp, Value,
};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// A borrowed decoding of one value.
#[derive(Debug, Clone, Copy)]
pub enum ValueView<'a> {
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
    /// A string slice into the input buffer.
    Str(&'a str),
    /// An address.
    Address(IpAddr),
    /// An address plus prefix length.
    Subnet {
        /// Network address.
        addr: IpAddr,
        /// Prefix length.
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
    /// A named symbol slice into the input buffer.
    EnumValue(&'a str),
    /// An unordered collection span.
    Set(ContainerView<'a>),
    /// A mapping span; elements iterate as key/value pairs.
    Table(ContainerView<'a>),
    /// An ordered sequence span.
    Vector(ContainerView<'a>),
}

/// A lazy span over the encoded elements of a container.
///
/// The span was fully validated by [decode_view], so iteration decodes
/// without re-checking and simply ends if the buffer were ever to
/// disagree.
#[derive(Debug, Clone, Copy)]
pub struct ContainerView<'a> {
    len: u32,
    elems: &'a [u8],
    pairs: bool,
}

impl<'a> ContainerView<'a> {
    /// Number of elements (entries, for a table).
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// True if the container has no elements.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterate single elements. For a table this yields keys and values
    /// alternating; prefer [ContainerView::iter_pairs] there.
    pub fn iter(&self) -> ViewIter<'a> {
        ViewIter {
            buf: self.elems,
            remaining: if self.pairs {
                self.len as usize * 2
            } else {
                self.len as usize
            },
        }
    }

    /// Iterate key/value pairs of a table span.
    pub fn iter_pairs(&self) -> PairIter<'a> {
        PairIter {
            inner: self.iter(),
        }
    }
}

/// Iterator over the elements of a [ContainerView].
pub struct ViewIter<'a> {
    buf: &'a [u8],
    remaining: usize,
}

impl<'a> Iterator for ViewIter<'a> {
    type Item = ValueView<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        decode_view_one(&mut self.buf, 0).ok()
    }
}

/// Iterator over the entries of a table [ContainerView].
pub struct PairIter<'a> {
    inner: ViewIter<'a>,
}

impl<'a> Iterator for PairIter<'a> {
    type Item = (ValueView<'a>, ValueView<'a>);

    fn next(&mut self) -> Option<Self::Item> {
        let k = self.inner.next()?;
        let v = self.inner.next()?;
        Some((k, v))
    }
}

/// Decode a view of one value from the front of `input`, returning the
/// view and the remaining bytes. The whole subtree is validated here so
/// later iteration over container spans cannot fail.
pub fn decode_view(input: &[u8]) -> FabResult<(ValueView<'_>, &[u8])> {
    // Validation pass: confirms tags, lengths, utf-8, and bounds.
    let mut check = input;
    skip_value(&mut check, 0)?;
    let mut rest = input;
    let view = decode_view_one(&mut rest, 0)?;
    Ok((view, rest))
}

fn decode_view_one<'a>(
    buf: &mut &'a [u8],
    depth: usize,
) -> FabResult<ValueView<'a>> {
    if depth > MAX_DEPTH {
        return Err(FabError::protocol("value nesting too deep"));
    }
    let tag = read_u8(buf)?;
    let kind = Kind::from_tag(tag)
        .ok_or_else(|| FabError::protocol(format!("unknown value tag: {tag}")))?;
    Ok(match kind {
        Kind::None => ValueView::None,
        Kind::Bool => ValueView::Bool(read_u8(buf)? != 0),
        Kind::Count => ValueView::Count(read_u64_le(buf)?),
        Kind::Integer => ValueView::Integer(read_u64_le(buf)? as i64),
        Kind::Real => ValueView::Real(f64::from_bits(read_u64_be(buf)?)),
        Kind::Str => ValueView::Str(read_str_slice(buf)?),
        Kind::Address => ValueView::Address(read_addr(buf)?),
        Kind::Subnet => {
            let addr = read_addr(buf)?;
            let prefix = read_u8(buf)?;
            ValueView::Subnet { addr, prefix }
        }
        Kind::Port => {
            let number = read_u16_le(buf)?;
            let proto = Protocol::from_tag(read_u8(buf)?).ok_or_else(|| {
                FabError::protocol("unknown port protocol")
            })?;
            ValueView::Port { number, proto }
        }
        Kind::Timestamp => ValueView::Timestamp(Timestamp::from_nanos(
            read_u64_le(buf)? as i64,
        )),
        Kind::Timespan => ValueView::Timespan(Timespan::from_nanos(
            read_u64_le(buf)? as i64,
        )),
        Kind::EnumValue => ValueView::EnumValue(read_str_slice(buf)?),
        Kind::Set | Kind::Table | Kind::Vector => {
            let len = read_u32_le(buf)?;
            let start = *buf;
            let per_elem = if kind == Kind::Table { 2 } else { 1 };
            for _ in 0..len as usize * per_elem {
                skip_value(buf, depth + 1)?;
            }
            let span = &start[..start.len() - buf.len()];
            let view = ContainerView {
                len,
                elems: span,
                pairs: kind == Kind::Table,
            };
            match kind {
                Kind::Set => ValueView::Set(view),
                Kind::Table => ValueView::Table(view),
                _ => ValueView::Vector(view),
            }
        }
    })
}

fn skip_value(buf: &mut &[u8], depth: usize) -> FabResult<()> {
    if depth > MAX_DEPTH {
        return Err(FabError::protocol("value nesting too deep"));
    }
    let tag = read_u8(buf)?;
    let kind = Kind::from_tag(tag)
        .ok_or_else(|| FabError::protocol(format!("unknown value tag: {tag}")))?;
    match kind {
        Kind::None => (),
        Kind::Bool => {
            read_u8(buf)?;
        }
        Kind::Count | Kind::Integer | Kind::Real | Kind::Timestamp
        | Kind::Timespan => {
            take(buf, 8)?;
        }
        Kind::Str | Kind::EnumValue => {
            read_str_slice(buf)?;
        }
        Kind::Address => {
            read_addr(buf)?;
        }
        Kind::Subnet => {
            let addr = read_addr(buf)?;
            let prefix = read_u8(buf)?;
            let max = match addr {
                IpAddr::V4(_) => 32,
                IpAddr::V6(_) => 128,
            };
            if prefix > max {
                return Err(FabError::protocol("subnet prefix out of range"));
            }
        }
        Kind::Port => {
            read_u16_le(buf)?;
            let proto = read_u8(buf)?;
            if Protocol::from_tag(proto).is_none() {
                return Err(FabError::protocol("unknown port protocol"));
            }
        }
        Kind::Set | Kind::Table | Kind::Vector => {
            let len = read_u32_le(buf)?;
            let per_elem = if kind == Kind::Table { 2 } else { 1 };
            for _ in 0..len as usize * per_elem {
                skip_value(buf, depth + 1)?;
            }
        }
    }
    Ok(())
}

fn read_str_slice<'a>(buf: &mut &'a [u8]) -> FabResult<&'a str> {
    let len = read_u32_le(buf)? as usize;
    let raw = take(buf, len)?;
    std::str::from_utf8(raw)
        .map_err(|_| FabError::protocol("invalid utf-8 in string"))
}

fn read_addr(buf: &mut &[u8]) -> FabResult<IpAddr> {
    let len = read_u8(buf)?;
    match len {
        4 => {
            let raw: [u8; 4] = take(buf, 4)?.try_into().expect("len checked");
            Ok(IpAddr::V4(Ipv4Addr::from(raw)))
        }
        16 => {
            let raw: [u8; 16] =
                take(buf, 16)?.try_into().expect("len checked");
            Ok(IpAddr::V6(Ipv6Addr::from(raw)))
        }
        _ => Err(FabError::protocol("address length must be 4 or 16")),
    }
}

impl ValueView<'_> {
    /// The kind of the viewed value.
    pub fn kind(&self) -> Kind {
        match self {
            ValueView::None => Kind::None,
            ValueView::Bool(_) => Kind::Bool,
            ValueView::Count(_) => Kind::Count,
            ValueView::Integer(_) => Kind::Integer,
            ValueView::Real(_) => Kind::Real,
            ValueView::Str(_) => Kind::Str,
            ValueView::Address(_) => Kind::Address,
            ValueView::Subnet { .. } => Kind::Subnet,
            ValueView::Port { .. } => Kind::Port,
            ValueView::Timestamp(_) => Kind::Timestamp,
            ValueView::Timespan(_) => Kind::Timespan,
            ValueView::EnumValue(_) => Kind::EnumValue,
            ValueView::Set(_) => Kind::Set,
            ValueView::Table(_) => Kind::Table,
            ValueView::Vector(_) => Kind::Vector,
        }
    }

    /// Materialize an owned [Value] from this view.
    pub fn to_owned_value(&self) -> Value {
        match self {
            ValueView::None => Value::None,
            ValueView::Bool(b) => Value::Bool(*b),
            ValueView::Count(c) => Value::Count(*c),
            ValueView::Integer(i) => Value::Integer(*i),
            ValueView::Real(r) => Value::Real(*r),
            ValueView::Str(s) => Value::Str((*s).into()),
            ValueView::Address(a) => Value::Address(*a),
            ValueView::Subnet { addr, prefix } => Value::Subnet {
                addr: *addr,
                prefix: *prefix,
            },
            ValueView::Port { number, proto } => Value::Port {
                number: *number,
                proto: *proto,
            },
            ValueView::Timestamp(t) => Value::Timestamp(*t),
            ValueView::Timespan(t) => Value::Timespan(*t),
            ValueView::EnumValue(s) => Value::EnumValue((*s).into()),
            ValueView::Set(c) => {
                Value::Set(c.iter().map(|v| v.to_owned_value()).collect())
            }
            ValueView::Table(c) => Value::Table(
                c.iter_pairs()
                    .map(|(k, v)| (k.to_owned_value(), v.to_owned_value()))
                    .collect(),
            ),
            ValueView::Vector(c) => {
                Value::Vector(c.iter().map(|v| v.to_owned_value()).collect())
            }
        }
    }

    /// Total-order comparison against an owned value, consistent with
    /// [Value]'s `Ord`.
    pub fn cmp_value(&self, other: &Value) -> std::cmp::Ordering {
        match (self, other) {
            (ValueView::Bool(a), Value::Bool(b)) => a.cmp(b),
            (ValueView::Count(a), Value::Count(b)) => a.cmp(b),
            (ValueView::Integer(a), Value::Integer(b)) => a.cmp(b),
            (ValueView::Str(a), Value::Str(b)) => (*a).cmp(b.as_str()),
            (ValueView::EnumValue(a), Value::EnumValue(b)) => {
                (*a).cmp(b.as_str())
            }
            (ValueView::Address(a), Value::Address(b)) => a.cmp(b),
            (ValueView::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            (ValueView::Timespan(a), Value::Timespan(b)) => a.cmp(b),
            _ => self.to_owned_value().cmp(other),
        }
    }
}

impl PartialEq<Value> for ValueView<'_> {
    fn eq(&self, other: &Value) -> bool {
        self.cmp_value(other) == std::cmp::Ordering::Equal
    }
}

impl PartialEq<ValueView<'_>> for Value {
    fn eq(&self, other: &ValueView<'_>) -> bool {
        other == self
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::codec::encode;

    fn view_round_trip(v: Value) {
        let enc = encode(&v);
        let (view, rest) = decode_view(&enc).unwrap();
        assert!(rest.is_empty());
        assert_eq!(view, v);
        assert_eq!(v, view.to_owned_value());
    }

    #[test]
    fn views_match_owned() {
        view_round_trip(Value::None);
        view_round_trip(Value::from("zero copy"));
        view_round_trip(Value::Real(2.5));
        view_round_trip(Value::set([Value::from(1_u64), Value::from(2_u64)]));
        view_round_trip(Value::table([
            (Value::from("k"), Value::vector([Value::from(9_i64)])),
        ]));
    }

    #[test]
    fn str_view_borrows_input() {
        let enc = encode(&Value::from("borrowed"));
        let (view, _) = decode_view(&enc).unwrap();
        match view {
            ValueView::Str(s) => {
                assert_eq!("borrowed", s);
                let enc_range = enc.as_ptr() as usize
                    ..enc.as_ptr() as usize + enc.len();
                assert!(enc_range.contains(&(s.as_ptr() as usize)));
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn container_span_iterates_lazily() {
        let v = Value::vector([
            Value::from(1_i64),
            Value::from(2_i64),
            Value::from(3_i64),
        ]);
        let enc = encode(&v);
        let (view, _) = decode_view(&enc).unwrap();
        match view {
            ValueView::Vector(c) => {
                assert_eq!(3, c.len());
                let got: Vec<_> =
                    c.iter().map(|e| e.to_owned_value()).collect();
                assert_eq!(
                    vec![
                        Value::from(1_i64),
                        Value::from(2_i64),
                        Value::from(3_i64)
                    ],
                    got,
                );
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn view_decode_validates_nested_errors() {
        // vector claiming one element, body truncated.
        let bad = [14u8, 1, 0, 0, 0];
        assert!(decode_view(&bad).is_err());
        // vector containing an invalid utf-8 string.
        let bad = [14u8, 1, 0, 0, 0, 5, 1, 0, 0, 0, 0xff];
        assert!(decode_view(&bad).is_err());
    }

    #[test]
    fn view_ordering_matches_owned_ordering() {
        let a = Value::from(3_i64);
        let b = Value::from(5_i64);
        let enc = encode(&a);
        let (view, _) = decode_view(&enc).unwrap();
        assert_eq!(std::cmp::Ordering::Less, view.cmp_value(&b));
        assert_eq!(std::cmp::Ordering::Equal, view.cmp_value(&a));
    }
}
