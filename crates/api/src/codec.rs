//! Deterministic binary encoding of the telefab data model.
//!
//! Layout per value: one kind tag byte followed by a kind-specific
//! payload. Numbers are little-endian except `real`, which carries the
//! IEEE-754 bit pattern in network byte order. Composite kinds encode as
//! `tag || len:u32le || elements…`; a table element is `key || value`.
//!
//! `decode(encode(v))` returns `(v, empty)` for every well-formed value.

use crate::{
    FabError, FabResult, Kind, Protocol, Timespan, Timestamp, Value,
};
use bytes::{BufMut, Bytes, BytesMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Containers deeper than this fail to decode. Keeps hostile input from
/// exhausting the stack.
pub(crate) const MAX_DEPTH: usize = 100;

/// Encode a value into a freshly allocated buffer.
pub fn encode(v: &Value) -> Bytes {
    let mut buf = BytesMut::new();
    encode_into(v, &mut buf);
    buf.freeze()
}

/// Encode a value onto the end of an existing buffer.
pub fn encode_into(v: &Value, buf: &mut BytesMut) {
    buf.put_u8(v.kind() as u8);
    match v {
        Value::None => (),
        Value::Bool(b) => buf.put_u8(u8::from(*b)),
        Value::Count(c) => buf.put_u64_le(*c),
        Value::Integer(i) => buf.put_i64_le(*i),
        Value::Real(r) => buf.put_u64(r.to_bits()),
        Value::Str(s) => put_raw_str(s, buf),
        Value::Address(a) => put_addr(a, buf),
        Value::Subnet { addr, prefix } => {
            put_addr(addr, buf);
            buf.put_u8(*prefix);
        }
        Value::Port { number, proto } => {
            buf.put_u16_le(*number);
            buf.put_u8(proto.tag());
        }
        Value::Timestamp(t) => buf.put_i64_le(t.as_nanos()),
        Value::Timespan(t) => buf.put_i64_le(t.as_nanos()),
        Value::EnumValue(s) => put_raw_str(s, buf),
        Value::Set(s) => {
            buf.put_u32_le(s.len() as u32);
            for e in s {
                encode_into(e, buf);
            }
        }
        Value::Table(t) => {
            buf.put_u32_le(t.len() as u32);
            for (k, val) in t {
                encode_into(k, buf);
                encode_into(val, buf);
            }
        }
        Value::Vector(v) => {
            buf.put_u32_le(v.len() as u32);
            for e in v {
                encode_into(e, buf);
            }
        }
    }
}

/// Decode one value from the front of `input`, returning the value and
/// the remaining bytes.
pub fn decode(input: &[u8]) -> FabResult<(Value, &[u8])> {
    let mut rest = input;
    let v = decode_one(&mut rest, 0)?;
    Ok((v, rest))
}

fn decode_one(buf: &mut &[u8], depth: usize) -> FabResult<Value> {
    if depth > MAX_DEPTH {
        return Err(FabError::protocol("value nesting too deep"));
    }
    let tag = read_u8(buf)?;
    let kind = Kind::from_tag(tag)
        .ok_or_else(|| FabError::protocol(format!("unknown value tag: {tag}")))?;
    Ok(match kind {
        Kind::None => Value::None,
        Kind::Bool => Value::Bool(read_u8(buf)? != 0),
        Kind::Count => Value::Count(read_u64_le(buf)?),
        Kind::Integer => Value::Integer(read_u64_le(buf)? as i64),
        Kind::Real => Value::Real(f64::from_bits(read_u64_be(buf)?)),
        Kind::Str => Value::Str(read_raw_str(buf)?),
        Kind::Address => Value::Address(read_addr(buf)?),
        Kind::Subnet => {
            let addr = read_addr(buf)?;
            let prefix = read_u8(buf)?;
            let max = match addr {
                IpAddr::V4(_) => 32,
                IpAddr::V6(_) => 128,
            };
            if prefix > max {
                return Err(FabError::protocol(format!(
                    "subnet prefix {prefix} out of range for {addr}"
                )));
            }
            Value::Subnet { addr, prefix }
        }
        Kind::Port => {
            let number = read_u16_le(buf)?;
            let proto = read_u8(buf)?;
            let proto = Protocol::from_tag(proto).ok_or_else(|| {
                FabError::protocol(format!("unknown port protocol: {proto}"))
            })?;
            Value::Port { number, proto }
        }
        Kind::Timestamp => {
            Value::Timestamp(Timestamp::from_nanos(read_u64_le(buf)? as i64))
        }
        Kind::Timespan => {
            Value::Timespan(Timespan::from_nanos(read_u64_le(buf)? as i64))
        }
        Kind::EnumValue => Value::EnumValue(read_raw_str(buf)?),
        Kind::Set => {
            let len = read_u32_le(buf)?;
            let mut out = std::collections::BTreeSet::new();
            for _ in 0..len {
                // Duplicates collapse, matching insert semantics.
                out.insert(decode_one(buf, depth + 1)?);
            }
            Value::Set(out)
        }
        Kind::Table => {
            let len = read_u32_le(buf)?;
            let mut out = std::collections::BTreeMap::new();
            for _ in 0..len {
                let k = decode_one(buf, depth + 1)?;
                let v = decode_one(buf, depth + 1)?;
                if out.insert(k, v).is_some() {
                    return Err(FabError::protocol(
                        "duplicate key in table value",
                    ));
                }
            }
            Value::Table(out)
        }
        Kind::Vector => {
            let len = read_u32_le(buf)?;
            let mut out = Vec::new();
            for _ in 0..len {
                out.push(decode_one(buf, depth + 1)?);
            }
            Value::Vector(out)
        }
    })
}

fn put_addr(a: &IpAddr, buf: &mut BytesMut) {
    match a {
        IpAddr::V4(v4) => {
            buf.put_u8(4);
            buf.put_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            buf.put_u8(16);
            buf.put_slice(&v6.octets());
        }
    }
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
        _ => Err(FabError::protocol(format!(
            "address length must be 4 or 16, got {len}"
        ))),
    }
}

fn put_raw_str(s: &str, buf: &mut BytesMut) {
    buf.put_u32_le(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn read_raw_str(buf: &mut &[u8]) -> FabResult<String> {
    let len = read_u32_le(buf)? as usize;
    let raw = take(buf, len)?;
    String::from_utf8(raw.to_vec())
        .map_err(|_| FabError::protocol("invalid utf-8 in string"))
}

// -- checked primitive reads, shared with wire framing and views --

pub(crate) fn take<'a>(buf: &mut &'a [u8], n: usize) -> FabResult<&'a [u8]> {
    if buf.len() < n {
        return Err(FabError::protocol("truncated value"));
    }
    let (head, tail) = buf.split_at(n);
    *buf = tail;
    Ok(head)
}

pub(crate) fn read_u8(buf: &mut &[u8]) -> FabResult<u8> {
    Ok(take(buf, 1)?[0])
}

pub(crate) fn read_u16_le(buf: &mut &[u8]) -> FabResult<u16> {
    Ok(u16::from_le_bytes(
        take(buf, 2)?.try_into().expect("len checked"),
    ))
}

pub(crate) fn read_u32_le(buf: &mut &[u8]) -> FabResult<u32> {
    Ok(u32::from_le_bytes(
        take(buf, 4)?.try_into().expect("len checked"),
    ))
}

pub(crate) fn read_u64_le(buf: &mut &[u8]) -> FabResult<u64> {
    Ok(u64::from_le_bytes(
        take(buf, 8)?.try_into().expect("len checked"),
    ))
}

pub(crate) fn read_u64_be(buf: &mut &[u8]) -> FabResult<u64> {
    Ok(u64::from_be_bytes(
        take(buf, 8)?.try_into().expect("len checked"),
    ))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Protocol;

    fn round_trip(v: Value) {
        let enc = encode(&v);
        let (dec, rest) = decode(&enc).unwrap();
        assert_eq!(v, dec, "round trip mismatch");
        assert!(rest.is_empty(), "bytes left over after decode");
    }

    #[test]
    fn round_trip_scalars() {
        round_trip(Value::None);
        round_trip(Value::Bool(true));
        round_trip(Value::Bool(false));
        round_trip(Value::Count(u64::MAX));
        round_trip(Value::Integer(i64::MIN));
        round_trip(Value::Real(1234.5678));
        round_trip(Value::Real(f64::NEG_INFINITY));
        round_trip(Value::Str("hello, fabric".into()));
        round_trip(Value::Str(String::new()));
        round_trip(Value::EnumValue("conn::established".into()));
        round_trip(Value::Timestamp(Timestamp::from_nanos(-42)));
        round_trip(Value::Timespan(Timespan::from_nanos(86_400)));
    }

    #[test]
    fn round_trip_network_kinds() {
        round_trip(Value::Address("192.168.1.1".parse().unwrap()));
        round_trip(Value::Address("2001:db8::1".parse().unwrap()));
        round_trip(Value::Subnet {
            addr: "10.0.0.0".parse().unwrap(),
            prefix: 8,
        });
        round_trip(Value::Subnet {
            addr: "fe80::".parse().unwrap(),
            prefix: 64,
        });
        round_trip(Value::Port {
            number: 53,
            proto: Protocol::Udp,
        });
    }

    #[test]
    fn round_trip_containers() {
        round_trip(Value::set([
            Value::from(1_u64),
            Value::from(2_u64),
            Value::from("x"),
        ]));
        round_trip(Value::table([
            (Value::from("src"), Value::Address("::1".parse().unwrap())),
            (Value::from("dport"), Value::Count(443)),
        ]));
        round_trip(Value::vector([
            Value::None,
            Value::set([Value::from(true)]),
            Value::table([(Value::from(1_i64), Value::vector([]))]),
        ]));
    }

    #[test]
    fn fixture_bytes() {
        // tag 3 (integer) then 7 little-endian.
        assert_eq!(
            &[3, 7, 0, 0, 0, 0, 0, 0, 0][..],
            &encode(&Value::Integer(7))[..],
        );
        // tag 5 (string), len 2, "hi".
        assert_eq!(
            &[5, 2, 0, 0, 0, b'h', b'i'][..],
            &encode(&Value::Str("hi".into()))[..],
        );
        // tag 4 (real), network byte order bit pattern.
        let mut want = vec![4u8];
        want.extend_from_slice(&1.5_f64.to_bits().to_be_bytes());
        assert_eq!(&want[..], &encode(&Value::Real(1.5))[..]);
        // tag 8 (port): 80 le + tcp.
        assert_eq!(
            &[8, 80, 0, 1][..],
            &encode(&Value::Port {
                number: 80,
                proto: Protocol::Tcp
            })[..],
        );
    }

    #[test]
    fn decode_leaves_rest() {
        let mut enc = encode(&Value::Count(9)).to_vec();
        enc.extend_from_slice(b"trailing");
        let (v, rest) = decode(&enc).unwrap();
        assert_eq!(Value::Count(9), v);
        assert_eq!(b"trailing", rest);
    }

    #[test]
    fn decode_rejects_truncation() {
        let enc = encode(&Value::Count(1234));
        for cut in 0..enc.len() {
            assert!(decode(&enc[..cut]).is_err(), "cut at {cut} decoded");
        }
    }

    #[test]
    fn decode_rejects_unknown_tag() {
        assert!(decode(&[200]).is_err());
    }

    #[test]
    fn decode_rejects_bad_utf8() {
        // tag 5, len 2, invalid continuation bytes.
        assert!(decode(&[5, 2, 0, 0, 0, 0xff, 0xfe]).is_err());
    }

    #[test]
    fn decode_rejects_bad_address_len() {
        // tag 6, claimed length 5.
        assert!(decode(&[6, 5, 1, 2, 3, 4, 5]).is_err());
    }

    #[test]
    fn decode_rejects_out_of_range_prefix() {
        let mut enc = vec![7u8, 4, 10, 0, 0, 0, 33];
        assert!(decode(&enc).is_err());
        enc = vec![7u8, 16];
        enc.extend_from_slice(&[0u8; 16]);
        enc.push(129);
        assert!(decode(&enc).is_err());
    }

    #[test]
    fn decode_rejects_duplicate_table_key() {
        // table with "a" -> 1 twice.
        let mut enc = BytesMut::new();
        enc.put_u8(13);
        enc.put_u32_le(2);
        for _ in 0..2 {
            encode_into(&Value::from("a"), &mut enc);
            encode_into(&Value::from(1_i64), &mut enc);
        }
        assert!(decode(&enc).is_err());
    }

    #[test]
    fn decode_collapses_duplicate_set_elements() {
        let mut enc = BytesMut::new();
        enc.put_u8(12);
        enc.put_u32_le(3);
        for _ in 0..3 {
            encode_into(&Value::from(5_i64), &mut enc);
        }
        let (v, rest) = decode(&enc).unwrap();
        assert!(rest.is_empty());
        assert_eq!(Value::set([Value::from(5_i64)]), v);
    }

    #[test]
    fn deep_nesting_is_rejected() {
        let mut enc = BytesMut::new();
        for _ in 0..(MAX_DEPTH + 2) {
            enc.put_u8(14);
            enc.put_u32_le(1);
        }
        enc.put_u8(0);
        assert!(decode(&enc).is_err());
    }
}
