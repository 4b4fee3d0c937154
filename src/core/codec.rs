//! Primitive and fixed-struct codecs. Primitives never retry or partially
//! decode; a failure reports the absolute offset of the offending byte.

use crate::bytes::SliceReader;
use crate::core::schema::{Endian, Field, Kind, Prim, StructDef};
use crate::core::value::Value;
use crate::error::DecodeKind;
use crate::{Error, Result};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

macro_rules! put_int {
    ($out:expr, $endian:expr, $v:expr) => {
        match $endian {
            Endian::Host => $out.extend_from_slice(&$v.to_ne_bytes()),
            Endian::Network => $out.extend_from_slice(&$v.to_be_bytes()),
        }
    };
}

macro_rules! get_int {
    ($ty:ty, $endian:expr, $bytes:expr) => {{
        let arr: [u8; std::mem::size_of::<$ty>()] =
            $bytes[..std::mem::size_of::<$ty>()].try_into().unwrap();
        match $endian {
            Endian::Host => <$ty>::from_ne_bytes(arr),
            Endian::Network => <$ty>::from_be_bytes(arr),
        }
    }};
}

fn unsigned(value: &Value, kind: &'static str) -> Result<u64> {
    value.as_u64().ok_or(Error::ValueMismatch(kind))
}

fn signed(value: &Value, kind: &'static str) -> Result<i64> {
    value.as_i64().ok_or(Error::ValueMismatch(kind))
}

fn hw_from_str(s: &str) -> Option<[u8; 6]> {
    let mut out = [0u8; 6];
    let mut parts = s.split(':');
    for slot in &mut out {
        *slot = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    parts.next().is_none().then_some(out)
}

/// Encode one primitive value, appending exactly its wire form to `out`.
pub fn encode_prim(prim: &Prim, value: &Value, out: &mut Vec<u8>) -> Result<()> {
    match prim.kind {
        Kind::U8 => out.push(unsigned(value, "u8")? as u8),
        Kind::U16 => put_int!(out, prim.endian, unsigned(value, "u16")? as u16),
        Kind::U32 => put_int!(out, prim.endian, unsigned(value, "u32")? as u32),
        Kind::U64 => put_int!(out, prim.endian, unsigned(value, "u64")?),
        Kind::I8 => out.push(signed(value, "i8")? as u8),
        Kind::I16 => put_int!(out, prim.endian, signed(value, "i16")? as i16),
        Kind::I32 => put_int!(out, prim.endian, signed(value, "i32")? as i32),
        Kind::I64 => put_int!(out, prim.endian, signed(value, "i64")?),
        Kind::Bytes(n) => {
            let bytes = value.as_bytes().ok_or(Error::ValueMismatch("bytes"))?;
            if bytes.len() > n {
                return Err(Error::ValueMismatch("bytes longer than the field"));
            }
            out.extend_from_slice(bytes);
            out.extend(std::iter::repeat(0u8).take(n - bytes.len()));
        }
        Kind::CStr => {
            let s = value.as_str().ok_or(Error::ValueMismatch("cstr"))?;
            out.extend_from_slice(s.as_bytes());
            out.push(0);
        }
        Kind::Ip4 => match value {
            Value::Ip4(addr) => out.extend_from_slice(&addr.octets()),
            Value::Str(s) => {
                let addr: Ipv4Addr = s.parse().map_err(|_| Error::ValueMismatch("ip4"))?;
                out.extend_from_slice(&addr.octets());
            }
            _ => return Err(Error::ValueMismatch("ip4")),
        },
        Kind::Ip6 => match value {
            Value::Ip6(addr) => out.extend_from_slice(&addr.octets()),
            Value::Str(s) => {
                let addr: Ipv6Addr = s.parse().map_err(|_| Error::ValueMismatch("ip6"))?;
                out.extend_from_slice(&addr.octets());
            }
            _ => return Err(Error::ValueMismatch("ip6")),
        },
        Kind::IpAddr => match value {
            Value::Ip4(addr) => out.extend_from_slice(&addr.octets()),
            Value::Ip6(addr) => out.extend_from_slice(&addr.octets()),
            Value::Str(s) => {
                let addr: IpAddr = s.parse().map_err(|_| Error::ValueMismatch("ip"))?;
                match addr {
                    IpAddr::V4(v) => out.extend_from_slice(&v.octets()),
                    IpAddr::V6(v) => out.extend_from_slice(&v.octets()),
                }
            }
            _ => return Err(Error::ValueMismatch("ip")),
        },
        Kind::HwAddr => match value {
            Value::Hw(addr) => out.extend_from_slice(addr),
            Value::Str(s) => {
                let addr = hw_from_str(s).ok_or(Error::ValueMismatch("hwaddr"))?;
                out.extend_from_slice(&addr);
            }
            _ => return Err(Error::ValueMismatch("hwaddr")),
        },
        Kind::Hex => {
            let bytes = value.as_bytes().ok_or(Error::ValueMismatch("hex"))?;
            out.extend_from_slice(bytes);
        }
    }
    Ok(())
}

/// Decode one primitive from `payload`. `offset` is the absolute position
/// of the payload, used in error reports. Fixed-width kinds tolerate a
/// padded payload and read their prefix; address kinds are strict.
pub fn decode_prim(prim: &Prim, payload: &[u8], offset: usize) -> Result<Value> {
    if let Some(width) = prim.width() {
        if payload.len() < width {
            return Err(Error::too_short(offset + payload.len()));
        }
    }
    let value = match prim.kind {
        Kind::U8 => Value::U8(payload[0]),
        Kind::U16 => Value::U16(get_int!(u16, prim.endian, payload)),
        Kind::U32 => Value::U32(get_int!(u32, prim.endian, payload)),
        Kind::U64 => Value::U64(get_int!(u64, prim.endian, payload)),
        Kind::I8 => Value::I8(payload[0] as i8),
        Kind::I16 => Value::I16(get_int!(i16, prim.endian, payload)),
        Kind::I32 => Value::I32(get_int!(i32, prim.endian, payload)),
        Kind::I64 => Value::I64(get_int!(i64, prim.endian, payload)),
        Kind::Bytes(n) => Value::Bytes(payload[..n].to_vec()),
        Kind::CStr => {
            let end = payload
                .iter()
                .position(|b| *b == 0)
                .unwrap_or(payload.len());
            let text = std::str::from_utf8(&payload[..end]).map_err(|e| Error::Decode {
                kind: DecodeKind::BadUtf8,
                offset: offset + e.valid_up_to(),
            })?;
            Value::Str(text.to_owned())
        }
        Kind::Ip4 => {
            let octets: [u8; 4] = payload.try_into().map_err(|_| bad_address(offset))?;
            Value::Ip4(Ipv4Addr::from(octets))
        }
        Kind::Ip6 => {
            let octets: [u8; 16] = payload.try_into().map_err(|_| bad_address(offset))?;
            Value::Ip6(Ipv6Addr::from(octets))
        }
        Kind::IpAddr => match payload.len() {
            4 => {
                let octets: [u8; 4] = payload.try_into().unwrap();
                Value::Ip4(Ipv4Addr::from(octets))
            }
            16 => {
                let octets: [u8; 16] = payload.try_into().unwrap();
                Value::Ip6(Ipv6Addr::from(octets))
            }
            _ => return Err(bad_address(offset)),
        },
        Kind::HwAddr => {
            let octets: [u8; 6] = payload.try_into().map_err(|_| bad_address(offset))?;
            Value::Hw(octets)
        }
        Kind::Hex => Value::Bytes(payload.to_vec()),
    };
    Ok(value)
}

fn bad_address(offset: usize) -> Error {
    Error::Decode {
        kind: DecodeKind::BadAddress,
        offset,
    }
}

fn zero_value(prim: &Prim) -> Value {
    match prim.kind {
        Kind::U8 => Value::U8(0),
        Kind::U16 => Value::U16(0),
        Kind::U32 => Value::U32(0),
        Kind::U64 => Value::U64(0),
        Kind::I8 => Value::I8(0),
        Kind::I16 => Value::I16(0),
        Kind::I32 => Value::I32(0),
        Kind::I64 => Value::I64(0),
        Kind::Bytes(n) => Value::Bytes(vec![0; n]),
        Kind::Ip4 => Value::Ip4(Ipv4Addr::UNSPECIFIED),
        Kind::Ip6 => Value::Ip6(Ipv6Addr::UNSPECIFIED),
        Kind::HwAddr => Value::Hw([0; 6]),
        // Variable-width kinds cannot appear in a struct.
        Kind::CStr | Kind::IpAddr | Kind::Hex => Value::None,
    }
}

/// Encode a struct. Fields the caller never set are zero-filled, matching
/// how partially-specified request bodies go out on the wire.
pub fn encode_struct(
    def: &StructDef,
    values: &[(String, Value)],
    out: &mut Vec<u8>,
) -> Result<()> {
    for field in &def.fields {
        match field {
            Field::Pad(n) => out.extend(std::iter::repeat(0u8).take(*n)),
            Field::Item { name, prim } => {
                let value = values.iter().find(|(n, _)| n == name).map(|(_, v)| v);
                match value {
                    Some(v) => encode_prim(prim, v, out)?,
                    None => encode_prim(prim, &zero_value(prim), out)?,
                }
            }
        }
    }
    Ok(())
}

/// Decode a struct field by field, consuming exactly `wire_len` bytes.
pub fn decode_struct(def: &StructDef, r: &mut SliceReader<'_>) -> Result<Vec<(String, Value)>> {
    let mut values = Vec::new();
    for field in &def.fields {
        match field {
            Field::Pad(n) => {
                r.take(*n)?;
            }
            Field::Item { name, prim } => {
                let width = prim.width().expect("struct fields are fixed width");
                let offset = r.offset();
                let bytes = r.take(width)?;
                values.push(((*name).to_owned(), decode_prim(prim, bytes, offset)?));
            }
        }
    }
    Ok(values)
}

/// Decode a struct that must occupy the whole payload, e.g. a
/// struct-valued attribute. Leftover bytes are an error.
pub fn decode_struct_exact(
    def: &StructDef,
    payload: &[u8],
    offset: usize,
) -> Result<Vec<(String, Value)>> {
    let mut r = SliceReader::with_base(payload, offset);
    let values = decode_struct(def, &mut r)?;
    if !r.is_empty() {
        return Err(Error::Decode {
            kind: DecodeKind::TrailingBytes,
            offset: r.offset(),
        });
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::Field;

    fn ifaddr_def() -> std::sync::Arc<StructDef> {
        StructDef::new(vec![
            Field::new("family", Kind::U8),
            Field::new("prefixlen", Kind::U8),
            Field::new("flags", Kind::U8),
            Field::new("scope", Kind::U8),
            Field::new("index", Kind::U32),
        ])
    }

    #[test]
    fn struct_round_trip() {
        let def = ifaddr_def();
        let values = vec![
            ("family".to_owned(), Value::U8(2)),
            ("prefixlen".to_owned(), Value::U8(8)),
            ("index".to_owned(), Value::U32(1)),
        ];
        let mut out = Vec::new();
        encode_struct(&def, &values, &mut out).unwrap();
        assert_eq!(out, [2, 8, 0, 0, 1, 0, 0, 0]);

        let decoded = decode_struct_exact(&def, &out, 0).unwrap();
        assert_eq!(decoded[0].1, Value::U8(2));
        assert_eq!(decoded[1].1, Value::U8(8));
        // unset fields come back as zero
        assert_eq!(decoded[2].1, Value::U8(0));
        assert_eq!(decoded[4].1, Value::U32(1));
    }

    #[test]
    fn pad_fields_are_zero_filled_and_skipped() {
        let def = StructDef::new(vec![
            Field::new("family", Kind::U8),
            Field::pad(1),
            Field::new("ifi_type", Kind::U16),
        ]);
        let mut out = Vec::new();
        encode_struct(&def, &[("ifi_type".to_owned(), Value::U16(772))], &mut out).unwrap();
        assert_eq!(out, [0, 0, 0x04, 0x03]);
        let decoded = decode_struct_exact(&def, &out, 0).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[1].1, Value::U16(772));
    }

    #[test]
    fn network_byte_order() {
        let prim = Prim::net(Kind::U16);
        let mut out = Vec::new();
        encode_prim(&prim, &Value::U16(0x1234), &mut out).unwrap();
        assert_eq!(out, [0x12, 0x34]);
        assert_eq!(decode_prim(&prim, &out, 0).unwrap(), Value::U16(0x1234));
    }

    #[test]
    fn cstr_strips_terminator_and_validates_utf8() {
        let prim = Prim::new(Kind::CStr);
        assert_eq!(
            decode_prim(&prim, b"lo\0\0", 0).unwrap(),
            Value::Str("lo".to_owned())
        );
        match decode_prim(&prim, &[0xff, 0xfe, 0x00], 8) {
            Err(Error::Decode {
                kind: DecodeKind::BadUtf8,
                offset,
            }) => assert_eq!(offset, 8),
            other => panic!("expected BadUtf8, got {other:?}"),
        }
    }

    #[test]
    fn cstr_encodes_with_terminator() {
        let mut out = Vec::new();
        encode_prim(&Prim::new(Kind::CStr), &Value::from("eth0"), &mut out).unwrap();
        assert_eq!(out, b"eth0\0");
    }

    #[test]
    fn ip_auto_width() {
        let prim = Prim::new(Kind::IpAddr);
        assert_eq!(
            decode_prim(&prim, &[127, 0, 0, 1], 0).unwrap().to_string(),
            "127.0.0.1"
        );
        let v6 = decode_prim(&prim, &[0u8; 16], 0).unwrap();
        assert_eq!(v6.to_string(), "::");
        assert!(matches!(
            decode_prim(&prim, &[1, 2, 3], 0),
            Err(Error::Decode {
                kind: DecodeKind::BadAddress,
                ..
            })
        ));
    }

    #[test]
    fn hwaddr_from_text() {
        let mut out = Vec::new();
        encode_prim(
            &Prim::new(Kind::HwAddr),
            &Value::from("00:1b:21:3c:9d:f0"),
            &mut out,
        )
        .unwrap();
        assert_eq!(out, [0x00, 0x1b, 0x21, 0x3c, 0x9d, 0xf0]);
    }

    #[test]
    fn trailing_bytes_rejected() {
        let def = ifaddr_def();
        let mut bytes = vec![0u8; def.wire_len()];
        bytes.push(0xaa);
        assert!(matches!(
            decode_struct_exact(&def, &bytes, 0),
            Err(Error::Decode {
                kind: DecodeKind::TrailingBytes,
                ..
            })
        ));
    }
}
