//! Dynamic values produced by the schema-driven codecs.

use crate::core::nla::AttrNode;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// A MAC or Ethernet address.
pub type HardwareAddr = [u8; 6];

/// A decoded value. Every schema node decodes into exactly one of these
/// variants; [`fmt::Display`] renders the canonical textual form (dotted
/// quad for IPv4, RFC-5952 for IPv6, colon-separated pairs for hardware
/// addresses and opaque hex).
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// A flag attribute: present, but carries no payload.
    None,
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    Str(String),
    Bytes(Vec<u8>),
    Ip4(Ipv4Addr),
    Ip6(Ipv6Addr),
    Hw(HardwareAddr),
    /// A fixed struct payload, field by field in schema order.
    Struct(Vec<(String, Value)>),
    /// A nested attribute tree.
    Nested(Vec<AttrNode>),
}

impl Value {
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Widening view of any unsigned integer variant.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::U8(v) => Some(u64::from(*v)),
            Self::U16(v) => Some(u64::from(*v)),
            Self::U32(v) => Some(u64::from(*v)),
            Self::U64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        self.as_u64().and_then(|v| u32::try_from(v).ok())
    }

    pub fn as_u16(&self) -> Option<u16> {
        self.as_u64().and_then(|v| u16::try_from(v).ok())
    }

    pub fn as_u8(&self) -> Option<u8> {
        self.as_u64().and_then(|v| u8::try_from(v).ok())
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::I8(v) => Some(i64::from(*v)),
            Self::I16(v) => Some(i64::from(*v)),
            Self::I32(v) => Some(i64::from(*v)),
            Self::I64(v) => Some(*v),
            _ => self.as_u64().and_then(|v| i64::try_from(v).ok()),
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        self.as_i64().and_then(|v| i32::try_from(v).ok())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_ip(&self) -> Option<IpAddr> {
        match self {
            Self::Ip4(v) => Some(IpAddr::V4(*v)),
            Self::Ip6(v) => Some(IpAddr::V6(*v)),
            _ => None,
        }
    }

    pub fn as_hw(&self) -> Option<HardwareAddr> {
        match self {
            Self::Hw(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_nested(&self) -> Option<&[AttrNode]> {
        match self {
            Self::Nested(nodes) => Some(nodes),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&[(String, Value)]> {
        match self {
            Self::Struct(fields) => Some(fields),
            _ => None,
        }
    }

    /// Struct field lookup by name.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.as_struct()
            .and_then(|fields| fields.iter().find(|(n, _)| n == name))
            .map(|(_, v)| v)
    }
}

fn write_hex_pairs(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    for (i, byte) in bytes.iter().enumerate() {
        if i > 0 {
            f.write_str(":")?;
        }
        write!(f, "{byte:02x}")?;
    }
    Ok(())
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => Ok(()),
            Self::U8(v) => write!(f, "{v}"),
            Self::U16(v) => write!(f, "{v}"),
            Self::U32(v) => write!(f, "{v}"),
            Self::U64(v) => write!(f, "{v}"),
            Self::I8(v) => write!(f, "{v}"),
            Self::I16(v) => write!(f, "{v}"),
            Self::I32(v) => write!(f, "{v}"),
            Self::I64(v) => write!(f, "{v}"),
            Self::Str(s) => f.write_str(s),
            Self::Bytes(b) => write_hex_pairs(f, b),
            Self::Ip4(v) => write!(f, "{v}"),
            Self::Ip6(v) => write!(f, "{v}"),
            Self::Hw(v) => write_hex_pairs(f, v),
            Self::Struct(fields) => {
                f.write_str("{")?;
                for (i, (name, value)) in fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{name}: {value}")?;
                }
                f.write_str("}")
            }
            Self::Nested(nodes) => {
                f.write_str("[")?;
                for (i, node) in nodes.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}: {}", node.name, node.value)?;
                }
                f.write_str("]")
            }
        }
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(impl From<$ty> for Value {
            fn from(v: $ty) -> Self {
                Self::$variant(v)
            }
        })*
    };
}

value_from! {
    u8 => U8, u16 => U16, u32 => U32, u64 => U64,
    i8 => I8, i16 => I16, i32 => I32, i64 => I64,
    String => Str, Vec<u8> => Bytes,
    Ipv4Addr => Ip4, Ipv6Addr => Ip6,
    HardwareAddr => Hw,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_owned())
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Self::Bytes(v.to_vec())
    }
}

impl From<IpAddr> for Value {
    fn from(v: IpAddr) -> Self {
        match v {
            IpAddr::V4(v) => Self::Ip4(v),
            IpAddr::V6(v) => Self::Ip6(v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_canonical_forms() {
        assert_eq!(Value::Ip4(Ipv4Addr::new(127, 0, 0, 1)).to_string(), "127.0.0.1");
        assert_eq!(
            Value::Hw([0x00, 0x1b, 0x21, 0x3c, 0x9d, 0xf0]).to_string(),
            "00:1b:21:3c:9d:f0"
        );
        assert_eq!(Value::Bytes(vec![0xde, 0xad]).to_string(), "de:ad");
        assert_eq!(Value::U16(4095).to_string(), "4095");
    }

    #[test]
    fn integer_widening() {
        assert_eq!(Value::U8(7).as_u32(), Some(7));
        assert_eq!(Value::U32(7).as_u16(), Some(7));
        assert_eq!(Value::U32(0x1_0000).as_u16(), None);
        assert_eq!(Value::I16(-3).as_i32(), Some(-3));
        assert_eq!(Value::Str("x".into()).as_u32(), None);
    }
}
