//! The declarative type system: pure-data descriptions of C structs,
//! attribute maps and polymorphic attribute dispatch.
//!
//! Schemas carry no decoded state. Polymorphic resolution
//! ([`ChoiceDef::resolve`]) is a function over the already-decoded sibling
//! attributes, so schema values can be shared freely between sockets and
//! threads.

use crate::core::nla::AttrNode;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Byte order of a primitive field on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Host,
    Network,
}

/// Primitive wire kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    /// Fixed-width opaque bytes.
    Bytes(usize),
    /// NUL-terminated string; the terminator is stripped on decode.
    CStr,
    Ip4,
    Ip6,
    /// An IP address whose version is picked by payload length (4 or 16).
    IpAddr,
    HwAddr,
    /// Opaque bytes of whatever length the payload has.
    Hex,
}

/// A primitive schema node: kind plus byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prim {
    pub kind: Kind,
    pub endian: Endian,
}

impl Prim {
    pub const fn new(kind: Kind) -> Self {
        Self {
            kind,
            endian: Endian::Host,
        }
    }

    pub const fn net(kind: Kind) -> Self {
        Self {
            kind,
            endian: Endian::Network,
        }
    }

    /// Wire width, `None` for kinds whose width comes from the payload.
    pub fn width(&self) -> Option<usize> {
        match self.kind {
            Kind::U8 | Kind::I8 => Some(1),
            Kind::U16 | Kind::I16 => Some(2),
            Kind::U32 | Kind::I32 | Kind::Ip4 => Some(4),
            Kind::U64 | Kind::I64 => Some(8),
            Kind::Ip6 => Some(16),
            Kind::HwAddr => Some(6),
            Kind::Bytes(n) => Some(n),
            Kind::CStr | Kind::IpAddr | Kind::Hex => None,
        }
    }
}

/// One slot of a fixed struct: a named primitive or explicit padding.
#[derive(Debug, Clone)]
pub enum Field {
    Item { name: &'static str, prim: Prim },
    Pad(usize),
}

impl Field {
    pub const fn new(name: &'static str, kind: Kind) -> Self {
        Self::Item {
            name,
            prim: Prim::new(kind),
        }
    }

    pub const fn net(name: &'static str, kind: Kind) -> Self {
        Self::Item {
            name,
            prim: Prim::net(kind),
        }
    }

    pub const fn pad(len: usize) -> Self {
        Self::Pad(len)
    }
}

/// An ordered sequence of fields with C-compatible packing. Offsets are
/// computed from the schema alone, never from values.
#[derive(Debug, Clone)]
pub struct StructDef {
    pub fields: Vec<Field>,
}

impl StructDef {
    pub fn new(fields: Vec<Field>) -> Arc<Self> {
        for field in &fields {
            if let Field::Item { name, prim } = field {
                assert!(
                    prim.width().is_some(),
                    "struct field {name} must have a fixed width"
                );
            }
        }
        Arc::new(Self { fields })
    }

    /// Exact number of bytes this struct occupies on the wire.
    pub fn wire_len(&self) -> usize {
        self.fields
            .iter()
            .map(|f| match f {
                Field::Item { prim, .. } => prim.width().unwrap_or(0),
                Field::Pad(n) => *n,
            })
            .sum()
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields
            .iter()
            .any(|f| matches!(f, Field::Item { name: n, .. } if *n == name))
    }
}

/// A single attribute entry: symbolic name, 14-bit tag and payload schema.
#[derive(Debug, Clone)]
pub struct AttrDef {
    pub name: String,
    pub tag: u16,
    pub schema: Schema,
}

/// Lookup interface for attribute maps whose tag space is sparse or
/// generated on the fly. Both directions must agree.
pub trait TagAdapter: Send + Sync {
    fn by_tag(&self, tag: u16) -> Option<AttrDef>;
    fn by_name(&self, name: &str) -> Option<AttrDef>;
}

/// An ordered tag map. Tags are assigned by position starting at zero
/// unless inserted explicitly.
#[derive(Debug, Clone, Default)]
pub struct AttrMap {
    defs: Vec<AttrDef>,
    by_tag: HashMap<u16, usize>,
    by_name: HashMap<String, usize>,
}

impl AttrMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a map with positional tags, mirroring how kernel headers
    /// declare attribute enums: the first entry gets tag 0.
    pub fn positional<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (&'static str, Schema)>,
    {
        let mut map = Self::new();
        for (tag, (name, schema)) in entries.into_iter().enumerate() {
            map.insert(tag as u16, name, schema);
        }
        map
    }

    pub fn insert(&mut self, tag: u16, name: &str, schema: Schema) {
        let index = self.defs.len();
        self.defs.push(AttrDef {
            name: name.to_owned(),
            tag,
            schema,
        });
        self.by_tag.insert(tag, index);
        self.by_name.insert(name.to_owned(), index);
    }

    pub fn by_tag(&self, tag: u16) -> Option<&AttrDef> {
        self.by_tag.get(&tag).map(|i| &self.defs[*i])
    }

    pub fn by_name(&self, name: &str) -> Option<&AttrDef> {
        self.by_name.get(name).map(|i| &self.defs[*i])
    }

    pub fn into_schema(self) -> AttrSchema {
        AttrSchema::Map(Arc::new(self))
    }
}

/// Either a direct tag map or an adapter that synthesizes entries on
/// demand. Both share one lookup surface.
#[derive(Clone)]
pub enum AttrSchema {
    Map(Arc<AttrMap>),
    Adapter(Arc<dyn TagAdapter>),
}

impl AttrSchema {
    pub fn by_tag(&self, tag: u16) -> Option<AttrDef> {
        match self {
            Self::Map(map) => map.by_tag(tag).cloned(),
            Self::Adapter(adapter) => adapter.by_tag(tag),
        }
    }

    pub fn by_name(&self, name: &str) -> Option<AttrDef> {
        match self {
            Self::Map(map) => map.by_name(name).cloned(),
            Self::Adapter(adapter) => adapter.by_name(name),
        }
    }
}

impl fmt::Debug for AttrSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Map(map) => f.debug_tuple("Map").field(map).finish(),
            Self::Adapter(_) => f.write_str("Adapter(..)"),
        }
    }
}

/// Polymorphic dispatch: the payload schema of one attribute depends on
/// the value of a sibling attribute in the same tree.
#[derive(Debug, Clone)]
pub struct ChoiceDef {
    /// Name of the sibling attribute whose string value selects a variant.
    pub discriminator: String,
    variants: Vec<(String, Schema)>,
}

impl ChoiceDef {
    pub fn new<I>(discriminator: &str, variants: I) -> Arc<Self>
    where
        I: IntoIterator<Item = (&'static str, Schema)>,
    {
        Arc::new(Self {
            discriminator: discriminator.to_owned(),
            variants: variants
                .into_iter()
                .map(|(k, s)| (k.to_owned(), s))
                .collect(),
        })
    }

    /// Resolve against the siblings decoded so far. `None` when the
    /// discriminator is absent or names an unknown variant; the caller
    /// falls back to hex.
    pub fn resolve(&self, siblings: &[AttrNode]) -> Option<&Schema> {
        let kind = siblings
            .iter()
            .find(|node| node.name == self.discriminator)?
            .value
            .as_str()?;
        self.variants
            .iter()
            .find(|(name, _)| name == kind)
            .map(|(_, schema)| schema)
    }
}

/// A schema node.
#[derive(Debug, Clone)]
pub enum Schema {
    /// No payload: a pure flag attribute.
    None,
    Prim(Prim),
    Struct(Arc<StructDef>),
    Attrs(AttrSchema),
    Choice(Arc<ChoiceDef>),
}

impl Schema {
    pub const fn prim(kind: Kind) -> Self {
        Self::Prim(Prim::new(kind))
    }

    pub const fn prim_net(kind: Kind) -> Self {
        Self::Prim(Prim::net(kind))
    }

    pub fn nested(map: AttrMap) -> Self {
        Self::Attrs(map.into_schema())
    }
}

/// The complete shape of one message type: a fixed body struct followed
/// by an attribute tree, both optional. The 16-byte header is implicit.
#[derive(Debug)]
pub struct MsgDef {
    pub name: &'static str,
    pub body: Option<Arc<StructDef>>,
    pub attrs: Option<AttrSchema>,
}

impl MsgDef {
    pub fn new(
        name: &'static str,
        body: Option<Arc<StructDef>>,
        attrs: Option<AttrSchema>,
    ) -> Arc<Self> {
        Arc::new(Self { name, body, attrs })
    }
}

lazy_static::lazy_static! {
    /// The header-only fallback shape used when a message type is not
    /// registered with a marshal.
    pub static ref NLMSG: Arc<MsgDef> = MsgDef::new("nlmsg", None, None);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positional_tags_start_at_zero() {
        let map = AttrMap::positional([
            ("IFLA_UNSPEC", Schema::None),
            ("IFLA_ADDRESS", Schema::prim(Kind::HwAddr)),
            ("IFLA_IFNAME", Schema::prim(Kind::CStr)),
        ]);
        assert_eq!(map.by_name("IFLA_IFNAME").unwrap().tag, 2);
        assert_eq!(map.by_tag(1).unwrap().name, "IFLA_ADDRESS");
        assert!(map.by_tag(9).is_none());
    }

    #[test]
    fn explicit_tags_override_position() {
        let mut map = AttrMap::new();
        map.insert(200, "WGPEER_A", Schema::prim(Kind::U32));
        assert_eq!(map.by_tag(200).unwrap().name, "WGPEER_A");
    }

    #[test]
    fn struct_wire_len_counts_padding() {
        let def = StructDef::new(vec![
            Field::new("family", Kind::U8),
            Field::pad(1),
            Field::new("ifi_type", Kind::U16),
            Field::new("index", Kind::I32),
        ]);
        assert_eq!(def.wire_len(), 8);
        assert!(def.has_field("index"));
        assert!(!def.has_field("flags"));
    }
}
