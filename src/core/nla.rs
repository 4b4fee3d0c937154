//! The attribute (NLA) codec: length-tagged typed attributes with 4-byte
//! alignment, nesting, repetition and polymorphic dispatch.

use crate::bytes::{align4, pad4};
use crate::core::codec::{decode_prim, decode_struct_exact, encode_prim, encode_struct};
use crate::core::constants::{NLA_F_NESTED, NLA_HDR_LEN, NLA_TYPE_MASK};
use crate::core::schema::{AttrSchema, Schema};
use crate::core::value::Value;
use crate::{Error, Result};
use log::{trace, warn};

/// Name used for attributes whose tag is not in the active map; the
/// payload is kept as opaque hex so re-encoding stays lossless.
pub const UNKNOWN_ATTR: &str = "UNKNOWN";

/// One decoded (or to-be-encoded) attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct AttrNode {
    /// Symbolic name from the map, or [`UNKNOWN_ATTR`].
    pub name: String,
    /// Low 14 bits of the wire type field.
    pub tag: u16,
    /// `NLA_F_NESTED` / `NLA_F_NET_BYTEORDER` bits as seen on the wire
    /// (or to be emitted).
    pub flags: u16,
    pub value: Value,
}

impl AttrNode {
    pub fn new(name: &str, tag: u16, flags: u16, value: Value) -> Self {
        Self {
            name: name.to_owned(),
            tag,
            flags,
            value,
        }
    }
}

/// Build a node for `set(name, value)`: resolve the tag through the map
/// and derive the flag bits from the schema.
pub fn make_node(schema: &AttrSchema, name: &str, value: Value) -> Result<AttrNode> {
    let def = schema
        .by_name(name)
        .ok_or_else(|| Error::UnknownName(name.to_owned()))?;
    let flags = match (&def.schema, &value) {
        (Schema::Attrs(_), _) | (Schema::Choice(_), Value::Nested(_)) => NLA_F_NESTED,
        _ => 0,
    };
    Ok(AttrNode {
        name: def.name,
        tag: def.tag,
        flags,
        value,
    })
}

fn decode_value(schema: &Schema, payload: &[u8], offset: usize, siblings: &[AttrNode]) -> Result<Value> {
    match schema {
        Schema::None => Ok(Value::None),
        Schema::Prim(prim) => decode_prim(prim, payload, offset),
        Schema::Struct(def) => Ok(Value::Struct(decode_struct_exact(def, payload, offset)?)),
        Schema::Attrs(sub) => Ok(Value::Nested(decode_attrs(sub, payload, offset)?)),
        Schema::Choice(choice) => match choice.resolve(siblings) {
            Some(resolved) => decode_value(resolved, payload, offset, siblings),
            None => {
                warn!(
                    "discriminator {} missing or unknown, keeping payload as hex",
                    choice.discriminator
                );
                Ok(Value::Bytes(payload.to_vec()))
            }
        },
    }
}

/// Decode an attribute run. Stops quietly at the tail of the buffer: a
/// declared length that is shorter than a header or reaches past the end
/// means the attribute run is over, not that the packet is broken.
pub fn decode_attrs(schema: &AttrSchema, bytes: &[u8], base: usize) -> Result<Vec<AttrNode>> {
    let mut nodes = Vec::new();
    let mut cursor = 0usize;

    while cursor + NLA_HDR_LEN <= bytes.len() {
        let len = u16::from_ne_bytes([bytes[cursor], bytes[cursor + 1]]) as usize;
        let typ = u16::from_ne_bytes([bytes[cursor + 2], bytes[cursor + 3]]);
        if len < NLA_HDR_LEN || cursor + len > bytes.len() {
            break;
        }

        let tag = typ & NLA_TYPE_MASK;
        let flags = typ & !NLA_TYPE_MASK;
        let payload = &bytes[cursor + NLA_HDR_LEN..cursor + len];
        let offset = base + cursor + NLA_HDR_LEN;

        let node = match schema.by_tag(tag) {
            Some(def) => AttrNode {
                value: decode_value(&def.schema, payload, offset, &nodes)?,
                name: def.name,
                tag,
                flags,
            },
            None => {
                trace!("no schema for tag {tag}, keeping payload as hex");
                AttrNode::new(UNKNOWN_ATTR, tag, flags, Value::Bytes(payload.to_vec()))
            }
        };
        nodes.push(node);
        cursor += align4(len);
    }

    Ok(nodes)
}

fn encode_value(schema: &Schema, node: &AttrNode, out: &mut Vec<u8>) -> Result<()> {
    match schema {
        Schema::None => Ok(()),
        Schema::Prim(prim) => encode_prim(prim, &node.value, out),
        Schema::Struct(def) => {
            let fields = node
                .value
                .as_struct()
                .ok_or(Error::ValueMismatch("struct"))?;
            encode_struct(def, fields, out)
        }
        Schema::Attrs(sub) => {
            let nested = node
                .value
                .as_nested()
                .ok_or(Error::ValueMismatch("nested attributes"))?;
            encode_attrs(sub, nested, out)
        }
        Schema::Choice(_) => unreachable!("choice resolved before encode"),
    }
}

/// Encode an attribute run. Each attribute's declared length excludes the
/// padding but includes the 4-byte header; the next attribute starts on
/// the following 4-byte boundary.
pub fn encode_attrs(schema: &AttrSchema, nodes: &[AttrNode], out: &mut Vec<u8>) -> Result<()> {
    for node in nodes {
        let resolved = match schema.by_tag(node.tag) {
            Some(def) => match def.schema {
                Schema::Choice(ref choice) => match choice.resolve(nodes) {
                    Some(resolved) => Some(resolved.clone()),
                    None => {
                        // Never emit an attribute we cannot shape correctly.
                        warn!(
                            "cannot resolve discriminator {} for {}, omitting attribute",
                            choice.discriminator, node.name
                        );
                        continue;
                    }
                },
                other => Some(other),
            },
            None => None,
        };

        let start = out.len();
        out.extend_from_slice(&[0u8; NLA_HDR_LEN]);
        match resolved {
            Some(schema) => encode_value(&schema, node, out)?,
            // Attribute never had a schema: emit the raw payload.
            None => out.extend_from_slice(
                node.value
                    .as_bytes()
                    .ok_or(Error::ValueMismatch("raw attribute payload"))?,
            ),
        }

        let len = out.len() - start;
        let typ = node.tag | node.flags;
        out[start..start + 2].copy_from_slice(&(len as u16).to_ne_bytes());
        out[start + 2..start + 4].copy_from_slice(&typ.to_ne_bytes());
        out.extend(std::iter::repeat(0u8).take(pad4(len)));
    }
    Ok(())
}

/// First attribute with the given name.
pub fn find<'a>(nodes: &'a [AttrNode], name: &str) -> Option<&'a Value> {
    nodes
        .iter()
        .find(|node| node.name == name)
        .map(|node| &node.value)
}

/// All attributes with the given name, in insertion order.
pub fn find_all<'a>(nodes: &'a [AttrNode], name: &str) -> Vec<&'a Value> {
    nodes
        .iter()
        .filter(|node| node.name == name)
        .map(|node| &node.value)
        .collect()
}

/// Descend by name through nested attribute trees.
pub fn find_nested<'a>(nodes: &'a [AttrNode], path: &[&str]) -> Option<&'a Value> {
    let (first, rest) = path.split_first()?;
    let value = find(nodes, first)?;
    if rest.is_empty() {
        return Some(value);
    }
    find_nested(value.as_nested()?, rest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::{AttrMap, ChoiceDef, Kind};

    fn linkinfo_schema() -> AttrSchema {
        let vlan = AttrMap::positional([
            ("IFLA_VLAN_UNSPEC", Schema::None),
            ("IFLA_VLAN_ID", Schema::prim(Kind::U16)),
        ]);
        let info = AttrMap::positional([
            ("IFLA_INFO_UNSPEC", Schema::None),
            ("IFLA_INFO_KIND", Schema::prim(Kind::CStr)),
            (
                "IFLA_INFO_DATA",
                Schema::Choice(ChoiceDef::new(
                    "IFLA_INFO_KIND",
                    [("vlan", Schema::nested(vlan))],
                )),
            ),
        ]);
        info.into_schema()
    }

    fn simple_schema() -> AttrSchema {
        AttrMap::positional([
            ("UNSPEC", Schema::None),
            ("NAME", Schema::prim(Kind::CStr)),
            ("MTU", Schema::prim(Kind::U32)),
            ("FLAG", Schema::None),
        ])
        .into_schema()
    }

    #[test]
    fn decode_simple_run() {
        let schema = simple_schema();
        #[rustfmt::skip]
        let bytes = [
            0x07, 0x00, 0x01, 0x00, b'l', b'o', 0x00, 0x00, // NAME "lo" + pad
            0x08, 0x00, 0x02, 0x00, 0x00, 0x00, 0x01, 0x00, // MTU 65536
            0x04, 0x00, 0x03, 0x00,                         // FLAG, empty payload
        ];
        let nodes = decode_attrs(&schema, &bytes, 0).unwrap();
        assert_eq!(nodes.len(), 3);
        assert_eq!(find(&nodes, "NAME").unwrap().as_str(), Some("lo"));
        assert_eq!(find(&nodes, "MTU").unwrap().as_u32(), Some(65536));
        assert!(find(&nodes, "FLAG").unwrap().is_none());
    }

    #[test]
    fn encode_matches_decode() {
        let schema = simple_schema();
        let nodes = vec![
            make_node(&schema, "NAME", Value::from("lo")).unwrap(),
            make_node(&schema, "MTU", Value::U32(65536)).unwrap(),
            make_node(&schema, "FLAG", Value::None).unwrap(),
        ];
        let mut out = Vec::new();
        encode_attrs(&schema, &nodes, &mut out).unwrap();
        let again = decode_attrs(&schema, &out, 0).unwrap();
        assert_eq!(nodes, again);
        // declared length excludes padding: "lo\0" payload is 3 bytes
        assert_eq!(u16::from_ne_bytes([out[0], out[1]]), 7);
        // but the next attribute starts aligned
        assert_eq!(out.len() % 4, 0);
    }

    #[test]
    fn repeated_tags_preserved_in_order() {
        let schema = simple_schema();
        let nodes = vec![
            make_node(&schema, "MTU", Value::U32(1)).unwrap(),
            make_node(&schema, "NAME", Value::from("a")).unwrap(),
            make_node(&schema, "MTU", Value::U32(2)).unwrap(),
        ];
        let mut out = Vec::new();
        encode_attrs(&schema, &nodes, &mut out).unwrap();
        let again = decode_attrs(&schema, &out, 0).unwrap();
        let mtus = find_all(&again, "MTU");
        assert_eq!(mtus.len(), 2);
        assert_eq!(mtus[0].as_u32(), Some(1));
        assert_eq!(mtus[1].as_u32(), Some(2));
    }

    #[test]
    fn unknown_tag_falls_back_to_hex_losslessly() {
        let schema = simple_schema();
        #[rustfmt::skip]
        let bytes = [
            0x08, 0x00, 0x63, 0x00, 0xde, 0xad, 0xbe, 0xef, // tag 99
        ];
        let nodes = decode_attrs(&schema, &bytes, 0).unwrap();
        assert_eq!(nodes[0].name, UNKNOWN_ATTR);
        assert_eq!(nodes[0].tag, 99);
        assert_eq!(nodes[0].value, Value::Bytes(vec![0xde, 0xad, 0xbe, 0xef]));

        let mut out = Vec::new();
        encode_attrs(&schema, &nodes, &mut out).unwrap();
        assert_eq!(out, bytes);
    }

    #[test]
    fn truncated_tail_stops_quietly() {
        let schema = simple_schema();
        #[rustfmt::skip]
        let bytes = [
            0x08, 0x00, 0x02, 0x00, 0x01, 0x00, 0x00, 0x00, // MTU 1
            0x10, 0x00, 0x02, 0x00, 0x01, 0x00,             // claims 16 bytes, has 6
        ];
        let nodes = decode_attrs(&schema, &bytes, 0).unwrap();
        assert_eq!(nodes.len(), 1);
    }

    #[test]
    fn choice_resolves_by_sibling() {
        let schema = linkinfo_schema();
        let mut out = Vec::new();
        let nodes = vec![
            make_node(&schema, "IFLA_INFO_KIND", Value::from("vlan")).unwrap(),
            make_node(
                &schema,
                "IFLA_INFO_DATA",
                Value::Nested(vec![AttrNode::new("IFLA_VLAN_ID", 1, 0, Value::U16(100))]),
            )
            .unwrap(),
        ];
        encode_attrs(&schema, &nodes, &mut out).unwrap();

        let decoded = decode_attrs(&schema, &out, 0).unwrap();
        let id = find_nested(&decoded, &["IFLA_INFO_DATA", "IFLA_VLAN_ID"]).unwrap();
        assert_eq!(*id, Value::U16(100));
    }

    #[test]
    fn adapter_synthesizes_sparse_tags() {
        use crate::core::schema::{AttrDef, TagAdapter};

        // tag spaces like wireguard peers are generated, not declared:
        // every even tag is a counter, everything else is unknown
        struct EvenCounters;

        impl TagAdapter for EvenCounters {
            fn by_tag(&self, tag: u16) -> Option<AttrDef> {
                (tag % 2 == 0).then(|| AttrDef {
                    name: format!("COUNTER_{tag}"),
                    tag,
                    schema: Schema::prim(Kind::U64),
                })
            }

            fn by_name(&self, name: &str) -> Option<AttrDef> {
                let tag: u16 = name.strip_prefix("COUNTER_")?.parse().ok()?;
                self.by_tag(tag)
            }
        }

        let schema = AttrSchema::Adapter(std::sync::Arc::new(EvenCounters));
        let nodes = vec![
            make_node(&schema, "COUNTER_2", Value::U64(77)).unwrap(),
            make_node(&schema, "COUNTER_40", Value::U64(1)).unwrap(),
        ];
        assert!(make_node(&schema, "COUNTER_3", Value::U64(0)).is_err());

        let mut out = Vec::new();
        encode_attrs(&schema, &nodes, &mut out).unwrap();
        let again = decode_attrs(&schema, &out, 0).unwrap();
        assert_eq!(find(&again, "COUNTER_2").unwrap().as_u64(), Some(77));
        assert_eq!(again[1].tag, 40);
    }

    #[test]
    fn choice_without_discriminator_decodes_as_hex() {
        let schema = linkinfo_schema();
        // IFLA_INFO_DATA alone, no IFLA_INFO_KIND anywhere
        #[rustfmt::skip]
        let bytes = [
            0x08, 0x00, 0x02, 0x00, 0x06, 0x00, 0x01, 0x00,
        ];
        let nodes = decode_attrs(&schema, &bytes, 0).unwrap();
        assert_eq!(
            nodes[0].value,
            Value::Bytes(vec![0x06, 0x00, 0x01, 0x00])
        );
    }
}
