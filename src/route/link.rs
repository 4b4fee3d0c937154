//! Network interface messages: `ifinfmsg` and the `IFLA_*` attribute
//! tree, including the polymorphic `IFLA_LINKINFO` subtree.

use crate::core::msg::Msg;
use crate::core::schema::{AttrMap, ChoiceDef, Field, Kind, MsgDef, Schema, StructDef};
use crate::{Error, Result};
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const STATS_NAMES: [&str; 23] = [
    "rx_packets",
    "tx_packets",
    "rx_bytes",
    "tx_bytes",
    "rx_errors",
    "tx_errors",
    "rx_dropped",
    "tx_dropped",
    "multicast",
    "collisions",
    "rx_length_errors",
    "rx_over_errors",
    "rx_crc_errors",
    "rx_frame_errors",
    "rx_fifo_errors",
    "rx_missed_errors",
    "tx_aborted_errors",
    "tx_carrier_errors",
    "tx_fifo_errors",
    "tx_heartbeat_errors",
    "tx_window_errors",
    "rx_compressed",
    "tx_compressed",
];

fn stats_def(kind: Kind) -> Arc<StructDef> {
    StructDef::new(STATS_NAMES.iter().map(|n| Field::new(n, kind)).collect())
}

fn vlan_data() -> AttrMap {
    AttrMap::positional([
        ("IFLA_VLAN_UNSPEC", Schema::None),
        ("IFLA_VLAN_ID", Schema::prim(Kind::U16)),
        (
            "IFLA_VLAN_FLAGS",
            Schema::Struct(StructDef::new(vec![
                Field::new("flags", Kind::U32),
                Field::new("mask", Kind::U32),
            ])),
        ),
        ("IFLA_VLAN_EGRESS_QOS", Schema::prim(Kind::Hex)),
        ("IFLA_VLAN_INGRESS_QOS", Schema::prim(Kind::Hex)),
    ])
}

fn bond_data() -> AttrMap {
    AttrMap::positional([
        ("IFLA_BOND_UNSPEC", Schema::None),
        ("IFLA_BOND_MODE", Schema::prim(Kind::U8)),
        ("IFLA_BOND_ACTIVE_SLAVE", Schema::prim(Kind::U32)),
    ])
}

fn tuntap_data() -> AttrMap {
    AttrMap::positional([
        ("IFTUN_UNSPEC", Schema::None),
        ("IFTUN_MODE", Schema::prim(Kind::CStr)),
        ("IFTUN_UID", Schema::prim(Kind::U32)),
        ("IFTUN_GID", Schema::prim(Kind::U32)),
        (
            "IFTUN_IFR",
            Schema::Struct(StructDef::new(vec![
                Field::new("no_pi", Kind::U8),
                Field::new("one_queue", Kind::U8),
                Field::new("vnet_hdr", Kind::U8),
                Field::new("multi_queue", Kind::U8),
            ])),
        ),
    ])
}

fn linkinfo() -> AttrMap {
    AttrMap::positional([
        ("IFLA_INFO_UNSPEC", Schema::None),
        ("IFLA_INFO_KIND", Schema::prim(Kind::CStr)),
        (
            "IFLA_INFO_DATA",
            Schema::Choice(ChoiceDef::new(
                "IFLA_INFO_KIND",
                [
                    ("vlan", Schema::nested(vlan_data())),
                    ("bond", Schema::nested(bond_data())),
                    ("tuntap", Schema::nested(tuntap_data())),
                ],
            )),
        ),
        ("IFLA_INFO_XSTATS", Schema::prim(Kind::Hex)),
    ])
}

lazy_static::lazy_static! {
    /// `ifinfmsg` with its attribute map. Tags follow the kernel's
    /// `IFLA_*` enum order.
    pub static ref IFINFMSG: Arc<MsgDef> = {
        let body = StructDef::new(vec![
            Field::new("family", Kind::U8),
            Field::pad(1),
            Field::new("ifi_type", Kind::U16),
            Field::new("index", Kind::I32),
            Field::new("flags", Kind::U32),
            Field::new("change", Kind::U32),
        ]);
        let attrs = AttrMap::positional([
            ("IFLA_UNSPEC", Schema::None),
            ("IFLA_ADDRESS", Schema::prim(Kind::HwAddr)),
            ("IFLA_BROADCAST", Schema::prim(Kind::HwAddr)),
            ("IFLA_IFNAME", Schema::prim(Kind::CStr)),
            ("IFLA_MTU", Schema::prim(Kind::U32)),
            ("IFLA_LINK", Schema::prim(Kind::U32)),
            ("IFLA_QDISC", Schema::prim(Kind::CStr)),
            ("IFLA_STATS", Schema::Struct(stats_def(Kind::U32))),
            ("IFLA_COST", Schema::prim(Kind::Hex)),
            ("IFLA_PRIORITY", Schema::prim(Kind::Hex)),
            ("IFLA_MASTER", Schema::prim(Kind::U32)),
            ("IFLA_WIRELESS", Schema::prim(Kind::Hex)),
            ("IFLA_PROTINFO", Schema::prim(Kind::Hex)),
            ("IFLA_TXQLEN", Schema::prim(Kind::U32)),
            ("IFLA_MAP", Schema::prim(Kind::Hex)),
            ("IFLA_WEIGHT", Schema::prim(Kind::Hex)),
            ("IFLA_OPERSTATE", Schema::prim(Kind::U8)),
            ("IFLA_LINKMODE", Schema::prim(Kind::U8)),
            ("IFLA_LINKINFO", Schema::nested(linkinfo())),
            ("IFLA_NET_NS_PID", Schema::prim(Kind::U32)),
            ("IFLA_IFALIAS", Schema::prim(Kind::CStr)),
            ("IFLA_NUM_VF", Schema::prim(Kind::U32)),
            ("IFLA_VFINFO_LIST", Schema::prim(Kind::Hex)),
            ("IFLA_STATS64", Schema::Struct(stats_def(Kind::U64))),
            ("IFLA_VF_PORTS", Schema::prim(Kind::Hex)),
            ("IFLA_PORT_SELF", Schema::prim(Kind::Hex)),
            ("IFLA_AF_SPEC", Schema::prim(Kind::Hex)),
            ("IFLA_GROUP", Schema::prim(Kind::U32)),
            ("IFLA_NET_NS_FD", Schema::prim(Kind::U32)),
            ("IFLA_EXT_MASK", Schema::prim(Kind::U32)),
            ("IFLA_PROMISCUITY", Schema::prim(Kind::U32)),
            ("IFLA_NUM_TX_QUEUES", Schema::prim(Kind::U32)),
            ("IFLA_NUM_RX_QUEUES", Schema::prim(Kind::U32)),
        ]);
        MsgDef::new("ifinfmsg", Some(body), Some(attrs.into_schema()))
    };
}

/// Typed `ifinfmsg` body for building requests.
///
/// See [`ifinfomsg`](https://man7.org/linux/man-pages/man7/rtnetlink.7.html).
#[repr(C)]
#[derive(PartialEq, Clone, Debug, Default, Builder, Serialize, Deserialize)]
#[builder(default, build_fn(error = "Error"))]
pub struct IfInfoMessage {
    /// AF_UNSPEC
    pub family: u8,
    #[builder(setter(skip))]
    pad: u8,
    /// Device type
    pub ifi_type: u16,
    /// Interface index
    pub index: i32,
    /// Device flags. See
    /// [`netdevice(7)`](https://man7.org/linux/man-pages/man7/netdevice.7.html)
    pub flags: u32,
    /// Change mask
    pub change: u32,
}

impl IfInfoMessage {
    #[must_use]
    pub fn builder() -> IfInfoMessageBuilder {
        IfInfoMessageBuilder::default()
    }

    /// Copy the body fields into a message built on [`IFINFMSG`].
    pub fn apply_to(&self, msg: &mut Msg) -> Result<()> {
        msg.set("family", self.family)?;
        msg.set("ifi_type", self.ifi_type)?;
        msg.set("index", self.index)?;
        msg.set("flags", self.flags)?;
        msg.set("change", self.change)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::constants::{Flag, NLM_F_REQUEST};
    use crate::core::nla::AttrNode;
    use crate::core::value::Value;
    use crate::route::RTM_NEWLINK;

    #[test]
    fn dump_request_wire_format() {
        // the canonical link dump request: empty ifinfmsg plus an
        // extended-attribute mask
        let mut msg = Msg::new(IFINFMSG.clone());
        IfInfoMessage::builder()
            .family(0)
            .build()
            .unwrap()
            .apply_to(&mut msg)
            .unwrap();
        msg.set("IFLA_EXT_MASK", 1u32).unwrap();
        msg.header.typ = crate::route::RTM_GETLINK;
        msg.header.flags = Flag::Request | Flag::Dump;
        msg.header.seq = 1;

        let bytes = msg.encode().unwrap();
        assert_eq!(
            &bytes[..12],
            &[0x28, 0x00, 0x00, 0x00, 0x12, 0x00, 0x01, 0x03, 0x01, 0x00, 0x00, 0x00]
        );
        assert_eq!(bytes.len(), 0x28);
    }

    #[test]
    fn newlink_with_vlan_linkinfo_resolves_choice() {
        let mut msg = Msg::new(IFINFMSG.clone());
        msg.header.typ = RTM_NEWLINK;
        msg.header.flags = NLM_F_REQUEST;
        msg.set("index", 4i32).unwrap();
        msg.set(
            "IFLA_LINKINFO",
            Value::Nested(vec![
                AttrNode::new("IFLA_INFO_KIND", 1, 0, Value::from("vlan")),
                AttrNode::new(
                    "IFLA_INFO_DATA",
                    2,
                    0x8000,
                    Value::Nested(vec![AttrNode::new("IFLA_VLAN_ID", 1, 0, Value::U16(100))]),
                ),
            ]),
        )
        .unwrap();

        let bytes = msg.encode().unwrap();
        let again = Msg::decode(IFINFMSG.clone(), &bytes).unwrap();
        let id = again
            .get_nested(&["IFLA_LINKINFO", "IFLA_INFO_DATA", "IFLA_VLAN_ID"])
            .unwrap();
        assert_eq!(id.as_u16(), Some(100));
        // and the round trip is lossless
        assert_eq!(again.encode().unwrap(), bytes);
    }

    #[test]
    fn stats_attribute_decodes_as_struct() {
        let mut msg = Msg::new(IFINFMSG.clone());
        msg.header.typ = RTM_NEWLINK;
        let mut stats: Vec<(String, Value)> = STATS_NAMES
            .iter()
            .map(|n| ((*n).to_owned(), Value::U32(0)))
            .collect();
        stats[0].1 = Value::U32(17);
        msg.set("IFLA_STATS", Value::Struct(stats)).unwrap();

        let bytes = msg.encode().unwrap();
        let again = Msg::decode(IFINFMSG.clone(), &bytes).unwrap();
        let decoded = again.get_attr("IFLA_STATS").unwrap();
        assert_eq!(decoded.field("rx_packets").unwrap().as_u32(), Some(17));
    }

    #[test]
    fn builder_defaults_are_zero() {
        let body = IfInfoMessage::builder().index(2).build().unwrap();
        assert_eq!(body.family, 0);
        assert_eq!(body.index, 2);
        assert_eq!(body.change, 0);
    }
}
