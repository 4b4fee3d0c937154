//! IP address messages: `ifaddrmsg` and the `IFA_*` attributes.
//!
//! In Linux 2.2 and later an interface carries multiple IP addresses,
//! replacing the 2.0 alias device concept. These messages support IPv4
//! and IPv6 addresses alike; address-valued attributes pick their width
//! from the payload.

use crate::core::msg::Msg;
use crate::core::schema::{AttrMap, Field, Kind, MsgDef, Schema, StructDef};
use crate::{Error, Result};
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

lazy_static::lazy_static! {
    /// `ifaddrmsg` with its attribute map.
    pub static ref IFADDRMSG: Arc<MsgDef> = {
        let body = StructDef::new(vec![
            Field::new("family", Kind::U8),
            Field::new("prefixlen", Kind::U8),
            Field::new("flags", Kind::U8),
            Field::new("scope", Kind::U8),
            Field::new("index", Kind::U32),
        ]);
        let attrs = AttrMap::positional([
            ("IFA_UNSPEC", Schema::None),
            ("IFA_ADDRESS", Schema::prim(Kind::IpAddr)),
            ("IFA_LOCAL", Schema::prim(Kind::IpAddr)),
            ("IFA_LABEL", Schema::prim(Kind::CStr)),
            ("IFA_BROADCAST", Schema::prim(Kind::IpAddr)),
            ("IFA_ANYCAST", Schema::prim(Kind::IpAddr)),
            (
                "IFA_CACHEINFO",
                Schema::Struct(StructDef::new(vec![
                    Field::new("ifa_prefered", Kind::U32),
                    Field::new("ifa_valid", Kind::U32),
                    Field::new("cstamp", Kind::U32),
                    Field::new("tstamp", Kind::U32),
                ])),
            ),
            ("IFA_MULTICAST", Schema::prim(Kind::IpAddr)),
            ("IFA_FLAGS", Schema::prim(Kind::U32)),
        ]);
        MsgDef::new("ifaddrmsg", Some(body), Some(attrs.into_schema()))
    };
}

/// Typed `ifaddrmsg` body for building requests.
///
/// See [`ifaddrmsg`](https://man7.org/linux/man-pages/man7/rtnetlink.7.html).
#[repr(C)]
#[derive(PartialEq, Clone, Debug, Default, Builder, Serialize, Deserialize)]
#[builder(default, build_fn(error = "Error"))]
pub struct IfAddrMessage {
    /// Address family
    pub family: u8,
    /// Prefix length of the address
    pub prefixlen: u8,
    /// Address flags
    pub flags: u8,
    /// Address scope
    pub scope: u8,
    /// Interface index
    pub index: u32,
}

impl IfAddrMessage {
    #[must_use]
    pub fn builder() -> IfAddrMessageBuilder {
        IfAddrMessageBuilder::default()
    }

    /// Copy the body fields into a message built on [`IFADDRMSG`].
    pub fn apply_to(&self, msg: &mut Msg) -> Result<()> {
        msg.set("family", self.family)?;
        msg.set("prefixlen", self.prefixlen)?;
        msg.set("flags", self.flags)?;
        msg.set("scope", self.scope)?;
        msg.set("index", self.index)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route;

    // RTM_NEWADDR for 127.0.0.1/8 on lo, as emitted by the kernel
    // during an address dump.
    #[rustfmt::skip]
    const NEWADDR_LO: [u8; 76] = [
        0x4c, 0x00, 0x00, 0x00,  // length 76
        0x14, 0x00,              // RTM_NEWADDR
        0x02, 0x00,              // NLM_F_MULTI
        0x00, 0x00, 0x00, 0x00,  // seq
        0x00, 0x00, 0x00, 0x00,  // pid
        // ifaddrmsg
        0x02, 0x08, 0x80, 0xfe,  // inet, /8, permanent, host scope
        0x01, 0x00, 0x00, 0x00,  // index 1
        // IFA_ADDRESS 127.0.0.1
        0x08, 0x00, 0x01, 0x00, 0x7f, 0x00, 0x00, 0x01,
        // IFA_LOCAL 127.0.0.1
        0x08, 0x00, 0x02, 0x00, 0x7f, 0x00, 0x00, 0x01,
        // IFA_LABEL "lo"
        0x07, 0x00, 0x03, 0x00, 0x6c, 0x6f, 0x00, 0x00,
        // IFA_CACHEINFO, forever preferred and valid
        0x14, 0x00, 0x06, 0x00,
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0x26, 0x00, 0x00, 0x00, 0x26, 0x00, 0x00, 0x00,
        // IFA_FLAGS
        0x08, 0x00, 0x08, 0x00, 0x80, 0x00, 0x00, 0x00,
    ];

    #[test]
    fn kernel_newaddr_decodes() {
        let mut marshal = route::marshal();
        let msgs = marshal.parse(&NEWADDR_LO, None, None);
        assert_eq!(msgs.len(), 1);

        let msg = &msgs[0];
        assert_eq!(msg.header.typ, route::RTM_NEWADDR);
        assert_eq!(msg.get("family").unwrap().as_u8(), Some(2));
        assert_eq!(msg.get("prefixlen").unwrap().as_u8(), Some(8));
        assert_eq!(
            msg.get_attr("IFA_ADDRESS").unwrap().to_string(),
            "127.0.0.1"
        );
        assert_eq!(msg.get_attr("IFA_LABEL").unwrap().to_string(), "lo");
        let cache = msg.get_attr("IFA_CACHEINFO").unwrap();
        assert_eq!(cache.field("ifa_valid").unwrap().as_u32(), Some(u32::MAX));
    }

    #[test]
    fn decoded_newaddr_reencodes_to_the_same_bytes() {
        let mut marshal = route::marshal();
        let msgs = marshal.parse(&NEWADDR_LO, None, None);
        assert_eq!(msgs[0].encode().unwrap(), NEWADDR_LO);
    }

    #[test]
    fn typed_body_matches_the_wire_layout() {
        let body = IfAddrMessage::builder()
            .family(2)
            .prefixlen(8)
            .flags(0x80)
            .scope(0xfe)
            .index(1)
            .build()
            .unwrap();
        let bytes = bincode::serialize(&body).unwrap();
        assert_eq!(bytes, &NEWADDR_LO[16..24]);
    }

    #[test]
    fn build_addr_request_round_trips() {
        let mut msg = Msg::new(IFADDRMSG.clone());
        msg.header.typ = route::RTM_NEWADDR;
        IfAddrMessage::builder()
            .family(2)
            .prefixlen(24)
            .index(3)
            .build()
            .unwrap()
            .apply_to(&mut msg)
            .unwrap();
        msg.set("IFA_LOCAL", "192.168.1.10").unwrap();
        msg.set("IFA_LABEL", "eth0").unwrap();

        let bytes = msg.encode().unwrap();
        let again = Msg::decode(IFADDRMSG.clone(), &bytes).unwrap();
        assert_eq!(
            again.get_attr("IFA_LOCAL").unwrap().to_string(),
            "192.168.1.10"
        );
        assert_eq!(again.get("prefixlen").unwrap().as_u8(), Some(24));
    }
}
