//! Routing table messages: `rtmsg` and the `RTA_*` attributes.

use crate::core::msg::Msg;
use crate::core::schema::{AttrMap, Field, Kind, MsgDef, Schema, StructDef};
use crate::{Error, Result};
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

lazy_static::lazy_static! {
    /// `rtmsg` with its attribute map.
    pub static ref RTMSG: Arc<MsgDef> = {
        let body = StructDef::new(vec![
            Field::new("family", Kind::U8),
            Field::new("dst_len", Kind::U8),
            Field::new("src_len", Kind::U8),
            Field::new("tos", Kind::U8),
            Field::new("table", Kind::U8),
            Field::new("proto", Kind::U8),
            Field::new("scope", Kind::U8),
            Field::new("rtm_type", Kind::U8),
            Field::new("flags", Kind::U32),
        ]);
        let attrs = AttrMap::positional([
            ("RTA_UNSPEC", Schema::None),
            ("RTA_DST", Schema::prim(Kind::IpAddr)),
            ("RTA_SRC", Schema::prim(Kind::IpAddr)),
            ("RTA_IIF", Schema::prim(Kind::U32)),
            ("RTA_OIF", Schema::prim(Kind::U32)),
            ("RTA_GATEWAY", Schema::prim(Kind::IpAddr)),
            ("RTA_PRIORITY", Schema::prim(Kind::U32)),
            ("RTA_PREFSRC", Schema::prim(Kind::IpAddr)),
            ("RTA_METRICS", Schema::prim(Kind::Hex)),
            ("RTA_MULTIPATH", Schema::prim(Kind::Hex)),
            ("RTA_PROTOINFO", Schema::prim(Kind::Hex)),
            ("RTA_FLOW", Schema::prim(Kind::U32)),
            (
                "RTA_CACHEINFO",
                Schema::Struct(StructDef::new(vec![
                    Field::new("rta_clntref", Kind::U32),
                    Field::new("rta_lastuse", Kind::U32),
                    Field::new("rta_expires", Kind::I32),
                    Field::new("rta_error", Kind::U32),
                    Field::new("rta_used", Kind::U32),
                    Field::new("rta_id", Kind::U32),
                    Field::new("rta_ts", Kind::U32),
                    Field::new("rta_tsage", Kind::U32),
                ])),
            ),
            ("RTA_SESSION", Schema::prim(Kind::Hex)),
            ("RTA_MP_ALGO", Schema::prim(Kind::Hex)),
            ("RTA_TABLE", Schema::prim(Kind::U32)),
            ("RTA_MARK", Schema::prim(Kind::U32)),
        ]);
        MsgDef::new("rtmsg", Some(body), Some(attrs.into_schema()))
    };
}

/// Typed `rtmsg` body for building requests.
///
/// See [`rtmsg`](https://man7.org/linux/man-pages/man7/rtnetlink.7.html).
#[repr(C)]
#[derive(PartialEq, Clone, Debug, Default, Builder, Serialize, Deserialize)]
#[builder(default, build_fn(error = "Error"))]
pub struct RouteMessage {
    pub family: u8,
    pub dst_len: u8,
    pub src_len: u8,
    pub tos: u8,
    pub table: u8,
    pub proto: u8,
    pub scope: u8,
    pub rtm_type: u8,
    pub flags: u32,
}

impl RouteMessage {
    #[must_use]
    pub fn builder() -> RouteMessageBuilder {
        RouteMessageBuilder::default()
    }

    /// Copy the body fields into a message built on [`RTMSG`].
    pub fn apply_to(&self, msg: &mut Msg) -> Result<()> {
        msg.set("family", self.family)?;
        msg.set("dst_len", self.dst_len)?;
        msg.set("src_len", self.src_len)?;
        msg.set("tos", self.tos)?;
        msg.set("table", self.table)?;
        msg.set("proto", self.proto)?;
        msg.set("scope", self.scope)?;
        msg.set("rtm_type", self.rtm_type)?;
        msg.set("flags", self.flags)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::{self, AF_INET, RTM_NEWROUTE};

    #[test]
    fn route_with_gateway_round_trips() {
        let mut msg = Msg::new(RTMSG.clone());
        msg.header.typ = RTM_NEWROUTE;
        RouteMessage::builder()
            .family(AF_INET)
            .dst_len(24)
            .table(254)
            .build()
            .unwrap()
            .apply_to(&mut msg)
            .unwrap();
        msg.set("RTA_DST", "10.0.0.0").unwrap();
        msg.set("RTA_GATEWAY", "192.168.1.1").unwrap();
        msg.set("RTA_OIF", 2u32).unwrap();

        let bytes = msg.encode().unwrap();
        let again = Msg::decode(RTMSG.clone(), &bytes).unwrap();
        assert_eq!(again.get("dst_len").unwrap().as_u8(), Some(24));
        assert_eq!(again.get_attr("RTA_DST").unwrap().to_string(), "10.0.0.0");
        assert_eq!(
            again.get_attr("RTA_GATEWAY").unwrap().to_string(),
            "192.168.1.1"
        );
        assert_eq!(again.encode().unwrap(), bytes);
    }

    #[test]
    fn ipv6_route_addresses_pick_their_width() {
        let mut msg = Msg::new(RTMSG.clone());
        msg.header.typ = RTM_NEWROUTE;
        msg.set("family", route::AF_INET6).unwrap();
        msg.set("RTA_DST", "2001:db8::").unwrap();

        let bytes = msg.encode().unwrap();
        let again = Msg::decode(RTMSG.clone(), &bytes).unwrap();
        assert_eq!(again.get_attr("RTA_DST").unwrap().to_string(), "2001:db8::");
    }
}
