//! Generic netlink: families multiplexed over `NETLINK_GENERIC`, resolved
//! by name through the `nlctrl` control family.
//!
//! A generic message carries `genlmsghdr` (command, version) after the
//! netlink header; which attribute map applies depends on the family id
//! in the header type, and for subsystems with several operations the
//! marshal's key scheme can dispatch on the command byte instead.

use crate::core::constants::{NETLINK_GENERIC, NLM_F_REQUEST};
use crate::core::marshal::Marshal;
use crate::core::msg::Msg;
use crate::core::schema::{AttrMap, Field, Kind, MsgDef, Schema, StructDef};
use crate::core::socket::NetlinkSocket;
use crate::core::value::Value;
use crate::{Error, Result};
use std::sync::Arc;

/// Family id of the control family itself.
pub const GENL_ID_CTRL: u16 = 0x10;

pub const CTRL_CMD_NEWFAMILY: u8 = 1;
pub const CTRL_CMD_GETFAMILY: u8 = 3;

/// The shared generic netlink header: command and family version.
pub fn genl_header() -> Arc<StructDef> {
    StructDef::new(vec![
        Field::new("cmd", Kind::U8),
        Field::new("version", Kind::U8),
        Field::pad(2),
    ])
}

lazy_static::lazy_static! {
    /// `nlctrl` control messages.
    pub static ref CTRLMSG: Arc<MsgDef> = {
        let attrs = AttrMap::positional([
            ("CTRL_ATTR_UNSPEC", Schema::None),
            ("CTRL_ATTR_FAMILY_ID", Schema::prim(Kind::U16)),
            ("CTRL_ATTR_FAMILY_NAME", Schema::prim(Kind::CStr)),
            ("CTRL_ATTR_VERSION", Schema::prim(Kind::U32)),
            ("CTRL_ATTR_HDRSIZE", Schema::prim(Kind::U32)),
            ("CTRL_ATTR_MAXATTR", Schema::prim(Kind::U32)),
            ("CTRL_ATTR_OPS", Schema::prim(Kind::Hex)),
            ("CTRL_ATTR_MCAST_GROUPS", Schema::prim(Kind::Hex)),
        ]);
        MsgDef::new("ctrlmsg", Some(genl_header()), Some(attrs.into_schema()))
    };
}

/// A marshal that understands the control family.
pub fn marshal() -> Marshal {
    Marshal::with_map([(u32::from(GENL_ID_CTRL), CTRLMSG.clone())])
}

/// Open a `NETLINK_GENERIC` socket with the control family registered.
pub fn socket() -> Result<NetlinkSocket> {
    let sock = NetlinkSocket::open(NETLINK_GENERIC)?;
    sock.install_marshal(marshal());
    Ok(sock)
}

/// Ask `nlctrl` for the numeric id of a family, e.g. `"TASKSTATS"` or
/// `"nl80211"`. Register the family's schema under the returned id to
/// start talking to it.
pub fn resolve_family(sock: &NetlinkSocket, name: &str) -> Result<u16> {
    let mut msg = Msg::new(CTRLMSG.clone());
    msg.set("cmd", CTRL_CMD_GETFAMILY)?;
    msg.set("version", 1u8)?;
    msg.set("CTRL_ATTR_FAMILY_NAME", name)?;
    for reply in sock.nlm_request(&mut msg, GENL_ID_CTRL, NLM_F_REQUEST)? {
        let reply = reply?;
        if let Some(id) = reply.get_attr("CTRL_ATTR_FAMILY_ID").and_then(Value::as_u16) {
            return Ok(id);
        }
    }
    Err(Error::UnknownName(name.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::marshal::{KeyFormat, KeyScheme};
    use crate::core::socket::NlRuntime;
    use crate::core::transport::Loopback;

    fn ctrl_reply(seq: u32, family: &str, id: u16) -> Vec<u8> {
        let mut msg = Msg::new(CTRLMSG.clone());
        msg.header.typ = GENL_ID_CTRL;
        msg.header.seq = seq;
        msg.set("cmd", CTRL_CMD_NEWFAMILY).unwrap();
        msg.set("version", 2u8).unwrap();
        msg.set("CTRL_ATTR_FAMILY_NAME", family).unwrap();
        msg.set("CTRL_ATTR_FAMILY_ID", id).unwrap();
        msg.encode().unwrap()
    }

    #[test]
    fn family_id_resolution() {
        let loopback = Arc::new(Loopback::new());
        loopback.set_responder(Box::new(|sent| {
            let seq = u32::from_ne_bytes(sent[8..12].try_into().unwrap());
            vec![ctrl_reply(seq, "TASKSTATS", 0x18)]
        }));
        let sock = NetlinkSocket::with_transport(loopback, NlRuntime::new());
        sock.install_marshal(marshal());

        assert_eq!(resolve_family(&sock, "TASKSTATS").unwrap(), 0x18);
    }

    #[test]
    fn request_carries_the_family_name() {
        let loopback = Arc::new(Loopback::new());
        let sock = NetlinkSocket::with_transport(loopback.clone(), NlRuntime::new());
        sock.install_marshal(marshal());

        let mut msg = Msg::new(CTRLMSG.clone());
        msg.set("cmd", CTRL_CMD_GETFAMILY).unwrap();
        msg.set("CTRL_ATTR_FAMILY_NAME", "nl80211").unwrap();
        sock.put(&mut msg, GENL_ID_CTRL, NLM_F_REQUEST, 1, None)
            .unwrap();

        let sent = loopback.sent();
        let decoded = Msg::decode(CTRLMSG.clone(), &sent[0]).unwrap();
        assert_eq!(decoded.get("cmd").unwrap().as_u8(), Some(CTRL_CMD_GETFAMILY));
        assert_eq!(
            decoded.get_attr("CTRL_ATTR_FAMILY_NAME").unwrap().as_str(),
            Some("nl80211")
        );
    }

    #[test]
    fn command_byte_dispatch_through_the_key_scheme() {
        // a family whose responses differ per command: route the schema
        // on the genlmsghdr cmd byte instead of the header type
        let getters = MsgDef::new(
            "demo_get",
            Some(genl_header()),
            Some(
                AttrMap::positional([
                    ("DEMO_A_UNSPEC", Schema::None),
                    ("DEMO_A_VALUE", Schema::prim(Kind::U32)),
                ])
                .into_schema(),
            ),
        );
        let mut marshal = Marshal::new();
        marshal.set_key_scheme(KeyScheme {
            format: KeyFormat::U16,
            offset: 16,
            mask: 0xff,
        });
        marshal.register(2, getters.clone());

        let mut msg = Msg::new(getters);
        msg.header.typ = 0x19;
        msg.set("cmd", 2u8).unwrap();
        msg.set("DEMO_A_VALUE", 7u32).unwrap();
        let bytes = msg.encode().unwrap();

        let parsed = marshal.parse(&bytes, None, None);
        assert_eq!(parsed[0].get_attr("DEMO_A_VALUE").unwrap().as_u32(), Some(7));
    }
}
