//! RTNL: network setup over `NETLINK_ROUTE`.
//!
//! The protocol-specific data of an RTNL message depends on the object
//! type: links carry `ifinfmsg`, addresses `ifaddrmsg`, routes `rtmsg`,
//! each followed by an optional attribute tree. The schemas here follow
//! [rtnetlink(7)](https://man7.org/linux/man-pages/man7/rtnetlink.7.html).

pub mod addr;
pub mod link;
pub mod proxy;
pub mod route;

pub use addr::{IfAddrMessage, IFADDRMSG};
pub use link::{IfInfoMessage, IFINFMSG};
pub use route::{RouteMessage, RTMSG};

use crate::core::constants::NETLINK_ROUTE;
use crate::core::marshal::Marshal;
use crate::core::socket::NetlinkSocket;
use crate::Result;
use serde_repr::{Deserialize_repr, Serialize_repr};

pub const AF_UNSPEC: u8 = 0;
pub const AF_INET: u8 = 2;
pub const AF_INET6: u8 = 10;

// Message types of the objects this module describes.
pub const RTM_NEWLINK: u16 = 16;
pub const RTM_DELLINK: u16 = 17;
pub const RTM_GETLINK: u16 = 18;
pub const RTM_SETLINK: u16 = 19;
pub const RTM_NEWADDR: u16 = 20;
pub const RTM_DELADDR: u16 = 21;
pub const RTM_GETADDR: u16 = 22;
pub const RTM_NEWROUTE: u16 = 24;
pub const RTM_DELROUTE: u16 = 25;
pub const RTM_GETROUTE: u16 = 26;

// RTnetlink multicast groups (bind-time bitmask values).
pub const RTNLGRP_LINK: u32 = 0x1;
pub const RTNLGRP_NEIGH: u32 = 0x4;
pub const RTNLGRP_TC: u32 = 0x8;
pub const RTNLGRP_IPV4_IFADDR: u32 = 0x10;
pub const RTNLGRP_IPV4_ROUTE: u32 = 0x40;
pub const RTNLGRP_IPV6_IFADDR: u32 = 0x100;
pub const RTNLGRP_IPV6_ROUTE: u32 = 0x400;

/// Types of route messages.
#[repr(u16)]
#[derive(Debug, PartialEq, Eq, Copy, Clone, Serialize_repr, Deserialize_repr)]
pub enum RouteMessageType {
    NewLink = 16,
    DelLink = 17,
    GetLink = 18,
    SetLink = 19,
    NewAddr = 20,
    DelAddr = 21,
    GetAddr = 22,
    NewRoute = 24,
    DelRoute = 25,
    GetRoute = 26,
}

impl From<RouteMessageType> for u16 {
    fn from(value: RouteMessageType) -> Self {
        value as u16
    }
}

/// A marshal preloaded with the RTNL message map.
pub fn marshal() -> Marshal {
    Marshal::with_map([
        (u32::from(RTM_NEWLINK), IFINFMSG.clone()),
        (u32::from(RTM_DELLINK), IFINFMSG.clone()),
        (u32::from(RTM_GETLINK), IFINFMSG.clone()),
        (u32::from(RTM_SETLINK), IFINFMSG.clone()),
        (u32::from(RTM_NEWADDR), IFADDRMSG.clone()),
        (u32::from(RTM_DELADDR), IFADDRMSG.clone()),
        (u32::from(RTM_GETADDR), IFADDRMSG.clone()),
        (u32::from(RTM_NEWROUTE), RTMSG.clone()),
        (u32::from(RTM_DELROUTE), RTMSG.clone()),
        (u32::from(RTM_GETROUTE), RTMSG.clone()),
    ])
}

/// Open a `NETLINK_ROUTE` socket with the RTNL marshal installed.
pub fn socket() -> Result<NetlinkSocket> {
    let sock = NetlinkSocket::open(NETLINK_ROUTE)?;
    sock.install_marshal(marshal());
    Ok(sock)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_values_match_the_constants() {
        assert_eq!(u16::from(RouteMessageType::GetLink), RTM_GETLINK);
        assert_eq!(u16::from(RouteMessageType::NewAddr), RTM_NEWADDR);
        assert_eq!(u16::from(RouteMessageType::GetRoute), RTM_GETROUTE);
    }

    #[test]
    fn preset_marshal_knows_every_rtm_type() {
        let cases = [
            (RTM_NEWLINK, IFINFMSG.clone(), "ifinfmsg"),
            (RTM_NEWADDR, IFADDRMSG.clone(), "ifaddrmsg"),
            (RTM_NEWROUTE, RTMSG.clone(), "rtmsg"),
        ];
        let mut m = marshal();
        for (typ, def, name) in cases {
            let mut msg = crate::Msg::new(def);
            msg.header.typ = typ;
            let bytes = msg.encode().unwrap();
            let parsed = m.parse(&bytes, None, None);
            assert_eq!(parsed[0].def().name, name);
        }
    }
}
