//! Protocol-level constants shared by every Netlink family.

/// Netlink protocol families used by the front-ends shipped with this
/// crate. See [netlink(7)](https://man7.org/linux/man-pages/man7/netlink.7.html).
pub const NETLINK_ROUTE: i32 = 0;
pub const NETLINK_FIREWALL: i32 = 3;
pub const NETLINK_NETFILTER: i32 = 12;
pub const NETLINK_KOBJECT_UEVENT: i32 = 15;
pub const NETLINK_GENERIC: i32 = 16;

/// Length of `nlmsghdr` on the wire.
pub const NLMSG_HDR_LEN: usize = 16;
/// Length of an attribute header (`nla_len` + `nla_type`).
pub const NLA_HDR_LEN: usize = 4;

pub const NLMSG_NOOP: u16 = 1;
pub const NLMSG_ERROR: u16 = 2;
pub const NLMSG_DONE: u16 = 3;
pub const NLMSG_OVERRUN: u16 = 4;
/// Family-specific message types start here.
pub const NLMSG_MIN_TYPE: u16 = 16;

pub const NLM_F_REQUEST: u16 = 0x01;
pub const NLM_F_MULTI: u16 = 0x02;
pub const NLM_F_ACK: u16 = 0x04;
pub const NLM_F_ECHO: u16 = 0x08;
pub const NLM_F_DUMP_INTR: u16 = 0x10;
pub const NLM_F_DUMP_FILTERED: u16 = 0x20;

// Modifiers to GET requests.
pub const NLM_F_ROOT: u16 = 0x100;
pub const NLM_F_MATCH: u16 = 0x200;
pub const NLM_F_ATOMIC: u16 = 0x400;
pub const NLM_F_DUMP: u16 = NLM_F_ROOT | NLM_F_MATCH;

// Modifiers to NEW requests.
pub const NLM_F_REPLACE: u16 = 0x100;
pub const NLM_F_EXCL: u16 = 0x200;
pub const NLM_F_CREATE: u16 = 0x400;
pub const NLM_F_APPEND: u16 = 0x800;

// Flags an NLMSG_ERROR response may carry.
pub const NLM_F_CAPPED: u16 = 0x100;
pub const NLM_F_ACK_TLVS: u16 = 0x200;

// Extended ack attributes trailing an NLMSG_ERROR payload.
pub const NLMSGERR_ATTR_MSG: u16 = 1;
pub const NLMSGERR_ATTR_OFFS: u16 = 2;

// High bits of an attribute's type field.
pub const NLA_F_NESTED: u16 = 0x8000;
pub const NLA_F_NET_BYTEORDER: u16 = 0x4000;
/// Mask selecting the tag out of an attribute's type field.
pub const NLA_TYPE_MASK: u16 = !(NLA_F_NESTED | NLA_F_NET_BYTEORDER);

/// Core message types for Netlink packets.
#[repr(u16)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MessageType {
    /// No operation, message must be discarded
    Noop = 1,
    /// Error message or ACK
    Error = 2,
    /// End of a sequence of multipart messages
    Done = 3,
    /// Overrun error
    Overrun = 4,
}

impl From<MessageType> for u16 {
    fn from(value: MessageType) -> Self {
        value as u16
    }
}

/// Flags for configuring Netlink messages.
#[derive(Copy, Clone, Debug)]
pub enum Flag {
    /// Must be set on all request messages
    Request,
    /// This message is part of a multipart message terminated by a message
    /// with type [`MessageType::Done`]
    Multi,
    /// Acknowledgement of success
    Ack,
    /// Echo this request back
    Echo,
    /// The dump was interrupted by a concurrent change and may be
    /// inconsistent
    DumpIntr,
    /// The dump was filtered as requested
    DumpFiltered,
    /// Return the complete table instead of a single entry
    Root,
    /// Return all entries matching the criteria passed in the message
    /// content
    Match,
    /// Return an atomic snapshot of the table. Requires the
    /// `CAP_NET_ADMIN` capability or an effective UID of 0.
    Atomic,
    /// Return all entries. Convenience value, equivalent to [`Flag::Root`]
    /// OR [`Flag::Match`].
    Dump,
    /// Replace an existing object
    Replace,
    /// Don't replace if the object already exists (see [`Flag::Replace`])
    Excl,
    /// Create object if it doesn't already exist
    Create,
    /// Add to the end of the object list
    Append,
}

impl From<Flag> for u16 {
    fn from(flag: Flag) -> Self {
        match flag {
            Flag::Request => NLM_F_REQUEST,
            Flag::Multi => NLM_F_MULTI,
            Flag::Ack => NLM_F_ACK,
            Flag::Echo => NLM_F_ECHO,
            Flag::DumpIntr => NLM_F_DUMP_INTR,
            Flag::DumpFiltered => NLM_F_DUMP_FILTERED,
            Flag::Root | Flag::Replace => 0x100,
            Flag::Match | Flag::Excl => 0x200,
            Flag::Atomic | Flag::Create => 0x400,
            Flag::Dump => NLM_F_DUMP,
            Flag::Append => NLM_F_APPEND,
        }
    }
}

impl std::ops::BitOr for Flag {
    type Output = u16;

    fn bitor(self, rhs: Self) -> Self::Output {
        let lhs: u16 = self.into();
        let rhs: u16 = rhs.into();
        lhs | rhs
    }
}

impl std::ops::BitOr<Flag> for u16 {
    type Output = u16;

    fn bitor(self, rhs: Flag) -> Self::Output {
        let rhs: u16 = rhs.into();
        self | rhs
    }
}
