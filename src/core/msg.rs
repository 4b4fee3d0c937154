//! The message type: a 16-byte header, a fixed body struct and an
//! attribute tree, composed according to a [`MsgDef`] schema.

use crate::bytes::{align4, SliceReader};
use crate::core::codec::{decode_struct, encode_struct};
use crate::core::constants::{
    MessageType, NLA_HDR_LEN, NLMSGERR_ATTR_MSG, NLMSGERR_ATTR_OFFS, NLMSG_ERROR, NLMSG_HDR_LEN,
    NLM_F_ACK_TLVS, NLM_F_CAPPED, NLM_F_MULTI,
};
use crate::core::nla::{self, decode_attrs, encode_attrs, make_node, AttrNode};
use crate::core::schema::{AttrMap, AttrSchema, Kind, MsgDef, Schema, NLMSG};
use crate::core::value::Value;
use crate::error::{DecodeKind, MsgError};
use crate::{Error, KernelError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// The `nlmsghdr` as it appears on the wire.
///
/// See [netlink(7)](https://man7.org/linux/man-pages/man7/netlink.7.html).
#[repr(C)]
#[derive(PartialEq, Clone, Debug, Default, Serialize, Deserialize)]
pub struct NlHeader {
    pub length: u32,
    pub typ: u16,
    pub flags: u16,
    pub seq: u32,
    pub pid: u32,
}

impl NlHeader {
    pub fn has_type(&self, typ: MessageType) -> bool {
        self.typ == typ.into()
    }

    pub fn has_flags(&self, flags: u16) -> bool {
        self.flags & flags == flags
    }

    /// More parts of this response follow.
    pub fn is_multipart(&self) -> bool {
        self.has_flags(NLM_F_MULTI)
    }
}

lazy_static::lazy_static! {
    static ref EXTACK: AttrSchema = {
        let mut map = AttrMap::new();
        map.insert(NLMSGERR_ATTR_MSG, "NLMSGERR_ATTR_MSG", Schema::prim(Kind::CStr));
        map.insert(NLMSGERR_ATTR_OFFS, "NLMSGERR_ATTR_OFFS", Schema::prim(Kind::U32));
        map.into_schema()
    };
}

/// A complete Netlink message. Build one with [`Msg::new`] and
/// [`Msg::set`], or obtain decoded ones from a
/// [`Marshal`](crate::core::marshal::Marshal).
#[derive(Debug, Clone)]
pub struct Msg {
    pub header: NlHeader,
    def: Arc<MsgDef>,
    body: Vec<(String, Value)>,
    attrs: Vec<AttrNode>,
    error: Option<MsgError>,
    orig_header: Option<NlHeader>,
    /// Original wire bytes, kept for message types we re-emit verbatim
    /// (error messages).
    raw: Option<Vec<u8>>,
    length: usize,
}

impl Msg {
    pub fn new(def: Arc<MsgDef>) -> Self {
        Self {
            header: NlHeader::default(),
            def,
            body: Vec::new(),
            attrs: Vec::new(),
            error: None,
            orig_header: None,
            raw: None,
            length: 0,
        }
    }

    /// A header-only message, the shape of unregistered message types.
    pub fn nlmsg() -> Self {
        Self::new(NLMSG.clone())
    }

    pub fn def(&self) -> &Arc<MsgDef> {
        &self.def
    }

    /// Offset to the next message when this one was decoded out of a
    /// buffer.
    pub fn length(&self) -> usize {
        self.length
    }

    /// The error attached to this message: a kernel errno for
    /// `NLMSG_ERROR` messages, or a decode failure noted by the marshal.
    pub fn error(&self) -> Option<&MsgError> {
        self.error.as_ref()
    }

    /// The decoded non-zero errno of an `NLMSG_ERROR` message, `None`
    /// otherwise (including ACKs, whose code is zero).
    pub fn kernel_error(&self) -> Option<&KernelError> {
        self.error.as_ref().and_then(MsgError::kernel)
    }

    pub(crate) fn set_error(&mut self, error: Option<MsgError>) {
        self.error = error;
    }

    /// True for an `NLMSG_ERROR` with code zero.
    pub fn is_ack(&self) -> bool {
        self.header.typ == NLMSG_ERROR && self.error.is_none()
    }

    /// Message type of the failed request, when the kernel echoed its
    /// header back in the error payload.
    pub fn orig_msg_type(&self) -> Option<u16> {
        self.orig_header.as_ref().map(|h| h.typ)
    }

    /// Set a body field or append an attribute, resolved by name against
    /// the schema. Attributes may repeat; body fields overwrite.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> Result<&mut Self> {
        let value = value.into();
        if let Some(body) = &self.def.body {
            if body.has_field(name) {
                match self.body.iter_mut().find(|(n, _)| n == name) {
                    Some(slot) => slot.1 = value,
                    None => self.body.push((name.to_owned(), value)),
                }
                return Ok(self);
            }
        }
        if let Some(attrs) = &self.def.attrs {
            self.attrs.push(make_node(attrs, name, value)?);
            return Ok(self);
        }
        Err(Error::UnknownName(name.to_owned()))
    }

    /// A body field by name. Fields never set (or zero-filled on the
    /// wire) may be absent.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.body.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// First attribute with the given name.
    pub fn get_attr(&self, name: &str) -> Option<&Value> {
        nla::find(&self.attrs, name)
    }

    /// Every attribute with the given name, preserving wire order.
    pub fn get_attrs(&self, name: &str) -> Vec<&Value> {
        nla::find_all(&self.attrs, name)
    }

    /// Descend through nested attribute trees by name.
    pub fn get_nested(&self, path: &[&str]) -> Option<&Value> {
        nla::find_nested(&self.attrs, path)
    }

    /// Iterate over `(name, value)` attribute pairs in wire order.
    pub fn attrs(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.attr_nodes().iter().map(|n| (n.name.as_str(), &n.value))
    }

    pub fn attr_nodes(&self) -> &[AttrNode] {
        &self.attrs
    }

    /// Encode to the exact bytes to place on the wire, backpatching the
    /// header length once the payload size is known.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if let Some(raw) = &self.raw {
            return Ok(raw.clone());
        }
        let mut out = bincode::serialize(&self.header).map_err(Error::Serialize)?;
        if let Some(body) = &self.def.body {
            encode_struct(body, &self.body, &mut out)?;
        }
        if let Some(attrs) = &self.def.attrs {
            encode_attrs(attrs, &self.attrs, &mut out)?;
        }
        let length = out.len() as u32;
        out[0..4].copy_from_slice(&length.to_ne_bytes());
        Ok(out)
    }

    /// Decode one message from the start of `bytes`, which must hold at
    /// least `header.length` bytes.
    pub fn decode(def: Arc<MsgDef>, bytes: &[u8]) -> Result<Self> {
        let mut r = SliceReader::new(bytes);
        let header: NlHeader = r.read()?;
        let length = header.length as usize;
        if length < NLMSG_HDR_LEN {
            return Err(Error::Decode {
                kind: DecodeKind::BadLength,
                offset: 0,
            });
        }
        if length > bytes.len() {
            return Err(Error::too_short(bytes.len()));
        }

        let mut msg = Msg::new(def);
        msg.length = length;

        if header.typ == NLMSG_ERROR {
            msg.decode_error_payload(&bytes[..length], &header)?;
            msg.raw = Some(bytes[..length].to_vec());
            msg.header = header;
            return Ok(msg);
        }

        let payload = &bytes[NLMSG_HDR_LEN..length];
        let mut pr = SliceReader::with_base(payload, NLMSG_HDR_LEN);
        if let Some(body) = &msg.def.body {
            msg.body = decode_struct(body, &mut pr)?;
        }
        if let Some(attrs) = msg.def.attrs.clone() {
            msg.attrs = decode_attrs(&attrs, pr.remaining(), pr.offset())?;
        }
        msg.header = header;
        Ok(msg)
    }

    /// Payload of `NLMSG_ERROR`: negated errno, the failed request's
    /// header, and optionally an extended-ack attribute tree.
    fn decode_error_payload(&mut self, bytes: &[u8], header: &NlHeader) -> Result<()> {
        let mut r = SliceReader::with_base(&bytes[NLMSG_HDR_LEN..], NLMSG_HDR_LEN);
        let code_bytes = r.take(4)?;
        let code = i32::from_ne_bytes(code_bytes.try_into().unwrap());

        if r.len_remaining() >= NLMSG_HDR_LEN {
            let orig: NlHeader = r.read()?;
            // Uncapped errors carry the whole original request; skip past
            // the part we already consumed to reach the ack attributes.
            if !header.has_flags(NLM_F_CAPPED) {
                let body_len = align4(orig.length as usize).saturating_sub(NLMSG_HDR_LEN);
                let skip = body_len.min(r.len_remaining());
                r.take(skip)?;
            }
            self.orig_header = Some(orig);
        }

        let mut kernel = (code != 0).then(|| KernelError::new(code.unsigned_abs() as i32));
        if header.has_flags(NLM_F_ACK_TLVS) && r.len_remaining() >= NLA_HDR_LEN {
            let acks = decode_attrs(&EXTACK, r.remaining(), r.offset())?;
            if let Some(err) = kernel.as_mut() {
                err.msg = nla::find(&acks, "NLMSGERR_ATTR_MSG")
                    .and_then(Value::as_str)
                    .map(str::to_owned);
                err.offset = nla::find(&acks, "NLMSGERR_ATTR_OFFS").and_then(Value::as_u32);
            }
            self.attrs = acks;
        }
        self.error = kernel.map(MsgError::Kernel);
        Ok(())
    }

    /// A synthetic ACK, byte-identical to what the kernel would send for
    /// a request with `NLM_F_ACK`.
    pub fn ack(seq: u32) -> Self {
        Self::error_response(seq, 0, None)
    }

    /// A synthetic `NLMSG_ERROR` response, used by proxy handlers to
    /// answer a request locally.
    pub fn error_response(seq: u32, code: i32, msg: Option<&str>) -> Self {
        let mut raw = Vec::with_capacity(NLMSG_HDR_LEN + 20);
        let header = NlHeader {
            length: 0,
            typ: NLMSG_ERROR,
            flags: 0,
            seq,
            pid: 0,
        };
        raw.extend_from_slice(&bincode::serialize(&header).expect("fixed header"));
        raw.extend_from_slice(&(-code).to_ne_bytes());
        // echoed request header: zeros, nothing failed to echo
        raw.extend_from_slice(&[0u8; NLMSG_HDR_LEN]);
        let length = raw.len() as u32;
        raw[0..4].copy_from_slice(&length.to_ne_bytes());

        let mut out = Msg::nlmsg();
        out.header = NlHeader { length, ..header };
        out.length = raw.len();
        out.raw = Some(raw);
        out.error = (code != 0).then(|| {
            let mut err = KernelError::new(code);
            err.msg = msg.map(str::to_owned);
            MsgError::Kernel(err)
        });
        out
    }
}
