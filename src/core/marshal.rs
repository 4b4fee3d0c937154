//! The marshal: turns a raw buffer into a sequence of decoded messages,
//! picking a schema per message through a configurable key, reassembling
//! fragmented buffers, and attaching decode failures to the offending
//! message instead of aborting the parse.

use crate::bytes::align4;
use crate::core::constants::NLMSG_HDR_LEN;
use crate::core::msg::Msg;
use crate::core::schema::{MsgDef, NLMSG};
use crate::error::{DecodeKind, MsgError};
use crate::{Error, Result};
use log::{debug, warn};
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;

/// A lightweight per-sequence parser: receives the bytes of exactly one
/// message and produces it without going through the registered schemas.
pub type SeqParser = Arc<dyn Fn(&[u8]) -> Result<Msg> + Send + Sync>;

/// Width of the schema-selection key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFormat {
    U16,
    U32,
}

/// Where the schema-selection key lives inside a message. The default
/// reads the 16-bit message type out of the header; subsystems multiplexed
/// over one protocol number (nfnetlink, generic netlink families) relocate
/// and mask it.
#[derive(Debug, Clone, Copy)]
pub struct KeyScheme {
    pub format: KeyFormat,
    pub offset: usize,
    pub mask: u32,
}

impl Default for KeyScheme {
    fn default() -> Self {
        Self {
            format: KeyFormat::U16,
            offset: 4,
            mask: 0xffff,
        }
    }
}

/// Generic marshalling: a registry from key to message schema plus the
/// state needed to parse a stream of kernel packets.
#[derive(Default)]
pub struct Marshal {
    msg_map: HashMap<u32, Arc<MsgDef>>,
    policy: HashMap<u32, Arc<MsgDef>>,
    seq_map: HashMap<u32, SeqParser>,
    key: KeyScheme,
    defrag: HashMap<u64, Vec<u8>>,
    side: HashMap<u32, Vec<Msg>>,
}

impl Marshal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_map<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (u32, Arc<MsgDef>)>,
    {
        let mut marshal = Self::new();
        for (key, def) in entries {
            marshal.register(key, def);
        }
        marshal
    }

    /// Register the schema decoding messages whose key matches.
    pub fn register(&mut self, key: u32, def: Arc<MsgDef>) {
        self.msg_map.insert(key, def);
    }

    pub fn unregister(&mut self, key: u32) {
        self.msg_map.remove(&key);
    }

    /// Register an alternative key → schema map consulted before the main
    /// one, for subsystem-specific messages sharing the family.
    pub fn register_policy<I>(&mut self, entries: I)
    where
        I: IntoIterator<Item = (u32, Arc<MsgDef>)>,
    {
        self.policy.extend(entries);
    }

    pub fn unregister_policy(&mut self, keys: &[u32]) {
        for key in keys {
            self.policy.remove(key);
        }
    }

    /// Short-circuit full schema decoding for one sequence, e.g. a known
    /// dump whose consumer only needs a couple of fields.
    pub fn register_seq_parser(&mut self, seq: u32, parser: SeqParser) {
        self.seq_map.insert(seq, parser);
    }

    pub fn unregister_seq_parser(&mut self, seq: u32) {
        self.seq_map.remove(&seq);
    }

    pub fn set_key_scheme(&mut self, key: KeyScheme) {
        self.key = key;
    }

    /// Drop the save buffer of a socket, if one is outstanding. Called on
    /// socket close so a stale tail can never leak into another parse.
    pub fn forget(&mut self, sock_id: u64) {
        self.defrag.remove(&sock_id);
    }

    /// Messages a seq-filtered [`Marshal::parse`] put aside for `seq`.
    pub fn take_side(&mut self, seq: u32) -> Vec<Msg> {
        self.side.remove(&seq).unwrap_or_default()
    }

    fn resolve_key(&self, msg: &[u8]) -> Option<u32> {
        let off = self.key.offset;
        let raw = match self.key.format {
            KeyFormat::U16 => {
                u32::from(u16::from_ne_bytes(msg.get(off..off + 2)?.try_into().ok()?))
            }
            KeyFormat::U32 => u32::from_ne_bytes(msg.get(off..off + 4)?.try_into().ok()?),
        };
        Some(raw & self.key.mask)
    }

    fn lookup(&self, msg: &[u8]) -> Arc<MsgDef> {
        let Some(key) = self.resolve_key(msg) else {
            return NLMSG.clone();
        };
        self.policy
            .get(&key)
            .or_else(|| self.msg_map.get(&key))
            .cloned()
            .unwrap_or_else(|| NLMSG.clone())
    }

    /// Parse every whole message out of `data`.
    ///
    /// With a `sock_id`, a message cut off at the end of the buffer is
    /// saved and completed by the next call for the same id. With a
    /// `seq_filter`, messages of other sequences are put aside and
    /// retrievable through [`Marshal::take_side`].
    ///
    /// Decode failures do not abort the parse: the offending message is
    /// yielded header-only with the error attached.
    pub fn parse(&mut self, data: &[u8], sock_id: Option<u64>, seq_filter: Option<u32>) -> Vec<Msg> {
        let data: Cow<'_, [u8]> = match sock_id.and_then(|id| self.defrag.remove(&id)) {
            Some(mut saved) => {
                debug!("resuming {} saved bytes", saved.len());
                saved.extend_from_slice(data);
                Cow::Owned(saved)
            }
            None => Cow::Borrowed(data),
        };

        let mut out = Vec::new();
        let total = data.len();
        let mut offset = 0usize;

        while offset < total {
            let remaining = total - offset;
            if remaining < 6 {
                if let Some(id) = sock_id {
                    self.defrag.insert(id, data[offset..].to_vec());
                }
                break;
            }

            let length =
                u32::from_ne_bytes(data[offset..offset + 4].try_into().unwrap()) as usize;
            if length < NLMSG_HDR_LEN {
                warn!("message with impossible length {length} at offset {offset}");
                let mut stub = Msg::nlmsg();
                stub.set_error(Some(MsgError::Decode {
                    kind: DecodeKind::BadLength,
                    offset,
                }));
                out.push(stub);
                break;
            }
            if length > remaining {
                if let Some(id) = sock_id {
                    self.defrag.insert(id, data[offset..].to_vec());
                } else {
                    let mut stub = Msg::nlmsg();
                    stub.set_error(Some(MsgError::Decode {
                        kind: DecodeKind::TooShort,
                        offset: total,
                    }));
                    out.push(stub);
                }
                break;
            }

            let slice = &data[offset..offset + length];
            let seq = u32::from_ne_bytes(slice[8..12].try_into().unwrap());

            let decoded = match self.seq_map.get(&seq) {
                Some(parser) => parser(slice),
                None => Msg::decode(self.lookup(slice), slice),
            };
            let msg = match decoded {
                Ok(msg) => msg,
                Err(err) => {
                    debug!("decode failed at offset {offset}: {err}");
                    let attach = match err {
                        Error::Decode { kind, offset: at } => MsgError::Decode {
                            kind,
                            offset: offset + at,
                        },
                        _ => MsgError::Decode {
                            kind: DecodeKind::BadLength,
                            offset,
                        },
                    };
                    // fall back to the header-only shape so the stream
                    // keeps its cadence
                    let mut stub =
                        Msg::decode(NLMSG.clone(), slice).unwrap_or_else(|_| Msg::nlmsg());
                    stub.set_error(Some(attach));
                    stub
                }
            };

            match seq_filter {
                Some(want) if msg.header.seq != want => {
                    self.side.entry(msg.header.seq).or_default().push(msg);
                }
                _ => out.push(msg),
            }
            offset += align4(length);
        }

        out
    }
}
