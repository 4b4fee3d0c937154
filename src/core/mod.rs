//! Protocol-independent core: the declarative type system, the codecs,
//! the marshal and the socket runtime.

pub mod aio;
pub mod codec;
pub mod constants;
pub mod marshal;
pub mod msg;
pub mod nla;
pub mod pool;
pub mod proxy;
pub mod schema;
pub mod socket;
pub mod transport;
pub mod value;

pub use aio::AsyncNetlinkSocket;
pub use constants::*;
pub use marshal::{KeyFormat, KeyScheme, Marshal, SeqParser};
pub use msg::{Msg, NlHeader};
pub use nla::AttrNode;
pub use pool::AddrPool;
pub use proxy::{Proxy, ProxyHandler, Verdict};
pub use schema::{
    AttrDef, AttrMap, AttrSchema, ChoiceDef, Endian, Field, Kind, MsgDef, Prim, Schema, StructDef,
    TagAdapter,
};
pub use socket::{NetlinkSocket, NlRuntime, Response};
pub use transport::{KernelSocket, Loopback, Transport};
pub use value::{HardwareAddr, Value};
