use std::fmt;

/// Convenience return type for fallible Netlink methods.
pub type Result<T> = std::result::Result<T, Error>;

/// What exactly went wrong while decoding a byte buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeKind {
    /// Expected more bytes than the buffer holds.
    TooShort,
    /// A string attribute contained invalid UTF-8.
    BadUtf8,
    /// An address payload had an impossible length.
    BadAddress,
    /// A declared length field is inconsistent with the wire format.
    BadLength,
    /// A fixed struct payload left unconsumed bytes.
    TrailingBytes,
}

impl fmt::Display for DecodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::TooShort => "not enough bytes",
            Self::BadUtf8 => "invalid utf-8",
            Self::BadAddress => "bad address payload",
            Self::BadLength => "inconsistent length field",
            Self::TrailingBytes => "trailing bytes after fixed struct",
        };
        f.write_str(text)
    }
}

/// A non-zero error code delivered by the kernel in an `NLMSG_ERROR`
/// message, together with the extended ack details when present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelError {
    /// Positive errno value.
    pub code: i32,
    /// `NLMSGERR_ATTR_MSG`, if the kernel attached one.
    pub msg: Option<String>,
    /// `NLMSGERR_ATTR_OFFS`, byte offset of the offending attribute
    /// in the original request.
    pub offset: Option<u32>,
}

impl KernelError {
    pub fn new(code: i32) -> Self {
        Self {
            code,
            msg: None,
            offset: None,
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.msg {
            Some(msg) => write!(f, "errno {}: {msg}", self.code),
            None => write!(f, "errno {}", self.code),
        }
    }
}

/// An error attached to a decoded message. Decode failures are non-fatal
/// for the marshal: the offending message carries one of these and the
/// rest of the buffer is still parsed. Kernel errors terminate the
/// awaiting request but leave the socket usable.
#[derive(Debug, Clone, PartialEq)]
pub enum MsgError {
    Decode { kind: DecodeKind, offset: usize },
    Kernel(KernelError),
}

impl MsgError {
    pub fn kernel(&self) -> Option<&KernelError> {
        match self {
            Self::Kernel(err) => Some(err),
            Self::Decode { .. } => None,
        }
    }
}

impl fmt::Display for MsgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode { kind, offset } => {
                write!(f, "failed to decode at offset {offset}: {kind}")
            }
            Self::Kernel(err) => write!(f, "kernel reported {err}"),
        }
    }
}

impl From<MsgError> for Error {
    fn from(err: MsgError) -> Self {
        match err {
            MsgError::Decode { kind, offset } => Self::Decode { kind, offset },
            MsgError::Kernel(err) => Self::Kernel(err),
        }
    }
}

/// Everything that might go wrong when packing Netlink packets, talking to
/// the kernel, or waiting for its answers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to decode at offset {offset}: {kind}")]
    Decode { kind: DecodeKind, offset: usize },
    #[error("kernel reported {0}")]
    Kernel(KernelError),
    #[error("dump was interrupted, results may be inconsistent")]
    DumpInterrupted,
    #[error("timed out waiting for a response")]
    TimedOut,
    #[error("address already in use")]
    AddressInUse,
    #[error("no free address available")]
    NoFreeAddress,
    #[error("address is not allocated")]
    NotAllocated,
    #[error("operation on a closed socket")]
    SocketClosed,
    #[error("failed to create socket with errno {0}")]
    CreateSocket(nix::errno::Errno),
    #[error("failed to bind socket with errno {0}")]
    BindSocket(nix::errno::Errno),
    #[error("failed to send to socket with errno {0}")]
    SendSocket(nix::errno::Errno),
    #[error("failed to recv from socket with errno {0}")]
    RecvSocket(nix::errno::Errno),
    #[error("socket operation failed with error {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to serialize with error {0}")]
    Serialize(bincode::Error),
    #[error("no field or attribute named {0} in the schema")]
    UnknownName(String),
    #[error("value does not match the schema node: {0}")]
    ValueMismatch(&'static str),
    #[error("unsupported netlink family {0}")]
    UnknownFamily(i32),
    #[error("failed to build with error {0}")]
    Build(derive_builder::UninitializedFieldError),
    #[error("proxy handler failed: {0}")]
    Proxy(String),
}

impl Error {
    pub(crate) fn too_short(offset: usize) -> Self {
        Self::Decode {
            kind: DecodeKind::TooShort,
            offset,
        }
    }

    /// True for errors the marshal attaches to a message instead of
    /// aborting the whole parse.
    pub fn is_decode(&self) -> bool {
        matches!(self, Self::Decode { .. })
    }
}

impl From<derive_builder::UninitializedFieldError> for Error {
    fn from(err: derive_builder::UninitializedFieldError) -> Self {
        Self::Build(err)
    }
}

impl From<KernelError> for Error {
    fn from(err: KernelError) -> Self {
        Self::Kernel(err)
    }
}
