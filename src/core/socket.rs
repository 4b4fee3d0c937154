//! The blocking socket runtime: bind with pooled local ports, send
//! requests, demultiplex responses into per-sequence backlogs, terminate
//! multipart dumps.
//!
//! A socket may be shared across threads. One internal mutex guards the
//! backlog; a read gate makes sure a single kernel datagram is never
//! parsed by two readers at once, while the losing reader waits on a
//! condition variable for the backlog to change.

use crate::core::constants::{NLMSG_DONE, NLMSG_ERROR, NLM_F_DUMP_INTR};
use crate::core::marshal::{KeyScheme, Marshal, SeqParser};
use crate::core::msg::Msg;
use crate::core::pool::AddrPool;
use crate::core::proxy::{Proxy, Verdict};
use crate::core::schema::MsgDef;
use crate::core::transport::{KernelSocket, Transport};
use crate::{Error, Result};
use log::debug;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, TryLockError};
use std::time::{Duration, Instant};

/// Local ports available to one process: 10 bits of the epid.
const PORT_MAX: u32 = 0x3ff;
/// Sequence numbers freed by a finished request stay quarantined for
/// this many releases, so late replies cannot hit a recycled number.
/// A tunable, not a contract.
pub(crate) const SEQ_BAN_WINDOW: usize = 10;

static NEXT_SOCK_ID: AtomicU64 = AtomicU64::new(1);

/// Marshal defragmentation key for a new socket, unique per process.
pub(crate) fn next_sock_id() -> u64 {
    NEXT_SOCK_ID.fetch_add(1, Ordering::Relaxed)
}

/// Process-wide runtime state: the local-port pool. Sockets default to a
/// shared global handle; tests construct isolated ones.
pub struct NlRuntime {
    ports: Mutex<AddrPool>,
}

impl NlRuntime {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            // highest port first, like libnl's generate_local_port
            ports: Mutex::new(AddrPool::reverse(0, PORT_MAX)),
        })
    }

    pub fn global() -> Arc<Self> {
        GLOBAL.clone()
    }

    fn alloc_port(&self) -> Result<u32> {
        self.ports.lock().unwrap().alloc()
    }

    pub(crate) fn free_port(&self, port: u32) {
        let _ = self.ports.lock().unwrap().free(port);
    }
}

lazy_static::lazy_static! {
    static ref GLOBAL: Arc<NlRuntime> = NlRuntime::new();
}

struct SockState {
    backlog: HashMap<u32, VecDeque<Msg>>,
    port: Option<u32>,
    epid: Option<u32>,
    pid: u32,
    fixed: bool,
    groups: u32,
    compile: Option<Vec<u8>>,
    closed: bool,
}

/// What a response consumer should do with one backlog message. Shared
/// between the blocking iterator and the async stream so the dump
/// termination rules exist exactly once.
pub(crate) enum Disposition {
    /// Part of a multipart response; more follow.
    Yield,
    /// A single-shot response: yield it, then the stream is over.
    YieldLast,
    /// `NLMSG_DONE` or an ACK: consume silently and stop.
    Stop,
    /// Same, but the dump was interrupted mid-stream.
    StopInterrupted,
    /// A kernel error terminating the request.
    Fail(crate::KernelError),
}

pub(crate) fn classify(msg: &Msg, interrupted: &mut bool) -> Disposition {
    if msg.header.has_flags(NLM_F_DUMP_INTR) {
        *interrupted = true;
    }
    if let Some(err) = msg.kernel_error() {
        return Disposition::Fail(err.clone());
    }
    if msg.header.typ == NLMSG_DONE || msg.header.typ == NLMSG_ERROR {
        return if *interrupted {
            Disposition::StopInterrupted
        } else {
            Disposition::Stop
        };
    }
    if msg.header.is_multipart() {
        Disposition::Yield
    } else {
        Disposition::YieldLast
    }
}

/// Probe the port pool until the transport accepts a bind, skipping
/// ports some other process occupies. Returns `(port, epid)`.
pub(crate) fn bind_auto_port(
    transport: &dyn Transport,
    runtime: &NlRuntime,
    pid: u32,
    groups: u32,
) -> Result<(u32, u32)> {
    for _ in 0..=PORT_MAX {
        let port = runtime.alloc_port()?;
        let epid = (port << 22) | pid;
        match transport.bind(epid, groups) {
            Ok(()) => {
                debug!("bound to port {port}, epid {epid:#x}");
                return Ok((port, epid));
            }
            // Taken by another process: the pool keeps the port marked
            // so we do not probe it again.
            Err(Error::AddressInUse) => continue,
            Err(other) => {
                runtime.free_port(port);
                return Err(other);
            }
        }
    }
    Err(Error::AddressInUse)
}

fn route(state: &mut SockState, msgs: Vec<Msg>) {
    for msg in msgs {
        let seq = msg.header.seq;
        // broadcasts and replies nobody asked for land in queue 0
        let key = if seq != 0 && state.backlog.contains_key(&seq) {
            seq
        } else {
            0
        };
        state.backlog.entry(key).or_default().push_back(msg);
    }
}

/// A generic netlink socket: the user-space correspondent of a kernel
/// netlink endpoint.
///
/// ```no_run
/// use nlcore::route::{self, RTM_GETLINK};
/// use nlcore::{Flag, Msg, NetlinkSocket};
///
/// fn main() -> nlcore::Result<()> {
///     let sock = route::socket()?;
///     sock.bind(0, None)?;
///
///     let mut msg = Msg::new(route::IFINFMSG.clone());
///     msg.set("family", 0u8)?;
///     for link in sock.nlm_request(&mut msg, RTM_GETLINK, Flag::Request | Flag::Dump)? {
///         println!("{:?}", link?.get_attr("IFLA_IFNAME"));
///     }
///     sock.close()
/// }
/// ```
pub struct NetlinkSocket {
    transport: Arc<dyn Transport>,
    runtime: Arc<NlRuntime>,
    marshal: Mutex<Marshal>,
    state: Mutex<SockState>,
    changed: Condvar,
    read_gate: Mutex<()>,
    seqs: Mutex<AddrPool>,
    proxy: Mutex<Option<Proxy>>,
    sock_id: u64,
}

impl NetlinkSocket {
    /// Open a kernel socket for `family` against the process-global
    /// runtime.
    pub fn open(family: i32) -> Result<Self> {
        Self::open_with(family, NlRuntime::global())
    }

    pub fn open_with(family: i32, runtime: Arc<NlRuntime>) -> Result<Self> {
        let transport = Arc::new(KernelSocket::open(family)?);
        Ok(Self::with_transport(transport, runtime))
    }

    /// Wrap a netlink descriptor that is already open, e.g. one received
    /// over fd passing. The socket takes ownership and closes it.
    pub fn from_fd(fd: std::os::fd::RawFd) -> Self {
        Self::with_transport(Arc::new(KernelSocket::from_raw(fd)), NlRuntime::global())
    }

    /// Build a socket over any transport. This is how the test suite and
    /// the async façade reuse the demultiplexing core.
    pub fn with_transport(transport: Arc<dyn Transport>, runtime: Arc<NlRuntime>) -> Self {
        Self {
            transport,
            runtime,
            marshal: Mutex::new(Marshal::new()),
            state: Mutex::new(SockState {
                backlog: HashMap::new(),
                port: None,
                epid: None,
                pid: std::process::id() & 0x3fffff,
                fixed: false,
                groups: 0,
                compile: None,
                closed: false,
            }),
            changed: Condvar::new(),
            read_gate: Mutex::new(()),
            seqs: Mutex::new(AddrPool::with_ban(1, 0xffff, SEQ_BAN_WINDOW)),
            proxy: Mutex::new(None),
            sock_id: next_sock_id(),
        }
    }

    /// Replace the marshal wholesale, e.g. with a family preset.
    pub fn install_marshal(&self, marshal: Marshal) {
        *self.marshal.lock().unwrap() = marshal;
    }

    pub fn register(&self, key: u32, def: Arc<MsgDef>) {
        self.marshal.lock().unwrap().register(key, def);
    }

    pub fn register_policy<I>(&self, entries: I)
    where
        I: IntoIterator<Item = (u32, Arc<MsgDef>)>,
    {
        self.marshal.lock().unwrap().register_policy(entries);
    }

    pub fn register_seq_parser(&self, seq: u32, parser: SeqParser) {
        self.marshal.lock().unwrap().register_seq_parser(seq, parser);
    }

    pub fn unregister_seq_parser(&self, seq: u32) {
        self.marshal.lock().unwrap().unregister_seq_parser(seq);
    }

    pub fn set_key_scheme(&self, key: KeyScheme) {
        self.marshal.lock().unwrap().set_key_scheme(key);
    }

    /// Install a request proxy. `None` sends everything to the kernel.
    pub fn set_proxy(&self, proxy: Option<Proxy>) {
        *self.proxy.lock().unwrap() = proxy;
    }

    /// Bind to multicast `groups`.
    ///
    /// * `pid = None`: allocate a local port from the process pool and
    ///   compose the epid as `(port << 22) | (process_id & 0x3fffff)`.
    /// * `pid = Some(0)`: bind with the raw process id.
    /// * `pid = Some(n)`: bind with exactly `n`.
    pub fn bind(&self, groups: u32, pid: Option<u32>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(Error::SocketClosed);
        }
        state.groups = groups;

        if let Some(pid) = pid {
            state.fixed = true;
            state.pid = if pid == 0 { std::process::id() } else { pid };
            let epid = state.pid;
            self.transport.bind(epid, groups)?;
            state.port = Some(0);
            state.epid = Some(epid);
            return Ok(());
        }

        state.fixed = false;
        state.pid = std::process::id() & 0x3fffff;
        let (port, epid) =
            bind_auto_port(self.transport.as_ref(), &self.runtime, state.pid, groups)?;
        state.port = Some(port);
        state.epid = Some(epid);
        Ok(())
    }

    /// Local port occupied by this socket, once bound.
    pub fn port(&self) -> Option<u32> {
        self.state.lock().unwrap().port
    }

    /// Effective pid the socket is bound to.
    pub fn epid(&self) -> Option<u32> {
        self.state.lock().unwrap().epid
    }

    pub fn add_membership(&self, group: u32) -> Result<()> {
        self.transport.add_membership(group)
    }

    pub fn drop_membership(&self, group: u32) -> Result<()> {
        self.transport.drop_membership(group)
    }

    /// Finalize the header of `msg`, give the proxy a chance to answer
    /// locally, and write the bytes to the socket. Returns the byte count
    /// sent, or 0 when a proxy or compile mode swallowed the message.
    pub fn put(
        &self,
        msg: &mut Msg,
        msg_type: u16,
        flags: u16,
        seq: u32,
        pid: Option<u32>,
    ) -> Result<usize> {
        {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return Err(Error::SocketClosed);
            }
            msg.header.typ = msg_type;
            msg.header.flags = flags;
            msg.header.seq = seq;
            msg.header.pid = pid.unwrap_or_else(std::process::id);
            if seq != 0 {
                // responses to this sequence are ours, not broadcast
                state.backlog.entry(seq).or_default();
            }
        }

        let bytes = msg.encode()?;

        {
            let mut state = self.state.lock().unwrap();
            if let Some(buf) = state.compile.as_mut() {
                buf.extend_from_slice(&bytes);
                return Ok(0);
            }
        }

        let verdict = {
            let proxy = self.proxy.lock().unwrap();
            match proxy.as_ref() {
                Some(proxy) => proxy.intercept(msg)?,
                None => None,
            }
        };
        match verdict {
            None | Some(Verdict::Forward) => self.transport.send(&bytes),
            Some(Verdict::Rewrite(rewritten)) => self.transport.send(&rewritten),
            Some(Verdict::Respond(responses)) => {
                self.inject(responses);
                Ok(0)
            }
            Some(Verdict::Fail(err)) => {
                self.inject(vec![Msg::error_response(seq, err.code, err.msg.as_deref())]);
                Ok(0)
            }
        }
    }

    /// Feed synthetic messages into the backlog as if the kernel had sent
    /// them.
    pub(crate) fn inject(&self, msgs: Vec<Msg>) {
        let mut state = self.state.lock().unwrap();
        route(&mut state, msgs);
        drop(state);
        self.changed.notify_all();
    }

    /// Allocate a fresh sequence number, send the request, and return an
    /// iterator over its responses. The sequence number returns to the
    /// pool when the iterator terminates or is dropped.
    pub fn nlm_request(&self, msg: &mut Msg, msg_type: u16, flags: u16) -> Result<Response<'_>> {
        let seq = self.seqs.lock().unwrap().alloc()?;
        self.state.lock().unwrap().backlog.entry(seq).or_default();
        if let Err(err) = self.put(msg, msg_type, flags, seq, None) {
            self.state.lock().unwrap().backlog.remove(&seq);
            let _ = self.seqs.lock().unwrap().free(seq);
            return Err(err);
        }
        let mut response = self.response(seq, None, 0);
        response.owns_seq = true;
        Ok(response)
    }

    /// Iterate over the responses buffered (and still arriving) for
    /// `seq`. A `timeout` of zero drains the backlog without touching the
    /// socket.
    pub fn response(&self, seq: u32, timeout: Option<Duration>, bufsize: isize) -> Response<'_> {
        self.state.lock().unwrap().backlog.entry(seq).or_default();
        Response {
            sock: self,
            seq,
            deadline: timeout.map(|t| Instant::now() + t),
            nonblocking: timeout == Some(Duration::ZERO),
            bufsize,
            owns_seq: false,
            done: false,
            cleaned: false,
            interrupted: false,
        }
    }

    /// Collect the whole response batch for `seq`.
    ///
    /// `bufsize` selects the receive chunk: `-1` peeks the length prefix
    /// of the next datagram, `0` asks the kernel for `SO_RCVBUF`, any
    /// positive value is used as given.
    pub fn get(&self, seq: u32, timeout: Option<Duration>, bufsize: isize) -> Result<Vec<Msg>> {
        self.response(seq, timeout, bufsize).collect()
    }

    /// Read one datagram and route its messages, or wait for another
    /// thread to do so.
    fn fill(&self, deadline: Option<Instant>, bufsize: isize) -> Result<()> {
        match self.read_gate.try_lock() {
            Ok(_reader) => {
                let left = remaining(deadline);
                let size = match bufsize {
                    -1 => self.transport.peek_len(left)?,
                    0 => self.transport.rcvbuf()?,
                    n => usize::try_from(n).expect("positive bufsize"),
                };
                let mut buf = vec![0u8; size.max(64)];
                let n = self.transport.recv(&mut buf, remaining(deadline))?;
                let msgs = self
                    .marshal
                    .lock()
                    .unwrap()
                    .parse(&buf[..n], Some(self.sock_id), None);
                let mut state = self.state.lock().unwrap();
                if state.closed {
                    return Err(Error::SocketClosed);
                }
                route(&mut state, msgs);
                drop(state);
                self.changed.notify_all();
                Ok(())
            }
            Err(TryLockError::WouldBlock) => {
                // another thread holds the read role; wait for news
                let state = self.state.lock().unwrap();
                match remaining(deadline) {
                    Some(left) => {
                        if left.is_zero() {
                            return Err(Error::TimedOut);
                        }
                        let (_state, wait) = self.changed.wait_timeout(state, left).unwrap();
                        if wait.timed_out() {
                            return Err(Error::TimedOut);
                        }
                    }
                    None => {
                        let _state = self.changed.wait(state).unwrap();
                    }
                }
                Ok(())
            }
            Err(TryLockError::Poisoned(err)) => panic!("poisoned read gate: {err}"),
        }
    }

    /// Capture subsequent `put` calls into a buffer instead of sending.
    pub fn compile_begin(&self) {
        self.state.lock().unwrap().compile = Some(Vec::new());
    }

    /// Stop capturing and return the compiled byte stream.
    pub fn compile_end(&self) -> Vec<u8> {
        self.state.lock().unwrap().compile.take().unwrap_or_default()
    }

    /// Run `body` in compile mode and return the bytes its `put` calls
    /// would have sent. No I/O happens while the mode is active.
    pub fn compile<F>(&self, body: F) -> Result<Vec<u8>>
    where
        F: FnOnce(&Self) -> Result<()>,
    {
        self.compile_begin();
        let result = body(self);
        let bytes = self.compile_end();
        result.map(|()| bytes)
    }

    /// Release the local port, drop pending backlogs, and shut the
    /// underlying descriptor. Idempotent.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        state.backlog.clear();
        if let (Some(port), false) = (state.port.take(), state.fixed) {
            self.runtime.free_port(port);
        }
        state.epid = None;
        drop(state);
        self.marshal.lock().unwrap().forget(self.sock_id);
        self.changed.notify_all();
        self.transport.close()
    }
}

impl Drop for NetlinkSocket {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn remaining(deadline: Option<Instant>) -> Option<Duration> {
    deadline.map(|d| d.saturating_duration_since(Instant::now()))
}

/// Iterator over the responses to one sequence number. Terminates when
/// the dump is done (`NLMSG_DONE`), a single-part response arrives
/// (`NLM_F_MULTI` clear), or an ACK is consumed; a kernel error or a
/// timeout surfaces as the final `Err` item.
pub struct Response<'a> {
    sock: &'a NetlinkSocket,
    seq: u32,
    deadline: Option<Instant>,
    nonblocking: bool,
    bufsize: isize,
    owns_seq: bool,
    done: bool,
    cleaned: bool,
    interrupted: bool,
}

impl Response<'_> {
    /// Replace the wait budget for the remaining items.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self.nonblocking = timeout.is_zero();
        self
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }

    fn pop(&mut self) -> Option<Msg> {
        let mut state = self.sock.state.lock().unwrap();
        state.backlog.get_mut(&self.seq).and_then(VecDeque::pop_front)
    }

    fn terminate(&mut self) {
        self.done = true;
        if self.cleaned {
            return;
        }
        self.cleaned = true;
        if self.seq != 0 {
            self.sock.state.lock().unwrap().backlog.remove(&self.seq);
        }
        if self.owns_seq {
            let _ = self.sock.seqs.lock().unwrap().free(self.seq);
        }
    }
}

impl Iterator for Response<'_> {
    type Item = Result<Msg>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            match self.pop() {
                Some(msg) => match classify(&msg, &mut self.interrupted) {
                    Disposition::Yield => return Some(Ok(msg)),
                    Disposition::YieldLast => {
                        self.terminate();
                        return Some(Ok(msg));
                    }
                    Disposition::Stop => {
                        self.terminate();
                        return None;
                    }
                    Disposition::StopInterrupted => {
                        self.terminate();
                        return Some(Err(Error::DumpInterrupted));
                    }
                    Disposition::Fail(err) => {
                        self.terminate();
                        return Some(Err(Error::Kernel(err)));
                    }
                },
                None => {
                    if self.nonblocking {
                        self.terminate();
                        return None;
                    }
                    if let Err(err) = self.sock.fill(self.deadline, self.bufsize) {
                        self.terminate();
                        return Some(Err(err));
                    }
                }
            }
        }
    }
}

impl Drop for Response<'_> {
    fn drop(&mut self) {
        self.terminate();
    }
}
