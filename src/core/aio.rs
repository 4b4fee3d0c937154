//! The async façade: the surface of [`NetlinkSocket`] over a tokio
//! event loop, with dumps exposed as asynchronous streams.
//!
//! Parsing, routing and dump termination are the same sans-I/O pieces the
//! blocking runtime uses ([`Marshal`], [`classify`]); only the waiting
//! differs. Nothing here blocks the executor: kernel sockets suspend on
//! [`AsyncFd`] readiness, descriptor-less transports lease short slices
//! of the blocking pool.
//!
//! [`NetlinkSocket`]: crate::core::socket::NetlinkSocket

use crate::core::marshal::Marshal;
use crate::core::msg::Msg;
use crate::core::pool::AddrPool;
use crate::core::schema::MsgDef;
use crate::core::socket::{
    bind_auto_port, classify, next_sock_id, Disposition, NlRuntime, SEQ_BAN_WINDOW,
};
use crate::core::transport::{KernelSocket, Transport};
use crate::{Error, Result};
use futures::stream::{unfold, BoxStream, Stream, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::unix::AsyncFd;

struct AioState {
    port: Option<u32>,
    epid: Option<u32>,
    pid: u32,
    fixed: bool,
    closed: bool,
}

/// An async netlink socket. Single-threaded cooperative: `recv` and the
/// dump streams suspend instead of blocking, and no message is ever
/// parsed partially across suspension points.
pub struct AsyncNetlinkSocket {
    transport: Arc<dyn Transport>,
    fd: Option<AsyncFd<RawFd>>,
    runtime: Arc<NlRuntime>,
    marshal: Mutex<Marshal>,
    backlog: Mutex<HashMap<u32, VecDeque<Msg>>>,
    seqs: Mutex<AddrPool>,
    state: Mutex<AioState>,
    read_gate: tokio::sync::Mutex<()>,
    sock_id: u64,
}

impl AsyncNetlinkSocket {
    /// Open a kernel socket for `family`. Must run inside a tokio
    /// runtime: the descriptor registers with the reactor here.
    pub fn open(family: i32) -> Result<Self> {
        Self::open_with(family, NlRuntime::global())
    }

    pub fn open_with(family: i32, runtime: Arc<NlRuntime>) -> Result<Self> {
        let kernel = Arc::new(KernelSocket::open(family)?);
        let raw = kernel.raw_fd().expect("kernel socket has a descriptor");
        let fd = AsyncFd::new(raw)?;
        Ok(Self::build(kernel, Some(fd), runtime))
    }

    /// Build over any transport, e.g. the loopback used in tests.
    pub fn with_transport(transport: Arc<dyn Transport>, runtime: Arc<NlRuntime>) -> Self {
        Self::build(transport, None, runtime)
    }

    fn build(
        transport: Arc<dyn Transport>,
        fd: Option<AsyncFd<RawFd>>,
        runtime: Arc<NlRuntime>,
    ) -> Self {
        Self {
            transport,
            fd,
            runtime,
            marshal: Mutex::new(Marshal::new()),
            backlog: Mutex::new(HashMap::new()),
            seqs: Mutex::new(AddrPool::with_ban(1, 0xffff, SEQ_BAN_WINDOW)),
            state: Mutex::new(AioState {
                port: None,
                epid: None,
                pid: std::process::id() & 0x3fffff,
                fixed: false,
                closed: false,
            }),
            read_gate: tokio::sync::Mutex::new(()),
            sock_id: next_sock_id(),
        }
    }

    pub fn install_marshal(&self, marshal: Marshal) {
        *self.marshal.lock().unwrap() = marshal;
    }

    pub fn register(&self, key: u32, def: Arc<MsgDef>) {
        self.marshal.lock().unwrap().register(key, def);
    }

    /// Bind with the same port semantics as the blocking socket; never
    /// awaits kernel events.
    pub fn bind(&self, groups: u32, pid: Option<u32>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(Error::SocketClosed);
        }
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

    pub fn port(&self) -> Option<u32> {
        self.state.lock().unwrap().port
    }

    pub fn epid(&self) -> Option<u32> {
        self.state.lock().unwrap().epid
    }

    /// Finalize and send one message, suspending on a full send buffer.
    pub async fn put(
        &self,
        msg: &mut Msg,
        msg_type: u16,
        flags: u16,
        seq: u32,
        pid: Option<u32>,
    ) -> Result<usize> {
        {
            let state = self.state.lock().unwrap();
            if state.closed {
                return Err(Error::SocketClosed);
            }
            msg.header.typ = msg_type;
            msg.header.flags = flags;
            msg.header.seq = seq;
            msg.header.pid = pid.unwrap_or_else(std::process::id);
        }
        if seq != 0 {
            self.backlog.lock().unwrap().entry(seq).or_default();
        }
        let bytes = msg.encode()?;

        if let Some(fd) = &self.fd {
            loop {
                let mut guard = fd.writable().await?;
                match self.transport.send(&bytes) {
                    Err(Error::SendSocket(nix::errno::Errno::EAGAIN)) => guard.clear_ready(),
                    result => return result,
                }
            }
        }
        self.transport.send(&bytes)
    }

    /// Allocate a sequence number, send the request, and return the
    /// response stream. Dropping the stream cancels the request: the
    /// sequence queue is removed and buffered messages are discarded.
    pub async fn nlm_request<'a>(
        &'a self,
        msg: &mut Msg,
        msg_type: u16,
        flags: u16,
    ) -> Result<BoxStream<'a, Result<Msg>>> {
        let seq = self.seqs.lock().unwrap().alloc()?;
        self.backlog.lock().unwrap().entry(seq).or_default();
        if let Err(err) = self.put(msg, msg_type, flags, seq, None).await {
            self.backlog.lock().unwrap().remove(&seq);
            let _ = self.seqs.lock().unwrap().free(seq);
            return Err(err);
        }
        Ok(self.response_stream(seq, true).boxed())
    }

    /// The response stream for an externally managed sequence number.
    pub fn dump(&self, seq: u32) -> impl Stream<Item = Result<Msg>> + '_ {
        self.backlog.lock().unwrap().entry(seq).or_default();
        self.response_stream(seq, false)
    }

    /// Collect the whole response batch for `seq`.
    pub async fn get(&self, seq: u32, timeout: Option<Duration>) -> Result<Vec<Msg>> {
        let collect = async {
            let stream = self.dump(seq);
            futures::pin_mut!(stream);
            let mut out = Vec::new();
            while let Some(item) = stream.next().await {
                out.push(item?);
            }
            Ok(out)
        };
        match timeout {
            Some(budget) => tokio::time::timeout(budget, collect)
                .await
                .map_err(|_| Error::TimedOut)?,
            None => collect.await,
        }
    }

    fn response_stream(&self, seq: u32, owns_seq: bool) -> impl Stream<Item = Result<Msg>> + '_ {
        let state = DumpState {
            slot: SeqSlot {
                sock: self,
                seq,
                owns_seq,
                active: true,
            },
            interrupted: false,
            done: false,
        };
        unfold(state, |mut st| async move {
            loop {
                if st.done {
                    return None;
                }
                let popped = {
                    let mut backlog = st.slot.sock.backlog.lock().unwrap();
                    backlog.get_mut(&st.slot.seq).and_then(VecDeque::pop_front)
                };
                match popped {
                    Some(msg) => match classify(&msg, &mut st.interrupted) {
                        Disposition::Yield => return Some((Ok(msg), st)),
                        Disposition::YieldLast => {
                            st.done = true;
                            st.slot.release();
                            return Some((Ok(msg), st));
                        }
                        Disposition::Stop => {
                            st.slot.release();
                            return None;
                        }
                        Disposition::StopInterrupted => {
                            st.done = true;
                            st.slot.release();
                            return Some((Err(Error::DumpInterrupted), st));
                        }
                        Disposition::Fail(err) => {
                            st.done = true;
                            st.slot.release();
                            return Some((Err(Error::Kernel(err)), st));
                        }
                    },
                    None => {
                        if let Err(err) = st.slot.sock.fill(st.slot.seq).await {
                            st.done = true;
                            st.slot.release();
                            return Some((Err(err), st));
                        }
                    }
                }
            }
        })
    }

    /// Read and route one datagram, unless another task already routed
    /// something for `seq` while we waited for the read role.
    async fn fill(&self, seq: u32) -> Result<()> {
        let _gate = self.read_gate.lock().await;
        {
            let backlog = self.backlog.lock().unwrap();
            if backlog.get(&seq).is_some_and(|q| !q.is_empty()) {
                return Ok(());
            }
        }
        let datagram = self.read_datagram().await?;
        let msgs = self
            .marshal
            .lock()
            .unwrap()
            .parse(&datagram, Some(self.sock_id), None);
        let mut backlog = self.backlog.lock().unwrap();
        for msg in msgs {
            let s = msg.header.seq;
            let key = if s != 0 && backlog.contains_key(&s) { s } else { 0 };
            backlog.entry(key).or_default().push_back(msg);
        }
        Ok(())
    }

    async fn read_datagram(&self) -> Result<Vec<u8>> {
        if let Some(fd) = &self.fd {
            loop {
                let mut guard = fd.readable().await?;
                let mut buf = vec![0u8; self.transport.rcvbuf()?];
                match self.transport.recv(&mut buf, Some(Duration::ZERO)) {
                    Ok(n) => {
                        buf.truncate(n);
                        return Ok(buf);
                    }
                    Err(Error::TimedOut) => guard.clear_ready(),
                    Err(err) => return Err(err),
                }
            }
        }
        // No descriptor to poll: read in short slices on the blocking
        // pool so a dropped caller stops promptly at the next await.
        loop {
            let transport = self.transport.clone();
            let joined = tokio::task::spawn_blocking(move || {
                let mut buf = vec![0u8; 65536];
                let n = transport.recv(&mut buf, Some(Duration::from_millis(20)))?;
                buf.truncate(n);
                Ok::<_, Error>(buf)
            })
            .await
            .map_err(|err| {
                Error::Io(std::io::Error::new(std::io::ErrorKind::Other, err.to_string()))
            })?;
            match joined {
                Ok(buf) => return Ok(buf),
                Err(Error::TimedOut) => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Close the socket: release the port, drop the backlogs, shut the
    /// descriptor.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        if let (Some(port), false) = (state.port.take(), state.fixed) {
            self.runtime.free_port(port);
        }
        state.epid = None;
        drop(state);
        self.backlog.lock().unwrap().clear();
        self.marshal.lock().unwrap().forget(self.sock_id);
        self.transport.close()
    }
}

impl Drop for AsyncNetlinkSocket {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

struct SeqSlot<'a> {
    sock: &'a AsyncNetlinkSocket,
    seq: u32,
    owns_seq: bool,
    active: bool,
}

impl SeqSlot<'_> {
    fn release(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if self.seq != 0 {
            self.sock.backlog.lock().unwrap().remove(&self.seq);
        }
        if self.owns_seq {
            let _ = self.sock.seqs.lock().unwrap().free(self.seq);
        }
    }
}

impl Drop for SeqSlot<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

struct DumpState<'a> {
    slot: SeqSlot<'a>,
    interrupted: bool,
    done: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::constants::{NLMSG_DONE, NLM_F_MULTI};
    use crate::core::schema::{AttrMap, Field, Kind, Schema, StructDef};
    use crate::core::transport::Loopback;

    fn test_def() -> Arc<MsgDef> {
        let body = StructDef::new(vec![
            Field::new("family", Kind::U8),
            Field::pad(3),
            Field::new("index", Kind::U32),
        ]);
        let attrs = AttrMap::positional([
            ("T_UNSPEC", Schema::None),
            ("T_NAME", Schema::prim(Kind::CStr)),
        ]);
        MsgDef::new("testmsg", Some(body), Some(attrs.into_schema()))
    }

    fn part(seq: u32, index: u32, multi: bool) -> Vec<u8> {
        let mut msg = Msg::new(test_def());
        msg.header.typ = 16;
        msg.header.flags = if multi { NLM_F_MULTI } else { 0 };
        msg.header.seq = seq;
        msg.set("index", index).unwrap();
        msg.encode().unwrap()
    }

    fn done(seq: u32) -> Vec<u8> {
        let mut msg = Msg::nlmsg();
        msg.header.typ = NLMSG_DONE;
        msg.header.seq = seq;
        msg.encode().unwrap()
    }

    fn sock_with(loopback: Arc<Loopback>) -> AsyncNetlinkSocket {
        let sock = AsyncNetlinkSocket::with_transport(loopback, NlRuntime::new());
        sock.register(16, test_def());
        sock
    }

    #[tokio::test]
    async fn dump_terminates_on_done() {
        let loopback = Arc::new(Loopback::new());
        loopback.set_responder(Box::new(|sent| {
            let seq = u32::from_ne_bytes(sent[8..12].try_into().unwrap());
            vec![part(seq, 1, true), part(seq, 2, true), done(seq)]
        }));
        let sock = sock_with(loopback);

        let mut msg = Msg::new(test_def());
        let stream = sock.nlm_request(&mut msg, 16, 0x301).await.unwrap();
        futures::pin_mut!(stream);
        let mut indices = Vec::new();
        while let Some(item) = stream.next().await {
            indices.push(item.unwrap().get("index").unwrap().as_u32().unwrap());
        }
        assert_eq!(indices, [1, 2]);
    }

    #[tokio::test]
    async fn interleaved_sequences_stay_separate() {
        let loopback = Arc::new(Loopback::new());
        let sock = sock_with(loopback.clone());

        let mut a = Msg::new(test_def());
        let mut b = Msg::new(test_def());
        let stream_a = sock.nlm_request(&mut a, 16, 1).await.unwrap();
        let stream_b = sock.nlm_request(&mut b, 16, 1).await.unwrap();
        let seq_a = a.header.seq;
        let seq_b = b.header.seq;

        // interleave the two dumps in one datagram burst
        loopback.push(part(seq_a, 10, true));
        loopback.push(part(seq_b, 20, true));
        loopback.push(part(seq_a, 11, true));
        loopback.push(done(seq_a));
        loopback.push(part(seq_b, 21, true));
        loopback.push(done(seq_b));

        futures::pin_mut!(stream_a);
        futures::pin_mut!(stream_b);
        let (got_a, got_b) = futures::join!(
            async {
                let mut v = Vec::new();
                while let Some(item) = stream_a.next().await {
                    v.push(item.unwrap().get("index").unwrap().as_u32().unwrap());
                }
                v
            },
            async {
                let mut v = Vec::new();
                while let Some(item) = stream_b.next().await {
                    v.push(item.unwrap().get("index").unwrap().as_u32().unwrap());
                }
                v
            }
        );
        assert_eq!(got_a, [10, 11]);
        assert_eq!(got_b, [20, 21]);
    }

    #[tokio::test]
    async fn kernel_error_fails_the_stream() {
        let loopback = Arc::new(Loopback::new());
        loopback.set_responder(Box::new(|sent| {
            let seq = u32::from_ne_bytes(sent[8..12].try_into().unwrap());
            vec![Msg::error_response(seq, 19, None).encode().unwrap()]
        }));
        let sock = sock_with(loopback);

        let mut msg = Msg::new(test_def());
        let stream = sock.nlm_request(&mut msg, 16, 1).await.unwrap();
        futures::pin_mut!(stream);
        match stream.next().await {
            Some(Err(Error::Kernel(err))) => assert_eq!(err.code, 19),
            other => panic!("expected kernel error, got {other:?}"),
        }
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn dropping_the_stream_releases_the_queue() {
        let loopback = Arc::new(Loopback::new());
        let sock = sock_with(loopback.clone());

        let mut msg = Msg::new(test_def());
        let seq;
        {
            let stream = sock.nlm_request(&mut msg, 16, 1).await.unwrap();
            seq = msg.header.seq;
            drop(stream);
        }
        // buffered messages for a cancelled request are discarded
        assert!(!sock.backlog.lock().unwrap().contains_key(&seq));
    }

    #[tokio::test]
    async fn get_times_out() {
        let loopback = Arc::new(Loopback::new());
        let sock = sock_with(loopback);
        let result = sock.get(9, Some(Duration::from_millis(30))).await;
        assert!(matches!(result, Err(Error::TimedOut)));
    }
}
