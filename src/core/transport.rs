//! The I/O seam under the socket runtime. The demultiplexing state
//! machine is sans-I/O: it only ever sees byte buffers, so the same core
//! drives a kernel netlink socket, the in-process loopback used by the
//! test suite, and the async front-end.

use crate::{Error, Result};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::socket::{bind, getsockopt, recv, send, sockopt, MsgFlags, NetlinkAddr};
use std::collections::VecDeque;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Datagram transport of a netlink conversation.
pub trait Transport: Send + Sync {
    fn bind(&self, epid: u32, groups: u32) -> Result<()>;
    /// Non-blocking at the kernel level; returns the byte count written.
    fn send(&self, buf: &[u8]) -> Result<usize>;
    /// Receive one datagram, waiting up to `timeout` (`None` blocks).
    fn recv(&self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize>;
    /// Size of the next pending datagram, read from its 4-byte length
    /// prefix without consuming it.
    fn peek_len(&self, timeout: Option<Duration>) -> Result<usize>;
    /// Kernel receive buffer size, the default read chunk.
    fn rcvbuf(&self) -> Result<usize>;
    fn add_membership(&self, group: u32) -> Result<()>;
    fn drop_membership(&self, group: u32) -> Result<()>;
    fn close(&self) -> Result<()>;
    /// The underlying descriptor, when there is one to poll.
    fn raw_fd(&self) -> Option<RawFd> {
        None
    }
}

/// A real `AF_NETLINK` socket. Created non-blocking; waiting happens in
/// `poll(2)` so receive timeouts compose with shared-socket readers.
pub struct KernelSocket {
    fd: RawFd,
    closed: AtomicBool,
}

impl KernelSocket {
    /// Open a kernel netlink socket for the given protocol family.
    pub fn open(family: i32) -> Result<Self> {
        // libc::socket instead of nix here: the nix wrapper only admits
        // protocol numbers it has an enum variant for.
        let fd = unsafe {
            nix::libc::socket(
                nix::libc::AF_NETLINK,
                nix::libc::SOCK_DGRAM | nix::libc::SOCK_CLOEXEC | nix::libc::SOCK_NONBLOCK,
                family,
            )
        };
        let fd = Errno::result(fd).map_err(Error::CreateSocket)?;
        Ok(Self {
            fd,
            closed: AtomicBool::new(false),
        })
    }

    /// Adopt an already-open netlink descriptor. The caller keeps the
    /// responsibility of having opened it with the right family; closing
    /// becomes ours.
    pub fn from_raw(fd: RawFd) -> Self {
        Self {
            fd,
            closed: AtomicBool::new(false),
        }
    }

    fn wait_readable(&self, timeout: Option<Duration>) -> Result<()> {
        let millis = timeout
            .map(|t| i32::try_from(t.as_millis()).unwrap_or(i32::MAX))
            .unwrap_or(-1);
        let mut fds = [PollFd::new(self.fd, PollFlags::POLLIN)];
        let ready = poll(&mut fds, millis).map_err(Error::RecvSocket)?;
        if ready == 0 {
            return Err(Error::TimedOut);
        }
        Ok(())
    }
}

impl Transport for KernelSocket {
    fn bind(&self, epid: u32, groups: u32) -> Result<()> {
        let addr = NetlinkAddr::new(epid, groups);
        bind(self.fd, &addr).map_err(|errno| match errno {
            Errno::EADDRINUSE => Error::AddressInUse,
            other => Error::BindSocket(other),
        })
    }

    fn send(&self, buf: &[u8]) -> Result<usize> {
        send(self.fd, buf, MsgFlags::empty()).map_err(Error::SendSocket)
    }

    fn recv(&self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let left = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            self.wait_readable(left)?;
            match recv(self.fd, buf, MsgFlags::empty()) {
                Ok(n) => return Ok(n),
                // lost the race against another reader
                Err(Errno::EAGAIN) => continue,
                Err(errno) => return Err(Error::RecvSocket(errno)),
            }
        }
    }

    fn peek_len(&self, timeout: Option<Duration>) -> Result<usize> {
        self.wait_readable(timeout)?;
        let mut prefix = [0u8; 4];
        recv(self.fd, &mut prefix, MsgFlags::MSG_PEEK).map_err(Error::RecvSocket)?;
        Ok(u32::from_ne_bytes(prefix) as usize)
    }

    fn rcvbuf(&self) -> Result<usize> {
        getsockopt(self.fd, sockopt::RcvBuf)
            .map(|bytes| bytes / 2)
            .map_err(Error::RecvSocket)
    }

    fn add_membership(&self, group: u32) -> Result<()> {
        netlink_membership(self.fd, nix::libc::NETLINK_ADD_MEMBERSHIP, group)
    }

    fn drop_membership(&self, group: u32) -> Result<()> {
        netlink_membership(self.fd, nix::libc::NETLINK_DROP_MEMBERSHIP, group)
    }

    fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            nix::unistd::close(self.fd).map_err(Error::RecvSocket)?;
        }
        Ok(())
    }

    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.fd)
    }
}

impl Drop for KernelSocket {
    fn drop(&mut self) {
        let _ = Transport::close(self);
    }
}

fn netlink_membership(fd: RawFd, op: i32, group: u32) -> Result<()> {
    let rc = unsafe {
        nix::libc::setsockopt(
            fd,
            nix::libc::SOL_NETLINK,
            op,
            std::ptr::addr_of!(group).cast(),
            std::mem::size_of::<u32>() as nix::libc::socklen_t,
        )
    };
    Errno::result(rc).map(drop).map_err(Error::BindSocket)
}

/// Responder installed on a [`Loopback`]: maps each sent datagram to the
/// datagrams the peer answers with.
pub type Responder = Box<dyn Fn(&[u8]) -> Vec<Vec<u8>> + Send + Sync>;

/// An in-process transport. Tests script it with canned datagrams or a
/// responder closure and drive the full socket runtime without a kernel.
#[derive(Default)]
pub struct Loopback {
    incoming: Mutex<VecDeque<Vec<u8>>>,
    available: Condvar,
    sent: Mutex<Vec<Vec<u8>>>,
    responder: Mutex<Option<Responder>>,
    closed: AtomicBool,
}

impl Loopback {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a datagram as if the kernel had sent it.
    pub fn push(&self, datagram: Vec<u8>) {
        self.incoming.lock().unwrap().push_back(datagram);
        self.available.notify_all();
    }

    /// Everything sent through this transport so far.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }

    pub fn set_responder(&self, responder: Responder) {
        *self.responder.lock().unwrap() = Some(responder);
    }
}

impl Transport for Loopback {
    fn bind(&self, _epid: u32, _groups: u32) -> Result<()> {
        Ok(())
    }

    fn send(&self, buf: &[u8]) -> Result<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::SocketClosed);
        }
        self.sent.lock().unwrap().push(buf.to_vec());
        let replies = self
            .responder
            .lock()
            .unwrap()
            .as_ref()
            .map(|r| r(buf))
            .unwrap_or_default();
        for reply in replies {
            self.push(reply);
        }
        Ok(buf.len())
    }

    fn recv(&self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut incoming = self.incoming.lock().unwrap();
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(Error::SocketClosed);
            }
            if let Some(datagram) = incoming.pop_front() {
                let n = datagram.len().min(buf.len());
                buf[..n].copy_from_slice(&datagram[..n]);
                return Ok(n);
            }
            incoming = match deadline {
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Err(Error::TimedOut);
                    }
                    let (guard, result) = self.available.wait_timeout(incoming, left).unwrap();
                    if result.timed_out() && guard.is_empty() {
                        return Err(Error::TimedOut);
                    }
                    guard
                }
                None => self.available.wait(incoming).unwrap(),
            };
        }
    }

    fn peek_len(&self, timeout: Option<Duration>) -> Result<usize> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut incoming = self.incoming.lock().unwrap();
        loop {
            if let Some(front) = incoming.front() {
                return Ok(front.len());
            }
            incoming = match deadline {
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Err(Error::TimedOut);
                    }
                    self.available.wait_timeout(incoming, left).unwrap().0
                }
                None => self.available.wait(incoming).unwrap(),
            };
        }
    }

    fn rcvbuf(&self) -> Result<usize> {
        Ok(65536)
    }

    fn add_membership(&self, _group: u32) -> Result<()> {
        Ok(())
    }

    fn drop_membership(&self, _group: u32) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.available.notify_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_delivers_in_order() {
        let t = Loopback::new();
        t.push(vec![1, 2, 3]);
        t.push(vec![4]);
        let mut buf = [0u8; 16];
        assert_eq!(t.recv(&mut buf, None).unwrap(), 3);
        assert_eq!(&buf[..3], &[1, 2, 3]);
        assert_eq!(t.recv(&mut buf, None).unwrap(), 1);
    }

    #[test]
    fn loopback_times_out() {
        let t = Loopback::new();
        let mut buf = [0u8; 16];
        assert!(matches!(
            t.recv(&mut buf, Some(Duration::from_millis(10))),
            Err(Error::TimedOut)
        ));
    }

    #[test]
    fn responder_answers_sends() {
        let t = Loopback::new();
        t.set_responder(Box::new(|sent| vec![sent.to_vec()]));
        t.send(&[9, 9]).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(t.recv(&mut buf, None).unwrap(), 2);
        assert_eq!(t.sent().len(), 1);
    }
}
