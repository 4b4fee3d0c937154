//! Compatibility handlers for kernels that cannot create certain link
//! kinds over netlink: bridge and bond devices go through sysfs or the
//! bridge ioctls, tuntap devices through `/dev/net/tun`. Each handler
//! answers the request with a synthetic ACK, so callers never notice the
//! detour.

use crate::core::msg::Msg;
use crate::core::proxy::{Proxy, ProxyHandler, Verdict};
use crate::core::value::Value;
use crate::route::{RTM_DELLINK, RTM_NEWLINK};
use crate::{Error, KernelError, Result};
use log::debug;
use nix::libc;
use std::io::Write;
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::sync::Arc;

const SIOCBRADDBR: libc::c_ulong = 0x89a0;
const SIOCBRDELBR: libc::c_ulong = 0x89a1;

const IFF_TUN: u16 = 0x0001;
const IFF_TAP: u16 = 0x0002;
const IFF_MULTI_QUEUE: u16 = 0x0100;
const IFF_NO_PI: u16 = 0x1000;
const IFF_ONE_QUEUE: u16 = 0x2000;
const IFF_VNET_HDR: u16 = 0x4000;

nix::ioctl_write_ptr_bad!(
    tun_set_iff,
    nix::request_code_write!(b'T', 202, std::mem::size_of::<libc::c_int>()),
    libc::ifreq
);
nix::ioctl_write_int_bad!(
    tun_set_persist,
    nix::request_code_write!(b'T', 203, std::mem::size_of::<libc::c_int>())
);

/// The proxy pyroute-style consumers install on old kernels: bridge and
/// bond emulation plus tuntap creation.
pub fn compat() -> Proxy {
    let mut proxy = Proxy::new();
    let sysfs = Arc::new(SysfsCompat::new());
    proxy.register(RTM_NEWLINK, sysfs.clone());
    proxy.register(RTM_DELLINK, sysfs);
    proxy.register(RTM_NEWLINK, Arc::new(TuntapCompat::new()));
    proxy
}

fn link_kind(msg: &Msg) -> Option<&str> {
    msg.get_nested(&["IFLA_LINKINFO", "IFLA_INFO_KIND"])
        .and_then(Value::as_str)
}

fn link_name(msg: &Msg) -> Result<&str> {
    msg.get_attr("IFLA_IFNAME")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Proxy("link request without IFLA_IFNAME".into()))
}

fn io_errno(err: &std::io::Error) -> KernelError {
    KernelError::new(err.raw_os_error().unwrap_or(libc::EIO))
}

/// Bridge and bond create/delete emulation. Bond devices go through
/// `<root>/bonding_masters`; bridges need the `SIOCBRADDBR` ioctl.
pub struct SysfsCompat {
    root: PathBuf,
}

impl Default for SysfsCompat {
    fn default() -> Self {
        Self::new()
    }
}

impl SysfsCompat {
    pub fn new() -> Self {
        Self::with_root("/sys/class/net")
    }

    /// Point the handler at another sysfs root. Tests use a scratch
    /// directory here.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn bond_ctl(&self, name: &str, sign: char) -> std::result::Result<(), KernelError> {
        let path = self.root.join("bonding_masters");
        debug!("bonding_masters {sign}{name}");
        std::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .and_then(|mut f| write!(f, "{sign}{name}"))
            .map_err(|err| io_errno(&err))
    }

    fn bridge_ctl(&self, name: &str, add: bool) -> std::result::Result<(), KernelError> {
        let sock = nix::sys::socket::socket(
            nix::sys::socket::AddressFamily::Inet,
            nix::sys::socket::SockType::Stream,
            nix::sys::socket::SockFlag::SOCK_CLOEXEC,
            None,
        )
        .map_err(|errno| KernelError::new(errno as i32))?;
        let name = std::ffi::CString::new(name).map_err(|_| KernelError::new(libc::EINVAL))?;
        let request = if add { SIOCBRADDBR } else { SIOCBRDELBR };
        let rc = unsafe { libc::ioctl(sock, request, name.as_ptr()) };
        let result = nix::errno::Errno::result(rc)
            .map(drop)
            .map_err(|errno| KernelError::new(errno as i32));
        let _ = nix::unistd::close(sock);
        result
    }
}

impl ProxyHandler for SysfsCompat {
    fn handle(&self, msg: &Msg) -> Result<Option<Verdict>> {
        let Some(kind) = link_kind(msg) else {
            return Ok(None);
        };
        let create = msg.header.typ == RTM_NEWLINK;
        let outcome = match kind {
            "bond" => self.bond_ctl(link_name(msg)?, if create { '+' } else { '-' }),
            "bridge" => self.bridge_ctl(link_name(msg)?, create),
            _ => return Ok(None),
        };
        Ok(Some(match outcome {
            Ok(()) => Verdict::Respond(vec![Msg::ack(msg.header.seq)]),
            Err(err) => Verdict::Fail(err),
        }))
    }
}

pub(crate) fn tun_flags(
    mode: &str,
    no_pi: bool,
    one_queue: bool,
    vnet_hdr: bool,
    multi_queue: bool,
) -> u16 {
    let mut flags = if mode == "tun" { IFF_TUN } else { IFF_TAP };
    if no_pi {
        flags |= IFF_NO_PI;
    }
    if one_queue {
        flags |= IFF_ONE_QUEUE;
    }
    if vnet_hdr {
        flags |= IFF_VNET_HDR;
    }
    if multi_queue {
        flags |= IFF_MULTI_QUEUE;
    }
    flags
}

/// Tuntap creation: `RTM_NEWLINK` with kind `tuntap` becomes a
/// `TUNSETIFF`/`TUNSETPERSIST` pair on the tun control device.
pub struct TuntapCompat {
    dev: PathBuf,
}

impl Default for TuntapCompat {
    fn default() -> Self {
        Self::new()
    }
}

impl TuntapCompat {
    pub fn new() -> Self {
        Self {
            dev: PathBuf::from("/dev/net/tun"),
        }
    }

    fn create(&self, name: &str, flags: u16) -> std::result::Result<(), KernelError> {
        if name.len() >= libc::IFNAMSIZ {
            return Err(KernelError::new(libc::EINVAL));
        }
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.dev)
            .map_err(|err| io_errno(&err))?;

        let mut req: libc::ifreq = unsafe { std::mem::zeroed() };
        for (slot, byte) in req.ifr_name.iter_mut().zip(name.as_bytes()) {
            *slot = *byte as libc::c_char;
        }
        req.ifr_ifru.ifru_flags = flags as libc::c_short;

        let fd = file.as_raw_fd();
        unsafe {
            tun_set_iff(fd, &req).map_err(|errno| KernelError::new(errno as i32))?;
            tun_set_persist(fd, 1).map_err(|errno| KernelError::new(errno as i32))?;
        }
        Ok(())
    }
}

impl ProxyHandler for TuntapCompat {
    fn handle(&self, msg: &Msg) -> Result<Option<Verdict>> {
        if link_kind(msg) != Some("tuntap") {
            return Ok(None);
        }
        let data = msg
            .get_nested(&["IFLA_LINKINFO", "IFLA_INFO_DATA"])
            .and_then(Value::as_nested)
            .ok_or_else(|| Error::Proxy("tuntap request without IFTUN data".into()))?;
        let mode = crate::core::nla::find(data, "IFTUN_MODE")
            .and_then(Value::as_str)
            .unwrap_or("tap");
        let ifr = crate::core::nla::find(data, "IFTUN_IFR");
        let flag_of = |field: &str| {
            ifr.and_then(|v| v.field(field))
                .and_then(Value::as_u8)
                .unwrap_or(0)
                != 0
        };
        let flags = tun_flags(
            mode,
            flag_of("no_pi"),
            flag_of("one_queue"),
            flag_of("vnet_hdr"),
            flag_of("multi_queue"),
        );
        Ok(Some(match self.create(link_name(msg)?, flags) {
            Ok(()) => Verdict::Respond(vec![Msg::ack(msg.header.seq)]),
            Err(err) => Verdict::Fail(err),
        }))
    }
}
