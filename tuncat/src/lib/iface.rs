//! Interface provisioning: opening `/dev/net/tun`, creating the tun/tap
//! device, bringing it up, and assigning an address (SPEC_FULL.md §4.5).
//! Grounded directly on `create_tunif`/`change_ifflags` in the original
//! `tuncat_if.c`, generalized to also carry the address-assignment contract.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use nix::fcntl::{open, OFlag};
use nix::libc::{self, c_short};
use nix::sys::stat::Mode;
use nix::unistd::{Gid, Uid};

use crate::config::{IfAddress, SessionConfig, TunnelMode};
use crate::error::ProvisioningError;

const IFNAMSIZ: usize = 16;

// Not exposed by the `nix` "ioctl" feature's safe wrappers for this device; these are the
// stable values from <linux/if_tun.h> / <linux/sockios.h>.
const TUNSETIFF: u64 = 0x4004_54ca;
const TUNSETOWNER: u64 = 0x4004_54cc;
const TUNSETGROUP: u64 = 0x4004_54ce;
const SIOCGIFFLAGS: u64 = 0x8913;
const SIOCSIFFLAGS: u64 = 0x8914;
const SIOCSIFADDR: u64 = 0x8916;
const SIOCSIFNETMASK: u64 = 0x891b;
const SIOCSIFBRDADDR: u64 = 0x8919;

const IFF_TUN: c_short = 0x0001;
const IFF_TAP: c_short = 0x0002;
const IFF_NO_PI: c_short = 0x1000;
const IFF_UP: c_short = 0x1;
const IFF_RUNNING: c_short = 0x40;
const IFF_BROADCAST: c_short = 0x2;

/// Mirrors `struct ifreq`'s layout: a 16-byte interface name followed by a union big enough
/// for a flags word, an ifindex, or a `sockaddr`. Shared with [`super::bridge`], which issues
/// ifreq-based ioctls (`SIOCBRADDBR` et al.) against the same layout.
#[repr(C)]
pub(crate) struct IfReq {
    name: [u8; IFNAMSIZ],
    pub(crate) union: IfReqUnion,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) union IfReqUnion {
    pub(crate) flags: c_short,
    pub(crate) ifindex: i32,
    pub(crate) addr: libc::sockaddr,
}

impl IfReq {
    pub(crate) fn named(name: &str) -> Self {
        let mut buf = [0u8; IFNAMSIZ];
        let bytes = name.as_bytes();
        let n = bytes.len().min(IFNAMSIZ - 1);
        buf[..n].copy_from_slice(&bytes[..n]);
        IfReq { name: buf, union: IfReqUnion { ifindex: 0 } }
    }

    fn name_str(&self) -> String {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(IFNAMSIZ);
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }
}

pub(crate) fn ioctl_req(fd: RawFd, request: u64, ifr: &mut IfReq) -> nix::Result<()> {
    let ret = unsafe { libc::ioctl(fd, request as _, ifr as *mut IfReq) };
    if ret < 0 {
        Err(nix::Error::last())
    } else {
        Ok(())
    }
}

fn sockaddr_in(addr: std::net::Ipv4Addr) -> libc::sockaddr {
    let sin = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: 0,
        sin_addr: libc::in_addr { s_addr: u32::from_ne_bytes(addr.octets()) },
        sin_zero: [0; 8],
    };
    unsafe { std::mem::transmute(sin) }
}

fn control_socket() -> Result<OwnedFd, ProvisioningError> {
    nix::sys::socket::socket(
        nix::sys::socket::AddressFamily::Inet,
        nix::sys::socket::SockType::Datagram,
        nix::sys::socket::SockFlag::empty(),
        None,
    )
    .map_err(ProvisioningError::Socket)
}

/// Adds (and clears) `IFF_UP | IFF_RUNNING` as needed, matching `change_ifflags`: only issues
/// `SIOCSIFFLAGS` when the resulting flags actually differ.
fn change_ifflags(sock: RawFd, ifname: &str, clear: c_short, set: c_short) -> nix::Result<()> {
    let mut ifr = IfReq::named(ifname);
    ioctl_req(sock, SIOCGIFFLAGS, &mut ifr)?;
    let current = unsafe { ifr.union.flags };
    let updated = (current & !clear) | set;
    if updated != current {
        ifr.union.flags = updated;
        ioctl_req(sock, SIOCSIFFLAGS, &mut ifr)?;
    }
    Ok(())
}

/// The result of provisioning: a ready interface descriptor and the name the kernel assigned
/// (which may differ from a requested name of `""` or one ending in `%d`).
pub struct ProvisionedInterface {
    pub fd: OwnedFd,
    pub ifname: String,
}

/// Opens `/dev/net/tun`, creates the interface, brings it up, optionally joins a bridge, and
/// optionally assigns an address. Drops privileges after opening the control node, before
/// returning, mirroring `create_tunif`'s owner/group ordering.
pub fn provision(config: &SessionConfig, logger: &slog::Logger) -> Result<ProvisionedInterface, ProvisioningError> {
    let tun_fd = open("/dev/net/tun", OFlag::O_RDWR, Mode::empty()).map_err(ProvisioningError::OpenControlNode)?;

    let ruid = Uid::current();
    let euid = Uid::effective();
    let rgid = Gid::current();
    let egid = Gid::effective();

    if ruid != euid {
        unsafe { libc::ioctl(tun_fd.as_raw_fd(), TUNSETOWNER as _, ruid.as_raw() as libc::c_ulong) };
    }
    if rgid != egid {
        unsafe { libc::ioctl(tun_fd.as_raw_fd(), TUNSETGROUP as _, rgid.as_raw() as libc::c_ulong) };
        nix::unistd::setgid(rgid).map_err(ProvisioningError::PrivilegeDrop)?;
    }

    let mut ifr = IfReq::named(config.ifname.as_deref().unwrap_or(""));
    let mut flags = match config.tunnel_mode {
        TunnelMode::L3 => IFF_TUN,
        TunnelMode::L2 => IFF_TAP,
    };
    flags |= IFF_NO_PI;
    ifr.union.flags = flags;
    ioctl_req(tun_fd.as_raw_fd(), TUNSETIFF, &mut ifr).map_err(|e| ProvisioningError::CreateInterface {
        ifname: config.ifname.clone().unwrap_or_default(),
        source: e,
    })?;
    let ifname = ifr.name_str();

    if ruid != euid {
        nix::unistd::setuid(ruid).map_err(ProvisioningError::PrivilegeDrop)?;
    }

    let sock = control_socket()?;
    change_ifflags(sock.as_raw_fd(), &ifname, 0, IFF_UP | IFF_RUNNING)
        .map_err(|e| ProvisioningError::InterfaceUp { ifname: ifname.clone(), source: e })?;

    if let Some(bridge) = &config.bridge_name {
        join_bridge(sock.as_raw_fd(), bridge, &ifname, &config.bridge_members, logger)?;
    }

    if let Some(addr) = &config.ifaddress {
        assign_address(sock.as_raw_fd(), &ifname, addr)?;
    }

    Ok(ProvisionedInterface { fd: tun_fd, ifname })
}

fn join_bridge(
    sock: RawFd,
    bridge: &str,
    ifname: &str,
    members: &[String],
    logger: &slog::Logger,
) -> Result<(), ProvisioningError> {
    let pre_existing = super::bridge::bridge_exists(sock, bridge);
    if !pre_existing {
        super::bridge::create_bridge(sock, bridge)
            .map_err(|e| ProvisioningError::CreateBridge { bridge: bridge.to_string(), source: e })?;
        super::bridge::register_for_cleanup(bridge);
    }

    change_ifflags(sock, bridge, 0, IFF_UP).map_err(|e| ProvisioningError::InterfaceUp {
        ifname: bridge.to_string(),
        source: e,
    })?;

    super::bridge::add_member(sock, bridge, ifname)
        .map_err(|e| ProvisioningError::AttachBridgeMember { bridge: bridge.to_string(), member: ifname.to_string(), source: e })?;

    for member in members {
        if let Err(e) = super::bridge::add_member(sock, bridge, member) {
            slog::warn!(logger, "cannot append member to bridge, continuing";
                "bridge" => bridge, "member" => member.as_str(), "error" => %e);
        }
    }

    Ok(())
}

fn assign_address(sock: RawFd, ifname: &str, addr: &IfAddress) -> Result<(), ProvisioningError> {
    match addr.addr {
        std::net::IpAddr::V4(v4) => assign_ipv4(sock, ifname, v4, addr.prefix_len),
        std::net::IpAddr::V6(v6) => assign_ipv6(ifname, v6, addr.prefix_len),
    }
}

fn assign_ipv4(sock: RawFd, ifname: &str, addr: std::net::Ipv4Addr, prefix_len: u8) -> Result<(), ProvisioningError> {
    let mask = if prefix_len == 0 { 0u32 } else { u32::MAX << (32 - prefix_len) };

    if prefix_len < 31 {
        let host_bits = u32::from(addr) & !mask;
        if host_bits == 0 || host_bits == !mask {
            return Err(ProvisioningError::ReservedHostAddress { ifname: ifname.to_string(), addr: addr.to_string() });
        }
    }

    let mut ifr = IfReq::named(ifname);
    ifr.union.addr = sockaddr_in(addr);
    ioctl_req(sock, SIOCSIFADDR, &mut ifr)
        .map_err(|e| ProvisioningError::AssignAddress { ifname: ifname.to_string(), source: e })?;

    let netmask = std::net::Ipv4Addr::from(mask.to_be_bytes());
    let mut ifr = IfReq::named(ifname);
    ifr.union.addr = sockaddr_in(netmask);
    ioctl_req(sock, SIOCSIFNETMASK, &mut ifr)
        .map_err(|e| ProvisioningError::AssignAddress { ifname: ifname.to_string(), source: e })?;

    if prefix_len < 31 {
        let broadcast_bits = u32::from(addr) | !mask;
        let broadcast = std::net::Ipv4Addr::from(broadcast_bits);
        let mut ifr = IfReq::named(ifname);
        ifr.union.addr = sockaddr_in(broadcast);
        ioctl_req(sock, SIOCSIFBRDADDR, &mut ifr)
            .map_err(|e| ProvisioningError::AssignAddress { ifname: ifname.to_string(), source: e })?;
        change_ifflags(sock, ifname, 0, IFF_BROADCAST)
            .map_err(|e| ProvisioningError::AssignAddress { ifname: ifname.to_string(), source: e })?;
    }

    Ok(())
}

/// `SIOCSIFADDR` against an `AF_INET6` socket takes `struct in6_ifreq`, keyed by ifindex rather
/// than by name, and carries the prefix length directly; there is no netmask or broadcast ioctl
/// for an IPv6 address (SPEC_FULL.md §4.5: "program address and prefix; never broadcast").
#[repr(C)]
struct In6IfReq {
    addr: libc::in6_addr,
    prefix_len: u32,
    ifindex: libc::c_int,
}

fn assign_ipv6(ifname: &str, addr: std::net::Ipv6Addr, prefix_len: u8) -> Result<(), ProvisioningError> {
    let sock6 = nix::sys::socket::socket(
        nix::sys::socket::AddressFamily::Inet6,
        nix::sys::socket::SockType::Datagram,
        nix::sys::socket::SockFlag::empty(),
        None,
    )
    .map_err(ProvisioningError::Socket)?;

    let ifindex = super::bridge::if_index(sock6.as_raw_fd(), ifname)
        .ok_or_else(|| ProvisioningError::AssignAddress { ifname: ifname.to_string(), source: nix::Error::ENODEV })?;

    let mut req = In6IfReq { addr: libc::in6_addr { s6_addr: addr.octets() }, prefix_len: prefix_len as u32, ifindex };
    let ret = unsafe { libc::ioctl(sock6.as_raw_fd(), SIOCSIFADDR as _, &mut req as *mut In6IfReq) };
    if ret < 0 {
        return Err(ProvisioningError::AssignAddress { ifname: ifname.to_string(), source: nix::Error::last() });
    }
    Ok(())
}
