//! Bridge creation, membership, and cleanup-on-exit/signal. Grounded on
//! `create_bridge`/`add_bridge_member`/`cleanbr_sig` in the original
//! `tuncat_if.c`, but replacing its malloc'd `brcache` linked list with a
//! preallocated, non-allocating registry so the signal-path is
//! async-signal-safe (SPEC_FULL.md §9 Design Notes).

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Once;

use nix::libc;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal, SigmaskHow};

use crate::iface::{ioctl_req, IfReq};

const IFNAMSIZ: usize = 16;
const SIOCGIFINDEX: u64 = 0x8933;
const SIOCBRADDBR: u64 = 0x89a0;
const SIOCBRDELBR: u64 = 0x89a1;
const SIOCBRADDIF: u64 = 0x89a2;
const SIOCGIFFLAGS: u64 = 0x8913;
const SIOCSIFFLAGS: u64 = 0x8914;
const IFF_UP: libc::c_short = 0x1;

/// Interface index of `ifname`, or `None` if it does not exist.
pub(crate) fn if_index(sock: RawFd, ifname: &str) -> Option<i32> {
    let mut ifr = IfReq::named(ifname);
    ioctl_req(sock, SIOCGIFINDEX, &mut ifr).ok()?;
    let idx = unsafe { ifr.union.ifindex };
    (idx != 0).then_some(idx)
}

pub fn bridge_exists(sock: RawFd, brname: &str) -> bool {
    if_index(sock, brname).is_some()
}

pub fn create_bridge(sock: RawFd, brname: &str) -> nix::Result<()> {
    let mut ifr = IfReq::named(brname);
    ioctl_req(sock, SIOCBRADDBR, &mut ifr)
}

pub fn delete_bridge(sock: RawFd, brname: &str) -> nix::Result<()> {
    let mut ifr = IfReq::named(brname);
    ioctl_req(sock, SIOCBRDELBR, &mut ifr)
}

pub fn add_member(sock: RawFd, brname: &str, ifname: &str) -> nix::Result<()> {
    let ifindex = if_index(sock, ifname).ok_or(nix::Error::ENODEV)?;
    let mut ifr = IfReq::named(brname);
    ifr.union.ifindex = ifindex;
    ioctl_req(sock, SIOCBRADDIF, &mut ifr)
}

// --- Cleanup registry -------------------------------------------------------
//
// At most MAX_BRIDGES names, stored as fixed-size byte buffers in a static array, so that the
// SIGINT/SIGTERM handler never allocates. Registration blocks the two signals while the slot is
// written so the handler can never observe a half-written entry.

const MAX_BRIDGES: usize = 8;

static BRIDGE_COUNT: AtomicUsize = AtomicUsize::new(0);
static mut BRIDGE_NAMES: [[u8; IFNAMSIZ]; MAX_BRIDGES] = [[0u8; IFNAMSIZ]; MAX_BRIDGES];

fn cleanup_signal_set() -> SigSet {
    let mut set = SigSet::empty();
    set.add(Signal::SIGINT);
    set.add(Signal::SIGTERM);
    set
}

/// Registers `name` (truncated to `IFNAMSIZ - 1` bytes) for teardown. Only bridges this process
/// created should be registered; pre-existing bridges are never enrolled (SPEC_FULL.md §4.5).
pub fn register_for_cleanup(name: &str) {
    let set = cleanup_signal_set();
    let _ = signal::pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&set), None);

    let idx = BRIDGE_COUNT.load(Ordering::SeqCst);
    if idx < MAX_BRIDGES {
        let mut buf = [0u8; IFNAMSIZ];
        let bytes = name.as_bytes();
        let n = bytes.len().min(IFNAMSIZ - 1);
        buf[..n].copy_from_slice(&bytes[..n]);
        unsafe {
            BRIDGE_NAMES[idx] = buf;
        }
        BRIDGE_COUNT.store(idx + 1, Ordering::SeqCst);
    }

    let _ = signal::pthread_sigmask(SigmaskHow::SIG_UNBLOCK, Some(&set), None);

    install_signal_handler();
}

fn install_signal_handler() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| unsafe {
        let action = SigAction::new(SigHandler::Handler(handle_cleanup_signal), SaFlags::empty(), SigSet::empty());
        let _ = signal::sigaction(Signal::SIGINT, &action);
        let _ = signal::sigaction(Signal::SIGTERM, &action);
    });
}

extern "C" fn handle_cleanup_signal(sig: libc::c_int) {
    cleanup_registered_bridges();
    unsafe { libc::_exit(128 + sig) };
}

/// Brings down and deletes every bridge still registered, newest first. Safe to call from the
/// signal handler or from a normal exit path (idempotent: a second call is a no-op).
pub fn cleanup_registered_bridges() {
    loop {
        let idx = BRIDGE_COUNT.load(Ordering::SeqCst);
        if idx == 0 {
            return;
        }
        let name = unsafe { BRIDGE_NAMES[idx - 1] };
        BRIDGE_COUNT.store(idx - 1, Ordering::SeqCst);
        let end = name.iter().position(|&b| b == 0).unwrap_or(IFNAMSIZ);
        teardown_bridge_raw(&name[..end]);
    }
}

/// Brings a bridge down and deletes it using only syscalls safe to issue from a signal handler:
/// no allocation, no buffered I/O.
fn teardown_bridge_raw(name: &[u8]) {
    let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if sock < 0 {
        return;
    }

    let mut ifr = IfReq::named(std::str::from_utf8(name).unwrap_or(""));
    let _ = ioctl_req(sock, SIOCGIFFLAGS, &mut ifr);
    let current = unsafe { ifr.union.flags };
    if current & IFF_UP != 0 {
        ifr.union.flags = current & !IFF_UP;
        let _ = ioctl_req(sock, SIOCSIFFLAGS, &mut ifr);
    }
    let mut del_ifr = IfReq::named(std::str::from_utf8(name).unwrap_or(""));
    let _ = ioctl_req(sock, SIOCBRDELBR, &mut del_ifr);

    unsafe {
        libc::close(sock);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn registry_starts_empty() {
        assert_eq!(BRIDGE_COUNT.load(Ordering::SeqCst), 0);
    }
}
