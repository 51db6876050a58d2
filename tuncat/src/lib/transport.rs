//! Transport setup: stdio, a TCP client connection, or a forking TCP server
//! (SPEC_FULL.md §4.6). Grounded on `main()`'s `getaddrinfo`/`bind`/`listen`/
//! `accept`/`fork` sequence in the original `tuncat.c`.

use std::os::fd::{AsRawFd, RawFd};

use nix::sys::socket::{
    accept, bind, connect, listen, setsockopt, socket, sockopt, AddressFamily, Backlog, SockFlag, SockType, SockaddrIn,
    SockaddrIn6, SockaddrStorage,
};
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::{close, fork, ForkResult};
use slog::Logger;

use common::io::{set_nonblocking, IOTriple};

use crate::config::{IpFamily, SessionConfig};
use crate::error::ProvisioningError;

/// One half, or both halves, of the byte stream the engine forwards against.
pub struct TransportEndpoint {
    pub in_fd: RawFd,
    pub out_fd: RawFd,
}

/// Standard input/output, each set non-blocking. The caller retains ownership of the fds.
pub fn stdio(io: &IOTriple) -> Result<TransportEndpoint, ProvisioningError> {
    set_nonblocking(io.stdin).map_err(ProvisioningError::Socket)?;
    set_nonblocking(io.stdout).map_err(ProvisioningError::Socket)?;
    Ok(TransportEndpoint { in_fd: io.stdin, out_fd: io.stdout })
}

fn resolve_v4(address: &str, port: u16) -> Result<SockaddrIn, ProvisioningError> {
    use std::net::ToSocketAddrs;
    let sock_addr = (address, port)
        .to_socket_addrs()
        .map_err(|e| ProvisioningError::AddressParse(address.to_string(), e.to_string()))?
        .find(|a| a.is_ipv4())
        .ok_or_else(|| ProvisioningError::AddressParse(address.to_string(), "no ipv4 address found".into()))?;
    Ok(SockaddrIn::from(match sock_addr {
        std::net::SocketAddr::V4(v4) => v4,
        _ => unreachable!(),
    }))
}

fn resolve_v6(address: &str, port: u16) -> Result<SockaddrIn6, ProvisioningError> {
    use std::net::ToSocketAddrs;
    let sock_addr = (address, port)
        .to_socket_addrs()
        .map_err(|e| ProvisioningError::AddressParse(address.to_string(), e.to_string()))?
        .find(|a| a.is_ipv6())
        .ok_or_else(|| ProvisioningError::AddressParse(address.to_string(), "no ipv6 address found".into()))?;
    Ok(SockaddrIn6::from(match sock_addr {
        std::net::SocketAddr::V6(v6) => v6,
        _ => unreachable!(),
    }))
}

fn family_for(config: &SessionConfig, address: &str, port: u16) -> Result<(AddressFamily, SockaddrStorage), ProvisioningError> {
    match config.ip_family {
        IpFamily::V4 => Ok((AddressFamily::Inet, SockaddrStorage::from(resolve_v4(address, port)?))),
        IpFamily::V6 => Ok((AddressFamily::Inet6, SockaddrStorage::from(resolve_v6(address, port)?))),
        IpFamily::Any => resolve_v4(address, port)
            .map(|a| (AddressFamily::Inet, SockaddrStorage::from(a)))
            .or_else(|_| resolve_v6(address, port).map(|a| (AddressFamily::Inet6, SockaddrStorage::from(a)))),
    }
}

/// Connects to `config.address:config.port`, returning the connected socket for both halves.
pub fn connect_client(config: &SessionConfig) -> Result<TransportEndpoint, ProvisioningError> {
    let address = config.address.as_deref().expect("client mode requires an address (checked in SessionConfig::validate)");
    let (family, addr) = family_for(config, address, config.port)?;
    let sock = socket(family, SockType::Stream, SockFlag::empty(), None).map_err(ProvisioningError::Socket)?;
    connect(sock.as_raw_fd(), &addr).map_err(ProvisioningError::Socket)?;
    set_nonblocking(sock.as_raw_fd()).map_err(ProvisioningError::Socket)?;
    let fd = sock.as_raw_fd();
    std::mem::forget(sock);
    Ok(TransportEndpoint { in_fd: fd, out_fd: fd })
}

/// Binds and listens on `config.address:config.port` (any address if unset), then repeatedly
/// accepts and forks: the child runs `on_connection` against the accepted socket and exits; the
/// parent keeps accepting, reaping finished children non-blockingly between accepts.
pub fn serve(config: &SessionConfig, logger: &Logger, mut on_connection: impl FnMut(TransportEndpoint)) -> Result<(), ProvisioningError> {
    let address = config.address.as_deref().unwrap_or("0.0.0.0");
    let (family, addr) = family_for(config, address, config.port)?;
    let listener = socket(family, SockType::Stream, SockFlag::empty(), None).map_err(ProvisioningError::Socket)?;
    setsockopt(&listener, sockopt::ReuseAddr, &true).map_err(ProvisioningError::Socket)?;
    bind(listener.as_raw_fd(), &addr).map_err(ProvisioningError::Socket)?;
    listen(&listener, Backlog::new(5).expect("5 is a valid backlog")).map_err(ProvisioningError::Socket)?;

    loop {
        let _ = waitpid(None, Some(WaitPidFlag::WNOHANG));

        // accept(2) yields a RawFd here (nix 0.27 only migrated socket()/socketpair() to
        // OwnedFd), the same convention common::io::pipe() relies on for its ends.
        let accepted: RawFd = match accept(listener.as_raw_fd()) {
            Ok(fd) => fd,
            Err(nix::Error::EINTR) => continue,
            Err(e) => return Err(ProvisioningError::Socket(e)),
        };

        match unsafe { fork() } {
            Ok(ForkResult::Parent { .. }) => {
                let _ = close(accepted);
            }
            Ok(ForkResult::Child) => {
                drop(listener);
                let _ = set_nonblocking(accepted);
                on_connection(TransportEndpoint { in_fd: accepted, out_fd: accepted });
                std::process::exit(0);
            }
            Err(e) => {
                slog::error!(logger, "fork failed, dropping connection"; "error" => %e);
                let _ = close(accepted);
            }
        }
    }
}
