use thiserror::Error;

/// Failures found while validating a parsed command line into a [`crate::config::SessionConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("duplicate option: {0}")]
    Duplicate(&'static str),
    #[error("{name} is out of range [{min}, {max}]: {value}")]
    OutOfRange { name: &'static str, value: u64, min: u64, max: u64 },
    #[error("-b/--bridge-name is only valid in l2 tunnel mode")]
    BridgeRequiresL2,
    #[error("-i/--bridge-members requires -b/--bridge-name")]
    BridgeMembersRequireBridge,
    #[error("client transfer mode requires -l/--address")]
    ClientRequiresAddress,
    #[error("stdio transfer mode forbids -l/--address and -p/--port")]
    StdioForbidsAddressPort,
}

/// Failures while provisioning the interface, bridge, or address (see interface provisioning
/// in SPEC_FULL.md §4.5). Fatal at startup; no session is created.
#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error("opening /dev/net/tun failed: {0}")]
    OpenControlNode(#[source] nix::Error),
    #[error("creating interface {ifname} failed: {source}")]
    CreateInterface { ifname: String, #[source] source: nix::Error },
    #[error("bringing up interface {ifname} failed: {source}")]
    InterfaceUp { ifname: String, #[source] source: nix::Error },
    #[error("creating bridge {bridge} failed: {source}")]
    CreateBridge { bridge: String, #[source] source: nix::Error },
    #[error("attaching {member} to bridge {bridge} failed: {source}")]
    AttachBridgeMember { bridge: String, member: String, #[source] source: nix::Error },
    #[error("assigning address to {ifname} failed: {source}")]
    AssignAddress { ifname: String, #[source] source: nix::Error },
    #[error("dropping privileges failed: {0}")]
    PrivilegeDrop(#[source] nix::Error),
    #[error("resolving address {0} failed: {1}")]
    AddressParse(String, String),
    #[error("{addr} is the network or broadcast address of its prefix, refusing to assign it to {ifname}")]
    ReservedHostAddress { ifname: String, addr: String },
    #[error("socket setup failed: {0}")]
    Socket(#[source] nix::Error),
}

/// Non-recoverable engine failures (see SPEC_FULL.md §7). Transient I/O (EAGAIN/EINTR/...) and
/// clean end-of-stream are handled inline by the event loop and never reach this type.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("fatal I/O error: {0}")]
    Fatal(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(&'static str),
}
