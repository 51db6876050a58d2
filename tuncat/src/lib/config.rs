//! The immutable session configuration (SPEC_FULL.md §3), and the bounds/rule
//! checks the CLI layer (`tuncat` binary) runs once after parsing.

use crate::error::ConfigError;

pub const MIN_MAX_FRAME_SIZE: u16 = 128;
pub const MAX_MAX_FRAME_SIZE: u16 = 65535;
pub const MIN_BUFFER_SIZE: usize = 128;
pub const MAX_BUFFER_SIZE: usize = 16_777_216;
pub const DEFAULT_PORT: u16 = 19876;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelMode {
    L3,
    L2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFamily {
    Any,
    V4,
    V6,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferMode {
    Stdio,
    Server,
    Client,
}

/// An interface address in `addr/bits` or bare `addr` form (§4.5: bare means host, /32 or /128).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfAddress {
    pub addr: std::net::IpAddr,
    pub prefix_len: u8,
}

impl IfAddress {
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let (addr_part, prefix_part) = match s.split_once('/') {
            Some((a, p)) => (a, Some(p)),
            None => (s, None),
        };
        let addr: std::net::IpAddr = addr_part
            .parse()
            .map_err(|_| ConfigError::OutOfRange { name: "ifaddress", value: 0, min: 0, max: 0 })?;
        let max_bits = if addr.is_ipv4() { 32 } else { 128 };
        let prefix_len = match prefix_part {
            Some(p) => p
                .parse::<u8>()
                .map_err(|_| ConfigError::OutOfRange { name: "ifaddress/bits", value: 0, min: 0, max: max_bits as u64 })?,
            None => max_bits,
        };
        if prefix_len > max_bits {
            return Err(ConfigError::OutOfRange {
                name: "ifaddress/bits",
                value: prefix_len as u64,
                min: 0,
                max: max_bits as u64,
            });
        }
        Ok(IfAddress { addr, prefix_len })
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub ifname: Option<String>,
    pub ifaddress: Option<IfAddress>,
    pub tunnel_mode: TunnelMode,
    pub bridge_name: Option<String>,
    pub bridge_members: Vec<String>,
    pub transfer_mode: TransferMode,
    pub address: Option<String>,
    pub port: u16,
    pub ip_family: IpFamily,
    pub compress: bool,
    pub max_frame_size: u16,
    pub if_buffer_size: usize,
    pub tr_buffer_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            ifname: None,
            ifaddress: None,
            tunnel_mode: TunnelMode::L3,
            bridge_name: None,
            bridge_members: Vec::new(),
            transfer_mode: TransferMode::Stdio,
            address: None,
            port: DEFAULT_PORT,
            ip_family: IpFamily::Any,
            compress: false,
            max_frame_size: MAX_MAX_FRAME_SIZE,
            if_buffer_size: 2 * MAX_MAX_FRAME_SIZE as usize,
            tr_buffer_size: 2 * MAX_MAX_FRAME_SIZE as usize,
        }
    }
}

impl SessionConfig {
    /// Applies the cross-field rules from SPEC_FULL.md §6 and the numeric bounds from §3/§4.3.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_MAX_FRAME_SIZE..=MAX_MAX_FRAME_SIZE).contains(&self.max_frame_size) {
            return Err(ConfigError::OutOfRange {
                name: "max-frame-size",
                value: self.max_frame_size as u64,
                min: MIN_MAX_FRAME_SIZE as u64,
                max: MAX_MAX_FRAME_SIZE as u64,
            });
        }
        for (name, size) in [("ifbuffer-size", self.if_buffer_size), ("trbuffer-size", self.tr_buffer_size)] {
            if !(MIN_BUFFER_SIZE..=MAX_BUFFER_SIZE).contains(&size) {
                return Err(ConfigError::OutOfRange {
                    name,
                    value: size as u64,
                    min: MIN_BUFFER_SIZE as u64,
                    max: MAX_BUFFER_SIZE as u64,
                });
            }
        }
        if self.bridge_name.is_some() && self.tunnel_mode != TunnelMode::L2 {
            return Err(ConfigError::BridgeRequiresL2);
        }
        if !self.bridge_members.is_empty() && self.bridge_name.is_none() {
            return Err(ConfigError::BridgeMembersRequireBridge);
        }
        match self.transfer_mode {
            TransferMode::Client if self.address.is_none() => return Err(ConfigError::ClientRequiresAddress),
            TransferMode::Stdio if self.address.is_some() || self.port != DEFAULT_PORT => {
                return Err(ConfigError::StdioForbidsAddressPort)
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rejects_bridge_name_outside_l2() {
        let cfg = SessionConfig { bridge_name: Some("br0".into()), tunnel_mode: TunnelMode::L3, ..SessionConfig::default() };
        assert!(matches!(cfg.validate(), Err(ConfigError::BridgeRequiresL2)));
    }

    #[test]
    fn rejects_bridge_members_without_bridge() {
        let cfg = SessionConfig { bridge_members: vec!["eth0".into()], ..SessionConfig::default() };
        assert!(matches!(cfg.validate(), Err(ConfigError::BridgeMembersRequireBridge)));
    }

    #[test]
    fn rejects_client_mode_without_address() {
        let cfg = SessionConfig { transfer_mode: TransferMode::Client, ..SessionConfig::default() };
        assert!(matches!(cfg.validate(), Err(ConfigError::ClientRequiresAddress)));
    }

    #[test]
    fn rejects_stdio_with_address() {
        let cfg = SessionConfig { address: Some("10.0.0.1".into()), ..SessionConfig::default() };
        assert!(matches!(cfg.validate(), Err(ConfigError::StdioForbidsAddressPort)));
    }

    #[test]
    fn rejects_out_of_range_frame_size() {
        let cfg = SessionConfig { max_frame_size: 10, ..SessionConfig::default() };
        assert!(matches!(cfg.validate(), Err(ConfigError::OutOfRange { name: "max-frame-size", .. })));
    }

    #[test]
    fn parses_bare_and_prefixed_addresses() {
        let a = IfAddress::parse("10.0.0.1/24").unwrap();
        assert_eq!(a.prefix_len, 24);
        let b = IfAddress::parse("10.0.0.1").unwrap();
        assert_eq!(b.prefix_len, 32);
    }

    #[test]
    fn default_config_is_valid() {
        assert!(SessionConfig::default().validate().is_ok());
    }
}
