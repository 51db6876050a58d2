use std::io::stderr;

use anyhow::{bail, Context, Result};
use clap::Parser;
use common::io::IOTriple;
use common::obs::assemble_logger;
use slog::{error, info, o};

use tuncat::config::{IfAddress, SessionConfig, TransferMode, TunnelMode};
use tuncat::engine::{EngineConfig, ForwardingEngine};
use tuncat::params::TunnelModeWire;
use tuncat::transport::TransportEndpoint;
use tuncat::{bridge, iface, transport};

#[derive(Parser)]
#[command(about = "bridge a tun/tap interface to a byte-stream transport")]
struct Cli {
    /// Interface name
    #[arg(short = 'n', long, action = clap::ArgAction::Append)]
    ifname: Vec<String>,

    /// Interface address, as addr or addr/prefixlen
    #[arg(short = 'a', long, action = clap::ArgAction::Append)]
    ifaddress: Vec<String>,

    /// Tunnel interface mode
    #[arg(short = 'm', long, value_enum, action = clap::ArgAction::Append)]
    tunnel_mode: Vec<TunnelModeArg>,

    /// Bridge interface (l2 tunnel mode only)
    #[arg(short = 'b', long, action = clap::ArgAction::Append)]
    bridge_name: Vec<String>,

    /// Comma-separated bridge members (requires --bridge-name)
    #[arg(short = 'i', long, action = clap::ArgAction::Append)]
    bridge_members: Vec<String>,

    /// Transfer mode
    #[arg(short = 't', long, value_enum, action = clap::ArgAction::Append)]
    transfer_mode: Vec<TransferModeArg>,

    /// Listen/connect address
    #[arg(short = 'l', long, action = clap::ArgAction::Append)]
    address: Vec<String>,

    /// Listen/connect port
    #[arg(short = 'p', long, action = clap::ArgAction::Append)]
    port: Vec<u16>,

    /// Force ipv4
    #[arg(short = '4', action = clap::ArgAction::Count)]
    ipv4: u8,

    /// Force ipv6
    #[arg(short = '6', action = clap::ArgAction::Count)]
    ipv6: u8,

    /// Compress payload with snappy
    #[arg(short = 'c', long, action = clap::ArgAction::Count)]
    compress: u8,

    /// Maximum frame size
    #[arg(short = 'F', long = "max-frame-size", action = clap::ArgAction::Append)]
    max_frame_size: Vec<u16>,

    /// Interface-side buffer capacity, in bytes
    #[arg(short = 'I', long = "ifbuffer-size", action = clap::ArgAction::Append)]
    if_buffer_size: Vec<usize>,

    /// Transport-side buffer capacity, in bytes
    #[arg(short = 'T', long = "trbuffer-size", action = clap::ArgAction::Append)]
    tr_buffer_size: Vec<usize>,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum TunnelModeArg {
    L3,
    L2,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum TransferModeArg {
    Stdio,
    Server,
    Client,
}

fn one<T: Clone>(name: &'static str, mut values: Vec<T>) -> Result<Option<T>> {
    match values.len() {
        0 => Ok(None),
        1 => Ok(Some(values.remove(0))),
        _ => bail!(tuncat::error::ConfigError::Duplicate(name)),
    }
}

fn build_config(cli: Cli) -> Result<SessionConfig> {
    let mut config = SessionConfig::default();

    config.ifname = one("ifname", cli.ifname)?;
    if let Some(addr) = one("ifaddress", cli.ifaddress)? {
        config.ifaddress = Some(IfAddress::parse(&addr)?);
    }
    config.tunnel_mode = match one("tunnel-mode", cli.tunnel_mode)? {
        Some(TunnelModeArg::L3) | None => TunnelMode::L3,
        Some(TunnelModeArg::L2) => TunnelMode::L2,
    };
    config.bridge_name = one("bridge-name", cli.bridge_name)?;
    if let Some(members) = one("bridge-members", cli.bridge_members)? {
        config.bridge_members = members.split(',').map(str::to_string).collect();
    }
    config.transfer_mode = match one("transfer-mode", cli.transfer_mode)? {
        Some(TransferModeArg::Stdio) | None => TransferMode::Stdio,
        Some(TransferModeArg::Server) => TransferMode::Server,
        Some(TransferModeArg::Client) => TransferMode::Client,
    };
    config.address = one("address", cli.address)?;
    if let Some(port) = one("port", cli.port)? {
        config.port = port;
    }
    if cli.ipv4 + cli.ipv6 > 1 {
        bail!(tuncat::error::ConfigError::Duplicate("ipv4/ipv6"));
    }
    config.ip_family = if cli.ipv4 == 1 {
        tuncat::config::IpFamily::V4
    } else if cli.ipv6 == 1 {
        tuncat::config::IpFamily::V6
    } else {
        tuncat::config::IpFamily::Any
    };
    if cli.compress > 1 {
        bail!(tuncat::error::ConfigError::Duplicate("compress"));
    }
    config.compress = cli.compress == 1;
    if let Some(size) = one("max-frame-size", cli.max_frame_size)? {
        config.max_frame_size = size;
        config.if_buffer_size = 2 * size as usize;
        config.tr_buffer_size = 2 * size as usize;
    }
    if let Some(size) = one("ifbuffer-size", cli.if_buffer_size)? {
        config.if_buffer_size = size;
    }
    if let Some(size) = one("trbuffer-size", cli.tr_buffer_size)? {
        config.tr_buffer_size = size;
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn run_session(
    if_fd: std::os::fd::RawFd,
    endpoint: TransportEndpoint,
    config: &SessionConfig,
    logger: slog::Logger,
) -> Result<()> {
    let tunnel_mode_wire = match config.tunnel_mode {
        TunnelMode::L3 => TunnelModeWire::L3,
        TunnelMode::L2 => TunnelModeWire::L2,
    };
    let mut engine = ForwardingEngine::new(
        if_fd,
        endpoint.in_fd,
        endpoint.out_fd,
        EngineConfig {
            compress: config.compress,
            max_frame_size: config.max_frame_size,
            tunnel_mode_wire,
            if_buffer_size: config.if_buffer_size,
            tr_buffer_size: config.tr_buffer_size,
        },
        logger.clone(),
    );
    engine.run().map_err(anyhow::Error::from)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let logger = assemble_logger(stderr());
    let config = build_config(cli)?;

    let result = (|| -> Result<()> {
        match config.transfer_mode {
            TransferMode::Stdio => {
                let io = IOTriple::default();
                let provisioned = iface::provision(&config, &logger).context("provisioning the interface failed")?;
                let endpoint = transport::stdio(&io)?;
                let session_logger = logger.new(o!("ifname" => provisioned.ifname.clone(), "transfer_mode" => "stdio"));
                info!(session_logger, "session starting");
                run_session(std::os::fd::AsRawFd::as_raw_fd(&provisioned.fd), endpoint, &config, session_logger)
            }
            TransferMode::Client => {
                let provisioned = iface::provision(&config, &logger).context("provisioning the interface failed")?;
                let endpoint = transport::connect_client(&config)?;
                let session_logger = logger.new(o!("ifname" => provisioned.ifname.clone(), "transfer_mode" => "client"));
                info!(session_logger, "session starting");
                run_session(std::os::fd::AsRawFd::as_raw_fd(&provisioned.fd), endpoint, &config, session_logger)
            }
            TransferMode::Server => {
                let logger = logger.clone();
                transport::serve(&config, &logger, |endpoint| {
                    let result = (|| -> Result<()> {
                        let provisioned = iface::provision(&config, &logger).context("provisioning the interface failed")?;
                        let session_logger =
                            logger.new(o!("ifname" => provisioned.ifname.clone(), "transfer_mode" => "server"));
                        info!(session_logger, "session starting");
                        run_session(std::os::fd::AsRawFd::as_raw_fd(&provisioned.fd), endpoint, &config, session_logger)
                    })();
                    if let Err(e) = result {
                        error!(logger, "session failed"; "error" => %e);
                    }
                })?;
                Ok(())
            }
        }
    })();

    bridge::cleanup_registered_bridges();

    if let Err(e) = &result {
        error!(logger, "fatal error"; "error" => %e);
    }
    result
}
