use anyhow::Context;
use clap::Parser;
use ipnet::Ipv4Net;
use serde::Deserialize;
use std::net::Ipv4Addr;

/// Process-wide configuration, immutable after startup.
///
/// Parsed from command-line flags, or loaded from a TOML file when
/// `--config` is given. Every component receives the parts it needs by
/// value; nothing reads configuration through a global.
#[derive(Debug, Clone, Parser, Deserialize)]
#[command(name = "overtun", version, about = "Layer-3 overlay VPN over framed, encrypted TCP streams")]
#[serde(default)]
pub struct Config {
    /// Pre-shared secret; an empty string disables record encryption
    #[arg(long, default_value = "hello-world")]
    pub key: String,

    /// Bind address for the server listener (server mode)
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub listen: String,

    /// Server address the client dials (client mode)
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub remote_addrs: String,

    /// Local TUN address in CIDR form, e.g. 10.237.0.1/16
    #[arg(long, default_value = "10.237.0.1/16")]
    pub ip: String,

    /// TUN MTU in bytes
    #[arg(long, default_value_t = 1500)]
    pub mtu: u16,

    /// Number of parallel transport streams the client opens
    #[arg(long, default_value_t = 1)]
    pub transport_threads: usize,

    /// Run as the server (accept connections and route between clients)
    #[arg(long)]
    pub server_mode: bool,

    /// Disable Nagle's algorithm on transport sockets
    #[arg(long)]
    pub nodelay: bool,

    /// Optional TOML config file; replaces the other command-line flags
    #[arg(long)]
    #[serde(skip)]
    pub config: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            key: "hello-world".to_string(),
            listen: "0.0.0.0:8080".to_string(),
            remote_addrs: "0.0.0.0:8080".to_string(),
            ip: "10.237.0.1/16".to_string(),
            mtu: 1500,
            transport_threads: 1,
            server_mode: false,
            nodelay: false,
            config: None,
        }
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Config> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config file {}", path))?;
        let cfg = toml::from_str(&raw)
            .with_context(|| format!("parse config file {}", path))?;
        Ok(cfg)
    }

    /// The local TUN network, address and prefix together.
    pub fn subnet(&self) -> crate::Result<Ipv4Net> {
        let net = self
            .ip
            .parse::<Ipv4Net>()
            .map_err(|e| format!("invalid tun cidr {}: {}", self.ip, e))?;
        Ok(net)
    }

    /// The local virtual IP, without the mask.
    pub fn vip(&self) -> crate::Result<Ipv4Addr> {
        Ok(self.subnet()?.addr())
    }
}
