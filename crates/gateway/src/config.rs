use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

use crate::protocol::DEFAULT_MAX_FRAME_LEN;

/// Top-level configuration for the gateway.
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Listening sockets and logging.
#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: IpAddr,
    /// Device registrations and client requests
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,
    /// Sensor telemetry
    #[serde(default = "default_udp_port")]
    pub udp_port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            tcp_port: default_tcp_port(),
            udp_port: default_udp_port(),
            log_level: default_log_level(),
        }
    }
}

/// Multicast discovery beacon.
#[derive(Debug, Deserialize, Clone)]
pub struct DiscoveryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_group")]
    pub group: Ipv4Addr,
    #[serde(default = "default_discovery_port")]
    pub port: u16,
    /// Multicast TTL; 2 crosses one router hop
    #[serde(default = "default_ttl")]
    pub ttl: u32,
    #[serde(default = "default_discovery_interval")]
    pub interval_secs: u64,
    /// Deliver beacons to listeners on this host as well
    #[serde(default = "default_true")]
    pub multicast_loop: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            group: default_group(),
            port: default_discovery_port(),
            ttl: default_ttl(),
            interval_secs: default_discovery_interval(),
            multicast_loop: true,
        }
    }
}

impl DiscoveryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Per-connection limits.
#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    /// Upper bound on concurrently running session tasks
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Time a new connection has to send its first frame
    #[serde(default = "default_registration_timeout")]
    pub registration_timeout_secs: u64,
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
    /// Commands buffered per device before the relay reports backlog
    #[serde(default = "default_command_queue_depth")]
    pub command_queue_depth: usize,
    /// Only accept client requests from loopback peers
    #[serde(default)]
    pub restrict_clients_to_loopback: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            registration_timeout_secs: default_registration_timeout(),
            max_frame_len: default_max_frame_len(),
            command_queue_depth: default_command_queue_depth(),
            restrict_clients_to_loopback: false,
        }
    }
}

impl SessionConfig {
    pub fn registration_timeout(&self) -> Duration {
        Duration::from_secs(self.registration_timeout_secs)
    }
}

/// Prometheus endpoint.
#[derive(Debug, Deserialize, Clone)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

fn default_bind_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}
fn default_tcp_port() -> u16 {
    10000
}
fn default_udp_port() -> u16 {
    10001
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_group() -> Ipv4Addr {
    Ipv4Addr::new(224, 1, 1, 1)
}
fn default_discovery_port() -> u16 {
    5007
}
fn default_ttl() -> u32 {
    2
}
fn default_discovery_interval() -> u64 {
    15
}
fn default_max_sessions() -> usize {
    256
}
fn default_registration_timeout() -> u64 {
    10
}
fn default_max_frame_len() -> usize {
    DEFAULT_MAX_FRAME_LEN
}
fn default_command_queue_depth() -> usize {
    32
}
fn default_metrics_port() -> u16 {
    9090
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .context(format!("Failed to read config file: {:?}", path.as_ref()))?;
        let config: Config = toml::from_str(&content).context("Failed to parse TOML config")?;
        Ok(config)
    }

    /// Load from default paths or return default config.
    pub fn load_or_default() -> Self {
        let paths = [
            "/etc/smartcity/gateway.toml",
            "~/.smartcity/gateway.toml",
            "./gateway.toml",
        ];

        for path in &paths {
            let expanded = shellexpand::tilde(path).to_string();
            if Path::new(&expanded).exists() {
                if let Ok(config) = Self::load(&expanded) {
                    return config;
                }
            }
        }

        Self::default()
    }

    /// Reject values that would stall or disable a core loop.
    pub fn validate(&self) -> Result<()> {
        if self.discovery.enabled && self.discovery.interval_secs == 0 {
            anyhow::bail!("discovery.interval_secs must be greater than 0");
        }
        if self.discovery.enabled && !self.discovery.group.is_multicast() {
            log::warn!(
                "discovery.group {} is not a multicast address; beacons will be unicast",
                self.discovery.group
            );
        }
        if self.session.max_sessions == 0 {
            anyhow::bail!("session.max_sessions must be greater than 0");
        }
        if self.session.registration_timeout_secs == 0 {
            anyhow::bail!("session.registration_timeout_secs must be greater than 0");
        }
        if self.session.max_frame_len < 16 {
            anyhow::bail!("session.max_frame_len must be at least 16 bytes");
        }
        if self.session.command_queue_depth == 0 {
            anyhow::bail!("session.command_queue_depth must be greater than 0");
        }
        Ok(())
    }
}
