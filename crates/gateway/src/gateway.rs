//! Gateway assembly
//!
//! Binds every socket up front so that a port conflict fails startup with
//! the offending address, then runs the session accept loop, the telemetry
//! loop and the discovery beacon as independent tasks. They share state
//! only through the [`DeviceRegistry`].

use anyhow::{Context, Result};
use log::{error, info};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, UdpSocket};

use crate::config::Config;
use crate::discovery::DiscoveryBeacon;
use crate::http;
use crate::metrics::Metrics;
use crate::registry::DeviceRegistry;
use crate::relay::CommandRelay;
use crate::session::SessionManager;
use crate::telemetry::TelemetryIngester;

pub struct Gateway {
    config: Config,
    registry: Arc<DeviceRegistry>,
    metrics: Arc<Metrics>,
    listener: TcpListener,
    telemetry_socket: UdpSocket,
    beacon: Option<DiscoveryBeacon>,
}

impl Gateway {
    /// Validate the config and bind the TCP, telemetry and beacon sockets.
    pub async fn bind(config: Config) -> Result<Self> {
        config.validate()?;

        let tcp_addr = SocketAddr::new(config.gateway.bind_addr, config.gateway.tcp_port);
        let listener = TcpListener::bind(tcp_addr)
            .await
            .with_context(|| format!("Failed to bind TCP listener on {}", tcp_addr))?;

        let udp_addr = SocketAddr::new(config.gateway.bind_addr, config.gateway.udp_port);
        let telemetry_socket = UdpSocket::bind(udp_addr)
            .await
            .with_context(|| format!("Failed to bind telemetry socket on {}", udp_addr))?;

        let metrics = Metrics::new();
        let beacon = if config.discovery.enabled {
            Some(DiscoveryBeacon::bind(&config.discovery, metrics.clone()).await?)
        } else {
            info!("Discovery beacon disabled");
            None
        };

        Ok(Self {
            config,
            registry: Arc::new(DeviceRegistry::with_metrics(metrics.clone())),
            metrics,
            listener,
            telemetry_socket,
            beacon,
        })
    }

    pub fn tcp_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("TCP listener has no local address")
    }

    pub fn udp_addr(&self) -> Result<SocketAddr> {
        self.telemetry_socket
            .local_addr()
            .context("telemetry socket has no local address")
    }

    pub fn registry(&self) -> Arc<DeviceRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    /// Run until the accept loop fails. Telemetry and discovery run beside it.
    pub async fn run(self) -> Result<()> {
        let relay = Arc::new(CommandRelay::new(
            self.registry.clone(),
            self.metrics.clone(),
        ));
        let sessions = Arc::new(SessionManager::new(
            self.config.session.clone(),
            self.registry.clone(),
            relay,
            self.metrics.clone(),
        ));

        let ingester = TelemetryIngester::new(
            self.telemetry_socket,
            self.registry.clone(),
            self.metrics.clone(),
        );
        let telemetry_task = tokio::spawn(ingester.run());
        let beacon_task = self.beacon.map(|beacon| tokio::spawn(beacon.run()));

        let metrics_task = if self.config.metrics.enabled {
            let metrics = self.metrics.clone();
            let ip = self.config.gateway.bind_addr;
            let port = self.config.metrics.port;
            Some(tokio::spawn(async move {
                if let Err(e) = http::serve_metrics(metrics, ip, port).await {
                    error!("Metrics server failed: {:#}", e);
                }
            }))
        } else {
            None
        };

        let result = sessions.run(self.listener).await;

        telemetry_task.abort();
        for task in beacon_task.into_iter().chain(metrics_task) {
            task.abort();
        }
        result
    }
}
