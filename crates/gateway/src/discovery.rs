//! Discovery beacon
//!
//! Periodically sends a `DISCOVER` request to the multicast group so that
//! unregistered devices learn the gateway's address (the datagram's source
//! IP). Nothing is read back on this socket; devices answer by opening a TCP
//! session to the gateway.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{interval, MissedTickBehavior};

use crate::config::DiscoveryConfig;
use crate::metrics::Metrics;
use crate::protocol::{encode_discover, DiscoverRequest};

pub struct DiscoveryBeacon {
    socket: UdpSocket,
    target: SocketAddr,
    interval: Duration,
    message: Vec<u8>,
    metrics: Arc<Metrics>,
}

impl DiscoveryBeacon {
    /// Bind an ephemeral UDP socket configured for multicast sends
    pub async fn bind(config: &DiscoveryConfig, metrics: Arc<Metrics>) -> Result<Self> {
        let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
            .await
            .context("Failed to bind discovery socket")?;
        socket
            .set_multicast_ttl_v4(config.ttl)
            .context("Failed to set multicast TTL")?;
        socket
            .set_multicast_loop_v4(config.multicast_loop)
            .context("Failed to set multicast loopback")?;

        let message = encode_discover(&DiscoverRequest::default())?;

        Ok(Self {
            socket,
            target: SocketAddr::V4(SocketAddrV4::new(config.group, config.port)),
            interval: config.interval(),
            message,
            metrics,
        })
    }

    /// Send a single beacon
    pub async fn announce(&self) -> Result<()> {
        self.socket
            .send_to(&self.message, self.target)
            .await
            .with_context(|| format!("Failed to send discovery beacon to {}", self.target))?;
        self.metrics.inc_beacons_sent();
        Ok(())
    }

    /// Announce on every tick, forever. Send failures are retried next tick.
    pub async fn run(self) {
        info!(
            "Discovery beacon announcing to {} every {:?}",
            self.target, self.interval
        );

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            debug!("Sending discovery beacon");
            if let Err(e) = self.announce().await {
                self.metrics.inc_beacons_failed();
                warn!("{:#}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::parse_discover;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn test_announce_sends_discover() {
        // A unicast listener stands in for the multicast group.
        let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let config = DiscoveryConfig {
            group: Ipv4Addr::LOCALHOST,
            port,
            ..DiscoveryConfig::default()
        };
        let metrics = Metrics::new();
        let beacon = DiscoveryBeacon::bind(&config, metrics.clone()).await.unwrap();
        beacon.announce().await.unwrap();

        let mut buf = [0u8; 256];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), listener.recv_from(&mut buf))
            .await
            .expect("beacon not received")
            .unwrap();

        assert_eq!(parse_discover(&buf[..len]).unwrap().action, "DISCOVER");
        assert_eq!(metrics.beacons_sent_total.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_run_repeats_on_interval() {
        let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let config = DiscoveryConfig {
            group: Ipv4Addr::LOCALHOST,
            port,
            interval_secs: 1,
            ..DiscoveryConfig::default()
        };
        let beacon = DiscoveryBeacon::bind(&config, Metrics::new()).await.unwrap();
        let task = tokio::spawn(beacon.run());

        let mut buf = [0u8; 256];
        for _ in 0..2 {
            let (len, _) =
                tokio::time::timeout(Duration::from_secs(3), listener.recv_from(&mut buf))
                    .await
                    .expect("beacon not received")
                    .unwrap();
            assert!(parse_discover(&buf[..len]).is_ok());
        }
        task.abort();
    }
}
