//! Telemetry ingestion
//!
//! Sensors push readings as single UDP datagrams. Each reading overwrites
//! the status of an already-registered device; readings never create a
//! record, only a TCP registration can.

use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;

use crate::metrics::Metrics;
use crate::protocol::parse_sensor_reading;
use crate::registry::DeviceRegistry;

/// Largest datagram we read; readings are a few dozen bytes
const MAX_DATAGRAM_LEN: usize = 2048;

/// What happened to one datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Status of this device was updated
    Applied(String),
    /// Well-formed, but the device is not registered
    UnknownDevice(String),
    /// Could not be decoded
    Malformed,
}

pub struct TelemetryIngester {
    socket: UdpSocket,
    registry: Arc<DeviceRegistry>,
    metrics: Arc<Metrics>,
}

impl TelemetryIngester {
    pub fn new(socket: UdpSocket, registry: Arc<DeviceRegistry>, metrics: Arc<Metrics>) -> Self {
        Self {
            socket,
            registry,
            metrics,
        }
    }

    /// Fold one datagram into the registry
    pub async fn ingest(&self, datagram: &[u8], src: SocketAddr) -> IngestOutcome {
        ingest_datagram(&self.registry, &self.metrics, datagram, src).await
    }

    /// Receive and ingest datagrams forever
    pub async fn run(self) {
        match self.socket.local_addr() {
            Ok(addr) => info!("Telemetry listening on UDP/{}", addr.port()),
            Err(e) => warn!("Telemetry socket has no local address: {}", e),
        }

        let mut buf = [0u8; MAX_DATAGRAM_LEN];
        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((len, src)) => {
                    self.ingest(&buf[..len], src).await;
                }
                Err(e) => {
                    error!("Telemetry socket error: {}", e);
                }
            }
        }
    }
}

/// Decode a reading and apply it, formatted for the device's kind
pub async fn ingest_datagram(
    registry: &DeviceRegistry,
    metrics: &Metrics,
    datagram: &[u8],
    src: SocketAddr,
) -> IngestOutcome {
    metrics.inc_telemetry_received();

    let reading = match parse_sensor_reading(datagram) {
        Ok(reading) => reading,
        Err(e) => {
            metrics.inc_telemetry_malformed();
            warn!("Dropped telemetry datagram from {}: {}", src, e);
            return IngestOutcome::Malformed;
        }
    };

    let value = reading.value;
    let applied = registry
        .update_status_with(&reading.device_id, |record| {
            record.kind.format_reading(value)
        })
        .await;

    if applied {
        metrics.inc_telemetry_applied();
        debug!("Telemetry {} = {} from {}", reading.device_id, value, src);
        IngestOutcome::Applied(reading.device_id)
    } else {
        metrics.inc_telemetry_unknown();
        debug!(
            "Ignored telemetry for unregistered device {} from {}",
            reading.device_id, src
        );
        IngestOutcome::UnknownDevice(reading.device_id)
    }
}
