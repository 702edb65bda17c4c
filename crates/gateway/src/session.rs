//! TCP session handling
//!
//! ### Classification
//! The type byte of the first frame decides what a connection is:
//! `DEVICE_PACKET` starts a device session, `CLIENT_REQUEST` a one-shot
//! client exchange. Origin is only consulted when
//! `session.restrict_clients_to_loopback` is set.
//!
//! ### Device session
//! ```text
//!   AWAIT_REGISTRATION --valid DEVICE_PACKET--> REGISTERED --EOF/reset/error--> CLOSED
//!          |                                                                      ^
//!          +--------------- timeout / EOF / undecodable -------------------------+
//! ```
//! CLOSED detaches the session from the registry exactly once. A session
//! whose id re-registered on another connection is superseded: its command
//! channel closes and it shuts down without touching the newer record.

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Semaphore};
use tokio::time::timeout;

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::metrics::Metrics;
use crate::protocol::{
    encode_client_response, encode_device_command, message_type, parse_client_request,
    parse_device_packet, read_frame, write_frame, ClientRequest, ClientResponse, DeviceCommand,
    DeviceSummary, MSG_CLIENT_REQUEST, MSG_DEVICE_PACKET,
};
use crate::registry::{DeviceRegistry, SessionHandle, SessionId};
use crate::relay::CommandRelay;

pub struct SessionManager {
    config: SessionConfig,
    registry: Arc<DeviceRegistry>,
    relay: Arc<CommandRelay>,
    metrics: Arc<Metrics>,
    limiter: Arc<Semaphore>,
    next_session: AtomicU64,
}

impl SessionManager {
    pub fn new(
        config: SessionConfig,
        registry: Arc<DeviceRegistry>,
        relay: Arc<CommandRelay>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let limiter = Arc::new(Semaphore::new(config.max_sessions.max(1)));
        Self {
            config,
            registry,
            relay,
            metrics,
            limiter,
            next_session: AtomicU64::new(1),
        }
    }

    /// Accept connections forever, one task per connection.
    ///
    /// Waits for a free slot before accepting once `max_sessions` tasks are
    /// running. Accept errors are logged and never end the loop.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        match listener.local_addr() {
            Ok(addr) => info!("Sessions listening on TCP/{}", addr.port()),
            Err(e) => warn!("Session listener has no local address: {}", e),
        }

        loop {
            let permit = Arc::clone(&self.limiter)
                .acquire_owned()
                .await
                .context("session limiter closed")?;

            let (stream, peer) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!("Accept error: {}", e);
                    continue;
                }
            };

            let manager = Arc::clone(&self);
            tokio::spawn(async move {
                manager.handle_connection(stream, peer).await;
                drop(permit);
            });
        }
    }

    /// Drive one accepted connection to completion
    pub async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let session_id = self.next_session.fetch_add(1, Ordering::Relaxed);
        self.metrics.inc_sessions();
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY for {}: {}", peer, e);
        }

        let (mut reader, mut writer) = stream.into_split();

        match self.read_first_frame(&mut reader).await {
            Ok(Some(frame)) => match message_type(&frame) {
                Ok(MSG_DEVICE_PACKET) => {
                    self.device_session(session_id, peer, &frame, reader, writer)
                        .await
                }
                Ok(MSG_CLIENT_REQUEST) => self.client_session(peer, &frame, writer).await,
                Ok(other) => {
                    self.metrics.inc_frames_malformed();
                    warn!("Unexpected first message {:#04x} from {}", other, peer);
                    respond(
                        &mut writer,
                        peer,
                        &ClientResponse::error(format!("Unsupported message type {:#04x}.", other)),
                    )
                    .await;
                }
                Err(e) => {
                    self.metrics.inc_frames_malformed();
                    warn!("Undecodable first message from {}: {}", peer, e);
                    respond(
                        &mut writer,
                        peer,
                        &ClientResponse::error(format!("Malformed request: {}", e)),
                    )
                    .await;
                }
            },
            Ok(None) => {
                debug!("{} closed before sending a message", peer);
            }
            Err(e) => {
                if matches!(e, SessionError::Decode(_)) {
                    self.metrics.inc_frames_malformed();
                }
                warn!("Dropping connection from {}: {}", peer, e);
            }
        }

        self.metrics.dec_sessions();
    }

    async fn read_first_frame(
        &self,
        reader: &mut OwnedReadHalf,
    ) -> Result<Option<Vec<u8>>, SessionError> {
        let limit = self.config.registration_timeout();
        match timeout(limit, read_frame(reader, self.config.max_frame_len)).await {
            Ok(result) => result,
            Err(_) => Err(SessionError::RegistrationTimeout(limit)),
        }
    }

    async fn device_session(
        &self,
        session_id: SessionId,
        peer: SocketAddr,
        first: &[u8],
        mut reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
    ) {
        let packet = match parse_device_packet(first) {
            Ok(packet) => packet,
            Err(e) => {
                self.metrics.inc_registrations_rejected();
                warn!("Rejected registration from {}: {}", peer, e);
                return;
            }
        };
        let device_id = packet.info.id.clone();

        let (handle, commands) =
            SessionHandle::new(session_id, peer, self.config.command_queue_depth);
        if let Some(previous) = self.registry.upsert(&packet, Some(handle)).await {
            info!(
                "Device {} re-registered from {}; superseding session {} at {}",
                device_id,
                peer,
                previous.id(),
                previous.peer()
            );
        }
        self.metrics.inc_registrations();

        let mut writer_task = tokio::spawn(write_commands(writer, commands, device_id.clone()));

        let reason = loop {
            tokio::select! {
                frame = read_frame(&mut reader, self.config.max_frame_len) => match frame {
                    Ok(Some(frame)) => self.apply_status_push(&device_id, &frame).await,
                    Ok(None) => break "closed by peer".to_string(),
                    Err(e) if e.is_disconnect() => break format!("connection lost ({})", e),
                    Err(e) => break format!("protocol error ({})", e),
                },
                outcome = &mut writer_task => break match outcome {
                    Ok(Ok(())) => "superseded by a newer session".to_string(),
                    Ok(Err(e)) => format!("command write failed ({:#})", e),
                    Err(e) => format!("command writer stopped ({})", e),
                },
            }
        };
        writer_task.abort();

        if self.registry.detach_session(&device_id, session_id).await {
            self.metrics.inc_device_disconnects();
        }
        info!(
            "Device {} session {} from {} closed: {}",
            device_id, session_id, peer, reason
        );
    }

    async fn apply_status_push(&self, device_id: &str, frame: &[u8]) {
        match parse_device_packet(frame) {
            Ok(packet) if packet.info.id == device_id => {
                if self
                    .registry
                    .update_status(device_id, &packet.info.status)
                    .await
                {
                    self.metrics.inc_status_updates();
                    info!("Device {} status updated to {:?}", device_id, packet.info.status);
                }
            }
            Ok(packet) => {
                warn!(
                    "Session for {} pushed status for {}; ignored",
                    device_id, packet.info.id
                );
            }
            Err(e) => {
                self.metrics.inc_frames_malformed();
                warn!("Dropped malformed frame from {}: {}", device_id, e);
            }
        }
    }

    async fn client_session(&self, peer: SocketAddr, first: &[u8], mut writer: OwnedWriteHalf) {
        self.metrics.inc_client_requests();

        let response = if self.config.restrict_clients_to_loopback && !is_local_origin(&peer) {
            warn!("Refused client request from non-local peer {}", peer);
            ClientResponse::error("Client requests are only accepted from the local host.")
        } else {
            match parse_client_request(first) {
                Ok(ClientRequest::ListDevices) => {
                    let devices: Vec<DeviceSummary> = self
                        .registry
                        .snapshot()
                        .await
                        .into_iter()
                        .map(DeviceSummary::from)
                        .collect();
                    debug!("Listing {} devices for {}", devices.len(), peer);
                    ClientResponse::Devices { devices }
                }
                Ok(ClientRequest::CommandDevice { device_id, action }) => {
                    self.relay.command_response(&device_id, &action).await
                }
                Err(e) => {
                    self.metrics.inc_frames_malformed();
                    warn!("Malformed client request from {}: {}", peer, e);
                    ClientResponse::error(format!("Malformed request: {}", e))
                }
            }
        };

        respond(&mut writer, peer, &response).await;
    }
}

/// Drain the session's command queue onto the socket.
///
/// Returns `Ok` once every sender is gone, i.e. the registry no longer
/// holds this session's handle.
async fn write_commands(
    mut writer: OwnedWriteHalf,
    mut commands: mpsc::Receiver<DeviceCommand>,
    device_id: String,
) -> Result<()> {
    while let Some(command) = commands.recv().await {
        let message = encode_device_command(&command)?;
        write_frame(&mut writer, &message)
            .await
            .with_context(|| format!("writing {:?} to {}", command.action, device_id))?;
        debug!("Wrote command {:?} to {}", command.action, device_id);
    }
    Ok(())
}

/// Send one response frame and close our side
async fn respond(writer: &mut OwnedWriteHalf, peer: SocketAddr, response: &ClientResponse) {
    let message = match encode_client_response(response) {
        Ok(message) => message,
        Err(e) => {
            error!("Failed to encode response for {}: {:#}", peer, e);
            return;
        }
    };
    if let Err(e) = write_frame(writer, &message).await {
        debug!("Failed to send response to {}: {}", peer, e);
        return;
    }
    let _ = writer.shutdown().await;
}

/// Loopback origin, including IPv4-mapped loopback on dual-stack listeners
pub fn is_local_origin(peer: &SocketAddr) -> bool {
    match peer.ip() {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => {
            v6.is_loopback() || v6.to_ipv4_mapped().map_or(false, |v4| v4.is_loopback())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        encode_device_packet, parse_client_response, DeviceInfo, DeviceKind, DevicePacket,
        DEFAULT_MAX_FRAME_LEN,
    };
    use crate::registry::DeviceSnapshot;
    use std::time::Duration;

    async fn start(config: SessionConfig) -> (SocketAddr, Arc<DeviceRegistry>) {
        let (addr, registry, _metrics) = start_with_metrics(config).await;
        (addr, registry)
    }

    async fn start_with_metrics(
        config: SessionConfig,
    ) -> (SocketAddr, Arc<DeviceRegistry>, Arc<Metrics>) {
        let metrics = Metrics::new();
        let registry = Arc::new(DeviceRegistry::with_metrics(metrics.clone()));
        let relay = Arc::new(CommandRelay::new(registry.clone(), metrics.clone()));
        let manager = Arc::new(SessionManager::new(
            config,
            registry.clone(),
            relay,
            metrics.clone(),
        ));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(manager.run(listener));
        (addr, registry, metrics)
    }

    async fn send_and_wait_close(addr: SocketAddr, frame: &[u8]) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        write_frame(&mut stream, frame).await.unwrap();
        // Drain any reply until the gateway closes its side
        loop {
            match tokio::time::timeout(
                Duration::from_secs(2),
                read_frame(&mut stream, DEFAULT_MAX_FRAME_LEN),
            )
            .await
            .expect("gateway kept the connection open")
            {
                Ok(Some(_)) => continue,
                _ => break,
            }
        }
    }

    fn lamp(id: &str, status: &str) -> Vec<u8> {
        encode_device_packet(&DevicePacket {
            info: DeviceInfo {
                id: id.to_string(),
                kind: DeviceKind::Lamp,
                status: status.to_string(),
            },
            address: "192.168.0.102".to_string(),
            port: 20002,
        })
        .unwrap()
    }

    async fn wait_until<F>(registry: &DeviceRegistry, check: F) -> bool
    where
        F: Fn(&[DeviceSnapshot]) -> bool,
    {
        for _ in 0..100 {
            if check(&registry.snapshot().await) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    fn status_of(devices: &[DeviceSnapshot], id: &str) -> Option<String> {
        devices.iter().find(|d| d.id == id).map(|d| d.status.clone())
    }

    #[test]
    fn test_is_local_origin() {
        assert!(is_local_origin(&"127.0.0.1:5000".parse().unwrap()));
        assert!(is_local_origin(&"[::1]:5000".parse().unwrap()));
        assert!(is_local_origin(&"[::ffff:127.0.0.1]:5000".parse().unwrap()));
        assert!(!is_local_origin(&"192.168.0.10:5000".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_silent_connection_times_out_without_mutation() {
        let config = SessionConfig {
            registration_timeout_secs: 1,
            ..SessionConfig::default()
        };
        let (addr, registry) = start(config).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let closed = tokio::time::timeout(
            Duration::from_secs(3),
            read_frame(&mut stream, DEFAULT_MAX_FRAME_LEN),
        )
        .await
        .expect("gateway kept the idle connection open");
        assert!(matches!(closed, Ok(None)) || closed.is_err());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_foreign_status_push_ignored() {
        let (addr, registry) = start(SessionConfig::default()).await;

        let mut other = TcpStream::connect(addr).await.unwrap();
        write_frame(&mut other, &lamp("lamp_02", "OFF")).await.unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        write_frame(&mut stream, &lamp("lamp_01", "OFF")).await.unwrap();
        assert!(wait_until(&registry, |devices| devices.len() == 2).await);

        write_frame(&mut stream, &lamp("lamp_02", "ON")).await.unwrap();
        write_frame(&mut stream, &lamp("lamp_01", "ON")).await.unwrap();
        assert!(
            wait_until(&registry, |devices| {
                status_of(devices, "lamp_01").as_deref() == Some("ON")
            })
            .await
        );
        assert_eq!(registry.get("lamp_02").await.unwrap().status, "OFF");
    }

    #[tokio::test]
    async fn test_loopback_restriction_allows_local_clients() {
        let config = SessionConfig {
            restrict_clients_to_loopback: true,
            ..SessionConfig::default()
        };
        let (addr, _registry) = start(config).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = crate::protocol::encode_client_request(&ClientRequest::ListDevices).unwrap();
        write_frame(&mut stream, &request).await.unwrap();

        let frame = read_frame(&mut stream, DEFAULT_MAX_FRAME_LEN)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            parse_client_response(&frame).unwrap(),
            ClientResponse::Devices { devices: vec![] }
        );
    }

    #[tokio::test]
    async fn test_first_frame_counters() {
        let (addr, registry, metrics) = start_with_metrics(SessionConfig::default()).await;
        let rejected = || metrics.registrations_rejected_total.load(Ordering::Relaxed);
        let malformed = || metrics.frames_malformed_total.load(Ordering::Relaxed);

        // Unknown message type: not a registration attempt
        send_and_wait_close(addr, &[0x09]).await;
        assert_eq!(malformed(), 1);
        assert_eq!(rejected(), 0);

        // Client request with an undecodable payload
        send_and_wait_close(addr, &[MSG_CLIENT_REQUEST, 0xff, 0x00]).await;
        assert_eq!(malformed(), 2);
        assert_eq!(rejected(), 0);

        // Device packet with an undecodable payload
        send_and_wait_close(addr, &[MSG_DEVICE_PACKET, 0xff, 0x00]).await;
        assert!(wait_until(&registry, |devices| devices.is_empty()).await);
        for _ in 0..50 {
            if rejected() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(rejected(), 1);
        assert_eq!(malformed(), 2);
    }
}
