//! Device registry
//!
//! The single shared mutable object of the gateway: device id → record.
//! Every operation takes the one lock for its whole duration, so readers
//! never observe a half-written record. `snapshot()` copies out and releases
//! the lock before the caller serialises anything.

use log::{debug, info};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use crate::error::RelayError;
use crate::metrics::Metrics;
use crate::protocol::{DeviceCommand, DeviceKind, DevicePacket, DeviceSummary};

/// Identifies one accepted TCP connection for its whole lifetime
pub type SessionId = u64;

/// Handle to a live device connection.
///
/// Cloning is cheap; the session task owns the receiving end and writes
/// queued commands to the socket. Dropping every clone closes the session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    peer: SocketAddr,
    commands: mpsc::Sender<DeviceCommand>,
}

impl SessionHandle {
    /// Create a handle and the receiver its session task drains
    pub fn new(
        id: SessionId,
        peer: SocketAddr,
        queue_depth: usize,
    ) -> (Self, mpsc::Receiver<DeviceCommand>) {
        let (commands, rx) = mpsc::channel(queue_depth.max(1));
        (Self { id, peer, commands }, rx)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Queue a command for the session's writer without waiting
    pub fn try_deliver(&self, command: DeviceCommand) -> Result<(), RelayError> {
        self.commands.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(c) => RelayError::SessionBacklogged(c.device_id),
            mpsc::error::TrySendError::Closed(c) => RelayError::DeviceNotConnected(c.device_id),
        })
    }
}

/// One registered device
#[derive(Debug)]
pub struct DeviceRecord {
    pub id: String,
    pub kind: DeviceKind,
    pub status: String,
    pub address: String,
    pub port: u16,
    pub session: Option<SessionHandle>,
}

/// Immutable copy of a record, without the session handle
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSnapshot {
    pub id: String,
    pub kind: DeviceKind,
    pub status: String,
    pub address: String,
    pub port: u16,
}

impl From<&DeviceRecord> for DeviceSnapshot {
    fn from(record: &DeviceRecord) -> Self {
        Self {
            id: record.id.clone(),
            kind: record.kind,
            status: record.status.clone(),
            address: record.address.clone(),
            port: record.port,
        }
    }
}

impl From<DeviceSnapshot> for DeviceSummary {
    fn from(snapshot: DeviceSnapshot) -> Self {
        Self {
            id: snapshot.id,
            kind: snapshot.kind.name().to_string(),
            status: snapshot.status,
            address: snapshot.address,
            port: snapshot.port,
        }
    }
}

/// Concurrent device store shared by every gateway component
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: Mutex<HashMap<String, DeviceRecord>>,
    /// Receives the device count whenever the table grows or shrinks
    metrics: Option<Arc<Metrics>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry that keeps `devices_registered` in step with the table
    pub fn with_metrics(metrics: Arc<Metrics>) -> Self {
        Self {
            devices: Mutex::default(),
            metrics: Some(metrics),
        }
    }

    // Called with the lock held so concurrent changes publish in order
    fn publish_count(&self, devices: &HashMap<String, DeviceRecord>) {
        if let Some(metrics) = &self.metrics {
            metrics.set_devices_registered(devices.len() as u64);
        }
    }

    /// Create or fully replace the record for `packet.info.id`.
    ///
    /// Returns the handle of the session that previously owned the id, if
    /// it was a different connection.
    pub async fn upsert(
        &self,
        packet: &DevicePacket,
        session: Option<SessionHandle>,
    ) -> Option<SessionHandle> {
        let record = DeviceRecord {
            id: packet.info.id.clone(),
            kind: packet.info.kind,
            status: packet.info.status.clone(),
            address: packet.address.clone(),
            port: packet.port,
            session,
        };
        let new_session = record.session.as_ref().map(SessionHandle::id);

        let previous = {
            let mut devices = self.devices.lock().await;
            let previous = devices.insert(record.id.clone(), record);
            self.publish_count(&devices);
            previous
        };

        info!(
            "Device registered: {} ({}) status={:?} at {}:{}",
            packet.info.id, packet.info.kind, packet.info.status, packet.address, packet.port
        );

        previous
            .and_then(|old| old.session)
            .filter(|old| Some(old.id()) != new_session)
    }

    /// Overwrite the status of a known device. Unknown ids are a no-op.
    pub async fn update_status(&self, id: &str, status: &str) -> bool {
        self.update_status_with(id, |_| status.to_string()).await
    }

    /// Overwrite the status with a value derived from the current record,
    /// under the same lock.
    pub async fn update_status_with<F>(&self, id: &str, render: F) -> bool
    where
        F: FnOnce(&DeviceRecord) -> String,
    {
        let mut devices = self.devices.lock().await;
        match devices.get_mut(id) {
            Some(record) => {
                record.status = render(record);
                debug!("Status of {} is now {:?}", id, record.status);
                true
            }
            None => false,
        }
    }

    /// Attach a live session handle to an existing record
    pub async fn attach_session(&self, id: &str, session: SessionHandle) -> bool {
        let mut devices = self.devices.lock().await;
        match devices.get_mut(id) {
            Some(record) => {
                record.session = Some(session);
                true
            }
            None => false,
        }
    }

    /// Clear the session and delete the record, in one step.
    ///
    /// Only the session that owns the record may remove it; a stale session
    /// closing after its id re-registered elsewhere leaves the new record
    /// untouched.
    pub async fn detach_session(&self, id: &str, session: SessionId) -> bool {
        let mut devices = self.devices.lock().await;
        let owned = devices
            .get(id)
            .map(|r| r.session.as_ref().map_or(true, |s| s.id() == session))
            .unwrap_or(false);

        if owned {
            devices.remove(id);
            self.publish_count(&devices);
            info!("Device {} removed from registry", id);
        }
        owned
    }

    /// Point-in-time copy of every record
    pub async fn snapshot(&self) -> Vec<DeviceSnapshot> {
        let devices = self.devices.lock().await;
        devices.values().map(DeviceSnapshot::from).collect()
    }

    /// Copy of a single record
    pub async fn get(&self, id: &str) -> Option<DeviceSnapshot> {
        self.devices.lock().await.get(id).map(DeviceSnapshot::from)
    }

    /// Live session handle for a device, if connected
    pub async fn lookup_session(&self, id: &str) -> Option<SessionHandle> {
        self.devices
            .lock()
            .await
            .get(id)
            .and_then(|r| r.session.clone())
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.devices.lock().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.devices.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.devices.lock().await.is_empty()
    }
}
