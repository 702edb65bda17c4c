//! Command relay
//!
//! Forwards a client-issued command to the live session of the target
//! device. Delivery is fire-and-forget: success means the command was
//! handed to the device's session for writing, not that the device acted
//! on it. A device that does act usually pushes a status update on its own
//! session afterwards.

use log::{info, warn};
use std::sync::Arc;

use crate::error::RelayError;
use crate::metrics::Metrics;
use crate::protocol::{ClientResponse, DeviceCommand};
use crate::registry::DeviceRegistry;

pub struct CommandRelay {
    registry: Arc<DeviceRegistry>,
    metrics: Arc<Metrics>,
}

impl CommandRelay {
    pub fn new(registry: Arc<DeviceRegistry>, metrics: Arc<Metrics>) -> Self {
        Self { registry, metrics }
    }

    /// Queue `action` on the session of `device_id`.
    ///
    /// Never blocks on the device: a full queue is reported as
    /// [`RelayError::SessionBacklogged`].
    pub async fn send_command(&self, device_id: &str, action: &str) -> Result<(), RelayError> {
        let result = match self.registry.lookup_session(device_id).await {
            Some(session) => session
                .try_deliver(DeviceCommand {
                    device_id: device_id.to_string(),
                    action: action.to_string(),
                })
                .map(|()| session),
            None => Err(RelayError::DeviceNotConnected(device_id.to_string())),
        };

        match result {
            Ok(session) => {
                self.metrics.inc_commands_relayed();
                info!(
                    "Relayed command {:?} to {} (session {} at {})",
                    action,
                    device_id,
                    session.id(),
                    session.peer()
                );
                Ok(())
            }
            Err(e) => {
                self.metrics.inc_commands_failed();
                warn!("Command {:?} for {} not relayed: {}", action, device_id, e);
                Err(e)
            }
        }
    }

    /// Relay and turn the outcome into the client-facing ack
    pub async fn command_response(&self, device_id: &str, action: &str) -> ClientResponse {
        match self.send_command(device_id, action).await {
            Ok(()) => ClientResponse::success(format!(
                "Command '{}' sent to {}.",
                action, device_id
            )),
            Err(e) => ClientResponse::error(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{DeviceInfo, DeviceKind, DevicePacket};
    use crate::registry::SessionHandle;
    use std::sync::atomic::Ordering;

    fn lamp(id: &str) -> DevicePacket {
        DevicePacket {
            info: DeviceInfo {
                id: id.to_string(),
                kind: DeviceKind::Lamp,
                status: "OFF".to_string(),
            },
            address: "192.168.0.102".to_string(),
            port: 20002,
        }
    }

    #[tokio::test]
    async fn test_command_reaches_only_target() {
        let registry = Arc::new(DeviceRegistry::new());
        let metrics = Metrics::new();
        let relay = CommandRelay::new(registry.clone(), metrics.clone());

        let (a, mut rx_a) = SessionHandle::new(1, "10.0.0.1:5000".parse().unwrap(), 4);
        let (b, mut rx_b) = SessionHandle::new(2, "10.0.0.2:5000".parse().unwrap(), 4);
        registry.upsert(&lamp("lamp_a"), Some(a)).await;
        registry.upsert(&lamp("lamp_b"), Some(b)).await;

        relay.send_command("lamp_a", "TURN_ON").await.unwrap();

        let delivered = rx_a.try_recv().unwrap();
        assert_eq!(delivered.device_id, "lamp_a");
        assert_eq!(delivered.action, "TURN_ON");
        assert!(rx_b.try_recv().is_err());
        assert_eq!(metrics.commands_relayed_total.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_unknown_device_not_connected() {
        let registry = Arc::new(DeviceRegistry::new());
        let metrics = Metrics::new();
        let relay = CommandRelay::new(registry, metrics.clone());

        let err = relay.send_command("lamp_c", "TURN_ON").await.unwrap_err();
        assert_eq!(err, RelayError::DeviceNotConnected("lamp_c".to_string()));
        assert_eq!(metrics.commands_failed_total.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_command_response_messages() {
        let registry = Arc::new(DeviceRegistry::new());
        let relay = CommandRelay::new(registry.clone(), Metrics::new());

        let (h, _rx) = SessionHandle::new(1, "10.0.0.1:5000".parse().unwrap(), 4);
        registry.upsert(&lamp("lamp_01"), Some(h)).await;

        assert_eq!(
            relay.command_response("lamp_01", "TURN_OFF").await,
            ClientResponse::success("Command 'TURN_OFF' sent to lamp_01.")
        );
        assert_eq!(
            relay.command_response("lamp_02", "TURN_OFF").await,
            ClientResponse::error("Device lamp_02 is not connected.")
        );
    }
}
