use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Prometheus-compatible metrics for the gateway.
///
/// Counters are monotonic; `sessions_active` and `devices_registered` are
/// gauges.
#[derive(Debug)]
pub struct Metrics {
    // === Sessions ===
    pub sessions_active: AtomicU64,
    pub sessions_accepted_total: AtomicU64,

    // === Device Lifecycle ===
    /// Current records in the registry
    pub devices_registered: AtomicU64,
    /// Successful registrations (including re-registrations)
    pub registrations_total: AtomicU64,
    /// Connections closed before a valid registration
    pub registrations_rejected_total: AtomicU64,
    /// Device sessions that ended and removed their record
    pub device_disconnects_total: AtomicU64,
    /// In-session status pushes applied
    pub status_updates_total: AtomicU64,
    /// Frames on a registered session that failed to decode
    pub frames_malformed_total: AtomicU64,

    // === Telemetry ===
    pub telemetry_received_total: AtomicU64,
    pub telemetry_applied_total: AtomicU64,
    /// Well-formed readings for ids not in the registry
    pub telemetry_unknown_total: AtomicU64,
    pub telemetry_malformed_total: AtomicU64,

    // === Clients & Relay ===
    pub client_requests_total: AtomicU64,
    pub commands_relayed_total: AtomicU64,
    pub commands_failed_total: AtomicU64,

    // === Discovery ===
    pub beacons_sent_total: AtomicU64,
    pub beacons_failed_total: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new_inner()
    }
}

impl Metrics {
    fn new_inner() -> Self {
        Self {
            sessions_active: AtomicU64::new(0),
            sessions_accepted_total: AtomicU64::new(0),
            devices_registered: AtomicU64::new(0),
            registrations_total: AtomicU64::new(0),
            registrations_rejected_total: AtomicU64::new(0),
            device_disconnects_total: AtomicU64::new(0),
            status_updates_total: AtomicU64::new(0),
            frames_malformed_total: AtomicU64::new(0),
            telemetry_received_total: AtomicU64::new(0),
            telemetry_applied_total: AtomicU64::new(0),
            telemetry_unknown_total: AtomicU64::new(0),
            telemetry_malformed_total: AtomicU64::new(0),
            client_requests_total: AtomicU64::new(0),
            commands_relayed_total: AtomicU64::new(0),
            commands_failed_total: AtomicU64::new(0),
            beacons_sent_total: AtomicU64::new(0),
            beacons_failed_total: AtomicU64::new(0),
        }
    }

    pub fn new() -> Arc<Self> {
        Arc::new(Self::new_inner())
    }

    // === Session Methods ===

    pub fn inc_sessions(&self) {
        self.sessions_active.fetch_add(1, Ordering::Relaxed);
        self.sessions_accepted_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_sessions(&self) {
        self.sessions_active.fetch_sub(1, Ordering::Relaxed);
    }

    // === Device Methods ===

    pub fn set_devices_registered(&self, count: u64) {
        self.devices_registered.store(count, Ordering::Relaxed);
    }

    pub fn inc_registrations(&self) {
        self.registrations_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_registrations_rejected(&self) {
        self.registrations_rejected_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_device_disconnects(&self) {
        self.device_disconnects_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_status_updates(&self) {
        self.status_updates_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_frames_malformed(&self) {
        self.frames_malformed_total.fetch_add(1, Ordering::Relaxed);
    }

    // === Telemetry Methods ===

    pub fn inc_telemetry_received(&self) {
        self.telemetry_received_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_telemetry_applied(&self) {
        self.telemetry_applied_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_telemetry_unknown(&self) {
        self.telemetry_unknown_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_telemetry_malformed(&self) {
        self.telemetry_malformed_total.fetch_add(1, Ordering::Relaxed);
    }

    // === Client / Relay Methods ===

    pub fn inc_client_requests(&self) {
        self.client_requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_commands_relayed(&self) {
        self.commands_relayed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_commands_failed(&self) {
        self.commands_failed_total.fetch_add(1, Ordering::Relaxed);
    }

    // === Discovery Methods ===

    pub fn inc_beacons_sent(&self) {
        self.beacons_sent_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_beacons_failed(&self) {
        self.beacons_failed_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Format metrics in Prometheus exposition format.
    pub fn to_prometheus(&self) -> String {
        format!(
            "# HELP gateway_sessions_active Current number of open TCP sessions\n\
             # TYPE gateway_sessions_active gauge\n\
             gateway_sessions_active {}\n\
             # HELP gateway_sessions_accepted_total Total TCP sessions accepted\n\
             # TYPE gateway_sessions_accepted_total counter\n\
             gateway_sessions_accepted_total {}\n\
             # HELP gateway_devices_registered Devices currently in the registry\n\
             # TYPE gateway_devices_registered gauge\n\
             gateway_devices_registered {}\n\
             # HELP gateway_registrations_total Successful device registrations\n\
             # TYPE gateway_registrations_total counter\n\
             gateway_registrations_total {}\n\
             # HELP gateway_registrations_rejected_total Connections closed before registering\n\
             # TYPE gateway_registrations_rejected_total counter\n\
             gateway_registrations_rejected_total {}\n\
             # HELP gateway_device_disconnects_total Device sessions closed\n\
             # TYPE gateway_device_disconnects_total counter\n\
             gateway_device_disconnects_total {}\n\
             # HELP gateway_status_updates_total Status pushes applied from device sessions\n\
             # TYPE gateway_status_updates_total counter\n\
             gateway_status_updates_total {}\n\
             # HELP gateway_frames_malformed_total Undecodable or unexpected frames, excluding registrations\n\
             # TYPE gateway_frames_malformed_total counter\n\
             gateway_frames_malformed_total {}\n\
             # HELP gateway_telemetry_received_total Telemetry datagrams received\n\
             # TYPE gateway_telemetry_received_total counter\n\
             gateway_telemetry_received_total {}\n\
             # HELP gateway_telemetry_applied_total Telemetry readings applied to the registry\n\
             # TYPE gateway_telemetry_applied_total counter\n\
             gateway_telemetry_applied_total {}\n\
             # HELP gateway_telemetry_unknown_total Telemetry for unregistered devices\n\
             # TYPE gateway_telemetry_unknown_total counter\n\
             gateway_telemetry_unknown_total {}\n\
             # HELP gateway_telemetry_malformed_total Undecodable telemetry datagrams\n\
             # TYPE gateway_telemetry_malformed_total counter\n\
             gateway_telemetry_malformed_total {}\n\
             # HELP gateway_client_requests_total Client requests served\n\
             # TYPE gateway_client_requests_total counter\n\
             gateway_client_requests_total {}\n\
             # HELP gateway_commands_relayed_total Commands handed to a device session\n\
             # TYPE gateway_commands_relayed_total counter\n\
             gateway_commands_relayed_total {}\n\
             # HELP gateway_commands_failed_total Commands that could not be relayed\n\
             # TYPE gateway_commands_failed_total counter\n\
             gateway_commands_failed_total {}\n\
             # HELP gateway_beacons_sent_total Discovery beacons sent\n\
             # TYPE gateway_beacons_sent_total counter\n\
             gateway_beacons_sent_total {}\n\
             # HELP gateway_beacons_failed_total Discovery beacon send failures\n\
             # TYPE gateway_beacons_failed_total counter\n\
             gateway_beacons_failed_total {}\n",
            self.sessions_active.load(Ordering::Relaxed),
            self.sessions_accepted_total.load(Ordering::Relaxed),
            self.devices_registered.load(Ordering::Relaxed),
            self.registrations_total.load(Ordering::Relaxed),
            self.registrations_rejected_total.load(Ordering::Relaxed),
            self.device_disconnects_total.load(Ordering::Relaxed),
            self.status_updates_total.load(Ordering::Relaxed),
            self.frames_malformed_total.load(Ordering::Relaxed),
            self.telemetry_received_total.load(Ordering::Relaxed),
            self.telemetry_applied_total.load(Ordering::Relaxed),
            self.telemetry_unknown_total.load(Ordering::Relaxed),
            self.telemetry_malformed_total.load(Ordering::Relaxed),
            self.client_requests_total.load(Ordering::Relaxed),
            self.commands_relayed_total.load(Ordering::Relaxed),
            self.commands_failed_total.load(Ordering::Relaxed),
            self.beacons_sent_total.load(Ordering::Relaxed),
            self.beacons_failed_total.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new();
        assert_eq!(metrics.sessions_active.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.devices_registered.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_session_gauge() {
        let metrics = Metrics::new();

        metrics.inc_sessions();
        metrics.inc_sessions();
        metrics.dec_sessions();

        assert_eq!(metrics.sessions_active.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.sessions_accepted_total.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_telemetry_metrics() {
        let metrics = Metrics::new();

        metrics.inc_telemetry_received();
        metrics.inc_telemetry_received();
        metrics.inc_telemetry_applied();
        metrics.inc_telemetry_malformed();

        assert_eq!(metrics.telemetry_received_total.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.telemetry_applied_total.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.telemetry_malformed_total.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_prometheus_output() {
        let metrics = Metrics::new();
        metrics.set_devices_registered(3);
        metrics.inc_commands_relayed();
        metrics.inc_beacons_sent();

        let output = metrics.to_prometheus();
        assert!(output.contains("gateway_devices_registered 3"));
        assert!(output.contains("gateway_commands_relayed_total 1"));
        assert!(output.contains("gateway_beacons_sent_total 1"));
        assert!(output.contains("# TYPE gateway_sessions_active gauge"));
    }
}
