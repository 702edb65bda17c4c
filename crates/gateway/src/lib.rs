//! # Smart City Gateway
//!
//! Hub for a small fleet of networked street devices: lamps, sensors and
//! actuators. Devices are found over multicast, register over TCP, push
//! telemetry over UDP, and receive commands relayed from clients.
//!
//! ## Key Components
//!
//! ### Discovery
//! - [`DiscoveryBeacon`] - Periodic multicast `DISCOVER` announcements
//!
//! ### Device State
//! - [`DeviceRegistry`] - Shared, concurrently accessed device table
//! - [`TelemetryIngester`] - UDP sensor readings folded into the registry
//!
//! ### Sessions
//! - [`SessionManager`] - TCP accept loop; device and client sessions
//! - [`CommandRelay`] - Client commands forwarded to device sessions
//!
//! ## Example
//!
//! ```rust,ignore
//! use smartcity_gateway::{Config, Gateway};
//!
//! let config = Config::load("gateway.toml")?;
//! let gateway = Gateway::bind(config).await?;
//! println!("Sessions on {}", gateway.tcp_addr()?);
//! gateway.run().await?;
//! ```

pub mod config;
pub mod discovery;
pub mod error;
pub mod gateway;
pub mod http;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod session;
pub mod telemetry;

// ============================================================================
// Configuration
// ============================================================================

pub use config::{Config, DiscoveryConfig, GatewayConfig, MetricsConfig, SessionConfig};

// ============================================================================
// Errors
// ============================================================================

pub use error::{DecodeError, RelayError, SessionError};

// ============================================================================
// Gateway
// ============================================================================

pub use gateway::Gateway;

// ============================================================================
// Discovery
// ============================================================================

pub use discovery::DiscoveryBeacon;

// ============================================================================
// Metrics
// ============================================================================

pub use metrics::Metrics;

// ============================================================================
// Wire Protocol
// ============================================================================

pub use protocol::{
    ClientRequest, ClientResponse, DeviceCommand, DeviceInfo, DeviceKind, DevicePacket,
    DeviceSummary, DiscoverRequest, SensorReading,
};

// ============================================================================
// Registry
// ============================================================================

pub use registry::{DeviceRecord, DeviceRegistry, DeviceSnapshot, SessionHandle, SessionId};

// ============================================================================
// Sessions and Relay
// ============================================================================

pub use relay::CommandRelay;
pub use session::SessionManager;

// ============================================================================
// Telemetry
// ============================================================================

pub use telemetry::{IngestOutcome, TelemetryIngester};

// ============================================================================
// Message Type Detection Utilities
// ============================================================================

pub use protocol::{is_gateway_message, message_type};
