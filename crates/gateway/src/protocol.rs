//! Gateway Wire Protocol
//!
//! ### Message Flow
//! ```text
//!   Gateway->>Multicast: DISCOVER                      (UDP 224.1.1.1:5007)
//!   Device->>Gateway:    DEVICE_PACKET (registration)  (TCP 10000)
//!   loop
//!     Device->>Gateway:  DEVICE_PACKET (status push)   (TCP, same connection)
//!     Gateway->>Device:  DEVICE_COMMAND                (TCP, same connection)
//!     Device->>Gateway:  SENSOR_READING                (UDP 10001)
//!   end
//!   Client->>Gateway:    CLIENT_REQUEST                (TCP 10000, new connection)
//!   Gateway-->>Client:   CLIENT_RESPONSE               (then close)
//! ```
//!
//! ### Encoding
//! Every message is `[type: u8][CBOR payload]`. UDP carries one message per
//! datagram. TCP prefixes each message with its length as a big-endian `u32`
//! so that a stream boundary never splits or merges messages.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{DecodeError, SessionError};

/// Gateway -> multicast group: "a gateway is here"
pub const MSG_DISCOVER: u8 = 0x01;
/// Device -> gateway: registration or status push
pub const MSG_DEVICE_PACKET: u8 = 0x02;
/// Device -> gateway over UDP: one sensor reading
pub const MSG_SENSOR_READING: u8 = 0x03;
/// Client -> gateway: list or command request
pub const MSG_CLIENT_REQUEST: u8 = 0x04;
/// Gateway -> client: device list or ack
pub const MSG_CLIENT_RESPONSE: u8 = 0x05;
/// Gateway -> device: command to execute
pub const MSG_DEVICE_COMMAND: u8 = 0x06;

/// Action carried by every discovery request
pub const DISCOVER_ACTION: &str = "DISCOVER";

/// Size of the TCP length prefix
pub const FRAME_HEADER_LEN: usize = 4;

/// Default upper bound for a single TCP frame
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024;

/// Device category, fixed at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceKind {
    Lamp,
    TempSensor,
    GenericSensor,
    GenericActuator,
}

impl DeviceKind {
    /// Wire/display name, e.g. `TEMP_SENSOR`
    pub fn name(&self) -> &'static str {
        match self {
            DeviceKind::Lamp => "LAMP",
            DeviceKind::TempSensor => "TEMP_SENSOR",
            DeviceKind::GenericSensor => "GENERIC_SENSOR",
            DeviceKind::GenericActuator => "GENERIC_ACTUATOR",
        }
    }

    /// Render a numeric reading as a status string for this kind.
    ///
    /// Temperatures keep only the integer part, as the field sensors report
    /// whole degrees.
    pub fn format_reading(&self, value: f64) -> String {
        match self {
            DeviceKind::TempSensor => format!("{}°C", value.trunc() as i64),
            _ => format!("{}", value),
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Multicast discovery request
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DiscoverRequest {
    pub action: String,
}

impl Default for DiscoverRequest {
    fn default() -> Self {
        Self {
            action: DISCOVER_ACTION.to_string(),
        }
    }
}

/// Device identity and current state
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DeviceInfo {
    pub id: String,
    pub kind: DeviceKind,
    pub status: String,
}

/// Registration packet; also used for in-session status pushes
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DevicePacket {
    pub info: DeviceInfo,
    /// Self-reported reachable address (advisory)
    pub address: String,
    /// Self-reported reachable port (advisory)
    pub port: u16,
}

/// UDP telemetry datagram
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SensorReading {
    pub device_id: String,
    pub value: f64,
}

/// Request from an external client (HTTP relay, CLI, ...)
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ClientRequest {
    ListDevices,
    CommandDevice { device_id: String, action: String },
}

/// One entry of a device list response
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DeviceSummary {
    pub id: String,
    /// Kind name, e.g. `LAMP`
    pub kind: String,
    pub status: String,
    pub address: String,
    pub port: u16,
}

/// Gateway reply to a client request
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ClientResponse {
    Devices { devices: Vec<DeviceSummary> },
    Ack { success: bool, message: String },
}

impl ClientResponse {
    pub fn success(message: impl Into<String>) -> Self {
        ClientResponse::Ack {
            success: true,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ClientResponse::Ack {
            success: false,
            message: message.into(),
        }
    }
}

/// Command pushed by the gateway onto a device session
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DeviceCommand {
    pub device_id: String,
    pub action: String,
}

/// Encode a message as `[msg_type][CBOR payload]`
pub fn encode_message(msg_type: u8, payload: &impl Serialize) -> Result<Vec<u8>> {
    let mut data = vec![msg_type];
    let encoded = serde_cbor::to_vec(payload)
        .with_context(|| format!("Failed to encode message type {:#04x}", msg_type))?;
    data.extend(encoded);
    Ok(data)
}

/// Read the type byte of a message without decoding the payload
pub fn message_type(data: &[u8]) -> Result<u8, DecodeError> {
    let msg_type = *data.first().ok_or(DecodeError::Empty)?;
    if is_gateway_message(data) {
        Ok(msg_type)
    } else {
        Err(DecodeError::UnknownType(msg_type))
    }
}

/// Check whether the leading byte is one of ours
pub fn is_gateway_message(data: &[u8]) -> bool {
    matches!(
        data.first(),
        Some(
            &(MSG_DISCOVER
                | MSG_DEVICE_PACKET
                | MSG_SENSOR_READING
                | MSG_CLIENT_REQUEST
                | MSG_CLIENT_RESPONSE
                | MSG_DEVICE_COMMAND)
        )
    )
}

fn decode_payload<T: DeserializeOwned>(
    data: &[u8],
    expected: u8,
    kind: &'static str,
) -> Result<T, DecodeError> {
    let actual = message_type(data)?;
    if actual != expected {
        return Err(DecodeError::UnexpectedType { expected, actual });
    }
    serde_cbor::from_slice(&data[1..]).map_err(|source| DecodeError::Payload { kind, source })
}

/// Encode a DISCOVER request
pub fn encode_discover(request: &DiscoverRequest) -> Result<Vec<u8>> {
    encode_message(MSG_DISCOVER, request)
}

/// Parse a DISCOVER request
pub fn parse_discover(data: &[u8]) -> Result<DiscoverRequest, DecodeError> {
    let request: DiscoverRequest = decode_payload(data, MSG_DISCOVER, "DISCOVER")?;
    if request.action != DISCOVER_ACTION {
        return Err(DecodeError::InvalidField {
            kind: "DISCOVER",
            reason: "unknown action",
        });
    }
    Ok(request)
}

/// Encode a DEVICE_PACKET
pub fn encode_device_packet(packet: &DevicePacket) -> Result<Vec<u8>> {
    encode_message(MSG_DEVICE_PACKET, packet)
}

/// Parse a DEVICE_PACKET, rejecting packets without an id
pub fn parse_device_packet(data: &[u8]) -> Result<DevicePacket, DecodeError> {
    let packet: DevicePacket = decode_payload(data, MSG_DEVICE_PACKET, "DEVICE_PACKET")?;
    if packet.info.id.is_empty() {
        return Err(DecodeError::InvalidField {
            kind: "DEVICE_PACKET",
            reason: "empty device id",
        });
    }
    Ok(packet)
}

/// Encode a SENSOR_READING
pub fn encode_sensor_reading(reading: &SensorReading) -> Result<Vec<u8>> {
    encode_message(MSG_SENSOR_READING, reading)
}

/// Parse a SENSOR_READING
pub fn parse_sensor_reading(data: &[u8]) -> Result<SensorReading, DecodeError> {
    let reading: SensorReading = decode_payload(data, MSG_SENSOR_READING, "SENSOR_READING")?;
    if reading.device_id.is_empty() {
        return Err(DecodeError::InvalidField {
            kind: "SENSOR_READING",
            reason: "empty device id",
        });
    }
    if !reading.value.is_finite() {
        return Err(DecodeError::InvalidField {
            kind: "SENSOR_READING",
            reason: "value is not a finite number",
        });
    }
    Ok(reading)
}

/// Encode a CLIENT_REQUEST
pub fn encode_client_request(request: &ClientRequest) -> Result<Vec<u8>> {
    encode_message(MSG_CLIENT_REQUEST, request)
}

/// Parse a CLIENT_REQUEST
pub fn parse_client_request(data: &[u8]) -> Result<ClientRequest, DecodeError> {
    decode_payload(data, MSG_CLIENT_REQUEST, "CLIENT_REQUEST")
}

/// Encode a CLIENT_RESPONSE
pub fn encode_client_response(response: &ClientResponse) -> Result<Vec<u8>> {
    encode_message(MSG_CLIENT_RESPONSE, response)
}

/// Parse a CLIENT_RESPONSE
pub fn parse_client_response(data: &[u8]) -> Result<ClientResponse, DecodeError> {
    decode_payload(data, MSG_CLIENT_RESPONSE, "CLIENT_RESPONSE")
}

/// Encode a DEVICE_COMMAND
pub fn encode_device_command(command: &DeviceCommand) -> Result<Vec<u8>> {
    encode_message(MSG_DEVICE_COMMAND, command)
}

/// Parse a DEVICE_COMMAND
pub fn parse_device_command(data: &[u8]) -> Result<DeviceCommand, DecodeError> {
    decode_payload(data, MSG_DEVICE_COMMAND, "DEVICE_COMMAND")
}

// ============================================================================
// TCP Framing
// ============================================================================

/// Read one length-prefixed frame.
///
/// Returns `Ok(None)` when the peer closed cleanly on a frame boundary. A
/// close in the middle of a frame surfaces as `UnexpectedEof`.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Option<Vec<u8>>, SessionError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    if reader.read(&mut header[..1]).await? == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut header[1..]).await?;

    let len = u32::from_be_bytes(header) as usize;
    if len > max_len {
        return Err(DecodeError::FrameTooLarge { len, max: max_len }.into());
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

/// Write one length-prefixed frame and flush it
pub async fn write_frame<W>(writer: &mut W, message: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(message.len()).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "frame exceeds u32 length")
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(message).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lamp_packet(status: &str) -> DevicePacket {
        DevicePacket {
            info: DeviceInfo {
                id: "lamp_01".to_string(),
                kind: DeviceKind::Lamp,
                status: status.to_string(),
            },
            address: "192.168.0.102".to_string(),
            port: 20002,
        }
    }

    #[test]
    fn test_device_packet_encoding() {
        let packet = lamp_packet("OFF");
        let encoded = encode_device_packet(&packet).unwrap();
        assert_eq!(encoded[0], MSG_DEVICE_PACKET);

        let decoded = parse_device_packet(&encoded).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_discover_action() {
        let encoded = encode_discover(&DiscoverRequest::default()).unwrap();
        assert_eq!(parse_discover(&encoded).unwrap().action, "DISCOVER");

        let bogus = encode_message(
            MSG_DISCOVER,
            &DiscoverRequest {
                action: "REBOOT".to_string(),
            },
        )
        .unwrap();
        assert!(matches!(
            parse_discover(&bogus),
            Err(DecodeError::InvalidField { .. })
        ));
    }

    #[test]
    fn test_wrong_type_is_rejected() {
        let encoded = encode_device_packet(&lamp_packet("ON")).unwrap();
        match parse_client_request(&encoded) {
            Err(DecodeError::UnexpectedType { expected, actual }) => {
                assert_eq!(expected, MSG_CLIENT_REQUEST);
                assert_eq!(actual, MSG_DEVICE_PACKET);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_malformed_bytes_are_decode_errors() {
        assert!(matches!(parse_sensor_reading(&[]), Err(DecodeError::Empty)));
        assert!(matches!(
            parse_sensor_reading(&[0x7f, 1, 2]),
            Err(DecodeError::UnknownType(0x7f))
        ));
        assert!(matches!(
            parse_sensor_reading(&[MSG_SENSOR_READING, 0xff, 0x00]),
            Err(DecodeError::Payload { .. })
        ));
    }

    #[test]
    fn test_empty_device_id_rejected() {
        let mut packet = lamp_packet("ON");
        packet.info.id.clear();
        let encoded = encode_device_packet(&packet).unwrap();
        assert!(matches!(
            parse_device_packet(&encoded),
            Err(DecodeError::InvalidField { .. })
        ));

        let reading = SensorReading {
            device_id: String::new(),
            value: 21.0,
        };
        let encoded = encode_sensor_reading(&reading).unwrap();
        assert!(parse_sensor_reading(&encoded).is_err());
    }

    #[test]
    fn test_client_request_variants() {
        let list = encode_client_request(&ClientRequest::ListDevices).unwrap();
        assert_eq!(parse_client_request(&list).unwrap(), ClientRequest::ListDevices);

        let command = ClientRequest::CommandDevice {
            device_id: "lamp_01".to_string(),
            action: "TURN_ON".to_string(),
        };
        let encoded = encode_client_request(&command).unwrap();
        assert_eq!(parse_client_request(&encoded).unwrap(), command);
    }

    #[test]
    fn test_format_reading() {
        assert_eq!(DeviceKind::TempSensor.format_reading(24.9), "24°C");
        assert_eq!(DeviceKind::TempSensor.format_reading(-3.7), "-3°C");
        assert_eq!(DeviceKind::GenericSensor.format_reading(0.5), "0.5");
        assert_eq!(DeviceKind::TempSensor.name(), "TEMP_SENSOR");
    }

    #[tokio::test]
    async fn test_frame_roundtrip_over_stream() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let payload = encode_device_packet(&lamp_packet("ON")).unwrap();

        write_frame(&mut client, &payload).await.unwrap();
        write_frame(&mut client, &payload).await.unwrap();
        drop(client);

        let first = read_frame(&mut server, DEFAULT_MAX_FRAME_LEN).await.unwrap();
        let second = read_frame(&mut server, DEFAULT_MAX_FRAME_LEN).await.unwrap();
        let end = read_frame(&mut server, DEFAULT_MAX_FRAME_LEN).await.unwrap();
        assert_eq!(first.as_deref(), Some(payload.as_slice()));
        assert_eq!(second.as_deref(), Some(payload.as_slice()));
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_frame(&mut client, &[0u8; 64]).await.unwrap();

        match read_frame(&mut server, 16).await {
            Err(SessionError::Decode(DecodeError::FrameTooLarge { len, max })) => {
                assert_eq!(len, 64);
                assert_eq!(max, 16);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_truncated_frame_is_disconnect() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(&[0, 0, 0, 10, 1, 2]).await.unwrap();
        drop(client);

        let err = read_frame(&mut server, DEFAULT_MAX_FRAME_LEN)
            .await
            .unwrap_err();
        assert!(err.is_disconnect());
    }
}
