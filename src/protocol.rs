//! Data model and wire format shared with the remote volume server
//!
//! Requests travel as text frames of the form
//! `{"<operation>": {"id": .., "volume": .., "request_id": ".."}}`, or as the
//! bare JSON string `"<operation>"` when nothing needs to be attached.
//! Responses come back as `{"type": "<request id | operation>", "data": ..}`
//! and unsolicited pushes as `{"event": "update", "payload": {..}}`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

use crate::constants::{MAX_PORT, MIN_PORT, UPDATE_EVENT};
use crate::error::{ProtocolError, ValidationError};

/// Opaque name of a playback device
pub type DeviceIdentifier = String;

/// Process/session id of an application. May be reused after the process exits.
pub type AppIdentifier = u32;

// ============================================================================
// Volume
// ============================================================================

/// Volume as a fraction in `[0, 1]`.
///
/// Construction rejects anything outside the range (and NaN); values are never
/// clamped. Use [`VolumePercent::from_percent`] at the UI boundary when the
/// input is a `0..=100` slider value.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
#[serde(try_from = "f32", into = "f32")]
pub struct VolumePercent(f32);

impl VolumePercent {
    pub const MIN: f32 = 0.0;
    pub const MAX: f32 = 1.0;
    pub const ZERO: VolumePercent = VolumePercent(0.0);
    pub const FULL: VolumePercent = VolumePercent(1.0);

    /// Validate a fraction in `[0, 1]`
    pub fn new(value: f32) -> Result<Self, ValidationError> {
        if !(Self::MIN..=Self::MAX).contains(&value) {
            return Err(ValidationError::VolumeOutOfRange(value));
        }
        Ok(Self(value))
    }

    /// Validate a `0..=100` percentage and convert it to a fraction
    pub fn from_percent(percent: f32) -> Result<Self, ValidationError> {
        if !(0.0..=100.0).contains(&percent) {
            return Err(ValidationError::VolumeOutOfRange(percent));
        }
        Self::new(percent / 100.0)
    }

    pub fn value(self) -> f32 {
        self.0
    }

    /// Value scaled to `0..=100`
    pub fn as_percent(self) -> f32 {
        self.0 * 100.0
    }
}

impl TryFrom<f32> for VolumePercent {
    type Error = ValidationError;

    fn try_from(value: f32) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<VolumePercent> for f32 {
    fn from(value: VolumePercent) -> Self {
        value.0
    }
}

impl fmt::Display for VolumePercent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.0}%", self.as_percent())
    }
}

// ============================================================================
// Entities
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionType {
    Application,
    Device,
    System,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionDirection {
    Render,
    Capture,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AudioVolume {
    pub current: VolumePercent,
    pub muted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub id: AppIdentifier,
    pub name: String,
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioApplication {
    pub process: ProcessInfo,
    pub session_type: SessionType,
    pub direction: SessionDirection,
    pub volume: AudioVolume,
    #[serde(default)]
    pub sound_playing: bool,
    /// Device the session renders to, when the server reports it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<DeviceIdentifier>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioDevice {
    pub id: DeviceIdentifier,
    pub name: String,
    pub friendly_name: String,
    pub direction: SessionDirection,
    pub is_default: bool,
    pub volume: AudioVolume,
}

// ============================================================================
// Update pushes
// ============================================================================

/// Entity an update refers to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "lowercase")]
pub enum Identifier {
    App(AppIdentifier),
    Device(DeviceIdentifier),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityState {
    Disconnect,
    Created,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ChangeType {
    AudioVolume { volume: VolumePercent, mute: bool },
    IconPathChange { path: String },
    StateChange { state: EntityState },
}

/// Discriminant of [`ChangeType`], used to filter subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    AudioVolume,
    IconPath,
    State,
}

impl ChangeType {
    pub fn kind(&self) -> ChangeKind {
        match self {
            ChangeType::AudioVolume { .. } => ChangeKind::AudioVolume,
            ChangeType::IconPathChange { .. } => ChangeKind::IconPath,
            ChangeType::StateChange { .. } => ChangeKind::State,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateChange {
    pub id: Identifier,
    pub change: ChangeType,
}

// ============================================================================
// Server address
// ============================================================================

/// Host and port of a volume server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerAddress {
    pub url: String,
    pub port: u16,
}

impl ServerAddress {
    pub fn new(url: impl Into<String>, port: i64) -> Result<Self, ValidationError> {
        let url = url.into().trim().to_string();
        if url.is_empty() {
            return Err(ValidationError::EmptyAddress);
        }
        Ok(Self {
            url,
            port: validate_port(port)?,
        })
    }

    /// Parse `host:port`, tolerating a leading scheme such as `ws://`
    pub fn parse(input: &str) -> Result<Self, ValidationError> {
        let trimmed = input.trim();
        let without_scheme = trimmed
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(trimmed);
        let without_path = without_scheme.split('/').next().unwrap_or_default();

        let (host, port) = without_path
            .rsplit_once(':')
            .ok_or_else(|| ValidationError::InvalidPort(input.to_string()))?;
        let port = parse_port(port)?;
        Self::new(host.trim_start_matches('[').trim_end_matches(']'), port as i64)
    }

    /// WebSocket URL the socket backend dials
    pub fn ws_url(&self) -> String {
        if self.url.contains(':') {
            format!("ws://[{}]:{}", self.url, self.port)
        } else {
            format!("ws://{}:{}", self.url, self.port)
        }
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.url, self.port)
    }
}

/// Check a port against `[1024, 65536)`
pub fn validate_port(port: i64) -> Result<u16, ValidationError> {
    if port < MIN_PORT as i64 || port >= MAX_PORT as i64 {
        return Err(ValidationError::PortOutOfRange(port));
    }
    Ok(port as u16)
}

/// Parse user input into a validated port
pub fn parse_port(input: &str) -> Result<u16, ValidationError> {
    let port: i64 = input
        .trim()
        .parse()
        .map_err(|_| ValidationError::InvalidPort(input.to_string()))?;
    validate_port(port)
}

// ============================================================================
// Operations
// ============================================================================

/// Named operations understood by the volume server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    GetAllDevices,
    DeviceGetVolume,
    DeviceSetVolume,
    DeviceMute,
    DeviceUnmute,
    GetApplication,
    ApplicationGetIcon,
    ApplicationGetVolume,
    ApplicationSetVolume,
    ApplicationMute,
    ApplicationUnmute,
    GetDeviceApplications,
    GetPlaybackDevices,
    DiscoverServerAddress,
}

impl Operation {
    pub const ALL: [Operation; 14] = [
        Operation::GetAllDevices,
        Operation::DeviceGetVolume,
        Operation::DeviceSetVolume,
        Operation::DeviceMute,
        Operation::DeviceUnmute,
        Operation::GetApplication,
        Operation::ApplicationGetIcon,
        Operation::ApplicationGetVolume,
        Operation::ApplicationSetVolume,
        Operation::ApplicationMute,
        Operation::ApplicationUnmute,
        Operation::GetDeviceApplications,
        Operation::GetPlaybackDevices,
        Operation::DiscoverServerAddress,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Operation::GetAllDevices => "get_all_devices",
            Operation::DeviceGetVolume => "device_get_volume",
            Operation::DeviceSetVolume => "device_set_volume",
            Operation::DeviceMute => "device_mute",
            Operation::DeviceUnmute => "device_unmute",
            Operation::GetApplication => "get_application",
            Operation::ApplicationGetIcon => "application_get_icon",
            Operation::ApplicationGetVolume => "application_get_volume",
            Operation::ApplicationSetVolume => "application_set_volume",
            Operation::ApplicationMute => "application_mute",
            Operation::ApplicationUnmute => "application_unmute",
            Operation::GetDeviceApplications => "get_device_applications",
            Operation::GetPlaybackDevices => "get_playback_devices",
            Operation::DiscoverServerAddress => "discover_server_address",
        }
    }

    /// Commands the server executes without answering
    pub fn expects_response(self) -> bool {
        !matches!(
            self,
            Operation::DeviceSetVolume
                | Operation::DeviceMute
                | Operation::DeviceUnmute
                | Operation::ApplicationSetVolume
                | Operation::ApplicationMute
                | Operation::ApplicationUnmute
        )
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Operation::ALL
            .into_iter()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownOperation(s.to_string()))
    }
}

// ============================================================================
// Requests
// ============================================================================

/// An outgoing operation with its parameters
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub operation: Operation,
    pub params: Map<String, Value>,
    pub request_id: Option<Uuid>,
}

impl Request {
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            params: Map::new(),
            request_id: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<Value>) -> Self {
        self.params.insert("id".into(), id.into());
        self
    }

    pub fn with_volume(mut self, volume: VolumePercent) -> Self {
        self.params.insert("volume".into(), Value::from(volume.value()));
        self
    }

    pub fn with_request_id(mut self, request_id: Uuid) -> Self {
        self.request_id = Some(request_id);
        self
    }

    /// Parameter object without the request id (the native invocation shape)
    pub fn params_value(&self) -> Value {
        Value::Object(self.params.clone())
    }

    /// Encode as a text frame
    pub fn encode(&self) -> String {
        let mut params = self.params.clone();
        if let Some(request_id) = self.request_id {
            params.insert("request_id".into(), Value::String(request_id.to_string()));
        }

        let value = if params.is_empty() {
            Value::String(self.operation.as_str().to_string())
        } else {
            let mut outer = Map::new();
            outer.insert(self.operation.as_str().to_string(), Value::Object(params));
            Value::Object(outer)
        };
        value.to_string()
    }

    /// Decode either frame shape. Used by the server side of tests and demos.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        match serde_json::from_str::<Value>(text)? {
            Value::String(name) => Ok(Request::new(name.parse()?)),
            Value::Object(outer) if outer.len() == 1 => {
                let (name, body) = outer
                    .into_iter()
                    .next()
                    .ok_or_else(|| ProtocolError::Malformed(text.to_string()))?;
                let operation: Operation = name.parse()?;
                let mut params = match body {
                    Value::Object(params) => params,
                    Value::Null => Map::new(),
                    other => {
                        return Err(ProtocolError::UnexpectedPayload {
                            operation: name,
                            reason: format!("expected object, got {}", other),
                        })
                    }
                };
                let request_id = match params.remove("request_id") {
                    Some(Value::String(id)) => Some(
                        Uuid::parse_str(&id).map_err(|e| ProtocolError::Malformed(e.to_string()))?,
                    ),
                    _ => None,
                };
                Ok(Request {
                    operation,
                    params,
                    request_id,
                })
            }
            _ => Err(ProtocolError::Malformed(text.to_string())),
        }
    }
}

// ============================================================================
// Inbound frames
// ============================================================================

/// Parsed inbound text frame
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Reply addressed to a request id, or to an operation name
    Response { channel: String, data: Value },
    /// Server-pushed change
    Update(UpdateChange),
    /// Any other named event; ignored by the bridge
    Event { name: String },
}

#[derive(Deserialize)]
struct RawInbound {
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    payload: Option<Value>,
    #[serde(default, rename = "type", alias = "channel")]
    channel: Option<String>,
    #[serde(default)]
    data: Value,
}

/// Parse a text frame that is not a ping/pong control frame
pub fn parse_inbound(text: &str) -> Result<Inbound, ProtocolError> {
    let raw: RawInbound = serde_json::from_str(text)?;

    if let Some(name) = raw.event {
        if name != UPDATE_EVENT {
            return Ok(Inbound::Event { name });
        }
        let payload = raw
            .payload
            .ok_or_else(|| ProtocolError::Malformed("update without payload".into()))?;
        let change: UpdateChange = serde_json::from_value(payload)?;
        return Ok(Inbound::Update(change));
    }

    match raw.channel {
        Some(channel) => Ok(Inbound::Response {
            channel,
            data: raw.data,
        }),
        None => Err(ProtocolError::Malformed(text.to_string())),
    }
}

/// Ping/Pong as a JSON text frame, e.g. `{"type": "Pong"}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlKind {
    Ping,
    Pong,
}

#[derive(Deserialize)]
struct RawControl {
    #[serde(rename = "type")]
    kind: ControlKind,
}

/// Detect a textual control frame without treating it as a payload
pub fn detect_control(text: &str) -> Option<ControlKind> {
    if !(text.contains("\"Pong\"") || text.contains("\"Ping\"")) {
        return None;
    }
    serde_json::from_str::<RawControl>(text).ok().map(|c| c.kind)
}

/// Encode a reply addressed to `channel`
pub fn encode_response(channel: &str, data: &impl Serialize) -> Result<String, ProtocolError> {
    let data = serde_json::to_value(data)?;
    Ok(serde_json::json!({ "type": channel, "data": data }).to_string())
}

/// Encode an unsolicited update push
pub fn encode_update(change: &UpdateChange) -> Result<String, ProtocolError> {
    let payload = serde_json::to_value(change)?;
    Ok(serde_json::json!({ "event": UPDATE_EVENT, "payload": payload }).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_volume_bounds() {
        assert!(VolumePercent::new(0.0).is_ok());
        assert!(VolumePercent::new(1.0).is_ok());
        assert_eq!(
            VolumePercent::new(1.5),
            Err(ValidationError::VolumeOutOfRange(1.5))
        );
        assert!(VolumePercent::new(-0.01).is_err());
        assert!(VolumePercent::new(f32::NAN).is_err());
    }

    #[test]
    fn test_volume_percent_conversion() {
        let v = VolumePercent::from_percent(80.0).unwrap();
        assert!((v.value() - 0.8).abs() < f32::EPSILON);
        assert!((v.as_percent() - 80.0).abs() < 1e-4);
        assert!(VolumePercent::from_percent(101.0).is_err());
    }

    #[test]
    fn test_volume_deserialize_rejects_out_of_range() {
        assert!(serde_json::from_str::<VolumePercent>("0.25").is_ok());
        assert!(serde_json::from_str::<VolumePercent>("2.0").is_err());
    }

    proptest! {
        #[test]
        fn prop_volume_never_escapes_range(v in -10.0f32..10.0) {
            match VolumePercent::new(v) {
                Ok(vol) => prop_assert!((0.0..=1.0).contains(&vol.value())),
                Err(_) => prop_assert!(!(0.0..=1.0).contains(&v)),
            }
        }
    }

    #[test]
    fn test_port_validation() {
        assert_eq!(validate_port(1024), Ok(1024));
        assert_eq!(validate_port(65535), Ok(65535));
        assert!(validate_port(1023).is_err());
        assert!(validate_port(65536).is_err());
        assert!(parse_port("abc").is_err());
        assert_eq!(parse_port(" 9002 "), Ok(9002));
    }

    #[test]
    fn test_server_address_parse() {
        let addr = ServerAddress::parse("192.168.1.10:9002").unwrap();
        assert_eq!(addr.url, "192.168.1.10");
        assert_eq!(addr.port, 9002);
        assert_eq!(addr.ws_url(), "ws://192.168.1.10:9002");

        let addr = ServerAddress::parse("ws://localhost:9001/").unwrap();
        assert_eq!(addr.url, "localhost");

        assert!(ServerAddress::parse("localhost").is_err());
        assert!(ServerAddress::parse(":9002").is_err());
        assert!(ServerAddress::parse("host:80").is_err());
    }

    #[test]
    fn test_request_encoding() {
        let id = Uuid::new_v4();
        let text = Request::new(Operation::DeviceSetVolume)
            .with_id("spk1")
            .with_volume(VolumePercent::new(0.5).unwrap())
            .with_request_id(id)
            .encode();
        let value: Value = serde_json::from_str(&text).unwrap();
        let body = &value["device_set_volume"];
        assert_eq!(body["id"], "spk1");
        assert_eq!(body["volume"], 0.5);
        assert_eq!(body["request_id"], id.to_string());

        let bare = Request::new(Operation::GetPlaybackDevices).encode();
        assert_eq!(bare, "\"get_playback_devices\"");
    }

    #[test]
    fn test_request_decode_both_shapes() {
        let req = Request::decode("\"get_all_devices\"").unwrap();
        assert_eq!(req.operation, Operation::GetAllDevices);
        assert!(req.request_id.is_none());

        let id = Uuid::new_v4();
        let text = Request::new(Operation::ApplicationMute)
            .with_id(1234u32)
            .with_request_id(id)
            .encode();
        let req = Request::decode(&text).unwrap();
        assert_eq!(req.operation, Operation::ApplicationMute);
        assert_eq!(req.request_id, Some(id));
        assert_eq!(req.params["id"], 1234);

        assert!(matches!(
            Request::decode("\"reboot\""),
            Err(ProtocolError::UnknownOperation(_))
        ));
    }

    #[test]
    fn test_parse_update() {
        let text = r#"{"event":"update","payload":{"id":{"type":"app","content":1234},"change":{"kind":"audioVolume","volume":0.3,"mute":true}}}"#;
        let inbound = parse_inbound(text).unwrap();
        assert_eq!(
            inbound,
            Inbound::Update(UpdateChange {
                id: Identifier::App(1234),
                change: ChangeType::AudioVolume {
                    volume: VolumePercent::new(0.3).unwrap(),
                    mute: true,
                },
            })
        );

        let text = r#"{"event":"update","payload":{"id":{"type":"device","content":"spk1"},"change":{"kind":"stateChange","state":"disconnect"}}}"#;
        match parse_inbound(text).unwrap() {
            Inbound::Update(change) => {
                assert_eq!(change.id, Identifier::Device("spk1".into()));
                assert_eq!(change.change.kind(), ChangeKind::State);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_response_type_and_channel() {
        let inbound = parse_inbound(r#"{"type":"abc","data":[1,2]}"#).unwrap();
        assert_eq!(
            inbound,
            Inbound::Response {
                channel: "abc".into(),
                data: serde_json::json!([1, 2])
            }
        );
        let inbound = parse_inbound(r#"{"channel":"get_playback_devices","data":[]}"#).unwrap();
        assert!(matches!(inbound, Inbound::Response { channel, .. } if channel == "get_playback_devices"));
    }

    #[test]
    fn test_parse_malformed() {
        assert!(parse_inbound("not json").is_err());
        assert!(parse_inbound(r#"{"data":1}"#).is_err());
        assert!(parse_inbound(r#"{"event":"update","payload":{"id":5}}"#).is_err());
    }

    #[test]
    fn test_detect_control() {
        assert_eq!(detect_control(r#"{"type":"Pong"}"#), Some(ControlKind::Pong));
        assert_eq!(detect_control(r#"{"type":"Ping","data":[]}"#), Some(ControlKind::Ping));
        assert_eq!(detect_control(r#"{"type":"abc","data":"Pong"}"#), None);
        assert_eq!(detect_control(r#"{"event":"update"}"#), None);
    }

    #[test]
    fn test_device_json_shape() {
        let text = r#"{"id":"spk1","name":"Speakers","friendly_name":"Speakers","direction":"Render","is_default":true,"volume":{"current":0.8,"muted":false}}"#;
        let device: AudioDevice = serde_json::from_str(text).unwrap();
        assert_eq!(device.direction, SessionDirection::Render);
        assert!((device.volume.current.value() - 0.8).abs() < f32::EPSILON);
    }
}
