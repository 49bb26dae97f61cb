//! Control-plane message definitions.
//!
//! Hand-written prost messages; the wire encoding is standard protobuf so
//! non-Rust clients can generate bindings from an equivalent schema. Every
//! control connection exchanges length-delimited [`ClientMessage`] /
//! [`ServerMessage`] envelopes (see [`crate::framing`]); the plugin channel
//! uses [`PluginRequest`] / [`PluginResponse`] the same way.

use std::collections::HashMap;

/// Control protocol version carried in [`ClientMessage::version`].
pub const CONTROL_PROTOCOL_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Envelopes
// ---------------------------------------------------------------------------

/// Envelope for every client → server control message.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClientMessage {
    #[prost(uint32, tag = "1")]
    pub version: u32,
    /// Correlates the response; echoed back verbatim.
    #[prost(uint64, tag = "2")]
    pub request_id: u64,
    /// Bearer token. Empty for auth-flow methods.
    #[prost(string, tag = "3")]
    pub token: String,
    #[prost(
        oneof = "client_message::Body",
        tags = "10, 11, 12, 13, 14, 15, 20, 21, 22, 23, 24, 25, 26"
    )]
    pub body: Option<client_message::Body>,
}

pub mod client_message {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Body {
        // Auth flow (no token required).
        #[prost(message, tag = "10")]
        InitAuth(super::InitAuthRequest),
        #[prost(message, tag = "11")]
        GuestLogin(super::GuestLoginRequest),
        #[prost(message, tag = "12")]
        DiscoverFlows(super::DiscoverFlowsRequest),
        #[prost(message, tag = "13")]
        StartAuth(super::StartAuthRequest),
        #[prost(message, tag = "14")]
        ContinueAuth(super::ContinueAuthRequest),
        #[prost(message, tag = "15")]
        UnitSelect(super::UnitSelectRequest),

        // Session methods (bearer token required).
        #[prost(message, tag = "20")]
        SyncClient(super::SyncRequest),
        #[prost(message, tag = "21")]
        GetServerSettings(super::ServerSettingsRequest),
        #[prost(message, tag = "22")]
        UpdateClientInfo(super::UpdateClientInfoRequest),
        #[prost(message, tag = "23")]
        UpdateRadioInfo(super::UpdateRadioInfoRequest),
        #[prost(message, tag = "24")]
        Disconnect(super::DisconnectRequest),
        #[prost(message, tag = "25")]
        Subscribe(super::SubscribeRequest),
        #[prost(message, tag = "26")]
        HealthCheck(super::HealthCheckRequest),
    }
}

/// Envelope for every server → client control message.
///
/// `request_id` is zero for unsolicited pushes ([`ServerUpdate`]).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServerMessage {
    #[prost(uint64, tag = "1")]
    pub request_id: u64,
    #[prost(
        oneof = "server_message::Body",
        tags = "10, 11, 12, 13, 14, 20, 21, 22, 26, 30, 31"
    )]
    pub body: Option<server_message::Body>,
}

pub mod server_message {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Body {
        #[prost(message, tag = "10")]
        InitAuth(super::InitAuthResponse),
        #[prost(message, tag = "11")]
        GuestLogin(super::GuestLoginResponse),
        #[prost(message, tag = "12")]
        DiscoverFlows(super::DiscoverFlowsResponse),
        /// StartAuth and ContinueAuth share one response shape.
        #[prost(message, tag = "13")]
        AuthStep(super::AuthFlowResponse),
        #[prost(message, tag = "14")]
        UnitSelect(super::UnitSelectResponse),

        #[prost(message, tag = "20")]
        Sync(super::SyncResponse),
        #[prost(message, tag = "21")]
        ServerSettings(super::ServerSettingsResponse),
        /// UpdateClientInfo, UpdateRadioInfo, Disconnect and Subscribe all
        /// answer with a plain status.
        #[prost(message, tag = "22")]
        Status(super::ServerResponse),
        #[prost(message, tag = "26")]
        HealthCheck(super::HealthCheckResponse),

        /// Unsolicited push on a subscribed connection.
        #[prost(message, tag = "30")]
        Update(super::ServerUpdate),
        /// Request-level failure (unknown body, bad token, …).
        #[prost(message, tag = "31")]
        Error(super::ErrorResponse),
    }
}

/// Plain success/error status shared by the mutation methods.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServerResponse {
    #[prost(bool, tag = "1")]
    pub success: bool,
    #[prost(string, tag = "2")]
    pub error_message: String,
}

impl ServerResponse {
    pub fn ok() -> Self {
        Self { success: true, error_message: String::new() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self { success: false, error_message: message.into() }
    }
}

/// Request-level error with a machine-readable code.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ErrorResponse {
    #[prost(enumeration = "ErrorCode", tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
#[repr(i32)]
pub enum ErrorCode {
    Unspecified = 0,
    Unauthenticated = 1,
    PermissionDenied = 2,
    InvalidRequest = 3,
    NotFound = 4,
    Internal = 5,
}

// ---------------------------------------------------------------------------
// Auth flow
// ---------------------------------------------------------------------------

/// Capability bits a client announces at `InitAuth`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
#[repr(i32)]
pub enum ClientFeature {
    Standalone = 0,
    Distributed = 1,
}

/// Distribution mode the server reports back.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
#[repr(i32)]
pub enum DistributionMode {
    Standalone = 0,
    Control = 1,
    Voice = 2,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClientCapabilities {
    /// Client protocol version, e.g. "0.1.0".
    #[prost(string, tag = "1")]
    pub version: String,
    #[prost(enumeration = "ClientFeature", repeated, tag = "2")]
    pub supported_features: Vec<i32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InitAuthRequest {
    #[prost(message, optional, tag = "1")]
    pub capabilities: Option<ClientCapabilities>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InitAuthResponse {
    #[prost(bool, tag = "1")]
    pub success: bool,
    #[prost(string, tag = "2")]
    pub error_message: String,
    #[prost(string, tag = "3")]
    pub client_guid: String,
    #[prost(enumeration = "DistributionMode", tag = "4")]
    pub distribution_mode: i32,
    #[prost(string, repeated, tag = "5")]
    pub available_plugins: Vec<String>,
    #[prost(bool, tag = "6")]
    pub has_guest_login: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GuestLoginRequest {
    #[prost(message, optional, tag = "1")]
    pub capabilities: Option<ClientCapabilities>,
    #[prost(string, tag = "2")]
    pub client_guid: String,
    #[prost(string, tag = "3")]
    pub name: String,
    #[prost(string, tag = "4")]
    pub unit_id: String,
    #[prost(string, tag = "5")]
    pub password: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GuestLoginResponse {
    #[prost(bool, tag = "1")]
    pub success: bool,
    #[prost(string, tag = "2")]
    pub error_message: String,
    #[prost(string, tag = "3")]
    pub token: String,
    #[prost(string, tag = "4")]
    pub client_guid: String,
    #[prost(string, tag = "5")]
    pub coalition: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DiscoverFlowsRequest {
    #[prost(string, tag = "1")]
    pub plugin: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DiscoverFlowsResponse {
    #[prost(bool, tag = "1")]
    pub success: bool,
    #[prost(string, tag = "2")]
    pub error_message: String,
    #[prost(message, repeated, tag = "3")]
    pub flows: Vec<FlowDefinition>,
}

/// One authentication flow a plugin offers.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FlowDefinition {
    #[prost(string, tag = "1")]
    pub flow_id: String,
    #[prost(string, tag = "2")]
    pub display_name: String,
    #[prost(message, repeated, tag = "3")]
    pub steps: Vec<StepDefinition>,
}

/// One step of a flow: which fields the client has to collect.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StepDefinition {
    #[prost(string, tag = "1")]
    pub step_id: String,
    #[prost(string, tag = "2")]
    pub display_name: String,
    #[prost(message, repeated, tag = "3")]
    pub fields: Vec<FieldDefinition>,
    #[prost(map = "string, string", tag = "4")]
    pub metadata: HashMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FieldDefinition {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub label: String,
    /// Input kind hint: "text", "password", "totp", …
    #[prost(string, tag = "3")]
    pub field_type: String,
    /// Validation regex, empty for none.
    #[prost(string, tag = "4")]
    pub regex: String,
    #[prost(string, tag = "5")]
    pub default_value: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StartAuthRequest {
    #[prost(string, tag = "1")]
    pub client_guid: String,
    #[prost(string, tag = "2")]
    pub plugin: String,
    #[prost(string, tag = "3")]
    pub flow_id: String,
    #[prost(map = "string, string", tag = "4")]
    pub first_step_input: HashMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ContinueAuthRequest {
    #[prost(string, tag = "1")]
    pub client_guid: String,
    #[prost(string, tag = "2")]
    pub session_id: String,
    #[prost(map = "string, string", tag = "3")]
    pub step_data: HashMap<String, String>,
}

/// Where a multi-step flow currently stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
#[repr(i32)]
pub enum AuthFlowState {
    Continue = 0,
    Complete = 1,
    Failed = 2,
}

/// Response to `StartAuth` / `ContinueAuth`.
///
/// On `Continue`, `next_step` describes the input to collect next. On
/// `Complete`, the secret plus the selections for the follow-up
/// `UnitSelect` are set.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AuthFlowResponse {
    #[prost(bool, tag = "1")]
    pub success: bool,
    #[prost(string, tag = "2")]
    pub error_message: String,
    #[prost(enumeration = "AuthFlowState", tag = "3")]
    pub state: i32,
    #[prost(string, tag = "4")]
    pub session_id: String,
    #[prost(message, optional, tag = "5")]
    pub next_step: Option<StepDefinition>,
    #[prost(string, tag = "6")]
    pub secret: String,
    #[prost(string, tag = "7")]
    pub player_name: String,
    #[prost(message, repeated, tag = "8")]
    pub available_roles: Vec<RoleSelection>,
    #[prost(message, repeated, tag = "9")]
    pub available_units: Vec<UnitSelection>,
    #[prost(message, repeated, tag = "10")]
    pub available_coalitions: Vec<CoalitionSelection>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UnitSelectRequest {
    #[prost(string, tag = "1")]
    pub client_guid: String,
    #[prost(string, tag = "2")]
    pub secret: String,
    #[prost(string, tag = "3")]
    pub unit_id: String,
    #[prost(uint32, tag = "4")]
    pub role: u32,
    #[prost(string, tag = "5")]
    pub coalition: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UnitSelectResponse {
    #[prost(bool, tag = "1")]
    pub success: bool,
    #[prost(string, tag = "2")]
    pub error_message: String,
    #[prost(string, tag = "3")]
    pub token: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RoleSelection {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(string, tag = "2")]
    pub name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UnitSelection {
    #[prost(string, tag = "1")]
    pub unit_id: String,
    #[prost(string, tag = "2")]
    pub unit_name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CoalitionSelection {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub description: String,
    #[prost(string, tag = "3")]
    pub color: String,
}

// ---------------------------------------------------------------------------
// Session methods
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SyncRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SyncResponse {
    #[prost(bool, tag = "1")]
    pub success: bool,
    #[prost(string, tag = "2")]
    pub error_message: String,
    #[prost(map = "string, message", tag = "3")]
    pub clients: HashMap<String, ClientInfo>,
    #[prost(map = "string, message", tag = "4")]
    pub radios: HashMap<String, RadioInfo>,
    #[prost(message, optional, tag = "5")]
    pub settings: Option<ServerSettings>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClientInfo {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub unit_id: String,
    #[prost(string, tag = "3")]
    pub coalition: String,
    #[prost(uint32, tag = "4")]
    pub role: u32,
    /// Unix seconds of the last registry update.
    #[prost(int64, tag = "5")]
    pub last_update: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RadioInfo {
    #[prost(message, repeated, tag = "1")]
    pub radios: Vec<Radio>,
    #[prost(bool, tag = "2")]
    pub muted: bool,
    #[prost(int64, tag = "3")]
    pub last_update: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Radio {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(uint32, tag = "3")]
    pub frequency_khz: u32,
    #[prost(bool, tag = "4")]
    pub enabled: bool,
    #[prost(bool, tag = "5")]
    pub is_intercom: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServerSettingsRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServerSettingsResponse {
    #[prost(bool, tag = "1")]
    pub success: bool,
    #[prost(string, tag = "2")]
    pub error_message: String,
    #[prost(message, optional, tag = "3")]
    pub settings: Option<ServerSettings>,
}

/// The public slice of the server settings.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServerSettings {
    #[prost(message, repeated, tag = "1")]
    pub coalitions: Vec<CoalitionSelection>,
    #[prost(uint32, repeated, tag = "2")]
    pub test_frequencies: Vec<u32>,
    #[prost(uint32, repeated, tag = "3")]
    pub global_frequencies: Vec<u32>,
    #[prost(uint32, tag = "4")]
    pub max_radios_per_client: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateClientInfoRequest {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub unit_id: String,
    #[prost(string, tag = "3")]
    pub coalition: String,
    #[prost(uint32, tag = "4")]
    pub role: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateRadioInfoRequest {
    #[prost(message, repeated, tag = "1")]
    pub radios: Vec<Radio>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DisconnectRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SubscribeRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HealthCheckRequest {}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
#[repr(i32)]
pub enum ServingStatus {
    Unknown = 0,
    Serving = 1,
    NotServing = 2,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HealthCheckResponse {
    #[prost(enumeration = "ServingStatus", tag = "1")]
    pub status: i32,
    /// Per-service status, keyed "voice" / "control".
    #[prost(map = "string, enumeration(ServingStatus)", tag = "2")]
    pub services: HashMap<String, i32>,
}

/// Push message delivered on subscribed connections.
///
/// `topic` names the event bus topic; only the matching payload fields are
/// populated. Subscribers reconcile through `SyncClient` if they miss one.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServerUpdate {
    #[prost(string, tag = "1")]
    pub topic: String,
    #[prost(map = "string, message", tag = "2")]
    pub clients: HashMap<String, ClientInfo>,
    #[prost(map = "string, message", tag = "3")]
    pub radios: HashMap<String, RadioInfo>,
    #[prost(message, optional, tag = "4")]
    pub settings: Option<ServerSettings>,
    #[prost(message, optional, tag = "5")]
    pub notification: Option<Notification>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Notification {
    #[prost(string, tag = "1")]
    pub title: String,
    #[prost(string, tag = "2")]
    pub message: String,
    /// "success", "warning" or "error".
    #[prost(string, tag = "3")]
    pub severity: String,
}

// ---------------------------------------------------------------------------
// Plugin channel (server acts as client)
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PluginRequest {
    #[prost(uint64, tag = "1")]
    pub request_id: u64,
    #[prost(oneof = "plugin_request::Body", tags = "10, 11, 12, 13, 14, 15")]
    pub body: Option<plugin_request::Body>,
}

pub mod plugin_request {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Body {
        #[prost(message, tag = "10")]
        Configure(super::ConfigureRequest),
        #[prost(message, tag = "11")]
        ConfigureFlow(super::ConfigureFlowRequest),
        #[prost(message, tag = "12")]
        DiscoverFlows(super::FlowDiscoveryRequest),
        #[prost(message, tag = "13")]
        StartAuth(super::PluginStartAuthRequest),
        #[prost(message, tag = "14")]
        ContinueAuth(super::PluginContinueAuthRequest),
        #[prost(message, tag = "15")]
        Ping(super::PingRequest),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PluginResponse {
    #[prost(uint64, tag = "1")]
    pub request_id: u64,
    #[prost(oneof = "plugin_response::Body", tags = "10, 11, 12, 13")]
    pub body: Option<plugin_response::Body>,
}

pub mod plugin_response {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Body {
        /// Answers Configure and ConfigureFlow.
        #[prost(message, tag = "10")]
        Configure(super::ConfigureResponse),
        #[prost(message, tag = "11")]
        DiscoverFlows(super::FlowDiscoveryResponse),
        /// Answers StartAuth and ContinueAuth.
        #[prost(message, tag = "12")]
        AuthStep(super::PluginAuthStepResponse),
        #[prost(message, tag = "13")]
        Pong(super::PongResponse),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConfigureRequest {
    #[prost(string, tag = "1")]
    pub plugin_name: String,
    #[prost(map = "string, string", tag = "2")]
    pub global_settings: HashMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConfigureResponse {
    #[prost(bool, tag = "1")]
    pub success: bool,
    #[prost(string, tag = "2")]
    pub message: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConfigureFlowRequest {
    #[prost(string, tag = "1")]
    pub flow_id: String,
    #[prost(map = "string, string", tag = "2")]
    pub settings: HashMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FlowDiscoveryRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FlowDiscoveryResponse {
    #[prost(message, repeated, tag = "1")]
    pub flows: Vec<FlowDefinition>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PluginStartAuthRequest {
    #[prost(string, tag = "1")]
    pub flow_id: String,
    #[prost(map = "string, string", tag = "2")]
    pub first_step_input: HashMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PluginContinueAuthRequest {
    #[prost(string, tag = "1")]
    pub session_id: String,
    #[prost(map = "string, string", tag = "2")]
    pub step_data: HashMap<String, String>,
}

/// A plugin's answer to StartAuth / ContinueAuth.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PluginAuthStepResponse {
    #[prost(enumeration = "AuthFlowState", tag = "1")]
    pub state: i32,
    /// Opaque session handle owned by the plugin.
    #[prost(string, tag = "2")]
    pub session_id: String,
    #[prost(message, optional, tag = "3")]
    pub next_step: Option<StepDefinition>,
    /// Failure message when `state == Failed`.
    #[prost(string, tag = "4")]
    pub message: String,
    #[prost(string, tag = "5")]
    pub player_name: String,
    #[prost(message, repeated, tag = "6")]
    pub available_units: Vec<UnitSelection>,
    #[prost(uint32, repeated, tag = "7")]
    pub available_roles: Vec<u32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PingRequest {
    #[prost(uint64, tag = "1")]
    pub nonce: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PongResponse {
    #[prost(uint64, tag = "1")]
    pub nonce: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_client_message_roundtrip() {
        let msg = ClientMessage {
            version: CONTROL_PROTOCOL_VERSION,
            request_id: 7,
            token: "bearer".into(),
            body: Some(client_message::Body::GuestLogin(GuestLoginRequest {
                capabilities: Some(ClientCapabilities {
                    version: "0.1.0".into(),
                    supported_features: vec![ClientFeature::Standalone as i32],
                }),
                client_guid: String::new(),
                name: "Alice".into(),
                unit_id: "AB1".into(),
                password: "pw".into(),
            })),
        };

        let bytes = msg.encode_to_vec();
        let decoded = ClientMessage::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_server_update_roundtrip() {
        let mut clients = HashMap::new();
        clients.insert(
            "id-1".to_string(),
            ClientInfo {
                name: "Bob".into(),
                unit_id: "XR2".into(),
                coalition: "red".into(),
                role: 1,
                last_update: 1_700_000_000,
            },
        );

        let msg = ServerMessage {
            request_id: 0,
            body: Some(server_message::Body::Update(ServerUpdate {
                topic: "clients/changed".into(),
                clients,
                radios: HashMap::new(),
                settings: None,
                notification: None,
            })),
        };

        let decoded = ServerMessage::decode(msg.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_unknown_fields_are_skipped() {
        // A newer peer may add fields; decoding must not fail.
        let msg = PingRequest { nonce: 99 };
        let mut bytes = msg.encode_to_vec();
        // Field 15, varint 1 — unknown to PingRequest.
        bytes.extend_from_slice(&[0x78, 0x01]);
        let decoded = PingRequest::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded.nonce, 99);
    }
}
