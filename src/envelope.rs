//! Wire-level envelope types exchanged with the hub.
//!
//! One `Envelope` is one message unit on the duplex channel. Field names are
//! part of the wire contract and must match every other worker implementation
//! bit-exactly.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Recipient id of the hub itself (registration traffic).
pub const HUB_RECIPIENT: &str = "hub";

/// Capability name used on the registration envelope.
pub const REGISTRATION_CAPABILITY: &str = "system";

/// Reserved metadata key: correlation id carried by a `RESPONSE`.
pub const REQUEST_ID_KEY: &str = "request_id";

/// Reserved metadata key: `success` or `failed` on a `RESPONSE`.
pub const STATUS_KEY: &str = "status";

/// Metadata key naming the target capability on a `CALL`.
pub const CAPABILITY_KEY: &str = "capability";

pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_FAILED: &str = "failed";

/// Message kind, discriminating the three multiplexed flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvelopeKind {
    /// First envelope on the wire; payload is a [`RegistrationPayload`].
    Register,
    /// Inbound service request relayed by the hub.
    Request,
    /// Answer to a `REQUEST` or `CALL`, correlated via `metadata.request_id`.
    Response,
    /// Worker-to-worker call awaiting a correlated `RESPONSE`.
    Call,
    /// Peer-to-peer notification with no correlated reply.
    Direct,
}

/// One message unit exchanged over the channel.
///
/// `payload` is an opaque serialized structure (typically a JSON object);
/// parsing it is the receiver's concern, not the envelope's.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique within the connection's lifetime, assigned by the creator.
    pub id: String,
    pub kind: EnvelopeKind,
    pub sender: String,
    pub recipient: String,
    /// Capability this envelope targets or answers.
    pub capability: String,
    pub payload: String,
    /// Creation time, RFC 3339. Informational only.
    pub timestamp: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Envelope {
    fn new(
        id: String,
        kind: EnvelopeKind,
        sender: &str,
        recipient: &str,
        capability: &str,
        payload: String,
    ) -> Self {
        Self {
            id,
            kind,
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            capability: capability.to_string(),
            payload,
            timestamp: chrono::Utc::now().to_rfc3339(),
            metadata: HashMap::new(),
        }
    }

    pub fn fresh_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// Registration envelope, always the first bytes on the wire.
    pub fn register(sender: &str, payload: String) -> Self {
        Self::new(
            Self::fresh_id(),
            EnvelopeKind::Register,
            sender,
            HUB_RECIPIENT,
            REGISTRATION_CAPABILITY,
            payload,
        )
    }

    /// Worker-to-worker call. The caller supplies the id because it must be
    /// registered in the correlation table before the envelope is enqueued.
    pub fn call(
        correlation_id: String,
        sender: &str,
        recipient: &str,
        capability: &str,
        payload: String,
    ) -> Self {
        let mut env = Self::new(
            correlation_id,
            EnvelopeKind::Call,
            sender,
            recipient,
            capability,
            payload,
        );
        env.metadata
            .insert(CAPABILITY_KEY.to_string(), capability.to_string());
        env
    }

    /// Reply to a `REQUEST` or `CALL`, correlated via `request_id`.
    pub fn response(
        sender: &str,
        recipient: &str,
        capability: &str,
        payload: String,
        request_id: &str,
        status: &str,
    ) -> Self {
        let mut env = Self::new(
            Self::fresh_id(),
            EnvelopeKind::Response,
            sender,
            recipient,
            capability,
            payload,
        );
        env.metadata
            .insert(REQUEST_ID_KEY.to_string(), request_id.to_string());
        env.metadata
            .insert(STATUS_KEY.to_string(), status.to_string());
        env
    }

    /// Fire-and-forget peer notification.
    pub fn direct(sender: &str, recipient: &str, capability: &str, payload: String) -> Self {
        Self::new(
            Self::fresh_id(),
            EnvelopeKind::Direct,
            sender,
            recipient,
            capability,
            payload,
        )
    }

    /// Correlation id on a `RESPONSE`, if the responder threaded one.
    pub fn request_id(&self) -> Option<&str> {
        self.metadata.get(REQUEST_ID_KEY).map(String::as_str)
    }

    pub fn status(&self) -> Option<&str> {
        self.metadata.get(STATUS_KEY).map(String::as_str)
    }

    pub fn is_failed(&self) -> bool {
        self.status() == Some(STATUS_FAILED)
    }
}

/// Structured error payload for `status=failed` responses.
pub fn failure_payload(error: &str) -> String {
    serde_json::json!({ "error": error, "status": STATUS_FAILED }).to_string()
}

/// Capability metadata advertised to the hub at registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: String,
    pub output_schema: String,
    pub http_method: String,
    pub accepts_file: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_field_name: Option<String>,
}

impl CapabilityDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            input_schema: "{}".to_string(),
            output_schema: "{}".to_string(),
            http_method: "POST".to_string(),
            accepts_file: false,
            file_field_name: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn input_schema(mut self, schema: impl Into<String>) -> Self {
        self.input_schema = schema.into();
        self
    }

    pub fn output_schema(mut self, schema: impl Into<String>) -> Self {
        self.output_schema = schema.into();
        self
    }

    pub fn http_method(mut self, method: impl Into<String>) -> Self {
        self.http_method = method.into();
        self
    }

    pub fn accepts_file(mut self, field_name: impl Into<String>) -> Self {
        self.accepts_file = true;
        self.file_field_name = Some(field_name.into());
        self
    }
}

/// Payload of the `REGISTER` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationPayload {
    pub worker_id: String,
    pub worker_type: String,
    pub capabilities: Vec<CapabilityDescriptor>,
    pub metadata: HashMap<String, String>,
}

impl RegistrationPayload {
    pub fn new(
        worker_id: impl Into<String>,
        worker_type: impl Into<String>,
        capabilities: Vec<CapabilityDescriptor>,
        extra_metadata: HashMap<String, String>,
    ) -> Self {
        let mut metadata = HashMap::new();
        metadata.insert("version".to_string(), "1.0.0".to_string());
        metadata.insert("sdk_version".to_string(), "2.0.0".to_string());
        metadata.extend(extra_metadata);
        Self {
            worker_id: worker_id.into(),
            worker_type: worker_type.into(),
            capabilities,
            metadata,
        }
    }
}
