//! Relay envelope shape (spec.md §6).

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeFrom {
    #[serde(rename = "deviceId")]
    pub device_id: Value,
    #[serde(rename = "deviceType", skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

/// A single JSON-object frame on the relay's duplex channel. `from` is
/// injected by the relay on inbound frames; the core must never trust a
/// client-supplied `from` and never sets one itself on outbound frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broadcast: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<EnvelopeFrom>,
}

impl Envelope {
    pub fn broadcast_all(kind: &str, payload: Value) -> Self {
        Self {
            kind: kind.to_string(),
            payload: Some(payload),
            to: None,
            broadcast: Some(Value::String("all".into())),
            from: None,
        }
    }

    pub fn to_device(kind: &str, payload: Value, device_id: &str) -> Self {
        Self {
            kind: kind.to_string(),
            payload: Some(payload),
            to: Some(Value::String(device_id.to_string())),
            broadcast: None,
            from: None,
        }
    }

    pub fn auth(pylon_id: u32, device_name: Option<String>) -> Self {
        Self {
            kind: "auth".to_string(),
            payload: Some(serde_json::json!({
                "deviceId": pylon_id,
                "deviceType": "pylon",
                "deviceName": device_name,
            })),
            to: None,
            broadcast: None,
            from: None,
        }
    }

    pub fn reply_to(&self, kind: &str, payload: Value) -> Option<Self> {
        let from = self.from.as_ref()?;
        Some(Self::to_device(kind, payload, &device_id_as_string(&from.device_id)))
    }
}

/// `deviceId` travels as either a JSON string or number depending on the
/// caller; normalize to a plain string for use as a viewer-set key.
pub fn device_id_as_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
