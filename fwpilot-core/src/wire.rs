/// Observer wire messages
///
/// Every message is a key with an optional payload. The payload shape is
/// carried explicitly in the `shape` tag:
///
/// ```json
/// {"shape":"none","key":"Detecting"}
/// {"shape":"scalar","key":"progress","value":50}
/// {"shape":"structured","key":"productDetails","value":{"productName":"Beacon One"}}
/// {"shape":"list","key":"devices","values":["COM3","COM9"]}
/// ```
///
/// Outbound, a bare key is a state change and the other shapes carry data.
/// Inbound, a bare key is a workflow command and the other shapes carry
/// settings.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

use crate::commands::{Command, Input, Setting};
use crate::state::WorkflowState;

pub const DEVICE_KEY: &str = "device";
pub const DEVICES_KEY: &str = "devices";
pub const UTILITY_VERSION_KEY: &str = "utilityVersion";
pub const PRODUCT_DETAILS_KEY: &str = "productDetails";
pub const FIRMWARE_VERSIONS_KEY: &str = "firmwareVersions";
pub const PACKAGE_KEY: &str = "package";
pub const PROGRESS_KEY: &str = "progress";

#[derive(Error, Debug)]
pub enum WireError {
    #[error("Malformed wire message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Unknown workflow command: {0}")]
    UnknownCommand(String),
    #[error("Unknown setting: {0}")]
    UnknownSetting(String),
    #[error("Bad payload for '{key}': {reason}")]
    BadPayload { key: String, reason: String },
}

pub type Result<T> = std::result::Result<T, WireError>;

/// Scalar payload value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Number(i64),
    Text(String),
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Scalar::Text(value.to_string())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Scalar::Text(value)
    }
}

impl From<u8> for Scalar {
    fn from(value: u8) -> Self {
        Scalar::Number(value.into())
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Scalar::Bool(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "lowercase")]
pub enum WireMessage {
    #[serde(rename = "none")]
    Bare { key: String },
    Scalar { key: String, value: Scalar },
    Structured { key: String, value: serde_json::Value },
    List { key: String, values: Vec<serde_json::Value> },
}

impl WireMessage {
    pub fn state(state: WorkflowState) -> Self {
        WireMessage::Bare {
            key: state.as_str().to_string(),
        }
    }

    pub fn command(command: Command) -> Self {
        WireMessage::Bare {
            key: command.as_str().to_string(),
        }
    }

    pub fn scalar(key: &str, value: impl Into<Scalar>) -> Self {
        WireMessage::Scalar {
            key: key.to_string(),
            value: value.into(),
        }
    }

    /// Structured payload; a value that does not serialise becomes `null`
    pub fn structured<T: Serialize>(key: &str, value: &T) -> Self {
        let value = serde_json::to_value(value).unwrap_or_else(|e| {
            log::error!("Cannot serialise '{}' payload: {}", key, e);
            serde_json::Value::Null
        });
        WireMessage::Structured {
            key: key.to_string(),
            value,
        }
    }

    pub fn list<T: Serialize>(key: &str, values: &[T]) -> Self {
        WireMessage::List {
            key: key.to_string(),
            values: values
                .iter()
                .filter_map(|value| serde_json::to_value(value).ok())
                .collect(),
        }
    }

    pub fn key(&self) -> &str {
        match self {
            WireMessage::Bare { key }
            | WireMessage::Scalar { key, .. }
            | WireMessage::Structured { key, .. }
            | WireMessage::List { key, .. } => key,
        }
    }

    pub fn to_json_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json_line(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line.trim())?)
    }
}

/// Outbound half of the observer transport
///
/// Handed to the orchestrator at construction; the orchestrator never
/// reaches for a process-wide channel.
pub trait ObserverTransport: Send {
    fn send(&mut self, message: WireMessage);
}

/// Transport that forwards messages into a tokio channel
pub struct ChannelTransport {
    sender: UnboundedSender<WireMessage>,
}

impl ChannelTransport {
    pub fn new(sender: UnboundedSender<WireMessage>) -> Self {
        Self { sender }
    }
}

impl ObserverTransport for ChannelTransport {
    fn send(&mut self, message: WireMessage) {
        if self.sender.send(message).is_err() {
            log::warn!("Observer transport closed, dropping message");
        }
    }
}

/// Decode an inbound observer message into an event loop input
pub fn decode(message: WireMessage) -> Result<Input> {
    match message {
        WireMessage::Bare { key } => decode_bare(&key),
        WireMessage::Scalar { key, value } => decode_scalar(&key, value),
        WireMessage::Structured { key, value } => decode_structured(&key, value),
        WireMessage::List { key, values } => decode_list(&key, values),
    }
}

fn decode_bare(key: &str) -> Result<Input> {
    key.parse::<Command>()
        .map(Input::Command)
        .map_err(WireError::UnknownCommand)
}

fn decode_scalar(key: &str, value: Scalar) -> Result<Input> {
    match (key, value) {
        (DEVICE_KEY, Scalar::Text(device)) => Ok(device_setting(device)),
        (DEVICE_KEY, other) => Err(bad_payload(key, format!("expected a device id, got {:?}", other))),
        _ => Err(WireError::UnknownSetting(key.to_string())),
    }
}

/// `{"id": ..}` object form of a setting
fn decode_structured(key: &str, value: serde_json::Value) -> Result<Input> {
    match key {
        DEVICE_KEY => match value.get("id") {
            Some(serde_json::Value::String(device)) => Ok(device_setting(device.clone())),
            Some(serde_json::Value::Null) | None => Ok(Input::Setting(Setting::Device(None))),
            Some(other) => Err(bad_payload(key, format!("expected a string id, got {}", other))),
        },
        _ => Err(WireError::UnknownSetting(key.to_string())),
    }
}

fn decode_list(key: &str, values: Vec<serde_json::Value>) -> Result<Input> {
    match key {
        DEVICE_KEY => Err(bad_payload(key, format!("expected one device, got a list of {}", values.len()))),
        _ => Err(WireError::UnknownSetting(key.to_string())),
    }
}

fn device_setting(device: String) -> Input {
    let device = device.trim().to_string();
    Input::Setting(Setting::Device(if device.is_empty() { None } else { Some(device) }))
}

fn bad_payload(key: &str, reason: String) -> WireError {
    WireError::BadPayload {
        key: key.to_string(),
        reason,
    }
}
