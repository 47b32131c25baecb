//! QMP wire format.
//!
//! Every message is one JSON object per line. The server opens with a
//! greeting, then answers each request with exactly one reply, and may
//! interleave asynchronous events at any point:
//!
//! ```text
//! S: {"QMP": {"version": {...}, "capabilities": []}}
//! C: {"execute": "qmp_capabilities", "id": 1}
//! S: {"return": {}, "id": 1}
//! C: {"execute": "device_del", "arguments": {"id": "dimm-slot0"}, "id": 2}
//! S: {"return": {}, "id": 2}
//! S: {"event": "DEVICE_DELETED", "data": {"device": "dimm-slot0"}, "timestamp": {...}}
//! ```

use crate::error::{Result, VmemError};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};

/// Commands the controller issues. Nothing else goes over the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QmpCommand {
    Capabilities,
    /// Create a `memory-backend-ram` object.
    ObjectAdd { id: String, size: u64 },
    ObjectDel { id: String },
    /// Plug a `pc-dimm` backed by `memdev`.
    DeviceAdd { id: String, memdev: String },
    DeviceDel { id: String },
    /// Set the balloon target in bytes.
    Balloon { value: u64 },
    QueryBalloon,
    QueryMemoryDevices,
    QueryMemorySizeSummary,
}

impl QmpCommand {
    pub fn name(&self) -> &'static str {
        match self {
            QmpCommand::Capabilities => "qmp_capabilities",
            QmpCommand::ObjectAdd { .. } => "object-add",
            QmpCommand::ObjectDel { .. } => "object-del",
            QmpCommand::DeviceAdd { .. } => "device_add",
            QmpCommand::DeviceDel { .. } => "device_del",
            QmpCommand::Balloon { .. } => "balloon",
            QmpCommand::QueryBalloon => "query-balloon",
            QmpCommand::QueryMemoryDevices => "query-memory-devices",
            QmpCommand::QueryMemorySizeSummary => "query-memory-size-summary",
        }
    }

    pub fn arguments(&self) -> Option<Value> {
        match self {
            QmpCommand::ObjectAdd { id, size } => {
                Some(json!({ "qom-type": "memory-backend-ram", "id": id, "size": size }))
            }
            QmpCommand::ObjectDel { id } | QmpCommand::DeviceDel { id } => Some(json!({ "id": id })),
            QmpCommand::DeviceAdd { id, memdev } => {
                Some(json!({ "driver": "pc-dimm", "id": id, "memdev": memdev }))
            }
            QmpCommand::Balloon { value } => Some(json!({ "value": value })),
            QmpCommand::Capabilities
            | QmpCommand::QueryBalloon
            | QmpCommand::QueryMemoryDevices
            | QmpCommand::QueryMemorySizeSummary => None,
        }
    }

    /// Encode as a request line (without the trailing newline).
    pub fn encode(&self, id: u64) -> String {
        let mut request = Map::new();
        request.insert("execute".into(), Value::from(self.name()));
        if let Some(arguments) = self.arguments() {
            request.insert("arguments".into(), arguments);
        }
        request.insert("id".into(), Value::from(id));
        Value::Object(request).to_string()
    }
}

/// Error object carried by a failed reply.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct QmpError {
    pub class: String,
    #[serde(default)]
    pub desc: String,
}

/// Asynchronous event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct QmpEvent {
    pub event: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub timestamp: Value,
}

impl QmpEvent {
    /// Device id carried by a `DEVICE_DELETED` event.
    pub fn deleted_device(&self) -> Option<&str> {
        if self.event != "DEVICE_DELETED" {
            return None;
        }
        self.data.get("device").and_then(Value::as_str)
    }
}

/// Any message received from the server.
#[derive(Debug, Clone, PartialEq)]
pub enum QmpMessage {
    Greeting(Value),
    Reply { id: Option<u64>, result: std::result::Result<Value, QmpError> },
    Event(QmpEvent),
}

impl QmpMessage {
    pub fn parse(line: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(line).map_err(|e| VmemError::ProtocolError {
            reason: format!("invalid JSON from monitor: {}", e),
        })?;
        let Value::Object(mut object) = value else {
            return Err(VmemError::ProtocolError { reason: format!("expected object, got {}", line) });
        };

        if let Some(greeting) = object.remove("QMP") {
            return Ok(QmpMessage::Greeting(greeting));
        }

        if object.contains_key("event") {
            let event: QmpEvent = serde_json::from_value(Value::Object(object)).map_err(|e| {
                VmemError::ProtocolError { reason: format!("malformed event: {}", e) }
            })?;
            return Ok(QmpMessage::Event(event));
        }

        let id = object.get("id").and_then(Value::as_u64);
        if let Some(ret) = object.remove("return") {
            return Ok(QmpMessage::Reply { id, result: Ok(ret) });
        }
        if let Some(err) = object.remove("error") {
            let err: QmpError = serde_json::from_value(err).map_err(|e| {
                VmemError::ProtocolError { reason: format!("malformed error reply: {}", e) }
            })?;
            return Ok(QmpMessage::Reply { id, result: Err(err) });
        }

        Err(VmemError::ProtocolError { reason: format!("unrecognised message: {}", line) })
    }
}

/// Reply to `query-balloon`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct BalloonInfo {
    /// Memory the guest currently has, in bytes.
    pub actual: u64,
}

/// Reply to `query-memory-size-summary`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct MemorySizeSummary {
    #[serde(rename = "base-memory")]
    pub base_memory: u64,
    #[serde(rename = "plugged-memory", default)]
    pub plugged_memory: u64,
}

/// One entry of `query-memory-devices` reduced to what the ledger needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryDevice {
    pub kind: String,
    pub id: Option<String>,
    pub size: u64,
}

#[derive(Deserialize)]
struct RawMemoryDevice {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: RawDeviceData,
}

#[derive(Deserialize, Default)]
struct RawDeviceData {
    id: Option<String>,
    #[serde(default)]
    size: u64,
}

/// Decode a reply payload into `T`.
pub fn decode_reply<T: DeserializeOwned>(command: &str, value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| VmemError::ProtocolError {
        reason: format!("unexpected '{}' reply: {}", command, e),
    })
}

pub fn parse_memory_devices(value: Value) -> Result<Vec<MemoryDevice>> {
    let raw: Vec<RawMemoryDevice> = decode_reply("query-memory-devices", value)?;
    Ok(raw
        .into_iter()
        .map(|d| MemoryDevice {
            kind: d.kind,
            id: d.data.id,
            size: d.data.size,
        })
        .collect())
}
