//! Wire protocol: framing, command envelopes, and tagged responses.
//!
//! Every message is one length-prefixed UTF-8 JSON document:
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```
//!
//! Clients send a `CommandEnvelope`. The server answers each well-formed
//! envelope with exactly one response document: `null` for "no value", or a
//! type-tagged value `{"$type": "System.Int32", "value": 1}`.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::coerce::Coercion;
use crate::config::IpcConfig;
use crate::descriptor::TypeDescriptor;
use crate::error::{RemexError, Result};
use crate::handle::ObjectHandle;
use crate::value::Value;

/// Field carrying the runtime type of a response value.
pub const TYPE_TAG: &str = "$type";
const VALUE_FIELD: &str = "value";

/// The operation a command asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandKind {
    NewObject,
    RetrieveObject,
    Invoke,
    GetProperty,
    SetProperty,
    CloseConnection,
}

/// One remote operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandEnvelope {
    #[serde(default = "default_version")]
    pub version: u32,
    pub kind: CommandKind,
    #[serde(default)]
    pub target_handle: ObjectHandle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_type: Option<TypeDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_name: Option<String>,
    #[serde(default)]
    pub parameters: Vec<serde_json::Value>,
    #[serde(default)]
    pub parameter_types: Vec<TypeDescriptor>,
}

fn default_version() -> u32 {
    IpcConfig::PROTOCOL_VERSION
}

impl CommandEnvelope {
    pub fn new(kind: CommandKind) -> Self {
        Self {
            version: IpcConfig::PROTOCOL_VERSION,
            kind,
            target_handle: ObjectHandle::SENTINEL,
            target_type: None,
            member_name: None,
            parameters: Vec::new(),
            parameter_types: Vec::new(),
        }
    }

    pub fn with_target(mut self, handle: ObjectHandle) -> Self {
        self.target_handle = handle;
        self
    }

    pub fn with_type(mut self, descriptor: TypeDescriptor) -> Self {
        self.target_type = Some(descriptor);
        self
    }

    pub fn with_member(mut self, name: impl Into<String>) -> Self {
        self.member_name = Some(name.into());
        self
    }

    /// Set the parameters, recording each value's runtime type beside it.
    pub fn with_arguments(mut self, args: Vec<Value>) -> Self {
        self.parameter_types = args.iter().map(Value::descriptor).collect();
        self.parameters = args.iter().map(Value::to_json).collect();
        self
    }

    pub fn new_object(descriptor: TypeDescriptor, args: Vec<Value>) -> Self {
        Self::new(CommandKind::NewObject)
            .with_type(descriptor)
            .with_arguments(args)
    }

    pub fn retrieve_object(handle: ObjectHandle) -> Self {
        Self::new(CommandKind::RetrieveObject).with_target(handle)
    }

    pub fn invoke(handle: ObjectHandle, method: &str, args: Vec<Value>) -> Self {
        Self::new(CommandKind::Invoke)
            .with_target(handle)
            .with_member(method)
            .with_arguments(args)
    }

    pub fn invoke_static(descriptor: TypeDescriptor, method: &str, args: Vec<Value>) -> Self {
        Self::new(CommandKind::Invoke)
            .with_type(descriptor)
            .with_member(method)
            .with_arguments(args)
    }

    pub fn get_property(handle: ObjectHandle, property: &str) -> Self {
        Self::new(CommandKind::GetProperty)
            .with_target(handle)
            .with_member(property)
    }

    pub fn get_static_property(descriptor: TypeDescriptor, property: &str) -> Self {
        Self::new(CommandKind::GetProperty)
            .with_type(descriptor)
            .with_member(property)
    }

    pub fn set_property(handle: ObjectHandle, property: &str, value: Value) -> Self {
        Self::new(CommandKind::SetProperty)
            .with_target(handle)
            .with_member(property)
            .with_arguments(vec![value])
    }

    pub fn close_connection(handle: ObjectHandle) -> Self {
        Self::new(CommandKind::CloseConnection).with_target(handle)
    }

    /// Whether the command addresses a type rather than an instance.
    pub fn is_static(&self) -> bool {
        self.target_type.is_some()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse and validate an envelope.
    ///
    /// Any failure is a protocol error: the message cannot be answered.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let envelope: CommandEnvelope =
            serde_json::from_slice(bytes).map_err(|e| RemexError::Protocol {
                message: format!("undecodable envelope: {}", e),
            })?;
        envelope.validate()?;
        Ok(envelope)
    }

    fn validate(&self) -> Result<()> {
        if self.version == 0 || self.version > IpcConfig::PROTOCOL_VERSION {
            return Err(RemexError::Protocol {
                message: format!("unsupported envelope version {}", self.version),
            });
        }
        if self.parameters.len() != self.parameter_types.len() {
            return Err(RemexError::Protocol {
                message: format!(
                    "{} parameters but {} parameter types",
                    self.parameters.len(),
                    self.parameter_types.len()
                ),
            });
        }
        Ok(())
    }
}

/// Serialize a response document.
pub fn encode_response(value: &Value) -> Result<Vec<u8>> {
    let document = match value {
        Value::Null => serde_json::Value::Null,
        value => {
            let mut fields = serde_json::Map::new();
            fields.insert(TYPE_TAG.to_string(), value.descriptor().to_string().into());
            fields.insert(VALUE_FIELD.to_string(), value.to_json());
            serde_json::Value::Object(fields)
        }
    };
    Ok(serde_json::to_vec(&document)?)
}

/// Parse a response document back into a typed value.
pub fn decode_response(bytes: &[u8]) -> Result<Value> {
    let document: serde_json::Value = serde_json::from_slice(bytes)?;
    match document {
        serde_json::Value::Null => Ok(Value::Null),
        serde_json::Value::Object(mut fields) => {
            let descriptor = fields
                .remove(TYPE_TAG)
                .and_then(|tag| tag.as_str().map(TypeDescriptor::new))
                .ok_or_else(|| RemexError::Protocol {
                    message: format!("response without a {} tag", TYPE_TAG),
                })?;
            let raw = fields.remove(VALUE_FIELD).unwrap_or(serde_json::Value::Null);
            Coercion::new().coerce(raw, &descriptor)
        }
        other => Err(RemexError::Protocol {
            message: format!("unexpected response document: {}", other),
        }),
    }
}

/// Read a length-prefixed frame from an async reader.
///
/// Frame format: `[4-byte BE u32 length][payload bytes]`
///
/// Returns `None` on clean EOF (peer closed connection).
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    if len > IpcConfig::MAX_MESSAGE_SIZE {
        return Err(RemexError::Validation {
            field: "frame".to_string(),
            message: format!(
                "message size {} exceeds maximum {}",
                len,
                IpcConfig::MAX_MESSAGE_SIZE
            ),
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|&len| len as usize <= IpcConfig::MAX_MESSAGE_SIZE)
        .ok_or_else(|| RemexError::Validation {
            field: "frame".to_string(),
            message: format!("outgoing message of {} bytes is too large", payload.len()),
        })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}
