//! Wire types for the line-delimited tool protocol.
//!
//! Every message is a single JSON value on its own line.  The server emits one [`Manifest`] at
//! startup, then reads [`Request`] lines and answers each with one or more [`Response`] lines
//! correlated by `id`.
use crate::error::{ManifestError, ProtocolError};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashSet};

/// The only manifest schema version this crate speaks
pub const SCHEMA_VERSION: &str = "v1";

/// The `type` value that marks a request as a function invocation.  Anything else is ignored.
pub const FUNCTION_REQUEST_TYPE: &str = "function";

/// Argument mapping passed to a tool
pub type Arguments = serde_json::Map<String, serde_json::Value>;

/// Capability advertisement emitted exactly once, as the first output line.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub schema_version: String,
    pub name: String,
    pub description: String,
    pub tools: Vec<Tool>,
}

impl Manifest {
    pub fn new(name: impl Into<String>, description: impl Into<String>, tools: Vec<Tool>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            name: name.into(),
            description: description.into(),
            tools,
        }
    }

    /// Check the structural invariants a caller relies on: tool names are non-empty and unique,
    /// and every required parameter is also a declared property.
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(ManifestError::UnsupportedVersion {
                version: self.schema_version.clone(),
            });
        }

        let mut seen = HashSet::new();
        for tool in &self.tools {
            if tool.name.is_empty() {
                return Err(ManifestError::EmptyToolName);
            }
            if !seen.insert(tool.name.as_str()) {
                return Err(ManifestError::DuplicateTool {
                    tool: tool.name.clone(),
                });
            }
            if let Some(missing) = tool
                .parameters
                .required
                .iter()
                .find(|name| !tool.parameters.properties.contains_key(*name))
            {
                return Err(ManifestError::UndeclaredRequired {
                    tool: tool.name.clone(),
                    parameter: missing.clone(),
                });
            }
        }

        Ok(())
    }

    pub fn tool(&self, name: &str) -> Option<&Tool> {
        self.tools.iter().find(|tool| tool.name == name)
    }
}

/// One invocable operation, described with a JSON-Schema shaped parameter object.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    pub description: String,
    pub parameters: ParameterSchema,

    /// Tools that change or destroy state answer with a confirmation request unless the caller
    /// has already obtained consent.  Purely advisory; the loop does not enforce it.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub sensitive: bool,
}

impl Tool {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: ParameterSchema::default(),
            sensitive: false,
        }
    }

    /// Declare a parameter the caller must supply
    pub fn required(
        mut self,
        name: impl Into<String>,
        kind: ParamType,
        description: impl Into<String>,
    ) -> Self {
        let name = name.into();
        self.parameters.required.push(name.clone());
        self.optional(name, kind, description)
    }

    /// Declare a parameter the caller may omit
    pub fn optional(
        mut self,
        name: impl Into<String>,
        kind: ParamType,
        description: impl Into<String>,
    ) -> Self {
        self.parameters.properties.insert(
            name.into(),
            Property {
                kind,
                description: description.into(),
                allowed: None,
            },
        );
        self
    }

    /// Restrict an already declared parameter to a fixed set of values
    pub fn one_of<I, V>(mut self, name: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<serde_json::Value>,
    {
        if let Some(property) = self.parameters.properties.get_mut(name) {
            property.allowed = Some(values.into_iter().map(Into::into).collect());
        }
        self
    }

    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParameterSchema {
    /// Always `"object"`
    #[serde(rename = "type")]
    pub kind: String,
    pub properties: BTreeMap<String, Property>,
    #[serde(default)]
    pub required: Vec<String>,
}

impl Default for ParameterSchema {
    fn default() -> Self {
        Self {
            kind: "object".to_string(),
            properties: BTreeMap::new(),
            required: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Property {
    #[serde(rename = "type")]
    pub kind: ParamType,
    pub description: String,
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<serde_json::Value>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

/// A decoded `"function"` request line
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "type")]
    pub kind: String,

    /// Opaque correlation token, echoed verbatim in every response for this request
    #[serde(default)]
    pub id: serde_json::Value,

    pub name: String,

    #[serde(default)]
    pub arguments: Arguments,
}

impl Request {
    pub fn function(
        id: impl Into<serde_json::Value>,
        name: impl Into<String>,
        arguments: Arguments,
    ) -> Self {
        Self {
            kind: FUNCTION_REQUEST_TYPE.to_string(),
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// Possible kinds of input lines received by a server
#[derive(Debug, PartialEq)]
pub enum ClientMessage {
    /// A function invocation that must be answered
    Function(Request),

    /// Any other request type.  Ignored silently so new request types don't break old servers.
    Ignored { kind: Option<String> },

    /// Claims to be a function invocation but the rest of the shape is wrong.  If it carried an
    /// `id` the error can still be reported against it.
    Invalid {
        id: Option<serde_json::Value>,
        reason: String,
    },
}

impl ClientMessage {
    pub fn from_str(line: &str) -> Result<Self, ProtocolError> {
        let value: serde_json::Value =
            serde_json::from_str(line).map_err(|source| ProtocolError::Parse { source })?;

        let kind = value.get("type").and_then(|kind| kind.as_str());
        if kind != Some(FUNCTION_REQUEST_TYPE) {
            return Ok(ClientMessage::Ignored {
                kind: kind.map(str::to_string),
            });
        }

        let id = value.get("id").cloned();
        match serde_json::from_value::<Request>(value) {
            Ok(request) => Ok(ClientMessage::Function(request)),
            Err(e) => Ok(ClientMessage::Invalid {
                id,
                reason: e.to_string(),
            }),
        }
    }
}

/// What a single response line says about its request
#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    /// Terminal success
    Success(serde_json::Value),

    /// Terminal failure with a human readable message
    Failure(String),

    /// Non-terminal progress update; more responses for the same id will follow
    Partial(serde_json::Value),
}

/// One output line correlated to a request by `id`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(into = "WireResponse", try_from = "WireResponse")]
pub struct Response {
    pub id: serde_json::Value,
    pub outcome: Outcome,
}

impl Response {
    pub fn success(id: serde_json::Value, result: serde_json::Value) -> Self {
        Self {
            id,
            outcome: Outcome::Success(result),
        }
    }

    pub fn failure(id: serde_json::Value, message: impl Into<String>) -> Self {
        Self {
            id,
            outcome: Outcome::Failure(message.into()),
        }
    }

    pub fn partial(id: serde_json::Value, result: serde_json::Value) -> Self {
        Self {
            id,
            outcome: Outcome::Partial(result),
        }
    }

    /// A terminal response is the last one a caller will see for its `id`
    pub fn is_terminal(&self) -> bool {
        !matches!(self.outcome, Outcome::Partial(_))
    }
}

/// The literal shape of a response on the wire.  Kept private so that the public [`Response`]
/// type can't express the invalid combinations this one can.
#[derive(Serialize, Deserialize)]
struct WireResponse {
    id: serde_json::Value,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    partial: bool,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present_value"
    )]
    result: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Treat a present `"result": null` as a real result rather than an absent field
fn present_value<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<serde_json::Value>, D::Error> {
    serde_json::Value::deserialize(deserializer).map(Some)
}

impl From<Response> for WireResponse {
    fn from(response: Response) -> Self {
        let (partial, result, error) = match response.outcome {
            Outcome::Success(result) => (false, Some(result), None),
            Outcome::Failure(error) => (false, None, Some(error)),
            Outcome::Partial(result) => (true, Some(result), None),
        };

        WireResponse {
            id: response.id,
            partial,
            result,
            error,
        }
    }
}

impl TryFrom<WireResponse> for Response {
    type Error = ProtocolError;

    fn try_from(wire: WireResponse) -> Result<Self, Self::Error> {
        let outcome = match (wire.partial, wire.result, wire.error) {
            (false, Some(result), None) => Outcome::Success(result),
            (false, None, Some(error)) => Outcome::Failure(error),
            (true, Some(result), None) => Outcome::Partial(result),
            (_, Some(_), Some(_)) => {
                return Err(ProtocolError::InvalidResponse {
                    reason: "both `result` and `error` are present",
                })
            }
            (true, None, _) => {
                return Err(ProtocolError::InvalidResponse {
                    reason: "a partial response must carry a `result`",
                })
            }
            (false, None, None) => {
                return Err(ProtocolError::InvalidResponse {
                    reason: "neither `result` nor `error` is present",
                })
            }
        };

        Ok(Response {
            id: wire.id,
            outcome,
        })
    }
}

/// Result shape a sensitive tool returns instead of acting, asking the caller to obtain consent
/// and invoke the operation again.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfirmationRequest {
    pub requires_confirmation: bool,
    pub message: String,
    pub operation: OperationRef,
    #[serde(rename = "requestId")]
    pub request_id: serde_json::Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OperationRef {
    pub name: String,
    pub args: Arguments,
}

impl ConfirmationRequest {
    pub fn new(
        operation: impl Into<String>,
        args: Arguments,
        request_id: serde_json::Value,
        message: impl Into<String>,
    ) -> Self {
        Self {
            requires_confirmation: true,
            message: message.into(),
            operation: OperationRef {
                name: operation.into(),
                args,
            },
            request_id,
        }
    }
}
