//! The unit of logic behind a single tool
use crate::error::ToolError;
use crate::wire::{Arguments, ConfirmationRequest, Response};
use std::future::Future;
use tracing::*;

/// Executes one tool's behavior.
///
/// A single handler instance serves every invocation of its tool, and invocations run
/// concurrently, so any mutable state an implementation holds must be synchronized.
#[async_trait::async_trait]
pub trait ToolHandler: Send + Sync + 'static {
    async fn call(&self, call: ToolCall) -> Result<serde_json::Value, ToolError>;
}

/// Convenience impl of `ToolHandler` for any async function taking a [`ToolCall`]
#[async_trait::async_trait]
impl<F, Fut> ToolHandler for F
where
    F: Fn(ToolCall) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, ToolError>> + Send + 'static,
{
    async fn call(&self, call: ToolCall) -> Result<serde_json::Value, ToolError> {
        (self)(call).await
    }
}

/// Channel used by handlers to emit partial responses while they are still running
pub(crate) type PartialSender = tokio::sync::mpsc::Sender<Response>;

/// Receiving side of the partial response channel.  The transport drains it and writes each
/// partial response before the terminal response of the same request.
pub type PartialReceiver = tokio::sync::mpsc::Receiver<Response>;

/// A single invocation of a tool
#[derive(Clone, Debug)]
pub struct ToolCall {
    id: serde_json::Value,
    name: String,
    arguments: Arguments,
    partial_sender: PartialSender,
}

impl ToolCall {
    pub(crate) fn new(
        id: serde_json::Value,
        name: String,
        arguments: Arguments,
        partial_sender: PartialSender,
    ) -> Self {
        Self {
            id,
            name,
            arguments,
            partial_sender,
        }
    }

    pub fn id(&self) -> &serde_json::Value {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arguments(&self) -> &Arguments {
        &self.arguments
    }

    /// Decode the arguments into the Rust type the tool expects.
    ///
    /// Failures become an invalid-arguments error suitable for returning straight to the caller.
    pub fn args<T: serde::de::DeserializeOwned>(&self) -> Result<T, ToolError> {
        serde_json::from_value(serde_json::Value::Object(self.arguments.clone())).map_err(|e| {
            debug!(error = %e, tool = %self.name, "Error deserializing arguments");
            ToolError::invalid_arguments(e.to_string())
        })
    }

    /// Emit a non-final result for this call.
    ///
    /// Progress is best effort: if the connection has gone away the update is logged and
    /// dropped, and the handler keeps running to completion.
    pub async fn report_progress<T: serde::Serialize>(&self, progress: &T) {
        let progress = match serde_json::to_value(progress) {
            Ok(progress) => progress,
            Err(e) => {
                error!(error = ?e, id = %self.id, "Error serializing progress update");
                return;
            }
        };

        if self
            .partial_sender
            .send(Response::partial(self.id.clone(), progress))
            .await
            .is_err()
        {
            warn!(id = %self.id, "Progress not sent; receiver no longer listening");
        }
    }

    /// Build the result a sensitive tool returns instead of acting, asking the caller to
    /// re-invoke this same operation after obtaining consent.
    pub fn confirmation(&self, message: impl Into<String>) -> Result<serde_json::Value, ToolError> {
        let confirmation = ConfirmationRequest::new(
            self.name.clone(),
            self.arguments.clone(),
            self.id.clone(),
            message,
        );

        serde_json::to_value(confirmation).map_err(|e| ToolError::Internal(e.into()))
    }
}
