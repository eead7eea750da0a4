//! Tool dispatch: the name → handler table and the per-line request lifecycle
use crate::error::{ManifestError, ToolError};
use crate::handler::{PartialReceiver, PartialSender, ToolCall, ToolHandler};
use crate::wire::{ClientMessage, Manifest, Request, Response, Tool};
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::*;

/// Runtime-configurable settings for the protocol loop itself.
///
/// These are independent of the tools being hosted, and also of the transport used to expose
/// them.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Upper bound on how long a single handler may run before its request is answered with a
    /// timeout error.  `None` lets handlers run to completion however long that takes.
    pub call_timeout: Option<Duration>,

    /// Input lines longer than this are discarded without a response
    pub max_line_length: usize,

    /// The maximum number of partial responses buffered before handlers emitting progress are
    /// made to wait for the transport to catch up.
    ///
    /// Most servers should not need to modify this.
    pub max_pending_partials: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            call_timeout: None,
            max_line_length: 1024 * 1024,
            max_pending_partials: 100,
        }
    }
}

/// Collects tools and their handlers into an [`McpServer`]
pub struct McpServerBuilder {
    name: String,
    description: String,
    config: ServerConfig,
    tools: Vec<Tool>,
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
}

impl McpServerBuilder {
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Advertise `tool` and route invocations of it to `handler`
    pub fn tool(mut self, tool: Tool, handler: impl ToolHandler) -> Self {
        self.handlers.insert(tool.name.clone(), Arc::new(handler));
        self.tools.push(tool);
        self
    }

    /// Validate the manifest and freeze the tool table.
    ///
    /// Errors here are startup errors: nothing has been written to the caller yet.
    pub fn build(self) -> Result<McpServer, ManifestError> {
        let manifest = Manifest::new(self.name, self.description, self.tools);
        manifest.validate()?;

        Ok(McpServer {
            manifest,
            handlers: self.handlers,
            config: self.config,
        })
    }
}

/// An immutable tool server: the manifest it advertises plus the handler behind each tool.
///
/// Transports use it to obtain a [`Connection`] for the caller they are serving.
pub struct McpServer {
    manifest: Manifest,
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
    config: ServerConfig,
}

impl std::fmt::Debug for McpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpServer")
            .field("name", &self.manifest.name)
            .field("tools", &self.handlers.keys().collect::<Vec<_>>())
            .field("config", &self.config)
            .finish()
    }
}

impl McpServer {
    pub fn builder(name: impl Into<String>, description: impl Into<String>) -> McpServerBuilder {
        McpServerBuilder {
            name: name.into(),
            description: description.into(),
            config: ServerConfig::default(),
            tools: Vec::new(),
            handlers: HashMap::new(),
        }
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Start serving a new caller.
    ///
    /// Returns a tuple:
    ///
    /// - a [`Connection`] that turns each input line into at most one terminal response
    /// - a [`PartialReceiver`] yielding the progress updates handlers emit while running.  The
    ///   transport must forward these to the caller for as long as the connection lives.
    pub fn connect(&self) -> (Connection<'_>, PartialReceiver) {
        let (sender, receiver) = tokio::sync::mpsc::channel(self.config.max_pending_partials);
        (
            Connection {
                server: self,
                partial_sender: sender,
            },
            receiver,
        )
    }
}

/// One caller's view of a server
pub struct Connection<'s> {
    server: &'s McpServer,
    partial_sender: PartialSender,
}

impl Connection<'_> {
    /// Handle one input line.
    ///
    /// Returns the terminal response for the request, or `None` when the line must not be
    /// answered: malformed JSON, requests of any type other than `"function"`, and invalid
    /// function requests that don't carry an `id`.
    #[instrument(skip_all, fields(line_len = line.len()))]
    pub async fn handle_line(&self, line: String) -> Option<Response> {
        match ClientMessage::from_str(&line) {
            Err(e) => {
                // Nothing to correlate an answer with
                warn!(error = %e, %line, "Discarding malformed request line");
                None
            }
            Ok(ClientMessage::Ignored { kind }) => {
                debug!(?kind, "Ignoring non-function request");
                None
            }
            Ok(ClientMessage::Invalid { id: Some(id), reason }) => {
                warn!(%id, %reason, "Invalid function request");
                Some(Response::failure(id, format!("Invalid request: {reason}")))
            }
            Ok(ClientMessage::Invalid { id: None, reason }) => {
                warn!(%reason, "Discarding invalid function request without an id");
                None
            }
            Ok(ClientMessage::Function(request)) => Some(self.dispatch(request).await),
        }
    }

    /// Invoke the handler named by `request`, converting every failure (unknown tool, handler
    /// error, panic, timeout) into an error response.
    #[instrument(skip_all, fields(name = %request.name, id = %request.id))]
    pub async fn dispatch(&self, request: Request) -> Response {
        let Request {
            id,
            name,
            arguments,
            ..
        } = request;

        let result = match self.server.handlers.get(&name) {
            None => Err(ToolError::UnknownFunction(name)),
            Some(handler) => {
                let call = ToolCall::new(id.clone(), name, arguments, self.partial_sender.clone());
                self.invoke(handler.as_ref(), call).await
            }
        };

        match result {
            Ok(result) => {
                debug!("Tool call succeeded");
                Response::success(id, result)
            }
            Err(e) => {
                info!(error = %e, "Tool call failed");
                Response::failure(id, e.to_string())
            }
        }
    }

    async fn invoke(
        &self,
        handler: &dyn ToolHandler,
        call: ToolCall,
    ) -> Result<serde_json::Value, ToolError> {
        let call = AssertUnwindSafe(handler.call(call)).catch_unwind();

        let outcome = match self.server.config.call_timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| ToolError::TimedOut(limit))?,
            None => call.await,
        };

        outcome.unwrap_or_else(|panic| {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "handler panicked".to_string());
            error!(%message, "Tool handler panicked");
            Err(ToolError::Panicked(message))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::init_test_logging;
    use crate::wire::{Outcome, ParamType};
    use assert_matches::assert_matches;
    use expect_test::expect;
    use serde_json::json;

    async fn greet(call: ToolCall) -> Result<serde_json::Value, ToolError> {
        #[derive(serde::Deserialize)]
        struct Args {
            name: String,
        }
        let args: Args = call.args()?;
        Ok(json!({ "message": format!("Hello, {}!", args.name) }))
    }

    async fn explode(_call: ToolCall) -> Result<serde_json::Value, ToolError> {
        panic!("kaboom")
    }

    async fn stall(_call: ToolCall) -> Result<serde_json::Value, ToolError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(json!(null))
    }

    async fn chatty(call: ToolCall) -> Result<serde_json::Value, ToolError> {
        call.report_progress(&json!({"step": 1})).await;
        call.report_progress(&json!({"step": 2})).await;
        Ok(json!({"done": true}))
    }

    fn test_server(config: ServerConfig) -> McpServer {
        McpServer::builder("test", "Test server")
            .config(config)
            .tool(
                Tool::new("greet", "Say hello").required("name", ParamType::String, "Who"),
                greet,
            )
            .tool(Tool::new("explode", "Always panics"), explode)
            .tool(Tool::new("stall", "Never finishes"), stall)
            .tool(Tool::new("chatty", "Reports progress"), chatty)
            .build()
            .unwrap()
    }

    async fn answer(line: &str) -> Option<String> {
        init_test_logging();
        let server = test_server(ServerConfig::default());
        let (conn, _partials) = server.connect();
        conn.handle_line(line.to_string())
            .await
            .map(|response| serde_json::to_string(&response).unwrap())
    }

    #[tokio::test]
    async fn greeting() {
        let response =
            answer(r#"{"type":"function","id":"x","name":"greet","arguments":{"name":"Ada"}}"#)
                .await;
        expect![[r#"{"id":"x","result":{"message":"Hello, Ada!"}}"#]]
            .assert_eq(&response.unwrap());
    }

    #[tokio::test]
    async fn unknown_function() {
        let response = answer(r#"{"type":"function","id":2,"name":"nope","arguments":{}}"#).await;
        expect![[r#"{"id":2,"error":"Unknown function: nope"}"#]].assert_eq(&response.unwrap());
    }

    #[tokio::test]
    async fn bad_arguments_are_reported() {
        let response =
            answer(r#"{"type":"function","id":5,"name":"greet","arguments":{"name":7}}"#).await;
        let response: Response = serde_json::from_str(&response.unwrap()).unwrap();
        assert_eq!(response.id, json!(5));
        assert_matches!(response.outcome, Outcome::Failure(message) => {
            assert!(message.starts_with("Invalid arguments:"), "{message}");
        });
    }

    #[tokio::test]
    async fn lines_without_answers() {
        assert_eq!(answer(r#"{"type":"function","id":1"#).await, None);
        assert_eq!(answer("").await, None);
        assert_eq!(
            answer(r#"{"type":"notification","id":1,"name":"greet"}"#).await,
            None
        );
        assert_eq!(answer(r#"{"id":1,"name":"greet"}"#).await, None);
        assert_eq!(answer(r#"{"type":"function","name":7}"#).await, None);
    }

    #[tokio::test]
    async fn invalid_function_request_with_id() {
        let response = answer(r#"{"type":"function","id":4,"arguments":{}}"#).await;
        let response: Response = serde_json::from_str(&response.unwrap()).unwrap();
        assert_eq!(response.id, json!(4));
        assert_matches!(response.outcome, Outcome::Failure(message) => {
            assert!(message.contains("missing field `name`"), "{message}");
        });
    }

    #[tokio::test]
    async fn panics_become_errors() {
        let response = answer(r#"{"type":"function","id":9,"name":"explode"}"#).await;
        expect![[r#"{"id":9,"error":"Operation failed unexpectedly: kaboom"}"#]]
            .assert_eq(&response.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handlers_time_out() {
        let server = test_server(ServerConfig {
            call_timeout: Some(Duration::from_secs(5)),
            ..Default::default()
        });
        let (conn, _partials) = server.connect();

        let response = conn
            .handle_line(r#"{"type":"function","id":1,"name":"stall"}"#.to_string())
            .await
            .unwrap();
        assert_eq!(
            response,
            Response::failure(json!(1), "Operation timed out after 5000ms")
        );
    }

    #[tokio::test]
    async fn progress_precedes_the_terminal_response() {
        let server = test_server(ServerConfig::default());
        let (conn, mut partials) = server.connect();

        let response = conn
            .handle_line(r#"{"type":"function","id":"p","name":"chatty"}"#.to_string())
            .await
            .unwrap();
        assert_eq!(response, Response::success(json!("p"), json!({"done": true})));

        for step in 1..=2 {
            let partial = partials.try_recv().unwrap();
            assert_eq!(partial, Response::partial(json!("p"), json!({ "step": step })));
        }
        assert!(partials.try_recv().is_err());
    }

    #[test]
    fn builder_rejects_inconsistent_tables() {
        let duplicate = McpServer::builder("dup", "")
            .tool(Tool::new("greet", ""), greet)
            .tool(Tool::new("greet", ""), greet)
            .build();
        assert_matches!(duplicate, Err(ManifestError::DuplicateTool { .. }));
    }
}
