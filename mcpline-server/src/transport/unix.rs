//! A transport over a Unix domain socket.  Like stdio, it serves exactly one caller: the first
//! one to connect.

use super::StreamTransport;
use anyhow::{Context, Result};
use std::path::Path;
use tokio::io::BufWriter;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tracing::*;

pub type UnixSocketTransport = StreamTransport<OwnedReadHalf, BufWriter<OwnedWriteHalf>>;

impl UnixSocketTransport {
    /// Listen on `path` and wait for a caller to connect
    pub async fn bind<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        // Remove a stale socket file left behind by a previous run
        if path.exists() {
            tokio::fs::remove_file(path)
                .await
                .with_context(|| format!("removing stale socket {}", path.display()))?;
        }

        let listener = UnixListener::bind(path)
            .with_context(|| format!("binding socket {}", path.display()))?;
        debug!(path = %path.display(), "Waiting for a caller to connect");
        let (stream, _) = listener.accept().await?;

        Ok(Self::from_stream(stream))
    }

    /// Connect to a server listening on `path`.  Mostly useful for tests and for callers
    /// written in Rust.
    pub async fn connect<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path)
            .await
            .with_context(|| format!("connecting to socket {}", path.display()))?;

        Ok(Self::from_stream(stream))
    }

    fn from_stream(stream: UnixStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self::new(reader, BufWriter::new(writer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::init_test_logging;
    use crate::{McpServer, Tool, ToolCall, ToolError};
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio_util::sync::CancellationToken;

    async fn echo(call: ToolCall) -> Result<serde_json::Value, ToolError> {
        Ok(serde_json::Value::Object(call.arguments().clone()))
    }

    #[tokio::test]
    async fn serves_the_first_caller() -> Result<()> {
        init_test_logging();
        let dir = tempfile::tempdir()?;
        let socket_path = dir.path().join("mcpline.sock");

        let server = McpServer::builder("socket-test", "")
            .tool(Tool::new("echo", "Echo the arguments"), echo)
            .build()?;

        // Start server in background task
        let server_path = socket_path.clone();
        let server_handle = tokio::spawn(async move {
            let mut transport = UnixSocketTransport::bind(&server_path).await?;
            transport.serve(&server, CancellationToken::new()).await?;

            Result::<()>::Ok(())
        });

        // Wait until the server is listening
        let client = loop {
            match UnixSocketTransport::connect(&socket_path).await {
                Ok(client) => break client,
                Err(_) => tokio::time::sleep(std::time::Duration::from_millis(10)).await,
            }
        };
        let (reader, mut writer) = client.into_inner();
        let mut lines = BufReader::new(reader).lines();

        let manifest: serde_json::Value =
            serde_json::from_str(&lines.next_line().await?.unwrap())?;
        assert_eq!(manifest["name"], json!("socket-test"));

        writer
            .write_all(b"{\"type\":\"function\",\"id\":1,\"name\":\"echo\",\"arguments\":{\"a\":1}}\n")
            .await?;
        writer.flush().await?;

        let response: serde_json::Value =
            serde_json::from_str(&lines.next_line().await?.unwrap())?;
        assert_eq!(response, json!({"id": 1, "result": {"a": 1}}));

        // Closing our side ends the server
        writer.shutdown().await?;
        drop(writer);
        server_handle.await??;

        Ok(())
    }
}
