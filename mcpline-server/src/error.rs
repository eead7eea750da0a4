use std::time::Duration;
use thiserror::Error;

/// Failure to understand a line received from, or about to be sent to, the other side.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed JSON: {source}")]
    Parse { source: serde_json::Error },

    #[error("Invalid response: {reason}")]
    InvalidResponse { reason: &'static str },
}

/// A manifest that a caller could not rely on.  Detected before the handshake, so it is always a
/// startup error.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("Unsupported manifest schema version '{version}'")]
    UnsupportedVersion { version: String },

    #[error("Tool names must not be empty")]
    EmptyToolName,

    #[error("Tool '{tool}' is declared more than once")]
    DuplicateTool { tool: String },

    #[error("Tool '{tool}' requires parameter '{parameter}' which is not one of its properties")]
    UndeclaredRequired { tool: String, parameter: String },
}

/// Error produced while dispatching or executing a tool.
///
/// Every variant is converted into the `error` string of a response; none of them ever stop the
/// server.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    /// A business-rule failure whose message is shown to the caller verbatim
    #[error("{0}")]
    Failed(String),

    #[error("Operation timed out after {}ms", .0.as_millis())]
    TimedOut(Duration),

    #[error("Operation failed unexpectedly: {0}")]
    Panicked(String),

    // The domain code uses anyhow, so this is the most common kind of error
    #[error("{0:#}")]
    Internal(#[from] anyhow::Error),
}

impl ToolError {
    pub fn failed(message: impl Into<String>) -> Self {
        ToolError::Failed(message.into())
    }

    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        ToolError::InvalidArguments(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn tool_error_messages() {
        assert_eq!(
            ToolError::UnknownFunction("nope".to_string()).to_string(),
            "Unknown function: nope"
        );
        assert_eq!(
            ToolError::failed("Cannot divide by zero").to_string(),
            "Cannot divide by zero"
        );
        assert_eq!(
            ToolError::TimedOut(Duration::from_millis(1500)).to_string(),
            "Operation timed out after 1500ms"
        );
    }

    #[test]
    fn internal_errors_include_the_chain() {
        let root: std::result::Result<(), std::io::Error> = Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "no such file",
        ));
        let error = root.context("reading papers").unwrap_err();

        assert_eq!(
            ToolError::from(error).to_string(),
            "reading papers: no such file"
        );
    }
}
