//! Defines the transport layer for the tool server.
//!
//! Transports are what expose an [`McpServer`](crate::McpServer) to a caller over some duplex
//! text channel.  All of them speak the same newline-delimited JSON.

mod stdio;
mod stream;
mod unix;

pub use stdio::StdioTransport;
pub use stream::StreamTransport;
pub use unix::UnixSocketTransport;
