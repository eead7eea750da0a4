//! The tool servers this crate ships.  Each module exposes a `server` constructor returning a
//! ready-to-serve [`mcpline_server::McpServer`].
pub mod minimal;
pub mod papers;
