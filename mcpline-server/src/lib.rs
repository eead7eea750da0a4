//! A very small framework for tool servers that speak newline-delimited JSON over a single duplex
//! text stream.
//!
//! On startup a server writes its [`Manifest`], then answers every `"function"` request line with
//! a response carrying the same `id`.  Requests are handled concurrently, so responses may come
//! back in any order.  Handler failures of any kind become `error` responses and never stop the
//! server.
mod error;
mod handler;
mod server;
mod transport;
mod wire;

pub use error::*;
pub use handler::*;
pub use server::*;
pub use transport::*;
pub use wire::*;

#[cfg(test)]
pub mod test_helpers {
    use std::sync::OnceLock;
    use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

    static LOGGING: OnceLock<()> = OnceLock::new();

    /// Send protocol loop events to the captured test output.  Every test may call this; the
    /// subscriber is installed by whichever gets there first.
    pub fn init_test_logging() {
        LOGGING.get_or_init(|| {
            let filter = std::env::var("RUST_LOG")
                .map(EnvFilter::new)
                .unwrap_or_else(|_| EnvFilter::new("mcpline_server=trace"));

            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_span_events(FmtSpan::CLOSE)
                .with_test_writer()
                .try_init()
                .ok();
        });
    }
}
