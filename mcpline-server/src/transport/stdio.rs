//! Implementation of the so-called "stdio" transport, which is another way of saying a transport
//! in which the entire process is handling a single caller, with requests coming in on stdin,
//! responses going out on stdout, and log events (if any) usually written to stderr.

use super::StreamTransport;

pub type StdioTransport = StreamTransport<tokio::io::Stdin, tokio::io::BufWriter<tokio::io::Stdout>>;

impl StdioTransport {
    pub fn stdio() -> Self {
        Self::new(
            tokio::io::stdin(),
            tokio::io::BufWriter::new(tokio::io::stdout()),
        )
    }
}
