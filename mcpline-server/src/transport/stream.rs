//! Defines a transport that communicates with a caller over two async streams, one for reading
//! and one for writing.
//!
//! This is used to implement the stdio transport, the Unix Domain Socket transport, and also is
//! useful for creating tests that simulate a caller and server talking over a pipe.

use crate::server::McpServer;
use anyhow::Result;
use futures::StreamExt;
use std::fmt::{Debug, Formatter};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::*;

pub struct StreamTransport<R, W> {
    reader: R,
    writer: W,
}

impl<R, W> Debug for StreamTransport<R, W>
where
    R: Debug,
    W: Debug,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTransport")
            .field("reader", &self.reader)
            .field("writer", &self.writer)
            .finish()
    }
}

impl<R, W> StreamTransport<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }

    /// Split back into the raw halves, for callers that want to drive the streams directly
    pub fn into_inner(self) -> (R, W) {
        (self.reader, self.writer)
    }

    /// Serve `server` over this transport.
    ///
    /// The manifest is written before anything is read.  After that every input line is handled
    /// concurrently with the ones before it, and responses are written as they complete.
    ///
    /// Stops when the cancellation token is triggered, or after the reader reaches EOF and every
    /// request already received has been answered.
    #[instrument(skip_all, fields(server = %server.manifest().name))]
    pub async fn serve(
        &mut self,
        server: &McpServer,
        cancellation_token: CancellationToken,
    ) -> Result<()> {
        let Self { reader, writer } = self;
        let max_line_length = server.config().max_line_length;

        write_line(writer, server.manifest()).await?;
        debug!(tools = server.manifest().tools.len(), "Manifest sent");

        // For stream transports there is only ever one connection, which services the entire
        // stream
        let (conn, mut partials) = server.connect();
        let mut reader = BufReader::new(reader);
        let mut pending_requests = futures::stream::FuturesUnordered::new();
        let mut input_open = true;

        // Outlives each read: a read interrupted by another branch of the select leaves its
        // bytes here and the next one picks up where it stopped
        let mut lines = LineBuffer::new(max_line_length);

        loop {
            tokio::select! {
                biased;

                _ = cancellation_token.cancelled() => {
                    debug!(in_flight = pending_requests.len(), "Cancellation requested; aborting");
                    return Ok(());
                },
                Some(partial) = partials.recv() => {
                    // Progress reported by a handler that is still running
                    write_line(writer, &partial).await?;
                },
                Some(response) = pending_requests.next(), if !pending_requests.is_empty() => {
                    // A future handling a previously-received request has completed.  Whatever
                    // progress it reported is already queued, and must reach the caller before
                    // the terminal response does.
                    while let Ok(partial) = partials.try_recv() {
                        write_line(writer, &partial).await?;
                    }

                    if let Some(response) = response {
                        write_line(writer, &response).await?;
                    }

                    if !input_open && pending_requests.is_empty() {
                        debug!("All requests answered after EOF; stopping stream");
                        return Ok(());
                    }
                },
                line = lines.next_line(&mut reader), if input_open => {
                    match line? {
                        None => {
                            debug!(in_flight = pending_requests.len(), "EOF on reader");
                            input_open = false;
                            if pending_requests.is_empty() {
                                return Ok(());
                            }
                        }
                        Some(Line::TooLong(line_len)) => {
                            warn!(line_len, max_line_length, "Discarding over-long request line");
                        }
                        Some(Line::Complete(raw)) => {
                            if let Some(line) = decode_line(raw, max_line_length) {
                                // Got a request on a line of input.  Create a future to process
                                // that line and add it to the collection of pending requests.  In
                                // this way a slow request never holds up the ones behind it.
                                pending_requests.push(conn.handle_line(line));
                            }
                        }
                    }
                },
            }
        }
    }
}

/// One line of input, as produced by [`LineBuffer::next_line`]
#[derive(Debug, PartialEq)]
enum Line {
    /// The raw bytes of the line, including the newline if there was one
    Complete(Vec<u8>),

    /// A line that exceeded the limit.  Its bytes were dropped as they arrived; only the length
    /// is kept.
    TooLong(usize),
}

/// Splits input into lines while holding at most one line's worth of bytes in memory.
///
/// All progress lives in this struct rather than in the future returned by `next_line`, so
/// dropping that future part way through a line loses nothing.
#[derive(Debug)]
struct LineBuffer {
    buf: Vec<u8>,
    /// Bytes thrown away so far from the current line, once it is known to be too long
    discarded: usize,
    max_line_length: usize,
}

impl LineBuffer {
    fn new(max_line_length: usize) -> Self {
        Self {
            buf: Vec::new(),
            discarded: 0,
            max_line_length,
        }
    }

    /// Most bytes ever kept for one line: the limit plus a `\r\n` terminator
    fn capacity_limit(&self) -> usize {
        self.max_line_length.saturating_add(2)
    }

    /// Read the next line.  `None` means the reader is exhausted.
    ///
    /// A final line without a trailing newline is still returned.
    async fn next_line<R>(&mut self, reader: &mut R) -> std::io::Result<Option<Line>>
    where
        R: AsyncBufRead + Unpin,
    {
        loop {
            let (used, complete) = {
                let available = reader.fill_buf().await?;
                if available.is_empty() {
                    return Ok(self.take_line());
                }

                let (chunk, complete) = match available.iter().position(|b| *b == b'\n') {
                    Some(newline) => (&available[..=newline], true),
                    None => (available, false),
                };

                if self.discarded > 0 || self.buf.len() + chunk.len() > self.capacity_limit() {
                    self.discarded += self.buf.len() + chunk.len();
                    self.buf = Vec::new();
                } else {
                    self.buf.extend_from_slice(chunk);
                }

                (chunk.len(), complete)
            };
            reader.consume(used);

            if complete {
                return Ok(self.take_line());
            }
        }
    }

    fn take_line(&mut self) -> Option<Line> {
        if self.discarded > 0 {
            Some(Line::TooLong(std::mem::take(&mut self.discarded)))
        } else if self.buf.is_empty() {
            None
        } else {
            Some(Line::Complete(std::mem::take(&mut self.buf)))
        }
    }
}

/// Turn the raw bytes of one input line into text worth handling.
///
/// Blank lines, over-long lines and lines that aren't UTF-8 are dropped here, without a response,
/// the same way malformed JSON is.
fn decode_line(mut raw: Vec<u8>, max_line_length: usize) -> Option<String> {
    if raw.last() == Some(&b'\n') {
        raw.pop();
    }
    if raw.last() == Some(&b'\r') {
        raw.pop();
    }

    if raw.len() > max_line_length {
        warn!(
            line_len = raw.len(),
            max_line_length, "Discarding over-long request line"
        );
        return None;
    }

    match String::from_utf8(raw) {
        Ok(line) if line.trim().is_empty() => {
            trace!("Skipping blank line");
            None
        }
        Ok(line) => Some(line),
        Err(e) => {
            warn!(error = %e, "Discarding request line that is not valid UTF-8");
            None
        }
    }
}

/// Serialize `message` and write it as a single line
async fn write_line<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: serde::Serialize,
{
    let line = serde_json::to_string(message)?;
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}
