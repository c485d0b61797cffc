//! Streaming response bodies as forward-only line sequences.
//!
//! Both stream protocols are line-framed: the delta-only protocol sends
//! `data: <json>` lines, the event/data protocol interleaves `event:`
//! and `data:` lines with blank-line delimiters. Parsing happens above
//! this module; here a response body is only re-chunked into text lines,
//! blank lines included, since they carry framing meaning.

use futures::stream::{self, Stream, StreamExt};

use crate::error::Error;

/// Extension trait for `reqwest::Response` to expose the body as lines.
pub trait LineStreamExt {
    /// Convert the response body into a stream of text lines.
    ///
    /// Lines are yielded in wire order, with the trailing `\n` (and any
    /// `\r`) removed. Blank lines are yielded, not skipped. Consumption
    /// drives the underlying network reads; nothing is buffered beyond
    /// one partial line.
    fn lines(self) -> impl Stream<Item = Result<String, Error>> + Send;
}

impl LineStreamExt for reqwest::Response {
    fn lines(self) -> impl Stream<Item = Result<String, Error>> + Send {
        let byte_stream = self.bytes_stream();

        stream::unfold(
            (Box::pin(byte_stream), Vec::new(), false),
            |(mut byte_stream, mut buffer, mut stream_ended)| async move {
                loop {
                    if let Some(line) = take_line(&mut buffer) {
                        return Some((Ok(line), (byte_stream, buffer, stream_ended)));
                    }

                    if stream_ended {
                        // Flush a final unterminated line, if any.
                        if buffer.is_empty() {
                            return None;
                        }
                        let rest = std::mem::take(&mut buffer);
                        let line = String::from_utf8_lossy(&rest).into_owned();
                        return Some((Ok(line), (byte_stream, buffer, stream_ended)));
                    }

                    match byte_stream.next().await {
                        Some(Ok(chunk)) => {
                            buffer.extend_from_slice(&chunk);
                        }
                        Some(Err(e)) => {
                            return Some((
                                Err(Error::from(e)),
                                (byte_stream, buffer, stream_ended),
                            ));
                        }
                        None => {
                            stream_ended = true;
                        }
                    }
                }
            },
        )
    }
}

/// Remove and return the first complete line from the buffer.
///
/// The buffer holds raw bytes and splitting happens on `\n` bytes, so a
/// multi-byte character spanning two network chunks stays intact; text
/// is decoded only once a full line is available.
fn take_line(buffer: &mut Vec<u8>) -> Option<String> {
    let pos = buffer.iter().position(|&b| b == b'\n')?;
    let mut line: Vec<u8> = buffer.drain(..=pos).collect();
    line.pop();
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Some(String::from_utf8_lossy(&line).into_owned())
}
