//! `Content-Length` framing for debug adapter messages
//!
//! Wire format: `Content-Length: N\r\n\r\n{json}`

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::Message;
use crate::{Error, Result};

/// Largest body accepted from a peer (16 MiB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Longest header line kept; the rest of a longer line is discarded
const MAX_HEADER_LINE: usize = 8 * 1024;

/// One frame read off the stream
#[derive(Debug)]
pub enum Frame {
    /// A frame whose body parsed as a message
    Message(Message),
    /// A frame that was consumed but could not be understood
    Malformed(Error),
}

enum HeaderLine {
    Text(String),
    TooLong,
}

/// Read the next frame.
///
/// Returns `Ok(None)` on a clean EOF between frames. I/O failures and EOF in
/// the middle of a frame are errors; everything else that is wrong with a
/// frame is reported as [`Frame::Malformed`] so the caller can skip it.
pub async fn read_frame<R>(reader: &mut R) -> std::io::Result<Option<Frame>>
where
    R: AsyncBufRead + Unpin,
{
    let mut content_length: Option<std::result::Result<usize, String>> = None;
    let mut header_error: Option<String> = None;
    let mut saw_header = false;

    loop {
        let line = match read_header_line(reader).await? {
            Some(HeaderLine::Text(line)) => line,
            Some(HeaderLine::TooLong) => {
                saw_header = true;
                header_error = Some(format!("header line longer than {} bytes", MAX_HEADER_LINE));
                continue;
            }
            None if saw_header => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "stream closed while reading message headers",
                ));
            }
            None => return Ok(None),
        };

        let trimmed = line.trim_end_matches(&['\r', '\n'][..]);
        if trimmed.is_empty() {
            if saw_header {
                break;
            }
            // Stray blank line between frames
            continue;
        }
        saw_header = true;

        if let Some((key, value)) = trimmed.split_once(':') {
            if key.trim().eq_ignore_ascii_case("content-length") {
                content_length = Some(
                    value
                        .trim()
                        .parse::<usize>()
                        .map_err(|e| format!("invalid Content-Length value: {}", e)),
                );
            }
        }
    }

    let length = match content_length {
        Some(Ok(length)) => length,
        Some(Err(reason)) => return Ok(Some(Frame::Malformed(Error::Malformed(reason)))),
        None => {
            return Ok(Some(Frame::Malformed(Error::Malformed(
                "missing Content-Length header".to_string(),
            ))))
        }
    };

    if length > MAX_FRAME_SIZE {
        skip_body(reader, length).await?;
        return Ok(Some(Frame::Malformed(Error::Malformed(format!(
            "frame too large: {} bytes (max {})",
            length, MAX_FRAME_SIZE
        )))));
    }
    if let Some(reason) = header_error {
        skip_body(reader, length).await?;
        return Ok(Some(Frame::Malformed(Error::Malformed(reason))));
    }

    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await?;

    Ok(Some(match decode(&body) {
        Ok(message) => Frame::Message(message),
        Err(e) => Frame::Malformed(e),
    }))
}

/// Read one header line as bytes, decoding it lossily. `None` on EOF.
async fn read_header_line<R>(reader: &mut R) -> std::io::Result<Option<HeaderLine>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let read = (&mut *reader)
        .take(MAX_HEADER_LINE as u64)
        .read_until(b'\n', &mut line)
        .await?;
    if read == 0 {
        return Ok(None);
    }
    if line.ends_with(b"\n") || read < MAX_HEADER_LINE {
        return Ok(Some(HeaderLine::Text(String::from_utf8_lossy(&line).into_owned())));
    }

    // Drop the remainder of the overlong line
    loop {
        let mut rest = Vec::new();
        let read = (&mut *reader)
            .take(MAX_HEADER_LINE as u64)
            .read_until(b'\n', &mut rest)
            .await?;
        if read == 0 || rest.ends_with(b"\n") {
            return Ok(Some(HeaderLine::TooLong));
        }
    }
}

/// Consume `length` body bytes without buffering them
async fn skip_body<R>(reader: &mut R, length: usize) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let skipped = tokio::io::copy(&mut (&mut *reader).take(length as u64), &mut tokio::io::sink()).await?;
    if skipped < length as u64 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "stream closed inside a skipped frame",
        ));
    }
    Ok(())
}

/// Parse a frame body
pub fn decode(body: &[u8]) -> Result<Message> {
    serde_json::from_slice(body).map_err(|e| {
        Error::Malformed(format!(
            "{} in {}",
            e,
            String::from_utf8_lossy(&body[..body.len().min(256)])
        ))
    })
}

/// Serialize a message into a complete frame
pub fn encode(message: &Message) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(message)?;
    let mut framed = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
    framed.extend_from_slice(&body);
    Ok(framed)
}

/// Write one framed message and flush
pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let framed = encode(message)?;
    writer.write_all(&framed).await?;
    writer.flush().await?;
    Ok(())
}
