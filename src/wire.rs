//! Stdio framing for the analysis server protocol.
//!
//! Outgoing requests are one JSON object plus `\r\n` on the child's stdin.
//! Incoming messages are `Content-Length: N\r\n\r\n<body>` framed JSON on the
//! child's stdout; [`read_message`] decodes one frame at a time and is driven
//! by a per-process reader task.

use std::io;

use serde_json::{Value, json};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::protocol::{Request, ServerMessage};

/// Serialize an outgoing request to its wire bytes, including the trailing
/// `\r\n` delimiter and the `type` tag.
pub fn encode_request(request: &Request) -> io::Result<Vec<u8>> {
    let frame: Value = json!({
        "seq": request.seq,
        "type": "request",
        "command": request.command,
        "arguments": request.arguments,
    });
    let mut bytes = serde_json::to_vec(&frame).map_err(io::Error::other)?;
    bytes.extend_from_slice(b"\r\n");
    Ok(bytes)
}

/// Read one framed message from the server's stdout.
///
/// Returns `Ok(None)` on clean EOF. A malformed frame is an error; the caller
/// logs it as a reader error and keeps the process alive, since a transport
/// error is not tied to any request and does not by itself kill the process.
pub async fn read_message<R>(reader: &mut R) -> io::Result<Option<ServerMessage>>
where
    R: AsyncBufRead + Unpin,
{
    let mut content_length: usize = 0;
    loop {
        let mut line = String::new();
        let read = reader.read_line(&mut line).await?;
        if read == 0 {
            // EOF between messages is a clean shutdown.
            return Ok(None);
        }
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        if let Some(len) = line.strip_prefix("Content-Length:") {
            content_length = len
                .trim()
                .parse()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("invalid Content-Length: {}", e)))?;
        }
        // Other headers (e.g. Content-Type) are ignored.
    }

    if content_length == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "message frame missing Content-Length header",
        ));
    }

    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body).await?;
    serde_json::from_slice(&body)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("malformed message body: {}", e)))
}

/// Frame a message body the way the server does, for tests and fakes.
pub fn encode_server_frame(body: &Value) -> Vec<u8> {
    let body = body.to_string();
    format!("Content-Length: {}\r\n\r\n{}", body.len(), body).into_bytes()
}
