//! LSP base protocol framing: `Content-Length` headers followed by a JSON body

use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::lsp::error::TransportError;

/// Largest message body accepted from the server
pub const MAX_CONTENT_LENGTH: usize = 64 * 1024 * 1024;

pub async fn write_message<W>(writer: &mut W, message: &Value) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let body = serde_json::to_vec(message)?;
    let header = format!("Content-Length: {}\r\n\r\n", body.len());

    writer.write_all(header.as_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one framed message. Returns `Ok(None)` on a clean end of stream.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Value>, TransportError>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let mut content_length: Option<usize> = None;

    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }

        let line = line.trim_end();
        if line.is_empty() {
            // Stray blank lines between messages are skipped
            if content_length.is_some() {
                break;
            }
            continue;
        }

        let Some((name, value)) = line.split_once(':') else {
            return Err(TransportError::InvalidHeader(line.to_string()));
        };
        if name.trim().eq_ignore_ascii_case("content-length") {
            let length: usize = value
                .trim()
                .parse()
                .map_err(|_| TransportError::InvalidHeader(line.to_string()))?;
            if length > MAX_CONTENT_LENGTH {
                return Err(TransportError::InvalidHeader(line.to_string()));
            }
            content_length = Some(length);
        }
    }

    let mut body = vec![0u8; content_length.unwrap_or_default()];
    reader.read_exact(&mut body).await?;

    Ok(Some(serde_json::from_slice(&body)?))
}
