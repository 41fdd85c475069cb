//! JSON-RPC framing codec for LSP communication.
//!
//! LSP uses `Content-Length: N\r\n\r\n{json}` framing over stdin/stdout.
//! [`FrameReader`] and [`FrameWriter`] read and write those frames over any
//! async byte stream, so the same code serves child pipes and in-memory
//! duplex streams in tests.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Maximum frame size (4 MiB) to prevent unbounded memory allocation.
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("missing Content-Length header")]
    MissingContentLength,
    #[error("invalid Content-Length value: {0:?}")]
    InvalidContentLength(String),
    #[error("Content-Length {0} exceeds maximum {MAX_FRAME_BYTES}")]
    TooLarge(usize),
    #[error("unexpected EOF while reading headers")]
    TruncatedHeaders,
    #[error("malformed JSON-RPC frame: {0}")]
    Json(#[from] serde_json::Error),
}

/// Reads JSON-RPC frames from an async reader.
pub struct FrameReader<R> {
    reader: BufReader<R>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
        }
    }

    /// Read the next frame.
    ///
    /// Returns `Ok(None)` on EOF between frames (clean shutdown of the peer).
    pub async fn read_frame(&mut self) -> Result<Option<serde_json::Value>, FrameError> {
        let Some(content_length) = self.read_headers().await? else {
            return Ok(None);
        };

        if content_length > MAX_FRAME_BYTES {
            return Err(FrameError::TooLarge(content_length));
        }

        let mut body = vec![0u8; content_length];
        self.reader.read_exact(&mut body).await?;

        Ok(Some(serde_json::from_slice(&body)?))
    }

    async fn read_headers(&mut self) -> Result<Option<usize>, FrameError> {
        let mut content_length: Option<usize> = None;
        let mut line = String::new();
        let mut saw_header_bytes = false;

        loop {
            line.clear();
            if self.reader.read_line(&mut line).await? == 0 {
                // EOF is only clean before the first header byte.
                if saw_header_bytes {
                    return Err(FrameError::TruncatedHeaders);
                }
                return Ok(None);
            }
            saw_header_bytes = true;

            let trimmed = line.trim();
            if trimmed.is_empty() {
                break;
            }

            if let Some((key, value)) = trimmed.split_once(':')
                && key.trim().eq_ignore_ascii_case("Content-Length")
            {
                let value = value.trim();
                let len = value
                    .parse()
                    .map_err(|_| FrameError::InvalidContentLength(value.to_string()))?;
                content_length = Some(len);
            }
        }

        content_length
            .map(Some)
            .ok_or(FrameError::MissingContentLength)
    }
}

/// Writes JSON-RPC frames to an async writer.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Serialize `msg`, prepend its `Content-Length` header and flush.
    pub async fn write_frame(&mut self, msg: &serde_json::Value) -> Result<(), FrameError> {
        let body = serde_json::to_vec(msg)?;
        let header = format!("Content-Length: {}\r\n\r\n", body.len());

        self.writer.write_all(header.as_bytes()).await?;
        self.writer.write_all(&body).await?;
        self.writer.flush().await?;
        Ok(())
    }
}
