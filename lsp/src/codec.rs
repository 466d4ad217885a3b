//! JSON-RPC framing codec for backend communication.
//!
//! Backends speak `Content-Length: N\r\n\r\n{json}` framing over stdin/stdout.
//! [`FrameReader`] and [`FrameWriter`] read and write whole frames.
//!
//! Errors are split by what they mean for the stream: a body that is not valid
//! JSON leaves the reader aligned on the next frame, while header, size, and
//! I/O failures mean the stream can no longer be trusted.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Maximum frame size (16 MiB). Symbol trees for large files get big.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("I/O error while {context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed frame header: {0}")]
    Header(String),
    #[error("Content-Length {len} exceeds maximum {max}")]
    TooLarge { len: usize, max: usize },
    #[error("frame body is not valid JSON: {0}")]
    Body(#[source] serde_json::Error),
}

impl FrameError {
    /// Whether the reader can keep going after this error.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Body(_))
    }

    fn io(context: &'static str) -> impl FnOnce(std::io::Error) -> Self {
        move |source| Self::Io { context, source }
    }
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

    /// Read the next JSON-RPC frame.
    ///
    /// Returns `Ok(None)` on EOF between frames (clean shutdown).
    pub async fn read_frame(&mut self) -> Result<Option<serde_json::Value>, FrameError> {
        let Some(content_length) = self.read_headers().await? else {
            return Ok(None);
        };

        if content_length > MAX_FRAME_BYTES {
            return Err(FrameError::TooLarge {
                len: content_length,
                max: MAX_FRAME_BYTES,
            });
        }

        let mut body = vec![0u8; content_length];
        self.reader
            .read_exact(&mut body)
            .await
            .map_err(FrameError::io("reading frame body"))?;

        serde_json::from_slice(&body)
            .map(Some)
            .map_err(FrameError::Body)
    }

    async fn read_headers(&mut self) -> Result<Option<usize>, FrameError> {
        let mut content_length: Option<usize> = None;
        let mut line = String::new();
        let mut saw_any_header_bytes = false;

        loop {
            line.clear();
            let bytes_read = self
                .reader
                .read_line(&mut line)
                .await
                .map_err(FrameError::io("reading header line"))?;

            if bytes_read == 0 {
                // EOF is clean only before the first header byte of a frame.
                if !saw_any_header_bytes {
                    return Ok(None);
                }
                return Err(FrameError::Io {
                    context: "reading headers",
                    source: std::io::ErrorKind::UnexpectedEof.into(),
                });
            }
            saw_any_header_bytes = true;

            let trimmed = line.trim();
            if trimmed.is_empty() {
                break;
            }

            if let Some((key, value)) = trimmed.split_once(':')
                && key.trim().eq_ignore_ascii_case("Content-Length")
            {
                let len = value.trim().parse::<usize>().map_err(|_| {
                    FrameError::Header(format!("invalid Content-Length value {:?}", value.trim()))
                })?;
                content_length = Some(len);
            }
        }

        content_length
            .map(Some)
            .ok_or_else(|| FrameError::Header("missing Content-Length header".to_string()))
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

    pub async fn write_frame(&mut self, msg: &serde_json::Value) -> Result<(), FrameError> {
        let body = serde_json::to_vec(msg).map_err(FrameError::Body)?;
        let header = format!("Content-Length: {}\r\n\r\n", body.len());

        self.writer
            .write_all(header.as_bytes())
            .await
            .map_err(FrameError::io("writing frame header"))?;
        self.writer
            .write_all(&body)
            .await
            .map_err(FrameError::io("writing frame body"))?;
        self.writer
            .flush()
            .await
            .map_err(FrameError::io("flushing frame"))
    }

    pub async fn shutdown(&mut self) {
        let _ = self.writer.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_written_in_order_are_read_in_order() {
        let first = serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": "initialize"});
        let second = serde_json::json!({"jsonrpc": "2.0", "method": "initialized"});

        let mut buf = Vec::new();
        let mut writer = FrameWriter::new(&mut buf);
        writer.write_frame(&first).await.unwrap();
        writer.write_frame(&second).await.unwrap();

        let mut reader = FrameReader::new(buf.as_slice());
        assert_eq!(reader.read_frame().await.unwrap().unwrap(), first);
        assert_eq!(reader.read_frame().await.unwrap().unwrap(), second);
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_mid_headers_is_fatal() {
        let buf: &[u8] = b"Content-Length: 10\r\n";
        let mut reader = FrameReader::new(buf);
        let err = reader.read_frame().await.unwrap_err();
        assert!(!err.is_recoverable());
    }

    #[tokio::test]
    async fn eof_mid_body_is_fatal() {
        let buf: &[u8] = b"Content-Length: 100\r\n\r\nhello";
        let mut reader = FrameReader::new(buf);
        let err = reader.read_frame().await.unwrap_err();
        assert!(matches!(err, FrameError::Io { .. }));
    }

    #[tokio::test]
    async fn missing_content_length_is_header_error() {
        let buf: &[u8] = b"Content-Type: application/json\r\n\r\n{}";
        let mut reader = FrameReader::new(buf);
        assert!(matches!(
            reader.read_frame().await,
            Err(FrameError::Header(_))
        ));
    }

    #[tokio::test]
    async fn oversized_frame_rejected() {
        let header = format!("Content-Length: {}\r\n\r\n", MAX_FRAME_BYTES + 1);
        let mut reader = FrameReader::new(header.as_bytes());
        assert!(matches!(
            reader.read_frame().await,
            Err(FrameError::TooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn bad_json_body_leaves_stream_aligned() {
        let bad = b"not json!";
        let good = br#"{"jsonrpc":"2.0","id":7,"result":null}"#;
        let mut buf = format!("Content-Length: {}\r\n\r\n", bad.len()).into_bytes();
        buf.extend_from_slice(bad);
        buf.extend_from_slice(format!("Content-Length: {}\r\n\r\n", good.len()).as_bytes());
        buf.extend_from_slice(good);

        let mut reader = FrameReader::new(buf.as_slice());
        let err = reader.read_frame().await.unwrap_err();
        assert!(err.is_recoverable());
        let next = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(next["id"], 7);
    }

    #[tokio::test]
    async fn header_name_is_case_insensitive_and_extra_headers_ignored() {
        let body = r#"{"jsonrpc":"2.0","id":1}"#;
        let frame = format!(
            "Content-Type: application/vscode-jsonrpc; charset=utf-8\r\ncontent-length: {}\r\n\r\n{body}",
            body.len(),
        );
        let mut reader = FrameReader::new(frame.as_bytes());
        assert_eq!(reader.read_frame().await.unwrap().unwrap()["id"], 1);
    }

    #[tokio::test]
    async fn content_length_counts_bytes() {
        let msg = serde_json::json!({"name": "café"});
        let mut buf = Vec::new();
        FrameWriter::new(&mut buf).write_frame(&msg).await.unwrap();

        let body = serde_json::to_vec(&msg).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with(&format!("Content-Length: {}\r\n\r\n", body.len())));
    }
}
