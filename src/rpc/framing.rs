//! `Content-Length` framing, one JSON document per frame.
//!
//! Format: `Content-Length: N\r\n\r\n{json}`. Other header lines are
//! accepted and ignored.

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frames larger than this are rejected before the body is allocated.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("missing Content-Length header")]
    MissingContentLength,

    #[error("invalid Content-Length value: {0:?}")]
    InvalidContentLength(String),

    #[error("frame of {0} bytes exceeds the limit")]
    TooLarge(usize),

    #[error("stream ended inside a frame")]
    UnexpectedEof,
}

/// Read one frame body.
///
/// Returns `Ok(None)` on a clean end of stream between frames.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, FrameError>
where
    R: AsyncBufRead + Unpin,
{
    let mut content_length = None;
    let mut saw_header = false;

    loop {
        let mut line = String::new();
        let read = reader.read_line(&mut line).await?;
        if read == 0 {
            return if saw_header {
                Err(FrameError::UnexpectedEof)
            } else {
                Ok(None)
            };
        }

        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            if saw_header {
                break;
            }
            // Tolerate stray blank lines between frames.
            continue;
        }
        saw_header = true;

        if let Some((name, value)) = line.split_once(':')
            && name.trim().eq_ignore_ascii_case("content-length")
        {
            let value = value.trim();
            let length = value
                .parse::<usize>()
                .map_err(|_| FrameError::InvalidContentLength(value.to_string()))?;
            content_length = Some(length);
        }
    }

    let length = content_length.ok_or(FrameError::MissingContentLength)?;
    if length > MAX_FRAME_BYTES {
        return Err(FrameError::TooLarge(length));
    }

    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            FrameError::UnexpectedEof
        } else {
            FrameError::Io(e)
        }
    })?;
    Ok(Some(body))
}

/// Write one frame and flush.
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let header = format!("Content-Length: {}\r\n\r\n", body.len());
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn written_frame_has_content_length_header() {
        let mut output = Vec::new();
        write_frame(&mut output, br#"{"id":1}"#).await.unwrap();
        assert_eq!(output, b"Content-Length: 8\r\n\r\n{\"id\":1}");
    }

    #[tokio::test]
    async fn reads_consecutive_frames_then_eof() {
        let input = b"Content-Length: 2\r\n\r\n{}Content-Type: application/json\r\ncontent-length: 4\r\n\r\nnull";
        let mut reader = BufReader::new(&input[..]);

        assert_eq!(read_frame(&mut reader).await.unwrap(), Some(b"{}".to_vec()));
        assert_eq!(read_frame(&mut reader).await.unwrap(), Some(b"null".to_vec()));
        assert_eq!(read_frame(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn header_without_length_is_rejected() {
        let mut reader = BufReader::new(&b"X-Other: 1\r\n\r\n{}"[..]);
        let error = read_frame(&mut reader).await.unwrap_err();
        assert!(matches!(error, FrameError::MissingContentLength));
    }

    #[tokio::test]
    async fn non_numeric_length_is_rejected() {
        let mut reader = BufReader::new(&b"Content-Length: ten\r\n\r\n"[..]);
        let error = read_frame(&mut reader).await.unwrap_err();
        assert!(error.to_string().contains("Content-Length"));
    }

    #[tokio::test]
    async fn truncated_body_is_unexpected_eof() {
        let mut reader = BufReader::new(&b"Content-Length: 10\r\n\r\n{}"[..]);
        let error = read_frame(&mut reader).await.unwrap_err();
        assert!(matches!(error, FrameError::UnexpectedEof));
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected_before_reading() {
        let input = format!("Content-Length: {}\r\n\r\n", MAX_FRAME_BYTES + 1);
        let mut reader = BufReader::new(input.as_bytes());
        let error = read_frame(&mut reader).await.unwrap_err();
        assert!(matches!(error, FrameError::TooLarge(_)));
    }
}
