//! Message-framed transport seam.
//!
//! The engine never touches sockets. A connection is driven by any
//! `Stream<Item = Result<Frame, TransportError>>` and any
//! `Sink<Frame, Error = TransportError>`; the server crate adapts axum
//! WebSockets to these, tests use in-memory channels.

use crate::error::ConnectionError;

/// One transport frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

impl Frame {
    /// The UTF-8 payload of a data frame, or `None` for a close frame.
    ///
    /// Binary frames are accepted when they hold valid UTF-8.
    pub fn into_text(self, max_size: usize) -> Result<Option<String>, ConnectionError> {
        let size = match &self {
            Frame::Text(text) => text.len(),
            Frame::Binary(bytes) => bytes.len(),
            Frame::Close => return Ok(None),
        };
        if size > max_size {
            return Err(ConnectionError::FrameTooLarge {
                size,
                limit: max_size,
            });
        }
        match self {
            Frame::Text(text) => Ok(Some(text)),
            Frame::Binary(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|_| ConnectionError::InvalidUtf8),
            Frame::Close => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_text() {
        assert_eq!(
            Frame::Text("{}".into()).into_text(16).unwrap(),
            Some("{}".to_string())
        );
        assert_eq!(
            Frame::Binary(b"{}".to_vec()).into_text(16).unwrap(),
            Some("{}".to_string())
        );
        assert_eq!(Frame::Close.into_text(16).unwrap(), None);
    }

    #[test]
    fn test_into_text_rejects_oversize_and_invalid_utf8() {
        assert!(matches!(
            Frame::Text("x".repeat(17)).into_text(16),
            Err(ConnectionError::FrameTooLarge { size: 17, limit: 16 })
        ));
        assert!(matches!(
            Frame::Binary(vec![0xff, 0xfe]).into_text(16),
            Err(ConnectionError::InvalidUtf8)
        ));
    }
}
