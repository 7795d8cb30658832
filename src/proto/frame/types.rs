use bytes::Bytes;

/// A RESP2 reply or request frame.
///
/// Replies coming back from a node are one of these variants; requests are
/// always an [`Frame::Array`] of bulk strings.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Simple string (+OK).
    SimpleString(Vec<u8>),
    /// Error (-ERR). The first word is the error kind.
    Error(Vec<u8>),
    /// Integer (:1000).
    Integer(i64),
    /// Bulk string ($6\r\nfoobar).
    BulkString(Option<Bytes>),
    /// Array (*2\r\n...).
    Array(Vec<Frame>),
    /// Null ($-1 or *-1).
    Null,
}

impl Frame {
    /// Builds a bulk string frame.
    pub fn bulk(data: impl Into<Bytes>) -> Self {
        Frame::BulkString(Some(data.into()))
    }

    /// Builds a simple string frame.
    pub fn simple(s: &str) -> Self {
        Frame::SimpleString(s.as_bytes().to_vec())
    }

    /// Builds an error frame from a full error line, e.g. `MOVED 3999 127.0.0.1:7000`.
    pub fn error(s: &str) -> Self {
        Frame::Error(s.as_bytes().to_vec())
    }

    /// Returns the raw bytes of a string-like frame.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Frame::SimpleString(s) | Frame::Error(s) => Some(s),
            Frame::BulkString(Some(b)) => Some(b),
            _ => None,
        }
    }

    /// Returns the frame as UTF-8 text when it is string-like.
    pub fn as_text(&self) -> Option<String> {
        self.as_bytes()
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    /// Returns the integer value, also accepting numeric bulk strings.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Frame::Integer(i) => Some(*i),
            Frame::BulkString(Some(b)) => std::str::from_utf8(b).ok()?.parse().ok(),
            _ => None,
        }
    }

    /// Returns true if this frame is an error reply.
    pub fn is_error(&self) -> bool {
        matches!(self, Frame::Error(_))
    }

    /// Returns true if this frame is Null or a null bulk string.
    pub fn is_null(&self) -> bool {
        matches!(self, Frame::Null | Frame::BulkString(None))
    }
}
