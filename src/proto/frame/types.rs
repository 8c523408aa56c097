use bytes::Bytes;

/// A RESP (Redis Serialization Protocol) frame.
///
/// This enum represents all frame types defined in the RESP protocol:
/// - SimpleString: Status responses like "OK" or "QUEUED"
/// - Error: Error responses from the server, including cluster redirects
/// - Integer: Numeric responses
/// - BulkString: Binary-safe string data
/// - Array: Command arguments and array responses
/// - Null: NULL value (also the reply of an `EXEC` whose `WATCH` failed)
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Simple string (+OK).
    SimpleString(Vec<u8>),
    /// Error (-ERR).
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
    /// Builds a simple string frame.
    pub fn simple(s: impl AsRef<[u8]>) -> Self {
        Frame::SimpleString(s.as_ref().to_vec())
    }

    /// Builds an error frame.
    pub fn error(s: impl AsRef<[u8]>) -> Self {
        Frame::Error(s.as_ref().to_vec())
    }

    /// Builds a non-null bulk string frame.
    pub fn bulk(b: impl Into<Bytes>) -> Self {
        Frame::BulkString(Some(b.into()))
    }

    /// Returns true if this is the simple string `value` (ASCII case-insensitive).
    pub fn is_simple(&self, value: &str) -> bool {
        match self {
            Frame::SimpleString(s) => s.eq_ignore_ascii_case(value.as_bytes()),
            _ => false,
        }
    }

    /// Returns true for an error frame.
    pub fn is_error(&self) -> bool {
        matches!(self, Frame::Error(_))
    }

    /// Returns the text of an error frame.
    pub fn error_message(&self) -> Option<String> {
        match self {
            Frame::Error(e) => Some(String::from_utf8_lossy(e).into_owned()),
            _ => None,
        }
    }

    /// Returns true if this frame is Null (including a null bulk string).
    pub fn is_null(&self) -> bool {
        matches!(self, Frame::Null | Frame::BulkString(None))
    }

    /// Attempts to extract an integer from this frame.
    pub fn to_int(&self) -> Option<i64> {
        match self {
            Frame::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the payload of a string-like frame.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Frame::SimpleString(s) => Some(s),
            Frame::BulkString(Some(b)) => Some(b),
            _ => None,
        }
    }
}
