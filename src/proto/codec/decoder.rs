use bytes::{Buf, Bytes, BytesMut};

use crate::proto::frame::Frame;

const DEFAULT_MAX_FRAME_SIZE: usize = 512 * 1024 * 1024; // 512 MB default

/// A streaming RESP decoder.
///
/// Call [`append`](Decoder::append) with bytes read from the socket, then
/// [`decode`](Decoder::decode) until it returns `Ok(None)`. Nothing is
/// consumed from the buffer until a whole frame (including every nested
/// array element) is available, so a reply split across reads is never lost.
///
/// # Example
///
/// ```
/// use muxplex::proto::codec::Decoder;
/// use muxplex::proto::frame::Frame;
///
/// let mut decoder = Decoder::new();
/// decoder.append(b"+QUEUED\r\n");
/// let frame = decoder.decode().unwrap().unwrap();
/// assert_eq!(frame, Frame::SimpleString(b"QUEUED".to_vec()));
/// ```
#[derive(Debug)]
pub struct Decoder {
    buf: BytesMut,
    max_frame_size: usize,
}

impl Decoder {
    /// Creates a new decoder with an empty buffer.
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Creates a new decoder with a custom maximum frame size.
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_frame_size,
        }
    }

    /// Appends raw bytes received from the network.
    pub fn append(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Attempts to decode one frame.
    ///
    /// Returns `Ok(None)` when more data is needed and `Err` when the stream
    /// is malformed; after an error the connection must be discarded.
    pub fn decode(&mut self) -> Result<Option<Frame>, String> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        if self.buf.len() > self.max_frame_size {
            return Err("Buffer size exceeded maximum frame size".to_string());
        }

        match self.parse(0)? {
            Some((frame, consumed)) => {
                self.buf.advance(consumed);
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }

    /// Parses the frame starting at `pos`; returns the frame and the offset
    /// one past its end.
    fn parse(&self, pos: usize) -> Result<Option<(Frame, usize)>, String> {
        let Some(line_end) = self.find_crlf(pos) else {
            return Ok(None);
        };
        let line = &self.buf[pos + 1..line_end];
        let next = line_end + 2;

        match self.buf[pos] {
            b'+' => Ok(Some((Frame::SimpleString(line.to_vec()), next))),
            b'-' => Ok(Some((Frame::Error(line.to_vec()), next))),
            b':' => Ok(Some((Frame::Integer(parse_number(line)?), next))),
            b'$' => {
                let len = parse_number(line)?;
                if len < 0 {
                    return Ok(Some((Frame::BulkString(None), next)));
                }
                let len = len as usize;
                if len > self.max_frame_size {
                    return Err("Bulk string length exceeds maximum frame size".to_string());
                }
                if self.buf.len() < next + len + 2 {
                    return Ok(None);
                }
                if &self.buf[next + len..next + len + 2] != b"\r\n" {
                    return Err("bulk string missing terminator".to_string());
                }
                let data = Bytes::copy_from_slice(&self.buf[next..next + len]);
                Ok(Some((Frame::BulkString(Some(data)), next + len + 2)))
            }
            b'*' => {
                let len = parse_number(line)?;
                if len < 0 {
                    return Ok(Some((Frame::Null, next)));
                }
                let len = len as usize;
                // Assume minimum 16 bytes per item
                if len > self.max_frame_size / 16 {
                    return Err("Array length exceeds reasonable maximum".to_string());
                }
                // Every item takes at least one buffered byte.
                let room = self.buf.len().saturating_sub(next);
                let mut items = Vec::with_capacity(len.min(room));
                let mut cursor = next;
                for _ in 0..len {
                    if cursor >= self.buf.len() {
                        return Ok(None);
                    }
                    match self.parse(cursor)? {
                        Some((item, end)) => {
                            items.push(item);
                            cursor = end;
                        }
                        None => return Ok(None),
                    }
                }
                Ok(Some((Frame::Array(items), cursor)))
            }
            other => Err(format!("unknown frame type: {}", other as char)),
        }
    }

    fn find_crlf(&self, from: usize) -> Option<usize> {
        self.buf[from..]
            .windows(2)
            .position(|w| w == b"\r\n")
            .map(|i| from + i)
    }
}

fn parse_number(line: &[u8]) -> Result<i64, String> {
    std::str::from_utf8(line)
        .map_err(|e| e.to_string())?
        .parse::<i64>()
        .map_err(|e| e.to_string())
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
