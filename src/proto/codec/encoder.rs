use bytes::{BufMut, Bytes, BytesMut};

use crate::proto::frame::Frame;

/// A RESP encoder that converts [`Frame`] types to bytes.
///
/// Frames accumulate in an internal buffer until [`take`](Encoder::take) is
/// called, which lets a writer batch a whole pipeline into one socket write.
///
/// # Example
///
/// ```
/// use muxplex::proto::codec::Encoder;
/// use muxplex::proto::frame::Frame;
///
/// let mut encoder = Encoder::new();
/// encoder.encode(&Frame::SimpleString(b"OK".to_vec()));
/// assert_eq!(encoder.take().as_ref(), b"+OK\r\n");
/// ```
#[derive(Debug)]
pub struct Encoder {
    buf: BytesMut,
}

impl Encoder {
    /// Creates a new encoder with an empty buffer.
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
        }
    }

    /// Encodes a frame into the internal buffer.
    pub fn encode(&mut self, frame: &Frame) {
        match frame {
            Frame::SimpleString(s) => self.put_line(b'+', s),
            Frame::Error(e) => self.put_line(b'-', e),
            Frame::Integer(n) => self.put_line(b':', n.to_string().as_bytes()),
            Frame::BulkString(Some(data)) => {
                self.put_line(b'$', data.len().to_string().as_bytes());
                self.buf.extend_from_slice(data);
                self.buf.extend_from_slice(b"\r\n");
            }
            Frame::BulkString(None) | Frame::Null => self.buf.extend_from_slice(b"$-1\r\n"),
            Frame::Array(items) => {
                self.put_line(b'*', items.len().to_string().as_bytes());
                for item in items {
                    self.encode(item);
                }
            }
        }
    }

    fn put_line(&mut self, prefix: u8, body: &[u8]) {
        self.buf.put_u8(prefix);
        self.buf.extend_from_slice(body);
        self.buf.extend_from_slice(b"\r\n");
    }

    /// Number of bytes waiting in the buffer.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns true if nothing has been encoded since the last take.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Takes the encoded data, leaving the encoder empty and reusable.
    pub fn take(&mut self) -> Bytes {
        self.buf.split().freeze()
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}
