//! RESP codec.
//!
//! The engine itself only deals in [`Frame`](crate::proto::frame::Frame)s;
//! this codec is what the TCP transport uses to put them on a socket.

mod decoder;
mod encoder;

pub use decoder::Decoder;
pub use encoder::Encoder;
