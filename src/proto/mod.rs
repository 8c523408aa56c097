//! # RESP protocol
//!
//! Frame types, a streaming codec and the crate error type.
//!
//! ## Modules
//!
//! - [`codec`] - Encoder and decoder for RESP protocol
//! - [`error`] - Error types shared by every layer of the engine
//! - [`frame`] - Frame types representing RESP data structures

pub mod codec;
/// Error types.
pub mod error;
pub mod frame;
