//! Domain ports (interfaces) for the zagara coordination substrate.

pub mod codec;
pub mod compressor;
pub mod handler;

pub use codec::MessageCodec;
pub use compressor::SnapshotCompressor;
pub use handler::{handler_fn, FnHandler, MessageHandler};
