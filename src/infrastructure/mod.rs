//! Infrastructure layer: Redis plumbing, codec, compressor, config, logging.

pub mod codec;
pub mod compressor;
pub mod config;
pub mod logging;
pub mod redis;

pub use codec::JsonCodec;
pub use compressor::GzipCompressor;
pub use config::ConfigLoader;
pub use redis::{KeySpace, RedisHandle};
