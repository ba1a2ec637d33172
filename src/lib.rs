//! Decrypting reverse-proxy gateway.
//!
//! Accepts chat-style JSON requests, transparently decrypts `ENC:`-marked
//! message contents, enforces a per-client concurrency ceiling, validates
//! the upstream target against a whitelist, and relays the upstream
//! response, buffered or streamed.

pub mod admin;
pub mod admission;
pub mod config;
pub mod crypto;
pub mod error;
pub mod gateway;

pub use config::{Config, ConfigStore};
pub use error::{GatewayError, Result};
pub use gateway::{router, Gateway};
