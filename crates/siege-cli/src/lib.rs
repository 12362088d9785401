//! Tower Siege client library: the `sieged` HTTP API and its event stream.

pub mod client;
pub mod sse;

pub use client::{Cursor, SiegeClient};
pub use sse::{SseBlock, SseParser};
