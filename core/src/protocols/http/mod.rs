//! HTTP/1.x parsing.
//!
//! Request/response headers only; bodies are not reassembled. Pipelined requests are
//! matched to responses in FIFO order.

mod parser;
mod transaction;

pub use parser::HttpParser;
