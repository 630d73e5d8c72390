//! Network observation core: connection tracking, protocol parsing, sampling,
//! aggregation, and garbage collection for an out-of-process packet capture source.
//!
//! The engine (see [`engine::Engine`]) owns a fixed pool of shards; each shard pairs a
//! [`conn::ConnTable`] with a worker thread. An ingress thread pulls `(header, data)`
//! pairs from an [`ingress::PacketSource`] and hash-dispatches them by flow key so a
//! given connection is always handled by the same shard.

pub mod aggregate;
pub mod config;
pub mod conn;
pub mod engine;
pub mod error;
pub mod flow;
pub mod ingress;
pub mod protocols;
pub mod sampler;
pub mod stats;

pub use config::Config;
pub use engine::Engine;
pub use error::{ConfigError, IngressError, ParseOutcome};
pub use flow::{ConnId, FlowKey, L4Protocol};
