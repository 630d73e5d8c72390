//! DNS request/response matching.
//!
//! Pairs queries and answers by transaction id; pairing is order-independent (either may
//! arrive first). Unmatched queries expire after `dns_request_timeout_ms`.

mod parser;

pub use parser::DnsParser;
