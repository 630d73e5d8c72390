//! Protocol parsers.
//!
//! Every parser implements [`StreamParser`]; [`Parser`] is a tagged-variant dispatcher so
//! the connection observer holds one value instead of a trait object, at the cost of one
//! `match` per call.

pub mod dns;
pub mod dubbo;
pub mod http;
pub mod kafka;
pub mod mysql;
pub mod pgsql;
pub mod reassembly;
pub mod redis;

use std::sync::Arc;

use crate::aggregate::ProtocolEventAggregators;
use crate::error::ParseOutcome;
use crate::ingress::{PacketEventData, PacketEventHeader};
use crate::sampler::Sampler;
use crate::stats::Protocol;

/// Shared, creation-time context every parser needs to emit exchanges and details: the
/// flow's identity, the aggregator holder, and configured limits. Cheap to clone (one
/// `Arc` and a handful of small fields).
#[derive(Clone)]
pub struct ParserContext {
    pub protocol: Protocol,
    pub flow_key: crate::flow::FlowKey,
    pub proc_meta: crate::ingress::ProcMeta,
    pub aggregators: Arc<ProtocolEventAggregators>,
    pub cache_limit_bytes: usize,
    pub dns_request_timeout_ms: u64,
}

/// Common contract every protocol parser implements.
pub trait StreamParser {
    /// Absorbs one packet's data, matching it against in-flight state. May produce zero
    /// or more exchanges, recorded directly against `ctx.aggregators`.
    fn on_data(
        &mut self,
        ctx: &ParserContext,
        header: &PacketEventHeader,
        data: &PacketEventData,
        sampler: &mut Sampler,
    ) -> ParseOutcome;

    /// Returns `true` when this parser's retained state is empty or provably stale
    /// under `size_limit_bytes`/`now_ns`, i.e. the observer may destroy it.
    fn garbage_collection(&mut self, size_limit_bytes: usize, now_ns: u64) -> bool;

    /// Bytes currently retained in reassembly buffers and pending-match tables.
    fn cache_size(&self) -> usize;
}

/// Tagged-variant dispatcher over every protocol parser.
pub enum Parser {
    Http(http::HttpParser),
    Dns(dns::DnsParser),
    MySql(mysql::MySqlParser),
    Redis(redis::RedisParser),
    PgSql(pgsql::PgSqlParser),
    Dubbo(dubbo::DubboParser),
    Kafka(kafka::KafkaParser),
}

impl Parser {
    pub fn new(protocol: Protocol, ctx: ParserContext) -> Self {
        match protocol {
            Protocol::Http => Parser::Http(http::HttpParser::new(ctx)),
            Protocol::Dns => Parser::Dns(dns::DnsParser::new(ctx)),
            Protocol::MySql => Parser::MySql(mysql::MySqlParser::new(ctx)),
            Protocol::Redis => Parser::Redis(redis::RedisParser::new(ctx)),
            Protocol::PgSql => Parser::PgSql(pgsql::PgSqlParser::new(ctx)),
            Protocol::Dubbo => Parser::Dubbo(dubbo::DubboParser::new(ctx)),
            Protocol::Kafka => Parser::Kafka(kafka::KafkaParser::new(ctx)),
        }
    }
}

impl StreamParser for Parser {
    fn on_data(
        &mut self,
        ctx: &ParserContext,
        header: &PacketEventHeader,
        data: &PacketEventData,
        sampler: &mut Sampler,
    ) -> ParseOutcome {
        match self {
            Parser::Http(p) => p.on_data(ctx, header, data, sampler),
            Parser::Dns(p) => p.on_data(ctx, header, data, sampler),
            Parser::MySql(p) => p.on_data(ctx, header, data, sampler),
            Parser::Redis(p) => p.on_data(ctx, header, data, sampler),
            Parser::PgSql(p) => p.on_data(ctx, header, data, sampler),
            Parser::Dubbo(p) => p.on_data(ctx, header, data, sampler),
            Parser::Kafka(p) => p.on_data(ctx, header, data, sampler),
        }
    }

    fn garbage_collection(&mut self, size_limit_bytes: usize, now_ns: u64) -> bool {
        match self {
            Parser::Http(p) => p.garbage_collection(size_limit_bytes, now_ns),
            Parser::Dns(p) => p.garbage_collection(size_limit_bytes, now_ns),
            Parser::MySql(p) => p.garbage_collection(size_limit_bytes, now_ns),
            Parser::Redis(p) => p.garbage_collection(size_limit_bytes, now_ns),
            Parser::PgSql(p) => p.garbage_collection(size_limit_bytes, now_ns),
            Parser::Dubbo(p) => p.garbage_collection(size_limit_bytes, now_ns),
            Parser::Kafka(p) => p.garbage_collection(size_limit_bytes, now_ns),
        }
    }

    fn cache_size(&self) -> usize {
        match self {
            Parser::Http(p) => p.cache_size(),
            Parser::Dns(p) => p.cache_size(),
            Parser::MySql(p) => p.cache_size(),
            Parser::Redis(p) => p.cache_size(),
            Parser::PgSql(p) => p.cache_size(),
            Parser::Dubbo(p) => p.cache_size(),
            Parser::Kafka(p) => p.cache_size(),
        }
    }
}

impl Parser {
    pub fn protocol(&self) -> Protocol {
        match self {
            Parser::Http(_) => Protocol::Http,
            Parser::Dns(_) => Protocol::Dns,
            Parser::MySql(_) => Protocol::MySql,
            Parser::Redis(_) => Protocol::Redis,
            Parser::PgSql(_) => Protocol::PgSql,
            Parser::Dubbo(_) => Protocol::Dubbo,
            Parser::Kafka(_) => Protocol::Kafka,
        }
    }
}
