//! Protocol-event aggregation and the detail stream.
//!
//! One sub-aggregator per protocol, co-located in [`ProtocolEventAggregators`] so the
//! connection observer holds a single `Arc` reference. Each sub-aggregator stripes its
//! keyed buckets across `N` `Mutex<HashMap<...>>` shards, selected by a hash of the key,
//! so unrelated keys never block each other. `add_exchange` updates aggregate counters
//! unconditionally; the sampler only gates whether a matching detail is pushed onto the
//! bounded detail channel.

mod detail_stream;

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

use hdrhistogram::Histogram;
use serde::Serialize;

use crate::flow::{FlowKey, L4Protocol};
use crate::ingress::ProcMeta;
use crate::stats::Protocol;

pub use detail_stream::DetailStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeStatus {
    Ok,
    Error,
}

/// The output of matching a request with its response, handed briefly to the aggregator
/// then dropped.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub flow_key: FlowKey,
    pub proc_meta: ProcMeta,
    pub protocol: Protocol,
    /// Endpoint identity: for most protocols the responder's address; callers may widen
    /// this (e.g. a virtual-service name) without changing the aggregation contract.
    pub endpoint: String,
    /// Salient operation key: HTTP method+path, DNS qname+qtype, SQL statement
    /// fingerprint, Redis command, Kafka topic+api-key, Dubbo service+method, Postgres
    /// command.
    pub operation: String,
    pub start_ns: u64,
    pub duration_ns: u64,
    pub status: ExchangeStatus,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub attributes: HashMap<String, String>,
}

/// A record delivered over the detail channel, one per sampled exchange.
#[derive(Debug, Clone, Serialize)]
pub struct ProtocolDetail {
    pub flow_key_display: String,
    pub l4: L4Protocol,
    pub proc_meta: ProcMetaRecord,
    pub protocol: &'static str,
    pub operation: String,
    pub start_ns: u64,
    pub duration_ns: u64,
    pub status: &'static str,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub attributes: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcMetaRecord {
    pub pid: u32,
    pub container_id: String,
}

impl From<&Exchange> for ProtocolDetail {
    fn from(e: &Exchange) -> Self {
        ProtocolDetail {
            flow_key_display: e.flow_key.to_string(),
            l4: e.flow_key.l4,
            proc_meta: ProcMetaRecord {
                pid: e.proc_meta.pid,
                container_id: e.proc_meta.container_id.clone(),
            },
            protocol: e.protocol.name(),
            operation: e.operation.clone(),
            start_ns: e.start_ns,
            duration_ns: e.duration_ns,
            status: match e.status {
                ExchangeStatus::Ok => "ok",
                ExchangeStatus::Error => "error",
            },
            bytes_in: e.bytes_in,
            bytes_out: e.bytes_out,
            attributes: e.attributes.clone(),
        }
    }
}

/// One (protocol, endpoint, operation) bucket.
struct AggEntry {
    count: u64,
    error_count: u64,
    bytes_in: u64,
    bytes_out: u64,
    latency_ns: Histogram<u64>,
}

impl AggEntry {
    fn new() -> Self {
        AggEntry {
            count: 0,
            error_count: 0,
            bytes_in: 0,
            bytes_out: 0,
            // 1ns .. ~1000s, 3 significant digits: ample for request/response latencies.
            latency_ns: Histogram::new_with_bounds(1, 1_000_000_000_000, 3)
                .expect("valid histogram bounds"),
        }
    }

    fn record(&mut self, e: &Exchange) {
        self.count += 1;
        if e.status == ExchangeStatus::Error {
            self.error_count += 1;
        }
        self.bytes_in += e.bytes_in;
        self.bytes_out += e.bytes_out;
        let _ = self.latency_ns.record(e.duration_ns);
    }

    fn snapshot(&self) -> LatencySummary {
        LatencySummary {
            p50_ns: self.latency_ns.value_at_quantile(0.5),
            p90_ns: self.latency_ns.value_at_quantile(0.9),
            p99_ns: self.latency_ns.value_at_quantile(0.99),
            max_ns: self.latency_ns.max(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LatencySummary {
    pub p50_ns: u64,
    pub p90_ns: u64,
    pub p99_ns: u64,
    pub max_ns: u64,
}

/// One flushed (protocol, endpoint, operation, window) rollup.
#[derive(Debug, Clone, Serialize)]
pub struct AggregatedRecord {
    pub protocol: &'static str,
    pub endpoint: String,
    pub operation: String,
    pub window_start_ns: u64,
    pub window_end_ns: u64,
    pub count: u64,
    pub error_count: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub latency: LatencySummary,
}

const NUM_STRIPES: usize = 16;

/// Striped keyed aggregator for a single protocol.
struct Aggregator {
    stripes: Vec<Mutex<HashMap<(String, String), AggEntry>>>,
}

impl Aggregator {
    fn new() -> Self {
        Aggregator {
            stripes: (0..NUM_STRIPES).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn stripe_for(&self, endpoint: &str, operation: &str) -> &Mutex<HashMap<(String, String), AggEntry>> {
        let mut hasher = DefaultHasher::new();
        endpoint.hash(&mut hasher);
        operation.hash(&mut hasher);
        &self.stripes[(hasher.finish() as usize) % self.stripes.len()]
    }

    fn add_exchange(&self, e: &Exchange) {
        let stripe = self.stripe_for(&e.endpoint, &e.operation);
        let mut map = stripe.lock().unwrap();
        map.entry((e.endpoint.clone(), e.operation.clone()))
            .or_insert_with(AggEntry::new)
            .record(e);
    }

    /// Emits and clears every bucket, for the given window bounds.
    fn flush(&self, protocol: &'static str, window_start_ns: u64, window_end_ns: u64) -> Vec<AggregatedRecord> {
        let mut out = Vec::new();
        for stripe in &self.stripes {
            let mut map = stripe.lock().unwrap();
            for ((endpoint, operation), entry) in map.drain() {
                out.push(AggregatedRecord {
                    protocol,
                    endpoint,
                    operation,
                    window_start_ns,
                    window_end_ns,
                    count: entry.count,
                    error_count: entry.error_count,
                    bytes_in: entry.bytes_in,
                    bytes_out: entry.bytes_out,
                    latency: entry.snapshot(),
                });
            }
        }
        out
    }
}

/// Holds one [`Aggregator`] per protocol and the shared detail stream. Shared via `Arc`
/// across all shards; the observer holds a single reference.
pub struct ProtocolEventAggregators {
    by_protocol: [Aggregator; crate::stats::NUM_PROTOCOLS],
    detail_stream: DetailStream,
}

impl ProtocolEventAggregators {
    pub fn new(detail_channel_capacity: usize) -> Self {
        ProtocolEventAggregators {
            by_protocol: std::array::from_fn(|_| Aggregator::new()),
            detail_stream: DetailStream::new(detail_channel_capacity),
        }
    }

    fn index(protocol: Protocol) -> usize {
        match protocol {
            Protocol::Http => 0,
            Protocol::Dns => 1,
            Protocol::MySql => 2,
            Protocol::Redis => 3,
            Protocol::PgSql => 4,
            Protocol::Dubbo => 5,
            Protocol::Kafka => 6,
        }
    }

    /// Updates aggregate counters unconditionally, regardless of sampling.
    pub fn add_exchange(&self, e: &Exchange) {
        self.by_protocol[Self::index(e.protocol)].add_exchange(e);
    }

    /// Pushes a detail record onto the bounded channel, dropping the oldest queued
    /// record on backpressure.
    pub fn add_detail(&self, detail: ProtocolDetail) {
        self.detail_stream.push(detail);
    }

    pub fn detail_receiver(&self) -> crossbeam_channel::Receiver<ProtocolDetail> {
        self.detail_stream.receiver()
    }

    pub fn dropped_details(&self) -> u64 {
        self.detail_stream.dropped()
    }

    /// Flushes every protocol's buckets for the given window, returning the snapshot.
    pub fn flush(&self, window_start_ns: u64, window_end_ns: u64) -> Vec<AggregatedRecord> {
        let mut out = Vec::new();
        for protocol in [
            Protocol::Http,
            Protocol::Dns,
            Protocol::MySql,
            Protocol::Redis,
            Protocol::PgSql,
            Protocol::Dubbo,
            Protocol::Kafka,
        ] {
            out.extend(self.by_protocol[Self::index(protocol)].flush(
                protocol.name(),
                window_start_ns,
                window_end_ns,
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn flow_key() -> FlowKey {
        FlowKey::new(
            "127.0.0.1:1234".parse::<SocketAddr>().unwrap(),
            "127.0.0.1:80".parse::<SocketAddr>().unwrap(),
            L4Protocol::Tcp,
        )
    }

    fn exchange(status: ExchangeStatus, duration_ns: u64) -> Exchange {
        Exchange {
            flow_key: flow_key(),
            proc_meta: ProcMeta::default(),
            protocol: Protocol::Http,
            endpoint: "127.0.0.1:80".to_string(),
            operation: "GET /".to_string(),
            start_ns: 0,
            duration_ns,
            status,
            bytes_in: 10,
            bytes_out: 20,
            attributes: HashMap::new(),
        }
    }

    #[test]
    fn flush_resets_counters_but_keeps_production_stats_alive() {
        let aggs = ProtocolEventAggregators::new(16);
        aggs.add_exchange(&exchange(ExchangeStatus::Ok, 1_000_000));
        aggs.add_exchange(&exchange(ExchangeStatus::Error, 2_000_000));
        let records = aggs.flush(0, 1_000_000_000);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].count, 2);
        assert_eq!(records[0].error_count, 1);

        let empty = aggs.flush(1_000_000_000, 2_000_000_000);
        assert!(empty.is_empty());
    }

    #[test]
    fn detail_channel_delivers_pushed_records() {
        let aggs = ProtocolEventAggregators::new(4);
        let rx = aggs.detail_receiver();
        aggs.add_detail(ProtocolDetail::from(&exchange(ExchangeStatus::Ok, 500)));
        let detail = rx.try_recv().unwrap();
        assert_eq!(detail.operation, "GET /");
    }
}
