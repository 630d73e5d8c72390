//! Sharded connection table.
//!
//! One instance per worker shard; holds observers keyed by [`ConnId`]. Capacity is
//! per-shard (`max_connections`): admission evicts the observer with the oldest
//! `last_data_time` first, realized with a `hashlink::LinkedHashMap` that moves a key to
//! the back on every touch so the front is always the least-recently-used entry.
//!
//! The periodic GC sweep is driven by a `crossbeam_channel::tick` ticker. This table
//! performs a plain linear sweep each tick rather than bucketing by expiry, since a
//! shard's table is bounded by `max_connections` and a full scan at the configured
//! `gc_interval_ms` is cheap at that scale.

use std::sync::Arc;

use hashlink::LinkedHashMap;

use crate::aggregate::ProtocolEventAggregators;
use crate::config::Config;
use crate::flow::{ConnId, FlowKey};
use crate::ingress::{PacketEventData, PacketEventHeader, ProcMeta};
use crate::stats::Stats;

use super::observer::Observer;

pub struct ConnTable {
    entries: LinkedHashMap<ConnId, Observer>,
    max_connections: usize,
    config: Arc<Config>,
    aggregators: Arc<ProtocolEventAggregators>,
    stats: Arc<Stats>,
}

impl ConnTable {
    pub fn new(config: Arc<Config>, aggregators: Arc<ProtocolEventAggregators>, stats: Arc<Stats>) -> Self {
        let max_connections = config.observer.max_connections;
        ConnTable {
            entries: LinkedHashMap::new(),
            max_connections,
            config,
            aggregators,
            stats,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Routes one packet event to its observer, creating the observer (and evicting the
    /// least-recently-used one if the shard is at capacity) on first packet of a flow.
    pub fn on_packet(&mut self, header: PacketEventHeader, data: PacketEventData) {
        let flow_key = header.flow_key;
        let conn_id = flow_key.conn_id();

        if !self.entries.contains_key(&conn_id) && self.entries.len() >= self.max_connections {
            self.entries.pop_front();
        }

        let config = Arc::clone(&self.config);
        let aggregators = Arc::clone(&self.aggregators);
        let stats = Arc::clone(&self.stats);
        let proc_meta = header.proc_meta.clone();
        let time_nano = header.time_nano;
        let observer = self
            .entries
            .entry(conn_id.clone())
            .or_insert_with(|| Observer::new(flow_key, proc_meta, time_nano, config, aggregators, stats));
        observer.on_data(&header, &data);
        self.entries.to_back(&conn_id);
    }

    /// Marks the observer for `flow_key` logically closed, if present (e.g. on FIN/RST).
    pub fn mark_closed(&mut self, flow_key: &FlowKey) {
        if let Some(observer) = self.entries.get_mut(&flow_key.conn_id()) {
            observer.mark_deleted();
        }
    }

    /// Runs one GC sweep: destroys every observer whose `garbage_collect` returns
    /// `true`, and refreshes the `connection_num`/`connection_cached_size` gauges from
    /// the survivors.
    pub fn sweep(&mut self, now_ns: u64) {
        let size_limit = self.config.observer.protocol_cache_limit_bytes;
        self.stats.reset_gauges();
        self.entries.retain(|_, observer| !observer.garbage_collect(size_limit, now_ns));
    }

    /// Destroys every observer regardless of its GC state, flushing the aggregator as a
    /// side effect of dropping each parser (shutdown drain).
    pub fn drain(&mut self) {
        self.entries.clear();
    }
}
