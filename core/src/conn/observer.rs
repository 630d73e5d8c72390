//! Connection observer state machine.
//!
//! Implicit states: **Empty** -> **Bound(P)** on first data whose protocol tag is `P` ->
//! **Bound(P')** on a packet tagged `P' != P` (tears down `P`, increments the switch
//! counter, creates `P'`) -> **MarkedDeleted** on explicit close -> **Destroyed** by GC.

use std::sync::Arc;

use crate::aggregate::ProtocolEventAggregators;
use crate::config::Config;
use crate::flow::FlowKey;
use crate::ingress::{PacketEventData, PacketEventHeader, ProcMeta, ProtocolTag};
use crate::protocols::{Parser, ParserContext, StreamParser};
use crate::sampler::Sampler;
use crate::stats::{Protocol, Stats};

fn protocol_for_tag(tag: ProtocolTag) -> Option<Protocol> {
    match tag {
        ProtocolTag::None => None,
        ProtocolTag::Http => Some(Protocol::Http),
        ProtocolTag::Dns => Some(Protocol::Dns),
        ProtocolTag::MySql => Some(Protocol::MySql),
        ProtocolTag::Redis => Some(Protocol::Redis),
        ProtocolTag::PgSql => Some(Protocol::PgSql),
        ProtocolTag::Dubbo => Some(Protocol::Dubbo),
        ProtocolTag::Kafka => Some(Protocol::Kafka),
    }
}

fn protocol_enabled(config: &Config, protocol: Protocol) -> bool {
    let enable = &config.observer.protocol_enable;
    match protocol {
        Protocol::Http => enable.http,
        Protocol::Dns => enable.dns,
        Protocol::MySql => enable.mysql,
        Protocol::Redis => enable.redis,
        Protocol::PgSql => enable.pgsql,
        Protocol::Dubbo => enable.dubbo,
        Protocol::Kafka => enable.kafka,
    }
}

pub struct Observer {
    flow_key: FlowKey,
    proc_meta: ProcMeta,
    parser: Option<Parser>,
    sampler: Option<Sampler>,
    last_data_time: u64,
    marked_deleted: bool,
    switch_count: u32,
    config: Arc<Config>,
    aggregators: Arc<ProtocolEventAggregators>,
    stats: Arc<Stats>,
}

impl Observer {
    pub fn new(
        flow_key: FlowKey,
        proc_meta: ProcMeta,
        created_at_ns: u64,
        config: Arc<Config>,
        aggregators: Arc<ProtocolEventAggregators>,
        stats: Arc<Stats>,
    ) -> Self {
        Observer {
            flow_key,
            proc_meta,
            parser: None,
            sampler: None,
            last_data_time: created_at_ns,
            marked_deleted: false,
            switch_count: 0,
            config,
            aggregators,
            stats,
        }
    }

    pub fn last_data_time(&self) -> u64 {
        self.last_data_time
    }

    pub fn mark_deleted(&mut self) {
        self.marked_deleted = true;
    }

    pub fn on_data(&mut self, header: &PacketEventHeader, data: &PacketEventData) {
        self.last_data_time = header.time_nano;

        let Some(target) = protocol_for_tag(data.ptl_type) else {
            return;
        };
        if !protocol_enabled(&self.config, target) {
            return;
        }

        if let Some(parser) = &self.parser {
            if parser.protocol() != target {
                self.parser = None;
                self.switch_count += 1;
                if self.switch_count % 10 == 0 {
                    log::warn!(
                        "connection {} has switched protocols {} times",
                        self.flow_key,
                        self.switch_count
                    );
                }
            }
        }

        if self.sampler.is_none() {
            let rate = self.config.observer.sample_rate_for(target.name());
            self.sampler = Some(Sampler::new(rate));
        }

        let ctx = ParserContext {
            protocol: target,
            flow_key: self.flow_key,
            proc_meta: self.proc_meta.clone(),
            aggregators: Arc::clone(&self.aggregators),
            cache_limit_bytes: self.config.observer.protocol_cache_limit_bytes,
            dns_request_timeout_ms: self.config.observer.dns_request_timeout_ms,
        };
        if self.parser.is_none() {
            self.parser = Some(Parser::new(target, ctx.clone()));
        }

        let sampler = self.sampler.as_mut().expect("sampler constructed above");
        let outcome = self
            .parser
            .as_mut()
            .expect("parser constructed above")
            .on_data(&ctx, header, data, sampler);

        self.stats.inc_count(target);
        match outcome {
            crate::error::ParseOutcome::Ok => {}
            crate::error::ParseOutcome::Fail => self.stats.inc_parse_fail(target),
            crate::error::ParseOutcome::Drop => self.stats.inc_drop(target),
        }
    }

    /// Returns `true` iff the observer may be destroyed; evaluated with an explicit
    /// early return at each step, no fallthrough.
    pub fn garbage_collect(&mut self, size_limit_bytes: usize, now_ns: u64) -> bool {
        if self.marked_deleted
            && now_ns.saturating_sub(self.last_data_time) > self.config.observer.connection_closed_timeout_s * 1_000_000_000
        {
            return true;
        }
        if now_ns.saturating_sub(self.last_data_time) > self.config.observer.connection_timeout_s * 1_000_000_000 {
            return true;
        }
        let Some(parser) = self.parser.as_mut() else {
            return false;
        };
        if parser.garbage_collection(size_limit_bytes, now_ns) {
            true
        } else {
            self.stats.add_connection_num(parser.protocol(), 1);
            self.stats
                .add_connection_cached_size(parser.protocol(), parser.cache_size() as u64);
            false
        }
    }
}
