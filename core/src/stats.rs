//! Process-wide statistics.
//!
//! Two counter sets: a production set (monotonic, never reset) and a debug set (window-
//! based, reset on each snapshot). Both are relaxed atomics shared across shards via
//! `Arc`. `protocol_stat_enabled` gates whether the debug set is populated at all.

#[cfg(feature = "prometheus")]
pub mod prometheus;

use std::sync::atomic::{AtomicU64, Ordering};

use strum_macros::EnumIter;

/// Per-protocol counters: `Count`, `ParseFailCount`, `DropCount`, `ConnectionNum`,
/// `ConnectionCachedSize`.
#[derive(Default)]
pub struct ProtocolCounters {
    pub count: AtomicU64,
    pub parse_fail_count: AtomicU64,
    pub drop_count: AtomicU64,
    pub connection_num: AtomicU64,
    pub connection_cached_size: AtomicU64,
}

impl ProtocolCounters {
    fn reset(&self) {
        self.count.store(0, Ordering::Relaxed);
        self.parse_fail_count.store(0, Ordering::Relaxed);
        self.drop_count.store(0, Ordering::Relaxed);
        self.connection_num.store(0, Ordering::Relaxed);
        self.connection_cached_size.store(0, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ProtocolCountersSnapshot {
        ProtocolCountersSnapshot {
            count: self.count.load(Ordering::Relaxed),
            parse_fail_count: self.parse_fail_count.load(Ordering::Relaxed),
            drop_count: self.drop_count.load(Ordering::Relaxed),
            connection_num: self.connection_num.load(Ordering::Relaxed),
            connection_cached_size: self.connection_cached_size.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProtocolCountersSnapshot {
    pub count: u64,
    pub parse_fail_count: u64,
    pub drop_count: u64,
    pub connection_num: u64,
    pub connection_cached_size: u64,
}

/// Indexes [`ProtocolCounters`] per protocol with a table indexed by tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter)]
pub enum Protocol {
    Http,
    Dns,
    MySql,
    Redis,
    PgSql,
    Dubbo,
    Kafka,
}

pub const NUM_PROTOCOLS: usize = 7;

impl Protocol {
    fn index(self) -> usize {
        match self {
            Protocol::Http => 0,
            Protocol::Dns => 1,
            Protocol::MySql => 2,
            Protocol::Redis => 3,
            Protocol::PgSql => 4,
            Protocol::Dubbo => 5,
            Protocol::Kafka => 6,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Dns => "dns",
            Protocol::MySql => "mysql",
            Protocol::Redis => "redis",
            Protocol::PgSql => "pgsql",
            Protocol::Dubbo => "dubbo",
            Protocol::Kafka => "kafka",
        }
    }
}

/// One counter set (production or debug).
#[derive(Default)]
pub struct CounterSet {
    by_protocol: [ProtocolCounters; NUM_PROTOCOLS],
}

impl CounterSet {
    fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, protocol: Protocol) -> &ProtocolCounters {
        &self.by_protocol[protocol.index()]
    }

    pub fn snapshot(&self) -> [ProtocolCountersSnapshot; NUM_PROTOCOLS] {
        std::array::from_fn(|i| self.by_protocol[i].snapshot())
    }

    fn reset(&self) {
        for counters in &self.by_protocol {
            counters.reset();
        }
    }
}

/// The production (monotonic) and debug (window-reset) counter sets, constructed
/// explicitly at engine construction rather than as process-wide singletons. Tests
/// instantiate their own via [`Stats::new`].
pub struct Stats {
    production: CounterSet,
    debug: CounterSet,
    debug_enabled: bool,
}

impl Stats {
    pub fn new(debug_enabled: bool) -> Self {
        Stats {
            production: CounterSet::new(),
            debug: CounterSet::new(),
            debug_enabled,
        }
    }

    pub fn production(&self) -> &CounterSet {
        &self.production
    }

    /// Returns the debug counter set if `protocol_stat_enabled`, else `None`.
    pub fn debug(&self) -> Option<&CounterSet> {
        self.debug_enabled.then_some(&self.debug)
    }

    /// Increments both counter sets' `count` for `protocol`.
    pub fn inc_count(&self, protocol: Protocol) {
        self.production.get(protocol).count.fetch_add(1, Ordering::Relaxed);
        if self.debug_enabled {
            self.debug.get(protocol).count.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn inc_parse_fail(&self, protocol: Protocol) {
        self.production
            .get(protocol)
            .parse_fail_count
            .fetch_add(1, Ordering::Relaxed);
        if self.debug_enabled {
            self.debug
                .get(protocol)
                .parse_fail_count
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn inc_drop(&self, protocol: Protocol) {
        self.production.get(protocol).drop_count.fetch_add(1, Ordering::Relaxed);
        if self.debug_enabled {
            self.debug.get(protocol).drop_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// `connection_num`/`connection_cached_size` are gauges, not monotonic counters:
    /// the connection table zeroes them with [`Stats::reset_gauges`] before each GC
    /// sweep, then tallies live connections back in with these two.
    pub fn add_connection_num(&self, protocol: Protocol, delta: u64) {
        self.production
            .get(protocol)
            .connection_num
            .fetch_add(delta, Ordering::Relaxed);
    }

    pub fn add_connection_cached_size(&self, protocol: Protocol, delta: u64) {
        self.production
            .get(protocol)
            .connection_cached_size
            .fetch_add(delta, Ordering::Relaxed);
    }

    pub fn reset_gauges(&self) {
        for counters in &self.production.by_protocol {
            counters.connection_num.store(0, Ordering::Relaxed);
            counters.connection_cached_size.store(0, Ordering::Relaxed);
        }
    }

    /// Resets the debug counter set's window. The production set is monotonic and is
    /// never reset.
    pub fn reset_debug_window(&self) {
        if self.debug_enabled {
            self.debug.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn production_counters_are_monotonic_across_debug_resets() {
        let stats = Stats::new(true);
        stats.inc_count(Protocol::Http);
        stats.inc_count(Protocol::Http);
        stats.reset_debug_window();
        assert_eq!(stats.production().get(Protocol::Http).count.load(Ordering::Relaxed), 2);
        assert_eq!(stats.debug().unwrap().get(Protocol::Http).count.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn debug_disabled_does_not_populate_debug_set() {
        let stats = Stats::new(false);
        stats.inc_count(Protocol::Dns);
        assert!(stats.debug().is_none());
        assert_eq!(stats.production().get(Protocol::Dns).count.load(Ordering::Relaxed), 1);
    }
}
