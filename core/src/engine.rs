//! Engine / worker pool.
//!
//! Wires the ingress adapter to a fixed pool of shards, each running on its own worker
//! thread so a flow is always handled by the same shard (no cross-shard locking on the
//! hot path). A dedicated GC thread ticks on `gc_interval_ms` and sweeps every shard's
//! table in turn. Shutdown closes the ingress dispatcher, joins the worker pool
//! (draining whatever is already queued), stops the GC thread, and performs one final
//! drain-and-flush so no buffered exchange is lost.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, select, tick};

use netobs_multicore::{ChannelDispatcher, ChannelMode, ShardId, WorkerPool};

use crate::aggregate::{AggregatedRecord, ProtocolEventAggregators};
use crate::config::Config;
use crate::conn::ConnTable;
use crate::error::IngressError;
use crate::ingress::{shard_for_flow, PacketSource, RawPacketEvent};
use crate::stats::Stats;

/// Returns the current wall-clock time in nanoseconds since the Unix epoch, the engine's
/// sole clock source for GC decisions and window bounds.
pub fn now_ns() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

/// Owns the running engine: the ingress thread, the worker pool, and the GC thread.
/// Dropping an `Engine` without calling [`Engine::shutdown`] leaves its threads running
/// detached; callers should always shut down explicitly.
pub struct Engine {
    config: Arc<Config>,
    stats: Arc<Stats>,
    aggregators: Arc<ProtocolEventAggregators>,
    tables: Arc<Vec<Mutex<ConnTable>>>,
    dispatcher: Arc<ChannelDispatcher<RawPacketEvent>>,
    running: Arc<AtomicBool>,
    ingress_handle: Option<JoinHandle<()>>,
    worker_pool: Option<WorkerPool>,
    gc_handle: Option<JoinHandle<()>>,
    gc_stop: Option<crossbeam_channel::Sender<()>>,
}

impl Engine {
    /// Starts the engine: one table per shard, one worker thread per shard, a GC thread,
    /// and an ingress thread draining `source` and hash-dispatching each event to its
    /// shard by flow key.
    pub fn spawn<S>(source: S, config: Arc<Config>) -> Self
    where
        S: PacketSource + 'static,
    {
        let stats = Arc::new(Stats::new(config.observer.protocol_stat_enabled));
        let aggregators = Arc::new(ProtocolEventAggregators::new(config.observer.channel_capacity));
        let num_shards = config.observer.num_shards.max(1);

        let tables: Vec<Mutex<ConnTable>> = (0..num_shards)
            .map(|_| Mutex::new(ConnTable::new(Arc::clone(&config), Arc::clone(&aggregators), Arc::clone(&stats))))
            .collect();
        let tables = Arc::new(tables);

        let dispatcher = Arc::new(ChannelDispatcher::new(
            ChannelMode::PerShard(num_shards),
            config.observer.channel_capacity,
        ));

        let receivers: Vec<(ShardId, crossbeam::channel::Receiver<RawPacketEvent>)> = (0..num_shards)
            .map(|i| {
                let shard = ShardId(i);
                let rx = dispatcher.receiver(Some(shard));
                (shard, (*rx).clone())
            })
            .collect();

        let worker_tables = Arc::clone(&tables);
        let worker_pool = WorkerPool::spawn(receivers, move |shard, event: RawPacketEvent| {
            let mut table = worker_tables[shard.0].lock().unwrap();
            table.on_packet(event.header, event.data);
        });

        let running = Arc::new(AtomicBool::new(true));

        let ingress_handle = {
            let dispatcher = Arc::clone(&dispatcher);
            let running = Arc::clone(&running);
            let mut source = source;
            Some(
                thread::Builder::new()
                    .name("netobs-ingress".to_string())
                    .spawn(move || {
                        while running.load(Ordering::Relaxed) {
                            match source.next_event() {
                                Some(Ok(event)) => {
                                    let shard = ShardId(shard_for_flow(&event.header.flow_key, num_shards));
                                    if dispatcher.dispatch(event, Some(shard)).is_err() {
                                        log::warn!("ingress dispatch dropped an event, shard {shard} full");
                                    }
                                }
                                Some(Err(IngressError::BadCapture)) => {
                                    log::warn!("ingress adapter reported a malformed capture event");
                                }
                                Some(Err(IngressError::Disconnected)) | None => break,
                            }
                        }
                        dispatcher.close();
                    })
                    .expect("failed to spawn ingress thread"),
            )
        };

        let (gc_stop_tx, gc_stop_rx) = bounded::<()>(0);
        let gc_handle = {
            let tables = Arc::clone(&tables);
            let interval = Duration::from_millis(config.observer.gc_interval_ms.max(1));
            Some(
                thread::Builder::new()
                    .name("netobs-gc".to_string())
                    .spawn(move || {
                        let ticker = tick(interval);
                        loop {
                            select! {
                                recv(ticker) -> _ => {
                                    let now = now_ns();
                                    for table in tables.iter() {
                                        table.lock().unwrap().sweep(now);
                                    }
                                }
                                recv(gc_stop_rx) -> _ => break,
                            }
                        }
                    })
                    .expect("failed to spawn GC thread"),
            )
        };

        Engine {
            config,
            stats,
            aggregators,
            tables,
            dispatcher,
            running,
            ingress_handle,
            worker_pool: Some(worker_pool),
            gc_handle,
            gc_stop: Some(gc_stop_tx),
        }
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    pub fn aggregators(&self) -> &Arc<ProtocolEventAggregators> {
        &self.aggregators
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Flushes every shard's aggregators for `[window_start_ns, window_end_ns)` without
    /// stopping the engine.
    pub fn flush(&self, window_start_ns: u64, window_end_ns: u64) -> Vec<AggregatedRecord> {
        self.aggregators.flush(window_start_ns, window_end_ns)
    }

    /// Stops ingress, joins the worker pool, stops the GC thread, drains every shard's
    /// table, and performs one last aggregator flush so buffered exchanges are not
    /// silently lost on shutdown.
    pub fn shutdown(mut self) -> Vec<AggregatedRecord> {
        self.running.store(false, Ordering::Relaxed);
        self.dispatcher.close();

        if let Some(handle) = self.ingress_handle.take() {
            let _ = handle.join();
        }
        if let Some(pool) = self.worker_pool.take() {
            pool.join();
        }
        drop(self.gc_stop.take());
        if let Some(handle) = self.gc_handle.take() {
            let _ = handle.join();
        }

        for table in self.tables.iter() {
            table.lock().unwrap().drain();
        }

        self.aggregators.flush(0, now_ns())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_config;
    use crate::flow::{FlowKey, L4Protocol};
    use crate::ingress::{MsgTypeHint, PacketDir, PacketEventData, PacketEventHeader, ProcMeta, ProtocolTag, VecPacketSource};
    use std::net::SocketAddr;
    use std::time::Duration as StdDuration;

    fn addr(p: u16) -> SocketAddr {
        format!("127.0.0.1:{p}").parse().unwrap()
    }

    #[test]
    fn engine_processes_queued_events_and_shuts_down_cleanly() {
        let mut config = default_config();
        config.observer.num_shards = 1;
        config.observer.gc_interval_ms = 50;
        let config = Arc::new(config);

        let flow_key = FlowKey::new(addr(1234), addr(80), L4Protocol::Tcp);
        let header = PacketEventHeader {
            time_nano: now_ns(),
            flow_key,
            proc_meta: ProcMeta::default(),
        };
        let request = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n".to_vec();
        let data = PacketEventData::new(ProtocolTag::Http, PacketDir::ClientToServer, MsgTypeHint::Request, request, 0);
        let source = VecPacketSource::new(vec![RawPacketEvent {
            header: header.clone(),
            data,
        }]);

        let engine = Engine::spawn(source, config);
        thread::sleep(StdDuration::from_millis(100));
        let records = engine.shutdown();
        assert!(records.is_empty());
    }
}
