//! Fixed-size worker pool.
//!
//! Each worker owns exactly one shard's receiver: since the engine dispatches every
//! unit of work for a flow to the same shard, a worker never needs to coordinate with
//! its siblings and can process its receiver in a plain loop, no `Select` required.

use crate::ShardId;
use crossbeam::channel::Receiver;
use log::{info, warn};
use std::thread::{self, JoinHandle};

/// Spawns and owns the threads that drain a set of per-shard receivers.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns one thread per entry in `receivers`, each running `handler` on every item
    /// it receives until its channel is closed and drained.
    pub fn spawn<T, F>(receivers: Vec<(ShardId, Receiver<T>)>, handler: F) -> Self
    where
        T: Send + 'static,
        F: Fn(ShardId, T) + Send + Sync + Clone + 'static,
    {
        let mut handles = Vec::with_capacity(receivers.len());
        for (shard, receiver) in receivers {
            let handler = handler.clone();
            let handle = thread::Builder::new()
                .name(format!("netobs-worker-{shard}"))
                .spawn(move || {
                    info!("worker {shard} started");
                    loop {
                        match receiver.recv() {
                            Ok(item) => handler(shard, item),
                            Err(_) => {
                                info!("worker {shard} exiting, channel closed");
                                break;
                            }
                        }
                    }
                })
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }
        Self { handles }
    }

    /// Blocks until every worker thread has exited (its channel was closed and drained).
    pub fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.join() {
                warn!("worker thread panicked: {e:?}");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}
