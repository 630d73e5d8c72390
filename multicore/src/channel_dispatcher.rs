//! Channel dispatcher.
//!
//! Operates in two modes:
//! - **Shared**: all work is sent through a single shared channel.
//! - **PerShard**: work is routed to one of `num_shards` channels by [`ShardId`].
//!
//! The dispatcher tracks dispatched/dropped counts and hands out clone-able receivers
//! for worker threads to consume.

use crate::{DispatchStats, ShardId};
use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Clone)]
pub enum ChannelMode {
    Shared,
    PerShard(usize),
}

type Channel<T> = (Option<Sender<T>>, Arc<Receiver<T>>);

enum Channels<T> {
    Shared(Channel<T>),
    PerShard(Vec<Channel<T>>),
}

/// A thread-safe interface for dispatching work items of type `T` to worker channels.
pub struct ChannelDispatcher<T> {
    channels: Mutex<Channels<T>>,
    stats: DispatchStats,
}

impl<T: Send + 'static> ChannelDispatcher<T> {
    pub fn new(mode: ChannelMode, channel_size: usize) -> Self {
        match mode {
            ChannelMode::Shared => Self::new_shared(channel_size),
            ChannelMode::PerShard(num_shards) => Self::new_per_shard(num_shards, channel_size),
        }
    }

    fn new_shared(channel_size: usize) -> Self {
        let (tx, rx) = bounded(channel_size);
        Self {
            channels: Mutex::new(Channels::Shared((Some(tx), Arc::new(rx)))),
            stats: DispatchStats::new(),
        }
    }

    fn new_per_shard(num_shards: usize, channel_size: usize) -> Self {
        let mut shards = Vec::with_capacity(num_shards);
        for _ in 0..num_shards {
            let (tx, rx) = bounded(channel_size);
            shards.push((Some(tx), Arc::new(rx)));
        }
        Self {
            channels: Mutex::new(Channels::PerShard(shards)),
            stats: DispatchStats::new(),
        }
    }

    /// Dispatches `data` to the channel selected by `shard`, falling back to the single
    /// channel in `Shared` mode. Non-blocking: a full channel counts as dropped rather
    /// than stalling the dispatch thread.
    pub fn dispatch(&self, data: T, shard: Option<ShardId>) -> Result<(), DispatchError<T>> {
        let channels = self.channels.lock().unwrap();
        let result = match &*channels {
            Channels::PerShard(shards) => {
                let shard = shard.ok_or(DispatchError::ShardRequired)?;
                let (sender, _) = shards
                    .get(shard.0)
                    .ok_or(DispatchError::ShardNotFound(shard))?;
                match sender {
                    Some(sender) => sender.try_send(data),
                    None => Err(TrySendError::Disconnected(data)),
                }
            }
            Channels::Shared((sender, _)) => match sender {
                Some(sender) => sender.try_send(data),
                None => Err(TrySendError::Disconnected(data)),
            },
        };

        match result {
            Ok(()) => {
                self.stats
                    .dispatched
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.stats
                    .dropped
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                Err(DispatchError::SendFailed(e))
            }
        }
    }

    /// Returns the receiver for shard `shard` (or the sole shared receiver).
    pub fn receiver(&self, shard: Option<ShardId>) -> Arc<Receiver<T>> {
        let channels = self.channels.lock().unwrap();
        match &*channels {
            Channels::PerShard(shards) => {
                let shard = shard.expect("shard id required in PerShard mode");
                Arc::clone(&shards[shard.0].1)
            }
            Channels::Shared((_, rx)) => Arc::clone(rx),
        }
    }

    pub fn close(&self) {
        let mut channels = self.channels.lock().unwrap();
        match &mut *channels {
            Channels::PerShard(shards) => {
                for (sender, _) in shards.iter_mut() {
                    *sender = None;
                }
            }
            Channels::Shared((sender, _)) => *sender = None,
        }
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }
}

#[derive(Debug, Error)]
pub enum DispatchError<T> {
    #[error("shard id required for PerShard dispatch")]
    ShardRequired,
    #[error("no channel configured for shard: {0}")]
    ShardNotFound(ShardId),
    #[error("failed to send data")]
    SendFailed(#[from] TrySendError<T>),
}
