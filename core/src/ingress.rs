//! Packet ingress adapter.
//!
//! Delivers a lazy, unbounded sequence of `(header, data)` pairs. Per-flow-key ordering
//! matches wire order; the adapter does not retain `data` after it returns an event.

use std::collections::HashMap;

use crossbeam_channel::Receiver;

use crate::error::IngressError;
use crate::flow::FlowKey;

/// Detected application-layer protocol tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolTag {
    None,
    Http,
    Dns,
    MySql,
    Redis,
    PgSql,
    Dubbo,
    Kafka,
}

/// Packet direction relative to the flow's originator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDir {
    ClientToServer,
    ServerToClient,
}

/// Message-type hint attached by the capture layer, where known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgTypeHint {
    Request,
    Response,
    Unknown,
}

/// Process/container identity attached by the capture layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcMeta {
    pub pid: u32,
    pub container_id: String,
    pub k8s_labels: HashMap<String, String>,
}

/// Immutable per-packet header. Shares no mutable state across packets.
#[derive(Debug, Clone)]
pub struct PacketEventHeader {
    pub time_nano: u64,
    pub flow_key: FlowKey,
    pub proc_meta: ProcMeta,
}

/// Per-packet payload and classification.
#[derive(Debug, Clone)]
pub struct PacketEventData {
    pub ptl_type: ProtocolTag,
    pub pkt_type: PacketDir,
    pub msg_type: MsgTypeHint,
    pub buffer: Vec<u8>,
    pub buffer_len: usize,
    pub real_len: usize,
    /// Set when `real_len > buffer_len`: the capture layer truncated this payload.
    pub truncated: bool,
}

impl PacketEventData {
    pub fn new(ptl_type: ProtocolTag, pkt_type: PacketDir, msg_type: MsgTypeHint, buffer: Vec<u8>, real_len: usize) -> Self {
        let buffer_len = buffer.len();
        PacketEventData {
            ptl_type,
            pkt_type,
            msg_type,
            buffer,
            buffer_len,
            real_len,
            truncated: real_len > buffer_len,
        }
    }
}

/// One `(header, data)` pair pulled from the ingress adapter.
#[derive(Debug, Clone)]
pub struct RawPacketEvent {
    pub header: PacketEventHeader,
    pub data: PacketEventData,
}

/// A pull interface delivering packet events. Mirrors `Iterator`, but fallible so that a
/// single malformed event does not end the stream.
pub trait PacketSource: Send {
    fn next_event(&mut self) -> Option<Result<RawPacketEvent, IngressError>>;
}

/// A test double backed by a plain `Vec`, used by unit and integration tests.
pub struct VecPacketSource {
    events: std::vec::IntoIter<RawPacketEvent>,
}

impl VecPacketSource {
    pub fn new(events: Vec<RawPacketEvent>) -> Self {
        VecPacketSource {
            events: events.into_iter(),
        }
    }
}

impl PacketSource for VecPacketSource {
    fn next_event(&mut self) -> Option<Result<RawPacketEvent, IngressError>> {
        self.events.next().map(Ok)
    }
}

/// Adapts a `crossbeam_channel::Receiver` fed by an out-of-process capture probe (e.g. an
/// eBPF source) into a `PacketSource`.
pub struct ChannelPacketSource {
    rx: Receiver<RawPacketEvent>,
}

impl ChannelPacketSource {
    pub fn new(rx: Receiver<RawPacketEvent>) -> Self {
        ChannelPacketSource { rx }
    }
}

impl PacketSource for ChannelPacketSource {
    fn next_event(&mut self) -> Option<Result<RawPacketEvent, IngressError>> {
        match self.rx.recv() {
            Ok(event) => Some(Ok(event)),
            Err(_) => None,
        }
    }
}

/// Hashes a flow key to a shard index, used by the engine's ingress-dispatch thread
/// (the only cross-shard component).
pub fn shard_for_flow(flow_key: &FlowKey, num_shards: usize) -> usize {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    flow_key.conn_id().hash(&mut hasher);
    (hasher.finish() as usize) % num_shards
}
