//! Kafka request/response correlation-id matching.
//!
//! Requests are framed as a 4-byte big-endian size, `api_key`(2), `api_version`(2),
//! `correlation_id`(4), a 2-byte signed client-id length and the client id; responses as
//! a 4-byte size followed by the `correlation_id`. Matching is by correlation id and
//! survives arbitrary request/response interleaving (cross-batch correlation). The size
//! prefix frames each message (it excludes itself), so a message split across packet
//! events is reassembled from a per-direction buffer before it's parsed.

use std::collections::HashMap;

use crate::aggregate::{Exchange, ExchangeStatus, ProtocolDetail};
use crate::error::ParseOutcome;
use crate::ingress::{PacketDir, PacketEventData, PacketEventHeader};
use crate::protocols::reassembly::DirectionalBuffers;
use crate::protocols::{ParserContext, StreamParser};
use crate::sampler::Sampler;

const MAX_PENDING_AGE_NS: u64 = 30_000_000_000;

struct PendingRequest {
    api_key: i16,
    api_version: i16,
    topic: Option<String>,
    start_ns: u64,
    bytes_in: u64,
}

pub struct KafkaParser {
    ctx: ParserContext,
    buffers: DirectionalBuffers,
    pending: HashMap<i32, PendingRequest>,
}

fn api_key_name(api_key: i16) -> &'static str {
    match api_key {
        0 => "Produce",
        1 => "Fetch",
        2 => "ListOffsets",
        3 => "Metadata",
        8 => "OffsetCommit",
        9 => "OffsetFetch",
        10 => "FindCoordinator",
        18 => "ApiVersions",
        19 => "CreateTopics",
        _ => "Unknown",
    }
}

/// Returns `(frame, total_frame_len)` once a complete Kafka message, including its
/// 4-byte size prefix, is buffered; `None` if more bytes are needed. `size` excludes the
/// 4 length bytes themselves.
fn take_kafka_frame(buf: &[u8]) -> Option<(&[u8], usize)> {
    if buf.len() < 4 {
        return None;
    }
    let size = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let total = 4 + size;
    if buf.len() < total {
        return None;
    }
    Some((&buf[..total], total))
}

/// Best-effort first-topic extraction for classic (non-flexible) request layouts: client
/// id, then a topic array whose first entry is a 2-byte length-prefixed name. Requests
/// whose body doesn't match this shape (newer flexible-version encodings, topic-less
/// APIs) leave the operation untagged by topic rather than miskeyed.
fn extract_topic(buf: &[u8]) -> Option<String> {
    if buf.len() < 14 {
        return None;
    }
    let client_id_len = i16::from_be_bytes([buf[12], buf[13]]);
    let mut offset = 14;
    if client_id_len > 0 {
        offset += client_id_len as usize;
    }
    if buf.len() < offset + 4 {
        return None;
    }
    let topic_count = i32::from_be_bytes(buf[offset..offset + 4].try_into().unwrap());
    offset += 4;
    if topic_count <= 0 {
        return None;
    }
    if buf.len() < offset + 2 {
        return None;
    }
    let topic_len = i16::from_be_bytes([buf[offset], buf[offset + 1]]) as usize;
    offset += 2;
    if topic_len == 0 || buf.len() < offset + topic_len {
        return None;
    }
    Some(String::from_utf8_lossy(&buf[offset..offset + topic_len]).into_owned())
}

impl KafkaParser {
    pub fn new(ctx: ParserContext) -> Self {
        KafkaParser {
            ctx,
            buffers: DirectionalBuffers::new(),
            pending: HashMap::new(),
        }
    }

    fn process_request(&mut self, header: &PacketEventHeader, frame: &[u8]) -> ParseOutcome {
        if frame.len() < 12 {
            return ParseOutcome::Fail;
        }
        let api_key = i16::from_be_bytes([frame[4], frame[5]]);
        let api_version = i16::from_be_bytes([frame[6], frame[7]]);
        let correlation_id = i32::from_be_bytes([frame[8], frame[9], frame[10], frame[11]]);
        self.pending.insert(
            correlation_id,
            PendingRequest {
                api_key,
                api_version,
                topic: extract_topic(frame),
                start_ns: header.time_nano,
                bytes_in: frame.len() as u64,
            },
        );
        ParseOutcome::Ok
    }

    fn process_response(&mut self, header: &PacketEventHeader, frame: &[u8], sampler: &mut Sampler) -> ParseOutcome {
        if frame.len() < 8 {
            return ParseOutcome::Fail;
        }
        let correlation_id = i32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]);
        let Some(pending) = self.pending.remove(&correlation_id) else {
            log::warn!("Kafka response without outstanding request on {}", self.ctx.flow_key);
            return ParseOutcome::Drop;
        };
        let exchange = Exchange {
            flow_key: self.ctx.flow_key,
            proc_meta: self.ctx.proc_meta.clone(),
            protocol: self.ctx.protocol,
            endpoint: self.ctx.flow_key.resp.to_string(),
            operation: format!("{} {}", api_key_name(pending.api_key), pending.topic.as_deref().unwrap_or("-")),
            start_ns: pending.start_ns,
            duration_ns: header.time_nano.saturating_sub(pending.start_ns),
            // Kafka's response error codes are embedded per-partition/per-topic; without
            // a schema decoder for every api key this parser does not inspect them.
            status: ExchangeStatus::Ok,
            bytes_in: pending.bytes_in,
            bytes_out: frame.len() as u64,
            attributes: [
                ("api_key".to_string(), pending.api_key.to_string()),
                ("api_version".to_string(), pending.api_version.to_string()),
            ]
            .into_iter()
            .collect(),
        };
        self.ctx.aggregators.add_exchange(&exchange);
        if sampler.should_sample(header.time_nano, false) {
            self.ctx.aggregators.add_detail(ProtocolDetail::from(&exchange));
        }
        ParseOutcome::Ok
    }

    fn drain_frames(&mut self, dir: PacketDir, header: &PacketEventHeader, sampler: &mut Sampler) -> ParseOutcome {
        let mut outcome = ParseOutcome::Ok;
        loop {
            let buf = self.buffers.buffer(dir);
            let Some((frame, total)) = take_kafka_frame(buf) else {
                break;
            };
            let frame = frame.to_vec();
            self.buffers.consume(dir, total);
            outcome = match dir {
                PacketDir::ClientToServer => self.process_request(header, &frame),
                PacketDir::ServerToClient => self.process_response(header, &frame, sampler),
            };
        }
        outcome
    }
}

impl StreamParser for KafkaParser {
    fn on_data(
        &mut self,
        _ctx: &ParserContext,
        header: &PacketEventHeader,
        data: &PacketEventData,
        sampler: &mut Sampler,
    ) -> ParseOutcome {
        if data.buffer.is_empty() {
            return ParseOutcome::Ok;
        }
        self.buffers.append(data.pkt_type, &data.buffer);
        self.drain_frames(data.pkt_type, header, sampler)
    }

    fn garbage_collection(&mut self, size_limit_bytes: usize, now_ns: u64) -> bool {
        self.pending.retain(|_, p| now_ns.saturating_sub(p.start_ns) <= MAX_PENDING_AGE_NS);
        self.buffers.shed_to_limit(size_limit_bytes);
        self.pending.is_empty() && self.buffers.cache_size() == 0
    }

    fn cache_size(&self) -> usize {
        self.pending.values().map(|p| p.bytes_in as usize).sum::<usize>() + self.buffers.cache_size()
    }
}
