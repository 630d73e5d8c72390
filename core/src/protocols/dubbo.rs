//! Dubbo v2 RPC frame matching.
//!
//! Frames start with the `0xdabb` magic; the request id (bytes 4..12, big-endian) keys a
//! pending-request map. The 16-byte header's body-length field (bytes 12..16,
//! big-endian) frames each message, so a frame split across packet events is reassembled
//! before it's parsed; a bad magic is unrecoverable framing corruption, so the whole
//! direction's buffer is discarded rather than retried.

use std::collections::HashMap;

use crate::aggregate::{Exchange, ExchangeStatus, ProtocolDetail};
use crate::error::ParseOutcome;
use crate::ingress::{PacketDir, PacketEventData, PacketEventHeader};
use crate::protocols::reassembly::DirectionalBuffers;
use crate::protocols::{ParserContext, StreamParser};
use crate::sampler::Sampler;

const MAX_PENDING_AGE_NS: u64 = 30_000_000_000;
const MAGIC: [u8; 2] = [0xda, 0xbb];
const FLAG_REQUEST: u8 = 0x80;
const HEADER_LEN: usize = 16;
const STATUS_OK: u8 = 20;

struct PendingRequest {
    operation: String,
    start_ns: u64,
    bytes_in: u64,
}

pub struct DubboParser {
    ctx: ParserContext,
    buffers: DirectionalBuffers,
    pending: HashMap<i64, PendingRequest>,
}

enum FrameResult {
    Complete(usize),
    Incomplete,
    BadMagic,
}

fn take_dubbo_frame(buf: &[u8]) -> FrameResult {
    if buf.len() < 2 {
        return FrameResult::Incomplete;
    }
    if buf[0..2] != MAGIC {
        return FrameResult::BadMagic;
    }
    if buf.len() < HEADER_LEN {
        return FrameResult::Incomplete;
    }
    let body_len = u32::from_be_bytes(buf[12..16].try_into().unwrap()) as usize;
    let total = HEADER_LEN + body_len;
    if buf.len() < total {
        return FrameResult::Incomplete;
    }
    FrameResult::Complete(total)
}

/// Decodes a Hessian2 compact-form string (`0x00`..`0x1f` length byte followed by that
/// many UTF-8 bytes). Longer chunked string forms aren't handled; those requests fall
/// back to the request-id key.
fn decode_hessian_short_string(buf: &[u8]) -> Option<(String, usize)> {
    let &tag = buf.first()?;
    if tag > 0x1f {
        return None;
    }
    let len = tag as usize;
    let end = 1 + len;
    if buf.len() < end {
        return None;
    }
    Some((String::from_utf8_lossy(&buf[1..end]).into_owned(), end))
}

/// Best-effort extraction of `service#method` from a Dubbo request body: dubbo version,
/// service path, service version, method name, each a Hessian2 string in that order.
fn extract_operation(body: &[u8]) -> Option<String> {
    let mut offset = 0;
    let (_, n) = decode_hessian_short_string(&body[offset..])?;
    offset += n;
    let (path, n) = decode_hessian_short_string(&body[offset..])?;
    offset += n;
    let (_, n) = decode_hessian_short_string(&body[offset..])?;
    offset += n;
    let (method, _) = decode_hessian_short_string(&body[offset..])?;
    Some(format!("{path}#{method}"))
}

impl DubboParser {
    pub fn new(ctx: ParserContext) -> Self {
        DubboParser {
            ctx,
            buffers: DirectionalBuffers::new(),
            pending: HashMap::new(),
        }
    }

    fn process_frame(&mut self, header: &PacketEventHeader, frame: &[u8], sampler: &mut Sampler) -> ParseOutcome {
        let flags = frame[2];
        let status = frame[3];
        let request_id = i64::from_be_bytes(frame[4..12].try_into().unwrap());
        let is_request = flags & FLAG_REQUEST != 0;

        if is_request {
            let body = &frame[HEADER_LEN..];
            let operation = extract_operation(body).unwrap_or_else(|| format!("request#{request_id}"));
            self.pending.insert(
                request_id,
                PendingRequest {
                    operation,
                    start_ns: header.time_nano,
                    bytes_in: frame.len() as u64,
                },
            );
            ParseOutcome::Ok
        } else {
            let Some(pending) = self.pending.remove(&request_id) else {
                log::warn!("Dubbo response without outstanding request on {}", self.ctx.flow_key);
                return ParseOutcome::Drop;
            };
            let is_error = status != STATUS_OK;
            let exchange = Exchange {
                flow_key: self.ctx.flow_key,
                proc_meta: self.ctx.proc_meta.clone(),
                protocol: self.ctx.protocol,
                endpoint: self.ctx.flow_key.resp.to_string(),
                operation: pending.operation,
                start_ns: pending.start_ns,
                duration_ns: header.time_nano.saturating_sub(pending.start_ns),
                status: if is_error { ExchangeStatus::Error } else { ExchangeStatus::Ok },
                bytes_in: pending.bytes_in,
                bytes_out: frame.len() as u64,
                attributes: [("dubbo_status".to_string(), status.to_string())].into_iter().collect(),
            };
            self.ctx.aggregators.add_exchange(&exchange);
            if sampler.should_sample(header.time_nano, is_error) {
                self.ctx.aggregators.add_detail(ProtocolDetail::from(&exchange));
            }
            ParseOutcome::Ok
        }
    }

    fn drain_frames(&mut self, dir: PacketDir, header: &PacketEventHeader, sampler: &mut Sampler) -> ParseOutcome {
        let mut outcome = ParseOutcome::Ok;
        loop {
            let buf = self.buffers.buffer(dir);
            match take_dubbo_frame(buf) {
                FrameResult::Complete(total) => {
                    let frame = buf[..total].to_vec();
                    self.buffers.consume(dir, total);
                    outcome = self.process_frame(header, &frame, sampler);
                }
                FrameResult::Incomplete => break,
                FrameResult::BadMagic => {
                    self.buffers.clear(dir);
                    outcome = ParseOutcome::Fail;
                    break;
                }
            }
        }
        outcome
    }
}

impl StreamParser for DubboParser {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::ProtocolEventAggregators;
    use crate::flow::{FlowKey, L4Protocol};
    use crate::ingress::{MsgTypeHint, ProcMeta, ProtocolTag};
    use crate::stats::Protocol;
    use std::net::SocketAddr;
    use std::sync::Arc;

    fn ctx() -> ParserContext {
        ParserContext {
            protocol: Protocol::Dubbo,
            flow_key: FlowKey::new(
                "127.0.0.1:1234".parse::<SocketAddr>().unwrap(),
                "127.0.0.1:20880".parse::<SocketAddr>().unwrap(),
                L4Protocol::Tcp,
            ),
            proc_meta: ProcMeta::default(),
            aggregators: Arc::new(ProtocolEventAggregators::new(16)),
            cache_limit_bytes: 1024,
            dns_request_timeout_ms: 5000,
        }
    }

    fn header(now_ns: u64, flow_key: FlowKey) -> PacketEventHeader {
        PacketEventHeader {
            time_nano: now_ns,
            flow_key,
            proc_meta: ProcMeta::default(),
        }
    }

    fn hessian_string(s: &str) -> Vec<u8> {
        let mut out = vec![s.len() as u8];
        out.extend_from_slice(s.as_bytes());
        out
    }

    fn request_frame(request_id: i64, path: &str, method: &str) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend(hessian_string("2.0.2"));
        body.extend(hessian_string(path));
        body.extend(hessian_string("1.0.0"));
        body.extend(hessian_string(method));

        let mut frame = Vec::new();
        frame.extend_from_slice(&MAGIC);
        frame.push(FLAG_REQUEST);
        frame.push(0);
        frame.extend_from_slice(&request_id.to_be_bytes());
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend(body);
        frame
    }

    #[test]
    fn frame_split_across_two_packets_is_reassembled_and_operation_extracted() {
        let ctx = ctx();
        let mut parser = DubboParser::new(ctx.clone());
        let mut sampler = Sampler::new(1.0);
        let h = header(0, ctx.flow_key);
        let frame = request_frame(7, "com.example.Greeter", "sayHello");
        let (first, second) = frame.split_at(10);

        let data1 = PacketEventData::new(ProtocolTag::Dubbo, PacketDir::ClientToServer, MsgTypeHint::Unknown, first.to_vec(), 0);
        parser.on_data(&ctx, &h, &data1, &mut sampler);
        assert!(parser.pending.is_empty());

        let data2 = PacketEventData::new(ProtocolTag::Dubbo, PacketDir::ClientToServer, MsgTypeHint::Unknown, second.to_vec(), 0);
        parser.on_data(&ctx, &h, &data2, &mut sampler);
        let pending = parser.pending.get(&7).unwrap();
        assert_eq!(pending.operation, "com.example.Greeter#sayHello");
    }

    #[test]
    fn bad_magic_clears_buffer_and_fails() {
        let ctx = ctx();
        let mut parser = DubboParser::new(ctx.clone());
        let mut sampler = Sampler::new(1.0);
        let h = header(0, ctx.flow_key);
        let data = PacketEventData::new(ProtocolTag::Dubbo, PacketDir::ClientToServer, MsgTypeHint::Unknown, vec![0, 0, 0, 0], 0);
        let outcome = parser.on_data(&ctx, &h, &data, &mut sampler);
        assert_eq!(outcome, ParseOutcome::Fail);
        assert_eq!(parser.cache_size(), 0);
    }

    #[test]
    fn size_based_gc_sheds_buffered_bytes_over_limit() {
        let ctx = ctx();
        let mut parser = DubboParser::new(ctx.clone());
        parser.buffers.append(PacketDir::ClientToServer, &[0xda, 0xbb, 0, 0, 0, 0, 0, 0]);
        assert!(!parser.garbage_collection(1024, 0));
        assert!(parser.garbage_collection(1, 0));
        assert_eq!(parser.cache_size(), 0);
    }
}
