//! PostgreSQL simple and extended query protocol matching.
//!
//! Simple queries (`Q`) and extended-protocol statements (`Parse`/`Bind`/`Execute`,
//! demarcated by `Sync`) are both tracked as one pending operation per request unit; the
//! next response packet (checked for a leading `ErrorResponse` byte) closes the match.
//! Each message is framed by a 1-byte type tag and a 4-byte big-endian length that
//! includes itself; frames are extracted from a per-direction buffer as soon as they're
//! complete, so a message split across packet events is reassembled before it's parsed.

use std::collections::VecDeque;

use crate::aggregate::{Exchange, ExchangeStatus, ProtocolDetail};
use crate::error::ParseOutcome;
use crate::ingress::{PacketDir, PacketEventData, PacketEventHeader};
use crate::protocols::reassembly::DirectionalBuffers;
use crate::protocols::{ParserContext, StreamParser};
use crate::sampler::Sampler;

const MAX_PENDING_AGE_NS: u64 = 30_000_000_000;

const MSG_SIMPLE_QUERY: u8 = b'Q';
const MSG_PARSE: u8 = b'P';
const MSG_SYNC: u8 = b'S';
const MSG_ERROR_RESPONSE: u8 = b'E';

struct PendingOp {
    operation: String,
    start_ns: u64,
    bytes_in: u64,
}

pub struct PgSqlParser {
    ctx: ParserContext,
    buffers: DirectionalBuffers,
    pending: VecDeque<PendingOp>,
    extended_buf: Option<String>,
}

fn message_text(payload: &[u8]) -> String {
    payload
        .split(|&b| b == 0)
        .next()
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .unwrap_or_default()
}

/// Returns `(msg_type, payload, total_frame_len)` once a complete message is buffered,
/// or `None` if more bytes are needed. `len` is big-endian and includes its own 4 bytes.
fn take_pg_frame(buf: &[u8]) -> Option<(u8, &[u8], usize)> {
    if buf.len() < 5 {
        return None;
    }
    let msg_type = buf[0];
    let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
    if len < 4 {
        return None;
    }
    let total = 1 + len;
    if buf.len() < total {
        return None;
    }
    Some((msg_type, &buf[5..total], total))
}

impl PgSqlParser {
    pub fn new(ctx: ParserContext) -> Self {
        PgSqlParser {
            ctx,
            buffers: DirectionalBuffers::new(),
            pending: VecDeque::new(),
            extended_buf: None,
        }
    }

    fn process_request(&mut self, header: &PacketEventHeader, msg_type: u8, payload: &[u8], bytes_in: u64) -> ParseOutcome {
        match msg_type {
            MSG_SIMPLE_QUERY => {
                self.pending.push_back(PendingOp {
                    operation: message_text(payload),
                    start_ns: header.time_nano,
                    bytes_in,
                });
                ParseOutcome::Ok
            }
            MSG_PARSE => {
                // skip statement name, take query text after its NUL terminator.
                let after_name = payload.split(|&b| b == 0).nth(1).unwrap_or(&[]);
                self.extended_buf = Some(message_text(after_name));
                ParseOutcome::Ok
            }
            MSG_SYNC => {
                self.pending.push_back(PendingOp {
                    operation: self.extended_buf.take().unwrap_or_else(|| "<extended query>".to_string()),
                    start_ns: header.time_nano,
                    bytes_in,
                });
                ParseOutcome::Ok
            }
            _ => ParseOutcome::Ok,
        }
    }

    fn process_response(&mut self, header: &PacketEventHeader, msg_type: u8, bytes_out: u64, sampler: &mut Sampler) -> ParseOutcome {
        let Some(pending) = self.pending.pop_front() else {
            log::warn!("PgSQL response without outstanding request on {}", self.ctx.flow_key);
            return ParseOutcome::Drop;
        };
        let is_error = msg_type == MSG_ERROR_RESPONSE;
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
            bytes_out,
            attributes: Default::default(),
        };
        self.ctx.aggregators.add_exchange(&exchange);
        if sampler.should_sample(header.time_nano, is_error) {
            self.ctx.aggregators.add_detail(ProtocolDetail::from(&exchange));
        }
        ParseOutcome::Ok
    }

    fn drain_frames(&mut self, dir: PacketDir, header: &PacketEventHeader, sampler: &mut Sampler) -> ParseOutcome {
        let mut outcome = ParseOutcome::Ok;
        loop {
            let buf = self.buffers.buffer(dir);
            let Some((msg_type, payload, total)) = take_pg_frame(buf) else {
                break;
            };
            let payload = payload.to_vec();
            let bytes = total as u64;
            self.buffers.consume(dir, total);
            outcome = match dir {
                PacketDir::ClientToServer => self.process_request(header, msg_type, &payload, bytes),
                PacketDir::ServerToClient => self.process_response(header, msg_type, bytes, sampler),
            };
        }
        outcome
    }
}

impl StreamParser for PgSqlParser {
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
        while let Some(front) = self.pending.front() {
            if now_ns.saturating_sub(front.start_ns) > MAX_PENDING_AGE_NS {
                self.pending.pop_front();
            } else {
                break;
            }
        }
        self.buffers.shed_to_limit(size_limit_bytes);
        self.pending.is_empty() && self.buffers.cache_size() == 0
    }

    fn cache_size(&self) -> usize {
        self.pending.iter().map(|p| p.bytes_in as usize).sum::<usize>() + self.buffers.cache_size()
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
            protocol: Protocol::PgSql,
            flow_key: FlowKey::new(
                "127.0.0.1:1234".parse::<SocketAddr>().unwrap(),
                "127.0.0.1:5432".parse::<SocketAddr>().unwrap(),
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

    fn simple_query_frame(sql: &str) -> Vec<u8> {
        let mut payload = sql.as_bytes().to_vec();
        payload.push(0);
        let len = (4 + payload.len()) as u32;
        let mut frame = vec![MSG_SIMPLE_QUERY];
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend(payload);
        frame
    }

    #[test]
    fn frame_split_across_two_packets_is_reassembled() {
        let ctx = ctx();
        let mut parser = PgSqlParser::new(ctx.clone());
        let mut sampler = Sampler::new(1.0);
        let h = header(0, ctx.flow_key);
        let frame = simple_query_frame("select 1");
        let (first, second) = frame.split_at(3);

        let data1 = PacketEventData::new(ProtocolTag::PgSql, PacketDir::ClientToServer, MsgTypeHint::Unknown, first.to_vec(), 0);
        parser.on_data(&ctx, &h, &data1, &mut sampler);
        assert!(parser.pending.is_empty());

        let data2 = PacketEventData::new(ProtocolTag::PgSql, PacketDir::ClientToServer, MsgTypeHint::Unknown, second.to_vec(), 0);
        parser.on_data(&ctx, &h, &data2, &mut sampler);
        assert_eq!(parser.pending.len(), 1);
    }

    #[test]
    fn size_based_gc_sheds_buffered_bytes_over_limit() {
        let ctx = ctx();
        let mut parser = PgSqlParser::new(ctx.clone());
        parser.buffers.append(PacketDir::ClientToServer, &[0u8; 64]);
        assert!(!parser.garbage_collection(1024, 0));
        assert!(parser.garbage_collection(8, 0));
        assert_eq!(parser.cache_size(), 0);
    }
}
