//! MySQL client/server protocol command-phase matching.
//!
//! Only the command phase is tracked: `COM_QUERY` text is the key; prepared-statement ids
//! from `COM_STMT_PREPARE` map to their latest prepare so a later `COM_STMT_EXECUTE`
//! resolves to the same statement text. Each MySQL packet is framed by a 3-byte
//! little-endian length followed by a 1-byte sequence id; frames are extracted from a
//! per-direction buffer as soon as they're complete, so a frame split across packet
//! events is reassembled before it's parsed.

use std::collections::HashMap;

use crate::aggregate::{Exchange, ExchangeStatus, ProtocolDetail};
use crate::error::ParseOutcome;
use crate::ingress::{PacketDir, PacketEventData, PacketEventHeader};
use crate::protocols::reassembly::DirectionalBuffers;
use crate::protocols::{ParserContext, StreamParser};
use crate::sampler::Sampler;

const MAX_PENDING_AGE_NS: u64 = 30_000_000_000;

const COM_QUERY: u8 = 0x03;
const COM_STMT_PREPARE: u8 = 0x16;
const COM_STMT_EXECUTE: u8 = 0x17;

struct PendingCommand {
    statement: String,
    start_ns: u64,
    bytes_in: u64,
}

pub struct MySqlParser {
    ctx: ParserContext,
    buffers: DirectionalBuffers,
    pending: Option<PendingCommand>,
    /// Prepared statement id -> statement text, from the most recent `COM_STMT_PREPARE`.
    prepared: HashMap<u32, String>,
    next_stmt_id: u32,
}

/// Returns `(payload, total_frame_len)` once a complete MySQL packet is buffered, or
/// `None` if more bytes are needed.
fn take_mysql_frame(buf: &[u8]) -> Option<(&[u8], usize)> {
    if buf.len() < 4 {
        return None;
    }
    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], 0]) as usize;
    let total = 4 + len;
    if buf.len() < total {
        return None;
    }
    Some((&buf[4..total], total))
}

impl MySqlParser {
    pub fn new(ctx: ParserContext) -> Self {
        MySqlParser {
            ctx,
            buffers: DirectionalBuffers::new(),
            pending: None,
            prepared: HashMap::new(),
            next_stmt_id: 1,
        }
    }

    fn process_command(&mut self, header: &PacketEventHeader, payload: &[u8], bytes_in: u64) -> ParseOutcome {
        if payload.is_empty() {
            return ParseOutcome::Fail;
        }
        let statement = match payload[0] {
            COM_QUERY => String::from_utf8_lossy(&payload[1..]).into_owned(),
            COM_STMT_PREPARE => {
                let text = String::from_utf8_lossy(&payload[1..]).into_owned();
                let id = self.next_stmt_id;
                self.next_stmt_id += 1;
                self.prepared.insert(id, text.clone());
                format!("PREPARE {text}")
            }
            COM_STMT_EXECUTE if payload.len() >= 5 => {
                let stmt_id = u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]);
                self.prepared
                    .get(&stmt_id)
                    .cloned()
                    .unwrap_or_else(|| format!("EXECUTE <unknown stmt {stmt_id}>"))
            }
            other => format!("COM_{other:#04x}"),
        };
        self.pending = Some(PendingCommand {
            statement,
            start_ns: header.time_nano,
            bytes_in,
        });
        ParseOutcome::Ok
    }

    fn process_response(
        &mut self,
        header: &PacketEventHeader,
        payload: &[u8],
        bytes_out: u64,
        sampler: &mut Sampler,
    ) -> ParseOutcome {
        let Some(pending) = self.pending.take() else {
            log::warn!("MySQL response without outstanding command on {}", self.ctx.flow_key);
            return ParseOutcome::Drop;
        };
        let is_error = payload.first() == Some(&0xff);
        let exchange = Exchange {
            flow_key: self.ctx.flow_key,
            proc_meta: self.ctx.proc_meta.clone(),
            protocol: self.ctx.protocol,
            endpoint: self.ctx.flow_key.resp.to_string(),
            operation: pending.statement,
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
            let Some((payload, total)) = take_mysql_frame(buf) else {
                break;
            };
            let payload = payload.to_vec();
            let bytes = total as u64;
            self.buffers.consume(dir, total);
            outcome = match dir {
                PacketDir::ClientToServer => self.process_command(header, &payload, bytes),
                PacketDir::ServerToClient => self.process_response(header, &payload, bytes, sampler),
            };
        }
        outcome
    }
}

impl StreamParser for MySqlParser {
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
        if let Some(pending) = &self.pending {
            if now_ns.saturating_sub(pending.start_ns) > MAX_PENDING_AGE_NS {
                self.pending = None;
            }
        }
        self.buffers.shed_to_limit(size_limit_bytes);
        self.pending.is_none() && self.buffers.cache_size() == 0
    }

    fn cache_size(&self) -> usize {
        self.pending.as_ref().map(|p| p.bytes_in as usize).unwrap_or(0) + self.buffers.cache_size()
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
            protocol: Protocol::MySql,
            flow_key: FlowKey::new(
                "127.0.0.1:1234".parse::<SocketAddr>().unwrap(),
                "127.0.0.1:3306".parse::<SocketAddr>().unwrap(),
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

    fn query_packet(sql: &str) -> Vec<u8> {
        let mut payload = vec![COM_QUERY];
        payload.extend_from_slice(sql.as_bytes());
        let len = payload.len() as u32;
        let mut frame = len.to_le_bytes()[..3].to_vec();
        frame.push(0); // sequence id
        frame.extend(payload);
        frame
    }

    #[test]
    fn frame_split_across_two_packets_is_reassembled() {
        let ctx = ctx();
        let mut parser = MySqlParser::new(ctx.clone());
        let mut sampler = Sampler::new(1.0);
        let h = header(0, ctx.flow_key);
        let frame = query_packet("SELECT 1");
        let (first, second) = frame.split_at(3);

        let data1 = PacketEventData::new(ProtocolTag::MySql, PacketDir::ClientToServer, MsgTypeHint::Unknown, first.to_vec(), 0);
        let outcome = parser.on_data(&ctx, &h, &data1, &mut sampler);
        assert_eq!(outcome, ParseOutcome::Ok);
        assert!(parser.pending.is_none());

        let data2 = PacketEventData::new(ProtocolTag::MySql, PacketDir::ClientToServer, MsgTypeHint::Unknown, second.to_vec(), 0);
        parser.on_data(&ctx, &h, &data2, &mut sampler);
        assert!(parser.pending.is_some());
    }

    #[test]
    fn size_based_gc_sheds_buffered_bytes_over_limit() {
        let ctx = ctx();
        let mut parser = MySqlParser::new(ctx.clone());
        parser.buffers.append(PacketDir::ClientToServer, &[0u8; 64]);
        assert!(!parser.garbage_collection(1024, 0));
        assert!(parser.garbage_collection(8, 0));
        assert_eq!(parser.cache_size(), 0);
    }
}
