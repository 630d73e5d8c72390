//! DNS query/answer matching built on `dns_parser`.
use std::collections::HashMap;

use crate::aggregate::{Exchange, ExchangeStatus, ProtocolDetail};
use crate::error::ParseOutcome;
use crate::ingress::{PacketDir, PacketEventData, PacketEventHeader};
use crate::protocols::reassembly::DirectionalBuffers;
use crate::protocols::{ParserContext, StreamParser};
use crate::sampler::Sampler;

/// Size of a DNS message header; a buffer shorter than this can never hold a complete
/// packet, so it's a safe "keep waiting" signal even though `dns_parser` itself has no
/// API to distinguish "not enough data yet" from "malformed data".
const DNS_HEADER_LEN: usize = 12;

struct PendingQuery {
    qname: String,
    qtype: String,
    start_ns: u64,
    bytes_in: u64,
}

pub struct DnsParser {
    ctx: ParserContext,
    buffers: DirectionalBuffers,
    pending: HashMap<u16, PendingQuery>,
}

impl DnsParser {
    pub fn new(ctx: ParserContext) -> Self {
        DnsParser {
            ctx,
            buffers: DirectionalBuffers::new(),
            pending: HashMap::new(),
        }
    }

    fn emit(
        &self,
        pending: PendingQuery,
        response_code: dns_parser::ResponseCode,
        header: &PacketEventHeader,
        bytes_out: u64,
        sampler: &mut Sampler,
    ) {
        let is_error = !matches!(response_code, dns_parser::ResponseCode::NoError);
        let exchange = Exchange {
            flow_key: self.ctx.flow_key,
            proc_meta: self.ctx.proc_meta.clone(),
            protocol: self.ctx.protocol,
            endpoint: self.ctx.flow_key.resp.to_string(),
            operation: format!("{} {}", pending.qname, pending.qtype),
            start_ns: pending.start_ns,
            duration_ns: header.time_nano.saturating_sub(pending.start_ns),
            status: if is_error { ExchangeStatus::Error } else { ExchangeStatus::Ok },
            bytes_in: pending.bytes_in,
            bytes_out,
            attributes: [("response_code".to_string(), format!("{response_code:?}"))]
                .into_iter()
                .collect(),
        };
        self.ctx.aggregators.add_exchange(&exchange);
        if sampler.should_sample(header.time_nano, is_error) {
            self.ctx.aggregators.add_detail(ProtocolDetail::from(&exchange));
        }
    }

    /// Tries to parse one complete packet off the front of `dir`'s buffer. `dns_parser`
    /// reports neither a partial-parse state nor bytes consumed, so the whole buffer is
    /// treated as one message; buffering only helps when a message arrives split below
    /// the 12-byte header, the common case for UDP DNS.
    fn try_parse(&mut self, dir: PacketDir, header: &PacketEventHeader, sampler: &mut Sampler) -> ParseOutcome {
        let buf = self.buffers.buffer(dir);
        if buf.len() < DNS_HEADER_LEN {
            return ParseOutcome::Ok;
        }
        let outcome = match dns_parser::Packet::parse(buf) {
            Ok(packet) => {
                let bytes = buf.len() as u64;
                let id = packet.header.id;
                if packet.header.query {
                    if packet.questions.is_empty() {
                        ParseOutcome::Fail
                    } else {
                        let q = &packet.questions[0];
                        self.pending.insert(
                            id,
                            PendingQuery {
                                qname: q.qname.to_string(),
                                qtype: format!("{:?}", q.qtype),
                                start_ns: header.time_nano,
                                bytes_in: bytes,
                            },
                        );
                        ParseOutcome::Ok
                    }
                } else {
                    match self.pending.remove(&id) {
                        Some(pending) => {
                            self.emit(pending, packet.header.response_code, header, bytes, sampler);
                            ParseOutcome::Ok
                        }
                        None => {
                            log::warn!("DNS answer without outstanding query on {}", self.ctx.flow_key);
                            ParseOutcome::Drop
                        }
                    }
                }
            }
            Err(_) => ParseOutcome::Fail,
        };
        self.buffers.clear(dir);
        outcome
    }
}

impl StreamParser for DnsParser {
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
        self.try_parse(data.pkt_type, header, sampler)
    }

    fn garbage_collection(&mut self, size_limit_bytes: usize, now_ns: u64) -> bool {
        let timeout_ns = self.ctx.dns_request_timeout_ms * 1_000_000;
        self.pending
            .retain(|_, p| now_ns.saturating_sub(p.start_ns) <= timeout_ns);
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
            protocol: Protocol::Dns,
            flow_key: FlowKey::new(
                "127.0.0.1:1234".parse::<SocketAddr>().unwrap(),
                "127.0.0.1:53".parse::<SocketAddr>().unwrap(),
                L4Protocol::Udp,
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

    /// Hand-rolled minimal DNS query: one question, QTYPE A, QCLASS IN, RD set.
    fn build_query(id: u16) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&id.to_be_bytes());
        buf.extend_from_slice(&0x0100u16.to_be_bytes());
        buf.extend_from_slice(&1u16.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        for label in "example.com".split('.') {
            buf.push(label.len() as u8);
            buf.extend_from_slice(label.as_bytes());
        }
        buf.push(0);
        buf.extend_from_slice(&1u16.to_be_bytes());
        buf.extend_from_slice(&1u16.to_be_bytes());
        buf
    }

    #[test]
    fn too_short_for_a_header_is_buffered_not_failed() {
        let ctx = ctx();
        let mut parser = DnsParser::new(ctx.clone());
        let mut sampler = Sampler::new(1.0);
        let h = header(0, ctx.flow_key);
        let data = PacketEventData::new(ProtocolTag::Dns, PacketDir::ClientToServer, MsgTypeHint::Unknown, vec![1, 2, 3], 0);
        let outcome = parser.on_data(&ctx, &h, &data, &mut sampler);
        assert_eq!(outcome, ParseOutcome::Ok);
        assert_eq!(parser.cache_size(), 3);
    }

    #[test]
    fn query_without_matching_answer_is_tracked_as_pending() {
        let ctx = ctx();
        let mut parser = DnsParser::new(ctx.clone());
        let mut sampler = Sampler::new(1.0);
        let h = header(0, ctx.flow_key);
        let query = build_query(42);
        let data = PacketEventData::new(ProtocolTag::Dns, PacketDir::ClientToServer, MsgTypeHint::Request, query, 0);
        let outcome = parser.on_data(&ctx, &h, &data, &mut sampler);
        assert_eq!(outcome, ParseOutcome::Ok);
        assert_eq!(parser.pending.len(), 1);
    }
}
