//! HTTP request/response matching built on top of `httparse`.
use std::collections::BTreeMap;

use crate::aggregate::{Exchange, ExchangeStatus, ProtocolDetail};
use crate::error::ParseOutcome;
use crate::ingress::{PacketDir, PacketEventData, PacketEventHeader};
use crate::protocols::reassembly::DirectionalBuffers;
use crate::sampler::Sampler;
use crate::protocols::{ParserContext, StreamParser};

use super::transaction::{HttpRequest, HttpResponse};

const MAX_PENDING_AGE_NS: u64 = 30_000_000_000;

struct PendingRequest {
    request: HttpRequest,
    start_ns: u64,
    bytes_in: u64,
}

pub struct HttpParser {
    ctx: ParserContext,
    buffers: DirectionalBuffers,
    pending: BTreeMap<usize, PendingRequest>,
    current_trans: usize,
    cnt: usize,
    total_bytes: usize,
}

impl HttpParser {
    pub fn new(ctx: ParserContext) -> Self {
        HttpParser {
            ctx,
            buffers: DirectionalBuffers::new(),
            pending: BTreeMap::new(),
            current_trans: 0,
            cnt: 0,
            total_bytes: 0,
        }
    }

    fn evict_oldest(&mut self) {
        if let Some((&id, _)) = self.pending.iter().next() {
            if let Some(removed) = self.pending.remove(&id) {
                self.total_bytes -= removed.bytes_in as usize;
            }
        }
    }

    /// Admits a parsed request into `pending`, evicting the oldest entries first if the
    /// cache is over budget; if the new request alone still doesn't fit, it is dropped
    /// rather than inserted.
    fn admit(&mut self, id: usize, request: HttpRequest, start_ns: u64, bytes_in: u64) -> ParseOutcome {
        while !self.pending.is_empty() && self.total_bytes + bytes_in as usize > self.ctx.cache_limit_bytes {
            self.evict_oldest();
        }
        if self.total_bytes + bytes_in as usize > self.ctx.cache_limit_bytes {
            return ParseOutcome::Drop;
        }
        self.total_bytes += bytes_in as usize;
        self.pending.insert(id, PendingRequest { request, start_ns, bytes_in });
        ParseOutcome::Ok
    }

    fn process_client_data(&mut self, header: &PacketEventHeader) -> ParseOutcome {
        let mut outcome = ParseOutcome::Ok;
        loop {
            let buf = self.buffers.buffer(PacketDir::ClientToServer);
            if buf.is_empty() {
                break;
            }
            match HttpRequest::parse_from(buf) {
                Ok(Some((request, consumed))) => {
                    let bytes_in = consumed as u64;
                    self.buffers.consume(PacketDir::ClientToServer, consumed);
                    let id = self.cnt;
                    self.cnt += 1;
                    outcome = self.admit(id, request, header.time_nano, bytes_in);
                }
                Ok(None) => break,
                Err(_) => {
                    self.buffers.clear(PacketDir::ClientToServer);
                    outcome = ParseOutcome::Fail;
                    break;
                }
            }
        }
        outcome
    }

    fn process_server_data(&mut self, header: &PacketEventHeader, sampler: &mut Sampler) -> ParseOutcome {
        let mut outcome = ParseOutcome::Ok;
        loop {
            let buf = self.buffers.buffer(PacketDir::ServerToClient);
            if buf.is_empty() {
                break;
            }
            match HttpResponse::parse_from(buf) {
                Ok(Some((response, consumed))) => {
                    let bytes_out = consumed as u64;
                    self.buffers.consume(PacketDir::ServerToClient, consumed);
                    outcome = self.emit(header, response, bytes_out, sampler);
                }
                Ok(None) => break,
                Err(_) => {
                    self.buffers.clear(PacketDir::ServerToClient);
                    outcome = ParseOutcome::Fail;
                    break;
                }
            }
        }
        outcome
    }

    fn emit(&mut self, header: &PacketEventHeader, response: HttpResponse, bytes_out: u64, sampler: &mut Sampler) -> ParseOutcome {
        let Some(pending) = self.pending.remove(&self.current_trans) else {
            log::warn!("HTTP response without outstanding request on {}", self.ctx.flow_key);
            return ParseOutcome::Drop;
        };
        self.total_bytes -= pending.bytes_in as usize;
        self.current_trans += 1;

        let status_code = response.status_code.unwrap_or(0);
        let is_error = status_code >= 400;
        let exchange = Exchange {
            flow_key: self.ctx.flow_key,
            proc_meta: self.ctx.proc_meta.clone(),
            protocol: self.ctx.protocol,
            endpoint: self.ctx.flow_key.resp.to_string(),
            operation: format!(
                "{} {}",
                pending.request.method.as_deref().unwrap_or("-"),
                pending.request.uri.as_deref().unwrap_or("-")
            ),
            start_ns: pending.start_ns,
            duration_ns: header.time_nano.saturating_sub(pending.start_ns),
            status: if is_error { ExchangeStatus::Error } else { ExchangeStatus::Ok },
            bytes_in: pending.bytes_in,
            bytes_out,
            attributes: [
                ("host".to_string(), pending.request.host.unwrap_or_default()),
                ("status_code".to_string(), status_code.to_string()),
            ]
            .into_iter()
            .collect(),
        };
        self.ctx.aggregators.add_exchange(&exchange);
        if sampler.should_sample(header.time_nano, is_error) {
            self.ctx.aggregators.add_detail(ProtocolDetail::from(&exchange));
        }
        ParseOutcome::Ok
    }
}

impl StreamParser for HttpParser {
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
        match data.pkt_type {
            PacketDir::ClientToServer => self.process_client_data(header),
            PacketDir::ServerToClient => self.process_server_data(header, sampler),
        }
    }

    fn garbage_collection(&mut self, size_limit_bytes: usize, now_ns: u64) -> bool {
        let stale: Vec<usize> = self
            .pending
            .iter()
            .filter(|(_, p)| now_ns.saturating_sub(p.start_ns) > MAX_PENDING_AGE_NS)
            .map(|(&id, _)| id)
            .collect();
        for id in stale {
            if let Some(removed) = self.pending.remove(&id) {
                self.total_bytes -= removed.bytes_in as usize;
            }
        }
        while !self.pending.is_empty() && self.cache_size() > size_limit_bytes {
            self.evict_oldest();
        }
        self.buffers.shed_to_limit(size_limit_bytes);
        self.pending.is_empty() && self.buffers.cache_size() == 0
    }

    fn cache_size(&self) -> usize {
        self.total_bytes + self.buffers.cache_size()
    }
}
