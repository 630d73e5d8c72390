//! RESP (Redis) command/reply matching.
//!
//! Commands are matched to replies in pipelined order. RESP values are parsed with
//! `nom`'s streaming combinators, so a value split across packet events reports
//! `Incomplete` instead of failing outright; the partial bytes stay buffered per
//! direction until the rest arrives.

use std::collections::VecDeque;

use nom::branch::alt;
use nom::bytes::streaming::{tag, take, take_while};
use nom::character::streaming::{crlf, digit1};
use nom::combinator::{map_res, opt};
use nom::sequence::terminated;
use nom::IResult;

use crate::aggregate::{Exchange, ExchangeStatus, ProtocolDetail};
use crate::error::ParseOutcome;
use crate::ingress::{PacketDir, PacketEventData, PacketEventHeader};
use crate::protocols::reassembly::DirectionalBuffers;
use crate::protocols::{ParserContext, StreamParser};
use crate::sampler::Sampler;

const MAX_PENDING_AGE_NS: u64 = 30_000_000_000;

struct PendingCommand {
    command: String,
    start_ns: u64,
    bytes_in: u64,
}

pub struct RedisParser {
    ctx: ParserContext,
    buffers: DirectionalBuffers,
    pending: VecDeque<PendingCommand>,
    total_bytes: usize,
}

/// One RESP value. `Bulk(None)`/`Array(None)` are RESP's null bulk string/array.
#[derive(Debug, Clone, PartialEq)]
enum RespValue {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Vec<u8>>),
    Array(Option<Vec<RespValue>>),
}

fn signed_number(input: &[u8]) -> IResult<&[u8], i64> {
    map_res(
        terminated(nom::sequence::pair(opt(tag("-")), digit1), crlf),
        |(sign, digits): (Option<&[u8]>, &[u8])| -> Result<i64, std::num::ParseIntError> {
            let n: i64 = std::str::from_utf8(digits).unwrap().parse()?;
            Ok(if sign.is_some() { -n } else { n })
        },
    )(input)
}

fn line(input: &[u8]) -> IResult<&[u8], &[u8]> {
    terminated(take_while(|c| c != b'\r'), crlf)(input)
}

fn simple_string(input: &[u8]) -> IResult<&[u8], RespValue> {
    let (input, _) = tag("+")(input)?;
    let (input, s) = line(input)?;
    Ok((input, RespValue::Simple(String::from_utf8_lossy(s).into_owned())))
}

fn error_string(input: &[u8]) -> IResult<&[u8], RespValue> {
    let (input, _) = tag("-")(input)?;
    let (input, s) = line(input)?;
    Ok((input, RespValue::Error(String::from_utf8_lossy(s).into_owned())))
}

fn integer(input: &[u8]) -> IResult<&[u8], RespValue> {
    let (input, _) = tag(":")(input)?;
    let (input, n) = signed_number(input)?;
    Ok((input, RespValue::Integer(n)))
}

fn bulk_string(input: &[u8]) -> IResult<&[u8], RespValue> {
    let (input, _) = tag("$")(input)?;
    let (input, len) = signed_number(input)?;
    if len < 0 {
        return Ok((input, RespValue::Bulk(None)));
    }
    let (input, bytes) = take(len as usize)(input)?;
    let (input, _) = crlf(input)?;
    Ok((input, RespValue::Bulk(Some(bytes.to_vec()))))
}

fn array(input: &[u8]) -> IResult<&[u8], RespValue> {
    let (input, _) = tag("*")(input)?;
    let (mut input, count) = signed_number(input)?;
    if count < 0 {
        return Ok((input, RespValue::Array(None)));
    }
    let mut items = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (rest, value) = resp_value(input)?;
        items.push(value);
        input = rest;
    }
    Ok((input, RespValue::Array(Some(items))))
}

fn resp_value(input: &[u8]) -> IResult<&[u8], RespValue> {
    alt((simple_string, error_string, integer, bulk_string, array))(input)
}

enum FrameResult {
    Complete(RespValue, usize),
    Incomplete,
    Malformed,
}

fn take_resp_frame(buf: &[u8]) -> FrameResult {
    match resp_value(buf) {
        Ok((rest, value)) => FrameResult::Complete(value, buf.len() - rest.len()),
        Err(nom::Err::Incomplete(_)) => FrameResult::Incomplete,
        Err(_) => FrameResult::Malformed,
    }
}

/// Extracts `(command name, argument count)` from a command array, the shape every
/// Redis client request takes.
fn command_from_value(value: &RespValue) -> Option<(String, usize)> {
    let RespValue::Array(Some(items)) = value else {
        return None;
    };
    let RespValue::Bulk(Some(first)) = items.first()? else {
        return None;
    };
    Some((String::from_utf8_lossy(first).to_uppercase(), items.len()))
}

fn response_is_error(value: &RespValue) -> bool {
    matches!(value, RespValue::Error(_))
}

impl RedisParser {
    pub fn new(ctx: ParserContext) -> Self {
        RedisParser {
            ctx,
            buffers: DirectionalBuffers::new(),
            pending: VecDeque::new(),
            total_bytes: 0,
        }
    }

    fn evict_oldest(&mut self) {
        if let Some(removed) = self.pending.pop_front() {
            self.total_bytes -= removed.bytes_in as usize;
        }
    }

    fn admit(&mut self, command: String, start_ns: u64, bytes_in: u64) -> ParseOutcome {
        while !self.pending.is_empty() && self.total_bytes + bytes_in as usize > self.ctx.cache_limit_bytes {
            self.evict_oldest();
        }
        if self.total_bytes + bytes_in as usize > self.ctx.cache_limit_bytes {
            return ParseOutcome::Drop;
        }
        self.total_bytes += bytes_in as usize;
        self.pending.push_back(PendingCommand { command, start_ns, bytes_in });
        ParseOutcome::Ok
    }

    fn process_client_data(&mut self, header: &PacketEventHeader) -> ParseOutcome {
        let mut outcome = ParseOutcome::Ok;
        loop {
            let buf = self.buffers.buffer(PacketDir::ClientToServer);
            if buf.is_empty() {
                break;
            }
            match take_resp_frame(buf) {
                FrameResult::Complete(value, consumed) => {
                    self.buffers.consume(PacketDir::ClientToServer, consumed);
                    let Some((command, argc)) = command_from_value(&value) else {
                        outcome = ParseOutcome::Fail;
                        continue;
                    };
                    outcome = self.admit(format!("{command} ({argc} args)"), header.time_nano, consumed as u64);
                }
                FrameResult::Incomplete => break,
                FrameResult::Malformed => {
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
            match take_resp_frame(buf) {
                FrameResult::Complete(value, consumed) => {
                    self.buffers.consume(PacketDir::ServerToClient, consumed);
                    outcome = self.emit(header, &value, consumed as u64, sampler);
                }
                FrameResult::Incomplete => break,
                FrameResult::Malformed => {
                    self.buffers.clear(PacketDir::ServerToClient);
                    outcome = ParseOutcome::Fail;
                    break;
                }
            }
        }
        outcome
    }

    fn emit(&mut self, header: &PacketEventHeader, value: &RespValue, bytes_out: u64, sampler: &mut Sampler) -> ParseOutcome {
        let Some(pending) = self.pending.pop_front() else {
            log::warn!("Redis reply without outstanding command on {}", self.ctx.flow_key);
            return ParseOutcome::Drop;
        };
        self.total_bytes -= pending.bytes_in as usize;
        let is_error = response_is_error(value);
        let exchange = Exchange {
            flow_key: self.ctx.flow_key,
            proc_meta: self.ctx.proc_meta.clone(),
            protocol: self.ctx.protocol,
            endpoint: self.ctx.flow_key.resp.to_string(),
            operation: pending.command,
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
}

impl StreamParser for RedisParser {
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
        while let Some(front) = self.pending.front() {
            if now_ns.saturating_sub(front.start_ns) > MAX_PENDING_AGE_NS {
                self.evict_oldest();
            } else {
                break;
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
