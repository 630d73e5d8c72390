//! End-to-end tests driving `Engine` through its public API with a `VecPacketSource`,
//! the way `ssh_standalone/tests/tests.rs` exercises its parser directly.

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use netobs_core::config::default_config;
use netobs_core::engine::now_ns;
use netobs_core::flow::{FlowKey, L4Protocol};
use netobs_core::ingress::{
    MsgTypeHint, PacketDir, PacketEventData, PacketEventHeader, ProcMeta, ProtocolTag, RawPacketEvent, VecPacketSource,
};
use netobs_core::stats::Protocol;
use netobs_core::Engine;

fn addr(p: u16) -> SocketAddr {
    format!("127.0.0.1:{p}").parse().unwrap()
}

fn header(flow_key: FlowKey, time_nano: u64) -> PacketEventHeader {
    PacketEventHeader {
        time_nano,
        flow_key,
        proc_meta: ProcMeta::default(),
    }
}

fn event(flow_key: FlowKey, time_nano: u64, tag: ProtocolTag, dir: PacketDir, bytes: &[u8]) -> RawPacketEvent {
    RawPacketEvent {
        header: header(flow_key, time_nano),
        data: PacketEventData::new(tag, dir, MsgTypeHint::Unknown, bytes.to_vec(), 0),
    }
}

/// Minimal DNS query: one question, QTYPE A, QCLASS IN, RD set.
fn build_dns_query(id: u16) -> Vec<u8> {
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

/// Minimal DNS response to `build_dns_query`: same header shape with QR set and an
/// answer count of 0 so no resource record needs to be encoded.
fn build_dns_response(id: u16) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&id.to_be_bytes());
    buf.extend_from_slice(&0x8180u16.to_be_bytes());
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
fn pipelined_http_requests_each_match_their_own_response() {
    let mut config = default_config();
    config.observer.num_shards = 1;
    let config = Arc::new(config);

    let flow_key = FlowKey::new(addr(1111), addr(80), L4Protocol::Tcp);
    let start = now_ns();

    let requests = b"GET /a HTTP/1.1\r\nHost: example.com\r\n\r\nGET /b HTTP/1.1\r\nHost: example.com\r\n\r\n";
    let responses = b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\nHTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n";

    let source = VecPacketSource::new(vec![
        event(flow_key, start, ProtocolTag::Http, PacketDir::ClientToServer, requests),
        event(flow_key, start + 1, ProtocolTag::Http, PacketDir::ServerToClient, responses),
    ]);

    let engine = Engine::spawn(source, config);
    thread::sleep(Duration::from_millis(150));
    let records = engine.shutdown();

    let mut operations: Vec<&str> = records
        .iter()
        .filter(|r| r.protocol == "http")
        .map(|r| r.operation.as_str())
        .collect();
    operations.sort();
    assert_eq!(operations, vec!["GET /a", "GET /b"]);
}

#[test]
fn dns_answers_are_matched_out_of_order_across_transactions() {
    let mut config = default_config();
    config.observer.num_shards = 1;
    let config = Arc::new(config);

    let flow_key = FlowKey::new(addr(2222), addr(53), L4Protocol::Udp);
    let start = now_ns();

    let source = VecPacketSource::new(vec![
        event(flow_key, start, ProtocolTag::Dns, PacketDir::ClientToServer, &build_dns_query(1)),
        event(flow_key, start + 1, ProtocolTag::Dns, PacketDir::ClientToServer, &build_dns_query(2)),
        // Transaction 2 answered first, transaction 1 second: matching is keyed by id,
        // not arrival order.
        event(flow_key, start + 2, ProtocolTag::Dns, PacketDir::ServerToClient, &build_dns_response(2)),
        event(flow_key, start + 3, ProtocolTag::Dns, PacketDir::ServerToClient, &build_dns_response(1)),
    ]);

    let engine = Engine::spawn(source, config);
    thread::sleep(Duration::from_millis(150));
    let records = engine.shutdown();

    let dns: Vec<_> = records.iter().filter(|r| r.protocol == "dns").collect();
    assert_eq!(dns.len(), 1);
    assert_eq!(dns[0].count, 2);
}

#[test]
fn protocol_switch_on_same_flow_tears_down_and_rebuilds_the_parser() {
    let mut config = default_config();
    config.observer.num_shards = 1;
    let config = Arc::new(config);

    let flow_key = FlowKey::new(addr(3333), addr(80), L4Protocol::Tcp);
    let start = now_ns();

    let http_request = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
    let source = VecPacketSource::new(vec![
        event(flow_key, start, ProtocolTag::Http, PacketDir::ClientToServer, http_request),
        event(flow_key, start + 1, ProtocolTag::Dns, PacketDir::ClientToServer, &build_dns_query(7)),
    ]);

    let engine = Engine::spawn(source, config);
    thread::sleep(Duration::from_millis(150));
    let stats = Arc::clone(engine.stats());
    let _records = engine.shutdown();

    assert!(stats.production().get(Protocol::Http).count.load(std::sync::atomic::Ordering::Relaxed) >= 1);
    assert!(stats.production().get(Protocol::Dns).count.load(std::sync::atomic::Ordering::Relaxed) >= 1);
}

#[test]
fn idle_connection_is_evicted_by_the_gc_sweep() {
    let mut config = default_config();
    config.observer.num_shards = 1;
    config.observer.gc_interval_ms = 10;
    config.observer.connection_timeout_s = 0;
    let config = Arc::new(config);

    let flow_key = FlowKey::new(addr(4444), addr(80), L4Protocol::Tcp);
    let start = now_ns();

    // An incomplete request: nothing ever completes, so the only way this connection's
    // gauge count drops to zero is the idle-timeout GC path, not parser completion.
    let source = VecPacketSource::new(vec![event(
        flow_key,
        start,
        ProtocolTag::Http,
        PacketDir::ClientToServer,
        b"GET / HTTP/1.1\r\n",
    )]);

    let engine = Engine::spawn(source, config);
    // Give the ingress thread time to dispatch the packet, then let several GC ticks
    // pass with connection_timeout_s = 0 so the very next sweep evicts it.
    thread::sleep(Duration::from_millis(150));
    let stats = Arc::clone(engine.stats());
    let _records = engine.shutdown();

    assert_eq!(
        stats
            .production()
            .get(Protocol::Http)
            .connection_num
            .load(std::sync::atomic::Ordering::Relaxed),
        0
    );
}

#[test]
fn oversized_reassembly_buffer_is_capped_by_size_based_gc() {
    let mut config = default_config();
    config.observer.num_shards = 1;
    config.observer.gc_interval_ms = 10;
    // Long enough that the idle-timeout path can't be what clears this connection.
    config.observer.connection_timeout_s = 300;
    config.observer.protocol_cache_limit_bytes = 4;
    let config = Arc::new(config);

    let flow_key = FlowKey::new(addr(5555), addr(80), L4Protocol::Tcp);
    let start = now_ns();

    // Well over the 4-byte cache limit and never completed, so it sits in the
    // per-direction buffer until a GC sweep sheds it.
    let incomplete = b"GET /some/long/path/that/never/terminates HTTP/1.1\r\n";
    let source = VecPacketSource::new(vec![event(
        flow_key,
        start,
        ProtocolTag::Http,
        PacketDir::ClientToServer,
        incomplete,
    )]);

    let engine = Engine::spawn(source, config);
    thread::sleep(Duration::from_millis(150));
    let stats = Arc::clone(engine.stats());
    let _records = engine.shutdown();

    // Once its buffer is shed to the limit the parser holds no pending state at all, so
    // the whole observer becomes collectible and the gauge drops to zero.
    assert_eq!(
        stats
            .production()
            .get(Protocol::Http)
            .connection_num
            .load(std::sync::atomic::Ordering::Relaxed),
        0
    );
}

#[test]
fn shutdown_drains_and_flushes_a_completed_exchange() {
    let mut config = default_config();
    config.observer.num_shards = 1;
    // Long enough the periodic GC thread can't race the shutdown drain.
    config.observer.gc_interval_ms = 60_000;
    let config = Arc::new(config);

    let flow_key = FlowKey::new(addr(6666), addr(80), L4Protocol::Tcp);
    let start = now_ns();

    let request = b"GET /ping HTTP/1.1\r\nHost: example.com\r\n\r\n";
    let response = b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n";
    let source = VecPacketSource::new(vec![
        event(flow_key, start, ProtocolTag::Http, PacketDir::ClientToServer, request),
        event(flow_key, start + 1, ProtocolTag::Http, PacketDir::ServerToClient, response),
    ]);

    let engine = Engine::spawn(source, config);
    thread::sleep(Duration::from_millis(100));
    let records = engine.shutdown();

    let http: Vec<_> = records.iter().filter(|r| r.protocol == "http").collect();
    assert_eq!(http.len(), 1);
    assert_eq!(http[0].operation, "GET /ping");
    assert_eq!(http[0].count, 1);
}
