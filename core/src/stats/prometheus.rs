//! Optional Prometheus scrape endpoint (`prometheus` feature).
//!
//! Enable the crate's `prometheus` feature and run [`run`] on a `tokio` runtime, then
//! scrape `http://<bind>/metrics`. Metrics use `Family<ProtocolLabel, Counter>`, one
//! series per [`Protocol`](super::Protocol) variant.

use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::LazyLock;

use http_body_util::Full;
use hyper::body::{Body, Bytes};
use hyper::header::CONTENT_TYPE;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use prometheus_client::encoding::{EncodeLabelSet, LabelSetEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::{Registry, Unit};
use tokio::net::TcpListener;

use super::Protocol;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ProtocolLabel(&'static str);

impl EncodeLabelSet for ProtocolLabel {
    fn encode(&self, mut encoder: LabelSetEncoder) -> Result<(), std::fmt::Error> {
        let mut label = encoder.encode_label();
        let mut key = label.encode_label_key()?;
        key.write_str("protocol")?;
        let mut value = key.encode_label_value()?;
        write!(value, "{}", self.0)?;
        value.finish()
    }
}

#[derive(Default)]
struct Families {
    count: Family<ProtocolLabel, Counter>,
    parse_fail_count: Family<ProtocolLabel, Counter>,
    drop_count: Family<ProtocolLabel, Counter>,
    // Gauges, not counters: connection_num/connection_cached_size are recomputed from
    // scratch every GC sweep (see Stats::reset_gauges), not monotonically incremented.
    connection_num: Family<ProtocolLabel, Gauge>,
    connection_cached_size: Family<ProtocolLabel, Gauge>,
}

static FAMILIES: LazyLock<Families> = LazyLock::new(Families::default);

static REGISTRY: LazyLock<Registry> = LazyLock::new(|| {
    let mut r = Registry::default();
    r.register_with_unit(
        "netobs_count",
        "Number of exchanges observed per protocol.",
        Unit::Other("exchanges".to_string()),
        FAMILIES.count.clone(),
    );
    r.register(
        "netobs_parse_fail_count",
        "Number of parse failures per protocol.",
        FAMILIES.parse_fail_count.clone(),
    );
    r.register(
        "netobs_drop_count",
        "Number of exchanges dropped (sampler or cap) per protocol.",
        FAMILIES.drop_count.clone(),
    );
    r.register(
        "netobs_connection_num",
        "Number of live connections currently bound to each protocol.",
        FAMILIES.connection_num.clone(),
    );
    r.register_with_unit(
        "netobs_connection_cached_size",
        "Bytes held in per-connection reassembly buffers, by protocol.",
        Unit::Bytes,
        FAMILIES.connection_cached_size.clone(),
    );
    r
});

/// Publishes one [`super::Stats`] production snapshot into the process-wide registry.
/// Called periodically by the engine's stats-flush tick.
pub fn publish(stats: &super::Stats) {
    for protocol in [
        Protocol::Http,
        Protocol::Dns,
        Protocol::MySql,
        Protocol::Redis,
        Protocol::PgSql,
        Protocol::Dubbo,
        Protocol::Kafka,
    ] {
        let label = ProtocolLabel(protocol.name());
        let snapshot = stats.production().get(protocol).snapshot();
        FAMILIES.count.get_or_create(&label).inc_by(snapshot.count);
        FAMILIES
            .parse_fail_count
            .get_or_create(&label)
            .inc_by(snapshot.parse_fail_count);
        FAMILIES.drop_count.get_or_create(&label).inc_by(snapshot.drop_count);
        FAMILIES
            .connection_num
            .get_or_create(&label)
            .set(snapshot.connection_num as i64);
        FAMILIES
            .connection_cached_size
            .get_or_create(&label)
            .set(snapshot.connection_cached_size as i64);
    }
}

async fn serve_req(_req: Request<impl Body>) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let mut buffer = String::new();
    prometheus_client::encoding::text::encode(&mut buffer, &REGISTRY).unwrap();
    let response = Response::builder()
        .status(200)
        .header(CONTENT_TYPE, "application/openmetrics-text; version=1.0.0; charset=utf-8")
        .body(Full::new(Bytes::from(buffer)))
        .unwrap();
    Ok(response)
}

/// Runs the scrape endpoint until the process exits. Intended to be spawned onto a
/// dedicated `tokio` runtime by the binary embedding this crate.
pub async fn run(bind: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind).await?;
    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        tokio::task::spawn(async move {
            if let Err(err) = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, service_fn(serve_req))
                .await
            {
                log::warn!("prometheus connection error: {err}");
            }
        });
    }
}
