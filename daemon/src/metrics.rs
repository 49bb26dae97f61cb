//! Prometheus metrics

use std::net::SocketAddr;
use std::sync::LazyLock;

use prometheus::{IntCounter, IntGauge, Opts, Registry};
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Global metrics registry
static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Global metrics instance
pub static METRICS: LazyLock<Metrics> = LazyLock::new(Metrics::new);

/// Metrics struct
pub struct Metrics {
    // Counters
    pub datagrams_received: IntCounter,
    pub packets_relayed: IntCounter,
    pub parse_errors: IntCounter,
    pub auth_successes: IntCounter,
    pub auth_failures: IntCounter,

    // Gauges
    pub voice_clients: IntGauge,
    pub registered_clients: IntGauge,
    pub control_connections: IntGauge,
}

impl Metrics {
    pub fn new() -> Self {
        let datagrams_received = IntCounter::with_opts(Opts::new(
            "vcs_voice_datagrams_received_total",
            "Total number of UDP datagrams received by the voice relay",
        ))
        .unwrap();

        let packets_relayed = IntCounter::with_opts(Opts::new(
            "vcs_voice_packets_relayed_total",
            "Total number of voice packets forwarded to listeners",
        ))
        .unwrap();

        let parse_errors = IntCounter::with_opts(Opts::new(
            "vcs_voice_parse_errors_total",
            "Total number of malformed voice datagrams dropped",
        ))
        .unwrap();

        let auth_successes = IntCounter::with_opts(Opts::new(
            "vcs_auth_successes_total",
            "Total successful authentications",
        ))
        .unwrap();

        let auth_failures = IntCounter::with_opts(Opts::new(
            "vcs_auth_failures_total",
            "Total failed authentications",
        ))
        .unwrap();

        let voice_clients = IntGauge::with_opts(Opts::new(
            "vcs_voice_clients",
            "Number of clients with a live UDP binding",
        ))
        .unwrap();

        let registered_clients = IntGauge::with_opts(Opts::new(
            "vcs_registered_clients",
            "Number of clients in the registry",
        ))
        .unwrap();

        let control_connections = IntGauge::with_opts(Opts::new(
            "vcs_control_connections",
            "Number of open control connections",
        ))
        .unwrap();

        // Register metrics
        REGISTRY.register(Box::new(datagrams_received.clone())).ok();
        REGISTRY.register(Box::new(packets_relayed.clone())).ok();
        REGISTRY.register(Box::new(parse_errors.clone())).ok();
        REGISTRY.register(Box::new(auth_successes.clone())).ok();
        REGISTRY.register(Box::new(auth_failures.clone())).ok();
        REGISTRY.register(Box::new(voice_clients.clone())).ok();
        REGISTRY.register(Box::new(registered_clients.clone())).ok();
        REGISTRY.register(Box::new(control_connections.clone())).ok();

        Self {
            datagrams_received,
            packets_relayed,
            parse_errors,
            auth_successes,
            auth_failures,
            voice_clients,
            registered_clients,
            control_connections,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the metrics exporter
pub fn start_server(bind: SocketAddr, enabled: bool) -> JoinHandle<()> {
    tokio::spawn(async move {
        if !enabled {
            info!("prometheus metrics disabled");
            return;
        }

        use bytes::Bytes;
        use http_body_util::Full;
        use hyper::{server::conn::http1, service::service_fn, Response};
        use hyper_util::rt::TokioIo;

        let listener = match tokio::net::TcpListener::bind(bind).await {
            Ok(l) => l,
            Err(e) => {
                error!("failed to bind metrics server: {}", e);
                return;
            }
        };

        info!("prometheus metrics server listening on {}", bind);

        loop {
            let (stream, _) = match listener.accept().await {
                Ok(r) => r,
                Err(e) => {
                    error!("metrics accept error: {}", e);
                    continue;
                }
            };

            let io = TokioIo::new(stream);

            tokio::spawn(async move {
                let service = service_fn(|_req| async {
                    use prometheus::Encoder;

                    let encoder = prometheus::TextEncoder::new();
                    let mut buffer = Vec::new();
                    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
                        error!("failed to encode metrics: {}", e);
                    }

                    Ok::<_, std::convert::Infallible>(
                        Response::builder()
                            .header("Content-Type", "text/plain")
                            .body(Full::new(Bytes::from(buffer)))
                            .unwrap(),
                    )
                });

                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    error!("metrics connection error: {}", e);
                }
            });
        }
    })
}
