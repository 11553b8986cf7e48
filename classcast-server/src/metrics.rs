//! Prometheus metrics for the classcast gateway.
//!
//! This module provides:
//! - Metrics registry with counters, gauges, and histograms labeled by namespace
//! - HTTP server exposing `/metrics` and `/healthz`

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{
    Counter, CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Command duration histogram buckets (in seconds).
const DURATION_BUCKETS: &[f64] = &[0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0];

/// Label used before a connection is bound to a namespace.
pub const NO_NAMESPACE: &str = "none";

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Connections bound to a namespace.
    pub connections_total: CounterVec,
    pub connections_active: GaugeVec,
    /// Inbound commands by namespace and command.
    pub events_total: CounterVec,
    /// Broadcasts emitted by namespace and event.
    pub broadcasts_total: CounterVec,
    /// Failed commands and handshakes by namespace and error code.
    pub errors_total: CounterVec,
    pub command_duration: HistogramVec,
    /// Events dropped because a connection's outbound queue was full.
    pub deliveries_dropped_total: CounterVec,
    /// Envelopes that could not be published after the retry.
    pub fanout_failures_total: Counter,
}

impl Metrics {
    /// Creates a new Metrics instance with all metrics registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let connections_total = CounterVec::new(
            Opts::new(
                "classcast_connections_total",
                "Total connections bound to a namespace",
            ),
            &["namespace"],
        )?;
        registry.register(Box::new(connections_total.clone()))?;

        let connections_active = GaugeVec::new(
            Opts::new(
                "classcast_connections_active",
                "Currently connected clients by namespace",
            ),
            &["namespace"],
        )?;
        registry.register(Box::new(connections_active.clone()))?;

        let events_total = CounterVec::new(
            Opts::new(
                "classcast_events_total",
                "Inbound commands by namespace and command",
            ),
            &["namespace", "command"],
        )?;
        registry.register(Box::new(events_total.clone()))?;

        let broadcasts_total = CounterVec::new(
            Opts::new(
                "classcast_broadcasts_total",
                "Broadcast events by namespace and event",
            ),
            &["namespace", "event"],
        )?;
        registry.register(Box::new(broadcasts_total.clone()))?;

        let errors_total = CounterVec::new(
            Opts::new(
                "classcast_errors_total",
                "Errors returned to clients by namespace and code",
            ),
            &["namespace", "code"],
        )?;
        registry.register(Box::new(errors_total.clone()))?;

        let command_duration = HistogramVec::new(
            HistogramOpts::new(
                "classcast_command_duration_seconds",
                "Command handling time in seconds",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
            &["namespace", "command"],
        )?;
        registry.register(Box::new(command_duration.clone()))?;

        let deliveries_dropped_total = CounterVec::new(
            Opts::new(
                "classcast_deliveries_dropped_total",
                "Events dropped on full outbound queues",
            ),
            &["namespace"],
        )?;
        registry.register(Box::new(deliveries_dropped_total.clone()))?;

        let fanout_failures_total = Counter::with_opts(Opts::new(
            "classcast_fanout_failures_total",
            "Broadcast envelopes that failed to publish",
        ))?;
        registry.register(Box::new(fanout_failures_total.clone()))?;

        Ok(Self {
            registry,
            connections_total,
            connections_active,
            events_total,
            broadcasts_total,
            errors_total,
            command_duration,
            deliveries_dropped_total,
            fanout_failures_total,
        })
    }

    pub fn connection_opened(&self, namespace: &str) {
        self.connections_total.with_label_values(&[namespace]).inc();
        self.connections_active.with_label_values(&[namespace]).inc();
    }

    pub fn connection_closed(&self, namespace: &str) {
        self.connections_active.with_label_values(&[namespace]).dec();
    }

    pub fn record_error(&self, namespace: &str, code: &str) {
        self.errors_total.with_label_values(&[namespace, code]).inc();
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!("Failed to encode metrics: {}", e);
        }
        buffer
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Runs the HTTP metrics server on `addr`.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Arc<Metrics>,
    shutdown: broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    serve_metrics(listener, metrics, shutdown).await
}

/// Serves metrics on an already bound listener until shutdown.
pub async fn serve_metrics(
    listener: TcpListener,
    metrics: Arc<Metrics>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing::info!(
        "Metrics server listening on http://{}/metrics",
        listener.local_addr()?
    );

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let metrics = metrics.clone();
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                async move { handle_request(req, metrics).await }
                            });
                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                tracing::debug!("Metrics connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Metrics server accept error: {}", e);
                    }
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("Metrics server shutting down");
                break;
            }
        }
    }

    Ok(())
}

fn respond(
    status: StatusCode,
    content_type: &'static str,
    body: impl Into<Bytes>,
) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let response = match req.uri().path() {
        "/metrics" => respond(
            StatusCode::OK,
            "text/plain; version=0.0.4; charset=utf-8",
            metrics.encode(),
        ),
        "/health" | "/healthz" => respond(StatusCode::OK, "text/plain", "OK"),
        _ => respond(StatusCode::NOT_FOUND, "text/plain", "Not Found"),
    };
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();

        metrics.connection_opened("/messaging");
        metrics
            .events_total
            .with_label_values(&["/messaging", "typing_start"])
            .inc();
        metrics
            .broadcasts_total
            .with_label_values(&["/gradebook", "grade_posted"])
            .inc();
        metrics.record_error("/live", "RATE_LIMITED");
        metrics
            .command_duration
            .with_label_values(&["/live", "stroke"])
            .observe(0.002);
        metrics
            .deliveries_dropped_total
            .with_label_values(&["/live"])
            .inc();
        metrics.fanout_failures_total.inc();

        let encoded = String::from_utf8(metrics.encode()).unwrap();
        assert!(encoded.contains("classcast_connections_total"));
        assert!(encoded.contains("classcast_events_total"));
        assert!(encoded.contains("classcast_broadcasts_total"));
        assert!(encoded.contains("classcast_errors_total"));
        assert!(encoded.contains("classcast_command_duration_seconds"));
        assert!(encoded.contains("classcast_deliveries_dropped_total"));
        assert!(encoded.contains("classcast_fanout_failures_total 1"));
    }

    #[test]
    fn test_active_connections_by_namespace() {
        let metrics = Metrics::new().unwrap();
        metrics.connection_opened("/messaging");
        metrics.connection_opened("/messaging");
        metrics.connection_opened("/live");
        metrics.connection_closed("/messaging");

        let encoded = String::from_utf8(metrics.encode()).unwrap();
        assert!(encoded.contains("classcast_connections_active{namespace=\"/messaging\"} 1"));
        assert!(encoded.contains("classcast_connections_active{namespace=\"/live\"} 1"));
    }

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
            path
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_http_endpoints() {
        let metrics = Arc::new(Metrics::new().unwrap());
        metrics.connection_opened("/gradebook");
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let server = tokio::spawn(serve_metrics(listener, metrics, shutdown_rx));

        let health = get(addr, "/healthz").await;
        assert!(health.starts_with("HTTP/1.1 200"));
        assert!(health.ends_with("OK"));

        let scrape = get(addr, "/metrics").await;
        assert!(scrape.contains("classcast_connections_total{namespace=\"/gradebook\"} 1"));

        let missing = get(addr, "/nope").await;
        assert!(missing.starts_with("HTTP/1.1 404"));

        shutdown_tx.send(()).unwrap();
        server.await.unwrap().unwrap();
    }
}
