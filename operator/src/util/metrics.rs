//! Prometheus metrics for the operator, served over a small hyper listener
//! on `METRICS_PORT`. With the `metrics` feature disabled every recording
//! function compiles to a no-op and no listener is started.

#[cfg(feature = "metrics")]
use lazy_static::lazy_static;
#[cfg(feature = "metrics")]
use prometheus::{
    HistogramVec, IntCounterVec, register_histogram_vec, register_int_counter_vec,
};
use tokio_util::sync::CancellationToken;

#[cfg(feature = "metrics")]
lazy_static! {
    static ref EVENTS_PROCESSED: IntCounterVec = register_int_counter_vec!(
        "leastpriv_events_processed_total",
        "Audit events accepted into a pipeline",
        &["source", "namespace"]
    )
    .unwrap();
    static ref EVENTS_FILTERED: IntCounterVec = register_int_counter_vec!(
        "leastpriv_events_filtered_total",
        "Audit events rejected by the filter chain",
        &["source", "namespace"]
    )
    .unwrap();
    static ref PARSE_ERRORS: IntCounterVec = register_int_counter_vec!(
        "leastpriv_parse_errors_total",
        "Lines or payloads that failed to parse as audit events",
        &["source", "namespace"]
    )
    .unwrap();
    static ref RULES_GENERATED: IntCounterVec = register_int_counter_vec!(
        "leastpriv_rules_generated_total",
        "Policy rules emitted by the strategy engine",
        &["source", "namespace"]
    )
    .unwrap();
    static ref REPORTS_UPDATED: IntCounterVec = register_int_counter_vec!(
        "leastpriv_reports_updated_total",
        "Report objects created or updated",
        &["source", "namespace"]
    )
    .unwrap();
    static ref WEBHOOK_DUPLICATES: IntCounterVec = register_int_counter_vec!(
        "leastpriv_webhook_duplicates_total",
        "Webhook events dropped by the auditID dedup cache",
        &["source", "namespace"]
    )
    .unwrap();
    static ref CLOUD_MESSAGES_RECEIVED: IntCounterVec = register_int_counter_vec!(
        "leastpriv_cloud_messages_received_total",
        "Envelopes received from a cloud message source",
        &["source", "namespace"]
    )
    .unwrap();
    static ref CLOUD_MESSAGES_ACKED: IntCounterVec = register_int_counter_vec!(
        "leastpriv_cloud_messages_acked_total",
        "Envelopes acknowledged back to a cloud message source",
        &["source", "namespace"]
    )
    .unwrap();
    static ref CLOUD_PARSE_ERRORS: IntCounterVec = register_int_counter_vec!(
        "leastpriv_cloud_parse_errors_total",
        "Cloud envelopes that failed to parse",
        &["source", "namespace"]
    )
    .unwrap();
    static ref FLUSH_DURATION: HistogramVec = register_histogram_vec!(
        "leastpriv_flush_duration_seconds",
        "Wall time of one pipeline flush cycle",
        &["source", "namespace"]
    )
    .unwrap();
}

macro_rules! counter_fn {
    ($name:ident, $metric:ident) => {
        pub fn $name(source: &str, namespace: &str) {
            #[cfg(feature = "metrics")]
            $metric.with_label_values(&[source, namespace]).inc();
            #[cfg(not(feature = "metrics"))]
            let _ = (source, namespace);
        }
    };
}

counter_fn!(event_processed, EVENTS_PROCESSED);
counter_fn!(event_filtered, EVENTS_FILTERED);
counter_fn!(parse_error, PARSE_ERRORS);
counter_fn!(report_updated, REPORTS_UPDATED);
counter_fn!(webhook_duplicate, WEBHOOK_DUPLICATES);
counter_fn!(cloud_message_received, CLOUD_MESSAGES_RECEIVED);
counter_fn!(cloud_message_acked, CLOUD_MESSAGES_ACKED);
counter_fn!(cloud_parse_error, CLOUD_PARSE_ERRORS);

pub fn rules_generated(source: &str, namespace: &str, count: usize) {
    #[cfg(feature = "metrics")]
    RULES_GENERATED
        .with_label_values(&[source, namespace])
        .inc_by(count as u64);
    #[cfg(not(feature = "metrics"))]
    let _ = (source, namespace, count);
}

pub fn observe_flush(source: &str, namespace: &str, seconds: f64) {
    #[cfg(feature = "metrics")]
    FLUSH_DURATION
        .with_label_values(&[source, namespace])
        .observe(seconds);
    #[cfg(not(feature = "metrics"))]
    let _ = (source, namespace, seconds);
}

/// Per-controller reconcile instrumentation, labeled by resource name and
/// namespace plus the action decided by the read phase.
#[cfg(feature = "metrics")]
pub struct ControllerMetrics {
    pub reconcile_counter: IntCounterVec,
    pub action_counter: IntCounterVec,
    pub read_histogram: HistogramVec,
    pub write_histogram: HistogramVec,
}

#[cfg(feature = "metrics")]
impl ControllerMetrics {
    pub fn new(controller: &str) -> Self {
        ControllerMetrics {
            reconcile_counter: register_int_counter_vec!(
                format!("leastpriv_{controller}_reconciles_total"),
                "Total reconciles for this controller",
                &["name", "namespace"]
            )
            .unwrap(),
            action_counter: register_int_counter_vec!(
                format!("leastpriv_{controller}_actions_total"),
                "Actions decided by the read phase",
                &["name", "namespace", "action"]
            )
            .unwrap(),
            read_histogram: register_histogram_vec!(
                format!("leastpriv_{controller}_read_phase_seconds"),
                "Duration of the reconcile read phase",
                &["name", "namespace", "action"]
            )
            .unwrap(),
            write_histogram: register_histogram_vec!(
                format!("leastpriv_{controller}_write_phase_seconds"),
                "Duration of the reconcile write phase",
                &["name", "namespace", "action"]
            )
            .unwrap(),
        }
    }
}

/// Start the scrape endpoint when `METRICS_PORT` is set. Only the first call
/// spawns a server; later calls are ignored. Installs a panic hook so any
/// panicking task takes the container down for a restart.
pub fn maybe_spawn_metrics_server(cancel: &CancellationToken) {
    #[cfg(feature = "metrics")]
    enabled::maybe_spawn(cancel);
    #[cfg(not(feature = "metrics"))]
    let _ = cancel;
}

#[cfg(feature = "metrics")]
mod enabled {
    use bytes::Bytes;
    use http_body_util::Full;
    use hyper::service::service_fn;
    use hyper::{Method, Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use owo_colors::OwoColorize;
    use prometheus::{Encoder, TextEncoder};
    use std::convert::Infallible;
    use std::sync::OnceLock;
    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;

    static SERVER_STARTED: OnceLock<()> = OnceLock::new();

    pub fn maybe_spawn(cancel: &CancellationToken) {
        let Some(port) = std::env::var("METRICS_PORT")
            .ok()
            .and_then(|s| s.parse::<u16>().ok())
        else {
            return;
        };

        // Exit the process with a non-zero code when any thread panics; in a
        // container the restart is the recovery path.
        let default_panic = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            default_panic(info);
            std::process::exit(1);
        }));

        if SERVER_STARTED.set(()).is_ok() {
            tokio::spawn(run_metrics_server(port, cancel.clone()));
        }
    }

    pub async fn run_metrics_server(port: u16, cancel: CancellationToken) {
        let addr = format!("0.0.0.0:{}", port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                eprintln!("🛑 Failed to bind metrics server to {}: {}", addr, e);
                return;
            }
        };
        println!(
            "{}{}",
            "📈 Starting metrics server • port=".green(),
            format!("{}", port).green().dimmed(),
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => {
                    let Ok((stream, _)) = accepted else { continue };
                    tokio::spawn(async move {
                        let io = TokioIo::new(stream);
                        if let Err(e) = hyper::server::conn::http1::Builder::new()
                            .serve_connection(io, service_fn(handle))
                            .await
                        {
                            eprintln!("metrics connection error: {e}");
                        }
                    });
                }
            }
        }
        println!("{}", "🛑 Metrics server stopped".red());
    }

    async fn handle(
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        let response = match (req.method(), req.uri().path()) {
            (&Method::GET, "/metrics") => {
                let mut buf = Vec::new();
                let encoder = TextEncoder::new();
                match encoder.encode(&prometheus::gather(), &mut buf) {
                    Ok(()) => Response::builder()
                        .status(StatusCode::OK)
                        .header("content-type", encoder.format_type())
                        .body(Full::new(Bytes::from(buf)))
                        .unwrap(),
                    Err(e) => Response::builder()
                        .status(StatusCode::INTERNAL_SERVER_ERROR)
                        .body(Full::new(Bytes::from(format!("encode error: {e}"))))
                        .unwrap(),
                }
            }
            (&Method::GET, "/healthz") | (&Method::GET, "/readyz") => Response::builder()
                .status(StatusCode::OK)
                .body(Full::new(Bytes::from_static(b"ok")))
                .unwrap(),
            _ => Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Full::new(Bytes::from_static(b"not found")))
                .unwrap(),
        };
        Ok(response)
    }
}
