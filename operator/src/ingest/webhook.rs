use axum::{
    Router,
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::StatusCode,
    routing::post,
};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use leastpriv_types::WebhookSource;
use owo_colors::OwoColorize;
use rustls::RootCertStore;
use rustls::server::WebPkiClientVerifier;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::dedup::{DEFAULT_DEDUP_CAPACITY, DedupCache};
use super::{AuditEvent, AuditEventList, Ingestor, Position, SourceLabels, StartedIngestor};
use crate::util::{Error, metrics};

/// Grace period for in-flight requests after cancellation.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

/// TLS listener accepting audit EventList batches from the API server's
/// webhook backend. The source is stateless: replay protection comes from
/// the auditID dedup window, not from a position.
pub struct WebhookIngestor {
    port: u16,
    max_body_bytes: usize,
    rate_limit_per_second: u32,
    tls: rustls::ServerConfig,
    labels: SourceLabels,
}

impl WebhookIngestor {
    pub fn new(cfg: &WebhookSource, labels: SourceLabels, tls: rustls::ServerConfig) -> Self {
        WebhookIngestor {
            port: cfg.port,
            max_body_bytes: cfg.max_body_bytes.max(1024),
            rate_limit_per_second: cfg.rate_limit_per_second.max(1),
            tls,
            labels,
        }
    }

    async fn run(
        self,
        cancel: CancellationToken,
        tx: mpsc::Sender<AuditEvent>,
    ) -> Result<(), Error> {
        let state = WebhookState {
            tx,
            dedup: Arc::new(DedupCache::new(DEFAULT_DEDUP_CAPACITY)),
            bucket: Arc::new(TokenBucket::new(self.rate_limit_per_second)),
            labels: self.labels.clone(),
        };
        let app = Router::new()
            .route("/", post(ingest))
            .route("/{*path}", post(ingest))
            .layer(DefaultBodyLimit::max(self.max_body_bytes))
            .with_state(state);

        let listener = TcpListener::bind(("0.0.0.0", self.port)).await?;
        let acceptor = TlsAcceptor::from(Arc::new(self.tls));
        let tracker = TaskTracker::new();
        println!(
            "{}{}",
            "🔐 Webhook source listening • port=".green(),
            format!("{}", self.port).green().dimmed(),
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => {
                    let Ok((stream, _peer)) = accepted else { continue };
                    let acceptor = acceptor.clone();
                    let app = app.clone();
                    tracker.spawn(async move {
                        let tls_stream = match acceptor.accept(stream).await {
                            Ok(s) => s,
                            Err(e) => {
                                eprintln!("webhook TLS handshake failed: {e}");
                                return;
                            }
                        };
                        let io = TokioIo::new(tls_stream);
                        let service = TowerToHyperService::new(app);
                        if let Err(e) = auto::Builder::new(TokioExecutor::new())
                            .serve_connection(io, service)
                            .await
                        {
                            eprintln!("webhook connection error: {e}");
                        }
                    });
                }
            }
        }

        tracker.close();
        if tokio::time::timeout(SHUTDOWN_DEADLINE, tracker.wait())
            .await
            .is_err()
        {
            eprintln!(
                "⚠️ webhook connections still open after {:?}; abandoning",
                SHUTDOWN_DEADLINE
            );
        }
        Ok(())
    }
}

impl Ingestor for WebhookIngestor {
    fn start(
        self: Box<Self>,
        cancel: CancellationToken,
        tx: mpsc::Sender<AuditEvent>,
    ) -> StartedIngestor {
        let position = Arc::new(Mutex::new(Position::default()));
        let task = tokio::spawn(async move { self.run(cancel, tx).await });
        StartedIngestor { task, position }
    }
}

#[derive(Clone)]
struct WebhookState {
    tx: mpsc::Sender<AuditEvent>,
    dedup: Arc<DedupCache>,
    bucket: Arc<TokenBucket>,
    labels: SourceLabels,
}

async fn ingest(State(state): State<WebhookState>, body: Bytes) -> StatusCode {
    if !state.bucket.try_acquire() {
        return StatusCode::TOO_MANY_REQUESTS;
    }
    let batch: AuditEventList = match serde_json::from_slice(&body) {
        Ok(batch) => batch,
        Err(_) => {
            metrics::parse_error(&state.labels.name, &state.labels.namespace);
            return StatusCode::BAD_REQUEST;
        }
    };
    accept_batch(&state, batch.items)
}

/// Enqueue a batch, consulting the dedup window per event. A saturated
/// channel yields 429 so the sender retries; events enqueued before the 429
/// are absorbed as duplicates on the retry, while the event that hit the
/// full channel is released from the window so the retry can deliver it.
fn accept_batch(state: &WebhookState, events: Vec<AuditEvent>) -> StatusCode {
    for event in events {
        if !state.dedup.insert(&event.audit_id) {
            metrics::webhook_duplicate(&state.labels.name, &state.labels.namespace);
            continue;
        }
        let audit_id = event.audit_id.clone();
        match state.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                state.dedup.remove(&audit_id);
                return StatusCode::TOO_MANY_REQUESTS;
            }
            Err(TrySendError::Closed(_)) => {
                state.dedup.remove(&audit_id);
                return StatusCode::INTERNAL_SERVER_ERROR;
            }
        }
    }
    StatusCode::OK
}

/// In-process token bucket refilled at a fixed per-second rate; burst
/// capacity equals the rate.
pub struct TokenBucket {
    capacity: f64,
    refill_per_second: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(rate_per_second: u32) -> Self {
        let rate = rate_per_second.max(1) as f64;
        TokenBucket {
            capacity: rate,
            refill_per_second: rate,
            state: Mutex::new(BucketState {
                tokens: rate,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().expect("token bucket poisoned");
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_second).min(self.capacity);
        state.last_refill = now;
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Build the listener's TLS config from the referenced Secrets. Minimum
/// protocol version is TLS 1.2; a client CA secret switches on required
/// client-certificate verification. Certificates are read once per pipeline
/// start; rotation needs a restart.
pub async fn load_tls_config(
    client: &Client,
    namespace: &str,
    cfg: &WebhookSource,
) -> Result<rustls::ServerConfig, Error> {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);

    let tls_secret = get_secret(&secrets, &cfg.tls_secret).await?;
    let cert_pem = secret_key(&tls_secret, &cfg.tls_secret, "tls.crt")?;
    let key_pem = secret_key(&tls_secret, &cfg.tls_secret, "tls.key")?;

    let certs = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("invalid tls.crt in '{}': {e}", cfg.tls_secret)))?;
    if certs.is_empty() {
        return Err(Error::Tls(format!(
            "no certificates found in '{}'",
            cfg.tls_secret
        )));
    }
    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .map_err(|e| Error::Tls(format!("invalid tls.key in '{}': {e}", cfg.tls_secret)))?
        .ok_or_else(|| Error::Tls(format!("no private key found in '{}'", cfg.tls_secret)))?;

    let builder = rustls::ServerConfig::builder_with_protocol_versions(&[
        &rustls::version::TLS12,
        &rustls::version::TLS13,
    ]);
    let builder = match &cfg.client_ca_secret {
        Some(ca_secret_name) => {
            let ca_secret = get_secret(&secrets, ca_secret_name).await?;
            let ca_pem = secret_key(&ca_secret, ca_secret_name, "ca.crt")?;
            let mut roots = RootCertStore::empty();
            for cert in rustls_pemfile::certs(&mut ca_pem.as_slice()) {
                let cert = cert
                    .map_err(|e| Error::Tls(format!("invalid ca.crt in '{ca_secret_name}': {e}")))?;
                roots
                    .add(cert)
                    .map_err(|e| Error::Tls(format!("unusable CA certificate: {e}")))?;
            }
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| Error::Tls(format!("client verifier: {e}")))?;
            builder.with_client_cert_verifier(verifier)
        }
        None => builder.with_no_client_auth(),
    };
    builder
        .with_single_cert(certs, key)
        .map_err(|e| Error::Tls(format!("certificate/key mismatch: {e}")))
}

async fn get_secret(api: &Api<Secret>, name: &str) -> Result<Secret, Error> {
    match api.get(name).await {
        Ok(secret) => Ok(secret),
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            Err(Error::Tls(format!("TLS secret '{name}' not found")))
        }
        Err(e) => Err(e.into()),
    }
}

fn secret_key(secret: &Secret, secret_name: &str, key: &str) -> Result<Vec<u8>, Error> {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .map(|bytes| bytes.0.clone())
        .ok_or_else(|| Error::Tls(format!("secret '{secret_name}' is missing '{key}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with_capacity(capacity: usize) -> (WebhookState, mpsc::Receiver<AuditEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        let state = WebhookState {
            tx,
            dedup: Arc::new(DedupCache::new(16)),
            bucket: Arc::new(TokenBucket::new(1000)),
            labels: SourceLabels {
                name: "hook".into(),
                namespace: "default".into(),
            },
        };
        (state, rx)
    }

    fn event(id: &str) -> AuditEvent {
        AuditEvent {
            audit_id: id.to_string(),
            verb: "get".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn duplicate_audit_ids_enter_once() {
        let (state, mut rx) = state_with_capacity(8);
        let status = accept_batch(&state, vec![event("same"), event("same")]);
        assert_eq!(status, StatusCode::OK);
        assert_eq!(rx.recv().await.unwrap().audit_id, "same");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn saturated_channel_returns_429_and_retry_succeeds() {
        let (state, mut rx) = state_with_capacity(1);
        let batch = vec![event("a"), event("b")];
        // First attempt fills the channel with "a" and trips on "b".
        assert_eq!(
            accept_batch(&state, batch.clone()),
            StatusCode::TOO_MANY_REQUESTS
        );
        // Pipeline drains; the sender retries the whole batch. "a" is now a
        // duplicate and only "b" is enqueued.
        assert_eq!(rx.recv().await.unwrap().audit_id, "a");
        assert_eq!(accept_batch(&state, batch), StatusCode::OK);
        assert_eq!(rx.recv().await.unwrap().audit_id, "b");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn malformed_body_is_rejected() {
        let (state, _rx) = state_with_capacity(8);
        let status = ingest(
            State(state),
            Bytes::from_static(b"{not json"),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn token_bucket_enforces_burst() {
        let bucket = TokenBucket::new(2);
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }
}
