use async_trait::async_trait;
use leastpriv_types::CloudSource;
use owo_colors::OwoColorize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{AuditEvent, Ingestor, Position, SharedPosition, SourceLabels, StartedIngestor};
use crate::util::{Error, metrics};

/// Envelope attribute consulted by the cluster-identity gate.
pub const CLUSTER_IDENTITY_ATTRIBUTE: &str = "clusterIdentity";

/// Backoff applied after a failed receive before the next attempt.
const RECEIVE_BACKOFF: Duration = Duration::from_secs(5);

/// Deadline for closing the message source on shutdown.
const CLOSE_DEADLINE: Duration = Duration::from_secs(10);

/// One message from a provider's bus, positioned within its partition.
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    pub partition: String,
    pub sequence: u64,
    pub payload: Vec<u8>,
    pub attributes: BTreeMap<String, String>,
}

/// Provider-side transport: batches in, acknowledgements out. Implementations
/// live outside the core; the default build registers none.
#[async_trait]
pub trait MessageSource: Send {
    async fn connect(&mut self) -> anyhow::Result<()>;
    async fn receive(&mut self) -> anyhow::Result<Vec<Envelope>>;
    async fn acknowledge(&mut self, batch: &[Envelope]) -> anyhow::Result<()>;
    async fn close(&mut self) -> anyhow::Result<()>;
}

/// Decodes a provider envelope payload into zero or more audit events.
pub trait EnvelopeParser: Send + Sync {
    fn parse(&self, payload: &[u8]) -> anyhow::Result<Vec<AuditEvent>>;
}

/// Factory registered per provider tag at process startup.
pub trait CloudProvider: Send + Sync {
    fn build(
        &self,
        cfg: &CloudSource,
        resume: &Position,
    ) -> Result<(Box<dyn MessageSource>, Box<dyn EnvelopeParser>), Error>;
}

static PROVIDERS: OnceLock<RwLock<HashMap<String, Arc<dyn CloudProvider>>>> = OnceLock::new();

fn registry() -> &'static RwLock<HashMap<String, Arc<dyn CloudProvider>>> {
    PROVIDERS.get_or_init(Default::default)
}

/// Register a provider under its tag. Call during initialization, before any
/// pipeline starts; later registrations replace earlier ones.
pub fn register_provider(tag: &str, provider: Arc<dyn CloudProvider>) {
    registry()
        .write()
        .expect("provider registry poisoned")
        .insert(tag.to_string(), provider);
}

pub fn lookup_provider(tag: &str) -> Option<Arc<dyn CloudProvider>> {
    registry()
        .read()
        .expect("provider registry poisoned")
        .get(tag)
        .cloned()
}

/// Drives a provider's message source: receive, parse, gate, emit, ack.
/// Receive failures back off and retry; the position advances only after a
/// batch is acknowledged.
pub struct CloudIngestor {
    source: Box<dyn MessageSource>,
    parser: Box<dyn EnvelopeParser>,
    cluster_identity: Option<String>,
    labels: SourceLabels,
    position: SharedPosition,
}

impl CloudIngestor {
    pub fn new(
        source: Box<dyn MessageSource>,
        parser: Box<dyn EnvelopeParser>,
        cluster_identity: Option<String>,
        labels: SourceLabels,
        resume: Position,
    ) -> Self {
        CloudIngestor {
            source,
            parser,
            cluster_identity,
            labels,
            position: Arc::new(Mutex::new(resume)),
        }
    }

    /// Whether an envelope passes the cluster-identity gate. Envelopes
    /// without a stamp are allowed through.
    fn envelope_allowed(&self, envelope: &Envelope) -> bool {
        match (
            &self.cluster_identity,
            envelope.attributes.get(CLUSTER_IDENTITY_ATTRIBUTE),
        ) {
            (Some(want), Some(have)) => want == have,
            _ => true,
        }
    }

    async fn run(
        mut self,
        cancel: CancellationToken,
        tx: mpsc::Sender<AuditEvent>,
    ) -> Result<(), Error> {
        self.source.connect().await?;
        println!(
            "{}",
            format!(
                "☁️ Cloud source connected • {}/{}",
                self.labels.namespace, self.labels.name
            )
            .green()
        );

        loop {
            let batch = tokio::select! {
                _ = cancel.cancelled() => break,
                received = self.source.receive() => received,
            };
            let envelopes = match batch {
                Ok(envelopes) => envelopes,
                Err(e) => {
                    eprintln!(
                        "⚠️ {}/{} cloud receive failed, backing off: {e:?}",
                        self.labels.namespace, self.labels.name
                    );
                    if leastpriv_common::wait::sleep_jittered(&cancel, RECEIVE_BACKOFF)
                        .await
                        .is_err()
                    {
                        break;
                    }
                    continue;
                }
            };
            if envelopes.is_empty() {
                continue;
            }

            let mut last_timestamp = None;
            for envelope in &envelopes {
                metrics::cloud_message_received(&self.labels.name, &self.labels.namespace);
                let events = match self.parser.parse(&envelope.payload) {
                    Ok(events) => events,
                    Err(_) => {
                        metrics::cloud_parse_error(&self.labels.name, &self.labels.namespace);
                        continue;
                    }
                };
                if !self.envelope_allowed(envelope) {
                    continue;
                }
                for event in events {
                    if let Some(ts) = &event.stage_timestamp {
                        last_timestamp = Some(ts.clone());
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => return self.shutdown().await,
                        sent = tx.send(event) => {
                            if sent.is_err() {
                                return self.shutdown().await;
                            }
                        }
                    }
                }
            }

            // Redelivery after a failed ack is absorbed downstream, so a
            // failure here is transient.
            if let Err(e) = self.source.acknowledge(&envelopes).await {
                eprintln!(
                    "⚠️ {}/{} cloud acknowledge failed: {e:?}",
                    self.labels.namespace, self.labels.name
                );
                continue;
            }
            for _ in &envelopes {
                metrics::cloud_message_acked(&self.labels.name, &self.labels.namespace);
            }

            let mut pos = self.position.lock().expect("position poisoned");
            for envelope in &envelopes {
                pos.advance_partition(&envelope.partition, envelope.sequence);
            }
            if last_timestamp.is_some() {
                pos.last_timestamp = last_timestamp;
            }
        }

        self.shutdown().await
    }

    async fn shutdown(mut self) -> Result<(), Error> {
        if tokio::time::timeout(CLOSE_DEADLINE, self.source.close())
            .await
            .is_err()
        {
            eprintln!(
                "⚠️ {}/{} cloud source did not close within {:?}",
                self.labels.namespace, self.labels.name, CLOSE_DEADLINE
            );
        }
        Ok(())
    }
}

impl Ingestor for CloudIngestor {
    fn start(
        self: Box<Self>,
        cancel: CancellationToken,
        tx: mpsc::Sender<AuditEvent>,
    ) -> StartedIngestor {
        let position = self.position.clone();
        let task = tokio::spawn(async move { self.run(cancel, tx).await });
        StartedIngestor { task, position }
    }
}
