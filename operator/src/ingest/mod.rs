use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::Client;
use leastpriv_types::{AuditSource, AuditSourceStatus, CloudCheckpoint, SourceMode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::util::Error;

pub mod cloud;
pub mod dedup;
pub mod file;
pub mod webhook;

/// One structured record from the API server's audit stream. Unknown fields
/// are tolerated and ignored; an event that fails to deserialize at all is
/// counted and dropped.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    #[serde(default, rename = "auditID")]
    pub audit_id: String,
    #[serde(default)]
    pub verb: String,
    #[serde(default)]
    pub user: EventUser,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_ref: Option<ObjectRef>,
    #[serde(default, rename = "requestURI")]
    pub request_uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_status: Option<ResponseStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_timestamp: Option<Time>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct EventUser {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub groups: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRef {
    #[serde(default)]
    pub api_group: String,
    #[serde(default)]
    pub resource: String,
    #[serde(default)]
    pub subresource: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ResponseStatus {
    #[serde(default)]
    pub code: i32,
}

/// The webhook batch payload: an `audit.k8s.io` EventList.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AuditEventList {
    #[serde(default)]
    pub items: Vec<AuditEvent>,
}

/// Opaque resumption token. Only the fields for the active source mode are
/// populated; the rest stay zero. Offsets and sequences only ever advance
/// while an inode is stable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Position {
    pub file_offset: u64,
    pub inode: u64,
    pub partition_offsets: BTreeMap<String, u64>,
    pub last_timestamp: Option<Time>,
}

impl Position {
    pub fn from_status(status: Option<&AuditSourceStatus>) -> Self {
        let Some(status) = status else {
            return Position::default();
        };
        Position {
            file_offset: status.file_offset.unwrap_or(0),
            inode: status.inode.unwrap_or(0),
            partition_offsets: status
                .cloud_checkpoint
                .as_ref()
                .map(|c| c.partition_offsets.clone())
                .unwrap_or_default(),
            last_timestamp: status.last_timestamp.clone(),
        }
    }

    /// Write this position into a Source status, advancing sequences
    /// monotonically. A rewound file offset is only accepted together with
    /// an inode change (rotation).
    pub fn apply_to(&self, status: &mut AuditSourceStatus) {
        let same_inode = status.inode == Some(self.inode);
        if !same_inode || status.file_offset.unwrap_or(0) < self.file_offset {
            status.file_offset = Some(self.file_offset);
        }
        status.inode = Some(self.inode);
        if !self.partition_offsets.is_empty() {
            let checkpoint = status
                .cloud_checkpoint
                .get_or_insert_with(CloudCheckpoint::default);
            for (partition, seq) in &self.partition_offsets {
                let entry = checkpoint
                    .partition_offsets
                    .entry(partition.clone())
                    .or_insert(0);
                if *seq > *entry {
                    *entry = *seq;
                }
            }
        }
        if self.last_timestamp.is_some() {
            status.last_timestamp = self.last_timestamp.clone();
        }
    }

    /// Record a newly acknowledged sequence, never regressing.
    pub fn advance_partition(&mut self, partition: &str, sequence: u64) {
        let entry = self
            .partition_offsets
            .entry(partition.to_string())
            .or_insert(0);
        if sequence > *entry {
            *entry = sequence;
        }
    }
}

pub type SharedPosition = Arc<Mutex<Position>>;

/// Metric label values identifying the owning Source.
#[derive(Debug, Clone, Default)]
pub struct SourceLabels {
    pub name: String,
    pub namespace: String,
}

/// A running ingestion task plus the checkpoint handle the pipeline reads at
/// each flush.
pub struct StartedIngestor {
    pub task: JoinHandle<Result<(), Error>>,
    pub position: SharedPosition,
}

/// Contract shared by the file, webhook and cloud variants: the task streams
/// events into the channel until cancelled or an unrecoverable source error
/// occurs, and keeps `position` current as events are handed off.
pub trait Ingestor: Send {
    fn start(
        self: Box<Self>,
        cancel: CancellationToken,
        tx: mpsc::Sender<AuditEvent>,
    ) -> StartedIngestor;
}

/// Construct the ingestor declared by the Source. Errors here are
/// configuration errors and fail pipeline startup.
pub async fn build_ingestor(
    client: &Client,
    source: &AuditSource,
    resume: Position,
) -> Result<Box<dyn Ingestor>, Error> {
    let namespace = source
        .metadata
        .namespace
        .as_deref()
        .ok_or_else(|| Error::UserInput("AuditSource is missing metadata.namespace".to_string()))?;
    let labels = SourceLabels {
        name: source
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::UserInput("AuditSource is missing metadata.name".to_string()))?,
        namespace: namespace.to_string(),
    };
    match source.spec.mode {
        SourceMode::File => {
            let cfg = source.spec.file.as_ref().ok_or_else(|| {
                Error::UserInput("mode is File but spec.file is not set".to_string())
            })?;
            Ok(Box::new(file::FileIngestor::new(&cfg.path, labels, resume)))
        }
        SourceMode::Webhook => {
            let cfg = source.spec.webhook.as_ref().ok_or_else(|| {
                Error::UserInput("mode is Webhook but spec.webhook is not set".to_string())
            })?;
            if cfg.port == 0 {
                return Err(Error::UserInput(
                    "spec.webhook.port must be in 1-65535".to_string(),
                ));
            }
            let tls = webhook::load_tls_config(client, namespace, cfg).await?;
            Ok(Box::new(webhook::WebhookIngestor::new(cfg, labels, tls)))
        }
        SourceMode::Cloud => {
            let cfg = source.spec.cloud.as_ref().ok_or_else(|| {
                Error::UserInput("mode is Cloud but spec.cloud is not set".to_string())
            })?;
            let provider = cloud::lookup_provider(&cfg.provider)
                .ok_or_else(|| Error::UnknownProvider(cfg.provider.clone()))?;
            let (message_source, parser) = provider.build(cfg, &resume)?;
            Ok(Box::new(cloud::CloudIngestor::new(
                message_source,
                parser,
                cfg.cluster_identity.clone(),
                labels,
                resume,
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audit_event_parses_wire_format() {
        let raw = r#"{
            "kind": "Event",
            "apiVersion": "audit.k8s.io/v1",
            "auditID": "a1b2c3",
            "stage": "ResponseComplete",
            "verb": "get",
            "user": {"username": "system:serviceaccount:prod:backend", "groups": ["system:serviceaccounts"]},
            "objectRef": {"resource": "pods", "namespace": "prod", "name": "api-0", "apiVersion": "v1"},
            "requestURI": "/api/v1/namespaces/prod/pods/api-0",
            "responseStatus": {"code": 200},
            "stageTimestamp": "2026-03-01T10:15:30.123456Z"
        }"#;
        let event: AuditEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(event.audit_id, "a1b2c3");
        assert_eq!(event.verb, "get");
        assert_eq!(event.user.username, "system:serviceaccount:prod:backend");
        let obj = event.object_ref.unwrap();
        assert_eq!(obj.resource, "pods");
        assert_eq!(obj.namespace, "prod");
        assert!(event.stage_timestamp.is_some());
    }

    #[test]
    fn position_apply_is_monotone() {
        let mut status = AuditSourceStatus::default();
        let mut pos = Position {
            file_offset: 100,
            inode: 7,
            ..Default::default()
        };
        pos.apply_to(&mut status);
        assert_eq!(status.file_offset, Some(100));

        // A stale snapshot with the same inode must not rewind the offset.
        pos.file_offset = 50;
        pos.apply_to(&mut status);
        assert_eq!(status.file_offset, Some(100));

        // Rotation (new inode) legitimately rewinds.
        pos.file_offset = 10;
        pos.inode = 8;
        pos.apply_to(&mut status);
        assert_eq!(status.file_offset, Some(10));
        assert_eq!(status.inode, Some(8));
    }

    #[test]
    fn partition_sequences_never_regress() {
        let mut pos = Position::default();
        pos.advance_partition("0", 5);
        pos.advance_partition("0", 3);
        pos.advance_partition("1", 9);
        assert_eq!(pos.partition_offsets["0"], 5);
        assert_eq!(pos.partition_offsets["1"], 9);
    }
}
