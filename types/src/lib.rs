use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, str::FromStr};

/// Ingestion mode discriminator for an [`AuditSource`].
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Default)]
pub enum SourceMode {
    #[default]
    File,
    Webhook,
    Cloud,
}

impl fmt::Display for SourceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceMode::File => write!(f, "File"),
            SourceMode::Webhook => write!(f, "Webhook"),
            SourceMode::Cloud => write!(f, "Cloud"),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FileSource {
    /// Path to the audit log, one JSON event per line.
    pub path: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WebhookSource {
    pub port: u16,
    /// Secret holding `tls.crt` / `tls.key` for the listener.
    pub tls_secret: String,
    /// Optional Secret holding `ca.crt`; when set, client certificates are
    /// required and verified (mutual TLS).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ca_secret: Option<String>,
    #[serde(default = "default_rate_limit_per_second")]
    pub rate_limit_per_second: u32,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CloudSource {
    /// Provider tag resolved against the process-level provider registry.
    pub provider: String,
    /// When set, envelopes stamped with a different cluster identity are
    /// dropped. Envelopes without a stamp are allowed through.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_identity: Option<String>,
    /// Provider-specific settings, opaque to the core.
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Default)]
pub enum ScopeMode {
    #[default]
    NamespaceStrict,
    ClusterScopeAllowed,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Default)]
pub enum VerbMerge {
    #[default]
    Smart,
    Exact,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Default)]
pub enum WildcardPolicy {
    #[default]
    Forbidden,
    Safe,
}

/// `Explicit` is accepted but not acted upon; audit events rarely carry the
/// object name, so only `Omit` semantics are wired through the strategy
/// engine.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Default)]
pub enum ResourceNamePolicy {
    #[default]
    Omit,
    Explicit,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PolicyStrategy {
    #[serde(default)]
    pub scope_mode: ScopeMode,
    #[serde(default)]
    pub verb_merge: VerbMerge,
    #[serde(default)]
    pub wildcards: WildcardPolicy,
    #[serde(default)]
    pub resource_names: ResourceNamePolicy,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum FilterAction {
    Allow,
    Deny,
}

/// One entry of the ordered filter chain. A rule matches when either present
/// pattern matches; the first matching rule decides.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FilterRule {
    pub action: FilterAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_pattern: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointConfig {
    /// Flush interval; clamped to a 5 second minimum at runtime.
    #[serde(default = "default_checkpoint_interval_seconds")]
    pub interval_seconds: u64,
    /// Event channel capacity between ingestor and pipeline.
    #[serde(default = "default_checkpoint_batch_size")]
    pub batch_size: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_checkpoint_interval_seconds(),
            batch_size: default_checkpoint_batch_size(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReportLimits {
    #[serde(default = "default_max_rules_per_report")]
    pub max_rules_per_report: usize,
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
}

impl Default for ReportLimits {
    fn default() -> Self {
        Self {
            max_rules_per_report: default_max_rules_per_report(),
            retention_days: default_retention_days(),
        }
    }
}

fn default_rate_limit_per_second() -> u32 {
    100
}

fn default_max_body_bytes() -> usize {
    1_048_576
}

fn default_checkpoint_interval_seconds() -> u64 {
    30
}

fn default_checkpoint_batch_size() -> usize {
    500
}

fn default_max_rules_per_report() -> usize {
    200
}

fn default_retention_days() -> u64 {
    30
}

fn default_ignore_system_users() -> bool {
    true
}

#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "audit.leastpriv.io",
    version = "v1",
    kind = "AuditSource",
    plural = "auditsources",
    derive = "PartialEq",
    status = "AuditSourceStatus",
    namespaced
)]
#[kube(derive = "Default")]
#[kube(
    printcolumn = "{\"jsonPath\": \".spec.mode\", \"name\": \"MODE\", \"type\": \"string\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.conditions[?(@.type==\\\"Ready\\\")].status\", \"name\": \"READY\", \"type\": \"string\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.lastUpdated\", \"name\": \"AGE\", \"type\": \"date\" }"
)]
#[serde(rename_all = "camelCase")]
pub struct AuditSourceSpec {
    pub mode: SourceMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FileSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<WebhookSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud: Option<CloudSource>,
    #[serde(default)]
    pub policy: PolicyStrategy,
    #[serde(default)]
    pub filters: Vec<FilterRule>,
    #[serde(default = "default_ignore_system_users")]
    pub ignore_system_users: bool,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub limits: ReportLimits,
}

/// Resumption state for a cloud source: highest acknowledged sequence per
/// partition.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CloudCheckpoint {
    #[serde(default)]
    pub partition_offsets: BTreeMap<String, u64>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AuditSourceStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_offset: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inode: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_timestamp: Option<Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_checkpoint: Option<CloudCheckpoint>,
    #[serde(rename = "lastUpdated", skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<Time>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Default)]
pub enum SubjectKind {
    #[default]
    ServiceAccount,
    User,
    Group,
}

impl FromStr for SubjectKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ServiceAccount" => Ok(SubjectKind::ServiceAccount),
            "User" => Ok(SubjectKind::User),
            "Group" => Ok(SubjectKind::Group),
            _ => Err(()),
        }
    }
}

impl fmt::Display for SubjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubjectKind::ServiceAccount => write!(f, "ServiceAccount"),
            SubjectKind::User => write!(f, "User"),
            SubjectKind::Group => write!(f, "Group"),
        }
    }
}

/// The acting identity a report describes. Namespace is set only for
/// service accounts.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubjectRef {
    pub kind: SubjectKind,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(CustomResource, Serialize, Deserialize, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "audit.leastpriv.io",
    version = "v1",
    kind = "RbacReport",
    plural = "rbacreports",
    derive = "PartialEq",
    status = "RbacReportStatus",
    namespaced
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".spec.subject.kind\", \"name\": \"KIND\", \"type\": \"string\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.conditions[?(@.type==\\\"Ready\\\")].status\", \"name\": \"READY\", \"type\": \"string\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.compliance.severity\", \"name\": \"SEVERITY\", \"type\": \"string\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.compliance.score\", \"name\": \"SCORE\", \"type\": \"integer\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.lastUpdated\", \"name\": \"AGE\", \"type\": \"date\" }"
)]
#[serde(rename_all = "camelCase")]
pub struct RbacReportSpec {
    pub subject: SubjectRef,
}

/// A canonical rule together with its observation history. Each entry holds
/// a single (apiGroup, resource, verb) or nonResourceURL tuple; the vectors
/// exist for PolicyRule shape compatibility.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObservedRule {
    #[serde(default)]
    pub api_groups: Vec<String>,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub verbs: Vec<String>,
    #[serde(default)]
    pub non_resource_urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub first_seen: Time,
    pub last_seen: Time,
    pub count: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SuggestedPolicy {
    /// Rendered manifests, each a single YAML document.
    #[serde(default)]
    pub manifests: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Default)]
pub enum Severity {
    Green,
    Yellow,
    #[default]
    Red,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Green => write!(f, "Green"),
            Severity::Yellow => write!(f, "Yellow"),
            Severity::Red => write!(f, "Red"),
        }
    }
}

/// A PolicyRule-shaped tuple scoped to a namespace; namespace is absent for
/// cluster-scoped grants.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScopedPolicyRule {
    #[serde(default)]
    pub api_groups: Vec<String>,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub verbs: Vec<String>,
    #[serde(default)]
    pub non_resource_urls: Vec<String>,
    #[serde(default)]
    pub resource_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Compliance {
    /// used / (used + excess) × 100, integer-rounded.
    pub score: i32,
    pub severity: Severity,
    pub used_count: u32,
    pub excess_count: u32,
    pub uncovered_count: u32,
    pub has_sensitive_excess: bool,
    #[serde(default)]
    pub sensitive_excess: Vec<String>,
    #[serde(default)]
    pub excess_rules: Vec<ScopedPolicyRule>,
    #[serde(default)]
    pub uncovered_rules: Vec<ScopedPolicyRule>,
    pub last_evaluated_time: Time,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RbacReportStatus {
    #[serde(default)]
    pub observed_rules: Vec<ObservedRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_policy: Option<SuggestedPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compliance: Option<Compliance>,
    #[serde(default)]
    pub events_processed: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_processed_time: Option<Time>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(rename = "lastUpdated", skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<Time>,
}
