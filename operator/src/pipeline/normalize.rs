use leastpriv_types::{SubjectKind, SubjectRef};

use crate::ingest::AuditEvent;

const SERVICE_ACCOUNT_PREFIX: &str = "system:serviceaccount:";

/// The acting identity behind one or more audit events. Equality is
/// (kind, name, namespace); namespace is empty except for service accounts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Subject {
    ServiceAccount { namespace: String, name: String },
    User(String),
    Group(String),
}

impl Subject {
    pub fn kind(&self) -> SubjectKind {
        match self {
            Subject::ServiceAccount { .. } => SubjectKind::ServiceAccount,
            Subject::User(_) => SubjectKind::User,
            Subject::Group(_) => SubjectKind::Group,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Subject::ServiceAccount { name, .. } => name,
            Subject::User(name) | Subject::Group(name) => name,
        }
    }

    pub fn namespace(&self) -> Option<&str> {
        match self {
            Subject::ServiceAccount { namespace, .. } => Some(namespace),
            _ => None,
        }
    }

    pub fn to_ref(&self) -> SubjectRef {
        SubjectRef {
            kind: self.kind(),
            name: self.name().to_string(),
            namespace: self.namespace().map(str::to_string),
        }
    }

    /// Stable identifier used in generated object names. Service accounts
    /// are qualified with their home namespace so names cannot collide
    /// across namespaces.
    pub fn sanitized(&self) -> String {
        match self {
            Subject::ServiceAccount { namespace, name } => {
                sanitize_name(&format!("{name}-{namespace}"))
            }
            Subject::User(name) | Subject::Group(name) => sanitize_name(name),
        }
    }
}

/// Lowercase, replace `@ : / .` with `-`, cap at 50 chars, trim trailing `-`.
pub fn sanitize_name(raw: &str) -> String {
    let mut out: String = raw
        .to_lowercase()
        .chars()
        .map(|c| match c {
            '@' | ':' | '/' | '.' => '-',
            other => other,
        })
        .collect();
    out.truncate(50);
    while out.ends_with('-') {
        out.pop();
    }
    out
}

/// Identity of one canonical observation. Exactly one of `resource` /
/// `non_resource_url` is non-empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct RuleKey {
    pub api_group: String,
    pub resource: String,
    pub verb: String,
    pub non_resource_url: String,
    pub namespace: String,
}

/// Deprecated api-group aliases and their stable equivalents.
const GROUP_MIGRATIONS: &[(&str, &str)] = &[("extensions", "apps")];

/// Derive the subject from an event's username. Groups on the event are not
/// attributed: a single request carries several and picking one would be
/// arbitrary.
pub fn normalize_subject(event: &AuditEvent) -> Option<Subject> {
    let username = event.user.username.as_str();
    if username.is_empty() {
        return None;
    }
    if let Some(rest) = username.strip_prefix(SERVICE_ACCOUNT_PREFIX)
        && let Some((namespace, name)) = rest.split_once(':')
        && !namespace.is_empty()
        && !name.is_empty()
        && !name.contains(':')
    {
        return Some(Subject::ServiceAccount {
            namespace: namespace.to_string(),
            name: name.to_string(),
        });
    }
    Some(Subject::User(username.to_string()))
}

/// Canonicalize an event into its rule identity. Resource-less events with a
/// request URI become nonResourceURL observations (exact path, query
/// stripped). Subresources concatenate as `parent/sub`; deprecated api
/// groups migrate to their stable names; unknown groups pass through.
pub fn normalize_rule(event: &AuditEvent) -> RuleKey {
    let Some(object_ref) = event
        .object_ref
        .as_ref()
        .filter(|r| !r.resource.is_empty())
    else {
        let path = event
            .request_uri
            .split('?')
            .next()
            .unwrap_or("")
            .to_string();
        return RuleKey {
            verb: event.verb.clone(),
            non_resource_url: path,
            ..Default::default()
        };
    };

    let resource = if object_ref.subresource.is_empty() {
        object_ref.resource.clone()
    } else {
        format!("{}/{}", object_ref.resource, object_ref.subresource)
    };
    RuleKey {
        api_group: migrate_api_group(&object_ref.api_group),
        resource,
        verb: event.verb.clone(),
        non_resource_url: String::new(),
        namespace: object_ref.namespace.clone(),
    }
}

pub fn migrate_api_group(group: &str) -> String {
    for (deprecated, stable) in GROUP_MIGRATIONS {
        if group == *deprecated {
            return (*stable).to_string();
        }
    }
    group.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{EventUser, ObjectRef};

    fn event(username: &str, verb: &str, object_ref: Option<ObjectRef>, uri: &str) -> AuditEvent {
        AuditEvent {
            verb: verb.to_string(),
            user: EventUser {
                username: username.to_string(),
                groups: vec!["system:authenticated".to_string()],
            },
            object_ref,
            request_uri: uri.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn service_account_username_parses() {
        let subject =
            normalize_subject(&event("system:serviceaccount:prod:backend", "get", None, ""))
                .unwrap();
        assert_eq!(
            subject,
            Subject::ServiceAccount {
                namespace: "prod".to_string(),
                name: "backend".to_string(),
            }
        );
    }

    #[test]
    fn malformed_service_account_falls_back_to_user() {
        let subject = normalize_subject(&event("system:serviceaccount:prod", "get", None, ""));
        assert_eq!(
            subject,
            Some(Subject::User("system:serviceaccount:prod".to_string()))
        );
    }

    #[test]
    fn plain_username_is_a_user() {
        let subject = normalize_subject(&event("alice@example.com", "get", None, ""));
        assert_eq!(subject, Some(Subject::User("alice@example.com".to_string())));
        assert_eq!(normalize_subject(&event("", "get", None, "")), None);
    }

    #[test]
    fn subresource_concatenates_into_resource_token() {
        let key = normalize_rule(&event(
            "alice",
            "create",
            Some(ObjectRef {
                resource: "pods".to_string(),
                subresource: "exec".to_string(),
                namespace: "dev".to_string(),
                ..Default::default()
            }),
            "/api/v1/namespaces/dev/pods/api-0/exec",
        ));
        assert_eq!(key.resource, "pods/exec");
        assert_eq!(key.namespace, "dev");
        assert_eq!(key.verb, "create");
        assert!(key.non_resource_url.is_empty());
    }

    #[test]
    fn deprecated_api_group_migrates() {
        let key = normalize_rule(&event(
            "alice",
            "list",
            Some(ObjectRef {
                api_group: "extensions".to_string(),
                resource: "deployments".to_string(),
                namespace: "dev".to_string(),
                ..Default::default()
            }),
            "",
        ));
        assert_eq!(key.api_group, "apps");

        let key = normalize_rule(&event(
            "alice",
            "list",
            Some(ObjectRef {
                api_group: "example.io".to_string(),
                resource: "widgets".to_string(),
                ..Default::default()
            }),
            "",
        ));
        assert_eq!(key.api_group, "example.io");
    }

    #[test]
    fn resourceless_event_becomes_non_resource_url() {
        let key = normalize_rule(&event("alice", "get", None, "/healthz?verbose=1"));
        assert_eq!(key.non_resource_url, "/healthz");
        assert!(key.resource.is_empty());
        assert!(key.namespace.is_empty());
    }

    #[test]
    fn sanitize_replaces_and_truncates() {
        assert_eq!(sanitize_name("Alice@Example.Com"), "alice-example-com");
        assert_eq!(sanitize_name("system:node:abc"), "system-node-abc");
        let long = "a".repeat(60);
        assert_eq!(sanitize_name(&long).len(), 50);
        assert_eq!(sanitize_name("trailing."), "trailing");
    }

    #[test]
    fn sanitized_service_account_is_namespace_qualified() {
        let subject = Subject::ServiceAccount {
            namespace: "prod".to_string(),
            name: "backend".to_string(),
        };
        assert_eq!(subject.sanitized(), "backend-prod");
    }
}
