use async_trait::async_trait;
use k8s_openapi::api::rbac::v1::{
    ClusterRole, ClusterRoleBinding, PolicyRule, Role, RoleBinding, Subject as RbacSubject,
};
use kube::{Api, Client, api::ListParams};

use crate::pipeline::normalize::Subject;
use crate::util::Error;

/// A rule currently granting access, scoped to the namespace of the binding
/// that produced it; empty namespace means a cluster-scoped grant.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveRule {
    pub rule: PolicyRule,
    pub namespace: String,
}

/// View over live cluster RBAC state. The production impl wraps `kube::Api`;
/// tests provide an in-memory one.
#[async_trait]
pub trait RbacLister: Send + Sync {
    async fn cluster_role_bindings(&self) -> Result<Vec<ClusterRoleBinding>, Error>;
    /// RoleBindings across all namespaces.
    async fn role_bindings(&self) -> Result<Vec<RoleBinding>, Error>;
    async fn cluster_role(&self, name: &str) -> Result<Option<ClusterRole>, Error>;
    async fn role(&self, namespace: &str, name: &str) -> Result<Option<Role>, Error>;
}

pub struct KubeRbacLister {
    client: Client,
}

impl KubeRbacLister {
    pub fn new(client: Client) -> Self {
        KubeRbacLister { client }
    }
}

#[async_trait]
impl RbacLister for KubeRbacLister {
    async fn cluster_role_bindings(&self) -> Result<Vec<ClusterRoleBinding>, Error> {
        let api: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn role_bindings(&self) -> Result<Vec<RoleBinding>, Error> {
        let api: Api<RoleBinding> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn cluster_role(&self, name: &str) -> Result<Option<ClusterRole>, Error> {
        let api: Api<ClusterRole> = Api::all(self.client.clone());
        match api.get(name).await {
            Ok(role) => Ok(Some(role)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn role(&self, namespace: &str, name: &str) -> Result<Option<Role>, Error> {
        let api: Api<Role> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(role) => Ok(Some(role)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Flatten a subject's effective permissions. ClusterRoleBindings contribute
/// cluster-scoped rules; RoleBindings contribute rules scoped to the
/// binding's namespace, resolving either a Role or a ClusterRole reference.
/// Dangling references are skipped; aggregated ClusterRole label selectors
/// are not expanded.
pub async fn resolve_effective(
    lister: &dyn RbacLister,
    subject: &Subject,
) -> Result<Vec<EffectiveRule>, Error> {
    let mut effective = Vec::new();

    for binding in lister.cluster_role_bindings().await? {
        if !subjects_match(binding.subjects.as_deref(), subject) {
            continue;
        }
        if let Some(role) = lister.cluster_role(&binding.role_ref.name).await? {
            for rule in role.rules.unwrap_or_default() {
                effective.push(EffectiveRule {
                    rule,
                    namespace: String::new(),
                });
            }
        }
    }

    for binding in lister.role_bindings().await? {
        if !subjects_match(binding.subjects.as_deref(), subject) {
            continue;
        }
        let namespace = binding.metadata.namespace.clone().unwrap_or_default();
        let rules = match binding.role_ref.kind.as_str() {
            "Role" => lister
                .role(&namespace, &binding.role_ref.name)
                .await?
                .and_then(|r| r.rules),
            "ClusterRole" => lister
                .cluster_role(&binding.role_ref.name)
                .await?
                .and_then(|r| r.rules),
            _ => None,
        };
        for rule in rules.unwrap_or_default() {
            effective.push(EffectiveRule {
                rule,
                namespace: namespace.clone(),
            });
        }
    }

    Ok(effective)
}

/// ServiceAccounts match on (name, namespace); Users and Groups on name.
fn subjects_match(subjects: Option<&[RbacSubject]>, target: &Subject) -> bool {
    let Some(subjects) = subjects else {
        return false;
    };
    subjects.iter().any(|s| match target {
        Subject::ServiceAccount { namespace, name } => {
            s.kind == "ServiceAccount"
                && s.name == *name
                && s.namespace.as_deref() == Some(namespace.as_str())
        }
        Subject::User(name) => s.kind == "User" && s.name == *name,
        Subject::Group(name) => s.kind == "Group" && s.name == *name,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::rbac::v1::RoleRef;
    use kube::api::ObjectMeta;
    use std::collections::HashMap;

    struct StubLister {
        cluster_role_bindings: Vec<ClusterRoleBinding>,
        role_bindings: Vec<RoleBinding>,
        cluster_roles: HashMap<String, ClusterRole>,
        roles: HashMap<(String, String), Role>,
    }

    #[async_trait]
    impl RbacLister for StubLister {
        async fn cluster_role_bindings(&self) -> Result<Vec<ClusterRoleBinding>, Error> {
            Ok(self.cluster_role_bindings.clone())
        }

        async fn role_bindings(&self) -> Result<Vec<RoleBinding>, Error> {
            Ok(self.role_bindings.clone())
        }

        async fn cluster_role(&self, name: &str) -> Result<Option<ClusterRole>, Error> {
            Ok(self.cluster_roles.get(name).cloned())
        }

        async fn role(&self, namespace: &str, name: &str) -> Result<Option<Role>, Error> {
            Ok(self
                .roles
                .get(&(namespace.to_string(), name.to_string()))
                .cloned())
        }
    }

    fn rule(resource: &str, verbs: &[&str]) -> PolicyRule {
        PolicyRule {
            api_groups: Some(vec![String::new()]),
            resources: Some(vec![resource.to_string()]),
            verbs: verbs.iter().map(|v| v.to_string()).collect(),
            non_resource_urls: None,
            resource_names: None,
        }
    }

    fn sa_subject(namespace: &str, name: &str) -> RbacSubject {
        RbacSubject {
            kind: "ServiceAccount".to_string(),
            name: name.to_string(),
            namespace: Some(namespace.to_string()),
            api_group: None,
        }
    }

    fn role_ref(kind: &str, name: &str) -> RoleRef {
        RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
        }
    }

    fn lister() -> StubLister {
        let mut cluster_roles = HashMap::new();
        cluster_roles.insert(
            "view-nodes".to_string(),
            ClusterRole {
                metadata: ObjectMeta::default(),
                rules: Some(vec![rule("nodes", &["get", "list"])]),
                aggregation_rule: None,
            },
        );
        let mut roles = HashMap::new();
        roles.insert(
            ("prod".to_string(), "pod-reader".to_string()),
            Role {
                metadata: ObjectMeta::default(),
                rules: Some(vec![rule("pods", &["get"])]),
            },
        );
        StubLister {
            cluster_role_bindings: vec![ClusterRoleBinding {
                metadata: ObjectMeta::default(),
                role_ref: role_ref("ClusterRole", "view-nodes"),
                subjects: Some(vec![sa_subject("prod", "backend")]),
            }],
            role_bindings: vec![
                RoleBinding {
                    metadata: ObjectMeta {
                        namespace: Some("prod".to_string()),
                        ..Default::default()
                    },
                    role_ref: role_ref("Role", "pod-reader"),
                    subjects: Some(vec![sa_subject("prod", "backend")]),
                },
                // ClusterRole referenced from a namespaced binding: its rules
                // scope down to the binding's namespace.
                RoleBinding {
                    metadata: ObjectMeta {
                        namespace: Some("shared".to_string()),
                        ..Default::default()
                    },
                    role_ref: role_ref("ClusterRole", "view-nodes"),
                    subjects: Some(vec![sa_subject("prod", "backend")]),
                },
                // Dangling reference: skipped silently.
                RoleBinding {
                    metadata: ObjectMeta {
                        namespace: Some("prod".to_string()),
                        ..Default::default()
                    },
                    role_ref: role_ref("Role", "deleted-role"),
                    subjects: Some(vec![sa_subject("prod", "backend")]),
                },
            ],
            cluster_roles,
            roles,
        }
    }

    fn backend() -> Subject {
        Subject::ServiceAccount {
            namespace: "prod".to_string(),
            name: "backend".to_string(),
        }
    }

    #[tokio::test]
    async fn resolves_cluster_and_namespaced_grants() {
        let effective = resolve_effective(&lister(), &backend()).await.unwrap();
        assert_eq!(effective.len(), 3);

        // ClusterRoleBinding → cluster scope.
        assert_eq!(effective[0].namespace, "");
        assert_eq!(
            effective[0].rule.resources.as_deref().unwrap(),
            ["nodes".to_string()]
        );
        // Role in prod.
        assert_eq!(effective[1].namespace, "prod");
        // ClusterRole via RoleBinding scopes to the binding namespace.
        assert_eq!(effective[2].namespace, "shared");
        assert_eq!(
            effective[2].rule.resources.as_deref().unwrap(),
            ["nodes".to_string()]
        );
    }

    #[tokio::test]
    async fn other_subjects_resolve_to_nothing() {
        let other = Subject::ServiceAccount {
            namespace: "dev".to_string(),
            name: "backend".to_string(),
        };
        let effective = resolve_effective(&lister(), &other).await.unwrap();
        assert!(effective.is_empty());
    }

    #[test]
    fn user_and_group_match_by_name_only() {
        let user_subject = RbacSubject {
            kind: "User".to_string(),
            name: "alice".to_string(),
            namespace: None,
            api_group: Some("rbac.authorization.k8s.io".to_string()),
        };
        assert!(subjects_match(
            Some(&[user_subject.clone()]),
            &Subject::User("alice".to_string())
        ));
        assert!(!subjects_match(
            Some(&[user_subject]),
            &Subject::Group("alice".to_string())
        ));
        assert!(!subjects_match(None, &Subject::User("alice".to_string())));
    }
}
