use k8s_openapi::api::rbac::v1::{
    ClusterRole, ClusterRoleBinding, PolicyRule, Role, RoleBinding, RoleRef,
    Subject as RbacSubject,
};
use kube::api::ObjectMeta;
use leastpriv_common::annotations;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::pipeline::normalize::Subject;
use crate::util::{Error, MANAGER_NAME};

const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";

/// Roles whose grants amount to full cluster control. The engine never emits
/// a binding referencing one of these.
const CLUSTER_ADMIN_EQUIVALENTS: &[&str] = &["cluster-admin"];

pub fn is_cluster_admin_equivalent(role_name: &str) -> bool {
    CLUSTER_ADMIN_EQUIVALENTS.contains(&role_name)
}

/// Serialize a k8s object into a single standalone YAML document. The typed
/// structs carry no TypeMeta, so apiVersion/kind are spliced in; key order is
/// serde_json's sorted map order, keeping output byte-stable.
pub fn to_yaml_manifest<T: k8s_openapi::Resource + Serialize>(obj: &T) -> Result<String, Error> {
    let mut value = serde_json::to_value(obj)?;
    let map = value
        .as_object_mut()
        .ok_or_else(|| Error::UserInput("manifest did not serialize to an object".to_string()))?;
    map.insert(
        "apiVersion".to_string(),
        serde_json::Value::String(T::API_VERSION.to_string()),
    );
    map.insert(
        "kind".to_string(),
        serde_json::Value::String(T::KIND.to_string()),
    );
    Ok(serde_yaml::to_string(&value)?)
}

fn metadata(name: &str, namespace: Option<&str>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        annotations: Some({
            let mut annotations = BTreeMap::new();
            annotations.insert(annotations::CREATED_BY.to_string(), MANAGER_NAME.to_string());
            annotations
        }),
        ..Default::default()
    }
}

/// Swap the `-role` suffix for `-binding`.
pub fn binding_name(role_name: &str) -> String {
    match role_name.strip_suffix("-role") {
        Some(stem) => format!("{stem}-binding"),
        None => format!("{role_name}-binding"),
    }
}

pub fn rbac_subject(subject: &Subject) -> RbacSubject {
    match subject {
        Subject::ServiceAccount { namespace, name } => RbacSubject {
            kind: "ServiceAccount".to_string(),
            name: name.clone(),
            namespace: Some(namespace.clone()),
            api_group: None,
        },
        Subject::User(name) => RbacSubject {
            kind: "User".to_string(),
            name: name.clone(),
            namespace: None,
            api_group: Some(RBAC_API_GROUP.to_string()),
        },
        Subject::Group(name) => RbacSubject {
            kind: "Group".to_string(),
            name: name.clone(),
            namespace: None,
            api_group: Some(RBAC_API_GROUP.to_string()),
        },
    }
}

pub fn role(name: &str, namespace: &str, rules: Vec<PolicyRule>) -> Role {
    Role {
        metadata: metadata(name, Some(namespace)),
        rules: Some(rules),
    }
}

pub fn cluster_role(name: &str, rules: Vec<PolicyRule>) -> ClusterRole {
    ClusterRole {
        metadata: metadata(name, None),
        rules: Some(rules),
        aggregation_rule: None,
    }
}

/// A RoleBinding for `role_name` in `namespace`; None when the referenced
/// role is cluster-admin equivalent.
pub fn role_binding(role_name: &str, namespace: &str, subject: &Subject) -> Option<RoleBinding> {
    if is_cluster_admin_equivalent(role_name) {
        return None;
    }
    Some(RoleBinding {
        metadata: metadata(&binding_name(role_name), Some(namespace)),
        role_ref: RoleRef {
            api_group: RBAC_API_GROUP.to_string(),
            kind: "Role".to_string(),
            name: role_name.to_string(),
        },
        subjects: Some(vec![rbac_subject(subject)]),
    })
}

pub fn cluster_role_binding(role_name: &str, subject: &Subject) -> Option<ClusterRoleBinding> {
    if is_cluster_admin_equivalent(role_name) {
        return None;
    }
    Some(ClusterRoleBinding {
        metadata: metadata(&binding_name(role_name), None),
        role_ref: RoleRef {
            api_group: RBAC_API_GROUP.to_string(),
            kind: "ClusterRole".to_string(),
            name: role_name.to_string(),
        },
        subjects: Some(vec![rbac_subject(subject)]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_carries_api_version_and_kind() {
        let role = role("suggested-app-role", "prod", Vec::new());
        let yaml = to_yaml_manifest(&role).unwrap();
        let value: serde_json::Value = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(value["apiVersion"], "rbac.authorization.k8s.io/v1");
        assert_eq!(value["kind"], "Role");
        assert_eq!(value["metadata"]["namespace"], "prod");
    }

    #[test]
    fn binding_name_swaps_suffix() {
        assert_eq!(binding_name("suggested-app-role"), "suggested-app-binding");
        assert_eq!(
            binding_name("suggested-app-prod-role"),
            "suggested-app-prod-binding"
        );
    }

    #[test]
    fn cluster_admin_binding_is_refused() {
        let subject = Subject::User("alice".to_string());
        assert!(role_binding("cluster-admin", "prod", &subject).is_none());
        assert!(cluster_role_binding("cluster-admin", &subject).is_none());
        assert!(cluster_role_binding("suggested-alice-cluster-role", &subject).is_some());
    }

    #[test]
    fn service_account_subject_has_no_api_group() {
        let subject = rbac_subject(&Subject::ServiceAccount {
            namespace: "prod".to_string(),
            name: "backend".to_string(),
        });
        assert_eq!(subject.kind, "ServiceAccount");
        assert_eq!(subject.namespace.as_deref(), Some("prod"));
        assert_eq!(subject.api_group, None);

        let user = rbac_subject(&Subject::User("alice".to_string()));
        assert_eq!(user.api_group.as_deref(), Some(RBAC_API_GROUP));
    }
}
