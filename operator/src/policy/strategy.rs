use k8s_openapi::api::rbac::v1::PolicyRule;
use leastpriv_types::{PolicyStrategy, ScopeMode, VerbMerge, WildcardPolicy};
use std::collections::{BTreeMap, BTreeSet, HashSet};

use super::render;
use crate::pipeline::aggregate::Observation;
use crate::pipeline::normalize::{Subject, sanitize_name};
use crate::util::Error;

/// The verbs a rendered rule may carry; anything else observed is dropped at
/// this stage. NonResourceURL rules keep their own verbs.
pub const STANDARD_VERBS: [&str; 8] = [
    "create",
    "delete",
    "deletecollection",
    "get",
    "list",
    "patch",
    "update",
    "watch",
];

pub struct RenderedPolicy {
    /// Single-document YAML manifests in deterministic order.
    pub manifests: Vec<String>,
    /// PolicyRules emitted across all documents.
    pub rule_count: usize,
}

/// Render the minimal role + binding set for one subject's sorted
/// observations. Deterministic: identical observation identity sets produce
/// byte-identical manifests.
pub fn render(
    subject: &Subject,
    observations: &[Observation],
    policy: &PolicyStrategy,
) -> Result<RenderedPolicy, Error> {
    let mut resource_obs: Vec<&Observation> = Vec::new();
    let mut non_resource_obs: Vec<&Observation> = Vec::new();
    for observation in observations {
        if !observation.key.non_resource_url.is_empty() {
            non_resource_obs.push(observation);
        } else if STANDARD_VERBS.contains(&observation.key.verb.as_str()) {
            resource_obs.push(observation);
        }
        // Resource rules whose verb is outside the standard set are dropped.
    }

    let sanitized = subject.sanitized();
    let mut cluster_rules: Vec<PolicyRule> = Vec::new();
    // namespace → rules, in namespace order.
    let mut namespaced_rules: BTreeMap<String, Vec<PolicyRule>> = BTreeMap::new();

    match subject {
        Subject::ServiceAccount { namespace: home, .. } => {
            // Cluster-scoped resource access attributes to the home binding.
            let mut buckets: BTreeMap<String, Vec<&Observation>> = BTreeMap::new();
            for obs in resource_obs {
                let ns = if obs.key.namespace.is_empty() {
                    home.clone()
                } else {
                    obs.key.namespace.clone()
                };
                buckets.entry(ns).or_default().push(obs);
            }
            for (ns, bucket) in buckets {
                namespaced_rules.insert(ns, build_resource_rules(&bucket, policy));
            }
            cluster_rules = build_non_resource_rules(&non_resource_obs, policy);
        }
        Subject::User(_) | Subject::Group(_) => match policy.scope_mode {
            ScopeMode::ClusterScopeAllowed => {
                // One ClusterRole covering everything the subject did.
                cluster_rules = build_resource_rules(&resource_obs, policy);
                cluster_rules.extend(build_non_resource_rules(&non_resource_obs, policy));
            }
            ScopeMode::NamespaceStrict => {
                let mut buckets: BTreeMap<String, Vec<&Observation>> = BTreeMap::new();
                for obs in resource_obs {
                    buckets
                        .entry(obs.key.namespace.clone())
                        .or_default()
                        .push(obs);
                }
                let cluster_scoped = buckets.remove("").unwrap_or_default();
                if buckets.is_empty() {
                    // Cluster-scoped actions with no namespaced peer.
                    cluster_rules = build_resource_rules(&cluster_scoped, policy);
                } else {
                    // Cluster-scoped rules fold into every namespace's Role.
                    for (ns, mut bucket) in buckets {
                        bucket.extend(cluster_scoped.iter().copied());
                        namespaced_rules.insert(ns, build_resource_rules(&bucket, policy));
                    }
                }
                cluster_rules.extend(build_non_resource_rules(&non_resource_obs, policy));
            }
        },
    }

    // Assemble documents: cluster pair first, then namespaced pairs with the
    // subject's home namespace leading.
    let mut manifests = Vec::new();
    let mut rule_count = 0;

    let cluster_rules = dedup_rules(cluster_rules);
    if !cluster_rules.is_empty() {
        let name = format!("suggested-{sanitized}-cluster-role");
        rule_count += cluster_rules.len();
        let cluster_role = render::cluster_role(&name, cluster_rules);
        manifests.push(render::to_yaml_manifest(&cluster_role)?);
        if let Some(binding) = render::cluster_role_binding(&name, subject) {
            manifests.push(render::to_yaml_manifest(&binding)?);
        }
    }

    let home = subject.namespace();
    let single = namespaced_rules.len() == 1;
    let mut ordered: Vec<(String, Vec<PolicyRule>)> = namespaced_rules.into_iter().collect();
    if let Some(home) = home {
        ordered.sort_by_key(|(ns, _)| (ns.as_str() != home, ns.clone()));
    }
    for (ns, rules) in ordered {
        let rules = dedup_rules(rules);
        if rules.is_empty() {
            continue;
        }
        let name = if home == Some(ns.as_str()) || (home.is_none() && single) {
            format!("suggested-{sanitized}-role")
        } else {
            format!("suggested-{sanitized}-{}-role", sanitize_name(&ns))
        };
        rule_count += rules.len();
        let role = render::role(&name, &ns, rules);
        manifests.push(render::to_yaml_manifest(&role)?);
        if let Some(binding) = render::role_binding(&name, &ns, subject) {
            manifests.push(render::to_yaml_manifest(&binding)?);
        }
    }

    Ok(RenderedPolicy {
        manifests,
        rule_count,
    })
}

/// Build rules for one namespace bucket. Smart merge unions verb sets per
/// (apiGroup, resource); Exact keeps one rule per observed verb.
fn build_resource_rules(bucket: &[&Observation], policy: &PolicyStrategy) -> Vec<PolicyRule> {
    match policy.verb_merge {
        VerbMerge::Smart => {
            let mut merged: BTreeMap<(String, String), BTreeSet<String>> = BTreeMap::new();
            for obs in bucket {
                merged
                    .entry((obs.key.api_group.clone(), obs.key.resource.clone()))
                    .or_default()
                    .insert(obs.key.verb.clone());
            }
            merged
                .into_iter()
                .map(|((group, resource), verbs)| {
                    resource_rule(group, resource, apply_wildcards(verbs, policy))
                })
                .collect()
        }
        VerbMerge::Exact => {
            let mut tuples: BTreeSet<(String, String, String)> = BTreeSet::new();
            for obs in bucket {
                tuples.insert((
                    obs.key.api_group.clone(),
                    obs.key.resource.clone(),
                    obs.key.verb.clone(),
                ));
            }
            tuples
                .into_iter()
                .map(|(group, resource, verb)| resource_rule(group, resource, vec![verb]))
                .collect()
        }
    }
}

/// NonResourceURL rules keep their verbs verbatim and are never wildcarded.
fn build_non_resource_rules(bucket: &[&Observation], policy: &PolicyStrategy) -> Vec<PolicyRule> {
    match policy.verb_merge {
        VerbMerge::Smart => {
            let mut merged: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
            for obs in bucket {
                merged
                    .entry(obs.key.non_resource_url.clone())
                    .or_default()
                    .insert(obs.key.verb.clone());
            }
            merged
                .into_iter()
                .map(|(url, verbs)| non_resource_rule(url, verbs.into_iter().collect()))
                .collect()
        }
        VerbMerge::Exact => {
            let mut tuples: BTreeSet<(String, String)> = BTreeSet::new();
            for obs in bucket {
                tuples.insert((obs.key.non_resource_url.clone(), obs.key.verb.clone()));
            }
            tuples
                .into_iter()
                .map(|(url, verb)| non_resource_rule(url, vec![verb]))
                .collect()
        }
    }
}

/// Under the Safe policy a verb set collapses to `*` iff it carries every
/// standard verb; Forbidden never emits a wildcard.
fn apply_wildcards(verbs: BTreeSet<String>, policy: &PolicyStrategy) -> Vec<String> {
    if policy.wildcards == WildcardPolicy::Safe
        && STANDARD_VERBS.iter().all(|v| verbs.contains(*v))
    {
        return vec!["*".to_string()];
    }
    verbs.into_iter().collect()
}

fn resource_rule(group: String, resource: String, verbs: Vec<String>) -> PolicyRule {
    PolicyRule {
        api_groups: Some(vec![group]),
        resources: Some(vec![resource]),
        verbs,
        non_resource_urls: None,
        resource_names: None,
    }
}

fn non_resource_rule(url: String, verbs: Vec<String>) -> PolicyRule {
    PolicyRule {
        api_groups: None,
        resources: None,
        verbs,
        non_resource_urls: Some(vec![url]),
        resource_names: None,
    }
}

/// Drop rules identical on (apiGroups, resources, verbs, nonResourceURLs);
/// the namespace is already gone at this point. First occurrence wins.
fn dedup_rules(rules: Vec<PolicyRule>) -> Vec<PolicyRule> {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(rules.len());
    for rule in rules {
        let key = format!(
            "{:?}|{:?}|{:?}|{:?}",
            rule.api_groups, rule.resources, rule.verbs, rule.non_resource_urls
        );
        if seen.insert(key) {
            out.push(rule);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::normalize::RuleKey;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use k8s_openapi::jiff::Timestamp;

    fn obs(namespace: &str, group: &str, resource: &str, verb: &str) -> Observation {
        Observation {
            key: RuleKey {
                api_group: group.to_string(),
                resource: resource.to_string(),
                verb: verb.to_string(),
                non_resource_url: String::new(),
                namespace: namespace.to_string(),
            },
            first_seen: Time(Timestamp::from_second(0).unwrap()),
            last_seen: Time(Timestamp::from_second(0).unwrap()),
            count: 1,
        }
    }

    fn url_obs(url: &str, verb: &str) -> Observation {
        Observation {
            key: RuleKey {
                verb: verb.to_string(),
                non_resource_url: url.to_string(),
                ..Default::default()
            },
            first_seen: Time(Timestamp::from_second(0).unwrap()),
            last_seen: Time(Timestamp::from_second(0).unwrap()),
            count: 1,
        }
    }

    fn sa(namespace: &str, name: &str) -> Subject {
        Subject::ServiceAccount {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    fn docs(policy: &RenderedPolicy) -> Vec<serde_json::Value> {
        policy
            .manifests
            .iter()
            .map(|m| serde_yaml::from_str(m).unwrap())
            .collect()
    }

    #[test]
    fn cross_namespace_service_account_gets_two_role_pairs() {
        let subject = sa("prod", "backend");
        let observations = vec![
            obs("prod", "", "pods", "get"),
            obs("shared", "", "configmaps", "get"),
        ];
        let rendered = render(&subject, &observations, &PolicyStrategy::default()).unwrap();
        let docs = docs(&rendered);
        assert_eq!(docs.len(), 4);

        let kinds: Vec<&str> = docs.iter().map(|d| d["kind"].as_str().unwrap()).collect();
        assert_eq!(kinds, vec!["Role", "RoleBinding", "Role", "RoleBinding"]);

        // Home namespace leads and uses the short name.
        assert_eq!(docs[0]["metadata"]["namespace"], "prod");
        assert_eq!(docs[0]["metadata"]["name"], "suggested-backend-prod-role");
        assert_eq!(docs[2]["metadata"]["namespace"], "shared");
        assert_eq!(
            docs[2]["metadata"]["name"],
            "suggested-backend-prod-shared-role"
        );

        // Both bindings point back at the service account in its home ns.
        for binding in [&docs[1], &docs[3]] {
            let subjects = binding["subjects"].as_array().unwrap();
            assert_eq!(subjects[0]["kind"], "ServiceAccount");
            assert_eq!(subjects[0]["name"], "backend");
            assert_eq!(subjects[0]["namespace"], "prod");
        }
    }

    #[test]
    fn smart_merge_with_safe_wildcard_collapses_all_verbs() {
        let subject = sa("prod", "backend");
        let observations: Vec<Observation> = STANDARD_VERBS
            .iter()
            .map(|verb| obs("prod", "", "pods", verb))
            .collect();

        let policy = PolicyStrategy {
            wildcards: WildcardPolicy::Safe,
            ..Default::default()
        };
        let rendered = render(&subject, &observations, &policy).unwrap();
        let docs = docs(&rendered);
        let rules = docs[0]["rules"].as_array().unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0]["resources"][0], "pods");
        assert_eq!(rules[0]["verbs"].as_array().unwrap().len(), 1);
        assert_eq!(rules[0]["verbs"][0], "*");
    }

    #[test]
    fn forbidden_wildcards_list_all_verbs_explicitly() {
        let subject = sa("prod", "backend");
        let observations: Vec<Observation> = STANDARD_VERBS
            .iter()
            .map(|verb| obs("prod", "", "pods", verb))
            .collect();

        let rendered = render(&subject, &observations, &PolicyStrategy::default()).unwrap();
        let docs = docs(&rendered);
        let rules = docs[0]["rules"].as_array().unwrap();
        assert_eq!(rules.len(), 1);
        let verbs: Vec<&str> = rules[0]["verbs"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap())
            .collect();
        assert_eq!(verbs, STANDARD_VERBS.to_vec());
        assert!(!verbs.contains(&"*"));
    }

    #[test]
    fn exact_merge_keeps_rules_separate() {
        let subject = sa("prod", "backend");
        let observations = vec![
            obs("prod", "", "pods", "get"),
            obs("prod", "", "pods", "list"),
        ];
        let policy = PolicyStrategy {
            verb_merge: VerbMerge::Exact,
            ..Default::default()
        };
        let rendered = render(&subject, &observations, &policy).unwrap();
        let docs = docs(&rendered);
        let rules = docs[0]["rules"].as_array().unwrap();
        assert_eq!(rules.len(), 2);
    }

    #[test]
    fn non_standard_verbs_are_dropped() {
        let subject = sa("prod", "backend");
        let observations = vec![
            obs("prod", "", "pods", "get"),
            obs("prod", "", "pods", "impersonate"),
            obs("prod", "", "secrets", "approve"),
        ];
        let rendered = render(&subject, &observations, &PolicyStrategy::default()).unwrap();
        let docs = docs(&rendered);
        // The secrets rule vanished entirely; pods kept only "get".
        assert_eq!(rendered.rule_count, 1);
        let rules = docs[0]["rules"].as_array().unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0]["resources"][0], "pods");
        assert_eq!(rules[0]["verbs"][0], "get");
    }

    #[test]
    fn non_resource_urls_render_as_cluster_pair() {
        let subject = sa("prod", "backend");
        let observations = vec![url_obs("/healthz", "get"), obs("prod", "", "pods", "get")];
        let rendered = render(&subject, &observations, &PolicyStrategy::default()).unwrap();
        let docs = docs(&rendered);
        let kinds: Vec<&str> = docs.iter().map(|d| d["kind"].as_str().unwrap()).collect();
        assert_eq!(
            kinds,
            vec!["ClusterRole", "ClusterRoleBinding", "Role", "RoleBinding"]
        );
        assert_eq!(
            docs[0]["metadata"]["name"],
            "suggested-backend-prod-cluster-role"
        );
        let rules = docs[0]["rules"].as_array().unwrap();
        assert_eq!(rules[0]["nonResourceURLs"][0], "/healthz");
    }

    #[test]
    fn safe_wildcard_never_applies_to_non_resource_rules() {
        let subject = sa("prod", "backend");
        let observations: Vec<Observation> = STANDARD_VERBS
            .iter()
            .map(|verb| url_obs("/metrics", verb))
            .collect();
        let policy = PolicyStrategy {
            wildcards: WildcardPolicy::Safe,
            ..Default::default()
        };
        let rendered = render(&subject, &observations, &policy).unwrap();
        let docs = docs(&rendered);
        let rules = docs[0]["rules"].as_array().unwrap();
        assert_eq!(rules[0]["verbs"].as_array().unwrap().len(), 8);
    }

    #[test]
    fn user_cluster_scope_allowed_emits_single_cluster_pair() {
        let subject = Subject::User("alice@example.com".to_string());
        let observations = vec![
            obs("prod", "", "pods", "get"),
            obs("dev", "apps", "deployments", "list"),
            url_obs("/version", "get"),
        ];
        let policy = PolicyStrategy {
            scope_mode: ScopeMode::ClusterScopeAllowed,
            ..Default::default()
        };
        let rendered = render(&subject, &observations, &policy).unwrap();
        let docs = docs(&rendered);
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0]["kind"], "ClusterRole");
        assert_eq!(docs[1]["kind"], "ClusterRoleBinding");
        assert_eq!(docs[0]["rules"].as_array().unwrap().len(), 3);
        let subjects = docs[1]["subjects"].as_array().unwrap();
        assert_eq!(subjects[0]["kind"], "User");
        assert_eq!(subjects[0]["name"], "alice@example.com");
    }

    #[test]
    fn namespace_strict_merges_cluster_rules_into_each_namespace() {
        let subject = Subject::User("alice".to_string());
        let observations = vec![
            obs("prod", "", "pods", "get"),
            obs("dev", "", "configmaps", "get"),
            obs("", "", "namespaces", "list"),
        ];
        let rendered = render(&subject, &observations, &PolicyStrategy::default()).unwrap();
        let docs = docs(&rendered);
        let kinds: Vec<&str> = docs.iter().map(|d| d["kind"].as_str().unwrap()).collect();
        assert_eq!(kinds, vec!["Role", "RoleBinding", "Role", "RoleBinding"]);
        for role in [&docs[0], &docs[2]] {
            let resources: Vec<&str> = role["rules"]
                .as_array()
                .unwrap()
                .iter()
                .map(|r| r["resources"][0].as_str().unwrap())
                .collect();
            assert!(resources.contains(&"namespaces"), "cluster rule folded in");
        }
    }

    #[test]
    fn namespace_strict_cluster_only_emits_cluster_pair() {
        let subject = Subject::User("alice".to_string());
        let observations = vec![obs("", "", "nodes", "list")];
        let rendered = render(&subject, &observations, &PolicyStrategy::default()).unwrap();
        let docs = docs(&rendered);
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0]["kind"], "ClusterRole");
    }

    #[test]
    fn namespace_strict_single_namespace_uses_short_name() {
        let subject = Subject::User("alice".to_string());
        let observations = vec![obs("dev", "", "pods", "get")];
        let rendered = render(&subject, &observations, &PolicyStrategy::default()).unwrap();
        let docs = docs(&rendered);
        assert_eq!(docs[0]["metadata"]["name"], "suggested-alice-role");
        assert_eq!(docs[0]["metadata"]["namespace"], "dev");
    }

    #[test]
    fn rendering_is_deterministic() {
        let subject = sa("prod", "backend");
        let mut forward = vec![
            obs("prod", "", "pods", "get"),
            obs("shared", "", "configmaps", "list"),
            url_obs("/healthz", "get"),
        ];
        let a = render(&subject, &forward, &PolicyStrategy::default()).unwrap();
        forward.reverse();
        let b = render(&subject, &forward, &PolicyStrategy::default()).unwrap();
        assert_eq!(a.manifests, b.manifests);
    }

    #[test]
    fn duplicate_rules_dedup_first_wins() {
        let rules = vec![
            resource_rule("".into(), "pods".into(), vec!["get".into()]),
            resource_rule("".into(), "pods".into(), vec!["get".into()]),
            resource_rule("".into(), "pods".into(), vec!["list".into()]),
        ];
        assert_eq!(dedup_rules(rules).len(), 2);
    }
}
