use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use leastpriv_types::{Compliance, ScopedPolicyRule, Severity};
use std::collections::BTreeSet;

use super::resolver::EffectiveRule;
use crate::pipeline::aggregate::Observation;

/// Resource tokens whose unexercised grants are worth flagging on their own.
pub const SENSITIVE_RESOURCES: &[&str] = &[
    "secrets",
    "nodes",
    "roles",
    "clusterroles",
    "rolebindings",
    "clusterrolebindings",
    "mutatingwebhookconfigurations",
    "validatingwebhookconfigurations",
    "certificatesigningrequests",
    "tokenreviews",
    "subjectaccessreviews",
    "selfsubjectaccessreviews",
    "selfsubjectrulesreviews",
    "persistentvolumes",
    "storageclasses",
    "customresourcedefinitions",
    "serviceaccounts/token",
];

/// Classify granted access against exercised access. Returns None when the
/// resolver produced nothing while observations exist: with no denominator
/// there is no meaningful score.
pub fn evaluate(
    observed: &[Observation],
    effective: &[EffectiveRule],
    now: Time,
) -> Option<Compliance> {
    if effective.is_empty() {
        if observed.is_empty() {
            return Some(Compliance {
                score: 100,
                severity: Severity::Green,
                used_count: 0,
                excess_count: 0,
                uncovered_count: 0,
                has_sensitive_excess: false,
                sensitive_excess: Vec::new(),
                excess_rules: Vec::new(),
                uncovered_rules: Vec::new(),
                last_evaluated_time: now,
            });
        }
        return None;
    }

    // Mark every effective rule covering each observation, not just the
    // first; an effective rule is excess only if nothing it grants was used.
    let mut used_marks = vec![false; effective.len()];
    let mut uncovered = Vec::new();
    for observation in observed {
        let mut covered = false;
        for (idx, grant) in effective.iter().enumerate() {
            if covers(grant, observation) {
                used_marks[idx] = true;
                covered = true;
            }
        }
        if !covered {
            uncovered.push(observation_rule(observation));
        }
    }

    let used_count = used_marks.iter().filter(|m| **m).count();
    let excess: Vec<&EffectiveRule> = effective
        .iter()
        .zip(&used_marks)
        .filter(|(_, used)| !**used)
        .map(|(grant, _)| grant)
        .collect();

    let total = used_count + excess.len();
    let score = ((used_count as f64 / total as f64) * 100.0).round() as i32;
    let severity = if score >= 80 {
        Severity::Green
    } else if score >= 50 {
        Severity::Yellow
    } else {
        Severity::Red
    };

    let sensitive: BTreeSet<String> = excess
        .iter()
        .flat_map(|grant| grant.rule.resources.as_deref().unwrap_or(&[]))
        .filter(|token| SENSITIVE_RESOURCES.contains(&token.as_str()))
        .cloned()
        .collect();

    Some(Compliance {
        score,
        severity,
        used_count: used_count as u32,
        excess_count: excess.len() as u32,
        uncovered_count: uncovered.len() as u32,
        has_sensitive_excess: !sensitive.is_empty(),
        sensitive_excess: sensitive.into_iter().collect(),
        excess_rules: excess.iter().map(|grant| effective_rule(grant)).collect(),
        uncovered_rules: uncovered,
        last_evaluated_time: now,
    })
}

/// Whether an effective grant covers an observation.
fn covers(grant: &EffectiveRule, observation: &Observation) -> bool {
    // A resourceNames constraint cannot be checked against audit events,
    // which rarely carry the instance; treat as not covering.
    if grant
        .rule
        .resource_names
        .as_ref()
        .is_some_and(|names| !names.is_empty())
    {
        return false;
    }

    // Cluster-scoped grants cover any namespace; namespaced grants must
    // match exactly.
    if !grant.namespace.is_empty() && grant.namespace != observation.key.namespace {
        return false;
    }

    if !observation.key.non_resource_url.is_empty() {
        // Exact-string match only; no globbing.
        let urls = grant.rule.non_resource_urls.as_deref().unwrap_or(&[]);
        return urls.iter().any(|u| u == &observation.key.non_resource_url)
            && element_covered(&grant.rule.verbs, &observation.key.verb);
    }

    set_covers(grant.rule.api_groups.as_deref(), &observation.key.api_group)
        && set_covers(grant.rule.resources.as_deref(), &observation.key.resource)
        && element_covered(&grant.rule.verbs, &observation.key.verb)
}

fn set_covers(set: Option<&[String]>, element: &str) -> bool {
    set.is_some_and(|set| set.iter().any(|e| e == "*" || e == element))
}

fn element_covered(set: &[String], element: &str) -> bool {
    set.iter().any(|e| e == "*" || e == element)
}

fn effective_rule(grant: &EffectiveRule) -> ScopedPolicyRule {
    ScopedPolicyRule {
        api_groups: grant.rule.api_groups.clone().unwrap_or_default(),
        resources: grant.rule.resources.clone().unwrap_or_default(),
        verbs: grant.rule.verbs.clone(),
        non_resource_urls: grant.rule.non_resource_urls.clone().unwrap_or_default(),
        resource_names: grant.rule.resource_names.clone().unwrap_or_default(),
        namespace: if grant.namespace.is_empty() {
            None
        } else {
            Some(grant.namespace.clone())
        },
    }
}

fn observation_rule(observation: &Observation) -> ScopedPolicyRule {
    let key = &observation.key;
    let single = |s: &String| {
        if s.is_empty() {
            Vec::new()
        } else {
            vec![s.clone()]
        }
    };
    ScopedPolicyRule {
        api_groups: if key.non_resource_url.is_empty() {
            vec![key.api_group.clone()]
        } else {
            Vec::new()
        },
        resources: single(&key.resource),
        verbs: vec![key.verb.clone()],
        non_resource_urls: single(&key.non_resource_url),
        resource_names: Vec::new(),
        namespace: if key.namespace.is_empty() {
            None
        } else {
            Some(key.namespace.clone())
        },
    }
}
