use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use leastpriv_types::{ObservedRule, ReportLimits};
use owo_colors::OwoColorize;
use std::collections::HashMap;

use super::normalize::{RuleKey, Subject};
use crate::util::colors::{FG1, FG2};

/// A canonical rule with its observation history.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub key: RuleKey,
    pub first_seen: Time,
    pub last_seen: Time,
    pub count: u64,
}

impl Observation {
    /// PolicyRule-shaped form for the report status.
    pub fn to_observed_rule(&self) -> ObservedRule {
        let single = |s: &String| {
            if s.is_empty() {
                Vec::new()
            } else {
                vec![s.clone()]
            }
        };
        ObservedRule {
            api_groups: if self.key.non_resource_url.is_empty() {
                vec![self.key.api_group.clone()]
            } else {
                Vec::new()
            },
            resources: single(&self.key.resource),
            verbs: vec![self.key.verb.clone()],
            non_resource_urls: single(&self.key.non_resource_url),
            namespace: if self.key.namespace.is_empty() {
                None
            } else {
                Some(self.key.namespace.clone())
            },
            first_seen: self.first_seen.clone(),
            last_seen: self.last_seen.clone(),
            count: self.count,
        }
    }
}

#[derive(Default)]
struct SubjectState {
    rules: HashMap<RuleKey, RuleHistory>,
    events_processed: u64,
}

struct RuleHistory {
    first_seen: Time,
    last_seen: Time,
    count: u64,
}

/// Per-pipeline observation state. Owned by the pipeline's event loop, so no
/// locking; rebuilt from scratch on restart and idempotent on the identity
/// set under at-least-once replay.
#[derive(Default)]
pub struct Aggregator {
    subjects: HashMap<Subject, SubjectState>,
}

impl Aggregator {
    pub fn new() -> Self {
        Default::default()
    }

    /// Merge one observation: a known identity bumps count and lastSeen, a
    /// new identity starts at count 1 with firstSeen = lastSeen = now.
    pub fn add(&mut self, subject: Subject, key: RuleKey, now: Time) {
        let state = self.subjects.entry(subject).or_default();
        state.events_processed += 1;
        match state.rules.get_mut(&key) {
            Some(history) => {
                history.count += 1;
                history.last_seen = now;
            }
            None => {
                state.rules.insert(
                    key,
                    RuleHistory {
                        first_seen: now.clone(),
                        last_seen: now,
                        count: 1,
                    },
                );
            }
        }
    }

    /// Subjects with accumulated rules, in stable order.
    pub fn subjects(&self) -> Vec<Subject> {
        let mut subjects: Vec<Subject> = self
            .subjects
            .iter()
            .filter(|(_, state)| !state.rules.is_empty())
            .map(|(subject, _)| subject.clone())
            .collect();
        subjects.sort();
        subjects
    }

    pub fn events_processed(&self, subject: &Subject) -> u64 {
        self.subjects
            .get(subject)
            .map(|s| s.events_processed)
            .unwrap_or(0)
    }

    /// Retention then size compaction for one subject. Every dropped rule is
    /// logged with its identity first. Returns the number removed.
    pub fn compact(&mut self, subject: &Subject, limits: &ReportLimits, now: &Time) -> usize {
        let Some(state) = self.subjects.get_mut(subject) else {
            return 0;
        };
        let max_age_secs = limits.retention_days.max(1).saturating_mul(86_400) as i64;
        let max_rules = limits.max_rules_per_report.max(1);
        let mut dropped = 0;

        let expired: Vec<RuleKey> = state
            .rules
            .iter()
            .filter(|(_, history)| {
                now.0.duration_since(history.last_seen.0).as_secs() > max_age_secs
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            log_compacted(subject, &key, "retention");
            state.rules.remove(&key);
            dropped += 1;
        }

        if state.rules.len() > max_rules {
            let mut by_age: Vec<(RuleKey, Time)> = state
                .rules
                .iter()
                .map(|(key, history)| (key.clone(), history.last_seen.clone()))
                .collect();
            // Oldest lastSeen first; tie-break on identity for stable drops.
            by_age.sort_by(|a, b| {
                a.1.cmp(&b.1).then_with(|| sort_key(&a.0).cmp(&sort_key(&b.0)))
            });
            let excess = state.rules.len() - max_rules;
            for (key, _) in by_age.into_iter().take(excess) {
                log_compacted(subject, &key, "size");
                state.rules.remove(&key);
                dropped += 1;
            }
        }
        dropped
    }

    /// Observations ordered by (namespace, apiGroup, resource, verb,
    /// nonResourceURL) so identical histories always render identically.
    pub fn sorted_rules(&self, subject: &Subject) -> Vec<Observation> {
        let Some(state) = self.subjects.get(subject) else {
            return Vec::new();
        };
        let mut observations: Vec<Observation> = state
            .rules
            .iter()
            .map(|(key, history)| Observation {
                key: key.clone(),
                first_seen: history.first_seen.clone(),
                last_seen: history.last_seen.clone(),
                count: history.count,
            })
            .collect();
        observations.sort_by(|a, b| sort_key(&a.key).cmp(&sort_key(&b.key)));
        observations
    }
}

fn sort_key(key: &RuleKey) -> (&str, &str, &str, &str, &str) {
    (
        &key.namespace,
        &key.api_group,
        &key.resource,
        &key.verb,
        &key.non_resource_url,
    )
}

fn log_compacted(subject: &Subject, key: &RuleKey, reason: &str) {
    println!(
        "🧹 {}{}{} {}{}{}{}{}{}{}{}",
        format!("{:?}", subject).color(FG2),
        " compacted rule (".color(FG1),
        reason.color(FG2),
        ") ".color(FG1),
        key.namespace.color(FG2),
        "/".color(FG1),
        key.api_group.color(FG2),
        "/".color(FG1),
        key.resource.color(FG2),
        " verb=".color(FG1),
        if key.non_resource_url.is_empty() {
            key.verb.clone()
        } else {
            format!("{} url={}", key.verb, key.non_resource_url)
        }
        .color(FG2),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::jiff::Timestamp;

    fn at(epoch: i64) -> Time {
        Time(Timestamp::from_second(epoch).unwrap())
    }

    fn subject() -> Subject {
        Subject::ServiceAccount {
            namespace: "prod".to_string(),
            name: "backend".to_string(),
        }
    }

    fn key(namespace: &str, resource: &str, verb: &str) -> RuleKey {
        RuleKey {
            api_group: String::new(),
            resource: resource.to_string(),
            verb: verb.to_string(),
            non_resource_url: String::new(),
            namespace: namespace.to_string(),
        }
    }

    #[test]
    fn same_identity_merges_new_identity_inserts() {
        let mut agg = Aggregator::new();
        agg.add(subject(), key("prod", "pods", "get"), at(100));
        agg.add(subject(), key("prod", "pods", "get"), at(200));
        agg.add(subject(), key("prod", "pods", "list"), at(300));

        let rules = agg.sorted_rules(&subject());
        assert_eq!(rules.len(), 2);
        let get_rule = &rules[0];
        assert_eq!(get_rule.key.verb, "get");
        assert_eq!(get_rule.count, 2);
        assert_eq!(get_rule.first_seen, at(100));
        assert_eq!(get_rule.last_seen, at(200));
        assert_eq!(rules[1].count, 1);
        assert_eq!(agg.events_processed(&subject()), 3);
    }

    #[test]
    fn replay_is_idempotent_on_identity_set() {
        let stream = [
            key("prod", "pods", "get"),
            key("prod", "pods", "list"),
            key("shared", "configmaps", "get"),
        ];
        let mut agg = Aggregator::new();
        for k in stream.iter().chain(stream.iter()) {
            agg.add(subject(), k.clone(), at(100));
        }
        let rules = agg.sorted_rules(&subject());
        assert_eq!(rules.len(), 3);
        assert!(rules.iter().all(|r| r.count == 2));
    }

    #[test]
    fn retention_drops_stale_rules() {
        let limits = ReportLimits {
            max_rules_per_report: 200,
            retention_days: 30,
        };
        let mut agg = Aggregator::new();
        let month_secs = 86_400 * 31;
        agg.add(subject(), key("prod", "pods", "get"), at(0));
        agg.add(subject(), key("prod", "pods", "list"), at(month_secs));

        let dropped = agg.compact(&subject(), &limits, &at(month_secs + 60));
        assert_eq!(dropped, 1);
        let rules = agg.sorted_rules(&subject());
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].key.verb, "list");
    }

    #[test]
    fn size_cap_drops_oldest_last_seen_first() {
        let limits = ReportLimits {
            max_rules_per_report: 2,
            retention_days: 365,
        };
        let mut agg = Aggregator::new();
        agg.add(subject(), key("prod", "pods", "get"), at(100));
        agg.add(subject(), key("prod", "pods", "list"), at(200));
        agg.add(subject(), key("prod", "pods", "watch"), at(300));

        let dropped = agg.compact(&subject(), &limits, &at(400));
        assert_eq!(dropped, 1);
        let rules = agg.sorted_rules(&subject());
        let verbs: Vec<&str> = rules.iter().map(|r| r.key.verb.as_str()).collect();
        assert_eq!(verbs, vec!["list", "watch"]);
    }

    #[test]
    fn sorted_rules_are_deterministic() {
        let mut forward = Aggregator::new();
        let mut reverse = Aggregator::new();
        let keys = [
            key("b-ns", "pods", "get"),
            key("a-ns", "secrets", "list"),
            key("a-ns", "pods", "get"),
            key("", "nodes", "watch"),
        ];
        for k in &keys {
            forward.add(subject(), k.clone(), at(10));
        }
        for k in keys.iter().rev() {
            reverse.add(subject(), k.clone(), at(10));
        }
        let order =
            |agg: &Aggregator| -> Vec<RuleKey> {
                agg.sorted_rules(&subject()).into_iter().map(|o| o.key).collect()
            };
        assert_eq!(order(&forward), order(&reverse));
        assert_eq!(order(&forward)[0], key("", "nodes", "watch"));
    }

    #[test]
    fn observed_rule_shape_for_non_resource_url() {
        let observation = Observation {
            key: RuleKey {
                verb: "get".to_string(),
                non_resource_url: "/healthz".to_string(),
                ..Default::default()
            },
            first_seen: at(1),
            last_seen: at(2),
            count: 3,
        };
        let rule = observation.to_observed_rule();
        assert!(rule.api_groups.is_empty());
        assert!(rule.resources.is_empty());
        assert_eq!(rule.non_resource_urls, vec!["/healthz"]);
        assert_eq!(rule.verbs, vec!["get"]);
        assert_eq!(rule.namespace, None);
        assert_eq!(rule.count, 3);
    }
}
