use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::jiff::Timestamp;
use kube::{
    Api, Client,
    api::{ObjectMeta, PostParams, Resource},
};
use leastpriv_common::annotations;
use leastpriv_types::{AuditSource, Compliance, ObservedRule, RbacReport, RbacReportSpec, SuggestedPolicy};
use owo_colors::OwoColorize;
use std::collections::BTreeMap;

use crate::pipeline::aggregate::Observation;
use crate::pipeline::normalize::Subject;
use crate::util::{self, Error, metrics, patch::patch_status_with_retry};

/// Well-known report name for a subject.
pub fn report_name(subject: &Subject) -> String {
    format!("report-{}", subject.sanitized())
}

/// Upsert the per-subject report: create it with an owner reference on first
/// sight, then overwrite its status. Write conflicts retry with backoff.
#[allow(clippy::too_many_arguments)]
pub async fn upsert_report(
    client: &Client,
    source: &AuditSource,
    subject: &Subject,
    observations: &[Observation],
    manifests: Vec<String>,
    compliance: Option<Compliance>,
    events_processed: u64,
) -> Result<(), Error> {
    let namespace = source
        .metadata
        .namespace
        .as_deref()
        .ok_or_else(|| Error::UserInput("AuditSource is missing metadata.namespace".to_string()))?;
    let source_name = source
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| Error::UserInput("AuditSource is missing metadata.name".to_string()))?;
    let name = report_name(subject);
    let api: Api<RbacReport> = Api::namespaced(client.clone(), namespace);

    let existing = match api.get(&name).await {
        Ok(report) => report,
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            let report = new_report(&name, namespace, source, subject)?;
            println!(
                "📋 {}{}{}{}",
                namespace.green(),
                "/".green().dimmed(),
                name.green(),
                " created".green().dimmed(),
            );
            match api.create(&PostParams::default(), &report).await {
                Ok(created) => created,
                // Lost a create race; fetch what won.
                Err(kube::Error::Api(ae)) if ae.code == 409 => api.get(&name).await?,
                Err(e) => return Err(e.into()),
            }
        }
        Err(e) => return Err(e.into()),
    };

    let observed_rules: Vec<ObservedRule> =
        observations.iter().map(|o| o.to_observed_rule()).collect();
    let now = Time(Timestamp::now());
    let resolver_degraded = compliance.is_none() && !observations.is_empty();

    patch_status_with_retry(client.clone(), &existing, move |status| {
        status.observed_rules = observed_rules.clone();
        status.suggested_policy = Some(SuggestedPolicy {
            manifests: manifests.clone(),
        });
        status.compliance = compliance.clone();
        status.events_processed = events_processed;
        status.last_processed_time = Some(now.clone());
        util::set_condition(
            &mut status.conditions,
            "Ready",
            true,
            "PolicyGenerated",
            "observed rules and suggested policy are current",
            None,
        );
        if resolver_degraded {
            util::set_condition(
                &mut status.conditions,
                "ComplianceEvaluated",
                false,
                "ResolverUnavailable",
                "effective permissions could not be resolved",
                None,
            );
        } else {
            util::set_condition(
                &mut status.conditions,
                "ComplianceEvaluated",
                true,
                "Evaluated",
                "compliance evaluated against live RBAC state",
                None,
            );
        }
    })
    .await?;

    metrics::report_updated(source_name, namespace);
    Ok(())
}

fn new_report(
    name: &str,
    namespace: &str,
    source: &AuditSource,
    subject: &Subject,
) -> Result<RbacReport, Error> {
    let owner = source.controller_owner_ref(&()).ok_or_else(|| {
        Error::UserInput("AuditSource is missing metadata.name for owner reference".to_string())
    })?;
    Ok(RbacReport {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            // Cascade-delete with the Source that produced this report.
            owner_references: Some(vec![owner]),
            annotations: Some({
                let mut annotations = BTreeMap::new();
                annotations.insert(
                    annotations::CREATED_BY.to_string(),
                    util::MANAGER_NAME.to_string(),
                );
                annotations.insert(
                    annotations::SPEC_HASH.to_string(),
                    util::hash_spec(&source.spec),
                );
                annotations
            }),
            ..Default::default()
        },
        spec: RbacReportSpec {
            subject: subject.to_ref(),
        },
        status: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use leastpriv_types::{AuditSourceSpec, SubjectKind};

    fn source() -> AuditSource {
        let mut source = AuditSource::new("prod-audit", AuditSourceSpec::default());
        source.metadata.namespace = Some("observability".to_string());
        source.metadata.uid = Some("uid-123".to_string());
        source
    }

    #[test]
    fn report_names_are_subject_scoped() {
        let sa = Subject::ServiceAccount {
            namespace: "prod".to_string(),
            name: "backend".to_string(),
        };
        assert_eq!(report_name(&sa), "report-backend-prod");
        assert_eq!(
            report_name(&Subject::User("alice@example.com".to_string())),
            "report-alice-example-com"
        );
    }

    #[test]
    fn new_report_carries_owner_and_subject() {
        let subject = Subject::ServiceAccount {
            namespace: "prod".to_string(),
            name: "backend".to_string(),
        };
        let report = new_report("report-backend-prod", "observability", &source(), &subject).unwrap();
        let owners = report.metadata.owner_references.unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].kind, "AuditSource");
        assert_eq!(owners[0].name, "prod-audit");
        assert_eq!(report.spec.subject.kind, SubjectKind::ServiceAccount);
        assert_eq!(report.spec.subject.namespace.as_deref(), Some("prod"));
        assert!(
            report
                .metadata
                .annotations
                .unwrap()
                .contains_key(annotations::SPEC_HASH)
        );
    }
}
