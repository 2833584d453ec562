use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::jiff::Timestamp;
use kube::Client;
use leastpriv_types::AuditSource;
use owo_colors::OwoColorize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub mod aggregate;
pub mod filter;
pub mod normalize;

use crate::ingest::{self, AuditEvent, Position, SharedPosition, SourceLabels};
use crate::rbac::{diff, resolver};
use crate::report;
use crate::sources::actions;
use crate::util::{Error, metrics};
use aggregate::Aggregator;
use filter::CompiledFilters;

/// Flush intervals below this are clamped up.
const MIN_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Bound on the best-effort flush performed during shutdown.
const FINAL_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on waiting for the ingestor task to wind down after cancellation.
const INGESTOR_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// One pipeline: ingest → filter → normalize → aggregate, with a periodic
/// flush that renders policy, scores drift and writes reports. All state is
/// owned by this task; the select loop is the only writer.
pub async fn run(
    client: Client,
    source: Arc<AuditSource>,
    cancel: CancellationToken,
) -> Result<(), Error> {
    let mut instance = (*source).clone();
    let labels = SourceLabels {
        name: instance.metadata.name.clone().unwrap_or_default(),
        namespace: instance.metadata.namespace.clone().unwrap_or_default(),
    };

    // Configuration errors surface here and fail startup.
    let filters = CompiledFilters::compile(&instance.spec)?;
    let resume = Position::from_status(instance.status.as_ref());
    let ingestor = ingest::build_ingestor(&client, &instance, resume).await?;

    let capacity = instance.spec.checkpoint.batch_size.max(1);
    let (tx, mut rx) = mpsc::channel::<AuditEvent>(capacity);
    let mut started = ingestor.start(cancel.child_token(), tx);

    let lister = resolver::KubeRbacLister::new(client.clone());
    let mut aggregator = Aggregator::new();

    instance = actions::pipeline_running(client.clone(), &instance).await?;
    println!(
        "{}",
        format!(
            "🚰 Pipeline running • {}/{} mode={}",
            labels.namespace, labels.name, instance.spec.mode
        )
        .green()
    );

    let flush_every = Duration::from_secs(instance.spec.checkpoint.interval_seconds)
        .max(MIN_FLUSH_INTERVAL);
    let mut ticker =
        tokio::time::interval_at(tokio::time::Instant::now() + flush_every, flush_every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut ingestor_done = false;
    let outcome = loop {
        tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            received = rx.recv() => match received {
                Some(event) => handle_event(&mut aggregator, &filters, event, &labels),
                None => {
                    // The stream only ends on its own for unrecoverable
                    // source errors; surface them.
                    ingestor_done = true;
                    let err = match (&mut started.task).await {
                        Ok(Ok(())) => {
                            Error::UserInput("audit stream ended unexpectedly".to_string())
                        }
                        Ok(Err(e)) => e,
                        Err(join) => Error::UserInput(format!("ingestor task died: {join}")),
                    };
                    break Err(err);
                }
            },
            _ = ticker.tick() => {
                match flush(&client, &instance, &labels, &mut aggregator, &lister, &started.position).await {
                    Ok(updated) => instance = updated,
                    Err(e) => break Err(e),
                }
            }
        }
    };

    // Stop the ingestor, drain what it already produced, then flush once
    // more, time-bounded. If the API is unreachable the flush is abandoned.
    cancel.cancel();
    if !ingestor_done
        && tokio::time::timeout(INGESTOR_STOP_TIMEOUT, &mut started.task)
            .await
            .is_err()
    {
        started.task.abort();
    }
    while let Ok(event) = rx.try_recv() {
        handle_event(&mut aggregator, &filters, event, &labels);
    }
    if outcome.is_ok()
        && tokio::time::timeout(
            FINAL_FLUSH_TIMEOUT,
            flush(
                &client,
                &instance,
                &labels,
                &mut aggregator,
                &lister,
                &started.position,
            ),
        )
        .await
        .is_err()
    {
        eprintln!(
            "⚠️ {}/{} final flush did not complete within {:?}",
            labels.namespace, labels.name, FINAL_FLUSH_TIMEOUT
        );
    }

    println!(
        "{}",
        format!("🛑 Pipeline stopped • {}/{}", labels.namespace, labels.name).red()
    );
    outcome
}

/// Filter → normalize subject → normalize rule → aggregate.
fn handle_event(
    aggregator: &mut Aggregator,
    filters: &CompiledFilters,
    event: AuditEvent,
    labels: &SourceLabels,
) {
    metrics::event_processed(&labels.name, &labels.namespace);
    if !filters.allows(&event) {
        metrics::event_filtered(&labels.name, &labels.namespace);
        return;
    }
    let Some(subject) = normalize::normalize_subject(&event) else {
        metrics::event_filtered(&labels.name, &labels.namespace);
        return;
    };
    let key = normalize::normalize_rule(&event);
    let observed_at = event
        .stage_timestamp
        .unwrap_or_else(|| Time(Timestamp::now()));
    aggregator.add(subject, key, observed_at);
}

/// One flush cycle: per subject, compact and sort, render policy, resolve
/// effective permissions, score, upsert the report; then persist the
/// position. Per-subject failures are transient and logged; a vanished
/// Source is fatal.
async fn flush(
    client: &Client,
    instance: &AuditSource,
    labels: &SourceLabels,
    aggregator: &mut Aggregator,
    lister: &dyn resolver::RbacLister,
    position: &SharedPosition,
) -> Result<AuditSource, Error> {
    let flush_started = Instant::now();
    let now = Time(Timestamp::now());

    for subject in aggregator.subjects() {
        aggregator.compact(&subject, &instance.spec.limits, &now);
        let observations = aggregator.sorted_rules(&subject);
        if observations.is_empty() {
            continue;
        }

        let rendered = match crate::policy::strategy::render(
            &subject,
            &observations,
            &instance.spec.policy,
        ) {
            Ok(rendered) => rendered,
            Err(e) => {
                eprintln!(
                    "❌ {}/{} failed to render policy for {:?}: {e}",
                    labels.namespace, labels.name, subject
                );
                continue;
            }
        };
        metrics::rules_generated(&labels.name, &labels.namespace, rendered.rule_count);

        // Resolver unavailability degrades to a report without compliance.
        let compliance = match resolver::resolve_effective(lister, &subject).await {
            Ok(effective) => diff::evaluate(&observations, &effective, now.clone()),
            Err(e) => {
                eprintln!(
                    "⚠️ {}/{} RBAC resolver unavailable for {:?}: {e}",
                    labels.namespace, labels.name, subject
                );
                None
            }
        };

        if let Err(e) = report::upsert_report(
            client,
            instance,
            &subject,
            &observations,
            rendered.manifests,
            compliance,
            aggregator.events_processed(&subject),
        )
        .await
        {
            // A deleted report just gets recreated next flush.
            eprintln!(
                "⚠️ {}/{} failed to update report for {:?}: {e}",
                labels.namespace, labels.name, subject
            );
        }
    }

    let snapshot = position.lock().expect("position poisoned").clone();
    let updated = match actions::persist_position(client.clone(), instance, &snapshot).await {
        Ok(updated) => updated,
        Err(e) if actions::is_gone(&e) => return Err(e),
        Err(e) => {
            eprintln!(
                "⚠️ {}/{} failed to persist position: {e}",
                labels.namespace, labels.name
            );
            instance.clone()
        }
    };

    metrics::observe_flush(
        &labels.name,
        &labels.namespace,
        flush_started.elapsed().as_secs_f64(),
    );
    Ok(updated)
}
