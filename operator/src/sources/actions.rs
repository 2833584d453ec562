use kube::Client;
use leastpriv_types::AuditSource;

use crate::ingest::Position;
use crate::util::{self, Error, patch::patch_status_with_retry};

pub const READY_CONDITION: &str = "Ready";

/// Pipeline is being (re)started for the observed generation.
pub async fn pipeline_starting(
    client: Client,
    instance: &AuditSource,
) -> Result<AuditSource, Error> {
    let generation = instance.metadata.generation;
    patch_status_with_retry(client, instance, move |status| {
        status.observed_generation = generation;
        status.message = Some("pipeline is starting".to_string());
        util::set_condition(
            &mut status.conditions,
            READY_CONDITION,
            false,
            "PipelineStarting",
            "pipeline is starting",
            generation,
        );
    })
    .await
}

/// The pipeline's event loop is live.
pub async fn pipeline_running(
    client: Client,
    instance: &AuditSource,
) -> Result<AuditSource, Error> {
    let generation = instance.metadata.generation;
    patch_status_with_retry(client, instance, move |status| {
        status.observed_generation = generation;
        status.message = Some("pipeline is running".to_string());
        util::set_condition(
            &mut status.conditions,
            READY_CONDITION,
            true,
            "PipelineRunning",
            "pipeline is consuming the audit stream",
            generation,
        );
    })
    .await
}

/// Startup or fatal failure; `reason` identifies the failed stage.
pub async fn pipeline_failed(
    client: Client,
    instance: &AuditSource,
    reason: &str,
    message: &str,
) -> Result<AuditSource, Error> {
    let generation = instance.metadata.generation;
    let reason = reason.to_string();
    let message = message.to_string();
    patch_status_with_retry(client, instance, move |status| {
        status.observed_generation = generation;
        status.message = Some(message.clone());
        util::set_condition(
            &mut status.conditions,
            READY_CONDITION,
            false,
            &reason,
            &message,
            generation,
        );
    })
    .await
}

/// Persist the current resumption position onto the Source's status.
pub async fn persist_position(
    client: Client,
    instance: &AuditSource,
    position: &Position,
) -> Result<AuditSource, Error> {
    let position = position.clone();
    patch_status_with_retry(client, instance, move |status| {
        position.apply_to(status);
    })
    .await
}

/// True when the error says the Source itself no longer exists; the pipeline
/// treats that as fatal.
pub fn is_gone(error: &Error) -> bool {
    matches!(
        error,
        Error::Kube {
            source: kube::Error::Api(ae)
        } if ae.code == 404
    )
}
