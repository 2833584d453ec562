use super::MANAGER_NAME;
use crate::util::Error;
use k8s_openapi::{apimachinery::pkg::apis::meta::v1::Time, jiff::Timestamp};
use kube::{
    Api, Client,
    api::{Patch, PatchParams, Resource},
    core::NamespaceResourceScope,
};
use leastpriv_types::*;
use serde::{Serialize, de::DeserializeOwned};
use std::{fmt::Debug, time::Duration};

/// Attempts for optimistic-concurrency conflicts before giving up.
const CONFLICT_RETRIES: usize = 5;
const CONFLICT_BACKOFF_BASE: Duration = Duration::from_millis(50);

/// The two object kinds whose status subresource this operator writes.
/// `lastUpdated` is stamped on every write.
pub trait StatusOwner {
    type Status: Default;

    fn status_mut(&mut self) -> &mut Self::Status;
    fn stamp(status: &mut Self::Status, now: Time);
}

impl StatusOwner for AuditSource {
    type Status = AuditSourceStatus;

    fn status_mut(&mut self) -> &mut AuditSourceStatus {
        self.status.get_or_insert_with(Default::default)
    }

    fn stamp(status: &mut AuditSourceStatus, now: Time) {
        status.last_updated = Some(now);
    }
}

impl StatusOwner for RbacReport {
    type Status = RbacReportStatus;

    fn status_mut(&mut self) -> &mut RbacReportStatus {
        self.status.get_or_insert_with(Default::default)
    }

    fn stamp(status: &mut RbacReportStatus, now: Time) {
        status.last_updated = Some(now);
    }
}

/// Apply `f` to the resource's status and patch the `/status` subresource
/// with the resulting JSON-patch diff, retrying bounded on 409. The mutator
/// must be re-applicable: the object is refetched between attempts so the
/// diff is always computed against the server's current view.
pub async fn patch_status_with_retry<T>(
    client: Client,
    instance: &T,
    f: impl Fn(&mut T::Status),
) -> Result<T, Error>
where
    <T as Resource>::DynamicType: Default,
    T: StatusOwner
        + Clone
        + Serialize
        + DeserializeOwned
        + Debug
        + Resource<Scope = NamespaceResourceScope>,
{
    let name = instance
        .meta()
        .name
        .clone()
        .ok_or_else(|| Error::UserInput("resource is missing metadata.name".to_string()))?;
    let namespace = instance
        .meta()
        .namespace
        .clone()
        .ok_or_else(|| Error::UserInput("resource is missing metadata.namespace".to_string()))?;
    let api: Api<T> = Api::namespaced(client, &namespace);

    let mut current = instance.clone();
    for attempt in 0..CONFLICT_RETRIES {
        let mut modified = current.clone();
        let status = modified.status_mut();
        f(status);
        T::stamp(status, Time::from(Timestamp::now()));
        let patch = Patch::Json::<T>(json_patch::diff(
            &serde_json::to_value(&current)?,
            &serde_json::to_value(&modified)?,
        ));

        match api
            .patch_status(&name, &PatchParams::apply(MANAGER_NAME), &patch)
            .await
        {
            Ok(updated) => return Ok(updated),
            Err(kube::Error::Api(ae)) if ae.code == 409 && attempt + 1 < CONFLICT_RETRIES => {
                let delay = leastpriv_common::wait::backoff_full_jitter(
                    CONFLICT_BACKOFF_BASE,
                    Duration::from_secs(1),
                    attempt,
                );
                tokio::time::sleep(delay).await;
                current = api.get(&name).await?;
            }
            Err(e) => return Err(e.into()),
        }
    }
    unreachable!("conflict retry loop always returns")
}
