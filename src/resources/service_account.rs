//! Service-account reconciler (account API).
//!
//! The access key and secret are only returned by the create call, so they
//! are carried forward from the previous observation on every read.

use tracing::{debug, info, warn};

use super::{retry_failure, ReadOutcome, ReadPass, ReconcileContext};
use crate::account::api::ServiceAccountInput;
use crate::classify::{is_not_found, ClassifyMode};
use crate::errors::{codes, ReconcileError};
use crate::model::{ServiceAccountObserved, ServiceAccountSpec};
use crate::retry::{retry, retry_when_codes, Attempt, RetryError};

/// Credentials issued when the account was created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IssuedCredentials {
    pub access_key: String,
    pub secret: String,
}

impl From<&ServiceAccountObserved> for IssuedCredentials {
    fn from(observed: &ServiceAccountObserved) -> Self {
        Self {
            access_key: observed.access_key.clone(),
            secret: observed.secret.clone(),
        }
    }
}

fn describe(name: &str) -> String {
    format!("service account ({name})")
}

fn input(spec: &ServiceAccountSpec) -> ServiceAccountInput {
    ServiceAccountInput {
        name: spec.name.clone(),
        description: spec.description.clone(),
        permissions: spec.permissions.clone(),
    }
}

/// Create the service account, disable it if asked, and read it back.
pub async fn create(
    ctx: &ReconcileContext,
    spec: &ServiceAccountSpec,
) -> Result<ServiceAccountObserved, ReconcileError> {
    let resource = describe(&spec.name);
    let account = ctx.account(&resource)?;
    let body = input(spec);

    let created = retry_when_codes(
        &ctx.policy(ctx.timeouts.create),
        &ctx.cancel,
        ClassifyMode::Strict,
        &[codes::TOO_MANY_REQUESTS, codes::SERVICE_UNAVAILABLE],
        || account.create_service_account(&body),
    )
    .await
    .map_err(|e| retry_failure(&resource, "create service account", e))?;
    info!(id = %created.id, name = %spec.name, "service account created");

    if !spec.enabled {
        account
            .disable_service_account(&created.id)
            .await
            .map_err(|e| ReconcileError::remote(&resource, "disable service account", e))?;
    }

    let credentials = IssuedCredentials {
        access_key: created.access_key,
        secret: created.secret,
    };
    read(ctx, &created.id, ReadPass::AfterCreate, &credentials)
        .await?
        .found(&resource, "read service account")
}

/// Observe the service account, attaching the previously issued credentials.
pub async fn read(
    ctx: &ReconcileContext,
    id: &str,
    pass: ReadPass,
    credentials: &IssuedCredentials,
) -> Result<ReadOutcome<ServiceAccountObserved>, ReconcileError> {
    let resource = describe(id);
    let account = ctx.account(&resource)?;

    let record = retry(&ctx.policy(ctx.timeouts.read), &ctx.cancel, || async move {
        match account.get_service_account(id).await {
            Ok(record) => Attempt::Done(record),
            Err(e) if pass == ReadPass::AfterCreate && is_not_found(&e) => Attempt::Retry(e),
            Err(e) => Attempt::Fail(e),
        }
    })
    .await;
    let record = match record {
        Ok(record) => record,
        Err(RetryError::Failed(e)) if pass == ReadPass::Refresh && is_not_found(&e) => {
            warn!(id, "service account not found, dropping from state");
            return Ok(ReadOutcome::Gone);
        }
        Err(e) => return Err(retry_failure(&resource, "read service account", e)),
    };

    Ok(ReadOutcome::Found(ServiceAccountObserved {
        id: record.id,
        name: record.name,
        description: record.description,
        permissions: record.permissions,
        enabled: record.enabled,
        ready_state: record.ready_state,
        access_key: credentials.access_key.clone(),
        secret: credentials.secret.clone(),
    }))
}

/// Converge name, description, permissions and the enabled flag.
pub async fn update(
    ctx: &ReconcileContext,
    spec: &ServiceAccountSpec,
    observed: &ServiceAccountObserved,
) -> Result<ServiceAccountObserved, ReconcileError> {
    let resource = describe(&observed.name);
    let fields_changed = spec.name != observed.name
        || spec.description != observed.description
        || spec.permissions != observed.permissions;
    let toggle = spec.enabled != observed.enabled;
    if !fields_changed && !toggle {
        return Ok(observed.clone());
    }

    let account = ctx.account(&resource)?;
    if fields_changed {
        let body = input(spec);
        retry_when_codes(
            &ctx.policy(ctx.timeouts.update),
            &ctx.cancel,
            ClassifyMode::Strict,
            &[codes::TOO_MANY_REQUESTS, codes::SERVICE_UNAVAILABLE],
            || account.update_service_account(&observed.id, &body),
        )
        .await
        .map_err(|e| retry_failure(&resource, "update service account", e))?;
        debug!(id = %observed.id, "service account updated");
    }
    if toggle {
        let result = if spec.enabled {
            account.enable_service_account(&observed.id).await
        } else {
            account.disable_service_account(&observed.id).await
        };
        result.map_err(|e| ReconcileError::remote(&resource, "toggle service account", e))?;
        debug!(id = %observed.id, enabled = spec.enabled, "service account toggled");
    }

    read(ctx, &observed.id, ReadPass::Refresh, &IssuedCredentials::from(observed))
        .await?
        .found(&resource, "read service account")
}

/// Delete the service account.  An unknown id counts as deleted.
pub async fn delete(ctx: &ReconcileContext, id: &str) -> Result<(), ReconcileError> {
    let resource = describe(id);
    let account = ctx.account(&resource)?;
    match account.delete_service_account(id).await {
        Ok(()) => {
            info!(id, "service account deleted");
            Ok(())
        }
        Err(e) if is_not_found(&e) => {
            debug!(id, "service account already gone");
            Ok(())
        }
        Err(e) => Err(ReconcileError::remote(resource, "delete service account", e)),
    }
}
