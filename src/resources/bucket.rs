//! Bucket reconciler.
//!
//! Create retries while a conflicting operation is in flight, applies tags
//! and reads back.  Delete is a bounded loop: when the bucket is not empty
//! and `force_destroy` is set the bucket is emptied (bypassing locks when
//! object lock is on) and the delete is tried again.  Every emptying pass is
//! followed by a delete, so `max_delete_passes` bounds the empty passes.

use tracing::{debug, info, warn};

use super::{retry_failure, ReadOutcome, ReadPass, ReconcileContext};
use crate::classify::{is_not_found, should_retry, ClassifyMode};
use crate::destroy::{empty_container, EmptyOptions};
use crate::errors::{codes, ReconcileError};
use crate::model::{BucketObserved, BucketSpec};
use crate::retry::{retry, retry_until_not_found, retry_when_codes, Attempt, Lingering, RetryError};
use crate::tags::{read_tags, reconcile_tags, TagSet, TagTarget};

fn describe(name: &str) -> String {
    format!("bucket ({name})")
}

/// Create the bucket, apply its tags and read it back.
pub async fn create(ctx: &ReconcileContext, spec: &BucketSpec) -> Result<BucketObserved, ReconcileError> {
    let resource = describe(&spec.name);
    let storage = ctx.storage(&resource)?;
    let policy = ctx.policy(ctx.timeouts.create);

    retry_when_codes(
        &policy,
        &ctx.cancel,
        ClassifyMode::Strict,
        &[codes::OPERATION_ABORTED],
        || storage.create_bucket(&spec.name, spec.object_lock),
    )
    .await
    .map_err(|e| retry_failure(&resource, "create bucket", e))?;
    info!(bucket = %spec.name, object_lock = spec.object_lock, "bucket created");

    reconcile_tags(
        storage,
        &policy,
        &ctx.cancel,
        TagTarget::Bucket(&spec.name),
        &TagSet::new(),
        &spec.tags,
    )
    .await
    .map_err(|e| retry_failure(&resource, "put bucket tags", e))?;

    read(ctx, &spec.name, ReadPass::AfterCreate)
        .await?
        .found(&resource, "read bucket")
}

/// Observe the bucket.
///
/// On [`ReadPass::AfterCreate`] a not-found HEAD is retried until the read
/// deadline; on [`ReadPass::Refresh`] it means the bucket is gone.
pub async fn read(
    ctx: &ReconcileContext,
    name: &str,
    pass: ReadPass,
) -> Result<ReadOutcome<BucketObserved>, ReconcileError> {
    let resource = describe(name);
    let storage = ctx.storage(&resource)?;
    let policy = ctx.policy(ctx.timeouts.read);

    let head = retry(&policy, &ctx.cancel, || async move {
        match storage.head_bucket(name).await {
            Ok(()) => Attempt::Done(()),
            Err(e) if pass == ReadPass::AfterCreate && is_not_found(&e) => Attempt::Retry(e),
            Err(e) => Attempt::Fail(e),
        }
    })
    .await;
    match head {
        Ok(()) => {}
        Err(RetryError::Failed(e)) if pass == ReadPass::Refresh && is_not_found(&e) => {
            warn!(bucket = name, "bucket not found, dropping from state");
            return Ok(ReadOutcome::Gone);
        }
        Err(e) => return Err(retry_failure(&resource, "head bucket", e)),
    }

    // HEAD can still succeed just after a delete; a refresh that then loses
    // the bucket on the region lookup treats it as gone.
    let region = retry(&policy, &ctx.cancel, || async move {
        match storage.bucket_region(name).await {
            Ok(region) => Attempt::Done(region),
            Err(e) if pass == ReadPass::Refresh && is_not_found(&e) => Attempt::Fail(e),
            Err(e) if should_retry(&e, ClassifyMode::Propagation, &[codes::NOT_FOUND]) => Attempt::Retry(e),
            Err(e) => Attempt::Fail(e),
        }
    })
    .await;
    let region = match region {
        Ok(region) => region,
        Err(RetryError::Failed(e)) if pass == ReadPass::Refresh && is_not_found(&e) => {
            warn!(bucket = name, "bucket region not found, dropping from state");
            return Ok(ReadOutcome::Gone);
        }
        Err(e) => return Err(retry_failure(&resource, "read bucket region", e)),
    };

    let object_lock = storage
        .bucket_object_lock(name)
        .await
        .map_err(|e| ReconcileError::remote(&resource, "read object lock configuration", e))?;

    let tags = retry_when_codes(
        &policy,
        &ctx.cancel,
        ClassifyMode::Strict,
        &[codes::NO_SUCH_BUCKET],
        || read_tags(storage, TagTarget::Bucket(name)),
    )
    .await
    .map_err(|e| retry_failure(&resource, "read bucket tags", e))?;

    Ok(ReadOutcome::Found(BucketObserved {
        name: name.to_string(),
        region,
        object_lock,
        tags,
    }))
}

/// Converge tags.  The name and object lock cannot change in place.
pub async fn update(
    ctx: &ReconcileContext,
    spec: &BucketSpec,
    observed: &BucketObserved,
) -> Result<BucketObserved, ReconcileError> {
    let resource = describe(&observed.name);
    if spec.name != observed.name {
        return Err(ReconcileError::Immutable { resource, field: "name" });
    }
    if spec.object_lock != observed.object_lock {
        return Err(ReconcileError::Immutable {
            resource,
            field: "object_lock",
        });
    }
    if spec.tags == observed.tags {
        return Ok(observed.clone());
    }

    let storage = ctx.storage(&resource)?;
    let change = reconcile_tags(
        storage,
        &ctx.policy(ctx.timeouts.update),
        &ctx.cancel,
        TagTarget::Bucket(&spec.name),
        &observed.tags,
        &spec.tags,
    )
    .await
    .map_err(|e| retry_failure(&resource, "update bucket tags", e))?;
    debug!(bucket = %spec.name, ?change, "bucket tags reconciled");

    read(ctx, &spec.name, ReadPass::Refresh)
        .await?
        .found(&resource, "read bucket")
}

/// Delete the bucket.  A bucket that is already gone counts as deleted.
pub async fn delete(
    ctx: &ReconcileContext,
    name: &str,
    force_destroy: bool,
    object_lock: bool,
) -> Result<(), ReconcileError> {
    let resource = describe(name);
    let storage = ctx.storage(&resource)?;
    let mut passes = 0;

    loop {
        if ctx.cancel.is_cancelled() {
            return Err(ReconcileError::Cancelled {
                resource,
                operation: "delete bucket",
            });
        }

        match storage.delete_bucket(name).await {
            Ok(()) => {
                info!(bucket = name, passes, "bucket deleted");
                wait_until_gone(ctx, name, &resource).await?;
                return Ok(());
            }
            Err(e) if e.is_code(codes::NO_SUCH_BUCKET) => {
                debug!(bucket = name, "bucket already gone");
                return Ok(());
            }
            Err(e) if e.is_code(codes::BUCKET_NOT_EMPTY) && force_destroy => {
                if passes == ctx.max_delete_passes {
                    return Err(ReconcileError::Exhausted {
                        resource,
                        operation: "delete bucket",
                        passes,
                        last: e.to_string(),
                    });
                }
                passes += 1;
                let options = EmptyOptions {
                    bypass_lock: object_lock,
                    ..Default::default()
                };
                let deleted = empty_container(storage, &ctx.cancel, name, &options)
                    .await
                    .map_err(|source| ReconcileError::Empty {
                        resource: resource.clone(),
                        source,
                    })?;
                info!(bucket = name, pass = passes, deleted, "bucket emptied");
            }
            Err(e) => return Err(ReconcileError::remote(resource, "delete bucket", e)),
        }
    }
}

/// Wait for a deleted bucket to stop answering HEAD.
async fn wait_until_gone(ctx: &ReconcileContext, name: &str, resource: &str) -> Result<(), ReconcileError> {
    let storage = ctx.storage(resource)?;
    match retry_until_not_found(&ctx.policy(ctx.timeouts.delete), &ctx.cancel, || storage.head_bucket(name)).await {
        Ok(()) => Ok(()),
        Err(RetryError::Failed(Lingering::StillPresent)) => {
            warn!(bucket = name, "bucket still visible after delete");
            Ok(())
        }
        Err(RetryError::Failed(Lingering::Failed(e))) => Err(ReconcileError::remote(resource, "head bucket", e)),
        Err(RetryError::Cancelled { .. }) => Err(ReconcileError::Cancelled {
            resource: resource.to_string(),
            operation: "delete bucket",
        }),
    }
}

/// Look up an existing bucket by name.
pub async fn lookup(ctx: &ReconcileContext, name: &str) -> Result<BucketObserved, ReconcileError> {
    read(ctx, name, ReadPass::Refresh)
        .await?
        .found(&describe(name), "look up bucket")
}
