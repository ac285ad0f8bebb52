//! Object-copy reconciler.
//!
//! The object is written by a server-side copy of `source`.  It is copied
//! again when the source, or a field governed by a `REPLACE` directive,
//! drifts from what was observed.  With copy preconditions set, the service
//! decides: a re-copy rejected with `PreconditionFailed` leaves the object
//! as it is.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use super::{object, retry_failure, ReadOutcome, ReadPass, ReconcileContext};
use crate::classify::{is_not_found, ClassifyMode};
use crate::errors::{codes, ReconcileError, StorageError};
use crate::model::{CopySource, ObjectCopyObserved, ObjectCopySpec};
use crate::retry::{retry, retry_when_codes, Attempt, RetryError};
use crate::storage::backend::{CopyObjectOutput, CopyObjectRequest, Directive, ObjectStorage};
use crate::tags::{encode_tag_query, read_tags, TagTarget};

fn describe(bucket: &str, key: &str) -> String {
    format!("object copy ({bucket}/{key})")
}

fn invalid_source(resource: &str, source: &str) -> ReconcileError {
    ReconcileError::Invalid {
        resource: resource.to_string(),
        message: format!("source must look like bucket/key[?versionId=...], got {source:?}"),
    }
}

async fn copy(
    ctx: &ReconcileContext,
    storage: &dyn ObjectStorage,
    spec: &ObjectCopySpec,
    source: CopySource,
) -> Result<CopyObjectOutput, RetryError<StorageError>> {
    let request = CopyObjectRequest {
        bucket: spec.bucket.clone(),
        key: spec.key.clone(),
        source_bucket: source.bucket,
        source_key: source.key,
        source_version_id: source.version_id,
        content_type: spec.content_type.clone(),
        headers: spec.headers(),
        metadata: spec.metadata.clone(),
        metadata_directive: spec.metadata_directive,
        tagging: (!spec.tags.is_empty()).then(|| encode_tag_query(&spec.tags)),
        tagging_directive: spec.tagging_directive,
        conditions: spec.conditions(),
    };

    let output = retry_when_codes(
        &ctx.policy(ctx.timeouts.create),
        &ctx.cancel,
        ClassifyMode::Strict,
        &[codes::NO_SUCH_BUCKET, codes::NO_SUCH_KEY],
        || storage.copy_object(request.clone()),
    )
    .await?;
    info!(
        bucket = %spec.bucket,
        key = %spec.key,
        source = %spec.source,
        etag = %output.etag,
        "object copied"
    );
    Ok(output)
}

/// Copy the object and read it back.
pub async fn create(ctx: &ReconcileContext, spec: &ObjectCopySpec) -> Result<ObjectCopyObserved, ReconcileError> {
    let resource = describe(&spec.bucket, &spec.key);
    let storage = ctx.storage(&resource)?;
    let source = CopySource::parse(&spec.source).ok_or_else(|| invalid_source(&resource, &spec.source))?;
    let output = copy(ctx, storage, spec, source)
        .await
        .map_err(|e| retry_failure(&resource, "copy object", e))?;
    read(
        ctx,
        &spec.bucket,
        &spec.key,
        &spec.source,
        output.source_version_id.as_deref(),
        ReadPass::AfterCreate,
    )
    .await?
    .found(&resource, "read object copy")
}

/// Observe the copied object and the current entity tag of its source.
pub async fn read(
    ctx: &ReconcileContext,
    bucket: &str,
    key: &str,
    source: &str,
    source_version_id: Option<&str>,
    pass: ReadPass,
) -> Result<ReadOutcome<ObjectCopyObserved>, ReconcileError> {
    let resource = describe(bucket, key);
    let storage = ctx.storage(&resource)?;
    let policy = ctx.policy(ctx.timeouts.read);
    let origin = CopySource::parse(source).ok_or_else(|| invalid_source(&resource, source))?;

    let head = retry(&policy, &ctx.cancel, || async move {
        match storage.head_object(bucket, key, None).await {
            Ok(head) => Attempt::Done(head),
            Err(e) if pass == ReadPass::AfterCreate && is_not_found(&e) => Attempt::Retry(e),
            Err(e) => Attempt::Fail(e),
        }
    })
    .await;
    let head = match head {
        Ok(head) => head,
        Err(RetryError::Failed(e)) if pass == ReadPass::Refresh && is_not_found(&e) => {
            warn!(bucket, key, "copied object not found, dropping from state");
            return Ok(ReadOutcome::Gone);
        }
        Err(e) => return Err(retry_failure(&resource, "head object", e)),
    };

    let tags = retry_when_codes(
        &policy,
        &ctx.cancel,
        ClassifyMode::Strict,
        &[codes::NO_SUCH_BUCKET],
        || read_tags(storage, TagTarget::Object { bucket, key }),
    )
    .await
    .map_err(|e| retry_failure(&resource, "read object tags", e))?;

    let source_etag = match storage
        .head_object(&origin.bucket, &origin.key, origin.version_id.as_deref())
        .await
    {
        Ok(source_head) => Some(source_head.etag.trim_matches('"').to_string()),
        Err(e) if is_not_found(&e) => {
            debug!(source, "copy source no longer exists");
            None
        }
        Err(e) => return Err(ReconcileError::remote(&resource, "head copy source", e)),
    };

    let metadata: BTreeMap<String, String> = head
        .metadata
        .into_iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v))
        .collect();

    Ok(ReadOutcome::Found(ObjectCopyObserved {
        bucket: bucket.to_string(),
        key: key.to_string(),
        source: source.to_string(),
        etag: head.etag.trim_matches('"').to_string(),
        last_modified: head.last_modified,
        version_id: head.version_id,
        source_version_id: source_version_id.map(str::to_string),
        content_type: head.content_type,
        headers: head.headers,
        metadata,
        tags,
        source_etag,
    }))
}

/// Whether the copy no longer reflects `spec` or its source.
fn drifted(spec: &ObjectCopySpec, observed: &ObjectCopyObserved) -> bool {
    if spec.source != observed.source {
        return true;
    }
    // Multipart entity tags change on copy, so they cannot show source drift.
    let source_changed = observed
        .source_etag
        .as_deref()
        .is_some_and(|etag| !etag.contains('-') && etag != observed.etag);
    if source_changed {
        return true;
    }
    if spec.metadata_directive == Some(Directive::Replace) {
        let type_changed = spec
            .content_type
            .as_ref()
            .is_some_and(|ct| observed.content_type.as_ref() != Some(ct));
        if type_changed || !spec.headers().satisfied_by(&observed.headers) || spec.metadata != observed.metadata {
            return true;
        }
    }
    spec.tagging_directive == Some(Directive::Replace) && spec.tags != observed.tags
}

/// Copy again when the source or a replaced field drifted.
pub async fn update(
    ctx: &ReconcileContext,
    spec: &ObjectCopySpec,
    observed: &ObjectCopyObserved,
) -> Result<ObjectCopyObserved, ReconcileError> {
    let resource = describe(&observed.bucket, &observed.key);
    if spec.bucket != observed.bucket {
        return Err(ReconcileError::Immutable { resource, field: "bucket" });
    }
    if spec.key != observed.key {
        return Err(ReconcileError::Immutable { resource, field: "key" });
    }
    if !drifted(spec, observed) {
        return Ok(observed.clone());
    }

    let storage = ctx.storage(&resource)?;
    let origin = CopySource::parse(&spec.source).ok_or_else(|| invalid_source(&resource, &spec.source))?;
    debug!(bucket = %spec.bucket, key = %spec.key, "object copy drifted, copying again");
    let (source, source_version_id) = match copy(ctx, storage, spec, origin).await {
        Ok(output) => (spec.source.as_str(), output.source_version_id),
        Err(RetryError::Failed(e)) if e.is_code(codes::PRECONDITION_FAILED) && !spec.conditions().is_empty() => {
            warn!(bucket = %spec.bucket, key = %spec.key, "copy preconditions not met, keeping current object");
            (observed.source.as_str(), observed.source_version_id.clone())
        }
        Err(e) => return Err(retry_failure(&resource, "copy object", e)),
    };
    read(
        ctx,
        &spec.bucket,
        &spec.key,
        source,
        source_version_id.as_deref(),
        ReadPass::Refresh,
    )
    .await?
    .found(&resource, "read object copy")
}

/// Delete the copied object.
pub async fn delete(
    ctx: &ReconcileContext,
    spec: &ObjectCopySpec,
    observed: &ObjectCopyObserved,
) -> Result<(), ReconcileError> {
    object::delete(
        ctx,
        &observed.bucket,
        &observed.key,
        observed.version_id.as_deref(),
        spec.force_destroy,
    )
    .await
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration as ChronoDuration, Utc};

    use super::super::testing::context;
    use super::*;
    use crate::account::memory::MemoryAccountApi;
    use crate::storage::backend::{ObjectStorage, PutObjectRequest};
    use crate::storage::memory::{Call, MemoryStorage};

    async fn setup() -> (Arc<MemoryStorage>, ReconcileContext) {
        let storage = Arc::new(MemoryStorage::new());
        storage.create_bucket("src", false).await.unwrap();
        storage.create_bucket("dst", false).await.unwrap();
        put_source(&storage, "a.txt", "hello").await;
        let ctx = context(&storage, &Arc::new(MemoryAccountApi::new()));
        (storage, ctx)
    }

    async fn put_source(storage: &MemoryStorage, key: &str, body: &str) {
        let mut metadata = BTreeMap::new();
        metadata.insert("owner".to_string(), "ops".to_string());
        storage
            .put_object(PutObjectRequest {
                bucket: "src".into(),
                key: key.into(),
                body: body.to_string().into(),
                content_type: Some("text/plain".into()),
                metadata,
                ..Default::default()
            })
            .await
            .unwrap();
    }

    fn spec(source: &str) -> ObjectCopySpec {
        ObjectCopySpec {
            bucket: "dst".into(),
            key: "copy.txt".into(),
            source: source.into(),
            content_type: None,
            cache_control: None,
            content_disposition: None,
            content_encoding: None,
            content_language: None,
            metadata: BTreeMap::new(),
            metadata_directive: None,
            tags: Default::default(),
            tagging_directive: None,
            copy_if_match: None,
            copy_if_none_match: None,
            copy_if_modified_since: None,
            copy_if_unmodified_since: None,
            force_destroy: false,
        }
    }

    #[tokio::test]
    async fn test_create_copies_source_metadata() {
        let (storage, ctx) = setup().await;
        let observed = create(&ctx, &spec("src/a.txt")).await.unwrap();
        assert_eq!(storage.count(Call::CopyObject), 1);
        assert_eq!(observed.content_type.as_deref(), Some("text/plain"));
        assert_eq!(observed.metadata.get("owner").map(String::as_str), Some("ops"));
        assert_eq!(observed.source_etag.as_deref(), Some(observed.etag.as_str()));
        assert!(observed.last_modified.is_some());
    }

    #[tokio::test]
    async fn test_unchanged_copy_makes_no_calls() {
        let (storage, ctx) = setup().await;
        let desired = spec("src/a.txt");
        let observed = create(&ctx, &desired).await.unwrap();
        storage.clear_journal();
        assert_eq!(update(&ctx, &desired, &observed).await.unwrap(), observed);
        assert!(storage.journal().is_empty());
    }

    #[tokio::test]
    async fn test_source_change_copies_again() {
        let (storage, ctx) = setup().await;
        let desired = spec("src/a.txt");
        let observed = create(&ctx, &desired).await.unwrap();

        put_source(&storage, "a.txt", "hello again").await;
        let refreshed = read(&ctx, "dst", "copy.txt", "src/a.txt", None, ReadPass::Refresh)
            .await
            .unwrap();
        let ReadOutcome::Found(refreshed) = refreshed else {
            panic!("copy vanished");
        };
        assert_ne!(refreshed.source_etag.as_deref(), Some(refreshed.etag.as_str()));

        let updated = update(&ctx, &desired, &refreshed).await.unwrap();
        assert_eq!(storage.count(Call::CopyObject), 2);
        assert_ne!(updated.etag, observed.etag);
        assert_eq!(updated.source_etag.as_deref(), Some(updated.etag.as_str()));
    }

    #[tokio::test]
    async fn test_new_source_path_copies_again() {
        let (storage, ctx) = setup().await;
        put_source(&storage, "b.txt", "other").await;
        let observed = create(&ctx, &spec("src/a.txt")).await.unwrap();
        let updated = update(&ctx, &spec("src/b.txt"), &observed).await.unwrap();
        assert_eq!(updated.source, "src/b.txt");
        assert_eq!(storage.count(Call::CopyObject), 2);
    }

    #[tokio::test]
    async fn test_replace_directive_drift() {
        let (storage, ctx) = setup().await;
        let mut desired = spec("src/a.txt");
        desired.metadata_directive = Some(Directive::Replace);
        desired.content_type = Some("application/json".into());
        desired.cache_control = Some("no-cache".into());
        desired.tagging_directive = Some(Directive::Replace);
        desired.tags.insert("env".into(), "prod".into());
        let observed = create(&ctx, &desired).await.unwrap();
        assert_eq!(observed.content_type.as_deref(), Some("application/json"));
        assert_eq!(observed.headers.cache_control.as_deref(), Some("no-cache"));
        assert!(observed.metadata.is_empty());
        assert_eq!(observed.tags, desired.tags);

        assert_eq!(update(&ctx, &desired, &observed).await.unwrap(), observed);
        assert_eq!(storage.count(Call::CopyObject), 1);

        desired.cache_control = Some("max-age=60".into());
        let updated = update(&ctx, &desired, &observed).await.unwrap();
        assert_eq!(updated.headers.cache_control.as_deref(), Some("max-age=60"));
        assert_eq!(storage.count(Call::CopyObject), 2);
    }

    #[tokio::test]
    async fn test_copy_directive_ignores_requested_metadata() {
        let (storage, ctx) = setup().await;
        let mut desired = spec("src/a.txt");
        desired.content_type = Some("application/json".into());
        let observed = create(&ctx, &desired).await.unwrap();
        assert_eq!(observed.content_type.as_deref(), Some("text/plain"));
        assert_eq!(update(&ctx, &desired, &observed).await.unwrap(), observed);
        assert_eq!(storage.count(Call::CopyObject), 1);
    }

    #[tokio::test]
    async fn test_failed_precondition_on_create_is_an_error() {
        let (storage, ctx) = setup().await;
        let mut desired = spec("src/a.txt");
        desired.copy_if_modified_since = Some(Utc::now() + ChronoDuration::hours(1));
        let err = create(&ctx, &desired).await.unwrap_err();
        assert!(err.to_string().contains(codes::PRECONDITION_FAILED), "{err}");
        assert_eq!(storage.count(Call::CopyObject), 1);
    }

    #[tokio::test]
    async fn test_failed_precondition_on_update_keeps_object() {
        let (storage, ctx) = setup().await;
        let mut desired = spec("src/a.txt");
        let observed = create(&ctx, &desired).await.unwrap();

        put_source(&storage, "a.txt", "hello again").await;
        let ReadOutcome::Found(refreshed) = read(&ctx, "dst", "copy.txt", "src/a.txt", None, ReadPass::Refresh)
            .await
            .unwrap()
        else {
            panic!("copy vanished");
        };
        desired.copy_if_match = Some(observed.etag.clone());

        let updated = update(&ctx, &desired, &refreshed).await.unwrap();
        assert_eq!(updated.etag, observed.etag);
        assert_eq!(storage.count(Call::CopyObject), 2);
    }

    #[tokio::test]
    async fn test_key_change_is_immutable() {
        let (_, ctx) = setup().await;
        let observed = create(&ctx, &spec("src/a.txt")).await.unwrap();
        let mut desired = spec("src/a.txt");
        desired.key = "moved.txt".into();
        let err = update(&ctx, &desired, &observed).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Immutable { field: "key", .. }));
    }

    #[tokio::test]
    async fn test_refresh_and_delete() {
        let (storage, ctx) = setup().await;
        let desired = spec("src/a.txt");
        let observed = create(&ctx, &desired).await.unwrap();
        delete(&ctx, &desired, &observed).await.unwrap();
        assert!(storage.head_object("dst", "copy.txt", None).await.is_err());
        assert!(storage.head_object("src", "a.txt", None).await.is_ok());

        let outcome = read(&ctx, "dst", "copy.txt", "src/a.txt", None, ReadPass::Refresh)
            .await
            .unwrap();
        assert_eq!(outcome, ReadOutcome::Gone);
        delete(&ctx, &desired, &observed).await.unwrap();
    }
}
