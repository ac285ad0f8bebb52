//! Object reconciler.
//!
//! An object's body, content type and metadata can only change by uploading
//! it again; tags, retention and legal hold have their own calls.

use std::collections::BTreeMap;

use bytes::Bytes;
use md5::{Digest, Md5};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::{retry_failure, ReadOutcome, ReadPass, ReconcileContext};
use crate::classify::{is_not_found, ClassifyMode};
use crate::destroy::{empty_container, EmptyOptions};
use crate::errors::{codes, ReconcileError};
use crate::model::{ObjectObserved, ObjectSpec};
use crate::retry::{retry, retry_when_codes, Attempt, RetryError};
use crate::storage::backend::{LockMode, PutObjectRequest, Retention};
use crate::tags::{encode_tag_query, read_tags, reconcile_tags, TagTarget};

fn describe(bucket: &str, key: &str) -> String {
    format!("object ({bucket}/{key})")
}

fn desired_retention(spec: &ObjectSpec) -> Option<Retention> {
    spec.lock_mode
        .zip(spec.lock_until)
        .map(|(mode, until)| Retention { mode, until })
}

fn observed_retention(observed: &ObjectObserved) -> Option<Retention> {
    observed
        .lock_mode
        .zip(observed.lock_until)
        .map(|(mode, until)| Retention { mode, until })
}

/// The body to upload: inline content, the source file, or nothing.
async fn load_body(spec: &ObjectSpec, resource: &str) -> Result<Bytes, ReconcileError> {
    if let Some(content) = &spec.content {
        return Ok(Bytes::from(content.clone()));
    }
    match &spec.source {
        Some(path) => tokio::fs::read(path)
            .await
            .map(Bytes::from)
            .map_err(|source| ReconcileError::Source {
                resource: resource.to_string(),
                path: path.clone(),
                source,
            }),
        None => Ok(Bytes::new()),
    }
}

fn md5_hex(body: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(body);
    hex::encode(hasher.finalize())
}

/// Whether the stored object differs in anything only an upload can change.
fn content_changed(spec: &ObjectSpec, observed: &ObjectObserved, body: &[u8]) -> bool {
    // Multipart etags are not a digest of the body.
    let body_changed = !observed.etag.contains('-') && md5_hex(body) != observed.etag;
    let type_changed = spec
        .content_type
        .as_ref()
        .is_some_and(|ct| observed.content_type.as_ref() != Some(ct));
    body_changed || type_changed || spec.metadata != observed.metadata
}

async fn upload(
    ctx: &ReconcileContext,
    spec: &ObjectSpec,
    body: Bytes,
    resource: &str,
) -> Result<(), ReconcileError> {
    let storage = ctx.storage(resource)?;
    let request = PutObjectRequest {
        bucket: spec.bucket.clone(),
        key: spec.key.clone(),
        body,
        content_type: spec.content_type.clone(),
        metadata: spec.metadata.clone(),
        tagging: (!spec.tags.is_empty()).then(|| encode_tag_query(&spec.tags)),
        retention: desired_retention(spec),
        legal_hold: spec.legal_hold,
    };

    let output = retry_when_codes(
        &ctx.policy(ctx.timeouts.create),
        &ctx.cancel,
        ClassifyMode::Strict,
        &[codes::NO_SUCH_BUCKET],
        || storage.put_object(request.clone()),
    )
    .await
    .map_err(|e| retry_failure(resource, "upload object", e))?;
    info!(bucket = %spec.bucket, key = %spec.key, etag = %output.etag, "object uploaded");
    Ok(())
}

/// Upload the object and read it back.
pub async fn create(ctx: &ReconcileContext, spec: &ObjectSpec) -> Result<ObjectObserved, ReconcileError> {
    let resource = describe(&spec.bucket, &spec.key);
    let body = load_body(spec, &resource).await?;
    upload(ctx, spec, body, &resource).await?;
    read(ctx, &spec.bucket, &spec.key, ReadPass::AfterCreate)
        .await?
        .found(&resource, "read object")
}

/// Observe the object's current version.
pub async fn read(
    ctx: &ReconcileContext,
    bucket: &str,
    key: &str,
    pass: ReadPass,
) -> Result<ReadOutcome<ObjectObserved>, ReconcileError> {
    let resource = describe(bucket, key);
    let storage = ctx.storage(&resource)?;
    let policy = ctx.policy(ctx.timeouts.read);

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
            warn!(bucket, key, "object not found, dropping from state");
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

    let metadata: BTreeMap<String, String> = head
        .metadata
        .into_iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v))
        .collect();

    Ok(ReadOutcome::Found(ObjectObserved {
        bucket: bucket.to_string(),
        key: key.to_string(),
        etag: head.etag.trim_matches('"').to_string(),
        version_id: head.version_id,
        content_type: head.content_type,
        content_length: head.content_length,
        metadata,
        tags,
        lock_mode: head.retention.map(|r| r.mode),
        lock_until: head.retention.map(|r| r.until),
        legal_hold: head.legal_hold,
    }))
}

/// Converge the object.  Content drift re-uploads; otherwise only the
/// changed tags, retention and legal hold are written.
pub async fn update(
    ctx: &ReconcileContext,
    spec: &ObjectSpec,
    observed: &ObjectObserved,
) -> Result<ObjectObserved, ReconcileError> {
    let resource = describe(&observed.bucket, &observed.key);
    if spec.bucket != observed.bucket {
        return Err(ReconcileError::Immutable { resource, field: "bucket" });
    }
    if spec.key != observed.key {
        return Err(ReconcileError::Immutable { resource, field: "key" });
    }

    let body = load_body(spec, &resource).await?;
    if content_changed(spec, observed, &body) {
        debug!(bucket = %spec.bucket, key = %spec.key, "object content changed, uploading");
        upload(ctx, spec, body, &resource).await?;
        return read(ctx, &spec.bucket, &spec.key, ReadPass::Refresh)
            .await?
            .found(&resource, "read object");
    }

    let storage = ctx.storage(&resource)?;
    let version_id = observed.version_id.as_deref();
    let mut changed = false;

    if spec.tags != observed.tags {
        reconcile_tags(
            storage,
            &ctx.policy(ctx.timeouts.update),
            &ctx.cancel,
            TagTarget::Object {
                bucket: &spec.bucket,
                key: &spec.key,
            },
            &observed.tags,
            &spec.tags,
        )
        .await
        .map_err(|e| retry_failure(&resource, "update object tags", e))?;
        changed = true;
    }

    let current = observed_retention(observed);
    let wanted = desired_retention(spec);
    if wanted != current {
        let bypass = current.is_some_and(|r| r.mode == LockMode::Governance);
        storage
            .put_object_retention(&spec.bucket, &spec.key, version_id, wanted, bypass)
            .await
            .map_err(|e| ReconcileError::remote(&resource, "update object retention", e))?;
        changed = true;
    }

    if spec.legal_hold != observed.legal_hold {
        storage
            .put_object_legal_hold(&spec.bucket, &spec.key, version_id, spec.legal_hold)
            .await
            .map_err(|e| ReconcileError::remote(&resource, "update object legal hold", e))?;
        changed = true;
    }

    if !changed {
        return Ok(observed.clone());
    }
    read(ctx, &spec.bucket, &spec.key, ReadPass::Refresh)
        .await?
        .found(&resource, "read object")
}

/// Strip leading slashes and collapse repeated ones.
pub fn clean_key(key: &str) -> String {
    let mut cleaned = String::with_capacity(key.len());
    for c in key.trim_start_matches('/').chars() {
        if c == '/' && cleaned.ends_with('/') {
            continue;
        }
        cleaned.push(c);
    }
    cleaned
}

/// Delete the object.  On a versioned bucket every version of the key is
/// removed; `force_destroy` bypasses locks on the way.
pub async fn delete(
    ctx: &ReconcileContext,
    bucket: &str,
    key: &str,
    version_id: Option<&str>,
    force_destroy: bool,
) -> Result<(), ReconcileError> {
    let key = clean_key(key);
    let resource = describe(bucket, &key);
    let storage = ctx.storage(&resource)?;

    if version_id.is_some() {
        let options = EmptyOptions {
            bypass_lock: force_destroy,
            ignore_errors: false,
            key: Some(key.clone()),
        };
        let deleted = empty_container(storage, &ctx.cancel, bucket, &options)
            .await
            .map_err(|source| ReconcileError::Empty { resource, source })?;
        info!(bucket, key = %key, deleted, "object versions deleted");
        return Ok(());
    }

    match storage.delete_object(bucket, &key, None, force_destroy).await {
        Ok(()) => Ok(()),
        Err(e) if e.is_code(codes::NO_SUCH_BUCKET) || e.is_code(codes::NO_SUCH_KEY) => Ok(()),
        Err(e) => Err(ReconcileError::remote(resource, "delete object", e)),
    }
}

/// An existing object as returned by [`lookup`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectLookup {
    pub bucket: String,
    pub key: String,
    pub etag: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub content_length: i64,
    pub metadata: BTreeMap<String, String>,
    /// Body, only for textual content types.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

fn is_textual(content_type: Option<&str>) -> bool {
    content_type.is_some_and(|ct| {
        let ct = ct.trim().to_ascii_lowercase();
        ct.starts_with("text/") || ct.starts_with("application/json")
    })
}

/// Look up an existing object, optionally a specific version.
pub async fn lookup(
    ctx: &ReconcileContext,
    bucket: &str,
    key: &str,
    version_id: Option<&str>,
) -> Result<ObjectLookup, ReconcileError> {
    let resource = describe(bucket, key);
    let storage = ctx.storage(&resource)?;

    let head = storage
        .head_object(bucket, key, version_id)
        .await
        .map_err(|e| ReconcileError::remote(&resource, "head object", e))?;
    if head.delete_marker {
        return Err(ReconcileError::Invalid {
            resource,
            message: "the requested version is a delete marker".to_string(),
        });
    }

    let body = if is_textual(head.content_type.as_deref()) {
        let bytes = storage
            .get_object(bucket, key, version_id)
            .await
            .map_err(|e| ReconcileError::remote(&resource, "get object", e))?;
        Some(String::from_utf8_lossy(&bytes).into_owned())
    } else {
        None
    };

    Ok(ObjectLookup {
        bucket: bucket.to_string(),
        key: key.to_string(),
        etag: head.etag.trim_matches('"').to_string(),
        version_id: head.version_id,
        content_type: head.content_type,
        content_length: head.content_length,
        metadata: head.metadata,
        body,
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::Arc;

    use chrono::{Duration, Utc};

    use super::super::testing::context;
    use super::*;
    use crate::account::memory::MemoryAccountApi;
    use crate::errors::StorageError;
    use crate::storage::backend::ObjectStorage;
    use crate::storage::memory::{Call, MemoryStorage};
    use crate::tags::TagSet;

    fn spec(bucket: &str, key: &str, content: &str) -> ObjectSpec {
        ObjectSpec {
            bucket: bucket.into(),
            key: key.into(),
            content: Some(content.into()),
            source: None,
            content_type: Some("text/plain".into()),
            metadata: BTreeMap::new(),
            tags: TagSet::new(),
            lock_mode: None,
            lock_until: None,
            legal_hold: false,
            force_destroy: false,
        }
    }

    async fn setup(object_lock: bool) -> (Arc<MemoryStorage>, ReconcileContext) {
        let storage = Arc::new(MemoryStorage::new());
        storage.create_bucket("b1", object_lock).await.unwrap();
        let ctx = context(&storage, &Arc::new(MemoryAccountApi::new()));
        storage.clear_journal();
        (storage, ctx)
    }

    #[test]
    fn test_clean_key() {
        assert_eq!(clean_key("/a//b"), "a/b");
        assert_eq!(clean_key("a/b"), "a/b");
        assert_eq!(clean_key("//dir//"), "dir/");
    }

    #[test]
    fn test_textual_content_types() {
        assert!(is_textual(Some("text/plain; charset=utf-8")));
        assert!(is_textual(Some("application/json")));
        assert!(!is_textual(Some("application/octet-stream")));
        assert!(!is_textual(None));
    }

    #[tokio::test]
    async fn test_create_uploads_tags_with_the_body() {
        let (storage, ctx) = setup(false).await;
        let mut desired = spec("b1", "hello.txt", "hello");
        desired.tags = [("env".to_string(), "dev".to_string())].into();
        desired.metadata = [("owner".to_string(), "ops".to_string())].into();

        let observed = create(&ctx, &desired).await.unwrap();
        assert_eq!(storage.count(Call::PutObject), 1);
        assert_eq!(storage.count(Call::PutObjectTagging), 0);
        assert_eq!(observed.etag, "5d41402abc4b2a76b9719d911017c592");
        assert_eq!(observed.tags, desired.tags);
        assert_eq!(observed.metadata, desired.metadata);
        assert_eq!(observed.content_length, 5);
    }

    #[tokio::test]
    async fn test_create_waits_for_missing_bucket() {
        let (storage, ctx) = setup(false).await;
        storage.fail_next(Call::PutObject, StorageError::no_such_bucket("b1"));
        create(&ctx, &spec("b1", "k", "x")).await.unwrap();
        assert_eq!(storage.count(Call::PutObject), 2);
    }

    #[tokio::test]
    async fn test_tag_only_change_does_not_reupload() {
        let (storage, ctx) = setup(false).await;
        let mut desired = spec("b1", "k", "body");
        let observed = create(&ctx, &desired).await.unwrap();
        storage.clear_journal();

        desired.tags = [("a".to_string(), "1".to_string())].into();
        let updated = update(&ctx, &desired, &observed).await.unwrap();
        assert_eq!(storage.count(Call::PutObject), 0);
        assert_eq!(storage.count(Call::PutObjectTagging), 1);
        assert_eq!(updated.tags, desired.tags);
    }

    #[tokio::test]
    async fn test_content_change_reuploads() {
        let (storage, ctx) = setup(false).await;
        let observed = create(&ctx, &spec("b1", "k", "one")).await.unwrap();
        storage.clear_journal();

        let updated = update(&ctx, &spec("b1", "k", "two"), &observed).await.unwrap();
        assert_eq!(storage.count(Call::PutObject), 1);
        assert_ne!(updated.etag, observed.etag);

        storage.clear_journal();
        let same = update(&ctx, &spec("b1", "k", "two"), &updated).await.unwrap();
        assert_eq!(same, updated);
        assert!(storage.journal().is_empty());
    }

    #[tokio::test]
    async fn test_source_file_body() {
        let (_, ctx) = setup(false).await;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "from disk").unwrap();

        let mut desired = spec("b1", "k", "");
        desired.content = None;
        desired.source = Some(file.path().display().to_string());
        let observed = create(&ctx, &desired).await.unwrap();
        assert_eq!(observed.content_length, 9);

        desired.source = Some("/nonexistent/storeconverge/source".into());
        let err = update(&ctx, &desired, &observed).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Source { .. }), "{err}");
    }

    #[tokio::test]
    async fn test_refresh_of_missing_object_is_gone() {
        let (_, ctx) = setup(false).await;
        let outcome = read(&ctx, "b1", "absent", ReadPass::Refresh).await.unwrap();
        assert_eq!(outcome, ReadOutcome::Gone);
    }

    #[tokio::test]
    async fn test_lock_fields_round_trip_and_hold_release() {
        let (storage, ctx) = setup(true).await;
        let until = Utc::now() + Duration::days(1);
        let mut desired = spec("b1", "locked.txt", "keep");
        desired.lock_mode = Some(LockMode::Governance);
        desired.lock_until = Some(until);
        desired.legal_hold = true;

        let observed = create(&ctx, &desired).await.unwrap();
        assert_eq!(observed.lock_mode, Some(LockMode::Governance));
        assert_eq!(observed.lock_until, Some(until));
        assert!(observed.legal_hold);
        assert!(observed.version_id.is_some());

        storage.clear_journal();
        desired.legal_hold = false;
        let updated = update(&ctx, &desired, &observed).await.unwrap();
        assert!(!updated.legal_hold);
        assert_eq!(storage.count(Call::PutObjectLegalHold), 1);
        assert_eq!(storage.count(Call::PutObjectRetention), 0);
        assert_eq!(storage.count(Call::PutObject), 0);
    }

    #[tokio::test]
    async fn test_versioned_delete_removes_every_version_of_the_key() {
        let (storage, ctx) = setup(true).await;
        let first = create(&ctx, &spec("b1", "a/b", "v1")).await.unwrap();
        update(&ctx, &spec("b1", "a/b", "v2"), &first).await.unwrap();
        create(&ctx, &spec("b1", "other", "x")).await.unwrap();
        assert_eq!(storage.entry_count("b1").await, 3);

        delete(&ctx, "b1", "/a//b", first.version_id.as_deref(), false)
            .await
            .unwrap();
        assert_eq!(storage.entry_count("b1").await, 1);
    }

    #[tokio::test]
    async fn test_unversioned_delete_tolerates_missing_key() {
        let (storage, ctx) = setup(false).await;
        let observed = create(&ctx, &spec("b1", "k", "x")).await.unwrap();
        delete(&ctx, "b1", "k", observed.version_id.as_deref(), false).await.unwrap();
        delete(&ctx, "b1", "k", None, false).await.unwrap();
        assert_eq!(storage.entry_count("b1").await, 0);
    }

    #[tokio::test]
    async fn test_lookup_returns_text_body_only() {
        let (_, ctx) = setup(false).await;
        create(&ctx, &spec("b1", "notes.txt", "remember")).await.unwrap();
        let mut binary = spec("b1", "blob", "\u{1}\u{2}");
        binary.content_type = Some("application/octet-stream".into());
        create(&ctx, &binary).await.unwrap();

        let text = lookup(&ctx, "b1", "notes.txt", None).await.unwrap();
        assert_eq!(text.body.as_deref(), Some("remember"));
        let blob = lookup(&ctx, "b1", "blob", None).await.unwrap();
        assert_eq!(blob.body, None);
    }

    #[tokio::test]
    async fn test_lookup_rejects_delete_marker() {
        let (storage, ctx) = setup(true).await;
        create(&ctx, &spec("b1", "k", "x")).await.unwrap();
        storage.delete_object("b1", "k", None, false).await.unwrap();
        let page = storage.list_object_versions("b1", None, None, None).await.unwrap();
        let marker = page.delete_markers[0].version_id.clone();

        let err = lookup(&ctx, "b1", "k", Some(&marker)).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Invalid { .. }), "{err}");
    }
}
