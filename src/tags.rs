//! Tag-set reconciliation.
//!
//! The backend only offers bulk tagging calls, so convergence is a single
//! replace-all or a single delete-all, never a per-key diff.

use std::collections::BTreeMap;

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use tracing::debug;

use crate::classify::ClassifyMode;
use crate::errors::{codes, StorageError};
use crate::retry::{retry_when_codes, CancelFlag, RetryError, RetryPolicy};
use crate::storage::backend::{ObjectStorage, StorageResult};

/// Tag key to tag value.  Keys are case-sensitive and unique.
pub type TagSet = BTreeMap<String, String>;

/// Characters left unescaped in a tag query (RFC 3986 unreserved).
const TAG_QUERY: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// What carries the tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagTarget<'a> {
    /// A bucket.
    Bucket(&'a str),
    /// An object (its current version).
    Object {
        /// Containing bucket.
        bucket: &'a str,
        /// Object key.
        key: &'a str,
    },
}

impl TagTarget<'_> {
    /// Codes tolerated while the target may still be propagating.
    fn propagation_codes(&self) -> &'static [&'static str] {
        match self {
            TagTarget::Bucket(_) => &[codes::NO_SUCH_BUCKET],
            TagTarget::Object { .. } => &[codes::NO_SUCH_BUCKET, codes::NO_SUCH_KEY],
        }
    }
}

/// The remote call a reconciliation needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagChange {
    /// Replace every tag with the new set.
    Replace,
    /// Delete every tag.
    Clear,
    /// Nothing to do.
    Unchanged,
}

/// Decide the single call that converges `old` to `new`.
pub fn plan(old: &TagSet, new: &TagSet) -> TagChange {
    if !new.is_empty() {
        TagChange::Replace
    } else if !old.is_empty() {
        TagChange::Clear
    } else {
        TagChange::Unchanged
    }
}

/// Converge the remote tag set from `old` to `new`.
///
/// Each call is retried while the target is not yet visible.  Any other
/// error is returned as soon as it occurs.
pub async fn reconcile_tags(
    storage: &dyn ObjectStorage,
    policy: &RetryPolicy,
    cancel: &CancelFlag,
    target: TagTarget<'_>,
    old: &TagSet,
    new: &TagSet,
) -> Result<TagChange, RetryError<StorageError>> {
    let change = plan(old, new);
    let tolerated = target.propagation_codes();

    match change {
        TagChange::Replace => {
            debug!(?target, count = new.len(), "replacing tags");
            retry_when_codes(policy, cancel, ClassifyMode::Strict, tolerated, || async move {
                match target {
                    TagTarget::Bucket(bucket) => storage.put_bucket_tagging(bucket, new).await,
                    TagTarget::Object { bucket, key } => {
                        storage.put_object_tagging(bucket, key, new).await
                    }
                }
            })
            .await?;
        }
        TagChange::Clear => {
            debug!(?target, "deleting all tags");
            retry_when_codes(policy, cancel, ClassifyMode::Strict, tolerated, || async move {
                match target {
                    TagTarget::Bucket(bucket) => storage.delete_bucket_tagging(bucket).await,
                    TagTarget::Object { bucket, key } => {
                        storage.delete_object_tagging(bucket, key).await
                    }
                }
            })
            .await?;
        }
        TagChange::Unchanged => {}
    }

    Ok(change)
}

/// Read the remote tag set.  A missing tag set reads as empty.
pub async fn read_tags(storage: &dyn ObjectStorage, target: TagTarget<'_>) -> StorageResult<TagSet> {
    let result = match target {
        TagTarget::Bucket(bucket) => storage.get_bucket_tagging(bucket).await,
        TagTarget::Object { bucket, key } => storage.get_object_tagging(bucket, key).await,
    };
    match result {
        Err(err) if err.is_code(codes::NO_SUCH_TAG_SET) => Ok(TagSet::new()),
        other => other,
    }
}

/// Encode tags as the URL query used by the upload tagging header.
pub fn encode_tag_query(tags: &TagSet) -> String {
    tags.iter()
        .map(|(k, v)| {
            format!(
                "{}={}",
                utf8_percent_encode(k, TAG_QUERY),
                utf8_percent_encode(v, TAG_QUERY)
            )
        })
        .collect::<Vec<_>>()
        .join("&")
}

/// Decode a tag query produced by [`encode_tag_query`].
pub fn decode_tag_query(query: &str) -> TagSet {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            (
                percent_encoding::percent_decode_str(k).decode_utf8_lossy().into_owned(),
                percent_encoding::percent_decode_str(v).decode_utf8_lossy().into_owned(),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::{Call, MemoryStorage};
    use std::time::Duration;

    fn tags(pairs: &[(&str, &str)]) -> TagSet {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn fast() -> RetryPolicy {
        RetryPolicy::new(Duration::from_secs(2)).with_delays(Duration::from_millis(1), Duration::from_millis(5))
    }

    #[test]
    fn test_plan_non_empty_new_always_replaces() {
        assert_eq!(plan(&TagSet::new(), &tags(&[("a", "1")])), TagChange::Replace);
        assert_eq!(plan(&tags(&[("a", "1")]), &tags(&[("a", "1")])), TagChange::Replace);
        assert_eq!(plan(&tags(&[("b", "2")]), &tags(&[("a", "1")])), TagChange::Replace);
    }

    #[test]
    fn test_plan_empty_new() {
        assert_eq!(plan(&tags(&[("a", "1")]), &TagSet::new()), TagChange::Clear);
        assert_eq!(plan(&TagSet::new(), &TagSet::new()), TagChange::Unchanged);
    }

    #[tokio::test]
    async fn test_replace_issues_exactly_one_put() {
        let storage = MemoryStorage::new();
        storage.create_bucket("b1", false).await.unwrap();
        storage.clear_journal();

        let new = tags(&[("k1", "v1"), ("k2", "v2")]);
        let change = reconcile_tags(
            &storage,
            &fast(),
            &CancelFlag::new(),
            TagTarget::Bucket("b1"),
            &tags(&[("old", "x")]),
            &new,
        )
        .await
        .unwrap();

        assert_eq!(change, TagChange::Replace);
        assert_eq!(storage.count(Call::PutBucketTagging), 1);
        assert_eq!(storage.count(Call::DeleteBucketTagging), 0);
        assert_eq!(storage.get_bucket_tagging("b1").await.unwrap(), new);
    }

    #[tokio::test]
    async fn test_clear_issues_exactly_one_delete() {
        let storage = MemoryStorage::new();
        storage.create_bucket("b1", false).await.unwrap();
        storage.put_bucket_tagging("b1", &tags(&[("k1", "v1")])).await.unwrap();
        storage.clear_journal();

        let change = reconcile_tags(
            &storage,
            &fast(),
            &CancelFlag::new(),
            TagTarget::Bucket("b1"),
            &tags(&[("k1", "v1")]),
            &TagSet::new(),
        )
        .await
        .unwrap();

        assert_eq!(change, TagChange::Clear);
        assert_eq!(storage.count(Call::DeleteBucketTagging), 1);
        assert_eq!(storage.count(Call::PutBucketTagging), 0);
        assert!(read_tags(&storage, TagTarget::Bucket("b1")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_both_empty_makes_no_call() {
        let storage = MemoryStorage::new();
        let change = reconcile_tags(
            &storage,
            &fast(),
            &CancelFlag::new(),
            TagTarget::Bucket("missing"),
            &TagSet::new(),
            &TagSet::new(),
        )
        .await
        .unwrap();
        assert_eq!(change, TagChange::Unchanged);
        assert!(storage.journal().is_empty());
    }

    #[tokio::test]
    async fn test_retries_while_bucket_propagates() {
        let storage = MemoryStorage::new();
        storage.create_bucket("b1", false).await.unwrap();
        storage.fail_next(Call::PutBucketTagging, StorageError::no_such_bucket("b1"));

        reconcile_tags(
            &storage,
            &fast(),
            &CancelFlag::new(),
            TagTarget::Bucket("b1"),
            &TagSet::new(),
            &tags(&[("k", "v")]),
        )
        .await
        .unwrap();
        assert_eq!(storage.count(Call::PutBucketTagging), 2);
    }

    #[tokio::test]
    async fn test_terminal_error_surfaces_immediately() {
        let storage = MemoryStorage::new();
        storage.create_bucket("b1", false).await.unwrap();
        storage.fail_next(Call::PutBucketTagging, StorageError::access_denied("nope"));

        let err = reconcile_tags(
            &storage,
            &fast(),
            &CancelFlag::new(),
            TagTarget::Bucket("b1"),
            &TagSet::new(),
            &tags(&[("k", "v")]),
        )
        .await
        .unwrap_err();
        assert!(err.inner().unwrap().is_code(codes::ACCESS_DENIED));
        assert_eq!(storage.count(Call::PutBucketTagging), 1);
    }

    #[tokio::test]
    async fn test_object_tags_round_trip() {
        let storage = MemoryStorage::new();
        storage.create_bucket("b1", false).await.unwrap();
        storage
            .put_object(crate::storage::backend::PutObjectRequest {
                bucket: "b1".into(),
                key: "k".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let target = TagTarget::Object { bucket: "b1", key: "k" };
        let new = tags(&[("env", "prod")]);
        reconcile_tags(&storage, &fast(), &CancelFlag::new(), target, &TagSet::new(), &new)
            .await
            .unwrap();
        assert_eq!(read_tags(&storage, target).await.unwrap(), new);
    }

    #[test]
    fn test_encode_tag_query_escapes_reserved() {
        let encoded = encode_tag_query(&tags(&[("a b", "x&y"), ("k", "v=1")]));
        assert_eq!(encoded, "a%20b=x%26y&k=v%3D1");
        assert_eq!(
            decode_tag_query(&encoded),
            tags(&[("a b", "x&y"), ("k", "v=1")])
        );
    }
}
