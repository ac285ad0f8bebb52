//! Abstract object-storage API.
//!
//! Every object-storage client implements [`ObjectStorage`].  The trait
//! exposes exactly the calls the reconcilers and the destroyer need; every
//! failure is reported as a [`StorageError`] carrying the backend's code and
//! HTTP status so the classification table can act on it.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::StorageError;
use crate::tags::TagSet;

/// Result alias for object-storage calls.
pub type StorageResult<T> = Result<T, StorageError>;

/// Boxed future returned by every [`ObjectStorage`] call.
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = StorageResult<T>> + Send + 'a>>;

/// Object lock retention mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LockMode {
    /// Deletable by callers allowed to bypass governance retention.
    Governance,
    /// Not deletable by anyone until the retain-until date passes.
    Compliance,
}

impl LockMode {
    /// Wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            LockMode::Governance => "GOVERNANCE",
            LockMode::Compliance => "COMPLIANCE",
        }
    }

    /// Parse the wire representation (case-insensitive).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GOVERNANCE" => Some(LockMode::Governance),
            "COMPLIANCE" => Some(LockMode::Compliance),
            _ => None,
        }
    }
}

/// Retention applied to one object version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retention {
    /// Retention mode.
    pub mode: LockMode,
    /// Date until which the version is retained.
    pub until: DateTime<Utc>,
}

/// Parameters of a single-part upload.
#[derive(Debug, Clone, Default)]
pub struct PutObjectRequest {
    /// Target bucket.
    pub bucket: String,
    /// Target key.
    pub key: String,
    /// Object body.
    pub body: Bytes,
    /// `Content-Type` header.
    pub content_type: Option<String>,
    /// User metadata (`x-amz-meta-*`).
    pub metadata: BTreeMap<String, String>,
    /// URL-encoded tag query (`k1=v1&k2=v2`).
    pub tagging: Option<String>,
    /// Retention applied at upload.
    pub retention: Option<Retention>,
    /// Legal hold applied at upload.
    pub legal_hold: bool,
}

/// Standard content headers beyond `Content-Type`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentHeaders {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_disposition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_encoding: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_language: Option<String>,
}

impl ContentHeaders {
    /// Whether every header set here has the same value in `observed`.
    pub fn satisfied_by(&self, observed: &ContentHeaders) -> bool {
        let wanted = |want: &Option<String>, have: &Option<String>| want.is_none() || want == have;
        wanted(&self.cache_control, &observed.cache_control)
            && wanted(&self.content_disposition, &observed.content_disposition)
            && wanted(&self.content_encoding, &observed.content_encoding)
            && wanted(&self.content_language, &observed.content_language)
    }
}

/// Whether a copy keeps the source's metadata (or tags) or replaces them
/// with the ones in the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Directive {
    #[default]
    Copy,
    Replace,
}

impl Directive {
    /// Wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Directive::Copy => "COPY",
            Directive::Replace => "REPLACE",
        }
    }
}

/// Preconditions on the copy source.  A failed one rejects the copy with
/// `PreconditionFailed`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopyConditions {
    /// Copy only if the source ETag matches.
    pub if_match: Option<String>,
    /// Copy only if the source ETag differs.
    pub if_none_match: Option<String>,
    /// Copy only if the source changed after this instant.
    pub if_modified_since: Option<DateTime<Utc>>,
    /// Copy only if the source did not change after this instant.
    pub if_unmodified_since: Option<DateTime<Utc>>,
}

impl CopyConditions {
    /// Whether any precondition is set.
    pub fn is_empty(&self) -> bool {
        self.if_match.is_none()
            && self.if_none_match.is_none()
            && self.if_modified_since.is_none()
            && self.if_unmodified_since.is_none()
    }
}

/// Parameters of a server-side copy.
#[derive(Debug, Clone, Default)]
pub struct CopyObjectRequest {
    /// Target bucket.
    pub bucket: String,
    /// Target key.
    pub key: String,
    /// Source bucket.
    pub source_bucket: String,
    /// Source key.
    pub source_key: String,
    /// Source version; the current one when `None`.
    pub source_version_id: Option<String>,
    /// `Content-Type` applied under [`Directive::Replace`].
    pub content_type: Option<String>,
    /// Content headers applied under [`Directive::Replace`].
    pub headers: ContentHeaders,
    /// User metadata applied under [`Directive::Replace`].
    pub metadata: BTreeMap<String, String>,
    pub metadata_directive: Option<Directive>,
    /// URL-encoded tag query applied under [`Directive::Replace`].
    pub tagging: Option<String>,
    pub tagging_directive: Option<Directive>,
    pub conditions: CopyConditions,
}

/// Result of a successful copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyObjectOutput {
    /// Quoted entity tag of the new object.
    pub etag: String,
    /// When the copy was written.
    pub last_modified: Option<DateTime<Utc>>,
    /// Version id of the new object in a versioned bucket.
    pub version_id: Option<String>,
    /// Version of the source that was copied.
    pub source_version_id: Option<String>,
}

/// Result of a successful upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutObjectOutput {
    /// Quoted entity tag.
    pub etag: String,
    /// Version id assigned by a versioned bucket.
    pub version_id: Option<String>,
}

/// Metadata returned by a HEAD on an object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectHead {
    /// Quoted entity tag.
    pub etag: String,
    /// Version id, when the bucket is versioned.
    pub version_id: Option<String>,
    /// `Content-Type` header.
    pub content_type: Option<String>,
    /// Other content headers.
    pub headers: ContentHeaders,
    /// Body length in bytes.
    pub content_length: i64,
    /// Last write time.
    pub last_modified: Option<DateTime<Utc>>,
    /// User metadata, keys as returned by the backend.
    pub metadata: BTreeMap<String, String>,
    /// Active retention, if any.
    pub retention: Option<Retention>,
    /// Whether a legal hold is on.
    pub legal_hold: bool,
    /// Whether the addressed version is a delete marker.
    pub delete_marker: bool,
}

/// One entry from a version listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionEntry {
    /// Object key.
    pub key: String,
    /// Version id (`"null"` for unversioned objects).
    pub version_id: String,
    /// Whether this is the current version.
    pub is_latest: bool,
}

/// One page of `ListObjectVersions`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionPage {
    /// Live object versions.
    pub versions: Vec<VersionEntry>,
    /// Delete markers.
    pub delete_markers: Vec<VersionEntry>,
    /// Whether more entries follow.  An empty page may still be truncated.
    pub is_truncated: bool,
    /// Key marker for the next page.
    pub next_key_marker: Option<String>,
    /// Version-id marker for the next page.
    pub next_version_id_marker: Option<String>,
}

/// Async object-storage contract.
pub trait ObjectStorage: Send + Sync + 'static {
    /// Create a bucket, optionally with object lock (and thus versioning).
    fn create_bucket<'a>(&'a self, bucket: &'a str, object_lock: bool) -> StorageFuture<'a, ()>;

    /// Check that a bucket exists and is accessible.
    fn head_bucket<'a>(&'a self, bucket: &'a str) -> StorageFuture<'a, ()>;

    /// Region the bucket lives in.
    fn bucket_region<'a>(&'a self, bucket: &'a str) -> StorageFuture<'a, String>;

    /// Whether object lock is enabled on the bucket.
    fn bucket_object_lock<'a>(&'a self, bucket: &'a str) -> StorageFuture<'a, bool>;

    /// Delete an empty bucket.
    fn delete_bucket<'a>(&'a self, bucket: &'a str) -> StorageFuture<'a, ()>;

    /// Read the bucket tag set.  Fails with `NoSuchTagSet` when none is set.
    fn get_bucket_tagging<'a>(&'a self, bucket: &'a str) -> StorageFuture<'a, TagSet>;

    /// Replace the bucket tag set.
    fn put_bucket_tagging<'a>(&'a self, bucket: &'a str, tags: &'a TagSet) -> StorageFuture<'a, ()>;

    /// Remove every bucket tag.
    fn delete_bucket_tagging<'a>(&'a self, bucket: &'a str) -> StorageFuture<'a, ()>;

    /// Upload an object in a single request.
    fn put_object(&self, request: PutObjectRequest) -> StorageFuture<'_, PutObjectOutput>;

    /// Copy an object server-side.
    fn copy_object(&self, request: CopyObjectRequest) -> StorageFuture<'_, CopyObjectOutput>;

    /// HEAD an object, optionally a specific version.
    fn head_object<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        version_id: Option<&'a str>,
    ) -> StorageFuture<'a, ObjectHead>;

    /// Read an object body.
    fn get_object<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        version_id: Option<&'a str>,
    ) -> StorageFuture<'a, Bytes>;

    /// Delete an object (version).  `bypass_governance` lifts governance
    /// retention for callers allowed to do so.
    fn delete_object<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        version_id: Option<&'a str>,
        bypass_governance: bool,
    ) -> StorageFuture<'a, ()>;

    /// List object versions and delete markers, one page at a time.
    fn list_object_versions<'a>(
        &'a self,
        bucket: &'a str,
        prefix: Option<&'a str>,
        key_marker: Option<&'a str>,
        version_id_marker: Option<&'a str>,
    ) -> StorageFuture<'a, VersionPage>;

    /// Read an object's tag set.  Fails with `NoSuchTagSet` on some backends
    /// when none is set.
    fn get_object_tagging<'a>(&'a self, bucket: &'a str, key: &'a str) -> StorageFuture<'a, TagSet>;

    /// Replace an object's tag set.
    fn put_object_tagging<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        tags: &'a TagSet,
    ) -> StorageFuture<'a, ()>;

    /// Remove every tag from an object.
    fn delete_object_tagging<'a>(&'a self, bucket: &'a str, key: &'a str) -> StorageFuture<'a, ()>;

    /// Read an object's retention, `None` when no retention is set.
    fn get_object_retention<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        version_id: Option<&'a str>,
    ) -> StorageFuture<'a, Option<Retention>>;

    /// Set (or with `None`, clear) an object's retention.
    fn put_object_retention<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        version_id: Option<&'a str>,
        retention: Option<Retention>,
        bypass_governance: bool,
    ) -> StorageFuture<'a, ()>;

    /// Read an object version's legal hold status.
    fn get_object_legal_hold<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        version_id: Option<&'a str>,
    ) -> StorageFuture<'a, bool>;

    /// Turn an object version's legal hold on or off.
    fn put_object_legal_hold<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        version_id: Option<&'a str>,
        on: bool,
    ) -> StorageFuture<'a, ()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_mode_parse_is_case_insensitive() {
        assert_eq!(LockMode::parse("governance"), Some(LockMode::Governance));
        assert_eq!(LockMode::parse("COMPLIANCE"), Some(LockMode::Compliance));
        assert_eq!(LockMode::parse("none"), None);
    }

    #[test]
    fn test_content_headers_only_compare_requested_fields() {
        let wanted = ContentHeaders {
            cache_control: Some("no-cache".into()),
            ..Default::default()
        };
        let mut observed = ContentHeaders {
            cache_control: Some("no-cache".into()),
            content_language: Some("en".into()),
            ..Default::default()
        };
        assert!(wanted.satisfied_by(&observed));
        observed.cache_control = Some("max-age=60".into());
        assert!(!wanted.satisfied_by(&observed));
        assert!(ContentHeaders::default().satisfied_by(&observed));
    }

    #[test]
    fn test_directive_serde_uses_wire_names() {
        assert_eq!(serde_json::to_string(&Directive::Replace).unwrap(), "\"REPLACE\"");
        assert_eq!(Directive::default(), Directive::Copy);
    }

    #[test]
    fn test_lock_mode_serde_uses_wire_names() {
        let json = serde_json::to_string(&LockMode::Compliance).unwrap();
        assert_eq!(json, "\"COMPLIANCE\"");
        let back: LockMode = serde_json::from_str("\"GOVERNANCE\"").unwrap();
        assert_eq!(back, LockMode::Governance);
    }
}
