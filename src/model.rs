//! Desired and observed resource records.
//!
//! A [`DesiredState`] comes from the manifest and is validated at the
//! boundary with `garde` plus a few cross-field checks before any remote
//! call is made.  An [`ObservedState`] is built from a full Read and always
//! replaces the previous one wholesale.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};

use crate::account::api::PermissionType;
use crate::storage::backend::{ContentHeaders, CopyConditions, Directive, LockMode};
use crate::tags::TagSet;

/// Longest service-account name the account API accepts.
pub const MAX_SERVICE_ACCOUNT_NAME: usize = 128;

// -- Desired state -------------------------------------------------------------

/// Desired bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct BucketSpec {
    /// Bucket name: 3-63 lowercase alphanumeric characters, dots, and hyphens.
    #[garde(length(min = 3, max = 63), pattern(r"^[a-z0-9][a-z0-9.\-]*[a-z0-9]$"))]
    pub name: String,

    /// Create with object lock (and therefore versioning).
    #[serde(default)]
    #[garde(skip)]
    pub object_lock: bool,

    /// Empty the bucket, locked versions included, when deleting it.
    #[serde(default)]
    #[garde(skip)]
    pub force_destroy: bool,

    #[serde(default)]
    #[garde(skip)]
    pub tags: TagSet,
}

/// Desired object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct ObjectSpec {
    #[garde(length(min = 3, max = 63), pattern(r"^[a-z0-9][a-z0-9.\-]*[a-z0-9]$"))]
    pub bucket: String,

    #[garde(length(min = 1, max = 1024))]
    pub key: String,

    /// Inline body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[garde(skip)]
    pub content: Option<String>,

    /// Path of a file holding the body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[garde(skip)]
    pub source: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[garde(skip)]
    pub content_type: Option<String>,

    /// User metadata.  Keys must be lowercase.
    #[serde(default)]
    #[garde(custom(lowercase_keys))]
    pub metadata: BTreeMap<String, String>,

    #[serde(default)]
    #[garde(skip)]
    pub tags: TagSet,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[garde(skip)]
    pub lock_mode: Option<LockMode>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[garde(skip)]
    pub lock_until: Option<DateTime<Utc>>,

    #[serde(default)]
    #[garde(skip)]
    pub legal_hold: bool,

    /// Delete every version of the key, bypassing locks, when deleting.
    #[serde(default)]
    #[garde(skip)]
    pub force_destroy: bool,
}

/// Where a copy reads from: `bucket/key`, optionally `?versionId=...`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopySource {
    pub bucket: String,
    pub key: String,
    pub version_id: Option<String>,
}

impl CopySource {
    /// Parse `bucket/key[?versionId=v]`.  A leading `/` is ignored.
    pub fn parse(raw: &str) -> Option<Self> {
        let (path, version_id) = match raw.split_once("?versionId=") {
            Some((path, version)) if !version.is_empty() => (path, Some(version.to_string())),
            Some(_) => return None,
            None => (raw, None),
        };
        let (bucket, key) = path.trim_start_matches('/').split_once('/')?;
        if bucket.is_empty() || key.is_empty() {
            return None;
        }
        Some(Self {
            bucket: bucket.to_string(),
            key: key.to_string(),
            version_id,
        })
    }
}

/// Desired server-side copy of an existing object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct ObjectCopySpec {
    #[garde(length(min = 3, max = 63), pattern(r"^[a-z0-9][a-z0-9.\-]*[a-z0-9]$"))]
    pub bucket: String,

    #[garde(length(min = 1, max = 1024))]
    pub key: String,

    /// `bucket/key` of the object to copy, optionally `?versionId=...`.
    #[garde(custom(copy_source))]
    pub source: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[garde(skip)]
    pub content_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[garde(skip)]
    pub cache_control: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[garde(skip)]
    pub content_disposition: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[garde(skip)]
    pub content_encoding: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[garde(skip)]
    pub content_language: Option<String>,

    #[serde(default)]
    #[garde(custom(lowercase_keys))]
    pub metadata: BTreeMap<String, String>,

    /// `COPY` (the default) keeps the source's content type, headers and
    /// metadata; `REPLACE` applies the ones above.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[garde(skip)]
    pub metadata_directive: Option<Directive>,

    #[serde(default)]
    #[garde(skip)]
    pub tags: TagSet,

    /// `COPY` (the default) keeps the source's tags; `REPLACE` applies `tags`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[garde(skip)]
    pub tagging_directive: Option<Directive>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[garde(skip)]
    pub copy_if_match: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[garde(skip)]
    pub copy_if_none_match: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[garde(skip)]
    pub copy_if_modified_since: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[garde(skip)]
    pub copy_if_unmodified_since: Option<DateTime<Utc>>,

    #[serde(default)]
    #[garde(skip)]
    pub force_destroy: bool,
}

impl ObjectCopySpec {
    pub fn headers(&self) -> ContentHeaders {
        ContentHeaders {
            cache_control: self.cache_control.clone(),
            content_disposition: self.content_disposition.clone(),
            content_encoding: self.content_encoding.clone(),
            content_language: self.content_language.clone(),
        }
    }

    pub fn conditions(&self) -> CopyConditions {
        CopyConditions {
            if_match: self.copy_if_match.clone(),
            if_none_match: self.copy_if_none_match.clone(),
            if_modified_since: self.copy_if_modified_since,
            if_unmodified_since: self.copy_if_unmodified_since,
        }
    }
}

/// What a permission may do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Actions {
    AllOperations,
    ReadOnly,
    WriteOnly,
}

impl Actions {
    /// Wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Actions::AllOperations => "all-operations",
            Actions::ReadOnly => "read-only",
            Actions::WriteOnly => "write-only",
        }
    }
}

/// Which buckets a permission covers.  Exactly one scope per permission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "snake_case")]
pub enum PermissionScope {
    /// Every bucket in the account.
    AllBuckets,
    /// Buckets whose names start with the prefix.
    BucketPrefix(#[garde(length(min = 1))] String),
    /// The listed buckets.
    Buckets(#[garde(length(min = 1))] Vec<String>),
    /// A JSON access policy document.
    Policy(#[garde(length(min = 2))] String),
}

impl PermissionScope {
    /// The permission type the account API records for this scope.
    pub fn kind(&self) -> PermissionType {
        match self {
            PermissionScope::AllBuckets => PermissionType::AllBuckets,
            PermissionScope::BucketPrefix(_) => PermissionType::BucketPrefix,
            PermissionScope::Buckets(_) => PermissionType::BucketNames,
            PermissionScope::Policy(_) => PermissionType::Policy,
        }
    }
}

/// Desired permission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct PermissionSpec {
    /// Exact name.  Conflicts with `name_prefix`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[garde(length(min = 1))]
    pub name: Option<String>,

    /// Generate a unique name starting with this prefix.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[garde(length(min = 1))]
    pub name_prefix: Option<String>,

    #[serde(default)]
    #[garde(skip)]
    pub description: String,

    #[garde(skip)]
    pub actions: Actions,

    #[garde(dive)]
    pub scope: PermissionScope,
}

/// Desired service account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct ServiceAccountSpec {
    #[garde(length(min = 1, max = 128))]
    pub name: String,

    #[serde(default)]
    #[garde(skip)]
    pub description: String,

    /// Permission ids.
    #[garde(length(min = 1))]
    pub permissions: Vec<String>,

    #[serde(default = "default_true")]
    #[garde(skip)]
    pub enabled: bool,
}

/// A desired resource of any kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DesiredState {
    Bucket(#[garde(dive)] BucketSpec),
    Object(#[garde(dive)] ObjectSpec),
    ObjectCopy(#[garde(dive)] ObjectCopySpec),
    Permission(#[garde(dive)] PermissionSpec),
    ServiceAccount(#[garde(dive)] ServiceAccountSpec),
}

impl DesiredState {
    /// Resource kind label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            DesiredState::Bucket(_) => "bucket",
            DesiredState::Object(_) => "object",
            DesiredState::ObjectCopy(_) => "object_copy",
            DesiredState::Permission(_) => "permission",
            DesiredState::ServiceAccount(_) => "service_account",
        }
    }

    /// Human-readable resource description, e.g. `bucket (photos)`.
    pub fn describe(&self) -> String {
        match self {
            DesiredState::Bucket(b) => format!("bucket ({})", b.name),
            DesiredState::Object(o) => format!("object ({}/{})", o.bucket, o.key),
            DesiredState::ObjectCopy(c) => format!("object copy ({}/{})", c.bucket, c.key),
            DesiredState::Permission(p) => format!(
                "permission ({})",
                p.name.as_deref().or(p.name_prefix.as_deref()).unwrap_or("generated")
            ),
            DesiredState::ServiceAccount(s) => format!("service account ({})", s.name),
        }
    }

    /// Run the `garde` rules and the cross-field checks they cannot express.
    pub fn check(&self) -> Result<(), String> {
        self.validate().map_err(|report| report.to_string())?;
        match self {
            DesiredState::Object(o) => {
                if o.content.is_some() && o.source.is_some() {
                    return Err("content and source are mutually exclusive".into());
                }
                if o.lock_mode.is_some() != o.lock_until.is_some() {
                    return Err("lock_mode and lock_until must be set together".into());
                }
            }
            DesiredState::Permission(p) => {
                if p.name.is_some() && p.name_prefix.is_some() {
                    return Err("name and name_prefix are mutually exclusive".into());
                }
            }
            DesiredState::Bucket(_) | DesiredState::ObjectCopy(_) | DesiredState::ServiceAccount(_) => {}
        }
        Ok(())
    }
}

fn lowercase_keys(value: &BTreeMap<String, String>, _ctx: &()) -> garde::Result {
    match value.keys().find(|k| **k != k.to_lowercase()) {
        Some(key) => Err(garde::Error::new(format!(
            "metadata must be lowercase only, offending key: {key:?}"
        ))),
        None => Ok(()),
    }
}

#[allow(clippy::ptr_arg)]
fn copy_source(value: &String, _ctx: &()) -> garde::Result {
    match CopySource::parse(value) {
        Some(_) => Ok(()),
        None => Err(garde::Error::new(format!(
            "source must look like bucket/key[?versionId=...], got {value:?}"
        ))),
    }
}

fn default_true() -> bool {
    true
}

// -- Observed state ------------------------------------------------------------

/// Observed bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BucketObserved {
    pub name: String,
    pub region: String,
    pub object_lock: bool,
    pub tags: TagSet,
}

/// Observed object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ObjectObserved {
    pub bucket: String,
    pub key: String,
    /// Entity tag without quotes.
    pub etag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub content_length: i64,
    /// User metadata, keys lower-cased.
    pub metadata: BTreeMap<String, String>,
    pub tags: TagSet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_mode: Option<LockMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_until: Option<DateTime<Utc>>,
    pub legal_hold: bool,
}

/// Observed object copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ObjectCopyObserved {
    pub bucket: String,
    pub key: String,
    /// Source the object was copied from.
    pub source: String,
    /// Entity tag without quotes.
    pub etag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_id: Option<String>,
    /// Only known from the copy response; carried forward afterwards.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_version_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default)]
    pub headers: ContentHeaders,
    /// User metadata, keys lower-cased.
    pub metadata: BTreeMap<String, String>,
    pub tags: TagSet,
    /// Current entity tag of the source, without quotes; `None` when the
    /// source no longer exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_etag: Option<String>,
}

/// Observed permission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PermissionObserved {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(rename = "type")]
    pub kind: PermissionType,
    pub actions: String,
    pub prefix: String,
    pub buckets: Vec<String>,
    /// Canonical policy document, empty unless the scope is a policy.
    pub policy: String,
    pub ready_state: bool,
}

/// Observed service account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ServiceAccountObserved {
    pub id: String,
    pub name: String,
    pub description: String,
    pub permissions: Vec<String>,
    pub enabled: bool,
    pub ready_state: bool,
    /// Only known from the create response; carried forward afterwards.
    pub access_key: String,
    pub secret: String,
}

/// An observed resource of any kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ObservedState {
    Bucket(BucketObserved),
    Object(ObjectObserved),
    ObjectCopy(ObjectCopyObserved),
    Permission(PermissionObserved),
    ServiceAccount(ServiceAccountObserved),
}

impl ObservedState {
    /// Resource kind label, matching [`DesiredState::kind`].
    pub fn kind(&self) -> &'static str {
        match self {
            ObservedState::Bucket(_) => "bucket",
            ObservedState::Object(_) => "object",
            ObservedState::ObjectCopy(_) => "object_copy",
            ObservedState::Permission(_) => "permission",
            ObservedState::ServiceAccount(_) => "service_account",
        }
    }
}
