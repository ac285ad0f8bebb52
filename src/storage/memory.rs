//! In-memory object storage.
//!
//! Buckets and object versions are held in a `tokio::sync::RwLock<HashMap<...>>`.
//! Buckets created with object lock are versioned, and the store enforces
//! legal holds and retention on version deletes the way the real API does
//! (`AccessDenied`, 403).
//!
//! The store doubles as the test fake for everything above the storage
//! layer: every call is recorded in a journal, failures can be queued per
//! call kind, and version listings can be paged small or prefixed with
//! empty truncated pages.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use tracing::debug;

use super::backend::{
    ContentHeaders, CopyConditions, CopyObjectOutput, CopyObjectRequest, Directive, LockMode,
    ObjectHead, ObjectStorage, PutObjectOutput, PutObjectRequest, Retention, StorageFuture,
    StorageResult, VersionEntry, VersionPage,
};
use crate::errors::{codes, StorageError};
use crate::tags::TagSet;

/// Version id used by buckets without versioning.
const NULL_VERSION: &str = "null";

/// Default number of entries per version-listing page.
const DEFAULT_PAGE_SIZE: usize = 1000;

/// Kinds of calls recorded in the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Call {
    CreateBucket,
    HeadBucket,
    BucketRegion,
    BucketObjectLock,
    DeleteBucket,
    GetBucketTagging,
    PutBucketTagging,
    DeleteBucketTagging,
    PutObject,
    CopyObject,
    HeadObject,
    GetObject,
    DeleteObject,
    ListObjectVersions,
    GetObjectTagging,
    PutObjectTagging,
    DeleteObjectTagging,
    GetObjectRetention,
    PutObjectRetention,
    GetObjectLegalHold,
    PutObjectLegalHold,
}

#[derive(Debug, Clone)]
struct StoredVersion {
    version_id: String,
    body: Bytes,
    etag: String,
    content_type: Option<String>,
    headers: ContentHeaders,
    metadata: BTreeMap<String, String>,
    tags: TagSet,
    retention: Option<Retention>,
    legal_hold: bool,
    delete_marker: bool,
    last_modified: DateTime<Utc>,
}

impl StoredVersion {
    fn head(&self) -> ObjectHead {
        ObjectHead {
            etag: self.etag.clone(),
            version_id: (self.version_id != NULL_VERSION).then(|| self.version_id.clone()),
            content_type: self.content_type.clone(),
            headers: self.headers.clone(),
            content_length: self.body.len() as i64,
            last_modified: Some(self.last_modified),
            metadata: self.metadata.clone(),
            retention: self.retention,
            legal_hold: self.legal_hold,
            delete_marker: self.delete_marker,
        }
    }
}

#[derive(Debug, Default)]
struct StoredBucket {
    region: String,
    object_lock: bool,
    tags: Option<TagSet>,
    /// Key -> versions, oldest first.
    objects: BTreeMap<String, Vec<StoredVersion>>,
}

impl StoredBucket {
    fn versioned(&self) -> bool {
        self.object_lock
    }

    fn require_lock(&self) -> StorageResult<()> {
        if self.object_lock {
            Ok(())
        } else {
            Err(StorageError::new(
                "InvalidRequest",
                400,
                "Bucket is missing Object Lock Configuration",
            ))
        }
    }

    fn version_mut(
        &mut self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> StorageResult<&mut StoredVersion> {
        let versions = self
            .objects
            .get_mut(key)
            .ok_or_else(|| StorageError::no_such_key(bucket, key))?;
        let found = match version_id {
            Some(v) => versions.iter_mut().find(|sv| sv.version_id == v),
            None => versions.last_mut().filter(|sv| !sv.delete_marker),
        };
        found.ok_or_else(|| StorageError::no_such_key(bucket, key))
    }

    fn version(&self, bucket: &str, key: &str, version_id: Option<&str>) -> StorageResult<&StoredVersion> {
        let versions = self
            .objects
            .get(key)
            .ok_or_else(|| StorageError::no_such_key(bucket, key))?;
        let found = match version_id {
            Some(v) => versions.iter().find(|sv| sv.version_id == v),
            None => versions.last().filter(|sv| !sv.delete_marker),
        };
        found.ok_or_else(|| StorageError::no_such_key(bucket, key))
    }
}

/// In-memory [`ObjectStorage`] implementation.
pub struct MemoryStorage {
    /// Region reported for every bucket.
    region: String,
    /// Bucket name -> contents.
    buckets: tokio::sync::RwLock<HashMap<String, StoredBucket>>,
    /// Every call in arrival order.
    journal: Mutex<Vec<Call>>,
    /// Queued failures, returned before the call is executed.
    failures: Mutex<HashMap<Call, VecDeque<StorageError>>>,
    /// Entries per version-listing page.
    page_size: AtomicUsize,
    /// Empty truncated pages to return before real listings.
    empty_pages: AtomicUsize,
    /// Monotonic version id source.
    next_version: AtomicU64,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    /// An empty store in `us-east-1`.
    pub fn new() -> Self {
        Self::with_region("us-east-1")
    }

    /// An empty store whose buckets report `region`.
    pub fn with_region(region: &str) -> Self {
        Self {
            region: region.to_string(),
            buckets: tokio::sync::RwLock::new(HashMap::new()),
            journal: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            page_size: AtomicUsize::new(DEFAULT_PAGE_SIZE),
            empty_pages: AtomicUsize::new(0),
            next_version: AtomicU64::new(1),
        }
    }

    /// Compute the quoted MD5-hex ETag for a byte slice.
    fn compute_etag(data: &[u8]) -> String {
        let mut hasher = Md5::new();
        hasher.update(data);
        format!("\"{}\"", hex::encode(hasher.finalize()))
    }

    fn new_version_id(&self) -> String {
        format!("{:020}", self.next_version.fetch_add(1, Ordering::SeqCst))
    }

    // ── Test hooks ─────────────────────────────────────────────────

    /// Limit version-listing pages to `size` entries.
    pub fn set_page_size(&self, size: usize) {
        self.page_size.store(size.max(1), Ordering::SeqCst);
    }

    /// Return `count` empty but truncated listing pages before real ones.
    pub fn inject_empty_pages(&self, count: usize) {
        self.empty_pages.store(count, Ordering::SeqCst);
    }

    /// Make the next `call` fail with `err` before touching any state.
    pub fn fail_next(&self, call: Call, err: StorageError) {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        failures.entry(call).or_default().push_back(err);
    }

    /// Snapshot of every call made so far.
    pub fn journal(&self) -> Vec<Call> {
        self.journal.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of times `call` was made.
    pub fn count(&self, call: Call) -> usize {
        self.journal
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|c| **c == call)
            .count()
    }

    /// Forget recorded calls.
    pub fn clear_journal(&self) {
        self.journal.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Number of stored versions and delete markers in `bucket`.
    pub async fn entry_count(&self, bucket: &str) -> usize {
        let buckets = self.buckets.read().await;
        buckets
            .get(bucket)
            .map(|b| b.objects.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    /// Whether `bucket` exists.
    pub async fn bucket_exists(&self, bucket: &str) -> bool {
        self.buckets.read().await.contains_key(bucket)
    }

    /// Record `call` and return any queued failure for it.
    fn enter(&self, call: Call) -> StorageResult<()> {
        self.journal.lock().unwrap_or_else(|e| e.into_inner()).push(call);
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        match failures.get_mut(&call).and_then(VecDeque::pop_front) {
            Some(err) => {
                debug!(?call, error = %err, "injected failure");
                Err(err)
            }
            None => Ok(()),
        }
    }
}

/// Whether `retention` still protects a version at the current time.
fn retention_active(retention: Option<Retention>) -> Option<LockMode> {
    retention.filter(|r| r.until > Utc::now()).map(|r| r.mode)
}

/// Check copy preconditions against the source version.
fn check_conditions(source: &StoredVersion, conditions: &CopyConditions) -> StorageResult<()> {
    let etag = source.etag.trim_matches('"');
    let failed = conditions.if_match.as_deref().is_some_and(|m| m.trim_matches('"') != etag)
        || conditions.if_none_match.as_deref().is_some_and(|m| m.trim_matches('"') == etag)
        || conditions.if_modified_since.is_some_and(|t| source.last_modified <= t)
        || conditions.if_unmodified_since.is_some_and(|t| source.last_modified > t);
    if failed {
        return Err(StorageError::new(
            codes::PRECONDITION_FAILED,
            412,
            "At least one of the pre-conditions you specified did not hold",
        ));
    }
    Ok(())
}

/// Whether `(key, version)` sorts after the listing position
/// `(key_marker, version_marker)`.  Versions sort newest first.
fn after_marker(key: &str, version: &str, key_marker: Option<&str>, version_marker: Option<&str>) -> bool {
    match (key_marker, version_marker) {
        (None, _) => true,
        (Some(km), None) => key > km,
        (Some(km), Some(vm)) => key > km || (key == km && version < vm),
    }
}

impl ObjectStorage for MemoryStorage {
    fn create_bucket<'a>(&'a self, bucket: &'a str, object_lock: bool) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            self.enter(Call::CreateBucket)?;
            let mut buckets = self.buckets.write().await;
            if buckets.contains_key(bucket) {
                return Err(StorageError::new(
                    codes::BUCKET_ALREADY_OWNED_BY_YOU,
                    409,
                    format!("Your previous request to create the named bucket succeeded: {bucket}"),
                ));
            }
            buckets.insert(
                bucket.to_string(),
                StoredBucket {
                    region: self.region.clone(),
                    object_lock,
                    ..Default::default()
                },
            );
            Ok(())
        })
    }

    fn head_bucket<'a>(&'a self, bucket: &'a str) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            self.enter(Call::HeadBucket)?;
            if self.buckets.read().await.contains_key(bucket) {
                Ok(())
            } else {
                Err(StorageError::new(codes::NOT_FOUND, 404, "Not Found"))
            }
        })
    }

    fn bucket_region<'a>(&'a self, bucket: &'a str) -> StorageFuture<'a, String> {
        Box::pin(async move {
            self.enter(Call::BucketRegion)?;
            let buckets = self.buckets.read().await;
            buckets
                .get(bucket)
                .map(|b| b.region.clone())
                .ok_or_else(|| StorageError::new(codes::NOT_FOUND, 404, "Not Found"))
        })
    }

    fn bucket_object_lock<'a>(&'a self, bucket: &'a str) -> StorageFuture<'a, bool> {
        Box::pin(async move {
            self.enter(Call::BucketObjectLock)?;
            let buckets = self.buckets.read().await;
            buckets
                .get(bucket)
                .map(|b| b.object_lock)
                .ok_or_else(|| StorageError::no_such_bucket(bucket))
        })
    }

    fn delete_bucket<'a>(&'a self, bucket: &'a str) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            self.enter(Call::DeleteBucket)?;
            let mut buckets = self.buckets.write().await;
            let stored = buckets
                .get(bucket)
                .ok_or_else(|| StorageError::no_such_bucket(bucket))?;
            if !stored.objects.is_empty() {
                return Err(StorageError::new(
                    codes::BUCKET_NOT_EMPTY,
                    409,
                    "The bucket you tried to delete is not empty",
                ));
            }
            buckets.remove(bucket);
            Ok(())
        })
    }

    fn get_bucket_tagging<'a>(&'a self, bucket: &'a str) -> StorageFuture<'a, TagSet> {
        Box::pin(async move {
            self.enter(Call::GetBucketTagging)?;
            let buckets = self.buckets.read().await;
            let stored = buckets
                .get(bucket)
                .ok_or_else(|| StorageError::no_such_bucket(bucket))?;
            match &stored.tags {
                Some(tags) if !tags.is_empty() => Ok(tags.clone()),
                _ => Err(StorageError::new(
                    codes::NO_SUCH_TAG_SET,
                    404,
                    "The TagSet does not exist",
                )),
            }
        })
    }

    fn put_bucket_tagging<'a>(&'a self, bucket: &'a str, tags: &'a TagSet) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            self.enter(Call::PutBucketTagging)?;
            let mut buckets = self.buckets.write().await;
            let stored = buckets
                .get_mut(bucket)
                .ok_or_else(|| StorageError::no_such_bucket(bucket))?;
            stored.tags = Some(tags.clone());
            Ok(())
        })
    }

    fn delete_bucket_tagging<'a>(&'a self, bucket: &'a str) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            self.enter(Call::DeleteBucketTagging)?;
            let mut buckets = self.buckets.write().await;
            let stored = buckets
                .get_mut(bucket)
                .ok_or_else(|| StorageError::no_such_bucket(bucket))?;
            stored.tags = None;
            Ok(())
        })
    }

    fn put_object(&self, request: PutObjectRequest) -> StorageFuture<'_, PutObjectOutput> {
        Box::pin(async move {
            self.enter(Call::PutObject)?;
            let mut buckets = self.buckets.write().await;
            let stored = buckets
                .get_mut(&request.bucket)
                .ok_or_else(|| StorageError::no_such_bucket(&request.bucket))?;
            if request.retention.is_some() || request.legal_hold {
                stored.require_lock()?;
            }

            let version_id = if stored.versioned() {
                self.new_version_id()
            } else {
                NULL_VERSION.to_string()
            };
            let etag = Self::compute_etag(&request.body);
            let version = StoredVersion {
                version_id: version_id.clone(),
                etag: etag.clone(),
                body: request.body,
                content_type: request.content_type,
                headers: ContentHeaders::default(),
                metadata: request.metadata,
                tags: request
                    .tagging
                    .as_deref()
                    .map(crate::tags::decode_tag_query)
                    .unwrap_or_default(),
                retention: request.retention,
                legal_hold: request.legal_hold,
                delete_marker: false,
                last_modified: Utc::now(),
            };

            let versioned = stored.versioned();
            let versions = stored.objects.entry(request.key).or_default();
            if versioned {
                versions.push(version);
            } else {
                *versions = vec![version];
            }

            Ok(PutObjectOutput {
                etag,
                version_id: versioned.then_some(version_id),
            })
        })
    }

    fn copy_object(&self, request: CopyObjectRequest) -> StorageFuture<'_, CopyObjectOutput> {
        Box::pin(async move {
            self.enter(Call::CopyObject)?;
            let mut buckets = self.buckets.write().await;

            let source = buckets
                .get(&request.source_bucket)
                .ok_or_else(|| StorageError::no_such_bucket(&request.source_bucket))?
                .version(
                    &request.source_bucket,
                    &request.source_key,
                    request.source_version_id.as_deref(),
                )?
                .clone();
            if source.delete_marker {
                return Err(StorageError::new(
                    codes::INVALID_REQUEST,
                    400,
                    "The source of a copy request may not specifically refer to a delete marker",
                ));
            }
            check_conditions(&source, &request.conditions)?;

            let metadata_directive = request.metadata_directive.unwrap_or_default();
            let tagging_directive = request.tagging_directive.unwrap_or_default();
            let onto_itself = request.bucket == request.source_bucket
                && request.key == request.source_key
                && request.source_version_id.is_none();
            if onto_itself && metadata_directive == Directive::Copy {
                return Err(StorageError::new(
                    codes::INVALID_REQUEST,
                    400,
                    "This copy request is illegal because it is trying to copy an object to itself \
                     without changing the object's metadata",
                ));
            }

            let target = buckets
                .get_mut(&request.bucket)
                .ok_or_else(|| StorageError::no_such_bucket(&request.bucket))?;
            let versioned = target.versioned();
            let version_id = if versioned {
                self.new_version_id()
            } else {
                NULL_VERSION.to_string()
            };
            let last_modified = Utc::now();
            let (content_type, headers, metadata) = match metadata_directive {
                Directive::Copy => (source.content_type, source.headers, source.metadata),
                Directive::Replace => (request.content_type, request.headers, request.metadata),
            };
            let tags = match tagging_directive {
                Directive::Copy => source.tags,
                Directive::Replace => request
                    .tagging
                    .as_deref()
                    .map(crate::tags::decode_tag_query)
                    .unwrap_or_default(),
            };
            let copy = StoredVersion {
                version_id: version_id.clone(),
                body: source.body,
                etag: source.etag.clone(),
                content_type,
                headers,
                metadata,
                tags,
                retention: None,
                legal_hold: false,
                delete_marker: false,
                last_modified,
            };

            let versions = target.objects.entry(request.key).or_default();
            if versioned {
                versions.push(copy);
            } else {
                *versions = vec![copy];
            }

            Ok(CopyObjectOutput {
                etag: source.etag,
                last_modified: Some(last_modified),
                version_id: versioned.then_some(version_id),
                source_version_id: (source.version_id != NULL_VERSION).then_some(source.version_id),
            })
        })
    }

    fn head_object<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        version_id: Option<&'a str>,
    ) -> StorageFuture<'a, ObjectHead> {
        Box::pin(async move {
            self.enter(Call::HeadObject)?;
            let buckets = self.buckets.read().await;
            let stored = buckets
                .get(bucket)
                .ok_or_else(|| StorageError::no_such_bucket(bucket))?;
            Ok(stored.version(bucket, key, version_id)?.head())
        })
    }

    fn get_object<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        version_id: Option<&'a str>,
    ) -> StorageFuture<'a, Bytes> {
        Box::pin(async move {
            self.enter(Call::GetObject)?;
            let buckets = self.buckets.read().await;
            let stored = buckets
                .get(bucket)
                .ok_or_else(|| StorageError::no_such_bucket(bucket))?;
            let version = stored.version(bucket, key, version_id)?;
            if version.delete_marker {
                return Err(StorageError::new("MethodNotAllowed", 405, "Version is a delete marker"));
            }
            Ok(version.body.clone())
        })
    }

    fn delete_object<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        version_id: Option<&'a str>,
        bypass_governance: bool,
    ) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            self.enter(Call::DeleteObject)?;
            let mut buckets = self.buckets.write().await;
            let stored = buckets
                .get_mut(bucket)
                .ok_or_else(|| StorageError::no_such_bucket(bucket))?;

            let Some(version_id) = version_id else {
                if stored.versioned() {
                    let marker = StoredVersion {
                        version_id: self.new_version_id(),
                        body: Bytes::new(),
                        etag: String::new(),
                        content_type: None,
                        headers: ContentHeaders::default(),
                        metadata: BTreeMap::new(),
                        tags: TagSet::new(),
                        retention: None,
                        legal_hold: false,
                        delete_marker: true,
                        last_modified: Utc::now(),
                    };
                    stored.objects.entry(key.to_string()).or_default().push(marker);
                } else {
                    stored.objects.remove(key);
                }
                return Ok(());
            };

            let Some(versions) = stored.objects.get_mut(key) else {
                return Ok(());
            };
            let Some(index) = versions.iter().position(|v| v.version_id == version_id) else {
                return Ok(());
            };

            let target = &versions[index];
            if target.legal_hold {
                return Err(StorageError::access_denied(
                    "Object is under legal hold and cannot be deleted",
                ));
            }
            match retention_active(target.retention) {
                Some(LockMode::Compliance) => {
                    return Err(StorageError::access_denied(
                        "Object is WORM protected and cannot be overwritten",
                    ));
                }
                Some(LockMode::Governance) if !bypass_governance => {
                    return Err(StorageError::access_denied(
                        "Object is WORM protected and cannot be overwritten",
                    ));
                }
                _ => {}
            }

            versions.remove(index);
            if versions.is_empty() {
                stored.objects.remove(key);
            }
            Ok(())
        })
    }

    fn list_object_versions<'a>(
        &'a self,
        bucket: &'a str,
        prefix: Option<&'a str>,
        key_marker: Option<&'a str>,
        version_id_marker: Option<&'a str>,
    ) -> StorageFuture<'a, VersionPage> {
        Box::pin(async move {
            self.enter(Call::ListObjectVersions)?;
            let buckets = self.buckets.read().await;
            let stored = buckets
                .get(bucket)
                .ok_or_else(|| StorageError::no_such_bucket(bucket))?;

            let pending_empty = self.empty_pages.load(Ordering::SeqCst);
            if pending_empty > 0 {
                self.empty_pages.store(pending_empty - 1, Ordering::SeqCst);
                return Ok(VersionPage {
                    is_truncated: true,
                    next_key_marker: key_marker.map(str::to_string),
                    next_version_id_marker: version_id_marker.map(str::to_string),
                    ..Default::default()
                });
            }

            let page_size = self.page_size.load(Ordering::SeqCst);
            let mut entries = stored
                .objects
                .iter()
                .filter(|(key, _)| prefix.map_or(true, |p| key.starts_with(p)))
                .flat_map(|(key, versions)| {
                    let latest = versions.len().saturating_sub(1);
                    versions
                        .iter()
                        .enumerate()
                        .rev()
                        .map(move |(i, v)| (key, v, i == latest))
                })
                .filter(|(key, v, _)| after_marker(key, &v.version_id, key_marker, version_id_marker));

            let mut page = VersionPage::default();
            let mut last: Option<(String, String)> = None;
            for (key, version, is_latest) in entries.by_ref().take(page_size) {
                let entry = VersionEntry {
                    key: key.clone(),
                    version_id: version.version_id.clone(),
                    is_latest,
                };
                last = Some((key.clone(), version.version_id.clone()));
                if version.delete_marker {
                    page.delete_markers.push(entry);
                } else {
                    page.versions.push(entry);
                }
            }
            page.is_truncated = entries.next().is_some();
            if page.is_truncated {
                if let Some((key, version)) = last {
                    page.next_key_marker = Some(key);
                    page.next_version_id_marker = Some(version);
                }
            }
            Ok(page)
        })
    }

    fn get_object_tagging<'a>(&'a self, bucket: &'a str, key: &'a str) -> StorageFuture<'a, TagSet> {
        Box::pin(async move {
            self.enter(Call::GetObjectTagging)?;
            let buckets = self.buckets.read().await;
            let stored = buckets
                .get(bucket)
                .ok_or_else(|| StorageError::no_such_bucket(bucket))?;
            Ok(stored.version(bucket, key, None)?.tags.clone())
        })
    }

    fn put_object_tagging<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        tags: &'a TagSet,
    ) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            self.enter(Call::PutObjectTagging)?;
            let mut buckets = self.buckets.write().await;
            let stored = buckets
                .get_mut(bucket)
                .ok_or_else(|| StorageError::no_such_bucket(bucket))?;
            stored.version_mut(bucket, key, None)?.tags = tags.clone();
            Ok(())
        })
    }

    fn delete_object_tagging<'a>(&'a self, bucket: &'a str, key: &'a str) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            self.enter(Call::DeleteObjectTagging)?;
            let mut buckets = self.buckets.write().await;
            let stored = buckets
                .get_mut(bucket)
                .ok_or_else(|| StorageError::no_such_bucket(bucket))?;
            stored.version_mut(bucket, key, None)?.tags.clear();
            Ok(())
        })
    }

    fn get_object_retention<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        version_id: Option<&'a str>,
    ) -> StorageFuture<'a, Option<Retention>> {
        Box::pin(async move {
            self.enter(Call::GetObjectRetention)?;
            let buckets = self.buckets.read().await;
            let stored = buckets
                .get(bucket)
                .ok_or_else(|| StorageError::no_such_bucket(bucket))?;
            stored.require_lock()?;
            Ok(stored.version(bucket, key, version_id)?.retention)
        })
    }

    fn put_object_retention<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        version_id: Option<&'a str>,
        retention: Option<Retention>,
        bypass_governance: bool,
    ) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            self.enter(Call::PutObjectRetention)?;
            let mut buckets = self.buckets.write().await;
            let stored = buckets
                .get_mut(bucket)
                .ok_or_else(|| StorageError::no_such_bucket(bucket))?;
            stored.require_lock()?;
            let version = stored.version_mut(bucket, key, version_id)?;

            if let Some(current) = version.retention.filter(|r| r.until > Utc::now()) {
                let weakened = match retention {
                    None => true,
                    Some(next) => next.until < current.until || next.mode != current.mode,
                };
                let allowed = match current.mode {
                    LockMode::Compliance => false,
                    LockMode::Governance => bypass_governance,
                };
                if weakened && !allowed {
                    return Err(StorageError::access_denied(
                        "Object is WORM protected and cannot be overwritten",
                    ));
                }
            }
            version.retention = retention;
            Ok(())
        })
    }

    fn get_object_legal_hold<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        version_id: Option<&'a str>,
    ) -> StorageFuture<'a, bool> {
        Box::pin(async move {
            self.enter(Call::GetObjectLegalHold)?;
            let buckets = self.buckets.read().await;
            let stored = buckets
                .get(bucket)
                .ok_or_else(|| StorageError::no_such_bucket(bucket))?;
            stored.require_lock()?;
            Ok(stored.version(bucket, key, version_id)?.legal_hold)
        })
    }

    fn put_object_legal_hold<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        version_id: Option<&'a str>,
        on: bool,
    ) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            self.enter(Call::PutObjectLegalHold)?;
            let mut buckets = self.buckets.write().await;
            let stored = buckets
                .get_mut(bucket)
                .ok_or_else(|| StorageError::no_such_bucket(bucket))?;
            stored.require_lock()?;
            stored.version_mut(bucket, key, version_id)?.legal_hold = on;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn put(bucket: &str, key: &str, body: &'static [u8]) -> PutObjectRequest {
        PutObjectRequest {
            bucket: bucket.into(),
            key: key.into(),
            body: Bytes::from_static(body),
            ..Default::default()
        }
    }

    fn copy(source_key: &str, key: &str) -> CopyObjectRequest {
        CopyObjectRequest {
            bucket: "dst".into(),
            key: key.into(),
            source_bucket: "src".into(),
            source_key: source_key.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_copy_keeps_source_metadata_by_default() {
        let store = MemoryStorage::new();
        store.create_bucket("src", false).await.unwrap();
        store.create_bucket("dst", false).await.unwrap();
        let mut request = put("src", "a.txt", b"hello");
        request.content_type = Some("text/plain".into());
        request.metadata.insert("owner".into(), "ops".into());
        request.tagging = Some("team=ops".into());
        store.put_object(request).await.unwrap();

        let mut replace = copy("a.txt", "b.txt");
        replace.metadata.insert("owner".into(), "ignored".into());
        let out = store.copy_object(replace).await.unwrap();
        assert_eq!(out.version_id, None);

        let head = store.head_object("dst", "b.txt", None).await.unwrap();
        assert_eq!(head.etag, out.etag);
        assert_eq!(head.content_type.as_deref(), Some("text/plain"));
        assert_eq!(head.metadata.get("owner").map(String::as_str), Some("ops"));
        let tags = store.get_object_tagging("dst", "b.txt").await.unwrap();
        assert_eq!(tags.get("team").map(String::as_str), Some("ops"));
    }

    #[tokio::test]
    async fn test_copy_replace_directives() {
        let store = MemoryStorage::new();
        store.create_bucket("src", false).await.unwrap();
        store.create_bucket("dst", false).await.unwrap();
        store.put_object(put("src", "a.txt", b"hello")).await.unwrap();

        let mut request = copy("a.txt", "b.txt");
        request.metadata_directive = Some(Directive::Replace);
        request.content_type = Some("application/json".into());
        request.headers.cache_control = Some("no-cache".into());
        request.tagging_directive = Some(Directive::Replace);
        request.tagging = Some("env=prod".into());
        store.copy_object(request).await.unwrap();

        let head = store.head_object("dst", "b.txt", None).await.unwrap();
        assert_eq!(head.content_type.as_deref(), Some("application/json"));
        assert_eq!(head.headers.cache_control.as_deref(), Some("no-cache"));
        let tags = store.get_object_tagging("dst", "b.txt").await.unwrap();
        assert_eq!(tags.get("env").map(String::as_str), Some("prod"));
    }

    #[tokio::test]
    async fn test_copy_preconditions() {
        let store = MemoryStorage::new();
        store.create_bucket("src", false).await.unwrap();
        store.create_bucket("dst", false).await.unwrap();
        let etag = store.put_object(put("src", "a.txt", b"hello")).await.unwrap().etag;

        let mut request = copy("a.txt", "b.txt");
        request.conditions.if_none_match = Some(etag.trim_matches('"').to_string());
        let err = store.copy_object(request).await.unwrap_err();
        assert_eq!(err.code, codes::PRECONDITION_FAILED);
        assert_eq!(err.status, 412);

        let mut request = copy("a.txt", "b.txt");
        request.conditions.if_match = Some(etag);
        request.conditions.if_unmodified_since = Some(Utc::now() + ChronoDuration::hours(1));
        store.copy_object(request).await.unwrap();

        let mut request = copy("a.txt", "c.txt");
        request.conditions.if_modified_since = Some(Utc::now() + ChronoDuration::hours(1));
        assert!(store.copy_object(request).await.is_err());
    }

    #[tokio::test]
    async fn test_copy_onto_itself_requires_replace() {
        let store = MemoryStorage::new();
        store.create_bucket("src", false).await.unwrap();
        store.put_object(put("src", "a.txt", b"hello")).await.unwrap();
        let mut request = copy("a.txt", "a.txt");
        request.bucket = "src".into();
        let err = store.copy_object(request.clone()).await.unwrap_err();
        assert_eq!(err.code, codes::INVALID_REQUEST);

        request.metadata_directive = Some(Directive::Replace);
        store.copy_object(request).await.unwrap();
    }

    #[tokio::test]
    async fn test_copy_missing_source() {
        let store = MemoryStorage::new();
        store.create_bucket("src", false).await.unwrap();
        store.create_bucket("dst", false).await.unwrap();
        let err = store.copy_object(copy("absent", "b.txt")).await.unwrap_err();
        assert_eq!(err.code, codes::NO_SUCH_KEY);
    }

    #[tokio::test]
    async fn test_put_and_head_unversioned() {
        let store = MemoryStorage::new();
        store.create_bucket("b", false).await.unwrap();
        let out = store.put_object(put("b", "k", b"hello")).await.unwrap();
        assert_eq!(out.etag, "\"5d41402abc4b2a76b9719d911017c592\"");
        assert_eq!(out.version_id, None);

        let head = store.head_object("b", "k", None).await.unwrap();
        assert_eq!(head.content_length, 5);
        assert_eq!(head.version_id, None);
        assert_eq!(store.entry_count("b").await, 1);
    }

    #[tokio::test]
    async fn test_versioned_overwrite_keeps_history() {
        let store = MemoryStorage::new();
        store.create_bucket("b", true).await.unwrap();
        let v1 = store.put_object(put("b", "k", b"one")).await.unwrap();
        let v2 = store.put_object(put("b", "k", b"two")).await.unwrap();
        assert_ne!(v1.version_id, v2.version_id);
        assert_eq!(store.entry_count("b").await, 2);

        let body = store.get_object("b", "k", v1.version_id.as_deref()).await.unwrap();
        assert_eq!(body.as_ref(), b"one");
    }

    #[tokio::test]
    async fn test_delete_without_version_adds_marker() {
        let store = MemoryStorage::new();
        store.create_bucket("b", true).await.unwrap();
        store.put_object(put("b", "k", b"one")).await.unwrap();
        store.delete_object("b", "k", None, false).await.unwrap();

        let err = store.head_object("b", "k", None).await.unwrap_err();
        assert!(err.is_code(codes::NO_SUCH_KEY));
        let page = store.list_object_versions("b", None, None, None).await.unwrap();
        assert_eq!(page.versions.len(), 1);
        assert_eq!(page.delete_markers.len(), 1);
        assert!(page.delete_markers[0].is_latest);
    }

    #[tokio::test]
    async fn test_legal_hold_blocks_version_delete() {
        let store = MemoryStorage::new();
        store.create_bucket("b", true).await.unwrap();
        let mut req = put("b", "k", b"held");
        req.legal_hold = true;
        let out = store.put_object(req).await.unwrap();
        let version = out.version_id.unwrap();

        let err = store.delete_object("b", "k", Some(&version), true).await.unwrap_err();
        assert!(err.is_code(codes::ACCESS_DENIED));
        assert_eq!(err.status, 403);

        store.put_object_legal_hold("b", "k", Some(&version), false).await.unwrap();
        store.delete_object("b", "k", Some(&version), false).await.unwrap();
        assert_eq!(store.entry_count("b").await, 0);
    }

    #[tokio::test]
    async fn test_governance_retention_needs_bypass() {
        let store = MemoryStorage::new();
        store.create_bucket("b", true).await.unwrap();
        let mut req = put("b", "k", b"kept");
        req.retention = Some(Retention {
            mode: LockMode::Governance,
            until: Utc::now() + ChronoDuration::days(1),
        });
        let version = store.put_object(req).await.unwrap().version_id.unwrap();

        assert!(store.delete_object("b", "k", Some(&version), false).await.is_err());
        store.delete_object("b", "k", Some(&version), true).await.unwrap();
    }

    #[tokio::test]
    async fn test_compliance_retention_cannot_be_bypassed() {
        let store = MemoryStorage::new();
        store.create_bucket("b", true).await.unwrap();
        let mut req = put("b", "k", b"kept");
        req.retention = Some(Retention {
            mode: LockMode::Compliance,
            until: Utc::now() + ChronoDuration::days(1),
        });
        let version = store.put_object(req).await.unwrap().version_id.unwrap();
        let err = store.delete_object("b", "k", Some(&version), true).await.unwrap_err();
        assert!(err.is_code(codes::ACCESS_DENIED));
        assert!(store
            .put_object_retention("b", "k", Some(&version), None, true)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_lock_calls_require_lock_bucket() {
        let store = MemoryStorage::new();
        store.create_bucket("b", false).await.unwrap();
        store.put_object(put("b", "k", b"x")).await.unwrap();
        let err = store.put_object_legal_hold("b", "k", None, true).await.unwrap_err();
        assert_eq!(err.code, "InvalidRequest");
    }

    #[tokio::test]
    async fn test_delete_bucket_requires_empty() {
        let store = MemoryStorage::new();
        store.create_bucket("b", false).await.unwrap();
        store.put_object(put("b", "k", b"x")).await.unwrap();
        let err = store.delete_bucket("b").await.unwrap_err();
        assert!(err.is_code(codes::BUCKET_NOT_EMPTY));
        store.delete_object("b", "k", None, false).await.unwrap();
        store.delete_bucket("b").await.unwrap();
        assert!(!store.bucket_exists("b").await);
    }

    #[tokio::test]
    async fn test_listing_pages_by_markers() {
        let store = MemoryStorage::new();
        store.create_bucket("b", true).await.unwrap();
        for key in ["a", "b", "c"] {
            store.put_object(put("b", key, b"1")).await.unwrap();
            store.put_object(put("b", key, b"2")).await.unwrap();
        }
        store.set_page_size(4);

        let first = store.list_object_versions("b", None, None, None).await.unwrap();
        assert_eq!(first.versions.len(), 4);
        assert!(first.is_truncated);
        // Newest version of each key first.
        assert!(first.versions[0].is_latest);
        assert!(!first.versions[1].is_latest);

        let second = store
            .list_object_versions(
                "b",
                None,
                first.next_key_marker.as_deref(),
                first.next_version_id_marker.as_deref(),
            )
            .await
            .unwrap();
        assert_eq!(second.versions.len(), 2);
        assert!(!second.is_truncated);
        assert!(second.versions.iter().all(|v| v.key == "c"));
    }

    #[tokio::test]
    async fn test_injected_empty_page_is_truncated() {
        let store = MemoryStorage::new();
        store.create_bucket("b", false).await.unwrap();
        store.put_object(put("b", "k", b"x")).await.unwrap();
        store.inject_empty_pages(1);

        let page = store.list_object_versions("b", None, None, None).await.unwrap();
        assert!(page.versions.is_empty());
        assert!(page.is_truncated);
        let page = store.list_object_versions("b", None, None, None).await.unwrap();
        assert_eq!(page.versions.len(), 1);
    }

    #[tokio::test]
    async fn test_failure_injection_and_journal() {
        let store = MemoryStorage::new();
        store.fail_next(Call::CreateBucket, StorageError::new(codes::OPERATION_ABORTED, 409, "busy"));
        assert!(store.create_bucket("b", false).await.is_err());
        store.create_bucket("b", false).await.unwrap();
        assert_eq!(store.count(Call::CreateBucket), 2);
        assert_eq!(store.journal(), vec![Call::CreateBucket, Call::CreateBucket]);
    }

    #[tokio::test]
    async fn test_bucket_tagging_missing_is_no_such_tag_set() {
        let store = MemoryStorage::new();
        store.create_bucket("b", false).await.unwrap();
        let err = store.get_bucket_tagging("b").await.unwrap_err();
        assert!(err.is_code(codes::NO_SUCH_TAG_SET));
    }
}
