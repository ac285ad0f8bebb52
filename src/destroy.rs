//! Recursive emptying of a bucket, including locked object versions.
//!
//! [`empty_container`] deletes every object version and then every delete
//! marker it can enumerate.  A version rejected with `AccessDenied` while
//! the caller asked to bypass locks has its legal hold cleared and is deleted
//! once more.  Per-object failures never stop the sweep; the last one is
//! reported when the pass finishes.

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::errors::{codes, StorageError};
use crate::metrics::{LEGAL_HOLDS_CLEARED_TOTAL, OBJECT_VERSIONS_DELETED_TOTAL};
use crate::retry::CancelFlag;
use crate::storage::backend::{ObjectStorage, StorageResult, VersionPage};

/// Listing pages whose markers did not advance before the sweep gives up.
const MAX_STALLED_PAGES: u32 = 16;

/// How to empty a bucket.
#[derive(Debug, Clone, Default)]
pub struct EmptyOptions {
    /// Clear legal holds and bypass governance retention.
    pub bypass_lock: bool,
    /// Swallow per-object failures and only report the count.
    pub ignore_errors: bool,
    /// Restrict the sweep to this exact key.
    pub key: Option<String>,
}

/// A single object version that could not be deleted.
#[derive(Debug, Clone, Error)]
pub enum ObjectFailure {
    /// A remote call failed.
    #[error("{key} version {version_id}: {source}")]
    Remote {
        /// Object key.
        key: String,
        /// Version id.
        version_id: String,
        /// Failure of the last call made for this version.
        #[source]
        source: StorageError,
    },

    /// Access was denied for a reason other than a legal hold.
    #[error("AccessDenied deleting {key} version {version_id}")]
    Locked {
        /// Object key.
        key: String,
        /// Version id.
        version_id: String,
    },
}

/// Why emptying a bucket failed.
#[derive(Debug, Error)]
pub enum DestroyError {
    /// Listing versions failed.
    #[error("listing object versions in {bucket}: {source}")]
    List {
        /// Bucket being emptied.
        bucket: String,
        /// Entries deleted before the failure.
        deleted: i64,
        /// Listing failure.
        #[source]
        source: StorageError,
    },

    /// The listing kept claiming more pages without advancing.
    #[error("listing object versions in {bucket} stopped advancing after {pages} pages")]
    Stalled {
        /// Bucket being emptied.
        bucket: String,
        /// Entries deleted before giving up.
        deleted: i64,
        /// Consecutive pages without progress.
        pages: u32,
    },

    /// At least one object version could not be deleted.
    #[error("error deleting at least one object version, last error: {last}")]
    Versions {
        /// Entries deleted.
        deleted: i64,
        /// Last per-object failure.
        last: ObjectFailure,
    },

    /// At least one delete marker could not be deleted.
    #[error("error deleting at least one object delete marker, last error: {last}")]
    DeleteMarkers {
        /// Entries deleted.
        deleted: i64,
        /// Last per-object failure.
        last: ObjectFailure,
    },

    /// The sweep was cancelled between deletions.
    #[error("cancelled after deleting {deleted} entries")]
    Cancelled {
        /// Entries deleted before cancellation.
        deleted: i64,
    },
}

impl DestroyError {
    /// Entries deleted before the failure.
    pub fn deleted(&self) -> i64 {
        match self {
            DestroyError::List { deleted, .. }
            | DestroyError::Stalled { deleted, .. }
            | DestroyError::Versions { deleted, .. }
            | DestroyError::DeleteMarkers { deleted, .. }
            | DestroyError::Cancelled { deleted } => *deleted,
        }
    }
}

/// Walks `ListObjectVersions` pages by the explicit truncation flag.
struct Pager<'a> {
    bucket: &'a str,
    prefix: Option<&'a str>,
    key_marker: Option<String>,
    version_id_marker: Option<String>,
    finished: bool,
    stalled: u32,
}

impl<'a> Pager<'a> {
    fn new(bucket: &'a str, prefix: Option<&'a str>) -> Self {
        Self {
            bucket,
            prefix,
            key_marker: None,
            version_id_marker: None,
            finished: false,
            stalled: 0,
        }
    }

    /// Next page, or `None` once the listing is complete or the bucket is
    /// gone.
    async fn next(&mut self, storage: &dyn ObjectStorage, deleted: i64) -> Result<Option<VersionPage>, DestroyError> {
        if self.finished {
            return Ok(None);
        }

        let result = storage
            .list_object_versions(
                self.bucket,
                self.prefix,
                self.key_marker.as_deref(),
                self.version_id_marker.as_deref(),
            )
            .await;
        let page = match result {
            Ok(page) => page,
            Err(err) if err.is_code(codes::NO_SUCH_BUCKET) => {
                debug!(bucket = self.bucket, "bucket gone while listing versions");
                self.finished = true;
                return Ok(None);
            }
            Err(source) => {
                return Err(DestroyError::List {
                    bucket: self.bucket.to_string(),
                    deleted,
                    source,
                });
            }
        };
        if !page.is_truncated {
            self.finished = true;
            return Ok(Some(page));
        }

        let advanced = page.next_key_marker != self.key_marker
            || page.next_version_id_marker != self.version_id_marker;
        if advanced {
            self.stalled = 0;
            self.key_marker = page.next_key_marker.clone();
            self.version_id_marker = page.next_version_id_marker.clone();
        } else {
            self.stalled += 1;
            debug!(bucket = self.bucket, stalled = self.stalled, "version listing did not advance");
            if self.stalled >= MAX_STALLED_PAGES {
                return Err(DestroyError::Stalled {
                    bucket: self.bucket.to_string(),
                    deleted,
                    pages: self.stalled,
                });
            }
        }
        Ok(Some(page))
    }
}

/// Delete one version.  A missing bucket or key counts as deleted.
async fn delete_version(
    storage: &dyn ObjectStorage,
    bucket: &str,
    key: &str,
    version_id: &str,
    bypass_governance: bool,
) -> StorageResult<()> {
    debug!(bucket, key, version_id, "deleting object version");
    match storage
        .delete_object(bucket, key, Some(version_id), bypass_governance)
        .await
    {
        Err(err) if err.is_code(codes::NO_SUCH_BUCKET) || err.is_code(codes::NO_SUCH_KEY) => Ok(()),
        other => other,
    }
}

/// Delete a version whose first delete was denied, clearing its legal hold
/// when that is what blocks it.
async fn delete_locked_version(
    storage: &dyn ObjectStorage,
    bucket: &str,
    key: &str,
    version_id: &str,
) -> Result<(), ObjectFailure> {
    let remote = |source: StorageError| ObjectFailure::Remote {
        key: key.to_string(),
        version_id: version_id.to_string(),
        source,
    };

    let head = storage
        .head_object(bucket, key, Some(version_id))
        .await
        .map_err(remote)?;
    if !head.legal_hold {
        return Err(ObjectFailure::Locked {
            key: key.to_string(),
            version_id: version_id.to_string(),
        });
    }

    storage
        .put_object_legal_hold(bucket, key, Some(version_id), false)
        .await
        .map_err(remote)?;
    metrics::counter!(LEGAL_HOLDS_CLEARED_TOTAL).increment(1);
    info!(bucket, key, version_id, "cleared legal hold");

    delete_version(storage, bucket, key, version_id, true)
        .await
        .map_err(remote)
}

/// Delete every version and delete marker in `bucket`.
///
/// Returns the number of entries deleted.  A bucket that does not exist is
/// already empty.  Unless `ignore_errors` is set, a pass that could not
/// delete every entry fails with the last per-object error, and the marker
/// pass only runs when the version pass succeeded.
pub async fn empty_container(
    storage: &dyn ObjectStorage,
    cancel: &CancelFlag,
    bucket: &str,
    options: &EmptyOptions,
) -> Result<i64, DestroyError> {
    let key = options.key.as_deref();
    let mut deleted: i64 = 0;
    let mut last: Option<ObjectFailure> = None;

    info!(bucket, key, bypass_lock = options.bypass_lock, "emptying bucket");

    let mut pager = Pager::new(bucket, key);
    while let Some(page) = pager.next(storage, deleted).await? {
        for version in page.versions {
            if key.is_some_and(|k| k != version.key) {
                continue;
            }
            if cancel.is_cancelled() {
                return Err(DestroyError::Cancelled { deleted });
            }

            let first = delete_version(storage, bucket, &version.key, &version.version_id, options.bypass_lock).await;
            let outcome = match first {
                Ok(()) => Ok(()),
                Err(err) if err.is_code(codes::ACCESS_DENIED) && options.bypass_lock => {
                    delete_locked_version(storage, bucket, &version.key, &version.version_id).await
                }
                Err(source) => Err(ObjectFailure::Remote {
                    key: version.key.clone(),
                    version_id: version.version_id.clone(),
                    source,
                }),
            };

            match outcome {
                Ok(()) => {
                    deleted += 1;
                    metrics::counter!(OBJECT_VERSIONS_DELETED_TOTAL).increment(1);
                }
                Err(failure) => {
                    warn!(bucket, error = %failure, "could not delete object version");
                    last = Some(failure);
                }
            }
        }
    }

    if let Some(failure) = last.take() {
        if !options.ignore_errors {
            return Err(DestroyError::Versions { deleted, last: failure });
        }
    }

    let mut pager = Pager::new(bucket, key);
    while let Some(page) = pager.next(storage, deleted).await? {
        for marker in page.delete_markers {
            if key.is_some_and(|k| k != marker.key) {
                continue;
            }
            if cancel.is_cancelled() {
                return Err(DestroyError::Cancelled { deleted });
            }

            // Delete markers carry no lock protection.
            match delete_version(storage, bucket, &marker.key, &marker.version_id, false).await {
                Ok(()) => {
                    deleted += 1;
                    metrics::counter!(OBJECT_VERSIONS_DELETED_TOTAL).increment(1);
                }
                Err(source) => {
                    let failure = ObjectFailure::Remote {
                        key: marker.key.clone(),
                        version_id: marker.version_id.clone(),
                        source,
                    };
                    warn!(bucket, error = %failure, "could not delete delete marker");
                    last = Some(failure);
                }
            }
        }
    }

    if let Some(failure) = last {
        if !options.ignore_errors {
            return Err(DestroyError::DeleteMarkers { deleted, last: failure });
        }
    }

    info!(bucket, deleted, "bucket emptied");
    Ok(deleted)
}
