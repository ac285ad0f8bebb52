//! Resource reconcilers.
//!
//! One module per resource kind, each a small state machine over
//! `Creating`, `Reading`, `Updating` and `Deleting`.  Every operation takes a
//! [`ReconcileContext`] carrying the clients, the per-operation deadlines and
//! the cancellation flag; nothing is read from globals.
//!
//! The functions here dispatch a [`DesiredState`] to its kind, validate it at
//! the boundary and record reconcile metrics.  [`converge`] is the single
//! entry point the CLI uses: create when nothing is known, otherwise refresh
//! and update.

pub mod bucket;
pub mod object;
pub mod object_copy;
pub mod permission;
pub mod service_account;

use std::future::Future;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::account::api::AccountApi;
use crate::config::RetryConfig;
use crate::errors::{ReconcileError, RemoteError};
use crate::metrics::{RECONCILE_DURATION_SECONDS, RECONCILE_TOTAL};
use crate::model::{DesiredState, ObservedState};
use crate::retry::{CancelFlag, RetryError, RetryPolicy};
use crate::storage::backend::ObjectStorage;
use crate::Clients;

/// Deadlines for each reconciler operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub create: Duration,
    pub read: Duration,
    pub update: Duration,
    pub delete: Duration,
}

impl Timeouts {
    /// Deadlines from the retry configuration.
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            create: Duration::from_secs(config.create_timeout_seconds),
            read: Duration::from_secs(config.read_timeout_seconds),
            update: Duration::from_secs(config.update_timeout_seconds),
            delete: Duration::from_secs(config.delete_timeout_seconds),
        }
    }

    /// The same deadline for every operation.
    pub fn uniform(timeout: Duration) -> Self {
        Self {
            create: timeout,
            read: timeout,
            update: timeout,
            delete: timeout,
        }
    }
}

/// Everything a reconciler operation needs besides the resource itself.
#[derive(Clone)]
pub struct ReconcileContext {
    pub clients: Clients,
    pub timeouts: Timeouts,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    /// Delete-then-empty passes before a forced bucket delete gives up.
    pub max_delete_passes: u32,
    pub cancel: CancelFlag,
}

impl ReconcileContext {
    /// A context using the configured retry timing.
    pub fn new(clients: Clients, config: &RetryConfig) -> Self {
        Self {
            clients,
            timeouts: Timeouts::from_config(config),
            min_backoff: config.min_backoff(),
            max_backoff: config.max_backoff(),
            max_delete_passes: config.max_delete_passes.max(1),
            cancel: CancelFlag::new(),
        }
    }

    /// Retry policy with deadline `timeout` and the context's backoff.
    pub(crate) fn policy(&self, timeout: Duration) -> RetryPolicy {
        RetryPolicy::new(timeout).with_delays(self.min_backoff, self.max_backoff)
    }

    pub(crate) fn storage(&self, resource: &str) -> Result<&dyn ObjectStorage, ReconcileError> {
        self.clients
            .storage
            .as_deref()
            .ok_or_else(|| ReconcileError::MissingClient {
                resource: resource.to_string(),
                api: "S3",
            })
    }

    pub(crate) fn account(&self, resource: &str) -> Result<&dyn AccountApi, ReconcileError> {
        self.clients
            .account
            .as_deref()
            .ok_or_else(|| ReconcileError::MissingClient {
                resource: resource.to_string(),
                api: "account API",
            })
    }
}

/// Reconciler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Creating,
    Reading,
    Updating,
    Deleting,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Creating => "create",
            Phase::Reading => "read",
            Phase::Updating => "update",
            Phase::Deleting => "delete",
        }
    }
}

/// Which Read this is.  Not-found means "not visible yet" right after a
/// create and "gone" on any later read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPass {
    AfterCreate,
    Refresh,
}

/// Result of a Read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome<T> {
    /// The resource exists; this is its full observed state.
    Found(T),
    /// The resource no longer exists; the caller drops its state.
    Gone,
}

impl<T> ReadOutcome<T> {
    /// The observed state, or an error when a resource that must exist is gone.
    pub(crate) fn found(self, resource: &str, operation: &'static str) -> Result<T, ReconcileError> {
        match self {
            ReadOutcome::Found(value) => Ok(value),
            ReadOutcome::Gone => Err(ReconcileError::Exhausted {
                resource: resource.to_string(),
                operation,
                passes: 1,
                last: "resource not found".to_string(),
            }),
        }
    }
}

/// Convert a retry-loop failure into the reconciler error.
pub(crate) fn retry_failure<E: Into<RemoteError>>(
    resource: &str,
    operation: &'static str,
    err: RetryError<E>,
) -> ReconcileError {
    match err {
        RetryError::Failed(source) => ReconcileError::remote(resource, operation, source),
        RetryError::Cancelled { .. } => ReconcileError::Cancelled {
            resource: resource.to_string(),
            operation,
        },
    }
}

/// Time `operation` and count its outcome.
async fn observe<T, F>(kind: &'static str, phase: Phase, operation: F) -> Result<T, ReconcileError>
where
    F: Future<Output = Result<T, ReconcileError>>,
{
    let started = Instant::now();
    let result = operation.await;
    let outcome = if result.is_ok() { "ok" } else { "error" };
    metrics::counter!(RECONCILE_TOTAL, "kind" => kind, "operation" => phase.as_str(), "outcome" => outcome)
        .increment(1);
    metrics::histogram!(RECONCILE_DURATION_SECONDS, "kind" => kind, "operation" => phase.as_str())
        .record(started.elapsed().as_secs_f64());
    result
}

fn validated(desired: &DesiredState) -> Result<(), ReconcileError> {
    desired.check().map_err(|message| ReconcileError::Invalid {
        resource: desired.describe(),
        message,
    })
}

fn kind_mismatch(desired: &DesiredState, observed: &ObservedState) -> ReconcileError {
    ReconcileError::Immutable {
        resource: format!("{} (recorded as {})", desired.describe(), observed.kind()),
        field: "kind",
    }
}

/// Create the resource and return its observed state.
pub async fn create(ctx: &ReconcileContext, desired: &DesiredState) -> Result<ObservedState, ReconcileError> {
    validated(desired)?;
    observe(desired.kind(), Phase::Creating, async {
        Ok(match desired {
            DesiredState::Bucket(spec) => ObservedState::Bucket(bucket::create(ctx, spec).await?),
            DesiredState::Object(spec) => ObservedState::Object(object::create(ctx, spec).await?),
            DesiredState::ObjectCopy(spec) => ObservedState::ObjectCopy(object_copy::create(ctx, spec).await?),
            DesiredState::Permission(spec) => {
                ObservedState::Permission(permission::create(ctx, spec).await?)
            }
            DesiredState::ServiceAccount(spec) => {
                ObservedState::ServiceAccount(service_account::create(ctx, spec).await?)
            }
        })
    })
    .await
}

/// Refresh a previously observed resource.
pub async fn read(
    ctx: &ReconcileContext,
    desired: &DesiredState,
    observed: &ObservedState,
) -> Result<ReadOutcome<ObservedState>, ReconcileError> {
    observe(desired.kind(), Phase::Reading, async {
        Ok(match (desired, observed) {
            (DesiredState::Bucket(_), ObservedState::Bucket(o)) => {
                match bucket::read(ctx, &o.name, ReadPass::Refresh).await? {
                    ReadOutcome::Found(b) => ReadOutcome::Found(ObservedState::Bucket(b)),
                    ReadOutcome::Gone => ReadOutcome::Gone,
                }
            }
            (DesiredState::Object(_), ObservedState::Object(o)) => {
                match object::read(ctx, &o.bucket, &o.key, ReadPass::Refresh).await? {
                    ReadOutcome::Found(b) => ReadOutcome::Found(ObservedState::Object(b)),
                    ReadOutcome::Gone => ReadOutcome::Gone,
                }
            }
            (DesiredState::ObjectCopy(_), ObservedState::ObjectCopy(o)) => {
                let outcome = object_copy::read(
                    ctx,
                    &o.bucket,
                    &o.key,
                    &o.source,
                    o.source_version_id.as_deref(),
                    ReadPass::Refresh,
                )
                .await?;
                match outcome {
                    ReadOutcome::Found(c) => ReadOutcome::Found(ObservedState::ObjectCopy(c)),
                    ReadOutcome::Gone => ReadOutcome::Gone,
                }
            }
            (DesiredState::Permission(spec), ObservedState::Permission(o)) => {
                match permission::read(ctx, &o.id, ReadPass::Refresh, &permission::prior_policy(spec, o)).await? {
                    ReadOutcome::Found(p) => ReadOutcome::Found(ObservedState::Permission(p)),
                    ReadOutcome::Gone => ReadOutcome::Gone,
                }
            }
            (DesiredState::ServiceAccount(_), ObservedState::ServiceAccount(o)) => {
                let credentials = service_account::IssuedCredentials::from(o);
                match service_account::read(ctx, &o.id, ReadPass::Refresh, &credentials).await? {
                    ReadOutcome::Found(s) => ReadOutcome::Found(ObservedState::ServiceAccount(s)),
                    ReadOutcome::Gone => ReadOutcome::Gone,
                }
            }
            _ => return Err(kind_mismatch(desired, observed)),
        })
    })
    .await
}

/// Converge an existing resource to `desired`.
pub async fn update(
    ctx: &ReconcileContext,
    desired: &DesiredState,
    observed: &ObservedState,
) -> Result<ObservedState, ReconcileError> {
    validated(desired)?;
    observe(desired.kind(), Phase::Updating, async {
        Ok(match (desired, observed) {
            (DesiredState::Bucket(spec), ObservedState::Bucket(o)) => {
                ObservedState::Bucket(bucket::update(ctx, spec, o).await?)
            }
            (DesiredState::Object(spec), ObservedState::Object(o)) => {
                ObservedState::Object(object::update(ctx, spec, o).await?)
            }
            (DesiredState::ObjectCopy(spec), ObservedState::ObjectCopy(o)) => {
                ObservedState::ObjectCopy(object_copy::update(ctx, spec, o).await?)
            }
            (DesiredState::Permission(spec), ObservedState::Permission(o)) => {
                ObservedState::Permission(permission::update(ctx, spec, o).await?)
            }
            (DesiredState::ServiceAccount(spec), ObservedState::ServiceAccount(o)) => {
                ObservedState::ServiceAccount(service_account::update(ctx, spec, o).await?)
            }
            _ => return Err(kind_mismatch(desired, observed)),
        })
    })
    .await
}

/// Delete the resource.  Deleting something already gone succeeds.
pub async fn delete(
    ctx: &ReconcileContext,
    desired: &DesiredState,
    observed: &ObservedState,
) -> Result<(), ReconcileError> {
    observe(desired.kind(), Phase::Deleting, async {
        match (desired, observed) {
            (DesiredState::Bucket(spec), ObservedState::Bucket(o)) => {
                bucket::delete(ctx, &o.name, spec.force_destroy, o.object_lock).await
            }
            (DesiredState::Object(spec), ObservedState::Object(o)) => {
                object::delete(ctx, &o.bucket, &o.key, o.version_id.as_deref(), spec.force_destroy).await
            }
            (DesiredState::ObjectCopy(spec), ObservedState::ObjectCopy(o)) => object_copy::delete(ctx, spec, o).await,
            (DesiredState::Permission(_), ObservedState::Permission(o)) => permission::delete(ctx, &o.id).await,
            (DesiredState::ServiceAccount(_), ObservedState::ServiceAccount(o)) => {
                service_account::delete(ctx, &o.id).await
            }
            _ => Err(kind_mismatch(desired, observed)),
        }
    })
    .await
}

/// Drive one resource to `desired`.
///
/// Without prior state the resource is created.  Otherwise it is refreshed;
/// a resource that vanished is created again, and one that still exists is
/// updated.
pub async fn converge(
    ctx: &ReconcileContext,
    desired: &DesiredState,
    prior: Option<&ObservedState>,
) -> Result<ObservedState, ReconcileError> {
    let Some(prior) = prior else {
        info!(resource = %desired.describe(), "creating");
        return create(ctx, desired).await;
    };

    match read(ctx, desired, prior).await? {
        ReadOutcome::Gone => {
            warn!(resource = %desired.describe(), "resource not found, recreating");
            create(ctx, desired).await
        }
        ReadOutcome::Found(current) => update(ctx, desired, &current).await,
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::account::memory::MemoryAccountApi;
    use crate::storage::memory::MemoryStorage;

    /// A context over in-memory clients with short deadlines.
    pub(crate) fn context(storage: &Arc<MemoryStorage>, account: &Arc<MemoryAccountApi>) -> ReconcileContext {
        let clients = Clients {
            storage: Some(storage.clone() as Arc<dyn ObjectStorage>),
            account: Some(account.clone() as Arc<dyn AccountApi>),
        };
        let mut ctx = ReconcileContext::new(clients, &RetryConfig::default());
        ctx.timeouts = Timeouts::uniform(Duration::from_millis(200));
        ctx.min_backoff = Duration::from_millis(1);
        ctx.max_backoff = Duration::from_millis(5);
        ctx
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::testing::context;
    use super::*;
    use crate::account::memory::MemoryAccountApi;
    use crate::model::{BucketSpec, PermissionScope, PermissionSpec, Actions};
    use crate::storage::memory::MemoryStorage;
    use crate::tags::TagSet;

    fn bucket(name: &str) -> DesiredState {
        DesiredState::Bucket(BucketSpec {
            name: name.into(),
            object_lock: false,
            force_destroy: false,
            tags: TagSet::new(),
        })
    }

    #[tokio::test]
    async fn test_invalid_desired_state_makes_no_calls() {
        let storage = Arc::new(MemoryStorage::new());
        let ctx = context(&storage, &Arc::new(MemoryAccountApi::new()));
        let err = create(&ctx, &bucket("B")).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Invalid { .. }), "{err}");
        assert!(storage.journal().is_empty());
    }

    #[tokio::test]
    async fn test_missing_client_is_reported_per_resource() {
        let mut ctx = context(&Arc::new(MemoryStorage::new()), &Arc::new(MemoryAccountApi::new()));
        ctx.clients.storage = None;
        let err = create(&ctx, &bucket("photos")).await.unwrap_err();
        assert_eq!(err.to_string(), "bucket (photos): credentials for S3 operations are missing");
    }

    #[tokio::test]
    async fn test_converge_creates_then_is_stable() {
        let storage = Arc::new(MemoryStorage::new());
        let ctx = context(&storage, &Arc::new(MemoryAccountApi::new()));
        let desired = bucket("photos");

        let first = converge(&ctx, &desired, None).await.unwrap();
        storage.clear_journal();
        let second = converge(&ctx, &desired, Some(&first)).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(storage.count(crate::storage::memory::Call::CreateBucket), 0);
    }

    #[tokio::test]
    async fn test_converge_recreates_vanished_resource() {
        let storage = Arc::new(MemoryStorage::new());
        let ctx = context(&storage, &Arc::new(MemoryAccountApi::new()));
        let desired = bucket("photos");

        let first = converge(&ctx, &desired, None).await.unwrap();
        delete(&ctx, &desired, &first).await.unwrap();
        assert!(!storage.bucket_exists("photos").await);

        converge(&ctx, &desired, Some(&first)).await.unwrap();
        assert!(storage.bucket_exists("photos").await);
    }

    #[tokio::test]
    async fn test_converge_object_copy_follows_source() {
        use crate::storage::backend::{ObjectStorage, PutObjectRequest};
        use crate::storage::memory::Call;

        let storage = Arc::new(MemoryStorage::new());
        let ctx = context(&storage, &Arc::new(MemoryAccountApi::new()));
        storage.create_bucket("photos", false).await.unwrap();
        let upload = |body: &'static str| PutObjectRequest {
            bucket: "photos".into(),
            key: "a.txt".into(),
            body: body.into(),
            ..Default::default()
        };
        storage.put_object(upload("v1")).await.unwrap();
        let desired: DesiredState =
            serde_yaml::from_str("kind: object_copy\nbucket: photos\nkey: b.txt\nsource: photos/a.txt\n").unwrap();

        let first = converge(&ctx, &desired, None).await.unwrap();
        let second = converge(&ctx, &desired, Some(&first)).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(storage.count(Call::CopyObject), 1);

        storage.put_object(upload("v2")).await.unwrap();
        let third = converge(&ctx, &desired, Some(&second)).await.unwrap();
        assert_ne!(third, second);
        assert_eq!(storage.count(Call::CopyObject), 2);
    }

    #[tokio::test]
    async fn test_kind_mismatch_is_rejected() {
        let storage = Arc::new(MemoryStorage::new());
        let account = Arc::new(MemoryAccountApi::new());
        let ctx = context(&storage, &account);
        let observed = converge(&ctx, &bucket("photos"), None).await.unwrap();
        let permission = DesiredState::Permission(PermissionSpec {
            name: Some("readers".into()),
            name_prefix: None,
            description: String::new(),
            actions: Actions::ReadOnly,
            scope: PermissionScope::AllBuckets,
        });
        let err = update(&ctx, &permission, &observed).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Immutable { field: "kind", .. }));
    }
}
