//! Permission reconciler (account API).

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{retry_failure, ReadOutcome, ReadPass, ReconcileContext};
use crate::account::api::{PermissionInput, PermissionType};
use crate::classify::{is_not_found, ClassifyMode};
use crate::errors::{codes, ReconcileError};
use crate::model::{PermissionObserved, PermissionScope, PermissionSpec};
use crate::policy::{self, PolicyError};
use crate::retry::{retry, retry_when_codes, Attempt, RetryError};

/// Prefix of generated names when neither `name` nor `name_prefix` is set.
pub const GENERATED_NAME_PREFIX: &str = "storeconverge-";

fn describe(name: &str) -> String {
    format!("permission ({name})")
}

fn policy_error<'a>(resource: &'a str, operation: &'static str) -> impl FnOnce(PolicyError) -> ReconcileError + 'a {
    move |source| ReconcileError::Policy {
        resource: resource.to_string(),
        operation,
        source,
    }
}

/// Pick the name for a new permission.
pub fn resolve_name(spec: &PermissionSpec) -> String {
    match (&spec.name, &spec.name_prefix) {
        (Some(name), _) => name.clone(),
        (None, Some(prefix)) => format!("{prefix}{}", Uuid::new_v4().simple()),
        (None, None) => format!("{GENERATED_NAME_PREFIX}{}", Uuid::new_v4().simple()),
    }
}

/// Name to keep on update.  A generated name survives as long as it still
/// matches the requested prefix.
fn desired_name(spec: &PermissionSpec, observed: &PermissionObserved) -> String {
    if let Some(name) = &spec.name {
        return name.clone();
    }
    let prefix = spec.name_prefix.as_deref().unwrap_or(GENERATED_NAME_PREFIX);
    if observed.name.starts_with(prefix) {
        observed.name.clone()
    } else {
        resolve_name(spec)
    }
}

/// The text a refreshed remote policy is compared against.
pub fn prior_policy(spec: &PermissionSpec, observed: &PermissionObserved) -> String {
    match &spec.scope {
        PermissionScope::Policy(doc) => doc.clone(),
        _ => observed.policy.clone(),
    }
}

/// Request body for `spec`.  Updates of an all-buckets permission must
/// name the wildcard bucket explicitly.
fn build_input(
    spec: &PermissionSpec,
    name: String,
    updating: bool,
    resource: &str,
) -> Result<PermissionInput, ReconcileError> {
    let mut input = PermissionInput {
        name,
        description: spec.description.clone(),
        kind: spec.scope.kind(),
        actions: spec.actions.as_str().to_string(),
        ..Default::default()
    };
    match &spec.scope {
        PermissionScope::AllBuckets if updating => input.buckets = vec!["*".to_string()],
        PermissionScope::AllBuckets => {}
        PermissionScope::BucketPrefix(prefix) => input.prefix = prefix.clone(),
        PermissionScope::Buckets(buckets) => input.buckets = buckets.clone(),
        PermissionScope::Policy(doc) => {
            input.policy = policy::normalize(doc).map_err(policy_error(resource, "normalize policy"))?;
        }
    }
    Ok(input)
}

/// Create the permission and read it back.
pub async fn create(ctx: &ReconcileContext, spec: &PermissionSpec) -> Result<PermissionObserved, ReconcileError> {
    let name = resolve_name(spec);
    let resource = describe(&name);
    let account = ctx.account(&resource)?;
    let input = build_input(spec, name, false, &resource)?;

    let id = retry_when_codes(
        &ctx.policy(ctx.timeouts.create),
        &ctx.cancel,
        ClassifyMode::Strict,
        &[codes::TOO_MANY_REQUESTS, codes::SERVICE_UNAVAILABLE],
        || account.create_permission(&input),
    )
    .await
    .map_err(|e| retry_failure(&resource, "create permission", e))?;
    info!(id = %id, name = %input.name, kind = input.kind.as_str(), "permission created");

    read(ctx, &id, ReadPass::AfterCreate, &input.policy)
        .await?
        .found(&resource, "read permission")
}

/// Observe the permission.  `prior_policy` is the policy text already
/// known; an equivalent remote document keeps that text.
pub async fn read(
    ctx: &ReconcileContext,
    id: &str,
    pass: ReadPass,
    prior_policy: &str,
) -> Result<ReadOutcome<PermissionObserved>, ReconcileError> {
    let resource = describe(id);
    let account = ctx.account(&resource)?;

    let record = retry(&ctx.policy(ctx.timeouts.read), &ctx.cancel, || async move {
        match account.get_permission(id).await {
            Ok(record) => Attempt::Done(record),
            Err(e) if e.is_code(codes::INTERNAL_ERROR) => Attempt::Retry(e),
            Err(e) if pass == ReadPass::AfterCreate && is_not_found(&e) => Attempt::Retry(e),
            Err(e) => Attempt::Fail(e),
        }
    })
    .await;
    let record = match record {
        Ok(record) => record,
        Err(RetryError::Failed(e)) if pass == ReadPass::Refresh && is_not_found(&e) => {
            warn!(id, "permission not found, dropping from state");
            return Ok(ReadOutcome::Gone);
        }
        Err(e) => return Err(retry_failure(&resource, "read permission", e)),
    };

    let policy = if record.policy.trim().is_empty() {
        String::new()
    } else {
        let remote = policy::unescape_policy(&record.policy).map_err(policy_error(&resource, "decode policy"))?;
        policy::reconcile_policy(prior_policy, &remote).map_err(policy_error(&resource, "compare policy"))?
    };
    let all_buckets = record.kind == PermissionType::AllBuckets;

    Ok(ReadOutcome::Found(PermissionObserved {
        id: record.id,
        name: record.name,
        description: record.description,
        kind: record.kind,
        actions: record.actions,
        prefix: if all_buckets { String::new() } else { record.prefix },
        buckets: if all_buckets { Vec::new() } else { record.buckets },
        policy,
        ready_state: record.ready_state,
    }))
}

/// Whether the observed permission already matches `wanted`.
fn matches(
    spec: &PermissionSpec,
    wanted: &PermissionInput,
    observed: &PermissionObserved,
    resource: &str,
) -> Result<bool, ReconcileError> {
    let common = observed.name == wanted.name
        && observed.description == wanted.description
        && observed.kind == wanted.kind
        && observed.actions == wanted.actions;
    if !common {
        return Ok(false);
    }
    Ok(match &spec.scope {
        PermissionScope::AllBuckets => true,
        PermissionScope::BucketPrefix(prefix) => observed.prefix == *prefix,
        PermissionScope::Buckets(buckets) => observed.buckets == *buckets,
        PermissionScope::Policy(doc) => {
            !observed.policy.is_empty()
                && policy::equivalent(&observed.policy, doc).map_err(policy_error(resource, "compare policy"))?
        }
    })
}

/// Replace the permission's mutable fields when they drifted.
pub async fn update(
    ctx: &ReconcileContext,
    spec: &PermissionSpec,
    observed: &PermissionObserved,
) -> Result<PermissionObserved, ReconcileError> {
    let resource = describe(&observed.name);
    let input = build_input(spec, desired_name(spec, observed), true, &resource)?;
    if matches(spec, &input, observed, &resource)? {
        return Ok(observed.clone());
    }

    let account = ctx.account(&resource)?;
    retry_when_codes(
        &ctx.policy(ctx.timeouts.update),
        &ctx.cancel,
        ClassifyMode::Strict,
        &[codes::TOO_MANY_REQUESTS, codes::SERVICE_UNAVAILABLE],
        || account.update_permission(&observed.id, &input),
    )
    .await
    .map_err(|e| retry_failure(&resource, "update permission", e))?;
    debug!(id = %observed.id, "permission updated");

    read(ctx, &observed.id, ReadPass::Refresh, &prior_policy(spec, observed))
        .await?
        .found(&resource, "read permission")
}

/// Delete the permission.  An unknown id counts as deleted.
pub async fn delete(ctx: &ReconcileContext, id: &str) -> Result<(), ReconcileError> {
    let resource = describe(id);
    let account = ctx.account(&resource)?;
    match account.delete_permission(id).await {
        Ok(()) => {
            info!(id, "permission deleted");
            Ok(())
        }
        Err(e) if is_not_found(&e) => {
            debug!(id, "permission already gone");
            Ok(())
        }
        Err(e) => Err(ReconcileError::remote(resource, "delete permission", e)),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::super::testing::context;
    use super::*;
    use crate::account::memory::{AccountCall, MemoryAccountApi};
    use crate::errors::AccountError;
    use crate::model::Actions;
    use crate::storage::memory::MemoryStorage;

    fn spec(name: &str, scope: PermissionScope) -> PermissionSpec {
        PermissionSpec {
            name: Some(name.into()),
            name_prefix: None,
            description: "test".into(),
            actions: Actions::ReadOnly,
            scope,
        }
    }

    fn setup() -> (Arc<MemoryAccountApi>, ReconcileContext) {
        let account = Arc::new(MemoryAccountApi::new());
        let ctx = context(&Arc::new(MemoryStorage::new()), &account);
        (account, ctx)
    }

    #[test]
    fn test_resolve_name() {
        let named = spec("readers", PermissionScope::AllBuckets);
        assert_eq!(resolve_name(&named), "readers");

        let mut prefixed = named.clone();
        prefixed.name = None;
        prefixed.name_prefix = Some("team-".into());
        let name = resolve_name(&prefixed);
        assert!(name.starts_with("team-"));
        assert_ne!(name, resolve_name(&prefixed));

        prefixed.name_prefix = None;
        assert!(resolve_name(&prefixed).starts_with(GENERATED_NAME_PREFIX));
    }

    #[tokio::test]
    async fn test_create_bucket_prefix_permission() {
        let (account, ctx) = setup();
        let observed = create(&ctx, &spec("logs", PermissionScope::BucketPrefix("logs-".into())))
            .await
            .unwrap();
        assert_eq!(observed.kind, PermissionType::BucketPrefix);
        assert_eq!(observed.prefix, "logs-");
        assert_eq!(observed.actions, "read-only");
        assert!(observed.ready_state);
        assert_eq!(account.count(AccountCall::CreatePermission), 1);
    }

    #[tokio::test]
    async fn test_invalid_policy_names_resource_and_step() {
        let (account, ctx) = setup();
        let err = create(&ctx, &spec("broken", PermissionScope::Policy("{\"Statement\": [".into())))
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Policy { operation: "normalize policy", .. }), "{err}");
        assert!(err.to_string().starts_with("permission (broken)"), "{err}");
        assert_eq!(account.count(AccountCall::CreatePermission), 0);
    }

    #[tokio::test]
    async fn test_all_buckets_update_sends_wildcard() {
        let (account, ctx) = setup();
        let mut desired = spec("everything", PermissionScope::AllBuckets);
        let observed = create(&ctx, &desired).await.unwrap();
        assert!(account.permission(&observed.id).await.unwrap().buckets.is_empty());

        desired.actions = Actions::AllOperations;
        let updated = update(&ctx, &desired, &observed).await.unwrap();
        let stored = account.permission(&observed.id).await.unwrap();
        assert_eq!(stored.buckets, vec!["*".to_string()]);
        assert!(updated.buckets.is_empty());
        assert_eq!(updated.actions, "all-operations");
    }

    #[tokio::test]
    async fn test_equivalent_policy_is_not_drift() {
        let (account, ctx) = setup();
        let doc = r#"{"Version":"2012-10-17","Statement":[{"Effect":"Allow","Action":["s3:GetObject","s3:ListBucket"],"Resource":"*"}]}"#;
        let reordered = r#"{"Statement":{"Resource":["*"],"Action":["s3:ListBucket","s3:GetObject"],"Effect":"Allow"},"Version":"2012-10-17"}"#;

        let observed = create(&ctx, &spec("policy", PermissionScope::Policy(doc.into())))
            .await
            .unwrap();
        assert_eq!(observed.kind, PermissionType::Policy);

        let again = update(&ctx, &spec("policy", PermissionScope::Policy(reordered.into())), &observed)
            .await
            .unwrap();
        assert_eq!(again, observed);
        assert_eq!(account.count(AccountCall::UpdatePermission), 0);
    }

    #[tokio::test]
    async fn test_read_retries_internal_error() {
        let (account, ctx) = setup();
        let observed = create(&ctx, &spec("p", PermissionScope::AllBuckets)).await.unwrap();
        account.fail_next(
            AccountCall::GetPermission,
            AccountError::new(codes::INTERNAL_ERROR, Some(500), "internal"),
        );
        let before = account.count(AccountCall::GetPermission);
        let outcome = read(&ctx, &observed.id, ReadPass::Refresh, "").await.unwrap();
        assert_eq!(outcome, ReadOutcome::Found(observed));
        assert_eq!(account.count(AccountCall::GetPermission), before + 2);
    }

    #[tokio::test]
    async fn test_refresh_unknown_permission_is_gone() {
        let (_, ctx) = setup();
        let outcome = read(&ctx, "perm-404", ReadPass::Refresh, "").await.unwrap();
        assert_eq!(outcome, ReadOutcome::Gone);
    }

    #[tokio::test]
    async fn test_duplicate_name_is_terminal() {
        let (account, ctx) = setup();
        create(&ctx, &spec("dup", PermissionScope::AllBuckets)).await.unwrap();
        let err = create(&ctx, &spec("dup", PermissionScope::AllBuckets)).await.unwrap_err();
        assert!(err.to_string().contains("PermissionNameAlreadyExists"), "{err}");
        assert_eq!(account.count(AccountCall::CreatePermission), 2);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (account, ctx) = setup();
        let observed = create(&ctx, &spec("p", PermissionScope::AllBuckets)).await.unwrap();
        delete(&ctx, &observed.id).await.unwrap();
        delete(&ctx, &observed.id).await.unwrap();
        assert!(account.permission(&observed.id).await.is_none());
    }

    #[tokio::test]
    async fn test_missing_account_client() {
        let (_, mut ctx) = setup();
        ctx.clients.account = None;
        let err = create(&ctx, &spec("p", PermissionScope::AllBuckets)).await.unwrap_err();
        assert_eq!(err.to_string(), "permission (p): credentials for account API operations are missing");
    }
}
