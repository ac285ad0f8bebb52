//! In-memory account API.
//!
//! Holds permissions and service accounts in a `tokio::sync::RwLock`.  Like
//! [`crate::storage::memory::MemoryStorage`] it records every call and can
//! be told to fail the next call of a given kind, which is how the
//! reconcilers' retry paths are tested.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::debug;

use super::api::{
    AccountApi, AccountFuture, AccountResult, PermissionInput, PermissionRecord,
    ServiceAccountCreated, ServiceAccountInput, ServiceAccountRecord,
};
use crate::errors::{codes, AccountError};

/// Kinds of calls recorded in the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccountCall {
    CreatePermission,
    GetPermission,
    UpdatePermission,
    DeletePermission,
    CreateServiceAccount,
    GetServiceAccount,
    UpdateServiceAccount,
    EnableServiceAccount,
    DisableServiceAccount,
    DeleteServiceAccount,
}

/// In-memory [`AccountApi`] implementation.
pub struct MemoryAccountApi {
    permissions: tokio::sync::RwLock<HashMap<String, PermissionRecord>>,
    service_accounts: tokio::sync::RwLock<HashMap<String, ServiceAccountRecord>>,
    journal: Mutex<Vec<AccountCall>>,
    failures: Mutex<HashMap<AccountCall, VecDeque<AccountError>>>,
    next_id: AtomicU64,
}

impl Default for MemoryAccountApi {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryAccountApi {
    pub fn new() -> Self {
        Self {
            permissions: tokio::sync::RwLock::new(HashMap::new()),
            service_accounts: tokio::sync::RwLock::new(HashMap::new()),
            journal: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn new_id(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Make the next `call` fail with `err` before touching any state.
    pub fn fail_next(&self, call: AccountCall, err: AccountError) {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        failures.entry(call).or_default().push_back(err);
    }

    /// Number of times `call` was made.
    pub fn count(&self, call: AccountCall) -> usize {
        self.journal
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|c| **c == call)
            .count()
    }

    /// Snapshot of every call made so far.
    pub fn journal(&self) -> Vec<AccountCall> {
        self.journal.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Stored permission, bypassing the journal.
    pub async fn permission(&self, id: &str) -> Option<PermissionRecord> {
        self.permissions.read().await.get(id).cloned()
    }

    /// Stored service account, bypassing the journal.
    pub async fn service_account(&self, id: &str) -> Option<ServiceAccountRecord> {
        self.service_accounts.read().await.get(id).cloned()
    }

    fn enter(&self, call: AccountCall) -> AccountResult<()> {
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

fn permission_not_found(id: &str) -> AccountError {
    AccountError::new(
        codes::PERMISSION_NOT_FOUND,
        Some(404),
        format!("permission {id} does not exist"),
    )
}

fn service_account_not_found(id: &str) -> AccountError {
    AccountError::new(
        codes::SERVICE_ACCOUNT_NOT_FOUND,
        Some(404),
        format!("service account {id} does not exist"),
    )
}

fn apply_permission(record: &mut PermissionRecord, input: &PermissionInput) {
    record.name = input.name.clone();
    record.description = input.description.clone();
    record.kind = input.kind;
    record.actions = input.actions.clone();
    record.prefix = input.prefix.clone();
    record.buckets = input.buckets.clone();
    record.policy = input.policy.clone();
}

impl AccountApi for MemoryAccountApi {
    fn create_permission<'a>(&'a self, input: &'a PermissionInput) -> AccountFuture<'a, String> {
        Box::pin(async move {
            self.enter(AccountCall::CreatePermission)?;
            let mut permissions = self.permissions.write().await;
            if permissions.values().any(|p| p.name == input.name) {
                return Err(AccountError::new(
                    "PermissionNameAlreadyExists",
                    Some(409),
                    format!("permission {} already exists", input.name),
                ));
            }
            let id = self.new_id("perm");
            let mut record = PermissionRecord {
                id: id.clone(),
                ready_state: true,
                ..Default::default()
            };
            apply_permission(&mut record, input);
            permissions.insert(id.clone(), record);
            Ok(id)
        })
    }

    fn get_permission<'a>(&'a self, id: &'a str) -> AccountFuture<'a, PermissionRecord> {
        Box::pin(async move {
            self.enter(AccountCall::GetPermission)?;
            self.permissions
                .read()
                .await
                .get(id)
                .cloned()
                .ok_or_else(|| permission_not_found(id))
        })
    }

    fn update_permission<'a>(&'a self, id: &'a str, input: &'a PermissionInput) -> AccountFuture<'a, ()> {
        Box::pin(async move {
            self.enter(AccountCall::UpdatePermission)?;
            let mut permissions = self.permissions.write().await;
            let record = permissions.get_mut(id).ok_or_else(|| permission_not_found(id))?;
            apply_permission(record, input);
            Ok(())
        })
    }

    fn delete_permission<'a>(&'a self, id: &'a str) -> AccountFuture<'a, ()> {
        Box::pin(async move {
            self.enter(AccountCall::DeletePermission)?;
            self.permissions
                .write()
                .await
                .remove(id)
                .map(|_| ())
                .ok_or_else(|| permission_not_found(id))
        })
    }

    fn create_service_account<'a>(
        &'a self,
        input: &'a ServiceAccountInput,
    ) -> AccountFuture<'a, ServiceAccountCreated> {
        Box::pin(async move {
            self.enter(AccountCall::CreateServiceAccount)?;
            {
                let permissions = self.permissions.read().await;
                if let Some(missing) = input.permissions.iter().find(|p| !permissions.contains_key(*p)) {
                    return Err(permission_not_found(missing));
                }
            }
            let id = self.new_id("sa");
            let record = ServiceAccountRecord {
                id: id.clone(),
                name: input.name.clone(),
                description: input.description.clone(),
                enabled: true,
                ready_state: true,
                permissions: input.permissions.clone(),
            };
            self.service_accounts.write().await.insert(id.clone(), record);
            Ok(ServiceAccountCreated {
                access_key: format!("AK{}", id.to_uppercase().replace('-', "")),
                secret: uuid::Uuid::new_v4().simple().to_string(),
                id,
            })
        })
    }

    fn get_service_account<'a>(&'a self, id: &'a str) -> AccountFuture<'a, ServiceAccountRecord> {
        Box::pin(async move {
            self.enter(AccountCall::GetServiceAccount)?;
            self.service_accounts
                .read()
                .await
                .get(id)
                .cloned()
                .ok_or_else(|| service_account_not_found(id))
        })
    }

    fn update_service_account<'a>(
        &'a self,
        id: &'a str,
        input: &'a ServiceAccountInput,
    ) -> AccountFuture<'a, ()> {
        Box::pin(async move {
            self.enter(AccountCall::UpdateServiceAccount)?;
            let mut accounts = self.service_accounts.write().await;
            let record = accounts.get_mut(id).ok_or_else(|| service_account_not_found(id))?;
            record.name = input.name.clone();
            record.description = input.description.clone();
            record.permissions = input.permissions.clone();
            Ok(())
        })
    }

    fn enable_service_account<'a>(&'a self, id: &'a str) -> AccountFuture<'a, ()> {
        Box::pin(async move {
            self.enter(AccountCall::EnableServiceAccount)?;
            let mut accounts = self.service_accounts.write().await;
            let record = accounts.get_mut(id).ok_or_else(|| service_account_not_found(id))?;
            record.enabled = true;
            Ok(())
        })
    }

    fn disable_service_account<'a>(&'a self, id: &'a str) -> AccountFuture<'a, ()> {
        Box::pin(async move {
            self.enter(AccountCall::DisableServiceAccount)?;
            let mut accounts = self.service_accounts.write().await;
            let record = accounts.get_mut(id).ok_or_else(|| service_account_not_found(id))?;
            record.enabled = false;
            Ok(())
        })
    }

    fn delete_service_account<'a>(&'a self, id: &'a str) -> AccountFuture<'a, ()> {
        Box::pin(async move {
            self.enter(AccountCall::DeleteServiceAccount)?;
            self.service_accounts
                .write()
                .await
                .remove(id)
                .map(|_| ())
                .ok_or_else(|| service_account_not_found(id))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::api::PermissionType;

    fn readers() -> PermissionInput {
        PermissionInput {
            name: "readers".into(),
            kind: PermissionType::AllBuckets,
            actions: "read-only".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_permission_lifecycle() {
        let api = MemoryAccountApi::new();
        let id = api.create_permission(&readers()).await.unwrap();
        let record = api.get_permission(&id).await.unwrap();
        assert_eq!(record.name, "readers");
        assert!(record.ready_state);

        let mut changed = readers();
        changed.actions = "write-only".into();
        api.update_permission(&id, &changed).await.unwrap();
        assert_eq!(api.permission(&id).await.unwrap().actions, "write-only");

        api.delete_permission(&id).await.unwrap();
        let err = api.get_permission(&id).await.unwrap_err();
        assert_eq!(err.code, codes::PERMISSION_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_duplicate_permission_name_rejected() {
        let api = MemoryAccountApi::new();
        api.create_permission(&readers()).await.unwrap();
        assert!(api.create_permission(&readers()).await.is_err());
    }

    #[tokio::test]
    async fn test_service_account_requires_known_permissions() {
        let api = MemoryAccountApi::new();
        let input = ServiceAccountInput {
            name: "ci".into(),
            description: String::new(),
            permissions: vec!["perm-404".into()],
        };
        let err = api.create_service_account(&input).await.unwrap_err();
        assert_eq!(err.code, codes::PERMISSION_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_service_account_enable_disable() {
        let api = MemoryAccountApi::new();
        let perm = api.create_permission(&readers()).await.unwrap();
        let created = api
            .create_service_account(&ServiceAccountInput {
                name: "ci".into(),
                description: "pipeline".into(),
                permissions: vec![perm],
            })
            .await
            .unwrap();
        assert!(!created.access_key.is_empty());
        assert!(!created.secret.is_empty());

        api.disable_service_account(&created.id).await.unwrap();
        assert!(!api.service_account(&created.id).await.unwrap().enabled);
        api.enable_service_account(&created.id).await.unwrap();
        assert!(api.service_account(&created.id).await.unwrap().enabled);
    }

    #[tokio::test]
    async fn test_injected_failure_is_returned_once() {
        let api = MemoryAccountApi::new();
        api.fail_next(
            AccountCall::GetPermission,
            AccountError::new(codes::INTERNAL_ERROR, Some(500), "boom"),
        );
        let err = api.get_permission("perm-1").await.unwrap_err();
        assert_eq!(err.code, codes::INTERNAL_ERROR);
        let err = api.get_permission("perm-1").await.unwrap_err();
        assert_eq!(err.code, codes::PERMISSION_NOT_FOUND);
        assert_eq!(api.count(AccountCall::GetPermission), 2);
    }
}
