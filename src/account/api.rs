//! Abstract account API: permissions and service accounts.

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::errors::AccountError;

/// Result alias for account API calls.
pub type AccountResult<T> = Result<T, AccountError>;

/// Boxed future returned by every [`AccountApi`] call.
pub type AccountFuture<'a, T> = Pin<Box<dyn Future<Output = AccountResult<T>> + Send + 'a>>;

/// What a permission grants access to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PermissionType {
    /// Every bucket in the account.
    #[default]
    AllBuckets,
    /// Buckets whose names start with a prefix.
    BucketPrefix,
    /// An explicit list of buckets.
    BucketNames,
    /// A free-form access policy document.
    Policy,
}

impl PermissionType {
    /// Wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            PermissionType::AllBuckets => "all-buckets",
            PermissionType::BucketPrefix => "bucket-prefix",
            PermissionType::BucketNames => "bucket-names",
            PermissionType::Policy => "policy",
        }
    }
}

/// Body of a permission create or update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PermissionInput {
    pub name: String,
    pub description: String,
    #[serde(rename = "type")]
    pub kind: PermissionType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub actions: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub prefix: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub buckets: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub policy: String,
}

/// A permission as stored by the account API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct PermissionRecord {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(rename = "type")]
    pub kind: PermissionType,
    pub actions: String,
    pub prefix: String,
    pub buckets: Vec<String>,
    /// Percent-encoded policy document, for `policy` permissions.
    pub policy: String,
    pub ready_state: bool,
}

/// Body of a service-account create or update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAccountInput {
    pub name: String,
    pub description: String,
    /// Permission ids.
    pub permissions: Vec<String>,
}

/// Credentials returned once, when a service account is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAccountCreated {
    pub id: String,
    pub access_key: String,
    pub secret: String,
}

/// A service account as stored by the account API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceAccountRecord {
    pub id: String,
    pub name: String,
    pub description: String,
    pub enabled: bool,
    pub ready_state: bool,
    pub permissions: Vec<String>,
}

/// Async account API contract.
///
/// Not-found is reported with the `PermissionNotFound` or
/// `ServiceAccountNotFound` code.
pub trait AccountApi: Send + Sync + 'static {
    /// Create a permission, returning its id.
    fn create_permission<'a>(&'a self, input: &'a PermissionInput) -> AccountFuture<'a, String>;

    /// Fetch a permission.
    fn get_permission<'a>(&'a self, id: &'a str) -> AccountFuture<'a, PermissionRecord>;

    /// Replace a permission's mutable fields.
    fn update_permission<'a>(&'a self, id: &'a str, input: &'a PermissionInput) -> AccountFuture<'a, ()>;

    /// Delete a permission.
    fn delete_permission<'a>(&'a self, id: &'a str) -> AccountFuture<'a, ()>;

    /// Create a service account.
    fn create_service_account<'a>(
        &'a self,
        input: &'a ServiceAccountInput,
    ) -> AccountFuture<'a, ServiceAccountCreated>;

    /// Fetch a service account.
    fn get_service_account<'a>(&'a self, id: &'a str) -> AccountFuture<'a, ServiceAccountRecord>;

    /// Replace a service account's mutable fields.
    fn update_service_account<'a>(
        &'a self,
        id: &'a str,
        input: &'a ServiceAccountInput,
    ) -> AccountFuture<'a, ()>;

    /// Enable a service account.
    fn enable_service_account<'a>(&'a self, id: &'a str) -> AccountFuture<'a, ()>;

    /// Disable a service account.
    fn disable_service_account<'a>(&'a self, id: &'a str) -> AccountFuture<'a, ()>;

    /// Delete a service account.
    fn delete_service_account<'a>(&'a self, id: &'a str) -> AccountFuture<'a, ()>;
}
