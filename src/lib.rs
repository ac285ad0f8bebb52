//! storeconverge library -- convergent reconciliation of storage resources.
//!
//! This crate drives buckets, objects, permissions and service accounts on
//! an eventually-consistent object-storage API and its account API to a
//! declared desired state.  It provides the error classification table, the
//! retry driver, tag and policy reconciliation, the recursive bucket
//! destroyer, and one reconciler per resource kind.

use std::sync::Arc;
use std::time::Duration;

pub mod account;
pub mod classify;
pub mod config;
pub mod destroy;
pub mod errors;
pub mod manifest;
pub mod metrics;
pub mod model;
pub mod policy;
pub mod resources;
pub mod retry;
pub mod storage;
pub mod tags;

use crate::account::api::AccountApi;
use crate::config::Config;
use crate::storage::backend::ObjectStorage;

/// The two remote API clients, shared by every reconciliation.
///
/// A client is `None` when its credentials are not configured; resources
/// that need it then fail with a "credentials missing" error.
#[derive(Clone, Default)]
pub struct Clients {
    /// Object-storage API.
    pub storage: Option<Arc<dyn ObjectStorage>>,
    /// Account API.
    pub account: Option<Arc<dyn AccountApi>>,
}

impl Clients {
    /// Build the clients described by `config`.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let storage: Option<Arc<dyn ObjectStorage>> = match config.object_storage.backend.as_str() {
            "memory" => Some(Arc::new(storage::memory::MemoryStorage::with_region(
                &config.object_storage.region,
            ))),
            "s3" if config.object_storage.has_credentials() => {
                let settings = storage::s3::S3Settings {
                    endpoint_url: Some(config.object_storage.endpoint_url.clone())
                        .filter(|e| !e.is_empty()),
                    region: config.object_storage.region.clone(),
                    access_key_id: Some(config.object_storage.access_key_id.clone()),
                    secret_access_key: Some(config.object_storage.secret_access_key.clone()),
                    force_path_style: config.object_storage.use_path_style,
                };
                Some(Arc::new(storage::s3::S3Storage::new(settings).await?))
            }
            "s3" => None,
            other => anyhow::bail!("unknown object_storage.backend: '{other}'. Supported: s3, memory"),
        };

        let account: Option<Arc<dyn AccountApi>> = match config.account_api.backend.as_str() {
            "memory" => Some(Arc::new(account::memory::MemoryAccountApi::new())),
            "http" if config.account_api.has_credentials() => {
                let credentials = account::http::AccountCredentials {
                    account_id: config.account_api.account_id.clone(),
                    access_key: config.account_api.access_key.clone(),
                    secret: config.account_api.secret.clone(),
                };
                let client = account::http::HttpAccountClient::new(
                    &config.account_api.base_url,
                    credentials,
                    Duration::from_secs(config.account_api.request_timeout_seconds),
                )?;
                Some(Arc::new(client))
            }
            "http" => None,
            other => anyhow::bail!("unknown account_api.backend: '{other}'. Supported: http, memory"),
        };

        Ok(Self { storage, account })
    }
}
