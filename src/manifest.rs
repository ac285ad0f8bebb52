//! Manifest and state files, and the apply/destroy runs over them.
//!
//! A manifest is a YAML list of desired resources, each with a unique id:
//!
//! ```yaml
//! resources:
//!   - id: photos
//!     kind: bucket
//!     name: photos
//!   - id: readers
//!     kind: permission
//!     name: readers
//!     actions: read-only
//!     scope: all_buckets
//!   - id: ci
//!     kind: service_account
//!     name: ci
//!     permissions: [readers]
//! ```
//!
//! A service account may name a permission by its manifest id; the id is
//! replaced with the permission's account-API id once that permission has
//! been observed.
//!
//! The state file is JSON.  It records, in creation order, the desired and
//! observed state of every resource this tool manages, so resources removed
//! from the manifest can still be deleted.

use std::collections::HashSet;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::errors::ReconcileError;
use crate::model::{DesiredState, ObservedState};
use crate::resources::{self, ReconcileContext};

/// One desired resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Manifest-local identifier.
    pub id: String,
    #[serde(flatten)]
    pub desired: DesiredState,
}

/// Parsed manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub resources: Vec<ManifestEntry>,
}

impl Manifest {
    /// Parse manifest YAML.
    pub fn from_yaml(text: &str) -> anyhow::Result<Self> {
        let manifest: Manifest = serde_yaml::from_str(text)?;
        let mut seen = HashSet::new();
        for entry in &manifest.resources {
            anyhow::ensure!(!entry.id.trim().is_empty(), "manifest entry with an empty id");
            anyhow::ensure!(seen.insert(entry.id.as_str()), "duplicate manifest id '{}'", entry.id);
        }
        Ok(manifest)
    }

    /// Read and parse a manifest file.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).with_context(|| format!("reading manifest {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing manifest {}", path.display()))
    }
}

/// A managed resource as recorded in the state file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateEntry {
    pub id: String,
    pub desired: DesiredState,
    pub observed: ObservedState,
}

/// Everything this tool manages, in creation order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    #[serde(default)]
    pub resources: Vec<StateEntry>,
}

impl State {
    /// Load the state file.  A missing file is an empty state.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(text) => serde_json::from_str(&text).with_context(|| format!("parsing state {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("reading state {}", path.display())),
        }
    }

    /// Write the state file, replacing it atomically.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        let tmp = path.with_extension("tmp");
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(&tmp, text).with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, path).with_context(|| format!("replacing {}", path.display()))?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&StateEntry> {
        self.resources.iter().find(|e| e.id == id)
    }

    /// Replace the entry with the same id, or append.
    pub fn upsert(&mut self, entry: StateEntry) {
        match self.resources.iter_mut().find(|e| e.id == entry.id) {
            Some(existing) => *existing = entry,
            None => self.resources.push(entry),
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<StateEntry> {
        let index = self.resources.iter().position(|e| e.id == id)?;
        Some(self.resources.remove(index))
    }
}

/// Replace permission references by manifest id with observed permission ids.
pub fn resolve_references(desired: &DesiredState, state: &State) -> DesiredState {
    let DesiredState::ServiceAccount(spec) = desired else {
        return desired.clone();
    };
    let mut spec = spec.clone();
    for permission in &mut spec.permissions {
        if let Some(StateEntry {
            observed: ObservedState::Permission(observed),
            ..
        }) = state.get(permission)
        {
            *permission = observed.id.clone();
        }
    }
    DesiredState::ServiceAccount(spec)
}

/// A resource that failed to reconcile.
#[derive(Debug)]
pub struct Failure {
    pub id: String,
    pub error: ReconcileError,
}

/// Outcome of an apply or destroy run.
#[derive(Debug, Default)]
pub struct Report {
    pub converged: usize,
    pub deleted: usize,
    pub failures: Vec<Failure>,
}

impl Report {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Converge every manifest entry in order, then delete managed resources
/// that are no longer in the manifest.
pub async fn apply(ctx: &ReconcileContext, manifest: &Manifest, state: &mut State) -> Report {
    let mut report = Report::default();

    for entry in &manifest.resources {
        if ctx.cancel.is_cancelled() {
            warn!("apply cancelled");
            return report;
        }
        let desired = resolve_references(&entry.desired, state);
        let prior = state.get(&entry.id).map(|e| e.observed.clone());

        match resources::converge(ctx, &desired, prior.as_ref()).await {
            Ok(observed) => {
                info!(id = %entry.id, resource = %desired.describe(), "converged");
                state.upsert(StateEntry {
                    id: entry.id.clone(),
                    desired,
                    observed,
                });
                report.converged += 1;
            }
            Err(error) => {
                error!(id = %entry.id, %error, "reconcile failed");
                report.failures.push(Failure {
                    id: entry.id.clone(),
                    error,
                });
            }
        }
    }

    let wanted: HashSet<&str> = manifest.resources.iter().map(|e| e.id.as_str()).collect();
    let orphans: Vec<StateEntry> = state
        .resources
        .iter()
        .rev()
        .filter(|e| !wanted.contains(e.id.as_str()))
        .cloned()
        .collect();
    for orphan in orphans {
        if ctx.cancel.is_cancelled() {
            break;
        }
        delete_entry(ctx, state, orphan, &mut report).await;
    }

    report
}

/// Delete managed resources, newest first.  With `only`, just the entries
/// that manifest names are deleted.
pub async fn destroy(ctx: &ReconcileContext, state: &mut State, only: Option<&Manifest>) -> Report {
    let mut report = Report::default();
    let selected: Option<HashSet<&str>> = only.map(|m| m.resources.iter().map(|e| e.id.as_str()).collect());
    let entries: Vec<StateEntry> = state
        .resources
        .iter()
        .rev()
        .filter(|e| selected.as_ref().map_or(true, |ids| ids.contains(e.id.as_str())))
        .cloned()
        .collect();
    for entry in entries {
        if ctx.cancel.is_cancelled() {
            warn!("destroy cancelled");
            break;
        }
        delete_entry(ctx, state, entry, &mut report).await;
    }
    report
}

async fn delete_entry(ctx: &ReconcileContext, state: &mut State, entry: StateEntry, report: &mut Report) {
    match resources::delete(ctx, &entry.desired, &entry.observed).await {
        Ok(()) => {
            info!(id = %entry.id, resource = %entry.desired.describe(), "deleted");
            state.remove(&entry.id);
            report.deleted += 1;
        }
        Err(error) => {
            error!(id = %entry.id, %error, "delete failed");
            report.failures.push(Failure { id: entry.id, error });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::account::memory::MemoryAccountApi;
    use crate::resources::testing::context;
    use crate::storage::memory::{Call, MemoryStorage};

    const MANIFEST: &str = r#"
resources:
  - id: photos
    kind: bucket
    name: photos
    tags:
      team: media
  - id: readers
    kind: permission
    name: readers
    actions: read-only
    scope:
      bucket_prefix: photos
  - id: ci
    kind: service_account
    name: ci
    permissions: [readers]
"#;

    fn setup() -> (Arc<MemoryStorage>, Arc<MemoryAccountApi>, ReconcileContext) {
        let storage = Arc::new(MemoryStorage::new());
        let account = Arc::new(MemoryAccountApi::new());
        let ctx = context(&storage, &account);
        (storage, account, ctx)
    }

    #[test]
    fn test_manifest_parses_kinds() {
        let manifest = Manifest::from_yaml(MANIFEST).unwrap();
        let kinds: Vec<_> = manifest.resources.iter().map(|e| e.desired.kind()).collect();
        assert_eq!(kinds, vec!["bucket", "permission", "service_account"]);
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let text = r#"
resources:
  - {id: a, kind: bucket, name: bucket-one}
  - {id: a, kind: bucket, name: bucket-two}
"#;
        let err = Manifest::from_yaml(text).unwrap_err();
        assert!(err.to_string().contains("duplicate manifest id 'a'"));
    }

    #[test]
    fn test_state_missing_file_is_empty_and_saves() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let state = State::load(&path).unwrap();
        assert!(state.resources.is_empty());
        state.save(&path).unwrap();
        assert_eq!(State::load(&path).unwrap(), state);
    }

    #[tokio::test]
    async fn test_apply_resolves_permission_reference_and_is_stable() {
        let (storage, account, ctx) = setup();
        let manifest = Manifest::from_yaml(MANIFEST).unwrap();
        let mut state = State::default();

        let report = apply(&ctx, &manifest, &mut state).await;
        assert!(report.is_success(), "{:?}", report.failures);
        assert_eq!(report.converged, 3);

        let Some(StateEntry {
            observed: ObservedState::ServiceAccount(sa),
            ..
        }) = state.get("ci")
        else {
            panic!("service account missing from state");
        };
        let Some(StateEntry {
            observed: ObservedState::Permission(permission),
            ..
        }) = state.get("readers")
        else {
            panic!("permission missing from state");
        };
        assert_eq!(sa.permissions, vec![permission.id.clone()]);
        let stored = account.service_account(&sa.id).await.unwrap();
        assert_eq!(stored.permissions, vec![permission.id.clone()]);

        // Persist and converge again: nothing is created twice.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        state.save(&path).unwrap();
        let mut reloaded = State::load(&path).unwrap();
        storage.clear_journal();
        let report = apply(&ctx, &manifest, &mut reloaded).await;
        assert!(report.is_success());
        assert_eq!(storage.count(Call::CreateBucket), 0);
        assert_eq!(reloaded, state);
    }

    #[tokio::test]
    async fn test_apply_prunes_removed_resources() {
        let (storage, _, ctx) = setup();
        let mut state = State::default();
        let both = Manifest::from_yaml(
            "resources:\n  - {id: a, kind: bucket, name: bucket-a}\n  - {id: b, kind: bucket, name: bucket-b}\n",
        )
        .unwrap();
        apply(&ctx, &both, &mut state).await;

        let one = Manifest::from_yaml("resources:\n  - {id: a, kind: bucket, name: bucket-a}\n").unwrap();
        let report = apply(&ctx, &one, &mut state).await;
        assert_eq!(report.deleted, 1);
        assert!(!storage.bucket_exists("bucket-b").await);
        assert_eq!(state.resources.len(), 1);
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_other_resources() {
        let (storage, _, ctx) = setup();
        let manifest = Manifest::from_yaml(
            "resources:\n  - {id: bad, kind: bucket, name: Bad_Name}\n  - {id: good, kind: bucket, name: good-bucket}\n",
        )
        .unwrap();
        let mut state = State::default();
        let report = apply(&ctx, &manifest, &mut state).await;
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].id, "bad");
        assert!(storage.bucket_exists("good-bucket").await);
        assert!(state.get("bad").is_none());
    }

    #[tokio::test]
    async fn test_destroy_deletes_newest_first() {
        let (storage, account, ctx) = setup();
        let manifest = Manifest::from_yaml(MANIFEST).unwrap();
        let mut state = State::default();
        apply(&ctx, &manifest, &mut state).await;

        let only_ci = Manifest::from_yaml("resources:\n  - {id: ci, kind: service_account, name: ci, permissions: [readers]}\n").unwrap();
        let report = destroy(&ctx, &mut state, Some(&only_ci)).await;
        assert_eq!(report.deleted, 1);
        assert_eq!(state.resources.len(), 2);

        let report = destroy(&ctx, &mut state, None).await;
        assert!(report.is_success(), "{:?}", report.failures);
        assert!(state.resources.is_empty());
        assert!(!storage.bucket_exists("photos").await);

        let journal = account.journal();
        let sa = journal
            .iter()
            .position(|c| *c == crate::account::memory::AccountCall::DeleteServiceAccount)
            .unwrap();
        let perm = journal
            .iter()
            .position(|c| *c == crate::account::memory::AccountCall::DeletePermission)
            .unwrap();
        assert!(sa < perm);
    }
}
