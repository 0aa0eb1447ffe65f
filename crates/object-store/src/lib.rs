//! The orchestrator behind the control plane, reduced to what the session
//! lifecycle needs: CRUD + watch over sandbox and warm-pool objects, and
//! pod lookup for tunneling. Real deployments bind this to a cluster API;
//! tests and local development use the in-memory implementation.

use std::collections::BTreeMap;
use std::sync::Arc;

mod memory;

pub use memory::{MemoryClientFactory, MemoryStore};

/// Common object metadata, shared by every stored kind.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    /// Assigned by the store on create.
    pub uid: String,
    /// Monotonic per-object version, used for optimistic concurrency.
    pub resource_version: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl ObjectMeta {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    pub fn owned_by(&self, uid: &str) -> bool {
        self.owner_references.iter().any(|r| r.uid == uid)
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub kind: OwnerKind,
    pub name: String,
    pub uid: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum OwnerKind {
    Sandbox,
    WarmPool,
    CodeInterpreter,
}

/// The pod template a sandbox is materialized from.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodTemplate {
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_public_key: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

/// A sandbox object as stored by the orchestrator.
///
/// `ready` tracks the object's Ready condition: `None` before the condition
/// is first reported, then `Some(true)` / `Some(false)` as it transitions.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxObject {
    pub meta: ObjectMeta,
    pub template: PodTemplate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready: Option<bool>,
}

impl SandboxObject {
    pub fn is_ready(&self) -> bool {
        self.ready == Some(true)
    }

    pub fn is_warm(&self) -> bool {
        self.meta.label(models::LABEL_WARM).is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WarmPoolObject {
    pub meta: ObjectMeta,
    pub spec: WarmPoolSpec,
    #[serde(default)]
    pub status: WarmPoolStatus,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WarmPoolSpec {
    pub template: PodTemplate,
    pub desired_replicas: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WarmPoolStatus {
    pub ready_replicas: u32,
}

/// The slice of a pod the tunnel needs: where it runs and whether it does.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodObject {
    pub meta: ObjectMeta,
    pub phase: PodPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_ip: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum PodPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// An equality label selector.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selector(BTreeMap<String, String>);

impl Selector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn label(key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(key.into(), value.into());
        Self(labels)
    }

    pub fn and(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.0
            .iter()
            .all(|(k, v)| labels.get(k).map(String::as_str) == Some(v.as_str()))
    }
}

/// A change to a watched sandbox object.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Added(SandboxObject),
    Modified(SandboxObject),
    Deleted(SandboxObject),
}

impl WatchEvent {
    pub fn object(&self) -> &SandboxObject {
        match self {
            WatchEvent::Added(o) | WatchEvent::Modified(o) | WatchEvent::Deleted(o) => o,
        }
    }
}

/// An established watch: the synchronized initial snapshot, followed by
/// events delivered in arrival order.
pub struct Watch {
    pub snapshot: Vec<SandboxObject>,
    pub events: tokio::sync::mpsc::UnboundedReceiver<WatchEvent>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: &'static str,
        namespace: String,
        name: String,
    },
    #[error("{kind} {namespace}/{name} already exists")]
    AlreadyExists {
        kind: &'static str,
        namespace: String,
        name: String,
    },
    #[error("conflicting write to {kind} {namespace}/{name}: expected resource version {expected}, found {found}")]
    Conflict {
        kind: &'static str,
        namespace: String,
        name: String,
        expected: u64,
        found: u64,
    },
    #[error("token was rejected by the object store")]
    Unauthenticated,
    #[error("object store is unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl StoreError {
    pub fn not_found(kind: &'static str, namespace: &str, name: &str) -> Self {
        StoreError::NotFound {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// CRUD + watch over the orchestrator's objects.
///
/// Every call may block on network I/O and must honor cancellation of the
/// caller's task. Updates are guarded by the object's resource version and
/// fail with [`StoreError::Conflict`] when the stored version has moved.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    async fn create_sandbox(&self, sandbox: SandboxObject) -> Result<SandboxObject, StoreError>;

    async fn get_sandbox(&self, namespace: &str, name: &str) -> Result<SandboxObject, StoreError>;

    async fn update_sandbox(&self, sandbox: SandboxObject) -> Result<SandboxObject, StoreError>;

    /// Merge the given annotations into the object, in the manner of a JSON
    /// merge patch: no resource-version precondition, last writer wins.
    async fn patch_sandbox_annotations(
        &self,
        namespace: &str,
        name: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<(), StoreError>;

    async fn delete_sandbox(&self, namespace: &str, name: &str) -> Result<(), StoreError>;

    async fn list_sandboxes(
        &self,
        namespace: &str,
        selector: &Selector,
    ) -> Result<Vec<SandboxObject>, StoreError>;

    async fn watch_sandboxes(&self, namespace: &str) -> Result<Watch, StoreError>;

    async fn get_warm_pool(&self, namespace: &str, name: &str)
        -> Result<WarmPoolObject, StoreError>;

    async fn update_warm_pool_status(
        &self,
        namespace: &str,
        name: &str,
        status: WarmPoolStatus,
    ) -> Result<(), StoreError>;

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<PodObject, StoreError>;

    async fn list_pods(
        &self,
        namespace: &str,
        selector: &Selector,
    ) -> Result<Vec<PodObject>, StoreError>;
}

/// Builds per-principal store clients from bearer tokens, and exposes the
/// control plane's own system identity.
///
/// Token introspection is the store's concern: credentials are issued
/// elsewhere and arrive opaque. A client built from a user token acts with
/// that user's authority; the system client is reserved for background
/// reconciliation.
#[async_trait::async_trait]
pub trait ClientFactory: Send + Sync {
    /// Resolve the principal a bearer token authenticates as.
    async fn authenticate(&self, token: &str) -> Result<String, StoreError>;

    /// Build a store client acting with the token's authority.
    async fn client_for_token(&self, token: &str) -> Result<Arc<dyn ObjectStore>, StoreError>;

    /// The control plane's system identity client.
    fn system_client(&self) -> Arc<dyn ObjectStore>;

    /// The principal name of the system identity.
    fn system_principal(&self) -> &str;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_selector_matching() {
        let mut labels = BTreeMap::new();
        labels.insert("a".to_string(), "1".to_string());
        labels.insert("b".to_string(), "2".to_string());

        assert!(Selector::everything().matches(&labels));
        assert!(Selector::label("a", "1").matches(&labels));
        assert!(Selector::label("a", "1").and("b", "2").matches(&labels));
        assert!(!Selector::label("a", "2").matches(&labels));
        assert!(!Selector::label("c", "3").matches(&labels));
    }
}
