//! An in-memory ObjectStore used by tests and local development. It keeps
//! the semantics the control plane relies on: optimistic concurrency on
//! updates, watch fan-out in arrival order, owner-reference garbage
//! collection, and a backing pod materialized per sandbox.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::{
    ClientFactory, ObjectMeta, ObjectStore, OwnerKind, OwnerReference, PodObject, PodPhase,
    SandboxObject, Selector, StoreError, Watch, WatchEvent, WarmPoolObject, WarmPoolSpec,
    WarmPoolStatus,
};

#[derive(Default)]
struct Inner {
    sandboxes: BTreeMap<(String, String), SandboxObject>,
    pools: BTreeMap<(String, String), WarmPoolObject>,
    pods: BTreeMap<(String, String), PodObject>,
    watchers: Vec<(String, tokio::sync::mpsc::UnboundedSender<WatchEvent>)>,
    next_uid: u64,
    next_resource_version: u64,
}

impl Inner {
    fn next_uid(&mut self) -> String {
        self.next_uid += 1;
        format!("uid-{:08}", self.next_uid)
    }

    fn next_rv(&mut self) -> u64 {
        self.next_resource_version += 1;
        self.next_resource_version
    }

    fn notify(&mut self, event: WatchEvent) {
        let namespace = event.object().meta.namespace.clone();
        self.watchers
            .retain(|(ns, tx)| *ns != namespace || tx.send(event.clone()).is_ok());
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Seed a warm pool object. Pools are installed by operations tooling,
    /// not through the session API, so this lives outside the trait.
    pub fn put_warm_pool(&self, namespace: &str, name: &str, spec: WarmPoolSpec) -> WarmPoolObject {
        let mut inner = self.inner.lock().unwrap();
        let uid = inner.next_uid();
        let resource_version = inner.next_rv();
        let pool = WarmPoolObject {
            meta: ObjectMeta {
                name: name.to_string(),
                namespace: namespace.to_string(),
                uid,
                resource_version,
                created_at: chrono::Utc::now(),
                ..Default::default()
            },
            spec,
            status: WarmPoolStatus::default(),
        };
        inner
            .pools
            .insert((namespace.to_string(), name.to_string()), pool.clone());
        pool
    }

    /// Adjust a seeded pool's replica target in place.
    pub fn set_warm_pool_replicas(
        &self,
        namespace: &str,
        name: &str,
        desired_replicas: u32,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let pool = inner
            .pools
            .get_mut(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| StoreError::not_found("warmpool", namespace, name))?;
        pool.spec.desired_replicas = desired_replicas;
        Ok(())
    }

    /// Delete a warm pool, cascading to every object that references it as
    /// an owner, the way orchestrator garbage collection would.
    pub fn delete_warm_pool(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let pool = inner
            .pools
            .remove(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| StoreError::not_found("warmpool", namespace, name))?;
        collect_owned(&mut inner, &pool.meta.uid);
        Ok(())
    }

    /// Flip a sandbox's Ready condition and, when an address is given, mark
    /// its backing pod Running at that address. Emits a Modified event.
    pub fn set_sandbox_ready(
        &self,
        namespace: &str,
        name: &str,
        ready: bool,
        pod_ip: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let key = (namespace.to_string(), name.to_string());
        let rv = inner.next_rv();
        let sandbox = inner
            .sandboxes
            .get_mut(&key)
            .ok_or_else(|| StoreError::not_found("sandbox", namespace, name))?;
        sandbox.ready = Some(ready);
        sandbox.meta.resource_version = rv;
        let updated = sandbox.clone();

        if let Some(pod) = inner.pods.get_mut(&key) {
            if ready {
                pod.phase = PodPhase::Running;
                pod.pod_ip = pod_ip.map(str::to_string).or_else(|| pod.pod_ip.clone());
            }
        }
        inner.notify(WatchEvent::Modified(updated));
        Ok(())
    }

    /// Install a pod directly, for tests exercising pod resolution paths.
    pub fn put_pod(&self, pod: PodObject) {
        let mut inner = self.inner.lock().unwrap();
        inner.pods.insert(
            (pod.meta.namespace.clone(), pod.meta.name.clone()),
            pod,
        );
    }

    pub fn remove_pod(&self, namespace: &str, name: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.pods.remove(&(namespace.to_string(), name.to_string()));
    }
}

/// Remove every object transitively owned by `uid`, emitting Deleted events.
fn collect_owned(inner: &mut Inner, uid: &str) {
    let owned: Vec<(String, String)> = inner
        .sandboxes
        .iter()
        .filter(|(_, s)| s.meta.owned_by(uid))
        .map(|(k, _)| k.clone())
        .collect();

    for key in owned {
        if let Some(removed) = inner.sandboxes.remove(&key) {
            inner.pods.remove(&key);
            let child_uid = removed.meta.uid.clone();
            inner.notify(WatchEvent::Deleted(removed));
            collect_owned(inner, &child_uid);
        }
    }
    inner.pods.retain(|_, p| !p.meta.owned_by(uid));
}

#[async_trait::async_trait]
impl ObjectStore for MemoryStore {
    async fn create_sandbox(&self, mut sandbox: SandboxObject) -> Result<SandboxObject, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let key = (sandbox.meta.namespace.clone(), sandbox.meta.name.clone());
        if inner.sandboxes.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                kind: "sandbox",
                namespace: key.0,
                name: key.1,
            });
        }
        sandbox.meta.uid = inner.next_uid();
        sandbox.meta.resource_version = inner.next_rv();
        sandbox.meta.created_at = chrono::Utc::now();
        sandbox.ready = None;

        // Materialize the backing pod the way the orchestrator would:
        // same name, labeled with the sandbox's, owned by it.
        let pod_uid = inner.next_uid();
        let mut pod_labels = BTreeMap::new();
        pod_labels.insert(
            models::LABEL_SANDBOX_NAME.to_string(),
            sandbox.meta.name.clone(),
        );
        pod_labels.insert(
            models::LABEL_NATIVE_SANDBOX.to_string(),
            sandbox.meta.name.clone(),
        );
        let pod = PodObject {
            meta: ObjectMeta {
                name: sandbox.meta.name.clone(),
                namespace: sandbox.meta.namespace.clone(),
                uid: pod_uid,
                resource_version: 0,
                labels: pod_labels,
                annotations: BTreeMap::new(),
                owner_references: vec![OwnerReference {
                    kind: OwnerKind::Sandbox,
                    name: sandbox.meta.name.clone(),
                    uid: sandbox.meta.uid.clone(),
                }],
                created_at: sandbox.meta.created_at,
            },
            phase: PodPhase::Pending,
            pod_ip: None,
        };

        inner.sandboxes.insert(key.clone(), sandbox.clone());
        inner.pods.insert(key, pod);
        inner.notify(WatchEvent::Added(sandbox.clone()));
        Ok(sandbox)
    }

    async fn get_sandbox(&self, namespace: &str, name: &str) -> Result<SandboxObject, StoreError> {
        let inner = self.inner.lock().unwrap();
        inner
            .sandboxes
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::not_found("sandbox", namespace, name))
    }

    async fn update_sandbox(&self, mut sandbox: SandboxObject) -> Result<SandboxObject, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let key = (sandbox.meta.namespace.clone(), sandbox.meta.name.clone());
        let rv = inner.next_rv();
        let stored = inner.sandboxes.get_mut(&key).ok_or_else(|| {
            StoreError::not_found("sandbox", &sandbox.meta.namespace, &sandbox.meta.name)
        })?;
        if stored.meta.resource_version != sandbox.meta.resource_version {
            return Err(StoreError::Conflict {
                kind: "sandbox",
                namespace: key.0,
                name: key.1,
                expected: sandbox.meta.resource_version,
                found: stored.meta.resource_version,
            });
        }
        sandbox.meta.uid = stored.meta.uid.clone();
        sandbox.meta.created_at = stored.meta.created_at;
        sandbox.meta.resource_version = rv;
        *stored = sandbox.clone();
        inner.notify(WatchEvent::Modified(sandbox.clone()));
        Ok(sandbox)
    }

    async fn patch_sandbox_annotations(
        &self,
        namespace: &str,
        name: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let rv = inner.next_rv();
        let stored = inner
            .sandboxes
            .get_mut(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| StoreError::not_found("sandbox", namespace, name))?;
        stored.meta.annotations.extend(annotations);
        stored.meta.resource_version = rv;
        let updated = stored.clone();
        inner.notify(WatchEvent::Modified(updated));
        Ok(())
    }

    async fn delete_sandbox(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let key = (namespace.to_string(), name.to_string());
        let removed = inner
            .sandboxes
            .remove(&key)
            .ok_or_else(|| StoreError::not_found("sandbox", namespace, name))?;
        inner.pods.remove(&key);
        let uid = removed.meta.uid.clone();
        inner.notify(WatchEvent::Deleted(removed));
        collect_owned(&mut inner, &uid);
        Ok(())
    }

    async fn list_sandboxes(
        &self,
        namespace: &str,
        selector: &Selector,
    ) -> Result<Vec<SandboxObject>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .sandboxes
            .values()
            .filter(|s| s.meta.namespace == namespace && selector.matches(&s.meta.labels))
            .cloned()
            .collect())
    }

    async fn watch_sandboxes(&self, namespace: &str) -> Result<Watch, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let snapshot = inner
            .sandboxes
            .values()
            .filter(|s| s.meta.namespace == namespace)
            .cloned()
            .collect();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        inner.watchers.push((namespace.to_string(), tx));
        Ok(Watch {
            snapshot,
            events: rx,
        })
    }

    async fn get_warm_pool(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<WarmPoolObject, StoreError> {
        let inner = self.inner.lock().unwrap();
        inner
            .pools
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::not_found("warmpool", namespace, name))
    }

    async fn update_warm_pool_status(
        &self,
        namespace: &str,
        name: &str,
        status: WarmPoolStatus,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let pool = inner
            .pools
            .get_mut(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| StoreError::not_found("warmpool", namespace, name))?;
        pool.status = status;
        Ok(())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<PodObject, StoreError> {
        let inner = self.inner.lock().unwrap();
        inner
            .pods
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::not_found("pod", namespace, name))
    }

    async fn list_pods(
        &self,
        namespace: &str,
        selector: &Selector,
    ) -> Result<Vec<PodObject>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .pods
            .values()
            .filter(|p| p.meta.namespace == namespace && selector.matches(&p.meta.labels))
            .cloned()
            .collect())
    }
}

/// Token resolution for the in-memory store. Tokens are registered by
/// tests or the local binary; each maps to a principal, and every client
/// shares the single store.
pub struct MemoryClientFactory {
    store: Arc<MemoryStore>,
    tokens: Mutex<BTreeMap<String, String>>,
    system_principal: String,
}

impl MemoryClientFactory {
    pub fn new(store: Arc<MemoryStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            tokens: Mutex::new(BTreeMap::new()),
            system_principal: "system:agentcube-controller".to_string(),
        })
    }

    pub fn register_token(&self, token: &str, principal: &str) {
        self.tokens
            .lock()
            .unwrap()
            .insert(token.to_string(), principal.to_string());
    }

    pub fn revoke_token(&self, token: &str) {
        self.tokens.lock().unwrap().remove(token);
    }
}

#[async_trait::async_trait]
impl ClientFactory for MemoryClientFactory {
    async fn authenticate(&self, token: &str) -> Result<String, StoreError> {
        self.tokens
            .lock()
            .unwrap()
            .get(token)
            .cloned()
            .ok_or(StoreError::Unauthenticated)
    }

    async fn client_for_token(&self, token: &str) -> Result<Arc<dyn ObjectStore>, StoreError> {
        let _principal = self.authenticate(token).await?;
        Ok(self.store.clone() as Arc<dyn ObjectStore>)
    }

    fn system_client(&self) -> Arc<dyn ObjectStore> {
        self.store.clone() as Arc<dyn ObjectStore>
    }

    fn system_principal(&self) -> &str {
        &self.system_principal
    }
}
