use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use object_store::{
    ObjectMeta, ObjectStore, OwnerKind, OwnerReference, SandboxObject, Selector, WarmPoolStatus,
};
use tokio_util::sync::CancellationToken;

/// How often the pool re-examines its members absent any claim activity.
const RESYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Maintains a warm-pool object's desired replica count by creating and
/// deleting pre-provisioned sandboxes owned by the pool. Claims are served
/// by [`claim_warm`]; the controller only ever converges afterwards, so a
/// donated sandbox is backfilled eventually rather than synchronously.
pub struct WarmPoolController {
    store: Arc<dyn ObjectStore>,
    namespace: String,
    pool_name: String,
}

impl WarmPoolController {
    pub fn new(store: Arc<dyn ObjectStore>, namespace: String, pool_name: String) -> Self {
        Self {
            store,
            namespace,
            pool_name,
        }
    }

    #[tracing::instrument(skip(self), fields(namespace = %self.namespace, pool = %self.pool_name))]
    pub async fn reconcile(&self) -> anyhow::Result<()> {
        let pool = match self.store.get_warm_pool(&self.namespace, &self.pool_name).await {
            Ok(pool) => pool,
            Err(err) if err.is_not_found() => {
                tracing::debug!("warm pool not installed");
                return Ok(());
            }
            Err(err) => return Err(err).context("fetching warm pool"),
        };

        let mut members: Vec<SandboxObject> = self
            .store
            .list_sandboxes(&self.namespace, &Selector::label(models::LABEL_WARM, "true"))
            .await
            .context("listing warm sandboxes")?
            .into_iter()
            .filter(|s| s.meta.owned_by(&pool.meta.uid))
            .collect();

        let desired = pool.spec.desired_replicas as usize;

        if members.len() < desired {
            for _ in members.len()..desired {
                let name = warm_member_name(&self.pool_name);
                let mut labels = BTreeMap::new();
                labels.insert(models::LABEL_WARM.to_string(), "true".to_string());
                labels.insert(models::LABEL_MANAGED_BY.to_string(), models::MANAGED_BY.to_string());

                let member = SandboxObject {
                    meta: ObjectMeta {
                        name: name.clone(),
                        namespace: self.namespace.clone(),
                        labels,
                        owner_references: vec![OwnerReference {
                            kind: OwnerKind::WarmPool,
                            name: pool.meta.name.clone(),
                            uid: pool.meta.uid.clone(),
                        }],
                        ..Default::default()
                    },
                    template: pool.spec.template.clone(),
                    ready: None,
                };
                self.store
                    .create_sandbox(member)
                    .await
                    .with_context(|| format!("creating warm sandbox {name}"))?;
                tracing::info!(%name, "created warm sandbox");
            }
        } else if members.len() > desired {
            // Delete surplus oldest-first.
            members.sort_by(|a, b| a.meta.created_at.cmp(&b.meta.created_at));
            for surplus in &members[..members.len() - desired] {
                match self
                    .store
                    .delete_sandbox(&self.namespace, &surplus.meta.name)
                    .await
                {
                    Ok(()) => tracing::info!(name = %surplus.meta.name, "deleted surplus warm sandbox"),
                    Err(err) if err.is_not_found() => (),
                    Err(err) => {
                        return Err(err).with_context(|| {
                            format!("deleting surplus warm sandbox {}", surplus.meta.name)
                        })
                    }
                }
            }
        }

        let ready_replicas = members.iter().filter(|s| s.is_ready()).count() as u32;
        self.store
            .update_warm_pool_status(
                &self.namespace,
                &self.pool_name,
                WarmPoolStatus { ready_replicas },
            )
            .await
            .context("updating warm pool status")?;

        Ok(())
    }

    /// Reconcile on a timer and whenever poked (a claim just consumed a
    /// member, or a watch event touched the pool's children).
    pub async fn run(
        self,
        mut poke: tokio::sync::mpsc::Receiver<()>,
        shutdown: CancellationToken,
    ) {
        loop {
            if let Err(err) = self.reconcile().await {
                tracing::warn!(error = format!("{err:#}"), "warm pool reconcile failed");
            }
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(RESYNC_INTERVAL) => (),
                _ = poke.recv() => (),
            }
        }
    }
}

fn warm_member_name(pool_name: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{pool_name}-warm-{}", &suffix[..8])
}

/// Donate a Ready warm sandbox to a session claim.
///
/// The ownership hand-off is the single linearization point: the member's
/// owner reference and labels are rewritten in one resource-version-guarded
/// update, so a warm sandbox is bound at most once. Contended candidates
/// are skipped on conflict; `Ok(None)` means the caller should create a
/// sandbox from scratch.
pub async fn claim_warm(
    store: &dyn ObjectStore,
    namespace: &str,
    pool_name: &str,
    session_id: &str,
    creator_principal: &str,
    ttl_secs: u64,
    metadata: &BTreeMap<String, String>,
) -> anyhow::Result<Option<SandboxObject>> {
    let pool = match store.get_warm_pool(namespace, pool_name).await {
        Ok(pool) => pool,
        Err(err) if err.is_not_found() => return Ok(None),
        Err(err) => return Err(err).context("fetching warm pool"),
    };

    let candidates = store
        .list_sandboxes(namespace, &Selector::label(models::LABEL_WARM, "true"))
        .await
        .context("listing warm sandboxes")?;

    let now = chrono::Utc::now().to_rfc3339();
    for candidate in candidates {
        if !candidate.is_ready() || !candidate.meta.owned_by(&pool.meta.uid) {
            continue;
        }

        let mut claimed = candidate;
        claimed.meta.labels.remove(models::LABEL_WARM);
        claimed
            .meta
            .labels
            .insert(models::LABEL_SESSION_ID.to_string(), session_id.to_string());
        claimed
            .meta
            .labels
            .insert(models::LABEL_MANAGED_BY.to_string(), models::MANAGED_BY.to_string());
        claimed
            .meta
            .owner_references
            .retain(|r| r.uid != pool.meta.uid);
        claimed.meta.annotations.extend(metadata.clone());
        claimed.meta.annotations.insert(
            models::ANNOTATION_CREATOR.to_string(),
            creator_principal.to_string(),
        );
        claimed
            .meta
            .annotations
            .insert(models::ANNOTATION_TTL.to_string(), ttl_secs.to_string());
        claimed
            .meta
            .annotations
            .insert(models::ANNOTATION_LAST_ACTIVITY.to_string(), now.clone());
        claimed.meta.annotations.insert(
            crate::ANNOTATION_SESSION_CREATED.to_string(),
            now.clone(),
        );

        match store.update_sandbox(claimed).await {
            Ok(bound) => {
                tracing::info!(
                    name = %bound.meta.name,
                    session_id,
                    "claimed warm sandbox",
                );
                return Ok(Some(bound));
            }
            // Another claim won this member; try the next.
            Err(err) if err.is_conflict() => continue,
            Err(err) => return Err(err).context("binding warm sandbox"),
        }
    }

    Ok(None)
}
