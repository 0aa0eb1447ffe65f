use std::collections::HashMap;
use std::sync::RwLock;

use models::{SessionRecord, SessionStatus};
use object_store::SandboxObject;

/// Parse a sandbox object into its SessionRecord projection.
///
/// Returns None when the object carries no usable session identity
/// (neither the session-id label nor a UID), in which case the caller
/// drops the event silently.
pub fn parse_record(object: &SandboxObject) -> Option<SessionRecord> {
    let session_id = match object.meta.label(models::LABEL_SESSION_ID) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ if !object.meta.uid.is_empty() => object.meta.uid.clone(),
        _ => return None,
    };

    let created_at = object
        .meta
        .annotation(crate::ANNOTATION_SESSION_CREATED)
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&chrono::Utc))
        .unwrap_or(object.meta.created_at);

    let ttl_secs = object
        .meta
        .annotation(models::ANNOTATION_TTL)
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(models::TTL_DEFAULT_SECS);

    let last_activity_at = object
        .meta
        .annotation(models::ANNOTATION_LAST_ACTIVITY)
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&chrono::Utc));

    let status = match object.ready {
        None => SessionStatus::Pending,
        Some(true) => SessionStatus::Running,
        Some(false) => SessionStatus::Paused,
    };

    let metadata = object
        .meta
        .annotations
        .iter()
        .filter(|(k, _)| {
            ![
                models::ANNOTATION_LAST_ACTIVITY,
                models::ANNOTATION_TTL,
                models::ANNOTATION_CREATOR,
                crate::ANNOTATION_SESSION_CREATED,
            ]
            .contains(&k.as_str())
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    Some(SessionRecord {
        session_id,
        object_name: object.meta.name.clone(),
        namespace: object.meta.namespace.clone(),
        status,
        created_at,
        expires_at: created_at + chrono::Duration::seconds(ttl_secs as i64),
        last_activity_at,
        creator_principal: object
            .meta
            .annotation(models::ANNOTATION_CREATOR)
            .unwrap_or_default()
            .to_string(),
        metadata,
    })
}

/// The process-local map of live sessions, fed by the object watch.
///
/// Reads mask expired entries so that a session disappears the moment its
/// TTL elapses, without waiting for the reaper and the watch to catch up.
/// Readers clone records out and never hold the lock across I/O.
#[derive(Default)]
pub struct SessionIndex {
    inner: RwLock<HashMap<String, SessionRecord>>,
}

impl SessionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, session_id: &str) -> Option<SessionRecord> {
        let inner = self.inner.read().unwrap();
        inner
            .get(session_id)
            .filter(|r| !r.is_expired(chrono::Utc::now()))
            .cloned()
    }

    pub fn list(&self) -> Vec<SessionRecord> {
        let now = chrono::Utc::now();
        let inner = self.inner.read().unwrap();
        let mut records: Vec<_> = inner
            .values()
            .filter(|r| !r.is_expired(now))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        records
    }

    pub fn set(&self, record: SessionRecord) {
        let mut inner = self.inner.write().unwrap();
        inner.insert(record.session_id.clone(), record);
    }

    pub fn delete(&self, session_id: &str) {
        let mut inner = self.inner.write().unwrap();
        inner.remove(session_id);
    }

    /// Stamp tunnel activity on the local record. The authoritative copy
    /// lives in the object annotation and is patched separately.
    pub fn touch_activity(&self, session_id: &str, at: chrono::DateTime<chrono::Utc>) {
        let mut inner = self.inner.write().unwrap();
        if let Some(record) = inner.get_mut(session_id) {
            record.last_activity_at = Some(at);
        }
    }

    /// Drop expired entries to release memory. Correctness does not depend
    /// on this: reads already mask expired records.
    pub fn clean_expired(&self) -> usize {
        let now = chrono::Utc::now();
        let mut inner = self.inner.write().unwrap();
        let before = inner.len();
        inner.retain(|_, r| !r.is_expired(now));
        before - inner.len()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use object_store::{ObjectMeta, PodTemplate};
    use std::collections::BTreeMap;

    fn object(name: &str, session_label: Option<&str>, uid: &str) -> SandboxObject {
        let mut labels = BTreeMap::new();
        if let Some(id) = session_label {
            labels.insert(models::LABEL_SESSION_ID.to_string(), id.to_string());
        }
        SandboxObject {
            meta: ObjectMeta {
                name: name.to_string(),
                namespace: "default".to_string(),
                uid: uid.to_string(),
                labels,
                created_at: chrono::Utc::now(),
                ..Default::default()
            },
            template: PodTemplate::default(),
            ready: Some(true),
        }
    }

    #[test]
    fn test_parse_prefers_label_over_uid() {
        let record = parse_record(&object("sb", Some("sess-1"), "uid-1")).unwrap();
        assert_eq!(record.session_id, "sess-1");

        let record = parse_record(&object("sb", None, "uid-1")).unwrap();
        assert_eq!(record.session_id, "uid-1");

        assert!(parse_record(&object("sb", None, "")).is_none());
    }

    #[test]
    fn test_parse_ttl_and_expiry() {
        let mut obj = object("sb", Some("sess-1"), "uid-1");
        obj.meta
            .annotations
            .insert(models::ANNOTATION_TTL.to_string(), "120".to_string());
        let record = parse_record(&obj).unwrap();
        assert_eq!(
            record.expires_at - record.created_at,
            chrono::Duration::seconds(120)
        );

        // Absent or unparsable ttl falls back to the default.
        obj.meta.annotations.remove(models::ANNOTATION_TTL);
        let record = parse_record(&obj).unwrap();
        assert_eq!(
            record.expires_at - record.created_at,
            chrono::Duration::seconds(models::TTL_DEFAULT_SECS as i64)
        );
    }

    #[test]
    fn test_get_masks_expired() {
        let index = SessionIndex::new();
        let mut obj = object("sb", Some("sess-1"), "uid-1");
        obj.meta
            .annotations
            .insert(models::ANNOTATION_TTL.to_string(), "60".to_string());
        let mut record = parse_record(&obj).unwrap();
        record.created_at = chrono::Utc::now() - chrono::Duration::seconds(3600);
        record.expires_at = record.created_at + chrono::Duration::seconds(60);
        index.set(record);

        assert!(index.get("sess-1").is_none());
        assert!(index.list().is_empty());
        assert_eq!(index.len(), 1);
        assert_eq!(index.clean_expired(), 1);
        assert_eq!(index.len(), 0);
    }

    #[test]
    fn test_user_metadata_passes_through() {
        let mut obj = object("sb", Some("sess-1"), "uid-1");
        obj.meta
            .annotations
            .insert(models::ANNOTATION_TTL.to_string(), "600".to_string());
        obj.meta
            .annotations
            .insert("team".to_string(), "ml".to_string());
        let record = parse_record(&obj).unwrap();
        assert_eq!(record.metadata.get("team").map(String::as_str), Some("ml"));
        assert!(!record.metadata.contains_key(models::ANNOTATION_TTL));
    }
}
