use std::collections::BTreeMap;

/// Lifecycle status of a session, derived from the backing sandbox
/// object's Ready condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SessionStatus {
    /// The sandbox object exists but has never reported Ready.
    Pending,
    /// The sandbox is Ready and can serve tunneled traffic.
    Running,
    /// The sandbox was Ready once but currently is not.
    Paused,
}

/// SessionRecord is the process-local projection of a sandbox object,
/// used to answer API queries. The watch loop is the only writer of its
/// derived fields; see the control-plane crate.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: String,
    pub object_name: String,
    pub namespace: String,
    pub status: SessionStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub expires_at: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity_at: Option<chrono::DateTime<chrono::Utc>>,
    pub creator_principal: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl SessionRecord {
    /// An expired record is masked from all reads, even before the watch
    /// observes its deletion.
    pub fn is_expired(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        now > self.expires_at
    }
}
