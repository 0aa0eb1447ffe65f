mod api;
mod session;

pub use api::{
    error_codes, CreateSandboxRequest, ErrorBody, ListQuery, MessageResponse,
    SandboxListResponse,
};
pub use session::{SessionRecord, SessionStatus};

/// Label holding the session ID of a bound sandbox object.
pub const LABEL_SESSION_ID: &str = "agentcube.io/session-id";
/// Label marking objects managed by this control plane.
pub const LABEL_MANAGED_BY: &str = "agentcube.io/managed-by";
/// Label carried by pre-provisioned sandboxes that are not yet bound to a user.
pub const LABEL_WARM: &str = "agentcube.io/warm";
/// Label by which a sandbox's backing pod advertises its sandbox name.
pub const LABEL_SANDBOX_NAME: &str = "sandbox-name";
/// The orchestrator's native sandbox label, stamped on pods it materializes.
pub const LABEL_NATIVE_SANDBOX: &str = "sandbox.agentcube.io/name";

pub const ANNOTATION_LAST_ACTIVITY: &str = "last-activity-time";
pub const ANNOTATION_TTL: &str = "ttl";
pub const ANNOTATION_CREATOR: &str = "creator-service-account";

pub const MANAGED_BY: &str = "agentcube";

pub const TTL_DEFAULT_SECS: u64 = 3600;
pub const TTL_MIN_SECS: u64 = 60;
pub const TTL_MAX_SECS: u64 = 28800;

/// Validate a requested session TTL, in seconds, against the allowed bounds.
pub fn validate_ttl(ttl: u64) -> Result<u64, InvalidTtl> {
    if !(TTL_MIN_SECS..=TTL_MAX_SECS).contains(&ttl) {
        return Err(InvalidTtl(ttl));
    }
    Ok(ttl)
}

#[derive(Debug, thiserror::Error)]
#[error("ttl {0} is outside the allowed range [{TTL_MIN_SECS}, {TTL_MAX_SECS}] seconds")]
pub struct InvalidTtl(pub u64);

/// Derive the object name for a freshly created session.
pub fn object_name_for_session(session_id: &str) -> String {
    format!("sandbox-{}", &session_id[..8.min(session_id.len())])
}
