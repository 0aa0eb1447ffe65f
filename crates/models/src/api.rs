use std::collections::BTreeMap;

use crate::SessionRecord;

/// Body of `POST /v1/sandboxes`.
#[derive(Debug, Clone, Default, serde::Deserialize, serde::Serialize, validator::Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateSandboxRequest {
    /// Requested session TTL in seconds. Bounds-checked by the handler
    /// so that the error can carry the INVALID_TTL code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(min = 1, max = 512))]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_public_key: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

/// Query parameters of `GET /v1/sandboxes`.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

pub const LIST_LIMIT_DEFAULT: usize = 50;
pub const LIST_LIMIT_MAX: usize = 100;

impl ListQuery {
    /// Resolve (limit, offset), clamping limit into [1, 100].
    pub fn resolve(&self) -> Result<(usize, usize), String> {
        let limit = self.limit.unwrap_or(LIST_LIMIT_DEFAULT);
        if limit < 1 || limit > LIST_LIMIT_MAX {
            return Err(format!("limit must be within [1, {LIST_LIMIT_MAX}]"));
        }
        Ok((limit, self.offset.unwrap_or(0)))
    }
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxListResponse {
    pub sandboxes: Vec<SessionRecord>,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

/// Error envelope returned by every control-plane endpoint.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

pub mod error_codes {
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
    pub const INVALID_TTL: &str = "INVALID_TTL";
    pub const UNAUTHORIZED: &str = "UNAUTHORIZED";
    pub const FORBIDDEN: &str = "FORBIDDEN";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const SANDBOX_CREATE_FAILED: &str = "SANDBOX_CREATE_FAILED";
    pub const SANDBOX_TIMEOUT: &str = "SANDBOX_TIMEOUT";
    pub const CLIENT_CREATION_FAILED: &str = "CLIENT_CREATION_FAILED";
    pub const BAD_GATEWAY: &str = "BAD_GATEWAY";
    pub const INTERNAL: &str = "INTERNAL";
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_list_query_bounds() {
        let q = ListQuery {
            limit: None,
            offset: None,
        };
        assert_eq!(q.resolve().unwrap(), (50, 0));

        let q = ListQuery {
            limit: Some(100),
            offset: Some(10),
        };
        assert_eq!(q.resolve().unwrap(), (100, 10));

        for bad in [0, 101] {
            let q = ListQuery {
                limit: Some(bad),
                offset: None,
            };
            assert!(q.resolve().is_err());
        }
    }

    #[test]
    fn test_create_request_accepts_camel_case() {
        let req: CreateSandboxRequest = serde_json::from_str(
            r#"{"ttl": 600, "image": "agentcube/base:latest", "sshPublicKey": "ssh-rsa AAAA", "metadata": {"team": "ml"}}"#,
        )
        .unwrap();
        assert_eq!(req.ttl, Some(600));
        assert_eq!(req.ssh_public_key.as_deref(), Some("ssh-rsa AAAA"));
        assert_eq!(req.metadata.get("team").map(String::as_str), Some("ml"));
    }
}
