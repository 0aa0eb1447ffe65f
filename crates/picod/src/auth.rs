//! Request authentication for the agent.
//!
//! The agent boots unsealed, holding only the bootstrap public key. The
//! first successful `/init` promotes the token's embedded session key and
//! seals the process: from then on every call must be signed by the
//! session key, and no transition out of the sealed state exists. The
//! session key is persisted so restarts re-enter the sealed state from
//! disk.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::Context;
use base64::Engine;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};

/// Claims carried by agent tokens.
///
/// `exp` and `iat` are required; `nbf` is honored when present. Exactly
/// one of the purpose claims accompanies them: `session_public_key` on
/// init tokens, `canonical_request_sha256` on data calls with a body.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct Claims {
    pub exp: u64,
    pub iat: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canonical_request_sha256: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("request is not authorized: {0}")]
    Unauthorized(String),
    #[error("server is already initialized")]
    AlreadyInitialized,
    #[error("server is not initialized")]
    NotInitialized,
}

/// Clock skew tolerance for exp/iat/nbf, one minute either way.
const LEEWAY_SECS: u64 = 60;

struct AuthState {
    bootstrap: DecodingKey,
    session: Option<DecodingKey>,
    initialized: bool,
}

pub struct AuthManager {
    state: RwLock<AuthState>,
    key_file: PathBuf,
}

impl AuthManager {
    /// Load the bootstrap public key from PEM bytes. If the key file from
    /// an earlier init survives on disk, the agent re-enters the sealed
    /// state immediately.
    pub fn new(bootstrap_pem: &[u8], key_file: PathBuf) -> anyhow::Result<Self> {
        if bootstrap_pem.is_empty() {
            anyhow::bail!("bootstrap public key is empty");
        }
        let bootstrap = DecodingKey::from_rsa_pem(bootstrap_pem)
            .context("parsing bootstrap public key PEM")?;

        let (session, initialized) = if key_file.exists() {
            let pem = std::fs::read(&key_file)
                .with_context(|| format!("reading persisted session key {key_file:?}"))?;
            let session = DecodingKey::from_rsa_pem(&pem)
                .context("parsing persisted session key PEM")?;
            tracing::info!(?key_file, "sealed from persisted session key");
            (Some(session), true)
        } else {
            (None, false)
        };

        Ok(Self {
            state: RwLock::new(AuthState {
                bootstrap,
                session,
                initialized,
            }),
            key_file,
        })
    }

    pub fn initialized(&self) -> bool {
        self.state.read().unwrap().initialized
    }

    /// Authorize `/init`: verify the bootstrap-signed token, promote the
    /// embedded session key, and seal. Errors never poison the sealed
    /// state; the transition happens exactly once.
    pub fn authorize_init(&self, token: &str) -> Result<(), AuthError> {
        {
            let state = self.state.read().unwrap();
            if state.initialized {
                return Err(AuthError::AlreadyInitialized);
            }
        }

        let claims = {
            let state = self.state.read().unwrap();
            decode_claims(token, &state.bootstrap)?
        };

        let encoded = claims
            .session_public_key
            .as_deref()
            .ok_or_else(|| AuthError::Unauthorized("missing session_public_key claim".into()))?;
        let pem = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|_| AuthError::Unauthorized("session_public_key is not valid base64".into()))?;
        let session = DecodingKey::from_rsa_pem(&pem)
            .map_err(|err| AuthError::Unauthorized(format!("invalid session public key: {err}")))?;

        let mut state = self.state.write().unwrap();
        // A racing init may have sealed while we verified.
        if state.initialized {
            return Err(AuthError::AlreadyInitialized);
        }
        persist_key_file(&self.key_file, &pem).map_err(|err| {
            AuthError::Unauthorized(format!("failed to persist session key: {err:#}"))
        })?;
        state.session = Some(session);
        state.initialized = true;
        tracing::info!(key_file = ?self.key_file, "agent sealed to session key");
        Ok(())
    }

    /// Authorize a data call: the process must be sealed and the token
    /// signed by the session key. When the token carries a binding claim
    /// it must match `canonical`; when `require_binding` is set (a
    /// non-multipart body is present) the claim is mandatory.
    pub fn authorize_call(
        &self,
        token: &str,
        canonical: &str,
        require_binding: bool,
    ) -> Result<(), AuthError> {
        let session = {
            let state = self.state.read().unwrap();
            if !state.initialized {
                return Err(AuthError::NotInitialized);
            }
            state.session.clone().expect("sealed state has a session key")
        };

        let claims = decode_claims(token, &session)?;

        match claims.canonical_request_sha256.as_deref() {
            Some(bound) if bound == canonical => Ok(()),
            Some(_) => Err(AuthError::Unauthorized(
                "canonical request hash mismatch".into(),
            )),
            None if require_binding => Err(AuthError::Unauthorized(
                "missing canonical_request_sha256 claim".into(),
            )),
            None => Ok(()),
        }
    }
}

fn decode_claims(token: &str, key: &DecodingKey) -> Result<Claims, AuthError> {
    let mut validation = Validation::new(Algorithm::PS256);
    validation.algorithms = vec![
        Algorithm::PS256,
        Algorithm::PS384,
        Algorithm::PS512,
        Algorithm::RS256,
        Algorithm::RS384,
        Algorithm::RS512,
    ];
    validation.leeway = LEEWAY_SECS;
    validation.set_required_spec_claims(&["exp"]);

    let data = jsonwebtoken::decode::<Claims>(token, key, &validation).map_err(|err| {
        use jsonwebtoken::errors::ErrorKind;
        let reason = match err.kind() {
            ErrorKind::ExpiredSignature => "token is expired".to_string(),
            ErrorKind::InvalidSignature => "token signature is invalid".to_string(),
            ErrorKind::ImmatureSignature => "token is not yet valid".to_string(),
            _ => format!("token is malformed: {err}"),
        };
        AuthError::Unauthorized(reason)
    })?;

    // `iat` presence is enforced by deserialization; `nbf` is validated
    // here because jsonwebtoken would otherwise require it on every token.
    if let Some(nbf) = data.claims.nbf {
        let now = jsonwebtoken::get_current_timestamp();
        if nbf > now + LEEWAY_SECS {
            return Err(AuthError::Unauthorized("token is not yet valid".into()));
        }
    }

    Ok(data.claims)
}

/// Write the session key PEM read-only, and mark it immutable where the
/// OS supports it. The on-disk file is what makes `Sealed` survive
/// restarts.
fn persist_key_file(path: &Path, pem: &[u8]) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::write(path, pem).with_context(|| format!("writing session key {path:?}"))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o400))
        .with_context(|| format!("setting permissions of {path:?}"))?;

    // Best-effort immutability; unsupported filesystems simply decline.
    match std::process::Command::new("chattr").arg("+i").arg(path).output() {
        Ok(output) if output.status.success() => (),
        Ok(output) => tracing::debug!(
            status = ?output.status,
            "filesystem did not accept the immutable flag"
        ),
        Err(err) => tracing::debug!(%err, "chattr is unavailable"),
    }
    Ok(())
}
