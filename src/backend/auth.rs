//! Password login against the `users` collection, with the session kept
//! in `session.json` between runs.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::client::PocketBase;
use crate::error::BackendError;

const AUTH_COLLECTION: &str = "users";

/// Token plus the authenticated user record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthSession {
    pub token: String,
    #[serde(default)]
    pub record: serde_json::Value,
}

#[derive(Serialize)]
struct PasswordLogin<'a> {
    identity: &'a str,
    password: &'a str,
}

/// Seconds since the epoch at which `token` expires, read from its JWT
/// payload without verifying the signature.
pub fn token_expiry(token: &str) -> Option<i64> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    claims.get("exp")?.as_i64()
}

/// Whether `token` is a JWT whose `exp` lies in the future.
pub fn token_is_valid(token: &str) -> bool {
    token_expiry(token)
        .map(|exp| exp > chrono::Utc::now().timestamp())
        .unwrap_or(false)
}

pub struct AuthStore {
    client: PocketBase,
    session_path: PathBuf,
    session: Mutex<Option<AuthSession>>,
}

impl AuthStore {
    pub fn new(client: PocketBase, session_path: PathBuf) -> Self {
        Self {
            client,
            session_path,
            session: Mutex::new(None),
        }
    }

    pub fn session_path(&self) -> &Path {
        &self.session_path
    }

    fn set_session(&self, session: Option<AuthSession>) {
        self.client.set_token(session.as_ref().map(|s| s.token.clone()));
        *self.session.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = session;
    }

    pub fn current(&self) -> Option<AuthSession> {
        self.session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Load a previously saved session. Expired or unreadable sessions are
    /// ignored.
    pub fn restore(&self) -> Option<AuthSession> {
        let contents = match std::fs::read_to_string(&self.session_path) {
            Ok(c) => c,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to read {}: {}", self.session_path.display(), e);
                }
                return None;
            }
        };
        let session: AuthSession = match serde_json::from_str(&contents) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to parse {}: {}", self.session_path.display(), e);
                return None;
            }
        };
        if !token_is_valid(&session.token) {
            info!("Stored session has expired");
            return None;
        }
        self.set_session(Some(session.clone()));
        info!("Session restored");
        Some(session)
    }

    fn persist(&self, session: &AuthSession) -> Result<(), BackendError> {
        if let Some(parent) = self.session_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| BackendError::Session(format!("{}: {}", parent.display(), e)))?;
        }
        let json = serde_json::to_string_pretty(session)
            .map_err(|e| BackendError::Session(e.to_string()))?;
        std::fs::write(&self.session_path, json)
            .map_err(|e| BackendError::Session(format!("{}: {}", self.session_path.display(), e)))
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<AuthSession, BackendError> {
        let body = PasswordLogin {
            identity: email,
            password,
        };
        let session: AuthSession = self
            .client
            .post_json(&["collections", AUTH_COLLECTION, "auth-with-password"], &body)
            .await?;
        self.set_session(Some(session.clone()));
        if let Err(e) = self.persist(&session) {
            warn!(error = %e, "Session not saved");
        }
        info!(email, "Logged in");
        Ok(session)
    }

    pub fn logout(&self) {
        self.set_session(None);
        match std::fs::remove_file(&self.session_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {}: {}", self.session_path.display(), e),
        }
        info!("Logged out");
    }

    pub fn is_authenticated(&self) -> bool {
        self.current()
            .map(|s| token_is_valid(&s.token))
            .unwrap_or(false)
    }

    /// Adopt an externally obtained token and report whether it is valid.
    pub fn validate_token(&self, token: &str) -> bool {
        self.set_session(Some(AuthSession {
            token: token.to_string(),
            record: serde_json::Value::Null,
        }));
        self.is_authenticated()
    }
}
