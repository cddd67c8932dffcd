//! Session context: who the viewer is and the credential to act as them.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::Value;

use crate::error::SyncError;

/// Claims checked, in order, for the viewer's user id.
const USER_ID_CLAIMS: [&str; 2] = ["nameid", "sub"];

/// The signed-in viewer.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    pub current_user_id: String,
    pub token: String,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("current_user_id", &self.current_user_id)
            .field("token", &"<redacted>")
            .finish()
    }
}

impl Session {
    pub fn new(current_user_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            current_user_id: current_user_id.into(),
            token: token.into(),
        }
    }

    /// Build a session from a JWT bearer token.
    ///
    /// The signature is not checked; the backend does that on every call.
    pub fn from_bearer(token: &str) -> Result<Self, SyncError> {
        let token = token.trim();
        let token = token.strip_prefix("Bearer ").unwrap_or(token);

        let payload = token
            .split('.')
            .nth(1)
            .ok_or_else(|| SyncError::InvalidSession("token is not a JWT".to_string()))?;
        let bytes = URL_SAFE_NO_PAD
            .decode(payload.trim_end_matches('='))
            .map_err(|e| SyncError::InvalidSession(format!("bad token payload: {}", e)))?;
        let claims: Value = serde_json::from_slice(&bytes)
            .map_err(|e| SyncError::InvalidSession(format!("bad token claims: {}", e)))?;

        let user_id = USER_ID_CLAIMS
            .iter()
            .find_map(|claim| match claims.get(claim) {
                Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
                Some(Value::Number(n)) => Some(n.to_string()),
                _ => None,
            })
            .ok_or_else(|| SyncError::InvalidSession("token has no user id claim".to_string()))?;

        Ok(Self::new(user_id, token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jwt(claims: Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let body = URL_SAFE_NO_PAD.encode(claims.to_string());
        format!("{}.{}.signature", header, body)
    }

    #[test]
    fn test_nameid_claim() {
        let token = jwt(serde_json::json!({ "nameid": "42", "sub": "other" }));
        let session = Session::from_bearer(&token).unwrap();
        assert_eq!(session.current_user_id, "42");
        assert_eq!(session.token, token);
    }

    #[test]
    fn test_sub_fallback_and_bearer_prefix() {
        let token = jwt(serde_json::json!({ "sub": 7 }));
        let session = Session::from_bearer(&format!("Bearer {}", token)).unwrap();
        assert_eq!(session.current_user_id, "7");
        assert_eq!(session.token, token);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(
            Session::from_bearer("not-a-token"),
            Err(SyncError::InvalidSession(_))
        ));
        let token = jwt(serde_json::json!({ "role": "user" }));
        assert!(Session::from_bearer(&token).is_err());
    }

    #[test]
    fn test_debug_redacts_token() {
        let session = Session::new("u1", "secret");
        assert!(!format!("{:?}", session).contains("secret"));
    }
}
