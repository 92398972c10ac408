//! Identity behind a bearer id_token
//!
//! The key-share node never issues tokens. It reads the claims of a token
//! minted and signed by the upstream OAuth gateway and maps them to a
//! node-local identity `(auth_type, user_identifier)`.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::Deserialize;

use crate::error::{Result, TssError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub auth_type: String,
    pub user_identifier: String,
}

pub trait IdentityVerifier: Send + Sync {
    fn verify(&self, auth_type: &str, id_token: &str) -> Result<Identity>;
}

#[derive(Debug, Deserialize)]
struct Claims {
    iss: String,
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    email: Option<String>,
    exp: i64,
}

/// Reads JWT claims and checks `exp` and the issuer allow-list.
///
/// Allow-list entries are either `issuer` (any auth type) or
/// `auth_type=issuer`. An empty list accepts every issuer; production
/// config refuses to start with one.
#[derive(Debug, Clone, Default)]
pub struct JwtClaimsVerifier {
    allowed: Vec<(Option<String>, String)>,
}

impl JwtClaimsVerifier {
    pub fn new(allowed_issuers: &[String]) -> Self {
        let allowed = allowed_issuers
            .iter()
            .map(|entry| match entry.split_once('=') {
                Some((auth_type, issuer)) => (Some(auth_type.trim().to_string()), issuer.trim().to_string()),
                None => (None, entry.trim().to_string()),
            })
            .collect();
        Self { allowed }
    }

    fn issuer_allowed(&self, auth_type: &str, issuer: &str) -> bool {
        self.allowed.is_empty()
            || self.allowed.iter().any(|(scope, allowed)| {
                allowed == issuer && scope.as_deref().map_or(true, |s| s == auth_type)
            })
    }
}

impl IdentityVerifier for JwtClaimsVerifier {
    fn verify(&self, auth_type: &str, id_token: &str) -> Result<Identity> {
        if auth_type.is_empty() {
            return Err(TssError::Unauthorized("missing auth type".to_string()));
        }

        let payload = id_token
            .split('.')
            .nth(1)
            .ok_or_else(|| TssError::Unauthorized("malformed id_token".to_string()))?;
        let raw = URL_SAFE_NO_PAD
            .decode(payload.trim_end_matches('='))
            .map_err(|_| TssError::Unauthorized("malformed id_token payload".to_string()))?;
        let claims: Claims = serde_json::from_slice(&raw)
            .map_err(|_| TssError::Unauthorized("malformed id_token claims".to_string()))?;

        if claims.exp <= chrono::Utc::now().timestamp() {
            return Err(TssError::Unauthorized("id_token expired".to_string()));
        }
        if !self.issuer_allowed(auth_type, &claims.iss) {
            return Err(TssError::Unauthorized(format!("issuer not allowed: {}", claims.iss)));
        }

        let user_identifier = claims
            .email
            .filter(|e| !e.is_empty())
            .or(claims.sub)
            .ok_or_else(|| TssError::Unauthorized("id_token has no subject".to_string()))?;

        Ok(Identity {
            auth_type: auth_type.to_string(),
            user_identifier,
        })
    }
}

/// Unsigned JWT with the given claims, for tests and local tooling
pub fn unsigned_token(claims: &serde_json::Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let body = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{}.{}.", header, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn token(iss: &str, exp_offset: i64) -> String {
        unsigned_token(&json!({
            "iss": iss,
            "sub": "user-1",
            "email": "alice@example.com",
            "exp": chrono::Utc::now().timestamp() + exp_offset,
        }))
    }

    #[test]
    fn test_email_preferred_over_sub() {
        let verifier = JwtClaimsVerifier::new(&["https://accounts.google.com".to_string()]);
        let identity = verifier.verify("google", &token("https://accounts.google.com", 600)).unwrap();
        assert_eq!(identity.user_identifier, "alice@example.com");
        assert_eq!(identity.auth_type, "google");
    }

    #[test]
    fn test_sub_when_no_email() {
        let verifier = JwtClaimsVerifier::default();
        let raw = unsigned_token(&json!({"iss": "x", "sub": "abc", "exp": chrono::Utc::now().timestamp() + 60}));
        assert_eq!(verifier.verify("apple", &raw).unwrap().user_identifier, "abc");
    }

    #[test]
    fn test_expired_token_rejected() {
        let verifier = JwtClaimsVerifier::default();
        let err = verifier.verify("google", &token("x", -10)).unwrap_err();
        assert_eq!(err.code(), "UNAUTHORIZED");
    }

    #[test]
    fn test_scoped_issuer() {
        let verifier = JwtClaimsVerifier::new(&["google=https://accounts.google.com".to_string()]);
        assert!(verifier.verify("google", &token("https://accounts.google.com", 60)).is_ok());
        assert!(verifier.verify("apple", &token("https://accounts.google.com", 60)).is_err());
        assert!(verifier.verify("google", &token("https://evil.example", 60)).is_err());
    }

    #[test]
    fn test_garbage_token() {
        let verifier = JwtClaimsVerifier::default();
        assert!(verifier.verify("google", "not-a-jwt").is_err());
        assert!(verifier.verify("google", "a.!!!.c").is_err());
    }
}
