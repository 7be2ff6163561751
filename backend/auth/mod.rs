//! Identity Verifier: validates bearer tokens and extracts the Principal.
//!
//! Pure with respect to the token — no I/O. Mirrors the original source's
//! `security.verify_and_parse_jwt`: signature check, `category == "access"`,
//! expiry strictly in the future, both `username` and `role` present.

use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing or malformed Authorization header")]
    Missing,
    #[error("token expired")]
    Expired,
    #[error("invalid token: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Free,
    Member,
    Admin,
}

impl Role {
    fn parse(raw: &str) -> Option<Role> {
        match raw.to_ascii_uppercase().as_str() {
            "FREE" => Some(Role::Free),
            "MEMBER" => Some(Role::Member),
            "ADMIN" => Some(Role::Admin),
            _ => None,
        }
    }

    /// FREE is the only quota-limited role; MEMBER and ADMIN bypass it (§4.5).
    pub fn is_unlimited(self) -> bool {
        matches!(self, Role::Member | Role::Admin)
    }
}

/// The authenticated identity extracted from a bearer token (§3).
/// Created fresh on each request; never mutated; discarded when the request ends.
#[derive(Debug, Clone)]
pub struct Principal {
    pub username: String,
    pub role: Role,
    pub expiry: i64,
}

#[derive(Debug, Deserialize)]
struct Claims {
    username: Option<String>,
    role: Option<String>,
    category: Option<String>,
    exp: i64,
}

pub fn extract_bearer_token(header: Option<&str>) -> Result<&str, AuthError> {
    header
        .and_then(|h| h.strip_prefix("Bearer "))
        .filter(|t| !t.is_empty())
        .ok_or(AuthError::Missing)
}

/// Validates signature, `category`, expiry, and required claims; produces a
/// Principal iff all four hold (§4.1).
pub fn verify_token(token: &str, secret: &str, algorithm: Algorithm) -> Result<Principal, AuthError> {
    let mut validation = Validation::new(algorithm);
    validation.validate_exp = true;

    let data = jsonwebtoken::decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map_err(|e| match e.kind() {
        jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
        other => AuthError::Invalid(other.to_string()),
    })?;

    let claims = data.claims;

    if claims.category.as_deref() != Some("access") {
        return Err(AuthError::Invalid("not an access token".into()));
    }

    let now = chrono::Utc::now().timestamp();
    if claims.exp <= now {
        return Err(AuthError::Expired);
    }

    let username = claims
        .username
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AuthError::Invalid("missing username claim".into()))?;
    let role = claims
        .role
        .as_deref()
        .filter(|s| !s.is_empty())
        .and_then(Role::parse)
        .ok_or_else(|| AuthError::Invalid("missing or unrecognized role claim".into()))?;

    Ok(Principal {
        username,
        role,
        expiry: claims.exp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use serde_json::json;

    fn token_with(claims: serde_json::Value, secret: &str) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn accepts_well_formed_token() {
        let secret = "s3cr3t";
        let now = chrono::Utc::now().timestamp();
        let token = token_with(
            json!({"username": "alice", "role": "free", "category": "access", "exp": now + 3600}),
            secret,
        );
        let principal = verify_token(&token, secret, Algorithm::HS256).unwrap();
        assert_eq!(principal.username, "alice");
        assert_eq!(principal.role, Role::Free);
    }

    #[test]
    fn rejects_expired_token() {
        let secret = "s3cr3t";
        let now = chrono::Utc::now().timestamp();
        let token = token_with(
            json!({"username": "alice", "role": "free", "category": "access", "exp": now - 10}),
            secret,
        );
        assert!(matches!(
            verify_token(&token, secret, Algorithm::HS256),
            Err(AuthError::Expired)
        ));
    }

    #[test]
    fn rejects_non_access_category() {
        let secret = "s3cr3t";
        let now = chrono::Utc::now().timestamp();
        let token = token_with(
            json!({"username": "alice", "role": "free", "category": "refresh", "exp": now + 3600}),
            secret,
        );
        assert!(matches!(
            verify_token(&token, secret, Algorithm::HS256),
            Err(AuthError::Invalid(_))
        ));
    }

    #[test]
    fn rejects_missing_role() {
        let secret = "s3cr3t";
        let now = chrono::Utc::now().timestamp();
        let token = token_with(
            json!({"username": "alice", "category": "access", "exp": now + 3600}),
            secret,
        );
        assert!(matches!(
            verify_token(&token, secret, Algorithm::HS256),
            Err(AuthError::Invalid(_))
        ));
    }

    #[test]
    fn rejects_wrong_secret() {
        let now = chrono::Utc::now().timestamp();
        let token = token_with(
            json!({"username": "alice", "role": "free", "category": "access", "exp": now + 3600}),
            "s3cr3t",
        );
        assert!(verify_token(&token, "other-secret", Algorithm::HS256).is_err());
    }

    #[test]
    fn extracts_bearer_token() {
        assert_eq!(extract_bearer_token(Some("Bearer abc.def.ghi")).unwrap(), "abc.def.ghi");
        assert!(matches!(extract_bearer_token(None), Err(AuthError::Missing)));
        assert!(matches!(
            extract_bearer_token(Some("Basic abc")),
            Err(AuthError::Missing)
        ));
    }

    #[test]
    fn role_unlimited_matches_member_and_admin() {
        assert!(!Role::Free.is_unlimited());
        assert!(Role::Member.is_unlimited());
        assert!(Role::Admin.is_unlimited());
    }
}
