use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

/// Claims carried in a connection token. `sub` is the stable external id,
/// `name` the display name to show other participants.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub name: String,
    #[serde(rename = "avatarUrl", skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    pub exp: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing token")]
    MissingToken,

    #[error("token expired")]
    Expired,

    #[error("invalid token: {0}")]
    Invalid(String),
}

impl AuthError {
    /// Short stable label for the rejection counter.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::MissingToken => "missing_token",
            Self::Expired => "expired",
            Self::Invalid(_) => "invalid",
        }
    }
}

/// Verifies shared-secret HS256 tokens at connection time.
///
/// Verification either admits the connection with the decoded claims or
/// rejects it; there is no partial admission and no retry.
pub struct AuthGate {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl AuthGate {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Invalid(e.to_string()),
            })
    }
}

/// Extract a token from an `Authorization: Bearer <token>` header.
/// Fallback path for clients that cannot send an auth frame.
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let token = raw.strip_prefix("Bearer ")?.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "your_shared_secret_here";

    fn make_token(secret: &str, exp_offset_secs: i64) -> String {
        let claims = Claims {
            sub: "appA:alice".into(),
            name: "Alice".into(),
            avatar_url: None,
            exp: (chrono::Utc::now().timestamp() + exp_offset_secs) as usize,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn verify_valid_token() {
        let gate = AuthGate::new(SECRET);
        let claims = gate.verify(&make_token(SECRET, 3600)).unwrap();
        assert_eq!(claims.sub, "appA:alice");
        assert_eq!(claims.name, "Alice");
        assert!(claims.avatar_url.is_none());
    }

    #[test]
    fn verify_claims_with_avatar() {
        let gate = AuthGate::new(SECRET);
        let claims = Claims {
            sub: "appA:bob".into(),
            name: "Bob".into(),
            avatar_url: Some("https://cdn/b.png".into()),
            exp: (chrono::Utc::now().timestamp() + 60) as usize,
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();

        let decoded = gate.verify(&token).unwrap();
        assert_eq!(decoded.avatar_url.as_deref(), Some("https://cdn/b.png"));
    }

    #[test]
    fn expired_token_rejected() {
        let gate = AuthGate::new(SECRET);
        let result = gate.verify(&make_token(SECRET, -3600));
        assert!(matches!(result, Err(AuthError::Expired)));
    }

    #[test]
    fn wrong_secret_rejected() {
        let gate = AuthGate::new(SECRET);
        let result = gate.verify(&make_token("some_other_secret", 3600));
        assert!(matches!(result, Err(AuthError::Invalid(_))));
    }

    #[test]
    fn garbage_token_rejected() {
        let gate = AuthGate::new(SECRET);
        assert!(matches!(
            gate.verify("not.a.token"),
            Err(AuthError::Invalid(_))
        ));
    }

    #[test]
    fn bearer_header_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "Bearer abc.def.ghi".parse().unwrap());
        assert_eq!(bearer_token(&headers).as_deref(), Some("abc.def.ghi"));
    }

    #[test]
    fn missing_or_malformed_header_yields_none() {
        assert!(bearer_token(&HeaderMap::new()).is_none());

        let mut basic = HeaderMap::new();
        basic.insert(AUTHORIZATION, "Basic dXNlcjpwYXNz".parse().unwrap());
        assert!(bearer_token(&basic).is_none());

        let mut empty = HeaderMap::new();
        empty.insert(AUTHORIZATION, "Bearer ".parse().unwrap());
        assert!(bearer_token(&empty).is_none());
    }
}
