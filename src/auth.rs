//! Peer authentication hook: symmetric-secret signed tokens attached to the
//! WebSocket upgrade handshake.

use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

const TOKEN_TTL_SECONDS: i64 = 24 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Claims {
    sub: String,
    url: String,
    iat: i64,
    exp: i64,
}

/// Signs a token identifying `node_id` reachable at `node_url`, valid for
/// 24 hours from now.
pub fn generate_token(node_id: &str, node_url: &str, secret: &str) -> AppResult<String> {
    let now = crate::clock::now_millis() / 1000;
    let claims = Claims {
        sub: node_id.to_string(),
        url: node_url.to_string(),
        iat: now,
        exp: now + TOKEN_TTL_SECONDS,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes()))
        .map_err(AppError::from)
}

/// Validates a bearer token and returns `(node_id, node_url)` on success.
pub fn validate_token(token: &str, secret: &str) -> AppResult<(String, String)> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(AppError::from)?;
    Ok((data.claims.sub, data.claims.url))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_token_validates_back_to_identity() {
        let token = generate_token("node-1", "ws://node-1.local:9000", "secret").unwrap();
        let (node_id, node_url) = validate_token(&token, "secret").unwrap();
        assert_eq!(node_id, "node-1");
        assert_eq!(node_url, "ws://node-1.local:9000");
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = generate_token("node-1", "ws://node-1.local:9000", "secret").unwrap();
        assert!(validate_token(&token, "wrong-secret").is_err());
    }

    #[test]
    fn malformed_token_is_rejected() {
        assert!(validate_token("not-a-jwt", "secret").is_err());
    }
}
