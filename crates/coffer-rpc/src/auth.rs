//! JWT minting and verification for the storage RPC.

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

/// Lifetime of a minted RPC token.
const TOKEN_EXPIRY_HOURS: i64 = 24;

/// Shared secret identity of the server; RPC logins are checked against it.
#[derive(Clone, Debug)]
pub struct RpcCredentials {
    pub access_key: String,
    pub secret_key: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    iat: i64,
    exp: i64,
}

/// Mint a token for `access_key`, signed with the server secret.
pub fn generate_token(creds: &RpcCredentials) -> Result<String, jsonwebtoken::errors::Error> {
    let now = Utc::now();
    let claims = Claims {
        sub: creds.access_key.clone(),
        iat: now.timestamp(),
        exp: (now + Duration::hours(TOKEN_EXPIRY_HOURS)).timestamp(),
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(creds.secret_key.as_bytes()),
    )
}

/// Whether `token` is a live token signed with our secret.
#[must_use]
pub fn verify_token(creds: &RpcCredentials, token: &str) -> bool {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(creds.secret_key.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )
    .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> RpcCredentials {
        RpcCredentials {
            access_key: "storage-admin".to_string(),
            secret_key: "very-secret-key".to_string(),
        }
    }

    #[test]
    fn minted_tokens_verify() {
        let creds = creds();
        let token = generate_token(&creds).unwrap();
        assert!(verify_token(&creds, &token));
    }

    #[test]
    fn wrong_secret_fails() {
        let creds = creds();
        let token = generate_token(&creds).unwrap();
        let other = RpcCredentials {
            access_key: creds.access_key.clone(),
            secret_key: "different".to_string(),
        };
        assert!(!verify_token(&other, &token));
        assert!(!verify_token(&creds, "garbage.token.value"));
    }
}
