use anyhow::{anyhow, Context, Result};
use axum::http::HeaderMap;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::AuthConfig;

/// Default lifetime for tokens minted by the operator CLI.
pub const DEFAULT_TOKEN_TTL_HOURS: i64 = 12;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("malformed token")]
    Malformed,
    #[error("token expired")]
    Expired,
    #[error("signature verification failed")]
    InvalidSignature,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessClaims {
    pub user_id: Uuid,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Mints bearer tokens. Issuance is the auth service's job in production;
/// this signer exists for the operator CLI and for tests, and its verifying
/// key seeds the verifier.
#[derive(Clone)]
pub struct TokenSigner {
    signing_key: SigningKey,
}

impl TokenSigner {
    pub fn from_config(config: &AuthConfig) -> Result<Self> {
        match config.signing_key.as_deref() {
            Some(raw) => {
                let decoded = URL_SAFE_NO_PAD
                    .decode(raw.trim())
                    .with_context(|| "failed to decode auth signing key from base64 (URL-safe)")?;
                let bytes: [u8; 32] = decoded
                    .try_into()
                    .map_err(|_| anyhow!("auth signing key must be 32 bytes"))?;
                Ok(Self {
                    signing_key: SigningKey::from_bytes(&bytes),
                })
            }
            None => Ok(Self {
                signing_key: SigningKey::generate(&mut rand::rngs::OsRng),
            }),
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn verifying_key_base64(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.verifying_key().as_bytes())
    }

    pub fn mint(&self, user_id: Uuid, ttl: Duration) -> Result<String> {
        let issued_at = Utc::now();
        let claims = AccessClaims {
            user_id,
            issued_at,
            expires_at: issued_at + ttl,
        };
        let payload = serde_json::to_vec(&claims)?;
        let signature = self.signing_key.sign(&payload);

        Ok(format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&payload),
            URL_SAFE_NO_PAD.encode(signature.to_bytes())
        ))
    }
}

/// Validates bearer tokens against the active verifying key plus any
/// configured rotation fallbacks.
#[derive(Clone)]
pub struct TokenVerifier {
    keys: Vec<VerifyingKey>,
}

impl TokenVerifier {
    pub fn from_config(signer: &TokenSigner, config: &AuthConfig) -> Result<Self> {
        let mut keys = vec![signer.verifying_key()];
        for raw in &config.fallback_verifying_keys {
            let decoded = URL_SAFE_NO_PAD
                .decode(raw.trim())
                .with_context(|| "failed to decode fallback verifying key")?;
            let bytes: [u8; 32] = decoded
                .try_into()
                .map_err(|_| anyhow!("fallback verifying key must be 32 bytes"))?;
            keys.push(VerifyingKey::from_bytes(&bytes)?);
        }
        Ok(Self { keys })
    }

    pub fn verify(&self, token: &str) -> Result<AccessClaims, AuthError> {
        let (payload_b64, signature_b64) = token.split_once('.').ok_or(AuthError::Malformed)?;
        let payload = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| AuthError::Malformed)?;
        let signature_bytes = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|_| AuthError::Malformed)?;
        let signature =
            Signature::from_slice(&signature_bytes).map_err(|_| AuthError::Malformed)?;

        if !self
            .keys
            .iter()
            .any(|key| key.verify_strict(&payload, &signature).is_ok())
        {
            return Err(AuthError::InvalidSignature);
        }

        let claims: AccessClaims =
            serde_json::from_slice(&payload).map_err(|_| AuthError::Malformed)?;
        if claims.expires_at <= Utc::now() {
            return Err(AuthError::Expired);
        }
        Ok(claims)
    }
}

/// Pull a bearer credential out of an HTTP request: the Authorization header
/// wins, a `token` query parameter is the fallback for browser WebSocket
/// clients that cannot set headers.
pub fn bearer_token(headers: &HeaderMap, query_token: Option<&str>) -> Option<String> {
    if let Some(value) = headers.get(axum::http::header::AUTHORIZATION) {
        if let Ok(text) = value.to_str() {
            if let Some(token) = text.strip_prefix("Bearer ") {
                return Some(token.to_string());
            }
        }
    }
    query_token.map(|token| token.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn signer() -> TokenSigner {
        TokenSigner::from_config(&AuthConfig::default()).expect("signer")
    }

    #[test]
    fn minted_tokens_verify() {
        let signer = signer();
        let verifier = TokenVerifier::from_config(&signer, &AuthConfig::default()).unwrap();
        let user_id = Uuid::new_v4();

        let token = signer.mint(user_id, Duration::hours(1)).unwrap();
        let claims = verifier.verify(&token).expect("valid token");
        assert_eq!(claims.user_id, user_id);
    }

    #[test]
    fn expired_tokens_are_rejected() {
        let signer = signer();
        let verifier = TokenVerifier::from_config(&signer, &AuthConfig::default()).unwrap();

        let token = signer.mint(Uuid::new_v4(), Duration::hours(-1)).unwrap();
        assert!(matches!(verifier.verify(&token), Err(AuthError::Expired)));
    }

    #[test]
    fn foreign_signatures_are_rejected() {
        let verifier = TokenVerifier::from_config(&signer(), &AuthConfig::default()).unwrap();
        let other = signer();

        let token = other.mint(Uuid::new_v4(), Duration::hours(1)).unwrap();
        assert!(matches!(
            verifier.verify(&token),
            Err(AuthError::InvalidSignature)
        ));
    }

    #[test]
    fn fallback_keys_still_verify() {
        let old_signer = signer();
        let new_signer = signer();
        let config = AuthConfig {
            signing_key: None,
            fallback_verifying_keys: vec![old_signer.verifying_key_base64()],
        };
        let verifier = TokenVerifier::from_config(&new_signer, &config).unwrap();

        let token = old_signer.mint(Uuid::new_v4(), Duration::hours(1)).unwrap();
        assert!(verifier.verify(&token).is_ok());
    }

    #[test]
    fn garbage_is_malformed() {
        let verifier = TokenVerifier::from_config(&signer(), &AuthConfig::default()).unwrap();
        assert!(matches!(
            verifier.verify("not-a-token"),
            Err(AuthError::Malformed)
        ));
        assert!(matches!(
            verifier.verify("a.b"),
            Err(AuthError::Malformed)
        ));
    }

    #[test]
    fn bearer_token_prefers_the_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer header-token"),
        );
        assert_eq!(
            bearer_token(&headers, Some("query-token")).as_deref(),
            Some("header-token")
        );
        assert_eq!(
            bearer_token(&HeaderMap::new(), Some("query-token")).as_deref(),
            Some("query-token")
        );
        assert!(bearer_token(&HeaderMap::new(), None).is_none());
    }
}
