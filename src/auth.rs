//! HS256 device tokens sent as `Authorization: Bearer` on cloud requests.

use std::time::Duration;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use hmac::{digest::InvalidLength, Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use tracing::warn;

/// Used when the config has no `jwt_secret`
pub const DEFAULT_SECRET: &str = "ada-pi-default-secret";

const HEADER: &str = r#"{"alg":"HS256","typ":"JWT"}"#;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("invalid signing key: {0}")]
    Key(#[from] InvalidLength),
    #[error("could not encode claims: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("malformed token")]
    Malformed,
    #[error("bad signature")]
    Signature,
    #[error("token expired")]
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub device: String,
    /// unix seconds
    pub exp: i64,
}

pub struct DeviceToken;

impl DeviceToken {
    /// Sign a token for `device_id` valid for `ttl`
    pub fn mint(device_id: &str, secret: Option<&str>, ttl: Duration) -> Result<String, TokenError> {
        let secret = secret.filter(|s| !s.is_empty()).unwrap_or_else(|| {
            warn!("No JWT secret configured, using the default key");
            DEFAULT_SECRET
        });
        let claims = Claims {
            device: device_id.to_string(),
            exp: Utc::now().timestamp() + ttl.as_secs() as i64,
        };

        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(HEADER),
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims)?)
        );
        let signature = sign(secret, &signing_input)?;
        Ok(format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(signature)))
    }

    /// Check signature and expiry, returning the claims
    pub fn verify(token: &str, secret: &str) -> Result<Claims, TokenError> {
        let (signing_input, signature) = token.rsplit_once('.').ok_or(TokenError::Malformed)?;
        let (_, claims) = signing_input
            .split_once('.')
            .ok_or(TokenError::Malformed)?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| TokenError::Malformed)?;

        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())?;
        mac.update(signing_input.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| TokenError::Signature)?;

        let claims: Claims = URL_SAFE_NO_PAD
            .decode(claims)
            .ok()
            .and_then(|raw| serde_json::from_slice(&raw).ok())
            .ok_or(TokenError::Malformed)?;
        if claims.exp <= Utc::now().timestamp() {
            return Err(TokenError::Expired);
        }
        Ok(claims)
    }
}

fn sign(secret: &str, input: &str) -> Result<Vec<u8>, TokenError> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())?;
    mac.update(input.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}
