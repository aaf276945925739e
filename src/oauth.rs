use jsonwebtoken::{Algorithm, EncodingKey, Header};
use log::debug;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::credentials::ServiceAccount;
use crate::error::ServiceError;
use crate::retry::RetryPolicy;

pub const DATASTORE_SCOPE: &str = "https://www.googleapis.com/auth/datastore";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;
/// Tokens are refreshed this long before they expire
const REFRESH_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

struct CachedToken {
    token: String,
    refresh_at: Instant,
}

/// Exchanges a signed service-account assertion for bearer tokens
pub struct TokenProvider {
    http: Client,
    account: ServiceAccount,
    scope: String,
    retry: RetryPolicy,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenProvider {
    pub fn new(http: Client, account: ServiceAccount, scope: &str, retry: RetryPolicy) -> Self {
        Self {
            http,
            account,
            scope: scope.to_string(),
            retry,
            cached: Mutex::new(None),
        }
    }

    /// Build the RS256 JWT sent to the token endpoint
    pub fn assertion(&self, issued_at: i64) -> Result<String, ServiceError> {
        let claims = Claims {
            iss: &self.account.client_email,
            scope: &self.scope,
            aud: &self.account.token_uri,
            iat: issued_at,
            exp: issued_at + ASSERTION_LIFETIME_SECS,
        };
        let key = EncodingKey::from_rsa_pem(self.account.private_key.as_bytes())
            .map_err(|e| ServiceError::Auth(format!("invalid service account key: {}", e)))?;
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|e| ServiceError::Auth(format!("failed to sign assertion: {}", e)))
    }

    async fn fetch(&self) -> Result<TokenResponse, ServiceError> {
        let assertion = self.assertion(chrono::Utc::now().timestamp())?;
        let response = self
            .http
            .post(&self.account.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(ServiceError::Api {
                service: "oauth2",
                status: status.as_u16(),
                code: None,
                message: text,
            });
        }
        serde_json::from_str(&text).map_err(|e| ServiceError::Decode {
            service: "oauth2",
            message: e.to_string(),
        })
    }

    /// Current access token, refreshed when close to expiry
    pub async fn access_token(&self) -> Result<String, ServiceError> {
        let mut cached = self.cached.lock().await;
        if let Some(entry) = cached.as_ref() {
            if Instant::now() < entry.refresh_at {
                return Ok(entry.token.clone());
            }
        }

        let fresh = self.retry.run("token exchange", || self.fetch()).await?;
        debug!("Obtained access token valid for {}s", fresh.expires_in);
        let lifetime = Duration::from_secs(fresh.expires_in).saturating_sub(REFRESH_MARGIN);
        *cached = Some(CachedToken {
            token: fresh.access_token.clone(),
            refresh_at: Instant::now() + lifetime,
        });
        Ok(fresh.access_token)
    }
}
