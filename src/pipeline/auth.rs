//! Google credentials for the extraction services.
//!
//! Document AI accepts either a ready OAuth access token or a service-account
//! key. A service-account key is exchanged for an access token with a signed
//! RS256 JWT (`urn:ietf:params:oauth:grant-type:jwt-bearer`); the token is
//! cached in memory and refreshed shortly before it expires. The key never
//! leaves the process.

use crate::error::AnalysisError;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::Utc;
use reqwest::Client;
use ring::rand::SystemRandom;
use ring::signature::{RsaKeyPair, RSA_PKCS1_SHA256};
use serde::Deserialize;
use serde_json::json;
use std::fmt;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// OAuth scope requested for minted tokens.
pub const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

/// Token endpoint used when the key file does not name one.
pub const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// Requested lifetime of a signed assertion.
const ASSERTION_LIFETIME_SECS: i64 = 3600;

/// Refresh this long before the cached token expires.
const REFRESH_MARGIN: Duration = Duration::from_secs(60);

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

/// The parts of a service-account JSON key the token exchange needs.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    /// PKCS#8 RSA key in PEM form.
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    #[serde(default)]
    pub project_id: Option<String>,
}

impl ServiceAccountKey {
    /// Parse and check a service-account JSON key.
    pub fn from_json(raw: &str) -> Result<Self, AnalysisError> {
        let key: ServiceAccountKey = serde_json::from_str(raw).map_err(|e| {
            AnalysisError::InvalidConfig(format!("invalid service-account key: {e}"))
        })?;
        if key.client_email.trim().is_empty() {
            return Err(AnalysisError::InvalidConfig(
                "service-account key has an empty client_email".into(),
            ));
        }
        key.key_pair()?;
        Ok(key)
    }

    fn key_pair(&self) -> Result<RsaKeyPair, AnalysisError> {
        let pem_text = self.private_key.replace("\\n", "\n");
        let parsed = pem::parse(pem_text.as_bytes()).map_err(|e| {
            AnalysisError::InvalidConfig(format!("service-account private key is not PEM: {e}"))
        })?;
        RsaKeyPair::from_pkcs8(parsed.contents()).map_err(|e| {
            AnalysisError::InvalidConfig(format!("service-account private key rejected: {e}"))
        })
    }

    /// Build the signed JWT assertion for the token exchange, issued at `now`
    /// (seconds since the epoch).
    pub fn signed_assertion(&self, now: i64) -> Result<String, AnalysisError> {
        let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"RS256","typ":"JWT"}"#);
        let claims = json!({
            "iss": self.client_email,
            "scope": CLOUD_PLATFORM_SCOPE,
            "aud": self.token_uri,
            "iat": now,
            "exp": now + ASSERTION_LIFETIME_SECS,
        });
        let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
        let signing_input = format!("{header}.{payload}");

        let key_pair = self.key_pair()?;
        let mut signature = vec![0u8; key_pair.public().modulus_len()];
        key_pair
            .sign(
                &RSA_PKCS1_SHA256,
                &SystemRandom::new(),
                signing_input.as_bytes(),
                &mut signature,
            )
            .map_err(|_| AnalysisError::Internal("failed to sign token assertion".into()))?;

        Ok(format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(&signature)))
    }
}

impl fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("client_email", &self.client_email)
            .field("private_key", &"<redacted>")
            .field("token_uri", &self.token_uri)
            .field("project_id", &self.project_id)
            .finish()
    }
}

/// How requests to Google are authorised.
#[derive(Clone, PartialEq, Eq)]
pub enum GoogleCredentials {
    /// A bearer token used as-is until it stops working.
    AccessToken(String),
    /// A key exchanged for short-lived tokens on demand.
    ServiceAccount(ServiceAccountKey),
}

impl GoogleCredentials {
    /// The project named by a service-account key, if any.
    pub fn project_id(&self) -> Option<&str> {
        match self {
            GoogleCredentials::ServiceAccount(key) => key.project_id.as_deref(),
            GoogleCredentials::AccessToken(_) => None,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        match self {
            GoogleCredentials::AccessToken(t) => t.trim().is_empty(),
            GoogleCredentials::ServiceAccount(_) => false,
        }
    }
}

impl From<&str> for GoogleCredentials {
    fn from(token: &str) -> Self {
        GoogleCredentials::AccessToken(token.to_string())
    }
}

impl From<String> for GoogleCredentials {
    fn from(token: String) -> Self {
        GoogleCredentials::AccessToken(token)
    }
}

impl From<ServiceAccountKey> for GoogleCredentials {
    fn from(key: ServiceAccountKey) -> Self {
        GoogleCredentials::ServiceAccount(key)
    }
}

impl fmt::Debug for GoogleCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GoogleCredentials::AccessToken(_) => f.write_str("AccessToken(<redacted>)"),
            GoogleCredentials::ServiceAccount(key) => {
                f.debug_tuple("ServiceAccount").field(key).finish()
            }
        }
    }
}

struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Hands out bearer tokens for one set of credentials.
pub(crate) struct TokenSource {
    credentials: GoogleCredentials,
    client: Client,
    timeout: Duration,
    cached: RwLock<Option<CachedToken>>,
}

impl TokenSource {
    pub(crate) fn new(credentials: GoogleCredentials, client: Client, timeout: Duration) -> Self {
        Self {
            credentials,
            client,
            timeout,
            cached: RwLock::new(None),
        }
    }

    /// A bearer token valid for at least [`REFRESH_MARGIN`].
    pub(crate) async fn token(&self) -> Result<String, AnalysisError> {
        let key = match &self.credentials {
            GoogleCredentials::AccessToken(token) => return Ok(token.clone()),
            GoogleCredentials::ServiceAccount(key) => key,
        };

        {
            let cached = self.cached.read().await;
            if let Some(ref t) = *cached {
                if t.expires_at > Instant::now() + REFRESH_MARGIN {
                    return Ok(t.access_token.clone());
                }
            }
        }

        let mut cached = self.cached.write().await;
        // Another request may have refreshed while we waited for the lock.
        if let Some(ref t) = *cached {
            if t.expires_at > Instant::now() + REFRESH_MARGIN {
                return Ok(t.access_token.clone());
            }
        }
        let fresh = self.exchange(key).await?;
        let token = fresh.access_token.clone();
        *cached = Some(fresh);
        Ok(token)
    }

    async fn exchange(&self, key: &ServiceAccountKey) -> Result<CachedToken, AnalysisError> {
        let assertion = key.signed_assertion(Utc::now().timestamp())?;
        debug!("Exchanging service-account assertion for {}", key.client_email);

        let response = self
            .client
            .post(&key.token_uri)
            .timeout(self.timeout)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await
            .map_err(|e| token_error(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let excerpt: String = body.trim().chars().take(300).collect();
            return Err(token_error(format!("HTTP {status}: {excerpt}")));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| token_error(format!("invalid token response: {e}")))?;
        let lifetime = Duration::from_secs(body.expires_in.unwrap_or(3600));
        info!(
            "Minted access token for {} (valid {}s)",
            key.client_email,
            lifetime.as_secs()
        );

        Ok(CachedToken {
            access_token: body.access_token,
            expires_at: Instant::now() + lifetime,
        })
    }
}

fn token_error(reason: String) -> AnalysisError {
    AnalysisError::ExtractionFailed {
        reason: format!("token exchange failed: {reason}"),
    }
}
