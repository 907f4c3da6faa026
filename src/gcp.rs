//! Access tokens for Google Cloud APIs.
//!
//! Both the BigQuery ledger and the Cloud Monitoring sink authenticate with a
//! bearer token obtained from a [`TokenProvider`].

use std::sync::Arc;
#[cfg(feature = "gcp-sdk")]
use std::time::{Duration, Instant};

use async_trait::async_trait;
#[cfg(feature = "gcp-sdk")]
use tokio::sync::RwLock;

use crate::config::GcpCredentials;

/// OAuth scope covering BigQuery jobs and Cloud Monitoring writes.
pub const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

/// Buffer time before token expiry to trigger refresh (5 minutes).
#[cfg(feature = "gcp-sdk")]
const TOKEN_REFRESH_BUFFER: Duration = Duration::from_secs(300);

/// Default token cache duration (1 hour).
/// Most Google OAuth tokens have a 1-hour lifetime.
#[cfg(feature = "gcp-sdk")]
const TOKEN_CACHE_DURATION: Duration = Duration::from_secs(3600);

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("failed to read service account key file '{path}': {source}")]
    KeyFile {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse service account JSON: {0}")]
    InvalidKey(String),

    #[error("failed to obtain access token: {0}")]
    Token(String),

    #[error("credential type '{0}' requires the 'gcp-sdk' feature")]
    FeatureDisabled(&'static str),
}

/// Source of bearer tokens for Google APIs.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Return a bearer token (without the `Bearer ` prefix).
    async fn token(&self) -> Result<String, AuthError>;
}

/// Build the token provider for a credential configuration.
pub fn token_provider(credentials: &GcpCredentials) -> Arc<dyn TokenProvider> {
    match credentials {
        GcpCredentials::Static { token } => Arc::new(StaticTokenProvider::new(token.clone())),
        other => Arc::new(GcpTokenProvider::new(other.clone())),
    }
}

/// Always returns the same token.
#[derive(Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn token(&self) -> Result<String, AuthError> {
        Ok(self.token.clone())
    }
}

/// Tokens from Application Default Credentials or a service account key,
/// cached until shortly before they expire.
pub struct GcpTokenProvider {
    credentials: GcpCredentials,
    #[cfg(feature = "gcp-sdk")]
    token_cache: RwLock<Option<CachedToken>>,
}

#[cfg(feature = "gcp-sdk")]
struct CachedToken {
    token: String,
    expires_at: Instant,
}

impl GcpTokenProvider {
    pub fn new(credentials: GcpCredentials) -> Self {
        Self {
            credentials,
            #[cfg(feature = "gcp-sdk")]
            token_cache: RwLock::new(None),
        }
    }
}

#[cfg(feature = "gcp-sdk")]
#[async_trait]
impl TokenProvider for GcpTokenProvider {
    async fn token(&self) -> Result<String, AuthError> {
        {
            let cache = self.token_cache.read().await;
            if let Some(cached) = cache.as_ref()
                && cached.expires_at > Instant::now() + TOKEN_REFRESH_BUFFER
            {
                return Ok(cached.token.clone());
            }
        }

        let token = match &self.credentials {
            GcpCredentials::Default => {
                let config = google_cloud_auth::project::Config::default()
                    .with_scopes(&[CLOUD_PLATFORM_SCOPE]);
                let ts = google_cloud_auth::token::DefaultTokenSourceProvider::new(config)
                    .await
                    .map_err(|e| AuthError::Token(format!("failed to create token source: {e}")))?;
                fetch_token(&ts).await?
            }
            GcpCredentials::ServiceAccount { key_path } => {
                let json = tokio::fs::read_to_string(key_path)
                    .await
                    .map_err(|source| AuthError::KeyFile {
                        path: key_path.clone(),
                        source,
                    })?;
                token_from_service_account_json(&json).await?
            }
            GcpCredentials::ServiceAccountJson { json } => {
                token_from_service_account_json(json).await?
            }
            GcpCredentials::Static { token } => token.clone(),
        };

        {
            let mut cache = self.token_cache.write().await;
            *cache = Some(CachedToken {
                token: token.clone(),
                expires_at: Instant::now() + TOKEN_CACHE_DURATION,
            });
        }

        tracing::debug!("refreshed GCP access token");
        Ok(token)
    }
}

#[cfg(not(feature = "gcp-sdk"))]
#[async_trait]
impl TokenProvider for GcpTokenProvider {
    async fn token(&self) -> Result<String, AuthError> {
        match &self.credentials {
            GcpCredentials::Static { token } => Ok(token.clone()),
            GcpCredentials::Default => Err(AuthError::FeatureDisabled("default")),
            GcpCredentials::ServiceAccount { .. } => {
                Err(AuthError::FeatureDisabled("service_account"))
            }
            GcpCredentials::ServiceAccountJson { .. } => {
                Err(AuthError::FeatureDisabled("service_account_json"))
            }
        }
    }
}

#[cfg(feature = "gcp-sdk")]
async fn token_from_service_account_json(json: &str) -> Result<String, AuthError> {
    use google_cloud_auth::credentials::CredentialsFile;

    let creds: CredentialsFile =
        serde_json::from_str(json).map_err(|e| AuthError::InvalidKey(e.to_string()))?;

    let config =
        google_cloud_auth::project::Config::default().with_scopes(&[CLOUD_PLATFORM_SCOPE]);

    let ts = google_cloud_auth::token::DefaultTokenSourceProvider::new_with_credentials(
        config,
        Box::new(creds),
    )
    .await
    .map_err(|e| {
        AuthError::Token(format!(
            "failed to create token source from service account: {e}"
        ))
    })?;

    fetch_token(&ts).await
}

#[cfg(feature = "gcp-sdk")]
async fn fetch_token(
    provider: &google_cloud_auth::token::DefaultTokenSourceProvider,
) -> Result<String, AuthError> {
    use google_cloud_token::TokenSourceProvider;

    let token = provider
        .token_source()
        .token()
        .await
        .map_err(|e| AuthError::Token(e.to_string()))?;
    Ok(strip_bearer(&token).to_string())
}

/// Token sources may hand back a ready-made `Authorization` value.
fn strip_bearer(token: &str) -> &str {
    token.strip_prefix("Bearer ").unwrap_or(token)
}

/// Attach `Authorization: Bearer <token>` to a request.
pub fn with_bearer(req: reqwest::RequestBuilder, token: &str) -> reqwest::RequestBuilder {
    req.header("Authorization", format!("Bearer {}", strip_bearer(token)))
}

/// Google API error envelope: `{"error": {"code", "message", "status"}}`.
#[derive(serde::Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(serde::Deserialize)]
struct ApiErrorDetail {
    message: String,
    #[serde(default)]
    status: Option<String>,
}

/// Human-readable message from a Google API error response body.
pub fn api_error_message(body: &str) -> String {
    match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(ApiErrorBody {
            error: ApiErrorDetail {
                message,
                status: Some(status),
            },
        }) => format!("{status}: {message}"),
        Ok(parsed) => parsed.error.message,
        Err(_) => body.chars().take(512).collect(),
    }
}
