//! OAuth access tokens for the Google REST APIs.

use super::{CloudError, CloudResult};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::debug;

const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Refresh this long before the reported expiry
const EXPIRY_MARGIN_SECONDS: i64 = 60;

#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn access_token(&self) -> CloudResult<String>;
}

/// Fixed token, for local development against real services
#[derive(Debug, Clone)]
pub struct StaticTokenSource {
    token: String,
}

impl StaticTokenSource {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn access_token(&self) -> CloudResult<String> {
        Ok(self.token.clone())
    }
}

#[derive(Debug, Deserialize)]
struct MetadataToken {
    access_token: String,
    expires_in: i64,
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

/// Default service account token from the platform metadata server
#[derive(Debug)]
pub struct MetadataServerTokenSource {
    client: reqwest::Client,
    cached: Mutex<Option<CachedToken>>,
}

impl MetadataServerTokenSource {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            cached: Mutex::new(None),
        }
    }

    fn cached_token(&self) -> Option<String> {
        let cached = self.cached.lock();
        cached
            .as_ref()
            .filter(|token| token.expires_at > Utc::now())
            .map(|token| token.token.clone())
    }
}

#[async_trait]
impl TokenSource for MetadataServerTokenSource {
    async fn access_token(&self) -> CloudResult<String> {
        if let Some(token) = self.cached_token() {
            return Ok(token);
        }

        debug!(url = %METADATA_TOKEN_URL, "Requesting access token from metadata server");
        let response = self
            .client
            .get(METADATA_TOKEN_URL)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| CloudError::Authentication(e.to_string()))?;

        if !response.status().is_success() {
            return Err(CloudError::Authentication(format!(
                "metadata server returned HTTP {}",
                response.status()
            )));
        }

        let token: MetadataToken = response
            .json()
            .await
            .map_err(|e| CloudError::Authentication(e.to_string()))?;

        let expires_at =
            Utc::now() + Duration::seconds(token.expires_in.saturating_sub(EXPIRY_MARGIN_SECONDS));
        *self.cached.lock() = Some(CachedToken {
            token: token.access_token.clone(),
            expires_at,
        });

        Ok(token.access_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_token_source() {
        let source = StaticTokenSource::new("ya29.local");
        assert_eq!(source.access_token().await.unwrap(), "ya29.local");
    }

    #[test]
    fn test_expired_cache_is_ignored() {
        let source = MetadataServerTokenSource::new(reqwest::Client::new());
        *source.cached.lock() = Some(CachedToken {
            token: "stale".to_string(),
            expires_at: Utc::now() - Duration::seconds(1),
        });
        assert_eq!(source.cached_token(), None);

        *source.cached.lock() = Some(CachedToken {
            token: "fresh".to_string(),
            expires_at: Utc::now() + Duration::seconds(300),
        });
        assert_eq!(source.cached_token().as_deref(), Some("fresh"));
    }
}
