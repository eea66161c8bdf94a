//! Access-token acquisition for relay dials.
//!
//! The tunnel calls its [`TokenSource`] exactly once per dial (connect and
//! reconnect alike); refresh policy belongs to the source.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::CredentialsError;

const TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";
/// Refresh this long before the token actually expires.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Yields a short-lived bearer token on demand.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn access_token(&self) -> Result<String, CredentialsError>;
}

/// Fixed token, for tests and callers that refresh out of band.
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
    async fn access_token(&self) -> Result<String, CredentialsError> {
        Ok(self.token.clone())
    }
}

/// Shape of a Google credentials JSON file. Only the fields the refresh
/// grant needs are modeled.
#[derive(Debug, Deserialize)]
struct CredentialsFile {
    #[serde(rename = "type")]
    kind: String,
    client_id: Option<String>,
    client_secret: Option<String>,
    refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// Application-default-credentials token source: refreshes OAuth2 access
/// tokens from an `authorized_user` credentials file.
pub struct AdcTokenSource {
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
    refresh_token: String,
    cached: Mutex<Option<CachedToken>>,
}

impl AdcTokenSource {
    /// Load credentials from an explicit file, `GOOGLE_APPLICATION_CREDENTIALS`,
    /// or the gcloud ADC well-known path, in that order.
    pub fn discover(explicit: Option<&Path>) -> Result<Self, CredentialsError> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => default_credentials_path().ok_or(CredentialsError::NotFound)?,
        };
        Self::from_file(&path)
    }

    pub fn from_file(path: &Path) -> Result<Self, CredentialsError> {
        let raw = std::fs::read(path).map_err(|source| CredentialsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let file: CredentialsFile =
            serde_json::from_slice(&raw).map_err(|source| CredentialsError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        if file.kind != "authorized_user" {
            return Err(CredentialsError::Unsupported(file.kind));
        }
        let missing = |field: &'static str| CredentialsError::Missing {
            path: path.to_path_buf(),
            field,
        };
        Ok(Self {
            http: reqwest::Client::new(),
            client_id: file.client_id.ok_or_else(|| missing("client_id"))?,
            client_secret: file.client_secret.ok_or_else(|| missing("client_secret"))?,
            refresh_token: file.refresh_token.ok_or_else(|| missing("refresh_token"))?,
            cached: Mutex::new(None),
        })
    }

    async fn refresh(&self) -> Result<CachedToken, CredentialsError> {
        let params = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("refresh_token", self.refresh_token.as_str()),
            ("grant_type", "refresh_token"),
        ];
        let response = self.http.post(TOKEN_ENDPOINT).form(&params).send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(CredentialsError::TokenEndpoint { status, body });
        }
        let token: TokenResponse = response.json().await?;
        debug!(expires_in = token.expires_in, "access token refreshed");
        let ttl = Duration::from_secs(token.expires_in).saturating_sub(EXPIRY_MARGIN);
        Ok(CachedToken {
            token: token.access_token,
            expires_at: Instant::now() + ttl,
        })
    }
}

#[async_trait]
impl TokenSource for AdcTokenSource {
    async fn access_token(&self) -> Result<String, CredentialsError> {
        // Lock across the refresh so concurrent dials do not stampede the
        // token endpoint.
        let mut cached = self.cached.lock().await;
        if let Some(entry) = cached.as_ref() {
            if entry.expires_at > Instant::now() {
                return Ok(entry.token.clone());
            }
        }
        let fresh = self.refresh().await?;
        let token = fresh.token.clone();
        *cached = Some(fresh);
        Ok(token)
    }
}

fn default_credentials_path() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os("GOOGLE_APPLICATION_CREDENTIALS") {
        return Some(PathBuf::from(path));
    }
    std::env::var_os("HOME").map(|home| {
        Path::new(&home).join(".config/gcloud/application_default_credentials.json")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_temp(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn parses_authorized_user_file() {
        let path = write_temp(
            "iap-tunnel-test-adc.json",
            r#"{
                "type": "authorized_user",
                "client_id": "cid",
                "client_secret": "secret",
                "refresh_token": "rt"
            }"#,
        );
        let source = AdcTokenSource::from_file(&path).unwrap();
        assert_eq!(source.client_id, "cid");
        assert_eq!(source.refresh_token, "rt");
    }

    #[test]
    fn rejects_service_account_files() {
        let path = write_temp(
            "iap-tunnel-test-sa.json",
            r#"{"type": "service_account", "project_id": "p"}"#,
        );
        match AdcTokenSource::from_file(&path).err() {
            Some(CredentialsError::Unsupported(kind)) => assert_eq!(kind, "service_account"),
            other => panic!("expected unsupported-type error, got {other:?}"),
        }
    }

    #[test]
    fn reports_missing_fields() {
        let path = write_temp(
            "iap-tunnel-test-missing.json",
            r#"{"type": "authorized_user", "client_id": "cid"}"#,
        );
        assert!(matches!(
            AdcTokenSource::from_file(&path),
            Err(CredentialsError::Missing {
                field: "client_secret",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn static_source_yields_its_token() {
        let source = StaticTokenSource::new("tok");
        assert_eq!(source.access_token().await.unwrap(), "tok");
    }
}
