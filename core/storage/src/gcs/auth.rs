//! Ambient credential discovery and access token management for GCS.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use oauth2::basic::BasicClient;
use oauth2::{
    AuthType, ClientId, ClientSecret, EndpointNotSet, EndpointSet, RefreshToken, TokenResponse,
    TokenUrl,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use stashbox_common::{Error, Result};

/// OAuth2 token endpoint.
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
/// Metadata server host on Compute Engine, GKE and Cloud Run.
const DEFAULT_METADATA_HOST: &str = "metadata.google.internal";
/// Path of the default service account token on the metadata server.
const METADATA_TOKEN_PATH: &str = "/computeMetadata/v1/instance/service-accounts/default/token";
/// OAuth2 grant type for signed service account assertions.
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
/// Scope requested for service account tokens.
pub const STORAGE_SCOPE: &str = "https://www.googleapis.com/auth/devstorage.read_write";
/// Lifetime of a signed assertion; Google caps it at one hour.
const ASSERTION_LIFETIME_SECS: i64 = 3600;

/// Environment variable naming a credentials file.
pub const CREDENTIALS_ENV: &str = "GOOGLE_APPLICATION_CREDENTIALS";
/// Environment variable overriding the metadata server host.
pub const METADATA_HOST_ENV: &str = "GCE_METADATA_HOST";

type GoogleOAuthClient =
    BasicClient<EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

/// User credentials as written by `gcloud auth application-default login`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AuthorizedUser {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    #[serde(default)]
    pub quota_project_id: Option<String>,
}

impl fmt::Debug for AuthorizedUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorizedUser")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("quota_project_id", &self.quota_project_id)
            .finish()
    }
}

fn default_token_uri() -> String {
    GOOGLE_TOKEN_URL.to_string()
}

/// Service account key file as downloaded from the cloud console.
#[derive(Clone, Serialize, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    /// PEM encoded RSA private key.
    pub private_key: String,
    #[serde(default)]
    pub private_key_id: Option<String>,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    #[serde(default)]
    pub project_id: Option<String>,
}

impl fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("client_email", &self.client_email)
            .field("private_key", &"[REDACTED]")
            .field("private_key_id", &self.private_key_id)
            .field("token_uri", &self.token_uri)
            .field("project_id", &self.project_id)
            .finish()
    }
}

/// Claims of the JWT-bearer assertion exchanged for an access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssertionClaims {
    pub iss: String,
    pub scope: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
}

impl ServiceAccountKey {
    /// Sign a fresh RS256 assertion for the token endpoint.
    fn assertion(&self, signing_key: &EncodingKey) -> Result<String> {
        let now = Utc::now().timestamp();
        let claims = AssertionClaims {
            iss: self.client_email.clone(),
            scope: STORAGE_SCOPE.to_string(),
            aud: self.token_uri.clone(),
            iat: now,
            exp: now + ASSERTION_LIFETIME_SECS,
        };

        let mut header = Header::new(Algorithm::RS256);
        header.kid = self.private_key_id.clone();

        jsonwebtoken::encode(&header, &claims, signing_key)
            .map_err(|e| Error::Authentication(format!("Failed to sign assertion: {}", e)))
    }
}

/// Source of access tokens for GCS requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credentials {
    /// No authorization header (emulators, public buckets).
    Anonymous,
    /// OAuth2 refresh token flow.
    AuthorizedUser(AuthorizedUser),
    /// Signed JWT-bearer assertion flow.
    ServiceAccount(ServiceAccountKey),
    /// Token endpoint of the instance metadata server.
    MetadataServer { host: String },
}

impl Credentials {
    /// Discover credentials from the environment.
    ///
    /// Order: the file named by `GOOGLE_APPLICATION_CREDENTIALS`, the gcloud
    /// well-known file, then the metadata server. The metadata server is not
    /// contacted until the first token is needed.
    ///
    /// # Errors
    /// - Credentials file unreadable, malformed, or of an unsupported type
    pub fn discover() -> Result<Self> {
        if let Ok(path) = std::env::var(CREDENTIALS_ENV) {
            return Self::from_file(path);
        }

        if let Some(path) = well_known_file() {
            if path.is_file() {
                return Self::from_file(path);
            }
        }

        let host =
            std::env::var(METADATA_HOST_ENV).unwrap_or_else(|_| DEFAULT_METADATA_HOST.to_string());
        Ok(Credentials::MetadataServer { host })
    }

    /// Load credentials from a JSON credentials file.
    ///
    /// # Errors
    /// - File unreadable or not JSON
    /// - Credential type other than `authorized_user` or `service_account`
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!(
                "Failed to read credentials file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_json(&content)
    }

    /// Parse the contents of a credentials file.
    pub fn from_json(content: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(content)
            .map_err(|e| Error::Configuration(format!("Invalid credentials file: {}", e)))?;

        match value.get("type").and_then(|t| t.as_str()) {
            Some("authorized_user") => {
                let user: AuthorizedUser = serde_json::from_value(value).map_err(|e| {
                    Error::Configuration(format!("Invalid authorized_user credentials: {}", e))
                })?;
                Ok(Credentials::AuthorizedUser(user))
            }
            Some("service_account") => {
                let key: ServiceAccountKey = serde_json::from_value(value).map_err(|e| {
                    Error::Configuration(format!("Invalid service_account credentials: {}", e))
                })?;
                Ok(Credentials::ServiceAccount(key))
            }
            Some(other) => Err(Error::Configuration(format!(
                "Unsupported credential type '{}'",
                other
            ))),
            None => Err(Error::Configuration(
                "Credentials file has no 'type' field".to_string(),
            )),
        }
    }
}

/// Location of the credentials file written by gcloud.
fn well_known_file() -> Option<PathBuf> {
    let dir = if cfg!(windows) {
        dirs::config_dir()?
    } else {
        dirs::home_dir()?.join(".config")
    };
    Some(dir.join("gcloud").join("application_default_credentials.json"))
}

/// An access token with expiration tracking.
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub secret: String,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    /// Check if the token is expired or about to expire.
    pub fn is_expired(&self) -> bool {
        // Consider expired if less than 5 minutes remaining
        self.expires_at < Utc::now() + Duration::minutes(5)
    }

    fn expiring_in(secret: String, expires_in: std::time::Duration) -> Self {
        let expires_in = Duration::from_std(expires_in).unwrap_or_else(|_| Duration::hours(1));
        Self {
            secret,
            expires_at: Utc::now() + expires_in,
        }
    }
}

/// Token response of the metadata server and the JWT-bearer exchange.
#[derive(Debug, Deserialize)]
struct BearerToken {
    access_token: String,
    expires_in: u64,
}

enum TokenSource {
    Anonymous,
    OAuth {
        client: GoogleOAuthClient,
        http: oauth2::reqwest::Client,
        refresh_token: RefreshToken,
    },
    ServiceAccount {
        http: reqwest::Client,
        key: ServiceAccountKey,
        signing_key: EncodingKey,
    },
    Metadata {
        http: reqwest::Client,
        url: String,
    },
}

/// Token manager that fetches and caches access tokens.
pub struct TokenManager {
    source: TokenSource,
    token: tokio::sync::RwLock<Option<AccessToken>>,
}

impl TokenManager {
    /// Create a token manager for the given credentials.
    ///
    /// No network request is made until the first token is needed.
    ///
    /// # Errors
    /// - Service account private key is not a valid RSA PEM
    pub fn new(credentials: Credentials, http: reqwest::Client) -> Result<Self> {
        let source = match credentials {
            Credentials::Anonymous => TokenSource::Anonymous,
            Credentials::AuthorizedUser(user) => {
                let token_url = TokenUrl::new(GOOGLE_TOKEN_URL.to_string())
                    .map_err(|e| Error::Configuration(format!("Invalid token URL: {}", e)))?;
                let client = BasicClient::new(ClientId::new(user.client_id))
                    .set_client_secret(ClientSecret::new(user.client_secret))
                    .set_auth_type(AuthType::RequestBody)
                    .set_token_uri(token_url);
                let http = oauth2::reqwest::ClientBuilder::new()
                    .redirect(oauth2::reqwest::redirect::Policy::none())
                    .build()
                    .map_err(|e| {
                        Error::Configuration(format!("Failed to create OAuth2 client: {}", e))
                    })?;
                TokenSource::OAuth {
                    client,
                    http,
                    refresh_token: RefreshToken::new(user.refresh_token),
                }
            }
            Credentials::ServiceAccount(key) => {
                let signing_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
                    .map_err(|e| {
                        Error::Configuration(format!("Invalid service account key: {}", e))
                    })?;
                TokenSource::ServiceAccount {
                    http,
                    key,
                    signing_key,
                }
            }
            Credentials::MetadataServer { host } => TokenSource::Metadata {
                http,
                url: format!("http://{}{}", host, METADATA_TOKEN_PATH),
            },
        };

        Ok(Self {
            source,
            token: tokio::sync::RwLock::new(None),
        })
    }

    /// Whether requests go out without an authorization header.
    pub fn is_anonymous(&self) -> bool {
        matches!(self.source, TokenSource::Anonymous)
    }

    /// Get a valid access token, fetching a new one if necessary.
    ///
    /// Returns `None` for anonymous credentials.
    ///
    /// # Errors
    /// - Token refresh failed
    pub async fn get_access_token(&self) -> Result<Option<String>> {
        if self.is_anonymous() {
            return Ok(None);
        }

        let token = self.token.read().await;
        if let Some(token) = token.as_ref().filter(|t| !t.is_expired()) {
            return Ok(Some(token.secret.clone()));
        }
        drop(token);

        let mut token = self.token.write().await;

        // Double-check after acquiring write lock
        if let Some(token) = token.as_ref().filter(|t| !t.is_expired()) {
            return Ok(Some(token.secret.clone()));
        }

        tracing::info!("Fetching GCS access token");
        let fresh = self.fetch().await?;
        let secret = fresh.secret.clone();
        *token = Some(fresh);

        Ok(Some(secret))
    }

    async fn fetch(&self) -> Result<AccessToken> {
        match &self.source {
            TokenSource::Anonymous => Err(Error::Authentication(
                "Anonymous credentials have no token".to_string(),
            )),
            TokenSource::OAuth {
                client,
                http,
                refresh_token,
            } => {
                let response = client
                    .exchange_refresh_token(refresh_token)
                    .request_async(http)
                    .await
                    .map_err(|e| Error::Authentication(format!("Token refresh failed: {}", e)))?;

                let expires_in = response
                    .expires_in()
                    .unwrap_or_else(|| std::time::Duration::from_secs(3600));
                Ok(AccessToken::expiring_in(
                    response.access_token().secret().clone(),
                    expires_in,
                ))
            }
            TokenSource::ServiceAccount {
                http,
                key,
                signing_key,
            } => {
                let assertion = key.assertion(signing_key)?;
                let response = http
                    .post(&key.token_uri)
                    .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
                    .send()
                    .await
                    .map_err(|e| {
                        Error::Authentication(format!("Token endpoint unreachable: {}", e))
                    })?;

                let status = response.status();
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return Err(Error::Authentication(format!(
                        "Token exchange for {} failed: {} - {}",
                        key.client_email, status, body
                    )));
                }

                let token: BearerToken = response.json().await.map_err(|e| {
                    Error::Authentication(format!("Invalid token response: {}", e))
                })?;
                Ok(AccessToken::expiring_in(
                    token.access_token,
                    std::time::Duration::from_secs(token.expires_in),
                ))
            }
            TokenSource::Metadata { http, url } => {
                let response = http
                    .get(url)
                    .header("Metadata-Flavor", "Google")
                    .send()
                    .await
                    .map_err(|e| {
                        Error::Authentication(format!("Metadata server unreachable: {}", e))
                    })?;

                if !response.status().is_success() {
                    return Err(Error::Authentication(format!(
                        "Metadata server returned {}",
                        response.status()
                    )));
                }

                let token: BearerToken = response.json().await.map_err(|e| {
                    Error::Authentication(format!("Invalid metadata token response: {}", e))
                })?;
                Ok(AccessToken::expiring_in(
                    token.access_token,
                    std::time::Duration::from_secs(token.expires_in),
                ))
            }
        }
    }
}
