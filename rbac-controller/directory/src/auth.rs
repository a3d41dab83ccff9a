use crate::Error;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use openssl::{
    hash::MessageDigest,
    pkey::{PKey, Private},
    sign::Signer,
};
use parking_lot::RwLock;
use serde::Deserialize;
use std::{fmt, path::Path};
use tokio::{
    sync::Mutex,
    time::{Duration, Instant},
};
use tracing::{debug, instrument};

/// Read-only access to group membership.
pub const MEMBER_READONLY_SCOPE: &str =
    "https://www.googleapis.com/auth/admin.directory.group.member.readonly";

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

// Assertions are valid for the maximum hour the token endpoint accepts.
const ASSERTION_LIFETIME_SECS: i64 = 3600;

// Tokens are refreshed this long before they expire.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// A service account's private key, as downloaded in JSON form.
#[derive(Clone)]
pub struct ServiceAccountKey {
    client_email: String,
    token_uri: String,
    key: PKey<Private>,
}

/// Mints and caches access tokens for a service account acting on behalf of
/// a directory administrator.
pub struct TokenSource {
    key: ServiceAccountKey,
    subject: String,
    scope: String,
    http: reqwest::Client,
    cached: RwLock<Option<AccessToken>>,
    refresh: Mutex<()>,
}

#[derive(Clone)]
struct AccessToken {
    value: String,
    expires_at: Instant,
}

#[derive(Deserialize)]
struct KeyFile {
    client_email: String,
    private_key: String,
    token_uri: Option<String>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

// === impl ServiceAccountKey ===

impl ServiceAccountKey {
    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let json = std::fs::read(path).map_err(|source| Error::ReadKey {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }

    pub fn from_json(json: &[u8]) -> Result<Self, Error> {
        let KeyFile {
            client_email,
            private_key,
            token_uri,
        } = serde_json::from_slice(json).map_err(|e| Error::InvalidKey(e.to_string()))?;
        let key = PKey::private_key_from_pem(private_key.as_bytes())
            .map_err(|e| Error::InvalidKey(e.to_string()))?;
        Ok(Self {
            client_email,
            token_uri: token_uri.unwrap_or_else(|| DEFAULT_TOKEN_URI.to_string()),
            key,
        })
    }

    pub fn client_email(&self) -> &str {
        &self.client_email
    }

    /// Builds a signed JWT asserting `subject`'s delegated identity.
    fn assertion(&self, subject: &str, scope: &str, issued_at: i64) -> Result<String, Error> {
        let header = serde_json::json!({ "alg": "RS256", "typ": "JWT" });
        let claims = serde_json::json!({
            "iss": self.client_email,
            "sub": subject,
            "scope": scope,
            "aud": self.token_uri,
            "iat": issued_at,
            "exp": issued_at + ASSERTION_LIFETIME_SECS,
        });
        let message = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(header.to_string()),
            URL_SAFE_NO_PAD.encode(claims.to_string()),
        );

        let mut signer = Signer::new(MessageDigest::sha256(), &self.key)?;
        signer.update(message.as_bytes())?;
        let signature = signer.sign_to_vec()?;
        Ok(format!("{}.{}", message, URL_SAFE_NO_PAD.encode(signature)))
    }
}

impl fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("client_email", &self.client_email)
            .field("token_uri", &self.token_uri)
            .finish_non_exhaustive()
    }
}

// === impl TokenSource ===

impl TokenSource {
    pub fn new(key: ServiceAccountKey, subject: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            key,
            subject: subject.into(),
            scope: MEMBER_READONLY_SCOPE.to_string(),
            http,
            cached: RwLock::new(None),
            refresh: Mutex::new(()),
        }
    }

    /// Returns a bearer token, exchanging a fresh assertion if the cached
    /// token is missing or about to expire.
    ///
    /// Concurrent callers share a single exchange.
    pub async fn token(&self) -> Result<String, Error> {
        if let Some(value) = self.fresh() {
            return Ok(value);
        }

        let _refreshing = self.refresh.lock().await;
        // Another caller may have refreshed while we waited.
        if let Some(value) = self.fresh() {
            return Ok(value);
        }

        let token = self.exchange().await?;
        let value = token.value.clone();
        *self.cached.write() = Some(token);
        Ok(value)
    }

    fn fresh(&self) -> Option<String> {
        self.cached
            .read()
            .as_ref()
            .filter(|token| token.expires_at > Instant::now() + EXPIRY_MARGIN)
            .map(|token| token.value.clone())
    }

    #[instrument(skip(self), fields(client = %self.key.client_email, subject = %self.subject))]
    async fn exchange(&self) -> Result<AccessToken, Error> {
        let assertion = self
            .key
            .assertion(&self.subject, &self.scope, chrono::Utc::now().timestamp())?;
        let rsp = self
            .http
            .post(&self.key.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await?;

        let status = rsp.status();
        if status.is_client_error() {
            let body = rsp.text().await.unwrap_or_default();
            return Err(Error::Unauthorized { status, body });
        }
        if !status.is_success() {
            let body = rsp.text().await.unwrap_or_default();
            return Err(Error::TokenStatus { status, body });
        }

        let TokenResponse {
            access_token,
            expires_in,
        } = rsp.json().await?;
        debug!(expires_in, "Obtained access token");
        Ok(AccessToken {
            value: access_token,
            expires_at: Instant::now() + Duration::from_secs(expires_in),
        })
    }
}

impl fmt::Debug for TokenSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSource")
            .field("key", &self.key)
            .field("subject", &self.subject)
            .finish_non_exhaustive()
    }
}
