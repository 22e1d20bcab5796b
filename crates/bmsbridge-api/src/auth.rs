// Auth API client
//
// Form-encoded login and refresh against `/v1/login` and `/v1/token`, plus
// the Pusher private-channel authorizer at `/v1/pusher/auth`, which signs a
// subscription for a given socket using the caller's bearer token.

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use crate::error::Error;
use crate::transport::TransportConfig;

const LOGIN_PATH: &str = "v1/login";
const REFRESH_PATH: &str = "v1/token";
const CHANNEL_AUTH_PATH: &str = "v1/pusher/auth";

/// Token grant returned by both the login and the refresh endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Lifetime of `access_token` in seconds.
    pub expires_in: u64,
    #[serde(default = "default_token_type")]
    pub token_type: String,
}

fn default_token_type() -> String {
    "Bearer".into()
}

/// Signature for a private-channel subscription.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChannelAuthorization {
    pub auth: String,
    #[serde(default)]
    pub channel_data: Option<String>,
}

/// HTTP client for the auth endpoints.
///
/// Cheap to clone the inner `reqwest::Client`; share one instance between
/// the session manager and the Pusher channel authorizer.
#[derive(Debug, Clone)]
pub struct AuthClient {
    http: reqwest::Client,
    base_url: Url,
}

impl AuthClient {
    /// Create a client from a `TransportConfig`.
    ///
    /// `base_url` may carry a path prefix (`https://host/api`); endpoint
    /// paths are resolved relative to it.
    pub fn new(base_url: Url, transport: &TransportConfig) -> Result<Self, Error> {
        let http = transport.build_client()?;
        Ok(Self::with_client(http, base_url))
    }

    /// Create a client around a pre-built `reqwest::Client`.
    pub fn with_client(http: reqwest::Client, mut base_url: Url) -> Self {
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Self { http, base_url }
    }

    /// The API base URL, always ending in `/`.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Log in with email and password.
    pub async fn login(&self, email: &str, password: &SecretString) -> Result<TokenResponse, Error> {
        let url = self.base_url.join(LOGIN_PATH)?;
        debug!("logging in at {}", url);

        let resp = self
            .http
            .post(url)
            .form(&[("email", email), ("password", password.expose_secret())])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Authentication {
                message: format!("login failed (HTTP {status}): {body}"),
                status: Some(status.as_u16()),
            });
        }

        debug!("login successful");
        parse_json(resp).await
    }

    /// Exchange a refresh token for a fresh grant.
    pub async fn refresh(&self, refresh_token: &SecretString) -> Result<TokenResponse, Error> {
        let url = self.base_url.join(REFRESH_PATH)?;
        debug!("refreshing token at {}", url);

        let resp = self
            .http
            .post(url)
            .form(&[("refresh_token", refresh_token.expose_secret())])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Authentication {
                message: format!("token refresh failed (HTTP {status}): {body}"),
                status: Some(status.as_u16()),
            });
        }

        parse_json(resp).await
    }

    /// Sign a private-channel subscription for `socket_id`.
    pub async fn authorize_channel(
        &self,
        token: &SecretString,
        socket_id: &str,
        channel: &str,
    ) -> Result<ChannelAuthorization, Error> {
        let url = self.base_url.join(CHANNEL_AUTH_PATH)?;
        debug!(channel, "authorizing channel subscription");

        let resp = self
            .http
            .post(url)
            .bearer_auth(token.expose_secret())
            .form(&[("socket_id", socket_id), ("channel_name", channel)])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::ChannelAuthorization {
                channel: channel.to_owned(),
                status: status.as_u16(),
                message: body,
            });
        }

        parse_json(resp).await
    }
}

async fn parse_json<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, Error> {
    let body = resp.text().await?;
    serde_json::from_str(&body).map_err(|e| Error::Deserialization {
        message: e.to_string(),
        body,
    })
}
