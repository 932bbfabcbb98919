//! HTTP client for the certificate and token endpoints

use super::types::{
    ApiEnvironment, ApiError, AuthCredentials, CertificateRequestParams, TokenRefreshParams,
    TokenRefreshResponse, VpnCertificate,
};
use crate::features::ConnectionFeatures;
use crate::storage::SessionStorage;
use log::{debug, error, info, warn};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use std::sync::Arc;

/// Client for the VPN backend. Safe to share; all state lives in the injected
/// storage so the app and the extension observe the same session.
pub struct ApiClient {
    client: Client,
    env: ApiEnvironment,
    storage: Arc<dyn SessionStorage>,
}

impl ApiClient {
    pub fn new(env: ApiEnvironment, storage: Arc<dyn SessionStorage>) -> Self {
        let client = Client::builder()
            .user_agent(env.user_agent.clone())
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            env,
            storage,
        }
    }

    pub fn environment(&self) -> &ApiEnvironment {
        &self.env
    }

    pub fn storage(&self) -> &Arc<dyn SessionStorage> {
        &self.storage
    }

    /// Request a fresh certificate for the given device public key.
    ///
    /// A 401 triggers one token refresh followed by one retried certificate
    /// call; a second 401 is a hard [`ApiError::TokenRefresh`]. All other
    /// error statuses map directly without retrying.
    pub async fn refresh_certificate(
        &self,
        public_key: &str,
        features: Option<ConnectionFeatures>,
    ) -> Result<VpnCertificate, ApiError> {
        let mut refresh_api_token_if_needed = true;

        loop {
            let credentials = self
                .storage
                .fetch_credentials()
                .ok_or(ApiError::NoCredentials)?;

            let url = format!("{}/vpn/v1/certificate", self.env.base_url);
            let params = CertificateRequestParams::session(public_key, &self.env, features.clone());

            debug!("Requesting certificate for device {}", self.env.device_name);

            let response = self
                .authorized_request(Method::POST, &url, &credentials)
                .json(&params)
                .send()
                .await
                .map_err(|e| ApiError::Request(e.to_string()))?;

            let status = response.status();
            if status.is_success() {
                let body = response.text().await.map_err(|_| ApiError::NoData)?;
                if body.is_empty() {
                    return Err(ApiError::NoData);
                }
                let certificate: VpnCertificate = serde_json::from_str(&body)
                    .map_err(|e| ApiError::Parse(format!("certificate response: {}", e)))?;
                info!(
                    "Received certificate valid until {}",
                    certificate.valid_until
                );
                return Ok(certificate);
            }

            match status {
                StatusCode::UNAUTHORIZED if refresh_api_token_if_needed => {
                    info!("Certificate request returned 401, refreshing API token");
                    let refreshed = self.refresh_api_token(&credentials).await?;
                    self.storage
                        .store_credentials(&refreshed)
                        .map_err(|e| ApiError::Request(e.to_string()))?;
                    refresh_api_token_if_needed = false;
                }
                StatusCode::UNAUTHORIZED => {
                    error!("Certificate request rejected again after token refresh");
                    return Err(ApiError::TokenRefresh(None));
                }
                StatusCode::UNPROCESSABLE_ENTITY => {
                    warn!("API session expired or missing");
                    return Err(ApiError::SessionExpired);
                }
                StatusCode::TOO_MANY_REQUESTS => {
                    let retry_after = parse_retry_after(response.headers());
                    warn!(
                        "Certificate requests throttled, retry after {:?}s",
                        retry_after
                    );
                    return Err(ApiError::TooManyRequests { retry_after });
                }
                _ => {
                    let body = response.text().await.unwrap_or_default();
                    error!("Certificate request failed: {} - {}", status, body);
                    return Err(ApiError::Request(format!("{} - {}", status, body)));
                }
            }
        }
    }

    /// Rotate the access token using the stored refresh token. Replacement
    /// credentials are returned, not stored; the caller decides.
    async fn refresh_api_token(
        &self,
        credentials: &AuthCredentials,
    ) -> Result<AuthCredentials, ApiError> {
        let url = format!("{}/auth/refresh", self.env.base_url);
        let params = TokenRefreshParams::for_token(&credentials.refresh_token);

        debug!("Refreshing API token for session {}", credentials.session_id);

        // The refresh endpoint authenticates by session id + refresh token,
        // not by the (possibly expired) access token.
        let response = self
            .base_request(Method::POST, &url)
            .header("x-pm-uid", &credentials.session_id)
            .json(&params)
            .send()
            .await
            .map_err(|e| ApiError::TokenRefresh(Some(e.to_string())))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!("API token refresh failed: {} - {}", status, body);
            return Err(ApiError::TokenRefresh(Some(format!(
                "{} - {}",
                status, body
            ))));
        }

        let tokens: TokenRefreshResponse = response.json().await.map_err(|e| {
            ApiError::TokenRefresh(Some(format!("failed to parse refresh response: {}", e)))
        })?;

        info!("API token refreshed");
        Ok(credentials.updated_with_tokens(&tokens))
    }

    fn base_request(&self, method: Method, url: &str) -> RequestBuilder {
        self.client
            .request(method, url)
            .header("x-pm-appversion", &self.env.app_version)
            .header("x-pm-apiversion", "3")
            .header("Content-Type", "application/json")
            .header("Accept", "application/vnd.protonmail.v1+json")
    }

    fn authorized_request(
        &self,
        method: Method,
        url: &str,
        credentials: &AuthCredentials,
    ) -> RequestBuilder {
        self.base_request(method, url)
            .header(
                "Authorization",
                format!("Bearer {}", credentials.access_token),
            )
            .header("x-pm-uid", &credentials.session_id)
    }
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<i64> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}
