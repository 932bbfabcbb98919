//! API layer types
//!
//! Wire structures for the certificate and token refresh endpoints, the
//! persisted session records, and the API error taxonomy.

use crate::features::ConnectionFeatures;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// API error taxonomy surfaced to callers of the request layer.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("No API credentials available")]
    NoCredentials,

    #[error("Request error: {0}")]
    Request(String),

    #[error("No response data")]
    NoData,

    #[error("Failed to parse response: {0}")]
    Parse(String),

    #[error("API token refresh failed{}", .0.as_ref().map(|e| format!(": {}", e)).unwrap_or_default())]
    TokenRefresh(Option<String>),

    #[error("API session expired or missing")]
    SessionExpired,

    #[error("Too many certificate requests{}", .retry_after.map(|s| format!(", retry after {}s", s)).unwrap_or_default())]
    TooManyRequests { retry_after: Option<i64> },
}

/// Static app/environment info the request layer stamps onto every call.
/// Header assembly is a pure function of this record.
#[derive(Debug, Clone)]
pub struct ApiEnvironment {
    pub base_url: String,
    /// Goes out as `x-pm-appversion`.
    pub app_version: String,
    pub user_agent: String,
    /// Reported in certificate requests so sessions are attributable.
    pub device_name: String,
    /// Optional certificate lifetime request, e.g. "30 min" in debug builds.
    pub cert_duration: Option<String>,
}

impl Default for ApiEnvironment {
    fn default() -> Self {
        Self {
            base_url: "https://api.kestrelvpn.net".to_string(),
            app_version: format!("desktop-vpn_{}", env!("CARGO_PKG_VERSION")),
            user_agent: format!("KestrelVPN/{}", env!("CARGO_PKG_VERSION")),
            device_name: "unknown device".to_string(),
            cert_duration: None,
        }
    }
}

/// Authenticated API session. Owned by the session storage; a token refresh
/// replaces the whole record rather than mutating it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthCredentials {
    pub user_id: String,
    pub session_id: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl AuthCredentials {
    /// Check if the access token is expired
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Check if the access token expires within the next 5 minutes
    pub fn expires_soon(&self) -> bool {
        Utc::now() + Duration::minutes(5) >= self.expires_at
    }

    /// Replacement record carrying the tokens from an auth/refresh response.
    pub fn updated_with_tokens(&self, response: &TokenRefreshResponse) -> AuthCredentials {
        AuthCredentials {
            user_id: self.user_id.clone(),
            session_id: self.session_id.clone(),
            access_token: response.access_token.clone(),
            refresh_token: response.refresh_token.clone(),
            expires_at: Utc::now() + Duration::seconds(response.expires_in),
            scopes: self.scopes.clone(),
        }
    }
}

/// Body of `POST /vpn/v1/certificate`.
#[derive(Debug, Clone, Serialize)]
pub struct CertificateRequestParams {
    #[serde(rename = "ClientPublicKey")]
    pub client_public_key: String,
    #[serde(rename = "ClientPublicKeyMode")]
    pub client_public_key_mode: String,
    #[serde(rename = "DeviceName")]
    pub device_name: String,
    #[serde(rename = "Mode")]
    pub mode: String,
    #[serde(rename = "Duration", skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    #[serde(rename = "Features", skip_serializing_if = "Option::is_none")]
    pub features: Option<ConnectionFeatures>,
}

impl CertificateRequestParams {
    pub fn session(
        public_key: &str,
        env: &ApiEnvironment,
        features: Option<ConnectionFeatures>,
    ) -> Self {
        Self {
            client_public_key: public_key.to_string(),
            client_public_key_mode: "EC".to_string(),
            device_name: env.device_name.clone(),
            mode: "session".to_string(),
            duration: env.cert_duration.clone(),
            features,
        }
    }
}

/// Signed client certificate as returned by the backend.
#[derive(Debug, Clone, Deserialize)]
pub struct VpnCertificate {
    #[serde(rename = "Certificate")]
    pub certificate: String,
    #[serde(rename = "ExpirationTime", with = "chrono::serde::ts_seconds")]
    pub valid_until: DateTime<Utc>,
    #[serde(rename = "RefreshTime", with = "chrono::serde::ts_seconds")]
    pub refresh_time: DateTime<Utc>,
}

/// Certificate record as kept in session storage. Created from a refresh
/// response together with the features it was requested for; superseded, not
/// mutated, by the next refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCertificate {
    pub certificate: String,
    pub valid_until: DateTime<Utc>,
    pub refresh_time: DateTime<Utc>,
    #[serde(default)]
    pub features: Option<ConnectionFeatures>,
}

impl StoredCertificate {
    pub fn from_response(cert: &VpnCertificate, features: Option<ConnectionFeatures>) -> Self {
        Self {
            certificate: cert.certificate.clone(),
            valid_until: cert.valid_until,
            refresh_time: cert.refresh_time,
            features,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.valid_until
    }
}

/// Body of `POST /auth/refresh`.
#[derive(Debug, Clone, Serialize)]
pub struct TokenRefreshParams {
    #[serde(rename = "ResponseType")]
    pub response_type: String,
    #[serde(rename = "GrantType")]
    pub grant_type: String,
    #[serde(rename = "RefreshToken")]
    pub refresh_token: String,
    #[serde(rename = "RedirectURI")]
    pub redirect_uri: String,
}

impl TokenRefreshParams {
    pub fn for_token(refresh_token: &str) -> Self {
        Self {
            response_type: "token".to_string(),
            grant_type: "refresh_token".to_string(),
            refresh_token: refresh_token.to_string(),
            redirect_uri: "http://kestrelvpn.net".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenRefreshResponse {
    #[serde(rename = "AccessToken")]
    pub access_token: String,
    #[serde(rename = "RefreshToken")]
    pub refresh_token: String,
    #[serde(rename = "ExpiresIn")]
    pub expires_in: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_credentials(expires_at: DateTime<Utc>) -> AuthCredentials {
        AuthCredentials {
            user_id: "user-1".to_string(),
            session_id: "session-abc".to_string(),
            access_token: "access-token".to_string(),
            refresh_token: "refresh-token".to_string(),
            expires_at,
            scopes: vec!["vpn".to_string()],
        }
    }

    #[test]
    fn test_credentials_expiry_helpers() {
        let expired = make_credentials(Utc::now() - Duration::minutes(1));
        assert!(expired.is_expired());
        assert!(expired.expires_soon());

        let soon = make_credentials(Utc::now() + Duration::minutes(3));
        assert!(!soon.is_expired());
        assert!(soon.expires_soon());

        let fresh = make_credentials(Utc::now() + Duration::hours(1));
        assert!(!fresh.is_expired());
        assert!(!fresh.expires_soon());
    }

    #[test]
    fn test_credentials_updated_with_tokens() {
        let creds = make_credentials(Utc::now() - Duration::minutes(1));
        let response = TokenRefreshResponse {
            access_token: "new-access".to_string(),
            refresh_token: "new-refresh".to_string(),
            expires_in: 3600,
        };

        let updated = creds.updated_with_tokens(&response);
        assert_eq!(updated.access_token, "new-access");
        assert_eq!(updated.refresh_token, "new-refresh");
        assert_eq!(updated.session_id, creds.session_id);
        assert_eq!(updated.user_id, creds.user_id);
        assert!(!updated.is_expired());
    }

    #[test]
    fn test_certificate_request_wire_keys() {
        let env = ApiEnvironment {
            device_name: "test box".to_string(),
            cert_duration: Some("30 min".to_string()),
            ..Default::default()
        };
        let params = CertificateRequestParams::session("pubkey==", &env, None);
        let json = serde_json::to_value(&params).unwrap();

        assert_eq!(json["ClientPublicKey"], "pubkey==");
        assert_eq!(json["ClientPublicKeyMode"], "EC");
        assert_eq!(json["DeviceName"], "test box");
        assert_eq!(json["Mode"], "session");
        assert_eq!(json["Duration"], "30 min");
        assert!(json.get("Features").is_none());
    }

    #[test]
    fn test_certificate_request_omits_duration_by_default() {
        let params =
            CertificateRequestParams::session("pk", &ApiEnvironment::default(), None);
        let json = serde_json::to_value(&params).unwrap();
        assert!(json.get("Duration").is_none());
    }

    #[test]
    fn test_certificate_response_parsing() {
        let json = r#"{
            "Certificate": "-----BEGIN CERTIFICATE-----\nabcd\n-----END CERTIFICATE-----",
            "ExpirationTime": 1700003600,
            "RefreshTime": 1700000000
        }"#;

        let cert: VpnCertificate = serde_json::from_str(json).unwrap();
        assert!(cert.certificate.contains("BEGIN CERTIFICATE"));
        assert_eq!(cert.valid_until.timestamp(), 1_700_003_600);
        assert_eq!(cert.refresh_time.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_token_refresh_wire_keys() {
        let params = TokenRefreshParams::for_token("rt-123");
        let json = serde_json::to_value(&params).unwrap();

        assert_eq!(json["ResponseType"], "token");
        assert_eq!(json["GrantType"], "refresh_token");
        assert_eq!(json["RefreshToken"], "rt-123");
        assert_eq!(json["RedirectURI"], "http://kestrelvpn.net");
    }

    #[test]
    fn test_token_refresh_response_parsing() {
        let json = r#"{"AccessToken": "at", "RefreshToken": "rt", "ExpiresIn": 7200}"#;
        let response: TokenRefreshResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.access_token, "at");
        assert_eq!(response.refresh_token, "rt");
        assert_eq!(response.expires_in, 7200);
    }

    #[test]
    fn test_stored_certificate_expiry() {
        let now = Utc::now();
        let cert = StoredCertificate {
            certificate: "pem".to_string(),
            valid_until: now + Duration::hours(1),
            refresh_time: now + Duration::minutes(30),
            features: None,
        };
        assert!(!cert.is_expired(now));
        assert!(cert.is_expired(now + Duration::hours(2)));
    }

    #[test]
    fn test_api_error_display() {
        assert_eq!(
            ApiError::NoCredentials.to_string(),
            "No API credentials available"
        );
        assert_eq!(
            ApiError::TokenRefresh(None).to_string(),
            "API token refresh failed"
        );
        assert_eq!(
            ApiError::TokenRefresh(Some("HTTP 400".to_string())).to_string(),
            "API token refresh failed: HTTP 400"
        );
        assert_eq!(
            ApiError::TooManyRequests {
                retry_after: Some(30)
            }
            .to_string(),
            "Too many certificate requests, retry after 30s"
        );
        assert_eq!(
            ApiError::TooManyRequests { retry_after: None }.to_string(),
            "Too many certificate requests"
        );
    }
}
