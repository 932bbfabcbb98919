//! Message channel between the app and the tunnel-side refresh manager
//!
//! The app process cannot call into the extension directly; it sends small
//! datagrams over the provider channel instead. Each message is one code
//! byte followed by an optional payload (JSON for structured data, UTF-8 for
//! error text, little-endian i64 for the throttling delay).

use super::CertRefreshError;
use super::CertificateRefreshManager;
use crate::features::ConnectionFeatures;
use log::{debug, info};

const REQUEST_SET_API_SELECTOR: u8 = 102;
const REQUEST_REFRESH_CERTIFICATE: u8 = 103;
const REQUEST_CANCEL_REFRESHES: u8 = 104;
const REQUEST_RESTART_REFRESHES: u8 = 105;

const RESPONSE_OK: u8 = 0;
const RESPONSE_SESSION_EXPIRED: u8 = 1;
const RESPONSE_NEED_KEY_REGENERATION: u8 = 2;
const RESPONSE_TOO_MANY_CERT_REQUESTS: u8 = 3;
const RESPONSE_ERROR: u8 = 4;

#[derive(Debug, thiserror::Error)]
pub enum ProviderMessageError {
    #[error("Empty provider message")]
    Empty,

    #[error("Unknown provider message code {0}")]
    UnknownCode(u8),

    #[error("Malformed provider message payload: {0}")]
    MalformedPayload(String),
}

/// App to extension requests.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderRequest {
    /// The app forked the API session; derived credentials are already in
    /// shared storage.
    SetApiSelector { selector: String },
    RefreshCertificate { features: Option<ConnectionFeatures> },
    CancelRefreshes,
    RestartRefreshes,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct SelectorPayload {
    selector: String,
}

impl ProviderRequest {
    pub fn encode(&self) -> Result<Vec<u8>, ProviderMessageError> {
        match self {
            ProviderRequest::SetApiSelector { selector } => {
                let payload = serde_json::to_vec(&SelectorPayload {
                    selector: selector.clone(),
                })
                .map_err(|e| ProviderMessageError::MalformedPayload(e.to_string()))?;
                Ok(frame(REQUEST_SET_API_SELECTOR, &payload))
            }
            ProviderRequest::RefreshCertificate { features } => {
                let payload = match features {
                    Some(features) => serde_json::to_vec(features)
                        .map_err(|e| ProviderMessageError::MalformedPayload(e.to_string()))?,
                    None => Vec::new(),
                };
                Ok(frame(REQUEST_REFRESH_CERTIFICATE, &payload))
            }
            ProviderRequest::CancelRefreshes => Ok(frame(REQUEST_CANCEL_REFRESHES, &[])),
            ProviderRequest::RestartRefreshes => Ok(frame(REQUEST_RESTART_REFRESHES, &[])),
        }
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProviderMessageError> {
        let (&code, payload) = data.split_first().ok_or(ProviderMessageError::Empty)?;
        match code {
            REQUEST_SET_API_SELECTOR => {
                let parsed: SelectorPayload = serde_json::from_slice(payload)
                    .map_err(|e| ProviderMessageError::MalformedPayload(e.to_string()))?;
                Ok(ProviderRequest::SetApiSelector {
                    selector: parsed.selector,
                })
            }
            REQUEST_REFRESH_CERTIFICATE => {
                let features = if payload.is_empty() {
                    None
                } else {
                    Some(serde_json::from_slice(payload).map_err(|e| {
                        ProviderMessageError::MalformedPayload(e.to_string())
                    })?)
                };
                Ok(ProviderRequest::RefreshCertificate { features })
            }
            REQUEST_CANCEL_REFRESHES => Ok(ProviderRequest::CancelRefreshes),
            REQUEST_RESTART_REFRESHES => Ok(ProviderRequest::RestartRefreshes),
            other => Err(ProviderMessageError::UnknownCode(other)),
        }
    }
}

/// Extension to app answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderResponse {
    Ok { data: Option<Vec<u8>> },
    SessionExpired,
    NeedKeyRegeneration,
    TooManyCertRequests { retry_after: Option<i64> },
    Error { message: String },
}

impl ProviderResponse {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            ProviderResponse::Ok { data } => frame(RESPONSE_OK, data.as_deref().unwrap_or(&[])),
            ProviderResponse::SessionExpired => frame(RESPONSE_SESSION_EXPIRED, &[]),
            ProviderResponse::NeedKeyRegeneration => frame(RESPONSE_NEED_KEY_REGENERATION, &[]),
            ProviderResponse::TooManyCertRequests { retry_after } => match retry_after {
                Some(secs) => frame(RESPONSE_TOO_MANY_CERT_REQUESTS, &secs.to_le_bytes()),
                None => frame(RESPONSE_TOO_MANY_CERT_REQUESTS, &[]),
            },
            ProviderResponse::Error { message } => frame(RESPONSE_ERROR, message.as_bytes()),
        }
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProviderMessageError> {
        let (&code, payload) = data.split_first().ok_or(ProviderMessageError::Empty)?;
        match code {
            RESPONSE_OK => Ok(ProviderResponse::Ok {
                data: if payload.is_empty() {
                    None
                } else {
                    Some(payload.to_vec())
                },
            }),
            RESPONSE_SESSION_EXPIRED => Ok(ProviderResponse::SessionExpired),
            RESPONSE_NEED_KEY_REGENERATION => Ok(ProviderResponse::NeedKeyRegeneration),
            RESPONSE_TOO_MANY_CERT_REQUESTS => {
                let retry_after = if payload.is_empty() {
                    None
                } else {
                    let bytes: [u8; 8] = payload.try_into().map_err(|_| {
                        ProviderMessageError::MalformedPayload(format!(
                            "retry-after payload has {} bytes, expected 8",
                            payload.len()
                        ))
                    })?;
                    Some(i64::from_le_bytes(bytes))
                };
                Ok(ProviderResponse::TooManyCertRequests { retry_after })
            }
            RESPONSE_ERROR => {
                let message = String::from_utf8(payload.to_vec())
                    .map_err(|e| ProviderMessageError::MalformedPayload(e.to_string()))?;
                Ok(ProviderResponse::Error { message })
            }
            other => Err(ProviderMessageError::UnknownCode(other)),
        }
    }
}

fn frame(code: u8, payload: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(1 + payload.len());
    data.push(code);
    data.extend_from_slice(payload);
    data
}

impl CertificateRefreshManager {
    /// Service one request from the app side of the provider channel.
    pub async fn handle_provider_request(&self, request: ProviderRequest) -> ProviderResponse {
        match request {
            ProviderRequest::SetApiSelector { selector } => {
                // Credentials derived from the selector were stored by the
                // app before it sent the message
                debug!("Session selector received ({} chars)", selector.len());
                self.session_renewed();
                ProviderResponse::Ok { data: None }
            }
            ProviderRequest::RefreshCertificate { features } => {
                if features.is_some() {
                    self.set_features(features);
                }
                match self.refresh_if_needed().await {
                    Ok(()) => ProviderResponse::Ok { data: None },
                    Err(CertRefreshError::SessionExpired) => ProviderResponse::SessionExpired,
                    Err(CertRefreshError::NeedNewKeys) => ProviderResponse::NeedKeyRegeneration,
                    Err(CertRefreshError::TooManyCertRequests { retry_after }) => {
                        ProviderResponse::TooManyCertRequests { retry_after }
                    }
                    Err(err) => ProviderResponse::Error {
                        message: err.to_string(),
                    },
                }
            }
            ProviderRequest::CancelRefreshes => {
                info!("Certificate refreshes cancelled via provider message");
                self.stop();
                ProviderResponse::Ok { data: None }
            }
            ProviderRequest::RestartRefreshes => {
                info!("Certificate refreshes restarted via provider message");
                self.start();
                ProviderResponse::Ok { data: None }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::types::{ApiEnvironment, AuthCredentials};
    use crate::api::ApiClient;
    use crate::features::NetShieldLevel;
    use crate::keys::DeviceKeypair;
    use crate::storage::{MemoryStorage, SessionStorage};
    use chrono::{Duration as ChronoDuration, Utc};
    use std::sync::Arc;

    #[test]
    fn test_request_roundtrip_set_api_selector() {
        let request = ProviderRequest::SetApiSelector {
            selector: "fork-selector-1".to_string(),
        };
        let encoded = request.encode().unwrap();
        assert_eq!(encoded[0], 102);
        assert_eq!(ProviderRequest::decode(&encoded).unwrap(), request);
    }

    #[test]
    fn test_request_roundtrip_refresh_certificate_without_features() {
        let request = ProviderRequest::RefreshCertificate { features: None };
        let encoded = request.encode().unwrap();
        assert_eq!(encoded, vec![103]);
        assert_eq!(ProviderRequest::decode(&encoded).unwrap(), request);
    }

    #[test]
    fn test_request_roundtrip_refresh_certificate_with_features() {
        let mut features = ConnectionFeatures::default();
        features.netshield = NetShieldLevel::Level1;
        features.vpn_accelerator = true;
        let request = ProviderRequest::RefreshCertificate {
            features: Some(features),
        };
        let encoded = request.encode().unwrap();
        assert_eq!(encoded[0], 103);
        assert_eq!(ProviderRequest::decode(&encoded).unwrap(), request);
    }

    #[test]
    fn test_request_roundtrip_cancel_and_restart() {
        assert_eq!(
            ProviderRequest::decode(&ProviderRequest::CancelRefreshes.encode().unwrap()).unwrap(),
            ProviderRequest::CancelRefreshes
        );
        assert_eq!(
            ProviderRequest::decode(&ProviderRequest::RestartRefreshes.encode().unwrap()).unwrap(),
            ProviderRequest::RestartRefreshes
        );
        assert_eq!(
            ProviderRequest::CancelRefreshes.encode().unwrap(),
            vec![104]
        );
        assert_eq!(
            ProviderRequest::RestartRefreshes.encode().unwrap(),
            vec![105]
        );
    }

    #[test]
    fn test_request_decode_rejects_empty_and_unknown() {
        assert!(matches!(
            ProviderRequest::decode(&[]),
            Err(ProviderMessageError::Empty)
        ));
        assert!(matches!(
            ProviderRequest::decode(&[42]),
            Err(ProviderMessageError::UnknownCode(42))
        ));
    }

    #[test]
    fn test_response_roundtrip_ok() {
        let bare = ProviderResponse::Ok { data: None };
        assert_eq!(bare.encode(), vec![0]);
        assert_eq!(ProviderResponse::decode(&bare.encode()).unwrap(), bare);

        let with_data = ProviderResponse::Ok {
            data: Some(vec![1, 2, 3]),
        };
        assert_eq!(
            ProviderResponse::decode(&with_data.encode()).unwrap(),
            with_data
        );
    }

    #[test]
    fn test_response_roundtrip_retry_after_is_little_endian() {
        let response = ProviderResponse::TooManyCertRequests {
            retry_after: Some(1),
        };
        let encoded = response.encode();
        assert_eq!(encoded, vec![3, 1, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(ProviderResponse::decode(&encoded).unwrap(), response);

        let without = ProviderResponse::TooManyCertRequests { retry_after: None };
        assert_eq!(without.encode(), vec![3]);
        assert_eq!(
            ProviderResponse::decode(&without.encode()).unwrap(),
            without
        );
    }

    #[test]
    fn test_response_rejects_short_retry_after_payload() {
        assert!(matches!(
            ProviderResponse::decode(&[3, 1, 0]),
            Err(ProviderMessageError::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_response_roundtrip_error_message() {
        let response = ProviderResponse::Error {
            message: "certificate endpoint unreachable".to_string(),
        };
        let encoded = response.encode();
        assert_eq!(encoded[0], 4);
        assert_eq!(ProviderResponse::decode(&encoded).unwrap(), response);
    }

    #[test]
    fn test_response_roundtrip_simple_codes() {
        for response in [
            ProviderResponse::SessionExpired,
            ProviderResponse::NeedKeyRegeneration,
        ] {
            assert_eq!(
                ProviderResponse::decode(&response.encode()).unwrap(),
                response
            );
        }
    }

    fn local_manager() -> (CertificateRefreshManager, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        storage
            .store_credentials(&AuthCredentials {
                user_id: "user-1".to_string(),
                session_id: "session-1".to_string(),
                access_token: "access".to_string(),
                refresh_token: "refresh".to_string(),
                expires_at: Utc::now() + ChronoDuration::hours(1),
                scopes: vec![],
            })
            .unwrap();
        storage.store_keys(&DeviceKeypair::generate()).unwrap();

        // Unroutable base URL; tests below never reach the network
        let env = ApiEnvironment {
            base_url: "http://127.0.0.1:9".to_string(),
            ..ApiEnvironment::default()
        };
        let api = ApiClient::new(env, storage.clone());
        (CertificateRefreshManager::new(api, storage.clone()), storage)
    }

    fn fresh_certificate() -> crate::api::types::StoredCertificate {
        crate::api::types::StoredCertificate {
            certificate: "-----BEGIN CERTIFICATE-----".to_string(),
            valid_until: Utc::now() + ChronoDuration::hours(1),
            refresh_time: Utc::now() + ChronoDuration::minutes(30),
            features: None,
        }
    }

    #[tokio::test]
    async fn test_refresh_request_with_valid_certificate_answers_ok() {
        let (manager, storage) = local_manager();
        storage.store_certificate(&fresh_certificate()).unwrap();

        let response = manager
            .handle_provider_request(ProviderRequest::RefreshCertificate { features: None })
            .await;
        assert_eq!(response, ProviderResponse::Ok { data: None });
    }

    #[tokio::test]
    async fn test_cancel_then_refresh_answers_error() {
        let (manager, storage) = local_manager();
        storage.store_certificate(&fresh_certificate()).unwrap();

        let response = manager
            .handle_provider_request(ProviderRequest::CancelRefreshes)
            .await;
        assert_eq!(response, ProviderResponse::Ok { data: None });
        assert!(manager.is_stopped());

        let response = manager
            .handle_provider_request(ProviderRequest::RefreshCertificate { features: None })
            .await;
        assert!(matches!(response, ProviderResponse::Error { .. }));
    }

    #[tokio::test]
    async fn test_restart_after_cancel_resumes() {
        let (manager, storage) = local_manager();
        storage.store_certificate(&fresh_certificate()).unwrap();

        manager
            .handle_provider_request(ProviderRequest::CancelRefreshes)
            .await;
        let response = manager
            .handle_provider_request(ProviderRequest::RestartRefreshes)
            .await;

        assert_eq!(response, ProviderResponse::Ok { data: None });
        assert!(!manager.is_stopped());
        assert!(manager.is_scheduled());
    }

    #[tokio::test]
    async fn test_missing_keys_answer_need_key_regeneration() {
        let (manager, storage) = local_manager();
        storage.clear_keys();

        let response = manager
            .handle_provider_request(ProviderRequest::RefreshCertificate { features: None })
            .await;
        assert_eq!(response, ProviderResponse::NeedKeyRegeneration);
    }

    #[tokio::test]
    async fn test_selector_message_resumes_after_session_expiry() {
        let (manager, storage) = local_manager();
        // No credentials and no certificate, so the refresh is due and the
        // request dies before reaching the network
        storage.clear_credentials();
        let response = manager
            .handle_provider_request(ProviderRequest::RefreshCertificate { features: None })
            .await;
        assert_eq!(response, ProviderResponse::SessionExpired);
        assert!(manager.is_session_expired());

        // The app stores forked credentials first, then announces the selector
        storage
            .store_credentials(&AuthCredentials {
                user_id: "user-1".to_string(),
                session_id: "session-2".to_string(),
                access_token: "forked-access".to_string(),
                refresh_token: "forked-refresh".to_string(),
                expires_at: Utc::now() + ChronoDuration::hours(1),
                scopes: vec![],
            })
            .unwrap();
        let response = manager
            .handle_provider_request(ProviderRequest::SetApiSelector {
                selector: "fork-selector-1".to_string(),
            })
            .await;
        assert_eq!(response, ProviderResponse::Ok { data: None });
        assert!(!manager.is_session_expired());
    }
}
