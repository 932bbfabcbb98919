//! Backend API for certificates and session tokens
//!
//! The tunnel extension talks to two endpoints: `POST /vpn/v1/certificate`
//! to obtain a short-lived certificate for the device key, and
//! `POST /auth/refresh` to rotate an expired access token. Credentials come
//! from the injected session store, never from a global.
//!
//! - types.rs: request/response bodies and the error taxonomy
//! - client.rs: `ApiClient` with the single-retry token refresh path

pub mod client;
pub mod types;

pub use client::ApiClient;
pub use types::{
    ApiEnvironment, ApiError, AuthCredentials, CertificateRequestParams, StoredCertificate,
    TokenRefreshParams, TokenRefreshResponse, VpnCertificate,
};
