use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
    Json,
};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::debug;

use crate::database::AppState;
use crate::error::{hash_pii, AppError, PipelineError};
use crate::structs::{AttestRequest, AttestResponse};

type HmacSha256 = Hmac<Sha256>;

const TOKEN_VERSION: u8 = 1;
const MAX_DEVICE_ID_LEN: usize = 128;

pub const ATTESTATION_HEADER: &str = "x-attestation-token";

/// Issues and checks the short-lived tokens every write and admin read must carry.
#[derive(Clone)]
pub struct AttestationService {
    secret: Arc<Vec<u8>>,
    ttl: Duration,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AttestationClaims {
    pub device_id: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    /// Clients should fetch a new token once this passes.
    pub refresh_after: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct TokenEnvelope {
    version: u8,
    claims: AttestationClaims,
}

impl AttestationService {
    pub fn new(secret: Vec<u8>, ttl: Duration) -> Result<Self, AttestationError> {
        if secret.len() < 32 {
            return Err(AttestationError::InvalidSecret);
        }

        Ok(Self {
            secret: Arc::new(secret),
            ttl,
        })
    }

    pub fn issue(&self, device_id: &str) -> Result<IssuedToken, AttestationError> {
        let ttl = ChronoDuration::from_std(self.ttl).map_err(|_| AttestationError::InvalidTtl)?;
        let now = Utc::now();
        let expires_at = now.checked_add_signed(ttl).ok_or(AttestationError::InvalidTtl)?;
        let refresh_after = now + ttl / 2;

        let claims = AttestationClaims {
            device_id: device_id.to_string(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
        };

        Ok(IssuedToken {
            token: self.encode(claims)?,
            expires_at: to_second(expires_at),
            refresh_after: to_second(refresh_after),
        })
    }

    pub fn verify(&self, token: &str) -> Result<AttestationClaims, AttestationError> {
        let envelope = self.decode(token)?;
        if envelope.version != TOKEN_VERSION {
            return Err(AttestationError::UnsupportedVersion(envelope.version));
        }

        if Utc::now().timestamp() > envelope.claims.exp {
            return Err(AttestationError::Expired);
        }
        Ok(envelope.claims)
    }

    fn encode(&self, claims: AttestationClaims) -> Result<String, AttestationError> {
        let envelope = TokenEnvelope {
            version: TOKEN_VERSION,
            claims,
        };

        let payload_bytes =
            serde_json::to_vec(&envelope).map_err(AttestationError::Serialization)?;

        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|_| AttestationError::InvalidSecret)?;
        mac.update(&payload_bytes);
        let signature = mac.finalize().into_bytes();

        Ok(format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&payload_bytes),
            URL_SAFE_NO_PAD.encode(signature)
        ))
    }

    fn decode(&self, token: &str) -> Result<TokenEnvelope, AttestationError> {
        let (payload_part, signature_part) =
            token.split_once('.').ok_or(AttestationError::InvalidFormat)?;
        if signature_part.contains('.') {
            return Err(AttestationError::InvalidFormat);
        }

        let payload_bytes = URL_SAFE_NO_PAD
            .decode(payload_part)
            .map_err(AttestationError::Decode)?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature_part)
            .map_err(AttestationError::Decode)?;

        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|_| AttestationError::InvalidSecret)?;
        mac.update(&payload_bytes);
        mac.verify_slice(&signature)
            .map_err(|_| AttestationError::InvalidSignature)?;

        serde_json::from_slice(&payload_bytes).map_err(AttestationError::Serialization)
    }
}

fn to_second(at: DateTime<Utc>) -> DateTime<Utc> {
    Utc.timestamp_opt(at.timestamp(), 0).single().unwrap_or(at)
}

#[derive(Debug)]
pub enum AttestationError {
    InvalidSecret,
    InvalidTtl,
    InvalidFormat,
    InvalidSignature,
    Expired,
    UnsupportedVersion(u8),
    Decode(base64::DecodeError),
    Serialization(serde_json::Error),
}

impl std::fmt::Display for AttestationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttestationError::InvalidSecret => {
                write!(f, "Attestation secret must be at least 32 bytes")
            }
            AttestationError::InvalidTtl => write!(f, "Invalid token TTL"),
            AttestationError::InvalidFormat => write!(f, "Invalid token format"),
            AttestationError::InvalidSignature => write!(f, "Invalid token signature"),
            AttestationError::Expired => write!(f, "Token expired"),
            AttestationError::UnsupportedVersion(v) => write!(f, "Unsupported token version: {v}"),
            AttestationError::Decode(err) => write!(f, "Token decode error: {err}"),
            AttestationError::Serialization(err) => write!(f, "Token serialization error: {err}"),
        }
    }
}

impl std::error::Error for AttestationError {}

/// Check the attestation header. Missing is `AuthRequired`, anything unusable is `Forbidden`.
pub fn check_headers(
    service: &AttestationService,
    headers: &HeaderMap,
) -> Result<AttestationClaims, PipelineError> {
    let raw = headers
        .get(ATTESTATION_HEADER)
        .ok_or(PipelineError::AuthRequired)?;
    let token = raw.to_str().map_err(|_| PipelineError::Forbidden)?.trim();
    if token.is_empty() {
        return Err(PipelineError::AuthRequired);
    }

    service.verify(token).map_err(|err| {
        debug!(error = %err, "Rejected attestation token");
        PipelineError::Forbidden
    })
}

/// Gate for state-changing and admin routes. Verified claims are stored in the
/// request extensions for the [`crate::session::Session`] extractor.
pub async fn require_attestation(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let claims = check_headers(&state.attestation, req.headers())
        .map_err(|err| err.into_app_error("attestation"))?;
    req.extensions_mut().insert(claims);
    Ok(next.run(req).await)
}

pub async fn attest(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AttestRequest>,
) -> Result<Json<AttestResponse>, AppError> {
    let device_id = req
        .device_id
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty())
        .ok_or_else(|| AppError::validation("attest", &["deviceId"]))?;
    if device_id.len() > MAX_DEVICE_ID_LEN {
        return Err(AppError::bad_request("attest", "deviceId is too long"));
    }

    let issued = state.attestation.issue(&device_id).map_err(|err| {
        AppError::internal("attest", err).with_context("device", hash_pii(&device_id))
    })?;

    Ok(Json(AttestResponse {
        token: issued.token,
        expires_at: issued.expires_at,
        refresh_after: issued.refresh_after,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";

    fn service(ttl: Duration) -> AttestationService {
        AttestationService::new(SECRET.to_vec(), ttl).unwrap()
    }

    #[test]
    fn issued_token_verifies() {
        let svc = service(Duration::from_secs(3600));
        let issued = svc.issue("device-1").unwrap();
        let claims = svc.verify(&issued.token).unwrap();
        assert_eq!(claims.device_id, "device-1");
        assert_eq!(claims.exp, issued.expires_at.timestamp());
        assert!(issued.refresh_after < issued.expires_at);
    }

    #[test]
    fn short_secret_is_rejected() {
        assert!(matches!(
            AttestationService::new(b"short".to_vec(), Duration::from_secs(1)),
            Err(AttestationError::InvalidSecret)
        ));
    }

    #[test]
    fn token_signed_with_another_secret_is_rejected() {
        let other =
            AttestationService::new(b"ffffffffffffffffffffffffffffffff".to_vec(), Duration::from_secs(60))
                .unwrap();
        let token = other.issue("device-1").unwrap().token;
        assert!(matches!(
            service(Duration::from_secs(60)).verify(&token),
            Err(AttestationError::InvalidSignature)
        ));
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let svc = service(Duration::from_secs(60));
        let token = svc.issue("device-1").unwrap().token;
        let (_, sig) = token.split_once('.').unwrap();
        let forged = URL_SAFE_NO_PAD.encode(
            br#"{"version":1,"claims":{"deviceId":"device-2","iat":0,"exp":99999999999}}"#,
        );
        assert!(matches!(
            svc.verify(&format!("{forged}.{sig}")),
            Err(AttestationError::InvalidSignature)
        ));
    }

    #[test]
    fn expired_token_is_rejected() {
        let svc = service(Duration::from_secs(60));
        let claims = AttestationClaims {
            device_id: "device-1".into(),
            iat: 0,
            exp: Utc::now().timestamp() - 10,
        };
        let token = svc.encode(claims).unwrap();
        assert!(matches!(svc.verify(&token), Err(AttestationError::Expired)));
    }

    #[test]
    fn malformed_tokens_are_format_errors() {
        let svc = service(Duration::from_secs(60));
        assert!(matches!(svc.verify("nodot"), Err(AttestationError::InvalidFormat)));
        assert!(matches!(svc.verify("a.b.c"), Err(AttestationError::InvalidFormat)));
    }

    #[test]
    fn header_check_distinguishes_missing_from_invalid() {
        let svc = service(Duration::from_secs(60));
        let mut headers = HeaderMap::new();
        assert_eq!(check_headers(&svc, &headers), Err(PipelineError::AuthRequired));

        headers.insert(ATTESTATION_HEADER, HeaderValue::from_static("garbage.token"));
        assert_eq!(check_headers(&svc, &headers), Err(PipelineError::Forbidden));

        let token = svc.issue("device-1").unwrap().token;
        headers.insert(ATTESTATION_HEADER, HeaderValue::from_str(&token).unwrap());
        assert_eq!(check_headers(&svc, &headers).unwrap().device_id, "device-1");
    }
}
