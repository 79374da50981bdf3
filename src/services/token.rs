//! Trust-claim verification.
//!
//! Claims are EdDSA-signed JWTs minted by the upload gateway. Verification
//! needs only the gateway's public key.

use base64::Engine;
use garde::Validate;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};

use crate::models::claims::TrustClaims;
use crate::models::job::ErrorCode;

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("Trust claim expired")]
    Expired,

    #[error("Trust claim invalid: {0}")]
    Invalid(String),

    #[error("Invalid verification key: {0}")]
    Key(String),
}

impl TokenError {
    pub fn code(&self) -> ErrorCode {
        match self {
            TokenError::Expired => ErrorCode::TokenExpired,
            TokenError::Invalid(_) | TokenError::Key(_) => ErrorCode::TokenInvalid,
        }
    }
}

pub struct TokenVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    /// Create from a PEM-encoded Ed25519 public key.
    pub fn from_pem(public_key_pem: &[u8], issuer: &str) -> Result<Self, TokenError> {
        let decoding_key =
            DecodingKey::from_ed_pem(public_key_pem).map_err(|e| TokenError::Key(e.to_string()))?;

        let mut validation = Validation::new(Algorithm::EdDSA);
        validation.set_issuer(&[issuer]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);
        // Expiry is exact here, as it is again before upload.
        validation.leeway = 0;

        Ok(Self {
            decoding_key,
            validation,
        })
    }

    /// Create from a base64-encoded PEM, as carried in the environment.
    pub fn from_base64_pem(encoded: &str, issuer: &str) -> Result<Self, TokenError> {
        let pem = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| TokenError::Key(e.to_string()))?;
        Self::from_pem(&pem, issuer)
    }

    /// Checks signature, issuer, expiry and claim shape.
    pub fn verify(&self, token: &str) -> Result<TrustClaims, TokenError> {
        let claims = decode::<TrustClaims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                _ => TokenError::Invalid(e.to_string()),
            })?;

        claims
            .validate()
            .map_err(|report| TokenError::Invalid(report.to_string()))?;

        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const PRIVATE_KEY: &str = include_str!("../../tests/fixtures/ed25519_private.pem");
    const PUBLIC_KEY: &str = include_str!("../../tests/fixtures/ed25519_public.pem");
    const OTHER_PUBLIC_KEY: &str = include_str!("../../tests/fixtures/ed25519_other_public.pem");

    fn claims(expires_in: i64) -> TrustClaims {
        let now = Utc::now().timestamp();
        TrustClaims {
            subject: "user-1".to_string(),
            issuer: "upload-gateway".to_string(),
            job_id: "job-1".to_string(),
            storage_key: "uploads/job-1.jpg".to_string(),
            content_type: "image/png".to_string(),
            max_size: 4096,
            issued_at: now,
            expires_at: now + expires_in,
        }
    }

    fn sign(claims: &TrustClaims) -> String {
        let key = EncodingKey::from_ed_pem(PRIVATE_KEY.as_bytes()).unwrap();
        encode(&Header::new(Algorithm::EdDSA), claims, &key).unwrap()
    }

    fn verifier(public_key: &str) -> TokenVerifier {
        TokenVerifier::from_pem(public_key.as_bytes(), "upload-gateway").unwrap()
    }

    #[test]
    fn test_valid_claim() {
        let expected = claims(600);
        let verified = verifier(PUBLIC_KEY).verify(&sign(&expected)).unwrap();
        assert_eq!(verified, expected);
    }

    #[test]
    fn test_expired_claim() {
        let err = verifier(PUBLIC_KEY).verify(&sign(&claims(-3600))).unwrap_err();
        assert!(matches!(err, TokenError::Expired));
        assert_eq!(err.code(), ErrorCode::TokenExpired);
    }

    #[test]
    fn test_recently_expired_claim_rejected() {
        let err = verifier(PUBLIC_KEY).verify(&sign(&claims(-5))).unwrap_err();
        assert!(matches!(err, TokenError::Expired));
    }

    #[test]
    fn test_wrong_key() {
        let err = verifier(OTHER_PUBLIC_KEY)
            .verify(&sign(&claims(600)))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::TokenInvalid);
    }

    #[test]
    fn test_wrong_issuer() {
        let mut foreign = claims(600);
        foreign.issuer = "someone-else".to_string();
        let err = verifier(PUBLIC_KEY).verify(&sign(&foreign)).unwrap_err();
        assert!(matches!(err, TokenError::Invalid(_)));
    }

    #[test]
    fn test_malformed_claim_shape() {
        let mut bad = claims(600);
        bad.job_id = "../escape".to_string();
        let err = verifier(PUBLIC_KEY).verify(&sign(&bad)).unwrap_err();
        assert!(matches!(err, TokenError::Invalid(_)));
    }

    #[test]
    fn test_garbage_token() {
        let err = verifier(PUBLIC_KEY).verify("not.a.token").unwrap_err();
        assert_eq!(err.code(), ErrorCode::TokenInvalid);
    }

    #[test]
    fn test_base64_key() {
        let encoded = base64::engine::general_purpose::STANDARD.encode(PUBLIC_KEY);
        let verifier = TokenVerifier::from_base64_pem(&encoded, "upload-gateway").unwrap();
        assert!(verifier.verify(&sign(&claims(600))).is_ok());
    }
}
