use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};

/// Signed upload authorization issued by the gateway.
///
/// Binds a job identity to its storage destination, declared content type
/// and size ceiling. Registered JWT claim names are used on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct TrustClaims {
    #[serde(rename = "sub")]
    #[garde(length(min = 1, max = 256))]
    pub subject: String,

    #[serde(rename = "iss")]
    #[garde(length(min = 1, max = 256))]
    pub issuer: String,

    #[garde(length(min = 1, max = 128), custom(job_id_charset))]
    pub job_id: String,

    #[garde(length(min = 1, max = 1024))]
    pub storage_key: String,

    #[garde(length(min = 1, max = 128))]
    pub content_type: String,

    #[garde(range(min = 1))]
    pub max_size: u64,

    /// Unix seconds.
    #[serde(rename = "iat")]
    #[garde(skip)]
    pub issued_at: i64,

    /// Unix seconds.
    #[serde(rename = "exp")]
    #[garde(skip)]
    pub expires_at: i64,
}

#[allow(clippy::ptr_arg)]
fn job_id_charset(value: &String, _ctx: &()) -> garde::Result {
    let ok = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '-'));
    if ok {
        Ok(())
    } else {
        Err(garde::Error::new("job_id may only contain [A-Za-z0-9._:-]"))
    }
}

impl TrustClaims {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now.timestamp()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> TrustClaims {
        TrustClaims {
            subject: "user-1".to_string(),
            issuer: "upload-gateway".to_string(),
            job_id: "job-42".to_string(),
            storage_key: "uploads/job-42.jpg".to_string(),
            content_type: "image/jpeg".to_string(),
            max_size: 1024,
            issued_at: 1_700_000_000,
            expires_at: 1_700_003_600,
        }
    }

    #[test]
    fn test_wire_names() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["sub"], "user-1");
        assert_eq!(json["iss"], "upload-gateway");
        assert_eq!(json["exp"], 1_700_003_600);
        assert_eq!(json["iat"], 1_700_000_000);
        assert_eq!(json["job_id"], "job-42");
    }

    #[test]
    fn test_shape_validation() {
        assert!(sample().validate().is_ok());

        let mut bad = sample();
        bad.job_id = "job 42/../x".to_string();
        assert!(bad.validate().is_err());

        let mut bad = sample();
        bad.max_size = 0;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_expiry() {
        let claims = sample();
        let before = Utc.timestamp_opt(1_700_003_599, 0).unwrap();
        let at = Utc.timestamp_opt(1_700_003_600, 0).unwrap();
        assert!(!claims.is_expired_at(before));
        assert!(claims.is_expired_at(at));
    }
}
