use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const TYPE_EMAIL_CHANGE: &str = "email_change";
pub const TYPE_SESSION: &str = "session";

#[derive(Debug, PartialEq, Eq)]
pub enum TokenError {
    BadSignature,
    Expired,
    WrongType,
}

impl std::fmt::Display for TokenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadSignature => write!(f, "token signature or format is invalid"),
            Self::Expired => write!(f, "token has expired"),
            Self::WrongType => write!(f, "token type does not match"),
        }
    }
}

impl std::error::Error for TokenError {}

#[derive(Debug, Serialize, Deserialize)]
struct TokenHeader {
    alg: String,
    typ: String,
}

/// Signed claims. `new_email` is only present on email-change tokens.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    pub sub: String,
    pub typ: String,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_email: Option<String>,
}

impl Claims {
    pub fn email_change(admin_id: &str, new_email: &str, exp: i64) -> Self {
        Self {
            sub: admin_id.to_owned(),
            typ: TYPE_EMAIL_CHANGE.to_owned(),
            exp,
            new_email: Some(new_email.to_owned()),
        }
    }

    pub fn session(admin_id: &str, exp: i64) -> Self {
        Self {
            sub: admin_id.to_owned(),
            typ: TYPE_SESSION.to_owned(),
            exp,
            new_email: None,
        }
    }
}

/// HS256 compact-token issuer/verifier. Pure function of its inputs and the
/// supplied clock; verification does no I/O. Single-use enforcement lives in
/// the orchestrator, which checks the token against its persisted pending
/// record.
#[derive(Clone)]
pub struct TokenSigner {
    secret: Vec<u8>,
}

impl TokenSigner {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    pub fn issue(&self, claims: &Claims) -> Result<String, TokenError> {
        let header = TokenHeader {
            alg: "HS256".to_owned(),
            typ: "JWT".to_owned(),
        };
        let header_b64 = URL_SAFE_NO_PAD
            .encode(serde_json::to_vec(&header).map_err(|_| TokenError::BadSignature)?);
        let claims_b64 = URL_SAFE_NO_PAD
            .encode(serde_json::to_vec(claims).map_err(|_| TokenError::BadSignature)?);
        let signing_input = format!("{header_b64}.{claims_b64}");

        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|_| TokenError::BadSignature)?;
        mac.update(signing_input.as_bytes());
        let sig_b64 = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

        Ok(format!("{signing_input}.{sig_b64}"))
    }

    /// Verifies against the current wall clock.
    pub fn verify(&self, token: &str, expected_typ: &str) -> Result<Claims, TokenError> {
        self.verify_at(token, expected_typ, Utc::now().timestamp())
    }

    /// Verifies against an explicit clock. Checks, in order: format and
    /// signature, then type, then expiry.
    pub fn verify_at(
        &self,
        token: &str,
        expected_typ: &str,
        now_epoch_secs: i64,
    ) -> Result<Claims, TokenError> {
        let mut parts = token.trim().split('.');
        let (Some(header_b64), Some(claims_b64), Some(sig_b64), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(TokenError::BadSignature);
        };

        let header_raw = URL_SAFE_NO_PAD
            .decode(header_b64)
            .map_err(|_| TokenError::BadSignature)?;
        let header: TokenHeader =
            serde_json::from_slice(&header_raw).map_err(|_| TokenError::BadSignature)?;
        if header.alg != "HS256" {
            return Err(TokenError::BadSignature);
        }

        let signing_input = format!("{header_b64}.{claims_b64}");
        let sig = URL_SAFE_NO_PAD
            .decode(sig_b64)
            .map_err(|_| TokenError::BadSignature)?;
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|_| TokenError::BadSignature)?;
        mac.update(signing_input.as_bytes());
        mac.verify_slice(&sig).map_err(|_| TokenError::BadSignature)?;

        let claims_raw = URL_SAFE_NO_PAD
            .decode(claims_b64)
            .map_err(|_| TokenError::BadSignature)?;
        let claims: Claims =
            serde_json::from_slice(&claims_raw).map_err(|_| TokenError::BadSignature)?;

        if claims.typ != expected_typ {
            return Err(TokenError::WrongType);
        }
        if claims.exp <= now_epoch_secs {
            return Err(TokenError::Expired);
        }
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000;

    fn signer() -> TokenSigner {
        TokenSigner::new(b"verification-secret".to_vec())
    }

    #[test]
    fn issued_token_verifies_with_matching_claims() {
        let signer = signer();
        let claims = Claims::email_change("admin-1", "new@example.com", NOW + 1800);
        let token = signer.issue(&claims).unwrap();
        let verified = signer.verify_at(&token, TYPE_EMAIL_CHANGE, NOW).unwrap();
        assert_eq!(verified, claims);
    }

    #[test]
    fn expiry_boundary() {
        let signer = signer();
        let ttl = 30;
        let claims = Claims::email_change("admin-1", "new@example.com", NOW + ttl);
        let token = signer.issue(&claims).unwrap();

        assert!(
            signer
                .verify_at(&token, TYPE_EMAIL_CHANGE, NOW + ttl - 1)
                .is_ok()
        );
        assert_eq!(
            signer.verify_at(&token, TYPE_EMAIL_CHANGE, NOW + ttl + 1),
            Err(TokenError::Expired)
        );
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let signer = signer();
        let token = signer
            .issue(&Claims::email_change("admin-1", "new@example.com", NOW + 1800))
            .unwrap();

        let forged_claims = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&Claims::email_change(
                "admin-1",
                "attacker@example.com",
                NOW + 1800,
            ))
            .unwrap(),
        );
        let mut parts: Vec<&str> = token.split('.').collect();
        parts[1] = &forged_claims;
        let forged = parts.join(".");

        assert_eq!(
            signer.verify_at(&forged, TYPE_EMAIL_CHANGE, NOW),
            Err(TokenError::BadSignature)
        );
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = signer()
            .issue(&Claims::email_change("admin-1", "new@example.com", NOW + 1800))
            .unwrap();
        let other = TokenSigner::new(b"session-secret".to_vec());
        assert_eq!(
            other.verify_at(&token, TYPE_EMAIL_CHANGE, NOW),
            Err(TokenError::BadSignature)
        );
    }

    #[test]
    fn wrong_type_is_rejected() {
        let signer = signer();
        let token = signer
            .issue(&Claims::session("admin-1", NOW + 1800))
            .unwrap();
        assert_eq!(
            signer.verify_at(&token, TYPE_EMAIL_CHANGE, NOW),
            Err(TokenError::WrongType)
        );
    }

    #[test]
    fn garbage_is_rejected() {
        let signer = signer();
        assert_eq!(
            signer.verify_at("not-a-token", TYPE_EMAIL_CHANGE, NOW),
            Err(TokenError::BadSignature)
        );
        assert_eq!(
            signer.verify_at("a.b.c.d", TYPE_EMAIL_CHANGE, NOW),
            Err(TokenError::BadSignature)
        );
    }
}
