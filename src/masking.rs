use crate::secret_codec::{CodecError, SecretCodec};

/// Fixed sentinel shown in place of a persisted secret. Resubmitting it
/// means "leave the stored value unchanged".
pub const MASK_TOKEN: &str = "••••••••••••";

#[derive(Debug)]
pub enum MaskError {
    NothingToPreserve,
    Codec(CodecError),
}

impl std::fmt::Display for MaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NothingToPreserve => {
                write!(f, "mask sentinel submitted but no stored secret exists")
            }
            Self::Codec(e) => write!(f, "codec error: {e}"),
        }
    }
}

impl std::error::Error for MaskError {}

impl From<CodecError> for MaskError {
    fn from(value: CodecError) -> Self {
        Self::Codec(value)
    }
}

/// A persisted secret is only ever displayed as the sentinel.
pub fn mask_for_display(_secret: &str) -> &'static str {
    MASK_TOKEN
}

/// Decides what to persist for an incoming secret field.
///
/// Sentinel + existing stored value: keep the stored encrypted value as-is,
/// no re-encryption. Sentinel + nothing stored: error, there is nothing to
/// preserve and the literal mask must never become a password. Anything
/// else: encrypt fresh.
pub fn resolve_incoming(
    submitted: &str,
    stored_encrypted: Option<&str>,
    codec: &SecretCodec,
) -> Result<String, MaskError> {
    if submitted == MASK_TOKEN {
        return match stored_encrypted {
            Some(existing) => Ok(existing.to_owned()),
            None => Err(MaskError::NothingToPreserve),
        };
    }
    Ok(codec.encrypt(submitted)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD as BASE64;

    fn codec() -> SecretCodec {
        SecretCodec::new(&BASE64.encode([3u8; 32])).unwrap()
    }

    #[test]
    fn display_is_always_the_sentinel() {
        assert_eq!(mask_for_display("hunter2"), MASK_TOKEN);
        assert_eq!(mask_for_display(""), MASK_TOKEN);
        assert_eq!(mask_for_display(MASK_TOKEN), MASK_TOKEN);
    }

    #[test]
    fn sentinel_preserves_stored_value_untouched() {
        let codec = codec();
        let stored = codec.encrypt("real-password").unwrap();
        let resolved = resolve_incoming(MASK_TOKEN, Some(&stored), &codec).unwrap();
        assert_eq!(resolved, stored);
    }

    #[test]
    fn sentinel_with_nothing_stored_is_an_error() {
        assert!(matches!(
            resolve_incoming(MASK_TOKEN, None, &codec()),
            Err(MaskError::NothingToPreserve)
        ));
    }

    #[test]
    fn fresh_secret_is_encrypted() {
        let codec = codec();
        let stored = codec.encrypt("old-password").unwrap();
        let resolved = resolve_incoming("new-password", Some(&stored), &codec).unwrap();
        assert_ne!(resolved, stored);
        assert_ne!(resolved, "new-password");
        assert_eq!(codec.decrypt(&resolved).unwrap(), "new-password");
    }
}
