use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use rand::rngs::OsRng;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// Prefix stamped onto every ciphertext so stored values are recognizable.
/// Anything without it was never produced by this codec.
const CIPHERTEXT_PREFIX: &str = "enc:v1:";

#[derive(Debug)]
pub enum CodecError {
    InvalidKey,
    NotCiphertext,
    Malformed,
    DecryptionFailed,
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidKey => write!(f, "codec key must be 32 bytes of base64"),
            Self::NotCiphertext => write!(f, "value was not produced by this codec"),
            Self::Malformed => write!(f, "ciphertext is malformed"),
            Self::DecryptionFailed => write!(f, "decryption failed"),
        }
    }
}

impl std::error::Error for CodecError {}

/// Reversible encryption for single secret strings (SMTP passwords and the
/// like), AES-256-GCM with a fresh random nonce per call. The nonce is
/// embedded in the output, so the codec keeps no state between calls.
#[derive(Clone)]
pub struct SecretCodec {
    key: [u8; KEY_LEN],
}

impl SecretCodec {
    /// Builds a codec from a base64-encoded 32-byte key.
    pub fn new(key_b64: &str) -> Result<Self, CodecError> {
        let raw = BASE64
            .decode(key_b64.trim())
            .map_err(|_| CodecError::InvalidKey)?;
        let key: [u8; KEY_LEN] = raw.try_into().map_err(|_| CodecError::InvalidKey)?;
        Ok(Self { key })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, CodecError> {
        let cipher =
            Aes256Gcm::new_from_slice(&self.key).map_err(|_| CodecError::InvalidKey)?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| CodecError::DecryptionFailed)?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);
        Ok(format!("{CIPHERTEXT_PREFIX}{}", BASE64.encode(combined)))
    }

    /// Fails on anything not produced by `encrypt` with the current key.
    /// Callers holding possibly-legacy plaintext values must catch the error
    /// themselves; the codec never guesses.
    pub fn decrypt(&self, stored: &str) -> Result<String, CodecError> {
        let encoded = stored
            .strip_prefix(CIPHERTEXT_PREFIX)
            .ok_or(CodecError::NotCiphertext)?;
        let combined = BASE64.decode(encoded).map_err(|_| CodecError::Malformed)?;
        if combined.len() <= NONCE_LEN {
            return Err(CodecError::Malformed);
        }
        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);

        let cipher =
            Aes256Gcm::new_from_slice(&self.key).map_err(|_| CodecError::InvalidKey)?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| CodecError::DecryptionFailed)?;
        String::from_utf8(plaintext).map_err(|_| CodecError::Malformed)
    }

    /// True when the stored value carries this codec's prefix. Used by the
    /// legacy-plaintext compatibility shim around pre-encryption data.
    pub fn looks_encrypted(stored: &str) -> bool {
        stored.starts_with(CIPHERTEXT_PREFIX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec_with(byte: u8) -> SecretCodec {
        SecretCodec::new(&BASE64.encode([byte; KEY_LEN])).unwrap()
    }

    #[test]
    fn roundtrip_recovers_plaintext() {
        let codec = codec_with(7);
        let ciphertext = codec.encrypt("smtp-password-123").unwrap();
        assert_ne!(ciphertext, "smtp-password-123");
        assert_eq!(codec.decrypt(&ciphertext).unwrap(), "smtp-password-123");
    }

    #[test]
    fn same_plaintext_encrypts_differently() {
        let codec = codec_with(7);
        let a = codec.encrypt("secret").unwrap();
        let b = codec.encrypt("secret").unwrap();
        assert_ne!(a, b);
        assert_eq!(codec.decrypt(&a).unwrap(), codec.decrypt(&b).unwrap());
    }

    #[test]
    fn rejects_legacy_plaintext() {
        let codec = codec_with(7);
        assert!(matches!(
            codec.decrypt("plain-old-password"),
            Err(CodecError::NotCiphertext)
        ));
    }

    #[test]
    fn rejects_tampered_ciphertext() {
        let codec = codec_with(7);
        let ciphertext = codec.encrypt("secret").unwrap();
        let mut tampered = ciphertext.into_bytes();
        let last = tampered.len() - 1;
        tampered[last] = if tampered[last] == b'A' { b'B' } else { b'A' };
        let tampered = String::from_utf8(tampered).unwrap();
        assert!(codec.decrypt(&tampered).is_err());
    }

    #[test]
    fn rejects_ciphertext_from_other_key() {
        let ciphertext = codec_with(7).encrypt("secret").unwrap();
        assert!(matches!(
            codec_with(8).decrypt(&ciphertext),
            Err(CodecError::DecryptionFailed)
        ));
    }

    #[test]
    fn rejects_bad_key_material() {
        assert!(SecretCodec::new("not base64!").is_err());
        assert!(SecretCodec::new(&BASE64.encode([1u8; 16])).is_err());
    }
}
