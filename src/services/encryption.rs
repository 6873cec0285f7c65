use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use base64::Engine;

const NONCE_LEN: usize = 12;

/// AES-256-GCM for teacher credentials stored with a session.
pub struct EncryptionService {
    cipher: Aes256Gcm,
}

impl EncryptionService {
    /// Create from a base64-encoded 32-byte key.
    pub fn new(key_base64: &str) -> Result<Self, EncryptionError> {
        let key_bytes = base64::engine::general_purpose::STANDARD
            .decode(key_base64.trim())
            .map_err(|_| EncryptionError::InvalidKey)?;

        if key_bytes.len() != 32 {
            return Err(EncryptionError::InvalidKey);
        }

        let cipher =
            Aes256Gcm::new_from_slice(&key_bytes).map_err(|_| EncryptionError::InvalidKey)?;
        Ok(Self { cipher })
    }

    /// Encrypt, returning the nonce followed by the ciphertext.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| EncryptionError::EncryptFailed)?;

        let mut output = nonce.to_vec();
        output.extend(ciphertext);
        Ok(output)
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        if data.len() < NONCE_LEN {
            return Err(EncryptionError::DecryptFailed);
        }
        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| EncryptionError::DecryptFailed)
    }

    /// Encrypt a secret into a base64 string suitable for a text column.
    pub fn encrypt_secret(&self, secret: &str) -> Result<String, EncryptionError> {
        let sealed = self.encrypt(secret.as_bytes())?;
        Ok(base64::engine::general_purpose::STANDARD.encode(sealed))
    }

    pub fn decrypt_secret(&self, sealed: &str) -> Result<String, EncryptionError> {
        let data = base64::engine::general_purpose::STANDARD
            .decode(sealed)
            .map_err(|_| EncryptionError::DecryptFailed)?;
        let plain = self.decrypt(&data)?;
        String::from_utf8(plain).map_err(|_| EncryptionError::DecryptFailed)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EncryptionError {
    #[error("Invalid encryption key (must be 32 bytes, base64-encoded)")]
    InvalidKey,

    #[error("Encryption failed")]
    EncryptFailed,

    #[error("Decryption failed")]
    DecryptFailed,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> EncryptionService {
        let key = base64::engine::general_purpose::STANDARD.encode([7u8; 32]);
        EncryptionService::new(&key).unwrap()
    }

    #[test]
    fn test_rejects_short_key() {
        let key = base64::engine::general_purpose::STANDARD.encode([1u8; 16]);
        assert!(matches!(
            EncryptionService::new(&key),
            Err(EncryptionError::InvalidKey)
        ));
        assert!(EncryptionService::new("not base64!").is_err());
    }

    #[test]
    fn test_secret_survives_storage() {
        let svc = service();
        let sealed = svc.encrypt_secret("hunter2").unwrap();
        assert_ne!(sealed, "hunter2");
        assert_eq!(svc.decrypt_secret(&sealed).unwrap(), "hunter2");
    }

    #[test]
    fn test_nonce_differs_per_call() {
        let svc = service();
        assert_ne!(svc.encrypt(b"same").unwrap(), svc.encrypt(b"same").unwrap());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let svc = service();
        let mut sealed = svc.encrypt(b"secret").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;
        assert!(matches!(svc.decrypt(&sealed), Err(EncryptionError::DecryptFailed)));
        assert!(svc.decrypt(&[0u8; 4]).is_err());
    }
}
