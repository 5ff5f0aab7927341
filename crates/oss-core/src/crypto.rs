use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const ENVELOPE_VERSION: &str = "v1";
const NONCE_LEN: usize = 12;

/// Provider refresh credentials, stored sealed on the mailbox row.
/// Token acquisition itself happens outside the core; the pipeline only
/// needs the current access token to authenticate provider calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxCredentials {
    pub access_token: String,
    pub refresh_token: String,
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("credentials key is not valid base64: {0}")]
    KeyDecode(base64::DecodeError),
    #[error("credentials key must be 32 bytes, got {0}")]
    KeyLength(usize),
    #[error("sealed payload is not valid base64: {0}")]
    PayloadDecode(base64::DecodeError),
    #[error("sealed payload is malformed")]
    Malformed,
    #[error("unsupported envelope version {0}")]
    UnsupportedVersion(String),
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
    #[error("credentials json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// AES-256-GCM sealing for mailbox credentials at rest. Output envelope is
/// `v1:<base64(nonce || ciphertext)>` so the key can be rotated behind a new
/// version prefix without rewriting every row first.
#[derive(Clone)]
pub struct CredentialCrypto {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for CredentialCrypto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialCrypto").finish_non_exhaustive()
    }
}

impl CredentialCrypto {
    pub fn from_base64_key(key_b64: &str) -> Result<Self, CryptoError> {
        let bytes = STANDARD
            .decode(key_b64.trim())
            .map_err(CryptoError::KeyDecode)?;
        if bytes.len() != 32 {
            return Err(CryptoError::KeyLength(bytes.len()));
        }
        let key = Key::<Aes256Gcm>::from_slice(&bytes);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<String, CryptoError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| CryptoError::Encrypt)?;

        let mut payload = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        payload.extend_from_slice(nonce.as_slice());
        payload.extend_from_slice(&ciphertext);
        Ok(format!("{ENVELOPE_VERSION}:{}", STANDARD.encode(payload)))
    }

    pub fn open(&self, sealed: &str) -> Result<Vec<u8>, CryptoError> {
        let (version, payload_b64) = sealed.split_once(':').ok_or(CryptoError::Malformed)?;
        if version != ENVELOPE_VERSION {
            return Err(CryptoError::UnsupportedVersion(version.to_string()));
        }

        let payload = STANDARD
            .decode(payload_b64)
            .map_err(CryptoError::PayloadDecode)?;
        if payload.len() <= NONCE_LEN {
            return Err(CryptoError::Malformed);
        }

        let (nonce, ciphertext) = payload.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Decrypt)
    }

    pub fn seal_credentials(&self, creds: &MailboxCredentials) -> Result<String, CryptoError> {
        let plaintext = serde_json::to_vec(creds)?;
        self.seal(&plaintext)
    }

    pub fn open_credentials(&self, sealed: &str) -> Result<MailboxCredentials, CryptoError> {
        let plaintext = self.open(sealed)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }
}
