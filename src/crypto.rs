//! Key material and the per-connection session cipher
//!
//! The server owns an RSA key pair. A client wraps a fresh AES-256-GCM key
//! with the server's public key (OAEP/SHA-256); every later frame on that
//! connection is sealed with the session key and a random 96-bit nonce.

use crate::error::{Result, VaultError};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use std::fs;
use std::path::Path;

const SESSION_KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// The server's RSA key pair
pub struct ServerKeys {
    private: RsaPrivateKey,
    public_pem: String,
}

impl ServerKeys {
    pub fn generate(bits: usize) -> Result<Self> {
        let private = RsaPrivateKey::new(&mut OsRng, bits)
            .map_err(|e| VaultError::Crypto(format!("key generation failed: {}", e)))?;
        Self::from_private(private)
    }

    fn from_private(private: RsaPrivateKey) -> Result<Self> {
        let public_pem = RsaPublicKey::from(&private)
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| VaultError::Crypto(e.to_string()))?;
        Ok(Self {
            private,
            public_pem,
        })
    }

    /// Load both halves from PEM files
    pub fn load(private_path: &Path) -> Result<Self> {
        let pem = fs::read_to_string(private_path)?;
        let private = RsaPrivateKey::from_pkcs8_pem(&pem)
            .map_err(|e| VaultError::Crypto(format!("{}: {}", private_path.display(), e)))?;
        Self::from_private(private)
    }

    pub fn save(&self, public_path: &Path, private_path: &Path) -> Result<()> {
        let private_pem = self
            .private
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| VaultError::Crypto(e.to_string()))?;
        fs::write(private_path, private_pem.as_bytes())?;
        fs::write(public_path, self.public_pem.as_bytes())?;
        Ok(())
    }

    pub fn public_pem(&self) -> &str {
        &self.public_pem
    }

    /// Unwrap a session key sent by a client
    pub fn open_session(&self, wrapped: &[u8]) -> Result<SessionCipher> {
        let key = self
            .private
            .decrypt(Oaep::new::<Sha256>(), wrapped)
            .map_err(|e| VaultError::Crypto(format!("session key unwrap failed: {}", e)))?;
        SessionCipher::from_key(&key)
    }
}

/// Create a session key and wrap it for the holder of `public_pem`.
/// Returns the client's cipher and the bytes to send to the server.
pub fn wrap_session(public_pem: &str) -> Result<(SessionCipher, Vec<u8>)> {
    let public = RsaPublicKey::from_public_key_pem(public_pem)
        .map_err(|e| VaultError::Crypto(format!("bad public key: {}", e)))?;

    let mut key = [0u8; SESSION_KEY_LEN];
    OsRng.fill_bytes(&mut key);
    let wrapped = public
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), &key)
        .map_err(|e| VaultError::Crypto(format!("session key wrap failed: {}", e)))?;

    Ok((SessionCipher::from_key(&key)?, wrapped))
}

/// Symmetric cipher shared by both ends of one connection
pub struct SessionCipher {
    cipher: Aes256Gcm,
}

impl SessionCipher {
    fn from_key(key: &[u8]) -> Result<Self> {
        if key.len() != SESSION_KEY_LEN {
            return Err(VaultError::Crypto(format!(
                "session key must be {} bytes, got {}",
                SESSION_KEY_LEN,
                key.len()
            )));
        }
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|_| VaultError::Crypto("invalid session key".to_string()))?;
        Ok(Self { cipher })
    }

    /// Encrypt a message body into `nonce || ciphertext`
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| VaultError::Crypto("encryption failed".to_string()))?;

        let mut frame = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        frame.extend_from_slice(&nonce);
        frame.extend_from_slice(&ciphertext);
        Ok(frame)
    }

    pub fn open(&self, frame: &[u8]) -> Result<Vec<u8>> {
        if frame.len() < NONCE_LEN {
            return Err(VaultError::Crypto("sealed frame too short".to_string()));
        }
        let (nonce, ciphertext) = frame.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| VaultError::Crypto("decryption failed".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_session_handshake() {
        let keys = ServerKeys::generate(1024).unwrap();
        let (client, wrapped) = wrap_session(keys.public_pem()).unwrap();
        let server = keys.open_session(&wrapped).unwrap();

        let sealed = client.seal(b"request body").unwrap();
        assert_ne!(&sealed[NONCE_LEN..], b"request body");
        assert_eq!(server.open(&sealed).unwrap(), b"request body");

        let reply = server.seal(b"").unwrap();
        assert_eq!(client.open(&reply).unwrap(), b"");
    }

    #[test]
    fn test_tampered_frame_is_rejected() {
        let keys = ServerKeys::generate(1024).unwrap();
        let (client, wrapped) = wrap_session(keys.public_pem()).unwrap();
        let server = keys.open_session(&wrapped).unwrap();

        let mut sealed = client.seal(b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(server.open(&sealed).is_err());
        assert!(server.open(&sealed[..4]).is_err());
        assert!(keys.open_session(b"garbage").is_err());
    }

    #[test]
    fn test_keys_survive_save_and_load() {
        let dir = TempDir::new().unwrap();
        let public_path = dir.path().join("rsa.pub");
        let private_path = dir.path().join("rsa.pri");

        let keys = ServerKeys::generate(1024).unwrap();
        keys.save(&public_path, &private_path).unwrap();

        let loaded = ServerKeys::load(&private_path).unwrap();
        assert_eq!(loaded.public_pem(), keys.public_pem());
        assert_eq!(fs::read_to_string(&public_path).unwrap(), keys.public_pem());
    }
}
