//! Encryption of stored credential values.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use base64::Engine;
use chacha20poly1305::aead::generic_array::GenericArray;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::XChaCha20Poly1305;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, info};

use crate::error::{GatehouseError, Result};

/// Length of the symmetric key in bytes.
pub const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 24;

/// Turns credential values into storable text and back.
pub trait Encryptor: Send + Sync {
    /// Encrypt `plaintext` into a text token.
    fn encrypt(&self, plaintext: &str) -> Result<String>;

    /// Recover the plaintext from a token produced by [`encrypt`](Self::encrypt).
    fn decrypt(&self, token: &str) -> Result<String>;

    /// Whether values are actually protected at rest.
    fn is_secure(&self) -> bool;
}

/// XChaCha20-Poly1305 under one process-wide key.
///
/// Tokens are base64 of a random 24-byte nonce followed by the ciphertext and tag.
pub struct SealedBoxEncryptor {
    cipher: XChaCha20Poly1305,
}

impl SealedBoxEncryptor {
    pub fn new(key: &[u8; KEY_LEN]) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(GenericArray::from_slice(key)),
        }
    }
}

impl Encryptor for SealedBoxEncryptor {
    fn encrypt(&self, plaintext: &str) -> Result<String> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(GenericArray::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|e| GatehouseError::Crypto(format!("encryption failed: {}", e)))?;

        let mut sealed = nonce.to_vec();
        sealed.extend_from_slice(&ciphertext);
        Ok(base64::engine::general_purpose::STANDARD.encode(sealed))
    }

    fn decrypt(&self, token: &str) -> Result<String> {
        let sealed = base64::engine::general_purpose::STANDARD
            .decode(token)
            .map_err(|e| GatehouseError::Crypto(format!("token is not base64: {}", e)))?;
        if sealed.len() < NONCE_LEN {
            return Err(GatehouseError::Crypto("token too short".to_string()));
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(GenericArray::from_slice(nonce), ciphertext)
            .map_err(|e| GatehouseError::Crypto(format!("decryption failed: {}", e)))?;

        String::from_utf8(plaintext)
            .map_err(|e| GatehouseError::Crypto(format!("plaintext is not UTF-8: {}", e)))
    }

    fn is_secure(&self) -> bool {
        true
    }
}

/// Stores values verbatim. Used when no key material is available.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlaintextEncryptor;

impl Encryptor for PlaintextEncryptor {
    fn encrypt(&self, plaintext: &str) -> Result<String> {
        Ok(plaintext.to_string())
    }

    fn decrypt(&self, token: &str) -> Result<String> {
        Ok(token.to_string())
    }

    fn is_secure(&self) -> bool {
        false
    }
}

/// Read the key at `path`, generating and persisting a new one if absent.
///
/// A new key is written to a private temporary file beside `path` and linked
/// into place only once complete, so concurrent starts either publish the key
/// or read the one another process published. Key files are owner-only on unix.
pub fn load_or_create_key(path: &Path) -> Result<[u8; KEY_LEN]> {
    match fs::read(path) {
        Ok(bytes) => return parse_key(path, &bytes),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    let mut key = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut key);

    let mut staged = tempfile::Builder::new()
        .prefix(".gatehouse-key-")
        .tempfile_in(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        staged
            .as_file()
            .set_permissions(fs::Permissions::from_mode(0o600))?;
    }
    staged.write_all(&key)?;
    staged.as_file().sync_all()?;

    match staged.persist_noclobber(path) {
        Ok(_) => {
            info!(path = %path.display(), "Generated new credentials encryption key");
            Ok(key)
        }
        Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
            debug!(path = %path.display(), "Encryption key published concurrently, loading it");
            parse_key(path, &fs::read(path)?)
        }
        Err(e) => Err(e.error.into()),
    }
}

fn parse_key(path: &Path, bytes: &[u8]) -> Result<[u8; KEY_LEN]> {
    bytes.try_into().map_err(|_| {
        GatehouseError::KeyFile(format!(
            "{} holds {} bytes, expected {}",
            path.display(),
            bytes.len(),
            KEY_LEN
        ))
    })
}
