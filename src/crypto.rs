// Passphrase-based authenticated encryption for snapshot containers.
// Keys are derived per container with Argon2id and a random salt; the cipher is
// ChaCha20-Poly1305, with the container header bound in as associated data.

use argon2::Argon2;
use chacha20poly1305::{
    aead::{rand_core::RngCore, Aead, AeadCore, KeyInit, OsRng, Payload},
    ChaCha20Poly1305, Nonce,
};
use zeroize::Zeroizing;

use crate::error::{Error, Result};

pub const KEY_SIZE: usize = 32; // 256 bits for ChaCha20Poly1305
pub const NONCE_SIZE: usize = 12; // 96 bits for ChaCha20Poly1305
pub const SALT_SIZE: usize = 16; // 128 bits salt for Argon2

/// Secret supplied by a credential collaborator. Wiped from memory on drop.
#[derive(Clone)]
pub struct Passphrase(Zeroizing<String>);

impl Passphrase {
    pub fn new(secret: impl Into<String>) -> Result<Self> {
        let secret = secret.into();
        if secret.is_empty() {
            return Err(Error::Config {
                reason: "passphrase must not be empty".to_string(),
            });
        }
        Ok(Self(Zeroizing::new(secret)))
    }

    fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl std::fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Passphrase(***)")
    }
}

pub fn random_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    OsRng.fill_bytes(&mut salt);
    salt
}

fn derive_key(passphrase: &Passphrase, salt: &[u8]) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    Argon2::default()
        .hash_password_into(passphrase.as_bytes(), salt, &mut key[..])
        .map_err(|e| Error::Config {
            reason: format!("key derivation failed: {e}"),
        })?;
    Ok(key)
}

/// Encrypt `plaintext`, authenticating `aad` alongside it.
/// Returns the nonce used and the ciphertext (with its 16-byte tag).
pub fn seal(
    passphrase: &Passphrase,
    salt: &[u8],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<([u8; NONCE_SIZE], Vec<u8>)> {
    let key = derive_key(passphrase, salt)?;
    let cipher = ChaCha20Poly1305::new_from_slice(&key[..]).map_err(|_| Error::Config {
        reason: "invalid key size".to_string(),
    })?;
    let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, Payload { msg: plaintext, aad })
        .map_err(|_| Error::Encode {
            reason: "encryption failed".to_string(),
        })?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    nonce_bytes.copy_from_slice(nonce.as_slice());
    Ok((nonce_bytes, ciphertext))
}

/// Decrypt and authenticate. Any tampering, or a wrong passphrase, yields
/// [`Error::Authentication`].
pub fn open(
    passphrase: &Passphrase,
    salt: &[u8],
    nonce: &[u8],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>> {
    if nonce.len() != NONCE_SIZE {
        return Err(Error::decode("bad nonce length"));
    }
    let key = derive_key(passphrase, salt)?;
    let cipher = ChaCha20Poly1305::new_from_slice(&key[..]).map_err(|_| Error::Config {
        reason: "invalid key size".to_string(),
    })?;
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| Error::Authentication)
}
