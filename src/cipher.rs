//! Authenticated encryption between two secp256k1 keys.
//!
//! The envelope layer only needs `encrypt(plaintext, mine, theirs)` and the
//! matching `decrypt`; [`Cipher`] is that seam. [`ConversationCipher`] is the
//! shipped implementation: ECDH on the x-only keys, HKDF-SHA256 to a
//! conversation key, ChaCha20-Poly1305 with a random nonce.
//!
//! Payload layout (base64): `version(1) || nonce(12) || ciphertext || tag(16)`.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::{aead::Aead, ChaCha20Poly1305, KeyInit, Nonce};
use hkdf::Hkdf;
use secp256k1::{ecdh, Parity, PublicKey};
use sha2::Sha256;

use crate::{
    error::CryptoError,
    event::{parse_public_key, Keys},
};

const VERSION: u8 = 1;
const NONCE_LEN: usize = 12;
/// Version byte + nonce + Poly1305 tag.
const MIN_PAYLOAD_LEN: usize = 1 + NONCE_LEN + 16;
const KDF_SALT: &[u8] = b"reswire-conversation-v1";

/// Symmetric encryption keyed by one party's secret and the other's public key.
///
/// Implementations must be authenticated: a wrong key or a modified
/// ciphertext has to produce an error, never garbage plaintext.
pub trait Cipher {
    fn encrypt(&self, plaintext: &str, mine: &Keys, their_pubkey: &str)
        -> Result<String, CryptoError>;

    fn decrypt(&self, ciphertext: &str, mine: &Keys, their_pubkey: &str)
        -> Result<String, CryptoError>;
}

impl<C: Cipher + ?Sized> Cipher for &C {
    fn encrypt(&self, plaintext: &str, mine: &Keys, their_pubkey: &str) -> Result<String, CryptoError> {
        (**self).encrypt(plaintext, mine, their_pubkey)
    }

    fn decrypt(&self, ciphertext: &str, mine: &Keys, their_pubkey: &str) -> Result<String, CryptoError> {
        (**self).decrypt(ciphertext, mine, their_pubkey)
    }
}

/// ECDH + HKDF-SHA256 + ChaCha20-Poly1305.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConversationCipher;

impl ConversationCipher {
    /// Derive the symmetric key shared by `mine` and `their_pubkey`.
    ///
    /// Both sides arrive at the same key: x-only keys are lifted with even
    /// parity and only the x coordinate of the shared point is used.
    fn conversation_key(mine: &Keys, their_pubkey: &str) -> Result<[u8; 32], CryptoError> {
        let xonly = parse_public_key(their_pubkey).map_err(|e| CryptoError::Key(e.to_string()))?;
        let point = PublicKey::from_x_only_public_key(xonly, Parity::Even);
        let shared = ecdh::shared_secret_point(&point, &mine.secret_key());
        let hk = Hkdf::<Sha256>::new(Some(KDF_SALT), &shared[..32]);
        let mut key = [0u8; 32];
        hk.expand(b"conversation-key", &mut key)
            .map_err(|e| CryptoError::Key(e.to_string()))?;
        Ok(key)
    }
}

impl Cipher for ConversationCipher {
    fn encrypt(&self, plaintext: &str, mine: &Keys, their_pubkey: &str) -> Result<String, CryptoError> {
        let key = Self::conversation_key(mine, their_pubkey)?;
        let cipher = ChaCha20Poly1305::new_from_slice(&key).map_err(|e| CryptoError::Key(e.to_string()))?;
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let ciphertext = cipher
            .encrypt(&Nonce::from(nonce_bytes), plaintext.as_bytes())
            .map_err(|_| CryptoError::Encrypt)?;
        let mut out = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len());
        out.push(VERSION);
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(out))
    }

    fn decrypt(&self, ciphertext: &str, mine: &Keys, their_pubkey: &str) -> Result<String, CryptoError> {
        let data = STANDARD
            .decode(ciphertext)
            .map_err(|e| CryptoError::Decrypt(format!("base64: {e}")))?;
        if data.len() < MIN_PAYLOAD_LEN {
            return Err(CryptoError::Decrypt("payload too short".into()));
        }
        if data[0] != VERSION {
            return Err(CryptoError::Decrypt(format!("unknown version {}", data[0])));
        }
        let (nonce_bytes, body) = data[1..].split_at(NONCE_LEN);
        let key = Self::conversation_key(mine, their_pubkey)?;
        let cipher = ChaCha20Poly1305::new_from_slice(&key).map_err(|e| CryptoError::Key(e.to_string()))?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), body)
            .map_err(|_| CryptoError::Decrypt("authentication failed".into()))?;
        String::from_utf8(plaintext).map_err(|_| CryptoError::Decrypt("plaintext is not utf-8".into()))
    }
}
