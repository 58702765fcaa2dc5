//! Named X25519 identities and the sealed messages exchanged between them.

use std::collections::HashMap;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use parking_lot::RwLock;
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};

const NONCE_LEN: usize = 12;
const KEY_INFO: &[u8] = b"parley:text:v1";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("public key is not valid base64")]
    InvalidEncoding,
    #[error("public key must be 32 bytes, got {0}")]
    InvalidLength(usize),
    #[error("refusing to import a key under the local identity name `{0}`")]
    OwnName(String),
}

/// A named public key. Only the local identity is backed by a private key,
/// and that key never leaves its [`IdentityProvider`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub public_key: String,
    has_private_key: bool,
}

impl Identity {
    pub fn has_private_key(&self) -> bool {
        self.has_private_key
    }
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    fn own(&self) -> Identity;

    /// Seals `plaintext` for the named peer. `None` when the peer's key is
    /// unknown or sealing fails.
    async fn encrypt(&self, plaintext: &[u8], recipient: &str) -> Option<Vec<u8>>;

    /// Opens a message sealed by the named peer. `None` on any failure.
    async fn decrypt(&self, ciphertext: &[u8], sender: &str) -> Option<Vec<u8>>;

    /// Base64 of the local public key, as sent in `crypto_key`.
    async fn export_public_key(&self) -> String;

    async fn import_public_key(&self, name: &str, public_key: &str)
        -> Result<Identity, IdentityError>;

    /// Drops a previously imported key. Returns whether one was known.
    fn forget(&self, name: &str) -> bool;
}

/// X25519 agreement + HKDF-SHA256 + ChaCha20-Poly1305, keeping imported peer
/// keys in memory for the lifetime of the process.
pub struct SealedBoxIdentity {
    name: String,
    secret: StaticSecret,
    public: PublicKey,
    peers: RwLock<HashMap<String, PublicKey>>,
}

impl SealedBoxIdentity {
    pub fn generate(name: impl Into<String>) -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self {
            name: name.into(),
            secret,
            public,
            peers: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn peer_key(&self, name: &str) -> Option<PublicKey> {
        self.peers.read().get(name).copied()
    }

    /// Key and associated data for one direction of the conversation. Both
    /// ends arrive at the same pair for a given (sender, recipient).
    fn derive_cipher(
        &self,
        peer: &PublicKey,
        sender: &PublicKey,
        recipient: &PublicKey,
    ) -> Option<(ChaCha20Poly1305, [u8; 64])> {
        let shared = self.secret.diffie_hellman(peer);
        if !shared.was_contributory() {
            return None;
        }
        let mut context = [0u8; 64];
        context[..32].copy_from_slice(sender.as_bytes());
        context[32..].copy_from_slice(recipient.as_bytes());

        let hkdf = Hkdf::<Sha256>::new(Some(&context), shared.as_bytes());
        let mut key = [0u8; 32];
        hkdf.expand(KEY_INFO, &mut key).ok()?;
        let cipher = ChaCha20Poly1305::new_from_slice(&key).ok()?;
        Some((cipher, context))
    }

    fn seal(&self, plaintext: &[u8], recipient: &PublicKey) -> Option<Vec<u8>> {
        let (cipher, context) = self.derive_cipher(recipient, &self.public, recipient)?;
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &context,
                },
            )
            .ok()?;
        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Some(sealed)
    }

    fn open(&self, sealed: &[u8], sender: &PublicKey) -> Option<Vec<u8>> {
        if sealed.len() <= NONCE_LEN {
            return None;
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let (cipher, context) = self.derive_cipher(sender, sender, &self.public)?;
        cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: &context,
                },
            )
            .ok()
    }
}

#[async_trait]
impl IdentityProvider for SealedBoxIdentity {
    fn own(&self) -> Identity {
        Identity {
            name: self.name.clone(),
            public_key: STANDARD.encode(self.public.as_bytes()),
            has_private_key: true,
        }
    }

    async fn encrypt(&self, plaintext: &[u8], recipient: &str) -> Option<Vec<u8>> {
        let key = self.peer_key(recipient)?;
        self.seal(plaintext, &key)
    }

    async fn decrypt(&self, ciphertext: &[u8], sender: &str) -> Option<Vec<u8>> {
        let key = self.peer_key(sender)?;
        self.open(ciphertext, &key)
    }

    async fn export_public_key(&self) -> String {
        STANDARD.encode(self.public.as_bytes())
    }

    async fn import_public_key(
        &self,
        name: &str,
        public_key: &str,
    ) -> Result<Identity, IdentityError> {
        if name == self.name {
            return Err(IdentityError::OwnName(name.to_string()));
        }
        let bytes = STANDARD
            .decode(public_key.trim())
            .map_err(|_| IdentityError::InvalidEncoding)?;
        let raw: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| IdentityError::InvalidLength(bytes.len()))?;
        self.peers
            .write()
            .insert(name.to_string(), PublicKey::from(raw));
        Ok(Identity {
            name: name.to_string(),
            public_key: STANDARD.encode(raw),
            has_private_key: false,
        })
    }

    fn forget(&self, name: &str) -> bool {
        self.peers.write().remove(name).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn paired() -> (SealedBoxIdentity, SealedBoxIdentity) {
        let alice = SealedBoxIdentity::generate("alice");
        let bob = SealedBoxIdentity::generate("bob");
        bob.import_public_key("alice", &alice.export_public_key().await)
            .await
            .unwrap();
        alice
            .import_public_key("bob", &bob.export_public_key().await)
            .await
            .unwrap();
        (alice, bob)
    }

    #[test_timeout::tokio_timeout_test]
    async fn sealed_message_opens_for_recipient_only() {
        let (alice, bob) = paired().await;
        let carol = SealedBoxIdentity::generate("carol");
        carol
            .import_public_key("alice", &alice.export_public_key().await)
            .await
            .unwrap();

        let sealed = alice.encrypt(b"hi bob", "bob").await.expect("seal");
        assert_ne!(&sealed[NONCE_LEN..], b"hi bob");
        assert_eq!(bob.decrypt(&sealed, "alice").await.as_deref(), Some(&b"hi bob"[..]));
        assert_eq!(carol.decrypt(&sealed, "alice").await, None);
    }

    #[test_timeout::tokio_timeout_test]
    async fn unknown_or_forgotten_keys_yield_none() {
        let (alice, bob) = paired().await;
        assert_eq!(alice.encrypt(b"x", "dave").await, None);

        let sealed = alice.encrypt(b"hello", "bob").await.unwrap();
        assert!(bob.forget("alice"));
        assert!(!bob.forget("alice"));
        assert_eq!(bob.decrypt(&sealed, "alice").await, None);
    }

    #[test_timeout::tokio_timeout_test]
    async fn tampered_ciphertext_is_rejected() {
        let (alice, bob) = paired().await;
        let mut sealed = alice.encrypt(b"hello", "bob").await.unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert_eq!(bob.decrypt(&sealed, "alice").await, None);
        assert_eq!(bob.decrypt(&sealed[..4], "alice").await, None);
    }

    #[test_timeout::tokio_timeout_test]
    async fn import_validates_key_material() {
        let alice = SealedBoxIdentity::generate("alice");
        assert_eq!(
            alice.import_public_key("bob", "***").await,
            Err(IdentityError::InvalidEncoding)
        );
        assert_eq!(
            alice.import_public_key("bob", &STANDARD.encode([1u8; 8])).await,
            Err(IdentityError::InvalidLength(8))
        );
        assert!(matches!(
            alice
                .import_public_key("alice", &alice.export_public_key().await)
                .await,
            Err(IdentityError::OwnName(_))
        ));

        let bob = SealedBoxIdentity::generate("bob");
        let imported = alice
            .import_public_key("bob", &bob.export_public_key().await)
            .await
            .unwrap();
        assert!(!imported.has_private_key());
        assert!(alice.own().has_private_key());
        assert_eq!(imported.public_key, bob.own().public_key);
    }
}
