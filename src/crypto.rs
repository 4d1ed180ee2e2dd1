//! Session cryptography: ephemeral X25519 key exchange and AES-256-GCM framing.
//!
//! Each connection performs a single ephemeral Diffie-Hellman exchange during
//! DIAL/DIALCONF. The side whose ephemeral public key is lexicographically
//! larger is treated as the "server" for key-derivation purposes — this
//! breaks the symmetry of the shared secret without needing a prior notion
//! of client/server roles. Keys are expanded with HKDF-SHA256; every DATA
//! frame carries its own nonce as a trailer rather than relying on both ends
//! tracking a synchronized counter, since datagrams can be reordered or lost.

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use hkdf::Hkdf;
use rand_core::{OsRng, RngCore};
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey as DalekPublicKey, StaticSecret};
use zeroize::Zeroize;

/// Length of an X25519 public key in bytes.
pub const PUBLIC_KEY_LEN: usize = 32;
/// Length of the AES-256-GCM authentication tag in bytes.
pub const TAG_LEN: usize = 16;
/// Length of the nonce trailer carried on every DATA frame.
pub const NONCE_LEN: usize = 12;

/// Errors raised while performing the handshake or sealing/opening a frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    /// A key or nonce argument had the wrong length.
    #[error("expected {expected} bytes, got {got}")]
    BadLength {
        /// Bytes expected.
        expected: usize,
        /// Bytes actually supplied.
        got: usize,
    },
    /// AEAD authentication failed; the frame is either corrupt or forged.
    #[error("AEAD authentication failed")]
    AuthenticationFailed,
    /// HKDF output length expansion failed (should not happen for our fixed sizes).
    #[error("key derivation failed")]
    KeyDerivationFailed,
}

/// Ephemeral X25519 keypair generated fresh for a single handshake attempt.
pub struct EphemeralKeypair {
    secret: EphemeralSecret,
    public: DalekPublicKey,
}

impl EphemeralKeypair {
    /// Generate a new ephemeral keypair from the OS CSPRNG.
    #[must_use]
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = DalekPublicKey::from(&secret);
        Self { secret, public }
    }

    /// The public key to place in the DIAL/DIALCONF sealed box.
    #[must_use]
    pub fn public_bytes(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.public.to_bytes()
    }

    /// Consume this keypair and the peer's public key to derive a [`CryptoSession`].
    pub fn into_session(self, peer_public: &[u8]) -> Result<CryptoSession, CryptoError> {
        if peer_public.len() != PUBLIC_KEY_LEN {
            return Err(CryptoError::BadLength {
                expected: PUBLIC_KEY_LEN,
                got: peer_public.len(),
            });
        }
        let mut peer_bytes = [0u8; PUBLIC_KEY_LEN];
        peer_bytes.copy_from_slice(peer_public);
        let peer_key = DalekPublicKey::from(peer_bytes);

        let local_bytes = self.public.to_bytes();
        let is_server = local_bytes > peer_bytes;

        let mut shared = self.secret.diffie_hellman(&peer_key).to_bytes();
        let session = CryptoSession::derive(&shared, &local_bytes, &peer_bytes, is_server)?;
        shared.zeroize();
        Ok(session)
    }
}

/// A long-lived identity keypair, supplied by the caller at dial/listen time
/// and used only to address sealed boxes during the handshake — it never
/// touches the per-connection AEAD keys directly. `Clone` so a
/// [`crate::factory::TransportFactory`] can share one identity across every
/// connection it creates.
#[derive(Clone)]
pub struct StaticKeypair {
    secret: StaticSecret,
    public: DalekPublicKey,
}

impl StaticKeypair {
    /// Generate a fresh static identity from the OS CSPRNG.
    #[must_use]
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = DalekPublicKey::from(&secret);
        Self { secret, public }
    }

    /// The public half, to be shared with peers out of band.
    #[must_use]
    pub fn public_bytes(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.public.to_bytes()
    }

    /// Open a box addressed to this identity's public key.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        open_box(&self.secret, &self.public.to_bytes(), sealed)
    }
}

/// Anonymously encrypt `plaintext` to `recipient_static_pk`: a fresh one-time
/// X25519 keypair is generated, its public key is prepended to the output so
/// the recipient can recover the shared secret, and the body is sealed with
/// a single-use (all-zero) nonce — safe because the per-message key is never
/// reused.
pub fn seal_box(plaintext: &[u8], recipient_static_pk: &[u8; PUBLIC_KEY_LEN]) -> Vec<u8> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_pub = DalekPublicKey::from(&ephemeral);
    let recipient = DalekPublicKey::from(*recipient_static_pk);

    let mut shared = ephemeral.diffie_hellman(&recipient).to_bytes();
    let key = box_key(&shared, &ephemeral_pub.to_bytes(), recipient_static_pk);
    shared.zeroize();

    let cipher = Aes256Gcm::new_from_slice(&key).expect("32-byte key");
    let nonce = Nonce::from_slice(&[0u8; NONCE_LEN]);
    let sealed = cipher
        .encrypt(nonce, plaintext)
        .expect("sealed-box encryption cannot fail for a fresh key");

    let mut out = Vec::with_capacity(PUBLIC_KEY_LEN + sealed.len());
    out.extend_from_slice(&ephemeral_pub.to_bytes());
    out.extend_from_slice(&sealed);
    out
}

/// Open a box sealed with [`seal_box`] using the recipient's static secret.
pub fn open_box(
    local_static_secret: &StaticSecret,
    local_static_pk: &[u8; PUBLIC_KEY_LEN],
    sealed: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < PUBLIC_KEY_LEN + TAG_LEN {
        return Err(CryptoError::BadLength {
            expected: PUBLIC_KEY_LEN + TAG_LEN,
            got: sealed.len(),
        });
    }
    let mut sender_pub = [0u8; PUBLIC_KEY_LEN];
    sender_pub.copy_from_slice(&sealed[..PUBLIC_KEY_LEN]);
    let sender_key = DalekPublicKey::from(sender_pub);

    let mut shared = local_static_secret.diffie_hellman(&sender_key).to_bytes();
    let key = box_key(&shared, &sender_pub, local_static_pk);
    shared.zeroize();

    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| CryptoError::KeyDerivationFailed)?;
    let nonce = Nonce::from_slice(&[0u8; NONCE_LEN]);
    cipher
        .decrypt(nonce, &sealed[PUBLIC_KEY_LEN..])
        .map_err(|_| CryptoError::AuthenticationFailed)
}

fn box_key(shared_secret: &[u8; 32], sender_pub: &[u8; 32], recipient_pub: &[u8; 32]) -> [u8; 32] {
    let hkdf = Hkdf::<Sha256>::new(None, shared_secret);
    let mut salt = Vec::with_capacity(64);
    salt.extend_from_slice(sender_pub);
    salt.extend_from_slice(recipient_pub);
    let mut key = [0u8; 32];
    hkdf.expand(&salt, &mut key)
        .expect("32-byte okm is always valid for HKDF-SHA256");
    key
}

/// An established, directional pair of AEAD keys plus per-direction nonce counters.
pub struct CryptoSession {
    send_cipher: Aes256Gcm,
    recv_cipher: Aes256Gcm,
    send_counter: u128,
}

impl CryptoSession {
    fn derive(
        shared_secret: &[u8; 32],
        local_pub: &[u8; PUBLIC_KEY_LEN],
        remote_pub: &[u8; PUBLIC_KEY_LEN],
        is_server: bool,
    ) -> Result<Self, CryptoError> {
        let (larger, smaller) = if is_server {
            (local_pub, remote_pub)
        } else {
            (remote_pub, local_pub)
        };

        let hkdf = Hkdf::<Sha256>::new(None, shared_secret);
        let mut okm = [0u8; 64];
        let mut salt_input = Vec::with_capacity(PUBLIC_KEY_LEN * 2);
        salt_input.extend_from_slice(larger);
        salt_input.extend_from_slice(smaller);
        hkdf.expand(&salt_input, &mut okm)
            .map_err(|_| CryptoError::KeyDerivationFailed)?;

        let (server_key, client_key) = okm.split_at(32);
        let (send_bytes, recv_bytes) = if is_server {
            (server_key, client_key)
        } else {
            (client_key, server_key)
        };

        let send_cipher =
            Aes256Gcm::new_from_slice(send_bytes).map_err(|_| CryptoError::KeyDerivationFailed)?;
        let recv_cipher =
            Aes256Gcm::new_from_slice(recv_bytes).map_err(|_| CryptoError::KeyDerivationFailed)?;

        Ok(Self {
            send_cipher,
            recv_cipher,
            send_counter: 0,
        })
    }

    /// Seal `plaintext` for transmission, returning `(ciphertext, tag, nonce)`.
    /// `aad` is the 20-byte DATA-frame prefix covering the envelope,
    /// connection ids, stream id, and packet number (the stream offset is
    /// not bound into the AAD).
    pub fn seal(
        &mut self,
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<(Vec<u8>, [u8; TAG_LEN], [u8; NONCE_LEN]), CryptoError> {
        let nonce_bytes = next_nonce(&mut self.send_counter);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let mut sealed = self
            .send_cipher
            .encrypt(nonce, Payload { msg: plaintext, aad })
            .map_err(|_| CryptoError::AuthenticationFailed)?;

        let tag_bytes = sealed.split_off(sealed.len() - TAG_LEN);
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&tag_bytes);

        Ok((sealed, tag, nonce_bytes))
    }

    /// Open a frame sealed by the peer. The nonce travels with the frame
    /// rather than being reconstructed locally, so out-of-order or lost
    /// datagrams never desynchronize decryption.
    pub fn open(
        &self,
        ciphertext: &[u8],
        tag: &[u8; TAG_LEN],
        nonce: &[u8; NONCE_LEN],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let mut combined = Vec::with_capacity(ciphertext.len() + TAG_LEN);
        combined.extend_from_slice(ciphertext);
        combined.extend_from_slice(tag);

        self.recv_cipher
            .decrypt(Nonce::from_slice(nonce), Payload { msg: &combined, aad })
            .map_err(|_| CryptoError::AuthenticationFailed)
    }
}

fn next_nonce(counter: &mut u128) -> [u8; NONCE_LEN] {
    let bytes = counter.to_be_bytes();
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&bytes[bytes.len() - NONCE_LEN..]);
    *counter += 1;
    nonce
}

/// Generate `n` random bytes from the OS CSPRNG, used for connection ids.
#[must_use]
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    OsRng.fill_bytes(&mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_derives_matching_complementary_sessions() {
        let alice = EphemeralKeypair::generate();
        let bob = EphemeralKeypair::generate();
        let alice_pub = alice.public_bytes();
        let bob_pub = bob.public_bytes();

        let mut alice_session = alice.into_session(&bob_pub).unwrap();
        let bob_session = bob.into_session(&alice_pub).unwrap();

        let aad = b"envelope-prefix";
        let (ciphertext, tag, nonce) = alice_session.seal(b"hello bob", aad).unwrap();
        let plaintext = bob_session.open(&ciphertext, &tag, &nonce, aad).unwrap();
        assert_eq!(plaintext, b"hello bob");
    }

    #[test]
    fn tampered_tag_fails_to_open() {
        let alice = EphemeralKeypair::generate();
        let bob = EphemeralKeypair::generate();
        let alice_pub = alice.public_bytes();
        let bob_pub = bob.public_bytes();

        let mut alice_session = alice.into_session(&bob_pub).unwrap();
        let bob_session = bob.into_session(&alice_pub).unwrap();

        let aad = b"envelope-prefix";
        let (ciphertext, mut tag, nonce) = alice_session.seal(b"hello bob", aad).unwrap();
        tag[0] ^= 0xFF;
        assert!(bob_session.open(&ciphertext, &tag, &nonce, aad).is_err());
    }

    #[test]
    fn nonce_counter_increments_per_seal() {
        let alice = EphemeralKeypair::generate();
        let bob = EphemeralKeypair::generate();
        let bob_pub = bob.public_bytes();
        let mut alice_session = alice.into_session(&bob_pub).unwrap();

        let (_, _, nonce1) = alice_session.seal(b"one", b"aad").unwrap();
        let (_, _, nonce2) = alice_session.seal(b"two", b"aad").unwrap();
        assert_ne!(nonce1, nonce2);
    }

    #[test]
    fn sealed_box_roundtrips_through_recipient_static_key() {
        let recipient = StaticKeypair::generate();
        let recipient_pub = recipient.public_bytes();

        let handshake_ephemeral = EphemeralKeypair::generate();
        let payload = handshake_ephemeral.public_bytes();

        let sealed = seal_box(&payload, &recipient_pub);
        let opened = recipient.open(&sealed).unwrap();
        assert_eq!(opened, payload);
    }

    #[test]
    fn sealed_box_rejects_wrong_recipient() {
        let recipient = StaticKeypair::generate();
        let impostor = StaticKeypair::generate();
        let sealed = seal_box(b"dial payload", &recipient.public_bytes());
        assert!(impostor.open(&sealed).is_err());
    }
}
