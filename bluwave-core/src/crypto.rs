//! Crypto session: keypairs, device ID, key exchange, group key, AEAD envelopes.

use chacha20poly1305::aead::{Aead, KeyInit};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroize;

/// AEAD nonce length (ChaCha20-Poly1305, 96 bits).
pub const NONCE_LEN: usize = 12;
/// AEAD authentication tag length (128 bits).
pub const TAG_LEN: usize = 16;

/// Device public key (32 bytes, X25519). Serializable for handshake and announce.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "bytes_32")] [u8; 32]);

mod bytes_32 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    pub fn serialize<S: Serializer>(v: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        v.as_slice().serialize(serializer)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let buf: Vec<u8> = Deserialize::deserialize(d)?;
        buf.try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PublicKey(bytes)
    }
}

/// Device ID: deterministic hash of public key. The stable address a device is
/// known by across discovery, connection and relay.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct DeviceId(#[serde(with = "bytes_16")] [u8; 16]);

mod bytes_16 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    pub fn serialize<S: Serializer>(v: &[u8; 16], serializer: S) -> Result<S::Ok, S::Error> {
        v.as_slice().serialize(serializer)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 16], D::Error> {
        let buf: Vec<u8> = Deserialize::deserialize(d)?;
        buf.try_into()
            .map_err(|_| serde::de::Error::custom("expected 16 bytes"))
    }
}

impl DeviceId {
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Derive device ID from a public key (same as Keypair does).
    pub fn from_public_key(public: &[u8; 32]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(public);
        let digest = hasher.finalize();
        let mut id = [0u8; 16];
        id.copy_from_slice(&digest[..16]);
        DeviceId(id)
    }

    /// Short hex form for logs.
    pub fn short(&self) -> String {
        self.0[..4].iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.short())
    }
}

/// X25519 keypair. Keep secret key private; expose only public key and device ID.
pub struct Keypair {
    secret: StaticSecret,
    public: PublicKey,
    device_id: DeviceId,
}

impl Keypair {
    /// Generate a new random keypair and derive device ID from public key.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public_x = X25519PublicKey::from(&secret);
        let public = PublicKey(public_x.to_bytes());
        let device_id = DeviceId::from_public_key(public.as_bytes());
        Self {
            secret,
            public,
            device_id,
        }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    /// Shared secret with another device's public key. Deterministic and
    /// symmetric: both sides compute the same bytes.
    pub fn shared_secret(&self, other_public: &PublicKey) -> [u8; 32] {
        let other = X25519PublicKey::from(other_public.0);
        self.secret.diffie_hellman(&other).to_bytes()
    }
}

/// Derive the 256-bit group key from a pairwise shared secret.
///
/// Deterministic on the shared secret: every participant that holds the same
/// pairwise secret derives the identical key. Host and first peer each derive
/// it independently; later peers receive it wrapped (see [`CryptoSession::wrap_group_key`]).
pub fn derive_group_key(shared_secret: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"bluwave-group-v1");
    hasher.update(shared_secret);
    hasher.finalize().into()
}

/// Derive the pairwise key used to wrap the group key for one peer.
pub fn derive_pair_key(shared_secret: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"bluwave-pair-v1");
    hasher.update(shared_secret);
    hasher.finalize().into()
}

/// Encrypt under `key` with a fresh random 96-bit nonce.
/// Output layout: `nonce || ciphertext+tag` — exactly one wire frame body.
pub fn seal(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher =
        chacha20poly1305::ChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::Key)?;
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let nonce_arr =
        chacha20poly1305::aead::Nonce::<chacha20poly1305::ChaCha20Poly1305>::from_slice(&nonce);
    let ciphertext = cipher
        .encrypt(nonce_arr, plaintext)
        .map_err(|_| CryptoError::Encrypt)?;
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a `nonce || ciphertext+tag` envelope. Fails closed: any format or
/// tag error yields [`CryptoError::Authentication`] and no plaintext.
pub fn open(key: &[u8; 32], envelope: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if envelope.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::Authentication);
    }
    let (nonce, ciphertext) = envelope.split_at(NONCE_LEN);
    let cipher =
        chacha20poly1305::ChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::Key)?;
    let nonce_arr =
        chacha20poly1305::aead::Nonce::<chacha20poly1305::ChaCha20Poly1305>::from_slice(nonce);
    cipher
        .decrypt(nonce_arr, ciphertext)
        .map_err(|_| CryptoError::Authentication)
}

/// Per-session crypto state: own keypair plus the optional group key.
pub struct CryptoSession {
    keypair: Keypair,
    group_key: Option<[u8; 32]>,
}

impl CryptoSession {
    pub fn new(keypair: Keypair) -> Self {
        Self {
            keypair,
            group_key: None,
        }
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn has_group_key(&self) -> bool {
        self.group_key.is_some()
    }

    pub fn set_group_key(&mut self, key: [u8; 32]) {
        self.group_key = Some(key);
    }

    /// Host side: establish the group key from the first peer's exchange.
    /// Subsequent calls keep the existing key. Returns the active key.
    pub fn establish_group_key(&mut self, peer_public: &PublicKey) -> [u8; 32] {
        if let Some(key) = self.group_key {
            return key;
        }
        let mut shared = self.keypair.shared_secret(peer_public);
        let key = derive_group_key(&shared);
        shared.zeroize();
        self.group_key = Some(key);
        key
    }

    /// Wrap the group key for one peer under the pairwise key from its exchange.
    pub fn wrap_group_key(&self, peer_public: &PublicKey) -> Result<Vec<u8>, CryptoError> {
        let key = self.group_key.ok_or(CryptoError::NoGroupKey)?;
        let mut shared = self.keypair.shared_secret(peer_public);
        let pair_key = derive_pair_key(&shared);
        shared.zeroize();
        seal(&pair_key, &key)
    }

    /// Unwrap a group key delivered by the host and install it.
    pub fn unwrap_group_key(
        &mut self,
        host_public: &PublicKey,
        wrapped: &[u8],
    ) -> Result<(), CryptoError> {
        let mut shared = self.keypair.shared_secret(host_public);
        let pair_key = derive_pair_key(&shared);
        shared.zeroize();
        let plain = open(&pair_key, wrapped)?;
        let key: [u8; 32] = plain
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::Authentication)?;
        self.group_key = Some(key);
        Ok(())
    }

    /// Encrypt a chat payload under the group key. One envelope per call,
    /// fresh random nonce each time.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let key = self.group_key.ok_or(CryptoError::NoGroupKey)?;
        seal(&key, plaintext)
    }

    /// Decrypt a chat envelope under the group key.
    pub fn decrypt(&self, envelope: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let key = self.group_key.ok_or(CryptoError::NoGroupKey)?;
        open(&key, envelope)
    }

    /// Zero the group key. The keypair's secret zeroizes on drop.
    pub fn clear_keys(&mut self) {
        if let Some(mut key) = self.group_key.take() {
            key.zeroize();
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("no group key established")]
    NoGroupKey,
    #[error("invalid key")]
    Key,
    #[error("encryption failed")]
    Encrypt,
    #[error("authentication failed")]
    Authentication,
}
