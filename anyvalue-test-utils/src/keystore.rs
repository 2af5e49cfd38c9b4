//! In-process envelope keystore backed by P-256 ECIES and AES-256-GCM.
//!
//! Each envelope gets a fresh 32-byte content key. The payload is sealed with
//! AES-GCM (nonce prepended); the content key is wrapped for every recipient
//! with an ephemeral ECDH exchange and an HKDF-derived AES key. A wrapped key is
//! the 65-byte uncompressed ephemeral point followed by the sealed content key.

use std::collections::HashMap;

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use anyhow::{anyhow, bail, Result};
use anyvalue_common::compact_ids::compact_id;
use anyvalue_common::logging::{Component, Logger};
use anyvalue_serializer::{EnvelopeCrypto, EnvelopeEncryptedData, KeystoreCapabilities};
use hkdf::Hkdf;
use p256::ecdh::{diffie_hellman, EphemeralSecret};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use rand::{thread_rng, RngCore};
use sha2::Sha256;

const NONCE_LEN: usize = 12;
const CONTENT_KEY_LEN: usize = 32;
const UNCOMPRESSED_POINT_LEN: usize = 65;
const KEY_WRAP_INFO: &[u8] = b"anyvalue-key-encryption";

/// Fresh P-256 key pair; the public half is SEC1 uncompressed.
pub fn generate_key_pair() -> (SecretKey, Vec<u8>) {
    let secret = SecretKey::random(&mut thread_rng());
    let public = public_key_bytes(&secret);
    (secret, public)
}

pub fn public_key_bytes(secret: &SecretKey) -> Vec<u8> {
    secret
        .public_key()
        .to_encoded_point(false)
        .as_bytes()
        .to_vec()
}

/// Keystore holding network and profile private keys, indexed by the compact
/// id of their public key.
///
/// ⚠️  WARNING: This is for TESTING ONLY. Keys live in process memory.
pub struct TestKeyStore {
    network_keys: HashMap<String, SecretKey>,
    profile_keys: HashMap<String, SecretKey>,
    encrypt_enabled: bool,
    decrypt_enabled: bool,
    logger: Logger,
}

impl TestKeyStore {
    pub fn new() -> Self {
        Self {
            network_keys: HashMap::new(),
            profile_keys: HashMap::new(),
            encrypt_enabled: true,
            decrypt_enabled: true,
            logger: Logger::new_root(Component::Keys, "test-keystore"),
        }
    }

    pub fn with_logger(mut self, logger: &Logger) -> Self {
        self.logger = logger.with_component(Component::Keys);
        self
    }

    pub fn with_network_key(mut self, secret: SecretKey) -> Self {
        let id = compact_id(&public_key_bytes(&secret));
        self.network_keys.insert(id, secret);
        self
    }

    pub fn with_profile_key(mut self, secret: SecretKey) -> Self {
        let id = compact_id(&public_key_bytes(&secret));
        self.profile_keys.insert(id, secret);
        self
    }

    /// Report `can_encrypt = false` and refuse to seal envelopes.
    pub fn without_encrypt(mut self) -> Self {
        self.encrypt_enabled = false;
        self
    }

    /// Report `can_decrypt = false` and refuse to open envelopes.
    pub fn without_decrypt(mut self) -> Self {
        self.decrypt_enabled = false;
        self
    }

    fn open_content_key(&self, env: &EnvelopeEncryptedData) -> Result<Vec<u8>> {
        if let Some(network_id) = &env.network_id {
            if let Some(secret) = self
                .network_keys
                .get(network_id)
                .filter(|_| !env.network_encrypted_key.is_empty())
            {
                self.logger
                    .debug_args(format_args!("opening envelope with network key {network_id}"));
                return unwrap_key(secret, &env.network_encrypted_key);
            }
        }
        for (profile_id, wrapped) in &env.profile_encrypted_keys {
            if let Some(secret) = self.profile_keys.get(profile_id) {
                self.logger
                    .debug_args(format_args!("opening envelope with profile key {profile_id}"));
                return unwrap_key(secret, wrapped);
            }
        }
        Err(anyhow!("none of the envelope recipients is held by this keystore"))
    }
}

impl Default for TestKeyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvelopeCrypto for TestKeyStore {
    fn encrypt_with_envelope(
        &self,
        data: &[u8],
        network_public_key: Option<&[u8]>,
        profile_public_keys: Vec<Vec<u8>>,
    ) -> Result<EnvelopeEncryptedData> {
        if !self.encrypt_enabled {
            bail!("encryption is disabled for this keystore");
        }
        if network_public_key.is_none() && profile_public_keys.is_empty() {
            bail!("envelope needs at least one recipient");
        }

        let mut content_key = [0u8; CONTENT_KEY_LEN];
        thread_rng().fill_bytes(&mut content_key);
        let encrypted_data = seal(&content_key, data)?;

        let (network_id, network_encrypted_key) = match network_public_key {
            Some(public_key) => (Some(compact_id(public_key)), wrap_key(&content_key, public_key)?),
            None => (None, Vec::new()),
        };

        let mut profile_encrypted_keys = HashMap::with_capacity(profile_public_keys.len());
        for public_key in &profile_public_keys {
            profile_encrypted_keys.insert(compact_id(public_key), wrap_key(&content_key, public_key)?);
        }

        self.logger.debug_args(format_args!(
            "sealed {} bytes for {} profile recipient(s), network: {}",
            data.len(),
            profile_encrypted_keys.len(),
            network_id.as_deref().unwrap_or("none")
        ));

        Ok(EnvelopeEncryptedData {
            encrypted_data,
            network_id,
            network_encrypted_key,
            profile_encrypted_keys,
        })
    }

    fn decrypt_envelope_data(&self, env: &EnvelopeEncryptedData) -> Result<Vec<u8>> {
        if !self.decrypt_enabled {
            bail!("decryption is disabled for this keystore");
        }
        let content_key = self.open_content_key(env)?;
        open(&content_key, &env.encrypted_data)
    }

    fn get_keystore_capabilities(&self) -> KeystoreCapabilities {
        let has_profile_keys = !self.profile_keys.is_empty();
        let has_network_keys = !self.network_keys.is_empty();
        KeystoreCapabilities {
            has_profile_keys,
            has_network_keys,
            can_encrypt: self.encrypt_enabled,
            can_decrypt: self.decrypt_enabled && (has_profile_keys || has_network_keys),
        }
    }
}

fn wrap_key(content_key: &[u8], recipient_public_key: &[u8]) -> Result<Vec<u8>> {
    let recipient = PublicKey::from_sec1_bytes(recipient_public_key)
        .map_err(|e| anyhow!("invalid recipient public key: {e}"))?;

    let ephemeral = EphemeralSecret::random(&mut thread_rng());
    let shared = ephemeral.diffie_hellman(&recipient);
    let wrapping_key = derive_wrapping_key(shared.raw_secret_bytes().as_slice())?;

    let mut wrapped = ephemeral
        .public_key()
        .to_encoded_point(false)
        .as_bytes()
        .to_vec();
    wrapped.extend_from_slice(&seal(&wrapping_key, content_key)?);
    Ok(wrapped)
}

fn unwrap_key(secret: &SecretKey, wrapped: &[u8]) -> Result<Vec<u8>> {
    if wrapped.len() < UNCOMPRESSED_POINT_LEN {
        bail!("wrapped key too short for ECIES");
    }
    let (point, sealed) = wrapped.split_at(UNCOMPRESSED_POINT_LEN);
    let ephemeral = PublicKey::from_sec1_bytes(point)
        .map_err(|e| anyhow!("invalid ephemeral public key: {e}"))?;

    let shared = diffie_hellman(secret.to_nonzero_scalar(), ephemeral.as_affine());
    let wrapping_key = derive_wrapping_key(shared.raw_secret_bytes().as_slice())?;
    open(&wrapping_key, sealed)
}

fn derive_wrapping_key(shared_secret: &[u8]) -> Result<[u8; CONTENT_KEY_LEN]> {
    let hk = Hkdf::<Sha256>::new(None, shared_secret);
    let mut key = [0u8; CONTENT_KEY_LEN];
    hk.expand(KEY_WRAP_INFO, &mut key)
        .map_err(|e| anyhow!("HKDF expansion failed: {e}"))?;
    Ok(key)
}

fn seal(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| anyhow!("invalid AES key: {e}"))?;
    let mut nonce = [0u8; NONCE_LEN];
    thread_rng().fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| anyhow!("AES-GCM encryption failed: {e}"))?;

    let mut sealed = nonce.to_vec();
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

fn open(key: &[u8], sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < NONCE_LEN {
        bail!("ciphertext too short (missing nonce)");
    }
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| anyhow!("invalid AES key: {e}"))?;
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|e| anyhow!("AES-GCM decryption failed: {e}"))
}
