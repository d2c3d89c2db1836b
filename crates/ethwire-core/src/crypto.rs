//! Cryptographic primitives for the RLPx transport.
//!
//! Provides four things:
//!   1. Keccak-256 hashing and secp256k1 node identities
//!   2. ECIES encryption of the auth/ack handshake messages
//!   3. The RLPx auth/ack handshake, producing per-connection secrets
//!   4. The Keccak running MAC that authenticates every frame
//!
//! Long-term and ephemeral secret keys are erased when dropped.
//! There is no unsafe code in this module.

use std::fmt;
use std::path::{Path, PathBuf};

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
use aes::{Aes128, Aes256Enc};
use ethereum_types::{H128, H256, H512};
use hmac::{Hmac, Mac};
use rand::Rng;
use rlp::{Rlp, RlpStream};
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{Message, PublicKey, SecretKey, SECP256K1};
use sha2::{Digest, Sha256};
use sha3::Keccak256;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::wire::AUTH_VERSION;

type Aes128Ctr = ctr::Ctr64BE<Aes128>;

// ── Hashing ───────────────────────────────────────────────────────────────────

/// Keccak-256 of a byte slice. Used for block hashes, chunk hashes, and
/// every secret derivation in the handshake.
pub fn keccak256(data: &[u8]) -> H256 {
    keccak_hash::keccak(data)
}

fn xor32(a: H256, b: H256) -> H256 {
    let mut out = a;
    for (o, x) in out.0.iter_mut().zip(b.0.iter()) {
        *o ^= x;
    }
    out
}

/// A fresh random 32-byte handshake nonce.
pub fn random_nonce() -> H256 {
    H256::from(rand::random::<[u8; 32]>())
}

// ── Identity ──────────────────────────────────────────────────────────────────

/// A node's identity on the wire: its uncompressed secp256k1 public key
/// without the leading 0x04 tag.
pub type NodeId = H512;

/// Node id of a public key.
pub fn node_id(public: &PublicKey) -> NodeId {
    H512::from_slice(&public.serialize_uncompressed()[1..])
}

/// Public key from a node id. Fails if the 64 bytes are not a curve point.
pub fn public_key(id: &NodeId) -> Result<PublicKey, CryptoError> {
    let mut bytes = [0u8; 65];
    bytes[0] = 0x04;
    bytes[1..].copy_from_slice(id.as_bytes());
    PublicKey::from_slice(&bytes).map_err(|_| CryptoError::InvalidPublicKey)
}

/// First 8 bytes of a node id, hex encoded. Used in logs.
pub fn short_id(id: &NodeId) -> String {
    hex::encode(&id.as_bytes()[..8])
}

/// A node's long-term secp256k1 keypair.
///
/// Generated once and stored at `identity.key_path`. The node id derived
/// from the public key is what peers dial and what Hello advertises.
pub struct Keypair {
    secret: SecretKey,
    public: PublicKey,
}

impl Keypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        Self::from_secret_key(SecretKey::new(&mut secp256k1::rand::thread_rng()))
    }

    pub fn from_secret_key(secret: SecretKey) -> Self {
        let public = PublicKey::from_secret_key(SECP256K1, &secret);
        Self { secret, public }
    }

    /// Reconstruct a keypair from stored private key bytes.
    pub fn from_private(private_bytes: [u8; 32]) -> Result<Self, CryptoError> {
        let private_bytes = Zeroizing::new(private_bytes);
        let secret =
            SecretKey::from_slice(&private_bytes[..]).map_err(|_| CryptoError::InvalidSecretKey)?;
        Ok(Self::from_secret_key(secret))
    }

    /// Serialize the private key for persistent storage.
    pub fn private_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.secret.secret_bytes())
    }

    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    pub fn node_id(&self) -> NodeId {
        node_id(&self.public)
    }

    pub(crate) fn secret(&self) -> &SecretKey {
        &self.secret
    }

    /// Load the keypair stored at `path`, or generate and store a new one.
    pub fn load_or_generate(path: &Path) -> Result<Self, CryptoError> {
        if path.exists() {
            let bytes = Zeroizing::new(
                std::fs::read(path).map_err(|e| CryptoError::KeyIo(path.to_path_buf(), e))?,
            );
            let private: [u8; 32] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| CryptoError::InvalidSecretKey)?;
            return Self::from_private(private);
        }

        let keypair = Self::generate();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CryptoError::KeyIo(path.to_path_buf(), e))?;
        }
        std::fs::write(path, &keypair.private_bytes()[..])
            .map_err(|e| CryptoError::KeyIo(path.to_path_buf(), e))?;
        tracing::info!(path = %path.display(), "generated new node key");
        Ok(keypair)
    }
}

impl Drop for Keypair {
    fn drop(&mut self) {
        self.secret.non_secure_erase();
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("node_id", &short_id(&self.node_id()))
            .finish_non_exhaustive()
    }
}

/// ECDH agreement: the x coordinate of `secret * public`.
pub fn ecdh(secret: &SecretKey, public: &PublicKey) -> H256 {
    H256::from_slice(&secp256k1::ecdh::shared_secret_point(public, secret)[..32])
}

// ── ECIES ─────────────────────────────────────────────────────────────────────

/// R (65) + iv (16) + tag (32).
const ECIES_OVERHEAD: usize = 65 + 16 + 32;

/// Encrypt `plain` to `remote`.
///
/// Output layout: `size (2, BE) || R (65) || iv (16) || ciphertext || tag (32)`,
/// where `size` counts everything after itself and is also authenticated.
pub fn ecies_encrypt(remote: &PublicKey, plain: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let ephemeral = SecretKey::new(&mut secp256k1::rand::thread_rng());
    let iv: [u8; 16] = rand::random();
    let (ke, km) = ecies_kdf(&ecdh(&ephemeral, remote))?;

    let mut cipher_text = plain.to_vec();
    <Aes128Ctr as KeyIvInit>::new(
        GenericArray::from_slice(ke.as_bytes()),
        GenericArray::from_slice(&iv),
    )
    .apply_keystream(&mut cipher_text);

    let size = u16::try_from(ECIES_OVERHEAD + cipher_text.len())
        .map_err(|_| CryptoError::MessageTooLarge(plain.len()))?;
    let size_bytes = size.to_be_bytes();
    let tag = ecies_mac(&km, &iv, &cipher_text, &size_bytes)?.finalize().into_bytes();

    let mut out = Vec::with_capacity(2 + size as usize);
    out.extend_from_slice(&size_bytes);
    out.extend_from_slice(&PublicKey::from_secret_key(SECP256K1, &ephemeral).serialize_uncompressed());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&cipher_text);
    out.extend_from_slice(&tag);
    Ok(out)
}

/// Decrypt a message produced by [`ecies_encrypt`], size prefix included.
pub fn ecies_decrypt(secret: &SecretKey, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if message.len() < 2 {
        return Err(CryptoError::Truncated);
    }
    let (size_bytes, body) = message.split_at(2);
    let size = u16::from_be_bytes([size_bytes[0], size_bytes[1]]) as usize;
    if size < ECIES_OVERHEAD || body.len() < size {
        return Err(CryptoError::Truncated);
    }
    let body = &body[..size];

    let (r, rest) = body.split_at(65);
    let (iv, rest) = rest.split_at(16);
    let (cipher_text, tag) = rest.split_at(rest.len() - 32);

    let r = PublicKey::from_slice(r).map_err(|_| CryptoError::InvalidPublicKey)?;
    let (ke, km) = ecies_kdf(&ecdh(secret, &r))?;
    ecies_mac(&km, iv, cipher_text, size_bytes)?
        .verify_slice(tag)
        .map_err(|_| CryptoError::TagMismatch)?;

    let mut plain = cipher_text.to_vec();
    <Aes128Ctr as KeyIvInit>::new(
        GenericArray::from_slice(ke.as_bytes()),
        GenericArray::from_slice(iv),
    )
    .apply_keystream(&mut plain);
    Ok(plain)
}

/// NIST SP 800-56 concatenation KDF over SHA-256, split into the AES key
/// and the (hashed) MAC key.
fn ecies_kdf(shared: &H256) -> Result<(H128, H256), CryptoError> {
    let mut key = Zeroizing::new([0u8; 32]);
    concat_kdf::derive_key_into::<Sha256>(shared.as_bytes(), &[], &mut key[..])
        .map_err(|_| CryptoError::Kdf)?;
    let ke = H128::from_slice(&key[..16]);
    let km = H256::from_slice(&Sha256::digest(&key[16..]));
    Ok((ke, km))
}

fn ecies_mac(
    km: &H256,
    iv: &[u8],
    cipher_text: &[u8],
    size: &[u8],
) -> Result<Hmac<Sha256>, CryptoError> {
    let mut mac =
        <Hmac<Sha256> as Mac>::new_from_slice(km.as_bytes()).map_err(|_| CryptoError::Kdf)?;
    mac.update(iv);
    mac.update(cipher_text);
    mac.update(size);
    Ok(mac)
}

// ── Frame MAC ─────────────────────────────────────────────────────────────────

/// Running Keccak-256 MAC over every frame of one direction of a session.
///
/// The state is never reset: each header and body tag depends on every
/// byte authenticated before it.
#[derive(Clone)]
pub struct MacState {
    secret: H256,
    hasher: Keccak256,
}

impl MacState {
    pub fn new(secret: H256) -> Self {
        Self {
            secret,
            hasher: Keccak256::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// First 16 bytes of the current hash, without consuming the state.
    pub fn digest(&self) -> H128 {
        H128::from_slice(&self.hasher.clone().finalize()[..16])
    }

    /// Authenticate an encrypted 16-byte header and return its tag.
    pub fn update_header(&mut self, header_cipher: &[u8]) -> H128 {
        let mut seed = self.encrypt_digest(self.digest());
        for (s, c) in seed.iter_mut().zip(header_cipher) {
            *s ^= c;
        }
        self.update(&seed);
        self.digest()
    }

    /// Authenticate an encrypted frame body and return its tag.
    pub fn update_body(&mut self, body_cipher: &[u8]) -> H128 {
        self.update(body_cipher);
        let digest = self.digest();
        let mut seed = self.encrypt_digest(digest);
        for (s, d) in seed.iter_mut().zip(digest.as_bytes()) {
            *s ^= d;
        }
        self.update(&seed);
        self.digest()
    }

    /// Single-block AES-256 of the digest, keyed with the MAC secret.
    fn encrypt_digest(&self, digest: H128) -> [u8; 16] {
        let cipher = <Aes256Enc as KeyInit>::new(GenericArray::from_slice(self.secret.as_bytes()));
        let mut block = GenericArray::clone_from_slice(digest.as_bytes());
        cipher.encrypt_block(&mut block);
        let mut out = [0u8; 16];
        out.copy_from_slice(&block);
        out
    }
}

impl fmt::Debug for MacState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MacState")
            .field("digest", &self.digest())
            .finish_non_exhaustive()
    }
}

// ── Handshake ─────────────────────────────────────────────────────────────────

/// Everything a session needs once the auth/ack exchange has completed.
#[derive(Debug)]
pub struct SessionSecrets {
    /// AES-256-CTR key for frame headers and bodies (zero IV, one stream
    /// per direction for the life of the session).
    pub aes_secret: H256,
    /// Keys the AES-ECB step of the frame MAC.
    pub mac_secret: H256,
    pub egress_mac: MacState,
    pub ingress_mac: MacState,
    /// The peer's static node id, taken from auth (responder) or from the
    /// dialed address (initiator).
    pub remote_id: NodeId,
}

struct Exchange<'a> {
    ephemeral_shared: H256,
    initiator_nonce: H256,
    responder_nonce: H256,
    local_nonce: H256,
    remote_nonce: H256,
    local_sent: &'a [u8],
    remote_sent: &'a [u8],
    remote_id: NodeId,
}

fn derive_secrets(ex: Exchange<'_>) -> SessionSecrets {
    let eph = ex.ephemeral_shared;
    let nonce_hash = keccak256(&[ex.responder_nonce.as_bytes(), ex.initiator_nonce.as_bytes()].concat());
    let shared_secret = keccak256(&[eph.as_bytes(), nonce_hash.as_bytes()].concat());
    let aes_secret = keccak256(&[eph.as_bytes(), shared_secret.as_bytes()].concat());
    let mac_secret = keccak256(&[eph.as_bytes(), aes_secret.as_bytes()].concat());

    let mut egress_mac = MacState::new(mac_secret);
    egress_mac.update(xor32(mac_secret, ex.remote_nonce).as_bytes());
    egress_mac.update(ex.local_sent);

    let mut ingress_mac = MacState::new(mac_secret);
    ingress_mac.update(xor32(mac_secret, ex.local_nonce).as_bytes());
    ingress_mac.update(ex.remote_sent);

    SessionSecrets {
        aes_secret,
        mac_secret,
        egress_mac,
        ingress_mac,
        remote_id: ex.remote_id,
    }
}

/// Append 100..=250 bytes of zero padding after the RLP body.
fn padded(body: &[u8]) -> Vec<u8> {
    let pad = rand::thread_rng().gen_range(100..=250);
    let mut out = Vec::with_capacity(body.len() + pad);
    out.extend_from_slice(body);
    out.resize(body.len() + pad, 0);
    out
}

/// The RLP list at the front of a decrypted auth/ack, padding dropped.
fn without_padding(plain: &[u8]) -> Result<&[u8], CryptoError> {
    let len = Rlp::new(plain).payload_info()?.total();
    if len > plain.len() {
        return Err(CryptoError::Truncated);
    }
    Ok(&plain[..len])
}

fn check_version(version: u64) -> Result<(), CryptoError> {
    if version < AUTH_VERSION {
        return Err(CryptoError::UnsupportedVersion(version));
    }
    Ok(())
}

/// Initiator side of the RLPx handshake.
///
/// The initiator knows the responder's node id in advance (it dialed it).
/// It sends `auth`, receives `ack`, and derives the session secrets.
pub struct RlpxInitiator {
    remote_id: NodeId,
    ephemeral: SecretKey,
    nonce: H256,
    auth: Vec<u8>,
}

impl RlpxInitiator {
    /// Build the encrypted auth message. Returns the state and the bytes to send.
    pub fn new(keypair: &Keypair, remote_id: &NodeId) -> Result<(Self, Vec<u8>), CryptoError> {
        let ephemeral = SecretKey::new(&mut secp256k1::rand::thread_rng());
        Self::with_ephemeral(keypair, remote_id, ephemeral, random_nonce())
    }

    /// Same as [`RlpxInitiator::new`] with a caller-chosen ephemeral key and nonce.
    pub fn with_ephemeral(
        keypair: &Keypair,
        remote_id: &NodeId,
        ephemeral: SecretKey,
        nonce: H256,
    ) -> Result<(Self, Vec<u8>), CryptoError> {
        let remote = public_key(remote_id)?;
        let static_shared = ecdh(keypair.secret(), &remote);
        let digest = xor32(static_shared, nonce);
        let (recovery_id, compact) = SECP256K1
            .sign_ecdsa_recoverable(&Message::from_digest(digest.0), &ephemeral)
            .serialize_compact();
        let mut sig = compact.to_vec();
        sig.push(recovery_id.to_i32() as u8);

        // auth-body = [sig, initiator-pubk, initiator-nonce, auth-vsn]
        let mut s = RlpStream::new_list(4);
        s.append(&sig);
        s.append(&keypair.node_id());
        s.append(&nonce);
        s.append(&AUTH_VERSION);
        let auth = ecies_encrypt(&remote, &padded(&s.out()))?;

        let state = Self {
            remote_id: *remote_id,
            ephemeral,
            nonce,
            auth: auth.clone(),
        };
        Ok((state, auth))
    }

    pub fn nonce(&self) -> &H256 {
        &self.nonce
    }

    /// Consume the responder's ack and derive the session secrets.
    pub fn finish(self, keypair: &Keypair, ack: &[u8]) -> Result<SessionSecrets, CryptoError> {
        let plain = ecies_decrypt(keypair.secret(), ack)?;
        let body = Rlp::new(without_padding(&plain)?);
        let remote_ephemeral: NodeId = body.val_at(0)?;
        let remote_nonce: H256 = body.val_at(1)?;
        check_version(body.val_at(2)?)?;

        let remote_ephemeral = public_key(&remote_ephemeral)?;
        Ok(derive_secrets(Exchange {
            ephemeral_shared: ecdh(&self.ephemeral, &remote_ephemeral),
            initiator_nonce: self.nonce,
            responder_nonce: remote_nonce,
            local_nonce: self.nonce,
            remote_nonce,
            local_sent: &self.auth,
            remote_sent: ack,
            remote_id: self.remote_id,
        }))
    }
}

impl Drop for RlpxInitiator {
    fn drop(&mut self) {
        self.ephemeral.non_secure_erase();
    }
}

/// Responder side of the RLPx handshake.
pub struct RlpxResponder {
    ephemeral: SecretKey,
    nonce: H256,
}

impl Default for RlpxResponder {
    fn default() -> Self {
        Self::new()
    }
}

impl RlpxResponder {
    pub fn new() -> Self {
        Self::with_ephemeral(SecretKey::new(&mut secp256k1::rand::thread_rng()), random_nonce())
    }

    pub fn with_ephemeral(ephemeral: SecretKey, nonce: H256) -> Self {
        Self { ephemeral, nonce }
    }

    pub fn nonce(&self) -> &H256 {
        &self.nonce
    }

    /// Consume the initiator's auth. Returns the session secrets and the
    /// encrypted ack to send back.
    pub fn respond(
        self,
        keypair: &Keypair,
        auth: &[u8],
    ) -> Result<(SessionSecrets, Vec<u8>), CryptoError> {
        let plain = ecies_decrypt(keypair.secret(), auth)?;
        let body = Rlp::new(without_padding(&plain)?);
        let sig: Vec<u8> = body.val_at(0)?;
        let remote_id: NodeId = body.val_at(1)?;
        let remote_nonce: H256 = body.val_at(2)?;
        check_version(body.val_at(3)?)?;
        if sig.len() != 65 {
            return Err(CryptoError::InvalidSignature);
        }

        // The signature is over static-shared XOR nonce, made with the
        // initiator's ephemeral key; recovering it yields that key.
        let remote = public_key(&remote_id)?;
        let digest = xor32(ecdh(keypair.secret(), &remote), remote_nonce);
        let recovery_id =
            RecoveryId::from_i32(sig[64] as i32).map_err(|_| CryptoError::InvalidSignature)?;
        let signature = RecoverableSignature::from_compact(&sig[..64], recovery_id)
            .map_err(|_| CryptoError::InvalidSignature)?;
        let remote_ephemeral = SECP256K1
            .recover_ecdsa(&Message::from_digest(digest.0), &signature)
            .map_err(|_| CryptoError::InvalidSignature)?;

        // ack-body = [recipient-ephemeral-pubk, recipient-nonce, ack-vsn]
        let mut s = RlpStream::new_list(3);
        s.append(&node_id(&PublicKey::from_secret_key(SECP256K1, &self.ephemeral)));
        s.append(&self.nonce);
        s.append(&AUTH_VERSION);
        let ack = ecies_encrypt(&remote, &padded(&s.out()))?;

        let secrets = derive_secrets(Exchange {
            ephemeral_shared: ecdh(&self.ephemeral, &remote_ephemeral),
            initiator_nonce: remote_nonce,
            responder_nonce: self.nonce,
            local_nonce: self.nonce,
            remote_nonce,
            local_sent: &ack,
            remote_sent: auth,
            remote_id,
        });
        Ok((secrets, ack))
    }
}

impl Drop for RlpxResponder {
    fn drop(&mut self) {
        self.ephemeral.non_secure_erase();
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid secp256k1 public key")]
    InvalidPublicKey,
    #[error("invalid secp256k1 secret key")]
    InvalidSecretKey,
    #[error("invalid handshake signature")]
    InvalidSignature,
    #[error("ECIES message truncated")]
    Truncated,
    #[error("ECIES plaintext of {0} bytes is too large")]
    MessageTooLarge(usize),
    #[error("ECIES tag mismatch")]
    TagMismatch,
    #[error("key derivation failed")]
    Kdf,
    #[error("unsupported handshake version {0}")]
    UnsupportedVersion(u64),
    #[error("malformed handshake message: {0}")]
    Rlp(#[from] rlp::DecoderError),
    #[error("failed to access key file {0}: {1}")]
    KeyIo(PathBuf, std::io::Error),
}
