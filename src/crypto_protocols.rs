//! # Post-Quantum Crypto Protocols
//!
//! Every cryptographic primitive the control plane touches, behind two small
//! engine types and a key-custody manager:
//!
//! ## Core Capabilities
//!
//! ### Algorithm Agility
//! - **KEM**: ML-KEM-512/768/1024 (FIPS 203), default ML-KEM-768
//! - **Signatures**: ML-DSA-44/65/87 (FIPS 204), default ML-DSA-65
//! - **AEAD**: AES-256-GCM keyed by HKDF-SHA256 derived session secrets
//! - Selection via `KEM_ALGORITHM` / `SIG_ALGORITHM` or the config file
//!
//! ### Fail-Closed Fallback
//! - Engines self-test at initialization; an unavailable PQC primitive is
//!   fatal in production mode (exit code 65)
//! - Outside production the provider degrades to X25519/Ed25519 under a hard
//!   TTL; expiry forces self-quarantine and there is no rehabilitation path
//!   short of an operator restart
//! - Silent fallback is impossible: activation is observable as a
//!   `FallbackActivated` claim and a telemetry event
//!
//! ### Side-Channel Hygiene
//! - Constant-time comparison for every secret-dependent equality
//! - Calibrated uniform 50–200 ns noise added around handshake verification
//! - Secret key material zeroized on drop
//!
//! ### Key Custody
//! - [`KeyManager`] owns the long-term signing keypair, the per-epoch KEM
//!   keypair, and the `(epoch, nonce)` counter; rotation bumps the epoch,
//!   resets the nonce, and retires the previous KEM key for the rekey grace
//!   window

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use sha3::{Digest, Sha3_256};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::config::CryptoConfig;
use crate::hooks::PersistenceHook;
use crate::identity::{Epoch, Freshness};
use crate::{MeshError, Result};

/// Persistence key for the long-term signing keypair.
pub const KEY_SIG_KEYPAIR: &str = "identity/long_term_sig_keypair";
/// Persistence key for the current KEM keypair.
pub const KEY_KEM_KEYPAIR: &str = "identity/current_kem_keypair";
/// Persistence key for the node epoch.
pub const KEY_EPOCH: &str = "identity/epoch";

/// HKDF domain separator for session key derivation.
const SESSION_KDF_DOMAIN: &[u8] = b"mesh-session-v1";

/// Secret byte buffer that zeroizes on drop and never prints its contents.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct SecretBytes(Vec<u8>);

impl SecretBytes {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretBytes(<{} bytes>)", self.0.len())
    }
}

/// Key encapsulation algorithm selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KemAlgorithm {
    #[serde(rename = "ML-KEM-512")]
    MlKem512,
    #[serde(rename = "ML-KEM-768")]
    MlKem768,
    #[serde(rename = "ML-KEM-1024")]
    MlKem1024,
    /// Classical X25519; only reachable through the fallback path
    #[serde(rename = "X25519")]
    X25519,
}

impl KemAlgorithm {
    pub fn is_post_quantum(&self) -> bool {
        !matches!(self, KemAlgorithm::X25519)
    }
}

impl fmt::Display for KemAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KemAlgorithm::MlKem512 => "ML-KEM-512",
            KemAlgorithm::MlKem768 => "ML-KEM-768",
            KemAlgorithm::MlKem1024 => "ML-KEM-1024",
            KemAlgorithm::X25519 => "X25519",
        };
        f.write_str(name)
    }
}

impl FromStr for KemAlgorithm {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self> {
        match normalize_algorithm(s).as_str() {
            "mlkem512" | "kyber512" => Ok(KemAlgorithm::MlKem512),
            "mlkem768" | "kyber768" => Ok(KemAlgorithm::MlKem768),
            "mlkem1024" | "kyber1024" => Ok(KemAlgorithm::MlKem1024),
            "x25519" => Ok(KemAlgorithm::X25519),
            _ => Err(MeshError::Configuration(format!(
                "unknown KEM algorithm {s:?}"
            ))),
        }
    }
}

/// Signature algorithm selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SigAlgorithm {
    #[serde(rename = "ML-DSA-44")]
    MlDsa44,
    #[serde(rename = "ML-DSA-65")]
    MlDsa65,
    #[serde(rename = "ML-DSA-87")]
    MlDsa87,
    /// Classical Ed25519; only reachable through the fallback path
    #[serde(rename = "Ed25519")]
    Ed25519,
}

impl SigAlgorithm {
    pub fn is_post_quantum(&self) -> bool {
        !matches!(self, SigAlgorithm::Ed25519)
    }
}

impl fmt::Display for SigAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SigAlgorithm::MlDsa44 => "ML-DSA-44",
            SigAlgorithm::MlDsa65 => "ML-DSA-65",
            SigAlgorithm::MlDsa87 => "ML-DSA-87",
            SigAlgorithm::Ed25519 => "Ed25519",
        };
        f.write_str(name)
    }
}

impl FromStr for SigAlgorithm {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self> {
        match normalize_algorithm(s).as_str() {
            "mldsa44" | "dilithium2" => Ok(SigAlgorithm::MlDsa44),
            "mldsa65" | "dilithium3" => Ok(SigAlgorithm::MlDsa65),
            "mldsa87" | "dilithium5" => Ok(SigAlgorithm::MlDsa87),
            "ed25519" => Ok(SigAlgorithm::Ed25519),
            _ => Err(MeshError::Configuration(format!(
                "unknown signature algorithm {s:?}"
            ))),
        }
    }
}

fn normalize_algorithm(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_lowercase()
}

/// KEM keypair with its algorithm tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KemKeyPair {
    pub algorithm: KemAlgorithm,
    pub public_key: Vec<u8>,
    pub secret_key: SecretBytes,
}

/// Signing keypair with its algorithm tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigKeyPair {
    pub algorithm: SigAlgorithm,
    pub public_key: Vec<u8>,
    pub secret_key: SecretBytes,
}

macro_rules! mlkem_generate {
    ($pset:ident, $alg:expr) => {{
        use fips203::traits::{KeyGen, SerDes};
        let (ek, dk) = fips203::$pset::KG::try_keygen()
            .map_err(|e| MeshError::KemFailure(format!("keygen: {e}")))?;
        Ok(KemKeyPair {
            algorithm: $alg,
            public_key: ek.into_bytes().to_vec(),
            secret_key: SecretBytes::new(dk.into_bytes().to_vec()),
        })
    }};
}

macro_rules! mlkem_encapsulate {
    ($pset:ident, $public:expr) => {{
        use fips203::traits::{Encaps, SerDes};
        let arr: [u8; fips203::$pset::EK_LEN] = $public
            .try_into()
            .map_err(|_| MeshError::KemFailure("bad encapsulation key length".into()))?;
        let ek = fips203::$pset::EncapsKey::try_from_bytes(arr)
            .map_err(|e| MeshError::KemFailure(format!("bad encapsulation key: {e}")))?;
        let (ssk, ct) = ek
            .try_encaps()
            .map_err(|e| MeshError::KemFailure(format!("encaps: {e}")))?;
        Ok((
            ct.into_bytes().to_vec(),
            SecretBytes::new(ssk.into_bytes().to_vec()),
        ))
    }};
}

macro_rules! mlkem_decapsulate {
    ($pset:ident, $secret:expr, $ciphertext:expr) => {{
        use fips203::traits::{Decaps, SerDes};
        let dk_arr: [u8; fips203::$pset::DK_LEN] = $secret
            .try_into()
            .map_err(|_| MeshError::KemFailure("bad decapsulation key length".into()))?;
        let dk = fips203::$pset::DecapsKey::try_from_bytes(dk_arr)
            .map_err(|e| MeshError::KemFailure(format!("bad decapsulation key: {e}")))?;
        let ct_arr: [u8; fips203::$pset::CT_LEN] = $ciphertext
            .try_into()
            .map_err(|_| MeshError::KemFailure("bad ciphertext length".into()))?;
        let ct = fips203::$pset::CipherText::try_from_bytes(ct_arr)
            .map_err(|e| MeshError::KemFailure(format!("bad ciphertext: {e}")))?;
        let ssk = dk
            .try_decaps(&ct)
            .map_err(|e| MeshError::KemFailure(format!("decaps: {e}")))?;
        Ok(SecretBytes::new(ssk.into_bytes().to_vec()))
    }};
}

macro_rules! mldsa_generate {
    ($pset:ident, $alg:expr) => {{
        use fips204::traits::SerDes;
        let (pk, sk) = fips204::$pset::try_keygen()
            .map_err(|e| MeshError::CryptoInit(format!("keygen: {e}")))?;
        Ok(SigKeyPair {
            algorithm: $alg,
            public_key: pk.into_bytes().to_vec(),
            secret_key: SecretBytes::new(sk.into_bytes().to_vec()),
        })
    }};
}

macro_rules! mldsa_sign {
    ($pset:ident, $secret:expr, $message:expr) => {{
        use fips204::traits::{SerDes, Signer};
        let sk_arr: [u8; fips204::$pset::SK_LEN] = $secret
            .try_into()
            .map_err(|_| MeshError::BadSignature("bad signing key length".into()))?;
        let sk = fips204::$pset::PrivateKey::try_from_bytes(sk_arr)
            .map_err(|e| MeshError::BadSignature(format!("bad signing key: {e}")))?;
        let sig = sk
            .try_sign($message, b"")
            .map_err(|e| MeshError::BadSignature(format!("sign: {e}")))?;
        Ok(sig.to_vec())
    }};
}

macro_rules! mldsa_verify {
    ($pset:ident, $public:expr, $message:expr, $signature:expr) => {{
        use fips204::traits::{SerDes, Verifier};
        let pk_arr: [u8; fips204::$pset::PK_LEN] = $public
            .try_into()
            .map_err(|_| MeshError::BadSignature("bad verifying key length".into()))?;
        let pk = fips204::$pset::PublicKey::try_from_bytes(pk_arr)
            .map_err(|e| MeshError::BadSignature(format!("bad verifying key: {e}")))?;
        let sig_arr: [u8; fips204::$pset::SIG_LEN] = $signature
            .try_into()
            .map_err(|_| MeshError::BadSignature("bad signature length".into()))?;
        if pk.verify($message, &sig_arr, b"") {
            Ok(())
        } else {
            Err(MeshError::BadSignature("ml-dsa verification failed".into()))
        }
    }};
}

/// Key encapsulation engine dispatching on the configured algorithm.
#[derive(Debug, Clone, Copy)]
pub struct KemEngine {
    pub algorithm: KemAlgorithm,
}

impl KemEngine {
    pub fn new(algorithm: KemAlgorithm) -> Self {
        Self { algorithm }
    }

    pub fn generate(&self) -> Result<KemKeyPair> {
        match self.algorithm {
            KemAlgorithm::MlKem512 => mlkem_generate!(ml_kem_512, KemAlgorithm::MlKem512),
            KemAlgorithm::MlKem768 => mlkem_generate!(ml_kem_768, KemAlgorithm::MlKem768),
            KemAlgorithm::MlKem1024 => mlkem_generate!(ml_kem_1024, KemAlgorithm::MlKem1024),
            KemAlgorithm::X25519 => {
                let secret = x25519_dalek::StaticSecret::random_from_rng(OsRng);
                let public = x25519_dalek::PublicKey::from(&secret);
                Ok(KemKeyPair {
                    algorithm: KemAlgorithm::X25519,
                    public_key: public.as_bytes().to_vec(),
                    secret_key: SecretBytes::new(secret.to_bytes().to_vec()),
                })
            }
        }
    }

    /// Encapsulate a fresh shared secret under a peer's public key. Returns
    /// `(ciphertext, shared_secret)`.
    pub fn encapsulate(&self, peer_public: &[u8]) -> Result<(Vec<u8>, SecretBytes)> {
        match self.algorithm {
            KemAlgorithm::MlKem512 => mlkem_encapsulate!(ml_kem_512, peer_public),
            KemAlgorithm::MlKem768 => mlkem_encapsulate!(ml_kem_768, peer_public),
            KemAlgorithm::MlKem1024 => mlkem_encapsulate!(ml_kem_1024, peer_public),
            KemAlgorithm::X25519 => {
                let peer: [u8; 32] = peer_public
                    .try_into()
                    .map_err(|_| MeshError::KemFailure("bad x25519 public key".into()))?;
                let ephemeral = x25519_dalek::StaticSecret::random_from_rng(OsRng);
                let ciphertext = x25519_dalek::PublicKey::from(&ephemeral);
                let shared = ephemeral.diffie_hellman(&x25519_dalek::PublicKey::from(peer));
                Ok((
                    ciphertext.as_bytes().to_vec(),
                    SecretBytes::new(shared.as_bytes().to_vec()),
                ))
            }
        }
    }

    /// Recover the shared secret from a ciphertext produced against our
    /// public key.
    pub fn decapsulate(&self, keypair: &KemKeyPair, ciphertext: &[u8]) -> Result<SecretBytes> {
        match self.algorithm {
            KemAlgorithm::MlKem512 => {
                mlkem_decapsulate!(ml_kem_512, keypair.secret_key.as_slice(), ciphertext)
            }
            KemAlgorithm::MlKem768 => {
                mlkem_decapsulate!(ml_kem_768, keypair.secret_key.as_slice(), ciphertext)
            }
            KemAlgorithm::MlKem1024 => {
                mlkem_decapsulate!(ml_kem_1024, keypair.secret_key.as_slice(), ciphertext)
            }
            KemAlgorithm::X25519 => {
                let secret: [u8; 32] = keypair
                    .secret_key
                    .as_slice()
                    .try_into()
                    .map_err(|_| MeshError::KemFailure("bad x25519 secret key".into()))?;
                let peer: [u8; 32] = ciphertext
                    .try_into()
                    .map_err(|_| MeshError::KemFailure("bad x25519 ciphertext".into()))?;
                let secret = x25519_dalek::StaticSecret::from(secret);
                let shared = secret.diffie_hellman(&x25519_dalek::PublicKey::from(peer));
                Ok(SecretBytes::new(shared.as_bytes().to_vec()))
            }
        }
    }

    /// Keygen → encapsulate → decapsulate self-test, run at initialization
    /// to detect an unavailable primitive before any peer traffic arrives.
    pub fn self_test(&self) -> Result<()> {
        let keypair = self.generate()?;
        let (ciphertext, shared_a) = self.encapsulate(&keypair.public_key)?;
        let shared_b = self.decapsulate(&keypair, &ciphertext)?;
        if constant_time_eq(shared_a.as_slice(), shared_b.as_slice()) {
            Ok(())
        } else {
            Err(MeshError::CryptoInit(format!(
                "{} shared secret mismatch in self-test",
                self.algorithm
            )))
        }
    }
}

/// Signature engine dispatching on the configured algorithm.
#[derive(Debug, Clone, Copy)]
pub struct SigEngine {
    pub algorithm: SigAlgorithm,
}

impl SigEngine {
    pub fn new(algorithm: SigAlgorithm) -> Self {
        Self { algorithm }
    }

    pub fn generate(&self) -> Result<SigKeyPair> {
        match self.algorithm {
            SigAlgorithm::MlDsa44 => mldsa_generate!(ml_dsa_44, SigAlgorithm::MlDsa44),
            SigAlgorithm::MlDsa65 => mldsa_generate!(ml_dsa_65, SigAlgorithm::MlDsa65),
            SigAlgorithm::MlDsa87 => mldsa_generate!(ml_dsa_87, SigAlgorithm::MlDsa87),
            SigAlgorithm::Ed25519 => {
                let signing = ed25519_dalek::SigningKey::generate(&mut OsRng);
                Ok(SigKeyPair {
                    algorithm: SigAlgorithm::Ed25519,
                    public_key: signing.verifying_key().as_bytes().to_vec(),
                    secret_key: SecretBytes::new(signing.to_bytes().to_vec()),
                })
            }
        }
    }

    pub fn sign(&self, keypair: &SigKeyPair, message: &[u8]) -> Result<Vec<u8>> {
        match self.algorithm {
            SigAlgorithm::MlDsa44 => {
                mldsa_sign!(ml_dsa_44, keypair.secret_key.as_slice(), message)
            }
            SigAlgorithm::MlDsa65 => {
                mldsa_sign!(ml_dsa_65, keypair.secret_key.as_slice(), message)
            }
            SigAlgorithm::MlDsa87 => {
                mldsa_sign!(ml_dsa_87, keypair.secret_key.as_slice(), message)
            }
            SigAlgorithm::Ed25519 => {
                use ed25519_dalek::Signer;
                let secret: [u8; 32] = keypair
                    .secret_key
                    .as_slice()
                    .try_into()
                    .map_err(|_| MeshError::BadSignature("bad ed25519 secret key".into()))?;
                let signing = ed25519_dalek::SigningKey::from_bytes(&secret);
                Ok(signing.sign(message).to_bytes().to_vec())
            }
        }
    }

    pub fn verify(&self, public_key: &[u8], message: &[u8], signature: &[u8]) -> Result<()> {
        match self.algorithm {
            SigAlgorithm::MlDsa44 => mldsa_verify!(ml_dsa_44, public_key, message, signature),
            SigAlgorithm::MlDsa65 => mldsa_verify!(ml_dsa_65, public_key, message, signature),
            SigAlgorithm::MlDsa87 => mldsa_verify!(ml_dsa_87, public_key, message, signature),
            SigAlgorithm::Ed25519 => {
                use ed25519_dalek::Verifier;
                let public: [u8; 32] = public_key
                    .try_into()
                    .map_err(|_| MeshError::BadSignature("bad ed25519 public key".into()))?;
                let verifying = ed25519_dalek::VerifyingKey::from_bytes(&public)
                    .map_err(|e| MeshError::BadSignature(format!("bad ed25519 key: {e}")))?;
                let sig_arr: [u8; 64] = signature
                    .try_into()
                    .map_err(|_| MeshError::BadSignature("bad ed25519 signature length".into()))?;
                let sig = ed25519_dalek::Signature::from_bytes(&sig_arr);
                verifying
                    .verify(message, &sig)
                    .map_err(|_| MeshError::BadSignature("ed25519 verification failed".into()))
            }
        }
    }

    /// Sign → verify self-test, run at initialization.
    pub fn self_test(&self) -> Result<()> {
        let keypair = self.generate()?;
        let signature = self.sign(&keypair, b"mesh-self-test")?;
        self.verify(&keypair.public_key, b"mesh-self-test", &signature)
    }
}

/// State of an active classical degrade.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FallbackState {
    /// When the degrade was activated, in epoch milliseconds
    pub activated_at_ms: u64,
    /// Hard lifetime; expiry forces self-quarantine
    pub ttl_ms: u64,
}

impl FallbackState {
    pub fn expired(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.activated_at_ms) > self.ttl_ms
    }

    pub fn remaining_ms(&self, now_ms: u64) -> u64 {
        self.ttl_ms
            .saturating_sub(now_ms.saturating_sub(self.activated_at_ms))
    }
}

/// The node's cryptographic capability set, fixed at initialization.
#[derive(Debug, Clone)]
pub struct CryptoProvider {
    pub kem: KemEngine,
    pub sig: SigEngine,
    /// Present iff the classical degrade path is active
    pub fallback: Option<FallbackState>,
    production: bool,
}

impl CryptoProvider {
    /// Initialize the provider, self-testing the configured primitives.
    ///
    /// In production an unavailable PQC primitive is fatal. Outside
    /// production the provider degrades to X25519/Ed25519 with a hard TTL;
    /// the caller is responsible for broadcasting the `FallbackActivated`
    /// claim once gossip is up.
    pub fn initialize(config: &CryptoConfig, production: bool, now_ms: u64) -> Result<Self> {
        if production && !(config.kem_algorithm.is_post_quantum() && config.sig_algorithm.is_post_quantum()) {
            return Err(MeshError::CryptoInit(
                "classical algorithms are rejected in production mode".into(),
            ));
        }

        let kem = KemEngine::new(config.kem_algorithm);
        let sig = SigEngine::new(config.sig_algorithm);
        let pqc_available = !config.allow_mock_pqc
            && !config.simulate_pqc_unavailable
            && kem.self_test().is_ok()
            && sig.self_test().is_ok();

        if pqc_available {
            return Ok(Self {
                kem,
                sig,
                fallback: None,
                production,
            });
        }

        if production {
            return Err(MeshError::CryptoInit(format!(
                "post-quantum primitives unavailable ({} / {})",
                config.kem_algorithm, config.sig_algorithm
            )));
        }

        // Classical degrade: bounded lifetime, loudly observable.
        let kem = KemEngine::new(KemAlgorithm::X25519);
        let sig = SigEngine::new(SigAlgorithm::Ed25519);
        kem.self_test()?;
        sig.self_test()?;
        metrics::counter!("mesh_pqc_fallback_activated_total", 1);
        Ok(Self {
            kem,
            sig,
            fallback: Some(FallbackState {
                activated_at_ms: now_ms,
                ttl_ms: config.fallback_ttl_ms,
            }),
            production,
        })
    }

    /// Assemble a provider from explicit engines, bypassing the self-test
    /// policy. Lab and test wiring only; `initialize` is the front door.
    pub fn with_engines(
        kem: KemEngine,
        sig: SigEngine,
        fallback: Option<FallbackState>,
        production: bool,
    ) -> Self {
        Self {
            kem,
            sig,
            fallback,
            production,
        }
    }

    pub fn production(&self) -> bool {
        self.production
    }

    pub fn fallback_active(&self) -> bool {
        self.fallback.is_some()
    }

    /// Check the fallback TTL. `Err(FallbackTtlExpired)` means the node must
    /// self-quarantine now.
    pub fn check_fallback_ttl(&self, now_ms: u64) -> Result<()> {
        match &self.fallback {
            Some(state) if state.expired(now_ms) => Err(MeshError::FallbackTtlExpired),
            _ => Ok(()),
        }
    }
}

/// Directional session keys derived from a handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionKeys {
    /// Seals traffic from the handshake initiator to the responder
    pub initiator_to_responder: SecretBytes,
    /// Seals traffic from the responder to the initiator
    pub responder_to_initiator: SecretBytes,
}

/// Derive directional session keys from the KEM shared secret and the
/// handshake transcript hash.
pub fn derive_session_keys(shared_secret: &[u8], transcript_hash: &[u8; 32]) -> Result<SessionKeys> {
    let hk = Hkdf::<Sha256>::new(Some(transcript_hash), shared_secret);
    let mut i2r = [0u8; 32];
    let mut r2i = [0u8; 32];
    hk.expand(&[SESSION_KDF_DOMAIN, b" i2r"].concat(), &mut i2r)
        .map_err(|_| MeshError::KemFailure("hkdf expand failed".into()))?;
    hk.expand(&[SESSION_KDF_DOMAIN, b" r2i"].concat(), &mut r2i)
        .map_err(|_| MeshError::KemFailure("hkdf expand failed".into()))?;
    let keys = SessionKeys {
        initiator_to_responder: SecretBytes::new(i2r.to_vec()),
        responder_to_initiator: SecretBytes::new(r2i.to_vec()),
    };
    i2r.zeroize();
    r2i.zeroize();
    Ok(keys)
}

/// Seal `plaintext` with AES-256-GCM. Returns `ciphertext || tag`.
pub fn aead_seal(key: &[u8], nonce: &[u8; 12], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| MeshError::KemFailure("bad aead key length".into()))?;
    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| MeshError::KemFailure("aead seal failed".into()))
}

/// Open an AES-256-GCM sealed payload. Fails with `BadMac` on tampering.
pub fn aead_open(key: &[u8], nonce: &[u8; 12], aad: &[u8], sealed: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| MeshError::KemFailure("bad aead key length".into()))?;
    cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg: sealed, aad })
        .map_err(|_| MeshError::BadMac("aead open failed".into()))
}

/// Random 96-bit AEAD nonce.
pub fn random_nonce() -> [u8; 12] {
    let mut nonce = [0u8; 12];
    rand::thread_rng().fill(&mut nonce);
    nonce
}

/// SHA3-256 of the concatenation of `parts`.
pub fn sha3_256(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha3_256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Constant-time equality for secret-dependent comparisons.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

/// Spin for a uniform 50–200 ns to decorrelate handshake verification
/// timing from secret-dependent branches.
pub fn add_timing_noise() {
    let noise_ns: u64 = rand::thread_rng().gen_range(50..=200);
    let start = Instant::now();
    while (start.elapsed().as_nanos() as u64) < noise_ns {
        std::hint::spin_loop();
    }
}

/// A KEM keypair retired by rotation, kept alive for the rekey grace window.
#[derive(Debug, Clone)]
struct RetiredKem {
    keypair: KemKeyPair,
    retired_at_ms: u64,
}

#[derive(Debug)]
struct KeyState {
    epoch: Epoch,
    nonce: u64,
    kem_keypair: KemKeyPair,
    retired_kem: Option<RetiredKem>,
}

/// Custody of the node's key material and `(epoch, nonce)` counter.
///
/// Single writer: rotation and nonce allocation serialize on the internal
/// lock, so a rotation can never interleave with a nonce draw and produce a
/// nonce from the old epoch tagged with the new one.
pub struct KeyManager {
    sig_keypair: SigKeyPair,
    state: RwLock<KeyState>,
}

impl KeyManager {
    /// Load identity material from persistence, or bootstrap a fresh
    /// identity at epoch 0. A successful load of an existing identity bumps
    /// the epoch: every restart is a new epoch.
    pub async fn load_or_bootstrap(
        provider: &CryptoProvider,
        persistence: &Arc<dyn PersistenceHook>,
    ) -> Result<Self> {
        let stored_sig = persistence.load(KEY_SIG_KEYPAIR).await?;
        let manager = match stored_sig {
            Some(sig_bytes) => {
                let sig_keypair: SigKeyPair = serde_json::from_slice(&sig_bytes)
                    .map_err(|e| MeshError::Persistence(format!("sig keypair: {e}")))?;
                let kem_keypair = match persistence.load(KEY_KEM_KEYPAIR).await? {
                    Some(bytes) => serde_json::from_slice(&bytes)
                        .map_err(|e| MeshError::Persistence(format!("kem keypair: {e}")))?,
                    None => provider.kem.generate()?,
                };
                let prior_epoch: Epoch = match persistence.load(KEY_EPOCH).await? {
                    Some(bytes) => serde_json::from_slice(&bytes)
                        .map_err(|e| MeshError::Persistence(format!("epoch: {e}")))?,
                    None => Epoch(0),
                };
                Self {
                    sig_keypair,
                    state: RwLock::new(KeyState {
                        // Restart bump: stale beacons from the previous run
                        // can never outrank this process.
                        epoch: prior_epoch.next(),
                        nonce: 0,
                        kem_keypair,
                        retired_kem: None,
                    }),
                }
            }
            None => Self {
                sig_keypair: provider.sig.generate()?,
                state: RwLock::new(KeyState {
                    epoch: Epoch(0),
                    nonce: 0,
                    kem_keypair: provider.kem.generate()?,
                    retired_kem: None,
                }),
            },
        };
        manager.persist(persistence).await?;
        Ok(manager)
    }

    pub async fn persist(&self, persistence: &Arc<dyn PersistenceHook>) -> Result<()> {
        let (epoch, kem_keypair) = {
            let state = self.state.read();
            (state.epoch, state.kem_keypair.clone())
        };
        persistence
            .save(
                KEY_SIG_KEYPAIR,
                &serde_json::to_vec(&self.sig_keypair)
                    .map_err(|e| MeshError::Persistence(e.to_string()))?,
            )
            .await?;
        persistence
            .save(
                KEY_KEM_KEYPAIR,
                &serde_json::to_vec(&kem_keypair)
                    .map_err(|e| MeshError::Persistence(e.to_string()))?,
            )
            .await?;
        persistence
            .save(
                KEY_EPOCH,
                &serde_json::to_vec(&epoch).map_err(|e| MeshError::Persistence(e.to_string()))?,
            )
            .await?;
        Ok(())
    }

    pub fn sig_keypair(&self) -> &SigKeyPair {
        &self.sig_keypair
    }

    pub fn signing_pubkey(&self) -> Vec<u8> {
        self.sig_keypair.public_key.clone()
    }

    pub fn kem_pubkey(&self) -> Vec<u8> {
        self.state.read().kem_keypair.public_key.clone()
    }

    pub fn epoch(&self) -> Epoch {
        self.state.read().epoch
    }

    /// Allocate the next `(epoch, nonce)` pair.
    pub fn next_freshness(&self) -> Freshness {
        let mut state = self.state.write();
        let freshness = Freshness::new(state.epoch, state.nonce);
        state.nonce = state.nonce.saturating_add(1);
        freshness
    }

    /// Rotate the KEM keypair: new keys, epoch bump, nonce reset. The old
    /// keypair stays decapsulation-capable until the grace window closes.
    pub fn rotate_kem(&self, provider: &CryptoProvider, now_ms: u64) -> Result<Epoch> {
        let fresh = provider.kem.generate()?;
        let mut state = self.state.write();
        let retired = std::mem::replace(&mut state.kem_keypair, fresh);
        state.retired_kem = Some(RetiredKem {
            keypair: retired,
            retired_at_ms: now_ms,
        });
        state.epoch = state.epoch.next();
        state.nonce = 0;
        Ok(state.epoch)
    }

    /// Decapsulate against the current KEM key, falling back to the retired
    /// key while it remains inside `rekey_grace`.
    pub fn decapsulate(
        &self,
        provider: &CryptoProvider,
        ciphertext: &[u8],
        now_ms: u64,
        rekey_grace_ms: u64,
    ) -> Result<SecretBytes> {
        let state = self.state.read();
        match provider.kem.decapsulate(&state.kem_keypair, ciphertext) {
            Ok(shared) => Ok(shared),
            Err(primary_err) => {
                if let Some(retired) = &state.retired_kem {
                    if now_ms.saturating_sub(retired.retired_at_ms) <= rekey_grace_ms {
                        return provider.kem.decapsulate(&retired.keypair, ciphertext);
                    }
                }
                Err(primary_err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::MemoryPersistence;

    fn classical_provider() -> CryptoProvider {
        CryptoProvider {
            kem: KemEngine::new(KemAlgorithm::X25519),
            sig: SigEngine::new(SigAlgorithm::Ed25519),
            fallback: None,
            production: false,
        }
    }

    #[test]
    fn algorithm_names_parse_loosely() {
        assert_eq!(
            "ML-KEM-768".parse::<KemAlgorithm>().unwrap(),
            KemAlgorithm::MlKem768
        );
        assert_eq!(
            "mlkem1024".parse::<KemAlgorithm>().unwrap(),
            KemAlgorithm::MlKem1024
        );
        assert_eq!(
            "ML-DSA-65".parse::<SigAlgorithm>().unwrap(),
            SigAlgorithm::MlDsa65
        );
        assert!("ML-KEM-9000".parse::<KemAlgorithm>().is_err());
    }

    #[test]
    fn x25519_kem_round_trips() {
        let engine = KemEngine::new(KemAlgorithm::X25519);
        let keypair = engine.generate().unwrap();
        let (ciphertext, shared_a) = engine.encapsulate(&keypair.public_key).unwrap();
        let shared_b = engine.decapsulate(&keypair, &ciphertext).unwrap();
        assert!(constant_time_eq(shared_a.as_slice(), shared_b.as_slice()));
    }

    #[test]
    fn ml_kem_768_round_trips() {
        KemEngine::new(KemAlgorithm::MlKem768).self_test().unwrap();
    }

    #[test]
    fn ed25519_rejects_tampered_messages() {
        let engine = SigEngine::new(SigAlgorithm::Ed25519);
        let keypair = engine.generate().unwrap();
        let sig = engine.sign(&keypair, b"beacon").unwrap();
        engine.verify(&keypair.public_key, b"beacon", &sig).unwrap();
        assert!(engine.verify(&keypair.public_key, b"beacom", &sig).is_err());
    }

    #[test]
    fn ml_dsa_65_self_tests() {
        SigEngine::new(SigAlgorithm::MlDsa65).self_test().unwrap();
    }

    #[test]
    fn session_keys_are_directional_and_deterministic() {
        let shared = [7u8; 32];
        let transcript = [9u8; 32];
        let a = derive_session_keys(&shared, &transcript).unwrap();
        let b = derive_session_keys(&shared, &transcript).unwrap();
        assert!(constant_time_eq(
            a.initiator_to_responder.as_slice(),
            b.initiator_to_responder.as_slice()
        ));
        assert!(!constant_time_eq(
            a.initiator_to_responder.as_slice(),
            a.responder_to_initiator.as_slice()
        ));
    }

    #[test]
    fn aead_detects_tampering() {
        let key = [3u8; 32];
        let nonce = random_nonce();
        let sealed = aead_seal(&key, &nonce, b"aad", b"payload").unwrap();
        assert_eq!(
            aead_open(&key, &nonce, b"aad", &sealed).unwrap(),
            b"payload"
        );

        let mut tampered = sealed.clone();
        tampered[0] ^= 1;
        assert!(matches!(
            aead_open(&key, &nonce, b"aad", &tampered),
            Err(MeshError::BadMac(_))
        ));
        assert!(aead_open(&key, &nonce, b"other aad", &sealed).is_err());
    }

    #[test]
    fn fallback_state_tracks_ttl() {
        let state = FallbackState {
            activated_at_ms: 1_000,
            ttl_ms: 500,
        };
        assert!(!state.expired(1_400));
        assert!(!state.expired(1_500));
        assert!(state.expired(1_501));
        assert_eq!(state.remaining_ms(1_200), 300);
    }

    #[test]
    fn production_rejects_classical_algorithms() {
        let mut config = CryptoConfig::default();
        config.kem_algorithm = KemAlgorithm::X25519;
        assert!(matches!(
            CryptoProvider::initialize(&config, true, 0),
            Err(MeshError::CryptoInit(_))
        ));
    }

    #[test]
    fn mock_pqc_degrades_outside_production() {
        let mut config = CryptoConfig::default();
        config.allow_mock_pqc = true;
        let provider = CryptoProvider::initialize(&config, false, 10_000).unwrap();
        assert!(provider.fallback_active());
        assert_eq!(provider.kem.algorithm, KemAlgorithm::X25519);
        provider.check_fallback_ttl(20_000).unwrap();
        assert!(matches!(
            provider.check_fallback_ttl(10_000 + config.fallback_ttl_ms + 1),
            Err(MeshError::FallbackTtlExpired)
        ));
    }

    #[test]
    fn mock_pqc_is_fatal_in_production() {
        let mut config = CryptoConfig::default();
        config.allow_mock_pqc = true;
        assert!(matches!(
            CryptoProvider::initialize(&config, true, 0),
            Err(MeshError::CryptoInit(_))
        ));
    }

    #[tokio::test]
    async fn key_manager_bumps_epoch_on_restart() {
        let provider = classical_provider();
        let persistence: Arc<dyn PersistenceHook> = Arc::new(MemoryPersistence::new());

        let first = KeyManager::load_or_bootstrap(&provider, &persistence)
            .await
            .unwrap();
        assert_eq!(first.epoch(), Epoch(0));
        let pubkey = first.signing_pubkey();
        drop(first);

        let second = KeyManager::load_or_bootstrap(&provider, &persistence)
            .await
            .unwrap();
        assert_eq!(second.epoch(), Epoch(1));
        assert_eq!(second.signing_pubkey(), pubkey);
    }

    #[tokio::test]
    async fn rotation_bumps_epoch_and_resets_nonce() {
        let provider = classical_provider();
        let persistence: Arc<dyn PersistenceHook> = Arc::new(MemoryPersistence::new());
        let manager = KeyManager::load_or_bootstrap(&provider, &persistence)
            .await
            .unwrap();

        let before = manager.next_freshness();
        assert_eq!(before.nonce, 0);
        assert_eq!(manager.next_freshness().nonce, 1);

        let old_pub = manager.kem_pubkey();
        let epoch = manager.rotate_kem(&provider, 50_000).unwrap();
        assert_eq!(epoch, before.epoch.next());
        assert_ne!(manager.kem_pubkey(), old_pub);
        assert_eq!(manager.next_freshness().nonce, 0);
    }

    #[tokio::test]
    async fn retired_kem_decapsulates_within_grace_only() {
        let provider = classical_provider();
        let persistence: Arc<dyn PersistenceHook> = Arc::new(MemoryPersistence::new());
        let manager = KeyManager::load_or_bootstrap(&provider, &persistence)
            .await
            .unwrap();

        let old_pub = manager.kem_pubkey();
        let (ciphertext, shared) = provider.kem.encapsulate(&old_pub).unwrap();
        manager.rotate_kem(&provider, 100_000).unwrap();

        // Inside the grace window the retired key still works.
        let recovered = manager
            .decapsulate(&provider, &ciphertext, 105_000, 10_000)
            .unwrap();
        assert!(constant_time_eq(shared.as_slice(), recovered.as_slice()));

        // Outside it, prior session material is gone: forward secrecy.
        assert!(manager
            .decapsulate(&provider, &ciphertext, 120_001, 10_000)
            .is_err());
    }
}
