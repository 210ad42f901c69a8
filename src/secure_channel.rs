//! # PQ-Secure Channel
//!
//! Mutual authentication and confidentiality between any pair of nodes,
//! built from the engines in [`crate::crypto_protocols`]:
//!
//! ## Handshake (client-initiated, 1-RTT)
//!
//! 1. The client encapsulates a fresh shared secret under the server's KEM
//!    public key and signs `(client_id, epoch, ciphertext)` with its
//!    long-term key.
//! 2. The server verifies the signature against the *recorded* key for that
//!    node id, decapsulates, and derives directional session keys via HKDF
//!    with the `"mesh-session-v1"` domain separator.
//! 3. The server answers with `AEAD(k, "ack" || transcript_hash)`; the
//!    client authenticates the server purely by KEM binding — only the
//!    holder of the server's KEM private key could have derived `k`.
//! 4. Both sides commit the session with a `session_ttl` expiry.
//!
//! ## Anti-Replay
//!
//! Every sealed message carries `(epoch, nonce)`; the receiver accepts only
//! strictly greater pairs per sender. On epoch rollover the nonce window
//! resets and the final nonce of the previous epoch is preserved for the
//! clock-skew window so late duplicates are still recognized as replays.
//!
//! ## Rekey Grace
//!
//! Rotating a KEM key retires the active session rather than dropping it:
//! for `rekey_grace` both the retired and the fresh session can open
//! traffic, so in-flight frames survive rotation. After the window closes,
//! prior session keys are unusable — forward secrecy.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::crypto_protocols::{
    add_timing_noise, aead_open, aead_seal, constant_time_eq, derive_session_keys, random_nonce,
    sha3_256, CryptoProvider, KeyManager, SecretBytes, SessionKeys,
};
use crate::identity::{Epoch, Freshness, NodeId};
use crate::wire::{HandshakeInitFrame, HandshakeRespFrame};
use crate::{MeshError, Result};

const ACK_LABEL: &[u8] = b"ack";

/// Per-peer freshness tracking. Accepts a message iff its `(epoch, nonce)`
/// is strictly greater than the last accepted pair from that sender.
#[derive(Default)]
pub struct ReplayGuard {
    last_seen: DashMap<NodeId, ReplayEntry>,
}

struct ReplayEntry {
    current: Freshness,
    /// Final freshness of the previous epoch, kept for the skew window
    previous_epoch: Option<(Freshness, u64)>,
}

impl ReplayGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and record `freshness` from `node`. The first message from a
    /// node is accepted unconditionally; the caller gates first contact via
    /// introduction claims.
    pub fn check_and_update(
        &self,
        node: NodeId,
        freshness: Freshness,
        now_ms: u64,
        clock_skew_max_ms: u64,
    ) -> Result<()> {
        let mut entry = self.last_seen.entry(node).or_insert_with(|| ReplayEntry {
            current: Freshness::new(Epoch(0), 0),
            previous_epoch: None,
        });

        // Fresh node entry: the sentinel (0, 0) only collides with a real
        // first message of (epoch 0, nonce 0), which we accept exactly once.
        let is_first = entry.current == Freshness::new(Epoch(0), 0)
            && entry.previous_epoch.is_none()
            && freshness == entry.current;
        if is_first {
            entry.current = freshness;
            return Ok(());
        }

        if freshness > entry.current {
            if freshness.epoch > entry.current.epoch {
                entry.previous_epoch = Some((entry.current, now_ms));
            }
            entry.current = freshness;
            return Ok(());
        }

        if freshness.epoch < entry.current.epoch {
            // Late duplicate inside the skew window is a replay; anything
            // older is a stale epoch.
            if let Some((prev, rolled_at)) = entry.previous_epoch {
                if freshness.epoch == prev.epoch
                    && now_ms.saturating_sub(rolled_at) <= clock_skew_max_ms
                {
                    return Err(MeshError::Replay(format!(
                        "{} late duplicate from epoch {}",
                        node.short(),
                        freshness.epoch
                    )));
                }
            }
            return Err(MeshError::EpochStale(format!(
                "{} epoch {} behind {}",
                node.short(),
                freshness.epoch,
                entry.current.epoch
            )));
        }

        Err(MeshError::Replay(format!(
            "{} nonce {} at or below {}",
            node.short(),
            freshness.nonce,
            entry.current.nonce
        )))
    }

    /// Last accepted pair for a node, if any.
    pub fn last_accepted(&self, node: &NodeId) -> Option<Freshness> {
        self.last_seen.get(node).map(|e| e.current)
    }

    /// Drop all state for a node (used on eviction).
    pub fn forget(&self, node: &NodeId) {
        self.last_seen.remove(node);
    }
}

/// An established secure channel with one peer.
#[derive(Debug)]
pub struct Session {
    pub peer: NodeId,
    pub peer_epoch: Epoch,
    /// True when this side initiated the handshake
    pub initiator: bool,
    pub established_at_ms: u64,
    pub expires_at_ms: u64,
    pub transcript_hash: [u8; 32],
    keys: SessionKeys,
}

impl Session {
    /// Seal an application payload for this peer. The output embeds the
    /// freshness pair and AEAD nonce:
    /// `[epoch(8) | nonce(8) | aead_nonce(12) | ciphertext || tag]`, with the
    /// freshness bytes doubling as AEAD associated data.
    pub fn seal_message(&self, freshness: Freshness, plaintext: &[u8]) -> Result<Vec<u8>> {
        let aead_nonce = random_nonce();
        let mut out = Vec::with_capacity(28 + plaintext.len() + 16);
        out.extend_from_slice(&freshness.epoch.0.to_le_bytes());
        out.extend_from_slice(&freshness.nonce.to_le_bytes());
        out.extend_from_slice(&aead_nonce);
        let sealed = aead_seal(self.send_key(), &aead_nonce, &out[..16], plaintext)?;
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Open a sealed payload from this peer, returning the freshness pair it
    /// carried. Replay checking is the caller's job (via [`ReplayGuard`]) so
    /// a failed AEAD never advances the replay window.
    pub fn open_message(&self, sealed: &[u8]) -> Result<(Freshness, Vec<u8>)> {
        if sealed.len() < 28 {
            return Err(MeshError::Validation("sealed message truncated".into()));
        }
        let epoch = u64::from_le_bytes(sealed[0..8].try_into().unwrap());
        let nonce = u64::from_le_bytes(sealed[8..16].try_into().unwrap());
        let mut aead_nonce = [0u8; 12];
        aead_nonce.copy_from_slice(&sealed[16..28]);
        let plaintext = aead_open(self.recv_key(), &aead_nonce, &sealed[..16], &sealed[28..])?;
        Ok((Freshness::new(Epoch(epoch), nonce), plaintext))
    }

    pub fn expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at_ms
    }

    fn send_key(&self) -> &[u8] {
        if self.initiator {
            self.keys.initiator_to_responder.as_slice()
        } else {
            self.keys.responder_to_initiator.as_slice()
        }
    }

    fn recv_key(&self) -> &[u8] {
        if self.initiator {
            self.keys.responder_to_initiator.as_slice()
        } else {
            self.keys.initiator_to_responder.as_slice()
        }
    }
}

/// Client-side state between sending the init and receiving the response.
pub struct PendingHandshake {
    pub peer: NodeId,
    pub started_at_ms: u64,
    shared_secret: SecretBytes,
    transcript_hash: [u8; 32],
}

/// Outcome of serving one handshake init.
#[derive(Debug)]
pub struct ServedHandshake {
    pub response_bytes: Vec<u8>,
    pub session: Session,
    pub client_epoch: Epoch,
}

/// Channel endpoint: everything one node needs to run handshakes in both
/// roles and manage the resulting sessions.
pub struct ChannelManager {
    node_id: NodeId,
    key_manager: Arc<KeyManager>,
    provider: Arc<CryptoProvider>,
    sessions: DashMap<NodeId, Arc<Session>>,
    /// Sessions displaced by rekey, alive until the grace window closes
    retired: DashMap<NodeId, (Arc<Session>, u64)>,
    session_ttl_ms: u64,
    rekey_grace_ms: u64,
}

impl ChannelManager {
    pub fn new(
        node_id: NodeId,
        key_manager: Arc<KeyManager>,
        provider: Arc<CryptoProvider>,
        session_ttl_ms: u64,
        rekey_grace_ms: u64,
    ) -> Self {
        Self {
            node_id,
            key_manager,
            provider,
            sessions: DashMap::new(),
            retired: DashMap::new(),
            session_ttl_ms,
            rekey_grace_ms,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Build the first flight toward `server` and remember the pending state.
    pub fn initiate(
        &self,
        server: NodeId,
        server_kem_pubkey: &[u8],
        now_ms: u64,
    ) -> Result<(Vec<u8>, PendingHandshake)> {
        let (kem_ciphertext, shared_secret) = self.provider.kem.encapsulate(server_kem_pubkey)?;

        let mut frame = HandshakeInitFrame {
            client_id: self.node_id,
            epoch: self.key_manager.epoch(),
            kem_ciphertext,
            signature: Vec::new(),
        };
        let signed = frame.signed_payload()?;
        frame.signature = self
            .provider
            .sig
            .sign(self.key_manager.sig_keypair(), &signed)?;

        let bytes = frame.encode()?;
        let transcript_hash = sha3_256(&[&bytes]);
        Ok((
            bytes,
            PendingHandshake {
                peer: server,
                started_at_ms: now_ms,
                shared_secret,
                transcript_hash,
            },
        ))
    }

    /// Serve one handshake init: verify, decapsulate, derive, respond, and
    /// commit the server-side session.
    pub fn respond(
        &self,
        init_bytes: &[u8],
        client_sig_pubkey: &[u8],
        now_ms: u64,
    ) -> Result<ServedHandshake> {
        let frame = HandshakeInitFrame::decode(init_bytes)?;

        // Noise straddles verification so rejection timing carries no
        // information about how far validation got.
        add_timing_noise();
        let signed = frame.signed_payload()?;
        self.provider
            .sig
            .verify(client_sig_pubkey, &signed, &frame.signature)?;
        add_timing_noise();

        let shared = self.key_manager.decapsulate(
            &self.provider,
            &frame.kem_ciphertext,
            now_ms,
            self.rekey_grace_ms,
        )?;

        let transcript_hash = sha3_256(&[init_bytes]);
        let keys = derive_session_keys(shared.as_slice(), &transcript_hash)?;

        let session = Session {
            peer: frame.client_id,
            peer_epoch: frame.epoch,
            initiator: false,
            established_at_ms: now_ms,
            expires_at_ms: now_ms + self.session_ttl_ms,
            transcript_hash,
            keys,
        };

        let mut ack = Vec::with_capacity(ACK_LABEL.len() + 32);
        ack.extend_from_slice(ACK_LABEL);
        ack.extend_from_slice(&transcript_hash);

        let aead_nonce = random_nonce();
        let sealed = aead_seal(
            session.keys.responder_to_initiator.as_slice(),
            &aead_nonce,
            &[],
            &ack,
        )?;
        let (ciphertext, tag) = sealed.split_at(sealed.len() - 16);
        let mut aead_tag = [0u8; 16];
        aead_tag.copy_from_slice(tag);

        let response = HandshakeRespFrame {
            server_id: self.node_id,
            epoch: self.key_manager.epoch(),
            aead_nonce,
            aead_tag,
            ciphertext: ciphertext.to_vec(),
        };

        Ok(ServedHandshake {
            response_bytes: response.encode()?,
            client_epoch: frame.epoch,
            session,
        })
    }

    /// Finalize a client-side handshake from the server's response.
    pub fn finalize(
        &self,
        pending: PendingHandshake,
        resp_bytes: &[u8],
        now_ms: u64,
    ) -> Result<Session> {
        let frame = HandshakeRespFrame::decode(resp_bytes)?;
        if frame.server_id != pending.peer {
            return Err(MeshError::BadSignature(format!(
                "handshake response from {} while expecting {}",
                frame.server_id.short(),
                pending.peer.short()
            )));
        }

        let keys = derive_session_keys(pending.shared_secret.as_slice(), &pending.transcript_hash)?;

        let mut sealed = frame.ciphertext.clone();
        sealed.extend_from_slice(&frame.aead_tag);

        add_timing_noise();
        let ack = aead_open(
            keys.responder_to_initiator.as_slice(),
            &frame.aead_nonce,
            &[],
            &sealed,
        )?;

        let mut expected = Vec::with_capacity(ACK_LABEL.len() + 32);
        expected.extend_from_slice(ACK_LABEL);
        expected.extend_from_slice(&pending.transcript_hash);
        if !constant_time_eq(&ack, &expected) {
            return Err(MeshError::BadMac("handshake ack mismatch".into()));
        }
        add_timing_noise();

        Ok(Session {
            peer: pending.peer,
            peer_epoch: frame.epoch,
            initiator: true,
            established_at_ms: now_ms,
            expires_at_ms: now_ms + self.session_ttl_ms,
            transcript_hash: pending.transcript_hash,
            keys,
        })
    }

    /// Commit an established session, displacing any active one into the
    /// rekey grace window.
    pub fn install(&self, session: Session, now_ms: u64) {
        let peer = session.peer;
        if let Some((_, old)) = self.sessions.remove(&peer) {
            self.retired.insert(peer, (old, now_ms));
        }
        self.sessions.insert(peer, Arc::new(session));
    }

    /// The active session with `peer`, if one exists and has not expired.
    pub fn session(&self, peer: &NodeId, now_ms: u64) -> Option<Arc<Session>> {
        let session = self.sessions.get(peer)?.clone();
        if session.expired(now_ms) {
            drop(session);
            self.sessions.remove(peer);
            return None;
        }
        Some(session)
    }

    /// Open a sealed message from `peer`, trying the active session first
    /// and the retired one while it remains inside the grace window.
    pub fn open_from(
        &self,
        peer: &NodeId,
        sealed: &[u8],
        now_ms: u64,
    ) -> Result<(Freshness, Vec<u8>)> {
        let active = self.session(peer, now_ms);
        if let Some(session) = &active {
            match session.open_message(sealed) {
                Ok(out) => return Ok(out),
                Err(MeshError::BadMac(_)) => {}
                Err(e) => return Err(e),
            }
        }
        if let Some(entry) = self.retired.get(peer) {
            let (session, retired_at) = (&entry.0, entry.1);
            if now_ms.saturating_sub(retired_at) <= self.rekey_grace_ms {
                return session.open_message(sealed);
            }
        }
        match active {
            Some(_) => Err(MeshError::BadMac(format!(
                "no session key opens message from {}",
                peer.short()
            ))),
            None => Err(MeshError::PeerUnknown(format!(
                "no session with {}",
                peer.short()
            ))),
        }
    }

    /// Drop the session with `peer` (and any retired remnant).
    pub fn drop_session(&self, peer: &NodeId) {
        self.sessions.remove(peer);
        self.retired.remove(peer);
    }

    /// Peers with a live session at `now_ms`.
    pub fn active_peers(&self, now_ms: u64) -> Vec<NodeId> {
        self.sessions
            .iter()
            .filter(|e| !e.value().expired(now_ms))
            .map(|e| *e.key())
            .collect()
    }

    /// Sweep expired sessions and grace windows.
    pub fn sweep(&self, now_ms: u64) {
        self.sessions.retain(|_, s| !s.expired(now_ms));
        self.retired
            .retain(|_, (_, retired_at)| now_ms.saturating_sub(*retired_at) <= self.rekey_grace_ms);
    }
}

/// Exponential handshake retry backoff: 100 ms, 400 ms, 1.6 s.
pub fn retry_backoff(attempt: u32) -> Duration {
    Duration::from_millis(100 * 4u64.saturating_pow(attempt))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CryptoConfig;
    use crate::crypto_protocols::{KemAlgorithm, KemEngine, SigAlgorithm, SigEngine};
    use crate::hooks::{MemoryPersistence, PersistenceHook};

    async fn classical_endpoint(node_id: NodeId) -> (ChannelManager, Arc<KeyManager>) {
        let provider = Arc::new(CryptoProvider::with_engines(
            KemEngine::new(KemAlgorithm::X25519),
            SigEngine::new(SigAlgorithm::Ed25519),
            None,
            false,
        ));
        let persistence: Arc<dyn PersistenceHook> = Arc::new(MemoryPersistence::new());
        let key_manager = Arc::new(
            KeyManager::load_or_bootstrap(&provider, &persistence)
                .await
                .unwrap(),
        );
        let cfg = CryptoConfig::default();
        (
            ChannelManager::new(
                node_id,
                Arc::clone(&key_manager),
                provider,
                cfg.session_ttl_ms,
                cfg.rekey_grace_ms,
            ),
            key_manager,
        )
    }

    #[tokio::test]
    async fn handshake_establishes_matching_sessions() {
        let alice_id = NodeId::from_bytes([1; 16]);
        let bob_id = NodeId::from_bytes([2; 16]);
        let (alice, alice_keys) = classical_endpoint(alice_id).await;
        let (bob, bob_keys) = classical_endpoint(bob_id).await;

        let (init, pending) = alice.initiate(bob_id, &bob_keys.kem_pubkey(), 1_000).unwrap();
        let served = bob
            .respond(&init, &alice_keys.signing_pubkey(), 1_001)
            .unwrap();
        let client_session = alice.finalize(pending, &served.response_bytes, 1_002).unwrap();

        // Both directions carry traffic.
        let freshness = Freshness::new(Epoch(0), 0);
        let sealed = client_session.seal_message(freshness, b"over the mesh").unwrap();
        let (f, plain) = served.session.open_message(&sealed).unwrap();
        assert_eq!(f, freshness);
        assert_eq!(plain, b"over the mesh");

        let sealed = served
            .session
            .seal_message(Freshness::new(Epoch(0), 1), b"and back")
            .unwrap();
        let (_, plain) = client_session.open_message(&sealed).unwrap();
        assert_eq!(plain, b"and back");
    }

    #[tokio::test]
    async fn respond_rejects_wrong_client_key() {
        let alice_id = NodeId::from_bytes([1; 16]);
        let bob_id = NodeId::from_bytes([2; 16]);
        let (alice, _alice_keys) = classical_endpoint(alice_id).await;
        let (bob, _bob_keys) = classical_endpoint(bob_id).await;
        let (mallory, mallory_keys) = classical_endpoint(NodeId::from_bytes([3; 16])).await;
        drop(mallory);

        let (init, _) = alice
            .initiate(bob_id, &bob.key_manager.kem_pubkey(), 0)
            .unwrap();
        let err = bob
            .respond(&init, &mallory_keys.signing_pubkey(), 1)
            .unwrap_err();
        assert!(matches!(err, MeshError::BadSignature(_)));
    }

    #[tokio::test]
    async fn finalize_rejects_tampered_ack() {
        let alice_id = NodeId::from_bytes([1; 16]);
        let bob_id = NodeId::from_bytes([2; 16]);
        let (alice, alice_keys) = classical_endpoint(alice_id).await;
        let (bob, _bob_keys) = classical_endpoint(bob_id).await;

        let (init, pending) = alice
            .initiate(bob_id, &bob.key_manager.kem_pubkey(), 0)
            .unwrap();
        let served = bob.respond(&init, &alice_keys.signing_pubkey(), 1).unwrap();

        let mut frame = HandshakeRespFrame::decode(&served.response_bytes).unwrap();
        frame.ciphertext[0] ^= 1;
        let err = alice
            .finalize(pending, &frame.encode().unwrap(), 2)
            .unwrap_err();
        assert!(matches!(err, MeshError::BadMac(_)));
    }

    #[test]
    fn replay_guard_enforces_strict_ordering() {
        let guard = ReplayGuard::new();
        let node = NodeId::from_bytes([9; 16]);
        let skew = 30_000;

        guard
            .check_and_update(node, Freshness::new(Epoch(7), 42), 0, skew)
            .unwrap();
        // Identical pair: replay.
        assert!(matches!(
            guard.check_and_update(node, Freshness::new(Epoch(7), 42), 1, skew),
            Err(MeshError::Replay(_))
        ));
        // Lower nonce: replay.
        assert!(matches!(
            guard.check_and_update(node, Freshness::new(Epoch(7), 41), 2, skew),
            Err(MeshError::Replay(_))
        ));
        // Higher nonce: accepted.
        guard
            .check_and_update(node, Freshness::new(Epoch(7), 43), 3, skew)
            .unwrap();
    }

    #[test]
    fn replay_guard_handles_epoch_rollover() {
        let guard = ReplayGuard::new();
        let node = NodeId::from_bytes([9; 16]);
        let skew = 30_000;

        guard
            .check_and_update(node, Freshness::new(Epoch(7), 99), 1_000, skew)
            .unwrap();
        // Epoch bump resets the nonce window.
        guard
            .check_and_update(node, Freshness::new(Epoch(8), 0), 2_000, skew)
            .unwrap();
        // Late duplicate from epoch 7 inside the skew window: replay.
        assert!(matches!(
            guard.check_and_update(node, Freshness::new(Epoch(7), 99), 3_000, skew),
            Err(MeshError::Replay(_))
        ));
        // After the window it is just a stale epoch.
        assert!(matches!(
            guard.check_and_update(node, Freshness::new(Epoch(7), 99), 2_000 + skew + 1, skew),
            Err(MeshError::EpochStale(_))
        ));
    }

    #[test]
    fn replay_guard_accepts_epoch_zero_first_contact_once() {
        let guard = ReplayGuard::new();
        let node = NodeId::from_bytes([5; 16]);
        guard
            .check_and_update(node, Freshness::new(Epoch(0), 0), 0, 1_000)
            .unwrap();
        assert!(guard
            .check_and_update(node, Freshness::new(Epoch(0), 0), 1, 1_000)
            .is_err());
    }

    #[tokio::test]
    async fn sessions_expire_and_sweep() {
        let (manager, _) = classical_endpoint(NodeId::from_bytes([1; 16])).await;
        let peer = NodeId::from_bytes([2; 16]);
        let keys = derive_session_keys(&[1; 32], &[2; 32]).unwrap();
        manager.install(
            Session {
                peer,
                peer_epoch: Epoch(0),
                initiator: true,
                established_at_ms: 0,
                expires_at_ms: 100,
                transcript_hash: [0; 32],
                keys,
            },
            0,
        );
        assert!(manager.session(&peer, 50).is_some());
        assert!(manager.session(&peer, 100).is_none());
        manager.sweep(200);
        assert!(manager.active_peers(200).is_empty());
    }

    #[test]
    fn backoff_schedule_matches_contract() {
        assert_eq!(retry_backoff(0), Duration::from_millis(100));
        assert_eq!(retry_backoff(1), Duration::from_millis(400));
        assert_eq!(retry_backoff(2), Duration::from_millis(1_600));
    }
}
