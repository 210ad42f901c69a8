//! # Canonical Wire Frames
//!
//! Binary codecs for everything that crosses the transport: beacons,
//! handshake messages, claims, and routed data. All frames are canonicalized
//! by fixed field ordering with length-prefixed variable sections and the
//! protocol version byte at offset 0, so a frame has exactly one valid byte
//! representation and signatures can cover the raw bytes directly.
//!
//! Frames travel inside a one-byte envelope tag that selects the codec; the
//! tagged frame itself always starts with its own version byte.
//!
//! Decoding is strict: trailing bytes, truncated sections, and unknown
//! versions are all `Validation` errors. Nothing here allocates based on
//! attacker-controlled lengths beyond the 64 KiB transport frame bound.

use crate::identity::{Epoch, NodeId};
use crate::{MeshError, Result, PROTOCOL_VERSION};

/// Largest logical frame the transport will carry.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Envelope tag selecting the frame codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Beacon = 0x01,
    HandshakeInit = 0x02,
    HandshakeResp = 0x03,
    Claim = 0x04,
    Data = 0x05,
}

impl TryFrom<u8> for FrameKind {
    type Error = MeshError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(FrameKind::Beacon),
            0x02 => Ok(FrameKind::HandshakeInit),
            0x03 => Ok(FrameKind::HandshakeResp),
            0x04 => Ok(FrameKind::Claim),
            0x05 => Ok(FrameKind::Data),
            other => Err(MeshError::Validation(format!(
                "unknown frame kind 0x{other:02x}"
            ))),
        }
    }
}

/// Prefix `frame` with its envelope tag.
pub fn seal_envelope(kind: FrameKind, frame: Vec<u8>) -> Result<Vec<u8>> {
    if frame.len() + 1 > MAX_FRAME_LEN {
        return Err(MeshError::Validation(format!(
            "frame of {} bytes exceeds the 64 KiB bound",
            frame.len()
        )));
    }
    let mut out = Vec::with_capacity(frame.len() + 1);
    out.push(kind as u8);
    out.extend_from_slice(&frame);
    Ok(out)
}

/// Split an envelope into its tag and frame bytes.
pub fn open_envelope(bytes: &[u8]) -> Result<(FrameKind, &[u8])> {
    let (&tag, frame) = bytes
        .split_first()
        .ok_or_else(|| MeshError::Validation("empty envelope".into()))?;
    Ok((FrameKind::try_from(tag)?, frame))
}

/// Capability tag advertised in a beacon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum Capability {
    /// Willing to forward traffic for third parties
    Relay = 0x01,
    /// Offers distributed storage
    Storage = 0x02,
    /// Bridges to networks outside the mesh
    Gateway = 0x03,
}

impl TryFrom<u8> for Capability {
    type Error = MeshError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Capability::Relay),
            0x02 => Ok(Capability::Storage),
            0x03 => Ok(Capability::Gateway),
            other => Err(MeshError::Validation(format!(
                "unknown capability tag 0x{other:02x}"
            ))),
        }
    }
}

/// A directed edge advertised in a beacon: sender → `dst` at `cost_us`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeighborEdge {
    pub dst: NodeId,
    /// Observed cost in microseconds (EWMA RTT)
    pub cost_us: u32,
}

/// The atomic discovery and liveness record.
///
/// Layout: `[v | node_id(16) | epoch(8) | nonce(8) | ts_ms(8) | n_edges(2) |
/// edges… | caps_len(2) | caps… | sig_pubkey_len(2) | sig_pubkey |
/// kem_pubkey_len(2) | kem_pubkey | sig_len(2) | signature]`, each edge
/// `[dst_id(16) | cost_us(4)]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeaconFrame {
    pub node_id: NodeId,
    pub epoch: Epoch,
    pub nonce: u64,
    /// Sender wall clock; advisory only
    pub timestamp_ms: u64,
    pub neighbors: Vec<NeighborEdge>,
    pub capabilities: Vec<Capability>,
    pub signing_pubkey: Vec<u8>,
    pub kem_pubkey: Vec<u8>,
    pub signature: Vec<u8>,
}

impl BeaconFrame {
    /// The canonical serialization of every field preceding the signature;
    /// this is the exact byte string the sender signs.
    pub fn signed_payload(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(64 + self.neighbors.len() * 20);
        self.encode_unsigned(&mut out)?;
        Ok(out)
    }

    fn encode_unsigned(&self, out: &mut Vec<u8>) -> Result<()> {
        out.push(PROTOCOL_VERSION);
        out.extend_from_slice(self.node_id.as_bytes());
        out.extend_from_slice(&self.epoch.0.to_le_bytes());
        out.extend_from_slice(&self.nonce.to_le_bytes());
        out.extend_from_slice(&self.timestamp_ms.to_le_bytes());
        put_u16(out, self.neighbors.len(), "edge section too large")?;
        for edge in &self.neighbors {
            out.extend_from_slice(edge.dst.as_bytes());
            out.extend_from_slice(&edge.cost_us.to_le_bytes());
        }
        put_u16(out, self.capabilities.len(), "capability section too large")?;
        for cap in &self.capabilities {
            out.push(*cap as u8);
        }
        put_section(out, &self.signing_pubkey, "signing pubkey too large")?;
        put_section(out, &self.kem_pubkey, "kem pubkey too large")?;
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = self.signed_payload()?;
        put_section(&mut out, &self.signature, "signature too large")?;
        if out.len() > MAX_FRAME_LEN {
            return Err(MeshError::Validation("beacon exceeds frame bound".into()));
        }
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes, "beacon");
        r.expect_version()?;
        let node_id = r.node_id()?;
        let epoch = Epoch(r.u64()?);
        let nonce = r.u64()?;
        let timestamp_ms = r.u64()?;
        let n_edges = r.u16()? as usize;
        let mut neighbors = Vec::with_capacity(n_edges.min(1024));
        for _ in 0..n_edges {
            let dst = r.node_id()?;
            let cost_us = r.u32()?;
            neighbors.push(NeighborEdge { dst, cost_us });
        }
        let n_caps = r.u16()? as usize;
        let mut capabilities = Vec::with_capacity(n_caps.min(16));
        for _ in 0..n_caps {
            capabilities.push(Capability::try_from(r.u8()?)?);
        }
        let signing_pubkey = r.section()?.to_vec();
        let kem_pubkey = r.section()?.to_vec();
        let signature = r.section()?.to_vec();
        r.finish()?;
        Ok(Self {
            node_id,
            epoch,
            nonce,
            timestamp_ms,
            neighbors,
            capabilities,
            signing_pubkey,
            kem_pubkey,
            signature,
        })
    }
}

/// First handshake flight, client → server.
///
/// Layout: `[v | client_id(16) | epoch(8) | kem_ct_len(2) | kem_ct |
/// sig_len(2) | sig]`. The signature covers every preceding byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeInitFrame {
    pub client_id: NodeId,
    pub epoch: Epoch,
    pub kem_ciphertext: Vec<u8>,
    pub signature: Vec<u8>,
}

impl HandshakeInitFrame {
    /// Bytes covered by the client signature.
    pub fn signed_payload(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(32 + self.kem_ciphertext.len());
        out.push(PROTOCOL_VERSION);
        out.extend_from_slice(self.client_id.as_bytes());
        out.extend_from_slice(&self.epoch.0.to_le_bytes());
        put_section(&mut out, &self.kem_ciphertext, "kem ciphertext too large")?;
        Ok(out)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = self.signed_payload()?;
        put_section(&mut out, &self.signature, "signature too large")?;
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes, "handshake init");
        r.expect_version()?;
        let client_id = r.node_id()?;
        let epoch = Epoch(r.u64()?);
        let kem_ciphertext = r.section()?.to_vec();
        let signature = r.section()?.to_vec();
        r.finish()?;
        Ok(Self {
            client_id,
            epoch,
            kem_ciphertext,
            signature,
        })
    }
}

/// Second handshake flight, server → client.
///
/// Layout: `[v | server_id(16) | epoch(8) | aead_nonce(12) | aead_tag(16) |
/// ciphertext]`; the ciphertext runs to the end of the frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRespFrame {
    pub server_id: NodeId,
    pub epoch: Epoch,
    pub aead_nonce: [u8; 12],
    pub aead_tag: [u8; 16],
    pub ciphertext: Vec<u8>,
}

impl HandshakeRespFrame {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(53 + self.ciphertext.len());
        out.push(PROTOCOL_VERSION);
        out.extend_from_slice(self.server_id.as_bytes());
        out.extend_from_slice(&self.epoch.0.to_le_bytes());
        out.extend_from_slice(&self.aead_nonce);
        out.extend_from_slice(&self.aead_tag);
        out.extend_from_slice(&self.ciphertext);
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes, "handshake resp");
        r.expect_version()?;
        let server_id = r.node_id()?;
        let epoch = Epoch(r.u64()?);
        let mut aead_nonce = [0u8; 12];
        aead_nonce.copy_from_slice(r.take(12)?);
        let mut aead_tag = [0u8; 16];
        aead_tag.copy_from_slice(r.take(16)?);
        let ciphertext = r.rest().to_vec();
        Ok(Self {
            server_id,
            epoch,
            aead_nonce,
            aead_tag,
            ciphertext,
        })
    }
}

/// Wire tag for the claim variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum ClaimType {
    NodeFailure = 0x01,
    Revocation = 0x02,
    ConfigChange = 0x03,
    FallbackActivated = 0x04,
    Introduction = 0x05,
}

impl TryFrom<u8> for ClaimType {
    type Error = MeshError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(ClaimType::NodeFailure),
            0x02 => Ok(ClaimType::Revocation),
            0x03 => Ok(ClaimType::ConfigChange),
            0x04 => Ok(ClaimType::FallbackActivated),
            0x05 => Ok(ClaimType::Introduction),
            other => Err(MeshError::Validation(format!(
                "unknown claim type 0x{other:02x}"
            ))),
        }
    }
}

/// One endorsement attached to a claim frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimSignature {
    pub signer_id: NodeId,
    pub signature: Vec<u8>,
}

/// A gossiped claim with its accumulated signature set.
///
/// Layout: `[v | claim_type(1) | claim_id(32) | target(16) | payload_len(2) |
/// payload | n_sigs(2) | {signer_id(16) | sig_len(2) | sig}…]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimFrame {
    pub claim_type: ClaimType,
    /// Content hash identifying the claim
    pub claim_id: [u8; 32],
    pub target: NodeId,
    pub payload: Vec<u8>,
    pub signatures: Vec<ClaimSignature>,
}

impl ClaimFrame {
    /// Bytes each signer endorses: everything up to and excluding the
    /// signature set.
    pub fn endorsed_payload(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(52 + self.payload.len());
        out.push(PROTOCOL_VERSION);
        out.push(self.claim_type as u8);
        out.extend_from_slice(&self.claim_id);
        out.extend_from_slice(self.target.as_bytes());
        put_section(&mut out, &self.payload, "claim payload too large")?;
        Ok(out)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = self.endorsed_payload()?;
        put_u16(&mut out, self.signatures.len(), "signature set too large")?;
        for sig in &self.signatures {
            out.extend_from_slice(sig.signer_id.as_bytes());
            put_section(&mut out, &sig.signature, "signature too large")?;
        }
        if out.len() > MAX_FRAME_LEN {
            return Err(MeshError::Validation("claim exceeds frame bound".into()));
        }
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes, "claim");
        r.expect_version()?;
        let claim_type = ClaimType::try_from(r.u8()?)?;
        let mut claim_id = [0u8; 32];
        claim_id.copy_from_slice(r.take(32)?);
        let target = r.node_id()?;
        let payload = r.section()?.to_vec();
        let n_sigs = r.u16()? as usize;
        let mut signatures = Vec::with_capacity(n_sigs.min(256));
        for _ in 0..n_sigs {
            let signer_id = r.node_id()?;
            let signature = r.section()?.to_vec();
            signatures.push(ClaimSignature {
                signer_id,
                signature,
            });
        }
        r.finish()?;
        Ok(Self {
            claim_type,
            claim_id,
            target,
            payload,
            signatures,
        })
    }
}

/// Routed application payload, sealed hop-by-hop by the session layer.
///
/// Layout: `[v | src(16) | dst(16) | hop_budget(1) | payload_len(2) |
/// payload]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    pub src: NodeId,
    pub dst: NodeId,
    /// Remaining hops before the frame is dropped
    pub hop_budget: u8,
    pub payload: Vec<u8>,
}

impl DataFrame {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(36 + self.payload.len());
        out.push(PROTOCOL_VERSION);
        out.extend_from_slice(self.src.as_bytes());
        out.extend_from_slice(self.dst.as_bytes());
        out.push(self.hop_budget);
        put_section(&mut out, &self.payload, "data payload too large")?;
        if out.len() > MAX_FRAME_LEN {
            return Err(MeshError::Validation("data frame exceeds bound".into()));
        }
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes, "data");
        r.expect_version()?;
        let src = r.node_id()?;
        let dst = r.node_id()?;
        let hop_budget = r.u8()?;
        let payload = r.section()?.to_vec();
        r.finish()?;
        Ok(Self {
            src,
            dst,
            hop_budget,
            payload,
        })
    }
}

fn put_u16(out: &mut Vec<u8>, len: usize, label: &'static str) -> Result<()> {
    let len = u16::try_from(len).map_err(|_| MeshError::Validation(label.into()))?;
    out.extend_from_slice(&len.to_le_bytes());
    Ok(())
}

fn put_section(out: &mut Vec<u8>, bytes: &[u8], label: &'static str) -> Result<()> {
    put_u16(out, bytes.len(), label)?;
    out.extend_from_slice(bytes);
    Ok(())
}

/// Strict cursor over a frame. Every accessor fails with a labeled
/// `Validation` error on truncation.
struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
    label: &'static str,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8], label: &'static str) -> Self {
        Self {
            bytes,
            offset: 0,
            label,
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .offset
            .checked_add(n)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| MeshError::Validation(format!("{} frame truncated", self.label)))?;
        let slice = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(u64::from_le_bytes(buf))
    }

    fn node_id(&mut self) -> Result<NodeId> {
        let b = self.take(NodeId::LEN)?;
        let mut buf = [0u8; 16];
        buf.copy_from_slice(b);
        Ok(NodeId::from_bytes(buf))
    }

    fn section(&mut self) -> Result<&'a [u8]> {
        let len = self.u16()? as usize;
        self.take(len)
    }

    fn rest(&mut self) -> &'a [u8] {
        let slice = &self.bytes[self.offset..];
        self.offset = self.bytes.len();
        slice
    }

    fn expect_version(&mut self) -> Result<()> {
        let v = self.u8()?;
        if v != PROTOCOL_VERSION {
            return Err(MeshError::Validation(format!(
                "{}: unsupported version {v}",
                self.label
            )));
        }
        Ok(())
    }

    fn finish(&self) -> Result<()> {
        if self.offset != self.bytes.len() {
            return Err(MeshError::Validation(format!(
                "{}: {} trailing bytes",
                self.label,
                self.bytes.len() - self.offset
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_beacon() -> BeaconFrame {
        BeaconFrame {
            node_id: NodeId::from_bytes([7; 16]),
            epoch: Epoch(3),
            nonce: 41,
            timestamp_ms: 1_700_000_000_000,
            neighbors: vec![
                NeighborEdge {
                    dst: NodeId::from_bytes([1; 16]),
                    cost_us: 4_200,
                },
                NeighborEdge {
                    dst: NodeId::from_bytes([2; 16]),
                    cost_us: 9_000,
                },
            ],
            capabilities: vec![Capability::Relay, Capability::Storage],
            signing_pubkey: vec![0xaa; 40],
            kem_pubkey: vec![0xbb; 32],
            signature: vec![0xcc; 64],
        }
    }

    #[test]
    fn beacon_round_trips() {
        let beacon = sample_beacon();
        let bytes = beacon.encode().unwrap();
        let decoded = BeaconFrame::decode(&bytes).unwrap();
        assert_eq!(beacon, decoded);
        // Canonical: re-encoding reproduces the input bytes exactly.
        assert_eq!(decoded.encode().unwrap(), bytes);
    }

    #[test]
    fn beacon_signed_payload_excludes_signature() {
        let beacon = sample_beacon();
        let signed = beacon.signed_payload().unwrap();
        let full = beacon.encode().unwrap();
        assert!(full.starts_with(&signed));
        assert_eq!(full.len(), signed.len() + 2 + beacon.signature.len());
    }

    #[test]
    fn truncated_beacon_is_rejected() {
        let bytes = sample_beacon().encode().unwrap();
        for cut in [1, 17, bytes.len() - 1] {
            assert!(BeaconFrame::decode(&bytes[..cut]).is_err());
        }
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut bytes = sample_beacon().encode().unwrap();
        bytes.push(0);
        assert!(BeaconFrame::decode(&bytes).is_err());
    }

    #[test]
    fn wrong_version_is_rejected() {
        let mut bytes = sample_beacon().encode().unwrap();
        bytes[0] = 9;
        assert!(BeaconFrame::decode(&bytes).is_err());
    }

    #[test]
    fn handshake_init_round_trips() {
        let init = HandshakeInitFrame {
            client_id: NodeId::from_bytes([3; 16]),
            epoch: Epoch(12),
            kem_ciphertext: vec![9; 1088],
            signature: vec![8; 3309],
        };
        let bytes = init.encode().unwrap();
        assert_eq!(HandshakeInitFrame::decode(&bytes).unwrap(), init);
    }

    #[test]
    fn handshake_resp_round_trips() {
        let resp = HandshakeRespFrame {
            server_id: NodeId::from_bytes([4; 16]),
            epoch: Epoch(2),
            aead_nonce: [5; 12],
            aead_tag: [6; 16],
            ciphertext: vec![7; 48],
        };
        let bytes = resp.encode().unwrap();
        assert_eq!(HandshakeRespFrame::decode(&bytes).unwrap(), resp);
    }

    #[test]
    fn claim_round_trips_with_signature_set() {
        let claim = ClaimFrame {
            claim_type: ClaimType::NodeFailure,
            claim_id: [0xee; 32],
            target: NodeId::from_bytes([9; 16]),
            payload: b"unreachable for 3 intervals".to_vec(),
            signatures: vec![
                ClaimSignature {
                    signer_id: NodeId::from_bytes([1; 16]),
                    signature: vec![1; 16],
                },
                ClaimSignature {
                    signer_id: NodeId::from_bytes([2; 16]),
                    signature: vec![2; 16],
                },
            ],
        };
        let bytes = claim.encode().unwrap();
        let decoded = ClaimFrame::decode(&bytes).unwrap();
        assert_eq!(decoded, claim);
        assert_eq!(decoded.encode().unwrap(), bytes);
    }

    #[test]
    fn envelope_round_trips() {
        let body = sample_beacon().encode().unwrap();
        let sealed = seal_envelope(FrameKind::Beacon, body.clone()).unwrap();
        let (kind, frame) = open_envelope(&sealed).unwrap();
        assert_eq!(kind, FrameKind::Beacon);
        assert_eq!(frame, &body[..]);
        assert!(open_envelope(&[]).is_err());
        assert!(open_envelope(&[0xff, 1]).is_err());
    }

    proptest! {
        #[test]
        fn data_frames_round_trip(payload in proptest::collection::vec(any::<u8>(), 0..2048),
                                  hop_budget in any::<u8>()) {
            let frame = DataFrame {
                src: NodeId::from_bytes([1; 16]),
                dst: NodeId::from_bytes([2; 16]),
                hop_budget,
                payload,
            };
            let bytes = frame.encode().unwrap();
            prop_assert_eq!(DataFrame::decode(&bytes).unwrap(), frame);
        }

        #[test]
        fn arbitrary_bytes_never_panic_the_decoders(bytes in proptest::collection::vec(any::<u8>(), 0..512)) {
            let _ = BeaconFrame::decode(&bytes);
            let _ = HandshakeInitFrame::decode(&bytes);
            let _ = HandshakeRespFrame::decode(&bytes);
            let _ = ClaimFrame::decode(&bytes);
            let _ = DataFrame::decode(&bytes);
            let _ = open_envelope(&bytes);
        }
    }
}
