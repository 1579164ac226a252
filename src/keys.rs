//! Keypair handling, event signing, and NIP-19 identifier encoding.

use std::time::{SystemTime, UNIX_EPOCH};

use secp256k1::{schnorr::Signature, All, Keypair, Message, Secp256k1, XOnlyPublicKey};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::{
    error::{Error, Result},
    event::{Event, Tag},
};

/// Human-readable part of a bech32-encoded public key.
const NPUB_HRP: &str = "npub";

/// Secp256k1 keypair acting as the event signer.
pub struct Keys {
    secp: Secp256k1<All>,
    keypair: Keypair,
}

impl Keys {
    /// Generate a fresh random identity.
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let keypair = Keypair::new(&secp, &mut rand::thread_rng());
        Self { secp, keypair }
    }

    /// Load an identity from a hex-encoded 32-byte secret key.
    pub fn from_secret_hex(secret: &str) -> Result<Self> {
        let bytes = hex::decode(secret).map_err(|e| Error::Signer(e.to_string()))?;
        let secp = Secp256k1::new();
        let keypair = Keypair::from_seckey_slice(&secp, &bytes)
            .map_err(|e| Error::Signer(e.to_string()))?;
        Ok(Self { secp, keypair })
    }

    /// Author public key as 64 hex characters.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.keypair.x_only_public_key().0.serialize())
    }

    /// Secret key as hex, for persisting in the `.env` file.
    pub fn secret_key_hex(&self) -> String {
        hex::encode(self.keypair.secret_bytes())
    }

    /// Author public key in bech32 `npub` form.
    pub fn npub(&self) -> Result<String> {
        hex_to_npub(&self.public_key_hex())
    }

    /// Sign `content` as an event of the given kind, timestamped now.
    pub fn sign(&self, kind: u32, tags: Vec<Tag>, content: &str) -> Result<Event> {
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| Error::Signer(e.to_string()))?
            .as_secs();
        self.sign_at(kind, tags, content, created_at)
    }

    /// Sign with an explicit timestamp. The id and signature are
    /// deterministic given identity, content, and timestamp.
    pub fn sign_at(&self, kind: u32, tags: Vec<Tag>, content: &str, created_at: u64) -> Result<Event> {
        let mut ev = Event {
            id: String::new(),
            pubkey: self.public_key_hex(),
            kind,
            created_at,
            tags,
            content: content.to_string(),
            sig: String::new(),
        };
        let hash = event_hash(&ev)?;
        ev.id = hex::encode(hash);
        let msg = Message::from_digest_slice(&hash).map_err(|e| Error::Signer(e.to_string()))?;
        let sig = self.secp.sign_schnorr_no_aux_rand(&msg, &self.keypair);
        ev.sig = hex::encode(sig.as_ref());
        Ok(ev)
    }
}

/// Compute the NIP-01 event hash: SHA-256 over the canonical
/// `[0, pubkey, created_at, kind, tags, content]` serialization.
pub fn event_hash(ev: &Event) -> Result<[u8; 32]> {
    let arr = serde_json::json!([0, ev.pubkey, ev.created_at, ev.kind, ev.tags, ev.content]);
    let data = serde_json::to_vec(&arr).map_err(|e| Error::Signer(e.to_string()))?;
    let hash = Sha256::digest(&data);
    Ok(hash.into())
}

/// Check an event's id and Schnorr signature against its contents.
pub fn verify_event(ev: &Event) -> Result<()> {
    let hash = event_hash(ev)?;
    if hex::encode(hash) != ev.id {
        return Err(Error::InvalidEvent("id mismatch".into()));
    }
    let sig_bytes = hex::decode(&ev.sig).map_err(|e| Error::InvalidEvent(e.to_string()))?;
    let sig = Signature::from_slice(&sig_bytes).map_err(|e| Error::InvalidEvent(e.to_string()))?;
    let pk_bytes = hex::decode(&ev.pubkey).map_err(|e| Error::InvalidEvent(e.to_string()))?;
    let pk = XOnlyPublicKey::from_slice(&pk_bytes).map_err(|e| Error::InvalidEvent(e.to_string()))?;
    let secp = Secp256k1::verification_only();
    let msg = Message::from_digest_slice(&hash).map_err(|e| Error::InvalidEvent(e.to_string()))?;
    secp.verify_schnorr(&sig, &msg, &pk)
        .map_err(|e| Error::InvalidEvent(e.to_string()))
}

/// Decode a bech32 `npub` identifier to its 64-character hex form.
pub fn npub_to_hex(encoded: &str) -> Result<String> {
    let (hrp, data) =
        bech32::decode(encoded).map_err(|e| Error::InvalidEncoding(e.to_string()))?;
    if hrp.as_str() != NPUB_HRP {
        return Err(Error::InvalidEncoding(format!(
            "expected hrp {NPUB_HRP}, got {hrp}"
        )));
    }
    if data.len() != 32 {
        return Err(Error::InvalidEncoding(format!(
            "expected 32 bytes, got {}",
            data.len()
        )));
    }
    Ok(hex::encode(data))
}

/// Encode a 64-character hex public key as a bech32 `npub` identifier.
pub fn hex_to_npub(pubkey: &str) -> Result<String> {
    let bytes = hex::decode(pubkey).map_err(|e| Error::InvalidEncoding(e.to_string()))?;
    if bytes.len() != 32 {
        return Err(Error::InvalidEncoding(format!(
            "expected 32 bytes, got {}",
            bytes.len()
        )));
    }
    let hrp = bech32::Hrp::parse(NPUB_HRP).map_err(|e| Error::InvalidEncoding(e.to_string()))?;
    bech32::encode::<bech32::Bech32>(hrp, &bytes)
        .map_err(|e| Error::InvalidEncoding(e.to_string()))
}

/// Convert a pubkey in either `npub` or raw hex form to hex. Invalid `npub`
/// input is returned unchanged after a warning, so callers that compare the
/// result against the input can treat "unchanged" as the error signal.
pub fn pubkey_to_hex(input: &str) -> String {
    if !input.starts_with(NPUB_HRP) {
        return input.to_string();
    }
    match npub_to_hex(input) {
        Ok(hex) => hex,
        Err(e) => {
            warn!(input, %e, "invalid bech32 identifier, passing through");
            input.to_string()
        }
    }
}
