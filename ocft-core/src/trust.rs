//! Trust: peers sharing a secret with this node, and the auto-accept decision for offers.

use std::collections::HashMap;

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::integrity;
use crate::protocol::OfferPayload;

/// A peer this node trusts. Supplied by the host's peer store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustedPeer {
    pub id: String,
    /// Shared value known to both sides.
    pub secret: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Absolute trust expiry, ms since epoch.
    #[serde(default)]
    pub expires_at: Option<u64>,
}

impl TrustedPeer {
    pub fn new(id: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            secret: secret.into(),
            name: None,
            expires_at: None,
        }
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at.is_some_and(|t| now_ms > t)
    }
}

/// Lookup of trusted peers by id.
pub trait TrustStore: Send {
    fn get(&self, peer_id: &str) -> Option<TrustedPeer>;
}

/// `TrustStore` over an in-memory map.
#[derive(Debug, Clone, Default)]
pub struct MemoryTrustStore {
    peers: HashMap<String, TrustedPeer>,
}

impl MemoryTrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, peer: TrustedPeer) {
        self.peers.insert(peer.id.clone(), peer);
    }
}

impl FromIterator<TrustedPeer> for MemoryTrustStore {
    fn from_iter<I: IntoIterator<Item = TrustedPeer>>(iter: I) -> Self {
        let mut store = Self::new();
        for peer in iter {
            store.insert(peer);
        }
        store
    }
}

impl TrustStore for MemoryTrustStore {
    fn get(&self, peer_id: &str) -> Option<TrustedPeer> {
        self.peers.get(peer_id).cloned()
    }
}

/// Outcome of auto-accept evaluation for an incoming offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoAccept {
    /// The offer proved knowledge of this node's secret within its TTL.
    Secret,
    /// Legacy mode: the sender is a trusted peer with an unexpired trust window.
    TrustedPeer,
    /// Leave pending for a manual decision.
    Manual,
}

impl AutoAccept {
    pub fn accepts(self) -> bool {
        !matches!(self, AutoAccept::Manual)
    }
}

/// Decide whether to auto-accept `offer` from `sender`.
///
/// Checked in order: the offer's secret against `own_secret` (honouring `secretTTL`), then,
/// only when `legacy_auto_accept` is on, the sender's entry in the trust store.
pub fn evaluate_offer(
    offer: &OfferPayload,
    own_secret: Option<&str>,
    sender: Option<&TrustedPeer>,
    legacy_auto_accept: bool,
    now_ms: u64,
) -> AutoAccept {
    if let (Some(claimed), Some(own)) = (offer.secret.as_deref(), own_secret) {
        let ttl_ok = offer.secret_ttl.map_or(true, |ttl| now_ms <= ttl);
        if !own.is_empty() && ttl_ok && integrity::secrets_match(claimed, own) {
            return AutoAccept::Secret;
        }
    }
    if legacy_auto_accept {
        if let Some(peer) = sender {
            if !peer.is_expired(now_ms) {
                return AutoAccept::TrustedPeer;
            }
        }
    }
    AutoAccept::Manual
}

/// Fresh random secret: 32 lowercase hex characters from the OS RNG.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_700_000_000_000;

    fn offer(secret: Option<&str>, ttl: Option<u64>) -> OfferPayload {
        OfferPayload {
            filename: "a.bin".into(),
            size: 10,
            mime_type: "application/octet-stream".into(),
            hash: "00".into(),
            chunk_size: 1024,
            total_chunks: 1,
            secret: secret.map(String::from),
            secret_ttl: ttl,
            resume_from: None,
            metadata: None,
        }
    }

    #[test]
    fn matching_secret_without_ttl() {
        let d = evaluate_offer(&offer(Some("k"), None), Some("k"), None, false, NOW);
        assert_eq!(d, AutoAccept::Secret);
        assert!(d.accepts());
    }

    #[test]
    fn ttl_boundaries() {
        let own = Some("k");
        assert_eq!(
            evaluate_offer(&offer(Some("k"), Some(NOW)), own, None, false, NOW),
            AutoAccept::Secret
        );
        assert_eq!(
            evaluate_offer(&offer(Some("k"), Some(NOW + 1)), own, None, false, NOW),
            AutoAccept::Secret
        );
        assert_eq!(
            evaluate_offer(&offer(Some("k"), Some(NOW - 1)), own, None, false, NOW),
            AutoAccept::Manual
        );
    }

    #[test]
    fn wrong_or_absent_secret_stays_manual() {
        assert_eq!(
            evaluate_offer(&offer(Some("nope"), None), Some("k"), None, false, NOW),
            AutoAccept::Manual
        );
        assert_eq!(
            evaluate_offer(&offer(None, None), Some("k"), None, false, NOW),
            AutoAccept::Manual
        );
        // A node without a secret never matches, not even an empty claim.
        assert_eq!(
            evaluate_offer(&offer(Some(""), None), Some(""), None, false, NOW),
            AutoAccept::Manual
        );
    }

    #[test]
    fn legacy_trusted_peer() {
        let mut peer = TrustedPeer::new("alice", "shared");
        let o = offer(None, None);
        assert_eq!(
            evaluate_offer(&o, None, Some(&peer), false, NOW),
            AutoAccept::Manual
        );
        assert_eq!(
            evaluate_offer(&o, None, Some(&peer), true, NOW),
            AutoAccept::TrustedPeer
        );
        peer.expires_at = Some(NOW - 1);
        assert_eq!(
            evaluate_offer(&o, None, Some(&peer), true, NOW),
            AutoAccept::Manual
        );
    }

    #[test]
    fn secret_takes_precedence_over_legacy() {
        let peer = TrustedPeer::new("alice", "shared");
        assert_eq!(
            evaluate_offer(&offer(Some("k"), None), Some("k"), Some(&peer), true, NOW),
            AutoAccept::Secret
        );
    }

    #[test]
    fn store_lookup() {
        let store: MemoryTrustStore = [TrustedPeer::new("alice", "a"), TrustedPeer::new("bob", "b")]
            .into_iter()
            .collect();
        assert_eq!(store.get("bob").unwrap().secret, "b");
        assert!(store.get("carol").is_none());
    }

    #[test]
    fn generated_secrets_are_hex_and_distinct() {
        let a = generate_secret();
        let b = generate_secret();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
