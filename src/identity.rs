//! Peer identity and invite tie-breaking

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque, stable identifier of a device on the local radio link
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Identity of the local device, created once at startup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub id: PeerId,
    /// Unique per installation; decides which side of a pair sends the invitation
    pub tie_break_key: String,
}

impl PeerIdentity {
    pub fn new(id: impl Into<String>, tie_break_key: impl Into<String>) -> Self {
        Self {
            id: PeerId::new(id),
            tie_break_key: tie_break_key.into(),
        }
    }

    /// Create an identity with a freshly generated tie-break key
    pub fn generate(id: impl Into<String>) -> Self {
        Self::new(id, Uuid::new_v4().to_string())
    }
}

/// Decides which side of a peer pair initiates the invitation.
///
/// Implementations must be total and antisymmetric: for distinct keys exactly
/// one of `local_invites(a, b)` and `local_invites(b, a)` is true.
pub trait TieBreaker: Send + Sync {
    fn local_invites(&self, local_key: &str, remote_key: &str) -> bool;
}

/// The side whose key sorts first (byte-wise) invites
#[derive(Debug, Clone, Copy, Default)]
pub struct LexicographicTieBreaker;

impl TieBreaker for LexicographicTieBreaker {
    fn local_invites(&self, local_key: &str, remote_key: &str) -> bool {
        local_key < remote_key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exactly_one_side_invites() {
        let tb = LexicographicTieBreaker;
        let keys = ["a1", "b2", "0f3e", "A1", "a10", "zz"];

        for a in keys {
            for b in keys {
                if a == b {
                    continue;
                }
                assert_ne!(
                    tb.local_invites(a, b),
                    tb.local_invites(b, a),
                    "keys {a} and {b} must produce exactly one inviter"
                );
            }
        }
    }

    #[test]
    fn test_lower_key_invites() {
        let tb = LexicographicTieBreaker;
        assert!(tb.local_invites("a1", "b2"));
        assert!(!tb.local_invites("b2", "a1"));
        assert!(!tb.local_invites("a1", "a1"));
    }

    #[test]
    fn test_generated_keys_are_unique() {
        let a = PeerIdentity::generate("phone");
        let b = PeerIdentity::generate("phone");
        assert_eq!(a.id, b.id);
        assert_ne!(a.tie_break_key, b.tie_break_key);
    }
}
