//! Item identity.
//!
//! Every replicated item is addressed by `(client, clock)`: the client that
//! created it and that client's sequence number at creation time. A run of
//! `len` elements occupies `clock..clock + len` in its client's id space.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a replica (one per document instance).
pub type ClientId = u64;

/// Per-client sequence number.
pub type Clock = u32;

/// Maximum accepted length for document and user identifiers.
pub const MAX_ID_LEN: usize = 128;

/// Globally unique item identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id {
    pub client: ClientId,
    pub clock: Clock,
}

impl Id {
    pub const fn new(client: ClientId, clock: Clock) -> Self {
        Self { client, clock }
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.client, self.clock)
    }
}

/// Generate a random client id.
///
/// Kept within 53 bits so ids survive a round-trip through JavaScript peers.
pub fn random_client_id() -> ClientId {
    let (hi, _) = Uuid::new_v4().as_u64_pair();
    hi & 0x001F_FFFF_FFFF_FFFF
}

/// Validate an externally supplied document or user identifier.
///
/// Accepts 1..=128 characters from `[A-Za-z0-9_:-]`.
pub fn is_valid_id(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= MAX_ID_LEN
        && s
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b':')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_ids() {
        assert!(is_valid_id("doc-1"));
        assert!(is_valid_id("global:tables"));
        assert!(is_valid_id("tbl_ABC123"));
        assert!(is_valid_id(&"a".repeat(MAX_ID_LEN)));
    }

    #[test]
    fn test_invalid_ids() {
        assert!(!is_valid_id(""));
        assert!(!is_valid_id("has space"));
        assert!(!is_valid_id("slash/doc"));
        assert!(!is_valid_id("ünicode"));
        assert!(!is_valid_id(&"a".repeat(MAX_ID_LEN + 1)));
    }

    #[test]
    fn test_random_client_id_fits_53_bits() {
        for _ in 0..64 {
            assert!(random_client_id() < (1u64 << 53));
        }
    }

    #[test]
    fn test_id_ordering() {
        assert!(Id::new(1, 5) < Id::new(2, 0));
        assert!(Id::new(1, 5) < Id::new(1, 6));
        assert_eq!(Id::new(3, 4).to_string(), "3#4");
    }
}
