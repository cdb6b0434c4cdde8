//! Key canonicalisation.

/// Canonical map key for a raw key: lowercase hex.
///
/// Two byte sequences address the same entry iff their canonical forms match.
pub fn canonical_key(key: &[u8]) -> String {
    hex::encode(key)
}
