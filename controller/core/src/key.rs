//! Deterministic configuration keys.
//!
//! Every router, service and middleware in the dynamic configuration is keyed
//! by its human-readable identity fragments followed by a truncated SHA-256
//! digest of the same fragments. The digest disambiguates identities whose
//! joined fragments would otherwise collide (`a-b` + `c` vs `a` + `b-c`).

use sha2::{Digest, Sha256};

const DIGEST_LEN: usize = 10;

/// Builds a configuration key from identity fragments.
///
/// Identical fragments always produce identical keys, independent of the
/// order in which the rest of the configuration is assembled.
pub fn config_key(fragments: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for fragment in fragments {
        hasher.update(fragment.as_bytes());
        // NUL-separate fragments so their boundaries contribute to the digest.
        hasher.update([0u8]);
    }
    let digest = format!("{:x}", hasher.finalize());
    format!("{}-{}", fragments.join("-"), &digest[..DIGEST_LEN])
}

#[cfg(test)]
mod tests {
    use super::config_key;

    #[test]
    fn keys_are_stable() {
        assert_eq!(
            config_key(&["a", "foo", "80"]),
            config_key(&["a", "foo", "80"]),
        );
    }

    #[test]
    fn keys_are_prefixed_and_truncated() {
        let key = config_key(&["a", "foo", "80"]);
        assert!(key.starts_with("a-foo-80-"));
        assert_eq!(key.len(), "a-foo-80-".len() + 10);
    }

    #[test]
    fn fragment_boundaries_matter() {
        assert_ne!(config_key(&["a-b", "c"]), config_key(&["a", "b-c"]));
    }
}
