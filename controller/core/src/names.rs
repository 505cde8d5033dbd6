//! Shadow-service naming.
//!
//! A shadow service is named `<meshNamespace>-<userName>-6d61657368-<userNamespace>`.
//! The literal `6d61657368` is the hex encoding of `mesh`; it acts as a
//! delimiter that no reasonable Kubernetes name collides with, which lets the
//! name be parsed back into the user service it mirrors.

use crate::ResourceId;
use sha2::{Digest, Sha256};

const DELIMITER: &str = "6d61657368";

// DNS-1035 label limit for Service names.
const MAX_NAME_LEN: usize = 63;

// Width of the digest fragment substituted for over-long user names.
const DIGEST_LEN: usize = 10;

/// Returns the deterministic shadow-service name for a user service.
///
/// When the composed name would exceed the 63-character Service name limit,
/// the user-name fragment is replaced with a truncated SHA-256 digest of the
/// user service identity. Such names cannot be parsed back; ownership of the
/// shadow is then established through its back-reference labels.
pub fn shadow_service(mesh_namespace: &str, id: &ResourceId) -> String {
    let name = format!(
        "{mesh_namespace}-{}-{DELIMITER}-{}",
        id.name, id.namespace
    );
    if name.len() <= MAX_NAME_LEN {
        return name;
    }

    let digest = Sha256::new()
        .chain_update(id.namespace.as_bytes())
        .chain_update(b"/")
        .chain_update(id.name.as_bytes())
        .finalize();
    let digest = format!("{digest:x}");
    format!(
        "{mesh_namespace}-{}-{DELIMITER}-{}",
        &digest[..DIGEST_LEN],
        id.namespace
    )
}

/// Recovers the user service identity from a shadow-service name.
///
/// Returns `None` for names that do not follow the naming scheme.
pub fn parse_shadow_service(mesh_namespace: &str, name: &str) -> Option<ResourceId> {
    let rest = name
        .strip_prefix(mesh_namespace)?
        .strip_prefix('-')?;
    let (user_name, user_namespace) = rest.rsplit_once(&format!("-{DELIMITER}-"))?;
    if user_name.is_empty() || user_namespace.is_empty() {
        return None;
    }
    Some(ResourceId::new(user_namespace, user_name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composes_and_parses() {
        let id = ResourceId::new("a", "foo");
        let name = shadow_service("mesh", &id);
        assert_eq!(name, "mesh-foo-6d61657368-a");
        assert_eq!(parse_shadow_service("mesh", &name), Some(id));
    }

    #[test]
    fn name_is_stable() {
        let id = ResourceId::new("a", "foo");
        assert_eq!(shadow_service("mesh", &id), shadow_service("mesh", &id));
    }

    #[test]
    fn survives_dashes_in_names() {
        let id = ResourceId::new("my-ns", "my-svc-v2");
        let name = shadow_service("trellis", &id);
        assert_eq!(parse_shadow_service("trellis", &name), Some(id));
    }

    #[test]
    fn long_names_are_digested() {
        let id = ResourceId::new("a", "x".repeat(60));
        let name = shadow_service("mesh", &id);
        assert!(name.len() <= 63, "{name} exceeds the Service name limit");
        // The digest fragment is not the user name, so the parse result does
        // not round-trip for digested names.
        assert_ne!(parse_shadow_service("mesh", &name), Some(id));
    }

    #[test]
    fn rejects_foreign_names() {
        assert_eq!(parse_shadow_service("mesh", "kubernetes"), None);
        assert_eq!(parse_shadow_service("mesh", "mesh-foo"), None);
        assert_eq!(parse_shadow_service("other", "mesh-foo-6d61657368-a"), None);
        assert_eq!(parse_shadow_service("mesh", "mesh--6d61657368-a"), None);
    }
}
