//! Deterministic port naming.
//!
//! Attach and detach run as separate plugin invocations with no shared
//! state, so the port name must be recomputable from the CNI inputs alone.

use sha1::{Digest, Sha1};

/// Prefix on every port the plugin creates. The audit daemon uses it as the
/// ownership marker: state without the prefix is never touched.
pub const PORT_NAME_PREFIX: &str = "vp";

/// Hex digits of the digest kept in the name. With the prefix this stays
/// inside IFNAMSIZ.
const NAME_DIGEST_LEN: usize = 13;

/// Computes the port (and host-side veth) name for an interface inside a
/// workload. Pure function of its inputs: the same container and interface
/// always map to the same name, across invocations and hosts.
pub fn port_name(ifname: &str, entity_id: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(ifname.as_bytes());
    hasher.update(entity_id.replace('-', "").as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{PORT_NAME_PREFIX}{}", &digest[..NAME_DIGEST_LEN])
}

/// Normalizes a Mesos container id into the form stored in the entity
/// table: dashes stripped, then the result doubled (Mesos ids are too short
/// to fill a UUID column on their own).
pub fn normalize_mesos_id(raw: &str) -> String {
    let stripped = raw.replace('-', "");
    format!("{stripped}{stripped}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn name_is_deterministic() {
        let a = port_name("eth0", "73c1c376-04bb-48a6-9668-d8d9c65d7cf5");
        let b = port_name("eth0", "73c1c376-04bb-48a6-9668-d8d9c65d7cf5");
        assert_eq!(a, b);
    }

    #[test]
    fn name_shape() {
        let name = port_name("eth0", "73c1c376-04bb-48a6-9668-d8d9c65d7cf5");
        assert!(name.starts_with(PORT_NAME_PREFIX));
        assert_eq!(name.len(), PORT_NAME_PREFIX.len() + NAME_DIGEST_LEN);
        assert!(name[PORT_NAME_PREFIX.len()..]
            .chars()
            .all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn dashes_in_the_id_do_not_matter() {
        assert_eq!(
            port_name("eth0", "73c1c376-04bb-48a6-9668-d8d9c65d7cf5"),
            port_name("eth0", "73c1c37604bb48a69668d8d9c65d7cf5"),
        );
    }

    #[test]
    fn distinct_inputs_give_distinct_names() {
        let base = port_name("eth0", "aaaa");
        assert_ne!(base, port_name("eth1", "aaaa"));
        assert_ne!(base, port_name("eth0", "aaab"));
    }

    #[test]
    fn mesos_id_is_stripped_and_doubled() {
        assert_eq!(normalize_mesos_id("ab-cd"), "abcdabcd");
        assert_eq!(normalize_mesos_id("abcd"), "abcdabcd");
    }
}
