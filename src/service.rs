//! Deterministic service identity.
//!
//! Both peers derive the identifier of a service independently; they agree
//! iff they agree on the service name and the input schema name, which is
//! exactly the condition for the first message of a channel to be routable.

/// 64-bit identifier of a named service contract.
pub type ServiceId = u64;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Derive the identifier of a service from its full name and the stable
/// identity of its input type.
#[must_use]
pub const fn service_id(service_name: &str, input_type_name: &str) -> ServiceId {
    let hash = fnv1a(FNV_OFFSET, service_name.as_bytes());
    let hash = fnv1a(hash, b"/");
    fnv1a(hash, input_type_name.as_bytes())
}

const fn fnv1a(mut hash: u64, bytes: &[u8]) -> u64 {
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
        i += 1;
    }
    hash
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::service_id;

    #[rstest]
    fn identical_inputs_agree() {
        assert_eq!(
            service_id("node/list", "pipemux.NodeListRequest"),
            service_id("node/list", "pipemux.NodeListRequest"),
        );
    }

    #[rstest]
    fn name_and_input_type_both_matter() {
        let base = service_id("echo", "Ping");
        assert_ne!(base, service_id("echo2", "Ping"));
        assert_ne!(base, service_id("echo", "Pong"));
    }

    #[rstest]
    fn separator_prevents_boundary_aliasing() {
        assert_ne!(service_id("ab", "c"), service_id("a", "bc"));
    }
}
