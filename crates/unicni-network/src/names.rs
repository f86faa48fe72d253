//! Interface name derivation.
//!
//! Every kernel object the plugin touches is named deterministically from the
//! topology, so a later DEL (or a re-delivered ADD) finds the same objects
//! without any stored state. The derivation never truncates; callers decide
//! what to do with names that do not fit with [`check_ifname`].

use unicni_common::{UnicniError, UnicniResult};

/// Longest interface name the kernel accepts (`IFNAMSIZ - 1`).
pub const MAX_IFNAME_LEN: usize = 15;

/// Bridge name for a system channel: `<credential>-<group>-<channel>`.
#[must_use]
pub fn channel_bridge_name(credential: &str, group: &str, channel: &str) -> String {
    format!("{credential}-{group}-{channel}")
}

/// Bridge name for a bridge-mode external port.
///
/// The parts are concatenated without separators.
#[must_use]
pub fn external_bridge_name(
    credential: &str,
    group: &str,
    device_id: &str,
    container_port: &str,
) -> String {
    format!("{credential}{group}{device_id}{container_port}")
}

/// Check that `name` is a usable interface name.
///
/// Follows the kernel's rules: non-empty, at most [`MAX_IFNAME_LEN`] bytes,
/// not `.` or `..`, and free of `/`, `:` and whitespace.
///
/// # Errors
///
/// Returns [`UnicniError::TooLong`] when the name exceeds [`MAX_IFNAME_LEN`]
/// and [`UnicniError::InvalidName`] for the other rules.
pub fn check_ifname(name: &str) -> UnicniResult<()> {
    let invalid = |reason: &str| UnicniError::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() {
        return Err(invalid("empty"));
    }
    if name.len() > MAX_IFNAME_LEN {
        return Err(UnicniError::TooLong {
            name: name.to_string(),
            max: MAX_IFNAME_LEN,
        });
    }
    if name == "." || name == ".." {
        return Err(invalid("reserved"));
    }
    if name.chars().any(|c| c == '/' || c == ':' || c.is_whitespace()) {
        return Err(invalid("contains '/', ':' or whitespace"));
    }
    Ok(())
}

/// Random candidate for an ephemeral interface: `prefix` plus 8 hex digits.
#[must_use]
pub fn random_ifname(prefix: &str) -> String {
    let uuid = uuid::Uuid::new_v4();
    format!("{prefix}{}", hex::encode(&uuid.as_bytes()[..4]))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn channel_name_uses_dashes() {
        assert_eq!(channel_bridge_name("c1", "g1", "ctrl"), "c1-g1-ctrl");
    }

    #[test]
    fn external_name_has_no_separators() {
        assert_eq!(external_bridge_name("c1", "g1", "d7", "net1"), "c1g1d7net1");
        assert_eq!(external_bridge_name("c1", "g1", "", "net1"), "c1g1net1");
    }

    #[test]
    fn length_gate() {
        let name = channel_bridge_name("aaaaaaaaaa", "bbbbb", "ctrl");
        assert_eq!(name.len(), 21);
        assert!(matches!(
            check_ifname(&name),
            Err(UnicniError::TooLong { max: 15, .. })
        ));
        assert!(check_ifname("exactly15chars_").is_ok());
    }

    #[test]
    fn kernel_name_rules() {
        for bad in ["", ".", "..", "eth/0", "eth:0", "eth 0", "eth\t0"] {
            assert!(
                matches!(check_ifname(bad), Err(UnicniError::InvalidName { .. })),
                "{bad:?} should be rejected"
            );
        }
        assert!(check_ifname("net1.100").is_ok());
        assert!(check_ifname("c1-g1-ctrl").is_ok());
    }

    #[test]
    fn random_names_fit() {
        let a = random_ifname("veth");
        let b = random_ifname("veth");
        assert_eq!(a.len(), 12);
        assert!(a.starts_with("veth"));
        assert_ne!(a, b);
        assert!(check_ifname(&a).is_ok());
    }

    proptest! {
        #[test]
        fn derivation_is_deterministic(
            cred in "[a-z0-9]{1,8}",
            group in "[a-z0-9]{1,8}",
            chan in "[a-z]{1,6}",
        ) {
            let name = channel_bridge_name(&cred, &group, &chan);
            prop_assert_eq!(&name, &channel_bridge_name(&cred, &group, &chan));
            prop_assert_eq!(name.len(), cred.len() + group.len() + chan.len() + 2);
            prop_assert_eq!(check_ifname(&name).is_ok(), name.len() <= MAX_IFNAME_LEN);
        }
    }
}
