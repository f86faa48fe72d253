//! Common error types for the unicni plugin.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`UnicniError`].
pub type UnicniResult<T> = Result<T, UnicniError>;

/// Errors raised while parsing a topology or realizing it in the kernel.
#[derive(Error, Diagnostic, Debug)]
pub enum UnicniError {
    /// A required topology field is missing or empty.
    #[error("Missing required field: {field}")]
    #[diagnostic(
        code(unicni::spec::missing_field),
        help("The network_info annotation must carry non-empty 'credential' and 'group' keys")
    )]
    MissingRequiredField {
        /// The missing field.
        field: String,
    },

    /// A device with the requested name exists but is of another kind.
    #[error("{name:?} already exists but is a {actual} device, not a {expected}")]
    #[diagnostic(code(unicni::link::wrong_type))]
    WrongDeviceType {
        /// Device name.
        name: String,
        /// The kind that was requested.
        expected: String,
        /// The kind found in the kernel.
        actual: String,
    },

    /// Link or bridge is absent.
    #[error("Link not found: {name}")]
    #[diagnostic(code(unicni::link::not_found))]
    NotFound {
        /// Link name.
        name: String,
    },

    /// The kernel refused a create because the name is in use.
    #[error("Link already exists: {name}")]
    #[diagnostic(code(unicni::link::exists))]
    AlreadyExists {
        /// Link name.
        name: String,
    },

    /// An explicitly requested interface name collides with an existing link.
    #[error("Requested interface name {name:?} is already taken")]
    #[diagnostic(
        code(unicni::veth::name_taken),
        help("Remove the stale interface or pick another container port name")
    )]
    NameTaken {
        /// The requested name.
        name: String,
    },

    /// Every generated peer name collided with an existing link.
    #[error("Could not find a unique peer name after {attempts} attempts")]
    #[diagnostic(code(unicni::veth::no_unique_name))]
    NoUniqueName {
        /// Number of candidates tried.
        attempts: usize,
    },

    /// Unknown macvlan forwarding mode.
    #[error("Unknown macvlan mode: {mode:?}")]
    #[diagnostic(
        code(unicni::macvlan::invalid_mode),
        help("Valid modes are bridge, private, vepa and passthru")
    )]
    InvalidMode {
        /// The rejected mode string.
        mode: String,
    },

    /// Malformed CIDR address.
    #[error("Invalid address: {address:?}")]
    #[diagnostic(
        code(unicni::addr::invalid),
        help("Use address/prefix notation, e.g. 10.0.0.5/24 or fd00::5/64")
    )]
    InvalidAddress {
        /// The rejected address string.
        address: String,
    },

    /// A derived interface name exceeds the kernel limit.
    #[error("Interface name {name:?} is longer than {max} characters")]
    #[diagnostic(code(unicni::names::too_long))]
    TooLong {
        /// The derived name.
        name: String,
        /// Kernel limit.
        max: usize,
    },

    /// An interface name the kernel would reject for reasons other than length.
    #[error("Invalid interface name {name:?}: {reason}")]
    #[diagnostic(code(unicni::names::invalid))]
    InvalidName {
        /// The rejected name.
        name: String,
        /// What is wrong with it.
        reason: String,
    },

    /// Opening or entering a network namespace failed.
    #[error("Network namespace error ({path}): {message}")]
    #[diagnostic(code(unicni::netns))]
    Namespace {
        /// Namespace path.
        path: String,
        /// The error message.
        message: String,
    },

    /// Any other kernel link operation failure.
    #[error("Netlink {operation} failed for {name:?}: {message}")]
    #[diagnostic(code(unicni::netlink))]
    Netlink {
        /// Operation that failed (add, set, delete, ...).
        operation: String,
        /// Entity the operation targeted.
        name: String,
        /// The error message.
        message: String,
    },

    /// Fetching pod metadata from the API server failed.
    #[error("Annotation lookup failed: {message}")]
    #[diagnostic(
        code(unicni::annotation),
        help("Check the apiServer address in the network configuration")
    )]
    Annotation {
        /// The error message.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(unicni::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(unicni::serialization))]
    Serialization(String),

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(unicni::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// Feature not supported on this platform.
    #[error("Feature not supported: {feature}")]
    #[diagnostic(
        code(unicni::unsupported),
        help("Network namespaces and netlink are only available on Linux")
    )]
    Unsupported {
        /// The unsupported feature.
        feature: String,
    },
}

impl UnicniError {
    /// Whether the error means the target object does not exist.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Shorthand for a [`UnicniError::Netlink`] failure.
    pub fn netlink(
        operation: impl Into<String>,
        name: impl Into<String>,
        message: impl std::fmt::Display,
    ) -> Self {
        Self::Netlink {
            operation: operation.into(),
            name: name.into(),
            message: message.to_string(),
        }
    }
}

impl From<serde_json::Error> for UnicniError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = UnicniError::WrongDeviceType {
            name: "c1-g1-ctrl".to_string(),
            expected: "bridge".to_string(),
            actual: "veth".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "\"c1-g1-ctrl\" already exists but is a veth device, not a bridge"
        );
    }

    #[test]
    fn not_found_is_distinguished() {
        assert!(UnicniError::NotFound { name: "p0".into() }.is_not_found());
        assert!(!UnicniError::netlink("delete", "p0", "EPERM").is_not_found());
    }

    #[test]
    fn error_from_json() {
        let err: UnicniError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, UnicniError::Serialization(_)));
    }
}
