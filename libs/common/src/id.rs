use ulid::Ulid;

/// Generates a new ULID-based ID with the given prefix.
///
/// # Examples
/// ```
/// let id = chirp_common::id::prefixed_ulid("ws");
/// assert!(id.starts_with("ws_"));
/// ```
pub fn prefixed_ulid(prefix: &str) -> String {
    format!("{}_{}", prefix, Ulid::new())
}

/// Marker trait for types whose identifiers carry a fixed prefix.
pub trait PrefixedId {
    const PREFIX: &'static str;

    fn generate() -> String {
        prefixed_ulid(Self::PREFIX)
    }
}

/// Well-known ID prefixes.
pub mod prefix {
    /// A live websocket session.
    pub const SESSION: &str = "ws";
    /// A chat message persisted without a client-supplied id.
    pub const MESSAGE: &str = "msg";
    /// A push notification (one logical send, shared across its retries).
    pub const NOTIFICATION: &str = "ntf";
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Notification;

    impl PrefixedId for Notification {
        const PREFIX: &'static str = prefix::NOTIFICATION;
    }

    #[test]
    fn prefixed_ulid_format() {
        let id = prefixed_ulid(prefix::SESSION);
        assert!(id.starts_with("ws_"));
        // ULID is 26 chars, plus prefix + underscore
        assert_eq!(id.len(), 3 + 26);
    }

    #[test]
    fn ids_are_unique() {
        let a = prefixed_ulid(prefix::MESSAGE);
        let b = prefixed_ulid(prefix::MESSAGE);
        assert_ne!(a, b);
    }

    #[test]
    fn prefixed_id_generate_uses_prefix() {
        assert!(Notification::generate().starts_with("ntf_"));
    }
}
