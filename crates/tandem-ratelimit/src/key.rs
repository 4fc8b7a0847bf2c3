use std::fmt;

use crate::constants::MAX_IDENTITY_LENGTH;
use crate::constants::MAX_SCOPE_LENGTH;
use crate::error::RateLimitError;

/// Store key of one bucket: `{prefix}:tb:{{scope}}:{identity}`.
///
/// The scope sits inside braces so that clustered stores hashing on `{...}`
/// tags place every bucket of a scope on one shard. Scopes and identities are
/// opaque caller-defined strings; only their shape is checked.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey(String);

impl BucketKey {
    pub fn new(prefix: &str, scope: &str, identity: &str) -> Result<Self, RateLimitError> {
        validate_scope(scope)?;
        validate_identity(identity)?;
        Ok(Self(format!("{prefix}:tb:{{{scope}}}:{identity}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for BucketKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn invalid(reason: impl Into<String>) -> RateLimitError {
    RateLimitError::InvalidKey { reason: reason.into() }
}

/// Check that `scope` can appear in a bucket key.
pub fn validate_scope(scope: &str) -> Result<(), RateLimitError> {
    if scope.is_empty() {
        return Err(invalid("scope is empty"));
    }
    if scope.len() > MAX_SCOPE_LENGTH {
        return Err(invalid(format!("scope exceeds {MAX_SCOPE_LENGTH} bytes")));
    }
    if scope.chars().any(|c| c.is_whitespace() || c.is_control() || c == '{' || c == '}') {
        return Err(invalid(format!("scope '{scope}' contains whitespace or braces")));
    }
    Ok(())
}

fn validate_identity(identity: &str) -> Result<(), RateLimitError> {
    if identity.is_empty() {
        return Err(invalid("identity is empty"));
    }
    if identity.len() > MAX_IDENTITY_LENGTH {
        return Err(invalid(format!("identity exceeds {MAX_IDENTITY_LENGTH} bytes")));
    }
    if identity.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(invalid("identity contains whitespace"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_wraps_scope_in_hash_tag() {
        let key = BucketKey::new("rl", "chat-send", "user:42").unwrap();
        assert_eq!(key.as_str(), "rl:tb:{chat-send}:user:42");
    }

    #[test]
    fn ipv6_identity_is_accepted() {
        let key = BucketKey::new("rl", "api", "ip:::1").unwrap();
        assert_eq!(key.to_string(), "rl:tb:{api}:ip:::1");
    }

    #[test]
    fn empty_parts_are_rejected() {
        assert!(matches!(BucketKey::new("rl", "", "user:1"), Err(RateLimitError::InvalidKey { .. })));
        assert!(matches!(BucketKey::new("rl", "api", ""), Err(RateLimitError::InvalidKey { .. })));
    }

    #[test]
    fn braces_in_scope_are_rejected() {
        assert!(BucketKey::new("rl", "a}b", "user:1").is_err());
        assert!(BucketKey::new("rl", "chat send", "user:1").is_err());
    }

    #[test]
    fn overlong_identity_is_rejected() {
        let identity = "u".repeat(MAX_IDENTITY_LENGTH + 1);
        assert!(BucketKey::new("rl", "api", &identity).is_err());
    }

    #[test]
    fn distinct_pairs_never_collide() {
        let a = BucketKey::new("rl", "api", "user:1").unwrap();
        let b = BucketKey::new("rl", "chat-send", "user:1").unwrap();
        let c = BucketKey::new("rl", "api", "user:2").unwrap();
        assert_ne!(a, b);
        assert_ne!(a, c);
    }
}
