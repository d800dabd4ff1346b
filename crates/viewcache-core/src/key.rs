use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CacheError;

/// Separator between resource name and scope in a rendered key.
const SCOPE_SEPARATOR: char = '@';

/// Identifies one logical resource instance: a resource name scoped to a
/// session or tenant, so two sessions never share an entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    pub resource: String,
    pub scope: String,
}

impl CacheKey {
    pub fn new(resource: impl Into<String>, scope: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            scope: scope.into(),
        }
    }

    /// Key under which the serialized entry is kept in persistent storage.
    pub fn storage_key(&self) -> String {
        format!("entry:{}", self)
    }

    pub fn in_scope(&self, scope: &str) -> bool {
        self.scope == scope
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.resource, SCOPE_SEPARATOR, self.scope)
    }
}

impl FromStr for CacheKey {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(SCOPE_SEPARATOR) {
            Some((resource, scope)) if !resource.is_empty() => Ok(Self::new(resource, scope)),
            _ => Err(CacheError::InvalidConfig(format!("malformed cache key: {}", s))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_parse() {
        let key = CacheKey::new("roster", "org-42");
        assert_eq!(key.to_string(), "roster@org-42");
        assert_eq!("roster@org-42".parse::<CacheKey>().unwrap(), key);
        assert_eq!(key.storage_key(), "entry:roster@org-42");
    }

    #[test]
    fn test_scope_may_contain_separator() {
        let key: CacheKey = "plan@user@example.com".parse().unwrap();
        assert_eq!(key.resource, "plan");
        assert_eq!(key.scope, "user@example.com");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!("roster".parse::<CacheKey>().is_err());
        assert!("@org-42".parse::<CacheKey>().is_err());
    }

    #[test]
    fn test_sessions_do_not_share_keys() {
        let a = CacheKey::new("roster", "session-a");
        let b = CacheKey::new("roster", "session-b");
        assert_ne!(a, b);
        assert!(a.in_scope("session-a"));
        assert!(!a.in_scope("session-b"));
    }
}
