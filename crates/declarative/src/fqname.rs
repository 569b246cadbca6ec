//! Fully qualified resource type names

use serde::{Deserialize, Serialize};
use std::fmt;

/// A `(package, name)` pair identifying a resource type.
///
/// Parsed from `"pkg.name"`; the last `.` separates package from name so
/// packages may themselves be dotted (`"acme.web.vhost"`). A name without a
/// package is unqualified and is resolved against an import scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FQName {
    package: Option<String>,
    name: String,
}

impl FQName {
    /// Create a qualified name
    pub fn new(package: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            package: Some(package.into()),
            name: name.into(),
        }
    }

    /// Create a name without package
    pub fn unqualified(name: impl Into<String>) -> Self {
        Self {
            package: None,
            name: name.into(),
        }
    }

    /// Parse `"pkg.name"` or `"name"`
    pub fn parse(value: &str) -> Self {
        match value.rsplit_once('.') {
            Some((pkg, name)) if !pkg.is_empty() => Self::new(pkg, name),
            Some((_, name)) => Self::unqualified(name),
            None => Self::unqualified(value),
        }
    }

    pub fn package(&self) -> Option<&str> {
        self.package.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_qualified(&self) -> bool {
        self.package.is_some()
    }

    /// Whether this name is visible from an import scope (list of packages).
    ///
    /// An empty scope sees every package.
    pub fn in_scope(&self, import_scope: &[String]) -> bool {
        if import_scope.is_empty() {
            return true;
        }
        match &self.package {
            Some(pkg) => import_scope.iter().any(|p| p == pkg),
            None => false,
        }
    }
}

impl fmt::Display for FQName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.package {
            Some(pkg) => write!(f, "{}.{}", pkg, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

impl From<&str> for FQName {
    fn from(value: &str) -> Self {
        Self::parse(value)
    }
}

impl From<String> for FQName {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        assert_eq!(FQName::parse("core.file"), FQName::new("core", "file"));
        assert_eq!(FQName::parse("file"), FQName::unqualified("file"));
        assert_eq!(
            FQName::parse("acme.web.vhost"),
            FQName::new("acme.web", "vhost")
        );
        assert_eq!(FQName::parse(".file"), FQName::unqualified("file"));
    }

    #[test]
    fn test_display_round_trips_through_parse() {
        let name = FQName::new("acme.web", "vhost");
        assert_eq!(name.to_string(), "acme.web.vhost");
        assert_eq!(FQName::parse(&name.to_string()), name);
    }

    #[test]
    fn test_in_scope() {
        let name = FQName::new("core", "file");
        assert!(name.in_scope(&[]));
        assert!(name.in_scope(&["core".to_string()]));
        assert!(!name.in_scope(&["web".to_string()]));
    }
}
