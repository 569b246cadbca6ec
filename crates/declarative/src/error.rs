//! Structural errors for graph construction and preparation.
//!
//! These errors abort `prepare_for_execution` as a whole: no partial graph is
//! ever executed. Failures of individual actions never show up here, they are
//! recorded on the resource as [`State::Failed`](crate::types::State::Failed).

use thiserror::Error;

/// Categories of structural errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Resource could not be created
    Creation,
    /// Graph edges are unresolvable or cyclic
    Dependency,
    /// A definition is malformed or ambiguous
    Definition,
    /// A query expression is malformed
    Query,
    /// The manager was used outside of its lifecycle contract
    Contract,
    /// Other/unknown errors
    Other,
}

impl ErrorCategory {
    /// Get a user-friendly description of this error category.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Creation => "Resource creation failed",
            Self::Dependency => "Invalid dependency graph",
            Self::Definition => "Invalid resource definition",
            Self::Query => "Invalid query",
            Self::Contract => "Engine used out of order",
            Self::Other => "Unexpected error",
        }
    }

    /// Get actionable advice for resolving this error category.
    pub fn advice(&self) -> &'static str {
        match self {
            Self::Creation => "Check resource ids, types and uniqueness constraints",
            Self::Dependency => "Check before/after expressions for typos and cycles",
            Self::Definition => "Check that every verify has a matching sync and action names are unique",
            Self::Query => "Queries look like `key=value and type=pkg.name`",
            Self::Contract => "This is a bug in the calling code",
            Self::Other => "Check the error details for more information",
        }
    }
}

/// Errors raised while building, resolving or sorting the resource graph.
#[derive(Debug, Error)]
pub enum Error {
    /// Resource creation contract violated (duplicate uid, uniqueness
    /// conflict, unknown type, creation disabled)
    #[error("cannot create resource: {message}")]
    ResourceCreation {
        /// What went wrong
        message: String,
    },

    /// Dependency could not be resolved or forms a cycle
    #[error("invalid dependency for {resource}: {message}")]
    InvalidDependency {
        /// Uid of the offending resource (a node on the cycle for cycles)
        resource: String,
        /// What went wrong
        message: String,
    },

    /// More than one live instance of a unique resource type in one scope
    #[error("more than one instance of unique resource {fqname} in {scope}: {}", uids.join(", "))]
    MultipleUniqueResourcesFound {
        /// Type of the unique resource
        fqname: String,
        /// Scope in which uniqueness was violated (`global` or a host name)
        scope: String,
        /// Uids of the conflicting resources
        uids: Vec<String>,
    },

    /// Unqualified type name matched more than one definition
    #[error("found more than one match for {name}: {first} and {second}")]
    MultipleResourceMatch {
        /// Name that was looked up
        name: String,
        /// First matching definition
        first: String,
        /// Second matching definition
        second: String,
    },

    /// Malformed definition
    #[error("invalid resource definition {fqname}: {message}")]
    InvalidResourceDefinition {
        /// Definition type name
        fqname: String,
        /// What is wrong with it
        message: String,
    },

    /// Query expression could not be parsed or evaluated
    #[error("invalid query '{query}': {message}")]
    InvalidQuery {
        /// The query text
        query: String,
        /// What is wrong with it
        message: String,
    },

    /// Operation not allowed at this point of the manager lifecycle
    #[error("{0}")]
    Lifecycle(String),

    /// The manager has been closed
    #[error("attempted to access resource manager that has already been closed")]
    Closed,

    /// Worker pool for parallel phases could not be created
    #[error("failed to create worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl Error {
    /// Get the error category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::ResourceCreation { .. } => ErrorCategory::Creation,
            Error::InvalidDependency { .. } | Error::MultipleUniqueResourcesFound { .. } => {
                ErrorCategory::Dependency
            }
            Error::MultipleResourceMatch { .. } | Error::InvalidResourceDefinition { .. } => {
                ErrorCategory::Definition
            }
            Error::InvalidQuery { .. } => ErrorCategory::Query,
            Error::Lifecycle(_) | Error::Closed => ErrorCategory::Contract,
            Error::ThreadPool(_) => ErrorCategory::Other,
        }
    }

    pub(crate) fn creation(message: impl Into<String>) -> Self {
        Error::ResourceCreation {
            message: message.into(),
        }
    }

    pub(crate) fn dependency(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Error::InvalidDependency {
            resource: resource.into(),
            message: message.into(),
        }
    }

    pub(crate) fn definition(fqname: impl ToString, message: impl Into<String>) -> Self {
        Error::InvalidResourceDefinition {
            fqname: fqname.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn query(query: impl Into<String>, message: impl Into<String>) -> Self {
        Error::InvalidQuery {
            query: query.into(),
            message: message.into(),
        }
    }
}

/// Result type for structural engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert_eq!(Error::creation("x").category(), ErrorCategory::Creation);
        assert_eq!(
            Error::dependency("a", "cycle").category(),
            ErrorCategory::Dependency
        );
        assert_eq!(Error::Closed.category(), ErrorCategory::Contract);
        assert_eq!(
            Error::definition("pkg.a", "bad").category(),
            ErrorCategory::Definition
        );
    }

    #[test]
    fn test_unique_message_lists_uids() {
        let err = Error::MultipleUniqueResourcesFound {
            fqname: "core.host".into(),
            scope: "global".into(),
            uids: vec!["a".into(), "b".into()],
        };
        assert_eq!(
            err.to_string(),
            "more than one instance of unique resource core.host in global: a, b"
        );
    }
}
