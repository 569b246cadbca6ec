//! Resource queries
//!
//! The engine only needs `find(expression, scope) -> resources`; the
//! [`QueryEngine`] trait is the seam for plugging in another language.
//! [`AttributeQuery`] is the built-in one:
//!
//! ```text
//! type=core.file and path="/etc/motd"
//! id=nginx
//! uid=web.nginx
//! childof
//! childof=web and state!=absent
//! ```
//!
//! Terms are joined with `and`. `childof` alone selects the children of the
//! scope resource; `childof=<ref>` looks `<ref>` up relative to the scope
//! first and as an absolute uid second. Results come back in registration
//! order.

use crate::error::{Error, Result};
use crate::fqname::FQName;
use crate::resource::{Resource, ResourceHandle};
use std::collections::HashMap;
use std::sync::Arc;

/// Read-only view of the registered resources handed to query engines
#[derive(Clone, Copy)]
pub struct GraphView<'a> {
    resources: &'a [Arc<Resource>],
    uids: &'a HashMap<String, ResourceHandle>,
}

impl<'a> GraphView<'a> {
    pub(crate) fn new(
        resources: &'a [Arc<Resource>],
        uids: &'a HashMap<String, ResourceHandle>,
    ) -> Self {
        Self { resources, uids }
    }

    /// All resources in registration order
    pub fn resources(&self) -> &'a [Arc<Resource>] {
        self.resources
    }

    pub fn get(&self, handle: ResourceHandle) -> Option<&'a Arc<Resource>> {
        self.resources.get(handle.0)
    }

    pub fn by_uid(&self, uid: &str) -> Option<&'a Arc<Resource>> {
        self.uids.get(uid).and_then(|h| self.get(*h))
    }

    /// Direct children of `parent`
    pub fn children(&self, parent: ResourceHandle) -> impl Iterator<Item = &'a Arc<Resource>> {
        self.resources
            .iter()
            .filter(move |r| r.parent() == Some(parent))
    }
}

/// Evaluates query expressions against the resource graph
pub trait QueryEngine: Send + Sync {
    /// Resources matching `expression`, evaluated in `scope`
    fn find(
        &self,
        expression: &str,
        scope: Option<&Resource>,
        graph: &GraphView<'_>,
    ) -> Result<Vec<ResourceHandle>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Field {
    Type,
    Id,
    Uid,
    Attribute(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Term {
    Equals(Field, String),
    NotEquals(Field, String),
    ChildOf(Option<String>),
}

/// Built-in `key=value and ...` query language
#[derive(Debug, Default, Clone, Copy)]
pub struct AttributeQuery;

impl AttributeQuery {
    fn parse(expression: &str) -> Result<Vec<Term>> {
        let trimmed = expression.trim();
        if trimmed.is_empty() {
            return Err(Error::query(expression, "empty expression"));
        }

        trimmed
            .split(" and ")
            .map(|term| Self::parse_term(expression, term.trim()))
            .collect()
    }

    fn parse_term(expression: &str, term: &str) -> Result<Term> {
        if term == "childof" {
            return Ok(Term::ChildOf(None));
        }

        let (key, value, negated) = if let Some((k, v)) = term.split_once("!=") {
            (k, v, true)
        } else if let Some((k, v)) = term.split_once('=') {
            (k, v, false)
        } else {
            return Err(Error::query(
                expression,
                format!("expected key=value, found '{term}'"),
            ));
        };

        let key = key.trim();
        if key.is_empty()
            || !key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        {
            return Err(Error::query(expression, format!("invalid key '{key}'")));
        }
        let value = unquote(value.trim());

        if key == "childof" {
            if negated || value.is_empty() {
                return Err(Error::query(expression, "childof takes a resource reference"));
            }
            return Ok(Term::ChildOf(Some(value)));
        }

        let field = match key {
            "type" => Field::Type,
            "id" => Field::Id,
            "uid" => Field::Uid,
            other => Field::Attribute(other.to_string()),
        };
        Ok(if negated {
            Term::NotEquals(field, value)
        } else {
            Term::Equals(field, value)
        })
    }

    fn field_matches(resource: &Resource, field: &Field, value: &str) -> bool {
        match field {
            Field::Type => {
                let wanted = FQName::parse(value);
                let actual = resource.fqname();
                if wanted.is_qualified() {
                    actual == wanted
                } else {
                    actual.name() == wanted.name()
                }
            }
            Field::Id => resource.id() == value,
            Field::Uid => resource.uid() == value,
            Field::Attribute(name) => resource.get(name).as_deref() == Some(value),
        }
    }
}

fn unquote(value: &str) -> String {
    let bytes = value.as_bytes();
    if bytes.len() >= 2
        && (bytes[0] == b'"' || bytes[0] == b'\'')
        && bytes[bytes.len() - 1] == bytes[0]
    {
        value[1..value.len() - 1].to_string()
    } else {
        value.to_string()
    }
}

impl QueryEngine for AttributeQuery {
    fn find(
        &self,
        expression: &str,
        scope: Option<&Resource>,
        graph: &GraphView<'_>,
    ) -> Result<Vec<ResourceHandle>> {
        let terms = Self::parse(expression)?;

        // resolve childof references once, before scanning
        let mut parents = Vec::new();
        for term in &terms {
            if let Term::ChildOf(reference) = term {
                let parent = match (reference, scope) {
                    (None, Some(scope)) => Some(scope.handle()),
                    (None, None) => {
                        return Err(Error::query(expression, "childof needs a scope resource"));
                    }
                    (Some(reference), scope) => scope
                        .and_then(|s| graph.by_uid(&format!("{}.{}", s.uid(), reference)))
                        .or_else(|| graph.by_uid(reference))
                        .map(|r| r.handle()),
                };
                parents.push(parent);
            }
        }
        // an unknown childof reference matches nothing
        if parents.iter().any(Option::is_none) {
            return Ok(Vec::new());
        }

        let matches = graph
            .resources()
            .iter()
            .filter(|resource| {
                let mut parents = parents.iter().flatten();
                terms.iter().all(|term| match term {
                    Term::Equals(field, value) => Self::field_matches(resource, field, value),
                    Term::NotEquals(field, value) => !Self::field_matches(resource, field, value),
                    Term::ChildOf(_) => {
                        parents.next().is_some_and(|p| resource.parent() == Some(*p))
                    }
                })
            })
            .map(|resource| resource.handle())
            .collect();
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::ResourceDefinition;

    struct Fixture {
        resources: Vec<Arc<Resource>>,
        uids: HashMap<String, ResourceHandle>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                resources: Vec::new(),
                uids: HashMap::new(),
            }
        }

        fn add(&mut self, fqname: &str, id: &str, parent: Option<usize>) -> usize {
            let def = Arc::new(ResourceDefinition::builder(fqname).build().unwrap());
            let index = self.resources.len();
            let parent = parent.map(ResourceHandle);
            let uid = match parent {
                Some(p) => format!("{}.{}", self.resources[p.0].uid(), id),
                None => id.to_string(),
            };
            let resource = def.create(
                ResourceHandle(index),
                id.into(),
                uid.clone(),
                parent,
                "localhost".into(),
            );
            self.uids.insert(uid, ResourceHandle(index));
            self.resources.push(Arc::new(resource));
            index
        }

        fn find(&self, expression: &str, scope: Option<usize>) -> Result<Vec<usize>> {
            let graph = GraphView::new(&self.resources, &self.uids);
            let scope = scope.map(|s| self.resources[s].as_ref());
            Ok(AttributeQuery
                .find(expression, scope, &graph)?
                .into_iter()
                .map(ResourceHandle::index)
                .collect())
        }
    }

    fn fixture() -> Fixture {
        let mut f = Fixture::new();
        let web = f.add("core.group", "web", None);
        let nginx = f.add("core.package", "nginx", Some(web));
        f.add("core.file", "conf", Some(web));
        f.add("core.package", "curl", None);
        f.resources[nginx].set("state", "installed");
        f
    }

    #[test]
    fn test_equality_terms() {
        let f = fixture();
        assert_eq!(f.find("id=nginx", None).unwrap(), vec![1]);
        assert_eq!(f.find("uid=web.conf", None).unwrap(), vec![2]);
        assert_eq!(f.find("type=core.package", None).unwrap(), vec![1, 3]);
        assert_eq!(f.find("type=package", None).unwrap(), vec![1, 3]);
        assert_eq!(f.find("state=installed", None).unwrap(), vec![1]);
        assert_eq!(f.find("state=\"installed\"", None).unwrap(), vec![1]);
    }

    #[test]
    fn test_conjunction_and_negation() {
        let f = fixture();
        assert_eq!(
            f.find("type=core.package and state!=installed", None)
                .unwrap(),
            vec![3]
        );
        assert!(f.find("id=nginx and id=curl", None).unwrap().is_empty());
    }

    #[test]
    fn test_childof_uses_scope() {
        let f = fixture();
        assert_eq!(f.find("childof", Some(0)).unwrap(), vec![1, 2]);
        assert_eq!(f.find("childof=web", None).unwrap(), vec![1, 2]);
        assert_eq!(
            f.find("childof=web and type=core.file", Some(3)).unwrap(),
            vec![2]
        );
        assert!(f.find("childof=missing", None).unwrap().is_empty());
        assert!(f.find("childof", None).is_err());
    }

    #[test]
    fn test_childof_prefers_scope_relative_uid() {
        let mut f = fixture();
        let inner = f.add("core.group", "web", Some(3));
        f.add("core.file", "inner", Some(inner));
        assert_eq!(f.find("childof=web", Some(3)).unwrap(), vec![5]);
        assert_eq!(f.find("childof=web", Some(1)).unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_malformed_queries() {
        let f = fixture();
        for bad in ["", "   ", "nginx", "=x", "a b=c", "childof!=web"] {
            let err = f.find(bad, None).unwrap_err();
            assert!(matches!(err, Error::InvalidQuery { .. }), "{bad}: {err}");
        }
    }
}
