//! Converge core types: what to poll, how a fetch can fail, and how a
//! fetched snapshot is judged.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod predicates;

/// Identifies a remote object to poll. Cluster-scoped objects have no namespace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ResourceRef {
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceRef {
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: Some(namespace.into()), name: name.into() }
    }

    pub fn cluster(name: impl Into<String>) -> Self {
        Self { namespace: None, name: name.into() }
    }

    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self { namespace: namespace.map(|s| s.to_string()), name: name.to_string() }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.namespace.as_deref() {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Classified failure of a single read against the remote store.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchError {
    /// The object does not exist (yet) on the read path.
    #[error("not found: {0}")]
    NotFound(String),
    /// Network or API hiccup; may succeed on a later attempt.
    #[error("transient: {0}")]
    Transient(String),
}

impl FetchError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, FetchError::NotFound(_))
    }
}

/// Raised by a predicate when a snapshot can never converge to the awaited state.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("{0}")]
pub struct PredicateError(pub String);

impl PredicateError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Decides whether a fetched snapshot satisfies the awaited state.
///
/// `Ok(false)` means "not yet", `Err(_)` is terminal and stops polling.
pub trait Predicate<O: ?Sized>: Send + Sync {
    fn evaluate(&self, obj: &O) -> Result<bool, PredicateError>;

    /// Human description of the awaited condition, e.g. `Ready=True`.
    fn describe(&self) -> String;

    /// Render the field(s) of `obj` this predicate looks at, for diagnostics.
    fn observe(&self, _obj: &O) -> Option<String> {
        None
    }
}

impl<O: ?Sized, P: Predicate<O> + ?Sized> Predicate<O> for &P {
    fn evaluate(&self, obj: &O) -> Result<bool, PredicateError> {
        (**self).evaluate(obj)
    }
    fn describe(&self) -> String {
        (**self).describe()
    }
    fn observe(&self, obj: &O) -> Option<String> {
        (**self).observe(obj)
    }
}

impl<O: ?Sized, P: Predicate<O> + ?Sized> Predicate<O> for Box<P> {
    fn evaluate(&self, obj: &O) -> Result<bool, PredicateError> {
        (**self).evaluate(obj)
    }
    fn describe(&self) -> String {
        (**self).describe()
    }
    fn observe(&self, obj: &O) -> Option<String> {
        (**self).observe(obj)
    }
}

pub mod prelude {
    pub use super::predicates::{all_of, condition, data_entries_exactly, field_non_empty, FnPredicate};
    pub use super::{FetchError, Predicate, PredicateError, ResourceRef};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_ref_display() {
        assert_eq!(ResourceRef::namespaced("ns", "issuer").to_string(), "ns/issuer");
        assert_eq!(ResourceRef::cluster("cluster-issuer").to_string(), "cluster-issuer");
        assert_eq!(ResourceRef::new(None, "x"), ResourceRef::cluster("x"));
    }

    #[test]
    fn fetch_error_classification() {
        assert!(FetchError::NotFound("secrets \"a\" not found".into()).is_not_found());
        assert!(!FetchError::Transient("connection reset".into()).is_not_found());
    }
}
