//! Expression resolvers.
//!
//! A resolver maps one expression string plus one object tree to a set of
//! `(sub-key, string)` bindings. Scalar results bind the expression itself;
//! composite results fan out into multiple bindings, with the `name#index`
//! suffix convention marking list elements for downstream expansion. A
//! resolver that cannot make sense of an expression returns the sentinel
//! `{expression -> expression}`, which the renderer treats as a literal.

mod cel;
mod unstructured;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

pub use cel::CelResolver;
pub use unstructured::UnstructuredResolver;

use crate::config::ResolverKind;
use crate::telemetry::Telemetry;

/// Bindings produced by a resolution. Ordered so downstream label emission
/// is deterministic.
pub type Bindings = BTreeMap<String, String>;

/// Capability interface implemented by every resolver variant. New resolvers
/// plug in here without touching renderer logic.
#[async_trait]
pub trait Resolve: Send + Sync {
    async fn resolve(&self, expression: &str, object: &serde_json::Value) -> Bindings;
}

/// The sentinel meaning "could not resolve; treat as a literal".
pub(crate) fn sentinel(expression: &str) -> Bindings {
    BTreeMap::from([(expression.to_owned(), expression.to_owned())])
}

/// Caller-scoped context for resolver construction: CEL bounds plus the
/// telemetry coordinates of the family being rendered.
#[derive(Clone)]
pub struct ResolverScope {
    pub cel_cost_limit: u64,
    pub cel_timeout: Duration,
    pub telemetry: Option<Arc<Telemetry>>,
    pub rmm_namespace: String,
    pub rmm_name: String,
    pub family: String,
}

impl ResolverScope {
    /// Constructs the resolver for the given kind, defaulting to
    /// unstructured when the inheritance chain never named one.
    pub fn resolver(&self, kind: Option<ResolverKind>) -> Box<dyn Resolve> {
        match kind.unwrap_or(ResolverKind::Unstructured) {
            ResolverKind::Unstructured => Box::new(UnstructuredResolver),
            ResolverKind::Cel => Box::new(CelResolver::new(self.clone())),
        }
    }
}

#[cfg(test)]
pub(crate) fn test_scope() -> ResolverScope {
    ResolverScope {
        cel_cost_limit: 1_000_000,
        cel_timeout: Duration::from_secs(5),
        telemetry: None,
        rmm_namespace: "test-namespace".into(),
        rmm_name: "test-rmm".into(),
        family: "test_family".into(),
    }
}
