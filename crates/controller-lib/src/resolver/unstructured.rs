//! Dot-path resolver over the raw object tree.

use async_trait::async_trait;
use serde_json::Value;

use super::{sentinel, Bindings, Resolve};

/// Resolves dot-separated paths (`metadata.name`, `spec.replicas`) by
/// walking nested maps. Only scalar terminals resolve; bracket syntax,
/// missing segments, and composite terminals all yield the sentinel.
pub struct UnstructuredResolver;

#[async_trait]
impl Resolve for UnstructuredResolver {
    async fn resolve(&self, expression: &str, object: &Value) -> Bindings {
        let mut current = object;
        for segment in expression.split('.') {
            match current {
                Value::Object(map) => match map.get(segment) {
                    Some(next) => current = next,
                    None => return sentinel(expression),
                },
                _ => return sentinel(expression),
            }
        }

        let resolved = match current {
            Value::Null => "<nil>".to_owned(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            Value::String(s) => s.clone(),
            // Composite terminals cannot be stringified into a single label.
            Value::Array(_) | Value::Object(_) => return sentinel(expression),
        };

        Bindings::from([(expression.to_owned(), resolved)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object() -> Value {
        json!({
            "metadata": {
                "name": "test-deployment",
                "namespace": "test-namespace",
            },
            "fields": {
                "nil": null,
                "integer": 1,
                "string": "bar",
                "slice": ["a", "b", "c"],
                "map": {"foo": {"bar": "baz"}},
                "float": 1.1,
                "boolean": true,
            },
        })
    }

    async fn resolve(query: &str) -> Bindings {
        UnstructuredResolver.resolve(query, &object()).await
    }

    #[tokio::test]
    async fn scalars_resolve_to_their_string_form() {
        let cases = [
            ("fields.integer", "1"),
            ("fields.string", "bar"),
            ("fields.float", "1.1"),
            ("fields.boolean", "true"),
            ("fields.map.foo.bar", "baz"),
            ("fields.nil", "<nil>"),
        ];
        for (query, want) in cases {
            let got = resolve(query).await;
            assert_eq!(got, Bindings::from([(query.to_owned(), want.to_owned())]));
        }
    }

    #[tokio::test]
    async fn traversal_failures_yield_the_sentinel() {
        let queries = [
            // Scalar intermediate.
            "fields.string.bar",
            // Missing field.
            "fields.bar",
            // Missing intermediate.
            "fields.fake.string",
            // Null intermediate, common in YAML-sourced objects.
            "fields.nil.foo",
            // Bracket syntax is not supported.
            "fields.slice[1]",
        ];
        for query in queries {
            let got = resolve(query).await;
            assert_eq!(
                got,
                Bindings::from([(query.to_owned(), query.to_owned())]),
                "query {query:?} should have been left unresolved",
            );
        }
    }

    #[tokio::test]
    async fn composite_terminals_yield_the_sentinel() {
        for query in ["fields.slice", "fields.map"] {
            let got = resolve(query).await;
            assert_eq!(got, Bindings::from([(query.to_owned(), query.to_owned())]));
        }
    }
}
