//! Configuration document model and parser.
//!
//! The RMM spec carries a YAML payload whose top level is `stores: [...]`.
//! Each store targets one GVK(+plural resource) and declares the gauge
//! families to derive from every observed object of that kind.

use serde::Deserialize;

/// Resolver variants for label/value expressions. Absence means "inherit
/// from the enclosing scope", bottoming out at [`ResolverKind::Unstructured`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolverKind {
    /// Dot-path traversal of the object tree.
    Unstructured,
    /// Common Expression Language, with the object bound to `o`.
    Cel,
}

/// Top-level configuration document.
#[derive(Debug, Clone, Deserialize)]
pub struct Configuration {
    #[serde(default)]
    pub stores: Vec<StoreSpec>,
}

/// Selectors applied to the target resource's list/watch.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Selectors {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub field: Option<String>,
}

/// One store per target GVK.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSpec {
    pub group: String,
    pub version: String,
    pub kind: String,
    /// Plural name used by the dynamic client.
    pub resource: String,
    #[serde(default)]
    pub selectors: Selectors,
    #[serde(default)]
    pub families: Vec<FamilySpec>,
    /// Store-wide resolver default, inherited by every family.
    #[serde(default)]
    pub resolver: Option<ResolverKind>,
    /// Store-wide labels, appended to every family's.
    #[serde(default)]
    pub label_keys: Vec<String>,
    #[serde(default)]
    pub label_values: Vec<String>,
}

/// A Prometheus metric family. All metrics are gauges.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FamilySpec {
    pub name: String,
    #[serde(default)]
    pub help: String,
    #[serde(default)]
    pub metrics: Vec<MetricSpec>,
    #[serde(default)]
    pub resolver: Option<ResolverKind>,
    #[serde(default)]
    pub label_keys: Vec<String>,
    #[serde(default)]
    pub label_values: Vec<String>,
}

/// A single time-series template.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSpec {
    #[serde(default)]
    pub label_keys: Vec<String>,
    #[serde(default)]
    pub label_values: Vec<String>,
    /// Expression producing a numeric string.
    pub value: String,
    #[serde(default)]
    pub resolver: Option<ResolverKind>,
}

/// Parses the raw YAML configuration carried by an RMM spec.
pub fn parse(raw: &str) -> anyhow::Result<Configuration> {
    let configuration: Configuration = serde_yaml::from_str(raw)
        .map_err(|err| anyhow::anyhow!("error unmarshalling configuration: {err}"))?;

    Ok(configuration)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIGURATION: &str = r#"
stores:
  - group: contoso.com
    version: v1alpha1
    kind: MyPlatform
    resource: myplatforms
    selectors:
      label: app=backend
    resolver: cel
    labelKeys: [owner]
    labelValues: ["o.metadata.labels.owner"]
    families:
      - name: platform_replicas
        help: Number of replicas requested by the platform.
        metrics:
          - labelKeys: [name]
            labelValues: [metadata.name]
            value: spec.replicas
            resolver: unstructured
"#;

    #[test]
    fn parses_a_full_store_spec() {
        let configuration = parse(CONFIGURATION).unwrap();
        assert_eq!(configuration.stores.len(), 1);

        let store = &configuration.stores[0];
        assert_eq!(store.group, "contoso.com");
        assert_eq!(store.resource, "myplatforms");
        assert_eq!(store.selectors.label.as_deref(), Some("app=backend"));
        assert_eq!(store.resolver, Some(ResolverKind::Cel));
        assert_eq!(store.label_keys, vec!["owner"]);

        let family = &store.families[0];
        assert_eq!(family.name, "platform_replicas");
        assert_eq!(family.metrics[0].value, "spec.replicas");
        assert_eq!(family.metrics[0].resolver, Some(ResolverKind::Unstructured));
    }

    #[test]
    fn rejects_malformed_yaml() {
        let err = parse("stores: [ {group: ").unwrap_err();
        assert!(err.to_string().contains("error unmarshalling configuration"));
    }

    #[test]
    fn empty_document_has_no_stores() {
        let configuration = parse("stores: []").unwrap();
        assert!(configuration.stores.is_empty());
    }

    #[test]
    fn unknown_resolver_is_an_error() {
        let err = parse(
            "stores:\n  - group: g\n    version: v1\n    kind: K\n    resource: ks\n    resolver: jq\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("error unmarshalling configuration"));
    }
}
