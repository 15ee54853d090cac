//! Family renderer: turns one metric-family spec plus one observed object
//! into a Prometheus text fragment.
//!
//! Label and value expressions run through the family's resolver chain
//! (metric -> family -> store -> unstructured). Composite resolutions expand:
//! a map fans out into multiple labels prefixed by the user's label key, a
//! list fans out into one sample per element.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use kube::core::GroupVersionKind;
use serde_json::Value;
use tracing::{debug, error};

use crate::config::FamilySpec;
use crate::resolver::{Resolve, ResolverScope};
use crate::telemetry::Telemetry;

/// All user metrics carry this prefix, in convention with kube-state-metrics,
/// to denote user-generated custom-resource metrics with no stability
/// guarantees.
pub const KUBE_CUSTOM_RESOURCE_PREFIX: &str = "kube_customresource_";

const METRIC_TYPE_GAUGE: &str = "gauge";

/// Everything a render needs beyond the family spec itself: CEL bounds and
/// the telemetry coordinates of the owning RMM.
#[derive(Clone)]
pub struct RenderContext {
    pub cel_cost_limit: u64,
    pub cel_timeout: Duration,
    pub telemetry: Option<Arc<Telemetry>>,
    pub rmm_namespace: String,
    pub rmm_name: String,
}

impl RenderContext {
    fn scope_for(&self, family: &str) -> ResolverScope {
        ResolverScope {
            cel_cost_limit: self.cel_cost_limit,
            cel_timeout: self.cel_timeout,
            telemetry: self.telemetry.clone(),
            rmm_namespace: self.rmm_namespace.clone(),
            rmm_name: self.rmm_name.clone(),
            family: family.to_owned(),
        }
    }
}

/// Builds the `# HELP`/`# TYPE` block for a family. The trailing newline is
/// supplied by the exposition writer.
pub fn build_header(family: &FamilySpec) -> String {
    format!(
        "# HELP {prefix}{name} {help}\n# TYPE {prefix}{name} {METRIC_TYPE_GAUGE}",
        prefix = KUBE_CUSTOM_RESOURCE_PREFIX,
        name = family.name,
        help = family.help,
    )
}

/// Renders every metric of the family against the object, returning the
/// concatenated samples. Individual metric failures are contained: a bad
/// metric is dropped with a diagnostic and never poisons its family.
pub async fn render(
    family: &FamilySpec,
    object: &Value,
    gvk: &GroupVersionKind,
    context: &RenderContext,
) -> String {
    let scope = context.scope_for(&family.name);
    let mut out = String::new();

    for metric in &family.metrics {
        // Family-level labels append to the metric's; the configuration
        // structs stay untouched so repeated renders never accumulate.
        let label_keys: Vec<&str> = metric
            .label_keys
            .iter()
            .chain(family.label_keys.iter())
            .map(String::as_str)
            .collect();
        let label_exprs: Vec<&str> = metric
            .label_values
            .iter()
            .chain(family.label_values.iter())
            .map(String::as_str)
            .collect();

        if label_keys.len() != label_exprs.len() {
            error!(
                family = %family.name,
                keys = ?label_keys,
                values = ?label_exprs,
                "expected label keys and values to be of the same length, skipping metric"
            );
            continue;
        }

        let resolver = scope.resolver(metric.resolver.or(family.resolver));
        let labels = resolve_labels(&*resolver, &label_keys, &label_exprs, object).await;

        let resolved_value = match resolver.resolve(&metric.value, object).await.remove(&metric.value) {
            Some(value) => value,
            None => {
                debug!(family = %family.name, value = %metric.value, "error resolving metric value, skipping");
                continue;
            }
        };
        let value: f64 = match resolved_value.parse() {
            Ok(value) => value,
            Err(_) => {
                debug!(
                    family = %family.name,
                    value = %metric.value,
                    resolved = %resolved_value,
                    "resolved metric value is not numeric, skipping"
                );
                continue;
            }
        };

        if let Err(err) = write_samples(&mut out, &family.name, gvk, labels, value) {
            debug!(family = %family.name, error = %err, "error writing metric, skipping");
        }
    }

    out
}

/// Resolved label state for one metric: the flat key/value pairs plus the
/// expansion buckets produced by list-valued expressions, keyed by the
/// user's sanitised label key.
struct ResolvedLabels {
    keys: Vec<String>,
    values: Vec<String>,
    expanded: BTreeMap<String, Vec<String>>,
}

async fn resolve_labels(
    resolver: &dyn Resolve,
    label_keys: &[&str],
    label_exprs: &[&str],
    object: &Value,
) -> ResolvedLabels {
    let mut labels = ResolvedLabels {
        keys: Vec::with_capacity(label_keys.len()),
        values: Vec::with_capacity(label_keys.len()),
        expanded: BTreeMap::new(),
    };

    for (key, expr) in label_keys.iter().zip(label_exprs.iter()) {
        let mut bindings = resolver.resolve(expr, object).await;
        // A binding under the expression itself means a non-composite result
        // (including the unresolved-sentinel case, which lets users write
        // constant label values directly).
        if let Some(value) = bindings.remove(*expr) {
            labels.keys.push(sanitize_key(key));
            labels.values.push(value);
            continue;
        }
        for (sub_key, value) in bindings {
            if is_indexed(&sub_key) {
                labels
                    .expanded
                    .entry(sanitize_key(key))
                    .or_default()
                    .push(value);
                continue;
            }
            // Map resolutions flatten: each entry becomes a label prefixed
            // by the user's key.
            labels.keys.push(sanitize_key(&format!("{key}{sub_key}")));
            labels.values.push(value);
        }
    }

    labels
}

/// Whether a resolver sub-key carries the `name#index` list marker.
fn is_indexed(key: &str) -> bool {
    match key.rsplit_once('#') {
        Some((parent, index)) => {
            !parent.is_empty() && !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit())
        }
        None => false,
    }
}

fn write_samples(
    out: &mut String,
    family_name: &str,
    gvk: &GroupVersionKind,
    mut labels: ResolvedLabels,
    value: f64,
) -> anyhow::Result<()> {
    if labels.expanded.is_empty() {
        return write_sample(out, family_name, gvk, &labels.keys, &labels.values, value);
    }

    // One sample per element of the longest bucket; buckets are sorted for
    // determinism and shorter buckets pad with the empty string.
    let series = labels.expanded.values().map(Vec::len).max().unwrap_or(0);
    for bucket in labels.expanded.values_mut() {
        bucket.sort();
    }

    for index in 0..series {
        let mut sample_keys = labels.keys.clone();
        let mut sample_values = labels.values.clone();
        for (key, bucket) in &labels.expanded {
            sample_keys.push(key.clone());
            sample_values.push(bucket.get(index).cloned().unwrap_or_default());
        }
        write_sample(out, family_name, gvk, &sample_keys, &sample_values, value)?;
    }

    Ok(())
}

fn write_sample(
    out: &mut String,
    family_name: &str,
    gvk: &GroupVersionKind,
    keys: &[String],
    values: &[String],
    value: f64,
) -> anyhow::Result<()> {
    if keys.len() != values.len() {
        anyhow::bail!(
            "expected label keys {keys:?} to be of same length ({}) as the resolved label values {values:?} ({})",
            keys.len(),
            values.len(),
        );
    }

    out.push_str(KUBE_CUSTOM_RESOURCE_PREFIX);
    out.push_str(family_name);

    let mut separator = '{';
    let gvk_labels = [
        ("group", gvk.group.as_str()),
        ("version", gvk.version.as_str()),
        ("kind", gvk.kind.as_str()),
    ];
    for (key, value) in keys
        .iter()
        .map(String::as_str)
        .zip(values.iter().map(String::as_str))
        .chain(gvk_labels)
    {
        out.push(separator);
        out.push_str(key);
        out.push_str("=\"");
        out.push_str(&escape_label_value(value));
        out.push('"');
        separator = ',';
    }
    out.push('}');

    let _ = write!(out, " {value:.6}");
    out.push('\n');

    Ok(())
}

fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('\n', "\\n")
        .replace('"', "\\\"")
}

/// Converts a label key to snake_case, replacing non-word characters.
fn sanitize_key(key: &str) -> String {
    let cleaned: String = key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();

    to_snake_case(&cleaned)
}

fn to_snake_case(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len() + 4);
    for (i, &c) in chars.iter().enumerate() {
        if !c.is_ascii_uppercase() {
            out.push(c);
            continue;
        }
        let boundary = match i.checked_sub(1).map(|j| chars[j]) {
            Some(prev) if prev.is_ascii_lowercase() || prev.is_ascii_digit() => true,
            Some(prev) if prev.is_ascii_uppercase() => chars
                .get(i + 1)
                .map(|next| next.is_ascii_lowercase())
                .unwrap_or(false),
            _ => false,
        };
        if boundary {
            out.push('_');
        }
        out.push(c.to_ascii_lowercase());
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MetricSpec, ResolverKind};
    use serde_json::json;

    fn gvk() -> GroupVersionKind {
        GroupVersionKind::gvk("contoso.com", "v1alpha1", "MyPlatform")
    }

    fn context() -> RenderContext {
        RenderContext {
            cel_cost_limit: 1_000_000,
            cel_timeout: Duration::from_secs(5),
            telemetry: None,
            rmm_namespace: "test-namespace".into(),
            rmm_name: "test-rmm".into(),
        }
    }

    fn platform_object() -> Value {
        json!({
            "apiVersion": "contoso.com/v1alpha1",
            "kind": "MyPlatform",
            "metadata": {
                "name": "test-sample",
                "labels": {"foo": "1", "bar": "2", "job": "resource-state-metrics"},
            },
            "spec": {
                "replicas": 3,
                "versions": ["v2", "v1"],
            },
        })
    }

    fn family(metric: MetricSpec) -> FamilySpec {
        FamilySpec {
            name: "platform_replicas".into(),
            help: "Replicas requested by the platform.".into(),
            metrics: vec![metric],
            ..Default::default()
        }
    }

    #[test]
    fn header_carries_help_and_gauge_type() {
        let header = build_header(&family(MetricSpec::default()));
        assert_eq!(
            header,
            "# HELP kube_customresource_platform_replicas Replicas requested by the platform.\n\
             # TYPE kube_customresource_platform_replicas gauge"
        );
    }

    #[tokio::test]
    async fn non_composite_unstructured_label() {
        let spec = family(MetricSpec {
            label_keys: vec!["name".into()],
            label_values: vec!["metadata.name".into()],
            value: "spec.replicas".into(),
            resolver: None,
        });
        let got = render(&spec, &platform_object(), &gvk(), &context()).await;
        assert_eq!(
            got,
            "kube_customresource_platform_replicas{name=\"test-sample\",group=\"contoso.com\",version=\"v1alpha1\",kind=\"MyPlatform\"} 3.000000\n"
        );
    }

    #[tokio::test]
    async fn cel_scalar_label_and_value() {
        let spec = family(MetricSpec {
            label_keys: vec!["name".into()],
            label_values: vec!["o.metadata.name".into()],
            value: "o.metadata.labels.bar".into(),
            resolver: Some(ResolverKind::Cel),
        });
        let got = render(&spec, &platform_object(), &gvk(), &context()).await;
        assert_eq!(
            got,
            "kube_customresource_platform_replicas{name=\"test-sample\",group=\"contoso.com\",version=\"v1alpha1\",kind=\"MyPlatform\"} 2.000000\n"
        );
    }

    #[tokio::test]
    async fn map_expansion_flattens_into_prefixed_labels() {
        let spec = family(MetricSpec {
            label_keys: vec!["label_".into()],
            label_values: vec!["o.metadata.labels".into()],
            value: "o.spec.replicas".into(),
            resolver: Some(ResolverKind::Cel),
        });
        let got = render(&spec, &platform_object(), &gvk(), &context()).await;

        let samples: Vec<&str> = got.lines().collect();
        assert_eq!(samples.len(), 1);
        assert!(samples[0].contains("label_foo=\"1\""));
        assert!(samples[0].contains("label_bar=\"2\""));
        assert!(samples[0].contains("label_job=\"resource-state-metrics\""));
    }

    #[tokio::test]
    async fn list_expansion_emits_one_sample_per_element() {
        let spec = family(MetricSpec {
            label_keys: vec!["v".into()],
            label_values: vec!["o.spec.versions".into()],
            value: "o.spec.replicas".into(),
            resolver: Some(ResolverKind::Cel),
        });
        let got = render(&spec, &platform_object(), &gvk(), &context()).await;
        assert_eq!(
            got,
            "kube_customresource_platform_replicas{v=\"v1\",group=\"contoso.com\",version=\"v1alpha1\",kind=\"MyPlatform\"} 3.000000\n\
             kube_customresource_platform_replicas{v=\"v2\",group=\"contoso.com\",version=\"v1alpha1\",kind=\"MyPlatform\"} 3.000000\n"
        );
    }

    #[tokio::test]
    async fn unresolved_sentinel_becomes_a_literal_label() {
        let spec = family(MetricSpec {
            label_keys: vec!["static".into()],
            label_values: vec!["43-1".into()],
            value: "spec.replicas".into(),
            resolver: None,
        });
        let got = render(&spec, &platform_object(), &gvk(), &context()).await;
        assert!(got.contains("static=\"43-1\""));
    }

    #[tokio::test]
    async fn label_length_mismatch_drops_the_metric() {
        let spec = family(MetricSpec {
            label_keys: vec!["a".into(), "b".into()],
            label_values: vec!["metadata.name".into(), "metadata.name".into(), "metadata.name".into()],
            value: "spec.replicas".into(),
            resolver: None,
        });
        let got = render(&spec, &platform_object(), &gvk(), &context()).await;
        assert_eq!(got, "");
    }

    #[tokio::test]
    async fn literal_value_resolves_through_the_sentinel() {
        for resolver in [None, Some(ResolverKind::Unstructured), Some(ResolverKind::Cel)] {
            let spec = family(MetricSpec {
                label_keys: vec!["name".into()],
                label_values: vec![match resolver {
                    Some(ResolverKind::Cel) => "o.metadata.name".into(),
                    _ => "metadata.name".into(),
                }],
                value: "42".into(),
                resolver,
            });
            let got = render(&spec, &platform_object(), &gvk(), &context()).await;
            assert_eq!(
                got,
                "kube_customresource_platform_replicas{name=\"test-sample\",group=\"contoso.com\",version=\"v1alpha1\",kind=\"MyPlatform\"} 42.000000\n",
                "resolver {resolver:?}",
            );
        }
    }

    #[tokio::test]
    async fn non_numeric_value_drops_the_metric() {
        let spec = family(MetricSpec {
            label_keys: vec![],
            label_values: vec![],
            value: "metadata.name".into(),
            resolver: None,
        });
        let got = render(&spec, &platform_object(), &gvk(), &context()).await;
        assert_eq!(got, "");
    }

    #[tokio::test]
    async fn family_labels_append_to_every_metric() {
        let mut spec = family(MetricSpec {
            label_keys: vec!["name".into()],
            label_values: vec!["metadata.name".into()],
            value: "spec.replicas".into(),
            resolver: None,
        });
        spec.label_keys = vec!["static".into()];
        spec.label_values = vec!["base".into()];

        let got = render(&spec, &platform_object(), &gvk(), &context()).await;
        assert!(got.contains("name=\"test-sample\",static=\"base\""));
    }

    #[test]
    fn label_values_escape_prometheus_specials() {
        assert_eq!(escape_label_value("a\\b\nc\"d"), "a\\\\b\\nc\\\"d");
    }

    #[test]
    fn keys_sanitize_to_snake_case() {
        assert_eq!(sanitize_key("FooBar"), "foo_bar");
        assert_eq!(sanitize_key("label_"), "label_");
        assert_eq!(sanitize_key("label_foo"), "label_foo");
        assert_eq!(sanitize_key("foo-bar"), "foo_bar");
        assert_eq!(sanitize_key("HTTPCode"), "http_code");
    }

    #[test]
    fn indexed_keys_are_detected() {
        assert!(is_indexed("versions#0"));
        assert!(is_indexed("tags#12"));
        assert!(!is_indexed("versions"));
        assert!(!is_indexed("#1"));
        assert!(!is_indexed("versions#"));
        assert!(!is_indexed("versions#a"));
    }
}
