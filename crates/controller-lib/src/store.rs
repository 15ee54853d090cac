//! Per-GVK cache of rendered metric fragments.
//!
//! A store receives object events from its reflector and keeps, per object
//! UID, one pre-rendered exposition fragment per family. Scrapes stream the
//! cached text instead of re-rendering, which is what keeps scrape latency
//! flat as cluster sizes grow.

use std::collections::BTreeMap;

use kube::api::DynamicObject;
use kube::core::GroupVersionKind;
use kube::ResourceExt;
use serde_json::Value;
use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::{debug, warn};

use crate::config::{FamilySpec, StoreSpec};
use crate::family::{self, RenderContext};

/// Fragments per object: the i-th entry is the rendered text for family i.
pub type FragmentMap = BTreeMap<String, Vec<String>>;

pub struct Store {
    gvk: GroupVersionKind,
    headers: Vec<String>,
    families: Vec<FamilySpec>,
    context: RenderContext,
    metrics: RwLock<FragmentMap>,
}

impl Store {
    /// Builds a store from its spec, folding the store-wide labels and
    /// resolver default into every family exactly once.
    pub fn new(spec: &StoreSpec, context: RenderContext) -> Self {
        let headers = spec.families.iter().map(family::build_header).collect();
        let families = spec
            .families
            .iter()
            .map(|f| {
                let mut family = f.clone();
                family.label_keys.extend(spec.label_keys.iter().cloned());
                family.label_values.extend(spec.label_values.iter().cloned());
                family.resolver = family.resolver.or(spec.resolver);
                family
            })
            .collect();

        Self {
            gvk: GroupVersionKind::gvk(&spec.group, &spec.version, &spec.kind),
            headers,
            families,
            context,
            metrics: RwLock::new(FragmentMap::new()),
        }
    }

    pub fn gvk(&self) -> &GroupVersionKind {
        &self.gvk
    }

    /// One `# HELP`/`# TYPE` block per family, precomputed at build time.
    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    /// Read access for the exposition writer. The guard pins the fragment
    /// map for the duration of a single store's emission.
    pub async fn read_metrics(&self) -> RwLockReadGuard<'_, FragmentMap> {
        self.metrics.read().await
    }

    /// Renders all families for the object and swaps the fragments in.
    /// Rendering happens outside the lock so readers never observe a
    /// partially rendered family list.
    pub async fn add(&self, object: &DynamicObject) {
        let Some(uid) = object.uid() else {
            warn!(name = %object.name_any(), "object carries no UID, skipping");
            return;
        };

        let tree = self.to_unstructured(object);
        let mut fragments = Vec::with_capacity(self.families.len());
        for family in &self.families {
            fragments.push(family::render(family, &tree, &self.gvk, &self.context).await);
        }

        debug!(%uid, name = %object.name_any(), "add");
        self.metrics.write().await.insert(uid, fragments);
    }

    /// Metrics reflect the current object state, so an update is a re-render.
    pub async fn update(&self, object: &DynamicObject) {
        self.add(object).await;
    }

    pub async fn delete(&self, object: &DynamicObject) {
        let Some(uid) = object.uid() else {
            warn!(name = %object.name_any(), "object carries no UID, skipping");
            return;
        };

        debug!(%uid, name = %object.name_any(), "delete");
        self.metrics.write().await.remove(&uid);
    }

    /// Called on (re)list: every listed item is re-added.
    pub async fn replace(&self, objects: &[DynamicObject]) {
        for object in objects {
            self.add(object).await;
        }
    }

    fn to_unstructured(&self, object: &DynamicObject) -> Value {
        let mut tree = serde_json::to_value(object).unwrap_or(Value::Null);
        if let Value::Object(map) = &mut tree {
            map.entry("apiVersion").or_insert_with(|| {
                Value::String(if self.gvk.group.is_empty() {
                    self.gvk.version.clone()
                } else {
                    format!("{}/{}", self.gvk.group, self.gvk.version)
                })
            });
            map.entry("kind")
                .or_insert_with(|| Value::String(self.gvk.kind.clone()));
        }

        tree
    }

    #[cfg(test)]
    pub(crate) fn fixture(headers: Vec<String>, metrics: FragmentMap) -> Self {
        Self {
            gvk: GroupVersionKind::gvk("", "v1", "Fixture"),
            headers,
            families: Vec::new(),
            context: RenderContext {
                cel_cost_limit: 1_000_000,
                cel_timeout: std::time::Duration::from_secs(5),
                telemetry: None,
                rmm_namespace: String::new(),
                rmm_name: String::new(),
            },
            metrics: RwLock::new(metrics),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;
    use serde_json::json;

    fn store() -> Store {
        let configuration = config::parse(
            r#"
stores:
  - group: contoso.com
    version: v1alpha1
    kind: MyPlatform
    resource: myplatforms
    families:
      - name: platform_replicas
        help: Platform replicas.
        metrics:
          - labelKeys: [name]
            labelValues: [metadata.name]
            value: spec.replicas
      - name: platform_info
        help: Platform info.
        metrics:
          - labelKeys: [name]
            labelValues: [metadata.name]
            value: "1"
"#,
        )
        .unwrap();

        Store::new(
            &configuration.stores[0],
            RenderContext {
                cel_cost_limit: 1_000_000,
                cel_timeout: std::time::Duration::from_secs(5),
                telemetry: None,
                rmm_namespace: "default".into(),
                rmm_name: "rmm".into(),
            },
        )
    }

    fn object(uid: &str, replicas: u32) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "contoso.com/v1alpha1",
            "kind": "MyPlatform",
            "metadata": {"name": "test-sample", "uid": uid},
            "spec": {"replicas": replicas},
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn add_renders_one_fragment_per_family() {
        let store = store();
        store.add(&object("uid-1", 3)).await;

        let metrics = store.read_metrics().await;
        let fragments = metrics.get("uid-1").unwrap();
        assert_eq!(fragments.len(), store.headers().len());
        assert!(fragments[0].contains("platform_replicas"));
        assert!(fragments[0].contains("3.000000"));
        assert!(fragments[1].contains("platform_info"));
    }

    #[tokio::test]
    async fn update_rerenders_in_place() {
        let store = store();
        store.add(&object("uid-1", 3)).await;
        store.update(&object("uid-1", 5)).await;

        let metrics = store.read_metrics().await;
        assert_eq!(metrics.len(), 1);
        assert!(metrics.get("uid-1").unwrap()[0].contains("5.000000"));
    }

    #[tokio::test]
    async fn add_then_delete_leaves_no_trace() {
        let store = store();
        let object = object("uid-1", 3);
        store.add(&object).await;
        store.delete(&object).await;

        assert!(store.read_metrics().await.get("uid-1").is_none());
    }

    #[tokio::test]
    async fn replace_adds_every_item() {
        let store = store();
        store
            .replace(&[object("uid-1", 1), object("uid-2", 2)])
            .await;

        let metrics = store.read_metrics().await;
        assert_eq!(metrics.len(), 2);
    }

    #[tokio::test]
    async fn objects_without_uid_are_skipped() {
        let store = store();
        let stray: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "contoso.com/v1alpha1",
            "kind": "MyPlatform",
            "metadata": {"name": "no-uid"},
            "spec": {"replicas": 1},
        }))
        .unwrap();
        store.add(&stray).await;

        assert!(store.read_metrics().await.is_empty());
    }

    #[tokio::test]
    async fn store_labels_are_inherited_by_families() {
        let configuration = config::parse(
            r#"
stores:
  - group: contoso.com
    version: v1alpha1
    kind: MyPlatform
    resource: myplatforms
    labelKeys: [team]
    labelValues: [payments]
    families:
      - name: platform_replicas
        help: Platform replicas.
        metrics:
          - labelKeys: []
            labelValues: []
            value: spec.replicas
"#,
        )
        .unwrap();
        let store = Store::new(
            &configuration.stores[0],
            RenderContext {
                cel_cost_limit: 1_000_000,
                cel_timeout: std::time::Duration::from_secs(5),
                telemetry: None,
                rmm_namespace: "default".into(),
                rmm_name: "rmm".into(),
            },
        );
        store.add(&object("uid-1", 3)).await;

        let metrics = store.read_metrics().await;
        assert!(metrics.get("uid-1").unwrap()[0].contains("team=\"payments\""));
    }
}
