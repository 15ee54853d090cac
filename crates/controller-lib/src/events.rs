//! Event handler for ResourceMetricsMonitor changes.
//!
//! One invocation per dequeued (resource, event) pair: reconcile the
//! resource's metadata, surface progress through status conditions, and
//! rebuild or drop the derived stores. Per-resource failures are contained
//! here; only transient API errors bubble up for a rate-limited requeue.

use std::sync::Arc;
use std::time::Duration;

use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::builder::StoreBuilder;
use crate::config;
use crate::crd::{ConditionType, ResourceMetricsMonitor};
use crate::family::RenderContext;
use crate::registry::StoreRegistry;
use crate::telemetry::Telemetry;
use crate::version;

const METADATA_POLL_INTERVAL: Duration = Duration::from_secs(1);
const METADATA_POLL_ATTEMPTS: u32 = 60;

/// The kind of informer event being handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Add,
    Update,
    Delete,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Add => "addEvent",
            EventKind::Update => "updateEvent",
            EventKind::Delete => "deleteEvent",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that warrant a rate-limited requeue.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("kubernetes api error: {0}")]
    Api(#[from] kube::Error),
    #[error("timed out reconciling metadata for {0}")]
    MetadataDeadline(String),
}

pub struct EventHandler {
    client: Client,
    registry: Arc<StoreRegistry>,
    telemetry: Arc<Telemetry>,
    cel_cost_limit: u64,
    cel_timeout: Duration,
    root: CancellationToken,
}

impl EventHandler {
    pub fn new(
        client: Client,
        registry: Arc<StoreRegistry>,
        telemetry: Arc<Telemetry>,
        cel_cost_limit: u64,
        cel_timeout: Duration,
        root: CancellationToken,
    ) -> Self {
        Self {
            client,
            registry,
            telemetry,
            cel_cost_limit,
            cel_timeout,
            root,
        }
    }

    pub async fn handle(
        &self,
        event: EventKind,
        resource: &ResourceMetricsMonitor,
    ) -> Result<(), HandlerError> {
        let namespace = resource.namespace().unwrap_or_default();
        let name = resource.name_any();
        let uid = resource.uid().unwrap_or_default();

        // The resource is gone; there is no status left to write to.
        if event == EventKind::Delete {
            self.registry.drop_stores(&uid);
            self.telemetry.clear_monitored(&namespace, &name);
            self.telemetry.record_event(&namespace, &name, event.as_str(), true);
            info!(%namespace, %name, "dropped stores for deleted resource");
            return Ok(());
        }

        let api: Api<ResourceMetricsMonitor> = Api::namespaced(self.client.clone(), &namespace);

        match self.reconcile_metadata(&api, &name).await {
            Ok(()) => {}
            Err(HandlerError::Api(err)) if is_not_found(&err) => {
                // Raced a deletion; the delete event will clean up.
                debug!(%namespace, %name, "resource vanished during metadata reconciliation");
                return Ok(());
            }
            Err(err) => return Err(err),
        }

        self.emit_condition(&api, &name, ConditionType::Processed, false)
            .await?;

        let configuration_yaml = &resource.spec.configuration;
        if configuration_yaml.is_empty() {
            error!(%namespace, %name, "configuration YAML is empty, cannot process the resource");
            self.emit_condition(&api, &name, ConditionType::Failed, true)
                .await?;
            self.telemetry.record_event(&namespace, &name, event.as_str(), false);
            return Ok(());
        }

        // Rebuild from scratch: drop the previous generation (cancelling its
        // reflectors) and construct new stores from the configuration.
        self.registry.drop_stores(&uid);
        let configuration = match config::parse(configuration_yaml) {
            Ok(configuration) => configuration,
            Err(err) => {
                error!(%namespace, %name, error = %err, "failed to parse configuration YAML");
                self.telemetry.record_parse_error(&namespace, &name);
                self.emit_condition(&api, &name, ConditionType::Failed, true)
                    .await?;
                self.telemetry.record_event(&namespace, &name, event.as_str(), false);
                return Ok(());
            }
        };

        let builder = StoreBuilder::new(
            self.client.clone(),
            RenderContext {
                cel_cost_limit: self.cel_cost_limit,
                cel_timeout: self.cel_timeout,
                telemetry: Some(Arc::clone(&self.telemetry)),
                rmm_namespace: namespace.clone(),
                rmm_name: name.clone(),
            },
        );
        let cancel = self.root.child_token();
        let stores = configuration
            .stores
            .iter()
            .map(|spec| builder.build(spec, &cancel))
            .collect::<Vec<_>>();
        info!(%namespace, %name, stores = stores.len(), "built stores");
        self.registry.insert(&uid, stores, cancel);
        self.telemetry.mark_monitored(&namespace, &name);

        self.emit_condition(&api, &name, ConditionType::Processed, true)
            .await?;
        self.telemetry.record_event(&namespace, &name, event.as_str(), true);

        Ok(())
    }

    /// Ensures the standard labels are present on the resource, polling with
    /// GET/UPDATE so conflicting writers are tolerated.
    async fn reconcile_metadata(
        &self,
        api: &Api<ResourceMetricsMonitor>,
        name: &str,
    ) -> Result<(), HandlerError> {
        for _ in 0..METADATA_POLL_ATTEMPTS {
            let mut latest = api.get(name).await?;

            let labels = latest.labels_mut();
            let managed_by = labels.get("app.kubernetes.io/managed-by").map(String::as_str);
            let labelled_version = labels.get("app.kubernetes.io/version").map(String::as_str);
            if managed_by == Some(version::CONTROLLER_NAME)
                && labelled_version == Some(version::revision())
            {
                return Ok(());
            }
            labels.insert(
                "app.kubernetes.io/managed-by".to_owned(),
                version::CONTROLLER_NAME.to_owned(),
            );
            labels.insert(
                "app.kubernetes.io/version".to_owned(),
                version::revision().to_owned(),
            );

            match api.replace(name, &PostParams::default(), &latest).await {
                Ok(_) => return Ok(()),
                Err(err) if is_conflict(&err) => {
                    debug!(name, "conflict updating metadata, retrying");
                    tokio::time::sleep(METADATA_POLL_INTERVAL).await;
                }
                Err(err) => return Err(err.into()),
            }
        }

        Err(HandlerError::MetadataDeadline(name.to_owned()))
    }

    /// Writes the canonical condition for (type, status) onto the resource's
    /// status subresource.
    async fn emit_condition(
        &self,
        api: &Api<ResourceMetricsMonitor>,
        name: &str,
        condition: ConditionType,
        status: bool,
    ) -> Result<(), HandlerError> {
        let latest = match api.get(name).await {
            Ok(latest) => latest,
            Err(err) if is_not_found(&err) => {
                debug!(name, "resource vanished before condition write");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        let mut resource_status = latest.status.clone().unwrap_or_default();
        resource_status.set_condition(condition, status, latest.metadata.generation);

        api.patch_status(
            name,
            &PatchParams::default(),
            &Patch::Merge(json!({ "status": resource_status })),
        )
        .await?;

        Ok(())
    }
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 404)
}

fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 409)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FragmentMap, Store};

    #[test]
    fn event_kinds_render_their_informer_names() {
        assert_eq!(EventKind::Add.as_str(), "addEvent");
        assert_eq!(EventKind::Update.as_str(), "updateEvent");
        assert_eq!(EventKind::Delete.as_str(), "deleteEvent");
    }

    fn mock_client() -> Client {
        let service = tower::service_fn(|_request: http::Request<kube::client::Body>| async {
            Ok::<_, std::convert::Infallible>(
                http::Response::builder()
                    .status(200)
                    .body(kube::client::Body::empty())
                    .unwrap(),
            )
        });
        Client::new(service, "default")
    }

    fn deleted_resource() -> ResourceMetricsMonitor {
        let mut resource = ResourceMetricsMonitor::new(
            "to-delete",
            crate::crd::ResourceMetricsMonitorSpec {
                configuration: "stores: []".into(),
            },
        );
        resource.metadata.namespace = Some("default".into());
        resource.metadata.uid = Some("uid-1".into());
        resource
    }

    #[tokio::test]
    async fn delete_drops_all_stores_without_touching_the_api() {
        let registry = Arc::new(StoreRegistry::new());
        let token = CancellationToken::new();
        registry.insert(
            "uid-1",
            vec![Arc::new(Store::fixture(vec![], FragmentMap::new()))],
            token.clone(),
        );

        let handler = EventHandler::new(
            mock_client(),
            Arc::clone(&registry),
            Arc::new(Telemetry::new().unwrap()),
            1_000_000,
            Duration::from_secs(5),
            CancellationToken::new(),
        );

        handler
            .handle(EventKind::Delete, &deleted_resource())
            .await
            .unwrap();

        assert!(registry.is_empty());
        assert!(token.is_cancelled());
    }
}
