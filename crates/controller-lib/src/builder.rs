//! Store builder: wires a dynamic list/watch to a store.
//!
//! For each store spec this sets up an `Api<DynamicObject>` over the target
//! GVR with the configured selectors, and runs a reflector task that feeds
//! watch events into the store. The task's lifetime is bound to the owning
//! RMM's cancellation token, so reconfiguring or deleting the RMM terminates
//! the watch.

use std::sync::Arc;

use futures::StreamExt;
use kube::api::{Api, ApiResource, DynamicObject};
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{warn, Instrument};

use crate::config::StoreSpec;
use crate::family::RenderContext;
use crate::store::Store;

pub struct StoreBuilder {
    client: Client,
    context: RenderContext,
}

impl StoreBuilder {
    pub fn new(client: Client, context: RenderContext) -> Self {
        Self { client, context }
    }

    /// Builds the store and spawns its reflector under `cancel`.
    pub fn build(&self, spec: &StoreSpec, cancel: &CancellationToken) -> Arc<Store> {
        let store = Arc::new(Store::new(spec, self.context.clone()));

        let resource = ApiResource::from_gvk_with_plural(store.gvk(), &spec.resource);
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &resource);

        let mut config = watcher::Config::default();
        if let Some(label) = &spec.selectors.label {
            config = config.labels(label);
        }
        if let Some(field) = &spec.selectors.field {
            config = config.fields(field);
        }

        let gvr = if spec.group.is_empty() {
            format!("{}/{}", spec.version, spec.resource)
        } else {
            format!("{}/{}/{}", spec.group, spec.version, spec.resource)
        };
        let span = tracing::info_span!("reflector", %gvr);
        tokio::spawn(
            run_reflector(api, config, Arc::clone(&store), cancel.clone()).instrument(span),
        );

        store
    }
}

/// Delivers watch events into the store until cancelled. Watch errors are
/// logged; the stream's default backoff re-establishes the watch.
async fn run_reflector(
    api: Api<DynamicObject>,
    config: watcher::Config,
    store: Arc<Store>,
    cancel: CancellationToken,
) {
    let mut stream = watcher(api, config).default_backoff().boxed();
    // Objects accumulated during a (re)list, applied as one replace.
    let mut relisted: Vec<DynamicObject> = Vec::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            event = stream.next() => match event {
                None => return,
                Some(Err(err)) => warn!(error = %err, "watch error, backing off"),
                Some(Ok(watcher::Event::Init)) => relisted.clear(),
                Some(Ok(watcher::Event::InitApply(object))) => relisted.push(object),
                Some(Ok(watcher::Event::InitDone)) => {
                    store.replace(&relisted).await;
                    relisted.clear();
                }
                Some(Ok(watcher::Event::Apply(object))) => store.add(&object).await,
                Some(Ok(watcher::Event::Delete(object))) => store.delete(&object).await,
            },
        }
    }
}
