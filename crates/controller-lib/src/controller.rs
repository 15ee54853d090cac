//! Controller: RMM informer, rate-limited workqueue, and worker pool.
//!
//! A watch over all ResourceMetricsMonitors feeds an object cache and the
//! workqueue; a pool of workers dequeues (key, event) pairs and delegates to
//! the event handler, requeuing with backoff on transient failure.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::StreamExt;
use kube::api::Api;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::crd::ResourceMetricsMonitor;
use crate::events::{EventHandler, EventKind};
use crate::registry::StoreRegistry;
use crate::telemetry::Telemetry;
use crate::workqueue::RateLimitingQueue;

/// Queue item: the `namespace/name` key plus the event that produced it.
type WorkItem = (String, EventKind);

/// Tunables forwarded from the command line.
#[derive(Clone)]
pub struct ControllerOptions {
    pub workers: usize,
    pub cel_cost_limit: u64,
    pub cel_timeout: Duration,
}

pub struct Controller {
    client: Client,
    options: ControllerOptions,
    queue: Arc<RateLimitingQueue<WorkItem>>,
    /// Last observed object per key, used for update filtering and for
    /// resolving queued keys back to objects.
    cache: Arc<DashMap<String, Arc<ResourceMetricsMonitor>>>,
    /// Final state of deleted objects, consumed by the delete path so the
    /// handler still sees the UID whose stores must be dropped.
    tombstones: Arc<DashMap<String, Arc<ResourceMetricsMonitor>>>,
    handler: EventHandler,
}

impl Controller {
    pub fn new(
        client: Client,
        registry: Arc<StoreRegistry>,
        telemetry: Arc<Telemetry>,
        options: ControllerOptions,
        root: CancellationToken,
    ) -> Self {
        let handler = EventHandler::new(
            client.clone(),
            registry,
            telemetry,
            options.cel_cost_limit,
            options.cel_timeout,
            root,
        );

        Self {
            client,
            options,
            queue: RateLimitingQueue::new(),
            cache: Arc::new(DashMap::new()),
            tombstones: Arc::new(DashMap::new()),
            handler,
        }
    }

    /// Runs the informer and worker pool until `shutdown` fires, then drains
    /// the queue and returns.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> anyhow::Result<()> {
        info!(workers = self.options.workers, "starting controller");

        let informer = {
            let controller = Arc::clone(&self);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { controller.run_informer(shutdown).await })
        };

        let workers: Vec<_> = (0..self.options.workers)
            .map(|index| {
                let controller = Arc::clone(&self);
                tokio::spawn(async move { controller.run_worker(index).await })
            })
            .collect();

        shutdown.cancelled().await;
        info!("shutting down controller");
        self.queue.shut_down();

        let _ = informer.await;
        for worker in workers {
            let _ = worker.await;
        }

        Ok(())
    }

    async fn run_informer(&self, shutdown: CancellationToken) {
        let api: Api<ResourceMetricsMonitor> = Api::all(self.client.clone());
        let mut stream = watcher(api, watcher::Config::default())
            .default_backoff()
            .boxed();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                event = stream.next() => match event {
                    None => return,
                    Some(Err(err)) => warn!(error = %err, "informer watch error, backing off"),
                    Some(Ok(watcher::Event::Init)) | Some(Ok(watcher::Event::InitDone)) => {}
                    Some(Ok(watcher::Event::InitApply(resource)))
                    | Some(Ok(watcher::Event::Apply(resource))) => self.observe_apply(resource),
                    Some(Ok(watcher::Event::Delete(resource))) => self.observe_delete(resource),
                },
            }
        }
    }

    fn observe_apply(&self, resource: ResourceMetricsMonitor) {
        let key = object_key(&resource);
        let resource = Arc::new(resource);

        // Cache before enqueuing so a dequeued key always resolves.
        let previous = self.cache.insert(key.clone(), Arc::clone(&resource));
        match previous {
            Some(old) => {
                if should_skip_update(&old, &resource) {
                    debug!(%key, "skipping update event without spec changes");
                    return;
                }
                self.queue.add((key, EventKind::Update));
            }
            None => self.queue.add((key, EventKind::Add)),
        }
    }

    fn observe_delete(&self, resource: ResourceMetricsMonitor) {
        let key = object_key(&resource);
        self.cache.remove(&key);
        self.tombstones.insert(key.clone(), Arc::new(resource));
        self.queue.add((key, EventKind::Delete));
    }

    async fn run_worker(&self, index: usize) {
        debug!(worker = index, "worker started");
        while let Some(item) = self.queue.get().await {
            match self.process(&item).await {
                Ok(()) => self.queue.forget(&item),
                Err(err) => {
                    error!(key = %item.0, event = %item.1, error = %err, "error syncing, requeuing");
                    self.queue.add_rate_limited(item.clone());
                }
            }
            self.queue.done(&item);
        }
        debug!(worker = index, "worker stopped");
    }

    async fn process(&self, (key, event): &WorkItem) -> anyhow::Result<()> {
        debug!(%key, event = %event, "syncing");

        let resource = match event {
            // Recover the final state recorded at delete observation.
            EventKind::Delete => match self.tombstones.remove(key) {
                Some((_, resource)) => resource,
                None => {
                    debug!(%key, "delete already processed, skipping");
                    return Ok(());
                }
            },
            EventKind::Add | EventKind::Update => match self.cache.get(key) {
                Some(entry) => Arc::clone(entry.value()),
                None => {
                    debug!(%key, "object no longer cached, skipping");
                    return Ok(());
                }
            },
        };

        self.handler.handle(*event, &resource).await?;

        Ok(())
    }
}

fn object_key(resource: &ResourceMetricsMonitor) -> String {
    format!(
        "{}/{}",
        resource.namespace().unwrap_or_default(),
        resource.name_any(),
    )
}

/// Update events that only touch the resource version (status writes,
/// metadata churn) are skipped so the handler's own writes cannot retrigger
/// reconciliation.
fn should_skip_update(old: &ResourceMetricsMonitor, new: &ResourceMetricsMonitor) -> bool {
    old.resource_version() == new.resource_version() || old.spec == new.spec
}
