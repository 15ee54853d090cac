//! Escape hatch for hand-written collectors.
//!
//! Expressions the configuration DSL cannot represent can be served from
//! `/external` by implementing [`Collector`] and registering it at startup.
//! The controller itself ships none.

use async_trait::async_trait;
use tracing::error;

/// A hand-written metrics source. `collect` returns ready-to-serve
/// Prometheus exposition text.
#[async_trait]
pub trait Collector: Send + Sync {
    fn name(&self) -> &str;

    async fn collect(&self) -> anyhow::Result<String>;
}

/// The set of collectors backing `/external`.
#[derive(Default)]
pub struct ExternalCollectors {
    collectors: Vec<Box<dyn Collector>>,
}

impl ExternalCollectors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, collector: Box<dyn Collector>) {
        self.collectors.push(collector);
    }

    /// Concatenates every collector's output. A failing collector is logged
    /// and skipped; it never poisons the endpoint.
    pub async fn write_all(&self, out: &mut String) {
        for collector in &self.collectors {
            match collector.collect().await {
                Ok(text) => out.push_str(&text),
                Err(err) => {
                    error!(collector = collector.name(), error = %err, "external collector failed");
                }
            }
        }
    }
}
