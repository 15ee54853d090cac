//! Exposition writer.
//!
//! Serialises a group of stores so that all samples of a family appear
//! contiguously under a single `# HELP`/`# TYPE` block within one scrape,
//! which is the grouping Prometheus requires.

use std::sync::Arc;

use crate::store::Store;

/// Writes out every store's cached fragments, family-grouped. Each store's
/// reader lock is held only for the duration of that store's emission.
pub async fn write_stores(stores: &[Arc<Store>], out: &mut String) {
    for store in stores {
        let metrics = store.read_metrics().await;
        for (index, header) in store.headers().iter().enumerate() {
            if !header.is_empty() && header.as_str() != "\n" {
                out.push_str(header);
                out.push('\n');
            }
            for fragments in metrics.values() {
                if let Some(fragment) = fragments.get(index) {
                    out.push_str(fragment);
                }
            }
        }
    }
}
