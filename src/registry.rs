//! Tag-to-handler registry.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::job::Handler;

/// Concurrent mapping from handler tag to handler.
///
/// Registering an already-present tag overwrites the previous handler.
/// There is no unregister: the engine lives or dies as a unit, and callers
/// that want swap-and-delete semantics register a fresh tag instead.
#[derive(Default)]
pub(crate) struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn Handler>>>,
}

impl HandlerRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, tag: impl Into<String>, handler: Arc<dyn Handler>) {
        self.handlers.write().insert(tag.into(), handler);
    }

    pub(crate) fn get(&self, tag: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.read().get(tag).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Job;

    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    struct CountingHandler(Arc<AtomicUsize>);

    #[async_trait::async_trait]
    impl Handler for CountingHandler {
        async fn handle(&self, _job: Job) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn job() -> Job {
        Job {
            key: "k".to_string(),
            delay_time: 0,
            cycle: false,
            tag: "T".to_string(),
            args: serde_json::Map::new(),
        }
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = HandlerRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        registry.register("T", Arc::new(CountingHandler(count.clone())));

        let handler = registry.get("T").expect("handler registered");
        handler.handle(job()).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        assert!(registry.get("UNKNOWN").is_none());
    }

    #[tokio::test]
    async fn test_register_overwrites_previous_handler() {
        let registry = HandlerRegistry::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        registry.register("T", Arc::new(CountingHandler(first.clone())));
        registry.register("T", Arc::new(CountingHandler(second.clone())));

        registry.get("T").unwrap().handle(job()).await.unwrap();
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }
}
