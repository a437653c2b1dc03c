use anyhow::Result;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

use super::types::Event;

/// Receives events of the types it was registered for
///
/// Handlers run one at a time on the dispatch loop, so a slow handler delays every
/// event behind it. Long work should be spawned rather than awaited here.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> Result<()>;

    /// Name used in delivery logs
    fn name(&self) -> &str {
        "anonymous"
    }
}

/// Adapter turning an async closure into an [`EventHandler`]
pub struct FnHandler<F> {
    name: String,
    func: F,
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, event: &Event) -> Result<()> {
        (self.func)(event.clone()).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Wrap an async closure as a shareable handler
pub fn handler_fn<F, Fut>(name: &str, func: F) -> Arc<dyn EventHandler>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnHandler {
        name: name.to_string(),
        func,
    })
}
