//! Receive-side message handler port.
//!
//! Handlers run on worker tasks spawned by the messenger's subscriber loop;
//! they may block without stalling message intake.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::models::MessageEnvelope;

/// A typed message handler registered against a payload kind.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, envelope: MessageEnvelope);
}

/// Adapter turning an async closure into a [`MessageHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(MessageEnvelope) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, envelope: MessageEnvelope) {
        (self.0)(envelope).await;
    }
}

/// Wrap an async closure as a shareable handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(MessageEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn closure_handlers_run() {
        tokio_test::block_on(async {
            let hits = Arc::new(AtomicU64::new(0));
            let hits_in = hits.clone();
            let handler = handler_fn(move |_env| {
                let hits = hits_in.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                }
            });

            let env = MessageEnvelope::broadcast("s", json!({"type": "ping"}));
            handler.handle(env).await;
            assert_eq!(hits.load(Ordering::SeqCst), 1);
        });
    }
}
