//! Seams between the pool, its backends and the dispatcher.

use async_trait::async_trait;

use crate::errors::BackendError;

/// A single answer source managed by the backend pool.
///
/// `lookup` may be slow; the pool measures how long it takes and uses that
/// latency to drive failover. `None` means the prompt is not in the answer
/// table, in which case the pool answers with [`Backend::fallback_answer`].
#[async_trait]
pub trait Backend: Send + Sync {
    /// Name used in logs, metrics and health output.
    fn name(&self) -> &str;
    /// Answer for prompts missing from the table.
    fn fallback_answer(&self) -> &str;

    /// Look `prompt` up in the answer table.
    async fn lookup(&self, prompt: &str) -> Option<String>;
}

/// Turns a prompt into an answer. Implemented by the backend pool and by
/// test doubles; the dispatcher only depends on this trait.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Resolve one prompt.
    async fn resolve(&self, prompt: &str) -> Result<String, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct Echo;

    #[async_trait]
    impl Backend for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn fallback_answer(&self) -> &str {
            "?"
        }

        async fn lookup(&self, prompt: &str) -> Option<String> {
            (!prompt.is_empty()).then(|| prompt.to_string())
        }
    }

    #[tokio::test]
    async fn backend_is_object_safe() {
        let backend: Arc<dyn Backend> = Arc::new(Echo);
        assert_eq!(backend.name(), "echo");
        assert_eq!(backend.lookup("hi").await.as_deref(), Some("hi"));
        assert_eq!(backend.lookup("").await, None);
        assert_eq!(backend.fallback_answer(), "?");
    }
}
