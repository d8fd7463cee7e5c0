//! Table-driven backends built from configuration.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use tether_core::backend::Backend;
use tether_core::config::BackendSpec;

/// A backend answering from a fixed prompt table.
///
/// Lookups sleep for the configured latency before answering, which lets a
/// deployment or a test drive the pool's failover with slow prompts.
#[derive(Clone, Debug)]
pub struct StaticBackend {
    name: String,
    answers: HashMap<String, String>,
    fallback: String,
    latency: Duration,
    prompt_latency: HashMap<String, Duration>,
}

impl StaticBackend {
    /// Backend with no answers and no latency.
    pub fn new(name: impl Into<String>, fallback: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            answers: HashMap::new(),
            fallback: fallback.into(),
            latency: Duration::ZERO,
            prompt_latency: HashMap::new(),
        }
    }

    /// Answer `prompt` with `answer`.
    pub fn with_answer(mut self, prompt: impl Into<String>, answer: impl Into<String>) -> Self {
        let _ = self.answers.insert(prompt.into(), answer.into());
        self
    }

    /// Delay every lookup by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Delay only lookups of `prompt`.
    pub fn with_prompt_latency(mut self, prompt: impl Into<String>, latency: Duration) -> Self {
        let _ = self.prompt_latency.insert(prompt.into(), latency);
        self
    }

    fn latency_for(&self, prompt: &str) -> Duration {
        self.prompt_latency
            .get(prompt)
            .copied()
            .unwrap_or(self.latency)
    }
}

impl From<&BackendSpec> for StaticBackend {
    fn from(spec: &BackendSpec) -> Self {
        Self {
            name: spec.name.clone(),
            answers: spec.answers.clone(),
            fallback: spec.fallback.clone(),
            latency: Duration::from_millis(spec.latency_ms),
            prompt_latency: spec
                .prompt_latency_ms
                .iter()
                .map(|(prompt, ms)| (prompt.clone(), Duration::from_millis(*ms)))
                .collect(),
        }
    }
}

#[async_trait]
impl Backend for StaticBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn fallback_answer(&self) -> &str {
        &self.fallback
    }

    async fn lookup(&self, prompt: &str) -> Option<String> {
        let delay = self.latency_for(prompt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.answers.get(prompt).cloned()
    }
}

/// Build the ordered backend list for a pool from configuration.
pub fn catalog(specs: &[BackendSpec]) -> Vec<Arc<dyn Backend>> {
    specs
        .iter()
        .map(|spec| Arc::new(StaticBackend::from(spec)) as Arc<dyn Backend>)
        .collect()
}
