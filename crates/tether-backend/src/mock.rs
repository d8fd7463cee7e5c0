//! Scripted test doubles for resolvers and backends.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use tether_core::backend::{Backend, Resolver};
use tether_core::errors::BackendError;

/// One pre-programmed resolution outcome.
#[derive(Clone, Debug)]
pub enum Step {
    /// Succeed with this answer.
    Answer(String),
    /// Fail with this error.
    Fail(BackendError),
    /// Wait a duration, then produce the inner outcome.
    Delay(Duration, Box<Step>),
}

impl Step {
    /// Shorthand for [`Step::Answer`].
    pub fn answer(text: &str) -> Self {
        Self::Answer(text.to_string())
    }

    /// Shorthand for [`Step::Delay`].
    pub fn delayed(delay: Duration, inner: Step) -> Self {
        Self::Delay(delay, Box::new(inner))
    }

    async fn play(self) -> Result<String, BackendError> {
        let mut step = self;
        loop {
            match step {
                Self::Answer(text) => return Ok(text),
                Self::Fail(err) => return Err(err),
                Self::Delay(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    step = *inner;
                }
            }
        }
    }
}

/// Resolver that plays back steps in order, then repeats `otherwise`.
pub struct ScriptedResolver {
    steps: Mutex<VecDeque<Step>>,
    otherwise: Step,
    calls: AtomicUsize,
}

impl ScriptedResolver {
    /// Play `steps`, then fail every further call as unavailable.
    pub fn new(steps: Vec<Step>) -> Self {
        Self::with_default(
            steps,
            Step::Fail(BackendError::Unavailable("script exhausted".into())),
        )
    }

    /// Play `steps`, then repeat `otherwise`.
    pub fn with_default(steps: Vec<Step>, otherwise: Step) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            otherwise,
            calls: AtomicUsize::new(0),
        }
    }

    /// Every call plays `step`.
    pub fn always(step: Step) -> Self {
        Self::with_default(Vec::new(), step)
    }

    /// Resolutions started so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Resolver for ScriptedResolver {
    async fn resolve(&self, _prompt: &str) -> Result<String, BackendError> {
        let _ = self.calls.fetch_add(1, Ordering::Relaxed);
        let step = self
            .steps
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.otherwise.clone());
        step.play().await
    }
}

/// Backend whose lookups take scripted latencies and return scripted hits.
pub struct ScriptedBackend {
    name: String,
    fallback: String,
    lookups: Mutex<VecDeque<(Duration, Option<String>)>>,
    calls: AtomicUsize,
}

impl ScriptedBackend {
    /// Backend with an empty script.
    pub fn new(name: &str, fallback: &str) -> Self {
        Self {
            name: name.to_string(),
            fallback: fallback.to_string(),
            lookups: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Queue one lookup result. Unscripted lookups miss immediately.
    pub fn then(self, latency: Duration, hit: Option<&str>) -> Self {
        self.lookups
            .lock()
            .push_back((latency, hit.map(str::to_string)));
        self
    }

    /// Lookups started so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn fallback_answer(&self) -> &str {
        &self.fallback
    }

    async fn lookup(&self, _prompt: &str) -> Option<String> {
        let _ = self.calls.fetch_add(1, Ordering::Relaxed);
        let next = self.lookups.lock().pop_front();
        let (latency, hit) = next?;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        hit
    }
}
