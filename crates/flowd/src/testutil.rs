//! Shared fixtures for handler tests.

use std::sync::Arc;

use flow_core::config::Config;

use crate::engine::testing::MockEngine;
use crate::engine::{Engine, EngineRegistry};
use crate::metrics::Metrics;
use crate::queue::InMemoryQueue;
use crate::storage::tests::TestStorage;
use crate::AppContext;

/// Context with an unavailable default engine, which forces the stub
/// short-circuit paths in the planner, executor, and QA gate.
pub(crate) async fn test_context(ts: &TestStorage) -> Arc<AppContext> {
    test_context_with(ts, Config::default(), Arc::new(MockEngine::unavailable("codex"))).await
}

/// Context with a caller-supplied config and default engine.
pub(crate) async fn test_context_with(
    ts: &TestStorage,
    config: Config,
    engine: Arc<dyn Engine>,
) -> Arc<AppContext> {
    Arc::new(AppContext {
        storage: Arc::clone(&ts.storage),
        queue: Arc::new(InMemoryQueue::new()),
        engines: Arc::new(EngineRegistry::new(engine)),
        config,
        metrics: Arc::new(Metrics::new()),
    })
}
