//! coordcheck-server library
//!
//! Coordinate plausibility validation and wireless-anchor learning
//! service. The facade is stateless: handlers convert wire
//! representations to model types, invoke the validation or learning
//! engine, and schedule side effects through the async sink.

use std::sync::Arc;

use coordcheck_common::events::EventBus;
use coordcheck_common::params::ConfigRegistry;

pub mod accumulator;
pub mod analytics;
pub mod api;
pub mod catalog;
pub mod learn;
pub mod sink;
pub mod validate;

use accumulator::ObservationAccumulator;
use analytics::AnalyticsStore;
use catalog::{CatalogStore, KvCache};
use learn::LearningEngine;
use sink::AsyncSink;
use validate::ValidationEngine;

/// Application state shared across HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<CatalogStore>,
    pub validator: Arc<ValidationEngine>,
    pub accumulator: Arc<ObservationAccumulator>,
    pub learner: Arc<LearningEngine>,
    pub sink: Arc<AsyncSink>,
    pub config: Arc<ConfigRegistry>,
    pub bus: EventBus,
}

impl AppState {
    /// Wire the engines over the given backends
    pub fn new(
        kv: Arc<dyn KvCache>,
        analytics: Arc<dyn AnalyticsStore>,
        config: Arc<ConfigRegistry>,
        bus: EventBus,
    ) -> Self {
        let catalog = Arc::new(CatalogStore::new(kv));
        let accumulator = Arc::new(ObservationAccumulator::new(
            catalog.clone(),
            config.clone(),
        ));
        let validator = Arc::new(ValidationEngine::new(catalog.clone(), config.clone()));
        let learner = Arc::new(LearningEngine::new(catalog.clone(), accumulator.clone()));
        let sink = AsyncSink::new(analytics, bus.clone(), config.clone());

        Self {
            catalog,
            validator,
            accumulator,
            learner,
            sink,
            config,
            bus,
        }
    }
}

/// Build the application router
pub fn build_router(state: AppState) -> axum::Router {
    api::router(state)
}
