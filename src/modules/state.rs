//! Composition root — the shared state handed to every request handler.
//!
//! Everything is constructed once at startup; tests build their own instances
//! against an in-memory ledger.

use std::sync::Arc;

use crate::models::AppConfig;
use crate::modules::infra::database::Ledger;
use crate::modules::predict::engine::PredictionEngine;
use crate::modules::predict::learner::LimitLearner;
use crate::modules::router::ModelRouter;

pub struct AppState {
    pub config: AppConfig,
    pub ledger: Arc<Ledger>,
    pub learner: Arc<LimitLearner>,
    pub predictor: Arc<PredictionEngine>,
    pub router: Arc<ModelRouter>,
}

impl AppState {
    pub fn new(config: AppConfig, ledger: Arc<Ledger>) -> Self {
        let learner = Arc::new(LimitLearner::new(ledger.clone()));
        let predictor = Arc::new(PredictionEngine::new(ledger.clone(), learner.clone()));
        let router = Arc::new(ModelRouter::new(config.router.clone()));

        Self {
            config,
            ledger,
            learner,
            predictor,
            router,
        }
    }
}
