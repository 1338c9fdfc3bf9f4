//! Shared Application State
//!
//! Holds the configuration, the session registry, and the orchestrator that
//! both transports drive. The registry is constructed here and injected,
//! never referenced as ambient global state, so tests stand up their own.

use crate::{
    config::Config,
    session::{orchestrator::Orchestrator, registry::SessionRegistry},
};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: SessionRegistry,
    pub orchestrator: Orchestrator,
}

impl AppState {
    pub fn new(config: Arc<Config>) -> Self {
        let registry = SessionRegistry::new();
        let orchestrator = Orchestrator::new(registry.clone(), config.clone());
        Self {
            config,
            registry,
            orchestrator,
        }
    }
}
