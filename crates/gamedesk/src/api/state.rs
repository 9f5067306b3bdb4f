//! Application state shared across handlers.

use std::sync::Arc;

use crate::instance::InstanceService;

/// Application state.
#[derive(Clone)]
pub struct AppState {
    /// Instance lifecycle service.
    pub instances: InstanceService,
    /// Origins allowed to call the API cross-origin. Empty denies all.
    pub allowed_origins: Arc<Vec<String>>,
}

impl AppState {
    pub fn new(instances: InstanceService) -> Self {
        Self {
            instances,
            allowed_origins: Arc::new(Vec::new()),
        }
    }

    pub fn with_allowed_origins(mut self, origins: Vec<String>) -> Self {
        self.allowed_origins = Arc::new(origins);
        self
    }
}
