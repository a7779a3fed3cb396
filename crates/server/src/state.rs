use std::sync::Arc;

use mllm_shap_config::ModelDefaults;
use mllm_shap_core::ModelContext;

use crate::sessions::SessionStore;

pub struct AppState {
    pub context: Arc<ModelContext>,
    pub sessions: Arc<dyn SessionStore>,
    /// Fills fields a load request leaves out.
    pub model_defaults: ModelDefaults,
}

impl AppState {
    pub fn new(
        context: Arc<ModelContext>,
        sessions: Arc<dyn SessionStore>,
        model_defaults: ModelDefaults,
    ) -> Self {
        Self {
            context,
            sessions,
            model_defaults,
        }
    }
}
