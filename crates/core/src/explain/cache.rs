use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};

use tracing::{debug, info};

use crate::{
    error::{CoreError, Result},
    model::LoadedModel,
};

/// Identity of a cached explainer.
///
/// The load generation ties every entry to one installed model, so two models
/// with the same type and device never share an explainer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExplainerKey {
    pub model_id: String,
    pub model_type: String,
    pub device: String,
    pub algorithm: String,
    pub generation: u64,
}

impl ExplainerKey {
    pub fn for_model(model: &LoadedModel, algorithm: &str) -> Self {
        Self {
            model_id: model.info.model_id.clone(),
            model_type: model.info.model_type.clone(),
            device: model.info.device.clone(),
            algorithm: algorithm.to_string(),
            generation: model.generation(),
        }
    }
}

impl fmt::Display for ExplainerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}[{}#{}]",
            self.model_type, self.device, self.algorithm, self.model_id, self.generation
        )
    }
}

/// Process-wide explainer instances, keyed by model identity.
pub struct ExplainerCache<E> {
    entries: Mutex<HashMap<ExplainerKey, Arc<E>>>,
}

impl<E> Default for ExplainerCache<E> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<E> ExplainerCache<E> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<ExplainerKey, Arc<E>>>> {
        self.entries
            .lock()
            .map_err(|_| CoreError::Other(anyhow::anyhow!("explainer cache lock poisoned")))
    }

    /// Return the entry for `key`, building it with `factory` on a miss.
    ///
    /// The cache lock is held while `factory` runs, so concurrent misses build once.
    pub fn get_or_create<F>(&self, key: &ExplainerKey, factory: F) -> Result<Arc<E>>
    where
        F: FnOnce() -> Result<E>,
    {
        let mut entries = self.lock()?;
        if let Some(existing) = entries.get(key) {
            debug!(%key, "Using cached explainer");
            return Ok(existing.clone());
        }
        info!(%key, "Creating explainer");
        let created = Arc::new(factory()?);
        entries.insert(key.clone(), created.clone());
        Ok(created)
    }

    /// Drop every entry; returns how many were removed.
    pub fn clear(&self) -> Result<usize> {
        let mut entries = self.lock()?;
        let removed = entries.len();
        entries.clear();
        if removed > 0 {
            info!(removed, "Cleared explainer cache");
        }
        Ok(removed)
    }

    pub fn len(&self) -> usize {
        self.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
