mod providers;

use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use serde_json::Value;
use tracing::debug;

use providers::{AssetProvider, HuggingFaceProvider, LocalDirectoryProvider};

pub const CONFIG_FILENAME: &str = "config.json";
pub const TOKENIZER_FILENAME: &str = "tokenizer.json";
pub const TOKENIZER_CONFIG_FILENAME: &str = "tokenizer_config.json";
pub const WEIGHTS_FILENAME: &str = "model.safetensors";
pub const WEIGHTS_INDEX_FILENAME: &str = "model.safetensors.index.json";

/// Files needed to build a model and its tokenizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub tokenizer_config: Option<PathBuf>,
    pub weights: Vec<PathBuf>,
}

/// Whether `model_id` names a filesystem location rather than a Hub repository.
pub fn is_local_model(model_id: &str) -> bool {
    let path = Path::new(model_id);
    path.exists()
        || path.is_absolute()
        || model_id.starts_with("./")
        || model_id.starts_with("../")
        || model_id.starts_with('~')
}

/// Locate config, tokenizer and safetensors files for `model_id`.
///
/// Local directories are used in place; anything else is treated as a Hugging Face
/// repository id and downloaded into `cache_dir`.
pub fn resolve_model_files(
    model_id: &str,
    revision: Option<&str>,
    cache_dir: &Path,
) -> Result<ModelFiles> {
    if is_local_model(model_id) {
        let provider = LocalDirectoryProvider::new(model_id)?;
        resolve_with(&provider, model_id)
    } else {
        let provider = HuggingFaceProvider::new(model_id, revision, cache_dir)?;
        resolve_with(&provider, model_id)
    }
}

fn resolve_with(provider: &dyn AssetProvider, model_id: &str) -> Result<ModelFiles> {
    debug!(
        "Resolving {model_id} via {}",
        provider.display_name()
    );
    let config = provider.fetch(CONFIG_FILENAME)?;
    let tokenizer = provider.fetch(TOKENIZER_FILENAME)?;
    let tokenizer_config = provider.try_fetch(TOKENIZER_CONFIG_FILENAME);
    let weights = resolve_weights(provider)?;
    Ok(ModelFiles {
        config,
        tokenizer,
        tokenizer_config,
        weights,
    })
}

fn resolve_weights(provider: &dyn AssetProvider) -> Result<Vec<PathBuf>> {
    if let Some(index) = provider.try_fetch(WEIGHTS_INDEX_FILENAME) {
        let shards = weight_shards(&index)?;
        return shards
            .iter()
            .map(|shard| provider.fetch(shard))
            .collect();
    }
    match provider.try_fetch(WEIGHTS_FILENAME) {
        Some(path) => Ok(vec![path]),
        None => bail!(
            "{} has neither {WEIGHTS_FILENAME} nor {WEIGHTS_INDEX_FILENAME}",
            provider.display_name()
        ),
    }
}

/// Distinct shard file names listed in a safetensors index, in sorted order.
fn weight_shards(index: &Path) -> Result<Vec<String>> {
    let raw = fs::read_to_string(index)
        .with_context(|| format!("failed to read {}", index.display()))?;
    let value: Value = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse {}", index.display()))?;
    let Some(map) = value.get("weight_map").and_then(Value::as_object) else {
        bail!("{} has no weight_map", index.display());
    };
    let shards: BTreeSet<String> = map
        .values()
        .filter_map(Value::as_str)
        .map(str::to_owned)
        .collect();
    Ok(shards.into_iter().collect())
}
