use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use hf_hub::{
    Repo, RepoType,
    api::sync::{ApiBuilder, ApiRepo},
};

use super::AssetProvider;

pub(crate) struct HuggingFaceProvider {
    repo_id: String,
    repo: ApiRepo,
}

impl HuggingFaceProvider {
    pub(crate) fn new(repo_id: &str, revision: Option<&str>, cache_dir: &Path) -> Result<Self> {
        let api = ApiBuilder::new()
            .with_cache_dir(cache_dir.to_path_buf())
            .with_progress(false)
            .build()
            .context("failed to initialise Hugging Face API client")?;
        let repo = match revision {
            Some(revision) => Repo::with_revision(
                repo_id.to_string(),
                RepoType::Model,
                revision.to_string(),
            ),
            None => Repo::model(repo_id.to_string()),
        };
        Ok(Self {
            repo_id: repo_id.to_string(),
            repo: api.repo(repo),
        })
    }
}

impl AssetProvider for HuggingFaceProvider {
    fn display_name(&self) -> String {
        format!("Hugging Face Hub ({})", self.repo_id)
    }

    fn fetch(&self, remote_name: &str) -> Result<PathBuf> {
        tracing::info!("Fetching {remote_name} from {}", self.repo_id);
        self.repo
            .get(remote_name)
            .with_context(|| format!("failed to download {remote_name} from Hugging Face"))
    }
}
