use std::path::{Path, PathBuf};

use anyhow::{Result, bail};

mod hugging_face;

pub(crate) use hugging_face::HuggingFaceProvider;

pub(crate) trait AssetProvider {
    fn display_name(&self) -> String;
    fn fetch(&self, remote_name: &str) -> Result<PathBuf>;

    /// Like [`AssetProvider::fetch`], for files a model may legitimately lack.
    fn try_fetch(&self, remote_name: &str) -> Option<PathBuf> {
        match self.fetch(remote_name) {
            Ok(path) => Some(path),
            Err(err) => {
                tracing::debug!("{remote_name} unavailable from {}: {err:#}", self.display_name());
                None
            }
        }
    }
}

pub(crate) struct LocalDirectoryProvider {
    root: PathBuf,
}

impl LocalDirectoryProvider {
    pub(crate) fn new(model_id: &str) -> Result<Self> {
        let root = expand_home(model_id);
        if !root.is_dir() {
            bail!("model directory {} does not exist", root.display());
        }
        Ok(Self { root })
    }
}

impl AssetProvider for LocalDirectoryProvider {
    fn display_name(&self) -> String {
        format!("local directory {}", self.root.display())
    }

    fn fetch(&self, remote_name: &str) -> Result<PathBuf> {
        let path = self.root.join(remote_name);
        if !path.is_file() {
            bail!("{} not found", path.display());
        }
        Ok(path)
    }
}

fn expand_home(model_id: &str) -> PathBuf {
    if let Some(rest) = model_id.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return Path::new(&home).join(rest);
        }
    }
    PathBuf::from(model_id)
}
