use std::{
    env, fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};

pub const CONFIG_DIR_ENV: &str = "MLLM_SHAP_CONFIG_DIR";
pub const CACHE_DIR_ENV: &str = "MLLM_SHAP_CACHE_DIR";
pub const DATA_DIR_ENV: &str = "MLLM_SHAP_DATA_DIR";

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Namespace {
    Config,
    /// Downloaded model files.
    Cache,
    /// Saved sessions.
    Data,
}

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct VirtualPath {
    namespace: Namespace,
    segments: Vec<String>,
}

impl VirtualPath {
    pub fn new(namespace: Namespace, segments: Vec<String>) -> Self {
        Self {
            namespace,
            segments,
        }
    }

    pub fn namespace(&self) -> Namespace {
        self.namespace
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn join(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self {
            namespace: self.namespace,
            segments,
        }
    }

    pub fn config_file() -> Self {
        Self::new(Namespace::Config, vec!["config.toml".into()])
    }

    pub fn model_cache_dir() -> Self {
        Self::new(Namespace::Cache, vec!["models".into()])
    }

    pub fn sessions_dir() -> Self {
        Self::new(Namespace::Data, vec!["sessions".into()])
    }

    pub fn session_file(id: u64) -> Self {
        Self::sessions_dir().join(format!("{id}.json"))
    }

    /// Next session id to hand out; ids are never reused.
    pub fn session_counter() -> Self {
        Self::sessions_dir().join("next_id")
    }
}

/// Abstraction over storage backends used by the application.
pub trait VirtualFileSystem: Send + Sync {
    fn read(&self, path: &VirtualPath) -> Result<Vec<u8>>;
    fn write(&self, path: &VirtualPath, contents: &[u8]) -> Result<()>;
    fn exists(&self, path: &VirtualPath) -> Result<bool>;
    fn ensure_dir(&self, path: &VirtualPath) -> Result<()>;
    fn ensure_parent(&self, path: &VirtualPath) -> Result<()>;
    fn remove_file(&self, path: &VirtualPath) -> Result<()>;
    /// File names directly under `path`; empty when the directory does not exist.
    fn list(&self, path: &VirtualPath) -> Result<Vec<String>>;

    fn with_physical_path<F, T>(&self, path: &VirtualPath, func: F) -> Result<T>
    where
        F: FnOnce(&Path) -> Result<T>;
}

#[derive(Debug, Clone)]
pub struct LocalFileSystem {
    app_name: String,
    config_root: PathBuf,
    cache_root: PathBuf,
    data_root: PathBuf,
}

impl LocalFileSystem {
    pub fn new(app_name: impl Into<String>) -> Self {
        let name = app_name.into();
        let config_root = env::var(CONFIG_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_config_dir(&name));
        let cache_root = env::var(CACHE_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_cache_dir(&name));
        let data_root = env::var(DATA_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_data_dir(&name));
        Self {
            app_name: name,
            config_root,
            cache_root,
            data_root,
        }
    }

    /// All three namespaces under one directory, as `config/`, `cache/` and `data/`.
    pub fn rooted_at(app_name: impl Into<String>, root: &Path) -> Self {
        Self {
            app_name: app_name.into(),
            config_root: root.join("config"),
            cache_root: root.join("cache"),
            data_root: root.join("data"),
        }
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn physical_path(&self, path: &VirtualPath) -> PathBuf {
        let root = match path.namespace() {
            Namespace::Config => &self.config_root,
            Namespace::Cache => &self.cache_root,
            Namespace::Data => &self.data_root,
        };
        let mut buf = root.clone();
        for segment in path.segments() {
            buf.push(segment);
        }
        buf
    }
}

impl VirtualFileSystem for LocalFileSystem {
    fn read(&self, path: &VirtualPath) -> Result<Vec<u8>> {
        let physical = self.physical_path(path);
        fs::read(&physical).with_context(|| format!("failed to read {}", physical.display()))
    }

    fn write(&self, path: &VirtualPath, contents: &[u8]) -> Result<()> {
        let physical = self.physical_path(path);
        self.ensure_parent(path)?;
        fs::write(&physical, contents)
            .with_context(|| format!("failed to write {}", physical.display()))
    }

    fn exists(&self, path: &VirtualPath) -> Result<bool> {
        Ok(self.physical_path(path).exists())
    }

    fn ensure_dir(&self, path: &VirtualPath) -> Result<()> {
        let physical = self.physical_path(path);
        fs::create_dir_all(&physical)
            .with_context(|| format!("failed to create directory {}", physical.display()))
    }

    fn ensure_parent(&self, path: &VirtualPath) -> Result<()> {
        let physical = self.physical_path(path);
        if let Some(parent) = physical.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
        Ok(())
    }

    fn remove_file(&self, path: &VirtualPath) -> Result<()> {
        let physical = self.physical_path(path);
        if physical.exists() {
            fs::remove_file(&physical)
                .with_context(|| format!("failed to remove {}", physical.display()))?;
        }
        Ok(())
    }

    fn list(&self, path: &VirtualPath) -> Result<Vec<String>> {
        let physical = self.physical_path(path);
        if !physical.is_dir() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        let entries = fs::read_dir(&physical)
            .with_context(|| format!("failed to list {}", physical.display()))?;
        for entry in entries {
            let entry = entry.with_context(|| format!("failed to list {}", physical.display()))?;
            if entry.path().is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    fn with_physical_path<F, T>(&self, path: &VirtualPath, func: F) -> Result<T>
    where
        F: FnOnce(&Path) -> Result<T>,
    {
        func(&self.physical_path(path))
    }
}

fn default_config_dir(app_name: &str) -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| fallback_home(".config"))
        .join(app_name)
}

fn default_cache_dir(app_name: &str) -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| fallback_home(".cache"))
        .join(app_name)
}

fn default_data_dir(app_name: &str) -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| fallback_home(".local/share"))
        .join(app_name)
}

fn fallback_home(component: &str) -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(component)
}
