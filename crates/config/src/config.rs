use std::{
    fs,
    ops::AddAssign,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, anyhow};
use mllm_shap_core::{
    ExplainSettings, GenerationSettings, LoadRequest, ModelMode,
    runtime::{DeviceKind, Precision},
};
use serde::{Deserialize, Serialize};

use crate::fs::{VirtualFileSystem, VirtualPath};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub models: ModelDefaults,
    pub inference: GenerationSettings,
    pub explain: ExplainSettings,
    pub server: ServerSettings,
}

/// Values used when a load request leaves a field out.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelDefaults {
    pub mode: ModelMode,
    pub model_id: Option<String>,
    pub device: DeviceKind,
    pub precision: Option<Precision>,
    pub prompt_template: Option<String>,
    pub revision: Option<String>,
}

impl Default for ModelDefaults {
    fn default() -> Self {
        Self {
            mode: ModelMode::CausalLm,
            model_id: None,
            device: DeviceKind::Cpu,
            precision: None,
            prompt_template: None,
            revision: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            cors_origins: vec![
                "http://localhost:3000".to_string(),
                "http://127.0.0.1:3000".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone)]
pub enum ResourceLocation {
    Virtual(VirtualPath),
    Physical(PathBuf),
}

impl ResourceLocation {
    pub fn display_with(&self, fs: &impl VirtualFileSystem) -> Result<String> {
        match self {
            ResourceLocation::Virtual(path) => {
                fs.with_physical_path(path, |p| Ok(p.display().to_string()))
            }
            ResourceLocation::Physical(path) => Ok(path.display().to_string()),
        }
    }
}

pub struct ConfigDescriptor {
    pub location: ResourceLocation,
}

impl AppConfig {
    pub fn load_or_init(
        fs: &impl VirtualFileSystem,
        override_path: Option<&Path>,
    ) -> Result<(Self, ConfigDescriptor)> {
        match override_path {
            Some(path) => load_physical_config(fs, path),
            None => load_virtual_config(fs),
        }
    }

    pub fn load_with_overrides(
        fs: &impl VirtualFileSystem,
        overrides: ConfigOverrides,
    ) -> Result<(Self, ConfigDescriptor)> {
        let config_path_override = overrides.config_path.clone();
        let (mut config, descriptor) = Self::load_or_init(fs, config_path_override.as_deref())?;
        config += overrides;
        config.normalise(fs)?;
        Ok((config, descriptor))
    }

    /// Create the directories the service writes into.
    pub fn normalise(&mut self, fs: &impl VirtualFileSystem) -> Result<()> {
        fs.ensure_dir(&VirtualPath::model_cache_dir())?;
        fs.ensure_dir(&VirtualPath::sessions_dir())?;
        if self.explain.batch_size == 0 {
            self.explain.batch_size = 1;
        }
        if self.explain.default_max_evals == 0 {
            return Err(anyhow!("explain.default_max_evals must be at least 1"));
        }
        Ok(())
    }

    /// Load request for the configured default model.
    pub fn default_load_request(&self) -> Result<LoadRequest> {
        let model_id = self
            .models
            .model_id
            .clone()
            .ok_or_else(|| anyhow!("no model configured; pass --model or set models.model_id"))?;
        Ok(LoadRequest {
            model_id,
            mode: self.models.mode,
            device: self.models.device,
            precision: self.models.precision,
            revision: self.models.revision.clone(),
            prompt_template: self.models.prompt_template.clone(),
        })
    }

    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        let model = &overrides.model;
        if let Some(model_id) = model.model_id.as_ref() {
            self.models.model_id = Some(model_id.clone());
        }
        if let Some(mode) = model.mode {
            self.models.mode = mode;
        }
        if let Some(device) = model.device {
            self.models.device = device;
        }
        if model.precision.is_some() {
            self.models.precision = model.precision;
        }
        if let Some(template) = model.prompt_template.as_ref() {
            self.models.prompt_template = Some(template.clone());
        }
        if let Some(revision) = model.revision.as_ref() {
            self.models.revision = Some(revision.clone());
        }

        let inference = &overrides.inference;
        if let Some(max_new_tokens) = inference.max_new_tokens {
            self.inference.max_new_tokens = max_new_tokens;
        }
        if let Some(do_sample) = inference.do_sample {
            self.inference.do_sample = do_sample;
        }
        if let Some(temperature) = inference.temperature {
            self.inference.temperature = temperature;
        }
        if let Some(top_p) = inference.top_p {
            self.inference.top_p = Some(top_p);
        }
        if let Some(top_k) = inference.top_k {
            self.inference.top_k = Some(top_k);
        }
        if let Some(repetition_penalty) = inference.repetition_penalty {
            self.inference.repetition_penalty = repetition_penalty;
        }
        if inference.seed.is_some() {
            self.inference.seed = inference.seed;
        }

        let explain = &overrides.explain;
        if let Some(max_evals) = explain.default_max_evals {
            self.explain.default_max_evals = max_evals;
        }
        if let Some(max_input_tokens) = explain.max_input_tokens {
            self.explain.max_input_tokens = max_input_tokens;
        }
        if let Some(batch_size) = explain.batch_size {
            self.explain.batch_size = batch_size;
        }
        if let Some(mask_token) = explain.mask_token.as_ref() {
            self.explain.mask_token = Some(mask_token.clone());
        }

        if let Some(host) = overrides.server.host.as_ref() {
            self.server.host = host.clone();
        }
        if let Some(port) = overrides.server.port {
            self.server.port = port;
        }
        if !overrides.server.cors_origins.is_empty() {
            self.server.cors_origins = overrides.server.cors_origins.clone();
        }
    }
}

fn parse_config(contents: &str, origin: &str) -> Result<AppConfig> {
    toml::from_str(contents).with_context(|| format!("failed to parse configuration at {origin}"))
}

fn load_virtual_config(fs: &impl VirtualFileSystem) -> Result<(AppConfig, ConfigDescriptor)> {
    let path = VirtualPath::config_file();
    let descriptor = ConfigDescriptor {
        location: ResourceLocation::Virtual(path.clone()),
    };
    if !fs.exists(&path)? {
        let mut cfg = AppConfig::default();
        cfg.normalise(fs)?;
        let serialized = toml::to_string_pretty(&cfg)?;
        fs.write(&path, serialized.as_bytes())?;
        return Ok((cfg, descriptor));
    }

    let bytes = fs.read(&path)?;
    let contents = String::from_utf8(bytes).context("configuration file is not valid UTF-8")?;
    let origin = descriptor.location.display_with(fs)?;
    let mut cfg = parse_config(&contents, &origin)?;
    cfg.normalise(fs)?;
    Ok((cfg, descriptor))
}

fn load_physical_config(
    fs: &impl VirtualFileSystem,
    path: &Path,
) -> Result<(AppConfig, ConfigDescriptor)> {
    let path_buf = path.to_path_buf();
    if !path.exists() {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
        let mut cfg = AppConfig::default();
        cfg.normalise(fs)?;
        let serialized = toml::to_string_pretty(&cfg)?;
        fs::write(&path_buf, serialized)
            .with_context(|| format!("failed to write configuration to {}", path_buf.display()))?;
        return Ok((
            cfg,
            ConfigDescriptor {
                location: ResourceLocation::Physical(path_buf),
            },
        ));
    }

    let contents = fs::read_to_string(&path_buf)
        .with_context(|| format!("failed to read configuration from {}", path_buf.display()))?;
    let mut cfg = parse_config(&contents, &path_buf.display().to_string())?;
    cfg.normalise(fs)?;
    Ok((
        cfg,
        ConfigDescriptor {
            location: ResourceLocation::Physical(path_buf),
        },
    ))
}

#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    pub config_path: Option<PathBuf>,
    pub model: ModelOverride,
    pub inference: InferenceOverride,
    pub explain: ExplainOverride,
    pub server: ServerOverride,
}

#[derive(Debug, Default, Clone)]
pub struct ModelOverride {
    pub model_id: Option<String>,
    pub mode: Option<ModelMode>,
    pub device: Option<DeviceKind>,
    pub precision: Option<Precision>,
    pub prompt_template: Option<String>,
    pub revision: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct InferenceOverride {
    pub max_new_tokens: Option<usize>,
    pub do_sample: Option<bool>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub top_k: Option<usize>,
    pub repetition_penalty: Option<f32>,
    pub seed: Option<u64>,
}

#[derive(Debug, Default, Clone)]
pub struct ExplainOverride {
    pub default_max_evals: Option<usize>,
    pub max_input_tokens: Option<usize>,
    pub batch_size: Option<usize>,
    pub mask_token: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct ServerOverride {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub cors_origins: Vec<String>,
}

pub trait ConfigOverride {
    fn apply(self, config: &mut AppConfig);
}

impl ConfigOverride for ConfigOverrides {
    fn apply(self, config: &mut AppConfig) {
        config.apply_overrides(&self);
    }
}

impl ConfigOverride for &ConfigOverrides {
    fn apply(self, config: &mut AppConfig) {
        config.apply_overrides(self);
    }
}

impl<O: ConfigOverride> AddAssign<O> for AppConfig {
    fn add_assign(&mut self, rhs: O) {
        rhs.apply(self);
    }
}
