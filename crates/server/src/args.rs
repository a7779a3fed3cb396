use std::path::PathBuf;

use clap::Parser;
use mllm_shap_config::{AppConfig, ConfigOverride, ConfigOverrides};
use mllm_shap_core::{
    ModelMode,
    runtime::{DeviceKind, Precision},
};

#[derive(Parser, Debug, Default)]
#[command(author, version, about = "MLLM SHAP explanation API server", long_about = None)]
pub struct Args {
    /// Optional path to a configuration file (defaults to platform config dir).
    #[arg(long, value_name = "PATH", help_heading = "Application")]
    pub config: Option<PathBuf>,

    /// Default model id (Hugging Face repo or local directory).
    #[arg(long, value_name = "ID", help_heading = "Model")]
    pub model: Option<String>,

    /// Default inference mode for load requests that omit it.
    #[arg(long, value_enum, help_heading = "Model")]
    pub mode: Option<ModelMode>,

    /// Device backend (cpu/metal/cuda).
    #[arg(long, help_heading = "Model")]
    pub device: Option<DeviceKind>,

    /// Numeric precision override (cpu=f32 default, metal/cuda=f16).
    #[arg(long, help_heading = "Model")]
    pub dtype: Option<Precision>,

    /// Prompt template name, `instruct` or `raw`.
    #[arg(long, value_name = "NAME", help_heading = "Model")]
    pub prompt_template: Option<String>,

    /// Load the configured model before accepting requests.
    #[arg(long, help_heading = "Model")]
    pub preload: bool,

    /// Default max new tokens for causal generation.
    #[arg(long, help_heading = "Inference")]
    pub max_new_tokens: Option<usize>,

    /// Enable sampling during decoding (true/false).
    #[arg(long, help_heading = "Inference", value_name = "BOOL")]
    pub do_sample: Option<bool>,

    /// Softmax temperature for sampling.
    #[arg(long, help_heading = "Inference")]
    pub temperature: Option<f64>,

    /// RNG seed for sampling.
    #[arg(long, help_heading = "Inference")]
    pub seed: Option<u64>,

    /// Default evaluation budget for explanations.
    #[arg(long, help_heading = "Explain")]
    pub max_evals: Option<usize>,

    /// Masked variants scored per forward batch.
    #[arg(long, help_heading = "Explain")]
    pub batch_size: Option<usize>,

    /// Host/IP for Rocket to bind to.
    #[arg(long, help_heading = "Application")]
    pub host: Option<String>,

    /// TCP port for Rocket.
    #[arg(long, help_heading = "Application")]
    pub port: Option<u16>,

    /// Allowed CORS origin; repeat to allow several.
    #[arg(long = "cors-origin", value_name = "ORIGIN", help_heading = "Application")]
    pub cors_origins: Vec<String>,
}

impl From<&Args> for ConfigOverrides {
    fn from(args: &Args) -> Self {
        let mut overrides = ConfigOverrides::default();
        overrides.config_path = args.config.clone();
        overrides.model.model_id = args.model.clone();
        overrides.model.mode = args.mode;
        overrides.model.device = args.device;
        overrides.model.precision = args.dtype;
        overrides.model.prompt_template = args.prompt_template.clone();
        overrides.inference.max_new_tokens = args.max_new_tokens;
        overrides.inference.do_sample = args.do_sample;
        overrides.inference.temperature = args.temperature;
        overrides.inference.seed = args.seed;
        overrides.explain.default_max_evals = args.max_evals;
        overrides.explain.batch_size = args.batch_size;
        overrides.server.host = args.host.clone();
        overrides.server.port = args.port;
        overrides.server.cors_origins = args.cors_origins.clone();
        overrides
    }
}

impl ConfigOverride for &Args {
    fn apply(self, config: &mut AppConfig) {
        config.apply_overrides(&ConfigOverrides::from(self));
    }
}
