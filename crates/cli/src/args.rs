use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use mllm_shap_config::{AppConfig, ConfigOverride, ConfigOverrides};
use mllm_shap_core::{
    ModelMode,
    runtime::{DeviceKind, Precision},
};

#[derive(Parser, Debug)]
#[command(author, version, about = "MLLM SHAP command line", long_about = None)]
pub struct Cli {
    /// Only log errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Generate a continuation (or transcription) for the given input.
    Predict(PredictArgs),
    /// Attribute the next-token prediction of a causal model to its input tokens.
    Explain(ExplainArgs),
}

#[derive(Args, Debug, Default, Clone)]
pub struct ModelArgs {
    /// Optional path to a configuration file (defaults to platform config dir).
    #[arg(long, value_name = "PATH", help_heading = "Application")]
    pub config: Option<PathBuf>,

    /// Model id (Hugging Face repo or local directory); defaults to `models.model_id`.
    #[arg(long, value_name = "ID", help_heading = "Model")]
    pub model: Option<String>,

    /// Inference mode.
    #[arg(long, value_enum, help_heading = "Model")]
    pub mode: Option<ModelMode>,

    /// Hub revision (branch, tag or commit).
    #[arg(long, help_heading = "Model")]
    pub revision: Option<String>,

    /// Device backend to execute on (cpu/metal/cuda).
    #[arg(long, help_heading = "Model")]
    pub device: Option<DeviceKind>,

    /// Numeric precision. Defaults to f32 on CPU and f16 on Metal/CUDA.
    #[arg(long, help_heading = "Model")]
    pub dtype: Option<Precision>,

    /// Prompt template name, `instruct` or `raw`.
    #[arg(long, value_name = "NAME", help_heading = "Model")]
    pub prompt_template: Option<String>,
}

#[derive(Args, Debug, Default, Clone)]
pub struct TextArgs {
    /// Input text.
    #[arg(long, conflicts_with = "text_file")]
    pub text: Option<String>,

    /// Read the input text from a UTF-8 file.
    #[arg(long, value_name = "PATH", conflicts_with = "text")]
    pub text_file: Option<PathBuf>,
}

#[derive(Args, Debug, Default, Clone)]
pub struct PredictArgs {
    #[command(flatten)]
    pub model: ModelArgs,

    #[command(flatten)]
    pub input: TextArgs,

    /// Audio file for multimodal chat models.
    #[arg(long, value_name = "PATH")]
    pub audio: Option<PathBuf>,

    /// Maximum number of tokens to generate.
    #[arg(long, help_heading = "Inference")]
    pub max_new_tokens: Option<usize>,

    /// Enable sampling during decoding (true/false).
    #[arg(long, help_heading = "Inference", value_name = "BOOL")]
    pub do_sample: Option<bool>,

    /// Softmax temperature for sampling.
    #[arg(long, help_heading = "Inference")]
    pub temperature: Option<f64>,

    /// Top-k sampling cutoff.
    #[arg(long, help_heading = "Inference")]
    pub top_k: Option<usize>,

    /// Nucleus sampling probability mass.
    #[arg(long, help_heading = "Inference")]
    pub top_p: Option<f64>,

    /// RNG seed for sampling.
    #[arg(long, help_heading = "Inference")]
    pub seed: Option<u64>,
}

#[derive(Args, Debug, Default, Clone)]
pub struct ExplainArgs {
    #[command(flatten)]
    pub model: ModelArgs,

    #[command(flatten)]
    pub input: TextArgs,

    /// Evaluation budget (defaults to `explain.default_max_evals`).
    #[arg(long, help_heading = "Explain")]
    pub max_evals: Option<usize>,

    /// Masked variants scored per forward batch.
    #[arg(long, help_heading = "Explain")]
    pub batch_size: Option<usize>,

    /// Override the mask token used for hidden words.
    #[arg(long, help_heading = "Explain")]
    pub mask_token: Option<String>,

    /// Print the attribution as JSON.
    #[arg(long)]
    pub json: bool,
}

impl From<&ModelArgs> for ConfigOverrides {
    fn from(args: &ModelArgs) -> Self {
        let mut overrides = ConfigOverrides::default();
        overrides.config_path = args.config.clone();
        overrides.model.model_id = args.model.clone();
        overrides.model.mode = args.mode;
        overrides.model.revision = args.revision.clone();
        overrides.model.device = args.device;
        overrides.model.precision = args.dtype;
        overrides.model.prompt_template = args.prompt_template.clone();
        overrides
    }
}

impl From<&PredictArgs> for ConfigOverrides {
    fn from(args: &PredictArgs) -> Self {
        let mut overrides = ConfigOverrides::from(&args.model);
        overrides.inference.max_new_tokens = args.max_new_tokens;
        overrides.inference.do_sample = args.do_sample;
        overrides.inference.temperature = args.temperature;
        overrides.inference.top_k = args.top_k;
        overrides.inference.top_p = args.top_p;
        overrides.inference.seed = args.seed;
        overrides
    }
}

impl From<&ExplainArgs> for ConfigOverrides {
    fn from(args: &ExplainArgs) -> Self {
        let mut overrides = ConfigOverrides::from(&args.model);
        overrides.explain.default_max_evals = args.max_evals;
        overrides.explain.batch_size = args.batch_size;
        overrides.explain.mask_token = args.mask_token.clone();
        overrides
    }
}

impl ConfigOverride for &PredictArgs {
    fn apply(self, config: &mut AppConfig) {
        config.apply_overrides(&ConfigOverrides::from(self));
    }
}

impl ConfigOverride for &ExplainArgs {
    fn apply(self, config: &mut AppConfig) {
        config.apply_overrides(&ConfigOverrides::from(self));
    }
}
