use std::{fmt::Write as _, fs, sync::Arc, time::Instant};

use anyhow::{Context, Result};
use mllm_shap_config::{AppConfig, LocalFileSystem, VirtualPath};
use mllm_shap_core::{AttributionResult, HubModelLoader, ModelContext, PredictInput};
use serde::Serialize;
use tracing::info;

use crate::{
    args::{Cli, Command, ExplainArgs, PredictArgs},
    prompt::{load_text, require_text},
};

const APP_NAME: &str = "mllm-shap";
const BAR_WIDTH: usize = 30;

pub fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Predict(args) => run_predict(args),
        Command::Explain(args) => run_explain(args),
    }
}

fn run_predict(args: PredictArgs) -> Result<()> {
    let text = load_text(&args.input)?;
    let audio = args
        .audio
        .as_ref()
        .map(|path| {
            fs::read(path).with_context(|| format!("failed to read audio file {}", path.display()))
        })
        .transpose()?;

    let fs = LocalFileSystem::new(APP_NAME);
    let (mut app_config, _) = AppConfig::load_or_init(&fs, args.model.config.as_deref())?;
    app_config += &args;
    app_config.normalise(&fs)?;
    let context = load_context(&fs, &app_config)?;

    let prediction = context.predict(&PredictInput { text, audio })?;
    info!("Generated in {:.2}s", prediction.elapsed.as_secs_f64());
    println!("{}", prediction.generated_text);
    Ok(())
}

#[derive(Serialize)]
struct ExplainOutput<'a> {
    tokens: &'a [String],
    shap_values: &'a [f32],
    explanation_time_seconds: f64,
}

fn run_explain(args: ExplainArgs) -> Result<()> {
    let text = require_text(&args.input)?;

    let fs = LocalFileSystem::new(APP_NAME);
    let (mut app_config, _) = AppConfig::load_or_init(&fs, args.model.config.as_deref())?;
    app_config += &args;
    app_config.normalise(&fs)?;
    let context = load_context(&fs, &app_config)?;

    let explanation = context.explain_text(&text, None)?;
    let attribution = &explanation.attribution;
    if args.json {
        let output = ExplainOutput {
            tokens: &attribution.tokens,
            shap_values: &attribution.scores,
            explanation_time_seconds: explanation.elapsed.as_secs_f64(),
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print!("{}", render_table(attribution));
        info!(
            "Explained {} tokens in {:.2}s",
            attribution.tokens.len(),
            explanation.elapsed.as_secs_f64()
        );
    }
    Ok(())
}

fn load_context(fs: &LocalFileSystem, app_config: &AppConfig) -> Result<ModelContext> {
    let request = app_config.default_load_request()?;
    let cache_dir = fs.physical_path(&VirtualPath::model_cache_dir());
    let context = ModelContext::new(
        Arc::new(HubModelLoader::new(cache_dir)),
        app_config.inference.clone(),
        app_config.explain.clone(),
    );

    let load_start = Instant::now();
    let info = context.load(&request)?;
    info!(
        "Model `{}` ready in {:.2?} (type={}, device={}, precision={})",
        info.model_id,
        load_start.elapsed(),
        info.model_type,
        info.device,
        info.precision
    );
    Ok(context)
}

/// One line per token: the token, its score and a bar scaled to the largest score.
fn render_table(attribution: &AttributionResult) -> String {
    let width = attribution
        .tokens
        .iter()
        .map(|token| display_token(token).chars().count())
        .max()
        .unwrap_or(0);
    let max_score = attribution.scores.iter().copied().fold(0f32, f32::max);

    let mut out = String::new();
    for (token, score) in attribution.tokens.iter().zip(&attribution.scores) {
        let filled = if max_score > 0.0 {
            ((score / max_score) * BAR_WIDTH as f32).round() as usize
        } else {
            0
        };
        let _ = writeln!(
            out,
            "{:<width$}  {:>10.6}  {}",
            display_token(token),
            score,
            "#".repeat(filled.min(BAR_WIDTH)),
        );
    }
    out
}

fn display_token(token: &str) -> String {
    format!("{:?}", token.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_scales_bars_to_the_top_score() {
        let attribution = AttributionResult {
            tokens: vec!["the ".into(), "movie ".into(), "great".into()],
            scores: vec![0.1, 0.0, 0.4],
        };
        let table = render_table(&attribution);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("\"the\""));
        assert!(lines[1].ends_with("0.000000  "));
        assert!(lines[2].ends_with(&"#".repeat(BAR_WIDTH)));
    }

    #[test]
    fn empty_attribution_renders_nothing() {
        assert!(render_table(&AttributionResult::default()).is_empty());
    }
}
