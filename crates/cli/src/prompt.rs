use std::fs;

use anyhow::{Context, Result, anyhow};

use crate::args::TextArgs;

pub fn load_text(args: &TextArgs) -> Result<Option<String>> {
    if let Some(path) = &args.text_file {
        return fs::read_to_string(path)
            .with_context(|| format!("failed to read text file {}", path.display()))
            .map(|s| Some(s.trim_end().to_owned()));
    }
    Ok(args.text.clone())
}

pub fn require_text(args: &TextArgs) -> Result<String> {
    load_text(args)?.ok_or_else(|| anyhow!("input text is required (use --text or --text-file)"))
}
