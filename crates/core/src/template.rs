use std::{
    collections::BTreeMap,
    sync::{RwLock, RwLockReadGuard},
};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// How a single user turn is laid out around its content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub name: String,
    pub user_prefix: String,
    pub user_suffix: String,
    /// Opens the assistant turn so that the next token is the reply.
    pub generation_prompt: String,
    pub system_prefix: String,
    pub system_suffix: String,
    /// Substrings of a Jinja `chat_template` identifying this layout.
    pub markers: Vec<String>,
}

impl PromptTemplate {
    /// Render one user turn followed by the assistant generation prompt.
    pub fn render_user_turn(&self, content: &str) -> String {
        self.render(None, content)
    }

    pub fn render(&self, system: Option<&str>, content: &str) -> String {
        let mut buffer = String::new();
        if let Some(system) = system.map(str::trim).filter(|s| !s.is_empty()) {
            buffer.push_str(&self.system_prefix);
            buffer.push_str(system);
            buffer.push_str(&self.system_suffix);
        }
        buffer.push_str(&self.user_prefix);
        buffer.push_str(content);
        buffer.push_str(&self.user_suffix);
        buffer.push_str(&self.generation_prompt);
        buffer
    }

    fn matches(&self, chat_template: &str) -> bool {
        !self.markers.is_empty() && self.markers.iter().all(|m| chat_template.contains(m))
    }
}

static PROMPT_TEMPLATES: Lazy<RwLock<BTreeMap<String, PromptTemplate>>> = Lazy::new(|| {
    let mut map = BTreeMap::new();
    for template in [
        chatml_template(),
        llama3_template(),
        llama2_template(),
        phi3_template(),
        plain_template(),
    ] {
        map.insert(template.name.clone(), template);
    }
    RwLock::new(map)
});

pub fn register_prompt_template(template: PromptTemplate) {
    let mut guard = PROMPT_TEMPLATES
        .write()
        .unwrap_or_else(|poison| poison.into_inner());
    guard.insert(template.name.clone(), template);
}

pub fn get_prompt_template(name: &str) -> Option<PromptTemplate> {
    let guard: RwLockReadGuard<_> = PROMPT_TEMPLATES
        .read()
        .unwrap_or_else(|poison| poison.into_inner());
    guard.get(name).cloned()
}

/// Map a Hugging Face Jinja chat template onto a registered layout.
///
/// Returns `None` when no registered template carries all of its markers; callers
/// then treat the chat-template capability as absent.
pub fn detect_prompt_template(chat_template: &str) -> Option<PromptTemplate> {
    let guard = PROMPT_TEMPLATES
        .read()
        .unwrap_or_else(|poison| poison.into_inner());
    // llama3 and phi3 markers are more specific than chatml/llama2, check them first.
    ["llama3", "phi3", "chatml", "llama2"]
        .iter()
        .filter_map(|name| guard.get(*name))
        .chain(guard.values())
        .find(|template| template.matches(chat_template))
        .cloned()
}

fn chatml_template() -> PromptTemplate {
    PromptTemplate {
        name: "chatml".into(),
        user_prefix: "<|im_start|>user\n".into(),
        user_suffix: "<|im_end|>\n".into(),
        generation_prompt: "<|im_start|>assistant\n".into(),
        system_prefix: "<|im_start|>system\n".into(),
        system_suffix: "<|im_end|>\n".into(),
        markers: vec!["<|im_start|>".into(), "<|im_end|>".into()],
    }
}

fn llama3_template() -> PromptTemplate {
    PromptTemplate {
        name: "llama3".into(),
        user_prefix: "<|start_header_id|>user<|end_header_id|>\n\n".into(),
        user_suffix: "<|eot_id|>".into(),
        generation_prompt: "<|start_header_id|>assistant<|end_header_id|>\n\n".into(),
        system_prefix: "<|start_header_id|>system<|end_header_id|>\n\n".into(),
        system_suffix: "<|eot_id|>".into(),
        markers: vec!["<|start_header_id|>".into(), "<|eot_id|>".into()],
    }
}

fn llama2_template() -> PromptTemplate {
    PromptTemplate {
        name: "llama2".into(),
        user_prefix: "[INST] ".into(),
        user_suffix: " [/INST]".into(),
        generation_prompt: String::new(),
        system_prefix: "<<SYS>>\n".into(),
        system_suffix: "\n<</SYS>>\n\n".into(),
        markers: vec!["[INST]".into(), "[/INST]".into()],
    }
}

fn phi3_template() -> PromptTemplate {
    PromptTemplate {
        name: "phi3".into(),
        user_prefix: "<|user|>\n".into(),
        user_suffix: "<|end|>\n".into(),
        generation_prompt: "<|assistant|>\n".into(),
        system_prefix: "<|system|>\n".into(),
        system_suffix: "<|end|>\n".into(),
        markers: vec!["<|user|>".into(), "<|end|>".into()],
    }
}

fn plain_template() -> PromptTemplate {
    PromptTemplate {
        name: "plain".into(),
        user_prefix: String::new(),
        user_suffix: String::new(),
        generation_prompt: String::new(),
        system_prefix: String::new(),
        system_suffix: "\n".into(),
        markers: Vec::new(),
    }
}
