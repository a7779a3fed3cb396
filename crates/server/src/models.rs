use mllm_shap_core::{ModelMode, ModelStatus, SlotState};
use rocket::fs::TempFile;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct LoadModelRequest {
    pub model_id: String,
    #[serde(default)]
    pub mode: Option<ModelMode>,
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub precision: Option<String>,
    #[serde(default)]
    pub revision: Option<String>,
    #[serde(default)]
    pub prompt_template: Option<String>,
    /// Accepted for client compatibility; remote code is never executed.
    #[serde(default)]
    pub trust_remote_code: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct LoadModelResponse {
    pub message: String,
    pub mode: ModelMode,
    pub loaded_model_id: String,
    pub device: String,
    pub precision: String,
}

#[derive(Debug, Serialize)]
pub struct CurrentModelResponse {
    pub state: SlotState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<ModelMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub precision: Option<String>,
}

impl From<ModelStatus> for CurrentModelResponse {
    fn from(status: ModelStatus) -> Self {
        let info = status.info;
        Self {
            state: status.state,
            mode: info.as_ref().map(|info| info.mode),
            model_id: status.model_id,
            model_type: info.as_ref().map(|info| info.model_type.clone()),
            device: info.as_ref().map(|info| info.device.clone()),
            precision: info.map(|info| info.precision),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, FromForm)]
pub struct PredictForm<'r> {
    pub text_input: Option<String>,
    pub audio_file: Option<TempFile<'r>>,
}

#[derive(Debug, Serialize)]
pub struct PredictResponse {
    pub generated_text: String,
    pub inference_time_seconds: f64,
}

#[derive(Debug, Deserialize)]
pub struct ExplainTextRequest {
    pub text_input: String,
    #[serde(default)]
    pub max_evals: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct ExplainTextResponse {
    pub tokens: Vec<String>,
    pub shap_values: Vec<f32>,
    pub explanation_time_seconds: f64,
}
