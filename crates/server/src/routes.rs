use std::sync::Arc;

use mllm_shap_config::ModelDefaults;
use mllm_shap_core::{
    LoadRequest, PredictInput,
    runtime::{parse_device, parse_precision},
};
use rocket::{
    Route, State,
    form::Form,
    fs::TempFile,
    http::Status,
    serde::json::Json,
    tokio::io::AsyncReadExt,
};
use tracing::{debug, info};

use crate::{
    error::ApiError,
    models::{
        CurrentModelResponse, ExplainTextRequest, ExplainTextResponse, HealthResponse,
        LoadModelRequest, LoadModelResponse, MessageResponse, PredictForm, PredictResponse,
    },
    sessions::{NewSession, Session, SessionSummary},
    state::AppState,
    tasks::run_blocking,
};

#[get("/health")]
pub fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

#[post("/models/load", format = "json", data = "<req>")]
pub async fn load_model(
    state: &State<AppState>,
    req: Json<LoadModelRequest>,
) -> Result<Json<LoadModelResponse>, ApiError> {
    let request = load_request(&state.model_defaults, req.into_inner())?;
    let context = Arc::clone(&state.context);
    let info = run_blocking("model load", move || context.load(&request)).await?;
    Ok(Json(LoadModelResponse {
        message: format!("Model {} loaded successfully", info.model_id),
        mode: info.mode,
        loaded_model_id: info.model_id,
        device: info.device,
        precision: info.precision,
    }))
}

#[get("/models/current")]
pub async fn current_model(state: &State<AppState>) -> Result<Json<CurrentModelResponse>, ApiError> {
    let context = Arc::clone(&state.context);
    let status = run_blocking("model status", move || context.status()).await?;
    Ok(Json(status.into()))
}

#[post("/models/unload")]
pub async fn unload_model(state: &State<AppState>) -> Result<Json<MessageResponse>, ApiError> {
    let context = Arc::clone(&state.context);
    let released = run_blocking("model unload", move || context.unload()).await?;
    let message = match released {
        Some(info) => format!("Model {} unloaded", info.model_id),
        None => "No model was loaded".to_string(),
    };
    Ok(Json(MessageResponse { message }))
}

#[post("/predict", data = "<form>")]
pub async fn predict(
    state: &State<AppState>,
    form: Form<PredictForm<'_>>,
) -> Result<Json<PredictResponse>, ApiError> {
    let form = form.into_inner();
    let audio = match form.audio_file.as_ref() {
        Some(file) if file.len() > 0 => Some(read_upload(file).await?),
        _ => None,
    };
    let input = PredictInput {
        text: form.text_input,
        audio,
    };
    debug!(
        has_text = input.text.is_some(),
        audio_bytes = input.audio.as_ref().map(Vec::len),
        "Prediction request"
    );
    let context = Arc::clone(&state.context);
    let prediction = run_blocking("prediction", move || context.predict(&input)).await?;
    Ok(Json(PredictResponse {
        generated_text: prediction.generated_text,
        inference_time_seconds: prediction.elapsed.as_secs_f64(),
    }))
}

#[post("/explain/text", format = "json", data = "<req>")]
pub async fn explain_text(
    state: &State<AppState>,
    req: Json<ExplainTextRequest>,
) -> Result<Json<ExplainTextResponse>, ApiError> {
    let ExplainTextRequest {
        text_input,
        max_evals,
    } = req.into_inner();
    let context = Arc::clone(&state.context);
    let explanation =
        run_blocking("explanation", move || context.explain_text(&text_input, max_evals)).await?;
    Ok(Json(ExplainTextResponse {
        tokens: explanation.attribution.tokens,
        shap_values: explanation.attribution.scores,
        explanation_time_seconds: explanation.elapsed.as_secs_f64(),
    }))
}

#[post("/", format = "json", data = "<req>")]
pub fn create_session(
    state: &State<AppState>,
    req: Json<NewSession>,
) -> Result<Json<Session>, ApiError> {
    let session = req.into_inner();
    if session.name.trim().is_empty() {
        return Err(ApiError::BadRequest("session name must not be empty".into()));
    }
    Ok(Json(state.sessions.create(session)?))
}

#[get("/")]
pub fn list_sessions(state: &State<AppState>) -> Result<Json<Vec<SessionSummary>>, ApiError> {
    Ok(Json(state.sessions.list()?))
}

#[get("/<id>")]
pub fn get_session(state: &State<AppState>, id: u64) -> Result<Json<Session>, ApiError> {
    state
        .sessions
        .get(id)?
        .map(Json)
        .ok_or_else(|| session_not_found(id))
}

#[delete("/<id>")]
pub fn delete_session(state: &State<AppState>, id: u64) -> Result<Status, ApiError> {
    if state.sessions.delete(id)? {
        info!(id, "Session deleted");
        Ok(Status::NoContent)
    } else {
        Err(session_not_found(id))
    }
}

pub fn api_routes() -> Vec<Route> {
    routes![
        health,
        load_model,
        current_model,
        unload_model,
        predict,
        explain_text
    ]
}

pub fn session_routes() -> Vec<Route> {
    routes![create_session, list_sessions, get_session, delete_session]
}

fn session_not_found(id: u64) -> ApiError {
    ApiError::NotFound(format!("session {id} not found"))
}

fn load_request(defaults: &ModelDefaults, req: LoadModelRequest) -> Result<LoadRequest, ApiError> {
    if req.model_id.trim().is_empty() {
        return Err(ApiError::BadRequest("model_id must not be empty".into()));
    }
    if req.trust_remote_code == Some(true) {
        debug!("trust_remote_code is ignored; only built-in architectures are loaded");
    }
    let device = match req.device.as_deref() {
        Some(name) => parse_device(name)?,
        None => defaults.device,
    };
    let precision = match req.precision.as_deref() {
        Some(name) => Some(parse_precision(name)?),
        None => defaults.precision,
    };
    Ok(LoadRequest {
        model_id: req.model_id.trim().to_string(),
        mode: req.mode.unwrap_or(defaults.mode),
        device,
        precision,
        revision: req.revision.or_else(|| defaults.revision.clone()),
        prompt_template: req
            .prompt_template
            .or_else(|| defaults.prompt_template.clone()),
    })
}

async fn read_upload(file: &TempFile<'_>) -> Result<Vec<u8>, ApiError> {
    let mut reader = Box::pin(
        file.open()
            .await
            .map_err(|err| ApiError::BadRequest(format!("failed to read audio_file: {err}")))?,
    );
    let mut bytes = Vec::with_capacity(file.len() as usize);
    reader
        .read_to_end(&mut bytes)
        .await
        .map_err(|err| ApiError::BadRequest(format!("failed to read audio_file: {err}")))?;
    Ok(bytes)
}
