use std::sync::Arc;

use candle_core::{Device, Tensor};
use mllm_shap_config::{LocalFileSystem, ModelDefaults};
use mllm_shap_core::{
    CoreError, ExplainSettings, GenerationSettings, LoadRequest, LoadedModel, ModelContext,
    ModelInfo, ModelLoader, ModelMode,
    model::{CausalLm, ModelBackend},
    tokenizer::{TextTokenizer, TokenizerMetadata},
};
use rocket::{
    Config,
    http::{ContentType, Header, Status},
    local::blocking::Client,
};
use serde_json::{Map, Value, json};
use tempfile::TempDir;
use tokenizers::Tokenizer;

use crate::{app::build_rocket, sessions::FileSessionStore, state::AppState};

const WORDS: [&str; 4] = ["the", "film", "great", "positive"];
const ORIGIN: &str = "http://localhost:3000";

fn tokenizer() -> Tokenizer {
    let mut vocab = Map::new();
    for (idx, word) in ["[UNK]", "[PAD]", "</s>"].iter().chain(WORDS.iter()).enumerate() {
        vocab.insert((*word).to_string(), Value::from(idx as u64));
    }
    let spec = json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [{
            "id": 2, "content": "</s>", "single_word": false, "lstrip": false,
            "rstrip": false, "normalized": false, "special": true
        }],
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": null,
        "decoder": null,
        "model": {"type": "WordLevel", "vocab": vocab, "unk_token": "[UNK]"}
    });
    Tokenizer::from_bytes(spec.to_string().as_bytes()).unwrap()
}

/// "great" (id 5) predicts "positive" (id 6), which predicts end of sequence.
struct TinyLm {
    device: Device,
}

impl CausalLm for TinyLm {
    fn logits_width(&self) -> usize {
        WORDS.len() + 3
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn clear_cache(&mut self) -> mllm_shap_core::Result<()> {
        Ok(())
    }

    fn forward_last(
        &mut self,
        input_ids: &Tensor,
        _seqlen_offset: usize,
    ) -> mllm_shap_core::Result<Tensor> {
        let width = self.logits_width();
        let rows = input_ids.to_vec2::<u32>()?;
        let mut data = Vec::new();
        for row in &rows {
            let mut logits = vec![0f32; width];
            if row.contains(&5) {
                logits[6] += 5.0;
            }
            if row.contains(&6) {
                logits[2] += 10.0;
            }
            data.extend(logits);
        }
        Ok(Tensor::from_vec(data, (rows.len(), width), &self.device)?)
    }
}

struct TinyLoader;

impl ModelLoader for TinyLoader {
    fn load(&self, request: &LoadRequest) -> mllm_shap_core::Result<LoadedModel> {
        if request.mode == ModelMode::MultimodalChat {
            return Err(CoreError::Config("no multimodal backend registered".into()));
        }
        if request.model_id.starts_with("broken") {
            return Err(CoreError::Resource("weights are corrupt".into()));
        }
        let tokenizer = TextTokenizer::new(
            tokenizer(),
            TokenizerMetadata {
                eos_token: Some("</s>".into()),
                ..TokenizerMetadata::default()
            },
            None,
        )?;
        let info = ModelInfo {
            model_id: request.model_id.clone(),
            mode: request.mode,
            model_type: "tiny".into(),
            device: request.device.to_string(),
            precision: request
                .precision
                .map(|p| p.to_string())
                .unwrap_or_else(|| "float32".into()),
        };
        let lm = TinyLm {
            device: Device::Cpu,
        };
        Ok(LoadedModel::new(info, ModelBackend::Causal(Box::new(lm)), tokenizer))
    }
}

struct Harness {
    client: Client,
    _dir: TempDir,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let fs = Arc::new(LocalFileSystem::rooted_at("mllm-shap", dir.path()));
    let context = Arc::new(ModelContext::new(
        Arc::new(TinyLoader),
        GenerationSettings::default(),
        ExplainSettings {
            default_max_evals: 32,
            ..ExplainSettings::default()
        },
    ));
    let sessions = Arc::new(FileSessionStore::new(fs).unwrap());
    let state = AppState::new(context, sessions, ModelDefaults::default());
    let rocket = build_rocket(Config::figment(), state, vec![ORIGIN.to_string()]);
    Harness {
        client: Client::tracked(rocket).unwrap(),
        _dir: dir,
    }
}

fn json_body(response: rocket::local::blocking::LocalResponse<'_>) -> Value {
    response.into_json::<Value>().expect("json body")
}

fn load(client: &Client, body: Value) -> (Status, Value) {
    let response = client
        .post("/models/load")
        .header(ContentType::JSON)
        .body(body.to_string())
        .dispatch();
    (response.status(), json_body(response))
}

fn multipart_text(text: &str) -> (Header<'static>, String) {
    let boundary = "mllm-shap-boundary";
    let body = format!(
        "--{boundary}\r\nContent-Disposition: form-data; name=\"text_input\"\r\n\r\n{text}\r\n--{boundary}--\r\n"
    );
    (
        Header::new("Content-Type", format!("multipart/form-data; boundary={boundary}")),
        body,
    )
}

#[test]
fn health_reports_ok() {
    let h = harness();
    let response = h.client.get("/health").dispatch();
    assert_eq!(response.status(), Status::Ok);
    assert_eq!(json_body(response), json!({"status": "ok"}));
}

#[test]
fn requests_before_loading_are_client_errors() {
    let h = harness();
    let response = h
        .client
        .post("/explain/text")
        .header(ContentType::JSON)
        .body(json!({"text_input": "the film"}).to_string())
        .dispatch();
    assert_eq!(response.status(), Status::BadRequest);
    let body = json_body(response);
    assert_eq!(body["error"]["type"], "invalid_request_error");

    let current = json_body(h.client.get("/models/current").dispatch());
    assert_eq!(current, json!({"state": "unloaded"}));
}

#[test]
fn load_predict_and_explain() {
    let h = harness();
    let (status, loaded) = load(&h.client, json!({"model_id": "local/tiny", "mode": "text_shap"}));
    assert_eq!(status, Status::Ok);
    assert_eq!(loaded["loaded_model_id"], "local/tiny");
    assert_eq!(loaded["mode"], "causal_lm");
    assert_eq!(loaded["device"], "cpu");

    let current = json_body(h.client.get("/models/current").dispatch());
    assert_eq!(current["state"], "loaded");
    assert_eq!(current["model_id"], "local/tiny");

    let (content_type, body) = multipart_text("the film was great");
    let response = h.client.post("/predict").header(content_type).body(body).dispatch();
    assert_eq!(response.status(), Status::Ok);
    let prediction = json_body(response);
    assert_eq!(prediction["generated_text"], "positive");
    assert!(prediction["inference_time_seconds"].as_f64().unwrap() >= 0.0);

    let response = h
        .client
        .post("/explain/text")
        .header(ContentType::JSON)
        .body(json!({"text_input": "the film was great", "max_evals": 16}).to_string())
        .dispatch();
    assert_eq!(response.status(), Status::Ok);
    let explanation = json_body(response);
    let tokens = explanation["tokens"].as_array().unwrap();
    let values = explanation["shap_values"].as_array().unwrap();
    assert_eq!(tokens.len(), values.len());
    assert_eq!(tokens.len(), 4);
    assert!(values.iter().all(|v| v.as_f64().unwrap() >= 0.0));
}

#[test]
fn predict_without_text_is_rejected_for_causal_models() {
    let h = harness();
    load(&h.client, json!({"model_id": "local/tiny"}));
    let (content_type, body) = multipart_text("   ");
    let response = h.client.post("/predict").header(content_type).body(body).dispatch();
    assert_eq!(response.status(), Status::BadRequest);
}

#[test]
fn zero_budget_is_rejected() {
    let h = harness();
    load(&h.client, json!({"model_id": "local/tiny"}));
    let response = h
        .client
        .post("/explain/text")
        .header(ContentType::JSON)
        .body(json!({"text_input": "great", "max_evals": 0}).to_string())
        .dispatch();
    assert_eq!(response.status(), Status::BadRequest);
}

#[test]
fn quantized_precision_is_rejected() {
    let h = harness();
    let (status, body) = load(&h.client, json!({"model_id": "local/tiny", "precision": "int8"}));
    assert_eq!(status, Status::BadRequest);
    assert!(body["error"]["message"].as_str().unwrap().contains("int8"));
}

#[test]
fn failed_loads_leave_nothing_loaded() {
    let h = harness();
    load(&h.client, json!({"model_id": "local/tiny"}));

    let (status, _) = load(&h.client, json!({"model_id": "broken/tiny"}));
    assert_eq!(status, Status::InternalServerError);
    let current = json_body(h.client.get("/models/current").dispatch());
    assert_eq!(current["state"], "unloaded");

    let (status, _) = load(
        &h.client,
        json!({"model_id": "LiquidAI/LFM2-Audio-1.5B", "mode": "lfm2"}),
    );
    assert_eq!(status, Status::BadRequest);
}

#[test]
fn unload_releases_the_model() {
    let h = harness();
    load(&h.client, json!({"model_id": "local/tiny"}));
    let body = json_body(h.client.post("/models/unload").dispatch());
    assert_eq!(body["message"], "Model local/tiny unloaded");
    let body = json_body(h.client.post("/models/unload").dispatch());
    assert_eq!(body["message"], "No model was loaded");
}

#[test]
fn sessions_round_trip() {
    let h = harness();
    let payload = json!({
        "name": "review",
        "text_input": "the film was great",
        "model_settings": {"model_id": "local/tiny"},
        "explain_settings": {"max_evals": 16},
        "attributions": {"tokens": ["great"], "shap_values": [0.7]}
    });
    let response = h
        .client
        .post("/sessions")
        .header(ContentType::JSON)
        .body(payload.to_string())
        .dispatch();
    assert_eq!(response.status(), Status::Ok);
    let created = json_body(response);
    let id = created["id"].as_u64().unwrap();
    assert_eq!(created["attributions"], payload["attributions"]);

    let listed = json_body(h.client.get("/sessions").dispatch());
    assert_eq!(listed[0]["id"].as_u64(), Some(id));
    assert_eq!(listed[0]["name"], "review");

    let fetched = json_body(h.client.get(format!("/sessions/{id}")).dispatch());
    assert_eq!(fetched, created);

    let response = h.client.delete(format!("/sessions/{id}")).dispatch();
    assert_eq!(response.status(), Status::NoContent);
    let response = h.client.get(format!("/sessions/{id}")).dispatch();
    assert_eq!(response.status(), Status::NotFound);
    assert_eq!(json_body(response)["error"]["type"], "not_found_error");
    let response = h.client.delete(format!("/sessions/{id}")).dispatch();
    assert_eq!(response.status(), Status::NotFound);
}

#[test]
fn cors_echoes_allowed_origins_only() {
    let h = harness();
    let response = h
        .client
        .get("/health")
        .header(Header::new("Origin", ORIGIN))
        .dispatch();
    assert_eq!(
        response.headers().get_one("Access-Control-Allow-Origin"),
        Some(ORIGIN)
    );
    assert_eq!(
        response.headers().get_one("Access-Control-Allow-Credentials"),
        Some("true")
    );

    let response = h
        .client
        .get("/health")
        .header(Header::new("Origin", "http://evil.example"))
        .dispatch();
    assert!(response.headers().get_one("Access-Control-Allow-Origin").is_none());

    let preflight = h
        .client
        .options("/explain/text")
        .header(Header::new("Origin", ORIGIN))
        .header(Header::new("Access-Control-Request-Method", "POST"))
        .dispatch();
    assert_eq!(preflight.status(), Status::Ok);
}

#[test]
fn unknown_routes_return_json_errors() {
    let h = harness();
    let response = h.client.get("/nope").dispatch();
    assert_eq!(response.status(), Status::NotFound);
    assert_eq!(json_body(response)["error"]["type"], "not_found_error");
}
