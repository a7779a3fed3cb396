use std::sync::Arc;

use anyhow::Result;
use mllm_shap_config::{AppConfig, LocalFileSystem, VirtualPath};
use mllm_shap_core::{HubModelLoader, ModelContext};
use rocket::{Build, Config, Rocket, data::ToByteUnit, figment::Figment, tokio};
use tracing::{info, warn};

use crate::{args::Args, cors::Cors, error, routes, sessions::FileSessionStore, state::AppState};

pub const APP_NAME: &str = "mllm-shap";

pub fn build_rocket(figment: Figment, state: AppState, cors_origins: Vec<String>) -> Rocket<Build> {
    rocket::custom(figment)
        .attach(Cors::new(cors_origins))
        .manage(state)
        .mount("/", routes::api_routes())
        .mount("/sessions", routes::session_routes())
        .register("/", catchers![error::default_catcher])
}

pub async fn run(args: Args) -> Result<()> {
    let fs = Arc::new(LocalFileSystem::new(APP_NAME));
    let (mut app_config, descriptor) = AppConfig::load_or_init(fs.as_ref(), args.config.as_deref())?;
    app_config += &args;
    app_config.normalise(fs.as_ref())?;
    info!(
        "Using configuration {} (default mode `{}`)",
        descriptor.location.display_with(fs.as_ref())?,
        app_config.models.mode
    );

    let cache_dir = fs.physical_path(&VirtualPath::model_cache_dir());
    let loader = HubModelLoader::new(cache_dir);
    let context = Arc::new(ModelContext::new(
        Arc::new(loader),
        app_config.inference.clone(),
        app_config.explain.clone(),
    ));

    if args.preload {
        let request = app_config.default_load_request()?;
        let preload_context = Arc::clone(&context);
        let info = tokio::task::spawn_blocking(move || preload_context.load(&request)).await??;
        info!(model_id = %info.model_id, "Preloaded model");
    } else if let Some(model_id) = app_config.models.model_id.as_deref() {
        info!(model_id, "No model loaded; POST /models/load to load one");
    }

    let sessions = Arc::new(FileSessionStore::new(Arc::clone(&fs))?);
    let state = AppState::new(context, sessions, app_config.models.clone());

    if app_config.server.cors_origins.is_empty() {
        warn!("No CORS origins configured; browser clients will be rejected");
    }

    let figment = Config::figment()
        .merge(("port", app_config.server.port))
        .merge(("address", app_config.server.host.clone()))
        .merge((
            "limits",
            rocket::data::Limits::default()
                .limit("json", 10.megabytes())
                .limit("file", 100.megabytes())
                .limit("data-form", 100.megabytes()),
        ));

    info!(
        "Server ready on {}:{}",
        app_config.server.host, app_config.server.port,
    );

    build_rocket(figment, state, app_config.server.cors_origins.clone())
        .launch()
        .await
        .map_err(|err| anyhow::anyhow!("rocket failed: {err}"))?;

    Ok(())
}
