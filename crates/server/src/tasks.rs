use mllm_shap_core::CoreError;
use rocket::tokio;

use crate::error::ApiError;

/// Run model work on the blocking pool so the async workers stay responsive.
pub async fn run_blocking<T, F>(label: &'static str, job: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, CoreError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(job).await {
        Ok(result) => result.map_err(ApiError::from),
        Err(err) => Err(ApiError::Internal(format!("{label} task failed: {err}"))),
    }
}
