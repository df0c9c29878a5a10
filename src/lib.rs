pub mod api;
pub mod config;
pub mod infrastructure;
pub mod models;
pub mod services;
pub mod utils;

use crate::config::ServiceConfig;
use crate::services::job_registry::JobRegistry;
use crate::services::separation::SeparationService;
use crate::services::separator::StemSeparator;
use crate::services::storage::StemStorage;
use axum::{
    Router,
    http::HeaderValue,
    middleware::from_fn,
    routing::{get, post},
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::health::root,
        api::handlers::health::health_check,
        api::handlers::separate::separate_audio,
        api::handlers::jobs::list_jobs,
        api::handlers::jobs::get_job,
        api::handlers::jobs::delete_job,
        api::handlers::download::download_stem,
    ),
    components(
        schemas(
            api::handlers::health::HealthResponse,
            api::handlers::health::BannerResponse,
            api::handlers::separate::SeparateResponse,
            api::handlers::separate::SeparateForm,
            api::handlers::jobs::JobResponse,
            api::handlers::jobs::JobListResponse,
            api::handlers::jobs::StemFileResponse,
            api::handlers::jobs::DeleteJobResponse,
            services::gpu::GpuInfo,
            models::Stem,
            models::JobStatus,
        )
    ),
    tags(
        (name = "separation", description = "Upload audio and split it into stems"),
        (name = "jobs", description = "Job status, downloads and deletion"),
        (name = "system", description = "Health and service information")
    )
)]
pub struct ApiDoc;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<JobRegistry>,
    pub separator: Arc<dyn StemSeparator>,
    pub storage: Option<Arc<dyn StemStorage>>,
    pub separation_service: Arc<SeparationService>,
    pub config: ServiceConfig,
}

impl AppState {
    pub fn new(
        config: ServiceConfig,
        separator: Arc<dyn StemSeparator>,
        storage: Option<Arc<dyn StemStorage>>,
    ) -> Self {
        let registry = Arc::new(JobRegistry::new(config.output_dir.clone()));
        let separation_service = Arc::new(SeparationService::new(
            registry.clone(),
            separator.clone(),
            storage.clone(),
            config.clone(),
        ));

        Self {
            registry,
            separator,
            storage,
            separation_service,
            config,
        }
    }
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers(Any);

    if allowed_origins.is_empty() || allowed_origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!("Ignoring invalid CORS origin '{}'", o);
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(origins))
}

/// Limit for `POST /separate`: the file plus 1 MB of multipart framing.
fn separate_body_limit(max_file_size: usize) -> usize {
    max_file_size.saturating_add(1024 * 1024)
}

/// Request id outermost, so the trace span and every inner layer see the id.
fn with_request_layers<S>(router: Router<S>, allowed_origins: &[String]) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router
        .layer(from_fn(api::middleware::metrics::metrics_middleware))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<_>| {
                    let request_id = request
                        .headers()
                        .get(api::middleware::request_id::REQUEST_ID_HEADER)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("unknown");
                    tracing::info_span!(
                        "http_request",
                        method = %request.method(),
                        uri = %request.uri(),
                        request_id = %request_id,
                    )
                })
                .on_request(|request: &axum::http::Request<_>, _span: &tracing::Span| {
                    tracing::info!("📥 {} {}", request.method(), request.uri());
                })
                .on_response(
                    |response: &axum::http::Response<_>, latency: Duration, _span: &tracing::Span| {
                        tracing::info!(
                            "📤 Finished in {:?} with status {}",
                            latency,
                            response.status()
                        );
                    },
                ),
        )
        .layer(from_fn(api::middleware::request_id::request_id_middleware))
        .layer(cors_layer(allowed_origins))
}

pub fn create_app(state: AppState) -> Router {
    let body_limit = separate_body_limit(state.config.max_file_size);

    let routes = Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route("/", get(api::handlers::health::root))
        .route("/health", get(api::handlers::health::health_check))
        .route(
            "/separate",
            post(api::handlers::separate::separate_audio)
                .layer(axum::extract::DefaultBodyLimit::max(body_limit)),
        )
        .route("/jobs", get(api::handlers::jobs::list_jobs))
        .route(
            "/jobs/:job_id",
            get(api::handlers::jobs::get_job).delete(api::handlers::jobs::delete_job),
        )
        .route(
            "/download/:job_id/:stem",
            get(api::handlers::download::download_stem),
        );

    with_request_layers(routes, &state.config.allowed_origins).with_state(state)
}
