pub mod api;
pub mod config;
pub mod entities;
pub mod infrastructure;
pub mod services;
pub mod utils;

use crate::config::AppConfig;
use crate::services::card_image_service::CardImageService;
use crate::services::storage::StorageService;
use axum::{
    Router,
    http::HeaderValue,
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
};
use sea_orm::DatabaseConnection;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::services::ServeDir;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::auth::register,
        api::handlers::auth::login,
        api::handlers::card_images::upload_card_image,
        api::handlers::health::health_check,
    ),
    components(
        schemas(
            api::handlers::auth::AuthRequest,
            api::handlers::auth::AuthResponse,
            api::handlers::card_images::UploadCardImageForm,
            api::handlers::card_images::UploadCardImageResponse,
            api::handlers::health::HealthResponse,
        )
    ),
    tags(
        (name = "auth", description = "Account endpoints"),
        (name = "card_images", description = "Card image uploads"),
        (name = "system", description = "Health and diagnostics")
    )
)]
pub struct ApiDoc;

#[derive(Clone)]
pub struct AppState {
    pub db: DatabaseConnection,
    pub storage: Arc<dyn StorageService>,
    pub card_images: Arc<CardImageService>,
    pub config: AppConfig,
}

impl AppState {
    pub fn new(db: DatabaseConnection, storage: Arc<dyn StorageService>, config: AppConfig) -> Self {
        let card_images = Arc::new(CardImageService::new(
            db.clone(),
            storage.clone(),
            config.clone(),
        ));

        Self {
            db,
            storage,
            card_images,
            config,
        }
    }
}

pub fn create_app(state: AppState) -> Router {
    let origins: Vec<HeaderValue> = state
        .config
        .allowed_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();

    let mut router = Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route("/health", get(api::handlers::health::health_check))
        .route("/", get(api::handlers::pages::index))
        .route("/accounts/login/", get(api::handlers::pages::login_page))
        .route("/accounts/login", post(api::handlers::auth::login))
        .route("/accounts/register", post(api::handlers::auth::register))
        .route(
            "/board/",
            get(api::handlers::pages::board).layer(from_fn_with_state(
                state.clone(),
                api::middleware::auth::page_auth_middleware,
            )),
        )
        .route(
            "/board/api/upload_card_image/",
            post(api::handlers::card_images::upload_card_image)
                .layer(axum::extract::DefaultBodyLimit::max(
                    state.config.max_file_size + 1024 * 1024, // multipart overhead
                ))
                .layer(from_fn_with_state(
                    state.clone(),
                    api::middleware::auth::auth_middleware,
                )),
        );

    // Only a local prefix like "/media/" can be mounted
    let media_prefix = state.config.media_url.trim_end_matches('/');
    if state.config.serve_media && media_prefix.starts_with('/') && media_prefix.len() > 1 {
        router = router.nest_service(media_prefix, ServeDir::new(&state.config.media_root));
    }

    router
        .layer(from_fn(api::middleware::request_id::request_id_middleware))
        .layer(
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(origins))
                .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
                .allow_headers([
                    axum::http::header::AUTHORIZATION,
                    axum::http::header::CONTENT_TYPE,
                ])
                .allow_credentials(true),
        )
        .with_state(state)
}
