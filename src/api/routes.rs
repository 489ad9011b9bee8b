//! API router setup with Swagger UI and middleware.

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use super::auth::require_api_key;
use super::handlers::{
    self, bluetooth_status, health, power_off, power_on, start_pairing, ErrorResponse,
    HealthResponse, SuccessResponse,
};
use super::state::ApiState;
use crate::bluetooth::{AdapterStatus, KnownDevice};
use crate::config::ApiConfig;

/// OpenAPI documentation.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "deskctl API",
        version = "1.0.0",
        description = "REST API for controlling desktop hardware through the deskctl daemon",
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    ),
    paths(
        handlers::health,
        handlers::bluetooth_status,
        handlers::power_on,
        handlers::power_off,
        handlers::start_pairing,
    ),
    components(
        schemas(
            HealthResponse,
            SuccessResponse,
            ErrorResponse,
            AdapterStatus,
            KnownDevice,
        )
    ),
    tags(
        (name = "Health", description = "Health check endpoints"),
        (name = "Bluetooth", description = "Bluetooth adapter control"),
    ),
    modifiers(&SecurityAddon)
)]
struct ApiDoc;

/// Add API key security scheme to OpenAPI spec.
struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "api_key",
                utoipa::openapi::security::SecurityScheme::ApiKey(
                    utoipa::openapi::security::ApiKey::Header(
                        utoipa::openapi::security::ApiKeyValue::new("X-API-Key"),
                    ),
                ),
            );
        }
    }
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        // Same-origin only
        CorsLayer::new()
    } else if origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

/// Create the API router with all routes and middleware.
pub fn create_router(state: ApiState, config: &ApiConfig) -> Router {
    let public_routes = Router::new().route("/api/v1/health", get(health));

    let bluetooth_routes = Router::new()
        .route("/api/v1/bluetooth", get(bluetooth_status))
        .route("/api/v1/bluetooth/power/on", post(power_on))
        .route("/api/v1/bluetooth/power/off", post(power_off))
        .route("/api/v1/bluetooth/pairing", post(start_pairing))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    let mut router = Router::new()
        .merge(public_routes)
        .merge(bluetooth_routes)
        .with_state(state);

    if config.swagger_ui {
        router = router
            .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()));
    }

    router
        .layer(cors_layer(&config.cors_origins))
        .layer(TraceLayer::new_for_http())
}
