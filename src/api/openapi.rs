//! OpenAPI documentation and schema generation
//!
//! This module defines the OpenAPI specification for the mailbox-miner REST
//! API using utoipa for compile-time spec generation.

use utoipa::OpenApi;

/// OpenAPI documentation for the mailbox-miner REST API
///
/// The spec can be accessed via:
/// - `/openapi.json` - JSON format OpenAPI specification
/// - `/swagger-ui` - Interactive Swagger UI documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "mailbox-miner REST API",
        version = "0.1.0",
        description = "Start, follow and cancel mailbox mining tasks feeding the contact extraction pipeline",
        license(
            name = "MIT OR Apache-2.0"
        )
    ),
    servers(
        (url = "http://localhost:8081", description = "Local development server")
    ),
    paths(
        // Mining
        crate::api::routes::create_mining_task,
        crate::api::routes::get_mining_task,
        crate::api::routes::delete_mining_task,
        crate::api::routes::stream_mining_task,

        // System
        crate::api::routes::health_check,
        crate::api::routes::openapi_spec,
    ),
    components(schemas(
        // Core types from types.rs
        crate::types::TaskId,
        crate::types::TaskStatus,
        crate::types::MiningTask,
        crate::types::MailboxIdentity,
        crate::types::MailboxCredentials,
        crate::types::AuthMode,
        crate::types::ProgressCounters,
        crate::types::ProgressType,
        crate::types::ProgressEvent,
        crate::types::TaskTopics,
        crate::types::TaskEvent,
        crate::types::Stage,

        // API request/response types from routes
        crate::api::routes::CreateMiningRequest,
        crate::api::routes::DeletedTask,

        // Error types from error.rs
        crate::error::ApiError,
        crate::error::FieldError,
    )),
    tags(
        (name = "mining", description = "Mining tasks - Start, inspect, stream and cancel mailbox mining"),
        (name = "system", description = "System endpoints - Health checks and OpenAPI spec"),
    ),
    modifiers(&SecurityAddon)
)]
pub struct ApiDoc;

/// Security addon to add API key authentication scheme to OpenAPI spec
struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = &mut openapi.components {
            components.add_security_scheme(
                "api_key",
                utoipa::openapi::security::SecurityScheme::ApiKey(
                    utoipa::openapi::security::ApiKey::Header(
                        utoipa::openapi::security::ApiKeyValue::new("X-Api-Key"),
                    ),
                ),
            );
        }
    }
}
