use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use farm_mapper_api::{FarmMapperApi, MappingRunSummary, API_CONTRACT_VERSION};
use farm_mapper_core::EntityId;
use farm_mapper_store_sqlite::{SchemaStatus, StoredMapping};
use farm_mapper_telemetry::HttpTelemetryClient;
use serde::Serialize;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const MISSING_USER_MESSAGE: &str = "no user id specified, please specify one";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

#[derive(Debug, Clone)]
struct ServiceState {
    api: FarmMapperApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    error: String,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct MapSkippedResponse {
    message: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct MapRunResponse {
    success: &'static str,
    run: MappingRunSummary,
}

#[derive(Debug, Parser)]
#[command(name = "farm-mapper-service")]
#[command(about = "Local HTTP service for geofence device-to-farm mapping")]
struct Args {
    #[arg(long, default_value = "./farm_mapper.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    #[arg(long, default_value = "http://127.0.0.1:4521/devices/records")]
    telemetry_endpoint: String,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (StatusCode::INTERNAL_SERVER_ERROR, Json(self)).into_response()
    }
}

impl ServiceState {
    fn error(message: impl Into<String>) -> ServiceError {
        let error = message.into();
        tracing::error!(%error, "mapping request failed");
        ServiceError { service_contract_version: SERVICE_CONTRACT_VERSION, error }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/map", post(map_without_user))
        .route("/v1/map/:user_id", post(map_user))
        .route("/v1/mappings/:user_id", get(mappings_list))
        .route("/v1/mappings/:user_id/:farm_id", get(mapping_show))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let state = ServiceState {
        api: FarmMapperApi::new(args.db, HttpTelemetryClient::new(args.telemetry_endpoint)),
    };

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, "farm mapper service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<SchemaStatus>>, ServiceError> {
    let status = state.api.schema_status().map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(status)))
}

// Mirrors the upstream handler contract: a request with no user id succeeds
// with an explanatory message and performs no work at all.
async fn map_without_user() -> Json<ServiceEnvelope<MapSkippedResponse>> {
    tracing::info!("mapping request without user id, nothing to do");
    Json(envelope(MapSkippedResponse { message: MISSING_USER_MESSAGE }))
}

async fn map_user(
    State(state): State<ServiceState>,
    Path(user_id): Path<String>,
) -> Result<Json<ServiceEnvelope<MapRunResponse>>, ServiceError> {
    let run = state
        .api
        .map_user_farms(&user_id)
        .map_err(|err| ServiceState::error(format!("{err:#}")))?;

    tracing::info!(
        user_id = %run.user_id,
        run_id = %run.run_id,
        farms_mapped = run.farms_mapped,
        telemetry_records = run.telemetry_records,
        "mapping run completed"
    );
    Ok(Json(envelope(MapRunResponse { success: "true", run })))
}

async fn mappings_list(
    State(state): State<ServiceState>,
    Path(user_id): Path<String>,
) -> Result<Json<ServiceEnvelope<Vec<StoredMapping>>>, ServiceError> {
    let mappings = state
        .api
        .list_mappings(&user_id)
        .map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(mappings)))
}

async fn mapping_show(
    State(state): State<ServiceState>,
    Path((user_id, farm_id)): Path<(String, String)>,
) -> Result<Json<ServiceEnvelope<StoredMapping>>, ServiceError> {
    let mapping = state
        .api
        .get_mapping(&user_id, &EntityId::new(farm_id))
        .map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(mapping)))
}
