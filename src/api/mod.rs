//! HTTP API for quoting, run submission and status

use crate::chain::ChainManager;
use crate::config::ApiConfig;
use crate::coordination::{Coordinator, ExecutionRun, RunReport, SignedPlan};
use crate::error::{ErrorKind, ExecutorError, ExecutorResult};
use crate::instruction::InstructionSet;
use crate::planner::{FeeSpec, Planner, Quote};
use crate::registry::{ChainDescriptor, ChainId, ChainRegistry};
use crate::state::{RunArchive, RunStats, StateManager};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub planner: Arc<Planner>,
    pub coordinator: Arc<Coordinator>,
    pub archive: Arc<dyn RunArchive>,
    pub registry: Arc<ChainRegistry>,
    pub state_manager: Option<Arc<StateManager>>,
    pub chain_manager: Option<Arc<ChainManager>>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/chains", get(get_chains))
        .route("/stats", get(get_stats))
        .route("/quotes", post(create_quote))
        .route("/runs", post(create_run))
        .route("/runs/:id", get(get_run))
        .route("/runs/:id/cancel", post(cancel_run))
        .route("/runs/:id/events", get(run_events))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> ExecutorResult<()> {
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| ExecutorError::Config(format!("cannot bind {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| ExecutorError::Internal(format!("API server: {}", e)))?;

    Ok(())
}

/// Error body returned for every rejected request
pub struct ApiError(ExecutorError);

impl From<ExecutorError> for ApiError {
    fn from(err: ExecutorError) -> Self {
        Self(err)
    }
}

fn status_for(err: &ExecutorError) -> StatusCode {
    match err {
        ExecutorError::RunNotFound { .. } => StatusCode::NOT_FOUND,
        ExecutorError::CancellationRejected { .. }
        | ExecutorError::RunAlreadyStarted { .. }
        | ExecutorError::InvalidStateTransition { .. } => StatusCode::CONFLICT,
        ExecutorError::ChainNotFound { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        ExecutorError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        _ => match err.kind() {
            ErrorKind::Resolution | ErrorKind::Planning => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::Authorization => StatusCode::UNAUTHORIZED,
            _ if err.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        },
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            warn!("Request failed: {}", self.0);
        }
        let body = ErrorResponse {
            error: self.0.to_string(),
            kind: self.0.kind().as_str(),
        };
        (status, Json(body)).into_response()
    }
}

fn parse_run_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| {
        ApiError(ExecutorError::RunNotFound {
            run_id: raw.to_string(),
        })
    })
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - verify database and chain connections
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let database = match &state.state_manager {
        Some(manager) => manager.health_check().await.is_ok(),
        None => true,
    };

    let details = match &state.chain_manager {
        Some(manager) => manager
            .health_check()
            .await
            .into_iter()
            .map(|(chain_id, healthy)| ChainHealth { chain_id, healthy })
            .collect(),
        None => Vec::new(),
    };
    let chains = details.iter().all(|c| c.healthy);

    let ready = database && chains;
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            ready,
            database,
            chains,
            details,
        }),
    )
}

/// Registered chains and whether a provider is connected for each
async fn get_chains(State(state): State<AppState>) -> impl IntoResponse {
    let connected = state
        .chain_manager
        .as_ref()
        .map(|manager| manager.connected_chains());

    let chains = state
        .registry
        .chains()
        .map(|descriptor| ChainView {
            descriptor: descriptor.clone(),
            connected: connected
                .as_ref()
                .map(|ids| ids.contains(&descriptor.chain_id)),
        })
        .collect();

    Json(ChainsResponse { chains })
}

async fn get_stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, ApiError> {
    let archived = match &state.state_manager {
        Some(manager) => Some(manager.get_stats().await?),
        None => None,
    };

    Ok(Json(StatsResponse {
        live_runs: state.coordinator.monitor().live_runs(),
        archived,
    }))
}

/// Resolve, plan and price an instruction set; the plan is archived by hash
async fn create_quote(
    State(state): State<AppState>,
    Json(request): Json<QuoteRequest>,
) -> Result<Json<QuoteResponse>, ApiError> {
    let quote = state.planner.quote(&request.set, &request.fee).await?;

    // Runs are only accepted for archived plans
    state.archive.store_plan(&quote.plan).await?;

    let review = quote.summary.to_string();
    Ok(Json(QuoteResponse { quote, review }))
}

/// Verify a signed plan and start executing it
async fn create_run(
    State(state): State<AppState>,
    Json(signed): Json<SignedPlan>,
) -> Result<(StatusCode, Json<RunCreated>), ApiError> {
    let run_id = state
        .coordinator
        .execute(signed.plan, &signed.signature)
        .await?;

    Ok((StatusCode::ACCEPTED, Json(RunCreated { run_id })))
}

async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ExecutionRun>, ApiError> {
    let run_id = parse_run_id(&id)?;
    Ok(Json(state.coordinator.snapshot(run_id).await?))
}

async fn cancel_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RunReport>, ApiError> {
    let run_id = parse_run_id(&id)?;
    Ok(Json(state.coordinator.cancel(run_id).await?))
}

/// Server-sent transition events; the stream closes after `run_finished`
async fn run_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    let run_id = parse_run_id(&id)?;
    let subscription = state.coordinator.subscribe(run_id).await?;

    let stream = subscription.into_stream().map(|event| {
        Event::default()
            .event(event.name())
            .id(event.sequence.to_string())
            .json_data(&event)
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

// Request and response types

#[derive(Deserialize)]
struct QuoteRequest {
    #[serde(flatten)]
    set: InstructionSet,
    fee: FeeSpec,
}

#[derive(Serialize)]
struct QuoteResponse {
    #[serde(flatten)]
    quote: Quote,
    /// Plain-text rendering of the summary for review before signing
    review: String,
}

#[derive(Serialize, Deserialize)]
struct RunCreated {
    run_id: Uuid,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    kind: &'static str,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    database: bool,
    chains: bool,
    details: Vec<ChainHealth>,
}

#[derive(Serialize)]
struct ChainHealth {
    chain_id: ChainId,
    healthy: bool,
}

#[derive(Serialize)]
struct ChainView {
    #[serde(flatten)]
    descriptor: ChainDescriptor,
    #[serde(skip_serializing_if = "Option::is_none")]
    connected: Option<bool>,
}

#[derive(Serialize)]
struct ChainsResponse {
    chains: Vec<ChainView>,
}

#[derive(Serialize)]
struct StatsResponse {
    live_runs: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    archived: Option<RunStats>,
}
