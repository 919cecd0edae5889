#![forbid(unsafe_code)]

use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use recount_adapter::{
    AdapterConfig, AdapterError, AdapterRuntime, FinalizeAdapterRequest,
    ReleasePhaseAdapterRequest, SlotListParams, SlotLookupParams, SubmitCountAdapterRequest,
};
use serde::Serialize;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

type SharedRuntime = Arc<AdapterRuntime>;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = AdapterConfig::from_env()?;
    init_tracing(config.log_json);
    let addr: SocketAddr = config.http_bind.parse()?;

    let runtime: SharedRuntime = Arc::new(AdapterRuntime::new(&config)?);
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/counts", post(submit_count))
        .route("/v1/slots/lookup", get(lookup_slot))
        .route("/v1/slots/:record_id", get(get_slot))
        .route("/v1/slots/:record_id/events", get(slot_events))
        .route("/v1/slots/:record_id/release", post(release_phase))
        .route("/v1/slots/:record_id/finalize", post(finalize))
        .route("/v1/inventories/:inventory_id/slots", get(list_slots))
        .with_state(runtime);

    info!(
        %addr,
        gate_policy = config.reconcile.gate_policy.as_str(),
        persistent = config.store_path.is_some(),
        supervisors = config.supervisor_ids.len(),
        "recount_adapter_http listening"
    );
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

fn init_tracing(log_json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {err}");
    }
}

/// Runs a runtime call off the async workers; storage retries may sleep.
async fn run_blocking<T, F>(runtime: SharedRuntime, f: F) -> Response
where
    T: Serialize + Send + 'static,
    F: FnOnce(&AdapterRuntime) -> Result<T, AdapterError> + Send + 'static,
{
    match tokio::task::spawn_blocking(move || f(&runtime)).await {
        Ok(Ok(body)) => (StatusCode::OK, Json(body)).into_response(),
        Ok(Err(err)) => error_response(err),
        Err(join_err) => error_response(AdapterError::internal(format!(
            "request worker failed: {join_err}"
        ))),
    }
}

fn error_response(err: AdapterError) -> Response {
    let status = StatusCode::from_u16(err.http_status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        error!(kind = %err.body.kind, "request failed: {}", err.body.reason);
    }
    (status, Json(err.body)).into_response()
}

async fn healthz(State(runtime): State<SharedRuntime>) -> Response {
    (StatusCode::OK, Json(runtime.health_report())).into_response()
}

async fn submit_count(
    State(runtime): State<SharedRuntime>,
    Json(request): Json<SubmitCountAdapterRequest>,
) -> Response {
    run_blocking(runtime, move |rt| rt.submit_count(request)).await
}

async fn release_phase(
    State(runtime): State<SharedRuntime>,
    Path(record_id): Path<u64>,
    Json(request): Json<ReleasePhaseAdapterRequest>,
) -> Response {
    run_blocking(runtime, move |rt| rt.release_phase(record_id, request)).await
}

async fn finalize(
    State(runtime): State<SharedRuntime>,
    Path(record_id): Path<u64>,
    Json(request): Json<FinalizeAdapterRequest>,
) -> Response {
    run_blocking(runtime, move |rt| rt.finalize(record_id, request)).await
}

async fn get_slot(State(runtime): State<SharedRuntime>, Path(record_id): Path<u64>) -> Response {
    run_blocking(runtime, move |rt| rt.get_slot(record_id)).await
}

async fn slot_events(
    State(runtime): State<SharedRuntime>,
    Path(record_id): Path<u64>,
) -> Response {
    run_blocking(runtime, move |rt| rt.slot_events(record_id)).await
}

async fn lookup_slot(
    State(runtime): State<SharedRuntime>,
    Query(params): Query<SlotLookupParams>,
) -> Response {
    run_blocking(runtime, move |rt| rt.lookup(&params)).await
}

async fn list_slots(
    State(runtime): State<SharedRuntime>,
    Path(inventory_id): Path<String>,
    Query(params): Query<SlotListParams>,
) -> Response {
    run_blocking(runtime, move |rt| rt.list_slots(&inventory_id, params)).await
}
