//! HTTP routes over the reporting handlers.
//!
//! Every route turns the query string (and body, where one is accepted) into
//! a `tenantlens::Request`, runs one use case through the shared aggregator
//! and writes the resulting payload back unchanged.
use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use tracing::debug;

use tenantlens::usecases::{
    BookingsDirectory, HashCheck, LicensingReport, RebootPatchStatus, RecoverySummary, TenantCompliance,
    TenantListing, VaultInventory,
};
use tenantlens::{Aggregator, Config, Request, Services, UseCase, WirePayload};

/// One instance of each use case, built once and shared across requests.
struct Handlers {
    tenants: TenantListing,
    licensing: LicensingReport,
    compliance: TenantCompliance,
    reboot: RebootPatchStatus,
    recovery: RecoverySummary,
    vaults: VaultInventory,
    hashes: HashCheck,
    bookings: BookingsDirectory,
}

impl Handlers {
    fn new(services: &Arc<Services>) -> Self {
        Self {
            tenants: TenantListing::new(services.clone()),
            licensing: LicensingReport::new(services.clone()),
            compliance: TenantCompliance::new(services.clone()),
            reboot: RebootPatchStatus::new(services.clone()),
            recovery: RecoverySummary::new(services.clone()),
            vaults: VaultInventory::new(services.clone()),
            hashes: HashCheck::new(services.clone()),
            bookings: BookingsDirectory::new(services.clone()),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    aggregator: Aggregator,
    handlers: Arc<Handlers>,
}

impl AppState {
    pub fn new(config: Config) -> tenantlens::Result<Self> {
        let aggregator = Aggregator::new(&config);
        let services = Arc::new(Services::from_config(config)?);
        Ok(Self {
            aggregator,
            handlers: Arc::new(Handlers::new(&services)),
        })
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/GetTenants", get(get_tenants))
        .route("/api/GetLicensingData", get(get_licensing))
        .route("/api/CheckTenantCompliance", post(check_compliance))
        .route("/api/GetRebootPatchStatus", get(get_reboot_status))
        .route("/api/asr-summary", get(get_asr_summary))
        .route("/api/vaults", get(get_vaults))
        .route("/api/CheckHashes", post(check_hashes))
        .route("/api/BookingsDirectory", get(get_bookings))
        .with_state(state)
}

async fn run<U: UseCase>(aggregator: &Aggregator, use_case: &U, request: Request) -> Response {
    debug!(use_case = use_case.name(), "handling request");
    into_response(aggregator.handle(use_case, &request).await)
}

fn into_response(payload: WirePayload) -> Response {
    let status = StatusCode::from_u16(payload.status.as_u16()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, [(header::CONTENT_TYPE, payload.content_type)], payload.body).into_response()
}

fn query_only(query: HashMap<String, String>) -> Request {
    Request { query, body: None }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn get_tenants(State(state): State<AppState>, Query(query): Query<HashMap<String, String>>) -> Response {
    run(&state.aggregator, &state.handlers.tenants, query_only(query)).await
}

async fn get_licensing(State(state): State<AppState>, Query(query): Query<HashMap<String, String>>) -> Response {
    run(&state.aggregator, &state.handlers.licensing, query_only(query)).await
}

async fn check_compliance(State(state): State<AppState>, Query(query): Query<HashMap<String, String>>) -> Response {
    run(&state.aggregator, &state.handlers.compliance, query_only(query)).await
}

async fn get_reboot_status(State(state): State<AppState>, Query(query): Query<HashMap<String, String>>) -> Response {
    run(&state.aggregator, &state.handlers.reboot, query_only(query)).await
}

async fn get_asr_summary(State(state): State<AppState>, Query(query): Query<HashMap<String, String>>) -> Response {
    run(&state.aggregator, &state.handlers.recovery, query_only(query)).await
}

async fn get_vaults(State(state): State<AppState>, Query(query): Query<HashMap<String, String>>) -> Response {
    run(&state.aggregator, &state.handlers.vaults, query_only(query)).await
}

async fn check_hashes(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    body: String,
) -> Response {
    let request = Request {
        query,
        body: Some(body),
    };
    run(&state.aggregator, &state.handlers.hashes, request).await
}

async fn get_bookings(State(state): State<AppState>, Query(query): Query<HashMap<String, String>>) -> Response {
    run(&state.aggregator, &state.handlers.bookings, query_only(query)).await
}
