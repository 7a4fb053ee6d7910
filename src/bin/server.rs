//! Sitekeeper Server: HTTP API over the facilities managers.
//!
//! Thin axum server wrapping sitekeeper_lib. List endpoints take the same
//! optional criteria the managers do (`site`, `user`, `from`, `to`,
//! `descending`) as query parameters.
//!
//! Usage:
//!   SITEKEEPER_BACKEND=sqlite SITEKEEPER_DB=/path/to/sites.db sitekeeper-server
//!
//! Or with args:
//!   sitekeeper-server --backend sqlite --db /path/to/sites.db --bind 0.0.0.0:3750

use axum::{
    extract::{Path, Query, State},
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE},
        Method, StatusCode,
    },
    response::{IntoResponse, Json, Response},
    routing::{get, patch, post},
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sitekeeper_lib::db::{
    Building, DateRange, Computer, HourlyCleaning, Issue, IssueType, Printer, PrinterStatus, Site, SiteReady,
    SupplyCount, SupplyRequest, SupplyType, User,
};
use sitekeeper_lib::logging::init_logging;
use sitekeeper_lib::managers::{
    IssueQuery, Managers, NewCleaning, NewIssue, NewSiteReady, NewSupplyRequest, Scope,
    SupplyCountScope,
};
use sitekeeper_lib::search::{IssueSearch, IssueSort};
use sitekeeper_lib::settings::{Backend, Settings};
use sitekeeper_lib::utils::parse_range;
use sitekeeper_lib::{open_store, StoreError};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tower_http::cors::{Any, CorsLayer};

// ============================================================================
// AppState
// ============================================================================

#[derive(Clone)]
struct AppState {
    managers: Managers,
    start_time: Instant,
}

// ============================================================================
// Error type
// ============================================================================

#[derive(Debug)]
struct AppError(StatusCode, String);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.0, Json(serde_json::json!({"error": self.1}))).into_response()
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        let status = status_for(&e);
        if status.is_server_error() || status == StatusCode::CONFLICT {
            tracing::warn!(error = %e, status = status.as_u16(), "request failed");
        }
        AppError(status, e.to_string())
    }
}

fn status_for(e: &StoreError) -> StatusCode {
    match e {
        StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
        StoreError::InvalidQuery(_) | StoreError::InvalidInput(_) | StoreError::InvalidRange { .. } => {
            StatusCode::BAD_REQUEST
        }
        StoreError::MissingIndex { .. } => StatusCode::CONFLICT,
        StoreError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn not_found(msg: impl Into<String>) -> AppError {
    AppError(StatusCode::NOT_FOUND, msg.into())
}

fn bad_request(msg: impl Into<String>) -> AppError {
    AppError(StatusCode::BAD_REQUEST, msg.into())
}

type ApiResult<T> = Result<Json<T>, AppError>;

// ============================================================================
// Request / Response types
// ============================================================================

/// Criteria shared by the log-style list endpoints.
#[derive(Debug, Default, Deserialize)]
struct ListParams {
    site: Option<String>,
    user: Option<String>,
    from: Option<String>,
    to: Option<String>,
    descending: Option<bool>,
}

impl ListParams {
    fn range(&self) -> Result<Option<DateRange>, AppError> {
        Ok(parse_range(self.from.as_deref(), self.to.as_deref(), Utc::now())?)
    }

    fn scope(&self) -> Scope {
        Scope::from_options(self.site.clone(), self.user.clone())
    }
}

#[derive(Debug, Default, Deserialize)]
struct IssueParams {
    site: Option<String>,
    from: Option<String>,
    to: Option<String>,
    descending: Option<bool>,
    /// Free text; any of q/type/resolved/submitted_by/sort switches to search
    q: Option<String>,
    #[serde(rename = "type")]
    issue_type: Option<String>,
    resolved: Option<bool>,
    submitted_by: Option<String>,
    sort: Option<String>,
}

impl IssueParams {
    fn wants_search(&self) -> bool {
        self.q.is_some()
            || self.issue_type.is_some()
            || self.resolved.is_some()
            || self.submitted_by.is_some()
            || self.sort.is_some()
    }
}

#[derive(Debug, Default, Deserialize)]
struct SiteFilter {
    site: Option<String>,
    building: Option<String>,
    #[serde(default)]
    not_working: bool,
}

#[derive(Debug, Default, Deserialize)]
struct CountParams {
    site: Option<String>,
    supply_type: Option<String>,
    #[serde(default)]
    low: bool,
}

#[derive(Debug, Default, Deserialize)]
struct RequestParams {
    site: Option<String>,
    from: Option<String>,
    to: Option<String>,
    descending: Option<bool>,
    #[serde(default)]
    pending: bool,
}

#[derive(Deserialize)]
struct CreateBuildingRequest {
    name: String,
    #[serde(default)]
    abbreviation: String,
}

#[derive(Deserialize)]
struct CreateSupplyTypeRequest {
    name: String,
    #[serde(default)]
    collective: bool,
}

#[derive(Deserialize)]
struct PrinterStatusRequest {
    status: PrinterStatus,
}

#[derive(Deserialize)]
struct SetCountRequest {
    count: i64,
}

#[derive(Deserialize)]
struct TicketRequest {
    ticket: Option<String>,
}

#[derive(Deserialize)]
struct LatestParams {
    from: Option<String>,
    to: Option<String>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    backend: String,
    uptime_secs: u64,
}

#[derive(Serialize)]
struct MarkedResponse {
    updated: usize,
}

// ============================================================================
// Handlers
// ============================================================================

// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        backend: state.managers.store().backend_name().to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

// GET /buildings
async fn list_buildings_handler(State(state): State<AppState>) -> ApiResult<Vec<Building>> {
    Ok(Json(state.managers.buildings.all().await?))
}

// POST /buildings
async fn create_building_handler(
    State(state): State<AppState>,
    Json(req): Json<CreateBuildingRequest>,
) -> Result<(StatusCode, Json<Building>), AppError> {
    if req.name.trim().is_empty() {
        return Err(bad_request("building name is required"));
    }
    let building = state.managers.buildings.create(&req.name, &req.abbreviation).await?;
    Ok((StatusCode::CREATED, Json(building)))
}

// GET /sites?building=
async fn list_sites_handler(
    State(state): State<AppState>,
    Query(filter): Query<SiteFilter>,
) -> ApiResult<Vec<Site>> {
    Ok(Json(state.managers.sites.list(filter.building.as_deref()).await?))
}

// POST /sites
async fn create_site_handler(
    State(state): State<AppState>,
    Json(site): Json<Site>,
) -> Result<(StatusCode, Json<Site>), AppError> {
    let created = state.managers.sites.create(&site).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

// GET /sites/{id}
async fn get_site_handler(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Site> {
    state
        .managers
        .sites
        .get(&id)
        .await?
        .map(Json)
        .ok_or_else(|| not_found(format!("site '{}' not found", id)))
}

// PUT /sites/{id}
async fn update_site_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(mut site): Json<Site>,
) -> ApiResult<Site> {
    site.id = id;
    state.managers.sites.update(&site).await?;
    Ok(Json(site))
}

// DELETE /sites/{id}
async fn delete_site_handler(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, AppError> {
    state.managers.sites.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// GET /computers?site=
async fn list_computers_handler(
    State(state): State<AppState>,
    Query(filter): Query<SiteFilter>,
) -> ApiResult<Vec<Computer>> {
    Ok(Json(state.managers.computers.list(filter.site.as_deref()).await?))
}

// POST /computers
async fn create_computer_handler(
    State(state): State<AppState>,
    Json(computer): Json<Computer>,
) -> Result<(StatusCode, Json<Computer>), AppError> {
    Ok((StatusCode::CREATED, Json(state.managers.computers.create(&computer).await?)))
}

// POST /computers/{id}/cleaned
async fn computer_cleaned_handler(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, AppError> {
    state.managers.computers.mark_cleaned(&id, Utc::now()).await?;
    Ok(StatusCode::NO_CONTENT)
}

// DELETE /computers/{id}
async fn delete_computer_handler(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, AppError> {
    state.managers.computers.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// GET /printers?site=&not_working=
async fn list_printers_handler(
    State(state): State<AppState>,
    Query(filter): Query<SiteFilter>,
) -> ApiResult<Vec<Printer>> {
    let site = filter.site.as_deref();
    let printers = if filter.not_working {
        state.managers.printers.not_working(site).await?
    } else {
        state.managers.printers.list(site).await?
    };
    Ok(Json(printers))
}

// POST /printers
async fn create_printer_handler(
    State(state): State<AppState>,
    Json(printer): Json<Printer>,
) -> Result<(StatusCode, Json<Printer>), AppError> {
    Ok((StatusCode::CREATED, Json(state.managers.printers.create(&printer).await?)))
}

// PATCH /printers/{id}/status
async fn printer_status_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<PrinterStatusRequest>,
) -> Result<StatusCode, AppError> {
    state.managers.printers.set_status(&id, req.status, Utc::now()).await?;
    Ok(StatusCode::NO_CONTENT)
}

// GET /issues
async fn list_issues_handler(
    State(state): State<AppState>,
    Query(params): Query<IssueParams>,
) -> ApiResult<Vec<Issue>> {
    let range = parse_range(params.from.as_deref(), params.to.as_deref(), Utc::now())?;
    let query = IssueQuery {
        site_id: params.site.clone(),
        range,
        descending: params.descending,
    };
    let issues = state.managers.issues.list(&query).await?;
    if !params.wants_search() {
        return Ok(Json(issues));
    }

    let issue_type = match params.issue_type.as_deref() {
        Some(t) => Some(IssueType::from_str(t).ok_or_else(|| bad_request(format!("unknown issue type '{}'", t)))?),
        None => None,
    };
    let sort = match params.sort.as_deref() {
        Some(s) => IssueSort::from_str(s).ok_or_else(|| bad_request(format!("unknown sort '{}'", s)))?,
        None if params.descending == Some(false) => IssueSort::OldestFirst,
        None => IssueSort::NewestFirst,
    };
    let search = IssueSearch {
        text: params.q,
        issue_type,
        resolved: params.resolved,
        submitted_by: params.submitted_by,
        sort,
        ..Default::default()
    };
    let names = site_names(&state.managers).await?;
    Ok(Json(search.apply(&issues, &names)))
}

// POST /issues
async fn create_issue_handler(
    State(state): State<AppState>,
    Json(req): Json<NewIssue>,
) -> Result<(StatusCode, Json<Issue>), AppError> {
    let issue = state.managers.issues.create(req, Utc::now()).await?;
    Ok((StatusCode::CREATED, Json(issue)))
}

// GET /issues/{id}
async fn get_issue_handler(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Issue> {
    state
        .managers
        .issues
        .get(&id)
        .await?
        .map(Json)
        .ok_or_else(|| not_found(format!("issue '{}' not found", id)))
}

// POST /issues/{id}/resolve
async fn resolve_issue_handler(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, AppError> {
    state.managers.issues.resolve(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// POST /issues/{id}/reopen
async fn reopen_issue_handler(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, AppError> {
    state.managers.issues.reopen(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// PATCH /issues/{id}/ticket
async fn issue_ticket_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<TicketRequest>,
) -> Result<StatusCode, AppError> {
    let ticket = req.ticket.as_deref().map(str::trim).filter(|t| !t.is_empty());
    state.managers.issues.set_ticket(&id, ticket).await?;
    Ok(StatusCode::NO_CONTENT)
}

// GET /cleanings?site=&user=&from=&to=&descending=
async fn list_cleanings_handler(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> ApiResult<Vec<HourlyCleaning>> {
    let range = params.range()?;
    Ok(Json(state.managers.cleaning.list(&params.scope(), range, params.descending).await?))
}

// POST /cleanings
async fn log_cleaning_handler(
    State(state): State<AppState>,
    Json(req): Json<NewCleaning>,
) -> Result<(StatusCode, Json<HourlyCleaning>), AppError> {
    let cleaning = state.managers.log_cleaning(req, Utc::now()).await?;
    Ok((StatusCode::CREATED, Json(cleaning)))
}

// GET /cleanings/latest?from=&to=
async fn latest_cleanings_handler(
    State(state): State<AppState>,
    Query(params): Query<LatestParams>,
) -> ApiResult<BTreeMap<String, HourlyCleaning>> {
    let now = Utc::now();
    let range = match parse_range(params.from.as_deref(), params.to.as_deref(), now)? {
        Some(range) => range,
        None => DateRange::last_hours(1, now)?,
    };
    Ok(Json(state.managers.cleaning.latest_by_site(range).await?))
}

// GET /site-ready
async fn list_site_ready_handler(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> ApiResult<Vec<SiteReady>> {
    let range = params.range()?;
    Ok(Json(state.managers.site_ready.list(&params.scope(), range, params.descending).await?))
}

// POST /site-ready
async fn submit_site_ready_handler(
    State(state): State<AppState>,
    Json(survey): Json<NewSiteReady>,
) -> Result<(StatusCode, Json<SiteReady>), AppError> {
    let created = state.managers.site_ready.submit(survey, Utc::now()).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

// GET /supplies/types
async fn list_supply_types_handler(State(state): State<AppState>) -> ApiResult<Vec<SupplyType>> {
    Ok(Json(state.managers.supply_types.all().await?))
}

// POST /supplies/types
async fn create_supply_type_handler(
    State(state): State<AppState>,
    Json(req): Json<CreateSupplyTypeRequest>,
) -> Result<(StatusCode, Json<SupplyType>), AppError> {
    if req.name.trim().is_empty() {
        return Err(bad_request("supply type name is required"));
    }
    let created = state.managers.supply_types.create(&req.name, req.collective).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

// GET /supplies/counts?site=&supply_type=&low=
async fn list_counts_handler(
    State(state): State<AppState>,
    Query(params): Query<CountParams>,
) -> ApiResult<Vec<SupplyCount>> {
    if params.low {
        return Ok(Json(state.managers.supply_counts.low_stock(params.site.as_deref()).await?));
    }
    let scope = match (params.site, params.supply_type) {
        (Some(site), _) => SupplyCountScope::Site(site),
        (None, Some(supply)) => SupplyCountScope::SupplyType(supply),
        (None, None) => SupplyCountScope::All,
    };
    Ok(Json(state.managers.supply_counts.list(&scope).await?))
}

// POST /supplies/counts
async fn create_count_handler(
    State(state): State<AppState>,
    Json(count): Json<SupplyCount>,
) -> Result<(StatusCode, Json<SupplyCount>), AppError> {
    Ok((StatusCode::CREATED, Json(state.managers.supply_counts.create(&count).await?)))
}

// PATCH /supplies/counts/{id}
async fn set_count_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<SetCountRequest>,
) -> Result<StatusCode, AppError> {
    state.managers.supply_counts.set_count(&id, req.count).await?;
    Ok(StatusCode::NO_CONTENT)
}

// GET /supplies/requests?site=&from=&to=&descending=&pending=
async fn list_requests_handler(
    State(state): State<AppState>,
    Query(params): Query<RequestParams>,
) -> ApiResult<Vec<SupplyRequest>> {
    let site = params.site.as_deref();
    if params.pending {
        return Ok(Json(state.managers.supply_requests.pending(site).await?));
    }
    let range = parse_range(params.from.as_deref(), params.to.as_deref(), Utc::now())?;
    Ok(Json(state.managers.supply_requests.list(site, range, params.descending).await?))
}

// POST /supplies/requests
async fn create_request_handler(
    State(state): State<AppState>,
    Json(req): Json<NewSupplyRequest>,
) -> Result<(StatusCode, Json<SupplyRequest>), AppError> {
    let created = state.managers.supply_requests.create(req, Utc::now()).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

// POST /supplies/requests/{id}/fulfil
async fn fulfil_request_handler(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, AppError> {
    state.managers.supply_requests.fulfil(&id, Utc::now()).await?;
    Ok(StatusCode::NO_CONTENT)
}

// POST /computers/cleaned
async fn computers_cleaned_handler(
    State(state): State<AppState>,
    Json(ids): Json<Vec<String>>,
) -> ApiResult<MarkedResponse> {
    let updated = state.managers.computers.mark_all_cleaned(&ids, Utc::now()).await?;
    Ok(Json(MarkedResponse { updated }))
}

// GET /users
async fn list_users_handler(State(state): State<AppState>) -> ApiResult<Vec<User>> {
    Ok(Json(state.managers.users.all().await?))
}

// ============================================================================
// Helpers
// ============================================================================

async fn site_names(managers: &Managers) -> Result<HashMap<String, String>, AppError> {
    Ok(managers
        .sites
        .list(None)
        .await?
        .into_iter()
        .map(|s| (s.id, s.name))
        .collect())
}

fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::PATCH, Method::DELETE, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE, AUTHORIZATION])
        .max_age(Duration::from_secs(60 * 60));

    Router::new()
        .route("/health", get(health_handler))
        .route("/buildings", get(list_buildings_handler).post(create_building_handler))
        .route("/sites", get(list_sites_handler).post(create_site_handler))
        .route("/sites/{id}", get(get_site_handler).put(update_site_handler).delete(delete_site_handler))
        .route("/computers", get(list_computers_handler).post(create_computer_handler))
        .route("/computers/cleaned", post(computers_cleaned_handler))
        .route("/computers/{id}", axum::routing::delete(delete_computer_handler))
        .route("/computers/{id}/cleaned", post(computer_cleaned_handler))
        .route("/printers", get(list_printers_handler).post(create_printer_handler))
        .route("/printers/{id}/status", patch(printer_status_handler))
        .route("/issues", get(list_issues_handler).post(create_issue_handler))
        .route("/issues/{id}", get(get_issue_handler))
        .route("/issues/{id}/resolve", post(resolve_issue_handler))
        .route("/issues/{id}/reopen", post(reopen_issue_handler))
        .route("/issues/{id}/ticket", patch(issue_ticket_handler))
        .route("/cleanings", get(list_cleanings_handler).post(log_cleaning_handler))
        .route("/cleanings/latest", get(latest_cleanings_handler))
        .route("/site-ready", get(list_site_ready_handler).post(submit_site_ready_handler))
        .route("/supplies/types", get(list_supply_types_handler).post(create_supply_type_handler))
        .route("/supplies/counts", get(list_counts_handler).post(create_count_handler))
        .route("/supplies/counts/{id}", patch(set_count_handler))
        .route("/supplies/requests", get(list_requests_handler).post(create_request_handler))
        .route("/supplies/requests/{id}/fulfil", post(fulfil_request_handler))
        .route("/users", get(list_users_handler))
        .layer(cors)
        .with_state(state)
}

// ============================================================================
// Main
// ============================================================================

fn print_usage() {
    println!("sitekeeper-server: facilities HTTP API");
    println!();
    println!("Usage: sitekeeper-server [--backend memory|sqlite|firestore] [--db PATH] [--bind ADDR:PORT] [--settings PATH]");
    println!();
    println!("Environment variables:");
    println!("  SITEKEEPER_BACKEND     Document store backend (default: sqlite)");
    println!("  SITEKEEPER_DB          SQLite database path");
    println!("  SITEKEEPER_BIND        Bind address (default: 127.0.0.1:3750)");
    println!("  FIRESTORE_PROJECT_ID   Firestore project");
    println!("  FIRESTORE_TIMESTAMPS   millis or timestamp (native Firestore timestamps)");
    println!("  FIREBASE_API_KEY       Web API key");
    println!("  RUST_LOG               Log filter (default: info)");
}

#[tokio::main]
async fn main() {
    // Parse simple args (no clap to keep binary small)
    let args: Vec<String> = std::env::args().collect();
    let mut backend_arg: Option<&str> = None;
    let mut db_arg: Option<&str> = None;
    let mut bind_arg: Option<&str> = None;
    let mut settings_arg: Option<&str> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--backend" if i + 1 < args.len() => {
                backend_arg = Some(&args[i + 1]);
                i += 2;
            }
            "--db" if i + 1 < args.len() => {
                db_arg = Some(&args[i + 1]);
                i += 2;
            }
            "--bind" if i + 1 < args.len() => {
                bind_arg = Some(&args[i + 1]);
                i += 2;
            }
            "--settings" if i + 1 < args.len() => {
                settings_arg = Some(&args[i + 1]);
                i += 2;
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            _ => { i += 1; }
        }
    }

    let settings_path = settings_arg
        .map(PathBuf::from)
        .unwrap_or_else(Settings::default_path);
    let mut settings = match Settings::load_with_env(&settings_path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("[Server] Invalid settings: {}", e);
            std::process::exit(2);
        }
    };
    if let Some(backend) = backend_arg {
        match Backend::from_str(backend) {
            Ok(b) => settings.backend = b,
            Err(e) => {
                eprintln!("[Server] {}", e);
                std::process::exit(2);
            }
        }
    }
    if let Some(db) = db_arg {
        settings.db_path = Some(db.to_string());
    }
    if let Some(bind) = bind_arg {
        settings.bind = bind.to_string();
    }

    init_logging(settings.log_format, "info,sitekeeper_lib=info");

    if let Err(e) = settings.validate() {
        tracing::error!(error = %e, "invalid settings");
        std::process::exit(2);
    }

    let store = match open_store(&settings) {
        Ok(store) => store,
        Err(e) => {
            tracing::error!(error = %e, "failed to open document store");
            std::process::exit(1);
        }
    };

    let state = AppState {
        managers: Managers::new(store),
        start_time: Instant::now(),
    };
    let app = router(state);

    let listener = match tokio::net::TcpListener::bind(&settings.bind).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(bind = %settings.bind, error = %e, "failed to bind");
            std::process::exit(1);
        }
    };

    tracing::info!(bind = %settings.bind, backend = settings.backend.as_str(), "listening");
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "server error");
        std::process::exit(1);
    }
}
