use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::error;
use uuid::Uuid;

use shared::{
    AlertAction, AlertSeverity, AlertStatus, AlertSummary, AlertType, AuditReport, EngineError,
    PlacementType, SimulationReport,
};

use crate::alerts::{self, AlertFilter};
use crate::ledger::{self, LedgerCounts};
use crate::models::{EpisodeInventory, InventoryAlert, Reservation};
use crate::reconcile;
use crate::reservations::ReservationManager;
use crate::tenant::{DbPool, TenantContext};
use crate::workflow::StageTrigger;

#[derive(Clone)]
pub struct AppState {
    pub pool: DbPool,
    pub lock_retries: u32,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<i32>,
}

pub struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::Validation(_) => StatusCode::BAD_REQUEST,
            EngineError::NotFound { .. } => StatusCode::NOT_FOUND,
            EngineError::Conflict { .. } => StatusCode::CONFLICT,
            EngineError::Busy => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::Expired => StatusCode::GONE,
            EngineError::Forbidden(_) => StatusCode::FORBIDDEN,
            EngineError::InvalidTransition { .. } => StatusCode::CONFLICT,
            EngineError::LedgerCorruption { .. }
            | EngineError::Database(_)
            | EngineError::Pool(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("request failed: {}", self.0);
        }
        let remaining = match &self.0 {
            EngineError::Conflict { remaining } => Some(*remaining),
            _ => None,
        };
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
                remaining,
            }),
        )
            .into_response()
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/reservations",
            post(create_reservation).get(list_reservations),
        )
        .route("/reservations/:id/confirm", post(confirm_reservation))
        .route("/reservations/:id/release", post(release_reservation))
        .route("/reservations/:id/extend", post(extend_reservation))
        .route("/inventory/alerts", get(list_alerts).put(update_alert))
        .route("/inventory/:episode_id", get(get_inventory))
        .route("/admin/audit/inventory", get(audit_inventory))
        .route(
            "/admin/inventory/:episode_id/:placement/repair",
            post(repair_inventory),
        )
        .route("/workflow/simulate", post(simulate_workflow))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

/// Resolves the tenant context from the principal header. An explicit
/// `x-org-id` asks for a cross-tenant handle, which is audited and admin-only.
async fn resolve_ctx(state: &AppState, headers: &HeaderMap) -> Result<TenantContext, ApiError> {
    let user_id = header_uuid(headers, "x-user-id")?
        .ok_or_else(|| ApiError(EngineError::Forbidden("missing x-user-id header".into())))?;

    let ctx = match header_uuid(headers, "x-org-id")? {
        Some(org_id) => {
            TenantContext::resolve_for_org(&state.pool, user_id, org_id, "api request").await?
        }
        None => TenantContext::resolve(&state.pool, user_id).await?,
    };
    Ok(ctx)
}

fn header_uuid(headers: &HeaderMap, name: &str) -> Result<Option<Uuid>, ApiError> {
    match headers.get(name) {
        None => Ok(None),
        Some(value) => {
            let raw = value.to_str().map_err(|_| {
                ApiError(EngineError::Validation(format!("malformed {} header", name)))
            })?;
            Uuid::parse_str(raw).map(Some).map_err(|_| {
                ApiError(EngineError::Validation(format!("malformed {} header", name)))
            })
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateReservationRequest {
    pub campaign_id: Uuid,
    pub episode_id: Uuid,
    pub placement_type: PlacementType,
    pub quantity: i32,
    pub ttl_hours: Option<i64>,
}

pub async fn create_reservation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateReservationRequest>,
) -> Result<(StatusCode, Json<Reservation>), ApiError> {
    let ctx = resolve_ctx(&state, &headers).await?;
    let settings = ctx.workflow_settings().await?;
    let ttl_hours = request
        .ttl_hours
        .unwrap_or(i64::from(settings.reservation_ttl_hours));
    if ttl_hours <= 0 {
        return Err(ApiError(EngineError::Validation(
            "ttl_hours must be positive".into(),
        )));
    }

    let mgr = ReservationManager::new(&ctx).with_lock_retries(state.lock_retries);
    let reservation = mgr
        .hold(
            request.campaign_id,
            request.episode_id,
            request.placement_type,
            None,
            request.quantity,
            Duration::hours(ttl_hours),
        )
        .await?;

    Ok((StatusCode::CREATED, Json(reservation)))
}

#[derive(Debug, Deserialize)]
pub struct ReservationQuery {
    pub campaign_id: Option<Uuid>,
}

pub async fn list_reservations(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ReservationQuery>,
) -> Result<Json<Vec<Reservation>>, ApiError> {
    let ctx = resolve_ctx(&state, &headers).await?;
    let mgr = ReservationManager::new(&ctx);
    Ok(Json(mgr.list(query.campaign_id).await?))
}

pub async fn confirm_reservation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<Reservation>, ApiError> {
    let ctx = resolve_ctx(&state, &headers).await?;
    let mgr = ReservationManager::new(&ctx).with_lock_retries(state.lock_retries);
    Ok(Json(mgr.confirm(id).await?))
}

#[derive(Debug, Deserialize)]
pub struct ReleaseRequest {
    pub reason: Option<String>,
}

pub async fn release_reservation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    body: Option<Json<ReleaseRequest>>,
) -> Result<Json<Reservation>, ApiError> {
    let ctx = resolve_ctx(&state, &headers).await?;
    let reason = body
        .and_then(|Json(r)| r.reason)
        .unwrap_or_else(|| "released by user".to_string());
    let mgr = ReservationManager::new(&ctx).with_lock_retries(state.lock_retries);
    Ok(Json(mgr.release(id, &reason).await?))
}

#[derive(Debug, Deserialize)]
pub struct ExtendRequest {
    pub ttl_hours: i64,
}

pub async fn extend_reservation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(request): Json<ExtendRequest>,
) -> Result<Json<Reservation>, ApiError> {
    let ctx = resolve_ctx(&state, &headers).await?;
    if request.ttl_hours <= 0 {
        return Err(ApiError(EngineError::Validation(
            "ttl_hours must be positive".into(),
        )));
    }
    let mgr = ReservationManager::new(&ctx).with_lock_retries(state.lock_retries);
    Ok(Json(mgr.extend(id, Duration::hours(request.ttl_hours)).await?))
}

pub async fn get_inventory(
    State(state): State<AppState>,
    Path(episode_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<Vec<EpisodeInventory>>, ApiError> {
    let ctx = resolve_ctx(&state, &headers).await?;
    Ok(Json(ledger::counts_for_episode(&ctx, episode_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct AlertQuery {
    pub status: Option<String>,
    pub severity: Option<String>,
    #[serde(rename = "type")]
    pub alert_type: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AlertListResponse {
    pub alerts: Vec<InventoryAlert>,
    pub summary: AlertSummary,
}

pub async fn list_alerts(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<AlertQuery>,
) -> Result<Json<AlertListResponse>, ApiError> {
    let ctx = resolve_ctx(&state, &headers).await?;

    let filter = AlertFilter {
        status: parse_filter(query.status.as_deref(), AlertStatus::parse, "status")?,
        severity: parse_filter(query.severity.as_deref(), AlertSeverity::parse, "severity")?,
        alert_type: parse_filter(query.alert_type.as_deref(), AlertType::parse, "type")?,
    };

    let (alerts, summary) = alerts::list(&ctx, filter).await?;
    Ok(Json(AlertListResponse { alerts, summary }))
}

fn parse_filter<T>(
    raw: Option<&str>,
    parse: fn(&str) -> Option<T>,
    name: &str,
) -> Result<Option<T>, ApiError> {
    match raw {
        None => Ok(None),
        Some("") => Ok(None),
        Some(s) => parse(s).map(Some).ok_or_else(|| {
            ApiError(EngineError::Validation(format!(
                "unknown {} filter '{}'",
                name, s
            )))
        }),
    }
}

#[derive(Debug, Deserialize)]
pub struct AlertActionRequest {
    pub alert_id: Uuid,
    pub action: AlertAction,
    pub resolution: Option<String>,
}

pub async fn update_alert(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<AlertActionRequest>,
) -> Result<Json<InventoryAlert>, ApiError> {
    let ctx = resolve_ctx(&state, &headers).await?;
    let actor = ctx.user_id();
    let alert = match request.action {
        AlertAction::Acknowledge => alerts::acknowledge(&ctx, request.alert_id, actor).await?,
        AlertAction::Resolve => {
            alerts::resolve(&ctx, request.alert_id, actor, request.resolution).await?
        }
    };
    Ok(Json(alert))
}

pub async fn audit_inventory(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<AuditReport>, ApiError> {
    let ctx = resolve_ctx(&state, &headers).await?;
    ctx.require_admin()?;
    Ok(Json(reconcile::run_audit(&ctx, false).await?))
}

pub async fn repair_inventory(
    State(state): State<AppState>,
    Path((episode_id, placement)): Path<(Uuid, String)>,
    headers: HeaderMap,
) -> Result<Json<LedgerCounts>, ApiError> {
    let ctx = resolve_ctx(&state, &headers).await?;
    ctx.require_admin()?;
    let placement = PlacementType::parse(&placement).ok_or_else(|| {
        ApiError(EngineError::Validation(format!(
            "unknown placement type '{}'",
            placement
        )))
    })?;
    Ok(Json(ledger::repair(&ctx, episode_id, placement).await?))
}

fn default_dry_run() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct SimulateRequest {
    pub campaign_id: Uuid,
    pub target_stage: i32,
    #[serde(default = "default_dry_run")]
    pub dry_run: bool,
}

pub async fn simulate_workflow(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SimulateRequest>,
) -> Result<Json<SimulationReport>, ApiError> {
    let ctx = resolve_ctx(&state, &headers).await?;
    let trigger = StageTrigger::new(&ctx).with_lock_retries(state.lock_retries);
    Ok(Json(
        trigger
            .simulate(request.campaign_id, request.target_stage, request.dry_run)
            .await?,
    ))
}

pub async fn health_check() -> &'static str {
    "OK"
}
