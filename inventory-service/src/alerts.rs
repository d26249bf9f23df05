//! Durable inventory alerts with a one-directional lifecycle. Findings are
//! deduplicated per (type, dedupe key) while active; notification fan-out is
//! best-effort and never blocks the alert write.

use chrono::Utc;
use diesel::prelude::*;
use diesel_async::{AsyncConnection, RunQueryDsl};
use tracing::{info, warn};
use uuid::Uuid;

use shared::{
    AlertAction, AlertSeverity, AlertStatus, AlertSummary, AlertType, EngineError, EngineResult,
    PlacementType,
};

use crate::models::{InventoryAlert, NewInventoryAlert};
use crate::notify;
use crate::schema::inventory_alerts;
use crate::tenant::TenantContext;

#[derive(Debug, Clone, Copy, Default)]
pub struct AlertFilter {
    pub status: Option<AlertStatus>,
    pub severity: Option<AlertSeverity>,
    pub alert_type: Option<AlertType>,
}

pub async fn create(
    ctx: &TenantContext,
    alert_type: AlertType,
    severity: AlertSeverity,
    episode_id: Option<Uuid>,
    placement: Option<PlacementType>,
    dedupe_key: &str,
    details: serde_json::Value,
) -> EngineResult<InventoryAlert> {
    let mut conn = ctx.conn().await?;
    let alert = diesel::insert_into(inventory_alerts::table)
        .values(&NewInventoryAlert {
            id: Uuid::new_v4(),
            org_id: ctx.org_id(),
            alert_type: alert_type.as_str().to_string(),
            severity: severity.as_str().to_string(),
            episode_id,
            placement_type: placement.map(|p| p.as_str().to_string()),
            dedupe_key: dedupe_key.to_string(),
            details,
            status: AlertStatus::Active.as_str().to_string(),
        })
        .get_result::<InventoryAlert>(&mut conn)
        .await?;

    info!(
        "alert {} created: {} ({})",
        alert.id, alert.alert_type, alert.severity
    );

    if let Err(err) = notify::fan_out_alert(ctx, &alert).await {
        warn!("alert {} notification fan-out failed: {}", alert.id, err);
    }

    Ok(alert)
}

/// Creates the alert, or refreshes the details of the active alert already
/// filed for the same finding. Used by the reconciliation job and by
/// degraded capacity checks, so repeated sweeps do not stack duplicates.
pub async fn file_finding(
    ctx: &TenantContext,
    alert_type: AlertType,
    severity: AlertSeverity,
    episode_id: Option<Uuid>,
    placement: Option<PlacementType>,
    dedupe_key: &str,
    details: serde_json::Value,
) -> EngineResult<InventoryAlert> {
    let mut conn = ctx.conn().await?;
    let existing = inventory_alerts::table
        .filter(inventory_alerts::org_id.eq(ctx.org_id()))
        .filter(inventory_alerts::alert_type.eq(alert_type.as_str()))
        .filter(inventory_alerts::dedupe_key.eq(dedupe_key))
        .filter(inventory_alerts::status.eq(AlertStatus::Active.as_str()))
        .first::<InventoryAlert>(&mut conn)
        .await
        .optional()?;

    if let Some(existing) = existing {
        let refreshed = diesel::update(
            inventory_alerts::table.filter(inventory_alerts::id.eq(existing.id)),
        )
        .set(inventory_alerts::details.eq(details))
        .get_result::<InventoryAlert>(&mut conn)
        .await?;
        return Ok(refreshed);
    }
    drop(conn);

    create(
        ctx, alert_type, severity, episode_id, placement, dedupe_key, details,
    )
    .await
}

pub async fn acknowledge(
    ctx: &TenantContext,
    alert_id: Uuid,
    actor: Uuid,
) -> EngineResult<InventoryAlert> {
    transition(ctx, alert_id, AlertAction::Acknowledge, actor, None).await
}

pub async fn resolve(
    ctx: &TenantContext,
    alert_id: Uuid,
    actor: Uuid,
    resolution: Option<String>,
) -> EngineResult<InventoryAlert> {
    transition(ctx, alert_id, AlertAction::Resolve, actor, resolution).await
}

async fn transition(
    ctx: &TenantContext,
    alert_id: Uuid,
    action: AlertAction,
    actor: Uuid,
    resolution: Option<String>,
) -> EngineResult<InventoryAlert> {
    let mut conn = ctx.conn().await?;
    let org_id = ctx.org_id();

    conn.transaction::<_, EngineError, _>(|conn| {
        Box::pin(async move {
            let row = inventory_alerts::table
                .filter(inventory_alerts::org_id.eq(org_id))
                .filter(inventory_alerts::id.eq(alert_id))
                .for_update()
                .first::<InventoryAlert>(conn)
                .await
                .optional()?
                .ok_or_else(|| EngineError::not_found("alert", alert_id))?;

            let current = AlertStatus::parse(&row.status).ok_or_else(|| {
                EngineError::Validation(format!("unknown alert status '{}'", row.status))
            })?;
            let next = current.next(action).ok_or_else(|| EngineError::InvalidTransition {
                from: row.status.clone(),
            })?;

            let updated = match action {
                AlertAction::Acknowledge => {
                    diesel::update(
                        inventory_alerts::table.filter(inventory_alerts::id.eq(row.id)),
                    )
                    .set((
                        inventory_alerts::status.eq(next.as_str()),
                        inventory_alerts::acknowledged_by.eq(Some(actor)),
                        inventory_alerts::acknowledged_at.eq(Some(Utc::now())),
                    ))
                    .get_result::<InventoryAlert>(conn)
                    .await?
                }
                AlertAction::Resolve => {
                    diesel::update(
                        inventory_alerts::table.filter(inventory_alerts::id.eq(row.id)),
                    )
                    .set((
                        inventory_alerts::status.eq(next.as_str()),
                        inventory_alerts::resolved_by.eq(Some(actor)),
                        inventory_alerts::resolved_at.eq(Some(Utc::now())),
                        inventory_alerts::resolution.eq(resolution),
                    ))
                    .get_result::<InventoryAlert>(conn)
                    .await?
                }
            };

            Ok(updated)
        })
    })
    .await
}

pub async fn list(
    ctx: &TenantContext,
    filter: AlertFilter,
) -> EngineResult<(Vec<InventoryAlert>, AlertSummary)> {
    let mut conn = ctx.conn().await?;
    let mut query = inventory_alerts::table
        .filter(inventory_alerts::org_id.eq(ctx.org_id()))
        .into_boxed();
    if let Some(status) = filter.status {
        query = query.filter(inventory_alerts::status.eq(status.as_str()));
    }
    if let Some(severity) = filter.severity {
        query = query.filter(inventory_alerts::severity.eq(severity.as_str()));
    }
    if let Some(alert_type) = filter.alert_type {
        query = query.filter(inventory_alerts::alert_type.eq(alert_type.as_str()));
    }

    let alerts = query
        .order(inventory_alerts::created_at.desc())
        .load::<InventoryAlert>(&mut conn)
        .await?;

    let mut summary = AlertSummary {
        total: alerts.len(),
        ..AlertSummary::default()
    };
    for alert in &alerts {
        *summary.by_severity.entry(alert.severity.clone()).or_insert(0) += 1;
        *summary.by_type.entry(alert.alert_type.clone()).or_insert(0) += 1;
    }

    Ok((alerts, summary))
}
