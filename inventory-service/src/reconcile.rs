//! Reconciliation and audit. The periodic sweep is the sole executor of
//! TTL-driven release; the audit scan is read-only and files alerts for what
//! it finds. Repair is a separate, explicitly invoked ledger operation, so a
//! bug that caused drift is never compounded by an automatic fix.

use std::collections::{BTreeMap, HashSet};
use std::time::{Duration as StdDuration, Instant};

use chrono::{Duration, Utc};
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use tokio::time;
use tracing::{error, info, warn};
use uuid::Uuid;

use shared::{
    AlertSeverity, AlertType, AuditCounts, AuditReport, BlockerClass, DeletionBlocker,
    DriftFinding, EngineResult, OrphanedReservation, PlacementType, ReservationStatus,
    StatusInconsistency, CHECKPOINT_STAGES,
};

use crate::alerts;
use crate::ledger;
use crate::models::{Campaign, EpisodeInventory, Reservation, Show};
use crate::reservations::ReservationManager;
use crate::schema::{
    campaign_schedules, campaigns, episode_inventory, episodes, reservations, shows,
};
use crate::tenant::{self, DbPool, TenantContext};

pub struct ReconciliationJob {
    pool: DbPool,
    interval_secs: u64,
}

impl ReconciliationJob {
    pub fn new(pool: DbPool, interval_secs: u64) -> Self {
        Self {
            pool,
            interval_secs,
        }
    }

    pub async fn run(&self) {
        let mut interval = time::interval(StdDuration::from_secs(self.interval_secs));

        loop {
            interval.tick().await;

            if let Err(e) = self.run_once().await {
                error!("reconciliation pass failed: {}", e);
            }
        }
    }

    async fn run_once(&self) -> EngineResult<()> {
        for org_id in tenant::organization_ids(&self.pool).await? {
            let ctx = TenantContext::for_system(&self.pool, org_id);

            match sweep_expired(&ctx).await {
                Ok(0) => {}
                Ok(expired) => info!("org {}: expired {} stale hold(s)", org_id, expired),
                Err(e) => {
                    error!("org {}: expiry sweep failed: {}", org_id, e);
                    continue;
                }
            }

            if let Err(e) = run_audit(&ctx, true).await {
                error!("org {}: audit scan failed: {}", org_id, e);
            }
        }
        Ok(())
    }
}

/// Expires lapsed holds one by one. Each expiry is its own idempotent
/// transaction, so a crash mid-sweep leaves every reservation either
/// untouched or fully expired.
pub async fn sweep_expired(ctx: &TenantContext) -> EngineResult<usize> {
    let ids = {
        let mut conn = ctx.conn().await?;
        reservations::table
            .filter(reservations::org_id.eq(ctx.org_id()))
            .filter(reservations::status.eq(ReservationStatus::Reserved.as_str()))
            .filter(reservations::expires_at.lt(Utc::now()))
            .select(reservations::id)
            .load::<Uuid>(&mut conn)
            .await?
    };

    let mgr = ReservationManager::new(ctx);
    let mut expired = 0;
    for id in ids {
        match mgr.expire(id).await {
            Ok(true) => expired += 1,
            Ok(false) => {}
            // keep sweeping; the failed row is retried on the next pass
            Err(e) => error!("failed to expire reservation {}: {}", id, e),
        }
    }
    Ok(expired)
}

/// Audit scan over one tenant partition. Findings are advisory snapshots;
/// nothing here mutates inventory. With `file_alerts` set, each finding is
/// filed (or refreshed) as an alert.
pub async fn run_audit(ctx: &TenantContext, file_alerts: bool) -> EngineResult<AuditReport> {
    let started_at = Utc::now();
    let timer = Instant::now();

    let orphaned_reservations = find_orphaned_reservations(ctx).await?;
    let inventory_mismatches = find_drift(ctx).await?;
    let blocked_deletions = find_blocked_deletions(ctx).await?;
    let status_inconsistencies = find_status_inconsistencies(ctx).await?;

    if file_alerts {
        file_findings(
            ctx,
            &orphaned_reservations,
            &inventory_mismatches,
            &blocked_deletions,
            &status_inconsistencies,
        )
        .await;
    }

    Ok(AuditReport {
        started_at,
        duration_ms: timer.elapsed().as_millis() as u64,
        counts: AuditCounts {
            orphaned_reservations: orphaned_reservations.len(),
            inventory_mismatches: inventory_mismatches.len(),
            blocked_deletions: blocked_deletions.len(),
            status_inconsistencies: status_inconsistencies.len(),
        },
        orphaned_reservations,
        inventory_mismatches,
        blocked_deletions,
        status_inconsistencies,
    })
}

async fn find_orphaned_reservations(
    ctx: &TenantContext,
) -> EngineResult<Vec<OrphanedReservation>> {
    let mut conn = ctx.conn().await?;
    let org_id = ctx.org_id();

    let live = reservations::table
        .filter(reservations::org_id.eq(org_id))
        .filter(reservations::status.eq_any([
            ReservationStatus::Reserved.as_str(),
            ReservationStatus::Confirmed.as_str(),
        ]))
        .load::<Reservation>(&mut conn)
        .await?;
    if live.is_empty() {
        return Ok(vec![]);
    }

    let show_ids: Vec<Uuid> = live.iter().map(|r| r.show_id).collect();
    let episode_ids: Vec<Uuid> = live.iter().map(|r| r.episode_id).collect();
    let campaign_ids: Vec<Uuid> = live.iter().map(|r| r.campaign_id).collect();
    let schedule_ids: Vec<Uuid> = live.iter().filter_map(|r| r.schedule_id).collect();

    let existing_shows: HashSet<Uuid> = shows::table
        .filter(shows::org_id.eq(org_id))
        .filter(shows::id.eq_any(show_ids))
        .select(shows::id)
        .load::<Uuid>(&mut conn)
        .await?
        .into_iter()
        .collect();
    let existing_episodes: HashSet<Uuid> = episodes::table
        .filter(episodes::org_id.eq(org_id))
        .filter(episodes::id.eq_any(episode_ids))
        .select(episodes::id)
        .load::<Uuid>(&mut conn)
        .await?
        .into_iter()
        .collect();
    let existing_campaigns: HashSet<Uuid> = campaigns::table
        .filter(campaigns::org_id.eq(org_id))
        .filter(campaigns::id.eq_any(campaign_ids))
        .select(campaigns::id)
        .load::<Uuid>(&mut conn)
        .await?
        .into_iter()
        .collect();
    let existing_schedules: HashSet<Uuid> = campaign_schedules::table
        .filter(campaign_schedules::org_id.eq(org_id))
        .filter(campaign_schedules::id.eq_any(schedule_ids))
        .select(campaign_schedules::id)
        .load::<Uuid>(&mut conn)
        .await?
        .into_iter()
        .collect();

    let now = Utc::now();
    let mut findings = Vec::new();
    for r in &live {
        let mut reasons = Vec::new();
        if !existing_shows.contains(&r.show_id) {
            reasons.push("show missing");
        }
        if !existing_episodes.contains(&r.episode_id) {
            reasons.push("episode missing");
        }
        if !existing_campaigns.contains(&r.campaign_id) {
            reasons.push("campaign missing");
        }
        if let Some(schedule_id) = r.schedule_id {
            if !existing_schedules.contains(&schedule_id) {
                reasons.push("schedule missing");
            }
        }
        if r.locked && r.expires_at.map_or(false, |t| t < now) {
            reasons.push("expired but still locked");
        }

        if !reasons.is_empty() {
            findings.push(OrphanedReservation {
                reservation_id: r.id,
                campaign_id: r.campaign_id,
                episode_id: r.episode_id,
                placement_type: r.placement_type.clone(),
                reason: reasons.join(", "),
            });
        }
    }
    Ok(findings)
}

async fn find_drift(ctx: &TenantContext) -> EngineResult<Vec<DriftFinding>> {
    let mut conn = ctx.conn().await?;
    let org_id = ctx.org_id();

    let rows = episode_inventory::table
        .filter(episode_inventory::org_id.eq(org_id))
        .load::<EpisodeInventory>(&mut conn)
        .await?;

    let mut findings = Vec::new();
    for row in rows {
        let Some(placement) = PlacementType::parse(&row.placement_type) else {
            warn!(
                "inventory row {} has unknown placement type '{}'",
                row.id, row.placement_type
            );
            continue;
        };
        // re-verify against ground truth before reporting
        let counts = ledger::recount_with(&mut conn, org_id, row.episode_id, placement).await?;
        if counts.reserved != i64::from(row.reserved_slots)
            || counts.booked != i64::from(row.booked_slots)
        {
            findings.push(DriftFinding {
                episode_id: row.episode_id,
                placement_type: placement,
                cached_reserved: row.reserved_slots,
                cached_booked: row.booked_slots,
                actual_reserved: counts.reserved,
                actual_booked: counts.booked,
            });
        }
    }
    Ok(findings)
}

async fn find_blocked_deletions(ctx: &TenantContext) -> EngineResult<Vec<DeletionBlocker>> {
    let mut conn = ctx.conn().await?;
    let org_id = ctx.org_id();

    let pending_deletion = shows::table
        .filter(shows::org_id.eq(org_id))
        .filter(shows::deleted_at.is_not_null())
        .load::<Show>(&mut conn)
        .await?;

    let now = Utc::now();
    let mut blockers = Vec::new();
    for show in &pending_deletion {
        let live = reservations::table
            .filter(reservations::org_id.eq(org_id))
            .filter(reservations::show_id.eq(show.id))
            .filter(reservations::status.eq_any([
                ReservationStatus::Reserved.as_str(),
                ReservationStatus::Confirmed.as_str(),
            ]))
            .load::<Reservation>(&mut conn)
            .await?;
        for r in &live {
            let status = ReservationStatus::parse(&r.status)
                .unwrap_or(ReservationStatus::Confirmed);
            blockers.push(DeletionBlocker {
                show_id: show.id,
                kind: "reservation".to_string(),
                reference_id: r.id,
                class: classify_blocker(status, r.expires_at, now),
            });
        }

        let show_episodes: Vec<(Uuid, chrono::DateTime<Utc>)> = episodes::table
            .filter(episodes::org_id.eq(org_id))
            .filter(episodes::show_id.eq(show.id))
            .select((episodes::id, episodes::air_date))
            .load(&mut conn)
            .await?;
        for (episode_id, air_date) in &show_episodes {
            if *air_date > now {
                blockers.push(DeletionBlocker {
                    show_id: show.id,
                    kind: "episode".to_string(),
                    reference_id: *episode_id,
                    class: BlockerClass::Valid,
                });
            }
        }
        let episode_ids: Vec<Uuid> = show_episodes.iter().map(|(id, _)| *id).collect();
        if episode_ids.is_empty() {
            continue;
        }
        let scheduled: Vec<Uuid> = campaign_schedules::table
            .filter(campaign_schedules::org_id.eq(org_id))
            .filter(campaign_schedules::episode_id.eq_any(episode_ids))
            .select(campaign_schedules::id)
            .load::<Uuid>(&mut conn)
            .await?;
        for schedule_id in scheduled {
            blockers.push(DeletionBlocker {
                show_id: show.id,
                kind: "schedule".to_string(),
                reference_id: schedule_id,
                class: BlockerClass::Valid,
            });
        }
    }
    Ok(blockers)
}

/// An expired hold is safe to release automatically; anything else needs a
/// human decision before the show can go.
fn classify_blocker(
    status: ReservationStatus,
    expires_at: Option<chrono::DateTime<Utc>>,
    now: chrono::DateTime<Utc>,
) -> BlockerClass {
    match status {
        ReservationStatus::Reserved if expires_at.map_or(false, |t| t <= now) => {
            BlockerClass::Stale
        }
        _ => BlockerClass::Valid,
    }
}

async fn find_status_inconsistencies(
    ctx: &TenantContext,
) -> EngineResult<Vec<StatusInconsistency>> {
    let settings = ctx.workflow_settings().await?;
    let mut conn = ctx.conn().await?;
    let now = Utc::now();
    let cutoff = now - Duration::days(i64::from(settings.stuck_stage_sla_days));

    let stuck = campaigns::table
        .filter(campaigns::org_id.eq(ctx.org_id()))
        .filter(campaigns::status.eq("pending"))
        .filter(campaigns::updated_at.lt(cutoff))
        .load::<Campaign>(&mut conn)
        .await?;

    Ok(stuck
        .into_iter()
        .filter(|c| CHECKPOINT_STAGES.contains(&c.progress))
        .map(|c| StatusInconsistency {
            campaign_id: c.id,
            stage: c.progress,
            status: c.status,
            stalled_days: (now - c.updated_at).num_days(),
        })
        .collect())
}

async fn file_findings(
    ctx: &TenantContext,
    orphaned: &[OrphanedReservation],
    mismatches: &[DriftFinding],
    blocked: &[DeletionBlocker],
    stuck: &[StatusInconsistency],
) {
    for f in orphaned {
        let filed = alerts::file_finding(
            ctx,
            AlertType::StatusInconsistency,
            AlertSeverity::Medium,
            Some(f.episode_id),
            PlacementType::parse(&f.placement_type),
            &format!("reservation:{}", f.reservation_id),
            serde_json::json!({
                "kind": "orphaned_reservation",
                "reservation_id": f.reservation_id,
                "campaign_id": f.campaign_id,
                "reason": f.reason,
            }),
        )
        .await;
        if let Err(e) = filed {
            warn!("failed to file orphan alert for {}: {}", f.reservation_id, e);
        }
    }

    for d in mismatches {
        let filed = alerts::file_finding(
            ctx,
            AlertType::Drift,
            AlertSeverity::High,
            Some(d.episode_id),
            Some(d.placement_type),
            &format!("episode:{}:{}", d.episode_id, d.placement_type),
            serde_json::json!({
                "cached_reserved": d.cached_reserved,
                "cached_booked": d.cached_booked,
                "actual_reserved": d.actual_reserved,
                "actual_booked": d.actual_booked,
            }),
        )
        .await;
        if let Err(e) = filed {
            warn!(
                "failed to file drift alert for episode {} {}: {}",
                d.episode_id, d.placement_type, e
            );
        }
    }

    let mut per_show: BTreeMap<Uuid, Vec<&DeletionBlocker>> = BTreeMap::new();
    for b in blocked {
        per_show.entry(b.show_id).or_default().push(b);
    }
    for (show_id, show_blockers) in per_show {
        let filed = alerts::file_finding(
            ctx,
            AlertType::DeletionImpact,
            AlertSeverity::Medium,
            None,
            None,
            &format!("show:{}", show_id),
            serde_json::json!({
                "show_id": show_id,
                "blockers": show_blockers,
            }),
        )
        .await;
        if let Err(e) = filed {
            warn!("failed to file deletion-impact alert for show {}: {}", show_id, e);
        }
    }

    for s in stuck {
        let filed = alerts::file_finding(
            ctx,
            AlertType::StatusInconsistency,
            AlertSeverity::Medium,
            None,
            None,
            &format!("campaign:{}", s.campaign_id),
            serde_json::json!({
                "kind": "stuck_campaign",
                "campaign_id": s.campaign_id,
                "stage": s.stage,
                "stalled_days": s.stalled_days,
            }),
        )
        .await;
        if let Err(e) = filed {
            warn!("failed to file stuck-campaign alert for {}: {}", s.campaign_id, e);
        }
    }
}
