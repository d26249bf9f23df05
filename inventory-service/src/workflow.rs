//! Stage trigger: maps campaign progress checkpoints to named side effects.
//! Each effect is keyed in the `workflow_effects` ledger before it runs, so
//! a re-invoked transition (retry, duplicate webhook, manual re-simulation)
//! never reserves capacity twice or creates duplicate downstream records.

use bigdecimal::BigDecimal;
use chrono::{Duration, Utc};
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use shared::{
    plan_transition, AlertSeverity, AlertType, EngineError, EngineResult, PlacementType,
    PlannedEffect, SimulationReport, StageEffect, TransitionPlan, WorkflowSettings,
    STAGE_BUILDABLE, STAGE_ORDER,
};

use crate::alerts;
use crate::models::{Campaign, CampaignSchedule, NewOrder, NewWorkflowEffect};
use crate::notify;
use crate::reservations::ReservationManager;
use crate::schema::{campaign_schedules, campaigns, orders, workflow_effects};
use crate::tenant::TenantContext;

pub struct StageTrigger<'a> {
    ctx: &'a TenantContext,
    lock_retries: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransitionOutcome {
    pub from: i32,
    pub to: i32,
    pub applied: Vec<PlannedEffect>,
    pub skipped: Vec<PlannedEffect>,
}

impl<'a> StageTrigger<'a> {
    pub fn new(ctx: &'a TenantContext) -> Self {
        Self {
            ctx,
            lock_retries: 3,
        }
    }

    pub fn with_lock_retries(mut self, lock_retries: u32) -> Self {
        self.lock_retries = lock_retries;
        self
    }

    /// Moves a campaign to `target`, running the side effects of every
    /// checkpoint crossed on the way. A target below the current stage is a
    /// cancellation and releases the campaign's active holds instead.
    pub async fn advance(&self, campaign_id: Uuid, target: i32) -> EngineResult<TransitionOutcome> {
        validate_stage(target)?;
        let settings = self.ctx.workflow_settings().await?;
        let campaign = self.load_campaign(campaign_id).await?;
        let plan = plan_transition(
            campaign.progress,
            target,
            &settings,
            approval_granted(&campaign),
        );

        if plan.regression {
            let mgr = ReservationManager::new(self.ctx).with_lock_retries(self.lock_retries);
            let released = mgr
                .release_all_for_campaign(campaign_id, "campaign stage regression")
                .await?;
            info!(
                "campaign {} regressed {} -> {}; released {} reservation(s)",
                campaign_id, plan.from, plan.target, released
            );
            self.update_progress(campaign_id, plan.target, Some("cancelled"))
                .await?;
            return Ok(TransitionOutcome {
                from: plan.from,
                to: plan.target,
                applied: plan.effects,
                skipped: vec![],
            });
        }

        if plan.effects.is_empty() && plan.target == campaign.progress {
            return Ok(TransitionOutcome {
                from: campaign.progress,
                to: campaign.progress,
                applied: vec![],
                skipped: vec![],
            });
        }

        let mut applied = Vec::new();
        let mut skipped = Vec::new();
        for planned in &plan.effects {
            if !self.record_effect(campaign_id, planned).await? {
                debug!(
                    "effect {} at stage {} already applied for campaign {}",
                    planned.effect.as_str(),
                    planned.stage,
                    campaign_id
                );
                skipped.push(planned.clone());
                continue;
            }
            if let Err(err) = self.apply_effect(&campaign, planned, &settings).await {
                // drop the key so a retry re-runs the failed effect
                if let Err(cleanup_err) = self.unrecord_effect(campaign_id, planned).await {
                    error!(
                        "failed to unrecord effect {} for campaign {}: {}",
                        planned.effect.as_str(),
                        campaign_id,
                        cleanup_err
                    );
                }
                return Err(err);
            }
            applied.push(planned.clone());
        }

        let status = if plan.gated {
            Some("pending")
        } else if plan.target >= STAGE_ORDER {
            Some("completed")
        } else if campaign.status == "pending" || campaign.status == "approved" {
            None
        } else if plan.target >= STAGE_BUILDABLE {
            Some("building")
        } else {
            None
        };
        self.update_progress(campaign_id, plan.target, status).await?;

        if plan.gated {
            info!(
                "campaign {} held at stage {} pending admin approval",
                campaign_id, plan.target
            );
        }

        Ok(TransitionOutcome {
            from: plan.from,
            to: plan.target,
            applied,
            skipped,
        })
    }

    /// Returns the plan and the notifications a transition would fire.
    /// With `dry_run` set nothing is written; otherwise the transition is
    /// executed after planning.
    pub async fn simulate(
        &self,
        campaign_id: Uuid,
        target: i32,
        dry_run: bool,
    ) -> EngineResult<SimulationReport> {
        validate_stage(target)?;
        let settings = self.ctx.workflow_settings().await?;
        let campaign = self.load_campaign(campaign_id).await?;
        let plan = plan_transition(
            campaign.progress,
            target,
            &settings,
            approval_granted(&campaign),
        );
        let notifications = preview_notifications(&campaign, &plan);

        let mut report = SimulationReport {
            campaign_id,
            current_stage: campaign.progress,
            target_stage: plan.target,
            regression: plan.regression,
            gated: plan.gated,
            effects: plan.effects,
            notifications,
            applied: false,
        };

        if !dry_run {
            self.advance(campaign_id, target).await?;
            report.applied = true;
        }

        Ok(report)
    }

    async fn apply_effect(
        &self,
        campaign: &Campaign,
        planned: &PlannedEffect,
        settings: &WorkflowSettings,
    ) -> EngineResult<()> {
        match planned.effect {
            StageEffect::MarkBuildable => self.mark_buildable(campaign.id).await,
            StageEffect::ValidateSchedule => self.validate_schedule(campaign.id).await,
            StageEffect::BeginRateTracking => {
                info!("rate delta tracking active for campaign {}", campaign.id);
                Ok(())
            }
            StageEffect::RequestApproval => {
                notify::enqueue_for_admins(
                    self.ctx,
                    &format!("Approval requested: {}", campaign.name),
                    &format!(
                        "Campaign '{}' ({}) reached stage {} and awaits talent/producer approval.",
                        campaign.name, campaign.id, planned.stage
                    ),
                )
                .await?;
                Ok(())
            }
            StageEffect::CheckExclusivity => self.check_exclusivity(campaign).await,
            StageEffect::ReserveInventory => self.reserve_inventory(campaign, settings).await,
            StageEffect::ConfirmReservations => {
                let mgr = ReservationManager::new(self.ctx).with_lock_retries(self.lock_retries);
                let confirmed = mgr.confirm_all_for_campaign(campaign.id).await?;
                info!(
                    "confirmed {} reservation(s) for campaign {}",
                    confirmed, campaign.id
                );
                Ok(())
            }
            StageEffect::CreateOrder => self.create_order(campaign).await,
            StageEffect::GenerateAdRequests => {
                notify::enqueue_for_admins(
                    self.ctx,
                    &format!("Ad requests ready: {}", campaign.name),
                    &format!("Ad requests generated for campaign '{}'.", campaign.name),
                )
                .await?;
                Ok(())
            }
            StageEffect::GenerateContract => {
                notify::enqueue_for_admins(
                    self.ctx,
                    &format!("Contract ready: {}", campaign.name),
                    &format!("Contract generated for campaign '{}'.", campaign.name),
                )
                .await?;
                Ok(())
            }
            StageEffect::CreateBillingSchedule => {
                notify::enqueue_for_admins(
                    self.ctx,
                    &format!("Billing schedule ready: {}", campaign.name),
                    &format!("Billing schedule created for campaign '{}'.", campaign.name),
                )
                .await?;
                Ok(())
            }
            StageEffect::ReleaseReservations => {
                let mgr = ReservationManager::new(self.ctx).with_lock_retries(self.lock_retries);
                mgr.release_all_for_campaign(campaign.id, "campaign stage regression")
                    .await?;
                Ok(())
            }
        }
    }

    async fn mark_buildable(&self, campaign_id: Uuid) -> EngineResult<()> {
        let mut conn = self.ctx.conn().await?;
        diesel::update(
            campaigns::table
                .filter(campaigns::org_id.eq(self.ctx.org_id()))
                .filter(campaigns::id.eq(campaign_id)),
        )
        .set((
            campaigns::buildable.eq(true),
            campaigns::updated_at.eq(Utc::now()),
        ))
        .execute(&mut conn)
        .await?;
        Ok(())
    }

    async fn validate_schedule(&self, campaign_id: Uuid) -> EngineResult<()> {
        let schedules = self.schedules(campaign_id).await?;
        if schedules.is_empty() {
            return Err(EngineError::Validation(
                "campaign has no schedule entries".into(),
            ));
        }
        for schedule in &schedules {
            if schedule.quantity <= 0 {
                return Err(EngineError::Validation(format!(
                    "schedule {} has non-positive quantity",
                    schedule.id
                )));
            }
            if PlacementType::parse(&schedule.placement_type).is_none() {
                return Err(EngineError::Validation(format!(
                    "schedule {} has unknown placement type '{}'",
                    schedule.id, schedule.placement_type
                )));
            }
        }
        info!(
            "validated {} schedule entr(ies) for campaign {}",
            schedules.len(),
            campaign_id
        );
        Ok(())
    }

    async fn check_exclusivity(&self, campaign: &Campaign) -> EngineResult<()> {
        let schedules = self.schedules(campaign.id).await?;
        let episode_ids: Vec<Uuid> = schedules.iter().map(|s| s.episode_id).collect();
        if episode_ids.is_empty() {
            return Ok(());
        }

        let mut conn = self.ctx.conn().await?;
        let rival_ids: Vec<Uuid> = campaigns::table
            .filter(campaigns::org_id.eq(self.ctx.org_id()))
            .filter(campaigns::advertiser.eq(&campaign.advertiser))
            .filter(campaigns::id.ne(campaign.id))
            .select(campaigns::id)
            .load(&mut conn)
            .await?;
        if rival_ids.is_empty() {
            return Ok(());
        }

        let overlapping: i64 = campaign_schedules::table
            .filter(campaign_schedules::org_id.eq(self.ctx.org_id()))
            .filter(campaign_schedules::campaign_id.eq_any(rival_ids))
            .filter(campaign_schedules::episode_id.eq_any(episode_ids))
            .count()
            .get_result(&mut conn)
            .await?;
        if overlapping > 0 {
            warn!(
                "exclusivity check: {} overlapping placement(s) from other '{}' campaigns",
                overlapping, campaign.advertiser
            );
        }
        Ok(())
    }

    /// Holds capacity for every scheduled slot. The manager skips slots this
    /// campaign already actively holds, so repeat invocations never
    /// double-reserve. Capacity conflicts fail the transition unless the
    /// tenant opted to degrade them to alerts.
    async fn reserve_inventory(
        &self,
        campaign: &Campaign,
        settings: &WorkflowSettings,
    ) -> EngineResult<()> {
        let schedules = self.schedules(campaign.id).await?;
        if schedules.is_empty() {
            return Err(EngineError::Validation(
                "campaign has no schedule entries to reserve".into(),
            ));
        }

        let mgr = ReservationManager::new(self.ctx).with_lock_retries(self.lock_retries);
        let ttl = Duration::hours(i64::from(settings.reservation_ttl_hours));
        for schedule in &schedules {
            let placement = PlacementType::parse(&schedule.placement_type).ok_or_else(|| {
                EngineError::Validation(format!(
                    "unknown placement type '{}' on schedule {}",
                    schedule.placement_type, schedule.id
                ))
            })?;

            match mgr
                .hold(
                    campaign.id,
                    schedule.episode_id,
                    placement,
                    Some(schedule.id),
                    schedule.quantity,
                    ttl,
                )
                .await
            {
                Ok(_) => {}
                Err(EngineError::Conflict { remaining }) if settings.degrade_to_alert => {
                    warn!(
                        "capacity conflict on episode {} {} for campaign {}; degrading to alert",
                        schedule.episode_id, placement, campaign.id
                    );
                    alerts::file_finding(
                        self.ctx,
                        AlertType::Overbooking,
                        AlertSeverity::High,
                        Some(schedule.episode_id),
                        Some(placement),
                        &format!("episode:{}:{}", schedule.episode_id, placement),
                        serde_json::json!({
                            "campaign_id": campaign.id,
                            "schedule_id": schedule.id,
                            "requested": schedule.quantity,
                            "remaining": remaining,
                        }),
                    )
                    .await?;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    async fn create_order(&self, campaign: &Campaign) -> EngineResult<()> {
        let schedules = self.schedules(campaign.id).await?;
        let total = schedules.iter().fold(BigDecimal::from(0), |acc, s| {
            acc + s.rate.clone() * BigDecimal::from(s.quantity)
        });

        let mut conn = self.ctx.conn().await?;
        let inserted = diesel::insert_into(orders::table)
            .values(&NewOrder {
                id: Uuid::new_v4(),
                org_id: self.ctx.org_id(),
                campaign_id: campaign.id,
                total_amount: total,
                status: "created".to_string(),
            })
            .on_conflict_do_nothing()
            .execute(&mut conn)
            .await?;
        if inserted > 0 {
            info!("order created for campaign {}", campaign.id);
        }
        Ok(())
    }

    async fn record_effect(&self, campaign_id: Uuid, planned: &PlannedEffect) -> EngineResult<bool> {
        let mut conn = self.ctx.conn().await?;
        let inserted = diesel::insert_into(workflow_effects::table)
            .values(&NewWorkflowEffect {
                campaign_id,
                stage: planned.stage,
                effect: planned.effect.as_str().to_string(),
                org_id: self.ctx.org_id(),
            })
            .on_conflict_do_nothing()
            .execute(&mut conn)
            .await?;
        Ok(inserted > 0)
    }

    async fn unrecord_effect(&self, campaign_id: Uuid, planned: &PlannedEffect) -> EngineResult<()> {
        let mut conn = self.ctx.conn().await?;
        diesel::delete(
            workflow_effects::table
                .filter(workflow_effects::campaign_id.eq(campaign_id))
                .filter(workflow_effects::stage.eq(planned.stage))
                .filter(workflow_effects::effect.eq(planned.effect.as_str())),
        )
        .execute(&mut conn)
        .await?;
        Ok(())
    }

    async fn update_progress(
        &self,
        campaign_id: Uuid,
        progress: i32,
        status: Option<&str>,
    ) -> EngineResult<()> {
        let mut conn = self.ctx.conn().await?;
        let target = campaigns::table
            .filter(campaigns::org_id.eq(self.ctx.org_id()))
            .filter(campaigns::id.eq(campaign_id));
        match status {
            Some(status) => {
                diesel::update(target)
                    .set((
                        campaigns::progress.eq(progress),
                        campaigns::status.eq(status),
                        campaigns::updated_at.eq(Utc::now()),
                    ))
                    .execute(&mut conn)
                    .await?;
            }
            None => {
                diesel::update(target)
                    .set((
                        campaigns::progress.eq(progress),
                        campaigns::updated_at.eq(Utc::now()),
                    ))
                    .execute(&mut conn)
                    .await?;
            }
        }
        Ok(())
    }

    async fn schedules(&self, campaign_id: Uuid) -> EngineResult<Vec<CampaignSchedule>> {
        let mut conn = self.ctx.conn().await?;
        let rows = campaign_schedules::table
            .filter(campaign_schedules::org_id.eq(self.ctx.org_id()))
            .filter(campaign_schedules::campaign_id.eq(campaign_id))
            .order(campaign_schedules::created_at.asc())
            .load::<CampaignSchedule>(&mut conn)
            .await?;
        Ok(rows)
    }

    async fn load_campaign(&self, campaign_id: Uuid) -> EngineResult<Campaign> {
        let mut conn = self.ctx.conn().await?;
        campaigns::table
            .filter(campaigns::org_id.eq(self.ctx.org_id()))
            .filter(campaigns::id.eq(campaign_id))
            .first::<Campaign>(&mut conn)
            .await
            .optional()?
            .ok_or_else(|| EngineError::not_found("campaign", campaign_id))
    }
}

fn validate_stage(target: i32) -> EngineResult<()> {
    if (0..=100).contains(&target) {
        Ok(())
    } else {
        Err(EngineError::Validation(format!(
            "target stage {} out of range 0..=100",
            target
        )))
    }
}

fn approval_granted(campaign: &Campaign) -> bool {
    matches!(campaign.status.as_str(), "approved" | "completed")
}

/// Human-readable preview of the notifications a plan would fire, for the
/// simulation endpoint. Delivery itself goes through the outbox.
fn preview_notifications(campaign: &Campaign, plan: &TransitionPlan) -> Vec<String> {
    let mut notes = Vec::new();
    for planned in &plan.effects {
        match planned.effect {
            StageEffect::RequestApproval => notes.push(format!(
                "tenant admins: approval requested for campaign '{}'",
                campaign.name
            )),
            StageEffect::GenerateAdRequests => notes.push(format!(
                "tenant admins: ad requests generated for campaign '{}'",
                campaign.name
            )),
            StageEffect::GenerateContract => notes.push(format!(
                "tenant admins: contract generated for campaign '{}'",
                campaign.name
            )),
            StageEffect::CreateBillingSchedule => notes.push(format!(
                "tenant admins: billing schedule created for campaign '{}'",
                campaign.name
            )),
            _ => {}
        }
    }
    notes
}
