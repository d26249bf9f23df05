//! Domain vocabulary shared between the inventory engine and its API
//! consumers: placement types, status enums, the campaign stage machine and
//! its pure transition planner, audit finding shapes, and the error taxonomy.

pub mod error;

pub use error::{EngineError, EngineResult};

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Ad slot position within an episode. Stored as text in the database; the
/// fixed enumeration is what keeps counter updates off string-built columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementType {
    PreRoll,
    MidRoll,
    PostRoll,
}

impl PlacementType {
    pub const ALL: [PlacementType; 3] = [
        PlacementType::PreRoll,
        PlacementType::MidRoll,
        PlacementType::PostRoll,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PlacementType::PreRoll => "pre_roll",
            PlacementType::MidRoll => "mid_roll",
            PlacementType::PostRoll => "post_roll",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pre_roll" => Some(PlacementType::PreRoll),
            "mid_roll" => Some(PlacementType::MidRoll),
            "post_roll" => Some(PlacementType::PostRoll),
            _ => None,
        }
    }
}

impl fmt::Display for PlacementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Reserved,
    Confirmed,
    Released,
    Expired,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Reserved => "reserved",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Released => "released",
            ReservationStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "reserved" => Some(ReservationStatus::Reserved),
            "confirmed" => Some(ReservationStatus::Confirmed),
            "released" => Some(ReservationStatus::Released),
            "expired" => Some(ReservationStatus::Expired),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    Overbooking,
    DeletionImpact,
    Drift,
    StatusInconsistency,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::Overbooking => "overbooking",
            AlertType::DeletionImpact => "deletion_impact",
            AlertType::Drift => "drift",
            AlertType::StatusInconsistency => "status_inconsistency",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "overbooking" => Some(AlertType::Overbooking),
            "deletion_impact" => Some(AlertType::DeletionImpact),
            "drift" => Some(AlertType::Drift),
            "status_inconsistency" => Some(AlertType::StatusInconsistency),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Critical,
    High,
    Medium,
    Low,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Critical => "critical",
            AlertSeverity::High => "high",
            AlertSeverity::Medium => "medium",
            AlertSeverity::Low => "low",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "critical" => Some(AlertSeverity::Critical),
            "high" => Some(AlertSeverity::High),
            "medium" => Some(AlertSeverity::Medium),
            "low" => Some(AlertSeverity::Low),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Active,
    Acknowledged,
    Resolved,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Active => "active",
            AlertStatus::Acknowledged => "acknowledged",
            AlertStatus::Resolved => "resolved",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(AlertStatus::Active),
            "acknowledged" => Some(AlertStatus::Acknowledged),
            "resolved" => Some(AlertStatus::Resolved),
            _ => None,
        }
    }

    /// One-directional lifecycle. `None` means the transition is rejected.
    pub fn next(self, action: AlertAction) -> Option<AlertStatus> {
        match (self, action) {
            (AlertStatus::Active, AlertAction::Acknowledge) => Some(AlertStatus::Acknowledged),
            (AlertStatus::Active, AlertAction::Resolve) => Some(AlertStatus::Resolved),
            (AlertStatus::Acknowledged, AlertAction::Resolve) => Some(AlertStatus::Resolved),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertAction {
    Acknowledge,
    Resolve,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Member,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Member => "member",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "admin" => Some(Role::Admin),
            "member" => Some(Role::Member),
            _ => None,
        }
    }
}

/// Per-tenant workflow knobs, supplied by the organization settings store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSettings {
    pub reservation_ttl_hours: i32,
    pub auto_reserve_enabled: bool,
    pub approval_required: bool,
    pub stuck_stage_sla_days: i32,
    pub degrade_to_alert: bool,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            reservation_ttl_hours: 72,
            auto_reserve_enabled: true,
            approval_required: true,
            stuck_stage_sla_days: 3,
            degrade_to_alert: false,
        }
    }
}

// Campaign progress checkpoints. Intermediate values are legal but only the
// checkpoints carry side effects.
pub const STAGE_BUILDABLE: i32 = 10;
pub const STAGE_SCHEDULE_READY: i32 = 35;
pub const STAGE_APPROVAL: i32 = 65;
pub const STAGE_RESERVE: i32 = 90;
pub const STAGE_ORDER: i32 = 100;

pub const CHECKPOINT_STAGES: [i32; 5] = [
    STAGE_BUILDABLE,
    STAGE_SCHEDULE_READY,
    STAGE_APPROVAL,
    STAGE_RESERVE,
    STAGE_ORDER,
];

/// A named, independently idempotent side effect of reaching a checkpoint.
/// The string form doubles as the idempotency-ledger key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageEffect {
    MarkBuildable,
    ValidateSchedule,
    BeginRateTracking,
    RequestApproval,
    CheckExclusivity,
    ReserveInventory,
    ConfirmReservations,
    CreateOrder,
    GenerateAdRequests,
    GenerateContract,
    CreateBillingSchedule,
    ReleaseReservations,
}

impl StageEffect {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageEffect::MarkBuildable => "mark_buildable",
            StageEffect::ValidateSchedule => "validate_schedule",
            StageEffect::BeginRateTracking => "begin_rate_tracking",
            StageEffect::RequestApproval => "request_approval",
            StageEffect::CheckExclusivity => "check_exclusivity",
            StageEffect::ReserveInventory => "reserve_inventory",
            StageEffect::ConfirmReservations => "confirm_reservations",
            StageEffect::CreateOrder => "create_order",
            StageEffect::GenerateAdRequests => "generate_ad_requests",
            StageEffect::GenerateContract => "generate_contract",
            StageEffect::CreateBillingSchedule => "create_billing_schedule",
            StageEffect::ReleaseReservations => "release_reservations",
        }
    }
}

pub fn checkpoint_effects(stage: i32, settings: &WorkflowSettings) -> Vec<StageEffect> {
    match stage {
        STAGE_BUILDABLE => vec![StageEffect::MarkBuildable],
        STAGE_SCHEDULE_READY => vec![
            StageEffect::ValidateSchedule,
            StageEffect::BeginRateTracking,
        ],
        STAGE_APPROVAL => vec![StageEffect::RequestApproval, StageEffect::CheckExclusivity],
        STAGE_RESERVE => {
            if settings.auto_reserve_enabled {
                vec![StageEffect::ReserveInventory]
            } else {
                vec![]
            }
        }
        STAGE_ORDER => vec![
            StageEffect::ConfirmReservations,
            StageEffect::CreateOrder,
            StageEffect::GenerateAdRequests,
            StageEffect::GenerateContract,
            StageEffect::CreateBillingSchedule,
        ],
        _ => vec![],
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedEffect {
    pub stage: i32,
    pub effect: StageEffect,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionPlan {
    pub from: i32,
    /// Effective target stage. Lower than the requested target when the
    /// transition is held at the reservation checkpoint pending approval.
    pub target: i32,
    pub regression: bool,
    pub gated: bool,
    pub effects: Vec<PlannedEffect>,
}

/// Plans the ordered side effects of moving a campaign from `current` to
/// `target`. Pure: the executor owns idempotency and persistence. A target
/// below the current stage is a cancellation or rejection and plans the
/// compensating release instead of being rejected.
pub fn plan_transition(
    current: i32,
    target: i32,
    settings: &WorkflowSettings,
    approval_granted: bool,
) -> TransitionPlan {
    if target < current {
        return TransitionPlan {
            from: current,
            target,
            regression: true,
            gated: false,
            effects: vec![PlannedEffect {
                stage: target,
                effect: StageEffect::ReleaseReservations,
            }],
        };
    }

    let mut effective = target;
    let mut gated = false;
    if settings.approval_required
        && !approval_granted
        && current < STAGE_ORDER
        && target > STAGE_RESERVE
    {
        effective = STAGE_RESERVE.max(current);
        gated = true;
    }

    let mut effects = Vec::new();
    for stage in CHECKPOINT_STAGES {
        if stage > current && stage <= effective {
            for effect in checkpoint_effects(stage, settings) {
                effects.push(PlannedEffect { stage, effect });
            }
        }
    }

    TransitionPlan {
        from: current,
        target: effective,
        regression: false,
        gated,
        effects,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrphanedReservation {
    pub reservation_id: Uuid,
    pub campaign_id: Uuid,
    pub episode_id: Uuid,
    pub placement_type: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftFinding {
    pub episode_id: Uuid,
    pub placement_type: PlacementType,
    pub cached_reserved: i32,
    pub cached_booked: i32,
    pub actual_reserved: i64,
    pub actual_booked: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockerClass {
    /// An expired hold, safe to release automatically.
    Stale,
    /// Live data that needs a human decision before the show can go.
    Valid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletionBlocker {
    pub show_id: Uuid,
    pub kind: String,
    pub reference_id: Uuid,
    pub class: BlockerClass,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusInconsistency {
    pub campaign_id: Uuid,
    pub stage: i32,
    pub status: String,
    pub stalled_days: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditCounts {
    pub orphaned_reservations: usize,
    pub inventory_mismatches: usize,
    pub blocked_deletions: usize,
    pub status_inconsistencies: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditReport {
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub counts: AuditCounts,
    pub orphaned_reservations: Vec<OrphanedReservation>,
    pub inventory_mismatches: Vec<DriftFinding>,
    pub blocked_deletions: Vec<DeletionBlocker>,
    pub status_inconsistencies: Vec<StatusInconsistency>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertSummary {
    pub total: usize,
    pub by_severity: BTreeMap<String, usize>,
    pub by_type: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationReport {
    pub campaign_id: Uuid,
    pub current_stage: i32,
    pub target_stage: i32,
    pub regression: bool,
    pub gated: bool,
    pub effects: Vec<PlannedEffect>,
    pub notifications: Vec<String>,
    pub applied: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn effects_of(plan: &TransitionPlan) -> Vec<StageEffect> {
        plan.effects.iter().map(|e| e.effect).collect()
    }

    #[test]
    fn forward_plan_walks_every_checkpoint() {
        let settings = WorkflowSettings::default();
        let plan = plan_transition(0, 100, &settings, true);
        assert!(!plan.regression);
        assert!(!plan.gated);
        assert_eq!(plan.target, 100);
        let effects = effects_of(&plan);
        assert_eq!(effects[0], StageEffect::MarkBuildable);
        assert!(effects.contains(&StageEffect::ReserveInventory));
        assert!(effects.contains(&StageEffect::CreateBillingSchedule));
        // reservation hold must come before confirmation
        let reserve = effects
            .iter()
            .position(|e| *e == StageEffect::ReserveInventory)
            .unwrap();
        let confirm = effects
            .iter()
            .position(|e| *e == StageEffect::ConfirmReservations)
            .unwrap();
        assert!(reserve < confirm);
    }

    #[test]
    fn plan_halts_at_reserve_checkpoint_without_approval() {
        let settings = WorkflowSettings::default();
        let plan = plan_transition(0, 100, &settings, false);
        assert!(plan.gated);
        assert_eq!(plan.target, STAGE_RESERVE);
        let effects = effects_of(&plan);
        assert!(effects.contains(&StageEffect::ReserveInventory));
        assert!(!effects.contains(&StageEffect::ConfirmReservations));
        assert!(!effects.contains(&StageEffect::CreateOrder));
    }

    #[test]
    fn gate_is_open_once_approved() {
        let settings = WorkflowSettings::default();
        let plan = plan_transition(STAGE_RESERVE, 100, &settings, true);
        assert!(!plan.gated);
        assert_eq!(plan.target, 100);
        assert!(effects_of(&plan).contains(&StageEffect::CreateOrder));
    }

    #[test]
    fn gate_is_skipped_when_not_required() {
        let settings = WorkflowSettings {
            approval_required: false,
            ..WorkflowSettings::default()
        };
        let plan = plan_transition(0, 100, &settings, false);
        assert!(!plan.gated);
        assert_eq!(plan.target, 100);
    }

    #[test]
    fn regression_plans_a_release() {
        let settings = WorkflowSettings::default();
        let plan = plan_transition(STAGE_RESERVE, 0, &settings, false);
        assert!(plan.regression);
        assert_eq!(plan.target, 0);
        assert_eq!(effects_of(&plan), vec![StageEffect::ReleaseReservations]);
    }

    #[test]
    fn auto_reserve_disabled_plans_no_hold() {
        let settings = WorkflowSettings {
            auto_reserve_enabled: false,
            ..WorkflowSettings::default()
        };
        let plan = plan_transition(STAGE_APPROVAL, STAGE_RESERVE, &settings, true);
        assert!(plan.effects.is_empty());
        assert_eq!(plan.target, STAGE_RESERVE);
    }

    #[test]
    fn only_newly_crossed_checkpoints_fire() {
        let settings = WorkflowSettings::default();
        let plan = plan_transition(STAGE_SCHEDULE_READY, STAGE_APPROVAL, &settings, false);
        assert_eq!(
            effects_of(&plan),
            vec![StageEffect::RequestApproval, StageEffect::CheckExclusivity]
        );
    }

    #[test]
    fn same_stage_is_a_noop() {
        let settings = WorkflowSettings::default();
        let plan = plan_transition(STAGE_APPROVAL, STAGE_APPROVAL, &settings, false);
        assert!(plan.effects.is_empty());
        assert!(!plan.regression);
    }

    #[test]
    fn intermediate_stage_between_checkpoints_fires_nothing() {
        let settings = WorkflowSettings::default();
        let plan = plan_transition(40, 60, &settings, false);
        assert!(plan.effects.is_empty());
        assert_eq!(plan.target, 60);
    }

    #[test]
    fn alert_lifecycle_is_one_directional() {
        assert_eq!(
            AlertStatus::Active.next(AlertAction::Acknowledge),
            Some(AlertStatus::Acknowledged)
        );
        assert_eq!(
            AlertStatus::Acknowledged.next(AlertAction::Resolve),
            Some(AlertStatus::Resolved)
        );
        assert_eq!(
            AlertStatus::Active.next(AlertAction::Resolve),
            Some(AlertStatus::Resolved)
        );
        assert_eq!(AlertStatus::Resolved.next(AlertAction::Resolve), None);
        assert_eq!(AlertStatus::Resolved.next(AlertAction::Acknowledge), None);
        assert_eq!(AlertStatus::Acknowledged.next(AlertAction::Acknowledge), None);
    }

    #[test]
    fn placement_type_rejects_unknown_text() {
        assert_eq!(PlacementType::parse("mid_roll"), Some(PlacementType::MidRoll));
        assert_eq!(PlacementType::parse("midroll"), None);
        assert_eq!(PlacementType::parse(""), None);
    }
}
